//! Prefix tree walking and path arithmetic shared by the auditor and fixer.

use std::collections::HashMap;
use std::fs;
use std::path::{Component, Path, PathBuf};

use walkdir::WalkDir;

/// Every regular file (or symlink to one) under `root` accepted by `predicate`,
/// in sorted walk order. Unreadable entries are skipped.
pub fn collect_files<F>(root: &Path, predicate: F) -> Vec<PathBuf>
where
    F: Fn(&Path) -> bool,
{
    WalkDir::new(root)
        .follow_links(false)
        .sort_by_file_name()
        .into_iter()
        .filter_map(Result::ok)
        .filter(|ent| {
            let ty = ent.file_type();
            ty.is_file() || (ty.is_symlink() && ent.path().is_file())
        })
        .map(|ent| ent.into_path())
        .filter(|path| predicate(path))
        .collect()
}

/// Drop symlinks whose target is also in `files`.
///
/// Files are grouped by canonical path. Each group keeps its real file if
/// one is present, otherwise its first member. Paths that cannot be
/// canonicalized are kept. Order of survivors is preserved.
pub fn collapse_symlinks(files: Vec<PathBuf>) -> Vec<PathBuf> {
    let mut keep_for: HashMap<PathBuf, usize> = HashMap::new();
    let mut keys: Vec<Option<PathBuf>> = Vec::with_capacity(files.len());

    for (index, file) in files.iter().enumerate() {
        let Ok(canonical) = fs::canonicalize(file) else {
            keys.push(None);
            continue;
        };
        let is_link = fs::symlink_metadata(file)
            .map(|m| m.file_type().is_symlink())
            .unwrap_or(false);
        match keep_for.get(&canonical) {
            None => {
                keep_for.insert(canonical.clone(), index);
            }
            Some(&current) => {
                let current_is_link = fs::symlink_metadata(&files[current])
                    .map(|m| m.file_type().is_symlink())
                    .unwrap_or(false);
                if current_is_link && !is_link {
                    keep_for.insert(canonical.clone(), index);
                }
            }
        }
        keys.push(Some(canonical));
    }

    files
        .into_iter()
        .zip(keys)
        .enumerate()
        .filter_map(|(index, (file, key))| match key {
            None => Some(file),
            Some(key) => (keep_for.get(&key) == Some(&index)).then_some(file),
        })
        .collect()
}

/// Lexically resolve `.` and `..` components.
pub fn normalize(path: &Path) -> PathBuf {
    let mut out = PathBuf::new();
    for component in path.components() {
        match component {
            Component::CurDir => {}
            Component::ParentDir => {
                if !out.pop() {
                    out.push("..");
                }
            }
            other => out.push(other.as_os_str()),
        }
    }
    out
}

/// Path from directory `from` to `to`, both absolute. Empty when equal.
pub fn relative_path(from: &Path, to: &Path) -> PathBuf {
    let from = normalize(from);
    let to = normalize(to);
    let from_parts: Vec<_> = from.components().collect();
    let to_parts: Vec<_> = to.components().collect();
    let common = from_parts
        .iter()
        .zip(&to_parts)
        .take_while(|(a, b)| a == b)
        .count();

    let mut rel = PathBuf::new();
    for _ in common..from_parts.len() {
        rel.push("..");
    }
    for part in &to_parts[common..] {
        rel.push(part.as_os_str());
    }
    rel
}

/// Strip directories and the extension chain (`.so.1.2`, `.dylib`, `.dll`,
/// `.exe`) and, on Windows-style names, the trailing `-1` ABI suffix.
pub fn normalize_name(name: &str) -> String {
    let base = name.rsplit(['/', '\\']).next().unwrap_or(name);
    let stem = match base.rfind(".so") {
        Some(idx) if base[idx + 3..].is_empty() || base[idx + 3..].starts_with('.') => &base[..idx],
        _ => base
            .strip_suffix(".dylib")
            .or_else(|| base.strip_suffix(".dll"))
            .or_else(|| base.strip_suffix(".exe"))
            .unwrap_or(base),
    };
    // libfoo.1.2.dylib
    let stem = stem
        .split_once('.')
        .filter(|(_, rest)| rest.chars().all(|c| c.is_ascii_digit() || c == '.'))
        .map(|(head, _)| head)
        .unwrap_or(stem);
    // libfoo-1.dll
    let stem = stem
        .rsplit_once('-')
        .filter(|(_, rest)| !rest.is_empty() && rest.chars().all(|c| c.is_ascii_digit()))
        .map(|(head, _)| head)
        .unwrap_or(stem);
    stem.to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::os::unix::fs::symlink;
    use tempfile::TempDir;

    #[test]
    fn collapse_keeps_real_file() {
        let tmp = TempDir::new().unwrap();
        let lib = tmp.path().join("lib");
        fs::create_dir_all(&lib).unwrap();
        fs::write(lib.join("libfoo.so.1.2.3"), b"x").unwrap();
        symlink("libfoo.so.1.2.3", lib.join("libfoo.so.1")).unwrap();
        symlink("libfoo.so.1", lib.join("libfoo.so")).unwrap();
        fs::write(lib.join("libbar.so"), b"y").unwrap();
        symlink("/nonexistent/libgone.so", lib.join("libgone.so")).unwrap();

        let mut files = collect_files(tmp.path(), |_| true);
        // Dangling links are not files; add one by hand to check it survives.
        files.push(lib.join("libgone.so"));
        let collapsed = collapse_symlinks(files);

        assert_eq!(
            collapsed,
            vec![
                lib.join("libbar.so"),
                lib.join("libfoo.so.1.2.3"),
                lib.join("libgone.so"),
            ]
        );
        assert_eq!(collapse_symlinks(collapsed.clone()), collapsed);
    }

    #[test]
    fn collapse_link_only_group_keeps_first() {
        let tmp = TempDir::new().unwrap();
        let real = tmp.path().join("real");
        fs::write(&real, b"x").unwrap();
        let a = tmp.path().join("a");
        let b = tmp.path().join("b");
        symlink(&real, &a).unwrap();
        symlink(&real, &b).unwrap();
        assert_eq!(collapse_symlinks(vec![a.clone(), b]), vec![a]);
    }

    #[test]
    fn relative_paths() {
        assert_eq!(
            relative_path(Path::new("/p/bin"), Path::new("/p/lib")),
            PathBuf::from("../lib")
        );
        assert_eq!(
            relative_path(Path::new("/p/lib"), Path::new("/p/lib")),
            PathBuf::new()
        );
        assert_eq!(
            relative_path(Path::new("/p/lib/a"), Path::new("/p/lib/./b/../c")),
            PathBuf::from("../c")
        );
    }

    #[test]
    fn normalizes_library_names() {
        assert_eq!(normalize_name("lib/libfoo.so.1.2.3"), "libfoo");
        assert_eq!(normalize_name("libfoo.so"), "libfoo");
        assert_eq!(normalize_name("libfoo.1.2.dylib"), "libfoo");
        assert_eq!(normalize_name("bin\\libfoo-2.dll"), "libfoo");
        assert_eq!(normalize_name("bin/fooifier.exe"), "fooifier");
        assert_eq!(normalize_name("libsolver.a"), "libsolver.a");
        assert_eq!(normalize_name("fooifier"), "fooifier");
    }
}
