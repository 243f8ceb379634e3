//! Per-platform build directories and source materialization.
//!
//! Layout under `<builds_dir>/<name>/<triplet>/`:
//!
//! ```text
//! workspace/          mounted at /workspace inside the sandbox
//!     srcdir/         sources
//!     destdir/        the prefix
//!     build.sh        the build script
//! build.log
//! build-manifest.json
//! ```

use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{bail, Context, Result};
use serde::{Deserialize, Serialize};

use crate::image::sha256_file;
use crate::image::store::extract_tarball;
use crate::platform::Platform;

/// One source tree to place under `srcdir`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct SourceSpec {
    /// A directory, or a `.tar` / `.tar.zst` archive.
    pub path: PathBuf,
    /// Expected sha256 of an archive.
    #[serde(default)]
    pub sha256: Option<String>,
    /// Subdirectory of `srcdir` to place it in; `srcdir` itself by default.
    #[serde(default)]
    pub dest: Option<PathBuf>,
}

/// Directories of one platform's build.
#[derive(Debug, Clone)]
pub struct PlatformDirs {
    pub root: PathBuf,
    pub workspace: PathBuf,
    pub srcdir: PathBuf,
    pub destdir: PathBuf,
}

impl PlatformDirs {
    pub fn new(builds_dir: &Path, name: &str, platform: &Platform) -> Self {
        let root = builds_dir.join(name).join(platform.to_string());
        let workspace = root.join("workspace");
        Self {
            srcdir: workspace.join("srcdir"),
            destdir: workspace.join("destdir"),
            workspace,
            root,
        }
    }

    pub fn log_path(&self) -> PathBuf {
        self.root.join("build.log")
    }

    pub fn manifest_path(&self) -> PathBuf {
        self.root.join("build-manifest.json")
    }

    /// Start from an empty workspace; earlier results for this platform are discarded.
    pub fn prepare(&self) -> Result<()> {
        if self.workspace.exists() {
            fs::remove_dir_all(&self.workspace)
                .with_context(|| format!("removing old workspace {}", self.workspace.display()))?;
        }
        for dir in [&self.srcdir, &self.destdir] {
            fs::create_dir_all(dir).with_context(|| format!("creating {}", dir.display()))?;
        }
        Ok(())
    }
}

/// Copy or unpack `source` into `srcdir`. Relative paths resolve against `base`.
pub fn materialize_source(source: &SourceSpec, base: &Path, srcdir: &Path) -> Result<PathBuf> {
    let path = if source.path.is_absolute() {
        source.path.clone()
    } else {
        base.join(&source.path)
    };
    let dest = match &source.dest {
        Some(dest) if dest.is_absolute() || dest.components().any(|c| c.as_os_str() == "..") => {
            bail!("source destination {} must stay inside srcdir", dest.display())
        }
        Some(dest) => srcdir.join(dest),
        None => srcdir.to_path_buf(),
    };
    fs::create_dir_all(&dest).with_context(|| format!("creating {}", dest.display()))?;

    if path.is_dir() {
        if source.sha256.is_some() {
            bail!("{}: sha256 can only be checked for archives", path.display());
        }
        copy_dir_recursive(&path, &dest)?;
    } else if path.is_file() {
        if let Some(expected) = &source.sha256 {
            let actual = sha256_file(&path)
                .with_context(|| format!("hashing {}", path.display()))?;
            if !actual.eq_ignore_ascii_case(expected) {
                bail!(
                    "{}: sha256 mismatch (expected {expected}, got {actual})",
                    path.display()
                );
            }
        }
        extract_tarball(&path, &dest).with_context(|| format!("unpacking {}", path.display()))?;
    } else {
        bail!("source {} does not exist", path.display());
    }
    Ok(dest)
}

/// Recursively copy a directory, preserving symlinks.
pub fn copy_dir_recursive(src: &Path, dst: &Path) -> Result<()> {
    if !dst.exists() {
        fs::create_dir_all(dst)
            .with_context(|| format!("Failed to create directory: {}", dst.display()))?;
    }

    for entry in fs::read_dir(src)
        .with_context(|| format!("Failed to read directory: {}", src.display()))?
    {
        let entry = entry?;
        let src_path = entry.path();
        let dst_path = dst.join(entry.file_name());
        let file_type = entry.file_type()?;

        if file_type.is_symlink() {
            let target = fs::read_link(&src_path)?;
            if dst_path.exists() || dst_path.is_symlink() {
                fs::remove_file(&dst_path)?;
            }
            std::os::unix::fs::symlink(&target, &dst_path)
                .with_context(|| format!("Failed to create symlink: {}", dst_path.display()))?;
        } else if file_type.is_dir() {
            copy_dir_recursive(&src_path, &dst_path)?;
        } else {
            fs::copy(&src_path, &dst_path)
                .with_context(|| format!("Failed to copy file: {}", src_path.display()))?;
        }
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn tarball(dir: &Path, name: &str, files: &[(&str, &str)]) -> PathBuf {
        let mut builder = tar::Builder::new(Vec::new());
        for (path, contents) in files {
            let mut header = tar::Header::new_gnu();
            header.set_size(contents.len() as u64);
            header.set_mode(0o644);
            header.set_cksum();
            builder
                .append_data(&mut header, path, contents.as_bytes())
                .unwrap();
        }
        let out = dir.join(name);
        fs::write(&out, builder.into_inner().unwrap()).unwrap();
        out
    }

    #[test]
    fn layout_and_prepare() {
        let tmp = TempDir::new().unwrap();
        let platform: Platform = "aarch64-linux-gnu".parse().unwrap();
        let dirs = PlatformDirs::new(tmp.path(), "zlib", &platform);
        assert_eq!(dirs.workspace, tmp.path().join("zlib/aarch64-linux-gnu/workspace"));

        dirs.prepare().unwrap();
        fs::write(dirs.destdir.join("stale"), "").unwrap();
        dirs.prepare().unwrap();
        assert!(dirs.srcdir.is_dir());
        assert!(!dirs.destdir.join("stale").exists());
    }

    #[test]
    fn directory_sources_keep_symlinks() {
        let tmp = TempDir::new().unwrap();
        let src = tmp.path().join("zlib");
        fs::create_dir_all(src.join("contrib")).unwrap();
        fs::write(src.join("zlib.h"), "#define ZLIB").unwrap();
        std::os::unix::fs::symlink("zlib.h", src.join("alias.h")).unwrap();

        let srcdir = tmp.path().join("srcdir");
        let spec = SourceSpec {
            path: "zlib".into(),
            sha256: None,
            dest: Some("zlib".into()),
        };
        let dest = materialize_source(&spec, tmp.path(), &srcdir).unwrap();
        assert_eq!(dest, srcdir.join("zlib"));
        assert!(dest.join("contrib").is_dir());
        assert!(dest.join("alias.h").is_symlink());
    }

    #[test]
    fn archive_sources_are_verified() {
        let tmp = TempDir::new().unwrap();
        let archive = tarball(tmp.path(), "src.tar", &[("configure", "#!/bin/sh\n")]);
        let sha = sha256_file(&archive).unwrap();
        let srcdir = tmp.path().join("srcdir");

        let good = SourceSpec {
            path: archive.clone(),
            sha256: Some(sha.to_uppercase()),
            dest: None,
        };
        materialize_source(&good, tmp.path(), &srcdir).unwrap();
        assert!(srcdir.join("configure").is_file());

        let bad = SourceSpec {
            sha256: Some("00".repeat(32)),
            ..good
        };
        let err = materialize_source(&bad, tmp.path(), &srcdir).unwrap_err();
        assert!(err.to_string().contains("sha256 mismatch"));
    }

    #[test]
    fn destination_cannot_escape() {
        let tmp = TempDir::new().unwrap();
        let spec = SourceSpec {
            path: tmp.path().to_path_buf(),
            sha256: None,
            dest: Some("../up".into()),
        };
        assert!(materialize_source(&spec, tmp.path(), &tmp.path().join("srcdir")).is_err());
    }
}
