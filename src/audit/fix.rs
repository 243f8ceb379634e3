//! Relocation fixer.
//!
//! Absolute dependencies inside the prefix become bare names (ELF) or
//! `@rpath/` names (Mach-O), and absolute search paths inside the prefix
//! become `$ORIGIN`/`@loader_path` relative ones. When every new string fits
//! in the slot of the string it replaces, the bytes are patched directly;
//! otherwise `patchelf` or `install_name_tool` does the rewrite.
//!
//! Work happens on a copy next to the object. The copy is re-inspected and
//! only renamed over the original if it reads back exactly as planned, so
//! an object is either fully fixed or untouched.

use std::collections::HashSet;
use std::fmt;
use std::fs::{self, OpenOptions};
use std::io::{Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use std::process::Command;

use super::files::relative_path;
use super::{IssueKind, LinkageIssue, PrefixView};
use crate::error::FixError;
use crate::object::{self, ObjectFormat, ObjectHandle, RecordKind, StringSlot};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FixMethod {
    InPlace,
    Patchelf,
    InstallNameTool,
}

impl fmt::Display for FixMethod {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            FixMethod::InPlace => "in-place",
            FixMethod::Patchelf => "patchelf",
            FixMethod::InstallNameTool => "install_name_tool",
        })
    }
}

#[derive(Debug, Clone)]
pub struct FixOutcome {
    pub method: FixMethod,
    pub changes: Vec<String>,
}

#[derive(Debug, Clone)]
struct NameChange {
    old: String,
    new: String,
    slot: Option<StringSlot>,
}

/// A search-path string (ELF) or `LC_RPATH` command (Mach-O) to rewrite.
/// `new == None` removes the command.
#[derive(Debug, Clone)]
struct PathChange {
    kind: RecordKind,
    old: String,
    new: Option<String>,
    slot: Option<StringSlot>,
}

#[derive(Debug, Default)]
struct Plan {
    names: Vec<NameChange>,
    paths: Vec<PathChange>,
    added: Vec<String>,
    /// Existing records are all `DT_RPATH`, so patchelf must keep that tag.
    force_rpath: bool,
    expected_deps: Vec<String>,
    expected_records: Vec<String>,
}

impl Plan {
    fn is_empty(&self) -> bool {
        self.names.is_empty() && self.paths.is_empty() && self.added.is_empty()
    }

    fn fits_in_place(&self) -> bool {
        self.added.is_empty()
            && self
                .names
                .iter()
                .all(|c| c.slot.is_some_and(|s| s.fits(&c.new)))
            && self.paths.iter().all(|c| match (&c.new, c.slot) {
                (Some(new), Some(slot)) => slot.fits(new),
                _ => false,
            })
    }

    fn describe(&self) -> Vec<String> {
        let mut out = Vec::new();
        for c in &self.names {
            out.push(format!("dependency {} -> {}", c.old, c.new));
        }
        for c in &self.paths {
            match &c.new {
                Some(new) => out.push(format!("{:?} {} -> {}", c.kind, c.old, new)),
                None => out.push(format!("remove {:?} {}", c.kind, c.old)),
            }
        }
        for added in &self.added {
            out.push(format!("add search path {added}"));
        }
        out
    }
}

/// Repair the fixable `issues` of `obj`. Windows objects are never rewritten.
pub fn fix_object(
    obj: &ObjectHandle,
    issues: &[LinkageIssue],
    view: &PrefixView,
) -> Result<FixOutcome, FixError> {
    if obj.format() == ObjectFormat::Pe {
        return Err(FixError::NotApplicable {
            path: obj.path().to_path_buf(),
            format: obj.format().to_string(),
        });
    }
    let plan = relocation_plan(obj, issues, view);
    apply(obj.path(), obj.format(), plan)
}

/// Replace every search path of `obj` with `entries`.
pub fn set_search_paths(obj: &ObjectHandle, entries: &[&str]) -> Result<FixOutcome, FixError> {
    if !obj.existing_relocation_records().is_applicable() {
        return Err(FixError::NotApplicable {
            path: obj.path().to_path_buf(),
            format: obj.format().to_string(),
        });
    }
    let entries: Vec<String> = entries.iter().map(|e| e.to_string()).collect();
    let mut plan = Plan {
        expected_deps: obj.dependency_paths().iter().map(|d| d.to_string()).collect(),
        ..Plan::default()
    };

    match obj.format() {
        ObjectFormat::Elf => {
            let groups = elf_groups(obj);
            plan.force_rpath = !groups.is_empty() && groups.iter().all(|g| g.kind == RecordKind::Rpath);
            if groups.is_empty() {
                plan.added = entries.clone();
            }
            for (index, group) in groups.into_iter().enumerate() {
                let new = if index == 0 { entries.join(":") } else { String::new() };
                if new != group.joined {
                    plan.paths.push(PathChange {
                        kind: group.kind,
                        old: group.joined,
                        new: Some(new),
                        slot: group.slot,
                    });
                }
            }
        }
        ObjectFormat::MachO => {
            let records = obj.existing_relocation_records().entries();
            for (index, record) in records.iter().enumerate() {
                let new = entries.get(index).cloned();
                if new.as_deref() != Some(record.path.as_str()) {
                    plan.paths.push(PathChange {
                        kind: record.kind,
                        old: record.path.clone(),
                        new,
                        slot: record.slot,
                    });
                }
            }
            plan.added = entries.iter().skip(records.len()).cloned().collect();
        }
        ObjectFormat::Pe => {
            return Err(FixError::NotApplicable {
                path: obj.path().to_path_buf(),
                format: obj.format().to_string(),
            })
        }
    }
    plan.expected_records = entries;
    apply(obj.path(), obj.format(), plan)
}

struct ElfGroup {
    kind: RecordKind,
    slot: Option<StringSlot>,
    entries: Vec<String>,
    joined: String,
}

/// Split ELF records back into the `DT_RPATH`/`DT_RUNPATH` strings they came from.
fn elf_groups(obj: &ObjectHandle) -> Vec<ElfGroup> {
    let mut groups: Vec<ElfGroup> = Vec::new();
    for record in obj.existing_relocation_records().entries() {
        match groups.last_mut() {
            Some(group) if group.slot == record.slot && group.kind == record.kind => {
                group.entries.push(record.path.clone());
            }
            _ => groups.push(ElfGroup {
                kind: record.kind,
                slot: record.slot,
                entries: vec![record.path.clone()],
                joined: String::new(),
            }),
        }
    }
    for group in &mut groups {
        group.joined = group.entries.join(":");
    }
    groups
}

fn relocation_plan(obj: &ObjectHandle, issues: &[LinkageIssue], view: &PrefixView) -> Plan {
    let format = obj.format();
    let origin_dir = obj
        .path()
        .parent()
        .map(Path::to_path_buf)
        .unwrap_or_else(|| PathBuf::from("/"));
    let token = match format {
        ObjectFormat::MachO => "@loader_path",
        _ => "$ORIGIN",
    };
    let relative_to_origin = |dir: &Path| {
        let rel = relative_path(&origin_dir, dir);
        if rel.as_os_str().is_empty() {
            token.to_string()
        } else {
            format!("{token}/{}", rel.display())
        }
    };

    let absolute: HashSet<&str> = issues
        .iter()
        .filter(|i| i.kind == IssueKind::AbsoluteHostPath)
        .map(|i| i.dependency.as_str())
        .collect();

    let mut plan = Plan::default();
    let mut required: Vec<String> = Vec::new();
    for dep in obj.dependencies() {
        if !absolute.contains(dep.name.as_str()) {
            plan.expected_deps.push(dep.name.clone());
            continue;
        }
        let host = view.to_host(Path::new(&dep.name));
        let base = host
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| dep.name.clone());
        let new = match format {
            ObjectFormat::MachO => format!("@rpath/{base}"),
            _ => base,
        };
        if let Some(dir) = host.parent() {
            let entry = relative_to_origin(dir);
            if !required.contains(&entry) {
                required.push(entry);
            }
        }
        plan.expected_deps.push(new.clone());
        plan.names.push(NameChange {
            old: dep.name.clone(),
            new,
            slot: dep.slot,
        });
    }

    let rewrite = |entry: &str| {
        if view.contains(Path::new(entry)) {
            relative_to_origin(&view.to_host(Path::new(entry)))
        } else {
            entry.to_string()
        }
    };

    match format {
        ObjectFormat::Elf => {
            let groups = elf_groups(obj);
            plan.force_rpath =
                !groups.is_empty() && groups.iter().all(|g| g.kind == RecordKind::Rpath);
            let mut rewritten: Vec<Vec<String>> = Vec::new();
            for group in &groups {
                let mut entries: Vec<String> = Vec::new();
                for entry in &group.entries {
                    let new = rewrite(entry);
                    if !entries.contains(&new) {
                        entries.push(new);
                    }
                }
                rewritten.push(entries);
            }
            for entry in required {
                if rewritten.iter().flatten().any(|e| *e == entry) {
                    continue;
                }
                match rewritten.first_mut() {
                    Some(first) => first.push(entry),
                    None => plan.added.push(entry),
                }
            }
            for (group, entries) in groups.into_iter().zip(&rewritten) {
                let new = entries.join(":");
                if new != group.joined {
                    plan.paths.push(PathChange {
                        kind: group.kind,
                        old: group.joined,
                        new: Some(new),
                        slot: group.slot,
                    });
                }
            }
            plan.expected_records = rewritten.into_iter().flatten().collect();
            plan.expected_records.extend(plan.added.iter().cloned());
        }
        ObjectFormat::MachO => {
            let mut kept: Vec<String> = Vec::new();
            for record in obj.existing_relocation_records().entries() {
                let new = rewrite(&record.path);
                if kept.contains(&new) {
                    plan.paths.push(PathChange {
                        kind: record.kind,
                        old: record.path.clone(),
                        new: None,
                        slot: record.slot,
                    });
                    continue;
                }
                if new != record.path {
                    plan.paths.push(PathChange {
                        kind: record.kind,
                        old: record.path.clone(),
                        new: Some(new.clone()),
                        slot: record.slot,
                    });
                }
                kept.push(new);
            }
            for entry in required {
                if !kept.contains(&entry) && !plan.added.contains(&entry) {
                    plan.added.push(entry);
                }
            }
            plan.expected_records = kept;
            plan.expected_records.extend(plan.added.iter().cloned());
        }
        ObjectFormat::Pe => {}
    }

    plan
}

fn apply(path: &Path, format: ObjectFormat, plan: Plan) -> Result<FixOutcome, FixError> {
    let changes = plan.describe();
    if plan.is_empty() {
        return Ok(FixOutcome {
            method: FixMethod::InPlace,
            changes,
        });
    }

    let io_err = |source| FixError::Io {
        path: path.to_path_buf(),
        source,
    };
    let file_name = path
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default();
    let scratch = path.with_file_name(format!(".{file_name}.fix-{}", std::process::id()));
    fs::copy(path, &scratch).map_err(io_err)?;

    match rewrite_copy(&scratch, format, &plan) {
        Ok(method) => {
            fs::rename(&scratch, path).map_err(|source| {
                let _ = fs::remove_file(&scratch);
                FixError::Io {
                    path: path.to_path_buf(),
                    source,
                }
            })?;
            tracing::debug!(object = %path.display(), %method, changes = changes.len(), "fix applied");
            Ok(FixOutcome { method, changes })
        }
        Err(err) => {
            let _ = fs::remove_file(&scratch);
            Err(match err {
                FixError::ToolMissing { tool, .. } => FixError::ToolMissing {
                    path: path.to_path_buf(),
                    tool,
                },
                FixError::ToolFailed { tool, stderr, .. } => FixError::ToolFailed {
                    path: path.to_path_buf(),
                    tool,
                    stderr,
                },
                FixError::Verification { reason, .. } => FixError::Verification {
                    path: path.to_path_buf(),
                    reason,
                },
                other => other,
            })
        }
    }
}

fn rewrite_copy(scratch: &Path, format: ObjectFormat, plan: &Plan) -> Result<FixMethod, FixError> {
    let method = if plan.fits_in_place() {
        write_in_place(scratch, plan)?;
        FixMethod::InPlace
    } else {
        match format {
            ObjectFormat::Elf => run_patchelf(scratch, plan)?,
            ObjectFormat::MachO => run_install_name_tool(scratch, plan)?,
            ObjectFormat::Pe => {
                return Err(FixError::NotApplicable {
                    path: scratch.to_path_buf(),
                    format: format.to_string(),
                })
            }
        }
    };
    verify(scratch, plan)?;
    Ok(method)
}

fn write_in_place(scratch: &Path, plan: &Plan) -> Result<(), FixError> {
    let io_err = |source| FixError::Io {
        path: scratch.to_path_buf(),
        source,
    };
    let mut file = OpenOptions::new().write(true).open(scratch).map_err(io_err)?;

    let writes = plan
        .names
        .iter()
        .filter_map(|c| Some((c.slot?, c.new.as_str())))
        .chain(
            plan.paths
                .iter()
                .filter_map(|c| Some((c.slot?, c.new.as_deref()?))),
        );
    for (slot, value) in writes {
        let mut bytes = value.as_bytes().to_vec();
        bytes.resize(slot.capacity, 0);
        file.seek(SeekFrom::Start(slot.offset)).map_err(io_err)?;
        file.write_all(&bytes).map_err(io_err)?;
    }
    file.sync_all().map_err(io_err)?;
    Ok(())
}

fn find_tool(scratch: &Path, tool: &str) -> Result<PathBuf, FixError> {
    which::which(tool).map_err(|_| FixError::ToolMissing {
        path: scratch.to_path_buf(),
        tool: tool.to_string(),
    })
}

fn run_tool(scratch: &Path, tool: &str, args: Vec<String>) -> Result<(), FixError> {
    let program = find_tool(scratch, tool)?;
    tracing::debug!(tool, ?args, "running relocation tool");
    let output = Command::new(&program)
        .args(&args)
        .arg(scratch)
        .output()
        .map_err(|source| FixError::Io {
            path: scratch.to_path_buf(),
            source,
        })?;
    if !output.status.success() {
        return Err(FixError::ToolFailed {
            path: scratch.to_path_buf(),
            tool: tool.to_string(),
            stderr: String::from_utf8_lossy(&output.stderr).trim().to_string(),
        });
    }
    Ok(())
}

fn run_patchelf(scratch: &Path, plan: &Plan) -> Result<FixMethod, FixError> {
    let mut args = Vec::new();
    for change in &plan.names {
        args.extend(["--replace-needed".to_string(), change.old.clone(), change.new.clone()]);
    }
    if !plan.paths.is_empty() || !plan.added.is_empty() {
        if plan.force_rpath {
            args.push("--force-rpath".to_string());
        }
        args.extend(["--set-rpath".to_string(), plan.expected_records.join(":")]);
    }
    run_tool(scratch, "patchelf", args)?;
    Ok(FixMethod::Patchelf)
}

fn run_install_name_tool(scratch: &Path, plan: &Plan) -> Result<FixMethod, FixError> {
    let mut args = Vec::new();
    for change in &plan.names {
        args.extend(["-change".to_string(), change.old.clone(), change.new.clone()]);
    }
    for change in &plan.paths {
        match &change.new {
            Some(new) => args.extend(["-rpath".to_string(), change.old.clone(), new.clone()]),
            None => args.extend(["-delete_rpath".to_string(), change.old.clone()]),
        }
    }
    for added in &plan.added {
        args.extend(["-add_rpath".to_string(), added.clone()]);
    }
    run_tool(scratch, "install_name_tool", args)?;
    Ok(FixMethod::InstallNameTool)
}

fn verify(scratch: &Path, plan: &Plan) -> Result<(), FixError> {
    let fixed = object::open(scratch)?;
    let deps: Vec<&str> = fixed.dependency_paths();
    if deps != plan.expected_deps {
        return Err(FixError::Verification {
            path: scratch.to_path_buf(),
            reason: format!(
                "dependencies read back as {deps:?}, expected {:?}",
                plan.expected_deps
            ),
        });
    }
    let records: Vec<&str> = fixed
        .existing_relocation_records()
        .entries()
        .iter()
        .map(|r| r.path.as_str())
        .collect();
    if records != plan.expected_records {
        return Err(FixError::Verification {
            path: scratch.to_path_buf(),
            reason: format!(
                "search paths read back as {records:?}, expected {:?}",
                plan.expected_records
            ),
        });
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audit::{audit, classify, AuditOptions};
    use crate::platform::Platform;
    use crate::testing::{ElfBuilder, MachOBuilder};
    use tempfile::TempDir;

    fn layout() -> TempDir {
        let tmp = TempDir::new().unwrap();
        fs::create_dir_all(tmp.path().join("bin")).unwrap();
        fs::create_dir_all(tmp.path().join("lib")).unwrap();
        tmp
    }

    #[test]
    fn set_search_paths_only_touches_the_string() {
        let tmp = layout();
        let path = tmp.path().join("lib/libfoo.so");
        ElfBuilder::new()
            .needed("libc.so.6")
            .rpath("/build/tree/lib:/other")
            .write(&path)
            .unwrap();
        let before = fs::read(&path).unwrap();

        let obj = object::open(&path).unwrap();
        let slot = obj.existing_relocation_records().entries()[0].slot.unwrap();
        let outcome = set_search_paths(&obj, &["$ORIGIN"]).unwrap();
        assert_eq!(outcome.method, FixMethod::InPlace);

        let after = fs::read(&path).unwrap();
        assert_eq!(before.len(), after.len());
        let start = slot.offset as usize;
        let end = start + slot.capacity;
        for (i, (a, b)) in before.iter().zip(&after).enumerate() {
            if i < start || i >= end {
                assert_eq!(a, b, "byte {i} outside the search path changed");
            }
        }
        let reopened = object::open(&path).unwrap();
        let records = reopened.existing_relocation_records().entries();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].path, "$ORIGIN");
        assert_eq!(records[0].kind, RecordKind::Rpath);
    }

    #[test]
    fn growing_without_patchelf_leaves_object_untouched() {
        if which::which("patchelf").is_ok() {
            eprintln!("patchelf installed; skipping missing-tool test");
            return;
        }
        let tmp = layout();
        let path = tmp.path().join("lib/libfoo.so");
        ElfBuilder::new().runpath("/a").write(&path).unwrap();
        let before = fs::read(&path).unwrap();

        let obj = object::open(&path).unwrap();
        let err = set_search_paths(&obj, &["$ORIGIN/../much/longer/path"]).unwrap_err();
        assert!(matches!(err, FixError::ToolMissing { .. }));
        assert_eq!(fs::read(&path).unwrap(), before);
        let leftovers: Vec<_> = fs::read_dir(tmp.path().join("lib"))
            .unwrap()
            .filter_map(Result::ok)
            .filter(|e| e.file_name().to_string_lossy().starts_with('.'))
            .collect();
        assert!(leftovers.is_empty());
    }

    #[test]
    fn macho_absolute_dependency_becomes_rpath_relative() {
        let tmp = layout();
        let platform: Platform = "x86_64-apple-darwin14".parse().unwrap();
        MachOBuilder::new()
            .id_dylib("@rpath/libfoo.dylib")
            .write(&tmp.path().join("lib/libfoo.dylib"))
            .unwrap();
        let bin = tmp.path().join("bin/foo");
        MachOBuilder::new()
            .load_dylib("/workspace/destdir/lib/libfoo.dylib")
            .rpath("/workspace/destdir/lib")
            .write(&bin)
            .unwrap();

        let mut options = AuditOptions::for_platform(&platform);
        options.autofix = true;
        let report = audit(tmp.path(), &platform, &options).unwrap();
        assert!(report.issues.is_empty(), "{:?}", report.issues);
        assert_eq!(report.fixed.len(), 1);

        let obj = object::open(&bin).unwrap();
        assert_eq!(obj.dependency_paths(), vec!["@rpath/libfoo.dylib"]);
        let records: Vec<_> = obj
            .existing_relocation_records()
            .entries()
            .iter()
            .map(|r| r.path.clone())
            .collect();
        assert_eq!(records, vec!["@loader_path/../lib".to_string()]);
    }

    #[test]
    fn windows_objects_are_never_rewritten() {
        let tmp = layout();
        let path = tmp.path().join("bin/foo.exe");
        crate::testing::PeBuilder::new()
            .import("libfoo.dll")
            .write(&path)
            .unwrap();
        let platform: Platform = "x86_64-w64-mingw32".parse().unwrap();
        let view = PrefixView::new(tmp.path(), &[]).unwrap();
        let obj = object::open(&view.root().join("bin/foo.exe")).unwrap();
        let issues = classify(&obj, &platform, &view, &AuditOptions::for_platform(&platform));
        assert!(matches!(
            fix_object(&obj, &issues, &view),
            Err(FixError::NotApplicable { .. })
        ));
    }
}
