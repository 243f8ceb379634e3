//! Linkage auditor.
//!
//! Walks a prefix, inspects every object file in it and classifies each
//! dependency and search path:
//!
//! 1. an absolute dependency inside the prefix is an [`IssueKind::AbsoluteHostPath`];
//! 2. a dependency that resolves through neither the object's search
//!    paths, the default library directories nor the system allowlist is an
//!    [`IssueKind::UnresolvedDependency`];
//! 3. a dependency that resolves outside the prefix is an
//!    [`IssueKind::ExternalDependency`].
//!
//! Resolution only ever looks inside the prefix. An absolute dependency
//! outside it is external as recorded; whether the build host happens to
//! have that file says nothing about the target system.
//!
//! The first rule that matches wins, so each dependency yields at most one
//! finding. With `autofix` the fixable findings are handed to [`fix`] and
//! the object is re-audited afterwards.

pub mod files;
pub mod fix;

use std::collections::BTreeMap;
use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use serde::Serialize;

use crate::env::PREFIX;
use crate::error::ObjectError;
use crate::object::{self, ObjectFormat, ObjectHandle};
use crate::platform::{Os, Platform};

pub use files::{collapse_symlinks, collect_files, normalize_name};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum IssueKind {
    AbsoluteHostPath,
    UnresolvedDependency,
    ExternalDependency,
    AbsoluteSearchPath,
    MachineMismatch,
    GlibcTooNew,
}

impl IssueKind {
    /// Findings the fixer knows how to repair.
    pub fn is_fixable(self) -> bool {
        matches!(self, IssueKind::AbsoluteHostPath | IssueKind::AbsoluteSearchPath)
    }
}

impl fmt::Display for IssueKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            IssueKind::AbsoluteHostPath => "absolute host path",
            IssueKind::UnresolvedDependency => "unresolved dependency",
            IssueKind::ExternalDependency => "external dependency",
            IssueKind::AbsoluteSearchPath => "absolute search path",
            IssueKind::MachineMismatch => "machine mismatch",
            IssueKind::GlibcTooNew => "glibc too new",
        })
    }
}

/// One finding against one object.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct LinkageIssue {
    pub object: PathBuf,
    /// The value as recorded in the object (a dependency, a search path,
    /// a machine name or a symbol version, depending on `kind`).
    pub dependency: String,
    pub resolved: Option<PathBuf>,
    pub kind: IssueKind,
}

impl fmt::Display for LinkageIssue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}: {} '{}'",
            self.object.display(),
            self.kind,
            self.dependency
        )?;
        match (&self.resolved, self.kind) {
            (Some(resolved), _) => write!(f, " -> {}", resolved.display()),
            (None, IssueKind::UnresolvedDependency) => f.write_str(" -> unresolved"),
            (None, _) => Ok(()),
        }
    }
}

#[derive(Debug, Clone)]
pub struct AuditOptions {
    pub autofix: bool,
    /// Treat remaining findings as a failed audit.
    pub strict: bool,
    /// Paths that mean "the prefix" inside recorded strings, such as the
    /// sandbox's `/workspace/destdir`.
    pub prefix_aliases: Vec<PathBuf>,
    /// Library names (or absolute path prefixes ending in `*`) provided by
    /// the target system. Matched case-insensitively for Windows targets.
    pub system_libraries: Vec<String>,
}

impl AuditOptions {
    /// Defaults for `platform`: no autofix, lenient, the sandbox prefix as
    /// alias and the platform's system library allowlist.
    pub fn for_platform(platform: &Platform) -> Self {
        Self {
            autofix: false,
            strict: false,
            prefix_aliases: vec![PathBuf::from(PREFIX)],
            system_libraries: default_system_libraries(platform.os)
                .iter()
                .map(|s| s.to_string())
                .collect(),
        }
    }
}

fn default_system_libraries(os: Os) -> &'static [&'static str] {
    match os {
        Os::Linux => &[
            "libc.so.6",
            "libm.so.6",
            "libdl.so.2",
            "librt.so.1",
            "libpthread.so.0",
            "libutil.so.1",
            "libresolv.so.2",
            "libstdc++.so.6",
            "libgcc_s.so.1",
            "libgfortran.so.*",
            "libgomp.so.1",
            "ld-linux*",
            "libc.musl-*",
            "ld-musl-*",
            "libc.so",
        ],
        Os::MacOS => &["/usr/lib/*", "/System/Library/*", "@rpath/libc++*"],
        Os::Windows => &[
            "kernel32.dll",
            "user32.dll",
            "gdi32.dll",
            "advapi32.dll",
            "shell32.dll",
            "ole32.dll",
            "oleaut32.dll",
            "ws2_32.dll",
            "msvcrt.dll",
            "crypt32.dll",
            "secur32.dll",
            "bcrypt.dll",
            "ntdll.dll",
            "api-ms-win-*",
            "libgcc_s_seh-1.dll",
            "libgcc_s_sjlj-1.dll",
            "libstdc++-6.dll",
            "libwinpthread-1.dll",
        ],
    }
}

/// An object that was rewritten.
#[derive(Debug, Clone, Serialize)]
pub struct FixedObject {
    pub path: PathBuf,
    pub changes: Vec<String>,
    pub method: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct SkippedFile {
    pub path: PathBuf,
    pub reason: String,
}

/// Outcome of auditing one prefix.
#[derive(Debug, Clone, Serialize)]
pub struct AuditReport {
    pub platform: Platform,
    pub prefix: PathBuf,
    pub objects_scanned: usize,
    pub issues: Vec<LinkageIssue>,
    pub fixed: Vec<FixedObject>,
    /// Objects whose fix was attempted and rolled back.
    pub fix_failures: Vec<SkippedFile>,
    /// Files that looked like objects but could not be parsed.
    pub skipped: Vec<SkippedFile>,
}

impl AuditReport {
    pub fn passed(&self, strict: bool) -> bool {
        !strict || self.issues.is_empty()
    }

    pub fn issues_of(&self, kind: IssueKind) -> impl Iterator<Item = &LinkageIssue> {
        self.issues.iter().filter(move |i| i.kind == kind)
    }
}

/// The prefix as seen from the host, plus the names it goes by inside objects.
#[derive(Debug, Clone)]
pub struct PrefixView {
    root: PathBuf,
    aliases: Vec<PathBuf>,
}

impl PrefixView {
    pub fn new(root: &Path, aliases: &[PathBuf]) -> Result<Self> {
        let root = fs::canonicalize(root)
            .with_context(|| format!("resolving prefix '{}'", root.display()))?;
        Ok(Self {
            root,
            aliases: aliases.to_vec(),
        })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Map an alias path onto the host prefix; other paths are returned normalized.
    pub fn to_host(&self, path: &Path) -> PathBuf {
        let path = files::normalize(path);
        for alias in &self.aliases {
            if let Ok(rest) = path.strip_prefix(alias) {
                return self.root.join(rest);
            }
        }
        path
    }

    pub fn contains(&self, path: &Path) -> bool {
        path.is_absolute() && self.to_host(path).starts_with(&self.root)
    }
}

/// Audit every object under `prefix` built for `platform`.
pub fn audit(prefix: &Path, platform: &Platform, options: &AuditOptions) -> Result<AuditReport> {
    let view = PrefixView::new(prefix, &options.prefix_aliases)?;
    let candidates = collapse_symlinks(collect_files(view.root(), |_| true));

    let mut report = AuditReport {
        platform: *platform,
        prefix: view.root().to_path_buf(),
        objects_scanned: 0,
        issues: Vec::new(),
        fixed: Vec::new(),
        fix_failures: Vec::new(),
        skipped: Vec::new(),
    };

    for path in candidates {
        let obj = match object::open(&path) {
            Ok(obj) => obj,
            Err(err) if err.is_not_an_object() => {
                tracing::trace!(file = %path.display(), "not an object");
                continue;
            }
            Err(err) => {
                tracing::warn!(file = %path.display(), error = %err, "skipping unreadable object");
                report.skipped.push(SkippedFile {
                    path,
                    reason: err.to_string(),
                });
                continue;
            }
        };
        report.objects_scanned += 1;

        let mut issues = classify(&obj, platform, &view, options);
        if options.autofix && issues.iter().any(|i| i.kind.is_fixable()) {
            match fix::fix_object(&obj, &issues, &view) {
                Ok(outcome) => {
                    tracing::info!(
                        object = %path.display(),
                        method = %outcome.method,
                        "rewrote linkage"
                    );
                    issues = match object::open(&path) {
                        Ok(fixed) => classify(&fixed, platform, &view, options),
                        Err(err) => {
                            tracing::warn!(object = %path.display(), error = %err, "re-inspection failed");
                            issues
                        }
                    };
                    report.fixed.push(FixedObject {
                        path: path.clone(),
                        changes: outcome.changes,
                        method: outcome.method.to_string(),
                    });
                }
                Err(err) => {
                    tracing::warn!(object = %path.display(), error = %err, "fix rolled back");
                    report.fix_failures.push(SkippedFile {
                        path: path.clone(),
                        reason: err.to_string(),
                    });
                }
            }
        }

        for issue in &issues {
            tracing::warn!(platform = %platform, "{issue}");
        }
        report.issues.extend(issues);
    }

    Ok(report)
}

/// Classify one object's dependencies and search paths.
pub fn classify(
    obj: &ObjectHandle,
    platform: &Platform,
    view: &PrefixView,
    options: &AuditOptions,
) -> Vec<LinkageIssue> {
    let mut issues = Vec::new();
    let issue = |dependency: &str, resolved: Option<PathBuf>, kind| LinkageIssue {
        object: obj.path().to_path_buf(),
        dependency: dependency.to_string(),
        resolved,
        kind,
    };

    if !obj.is_for_platform(platform) {
        issues.push(issue(
            &format!("{} {}", obj.format(), obj.machine_type()),
            None,
            IssueKind::MachineMismatch,
        ));
    }

    if let (Some(needed), Some(floor)) = (obj.required_glibc(), platform.libc_floor()) {
        if needed > floor {
            issues.push(issue(
                &format!("GLIBC_{needed}"),
                None,
                IssueKind::GlibcTooNew,
            ));
        }
    }

    for record in obj.existing_relocation_records().entries() {
        let path = Path::new(&record.path);
        if view.contains(path) {
            issues.push(issue(
                &record.path,
                Some(view.to_host(path)),
                IssueKind::AbsoluteSearchPath,
            ));
        }
    }

    let search_dirs = search_dirs(obj, view);
    for dep in obj.dependency_paths() {
        let dep_path = Path::new(dep);
        if view.contains(dep_path) {
            issues.push(issue(dep, Some(view.to_host(dep_path)), IssueKind::AbsoluteHostPath));
            continue;
        }
        if is_system_library(dep, platform, &options.system_libraries) {
            continue;
        }
        match resolve(dep, obj, &search_dirs, view) {
            Some(found) if found.starts_with(view.root()) => {}
            Some(found) => issues.push(issue(dep, Some(found), IssueKind::ExternalDependency)),
            None => issues.push(issue(dep, None, IssueKind::UnresolvedDependency)),
        }
    }

    issues
}

/// Directories inside the prefix that an object's non-absolute dependencies
/// are looked up in, host side.
fn search_dirs(obj: &ObjectHandle, view: &PrefixView) -> Vec<PathBuf> {
    let origin = obj
        .path()
        .parent()
        .map(Path::to_path_buf)
        .unwrap_or_default();
    let mut dirs: Vec<PathBuf> = obj
        .existing_relocation_records()
        .entries()
        .iter()
        .filter_map(|record| expand_origin(&record.path, &origin))
        .map(|dir| view.to_host(&dir))
        .filter(|dir| dir.starts_with(view.root()))
        .collect();

    let defaults: &[&str] = match obj.format() {
        ObjectFormat::Elf => &["lib", "lib64"],
        ObjectFormat::MachO => &["lib"],
        ObjectFormat::Pe => &["bin", "lib"],
    };
    if obj.format() == ObjectFormat::Pe {
        dirs.push(origin.clone());
    }
    dirs.extend(defaults.iter().map(|d| view.root().join(d)));
    dirs
}

/// Expand `$ORIGIN`, `${ORIGIN}`, `@loader_path` and `@executable_path`.
/// Relative search paths (resolved against the process cwd) yield `None`.
fn expand_origin(value: &str, origin: &Path) -> Option<PathBuf> {
    for token in ["${ORIGIN}", "$ORIGIN", "@loader_path", "@executable_path"] {
        if let Some(rest) = value.strip_prefix(token) {
            let rest = rest.trim_start_matches('/');
            return Some(files::normalize(&origin.join(rest)));
        }
    }
    let path = PathBuf::from(value);
    path.is_absolute().then_some(path)
}

fn resolve(dep: &str, obj: &ObjectHandle, dirs: &[PathBuf], view: &PrefixView) -> Option<PathBuf> {
    let origin = obj.path().parent().unwrap_or(Path::new("/"));

    if let Some(rest) = dep.strip_prefix("@rpath/") {
        return dirs.iter().map(|d| d.join(rest)).find(|p| p.exists());
    }
    if dep.starts_with('@') || dep.starts_with('$') {
        return expand_origin(dep, origin)
            .map(|p| view.to_host(&p))
            .filter(|p| p.starts_with(view.root()) && p.exists());
    }

    let path = Path::new(dep);
    if path.is_absolute() {
        return Some(files::normalize(path));
    }
    dirs.iter().map(|d| d.join(dep)).find(|p| p.exists())
}

fn is_system_library(dep: &str, platform: &Platform, allowlist: &[String]) -> bool {
    let fold = |s: &str| {
        if platform.is_windows() {
            s.to_ascii_lowercase()
        } else {
            s.to_string()
        }
    };
    let base = fold(dep.rsplit('/').next().unwrap_or(dep));
    let full = fold(dep);
    allowlist.iter().any(|entry| {
        let entry = fold(entry);
        let subject = if entry.starts_with('/') || entry.starts_with('@') {
            &full
        } else {
            &base
        };
        match entry.strip_suffix('*') {
            Some(stem) => subject.starts_with(stem),
            None => *subject == entry,
        }
    })
}

/// Group findings by object, preserving first-seen order.
pub fn issues_by_object(issues: &[LinkageIssue]) -> BTreeMap<PathBuf, Vec<&LinkageIssue>> {
    let mut grouped: BTreeMap<PathBuf, Vec<&LinkageIssue>> = BTreeMap::new();
    for issue in issues {
        grouped.entry(issue.object.clone()).or_default().push(issue);
    }
    grouped
}

/// Open `path` and report why it is skipped, for callers that audit a single file.
pub fn inspect_for_audit(path: &Path) -> Result<Option<ObjectHandle>, ObjectError> {
    match object::open(path) {
        Ok(obj) => Ok(Some(obj)),
        Err(err) if err.is_not_an_object() => Ok(None),
        Err(err) => Err(err),
    }
}
