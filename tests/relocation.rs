//! A prefix installed from inside the sandbox, audited and repaired.

use std::fs;

use cross_builder::audit::{audit, AuditOptions, IssueKind};
use cross_builder::object::{self, RecordKind};
use cross_builder::platform::Platform;
use cross_builder::testing::ElfBuilder;
use tempfile::TempDir;

fn installed_prefix() -> TempDir {
    let prefix = TempDir::new().unwrap();
    fs::create_dir_all(prefix.path().join("bin")).unwrap();
    fs::create_dir_all(prefix.path().join("lib")).unwrap();
    ElfBuilder::new()
        .soname("libfoo.so")
        .needed("libc.so.6")
        .write(&prefix.path().join("lib/libfoo.so"))
        .unwrap();
    ElfBuilder::new()
        .needed("/workspace/destdir/lib/libfoo.so")
        .needed("libc.so.6")
        .runpath("/workspace/destdir/lib")
        .write(&prefix.path().join("bin/foo"))
        .unwrap();
    prefix
}

#[test]
fn audit_reports_sandbox_paths_without_touching_them() {
    let prefix = installed_prefix();
    let platform: Platform = "x86_64-linux-gnu".parse().unwrap();
    let before = fs::read(prefix.path().join("bin/foo")).unwrap();

    let report = audit(prefix.path(), &platform, &AuditOptions::for_platform(&platform)).unwrap();
    assert_eq!(report.objects_scanned, 2);
    assert_eq!(report.issues_of(IssueKind::AbsoluteHostPath).count(), 1);
    assert!(report.fixed.is_empty());
    assert!(!report.passed(true));
    assert_eq!(fs::read(prefix.path().join("bin/foo")).unwrap(), before);
}

#[test]
fn autofix_makes_the_prefix_relocatable() {
    let prefix = installed_prefix();
    let platform: Platform = "x86_64-linux-gnu".parse().unwrap();
    let mut options = AuditOptions::for_platform(&platform);
    options.autofix = true;

    let report = audit(prefix.path(), &platform, &options).unwrap();
    assert!(report.issues.is_empty(), "{:?}", report.issues);
    assert!(report.fix_failures.is_empty(), "{:?}", report.fix_failures);
    assert_eq!(report.fixed.len(), 1);
    assert_eq!(report.fixed[0].method, "in-place");
    assert!(report.passed(true));

    let foo = object::open(&prefix.path().join("bin/foo")).unwrap();
    let deps: Vec<&str> = foo.dependencies().iter().map(|d| d.name.as_str()).collect();
    assert_eq!(deps, vec!["libfoo.so", "libc.so.6"]);
    let records = foo.existing_relocation_records().entries();
    assert_eq!(records.len(), 1);
    assert_eq!(records[0].kind, RecordKind::Runpath);
    assert_eq!(records[0].path, "$ORIGIN/../lib");

    // A second pass finds nothing left to do.
    let again = audit(prefix.path(), &platform, &options).unwrap();
    assert!(again.issues.is_empty());
    assert!(again.fixed.is_empty());
}

#[test]
fn moved_prefix_still_resolves() {
    let prefix = installed_prefix();
    let platform: Platform = "x86_64-linux-gnu".parse().unwrap();
    let mut options = AuditOptions::for_platform(&platform);
    options.autofix = true;
    audit(prefix.path(), &platform, &options).unwrap();

    let elsewhere = TempDir::new().unwrap();
    let moved = elsewhere.path().join("opt/foo");
    fs::create_dir_all(moved.parent().unwrap()).unwrap();
    fs::rename(prefix.path(), &moved).unwrap();

    options.autofix = false;
    let report = audit(&moved, &platform, &options).unwrap();
    assert!(report.issues.is_empty(), "{:?}", report.issues);

    fs::rename(&moved, prefix.path()).unwrap();
}
