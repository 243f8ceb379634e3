//! Namespace setup failures hand over to the virtual machine runner.

use std::collections::BTreeMap;

use cross_builder::config::{BuilderConfig, ShardEntry};
use cross_builder::error::{SandboxError, SetupFailure};
use cross_builder::platform::{Arch, Libc, Platform};
use cross_builder::runner::{open_session, RunnerKind};
use tempfile::TempDir;

/// A toolchain host this machine cannot execute natively.
fn foreign_host() -> Platform {
    if cfg!(target_arch = "powerpc64") {
        Platform::linux(Arch::Aarch64, Libc::Musl)
    } else {
        Platform::linux(Arch::Ppc64le, Libc::Musl)
    }
}

fn config(root: &std::path::Path) -> BuilderConfig {
    let mut config = BuilderConfig::with_root(root.join("cache"));
    config.runner = Some(RunnerKind::Namespace);
    config.images.shards.insert(
        "aarch64-linux-gnu".to_string(),
        ShardEntry {
            tarball: Some("ab".repeat(32)),
            squashfs: Some("cd".repeat(32)),
            host: Some(foreign_host()),
        },
    );
    config
}

#[test]
fn falls_back_to_the_virtual_machine() {
    let tmp = TempDir::new().unwrap();
    let config = config(tmp.path());
    let workspace = tmp.path().join("workspace");
    std::fs::create_dir_all(&workspace).unwrap();
    let target: Platform = "aarch64-linux-gnu".parse().unwrap();

    // No guest kernel is installed, so the fallback fails too, but the
    // error it reports must come from the virtualized runner.
    let err = match open_session(&config, &target, &workspace, &[], &BTreeMap::new()) {
        Err(e) => e,
        Ok(_) => panic!("a sandbox opened without a guest kernel"),
    };
    match &err {
        SandboxError::Setup {
            runner,
            failure,
            fallback,
            ..
        } => {
            assert_eq!(*runner, RunnerKind::Virtualized);
            assert_eq!(*failure, SetupFailure::ToolMissing);
            assert_eq!(*fallback, None);
        }
        other => panic!("unexpected error {other}"),
    }

    assert!(!workspace.join(".cross-builder").exists());
    assert!(!config.sessions_dir().exists());
}

#[test]
fn virtualized_runner_has_no_fallback() {
    let tmp = TempDir::new().unwrap();
    let mut config = config(tmp.path());
    config.runner = Some(RunnerKind::Virtualized);
    let workspace = tmp.path().join("workspace");
    std::fs::create_dir_all(&workspace).unwrap();
    let target: Platform = "aarch64-linux-gnu".parse().unwrap();

    let err = match open_session(&config, &target, &workspace, &[], &BTreeMap::new()) {
        Err(e) => e,
        Ok(_) => panic!("a sandbox opened without a guest kernel"),
    };
    assert!(!err.allows_fallback());
    assert!(err.to_string().contains("vmlinuz"), "{err}");
}
