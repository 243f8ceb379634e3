//! Preflight checks for sandboxed builds.
//!
//! Validates that the host has the tools a runner or the fixer shells out
//! to before a build starts, so a missing `qemu-system-*` or `patchelf`
//! shows up as one readable list instead of a failure deep inside a build.
//!
//! # Example
//!
//! ```rust,ignore
//! use cross_builder::preflight::{check_required_tools, tools_for_runner};
//! use cross_builder::runner::RunnerKind;
//!
//! check_required_tools(&tools_for_runner(RunnerKind::Virtualized, &shard_host))?;
//! ```

use anyhow::{bail, Result};

use crate::config::ImageStrategy;
use crate::platform::Platform;
use crate::runner::RunnerKind;

/// Check if a command exists in PATH.
pub fn command_exists(cmd: &str) -> bool {
    which::which(cmd).is_ok()
}

/// Tools the relocation fixer falls back to when a rewrite does not fit in place.
///
/// Each tuple is (command_name, package_name).
pub const FIXER_TOOLS: &[(&str, &str)] = &[
    ("patchelf", "patchelf"),
    ("install_name_tool", "cctools"),
];

/// Tools for loop-mounting squashfs images.
pub const LOOP_MOUNT_TOOLS: &[(&str, &str)] = &[("mount", "util-linux"), ("umount", "util-linux")];

/// Host tools `kind` needs when the shard's toolchain runs on `shard_host`.
pub fn tools_for_runner(kind: RunnerKind, shard_host: &Platform) -> Vec<(String, String)> {
    match kind {
        RunnerKind::Namespace | RunnerKind::PrivilegedNamespace => Vec::new(),
        RunnerKind::Virtualized => vec![(
            format!("qemu-system-{}", shard_host.arch.qemu_system_name()),
            "qemu-system".to_string(),
        )],
    }
}

/// Host tools the image strategy needs.
pub fn tools_for_images(strategy: ImageStrategy) -> &'static [(&'static str, &'static str)] {
    match strategy {
        ImageStrategy::Unpack => &[],
        ImageStrategy::LoopMount => LOOP_MOUNT_TOOLS,
    }
}

/// Check that specific tools are available.
///
/// # Returns
///
/// * `Ok(())` if all tools are found
/// * `Err` with list of missing tools and their packages
pub fn check_required_tools<S: AsRef<str>>(tools: &[(S, S)]) -> Result<()> {
    let missing: Vec<(&str, &str)> = tools
        .iter()
        .map(|(t, p)| (t.as_ref(), p.as_ref()))
        .filter(|(tool, _)| !command_exists(tool))
        .collect();

    if !missing.is_empty() {
        let msg = missing
            .iter()
            .map(|(t, p)| format!("  {} (install: {})", t, p))
            .collect::<Vec<_>>()
            .join("\n");
        bail!("Missing required host tools:\n{}", msg);
    }

    Ok(())
}

/// Fixer tools that are missing, for a warning rather than an error: most
/// rewrites fit in place and never need them.
pub fn missing_fixer_tools() -> Vec<&'static str> {
    FIXER_TOOLS
        .iter()
        .filter(|(tool, _)| !command_exists(tool))
        .map(|(tool, _)| *tool)
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_command_exists() {
        // 'sh' should exist on any Unix system
        assert!(command_exists("sh"));
        assert!(!command_exists("definitely_not_a_real_command_12345"));
    }

    #[test]
    fn test_check_required_tools() {
        assert!(check_required_tools(&[("sh", "dash"), ("cat", "coreutils")]).is_ok());
        let err = check_required_tools(&[("nonexistent_command_xyz", "fake-package")])
            .unwrap_err()
            .to_string();
        assert!(err.contains("nonexistent_command_xyz (install: fake-package)"));
    }

    #[test]
    fn runner_tools() {
        let shard_host: Platform = "x86_64-linux-musl".parse().unwrap();
        assert!(tools_for_runner(RunnerKind::Namespace, &shard_host).is_empty());
        let tools = tools_for_runner(RunnerKind::Virtualized, &shard_host);
        assert_eq!(tools[0].0, "qemu-system-x86_64");
        assert!(tools_for_images(ImageStrategy::Unpack).is_empty());
        assert_eq!(tools_for_images(ImageStrategy::LoopMount)[0].0, "mount");
    }
}
