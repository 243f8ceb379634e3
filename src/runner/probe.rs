//! Host capability detection and runner selection.

use std::collections::BTreeMap;
use std::fs;
use std::os::unix::process::CommandExt;
use std::path::{Path, PathBuf};
use std::process::{Command, Stdio};
use std::sync::OnceLock;

use nix::mount::{mount, MsFlags};
use nix::sched::{unshare, CloneFlags};
use nix::unistd::{geteuid, getgid, getuid};
use serde::Serialize;
use tracing::{debug, warn};

use super::namespace::{map_current_user, remove_session_dir, NamespaceRunner};
use super::qemu::QemuRunner;
use super::{Mount, RunnerKind, SandboxRunner, SandboxSession};
use crate::config::BuilderConfig;
use crate::error::SandboxError;
use crate::platform::{Arch, Platform};

/// What this machine can do for sandboxing.
#[derive(Debug, Clone, Serialize)]
pub struct HostCapabilities {
    pub host: Option<Platform>,
    pub is_root: bool,
    pub user_namespaces: bool,
    pub overlay_in_userns: bool,
    pub kvm: bool,
    /// `qemu-system-*` binaries found in PATH.
    pub qemu_systems: Vec<String>,
}

impl HostCapabilities {
    pub fn probe() -> Self {
        let host = Platform::host().ok();
        let linux = host.is_some_and(|h| h.is_linux());
        let user_namespaces = linux && check_user_namespaces().is_ok();
        let overlay_in_userns = user_namespaces && check_overlay(true).is_ok();

        let mut qemu_systems: Vec<String> = [
            Arch::X86_64,
            Arch::I686,
            Arch::Aarch64,
            Arch::Armv7l,
            Arch::Ppc64le,
        ]
        .iter()
        .map(|arch| format!("qemu-system-{}", arch.qemu_system_name()))
        .filter(|name| which::which(name).is_ok())
        .collect();
        qemu_systems.dedup();

        Self {
            host,
            is_root: geteuid().is_root(),
            user_namespaces,
            overlay_in_userns,
            kvm: Path::new("/dev/kvm").exists(),
            qemu_systems,
        }
    }

    pub fn is_linux(&self) -> bool {
        self.host.is_some_and(|h| h.is_linux())
    }
}

/// Default runner for a host: unprivileged namespaces when they work, the
/// privileged flavour for root, the virtual machine otherwise.
pub fn select_runner_kind(caps: &HostCapabilities) -> RunnerKind {
    if caps.user_namespaces && caps.overlay_in_userns {
        RunnerKind::Namespace
    } else if caps.is_linux() && caps.is_root {
        RunnerKind::PrivilegedNamespace
    } else {
        RunnerKind::Virtualized
    }
}

pub fn runner_for(kind: RunnerKind, config: &BuilderConfig) -> Box<dyn SandboxRunner> {
    match kind {
        RunnerKind::Namespace => Box::new(NamespaceRunner::new(config, false)),
        RunnerKind::PrivilegedNamespace => Box::new(NamespaceRunner::new(config, true)),
        RunnerKind::Virtualized => Box::new(QemuRunner::new(config)),
    }
}

/// Open `primary`, and `fallback` if the primary's setup fails in a way
/// the fallback may not share.
pub fn open_with_fallback(
    primary: &dyn SandboxRunner,
    fallback: Option<&dyn SandboxRunner>,
    platform: &Platform,
    workspace: &Path,
    mounts: &[Mount],
    env: &BTreeMap<String, String>,
) -> Result<Box<dyn SandboxSession>, SandboxError> {
    match primary.open(platform, workspace, mounts, env) {
        Ok(session) => Ok(session),
        Err(e) if e.allows_fallback() => {
            let Some(fallback) = fallback else {
                return Err(e);
            };
            warn!(
                platform = %platform,
                runner = %primary.kind(),
                fallback = %fallback.kind(),
                error = %e,
                "sandbox setup failed, falling back"
            );
            fallback.open(platform, workspace, mounts, env)
        }
        Err(e) => Err(e),
    }
}

/// Open a sandbox with the configured runner, or the probed default.
pub fn open_session(
    config: &BuilderConfig,
    platform: &Platform,
    workspace: &Path,
    mounts: &[Mount],
    env: &BTreeMap<String, String>,
) -> Result<Box<dyn SandboxSession>, SandboxError> {
    let kind = config
        .runner
        .unwrap_or_else(|| select_runner_kind(&HostCapabilities::probe()));
    debug!(platform = %platform, runner = %kind, "opening sandbox");

    let primary = runner_for(kind, config);
    let fallback = match kind {
        RunnerKind::Virtualized => None,
        _ => Some(runner_for(RunnerKind::Virtualized, config)),
    };
    open_with_fallback(
        primary.as_ref(),
        fallback.as_deref(),
        platform,
        workspace,
        mounts,
        env,
    )
}

/// Whether an unprivileged user namespace can be created and mapped.
pub fn check_user_namespaces() -> Result<(), String> {
    static RESULT: OnceLock<Result<(), String>> = OnceLock::new();
    RESULT.get_or_init(probe_user_namespaces).clone()
}

fn probe_user_namespaces() -> Result<(), String> {
    for (knob, off) in [
        ("/proc/sys/kernel/unprivileged_userns_clone", "0"),
        ("/proc/sys/user/max_user_namespaces", "0"),
    ] {
        if let Ok(value) = fs::read_to_string(knob) {
            if value.trim() == off {
                return Err(format!("user namespaces are disabled ({knob} = {off})"));
            }
        }
    }

    let (uid_map, gid_map) = current_user_maps();
    let mut cmd = trial_command();
    unsafe {
        cmd.pre_exec(move || {
            unshare(CloneFlags::CLONE_NEWUSER)?;
            map_current_user(uid_map.as_bytes(), gid_map.as_bytes())
        });
    }
    run_trial(cmd, "creating a user namespace")
}

/// Whether an overlay can be mounted, inside a fresh user namespace when
/// `user_ns` is set. Runs a real trial mount.
pub fn check_overlay(user_ns: bool) -> Result<(), String> {
    static IN_USERNS: OnceLock<Result<(), String>> = OnceLock::new();
    static PLAIN: OnceLock<Result<(), String>> = OnceLock::new();
    let cell = if user_ns { &IN_USERNS } else { &PLAIN };
    cell.get_or_init(|| probe_overlay(user_ns)).clone()
}

fn probe_overlay(user_ns: bool) -> Result<(), String> {
    let dir = std::env::temp_dir().join(format!(
        "cross-builder-overlay-probe-{}",
        std::process::id()
    ));
    let result = trial_overlay(&dir, user_ns);
    if let Err(e) = remove_session_dir(&dir) {
        debug!(dir = %dir.display(), error = %e, "could not remove overlay probe");
    }
    result
}

fn trial_overlay(dir: &Path, user_ns: bool) -> Result<(), String> {
    let subdir = |name: &str| -> Result<PathBuf, String> {
        let path = dir.join(name);
        fs::create_dir_all(&path).map_err(|e| format!("creating {}: {e}", path.display()))?;
        Ok(path)
    };
    let lower = subdir("lower")?;
    let upper = subdir("upper")?;
    let work = subdir("work")?;
    let merged = subdir("merged")?;
    let options = format!(
        "lowerdir={},upperdir={},workdir={}",
        lower.display(),
        upper.display(),
        work.display()
    );

    let (uid_map, gid_map) = current_user_maps();
    let mut cmd = trial_command();
    unsafe {
        cmd.pre_exec(move || {
            let mut flags = CloneFlags::CLONE_NEWNS;
            if user_ns {
                flags |= CloneFlags::CLONE_NEWUSER;
            }
            unshare(flags)?;
            if user_ns {
                map_current_user(uid_map.as_bytes(), gid_map.as_bytes())?;
            }
            mount(
                None::<&str>,
                "/",
                None::<&str>,
                MsFlags::MS_REC | MsFlags::MS_PRIVATE,
                None::<&str>,
            )?;
            mount(
                Some("overlay"),
                &merged,
                Some("overlay"),
                MsFlags::empty(),
                Some(options.as_str()),
            )?;
            Ok(())
        });
    }
    let what = if user_ns {
        "mounting overlayfs inside a user namespace"
    } else {
        "mounting overlayfs"
    };
    run_trial(cmd, what)
}

/// `0 <uid> 1` maps for the invoking user.
pub(crate) fn current_user_maps() -> (String, String) {
    (
        format!("0 {} 1\n", getuid().as_raw()),
        format!("0 {} 1\n", getgid().as_raw()),
    )
}

fn trial_command() -> Command {
    let mut cmd = Command::new("/bin/sh");
    cmd.args(["-c", "exit 0"])
        .stdin(Stdio::null())
        .stdout(Stdio::null())
        .stderr(Stdio::null());
    cmd
}

fn run_trial(mut cmd: Command, what: &str) -> Result<(), String> {
    match cmd.status() {
        Ok(status) if status.success() => Ok(()),
        Ok(status) => Err(format!("{what}: trial process exited with {status}")),
        Err(e) => Err(format!("{what}: {e}")),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::SetupFailure;
    use crate::platform::Libc;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;
    use tempfile::TempDir;

    fn caps(user_namespaces: bool, overlay: bool, root: bool) -> HostCapabilities {
        HostCapabilities {
            host: Some(Platform::linux(Arch::X86_64, Libc::Glibc)),
            is_root: root,
            user_namespaces,
            overlay_in_userns: overlay,
            kvm: false,
            qemu_systems: Vec::new(),
        }
    }

    #[test]
    fn selection_order() {
        assert_eq!(select_runner_kind(&caps(true, true, false)), RunnerKind::Namespace);
        assert_eq!(
            select_runner_kind(&caps(true, false, true)),
            RunnerKind::PrivilegedNamespace
        );
        assert_eq!(select_runner_kind(&caps(false, false, false)), RunnerKind::Virtualized);

        let mut mac = caps(false, false, true);
        mac.host = Some(Platform::macos(Arch::X86_64));
        assert_eq!(select_runner_kind(&mac), RunnerKind::Virtualized);
    }

    struct Failing {
        kind: RunnerKind,
        fallback: Option<RunnerKind>,
        opened: Arc<AtomicUsize>,
    }

    impl SandboxRunner for Failing {
        fn kind(&self) -> RunnerKind {
            self.kind
        }

        fn open(
            &self,
            platform: &Platform,
            _workspace: &Path,
            _mounts: &[Mount],
            _env: &BTreeMap<String, String>,
        ) -> Result<Box<dyn SandboxSession>, SandboxError> {
            self.opened.fetch_add(1, Ordering::SeqCst);
            Err(SandboxError::Setup {
                runner: self.kind,
                platform: platform.to_string(),
                failure: SetupFailure::NamespacesUnavailable,
                reason: "disabled".into(),
                fallback: self.fallback,
            })
        }
    }

    #[test]
    fn fallback_runs_only_when_allowed() {
        let platform = Platform::linux(Arch::Aarch64, Libc::Glibc);
        let opened = Arc::new(AtomicUsize::new(0));
        let primary = Failing {
            kind: RunnerKind::Namespace,
            fallback: Some(RunnerKind::Virtualized),
            opened: Arc::clone(&opened),
        };
        let vm = Failing {
            kind: RunnerKind::Virtualized,
            fallback: None,
            opened: Arc::clone(&opened),
        };
        let err = match open_with_fallback(
            &primary,
            Some(&vm),
            &platform,
            Path::new("/"),
            &[],
            &BTreeMap::new(),
        ) {
            Err(e) => e,
            Ok(_) => panic!("both runners fail"),
        };
        assert_eq!(opened.load(Ordering::SeqCst), 2);
        assert!(matches!(
            err,
            SandboxError::Setup {
                runner: RunnerKind::Virtualized,
                ..
            }
        ));

        // A final failure is not retried.
        let before = opened.load(Ordering::SeqCst);
        let _ = open_with_fallback(&vm, Some(&primary), &platform, Path::new("/"), &[], &BTreeMap::new());
        assert_eq!(opened.load(Ordering::SeqCst), before + 1);
    }

    #[test]
    fn probe_is_consistent() {
        let caps = HostCapabilities::probe();
        if caps.overlay_in_userns {
            assert!(caps.user_namespaces);
        }
        let json = serde_json::to_value(&caps).unwrap();
        assert!(json.get("qemu_systems").is_some());
    }

    #[test]
    fn overlay_probe_cleans_up() {
        if check_user_namespaces().is_err() {
            eprintln!("skipping: user namespaces unavailable");
            return;
        }
        let tmp = TempDir::new().unwrap();
        let dir = tmp.path().join("probe");
        let _ = trial_overlay(&dir, true);
        remove_session_dir(&dir).unwrap();
        assert!(!dir.exists());
    }
}
