//! Sandboxed command execution.
//!
//! Every runner presents the same view to the build script: the workspace at
//! [`WORKSPACE`](crate::env::WORKSPACE), sources under `srcdir`, the install
//! prefix under `destdir`, and the target's compiler shard under
//! `/opt/<triplet>`. Two implementations exist:
//!
//! - [`namespace::NamespaceRunner`]: overlay mount plus user, mount and PID
//!   namespaces (or no user namespace in the privileged flavour)
//! - [`qemu::QemuRunner`]: a minimal Linux guest with commands proxied over
//!   the serial console
//!
//! [`probe::open_session`] picks one from host capabilities and falls back to
//! the virtual machine when namespace setup fails.

pub mod namespace;
pub mod probe;
pub mod qemu;
pub mod stream;

use std::collections::BTreeMap;
use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use nix::sys::signal::{kill, Signal};
use nix::unistd::Pid;
use serde::{Deserialize, Serialize};

use crate::error::SandboxError;
use crate::platform::Platform;

pub use probe::{open_session, select_runner_kind, HostCapabilities};
pub use stream::{CommandIo, SharedBuffer};

/// Which isolation mechanism to use.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum RunnerKind {
    /// Unprivileged user namespace with an overlay root.
    Namespace,
    /// Mount and PID namespaces entered as real root.
    PrivilegedNamespace,
    /// Full-system emulation.
    Virtualized,
}

impl RunnerKind {
    pub const ALL: [RunnerKind; 3] = [
        RunnerKind::Namespace,
        RunnerKind::PrivilegedNamespace,
        RunnerKind::Virtualized,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Namespace => "namespace",
            Self::PrivilegedNamespace => "privileged-namespace",
            Self::Virtualized => "virtualized",
        }
    }
}

impl fmt::Display for RunnerKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for RunnerKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::ALL
            .into_iter()
            .find(|kind| kind.as_str() == s)
            .ok_or_else(|| {
                format!("unknown runner '{s}' (expected namespace, privileged-namespace or virtualized)")
            })
    }
}

/// A host directory made visible inside the sandbox.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Mount {
    pub host: PathBuf,
    /// Absolute path inside the sandbox.
    pub guest: PathBuf,
    pub read_only: bool,
}

impl Mount {
    pub fn read_only(host: impl Into<PathBuf>, guest: impl Into<PathBuf>) -> Self {
        Self {
            host: host.into(),
            guest: guest.into(),
            read_only: true,
        }
    }

    pub fn read_write(host: impl Into<PathBuf>, guest: impl Into<PathBuf>) -> Self {
        Self {
            host: host.into(),
            guest: guest.into(),
            read_only: false,
        }
    }
}

/// How a sandboxed command ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExitStatus {
    pub code: Option<i32>,
    pub signal: Option<i32>,
}

impl ExitStatus {
    pub fn from_code(code: i32) -> Self {
        Self {
            code: Some(code),
            signal: None,
        }
    }

    pub fn killed(signal: i32) -> Self {
        Self {
            code: None,
            signal: Some(signal),
        }
    }

    pub fn success(&self) -> bool {
        self.code == Some(0)
    }
}

impl From<std::process::ExitStatus> for ExitStatus {
    fn from(status: std::process::ExitStatus) -> Self {
        use std::os::unix::process::ExitStatusExt;
        Self {
            code: status.code(),
            signal: status.signal(),
        }
    }
}

impl fmt::Display for ExitStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match (self.code, self.signal) {
            (Some(code), _) => write!(f, "exit code {code}"),
            (None, Some(signal)) => write!(f, "killed by signal {signal}"),
            (None, None) => f.write_str("unknown exit status"),
        }
    }
}

/// Creates sandbox sessions.
pub trait SandboxRunner: Send + Sync {
    fn kind(&self) -> RunnerKind;

    /// Build a sandbox for `platform` around `workspace`.
    ///
    /// Setup failures are returned as [`SandboxError::Setup`] before any
    /// resource is left behind.
    fn open(
        &self,
        platform: &Platform,
        workspace: &Path,
        mounts: &[Mount],
        env: &BTreeMap<String, String>,
    ) -> Result<Box<dyn SandboxSession>, SandboxError>;
}

/// A live sandbox. Dropping it closes it.
pub trait SandboxSession: Send {
    fn kind(&self) -> RunnerKind;

    fn platform(&self) -> &Platform;

    /// Run `command` with `/bin/sh -c` inside the sandbox, streaming its
    /// output into `streams` as it is produced. A non-zero exit is not an error.
    fn run(&mut self, command: &str, streams: &mut CommandIo) -> Result<ExitStatus, SandboxError>;

    /// Interactive login shell on the caller's terminal.
    fn shell(&mut self) -> Result<ExitStatus, SandboxError>;

    /// Tear the sandbox down. Calling it again is a no-op.
    fn close(&mut self) -> Result<(), SandboxError>;

    /// Handle another thread can use to kill the running command.
    fn cancel_handle(&self) -> CancelHandle;
}

#[derive(Debug, Default)]
struct CancelState {
    cancelled: AtomicBool,
    pid: Mutex<Option<i32>>,
}

/// Kills whatever the session is currently running.
#[derive(Debug, Clone, Default)]
pub struct CancelHandle {
    inner: Arc<CancelState>,
}

impl CancelHandle {
    pub fn new() -> Self {
        Self::default()
    }

    /// Kill the tracked process. The session refuses further commands.
    pub fn cancel(&self) {
        self.inner.cancelled.store(true, Ordering::SeqCst);
        let pid = *self.inner.pid.lock().unwrap_or_else(|e| e.into_inner());
        if let Some(pid) = pid {
            let _ = kill(Pid::from_raw(pid), Signal::SIGKILL);
        }
    }

    pub fn is_cancelled(&self) -> bool {
        self.inner.cancelled.load(Ordering::SeqCst)
    }

    pub(crate) fn track(&self, pid: u32) {
        *self.inner.pid.lock().unwrap_or_else(|e| e.into_inner()) = i32::try_from(pid).ok();
        // A cancel that raced the spawn still lands.
        if self.is_cancelled() {
            self.cancel();
        }
    }

    pub(crate) fn untrack(&self) {
        *self.inner.pid.lock().unwrap_or_else(|e| e.into_inner()) = None;
    }
}
