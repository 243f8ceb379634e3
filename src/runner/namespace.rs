//! Namespace sandbox.
//!
//! Each command runs in a fresh set of namespaces created between `fork` and
//! `exec`:
//!
//! 1. `unshare(CLONE_NEWUSER | CLONE_NEWNS | CLONE_NEWPID)`; the invoking
//!    user becomes uid 0 inside (the privileged flavour skips the user
//!    namespace and must already be root)
//! 2. fork again; the new child is pid 1 of the PID namespace and dies with
//!    its parent (`PR_SET_PDEATHSIG`)
//! 3. pid 1 makes all mounts private, stacks an overlay of the session's
//!    upper directory on the rootfs, binds the shard, the workspace, extra
//!    mounts and `/dev`, mounts a fresh `/proc`, then `pivot_root`s into
//!    the result and detaches the old root
//!
//! Mount points missing from the rootfs are created on the host before the
//! fork, and every path the child touches is precomputed as a `CString`.
//!
//! Mounts live only in the child's mount namespace, so they disappear with
//! the command. The session directory (overlay upper/work) is the only
//! host-side state and is removed by `close`.

use std::collections::BTreeMap;
use std::ffi::{CStr, CString};
use std::fs::{self, OpenOptions};
use std::io;
use std::os::unix::ffi::OsStrExt;
use std::os::unix::fs::PermissionsExt;
use std::os::unix::process::CommandExt;
use std::path::{Path, PathBuf};
use std::process::{Command, Stdio};
use std::sync::atomic::{AtomicU64, Ordering};
use std::thread;

use nix::mount::{mount, umount2, MntFlags, MsFlags};
use nix::sched::{unshare, CloneFlags};
use nix::sys::prctl;
use nix::sys::signal::Signal;
use nix::sys::statvfs::{statvfs, FsFlags};
use nix::sys::wait::{waitpid, WaitStatus};
use nix::unistd::{chdir, fork, pivot_root, ForkResult};
use tracing::{debug, info, warn};
use walkdir::WalkDir;

use super::probe;
use super::stream::pump;
use super::{CancelHandle, CommandIo, ExitStatus, Mount, RunnerKind, SandboxRunner, SandboxSession};
use crate::config::{BuilderConfig, ShardEntry};
use crate::env::{toolchain_dir, SRCDIR, WORKSPACE};
use crate::error::{SandboxError, SetupFailure};
use crate::image::ImageProvider;
use crate::platform::{Libc, Platform};

static SESSION_COUNTER: AtomicU64 = AtomicU64::new(0);

const PROC_DIR: &str = "/proc";
/// Where the host root sits between `pivot_root` and its detach.
const OLD_ROOT: &str = "/.old-root";

#[derive(Debug, Clone)]
pub struct NamespaceRunner {
    provider: ImageProvider,
    sessions_dir: PathBuf,
    privileged: bool,
    host: Option<Platform>,
}

impl NamespaceRunner {
    pub fn new(config: &BuilderConfig, privileged: bool) -> Self {
        Self {
            provider: ImageProvider::new(config),
            sessions_dir: config.sessions_dir(),
            privileged,
            host: Platform::host().ok(),
        }
    }

    /// Pretend to run on `host` when checking shard compatibility.
    pub fn with_host(mut self, host: Platform) -> Self {
        self.host = Some(host);
        self
    }

    fn setup_error(
        &self,
        platform: &Platform,
        failure: SetupFailure,
        reason: impl Into<String>,
    ) -> SandboxError {
        SandboxError::Setup {
            runner: self.kind(),
            platform: platform.to_string(),
            failure,
            reason: reason.into(),
            fallback: Some(RunnerKind::Virtualized),
        }
    }

    /// The shard's toolchain executes natively here, so the host must be
    /// able to run it. The rootfs brings its own libc; only the machine
    /// and ABI have to agree.
    pub fn check_host(&self, platform: &Platform) -> Result<(), SandboxError> {
        let Some(host) = self.host else {
            return Err(self.setup_error(
                platform,
                SetupFailure::HostIncompatible,
                "cannot identify the host platform",
            ));
        };
        if !host.is_linux() {
            return Err(self.setup_error(
                platform,
                SetupFailure::HostIncompatible,
                format!("namespace sandboxes need a Linux host, this is {}", host.os),
            ));
        }
        let shard_host = self
            .provider
            .shard_host(platform)
            .unwrap_or_else(|| ShardEntry::default().host_platform());
        let native = Platform::linux(host.arch, shard_host.libc.unwrap_or(Libc::Musl));
        if !native.can_run(&shard_host) {
            return Err(self.setup_error(
                platform,
                SetupFailure::HostIncompatible,
                format!("the {platform} toolchain runs on {shard_host}, which a {host} host cannot execute"),
            ));
        }
        Ok(())
    }

    fn new_session_dir(&self) -> Result<PathBuf, SandboxError> {
        let n = SESSION_COUNTER.fetch_add(1, Ordering::SeqCst);
        let dir = self
            .sessions_dir
            .join(format!("ns-{}-{n}", std::process::id()));
        for sub in ["upper", "work", "merged"] {
            fs::create_dir_all(dir.join(sub))
                .map_err(|e| SandboxError::io(format!("creating {}", dir.display()), e))?;
        }
        Ok(dir)
    }
}

impl SandboxRunner for NamespaceRunner {
    fn kind(&self) -> RunnerKind {
        if self.privileged {
            RunnerKind::PrivilegedNamespace
        } else {
            RunnerKind::Namespace
        }
    }

    fn open(
        &self,
        platform: &Platform,
        workspace: &Path,
        mounts: &[Mount],
        env: &BTreeMap<String, String>,
    ) -> Result<Box<dyn SandboxSession>, SandboxError> {
        self.check_host(platform)?;

        if self.privileged {
            if !nix::unistd::geteuid().is_root() {
                return Err(self.setup_error(
                    platform,
                    SetupFailure::PermissionDenied,
                    "the privileged namespace runner must run as root",
                ));
            }
        } else {
            probe::check_user_namespaces().map_err(|reason| {
                self.setup_error(platform, SetupFailure::NamespacesUnavailable, reason)
            })?;
        }
        probe::check_overlay(!self.privileged)
            .map_err(|reason| self.setup_error(platform, SetupFailure::OverlayUnsupported, reason))?;

        let rootfs = self.provider.rootfs_image()?;
        let rootfs_dir = self
            .provider
            .ensure_ready(&rootfs, &self.provider.default_mountpoint(&rootfs))?;
        let shard = self.provider.shard_for(platform)?;
        let shard_dir = self
            .provider
            .ensure_ready(&shard, &self.provider.default_mountpoint(&shard))?;

        let workspace = fs::canonicalize(workspace)
            .map_err(|e| SandboxError::io(format!("resolving workspace {}", workspace.display()), e))?;
        let dir = self.new_session_dir()?;

        info!(
            runner = %self.kind(),
            platform = %platform,
            session = %dir.display(),
            "opened namespace sandbox"
        );
        Ok(Box::new(NamespaceSession {
            kind: self.kind(),
            platform: *platform,
            privileged: self.privileged,
            rootfs: rootfs_dir,
            shard: shard_dir,
            workspace,
            mounts: mounts.to_vec(),
            env: env.clone(),
            dir,
            cancel: CancelHandle::new(),
            closed: false,
        }))
    }
}

pub struct NamespaceSession {
    kind: RunnerKind,
    platform: Platform,
    privileged: bool,
    rootfs: PathBuf,
    shard: PathBuf,
    workspace: PathBuf,
    mounts: Vec<Mount>,
    env: BTreeMap<String, String>,
    dir: PathBuf,
    cancel: CancelHandle,
    closed: bool,
}

impl NamespaceSession {
    /// Guest-side mounts in the order they are stacked.
    fn binds(&self) -> Vec<Bind> {
        let mut binds = vec![
            Bind {
                source: self.shard.clone(),
                target: PathBuf::from(toolchain_dir(&self.platform)),
                read_only: true,
            },
            Bind {
                source: self.workspace.clone(),
                target: PathBuf::from(WORKSPACE),
                read_only: false,
            },
        ];
        binds.extend(self.mounts.iter().map(|m| Bind {
            source: m.host.clone(),
            target: m.guest.clone(),
            read_only: m.read_only,
        }));
        binds.push(Bind {
            source: PathBuf::from("/dev"),
            target: PathBuf::from("/dev"),
            read_only: false,
        });
        binds
    }

    /// Host path that must exist for `guest` to serve as a mount point, or
    /// `None` when it is already there. A target below an earlier bind lives
    /// in that bind's source; anything else goes in the overlay upper layer.
    fn mount_point_stub(&self, earlier: &[Bind], guest: &Path) -> Option<PathBuf> {
        let stub = match earlier
            .iter()
            .rev()
            .find(|outer| guest != outer.target.as_path() && guest.starts_with(&outer.target))
        {
            Some(outer) => outer.source.join(guest.strip_prefix(&outer.target).ok()?),
            None => {
                let relative = guest.strip_prefix("/").unwrap_or(guest);
                if self.rootfs.join(relative).symlink_metadata().is_ok() {
                    return None;
                }
                self.dir.join("upper").join(relative)
            }
        };
        stub.symlink_metadata().is_err().then_some(stub)
    }

    /// Create every mount point and precompute the paths the forked child
    /// needs, so nothing between fork and exec allocates.
    fn plan(&self) -> Result<SandboxPlan, SandboxError> {
        let binds = self.binds();
        for (index, bind) in binds.iter().enumerate() {
            if let Some(stub) = self.mount_point_stub(&binds[..index], &bind.target) {
                create_mount_point(&stub, bind.source.is_dir())?;
            }
        }
        for dir in [PROC_DIR, OLD_ROOT] {
            if let Some(stub) = self.mount_point_stub(&binds, Path::new(dir)) {
                create_mount_point(&stub, true)?;
            }
        }

        let merged = self.dir.join("merged");
        let inside = |guest: &Path| merged.join(guest.strip_prefix("/").unwrap_or(guest));
        let prepared = binds
            .iter()
            .map(|bind| {
                Ok(PreparedBind {
                    source: c_path(&bind.source)?,
                    target: c_path(&inside(&bind.target))?,
                    read_only: bind.read_only,
                })
            })
            .collect::<Result<Vec<_>, SandboxError>>()?;

        let cwd = if self.workspace.join("srcdir").is_dir() {
            SRCDIR
        } else {
            WORKSPACE
        };
        let overlay_options = format!(
            "lowerdir={},upperdir={},workdir={}",
            self.rootfs.display(),
            self.dir.join("upper").display(),
            self.dir.join("work").display()
        );

        let (uid_map, gid_map) = probe::current_user_maps();
        Ok(SandboxPlan {
            privileged: self.privileged,
            uid_map,
            gid_map,
            overlay_options: CString::new(overlay_options)
                .map_err(|e| SandboxError::io("overlay options", e.into()))?,
            proc_dir: c_path(&inside(Path::new(PROC_DIR)))?,
            merged: c_path(&merged)?,
            binds: prepared,
            cwd: c_path(Path::new(cwd))?,
        })
    }

    fn command(&self, program: &str, args: &[&str]) -> Result<Command, SandboxError> {
        let plan = self.plan()?;
        let mut cmd = Command::new(program);
        cmd.args(args).env_clear().envs(&self.env);
        // SAFETY: the closure runs in the forked child before exec; it only
        // reads the precomputed plan and issues namespace, mount and process
        // syscalls.
        unsafe {
            cmd.pre_exec(move || plan.enter());
        }
        Ok(cmd)
    }

    fn ensure_usable(&self) -> Result<(), SandboxError> {
        if self.closed {
            return Err(SandboxError::Protocol("session is closed".to_string()));
        }
        if self.cancel.is_cancelled() {
            return Err(SandboxError::Protocol("session was cancelled".to_string()));
        }
        Ok(())
    }
}

impl SandboxSession for NamespaceSession {
    fn kind(&self) -> RunnerKind {
        self.kind
    }

    fn platform(&self) -> &Platform {
        &self.platform
    }

    fn run(&mut self, command: &str, streams: &mut CommandIo) -> Result<ExitStatus, SandboxError> {
        self.ensure_usable()?;
        debug!(platform = %self.platform, command, "running in namespace sandbox");

        let mut cmd = self.command("/bin/sh", &["-c", command])?;
        cmd.stdin(if streams.stdin.is_some() {
            Stdio::piped()
        } else {
            Stdio::null()
        })
        .stdout(Stdio::piped())
        .stderr(Stdio::piped());

        let mut child = cmd
            .spawn()
            .map_err(|e| SandboxError::io("entering namespace sandbox", e))?;
        self.cancel.track(child.id());

        let child_stdin = child.stdin.take();
        let child_stdout = child.stdout.take();
        let child_stderr = child.stderr.take();
        let stdin_src = streams.stdin.as_mut();
        let out_sink = &mut *streams.stdout;
        let err_sink = &mut *streams.stderr;

        let (status, streamed) = thread::scope(|s| {
            if let (Some(mut pipe), Some(src)) = (child_stdin, stdin_src) {
                s.spawn(move || {
                    let _ = io::copy(src, &mut pipe);
                });
            }
            let out = s.spawn(move || match child_stdout {
                Some(pipe) => pump(pipe, out_sink),
                None => Ok(0),
            });
            let err = s.spawn(move || match child_stderr {
                Some(pipe) => pump(pipe, err_sink),
                None => Ok(0),
            });
            let status = child.wait();
            let streamed = [out.join(), err.join()];
            (status, streamed)
        });
        self.cancel.untrack();

        let status = status.map_err(|e| SandboxError::io("waiting for sandboxed command", e))?;
        for result in streamed {
            match result {
                Ok(Ok(_)) => {}
                Ok(Err(e)) => warn!(error = %e, "lost sandbox output"),
                Err(_) => warn!("output forwarding thread panicked"),
            }
        }
        Ok(ExitStatus::from(status))
    }

    fn shell(&mut self) -> Result<ExitStatus, SandboxError> {
        self.ensure_usable()?;
        let (program, args): (&str, &[&str]) = if self.rootfs.join("bin/bash").exists() {
            ("/bin/bash", &["--login"])
        } else {
            ("/bin/sh", &["-l"])
        };
        let mut child = self
            .command(program, args)?
            .stdin(Stdio::inherit())
            .stdout(Stdio::inherit())
            .stderr(Stdio::inherit())
            .spawn()
            .map_err(|e| SandboxError::io("entering namespace sandbox", e))?;
        self.cancel.track(child.id());
        let status = child.wait();
        self.cancel.untrack();
        status
            .map(ExitStatus::from)
            .map_err(|e| SandboxError::io("waiting for sandbox shell", e))
    }

    fn close(&mut self) -> Result<(), SandboxError> {
        if self.closed {
            return Ok(());
        }
        self.closed = true;
        remove_session_dir(&self.dir)
            .map_err(|e| SandboxError::io(format!("removing {}", self.dir.display()), e))?;
        debug!(session = %self.dir.display(), "closed namespace sandbox");
        Ok(())
    }

    fn cancel_handle(&self) -> CancelHandle {
        self.cancel.clone()
    }
}

impl Drop for NamespaceSession {
    fn drop(&mut self) {
        if let Err(e) = self.close() {
            warn!(error = %e, "namespace session teardown failed");
        }
    }
}

/// Overlay's work directory is left mode 000; make everything removable first.
pub(crate) fn remove_session_dir(dir: &Path) -> io::Result<()> {
    if !dir.exists() {
        return Ok(());
    }
    for entry in WalkDir::new(dir).into_iter().filter_map(Result::ok) {
        if entry.file_type().is_dir() {
            let _ = fs::set_permissions(entry.path(), fs::Permissions::from_mode(0o700));
        }
    }
    fs::remove_dir_all(dir)
}

#[derive(Debug, Clone)]
struct Bind {
    source: PathBuf,
    /// Absolute path inside the sandbox.
    target: PathBuf,
    read_only: bool,
}

/// A bind with both ends resolved to host paths.
#[derive(Debug)]
struct PreparedBind {
    source: CString,
    target: CString,
    read_only: bool,
}

/// Everything the forked child needs, computed before the fork.
#[derive(Debug)]
struct SandboxPlan {
    privileged: bool,
    uid_map: String,
    gid_map: String,
    overlay_options: CString,
    merged: CString,
    binds: Vec<PreparedBind>,
    proc_dir: CString,
    cwd: CString,
}

impl SandboxPlan {
    /// Runs in the child between fork and exec.
    fn enter(&self) -> io::Result<()> {
        let mut flags = CloneFlags::CLONE_NEWNS | CloneFlags::CLONE_NEWPID;
        if !self.privileged {
            flags |= CloneFlags::CLONE_NEWUSER;
        }
        unshare(flags)?;
        if !self.privileged {
            map_current_user(self.uid_map.as_bytes(), self.gid_map.as_bytes())?;
        }

        // The next child is pid 1 of the new PID namespace. This process
        // only relays its exit status.
        match unsafe { fork() }? {
            ForkResult::Parent { child } => relay_exit(child),
            ForkResult::Child => {}
        }

        prctl::set_pdeathsig(Signal::SIGKILL)?;
        self.mount_root()?;
        self.switch_root()
    }

    fn mount_root(&self) -> io::Result<()> {
        mount(
            None::<&str>,
            "/",
            None::<&str>,
            MsFlags::MS_REC | MsFlags::MS_PRIVATE,
            None::<&str>,
        )?;
        mount(
            Some("overlay"),
            self.merged.as_c_str(),
            Some("overlay"),
            MsFlags::empty(),
            Some(self.overlay_options.as_c_str()),
        )?;

        for bind in &self.binds {
            mount(
                Some(bind.source.as_c_str()),
                bind.target.as_c_str(),
                None::<&str>,
                MsFlags::MS_BIND | MsFlags::MS_REC,
                None::<&str>,
            )?;
            if bind.read_only {
                remount_read_only(&bind.target)?;
            }
        }

        mount(
            Some("proc"),
            self.proc_dir.as_c_str(),
            Some("proc"),
            MsFlags::MS_NOSUID | MsFlags::MS_NODEV | MsFlags::MS_NOEXEC,
            None::<&str>,
        )?;
        Ok(())
    }

    /// Make the merged tree the root and detach the host root entirely, so
    /// a nested chroot cannot climb back out.
    fn switch_root(&self) -> io::Result<()> {
        chdir(self.merged.as_c_str())?;
        pivot_root(".", &OLD_ROOT[1..])?;
        chdir("/")?;
        umount2(OLD_ROOT, MntFlags::MNT_DETACH)?;
        unsafe {
            libc::rmdir(c"/.old-root".as_ptr());
        }
        chdir(self.cwd.as_c_str())?;
        Ok(())
    }
}

fn c_path(path: &Path) -> Result<CString, SandboxError> {
    CString::new(path.as_os_str().as_bytes())
        .map_err(|e| SandboxError::io(format!("sandbox path {}", path.display()), e.into()))
}

fn create_mount_point(path: &Path, dir: bool) -> Result<(), SandboxError> {
    let created = if dir {
        fs::create_dir_all(path)
    } else {
        path.parent()
            .map_or(Ok(()), fs::create_dir_all)
            .and_then(|()| OpenOptions::new().create(true).append(true).open(path).map(drop))
    };
    created.map_err(|e| SandboxError::io(format!("creating mount point {}", path.display()), e))
}

/// Write the single-entry uid/gid maps for a fresh user namespace. Safe to
/// call between fork and exec.
pub(crate) fn map_current_user(uid_map: &[u8], gid_map: &[u8]) -> io::Result<()> {
    write_proc(c"/proc/self/setgroups", b"deny")?;
    write_proc(c"/proc/self/uid_map", uid_map)?;
    write_proc(c"/proc/self/gid_map", gid_map)
}

fn write_proc(path: &CStr, contents: &[u8]) -> io::Result<()> {
    let fd = unsafe { libc::open(path.as_ptr(), libc::O_WRONLY | libc::O_CLOEXEC) };
    if fd < 0 {
        return Err(io::Error::last_os_error());
    }
    let written = unsafe { libc::write(fd, contents.as_ptr().cast(), contents.len()) };
    let result = match written {
        n if n < 0 => Err(io::Error::last_os_error()),
        n if n as usize != contents.len() => Err(io::ErrorKind::WriteZero.into()),
        _ => Ok(()),
    };
    unsafe {
        libc::close(fd);
    }
    result
}

/// Bind mounts keep the source's locked flags; a read-only remount must
/// repeat them or the kernel refuses it inside a user namespace.
fn remount_read_only(target: &CStr) -> io::Result<()> {
    let locked = statvfs(target).map(|s| s.flags()).unwrap_or(FsFlags::empty());
    let mut flags = MsFlags::MS_BIND | MsFlags::MS_REMOUNT | MsFlags::MS_RDONLY;
    for (fs_flag, ms_flag) in [
        (FsFlags::ST_NOSUID, MsFlags::MS_NOSUID),
        (FsFlags::ST_NODEV, MsFlags::MS_NODEV),
        (FsFlags::ST_NOEXEC, MsFlags::MS_NOEXEC),
        (FsFlags::ST_NOATIME, MsFlags::MS_NOATIME),
        (FsFlags::ST_NODIRATIME, MsFlags::MS_NODIRATIME),
        (FsFlags::ST_RELATIME, MsFlags::MS_RELATIME),
    ] {
        if locked.contains(fs_flag) {
            flags |= ms_flag;
        }
    }
    mount(None::<&str>, target, None::<&str>, flags, None::<&str>)?;
    Ok(())
}

/// Wait for pid 1 and leave with the same status. Never returns.
fn relay_exit(child: nix::unistd::Pid) -> ! {
    close_inherited_fds();
    let status = loop {
        match waitpid(child, None) {
            Ok(WaitStatus::Exited(_, code)) => break Ok(code),
            Ok(WaitStatus::Signaled(_, signal, _)) => break Err(signal),
            Ok(_) => continue,
            Err(nix::errno::Errno::EINTR) => continue,
            Err(_) => break Ok(127),
        }
    };
    unsafe {
        match status {
            Ok(code) => libc::_exit(code),
            Err(signal) => {
                libc::signal(signal as libc::c_int, libc::SIG_DFL);
                libc::raise(signal as libc::c_int);
                libc::_exit(128 + signal as libc::c_int)
            }
        }
    }
}

/// The relay must not hold the spawn error pipe open while pid 1 runs, or
/// the parent's spawn would block until the command finished.
fn close_inherited_fds() {
    let max = unsafe { libc::sysconf(libc::_SC_OPEN_MAX) };
    let max = if max <= 0 { 1024 } else { max.min(65_536) as libc::c_int };
    for fd in 3..max {
        unsafe {
            libc::close(fd);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ShardEntry;
    use crate::platform::Arch;
    use crate::runner::SharedBuffer;
    use std::io::Write;
    use std::sync::{Arc, Mutex};
    use std::time::{Duration, Instant};
    use tempfile::TempDir;

    fn config_with_shard_host(root: &Path, host: Platform) -> BuilderConfig {
        let mut config = BuilderConfig::with_root(root);
        config.images.shards.insert(
            "aarch64-linux-gnu".to_string(),
            ShardEntry {
                tarball: Some("ab".repeat(32)),
                squashfs: None,
                host: Some(host),
            },
        );
        config
    }

    #[test]
    fn foreign_toolchain_is_refused_before_any_setup() {
        let tmp = TempDir::new().unwrap();
        let config = config_with_shard_host(tmp.path(), Platform::linux(Arch::Aarch64, Libc::Musl));
        let runner = NamespaceRunner::new(&config, false)
            .with_host(Platform::linux(Arch::X86_64, Libc::Glibc));
        let target: Platform = "aarch64-linux-gnu".parse().unwrap();

        let err = match runner.open(&target, tmp.path(), &[], &BTreeMap::new()) {
            Err(e) => e,
            Ok(_) => panic!("x86_64 host accepted an aarch64 toolchain"),
        };
        match &err {
            SandboxError::Setup {
                runner,
                failure,
                fallback,
                ..
            } => {
                assert_eq!(*runner, RunnerKind::Namespace);
                assert_eq!(*failure, SetupFailure::HostIncompatible);
                assert_eq!(*fallback, Some(RunnerKind::Virtualized));
            }
            other => panic!("unexpected error {other}"),
        }
        assert!(err.to_string().contains("try the virtualized runner"));
        assert!(!config.sessions_dir().exists());
    }

    #[test]
    fn default_shard_host_runs_on_x86_64() {
        let tmp = TempDir::new().unwrap();
        let config = BuilderConfig::with_root(tmp.path());
        let target: Platform = "aarch64-linux-gnu".parse().unwrap();

        let x86 = NamespaceRunner::new(&config, false)
            .with_host(Platform::linux(Arch::X86_64, Libc::Glibc));
        assert!(x86.check_host(&target).is_ok());

        let arm = NamespaceRunner::new(&config, false)
            .with_host(Platform::linux(Arch::Aarch64, Libc::Glibc));
        assert!(arm.check_host(&target).is_err());

        let mac = NamespaceRunner::new(&config, false).with_host(Platform::macos(Arch::X86_64));
        assert!(mac.check_host(&target).is_err());
    }

    #[test]
    fn privileged_kind() {
        let tmp = TempDir::new().unwrap();
        let config = BuilderConfig::with_root(tmp.path());
        assert_eq!(
            NamespaceRunner::new(&config, true).kind(),
            RunnerKind::PrivilegedNamespace
        );
    }

    #[test]
    fn session_dir_removal_handles_locked_dirs() {
        let tmp = TempDir::new().unwrap();
        let dir = tmp.path().join("ns-1");
        fs::create_dir_all(dir.join("work/work")).unwrap();
        fs::set_permissions(dir.join("work/work"), fs::Permissions::from_mode(0o000)).unwrap();
        remove_session_dir(&dir).unwrap();
        assert!(!dir.exists());
        remove_session_dir(&dir).unwrap();
    }

    #[test]
    fn plan_layout() {
        let tmp = TempDir::new().unwrap();
        let rootfs = tmp.path().join("rootfs");
        fs::create_dir_all(rootfs.join("proc")).unwrap();
        let shard = tmp.path().join("shard");
        fs::create_dir_all(&shard).unwrap();
        let workspace = tmp.path().join("ws");
        fs::create_dir_all(workspace.join("srcdir")).unwrap();
        let data = tmp.path().join("data");
        fs::create_dir_all(&data).unwrap();
        let settings = tmp.path().join("settings.toml");
        fs::write(&settings, "").unwrap();
        let dir = tmp.path().join("sessions/ns-1-0");

        let session = NamespaceSession {
            kind: RunnerKind::Namespace,
            platform: "x86_64-linux-musl".parse().unwrap(),
            privileged: false,
            rootfs: rootfs.clone(),
            shard,
            workspace: workspace.clone(),
            mounts: vec![
                Mount::read_only(&data, "/data"),
                Mount::read_only(&settings, "/workspace/srcdir/settings.toml"),
            ],
            env: BTreeMap::new(),
            dir: dir.clone(),
            cancel: CancelHandle::new(),
            closed: true,
        };

        let targets: Vec<_> = session.binds().into_iter().map(|b| b.target).collect();
        assert_eq!(
            targets,
            vec![
                PathBuf::from("/opt/x86_64-linux-musl"),
                PathBuf::from("/workspace"),
                PathBuf::from("/data"),
                PathBuf::from("/workspace/srcdir/settings.toml"),
                PathBuf::from("/dev"),
            ]
        );

        let plan = session.plan().unwrap();
        assert_eq!(
            plan.overlay_options.to_str().unwrap(),
            format!(
                "lowerdir={},upperdir={},workdir={}",
                rootfs.display(),
                dir.join("upper").display(),
                dir.join("work").display()
            )
        );
        assert!(plan.binds[0].read_only);
        assert_eq!(
            plan.binds[3].target.to_str().unwrap(),
            dir.join("merged/workspace/srcdir/settings.toml").to_str().unwrap()
        );
        assert_eq!(plan.cwd.to_str().unwrap(), SRCDIR);

        // Missing mount points land in the upper layer, nested ones in the
        // enclosing bind's source, and existing rootfs entries are left alone.
        let upper = dir.join("upper");
        for made in ["opt/x86_64-linux-musl", "workspace", "data", "dev", ".old-root"] {
            assert!(upper.join(made).is_dir(), "{made} was not created");
        }
        assert!(!upper.join("proc").exists());
        assert!(workspace.join("srcdir/settings.toml").is_file());
        assert!(!upper.join("workspace/srcdir").exists());

        session.plan().unwrap();
    }

    /// Records when the first byte arrived.
    #[derive(Clone, Default)]
    struct FirstWrite {
        at: Arc<Mutex<Option<Instant>>>,
        buf: SharedBuffer,
    }

    impl Write for FirstWrite {
        fn write(&mut self, data: &[u8]) -> io::Result<usize> {
            self.at.lock().unwrap().get_or_insert_with(Instant::now);
            self.buf.write(data)
        }

        fn flush(&mut self) -> io::Result<()> {
            Ok(())
        }
    }

    /// A live session whose rootfs borrows the host's userland through
    /// read-only binds, or `None` when this machine cannot sandbox.
    fn host_userland_session(root: &Path) -> Option<NamespaceSession> {
        for check in [probe::check_user_namespaces(), probe::check_overlay(true)] {
            if let Err(reason) = check {
                eprintln!("skipping namespace session test: {reason}");
                return None;
            }
        }

        let rootfs = root.join("rootfs");
        fs::create_dir_all(&rootfs).unwrap();
        let mut mounts = Vec::new();
        for top in ["bin", "sbin", "lib", "lib32", "lib64", "usr"] {
            let host = Path::new("/").join(top);
            let Ok(meta) = host.symlink_metadata() else {
                continue;
            };
            if meta.file_type().is_symlink() {
                std::os::unix::fs::symlink(fs::read_link(&host).unwrap(), rootfs.join(top))
                    .unwrap();
            } else if meta.is_dir() {
                mounts.push(Mount::read_only(&host, format!("/{top}")));
            }
        }

        let shard = root.join("shard");
        let workspace = root.join("ws");
        let dir = root.join("sessions/ns-test");
        for made in [&shard, &workspace] {
            fs::create_dir_all(made).unwrap();
        }
        for layer in ["upper", "work", "merged"] {
            fs::create_dir_all(dir.join(layer)).unwrap();
        }

        let mut session = NamespaceSession {
            kind: RunnerKind::Namespace,
            platform: "x86_64-linux-musl".parse().unwrap(),
            privileged: false,
            rootfs,
            shard,
            workspace,
            mounts,
            env: BTreeMap::from([("PATH".to_string(), "/usr/bin:/bin".to_string())]),
            dir,
            cancel: CancelHandle::new(),
            closed: false,
        };
        let mut quiet = CommandIo::new(io::sink(), io::sink());
        match session.run("true", &mut quiet) {
            Ok(status) if status.success() => Some(session),
            other => {
                eprintln!("skipping namespace session test: {other:?}");
                None
            }
        }
    }

    #[test]
    fn nested_chroot_cannot_reach_host_root() {
        let tmp = TempDir::new().unwrap();
        let Some(session) = host_userland_session(tmp.path()) else {
            return;
        };
        let marker = tmp.path().join("host-only");
        fs::write(&marker, "").unwrap();

        let script = format!("test -e {} && echo escaped || echo confined", marker.display());
        let mut cmd = session.command("/bin/sh", &["-c", &script]).unwrap();
        // Root inside the sandbox may chroot again; walking `..` from a cwd
        // outside that chroot must stop at the sandbox root.
        unsafe {
            cmd.pre_exec(|| {
                libc::mkdir(c"/nested".as_ptr(), 0o700);
                if libc::chroot(c"/nested".as_ptr()) != 0 {
                    return Err(io::Error::last_os_error());
                }
                for _ in 0..64 {
                    libc::chdir(c"..".as_ptr());
                }
                libc::chroot(c".".as_ptr());
                Ok(())
            });
        }
        let output = cmd.stdin(Stdio::null()).stderr(Stdio::null()).output().unwrap();
        assert_eq!(String::from_utf8_lossy(&output.stdout), "confined\n");
    }

    #[test]
    fn output_streams_while_the_command_runs() {
        let tmp = TempDir::new().unwrap();
        let Some(mut session) = host_userland_session(tmp.path()) else {
            return;
        };
        let stdout = FirstWrite::default();
        let mut streams = CommandIo::new(stdout.clone(), io::sink());

        let start = Instant::now();
        let status = session
            .run("echo first; sleep 1; echo second", &mut streams)
            .unwrap();
        let finished = start.elapsed();

        assert!(status.success());
        assert_eq!(stdout.buf.to_string_lossy(), "first\nsecond\n");
        let first_at = stdout.at.lock().unwrap().unwrap().duration_since(start);
        assert!(
            first_at + Duration::from_millis(500) < finished,
            "first line arrived after {first_at:?}, command took {finished:?}"
        );
    }

    #[test]
    fn close_twice_leaves_nothing_behind() {
        let tmp = TempDir::new().unwrap();
        let Some(mut session) = host_userland_session(tmp.path()) else {
            return;
        };
        let mut quiet = CommandIo::new(io::sink(), io::sink());
        assert!(session.run("touch /scratch", &mut quiet).unwrap().success());
        let dir = session.dir.clone();
        assert!(dir.join("upper/scratch").exists());

        session.close().unwrap();
        session.close().unwrap();

        assert!(!dir.exists());
        let mountinfo = fs::read_to_string("/proc/self/mountinfo").unwrap();
        assert!(!mountinfo.contains(dir.to_str().unwrap()));
        assert!(session.run("true", &mut quiet).is_err());
    }
}
