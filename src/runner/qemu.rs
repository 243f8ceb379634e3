//! Virtual machine sandbox.
//!
//! Boots `<qemu_dir>/vmlinuz` with `init=/bin/sh` on the serial console.
//! The rootfs and shard squashfs images are attached read-only as virtio
//! disks; the workspace and extra mounts are 9p shares. A bootstrap typed
//! into the console builds an overlay root in guest tmpfs, mounts the
//! shares and chroots into it. Commands are written as scripts into the
//! workspace and started over the console; their stderr is tagged per line
//! and the exit code comes back behind a per-command marker.

use std::collections::hash_map::RandomState;
use std::collections::BTreeMap;
use std::fs;
use std::hash::BuildHasher;
use std::io::{self, BufRead, BufReader, Read, Write};
use std::path::{Path, PathBuf};
use std::process::{Child, ChildStdin, Command, Stdio};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::mpsc::{self, Receiver, RecvTimeoutError};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::{Duration, Instant};

use tracing::{debug, info, warn};

use super::stream::{classify_console_line, exit_marker, ConsoleLine, STDERR_TAG};
use super::{CancelHandle, CommandIo, ExitStatus, Mount, RunnerKind, SandboxRunner, SandboxSession};
use crate::config::{BuilderConfig, QemuSettings, ShardEntry};
use crate::env::{toolchain_dir, SRCDIR, WORKSPACE};
use crate::error::{SandboxError, SetupFailure};
use crate::image::{ImageEncoding, ImageProvider};
use crate::platform::{Arch, Platform};

/// Console output that means the guest will never reach a shell.
pub const BOOT_FAILURE_PATTERNS: &[&str] = &[
    "Kernel panic",
    "not syncing",
    "VFS: Cannot open root device",
    "No init found",
    "can't find /init",
    "SQUASHFS error",
    "failed to mount",
    "No bootable device",
    "Boot Failed",
];

/// Lines of console output kept for error messages.
const CONTEXT_LINES: usize = 30;

static SESSION_COUNTER: AtomicU64 = AtomicU64::new(0);

#[derive(Debug, Clone)]
struct Share {
    tag: String,
    path: PathBuf,
    read_only: bool,
}

/// Builder for the `qemu-system-*` command line.
#[derive(Debug, Clone)]
pub struct QemuBuilder {
    arch: Arch,
    kernel: PathBuf,
    append: String,
    memory_mb: u32,
    cpus: u32,
    kvm: bool,
    drives: Vec<PathBuf>,
    shares: Vec<Share>,
}

impl QemuBuilder {
    pub fn new(arch: Arch, kernel: impl Into<PathBuf>) -> Self {
        Self {
            arch,
            kernel: kernel.into(),
            append: String::new(),
            memory_mb: 2048,
            cpus: 1,
            kvm: false,
            drives: Vec::new(),
            shares: Vec::new(),
        }
    }

    pub fn memory_mb(mut self, memory_mb: u32) -> Self {
        self.memory_mb = memory_mb;
        self
    }

    pub fn cpus(mut self, cpus: u32) -> Self {
        self.cpus = cpus;
        self
    }

    pub fn kvm(mut self, enabled: bool) -> Self {
        self.kvm = enabled;
        self
    }

    pub fn append(mut self, cmdline: impl Into<String>) -> Self {
        self.append = cmdline.into();
        self
    }

    /// Attach a read-only raw virtio disk. The first one is `/dev/vda`.
    pub fn drive(mut self, path: impl Into<PathBuf>) -> Self {
        self.drives.push(path.into());
        self
    }

    /// Export a host directory over 9p.
    pub fn share(mut self, tag: &str, path: impl Into<PathBuf>, read_only: bool) -> Self {
        self.shares.push(Share {
            tag: tag.to_string(),
            path: path.into(),
            read_only,
        });
        self
    }

    pub fn program(&self) -> String {
        format!("qemu-system-{}", self.arch.qemu_system_name())
    }

    pub fn build(&self) -> Command {
        let mut cmd = Command::new(self.program());
        let (machine, cpu) = match self.arch {
            Arch::X86_64 | Arch::I686 => (None, None),
            Arch::Aarch64 => (Some("virt"), Some("cortex-a57")),
            Arch::Armv7l => (Some("virt"), Some("cortex-a15")),
            Arch::Ppc64le => (Some("pseries"), None),
        };
        if let Some(machine) = machine {
            cmd.args(["-machine", machine]);
        }
        if self.kvm {
            cmd.args(["-enable-kvm", "-cpu", "host"]);
        } else if let Some(cpu) = cpu {
            cmd.args(["-cpu", cpu]);
        }

        cmd.args(["-smp", &self.cpus.to_string()]);
        cmd.args(["-m", &format!("{}M", self.memory_mb)]);
        cmd.arg("-kernel").arg(&self.kernel);
        cmd.args(["-append", &self.append]);

        for drive in &self.drives {
            let spec = format!("file={},format=raw,if=virtio,readonly=on", drive.display());
            cmd.args(["-drive", &spec]);
        }
        for share in &self.shares {
            let mut spec = format!(
                "local,path={},mount_tag={},security_model=none,id={}",
                share.path.display(),
                share.tag,
                share.tag
            );
            if share.read_only {
                spec.push_str(",readonly=on");
            }
            cmd.args(["-virtfs", &spec]);
        }

        // Headless, serial console on stdio, no network.
        cmd.args(["-nographic", "-serial", "stdio", "-monitor", "none"]);
        cmd.args(["-nic", "none", "-no-reboot"]);
        cmd
    }
}

/// Kernel console device for `arch`.
pub fn console_device(arch: Arch) -> &'static str {
    match arch {
        Arch::X86_64 | Arch::I686 => "ttyS0",
        Arch::Aarch64 | Arch::Armv7l => "ttyAMA0",
        Arch::Ppc64le => "hvc0",
    }
}

#[derive(Debug, Clone)]
pub struct QemuRunner {
    provider: ImageProvider,
    settings: QemuSettings,
    qemu_dir: PathBuf,
}

impl QemuRunner {
    pub fn new(config: &BuilderConfig) -> Self {
        Self {
            provider: ImageProvider::new(config),
            settings: config.qemu.clone(),
            qemu_dir: config.qemu_dir(),
        }
    }

    fn setup_error(
        &self,
        platform: &Platform,
        failure: SetupFailure,
        reason: impl Into<String>,
    ) -> SandboxError {
        SandboxError::Setup {
            runner: RunnerKind::Virtualized,
            platform: platform.to_string(),
            failure,
            reason: reason.into(),
            fallback: None,
        }
    }

    /// Kernel image for `arch`: `vmlinuz-<qemu arch>` or plain `vmlinuz`.
    pub fn kernel_for(&self, arch: Arch) -> Option<PathBuf> {
        [
            self.qemu_dir
                .join(format!("vmlinuz-{}", arch.qemu_system_name())),
            self.qemu_dir.join("vmlinuz"),
        ]
        .into_iter()
        .find(|p| p.is_file())
    }
}

impl SandboxRunner for QemuRunner {
    fn kind(&self) -> RunnerKind {
        RunnerKind::Virtualized
    }

    fn open(
        &self,
        platform: &Platform,
        workspace: &Path,
        mounts: &[Mount],
        env: &BTreeMap<String, String>,
    ) -> Result<Box<dyn SandboxSession>, SandboxError> {
        // The guest runs the toolchain natively, so emulate its host machine.
        let vm_arch = self
            .provider
            .shard_host(platform)
            .unwrap_or_else(|| ShardEntry::default().host_platform())
            .arch;

        let Some(kernel) = self.kernel_for(vm_arch) else {
            return Err(self.setup_error(
                platform,
                SetupFailure::ToolMissing,
                format!("no guest kernel (vmlinuz) in {}", self.qemu_dir.display()),
            ));
        };
        let mut builder = QemuBuilder::new(vm_arch, kernel);
        if which::which(builder.program()).is_err() {
            return Err(self.setup_error(
                platform,
                SetupFailure::ToolMissing,
                format!("{} not found in PATH", builder.program()),
            ));
        }

        let rootfs = self
            .provider
            .blob(&self.provider.rootfs_image_as(ImageEncoding::Squashfs)?)?;
        let shard = self
            .provider
            .blob(&self.provider.shard_as(platform, ImageEncoding::Squashfs)?)?;

        let workspace = fs::canonicalize(workspace)
            .map_err(|e| SandboxError::io(format!("resolving workspace {}", workspace.display()), e))?;
        let n = SESSION_COUNTER.fetch_add(1, Ordering::SeqCst);
        let control_name = format!("vm-{}-{n}", std::process::id());
        let control_dir = workspace.join(".cross-builder").join(&control_name);
        fs::create_dir_all(&control_dir)
            .map_err(|e| SandboxError::io(format!("creating {}", control_dir.display()), e))?;

        let host_arch = Platform::host().ok().map(|h| h.arch);
        let kvm = Path::new("/dev/kvm").exists() && host_arch == Some(vm_arch);
        builder = builder
            .memory_mb(self.settings.memory_mb)
            .cpus(self.settings.cpus)
            .kvm(kvm)
            .append(format!(
                "console={} root=/dev/vda rootfstype=squashfs ro init=/bin/sh panic=-1 quiet",
                console_device(vm_arch)
            ))
            .drive(&rootfs)
            .drive(&shard)
            .share("workspace", &workspace, false);
        for (index, mount) in mounts.iter().enumerate() {
            builder = builder.share(&format!("mount{index}"), &mount.host, mount.read_only);
        }

        let mut cmd = builder.build();
        cmd.stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());
        let mut child = match cmd.spawn() {
            Ok(child) => child,
            Err(e) => {
                let _ = fs::remove_dir_all(&control_dir);
                return Err(self.setup_error(
                    platform,
                    SetupFailure::ToolMissing,
                    format!("failed to start {}: {e}", builder.program()),
                ));
            }
        };
        info!(platform = %platform, arch = %vm_arch, kvm, "booting sandbox virtual machine");

        let (stdin, lines) = match attach_console(&mut child) {
            Ok(io) => io,
            Err(e) => {
                let _ = child.kill();
                let _ = child.wait();
                let _ = fs::remove_dir_all(&control_dir);
                return Err(e);
            }
        };

        let mut session = QemuSession {
            platform: *platform,
            child,
            stdin: Arc::new(Mutex::new(stdin)),
            lines,
            workspace,
            control_dir,
            control_guest: format!("{WORKSPACE}/.cross-builder/{control_name}"),
            env: env.clone(),
            commands: 0,
            grace: Duration::from_secs(self.settings.shutdown_grace_secs),
            cancel: CancelHandle::new(),
            closed: false,
        };

        let bootstrap = bootstrap_script(platform, mounts);
        let boot_timeout = Duration::from_secs(self.settings.boot_timeout_secs);
        if let Err(reason) = session.boot(&bootstrap, boot_timeout) {
            let _ = session.close();
            return Err(self.setup_error(platform, SetupFailure::BootFailed, reason));
        }
        Ok(Box::new(session))
    }
}

/// Take the VM's stdio and start the console reader threads.
fn attach_console(child: &mut Child) -> Result<(ChildStdin, Receiver<String>), SandboxError> {
    let stdin = child
        .stdin
        .take()
        .ok_or_else(|| SandboxError::Protocol("qemu stdin not captured".to_string()))?;
    let stdout = child
        .stdout
        .take()
        .ok_or_else(|| SandboxError::Protocol("qemu stdout not captured".to_string()))?;

    if let Some(stderr) = child.stderr.take() {
        thread::spawn(move || {
            for line in BufReader::new(stderr).lines().map_while(Result::ok) {
                debug!(target: "cross_builder::qemu", "{line}");
            }
        });
    }

    let (tx, rx) = mpsc::channel();
    thread::spawn(move || {
        let mut reader = BufReader::new(stdout);
        let mut buf = Vec::new();
        loop {
            buf.clear();
            match reader.read_until(b'\n', &mut buf) {
                Ok(0) | Err(_) => break,
                Ok(_) => {
                    let line = String::from_utf8_lossy(&buf);
                    let line = line.trim_end_matches(['\n', '\r']).to_string();
                    if tx.send(line).is_err() {
                        break;
                    }
                }
            }
        }
    });
    Ok((stdin, rx))
}

/// Console input that turns the bare guest into the sandbox layout.
fn bootstrap_script(platform: &Platform, mounts: &[Mount]) -> Vec<String> {
    let root = "/tmp/sandbox";
    let p9 = "-t 9p -o trans=virtio,version=9p2000.L,msize=262144";
    let mut lines = vec![
        "stty -echo 2>/dev/null".to_string(),
        "mount -t proc proc /proc".to_string(),
        "mount -t tmpfs sandbox /tmp".to_string(),
        format!("mkdir -p /tmp/upper /tmp/work {root}"),
        format!("mount -t overlay overlay -o lowerdir=/,upperdir=/tmp/upper,workdir=/tmp/work {root}"),
        format!("mkdir -p {root}{opt} && mount -t squashfs -o ro /dev/vdb {root}{opt}", opt = toolchain_dir(platform)),
        format!("mkdir -p {root}{WORKSPACE} && mount {p9} workspace {root}{WORKSPACE}"),
    ];
    for (index, mount) in mounts.iter().enumerate() {
        let guest = mount.guest.display();
        let ro = if mount.read_only { ",ro" } else { "" };
        lines.push(format!(
            "mkdir -p {root}{guest} && mount {p9}{ro} mount{index} {root}{guest}"
        ));
    }
    lines.extend([
        format!("mount -t proc proc {root}/proc"),
        format!("mount -t sysfs sysfs {root}/sys"),
        format!("mount -t devtmpfs devtmpfs {root}/dev"),
        format!("exec chroot {root} /bin/sh"),
        "stty -echo 2>/dev/null".to_string(),
        // Split so the marker never appears in echoed input.
        "echo ___SANDBOX_''READY___".to_string(),
    ]);
    lines
}

/// Single-quote `value` for the guest shell.
fn shell_quote(value: &str) -> String {
    format!("'{}'", value.replace('\'', r"'\''"))
}

/// Script run inside the guest for one command.
fn command_script(env: &BTreeMap<String, String>, command: &str) -> String {
    let mut script = String::from("#!/bin/sh\n");
    for (key, value) in env {
        script.push_str(&format!("export {key}={}\n", shell_quote(value)));
    }
    script.push_str(&format!("cd {SRCDIR} 2>/dev/null || cd {WORKSPACE}\n"));
    script.push_str(command);
    script.push('\n');
    script
}

/// Console line that runs a script with stderr tagged and reports its exit code.
fn launch_line(script: &str, stdin: &str, nonce: &str) -> String {
    let fifo = "/tmp/.sandbox-stderr";
    format!(
        "rm -f {fifo}; mkfifo {fifo}; sed -u 's/^/{STDERR_TAG}/' <{fifo} >&1 & \
         sh {script} <{stdin} 2>{fifo}; rc=$?; wait; {}",
        echo_exit(nonce)
    )
}

/// Report `$rc` behind the nonce's exit marker, split so the marker never
/// appears in echoed input.
fn echo_exit(nonce: &str) -> String {
    format!("echo ___SANDBOX_''EXIT_{nonce}___ $rc")
}

/// Forward console lines to `streams` until `marker` reports an exit code.
/// `None` means the console closed first.
fn forward_until_exit(
    lines: &Receiver<String>,
    marker: &str,
    streams: &mut CommandIo,
) -> Option<i32> {
    for line in lines.iter() {
        let written = match classify_console_line(&line, Some(marker)) {
            ConsoleLine::Stdout(text) => {
                writeln!(streams.stdout, "{text}").and_then(|()| streams.stdout.flush())
            }
            ConsoleLine::Stderr(text) => {
                writeln!(streams.stderr, "{text}").and_then(|()| streams.stderr.flush())
            }
            ConsoleLine::Exit(code) => return Some(code),
            ConsoleLine::Ready => Ok(()),
        };
        if let Err(e) = written {
            warn!(error = %e, "lost sandbox output");
        }
    }
    None
}

pub struct QemuSession {
    platform: Platform,
    child: Child,
    stdin: Arc<Mutex<ChildStdin>>,
    lines: Receiver<String>,
    workspace: PathBuf,
    control_dir: PathBuf,
    control_guest: String,
    env: BTreeMap<String, String>,
    commands: u64,
    grace: Duration,
    cancel: CancelHandle,
    closed: bool,
}

impl QemuSession {
    fn send(&self, line: &str) -> Result<(), SandboxError> {
        let mut stdin = self.stdin.lock().unwrap_or_else(|e| e.into_inner());
        writeln!(stdin, "{line}")
            .and_then(|()| stdin.flush())
            .map_err(|e| SandboxError::io("writing to guest console", e))
    }

    /// Type the bootstrap and wait for the ready marker.
    fn boot(&mut self, bootstrap: &[String], timeout: Duration) -> Result<(), String> {
        for line in bootstrap {
            self.send(line).map_err(|e| e.to_string())?;
        }

        let start = Instant::now();
        let mut context: Vec<String> = Vec::new();
        loop {
            let remaining = timeout.saturating_sub(start.elapsed());
            if remaining.is_zero() {
                return Err(format!(
                    "guest did not become ready in {}s\n\nLast output:\n{}",
                    timeout.as_secs(),
                    context.join("\n")
                ));
            }
            match self.lines.recv_timeout(remaining.min(Duration::from_millis(500))) {
                Ok(line) => {
                    if let Some(pattern) = BOOT_FAILURE_PATTERNS.iter().find(|p| line.contains(*p)) {
                        context.push(line.clone());
                        return Err(format!(
                            "guest boot failed ({pattern})\n\nContext:\n{}",
                            context.join("\n")
                        ));
                    }
                    if classify_console_line(&line, None) == ConsoleLine::Ready {
                        debug!(platform = %self.platform, elapsed = ?start.elapsed(), "guest ready");
                        return Ok(());
                    }
                    context.push(line);
                    if context.len() > CONTEXT_LINES {
                        context.remove(0);
                    }
                }
                Err(RecvTimeoutError::Timeout) => continue,
                Err(RecvTimeoutError::Disconnected) => {
                    return Err(format!(
                        "qemu exited during boot\n\nLast output:\n{}",
                        context.join("\n")
                    ));
                }
            }
        }
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

    /// Fresh per-command nonce the guest cannot predict.
    fn nonce(&self) -> String {
        let seed = (std::process::id(), self.commands);
        format!("{:016x}", RandomState::new().hash_one(seed))
    }

    /// Forward console output until the command's exit marker.
    fn collect(
        &mut self,
        nonce: &str,
        streams: &mut CommandIo,
    ) -> Result<ExitStatus, SandboxError> {
        self.cancel.track(self.child.id());
        let exit = forward_until_exit(&self.lines, &exit_marker(nonce), streams);
        self.cancel.untrack();
        match exit {
            Some(code) => Ok(ExitStatus::from_code(code)),
            None if self.cancel.is_cancelled() => Ok(ExitStatus::killed(libc::SIGKILL)),
            None => Err(SandboxError::Protocol(
                "virtual machine exited while a command was running".to_string(),
            )),
        }
    }
}

impl SandboxSession for QemuSession {
    fn kind(&self) -> RunnerKind {
        RunnerKind::Virtualized
    }

    fn platform(&self) -> &Platform {
        &self.platform
    }

    fn run(&mut self, command: &str, streams: &mut CommandIo) -> Result<ExitStatus, SandboxError> {
        self.ensure_usable()?;
        self.commands += 1;
        let n = self.commands;

        let script_name = format!("cmd-{n}.sh");
        let script_path = self.control_dir.join(&script_name);
        fs::write(&script_path, command_script(&self.env, command))
            .map_err(|e| SandboxError::io(format!("writing {}", script_path.display()), e))?;

        let stdin_guest = match streams.stdin.as_mut() {
            Some(reader) => {
                let path = self.control_dir.join(format!("stdin-{n}"));
                let mut data = Vec::new();
                reader
                    .read_to_end(&mut data)
                    .map_err(|e| SandboxError::io("reading command stdin", e))?;
                fs::write(&path, data)
                    .map_err(|e| SandboxError::io(format!("writing {}", path.display()), e))?;
                format!("{}/stdin-{n}", self.control_guest)
            }
            None => "/dev/null".to_string(),
        };

        debug!(platform = %self.platform, command, "running in virtual machine");
        let nonce = self.nonce();
        self.send(&launch_line(
            &format!("{}/{script_name}", self.control_guest),
            &stdin_guest,
            &nonce,
        ))?;
        self.collect(&nonce, streams)
    }

    fn shell(&mut self) -> Result<ExitStatus, SandboxError> {
        self.ensure_usable()?;
        let stdin = Arc::clone(&self.stdin);
        // Forward the caller's terminal line by line; the thread ends with
        // the caller's stdin or the VM's.
        thread::spawn(move || {
            for line in io::stdin().lock().lines().map_while(Result::ok) {
                let mut guest = stdin.lock().unwrap_or_else(|e| e.into_inner());
                if writeln!(guest, "{line}").and_then(|()| guest.flush()).is_err() {
                    break;
                }
            }
        });
        self.commands += 1;
        let nonce = self.nonce();
        self.send(&format!(
            "stty echo; cd {WORKSPACE}; sh -l; rc=$?; stty -echo; {}",
            echo_exit(&nonce)
        ))?;
        let mut streams = CommandIo::inherit();
        self.collect(&nonce, &mut streams)
    }

    fn close(&mut self) -> Result<(), SandboxError> {
        if self.closed {
            return Ok(());
        }
        self.closed = true;

        if matches!(self.child.try_wait(), Ok(None)) {
            let _ = self.send("sync; echo o > /proc/sysrq-trigger");
            let deadline = Instant::now() + self.grace;
            while Instant::now() < deadline {
                if !matches!(self.child.try_wait(), Ok(None)) {
                    break;
                }
                thread::sleep(Duration::from_millis(100));
            }
            if matches!(self.child.try_wait(), Ok(None)) {
                warn!(platform = %self.platform, "guest ignored poweroff, killing qemu");
                let _ = self.child.kill();
            }
        }
        let _ = self.child.wait();

        if self.control_dir.exists() {
            fs::remove_dir_all(&self.control_dir).map_err(|e| {
                SandboxError::io(format!("removing {}", self.control_dir.display()), e)
            })?;
        }
        let parent = self.workspace.join(".cross-builder");
        let _ = fs::remove_dir(parent);
        debug!(platform = %self.platform, "closed virtual machine sandbox");
        Ok(())
    }

    fn cancel_handle(&self) -> CancelHandle {
        self.cancel.clone()
    }
}

impl Drop for QemuSession {
    fn drop(&mut self) {
        if let Err(e) = self.close() {
            warn!(error = %e, "virtual machine teardown failed");
        }
    }
}
