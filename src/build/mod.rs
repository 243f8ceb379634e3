//! Build orchestration.
//!
//! [`autobuild`] runs one build request for every requested platform: a
//! fresh workspace, sources copied in, the script run in a sandbox, then
//! the linkage audit and the product checks against the prefix. A
//! platform's failure never stops the others.
//!
//! - [`products`] - declared products and how they are located
//! - [`workspace`] - per-platform directories and source materialization

pub mod products;
pub mod workspace;

use std::collections::BTreeMap;
use std::fs::{self, File};
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::mpsc::{self, RecvTimeoutError};
use std::sync::Mutex;
use std::thread;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use serde::{Deserialize, Serialize};
use time::OffsetDateTime;
use tracing::{info, warn};

use crate::audit::{audit, AuditOptions, AuditReport};
use crate::config::BuilderConfig;
use crate::env::session_envs;
use crate::error::{BuildError, SandboxError};
use crate::platform::Platform;
use crate::runner::{self, CommandIo, ExitStatus, Mount, RunnerKind, SandboxSession};

pub use products::{locate, ProductMatch, ProductSpec};
pub use workspace::{materialize_source, PlatformDirs, SourceSpec};

/// File name of the build script inside the workspace.
pub const SCRIPT_NAME: &str = "build.sh";

/// A build file.
///
/// ```toml
/// name = "zlib"
/// script = """
/// cd zlib
/// ./configure --prefix=$prefix
/// make install
/// """
/// platforms = ["x86_64-linux-gnu", "aarch64-linux-gnu"]
///
/// [[sources]]
/// path = "zlib-1.3.tar"
/// dest = "zlib"
///
/// [[products]]
/// kind = "library"
/// names = ["libz"]
/// ```
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct BuildRequest {
    pub name: String,
    pub script: String,
    #[serde(default)]
    pub sources: Vec<SourceSpec>,
    #[serde(default)]
    pub products: Vec<ProductSpec>,
    /// Every platform with a shard in the image manifest when empty.
    #[serde(default)]
    pub platforms: Vec<Platform>,
    /// Extra variables for the script, overriding the synthesized ones.
    #[serde(default)]
    pub env: BTreeMap<String, String>,
    #[serde(default)]
    pub timeout_secs: Option<u64>,
    /// Directory relative source paths resolve against.
    #[serde(skip)]
    pub base_dir: PathBuf,
}

impl BuildRequest {
    pub fn load(path: &Path) -> Result<Self> {
        let text = fs::read_to_string(path)
            .with_context(|| format!("reading build file {}", path.display()))?;
        let mut request: Self =
            toml::from_str(&text).with_context(|| format!("parsing {}", path.display()))?;
        request.base_dir = path
            .parent()
            .map(Path::to_path_buf)
            .unwrap_or_default();
        request.validate()?;
        Ok(request)
    }

    pub fn validate(&self) -> Result<()> {
        if self.name.is_empty()
            || self.name.contains(['/', '\\'])
            || self.name.starts_with('.')
        {
            bail!("build name '{}' must be a plain directory name", self.name);
        }
        if self.script.trim().is_empty() {
            bail!("build '{}' has an empty script", self.name);
        }
        Ok(())
    }

    /// The platforms this request builds for.
    pub fn target_platforms(&self, config: &BuilderConfig) -> Vec<Platform> {
        if !self.platforms.is_empty() {
            return self.platforms.clone();
        }
        config
            .images
            .shards
            .keys()
            .filter_map(|triplet| triplet.parse().ok())
            .collect()
    }
}

#[derive(Debug, Clone, Default)]
pub struct BuildOptions {
    /// Overrides the request's `timeout_secs`.
    pub timeout: Option<Duration>,
    /// Copy script output to this process's stdout as well as the log.
    pub echo: bool,
}

/// Result of building one platform.
#[derive(Debug)]
pub struct PlatformOutcome {
    pub platform: Platform,
    pub dirs: PlatformDirs,
    pub runner: Option<RunnerKind>,
    pub exit: Option<ExitStatus>,
    pub audit: Option<AuditReport>,
    pub products: Vec<ProductMatch>,
    pub error: Option<BuildError>,
    pub started: OffsetDateTime,
    pub finished: OffsetDateTime,
}

impl PlatformOutcome {
    pub fn success(&self) -> bool {
        self.error.is_none()
    }
}

#[derive(Serialize)]
struct BuildManifest<'a> {
    name: &'a str,
    platform: &'a Platform,
    success: bool,
    runner: Option<RunnerKind>,
    exit: Option<ExitStatus>,
    started: String,
    finished: String,
    duration_secs: f64,
    products: &'a [ProductMatch],
    audit: Option<&'a AuditReport>,
    error: Option<String>,
}

/// Build `request` for each of its platforms with the configured runner.
pub fn autobuild(
    config: &BuilderConfig,
    request: &BuildRequest,
    options: &BuildOptions,
) -> Vec<PlatformOutcome> {
    autobuild_with(config, request, options, &|platform, workspace, mounts, env| {
        runner::open_session(config, platform, workspace, mounts, env)
    })
}

/// [`autobuild`] with a caller-supplied way of opening sandboxes.
pub fn autobuild_with<F>(
    config: &BuilderConfig,
    request: &BuildRequest,
    options: &BuildOptions,
    open: &F,
) -> Vec<PlatformOutcome>
where
    F: Fn(
            &Platform,
            &Path,
            &[Mount],
            &BTreeMap<String, String>,
        ) -> Result<Box<dyn SandboxSession>, SandboxError>
        + Sync,
{
    let platforms = request.target_platforms(config);
    let jobs = config.jobs.clamp(1, platforms.len().max(1));
    info!(build = %request.name, platforms = platforms.len(), jobs, "starting build");

    let next = AtomicUsize::new(0);
    let slots: Mutex<Vec<Option<PlatformOutcome>>> =
        Mutex::new(platforms.iter().map(|_| None).collect());
    thread::scope(|s| {
        for _ in 0..jobs {
            s.spawn(|| loop {
                let index = next.fetch_add(1, Ordering::SeqCst);
                let Some(platform) = platforms.get(index) else {
                    break;
                };
                let outcome = build_platform(config, request, options, platform, open);
                slots.lock().unwrap_or_else(|e| e.into_inner())[index] = Some(outcome);
            });
        }
    });

    slots
        .into_inner()
        .unwrap_or_else(|e| e.into_inner())
        .into_iter()
        .flatten()
        .collect()
}

fn build_platform<F>(
    config: &BuilderConfig,
    request: &BuildRequest,
    options: &BuildOptions,
    platform: &Platform,
    open: &F,
) -> PlatformOutcome
where
    F: Fn(
            &Platform,
            &Path,
            &[Mount],
            &BTreeMap<String, String>,
        ) -> Result<Box<dyn SandboxSession>, SandboxError>
        + Sync,
{
    let started = OffsetDateTime::now_utc();
    let mut outcome = PlatformOutcome {
        platform: *platform,
        dirs: PlatformDirs::new(&config.builds_dir(), &request.name, platform),
        runner: None,
        exit: None,
        audit: None,
        products: Vec::new(),
        error: None,
        started,
        finished: started,
    };

    if let Err(e) = execute(config, request, options, &mut outcome, open) {
        warn!(platform = %platform, error = %e, "platform build failed");
        outcome.error = Some(e);
    } else {
        info!(platform = %platform, "platform build succeeded");
    }
    outcome.finished = OffsetDateTime::now_utc();

    if let Err(e) = write_manifest(&request.name, &outcome) {
        warn!(platform = %platform, error = %format!("{e:#}"), "could not write build manifest");
    }
    outcome
}

fn execute<F>(
    config: &BuilderConfig,
    request: &BuildRequest,
    options: &BuildOptions,
    outcome: &mut PlatformOutcome,
    open: &F,
) -> Result<(), BuildError>
where
    F: Fn(
            &Platform,
            &Path,
            &[Mount],
            &BTreeMap<String, String>,
        ) -> Result<Box<dyn SandboxSession>, SandboxError>
        + Sync,
{
    let platform = outcome.platform;
    let name = platform.to_string();
    let workspace_err = |e: anyhow::Error| BuildError::Workspace {
        platform: name.clone(),
        message: format!("{e:#}"),
    };

    let dirs = outcome.dirs.clone();
    dirs.prepare().map_err(workspace_err)?;
    for source in &request.sources {
        materialize_source(source, &request.base_dir, &dirs.srcdir).map_err(workspace_err)?;
    }
    let script = dirs.workspace.join(SCRIPT_NAME);
    fs::write(&script, &request.script)
        .with_context(|| format!("writing {}", script.display()))
        .map_err(workspace_err)?;
    let log = File::create(dirs.log_path())
        .with_context(|| format!("creating {}", dirs.log_path().display()))
        .map_err(workspace_err)?;
    let mut streams = log_streams(log, options.echo).map_err(workspace_err)?;

    let env = session_envs(&platform, &request.env);
    let mut session = open(&platform, &dirs.workspace, &[], &env).map_err(|e| match e {
        SandboxError::Image(source) => BuildError::Image {
            platform: name.clone(),
            source,
        },
        source => BuildError::Setup {
            platform: name.clone(),
            source,
        },
    })?;
    outcome.runner = Some(session.kind());
    info!(platform = %platform, runner = %session.kind(), "running build script");

    let timeout = options
        .timeout
        .or(request.timeout_secs.map(Duration::from_secs));
    let command = format!("/bin/sh -e \"$WORKSPACE/{SCRIPT_NAME}\"");
    let (result, timed_out) = run_with_timeout(session.as_mut(), &command, &mut streams, timeout);
    if let Err(e) = session.close() {
        warn!(platform = %platform, error = %e, "sandbox teardown failed");
    }
    drop(session);

    let status = result.map_err(|source| BuildError::Setup {
        platform: name.clone(),
        source,
    })?;
    outcome.exit = Some(status);
    if timed_out {
        return Err(BuildError::TimedOut {
            platform: name,
            seconds: timeout.map(|t| t.as_secs()).unwrap_or_default(),
        });
    }
    if !status.success() {
        return Err(BuildError::ExecutionFailure {
            platform: name,
            code: status.code,
        });
    }

    let mut audit_options = AuditOptions::for_platform(&platform);
    audit_options.autofix = config.autofix;
    audit_options.strict = config.strict_audit;
    let report = audit(&dirs.destdir, &platform, &audit_options).map_err(workspace_err)?;
    let passed = report.passed(config.strict_audit);
    let issues = report.issues.clone();
    outcome.audit = Some(report);
    if !passed {
        return Err(BuildError::Audit {
            platform: name,
            issues,
        });
    }

    for spec in &request.products {
        match locate(spec, &dirs.destdir, &platform) {
            Ok(found) => outcome.products.push(found),
            Err(reason) => {
                return Err(BuildError::MissingProduct {
                    platform: name,
                    product: spec.to_string(),
                    reason,
                })
            }
        }
    }
    Ok(())
}

/// Run `command`, cancelling it through the session's handle once `timeout`
/// passes. Returns whether the watchdog fired.
fn run_with_timeout(
    session: &mut dyn SandboxSession,
    command: &str,
    streams: &mut CommandIo,
    timeout: Option<Duration>,
) -> (Result<ExitStatus, SandboxError>, bool) {
    let Some(timeout) = timeout else {
        return (session.run(command, streams), false);
    };
    let cancel = session.cancel_handle();
    let (done, finished) = mpsc::channel::<()>();
    thread::scope(|s| {
        let watchdog = s.spawn(move || match finished.recv_timeout(timeout) {
            Err(RecvTimeoutError::Timeout) => {
                cancel.cancel();
                true
            }
            _ => false,
        });
        let result = session.run(command, streams);
        drop(done);
        (result, watchdog.join().unwrap_or(false))
    })
}

/// Writes to both sinks.
struct Tee<A, B>(A, B);

impl<A: Write, B: Write> Write for Tee<A, B> {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.0.write_all(buf)?;
        self.1.write_all(buf)?;
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        self.0.flush()?;
        self.1.flush()
    }
}

fn log_streams(log: File, echo: bool) -> Result<CommandIo> {
    let log_err = log.try_clone().context("duplicating build log handle")?;
    Ok(if echo {
        CommandIo::new(Tee(log, io::stdout()), Tee(log_err, io::stderr()))
    } else {
        CommandIo::new(log, log_err)
    })
}

fn write_manifest(name: &str, outcome: &PlatformOutcome) -> Result<()> {
    let manifest = BuildManifest {
        name,
        platform: &outcome.platform,
        success: outcome.success(),
        runner: outcome.runner,
        exit: outcome.exit,
        started: utc_timestamp(outcome.started),
        finished: utc_timestamp(outcome.finished),
        duration_secs: (outcome.finished - outcome.started).as_seconds_f64(),
        products: &outcome.products,
        audit: outcome.audit.as_ref(),
        error: outcome.error.as_ref().map(|e| e.to_string()),
    };
    let path = outcome.dirs.manifest_path();
    fs::create_dir_all(&outcome.dirs.root)
        .with_context(|| format!("creating {}", outcome.dirs.root.display()))?;
    let bytes = serde_json::to_vec_pretty(&manifest).context("serializing build manifest")?;
    fs::write(&path, bytes).with_context(|| format!("writing {}", path.display()))
}

pub(crate) fn utc_timestamp(t: OffsetDateTime) -> String {
    format!(
        "{:04}-{:02}-{:02}T{:02}:{:02}:{:02}Z",
        t.year(),
        t.month() as u8,
        t.day(),
        t.hour(),
        t.minute(),
        t.second()
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::runner::CancelHandle;
    use crate::testing::ElfBuilder;
    use std::process::{Command, Stdio};
    use tempfile::TempDir;

    /// Runs commands directly on the host, inside the workspace.
    struct HostSession {
        platform: Platform,
        workspace: PathBuf,
        cancel: CancelHandle,
    }

    impl SandboxSession for HostSession {
        fn kind(&self) -> RunnerKind {
            RunnerKind::Namespace
        }

        fn platform(&self) -> &Platform {
            &self.platform
        }

        fn run(&mut self, command: &str, streams: &mut CommandIo) -> Result<ExitStatus, SandboxError> {
            // Output goes through a file so a killed shell cannot leave a
            // pipe held open by its children.
            let out_path = self.workspace.join(".out");
            let out = File::create(&out_path).map_err(|e| SandboxError::io("creating", e))?;
            let mut child = Command::new("/bin/sh")
                .args(["-c", command])
                .current_dir(&self.workspace)
                .env("WORKSPACE", &self.workspace)
                .env("prefix", self.workspace.join("destdir"))
                .stdout(Stdio::from(out))
                .stderr(Stdio::null())
                .spawn()
                .map_err(|e| SandboxError::io("spawning", e))?;
            self.cancel.track(child.id());
            let status = child.wait().map_err(|e| SandboxError::io("waiting", e))?;
            self.cancel.untrack();
            let output = fs::read(&out_path).map_err(|e| SandboxError::io("reading", e))?;
            streams
                .stdout
                .write_all(&output)
                .map_err(|e| SandboxError::io("forwarding", e))?;
            Ok(status.into())
        }

        fn shell(&mut self) -> Result<ExitStatus, SandboxError> {
            Ok(ExitStatus::from_code(0))
        }

        fn close(&mut self) -> Result<(), SandboxError> {
            Ok(())
        }

        fn cancel_handle(&self) -> CancelHandle {
            self.cancel.clone()
        }
    }

    fn host_open(
        platform: &Platform,
        workspace: &Path,
        _mounts: &[Mount],
        _env: &BTreeMap<String, String>,
    ) -> Result<Box<dyn SandboxSession>, SandboxError> {
        Ok(Box::new(HostSession {
            platform: *platform,
            workspace: workspace.to_path_buf(),
            cancel: CancelHandle::new(),
        }))
    }

    fn request(script: &str, platforms: &[&str]) -> BuildRequest {
        BuildRequest {
            name: "demo".into(),
            script: script.into(),
            sources: Vec::new(),
            products: Vec::new(),
            platforms: platforms.iter().map(|p| p.parse().unwrap()).collect(),
            env: BTreeMap::new(),
            timeout_secs: None,
            base_dir: PathBuf::new(),
        }
    }

    #[test]
    fn loads_build_files() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("build.toml");
        fs::write(
            &path,
            r#"
name = "zlib"
script = "make install"
platforms = ["x86_64-linux-gnu", "x86_64-w64-mingw32"]

[[sources]]
path = "zlib"

[[products]]
kind = "library"
names = ["libz"]
"#,
        )
        .unwrap();
        let request = BuildRequest::load(&path).unwrap();
        assert_eq!(request.base_dir, tmp.path());
        assert_eq!(request.platforms.len(), 2);

        fs::write(&path, "name = \"../x\"\nscript = \"true\"\n").unwrap();
        assert!(BuildRequest::load(&path).is_err());
        fs::write(&path, "name = \"x\"\nscript = \"true\"\nbogus = 1\n").unwrap();
        assert!(BuildRequest::load(&path).is_err());
    }

    #[test]
    fn one_failure_does_not_stop_the_others() {
        let tmp = TempDir::new().unwrap();
        let mut config = BuilderConfig::with_root(tmp.path());
        config.jobs = 2;
        // Only an x86_64 library is produced, so the aarch64 product check fails.
        let mut req = request(
            "mkdir -p \"$prefix/lib\"\ncp \"$WORKSPACE/srcdir/libdemo.so\" \"$prefix/lib/\"\n",
            &["x86_64-linux-gnu", "aarch64-linux-gnu"],
        );
        let src = tmp.path().join("src");
        fs::create_dir_all(&src).unwrap();
        ElfBuilder::new()
            .soname("libdemo.so")
            .write(&src.join("libdemo.so"))
            .unwrap();
        req.sources.push(SourceSpec {
            path: src,
            sha256: None,
            dest: None,
        });
        req.products.push(ProductSpec::Library {
            names: vec!["libdemo".into()],
            dir: None,
        });

        let outcomes = autobuild_with(&config, &req, &BuildOptions::default(), &host_open);
        assert_eq!(outcomes.len(), 2);
        assert!(outcomes[0].success(), "{:?}", outcomes[0].error);
        assert_eq!(outcomes[0].products[0].path, Path::new("lib/libdemo.so"));
        assert!(matches!(
            outcomes[1].error,
            Some(BuildError::MissingProduct { .. })
        ));

        for outcome in &outcomes {
            let json: serde_json::Value =
                serde_json::from_slice(&fs::read(outcome.dirs.manifest_path()).unwrap()).unwrap();
            assert_eq!(json["success"], outcome.success());
            assert!(json["started"].as_str().unwrap().ends_with('Z'));
        }
    }

    #[test]
    fn non_zero_exit_is_an_execution_failure() {
        let tmp = TempDir::new().unwrap();
        let config = BuilderConfig::with_root(tmp.path());
        let req = request("echo building\nexit 3\n", &["x86_64-linux-gnu"]);
        let outcomes = autobuild_with(&config, &req, &BuildOptions::default(), &host_open);
        let outcome = &outcomes[0];
        assert!(matches!(
            outcome.error,
            Some(BuildError::ExecutionFailure { code: Some(3), .. })
        ));
        let log = fs::read_to_string(outcome.dirs.log_path()).unwrap();
        assert_eq!(log, "building\n");
        assert!(outcome.error.as_ref().unwrap().to_string().contains("x86_64-linux-gnu"));
    }

    #[test]
    fn timeout_cancels_the_script() {
        let tmp = TempDir::new().unwrap();
        let config = BuilderConfig::with_root(tmp.path());
        let req = request("exec sleep 30\n", &["x86_64-linux-gnu"]);
        let options = BuildOptions {
            timeout: Some(Duration::from_millis(300)),
            echo: false,
        };
        let start = std::time::Instant::now();
        let outcomes = autobuild_with(&config, &req, &options, &host_open);
        assert!(start.elapsed() < Duration::from_secs(20));
        assert!(matches!(outcomes[0].error, Some(BuildError::TimedOut { .. })));
    }

    #[test]
    fn setup_failures_are_reported_per_platform() {
        let tmp = TempDir::new().unwrap();
        let config = BuilderConfig::with_root(tmp.path());
        let req = request("true", &["aarch64-linux-gnu"]);
        let outcomes = autobuild(&config, &req, &BuildOptions::default());
        // No images are configured, so whichever runner is picked cannot start.
        match &outcomes[0].error {
            Some(BuildError::Image { platform, .. }) | Some(BuildError::Setup { platform, .. }) => {
                assert_eq!(platform, "aarch64-linux-gnu")
            }
            other => panic!("unexpected outcome {other:?}"),
        }
    }

    #[test]
    fn timestamps() {
        let t = OffsetDateTime::from_unix_timestamp(1_709_622_489).unwrap();
        assert_eq!(utc_timestamp(t), "2024-03-05T07:08:09Z");
    }
}
