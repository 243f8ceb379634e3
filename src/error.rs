//! Error taxonomy for the sandbox, image, object, and audit layers.
//!
//! Setup-layer errors ([`SandboxError`], [`ImageError`]) abort a single
//! platform's build. Parsing-layer errors ([`ObjectError`]) are isolated per
//! file. A non-zero exit from the build script is not an error of the runner
//! at all; the orchestrator turns it into [`BuildError::ExecutionFailure`].

use std::io;
use std::path::PathBuf;

use thiserror::Error;

use crate::audit::LinkageIssue;
use crate::runner::RunnerKind;

/// Triplet parsing failures.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TripletError {
    #[error("empty target triplet")]
    Empty,

    #[error("unrecognized architecture '{arch}' in triplet '{triplet}'")]
    UnknownArch { triplet: String, arch: String },

    #[error("no operating system found in triplet '{triplet}'")]
    UnknownOs { triplet: String },

    #[error("unrecognized component '{component}' in triplet '{triplet}'")]
    UnknownComponent { triplet: String, component: String },

    #[error("unsupported target '{triplet}': {reason}")]
    Unsupported { triplet: String, reason: String },
}

/// Object inspection failures.
#[derive(Debug, Error)]
pub enum ObjectError {
    #[error("{}: not a recognized object file ({detail})", path.display())]
    UnsupportedFormat { path: PathBuf, detail: String },

    #[error(
        "{}: truncated object ({actual} bytes, header requires {declared})",
        path.display()
    )]
    Truncated {
        path: PathBuf,
        declared: u64,
        actual: u64,
    },

    #[error("{}: malformed object: {message}", path.display())]
    Malformed { path: PathBuf, message: String },

    #[error("{}: {source}", path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
}

impl ObjectError {
    /// The file this error is about.
    pub fn path(&self) -> &PathBuf {
        match self {
            Self::UnsupportedFormat { path, .. }
            | Self::Truncated { path, .. }
            | Self::Malformed { path, .. }
            | Self::Io { path, .. } => path,
        }
    }

    /// True when the file simply is not an object (the auditor skips these silently).
    pub fn is_not_an_object(&self) -> bool {
        matches!(self, Self::UnsupportedFormat { .. })
    }
}

/// Filesystem image failures.
#[derive(Debug, Error)]
pub enum ImageError {
    #[error("image {id} unavailable: {reason}")]
    Unavailable { id: String, reason: String },

    #[error(
        "building for {platform} requires the macOS SDK; accept its license with `automatic_apple = true`"
    )]
    LicenseNotAccepted { platform: String },

    #[error("squashfs image {}: {reason}", path.display())]
    Squashfs { path: PathBuf, reason: String },

    #[error("mounting {} at {}: {reason}", image.display(), mountpoint.display())]
    Mount {
        image: PathBuf,
        mountpoint: PathBuf,
        reason: String,
    },

    #[error("{context}: {source}")]
    Io {
        context: String,
        #[source]
        source: io::Error,
    },
}

impl ImageError {
    pub(crate) fn io(context: impl Into<String>, source: io::Error) -> Self {
        Self::Io {
            context: context.into(),
            source,
        }
    }
}

/// Why a runner could not create a sandbox.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SetupFailure {
    /// The host cannot execute the shard's toolchain in this runner.
    HostIncompatible,
    /// Unprivileged user namespaces are disabled or unavailable.
    NamespacesUnavailable,
    /// The kernel refuses overlay mounts inside a user namespace.
    OverlayUnsupported,
    /// The runner needs privileges the caller does not have.
    PermissionDenied,
    /// A required host tool (qemu, kernel image) is missing.
    ToolMissing,
    /// The virtual machine did not reach a usable shell.
    BootFailed,
}

/// Sandbox runner failures.
#[derive(Debug, Error)]
pub enum SandboxError {
    #[error("{runner} runner cannot sandbox {platform}: {reason}{}", fallback_hint(.fallback))]
    Setup {
        runner: RunnerKind,
        platform: String,
        failure: SetupFailure,
        reason: String,
        fallback: Option<RunnerKind>,
    },

    #[error(transparent)]
    Image(#[from] ImageError),

    #[error("sandbox control channel: {0}")]
    Protocol(String),

    #[error("{context}: {source}")]
    Io {
        context: String,
        #[source]
        source: io::Error,
    },
}

impl SandboxError {
    pub(crate) fn io(context: impl Into<String>, source: io::Error) -> Self {
        Self::Io {
            context: context.into(),
            source,
        }
    }

    /// True for setup failures that another runner variant may not have.
    pub fn allows_fallback(&self) -> bool {
        matches!(
            self,
            Self::Setup {
                fallback: Some(_),
                ..
            }
        )
    }
}

fn fallback_hint(fallback: &Option<RunnerKind>) -> String {
    match fallback {
        Some(kind) => format!(" (try the {kind} runner)"),
        None => String::new(),
    }
}

/// Relocation rewrite failures. The original object is untouched on every error.
#[derive(Debug, Error)]
pub enum FixError {
    #[error("{}: {format} objects carry no search paths to rewrite", path.display())]
    NotApplicable { path: PathBuf, format: String },

    #[error("{}: rewrite does not fit in place and `{tool}` was not found", path.display())]
    ToolMissing { path: PathBuf, tool: String },

    #[error("{}: `{tool}` failed: {stderr}", path.display())]
    ToolFailed {
        path: PathBuf,
        tool: String,
        stderr: String,
    },

    #[error("{}: rewritten object failed verification: {reason}", path.display())]
    Verification { path: PathBuf, reason: String },

    #[error(transparent)]
    Object(#[from] ObjectError),

    #[error("{}: {source}", path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
}

/// Per-platform build failure, always naming the platform.
#[derive(Debug, Error)]
pub enum BuildError {
    #[error("[{platform}] sandbox setup failed: {source}")]
    Setup {
        platform: String,
        #[source]
        source: SandboxError,
    },

    #[error("[{platform}] {source}")]
    Image {
        platform: String,
        #[source]
        source: ImageError,
    },

    #[error("[{platform}] build script failed with exit code {}", display_code(.code))]
    ExecutionFailure { platform: String, code: Option<i32> },

    #[error("[{platform}] build cancelled after {seconds}s")]
    TimedOut { platform: String, seconds: u64 },

    #[error("[{platform}] audit found {} issue(s); first: {}", issues.len(), first_issue(issues))]
    Audit {
        platform: String,
        issues: Vec<LinkageIssue>,
    },

    #[error("[{platform}] product '{product}' not satisfied: {reason}")]
    MissingProduct {
        platform: String,
        product: String,
        reason: String,
    },

    #[error("[{platform}] {message}")]
    Workspace { platform: String, message: String },
}

fn display_code(code: &Option<i32>) -> String {
    match code {
        Some(code) => code.to_string(),
        None => "none (killed by signal)".to_string(),
    }
}

fn first_issue(issues: &[LinkageIssue]) -> String {
    issues
        .first()
        .map(|issue| issue.to_string())
        .unwrap_or_else(|| "none".to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn setup_error_names_fallback_runner() {
        let err = SandboxError::Setup {
            runner: RunnerKind::Namespace,
            platform: "aarch64-linux-gnu".into(),
            failure: SetupFailure::HostIncompatible,
            reason: "shard toolchain is built for aarch64".into(),
            fallback: Some(RunnerKind::Virtualized),
        };
        let msg = err.to_string();
        assert!(msg.contains("aarch64-linux-gnu"));
        assert!(msg.contains("virtualized"));
        assert!(err.allows_fallback());
    }

    #[test]
    fn unsupported_format_is_not_an_object() {
        let err = ObjectError::UnsupportedFormat {
            path: "/tmp/readme.txt".into(),
            detail: "unknown magic".into(),
        };
        assert!(err.is_not_an_object());
        let err = ObjectError::Truncated {
            path: "/tmp/libfoo.so".into(),
            declared: 64,
            actual: 12,
        };
        assert!(!err.is_not_an_object());
        assert!(err.to_string().contains("truncated"));
    }
}
