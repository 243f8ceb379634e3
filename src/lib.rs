//! Sandboxed cross-compilation and binary relocation auditing.
//!
//! Builds a project for many target platforms inside isolated sandboxes,
//! then checks the installed binaries for linkage that would break once the
//! install prefix moves, and rewrites what it can.
//!
//! - **Platform model** - target triplets, parsing and compatibility
//! - **Environment** - compiler and search-path variables for a target
//! - **Images** - base rootfs and per-target compiler shards, unpacked or loop-mounted
//! - **Runners** - namespace and virtual machine sandboxes behind one interface
//! - **Object inspector** - ELF, Mach-O and PE dependency and search-path records
//! - **Auditor** - linkage classification and in-place relocation fixes
//! - **Build orchestration** - per-platform build, audit and product checks
//!
//! # Architecture
//!
//! ```text
//! build::autobuild
//!     │
//!     ├── env::session_envs ───────── platform
//!     ├── runner::open_session
//!     │       ├── namespace ──┐
//!     │       └── qemu ───────┴──── image::ImageProvider
//!     └── audit::audit
//!             ├── object::open
//!             └── audit::fix
//! ```

pub mod audit;
pub mod build;
pub mod config;
pub mod env;
pub mod error;
pub mod image;
pub mod object;
pub mod platform;
pub mod preflight;
pub mod runner;

#[doc(hidden)]
pub mod testing;

pub use audit::{audit, AuditOptions, AuditReport, IssueKind, LinkageIssue};
pub use build::{autobuild, BuildOptions, BuildRequest, PlatformOutcome};
pub use config::BuilderConfig;
pub use error::{BuildError, ImageError, ObjectError, SandboxError, TripletError};
pub use image::ImageProvider;
pub use object::{ObjectFormat, ObjectHandle};
pub use platform::Platform;
pub use runner::{open_session, RunnerKind, SandboxRunner, SandboxSession};
