//! Builder configuration.
//!
//! Everything process-wide (cache directories, runner selection, licence
//! acceptance, the image manifest) lives in one [`BuilderConfig`] that is
//! passed explicitly into the image provider, the runners, and the
//! orchestrator.

use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{bail, Context, Result};
use serde::{Deserialize, Serialize};

use crate::platform::{Arch, Libc, Platform};
use crate::runner::RunnerKind;

/// How filesystem images are materialized.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ImageStrategy {
    /// Extract tarballs into a directory. Works everywhere, costs disk.
    #[default]
    Unpack,
    /// Loop-mount squashfs images read-only. Needs mount privilege.
    LoopMount,
}

/// Settings for the virtualized runner.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct QemuSettings {
    pub memory_mb: u32,
    pub cpus: u32,
    pub boot_timeout_secs: u64,
    /// Seconds to wait for a clean poweroff before killing the VM.
    pub shutdown_grace_secs: u64,
}

impl Default for QemuSettings {
    fn default() -> Self {
        Self {
            memory_mb: 4096,
            cpus: 2,
            boot_timeout_secs: 120,
            shutdown_grace_secs: 10,
        }
    }
}

/// Content hashes of the two encodings an image may be published in.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ImageDigests {
    pub tarball: Option<String>,
    pub squashfs: Option<String>,
}

/// One compiler shard.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ShardEntry {
    pub tarball: Option<String>,
    pub squashfs: Option<String>,
    /// Platform the toolchain binaries themselves run on.
    pub host: Option<Platform>,
}

impl ShardEntry {
    pub fn digests(&self) -> ImageDigests {
        ImageDigests {
            tarball: self.tarball.clone(),
            squashfs: self.squashfs.clone(),
        }
    }

    /// Host platform of the toolchain; shards are built for x86_64 musl hosts
    /// unless the manifest says otherwise.
    pub fn host_platform(&self) -> Platform {
        self.host
            .unwrap_or_else(|| Platform::linux(Arch::X86_64, Libc::Musl))
    }
}

/// The images available to this builder.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ImageManifest {
    pub rootfs: ImageDigests,
    /// Keyed by triplet without a C++ ABI tag.
    pub shards: BTreeMap<String, ShardEntry>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct BuilderConfig {
    /// Root of every cache and work directory.
    pub root: PathBuf,
    pub downloads_dir: Option<PathBuf>,
    pub rootfs_dir: Option<PathBuf>,
    pub shards_dir: Option<PathBuf>,
    pub qemu_dir: Option<PathBuf>,
    pub builds_dir: Option<PathBuf>,
    pub image_strategy: ImageStrategy,
    /// Runner to use; probed from host capabilities when unset.
    pub runner: Option<RunnerKind>,
    /// Accept the macOS SDK licence without asking.
    pub automatic_apple: bool,
    pub autofix: bool,
    pub strict_audit: bool,
    pub jobs: usize,
    pub qemu: QemuSettings,
    pub images: ImageManifest,
}

impl Default for BuilderConfig {
    fn default() -> Self {
        let root = dirs::cache_dir()
            .unwrap_or_else(std::env::temp_dir)
            .join("cross-builder");
        Self::with_root(root)
    }
}

impl BuilderConfig {
    /// Default configuration rooted at `root`.
    pub fn with_root(root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            downloads_dir: None,
            rootfs_dir: None,
            shards_dir: None,
            qemu_dir: None,
            builds_dir: None,
            image_strategy: ImageStrategy::default(),
            runner: None,
            automatic_apple: false,
            autofix: true,
            strict_audit: false,
            jobs: std::thread::available_parallelism()
                .map(|n| n.get())
                .unwrap_or(1),
            qemu: QemuSettings::default(),
            images: ImageManifest::default(),
        }
    }

    /// Load a TOML config file. Relative directories resolve against the file's directory.
    pub fn load(path: &Path) -> Result<Self> {
        let text = fs::read_to_string(path)
            .with_context(|| format!("reading builder config '{}'", path.display()))?;
        let mut config: BuilderConfig = toml::from_str(&text)
            .with_context(|| format!("parsing builder config '{}'", path.display()))?;

        let base = path.parent().unwrap_or_else(|| Path::new("."));
        config.root = resolve(base, &config.root);
        for dir in [
            &mut config.downloads_dir,
            &mut config.rootfs_dir,
            &mut config.shards_dir,
            &mut config.qemu_dir,
            &mut config.builds_dir,
        ] {
            if let Some(d) = dir.as_mut() {
                *d = resolve(base, d);
            }
        }

        config
            .validate()
            .with_context(|| format!("invalid builder config '{}'", path.display()))?;
        Ok(config)
    }

    /// [`BuilderConfig::load`] when a path is given, defaults otherwise.
    pub fn load_or_default(path: Option<&Path>) -> Result<Self> {
        match path {
            Some(path) => Self::load(path),
            None => Ok(Self::default()),
        }
    }

    pub fn validate(&self) -> Result<()> {
        if self.jobs == 0 {
            bail!("jobs must be at least 1");
        }
        if self.qemu.cpus == 0 || self.qemu.memory_mb < 256 {
            bail!(
                "qemu needs at least 1 cpu and 256 MiB (got {} cpus, {} MiB)",
                self.qemu.cpus,
                self.qemu.memory_mb
            );
        }
        for triplet in self.images.shards.keys() {
            let platform: Platform = triplet
                .parse()
                .with_context(|| format!("shard key '{triplet}'"))?;
            if platform.cxx_abi.is_some() {
                bail!("shard key '{triplet}' must not carry a C++ ABI tag");
            }
        }
        Ok(())
    }

    pub fn downloads_dir(&self) -> PathBuf {
        self.downloads_dir
            .clone()
            .unwrap_or_else(|| self.root.join("downloads"))
    }

    pub fn rootfs_dir(&self) -> PathBuf {
        self.rootfs_dir
            .clone()
            .unwrap_or_else(|| self.root.join("rootfs"))
    }

    pub fn shards_dir(&self) -> PathBuf {
        self.shards_dir
            .clone()
            .unwrap_or_else(|| self.root.join("shards"))
    }

    pub fn qemu_dir(&self) -> PathBuf {
        self.qemu_dir
            .clone()
            .unwrap_or_else(|| self.root.join("qemu"))
    }

    pub fn builds_dir(&self) -> PathBuf {
        self.builds_dir
            .clone()
            .unwrap_or_else(|| self.root.join("builds"))
    }

    /// Session scratch space (overlay upper/work dirs, mount points).
    pub fn sessions_dir(&self) -> PathBuf {
        self.root.join("sessions")
    }
}

fn resolve(base: &Path, path: &Path) -> PathBuf {
    if path.is_absolute() {
        path.to_path_buf()
    } else {
        base.join(path)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn loads_full_config() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("builder.toml");
        fs::write(
            &path,
            r#"
root = "cache"
image_strategy = "loop-mount"
runner = "privileged-namespace"
automatic_apple = true
strict_audit = true
jobs = 3

[qemu]
memory_mb = 2048

[images.rootfs]
squashfs = "aa11"

[images.shards."aarch64-linux-gnu"]
tarball = "bb22"
host = "aarch64-linux-musl"
"#,
        )
        .unwrap();

        let config = BuilderConfig::load(&path).unwrap();
        assert_eq!(config.root, tmp.path().join("cache"));
        assert_eq!(config.downloads_dir(), tmp.path().join("cache/downloads"));
        assert_eq!(config.image_strategy, ImageStrategy::LoopMount);
        assert_eq!(config.runner, Some(RunnerKind::PrivilegedNamespace));
        assert!(config.autofix);
        assert_eq!(config.jobs, 3);
        assert_eq!(config.qemu.memory_mb, 2048);
        assert_eq!(config.qemu.cpus, 2);
        let shard = &config.images.shards["aarch64-linux-gnu"];
        assert_eq!(shard.host_platform().to_string(), "aarch64-linux-musl");
    }

    #[test]
    fn rejects_unknown_fields_and_bad_shard_keys() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("builder.toml");
        fs::write(&path, "rooot = \"/tmp\"\n").unwrap();
        assert!(BuilderConfig::load(&path).is_err());

        fs::write(&path, "[images.shards.\"sparc-linux-gnu\"]\ntarball = \"x\"\n").unwrap();
        let err = BuilderConfig::load(&path).unwrap_err();
        assert!(format!("{err:#}").contains("sparc-linux-gnu"));
    }

    #[test]
    fn default_shard_host_is_x86_64_musl() {
        let entry = ShardEntry::default();
        assert_eq!(entry.host_platform().to_string(), "x86_64-linux-musl");
    }
}
