//! Filesystem image provider.
//!
//! Turns the base rootfs and per-target compiler shards named in the
//! [`ImageManifest`](crate::config::ImageManifest) into ready directory
//! trees, either by unpacking a tarball or by loop-mounting a squashfs
//! image whose ownership table was rewritten for the invoking user.
//!
//! Downloading is not done here: blobs are expected in the downloads
//! directory under their sha256.

pub mod mount;
pub mod squashfs;
pub mod store;

use std::fmt;
use std::path::{Path, PathBuf};

use tracing::debug;

use crate::config::{BuilderConfig, ImageDigests, ImageManifest, ImageStrategy};
use crate::error::ImageError;
use crate::platform::{Os, Platform};

pub use squashfs::rewrite_squashfs_uids;
pub use store::{sha256_file, ImageStore};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ImageKind {
    Rootfs,
    Shard,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ImageEncoding {
    Tarball,
    Squashfs,
}

impl fmt::Display for ImageEncoding {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Tarball => "tarball",
            Self::Squashfs => "squashfs",
        })
    }
}

impl From<ImageStrategy> for ImageEncoding {
    fn from(strategy: ImageStrategy) -> Self {
        match strategy {
            ImageStrategy::Unpack => Self::Tarball,
            ImageStrategy::LoopMount => Self::Squashfs,
        }
    }
}

/// One content-addressed image.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Image {
    /// sha256 of the blob.
    pub id: String,
    /// `rootfs` or the shard's triplet.
    pub name: String,
    pub kind: ImageKind,
    pub encoding: ImageEncoding,
}

impl fmt::Display for Image {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {} ({})", self.name, self.encoding, &self.id[..self.id.len().min(12)])
    }
}

#[derive(Debug, Clone)]
pub struct ImageProvider {
    store: ImageStore,
    manifest: ImageManifest,
    strategy: ImageStrategy,
    automatic_apple: bool,
    rootfs_dir: PathBuf,
    shards_dir: PathBuf,
}

impl ImageProvider {
    pub fn new(config: &BuilderConfig) -> Self {
        Self {
            store: ImageStore::new(config.downloads_dir(), config.root.join("locks")),
            manifest: config.images.clone(),
            strategy: config.image_strategy,
            automatic_apple: config.automatic_apple,
            rootfs_dir: config.rootfs_dir(),
            shards_dir: config.shards_dir(),
        }
    }

    pub fn strategy(&self) -> ImageStrategy {
        self.strategy
    }

    pub fn store(&self) -> &ImageStore {
        &self.store
    }

    /// The base rootfs in the configured strategy's encoding.
    pub fn rootfs_image(&self) -> Result<Image, ImageError> {
        self.rootfs_image_as(self.strategy.into())
    }

    pub fn rootfs_image_as(&self, encoding: ImageEncoding) -> Result<Image, ImageError> {
        lookup(&self.manifest.rootfs, "rootfs", ImageKind::Rootfs, encoding)
    }

    /// The compiler shard targeting `platform`, in the configured encoding.
    pub fn shard_for(&self, platform: &Platform) -> Result<Image, ImageError> {
        self.shard_as(platform, self.strategy.into())
    }

    pub fn shard_as(&self, platform: &Platform, encoding: ImageEncoding) -> Result<Image, ImageError> {
        if platform.os == Os::MacOS && !self.automatic_apple {
            return Err(ImageError::LicenseNotAccepted {
                platform: platform.to_string(),
            });
        }
        let key = platform.without_cxx_abi().to_string();
        let Some(entry) = self.manifest.shards.get(&key) else {
            return Err(ImageError::Unavailable {
                id: key.clone(),
                reason: format!("no compiler shard for {key} in the image manifest"),
            });
        };
        lookup(&entry.digests(), &key, ImageKind::Shard, encoding)
    }

    /// Platform the shard's toolchain binaries run on.
    pub fn shard_host(&self, platform: &Platform) -> Option<Platform> {
        let key = platform.without_cxx_abi().to_string();
        self.manifest.shards.get(&key).map(|e| e.host_platform())
    }

    /// Where `image` is unpacked or mounted unless a caller picks otherwise.
    pub fn default_mountpoint(&self, image: &Image) -> PathBuf {
        let short = &image.id[..image.id.len().min(16)];
        match image.kind {
            ImageKind::Rootfs => self.rootfs_dir.join(short),
            ImageKind::Shard => self.shards_dir.join(format!("{}-{short}", image.name)),
        }
    }

    /// Make `image` available as a read-only tree at `mountpoint`.
    ///
    /// Tarballs are unpacked once and marked ready; squashfs images are
    /// loop-mounted from a copy owned by the invoking user. Both are no-ops
    /// when the image is already in place. Cache writes happen under the
    /// image's lock, so concurrent callers wait for the first one.
    pub fn ensure_ready(&self, image: &Image, mountpoint: &Path) -> Result<PathBuf, ImageError> {
        let _lock = self.store.lock(image)?;
        match image.encoding {
            ImageEncoding::Tarball => self.store.unpack(image, mountpoint)?,
            ImageEncoding::Squashfs => {
                if mount::is_mounted(mountpoint)? {
                    debug!(image = %image, mountpoint = %mountpoint.display(), "already mounted");
                } else {
                    let uid = nix::unistd::getuid().as_raw();
                    let blob = self.store.squashfs_for_uid(image, uid)?;
                    mount::loop_mount(&blob, mountpoint)?;
                }
            }
        }
        Ok(mountpoint.to_path_buf())
    }

    /// The verified blob file for `image`, for runners that attach images as
    /// block devices instead of directories. Readers share the image lock.
    pub fn blob(&self, image: &Image) -> Result<PathBuf, ImageError> {
        let _lock = self.store.lock_shared(image)?;
        self.store.verified_blob(image)
    }

    /// Unmount `mountpoint` if something is mounted there; no-op otherwise.
    /// Unpacked trees are left in the cache.
    pub fn release(&self, mountpoint: &Path) -> Result<(), ImageError> {
        mount::unmount(mountpoint)?;
        Ok(())
    }
}

fn lookup(
    digests: &ImageDigests,
    name: &str,
    kind: ImageKind,
    encoding: ImageEncoding,
) -> Result<Image, ImageError> {
    let digest = match encoding {
        ImageEncoding::Tarball => digests.tarball.as_ref(),
        ImageEncoding::Squashfs => digests.squashfs.as_ref(),
    };
    let Some(id) = digest else {
        return Err(ImageError::Unavailable {
            id: name.to_string(),
            reason: format!("no {encoding} digest for {name} in the image manifest"),
        });
    };
    let id = id.to_ascii_lowercase();
    if !store::is_sha256(&id) {
        return Err(ImageError::Unavailable {
            id,
            reason: format!("{name}: manifest digest is not a sha256"),
        });
    }
    Ok(Image {
        id,
        name: name.to_string(),
        kind,
        encoding,
    })
}
