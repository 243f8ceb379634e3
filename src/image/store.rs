//! Content-addressed image cache.
//!
//! Layout under the downloads directory:
//! - `<sha256>.tar`, `<sha256>.tar.zst`, `<sha256>.squashfs`: downloaded blobs
//! - `<sha256>.uid-<uid>.squashfs`: per-user copies with a rewritten id table
//! - `<blob>.verified`: size, inode and mtime of a blob whose hash checked out
//!
//! Per-image locks live under `<root>/locks/<sha256>.lock`. Blobs are never
//! modified after download, so a blob matching its `.verified` stamp is not
//! hashed again.

use std::fs::{self, File, OpenOptions};
use std::io::{BufReader, Read};
use std::os::unix::fs::MetadataExt;
use std::path::{Path, PathBuf};
use std::time::UNIX_EPOCH;

use fs2::FileExt;
use sha2::{Digest, Sha256};
use tracing::{debug, info};

use super::squashfs::rewrite_squashfs_uids;
use super::{Image, ImageEncoding};
use crate::error::ImageError;

/// Marker written into an unpacked image once extraction completed.
pub const READY_MARKER: &str = ".image-ready";

const ZSTD_MAGIC: [u8; 4] = [0x28, 0xb5, 0x2f, 0xfd];

#[derive(Debug, Clone)]
pub struct ImageStore {
    downloads: PathBuf,
    locks: PathBuf,
}

impl ImageStore {
    pub fn new(downloads: impl Into<PathBuf>, locks: impl Into<PathBuf>) -> Self {
        Self {
            downloads: downloads.into(),
            locks: locks.into(),
        }
    }

    pub fn downloads_dir(&self) -> &Path {
        &self.downloads
    }

    /// Candidate blob paths for `image`, in lookup order.
    fn candidates(&self, image: &Image) -> Vec<PathBuf> {
        match image.encoding {
            ImageEncoding::Tarball => vec![
                self.downloads.join(format!("{}.tar.zst", image.id)),
                self.downloads.join(format!("{}.tar", image.id)),
            ],
            ImageEncoding::Squashfs => {
                vec![self.downloads.join(format!("{}.squashfs", image.id))]
            }
        }
    }

    /// The cached blob for `image`, if downloaded.
    pub fn blob_path(&self, image: &Image) -> Option<PathBuf> {
        self.candidates(image).into_iter().find(|p| p.is_file())
    }

    /// Block until this process holds the exclusive lock for `image`.
    pub fn lock(&self, image: &Image) -> Result<ImageLock, ImageError> {
        self.acquire(image, true)
    }

    /// Block until no writer holds `image`; other readers may share it.
    pub fn lock_shared(&self, image: &Image) -> Result<ImageLock, ImageError> {
        self.acquire(image, false)
    }

    fn acquire(&self, image: &Image, exclusive: bool) -> Result<ImageLock, ImageError> {
        fs::create_dir_all(&self.locks)
            .map_err(|e| ImageError::io(format!("creating {}", self.locks.display()), e))?;
        let path = self.locks.join(format!("{}.lock", image.id));

        // The lock file is never unlinked; removing a held lock file would let
        // a second process lock a fresh inode at the same path.
        let file = OpenOptions::new()
            .create(true)
            .read(true)
            .write(true)
            .truncate(false)
            .open(&path)
            .map_err(|e| ImageError::io(format!("opening lock {}", path.display()), e))?;
        let acquired = if exclusive {
            file.try_lock_exclusive()
        } else {
            FileExt::try_lock_shared(&file)
        };
        if acquired.is_err() {
            debug!(image = %image.id, exclusive, "waiting for image lock");
            let locked = if exclusive {
                file.lock_exclusive()
            } else {
                FileExt::lock_shared(&file)
            };
            locked.map_err(|e| ImageError::io(format!("locking {}", path.display()), e))?;
        }
        Ok(ImageLock { file })
    }

    /// Locate the blob and check its content hash, unless an earlier check
    /// is still recorded for the same file.
    pub fn verified_blob(&self, image: &Image) -> Result<PathBuf, ImageError> {
        let Some(blob) = self.blob_path(image) else {
            return Err(ImageError::Unavailable {
                id: image.id.clone(),
                reason: format!(
                    "{} {} not in cache {}",
                    image.name,
                    image.encoding,
                    self.downloads.display()
                ),
            });
        };
        let stamp_path = stamp_path(&blob);
        let stamp = blob_stamp(&blob)
            .map_err(|e| ImageError::io(format!("reading {}", blob.display()), e))?;
        if fs::read_to_string(&stamp_path).is_ok_and(|recorded| recorded == stamp) {
            return Ok(blob);
        }

        let actual = sha256_file(&blob)
            .map_err(|e| ImageError::io(format!("hashing {}", blob.display()), e))?;
        if actual != image.id {
            let _ = fs::remove_file(&stamp_path);
            return Err(ImageError::Unavailable {
                id: image.id.clone(),
                reason: format!("{} is corrupt (sha256 {actual})", blob.display()),
            });
        }
        // Readers may race here; each writes the same stamp through its own
        // temporary file.
        let tmp = stamp_path.with_extension(format!("verified-{}", std::process::id()));
        if let Err(e) = fs::write(&tmp, &stamp).and_then(|()| fs::rename(&tmp, &stamp_path)) {
            debug!(blob = %blob.display(), error = %e, "could not record blob verification");
            let _ = fs::remove_file(&tmp);
        }
        Ok(blob)
    }

    /// Extract a tarball image into `dest`. A `dest` already carrying this
    /// image's ready marker is left alone.
    pub fn unpack(&self, image: &Image, dest: &Path) -> Result<(), ImageError> {
        if is_unpacked(image, dest) {
            debug!(image = %image.id, dest = %dest.display(), "image already unpacked");
            return Ok(());
        }
        let blob = self.verified_blob(image)?;

        let parent = dest.parent().unwrap_or_else(|| Path::new("."));
        fs::create_dir_all(parent)
            .map_err(|e| ImageError::io(format!("creating {}", parent.display()), e))?;
        let tmp = parent.join(format!(".{}.unpack-{}", image.id, std::process::id()));
        if tmp.exists() {
            fs::remove_dir_all(&tmp)
                .map_err(|e| ImageError::io(format!("removing {}", tmp.display()), e))?;
        }
        fs::create_dir_all(&tmp)
            .map_err(|e| ImageError::io(format!("creating {}", tmp.display()), e))?;

        let result = extract_tarball(&blob, &tmp).and_then(|()| {
            fs::write(tmp.join(READY_MARKER), &image.id)
                .map_err(|e| ImageError::io("writing ready marker", e))?;
            if dest.exists() {
                fs::remove_dir_all(dest)
                    .map_err(|e| ImageError::io(format!("removing stale {}", dest.display()), e))?;
            }
            fs::rename(&tmp, dest).map_err(|e| {
                ImageError::io(
                    format!("moving {} to {}", tmp.display(), dest.display()),
                    e,
                )
            })
        });
        if result.is_err() {
            let _ = fs::remove_dir_all(&tmp);
        }
        result?;

        info!(image = %image.id, name = %image.name, dest = %dest.display(), "unpacked image");
        Ok(())
    }

    /// A copy of the squashfs blob whose id table maps every owner to `uid`.
    pub fn squashfs_for_uid(&self, image: &Image, uid: u32) -> Result<PathBuf, ImageError> {
        let copy = self
            .downloads
            .join(format!("{}.uid-{uid}.squashfs", image.id));
        if copy.is_file() {
            return Ok(copy);
        }
        let blob = self.verified_blob(image)?;
        let tmp = copy.with_extension(format!("tmp-{}", std::process::id()));
        fs::copy(&blob, &tmp)
            .map_err(|e| ImageError::io(format!("copying {}", blob.display()), e))?;
        if let Err(e) = rewrite_squashfs_uids(&tmp, uid) {
            let _ = fs::remove_file(&tmp);
            return Err(e);
        }
        fs::rename(&tmp, &copy)
            .map_err(|e| ImageError::io(format!("moving {}", tmp.display()), e))?;
        Ok(copy)
    }
}

/// Held for the duration of a cache write; released on drop.
#[derive(Debug)]
pub struct ImageLock {
    file: File,
}

impl Drop for ImageLock {
    fn drop(&mut self) {
        let _ = FileExt::unlock(&self.file);
    }
}

fn stamp_path(blob: &Path) -> PathBuf {
    let mut name = blob.as_os_str().to_owned();
    name.push(".verified");
    PathBuf::from(name)
}

/// Identity of a blob file: replacing or rewriting it changes the stamp.
fn blob_stamp(blob: &Path) -> std::io::Result<String> {
    let meta = fs::metadata(blob)?;
    let mtime = meta
        .modified()?
        .duration_since(UNIX_EPOCH)
        .map_or(0, |d| d.as_nanos());
    Ok(format!("{} {} {}", meta.len(), meta.ino(), mtime))
}

pub fn is_unpacked(image: &Image, dest: &Path) -> bool {
    fs::read_to_string(dest.join(READY_MARKER))
        .map(|id| id.trim() == image.id)
        .unwrap_or(false)
}

pub(crate) fn extract_tarball(blob: &Path, dest: &Path) -> Result<(), ImageError> {
    let mut magic = [0u8; 4];
    let mut f =
        File::open(blob).map_err(|e| ImageError::io(format!("opening {}", blob.display()), e))?;
    let is_zstd = f.read_exact(&mut magic).is_ok() && magic == ZSTD_MAGIC;
    let f =
        File::open(blob).map_err(|e| ImageError::io(format!("opening {}", blob.display()), e))?;

    let unpack_err = |e: std::io::Error| ImageError::io(format!("unpacking {}", blob.display()), e);
    if is_zstd {
        let decoder = zstd::stream::Decoder::new(f).map_err(unpack_err)?;
        let mut archive = tar::Archive::new(decoder);
        archive.set_preserve_permissions(true);
        archive.unpack(dest).map_err(unpack_err)
    } else {
        let mut archive = tar::Archive::new(BufReader::new(f));
        archive.set_preserve_permissions(true);
        archive.unpack(dest).map_err(unpack_err)
    }
}

/// Lowercase hex sha256 of a file's contents.
pub fn sha256_file(path: &Path) -> std::io::Result<String> {
    let f = File::open(path)?;
    let mut r = BufReader::new(f);
    let mut hasher = Sha256::new();
    let mut buf = vec![0u8; 1024 * 1024];
    loop {
        let n = r.read(&mut buf)?;
        if n == 0 {
            break;
        }
        hasher.update(&buf[..n]);
    }
    Ok(format!("{:x}", hasher.finalize()))
}

pub fn is_sha256(s: &str) -> bool {
    s.len() == 64 && s.chars().all(|c| c.is_ascii_hexdigit())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::image::squashfs::read_squashfs_ids;
    use crate::image::ImageKind;
    use crate::testing::SquashfsBuilder;
    use tempfile::TempDir;

    fn tar_of(dir: &Path) -> Vec<u8> {
        let mut builder = tar::Builder::new(Vec::new());
        builder.append_dir_all(".", dir).unwrap();
        builder.into_inner().unwrap()
    }

    fn image(id: String, encoding: ImageEncoding) -> Image {
        Image {
            id,
            name: "rootfs".to_string(),
            kind: ImageKind::Rootfs,
            encoding,
        }
    }

    fn store_blob(store: &ImageStore, bytes: &[u8], ext: &str) -> String {
        fs::create_dir_all(store.downloads_dir()).unwrap();
        let tmp = store.downloads_dir().join("incoming");
        fs::write(&tmp, bytes).unwrap();
        let id = sha256_file(&tmp).unwrap();
        fs::rename(&tmp, store.downloads_dir().join(format!("{id}.{ext}"))).unwrap();
        id
    }

    #[test]
    fn unpack_tar_zst_is_idempotent() {
        let tmp = TempDir::new().unwrap();
        let src = tmp.path().join("src");
        fs::create_dir_all(src.join("usr/bin")).unwrap();
        fs::write(src.join("usr/bin/tool"), b"#!/bin/sh\n").unwrap();
        let compressed = zstd::encode_all(&tar_of(&src)[..], 3).unwrap();

        let store = ImageStore::new(tmp.path().join("downloads"), tmp.path().join("locks"));
        let id = store_blob(&store, &compressed, "tar.zst");
        let img = image(id, ImageEncoding::Tarball);
        let dest = tmp.path().join("rootfs");

        store.unpack(&img, &dest).unwrap();
        assert!(dest.join("usr/bin/tool").is_file());
        assert!(is_unpacked(&img, &dest));

        // A second unpack must not touch the tree.
        fs::write(dest.join("scratch"), b"kept").unwrap();
        store.unpack(&img, &dest).unwrap();
        assert!(dest.join("scratch").exists());
    }

    #[test]
    fn plain_tar_unpacks() {
        let tmp = TempDir::new().unwrap();
        let src = tmp.path().join("src");
        fs::create_dir_all(&src).unwrap();
        fs::write(src.join("hello"), b"hi").unwrap();

        let store = ImageStore::new(tmp.path().join("downloads"), tmp.path().join("locks"));
        let id = store_blob(&store, &tar_of(&src), "tar");
        let dest = tmp.path().join("out");
        store
            .unpack(&image(id, ImageEncoding::Tarball), &dest)
            .unwrap();
        assert_eq!(fs::read(dest.join("hello")).unwrap(), b"hi");
    }

    #[test]
    fn corrupt_blob_is_unavailable() {
        let tmp = TempDir::new().unwrap();
        let store = ImageStore::new(tmp.path().join("downloads"), tmp.path().join("locks"));
        fs::create_dir_all(store.downloads_dir()).unwrap();
        let id = "ab".repeat(32);
        fs::write(store.downloads_dir().join(format!("{id}.tar")), b"garbage").unwrap();

        let err = store
            .unpack(&image(id.clone(), ImageEncoding::Tarball), &tmp.path().join("out"))
            .unwrap_err();
        assert!(matches!(err, ImageError::Unavailable { .. }), "{err}");
        assert!(!tmp.path().join("out").exists());

        let missing = image("cd".repeat(32), ImageEncoding::Squashfs);
        assert!(matches!(
            store.verified_blob(&missing),
            Err(ImageError::Unavailable { .. })
        ));
    }

    #[test]
    fn uid_copy_leaves_blob_intact() {
        let tmp = TempDir::new().unwrap();
        let store = ImageStore::new(tmp.path().join("downloads"), tmp.path().join("locks"));
        let bytes = SquashfsBuilder::new().ids(&[0, 0]).build();
        let id = store_blob(&store, &bytes, "squashfs");
        let img = image(id.clone(), ImageEncoding::Squashfs);

        let copy = store.squashfs_for_uid(&img, 1234).unwrap();
        assert_eq!(read_squashfs_ids(&copy).unwrap(), vec![1234, 1234]);
        // The cached blob still verifies.
        assert!(store.verified_blob(&img).is_ok());
        assert_eq!(store.squashfs_for_uid(&img, 1234).unwrap(), copy);
    }

    #[test]
    fn verification_is_remembered_until_the_blob_changes() {
        let tmp = TempDir::new().unwrap();
        let store = ImageStore::new(tmp.path().join("downloads"), tmp.path().join("locks"));
        let id = store_blob(&store, b"not really a tarball", "tar");
        let img = image(id, ImageEncoding::Tarball);

        let blob = store.verified_blob(&img).unwrap();
        assert!(stamp_path(&blob).is_file());
        assert_eq!(store.blob_path(&img), Some(blob.clone()));

        // Same size, inode and mtime: trusted without hashing.
        let mtime = fs::metadata(&blob).unwrap().modified().unwrap();
        let file = OpenOptions::new().write(true).open(&blob).unwrap();
        std::io::Write::write_all(&mut &file, b"NOT REALLY A TARBALL").unwrap();
        file.set_modified(mtime).unwrap();
        assert!(store.verified_blob(&img).is_ok());

        // Any change to the file's identity forces a fresh hash.
        file.set_modified(UNIX_EPOCH).unwrap();
        assert!(matches!(
            store.verified_blob(&img),
            Err(ImageError::Unavailable { .. })
        ));
        assert!(!stamp_path(&blob).exists());
    }

    #[test]
    fn shared_locks_coexist() {
        let tmp = TempDir::new().unwrap();
        let store = ImageStore::new(tmp.path().join("downloads"), tmp.path().join("locks"));
        let img = image("ef".repeat(32), ImageEncoding::Tarball);

        let first = store.lock_shared(&img).unwrap();
        let second = store.lock_shared(&img).unwrap();
        let writer = File::open(tmp.path().join(format!("locks/{}.lock", img.id))).unwrap();
        assert!(writer.try_lock_exclusive().is_err());
        drop((first, second));
        assert!(writer.try_lock_exclusive().is_ok());
    }

    #[test]
    fn lock_released_on_drop() {
        let tmp = TempDir::new().unwrap();
        let store = ImageStore::new(tmp.path().join("downloads"), tmp.path().join("locks"));
        let img = image("ef".repeat(32), ImageEncoding::Tarball);
        drop(store.lock(&img).unwrap());
        let _again = store.lock(&img).unwrap();
    }
}
