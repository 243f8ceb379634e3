//! In-place ownership rewrite for squashfs images.
//!
//! A squashfs image stores every uid and gid it uses once, in the id
//! table. Pointing every id at the invoking user makes the whole image
//! appear owned by them without re-packing anything.

use std::fs::{File, OpenOptions};
use std::os::unix::fs::FileExt;
use std::path::Path;

use tracing::debug;

use crate::error::ImageError;

const SQUASHFS_MAGIC: u32 = 0x7371_7368;
const SUPERBLOCK_LEN: usize = 96;
const METADATA_BLOCK_LEN: usize = 8192;
const METADATA_UNCOMPRESSED: u16 = 0x8000;

/// Superblock fields the rewrite needs.
#[derive(Debug, Clone, Copy)]
struct Superblock {
    id_count: u16,
    bytes_used: u64,
    id_table_start: u64,
}

/// Set every entry of the id table of the squashfs image at `path` to `uid`.
///
/// Returns the number of ids rewritten. Fails without touching the file
/// when any id metadata block is compressed.
pub fn rewrite_squashfs_uids(path: &Path, uid: u32) -> Result<usize, ImageError> {
    let file = OpenOptions::new()
        .read(true)
        .write(true)
        .open(path)
        .map_err(|e| ImageError::io(format!("opening {}", path.display()), e))?;

    let sb = read_superblock(&file, path)?;
    let blocks = (usize::from(sb.id_count) * 4).div_ceil(METADATA_BLOCK_LEN);

    let mut pointers = vec![0u8; blocks * 8];
    read_at(&file, path, &mut pointers, sb.id_table_start)?;

    // Validate every block before writing any of them.
    let mut plan = Vec::with_capacity(blocks);
    let mut remaining = usize::from(sb.id_count);
    for chunk in pointers.chunks_exact(8) {
        let mut raw = [0u8; 8];
        raw.copy_from_slice(chunk);
        let block_start = u64::from_le_bytes(raw);

        let mut header = [0u8; 2];
        read_at(&file, path, &mut header, block_start)?;
        let header = u16::from_le_bytes(header);
        if header & METADATA_UNCOMPRESSED == 0 {
            return Err(squashfs_err(
                path,
                "id table is compressed; rebuild the image with -no-id-table-compression",
            ));
        }
        let size = usize::from(header & !METADATA_UNCOMPRESSED);
        let ids_here = remaining.min(METADATA_BLOCK_LEN / 4);
        if size < ids_here * 4 {
            return Err(squashfs_err(
                path,
                format!("id block at {block_start} holds {size} bytes, need {}", ids_here * 4),
            ));
        }
        let data_start = block_start + 2;
        if data_start + (ids_here * 4) as u64 > sb.bytes_used {
            return Err(squashfs_err(path, "id block runs past the end of the image"));
        }
        plan.push((data_start, ids_here));
        remaining -= ids_here;
    }

    let replacement = uid.to_le_bytes();
    let mut rewritten = 0;
    for (data_start, count) in plan {
        let block: Vec<u8> = replacement
            .iter()
            .copied()
            .cycle()
            .take(count * 4)
            .collect();
        file.write_all_at(&block, data_start)
            .map_err(|e| ImageError::io(format!("writing {}", path.display()), e))?;
        rewritten += count;
    }
    file.sync_all()
        .map_err(|e| ImageError::io(format!("syncing {}", path.display()), e))?;

    debug!(image = %path.display(), uid, ids = rewritten, "rewrote squashfs id table");
    Ok(rewritten)
}

/// The ids currently stored in the image's (uncompressed) id table.
pub fn read_squashfs_ids(path: &Path) -> Result<Vec<u32>, ImageError> {
    let file =
        File::open(path).map_err(|e| ImageError::io(format!("opening {}", path.display()), e))?;
    let sb = read_superblock(&file, path)?;
    let blocks = (usize::from(sb.id_count) * 4).div_ceil(METADATA_BLOCK_LEN);
    let mut pointers = vec![0u8; blocks * 8];
    read_at(&file, path, &mut pointers, sb.id_table_start)?;

    let mut ids = Vec::with_capacity(usize::from(sb.id_count));
    for chunk in pointers.chunks_exact(8) {
        let mut raw = [0u8; 8];
        raw.copy_from_slice(chunk);
        let block_start = u64::from_le_bytes(raw);
        let mut header = [0u8; 2];
        read_at(&file, path, &mut header, block_start)?;
        if u16::from_le_bytes(header) & METADATA_UNCOMPRESSED == 0 {
            return Err(squashfs_err(path, "id table is compressed"));
        }
        let count = (usize::from(sb.id_count) - ids.len()).min(METADATA_BLOCK_LEN / 4);
        let mut data = vec![0u8; count * 4];
        read_at(&file, path, &mut data, block_start + 2)?;
        ids.extend(
            data.chunks_exact(4)
                .map(|c| u32::from_le_bytes([c[0], c[1], c[2], c[3]])),
        );
    }
    Ok(ids)
}

fn read_superblock(file: &File, path: &Path) -> Result<Superblock, ImageError> {
    let mut sb = [0u8; SUPERBLOCK_LEN];
    read_at(file, path, &mut sb, 0)?;

    let magic = u32::from_le_bytes([sb[0], sb[1], sb[2], sb[3]]);
    if magic != SQUASHFS_MAGIC {
        return Err(squashfs_err(path, format!("bad magic {magic:#x}")));
    }
    let major = u16::from_le_bytes([sb[28], sb[29]]);
    if major != 4 {
        return Err(squashfs_err(path, format!("unsupported squashfs version {major}")));
    }
    let le_u64 = |at: usize| {
        let mut raw = [0u8; 8];
        raw.copy_from_slice(&sb[at..at + 8]);
        u64::from_le_bytes(raw)
    };
    Ok(Superblock {
        id_count: u16::from_le_bytes([sb[26], sb[27]]),
        bytes_used: le_u64(40),
        id_table_start: le_u64(48),
    })
}

fn read_at(file: &File, path: &Path, buf: &mut [u8], offset: u64) -> Result<(), ImageError> {
    file.read_exact_at(buf, offset).map_err(|e| {
        if e.kind() == std::io::ErrorKind::UnexpectedEof {
            squashfs_err(path, format!("truncated reading {} bytes at {offset}", buf.len()))
        } else {
            ImageError::io(format!("reading {}", path.display()), e)
        }
    })
}

fn squashfs_err(path: &Path, reason: impl Into<String>) -> ImageError {
    ImageError::Squashfs {
        path: path.to_path_buf(),
        reason: reason.into(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::SquashfsBuilder;
    use std::fs;
    use tempfile::TempDir;

    #[test]
    fn rewrites_every_id() {
        let tmp = TempDir::new().unwrap();
        let image = tmp.path().join("rootfs.squashfs");
        SquashfsBuilder::new().ids(&[0, 1000, 65534]).write(&image).unwrap();
        let before = fs::read(&image).unwrap();

        assert_eq!(rewrite_squashfs_uids(&image, 4242).unwrap(), 3);
        assert_eq!(read_squashfs_ids(&image).unwrap(), vec![4242, 4242, 4242]);

        // Only the id entries changed.
        let after = fs::read(&image).unwrap();
        assert_eq!(before.len(), after.len());
        let changed: Vec<usize> = (0..before.len()).filter(|&i| before[i] != after[i]).collect();
        assert!(changed.iter().all(|&i| (98..98 + 12).contains(&i)));
    }

    #[test]
    fn compressed_table_is_rejected_untouched() {
        let tmp = TempDir::new().unwrap();
        let image = tmp.path().join("shard.squashfs");
        SquashfsBuilder::new()
            .ids(&[0, 100])
            .compressed_ids()
            .write(&image)
            .unwrap();
        let before = fs::read(&image).unwrap();

        let err = rewrite_squashfs_uids(&image, 1000).unwrap_err();
        assert!(matches!(err, ImageError::Squashfs { .. }), "{err}");
        assert_eq!(fs::read(&image).unwrap(), before);
    }

    #[test]
    fn not_a_squashfs() {
        let tmp = TempDir::new().unwrap();
        let image = tmp.path().join("junk");
        fs::write(&image, vec![0u8; 200]).unwrap();
        let err = rewrite_squashfs_uids(&image, 1).unwrap_err();
        assert!(err.to_string().contains("bad magic"), "{err}");
    }
}
