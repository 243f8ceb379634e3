//! Loop mounts and the mount table.

use std::fs;
use std::path::{Path, PathBuf};
use std::process::Command;

use tracing::{debug, info};

use crate::error::ImageError;

/// Mount points listed in `/proc/self/mountinfo`, unescaped.
pub fn mount_points() -> Result<Vec<PathBuf>, ImageError> {
    let text = fs::read_to_string("/proc/self/mountinfo")
        .map_err(|e| ImageError::io("reading /proc/self/mountinfo", e))?;
    Ok(parse_mountinfo(&text))
}

fn parse_mountinfo(text: &str) -> Vec<PathBuf> {
    text.lines()
        .filter_map(|line| line.split(' ').nth(4))
        .map(|field| PathBuf::from(unescape_octal(field)))
        .collect()
}

/// Undo the `\040`-style escaping the kernel applies to mountinfo paths.
fn unescape_octal(field: &str) -> String {
    let bytes = field.as_bytes();
    let mut out = Vec::with_capacity(bytes.len());
    let mut i = 0;
    while i < bytes.len() {
        if bytes[i] == b'\\' && i + 4 <= bytes.len() {
            let digits = std::str::from_utf8(&bytes[i + 1..i + 4]).unwrap_or("");
            if let Ok(value) = u8::from_str_radix(digits, 8) {
                out.push(value);
                i += 4;
                continue;
            }
        }
        out.push(bytes[i]);
        i += 1;
    }
    String::from_utf8_lossy(&out).into_owned()
}

/// Whether something is mounted exactly at `path`.
pub fn is_mounted(path: &Path) -> Result<bool, ImageError> {
    let Ok(target) = fs::canonicalize(path) else {
        return Ok(false);
    };
    Ok(mount_points()?.iter().any(|mp| *mp == target))
}

/// Loop-mount the squashfs `image` read-only at `mountpoint`.
/// No-op when something is already mounted there.
pub fn loop_mount(image: &Path, mountpoint: &Path) -> Result<(), ImageError> {
    if is_mounted(mountpoint)? {
        debug!(mountpoint = %mountpoint.display(), "already mounted");
        return Ok(());
    }
    fs::create_dir_all(mountpoint)
        .map_err(|e| ImageError::io(format!("creating {}", mountpoint.display()), e))?;

    let mut cmd = privileged("mount");
    cmd.args(["-t", "squashfs", "-o", "loop,ro"])
        .arg(image)
        .arg(mountpoint);
    let output = cmd.output().map_err(|e| ImageError::Mount {
        image: image.to_path_buf(),
        mountpoint: mountpoint.to_path_buf(),
        reason: format!("running mount: {e}"),
    })?;
    if !output.status.success() {
        return Err(ImageError::Mount {
            image: image.to_path_buf(),
            mountpoint: mountpoint.to_path_buf(),
            reason: String::from_utf8_lossy(&output.stderr).trim().to_string(),
        });
    }
    info!(image = %image.display(), mountpoint = %mountpoint.display(), "loop-mounted image");
    Ok(())
}

/// Unmount `mountpoint`. Returns false when nothing was mounted there.
pub fn unmount(mountpoint: &Path) -> Result<bool, ImageError> {
    if !is_mounted(mountpoint)? {
        return Ok(false);
    }
    let output = privileged("umount")
        .arg(mountpoint)
        .output()
        .map_err(|e| ImageError::io("running umount", e))?;
    if !output.status.success() {
        return Err(ImageError::Mount {
            image: PathBuf::new(),
            mountpoint: mountpoint.to_path_buf(),
            reason: format!(
                "umount failed: {}",
                String::from_utf8_lossy(&output.stderr).trim()
            ),
        });
    }
    debug!(mountpoint = %mountpoint.display(), "unmounted");
    Ok(true)
}

/// `program` run directly as root, otherwise through non-interactive sudo.
fn privileged(program: &str) -> Command {
    if nix::unistd::geteuid().is_root() {
        Command::new(program)
    } else {
        let mut cmd = Command::new("sudo");
        cmd.arg("-n").arg(program);
        cmd
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_mountinfo() {
        let text = "\
22 1 8:1 / / rw,relatime shared:1 - ext4 /dev/sda1 rw
40 22 7:0 / /opt/with\\040space ro,relatime - squashfs /dev/loop0 ro
";
        assert_eq!(
            parse_mountinfo(text),
            vec![PathBuf::from("/"), PathBuf::from("/opt/with space")]
        );
    }

    #[test]
    fn unmounting_unmounted_is_noop() {
        let tmp = tempfile::TempDir::new().unwrap();
        assert!(!unmount(tmp.path()).unwrap());
        assert!(!unmount(&tmp.path().join("missing")).unwrap());
    }

    #[test]
    fn root_is_mounted() {
        if !Path::new("/proc/self/mountinfo").exists() {
            eprintln!("skipping: no /proc/self/mountinfo");
            return;
        }
        assert!(is_mounted(Path::new("/")).unwrap());
    }
}
