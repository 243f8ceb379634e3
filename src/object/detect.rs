use std::path::Path;

use super::{read_u16, read_u32, read_u64, ObjectFormat};
use crate::error::ObjectError;

const ELF_MAGIC: &[u8; 4] = b"\x7fELF";
const MH_MAGIC: u32 = 0xfeed_face;
const MH_MAGIC_64: u32 = 0xfeed_facf;
const MH_CIGAM: u32 = 0xcefa_edfe;
const MH_CIGAM_64: u32 = 0xcffa_edfe;
const FAT_MAGIC: u32 = 0xcafe_babe;
const FAT_MAGIC_64: u32 = 0xcafe_babf;
const DOS_HEADER_SIZE: u64 = 64;
const PE_LFANEW_OFFSET: usize = 0x3c;
const PE_SIGNATURE: &[u8; 4] = b"PE\0\0";

/// Identify the object format of `bytes` and make sure the file is at
/// least as long as its headers declare.
pub fn detect_format(path: &Path, bytes: &[u8]) -> Result<ObjectFormat, ObjectError> {
    let unsupported = |detail: &str| ObjectError::UnsupportedFormat {
        path: path.to_path_buf(),
        detail: detail.to_string(),
    };
    let truncated = |declared: u64| ObjectError::Truncated {
        path: path.to_path_buf(),
        declared,
        actual: bytes.len() as u64,
    };

    if bytes.len() < 4 {
        return Err(unsupported("too short to carry a magic number"));
    }

    if &bytes[..4] == ELF_MAGIC {
        let (is_64, header) = match bytes.get(4) {
            Some(2) => (true, 64u64),
            Some(1) => (false, 52u64),
            Some(_) => return Err(unsupported("unknown ELF class")),
            None => return Err(truncated(52)),
        };
        let le = match bytes.get(5) {
            Some(1) => true,
            Some(2) => false,
            Some(_) => return Err(unsupported("unknown ELF data encoding")),
            None => return Err(truncated(header)),
        };
        if (bytes.len() as u64) < header {
            return Err(truncated(header));
        }
        let (phoff, phentsize, phnum) = if is_64 {
            (
                read_u64(bytes, 32, le),
                read_u16(bytes, 54, le),
                read_u16(bytes, 56, le),
            )
        } else {
            (
                read_u32(bytes, 28, le).map(u64::from),
                read_u16(bytes, 42, le),
                read_u16(bytes, 44, le),
            )
        };
        let (Some(phoff), Some(phentsize), Some(phnum)) = (phoff, phentsize, phnum) else {
            return Err(truncated(header));
        };
        let declared = phoff.saturating_add(u64::from(phentsize) * u64::from(phnum));
        if phnum > 0 && (bytes.len() as u64) < declared {
            return Err(truncated(declared));
        }
        return Ok(ObjectFormat::Elf);
    }

    let magic_le = u32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]);
    let magic_be = u32::from_be_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]);
    if magic_be == FAT_MAGIC || magic_be == FAT_MAGIC_64 {
        return Err(unsupported("universal (fat) Mach-O"));
    }
    let macho = match magic_le {
        MH_MAGIC => Some((false, true)),
        MH_MAGIC_64 => Some((true, true)),
        MH_CIGAM => Some((false, false)),
        MH_CIGAM_64 => Some((true, false)),
        _ => None,
    };
    if let Some((is_64, le)) = macho {
        let header: u64 = if is_64 { 32 } else { 28 };
        if (bytes.len() as u64) < header {
            return Err(truncated(header));
        }
        let sizeofcmds = read_u32(bytes, 20, le).map(u64::from).unwrap_or(0);
        if (bytes.len() as u64) < header + sizeofcmds {
            return Err(truncated(header + sizeofcmds));
        }
        return Ok(ObjectFormat::MachO);
    }

    if &bytes[..2] == b"MZ" {
        if (bytes.len() as u64) < DOS_HEADER_SIZE {
            return Err(truncated(DOS_HEADER_SIZE));
        }
        let lfanew = read_u32(bytes, PE_LFANEW_OFFSET, true).map(u64::from).unwrap_or(0);
        // Signature and COFF file header.
        let coff_end = lfanew + 24;
        if (bytes.len() as u64) < coff_end {
            return Err(truncated(coff_end));
        }
        let sig_at = lfanew as usize;
        if bytes.get(sig_at..sig_at + 4) != Some(PE_SIGNATURE.as_slice()) {
            return Err(unsupported("DOS executable without a PE header"));
        }
        let optional = read_u16(bytes, sig_at + 20, true).map(u64::from).unwrap_or(0);
        if (bytes.len() as u64) < coff_end + optional {
            return Err(truncated(coff_end + optional));
        }
        return Ok(ObjectFormat::Pe);
    }

    Err(unsupported("unrecognized magic"))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn detect(bytes: &[u8]) -> Result<ObjectFormat, ObjectError> {
        detect_format(Path::new("/t/obj"), bytes)
    }

    #[test]
    fn fat_macho_is_unsupported() {
        let bytes = [0xca, 0xfe, 0xba, 0xbe, 0, 0, 0, 2];
        let err = detect(&bytes).unwrap_err();
        assert!(err.to_string().contains("universal"));
    }

    #[test]
    fn macho_shorter_than_sizeofcmds_is_truncated() {
        let mut bytes = vec![0u8; 32];
        bytes[..4].copy_from_slice(&MH_MAGIC_64.to_le_bytes());
        bytes[20..24].copy_from_slice(&100u32.to_le_bytes());
        assert!(matches!(
            detect(&bytes),
            Err(ObjectError::Truncated { declared: 132, actual: 32, .. })
        ));
    }

    #[test]
    fn dos_stub_without_pe_is_unsupported() {
        let mut bytes = vec![0u8; 128];
        bytes[..2].copy_from_slice(b"MZ");
        bytes[0x3c..0x40].copy_from_slice(&64u32.to_le_bytes());
        assert!(matches!(
            detect(&bytes),
            Err(ObjectError::UnsupportedFormat { .. })
        ));
        assert!(matches!(
            detect(&bytes[..20]),
            Err(ObjectError::Truncated { declared: 64, .. })
        ));
    }

    #[test]
    fn shell_scripts_are_unsupported() {
        assert!(detect(b"#!/bin/sh\necho hi\n").unwrap_err().is_not_an_object());
    }
}
