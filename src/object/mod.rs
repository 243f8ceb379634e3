//! Object file inspection across ELF, Mach-O and PE.
//!
//! [`open`] sniffs the magic bytes, checks the file is at least as long as
//! its headers declare, then hands the mapped bytes to one parser per
//! [`ObjectFormat`]. The result is an owned [`ObjectHandle`] summary; the
//! file itself is never written here.
//!
//! Every string the fixer might rewrite (dependency names, search paths)
//! is recorded together with its [`StringSlot`], the byte range it
//! occupies in the file, so that short rewrites can be applied in place.

mod detect;
mod elf;
mod macho;
mod pe;

use std::fmt;
use std::fs::File;
use std::path::{Path, PathBuf};

use memmap2::Mmap;
use serde::Serialize;

use crate::error::ObjectError;
use crate::platform::{Arch, GlibcVersion, Os, Platform};

pub use detect::detect_format;

/// The executable formats the inspector understands.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum ObjectFormat {
    Elf,
    MachO,
    Pe,
}

impl ObjectFormat {
    /// Operating system whose loader consumes this format.
    pub fn os(self) -> Os {
        match self {
            ObjectFormat::Elf => Os::Linux,
            ObjectFormat::MachO => Os::MacOS,
            ObjectFormat::Pe => Os::Windows,
        }
    }
}

impl fmt::Display for ObjectFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            ObjectFormat::Elf => "ELF",
            ObjectFormat::MachO => "Mach-O",
            ObjectFormat::Pe => "PE",
        })
    }
}

/// CPU an object was compiled for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum MachineType {
    X86_64,
    I386,
    Aarch64,
    Arm,
    PowerPc64le,
    /// A machine this builder never targets, with the format's raw code.
    Other(u32),
}

impl MachineType {
    pub fn arch(self) -> Option<Arch> {
        match self {
            MachineType::X86_64 => Some(Arch::X86_64),
            MachineType::I386 => Some(Arch::I686),
            MachineType::Aarch64 => Some(Arch::Aarch64),
            MachineType::Arm => Some(Arch::Armv7l),
            MachineType::PowerPc64le => Some(Arch::Ppc64le),
            MachineType::Other(_) => None,
        }
    }
}

impl fmt::Display for MachineType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MachineType::Other(code) => write!(f, "unknown (0x{code:x})"),
            other => match other.arch() {
                Some(arch) => write!(f, "{arch}"),
                None => f.write_str("unknown"),
            },
        }
    }
}

/// Byte range of a NUL-terminated string inside the object file.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct StringSlot {
    /// File offset of the first byte.
    pub offset: u64,
    /// Bytes available, including the terminating NUL.
    pub capacity: usize,
    /// Another reference points into this range, so it cannot be rewritten in place.
    pub shared: bool,
}

impl StringSlot {
    /// Whether `value` can overwrite this slot without growing the file.
    pub fn fits(&self, value: &str) -> bool {
        !self.shared && value.len() < self.capacity && !value.as_bytes().contains(&0)
    }
}

/// One library reference as stored in the object.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Dependency {
    pub name: String,
    pub slot: Option<StringSlot>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum RecordKind {
    /// ELF `DT_RPATH`.
    Rpath,
    /// ELF `DT_RUNPATH`.
    Runpath,
    /// Mach-O `LC_RPATH`.
    LcRpath,
}

/// One search-path entry. ELF entries split from the same `DT_RPATH` or
/// `DT_RUNPATH` string share a slot.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RelocationRecord {
    pub kind: RecordKind,
    pub path: String,
    pub slot: Option<StringSlot>,
}

/// Search paths embedded in an object. PE has none by construction.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "status", content = "records", rename_all = "kebab-case")]
pub enum RelocationRecords {
    Applicable(Vec<RelocationRecord>),
    NotApplicable,
}

impl RelocationRecords {
    pub fn entries(&self) -> &[RelocationRecord] {
        match self {
            RelocationRecords::Applicable(records) => records,
            RelocationRecords::NotApplicable => &[],
        }
    }

    pub fn is_applicable(&self) -> bool {
        matches!(self, RelocationRecords::Applicable(_))
    }
}

/// Parsed summary of one compiled object.
#[derive(Debug, Clone, Serialize)]
pub struct ObjectHandle {
    path: PathBuf,
    format: ObjectFormat,
    machine: MachineType,
    little_endian: bool,
    dependencies: Vec<Dependency>,
    records: RelocationRecords,
    soname: Option<String>,
    interpreter: Option<String>,
    glibc_versions: Vec<GlibcVersion>,
}

impl ObjectHandle {
    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn format(&self) -> ObjectFormat {
        self.format
    }

    pub fn machine_type(&self) -> MachineType {
        self.machine
    }

    pub fn is_little_endian(&self) -> bool {
        self.little_endian
    }

    /// Library references in file order, duplicates preserved.
    pub fn dependency_paths(&self) -> Vec<&str> {
        self.dependencies.iter().map(|d| d.name.as_str()).collect()
    }

    pub fn dependencies(&self) -> &[Dependency] {
        &self.dependencies
    }

    pub fn existing_relocation_records(&self) -> &RelocationRecords {
        &self.records
    }

    /// ELF `DT_SONAME` or Mach-O `LC_ID_DYLIB`.
    pub fn soname(&self) -> Option<&str> {
        self.soname.as_deref()
    }

    /// ELF program interpreter.
    pub fn interpreter(&self) -> Option<&str> {
        self.interpreter.as_deref()
    }

    /// Newest `GLIBC_x.y` symbol version this object requires.
    pub fn required_glibc(&self) -> Option<GlibcVersion> {
        self.glibc_versions.iter().max().copied()
    }

    /// Whether this object can be loaded on `platform`.
    pub fn is_for_platform(&self, platform: &Platform) -> bool {
        self.format.os() == platform.os && self.machine.arch() == Some(platform.arch)
    }
}

/// Open and parse the object at `path`.
pub fn open(path: &Path) -> Result<ObjectHandle, ObjectError> {
    let io_err = |source| ObjectError::Io {
        path: path.to_path_buf(),
        source,
    };
    let file = File::open(path).map_err(io_err)?;
    let len = file.metadata().map_err(io_err)?.len();
    if len == 0 {
        return Err(ObjectError::UnsupportedFormat {
            path: path.to_path_buf(),
            detail: "empty file".to_string(),
        });
    }

    // SAFETY: the map is read-only and dropped before this function returns;
    // objects are not modified while an audit is reading them.
    let map = unsafe { Mmap::map(&file) }.map_err(io_err)?;
    parse_bytes(path, &map)
}

/// Parse an object already held in memory. `path` is used for reporting only.
pub fn parse_bytes(path: &Path, bytes: &[u8]) -> Result<ObjectHandle, ObjectError> {
    match detect_format(path, bytes)? {
        ObjectFormat::Elf => elf::parse(path, bytes),
        ObjectFormat::MachO => macho::parse(path, bytes),
        ObjectFormat::Pe => pe::parse(path, bytes),
    }
}

/// Whether `path` is an object file, without reporting why not.
pub fn is_object(path: &Path) -> bool {
    open(path).is_ok()
}

fn malformed(path: &Path, message: impl fmt::Display) -> ObjectError {
    ObjectError::Malformed {
        path: path.to_path_buf(),
        message: message.to_string(),
    }
}

pub(crate) fn read_u16(bytes: &[u8], offset: usize, le: bool) -> Option<u16> {
    let raw: [u8; 2] = bytes.get(offset..offset.checked_add(2)?)?.try_into().ok()?;
    Some(if le {
        u16::from_le_bytes(raw)
    } else {
        u16::from_be_bytes(raw)
    })
}

pub(crate) fn read_u32(bytes: &[u8], offset: usize, le: bool) -> Option<u32> {
    let raw: [u8; 4] = bytes.get(offset..offset.checked_add(4)?)?.try_into().ok()?;
    Some(if le {
        u32::from_le_bytes(raw)
    } else {
        u32::from_be_bytes(raw)
    })
}

pub(crate) fn read_u64(bytes: &[u8], offset: usize, le: bool) -> Option<u64> {
    let raw: [u8; 8] = bytes.get(offset..offset.checked_add(8)?)?.try_into().ok()?;
    Some(if le {
        u64::from_le_bytes(raw)
    } else {
        u64::from_be_bytes(raw)
    })
}

/// NUL-terminated string starting at `offset`, bounded by `end`.
pub(crate) fn read_cstr(bytes: &[u8], offset: usize, end: usize) -> Option<&str> {
    let window = bytes.get(offset..end.min(bytes.len()))?;
    let len = window.iter().position(|&b| b == 0)?;
    std::str::from_utf8(&window[..len]).ok()
}
