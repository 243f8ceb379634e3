//! Mach-O reader (thin files only).

use std::path::Path;

use goblin::mach::cputype::{CPU_TYPE_ARM, CPU_TYPE_ARM64, CPU_TYPE_X86, CPU_TYPE_X86_64};
use goblin::mach::load_command::CommandVariant;
use goblin::mach::MachO;

use super::{
    malformed, read_cstr, Dependency, MachineType, ObjectFormat, ObjectHandle, RecordKind,
    RelocationRecord, RelocationRecords, StringSlot,
};
use crate::error::ObjectError;

pub(super) fn parse(path: &Path, bytes: &[u8]) -> Result<ObjectHandle, ObjectError> {
    let macho = MachO::parse(bytes, 0).map_err(|e| malformed(path, e))?;

    let machine = match macho.header.cputype {
        CPU_TYPE_X86_64 => MachineType::X86_64,
        CPU_TYPE_X86 => MachineType::I386,
        CPU_TYPE_ARM64 => MachineType::Aarch64,
        CPU_TYPE_ARM => MachineType::Arm,
        other => MachineType::Other(other),
    };

    let mut dependencies = Vec::new();
    let mut records = Vec::new();
    let mut soname = None;

    for lc in &macho.load_commands {
        let (cmdsize, name_offset, is_id, is_rpath) = match &lc.command {
            CommandVariant::LoadDylib(c)
            | CommandVariant::LoadWeakDylib(c)
            | CommandVariant::ReexportDylib(c)
            | CommandVariant::LazyLoadDylib(c)
            | CommandVariant::LoadUpwardDylib(c) => (c.cmdsize, c.dylib.name, false, false),
            CommandVariant::IdDylib(c) => (c.cmdsize, c.dylib.name, true, false),
            CommandVariant::Rpath(c) => (c.cmdsize, c.path, false, true),
            _ => continue,
        };

        let start = lc.offset + name_offset as usize;
        let end = lc.offset + cmdsize as usize;
        if name_offset >= cmdsize || end > bytes.len() {
            return Err(malformed(
                path,
                format!("load command at 0x{:x} has an out of range string", lc.offset),
            ));
        }
        let value = read_cstr(bytes, start, end).ok_or_else(|| {
            malformed(
                path,
                format!("load command at 0x{:x} has an unterminated string", lc.offset),
            )
        })?;
        let slot = StringSlot {
            offset: start as u64,
            capacity: end - start,
            shared: false,
        };

        if is_id {
            soname = Some(value.to_string());
        } else if is_rpath {
            records.push(RelocationRecord {
                kind: RecordKind::LcRpath,
                path: value.to_string(),
                slot: Some(slot),
            });
        } else {
            dependencies.push(Dependency {
                name: value.to_string(),
                slot: Some(slot),
            });
        }
    }

    Ok(ObjectHandle {
        path: path.to_path_buf(),
        format: ObjectFormat::MachO,
        machine,
        little_endian: macho.little_endian,
        dependencies,
        records: RelocationRecords::Applicable(records),
        soname,
        interpreter: None,
        glibc_versions: Vec::new(),
    })
}
