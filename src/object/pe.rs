//! PE reader. Windows binaries carry no search paths, so only the machine
//! and the imported DLL names are of interest.

use std::path::Path;

use goblin::pe::header::{
    COFF_MACHINE_ARM64, COFF_MACHINE_ARMNT, COFF_MACHINE_X86, COFF_MACHINE_X86_64,
};
use goblin::pe::PE;

use super::{malformed, Dependency, MachineType, ObjectFormat, ObjectHandle, RelocationRecords};
use crate::error::ObjectError;

pub(super) fn parse(path: &Path, bytes: &[u8]) -> Result<ObjectHandle, ObjectError> {
    let pe = PE::parse(bytes).map_err(|e| malformed(path, e))?;

    let machine = match pe.header.coff_header.machine {
        COFF_MACHINE_X86_64 => MachineType::X86_64,
        COFF_MACHINE_X86 => MachineType::I386,
        COFF_MACHINE_ARM64 => MachineType::Aarch64,
        COFF_MACHINE_ARMNT => MachineType::Arm,
        other => MachineType::Other(u32::from(other)),
    };

    // `libraries` is sorted and deduplicated; the import directory keeps file order.
    let dependencies = pe
        .import_data
        .as_ref()
        .map(|imports| {
            imports
                .import_data
                .iter()
                .map(|entry| Dependency {
                    name: entry.name.to_string(),
                    slot: None,
                })
                .collect()
        })
        .unwrap_or_default();

    Ok(ObjectHandle {
        path: path.to_path_buf(),
        format: ObjectFormat::Pe,
        machine,
        little_endian: true,
        dependencies,
        records: RelocationRecords::NotApplicable,
        soname: pe.name.map(str::to_string),
        interpreter: None,
        glibc_versions: Vec::new(),
    })
}
