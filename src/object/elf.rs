//! ELF reader.

use std::path::Path;

use goblin::elf::dynamic::{
    DT_NEEDED, DT_RPATH, DT_RUNPATH, DT_SONAME, DT_STRSZ, DT_STRTAB, DT_VERNEED, DT_VERNEEDNUM,
};
use goblin::elf::header::{EM_386, EM_AARCH64, EM_ARM, EM_PPC64, EM_X86_64};
use goblin::elf::program_header::{ProgramHeader, PT_LOAD};
use goblin::elf::Elf;

use super::{
    malformed, read_cstr, read_u16, read_u32, Dependency, MachineType, ObjectFormat,
    ObjectHandle, RecordKind, RelocationRecord, RelocationRecords, StringSlot,
};
use crate::error::ObjectError;
use crate::platform::GlibcVersion;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Owner {
    Dyn(usize),
    Other,
}

pub(super) fn parse(path: &Path, bytes: &[u8]) -> Result<ObjectHandle, ObjectError> {
    let elf = Elf::parse(bytes).map_err(|e| malformed(path, e))?;
    let le = elf.little_endian;

    let machine = match elf.header.e_machine {
        EM_X86_64 => MachineType::X86_64,
        EM_386 => MachineType::I386,
        EM_AARCH64 => MachineType::Aarch64,
        EM_ARM => MachineType::Arm,
        EM_PPC64 if le => MachineType::PowerPc64le,
        other => MachineType::Other(u32::from(other)),
    };

    let mut handle = ObjectHandle {
        path: path.to_path_buf(),
        format: ObjectFormat::Elf,
        machine,
        little_endian: le,
        dependencies: Vec::new(),
        records: RelocationRecords::Applicable(Vec::new()),
        soname: None,
        interpreter: elf.interpreter.map(str::to_string),
        glibc_versions: Vec::new(),
    };

    // Static executables and relocatable objects have no dynamic section.
    let Some(dynamic) = elf.dynamic.as_ref() else {
        return Ok(handle);
    };
    let dyns = &dynamic.dyns;
    let find = |tag: u64| dyns.iter().find(|d| d.d_tag == tag).map(|d| d.d_val);

    let strtab_vaddr = find(DT_STRTAB)
        .ok_or_else(|| malformed(path, "dynamic section without DT_STRTAB"))?;
    let strtab = vm_to_offset(&elf.program_headers, strtab_vaddr)
        .ok_or_else(|| malformed(path, "DT_STRTAB is not inside a loaded segment"))?
        as usize;
    let strtab_end = match find(DT_STRSZ) {
        Some(size) => strtab.saturating_add(size as usize).min(bytes.len()),
        None => bytes.len(),
    };
    let string_at = |offset: u64| {
        let start = strtab.checked_add(offset as usize)?;
        read_cstr(bytes, start, strtab_end).map(|s| (start, s))
    };

    let mut refs: Vec<(u64, Owner)> = Vec::new();
    for (index, d) in dyns.iter().enumerate() {
        if matches!(d.d_tag, DT_NEEDED | DT_RPATH | DT_RUNPATH | DT_SONAME) {
            refs.push((d.d_val, Owner::Dyn(index)));
        }
    }
    for sym in elf.dynsyms.iter() {
        if sym.st_name != 0 {
            refs.push((sym.st_name as u64, Owner::Other));
        }
    }

    if let (Some(vaddr), Some(count)) = (find(DT_VERNEED), find(DT_VERNEEDNUM)) {
        let offset = vm_to_offset(&elf.program_headers, vaddr)
            .ok_or_else(|| malformed(path, "DT_VERNEED is not inside a loaded segment"))?;
        for name in walk_verneed(bytes, offset as usize, count, le, &mut refs) {
            if let Some((_, version)) = string_at(name) {
                if version.starts_with("GLIBC_") {
                    if let Some(v) = GlibcVersion::parse(version) {
                        handle.glibc_versions.push(v);
                    }
                }
            }
        }
    }

    let slot_for = |index: usize, value_offset: u64, len: usize, start: usize| {
        let end = value_offset.saturating_add(len as u64);
        let shared = refs.iter().any(|&(r, owner)| {
            owner != Owner::Dyn(index) && r >= value_offset && r <= end
        });
        StringSlot {
            offset: start as u64,
            capacity: len + 1,
            shared,
        }
    };

    let mut records = Vec::new();
    for (index, d) in dyns.iter().enumerate() {
        let kind = match d.d_tag {
            DT_NEEDED | DT_SONAME => None,
            DT_RPATH => Some(RecordKind::Rpath),
            DT_RUNPATH => Some(RecordKind::Runpath),
            _ => continue,
        };
        let (start, value) = string_at(d.d_val).ok_or_else(|| {
            malformed(path, format!("dynamic string at 0x{:x} is unreadable", d.d_val))
        })?;
        let slot = slot_for(index, d.d_val, value.len(), start);
        match (d.d_tag, kind) {
            (DT_NEEDED, _) => handle.dependencies.push(Dependency {
                name: value.to_string(),
                slot: Some(slot),
            }),
            (DT_SONAME, _) => handle.soname = Some(value.to_string()),
            (_, Some(kind)) => {
                for entry in value.split(':').filter(|e| !e.is_empty()) {
                    records.push(RelocationRecord {
                        kind,
                        path: entry.to_string(),
                        slot: Some(slot),
                    });
                }
            }
            _ => {}
        }
    }
    handle.records = RelocationRecords::Applicable(records);

    Ok(handle)
}

/// Map a virtual address to a file offset through the PT_LOAD segments.
fn vm_to_offset(phdrs: &[ProgramHeader], vaddr: u64) -> Option<u64> {
    phdrs
        .iter()
        .filter(|ph| ph.p_type == PT_LOAD)
        .find(|ph| {
            vaddr >= ph.p_vaddr
                && ph
                    .p_vaddr
                    .checked_add(ph.p_filesz)
                    .is_some_and(|end| vaddr < end)
        })
        .and_then(|ph| (vaddr - ph.p_vaddr).checked_add(ph.p_offset))
}

/// Walk the version-needed chain, recording every string reference it
/// holds, and return the offsets of the version names.
fn walk_verneed(
    bytes: &[u8],
    mut offset: usize,
    count: u64,
    le: bool,
    refs: &mut Vec<(u64, Owner)>,
) -> Vec<u64> {
    let mut names = Vec::new();
    let at = |base: usize, delta: usize| base.checked_add(delta);
    for _ in 0..count {
        let field16 = |delta| at(offset, delta).and_then(|o| read_u16(bytes, o, le));
        let field32 = |delta| at(offset, delta).and_then(|o| read_u32(bytes, o, le));
        let (Some(cnt), Some(file), Some(aux), Some(next)) =
            (field16(2), field32(4), field32(8), field32(12))
        else {
            break;
        };
        refs.push((u64::from(file), Owner::Other));

        let mut aux_offset = at(offset, aux as usize);
        for _ in 0..cnt {
            let Some(base) = aux_offset else {
                break;
            };
            let (Some(name), Some(aux_next)) = (
                at(base, 8).and_then(|o| read_u32(bytes, o, le)),
                at(base, 12).and_then(|o| read_u32(bytes, o, le)),
            ) else {
                break;
            };
            refs.push((u64::from(name), Owner::Other));
            names.push(u64::from(name));
            if aux_next == 0 {
                break;
            }
            aux_offset = at(base, aux_next as usize);
        }

        match at(offset, next as usize) {
            Some(following) if next != 0 => offset = following,
            _ => break,
        }
    }
    names
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::ElfBuilder;

    /// Offset of the first program header's `p_filesz` in builder output.
    const LOAD_FILESZ: usize = 64 + 32;
    const LOAD_VADDR: usize = 64 + 16;

    fn put_u64(buf: &mut [u8], offset: usize, value: u64) {
        buf[offset..offset + 8].copy_from_slice(&value.to_le_bytes());
    }

    #[test]
    fn oversized_load_segment_is_malformed() {
        let mut bytes = ElfBuilder::new().needed("libc.so.6").build();
        put_u64(&mut bytes, LOAD_VADDR, 1);
        put_u64(&mut bytes, LOAD_FILESZ, u64::MAX);

        match parse(Path::new("libbroken.so"), &bytes) {
            Err(ObjectError::Malformed { .. }) => {}
            other => panic!("expected a malformed object, got {other:?}"),
        }
    }

    #[test]
    fn segment_offsets_do_not_wrap() {
        let load = ProgramHeader {
            p_type: PT_LOAD,
            p_vaddr: 0,
            p_filesz: u64::MAX,
            p_offset: u64::MAX,
            ..Default::default()
        };
        assert_eq!(vm_to_offset(&[load.clone()], 0), Some(u64::MAX));
        assert_eq!(vm_to_offset(&[load], 1), None);
    }

    #[test]
    fn verneed_chain_past_the_end_stops() {
        let mut refs = Vec::new();
        let mut bytes = vec![0u8; 16];
        bytes[2] = 1;
        bytes[8..12].copy_from_slice(&u32::MAX.to_le_bytes());
        bytes[12..16].copy_from_slice(&u32::MAX.to_le_bytes());
        assert!(walk_verneed(&bytes, usize::MAX - 4, 3, true, &mut refs).is_empty());
        assert!(walk_verneed(&bytes, 0, u64::MAX, true, &mut refs).is_empty());
    }
}
