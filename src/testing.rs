//! Synthetic object and image builders for tests.
//!
//! These produce the smallest files the inspector, fixer and squashfs
//! patcher accept: a 64-bit little-endian ELF shared object with a
//! dynamic section, a 64-bit Mach-O with dylib and rpath load commands,
//! a PE32+ image with one `.idata` section, and a squashfs superblock with
//! an id table.

use std::fs;
use std::io;
use std::path::Path;

const EM_X86_64: u16 = 62;
const EM_AARCH64: u16 = 183;

const DT_NULL: u64 = 0;
const DT_NEEDED: u64 = 1;
const DT_STRTAB: u64 = 5;
const DT_STRSZ: u64 = 10;
const DT_SONAME: u64 = 14;
const DT_RPATH: u64 = 15;
const DT_RUNPATH: u64 = 29;
const DT_VERNEED: u64 = 0x6fff_fffe;
const DT_VERNEEDNUM: u64 = 0x6fff_ffff;

fn align(value: usize, to: usize) -> usize {
    value.div_ceil(to) * to
}

fn put_u16(buf: &mut [u8], at: usize, v: u16) {
    buf[at..at + 2].copy_from_slice(&v.to_le_bytes());
}

fn put_u32(buf: &mut [u8], at: usize, v: u32) {
    buf[at..at + 4].copy_from_slice(&v.to_le_bytes());
}

fn put_u64(buf: &mut [u8], at: usize, v: u64) {
    buf[at..at + 8].copy_from_slice(&v.to_le_bytes());
}

fn write_file(path: &Path, bytes: &[u8]) -> io::Result<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)?;
    }
    fs::write(path, bytes)
}

/// String table that reuses identical strings, as linkers do.
struct StrTab {
    bytes: Vec<u8>,
}

impl StrTab {
    fn new() -> Self {
        Self { bytes: vec![0] }
    }

    fn intern(&mut self, s: &str) -> u32 {
        let needle: Vec<u8> = s.bytes().chain(std::iter::once(0)).collect();
        let mut start = 1;
        while start + needle.len() <= self.bytes.len() {
            if self.bytes[start..start + needle.len()] == needle[..]
                && self.bytes[start - 1] == 0
            {
                return start as u32;
            }
            start += 1;
        }
        let offset = self.bytes.len() as u32;
        self.bytes.extend_from_slice(&needle);
        offset
    }
}

#[derive(Debug, Clone)]
pub struct ElfBuilder {
    machine: u16,
    needed: Vec<String>,
    soname: Option<String>,
    rpaths: Vec<String>,
    runpaths: Vec<String>,
    versions: Vec<(String, String)>,
}

impl Default for ElfBuilder {
    fn default() -> Self {
        Self::new()
    }
}

impl ElfBuilder {
    pub fn new() -> Self {
        Self {
            machine: EM_X86_64,
            needed: Vec::new(),
            soname: None,
            rpaths: Vec::new(),
            runpaths: Vec::new(),
            versions: Vec::new(),
        }
    }

    pub fn machine_aarch64(mut self) -> Self {
        self.machine = EM_AARCH64;
        self
    }

    pub fn needed(mut self, name: &str) -> Self {
        self.needed.push(name.to_string());
        self
    }

    pub fn soname(mut self, name: &str) -> Self {
        self.soname = Some(name.to_string());
        self
    }

    /// Adds one `DT_RPATH` entry (the value may contain `:`).
    pub fn rpath(mut self, value: &str) -> Self {
        self.rpaths.push(value.to_string());
        self
    }

    /// Adds one `DT_RUNPATH` entry (the value may contain `:`).
    pub fn runpath(mut self, value: &str) -> Self {
        self.runpaths.push(value.to_string());
        self
    }

    /// Require symbol version `version` (e.g. `GLIBC_2.17`) from `file`.
    pub fn glibc_requirement(mut self, file: &str, version: &str) -> Self {
        self.versions.push((file.to_string(), version.to_string()));
        self
    }

    pub fn build(&self) -> Vec<u8> {
        const EHDR: usize = 64;
        const PHDR: usize = 56;
        let phoff = EHDR;
        let dynstr_off = align(phoff + 2 * PHDR, 16);

        let mut strtab = StrTab::new();
        let mut dyns: Vec<(u64, u64)> = Vec::new();
        for name in &self.needed {
            dyns.push((DT_NEEDED, u64::from(strtab.intern(name))));
        }
        if let Some(soname) = &self.soname {
            dyns.push((DT_SONAME, u64::from(strtab.intern(soname))));
        }
        for rpath in &self.rpaths {
            dyns.push((DT_RPATH, u64::from(strtab.intern(rpath))));
        }
        for runpath in &self.runpaths {
            dyns.push((DT_RUNPATH, u64::from(strtab.intern(runpath))));
        }

        // Group version requirements by file, preserving first appearance.
        let mut files: Vec<(String, Vec<String>)> = Vec::new();
        for (file, version) in &self.versions {
            match files.iter_mut().find(|(f, _)| f == file) {
                Some((_, versions)) => versions.push(version.clone()),
                None => files.push((file.clone(), vec![version.clone()])),
            }
        }
        let mut verneed = Vec::new();
        for (index, (file, versions)) in files.iter().enumerate() {
            let file_name = strtab.intern(file);
            let mut entry = vec![0u8; 16];
            put_u16(&mut entry, 0, 1);
            put_u16(&mut entry, 2, versions.len() as u16);
            put_u32(&mut entry, 4, file_name);
            put_u32(&mut entry, 8, 16);
            let next = if index + 1 == files.len() {
                0
            } else {
                16 + 16 * versions.len() as u32
            };
            put_u32(&mut entry, 12, next);
            verneed.extend_from_slice(&entry);
            for (aux_index, version) in versions.iter().enumerate() {
                let name = strtab.intern(version);
                let mut aux = vec![0u8; 16];
                put_u16(&mut aux, 6, (2 + aux_index) as u16);
                put_u32(&mut aux, 8, name);
                let aux_next = if aux_index + 1 == versions.len() { 0 } else { 16 };
                put_u32(&mut aux, 12, aux_next);
                verneed.extend_from_slice(&aux);
            }
        }

        let verneed_off = align(dynstr_off + strtab.bytes.len(), 8);
        let dynamic_off = align(verneed_off + verneed.len(), 8);

        dyns.push((DT_STRTAB, dynstr_off as u64));
        dyns.push((DT_STRSZ, strtab.bytes.len() as u64));
        if !files.is_empty() {
            dyns.push((DT_VERNEED, verneed_off as u64));
            dyns.push((DT_VERNEEDNUM, files.len() as u64));
        }
        dyns.push((DT_NULL, 0));
        let dynamic_size = dyns.len() * 16;
        let total = dynamic_off + dynamic_size;

        let mut buf = vec![0u8; total];
        buf[..4].copy_from_slice(b"\x7fELF");
        buf[4] = 2; // ELFCLASS64
        buf[5] = 1; // little endian
        buf[6] = 1;
        put_u16(&mut buf, 16, 3); // ET_DYN
        put_u16(&mut buf, 18, self.machine);
        put_u32(&mut buf, 20, 1);
        put_u64(&mut buf, 32, phoff as u64);
        put_u16(&mut buf, 52, EHDR as u16);
        put_u16(&mut buf, 54, PHDR as u16);
        put_u16(&mut buf, 56, 2);
        put_u16(&mut buf, 58, 64);

        // PT_LOAD covering the whole file, identity mapped.
        let load = phoff;
        put_u32(&mut buf, load, 1);
        put_u32(&mut buf, load + 4, 4);
        put_u64(&mut buf, load + 32, total as u64);
        put_u64(&mut buf, load + 40, total as u64);
        put_u64(&mut buf, load + 48, 0x1000);

        // PT_DYNAMIC
        let dynamic = phoff + PHDR;
        put_u32(&mut buf, dynamic, 2);
        put_u32(&mut buf, dynamic + 4, 6);
        put_u64(&mut buf, dynamic + 8, dynamic_off as u64);
        put_u64(&mut buf, dynamic + 16, dynamic_off as u64);
        put_u64(&mut buf, dynamic + 24, dynamic_off as u64);
        put_u64(&mut buf, dynamic + 32, dynamic_size as u64);
        put_u64(&mut buf, dynamic + 40, dynamic_size as u64);
        put_u64(&mut buf, dynamic + 48, 8);

        buf[dynstr_off..dynstr_off + strtab.bytes.len()].copy_from_slice(&strtab.bytes);
        buf[verneed_off..verneed_off + verneed.len()].copy_from_slice(&verneed);
        for (index, (tag, val)) in dyns.iter().enumerate() {
            put_u64(&mut buf, dynamic_off + index * 16, *tag);
            put_u64(&mut buf, dynamic_off + index * 16 + 8, *val);
        }
        buf
    }

    pub fn write(&self, path: &Path) -> io::Result<()> {
        write_file(path, &self.build())
    }
}

const CPU_TYPE_X86_64: u32 = 0x0100_0007;
const LC_LOAD_DYLIB: u32 = 0xc;
const LC_ID_DYLIB: u32 = 0xd;
const LC_RPATH: u32 = 0x8000_001c;

#[derive(Debug, Clone, Default)]
pub struct MachOBuilder {
    commands: Vec<(u32, String)>,
}

impl MachOBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn id_dylib(mut self, name: &str) -> Self {
        self.commands.push((LC_ID_DYLIB, name.to_string()));
        self
    }

    pub fn load_dylib(mut self, name: &str) -> Self {
        self.commands.push((LC_LOAD_DYLIB, name.to_string()));
        self
    }

    pub fn rpath(mut self, path: &str) -> Self {
        self.commands.push((LC_RPATH, path.to_string()));
        self
    }

    pub fn build(&self) -> Vec<u8> {
        let mut cmds = Vec::new();
        for (cmd, value) in &self.commands {
            let header = if *cmd == LC_RPATH { 12 } else { 24 };
            let size = align(header + value.len() + 1, 8);
            let mut lc = vec![0u8; size];
            put_u32(&mut lc, 0, *cmd);
            put_u32(&mut lc, 4, size as u32);
            put_u32(&mut lc, 8, header as u32);
            if *cmd != LC_RPATH {
                put_u32(&mut lc, 12, 2); // timestamp
                put_u32(&mut lc, 16, 0x0001_0000); // current version
                put_u32(&mut lc, 20, 0x0001_0000); // compatibility version
            }
            lc[header..header + value.len()].copy_from_slice(value.as_bytes());
            cmds.extend_from_slice(&lc);
        }

        let is_dylib = self.commands.iter().any(|(cmd, _)| *cmd == LC_ID_DYLIB);
        let mut buf = vec![0u8; 32];
        put_u32(&mut buf, 0, 0xfeed_facf);
        put_u32(&mut buf, 4, CPU_TYPE_X86_64);
        put_u32(&mut buf, 8, 3);
        put_u32(&mut buf, 12, if is_dylib { 6 } else { 2 });
        put_u32(&mut buf, 16, self.commands.len() as u32);
        put_u32(&mut buf, 20, cmds.len() as u32);
        buf.extend_from_slice(&cmds);
        buf
    }

    pub fn write(&self, path: &Path) -> io::Result<()> {
        write_file(path, &self.build())
    }
}

#[derive(Debug, Clone, Default)]
pub struct PeBuilder {
    imports: Vec<String>,
}

impl PeBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn import(mut self, dll: &str) -> Self {
        self.imports.push(dll.to_string());
        self
    }

    pub fn build(&self) -> Vec<u8> {
        const LFANEW: usize = 0x80;
        const OPTIONAL_SIZE: usize = 240;
        const SECTION_RVA: u32 = 0x1000;
        const SECTION_RAW: usize = 0x200;

        // .idata contents: descriptors, one shared empty thunk list, names.
        let descriptors = (self.imports.len() + 1) * 20;
        let ilt = align(descriptors, 8);
        let iat = ilt + 8;
        let mut idata = vec![0u8; iat + 8];
        for (index, dll) in self.imports.iter().enumerate() {
            let name_at = idata.len();
            idata.extend_from_slice(dll.as_bytes());
            idata.push(0);
            let d = index * 20;
            put_u32(&mut idata, d, SECTION_RVA + ilt as u32);
            put_u32(&mut idata, d + 12, SECTION_RVA + name_at as u32);
            put_u32(&mut idata, d + 16, SECTION_RVA + iat as u32);
        }
        let raw_size = align(idata.len(), 0x200);
        idata.resize(raw_size, 0);

        let mut buf = vec![0u8; SECTION_RAW];
        buf[..2].copy_from_slice(b"MZ");
        put_u32(&mut buf, 0x3c, LFANEW as u32);
        buf[LFANEW..LFANEW + 4].copy_from_slice(b"PE\0\0");

        let coff = LFANEW + 4;
        put_u16(&mut buf, coff, 0x8664);
        put_u16(&mut buf, coff + 2, 1);
        put_u16(&mut buf, coff + 16, OPTIONAL_SIZE as u16);
        put_u16(&mut buf, coff + 18, 0x0022);

        let opt = coff + 20;
        put_u16(&mut buf, opt, 0x20b);
        put_u32(&mut buf, opt + 8, raw_size as u32);
        put_u32(&mut buf, opt + 20, SECTION_RVA);
        put_u64(&mut buf, opt + 24, 0x1_4000_0000);
        put_u32(&mut buf, opt + 32, 0x1000);
        put_u32(&mut buf, opt + 36, 0x200);
        put_u16(&mut buf, opt + 40, 6);
        put_u16(&mut buf, opt + 48, 6);
        put_u32(&mut buf, opt + 56, SECTION_RVA + align(raw_size, 0x1000) as u32);
        put_u32(&mut buf, opt + 60, SECTION_RAW as u32);
        put_u16(&mut buf, opt + 68, 3);
        put_u64(&mut buf, opt + 72, 0x10_0000);
        put_u64(&mut buf, opt + 80, 0x1000);
        put_u64(&mut buf, opt + 88, 0x10_0000);
        put_u64(&mut buf, opt + 96, 0x1000);
        put_u32(&mut buf, opt + 108, 16);
        // Data directory 1: import table.
        put_u32(&mut buf, opt + 112 + 8, SECTION_RVA);
        put_u32(&mut buf, opt + 112 + 12, descriptors as u32);

        let section = opt + OPTIONAL_SIZE;
        buf[section..section + 6].copy_from_slice(b".idata");
        put_u32(&mut buf, section + 8, raw_size as u32);
        put_u32(&mut buf, section + 12, SECTION_RVA);
        put_u32(&mut buf, section + 16, raw_size as u32);
        put_u32(&mut buf, section + 20, SECTION_RAW as u32);
        put_u32(&mut buf, section + 36, 0xc000_0040);

        buf.extend_from_slice(&idata);
        buf
    }

    pub fn write(&self, path: &Path) -> io::Result<()> {
        write_file(path, &self.build())
    }
}

/// A squashfs 4.0 image holding only a superblock and an id table.
#[derive(Debug, Clone, Default)]
pub struct SquashfsBuilder {
    ids: Vec<u32>,
    compressed_ids: bool,
}

impl SquashfsBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn ids(mut self, ids: &[u32]) -> Self {
        self.ids = ids.to_vec();
        self
    }

    /// Mark the id metadata block as compressed.
    pub fn compressed_ids(mut self) -> Self {
        self.compressed_ids = true;
        self
    }

    pub fn build(&self) -> Vec<u8> {
        const SUPERBLOCK: usize = 96;
        let block_len = self.ids.len() * 4;
        let table_start = SUPERBLOCK + 2 + block_len;
        let total = table_start + 8;

        let mut buf = vec![0u8; total];
        put_u32(&mut buf, 0, 0x7371_7368);
        put_u32(&mut buf, 12, 131_072);
        put_u16(&mut buf, 20, 1);
        put_u16(&mut buf, 22, 17);
        put_u16(&mut buf, 26, self.ids.len() as u16);
        put_u16(&mut buf, 28, 4);
        put_u64(&mut buf, 40, total as u64);
        put_u64(&mut buf, 48, table_start as u64);
        put_u64(&mut buf, 56, u64::MAX);

        let header = if self.compressed_ids {
            block_len as u16
        } else {
            block_len as u16 | 0x8000
        };
        put_u16(&mut buf, SUPERBLOCK, header);
        for (index, id) in self.ids.iter().enumerate() {
            put_u32(&mut buf, SUPERBLOCK + 2 + index * 4, *id);
        }
        put_u64(&mut buf, table_start, SUPERBLOCK as u64);
        buf
    }

    pub fn write(&self, path: &Path) -> io::Result<()> {
        write_file(path, &self.build())
    }
}
