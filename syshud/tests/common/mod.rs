//! Minimal ELF64 writer for integration tests
//!
//! Produces little-endian x86-64 shared objects with a `.text` section, an
//! optional function symbol table, build-id note and `.gnu_debuglink`. There
//! are no program headers; the symbolizer only reads section headers.

#![allow(dead_code)]

use std::fs;
use std::path::Path;

const SHT_PROGBITS: u32 = 1;
const SHT_SYMTAB: u32 = 2;
const SHT_STRTAB: u32 = 3;
const SHT_NOTE: u32 = 7;
const SHT_NOBITS: u32 = 8;
const SHT_DYNSYM: u32 = 11;

const SHF_ALLOC: u64 = 0x2;
const SHF_EXECINSTR: u64 = 0x4;

const EHDR_SIZE: usize = 64;
const SHDR_SIZE: usize = 64;
const SYM_SIZE: u64 = 24;

/// STB_GLOBAL << 4 | STT_FUNC
const GLOBAL_FUNC: u8 = 0x12;
const NT_GNU_BUILD_ID: u32 = 3;

pub const TEXT_ADDRESS: u64 = 0x1000;

struct SectionDef {
    name: &'static str,
    kind: u32,
    flags: u64,
    address: u64,
    data: Vec<u8>,
    /// Size recorded for NOBITS sections, which carry no data
    nobits_size: u64,
    link: u32,
    info: u32,
    align: u64,
    entsize: u64,
}

impl SectionDef {
    fn new(name: &'static str, kind: u32, data: Vec<u8>) -> Self {
        Self {
            name,
            kind,
            flags: 0,
            address: 0,
            data,
            nobits_size: 0,
            link: 0,
            info: 0,
            align: 1,
            entsize: 0,
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct ElfBuilder {
    text_size: u64,
    stripped_text: bool,
    symbols: Vec<(String, u64, u64)>,
    dynamic: bool,
    build_id: Option<Vec<u8>>,
    debug_link: Option<(String, u32)>,
}

impl ElfBuilder {
    /// Image with a `.text` of `text_size` bytes loaded at [`TEXT_ADDRESS`]
    pub fn new(text_size: u64) -> Self {
        Self { text_size, ..Self::default() }
    }

    /// Function symbol at absolute `address`
    pub fn symbol(mut self, name: &str, address: u64, size: u64) -> Self {
        self.symbols.push((name.to_string(), address, size));
        self
    }

    /// Emit the symbols as `.dynsym`/`.dynstr` instead of `.symtab`/`.strtab`
    pub fn dynamic_only(mut self) -> Self {
        self.dynamic = true;
        self
    }

    /// Make `.text` NOBITS, as in a separate debug file
    pub fn debug_file(mut self) -> Self {
        self.stripped_text = true;
        self
    }

    pub fn build_id(mut self, id: &[u8]) -> Self {
        self.build_id = Some(id.to_vec());
        self
    }

    pub fn debug_link(mut self, name: &str, crc: u32) -> Self {
        self.debug_link = Some((name.to_string(), crc));
        self
    }

    pub fn build(&self) -> Vec<u8> {
        let mut sections = vec![SectionDef::new("", 0, Vec::new())];

        let mut text = if self.stripped_text {
            let mut text = SectionDef::new(".text", SHT_NOBITS, Vec::new());
            text.nobits_size = self.text_size;
            text
        } else {
            SectionDef::new(".text", SHT_PROGBITS, vec![0xcc; to_usize(self.text_size)])
        };
        text.flags = SHF_ALLOC | SHF_EXECINSTR;
        text.address = TEXT_ADDRESS;
        text.align = 16;
        sections.push(text);
        let text_index = 1u16;

        if !self.symbols.is_empty() {
            let (symtab_name, strtab_name, kind) = if self.dynamic {
                (".dynsym", ".dynstr", SHT_DYNSYM)
            } else {
                (".symtab", ".strtab", SHT_SYMTAB)
            };

            let mut strings = vec![0u8];
            let mut table = vec![0u8; to_usize(SYM_SIZE)];
            for (name, address, size) in &self.symbols {
                let name_offset = u32::try_from(strings.len()).unwrap();
                strings.extend_from_slice(name.as_bytes());
                strings.push(0);

                table.extend_from_slice(&name_offset.to_le_bytes());
                table.push(GLOBAL_FUNC);
                table.push(0);
                table.extend_from_slice(&text_index.to_le_bytes());
                table.extend_from_slice(&address.to_le_bytes());
                table.extend_from_slice(&size.to_le_bytes());
            }

            let strtab_index = u32::try_from(sections.len() + 1).unwrap();
            let mut symtab = SectionDef::new(symtab_name, kind, table);
            symtab.link = strtab_index;
            symtab.info = 1;
            symtab.align = 8;
            symtab.entsize = SYM_SIZE;
            sections.push(symtab);
            sections.push(SectionDef::new(strtab_name, SHT_STRTAB, strings));
        }

        if let Some(id) = &self.build_id {
            let mut note = Vec::new();
            note.extend_from_slice(&4u32.to_le_bytes());
            note.extend_from_slice(&u32::try_from(id.len()).unwrap().to_le_bytes());
            note.extend_from_slice(&NT_GNU_BUILD_ID.to_le_bytes());
            note.extend_from_slice(b"GNU\0");
            note.extend_from_slice(id);
            pad_to(&mut note, 4);

            let mut section = SectionDef::new(".note.gnu.build-id", SHT_NOTE, note);
            section.flags = SHF_ALLOC;
            section.align = 4;
            sections.push(section);
        }

        if let Some((name, crc)) = &self.debug_link {
            let mut link = name.as_bytes().to_vec();
            link.push(0);
            pad_to(&mut link, 4);
            link.extend_from_slice(&crc.to_le_bytes());

            let mut section = SectionDef::new(".gnu_debuglink", SHT_PROGBITS, link);
            section.align = 4;
            sections.push(section);
        }

        let mut names = vec![0u8];
        let mut name_offsets = Vec::with_capacity(sections.len() + 1);
        for section in &sections {
            if section.name.is_empty() {
                name_offsets.push(0);
                continue;
            }
            name_offsets.push(u32::try_from(names.len()).unwrap());
            names.extend_from_slice(section.name.as_bytes());
            names.push(0);
        }
        name_offsets.push(u32::try_from(names.len()).unwrap());
        names.extend_from_slice(b".shstrtab\0");
        sections.push(SectionDef::new(".shstrtab", SHT_STRTAB, names));
        let shstrndx = u16::try_from(sections.len() - 1).unwrap();

        let mut out = vec![0u8; EHDR_SIZE];
        let mut offsets = Vec::with_capacity(sections.len());
        for section in &sections {
            pad_to(&mut out, 8);
            offsets.push(out.len() as u64);
            out.extend_from_slice(&section.data);
        }
        pad_to(&mut out, 8);
        let shoff = out.len() as u64;

        for ((section, offset), name) in sections.iter().zip(&offsets).zip(&name_offsets) {
            let size = if section.kind == SHT_NOBITS {
                section.nobits_size
            } else {
                section.data.len() as u64
            };
            let offset = if section.kind == 0 { 0 } else { *offset };
            out.extend_from_slice(&name.to_le_bytes());
            out.extend_from_slice(&section.kind.to_le_bytes());
            out.extend_from_slice(&section.flags.to_le_bytes());
            out.extend_from_slice(&section.address.to_le_bytes());
            out.extend_from_slice(&offset.to_le_bytes());
            out.extend_from_slice(&size.to_le_bytes());
            out.extend_from_slice(&section.link.to_le_bytes());
            out.extend_from_slice(&section.info.to_le_bytes());
            out.extend_from_slice(&section.align.to_le_bytes());
            out.extend_from_slice(&section.entsize.to_le_bytes());
        }

        let header = elf_header(shoff, u16::try_from(sections.len()).unwrap(), shstrndx);
        out[..EHDR_SIZE].copy_from_slice(&header);
        out
    }

    pub fn write(&self, path: &Path) -> Vec<u8> {
        let bytes = self.build();
        write_file(path, &bytes);
        bytes
    }

    /// Write the image padded with four bytes chosen so the file's CRC32 is `crc`
    pub fn write_with_crc(&self, path: &Path, crc: u32) -> Vec<u8> {
        let mut bytes = self.build();
        let tail = forge_crc32(&bytes, crc);
        bytes.extend_from_slice(&tail);
        assert_eq!(crc32fast::hash(&bytes), crc);
        write_file(path, &bytes);
        bytes
    }
}

fn elf_header(shoff: u64, shnum: u16, shstrndx: u16) -> [u8; EHDR_SIZE] {
    let mut header = [0u8; EHDR_SIZE];
    header[..4].copy_from_slice(b"\x7fELF");
    header[4] = 2; // ELFCLASS64
    header[5] = 1; // ELFDATA2LSB
    header[6] = 1; // EV_CURRENT

    let mut fields = Vec::with_capacity(EHDR_SIZE - 16);
    fields.extend_from_slice(&3u16.to_le_bytes()); // ET_DYN
    fields.extend_from_slice(&62u16.to_le_bytes()); // EM_X86_64
    fields.extend_from_slice(&1u32.to_le_bytes());
    fields.extend_from_slice(&TEXT_ADDRESS.to_le_bytes()); // e_entry
    fields.extend_from_slice(&0u64.to_le_bytes()); // e_phoff
    fields.extend_from_slice(&shoff.to_le_bytes());
    fields.extend_from_slice(&0u32.to_le_bytes()); // e_flags
    fields.extend_from_slice(&(EHDR_SIZE as u16).to_le_bytes());
    fields.extend_from_slice(&56u16.to_le_bytes()); // e_phentsize
    fields.extend_from_slice(&0u16.to_le_bytes()); // e_phnum
    fields.extend_from_slice(&(SHDR_SIZE as u16).to_le_bytes());
    fields.extend_from_slice(&shnum.to_le_bytes());
    fields.extend_from_slice(&shstrndx.to_le_bytes());

    header[16..].copy_from_slice(&fields);
    header
}

/// Four bytes that, appended to `data`, make its CRC32 equal `target`
pub fn forge_crc32(data: &[u8], target: u32) -> [u8; 4] {
    let mut table = [0u32; 256];
    for (i, entry) in table.iter_mut().enumerate() {
        let mut c = i as u32;
        for _ in 0..8 {
            c = if c & 1 != 0 { 0xedb8_8320 ^ (c >> 1) } else { c >> 1 };
        }
        *entry = c;
    }

    // Walk back from the wanted register to the table indices that produce it
    let mut state = !target;
    let mut indices = [0u8; 4];
    for k in (0..4).rev() {
        let index = table.iter().position(|&t| t >> 24 == state >> 24).unwrap();
        indices[k] = index as u8;
        state = (state ^ table[index]) << 8;
    }

    let mut reg = !crc32fast::hash(data);
    let mut tail = [0u8; 4];
    for (byte, &index) in tail.iter_mut().zip(&indices) {
        *byte = (reg as u8) ^ index;
        reg = (reg >> 8) ^ table[usize::from(index)];
    }
    tail
}

fn write_file(path: &Path, bytes: &[u8]) {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent).unwrap();
    }
    fs::write(path, bytes).unwrap();
}

fn pad_to(buf: &mut Vec<u8>, align: usize) {
    while buf.len() % align != 0 {
        buf.push(0);
    }
}

fn to_usize(value: u64) -> usize {
    usize::try_from(value).unwrap()
}
