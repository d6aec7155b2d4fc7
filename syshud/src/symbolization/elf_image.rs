//! One parsed ELF file
//!
//! An [`ElfImage`] maps a file (or owns an in-memory copy, for the vdso),
//! parses its section headers with `object`, and extracts a sorted table of
//! function symbols that live in `.text`. Everything is read once at
//! construction; the image is immutable afterwards.
//!
//! Addresses handed to [`ElfImage::lookup`] are offsets into the text
//! section as it appears in the *mapped* binary. The image adds its own
//! `.text` load address, so a separate debug file whose `.text` is `NOBITS`
//! resolves the same offsets as the binary it belongs to.

#![allow(unsafe_code)] // memory-mapping a file requires unsafe

use std::borrow::Cow;
use std::cell::OnceCell;
use std::fs::File;
use std::ops::Range;
use std::path::{Path, PathBuf};

use log::debug;
use memmap2::Mmap;
use object::elf;
use object::read::elf::{FileHeader, SectionHeader, SectionTable, Sym};
use object::{Endian, Endianness, FileKind};

use crate::domain::ElfError;

/// Backing bytes of an image
enum ImageData {
    Mapped(Mmap),
    Owned(Vec<u8>),
}

impl ImageData {
    fn bytes(&self) -> &[u8] {
        match self {
            ImageData::Mapped(map) => map,
            ImageData::Owned(bytes) => bytes,
        }
    }
}

/// Section header summary
#[derive(Debug, Clone)]
pub struct Section {
    pub name: String,
    pub kind: u32,
    pub offset: u64,
    pub size: u64,
    /// `sh_addr` for allocated sections, zero otherwise
    pub load_address: u64,
    pub allocated: bool,
}

/// Function symbol: absolute address, size and string table offset of its name
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ElfSymbol {
    address: u64,
    size: u64,
    name_offset: u32,
}

impl ElfSymbol {
    #[must_use]
    pub fn address(&self) -> u64 {
        self.address
    }

    #[must_use]
    pub fn size(&self) -> u64 {
        self.size
    }
}

/// `.gnu_debuglink` contents
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DebugLink {
    pub name: String,
    pub crc: u32,
}

pub struct ElfImage {
    path: PathBuf,
    data: ImageData,
    sections: Vec<Section>,
    text: Option<usize>,
    symbols: Vec<ElfSymbol>,
    strtab: Range<usize>,
    build_id: Option<String>,
    debug_link: Option<DebugLink>,
    crc32: OnceCell<u32>,
}

impl std::fmt::Debug for ElfImage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ElfImage")
            .field("path", &self.path)
            .field("sections", &self.sections.len())
            .field("symbols", &self.symbols.len())
            .field("build_id", &self.build_id)
            .field("debug_link", &self.debug_link)
            .finish_non_exhaustive()
    }
}

/// Parsed pieces of an image, before it takes ownership of its bytes
struct Layout {
    sections: Vec<Section>,
    text: Option<usize>,
    symbols: Vec<ElfSymbol>,
    strtab: Range<usize>,
    build_id: Option<String>,
    debug_link: Option<DebugLink>,
}

impl ElfImage {
    /// Map and parse an ELF file
    ///
    /// # Errors
    /// Returns an error if the file cannot be opened or is not a well-formed ELF file.
    pub fn open(path: &Path) -> Result<Self, ElfError> {
        let file = File::open(path)?;
        // The mapping is read-only and private to this image
        let map = unsafe { Mmap::map(&file)? };
        Self::from_data(path.to_path_buf(), ImageData::Mapped(map))
    }

    /// Parse an ELF image held in memory
    ///
    /// # Errors
    /// Returns an error if `bytes` is not a well-formed ELF file.
    pub fn from_bytes(name: impl Into<PathBuf>, bytes: Vec<u8>) -> Result<Self, ElfError> {
        Self::from_data(name.into(), ImageData::Owned(bytes))
    }

    fn from_data(path: PathBuf, data: ImageData) -> Result<Self, ElfError> {
        let bytes = data.bytes();
        if !bytes.starts_with(&elf::ELFMAG) {
            return Err(ElfError::Parse(format!("{}: not an ELF file", path.display())));
        }

        let layout = match FileKind::parse(bytes) {
            Ok(FileKind::Elf64) => parse_layout::<elf::FileHeader64<Endianness>>(bytes)?,
            Ok(FileKind::Elf32) => parse_layout::<elf::FileHeader32<Endianness>>(bytes)?,
            _ => return Err(ElfError::Parse(format!("{}: unknown ELF class", path.display()))),
        };

        debug!(
            "Parsed {}: {} sections, {} function symbols",
            path.display(),
            layout.sections.len(),
            layout.symbols.len()
        );

        Ok(Self {
            path,
            data,
            sections: layout.sections,
            text: layout.text,
            symbols: layout.symbols,
            strtab: layout.strtab,
            build_id: layout.build_id,
            debug_link: layout.debug_link,
            crc32: OnceCell::new(),
        })
    }

    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    #[must_use]
    pub fn sections(&self) -> &[Section] {
        &self.sections
    }

    /// Function symbols in `.text`, ascending by address
    #[must_use]
    pub fn symbols(&self) -> &[ElfSymbol] {
        &self.symbols
    }

    #[must_use]
    pub fn text_section(&self) -> Option<&Section> {
        self.text.map(|index| &self.sections[index])
    }

    /// File offset of `.text`, used to turn mapping offsets into text offsets
    #[must_use]
    pub fn text_offset(&self) -> Option<u64> {
        self.text_section().map(|text| text.offset)
    }

    /// Lowercase hex of the GNU build-id note
    #[must_use]
    pub fn build_id(&self) -> Option<&str> {
        self.build_id.as_deref()
    }

    #[must_use]
    pub fn debug_link(&self) -> Option<&DebugLink> {
        self.debug_link.as_ref()
    }

    /// CRC32 of the whole file, as recorded by `.gnu_debuglink` in the stripped binary
    pub fn crc32(&self) -> u32 {
        *self.crc32.get_or_init(|| crc32fast::hash(self.data.bytes()))
    }

    /// Raw `.eh_frame` contents, if present
    #[must_use]
    pub fn eh_frame(&self) -> Option<&[u8]> {
        self.progbits(".eh_frame")
    }

    /// Raw `.debug_frame` contents, if present
    #[must_use]
    pub fn debug_frame(&self) -> Option<&[u8]> {
        self.progbits(".debug_frame")
    }

    fn progbits(&self, name: &str) -> Option<&[u8]> {
        let section =
            self.sections.iter().find(|s| s.name == name && s.kind == elf::SHT_PROGBITS)?;
        let start = usize::try_from(section.offset).ok()?;
        let end = start.checked_add(usize::try_from(section.size).ok()?)?;
        self.data.bytes().get(start..end)
    }

    /// Name of a symbol returned by [`lookup`](Self::lookup)
    #[must_use]
    pub fn symbol_name(&self, symbol: &ElfSymbol) -> Cow<'_, str> {
        let strings = self.data.bytes().get(self.strtab.clone()).unwrap_or_default();
        let tail = strings.get(symbol.name_offset as usize..).unwrap_or_default();
        let len = tail.iter().position(|&b| b == 0).unwrap_or(tail.len());
        String::from_utf8_lossy(&tail[..len])
    }

    /// Find the function containing `text_offset` (an offset into `.text`)
    #[must_use]
    pub fn lookup(&self, text_offset: u64) -> Option<ElfSymbol> {
        let text = self.text_section()?;
        let target = text_offset.wrapping_add(text.load_address);

        let symbol = self.symbols[find_symbol_index(&self.symbols, target)?];

        if symbol.size > 0 && symbol.address.saturating_add(symbol.size) <= target {
            return None;
        }
        if target >= text.load_address.saturating_add(text.size) {
            return None;
        }
        Some(symbol)
    }
}

/// Index of the last symbol whose address is `<= target`.
///
/// Bisects until the bracket is at most three entries wide, then scans
/// linearly downwards.
fn find_symbol_index(symbols: &[ElfSymbol], target: u64) -> Option<usize> {
    let mut first = 0;
    let mut last = symbols.len().checked_sub(1)?;

    loop {
        if target >= symbols[last].address {
            return Some(last);
        }
        if last - first < 3 {
            return (first..last).rev().find(|&i| target >= symbols[i].address);
        }

        let mid = (first + last) / 2;
        if symbols[mid].address > target {
            last = mid;
        } else {
            first = mid;
        }
    }
}

fn parse_layout<Elf: FileHeader<Endian = Endianness>>(data: &[u8]) -> Result<Layout, ElfError> {
    let header = Elf::parse(data)?;
    let endian = header.endian()?;
    let table = header.sections(endian, data)?;

    let mut sections = Vec::with_capacity(table.len());
    for section in table.iter() {
        let name = table.section_name(endian, section).unwrap_or_default();
        let flags: u64 = section.sh_flags(endian).into();
        let allocated = flags & u64::from(elf::SHF_ALLOC) != 0;
        sections.push(Section {
            name: String::from_utf8_lossy(name).into_owned(),
            kind: section.sh_type(endian),
            offset: section.sh_offset(endian).into(),
            size: section.sh_size(endian).into(),
            load_address: if allocated { section.sh_addr(endian).into() } else { 0 },
            allocated,
        });
    }

    let text = find_section(&sections, ".text", elf::SHT_PROGBITS)
        .or_else(|| find_section(&sections, ".text", elf::SHT_NOBITS));

    let (symbols, strtab) = match text {
        Some(text_index) => read_function_symbols(&table, endian, data, text_index)
            .unwrap_or_else(|err| {
                debug!("Ignoring unreadable symbol table: {err}");
                (Vec::new(), 0..0)
            }),
        None => (Vec::new(), 0..0),
    };

    let build_id = read_build_id(&table, endian, data);
    let debug_link = table.iter().enumerate().find_map(|(index, section)| {
        if sections[index].name != ".gnu_debuglink" {
            return None;
        }
        parse_debug_link(section.data(endian, data).ok()?, endian)
    });

    Ok(Layout { sections, text, symbols, strtab, build_id, debug_link })
}

fn find_section(sections: &[Section], name: &str, kind: u32) -> Option<usize> {
    sections.iter().position(|s| s.name == name && s.kind == kind)
}

/// Read `.symtab`, or `.dynsym` when there is no static table, keeping only
/// `STT_FUNC` symbols defined in the text section.
fn read_function_symbols<Elf: FileHeader<Endian = Endianness>>(
    table: &SectionTable<'_, Elf>,
    endian: Endianness,
    data: &[u8],
    text_index: usize,
) -> Result<(Vec<ElfSymbol>, Range<usize>), ElfError> {
    let mut symtab = table.symbols(endian, data, elf::SHT_SYMTAB)?;
    if symtab.is_empty() {
        symtab = table.symbols(endian, data, elf::SHT_DYNSYM)?;
    }
    if symtab.is_empty() {
        return Ok((Vec::new(), 0..0));
    }

    let strings = table.section(symtab.string_section())?;
    let offset: u64 = strings.sh_offset(endian).into();
    let size: u64 = strings.sh_size(endian).into();
    let start = usize::try_from(offset)
        .map_err(|_| ElfError::Parse("string table offset out of range".into()))?;
    let size = usize::try_from(size)
        .map_err(|_| ElfError::Parse("string table size out of range".into()))?;
    let end = start.saturating_add(size).min(data.len());

    let mut symbols: Vec<ElfSymbol> = symtab
        .symbols()
        .iter()
        .filter(|sym| {
            let address: u64 = sym.st_value(endian).into();
            address != 0
                && usize::from(sym.st_shndx(endian)) == text_index
                && sym.st_type() == elf::STT_FUNC
                && matches!(sym.st_bind(), elf::STB_GLOBAL | elf::STB_LOCAL | elf::STB_WEAK)
        })
        .map(|sym| ElfSymbol {
            address: sym.st_value(endian).into(),
            size: sym.st_size(endian).into(),
            name_offset: sym.st_name(endian),
        })
        .collect();

    symbols.sort_by_key(|sym| sym.address);
    Ok((symbols, start.min(end)..end))
}

fn read_build_id<Elf: FileHeader<Endian = Endianness>>(
    table: &SectionTable<'_, Elf>,
    endian: Endianness,
    data: &[u8],
) -> Option<String> {
    for section in table.iter() {
        let Ok(Some(mut notes)) = section.notes(endian, data) else {
            continue;
        };
        while let Ok(Some(note)) = notes.next() {
            if note.name() == elf::ELF_NOTE_GNU && note.n_type(endian) == elf::NT_GNU_BUILD_ID {
                return Some(note.desc().iter().map(|b| format!("{b:02x}")).collect());
            }
        }
    }
    None
}

/// NUL-terminated file name, padding to a four byte boundary, then the CRC32
fn parse_debug_link(bytes: &[u8], endian: Endianness) -> Option<DebugLink> {
    let name_len = bytes.iter().position(|&b| b == 0)?;
    if name_len == 0 {
        return None;
    }
    let crc_offset = (name_len + 1 + 3) & !3;
    let crc_bytes: [u8; 4] = bytes.get(crc_offset..crc_offset + 4)?.try_into().ok()?;
    let crc = if endian.is_little_endian() {
        u32::from_le_bytes(crc_bytes)
    } else {
        u32::from_be_bytes(crc_bytes)
    };

    Some(DebugLink { name: String::from_utf8_lossy(&bytes[..name_len]).into_owned(), crc })
}
