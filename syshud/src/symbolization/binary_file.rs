//! Symbol lookup for one mapped file
//!
//! A [`BinaryFile`] owns the resolution chain for a path: any separate debug
//! files found through the build-id store or the `.gnu_debuglink` chain,
//! followed by the binary itself. Lookups try each image in order and fall
//! back to an "In file ..." placeholder.

#![allow(unsafe_code)] // copying our own vdso out of memory requires unsafe

use std::borrow::Cow;
use std::collections::HashSet;
use std::fs;
use std::os::unix::fs::MetadataExt;
use std::path::{Path, PathBuf};

use log::{debug, info, warn};

use super::debug_paths::DebugSearch;
use super::elf_image::{DebugLink, ElfImage};
use super::memory_maps::parse_maps;

/// Name the kernel gives the vdso mapping
pub const VDSO_NAME: &str = "[vdso]";

#[derive(Debug)]
pub struct BinaryFile {
    filename: String,
    /// Debug images first, the binary itself last
    images: Vec<ElfImage>,
    undefined_name: String,
    text_offset: u64,
    inode: Option<u64>,
    inode_warned: bool,
}

impl BinaryFile {
    /// Load `filename` and its debug companions.
    ///
    /// Never fails: an unreadable or malformed file yields an empty chain whose
    /// lookups all return the undefined placeholder. `warned` collects debug
    /// files already reported for a CRC mismatch.
    pub fn open(filename: &str, search: &DebugSearch, warned: &mut HashSet<PathBuf>) -> Self {
        let main = if filename == VDSO_NAME {
            read_own_vdso().and_then(|bytes| ElfImage::from_bytes(VDSO_NAME, bytes).ok())
        } else {
            search.host_paths(Path::new(filename)).iter().find_map(|path| {
                ElfImage::open(path)
                    .map_err(|err| debug!("Cannot load {}: {err}", path.display()))
                    .ok()
            })
        };

        let mut binary = Self {
            filename: filename.to_string(),
            images: Vec::new(),
            undefined_name: format!("In file {filename}"),
            text_offset: 0,
            inode: None,
            inode_warned: false,
        };

        if let Some(main) = main {
            // Offsets come from the mapped binary, never from its debug files
            binary.text_offset = main.text_offset().unwrap_or(0);
            binary.inode = read_inode(filename, main.path());
            binary.images = debug_images(&main, search, warned);
            binary.images.push(main);
        }

        binary
    }

    #[must_use]
    pub fn filename(&self) -> &str {
        &self.filename
    }

    /// Resolution chain, debug images first
    #[must_use]
    pub fn images(&self) -> &[ElfImage] {
        &self.images
    }

    #[must_use]
    pub fn undefined_name(&self) -> &str {
        &self.undefined_name
    }

    /// Find the symbol containing `file_offset`, trying each image in the chain
    #[must_use]
    pub fn lookup_symbol(&self, file_offset: u64) -> Option<Cow<'_, str>> {
        let text_offset = file_offset.wrapping_sub(self.text_offset);
        self.images
            .iter()
            .find_map(|image| image.lookup(text_offset).map(|sym| image.symbol_name(&sym)))
    }

    /// Like [`lookup_symbol`](Self::lookup_symbol), with the placeholder on a miss
    #[must_use]
    pub fn lookup(&self, file_offset: u64) -> Cow<'_, str> {
        self.lookup_symbol(file_offset).unwrap_or(Cow::Borrowed(&self.undefined_name))
    }

    /// Compare the inode recorded at map time with the file on disk.
    ///
    /// A mismatch means the file was replaced after it was mapped, so its
    /// symbols would be wrong. Warns once per file.
    pub fn check_inode(&mut self, inode: u64) -> bool {
        if self.inode == Some(inode) {
            return true;
        }
        if self.images.is_empty() {
            return false;
        }
        if !self.inode_warned {
            warn!(
                "Inode mismatch for {} (disk: {:?}, memory: {inode})",
                self.filename, self.inode
            );
            self.inode_warned = true;
        }
        false
    }
}

fn read_inode(filename: &str, path: &Path) -> Option<u64> {
    if filename == VDSO_NAME {
        return Some(0);
    }
    fs::metadata(path).ok().map(|meta| meta.ino())
}

/// Separate debug images for `main`, in lookup order.
///
/// A matching build-id file wins outright. Otherwise the debug link chain is
/// followed, each newly found file taking precedence over the previous one.
fn debug_images(
    main: &ElfImage,
    search: &DebugSearch,
    warned: &mut HashSet<PathBuf>,
) -> Vec<ElfImage> {
    if let Some(build_id) = main.build_id() {
        for candidate in search.build_id_candidates(build_id) {
            let Ok(image) = ElfImage::open(&candidate) else {
                continue;
            };
            if image.build_id() == Some(build_id) {
                info!("Using {} for {}", candidate.display(), main.path().display());
                return vec![image];
            }
        }
    }

    let mut found = Vec::new();
    let mut seen: HashSet<PathBuf> = HashSet::new();
    let mut path = main.path().to_path_buf();
    let mut link = main.debug_link().cloned();

    while let Some(current) = link.take() {
        if !seen.insert(path.clone()) {
            break;
        }
        let Some((next_path, image)) = find_debug_link_file(&path, &current, search, warned)
        else {
            break;
        };
        info!("Using {} for {}", next_path.display(), path.display());
        link = image.debug_link().cloned();
        path = next_path;
        found.insert(0, image);
    }

    found
}

fn find_debug_link_file(
    binary: &Path,
    link: &DebugLink,
    search: &DebugSearch,
    warned: &mut HashSet<PathBuf>,
) -> Option<(PathBuf, ElfImage)> {
    for candidate in search.debug_link_candidates(binary, &link.name) {
        let Ok(image) = ElfImage::open(&candidate) else {
            continue;
        };
        if image.crc32() == link.crc {
            return Some((candidate, image));
        }
        if warned.insert(candidate.clone()) {
            warn!("{} has wrong crc", candidate.display());
        }
    }
    None
}

/// Copy the vdso mapped into this process
fn read_own_vdso() -> Option<Vec<u8>> {
    let maps = fs::read_to_string("/proc/self/maps").ok()?;
    let vdso = parse_maps(&maps).into_iter().find(|m| m.filename == VDSO_NAME)?;
    let len = usize::try_from(vdso.end.checked_sub(vdso.start)?).ok()?;

    // SAFETY: the vdso stays mapped readable for the lifetime of the process
    let bytes = unsafe { std::slice::from_raw_parts(vdso.start as *const u8, len) };
    Some(bytes.to_vec())
}
