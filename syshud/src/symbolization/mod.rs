//! # Symbol Resolution
//!
//! Turns raw instruction addresses into function names. Resolution only runs
//! when a profile is created, after capture has stopped, so nothing here is
//! on the sampling hot path.
//!
//! ## Address Translation Flow
//!
//! ```text
//! 1. Sample frame 0x7f1c2e429abc in pid 4242, user context
//!
//! 2. Find the mapping that contains it (tracker state at sample time)
//!    7f1c2e428000-7f1c2e5bd000 offset 0x28000 /usr/lib/libc.so.6
//!
//! 3. File offset = addr - start + offset                  = 0x29abc
//!
//! 4. Text offset = file offset - .text file offset        = 0x29abc - 0x28700
//!
//! 5. Each image in the chain adds its own .text sh_addr and bisects its
//!    sorted STT_FUNC table: debug files first, then libc.so.6 itself
//!
//! 6. Demangle the hit; a miss yields "In file /usr/lib/libc.so.6"
//! ```
//!
//! Kernel-context frames skip all of this and go to the `/proc/kallsyms`
//! snapshot.
//!
//! ## Module Structure
//!
//! - **`elf_image`**: one parsed ELF file (sections, symbols, build-id, debug link)
//! - **`binary_file`**: resolution chain for one mapped path, inode check, vdso
//! - **`debug_paths`**: build-id store and debug link search order
//! - **`kernel_symbols`**: `/proc/kallsyms` snapshot
//! - **`memory_maps`**: `/proc/<pid>/maps` parsing and [`MemoryMapping`]
//! - **`demangle`**: Rust and C++ demangling of resolved names
//!
//! ## Failure Model
//!
//! Nothing in this module aborts profile creation. Malformed ELF files load
//! as empty chains, missing debug info falls back to the binary's own
//! tables, replaced binaries produce an "inode mismatch" name.

pub mod binary_file;
pub mod debug_paths;
pub mod demangle;
pub mod elf_image;
pub mod kernel_symbols;
pub mod memory_maps;

pub use binary_file::BinaryFile;
pub use debug_paths::DebugSearch;
pub use demangle::demangle_symbol;
pub use elf_image::ElfImage;
pub use kernel_symbols::KernelSymbols;
pub use memory_maps::{parse_maps, read_memory_maps, MemoryMapping};

use std::collections::hash_map::Entry;
use std::collections::{HashMap, HashSet};
use std::path::PathBuf;

use log::warn;

use crate::config::ProfilerConfig;

/// Placeholder for kernel frames that kallsyms cannot name
pub const UNKNOWN_KERNEL_SYMBOL: &str = "In kernel";

/// Resolver state for one profile: loaded binaries and the kernel table
#[derive(Debug, Default)]
pub struct SymbolResolver {
    search: DebugSearch,
    kernel: KernelSymbols,
    binaries: HashMap<String, BinaryFile>,
    warned_crc: HashSet<PathBuf>,
}

impl SymbolResolver {
    #[must_use]
    pub fn new(search: DebugSearch, kernel: KernelSymbols) -> Self {
        Self { search, kernel, binaries: HashMap::new(), warned_crc: HashSet::new() }
    }

    /// Build a resolver from configuration, snapshotting kallsyms.
    ///
    /// An unreadable kallsyms only costs kernel frame names.
    #[must_use]
    pub fn from_config(config: &ProfilerConfig) -> Self {
        let kernel = KernelSymbols::load(&config.kallsyms_path).unwrap_or_else(|err| {
            warn!("Kernel symbols unavailable: {err:#}");
            KernelSymbols::default()
        });
        let search = DebugSearch::new(config.debug_dirs.clone(), config.sysroots.clone());
        Self::new(search, kernel)
    }

    /// Loaded (or failed-to-load) binary for `filename`, opened on first use
    pub fn binary(&mut self, filename: &str) -> &mut BinaryFile {
        match self.binaries.entry(filename.to_string()) {
            Entry::Occupied(entry) => entry.into_mut(),
            Entry::Vacant(entry) => {
                entry.insert(BinaryFile::open(filename, &self.search, &mut self.warned_crc))
            }
        }
    }

    /// Name the user-space function at `address`, which lies inside `mapping`
    pub fn resolve_user(&mut self, mapping: &MemoryMapping, address: u64) -> String {
        let binary = self.binary(&mapping.filename);

        if mapping.inode != 0 && !binary.check_inode(mapping.inode) {
            return format!("{}: inode mismatch", mapping.filename);
        }

        match binary.lookup_symbol(mapping.file_offset(address)) {
            Some(name) => demangle_symbol(&name),
            None => binary.undefined_name().to_string(),
        }
    }

    /// Name the kernel function at `address`
    #[must_use]
    pub fn resolve_kernel(&self, address: u64) -> String {
        self.kernel
            .lookup(address)
            .map_or_else(|| UNKNOWN_KERNEL_SYMBOL.to_string(), demangle_symbol)
    }

    #[must_use]
    pub fn kernel_symbols(&self) -> &KernelSymbols {
        &self.kernel
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_resolve_kernel() {
        let kernel = KernelSymbols::parse("ffffffff81000000 T do_syscall_64\n");
        let resolver = SymbolResolver::new(DebugSearch::default(), kernel);
        assert_eq!(resolver.resolve_kernel(0xffff_ffff_8100_0010), "do_syscall_64");
        assert_eq!(resolver.resolve_kernel(0x10), UNKNOWN_KERNEL_SYMBOL);
    }

    #[test]
    fn test_resolve_user_missing_binary() {
        let mut resolver = SymbolResolver::default();
        let mapping = MemoryMapping {
            filename: "/nonexistent/app".into(),
            start: 0x40_0000,
            end: 0x40_1000,
            offset: 0,
            inode: 0,
        };
        assert_eq!(resolver.resolve_user(&mapping, 0x40_0010), "In file /nonexistent/app");
        // Cached after the first lookup
        assert_eq!(resolver.binaries.len(), 1);
    }

    #[test]
    fn test_resolve_user_inode_mismatch() {
        use std::os::unix::fs::MetadataExt;

        let exe = std::env::current_exe().unwrap();
        let inode = std::fs::metadata(&exe).unwrap().ino();
        let mapping = MemoryMapping {
            filename: exe.to_string_lossy().into_owned(),
            start: 0x1000,
            end: 0x2000,
            offset: 0,
            inode: inode + 1,
        };
        let mut resolver = SymbolResolver::default();
        assert!(resolver.resolve_user(&mapping, 0x1000).ends_with(": inode mismatch"));
    }
}
