//! Memory mapping utilities for process address space analysis
//!
//! A [`MemoryMapping`] records which file backs a range of a process's
//! address space. Mappings come from kernel mmap events during capture, or
//! from `/proc/<pid>/maps` for processes that already existed.

use anyhow::{Context, Result};
use log::debug;
use std::fs;
use std::path::Path;

use crate::domain::Pid;

/// File-backed range `[start, end)` of a process address space
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MemoryMapping {
    pub filename: String,
    pub start: u64,
    pub end: u64,
    /// File offset corresponding to `start`
    pub offset: u64,
    /// Inode at map time; zero when unknown
    pub inode: u64,
}

impl MemoryMapping {
    /// Check if an address falls within this mapping
    #[must_use]
    pub fn contains(&self, addr: u64) -> bool {
        addr >= self.start && addr < self.end
    }

    #[must_use]
    pub fn overlaps(&self, start: u64, end: u64) -> bool {
        self.start < end && start < self.end
    }

    /// Translate a virtual address inside this mapping to a file offset
    #[must_use]
    pub fn file_offset(&self, addr: u64) -> u64 {
        addr.wrapping_sub(self.start).wrapping_add(self.offset)
    }
}

/// Parse the text of a `/proc/<pid>/maps` file.
///
/// Lines look like `start-end perms offset dev inode pathname`. Anonymous
/// mappings (no pathname) are skipped.
#[must_use]
pub fn parse_maps(content: &str) -> Vec<MemoryMapping> {
    let mut mappings = Vec::new();

    for line in content.lines() {
        let mut parts = line.splitn(6, char::is_whitespace);
        let (Some(range), Some(_perms), Some(offset), Some(_dev), Some(inode)) =
            (parts.next(), parts.next(), parts.next(), parts.next(), parts.next())
        else {
            continue;
        };
        let filename = parts.next().map_or("", str::trim);
        if filename.is_empty() {
            continue;
        }

        let Some((start, end)) = range.split_once('-') else {
            continue;
        };
        let (Ok(start), Ok(end), Ok(offset), Ok(inode)) = (
            u64::from_str_radix(start, 16),
            u64::from_str_radix(end, 16),
            u64::from_str_radix(offset, 16),
            inode.parse::<u64>(),
        ) else {
            debug!("Skipping malformed maps line: {line}");
            continue;
        };

        mappings.push(MemoryMapping { filename: filename.to_string(), start, end, offset, inode });
    }

    mappings
}

/// Read and parse `<proc_root>/<pid>/maps`
///
/// # Errors
/// Returns an error if the maps file cannot be read.
pub fn read_memory_maps(proc_root: &Path, pid: Pid) -> Result<Vec<MemoryMapping>> {
    let maps_path = proc_root.join(pid.0.to_string()).join("maps");
    let maps = fs::read_to_string(&maps_path)
        .with_context(|| format!("Failed to read {}", maps_path.display()))?;
    Ok(parse_maps(&maps))
}

#[cfg(test)]
mod tests {
    use super::*;

    const MAPS: &str = "\
55d4a8e00000-55d4a8e02000 r--p 00000000 fd:01 1311234                    /usr/bin/cat
55d4a8e02000-55d4a8e07000 r-xp 00002000 fd:01 1311234                    /usr/bin/cat
55d4a9f2b000-55d4a9f4c000 rw-p 00000000 00:00 0                          [heap]
7f1c2e400000-7f1c2e428000 r--p 00000000 fd:01 1316001          /usr/lib/x86_64-linux-gnu/libc.so.6
7f1c2e5f0000-7f1c2e5f5000 rw-p 00000000 00:00 0
7ffd3b9e4000-7ffd3b9e6000 r-xp 00000000 00:00 0                          [vdso]
7f1c2e700000-7f1c2e701000 r-xp 00000000 fd:01 42                         /tmp/name with spaces
";

    #[test]
    fn test_mapping_contains() {
        let mapping =
            MemoryMapping { filename: "a".into(), start: 0x1000, end: 0x2000, offset: 0, inode: 0 };

        assert!(mapping.contains(0x1000));
        assert!(mapping.contains(0x1FFF));
        assert!(!mapping.contains(0x0FFF));
        assert!(!mapping.contains(0x2000));
    }

    #[test]
    fn test_file_offset() {
        let mapping = MemoryMapping {
            filename: "lib".into(),
            start: 0x7f00_0000_2000,
            end: 0x7f00_0000_8000,
            offset: 0x2000,
            inode: 7,
        };
        assert_eq!(mapping.file_offset(0x7f00_0000_2010), 0x2010);
    }

    #[test]
    fn test_parse_maps() {
        let mappings = parse_maps(MAPS);
        let names: Vec<&str> = mappings.iter().map(|m| m.filename.as_str()).collect();
        assert_eq!(
            names,
            vec![
                "/usr/bin/cat",
                "/usr/bin/cat",
                "[heap]",
                "/usr/lib/x86_64-linux-gnu/libc.so.6",
                "[vdso]",
                "/tmp/name with spaces"
            ]
        );

        let text = &mappings[1];
        assert_eq!(text.start, 0x55d4_a8e0_2000);
        assert_eq!(text.end, 0x55d4_a8e0_7000);
        assert_eq!(text.offset, 0x2000);
        assert_eq!(text.inode, 1_311_234);
    }

    #[test]
    fn test_read_memory_maps_self() {
        let pid = Pid(std::process::id());
        let mappings = read_memory_maps(Path::new("/proc"), pid).unwrap();
        let exe = std::env::current_exe().unwrap();
        let exe = exe.to_string_lossy();
        assert!(mappings.iter().any(|m| m.filename == exe));
    }
}
