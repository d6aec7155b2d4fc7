//! Per-process state rebuilt during journal replay

use crate::domain::Pid;
use crate::symbolization::MemoryMapping;

#[derive(Debug, Clone)]
pub struct ProcessRecord {
    pid: Pid,
    name: String,
    /// `[name]`, the frame every trace of this process hangs from
    display_name: String,
    /// Set while the name is only inherited from a parent or made up; the
    /// first real COMM replaces it
    provisional: bool,
    /// Sorted by start, pairwise non-overlapping
    maps: Vec<MemoryMapping>,
}

impl ProcessRecord {
    #[must_use]
    pub fn new(pid: Pid, name: &str) -> Self {
        Self {
            pid,
            name: name.to_string(),
            display_name: format!("[{name}]"),
            provisional: false,
            maps: Vec::new(),
        }
    }

    /// A process known only by pid, e.g. one first seen through an mmap
    #[must_use]
    pub fn unnamed(pid: Pid) -> Self {
        let mut process = Self::new(pid, &format!("pid {}", pid.0));
        process.provisional = true;
        process
    }

    /// Child created by fork: same mappings, same name until it execs
    #[must_use]
    pub fn fork(&self, child: Pid) -> Self {
        Self {
            pid: child,
            name: self.name.clone(),
            display_name: self.display_name.clone(),
            provisional: true,
            maps: self.maps.clone(),
        }
    }

    #[must_use]
    pub fn pid(&self) -> Pid {
        self.pid
    }

    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    #[must_use]
    pub fn display_name(&self) -> &str {
        &self.display_name
    }

    /// Apply a name record. The first real name wins.
    pub fn rename(&mut self, name: &str) {
        if self.provisional {
            self.name = name.to_string();
            self.display_name = format!("[{name}]");
            self.provisional = false;
        }
    }

    #[must_use]
    pub fn maps(&self) -> &[MemoryMapping] {
        &self.maps
    }

    /// Insert `mapping`, first removing every mapping it overlaps
    pub fn insert_map(&mut self, mapping: MemoryMapping) {
        self.maps.retain(|m| !m.overlaps(mapping.start, mapping.end));
        let at = self.maps.partition_point(|m| m.start < mapping.start);
        self.maps.insert(at, mapping);
    }

    /// Mapping containing `addr`, if any
    #[must_use]
    pub fn find_map(&self, addr: u64) -> Option<&MemoryMapping> {
        let idx = self.maps.partition_point(|m| m.start <= addr);
        let candidate = self.maps.get(idx.checked_sub(1)?)?;
        candidate.contains(addr).then_some(candidate)
    }
}
