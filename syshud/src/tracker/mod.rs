//! # Address Space Tracking
//!
//! During capture the [`Tracker`] only appends: lifecycle events go into a
//! [`journal`], sample callchains go into a raw [`StackStash`] keyed by
//! unresolved addresses. No symbol work happens while the kernel is
//! producing samples.
//!
//! ## Replay
//!
//! [`Tracker::create_profile`] walks the journal in arrival order and
//! rebuilds each process's name and mappings as they were at every point in
//! time. Each sample is resolved against that state:
//!
//! ```text
//! raw trace (leaf first)          resolved trace (root first)
//!
//! CONTEXT_KERNEL      ─┐           [Everything]
//! 0xffffffff8100beef   │           [nginx]
//! CONTEXT_USER         ├──────▶    main
//! 0x55d4a8e03120       │           handle_request
//! 0x55d4a8e02f00      ─┘           - - Kernel - -
//!                                  do_syscall_64
//! ```
//!
//! Processes that were running before capture started never produce COMM or
//! MMAP records; the first reference to such a pid snapshots it from `/proc`.

pub mod context;
pub mod journal;
pub mod process;
pub mod procfs;

pub use context::CallchainContext;
pub use journal::JournalEntry;
pub use process::ProcessRecord;

use std::collections::hash_map::Entry;
use std::collections::{HashMap, HashSet};
use std::path::PathBuf;

use log::{debug, info};

use crate::domain::{Address, Pid, SymbolId};
use crate::profile::{Profile, SymbolTable, EVERYTHING};
use crate::stackstash::{NodeId, StackStash};
use crate::symbolization::{read_memory_maps, MemoryMapping, SymbolResolver};

#[derive(Debug)]
pub struct Tracker {
    proc_root: PathBuf,
    journal: Vec<JournalEntry>,
    stash: StackStash<Address>,
    /// Pids with a journalled starting state
    known: HashSet<Pid>,
    n_samples: u64,
    scratch: Vec<Address>,
}

impl Tracker {
    #[must_use]
    pub fn new(proc_root: impl Into<PathBuf>) -> Self {
        Self {
            proc_root: proc_root.into(),
            journal: Vec::new(),
            stash: StackStash::new(),
            known: HashSet::new(),
            n_samples: 0,
            scratch: Vec::new(),
        }
    }

    #[must_use]
    pub fn journal(&self) -> &[JournalEntry] {
        &self.journal
    }

    /// Raw sample traces, keyed by unresolved address
    #[must_use]
    pub fn raw_stash(&self) -> &StackStash<Address> {
        &self.stash
    }

    #[must_use]
    pub fn n_samples(&self) -> u64 {
        self.n_samples
    }

    /// A process was named (exec or first sight)
    pub fn record_process(&mut self, pid: Pid, name: &str) {
        if self.known.insert(pid) {
            self.snapshot(pid, Some(name));
        } else {
            self.journal.push(JournalEntry::Process { pid, name: name.to_string() });
        }
    }

    pub fn record_map(&mut self, pid: Pid, mapping: MemoryMapping) {
        self.ensure_known(pid);
        self.journal.push(JournalEntry::Map { pid, mapping });
    }

    /// A new process was forked from `parent`. Thread creation reports the
    /// same pid twice and is ignored.
    pub fn record_fork(&mut self, parent: Pid, child: Pid) {
        if parent == child {
            return;
        }
        self.ensure_known(parent);
        self.known.insert(child);
        self.journal.push(JournalEntry::Fork { parent, child });
    }

    pub fn record_exit(&mut self, pid: Pid) {
        self.journal.push(JournalEntry::Exit { pid });
    }

    /// Stash one callchain as delivered by the kernel, leaf first
    pub fn record_sample(&mut self, pid: Pid, ips: &[u64]) {
        self.ensure_known(pid);

        self.scratch.clear();
        self.scratch.extend(ips.iter().rev().map(|&ip| Address(ip)));
        if let Some(trace) = self.stash.add_trace(&self.scratch, 1) {
            self.journal.push(JournalEntry::Sample { pid, trace });
            self.n_samples += 1;
        }
    }

    fn ensure_known(&mut self, pid: Pid) {
        if self.known.insert(pid) {
            self.snapshot(pid, None);
        }
    }

    /// Journal the current `/proc` view of a process we have no history for
    fn snapshot(&mut self, pid: Pid, name: Option<&str>) {
        let name = name
            .map(str::to_string)
            .or_else(|| procfs::process_name(&self.proc_root, pid))
            .unwrap_or_else(|| format!("pid {}", pid.0));
        debug!("Snapshotting {pid} ({name}) from {}", self.proc_root.display());
        self.journal.push(JournalEntry::Process { pid, name });

        match read_memory_maps(&self.proc_root, pid) {
            Ok(maps) => {
                self.journal
                    .extend(maps.into_iter().map(|mapping| JournalEntry::Map { pid, mapping }));
            }
            Err(err) => debug!("No mappings for {pid}: {err:#}"),
        }
    }

    /// Replay the journal and resolve every sample into a [`Profile`]
    pub fn create_profile(&self, resolver: &mut SymbolResolver) -> Profile {
        let mut replay = Replay::default();

        for entry in &self.journal {
            match entry {
                JournalEntry::Process { pid, name } => match replay.processes.entry(*pid) {
                    Entry::Occupied(process) => process.into_mut().rename(name),
                    Entry::Vacant(slot) => {
                        slot.insert(ProcessRecord::new(*pid, name));
                    }
                },
                JournalEntry::Map { pid, mapping } => {
                    replay.process(*pid).insert_map(mapping.clone());
                }
                JournalEntry::Fork { parent, child } => {
                    // A child seen before its fork record already has its own state
                    if !replay.processes.contains_key(child) {
                        let forked = match replay.processes.get(parent) {
                            Some(parent) => parent.fork(*child),
                            None => ProcessRecord::unnamed(*child),
                        };
                        replay.processes.insert(*child, forked);
                    }
                }
                // Pids are not recycled within a session; keep the state around
                JournalEntry::Exit { .. } => {}
                JournalEntry::Sample { pid, trace } => {
                    replay.resolve_sample(&self.stash, *pid, *trace, resolver);
                }
            }
        }

        info!(
            "Resolved {} samples into {} symbols across {} processes",
            self.n_samples,
            replay.symbols.len(),
            replay.processes.len()
        );
        Profile::new(replay.symbols, replay.stash)
    }
}

#[derive(Default)]
struct Replay {
    processes: HashMap<Pid, ProcessRecord>,
    symbols: SymbolTable,
    stash: StackStash<SymbolId>,
    frames: Vec<SymbolId>,
}

impl Replay {
    fn process(&mut self, pid: Pid) -> &mut ProcessRecord {
        self.processes.entry(pid).or_insert_with(|| ProcessRecord::unnamed(pid))
    }

    fn resolve_sample(
        &mut self,
        raw: &StackStash<Address>,
        pid: Pid,
        leaf: NodeId,
        resolver: &mut SymbolResolver,
    ) {
        self.process(pid);
        let Some(process) = self.processes.get(&pid) else {
            return;
        };

        self.frames.clear();
        let mut context: Option<CallchainContext> = None;

        for id in raw.ancestors(Some(leaf)) {
            let Address(addr) = raw.node(id).data();

            if let Some(new_context) = CallchainContext::from_marker(addr) {
                if let Some(previous) = context {
                    self.frames.push(self.symbols.intern(previous.label()));
                }
                context = Some(new_context);
                continue;
            }
            if Address(addr).is_context_marker() {
                continue;
            }

            let name = match context.unwrap_or(CallchainContext::User) {
                CallchainContext::Kernel => resolver.resolve_kernel(addr),
                CallchainContext::User => match process.find_map(addr) {
                    Some(mapping) => resolver.resolve_user(mapping, addr),
                    None => format!("??? {}", process.name()),
                },
                // Hypervisor and guest frames cannot be resolved from here
                _ => continue,
            };
            self.frames.push(self.symbols.intern(&name));
        }

        if let Some(last) = context {
            if last != CallchainContext::User {
                self.frames.push(self.symbols.intern(last.label()));
            }
        }

        self.frames.push(self.symbols.intern(process.display_name()));
        self.frames.push(self.symbols.intern(EVERYTHING));
        self.frames.reverse();
        self.stash.add_trace(&self.frames, 1);
    }
}
