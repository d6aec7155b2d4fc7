//! # syshud - System-wide Sampling CPU Profiler
//!
//! syshud samples every process on every online CPU through the kernel's
//! performance counters, remembers which binaries each process had mapped at
//! the time, and turns the captured call chains into a resolved call tree
//! with per-function self and total weights.
//!
//! ## Architecture Overview
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────┐
//! │                 Kernel (one counter per CPU)                    │
//! │   cycles / cpu-clock samples with call chains, mmap, comm,      │
//! │   fork and exit records written to a shared ring buffer         │
//! └───────────────────────┬─────────────────────────────────────────┘
//!                         │ ring buffer records
//!                         ▼
//! ┌─────────────────────────────────────────────────────────────────┐
//! │                    syshud (This Crate)                          │
//! │                                                                 │
//! │  ┌──────────────┐   ┌──────────────┐   ┌──────────────┐         │
//! │  │  Collector   │──▶│   Tracker    │──▶│   Journal +  │         │
//! │  │ (rings, poll)│   │ (/proc, ids) │   │  raw stash   │         │
//! │  └──────────────┘   └──────────────┘   └──────┬───────┘         │
//! │                                               │ replay          │
//! │                                               ▼                 │
//! │  ┌──────────────┐   ┌──────────────┐   ┌──────────────┐         │
//! │  │   Export /   │◀──│   Profile    │◀──│ Symbolizer   │         │
//! │  │  file format │   │ (call tree)  │   │ (ELF, ksyms) │         │
//! │  └──────────────┘   └──────────────┘   └──────────────┘         │
//! └─────────────────────────────────────────────────────────────────┘
//! ```
//!
//! Capture and resolution are separate phases. While recording, samples are
//! stored as raw addresses and process activity as journal entries; nothing
//! touches an ELF file. Once stopped, the journal is replayed in order so
//! each sample is symbolized against the mappings that were live when it
//! was taken.
//!
//! ## Module Structure
//!
//! - [`collector`]: per-CPU counters, ring buffer consumer, record decoding
//! - [`tracker`]: process journal, `/proc` snapshots, replay into a [`profile::Profile`]
//! - [`symbolization`]: ELF symbol tables, debug file search, kallsyms, demangling
//! - [`stackstash`]: prefix trie that aggregates call chains
//! - [`profile`]: flat, caller and descendant views; save/load
//! - [`export`]: JSON summary of the flat view
//! - [`preflight`]: kernel version and permission checks
//! - [`cli`], [`config`]: command line and profiler settings
//! - [`domain`]: core identifier types and error enums
//!
//! ## Typical Usage
//!
//! ```bash
//! # Profile the whole machine for ten seconds and save the tree
//! sudo ./syshud record --duration 10 --output prof.xml
//!
//! # Look at it again later
//! ./syshud show prof.xml --focus main
//! ```

pub mod cli;
pub mod collector;
pub mod config;
pub mod domain;
pub mod export;
pub mod preflight;
pub mod profile;
pub mod stackstash;
pub mod symbolization;
pub mod tracker;
