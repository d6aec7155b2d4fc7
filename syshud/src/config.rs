//! Profiler configuration
//!
//! One plain struct with the defaults a system-wide session uses. The binary
//! builds it from command-line flags; tests build it directly.

use std::path::PathBuf;
use std::time::Duration;

use crate::symbolization::debug_paths::DEFAULT_DEBUG_DIR;

/// Cycles between samples for the hardware counter
pub const HARDWARE_SAMPLE_PERIOD: u64 = 1_200_000;

/// Nanoseconds between samples for the software clock fallback
pub const SOFTWARE_SAMPLE_PERIOD: u64 = 1_000_000;

/// Data pages per ring buffer (must be a power of two)
pub const N_PAGES: usize = 32;

/// Samples per wakeup
pub const N_WAKEUP_EVENTS: u32 = 149;

/// Window after a reset during which samples are dropped
pub const RESET_DEAD_PERIOD: Duration = Duration::from_millis(250);

#[derive(Debug, Clone)]
pub struct ProfilerConfig {
    /// Try the CPU cycle counter before the software clock
    pub use_hardware_counters: bool,
    pub hardware_sample_period: u64,
    pub software_sample_period: u64,
    pub n_pages: usize,
    pub wakeup_events: u32,
    pub dead_period: Duration,
    /// Global debug directories, searched for `.build-id` and debug links
    pub debug_dirs: Vec<PathBuf>,
    /// Filesystem roots of containers or sandboxes to search as well
    pub sysroots: Vec<PathBuf>,
    pub proc_root: PathBuf,
    pub kallsyms_path: PathBuf,
}

impl Default for ProfilerConfig {
    fn default() -> Self {
        Self {
            use_hardware_counters: true,
            hardware_sample_period: HARDWARE_SAMPLE_PERIOD,
            software_sample_period: SOFTWARE_SAMPLE_PERIOD,
            n_pages: N_PAGES,
            wakeup_events: N_WAKEUP_EVENTS,
            dead_period: RESET_DEAD_PERIOD,
            debug_dirs: vec![PathBuf::from(DEFAULT_DEBUG_DIR)],
            sysroots: Vec::new(),
            proc_root: PathBuf::from("/proc"),
            kallsyms_path: PathBuf::from("/proc/kallsyms"),
        }
    }
}
