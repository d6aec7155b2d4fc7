//! CPU utility functions
//!
//! Utilities for querying CPU information from /sys filesystem.

use anyhow::{bail, Context, Result};
use std::fs;

use crate::domain::CpuId;

const ONLINE_CPUS_PATH: &str = "/sys/devices/system/cpu/online";

/// Get list of online CPU IDs from /sys/devices/system/cpu/online
///
/// Returns a vector of CPU IDs (e.g., [0, 1, 2, 3] for a 4-core system).
pub fn online_cpus() -> Result<Vec<CpuId>> {
    let content = fs::read_to_string(ONLINE_CPUS_PATH)
        .with_context(|| format!("Failed to read {ONLINE_CPUS_PATH}"))?;
    parse_cpu_list(&content)
}

/// Parse a kernel CPU list such as "0-3" or "0-3,8-11" (NUMA systems)
pub fn parse_cpu_list(content: &str) -> Result<Vec<CpuId>> {
    let mut cpus = Vec::new();

    for range in content.trim().split(',').filter(|r| !r.is_empty()) {
        if let Some((start, end)) = range.split_once('-') {
            // Range like "0-3"
            let start: u32 = start.parse().with_context(|| format!("Bad CPU range {range:?}"))?;
            let end: u32 = end.parse().with_context(|| format!("Bad CPU range {range:?}"))?;
            if start > end {
                bail!("Bad CPU range {range:?}");
            }
            cpus.extend((start..=end).map(CpuId));
        } else {
            // Single CPU like "5"
            let cpu: u32 = range.parse().with_context(|| format!("Bad CPU id {range:?}"))?;
            cpus.push(CpuId(cpu));
        }
    }

    Ok(cpus)
}
