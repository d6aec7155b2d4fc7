//! Pre-flight checks for syshud
//!
//! Validates system requirements before attempting to open performance counters.
//! Provides clear, actionable error messages when requirements aren't met.

#![allow(unsafe_code)] // geteuid() requires unsafe

use anyhow::{bail, Context, Result};
use log::warn;
use std::path::Path;

/// First kernel with the perf_event interface
const MIN_KERNEL_VERSION: (u32, u32, u32) = (2, 6, 31);

const PARANOID_PATH: &str = "/proc/sys/kernel/perf_event_paranoid";

/// Highest `perf_event_paranoid` level that still allows unprivileged
/// CPU-wide sampling
const MAX_UNPRIVILEGED_PARANOID: i32 = 0;

/// Run all pre-flight checks before opening counters
pub fn run_preflight_checks(kallsyms_path: &Path) -> Result<()> {
    check_kernel_version()?;
    check_privileges()?;
    check_kernel_symbols(kallsyms_path);
    Ok(())
}

/// Check that we may sample every process on every CPU
fn check_privileges() -> Result<()> {
    // SAFETY: geteuid has no preconditions
    if unsafe { libc::geteuid() } == 0 {
        return Ok(());
    }

    let content = std::fs::read_to_string(PARANOID_PATH)
        .with_context(|| format!("Failed to read {PARANOID_PATH}"))?;
    let level = parse_paranoid(&content)?;
    if level > MAX_UNPRIVILEGED_PARANOID {
        bail!(
            "Permission denied: system-wide profiling requires root or \
             perf_event_paranoid <= {MAX_UNPRIVILEGED_PARANOID} (current: {level}).\n\n\
             Run with: sudo syshud record\n\
             Or lower the level: sudo sysctl kernel.perf_event_paranoid={MAX_UNPRIVILEGED_PARANOID}"
        );
    }
    Ok(())
}

fn parse_paranoid(content: &str) -> Result<i32> {
    content
        .trim()
        .parse()
        .with_context(|| format!("Unexpected perf_event_paranoid value {:?}", content.trim()))
}

/// Check if the kernel is new enough to have perf events
fn check_kernel_version() -> Result<()> {
    let version_str = std::fs::read_to_string("/proc/version")
        .context("Failed to read kernel version from /proc/version")?;

    // Parse version like "Linux version 5.15.0-generic ..." or "Linux version 6.1.0-arch1-1 ..."
    let release = version_str.split_whitespace().nth(2).unwrap_or("unknown");
    let Some(version) = parse_release(release) else {
        // Can't parse, assume it's fine
        return Ok(());
    };

    if version < MIN_KERNEL_VERSION {
        bail!(
            "Kernel version {release} is too old.\n\n\
             syshud requires Linux {}.{}.{} or newer for performance counters.",
            MIN_KERNEL_VERSION.0,
            MIN_KERNEL_VERSION.1,
            MIN_KERNEL_VERSION.2
        );
    }

    Ok(())
}

/// `(major, minor, patch)` from a release string like "6.1.0-arch1-1"
fn parse_release(release: &str) -> Option<(u32, u32, u32)> {
    let mut parts = release.split('.').map(|part| {
        part.chars().take_while(char::is_ascii_digit).collect::<String>().parse::<u32>().ok()
    });
    let major = parts.next()??;
    let minor = parts.next()??;
    let patch = parts.next().flatten().unwrap_or(0);
    Some((major, minor, patch))
}

/// Kernel frames need a readable kallsyms with real addresses
fn check_kernel_symbols(kallsyms_path: &Path) {
    if let Err(err) = std::fs::File::open(kallsyms_path) {
        warn!(
            "Cannot read {}: {err}; kernel frames will show as \"In kernel\"",
            kallsyms_path.display()
        );
    }
}
