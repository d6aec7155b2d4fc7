//! Process information from `/proc`
//!
//! Used for processes that were already running when capture started and so
//! never produced COMM or MMAP records of their own.

use anyhow::{bail, Context, Result};
use std::fs;
use std::path::Path;

use crate::domain::Pid;

/// Best available name for `pid`: command line, then `status` `Name:`, then
/// the `stat` comm field. `None` if the process is gone or nameless.
#[must_use]
pub fn process_name(proc_root: &Path, pid: Pid) -> Option<String> {
    let dir = proc_root.join(pid.0.to_string());

    if let Some(cmdline) = fs::read(dir.join("cmdline")).ok().and_then(|raw| parse_cmdline(&raw)) {
        return Some(cmdline);
    }
    let status = fs::read_to_string(dir.join("status")).ok();
    if let Some(name) = status.as_deref().and_then(parse_status_name) {
        return Some(name);
    }
    fs::read_to_string(dir.join("stat"))
        .ok()
        .and_then(|stat| extract_comm(&stat).ok())
        .filter(|comm| !comm.is_empty())
}

/// Join NUL-separated arguments with spaces. Kernel threads have no command line.
fn parse_cmdline(raw: &[u8]) -> Option<String> {
    let args: Vec<_> = raw
        .split(|&b| b == 0)
        .filter(|arg| !arg.is_empty())
        .map(String::from_utf8_lossy)
        .collect();
    if args.is_empty() {
        return None;
    }
    Some(args.join(" "))
}

fn parse_status_name(status: &str) -> Option<String> {
    status
        .lines()
        .find_map(|line| line.strip_prefix("Name:"))
        .map(|name| name.trim().to_string())
        .filter(|name| !name.is_empty())
}

/// Extract command name from `/proc/<pid>/stat`.
/// Format: "pid (comm) state ..."
fn extract_comm(stat_line: &str) -> Result<String> {
    let open = stat_line.find('(').context("Invalid stat format")?;
    let close = stat_line.rfind(')').context("Invalid stat format")?;
    if open >= close {
        bail!("Invalid stat format");
    }
    Ok(stat_line[open + 1..close].to_string())
}
