//! CLI argument definitions

use clap::{Args as ClapArgs, Parser, Subcommand};
use std::path::PathBuf;

use crate::config::ProfilerConfig;

#[derive(Parser)]
#[command(
    name = "syshud",
    about = "Sample every process on every CPU and report where the time goes",
    after_help = "\
EXAMPLES:
    sudo syshud record                       Profile until Ctrl-C
    sudo syshud record -d 10 -o prof.xml     Profile 10 seconds and save the tree
    sudo syshud record --json top.json       Write the flat view as JSON
    syshud show prof.xml --top 20            Show a saved profile"
)]
pub struct Args {
    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand)]
pub enum Command {
    /// Record a system-wide profile
    Record(RecordArgs),
    /// Print the flat view of a saved profile
    Show(ShowArgs),
}

#[derive(ClapArgs)]
pub struct RecordArgs {
    /// Stop after N seconds (0 = until Ctrl-C)
    #[arg(short, long, default_value = "0")]
    pub duration: u64,

    /// Save the resolved call tree to FILE
    #[arg(short, long, value_name = "FILE")]
    pub output: Option<PathBuf>,

    /// Write the flat view as JSON to FILE
    #[arg(long, value_name = "FILE")]
    pub json: Option<PathBuf>,

    /// Number of entries to print
    #[arg(long, default_value = "25")]
    pub top: usize,

    /// Use the software clock even if a cycle counter is available
    #[arg(long)]
    pub no_hardware: bool,

    /// Extra global debug directory (repeatable)
    #[arg(long = "debug-dir", value_name = "DIR")]
    pub debug_dirs: Vec<PathBuf>,

    /// Filesystem root of a container or sandbox to search for binaries (repeatable)
    #[arg(long = "sysroot", value_name = "DIR")]
    pub sysroots: Vec<PathBuf>,
}

#[derive(ClapArgs)]
pub struct ShowArgs {
    /// Profile saved by `syshud record --output`
    #[arg(value_name = "FILE")]
    pub file: PathBuf,

    /// Number of entries to print
    #[arg(long, default_value = "25")]
    pub top: usize,

    /// Also print the callers and descendants of the function NAME
    #[arg(long, value_name = "NAME")]
    pub focus: Option<String>,
}

impl RecordArgs {
    /// Profiler settings for this run; extra debug directories are searched
    /// before the default one
    #[must_use]
    pub fn to_config(&self) -> ProfilerConfig {
        let mut config = ProfilerConfig {
            use_hardware_counters: !self.no_hardware,
            sysroots: self.sysroots.clone(),
            ..ProfilerConfig::default()
        };
        let mut debug_dirs = self.debug_dirs.clone();
        debug_dirs.append(&mut config.debug_dirs);
        config.debug_dirs = debug_dirs;
        config
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record(argv: &[&str]) -> RecordArgs {
        let args = Args::try_parse_from(argv).unwrap();
        match args.command {
            Command::Record(record) => record,
            Command::Show(_) => panic!("expected record"),
        }
    }

    #[test]
    fn test_record_defaults() {
        let args = record(&["syshud", "record"]);
        assert_eq!(args.duration, 0);
        assert_eq!(args.top, 25);
        assert!(args.output.is_none());

        let config = args.to_config();
        assert!(config.use_hardware_counters);
        assert_eq!(config.debug_dirs, ProfilerConfig::default().debug_dirs);
    }

    #[test]
    fn test_record_to_config() {
        let args = record(&[
            "syshud",
            "record",
            "--no-hardware",
            "--debug-dir",
            "/opt/debug",
            "--sysroot",
            "/var/lib/machines/web",
            "--sysroot",
            "/var/lib/machines/db",
        ]);
        let config = args.to_config();
        assert!(!config.use_hardware_counters);
        assert_eq!(
            config.debug_dirs,
            vec![PathBuf::from("/opt/debug"), PathBuf::from("/usr/lib/debug")]
        );
        assert_eq!(config.sysroots.len(), 2);
    }

    #[test]
    fn test_show_requires_file() {
        assert!(Args::try_parse_from(["syshud", "show"]).is_err());
        let args =
            Args::try_parse_from(["syshud", "show", "prof.xml", "--top", "5", "--focus", "main"])
                .unwrap();
        match args.command {
            Command::Show(show) => {
                assert_eq!(show.file, PathBuf::from("prof.xml"));
                assert_eq!(show.top, 5);
                assert_eq!(show.focus.as_deref(), Some("main"));
            }
            Command::Record(_) => panic!("expected show"),
        }
    }
}
