//! # syshud - Main Entry Point
//!
//! - **record**: sample every CPU until the duration elapses or Ctrl-C, then
//!   resolve symbols and print the flat view
//! - **show**: load a saved profile and print the flat view

#![allow(clippy::cast_precision_loss)] // percentages for display

use anyhow::{Context, Result};
use clap::Parser;
use log::{info, warn};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use syshud::cli::{Args, Command, RecordArgs, ShowArgs};
use syshud::collector::Collector;
use syshud::export::export_json_summary;
use syshud::preflight::run_preflight_checks;
use syshud::profile::file_format::{load_profile, save_profile};
use syshud::profile::{DescendantTree, Profile, ProfileObject};
use syshud::symbolization::SymbolResolver;

// Exit codes
const EXIT_SUCCESS: i32 = 0;
const EXIT_ERROR: i32 = 1;
const EXIT_USAGE: i32 = 2;
const EXIT_NOPERM: i32 = 77;

/// Readiness wait per loop iteration; bounds Ctrl-C latency
const POLL_INTERVAL: Duration = Duration::from_millis(100);

/// Deepest descendant level printed by `show --focus`
const MAX_TREE_DEPTH: usize = 12;

fn main() {
    env_logger::init();
    std::process::exit(match run() {
        Ok(()) => EXIT_SUCCESS,
        Err(e) => {
            let code = exit_code_for(&e);
            eprintln!("error: {e:#}");
            code
        }
    });
}

fn exit_code_for(err: &anyhow::Error) -> i32 {
    let msg = format!("{err:#}").to_lowercase();
    if msg.contains("permission denied") || msg.contains("requires root") {
        EXIT_NOPERM
    } else if msg.contains("unknown function") {
        EXIT_USAGE
    } else {
        EXIT_ERROR
    }
}

fn run() -> Result<()> {
    let args = Args::parse();
    match args.command {
        Command::Record(record) => run_record(&record),
        Command::Show(show) => run_show(&show),
    }
}

fn run_record(args: &RecordArgs) -> Result<()> {
    let config = args.to_config();
    run_preflight_checks(&config.kallsyms_path)?;

    let interrupted = Arc::new(AtomicBool::new(false));
    {
        let interrupted = Arc::clone(&interrupted);
        ctrlc::set_handler(move || interrupted.store(true, Ordering::SeqCst))
            .context("Failed to install Ctrl-C handler")?;
    }

    let mut collector = Collector::new(config.clone());
    collector.start().context("Failed to start sampling")?;
    let n_cpus = collector.counters().len();

    let deadline = (args.duration > 0).then(|| Instant::now() + Duration::from_secs(args.duration));
    match deadline {
        Some(_) => eprintln!("Sampling for {}s on {n_cpus} CPUs...", args.duration),
        None => eprintln!("Sampling on {n_cpus} CPUs, press Ctrl-C to stop..."),
    }

    let started = Instant::now();
    while !interrupted.load(Ordering::SeqCst) {
        if deadline.is_some_and(|d| Instant::now() >= d) {
            break;
        }
        collector.poll(POLL_INTERVAL)?;
    }
    collector.stop();

    let elapsed = started.elapsed();
    info!("Captured {} samples in {:.1}s", collector.n_samples(), elapsed.as_secs_f64());
    if collector.n_lost() > 0 {
        warn!("{} records were lost to full ring buffers", collector.n_lost());
    }

    let mut resolver = SymbolResolver::from_config(&config);
    let profile = collector.create_profile(&mut resolver)?;

    print_objects(&profile, args.top);

    if let Some(ref path) = args.output {
        save_profile(&profile, path).with_context(|| format!("Failed to save {}", path.display()))?;
        eprintln!("Profile saved to {}", path.display());
    }
    if let Some(ref path) = args.json {
        export_json_summary(&profile, Some(args.top), path)
            .with_context(|| format!("Failed to write {}", path.display()))?;
        eprintln!("Summary written to {}", path.display());
    }
    Ok(())
}

fn run_show(args: &ShowArgs) -> Result<()> {
    let profile = load_profile(&args.file)
        .with_context(|| format!("Failed to load {}", args.file.display()))?;
    print_objects(&profile, args.top);

    if let Some(ref name) = args.focus {
        let symbol = profile
            .symbol(name)
            .with_context(|| format!("Unknown function {name:?} in {}", args.file.display()))?;

        println!("\nCallers of {name}:");
        print_rows(&profile.callers(symbol), profile.size(), args.top);

        println!("\nDescendants of {name} (self, total, non-recursive):");
        print_descendants(&profile, &profile.descendants(symbol));
    }
    Ok(())
}

fn print_objects(profile: &Profile, top: usize) {
    let size = profile.size();
    if size == 0 {
        println!("No samples.");
        return;
    }
    println!("{size} samples");
    print_rows(&profile.objects(), size, top);
}

fn print_rows(rows: &[ProfileObject], size: u64, top: usize) {
    println!("{:>8} {:>8}  FUNCTION", "SELF", "TOTAL");
    for row in rows.iter().take(top) {
        println!(
            "{:>7.2}% {:>7.2}%  {}",
            percent(row.self_weight, size),
            percent(row.total, size),
            row.name
        );
    }
}

fn print_descendants(profile: &Profile, tree: &DescendantTree) {
    let size = profile.size();
    let mut stack: Vec<(usize, usize)> =
        tree.root_indices().iter().rev().map(|&i| (i, 0)).collect();

    while let Some((index, depth)) = stack.pop() {
        let node = tree.node(index);
        println!(
            "{:>7.2}% {:>7.2}% {:>7.2}%  {:indent$}{}",
            percent(node.self_weight, size),
            percent(node.total, size),
            percent(node.non_recursion, size),
            "",
            profile.symbols().name(node.symbol),
            indent = depth * 2
        );
        if depth + 1 < MAX_TREE_DEPTH {
            let mut children = node.children.clone();
            children.sort_by_key(|&c| std::cmp::Reverse(tree.node(c).total));
            stack.extend(children.into_iter().rev().map(|c| (c, depth + 1)));
        }
    }
}

fn percent(weight: u64, size: u64) -> f64 {
    if size == 0 {
        0.0
    } else {
        weight as f64 * 100.0 / size as f64
    }
}
