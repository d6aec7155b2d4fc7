//! # Ring Buffer Collection
//!
//! The [`Collector`] owns one sampling counter per online CPU and feeds
//! everything the kernel reports into a [`Tracker`].
//!
//! ## Lifecycle
//!
//! ```text
//!  new ──start()──▶ running ──stop()──▶ stopped ──create_profile()──▶ Profile
//!                   │     ▲
//!                   └─────┘ poll() / drain() / reset()
//! ```
//!
//! `start()` is all-or-nothing: a counter that fails to open on any CPU
//! closes the ones already opened. `stop()` drains every ring before
//! disabling and unmapping, so an orderly shutdown loses no samples.
//!
//! Everything runs on the caller's thread. The only blocking point is the
//! readiness wait inside [`Collector::poll`].

#![allow(unsafe_code)] // poll(2) on the counter descriptors

pub mod counter;
pub mod cpu_utils;
pub mod events;
pub mod ring_buffer;

pub use counter::{Counter, CounterKind};
pub use events::{decode_record, CaptureEvent};

use std::io;
use std::time::{Duration, Instant};

use log::{debug, info, trace, warn};
use syshud_common::PerfEventHeader;

use crate::config::ProfilerConfig;
use crate::domain::{CollectorError, CpuId, Tid};
use crate::profile::Profile;
use crate::symbolization::{MemoryMapping, SymbolResolver};
use crate::tracker::Tracker;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum State {
    Idle,
    Running,
    Stopped,
}

/// Routes decoded records into the tracker
#[derive(Debug)]
struct Demux {
    tracker: Tracker,
    /// Samples arriving before this instant are dropped
    dead_until: Option<Instant>,
    n_lost: u64,
    n_dropped: u64,
    ips: Vec<u64>,
}

impl Demux {
    fn new(tracker: Tracker) -> Self {
        Self { tracker, dead_until: None, n_lost: 0, n_dropped: 0, ips: Vec::new() }
    }

    fn handle(&mut self, header: &PerfEventHeader, body: &[u8], now: Instant) {
        let Some(event) = decode_record(header, body, &mut self.ips) else {
            return;
        };

        match event {
            CaptureEvent::Mmap { pid, addr, len, pgoff, inode, filename, .. } => {
                let mapping = MemoryMapping {
                    filename: filename.into_owned(),
                    start: addr,
                    end: addr.saturating_add(len),
                    offset: pgoff,
                    inode,
                };
                self.tracker.record_map(pid, mapping);
            }
            // Thread renames are not process names
            CaptureEvent::Comm { pid, tid, name } if Tid(pid.0) == tid => {
                self.tracker.record_process(pid, &name);
            }
            CaptureEvent::Comm { .. } => {}
            CaptureEvent::Fork { ppid, pid } => self.tracker.record_fork(ppid, pid),
            CaptureEvent::Exit { pid } => self.tracker.record_exit(pid),
            CaptureEvent::Sample { pid, ips, .. } => {
                if self.dead_until.is_some_and(|until| now < until) {
                    self.n_dropped += 1;
                    return;
                }
                self.tracker.record_sample(pid, ips);
            }
            CaptureEvent::Lost { count } => {
                debug!("Kernel lost {count} records");
                self.n_lost += count;
            }
        }
    }
}

/// A per-CPU counter that can be switched on and off
trait Switch {
    fn cpu(&self) -> CpuId;
    fn enable(&self) -> Result<(), CollectorError>;
    fn disable(&self) -> io::Result<()>;
}

impl Switch for Counter {
    fn cpu(&self) -> CpuId {
        Counter::cpu(self)
    }

    fn enable(&self) -> Result<(), CollectorError> {
        Counter::enable(self)
    }

    fn disable(&self) -> io::Result<()> {
        Counter::disable(self)
    }
}

/// Enable `counters` in order. On the first failure the ones already
/// enabled are disabled again and the error is returned.
fn enable_all<C: Switch>(counters: &[C]) -> Result<(), CollectorError> {
    for (i, counter) in counters.iter().enumerate() {
        if let Err(err) = counter.enable() {
            for enabled in &counters[..i] {
                if let Err(err) = enabled.disable() {
                    debug!("Disabling counter on {} during rollback: {err}", enabled.cpu());
                }
            }
            return Err(err);
        }
    }
    Ok(())
}

pub struct Collector {
    config: ProfilerConfig,
    counters: Vec<Counter>,
    demux: Demux,
    state: State,
}

impl Collector {
    #[must_use]
    pub fn new(config: ProfilerConfig) -> Self {
        let tracker = Tracker::new(config.proc_root.clone());
        Self { config, counters: Vec::new(), demux: Demux::new(tracker), state: State::Idle }
    }

    #[must_use]
    pub fn is_running(&self) -> bool {
        self.state == State::Running
    }

    #[must_use]
    pub fn counters(&self) -> &[Counter] {
        &self.counters
    }

    #[must_use]
    pub fn tracker(&self) -> &Tracker {
        &self.demux.tracker
    }

    /// Samples recorded since start or the last reset
    #[must_use]
    pub fn n_samples(&self) -> u64 {
        self.demux.tracker.n_samples()
    }

    /// Records the kernel reported as lost to full ring buffers
    #[must_use]
    pub fn n_lost(&self) -> u64 {
        self.demux.n_lost
    }

    /// Open, map and enable a counter on every online CPU.
    ///
    /// # Errors
    /// Fails if any CPU cannot be set up; nothing stays open in that case.
    pub fn start(&mut self) -> Result<(), CollectorError> {
        if self.state == State::Running {
            return Ok(());
        }

        let cpus = cpu_utils::online_cpus()
            .map_err(|err| CollectorError::Io(io::Error::other(format!("{err:#}"))))?;
        if cpus.is_empty() {
            return Err(CollectorError::NoCpus);
        }

        let mut counters = Vec::with_capacity(cpus.len());
        for cpu in cpus {
            // Dropping `counters` on error closes everything opened so far
            counters.push(Counter::open(cpu, &self.config)?);
        }

        enable_all(&counters)?;

        let kind = counters.first().map(Counter::kind);
        info!("Sampling {} CPUs with {kind:?} counters", counters.len());

        if self.state == State::Stopped {
            self.demux = Demux::new(Tracker::new(self.config.proc_root.clone()));
        }
        self.counters = counters;
        self.state = State::Running;
        Ok(())
    }

    /// Wait up to `timeout` for any ring buffer to become readable, then
    /// drain all of them. Returns the number of records processed.
    ///
    /// # Errors
    /// Returns an error if `poll(2)` itself fails.
    pub fn poll(&mut self, timeout: Duration) -> Result<usize, CollectorError> {
        if self.counters.is_empty() {
            return Ok(0);
        }

        let mut fds: Vec<libc::pollfd> = self
            .counters
            .iter()
            .map(|c| libc::pollfd { fd: c.raw_fd(), events: libc::POLLIN, revents: 0 })
            .collect();
        let timeout_ms = libc::c_int::try_from(timeout.as_millis()).unwrap_or(libc::c_int::MAX);

        // SAFETY: fds is a live array of fds.len() pollfd structs
        let ret = unsafe { libc::poll(fds.as_mut_ptr(), fds.len() as libc::nfds_t, timeout_ms) };
        if ret < 0 {
            let err = io::Error::last_os_error();
            if err.kind() == io::ErrorKind::Interrupted {
                return Ok(0);
            }
            return Err(CollectorError::Io(err));
        }

        Ok(self.drain())
    }

    /// Process everything currently buffered, without waiting
    pub fn drain(&mut self) -> usize {
        let now = Instant::now();
        let demux = &mut self.demux;
        let mut n_records = 0;

        for counter in &mut self.counters {
            n_records += counter.read_records(|header, body| demux.handle(header, body, now));
        }
        if n_records > 0 {
            trace!("Processed {n_records} records");
        }
        n_records
    }

    /// Forget everything recorded so far and start a new measurement window.
    ///
    /// Samples are dropped for the configured dead period afterwards; the
    /// process lifecycle records that arrive meanwhile are still tracked.
    pub fn reset(&mut self) {
        self.drain();
        if self.demux.n_dropped > 0 {
            debug!("Dropped {} samples during the dead period", self.demux.n_dropped);
        }
        self.demux = Demux::new(Tracker::new(self.config.proc_root.clone()));
        self.demux.dead_until = Some(Instant::now() + self.config.dead_period);
    }

    /// Drain, disable and release every counter
    pub fn stop(&mut self) {
        if self.state != State::Running {
            return;
        }

        self.drain();
        for counter in &self.counters {
            if let Err(err) = counter.disable() {
                warn!("Failed to disable counter on {}: {err}", counter.cpu());
            }
        }
        // One last pass for anything written before the disable took effect
        self.drain();
        self.counters.clear();
        self.state = State::Stopped;

        info!("Stopped after {} samples ({} lost)", self.n_samples(), self.demux.n_lost);
    }

    /// Resolve everything recorded into a [`Profile`]
    ///
    /// # Errors
    /// Returns [`CollectorError::NotStopped`] while capture is running.
    pub fn create_profile(&self, resolver: &mut SymbolResolver) -> Result<Profile, CollectorError> {
        if self.state == State::Running {
            return Err(CollectorError::NotStopped);
        }
        Ok(self.demux.tracker.create_profile(resolver))
    }
}

impl Drop for Collector {
    fn drop(&mut self) {
        self.stop();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::collector::ring_buffer::tests::HeapRing;
    use crate::collector::ring_buffer::RingReader;
    use crate::domain::Pid;
    use crate::tracker::JournalEntry;
    use std::cell::Cell;
    use syshud_common::{
        PERF_CONTEXT_USER, PERF_RECORD_COMM, PERF_RECORD_FORK, PERF_RECORD_MMAP, PERF_RECORD_MMAP2,
        PERF_RECORD_SAMPLE,
    };

    fn sample(pid: u32, chain: &[u64]) -> Vec<u8> {
        let mut body = Vec::new();
        body.extend_from_slice(&chain.first().copied().unwrap_or(0).to_ne_bytes());
        body.extend_from_slice(&pid.to_ne_bytes());
        body.extend_from_slice(&pid.to_ne_bytes());
        body.extend_from_slice(&(chain.len() as u64).to_ne_bytes());
        for ip in chain {
            body.extend_from_slice(&ip.to_ne_bytes());
        }
        body
    }

    fn comm(pid: u32, tid: u32, name: &str) -> Vec<u8> {
        let mut body = Vec::new();
        body.extend_from_slice(&pid.to_ne_bytes());
        body.extend_from_slice(&tid.to_ne_bytes());
        body.extend_from_slice(name.as_bytes());
        body.resize(body.len().next_multiple_of(8) + 8, 0);
        body
    }

    fn mmap(pid: u32, addr: u64, len: u64, filename: &str) -> Vec<u8> {
        let mut body = Vec::new();
        body.extend_from_slice(&pid.to_ne_bytes());
        body.extend_from_slice(&pid.to_ne_bytes());
        body.extend_from_slice(&addr.to_ne_bytes());
        body.extend_from_slice(&len.to_ne_bytes());
        body.extend_from_slice(&0u64.to_ne_bytes());
        body.extend_from_slice(filename.as_bytes());
        body.resize(body.len().next_multiple_of(8) + 8, 0);
        body
    }

    fn mmap2(pid: u32, addr: u64, len: u64, inode: u64, filename: &str) -> Vec<u8> {
        let mut body = Vec::new();
        body.extend_from_slice(&pid.to_ne_bytes());
        body.extend_from_slice(&pid.to_ne_bytes());
        body.extend_from_slice(&addr.to_ne_bytes());
        body.extend_from_slice(&len.to_ne_bytes());
        body.extend_from_slice(&0u64.to_ne_bytes());
        // maj, min
        body.extend_from_slice(&[0u8; 8]);
        body.extend_from_slice(&inode.to_ne_bytes());
        // ino_generation, prot, flags
        body.extend_from_slice(&[0u8; 16]);
        body.extend_from_slice(filename.as_bytes());
        body.resize(body.len().next_multiple_of(8) + 8, 0);
        body
    }

    fn fork(ppid: u32, pid: u32) -> Vec<u8> {
        let mut body = Vec::new();
        for value in [pid, ppid, pid, ppid] {
            body.extend_from_slice(&value.to_ne_bytes());
        }
        body.extend_from_slice(&0u64.to_ne_bytes());
        body
    }

    fn feed(demux: &mut Demux, ring: HeapRing, now: Instant) -> usize {
        let mut reader = RingReader::new(ring);
        reader.read_records(|header, body| demux.handle(header, body, now))
    }

    #[test]
    fn test_demux_routes_records() {
        let proc_root = tempfile::tempdir().unwrap();
        let mut demux = Demux::new(Tracker::new(proc_root.path()));

        let mut ring = HeapRing::new(4096);
        ring.push(PERF_RECORD_COMM, &comm(10, 10, "app"));
        ring.push(PERF_RECORD_COMM, &comm(10, 11, "worker-1"));
        ring.push(PERF_RECORD_MMAP, &mmap(10, 0x40_0000, 0x1000, "/nonexistent/app"));
        ring.push(PERF_RECORD_FORK, &fork(10, 12));
        ring.push(PERF_RECORD_FORK, &fork(10, 10));
        ring.push(PERF_RECORD_SAMPLE, &sample(10, &[PERF_CONTEXT_USER, 0x40_0100]));

        assert_eq!(feed(&mut demux, ring, Instant::now()), 6);
        assert_eq!(demux.tracker.n_samples(), 1);

        let journal = demux.tracker.journal();
        // comm (as first sight), map, fork, sample; the thread rename and thread fork are dropped
        assert_eq!(journal.len(), 4);

        let mut resolver = SymbolResolver::default();
        let profile = demux.tracker.create_profile(&mut resolver);
        let objects = profile.objects();
        assert!(objects.iter().any(|o| o.name == "[app]"));
        assert!(objects.iter().any(|o| o.name == "In file /nonexistent/app" && o.self_weight == 1));
    }

    #[test]
    fn test_dead_period_drops_only_samples() {
        let proc_root = tempfile::tempdir().unwrap();
        let mut demux = Demux::new(Tracker::new(proc_root.path()));
        let now = Instant::now();
        demux.dead_until = Some(now + Duration::from_millis(250));

        let mut ring = HeapRing::new(4096);
        ring.push(PERF_RECORD_COMM, &comm(10, 10, "app"));
        ring.push(PERF_RECORD_SAMPLE, &sample(10, &[0x40_0100]));
        feed(&mut demux, ring, now);

        assert_eq!(demux.tracker.n_samples(), 0);
        assert_eq!(demux.n_dropped, 1);
        assert_eq!(demux.tracker.journal().len(), 1);

        let mut ring = HeapRing::new(4096);
        ring.push(PERF_RECORD_SAMPLE, &sample(10, &[0x40_0100]));
        feed(&mut demux, ring, now + Duration::from_millis(300));
        assert_eq!(demux.tracker.n_samples(), 1);
    }

    #[test]
    fn test_create_profile_requires_stop() {
        let proc_root = tempfile::tempdir().unwrap();
        let config = ProfilerConfig {
            proc_root: proc_root.path().to_path_buf(),
            ..ProfilerConfig::default()
        };
        let mut collector = Collector::new(config);
        collector.state = State::Running;
        let mut resolver = SymbolResolver::default();
        assert!(matches!(collector.create_profile(&mut resolver), Err(CollectorError::NotStopped)));

        collector.state = State::Stopped;
        let profile = collector.create_profile(&mut resolver).unwrap();
        assert_eq!(profile.size(), 0);
    }

    #[test]
    fn test_reset_clears_and_starts_dead_period() {
        let proc_root = tempfile::tempdir().unwrap();
        let config = ProfilerConfig {
            proc_root: proc_root.path().to_path_buf(),
            ..ProfilerConfig::default()
        };
        let mut collector = Collector::new(config);
        collector.demux.tracker.record_sample(Pid(1), &[0x1000]);
        assert_eq!(collector.n_samples(), 1);

        collector.reset();
        assert_eq!(collector.n_samples(), 0);
        assert!(collector.demux.dead_until.is_some_and(|t| t > Instant::now()));
    }

    #[test]
    fn test_mmap2_inode_reaches_journal() {
        let proc_root = tempfile::tempdir().unwrap();
        let mut demux = Demux::new(Tracker::new(proc_root.path()));

        let mut ring = HeapRing::new(4096);
        ring.push(PERF_RECORD_COMM, &comm(10, 10, "app"));
        ring.push(PERF_RECORD_MMAP2, &mmap2(10, 0x40_0000, 0x1000, 4242, "/nonexistent/app"));
        feed(&mut demux, ring, Instant::now());

        let inodes: Vec<u64> = demux
            .tracker
            .journal()
            .iter()
            .filter_map(|entry| match entry {
                JournalEntry::Map { mapping, .. } => Some(mapping.inode),
                _ => None,
            })
            .collect();
        assert_eq!(inodes, vec![4242]);
    }

    struct FakeCounter {
        cpu: u32,
        fails: bool,
        enabled: Cell<bool>,
        disables: Cell<u32>,
    }

    impl FakeCounter {
        fn new(cpu: u32, fails: bool) -> Self {
            Self { cpu, fails, enabled: Cell::new(false), disables: Cell::new(0) }
        }
    }

    impl Switch for FakeCounter {
        fn cpu(&self) -> CpuId {
            CpuId(self.cpu)
        }

        fn enable(&self) -> Result<(), CollectorError> {
            if self.fails {
                return Err(CollectorError::SetupFailed {
                    cpu: CpuId(self.cpu),
                    reason: "EBUSY".into(),
                });
            }
            self.enabled.set(true);
            Ok(())
        }

        fn disable(&self) -> io::Result<()> {
            self.enabled.set(false);
            self.disables.set(self.disables.get() + 1);
            Ok(())
        }
    }

    #[test]
    fn test_enable_all_rolls_back_on_failure() {
        let counters: Vec<FakeCounter> =
            (0..4).map(|cpu| FakeCounter::new(cpu, cpu == 2)).collect();

        let err = enable_all(&counters).unwrap_err();
        assert!(matches!(err, CollectorError::SetupFailed { cpu: CpuId(2), .. }));

        for counter in &counters[..2] {
            assert!(!counter.enabled.get());
            assert_eq!(counter.disables.get(), 1);
        }
        for counter in &counters[2..] {
            assert!(!counter.enabled.get());
            assert_eq!(counter.disables.get(), 0);
        }
    }

    #[test]
    fn test_enable_all_success() {
        let counters: Vec<FakeCounter> = (0..3).map(|cpu| FakeCounter::new(cpu, false)).collect();
        enable_all(&counters).unwrap();
        assert!(counters.iter().all(|c| c.enabled.get() && c.disables.get() == 0));
    }
}
