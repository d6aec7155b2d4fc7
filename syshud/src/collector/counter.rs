//! One per-CPU performance counter and its mapped ring buffer
//!
//! Counters are opened disabled; the collector enables them together once
//! every CPU has succeeded.

#![allow(unsafe_code)] // perf_event_open, mmap and ioctl have no safe wrappers

use std::io;
use std::os::fd::{AsRawFd, FromRawFd, OwnedFd, RawFd};
use std::ptr;
use std::sync::atomic::{fence, Ordering};

use log::{debug, info};
use syshud_common::{
    PerfEventAttr, PerfEventHeader, DATA_HEAD_OFFSET, DATA_TAIL_OFFSET, PERF_ATTR_FLAG_COMM,
    PERF_ATTR_FLAG_DISABLED, PERF_ATTR_FLAG_EXCLUDE_IDLE, PERF_ATTR_FLAG_MMAP,
    PERF_ATTR_FLAG_MMAP2, PERF_ATTR_FLAG_TASK, PERF_COUNT_HW_CPU_CYCLES, PERF_COUNT_SW_CPU_CLOCK,
    PERF_EVENT_IOC_DISABLE, PERF_EVENT_IOC_ENABLE, PERF_FLAG_FD_CLOEXEC, PERF_SAMPLE_CALLCHAIN,
    PERF_SAMPLE_IP, PERF_SAMPLE_TID, PERF_TYPE_HARDWARE, PERF_TYPE_SOFTWARE,
};

use super::ring_buffer::{RingMemory, RingReader};
use crate::config::ProfilerConfig;
use crate::domain::{CollectorError, CpuId};

/// Which event drives sampling
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CounterKind {
    /// CPU cycles
    Hardware,
    /// High resolution timer, used where no cycle counter exists
    Software,
}

/// Build the attributes for one system-wide sampling counter
#[must_use]
pub fn counter_attr(kind: CounterKind, config: &ProfilerConfig) -> PerfEventAttr {
    let (type_, counter, period) = match kind {
        CounterKind::Hardware => {
            (PERF_TYPE_HARDWARE, PERF_COUNT_HW_CPU_CYCLES, config.hardware_sample_period)
        }
        CounterKind::Software => {
            (PERF_TYPE_SOFTWARE, PERF_COUNT_SW_CPU_CLOCK, config.software_sample_period)
        }
    };

    PerfEventAttr {
        type_,
        size: PerfEventAttr::SIZE,
        config: counter,
        sample_period_or_freq: period,
        sample_type: PERF_SAMPLE_IP | PERF_SAMPLE_TID | PERF_SAMPLE_CALLCHAIN,
        flags: PERF_ATTR_FLAG_DISABLED
            | PERF_ATTR_FLAG_EXCLUDE_IDLE
            | PERF_ATTR_FLAG_MMAP
            | PERF_ATTR_FLAG_MMAP2
            | PERF_ATTR_FLAG_COMM
            | PERF_ATTR_FLAG_TASK,
        wakeup_events_or_watermark: config.wakeup_events,
        ..PerfEventAttr::default()
    }
}

/// Errors that mean "this machine has no such counter", not "you may not"
fn is_missing_counter(err: &io::Error) -> bool {
    matches!(err.raw_os_error(), Some(libc::ENODEV | libc::ENOENT | libc::EOPNOTSUPP))
}

fn perf_event_open(attr: &PerfEventAttr, cpu: CpuId) -> io::Result<OwnedFd> {
    let cpu = libc::c_int::try_from(cpu.0).map_err(|_| io::Error::from_raw_os_error(libc::EINVAL))?;
    // SAFETY: attr points to a live, fully initialised perf_event_attr of the size it declares
    let fd = unsafe {
        libc::syscall(
            libc::SYS_perf_event_open,
            ptr::from_ref(attr),
            -1 as libc::pid_t,
            cpu,
            -1 as libc::c_int,
            PERF_FLAG_FD_CLOEXEC as libc::c_ulong,
        )
    };
    if fd < 0 {
        return Err(io::Error::last_os_error());
    }
    let fd = RawFd::try_from(fd).map_err(|_| io::Error::from_raw_os_error(libc::EBADF))?;
    // SAFETY: the kernel just handed us this descriptor and nothing else owns it
    Ok(unsafe { OwnedFd::from_raw_fd(fd) })
}

fn page_size() -> usize {
    // SAFETY: sysconf has no preconditions
    let size = unsafe { libc::sysconf(libc::_SC_PAGESIZE) };
    usize::try_from(size).unwrap_or(4096)
}

/// The `(n_pages + 1)`-page shared mapping of one counter
#[derive(Debug)]
pub struct MappedRing {
    base: *mut u8,
    map_len: usize,
    page_size: usize,
}

// SAFETY: the mapping is owned exclusively by this value; the kernel side is
// synchronised through data_head/data_tail with fences
unsafe impl Send for MappedRing {}

impl MappedRing {
    fn map(fd: &OwnedFd, n_pages: usize) -> io::Result<Self> {
        let page_size = page_size();
        let map_len = (n_pages + 1) * page_size;
        // SAFETY: mapping a perf fd we own; the result is checked against MAP_FAILED
        let base = unsafe {
            libc::mmap(
                ptr::null_mut(),
                map_len,
                libc::PROT_READ | libc::PROT_WRITE,
                libc::MAP_SHARED,
                fd.as_raw_fd(),
                0,
            )
        };
        if base == libc::MAP_FAILED {
            return Err(io::Error::last_os_error());
        }
        Ok(Self { base: base.cast::<u8>(), map_len, page_size })
    }
}

impl RingMemory for MappedRing {
    fn data(&self) -> &[u8] {
        // SAFETY: the data area is the mapping minus its first page and lives as long as self
        unsafe {
            std::slice::from_raw_parts(self.base.add(self.page_size), self.map_len - self.page_size)
        }
    }

    fn read_head(&self) -> u64 {
        // SAFETY: data_head lies inside the metadata page, 8-byte aligned
        let head = unsafe { ptr::read_volatile(self.base.add(DATA_HEAD_OFFSET).cast::<u64>()) };
        fence(Ordering::Acquire);
        head
    }

    fn write_tail(&mut self, tail: u64) {
        fence(Ordering::Release);
        // SAFETY: data_tail lies inside the metadata page, which is mapped writable
        unsafe { ptr::write_volatile(self.base.add(DATA_TAIL_OFFSET).cast::<u64>(), tail) };
    }
}

impl Drop for MappedRing {
    fn drop(&mut self) {
        // SAFETY: base/map_len describe a mapping created in `map` and not yet unmapped
        unsafe {
            libc::munmap(self.base.cast::<libc::c_void>(), self.map_len);
        }
    }
}

/// An open, mapped counter for one CPU
pub struct Counter {
    cpu: CpuId,
    kind: CounterKind,
    // Unmapped before the descriptor is closed
    ring: RingReader<MappedRing>,
    fd: OwnedFd,
}

impl Counter {
    /// Open and map a disabled counter on `cpu`.
    ///
    /// Tries the cycle counter first (when configured) and falls back to the
    /// software clock if the hardware has none.
    pub fn open(cpu: CpuId, config: &ProfilerConfig) -> Result<Self, CollectorError> {
        let setup_failed =
            |what: &str, err: io::Error| CollectorError::SetupFailed {
                cpu,
                reason: format!("{what}: {err}"),
            };

        let mut kind = if config.use_hardware_counters {
            CounterKind::Hardware
        } else {
            CounterKind::Software
        };

        let fd = match perf_event_open(&counter_attr(kind, config), cpu) {
            Ok(fd) => fd,
            Err(err) if kind == CounterKind::Hardware && is_missing_counter(&err) => {
                info!("No cycle counter on {cpu} ({err}), using the software clock");
                kind = CounterKind::Software;
                perf_event_open(&counter_attr(kind, config), cpu)
                    .map_err(|err| setup_failed("perf_event_open", err))?
            }
            Err(err) => return Err(setup_failed("perf_event_open", err)),
        };

        let ring = MappedRing::map(&fd, config.n_pages).map_err(|err| setup_failed("mmap", err))?;
        debug!("Opened {kind:?} counter on {cpu}");

        Ok(Self { cpu, kind, ring: RingReader::new(ring), fd })
    }

    #[must_use]
    pub fn cpu(&self) -> CpuId {
        self.cpu
    }

    #[must_use]
    pub fn kind(&self) -> CounterKind {
        self.kind
    }

    #[must_use]
    pub fn raw_fd(&self) -> RawFd {
        self.fd.as_raw_fd()
    }

    pub fn enable(&self) -> Result<(), CollectorError> {
        self.ioctl(PERF_EVENT_IOC_ENABLE).map_err(|err| CollectorError::SetupFailed {
            cpu: self.cpu,
            reason: format!("enable: {err}"),
        })
    }

    pub fn disable(&self) -> io::Result<()> {
        self.ioctl(PERF_EVENT_IOC_DISABLE)
    }

    fn ioctl(&self, request: u64) -> io::Result<()> {
        // SAFETY: enable/disable take no argument pointer
        let ret = unsafe { libc::ioctl(self.fd.as_raw_fd(), request as _, 0) };
        if ret < 0 {
            return Err(io::Error::last_os_error());
        }
        Ok(())
    }

    /// Deliver pending records to `f`; see [`RingReader::read_records`]
    pub fn read_records<F>(&mut self, f: F) -> usize
    where
        F: FnMut(&PerfEventHeader, &[u8]),
    {
        self.ring.read_records(f)
    }
}
