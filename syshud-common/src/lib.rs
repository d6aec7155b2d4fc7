//! # Shared Kernel ABI (perf_event ↔ Userspace)
//!
//! Defines the data structures and constants of the Linux `perf_event_open(2)`
//! interface that the capture path relies on. All types use `#[repr(C)]` so that
//! they match the layout the kernel reads (attributes) and writes (ring buffer
//! metadata page and record headers).
//!
//! ## Key Types
//!
//! - [`PerfEventAttr`] - Counter configuration passed to `perf_event_open`
//! - [`PerfEventMmapPage`] - First page of every counter mapping (`data_head`/`data_tail`)
//! - [`PerfEventHeader`] - Fixed header preceding every ring buffer record
//!
//! Callchain context markers ([`PERF_CONTEXT_KERNEL`] and friends) are stored
//! inline in sample callchains and separate kernel, user and guest frames.

#![no_std]

// ============================================================================
// Counter Types
// ============================================================================

pub const PERF_TYPE_HARDWARE: u32 = 0;
pub const PERF_TYPE_SOFTWARE: u32 = 1;

/// Total CPU cycles (hardware counter)
pub const PERF_COUNT_HW_CPU_CYCLES: u64 = 0;

/// High resolution per-CPU timer (software fallback)
pub const PERF_COUNT_SW_CPU_CLOCK: u64 = 0;

// ============================================================================
// Sample Format
// ============================================================================

pub const PERF_SAMPLE_IP: u64 = 1 << 0;
pub const PERF_SAMPLE_TID: u64 = 1 << 1;
pub const PERF_SAMPLE_CALLCHAIN: u64 = 1 << 5;

// ============================================================================
// Attribute Flag Bits
// ============================================================================
//
// `perf_event_attr` packs its boolean options into one 64-bit bitfield that
// starts right after `read_format`. On little-endian targets bit N is `1 << N`.

pub const PERF_ATTR_FLAG_DISABLED: u64 = 1 << 0;
pub const PERF_ATTR_FLAG_EXCLUDE_IDLE: u64 = 1 << 7;
pub const PERF_ATTR_FLAG_MMAP: u64 = 1 << 8;
pub const PERF_ATTR_FLAG_COMM: u64 = 1 << 9;
pub const PERF_ATTR_FLAG_TASK: u64 = 1 << 13;
/// Report mappings as MMAP2 records, which carry the inode
pub const PERF_ATTR_FLAG_MMAP2: u64 = 1 << 23;

// ============================================================================
// ioctl Requests
// ============================================================================

/// `_IO('$', 0)`
pub const PERF_EVENT_IOC_ENABLE: u64 = 0x2400;
/// `_IO('$', 1)`
pub const PERF_EVENT_IOC_DISABLE: u64 = 0x2401;

/// `perf_event_open` flag: close the counter fd on exec
pub const PERF_FLAG_FD_CLOEXEC: u64 = 1 << 3;

// ============================================================================
// Record Types
// ============================================================================

pub const PERF_RECORD_MMAP: u32 = 1;
pub const PERF_RECORD_LOST: u32 = 2;
pub const PERF_RECORD_COMM: u32 = 3;
pub const PERF_RECORD_EXIT: u32 = 4;
pub const PERF_RECORD_THROTTLE: u32 = 5;
pub const PERF_RECORD_UNTHROTTLE: u32 = 6;
pub const PERF_RECORD_FORK: u32 = 7;
pub const PERF_RECORD_READ: u32 = 8;
pub const PERF_RECORD_SAMPLE: u32 = 9;
pub const PERF_RECORD_MMAP2: u32 = 10;

/// Mask selecting the cpumode bits of `PerfEventHeader::misc`
pub const PERF_RECORD_MISC_CPUMODE_MASK: u16 = 0x7;
pub const PERF_RECORD_MISC_KERNEL: u16 = 1;
pub const PERF_RECORD_MISC_USER: u16 = 2;
/// MMAP2 carries a build-id in place of device and inode numbers
pub const PERF_RECORD_MISC_MMAP_BUILD_ID: u16 = 1 << 14;

// ============================================================================
// Callchain Context Markers
// ============================================================================
//
// Sentinel values the kernel inserts into a callchain. Every frame after a
// marker (in callchain order, innermost first) belongs to that context.

pub const PERF_CONTEXT_HV: u64 = u64::MAX - 31;
pub const PERF_CONTEXT_KERNEL: u64 = u64::MAX - 127;
pub const PERF_CONTEXT_USER: u64 = u64::MAX - 511;
pub const PERF_CONTEXT_GUEST: u64 = u64::MAX - 2047;
pub const PERF_CONTEXT_GUEST_KERNEL: u64 = u64::MAX - 2175;
pub const PERF_CONTEXT_GUEST_USER: u64 = u64::MAX - 2559;
/// Any callchain entry at or above this value is a marker, not an address
pub const PERF_CONTEXT_MAX: u64 = u64::MAX - 4095;

/// Returns true if `ip` is a callchain context marker rather than an address
#[must_use]
pub const fn is_context_marker(ip: u64) -> bool {
    ip >= PERF_CONTEXT_MAX
}

// ============================================================================
// perf_event_attr
// ============================================================================

/// Counter configuration (`struct perf_event_attr`, `PERF_ATTR_SIZE_VER6`)
#[repr(C)]
#[derive(Debug, Clone, Copy, Default)]
pub struct PerfEventAttr {
    pub type_: u32,
    pub size: u32,
    pub config: u64,
    pub sample_period_or_freq: u64,
    pub sample_type: u64,
    pub read_format: u64,
    pub flags: u64,
    pub wakeup_events_or_watermark: u32,
    pub bp_type: u32,
    pub bp_addr_or_config1: u64,
    pub bp_len_or_config2: u64,
    pub branch_sample_type: u64,
    pub sample_regs_user: u64,
    pub sample_stack_user: u32,
    pub clock_id: i32,
    pub sample_regs_intr: u64,
    pub aux_watermark: u32,
    pub sample_max_stack: u16,
    pub reserved_2: u16,
    pub aux_sample_size: u32,
    pub reserved_3: u32,
}

impl PerfEventAttr {
    /// Value for the `size` field
    #[allow(clippy::cast_possible_truncation)]
    pub const SIZE: u32 = core::mem::size_of::<Self>() as u32;
}

// ============================================================================
// perf_event_mmap_page
// ============================================================================

/// Metadata page at the start of every counter mapping.
///
/// The kernel advances `data_head`; the consumer advances `data_tail`.
/// The data area starts one page after this struct.
#[repr(C)]
pub struct PerfEventMmapPage {
    pub version: u32,
    pub compat_version: u32,
    pub lock: u32,
    pub index: u32,
    pub offset: i64,
    pub time_enabled: u64,
    pub time_running: u64,
    pub capabilities: u64,
    pub pmc_width: u16,
    pub time_shift: u16,
    pub time_mult: u32,
    pub time_offset: u64,
    pub time_zero: u64,
    pub size: u32,
    pub reserved: [u8; 948],
    pub data_head: u64,
    pub data_tail: u64,
    pub data_offset: u64,
    pub data_size: u64,
    pub aux_head: u64,
    pub aux_tail: u64,
    pub aux_offset: u64,
    pub aux_size: u64,
}

/// Byte offset of `data_head` within the metadata page
pub const DATA_HEAD_OFFSET: usize = core::mem::offset_of!(PerfEventMmapPage, data_head);

/// Byte offset of `data_tail` within the metadata page
pub const DATA_TAIL_OFFSET: usize = core::mem::offset_of!(PerfEventMmapPage, data_tail);

// ============================================================================
// perf_event_header
// ============================================================================

/// Header preceding every record in the ring buffer
#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PerfEventHeader {
    pub type_: u32,
    pub misc: u16,
    /// Size of the whole record, header included
    pub size: u16,
}

pub const PERF_EVENT_HEADER_SIZE: usize = core::mem::size_of::<PerfEventHeader>();

impl PerfEventHeader {
    /// Decode a header from the first eight bytes of `bytes` (native endian)
    #[must_use]
    pub fn from_bytes(bytes: &[u8; PERF_EVENT_HEADER_SIZE]) -> Self {
        Self {
            type_: u32::from_ne_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]),
            misc: u16::from_ne_bytes([bytes[4], bytes[5]]),
            size: u16::from_ne_bytes([bytes[6], bytes[7]]),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_mmap_page_layout() {
        assert_eq!(DATA_HEAD_OFFSET, 1024);
        assert_eq!(DATA_TAIL_OFFSET, 1032);
    }

    #[test]
    fn test_attr_size() {
        assert_eq!(core::mem::size_of::<PerfEventAttr>(), 120);
    }

    #[test]
    fn test_context_markers() {
        assert!(is_context_marker(PERF_CONTEXT_KERNEL));
        assert!(is_context_marker(PERF_CONTEXT_USER));
        assert!(is_context_marker(PERF_CONTEXT_GUEST_USER));
        assert!(!is_context_marker(0xffff_ffff_8100_0000));
        assert!(!is_context_marker(0x40_1000));
    }

    #[test]
    fn test_header_from_bytes() {
        let mut raw = [0u8; PERF_EVENT_HEADER_SIZE];
        raw[..4].copy_from_slice(&PERF_RECORD_SAMPLE.to_ne_bytes());
        raw[4..6].copy_from_slice(&PERF_RECORD_MISC_KERNEL.to_ne_bytes());
        raw[6..].copy_from_slice(&48u16.to_ne_bytes());
        let header = PerfEventHeader::from_bytes(&raw);
        assert_eq!(header, PerfEventHeader { type_: 9, misc: 1, size: 48 });
    }
}
