//! Decoding of ring buffer records into [`CaptureEvent`]s
//!
//! Record bodies are laid out by the attribute flags the collector requests:
//! no `sample_id_all` trailer, and samples carry `IP | TID | CALLCHAIN` in
//! that order. Every read is bounds-checked; a truncated record decodes to
//! `None` rather than panicking.

use std::borrow::Cow;

use log::trace;
use syshud_common::{
    PerfEventHeader, PERF_CONTEXT_KERNEL, PERF_CONTEXT_USER, PERF_RECORD_COMM, PERF_RECORD_EXIT,
    PERF_RECORD_FORK, PERF_RECORD_LOST, PERF_RECORD_MISC_CPUMODE_MASK, PERF_RECORD_MISC_KERNEL,
    PERF_RECORD_MISC_MMAP_BUILD_ID, PERF_RECORD_MMAP, PERF_RECORD_MMAP2, PERF_RECORD_SAMPLE,
};

use crate::domain::{Pid, Tid};

/// One decoded kernel record, borrowing from the ring buffer
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CaptureEvent<'a> {
    Mmap {
        pid: Pid,
        tid: Tid,
        addr: u64,
        len: u64,
        pgoff: u64,
        /// Only MMAP2 records carry an inode; zero otherwise
        inode: u64,
        filename: Cow<'a, str>,
    },
    Comm {
        pid: Pid,
        tid: Tid,
        name: Cow<'a, str>,
    },
    Fork {
        ppid: Pid,
        pid: Pid,
    },
    Exit {
        pid: Pid,
    },
    /// Callchain in kernel order: leaf first, context markers inline
    Sample {
        pid: Pid,
        tid: Tid,
        ips: &'a [u64],
    },
    Lost {
        count: u64,
    },
}

/// Bounds-checked cursor over a record body
struct BodyReader<'a> {
    data: &'a [u8],
    pos: usize,
}

impl<'a> BodyReader<'a> {
    fn new(data: &'a [u8]) -> Self {
        Self { data, pos: 0 }
    }

    fn bytes(&mut self, len: usize) -> Option<&'a [u8]> {
        let end = self.pos.checked_add(len)?;
        let bytes = self.data.get(self.pos..end)?;
        self.pos = end;
        Some(bytes)
    }

    fn u32(&mut self) -> Option<u32> {
        self.bytes(4)?.try_into().ok().map(u32::from_ne_bytes)
    }

    fn u64(&mut self) -> Option<u64> {
        self.bytes(8)?.try_into().ok().map(u64::from_ne_bytes)
    }

    fn skip(&mut self, len: usize) -> Option<()> {
        self.bytes(len).map(|_| ())
    }

    /// NUL-terminated string padded to the end of the record
    fn c_str(&mut self) -> Cow<'a, str> {
        let rest = &self.data[self.pos.min(self.data.len())..];
        self.pos = self.data.len();
        let end = rest.iter().position(|&b| b == 0).unwrap_or(rest.len());
        String::from_utf8_lossy(&rest[..end])
    }
}

/// Decode one record body (the bytes after the header).
///
/// Sample callchains are copied into `ips`, which the caller reuses across
/// records. An empty callchain is replaced by a synthetic one built from the
/// sampled `ip` and the header's CPU mode. Returns `None` for record types
/// the profiler ignores and for truncated records.
pub fn decode_record<'a>(
    header: &PerfEventHeader,
    body: &'a [u8],
    ips: &'a mut Vec<u64>,
) -> Option<CaptureEvent<'a>> {
    let mut reader = BodyReader::new(body);

    let event = match header.type_ {
        PERF_RECORD_MMAP => {
            let pid = Pid(reader.u32()?);
            let tid = Tid(reader.u32()?);
            let addr = reader.u64()?;
            let len = reader.u64()?;
            let pgoff = reader.u64()?;
            CaptureEvent::Mmap { pid, tid, addr, len, pgoff, inode: 0, filename: reader.c_str() }
        }
        PERF_RECORD_MMAP2 => {
            let pid = Pid(reader.u32()?);
            let tid = Tid(reader.u32()?);
            let addr = reader.u64()?;
            let len = reader.u64()?;
            let pgoff = reader.u64()?;
            let inode = if header.misc & PERF_RECORD_MISC_MMAP_BUILD_ID == 0 {
                // maj, min
                reader.skip(8)?;
                let inode = reader.u64()?;
                // ino_generation
                reader.skip(8)?;
                inode
            } else {
                // build_id_size, reserved, build_id[20]
                reader.skip(24)?;
                0
            };
            // prot, flags
            reader.skip(8)?;
            CaptureEvent::Mmap { pid, tid, addr, len, pgoff, inode, filename: reader.c_str() }
        }
        PERF_RECORD_COMM => {
            let pid = Pid(reader.u32()?);
            let tid = Tid(reader.u32()?);
            CaptureEvent::Comm { pid, tid, name: reader.c_str() }
        }
        PERF_RECORD_FORK => {
            let pid = Pid(reader.u32()?);
            let ppid = Pid(reader.u32()?);
            CaptureEvent::Fork { ppid, pid }
        }
        PERF_RECORD_EXIT => CaptureEvent::Exit { pid: Pid(reader.u32()?) },
        PERF_RECORD_LOST => {
            // id
            reader.skip(8)?;
            CaptureEvent::Lost { count: reader.u64()? }
        }
        PERF_RECORD_SAMPLE => {
            let ip = reader.u64()?;
            let pid = Pid(reader.u32()?);
            let tid = Tid(reader.u32()?);
            let nr = usize::try_from(reader.u64()?).ok()?;

            ips.clear();
            if nr == 0 {
                synthesize_callchain(header.misc, ip, ips);
            } else {
                let raw = reader.bytes(nr.checked_mul(8)?)?;
                ips.extend(raw.chunks_exact(8).filter_map(|chunk| {
                    chunk.try_into().ok().map(u64::from_ne_bytes)
                }));
            }
            CaptureEvent::Sample { pid, tid, ips: ips.as_slice() }
        }
        other => {
            trace!("Skipping record type {other}");
            return None;
        }
    };

    Some(event)
}

/// Callchain for a sample whose kernel-provided chain was empty
fn synthesize_callchain(misc: u16, ip: u64, ips: &mut Vec<u64>) {
    if misc & PERF_RECORD_MISC_CPUMODE_MASK == PERF_RECORD_MISC_KERNEL {
        ips.extend([PERF_CONTEXT_KERNEL, ip, PERF_CONTEXT_USER]);
    } else {
        ips.extend([PERF_CONTEXT_USER, ip]);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use syshud_common::PERF_RECORD_MISC_USER;

    fn header(type_: u32, misc: u16, body: &[u8]) -> PerfEventHeader {
        PerfEventHeader { type_, misc, size: u16::try_from(body.len() + 8).unwrap() }
    }

    fn sample_body(ip: u64, pid: u32, tid: u32, chain: &[u64]) -> Vec<u8> {
        let mut body = Vec::new();
        body.extend_from_slice(&ip.to_ne_bytes());
        body.extend_from_slice(&pid.to_ne_bytes());
        body.extend_from_slice(&tid.to_ne_bytes());
        body.extend_from_slice(&(chain.len() as u64).to_ne_bytes());
        for ip in chain {
            body.extend_from_slice(&ip.to_ne_bytes());
        }
        body
    }

    #[test]
    fn test_decode_sample() {
        let chain = [PERF_CONTEXT_USER, 0x40_1000, 0x40_2000];
        let body = sample_body(0x40_1000, 42, 43, &chain);
        let mut ips = Vec::new();
        let sample = header(PERF_RECORD_SAMPLE, PERF_RECORD_MISC_USER, &body);
        let event = decode_record(&sample, &body, &mut ips);
        assert_eq!(event, Some(CaptureEvent::Sample { pid: Pid(42), tid: Tid(43), ips: &chain }));
    }

    #[test]
    fn test_empty_callchain_synthesized() {
        let body = sample_body(0xffff_ffff_8100_0000, 7, 7, &[]);
        let mut ips = Vec::new();
        let kernel = header(PERF_RECORD_SAMPLE, PERF_RECORD_MISC_KERNEL, &body);
        let Some(CaptureEvent::Sample { ips: chain, .. }) = decode_record(&kernel, &body, &mut ips)
        else {
            panic!("expected sample");
        };
        assert_eq!(chain, &[PERF_CONTEXT_KERNEL, 0xffff_ffff_8100_0000, PERF_CONTEXT_USER]);

        let body = sample_body(0x40_1000, 7, 7, &[]);
        let user = header(PERF_RECORD_SAMPLE, PERF_RECORD_MISC_USER, &body);
        let Some(CaptureEvent::Sample { ips: chain, .. }) = decode_record(&user, &body, &mut ips)
        else {
            panic!("expected sample");
        };
        assert_eq!(chain, &[PERF_CONTEXT_USER, 0x40_1000]);
    }

    #[test]
    fn test_truncated_sample() {
        let mut body = sample_body(0x40_1000, 1, 1, &[1, 2, 3]);
        body.truncate(body.len() - 4);
        let mut ips = Vec::new();
        assert_eq!(decode_record(&header(PERF_RECORD_SAMPLE, 0, &body), &body, &mut ips), None);
    }

    #[test]
    fn test_decode_mmap() {
        let mut body = Vec::new();
        body.extend_from_slice(&100u32.to_ne_bytes());
        body.extend_from_slice(&101u32.to_ne_bytes());
        body.extend_from_slice(&0x7f00_0000_0000u64.to_ne_bytes());
        body.extend_from_slice(&0x2000u64.to_ne_bytes());
        body.extend_from_slice(&0x1000u64.to_ne_bytes());
        body.extend_from_slice(b"/usr/lib/libc.so.6\0\0\0\0\0\0");

        let mut ips = Vec::new();
        let event = decode_record(&header(PERF_RECORD_MMAP, 0, &body), &body, &mut ips);
        assert_eq!(
            event,
            Some(CaptureEvent::Mmap {
                pid: Pid(100),
                tid: Tid(101),
                addr: 0x7f00_0000_0000,
                len: 0x2000,
                pgoff: 0x1000,
                inode: 0,
                filename: Cow::Borrowed("/usr/lib/libc.so.6"),
            })
        );
    }

    #[test]
    fn test_decode_mmap2_inode() {
        let mut body = Vec::new();
        body.extend_from_slice(&100u32.to_ne_bytes());
        body.extend_from_slice(&100u32.to_ne_bytes());
        body.extend_from_slice(&0x40_0000u64.to_ne_bytes());
        body.extend_from_slice(&0x1000u64.to_ne_bytes());
        body.extend_from_slice(&0u64.to_ne_bytes());
        body.extend_from_slice(&8u32.to_ne_bytes());
        body.extend_from_slice(&1u32.to_ne_bytes());
        body.extend_from_slice(&1_311_234u64.to_ne_bytes());
        body.extend_from_slice(&0u64.to_ne_bytes());
        body.extend_from_slice(&5u32.to_ne_bytes());
        body.extend_from_slice(&2u32.to_ne_bytes());
        body.extend_from_slice(b"/usr/bin/cat\0\0\0\0");

        let mut ips = Vec::new();
        let Some(CaptureEvent::Mmap { inode, filename, .. }) =
            decode_record(&header(PERF_RECORD_MMAP2, 0, &body), &body, &mut ips)
        else {
            panic!("expected mmap");
        };
        assert_eq!(inode, 1_311_234);
        assert_eq!(filename, "/usr/bin/cat");
    }

    #[test]
    fn test_decode_comm_fork_exit() {
        let mut body = Vec::new();
        body.extend_from_slice(&5u32.to_ne_bytes());
        body.extend_from_slice(&5u32.to_ne_bytes());
        body.extend_from_slice(b"bash\0\0\0\0");
        let mut ips = Vec::new();
        assert_eq!(
            decode_record(&header(PERF_RECORD_COMM, 0, &body), &body, &mut ips),
            Some(CaptureEvent::Comm { pid: Pid(5), tid: Tid(5), name: Cow::Borrowed("bash") })
        );

        let mut body = Vec::new();
        for value in [9u32, 5, 9, 5] {
            body.extend_from_slice(&value.to_ne_bytes());
        }
        body.extend_from_slice(&0u64.to_ne_bytes());
        assert_eq!(
            decode_record(&header(PERF_RECORD_FORK, 0, &body), &body, &mut ips),
            Some(CaptureEvent::Fork { ppid: Pid(5), pid: Pid(9) })
        );
        assert_eq!(
            decode_record(&header(PERF_RECORD_EXIT, 0, &body), &body, &mut ips),
            Some(CaptureEvent::Exit { pid: Pid(9) })
        );
    }

    #[test]
    fn test_unknown_type_skipped() {
        let body = [0u8; 16];
        let mut ips = Vec::new();
        assert_eq!(decode_record(&header(5, 0, &body), &body, &mut ips), None);
    }
}
