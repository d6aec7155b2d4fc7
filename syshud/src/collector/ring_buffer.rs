//! Consumer side of the perf ring buffer protocol.
//!
//! The kernel writes records into a circular data area and advances
//! `data_head`. We read `head` (acquire), walk records from our `tail` up to
//! it, then publish the new `tail` (release) so the kernel can reuse the
//! space. The memory itself sits behind [`RingMemory`] so the protocol can
//! run against an ordinary heap buffer in tests.

use log::warn;
use syshud_common::{PerfEventHeader, PERF_EVENT_HEADER_SIZE};

/// Shared memory backing one ring buffer
pub trait RingMemory {
    /// The data area; its length is a power of two
    fn data(&self) -> &[u8];

    /// Producer position, read with acquire ordering
    fn read_head(&self) -> u64;

    /// Publish the consumer position with release ordering
    fn write_tail(&mut self, tail: u64);
}

pub struct RingReader<M> {
    memory: M,
    tail: u64,
    /// Holds records that wrap around the end of the data area
    scratch: Vec<u8>,
    overrun_warned: bool,
}

impl<M: RingMemory> RingReader<M> {
    pub fn new(memory: M) -> Self {
        Self { memory, tail: 0, scratch: Vec::new(), overrun_warned: false }
    }

    pub fn memory(&self) -> &M {
        &self.memory
    }

    pub fn tail(&self) -> u64 {
        self.tail
    }

    /// Hand every complete record between `tail` and `head` to `f`, then
    /// release the consumed space. Returns the number of records delivered.
    ///
    /// `f` receives the header and the record body (bytes after the header).
    /// A record the kernel has only partly written stays in the buffer for
    /// the next call.
    pub fn read_records<F>(&mut self, mut f: F) -> usize
    where
        F: FnMut(&PerfEventHeader, &[u8]),
    {
        let head = self.memory.read_head();
        let mut tail = self.tail;

        if head < tail {
            if !self.overrun_warned {
                warn!("Ring buffer head {head} behind tail {tail}, samples lost");
                self.overrun_warned = true;
            }
            tail = head;
        }

        let data = self.memory.data();
        let size = data.len() as u64;
        let header_size = PERF_EVENT_HEADER_SIZE as u64;
        let mut delivered = 0;

        while head - tail >= header_size {
            let offset = offset_in(tail, size);

            let mut raw = [0u8; PERF_EVENT_HEADER_SIZE];
            copy_wrapping(data, offset, &mut raw);
            let header = PerfEventHeader::from_bytes(&raw);
            let record_size = u64::from(header.size);

            if record_size < header_size {
                warn!("Corrupt ring buffer record of size {record_size}, skipping to head");
                tail = head;
                break;
            }
            if record_size > head - tail {
                break;
            }

            // record_size fits in u16
            let len = record_size as usize;
            let record: &[u8] = if offset + len <= data.len() {
                &data[offset..offset + len]
            } else {
                self.scratch.resize(len, 0);
                copy_wrapping(data, offset, &mut self.scratch);
                &self.scratch
            };

            f(&header, &record[PERF_EVENT_HEADER_SIZE..]);
            delivered += 1;
            tail += record_size;
        }

        self.tail = tail;
        self.memory.write_tail(tail);
        delivered
    }
}

#[allow(clippy::cast_possible_truncation)]
fn offset_in(position: u64, size: u64) -> usize {
    (position & (size - 1)) as usize
}

/// Fill `dst` from `data` starting at `offset`, wrapping at the end
fn copy_wrapping(data: &[u8], offset: usize, dst: &mut [u8]) {
    let first = (data.len() - offset).min(dst.len());
    dst[..first].copy_from_slice(&data[offset..offset + first]);
    let rest = dst.len() - first;
    dst[first..].copy_from_slice(&data[..rest]);
}
