//! # Fragmentation
//!
//! Outbound: a packet larger than one datagram's payload budget is cut into
//! `ceil(len / fragment_length)` slices, all sharing one start sequence
//! number. Inbound: [`Reassembly`] collects slices into a preallocated
//! buffer, tracking arrivals in a bitmap so duplicates are ignored.

use bytes::{Bytes, BytesMut};

use crate::wire::{self, SendFragment, MAXIMUM_FRAGMENT_COUNT};

/// Largest fragment payload that fits a datagram for the given MTU.
///
/// Reserves the full protocol header, one fragment command header, the
/// checksum when one is installed, and any encryptor overhead.
pub fn fragment_length(mtu: u32, checksum: bool, encryption_overhead: usize) -> usize {
    let mut reserved = wire::MAX_HEADER_SIZE + wire::CommandType::SendFragment.size();
    if checksum {
        reserved += wire::CHECKSUM_SIZE;
    }
    reserved += encryption_overhead;
    (mtu as usize).saturating_sub(reserved).max(1)
}

/// One slice of an outgoing fragmented packet.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Slice {
    pub number: u32,
    pub offset: u32,
    pub length: u16,
}

/// Plan the slices of a `total`-byte packet.
///
/// Returns `None` if more than [`MAXIMUM_FRAGMENT_COUNT`] slices are needed.
pub fn split(total: usize, fragment_length: usize) -> Option<Vec<Slice>> {
    let fragment_length = fragment_length.clamp(1, u16::MAX as usize);
    let count = total.div_ceil(fragment_length);
    if count > MAXIMUM_FRAGMENT_COUNT as usize {
        return None;
    }
    let slices = (0..count)
        .map(|number| {
            let offset = number * fragment_length;
            Slice {
                number: number as u32,
                offset: offset as u32,
                length: (total - offset).min(fragment_length) as u16,
            }
        })
        .collect();
    Some(slices)
}

/// Structural validation of an incoming fragment command.
pub fn validate(fragment: &SendFragment, payload_len: usize, maximum_packet_size: usize) -> bool {
    let count = fragment.fragment_count;
    let total = fragment.total_length;
    count <= MAXIMUM_FRAGMENT_COUNT
        && fragment.fragment_number < count
        && (total as usize) <= maximum_packet_size
        && total >= count
        && fragment.fragment_offset < total
        && payload_len as u64 <= (total - fragment.fragment_offset) as u64
}

// ─── Reassembly ─────────────────────────────────────────────────────────────

/// In-progress reassembly of one fragmented packet.
#[derive(Debug)]
pub struct Reassembly {
    buffer: BytesMut,
    bitmap: Vec<u32>,
    fragment_count: u32,
    remaining: u32,
}

impl Reassembly {
    pub fn new(total_length: u32, fragment_count: u32) -> Self {
        Reassembly {
            buffer: BytesMut::zeroed(total_length as usize),
            bitmap: vec![0; fragment_count.div_ceil(32) as usize],
            fragment_count,
            remaining: fragment_count,
        }
    }

    #[inline]
    pub fn total_length(&self) -> usize {
        self.buffer.len()
    }

    #[inline]
    pub fn fragment_count(&self) -> u32 {
        self.fragment_count
    }

    #[inline]
    pub fn remaining(&self) -> u32 {
        self.remaining
    }

    #[inline]
    pub fn is_complete(&self) -> bool {
        self.remaining == 0
    }

    /// Store fragment `number`. Returns `false` for duplicates and
    /// out-of-range numbers. Data past the declared total is clipped.
    pub fn insert(&mut self, number: u32, offset: u32, data: &[u8]) -> bool {
        if number >= self.fragment_count {
            return false;
        }
        let word = (number / 32) as usize;
        let bit = 1u32 << (number % 32);
        if self.bitmap[word] & bit != 0 {
            return false;
        }
        self.bitmap[word] |= bit;
        self.remaining -= 1;

        let start = offset as usize;
        if start < self.buffer.len() {
            let end = (start + data.len()).min(self.buffer.len());
            self.buffer[start..end].copy_from_slice(&data[..end - start]);
        }
        true
    }

    /// Take the assembled buffer, leaving this reassembly empty.
    pub fn take(&mut self) -> Bytes {
        std::mem::take(&mut self.buffer).freeze()
    }
}
