// SPDX-License-Identifier: Apache-2.0
// Copyright 2025 Ankit Kumar Pandey

//! Memory layout of the request/response ring inside the shared region.
//!
//! ```text
//! offset 0                 RingHeader   (magic, locks, conditions, counters)
//! requests_offset()        RequestSlot  x capacity
//! responses_offset()       ResponseSlot x capacity
//! ```
//!
//! Every field is either an atomic or a process-shared pthread object, so
//! references into the mapping are sound while other processes write to it.
//! Counters use `Relaxed` atomics: ordering comes from the pthread locks and
//! the flush/invalidate barrier, not from the atomics.

use std::mem::{align_of, size_of};
use std::sync::atomic::{AtomicI32, AtomicU32, AtomicU64, Ordering};

use super::sync::{SharedCondvar, SharedMutex};
use crate::error::HardValidationError;
use crate::types::Capacity;

/// "POWQUEUE" little-endian. Written last during initialisation.
pub const RING_MAGIC: u64 = u64::from_le_bytes(*b"POWQUEUE");

/// Bumped on any change to the structs below.
pub const LAYOUT_VERSION: u32 = 1;

/// Response status codes.
pub const STATUS_OK: u32 = 0;
pub const STATUS_REJECTED: u32 = 1;

#[repr(C)]
pub struct RingHeader {
    pub magic: AtomicU64,
    pub version: AtomicU32,
    pub capacity: AtomicU32,

    // Request half, guarded by `request_lock`.
    pub request_lock: SharedMutex,
    pub nonempty: SharedCondvar,
    pub space_available: SharedCondvar,
    pub request_writes: AtomicU64,
    pub request_reads: AtomicU64,
    pub shutdown: AtomicU32,
    /// Pid of the process running the consumer loop, 0 if none claimed it.
    pub server_pid: AtomicI32,

    // Response half, guarded by `response_lock`.
    pub response_lock: SharedMutex,
    pub response_writes: AtomicU64,
    pub response_reads: AtomicU64,
}

/// Request payload plus the per-slot completion condition.
///
/// Fields other than `completion` are guarded by `request_lock`;
/// `completion` is waited on and signalled under `response_lock`.
#[repr(C)]
pub struct RequestSlot {
    pub sequence: AtomicU64,
    pub exponent: AtomicU64,
    pub modulus: AtomicU64,
    pub checksum: AtomicU32,
    /// Non-zero from submission until the response is retired.
    pub occupied: AtomicU32,
    pub completion: SharedCondvar,
}

/// A copy of a request taken out of the ring.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RequestRecord {
    pub sequence: u64,
    pub exponent: u64,
    pub modulus: u64,
    pub checksum: u32,
}

impl RequestRecord {
    pub fn new(sequence: u64, exponent: u64, modulus: u64) -> Self {
        Self {
            sequence,
            exponent,
            modulus,
            checksum: Self::checksum_of(sequence, exponent, modulus),
        }
    }

    /// CRC32 over the little-endian `(sequence, exponent, modulus)`.
    pub fn checksum_of(sequence: u64, exponent: u64, modulus: u64) -> u32 {
        let mut hasher = crc32fast::Hasher::new();
        hasher.update(&sequence.to_le_bytes());
        hasher.update(&exponent.to_le_bytes());
        hasher.update(&modulus.to_le_bytes());
        hasher.finalize()
    }

    pub fn is_intact(&self) -> bool {
        self.checksum == Self::checksum_of(self.sequence, self.exponent, self.modulus)
    }
}

impl RequestSlot {
    /// Caller holds `request_lock`.
    pub fn store(&self, record: &RequestRecord) {
        self.sequence.store(record.sequence, Ordering::Relaxed);
        self.exponent.store(record.exponent, Ordering::Relaxed);
        self.modulus.store(record.modulus, Ordering::Relaxed);
        self.checksum.store(record.checksum, Ordering::Relaxed);
        self.occupied.store(1, Ordering::Relaxed);
    }

    /// Caller holds `request_lock`.
    pub fn load(&self) -> RequestRecord {
        RequestRecord {
            sequence: self.sequence.load(Ordering::Relaxed),
            exponent: self.exponent.load(Ordering::Relaxed),
            modulus: self.modulus.load(Ordering::Relaxed),
            checksum: self.checksum.load(Ordering::Relaxed),
        }
    }

    pub fn is_occupied(&self) -> bool {
        self.occupied.load(Ordering::Relaxed) != 0
    }
}

/// Guarded by `response_lock`.
#[repr(C)]
pub struct ResponseSlot {
    pub sequence: AtomicU64,
    pub result: AtomicU64,
    /// `sequence + 1` of a waiter that gave up, 0 otherwise.
    pub abandoned: AtomicU64,
    pub status: AtomicU32,
}

/// Offsets and total size for a given capacity.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RingLayout {
    capacity: usize,
}

const fn align_up(value: usize, alignment: usize) -> usize {
    (value + alignment - 1) & !(alignment - 1)
}

impl RingLayout {
    pub fn new(capacity: Capacity) -> Self {
        Self {
            capacity: capacity.get(),
        }
    }

    /// Rebuild from a capacity read out of an existing header.
    pub fn from_raw(capacity: u32) -> Result<Self, HardValidationError> {
        Ok(Self::new(Capacity::new(capacity as usize)?))
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub const fn header_size() -> usize {
        size_of::<RingHeader>()
    }

    pub fn requests_offset(&self) -> usize {
        align_up(Self::header_size(), align_of::<RequestSlot>())
    }

    pub fn responses_offset(&self) -> usize {
        align_up(
            self.requests_offset() + self.capacity * size_of::<RequestSlot>(),
            align_of::<ResponseSlot>(),
        )
    }

    /// Exact byte size of the shared object.
    pub fn total_size(&self) -> usize {
        self.responses_offset() + self.capacity * size_of::<ResponseSlot>()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_align_up() {
        assert_eq!(align_up(1, 8), 8);
        assert_eq!(align_up(8, 8), 8);
        assert_eq!(align_up(9, 8), 16);
        assert_eq!(align_up(0, 8), 0);
    }

    #[test]
    fn test_layout_regions_do_not_overlap() {
        for slots in [1, 4, 16, Capacity::MAX] {
            let layout = RingLayout::new(Capacity::new(slots).unwrap());
            assert!(layout.requests_offset() >= RingLayout::header_size());
            assert_eq!(layout.requests_offset() % align_of::<RequestSlot>(), 0);
            assert!(
                layout.responses_offset()
                    >= layout.requests_offset() + slots * size_of::<RequestSlot>()
            );
            assert_eq!(layout.responses_offset() % align_of::<ResponseSlot>(), 0);
            assert_eq!(
                layout.total_size(),
                layout.responses_offset() + slots * size_of::<ResponseSlot>()
            );
        }
    }

    #[test]
    fn test_from_raw_rejects_zero() {
        assert!(RingLayout::from_raw(0).is_err());
        assert_eq!(RingLayout::from_raw(4).unwrap().capacity(), 4);
    }

    #[test]
    fn test_record_checksum_detects_tearing() {
        let record = RequestRecord::new(7, 10, 1000);
        assert!(record.is_intact());
        let torn = RequestRecord {
            modulus: 999,
            ..record
        };
        assert!(!torn.is_intact());
    }
}
