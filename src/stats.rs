//! Process-wide block access statistics.
//!
//! Reads and writes are histogrammed by transfer size into
//! `STAT_BUCKETS` log2 size classes (bucket 0 covers up to 512 bytes,
//! each further bucket doubles, the last absorbs the rest). The same
//! bucketing feeds the per-inode counters persisted on inode documents.
//! Counters are plain atomics so every filesystem thread can bump them
//! without coordination.

use std::sync::atomic::{AtomicU64, Ordering};

use array_macro::array;

use crate::param::STAT_BUCKETS;

/// The size-class bucket for a transfer of `len` bytes.
pub fn size_bucket(len: usize) -> usize {
    let units = (len.max(1) + 511) / 512;
    let log = 63 - (units as u64).leading_zeros() as usize;
    log.min(STAT_BUCKETS - 1)
}

#[derive(Debug)]
pub struct BlockStats {
    reads: [AtomicU64; STAT_BUCKETS],
    writes: [AtomicU64; STAT_BUCKETS],
}

impl BlockStats {
    pub fn new() -> Self {
        BlockStats {
            reads: array![_ => AtomicU64::new(0); STAT_BUCKETS],
            writes: array![_ => AtomicU64::new(0); STAT_BUCKETS],
        }
    }

    /// Accounts one block access of `len` bytes.
    pub fn add(&self, len: usize, write: bool) {
        let bucket = size_bucket(len);
        let hist = if write { &self.writes } else { &self.reads };
        hist[bucket].fetch_add(1, Ordering::Relaxed);
    }

    /// Snapshot of the read histogram.
    pub fn reads(&self) -> [u64; STAT_BUCKETS] {
        array![i => self.reads[i].load(Ordering::Relaxed); STAT_BUCKETS]
    }

    /// Snapshot of the write histogram.
    pub fn writes(&self) -> [u64; STAT_BUCKETS] {
        array![i => self.writes[i].load(Ordering::Relaxed); STAT_BUCKETS]
    }
}

impl Default for BlockStats {
    fn default() -> Self {
        Self::new()
    }
}
