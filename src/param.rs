use static_assertions::const_assert;

/// Content hash width in bytes (BLAKE2b-160).
pub const HASH_LEN: usize = 20;

/// Block hashes per block map.
pub const BLOCKS_PER_MAP: usize = 1024;

/// Default block size for newly created inodes.
pub const DEFAULT_BLOCKSIZE: u32 = 4096;

/// Advisory inode lock lease lifetime in milliseconds. A lock record
/// older than this is stale and may be reclaimed on contention.
pub const LOCK_TTL_MS: i64 = 30_000;

/// Delay between advisory lock acquisition retries in milliseconds.
pub const LOCK_RETRY_MS: u64 = 50;

/// Reserved directory entry name holding a directory's snapshots.
pub const SNAPSHOT_NAME: &str = ".snapshot";

/// Size-class buckets in the per-inode and process-wide I/O histograms.
pub const STAT_BUCKETS: usize = 8;

const_assert!(BLOCKS_PER_MAP.is_power_of_two());
const_assert!(DEFAULT_BLOCKSIZE.is_power_of_two());
const_assert!(BLOCKS_PER_MAP <= u16::MAX as usize);
