//! Filesystem implementation. Five layers:
//!   + Blocks: content-addressed, refcounted block storage.
//!   + Extents: persisted runs of block descriptors per inode.
//!   + Inodes: metadata records, path links, advisory locks.
//!   + Directories: dirent-index scans, mkdir/rmdir/rename, snapshots.
//!   + Names: absolute slash-separated paths, `.snapshot` reserved.
//!
//! This module owns [`DocFs`], the operation surface: the standard
//! user-space filesystem calls plus snapshot creation, each returning
//! `Result<_, FsError>`. Callers that speak the UNIX convention convert
//! failures with [`FsError::errno`] to a negated errno.
//!
//! A `DocFs` is a cheap handle: the document store and block store sit
//! behind `Arc`s, so each serving thread clones the handle and calls
//! into it in parallel. Nothing here suspends cooperatively; blocking
//! happens inside the store drivers. Within one thread, writes to an
//! inode stay causally ordered by the extent sequence numbers; across
//! threads, callers wanting exclusion take the advisory inode lock.

use std::sync::Arc;
use std::time::Duration;

use crate::block::{BlockStore, MemBlockStore};
use crate::db::{MemStore, Store};
use crate::error::{FsError, Result};
use crate::param::{DEFAULT_BLOCKSIZE, LOCK_RETRY_MS, LOCK_TTL_MS};
use crate::stats::BlockStats;

pub mod dirent;
pub mod dirops;
pub mod extent;
pub mod inode;
pub mod path;
pub mod readwrite;
pub mod snapshot;
pub mod stat;

pub use dirops::DirEntry;
pub use inode::AccessMode;
pub use path::Path;
pub use stat::FileStat;

/// Tunables and the acting identity of this mount.
#[derive(Debug, Clone)]
pub struct FsConfig {
    /// Block size for newly created inodes; must be a power of two.
    pub blocksize: u32,
    /// Device id stamped on new inodes.
    pub dev: i64,
    /// Owner and group for new inodes, and the identity permission
    /// checks run against.
    pub owner: i64,
    pub group: i64,
    /// Advisory lock lease lifetime.
    pub lock_ttl_ms: i64,
    /// Advisory lock retry interval.
    pub lock_retry_ms: u64,
}

impl Default for FsConfig {
    fn default() -> Self {
        FsConfig {
            blocksize: DEFAULT_BLOCKSIZE,
            dev: 0,
            // SAFETY: getuid/getgid have no preconditions.
            owner: unsafe { libc::getuid() } as i64,
            group: unsafe { libc::getgid() } as i64,
            lock_ttl_ms: LOCK_TTL_MS,
            lock_retry_ms: LOCK_RETRY_MS,
        }
    }
}

/// The filesystem handle.
#[derive(Clone)]
pub struct DocFs {
    store: Arc<dyn Store>,
    blocks: Arc<dyn BlockStore>,
    cfg: FsConfig,
    stats: Arc<BlockStats>,
}

impl DocFs {
    /// Opens the filesystem over the given stores, creating the root
    /// directory and its `.snapshot` child on first use.
    pub fn new(store: Arc<dyn Store>, blocks: Arc<dyn BlockStore>, cfg: FsConfig) -> Result<Self> {
        let fs = DocFs {
            store,
            blocks,
            cfg,
            stats: Arc::new(BlockStats::new()),
        };
        let mode = libc::S_IFDIR as u32 | 0o755;
        for bootstrap in ["/", "/.snapshot"] {
            let p = Path::new(bootstrap)?;
            if !inode::exists(fs.store(), p)? {
                inode::create(fs.store(), p, mode, &fs.cfg, None)?;
            }
        }
        Ok(fs)
    }

    /// A filesystem over fresh in-process stores.
    pub fn in_memory(cfg: FsConfig) -> Result<Self> {
        Self::new(
            Arc::new(MemStore::new()),
            Arc::new(MemBlockStore::new()),
            cfg,
        )
    }

    pub fn store(&self) -> &dyn Store {
        &*self.store
    }

    pub fn blocks(&self) -> &dyn BlockStore {
        &*self.blocks
    }

    pub fn config(&self) -> &FsConfig {
        &self.cfg
    }

    /// Process-wide block access histograms.
    pub fn stats(&self) -> &BlockStats {
        &self.stats
    }

    fn uid(&self) -> u32 {
        self.cfg.owner as u32
    }

    fn gid(&self) -> u32 {
        self.cfg.group as u32
    }

    /// Refuses mutation of anything at or below a `.snapshot` anchor.
    fn check_mutable(path: &Path) -> Result<()> {
        if path.in_snapshot() {
            return Err(FsError::AccessDenied);
        }
        Ok(())
    }

    // Metadata operations.

    pub fn getattr(&self, path: &str) -> Result<FileStat> {
        dirops::getattr(self.store(), Path::new(path)?)
    }

    pub fn chmod(&self, path: &str, mode: u32) -> Result<()> {
        let p = Path::new(path)?;
        Self::check_mutable(p)?;
        let mut ip = inode::get(self.store(), p)?;
        if self.uid() != 0 && ip.owner != self.cfg.owner {
            return Err(FsError::AccessDenied);
        }
        let perm = !(libc::S_IFMT as u32);
        ip.mode = (ip.mode & libc::S_IFMT as u32) | (mode & perm);
        ip.modified = inode::now_ms();
        inode::commit(self.store(), &ip)
    }

    pub fn chown(&self, path: &str, owner: i64, group: i64) -> Result<()> {
        let p = Path::new(path)?;
        Self::check_mutable(p)?;
        if self.uid() != 0 {
            return Err(FsError::AccessDenied);
        }
        let mut ip = inode::get(self.store(), p)?;
        ip.owner = owner;
        ip.group = group;
        ip.modified = inode::now_ms();
        inode::commit(self.store(), &ip)
    }

    // Directory operations.

    pub fn mkdir(&self, path: &str, mode: u32) -> Result<()> {
        dirops::mkdir(self.store(), &self.cfg, Path::new(path)?, mode)
    }

    pub fn readdir(&self, path: &str) -> Result<Vec<DirEntry>> {
        dirops::readdir(self.store(), Path::new(path)?)
    }

    pub fn rmdir(&self, path: &str) -> Result<()> {
        dirops::rmdir(self.store(), Path::new(path)?)
    }

    pub fn rename(&self, old: &str, new: &str) -> Result<()> {
        dirops::rename(self.store(), Path::new(old)?, Path::new(new)?)
    }

    // File lifecycle.

    /// Creates a regular file, optionally with inline content.
    pub fn create(&self, path: &str, mode: u32, data: Option<Vec<u8>>) -> Result<()> {
        let p = Path::new(path)?;
        Self::check_mutable(p)?;
        if mode & libc::S_IFDIR as u32 != 0 {
            return Err(FsError::IsDir);
        }
        let parent = inode::get(self.store(), p.parent())?;
        if !parent.is_dir() {
            return Err(FsError::NotDir);
        }
        let mode = if mode & libc::S_IFMT as u32 == 0 {
            mode | libc::S_IFREG as u32
        } else {
            mode
        };
        inode::create(self.store(), p, mode, &self.cfg, data)?;
        Ok(())
    }

    /// Checks that the caller may access `path` with `access`. Opening
    /// a directory for writing fails with `IsDir`.
    pub fn open(&self, path: &str, access: AccessMode) -> Result<()> {
        let p = Path::new(path)?;
        let ip = inode::get(self.store(), p)?;
        if ip.is_dir() && access.contains(AccessMode::WRITE) {
            return Err(FsError::IsDir);
        }
        if access.contains(AccessMode::WRITE) {
            Self::check_mutable(p)?;
        }
        inode::check_access(&ip, access, self.uid(), self.gid())
    }

    pub fn unlink(&self, path: &str) -> Result<()> {
        let p = Path::new(path)?;
        Self::check_mutable(p)?;
        let mut ip = inode::get(self.store(), p)?;
        if ip.is_dir() {
            return Err(FsError::IsDir);
        }
        if ip.dirents.len() > 1 {
            // Other links keep the inode and its blocks alive.
            ip.dirents.remove(0);
            return inode::commit(self.store(), &ip);
        }
        readwrite::release_content(self.store(), self.blocks(), &ip)?;
        self.store.remove_inode(&ip.id)?;
        Ok(())
    }

    // Data path.

    pub fn read(&self, path: &str, buf: &mut [u8], offset: u64) -> Result<usize> {
        let p = Path::new(path)?;
        let mut ip = inode::get(self.store(), p)?;
        let n = readwrite::read(self.store(), self.blocks(), &mut ip, buf, offset)?;
        self.stats.add(n, false);
        Ok(n)
    }

    pub fn write(&self, path: &str, buf: &[u8], offset: u64) -> Result<usize> {
        let p = Path::new(path)?;
        Self::check_mutable(p)?;
        let mut ip = inode::get(self.store(), p)?;
        let n = readwrite::write(self.store(), self.blocks(), &mut ip, buf, offset)?;
        self.stats.add(n, true);
        Ok(n)
    }

    pub fn truncate(&self, path: &str, size: u64) -> Result<()> {
        let p = Path::new(path)?;
        Self::check_mutable(p)?;
        let mut ip = inode::get(self.store(), p)?;
        readwrite::truncate(self.store(), self.blocks(), &mut ip, size)
    }

    // Snapshots.

    /// Freezes the directory containing `path` into a new generation
    /// and returns its number.
    pub fn snapshot_dir(&self, path: &str, mode: u32) -> Result<u32> {
        snapshot::snapshot_dir(self.store(), self.blocks(), &self.cfg, Path::new(path)?, mode)
    }

    // Advisory locking.

    pub fn lock_inode(
        &self,
        path: &str,
        writer: bool,
        timeout: Duration,
        non_blocking: bool,
    ) -> Result<()> {
        inode::lock(
            self.store(),
            Path::new(path)?,
            writer,
            timeout,
            non_blocking,
            &self.cfg,
        )
    }

    pub fn unlock_inode(&self, path: &str, writer: bool) -> Result<()> {
        inode::unlock(self.store(), Path::new(path)?, writer)
    }

    /// Runs `f` while holding the advisory lock on `path`, releasing it
    /// on every exit path.
    pub fn with_inode_locked<R>(
        &self,
        path: &str,
        writer: bool,
        timeout: Duration,
        f: impl FnOnce(&Self) -> Result<R>,
    ) -> Result<R> {
        self.lock_inode(path, writer, timeout, false)?;
        let unlock = scopeguard::guard(self.clone(), |fs| {
            if let Err(e) = fs.unlock_inode(path, writer) {
                log::warn!("unlock of {} failed: {}", path, e);
            }
        });
        let out = f(self);
        drop(unlock);
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn fs() -> DocFs {
        let _ = env_logger::builder().is_test(true).try_init();
        DocFs::in_memory(FsConfig::default()).unwrap()
    }

    /// The extents of the inode at `path` must tile `[0, ceil(size))`
    /// with no gap or overlap, and each document's length must equal
    /// the sum of its block lengths.
    fn assert_tiled(fs: &DocFs, path: &str) {
        let ip = inode::get(fs.store(), Path::new(path).unwrap()).unwrap();
        let docs = fs.store().find_extents(&ip.id, u64::MAX, 0).unwrap();
        let mut at = 0;
        for doc in &docs {
            assert_eq!(doc.start, at, "gap or overlap at {}", at);
            let total: u64 = doc.blocks.iter().map(|b| b.len as u64).sum();
            assert_eq!(doc.end - doc.start, total);
            at = doc.end;
        }
        let bs = ip.blocksize as u64;
        let ceiling = (ip.size + bs - 1) & !(bs - 1);
        assert_eq!(at, ceiling);
    }

    #[test]
    fn basic_read_write() {
        let fs = fs();
        fs.mkdir("/d", 0o755).unwrap();
        fs.create("/d/f", 0o644, None).unwrap();
        assert_eq!(fs.write("/d/f", b"hello", 0).unwrap(), 5);

        let mut buf = [0u8; 5];
        assert_eq!(fs.read("/d/f", &mut buf, 0).unwrap(), 5);
        assert_eq!(&buf, b"hello");
        assert_eq!(fs.getattr("/d/f").unwrap().size, 5);
        assert_tiled(&fs, "/d/f");
    }

    #[test]
    fn sparse_file_reads_zeros_before_content() {
        let fs = fs();
        fs.create("/f", 0o644, None).unwrap();
        fs.write("/f", b"x", 8192).unwrap();

        assert_eq!(fs.getattr("/f").unwrap().size, 8193);
        let mut buf = vec![0xffu8; 8193];
        assert_eq!(fs.read("/f", &mut buf, 0).unwrap(), 8193);
        assert!(buf[..8192].iter().all(|&b| b == 0));
        assert_eq!(buf[8192], b'x');
        assert_tiled(&fs, "/f");
    }

    #[test]
    fn overlapping_writes_compact() {
        let fs = fs();
        fs.create("/f", 0o644, None).unwrap();
        fs.write("/f", &[b'A'; 4096], 0).unwrap();
        fs.write("/f", &[b'B'; 2048], 1024).unwrap();

        let mut buf = vec![0u8; 4096];
        fs.read("/f", &mut buf, 0).unwrap();
        assert!(buf[..1024].iter().all(|&b| b == b'A'));
        assert!(buf[1024..3072].iter().all(|&b| b == b'B'));
        assert!(buf[3072..].iter().all(|&b| b == b'A'));

        // The rewrite covered the whole block, so one extent remains.
        let ip = inode::get(fs.store(), Path::new("/f").unwrap()).unwrap();
        let docs = fs.store().find_extents(&ip.id, u64::MAX, 0).unwrap();
        assert!(docs.len() <= 2);
        assert_tiled(&fs, "/f");
    }

    #[test]
    fn rmdir_refused_until_empty_then_orphans() {
        let fs = fs();
        fs.mkdir("/d", 0o755).unwrap();
        fs.create("/d/f", 0o644, None).unwrap();
        fs.write("/d/f", b".", 0).unwrap();

        assert_eq!(fs.rmdir("/d").unwrap_err().errno(), -libc::ENOTEMPTY);

        fs.unlink("/d/f").unwrap();
        fs.rmdir("/d").unwrap();
        assert_eq!(fs.getattr("/d").unwrap_err().errno(), -libc::ENOENT);
        assert!(fs.getattr("/.snapshot/orphaned-d").unwrap().is_dir());
    }

    #[test]
    fn snapshot_isolation() {
        let fs = fs();
        fs.create("/f", 0o644, None).unwrap();
        fs.write("/f", b"v1", 0).unwrap();
        assert_eq!(fs.snapshot_dir("/", 0o755).unwrap(), 1);
        fs.write("/f", b"v2", 0).unwrap();

        let mut buf = [0u8; 2];
        fs.read("/f", &mut buf, 0).unwrap();
        assert_eq!(&buf, b"v2");
        fs.read("/.snapshot/1/f", &mut buf, 0).unwrap();
        assert_eq!(&buf, b"v1");
    }

    #[test]
    fn snapshots_are_immutable() {
        let fs = fs();
        fs.create("/f", 0o644, None).unwrap();
        fs.write("/f", b"v1", 0).unwrap();
        fs.snapshot_dir("/", 0o755).unwrap();

        let frozen = "/.snapshot/1/f";
        assert_eq!(fs.write(frozen, b"nope", 0).unwrap_err().errno(), -libc::EACCES);
        assert_eq!(fs.truncate(frozen, 0).unwrap_err().errno(), -libc::EACCES);
        assert_eq!(fs.unlink(frozen).unwrap_err().errno(), -libc::EACCES);
        assert_eq!(
            fs.rename(frozen, "/escape").unwrap_err().errno(),
            -libc::EACCES
        );
        assert_eq!(fs.chmod(frozen, 0o777).unwrap_err().errno(), -libc::EACCES);
    }

    #[test]
    fn rename_atomicity() {
        let fs = fs();
        fs.create("/a", 0o644, None).unwrap();
        fs.write("/a", b"x", 0).unwrap();
        fs.rename("/a", "/b").unwrap();

        let mut buf = [0u8; 1];
        fs.read("/b", &mut buf, 0).unwrap();
        assert_eq!(&buf, b"x");
        assert_eq!(fs.getattr("/a").unwrap_err().errno(), -libc::ENOENT);
    }

    #[test]
    fn readdir_fabricates_stats() {
        let fs = fs();
        fs.mkdir("/d", 0o755).unwrap();
        fs.create("/f", 0o644, None).unwrap();

        let mut entries = fs.readdir("/").unwrap();
        entries[2..].sort_by(|a, b| a.name.cmp(&b.name));
        let names: Vec<_> = entries.iter().map(|e| e.name.as_str()).collect();
        assert_eq!(names, vec![".", "..", "d", "f"]);
        assert_eq!(entries[2].stat.unwrap().nlink, 2);
        assert_eq!(entries[3].stat.unwrap().nlink, 1);
    }

    #[test]
    fn open_checks_access_and_type() {
        let fs = fs();
        fs.mkdir("/d", 0o755).unwrap();
        fs.create("/ro", 0o444, None).unwrap();

        fs.open("/d", AccessMode::READ).unwrap();
        assert_eq!(
            fs.open("/d", AccessMode::WRITE).unwrap_err().errno(),
            -libc::EISDIR
        );
        fs.open("/ro", AccessMode::READ).unwrap();
        assert_eq!(
            fs.open("/ro", AccessMode::WRITE).unwrap_err().errno(),
            -libc::EACCES
        );
    }

    #[test]
    fn chmod_and_chown_update_metadata() {
        let fs = fs();
        fs.create("/f", 0o644, None).unwrap();
        fs.chmod("/f", 0o600).unwrap();
        let stat = fs.getattr("/f").unwrap();
        assert_eq!(stat.mode & 0o777, 0o600);
        assert!(!stat.is_dir());

        // Not root: chown refused.
        if fs.config().owner != 0 {
            assert_eq!(fs.chown("/f", 0, 0).unwrap_err().errno(), -libc::EACCES);
        }
    }

    #[test]
    fn unlink_keeps_other_links_alive() {
        let fs = fs();
        fs.create("/a", 0o644, None).unwrap();
        fs.write("/a", b"shared", 0).unwrap();

        // A second link, made at the document level.
        let mut ip = inode::get(fs.store(), Path::new("/a").unwrap()).unwrap();
        ip.dirents.push("/b".to_string());
        inode::commit(fs.store(), &ip).unwrap();

        fs.unlink("/a").unwrap();
        let mut buf = [0u8; 6];
        fs.read("/b", &mut buf, 0).unwrap();
        assert_eq!(&buf, b"shared");

        fs.unlink("/b").unwrap();
        assert_eq!(fs.getattr("/b").unwrap_err().errno(), -libc::ENOENT);
    }

    #[test]
    fn deep_trees_snapshot_and_orphan() {
        let fs = fs();
        fs.mkdir("/a", 0o755).unwrap();
        fs.mkdir("/a/b", 0o755).unwrap();
        fs.create("/a/b/f", 0o644, None).unwrap();
        fs.write("/a/b/f", b"deep", 0).unwrap();

        // Snapshot inside the nested directory.
        fs.snapshot_dir("/a/b/f", 0o755).unwrap();
        let mut buf = [0u8; 4];
        fs.read("/a/b/.snapshot/1/f", &mut buf, 0).unwrap();
        assert_eq!(&buf, b"deep");

        // Removing /a/b parks its history under /a/.snapshot.
        fs.unlink("/a/b/f").unwrap();
        fs.rmdir("/a/b").unwrap();
        fs.read("/a/.snapshot/orphaned-b/1/f", &mut buf, 0).unwrap();
        assert_eq!(&buf, b"deep");
    }

    #[test]
    fn advisory_lock_round_trip() {
        let fs = fs();
        fs.create("/f", 0o644, None).unwrap();

        let out = fs
            .with_inode_locked("/f", true, Duration::from_millis(10), |fs| {
                assert!(fs
                    .lock_inode("/f", true, Duration::from_millis(0), true)
                    .is_err());
                fs.write("/f", b"locked", 0)
            })
            .unwrap();
        assert_eq!(out, 6);

        // Released on exit.
        fs.lock_inode("/f", true, Duration::from_millis(0), true).unwrap();
        fs.unlock_inode("/f", true).unwrap();
    }

    #[test]
    fn snapshot_survives_sparse_overwrite_and_unlink() {
        let _ = env_logger::builder().is_test(true).try_init();
        let blocks = Arc::new(crate::block::MemBlockStore::new());
        let fs = DocFs::new(
            Arc::new(MemStore::new()),
            blocks.clone(),
            FsConfig::default(),
        )
        .unwrap();

        // The sparse write leaves one live document covering [0, 12288);
        // the later rewrite shadows its tail block without removing it.
        fs.create("/f", 0o644, None).unwrap();
        fs.write("/f", &[b'x'; 4096], 8192).unwrap();
        fs.snapshot_dir("/", 0o755).unwrap();
        fs.write("/f", &[b'y'; 4096], 8192).unwrap();

        let x = crate::block::BlockHash::of(&[b'x'; 4096]);
        let y = crate::block::BlockHash::of(&[b'y'; 4096]);
        // x is held by the surviving live document and the generation.
        assert_eq!(blocks.refcount(&x), 2);
        assert_eq!(blocks.refcount(&y), 1);

        fs.unlink("/f").unwrap();
        // Only the generation's reference remains.
        assert_eq!(blocks.refcount(&x), 1);
        assert_eq!(blocks.refcount(&y), 0);

        let mut buf = vec![0xffu8; 12288];
        assert_eq!(fs.read("/.snapshot/1/f", &mut buf, 0).unwrap(), 12288);
        assert!(buf[..8192].iter().all(|&b| b == 0));
        assert!(buf[8192..].iter().all(|&b| b == b'x'));
    }

    #[test]
    fn global_stats_accumulate() {
        let fs = fs();
        fs.create("/f", 0o644, None).unwrap();
        fs.write("/f", &[0u8; 4096], 0).unwrap();
        let mut buf = [0u8; 4096];
        fs.read("/f", &mut buf, 0).unwrap();

        assert_eq!(fs.stats().writes().iter().sum::<u64>(), 1);
        assert_eq!(fs.stats().reads().iter().sum::<u64>(), 1);
    }

    #[test]
    fn snapshot_generation_readdir_is_explicit_only() {
        let fs = fs();
        fs.create("/f", 0o644, None).unwrap();
        fs.write("/f", b"z", 0).unwrap();
        fs.snapshot_dir("/", 0o755).unwrap();

        // Not listed at the root...
        let names: Vec<_> = fs
            .readdir("/")
            .unwrap()
            .into_iter()
            .map(|e| e.name)
            .collect();
        assert!(!names.contains(&".snapshot".to_string()));

        // ...but enumerable by explicit traversal.
        let names: Vec<_> = fs
            .readdir("/.snapshot")
            .unwrap()
            .into_iter()
            .map(|e| e.name)
            .collect();
        assert!(names.contains(&"1".to_string()));
    }
}
