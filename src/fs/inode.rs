//! Inodes.
//!
//! An inode is the metadata record for one filesystem object: its POSIX
//! attributes, the list of absolute paths linking to it (its dirents),
//! an optional inline content buffer, and per-inode I/O counters. The
//! persistent form is [`InodeDoc`]; this module translates between the
//! wire form and the in-memory [`Inode`] and implements the store
//! operations on whole inodes: lookup by path, creation, commit
//! (replace by id), existence checks, and permission checks.
//!
//! In-memory inodes hold plain data and borrow nothing; dropping one
//! releases it. Loading and committing are separate steps, so a typical
//! sequence is:
//!
//!     let mut ip = inode::get(store, path)?;
//!     // examine and modify ip ...
//!     inode::commit(store, &ip)?;
//!
//! Nothing orders concurrent load/commit pairs on different threads;
//! callers that need cross-thread exclusion take the cooperative
//! advisory lock below. The lock is a record embedded in the inode
//! document, updated by compare-and-set: a single writer or any number
//! of readers, stamped with a lease time. A holder that dies leaves a
//! stale record, which the next contender reclaims once the configured
//! TTL has passed.

use std::thread;
use std::time::{Duration, Instant};

use bitflags::bitflags;

use crate::db::{InodeDoc, LockDoc, ObjectId, Store};
use crate::error::{FsError, Result};
use crate::fs::path::Path;
use crate::fs::FsConfig;
use crate::param::STAT_BUCKETS;

/// Milliseconds since the epoch, the timestamp unit of inode documents.
pub(crate) fn now_ms() -> i64 {
    chrono::Utc::now().timestamp_millis()
}

bitflags! {
    /// Access bits for permission checks, matching `R_OK`/`W_OK`/`X_OK`.
    pub struct AccessMode: u32 {
        const READ = 4;
        const WRITE = 2;
        const EXEC = 1;
    }
}

/// In-memory form of one inode. `dirents[0]` is the canonical path for
/// whatever lookup or scan produced this inode.
#[derive(Debug, Clone, PartialEq)]
pub struct Inode {
    pub id: ObjectId,
    pub dirents: Vec<String>,
    pub mode: u32,
    pub owner: i64,
    pub group: i64,
    pub size: u64,
    pub dev: i64,
    pub created: i64,
    pub modified: i64,
    pub blocksize: u32,
    pub reads: [i64; STAT_BUCKETS],
    pub writes: [i64; STAT_BUCKETS],
    pub lock: Option<LockDoc>,
    pub data: Option<Vec<u8>>,
}

impl Inode {
    pub fn is_dir(&self) -> bool {
        self.mode & libc::S_IFDIR as u32 != 0
    }

    /// The canonical path of this inode.
    pub fn path(&self) -> &str {
        &self.dirents[0]
    }

    /// Translates the wire form. This is the only place documents
    /// become inodes.
    pub fn from_doc(doc: InodeDoc) -> Self {
        Inode {
            id: doc.id,
            dirents: doc.dirents,
            mode: doc.mode,
            owner: doc.owner,
            group: doc.group,
            size: doc.size,
            dev: doc.dev,
            created: doc.created,
            modified: doc.modified,
            blocksize: doc.blocksize,
            reads: doc.reads,
            writes: doc.writes,
            lock: doc.lock,
            data: doc.data.map(|b| b.into_vec()),
        }
    }

    pub fn to_doc(&self) -> InodeDoc {
        InodeDoc {
            id: self.id,
            dirents: self.dirents.clone(),
            mode: self.mode,
            owner: self.owner,
            group: self.group,
            size: self.size,
            dev: self.dev,
            created: self.created,
            modified: self.modified,
            blocksize: self.blocksize,
            reads: self.reads,
            writes: self.writes,
            lock: self.lock.clone(),
            data: self.data.clone().map(serde_bytes::ByteBuf::from),
        }
    }

    /// Moves the dirent equal to `path` to the head of the list, so the
    /// caller observes it as the canonical one. The relative order of
    /// the remaining dirents is preserved.
    pub(crate) fn make_canonical(&mut self, path: &str) {
        if let Some(idx) = self.dirents.iter().position(|d| d == path) {
            if idx > 0 {
                let d = self.dirents.remove(idx);
                self.dirents.insert(0, d);
            }
        }
    }
}

/// Looks up the inode whose dirents contain exactly `path`.
pub fn get(store: &dyn Store, path: &Path) -> Result<Inode> {
    let doc = store
        .find_inode_by_path(path.as_str())?
        .ok_or(FsError::NotFound)?;
    let mut inode = Inode::from_doc(doc);
    inode.make_canonical(path.as_str());
    Ok(inode)
}

/// Whether any inode links `path`.
pub fn exists(store: &dyn Store, path: &Path) -> Result<bool> {
    Ok(store.find_inode_by_path(path.as_str())?.is_some())
}

/// Creates a fresh inode at `path`. Rejects extant paths with `Exists`.
pub fn create(
    store: &dyn Store,
    path: &Path,
    mode: u32,
    cfg: &FsConfig,
    data: Option<Vec<u8>>,
) -> Result<ObjectId> {
    if exists(store, path)? {
        return Err(FsError::Exists);
    }
    let now = now_ms();
    let doc = InodeDoc {
        id: ObjectId::new(),
        dirents: vec![path.as_str().to_string()],
        mode,
        owner: cfg.owner,
        group: cfg.group,
        size: data.as_ref().map_or(0, |d| d.len() as u64),
        dev: cfg.dev,
        created: now,
        modified: now,
        blocksize: cfg.blocksize,
        reads: [0; STAT_BUCKETS],
        writes: [0; STAT_BUCKETS],
        lock: None,
        data: data.map(serde_bytes::ByteBuf::from),
    };
    let id = doc.id;
    store.insert_inode(&doc)?;
    Ok(id)
}

/// Writes the full document, replacing the previous one with the same
/// id (inserting if absent). Retrying a commit is therefore idempotent.
pub fn commit(store: &dyn Store, inode: &Inode) -> Result<()> {
    store.replace_inode(&inode.to_doc())?;
    Ok(())
}

/// Owner/group/other permission bits check. uid 0 bypasses.
pub fn check_access(inode: &Inode, access: AccessMode, uid: u32, gid: u32) -> Result<()> {
    if uid == 0 {
        return Ok(());
    }
    let shift = if inode.owner == uid as i64 {
        6
    } else if inode.group == gid as i64 {
        3
    } else {
        0
    };
    let granted = (inode.mode >> shift) & 0o7;
    if access.bits() & !granted != 0 {
        return Err(FsError::AccessDenied);
    }
    Ok(())
}

fn effective(lock: Option<LockDoc>, now: i64, ttl_ms: i64) -> Option<LockDoc> {
    lock.filter(|l| now - l.since < ttl_ms)
}

/// Takes the advisory lock on the inode at `path`.
///
/// Contention blocks up to `timeout` (or fails immediately when
/// `non_blocking`), retrying at the configured interval; both paths
/// surface `AccessDenied`. A stale record is reclaimed atomically, so
/// exactly one contender wins it.
pub fn lock(
    store: &dyn Store,
    path: &Path,
    writer: bool,
    timeout: Duration,
    non_blocking: bool,
    cfg: &FsConfig,
) -> Result<()> {
    let deadline = Instant::now() + timeout;
    loop {
        let doc = store
            .find_inode_by_path(path.as_str())?
            .ok_or(FsError::NotFound)?;
        let now = now_ms();
        let new = match (effective(doc.lock.clone(), now, cfg.lock_ttl_ms), writer) {
            (None, true) => LockDoc {
                writer: true,
                readers: 0,
                since: now,
            },
            (None, false) => LockDoc {
                writer: false,
                readers: 1,
                since: now,
            },
            (Some(cur), false) if !cur.writer => LockDoc {
                writer: false,
                readers: cur.readers + 1,
                since: now,
            },
            _ => {
                if non_blocking || Instant::now() >= deadline {
                    return Err(FsError::AccessDenied);
                }
                thread::sleep(Duration::from_millis(cfg.lock_retry_ms));
                continue;
            }
        };
        if store.update_lock(&doc.id, doc.lock.as_ref(), Some(&new))? {
            return Ok(());
        }
        // Lost a compare-and-set race; reread and retry.
    }
}

/// Releases one hold on the advisory lock. Releasing an already free
/// lock is a no-op, so every exit path may call this unconditionally.
pub fn unlock(store: &dyn Store, path: &Path, writer: bool) -> Result<()> {
    loop {
        let doc = store
            .find_inode_by_path(path.as_str())?
            .ok_or(FsError::NotFound)?;
        let new = match &doc.lock {
            None => return Ok(()),
            Some(cur) => {
                if !writer && !cur.writer && cur.readers > 1 {
                    Some(LockDoc {
                        writer: false,
                        readers: cur.readers - 1,
                        since: cur.since,
                    })
                } else {
                    None
                }
            }
        };
        if store.update_lock(&doc.id, doc.lock.as_ref(), new.as_ref())? {
            return Ok(());
        }
    }
}
