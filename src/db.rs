//! The document store seam.
//!
//! Persistent state lives in two collections of schemaless documents:
//! `inodes` and `extents`. This module defines the wire form of both
//! document types, the opaque [`ObjectId`] that keys them, and the
//! [`Store`] trait capturing exactly the driver operations the
//! filesystem core relies on. Connection pooling, wire protocol and
//! server-side index maintenance belong to the driver behind the trait;
//! the deployment is expected to keep an index on `dirents` and compound
//! indexes on `(inode, start)` and `(inode, end)`.
//!
//! [`MemStore`] is the in-process implementation used by the tests: it
//! keeps documents msgpack-encoded and decodes on every read, so the
//! wire translation path is exercised by every operation, and it
//! emulates the collection indexes by scanning.

use std::collections::BTreeMap;
use std::fmt;
use std::sync::atomic::{AtomicU32, Ordering};

use rand::RngCore;
use regex::Regex;
use serde::de::{self, Visitor};
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use spin::{Once, RwLock};

use crate::block::BlockHash;
use crate::error::StoreError;
use crate::param::STAT_BUCKETS;

/// Opaque 12-byte document identifier.
///
/// Ids generated by one process are strictly increasing: 4 bytes of
/// big-endian seconds, a 5-byte per-process random prefix, and a 3-byte
/// big-endian counter. The lexicographic `Ord` on the raw bytes
/// therefore matches generation order, which is what makes the
/// supersede-by-smaller-id rule of the extent store converge under
/// retries and concurrent writers.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ObjectId([u8; 12]);

static OID_COUNTER: AtomicU32 = AtomicU32::new(0);
static OID_PREFIX: Once<[u8; 5]> = Once::new();

impl ObjectId {
    /// Generates a fresh id, greater than every id this process has
    /// generated before it.
    pub fn new() -> Self {
        let prefix = OID_PREFIX.call_once(|| {
            let mut p = [0u8; 5];
            rand::thread_rng().fill_bytes(&mut p);
            p
        });
        let secs = chrono::Utc::now().timestamp() as u32;
        let count = OID_COUNTER.fetch_add(1, Ordering::Relaxed) & 0x00ff_ffff;

        let mut raw = [0u8; 12];
        raw[..4].copy_from_slice(&secs.to_be_bytes());
        raw[4..9].copy_from_slice(prefix);
        raw[9..].copy_from_slice(&count.to_be_bytes()[1..]);
        ObjectId(raw)
    }

    pub fn as_bytes(&self) -> &[u8; 12] {
        &self.0
    }

    pub fn from_bytes(raw: [u8; 12]) -> Self {
        ObjectId(raw)
    }
}

impl Default for ObjectId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for ObjectId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ObjectId(")?;
        for b in &self.0 {
            write!(f, "{:02x}", b)?;
        }
        write!(f, ")")
    }
}

impl Serialize for ObjectId {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_bytes(&self.0)
    }
}

struct ObjectIdVisitor;

impl<'de> Visitor<'de> for ObjectIdVisitor {
    type Value = ObjectId;

    fn expecting(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("12 bytes")
    }

    fn visit_bytes<E: de::Error>(self, v: &[u8]) -> Result<ObjectId, E> {
        if v.len() != 12 {
            return Err(E::invalid_length(v.len(), &self));
        }
        let mut raw = [0u8; 12];
        raw.copy_from_slice(v);
        Ok(ObjectId(raw))
    }
}

impl<'de> Deserialize<'de> for ObjectId {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        deserializer.deserialize_bytes(ObjectIdVisitor)
    }
}

/// Advisory lock record embedded in an inode document. A single writer
/// or any number of readers; `since` is the lease timestamp in
/// milliseconds, used for stale-lock reclamation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LockDoc {
    pub writer: bool,
    pub readers: u32,
    pub since: i64,
}

/// Wire form of one inode.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InodeDoc {
    #[serde(rename = "_id")]
    pub id: ObjectId,
    /// Every absolute path linking to this inode.
    pub dirents: Vec<String>,
    pub mode: u32,
    pub owner: i64,
    pub group: i64,
    pub size: u64,
    pub dev: i64,
    /// Milliseconds since the epoch.
    pub created: i64,
    pub modified: i64,
    /// Power of two.
    pub blocksize: u32,
    /// Size-class histograms of read and write calls.
    pub reads: [i64; STAT_BUCKETS],
    pub writes: [i64; STAT_BUCKETS],
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub lock: Option<LockDoc>,
    /// Small inline content buffer.
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub data: Option<serde_bytes::ByteBuf>,
}

/// One block descriptor inside an extent document. A `None` hash is a
/// sparse (all-zero) run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct BlockEntry {
    pub hash: Option<BlockHash>,
    pub len: u32,
}

/// Wire form of one extent: a contiguous run of block descriptors
/// tiling `[start, end)`, owned by one inode. Extent documents are
/// immutable once inserted; updates insert a new document and delete
/// superseded ones.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExtentDoc {
    #[serde(rename = "_id")]
    pub id: ObjectId,
    pub inode: ObjectId,
    pub start: u64,
    pub end: u64,
    pub blocks: Vec<BlockEntry>,
}

/// Driver contract for the two collections.
///
/// Implementations must be safe for concurrent use from parallel OS
/// threads; every method is a potential suspension point. Single-method
/// calls are atomic at the document level, and nothing else is: callers
/// get no transaction across calls.
pub trait Store: Send + Sync {
    // Inode collection.

    /// Inserts a new inode document.
    fn insert_inode(&self, doc: &InodeDoc) -> Result<(), StoreError>;

    /// Replaces the document with the same `_id`, inserting if absent.
    fn replace_inode(&self, doc: &InodeDoc) -> Result<(), StoreError>;

    /// Removes the document keyed by `id`.
    fn remove_inode(&self, id: &ObjectId) -> Result<(), StoreError>;

    /// The document whose `dirents` array contains exactly `path`.
    fn find_inode_by_path(&self, path: &str) -> Result<Option<InodeDoc>, StoreError>;

    /// Every document with a dirent matching `pattern`, in id order,
    /// with the bulk `data` field projected out.
    fn find_inodes_matching(&self, pattern: &str) -> Result<Vec<InodeDoc>, StoreError>;

    /// Number of documents with a dirent matching `pattern`.
    fn count_matching(&self, pattern: &str) -> Result<u64, StoreError>;

    /// Atomic positional update: in the first document whose `dirents`
    /// contains exactly `old`, overwrite that element with `new`.
    /// Returns the number of documents updated (0 or 1).
    fn update_dirent(&self, old: &str, new: &str) -> Result<u64, StoreError>;

    /// Atomic compare-and-set of the lock record embedded in the inode
    /// document keyed by `id`. Succeeds and applies `new` only if the
    /// stored record equals `expected`.
    fn update_lock(
        &self,
        id: &ObjectId,
        expected: Option<&LockDoc>,
        new: Option<&LockDoc>,
    ) -> Result<bool, StoreError>;

    // Extent collection.

    /// Inserts a new extent document.
    fn insert_extent(&self, doc: &ExtentDoc) -> Result<(), StoreError>;

    /// Extents of `inode` with `start <= start_lte` and `end >= end_gte`,
    /// sorted by `(start, _id)` ascending.
    fn find_extents(
        &self,
        inode: &ObjectId,
        start_lte: u64,
        end_gte: u64,
    ) -> Result<Vec<ExtentDoc>, StoreError>;

    /// Removes extents of `inode` entirely contained in `[start, end]`
    /// whose id is less than `id_lt`. Returns the removed documents so
    /// the caller can release exactly their block references.
    fn remove_extents_within(
        &self,
        inode: &ObjectId,
        start: u64,
        end: u64,
        id_lt: &ObjectId,
    ) -> Result<Vec<ExtentDoc>, StoreError>;

    /// Removes extents of `inode` with `start >= start_gte`. Returns
    /// the removed documents.
    fn remove_extents_from(
        &self,
        inode: &ObjectId,
        start_gte: u64,
    ) -> Result<Vec<ExtentDoc>, StoreError>;
}

/// In-process [`Store`] keeping msgpack-encoded documents under spin
/// locks. Critical sections never block on I/O, so spinning is safe.
#[derive(Default)]
pub struct MemStore {
    inodes: RwLock<BTreeMap<ObjectId, Vec<u8>>>,
    extents: RwLock<BTreeMap<ObjectId, Vec<u8>>>,
}

impl MemStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn encode<T: Serialize>(doc: &T) -> Result<Vec<u8>, StoreError> {
        Ok(rmp_serde::to_vec_named(doc)?)
    }

    fn decode<'a, T: Deserialize<'a>>(raw: &'a [u8]) -> Result<T, StoreError> {
        Ok(rmp_serde::from_slice(raw)?)
    }

    fn compile(pattern: &str) -> Result<Regex, StoreError> {
        Regex::new(pattern).map_err(|e| StoreError::new(format!("bad pattern: {}", e)))
    }
}

impl Store for MemStore {
    fn insert_inode(&self, doc: &InodeDoc) -> Result<(), StoreError> {
        let raw = Self::encode(doc)?;
        self.inodes.write().insert(doc.id, raw);
        Ok(())
    }

    fn replace_inode(&self, doc: &InodeDoc) -> Result<(), StoreError> {
        self.insert_inode(doc)
    }

    fn remove_inode(&self, id: &ObjectId) -> Result<(), StoreError> {
        self.inodes.write().remove(id);
        Ok(())
    }

    fn find_inode_by_path(&self, path: &str) -> Result<Option<InodeDoc>, StoreError> {
        let inodes = self.inodes.read();
        for raw in inodes.values() {
            let doc: InodeDoc = Self::decode(raw)?;
            if doc.dirents.iter().any(|d| d == path) {
                return Ok(Some(doc));
            }
        }
        Ok(None)
    }

    fn find_inodes_matching(&self, pattern: &str) -> Result<Vec<InodeDoc>, StoreError> {
        let re = Self::compile(pattern)?;
        let inodes = self.inodes.read();
        let mut out = Vec::new();
        for raw in inodes.values() {
            let mut doc: InodeDoc = Self::decode(raw)?;
            if doc.dirents.iter().any(|d| re.is_match(d)) {
                doc.data = None;
                out.push(doc);
            }
        }
        Ok(out)
    }

    fn count_matching(&self, pattern: &str) -> Result<u64, StoreError> {
        let re = Self::compile(pattern)?;
        let inodes = self.inodes.read();
        let mut n = 0;
        for raw in inodes.values() {
            let doc: InodeDoc = Self::decode(raw)?;
            if doc.dirents.iter().any(|d| re.is_match(d)) {
                n += 1;
            }
        }
        Ok(n)
    }

    fn update_dirent(&self, old: &str, new: &str) -> Result<u64, StoreError> {
        let mut inodes = self.inodes.write();
        for raw in inodes.values_mut() {
            let mut doc: InodeDoc = Self::decode(raw)?;
            if let Some(slot) = doc.dirents.iter_mut().find(|d| d.as_str() == old) {
                *slot = new.to_string();
                *raw = Self::encode(&doc)?;
                return Ok(1);
            }
        }
        Ok(0)
    }

    fn update_lock(
        &self,
        id: &ObjectId,
        expected: Option<&LockDoc>,
        new: Option<&LockDoc>,
    ) -> Result<bool, StoreError> {
        let mut inodes = self.inodes.write();
        let raw = match inodes.get_mut(id) {
            Some(raw) => raw,
            None => return Ok(false),
        };
        let mut doc: InodeDoc = Self::decode(raw)?;
        if doc.lock.as_ref() != expected {
            return Ok(false);
        }
        doc.lock = new.cloned();
        *raw = Self::encode(&doc)?;
        Ok(true)
    }

    fn insert_extent(&self, doc: &ExtentDoc) -> Result<(), StoreError> {
        let raw = Self::encode(doc)?;
        self.extents.write().insert(doc.id, raw);
        Ok(())
    }

    fn find_extents(
        &self,
        inode: &ObjectId,
        start_lte: u64,
        end_gte: u64,
    ) -> Result<Vec<ExtentDoc>, StoreError> {
        let extents = self.extents.read();
        let mut out = Vec::new();
        for raw in extents.values() {
            let doc: ExtentDoc = Self::decode(raw)?;
            if doc.inode == *inode && doc.start <= start_lte && doc.end >= end_gte {
                out.push(doc);
            }
        }
        out.sort_by_key(|d| (d.start, d.id));
        Ok(out)
    }

    fn remove_extents_within(
        &self,
        inode: &ObjectId,
        start: u64,
        end: u64,
        id_lt: &ObjectId,
    ) -> Result<Vec<ExtentDoc>, StoreError> {
        let mut extents = self.extents.write();
        let mut doomed = Vec::new();
        for raw in extents.values() {
            let doc: ExtentDoc = Self::decode(raw)?;
            if doc.inode == *inode && doc.start >= start && doc.end <= end && doc.id < *id_lt {
                doomed.push(doc);
            }
        }
        for doc in &doomed {
            extents.remove(&doc.id);
        }
        Ok(doomed)
    }

    fn remove_extents_from(
        &self,
        inode: &ObjectId,
        start_gte: u64,
    ) -> Result<Vec<ExtentDoc>, StoreError> {
        let mut extents = self.extents.write();
        let mut doomed = Vec::new();
        for raw in extents.values() {
            let doc: ExtentDoc = Self::decode(raw)?;
            if doc.inode == *inode && doc.start >= start_gte {
                doomed.push(doc);
            }
        }
        for doc in &doomed {
            extents.remove(&doc.id);
        }
        Ok(doomed)
    }
}
