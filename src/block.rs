//! Content-addressed block storage.
//!
//! File content is chopped into `blocksize` blocks keyed by the BLAKE2b
//! hash of their bytes, so identical blocks are stored once and shared
//! between files and snapshots through reference counting. The
//! [`BlockStore`] trait is the external contract the filesystem core
//! depends on; [`MemBlockStore`] is the in-process implementation the
//! tests run against.

use std::collections::HashMap;
use std::fmt;

use arrayvec::ArrayVec;
use bitmaps::Bitmap;
use blake2_rfc::blake2b::blake2b;
use serde::de::{self, Visitor};
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use spin::RwLock;

use crate::db::ObjectId;
use crate::error::StoreError;
use crate::param::{BLOCKS_PER_MAP, HASH_LEN};

/// 20-byte content hash of one block.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct BlockHash([u8; HASH_LEN]);

impl BlockHash {
    /// Hashes `data` with BLAKE2b-160.
    pub fn of(data: &[u8]) -> Self {
        let digest = blake2b(HASH_LEN, &[], data);
        let mut raw = [0u8; HASH_LEN];
        raw.copy_from_slice(digest.as_bytes());
        BlockHash(raw)
    }

    pub fn as_bytes(&self) -> &[u8; HASH_LEN] {
        &self.0
    }
}

impl fmt::Debug for BlockHash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for b in &self.0 {
            write!(f, "{:02x}", b)?;
        }
        Ok(())
    }
}

impl Serialize for BlockHash {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_bytes(&self.0)
    }
}

struct BlockHashVisitor;

impl<'de> Visitor<'de> for BlockHashVisitor {
    type Value = BlockHash;

    fn expecting(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} bytes", HASH_LEN)
    }

    fn visit_bytes<E: de::Error>(self, v: &[u8]) -> Result<BlockHash, E> {
        if v.len() != HASH_LEN {
            return Err(E::invalid_length(v.len(), &self));
        }
        let mut raw = [0u8; HASH_LEN];
        raw.copy_from_slice(v);
        Ok(BlockHash(raw))
    }
}

impl<'de> Deserialize<'de> for BlockHash {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        deserializer.deserialize_bytes(BlockHashVisitor)
    }
}

/// External contract of the block store.
///
/// Every block referenced by a live extent must keep a refcount of at
/// least one here; the filesystem takes a reference with `put` or
/// `incref` and drops it with `decref`.
pub trait BlockStore: Send + Sync {
    /// Stores `data` and takes one reference to it. Returns its hash.
    fn put(&self, data: &[u8]) -> Result<BlockHash, StoreError>;

    /// The bytes stored under `hash`, if any.
    fn get(&self, hash: &BlockHash) -> Result<Option<Vec<u8>>, StoreError>;

    /// Takes an additional reference to an existing block.
    fn incref(&self, hash: &BlockHash) -> Result<(), StoreError>;

    /// Drops one reference; the block is freed when none remain.
    fn decref(&self, hash: &BlockHash) -> Result<(), StoreError>;
}

/// In-process refcounted [`BlockStore`].
#[derive(Default)]
pub struct MemBlockStore {
    blocks: RwLock<HashMap<BlockHash, (u64, Vec<u8>)>>,
}

impl MemBlockStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Current refcount of `hash`; 0 if absent.
    pub fn refcount(&self, hash: &BlockHash) -> u64 {
        self.blocks.read().get(hash).map_or(0, |(n, _)| *n)
    }

    /// Number of distinct blocks held.
    pub fn len(&self) -> usize {
        self.blocks.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.blocks.read().is_empty()
    }
}

impl BlockStore for MemBlockStore {
    fn put(&self, data: &[u8]) -> Result<BlockHash, StoreError> {
        let hash = BlockHash::of(data);
        let mut blocks = self.blocks.write();
        let entry = blocks.entry(hash).or_insert_with(|| (0, data.to_vec()));
        entry.0 += 1;
        Ok(hash)
    }

    fn get(&self, hash: &BlockHash) -> Result<Option<Vec<u8>>, StoreError> {
        Ok(self.blocks.read().get(hash).map(|(_, data)| data.clone()))
    }

    fn incref(&self, hash: &BlockHash) -> Result<(), StoreError> {
        let mut blocks = self.blocks.write();
        match blocks.get_mut(hash) {
            Some((n, _)) => {
                *n += 1;
                Ok(())
            }
            None => Err(StoreError::new(format!("incref of unknown block {:?}", hash))),
        }
    }

    fn decref(&self, hash: &BlockHash) -> Result<(), StoreError> {
        let mut blocks = self.blocks.write();
        match blocks.get_mut(hash) {
            Some((n, _)) => {
                *n -= 1;
                if *n == 0 {
                    blocks.remove(hash);
                }
            }
            None => log::warn!("decref of unknown block {:?}", hash),
        }
        Ok(())
    }
}

/// An in-memory batch of block hashes bound to the inode that owns
/// them, covering one `BLOCKS_PER_MAP`-block aligned window of its byte
/// range. The snapshot engine fills a map from the extents of a window,
/// rebinds it to the inode receiving the blocks, and commits the whole
/// batch at once; the dirty bitmap records which slots the commit must
/// touch.
pub struct BlockMap {
    inode: ObjectId,
    base: u64,
    slots: Box<ArrayVec<(u16, u32, BlockHash), BLOCKS_PER_MAP>>,
    dirty: Bitmap<BLOCKS_PER_MAP>,
}

impl BlockMap {
    /// An empty map owned by `inode`, covering the window starting at
    /// byte offset `base` (which must be map-aligned).
    pub fn new(inode: ObjectId, base: u64) -> Self {
        BlockMap {
            inode,
            base,
            slots: Box::new(ArrayVec::new()),
            dirty: Bitmap::new(),
        }
    }

    pub fn inode(&self) -> &ObjectId {
        &self.inode
    }

    /// Byte offset of the first block slot.
    pub fn base(&self) -> u64 {
        self.base
    }

    /// Rebinds the map to a new owning inode.
    pub fn set_inode(&mut self, inode: ObjectId) {
        self.inode = inode;
    }

    /// Records the block at `slot` and marks it dirty.
    pub fn insert(&mut self, slot: u16, len: u32, hash: BlockHash) {
        debug_assert!((slot as usize) < BLOCKS_PER_MAP);
        self.slots.push((slot, len, hash));
        self.dirty.set(slot as usize, true);
    }

    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }

    /// Occupied dirty slots as `(byte offset, len, hash)`, in slot order.
    pub fn iter_dirty<'s>(
        &'s self,
        blocksize: u32,
    ) -> impl Iterator<Item = (u64, u32, &'s BlockHash)> + 's {
        let base = self.base;
        let dirty = &self.dirty;
        self.slots
            .iter()
            .filter(move |(slot, _, _)| dirty.get(*slot as usize))
            .map(move |(slot, len, hash)| (base + *slot as u64 * blocksize as u64, *len, hash))
    }
}
