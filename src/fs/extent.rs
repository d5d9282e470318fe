//! The extent store.
//!
//! An inode's block composition is persisted as a set of non-overlapping
//! extent documents, each an ordered run of `(hash, len)` block
//! descriptors tiling `[start, end)`; a null hash is a sparse all-zero
//! run. Extent documents are immutable: a write serializes new
//! documents, then deletes every older document whose range the new one
//! entirely contains. "Older" is decided by document id, and ids are
//! monotone, so concurrent serializers converge on latest-writer-wins
//! for overlapping ranges without any cross-document transaction, and a
//! retried serialization deletes nothing new.
//!
//! The read path queries overlapping documents ordered by `(start, id)`
//! ascending and walks their block runs; where documents overlap, the
//! entry seen last (the greater id) wins per block.

use itertools::Itertools;

use crate::block::{BlockHash, BlockStore};
use crate::db::{BlockEntry, ExtentDoc, ObjectId, Store};
use crate::error::{FsError, Result};

/// One in-memory block descriptor: a run of `len` bytes at `off`, with
/// a content hash or, for a sparse run, none.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ExtentEntry {
    pub off: u64,
    pub len: u32,
    pub hash: Option<BlockHash>,
    seq: u32,
}

impl ExtentEntry {
    pub fn end(&self) -> u64 {
        self.off + self.len as u64
    }

    pub fn is_sparse(&self) -> bool {
        self.hash.is_none()
    }
}

/// A batch of block descriptors headed for serialization, in insertion
/// order. Sequence numbers are assigned on insert and never persisted;
/// they only make the serialization sort stable against reordering, so
/// entries inserted earlier win ties.
#[derive(Debug, Default)]
pub struct ExtentList {
    entries: Vec<ExtentEntry>,
}

impl ExtentList {
    pub fn new() -> Self {
        Self::default()
    }

    fn push(&mut self, entry: ExtentEntry) -> Result<()> {
        self.entries.try_reserve(1).map_err(|_| FsError::NoMem)?;
        self.entries.push(entry);
        Ok(())
    }

    /// Appends a content-bearing run.
    pub fn insert_hash(&mut self, off: u64, len: u32, hash: BlockHash) -> Result<()> {
        let seq = self.entries.len() as u32;
        self.push(ExtentEntry {
            off,
            len,
            hash: Some(hash),
            seq,
        })
    }

    /// Appends a sparse run.
    pub fn insert_empty(&mut self, off: u64, len: u32) -> Result<()> {
        let seq = self.entries.len() as u32;
        self.push(ExtentEntry {
            off,
            len,
            hash: None,
            seq,
        })
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn iter(&self) -> impl Iterator<Item = &ExtentEntry> {
        self.entries.iter()
    }
}

/// Persists `list` for the inode `owner` and empties it.
///
/// Entries are stably ordered by `(sequence, offset)`, then maximal
/// contiguous runs each become one document. After every insert, older
/// documents entirely contained in the new document's range are
/// deleted; the id guard makes a retry of the whole batch converge on
/// the same final coverage. A deleted document drops its block
/// references here, and nowhere else: a block's refcount always equals
/// the number of extent document entries naming it, so a superseded
/// entry in a surviving document (one the new range only partially
/// overlaps) keeps its reference until that document goes.
pub fn serialize(
    store: &dyn Store,
    blocks: &dyn BlockStore,
    owner: &ObjectId,
    list: &mut ExtentList,
) -> Result<()> {
    if list.entries.is_empty() {
        return Ok(());
    }
    list.entries.sort_by_key(|e| (e.seq, e.off));

    // Adjacent sparse runs carry no payload; fold them before grouping.
    let entries: Vec<ExtentEntry> = list
        .entries
        .drain(..)
        .coalesce(|a, b| {
            if a.is_sparse()
                && b.is_sparse()
                && a.end() == b.off
                && (a.len as u64 + b.len as u64) <= u32::MAX as u64
            {
                Ok(ExtentEntry {
                    off: a.off,
                    len: a.len + b.len,
                    hash: None,
                    seq: a.seq,
                })
            } else {
                Err((a, b))
            }
        })
        .collect();

    let mut idx = 0;
    while idx < entries.len() {
        let docid = ObjectId::new();
        let start = entries[idx].off;
        let mut end = start;
        let mut run = Vec::new();
        while idx < entries.len() {
            let cur = &entries[idx];
            if !run.is_empty() && cur.off != end {
                break;
            }
            run.push(BlockEntry {
                hash: cur.hash,
                len: cur.len,
            });
            end = cur.end();
            idx += 1;
        }

        store.insert_extent(&ExtentDoc {
            id: docid,
            inode: *owner,
            start,
            end,
            blocks: run,
        })?;
        let superseded = store.remove_extents_within(owner, start, end, &docid)?;
        release_block_refs(blocks, &superseded)?;
    }
    Ok(())
}

/// Drops one block reference per non-sparse entry of each removed
/// document.
pub(crate) fn release_block_refs(blocks: &dyn BlockStore, docs: &[ExtentDoc]) -> Result<()> {
    for doc in docs {
        for block in &doc.blocks {
            if let Some(hash) = &block.hash {
                blocks.decref(hash)?;
            }
        }
    }
    Ok(())
}

/// Reads back the block descriptors of `owner` intersecting
/// `[off, off + len)`, in `(start, id)` document order.
pub fn deserialize(store: &dyn Store, owner: &ObjectId, off: u64, len: u64) -> Result<ExtentList> {
    let end = off + len;
    let docs = store.find_extents(owner, end, off)?;

    let mut out = ExtentList::new();
    for doc in docs {
        let mut curoff = doc.start;
        for block in &doc.blocks {
            let curend = curoff + block.len as u64;
            if curoff < end && curend > off {
                match block.hash {
                    Some(hash) => out.insert_hash(curoff, block.len, hash)?,
                    None => out.insert_empty(curoff, block.len)?,
                }
            }
            curoff = curend;
        }
    }
    Ok(out)
}

/// Resolves the block containing `off`: of all persisted runs covering
/// that offset, the one from the greatest document id wins.
pub fn resolve(
    store: &dyn Store,
    owner: &ObjectId,
    off: u64,
    blocksize: u32,
) -> Result<Option<ExtentEntry>> {
    let list = deserialize(store, owner, off, blocksize as u64)?;
    Ok(list
        .iter()
        .filter(|e| e.off <= off && off < e.end())
        .last()
        .copied())
}
