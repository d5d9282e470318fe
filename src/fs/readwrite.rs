//! Byte-range reads and writes over the extent store.
//!
//! The unit of storage is the inode's `blocksize` (a power of two).
//! Reads walk the requested range block by block, resolving each block
//! start against the extent store; a miss or a sparse run reads as
//! zeros, with the inline data buffer as a last fallback for inodes
//! created with embedded content. Writes stage each touched block,
//! read-modify-writing through a per-thread scratch buffer when the
//! write covers it only partially, store the block content-addressed,
//! and commit one extent per block as it is produced. A write extending
//! the file fills the gap beyond the old end-of-file with a sparse run
//! in the same batch, so the file's extents tile its byte range.
//!
//! Block refcounts follow the extent documents: a reference is taken
//! when a document entry is created (`put` on the write path, `incref`
//! on freeze) and dropped only when the holding document is removed,
//! whether by supersession, truncation, or release.

use std::cell::RefCell;

use crate::block::BlockStore;
use crate::db::Store;
use crate::error::{FsError, Result, StoreError};
use crate::fs::extent::{self, ExtentList};
use crate::fs::inode::{self, Inode};
use crate::stats::size_bucket;

thread_local! {
    // Per-thread block staging buffer, reused across operations. This
    // is also the buffer a wire-compression codec would run through.
    static SCRATCH: RefCell<Vec<u8>> = RefCell::new(Vec::new());
}

fn with_scratch<R>(f: impl FnOnce(&mut Vec<u8>) -> R) -> R {
    SCRATCH.with(|buf| f(&mut buf.borrow_mut()))
}

/// The start of the block containing `off`.
pub fn compute_start(blocksize: u32, off: u64) -> u64 {
    off & !(blocksize as u64 - 1)
}

fn round_up(blocksize: u32, off: u64) -> u64 {
    let bs = blocksize as u64;
    (off + bs - 1) & !(bs - 1)
}

/// Copies the overlap of `[src_off, src_off + data.len())` into
/// `dst` positioned at `[dst_off, dst_off + dst.len())`.
fn copy_overlap(dst: &mut [u8], dst_off: u64, data: &[u8], src_off: u64) {
    let dst_end = dst_off + dst.len() as u64;
    let src_end = src_off + data.len() as u64;
    if src_end <= dst_off || dst_end <= src_off {
        return;
    }
    let lo = dst_off.max(src_off);
    let hi = dst_end.min(src_end);
    dst[(lo - dst_off) as usize..(hi - dst_off) as usize]
        .copy_from_slice(&data[(lo - src_off) as usize..(hi - src_off) as usize]);
}

/// Fills `dst` (which is the range starting at byte `off` of the file)
/// with the stored content of the block starting at `block_start`.
fn fill_from_block(
    blocks: &dyn BlockStore,
    inode: &Inode,
    block_start: u64,
    entry: Option<extent::ExtentEntry>,
    dst: &mut [u8],
    off: u64,
) -> Result<()> {
    for b in dst.iter_mut() {
        *b = 0;
    }
    match entry {
        // A sparse run stays zero.
        Some(e) => {
            if let Some(hash) = e.hash {
                let data = blocks
                    .get(&hash)?
                    .ok_or_else(|| StoreError::new(format!("missing block {:?}", hash)))?;
                copy_overlap(dst, off, &data, block_start);
            }
        }
        None => {
            // No extent covers this block; embedded inline content is
            // the only remaining source of bytes.
            if let Some(data) = &inode.data {
                copy_overlap(dst, off, data, 0);
            }
        }
    }
    Ok(())
}

/// Reads up to `buf.len()` bytes at `offset`. Returns the byte count,
/// clipped to the file size.
pub fn read(
    store: &dyn Store,
    blocks: &dyn BlockStore,
    inode: &mut Inode,
    buf: &mut [u8],
    offset: u64,
) -> Result<usize> {
    if inode.is_dir() {
        return Err(FsError::IsDir);
    }
    if offset >= inode.size {
        return Ok(0);
    }
    let len = (buf.len() as u64).min(inode.size - offset) as usize;
    let bs = inode.blocksize as usize;

    let mut done = 0;
    while done < len {
        let pos = offset + done as u64;
        let start = compute_start(inode.blocksize, pos);
        let within = (pos - start) as usize;
        let tocopy = (len - done).min(bs - within);

        let entry = extent::resolve(store, &inode.id, start, inode.blocksize)?;
        fill_from_block(
            blocks,
            inode,
            start,
            entry,
            &mut buf[done..done + tocopy],
            pos,
        )?;
        done += tocopy;
    }

    inode.reads[size_bucket(len)] += 1;
    Ok(len)
}

/// Writes `buf` at `offset`, growing the file if it extends past the
/// current size, and commits the inode.
pub fn write(
    store: &dyn Store,
    blocks: &dyn BlockStore,
    inode: &mut Inode,
    buf: &[u8],
    offset: u64,
) -> Result<usize> {
    if inode.is_dir() {
        return Err(FsError::IsDir);
    }
    if buf.is_empty() {
        return Ok(0);
    }
    let bs = inode.blocksize as usize;
    let end = offset + buf.len() as u64;

    // A write past the old end leaves a hole; record it as sparse runs
    // so the extents keep tiling the byte range.
    let mut gap = ExtentList::new();
    let old_ceiling = round_up(inode.blocksize, inode.size);
    let first_block = compute_start(inode.blocksize, offset);
    if first_block > old_ceiling {
        let max_run = (u32::MAX as u64 / bs as u64) * bs as u64;
        let mut at = old_ceiling;
        while at < first_block {
            let run = (first_block - at).min(max_run);
            gap.insert_empty(at, run as u32)?;
            at += run;
        }
    }

    let mut src = 0;
    while src < buf.len() {
        let pos = offset + src as u64;
        let start = compute_start(inode.blocksize, pos);
        let within = (pos - start) as usize;
        let n = (buf.len() - src).min(bs - within);
        let covers_block = within == 0 && n == bs;

        let hash = if covers_block {
            blocks.put(&buf[src..src + n])?
        } else {
            let prev = extent::resolve(store, &inode.id, start, inode.blocksize)?;
            with_scratch(|scratch| -> Result<_> {
                scratch.clear();
                scratch.resize(bs, 0);
                fill_from_block(blocks, inode, start, prev, scratch, start)?;
                scratch[within..within + n].copy_from_slice(&buf[src..src + n]);
                Ok(blocks.put(scratch)?)
            })?
        };

        // Serialization releases the blocks of the documents it
        // supersedes; a replaced block whose document survives (a
        // partial overlap) stays referenced by that document.
        let mut list = std::mem::take(&mut gap);
        list.insert_hash(start, inode.blocksize, hash)?;
        extent::serialize(store, blocks, &inode.id, &mut list)?;

        src += n;
    }

    if end > inode.size {
        inode.size = end;
    }
    inode.modified = inode::now_ms();
    inode.writes[size_bucket(buf.len())] += 1;
    inode::commit(store, inode)?;
    Ok(buf.len())
}

/// Truncates to `size`, releasing the blocks of dropped extents, and
/// commits the inode. Growing is sparse.
pub fn truncate(
    store: &dyn Store,
    blocks: &dyn BlockStore,
    inode: &mut Inode,
    size: u64,
) -> Result<()> {
    if inode.is_dir() {
        return Err(FsError::IsDir);
    }
    if size < inode.size {
        let cut = round_up(inode.blocksize, size);
        // Only whole documents beyond the cut are dropped; a document
        // straddling the cut survives and keeps every block reference
        // it holds.
        let removed = store.remove_extents_from(&inode.id, cut)?;
        extent::release_block_refs(blocks, &removed)?;
    }
    inode.size = size;
    inode.modified = inode::now_ms();
    inode::commit(store, inode)
}

/// Drops every extent of `inode` and one block reference per removed
/// document entry, leaving the inode document itself in place. The
/// final step of unlinking.
pub(crate) fn release_content(
    store: &dyn Store,
    blocks: &dyn BlockStore,
    inode: &Inode,
) -> Result<()> {
    let removed = store.remove_extents_from(&inode.id, 0)?;
    extent::release_block_refs(blocks, &removed)
}
