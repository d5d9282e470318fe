//! The dirent index.
//!
//! Paths map to inodes through the `dirents` array of the inode
//! collection, which the deployment keeps indexed. Directory listing is
//! a regex scan for `^<dir>/[^/]+$` (the root normalizes to the empty
//! prefix); rename is an atomic positional update of the one matching
//! array element. When a scan yields an inode, the dirent that matched
//! the scanned prefix is the canonical one and is rotated to the head
//! of the list before the caller observes the inode.
//!
//! Children named `.snapshot` that are directories are suppressed from
//! scans: snapshots are reached by explicit path traversal only, and
//! the engines walking directories must not descend into them.

use regex::Regex;

use crate::db::Store;
use crate::error::{FsError, Result, StoreError};
use crate::fs::inode::Inode;
use crate::fs::path::Path;
use crate::param::SNAPSHOT_NAME;

/// The scan pattern matching dirents directly beneath `dir`.
pub fn child_pattern(dir: &Path) -> String {
    format!("^{}/[^/]+$", regex::escape(dir.prefix()))
}

/// Calls `f` once per inode with a dirent directly beneath `dir`, with
/// the canonical dirent rotated to the head. An error from `f` stops
/// the scan and propagates.
pub fn read_dirents<F>(store: &dyn Store, dir: &Path, mut f: F) -> Result<()>
where
    F: FnMut(&mut Inode) -> Result<()>,
{
    let pattern = child_pattern(dir);
    let re = Regex::new(&pattern).map_err(|e| StoreError::new(format!("bad pattern: {}", e)))?;

    let docs = store.find_inodes_matching(&pattern).map_err(|e| {
        log::warn!("directory scan of {} failed: {}", dir, e);
        FsError::Io(e)
    })?;
    for doc in docs {
        let mut inode = Inode::from_doc(doc);
        let canonical = match inode.dirents.iter().find(|d| re.is_match(d)) {
            Some(d) => d.clone(),
            // The store matched a projection we cannot see; skip it.
            None => continue,
        };
        inode.make_canonical(&canonical);

        let name = filename(&canonical);
        if name == SNAPSHOT_NAME && inode.is_dir() {
            continue;
        }
        f(&mut inode)?;
    }
    Ok(())
}

/// The short filename of a dirent path: the text after the last slash.
pub fn filename(path: &str) -> &str {
    match path.rfind('/') {
        Some(cut) => &path[cut + 1..],
        None => path,
    }
}

/// Atomically rewrites the dirent equal to `old` to `new`. Returns how
/// many documents matched (0 or 1). No path-collision check happens at
/// this layer; callers must have verified.
pub fn rename(store: &dyn Store, old: &Path, new: &Path) -> Result<u64> {
    Ok(store.update_dirent(old.as_str(), new.as_str())?)
}

/// Number of inodes with a live child dirent beneath `dir`, not
/// counting a `.snapshot` child.
pub fn count_children(store: &dyn Store, dir: &Path) -> Result<u64> {
    let pattern = child_pattern(dir);
    let re = Regex::new(&pattern).map_err(|e| StoreError::new(format!("bad pattern: {}", e)))?;
    let docs = store.find_inodes_matching(&pattern)?;
    let n = docs
        .iter()
        .filter(|doc| {
            doc.dirents
                .iter()
                .any(|d| re.is_match(d) && filename(d) != SNAPSHOT_NAME)
        })
        .count();
    Ok(n as u64)
}
