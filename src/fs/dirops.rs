//! Directory operations: `mkdir`, `readdir`, `rmdir`, `rename`.

use crate::db::Store;
use crate::error::{FsError, Result};
use crate::fs::dirent::{self, filename};
use crate::fs::inode;
use crate::fs::path::Path;
use crate::fs::snapshot;
use crate::fs::stat::FileStat;
use crate::fs::FsConfig;
use crate::param::SNAPSHOT_NAME;

/// One `readdir` row. `.` and `..` carry no stat.
#[derive(Debug, Clone, PartialEq)]
pub struct DirEntry {
    pub name: String,
    pub stat: Option<FileStat>,
}

/// Creates a directory and its `.snapshot` child, both directories
/// with the given permission bits. Fails with the first error.
pub fn mkdir(store: &dyn Store, cfg: &FsConfig, path: &Path, mode: u32) -> Result<()> {
    if path.is_root() {
        return Err(FsError::Exists);
    }
    if path.in_snapshot() {
        return Err(FsError::AccessDenied);
    }
    let parent = inode::get(store, path.parent())?;
    if !parent.is_dir() {
        return Err(FsError::NotDir);
    }

    let mode = mode | libc::S_IFDIR as u32;
    inode::create(store, path, mode, cfg, None)?;
    let anchor = path.join(SNAPSHOT_NAME);
    inode::create(store, Path::new(&anchor)?, mode, cfg, None)?;
    Ok(())
}

/// Lists a directory: `.`, `..`, then each live child with a
/// fabricated stat. `.snapshot` children stay hidden; generations are
/// reached by explicit path traversal.
pub fn readdir(store: &dyn Store, path: &Path) -> Result<Vec<DirEntry>> {
    let dir = inode::get(store, path)?;
    if !dir.is_dir() {
        return Err(FsError::NotDir);
    }

    let mut out = vec![
        DirEntry {
            name: ".".to_string(),
            stat: None,
        },
        DirEntry {
            name: "..".to_string(),
            stat: None,
        },
    ];
    dirent::read_dirents(store, path, |child| {
        out.push(DirEntry {
            name: filename(child.path()).to_string(),
            stat: Some(FileStat::from_inode(child)),
        });
        Ok(())
    })?;
    Ok(out)
}

/// Removes an empty directory. The `.snapshot` child never blocks
/// removal; it is orphaned into the parent's `.snapshot` instead, so
/// frozen history survives its directory.
pub fn rmdir(store: &dyn Store, path: &Path) -> Result<()> {
    if path.is_root() || path.in_snapshot() {
        return Err(FsError::AccessDenied);
    }
    let dir = inode::get(store, path)?;
    if !dir.is_dir() {
        return Err(FsError::NotDir);
    }
    if dirent::count_children(store, path)? > 0 {
        return Err(FsError::NotEmpty);
    }

    let anchor = path.join(SNAPSHOT_NAME);
    let mut snap = inode::get(store, Path::new(&anchor)?)?;
    snapshot::orphan(store, &mut snap, path)?;

    store.remove_inode(&dir.id)?;
    Ok(())
}

/// Renames a single dirent. The update is one atomic positional
/// rewrite in the inode document; no moment exists in which both or
/// neither name is live.
pub fn rename(store: &dyn Store, old: &Path, new: &Path) -> Result<()> {
    if old.is_root() || new.is_root() || old.in_snapshot() || new.in_snapshot() {
        return Err(FsError::AccessDenied);
    }
    if !inode::exists(store, old)? {
        return Err(FsError::NotFound);
    }
    if inode::exists(store, new)? {
        return Err(FsError::Exists);
    }
    let parent = inode::get(store, new.parent())?;
    if !parent.is_dir() {
        return Err(FsError::NotDir);
    }

    match dirent::rename(store, old, new)? {
        0 => Err(FsError::NotFound),
        _ => Ok(()),
    }
}

/// The stat fabricated for `getattr`.
pub fn getattr(store: &dyn Store, path: &Path) -> Result<FileStat> {
    let inode = inode::get(store, path)?;
    Ok(FileStat::from_inode(&inode))
}
