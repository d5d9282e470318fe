//! File metadata as reported by `getattr` and `readdir`.

use crate::fs::inode::Inode;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FileStat {
    pub mode: u32,
    /// 1 for files, 2 for directories.
    pub nlink: u32,
    pub owner: i64,
    pub group: i64,
    pub size: u64,
    pub dev: i64,
    /// Milliseconds since the epoch.
    pub created: i64,
    pub modified: i64,
    pub blocksize: u32,
}

impl FileStat {
    pub(crate) fn from_inode(inode: &Inode) -> Self {
        FileStat {
            mode: inode.mode,
            nlink: if inode.is_dir() { 2 } else { 1 },
            owner: inode.owner,
            group: inode.group,
            size: inode.size,
            dev: inode.dev,
            created: inode.created,
            modified: inode.modified,
            blocksize: inode.blocksize,
        }
    }

    pub fn is_dir(&self) -> bool {
        self.mode & libc::S_IFDIR as u32 != 0
    }
}
