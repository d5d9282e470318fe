//! Error types.
//!
//! Every filesystem operation returns `Result<_, FsError>`. The variants
//! correspond one-to-one with the errno values the operation surface
//! reports, so `FsError::errno` is a total mapping. Failures inside the
//! document store or block store are wrapped in [`StoreError`] and enter
//! the filesystem layer as `FsError::Io`; they are terminal for the
//! current operation and are never retried here.

use thiserror::Error;

/// Result alias used throughout the crate.
pub type Result<T, E = FsError> = core::result::Result<T, E>;

#[derive(Debug, Error)]
pub enum FsError {
    /// Path has no inode, or an expected document is missing.
    #[error("no such file or directory")]
    NotFound,

    /// Operation requires a non-directory but found a directory.
    #[error("is a directory")]
    IsDir,

    /// Operation requires a directory but found something else.
    #[error("not a directory")]
    NotDir,

    /// `rmdir` on a directory with live children.
    #[error("directory not empty")]
    NotEmpty,

    /// Permission or ownership check failed, or the target is frozen.
    #[error("permission denied")]
    AccessDenied,

    /// Create attempted at an extant path.
    #[error("file exists")]
    Exists,

    /// Allocation failed, notably while growing an extent list.
    #[error("out of memory")]
    NoMem,

    /// The underlying store reported non-OK.
    #[error(transparent)]
    Io(#[from] StoreError),
}

impl FsError {
    /// The negated errno for this error, following the UNIX convention
    /// of the operation surface.
    pub fn errno(&self) -> i32 {
        let e = match self {
            FsError::NotFound => libc::ENOENT,
            FsError::IsDir => libc::EISDIR,
            FsError::NotDir => libc::ENOTDIR,
            FsError::NotEmpty => libc::ENOTEMPTY,
            FsError::AccessDenied => libc::EACCES,
            FsError::Exists => libc::EEXIST,
            FsError::NoMem => libc::ENOMEM,
            FsError::Io(_) => libc::EIO,
        };
        -e
    }
}

/// A non-OK response from the document store or block store driver.
#[derive(Debug, Error)]
#[error("document store: {0}")]
pub struct StoreError(pub String);

impl StoreError {
    pub fn new(msg: impl Into<String>) -> Self {
        StoreError(msg.into())
    }
}

impl From<rmp_serde::encode::Error> for StoreError {
    fn from(e: rmp_serde::encode::Error) -> Self {
        StoreError(format!("encode: {}", e))
    }
}

impl From<rmp_serde::decode::Error> for StoreError {
    fn from(e: rmp_serde::decode::Error) -> Self {
        StoreError(format!("decode: {}", e))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn errno_mapping() {
        assert_eq!(FsError::NotFound.errno(), -libc::ENOENT);
        assert_eq!(FsError::NotEmpty.errno(), -libc::ENOTEMPTY);
        assert_eq!(FsError::Io(StoreError::new("down")).errno(), -libc::EIO);
    }
}
