//! Absolute filesystem paths.
//!
//! Dirent strings are absolute, slash-separated, and carry no trailing
//! or doubled slashes: they match `^/([^/]+/)*[^/]+$`, or are exactly
//! `/` for the root. [`Path`] is a borrowed wrapper that upholds that
//! shape, so the layers above never re-validate.

use std::fmt;

use crate::error::{FsError, Result};
use crate::param::SNAPSHOT_NAME;

#[derive(PartialEq, Eq)]
#[repr(transparent)]
pub struct Path {
    // Invariant: either exactly "/", or starts with '/' and consists of
    // one or more non-empty components separated by single slashes with
    // no trailing slash.
    inner: str,
}

impl Path {
    /// Wraps `s`, verifying the dirent path shape. A malformed path can
    /// name nothing, so the failure is `NotFound`.
    pub fn new(s: &str) -> Result<&Self> {
        if s == "/" {
            return Ok(Self::wrap(s));
        }
        let mut rest = match s.strip_prefix('/') {
            Some(rest) => rest,
            None => return Err(FsError::NotFound),
        };
        if rest.is_empty() {
            return Err(FsError::NotFound);
        }
        while let Some(cut) = rest.find('/') {
            if cut == 0 {
                return Err(FsError::NotFound);
            }
            rest = &rest[cut + 1..];
        }
        if rest.is_empty() {
            return Err(FsError::NotFound);
        }
        Ok(Self::wrap(s))
    }

    fn wrap(s: &str) -> &Self {
        // SAFETY: `&Path` is layout-compatible with `str` because of its
        // attribute `#[repr(transparent)]`.
        unsafe { &*(s as *const str as *const Self) }
    }

    pub fn as_str(&self) -> &str {
        &self.inner
    }

    pub fn is_root(&self) -> bool {
        &self.inner == "/"
    }

    /// The path with the root spelled as the empty string, which is the
    /// prefix form used to build child paths and directory scans.
    pub fn prefix(&self) -> &str {
        if self.is_root() {
            ""
        } else {
            &self.inner
        }
    }

    /// The last component; empty for the root.
    pub fn file_name(&self) -> &str {
        match self.inner.rfind('/') {
            Some(cut) => &self.inner[cut + 1..],
            None => "",
        }
    }

    /// The enclosing directory; the root is its own parent.
    pub fn parent(&self) -> &Self {
        match self.inner.rfind('/') {
            Some(0) if self.inner.len() > 1 => Self::wrap("/"),
            Some(cut) if cut > 0 => Self::wrap(&self.inner[..cut]),
            _ => Self::wrap("/"),
        }
    }

    /// The path of `name` directly beneath this directory.
    pub fn join(&self, name: &str) -> String {
        format!("{}/{}", self.prefix(), name)
    }

    /// True if any component is the reserved snapshot name, i.e. the
    /// path names the snapshot anchor itself or something frozen
    /// beneath one.
    pub fn in_snapshot(&self) -> bool {
        !self.is_root() && self.inner[1..].split('/').any(|c| c == SNAPSHOT_NAME)
    }
}

impl fmt::Display for Path {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.inner)
    }
}

impl fmt::Debug for Path {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Path({})", &self.inner)
    }
}

impl AsRef<Path> for Path {
    fn as_ref(&self) -> &Path {
        self
    }
}
