//! docfs: a POSIX-style user-space filesystem whose persistent state
//! lives in a document store.
//!
//! Files are decomposed into fixed-size blocks, blocks are
//! content-addressed by cryptographic hash so identical content is
//! stored once, and block membership is grouped into extents, which are
//! contiguous runs persisted as immutable documents. Every directory
//! carries a reserved `.snapshot` child under which point-in-time
//! generations of its files are frozen by rebinding block ownership
//! instead of copying data; removing a directory parks its history
//! beneath the nearest surviving ancestor's `.snapshot`.
//!
//! The crate is storage-agnostic at two seams: the [`Store`] trait is
//! the document-database driver contract, and the [`BlockStore`] trait
//! is the refcounted block cache contract. In-process implementations
//! of both back the test suite and small deployments.
//!
//! [`DocFs`] is the entry point; see the `fs` module for the operation
//! surface.

#![deny(rust_2018_idioms)]
#![deny(unused_must_use)]

mod block;
mod db;
mod error;
mod fs;
mod param;
mod stats;

pub use block::{BlockHash, BlockMap, BlockStore, MemBlockStore};
pub use db::{BlockEntry, ExtentDoc, InodeDoc, LockDoc, MemStore, ObjectId, Store};
pub use error::{FsError, Result, StoreError};
pub use fs::{AccessMode, DirEntry, DocFs, FileStat, FsConfig, Path};
pub use param::{BLOCKS_PER_MAP, DEFAULT_BLOCKSIZE, HASH_LEN, SNAPSHOT_NAME};
pub use stats::BlockStats;
