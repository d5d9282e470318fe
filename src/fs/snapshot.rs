//! The snapshot engine.
//!
//! Every directory `D` carries a `.snapshot` child. Creating a
//! generation freezes the files directly under `D` into
//! `D/.snapshot/<g>/`: each file's blocks are rebound, in
//! `BLOCKS_PER_MAP`-block batches, to a freshly allocated inode id that
//! is committed under the generation path. No block bytes are copied;
//! the live file and the generation share blocks through the block
//! store refcounts, and because the frozen copy owns its own extent
//! documents, later writes supersede only the live ones. Directories
//! under `D` are skipped; their contents freeze when a generation is
//! taken inside them.
//!
//! When `rmdir` removes a directory it must not discard the history
//! below it: the whole `.snapshot` subtree is orphaned into the nearest
//! still-live ancestor's `.snapshot` as `orphaned-<name>/…`, keeping
//! ids and blocks untouched.
//!
//! Each frozen or orphaned inode commits independently and commits
//! replace by id, so a failed run leaves individually consistent
//! documents and a retry converges.

use std::collections::BTreeMap;

use crate::block::{BlockMap, BlockStore};
use crate::db::{ObjectId, Store};
use crate::error::{FsError, Result};
use crate::fs::dirent::{self, filename};
use crate::fs::inode::{self, Inode};
use crate::fs::path::Path;
use crate::fs::{extent, FsConfig};
use crate::param::{BLOCKS_PER_MAP, SNAPSHOT_NAME};

/// Creates a new generation for the directory containing `path` (the
/// root snapshots itself) and freezes its files into it. Returns the
/// generation number.
pub fn snapshot_dir(
    store: &dyn Store,
    blocks: &dyn BlockStore,
    cfg: &FsConfig,
    path: &Path,
    mode: u32,
) -> Result<u32> {
    let dir = if path.is_root() { path } else { path.parent() };
    let dp = inode::get(store, dir)?;
    if !dp.is_dir() {
        return Err(FsError::NotDir);
    }

    let pattern = format!("^{}/\\.snapshot/\\d+$", regex::escape(dir.prefix()));
    let generation = store.count_matching(&pattern)? as u32 + 1;

    let gen_path = format!("{}/{}/{}", dir.prefix(), SNAPSHOT_NAME, generation);
    inode::create(
        store,
        Path::new(&gen_path)?,
        mode | libc::S_IFDIR as u32,
        cfg,
        None,
    )?;
    log::debug!("snapshot {} generation {}", dir, generation);

    dirent::read_dirents(store, dir, |child| {
        freeze(store, blocks, child, dir.prefix(), generation)
    })?;
    Ok(generation)
}

/// Freezes one live inode into generation `g` under `prefix`.
/// Directories are skipped; snapshots capture file contents, not
/// redundant directory entries.
fn freeze(
    store: &dyn Store,
    blocks: &dyn BlockStore,
    ip: &mut Inode,
    prefix: &str,
    generation: u32,
) -> Result<()> {
    if ip.is_dir() {
        return Ok(());
    }

    let newid = ObjectId::new();
    let bs = ip.blocksize as u64;
    let window = BLOCKS_PER_MAP as u64 * bs;

    let mut off = 0;
    while off < ip.size {
        let span = window.min(ip.size - off);
        let held = extent::deserialize(store, &ip.id, off, span)?;

        // Overlapping runs shadow each other; only the per-block
        // winners are what the inode currently owns.
        let mut winners: BTreeMap<u64, extent::ExtentEntry> = BTreeMap::new();
        for entry in held.iter() {
            winners.insert(entry.off, *entry);
        }

        let mut map = BlockMap::new(ip.id, off);
        for (entry_off, entry) in &winners {
            if let Some(hash) = entry.hash {
                map.insert(((entry_off - off) / bs) as u16, entry.len, hash);
            }
        }
        map.set_inode(newid);
        commit_map(store, blocks, &map, ip.blocksize)?;
        off += window;
    }

    let name = filename(ip.path());
    let frozen = Inode {
        id: newid,
        dirents: vec![format!(
            "{}/{}/{}/{}",
            prefix, SNAPSHOT_NAME, generation, name
        )],
        lock: None,
        ..ip.clone()
    };
    inode::commit(store, &frozen)
}

/// Commits one rebound block map: takes a reference to every dirty
/// block for the map's owner, then serializes the owner's extents for
/// the window.
fn commit_map(
    store: &dyn Store,
    blocks: &dyn BlockStore,
    map: &BlockMap,
    blocksize: u32,
) -> Result<()> {
    if map.is_empty() {
        return Ok(());
    }
    let mut list = extent::ExtentList::new();
    for (off, len, hash) in map.iter_dirty(blocksize) {
        blocks.incref(hash)?;
        list.insert_hash(off, len, *hash)?;
    }
    extent::serialize(store, blocks, map.inode(), &mut list)
}

/// Relocates the `.snapshot` subtree of the directory being removed
/// beneath the `.snapshot` of its parent, as
/// `orphaned-<removed name>/<original layout>`. Ids and blocks are
/// untouched; only canonical dirents are rewritten.
pub(crate) fn orphan(store: &dyn Store, snap: &mut Inode, removed: &Path) -> Result<()> {
    let snap_root = format!("{}/{}", removed.prefix(), SNAPSHOT_NAME);
    let new_root = format!(
        "{}/{}/orphaned-{}",
        removed.parent().prefix(),
        SNAPSHOT_NAME,
        removed.file_name()
    );
    orphan_rec(store, snap, &snap_root, &new_root)
}

fn orphan_rec(store: &dyn Store, ip: &mut Inode, snap_root: &str, new_root: &str) -> Result<()> {
    let canonical = ip.path().to_string();

    // Children first: they are still reachable under the old paths.
    if ip.is_dir() {
        dirent::read_dirents(store, Path::new(&canonical)?, |child| {
            orphan_rec(store, child, snap_root, new_root)
        })?;
    }

    let tail = canonical.strip_prefix(snap_root).unwrap_or("");
    ip.dirents[0] = format!("{}{}", new_root, tail);
    log::debug!("orphan {} -> {}", canonical, ip.dirents[0]);
    inode::commit(store, ip)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::block::MemBlockStore;
    use crate::db::MemStore;
    use crate::fs::readwrite;

    fn path(s: &str) -> &Path {
        Path::new(s).unwrap()
    }

    fn setup() -> (MemStore, MemBlockStore, FsConfig) {
        let store = MemStore::new();
        let blocks = MemBlockStore::new();
        let cfg = FsConfig::default();
        inode::create(&store, path("/"), libc::S_IFDIR as u32 | 0o755, &cfg, None).unwrap();
        inode::create(
            &store,
            path("/.snapshot"),
            libc::S_IFDIR as u32 | 0o755,
            &cfg,
            None,
        )
        .unwrap();
        (store, blocks, cfg)
    }

    fn write_file(store: &MemStore, blocks: &MemBlockStore, cfg: &FsConfig, p: &str, data: &[u8]) {
        if !inode::exists(store, path(p)).unwrap() {
            inode::create(store, path(p), libc::S_IFREG as u32 | 0o644, cfg, None).unwrap();
        }
        let mut ip = inode::get(store, path(p)).unwrap();
        readwrite::write(store, blocks, &mut ip, data, 0).unwrap();
    }

    fn read_all(store: &MemStore, blocks: &MemBlockStore, p: &str) -> Vec<u8> {
        let mut ip = inode::get(store, path(p)).unwrap();
        let mut buf = vec![0u8; ip.size as usize];
        let n = readwrite::read(store, blocks, &mut ip, &mut buf, 0).unwrap();
        buf.truncate(n);
        buf
    }

    #[test]
    fn generation_captures_file_bytes() {
        let (store, blocks, cfg) = setup();
        write_file(&store, &blocks, &cfg, "/f", b"v1");

        let g = snapshot_dir(&store, &blocks, &cfg, path("/"), 0o755).unwrap();
        assert_eq!(g, 1);

        write_file(&store, &blocks, &cfg, "/f", b"v2");
        assert_eq!(read_all(&store, &blocks, "/f"), b"v2");
        assert_eq!(read_all(&store, &blocks, "/.snapshot/1/f"), b"v1");
    }

    #[test]
    fn generations_number_sequentially() {
        let (store, blocks, cfg) = setup();
        write_file(&store, &blocks, &cfg, "/f", b"a");
        assert_eq!(snapshot_dir(&store, &blocks, &cfg, path("/"), 0o755).unwrap(), 1);
        assert_eq!(snapshot_dir(&store, &blocks, &cfg, path("/"), 0o755).unwrap(), 2);
        assert!(inode::exists(&store, path("/.snapshot/2/f")).unwrap());
    }

    #[test]
    fn frozen_blocks_are_shared_not_copied() {
        let (store, blocks, cfg) = setup();
        write_file(&store, &blocks, &cfg, "/f", &[9u8; 4096]);
        assert_eq!(blocks.len(), 1);

        snapshot_dir(&store, &blocks, &cfg, path("/"), 0o755).unwrap();
        assert_eq!(blocks.len(), 1);

        let h = crate::block::BlockHash::of(&[9u8; 4096]);
        assert_eq!(blocks.refcount(&h), 2);

        // Overwriting the live file releases only the live reference.
        write_file(&store, &blocks, &cfg, "/f", &[8u8; 4096]);
        assert_eq!(blocks.refcount(&h), 1);
        assert_eq!(read_all(&store, &blocks, "/.snapshot/1/f"), vec![9u8; 4096]);
    }

    #[test]
    fn snapshot_skips_directories_and_leaves_live_paths() {
        let (store, blocks, cfg) = setup();
        inode::create(&store, path("/d"), libc::S_IFDIR as u32 | 0o755, &cfg, None).unwrap();
        write_file(&store, &blocks, &cfg, "/f", b"x");

        snapshot_dir(&store, &blocks, &cfg, path("/"), 0o755).unwrap();
        assert!(inode::exists(&store, path("/f")).unwrap());
        assert!(inode::exists(&store, path("/d")).unwrap());
        assert!(!inode::exists(&store, path("/.snapshot/1/d")).unwrap());
    }

    #[test]
    fn orphan_rewrites_subtree_paths() {
        let (store, blocks, cfg) = setup();
        inode::create(&store, path("/d"), libc::S_IFDIR as u32 | 0o755, &cfg, None).unwrap();
        inode::create(
            &store,
            path("/d/.snapshot"),
            libc::S_IFDIR as u32 | 0o755,
            &cfg,
            None,
        )
        .unwrap();
        write_file(&store, &blocks, &cfg, "/d/f", b"kept");
        snapshot_dir(&store, &blocks, &cfg, path("/d/f"), 0o755).unwrap();

        let mut snap = inode::get(&store, path("/d/.snapshot")).unwrap();
        orphan(&store, &mut snap, path("/d")).unwrap();

        assert!(inode::exists(&store, path("/.snapshot/orphaned-d")).unwrap());
        assert!(inode::exists(&store, path("/.snapshot/orphaned-d/1")).unwrap());
        assert_eq!(
            read_all(&store, &blocks, "/.snapshot/orphaned-d/1/f"),
            b"kept"
        );
        assert!(!inode::exists(&store, path("/d/.snapshot")).unwrap());
    }

    #[test]
    fn freeze_captures_winners_of_shadowed_runs() {
        let (store, blocks, cfg) = setup();
        // The sparse-extended first write leaves one document holding a
        // hole plus a tail block; rewriting the tail shadows that
        // document's block entry without deleting the document.
        write_file(&store, &blocks, &cfg, "/f", b"");
        let mut ip = inode::get(&store, path("/f")).unwrap();
        readwrite::write(&store, &blocks, &mut ip, &[b'x'; 4096], 8192).unwrap();
        let mut ip = inode::get(&store, path("/f")).unwrap();
        readwrite::write(&store, &blocks, &mut ip, &[b'y'; 4096], 8192).unwrap();

        snapshot_dir(&store, &blocks, &cfg, path("/"), 0o755).unwrap();

        let frozen = read_all(&store, &blocks, "/.snapshot/1/f");
        assert_eq!(frozen.len(), 12288);
        assert!(frozen[..8192].iter().all(|&b| b == 0));
        assert!(frozen[8192..].iter().all(|&b| b == b'y'));

        // One reference per referencing document: the shadowed block is
        // still held by the surviving live document, the winner by the
        // live rewrite plus the generation.
        let x = crate::block::BlockHash::of(&[b'x'; 4096]);
        let y = crate::block::BlockHash::of(&[b'y'; 4096]);
        assert_eq!(blocks.refcount(&x), 1);
        assert_eq!(blocks.refcount(&y), 2);

        let live = read_all(&store, &blocks, "/f");
        assert!(live[8192..].iter().all(|&b| b == b'y'));
    }

    #[test]
    fn large_files_freeze_in_windows() {
        let (store, blocks, cfg) = setup();
        // Two map windows with distinct block content.
        let bs = cfg.blocksize as u64;
        let size = (BLOCKS_PER_MAP as u64 + 2) * bs;
        let mut ip = {
            inode::create(&store, path("/big"), libc::S_IFREG as u32 | 0o644, &cfg, None).unwrap();
            inode::get(&store, path("/big")).unwrap()
        };
        // Sparse in the middle: only first and last block carry bytes.
        readwrite::write(&store, &blocks, &mut ip, &[1u8; 4096], 0).unwrap();
        let mut ip = inode::get(&store, path("/big")).unwrap();
        readwrite::write(&store, &blocks, &mut ip, &[2u8; 4096], size - bs).unwrap();

        snapshot_dir(&store, &blocks, &cfg, path("/"), 0o755).unwrap();

        let mut snap = inode::get(&store, path("/.snapshot/1/big")).unwrap();
        assert_eq!(snap.size, size);
        let mut buf = vec![0u8; 4096];
        readwrite::read(&store, &blocks, &mut snap, &mut buf, size - bs).unwrap();
        assert_eq!(buf, vec![2u8; 4096]);
        let mut buf = vec![0xffu8; 4096];
        readwrite::read(&store, &blocks, &mut snap, &mut buf, bs).unwrap();
        assert_eq!(buf, vec![0u8; 4096]);
    }
}
