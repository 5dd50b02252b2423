//! Summary: Database open/close and the shared store state.
//! Copyright (c) YOAB. All rights reserved.
//!
//! The store, the free list, and the tree form a cycle: the tree allocates
//! through the free list, the free list lives in pages of the store, and
//! the store's meta page points at both. `open` resolves it the obvious
//! way — construct the pager first, read the meta page, then wire the
//! free-list cut and the tree root from it.

use std::collections::{BTreeMap, VecDeque};
use std::fs::{File, OpenOptions};
use std::os::unix::fs::FileExt;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use fs4::fs_std::FileExt as _;
use log::{debug, warn};

use crate::btree::{BTree, PageRead, PageStore};
use crate::error::{Error, Result};
use crate::freelist::FreeList;
use crate::meta::{META_SIZE, Meta};
use crate::page::PAGE_SIZE;
use crate::pager::{INITIAL_MAP_SIZE, Pager, SnapshotPages};
use crate::tx::{ReadTx, WriteOp, WriteTx};

/// Open-time tunables.
#[derive(Debug, Clone)]
pub struct Options {
    initial_map_size: usize,
}

impl Options {
    pub fn new() -> Self {
        Self {
            initial_map_size: INITIAL_MAP_SIZE,
        }
    }

    /// Size of the first mmap chunk (and the sparse file created for it).
    /// Rounded up to a whole number of pages; later chunks double.
    pub fn initial_map_size(mut self, bytes: usize) -> Self {
        let pages = bytes.div_ceil(PAGE_SIZE).max(2);
        self.initial_map_size = pages * PAGE_SIZE;
        self
    }

    /// Opens or creates a database at `path`.
    pub fn open<P: AsRef<Path>>(&self, path: P) -> Result<Database> {
        let path = path.as_ref().to_path_buf();

        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(&path)
            .map_err(|e| Error::FileOpen {
                path: path.clone(),
                source: e,
            })?;

        // One process at a time; a stale mmap view of a file another
        // process rewrites would be silent corruption.
        file.try_lock_exclusive().map_err(|e| Error::FileLock {
            path: path.clone(),
            source: e,
        })?;

        let file_len = file
            .metadata()
            .map_err(|e| Error::FileMetadata {
                path: path.clone(),
                source: e,
            })?
            .len();

        let meta = if file_len == 0 {
            init_store(&file, &path)?
        } else {
            load_meta(&file, file_len)?
        };

        let mut pager = Pager::new(file, self.initial_map_size);
        pager.set_flushed(meta.page_used);
        pager.ensure_mapped(meta.page_used)?;

        let free = FreeList::new(
            meta.free_head_page,
            meta.free_head_seq,
            meta.free_tail_page,
            meta.free_tail_seq,
        );
        debug!(
            "opened '{}': root={} pages={} free_items={}",
            path.display(),
            meta.root,
            meta.page_used,
            free.items()
        );

        let inner = StoreInner {
            pager,
            free,
            root: meta.root,
            version: 0,
            history: VecDeque::new(),
            marks: VecDeque::new(),
            failed: false,
            stats: AllocStats::default(),
        };
        Ok(Database {
            shared: Arc::new(DbShared {
                path,
                state: Mutex::new(inner),
                readers: Mutex::new(ReaderTable::default()),
            }),
        })
    }
}

impl Default for Options {
    fn default() -> Self {
        Self::new()
    }
}

/// Writes the initial meta page and the free-list placeholder node, then
/// makes the new file durable (directory entry included).
fn init_store(file: &File, path: &Path) -> Result<Meta> {
    let meta = Meta::new();
    let zero = [0u8; PAGE_SIZE];
    file.write_all_at(&zero, PAGE_SIZE as u64)
        .map_err(|e| Error::FileWrite {
            offset: PAGE_SIZE as u64,
            len: PAGE_SIZE,
            context: "writing initial free-list node",
            source: e,
        })?;
    file.write_all_at(&meta.to_bytes(), 0)
        .map_err(|e| Error::FileWrite {
            offset: 0,
            len: META_SIZE,
            context: "writing initial meta page",
            source: e,
        })?;
    file.sync_all().map_err(|e| Error::FileSync {
        context: "syncing initial pages",
        source: e,
    })?;
    sync_parent_dir(path)?;
    Ok(meta)
}

/// Reads and validates the meta page of an existing file.
fn load_meta(file: &File, file_len: u64) -> Result<Meta> {
    let mut buf = [0u8; META_SIZE];
    file.read_exact_at(&mut buf, 0).map_err(|e| Error::FileRead {
        offset: 0,
        len: META_SIZE,
        context: "reading meta page",
        source: e,
    })?;
    let Some(meta) = Meta::from_bytes(&buf) else {
        return Err(Error::Corrupted {
            context: "loading meta page",
            details: "bad signature or checksum".to_string(),
        });
    };
    let file_pages = file_len / PAGE_SIZE as u64;
    if !meta.validate(file_pages) {
        return Err(Error::Corrupted {
            context: "loading meta page",
            details: format!(
                "inconsistent meta: root={} pages={} file_pages={file_pages}",
                meta.root, meta.page_used
            ),
        });
    }
    Ok(meta)
}

/// Persists the creation of a fresh database file.
fn sync_parent_dir(path: &Path) -> Result<()> {
    let parent = match path.parent() {
        Some(p) if !p.as_os_str().is_empty() => p.to_path_buf(),
        _ => PathBuf::from("."),
    };
    let dir = File::open(&parent).map_err(|e| Error::FileOpen {
        path: parent.clone(),
        source: e,
    })?;
    dir.sync_all().map_err(|e| Error::FileSync {
        context: "syncing parent directory",
        source: e,
    })
}

/// Counters for where tree allocations came from.
#[derive(Debug, Default, Clone, Copy)]
pub struct AllocStats {
    /// Pages recycled from the free list.
    pub reused: u64,
    /// Pages appended to the file.
    pub appended: u64,
}

/// A point-in-time snapshot of store internals.
#[derive(Debug, Clone, Copy)]
pub struct Stats {
    /// Commits since open.
    pub version: u64,
    /// Pages durably on disk, meta page included.
    pub flushed_pages: u64,
    /// Items queued in the free list.
    pub free_items: u64,
    /// Free-list items on the consumable side of the fence.
    pub free_available: u64,
    pub alloc: AllocStats,
}

/// One committed transaction's write set, kept for conflict detection.
pub(crate) struct CommittedTx {
    pub(crate) version: u64,
    /// Sorted user keys.
    pub(crate) writes: Vec<Vec<u8>>,
}

/// Free-list fence bookkeeping: pages freed by `version` become
/// recyclable once no live transaction predates it.
pub(crate) struct FreeMark {
    pub(crate) version: u64,
    pub(crate) tail_seq: u64,
}

/// Live transaction versions, reference counted. The oldest live version
/// gates both free-list recycling and history truncation.
#[derive(Default)]
pub(crate) struct ReaderTable {
    live: BTreeMap<u64, usize>,
}

impl ReaderTable {
    pub(crate) fn checkout(&mut self, version: u64) {
        *self.live.entry(version).or_insert(0) += 1;
    }

    pub(crate) fn checkin(&mut self, version: u64) {
        let count = self
            .live
            .get_mut(&version)
            .expect("transaction version was never checked out");
        *count -= 1;
        if *count == 0 {
            self.live.remove(&version);
        }
    }

    pub(crate) fn oldest(&self) -> Option<u64> {
        self.live.keys().next().copied()
    }
}

pub(crate) struct DbShared {
    pub(crate) path: PathBuf,
    pub(crate) state: Mutex<StoreInner>,
    pub(crate) readers: Mutex<ReaderTable>,
}

pub(crate) struct StoreInner {
    pub(crate) pager: Pager,
    pub(crate) free: FreeList,
    pub(crate) root: u64,
    pub(crate) version: u64,
    pub(crate) history: VecDeque<CommittedTx>,
    pub(crate) marks: VecDeque<FreeMark>,
    pub(crate) failed: bool,
    pub(crate) stats: AllocStats,
}

impl StoreInner {
    /// Advances the free-list fence as far as the oldest live transaction
    /// allows. With no live transactions this degenerates to "everything
    /// freed so far is consumable".
    pub(crate) fn advance_free_fence(&mut self, oldest_live: Option<u64>) {
        let min_live = oldest_live.unwrap_or(self.version);
        let mut fence = None;
        while let Some(mark) = self.marks.front() {
            if mark.version <= min_live {
                fence = Some(mark.tail_seq);
                self.marks.pop_front();
            } else {
                break;
            }
        }
        if let Some(seq) = fence {
            self.free.set_max_seq(seq);
        }
    }

    /// Applies buffered writes to the durable tree, then runs the ordered
    /// write sequence: data pages, fsync, meta page, fsync.
    ///
    /// On a data-phase failure everything is reverted and the store stays
    /// usable. On a meta-phase failure the store enters the sticky failed
    /// state: the in-memory image reverts to the last durable meta, reads
    /// keep working, and writes are refused until reopen.
    pub(crate) fn apply_and_flush(&mut self, ops: &[(Vec<u8>, WriteOp)]) -> Result<()> {
        let saved_root = self.root;
        let saved_free = self.free;

        let mut tree = BTree { root: self.root };
        {
            let mut pages = StorePages {
                pager: &mut self.pager,
                free: &mut self.free,
                stats: &mut self.stats,
            };
            for (key, op) in ops {
                match op {
                    WriteOp::Put(val) => tree.insert(&mut pages, key, val),
                    WriteOp::Delete => {
                        tree.delete(&mut pages, key);
                    }
                }
            }
        }
        self.root = tree.root;

        if !self.pager.has_pending() && self.root == saved_root {
            return Ok(()); // no-op writes touched nothing
        }

        if let Err(e) = self.pager.flush_data() {
            self.root = saved_root;
            self.free = saved_free;
            self.pager.rollback();
            return Err(e);
        }

        let meta = Meta {
            root: self.root,
            page_used: self.pager.total_pages(),
            free_head_page: self.free.head_page,
            free_head_seq: self.free.head_seq,
            free_tail_page: self.free.tail_page,
            free_tail_seq: self.free.tail_seq,
        };
        if let Err(e) = self.pager.write_meta(&meta.to_bytes()) {
            // Past the data fsync: the durable state is still the old
            // meta, so serve that and refuse further writes.
            self.root = saved_root;
            self.free = saved_free;
            self.pager.rollback();
            self.failed = true;
            warn!("meta write failed; store is now read-only: {e}");
            return Err(e);
        }
        self.pager.finalize_commit();
        Ok(())
    }
}

/// The page provider the tree sees during commit: allocations recycle
/// from the free list before extending the file, and frees queue behind
/// the fence.
struct StorePages<'a> {
    pager: &'a mut Pager,
    free: &'a mut FreeList,
    stats: &'a mut AllocStats,
}

impl PageRead for StorePages<'_> {
    fn page(&self, ptr: u64) -> &[u8] {
        self.pager.page(ptr)
    }
}

impl PageStore for StorePages<'_> {
    fn alloc(&mut self, node: &[u8]) -> u64 {
        let recycled = self.free.pop_head(&mut *self.pager);
        if recycled != 0 {
            self.stats.reused += 1;
            self.pager.stage_write(recycled, node.to_vec());
            return recycled;
        }
        self.stats.appended += 1;
        self.pager.append_page(node.to_vec())
    }

    fn dealloc(&mut self, ptr: u64) {
        self.free.push_tail(&mut *self.pager, ptr);
    }
}

/// The main database handle.
///
/// Cheap to clone conceptually — transactions hold their own `Arc` to the
/// shared state — but exposed as a single owner; share it behind your own
/// `Arc` if multiple threads need to begin transactions.
///
/// # Concurrency
///
/// - Any number of read transactions run concurrently with writers.
/// - Write transactions buffer privately and serialize only inside
///   `commit`; conflicting commits fail rather than block.
pub struct Database {
    shared: Arc<DbShared>,
}

impl Database {
    /// Opens a database at `path` with default options, creating the file
    /// if needed.
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self> {
        Options::new().open(path)
    }

    /// Returns the path to the database file.
    pub fn path(&self) -> &Path {
        &self.shared.path
    }

    /// Begins a read-only transaction observing the latest committed
    /// version.
    pub fn begin_read(&self) -> ReadTx {
        let state = self.shared.state.lock().unwrap();
        let root = state.root;
        let version = state.version;
        let pages = SnapshotPages::new(state.pager.chunks());
        // Registered under the state lock so no commit can fence this
        // version away in between.
        self.shared.readers.lock().unwrap().checkout(version);
        drop(state);
        ReadTx::new(self.shared.clone(), root, version, pages)
    }

    /// Begins a read-write transaction.
    ///
    /// # Errors
    ///
    /// [`Error::StoreFailed`] if a previous commit failed at the meta
    /// phase and the store is read-only.
    pub fn begin_write(&self) -> Result<WriteTx> {
        let state = self.shared.state.lock().unwrap();
        if state.failed {
            return Err(Error::StoreFailed);
        }
        let root = state.root;
        let version = state.version;
        let pages = SnapshotPages::new(state.pager.chunks());
        self.shared.readers.lock().unwrap().checkout(version);
        drop(state);
        Ok(WriteTx::new(self.shared.clone(), root, version, pages))
    }

    /// Store internals for tests and monitoring.
    pub fn stats(&self) -> Stats {
        let state = self.shared.state.lock().unwrap();
        Stats {
            version: state.version,
            flushed_pages: state.pager.flushed,
            free_items: state.free.items(),
            free_available: state.free.available(),
            alloc: state.stats,
        }
    }

    /// Closes this handle. Outstanding transactions keep the underlying
    /// file and maps alive until they drop; the file lock releases with
    /// the last of them.
    pub fn close(self) {
        drop(self);
    }
}
