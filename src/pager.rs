//! Summary: The page store: mmap chunks, buffered page writes, and the
//! ordered commit sequence.
//! Copyright (c) YOAB. All rights reserved.
//!
//! The file is read through a list of memory-mapped chunks, each covering
//! a contiguous page range. Chunks are only ever appended — never resized,
//! moved, or unmapped before close — so a reader holding a clone of the
//! chunk list keeps valid views for as long as it wants. Writes never go
//! through the maps: pages pend in an ordered buffer and reach the file
//! with positional writes followed by fsyncs in the order the crash model
//! requires (data, sync, meta, sync).

use std::collections::BTreeMap;
use std::fs::File;
use std::io::{self, IoSlice};
use std::os::unix::fs::FileExt;
use std::os::unix::io::AsRawFd;
use std::sync::Arc;

use log::{debug, trace};
use memmap2::{Mmap, MmapOptions};
use nix::sys::uio::pwritev;

use crate::btree::PageRead;
use crate::error::{Error, Result};
use crate::freelist::FreePageIo;
use crate::page::PAGE_SIZE;

#[cfg(feature = "failpoint")]
use crate::failpoint::{self, FailPoint};

/// Default size of the first mmap chunk; later chunks double.
pub const INITIAL_MAP_SIZE: usize = 64 << 20;

/// One mapped window over a contiguous page range.
#[derive(Clone)]
pub(crate) struct Chunk {
    start_page: u64,
    map: Arc<Mmap>,
}

impl Chunk {
    fn npages(&self) -> u64 {
        (self.map.len() / PAGE_SIZE) as u64
    }
}

/// Finds `ptr` in a chunk list. Linear scan: the list stays small because
/// chunk sizes double.
pub(crate) fn chunk_page(chunks: &[Chunk], ptr: u64) -> Option<&[u8]> {
    for chunk in chunks {
        if ptr >= chunk.start_page && ptr < chunk.start_page + chunk.npages() {
            let off = (ptr - chunk.start_page) as usize * PAGE_SIZE;
            return Some(&chunk.map[off..off + PAGE_SIZE]);
        }
    }
    None
}

/// A frozen chunk list captured at transaction begin. Keeps the maps alive
/// via `Arc` independently of the store.
pub struct SnapshotPages {
    chunks: Vec<Chunk>,
}

impl SnapshotPages {
    pub(crate) fn new(chunks: Vec<Chunk>) -> Self {
        Self { chunks }
    }
}

impl PageRead for SnapshotPages {
    fn page(&self, ptr: u64) -> &[u8] {
        chunk_page(&self.chunks, ptr)
            .unwrap_or_else(|| panic!("page {ptr} is outside the snapshot's mapped range"))
    }
}

/// The store's window onto the database file.
pub(crate) struct Pager {
    file: File,
    chunks: Vec<Chunk>,
    /// Pages durably on disk, meta page included.
    pub(crate) flushed: u64,
    /// Pages appended by the in-flight commit.
    nappend: u64,
    /// Pending page writes (fresh allocations and in-place free-list
    /// updates), keyed by page number. Reads consult this before the maps.
    updates: BTreeMap<u64, Vec<u8>>,
    /// The file was extended since the last durable sync; forces
    /// `sync_all` so the new length itself is persisted.
    grew: bool,
    initial_map: usize,
}

impl Pager {
    pub fn new(file: File, initial_map: usize) -> Self {
        Self {
            file,
            chunks: Vec::new(),
            flushed: 0,
            nappend: 0,
            updates: BTreeMap::new(),
            grew: false,
            initial_map: initial_map.max(PAGE_SIZE),
        }
    }

    pub fn set_flushed(&mut self, pages: u64) {
        self.flushed = pages;
    }

    /// Pages the next meta must declare: everything flushed plus the
    /// in-flight appends.
    pub fn total_pages(&self) -> u64 {
        self.flushed + self.nappend
    }

    pub fn has_pending(&self) -> bool {
        !self.updates.is_empty()
    }

    /// A cheap clone of the chunk list for a snapshot.
    pub fn chunks(&self) -> Vec<Chunk> {
        self.chunks.clone()
    }

    /// Reads a page, preferring the pending buffer so a transaction sees
    /// its own unflushed pages.
    pub fn page(&self, ptr: u64) -> &[u8] {
        if let Some(page) = self.updates.get(&ptr) {
            return page;
        }
        chunk_page(&self.chunks, ptr)
            .unwrap_or_else(|| panic!("page {ptr} is outside the mapped range"))
    }

    /// Buffers a full-page write at an existing page number (a recycled
    /// allocation).
    pub fn stage_write(&mut self, ptr: u64, data: Vec<u8>) {
        debug_assert_eq!(data.len(), PAGE_SIZE);
        self.updates.insert(ptr, data);
    }

    /// Assigns the next page number past the end of the file and buffers
    /// the page.
    pub fn append_page(&mut self, data: Vec<u8>) -> u64 {
        debug_assert_eq!(data.len(), PAGE_SIZE);
        let ptr = self.flushed + self.nappend;
        self.nappend += 1;
        self.updates.insert(ptr, data);
        ptr
    }

    fn mapped_bytes(&self) -> usize {
        self.chunks
            .last()
            .map(|c| c.start_page as usize * PAGE_SIZE + c.map.len())
            .unwrap_or(0)
    }

    /// Extends the file and the chunk list until `npages` pages are
    /// addressable. New chunks start at 64 MiB and double.
    pub fn ensure_mapped(&mut self, npages: u64) -> Result<()> {
        let needed = npages as usize * PAGE_SIZE;
        let mapped = self.mapped_bytes();
        if needed <= mapped {
            return Ok(());
        }
        let mut alloc = self.initial_map.max(mapped);
        while mapped + alloc < needed {
            alloc *= 2;
        }
        let new_len = (mapped + alloc) as u64;

        // Grow the file first (sparse) so the map never extends past EOF.
        let file_len = self
            .file
            .metadata()
            .map_err(|e| Error::FileWrite {
                offset: 0,
                len: 0,
                context: "reading file length before extension",
                source: e,
            })?
            .len();
        if file_len < new_len {
            self.file.set_len(new_len).map_err(|e| Error::FileWrite {
                offset: file_len,
                len: (new_len - file_len) as usize,
                context: "extending database file",
                source: e,
            })?;
            self.grew = true;
        }

        // SAFETY: the mapping is read-only and covers a range the file owns
        // for its whole lifetime; pages inside it are only written while
        // unreachable from any published root.
        let map = unsafe {
            MmapOptions::new()
                .offset(mapped as u64)
                .len(alloc)
                .map(&self.file)
        }
        .map_err(|e| Error::Mmap {
            offset: mapped as u64,
            len: alloc,
            source: e,
        })?;
        debug!(
            "mapped chunk: pages {}..{}",
            mapped / PAGE_SIZE,
            (mapped + alloc) / PAGE_SIZE
        );
        self.chunks.push(Chunk {
            start_page: (mapped / PAGE_SIZE) as u64,
            map: Arc::new(map),
        });
        Ok(())
    }

    /// Commit steps 1 and 2: write every pending page, then make the data
    /// durable. The meta page is untouched, so a failure here leaves no
    /// observable change.
    pub fn flush_data(&mut self) -> Result<()> {
        #[cfg(feature = "failpoint")]
        if failpoint::hit(FailPoint::BeforeDataWrite) {
            return Err(injected("injected failure before data write"));
        }

        self.ensure_mapped(self.flushed + self.nappend)?;
        trace!("flushing {} pending pages", self.updates.len());

        // Contiguous runs go out as one vectored write each.
        let mut run_start = 0u64;
        let mut run: Vec<&[u8]> = Vec::new();
        for (&ptr, page) in &self.updates {
            if !run.is_empty() && run_start + run.len() as u64 == ptr {
                run.push(page.as_slice());
                continue;
            }
            if !run.is_empty() {
                write_run(&self.file, run_start, &run)?;
            }
            run_start = ptr;
            run = vec![page.as_slice()];
        }
        if !run.is_empty() {
            write_run(&self.file, run_start, &run)?;
        }

        #[cfg(feature = "failpoint")]
        if failpoint::hit(FailPoint::BeforeDataSync) {
            return Err(injected("injected failure before data sync"));
        }

        if self.grew {
            // The length change is file metadata; fdatasync may skip it.
            self.file.sync_all().map_err(|e| Error::FileSync {
                context: "syncing data pages and file length",
                source: e,
            })?;
            self.grew = false;
        } else {
            fdatasync(&self.file, "syncing data pages")?;
        }
        Ok(())
    }

    /// Commit steps 3 and 4: publish the new meta page and make it
    /// durable. This is the commit point.
    pub fn write_meta(&mut self, meta: &[u8]) -> Result<()> {
        #[cfg(feature = "failpoint")]
        if failpoint::hit(FailPoint::BeforeMetaWrite) {
            return Err(injected("injected failure before meta write"));
        }

        self.file.write_all_at(meta, 0).map_err(|e| Error::FileWrite {
            offset: 0,
            len: meta.len(),
            context: "writing meta page",
            source: e,
        })?;

        #[cfg(feature = "failpoint")]
        if failpoint::hit(FailPoint::BeforeMetaSync) {
            return Err(injected("injected failure before meta sync"));
        }

        fdatasync(&self.file, "syncing meta page")
    }

    /// Absorbs a successful commit: the pending pages are now part of the
    /// durable prefix.
    pub fn finalize_commit(&mut self) {
        self.flushed += self.nappend;
        self.nappend = 0;
        self.updates.clear();
    }

    /// Discards the in-flight commit's pages.
    pub fn rollback(&mut self) {
        self.nappend = 0;
        self.updates.clear();
    }
}

impl FreePageIo for Pager {
    fn page(&self, ptr: u64) -> &[u8] {
        Pager::page(self, ptr)
    }

    /// In-place update of a free-list node: buffered like any other page,
    /// written before the meta that references it.
    fn page_mut(&mut self, ptr: u64) -> &mut [u8] {
        if !self.updates.contains_key(&ptr) {
            let copy = chunk_page(&self.chunks, ptr)
                .unwrap_or_else(|| panic!("page {ptr} is outside the mapped range"))
                .to_vec();
            self.updates.insert(ptr, copy);
        }
        self.updates.get_mut(&ptr).unwrap()
    }

    fn append(&mut self, page: Vec<u8>) -> u64 {
        self.append_page(page)
    }
}

/// A `pwritev` call accepts at most IOV_MAX buffers.
const MAX_IOV: usize = 1024;

/// Writes consecutive pages starting at `start_page` with vectored
/// writes, batching below the IOV_MAX limit.
fn write_run(file: &File, start_page: u64, pages: &[&[u8]]) -> Result<()> {
    let mut offset = start_page * PAGE_SIZE as u64;
    for batch in pages.chunks(MAX_IOV) {
        write_batch(file, offset, batch)?;
        offset += (batch.len() * PAGE_SIZE) as u64;
    }
    Ok(())
}

/// One vectored write, finishing any short write positionally.
fn write_batch(file: &File, base: u64, pages: &[&[u8]]) -> Result<()> {
    let total: usize = pages.len() * PAGE_SIZE;
    let iov: Vec<IoSlice<'_>> = pages.iter().map(|p| IoSlice::new(p)).collect();
    let written = pwritev(file, &iov, base as libc::off_t).map_err(|e| Error::FileWrite {
        offset: base,
        len: total,
        context: "commit data pages (pwritev)",
        source: io::Error::from_raw_os_error(e as i32),
    })?;
    if written >= total {
        return Ok(());
    }
    // Rare partial write on a regular file: finish page by page.
    let mut skip = written;
    let mut offset = base;
    for page in pages {
        if skip >= page.len() {
            skip -= page.len();
            offset += page.len() as u64;
            continue;
        }
        file.write_all_at(&page[skip..], offset + skip as u64)
            .map_err(|e| Error::FileWrite {
                offset,
                len: page.len() - skip,
                context: "commit data pages (resume)",
                source: e,
            })?;
        skip = 0;
        offset += page.len() as u64;
    }
    Ok(())
}

/// fdatasync on Unix, falling back to `sync_all` elsewhere. Skips the
/// file-metadata sync that `sync_all` forces.
fn fdatasync(file: &File, context: &'static str) -> Result<()> {
    #[cfg(unix)]
    {
        // SAFETY: fdatasync is a standard POSIX call, safe with a valid fd.
        let ret = unsafe { libc::fdatasync(file.as_raw_fd()) };
        if ret != 0 {
            return Err(Error::FileSync {
                context,
                source: io::Error::last_os_error(),
            });
        }
        Ok(())
    }

    #[cfg(not(unix))]
    {
        file.sync_all().map_err(|e| Error::FileSync { context, source: e })
    }
}

#[cfg(feature = "failpoint")]
fn injected(context: &'static str) -> Error {
    Error::FileSync {
        context,
        source: io::Error::other("failpoint"),
    }
}
