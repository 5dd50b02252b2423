//! Summary: Snapshot-isolated read and write transactions.
//! Copyright (c) YOAB. All rights reserved.
//!
//! A transaction captures the root pointer and chunk list at begin and
//! never takes a lock while running. Writes buffer into a private
//! in-memory tree (the same B+ tree code over a vector-backed provider)
//! with values tagged updated or deleted; reads consult the buffer first,
//! then the snapshot. Commit re-enters the store lock, checks the
//! transaction's read ranges against concurrently committed write sets,
//! applies the buffer to the durable tree, and publishes it with a single
//! meta-page rewrite.

use std::sync::Arc;

use log::debug;

use crate::btree::{BTree, MemPages};
use crate::db::{CommittedTx, DbShared, FreeMark};
use crate::error::{Error, Result};
use crate::iter::{KvIter, RangeIter, Scan, SeekCmp, TreeIter};
use crate::page::{MAX_KEY_SIZE, MAX_VAL_SIZE};
use crate::pager::SnapshotPages;

/// Pending-tree value tag: the key is deleted in this transaction.
const FLAG_DELETED: u8 = 1;
/// Pending-tree value tag: the key is set in this transaction.
const FLAG_UPDATED: u8 = 2;

/// One buffered mutation, keyed by the user key.
pub(crate) enum WriteOp {
    Put(Vec<u8>),
    Delete,
}

/// A key range read by a transaction; `stop: None` is unbounded above and
/// an empty `start` is unbounded below.
#[derive(Debug, Clone)]
pub(crate) struct KeyRange {
    pub start: Vec<u8>,
    pub stop: Option<Vec<u8>>,
}

/// True if any read range contains any written key. `writes` must be
/// sorted; each range costs one binary search.
pub(crate) fn ranges_overlap(reads: &[KeyRange], writes: &[Vec<u8>]) -> bool {
    for range in reads {
        let idx = writes.partition_point(|w| w.as_slice() < range.start.as_slice());
        if idx >= writes.len() {
            continue;
        }
        match &range.stop {
            None => return true,
            Some(stop) => {
                if writes[idx].as_slice() <= stop.as_slice() {
                    return true;
                }
            }
        }
    }
    false
}

/// A read-only transaction: a frozen view of one committed version.
///
/// Never blocks writers and is never blocked. Holding one pins the pages
/// of its version: the free list will not recycle them until the
/// transaction drops.
pub struct ReadTx {
    shared: Arc<DbShared>,
    version: u64,
    root: BTree,
    pages: SnapshotPages,
}

impl ReadTx {
    pub(crate) fn new(shared: Arc<DbShared>, root: u64, version: u64, pages: SnapshotPages) -> Self {
        Self {
            shared,
            version,
            root: BTree { root },
            pages,
        }
    }

    /// The committed version this transaction observes.
    pub fn version(&self) -> u64 {
        self.version
    }

    /// Retrieves the value for `key`, or `None` if absent.
    pub fn get(&self, key: &[u8]) -> Option<Vec<u8>> {
        self.root.get(&self.pages, key).map(<[u8]>::to_vec)
    }

    /// Positions a cursor relative to `key`.
    pub fn seek(&self, key: &[u8], cmp: SeekCmp) -> TreeIter<'_, SnapshotPages> {
        self.root.seek(&self.pages, key, cmp)
    }

    /// Runs a bounded range scan.
    pub fn scan(&self, scan: &Scan) -> RangeIter<TreeIter<'_, SnapshotPages>> {
        assert!(scan.is_well_formed(), "scan comparators must oppose each other");
        let inner = self.root.seek(&self.pages, &scan.key1, scan.cmp1);
        RangeIter::new(inner, scan.cmp2, scan.key2.clone())
    }
}

impl Drop for ReadTx {
    fn drop(&mut self) {
        self.shared.readers.lock().unwrap().checkin(self.version);
    }
}

/// A read-write transaction.
///
/// Mutations stay thread-local until [`WriteTx::commit`]; dropping the
/// transaction discards them. Multiple write transactions may run
/// concurrently; the first committer wins and later conflicting commits
/// fail with [`Error::Conflict`].
pub struct WriteTx {
    shared: Arc<DbShared>,
    version: u64,
    snap_root: BTree,
    snap: SnapshotPages,
    mem: MemPages,
    pending: BTree,
    reads: Vec<KeyRange>,
    done: bool,
}

impl WriteTx {
    pub(crate) fn new(shared: Arc<DbShared>, root: u64, version: u64, snap: SnapshotPages) -> Self {
        Self {
            shared,
            version,
            snap_root: BTree { root },
            snap,
            mem: MemPages::new(),
            pending: BTree::new(),
            reads: Vec::new(),
            done: false,
        }
    }

    /// The committed version this transaction's snapshot observes.
    pub fn version(&self) -> u64 {
        self.version
    }

    /// Retrieves `key`, seeing this transaction's own writes first.
    pub fn get(&self, key: &[u8]) -> Option<Vec<u8>> {
        if let Some(tagged) = self.pending.get(&self.mem, key) {
            return match tagged[0] {
                FLAG_UPDATED => Some(tagged[1..].to_vec()),
                _ => None, // deleted in this transaction
            };
        }
        self.snap_root.get(&self.snap, key).map(<[u8]>::to_vec)
    }

    /// Buffers an insert or update.
    pub fn set(&mut self, key: &[u8], val: &[u8]) -> Result<()> {
        if key.len() > MAX_KEY_SIZE {
            return Err(Error::InputTooLarge {
                what: "key",
                len: key.len(),
                max: MAX_KEY_SIZE,
            });
        }
        if val.len() > MAX_VAL_SIZE {
            return Err(Error::InputTooLarge {
                what: "value",
                len: val.len(),
                max: MAX_VAL_SIZE,
            });
        }
        let mut tagged = Vec::with_capacity(val.len() + 1);
        tagged.push(FLAG_UPDATED);
        tagged.extend_from_slice(val);
        self.pending.insert(&mut self.mem, key, &tagged);
        Ok(())
    }

    /// Buffers a delete. Returns whether the key was visible beforehand.
    pub fn del(&mut self, key: &[u8]) -> Result<bool> {
        if key.len() > MAX_KEY_SIZE {
            return Err(Error::InputTooLarge {
                what: "key",
                len: key.len(),
                max: MAX_KEY_SIZE,
            });
        }
        let existed = self.get(key).is_some();
        self.pending.insert(&mut self.mem, key, &[FLAG_DELETED]);
        Ok(existed)
    }

    /// Positions a merged cursor (pending writes over the snapshot)
    /// relative to `key`. The reachable half-range is recorded for commit
    /// time conflict detection.
    pub fn seek(&mut self, key: &[u8], cmp: SeekCmp) -> TxIter<'_> {
        let range = if cmp.forward() {
            KeyRange {
                start: key.to_vec(),
                stop: None,
            }
        } else {
            KeyRange {
                start: Vec::new(),
                stop: Some(key.to_vec()),
            }
        };
        self.reads.push(range);
        TxIter::seek(&self.mem, self.pending, &self.snap, self.snap_root, key, cmp)
    }

    /// Runs a bounded range scan; the bounds are recorded as a read range.
    pub fn scan(&mut self, scan: &Scan) -> RangeIter<TxIter<'_>> {
        assert!(scan.is_well_formed(), "scan comparators must oppose each other");
        let (lo, hi) = if scan.cmp1.forward() {
            (scan.key1.clone(), scan.key2.clone())
        } else {
            (scan.key2.clone(), scan.key1.clone())
        };
        self.reads.push(KeyRange {
            start: lo,
            stop: Some(hi),
        });
        let inner = TxIter::seek(
            &self.mem,
            self.pending,
            &self.snap,
            self.snap_root,
            &scan.key1,
            scan.cmp1,
        );
        RangeIter::new(inner, scan.cmp2, scan.key2.clone())
    }

    /// Commits the buffered writes.
    ///
    /// # Errors
    ///
    /// [`Error::Conflict`] if a concurrently committed transaction wrote
    /// into a range this one read; I/O errors if the flush fails (the
    /// store is left unchanged, or in the sticky failed state if the meta
    /// write itself failed).
    pub fn commit(mut self) -> Result<()> {
        self.done = true;
        let ops = self.collect_ops();
        self.commit_inner(ops)
    }

    /// Discards the buffered writes.
    pub fn abort(self) {
        // Drop releases the reader registration.
    }

    fn checkin(&self) {
        self.shared.readers.lock().unwrap().checkin(self.version);
    }

    /// Drains the pending tree into sorted `(key, op)` pairs.
    fn collect_ops(&self) -> Vec<(Vec<u8>, WriteOp)> {
        let mut ops = Vec::new();
        let mut iter = self.pending.seek(&self.mem, b"", SeekCmp::Ge);
        while let Some((key, tagged)) = iter.deref() {
            let op = match tagged[0] {
                FLAG_UPDATED => WriteOp::Put(tagged[1..].to_vec()),
                _ => WriteOp::Delete,
            };
            ops.push((key.to_vec(), op));
            iter.next();
        }
        ops
    }

    fn commit_inner(&mut self, ops: Vec<(Vec<u8>, WriteOp)>) -> Result<()> {
        if ops.is_empty() {
            // Nothing written; snapshot reads were consistent by
            // construction.
            self.checkin();
            return Ok(());
        }

        let mut state = self.shared.state.lock().unwrap();
        if state.failed {
            drop(state);
            self.checkin();
            return Err(Error::StoreFailed);
        }

        // Conflict detection: newest first, stopping at entries that were
        // already visible when this transaction began.
        let mut conflict = None;
        for entry in state.history.iter().rev() {
            if entry.version <= self.version {
                break;
            }
            if ranges_overlap(&self.reads, &entry.writes) {
                conflict = Some(entry.version);
                break;
            }
        }
        if let Some(version) = conflict {
            drop(state);
            self.checkin();
            debug!("commit rejected: read-write conflict against version {version}");
            return Err(Error::Conflict);
        }

        // The snapshot is no longer needed; release it before fencing so
        // it cannot hold the fence back.
        self.checkin();
        let oldest = self.shared.readers.lock().unwrap().oldest();
        state.advance_free_fence(oldest);

        let writes: Vec<Vec<u8>> = ops.iter().map(|(key, _)| key.clone()).collect();
        state.apply_and_flush(&ops)?;

        state.version += 1;
        let version = state.version;
        state.history.push_back(CommittedTx { version, writes });
        let tail_seq = state.free.tail_seq;
        state.marks.push_back(FreeMark { version, tail_seq });

        // Truncate history no live transaction is old enough to scan.
        let min_live = self
            .shared
            .readers
            .lock()
            .unwrap()
            .oldest()
            .unwrap_or(version);
        while state.history.front().is_some_and(|e| e.version <= min_live) {
            state.history.pop_front();
        }
        debug!("committed version {version}");
        Ok(())
    }
}

impl Drop for WriteTx {
    fn drop(&mut self) {
        if !self.done {
            // Uncommitted changes die with the pending tree.
            self.checkin();
        }
    }
}

#[derive(Clone, Copy, PartialEq, Eq)]
enum Side {
    Top,
    Bot,
}

/// A cursor merging the transaction's pending tree over its snapshot.
///
/// The pending side wins ties; deletion tombstones hide snapshot entries.
/// Reversing direction re-seeks both cursors around the current key.
pub struct TxIter<'t> {
    mem: &'t MemPages,
    pending_root: BTree,
    snap: &'t SnapshotPages,
    snap_root: BTree,
    top: TreeIter<'t, MemPages>,
    bot: TreeIter<'t, SnapshotPages>,
    forward: bool,
}

impl<'t> TxIter<'t> {
    pub(crate) fn seek(
        mem: &'t MemPages,
        pending_root: BTree,
        snap: &'t SnapshotPages,
        snap_root: BTree,
        key: &[u8],
        cmp: SeekCmp,
    ) -> Self {
        let mut iter = Self {
            mem,
            pending_root,
            snap,
            snap_root,
            top: pending_root.seek(mem, key, cmp),
            bot: snap_root.seek(snap, key, cmp),
            forward: cmp.forward(),
        };
        iter.normalize();
        iter
    }

    fn pick(&self) -> Option<Side> {
        match (self.top.deref(), self.bot.deref()) {
            (None, None) => None,
            (Some(_), None) => Some(Side::Top),
            (None, Some(_)) => Some(Side::Bot),
            (Some((tk, _)), Some((bk, _))) => {
                let top_first = if self.forward { tk <= bk } else { tk >= bk };
                Some(if top_first { Side::Top } else { Side::Bot })
            }
        }
    }

    fn step_top(&mut self) {
        if self.forward {
            self.top.next();
        } else {
            self.top.prev();
        }
    }

    fn step_bot(&mut self) {
        if self.forward {
            self.bot.next();
        } else {
            self.bot.prev();
        }
    }

    /// Skips tombstoned positions so the cursor always rests on a visible
    /// entry or exhaustion.
    fn normalize(&mut self) {
        while let Some(Side::Top) = self.pick() {
            let (tk, tv) = self.top.deref().unwrap();
            if tv[0] != FLAG_DELETED {
                break;
            }
            let tie = self.bot.deref().is_some_and(|(bk, _)| bk == tk);
            if tie {
                self.step_bot();
            }
            self.step_top();
        }
    }

    /// Advances past the current entry in the scan direction.
    fn step_current(&mut self) {
        let Some(side) = self.pick() else {
            // Parked on a boundary or the sentinel; step both cursors so
            // a later entry can surface. Past either end this is a no-op.
            self.step_top();
            self.step_bot();
            return;
        };
        let tie = match (self.top.deref(), self.bot.deref()) {
            (Some((tk, _)), Some((bk, _))) => tk == bk,
            _ => false,
        };
        match side {
            Side::Top => {
                if tie {
                    self.step_bot();
                }
                self.step_top();
            }
            Side::Bot => self.step_bot(),
        }
    }

    /// Reverses the scan direction, re-anchoring both cursors strictly
    /// beyond the current key.
    fn turn(&mut self, forward: bool) {
        let anchor = self.deref().map(|(key, _)| key.to_vec());
        self.forward = forward;
        match anchor {
            Some(key) => {
                let cmp = if forward { SeekCmp::Gt } else { SeekCmp::Lt };
                self.top = self.pending_root.seek(self.mem, &key, cmp);
                self.bot = self.snap_root.seek(self.snap, &key, cmp);
            }
            None => {
                // Parked past a boundary: stepping back recovers the
                // boundary entry.
                self.step_top();
                self.step_bot();
            }
        }
    }

    pub fn valid(&self) -> bool {
        self.pick().is_some()
    }

    pub fn deref(&self) -> Option<(&'t [u8], &'t [u8])> {
        match self.pick()? {
            Side::Top => {
                let (key, tagged) = self.top.deref()?;
                debug_assert_eq!(tagged[0], FLAG_UPDATED);
                Some((key, &tagged[1..]))
            }
            Side::Bot => self.bot.deref(),
        }
    }

    pub fn next(&mut self) {
        if self.forward {
            self.step_current();
        } else {
            self.turn(true);
        }
        self.normalize();
    }

    pub fn prev(&mut self) {
        if self.forward {
            self.turn(false);
        } else {
            self.step_current();
        }
        self.normalize();
    }
}

impl KvIter for TxIter<'_> {
    fn valid(&self) -> bool {
        TxIter::valid(self)
    }

    fn deref(&self) -> Option<(&[u8], &[u8])> {
        TxIter::deref(self)
    }

    fn next(&mut self) {
        TxIter::next(self)
    }

    fn prev(&mut self) {
        TxIter::prev(self)
    }
}
