//! Summary: Ordered iteration over tree snapshots and range scans.
//! Copyright (c) YOAB. All rights reserved.
//!
//! A cursor is a path of `(page, slot)` pairs from the root to a leaf.
//! Moving past either end parks the cursor one slot outside the leaf, from
//! where the opposite movement recovers the boundary entry.

use crate::btree::{BTree, PageRead};
use crate::node::Node;

/// Seek comparators: where to land relative to the seek key.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SeekCmp {
    /// First entry `>= key`.
    Ge,
    /// First entry `> key`.
    Gt,
    /// Last entry `<= key`.
    Le,
    /// Last entry `< key`.
    Lt,
}

impl SeekCmp {
    /// Whether this comparator scans toward larger keys.
    pub fn forward(self) -> bool {
        matches!(self, SeekCmp::Ge | SeekCmp::Gt)
    }

    /// Whether `cur` satisfies the comparator against `key`.
    pub fn ok(self, cur: &[u8], key: &[u8]) -> bool {
        match self {
            SeekCmp::Ge => cur >= key,
            SeekCmp::Gt => cur > key,
            SeekCmp::Le => cur <= key,
            SeekCmp::Lt => cur < key,
        }
    }
}

/// Common cursor surface shared by the tree iterator, the transaction's
/// merged iterator, and the range-bounded wrapper.
pub trait KvIter {
    fn valid(&self) -> bool;
    fn deref(&self) -> Option<(&[u8], &[u8])>;
    fn next(&mut self);
    fn prev(&mut self);
}

/// A cursor over one tree snapshot.
pub struct TreeIter<'s, S: PageRead + ?Sized> {
    store: &'s S,
    /// Root-to-leaf path; the slot index may rest at -1 (before the first
    /// slot) or `nkeys` (past the last) at the boundaries.
    path: Vec<(u64, i32)>,
}

impl BTree {
    /// Positions a cursor at the last slot `<= key` (the sentinel slot if
    /// nothing smaller exists).
    pub fn seek_le<'s, S: PageRead + ?Sized>(&self, store: &'s S, key: &[u8]) -> TreeIter<'s, S> {
        let mut iter = TreeIter {
            store,
            path: Vec::new(),
        };
        let mut ptr = self.root;
        while ptr != 0 {
            let node = Node::new(store.page(ptr));
            let idx = node.lookup_le(key);
            iter.path.push((ptr, idx as i32));
            if node.is_leaf() {
                break;
            }
            ptr = node.ptr(idx);
        }
        iter
    }

    /// Positions a cursor relative to `key` according to `cmp`.
    pub fn seek<'s, S: PageRead + ?Sized>(
        &self,
        store: &'s S,
        key: &[u8],
        cmp: SeekCmp,
    ) -> TreeIter<'s, S> {
        let mut iter = self.seek_le(store, key);
        if let Some((cur, val)) = iter.kv() {
            let sentinel = cur.is_empty() && val.is_empty();
            if sentinel || !cmp.ok(cur, key) {
                // seek_le lands at most one slot away from the target
                if cmp.forward() {
                    iter.next();
                } else {
                    iter.prev();
                }
            }
        }
        iter
    }
}

impl<'s, S: PageRead + ?Sized> TreeIter<'s, S> {
    fn node(&self, level: usize) -> Node<'s> {
        Node::new(self.store.page(self.path[level].0))
    }

    /// The slot under the cursor, sentinel included; `None` outside the
    /// leaf bounds.
    fn kv(&self) -> Option<(&'s [u8], &'s [u8])> {
        let &(_, pos) = self.path.last()?;
        let last = self.path.len() - 1;
        let node = self.node(last);
        if pos < 0 || pos >= node.nkeys() as i32 {
            return None;
        }
        Some((node.key(pos as u16), node.val(pos as u16)))
    }

    /// True while the cursor rests on a real (non-sentinel) slot.
    pub fn valid(&self) -> bool {
        match self.kv() {
            Some((k, v)) => !(k.is_empty() && v.is_empty()),
            None => false,
        }
    }

    /// The current pair; `None` unless `valid()`.
    pub fn deref(&self) -> Option<(&'s [u8], &'s [u8])> {
        self.kv().filter(|(k, v)| !(k.is_empty() && v.is_empty()))
    }

    pub fn next(&mut self) {
        if self.path.is_empty() {
            return;
        }
        let last = self.path.len() - 1;
        let pos = self.path[last].1;
        if pos >= self.node(last).nkeys() as i32 {
            return; // already past the end
        }
        if pos < 0 {
            self.path[last].1 = 0;
            return;
        }
        self.advance(last);
    }

    pub fn prev(&mut self) {
        if self.path.is_empty() {
            return;
        }
        let last = self.path.len() - 1;
        let pos = self.path[last].1;
        if pos < 0 {
            return; // already before the start
        }
        let nkeys = self.node(last).nkeys() as i32;
        if pos >= nkeys {
            self.path[last].1 = nkeys - 1;
            return;
        }
        self.retreat(last);
    }

    /// Moves one slot forward at `level`, ascending and re-descending
    /// across node boundaries. Returns false once the tree is exhausted.
    fn advance(&mut self, level: usize) -> bool {
        let nkeys = self.node(level).nkeys() as i32;
        if self.path[level].1 + 1 < nkeys {
            self.path[level].1 += 1;
        } else if level > 0 {
            if !self.advance(level - 1) {
                return false;
            }
        } else {
            let last = self.path.len() - 1;
            self.path[last].1 = self.node(last).nkeys() as i32;
            return false;
        }
        if level + 1 < self.path.len() {
            let child = self.node(level).ptr(self.path[level].1 as u16);
            self.path[level + 1] = (child, 0);
        }
        true
    }

    fn retreat(&mut self, level: usize) -> bool {
        if self.path[level].1 > 0 {
            self.path[level].1 -= 1;
        } else if level > 0 {
            if !self.retreat(level - 1) {
                return false;
            }
        } else {
            let last = self.path.len() - 1;
            self.path[last].1 = -1;
            return false;
        }
        if level + 1 < self.path.len() {
            let child = self.node(level).ptr(self.path[level].1 as u16);
            let child_last = Node::new(self.store.page(child)).nkeys() as i32 - 1;
            self.path[level + 1] = (child, child_last);
        }
        true
    }
}

impl<'s, S: PageRead + ?Sized> KvIter for TreeIter<'s, S> {
    fn valid(&self) -> bool {
        TreeIter::valid(self)
    }

    fn deref(&self) -> Option<(&[u8], &[u8])> {
        TreeIter::deref(self)
    }

    fn next(&mut self) {
        TreeIter::next(self)
    }

    fn prev(&mut self) {
        TreeIter::prev(self)
    }
}

/// A range scan request: `key1` bounds the seek side, `key2` the stop
/// side.
#[derive(Debug, Clone)]
pub struct Scan {
    pub cmp1: SeekCmp,
    pub cmp2: SeekCmp,
    pub key1: Vec<u8>,
    pub key2: Vec<u8>,
}

impl Scan {
    /// The common case: ascending over `[key1, key2]`.
    pub fn range(key1: impl Into<Vec<u8>>, key2: impl Into<Vec<u8>>) -> Self {
        Self {
            cmp1: SeekCmp::Ge,
            cmp2: SeekCmp::Le,
            key1: key1.into(),
            key2: key2.into(),
        }
    }

    /// The comparators must point in opposite directions to bound a range.
    pub fn is_well_formed(&self) -> bool {
        self.cmp1.forward() != self.cmp2.forward()
    }
}

/// Bounds an iterator with the stop side of a [`Scan`].
pub struct RangeIter<I> {
    inner: I,
    cmp: SeekCmp,
    key: Vec<u8>,
}

impl<I: KvIter> RangeIter<I> {
    pub fn new(inner: I, cmp: SeekCmp, key: Vec<u8>) -> Self {
        Self { inner, cmp, key }
    }
}

impl<I: KvIter> KvIter for RangeIter<I> {
    fn valid(&self) -> bool {
        match self.inner.deref() {
            Some((k, _)) => self.cmp.ok(k, &self.key),
            None => false,
        }
    }

    fn deref(&self) -> Option<(&[u8], &[u8])> {
        if !self.valid() {
            return None;
        }
        self.inner.deref()
    }

    fn next(&mut self) {
        self.inner.next();
    }

    fn prev(&mut self) {
        self.inner.prev();
    }
}
