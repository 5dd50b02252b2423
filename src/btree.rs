//! Summary: Copy-on-write B+ tree over pluggable page storage.
//! Copyright (c) YOAB. All rights reserved.
//!
//! The tree holds nothing but its root page number; every operation is a
//! pure function of the root and a page provider. Mutations never touch an
//! existing page: they build replacement nodes in memory, allocate them
//! through the provider, and release the displaced pages back to it. This
//! is what lets a snapshot root stay readable while later commits rewrite
//! the tree around it, and what lets the transaction pending buffer reuse
//! the same code with a vector-backed provider.

use crate::node::{
    Node, NodeBuf, leaf_delete, leaf_insert, leaf_update, node_merge, split3,
};
use crate::page::{NODE_HEADER, NODE_INTERNAL, NODE_LEAF, PAGE_SIZE};

/// Read access to pages. Implementations return views that stay valid for
/// the lifetime of the borrow of `self`.
pub trait PageRead {
    fn page(&self, ptr: u64) -> &[u8];
}

/// Full page storage: read, copy-on-write allocation, deallocation.
pub trait PageStore: PageRead {
    /// Stores a new page and returns its nonzero page number.
    fn alloc(&mut self, node: &[u8]) -> u64;
    /// Releases a page displaced by copy-on-write.
    fn dealloc(&mut self, ptr: u64);
}

/// An append-only, in-memory page provider.
///
/// Backs the transaction pending tree and unit tests; deallocation is a
/// no-op because the whole arena is dropped at once.
#[derive(Default)]
pub struct MemPages {
    pages: Vec<Box<[u8]>>,
}

impl MemPages {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.pages.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pages.is_empty()
    }
}

impl PageRead for MemPages {
    fn page(&self, ptr: u64) -> &[u8] {
        &self.pages[ptr as usize - 1]
    }
}

impl PageStore for MemPages {
    fn alloc(&mut self, node: &[u8]) -> u64 {
        debug_assert_eq!(node.len(), PAGE_SIZE);
        self.pages.push(node.into());
        self.pages.len() as u64
    }

    fn dealloc(&mut self, _ptr: u64) {}
}

/// Insert behavior for [`BTree::update`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UpdateMode {
    /// Insert or replace.
    Upsert,
    /// Replace only; fail if the key is absent.
    UpdateOnly,
    /// Insert only; fail if the key is present.
    InsertOnly,
}

/// A keyed write with a mode, reporting what happened.
pub struct UpdateRequest<'a> {
    pub key: &'a [u8],
    pub val: &'a [u8],
    pub mode: UpdateMode,
    /// Set by `update`: the key was not present before.
    pub added: bool,
    /// Set by `update`: the previous value, if any.
    pub old_val: Option<Vec<u8>>,
}

impl<'a> UpdateRequest<'a> {
    pub fn new(key: &'a [u8], val: &'a [u8]) -> Self {
        Self {
            key,
            val,
            mode: UpdateMode::Upsert,
            added: false,
            old_val: None,
        }
    }

    pub fn mode(mut self, mode: UpdateMode) -> Self {
        self.mode = mode;
        self
    }
}

/// A copy-on-write B+ tree rooted at a page number. Root 0 is the empty
/// tree.
#[derive(Debug, Clone, Copy, Default)]
pub struct BTree {
    pub root: u64,
}

impl BTree {
    pub fn new() -> Self {
        Self { root: 0 }
    }

    /// Point lookup.
    ///
    /// The empty key addresses the lower-fence slot of the leftmost leaf;
    /// it reads as absent while its value is empty (the state the fence is
    /// created in).
    pub fn get<'s, S: PageRead + ?Sized>(&self, store: &'s S, key: &[u8]) -> Option<&'s [u8]> {
        let mut ptr = self.root;
        if ptr == 0 {
            return None;
        }
        loop {
            let node = Node::new(store.page(ptr));
            let idx = node.lookup_le(key);
            if node.is_leaf() {
                if node.key(idx) != key {
                    return None;
                }
                let val = node.val(idx);
                if key.is_empty() && val.is_empty() {
                    return None;
                }
                return Some(val);
            }
            ptr = node.ptr(idx);
        }
    }

    /// Inserts or replaces a pair. Callers are responsible for the size
    /// limits; oversized pairs are a logic error checked upstream.
    pub fn insert<S: PageStore + ?Sized>(&mut self, store: &mut S, key: &[u8], val: &[u8]) {
        if self.root == 0 {
            // First insert: create a leaf whose slot 0 is the empty
            // sentinel covering the whole key space.
            let mut root = NodeBuf::page();
            if key.is_empty() {
                root.set_header(NODE_LEAF, 1);
                root.append_kv(0, 0, b"", val);
            } else {
                root.set_header(NODE_LEAF, 2);
                root.append_kv(0, 0, b"", b"");
                root.append_kv(1, 0, key, val);
            }
            self.root = store.alloc(root.as_page());
            return;
        }

        let scratch = tree_insert(store, self.root, key, val);
        let split = split3(scratch);
        store.dealloc(self.root);
        if split.len() == 1 {
            self.root = store.alloc(split[0].as_page());
        } else {
            // The root split; grow the tree by one level.
            let mut root = NodeBuf::page();
            root.set_header(NODE_INTERNAL, split.len() as u16);
            for (i, piece) in split.iter().enumerate() {
                let ptr = store.alloc(piece.as_page());
                root.append_kv(i as u16, ptr, piece.key(0), b"");
            }
            self.root = store.alloc(root.as_page());
        }
    }

    /// Mode-aware write. Returns whether the tree was modified; the
    /// request reports `added` and the previous value.
    pub fn update<S: PageStore + ?Sized>(&mut self, store: &mut S, req: &mut UpdateRequest<'_>) -> bool {
        let old_val = self.get(store, req.key).map(<[u8]>::to_vec);
        match req.mode {
            UpdateMode::InsertOnly if old_val.is_some() => {
                req.old_val = old_val;
                return false;
            }
            UpdateMode::UpdateOnly if old_val.is_none() => {
                return false;
            }
            _ => {}
        }
        req.added = old_val.is_none();
        req.old_val = old_val;
        self.insert(store, req.key, req.val);
        true
    }

    /// Removes a key. Returns false if the key was absent.
    pub fn delete<S: PageStore + ?Sized>(&mut self, store: &mut S, key: &[u8]) -> bool {
        if self.root == 0 {
            return false;
        }
        let Some(updated) = tree_delete(store, self.root, key) else {
            return false;
        };
        store.dealloc(self.root);
        let view = updated.view();
        if view.is_internal() && view.nkeys() == 1 {
            // The root shrank to a single child; drop a level.
            self.root = view.ptr(0);
        } else if view.nkeys() == 0 {
            self.root = 0;
        } else {
            self.root = store.alloc(updated.as_page());
        }
        true
    }
}

/// Recursive insert. Returns a replacement node that may be oversized;
/// the caller splits and allocates it.
fn tree_insert<S: PageStore + ?Sized>(store: &mut S, ptr: u64, key: &[u8], val: &[u8]) -> NodeBuf {
    let old_data = store.page(ptr).to_vec();
    let old = Node::new(&old_data);
    let mut new = NodeBuf::scratch();
    let idx = old.lookup_le(key);
    if old.is_leaf() {
        if old.key(idx) == key {
            leaf_update(&mut new, old, idx, key, val);
        } else {
            leaf_insert(&mut new, old, idx + 1, key, val);
        }
    } else {
        let kptr = old.ptr(idx);
        let child = tree_insert(store, kptr, key, val);
        let split = split3(child);
        store.dealloc(kptr);
        replace_children(store, &mut new, old, idx, &split);
    }
    new
}

/// Splices `children` in place of the child at `idx`, allocating them.
fn replace_children<S: PageStore + ?Sized>(
    store: &mut S,
    new: &mut NodeBuf,
    old: Node<'_>,
    idx: u16,
    children: &[NodeBuf],
) {
    let n = children.len() as u16;
    new.set_header(NODE_INTERNAL, old.nkeys() + n - 1);
    new.append_range(old, 0, 0, idx);
    for (i, child) in children.iter().enumerate() {
        let ptr = store.alloc(child.as_page());
        new.append_kv(idx + i as u16, ptr, child.key(0), b"");
    }
    new.append_range(old, idx + n, idx + 1, old.nkeys() - (idx + 1));
}

/// Splices one merged child in place of the two at `idx` and `idx + 1`.
fn replace_2_children(new: &mut NodeBuf, old: Node<'_>, idx: u16, ptr: u64, key: &[u8]) {
    new.set_header(NODE_INTERNAL, old.nkeys() - 1);
    new.append_range(old, 0, 0, idx);
    new.append_kv(idx, ptr, key, b"");
    new.append_range(old, idx + 1, idx + 2, old.nkeys() - (idx + 2));
}

enum MergeDir {
    None,
    /// Merge with the left sibling (carries a copy of its page).
    Left(Vec<u8>),
    /// Merge with the right sibling.
    Right(Vec<u8>),
}

/// Decides whether an under-full child should merge with a sibling.
fn should_merge<S: PageStore + ?Sized>(
    store: &S,
    node: Node<'_>,
    idx: u16,
    updated: &NodeBuf,
) -> MergeDir {
    if updated.nbytes() > PAGE_SIZE / 4 {
        return MergeDir::None;
    }
    if idx > 0 {
        let sibling = store.page(node.ptr(idx - 1));
        let merged = Node::new(sibling).nbytes() + updated.nbytes() - NODE_HEADER;
        if merged <= PAGE_SIZE {
            return MergeDir::Left(sibling.to_vec());
        }
    }
    if idx + 1 < node.nkeys() {
        let sibling = store.page(node.ptr(idx + 1));
        let merged = Node::new(sibling).nbytes() + updated.nbytes() - NODE_HEADER;
        if merged <= PAGE_SIZE {
            return MergeDir::Right(sibling.to_vec());
        }
    }
    MergeDir::None
}

/// Recursive delete. `None` means the key was absent and nothing changed.
fn tree_delete<S: PageStore + ?Sized>(store: &mut S, ptr: u64, key: &[u8]) -> Option<NodeBuf> {
    let old_data = store.page(ptr).to_vec();
    let old = Node::new(&old_data);
    let idx = old.lookup_le(key);
    if old.is_leaf() {
        if old.key(idx) != key {
            return None;
        }
        if key.is_empty() {
            // The empty key is the lower fence of the leftmost leaf.
            // Removing the slot would orphan the fence; clear the value
            // instead.
            if old.val(idx).is_empty() {
                return None;
            }
            let mut new = NodeBuf::page();
            leaf_update(&mut new, old, idx, b"", b"");
            return Some(new);
        }
        let mut new = NodeBuf::page();
        leaf_delete(&mut new, old, idx);
        Some(new)
    } else {
        node_delete(store, old, idx, key)
    }
}

/// Delete within an internal node: recurse, then merge the child with a
/// sibling if it fell below a quarter page.
fn node_delete<S: PageStore + ?Sized>(
    store: &mut S,
    old: Node<'_>,
    idx: u16,
    key: &[u8],
) -> Option<NodeBuf> {
    let kptr = old.ptr(idx);
    let updated = tree_delete(store, kptr, key)?;
    store.dealloc(kptr);

    let mut new = NodeBuf::page();
    match should_merge(store, old, idx, &updated) {
        MergeDir::Left(sibling) => {
            let mut merged = NodeBuf::page();
            node_merge(&mut merged, Node::new(&sibling), updated.view());
            store.dealloc(old.ptr(idx - 1));
            let merged_ptr = store.alloc(merged.as_page());
            replace_2_children(&mut new, old, idx - 1, merged_ptr, merged.key(0));
        }
        MergeDir::Right(sibling) => {
            let mut merged = NodeBuf::page();
            node_merge(&mut merged, updated.view(), Node::new(&sibling));
            store.dealloc(old.ptr(idx + 1));
            let merged_ptr = store.alloc(merged.as_page());
            replace_2_children(&mut new, old, idx, merged_ptr, merged.key(0));
        }
        MergeDir::None if updated.nkeys() == 0 => {
            // The child emptied out with no sibling to absorb it; the
            // parent becomes empty too and the caller collapses it.
            debug_assert!(old.nkeys() == 1 && idx == 0);
            new.set_header(NODE_INTERNAL, 0);
        }
        MergeDir::None => {
            replace_children(store, &mut new, old, idx, std::slice::from_ref(&updated));
        }
    }
    Some(new)
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::seq::SliceRandom;
    use rand::{Rng, SeedableRng, rngs::StdRng};

    /// Walks the tree checking the structural invariants: nodes fit in a
    /// page, keys are strictly sorted, and each internal slot key equals
    /// the smallest key of its subtree.
    fn check_node(store: &MemPages, ptr: u64) -> Vec<u8> {
        let node = Node::new(store.page(ptr));
        assert!(node.nbytes() <= PAGE_SIZE, "node exceeds page size");
        assert!(node.nkeys() >= 1);
        for i in 1..node.nkeys() {
            assert!(
                node.key(i - 1) < node.key(i),
                "keys must be strictly ascending"
            );
        }
        if node.is_internal() {
            for i in 0..node.nkeys() {
                let child_first = check_node(store, node.ptr(i));
                assert_eq!(
                    node.key(i),
                    &child_first[..],
                    "internal key must equal the subtree's smallest key"
                );
            }
        }
        node.key(0).to_vec()
    }

    fn check_tree(store: &MemPages, tree: &BTree) {
        if tree.root != 0 {
            let first = check_node(store, tree.root);
            assert!(first.is_empty(), "leftmost key must be the empty sentinel");
        }
    }

    fn collect_in_order(store: &MemPages, ptr: u64, out: &mut Vec<(Vec<u8>, Vec<u8>)>) {
        let node = Node::new(store.page(ptr));
        for i in 0..node.nkeys() {
            if node.is_internal() {
                collect_in_order(store, node.ptr(i), out);
            } else if !(node.key(i).is_empty() && node.val(i).is_empty()) {
                out.push((node.key(i).to_vec(), node.val(i).to_vec()));
            }
        }
    }

    #[test]
    fn test_first_insert_creates_sentinel() {
        let mut store = MemPages::new();
        let mut tree = BTree::new();
        tree.insert(&mut store, b"a", b"1");
        let root = Node::new(store.page(tree.root));
        assert!(root.is_leaf());
        assert_eq!(root.nkeys(), 2);
        assert_eq!(root.key(0), b"");
        assert_eq!(root.key(1), b"a");
    }

    #[test]
    fn test_get_after_insert() {
        let mut store = MemPages::new();
        let mut tree = BTree::new();
        tree.insert(&mut store, b"hello", b"world");
        assert_eq!(tree.get(&store, b"hello"), Some(&b"world"[..]));
        assert_eq!(tree.get(&store, b"absent"), None);
    }

    #[test]
    fn test_overwrite_same_key() {
        let mut store = MemPages::new();
        let mut tree = BTree::new();
        tree.insert(&mut store, b"k", b"v1");
        tree.insert(&mut store, b"k", b"v2");
        assert_eq!(tree.get(&store, b"k"), Some(&b"v2"[..]));
        check_tree(&store, &tree);
    }

    #[test]
    fn test_empty_key_is_fence_until_written() {
        let mut store = MemPages::new();
        let mut tree = BTree::new();
        tree.insert(&mut store, b"a", b"1");
        assert_eq!(tree.get(&store, b""), None);
        tree.insert(&mut store, b"", b"x");
        assert_eq!(tree.get(&store, b""), Some(&b"x"[..]));
        assert!(tree.delete(&mut store, b""));
        assert_eq!(tree.get(&store, b""), None);
        // the fence slot must survive the delete
        check_tree(&store, &tree);
        assert_eq!(tree.get(&store, b"a"), Some(&b"1"[..]));
    }

    #[test]
    fn test_empty_key_as_first_insert() {
        let mut store = MemPages::new();
        let mut tree = BTree::new();
        tree.insert(&mut store, b"", b"x");
        assert_eq!(tree.get(&store, b""), Some(&b"x"[..]));
        tree.insert(&mut store, b"a", b"1");
        assert_eq!(tree.get(&store, b"a"), Some(&b"1"[..]));
        check_tree(&store, &tree);
    }

    #[test]
    fn test_random_inserts_keep_invariants() {
        let mut rng = StdRng::seed_from_u64(7);
        let mut store = MemPages::new();
        let mut tree = BTree::new();
        let mut keys: Vec<u32> = (0..2000).collect();
        keys.shuffle(&mut rng);

        for &k in &keys {
            let key = format!("key{k:08}");
            let val = format!("val{k}");
            tree.insert(&mut store, key.as_bytes(), val.as_bytes());
        }
        check_tree(&store, &tree);

        for &k in &keys {
            let key = format!("key{k:08}");
            let got = tree.get(&store, key.as_bytes());
            assert_eq!(got, Some(format!("val{k}").as_bytes()));
        }

        let mut all = Vec::new();
        collect_in_order(&store, tree.root, &mut all);
        assert_eq!(all.len(), keys.len());
        let mut sorted = all.clone();
        sorted.sort();
        assert_eq!(all, sorted, "in-order walk must be sorted");
    }

    #[test]
    fn test_random_deletes_merge_and_keep_invariants() {
        let mut rng = StdRng::seed_from_u64(23);
        let mut store = MemPages::new();
        let mut tree = BTree::new();
        let keys: Vec<String> = (0..1200).map(|k| format!("key{k:08}")).collect();
        for key in &keys {
            // mid-size values to force a multi-level tree
            let val = vec![b'v'; 40 + (key.len() % 17)];
            tree.insert(&mut store, key.as_bytes(), &val);
        }

        let mut doomed: Vec<&String> = keys.iter().collect();
        doomed.shuffle(&mut rng);
        let (gone, kept) = doomed.split_at(1000);
        for key in gone {
            assert!(tree.delete(&mut store, key.as_bytes()), "{key} must exist");
        }
        check_tree(&store, &tree);

        for key in gone {
            assert_eq!(tree.get(&store, key.as_bytes()), None);
        }
        for key in kept {
            assert!(tree.get(&store, key.as_bytes()).is_some());
        }
    }

    #[test]
    fn test_delete_absent_returns_false() {
        let mut store = MemPages::new();
        let mut tree = BTree::new();
        tree.insert(&mut store, b"a", b"1");
        assert!(!tree.delete(&mut store, b"b"));
        assert!(tree.delete(&mut store, b"a"));
        assert!(!tree.delete(&mut store, b"a"));
    }

    #[test]
    fn test_delete_everything_then_reinsert() {
        let mut store = MemPages::new();
        let mut tree = BTree::new();
        for k in 0..300u32 {
            tree.insert(&mut store, format!("k{k:05}").as_bytes(), b"v");
        }
        for k in 0..300u32 {
            assert!(tree.delete(&mut store, format!("k{k:05}").as_bytes()));
        }
        check_tree(&store, &tree);
        assert_eq!(tree.get(&store, b"k00000"), None);
        tree.insert(&mut store, b"again", b"1");
        assert_eq!(tree.get(&store, b"again"), Some(&b"1"[..]));
    }

    #[test]
    fn test_large_values_split_to_page_sized_nodes() {
        let mut rng = StdRng::seed_from_u64(99);
        let mut store = MemPages::new();
        let mut tree = BTree::new();
        for k in 0..64u32 {
            let len = rng.gen_range(1000..crate::page::MAX_VAL_SIZE);
            let val = vec![b'x'; len];
            tree.insert(&mut store, format!("k{k:04}").as_bytes(), &val);
        }
        check_tree(&store, &tree);
    }

    #[test]
    fn test_update_modes() {
        let mut store = MemPages::new();
        let mut tree = BTree::new();

        let mut req = UpdateRequest::new(b"k", b"v1").mode(UpdateMode::UpdateOnly);
        assert!(!tree.update(&mut store, &mut req), "update-only on absent key");

        let mut req = UpdateRequest::new(b"k", b"v1").mode(UpdateMode::InsertOnly);
        assert!(tree.update(&mut store, &mut req));
        assert!(req.added);
        assert!(req.old_val.is_none());

        let mut req = UpdateRequest::new(b"k", b"v2").mode(UpdateMode::InsertOnly);
        assert!(!tree.update(&mut store, &mut req), "insert-only on present key");
        assert_eq!(req.old_val.as_deref(), Some(&b"v1"[..]));

        let mut req = UpdateRequest::new(b"k", b"v2").mode(UpdateMode::UpdateOnly);
        assert!(tree.update(&mut store, &mut req));
        assert!(!req.added);
        assert_eq!(req.old_val.as_deref(), Some(&b"v1"[..]));
        assert_eq!(tree.get(&store, b"k"), Some(&b"v2"[..]));
    }
}
