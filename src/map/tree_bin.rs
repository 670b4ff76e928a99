use super::bin::{self, BinEntry, Node};

use std::{
    borrow::Borrow,
    cell::UnsafeCell,
    ptr,
    sync::atomic::{AtomicUsize, Ordering},
};

use crossbeam_epoch::{Atomic, Guard, Owned, Shared};
use crossbeam_utils::Backoff;
use parking_lot::Mutex;

// Bits of `TreeBin::lock_state`.
const WRITER: usize = 0b001; // held while the tree is being restructured
const WAITER: usize = 0b010; // a writer waits for readers to drain
const READER: usize = 0b100; // increment for each reader inside the tree

/// A bin holding its entries in a red-black tree.
///
/// The entries are also kept in a linked list, newest first. Readers walk the
/// tree when no writer is restructuring it and fall back to the list otherwise,
/// so a lookup never blocks. Writers hold `lock` for the whole operation and
/// additionally take the writer bit of `lock_state` around tree rotations.
pub(crate) struct TreeBin<K, V> {
    pub(crate) lock: Mutex<()>,
    lock_state: AtomicUsize,
    first: Atomic<BinEntry<K, V>>,
    tree: UnsafeCell<RbTree<K, V>>,
}

impl<K, V> TreeBin<K, V> {
    /// Builds a tree bin over `first`, a chain of nodes that is not yet
    /// published. The bin takes ownership of the nodes (but not the values).
    pub(crate) fn new<'g>(first: Shared<'g, BinEntry<K, V>>, guard: &'g Guard) -> Self {
        let mut tree = RbTree::new();
        let mut entry = first;
        // SAFETY: the chain is ours until the bin is published.
        while let Some(bin) = unsafe { entry.as_ref() } {
            let node = bin.as_node();
            tree.insert(node, node.hash);
            entry = node.next.load(Ordering::Relaxed, guard);
        }

        Self {
            lock: Mutex::new(()),
            lock_state: AtomicUsize::new(0),
            first: Atomic::from(first),
            tree: UnsafeCell::new(tree),
        }
    }

    pub(crate) fn first<'g>(&self, guard: &'g Guard) -> Option<&'g Node<K, V>> {
        let first = self.first.load(Ordering::Acquire, guard);
        unsafe { first.as_ref() }.map(BinEntry::as_node)
    }

    pub(crate) fn first_entry<'g>(&self, guard: &'g Guard) -> Shared<'g, BinEntry<K, V>> {
        self.first.load(Ordering::Acquire, guard)
    }

    /// The number of entries. Only exact while holding the bin lock.
    pub(crate) fn len(&self) -> usize {
        // SAFETY: `len` is a plain read of a word that only the lock holder writes.
        unsafe { (*self.tree.get()).len }
    }

    pub(crate) fn find<'g, Q>(&'g self, hash: u64, key: &Q, guard: &'g Guard) -> Option<&'g Node<K, V>>
    where
        K: Borrow<Q>,
        Q: ?Sized + Eq,
    {
        let mut entry = self.first(guard);
        while let Some(node) = entry {
            let state = self.lock_state.load(Ordering::Acquire);
            if state & (WAITER | WRITER) != 0 {
                if node.key_matches(hash, key) {
                    return Some(node);
                }
                entry = node.next(guard);
            } else if self
                .lock_state
                .compare_exchange_weak(state, state + READER, Ordering::AcqRel, Ordering::Relaxed)
                .is_ok()
            {
                let _reader = ReaderGuard(&self.lock_state);
                return self.find_in_tree(hash, key);
            }
        }
        None
    }

    /// Searches the tree. The caller must hold the bin lock or be registered as
    /// a reader.
    pub(crate) fn find_in_tree<Q>(&self, hash: u64, key: &Q) -> Option<&Node<K, V>>
    where
        K: Borrow<Q>,
        Q: ?Sized + Eq,
    {
        // SAFETY: the tree is not restructured while we hold the lock or a
        // reader registration, and its entries outlive the bin.
        let tree = unsafe { &*self.tree.get() };
        let index = tree.search(tree.root, hash, &mut |entry| unsafe { &*entry }.key_matches(hash, key))?;
        Some(unsafe { &*tree.nodes[index].entry })
    }

    /// Links `entry`, whose key must be absent, into the bin. The caller must
    /// hold the bin lock.
    pub(crate) fn insert<'g>(&'g self, entry: Owned<BinEntry<K, V>>, guard: &'g Guard) -> &'g Node<K, V> {
        let first = self.first.load(Ordering::Relaxed, guard);
        entry.as_node().next.store(first, Ordering::Relaxed);
        let entry = entry.into_shared(guard);
        self.first.store(entry, Ordering::Release);

        let node = unsafe { entry.deref() }.as_node();
        self.lock_root();
        unsafe { (*self.tree.get()).insert(node, node.hash) };
        self.unlock_root();
        node
    }

    /// Unlinks `node` from the list and the tree and returns the unlinked list
    /// entry. The caller must hold the bin lock, and is responsible for retiring
    /// the entry and its value.
    pub(crate) fn remove<'g>(&'g self, node: &'g Node<K, V>, guard: &'g Guard) -> Shared<'g, BinEntry<K, V>> {
        let next = node.next.load(Ordering::Acquire, guard);
        let mut unlinked = Shared::null();
        let mut link = &self.first;
        loop {
            let entry = link.load(Ordering::Acquire, guard);
            let this = match unsafe { entry.as_ref() } {
                Some(bin) => bin.as_node(),
                None => break,
            };
            if ptr::eq(this, node) {
                link.store(next, Ordering::Release);
                unlinked = entry;
                break;
            }
            link = &this.next;
        }

        let index = {
            let tree = unsafe { &*self.tree.get() };
            tree.search(tree.root, node.hash, &mut |entry| ptr::eq(entry, node))
        };
        if let Some(index) = index {
            self.lock_root();
            unsafe { (*self.tree.get()).remove(index) };
            self.unlock_root();
        }

        unlinked
    }

    fn lock_root(&self) {
        if self
            .lock_state
            .compare_exchange(0, WRITER, Ordering::AcqRel, Ordering::Relaxed)
            .is_err()
        {
            self.contended_lock();
        }
    }

    fn contended_lock(&self) {
        let backoff = Backoff::new();
        loop {
            let state = self.lock_state.load(Ordering::Acquire);
            if state & !WAITER == 0 {
                if self
                    .lock_state
                    .compare_exchange(state, WRITER, Ordering::AcqRel, Ordering::Relaxed)
                    .is_ok()
                {
                    return;
                }
            } else if state & WAITER == 0 {
                // Keep new readers out of the tree until the current ones leave.
                let _ = self.lock_state.compare_exchange(
                    state,
                    state | WAITER,
                    Ordering::AcqRel,
                    Ordering::Relaxed,
                );
            } else {
                backoff.snooze();
            }
        }
    }

    fn unlock_root(&self) {
        self.lock_state.store(0, Ordering::Release);
    }
}

impl<K, V> Drop for TreeBin<K, V> {
    fn drop(&mut self) {
        // SAFETY: a tree bin is only dropped once it is unreachable, at which
        // point its list nodes belong to it alone.
        unsafe {
            let guard = crossbeam_epoch::unprotected();
            let first = self.first.swap(Shared::null(), Ordering::Relaxed, guard);
            bin::drop_chain(first, guard);
        }
    }
}

struct ReaderGuard<'a>(&'a AtomicUsize);

impl Drop for ReaderGuard<'_> {
    fn drop(&mut self) {
        self.0.fetch_sub(READER, Ordering::Release);
    }
}

const NIL: usize = usize::MAX;

struct RbNode<K, V> {
    entry: *const Node<K, V>,
    hash: u64,
    seq: u64,
    red: bool,
    parent: usize,
    left: usize,
    right: usize,
}

/// A red-black tree of node pointers, ordered by hash and then by insertion
/// sequence number. Tree nodes live in an arena and refer to each other by
/// index.
pub(crate) struct RbTree<K, V> {
    nodes: Vec<RbNode<K, V>>,
    free: Vec<usize>,
    root: usize,
    len: usize,
    next_seq: u64,
}

impl<K, V> RbTree<K, V> {
    fn new() -> Self {
        Self {
            nodes: Vec::new(),
            free: Vec::new(),
            root: NIL,
            len: 0,
            next_seq: 0,
        }
    }

    #[inline]
    fn is_red(&self, i: usize) -> bool {
        i != NIL && self.nodes[i].red
    }

    #[inline]
    fn less(&self, a: usize, b: usize) -> bool {
        let (a, b) = (&self.nodes[a], &self.nodes[b]);
        (a.hash, a.seq) < (b.hash, b.seq)
    }

    fn search(
        &self,
        from: usize,
        hash: u64,
        matches: &mut dyn FnMut(*const Node<K, V>) -> bool,
    ) -> Option<usize> {
        let mut i = from;
        while i != NIL {
            let node = &self.nodes[i];
            if hash < node.hash {
                i = node.left;
            } else if hash > node.hash {
                i = node.right;
            } else {
                if matches(node.entry) {
                    return Some(i);
                }
                // Entries with an equal hash can sit on either side.
                if let Some(found) = self.search(node.right, hash, matches) {
                    return Some(found);
                }
                i = node.left;
            }
        }
        None
    }

    fn minimum(&self, mut i: usize) -> usize {
        while self.nodes[i].left != NIL {
            i = self.nodes[i].left;
        }
        i
    }

    fn insert(&mut self, entry: *const Node<K, V>, hash: u64) {
        let seq = self.next_seq;
        self.next_seq += 1;

        let node = RbNode {
            entry,
            hash,
            seq,
            red: true,
            parent: NIL,
            left: NIL,
            right: NIL,
        };
        let z = if let Some(i) = self.free.pop() {
            self.nodes[i] = node;
            i
        } else {
            self.nodes.push(node);
            self.nodes.len() - 1
        };

        let mut parent = NIL;
        let mut cursor = self.root;
        while cursor != NIL {
            parent = cursor;
            cursor = if self.less(z, cursor) {
                self.nodes[cursor].left
            } else {
                self.nodes[cursor].right
            };
        }

        self.nodes[z].parent = parent;
        if parent == NIL {
            self.root = z;
        } else if self.less(z, parent) {
            self.nodes[parent].left = z;
        } else {
            self.nodes[parent].right = z;
        }
        self.len += 1;

        self.insert_fixup(z);
    }

    fn insert_fixup(&mut self, mut z: usize) {
        while self.is_red(self.nodes[z].parent) {
            let parent = self.nodes[z].parent;
            // A red node is never the root, so the grandparent exists.
            let grandparent = self.nodes[parent].parent;

            if parent == self.nodes[grandparent].left {
                let uncle = self.nodes[grandparent].right;
                if self.is_red(uncle) {
                    self.nodes[parent].red = false;
                    self.nodes[uncle].red = false;
                    self.nodes[grandparent].red = true;
                    z = grandparent;
                } else {
                    if z == self.nodes[parent].right {
                        z = parent;
                        self.rotate_left(z);
                    }
                    let parent = self.nodes[z].parent;
                    let grandparent = self.nodes[parent].parent;
                    self.nodes[parent].red = false;
                    self.nodes[grandparent].red = true;
                    self.rotate_right(grandparent);
                }
            } else {
                let uncle = self.nodes[grandparent].left;
                if self.is_red(uncle) {
                    self.nodes[parent].red = false;
                    self.nodes[uncle].red = false;
                    self.nodes[grandparent].red = true;
                    z = grandparent;
                } else {
                    if z == self.nodes[parent].left {
                        z = parent;
                        self.rotate_right(z);
                    }
                    let parent = self.nodes[z].parent;
                    let grandparent = self.nodes[parent].parent;
                    self.nodes[parent].red = false;
                    self.nodes[grandparent].red = true;
                    self.rotate_left(grandparent);
                }
            }
        }

        let root = self.root;
        self.nodes[root].red = false;
    }

    fn remove(&mut self, z: usize) {
        let mut removed_red = self.nodes[z].red;
        let x;
        let x_parent;

        if self.nodes[z].left == NIL {
            x = self.nodes[z].right;
            x_parent = self.nodes[z].parent;
            self.transplant(z, x);
        } else if self.nodes[z].right == NIL {
            x = self.nodes[z].left;
            x_parent = self.nodes[z].parent;
            self.transplant(z, x);
        } else {
            // Promote the in-order successor.
            let y = self.minimum(self.nodes[z].right);
            removed_red = self.nodes[y].red;
            x = self.nodes[y].right;

            if self.nodes[y].parent == z {
                x_parent = y;
            } else {
                x_parent = self.nodes[y].parent;
                self.transplant(y, x);
                let z_right = self.nodes[z].right;
                self.nodes[y].right = z_right;
                self.nodes[z_right].parent = y;
            }

            self.transplant(z, y);
            let z_left = self.nodes[z].left;
            self.nodes[y].left = z_left;
            self.nodes[z_left].parent = y;
            self.nodes[y].red = self.nodes[z].red;
        }

        let removed = &mut self.nodes[z];
        removed.entry = ptr::null();
        removed.parent = NIL;
        removed.left = NIL;
        removed.right = NIL;
        self.free.push(z);
        self.len -= 1;

        if !removed_red {
            self.remove_fixup(x, x_parent);
        }
    }

    /// Restores the black height after removing a black node. `x` carries the
    /// extra black and may be `NIL`, which is why its parent is passed along.
    fn remove_fixup(&mut self, mut x: usize, mut parent: usize) {
        while x != self.root && !self.is_red(x) {
            if x == self.nodes[parent].left {
                let mut sibling = self.nodes[parent].right;
                if self.is_red(sibling) {
                    self.nodes[sibling].red = false;
                    self.nodes[parent].red = true;
                    self.rotate_left(parent);
                    sibling = self.nodes[parent].right;
                }

                let (near, far) = (self.nodes[sibling].left, self.nodes[sibling].right);
                if !self.is_red(near) && !self.is_red(far) {
                    self.nodes[sibling].red = true;
                    x = parent;
                    parent = self.nodes[x].parent;
                } else {
                    if !self.is_red(far) {
                        self.nodes[near].red = false;
                        self.nodes[sibling].red = true;
                        self.rotate_right(sibling);
                        sibling = self.nodes[parent].right;
                    }
                    self.nodes[sibling].red = self.nodes[parent].red;
                    self.nodes[parent].red = false;
                    let far = self.nodes[sibling].right;
                    self.nodes[far].red = false;
                    self.rotate_left(parent);
                    x = self.root;
                }
            } else {
                let mut sibling = self.nodes[parent].left;
                if self.is_red(sibling) {
                    self.nodes[sibling].red = false;
                    self.nodes[parent].red = true;
                    self.rotate_right(parent);
                    sibling = self.nodes[parent].left;
                }

                let (near, far) = (self.nodes[sibling].right, self.nodes[sibling].left);
                if !self.is_red(near) && !self.is_red(far) {
                    self.nodes[sibling].red = true;
                    x = parent;
                    parent = self.nodes[x].parent;
                } else {
                    if !self.is_red(far) {
                        self.nodes[near].red = false;
                        self.nodes[sibling].red = true;
                        self.rotate_left(sibling);
                        sibling = self.nodes[parent].left;
                    }
                    self.nodes[sibling].red = self.nodes[parent].red;
                    self.nodes[parent].red = false;
                    let far = self.nodes[sibling].left;
                    self.nodes[far].red = false;
                    self.rotate_right(parent);
                    x = self.root;
                }
            }
        }

        if x != NIL {
            self.nodes[x].red = false;
        }
    }

    fn rotate_left(&mut self, x: usize) {
        let y = self.nodes[x].right;
        let y_left = self.nodes[y].left;

        self.nodes[x].right = y_left;
        if y_left != NIL {
            self.nodes[y_left].parent = x;
        }
        let x_parent = self.nodes[x].parent;
        self.nodes[y].parent = x_parent;
        self.replace_child(x_parent, x, y);
        self.nodes[y].left = x;
        self.nodes[x].parent = y;
    }

    fn rotate_right(&mut self, x: usize) {
        let y = self.nodes[x].left;
        let y_right = self.nodes[y].right;

        self.nodes[x].left = y_right;
        if y_right != NIL {
            self.nodes[y_right].parent = x;
        }
        let x_parent = self.nodes[x].parent;
        self.nodes[y].parent = x_parent;
        self.replace_child(x_parent, x, y);
        self.nodes[y].right = x;
        self.nodes[x].parent = y;
    }

    /// Puts `v` where `u` hangs from its parent.
    fn transplant(&mut self, u: usize, v: usize) {
        let u_parent = self.nodes[u].parent;
        self.replace_child(u_parent, u, v);
        if v != NIL {
            self.nodes[v].parent = u_parent;
        }
    }

    fn replace_child(&mut self, parent: usize, old: usize, new: usize) {
        if parent == NIL {
            self.root = new;
        } else if self.nodes[parent].left == old {
            self.nodes[parent].left = new;
        } else {
            self.nodes[parent].right = new;
        }
    }
}

#[cfg(test)]
impl<K, V> RbTree<K, V> {
    /// Checks the ordering and red-black properties. Returns the black height.
    pub(crate) fn validate(&self) -> Result<usize, String> {
        if self.is_red(self.root) {
            return Err("the root is red".into());
        }
        let (black_height, count) = self.validate_from(self.root, NIL)?;
        if count != self.len {
            return Err(format!("len is {} but {} nodes are linked", self.len, count));
        }

        let mut keys = Vec::with_capacity(count);
        self.in_order(self.root, &mut keys);
        if keys.windows(2).any(|w| w[0] >= w[1]) {
            return Err("in-order walk is not sorted".into());
        }

        Ok(black_height)
    }

    fn validate_from(&self, i: usize, parent: usize) -> Result<(usize, usize), String> {
        if i == NIL {
            return Ok((1, 0));
        }
        let node = &self.nodes[i];
        if node.parent != parent {
            return Err(format!("node {} has a stale parent link", i));
        }
        if node.red && (self.is_red(node.left) || self.is_red(node.right)) {
            return Err(format!("red node {} has a red child", i));
        }
        let (left_height, left_count) = self.validate_from(node.left, i)?;
        let (right_height, right_count) = self.validate_from(node.right, i)?;
        if left_height != right_height {
            return Err(format!("black heights differ below node {}", i));
        }
        Ok((
            left_height + usize::from(!node.red),
            left_count + right_count + 1,
        ))
    }

    fn in_order(&self, i: usize, out: &mut Vec<(u64, u64)>) {
        if i != NIL {
            self.in_order(self.nodes[i].left, out);
            out.push((self.nodes[i].hash, self.nodes[i].seq));
            self.in_order(self.nodes[i].right, out);
        }
    }
}

#[cfg(test)]
impl<K, V> TreeBin<K, V> {
    /// Checks the tree and that the list holds exactly the entries of the tree.
    pub(crate) fn validate(&self, guard: &Guard) -> Result<(), String> {
        let tree = unsafe { &*self.tree.get() };
        tree.validate()?;

        let mut listed = 0;
        let mut entry = self.first(guard);
        while let Some(node) = entry {
            if tree
                .search(tree.root, node.hash, &mut |e| ptr::eq(e, node))
                .is_none()
            {
                return Err("a listed entry is missing from the tree".into());
            }
            listed += 1;
            entry = node.next(guard);
        }
        if listed != tree.len {
            return Err(format!("{} listed entries but {} in the tree", listed, tree.len));
        }
        Ok(())
    }
}
