use super::{table::Table, tree_bin::TreeBin};

use std::{
    borrow::Borrow,
    hash::{BuildHasher, Hash, Hasher},
    sync::atomic::Ordering,
};

use crossbeam_epoch::{Atomic, Guard, Owned, Shared};
use parking_lot::Mutex;
use triomphe::Arc as TrioArc;

/// The contents of a non-empty bin slot. An empty bin is a null slot.
pub(crate) enum BinEntry<K, V> {
    /// The head of a chain. Every successor in a chain is a `Node` as well.
    Node(Node<K, V>),
    /// A bin that has grown past the treeify threshold.
    Tree(TreeBin<K, V>),
    /// A forwarding sentinel left in the old table once the bin was transferred.
    ///
    /// The pointer is valid as long as the guard that was used to load the old
    /// table is alive: a table is only retired after it stopped being reachable
    /// from the map, and retirement goes through the same epoch.
    Moved(*const Table<K, V>),
    /// A locked placeholder that `compute` installs in an empty bin while the
    /// user's closure runs.
    Reserved(Mutex<()>),
}

// SAFETY: the table pointer in `Moved` and the tree cell in `Tree` are only
// dereferenced under an epoch guard, and the tree is only mutated by the holder
// of the bin lock, so a bin can cross threads whenever its keys and values can.
unsafe impl<K: Send + Sync, V: Send + Sync> Send for BinEntry<K, V> {}
unsafe impl<K: Send + Sync, V: Send + Sync> Sync for BinEntry<K, V> {}

impl<K, V> BinEntry<K, V> {
    pub(crate) fn as_node(&self) -> &Node<K, V> {
        match self {
            BinEntry::Node(node) => node,
            _ => unreachable!("a linked bin entry must be a node"),
        }
    }

    /// Looks up the node for `key`, following forwarding sentinels into newer
    /// tables. Never blocks.
    pub(crate) fn find<'g, Q>(&'g self, hash: u64, key: &Q, guard: &'g Guard) -> Option<&'g Node<K, V>>
    where
        K: Borrow<Q>,
        Q: ?Sized + Eq,
    {
        match self {
            BinEntry::Node(head) => {
                let mut node = head;
                loop {
                    if node.key_matches(hash, key) {
                        return Some(node);
                    }
                    node = node.next(guard)?;
                }
            }
            BinEntry::Tree(tree_bin) => tree_bin.find(hash, key, guard),
            BinEntry::Reserved(_) => None,
            BinEntry::Moved(next_table) => {
                // SAFETY: see the comment on `Moved`.
                let mut table: &'g Table<K, V> = unsafe { &**next_table };
                loop {
                    let bin = table.bin(table.bin_index(hash), guard);
                    match unsafe { bin.as_ref() }? {
                        BinEntry::Moved(next_table) => table = unsafe { &**next_table },
                        bin => return bin.find(hash, key, guard),
                    }
                }
            }
        }
    }
}

/// A key-value entry.
///
/// The hash and the key never change once the node is created. The value is
/// swapped in place under the bin lock.
pub(crate) struct Node<K, V> {
    pub(crate) hash: u64,
    pub(crate) key: TrioArc<K>,
    pub(crate) value: Atomic<V>,
    pub(crate) next: Atomic<BinEntry<K, V>>,
    /// The bin lock, used while this node is the head of a chain.
    pub(crate) lock: Mutex<()>,
}

impl<K, V> Node<K, V> {
    pub(crate) fn new(hash: u64, key: TrioArc<K>, value: V) -> Self {
        Self {
            hash,
            key,
            value: Atomic::new(value),
            next: Atomic::null(),
            lock: Mutex::new(()),
        }
    }

    /// Creates a node that shares this node's key and value, linked to `next`.
    ///
    /// The value is not owned by either node; whoever unlinks the last node
    /// referring to it is responsible for destroying it.
    pub(crate) fn relink<'g>(&self, next: Shared<'g, BinEntry<K, V>>, guard: &'g Guard) -> Self {
        Self {
            hash: self.hash,
            key: TrioArc::clone(&self.key),
            value: Atomic::from(self.value.load(Ordering::Acquire, guard)),
            next: Atomic::from(next),
            lock: Mutex::new(()),
        }
    }

    /// Takes the value out of a node that was never published.
    pub(crate) fn take_value(entry: Owned<BinEntry<K, V>>) -> Owned<V> {
        match *entry.into_box() {
            // SAFETY: the node was never shared, so nobody else refers to the value.
            BinEntry::Node(node) => unsafe { node.value.into_owned() },
            _ => unreachable!("only nodes carry values"),
        }
    }

    #[inline]
    pub(crate) fn key_matches<Q>(&self, hash: u64, key: &Q) -> bool
    where
        K: Borrow<Q>,
        Q: ?Sized + Eq,
    {
        self.hash == hash && {
            let this_key: &Q = (*self.key).borrow();
            this_key == key
        }
    }

    #[inline]
    pub(crate) fn next<'g>(&self, guard: &'g Guard) -> Option<&'g Node<K, V>> {
        let next = self.next.load(Ordering::Acquire, guard);
        // SAFETY: unlinked nodes are destroyed through the epoch of `guard`.
        unsafe { next.as_ref() }.map(BinEntry::as_node)
    }

    #[inline]
    pub(crate) fn value<'g>(&self, guard: &'g Guard) -> &'g V {
        let value = self.value.load(Ordering::Acquire, guard);
        // SAFETY: a published node always holds a value, and a replaced value is
        // destroyed through the epoch of `guard`.
        unsafe { value.deref() }
    }
}

/// Mixes the high bits of a hash into the low bits, which are the only ones
/// used to pick a bin.
#[inline]
pub(crate) fn spread(hash: u64) -> u64 {
    let h = hash ^ (hash >> 32);
    h ^ (h >> 16)
}

pub(crate) fn hash<Q, S>(build_hasher: &S, key: &Q) -> u64
where
    Q: ?Sized + Hash,
    S: BuildHasher,
{
    let mut hasher = build_hasher.build_hasher();
    key.hash(&mut hasher);

    spread(hasher.finish())
}

/// Builds an unpublished chain of fresh nodes sharing the keys and values of
/// `nodes`, in the same order.
pub(crate) fn relink_chain<'g, K, V>(
    nodes: &[&'g Node<K, V>],
    guard: &'g Guard,
) -> Shared<'g, BinEntry<K, V>> {
    nodes.iter().rev().fold(Shared::null(), |next, node| {
        Owned::new(BinEntry::Node(node.relink(next, guard))).into_shared(guard)
    })
}

/// Collects the nodes of the chain starting at `head`.
pub(crate) fn chain_nodes<'g, K, V>(head: &'g Node<K, V>, guard: &'g Guard) -> Vec<&'g Node<K, V>> {
    let mut nodes = vec![head];
    let mut node = head;
    while let Some(next) = node.next(guard) {
        nodes.push(next);
        node = next;
    }
    nodes
}

/// Retires every node of an unlinked chain, leaving the values alone.
///
/// # Safety
///
/// The chain must be unreachable for threads that pin after this call.
pub(crate) unsafe fn defer_destroy_chain<'g, K, V>(
    mut entry: Shared<'g, BinEntry<K, V>>,
    guard: &'g Guard,
) {
    while let Some(bin) = entry.as_ref() {
        let next = bin.as_node().next.load(Ordering::Acquire, guard);
        guard.defer_destroy(entry);
        entry = next;
    }
}

/// Retires every value of an unlinked chain and returns how many there were.
///
/// # Safety
///
/// The chain must be unreachable for threads that pin after this call, and no
/// other chain may share its values.
pub(crate) unsafe fn defer_destroy_values<'g, K, V>(
    mut entry: Shared<'g, BinEntry<K, V>>,
    guard: &'g Guard,
) -> usize {
    let mut count = 0;
    while let Some(bin) = entry.as_ref() {
        let node = bin.as_node();
        guard.defer_destroy(node.value.load(Ordering::Acquire, guard));
        count += 1;
        entry = node.next.load(Ordering::Acquire, guard);
    }
    count
}

/// Immediately drops every value of a chain.
///
/// # Safety
///
/// The caller must have exclusive access to the chain and its values.
pub(crate) unsafe fn drop_values<'g, K, V>(mut entry: Shared<'g, BinEntry<K, V>>, guard: &'g Guard) {
    while let Some(bin) = entry.as_ref() {
        let node = bin.as_node();
        let value = node.value.swap(Shared::null(), Ordering::Relaxed, guard);
        if !value.is_null() {
            drop(value.into_owned());
        }
        entry = node.next.load(Ordering::Relaxed, guard);
    }
}

/// Immediately drops every node of a chain, leaving the values alone.
///
/// # Safety
///
/// The caller must have exclusive access to the chain.
pub(crate) unsafe fn drop_chain<'g, K, V>(mut entry: Shared<'g, BinEntry<K, V>>, guard: &'g Guard) {
    while !entry.is_null() {
        let owned = entry.into_owned();
        entry = owned.as_node().next.load(Ordering::Relaxed, guard);
        drop(owned);
    }
}

#[cfg(test)]
mod tests {
    use super::{drop_chain, drop_values, relink_chain, spread, BinEntry, Node};
    use crate::map::table::Table;

    use crossbeam_epoch::{Owned, Shared};
    use std::sync::atomic::Ordering;
    use triomphe::Arc as TrioArc;

    fn new_entry(hash: u64, key: usize, value: usize) -> Owned<BinEntry<usize, usize>> {
        Owned::new(BinEntry::Node(Node::new(hash, TrioArc::new(key), value)))
    }

    #[test]
    fn spread_folds_high_bits() {
        // Two hashes that only differ above bit 32 must land in different bins
        // of a small table.
        let a = spread(0x0000_0001_0000_0000);
        let b = spread(0x0000_0002_0000_0000);
        assert_ne!(a & 0xf, b & 0xf);
        assert_eq!(spread(0), 0);
    }

    #[test]
    fn find_in_chain() {
        let guard = &crossbeam_epoch::pin();
        let second = new_entry(4, 5, 6).into_shared(guard);
        let first = new_entry(1, 2, 3);
        first.as_node().next.store(second, Ordering::Relaxed);
        let first = first.into_shared(guard);
        let head = unsafe { first.deref() };

        assert!(head.find(1, &0, guard).is_none());
        assert!(head.find(4, &2, guard).is_none());
        assert_eq!(head.find(1, &2, guard).map(|n| *n.key), Some(2));
        let found = head.find(4, &5, guard).map(|n| *n.value(guard));
        assert_eq!(found, Some(6));

        unsafe {
            drop_values(first, crossbeam_epoch::unprotected());
            drop_chain(first, crossbeam_epoch::unprotected());
        }
    }

    #[test]
    fn find_follows_forwarding() {
        let guard = &crossbeam_epoch::pin();
        let table = Table::<usize, usize>::with_length(2);
        let entry = new_entry(1, 2, 3).into_shared(guard);
        table.store_bin(1, entry);

        let moved = BinEntry::Moved(&table as *const Table<usize, usize>);
        assert_eq!(moved.find(1, &2, guard).map(|n| *n.value(guard)), Some(3));
        assert!(moved.find(0, &2, guard).is_none());

        let detached = table.swap_bin(1, Shared::null(), guard);
        unsafe {
            drop_values(detached, crossbeam_epoch::unprotected());
            drop_chain(detached, crossbeam_epoch::unprotected());
        }
    }

    #[test]
    fn relink_keeps_order_and_shares_values() {
        let guard = &crossbeam_epoch::pin();
        let third = new_entry(3, 3, 30).into_shared(guard);
        let second = new_entry(2, 2, 20);
        second.as_node().next.store(third, Ordering::Relaxed);
        let second = second.into_shared(guard);
        let first = new_entry(1, 1, 10);
        first.as_node().next.store(second, Ordering::Relaxed);
        let first = first.into_shared(guard);

        let nodes = super::chain_nodes(unsafe { first.deref() }.as_node(), guard);
        assert_eq!(nodes.len(), 3);

        let copy = relink_chain(&nodes[1..], guard);
        let copied = super::chain_nodes(unsafe { copy.deref() }.as_node(), guard);
        assert_eq!(copied.iter().map(|n| *n.key).collect::<Vec<_>>(), vec![2, 3]);
        assert_eq!(
            copied[0].value.load(Ordering::Relaxed, guard),
            nodes[1].value.load(Ordering::Relaxed, guard)
        );

        unsafe {
            drop_chain(copy, crossbeam_epoch::unprotected());
            drop_values(first, crossbeam_epoch::unprotected());
            drop_chain(first, crossbeam_epoch::unprotected());
        }
    }
}
