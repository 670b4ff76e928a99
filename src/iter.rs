use crate::map::{
    bin::{BinEntry, Node},
    table::Table,
    HashMap,
};

use std::{collections::HashMap as StdHashMap, iter::FusedIterator};

use crossbeam_epoch::Guard;
use smallvec::SmallVec;

/// Iterator visiting all key-value pairs in a map in arbitrary order.
///
/// Call [`HashMap::iter`](./struct.HashMap.html#method.iter) method to obtain an
/// `Iter`.
///
/// The bins of the table are split into groups by their index modulo the table
/// length at the time the iterator was created. A key stays in its group when
/// the table grows, so the iterator collects one group at a time, under a
/// fresh epoch guard, and never yields a key twice.
pub struct Iter<'i, K, V, S> {
    entries: Option<Vec<(K, V)>>,
    map: &'i HashMap<K, V, S>,
    num_groups: usize,
    group_index: usize,
    is_done: bool,
}

impl<'i, K, V, S> Iter<'i, K, V, S>
where
    K: 'static,
    V: 'static,
{
    pub(crate) fn new(map: &'i HashMap<K, V, S>) -> Self {
        let guard = &crossbeam_epoch::pin();
        let num_groups = map.current_table(guard).len();

        Self {
            entries: None,
            map,
            num_groups,
            group_index: 0,
            is_done: false,
        }
    }
}

impl<'i, K, V, S> Iterator for Iter<'i, K, V, S>
where
    K: Eq + Clone + 'static,
    V: Clone + 'static,
{
    type Item = (K, V);

    fn next(&mut self) -> Option<Self::Item> {
        if self.is_done {
            return None;
        }

        while let Some(entries) = self.current_entries() {
            if let entry @ Some(_) = entries.pop() {
                return entry;
            }
        }

        self.is_done = true;
        None
    }
}

impl<'i, K, V, S> FusedIterator for Iter<'i, K, V, S>
where
    K: Eq + Clone + 'static,
    V: Clone + 'static,
{
}

impl<'i, K, V, S> Iter<'i, K, V, S>
where
    K: Eq + Clone + 'static,
    V: Clone + 'static,
{
    fn current_entries(&mut self) -> Option<&mut Vec<(K, V)>> {
        while self.entries.as_ref().map_or(true, Vec::is_empty) {
            if self.group_index >= self.num_groups {
                return None;
            }

            self.entries = Some(self.collect_group(self.group_index));
            self.group_index += 1;
        }

        self.entries.as_mut()
    }

    /// Clones the entries of every bin whose index is `group` modulo the
    /// initial table length.
    fn collect_group(&self, group: usize) -> Vec<(K, V)> {
        let guard = &crossbeam_epoch::pin();
        let table = self.map.current_table(guard);

        let mut nodes = GroupNodes::new();
        let mut index = group;
        while index < table.len() {
            collect_bin(table, index, &mut nodes, guard);
            index += self.num_groups;
        }

        nodes
            .nodes
            .into_iter()
            .map(|node| ((*node.key).clone(), node.value(guard).clone()))
            .collect()
    }
}

/// The nodes collected for one group, indexed by hash so that a key is only
/// compared with the keys that share its hash.
struct GroupNodes<'g, K, V> {
    nodes: Vec<&'g Node<K, V>>,
    by_hash: StdHashMap<u64, SmallVec<[usize; 1]>>,
}

impl<'g, K, V> GroupNodes<'g, K, V>
where
    K: Eq,
{
    fn new() -> Self {
        Self {
            nodes: Vec::new(),
            by_hash: StdHashMap::new(),
        }
    }

    /// Adds `node` unless a node with an equal key was added before, which
    /// happens when a key is removed and inserted again while the group is
    /// being collected.
    fn push(&mut self, node: &'g Node<K, V>) {
        let indices = self.by_hash.entry(node.hash).or_default();
        if indices.iter().any(|&i| *self.nodes[i].key == *node.key) {
            return;
        }
        indices.push(self.nodes.len());
        self.nodes.push(node);
    }
}

/// Collects the nodes of a bin, following forwarding entries to both halves of
/// the split bin.
fn collect_bin<'g, K, V>(
    table: &'g Table<K, V>,
    index: usize,
    nodes: &mut GroupNodes<'g, K, V>,
    guard: &'g Guard,
) where
    K: Eq,
{
    let bin = table.bin(index, guard);
    // SAFETY: bins are retired through the epoch of `guard`.
    let first = match unsafe { bin.as_ref() } {
        None | Some(BinEntry::Reserved(_)) => return,
        Some(BinEntry::Node(head)) => Some(head),
        Some(BinEntry::Tree(tree_bin)) => tree_bin.first(guard),
        Some(BinEntry::Moved(next_table)) => {
            // SAFETY: see `BinEntry::Moved`.
            let next_table = unsafe { &**next_table };
            collect_bin(next_table, index, nodes, guard);
            collect_bin(next_table, index + table.len(), nodes, guard);
            return;
        }
    };

    let mut node = first;
    while let Some(this) = node {
        nodes.push(this);
        node = this.next(guard);
    }
}
