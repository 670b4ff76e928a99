use super::{
    bin::{self, BinEntry, Node},
    counter::NUM_CPUS,
    table::Table,
    tree_bin::TreeBin,
    HashMap, MAXIMUM_CAPACITY,
};
use crate::error::TryReserveError;

use std::{ptr, sync::atomic::Ordering};

use crossbeam_epoch::{Guard, Owned, Shared};
use crossbeam_utils::Backoff;

// The negative `size_ctl` of a running resize is the stamp of the table length
// shifted into the high half, plus one more than the number of participants.
const RESIZE_STAMP_BITS: u32 = usize::BITS / 2;
const RESIZE_STAMP_SHIFT: u32 = usize::BITS - RESIZE_STAMP_BITS;
const MAX_RESIZERS: isize = (1 << (usize::BITS - RESIZE_STAMP_BITS)) - 1;

/// A number identifying resizes of tables of length `length`. Shifted by
/// `RESIZE_STAMP_SHIFT` it is always negative.
fn resize_stamp(length: usize) -> isize {
    length.leading_zeros() as isize | (1 << (RESIZE_STAMP_BITS - 1))
}

/// The element count past which a table of `length` bins is resized.
pub(super) fn threshold(length: usize, load_factor: f32) -> isize {
    if length >= MAXIMUM_CAPACITY {
        isize::MAX
    } else {
        (length as f64 * load_factor as f64) as isize
    }
}

/// The smallest table length whose threshold is at least `entries`.
pub(super) fn table_length_to_hold(entries: usize, load_factor: f32) -> Option<usize> {
    let needed = (entries as f64 / load_factor as f64).ceil();
    if needed > MAXIMUM_CAPACITY as f64 {
        return None;
    }
    let mut length = super::table_length_for(needed as usize)?;
    while threshold(length, load_factor) < entries as isize {
        length = length.checked_mul(2).filter(|&l| l <= MAXIMUM_CAPACITY)?;
    }
    Some(length)
}

impl<K, V, S> HashMap<K, V, S>
where
    K: 'static,
    V: 'static,
{
    /// Adds `delta` to the element count.
    ///
    /// `check` is the length of the bin an insertion went to. When it is given
    /// and the count has passed the threshold, this thread starts a resize or
    /// joins the one in progress, and repeats while the count stays above the
    /// threshold of the grown table.
    pub(super) fn add_count<'g>(
        &'g self,
        delta: isize,
        check: Option<usize>,
        guard: &'g Guard,
    ) -> Result<(), TryReserveError> {
        let uncontended = self.counter.add(delta);
        let bin_count = match check {
            Some(bin_count) => bin_count,
            None => return Ok(()),
        };
        // Contended short bins leave the check to the next insertion.
        if !uncontended && bin_count <= 1 {
            return Ok(());
        }

        let mut count = self.counter.sum();
        loop {
            let sc = self.size_ctl.load(Ordering::SeqCst);
            if count <= sc {
                return Ok(());
            }
            let table = self.current_table(guard);
            if table.len() >= MAXIMUM_CAPACITY {
                return Ok(());
            }
            if sc < 0 {
                if !self.try_join(table, sc, guard) {
                    return Ok(());
                }
            } else {
                self.start_resize(table, sc, guard)?;
            }
            count = self.counter.sum();
        }
    }

    /// Grows the map until its table has at least `length` bins.
    pub(super) fn grow_to<'g>(&'g self, length: usize, guard: &'g Guard) -> Result<(), TryReserveError> {
        let backoff = Backoff::new();
        loop {
            let sc = self.size_ctl.load(Ordering::SeqCst);
            let table = self.current_table(guard);
            if table.len() >= length || table.len() >= MAXIMUM_CAPACITY {
                return Ok(());
            }
            if sc < 0 {
                if !self.try_join(table, sc, guard) {
                    // The resize is finishing (or has no work left to hand out).
                    backoff.snooze();
                }
            } else {
                self.start_resize(table, sc, guard)?;
            }
        }
    }

    /// Joins the resize of `table` described by `sc`. Returns `false` if there
    /// is nothing left to join.
    fn try_join<'g>(&'g self, table: &'g Table<K, V>, sc: isize, guard: &'g Guard) -> bool {
        let stamp = resize_stamp(table.len());
        let base = stamp << RESIZE_STAMP_SHIFT;
        if ((sc as usize) >> RESIZE_STAMP_SHIFT) as isize != stamp
            || sc == base + 1
            || sc == base + MAX_RESIZERS
        {
            return false;
        }

        let next_table = self.next_table.load(Ordering::SeqCst, guard);
        if next_table.is_null() || self.transfer_index.load(Ordering::SeqCst) <= 0 {
            return false;
        }

        if self
            .size_ctl
            .compare_exchange(sc, sc + 1, Ordering::SeqCst, Ordering::SeqCst)
            .is_ok()
        {
            self.transfer(table, next_table, guard);
        }
        true
    }

    /// Starts resizing `table` if `size_ctl` still holds `sc`.
    fn start_resize<'g>(
        &'g self,
        table: &'g Table<K, V>,
        sc: isize,
        guard: &'g Guard,
    ) -> Result<(), TryReserveError> {
        let length = table.len();
        let base = resize_stamp(length) << RESIZE_STAMP_SHIFT;
        if self
            .size_ctl
            .compare_exchange(sc, base + 2, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            return Ok(());
        }

        let next_table = match Table::try_with_length(length << 1) {
            Ok(next_table) => next_table,
            Err(error) => {
                // Nobody could join without a next table, so the map is back
                // where it was.
                self.size_ctl.store(sc, Ordering::SeqCst);
                #[cfg(feature = "logging")]
                log::error!("Could not grow the map from {length} bins: {error}");
                return Err(error);
            }
        };

        let next_table = Owned::new(next_table).into_shared(guard);
        self.transfer_index.store(length as isize, Ordering::SeqCst);
        self.next_table.store(next_table, Ordering::SeqCst);

        #[cfg(feature = "logging")]
        log::debug!("Resizing the map from {} to {} bins", length, length << 1);

        self.transfer(table, next_table, guard);
        Ok(())
    }

    /// Helps the resize that left a forwarding entry to `next_table` in
    /// `table`, if it is still running. Returns the table to retry in.
    pub(super) fn help_transfer<'g>(
        &'g self,
        table: &'g Table<K, V>,
        next_table: *const Table<K, V>,
        guard: &'g Guard,
    ) -> &'g Table<K, V> {
        let stamp = resize_stamp(table.len());
        let base = stamp << RESIZE_STAMP_SHIFT;

        loop {
            let next = self.next_table.load(Ordering::SeqCst, guard);
            let current = self.table.load(Ordering::SeqCst, guard);
            if next.as_raw() != next_table || !ptr::eq(current.as_raw(), table) {
                break;
            }
            let sc = self.size_ctl.load(Ordering::SeqCst);
            if sc >= 0
                || ((sc as usize) >> RESIZE_STAMP_SHIFT) as isize != stamp
                || sc == base + 1
                || sc == base + MAX_RESIZERS
                || self.transfer_index.load(Ordering::SeqCst) <= 0
            {
                break;
            }
            if self
                .size_ctl
                .compare_exchange(sc, sc + 1, Ordering::SeqCst, Ordering::SeqCst)
                .is_ok()
            {
                self.transfer(table, next, guard);
                break;
            }
        }

        // SAFETY: the forwarding entry was loaded under `guard`, and a table is
        // only retired after the tables that forward to it.
        unsafe { &*next_table }
    }

    /// Moves bins of `table` into `next_table`, claiming a stride of bins at a
    /// time, until no unclaimed bins remain. The last thread to leave publishes
    /// `next_table`.
    fn transfer<'g>(
        &'g self,
        table: &'g Table<K, V>,
        next: Shared<'g, Table<K, V>>,
        guard: &'g Guard,
    ) {
        let length = table.len();
        // SAFETY: `next_table` is only retired after it has been published and
        // later replaced, which happens after this resize completes.
        let next_table = unsafe { next.deref() };
        debug_assert_eq!(next_table.len(), length << 1);

        let stride = if *NUM_CPUS > 1 {
            ((length >> 3) / *NUM_CPUS).max(self.config.min_transfer_stride) as isize
        } else {
            length as isize
        };

        let mut advance = true;
        let mut finishing = false;
        let mut i: isize = 0;
        let mut bound: isize = 0;

        loop {
            while advance {
                i -= 1;
                if i >= bound || finishing {
                    advance = false;
                    break;
                }

                let next_index = self.transfer_index.load(Ordering::SeqCst);
                if next_index <= 0 {
                    i = -1;
                    advance = false;
                    break;
                }

                let next_bound = (next_index - stride).max(0);
                if self
                    .transfer_index
                    .compare_exchange(next_index, next_bound, Ordering::SeqCst, Ordering::SeqCst)
                    .is_ok()
                {
                    bound = next_bound;
                    i = next_index - 1;
                    advance = false;
                    break;
                }
            }

            if i < 0 || i as usize >= length {
                if finishing {
                    self.next_table.store(Shared::null(), Ordering::SeqCst);
                    let old = self.table.swap(next, Ordering::SeqCst, guard);
                    self.size_ctl.store(
                        threshold(length << 1, self.config.load_factor),
                        Ordering::SeqCst,
                    );
                    // SAFETY: the old table is unreachable for threads that pin
                    // from now on, and only holds forwarding entries.
                    unsafe { guard.defer_destroy(old) };

                    #[cfg(feature = "logging")]
                    log::debug!("Resized the map to {} bins", length << 1);
                    return;
                }

                let sc = self.size_ctl.load(Ordering::SeqCst);
                if self
                    .size_ctl
                    .compare_exchange(sc, sc - 1, Ordering::SeqCst, Ordering::SeqCst)
                    .is_ok()
                {
                    if sc - 2 != resize_stamp(length) << RESIZE_STAMP_SHIFT {
                        return;
                    }
                    // Last one out: make sure every bin was moved before
                    // publishing the new table.
                    finishing = true;
                    advance = true;
                    i = length as isize;
                }
                continue;
            }

            let index = i as usize;
            let bin = table.bin(index, guard);
            // SAFETY: bins are retired through the epoch of `guard`.
            match unsafe { bin.as_ref() } {
                None => {
                    let moved = Owned::new(BinEntry::Moved(next_table as *const _));
                    advance = table.cas_bin(index, Shared::null(), moved, guard).is_ok();
                }
                Some(BinEntry::Moved(_)) => advance = true,
                Some(BinEntry::Reserved(lock)) => drop(lock.lock()),
                Some(BinEntry::Node(head)) => {
                    let _bin_lock = head.lock.lock();
                    if table.bin(index, guard) != bin {
                        continue;
                    }

                    let (low, high): (Vec<_>, Vec<_>) = bin::chain_nodes(head, guard)
                        .into_iter()
                        .partition(|node| node.hash & length as u64 == 0);
                    next_table.store_bin(index, bin::relink_chain(&low, guard));
                    next_table.store_bin(index + length, bin::relink_chain(&high, guard));
                    table.store_bin(index, Owned::new(BinEntry::Moved(next_table as *const _)));

                    // SAFETY: the old chain is unreachable from the table now.
                    // Its values live on in the copies.
                    unsafe { bin::defer_destroy_chain(bin, guard) };
                    advance = true;
                }
                Some(BinEntry::Tree(tree_bin)) => {
                    let _bin_lock = tree_bin.lock.lock();
                    if table.bin(index, guard) != bin {
                        continue;
                    }

                    let (low, high): (Vec<_>, Vec<_>) = tree_nodes(tree_bin, guard)
                        .into_iter()
                        .partition(|node| node.hash & length as u64 == 0);
                    next_table.store_bin(index, self.rebuild_bin(&low, guard));
                    next_table.store_bin(index + length, self.rebuild_bin(&high, guard));
                    table.store_bin(index, Owned::new(BinEntry::Moved(next_table as *const _)));

                    // SAFETY: as above. Dropping the tree bin frees its nodes
                    // but not their values.
                    unsafe { guard.defer_destroy(bin) };
                    advance = true;
                }
            }
        }
    }

    /// Builds an unpublished bin for one half of a split tree bin.
    fn rebuild_bin<'g>(&self, nodes: &[&'g Node<K, V>], guard: &'g Guard) -> Shared<'g, BinEntry<K, V>> {
        let chain = bin::relink_chain(nodes, guard);
        if nodes.len() <= self.config.untreeify_threshold {
            return chain;
        }
        Owned::new(BinEntry::Tree(TreeBin::new(chain, guard))).into_shared(guard)
    }

    /// Replaces the chain at `index` with a tree bin, or grows the table if it
    /// is too small for trees.
    pub(super) fn treeify_bin<'g>(&'g self, table: &'g Table<K, V>, index: usize, guard: &'g Guard) {
        if table.len() < self.config.min_treeify_capacity {
            // A failed allocation has been logged by `start_resize`. The bin
            // stays a chain until the next attempt.
            let _ = self.grow_to(table.len() << 1, guard);
            return;
        }

        let bin = table.bin(index, guard);
        // SAFETY: bins are retired through the epoch of `guard`.
        let head = match unsafe { bin.as_ref() } {
            Some(BinEntry::Node(head)) => head,
            _ => return,
        };
        let _bin_lock = head.lock.lock();
        if table.bin(index, guard) != bin {
            return;
        }

        let nodes = bin::chain_nodes(head, guard);
        let chain = bin::relink_chain(&nodes, guard);
        table.store_bin(index, Owned::new(BinEntry::Tree(TreeBin::new(chain, guard))));
        // SAFETY: the old chain is unreachable from the table now.
        unsafe { bin::defer_destroy_chain(bin, guard) };

        #[cfg(feature = "logging")]
        log::debug!("Converted bin {} with {} entries to a tree", index, nodes.len());
    }

    /// Replaces the tree bin at `index` with a chain of the same entries. The
    /// caller must hold the bin lock.
    pub(super) fn untreeify<'g>(
        &self,
        table: &'g Table<K, V>,
        index: usize,
        bin: Shared<'g, BinEntry<K, V>>,
        tree_bin: &'g TreeBin<K, V>,
        guard: &'g Guard,
    ) {
        let nodes = tree_nodes(tree_bin, guard);
        table.store_bin(index, bin::relink_chain(&nodes, guard));
        // SAFETY: the tree bin is unreachable from the table now.
        unsafe { guard.defer_destroy(bin) };

        #[cfg(feature = "logging")]
        log::debug!("Converted bin {} with {} entries back to a chain", index, nodes.len());
    }
}

fn tree_nodes<'g, K, V>(tree_bin: &'g TreeBin<K, V>, guard: &'g Guard) -> Vec<&'g Node<K, V>> {
    match tree_bin.first(guard) {
        Some(first) => bin::chain_nodes(first, guard),
        None => Vec::new(),
    }
}

#[cfg(test)]
mod tests {
    use super::{resize_stamp, table_length_to_hold, threshold, RESIZE_STAMP_SHIFT};
    use crate::map::MAXIMUM_CAPACITY;

    #[test]
    fn stamps_are_negative_once_shifted() {
        for length in [1, 16, 1 << 20, MAXIMUM_CAPACITY] {
            assert!(resize_stamp(length) << RESIZE_STAMP_SHIFT < 0);
        }
        assert_ne!(resize_stamp(16), resize_stamp(32));
    }

    #[test]
    fn thresholds() {
        assert_eq!(threshold(16, 0.75), 12);
        assert_eq!(threshold(32, 0.75), 24);
        assert_eq!(threshold(16, 1.0), 16);
        assert_eq!(threshold(MAXIMUM_CAPACITY, 0.75), isize::MAX);
    }

    #[test]
    fn table_length_to_hold_entries() {
        assert_eq!(table_length_to_hold(0, 0.75), Some(1));
        assert_eq!(table_length_to_hold(12, 0.75), Some(16));
        assert_eq!(table_length_to_hold(13, 0.75), Some(32));
        assert_eq!(table_length_to_hold(100, 0.5), Some(256));
        assert_eq!(table_length_to_hold(usize::MAX, 0.75), None);
    }
}
