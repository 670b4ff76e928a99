use super::bin::BinEntry;
use crate::error::TryReserveError;

use std::sync::atomic::Ordering;

use crossbeam_epoch::{Atomic, CompareExchangeError, Guard, Pointer, Shared};

#[cfg(test)]
thread_local! {
    static FAIL_NEXT_ALLOCATION: std::cell::Cell<bool> = std::cell::Cell::new(false);
}

/// Makes the next `try_with_length` on this thread fail as if the allocator
/// had run out of memory.
#[cfg(test)]
pub(crate) fn fail_next_allocation() {
    FAIL_NEXT_ALLOCATION.with(|fail| fail.set(true));
}

/// A power-of-two array of bin heads.
pub(crate) struct Table<K, V> {
    bins: Box<[Atomic<BinEntry<K, V>>]>,
}

impl<K, V> Table<K, V> {
    pub(crate) fn with_length(length: usize) -> Self {
        assert!(length.is_power_of_two());

        let bins = std::iter::repeat_with(Atomic::null)
            .take(length)
            .collect::<Vec<_>>()
            .into_boxed_slice();

        Self { bins }
    }

    /// Like `with_length`, but reports allocation failure instead of aborting.
    pub(crate) fn try_with_length(length: usize) -> Result<Self, TryReserveError> {
        assert!(length.is_power_of_two());

        #[cfg(test)]
        if FAIL_NEXT_ALLOCATION.with(|fail| fail.replace(false)) {
            return Err(TryReserveError::AllocError { capacity: length });
        }

        let mut bins = Vec::new();
        bins.try_reserve_exact(length)
            .map_err(|_| TryReserveError::AllocError { capacity: length })?;
        bins.resize_with(length, Atomic::null);

        Ok(Self {
            bins: bins.into_boxed_slice(),
        })
    }

    #[inline]
    pub(crate) fn len(&self) -> usize {
        self.bins.len()
    }

    #[inline]
    pub(crate) fn bin_index(&self, hash: u64) -> usize {
        (hash & (self.bins.len() as u64 - 1)) as usize
    }

    #[inline]
    pub(crate) fn bin<'g>(&self, index: usize, guard: &'g Guard) -> Shared<'g, BinEntry<K, V>> {
        self.bins[index].load(Ordering::Acquire, guard)
    }

    #[inline]
    pub(crate) fn cas_bin<'g, P>(
        &self,
        index: usize,
        current: Shared<'_, BinEntry<K, V>>,
        new: P,
        guard: &'g Guard,
    ) -> Result<Shared<'g, BinEntry<K, V>>, CompareExchangeError<'g, BinEntry<K, V>, P>>
    where
        P: Pointer<BinEntry<K, V>>,
    {
        self.bins[index].compare_exchange(current, new, Ordering::AcqRel, Ordering::Acquire, guard)
    }

    /// Overwrites a bin. The caller must hold the bin lock (or own the table).
    #[inline]
    pub(crate) fn store_bin<P>(&self, index: usize, new: P)
    where
        P: Pointer<BinEntry<K, V>>,
    {
        self.bins[index].store(new, Ordering::Release)
    }

    #[inline]
    pub(crate) fn swap_bin<'g, P>(
        &self,
        index: usize,
        new: P,
        guard: &'g Guard,
    ) -> Shared<'g, BinEntry<K, V>>
    where
        P: Pointer<BinEntry<K, V>>,
    {
        self.bins[index].swap(new, Ordering::AcqRel, guard)
    }
}

impl<K, V> Drop for Table<K, V> {
    fn drop(&mut self) {
        // SAFETY: a table is only dropped once no thread can reach it. By then
        // the map has unlinked every chain and tree it owned, so what is left are
        // the forwarding sentinels of a retired table.
        let guard = unsafe { crossbeam_epoch::unprotected() };

        for bin in self.bins.iter() {
            let entry = bin.swap(Shared::null(), Ordering::Relaxed, guard);
            if !entry.is_null() {
                drop(unsafe { entry.into_owned() });
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::Table;
    use crate::{error::TryReserveError, map::bin::BinEntry};

    use crossbeam_epoch::{Owned, Shared};

    #[test]
    fn bin_index_masks_the_hash() {
        let table = Table::<u32, u32>::with_length(16);
        assert_eq!(table.len(), 16);
        assert_eq!(table.bin_index(0x35), 0x5);
        assert_eq!(table.bin_index(u64::MAX), 15);

        let table = Table::<u32, u32>::with_length(1);
        assert_eq!(table.bin_index(u64::MAX), 0);
    }

    #[test]
    fn cas_bin_only_replaces_the_expected_head() {
        let guard = &crossbeam_epoch::pin();
        let table = Table::<u32, u32>::with_length(4);
        let other = Table::<u32, u32>::with_length(8);

        let moved = Owned::new(BinEntry::Moved(&other as *const Table<u32, u32>));
        let installed = table.cas_bin(2, Shared::null(), moved, guard);
        assert!(installed.is_ok());

        let rejected = Owned::new(BinEntry::Moved(&other as *const Table<u32, u32>));
        let err = table.cas_bin(2, Shared::null(), rejected, guard).unwrap_err();
        assert!(!err.current.is_null());
        drop(err.new);
    }

    #[test]
    fn try_with_length_allocates_every_bin() {
        let guard = &crossbeam_epoch::pin();
        let table = Table::<u32, u32>::try_with_length(64).unwrap();
        assert_eq!(table.len(), 64);
        assert!((0..64).all(|i| table.bin(i, guard).is_null()));
    }

    #[test]
    fn injected_allocation_failure_fires_once() {
        super::fail_next_allocation();
        assert_eq!(
            Table::<u32, u32>::try_with_length(8).err(),
            Some(TryReserveError::AllocError { capacity: 8 })
        );
        assert!(Table::<u32, u32>::try_with_length(8).is_ok());
    }
}
