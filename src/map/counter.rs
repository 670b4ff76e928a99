use std::{
    cell::Cell,
    sync::atomic::{AtomicIsize, AtomicU32, AtomicUsize, Ordering},
};

use crossbeam_utils::CachePadded;
use once_cell::sync::Lazy;

pub(crate) static NUM_CPUS: Lazy<usize> = Lazy::new(available_parallelism);

// The number of cells is fixed to the number of processors rounded up to a power
// of two. Cells are activated lazily: a counter starts with only its base word
// and doubles the number of cells in use each time threads collide.
static MAX_CELLS: Lazy<usize> = Lazy::new(|| NUM_CPUS.next_power_of_two());

fn available_parallelism() -> usize {
    use std::{num::NonZeroUsize, thread::available_parallelism};
    available_parallelism().map(NonZeroUsize::get).unwrap_or(1)
}

/// A signed counter that spreads contended updates over cache-padded cells.
///
/// `sum` is only exact while no update is in flight.
pub(crate) struct StripedCounter {
    base: CachePadded<AtomicIsize>,
    // In order to reduce the chances that processors invalidate the cache line
    // of each other on every update, each cell is padded by `CachePadded`.
    cells: Box<[CachePadded<AtomicIsize>]>,
    active: AtomicUsize,
}

impl Default for StripedCounter {
    fn default() -> Self {
        let cells = std::iter::repeat_with(Default::default)
            .take(*MAX_CELLS)
            .collect::<Vec<_>>()
            .into_boxed_slice();

        Self {
            base: Default::default(),
            cells,
            active: AtomicUsize::new(0),
        }
    }
}

impl StripedCounter {
    /// Adds `delta` and returns `false` if the update collided with another
    /// thread on its way in.
    pub(crate) fn add(&self, delta: isize) -> bool {
        let active = self.active.load(Ordering::Acquire);
        if active == 0 {
            let base = self.base.load(Ordering::Relaxed);
            if self
                .base
                .compare_exchange(base, base + delta, Ordering::AcqRel, Ordering::Relaxed)
                .is_ok()
            {
                return true;
            }
            self.grow(active);
            self.cell_add(delta);
            return false;
        }

        let uncontended = self.try_cell_add(active, delta);
        if !uncontended {
            self.grow(active);
            advance_probe();
            self.cell_add(delta);
        }
        uncontended
    }

    pub(crate) fn sum(&self) -> isize {
        self.cells
            .iter()
            .fold(self.base.load(Ordering::Acquire), |sum, cell| {
                sum + cell.load(Ordering::Acquire)
            })
    }

    fn try_cell_add(&self, active: usize, delta: isize) -> bool {
        let cell = &self.cells[probe() as usize & (active - 1)];
        let current = cell.load(Ordering::Relaxed);
        cell.compare_exchange(current, current + delta, Ordering::AcqRel, Ordering::Relaxed)
            .is_ok()
    }

    /// Adds to a cell, moving on to other cells (and finally the base) until an
    /// update sticks.
    fn cell_add(&self, delta: isize) {
        loop {
            let active = self.active.load(Ordering::Acquire);
            if active == 0 {
                self.base.fetch_add(delta, Ordering::AcqRel);
                return;
            }
            if self.try_cell_add(active, delta) {
                return;
            }
            advance_probe();
            if active == self.cells.len() {
                self.cells[probe() as usize & (active - 1)].fetch_add(delta, Ordering::AcqRel);
                return;
            }
            self.grow(active);
        }
    }

    /// Doubles the number of active cells, unless another thread already did
    /// or all cells are in use.
    fn grow(&self, seen: usize) {
        let max = self.cells.len();
        if seen >= max {
            return;
        }
        let next = if seen == 0 { max.min(2) } else { seen * 2 };
        let _ = self
            .active
            .compare_exchange(seen, next, Ordering::AcqRel, Ordering::Relaxed);
    }
}

thread_local! {
    static PROBE: Cell<u32> = Cell::new(next_seed());
}

fn next_seed() -> u32 {
    static SEED: AtomicU32 = AtomicU32::new(0);
    // Golden-ratio increments keep seeds of consecutive threads far apart. A
    // probe must never be zero, since xorshift would get stuck there.
    SEED.fetch_add(0x9e37_79b9, Ordering::Relaxed)
        .wrapping_add(0x9e37_79b9)
        .max(1)
}

fn probe() -> u32 {
    PROBE.with(Cell::get)
}

fn advance_probe() {
    PROBE.with(|probe| {
        let mut p = probe.get();
        p ^= p << 13;
        p ^= p >> 17;
        p ^= p << 5;
        probe.set(p);
    });
}

#[cfg(test)]
mod tests {
    use super::StripedCounter;
    use std::sync::{Arc, Barrier};

    #[test]
    fn single_thread() {
        let counter = StripedCounter::default();
        assert_eq!(counter.sum(), 0);
        assert!(counter.add(3));
        assert!(counter.add(-1));
        assert_eq!(counter.sum(), 2);
    }

    #[test]
    fn concurrent_adds_sum_up() {
        const NUM_THREADS: usize = 8;
        const NUM_ADDS: usize = 10_000;

        let counter = Arc::new(StripedCounter::default());
        let barrier = Arc::new(Barrier::new(NUM_THREADS));

        let threads: Vec<_> = (0..NUM_THREADS)
            .map(|i| {
                let counter = Arc::clone(&counter);
                let barrier = Arc::clone(&barrier);
                std::thread::spawn(move || {
                    barrier.wait();
                    for _ in 0..NUM_ADDS {
                        counter.add(if i % 2 == 0 { 2 } else { -1 });
                    }
                })
            })
            .collect();

        for result in threads.into_iter().map(|t| t.join()) {
            assert!(result.is_ok());
        }

        let expected = (NUM_THREADS / 2 * NUM_ADDS) as isize;
        assert_eq!(counter.sum(), expected);
    }
}
