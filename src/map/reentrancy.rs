use std::cell::RefCell;

use smallvec::SmallVec;

thread_local! {
    // Addresses of the maps whose `compute` closure is running on this thread.
    static COMPUTING: RefCell<SmallVec<[usize; 4]>> = RefCell::new(SmallVec::new());
}

/// Marks a map as running a user closure under one of its bin locks, until
/// dropped.
pub(crate) struct ComputeScope {
    map: usize,
}

impl ComputeScope {
    pub(crate) fn enter(map: usize) -> Self {
        COMPUTING.with(|maps| maps.borrow_mut().push(map));
        Self { map }
    }
}

impl Drop for ComputeScope {
    fn drop(&mut self) {
        COMPUTING.with(|maps| {
            let mut maps = maps.borrow_mut();
            if let Some(pos) = maps.iter().rposition(|&m| m == self.map) {
                maps.remove(pos);
            }
        });
    }
}

/// Returns `true` if the current thread is inside a `compute` closure of the
/// map at address `map`.
pub(crate) fn is_computing(map: usize) -> bool {
    COMPUTING.with(|maps| maps.borrow().contains(&map))
}
