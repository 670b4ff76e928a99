use std::{
    borrow::Borrow,
    hash::{BuildHasher, Hash, Hasher},
    ops::Deref,
    sync::{
        atomic::{AtomicUsize, Ordering},
        Arc,
    },
};

use crossbeam_epoch::Owned;

/// Wraps a key or a value and reports to its `DropNotifier` when dropped.
#[derive(Debug)]
pub(crate) struct NoisyDropper<T: ?Sized> {
    parent: Arc<DropNotifier>,
    pub elem: T,
}

impl<T> NoisyDropper<T> {
    pub(crate) fn new(parent: Arc<DropNotifier>, elem: T) -> Self {
        Self { parent, elem }
    }
}

impl<T: ?Sized> Drop for NoisyDropper<T> {
    fn drop(&mut self) {
        self.parent.drops.fetch_add(1, Ordering::Relaxed);
    }
}

impl<T: ?Sized + PartialEq> PartialEq for NoisyDropper<T> {
    fn eq(&self, other: &Self) -> bool {
        self.elem == other.elem
    }
}

impl<T: ?Sized + Eq> Eq for NoisyDropper<T> {}

impl<T: ?Sized + Hash> Hash for NoisyDropper<T> {
    fn hash<H: Hasher>(&self, hasher: &mut H) {
        self.elem.hash(hasher);
    }
}

impl<T: ?Sized> Borrow<T> for NoisyDropper<T> {
    fn borrow(&self) -> &T {
        &self.elem
    }
}

impl<T: ?Sized> Deref for NoisyDropper<T> {
    type Target = T;

    fn deref(&self) -> &Self::Target {
        &self.elem
    }
}

/// Counts the drops of the `NoisyDropper`s that point to it. A wrapper must be
/// dropped exactly once, so the count must end up at one.
#[derive(Debug, Default)]
pub(crate) struct DropNotifier {
    drops: AtomicUsize,
}

impl DropNotifier {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    pub(crate) fn was_dropped(&self) -> bool {
        self.drop_count() > 0
    }

    pub(crate) fn drop_count(&self) -> usize {
        self.drops.load(Ordering::Relaxed)
    }
}

/// Pins and flushes the epoch often enough that every destruction deferred
/// before the call has run by the time it returns.
pub(crate) fn run_deferred() {
    for _ in 0..65536 {
        let guard = crossbeam_epoch::pin();

        unsafe { guard.defer_destroy(Owned::new(0).into_shared(&guard)) };

        guard.flush();
    }
}

/// A `BuildHasher` whose hashes keep only the bits in `mask`, so that keys
/// collide as much as a test needs. `mask == 0` sends every key to bin 0.
#[derive(Clone, Copy, Debug)]
pub(crate) struct CollidingHasher {
    mask: u64,
}

impl CollidingHasher {
    pub(crate) fn new(mask: u64) -> Self {
        Self { mask }
    }

    /// Every key hashes to zero.
    pub(crate) fn constant() -> Self {
        Self::new(0)
    }
}

impl BuildHasher for CollidingHasher {
    type Hasher = Masked;

    fn build_hasher(&self) -> Self::Hasher {
        Masked {
            inner: std::collections::hash_map::DefaultHasher::new(),
            mask: self.mask,
        }
    }
}

pub(crate) struct Masked {
    inner: std::collections::hash_map::DefaultHasher,
    mask: u64,
}

impl Hasher for Masked {
    fn finish(&self) -> u64 {
        self.inner.finish() & self.mask
    }

    fn write(&mut self, bytes: &[u8]) {
        self.inner.write(bytes);
    }
}
