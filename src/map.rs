//! A concurrent hash map with lock-free reads.
//!
//! The map is an array of bins. A bin is empty (a null pointer), a chain of
//! nodes, a red-black tree of nodes, a forwarding entry left behind by a resize,
//! or a reservation held by a running `compute`. Lookups load the bin with
//! acquire ordering and walk it without taking any lock. Writers lock the head
//! of the bin they touch, check that the head is still the one they locked, and
//! mutate the bin in place. Nodes and values that are unlinked are retired
//! through `crossbeam-epoch`, so a reader that is still looking at them stays
//! safe.
//!
//! A chain that grows past the treeify threshold is rebuilt as a tree once the
//! table is large enough; on smaller tables the map grows instead. A tree that
//! shrinks to the untreeify threshold turns back into a chain.
//!
//! Resizing doubles the table. The thread that starts a resize allocates the
//! new table up front; after that any number of threads claim strides of old
//! bins and move them. Each moved bin is split in two, by the bit of the hash
//! that the doubled table adds, and its old slot is replaced by a forwarding
//! entry. Reads that hit a forwarding entry continue in the new table, writes
//! help with the resize first. The element count is kept in a striped counter
//! and compared with the threshold after every insertion.

pub(crate) mod bin;
mod counter;
mod reentrancy;
mod resize;
pub(crate) mod table;
pub(crate) mod tree_bin;


use self::{
    bin::{BinEntry, Node},
    counter::StripedCounter,
    reentrancy::ComputeScope,
    table::Table,
    tree_bin::TreeBin,
};
use crate::{
    builder::HashMapBuilder,
    error::{ComputeError, ConfigError, TryReserveError},
    iter::Iter,
};

use std::{
    borrow::Borrow,
    collections::hash_map::RandomState,
    fmt,
    hash::{BuildHasher, Hash},
    sync::atomic::{AtomicIsize, Ordering},
};

use crossbeam_epoch::{Atomic, Guard, Owned, Shared};
use parking_lot::Mutex;
use triomphe::Arc as TrioArc;

/// Default hasher for `HashMap`.
pub type DefaultHashBuilder = RandomState;

/// The largest table, in bins. Keeps `size_ctl` thresholds representable as
/// positive `isize` values.
pub(crate) const MAXIMUM_CAPACITY: usize = 1 << (usize::BITS - 2);

pub(crate) const DEFAULT_CAPACITY: usize = 16;

/// Tuning knobs shared by the builder and the map.
#[derive(Clone, Copy, Debug, PartialEq)]
pub(crate) struct Config {
    pub(crate) load_factor: f32,
    pub(crate) treeify_threshold: usize,
    pub(crate) untreeify_threshold: usize,
    pub(crate) min_treeify_capacity: usize,
    pub(crate) min_transfer_stride: usize,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            load_factor: 0.75,
            treeify_threshold: 8,
            untreeify_threshold: 6,
            min_treeify_capacity: 64,
            min_transfer_stride: 16,
        }
    }
}

/// Returns the table length for a requested capacity, or `None` if it is
/// larger than [`MAXIMUM_CAPACITY`].
pub(crate) fn table_length_for(capacity: usize) -> Option<usize> {
    let length = capacity.max(1).checked_next_power_of_two()?;
    (length <= MAXIMUM_CAPACITY).then_some(length)
}

/// A concurrent hash map.
///
/// Reads never block: [`get`] and iteration walk the bins without taking a
/// lock, even while the map is being resized. Writes lock only the bin they
/// touch, so writers to different bins proceed in parallel. When a bin
/// collects many keys with colliding hashes it is turned into a balanced tree,
/// which keeps lookups logarithmic.
///
/// Values are shared between the map and concurrent readers, so the methods
/// that hand a value back return a clone of it. The `_and` variants such as
/// [`get_and`] pass a reference to a closure instead.
///
/// By default, `HashMap` uses the hashing algorithm of
/// `std::collections::HashMap`, which is resistant to HashDoS attacks. The
/// hasher can be replaced with [`with_hasher`], [`with_capacity_and_hasher`] or
/// [`HashMapBuilder::build_with_hasher`].
///
/// It is required that the keys implement the [`Eq`] and [`Hash`] traits, and
/// that equal keys have equal hashes:
///
/// ```text
/// k1 == k2 -> hash(k1) == hash(k2)
/// ```
///
/// It is a logic error for a key to be modified in such a way that its hash or
/// its equality changes while it is in the map.
///
/// # Examples
///
/// ```rust
/// use binmap::HashMap;
/// use std::sync::Arc;
///
/// let map = Arc::new(HashMap::new());
///
/// let handles: Vec<_> = (0..4)
///     .map(|t| {
///         let map = Arc::clone(&map);
///         std::thread::spawn(move || {
///             for i in 0..100 {
///                 map.insert(t * 100 + i, i);
///             }
///         })
///     })
///     .collect();
///
/// for handle in handles {
///     handle.join().unwrap();
/// }
///
/// assert_eq!(map.len(), 400);
/// assert_eq!(map.get(&205), Some(5));
/// ```
///
/// # Lifetimes
///
/// Removed entries and replaced values are dropped once no thread can still
/// read them, which may be after the map itself is gone. Keys and values must
/// therefore be `'static`; a map cannot hold borrowed data:
///
/// ```compile_fail
/// use binmap::HashMap;
/// use std::sync::atomic::AtomicUsize;
///
/// let drops = AtomicUsize::new(0);
/// let map = HashMap::new();
/// map.insert(1, &drops);
/// ```
///
/// # Colliding hashes
///
/// Keys are ordered inside a tree bin by their hash, and keys whose full
/// 64-bit hashes are equal are ordered by insertion only. Looking up or
/// removing one of `n` such keys takes `O(n)` time, as it does in a chain. A
/// hasher that spreads keys well keeps this case rare.
///
/// [`get`]: #method.get
/// [`get_and`]: #method.get_and
/// [`with_hasher`]: #method.with_hasher
/// [`with_capacity_and_hasher`]: #method.with_capacity_and_hasher
/// [`HashMapBuilder::build_with_hasher`]: ./struct.HashMapBuilder.html#method.build_with_hasher
/// [`Eq`]: https://doc.rust-lang.org/std/cmp/trait.Eq.html
/// [`Hash`]: https://doc.rust-lang.org/std/hash/trait.Hash.html
pub struct HashMap<K, V, S = DefaultHashBuilder> {
    table: Atomic<Table<K, V>>,
    // Only non-null while a resize is in progress.
    next_table: Atomic<Table<K, V>>,
    // The next bin index (exclusive) to hand out to a resizer.
    transfer_index: AtomicIsize,
    // Zero or positive: the element count that triggers the next resize.
    // Negative: a resize is running. The high half holds a stamp of the table
    // length being resized, the low half holds one more than the number of
    // threads taking part.
    size_ctl: AtomicIsize,
    counter: StripedCounter,
    config: Config,
    build_hasher: S,
}

impl<K, V> HashMap<K, V, DefaultHashBuilder>
where
    K: 'static,
    V: 'static,
{
    /// Creates an empty `HashMap` with the default capacity of 16 bins.
    pub fn new() -> Self {
        Self::with_capacity_and_hasher(DEFAULT_CAPACITY, DefaultHashBuilder::default())
    }

    /// Creates an empty `HashMap` with at least `capacity` bins.
    ///
    /// The number of bins is `capacity` rounded up to the next power of two.
    ///
    /// # Panics
    ///
    /// Panics if `capacity` is zero or if the rounded capacity exceeds the
    /// maximum number of bins.
    pub fn with_capacity(capacity: usize) -> Self {
        Self::with_capacity_and_hasher(capacity, DefaultHashBuilder::default())
    }

    /// Returns a [`HashMapBuilder`][builder-struct] to configure a map.
    ///
    /// [builder-struct]: ./struct.HashMapBuilder.html
    pub fn builder() -> HashMapBuilder<K, V> {
        HashMapBuilder::default()
    }
}

impl<K, V, S> HashMap<K, V, S>
where
    K: 'static,
    V: 'static,
{
    /// Creates an empty `HashMap` with the default capacity, using
    /// `build_hasher` to hash the keys.
    pub fn with_hasher(build_hasher: S) -> Self {
        Self::with_capacity_and_hasher(DEFAULT_CAPACITY, build_hasher)
    }

    /// Creates an empty `HashMap` with at least `capacity` bins, using
    /// `build_hasher` to hash the keys.
    ///
    /// # Panics
    ///
    /// Panics if `capacity` is zero or if the rounded capacity exceeds the
    /// maximum number of bins. Use [`HashMap::builder`] to get these as a
    /// [`ConfigError`] instead.
    pub fn with_capacity_and_hasher(capacity: usize, build_hasher: S) -> Self {
        if capacity == 0 {
            panic!("{}", ConfigError::ZeroCapacity);
        }
        let length = match table_length_for(capacity) {
            Some(length) => length,
            None => panic!(
                "{}",
                ConfigError::CapacityTooLarge {
                    requested: capacity,
                    maximum: MAXIMUM_CAPACITY,
                }
            ),
        };
        Self::from_parts(length, Config::default(), build_hasher)
    }

    pub(crate) fn from_parts(length: usize, config: Config, build_hasher: S) -> Self {
        Self {
            table: Atomic::new(Table::with_length(length)),
            next_table: Atomic::null(),
            transfer_index: AtomicIsize::new(0),
            size_ctl: AtomicIsize::new(resize::threshold(length, config.load_factor)),
            counter: StripedCounter::default(),
            config,
            build_hasher,
        }
    }

    /// Returns the number of elements in the map.
    ///
    /// While other threads insert or remove entries the result is an
    /// approximation; it is exact once they are done.
    pub fn len(&self) -> usize {
        self.counter.sum().max(0) as usize
    }

    /// Returns `true` if the map contains no elements.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Returns the number of bins of the current table.
    ///
    /// The map grows once it holds more than `capacity() * load_factor`
    /// elements.
    pub fn capacity(&self) -> usize {
        let guard = &crossbeam_epoch::pin();
        self.current_table(guard).len()
    }

    /// Returns a reference to the map's `BuildHasher`.
    pub fn hasher(&self) -> &S {
        &self.build_hasher
    }

    pub(crate) fn current_table<'g>(&self, guard: &'g Guard) -> &'g Table<K, V> {
        // SAFETY: the table is never null, and a replaced table is retired
        // through the epoch of `guard`.
        unsafe { self.table.load(Ordering::Acquire, guard).deref() }
    }

    fn id(&self) -> usize {
        self as *const Self as usize
    }

    /// Panics if called from a `compute` closure running on this map, which
    /// would otherwise risk locking a bin that the caller already holds.
    fn check_reentrancy(&self) {
        assert!(
            !reentrancy::is_computing(self.id()),
            "a compute closure must not mutate the map it is computing on"
        );
    }

    /// Runs a user closure while a bin lock of this map is held.
    fn in_compute_scope<T>(&self, f: impl FnOnce() -> T) -> T {
        let _scope = ComputeScope::enter(self.id());
        f()
    }

    fn count_insertion<'g>(&'g self, bin_count: usize, guard: &'g Guard) {
        if let Err(error) = self.add_count(1, Some(bin_count), guard) {
            panic!("failed to grow the map: {}", error);
        }
    }

    /// Installs `new_entry`'s value into `node` unless `only_if_absent` is set.
    /// Returns the value `node` held before. The caller must hold the bin lock.
    fn replace_or_keep<'g>(
        &self,
        node: &'g Node<K, V>,
        new_entry: Owned<BinEntry<K, V>>,
        only_if_absent: bool,
        guard: &'g Guard,
    ) -> &'g V {
        let value = Node::take_value(new_entry);
        if only_if_absent {
            return node.value(guard);
        }
        swap_value(node, value, guard)
    }

    /// Unlinks a chain node. The caller must hold the bin lock.
    fn unlink_from_chain<'g>(
        &self,
        table: &'g Table<K, V>,
        index: usize,
        pred: Option<&'g Node<K, V>>,
        entry: Shared<'g, BinEntry<K, V>>,
        guard: &'g Guard,
    ) {
        // SAFETY: `entry` is a chain node of a bin whose lock we hold.
        let node = unsafe { entry.deref() }.as_node();
        let next = node.next.load(Ordering::Acquire, guard);
        match pred {
            Some(pred) => pred.next.store(next, Ordering::Release),
            None => table.store_bin(index, next),
        }

        // SAFETY: the node is unreachable from the table now.
        unsafe {
            guard.defer_destroy(node.value.load(Ordering::Acquire, guard));
            guard.defer_destroy(entry);
        }
        self.counter.add(-1);
    }

    /// Unlinks a tree node, turning the bin back into a chain if it became
    /// small. The caller must hold the bin lock.
    fn unlink_from_tree<'g>(
        &self,
        table: &'g Table<K, V>,
        index: usize,
        bin: Shared<'g, BinEntry<K, V>>,
        tree_bin: &'g TreeBin<K, V>,
        node: &'g Node<K, V>,
        guard: &'g Guard,
    ) {
        let value = node.value.load(Ordering::Acquire, guard);
        let entry = tree_bin.remove(node, guard);

        // SAFETY: the node is unreachable from the tree bin now.
        unsafe {
            guard.defer_destroy(value);
            guard.defer_destroy(entry);
        }
        self.counter.add(-1);

        if tree_bin.len() <= self.config.untreeify_threshold {
            self.untreeify(table, index, bin, tree_bin, guard);
        }
    }
}

/// Replaces the value of `node` and returns the previous one, which stays
/// readable until `guard` is dropped. The caller must hold the bin lock.
fn swap_value<'g, K, V>(node: &'g Node<K, V>, value: Owned<V>, guard: &'g Guard) -> &'g V {
    let previous = node.value.swap(value, Ordering::AcqRel, guard);
    // SAFETY: nobody can load the previous value once the swap is done, and
    // whoever already did is pinned.
    unsafe {
        guard.defer_destroy(previous);
        previous.deref()
    }
}

#[derive(Clone, Copy, PartialEq, Eq)]
enum ComputeMode {
    Always,
    IfAbsent,
    IfPresent,
}

impl<K, V, S> HashMap<K, V, S>
where
    K: Hash + Eq + 'static,
    V: 'static,
    S: BuildHasher,
{
    /// Returns a clone of the value corresponding to the key.
    ///
    /// The key may be any borrowed form of the map's key type, but
    /// [`Hash`] and [`Eq`] on the borrowed form *must* match those for
    /// the key type.
    ///
    /// [`Hash`]: https://doc.rust-lang.org/std/hash/trait.Hash.html
    /// [`Eq`]: https://doc.rust-lang.org/std/cmp/trait.Eq.html
    #[inline]
    pub fn get<Q>(&self, key: &Q) -> Option<V>
    where
        K: Borrow<Q>,
        Q: Hash + Eq + ?Sized,
        V: Clone,
    {
        self.get_and(key, V::clone)
    }

    /// Returns the result of invoking a function with a reference to the value
    /// corresponding to the key.
    ///
    /// The key may be any borrowed form of the map's key type, but
    /// [`Hash`] and [`Eq`] on the borrowed form *must* match those for
    /// the key type.
    ///
    /// [`Hash`]: https://doc.rust-lang.org/std/hash/trait.Hash.html
    /// [`Eq`]: https://doc.rust-lang.org/std/cmp/trait.Eq.html
    pub fn get_and<Q, F, T>(&self, key: &Q, with_value: F) -> Option<T>
    where
        K: Borrow<Q>,
        Q: Hash + Eq + ?Sized,
        F: FnOnce(&V) -> T,
    {
        let guard = &crossbeam_epoch::pin();
        self.find(key, guard)
            .map(|node| with_value(node.value(guard)))
    }

    /// Returns `true` if the map contains a value for the key.
    pub fn contains_key<Q>(&self, key: &Q) -> bool
    where
        K: Borrow<Q>,
        Q: Hash + Eq + ?Sized,
    {
        let guard = &crossbeam_epoch::pin();
        self.find(key, guard).is_some()
    }

    /// Inserts a key-value pair, returning a clone of the value previously
    /// corresponding to the key.
    ///
    /// If the key was already present, its value is replaced and the key passed
    /// in is dropped.
    ///
    /// # Panics
    ///
    /// Panics if called from a `compute` closure running on this map, or if the
    /// insertion pushed the map past its threshold and the larger table could
    /// not be allocated. In the latter case the entry has been inserted and the
    /// map stays usable at its current capacity.
    #[inline]
    pub fn insert(&self, key: K, value: V) -> Option<V>
    where
        V: Clone,
    {
        self.insert_and(key, value, V::clone)
    }

    /// Inserts a key-value pair, then returns the result of invoking a function
    /// with a reference to the value previously corresponding to the key.
    ///
    /// # Panics
    ///
    /// See [`insert`](#method.insert).
    pub fn insert_and<F, T>(&self, key: K, value: V, with_previous_value: F) -> Option<T>
    where
        F: FnOnce(&V) -> T,
    {
        self.check_reentrancy();
        let guard = &crossbeam_epoch::pin();
        self.put(key, value, false, guard).map(with_previous_value)
    }

    /// Inserts a key-value pair only if the key is absent. Returns a clone of
    /// the value already in the map otherwise, in which case both the key and
    /// the value passed in are dropped.
    ///
    /// # Panics
    ///
    /// See [`insert`](#method.insert).
    pub fn put_if_absent(&self, key: K, value: V) -> Option<V>
    where
        V: Clone,
    {
        self.check_reentrancy();
        let guard = &crossbeam_epoch::pin();
        self.put(key, value, true, guard).cloned()
    }

    /// Replaces the value corresponding to the key, returning a clone of the
    /// previous value. Does nothing and returns `None` if the key is absent.
    pub fn replace<Q>(&self, key: &Q, value: V) -> Option<V>
    where
        K: Borrow<Q>,
        Q: Hash + Eq + ?Sized,
        V: Clone,
    {
        self.check_reentrancy();
        let guard = &crossbeam_epoch::pin();
        self.replace_node(key, Some(value), |_, _| true, guard)
            .cloned()
    }

    /// Removes a key from the map, returning a clone of the value previously
    /// corresponding to the key.
    ///
    /// The key may be any borrowed form of the map's key type, but
    /// [`Hash`] and [`Eq`] on the borrowed form *must* match those for
    /// the key type.
    ///
    /// [`Hash`]: https://doc.rust-lang.org/std/hash/trait.Hash.html
    /// [`Eq`]: https://doc.rust-lang.org/std/cmp/trait.Eq.html
    #[inline]
    pub fn remove<Q>(&self, key: &Q) -> Option<V>
    where
        K: Borrow<Q>,
        Q: Hash + Eq + ?Sized,
        V: Clone,
    {
        self.remove_if(key, |_, _| true)
    }

    /// Removes a key from the map, returning the result of invoking a function
    /// with a reference to the value previously corresponding to the key.
    pub fn remove_and<Q, F, T>(&self, key: &Q, with_previous_value: F) -> Option<T>
    where
        K: Borrow<Q>,
        Q: Hash + Eq + ?Sized,
        F: FnOnce(&V) -> T,
    {
        self.check_reentrancy();
        let guard = &crossbeam_epoch::pin();
        self.replace_node(key, None, |_, _| true, guard)
            .map(with_previous_value)
    }

    /// Removes a key from the map if a condition is met, returning a clone of
    /// the value previously corresponding to the key.
    ///
    /// `condition` runs under the bin lock. It may be called more than once if
    /// the bin moves while the map is being resized.
    pub fn remove_if<Q, F>(&self, key: &Q, condition: F) -> Option<V>
    where
        K: Borrow<Q>,
        Q: Hash + Eq + ?Sized,
        F: FnMut(&K, &V) -> bool,
        V: Clone,
    {
        self.check_reentrancy();
        let guard = &crossbeam_epoch::pin();
        self.replace_node(key, None, condition, guard).cloned()
    }

    /// Computes a new value for the key from its current value, if any.
    ///
    /// `remapping` runs exactly once, while the key's bin is locked. Returning
    /// `None` removes the entry (or leaves the key absent). Returns a clone of
    /// the value now associated with the key.
    ///
    /// # Errors
    ///
    /// Returns [`ComputeError::Reentrant`] if called from another `compute`
    /// closure running on this map. Any other mutation of the map from inside
    /// `remapping` panics.
    ///
    /// # Examples
    ///
    /// ```rust
    /// use binmap::HashMap;
    ///
    /// let map = HashMap::new();
    /// let add_one = |_: &&str, v: Option<&u32>| Some(v.map_or(1, |v| v + 1));
    ///
    /// assert_eq!(map.compute("hits", add_one), Ok(Some(1)));
    /// assert_eq!(map.compute("hits", add_one), Ok(Some(2)));
    /// assert_eq!(map.compute("hits", |_, _| None), Ok(None));
    /// assert!(map.is_empty());
    /// ```
    pub fn compute<F>(&self, key: K, remapping: F) -> Result<Option<V>, ComputeError>
    where
        F: FnOnce(&K, Option<&V>) -> Option<V>,
        V: Clone,
    {
        let guard = &crossbeam_epoch::pin();
        let key = TrioArc::new(key);
        let value = self.compute_in(&*key, Some(&key), ComputeMode::Always, remapping, guard)?;
        Ok(value.cloned())
    }

    /// Computes a value for the key if it is absent. Returns a clone of the
    /// existing or the newly computed value; `None` if `mapping` returned
    /// `None`.
    ///
    /// # Errors
    ///
    /// See [`compute`](#method.compute).
    pub fn compute_if_absent<F>(&self, key: K, mapping: F) -> Result<Option<V>, ComputeError>
    where
        F: FnOnce(&K) -> Option<V>,
        V: Clone,
    {
        let guard = &crossbeam_epoch::pin();
        let key = TrioArc::new(key);
        let value = self.compute_in(
            &*key,
            Some(&key),
            ComputeMode::IfAbsent,
            |key, _| mapping(key),
            guard,
        )?;
        Ok(value.cloned())
    }

    /// Computes a new value for the key if it is present. Returning `None`
    /// removes the entry. Returns a clone of the new value.
    ///
    /// # Errors
    ///
    /// See [`compute`](#method.compute).
    pub fn compute_if_present<Q, F>(&self, key: &Q, remapping: F) -> Result<Option<V>, ComputeError>
    where
        K: Borrow<Q>,
        Q: Hash + Eq + ?Sized,
        F: FnOnce(&K, &V) -> Option<V>,
        V: Clone,
    {
        let guard = &crossbeam_epoch::pin();
        let value = self.compute_in(
            key,
            None,
            ComputeMode::IfPresent,
            |key, value| value.and_then(|value| remapping(key, value)),
            guard,
        )?;
        Ok(value.cloned())
    }

    /// Removes every entry.
    ///
    /// Entries inserted while `clear` runs may or may not survive it.
    pub fn clear(&self) {
        self.check_reentrancy();
        let guard = &crossbeam_epoch::pin();
        let mut table = self.current_table(guard);
        let mut index = 0;
        let mut removed = 0;

        while index < table.len() {
            let bin = table.bin(index, guard);
            match unsafe { bin.as_ref() } {
                None => index += 1,
                Some(BinEntry::Moved(next_table)) => {
                    table = self.help_transfer(table, *next_table, guard);
                    index = 0;
                }
                Some(BinEntry::Reserved(lock)) => drop(lock.lock()),
                Some(BinEntry::Node(head)) => {
                    let _bin_lock = head.lock.lock();
                    if table.bin(index, guard) != bin {
                        continue;
                    }
                    table.store_bin(index, Shared::null());
                    // SAFETY: the chain is unreachable from the table now.
                    unsafe {
                        removed += bin::defer_destroy_values(bin, guard);
                        bin::defer_destroy_chain(bin, guard);
                    }
                    index += 1;
                }
                Some(BinEntry::Tree(tree_bin)) => {
                    let _bin_lock = tree_bin.lock.lock();
                    if table.bin(index, guard) != bin {
                        continue;
                    }
                    table.store_bin(index, Shared::null());
                    // SAFETY: the tree bin is unreachable from the table now.
                    // Dropping it frees its nodes but not their values.
                    unsafe {
                        removed += bin::defer_destroy_values(tree_bin.first_entry(guard), guard);
                        guard.defer_destroy(bin);
                    }
                    index += 1;
                }
            }
        }

        if removed > 0 {
            self.counter.add(-(removed as isize));
        }
    }

    /// Makes sure the map can hold `additional` more elements than it holds now
    /// without resizing.
    ///
    /// # Errors
    ///
    /// Returns [`TryReserveError::CapacityOverflow`] if the required table is
    /// larger than the maximum, and [`TryReserveError::AllocError`] if it
    /// could not be allocated. The map is unchanged in both cases.
    ///
    /// # Panics
    ///
    /// Panics if called from a `compute` closure running on this map.
    pub fn try_reserve(&self, additional: usize) -> Result<(), TryReserveError> {
        self.check_reentrancy();
        let wanted = self
            .len()
            .checked_add(additional)
            .ok_or(TryReserveError::CapacityOverflow)?;
        let length = resize::table_length_to_hold(wanted, self.config.load_factor)
            .ok_or(TryReserveError::CapacityOverflow)?;

        let guard = &crossbeam_epoch::pin();
        self.grow_to(length, guard)
    }

    #[inline]
    fn hash<Q>(&self, key: &Q) -> u64
    where
        Q: Hash + ?Sized,
    {
        bin::hash(&self.build_hasher, key)
    }

    fn find<'g, Q>(&'g self, key: &Q, guard: &'g Guard) -> Option<&'g Node<K, V>>
    where
        K: Borrow<Q>,
        Q: Hash + Eq + ?Sized,
    {
        let hash = self.hash(key);
        let table = self.current_table(guard);
        let bin = table.bin(table.bin_index(hash), guard);
        // SAFETY: bins are retired through the epoch of `guard`.
        unsafe { bin.as_ref() }?.find(hash, key, guard)
    }

    /// Inserts or updates an entry. Returns the value the key had before.
    fn put<'g>(&'g self, key: K, value: V, only_if_absent: bool, guard: &'g Guard) -> Option<&'g V> {
        let hash = self.hash(&key);
        let key = TrioArc::new(key);
        let mut new_entry = Owned::new(BinEntry::Node(Node::new(hash, TrioArc::clone(&key), value)));
        let mut table = self.current_table(guard);

        loop {
            let index = table.bin_index(hash);
            let bin = table.bin(index, guard);

            // SAFETY: bins are retired through the epoch of `guard`.
            let entry = match unsafe { bin.as_ref() } {
                Some(entry) => entry,
                None => match table.cas_bin(index, Shared::null(), new_entry, guard) {
                    Ok(_) => {
                        self.count_insertion(0, guard);
                        return None;
                    }
                    Err(changed) => {
                        new_entry = changed.new;
                        continue;
                    }
                },
            };

            match entry {
                BinEntry::Moved(next_table) => {
                    table = self.help_transfer(table, *next_table, guard);
                }
                BinEntry::Reserved(lock) => drop(lock.lock()),
                BinEntry::Node(head) => {
                    if only_if_absent && head.key_matches(hash, &*key) {
                        drop(Node::take_value(new_entry));
                        return Some(head.value(guard));
                    }

                    let bin_lock = head.lock.lock();
                    if table.bin(index, guard) != bin {
                        continue;
                    }

                    let mut bin_count = 1;
                    let mut node = head;
                    let existing = loop {
                        if node.key_matches(hash, &*key) {
                            break Some(node);
                        }
                        match node.next(guard) {
                            Some(next) => {
                                node = next;
                                bin_count += 1;
                            }
                            None => break None,
                        }
                    };
                    if let Some(existing) = existing {
                        return Some(self.replace_or_keep(existing, new_entry, only_if_absent, guard));
                    }

                    node.next.store(new_entry, Ordering::Release);
                    drop(bin_lock);

                    if bin_count >= self.config.treeify_threshold {
                        self.treeify_bin(table, index, guard);
                    }
                    self.count_insertion(bin_count, guard);
                    return None;
                }
                BinEntry::Tree(tree_bin) => {
                    let bin_lock = tree_bin.lock.lock();
                    if table.bin(index, guard) != bin {
                        continue;
                    }

                    if let Some(existing) = tree_bin.find_in_tree(hash, &*key) {
                        return Some(self.replace_or_keep(existing, new_entry, only_if_absent, guard));
                    }
                    tree_bin.insert(new_entry, guard);
                    let bin_count = tree_bin.len();
                    drop(bin_lock);

                    self.count_insertion(bin_count, guard);
                    return None;
                }
            }
        }
    }

    /// Replaces the value of `key` with `new_value`, or removes the entry if
    /// `new_value` is `None`, provided `condition` holds. Returns the previous
    /// value.
    fn replace_node<'g, Q, F>(
        &'g self,
        key: &Q,
        mut new_value: Option<V>,
        mut condition: F,
        guard: &'g Guard,
    ) -> Option<&'g V>
    where
        K: Borrow<Q>,
        Q: Hash + Eq + ?Sized,
        F: FnMut(&K, &V) -> bool,
    {
        let hash = self.hash(key);
        let mut table = self.current_table(guard);

        loop {
            let index = table.bin_index(hash);
            let bin = table.bin(index, guard);

            // SAFETY: bins are retired through the epoch of `guard`.
            match unsafe { bin.as_ref() }? {
                BinEntry::Moved(next_table) => {
                    table = self.help_transfer(table, *next_table, guard);
                }
                BinEntry::Reserved(lock) => drop(lock.lock()),
                BinEntry::Node(head) => {
                    let _bin_lock = head.lock.lock();
                    if table.bin(index, guard) != bin {
                        continue;
                    }

                    let mut pred = None;
                    let mut entry = bin;
                    let node = loop {
                        // SAFETY: chain links are non-null here and retired
                        // through the epoch of `guard`.
                        let node = unsafe { entry.deref() }.as_node();
                        if node.key_matches(hash, key) {
                            break node;
                        }
                        pred = Some(node);
                        entry = node.next.load(Ordering::Acquire, guard);
                        if entry.is_null() {
                            return None;
                        }
                    };

                    let current = node.value(guard);
                    if !self.in_compute_scope(|| condition(&*node.key, current)) {
                        return None;
                    }
                    if let Some(value) = new_value.take() {
                        return Some(swap_value(node, Owned::new(value), guard));
                    }
                    self.unlink_from_chain(table, index, pred, entry, guard);
                    return Some(current);
                }
                BinEntry::Tree(tree_bin) => {
                    let _bin_lock = tree_bin.lock.lock();
                    if table.bin(index, guard) != bin {
                        continue;
                    }

                    let node = tree_bin.find_in_tree(hash, key)?;
                    let current = node.value(guard);
                    if !self.in_compute_scope(|| condition(&*node.key, current)) {
                        return None;
                    }
                    if let Some(value) = new_value.take() {
                        return Some(swap_value(node, Owned::new(value), guard));
                    }
                    self.unlink_from_tree(table, index, bin, tree_bin, node, guard);
                    return Some(current);
                }
            }
        }
    }

    /// The common part of the `compute` family. Returns the value associated
    /// with the key afterwards.
    fn compute_in<'g, Q, F>(
        &'g self,
        key: &Q,
        owned_key: Option<&TrioArc<K>>,
        mode: ComputeMode,
        mut remapping: F,
        guard: &'g Guard,
    ) -> Result<Option<&'g V>, ComputeError>
    where
        K: Borrow<Q>,
        Q: Hash + Eq + ?Sized,
        F: FnOnce(&K, Option<&V>) -> Option<V>,
    {
        if reentrancy::is_computing(self.id()) {
            return Err(ComputeError::Reentrant);
        }

        let hash = self.hash(key);
        let mut table = self.current_table(guard);

        loop {
            let index = table.bin_index(hash);
            let bin = table.bin(index, guard);

            // SAFETY: bins are retired through the epoch of `guard`.
            let entry = match unsafe { bin.as_ref() } {
                Some(entry) => entry,
                None => {
                    let owned_key = match owned_key {
                        Some(owned_key) if mode != ComputeMode::IfPresent => owned_key,
                        _ => return Ok(None),
                    };
                    match self.compute_in_empty_bin(table, index, hash, owned_key, remapping, guard) {
                        Ok(value) => return Ok(value),
                        Err(returned) => {
                            remapping = returned;
                            continue;
                        }
                    }
                }
            };

            match entry {
                BinEntry::Moved(next_table) => {
                    table = self.help_transfer(table, *next_table, guard);
                }
                BinEntry::Reserved(lock) => drop(lock.lock()),
                BinEntry::Node(head) => {
                    let bin_lock = head.lock.lock();
                    if table.bin(index, guard) != bin {
                        continue;
                    }

                    let mut bin_count = 1;
                    let mut pred = None;
                    let mut entry = bin;
                    let found = loop {
                        let node = unsafe { entry.deref() }.as_node();
                        if node.key_matches(hash, key) {
                            break true;
                        }
                        let next = node.next.load(Ordering::Acquire, guard);
                        if next.is_null() {
                            break false;
                        }
                        pred = Some(node);
                        entry = next;
                        bin_count += 1;
                    };
                    // Either the matching node, or the tail of the chain.
                    let node = unsafe { entry.deref() }.as_node();

                    if found {
                        if mode == ComputeMode::IfAbsent {
                            return Ok(Some(node.value(guard)));
                        }
                        let current = node.value(guard);
                        match self.in_compute_scope(|| remapping(&*node.key, Some(current))) {
                            Some(value) => {
                                swap_value(node, Owned::new(value), guard);
                                return Ok(Some(node.value(guard)));
                            }
                            None => {
                                self.unlink_from_chain(table, index, pred, entry, guard);
                                return Ok(None);
                            }
                        }
                    }

                    let owned_key = match owned_key {
                        Some(owned_key) if mode != ComputeMode::IfPresent => owned_key,
                        _ => return Ok(None),
                    };
                    let value = match self.in_compute_scope(|| remapping(&**owned_key, None)) {
                        Some(value) => value,
                        None => return Ok(None),
                    };
                    let new_entry = Owned::new(BinEntry::Node(Node::new(
                        hash,
                        TrioArc::clone(owned_key),
                        value,
                    )))
                    .into_shared(guard);
                    node.next.store(new_entry, Ordering::Release);
                    drop(bin_lock);

                    if bin_count >= self.config.treeify_threshold {
                        self.treeify_bin(table, index, guard);
                    }
                    self.count_insertion(bin_count, guard);
                    return Ok(Some(unsafe { new_entry.deref() }.as_node().value(guard)));
                }
                BinEntry::Tree(tree_bin) => {
                    let bin_lock = tree_bin.lock.lock();
                    if table.bin(index, guard) != bin {
                        continue;
                    }

                    if let Some(node) = tree_bin.find_in_tree(hash, key) {
                        if mode == ComputeMode::IfAbsent {
                            return Ok(Some(node.value(guard)));
                        }
                        let current = node.value(guard);
                        match self.in_compute_scope(|| remapping(&*node.key, Some(current))) {
                            Some(value) => {
                                swap_value(node, Owned::new(value), guard);
                                return Ok(Some(node.value(guard)));
                            }
                            None => {
                                self.unlink_from_tree(table, index, bin, tree_bin, node, guard);
                                return Ok(None);
                            }
                        }
                    }

                    let owned_key = match owned_key {
                        Some(owned_key) if mode != ComputeMode::IfPresent => owned_key,
                        _ => return Ok(None),
                    };
                    let value = match self.in_compute_scope(|| remapping(&**owned_key, None)) {
                        Some(value) => value,
                        None => return Ok(None),
                    };
                    let new_entry = Owned::new(BinEntry::Node(Node::new(
                        hash,
                        TrioArc::clone(owned_key),
                        value,
                    )));
                    let node = tree_bin.insert(new_entry, guard);
                    let bin_count = tree_bin.len();
                    drop(bin_lock);

                    self.count_insertion(bin_count, guard);
                    return Ok(Some(node.value(guard)));
                }
            }
        }
    }

    /// Runs `remapping` for a key whose bin is empty, holding the bin with a
    /// locked reservation while the closure runs. Hands the closure back if the
    /// bin stopped being empty.
    fn compute_in_empty_bin<'g, F>(
        &'g self,
        table: &'g Table<K, V>,
        index: usize,
        hash: u64,
        key: &TrioArc<K>,
        remapping: F,
        guard: &'g Guard,
    ) -> Result<Option<&'g V>, F>
    where
        F: FnOnce(&K, Option<&V>) -> Option<V>,
    {
        let reservation = Owned::new(BinEntry::Reserved(Mutex::new(()))).into_shared(guard);
        // SAFETY: the reservation is ours until it is published.
        let lock = match unsafe { reservation.deref() } {
            BinEntry::Reserved(lock) => lock,
            _ => unreachable!(),
        };
        let held = lock.lock();

        if let Err(changed) = table.cas_bin(index, Shared::null(), reservation, guard) {
            drop(held);
            // SAFETY: the reservation was never published.
            drop(unsafe { changed.new.into_owned() });
            return Err(remapping);
        }

        // Declared after `held`, so the bin is filled in before the
        // reservation is unlocked, even if `remapping` panics.
        let mut release = Unreserve {
            table,
            index,
            reservation,
            result: Shared::null(),
            guard,
        };

        let value = self
            .in_compute_scope(|| remapping(&**key, None))
            .map(|value| {
                let entry = Owned::new(BinEntry::Node(Node::new(hash, TrioArc::clone(key), value)))
                    .into_shared(guard);
                release.result = entry;
                unsafe { entry.deref() }.as_node().value(guard)
            });

        drop(release);
        drop(held);

        if value.is_some() {
            self.count_insertion(1, guard);
        }
        Ok(value)
    }
}

/// Replaces a reservation with the outcome of the computation when dropped.
struct Unreserve<'g, K, V> {
    table: &'g Table<K, V>,
    index: usize,
    reservation: Shared<'g, BinEntry<K, V>>,
    result: Shared<'g, BinEntry<K, V>>,
    guard: &'g Guard,
}

impl<K, V> Drop for Unreserve<'_, K, V> {
    fn drop(&mut self) {
        self.table.store_bin(self.index, self.result);
        // SAFETY: the reservation is unreachable from the table now.
        unsafe { self.guard.defer_destroy(self.reservation) };
    }
}

impl<K, V, S> HashMap<K, V, S>
where
    K: Hash + Eq + Clone + 'static,
    V: Clone + 'static,
{
    /// Returns an iterator over clones of the entries of the map.
    ///
    /// The iterator is weakly consistent: it never fails because of concurrent
    /// updates and never yields a key twice. It yields every entry that is in
    /// the map for the whole iteration, and may or may not yield entries that
    /// are inserted or removed while it runs.
    pub fn iter(&self) -> Iter<'_, K, V, S> {
        Iter::new(self)
    }
}

impl<K, V, S> Drop for HashMap<K, V, S> {
    fn drop(&mut self) {
        // SAFETY: `&mut self` means no other thread can reach the map, so every
        // bin and value can be freed right away.
        let guard = unsafe { crossbeam_epoch::unprotected() };

        // A resize only leaves `next_table` behind if a resizing thread
        // panicked. Its bins share values with the current table, so it is
        // leaked rather than risking a double free.
        debug_assert!(self.next_table.load(Ordering::Relaxed, guard).is_null());

        let table = self.table.swap(Shared::null(), Ordering::Relaxed, guard);
        if table.is_null() {
            return;
        }
        let table = unsafe { table.into_owned() };

        for index in 0..table.len() {
            let bin = table.bin(index, guard);
            match unsafe { bin.as_ref() } {
                Some(BinEntry::Node(_)) => {
                    table.store_bin(index, Shared::null());
                    unsafe {
                        bin::drop_values(bin, guard);
                        bin::drop_chain(bin, guard);
                    }
                }
                Some(BinEntry::Tree(tree_bin)) => {
                    table.store_bin(index, Shared::null());
                    unsafe {
                        bin::drop_values(tree_bin.first_entry(guard), guard);
                        drop(bin.into_owned());
                    }
                }
                _ => {}
            }
        }
    }
}

impl<K, V> Default for HashMap<K, V, DefaultHashBuilder>
where
    K: 'static,
    V: 'static,
{
    fn default() -> Self {
        Self::new()
    }
}

impl<K, V, S> fmt::Debug for HashMap<K, V, S>
where
    K: Hash + Eq + Clone + fmt::Debug + 'static,
    V: Clone + fmt::Debug + 'static,
{
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_map().entries(self.iter()).finish()
    }
}

impl<K, V, S> Extend<(K, V)> for HashMap<K, V, S>
where
    K: Hash + Eq + 'static,
    V: 'static,
    S: BuildHasher,
{
    fn extend<T: IntoIterator<Item = (K, V)>>(&mut self, iter: T) {
        (&*self).extend(iter);
    }
}

impl<K, V, S> Extend<(K, V)> for &HashMap<K, V, S>
where
    K: Hash + Eq + 'static,
    V: 'static,
    S: BuildHasher,
{
    fn extend<T: IntoIterator<Item = (K, V)>>(&mut self, iter: T) {
        self.check_reentrancy();
        let guard = &crossbeam_epoch::pin();
        for (key, value) in iter {
            self.put(key, value, false, guard);
        }
    }
}

impl<K, V, S> FromIterator<(K, V)> for HashMap<K, V, S>
where
    K: Hash + Eq + 'static,
    V: 'static,
    S: BuildHasher + Default,
{
    fn from_iter<T: IntoIterator<Item = (K, V)>>(iter: T) -> Self {
        let iter = iter.into_iter();
        let capacity = table_length_for(iter.size_hint().0)
            .unwrap_or(MAXIMUM_CAPACITY)
            .max(DEFAULT_CAPACITY);
        let mut map = Self::with_capacity_and_hasher(capacity, S::default());
        map.extend(iter);
        map
    }
}

impl<'a, K, V, S> IntoIterator for &'a HashMap<K, V, S>
where
    K: Hash + Eq + Clone + 'static,
    V: Clone + 'static,
{
    type Item = (K, V);
    type IntoIter = Iter<'a, K, V, S>;

    fn into_iter(self) -> Self::IntoIter {
        self.iter()
    }
}

#[cfg(test)]
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) enum BinKind {
    Chain(usize),
    Tree(usize),
}

#[cfg(test)]
impl<K, V, S> HashMap<K, V, S>
where
    K: Hash + Eq + 'static,
    V: 'static,
    S: BuildHasher,
{
    pub(crate) fn config(&self) -> Config {
        self.config
    }

    /// Describes the bin that holds `key` in the current table.
    pub(crate) fn bin_kind<Q>(&self, key: &Q) -> Option<BinKind>
    where
        K: Borrow<Q>,
        Q: Hash + Eq + ?Sized,
    {
        let guard = &crossbeam_epoch::pin();
        let table = self.current_table(guard);
        let bin = table.bin(table.bin_index(self.hash(key)), guard);
        match unsafe { bin.as_ref() }? {
            BinEntry::Node(head) => Some(BinKind::Chain(bin::chain_nodes(head, guard).len())),
            BinEntry::Tree(tree_bin) => Some(BinKind::Tree(tree_bin.len())),
            _ => None,
        }
    }

    /// Checks the structure of a quiescent map: every entry sits in the bin
    /// its hash selects, chains are acyclic, no key appears twice, trees are
    /// valid red-black trees, and the count matches.
    pub(crate) fn check_invariants(&self) -> Result<(), String> {
        let guard = &crossbeam_epoch::pin();
        let table = self.current_table(guard);
        let len = self.len();
        let mut total = 0;

        for index in 0..table.len() {
            let bin = table.bin(index, guard);
            let first = match unsafe { bin.as_ref() } {
                None => continue,
                Some(BinEntry::Node(head)) => head,
                Some(BinEntry::Tree(tree_bin)) => {
                    tree_bin.validate(guard)?;
                    if tree_bin.len() <= self.config.untreeify_threshold {
                        return Err(format!("tree bin {} should be a chain", index));
                    }
                    match tree_bin.first(guard) {
                        Some(first) => first,
                        None => return Err(format!("tree bin {} is empty", index)),
                    }
                }
                Some(_) => return Err(format!("bin {} is in transit", index)),
            };

            let mut seen: Vec<&Node<K, V>> = Vec::new();
            let mut node = Some(first);
            while let Some(this) = node {
                if seen.len() > len {
                    return Err(format!("bin {} has a cycle", index));
                }
                if this.hash != self.hash(&*this.key) {
                    return Err(format!("bin {} has an entry with a stale hash", index));
                }
                if table.bin_index(this.hash) != index {
                    return Err(format!("bin {} has an entry of another bin", index));
                }
                if seen.iter().any(|other| *other.key == *this.key) {
                    return Err(format!("bin {} has a duplicate key", index));
                }
                seen.push(this);
                node = this.next(guard);
            }
            total += seen.len();
        }

        if total != len {
            return Err(format!("len() is {} but {} entries are linked", len, total));
        }
        Ok(())
    }
}
