/// The error type returned by [`HashMapBuilder::build`][build] when the
/// configuration knobs do not describe a usable map.
///
/// [build]: ./struct.HashMapBuilder.html#method.build
#[derive(thiserror::Error, Debug, Clone, PartialEq)]
pub enum ConfigError {
    /// The initial capacity was zero.
    #[error("initial capacity must be greater than zero")]
    ZeroCapacity,

    /// The initial capacity, rounded up to a power of two, exceeds the largest
    /// supported bucket array.
    #[error("initial capacity {requested} exceeds the maximum capacity {maximum}")]
    CapacityTooLarge { requested: usize, maximum: usize },

    /// The load factor is not in the range `(0.0, 1.0]`.
    #[error("load factor must be in (0, 1], got {0}")]
    InvalidLoadFactor(f32),

    /// A bin must hold at least two entries before it can become a tree.
    #[error("treeify threshold must be at least 2, got {0}")]
    InvalidTreeifyThreshold(usize),

    /// The untreeify threshold must stay below the treeify threshold, otherwise
    /// a bin could flip between both representations on every write.
    #[error(
        "untreeify threshold ({untreeify}) must be less than the treeify threshold ({treeify})"
    )]
    InvalidUntreeifyThreshold { untreeify: usize, treeify: usize },

    /// The minimum transfer stride was zero.
    #[error("transfer stride must be greater than zero")]
    InvalidTransferStride,
}

/// The error type for the [`HashMap::compute`][compute] family of methods.
///
/// [compute]: ./struct.HashMap.html#method.compute
#[derive(thiserror::Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum ComputeError {
    /// The closure passed to a `compute` method tried to run another `compute`
    /// on the same map. The outer call holds a bin lock while the closure runs,
    /// so the nested call is rejected instead of risking a self-deadlock.
    #[error("a compute closure tried to mutate the map it is computing on")]
    Reentrant,
}

/// The error type for [`HashMap::try_reserve`][try-reserve] and for resizes
/// triggered by insertions.
///
/// [try-reserve]: ./struct.HashMap.html#method.try_reserve
#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
pub enum TryReserveError {
    /// The requested number of entries needs a bucket array larger than the
    /// maximum capacity.
    #[error("capacity overflow")]
    CapacityOverflow,

    /// The allocator refused to hand out a bucket array of `capacity` bins.
    #[error("failed to allocate a bucket array of {capacity} bins")]
    AllocError { capacity: usize },
}
