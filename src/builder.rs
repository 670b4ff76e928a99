use crate::{
    error::ConfigError,
    map::{table_length_for, Config, DefaultHashBuilder, DEFAULT_CAPACITY, MAXIMUM_CAPACITY},
    HashMap,
};

use std::{hash::BuildHasher, marker::PhantomData};

/// Builds a [`HashMap`][map-struct] with various configuration knobs.
///
/// Every knob has a default, so `HashMapBuilder::default().build()` is
/// equivalent to `HashMap::new()`. The knobs are validated by `build` and
/// `build_with_hasher`.
///
/// [map-struct]: ./struct.HashMap.html
///
/// # Examples
///
/// ```rust
/// use binmap::HashMap;
///
/// let map = HashMap::builder()
///     // Start with 1,024 bins.
///     .initial_capacity(1_024)
///     // Grow once the map is half full.
///     .load_factor(0.5)
///     // Create the map.
///     .build()
///     .unwrap();
///
/// map.insert(0, "zero");
/// assert_eq!(map.capacity(), 1_024);
/// ```
///
#[must_use]
pub struct HashMapBuilder<K, V> {
    initial_capacity: usize,
    config: Config,
    map_type: PhantomData<(K, V)>,
}

impl<K, V> Default for HashMapBuilder<K, V> {
    fn default() -> Self {
        Self {
            initial_capacity: DEFAULT_CAPACITY,
            config: Config::default(),
            map_type: PhantomData::default(),
        }
    }
}

impl<K, V> HashMapBuilder<K, V> {
    /// Construct a new `HashMapBuilder` with the default knobs.
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets the initial number of bins. It is rounded up to the next power of
    /// two. Defaults to 16.
    pub fn initial_capacity(self, capacity: usize) -> Self {
        Self {
            initial_capacity: capacity,
            ..self
        }
    }

    /// Sets the load factor, the fraction of the bins that may be filled
    /// before the table doubles. Must be in `(0.0, 1.0]`. Defaults to 0.75.
    pub fn load_factor(mut self, load_factor: f32) -> Self {
        self.config.load_factor = load_factor;
        self
    }

    /// Sets the chain length at which a bin is converted to a tree. Defaults
    /// to 8.
    pub fn treeify_threshold(mut self, threshold: usize) -> Self {
        self.config.treeify_threshold = threshold;
        self
    }

    /// Sets the entry count at or below which a tree bin is converted back to
    /// a chain. Must be less than the treeify threshold. Defaults to 6.
    pub fn untreeify_threshold(mut self, threshold: usize) -> Self {
        self.config.untreeify_threshold = threshold;
        self
    }

    /// Sets the table length below which long chains grow the table instead of
    /// being converted to trees. Defaults to 64.
    pub fn min_treeify_capacity(mut self, capacity: usize) -> Self {
        self.config.min_treeify_capacity = capacity;
        self
    }

    /// Sets the smallest number of bins a thread claims at once when it helps
    /// with a resize. Defaults to 16.
    pub fn min_transfer_stride(mut self, stride: usize) -> Self {
        self.config.min_transfer_stride = stride;
        self
    }

    /// Builds a `HashMap<K, V>`.
    ///
    /// # Errors
    ///
    /// Returns a [`ConfigError`](./enum.ConfigError.html) describing the first
    /// knob that is out of range.
    pub fn build(self) -> Result<HashMap<K, V, DefaultHashBuilder>, ConfigError>
    where
        K: 'static,
        V: 'static,
    {
        self.build_with_hasher(DefaultHashBuilder::default())
    }

    /// Builds a `HashMap<K, V, S>`, with the given `hasher`.
    ///
    /// # Errors
    ///
    /// See [`build`](#method.build).
    pub fn build_with_hasher<S>(self, hasher: S) -> Result<HashMap<K, V, S>, ConfigError>
    where
        K: 'static,
        V: 'static,
        S: BuildHasher,
    {
        let length = self.validate()?;
        Ok(HashMap::from_parts(length, self.config, hasher))
    }

    /// Checks the knobs and returns the initial table length.
    fn validate(&self) -> Result<usize, ConfigError> {
        let config = &self.config;

        if self.initial_capacity == 0 {
            return Err(ConfigError::ZeroCapacity);
        }
        let length =
            table_length_for(self.initial_capacity).ok_or(ConfigError::CapacityTooLarge {
                requested: self.initial_capacity,
                maximum: MAXIMUM_CAPACITY,
            })?;

        // Written so that NaN is rejected as well.
        if !(config.load_factor > 0.0 && config.load_factor <= 1.0) {
            return Err(ConfigError::InvalidLoadFactor(config.load_factor));
        }
        if config.treeify_threshold < 2 {
            return Err(ConfigError::InvalidTreeifyThreshold(config.treeify_threshold));
        }
        if config.untreeify_threshold >= config.treeify_threshold {
            return Err(ConfigError::InvalidUntreeifyThreshold {
                untreeify: config.untreeify_threshold,
                treeify: config.treeify_threshold,
            });
        }
        if config.min_transfer_stride == 0 {
            return Err(ConfigError::InvalidTransferStride);
        }

        Ok(length)
    }
}
