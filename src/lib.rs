#![warn(clippy::all)]
#![warn(rust_2018_idioms)]

//! A concurrent hash map with lock-free reads.
//!
//! [`HashMap`] is a bucket array of bins. Reads load a bin with acquire
//! ordering and walk it without taking any lock, so `get` never blocks, even
//! while the map is being resized. Writes lock only the bin they touch. A bin
//! whose chain grows long because of colliding hashes is converted into a
//! red-black tree, and back into a chain once it shrinks.
//!
//! When the number of entries passes `capacity * load_factor`, the table is
//! doubled. The bins are moved to the new table incrementally, a stride of bins
//! at a time, and every thread that writes to the map while a resize is running
//! helps with it. Moved bins are replaced with forwarding entries that send
//! readers and writers on to the new table.
//!
//! Memory of unlinked entries, replaced values and retired tables is reclaimed
//! with [`crossbeam-epoch`][crossbeam-epoch], so values handed to closures stay
//! valid for the duration of the call.
//!
//! [crossbeam-epoch]: https://docs.rs/crossbeam-epoch
//!
//! # Examples
//!
//! ```rust
//! use binmap::HashMap;
//!
//! let map = HashMap::new();
//!
//! assert_eq!(map.insert("apple", 3), None);
//! assert_eq!(map.insert("apple", 5), Some(3));
//! assert_eq!(map.put_if_absent("apple", 7), Some(5));
//! assert_eq!(map.get("apple"), Some(5));
//!
//! assert_eq!(map.compute("pear", |_, v| Some(v.copied().unwrap_or(0) + 1)), Ok(Some(1)));
//! assert_eq!(map.remove("apple"), Some(5));
//! assert_eq!(map.len(), 1);
//! ```
//!
//! # Logging
//!
//! With the `logging` feature enabled, the map emits `debug` records through the
//! [`log`][log-crate] crate when it resizes or converts a bin between a chain and
//! a tree, and an `error` record when a resize could not allocate its table.
//!
//! [log-crate]: https://docs.rs/log

pub(crate) mod builder;
pub(crate) mod error;
pub(crate) mod iter;
pub(crate) mod map;

#[cfg(test)]
pub(crate) mod test_util;

pub use builder::HashMapBuilder;
pub use error::{ComputeError, ConfigError, TryReserveError};
pub use iter::Iter;
pub use map::{DefaultHashBuilder, HashMap};
