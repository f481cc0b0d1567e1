//! # Strata
//!
//! A client-side caching and synchronization engine. Strata presents a key to value map whose
//! misses are filled lazily and asynchronously, whose values evolve over time and are pushed to
//! every observer, and whose size is bounded by an eviction policy.
//!
//! ## Layers
//!
//! A [`Store`] is composed out of three tiers:
//!
//! - An in-memory tier, a [`SparseMap`] of [`Updatable`] cells, which is what consumers listen to.
//!   This layer also does request coalescing: concurrent lookups of the same key share one cell
//!   and thus one load.
//! - A persistent tier, another [`SparseMap`] that is backed by a [`BackingTable`] through the
//!   [`DeferredTable`] bridge, which batches reads and writes.
//! - An optional [`Origin`], which is asked for a value when neither of the other tiers has one.
//!
//! Lookups go through the tiers in that order. Updates pushed into an in-memory cell are written
//! through to the persistent tier and from there, batched, to the backing table.
//!
//! ## Metrics
//!
//! All the layers report metrics via the [`metric!`] macro, which is a no-op unless
//! [`metrics::configure_statsd`] was called:
//!
//! - `maps.access`, `maps.hit`, `maps.created`, `maps.evicted`: tagged with the `map` name.
//! - `deferred.write.batch`, `deferred.write.items`, `deferred.write.error`: tagged with the
//!   `table` name, errors additionally with their `kind`.
//! - `deferred.write.batch_size`, `deferred.read.batch_size`: distribution of the batch sizes.
//! - `deferred.write.duration`: time spent in a single bulk write.
//! - `deferred.read.batch`, `deferred.read.pending_hit`: reads served from the table, or from a
//!   write that was still queued.
//! - `store.origin.fetch`: actual requests to the origin.

#[macro_use]
pub mod metrics;

pub mod config;
pub mod deferred;
pub mod error;
pub mod key;
pub mod logging;
pub mod merge;
pub mod observe;
pub mod sparse_map;
pub mod store;
pub mod table;
pub mod updatable;
pub mod utils;


pub use deferred::{Completion, DeferredConfig, DeferredTable};
pub use error::{CacheEntry, CacheError};
pub use key::StoreKey;
pub use merge::MergePolicy;
pub use observe::{EventStream, Subscription};
pub use sparse_map::{InMemorySparseMap, LruSparseMap, MapEvent, SparseMap};
pub use store::{MapConfig, Origin, Store, StoreConfig};
pub use table::{BackingTable, FsTable, MemoryTable, Record, TableConfig};
pub use updatable::{Updatable, UpdatableStream};
