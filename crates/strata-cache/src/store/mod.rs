//! The tiered [`Store`].

use std::collections::HashMap;
use std::fmt;
use std::num::NonZeroUsize;
use std::sync::{Arc, Mutex};

use futures::future::BoxFuture;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

use crate::deferred::{DeferredConfig, DeferredTable};
use crate::error::CacheEntry;
use crate::key::StoreKey;
use crate::merge::MergePolicy;
use crate::observe::{EventStream, Subscription};
use crate::sparse_map::{InMemorySparseMap, LruSparseMap, MapEvent, SparseMap};
use crate::table::{BackingTable, TableConfig, open_table};
use crate::updatable::Updatable;


/// The remote source of truth for values missing from all local tiers.
///
/// Fetch failures are reported as errors of the requesting cell and are not retried.
pub trait Origin<K, T, C = ()>: Send + Sync + 'static {
    fn fetch(&self, key: &K, context: C) -> BoxFuture<'static, CacheEntry<T>>;
}

/// The capacity of one tier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MapConfig {
    /// Bindings are only dropped when they fail.
    Unbounded,
    /// At most `max` bindings, the least recently used one is evicted to make room.
    Lru { max: NonZeroUsize },
}

impl MapConfig {
    fn lru(max: usize) -> Self {
        match NonZeroUsize::new(max) {
            Some(max) => Self::Lru { max },
            None => Self::Unbounded,
        }
    }
}

/// Configuration of a [`Store`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct StoreConfig {
    /// How updates are applied to existing values.
    pub merge: MergePolicy,
    /// The capacity of the in-memory tier.
    pub memory: MapConfig,
    /// The capacity of the persistent tier.
    pub persistent: MapConfig,
    /// Batching of the reads and writes of the persistent tier.
    pub deferred: DeferredConfig,
    /// The table the persistent tier writes to.
    pub table: TableConfig,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            merge: MergePolicy::default(),
            memory: MapConfig::lru(1_000),
            persistent: MapConfig::lru(10_000),
            deferred: DeferredConfig::default(),
            table: TableConfig::default(),
        }
    }
}

type Tier<K, T, C> = Arc<dyn SparseMap<K, Option<T>, C>>;

fn tier<K, T, C, F>(name: &'static str, config: &MapConfig, factory: F) -> Tier<K, T, C>
where
    K: StoreKey,
    T: Clone + Send + Sync + 'static,
    C: Send + 'static,
    F: Fn(&K, C) -> Updatable<Option<T>> + Send + Sync + 'static,
{
    match *config {
        MapConfig::Unbounded => Arc::new(InMemorySparseMap::new(name, factory)),
        MapConfig::Lru { max } => Arc::new(LruSparseMap::new(name, max, factory)),
    }
}

/// The subscriptions forwarding updates of bound cells to the next tier, by cell.
#[derive(Default)]
struct Links {
    links: Mutex<HashMap<usize, Subscription>>,
}

impl Links {
    fn insert(&self, cell: usize, link: Subscription) {
        self.links.lock().unwrap().insert(cell, link);
    }

    /// Unlinks and releases an evicted cell.
    fn evict<V: Clone + Send + Sync + 'static>(&self, cell: &Updatable<V>) {
        let link = self.links.lock().unwrap().remove(&cell.id());
        drop(link);
        cell.release();
    }

    fn len(&self) -> usize {
        self.links.lock().unwrap().len()
    }
}

/// A cache of `T` values by key `K`, in three tiers.
///
/// 1. The in-memory tier is what consumers [`listen`](Self::listen) to. A missing key is loaded
///    from the persistent tier, and from the [`Origin`] if the persistent tier does not have it
///    either.
/// 2. The persistent tier reads from and writes to a [`BackingTable`] through a
///    [`DeferredTable`].
/// 3. The origin is asked with the context `C` the key was first listened to with.
///
/// Values pushed into a cell of the in-memory tier are written through to the persistent tier,
/// and from there to the table. Evicting a cell from a tier stops that forwarding and releases
/// the cell.
///
/// Absent values are represented as `None`, so the cells of a store hold `Option<T>`.
pub struct Store<K, T, C = ()>
where
    K: StoreKey,
    T: Clone + Send + Sync + 'static,
{
    memory: Tier<K, T, C>,
    persistent: Tier<K, T, ()>,
    deferred: DeferredTable<K, T>,
    merge: MergePolicy,
    links: Arc<Links>,
    _wiring: Vec<Subscription>,
}

impl<K, T, C> fmt::Debug for Store<K, T, C>
where
    K: StoreKey,
    T: Clone + Send + Sync + 'static,
{
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Store")
            .field("memory", &self.memory.len())
            .field("persistent", &self.persistent.len())
            .field("links", &self.links.len())
            .field("merge", &self.merge)
            .field("deferred", &self.deferred)
            .finish()
    }
}

impl<K, T, C> Store<K, T, C>
where
    K: StoreKey,
    T: Serialize + DeserializeOwned + Clone + Send + Sync + 'static,
    C: Clone + Send + Sync + 'static,
{
    /// Opens the table configured in `config` and creates a store on top of it.
    pub fn open(
        config: &StoreConfig,
        origin: Option<Arc<dyn Origin<K, T, C>>>,
    ) -> anyhow::Result<Self> {
        let table = open_table(&config.table)?;
        Ok(Self::new(config, table, origin))
    }

    /// Creates a store persisting to `table`.
    pub fn new(
        config: &StoreConfig,
        table: Arc<dyn BackingTable>,
        origin: Option<Arc<dyn Origin<K, T, C>>>,
    ) -> Self {
        let deferred = DeferredTable::new(table, config.deferred);

        let persistent = tier("persistent", &config.persistent, {
            let deferred = deferred.clone();
            move |key: &K, ()| {
                let deferred = deferred.clone();
                let key = key.clone();
                Updatable::new(move || deferred.deferred_get(key.clone()))
            }
        });

        let memory = tier("memory", &config.memory, {
            let persistent = Arc::clone(&persistent);
            move |key: &K, context: C| {
                let persistent = Arc::clone(&persistent);
                let origin = origin.clone();
                let key = key.clone();
                Updatable::new(move || {
                    load(
                        Arc::clone(&persistent),
                        origin.clone(),
                        key.clone(),
                        context.clone(),
                    )
                })
            }
        });

        let links = Arc::new(Links::default());
        let wiring = vec![
            memory.on_created(Box::new({
                let persistent = Arc::clone(&persistent);
                let links = Arc::clone(&links);
                move |event: &MapEvent<K, Option<T>>| {
                    let persistent = Arc::clone(&persistent);
                    let key = event.key.clone();
                    let link = event.cell.subscribe_updates(move |entry| {
                        if let Ok(Some(value)) = entry {
                            persistent.listen(key.clone(), ()).next(Some(value.clone()));
                        }
                    });
                    links.insert(event.cell.id(), link);
                }
            })),
            persistent.on_created(Box::new({
                let deferred = deferred.clone();
                let links = Arc::clone(&links);
                move |event: &MapEvent<K, Option<T>>| {
                    let deferred = deferred.clone();
                    let key = event.key.clone();
                    let link = event.cell.subscribe_updates(move |entry| {
                        if let Ok(Some(value)) = entry {
                            // failed writes are logged by the table and reported by `flush`
                            let _ = deferred.deferred_put(value.clone(), key.clone());
                        }
                    });
                    links.insert(event.cell.id(), link);
                }
            })),
            memory.on_evicted(Box::new({
                let links = Arc::clone(&links);
                move |event: &MapEvent<K, Option<T>>| links.evict(&event.cell)
            })),
            persistent.on_evicted(Box::new({
                let links = Arc::clone(&links);
                move |event: &MapEvent<K, Option<T>>| links.evict(&event.cell)
            })),
        ];

        Self {
            memory,
            persistent,
            deferred,
            merge: config.merge,
            links,
            _wiring: wiring,
        }
    }

    /// Returns the in-memory cell of `key`, loading it if necessary.
    ///
    /// `context` is handed to the origin if the key has to be fetched.
    pub fn listen(&self, key: K, context: C) -> Updatable<Option<T>> {
        self.memory.listen(key, context)
    }

    /// Returns the in-memory cell of `key` if it is already bound, without loading it.
    pub fn listen_if_cached(&self, key: &K) -> Option<Updatable<Option<T>>> {
        self.memory.listen_if_cached(key)
    }

    /// Resolves with the current value of `key`, `None` if no tier has one.
    pub async fn get(&self, key: K, context: C) -> CacheEntry<Option<T>> {
        self.memory.get(key, context).await
    }

    /// Applies `patch` to the current value of `key` according to the store's
    /// [`MergePolicy`], and pushes the result.
    ///
    /// The current value is loaded first if needed. Returns the new value.
    pub async fn update(&self, key: K, context: C, patch: serde_json::Value) -> CacheEntry<T> {
        let cell = self.memory.listen(key, context);
        let current = cell.get().await?;
        let updated: T = self.merge.apply(current.as_ref(), patch)?;
        cell.next(Some(updated.clone()));
        Ok(updated)
    }

    /// Pushes `value` for `key`, going through the store's [`MergePolicy`] like
    /// [`update`](Self::update).
    pub async fn set(&self, key: K, context: C, value: T) -> CacheEntry<T> {
        let patch = serde_json::to_value(value)?;
        self.update(key, context, patch).await
    }

    /// A stream of the bindings created in the in-memory tier.
    pub fn created(&self) -> EventStream<MapEvent<K, Option<T>>> {
        self.memory.created()
    }

    /// A stream of the bindings dropped from the in-memory tier.
    pub fn evicted(&self) -> EventStream<MapEvent<K, Option<T>>> {
        self.memory.evicted()
    }

    /// Waits for all writes issued so far to reach the table.
    ///
    /// Returns the first failed batch since the previous flush.
    pub async fn flush(&self) -> CacheEntry<()> {
        self.deferred.flush().await
    }

    pub fn memory(&self) -> &Arc<dyn SparseMap<K, Option<T>, C>> {
        &self.memory
    }

    pub fn persistent(&self) -> &Arc<dyn SparseMap<K, Option<T>>> {
        &self.persistent
    }

    pub fn deferred(&self) -> &DeferredTable<K, T> {
        &self.deferred
    }
}

/// Loads the value of an in-memory cell from the lower tiers.
async fn load<K, T, C>(
    persistent: Tier<K, T, ()>,
    origin: Option<Arc<dyn Origin<K, T, C>>>,
    key: K,
    context: C,
) -> CacheEntry<Option<T>>
where
    K: StoreKey,
    T: Clone + Send + Sync + 'static,
    C: Send + 'static,
{
    if let Some(value) = persistent.get(key.clone(), ()).await? {
        return Ok(Some(value));
    }
    let Some(origin) = origin else {
        return Ok(None);
    };

    tracing::debug!(?key, "fetching from origin");
    metric!(counter("store.origin.fetch") += 1);
    let value = origin.fetch(&key, context).await?;

    // pushing writes the value through to the table
    persistent.listen(key, ()).next(Some(value.clone()));
    Ok(Some(value))
}
