//! Sparse maps of [`Updatable`] cells.
//!
//! A sparse map binds keys to cells lazily: the first [`listen`](SparseMap::listen) for a key runs
//! the map's factory, which creates the cell, and every later `listen` returns that same cell
//! until the binding is evicted or removed. The factory runs under the map lock, which makes the
//! maps coalesce concurrent lookups of the same key into a single cell.
//!
//! Maps report new bindings on their [`created`](SparseMap::created) stream and dropped ones on
//! [`evicted`](SparseMap::evicted). A [`Store`](crate::Store) uses those to wire its tiers.

use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, Weak};

use futures::FutureExt;
use futures::future::BoxFuture;

use crate::error::CacheEntry;
use crate::key::StoreKey;
use crate::observe::{EventStream, Registry, Subscription};
use crate::updatable::Updatable;

mod in_memory;
mod lru;

pub use in_memory::InMemorySparseMap;
pub use lru::LruSparseMap;

/// Creates the cell for a key that is not bound yet.
pub type MapFactory<K, V, C> = Arc<dyn Fn(&K, C) -> Updatable<V> + Send + Sync>;

/// A synchronous observer of [`MapEvent`]s.
pub type MapObserver<K, V> = Box<dyn Fn(&MapEvent<K, V>) + Send + Sync>;

/// A binding that was added to or dropped from a map.
#[derive(Debug, Clone)]
pub struct MapEvent<K, V> {
    pub key: K,
    pub cell: Updatable<V>,
}

/// A lazily populated map from keys to [`Updatable`] cells.
///
/// The `C` parameter is a context handed to the factory when a key gets bound, for example the
/// request parameters a remote lookup needs. It is ignored for keys that are already bound.
pub trait SparseMap<K, V, C = ()>: Send + Sync
where
    K: StoreKey,
    V: Clone + Send + Sync + 'static,
{
    /// The name this map reports in logs and metrics.
    fn name(&self) -> &'static str;

    /// Returns the cell bound to `key`, creating it through the factory if needed.
    fn listen(&self, key: K, context: C) -> Updatable<V>;

    /// Returns the cell bound to `key`, if there is one.
    fn listen_if_cached(&self, key: &K) -> Option<Updatable<V>>;

    /// Resolves with the latest event of the cell bound to `key`.
    fn get(&self, key: K, context: C) -> BoxFuture<'static, CacheEntry<V>> {
        let cell = self.listen(key, context);
        async move { cell.get().await }.boxed()
    }

    /// Drops the binding of `key`, reporting it as evicted.
    fn remove(&self, key: &K) -> Option<Updatable<V>>;

    /// Drops all bindings, reporting every one of them as evicted.
    fn clear(&self);

    /// The number of bindings.
    fn len(&self) -> usize;

    fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn contains(&self, key: &K) -> bool;

    /// A stream of all bindings created from now on.
    fn created(&self) -> EventStream<MapEvent<K, V>>;

    /// A stream of all bindings dropped from now on.
    fn evicted(&self) -> EventStream<MapEvent<K, V>>;

    /// Calls `observer` synchronously for every binding created from now on.
    fn on_created(&self, observer: MapObserver<K, V>) -> Subscription;

    /// Calls `observer` synchronously for every binding dropped from now on.
    fn on_evicted(&self, observer: MapObserver<K, V>) -> Subscription;
}

/// A bound cell together with the watch that unbinds it when it fails.
pub(crate) struct Binding<V> {
    cell: Updatable<V>,
    _failure_watch: Subscription,
}

/// The storage behind a map, deciding about recency and capacity.
pub(crate) trait Bindings<K, V>: Send {
    /// Looks up a binding, marking it as most recently used.
    fn lookup(&mut self, key: &K) -> Option<&Binding<V>>;
    /// Looks up a binding without touching its recency.
    fn peek(&self, key: &K) -> Option<&Binding<V>>;
    /// Inserts a new binding, returning the one that had to make room for it.
    fn insert(&mut self, key: K, binding: Binding<V>) -> Option<(K, Binding<V>)>;
    fn remove(&mut self, key: &K) -> Option<Binding<V>>;
    fn len(&self) -> usize;
    fn drain(&mut self) -> Vec<(K, Binding<V>)>;
}

/// A change to the bindings of a map, in the order the changes happened.
#[derive(Clone)]
enum Change<K, V> {
    Created(MapEvent<K, V>),
    Evicted(MapEvent<K, V>),
}

impl<K, V> Change<K, V> {
    fn created(&self) -> Option<&MapEvent<K, V>> {
        match self {
            Change::Created(event) => Some(event),
            Change::Evicted(_) => None,
        }
    }

    fn evicted(&self) -> Option<&MapEvent<K, V>> {
        match self {
            Change::Evicted(event) => Some(event),
            Change::Created(_) => None,
        }
    }
}

/// The map logic shared by all the [`SparseMap`] implementations.
///
/// Changes are queued while the map lock is held and delivered after it was released. Observers
/// thus see creations and evictions in the order they happened to the bindings, and may call
/// back into the map.
pub(crate) struct MapCore<K, V, C, S> {
    name: &'static str,
    factory: MapFactory<K, V, C>,
    bindings: Mutex<S>,
    changes: Arc<Registry<Change<K, V>>>,
    this: Weak<Self>,
}

impl<K, V, C, S> fmt::Debug for MapCore<K, V, C, S>
where
    K: StoreKey,
    V: Clone + Send + Sync + 'static,
    C: Send + 'static,
    S: Bindings<K, V> + 'static,
{
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let len = self
            .bindings
            .try_lock()
            .map(|bindings| bindings.len())
            .unwrap_or_default();
        f.debug_struct("SparseMap")
            .field("name", &self.name)
            .field("bindings", &len)
            .finish()
    }
}

impl<K, V, C, S> MapCore<K, V, C, S>
where
    K: StoreKey,
    V: Clone + Send + Sync + 'static,
    C: Send + 'static,
    S: Bindings<K, V> + 'static,
{
    pub fn new(name: &'static str, factory: MapFactory<K, V, C>, bindings: S) -> Arc<Self> {
        Arc::new_cyclic(|this| Self {
            name,
            factory,
            bindings: Mutex::new(bindings),
            changes: Registry::events(),
            this: this.clone(),
        })
    }

    pub fn name(&self) -> &'static str {
        self.name
    }

    pub fn listen(&self, key: K, context: C) -> Updatable<V> {
        metric!(counter("maps.access") += 1, "map" => self.name);

        let mut bindings = self.bindings.lock().unwrap();
        if let Some(binding) = bindings.lookup(&key) {
            metric!(counter("maps.hit") += 1, "map" => self.name);
            return binding.cell.clone();
        }

        let cell = (self.factory)(&key, context);
        let binding = Binding {
            cell: cell.clone(),
            _failure_watch: self.watch_failure(&key, &cell),
        };
        let displaced = bindings.insert(key.clone(), binding);
        if let Some((evicted_key, evicted)) = &displaced {
            self.enqueue_evicted(evicted_key, evicted);
        }

        tracing::debug!(map = self.name, ?key, "created binding");
        metric!(counter("maps.created") += 1, "map" => self.name);
        self.changes.enqueue(Change::Created(MapEvent {
            key,
            cell: cell.clone(),
        }));
        drop(bindings);

        // the failure watch of the displaced binding detaches outside of the lock
        drop(displaced);
        self.changes.deliver();

        cell
    }

    pub fn listen_if_cached(&self, key: &K) -> Option<Updatable<V>> {
        metric!(counter("maps.access") += 1, "map" => self.name);

        let mut bindings = self.bindings.lock().unwrap();
        let cell = bindings.lookup(key).map(|binding| binding.cell.clone());
        if cell.is_some() {
            metric!(counter("maps.hit") += 1, "map" => self.name);
        }
        cell
    }

    pub fn remove(&self, key: &K) -> Option<Updatable<V>> {
        let mut bindings = self.bindings.lock().unwrap();
        let removed = bindings.remove(key)?;
        self.enqueue_evicted(key, &removed);
        drop(bindings);

        let cell = removed.cell.clone();
        drop(removed);
        self.changes.deliver();
        Some(cell)
    }

    pub fn clear(&self) {
        let mut bindings = self.bindings.lock().unwrap();
        let drained = bindings.drain();
        for (key, binding) in &drained {
            self.enqueue_evicted(key, binding);
        }
        drop(bindings);

        drop(drained);
        self.changes.deliver();
    }

    pub fn len(&self) -> usize {
        self.bindings.lock().unwrap().len()
    }

    pub fn contains(&self, key: &K) -> bool {
        self.bindings.lock().unwrap().peek(key).is_some()
    }

    pub fn created(&self) -> EventStream<MapEvent<K, V>> {
        EventStream::attach_with(&self.changes, false, |change: &Change<K, V>| {
            change.created().cloned()
        })
    }

    pub fn evicted(&self) -> EventStream<MapEvent<K, V>> {
        EventStream::attach_with(&self.changes, false, |change: &Change<K, V>| {
            change.evicted().cloned()
        })
    }

    pub fn on_created(&self, observer: MapObserver<K, V>) -> Subscription {
        self.changes.subscribe(false, move |change: &Change<K, V>| {
            if let Some(event) = change.created() {
                observer(event)
            }
        })
    }

    pub fn on_evicted(&self, observer: MapObserver<K, V>) -> Subscription {
        self.changes.subscribe(false, move |change: &Change<K, V>| {
            if let Some(event) = change.evicted() {
                observer(event)
            }
        })
    }

    /// Queues the eviction of a binding, must be called under the map lock.
    fn enqueue_evicted(&self, key: &K, binding: &Binding<V>) {
        tracing::debug!(map = self.name, ?key, "evicted binding");
        metric!(counter("maps.evicted") += 1, "map" => self.name);
        self.changes.enqueue(Change::Evicted(MapEvent {
            key: key.clone(),
            cell: binding.cell.clone(),
        }));
    }

    /// Unbinds `cell` if it fails before it ever produced a value.
    fn watch_failure(&self, key: &K, cell: &Updatable<V>) -> Subscription {
        let has_value = AtomicBool::new(matches!(cell.peek(), Some(Ok(_))));
        let map = self.this.clone();
        let key = key.clone();
        let cell_id = cell.id();

        cell.watch(move |entry| match entry {
            Ok(_) => has_value.store(true, Ordering::Relaxed),
            Err(err) if !has_value.load(Ordering::Relaxed) => {
                if let Some(map) = map.upgrade() {
                    tracing::debug!(map = map.name, ?key, %err, "dropping failed binding");
                    map.remove_failed(&key, cell_id);
                }
            }
            Err(_) => {}
        })
    }

    fn remove_failed(&self, key: &K, cell_id: usize) {
        let mut bindings = self.bindings.lock().unwrap();
        // the key might have been rebound to a different cell by now
        if bindings.peek(key).map(|binding| binding.cell.id()) != Some(cell_id) {
            return;
        }
        let Some(removed) = bindings.remove(key) else {
            return;
        };
        self.enqueue_evicted(key, &removed);
        drop(bindings);

        drop(removed);
        self.changes.deliver();
    }
}

/// Implements [`SparseMap`] for a wrapper around an `Arc<MapCore>` in its `core` field.
macro_rules! delegate_sparse_map {
    ($map:ident) => {
        impl<K, V, C> $crate::sparse_map::SparseMap<K, V, C> for $map<K, V, C>
        where
            K: $crate::key::StoreKey,
            V: Clone + Send + Sync + 'static,
            C: Send + 'static,
        {
            fn name(&self) -> &'static str {
                self.core.name()
            }

            fn listen(&self, key: K, context: C) -> $crate::updatable::Updatable<V> {
                self.core.listen(key, context)
            }

            fn listen_if_cached(&self, key: &K) -> Option<$crate::updatable::Updatable<V>> {
                self.core.listen_if_cached(key)
            }

            fn remove(&self, key: &K) -> Option<$crate::updatable::Updatable<V>> {
                self.core.remove(key)
            }

            fn clear(&self) {
                self.core.clear()
            }

            fn len(&self) -> usize {
                self.core.len()
            }

            fn contains(&self, key: &K) -> bool {
                self.core.contains(key)
            }

            fn created(
                &self,
            ) -> $crate::observe::EventStream<$crate::sparse_map::MapEvent<K, V>> {
                self.core.created()
            }

            fn evicted(
                &self,
            ) -> $crate::observe::EventStream<$crate::sparse_map::MapEvent<K, V>> {
                self.core.evicted()
            }

            fn on_created(
                &self,
                observer: $crate::sparse_map::MapObserver<K, V>,
            ) -> $crate::observe::Subscription {
                self.core.on_created(observer)
            }

            fn on_evicted(
                &self,
                observer: $crate::sparse_map::MapObserver<K, V>,
            ) -> $crate::observe::Subscription {
                self.core.on_evicted(observer)
            }
        }
    };
}

use delegate_sparse_map;
