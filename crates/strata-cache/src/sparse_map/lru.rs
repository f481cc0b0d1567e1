use std::fmt;
use std::num::NonZeroUsize;
use std::sync::Arc;

use lru::LruCache;

use super::{Binding, Bindings, MapCore, delegate_sparse_map};
use crate::key::StoreKey;
use crate::updatable::Updatable;

impl<K: StoreKey, V: Send> Bindings<K, V> for LruCache<K, Binding<V>> {
    fn lookup(&mut self, key: &K) -> Option<&Binding<V>> {
        self.get(key)
    }

    fn peek(&self, key: &K) -> Option<&Binding<V>> {
        LruCache::peek(self, key)
    }

    fn insert(&mut self, key: K, binding: Binding<V>) -> Option<(K, Binding<V>)> {
        // only ever called for absent keys, so this returns the least recently used binding
        self.push(key, binding)
    }

    fn remove(&mut self, key: &K) -> Option<Binding<V>> {
        self.pop(key)
    }

    fn len(&self) -> usize {
        LruCache::len(self)
    }

    fn drain(&mut self) -> Vec<(K, Binding<V>)> {
        std::iter::from_fn(|| self.pop_lru()).collect()
    }
}

/// A [`SparseMap`](super::SparseMap) holding at most `max` bindings.
///
/// Every `listen` marks its key as most recently used. Binding a key beyond `max` evicts the
/// least recently used binding right away, under the same lock as the insertion, so the map
/// never holds more than `max` bindings. The eviction is reported before the creation.
pub struct LruSparseMap<K, V, C = ()> {
    core: Arc<MapCore<K, V, C, LruCache<K, Binding<V>>>>,
}

impl<K, V, C> LruSparseMap<K, V, C>
where
    K: StoreKey,
    V: Clone + Send + Sync + 'static,
    C: Send + 'static,
{
    pub fn new<F>(name: &'static str, max: NonZeroUsize, factory: F) -> Self
    where
        F: Fn(&K, C) -> Updatable<V> + Send + Sync + 'static,
    {
        Self {
            core: MapCore::new(name, Arc::new(factory), LruCache::new(max)),
        }
    }
}

impl<K, V, C> fmt::Debug for LruSparseMap<K, V, C>
where
    K: StoreKey,
    V: Clone + Send + Sync + 'static,
    C: Send + 'static,
{
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(&self.core, f)
    }
}

delegate_sparse_map!(LruSparseMap);
