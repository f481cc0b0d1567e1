use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use super::{Binding, Bindings, MapCore, delegate_sparse_map};
use crate::key::StoreKey;
use crate::updatable::Updatable;

impl<K: StoreKey, V: Send> Bindings<K, V> for HashMap<K, Binding<V>> {
    fn lookup(&mut self, key: &K) -> Option<&Binding<V>> {
        self.get(key)
    }

    fn peek(&self, key: &K) -> Option<&Binding<V>> {
        self.get(key)
    }

    fn insert(&mut self, key: K, binding: Binding<V>) -> Option<(K, Binding<V>)> {
        HashMap::insert(self, key, binding);
        None
    }

    fn remove(&mut self, key: &K) -> Option<Binding<V>> {
        HashMap::remove(self, key)
    }

    fn len(&self) -> usize {
        HashMap::len(self)
    }

    fn drain(&mut self) -> Vec<(K, Binding<V>)> {
        HashMap::drain(self).collect()
    }
}

/// A [`SparseMap`](super::SparseMap) without a capacity bound.
///
/// Bindings live until they are removed, fail, or the map is cleared.
pub struct InMemorySparseMap<K, V, C = ()> {
    core: Arc<MapCore<K, V, C, HashMap<K, Binding<V>>>>,
}

impl<K, V, C> InMemorySparseMap<K, V, C>
where
    K: StoreKey,
    V: Clone + Send + Sync + 'static,
    C: Send + 'static,
{
    pub fn new<F>(name: &'static str, factory: F) -> Self
    where
        F: Fn(&K, C) -> Updatable<V> + Send + Sync + 'static,
    {
        Self {
            core: MapCore::new(name, Arc::new(factory), HashMap::new()),
        }
    }
}

impl<K, V, C> fmt::Debug for InMemorySparseMap<K, V, C>
where
    K: StoreKey,
    V: Clone + Send + Sync + 'static,
    C: Send + 'static,
{
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(&self.core, f)
    }
}

delegate_sparse_map!(InMemorySparseMap);

#[cfg(test)]
mod tests {
    use std::sync::Mutex;
    use std::sync::atomic::{AtomicUsize, Ordering};

    use futures::StreamExt;

    use super::*;
    use crate::error::CacheError;
    use crate::sparse_map::SparseMap;

    fn counting_map() -> (InMemorySparseMap<String, u32>, Arc<AtomicUsize>) {
        let calls = Arc::new(AtomicUsize::new(0));
        let map = {
            let calls = Arc::clone(&calls);
            InMemorySparseMap::new("test", move |key: &String, ()| {
                calls.fetch_add(1, Ordering::SeqCst);
                let len = key.len() as u32;
                Updatable::new(move || async move { Ok(len) })
            })
        };
        (map, calls)
    }

    #[test]
    fn test_coalescing() {
        let (map, calls) = counting_map();

        let cells: Vec<_> = std::thread::scope(|scope| {
            let handles: Vec<_> = (0..8)
                .map(|_| scope.spawn(|| map.listen("shared".into(), ())))
                .collect();
            handles.into_iter().map(|h| h.join().unwrap()).collect()
        });

        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert!(cells.iter().all(|cell| cell.ptr_eq(&cells[0])));
        assert_eq!(map.len(), 1);
    }

    #[tokio::test]
    async fn test_get_and_cached() {
        let (map, calls) = counting_map();
        assert!(map.listen_if_cached(&"abc".into()).is_none());
        assert!(map.is_empty());

        assert_eq!(map.get("abc".into(), ()).await, Ok(3));
        assert!(map.contains(&"abc".into()));
        let cached = map.listen_if_cached(&"abc".into()).unwrap();
        assert_eq!(cached.peek(), Some(Ok(3)));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_remove_and_clear_report_evictions() {
        let (map, _calls) = counting_map();
        let mut evicted = map.evicted();
        let mut created = map.created();

        let a = map.listen("a".into(), ());
        map.listen("b".into(), ());
        assert!(created.next().await.unwrap().cell.ptr_eq(&a));
        assert_eq!(created.next().await.unwrap().key, "b");

        let removed = map.remove(&"a".into()).unwrap();
        assert!(removed.ptr_eq(&a));
        assert_eq!(evicted.next().await.unwrap().key, "a");

        map.clear();
        assert_eq!(evicted.next().await.unwrap().key, "b");
        assert!(map.is_empty());
        assert!(map.remove(&"b".into()).is_none());
    }

    #[test]
    fn test_failed_binding_is_dropped() {
        let map: InMemorySparseMap<String, u32> =
            InMemorySparseMap::new("test", |_: &String, ()| Updatable::empty());
        let evicted = Arc::new(Mutex::new(vec![]));
        let _sub = {
            let evicted = Arc::clone(&evicted);
            map.on_evicted(Box::new(move |event| {
                evicted.lock().unwrap().push(event.key.clone())
            }))
        };

        let cell = map.listen("a".into(), ());
        cell.error(CacheError::OriginFetch("unreachable".into()));
        assert!(!map.contains(&"a".into()));
        assert_eq!(*evicted.lock().unwrap(), vec!["a".to_owned()]);

        // a fresh listen binds a new cell
        let retry = map.listen("a".into(), ());
        assert!(!retry.ptr_eq(&cell));

        // once a value was produced, errors no longer unbind
        retry.next(1);
        retry.error(CacheError::Read("flaky".into()));
        assert!(map.contains(&"a".into()));
        assert_eq!(evicted.lock().unwrap().len(), 1);
    }
}
