//! The reactive cell every cached value lives in.

use std::fmt;
use std::future::Future;
use std::sync::{Arc, Mutex};

use futures::future::BoxFuture;
use futures::{FutureExt, StreamExt};

use crate::error::{CacheEntry, CacheError};
use crate::observe::{EventStream, Registry, Subscription};
use crate::utils::futures::TaskSet;

type Factory<T> = Arc<dyn Fn() -> BoxFuture<'static, CacheEntry<T>> + Send + Sync>;

/// A stream of all the events of one [`Updatable`], starting with the latest one.
pub type UpdatableStream<T> = EventStream<CacheEntry<T>>;

struct Production<T> {
    factory: Option<Factory<T>>,
    started: bool,
    tasks: TaskSet,
}

/// An event of a cell, remembering whether it was pushed or produced by the factory.
#[derive(Clone)]
struct Event<T> {
    entry: CacheEntry<T>,
    pushed: bool,
}

impl<T> Event<T> {
    fn pushed(entry: CacheEntry<T>) -> Self {
        Self {
            entry,
            pushed: true,
        }
    }
}

struct Shared<T> {
    registry: Arc<Registry<Event<T>>>,
    production: Mutex<Production<T>>,
}

/// A mutable, observable cell holding a [`CacheEntry`].
///
/// The cell records the latest event pushed into it and broadcasts every event to its observers,
/// all of which see the same sequence. Observers attaching late first receive the latest event.
///
/// A cell can be created with a factory which produces its initial value. The factory is run
/// lazily on a background task when the cell is first observed, and its result is dropped if a
/// value was pushed into the cell in the meantime.
///
/// `Updatable` is a cheap handle, clones refer to the same cell.
pub struct Updatable<T> {
    shared: Arc<Shared<T>>,
}

impl<T> Clone for Updatable<T> {
    fn clone(&self) -> Self {
        Self {
            shared: Arc::clone(&self.shared),
        }
    }
}

impl<T> fmt::Debug for Updatable<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut debug = f.debug_struct("Updatable");
        debug.field("id", &Arc::as_ptr(&self.shared));
        if let Ok(production) = self.shared.production.try_lock() {
            debug
                .field("lazy", &production.factory.is_some())
                .field("started", &production.started);
        }
        debug.finish()
    }
}

impl<T: Clone + Send + Sync + 'static> Updatable<T> {
    /// Creates a cell whose initial value is produced by `factory`.
    pub fn new<F, Fut>(factory: F) -> Self
    where
        F: Fn() -> Fut + Send + Sync + 'static,
        Fut: Future<Output = CacheEntry<T>> + Send + 'static,
    {
        let factory: Factory<T> = Arc::new(move || factory().boxed());
        Self::with_factory(Some(factory))
    }

    /// Creates a cell without any value, which only ever changes when pushed to.
    pub fn empty() -> Self {
        Self::with_factory(None)
    }

    /// Creates a cell holding `value`.
    pub fn from_value(value: T) -> Self {
        let cell = Self::empty();
        cell.next(value);
        cell
    }

    fn with_factory(factory: Option<Factory<T>>) -> Self {
        Self {
            shared: Arc::new(Shared {
                registry: Registry::replaying(),
                production: Mutex::new(Production {
                    factory,
                    started: false,
                    tasks: TaskSet::default(),
                }),
            }),
        }
    }

    /// Identifies the cell, all clones share the same id.
    pub fn id(&self) -> usize {
        Arc::as_ptr(&self.shared) as usize
    }

    /// Whether both handles refer to the same cell.
    pub fn ptr_eq(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.shared, &other.shared)
    }

    /// Returns a stream of the latest and all future events.
    ///
    /// The stream does not terminate on its own. If nothing was recorded yet, this starts the
    /// factory.
    pub fn listen(&self) -> UpdatableStream<T> {
        let stream = EventStream::attach_with(&self.shared.registry, true, |event: &Event<T>| {
            Some(event.entry.clone())
        });
        self.ensure_started();
        stream
    }

    /// Attaches a callback receiving the latest and all future events.
    ///
    /// Like [`listen`](Self::listen), this starts the factory.
    pub fn subscribe<F>(&self, callback: F) -> Subscription
    where
        F: Fn(&CacheEntry<T>) + Send + Sync + 'static,
    {
        let subscription = self
            .shared
            .registry
            .subscribe(true, move |event: &Event<T>| callback(&event.entry));
        self.ensure_started();
        subscription
    }

    /// Attaches a callback receiving the events pushed into the cell from now on.
    ///
    /// This is a passive observation: the latest event is not replayed, the factory is not
    /// started and the value it produces is not reported. Only [`next`](Self::next),
    /// [`error`](Self::error) and [`next_async`](Self::next_async) reach the callback.
    pub fn subscribe_updates<F>(&self, callback: F) -> Subscription
    where
        F: Fn(&CacheEntry<T>) + Send + Sync + 'static,
    {
        self.shared
            .registry
            .subscribe(false, move |event: &Event<T>| {
                if event.pushed {
                    callback(&event.entry)
                }
            })
    }

    /// Attaches a callback receiving all events from now on, including the produced one.
    ///
    /// Like [`subscribe_updates`](Self::subscribe_updates), this does not start the factory.
    pub(crate) fn watch<F>(&self, callback: F) -> Subscription
    where
        F: Fn(&CacheEntry<T>) + Send + Sync + 'static,
    {
        self.shared
            .registry
            .subscribe(false, move |event: &Event<T>| callback(&event.entry))
    }

    /// Records `value` and broadcasts it to all observers.
    pub fn next(&self, value: T) {
        self.shared.registry.emit(Event::pushed(Ok(value)));
    }

    /// Records `err` and broadcasts it to all observers.
    pub fn error(&self, err: CacheError) {
        self.shared.registry.emit(Event::pushed(Err(err)));
    }

    /// Pushes the outcome of `future` once it resolves.
    ///
    /// The future is driven on a background task, which is aborted by [`release`](Self::release).
    pub fn next_async<F>(&self, future: F)
    where
        F: Future<Output = CacheEntry<T>> + Send + 'static,
    {
        let registry = Arc::clone(&self.shared.registry);
        let handle = tokio::spawn(async move {
            registry.emit(Event::pushed(future.await));
        });
        self.shared.production.lock().unwrap().tasks.track(handle);
    }

    /// The latest recorded event, without waiting or starting production.
    pub fn peek(&self) -> Option<CacheEntry<T>> {
        self.shared.registry.recorded().map(|event| event.entry)
    }

    /// Resolves with the latest event, waiting for the first one if there is none yet.
    pub async fn get(&self) -> CacheEntry<T> {
        if let Some(entry) = self.peek() {
            return entry;
        }
        let mut stream = self.listen();
        stream.next().await.unwrap_or(Err(CacheError::InternalError))
    }

    /// Aborts any in-flight production.
    ///
    /// If that leaves active observers without any event, they receive
    /// [`CacheError::Evicted`] so nobody waits for the aborted value forever. Otherwise observers
    /// are not notified, and a cell that has no event yet runs its factory again the next time
    /// it is actively observed.
    pub fn release(&self) {
        let aborted = {
            let mut production = self.shared.production.lock().unwrap();
            production.started = false;
            production.tasks.abort_all()
        };
        if aborted == 0 {
            return;
        }
        tracing::trace!(cell = self.id(), aborted, "released cell");

        let registry = &self.shared.registry;
        if registry.active_observer_count() > 0
            && registry.emit_if_empty(Event {
                entry: Err(CacheError::Evicted),
                pushed: false,
            })
        {
            tracing::debug!(cell = self.id(), "released cell with pending observers");
        }
    }

    /// The number of attached observers.
    pub fn observer_count(&self) -> usize {
        self.shared.registry.observer_count()
    }

    fn ensure_started(&self) {
        if self.shared.registry.recorded().is_some() {
            return;
        }
        let mut production = self.shared.production.lock().unwrap();
        if production.started {
            return;
        }
        let Some(factory) = production.factory.clone() else {
            return;
        };
        production.started = true;

        let registry = Arc::clone(&self.shared.registry);
        let handle = tokio::spawn(async move {
            let entry = factory().await;
            if !registry.emit_if_empty(Event {
                entry,
                pushed: false,
            }) {
                tracing::trace!("discarding produced value, cell was pushed to meanwhile");
            }
        });
        production.tasks.track(handle);
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    use tokio::sync::Semaphore;

    use super::*;

    /// A cell whose factory waits for `gate` and counts its invocations.
    fn gated(value: u32) -> (Updatable<u32>, Arc<Semaphore>, Arc<AtomicUsize>) {
        let gate = Arc::new(Semaphore::new(0));
        let calls = Arc::new(AtomicUsize::new(0));
        let cell = {
            let gate = Arc::clone(&gate);
            let calls = Arc::clone(&calls);
            Updatable::new(move || {
                calls.fetch_add(1, Ordering::SeqCst);
                let gate = Arc::clone(&gate);
                async move {
                    let _permit = gate.acquire().await.map_err(|_| CacheError::InternalError)?;
                    Ok(value)
                }
            })
        };
        (cell, gate, calls)
    }

    async fn settle() {
        for _ in 0..10 {
            tokio::task::yield_now().await;
        }
    }

    #[tokio::test]
    async fn test_lazy_factory() {
        let (cell, gate, calls) = gated(7);
        settle().await;
        assert_eq!(calls.load(Ordering::SeqCst), 0);

        gate.add_permits(1);
        assert_eq!(cell.get().await, Ok(7));
        assert_eq!(calls.load(Ordering::SeqCst), 1);

        // observing again does not run the factory another time
        assert_eq!(cell.get().await, Ok(7));
        let _stream = cell.listen();
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_listen_replays_then_follows() {
        let cell = Updatable::from_value(1);
        let mut stream = cell.listen();
        cell.next(2);
        cell.error(CacheError::Read("gone".into()));
        cell.next(3);

        assert_eq!(stream.next().await, Some(Ok(1)));
        assert_eq!(stream.next().await, Some(Ok(2)));
        assert_eq!(
            stream.next().await,
            Some(Err(CacheError::Read("gone".into())))
        );
        assert_eq!(stream.next().await, Some(Ok(3)));

        let mut late = cell.listen();
        assert_eq!(late.next().await, Some(Ok(3)));
    }

    #[tokio::test]
    async fn test_push_during_load_wins() {
        let (cell, gate, _calls) = gated(1);
        let mut stream = cell.listen();
        settle().await;

        cell.next(5);
        gate.add_permits(1);
        settle().await;

        assert_eq!(cell.peek(), Some(Ok(5)));
        assert_eq!(stream.next().await, Some(Ok(5)));
        assert!(
            tokio::time::timeout(Duration::from_millis(20), stream.next())
                .await
                .is_err()
        );
    }

    #[tokio::test]
    async fn test_passive_subscription() {
        let (cell, gate, calls) = gated(1);
        let seen = Arc::new(Mutex::new(vec![]));
        let _sub = {
            let seen = Arc::clone(&seen);
            cell.subscribe_updates(move |entry| seen.lock().unwrap().push(entry.clone()))
        };
        settle().await;
        assert_eq!(calls.load(Ordering::SeqCst), 0);

        // the produced value is not an update
        gate.add_permits(1);
        assert_eq!(cell.get().await, Ok(1));
        assert!(seen.lock().unwrap().is_empty());

        cell.next(2);
        assert_eq!(*seen.lock().unwrap(), vec![Ok(2)]);
    }

    #[tokio::test]
    async fn test_release_aborts_and_restarts() {
        let (cell, gate, calls) = gated(1);
        drop(cell.listen());
        settle().await;
        assert_eq!(calls.load(Ordering::SeqCst), 1);

        // nobody is waiting anymore, so the release stays silent
        cell.release();
        gate.add_permits(1);
        settle().await;
        assert_eq!(cell.peek(), None);

        // the next active observation runs the factory again
        assert_eq!(cell.get().await, Ok(1));
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_release_resolves_waiters() {
        let (cell, _gate, calls) = gated(1);
        let waiter = tokio::spawn({
            let cell = cell.clone();
            async move { cell.get().await }
        });
        settle().await;
        assert_eq!(calls.load(Ordering::SeqCst), 1);

        cell.release();
        let result = tokio::time::timeout(Duration::from_secs(1), waiter)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(result, Err(CacheError::Evicted));
        assert_eq!(cell.peek(), Some(Err(CacheError::Evicted)));
    }

    #[tokio::test]
    async fn test_next_async() {
        let cell = Updatable::empty();
        cell.next_async(async { Ok(3) });
        assert_eq!(cell.get().await, Ok(3));

        let mut stream = cell.listen();
        assert_eq!(stream.next().await, Some(Ok(3)));
        cell.next_async(async { Err(CacheError::OriginFetch("timeout".into())) });
        assert_eq!(
            stream.next().await,
            Some(Err(CacheError::OriginFetch("timeout".into())))
        );
    }

    #[tokio::test]
    async fn test_release_aborts_next_async() {
        let cell: Updatable<u32> = Updatable::empty();
        cell.next_async(async {
            tokio::time::sleep(Duration::from_millis(20)).await;
            Ok(1)
        });
        cell.release();
        tokio::time::sleep(Duration::from_millis(40)).await;
        assert_eq!(cell.peek(), None);
    }
}
