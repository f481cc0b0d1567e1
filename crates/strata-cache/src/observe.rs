//! An explicit observer registry with ordered, re-entrancy safe dispatch.
//!
//! [`Registry`] is the multicast primitive below both [`Updatable`](crate::Updatable) cells and
//! the `created` / `evicted` events of the [sparse maps](crate::SparseMap).
//!
//! Dispatch is trampolined: whoever emits while no dispatch is running becomes the dispatcher and
//! delivers queued events one after the other, outside of the lock. An emit issued re-entrantly
//! from within an observer callback is only queued and delivered once the current event reached
//! all observers. That way every observer sees exactly the same sequence of events.
//!
//! An emit from another thread queues its event and blocks until the running dispatch is over,
//! so an event has always been delivered once `emit` returns. Observer callbacks must therefore
//! never wait for another thread that emits into the same registry.

use std::collections::VecDeque;
use std::fmt;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Condvar, Mutex, MutexGuard, Weak};
use std::task::{Context, Poll};
use std::thread::{self, ThreadId};

use futures::Stream;
use tokio::sync::mpsc;

use crate::utils::futures::CallOnDrop;

type Callback<E> = Box<dyn Fn(&E) + Send + Sync + 'static>;

struct Observer<E> {
    id: u64,
    active: AtomicBool,
    /// Whether the observer asked for the latest event when it attached.
    replayed: bool,
    callback: Callback<E>,
}

impl<E> Observer<E> {
    fn notify(&self, event: &E) {
        // observers detached mid-dispatch may still be part of a snapshot
        if self.active.load(Ordering::Acquire) {
            (self.callback)(event)
        }
    }
}

enum Dispatch<E> {
    /// Deliver an event to all attached observers.
    Emit(E),
    /// Attach a new observer, optionally replaying the last delivered event to it first.
    Attach(Arc<Observer<E>>, bool),
}

struct State<E> {
    observers: Vec<Arc<Observer<E>>>,
    queue: VecDeque<Dispatch<E>>,
    dispatcher: Option<ThreadId>,
    next_id: u64,
    /// The latest event that was emitted, though not necessarily delivered yet.
    recorded: Option<E>,
    /// The latest event that was delivered, this is what late subscribers get replayed.
    delivered: Option<E>,
}

/// A multicast registry of observer callbacks.
pub(crate) struct Registry<E> {
    replay: bool,
    state: Mutex<State<E>>,
    idle: Condvar,
}

impl<E> fmt::Debug for Registry<E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let observers = self
            .state
            .try_lock()
            .map(|state| state.observers.len())
            .unwrap_or_default();
        f.debug_struct("Registry")
            .field("replay", &self.replay)
            .field("observers", &observers)
            .finish()
    }
}

impl<E: Clone + Send + Sync + 'static> Registry<E> {
    /// Creates a registry that remembers and replays its latest event.
    pub fn replaying() -> Arc<Self> {
        Self::new(true)
    }

    /// Creates a registry for plain events, which are not remembered.
    pub fn events() -> Arc<Self> {
        Self::new(false)
    }

    fn new(replay: bool) -> Arc<Self> {
        Arc::new(Self {
            replay,
            state: Mutex::new(State {
                observers: Vec::new(),
                queue: VecDeque::new(),
                dispatcher: None,
                next_id: 0,
                recorded: None,
                delivered: None,
            }),
            idle: Condvar::new(),
        })
    }

    /// The latest emitted event, if this registry replays.
    pub fn recorded(&self) -> Option<E> {
        self.state.lock().unwrap().recorded.clone()
    }

    /// The number of attached observers.
    pub fn observer_count(&self) -> usize {
        self.state.lock().unwrap().observers.len()
    }

    /// The number of attached observers that asked for the latest event on attaching.
    ///
    /// These are the observers interested in a current value, as opposed to passive ones that
    /// only follow changes.
    pub fn active_observer_count(&self) -> usize {
        let state = self.state.lock().unwrap();
        state.observers.iter().filter(|o| o.replayed).count()
    }

    /// Emits an event to all observers.
    pub fn emit(&self, event: E) {
        self.enqueue(event);
        self.deliver();
    }

    /// Queues an event without delivering it.
    ///
    /// Callers that have to order events with their own state enqueue while holding their lock
    /// and [`deliver`](Self::deliver) after releasing it.
    pub fn enqueue(&self, event: E) {
        let mut state = self.state.lock().unwrap();
        if self.replay {
            state.recorded = Some(event.clone());
        }
        state.queue.push_back(Dispatch::Emit(event));
    }

    /// Delivers all queued events.
    ///
    /// Returns once they reached all observers, or right away when called from an observer.
    pub fn deliver(&self) {
        let state = self.state.lock().unwrap();
        self.run(state);
    }

    /// Emits an event only if nothing has been emitted yet.
    ///
    /// Returns `false` if the event was discarded.
    pub fn emit_if_empty(&self, event: E) -> bool {
        let mut state = self.state.lock().unwrap();
        if state.recorded.is_some() {
            return false;
        }
        if self.replay {
            state.recorded = Some(event.clone());
        }
        state.queue.push_back(Dispatch::Emit(event));
        self.run(state);
        true
    }

    /// Attaches `callback` as a new observer.
    ///
    /// With `replay` set, the callback first receives the latest delivered event, if any. The
    /// observer stays attached until the returned [`Subscription`] is dropped.
    pub fn subscribe<F>(self: &Arc<Self>, replay: bool, callback: F) -> Subscription
    where
        F: Fn(&E) + Send + Sync + 'static,
    {
        let mut state = self.state.lock().unwrap();
        let id = state.next_id;
        state.next_id += 1;

        let observer = Arc::new(Observer {
            id,
            active: AtomicBool::new(true),
            replayed: replay,
            callback: Box::new(callback),
        });
        state
            .queue
            .push_back(Dispatch::Attach(Arc::clone(&observer), replay));

        let registry = Arc::downgrade(self);
        let subscription = Subscription::new(move || detach(&registry, &observer));

        self.run(state);
        subscription
    }

    /// Drives the dispatch loop, unless this is a re-entrant call.
    fn run<'a>(&'a self, mut state: MutexGuard<'a, State<E>>) {
        let current = thread::current().id();
        while let Some(dispatcher) = state.dispatcher {
            if dispatcher == current {
                return;
            }
            state = self.idle.wait(state).unwrap();
        }
        state.dispatcher = Some(current);

        while let Some(dispatch) = state.queue.pop_front() {
            match dispatch {
                Dispatch::Emit(event) => {
                    if self.replay {
                        state.delivered = Some(event.clone());
                    }
                    let observers = state.observers.clone();
                    drop(state);
                    for observer in observers {
                        observer.notify(&event);
                    }
                }
                Dispatch::Attach(observer, replay) => {
                    let mut last = None;
                    // the subscription might have been dropped before it was ever attached
                    if observer.active.load(Ordering::Acquire) {
                        state.observers.push(Arc::clone(&observer));
                        if replay {
                            last = state.delivered.clone();
                        }
                    }
                    drop(state);
                    if let Some(event) = last {
                        observer.notify(&event);
                    }
                }
            }
            state = self.state.lock().unwrap();
        }

        state.dispatcher = None;
        drop(state);
        self.idle.notify_all();
    }
}

fn detach<E>(registry: &Weak<Registry<E>>, observer: &Arc<Observer<E>>) {
    observer.active.store(false, Ordering::Release);
    if let Some(registry) = registry.upgrade() {
        let mut state = registry.state.lock().unwrap();
        state.observers.retain(|other| other.id != observer.id);
    }
}

/// Keeps an observer attached, dropping it detaches the observer.
///
/// After the drop, no event emitted later reaches the observer.
#[must_use = "dropping a subscription detaches the observer"]
#[derive(Debug)]
pub struct Subscription {
    _guard: CallOnDrop,
}

impl Subscription {
    fn new<F: FnOnce() + Send + Sync + 'static>(f: F) -> Self {
        Self {
            _guard: CallOnDrop::new(f),
        }
    }
}

/// A stream of events of one observer.
///
/// Created by [`Updatable::listen`](crate::Updatable::listen) and the `created` / `evicted`
/// streams of the maps. The stream never terminates on its own, dropping it detaches the
/// observer.
pub struct EventStream<E> {
    rx: mpsc::UnboundedReceiver<E>,
    _subscription: Subscription,
}

impl<E> fmt::Debug for EventStream<E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EventStream")
            .field("buffered", &self.rx.len())
            .finish()
    }
}

impl<E: Clone + Send + Sync + 'static> EventStream<E> {
    pub(crate) fn attach(registry: &Arc<Registry<E>>, replay: bool) -> Self {
        Self::attach_with(registry, replay, |event| Some(event.clone()))
    }

    /// Attaches a stream of the events `map` extracts from the registry's events.
    pub(crate) fn attach_with<R, F>(registry: &Arc<Registry<R>>, replay: bool, map: F) -> Self
    where
        R: Clone + Send + Sync + 'static,
        F: Fn(&R) -> Option<E> + Send + Sync + 'static,
    {
        let (tx, rx) = mpsc::unbounded_channel();
        let subscription = registry.subscribe(replay, move |event: &R| {
            if let Some(event) = map(event) {
                // the receiver is only gone while the stream itself is being dropped
                tx.send(event).ok();
            }
        });
        Self {
            rx,
            _subscription: subscription,
        }
    }
}

impl<E> Stream for EventStream<E> {
    type Item = E;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        self.rx.poll_recv(cx)
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex;

    use futures::StreamExt;

    use super::*;

    fn recorder() -> (Arc<Mutex<Vec<u32>>>, impl Fn(&u32) + Send + Sync + 'static) {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let cb = {
            let seen = Arc::clone(&seen);
            move |v: &u32| seen.lock().unwrap().push(*v)
        };
        (seen, cb)
    }

    #[test]
    fn test_replay_latest() {
        let registry = Registry::replaying();
        registry.emit(1);
        registry.emit(2);

        let (seen, cb) = recorder();
        let _sub = registry.subscribe(true, cb);
        registry.emit(3);

        assert_eq!(*seen.lock().unwrap(), vec![2, 3]);
        assert_eq!(registry.recorded(), Some(3));
    }

    #[test]
    fn test_no_replay_for_updates() {
        let registry = Registry::replaying();
        registry.emit(1);

        let (seen, cb) = recorder();
        let _sub = registry.subscribe(false, cb);
        registry.emit(2);

        assert_eq!(*seen.lock().unwrap(), vec![2]);
    }

    #[test]
    fn test_drop_detaches() {
        let registry = Registry::events();
        let (seen, cb) = recorder();
        let sub = registry.subscribe(false, cb);
        registry.emit(1);
        drop(sub);
        registry.emit(2);

        assert_eq!(*seen.lock().unwrap(), vec![1]);
        assert_eq!(registry.observer_count(), 0);
        assert_eq!(registry.recorded(), None);
    }

    #[test]
    fn test_reentrant_emit_keeps_order() {
        let registry: Arc<Registry<u32>> = Registry::replaying();

        // the first observer reacts to `1` by emitting `2` from within the dispatch
        let _echo = {
            let weak = Arc::downgrade(&registry);
            registry.subscribe(false, move |v: &u32| {
                if *v == 1 {
                    if let Some(registry) = weak.upgrade() {
                        registry.emit(2);
                    }
                }
            })
        };
        let (seen_a, cb_a) = recorder();
        let _a = registry.subscribe(false, cb_a);
        let (seen_b, cb_b) = recorder();
        let _b = registry.subscribe(false, cb_b);

        registry.emit(1);

        // both observers see `1` before `2`, even though `2` was emitted before `1` reached them
        assert_eq!(*seen_a.lock().unwrap(), vec![1, 2]);
        assert_eq!(*seen_b.lock().unwrap(), vec![1, 2]);
    }

    #[test]
    fn test_cross_thread_emit_is_delivered_on_return() {
        let registry: Arc<Registry<u32>> = Registry::events();
        let (seen, cb) = recorder();
        let _sub = registry.subscribe(false, cb);

        std::thread::scope(|scope| {
            for i in 0..4 {
                let registry = &registry;
                let seen = &seen;
                scope.spawn(move || {
                    registry.emit(i);
                    assert!(seen.lock().unwrap().contains(&i));
                });
            }
        });
        assert_eq!(seen.lock().unwrap().len(), 4);
    }

    #[test]
    fn test_emit_if_empty() {
        let registry = Registry::replaying();
        assert!(registry.emit_if_empty(1));
        assert!(!registry.emit_if_empty(2));
        assert_eq!(registry.recorded(), Some(1));
    }

    #[test]
    fn test_enqueue_then_deliver() {
        let registry: Arc<Registry<u32>> = Registry::replaying();
        let (seen, cb) = recorder();
        let _sub = registry.subscribe(false, cb);

        registry.enqueue(1);
        registry.enqueue(2);
        assert!(seen.lock().unwrap().is_empty());
        assert_eq!(registry.recorded(), Some(2));

        registry.deliver();
        assert_eq!(*seen.lock().unwrap(), vec![1, 2]);
    }

    #[test]
    fn test_active_observer_count() {
        let registry: Arc<Registry<u32>> = Registry::replaying();
        let _passive = registry.subscribe(false, |_| {});
        let active = registry.subscribe(true, |_| {});

        assert_eq!(registry.observer_count(), 2);
        assert_eq!(registry.active_observer_count(), 1);
        drop(active);
        assert_eq!(registry.active_observer_count(), 0);
    }

    #[tokio::test]
    async fn test_stream() {
        let registry = Registry::replaying();
        registry.emit(1);

        let mut stream = EventStream::attach(&registry, true);
        registry.emit(2);

        assert_eq!(stream.next().await, Some(1));
        assert_eq!(stream.next().await, Some(2));

        drop(stream);
        assert_eq!(registry.observer_count(), 0);
    }
}
