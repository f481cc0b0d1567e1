//! Helpers around spawned futures and their cleanup.

use tokio::task::{AbortHandle, JoinHandle};

/// Execute a callback on dropping of the container type.
///
/// The callback must not panic under any circumstance. Since it is called while dropping an item,
/// this might result in aborting program execution.
pub struct CallOnDrop {
    f: Option<Box<dyn FnOnce() + Send + Sync + 'static>>,
}

impl CallOnDrop {
    /// Creates a new `CallOnDrop`.
    pub fn new<F: FnOnce() + Send + Sync + 'static>(f: F) -> CallOnDrop {
        CallOnDrop {
            f: Some(Box::new(f)),
        }
    }
}

impl Drop for CallOnDrop {
    fn drop(&mut self) {
        if let Some(f) = self.f.take() {
            f();
        }
    }
}

impl std::fmt::Debug for CallOnDrop {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CallOnDrop").finish_non_exhaustive()
    }
}

/// The set of tasks that currently produce a value for somebody.
///
/// Finished tasks are pruned whenever a new one is tracked. [`abort_all`](Self::abort_all)
/// cancels whatever is still in flight.
#[derive(Debug, Default)]
pub struct TaskSet {
    tasks: Vec<AbortHandle>,
}

impl TaskSet {
    /// Tracks a freshly spawned task.
    pub fn track<T>(&mut self, handle: JoinHandle<T>) {
        self.tasks.retain(|task| !task.is_finished());
        self.tasks.push(handle.abort_handle());
    }

    /// Aborts all tracked tasks, returning how many were still running.
    pub fn abort_all(&mut self) -> usize {
        let mut aborted = 0;
        for task in self.tasks.drain(..) {
            if !task.is_finished() {
                task.abort();
                aborted += 1;
            }
        }
        aborted
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::time::Duration;

    use super::*;

    #[test]
    fn test_call_on_drop() {
        let called = Arc::new(AtomicBool::new(false));
        let guard = {
            let called = Arc::clone(&called);
            CallOnDrop::new(move || called.store(true, Ordering::SeqCst))
        };
        assert!(!called.load(Ordering::SeqCst));
        drop(guard);
        assert!(called.load(Ordering::SeqCst));
    }

    #[tokio::test]
    async fn test_abort_all() {
        let mut tasks = TaskSet::default();
        tasks.track(tokio::spawn(async {
            tokio::time::sleep(Duration::from_secs(60)).await;
        }));
        tasks.track(tokio::spawn(async {}));
        tokio::task::yield_now().await;

        // only the sleeping task was still running
        assert_eq!(tasks.abort_all(), 1);
        assert_eq!(tasks.abort_all(), 0);
    }
}
