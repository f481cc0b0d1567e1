//! Deferred, batched access to a [`BackingTable`].
//!
//! A [`DeferredTable`] queues up individual reads and writes and flushes them to its table in
//! batches from background tasks:
//!
//! - Writes are drained in idle slices. Each slice first yields to the runtime and then commits
//!   batches of at most `write_batch_size` items until the queue is empty or the slice ran for
//!   longer than `idle_budget`, after which the drain yields again.
//! - Reads are drained on a timer, every `tick_interval` up to `read_batch_size` of them are
//!   looked up in one [`read_many`](BackingTable::read_many) call.
//!
//! Queued writes stay visible to reads until their batch has been committed, so a read always
//! observes the latest write to its key.

use std::collections::VecDeque;
use std::fmt;
use std::future::Future;
use std::num::NonZeroUsize;
use std::pin::Pin;
use std::sync::{Arc, Mutex};
use std::task::{Context, Poll};
use std::time::{Duration, Instant};

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use tokio::sync::{oneshot, watch};

use crate::error::{CacheEntry, CacheError};
use crate::key::StoreKey;
use crate::table::{BackingTable, Lookup, Record};

/// Tuning of the batching of a [`DeferredTable`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct DeferredConfig {
    /// The maximum number of records per [`bulk_put`](BackingTable::bulk_put).
    pub write_batch_size: NonZeroUsize,
    /// The maximum number of keys per [`read_many`](BackingTable::read_many).
    pub read_batch_size: NonZeroUsize,
    /// How long a write drain may commit batches before it yields to other tasks.
    #[serde(with = "humantime_serde")]
    pub idle_budget: Duration,
    /// The delay between two read batches.
    #[serde(with = "humantime_serde")]
    pub tick_interval: Duration,
}

const DEFAULT_WRITE_BATCH_SIZE: NonZeroUsize = NonZeroUsize::new(128).unwrap();
const DEFAULT_READ_BATCH_SIZE: NonZeroUsize = NonZeroUsize::new(32).unwrap();

impl Default for DeferredConfig {
    fn default() -> Self {
        Self {
            write_batch_size: DEFAULT_WRITE_BATCH_SIZE,
            read_batch_size: DEFAULT_READ_BATCH_SIZE,
            idle_budget: Duration::from_millis(10),
            tick_interval: Duration::from_millis(16),
        }
    }
}

/// Resolves once a deferred operation has settled.
///
/// Dropping a completion does not cancel the operation.
#[must_use = "completions report the outcome of the operation"]
pub struct Completion<T> {
    rx: oneshot::Receiver<CacheEntry<T>>,
}

impl<T> fmt::Debug for Completion<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Completion").finish_non_exhaustive()
    }
}

impl<T> Future for Completion<T> {
    type Output = CacheEntry<T>;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        // the sender is only dropped without resolving when the runtime shuts down
        Pin::new(&mut self.rx)
            .poll(cx)
            .map(|result| result.unwrap_or(Err(CacheError::InternalError)))
    }
}

fn completion<T>() -> (oneshot::Sender<CacheEntry<T>>, Completion<T>) {
    let (tx, rx) = oneshot::channel();
    (tx, Completion { rx })
}

struct PutItem<K, T> {
    key: K,
    item: T,
    seq: u64,
    done: oneshot::Sender<CacheEntry<()>>,
}

struct GetItem<K, T> {
    key: K,
    done: oneshot::Sender<CacheEntry<Option<T>>>,
}

struct Queues<K, T> {
    writes: VecDeque<PutItem<K, T>>,
    reads: VecDeque<GetItem<K, T>>,
    /// The sequence number of the most recently enqueued write.
    last_seq: u64,
    write_scheduled: bool,
    read_scheduled: bool,
    /// The first batch error since the last [`DeferredTable::flush`].
    error: Option<CacheError>,
}

struct Inner<K, T> {
    table: Arc<dyn BackingTable>,
    config: DeferredConfig,
    queues: Mutex<Queues<K, T>>,
    /// The sequence number up to which all writes have settled.
    settled: watch::Sender<u64>,
}

/// Wraps a [`BackingTable`] with queues for batched reads and writes.
///
/// Values are stored as JSON. Fields marked with `#[serde(skip)]` are transient and do not make
/// it into the table.
pub struct DeferredTable<K, T> {
    inner: Arc<Inner<K, T>>,
}

impl<K, T> Clone for DeferredTable<K, T> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<K, T> fmt::Debug for DeferredTable<K, T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut debug = f.debug_struct("DeferredTable");
        debug
            .field("table", &self.inner.table.name())
            .field("config", &self.inner.config);
        if let Ok(queues) = self.inner.queues.try_lock() {
            debug
                .field("pending_writes", &queues.writes.len())
                .field("pending_reads", &queues.reads.len());
        }
        debug.finish()
    }
}

impl<K, T> DeferredTable<K, T>
where
    K: StoreKey,
    T: Serialize + DeserializeOwned + Clone + Send + Sync + 'static,
{
    pub fn new(table: Arc<dyn BackingTable>, config: DeferredConfig) -> Self {
        let (settled, _) = watch::channel(0);
        Self {
            inner: Arc::new(Inner {
                table,
                config,
                queues: Mutex::new(Queues {
                    writes: VecDeque::new(),
                    reads: VecDeque::new(),
                    last_seq: 0,
                    write_scheduled: false,
                    read_scheduled: false,
                    error: None,
                }),
                settled,
            }),
        }
    }

    /// The wrapped table.
    pub fn table(&self) -> &Arc<dyn BackingTable> {
        &self.inner.table
    }

    /// Queues `item` to be written under `key`.
    ///
    /// The returned completion resolves once the batch containing the item was committed, or
    /// with the error that made the batch, or the item itself, fail. Failed writes are not
    /// retried.
    pub fn deferred_put(&self, item: T, key: K) -> Completion<()> {
        let (done, completion) = completion();

        let mut queues = self.inner.queues.lock().unwrap();
        queues.last_seq += 1;
        let seq = queues.last_seq;
        queues.writes.push_back(PutItem {
            key,
            item,
            seq,
            done,
        });
        metric!(gauge("deferred.write.queue") = queues.writes.len() as u64, "table" => self.inner.table.name());

        if !queues.write_scheduled {
            queues.write_scheduled = true;
            tracing::trace!(table = self.inner.table.name(), "scheduling write drain");
            tokio::spawn(Arc::clone(&self.inner).drain_writes());
        }

        completion
    }

    /// Queues a lookup of `key`.
    ///
    /// The returned completion resolves with `Some` value if the key is present in the table or
    /// has a queued write, and with `None` if it is absent.
    pub fn deferred_get(&self, key: K) -> Completion<Option<T>> {
        let (done, completion) = completion();

        let mut queues = self.inner.queues.lock().unwrap();
        queues.reads.push_back(GetItem { key, done });
        metric!(gauge("deferred.read.queue") = queues.reads.len() as u64, "table" => self.inner.table.name());

        if !queues.read_scheduled {
            queues.read_scheduled = true;
            tokio::spawn(Arc::clone(&self.inner).drain_reads());
        }

        completion
    }

    /// Waits until all writes queued before this call have settled.
    ///
    /// Returns the first batch error that happened since the previous flush.
    pub async fn flush(&self) -> CacheEntry<()> {
        let target = self.inner.queues.lock().unwrap().last_seq;
        let mut settled = self.inner.settled.subscribe();
        settled
            .wait_for(|seq| *seq >= target)
            .await
            .map_err(CacheError::from_std_error)?;

        match self.inner.queues.lock().unwrap().error.take() {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }

    /// The number of writes that have not been committed yet.
    pub fn pending_writes(&self) -> usize {
        self.inner.queues.lock().unwrap().writes.len()
    }

    /// The number of lookups that have not been started yet.
    pub fn pending_reads(&self) -> usize {
        self.inner.queues.lock().unwrap().reads.len()
    }
}

/// A write that was taken out of the queue for a batch.
struct Staged {
    seq: u64,
    record: Result<Record, CacheError>,
}

impl<K, T> Inner<K, T>
where
    K: StoreKey,
    T: Serialize + DeserializeOwned + Clone + Send + Sync + 'static,
{
    async fn drain_writes(self: Arc<Self>) {
        loop {
            tokio::task::yield_now().await;
            let slice_start = Instant::now();

            loop {
                if self.commit_write_batch().await {
                    return;
                }
                if slice_start.elapsed() >= self.config.idle_budget {
                    tracing::trace!(table = self.table.name(), "idle budget exhausted");
                    break;
                }
            }
        }
    }

    /// Commits the oldest batch of writes, returns `true` once the queue ran empty.
    async fn commit_write_batch(&self) -> bool {
        let staged: Vec<_> = {
            let queues = self.queues.lock().unwrap();
            queues
                .writes
                .iter()
                .take(self.config.write_batch_size.get())
                .map(|put| (put.seq, put.key.persist_key(), put.item.clone()))
                .collect()
        };
        let staged: Vec<_> = staged
            .into_iter()
            .map(|(seq, key, item)| Staged {
                seq,
                record: serde_json::to_value(item)
                    .map(|value| Record { key, value })
                    .map_err(CacheError::from),
            })
            .collect();

        let records: Vec<_> = staged
            .iter()
            .filter_map(|staged| staged.record.as_ref().ok().cloned())
            .collect();
        let table = self.table.name();
        let result = if records.is_empty() {
            Ok(())
        } else {
            metric!(counter("deferred.write.batch") += 1, "table" => table);
            metric!(counter("deferred.write.items") += records.len() as i64, "table" => table);
            metric!(time_raw("deferred.write.batch_size") = records.len() as u64, "table" => table);
            let start = Instant::now();
            let result = self.table.bulk_put(records).await;
            metric!(timer("deferred.write.duration") = start.elapsed(), "table" => table);
            result
        };

        if let Err(err) = &result {
            tracing::error!(table, items = staged.len(), error = %err, "batch write failed");
            metric!(
                counter("deferred.write.error") += 1,
                "table" => table,
                "kind" => err.kind(),
            );
        }

        let (done, empty) = {
            let mut queues = self.queues.lock().unwrap();
            let done: Vec<_> = queues.writes.drain(..staged.len()).collect();
            if let Err(err) = &result {
                queues.error.get_or_insert_with(|| err.clone());
            }
            let empty = queues.writes.is_empty();
            if empty {
                queues.write_scheduled = false;
            }
            metric!(gauge("deferred.write.queue") = queues.writes.len() as u64, "table" => table);
            (done, empty)
        };

        let mut last_seq = None;
        for (put, staged) in done.into_iter().zip(staged) {
            debug_assert_eq!(put.seq, staged.seq);
            let outcome = match staged.record {
                Ok(_) => result.clone(),
                Err(err) => Err(err),
            };
            put.done.send(outcome).ok();
            last_seq = Some(put.seq);
        }
        if let Some(seq) = last_seq {
            self.settled.send_replace(seq);
        }

        empty
    }

    async fn drain_reads(self: Arc<Self>) {
        loop {
            tokio::time::sleep(self.config.tick_interval).await;
            if self.read_batch().await {
                return;
            }
        }
    }

    /// Serves the oldest batch of lookups, returns `true` once the queue ran empty.
    async fn read_batch(&self) -> bool {
        let table = self.table.name();
        let mut lookups = Vec::new();
        {
            let mut queues = self.queues.lock().unwrap();
            let n = queues.reads.len().min(self.config.read_batch_size.get());
            let batch: Vec<_> = queues.reads.drain(..n).collect();
            for get in batch {
                // the newest queued write for the key is what a lookup has to observe
                let pending = queues
                    .writes
                    .iter()
                    .rev()
                    .find(|put| put.key == get.key)
                    .map(|put| put.item.clone());
                match pending {
                    Some(item) => {
                        metric!(counter("deferred.read.pending_hit") += 1, "table" => table);
                        get.done.send(Ok(Some(item))).ok();
                    }
                    None => lookups.push(get),
                }
            }
        }

        if !lookups.is_empty() {
            metric!(counter("deferred.read.batch") += 1, "table" => table);
            metric!(time_raw("deferred.read.batch_size") = lookups.len() as u64, "table" => table);
            let keys = lookups.iter().map(|get| get.key.persist_key()).collect();
            let mut results = self.table.read_many(keys).await.into_iter();
            for get in lookups {
                let result = results.next().unwrap_or(Err(CacheError::InternalError));
                get.done.send(decode(result)).ok();
            }
        }

        let mut queues = self.queues.lock().unwrap();
        let empty = queues.reads.is_empty();
        if empty {
            queues.read_scheduled = false;
        }
        empty
    }
}

fn decode<T: DeserializeOwned>(lookup: Lookup) -> CacheEntry<Option<T>> {
    match lookup? {
        Some(value) => Ok(Some(serde_json::from_value(value)?)),
        None => Ok(None),
    }
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeMap;

    use serde::{Deserialize, Serialize};

    use super::*;
    use crate::test::TestTable;

    #[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
    struct Message {
        text: String,
        #[serde(skip)]
        sending: bool,
    }

    fn message(text: &str) -> Message {
        Message {
            text: text.into(),
            sending: true,
        }
    }

    fn deferred<T>(table: &Arc<TestTable>) -> DeferredTable<String, T>
    where
        T: Serialize + DeserializeOwned + Clone + Send + Sync + 'static,
    {
        DeferredTable::new(table.clone(), DeferredConfig::default())
    }

    #[tokio::test]
    async fn test_writes_are_batched() {
        strata_test::setup();
        let table = TestTable::new();
        let deferred = deferred(&table);

        let completions: Vec<_> = (0..200)
            .map(|i| deferred.deferred_put(message("hi"), format!("general/{i}")))
            .collect();
        assert_eq!(deferred.pending_writes(), 200);

        for completion in completions {
            completion.await.unwrap();
        }
        assert_eq!(table.batches(), vec![128, 72]);
        assert_eq!(deferred.pending_writes(), 0);
        assert_eq!(table.put_keys()[199], "general/199");
    }

    #[tokio::test]
    async fn test_committed_roundtrip_strips_transient_fields() {
        let table = TestTable::new();
        let deferred = deferred(&table);

        deferred
            .deferred_put(message("hello"), "a".into())
            .await
            .unwrap();
        let read = deferred.deferred_get("a".into()).await.unwrap();

        assert_eq!(
            read,
            Some(Message {
                text: "hello".into(),
                sending: false
            })
        );
        assert_eq!(table.read_batches(), vec![1]);
    }

    #[tokio::test]
    async fn test_read_your_own_writes() {
        let (table, gate) = TestTable::gated();
        let deferred = deferred(&table);

        let first = deferred.deferred_put(message("first"), "a".into());
        let second = deferred.deferred_put(message("second"), "a".into());

        // the write is stuck in the table, but the read is served from the queue
        let read = deferred.deferred_get("a".into()).await.unwrap();
        assert_eq!(read, Some(message("second")));
        assert_eq!(deferred.pending_writes(), 2);
        assert!(table.read_batches().is_empty());

        gate.add_permits(1);
        first.await.unwrap();
        second.await.unwrap();
        // duplicates within a batch are written as they are
        assert_eq!(table.put_keys(), vec!["a", "a"]);
    }

    #[tokio::test]
    async fn test_absent_is_not_an_error() {
        let table = TestTable::new();
        let deferred: DeferredTable<String, Message> = deferred(&table);
        assert_eq!(deferred.deferred_get("nope".into()).await, Ok(None));
    }

    #[tokio::test]
    async fn test_reads_are_batched() {
        let table = TestTable::new();
        let deferred: DeferredTable<String, Message> = deferred(&table);

        let completions: Vec<_> = (0..40)
            .map(|i| deferred.deferred_get(format!("k{i}")))
            .collect();
        for completion in completions {
            assert_eq!(completion.await, Ok(None));
        }
        assert_eq!(table.read_batches(), vec![32, 8]);
    }

    #[tokio::test]
    async fn test_failed_batch_rejects_all() {
        strata_test::setup();
        let table = TestTable::new();
        table.fail_writes(true);
        let deferred = deferred(&table);

        let completions: Vec<_> = ["a", "b", "c"]
            .into_iter()
            .map(|key| deferred.deferred_put(message(key), key.into()))
            .collect();
        for completion in completions {
            assert!(matches!(completion.await, Err(CacheError::BatchWrite(_))));
        }

        assert!(matches!(deferred.flush().await, Err(CacheError::BatchWrite(_))));
        // the error is only reported once
        assert_eq!(deferred.flush().await, Ok(()));
    }

    #[tokio::test]
    async fn test_malformed_item_is_rejected_alone() {
        strata_test::setup();
        let table = TestTable::new();
        let deferred: DeferredTable<String, BTreeMap<Vec<u8>, u32>> = deferred(&table);

        let bad = deferred.deferred_put(BTreeMap::from([(vec![1], 1)]), "bad".into());
        let good = deferred.deferred_put(BTreeMap::new(), "good".into());

        assert!(matches!(bad.await, Err(CacheError::Malformed(_))));
        assert_eq!(good.await, Ok(()));
        assert_eq!(table.put_keys(), vec!["good"]);
        assert_eq!(deferred.flush().await, Ok(()));
    }

    #[tokio::test]
    async fn test_flush_waits_for_writes() {
        let (table, gate) = TestTable::gated();
        let deferred = deferred(&table);
        let _completion = deferred.deferred_put(message("x"), "x".into());

        let flush = tokio::spawn({
            let deferred = deferred.clone();
            async move { deferred.flush().await }
        });
        tokio::time::sleep(Duration::from_millis(30)).await;
        assert!(!flush.is_finished());

        gate.add_permits(1);
        assert_eq!(flush.await.unwrap(), Ok(()));
        assert_eq!(deferred.pending_writes(), 0);
    }
}
