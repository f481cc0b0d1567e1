use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use anyhow::{Result, bail};
use futures::FutureExt;
use futures::future::BoxFuture;
use rand::Rng;
use serde::{Deserialize, Serialize};
use serde_json::json;
use strata_cache::{CacheEntry, Origin, Store};

#[derive(Debug, Deserialize)]
pub struct WorkloadsConfig {
    pub workloads: Vec<Workload>,
}

impl WorkloadsConfig {
    pub fn validate(&self) -> Result<()> {
        for workload in &self.workloads {
            if workload.concurrency == 0 {
                bail!("workload `{}` needs a concurrency of at least 1", workload.name);
            }
            if workload.keys == 0 {
                bail!("workload `{}` needs at least one key", workload.name);
            }
            if !(0.0..=1.0).contains(&workload.write_ratio) {
                bail!("workload `{}` has a write_ratio outside of 0..=1", workload.name);
            }
        }
        Ok(())
    }
}

#[derive(Debug, Deserialize)]
pub struct Workload {
    pub name: String,
    pub concurrency: usize,
    /// The number of distinct keys the operations are spread over.
    pub keys: u64,
    /// The share of operations that edit a value instead of reading it.
    #[serde(default)]
    pub write_ratio: f64,
    /// How long the synthetic origin takes to answer.
    #[serde(default, with = "humantime_serde")]
    pub origin_latency: Duration,
}

/// Keys are scoped by workload so that workloads sharing a table do not see each other's values.
pub type MessageKey = (String, u64);

pub type MessageStore = Store<MessageKey, Message>;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Message {
    pub author: String,
    pub text: String,
}

#[derive(Debug, Clone, PartialEq)]
pub enum Operation {
    Read(MessageKey),
    Edit(MessageKey),
}

impl Workload {
    pub fn next_operation(&self, rng: &mut impl Rng) -> Operation {
        let key = (self.name.clone(), rng.random_range(0..self.keys));
        match rng.random_bool(self.write_ratio) {
            true => Operation::Edit(key),
            false => Operation::Read(key),
        }
    }
}

pub async fn process_operation(store: &MessageStore, operation: Operation) -> CacheEntry<()> {
    match operation {
        Operation::Read(key) => {
            store.get(key, ()).await?;
        }
        Operation::Edit(key) => {
            let text = format!("edited message {}", key.1);
            store.update(key, (), json!({ "text": text })).await?;
        }
    }
    Ok(())
}

/// An origin that makes up a message for every key after a fixed delay.
#[derive(Debug)]
pub struct SyntheticOrigin {
    latency: Duration,
    fetches: AtomicUsize,
}

impl SyntheticOrigin {
    pub fn new(latency: Duration) -> Arc<Self> {
        Arc::new(Self {
            latency,
            fetches: AtomicUsize::new(0),
        })
    }

    pub fn fetches(&self) -> usize {
        self.fetches.load(Ordering::Relaxed)
    }
}

impl Origin<MessageKey, Message> for SyntheticOrigin {
    fn fetch(&self, key: &MessageKey, _context: ()) -> BoxFuture<'static, CacheEntry<Message>> {
        self.fetches.fetch_add(1, Ordering::Relaxed);
        let latency = self.latency;
        let id = key.1;

        async move {
            tokio::time::sleep(latency).await;
            Ok(Message {
                author: format!("user-{}", id % 17),
                text: format!("message {id}"),
            })
        }
        .boxed()
    }
}

#[cfg(test)]
mod tests {
    use rand::SeedableRng;
    use rand::rngs::StdRng;
    use strata_cache::StoreConfig;

    use super::*;

    fn workload(write_ratio: f64) -> Workload {
        Workload {
            name: "test".into(),
            concurrency: 1,
            keys: 10,
            write_ratio,
            origin_latency: Duration::ZERO,
        }
    }

    #[test]
    fn test_parse_workloads() {
        let yaml = r#"
            workloads:
              - name: reads
                concurrency: 4
                keys: 100
                origin_latency: 20ms
        "#;
        let config: WorkloadsConfig = serde_yaml::from_str(yaml).unwrap();
        config.validate().unwrap();

        let workload = &config.workloads[0];
        assert_eq!(workload.write_ratio, 0.0);
        assert_eq!(workload.origin_latency, Duration::from_millis(20));
    }

    #[test]
    fn test_invalid_workloads() {
        let mut config = WorkloadsConfig {
            workloads: vec![workload(1.5)],
        };
        assert!(config.validate().is_err());

        config.workloads[0].write_ratio = 0.5;
        config.workloads[0].keys = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_operation_mix() {
        let mut rng = StdRng::seed_from_u64(7);

        let reads = workload(0.0);
        for _ in 0..100 {
            let Operation::Read((name, id)) = reads.next_operation(&mut rng) else {
                panic!("expected only reads");
            };
            assert_eq!(name, "test");
            assert!(id < 10);
        }

        let edits = workload(1.0);
        assert!(matches!(edits.next_operation(&mut rng), Operation::Edit(_)));
    }

    #[tokio::test]
    async fn test_edit_keeps_author() {
        strata_test::setup();

        let origin = SyntheticOrigin::new(Duration::ZERO);
        let store =
            MessageStore::open(&StoreConfig::default(), Some(origin.clone())).unwrap();
        let key = ("test".to_owned(), 18);

        process_operation(&store, Operation::Edit(key.clone()))
            .await
            .unwrap();
        process_operation(&store, Operation::Read(key.clone()))
            .await
            .unwrap();

        let message = store.get(key, ()).await.unwrap().unwrap();
        assert_eq!(message.author, "user-1");
        assert_eq!(message.text, "edited message 18");
        assert_eq!(origin.fetches(), 1);
    }
}
