use std::collections::BTreeMap;
use std::sync::Mutex;

use futures::FutureExt;
use futures::future::{self, BoxFuture};

use super::{BackingTable, Lookup, Record};
use crate::error::CacheEntry;

/// A [`BackingTable`] that lives in process memory.
#[derive(Debug, Default)]
pub struct MemoryTable {
    rows: Mutex<BTreeMap<String, serde_json::Value>>,
}

impl MemoryTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.rows.lock().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl BackingTable for MemoryTable {
    fn name(&self) -> &str {
        "memory"
    }

    fn get(&self, key: String) -> BoxFuture<'_, Lookup> {
        let value = self.rows.lock().unwrap().get(&key).cloned();
        future::ready(Ok(value)).boxed()
    }

    fn read_many(&self, keys: Vec<String>) -> BoxFuture<'_, Vec<Lookup>> {
        let rows = self.rows.lock().unwrap();
        let results = keys.iter().map(|key| Ok(rows.get(key).cloned())).collect();
        future::ready(results).boxed()
    }

    fn bulk_put(&self, records: Vec<Record>) -> BoxFuture<'_, CacheEntry<()>> {
        let mut rows = self.rows.lock().unwrap();
        rows.extend(records.into_iter().map(|record| (record.key, record.value)));
        future::ready(Ok(())).boxed()
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    #[tokio::test]
    async fn test_last_write_wins() {
        let table = MemoryTable::new();
        table
            .bulk_put(vec![
                Record {
                    key: "a".into(),
                    value: json!(1),
                },
                Record {
                    key: "a".into(),
                    value: json!(2),
                },
            ])
            .await
            .unwrap();

        assert_eq!(table.len(), 1);
        let results = table.read_many(vec!["a".into(), "b".into()]).await;
        assert_eq!(results, vec![Ok(Some(json!(2))), Ok(None)]);
    }
}
