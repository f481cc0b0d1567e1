//! The persistent key value tables strata writes through to.

use std::fmt;
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context;
use futures::FutureExt;
use futures::future::BoxFuture;
use serde::{Deserialize, Serialize};

use crate::error::CacheEntry;

mod fs;
mod memory;

pub use fs::FsTable;
pub use memory::MemoryTable;

/// A single row of a [`BackingTable`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Record {
    /// The [`persist_key`](crate::StoreKey::persist_key) of the stored value.
    pub key: String,
    /// The serialized value.
    pub value: serde_json::Value,
}

/// The result of looking up one key: present, absent or failed.
pub type Lookup = CacheEntry<Option<serde_json::Value>>;

/// A persistent key value table.
///
/// Strata only ever talks to a table through a [`DeferredTable`](crate::DeferredTable), which
/// groups many small reads and writes into calls of [`read_many`](Self::read_many) and
/// [`bulk_put`](Self::bulk_put).
pub trait BackingTable: fmt::Debug + Send + Sync + 'static {
    /// The table name used in logs and metrics.
    fn name(&self) -> &str;

    /// Looks up a single key.
    ///
    /// A missing key resolves to `Ok(None)`, errors are reserved for failed lookups.
    fn get(&self, key: String) -> BoxFuture<'_, Lookup>;

    /// Looks up a batch of keys, returning one result per key in the same order.
    ///
    /// Implementations should run this as a single read transaction. The default looks keys up
    /// one after the other.
    fn read_many(&self, keys: Vec<String>) -> BoxFuture<'_, Vec<Lookup>> {
        async move {
            let mut results = Vec::with_capacity(keys.len());
            for key in keys {
                results.push(self.get(key).await);
            }
            results
        }
        .boxed()
    }

    /// Writes all `records` at once, later records win over earlier ones for the same key.
    fn bulk_put(&self, records: Vec<Record>) -> BoxFuture<'_, CacheEntry<()>>;
}

/// Configuration of the [`BackingTable`] a store persists to.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TableConfig {
    /// A process local table, nothing survives a restart.
    #[default]
    Memory,
    /// One file per key in the given directory.
    Filesystem { path: PathBuf },
}

/// Opens the table described by `config`.
pub fn open_table(config: &TableConfig) -> anyhow::Result<Arc<dyn BackingTable>> {
    Ok(match config {
        TableConfig::Memory => Arc::new(MemoryTable::new()),
        TableConfig::Filesystem { path } => Arc::new(
            FsTable::open(path)
                .with_context(|| format!("failed to open table at {}", path.display()))?,
        ),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_config() {
        let config: TableConfig = serde_yaml::from_str("memory").unwrap();
        assert_eq!(config, TableConfig::Memory);

        let config: TableConfig = serde_yaml::from_str("filesystem: { path: /tmp/strata }").unwrap();
        assert_eq!(
            config,
            TableConfig::Filesystem {
                path: "/tmp/strata".into()
            }
        );
    }

    #[tokio::test]
    async fn test_open_filesystem() {
        strata_test::setup();
        let dir = strata_test::tempdir();
        let path = dir.path().join("nested").join("table");

        let table = open_table(&TableConfig::Filesystem { path: path.clone() }).unwrap();
        assert!(path.is_dir());
        assert_eq!(table.get("missing".into()).await, Ok(None));
    }
}
