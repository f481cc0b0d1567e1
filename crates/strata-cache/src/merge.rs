//! How updates are combined with the values already in a store.

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

use crate::error::CacheEntry;

/// How [`Store::update`](crate::Store::update) combines a patch with the current value.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MergePolicy {
    /// The top-level fields of the patch replace the fields of the current value, all other
    /// fields are kept.
    #[default]
    Merge,
    /// The patch replaces the current value as a whole.
    Overwrite,
}

impl MergePolicy {
    /// Applies `patch` on top of `current` and returns the resulting value.
    ///
    /// Merging is shallow and only applies when both sides serialize to JSON objects, otherwise
    /// the patch wins.
    pub fn apply<T>(self, current: Option<&T>, patch: serde_json::Value) -> CacheEntry<T>
    where
        T: Serialize + DeserializeOwned,
    {
        let merged = match (self, current) {
            (MergePolicy::Merge, Some(current)) => {
                let mut merged = serde_json::to_value(current)?;
                match patch {
                    serde_json::Value::Object(patch) if merged.is_object() => {
                        if let Some(fields) = merged.as_object_mut() {
                            fields.extend(patch);
                        }
                        merged
                    }
                    patch => patch,
                }
            }
            _ => patch,
        };
        Ok(serde_json::from_value(merged)?)
    }
}
