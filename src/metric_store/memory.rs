//! In-memory metric store using `DashMap`.
//!
//! This is the default backend - counters are lost on process restart.

use std::collections::BTreeMap;

use dashmap::DashMap;
use rustc_hash::FxHashMap;

use super::MetricStore;
use crate::Result;

/// In-memory counter store using a sharded concurrent hashmap.
///
/// Each increment holds the shard guard for the key while it updates the
/// field, which makes per-key updates atomic with respect to each other.
#[derive(Debug)]
pub struct MemoryMetricStore {
    store: DashMap<String, FxHashMap<String, f64>>,
}

impl MemoryMetricStore {
    /// Create a new in-memory metric store.
    #[must_use]
    pub fn new() -> Self {
        Self {
            store: DashMap::new(),
        }
    }

    /// Number of hashes held.
    #[must_use]
    pub fn len(&self) -> usize {
        self.store.len()
    }

    /// Check if the store is empty.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.store.is_empty()
    }

    /// Clear all entries.
    pub fn clear(&self) {
        self.store.clear();
    }
}

impl Default for MemoryMetricStore {
    fn default() -> Self {
        Self::new()
    }
}

impl MetricStore for MemoryMetricStore {
    async fn incr_field(&self, key: &str, field: &str, delta: f64) -> Result<f64> {
        let mut hash = self.store.entry(key.to_string()).or_default();
        let value = hash.entry(field.to_string()).or_insert(0.0);
        *value += delta;
        Ok(*value)
    }

    async fn incr_fields(&self, key: &str, deltas: &[(&str, f64)]) -> Result<()> {
        let mut hash = self.store.entry(key.to_string()).or_default();
        for (field, delta) in deltas {
            *hash.entry((*field).to_string()).or_insert(0.0) += delta;
        }
        Ok(())
    }

    async fn get_all(&self, key: &str) -> Result<BTreeMap<String, f64>> {
        Ok(self
            .store
            .get(key)
            .map(|hash| hash.iter().map(|(k, v)| (k.clone(), *v)).collect())
            .unwrap_or_default())
    }

    async fn delete_prefix(&self, prefix: &str) -> Result<usize> {
        let keys: Vec<String> = self
            .store
            .iter()
            .filter(|entry| entry.key().starts_with(prefix))
            .map(|entry| entry.key().clone())
            .collect();

        Ok(keys
            .iter()
            .filter(|key| self.store.remove(key.as_str()).is_some())
            .count())
    }
}
