//! Metric Store - live per-variant counters
//!
//! A hash-of-numbers key-value store with server-side atomic increments,
//! shaped after Redis `HINCRBYFLOAT`/`HGETALL`:
//!
//! ```text
//! experiment:{id}:metrics:{variant}:{metric}             -> {sum, count, sum_of_squares}
//! experiment:{id}:metrics:{variant}:{metric}:categories  -> {category -> count}
//! ```
//!
//! Callers never fetch-then-add; every update is a single increment applied
//! by the store, so concurrent ingestion cannot lose writes.
//!
//! # Example
//!
//! ```rust
//! use trueno_ab::metric_store::{MemoryMetricStore, MetricKey, MetricStore};
//!
//! # async fn example() -> trueno_ab::Result<()> {
//! let store = MemoryMetricStore::new();
//! let key = MetricKey::new("exp-1", "control", "revenue");
//!
//! store.incr_field(&key.counters(), "sum", 4.5).await?;
//! store.incr_field(&key.counters(), "count", 1.0).await?;
//!
//! let fields = store.get_all(&key.counters()).await?;
//! assert_eq!(fields.get("sum"), Some(&4.5));
//! # Ok(())
//! # }
//! ```

mod memory;

pub use memory::MemoryMetricStore;

use std::collections::BTreeMap;
use std::future::Future;

use crate::Result;

/// Counter field holding the running sum.
pub const FIELD_SUM: &str = "sum";
/// Counter field holding the observation count.
pub const FIELD_COUNT: &str = "count";
/// Counter field holding the running sum of squared values.
pub const FIELD_SUM_OF_SQUARES: &str = "sum_of_squares";

/// Address of the counters for one (experiment, variant, metric).
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct MetricKey {
    experiment_id: String,
    variant_name: String,
    metric_name: String,
}

impl MetricKey {
    /// Create a key.
    #[must_use]
    pub fn new(
        experiment_id: impl Into<String>,
        variant_name: impl Into<String>,
        metric_name: impl Into<String>,
    ) -> Self {
        Self {
            experiment_id: experiment_id.into(),
            variant_name: variant_name.into(),
            metric_name: metric_name.into(),
        }
    }

    /// Hash holding sum / count / `sum_of_squares`.
    #[must_use]
    pub fn counters(&self) -> String {
        format!(
            "{}metrics:{}:{}",
            experiment_prefix(&self.experiment_id),
            self.variant_name,
            self.metric_name
        )
    }

    /// Hash holding per-category counts.
    #[must_use]
    pub fn categories(&self) -> String {
        format!("{}:categories", self.counters())
    }
}

/// Prefix shared by every key of one experiment.
#[must_use]
pub fn experiment_prefix(experiment_id: &str) -> String {
    format!("experiment:{experiment_id}:")
}

/// Counter store contract consumed by the aggregation pipeline.
pub trait MetricStore: Send + Sync {
    /// Atomically add `delta` to one hash field, creating it at zero.
    ///
    /// Returns the new value.
    fn incr_field(
        &self,
        key: &str,
        field: &str,
        delta: f64,
    ) -> impl Future<Output = Result<f64>> + Send;

    /// Add several deltas to one hash.
    ///
    /// The default applies them one field at a time; backends that can
    /// apply them under a single lock should override this.
    fn incr_fields(
        &self,
        key: &str,
        deltas: &[(&str, f64)],
    ) -> impl Future<Output = Result<()>> + Send {
        async move {
            for (field, delta) in deltas {
                self.incr_field(key, field, *delta).await?;
            }
            Ok(())
        }
    }

    /// Read every field of a hash. Missing keys read as empty.
    fn get_all(&self, key: &str) -> impl Future<Output = Result<BTreeMap<String, f64>>> + Send;

    /// Remove every key starting with `prefix`. Returns the number removed.
    fn delete_prefix(&self, prefix: &str) -> impl Future<Output = Result<usize>> + Send;

    /// Liveness probe.
    fn ping(&self) -> impl Future<Output = Result<()>> + Send {
        async { Ok(()) }
    }
}
