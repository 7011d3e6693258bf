//! Metric Aggregation Pipeline
//!
//! Ingestion turns each event into server-side increments on the metric
//! store; `materialize` folds the counters into result rows.
//!
//! ```text
//! Event ─> incr {sum, count, sum_of_squares}   (numerical / binary / rate)
//!       └> incr categories[value]              (categorical)
//!
//! counters ─> ResultRecord {value, sample_size, variance | categories}
//! ```

use std::collections::BTreeMap;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::debug;
use uuid::Uuid;

use crate::assignment::AssignmentEngine;
use crate::experiment::{Event, Experiment, ExperimentStatus, Metric, ResultRecord};
use crate::metric_store::{
    MetricKey, MetricStore, FIELD_COUNT, FIELD_SUM, FIELD_SUM_OF_SQUARES,
};
use crate::repository::Repository;
use crate::{Error, Result};

/// Acknowledgement returned by the ingestion boundary.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TrackingAck {
    /// Id of the stored event
    pub event_id: Uuid,
    /// Always `"tracked"`
    pub status: String,
    /// Event timestamp
    pub timestamp: DateTime<Utc>,
}

/// Running moments of one (variant, metric).
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct Moments {
    /// Number of observations
    pub count: u64,
    /// Sum of values
    pub sum: f64,
    /// Sum of squared values
    pub sum_of_squares: f64,
}

impl Moments {
    /// Read moments out of a counter hash. Missing fields read as zero.
    #[must_use]
    #[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
    pub fn from_fields(fields: &BTreeMap<String, f64>) -> Self {
        let field = |name: &str| fields.get(name).copied().unwrap_or(0.0);
        Self {
            count: field(FIELD_COUNT).max(0.0).round() as u64,
            sum: field(FIELD_SUM),
            sum_of_squares: field(FIELD_SUM_OF_SQUARES),
        }
    }

    /// `sum / count`, or 0 with no observations.
    #[must_use]
    #[allow(clippy::cast_precision_loss)]
    pub fn mean(&self) -> f64 {
        if self.count == 0 {
            0.0
        } else {
            self.sum / self.count as f64
        }
    }

    /// `sum_of_squares / count - mean²`, clamped at 0.
    #[must_use]
    #[allow(clippy::cast_precision_loss)]
    pub fn variance(&self) -> f64 {
        if self.count == 0 {
            return 0.0;
        }
        let mean = self.mean();
        (self.sum_of_squares / self.count as f64 - mean * mean).max(0.0)
    }
}

/// Category label for a categorical event value.
#[must_use]
pub fn category_label(value: f64) -> String {
    format!("{value}")
}

/// Event ingestion and counter materialization.
#[derive(Debug)]
pub struct MetricPipeline<R, M> {
    repository: Arc<R>,
    store: Arc<M>,
    assignments: AssignmentEngine<R>,
    completion_event: String,
}

impl<R, M> Clone for MetricPipeline<R, M> {
    fn clone(&self) -> Self {
        Self {
            repository: Arc::clone(&self.repository),
            store: Arc::clone(&self.store),
            assignments: self.assignments.clone(),
            completion_event: self.completion_event.clone(),
        }
    }
}

impl<R: Repository, M: MetricStore> MetricPipeline<R, M> {
    /// Create a pipeline. Events named `completion_event` close the user's
    /// assignment.
    pub fn new(repository: Arc<R>, store: Arc<M>, completion_event: impl Into<String>) -> Self {
        Self {
            assignments: AssignmentEngine::new(Arc::clone(&repository)),
            repository,
            store,
            completion_event: completion_event.into(),
        }
    }

    /// Seed the moment counters of every (variant, metric) pair at zero.
    ///
    /// Uses zero increments, so counters that already exist are kept.
    ///
    /// # Errors
    ///
    /// Returns metric store errors unchanged.
    pub async fn initialize_counters(&self, experiment: &Experiment) -> Result<()> {
        for variant in experiment.variants() {
            for metric in experiment.metrics() {
                if !metric.metric_type.is_moment_based() {
                    continue;
                }
                let key = MetricKey::new(experiment.id(), &variant.name, &metric.name);
                self.store
                    .incr_fields(
                        &key.counters(),
                        &[
                            (FIELD_SUM, 0.0),
                            (FIELD_COUNT, 0.0),
                            (FIELD_SUM_OF_SQUARES, 0.0),
                        ],
                    )
                    .await?;
            }
        }
        Ok(())
    }

    /// Append one event to the event log, then fold it into the counters of
    /// every declared metric.
    ///
    /// # Errors
    ///
    /// - `Validation` for a NaN or infinite `event_value`
    /// - `NotFound` for an unknown experiment or undeclared variant
    /// - `NotRunning` unless the experiment is `running` or `paused`
    /// - store errors, unchanged
    pub async fn record_event(&self, event: Event) -> Result<TrackingAck> {
        let experiment_id = event.experiment_id().to_string();
        if !event.event_value().is_finite() {
            return Err(Error::Validation(format!(
                "event_value must be finite, got {}",
                event.event_value()
            )));
        }

        let experiment = self
            .repository
            .get_experiment(&experiment_id)
            .await?
            .ok_or_else(|| Error::NotFound(format!("experiment {experiment_id}")))?;

        if !matches!(
            experiment.status(),
            ExperimentStatus::Running | ExperimentStatus::Paused
        ) {
            return Err(Error::NotRunning {
                experiment_id,
                status: experiment.status(),
            });
        }
        if experiment.variant(event.variant_name()).is_none() {
            return Err(Error::NotFound(format!(
                "variant {} in experiment {experiment_id}",
                event.variant_name()
            )));
        }

        let ack = TrackingAck {
            event_id: event.event_id(),
            status: "tracked".to_string(),
            timestamp: event.timestamp(),
        };
        let user_id = event.user_id().to_string();
        let variant_name = event.variant_name().to_string();
        let value = event.event_value();
        let completes = event.event_name() == self.completion_event;

        // The log is the source of truth; counters never run ahead of it.
        self.repository.append_event(event).await?;

        for metric in experiment.metrics() {
            self.apply(&experiment_id, &variant_name, metric, value)
                .await?;
        }

        if completes {
            self.assignments
                .mark_completed(&experiment_id, &user_id)
                .await?;
        }
        Ok(ack)
    }

    async fn apply(
        &self,
        experiment_id: &str,
        variant_name: &str,
        metric: &Metric,
        value: f64,
    ) -> Result<()> {
        let key = MetricKey::new(experiment_id, variant_name, &metric.name);
        if metric.metric_type.is_moment_based() {
            self.store
                .incr_fields(
                    &key.counters(),
                    &[
                        (FIELD_SUM, value),
                        (FIELD_COUNT, 1.0),
                        (FIELD_SUM_OF_SQUARES, value * value),
                    ],
                )
                .await
        } else {
            self.store
                .incr_field(&key.categories(), &category_label(value), 1.0)
                .await
                .map(|_| ())
        }
    }

    /// Append one result row per (variant, metric) computed from the current
    /// counters. All rows of one pass share a `calculated_at` and are written
    /// in a single batch, so a failed pass leaves no partial snapshot.
    ///
    /// # Errors
    ///
    /// Returns store errors unchanged.
    pub async fn materialize(&self, experiment: &Experiment) -> Result<Vec<ResultRecord>> {
        let calculated_at = Utc::now();
        let mut rows = Vec::with_capacity(experiment.variants().len() * experiment.metrics().len());

        for variant in experiment.variants() {
            for metric in experiment.metrics() {
                let key = MetricKey::new(experiment.id(), &variant.name, &metric.name);
                let row = if metric.metric_type.is_moment_based() {
                    let moments = Moments::from_fields(&self.store.get_all(&key.counters()).await?);
                    ResultRecord::builder(
                        experiment.id(),
                        &variant.name,
                        &metric.name,
                        moments.mean(),
                        moments.count,
                    )
                    .variance(moments.variance())
                    .calculated_at(calculated_at)
                    .build()
                } else {
                    let categories =
                        category_counts(&self.store.get_all(&key.categories()).await?);
                    let (_, top) = most_frequent(&categories).unwrap_or(("", 0));
                    #[allow(clippy::cast_precision_loss)]
                    let value = top as f64;
                    ResultRecord::builder(
                        experiment.id(),
                        &variant.name,
                        &metric.name,
                        value,
                        categories.values().sum(),
                    )
                    .categories(categories)
                    .calculated_at(calculated_at)
                    .build()
                };
                rows.push(row);
            }
        }

        self.repository
            .append_results(experiment.id(), rows.clone())
            .await?;

        debug!(
            experiment_id = experiment.id(),
            rows = rows.len(),
            "Materialized counters"
        );
        Ok(rows)
    }
}

#[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
fn category_counts(fields: &BTreeMap<String, f64>) -> BTreeMap<String, u64> {
    fields
        .iter()
        .map(|(label, count)| (label.clone(), count.max(0.0).round() as u64))
        .collect()
}

/// Largest category; ties go to the lexicographically smallest label.
fn most_frequent(categories: &BTreeMap<String, u64>) -> Option<(&str, u64)> {
    categories
        .iter()
        .fold(None, |best: Option<(&str, u64)>, (label, &count)| match best {
            Some((_, top)) if top >= count => best,
            _ => Some((label.as_str(), count)),
        })
}
