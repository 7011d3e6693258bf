//! Experiment Record - root entity of the A/B schema

use std::collections::HashSet;
use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::variant::{ConfigMap, Metric, Variant};
use crate::{Error, Result};

/// Lifecycle status of an experiment.
///
/// ```text
/// draft ──> running ──> paused ──> running
///              │           │
///              ├──> completed <──┘
///              └──> cancelled
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ExperimentStatus {
    /// Created, not yet started.
    Draft,
    /// Serving assignments; scheduler active.
    Running,
    /// Scheduler stopped, counters retained.
    Paused,
    /// Finished (explicitly or at `end_date`).
    Completed,
    /// Abandoned.
    Cancelled,
}

impl ExperimentStatus {
    /// Whether `self -> next` is a legal lifecycle transition.
    #[must_use]
    pub const fn can_transition_to(self, next: Self) -> bool {
        matches!(
            (self, next),
            (Self::Draft | Self::Paused, Self::Running)
                | (Self::Running, Self::Paused | Self::Cancelled)
                | (Self::Running | Self::Paused, Self::Completed)
        )
    }

    /// No outgoing transitions except deletion.
    #[must_use]
    pub const fn is_terminal(self) -> bool {
        matches!(self, Self::Completed | Self::Cancelled)
    }

    /// Wire name.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Draft => "draft",
            Self::Running => "running",
            Self::Paused => "paused",
            Self::Completed => "completed",
            Self::Cancelled => "cancelled",
        }
    }
}

impl fmt::Display for ExperimentStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Definition submitted to create an experiment.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ExperimentSpec {
    /// Human-readable name
    pub name: String,
    /// Description
    #[serde(default)]
    pub description: String,
    /// Arms in declared order; the first is the control
    pub variants: Vec<Variant>,
    /// Tracked metrics
    pub metrics: Vec<Metric>,
    /// Planned start
    #[serde(default = "Utc::now")]
    pub start_date: DateTime<Utc>,
    /// Automatic completion time
    #[serde(default)]
    pub end_date: Option<DateTime<Utc>>,
    /// Author
    #[serde(default = "default_created_by")]
    pub created_by: String,
    /// Free-form configuration
    #[serde(default)]
    pub config: ConfigMap,
}

fn default_created_by() -> String {
    "system".to_string()
}

impl ExperimentSpec {
    /// Create a builder for an experiment definition.
    #[must_use]
    pub fn builder(name: impl Into<String>) -> ExperimentSpecBuilder {
        ExperimentSpecBuilder::new(name)
    }

    /// Check the structural invariants of the definition.
    ///
    /// # Errors
    ///
    /// Returns `Validation` if there are fewer than 2 variants, no metrics,
    /// duplicate names, out-of-range weights, weights not summing to 1.0
    /// within `weight_tolerance`, or an `end_date` before `start_date`.
    pub fn validate(&self, weight_tolerance: f64) -> Result<()> {
        if self.name.trim().is_empty() {
            return Err(Error::Validation("experiment name must not be empty".into()));
        }
        if self.variants.len() < 2 {
            return Err(Error::Validation(format!(
                "at least 2 variants required, got {}",
                self.variants.len()
            )));
        }
        if self.metrics.is_empty() {
            return Err(Error::Validation("at least 1 metric required".into()));
        }

        let mut names = HashSet::new();
        for variant in &self.variants {
            if !names.insert(variant.name.as_str()) {
                return Err(Error::Validation(format!(
                    "duplicate variant name: {}",
                    variant.name
                )));
            }
            if !(0.0..=1.0).contains(&variant.weight) {
                return Err(Error::Validation(format!(
                    "variant {} weight {} outside [0, 1]",
                    variant.name, variant.weight
                )));
            }
        }

        let total: f64 = self.variants.iter().map(|v| v.weight).sum();
        if (total - 1.0).abs() > weight_tolerance {
            return Err(Error::Validation(format!(
                "variant weights sum to {total:.4}, expected 1.0 ± {weight_tolerance}"
            )));
        }

        let mut names = HashSet::new();
        for metric in &self.metrics {
            if !names.insert(metric.name.as_str()) {
                return Err(Error::Validation(format!(
                    "duplicate metric name: {}",
                    metric.name
                )));
            }
        }

        if let Some(end) = self.end_date {
            if end <= self.start_date {
                return Err(Error::Validation(format!(
                    "end_date {end} is not after start_date {}",
                    self.start_date
                )));
            }
        }

        Ok(())
    }
}

/// Builder for `ExperimentSpec`.
#[derive(Debug)]
pub struct ExperimentSpecBuilder {
    spec: ExperimentSpec,
}

impl ExperimentSpecBuilder {
    /// Create a new builder with the required name.
    #[must_use]
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            spec: ExperimentSpec {
                name: name.into(),
                description: String::new(),
                variants: Vec::new(),
                metrics: Vec::new(),
                start_date: Utc::now(),
                end_date: None,
                created_by: default_created_by(),
                config: ConfigMap::new(),
            },
        }
    }

    /// Set the description.
    #[must_use]
    pub fn description(mut self, description: impl Into<String>) -> Self {
        self.spec.description = description.into();
        self
    }

    /// Append a variant (declaration order is preserved).
    #[must_use]
    pub fn variant(mut self, variant: Variant) -> Self {
        self.spec.variants.push(variant);
        self
    }

    /// Append a metric.
    #[must_use]
    pub fn metric(mut self, metric: Metric) -> Self {
        self.spec.metrics.push(metric);
        self
    }

    /// Set the planned start.
    #[must_use]
    pub const fn start_date(mut self, start_date: DateTime<Utc>) -> Self {
        self.spec.start_date = start_date;
        self
    }

    /// Set the automatic completion time.
    #[must_use]
    pub const fn end_date(mut self, end_date: DateTime<Utc>) -> Self {
        self.spec.end_date = Some(end_date);
        self
    }

    /// Set the author.
    #[must_use]
    pub fn created_by(mut self, created_by: impl Into<String>) -> Self {
        self.spec.created_by = created_by.into();
        self
    }

    /// Add a configuration entry.
    #[must_use]
    pub fn config(mut self, key: impl Into<String>, value: serde_json::Value) -> Self {
        self.spec.config.insert(key.into(), value);
        self
    }

    /// Build the `ExperimentSpec` (validation happens on create).
    #[must_use]
    pub fn build(self) -> ExperimentSpec {
        self.spec
    }
}

/// A persisted experiment.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Experiment {
    id: String,
    name: String,
    description: String,
    status: ExperimentStatus,
    variants: Vec<Variant>,
    metrics: Vec<Metric>,
    start_date: DateTime<Utc>,
    end_date: Option<DateTime<Utc>>,
    created_by: String,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
    config: ConfigMap,
}

impl Experiment {
    /// Materialize a definition as a new `draft` experiment with a fresh id.
    #[must_use]
    pub fn from_spec(spec: ExperimentSpec) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4().to_string(),
            name: spec.name,
            description: spec.description,
            status: ExperimentStatus::Draft,
            variants: spec.variants,
            metrics: spec.metrics,
            start_date: spec.start_date,
            end_date: spec.end_date,
            created_by: spec.created_by,
            created_at: now,
            updated_at: now,
            config: spec.config,
        }
    }

    /// Get the experiment ID.
    #[must_use]
    pub fn id(&self) -> &str {
        &self.id
    }

    /// Get the experiment name.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Get the description.
    #[must_use]
    pub fn description(&self) -> &str {
        &self.description
    }

    /// Get the current status.
    #[must_use]
    pub const fn status(&self) -> ExperimentStatus {
        self.status
    }

    /// Variants in declared order.
    #[must_use]
    pub fn variants(&self) -> &[Variant] {
        &self.variants
    }

    /// Tracked metrics.
    #[must_use]
    pub fn metrics(&self) -> &[Metric] {
        &self.metrics
    }

    /// Metrics flagged `is_primary`.
    pub fn primary_metrics(&self) -> impl Iterator<Item = &Metric> {
        self.metrics.iter().filter(|m| m.is_primary)
    }

    /// Look up a variant by name.
    #[must_use]
    pub fn variant(&self, name: &str) -> Option<&Variant> {
        self.variants.iter().find(|v| v.name == name)
    }

    /// Look up a metric by name.
    #[must_use]
    pub fn metric(&self, name: &str) -> Option<&Metric> {
        self.metrics.iter().find(|m| m.name == name)
    }

    /// The baseline arm: the first declared variant.
    #[must_use]
    pub fn control_variant(&self) -> Option<&Variant> {
        self.variants.first()
    }

    /// Get the planned start.
    #[must_use]
    pub const fn start_date(&self) -> DateTime<Utc> {
        self.start_date
    }

    /// Get the automatic completion time, if any.
    #[must_use]
    pub const fn end_date(&self) -> Option<DateTime<Utc>> {
        self.end_date
    }

    /// Whether `end_date` is set and has been reached at `now`.
    #[must_use]
    pub fn has_ended(&self, now: DateTime<Utc>) -> bool {
        self.end_date.is_some_and(|end| now >= end)
    }

    /// Get the author.
    #[must_use]
    pub fn created_by(&self) -> &str {
        &self.created_by
    }

    /// Get the creation timestamp.
    #[must_use]
    pub const fn created_at(&self) -> DateTime<Utc> {
        self.created_at
    }

    /// Get the last-modified timestamp.
    #[must_use]
    pub const fn updated_at(&self) -> DateTime<Utc> {
        self.updated_at
    }

    /// Get the free-form configuration.
    #[must_use]
    pub const fn config(&self) -> &ConfigMap {
        &self.config
    }

    pub(crate) fn set_status(&mut self, status: ExperimentStatus, at: DateTime<Utc>) {
        self.status = status;
        self.updated_at = at;
    }
}
