//! Variants and metrics - the arms and measurements of an experiment

use serde::{Deserialize, Serialize};

/// Free-form configuration attached to experiments and variants.
pub type ConfigMap = serde_json::Map<String, serde_json::Value>;

/// One arm of an experiment receiving a fraction of traffic.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Variant {
    /// Name, unique within the experiment
    pub name: String,
    /// Fraction of traffic (0..=1)
    pub weight: f64,
    /// Human-readable description
    #[serde(default)]
    pub description: String,
    /// Variant-specific configuration
    #[serde(default)]
    pub config: ConfigMap,
}

impl Variant {
    /// Create a variant with the given traffic weight.
    #[must_use]
    pub fn new(name: impl Into<String>, weight: f64) -> Self {
        Self {
            name: name.into(),
            weight,
            description: String::new(),
            config: ConfigMap::new(),
        }
    }

    /// Set the description.
    #[must_use]
    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = description.into();
        self
    }

    /// Add a configuration entry.
    #[must_use]
    pub fn with_config(mut self, key: impl Into<String>, value: serde_json::Value) -> Self {
        self.config.insert(key.into(), value);
        self
    }
}

/// Kind of measurement a metric captures.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MetricType {
    /// Arbitrary numeric value (revenue, latency)
    Numerical,
    /// 0/1 outcome (conversion)
    Binary,
    /// Ratio in 0..=1 (click-through rate)
    Rate,
    /// Discrete label, counted per category
    Categorical,
}

impl MetricType {
    /// Whether counters for this type track sum / count / sum of squares.
    #[must_use]
    pub const fn is_moment_based(self) -> bool {
        !matches!(self, Self::Categorical)
    }
}

/// Aggregation hint for reporting.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Aggregation {
    /// Arithmetic mean (default)
    #[default]
    Mean,
    /// Running total
    Sum,
    /// Number of observations
    Count,
}

/// A measurement tracked per variant.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Metric {
    /// Name, unique within the experiment
    pub name: String,
    /// Measurement kind
    #[serde(rename = "type")]
    pub metric_type: MetricType,
    /// Human-readable description
    #[serde(default)]
    pub description: String,
    /// Aggregation hint
    #[serde(default)]
    pub aggregation: Aggregation,
    /// Drives significance testing and conclusions
    #[serde(default)]
    pub is_primary: bool,
}

impl Metric {
    /// Create a secondary metric with mean aggregation.
    #[must_use]
    pub fn new(name: impl Into<String>, metric_type: MetricType) -> Self {
        Self {
            name: name.into(),
            metric_type,
            description: String::new(),
            aggregation: Aggregation::Mean,
            is_primary: false,
        }
    }

    /// Mark the metric as primary.
    #[must_use]
    pub const fn primary(mut self) -> Self {
        self.is_primary = true;
        self
    }

    /// Set the aggregation hint.
    #[must_use]
    pub const fn with_aggregation(mut self, aggregation: Aggregation) -> Self {
        self.aggregation = aggregation;
        self
    }

    /// Set the description.
    #[must_use]
    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = description.into();
        self
    }
}
