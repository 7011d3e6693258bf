//! Result Record - point-in-time metric snapshots per variant
//!
//! Results form an append-only log. The "current" result for a
//! (experiment, variant, metric) key is the row with the greatest
//! `calculated_at`.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Two-sided interval around a variant mean.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ConfidenceInterval {
    /// Lower bound
    pub lower: f64,
    /// Upper bound
    pub upper: f64,
}

/// Hypothesis test that produced a p-value.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(tag = "test", rename_all = "snake_case")]
pub enum SignificanceTest {
    /// Two variants: Welch's unequal-variance t-test
    WelchT {
        /// Welch–Satterthwaite degrees of freedom
        degrees_of_freedom: f64,
    },
    /// Three or more variants: one-way ANOVA
    Anova {
        /// k - 1
        df_between: f64,
        /// N - k
        df_within: f64,
    },
}

/// Outcome of the significance test for a primary metric.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Significance {
    /// Test used
    #[serde(flatten)]
    pub test: SignificanceTest,
    /// t or F statistic
    pub statistic: f64,
    /// Two-tailed (t) or upper-tail (F) p-value
    pub p_value: f64,
    /// `p_value < significance_level`
    pub significant: bool,
}

/// Statistical fields written back onto the latest materialized row.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct SignificanceUpdate {
    /// Interval around the variant mean
    pub confidence_interval: Option<ConfidenceInterval>,
    /// Test outcome; `None` when the test could not run
    pub significance: Option<Significance>,
}

/// Snapshot of one metric for one variant.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ResultRecord {
    experiment_id: String,
    variant_name: String,
    metric_name: String,
    value: f64,
    sample_size: u64,
    variance: Option<f64>,
    categories: Option<BTreeMap<String, u64>>,
    confidence_interval: Option<ConfidenceInterval>,
    significance: Option<Significance>,
    calculated_at: DateTime<Utc>,
}

impl ResultRecord {
    /// Create a builder for a materialized result.
    #[must_use]
    pub fn builder(
        experiment_id: impl Into<String>,
        variant_name: impl Into<String>,
        metric_name: impl Into<String>,
        value: f64,
        sample_size: u64,
    ) -> ResultRecordBuilder {
        ResultRecordBuilder::new(experiment_id, variant_name, metric_name, value, sample_size)
    }

    /// Get the experiment ID.
    #[must_use]
    pub fn experiment_id(&self) -> &str {
        &self.experiment_id
    }

    /// Get the variant name.
    #[must_use]
    pub fn variant_name(&self) -> &str {
        &self.variant_name
    }

    /// Get the metric name.
    #[must_use]
    pub fn metric_name(&self) -> &str {
        &self.metric_name
    }

    /// Point value (mean, or top category count for categorical metrics).
    #[must_use]
    pub const fn value(&self) -> f64 {
        self.value
    }

    /// Number of observations behind `value`.
    #[must_use]
    pub const fn sample_size(&self) -> u64 {
        self.sample_size
    }

    /// Variance derived from the running sum of squares.
    #[must_use]
    pub const fn variance(&self) -> Option<f64> {
        self.variance
    }

    /// Per-category counts for categorical metrics.
    #[must_use]
    pub const fn categories(&self) -> Option<&BTreeMap<String, u64>> {
        self.categories.as_ref()
    }

    /// Confidence interval, once analysed.
    #[must_use]
    pub const fn confidence_interval(&self) -> Option<ConfidenceInterval> {
        self.confidence_interval
    }

    /// Significance outcome, once analysed.
    #[must_use]
    pub const fn significance(&self) -> Option<Significance> {
        self.significance
    }

    /// p-value, if a test ran.
    #[must_use]
    pub fn p_value(&self) -> Option<f64> {
        self.significance.map(|s| s.p_value)
    }

    /// Whether the test found a significant difference.
    #[must_use]
    pub fn is_significant(&self) -> bool {
        self.significance.is_some_and(|s| s.significant)
    }

    /// Get the materialization timestamp.
    #[must_use]
    pub const fn calculated_at(&self) -> DateTime<Utc> {
        self.calculated_at
    }

    pub(crate) fn apply(&mut self, update: SignificanceUpdate) {
        self.confidence_interval = update.confidence_interval;
        self.significance = update.significance;
    }
}

/// Builder for `ResultRecord`.
#[derive(Debug)]
pub struct ResultRecordBuilder {
    record: ResultRecord,
}

impl ResultRecordBuilder {
    /// Create a new builder with required fields.
    #[must_use]
    pub fn new(
        experiment_id: impl Into<String>,
        variant_name: impl Into<String>,
        metric_name: impl Into<String>,
        value: f64,
        sample_size: u64,
    ) -> Self {
        Self {
            record: ResultRecord {
                experiment_id: experiment_id.into(),
                variant_name: variant_name.into(),
                metric_name: metric_name.into(),
                value,
                sample_size,
                variance: None,
                categories: None,
                confidence_interval: None,
                significance: None,
                calculated_at: Utc::now(),
            },
        }
    }

    /// Set the variance.
    #[must_use]
    pub const fn variance(mut self, variance: f64) -> Self {
        self.record.variance = Some(variance);
        self
    }

    /// Set the category distribution.
    #[must_use]
    pub fn categories(mut self, categories: BTreeMap<String, u64>) -> Self {
        self.record.categories = Some(categories);
        self
    }

    /// Set a custom timestamp.
    #[must_use]
    pub const fn calculated_at(mut self, calculated_at: DateTime<Utc>) -> Self {
        self.record.calculated_at = calculated_at;
        self
    }

    /// Build the `ResultRecord`.
    #[must_use]
    pub fn build(self) -> ResultRecord {
        self.record
    }
}
