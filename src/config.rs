//! Engine configuration
//!
//! Every field has a default, so partial JSON documents deserialize:
//!
//! ```rust
//! use trueno_ab::config::EngineConfig;
//!
//! let config = EngineConfig::from_json(r#"{"tick_interval_ms": 5000}"#).unwrap();
//! assert_eq!(config.tick_interval().as_secs(), 5);
//! assert!((config.significance_level() - 0.05).abs() < f64::EPSILON);
//! ```

use std::time::Duration;

use serde::{Deserialize, Serialize};
use statrs::distribution::{ContinuousCDF, Normal};

use crate::{Error, Result};

/// Tunables for the scheduler, statistics and ingestion.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    tick_interval_ms: u64,
    significance_level: f64,
    confidence_level: f64,
    min_total_sample_size: u64,
    store_timeout_ms: u64,
    max_backoff_ms: u64,
    weight_tolerance: f64,
    completion_event: String,
    min_completion_rate: f64,
    max_coefficient_of_variation: f64,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            tick_interval_ms: 60_000,
            significance_level: 0.05,
            confidence_level: 0.95,
            min_total_sample_size: 1000,
            store_timeout_ms: 5_000,
            max_backoff_ms: 600_000,
            weight_tolerance: 0.01,
            completion_event: "experiment_completed".to_string(),
            min_completion_rate: 50.0,
            max_coefficient_of_variation: 0.5,
        }
    }
}

impl EngineConfig {
    /// Create a configuration builder starting from the defaults.
    #[must_use]
    pub fn builder() -> EngineConfigBuilder {
        EngineConfigBuilder::default()
    }

    /// Parse and validate a JSON document.
    ///
    /// # Errors
    ///
    /// Returns `Serialization` for malformed JSON and `Validation` for
    /// out-of-range values.
    pub fn from_json(json: &str) -> Result<Self> {
        let config: Self = serde_json::from_str(json)?;
        config.validate()?;
        Ok(config)
    }

    /// Check value ranges.
    ///
    /// # Errors
    ///
    /// Returns `Validation` naming the first offending field.
    pub fn validate(&self) -> Result<()> {
        if self.tick_interval_ms == 0 {
            return Err(Error::Validation("tick_interval_ms must be > 0".into()));
        }
        if !(self.significance_level > 0.0 && self.significance_level < 1.0) {
            return Err(Error::Validation(format!(
                "significance_level {} outside (0, 1)",
                self.significance_level
            )));
        }
        if !(self.confidence_level > 0.0 && self.confidence_level < 1.0) {
            return Err(Error::Validation(format!(
                "confidence_level {} outside (0, 1)",
                self.confidence_level
            )));
        }
        if self.store_timeout_ms == 0 {
            return Err(Error::Validation("store_timeout_ms must be > 0".into()));
        }
        if self.max_backoff_ms < self.tick_interval_ms {
            return Err(Error::Validation(
                "max_backoff_ms must be >= tick_interval_ms".into(),
            ));
        }
        if !(0.0..0.5).contains(&self.weight_tolerance) {
            return Err(Error::Validation(format!(
                "weight_tolerance {} outside [0, 0.5)",
                self.weight_tolerance
            )));
        }
        if self.completion_event.is_empty() {
            return Err(Error::Validation("completion_event must not be empty".into()));
        }
        Ok(())
    }

    /// Scheduler tick.
    #[must_use]
    pub const fn tick_interval(&self) -> Duration {
        Duration::from_millis(self.tick_interval_ms)
    }

    /// p-value threshold.
    #[must_use]
    pub const fn significance_level(&self) -> f64 {
        self.significance_level
    }

    /// Confidence level for variant-mean intervals.
    #[must_use]
    pub const fn confidence_level(&self) -> f64 {
        self.confidence_level
    }

    /// Two-sided z-score for `confidence_level` (1.96 at 95%).
    #[must_use]
    pub fn z_score(&self) -> f64 {
        // Normal::new only fails for non-finite or non-positive std_dev.
        Normal::new(0.0, 1.0)
            .map_or(1.959_963_984_540_054, |normal| {
                normal.inverse_cdf(1.0 - (1.0 - self.confidence_level) / 2.0)
            })
    }

    /// Total sample size below which conclusions carry a caveat.
    #[must_use]
    pub const fn min_total_sample_size(&self) -> u64 {
        self.min_total_sample_size
    }

    /// Bound on each store pass.
    #[must_use]
    pub const fn store_timeout(&self) -> Duration {
        Duration::from_millis(self.store_timeout_ms)
    }

    /// Cap on scheduler retry backoff.
    #[must_use]
    pub const fn max_backoff(&self) -> Duration {
        Duration::from_millis(self.max_backoff_ms)
    }

    /// Allowed deviation of the weight sum from 1.0.
    #[must_use]
    pub const fn weight_tolerance(&self) -> f64 {
        self.weight_tolerance
    }

    /// Event name that closes a user's assignment.
    #[must_use]
    pub fn completion_event(&self) -> &str {
        &self.completion_event
    }

    /// Completion rate (%) below which a recommendation is raised.
    #[must_use]
    pub const fn min_completion_rate(&self) -> f64 {
        self.min_completion_rate
    }

    /// Cross-variant coefficient of variation above which a metric is flagged.
    #[must_use]
    pub const fn max_coefficient_of_variation(&self) -> f64 {
        self.max_coefficient_of_variation
    }
}

/// Builder for `EngineConfig`.
#[derive(Debug, Default)]
pub struct EngineConfigBuilder {
    config: EngineConfig,
}

impl EngineConfigBuilder {
    /// Set the scheduler tick.
    #[must_use]
    pub fn tick_interval(mut self, interval: Duration) -> Self {
        self.config.tick_interval_ms = duration_ms(interval);
        self
    }

    /// Set the p-value threshold.
    #[must_use]
    pub const fn significance_level(mut self, level: f64) -> Self {
        self.config.significance_level = level;
        self
    }

    /// Set the confidence level.
    #[must_use]
    pub const fn confidence_level(mut self, level: f64) -> Self {
        self.config.confidence_level = level;
        self
    }

    /// Set the low-sample caveat floor.
    #[must_use]
    pub const fn min_total_sample_size(mut self, floor: u64) -> Self {
        self.config.min_total_sample_size = floor;
        self
    }

    /// Set the store timeout.
    #[must_use]
    pub fn store_timeout(mut self, timeout: Duration) -> Self {
        self.config.store_timeout_ms = duration_ms(timeout);
        self
    }

    /// Set the backoff cap.
    #[must_use]
    pub fn max_backoff(mut self, cap: Duration) -> Self {
        self.config.max_backoff_ms = duration_ms(cap);
        self
    }

    /// Set the weight-sum tolerance.
    #[must_use]
    pub const fn weight_tolerance(mut self, tolerance: f64) -> Self {
        self.config.weight_tolerance = tolerance;
        self
    }

    /// Set the completion event name.
    #[must_use]
    pub fn completion_event(mut self, name: impl Into<String>) -> Self {
        self.config.completion_event = name.into();
        self
    }

    /// Build and validate the configuration.
    ///
    /// # Errors
    ///
    /// Returns `Validation` for out-of-range values.
    pub fn build(self) -> Result<EngineConfig> {
        self.config.validate()?;
        Ok(self.config)
    }
}

fn duration_ms(duration: Duration) -> u64 {
    u64::try_from(duration.as_millis()).unwrap_or(u64::MAX)
}
