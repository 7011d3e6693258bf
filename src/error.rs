//! Error types for Trueno-AB
//!
//! Toyota Way: Clear error messages with actionable guidance (Respect for People)

use std::future::Future;
use std::time::Duration;

use thiserror::Error;

use crate::experiment::ExperimentStatus;

/// Result type alias
pub type Result<T> = std::result::Result<T, Error>;

/// Trueno-AB error types
#[derive(Error, Debug)]
pub enum Error {
    /// Malformed experiment definition (rejected before persistence)
    #[error("Validation failed: {0}")]
    Validation(String),

    /// Unknown experiment, variant or metric
    #[error("Not found: {0}")]
    NotFound(String),

    /// Illegal lifecycle transition
    #[error("Invalid state transition for experiment {experiment_id}: {from} -> {to}")]
    InvalidState {
        /// Experiment the transition was attempted on
        experiment_id: String,
        /// Status at the time of the attempt
        from: ExperimentStatus,
        /// Requested status
        to: ExperimentStatus,
    },

    /// Operation requires a running experiment
    #[error("Experiment {experiment_id} is not running (status: {status})")]
    NotRunning {
        /// Experiment the operation targeted
        experiment_id: String,
        /// Actual status
        status: ExperimentStatus,
    },

    /// Repository or metric store unavailable or timed out
    #[error("Store unavailable: {0}\nThe operation can be retried")]
    TransientStore(String),

    /// Not enough data to run a statistical test (non-fatal)
    #[error("Insufficient statistical input: {0}")]
    StatisticalInput(String),

    /// JSON (de)serialization error
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Generic error
    #[error("{0}")]
    Other(String),
}

impl Error {
    /// Whether the failure is worth retrying on the next scheduler tick.
    #[must_use]
    pub const fn is_transient(&self) -> bool {
        matches!(self, Self::TransientStore(_))
    }

    /// Whether the failure reports a missing entity.
    #[must_use]
    pub const fn is_not_found(&self) -> bool {
        matches!(self, Self::NotFound(_))
    }
}

/// Run a store call with an upper bound on its duration.
///
/// An elapsed timeout surfaces as [`Error::TransientStore`].
///
/// # Errors
///
/// Returns the inner error, or `TransientStore` if `limit` elapses first.
pub async fn bounded<T, F>(limit: Duration, operation: &str, fut: F) -> Result<T>
where
    F: Future<Output = Result<T>>,
{
    match tokio::time::timeout(limit, fut).await {
        Ok(result) => result,
        Err(_) => Err(Error::TransientStore(format!(
            "{operation} timed out after {}ms",
            limit.as_millis()
        ))),
    }
}
