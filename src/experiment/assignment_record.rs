//! Assignment Record - sticky mapping of a user to a variant

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Assignment of one user to one variant of an experiment.
///
/// Unique per (`experiment_id`, `user_id`). Only `completed_at` ever changes
/// after creation.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Assignment {
    experiment_id: String,
    user_id: String,
    variant_name: String,
    assigned_at: DateTime<Utc>,
    completed_at: Option<DateTime<Utc>>,
}

impl Assignment {
    /// Create an open assignment stamped with the current time.
    #[must_use]
    pub fn new(
        experiment_id: impl Into<String>,
        user_id: impl Into<String>,
        variant_name: impl Into<String>,
    ) -> Self {
        Self {
            experiment_id: experiment_id.into(),
            user_id: user_id.into(),
            variant_name: variant_name.into(),
            assigned_at: Utc::now(),
            completed_at: None,
        }
    }

    /// Get the experiment ID.
    #[must_use]
    pub fn experiment_id(&self) -> &str {
        &self.experiment_id
    }

    /// Get the user ID.
    #[must_use]
    pub fn user_id(&self) -> &str {
        &self.user_id
    }

    /// Get the assigned variant.
    #[must_use]
    pub fn variant_name(&self) -> &str {
        &self.variant_name
    }

    /// Get the assignment timestamp.
    #[must_use]
    pub const fn assigned_at(&self) -> DateTime<Utc> {
        self.assigned_at
    }

    /// Get the completion timestamp, if the user reached end-of-funnel.
    #[must_use]
    pub const fn completed_at(&self) -> Option<DateTime<Utc>> {
        self.completed_at
    }

    /// Whether `completed_at` is still unset.
    #[must_use]
    pub const fn is_open(&self) -> bool {
        self.completed_at.is_none()
    }

    /// Close the assignment. Returns `false` if it was already closed.
    pub(crate) fn complete(&mut self, at: DateTime<Utc>) -> bool {
        if self.completed_at.is_some() {
            return false;
        }
        self.completed_at = Some(at);
        true
    }
}
