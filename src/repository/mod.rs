//! Experiment Repository - durable records for the A/B schema
//!
//! The contract every backing store must satisfy:
//!
//! - experiment status changes are compare-and-set, so two racing
//!   lifecycle calls cannot both succeed
//! - assignments are insert-if-absent on (`experiment_id`, `user_id`); the
//!   loser of a race gets the winner's row back
//! - events and results are append-only; the current result for a key is the
//!   one with the greatest `calculated_at`
//! - result and significance batches land whole or not at all, and are
//!   rejected with `NotFound` once the experiment is gone
//! - deleting an experiment cascades to assignments, events and results

mod memory;

pub use memory::MemoryRepository;

use std::future::Future;

use crate::experiment::{
    Assignment, Event, Experiment, ExperimentStatus, ResultRecord, SignificanceUpdate,
};
use crate::Result;

/// Outcome of an insert-if-absent.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum InsertOutcome<T> {
    /// The row was written.
    Inserted(T),
    /// A row already existed under the key; it is returned unchanged.
    Existing(T),
}

impl<T> InsertOutcome<T> {
    /// The stored row, whichever writer won.
    pub fn into_inner(self) -> T {
        match self {
            Self::Inserted(row) | Self::Existing(row) => row,
        }
    }

    /// Whether this call performed the write.
    pub const fn was_inserted(&self) -> bool {
        matches!(self, Self::Inserted(_))
    }
}

/// Filter for event queries.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EventFilter {
    /// Only events attributed to this variant
    pub variant_name: Option<String>,
    /// Only events with this name
    pub event_name: Option<String>,
    /// Maximum rows returned (newest first)
    pub limit: usize,
}

impl Default for EventFilter {
    fn default() -> Self {
        Self {
            variant_name: None,
            event_name: None,
            limit: 100,
        }
    }
}

impl EventFilter {
    /// Whether an event passes the variant/name predicates.
    #[must_use]
    pub fn matches(&self, event: &Event) -> bool {
        self.variant_name
            .as_deref()
            .map_or(true, |v| v == event.variant_name())
            && self
                .event_name
                .as_deref()
                .map_or(true, |n| n == event.event_name())
    }
}

/// Statistical fields for the current row of one (variant, metric).
#[derive(Debug, Clone, PartialEq)]
pub struct SignificanceWrite {
    /// Variant of the target row
    pub variant_name: String,
    /// Metric of the target row
    pub metric_name: String,
    /// Fields to write
    pub update: SignificanceUpdate,
}

impl SignificanceWrite {
    /// Target the current row for (`variant_name`, `metric_name`).
    pub fn new(
        variant_name: impl Into<String>,
        metric_name: impl Into<String>,
        update: SignificanceUpdate,
    ) -> Self {
        Self {
            variant_name: variant_name.into(),
            metric_name: metric_name.into(),
            update,
        }
    }
}

/// Durable storage contract consumed by the engine.
pub trait Repository: Send + Sync {
    /// Persist a new experiment.
    fn insert_experiment(&self, experiment: Experiment)
        -> impl Future<Output = Result<()>> + Send;

    /// Fetch an experiment by ID.
    fn get_experiment(&self, id: &str) -> impl Future<Output = Result<Option<Experiment>>> + Send;

    /// Experiments ordered by `created_at` descending.
    fn list_experiments(
        &self,
        status: Option<ExperimentStatus>,
        limit: usize,
    ) -> impl Future<Output = Result<Vec<Experiment>>> + Send;

    /// Set the status to `next` only if it currently equals `expected`.
    ///
    /// Returns the updated experiment. Fails with `NotFound` for an unknown
    /// ID and `InvalidState` if the current status is not `expected`.
    fn compare_and_set_status(
        &self,
        id: &str,
        expected: ExperimentStatus,
        next: ExperimentStatus,
    ) -> impl Future<Output = Result<Experiment>> + Send;

    /// Delete an experiment and every child record. Returns `false` if absent.
    fn delete_experiment(&self, id: &str) -> impl Future<Output = Result<bool>> + Send;

    /// Insert unless an assignment exists for the same (experiment, user).
    fn insert_assignment_if_absent(
        &self,
        assignment: Assignment,
    ) -> impl Future<Output = Result<InsertOutcome<Assignment>>> + Send;

    /// Fetch the assignment for a user.
    fn get_assignment(
        &self,
        experiment_id: &str,
        user_id: &str,
    ) -> impl Future<Output = Result<Option<Assignment>>> + Send;

    /// Set `completed_at` on an open assignment. Returns `false` if there was
    /// no open assignment.
    fn complete_assignment(
        &self,
        experiment_id: &str,
        user_id: &str,
    ) -> impl Future<Output = Result<bool>> + Send;

    /// Every assignment of an experiment.
    fn list_assignments(
        &self,
        experiment_id: &str,
    ) -> impl Future<Output = Result<Vec<Assignment>>> + Send;

    /// Append a raw event. Fails with `NotFound` for an unknown experiment.
    fn append_event(&self, event: Event) -> impl Future<Output = Result<()>> + Send;

    /// Events matching `filter`, newest first.
    fn list_events(
        &self,
        experiment_id: &str,
        filter: &EventFilter,
    ) -> impl Future<Output = Result<Vec<Event>>> + Send;

    /// Append one pass of result snapshots atomically.
    ///
    /// Fails with `NotFound` for an unknown experiment and `Validation` if a
    /// row belongs to another experiment; nothing is written on failure.
    fn append_results(
        &self,
        experiment_id: &str,
        rows: Vec<ResultRecord>,
    ) -> impl Future<Output = Result<()>> + Send;

    /// Current result for every (variant, metric) of an experiment.
    fn latest_results(
        &self,
        experiment_id: &str,
    ) -> impl Future<Output = Result<Vec<ResultRecord>>> + Send;

    /// Write statistical fields onto the current rows of several keys
    /// atomically.
    ///
    /// Fails with `NotFound` for an unknown experiment or a key without a
    /// result row; nothing is written on failure.
    fn update_latest_significance(
        &self,
        experiment_id: &str,
        writes: Vec<SignificanceWrite>,
    ) -> impl Future<Output = Result<()>> + Send;

    /// Liveness probe.
    fn ping(&self) -> impl Future<Output = Result<()>> + Send {
        async { Ok(()) }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_event_filter_default_matches_everything() {
        let filter = EventFilter::default();
        assert_eq!(filter.limit, 100);
        assert!(filter.matches(&Event::new("e", "u", "control", "click")));
    }

    #[test]
    fn test_event_filter_predicates() {
        let filter = EventFilter {
            variant_name: Some("treatment".into()),
            event_name: Some("purchase".into()),
            limit: 10,
        };
        assert!(filter.matches(&Event::new("e", "u", "treatment", "purchase")));
        assert!(!filter.matches(&Event::new("e", "u", "control", "purchase")));
        assert!(!filter.matches(&Event::new("e", "u", "treatment", "click")));
    }

    #[test]
    fn test_insert_outcome_accessors() {
        let inserted = InsertOutcome::Inserted(1);
        let existing = InsertOutcome::Existing(2);
        assert!(inserted.was_inserted());
        assert!(!existing.was_inserted());
        assert_eq!(existing.into_inner(), 2);
    }
}
