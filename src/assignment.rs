//! Assignment Engine - sticky weighted variant selection
//!
//! A user's first request draws a variant from the weight ladder; every later
//! request returns the stored row. Uniqueness is enforced by the repository's
//! insert-if-absent, so two racing first requests still produce one row.

use std::sync::Arc;

use rand::Rng;
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::experiment::{Assignment, Experiment, ExperimentStatus, Variant};
use crate::repository::{InsertOutcome, Repository};
use crate::{Error, Result};

/// Reply of the assignment boundary.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AssignmentResponse {
    /// Experiment the user was assigned in
    pub experiment_id: String,
    /// Assigned user
    pub user_id: String,
    /// Variant served
    pub variant_name: String,
    /// `true` if the row existed before this call
    pub already_assigned: bool,
}

/// Pick a variant by weighted draw.
///
/// Builds a cumulative ladder in declaration order, draws uniformly from
/// `[0, total)` where `total` is the actual weight sum, and returns the first
/// variant whose cumulative weight reaches the draw. Returns `None` only for
/// an empty slice.
pub fn select_variant<'a, R: Rng + ?Sized>(
    variants: &'a [Variant],
    rng: &mut R,
) -> Option<&'a Variant> {
    let total: f64 = variants.iter().map(|v| v.weight).sum();
    if total.is_nan() || total <= 0.0 {
        return variants.first();
    }

    let draw = rng.gen_range(0.0..total);
    let mut cumulative = 0.0;
    for variant in variants {
        cumulative += variant.weight;
        if cumulative >= draw && variant.weight > 0.0 {
            return Some(variant);
        }
    }
    // Rounding can leave the last rung a hair below the draw.
    variants.iter().rev().find(|v| v.weight > 0.0).or(variants.last())
}

/// Serves per-user variant lookups.
#[derive(Debug)]
pub struct AssignmentEngine<R> {
    repository: Arc<R>,
}

impl<R> Clone for AssignmentEngine<R> {
    fn clone(&self) -> Self {
        Self {
            repository: Arc::clone(&self.repository),
        }
    }
}

impl<R: Repository> AssignmentEngine<R> {
    /// Create an engine over a shared repository.
    pub const fn new(repository: Arc<R>) -> Self {
        Self { repository }
    }

    /// Return the user's variant, drawing one on first contact.
    ///
    /// # Errors
    ///
    /// - `NotFound` if the experiment does not exist
    /// - `NotRunning` unless the experiment is `running`
    /// - repository errors, unchanged
    pub async fn assign(&self, experiment_id: &str, user_id: &str) -> Result<AssignmentResponse> {
        let experiment = self.running_experiment(experiment_id).await?;

        if let Some(existing) = self.repository.get_assignment(experiment_id, user_id).await? {
            return Ok(response(existing, true));
        }

        let variant_name = {
            let mut rng = rand::thread_rng();
            select_variant(experiment.variants(), &mut rng)
                .map(|v| v.name.clone())
                .ok_or_else(|| {
                    Error::Validation(format!("experiment {experiment_id} has no variants"))
                })?
        };

        let outcome = self
            .repository
            .insert_assignment_if_absent(Assignment::new(experiment_id, user_id, variant_name))
            .await?;

        match outcome {
            InsertOutcome::Inserted(row) => {
                debug!(
                    experiment_id,
                    user_id,
                    variant = row.variant_name(),
                    "Assigned user"
                );
                Ok(response(row, false))
            }
            InsertOutcome::Existing(row) => {
                debug!(experiment_id, user_id, "Lost assignment race, returning winner");
                Ok(response(row, true))
            }
        }
    }

    /// Close the user's open assignment.
    ///
    /// Returns `false` if the user had no open assignment.
    ///
    /// # Errors
    ///
    /// Returns repository errors unchanged.
    pub async fn mark_completed(&self, experiment_id: &str, user_id: &str) -> Result<bool> {
        let closed = self
            .repository
            .complete_assignment(experiment_id, user_id)
            .await?;
        if closed {
            info!(experiment_id, user_id, "Assignment completed");
        }
        Ok(closed)
    }

    async fn running_experiment(&self, experiment_id: &str) -> Result<Experiment> {
        let experiment = self
            .repository
            .get_experiment(experiment_id)
            .await?
            .ok_or_else(|| Error::NotFound(format!("experiment {experiment_id}")))?;

        if experiment.status() != ExperimentStatus::Running {
            return Err(Error::NotRunning {
                experiment_id: experiment_id.to_string(),
                status: experiment.status(),
            });
        }
        Ok(experiment)
    }
}

fn response(row: Assignment, already_assigned: bool) -> AssignmentResponse {
    AssignmentResponse {
        experiment_id: row.experiment_id().to_string(),
        user_id: row.user_id().to_string(),
        variant_name: row.variant_name().to_string(),
        already_assigned,
    }
}
