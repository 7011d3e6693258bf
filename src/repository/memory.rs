//! In-memory repository using `DashMap`.
//!
//! Data is lost on process restart. The uniqueness and compare-and-set
//! guarantees come from `DashMap`'s entry API and shard guards.
//!
//! Child writes check that the experiment exists while holding the child
//! map's entry guard. `delete_experiment` removes the experiment before its
//! children, so a write that passes the check is swept by the cascade.

use std::collections::BTreeMap;

use chrono::Utc;
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;

use super::{EventFilter, InsertOutcome, Repository, SignificanceWrite};
use crate::experiment::{Assignment, Event, Experiment, ExperimentStatus, ResultRecord};
use crate::{Error, Result};

/// In-memory store for experiment data.
///
/// ## Design
///
/// Experiments and assignments are keyed for O(1) lookups. Events and
/// results are per-experiment append-only vectors; the latest result for a
/// key is resolved at read time.
#[derive(Debug, Default)]
pub struct MemoryRepository {
    experiments: DashMap<String, Experiment>,
    assignments: DashMap<(String, String), Assignment>,
    events: DashMap<String, Vec<Event>>,
    results: DashMap<String, Vec<ResultRecord>>,
}

impl MemoryRepository {
    /// Create a new empty repository.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Check if the repository holds no experiments.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.experiments.is_empty()
    }

    /// Get the number of experiments.
    #[must_use]
    pub fn experiment_count(&self) -> usize {
        self.experiments.len()
    }

    /// Get the number of stored assignments across all experiments.
    #[must_use]
    pub fn assignment_count(&self) -> usize {
        self.assignments.len()
    }

    /// Get the number of result rows (all snapshots) for an experiment.
    #[must_use]
    pub fn result_row_count(&self, experiment_id: &str) -> usize {
        self.results.get(experiment_id).map_or(0, |rows| rows.len())
    }
}

/// Index of the current row for a (variant, metric) key.
///
/// Later rows win ties on `calculated_at`.
fn latest_index(rows: &[ResultRecord], variant_name: &str, metric_name: &str) -> Option<usize> {
    rows.iter()
        .enumerate()
        .filter(|(_, r)| r.variant_name() == variant_name && r.metric_name() == metric_name)
        .max_by_key(|(_, r)| r.calculated_at())
        .map(|(i, _)| i)
}

fn unknown_experiment(experiment_id: &str) -> Error {
    Error::NotFound(format!("experiment {experiment_id}"))
}

impl Repository for MemoryRepository {
    async fn insert_experiment(&self, experiment: Experiment) -> Result<()> {
        match self.experiments.entry(experiment.id().to_string()) {
            Entry::Occupied(_) => Err(Error::Validation(format!(
                "experiment {} already exists",
                experiment.id()
            ))),
            Entry::Vacant(slot) => {
                slot.insert(experiment);
                Ok(())
            }
        }
    }

    async fn get_experiment(&self, id: &str) -> Result<Option<Experiment>> {
        Ok(self.experiments.get(id).map(|e| e.value().clone()))
    }

    async fn list_experiments(
        &self,
        status: Option<ExperimentStatus>,
        limit: usize,
    ) -> Result<Vec<Experiment>> {
        let mut experiments: Vec<Experiment> = self
            .experiments
            .iter()
            .filter(|e| status.map_or(true, |s| e.status() == s))
            .map(|e| e.value().clone())
            .collect();

        experiments.sort_by(|a, b| b.created_at().cmp(&a.created_at()));
        experiments.truncate(limit);
        Ok(experiments)
    }

    async fn compare_and_set_status(
        &self,
        id: &str,
        expected: ExperimentStatus,
        next: ExperimentStatus,
    ) -> Result<Experiment> {
        let mut experiment = self
            .experiments
            .get_mut(id)
            .ok_or_else(|| Error::NotFound(format!("experiment {id}")))?;

        if experiment.status() != expected {
            return Err(Error::InvalidState {
                experiment_id: id.to_string(),
                from: experiment.status(),
                to: next,
            });
        }

        experiment.set_status(next, Utc::now());
        Ok(experiment.clone())
    }

    async fn delete_experiment(&self, id: &str) -> Result<bool> {
        let existed = self.experiments.remove(id).is_some();
        self.assignments.retain(|(experiment_id, _), _| experiment_id != id);
        self.events.remove(id);
        self.results.remove(id);
        Ok(existed)
    }

    async fn insert_assignment_if_absent(
        &self,
        assignment: Assignment,
    ) -> Result<InsertOutcome<Assignment>> {
        let key = (
            assignment.experiment_id().to_string(),
            assignment.user_id().to_string(),
        );
        match self.assignments.entry(key) {
            Entry::Occupied(existing) => Ok(InsertOutcome::Existing(existing.get().clone())),
            Entry::Vacant(slot) => {
                slot.insert(assignment.clone());
                Ok(InsertOutcome::Inserted(assignment))
            }
        }
    }

    async fn get_assignment(&self, experiment_id: &str, user_id: &str) -> Result<Option<Assignment>> {
        let key = (experiment_id.to_string(), user_id.to_string());
        Ok(self.assignments.get(&key).map(|a| a.value().clone()))
    }

    async fn complete_assignment(&self, experiment_id: &str, user_id: &str) -> Result<bool> {
        let key = (experiment_id.to_string(), user_id.to_string());
        Ok(self
            .assignments
            .get_mut(&key)
            .is_some_and(|mut assignment| assignment.complete(Utc::now())))
    }

    async fn list_assignments(&self, experiment_id: &str) -> Result<Vec<Assignment>> {
        Ok(self
            .assignments
            .iter()
            .filter(|a| a.key().0 == experiment_id)
            .map(|a| a.value().clone())
            .collect())
    }

    async fn append_event(&self, event: Event) -> Result<()> {
        let experiment_id = event.experiment_id().to_string();
        let mut events = self.events.entry(experiment_id.clone()).or_default();
        if !self.experiments.contains_key(&experiment_id) {
            drop(events);
            self.events.remove_if(&experiment_id, |_, rows| rows.is_empty());
            return Err(unknown_experiment(&experiment_id));
        }
        events.push(event);
        Ok(())
    }

    async fn list_events(&self, experiment_id: &str, filter: &EventFilter) -> Result<Vec<Event>> {
        let Some(events) = self.events.get(experiment_id) else {
            return Ok(Vec::new());
        };

        let mut matching: Vec<Event> = events
            .iter()
            .filter(|e| filter.matches(e))
            .cloned()
            .collect();
        drop(events);

        // Newest first
        matching.sort_by(|a, b| b.timestamp().cmp(&a.timestamp()));
        matching.truncate(filter.limit);
        Ok(matching)
    }

    async fn append_results(&self, experiment_id: &str, rows: Vec<ResultRecord>) -> Result<()> {
        if let Some(stray) = rows.iter().find(|r| r.experiment_id() != experiment_id) {
            return Err(Error::Validation(format!(
                "result for experiment {} in a batch for {experiment_id}",
                stray.experiment_id()
            )));
        }

        let mut stored = self.results.entry(experiment_id.to_string()).or_default();
        if !self.experiments.contains_key(experiment_id) {
            drop(stored);
            self.results.remove_if(experiment_id, |_, rows| rows.is_empty());
            return Err(unknown_experiment(experiment_id));
        }
        stored.extend(rows);
        Ok(())
    }

    async fn latest_results(&self, experiment_id: &str) -> Result<Vec<ResultRecord>> {
        let Some(rows) = self.results.get(experiment_id) else {
            return Ok(Vec::new());
        };

        let mut latest: BTreeMap<(&str, &str), &ResultRecord> = BTreeMap::new();
        for row in rows.iter() {
            let key = (row.variant_name(), row.metric_name());
            match latest.get(&key) {
                Some(current) if current.calculated_at() > row.calculated_at() => {}
                _ => {
                    latest.insert(key, row);
                }
            }
        }

        let current: Vec<ResultRecord> = latest.into_values().cloned().collect();
        Ok(current)
    }

    async fn update_latest_significance(
        &self,
        experiment_id: &str,
        writes: Vec<SignificanceWrite>,
    ) -> Result<()> {
        let Some(mut rows) = self.results.get_mut(experiment_id) else {
            return Err(unknown_experiment(experiment_id));
        };
        if !self.experiments.contains_key(experiment_id) {
            return Err(unknown_experiment(experiment_id));
        }

        // Resolve every target before touching any row.
        let targets = writes
            .iter()
            .map(|write| {
                latest_index(&rows, &write.variant_name, &write.metric_name).ok_or_else(|| {
                    Error::NotFound(format!(
                        "result {}/{} in experiment {experiment_id}",
                        write.variant_name, write.metric_name
                    ))
                })
            })
            .collect::<Result<Vec<usize>>>()?;

        for (index, write) in targets.into_iter().zip(writes) {
            rows[index].apply(write.update);
        }
        Ok(())
    }
}
