//! Experiment Lifecycle Manager
//!
//! Owns the status machine and wires the other components together:
//!
//! ```text
//!            start            pause
//!   draft ─────────> running ───────> paused
//!                     │   ^  resume    │
//!                     │   └────────────┘
//!                     ├──> cancelled   │
//!                     └──> completed <─┘
//! ```
//!
//! Every transition is a compare-and-set on the repository, so racing
//! callers cannot both win. Scheduler tasks follow the status: spawned on
//! start/resume, cancelled on pause/complete/cancel. Delete also waits for
//! an in-flight tick before removing any records.
//!
//! # Example
//!
//! ```rust
//! use std::sync::Arc;
//! use trueno_ab::config::EngineConfig;
//! use trueno_ab::experiment::{Event, ExperimentSpec, Metric, MetricType, Variant};
//! use trueno_ab::lifecycle::ExperimentManager;
//! use trueno_ab::metric_store::MemoryMetricStore;
//! use trueno_ab::repository::MemoryRepository;
//!
//! # #[tokio::main(flavor = "current_thread")]
//! # async fn main() -> trueno_ab::Result<()> {
//! let manager = ExperimentManager::new(
//!     Arc::new(MemoryRepository::new()),
//!     Arc::new(MemoryMetricStore::new()),
//!     EngineConfig::default(),
//! );
//!
//! let spec = ExperimentSpec::builder("Signup copy")
//!     .variant(Variant::new("control", 0.5))
//!     .variant(Variant::new("bold", 0.5))
//!     .metric(Metric::new("signup", MetricType::Binary).primary())
//!     .build();
//!
//! let experiment = manager.create(spec).await?;
//! manager.start(experiment.id()).await?;
//!
//! let assigned = manager.assign(experiment.id(), "user-42").await?;
//! manager
//!     .track_event(Event::new(experiment.id(), "user-42", assigned.variant_name, "signup"))
//!     .await?;
//!
//! manager.complete(experiment.id()).await?;
//! let report = manager.results(experiment.id()).await?;
//! assert_eq!(report.results.len(), 2);
//! # Ok(())
//! # }
//! ```

use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, error, info};

use crate::aggregation::{MetricPipeline, TrackingAck};
use crate::assignment::{AssignmentEngine, AssignmentResponse};
use crate::config::EngineConfig;
use crate::error::bounded;
use crate::experiment::{Event, Experiment, ExperimentSpec, ExperimentStatus};
use crate::metric_store::{experiment_prefix, MetricStore};
use crate::repository::{EventFilter, Repository};
use crate::scheduler::{ExperimentTick, SchedulerRegistry, TickOutcome};
use crate::stats::{
    build_report, recommendations, ExperimentReport, ExperimentStats, MetricAnalysis,
    ExperimentTimeline, Recommendation, SignificanceAnalyzer, VariantAssignments,
};
use crate::{Error, Result};

/// Overall engine health.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum HealthStatus {
    /// Both stores answer
    Healthy,
    /// At least one store failed its probe
    Degraded,
}

/// Health probe result.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HealthReport {
    /// Overall status
    pub status: HealthStatus,
    /// Repository probe succeeded
    pub repository_ok: bool,
    /// Metric store probe succeeded
    pub metric_store_ok: bool,
    /// Experiments in `running` (0 if the repository is down)
    pub running_experiments: usize,
    /// Live scheduler tasks
    pub active_schedulers: usize,
    /// Probe time
    pub checked_at: DateTime<Utc>,
}

/// Entry point for every experiment operation.
#[derive(Debug)]
pub struct ExperimentManager<R, M> {
    repository: Arc<R>,
    store: Arc<M>,
    config: Arc<EngineConfig>,
    assignments: AssignmentEngine<R>,
    pipeline: MetricPipeline<R, M>,
    analyzer: SignificanceAnalyzer<R>,
    scheduler: SchedulerRegistry,
}

impl<R, M> Clone for ExperimentManager<R, M> {
    fn clone(&self) -> Self {
        Self {
            repository: Arc::clone(&self.repository),
            store: Arc::clone(&self.store),
            config: Arc::clone(&self.config),
            assignments: self.assignments.clone(),
            pipeline: self.pipeline.clone(),
            analyzer: self.analyzer.clone(),
            scheduler: self.scheduler.clone(),
        }
    }
}

impl<R, M> ExperimentManager<R, M>
where
    R: Repository + 'static,
    M: MetricStore + 'static,
{
    /// Create a manager over the given stores.
    pub fn new(repository: Arc<R>, store: Arc<M>, config: EngineConfig) -> Self {
        let scheduler = SchedulerRegistry::new(config.tick_interval(), config.max_backoff());
        Self {
            assignments: AssignmentEngine::new(Arc::clone(&repository)),
            pipeline: MetricPipeline::new(
                Arc::clone(&repository),
                Arc::clone(&store),
                config.completion_event(),
            ),
            analyzer: SignificanceAnalyzer::new(
                Arc::clone(&repository),
                config.significance_level(),
                config.z_score(),
            ),
            repository,
            store,
            config: Arc::new(config),
            scheduler,
        }
    }

    /// Engine configuration.
    #[must_use]
    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    /// Scheduler task registry.
    #[must_use]
    pub const fn scheduler(&self) -> &SchedulerRegistry {
        &self.scheduler
    }

    /// Validate and persist a new experiment in `draft`.
    ///
    /// # Errors
    ///
    /// Returns `Validation` for a malformed spec, or repository errors.
    pub async fn create(&self, spec: ExperimentSpec) -> Result<Experiment> {
        spec.validate(self.config.weight_tolerance())?;
        let experiment = Experiment::from_spec(spec);
        self.store_call("insert experiment", self.repository.insert_experiment(experiment.clone()))
            .await?;
        info!(
            experiment_id = experiment.id(),
            name = experiment.name(),
            variants = experiment.variants().len(),
            "Experiment created"
        );
        Ok(experiment)
    }

    /// Fetch an experiment.
    ///
    /// # Errors
    ///
    /// Returns `NotFound` for an unknown id.
    pub async fn get(&self, experiment_id: &str) -> Result<Experiment> {
        self.store_call("get experiment", self.repository.get_experiment(experiment_id))
            .await?
            .ok_or_else(|| Error::NotFound(format!("experiment {experiment_id}")))
    }

    /// Experiments, newest first, optionally filtered by status.
    ///
    /// # Errors
    ///
    /// Returns repository errors.
    pub async fn list(
        &self,
        status: Option<ExperimentStatus>,
        limit: usize,
    ) -> Result<Vec<Experiment>> {
        self.store_call("list experiments", self.repository.list_experiments(status, limit))
            .await
    }

    /// `draft -> running`: seed counters and spawn the scheduler task.
    ///
    /// Counters are seeded while the experiment is still `draft`; if seeding
    /// fails the status is left unchanged and the call can be retried.
    ///
    /// # Errors
    ///
    /// `NotFound`, `InvalidState` unless the experiment is `draft`, or store
    /// errors from seeding.
    pub async fn start(&self, experiment_id: &str) -> Result<Experiment> {
        let draft = self.get(experiment_id).await?;
        if draft.status() != ExperimentStatus::Draft {
            return Err(Error::InvalidState {
                experiment_id: experiment_id.to_string(),
                from: draft.status(),
                to: ExperimentStatus::Running,
            });
        }
        self.store_call("seed counters", self.pipeline.initialize_counters(&draft))
            .await?;

        let experiment = self
            .transition(experiment_id, &[ExperimentStatus::Draft], ExperimentStatus::Running)
            .await?;
        self.scheduler.spawn(experiment_id, self.clone());
        Ok(experiment)
    }

    /// `running -> paused`: stop the scheduler task. Counters are kept.
    ///
    /// # Errors
    ///
    /// `NotFound`, or `InvalidState` unless the experiment is `running`.
    pub async fn pause(&self, experiment_id: &str) -> Result<Experiment> {
        let experiment = self
            .transition(experiment_id, &[ExperimentStatus::Running], ExperimentStatus::Paused)
            .await?;
        self.scheduler.cancel(experiment_id);
        Ok(experiment)
    }

    /// `paused -> running`: respawn the scheduler task.
    ///
    /// # Errors
    ///
    /// `NotFound`, or `InvalidState` unless the experiment is `paused`.
    pub async fn resume(&self, experiment_id: &str) -> Result<Experiment> {
        let experiment = self
            .transition(experiment_id, &[ExperimentStatus::Paused], ExperimentStatus::Running)
            .await?;
        self.scheduler.spawn(experiment_id, self.clone());
        Ok(experiment)
    }

    /// `running | paused -> completed`, then one final aggregation and
    /// significance pass.
    ///
    /// A failed final pass is logged; the experiment stays completed and the
    /// previous results remain current.
    ///
    /// # Errors
    ///
    /// `NotFound`, or `InvalidState` from any other status.
    pub async fn complete(&self, experiment_id: &str) -> Result<Experiment> {
        self.finish(experiment_id, true).await
    }

    /// `running -> cancelled`: stop the scheduler task.
    ///
    /// # Errors
    ///
    /// `NotFound`, or `InvalidState` unless the experiment is `running`.
    pub async fn cancel(&self, experiment_id: &str) -> Result<Experiment> {
        let experiment = self
            .transition(experiment_id, &[ExperimentStatus::Running], ExperimentStatus::Cancelled)
            .await?;
        self.scheduler.cancel(experiment_id);
        Ok(experiment)
    }

    /// Delete an experiment from any status, with its assignments, events,
    /// results and metric store keys.
    ///
    /// Waits for an in-flight scheduler tick first, so no pass writes after
    /// the cascade.
    ///
    /// # Errors
    ///
    /// `NotFound` for an unknown id, or store errors.
    pub async fn delete(&self, experiment_id: &str) -> Result<()> {
        self.scheduler.stop(experiment_id).await;

        let existed = self
            .store_call("delete experiment", self.repository.delete_experiment(experiment_id))
            .await?;
        if !existed {
            return Err(Error::NotFound(format!("experiment {experiment_id}")));
        }

        let removed = self
            .store_call(
                "delete metric keys",
                self.store.delete_prefix(&experiment_prefix(experiment_id)),
            )
            .await?;
        info!(experiment_id, metric_keys = removed, "Experiment deleted");
        Ok(())
    }

    /// Assignment boundary.
    ///
    /// # Errors
    ///
    /// `NotFound`, `NotRunning`, or `TransientStore` on timeout.
    pub async fn assign(&self, experiment_id: &str, user_id: &str) -> Result<AssignmentResponse> {
        self.store_call("assign", self.assignments.assign(experiment_id, user_id))
            .await
    }

    /// Ingestion boundary.
    ///
    /// # Errors
    ///
    /// `NotFound`, `NotRunning`, or `TransientStore` on timeout.
    pub async fn track_event(&self, event: Event) -> Result<TrackingAck> {
        self.store_call("record event", self.pipeline.record_event(event))
            .await
    }

    /// Materialize counters and run the significance pass now.
    ///
    /// # Errors
    ///
    /// `NotFound`, or store errors.
    pub async fn refresh(&self, experiment_id: &str) -> Result<Vec<MetricAnalysis>> {
        let experiment = self.get(experiment_id).await?;
        self.run_pass(&experiment).await
    }

    async fn run_pass(&self, experiment: &Experiment) -> Result<Vec<MetricAnalysis>> {
        self.store_call("materialize", self.pipeline.materialize(experiment))
            .await?;
        self.store_call("significance", self.analyzer.analyze(experiment))
            .await
    }

    /// Query boundary: current results, summary and conclusions.
    ///
    /// # Errors
    ///
    /// `NotFound`, or repository errors.
    pub async fn results(&self, experiment_id: &str) -> Result<ExperimentReport> {
        let experiment = self.get(experiment_id).await?;
        let rows = self
            .store_call("latest results", self.repository.latest_results(experiment_id))
            .await?;
        Ok(build_report(
            &experiment,
            rows,
            self.config.min_total_sample_size(),
        ))
    }

    /// Assignment and event counters.
    ///
    /// # Errors
    ///
    /// `NotFound`, or repository errors.
    pub async fn stats(&self, experiment_id: &str) -> Result<ExperimentStats> {
        let experiment = self.get(experiment_id).await?;
        let assignments = self
            .store_call("list assignments", self.repository.list_assignments(experiment_id))
            .await?;
        let all = EventFilter {
            limit: usize::MAX,
            ..EventFilter::default()
        };
        let events = self
            .store_call("list events", self.repository.list_events(experiment_id, &all))
            .await?;
        Ok(ExperimentStats::from_records(
            &experiment,
            &assignments,
            &events,
        ))
    }

    /// Raw events, newest first.
    ///
    /// # Errors
    ///
    /// `NotFound`, or repository errors.
    pub async fn events(&self, experiment_id: &str, filter: &EventFilter) -> Result<Vec<Event>> {
        self.get(experiment_id).await?;
        self.store_call("list events", self.repository.list_events(experiment_id, filter))
            .await
    }

    /// Assignment counts per declared variant.
    ///
    /// # Errors
    ///
    /// `NotFound`, or repository errors.
    pub async fn assignments_by_variant(
        &self,
        experiment_id: &str,
    ) -> Result<Vec<VariantAssignments>> {
        let experiment = self.get(experiment_id).await?;
        let assignments = self
            .store_call("list assignments", self.repository.list_assignments(experiment_id))
            .await?;
        Ok(VariantAssignments::tally(&experiment, &assignments))
    }

    /// Created, started, ended and status-change entries, oldest first.
    ///
    /// # Errors
    ///
    /// `NotFound`, or repository errors.
    pub async fn timeline(&self, experiment_id: &str) -> Result<ExperimentTimeline> {
        let experiment = self.get(experiment_id).await?;
        Ok(ExperimentTimeline::from_experiment(&experiment, Utc::now()))
    }

    /// Actionable recommendations.
    ///
    /// # Errors
    ///
    /// `NotFound`, or repository errors.
    pub async fn recommendations(&self, experiment_id: &str) -> Result<Vec<Recommendation>> {
        let report = self.results(experiment_id).await?;
        let stats = self.stats(experiment_id).await?;
        Ok(recommendations(&report, &stats, &self.config))
    }

    /// Probe both stores and count running work. Never fails.
    pub async fn health(&self) -> HealthReport {
        let repository_ok = self
            .store_call("repository ping", self.repository.ping())
            .await
            .is_ok();
        let metric_store_ok = self
            .store_call("metric store ping", self.store.ping())
            .await
            .is_ok();
        let running_experiments = if repository_ok {
            self.list(Some(ExperimentStatus::Running), usize::MAX)
                .await
                .map_or(0, |running| running.len())
        } else {
            0
        };

        HealthReport {
            status: if repository_ok && metric_store_ok {
                HealthStatus::Healthy
            } else {
                HealthStatus::Degraded
            },
            repository_ok,
            metric_store_ok,
            running_experiments,
            active_schedulers: self.scheduler.active_count(),
            checked_at: Utc::now(),
        }
    }

    /// Stop every scheduler task and wait for them.
    pub async fn shutdown(&self) {
        self.scheduler.shutdown().await;
    }

    async fn finish(&self, experiment_id: &str, final_pass: bool) -> Result<Experiment> {
        let experiment = self
            .transition(
                experiment_id,
                &[ExperimentStatus::Running, ExperimentStatus::Paused],
                ExperimentStatus::Completed,
            )
            .await?;
        self.scheduler.cancel(experiment_id);

        if final_pass {
            if let Err(e) = self.run_pass(&experiment).await {
                error!(experiment_id, error = %e, "Final analysis pass failed");
            }
        }
        Ok(experiment)
    }

    async fn transition(
        &self,
        experiment_id: &str,
        allowed_from: &[ExperimentStatus],
        next: ExperimentStatus,
    ) -> Result<Experiment> {
        let current = self.get(experiment_id).await?;
        let from = current.status();
        if !allowed_from.contains(&from) || !from.can_transition_to(next) {
            return Err(Error::InvalidState {
                experiment_id: experiment_id.to_string(),
                from,
                to: next,
            });
        }

        let updated = self
            .store_call(
                "update status",
                self.repository
                    .compare_and_set_status(experiment_id, from, next),
            )
            .await?;
        info!(experiment_id, from = %from, to = %next, "Experiment status changed");
        Ok(updated)
    }

    async fn store_call<T>(
        &self,
        operation: &str,
        fut: impl std::future::Future<Output = Result<T>>,
    ) -> Result<T> {
        bounded(self.config.store_timeout(), operation, fut).await
    }
}

impl<R, M> ExperimentTick for ExperimentManager<R, M>
where
    R: Repository + 'static,
    M: MetricStore + 'static,
{
    async fn tick(&self, experiment_id: &str) -> Result<TickOutcome> {
        let experiment = self.get(experiment_id).await?;
        if experiment.status() != ExperimentStatus::Running {
            debug!(
                experiment_id,
                status = %experiment.status(),
                "Experiment no longer running, scheduler exits"
            );
            return Ok(TickOutcome::Stop);
        }

        let analyses = self.run_pass(&experiment).await?;
        debug!(
            experiment_id,
            metrics = analyses.len(),
            significant = analyses
                .iter()
                .filter(|a| a.significance.is_some_and(|s| s.significant))
                .count(),
            "Scheduler tick complete"
        );

        if experiment.has_ended(Utc::now()) {
            info!(experiment_id, "End date reached, completing experiment");
            // This tick already produced the final results.
            self.finish(experiment_id, false).await?;
            return Ok(TickOutcome::Stop);
        }
        Ok(TickOutcome::Continue)
    }
}
