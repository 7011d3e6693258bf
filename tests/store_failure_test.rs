//! Store Failure Tests
//!
//! Real components over stores that can be told to fail or stall, to check
//! that outages surface as `TransientStore`, leave no partial writes, and
//! that scheduler tasks ride them out.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use dashmap::DashSet;
use trueno_ab::config::EngineConfig;
use trueno_ab::experiment::{
    Assignment, Event, Experiment, ExperimentSpec, ExperimentStatus, Metric, MetricType,
    ResultRecord, Variant,
};
use trueno_ab::lifecycle::{ExperimentManager, HealthStatus};
use trueno_ab::metric_store::{MemoryMetricStore, MetricKey, MetricStore, FIELD_COUNT};
use trueno_ab::repository::{
    EventFilter, InsertOutcome, MemoryRepository, Repository, SignificanceWrite,
};
use trueno_ab::{Error, Result};

const EVERY_OPERATION: &str = "*";
const STALL: Duration = Duration::from_millis(200);

/// Operations told to fail or stall.
#[derive(Debug, Default)]
struct Faults {
    failing: DashSet<&'static str>,
    stalled: DashSet<&'static str>,
}

impl Faults {
    fn fail(&self, operation: &'static str) {
        self.failing.insert(operation);
    }

    fn stall(&self, operation: &'static str) {
        self.stalled.insert(operation);
    }

    fn heal(&self) {
        self.failing.clear();
        self.stalled.clear();
    }

    async fn enter(&self, operation: &'static str) -> Result<()> {
        if self.stalled.contains(operation) || self.stalled.contains(EVERY_OPERATION) {
            tokio::time::sleep(STALL).await;
        }
        if self.failing.contains(operation) || self.failing.contains(EVERY_OPERATION) {
            return Err(Error::TransientStore(format!("{operation}: connection refused")));
        }
        Ok(())
    }
}

#[derive(Debug, Default)]
struct FlakyRepository {
    inner: MemoryRepository,
    faults: Faults,
}

impl Repository for FlakyRepository {
    async fn insert_experiment(&self, experiment: Experiment) -> Result<()> {
        self.faults.enter("insert_experiment").await?;
        self.inner.insert_experiment(experiment).await
    }

    async fn get_experiment(&self, id: &str) -> Result<Option<Experiment>> {
        self.faults.enter("get_experiment").await?;
        self.inner.get_experiment(id).await
    }

    async fn list_experiments(
        &self,
        status: Option<ExperimentStatus>,
        limit: usize,
    ) -> Result<Vec<Experiment>> {
        self.faults.enter("list_experiments").await?;
        self.inner.list_experiments(status, limit).await
    }

    async fn compare_and_set_status(
        &self,
        id: &str,
        expected: ExperimentStatus,
        next: ExperimentStatus,
    ) -> Result<Experiment> {
        self.faults.enter("compare_and_set_status").await?;
        self.inner.compare_and_set_status(id, expected, next).await
    }

    async fn delete_experiment(&self, id: &str) -> Result<bool> {
        self.faults.enter("delete_experiment").await?;
        self.inner.delete_experiment(id).await
    }

    async fn insert_assignment_if_absent(
        &self,
        assignment: Assignment,
    ) -> Result<InsertOutcome<Assignment>> {
        self.faults.enter("insert_assignment_if_absent").await?;
        self.inner.insert_assignment_if_absent(assignment).await
    }

    async fn get_assignment(&self, experiment_id: &str, user_id: &str) -> Result<Option<Assignment>> {
        self.faults.enter("get_assignment").await?;
        self.inner.get_assignment(experiment_id, user_id).await
    }

    async fn complete_assignment(&self, experiment_id: &str, user_id: &str) -> Result<bool> {
        self.faults.enter("complete_assignment").await?;
        self.inner.complete_assignment(experiment_id, user_id).await
    }

    async fn list_assignments(&self, experiment_id: &str) -> Result<Vec<Assignment>> {
        self.faults.enter("list_assignments").await?;
        self.inner.list_assignments(experiment_id).await
    }

    async fn append_event(&self, event: Event) -> Result<()> {
        self.faults.enter("append_event").await?;
        self.inner.append_event(event).await
    }

    async fn list_events(&self, experiment_id: &str, filter: &EventFilter) -> Result<Vec<Event>> {
        self.faults.enter("list_events").await?;
        self.inner.list_events(experiment_id, filter).await
    }

    async fn append_results(&self, experiment_id: &str, rows: Vec<ResultRecord>) -> Result<()> {
        self.faults.enter("append_results").await?;
        self.inner.append_results(experiment_id, rows).await
    }

    async fn latest_results(&self, experiment_id: &str) -> Result<Vec<ResultRecord>> {
        self.faults.enter("latest_results").await?;
        self.inner.latest_results(experiment_id).await
    }

    async fn update_latest_significance(
        &self,
        experiment_id: &str,
        writes: Vec<SignificanceWrite>,
    ) -> Result<()> {
        self.faults.enter("update_latest_significance").await?;
        self.inner
            .update_latest_significance(experiment_id, writes)
            .await
    }

    async fn ping(&self) -> Result<()> {
        self.faults.enter("ping").await
    }
}

#[derive(Debug, Default)]
struct FlakyMetricStore {
    inner: MemoryMetricStore,
    faults: Faults,
}

impl MetricStore for FlakyMetricStore {
    async fn incr_field(&self, key: &str, field: &str, delta: f64) -> Result<f64> {
        self.faults.enter("incr_field").await?;
        self.inner.incr_field(key, field, delta).await
    }

    async fn incr_fields(&self, key: &str, deltas: &[(&str, f64)]) -> Result<()> {
        self.faults.enter("incr_fields").await?;
        self.inner.incr_fields(key, deltas).await
    }

    async fn get_all(&self, key: &str) -> Result<BTreeMap<String, f64>> {
        self.faults.enter("get_all").await?;
        self.inner.get_all(key).await
    }

    async fn delete_prefix(&self, prefix: &str) -> Result<usize> {
        self.faults.enter("delete_prefix").await?;
        self.inner.delete_prefix(prefix).await
    }

    async fn ping(&self) -> Result<()> {
        self.faults.enter("ping").await
    }
}

type Manager = ExperimentManager<FlakyRepository, FlakyMetricStore>;

fn manager_with(config: EngineConfig) -> (Manager, Arc<FlakyRepository>, Arc<FlakyMetricStore>) {
    let repo = Arc::new(FlakyRepository::default());
    let store = Arc::new(FlakyMetricStore::default());
    let manager = ExperimentManager::new(Arc::clone(&repo), Arc::clone(&store), config);
    (manager, repo, store)
}

fn fast_ticks() -> EngineConfig {
    EngineConfig::builder()
        .tick_interval(Duration::from_millis(10))
        .max_backoff(Duration::from_millis(40))
        .build()
        .unwrap()
}

fn spec() -> ExperimentSpec {
    ExperimentSpec::builder("outage")
        .variant(Variant::new("control", 0.5))
        .variant(Variant::new("treatment", 0.5))
        .metric(Metric::new("revenue", MetricType::Numerical).primary())
        .metric(Metric::new("plan", MetricType::Categorical))
        .build()
}

fn purchase(experiment_id: &str, value: f64) -> Event {
    Event::builder(experiment_id, "u", "control", "purchase")
        .value(value)
        .build()
}

#[tokio::test]
async fn test_assign_surfaces_transient_store_error() {
    let (manager, repo, _) = manager_with(EngineConfig::default());
    let id = manager.create(spec()).await.unwrap().id().to_string();
    manager.start(&id).await.unwrap();

    repo.faults.fail("insert_assignment_if_absent");
    let err = manager.assign(&id, "u1").await.unwrap_err();
    assert!(err.is_transient(), "{err}");
    assert_eq!(repo.inner.assignment_count(), 0);

    repo.faults.heal();
    manager.assign(&id, "u1").await.unwrap();
    assert_eq!(repo.inner.assignment_count(), 1);
    manager.shutdown().await;
}

#[tokio::test]
async fn test_track_event_surfaces_transient_store_error() {
    let (manager, _, store) = manager_with(EngineConfig::default());
    let id = manager.create(spec()).await.unwrap().id().to_string();
    manager.start(&id).await.unwrap();

    store.faults.fail(EVERY_OPERATION);
    let err = manager.track_event(purchase(&id, 5.0)).await.unwrap_err();
    assert!(err.is_transient(), "{err}");

    store.faults.heal();
    manager.track_event(purchase(&id, 5.0)).await.unwrap();
    let key = MetricKey::new(&id, "control", "revenue");
    let counters = store.inner.get_all(&key.counters()).await.unwrap();
    assert_eq!(counters.get(FIELD_COUNT), Some(&1.0));
    manager.shutdown().await;
}

#[tokio::test]
async fn test_failed_event_append_leaves_counters_untouched() {
    let (manager, repo, store) = manager_with(EngineConfig::default());
    let id = manager.create(spec()).await.unwrap().id().to_string();
    manager.start(&id).await.unwrap();

    repo.faults.fail("append_event");
    let err = manager.track_event(purchase(&id, 5.0)).await.unwrap_err();
    assert!(err.is_transient(), "{err}");

    let key = MetricKey::new(&id, "control", "revenue");
    let counters = store.inner.get_all(&key.counters()).await.unwrap();
    assert_eq!(counters.get(FIELD_COUNT), Some(&0.0));
    let plan = store
        .inner
        .get_all(&MetricKey::new(&id, "control", "plan").categories())
        .await
        .unwrap();
    assert!(plan.is_empty());
    manager.shutdown().await;
}

#[tokio::test]
async fn test_stalled_stores_time_out() {
    let config = EngineConfig::builder()
        .store_timeout(Duration::from_millis(50))
        .build()
        .unwrap();
    let (manager, repo, store) = manager_with(config);
    let id = manager.create(spec()).await.unwrap().id().to_string();
    manager.start(&id).await.unwrap();

    repo.faults.stall("insert_assignment_if_absent");
    let began = Instant::now();
    let err = manager.assign(&id, "u1").await.unwrap_err();
    assert!(matches!(err, Error::TransientStore(_)), "{err}");
    assert!(began.elapsed() < STALL);

    store.faults.stall("incr_fields");
    let err = manager.track_event(purchase(&id, 1.0)).await.unwrap_err();
    assert!(matches!(err, Error::TransientStore(_)), "{err}");
    manager.shutdown().await;
}

#[tokio::test]
async fn test_failed_start_leaves_experiment_in_draft() {
    let (manager, _, store) = manager_with(fast_ticks());
    let id = manager.create(spec()).await.unwrap().id().to_string();

    store.faults.fail("incr_fields");
    let err = manager.start(&id).await.unwrap_err();
    assert!(err.is_transient(), "{err}");
    assert_eq!(manager.get(&id).await.unwrap().status(), ExperimentStatus::Draft);
    assert!(!manager.scheduler().is_active(&id));

    store.faults.heal();
    let started = manager.start(&id).await.unwrap();
    assert_eq!(started.status(), ExperimentStatus::Running);
    assert!(manager.scheduler().is_active(&id));
    manager.shutdown().await;
}

#[tokio::test]
async fn test_failed_pass_commits_no_partial_snapshot() {
    let (manager, repo, _) = manager_with(EngineConfig::default());
    let id = manager.create(spec()).await.unwrap().id().to_string();
    repo.faults.fail("append_results");
    manager.start(&id).await.unwrap();
    manager.track_event(purchase(&id, 3.0)).await.unwrap();

    let err = manager.refresh(&id).await.unwrap_err();
    assert!(err.is_transient(), "{err}");
    assert_eq!(repo.inner.result_row_count(&id), 0);

    repo.faults.heal();
    manager.refresh(&id).await.unwrap();
    // 2 variants x 2 metrics, written together
    assert_eq!(repo.inner.result_row_count(&id), 4);
    manager.shutdown().await;
}

#[tokio::test]
async fn test_failed_significance_batch_writes_nothing() {
    let (manager, repo, _) = manager_with(EngineConfig::default());
    let id = manager.create(spec()).await.unwrap().id().to_string();
    repo.faults.fail("update_latest_significance");
    manager.start(&id).await.unwrap();
    for value in [1.0, 2.0, 3.0] {
        manager.track_event(purchase(&id, value)).await.unwrap();
    }

    assert!(manager.refresh(&id).await.unwrap_err().is_transient());
    let current = repo.inner.latest_results(&id).await.unwrap();
    assert!(current.iter().all(|r| r.confidence_interval().is_none()));

    repo.faults.heal();
    manager.refresh(&id).await.unwrap();
    let current = repo.inner.latest_results(&id).await.unwrap();
    let control = current
        .iter()
        .find(|r| r.variant_name() == "control" && r.metric_name() == "revenue")
        .unwrap();
    assert!(control.confidence_interval().is_some());
    manager.shutdown().await;
}

#[tokio::test]
async fn test_scheduler_recovers_after_store_outage() {
    let (manager, repo, _) = manager_with(fast_ticks());
    let id = manager.create(spec()).await.unwrap().id().to_string();
    repo.faults.fail("append_results");
    manager.start(&id).await.unwrap();
    manager.track_event(purchase(&id, 2.0)).await.unwrap();

    tokio::time::sleep(Duration::from_millis(150)).await;
    assert_eq!(repo.inner.result_row_count(&id), 0);
    assert!(manager.scheduler().is_active(&id));

    repo.faults.heal();
    tokio::time::sleep(Duration::from_millis(200)).await;
    assert!(repo.inner.result_row_count(&id) >= 4);
    assert!(manager.scheduler().is_active(&id));

    let report = manager.results(&id).await.unwrap();
    let control = report
        .results
        .iter()
        .find(|r| r.variant_name() == "control" && r.metric_name() == "revenue")
        .unwrap();
    assert_eq!(control.sample_size(), 1);
    manager.shutdown().await;
}

#[tokio::test]
async fn test_delete_during_tick_leaves_no_rows() {
    let (manager, repo, store) = manager_with(fast_ticks());
    let id = manager.create(spec()).await.unwrap().id().to_string();
    repo.faults.stall("append_results");
    manager.start(&id).await.unwrap();

    // The first tick is now parked inside append_results
    tokio::time::sleep(Duration::from_millis(50)).await;
    manager.delete(&id).await.unwrap();

    assert!(!manager.scheduler().is_active(&id));
    assert_eq!(repo.inner.result_row_count(&id), 0);
    assert!(repo.inner.is_empty());
    assert!(store.inner.is_empty());

    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(repo.inner.result_row_count(&id), 0);
}

#[tokio::test]
async fn test_health_reports_degraded_store() {
    let (manager, _, store) = manager_with(EngineConfig::default());

    store.faults.fail("ping");
    let health = manager.health().await;
    assert_eq!(health.status, HealthStatus::Degraded);
    assert!(health.repository_ok);
    assert!(!health.metric_store_ok);

    store.faults.heal();
    assert_eq!(manager.health().await.status, HealthStatus::Healthy);
}
