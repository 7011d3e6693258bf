//! Experiment Scheduler - one cancellable task per running experiment
//!
//! Each task loops: run a tick, then sleep until the next one. The sleep is
//! raced against the experiment's cancellation token, and the token is also
//! checked before every tick, so a cancelled experiment never starts another
//! pass.
//!
//! Tick failures do not end the task. Transient errors back off
//! exponentially (`tick × 2^failures`, capped); the first success resets the
//! delay. A `NotFound` for the experiment itself ends the task.

use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::Result;

/// What the scheduler should do after a tick.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TickOutcome {
    /// Sleep and tick again
    Continue,
    /// The experiment left `running`; end the task
    Stop,
}

/// Periodic work for one experiment.
pub trait ExperimentTick: Clone + Send + Sync + 'static {
    /// Run one pass for `experiment_id`.
    fn tick(&self, experiment_id: &str) -> impl Future<Output = Result<TickOutcome>> + Send;
}

#[derive(Debug)]
struct ScheduledTask {
    generation: u64,
    token: CancellationToken,
    handle: JoinHandle<()>,
}

/// Delay before the next tick after `failures` consecutive failures.
#[must_use]
pub fn backoff_delay(tick_interval: Duration, max_backoff: Duration, failures: u32) -> Duration {
    tick_interval
        .saturating_mul(2_u32.saturating_pow(failures))
        .min(max_backoff.max(tick_interval))
}

/// Registry of live scheduler tasks keyed by experiment id.
#[derive(Debug, Clone)]
pub struct SchedulerRegistry {
    tasks: Arc<DashMap<String, ScheduledTask>>,
    generations: Arc<AtomicU64>,
    tick_interval: Duration,
    max_backoff: Duration,
}

impl SchedulerRegistry {
    /// Create an empty registry.
    #[must_use]
    pub fn new(tick_interval: Duration, max_backoff: Duration) -> Self {
        Self {
            tasks: Arc::new(DashMap::new()),
            generations: Arc::new(AtomicU64::new(0)),
            tick_interval,
            max_backoff,
        }
    }

    /// Spawn the task for `experiment_id` unless a live one exists.
    ///
    /// Returns `false` if a task was already running.
    pub fn spawn<T: ExperimentTick>(&self, experiment_id: &str, ticker: T) -> bool {
        match self.tasks.entry(experiment_id.to_string()) {
            Entry::Occupied(mut occupied) => {
                if !occupied.get().handle.is_finished() {
                    return false;
                }
                occupied.insert(self.launch(experiment_id, ticker));
            }
            Entry::Vacant(vacant) => {
                vacant.insert(self.launch(experiment_id, ticker));
            }
        }
        info!(experiment_id, "Scheduler task spawned");
        true
    }

    fn launch<T: ExperimentTick>(&self, experiment_id: &str, ticker: T) -> ScheduledTask {
        let generation = self.generations.fetch_add(1, Ordering::Relaxed);
        let token = CancellationToken::new();
        let handle = tokio::spawn(run_loop(
            experiment_id.to_string(),
            ticker,
            token.clone(),
            self.tick_interval,
            self.max_backoff,
            Arc::clone(&self.tasks),
            generation,
        ));
        ScheduledTask {
            generation,
            token,
            handle,
        }
    }

    /// Signal the task to stop. Does not wait for an in-flight tick, so it is
    /// safe to call from inside that tick.
    ///
    /// Returns `false` if no task was registered.
    pub fn cancel(&self, experiment_id: &str) -> bool {
        match self.tasks.remove(experiment_id) {
            Some((_, task)) => {
                task.token.cancel();
                info!(experiment_id, "Scheduler task cancelled");
                true
            }
            None => false,
        }
    }

    /// Signal the task to stop and wait for any in-flight tick to finish.
    ///
    /// Must not be called from inside the task's own tick.
    ///
    /// Returns `false` if no task was registered.
    pub async fn stop(&self, experiment_id: &str) -> bool {
        let Some((_, task)) = self.tasks.remove(experiment_id) else {
            return false;
        };
        task.token.cancel();
        if let Err(e) = task.handle.await {
            error!(experiment_id, error = %e, "Scheduler task panicked");
        }
        info!(experiment_id, "Scheduler task stopped");
        true
    }

    /// Whether a live task exists for the experiment.
    #[must_use]
    pub fn is_active(&self, experiment_id: &str) -> bool {
        self.tasks
            .get(experiment_id)
            .is_some_and(|task| !task.handle.is_finished())
    }

    /// Number of live tasks.
    #[must_use]
    pub fn active_count(&self) -> usize {
        self.tasks
            .iter()
            .filter(|task| !task.handle.is_finished())
            .count()
    }

    /// Cancel every task and wait for them to exit.
    pub async fn shutdown(&self) {
        let ids: Vec<String> = self.tasks.iter().map(|task| task.key().clone()).collect();
        for id in ids {
            self.stop(&id).await;
        }
    }
}

async fn run_loop<T: ExperimentTick>(
    experiment_id: String,
    ticker: T,
    token: CancellationToken,
    tick_interval: Duration,
    max_backoff: Duration,
    tasks: Arc<DashMap<String, ScheduledTask>>,
    generation: u64,
) {
    let mut failures: u32 = 0;

    loop {
        if token.is_cancelled() {
            debug!(experiment_id = %experiment_id, "Scheduler observed cancellation");
            break;
        }

        match ticker.tick(&experiment_id).await {
            Ok(TickOutcome::Continue) => failures = 0,
            Ok(TickOutcome::Stop) => break,
            Err(e) if e.is_not_found() => {
                error!(experiment_id = %experiment_id, error = %e, "Experiment vanished, stopping scheduler");
                break;
            }
            Err(e) => {
                failures = failures.saturating_add(1);
                warn!(
                    experiment_id = %experiment_id,
                    error = %e,
                    failures,
                    "Scheduler tick failed, retrying"
                );
            }
        }

        let delay = backoff_delay(tick_interval, max_backoff, failures);
        tokio::select! {
            () = token.cancelled() => break,
            () = tokio::time::sleep(delay) => {}
        }
    }

    // A resume may already have registered a newer task under the same id.
    tasks.remove_if(&experiment_id, |_, task| task.generation == generation);
    debug!(experiment_id = %experiment_id, "Scheduler task exited");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::Error;
    use std::sync::atomic::AtomicUsize;

    #[derive(Clone, Copy)]
    enum Failure {
        None,
        NotFound,
        Transient,
    }

    #[derive(Clone)]
    struct Counting {
        ticks: Arc<AtomicUsize>,
        stop_after: usize,
        fail_with: Failure,
    }

    impl Counting {
        fn new(stop_after: usize) -> Self {
            Self {
                ticks: Arc::new(AtomicUsize::new(0)),
                stop_after,
                fail_with: Failure::None,
            }
        }
    }

    impl ExperimentTick for Counting {
        async fn tick(&self, _experiment_id: &str) -> Result<TickOutcome> {
            let n = self.ticks.fetch_add(1, Ordering::SeqCst) + 1;
            match self.fail_with {
                Failure::None => {}
                Failure::NotFound => return Err(Error::NotFound("experiment gone".into())),
                Failure::Transient => return Err(Error::TransientStore("redis down".into())),
            }
            Ok(if n >= self.stop_after {
                TickOutcome::Stop
            } else {
                TickOutcome::Continue
            })
        }
    }

    fn registry() -> SchedulerRegistry {
        SchedulerRegistry::new(Duration::from_millis(10), Duration::from_millis(40))
    }

    #[test]
    fn test_backoff_delay() {
        let tick = Duration::from_secs(60);
        let cap = Duration::from_secs(600);
        assert_eq!(backoff_delay(tick, cap, 0), tick);
        assert_eq!(backoff_delay(tick, cap, 1), Duration::from_secs(120));
        assert_eq!(backoff_delay(tick, cap, 3), Duration::from_secs(480));
        assert_eq!(backoff_delay(tick, cap, 4), cap);
        assert_eq!(backoff_delay(tick, cap, 200), cap);
    }

    #[tokio::test]
    async fn test_task_stops_on_stop_outcome() {
        let registry = registry();
        let ticker = Counting::new(3);
        assert!(registry.spawn("exp", ticker.clone()));

        tokio::time::sleep(Duration::from_millis(200)).await;
        assert_eq!(ticker.ticks.load(Ordering::SeqCst), 3);
        assert!(!registry.is_active("exp"));
        assert_eq!(registry.active_count(), 0);
    }

    #[tokio::test]
    async fn test_cancel_stops_ticking() {
        let registry = registry();
        let ticker = Counting::new(usize::MAX);
        assert!(registry.spawn("exp", ticker.clone()));
        assert!(!registry.spawn("exp", ticker.clone()));

        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(registry.cancel("exp"));
        assert!(!registry.cancel("exp"));

        // Let an in-flight tick (if any) finish, then the count must freeze.
        tokio::time::sleep(Duration::from_millis(20)).await;
        let frozen = ticker.ticks.load(Ordering::SeqCst);
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(ticker.ticks.load(Ordering::SeqCst), frozen);
        assert!(!registry.is_active("exp"));
    }

    #[tokio::test]
    async fn test_not_found_ends_task() {
        let registry = registry();
        let mut ticker = Counting::new(usize::MAX);
        ticker.fail_with = Failure::NotFound;
        registry.spawn("exp", ticker.clone());

        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(ticker.ticks.load(Ordering::SeqCst), 1);
        assert!(!registry.is_active("exp"));
    }

    #[tokio::test]
    async fn test_transient_errors_keep_task_alive() {
        let registry = registry();
        let mut ticker = Counting::new(usize::MAX);
        ticker.fail_with = Failure::Transient;
        registry.spawn("exp", ticker.clone());

        tokio::time::sleep(Duration::from_millis(200)).await;
        let ticks = ticker.ticks.load(Ordering::SeqCst);
        // Backoff caps at 40ms, so several retries fit in 200ms.
        assert!(ticks >= 3, "only {ticks} ticks");
        assert!(registry.is_active("exp"));
        registry.shutdown().await;
        assert_eq!(registry.active_count(), 0);
    }

    #[tokio::test]
    async fn test_respawn_after_cancel() {
        let registry = registry();
        let first = Counting::new(usize::MAX);
        registry.spawn("exp", first.clone());
        registry.cancel("exp");

        let second = Counting::new(usize::MAX);
        assert!(registry.spawn("exp", second.clone()));
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(registry.is_active("exp"));
        assert!(second.ticks.load(Ordering::SeqCst) >= 1);
        registry.shutdown().await;
    }

    #[derive(Clone)]
    struct Slow {
        started: Arc<AtomicUsize>,
        finished: Arc<AtomicUsize>,
    }

    impl ExperimentTick for Slow {
        async fn tick(&self, _experiment_id: &str) -> Result<TickOutcome> {
            self.started.fetch_add(1, Ordering::SeqCst);
            tokio::time::sleep(Duration::from_millis(60)).await;
            self.finished.fetch_add(1, Ordering::SeqCst);
            Ok(TickOutcome::Continue)
        }
    }

    #[tokio::test]
    async fn test_stop_waits_for_in_flight_tick() {
        let registry = registry();
        let ticker = Slow {
            started: Arc::new(AtomicUsize::new(0)),
            finished: Arc::new(AtomicUsize::new(0)),
        };
        registry.spawn("exp", ticker.clone());

        // First tick is mid-sleep
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(ticker.started.load(Ordering::SeqCst), 1);
        assert!(registry.stop("exp").await);

        assert_eq!(ticker.finished.load(Ordering::SeqCst), 1);
        assert!(!registry.is_active("exp"));
        assert!(!registry.stop("exp").await);

        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(ticker.started.load(Ordering::SeqCst), 1);
    }
}
