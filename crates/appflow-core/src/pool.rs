//! Worker pool.
//!
//! A fixed number of lanes pull jobs from the queue. Before each dequeue a
//! lane waits on a shared `governor` limiter so the store sees at most
//! `max_jobs_per_window` starts per window. Queue and store calls block on
//! redb, so they run on tokio's blocking pool; a lane waiting for review or
//! backoff holds nothing, because delayed jobs simply are not due yet.

use std::num::NonZeroU32;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use governor::{DefaultDirectRateLimiter, Quota, RateLimiter};
use serde::Serialize;
use tokio::sync::watch;
use tokio::task::JoinSet;
use tracing::{debug, error, info, warn};

use crate::config::PoolConfig;
use crate::queue::{Delivery, JobQueue};
use crate::store::EntityStore;
use crate::worker::{JobOutcome, TransitionWorker};

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct PoolStats {
    pub processed: u64,
    pub committed: u64,
    pub delayed: u64,
    pub rejected: u64,
    pub retrying: u64,
    pub dead_lettered: u64,
    /// Deliveries that could not be settled with the queue.
    pub errors: u64,
    /// Expired leases returned to the ready set.
    pub recovered: u64,
}

impl PoolStats {
    fn record(&mut self, outcome: &JobOutcome) {
        self.processed += 1;
        match outcome {
            JobOutcome::Committed { .. } => self.committed += 1,
            JobOutcome::Delayed { .. } => self.delayed += 1,
            JobOutcome::Rejected { .. } => self.rejected += 1,
            JobOutcome::Retrying { .. } => self.retrying += 1,
            JobOutcome::DeadLettered { .. } => self.dead_lettered += 1,
        }
    }

    fn absorb(&mut self, other: PoolStats) {
        self.processed += other.processed;
        self.committed += other.committed;
        self.delayed += other.delayed;
        self.rejected += other.rejected;
        self.retrying += other.retrying;
        self.dead_lettered += other.dead_lettered;
        self.errors += other.errors;
        self.recovered += other.recovered;
    }
}

/// One start per `window / max_jobs_per_window`, with no burst, so any
/// window-long span admits at most `max_jobs_per_window` starts.
fn build_limiter(config: &PoolConfig) -> DefaultDirectRateLimiter {
    let max = NonZeroU32::new(config.max_jobs_per_window).unwrap_or(NonZeroU32::MIN);
    let period = config.window() / max.get();
    let quota = Quota::with_period(period).unwrap_or_else(|| Quota::per_second(max));
    RateLimiter::direct(quota)
}

pub struct WorkerPool<S, Q> {
    worker: TransitionWorker<S, Q>,
    queue: Arc<Q>,
    config: PoolConfig,
    limiter: Arc<DefaultDirectRateLimiter>,
}

impl<S, Q> WorkerPool<S, Q>
where
    S: EntityStore + 'static,
    Q: JobQueue + 'static,
{
    pub fn new(worker: TransitionWorker<S, Q>, queue: Arc<Q>, config: PoolConfig) -> Self {
        let limiter = Arc::new(build_limiter(&config));
        Self {
            worker,
            queue,
            config,
            limiter,
        }
    }

    /// Serve until `shutdown` turns true (or its sender is dropped). Lanes
    /// finish the job in hand before stopping.
    pub async fn run(&self, shutdown: watch::Receiver<bool>) -> PoolStats {
        self.run_lanes(Some(shutdown)).await
    }

    /// Process every job that is due now, then return.
    pub async fn run_until_idle(&self) -> PoolStats {
        self.run_lanes(None).await
    }

    fn lane(&self, id: usize) -> Lane<S, Q> {
        Lane {
            id,
            worker: self.worker.clone(),
            queue: self.queue.clone(),
            limiter: self.limiter.clone(),
            poll: self.config.poll_interval(),
        }
    }

    async fn run_lanes(&self, shutdown: Option<watch::Receiver<bool>>) -> PoolStats {
        let mut stats = PoolStats::default();
        stats.recovered += self.lane(0).recover().await;

        let lanes = self.config.concurrency.max(1);
        info!(lanes, "worker pool started");
        let mut set = JoinSet::new();
        for id in 0..lanes {
            set.spawn(self.lane(id).run(shutdown.clone()));
        }
        while let Some(joined) = set.join_next().await {
            match joined {
                Ok(lane_stats) => stats.absorb(lane_stats),
                Err(e) => error!(error = %e, "worker lane panicked"),
            }
        }

        info!(
            processed = stats.processed,
            committed = stats.committed,
            delayed = stats.delayed,
            rejected = stats.rejected,
            dead_lettered = stats.dead_lettered,
            "worker pool stopped"
        );
        stats
    }
}

struct Lane<S, Q> {
    id: usize,
    worker: TransitionWorker<S, Q>,
    queue: Arc<Q>,
    limiter: Arc<DefaultDirectRateLimiter>,
    poll: Duration,
}

impl<S, Q> Lane<S, Q>
where
    S: EntityStore + 'static,
    Q: JobQueue + 'static,
{
    async fn run(self, mut shutdown: Option<watch::Receiver<bool>>) -> PoolStats {
        let mut stats = PoolStats::default();
        loop {
            if let Some(rx) = &shutdown {
                if *rx.borrow() {
                    break;
                }
            }

            // Take the start slot before the lease, so a lane held back by
            // the limiter holds no job.
            self.limiter.until_ready().await;
            if let Some(delivery) = self.next_delivery(&mut stats).await {
                self.process(delivery, &mut stats).await;
                continue;
            }

            // Idle.
            let Some(rx) = shutdown.as_mut() else {
                break;
            };
            if self.id == 0 {
                stats.recovered += self.recover().await;
            }
            tokio::select! {
                _ = tokio::time::sleep(self.poll) => {}
                changed = rx.changed() => {
                    if changed.is_err() {
                        break;
                    }
                }
            }
        }
        debug!(lane = self.id, processed = stats.processed, "lane finished");
        stats
    }

    async fn next_delivery(&self, stats: &mut PoolStats) -> Option<Delivery> {
        let queue = self.queue.clone();
        match tokio::task::spawn_blocking(move || queue.dequeue(Utc::now())).await {
            Ok(Ok(delivery)) => delivery,
            Ok(Err(e)) => {
                warn!(lane = self.id, error = %e, "dequeue failed");
                stats.errors += 1;
                None
            }
            Err(e) => {
                error!(lane = self.id, error = %e, "dequeue task failed");
                stats.errors += 1;
                None
            }
        }
    }

    async fn process(&self, delivery: Delivery, stats: &mut PoolStats) {
        let worker = self.worker.clone();
        let job_id = delivery.token.job_id;
        match tokio::task::spawn_blocking(move || worker.process(delivery)).await {
            Ok(Ok(report)) => stats.record(&report.outcome),
            Ok(Err(e)) => {
                warn!(%job_id, error = %e, "could not settle job with the queue");
                stats.errors += 1;
            }
            Err(e) => {
                error!(%job_id, error = %e, "worker task failed");
                stats.errors += 1;
            }
        }
    }

    async fn recover(&self) -> u64 {
        let queue = self.queue.clone();
        match tokio::task::spawn_blocking(move || queue.requeue_expired(Utc::now())).await {
            Ok(Ok(n)) => u64::from(n),
            Ok(Err(e)) => {
                warn!(error = %e, "lease recovery failed");
                0
            }
            Err(e) => {
                error!(error = %e, "lease recovery task failed");
                0
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ReviewConfig;
    use crate::notify::ChangeNotifier;
    use crate::queue::{RedbQueue, RetryPolicy, TransitionJob};
    use crate::store::RedbStore;
    use crate::types::{Actor, Application, ApplicationStatus, Role};
    use std::time::Instant;
    use tempfile::TempDir;

    struct Setup {
        _dir: TempDir,
        store: Arc<RedbStore>,
        queue: Arc<RedbQueue>,
        pool: WorkerPool<RedbStore, RedbQueue>,
        apps: Vec<Application>,
    }

    fn setup(apps: usize, config: PoolConfig) -> Setup {
        let dir = TempDir::new().unwrap();
        let store = Arc::new(RedbStore::open(&dir.path().join("store.redb")).unwrap());
        let queue = Arc::new(
            RedbQueue::open(
                &dir.path().join("queue.redb"),
                RetryPolicy::default(),
                config.lease(),
            )
            .unwrap(),
        );
        let provider = Actor::new("Acme", Role::Provider);
        store.insert_actor(&provider).unwrap();

        let mut created = Vec::new();
        for i in 0..apps {
            let app = Application::new(format!("app-{i}"), &provider.id);
            store.insert_application(&app).unwrap();
            queue
                .enqueue(TransitionJob::new(
                    &app.id,
                    ApplicationStatus::Pending,
                    &provider.id,
                ))
                .unwrap();
            created.push(app);
        }

        let worker = TransitionWorker::new(
            store.clone(),
            queue.clone(),
            Arc::new(ChangeNotifier::new(64)),
            ReviewConfig::default(),
        );
        let pool = WorkerPool::new(worker, queue.clone(), config);
        Setup {
            _dir: dir,
            store,
            queue,
            pool,
            apps: created,
        }
    }

    #[tokio::test]
    async fn drains_every_ready_job() {
        let config = PoolConfig {
            concurrency: 3,
            max_jobs_per_window: 100,
            ..PoolConfig::default()
        };
        let s = setup(7, config);

        let stats = s.pool.run_until_idle().await;
        assert_eq!(stats.processed, 7);
        assert_eq!(stats.committed, 7);
        assert_eq!(stats.errors, 0);
        for app in &s.apps {
            assert_eq!(
                s.store.get_application(&app.id).unwrap().status,
                ApplicationStatus::Pending
            );
        }
        assert!(s.queue.dequeue(Utc::now()).unwrap().is_none());
    }

    #[tokio::test]
    async fn idle_pool_returns_immediately() {
        let s = setup(0, PoolConfig::default());
        assert_eq!(s.pool.run_until_idle().await, PoolStats::default());
    }

    #[tokio::test]
    async fn job_starts_are_rate_limited() {
        let config = PoolConfig {
            concurrency: 4,
            max_jobs_per_window: 2,
            window_ms: 200,
            ..PoolConfig::default()
        };
        let s = setup(6, config);

        let started = Instant::now();
        let stats = s.pool.run_until_idle().await;
        assert_eq!(stats.committed, 6);
        // One start per 100ms slot, however many lanes are waiting.
        assert!(
            started.elapsed() >= Duration::from_millis(450),
            "took {:?}",
            started.elapsed()
        );
    }

    #[tokio::test]
    async fn lane_waiting_for_a_slot_holds_no_lease() {
        let config = PoolConfig {
            concurrency: 1,
            max_jobs_per_window: 1,
            window_ms: 1000,
            ..PoolConfig::default()
        };
        let s = setup(2, config);

        let drain = s.pool.run_until_idle();
        let inspect = async {
            tokio::time::sleep(Duration::from_millis(300)).await;
            s.queue
                .list()
                .unwrap()
                .iter()
                .map(|r| r.state.label())
                .collect::<Vec<_>>()
        };
        let (stats, labels) = tokio::join!(drain, inspect);

        assert_eq!(stats.committed, 2);
        assert!(!labels.contains(&"active"), "states: {labels:?}");
        assert!(labels.contains(&"queued"), "states: {labels:?}");
    }

    #[test]
    fn limiter_has_no_burst() {
        let limiter = build_limiter(&PoolConfig::default());
        assert!(limiter.check().is_ok());
        assert!(limiter.check().is_err());
    }

    #[tokio::test]
    async fn window_admits_at_most_max_starts() {
        let config = PoolConfig {
            max_jobs_per_window: 5,
            window_ms: 250,
            ..PoolConfig::default()
        };
        let limiter = build_limiter(&config);
        let started = Instant::now();
        let mut admitted = 0;
        loop {
            limiter.until_ready().await;
            if started.elapsed() >= Duration::from_millis(240) {
                break;
            }
            admitted += 1;
        }
        assert!(admitted <= 5, "admitted {admitted} starts in one window");
        assert!(admitted >= 3, "admitted only {admitted} starts");
    }

    #[tokio::test]
    async fn serve_mode_stops_on_shutdown() {
        let config = PoolConfig {
            concurrency: 2,
            poll_interval_ms: 20,
            ..PoolConfig::default()
        };
        let s = setup(3, config);
        let (tx, rx) = watch::channel(false);

        let serve = s.pool.run(rx);
        let stop = async {
            tokio::time::sleep(Duration::from_millis(800)).await;
            tx.send(true).unwrap();
        };
        let (stats, ()) = tokio::join!(serve, stop);
        assert_eq!(stats.committed, 3);
    }

    #[test]
    fn limiter_tolerates_zero_settings() {
        let config = PoolConfig {
            max_jobs_per_window: 0,
            window_ms: 0,
            ..PoolConfig::default()
        };
        assert!(build_limiter(&config).check().is_ok());
    }
}
