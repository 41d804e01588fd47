//! Process-scoped wiring of store, queue, notifier and workers.
//!
//! Submitting only enqueues. Nothing about the request is validated until
//! a worker executes it against the application's status at that time.

use std::path::Path;
use std::sync::Arc;

use tracing::info;

use crate::config::Config;
use crate::error::{AppflowError, Result};
use crate::notify::ChangeNotifier;
use crate::paths;
use crate::pool::WorkerPool;
use crate::queue::{JobId, JobQueue, RedbQueue, TransitionJob};
use crate::store::RedbStore;
use crate::transition;
use crate::types::{Application, ApplicationStatus, Role};
use crate::worker::TransitionWorker;

pub type Worker = TransitionWorker<RedbStore, RedbQueue>;
pub type Pool = WorkerPool<RedbStore, RedbQueue>;

pub struct Engine {
    config: Config,
    store: Arc<RedbStore>,
    queue: Arc<RedbQueue>,
    notifier: Arc<ChangeNotifier>,
}

impl Engine {
    /// Open the project at `root`. Fails with `NotInitialized` when there is
    /// no `.appflow/config.yaml`.
    pub fn open(root: &Path) -> Result<Self> {
        let config = Config::load(root)?;
        Self::with_config(root, config)
    }

    pub fn with_config(root: &Path, config: Config) -> Result<Self> {
        let store = RedbStore::open(&paths::store_path(root))?;
        let queue = RedbQueue::open(
            &paths::queue_path(root),
            config.retry.clone(),
            config.worker.lease(),
        )?;
        let notifier = ChangeNotifier::new(config.worker.notifier_capacity);
        Ok(Self {
            config,
            store: Arc::new(store),
            queue: Arc::new(queue),
            notifier: Arc::new(notifier),
        })
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn store(&self) -> &RedbStore {
        &self.store
    }

    pub fn queue(&self) -> &RedbQueue {
        &self.queue
    }

    pub fn notifier(&self) -> &Arc<ChangeNotifier> {
        &self.notifier
    }

    /// Create a draft application owned by `owner_id`, which must be a
    /// provider.
    pub fn create_application(&self, name: &str, owner_id: &str) -> Result<Application> {
        let owner = self.store.get_actor(owner_id)?;
        if owner.role != Role::Provider {
            return Err(AppflowError::NotAProvider(owner.id));
        }
        let app = Application::new(name, owner.id);
        self.store.insert_application(&app)?;
        Ok(app)
    }

    pub fn submit_transition(
        &self,
        entity_id: &str,
        requested_status: ApplicationStatus,
        requesting_user_id: &str,
        reviewer_id: Option<&str>,
    ) -> Result<JobId> {
        let mut job = TransitionJob::new(entity_id, requested_status, requesting_user_id);
        if let Some(reviewer) = reviewer_id {
            job = job.with_reviewer(reviewer);
        }
        let id = self.queue.enqueue(job)?;
        info!(job_id = %id, entity_id, %requested_status, "transition submitted");
        Ok(id)
    }

    /// Record `reviewer_id` as the co-signer of a pending job. With
    /// `resume_now` a job parked for review becomes due immediately instead
    /// of at the end of its review interval.
    pub fn attach_reviewer(&self, job_id: JobId, reviewer_id: &str, resume_now: bool) -> Result<()> {
        self.queue.attach_reviewer(job_id, reviewer_id, resume_now)
    }

    /// Statuses `actor_id` could move the application to right now. A
    /// provider who does not own the application gets none.
    pub fn available_statuses(
        &self,
        entity_id: &str,
        actor_id: &str,
    ) -> Result<Vec<ApplicationStatus>> {
        let app = self.store.get_application(entity_id)?;
        let actor = self.store.get_actor(actor_id)?;
        if actor.role == Role::Provider && app.owner_id != actor.id {
            return Ok(Vec::new());
        }
        Ok(transition::available_statuses(app.status, actor.role))
    }

    pub fn worker(&self) -> Worker {
        TransitionWorker::new(
            self.store.clone(),
            self.queue.clone(),
            self.notifier.clone(),
            self.config.review.clone(),
        )
    }

    pub fn pool(&self) -> Pool {
        WorkerPool::new(self.worker(), self.queue.clone(), self.config.worker.clone())
    }

    /// Release notification subscribers. Store and queue close on drop.
    pub fn shutdown(&self) {
        self.notifier.shutdown();
    }
}
