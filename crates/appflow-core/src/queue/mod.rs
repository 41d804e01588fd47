//! Durable transition job queue.
//!
//! [`JobQueue`] is the contract the worker and pool rely on: durable
//! enqueue, one-worker-at-a-time delivery, delayed re-delivery with an
//! updated payload, acknowledgement, and retry-or-dead-letter on failure.
//! [`RedbQueue`] implements it on a local redb file.

pub mod db;
pub mod job;
pub mod retry;

pub use db::RedbQueue;
pub use job::{
    DelayReason, Delivery, DeliveryToken, FailDisposition, JobId, JobRecord, JobState,
    TransitionJob,
};
pub use retry::RetryPolicy;

use crate::error::Result;
use crate::types::ApplicationStatus;
use chrono::{DateTime, Utc};
use std::time::Duration;

pub trait JobQueue: Send + Sync {
    /// Persist a new job, ready for immediate delivery.
    fn enqueue(&self, job: TransitionJob) -> Result<JobId>;

    /// Lease the earliest job that is due by `now`, if any.
    fn dequeue(&self, now: DateTime<Utc>) -> Result<Option<Delivery>>;

    /// Park the delivered job for `delay` and store its updated payload.
    fn delay(&self, token: &DeliveryToken, delay: Duration, job: &TransitionJob) -> Result<()>;

    /// Acknowledge the delivery with the committed status and the job's
    /// final payload.
    fn complete(
        &self,
        token: &DeliveryToken,
        job: &TransitionJob,
        status: ApplicationStatus,
    ) -> Result<()>;

    /// Record a failed execution. Permanent failures are dead-lettered at
    /// once; transient ones are retried until the policy runs out.
    fn fail(&self, token: &DeliveryToken, error: &str, permanent: bool)
        -> Result<FailDisposition>;

    /// Set the reviewer of record, once. Re-attaching the same reviewer is
    /// a no-op; a different one is refused.
    fn attach_reviewer(&self, id: JobId, reviewer_id: &str, resume_now: bool) -> Result<()>;

    /// Return jobs whose lease ran out before `now` to the ready set.
    fn requeue_expired(&self, now: DateTime<Utc>) -> Result<u32>;

    fn get(&self, id: JobId) -> Result<JobRecord>;

    /// All jobs, newest first.
    fn list(&self) -> Result<Vec<JobRecord>>;

    fn dead_letters(&self) -> Result<Vec<JobRecord>>;

    /// Put a dead-lettered job back in the ready set with a fresh budget.
    fn retry_dead(&self, id: JobId) -> Result<()>;

    /// Remove a dead-lettered job for good.
    fn purge(&self, id: JobId) -> Result<()>;
}
