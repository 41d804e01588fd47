//! redb-backed job queue.
//!
//! # Table design
//!
//! `JOBS` maps the job id (`u128`) to the JSON-encoded [`JobRecord`].
//!
//! `READY` indexes runnable jobs with a 24-byte composite key:
//! ```text
//! [ ready_at_ms: u64 big-endian (8 bytes) | uuid: 16 bytes ]
//! ```
//! Byte order equals time order, so one range scan `..=due_upper_bound(now)`
//! yields every due job, earliest first. Delivery removes the index entry
//! and leases the record inside the same write transaction; redb admits one
//! writer at a time, so a job is never handed to two workers at once.

use std::path::Path;
use std::time::Duration;

use chrono::{DateTime, Utc};
use redb::{Database, ReadableTable, TableDefinition, WriteTransaction};
use tracing::{debug, warn};
use uuid::Uuid;

use crate::error::{AppflowError, Result};
use crate::types::ApplicationStatus;

use super::job::{
    DelayReason, Delivery, DeliveryToken, FailDisposition, JobId, JobRecord, JobState,
    TransitionJob,
};
use super::retry::RetryPolicy;
use super::JobQueue;

// ---------------------------------------------------------------------------
// Table definitions
// ---------------------------------------------------------------------------

const JOBS: TableDefinition<u128, &[u8]> = TableDefinition::new("jobs");
const READY: TableDefinition<&[u8], &[u8]> = TableDefinition::new("ready");

const EMPTY: &[u8] = &[];

// ---------------------------------------------------------------------------
// Key helpers
// ---------------------------------------------------------------------------

fn ready_key(ts: DateTime<Utc>, id: Uuid) -> [u8; 24] {
    let mut key = [0u8; 24];
    let ms = ts.timestamp_millis().max(0) as u64;
    key[..8].copy_from_slice(&ms.to_be_bytes());
    key[8..].copy_from_slice(id.as_bytes());
    key
}

/// Upper bound for a range scan returning every job due by `now`.
fn due_upper_bound(now: DateTime<Utc>) -> [u8; 24] {
    let mut key = [0u8; 24];
    let ms = now.timestamp_millis().max(0) as u64;
    key[..8].copy_from_slice(&ms.to_be_bytes());
    key[8..].fill(0xff);
    key
}

fn after(now: DateTime<Utc>, delay: Duration) -> DateTime<Utc> {
    chrono::Duration::from_std(delay)
        .ok()
        .and_then(|d| now.checked_add_signed(d))
        .unwrap_or(DateTime::<Utc>::MAX_UTC)
}

// ---------------------------------------------------------------------------
// Transaction helpers
// ---------------------------------------------------------------------------

fn load(wt: &WriteTransaction, id: JobId) -> Result<Option<JobRecord>> {
    let table = wt.open_table(JOBS)?;
    let record = match table.get(id.as_u128())? {
        Some(guard) => Some(serde_json::from_slice::<JobRecord>(guard.value())?),
        None => None,
    };
    Ok(record)
}

fn store(wt: &WriteTransaction, record: &JobRecord) -> Result<()> {
    let value = serde_json::to_vec(record)?;
    let mut table = wt.open_table(JOBS)?;
    table.insert(record.id.as_u128(), value.as_slice())?;
    Ok(())
}

fn index(wt: &WriteTransaction, record: &JobRecord) -> Result<()> {
    let key = ready_key(record.ready_at, record.id);
    let mut table = wt.open_table(READY)?;
    table.insert(key.as_slice(), EMPTY)?;
    Ok(())
}

fn unindex(wt: &WriteTransaction, record: &JobRecord) -> Result<()> {
    let key = ready_key(record.ready_at, record.id);
    let mut table = wt.open_table(READY)?;
    table.remove(key.as_slice())?;
    Ok(())
}

/// Move a runnable record to a new ready time, keeping the index in step.
fn reschedule(wt: &WriteTransaction, record: &mut JobRecord, at: DateTime<Utc>) -> Result<()> {
    unindex(wt, record)?;
    record.ready_at = at;
    index(wt, record)
}

// ---------------------------------------------------------------------------
// RedbQueue
// ---------------------------------------------------------------------------

pub struct RedbQueue {
    db: Database,
    retry: RetryPolicy,
    lease: Duration,
}

impl RedbQueue {
    /// Open or create the queue database at `path`.
    ///
    /// `lease` bounds how long a delivery stays exclusive before
    /// [`JobQueue::requeue_expired`] may hand the job out again.
    pub fn open(path: &Path, retry: RetryPolicy, lease: Duration) -> Result<Self> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let db = Database::create(path)?;
        let wt = db.begin_write()?;
        wt.open_table(JOBS)?;
        wt.open_table(READY)?;
        wt.commit()?;
        Ok(Self { db, retry, lease })
    }

    /// Run `f` on the record held by `token`, then persist it.
    ///
    /// Fails with `StaleDelivery` when the lease was reclaimed or the job
    /// was already acknowledged.
    fn with_delivery<T>(
        &self,
        token: &DeliveryToken,
        f: impl FnOnce(&mut JobRecord) -> T,
    ) -> Result<T> {
        let wt = self.db.begin_write()?;
        let mut record =
            load(&wt, token.job_id)?.ok_or(AppflowError::JobNotFound(token.job_id))?;
        match record.state {
            JobState::Active { token: lease, .. } if lease == token.lease => {}
            _ => return Err(AppflowError::StaleDelivery(token.job_id)),
        }

        let out = f(&mut record);
        record.updated_at = Utc::now();
        store(&wt, &record)?;
        if record.state.is_runnable() {
            index(&wt, &record)?;
        }
        wt.commit()?;
        Ok(out)
    }
}

impl JobQueue for RedbQueue {
    fn enqueue(&self, job: TransitionJob) -> Result<JobId> {
        let record = JobRecord::new(job);
        let wt = self.db.begin_write()?;
        store(&wt, &record)?;
        index(&wt, &record)?;
        wt.commit()?;
        debug!(job_id = %record.id, entity_id = %record.job.entity_id, "job enqueued");
        Ok(record.id)
    }

    fn dequeue(&self, now: DateTime<Utc>) -> Result<Option<Delivery>> {
        let upper = due_upper_bound(now);
        let wt = self.db.begin_write()?;

        let delivery = loop {
            let next = {
                let ready = wt.open_table(READY)?;
                let mut due = ready.range(..=upper.as_slice())?;
                let first = match due.next() {
                    Some(entry) => {
                        let (k, _) = entry?;
                        Some(k.value().to_vec())
                    }
                    None => None,
                };
                first
            };
            let Some(key) = next else {
                break None;
            };
            {
                let mut ready = wt.open_table(READY)?;
                ready.remove(key.as_slice())?;
            }

            let record = match Uuid::from_slice(&key[8..]) {
                Ok(id) => load(&wt, id)?,
                Err(_) => None,
            };
            // Index entries can outlive a purge; skip them.
            let Some(mut record) = record else {
                continue;
            };
            if !record.state.is_runnable() {
                continue;
            }

            let token = DeliveryToken {
                job_id: record.id,
                lease: Uuid::new_v4(),
            };
            record.state = JobState::Active {
                token: token.lease,
                leased_until: after(now, self.lease),
            };
            record.updated_at = Utc::now();
            store(&wt, &record)?;
            break Some(Delivery {
                token,
                job: record.job,
            });
        };

        wt.commit()?;
        Ok(delivery)
    }

    fn delay(&self, token: &DeliveryToken, delay: Duration, job: &TransitionJob) -> Result<()> {
        let now = Utc::now();
        self.with_delivery(token, |record| {
            let mut job = job.clone();
            // A reviewer attached while this delivery was running wins over
            // the worker's stale copy, and the job comes straight back.
            let co_signed = job.reviewer_id.is_none() && record.job.reviewer_id.is_some();
            if co_signed {
                job.reviewer_id = record.job.reviewer_id.clone();
            }
            let until = if co_signed { now } else { after(now, delay) };
            record.job = job;
            record.state = JobState::Delayed {
                reason: DelayReason::Review,
                until,
            };
            record.ready_at = until;
        })
    }

    fn complete(
        &self,
        token: &DeliveryToken,
        job: &TransitionJob,
        status: ApplicationStatus,
    ) -> Result<()> {
        self.with_delivery(token, |record| {
            let mut job = job.clone();
            if job.reviewer_id.is_none() {
                job.reviewer_id = record.job.reviewer_id.take();
            }
            record.job = job;
            record.state = JobState::Completed { status };
        })
    }

    fn fail(
        &self,
        token: &DeliveryToken,
        error: &str,
        permanent: bool,
    ) -> Result<FailDisposition> {
        let retry = &self.retry;
        self.with_delivery(token, |record| {
            record.last_error = Some(error.to_string());
            record.job.attempt += 1;
            let attempt = record.job.attempt;

            if permanent || retry.exhausted(attempt) {
                let reason = if permanent {
                    error.to_string()
                } else {
                    format!("gave up after {attempt} attempts: {error}")
                };
                record.state = JobState::DeadLettered { reason, permanent };
                FailDisposition::DeadLettered { attempt }
            } else {
                let retry_at = after(Utc::now(), retry.delay_for_attempt(attempt));
                record.state = JobState::Delayed {
                    reason: DelayReason::Backoff,
                    until: retry_at,
                };
                record.ready_at = retry_at;
                FailDisposition::Retrying { attempt, retry_at }
            }
        })
    }

    fn attach_reviewer(&self, id: JobId, reviewer_id: &str, resume_now: bool) -> Result<()> {
        let wt = self.db.begin_write()?;
        let mut record = load(&wt, id)?.ok_or(AppflowError::JobNotFound(id))?;
        if record.state.is_terminal() {
            return Err(AppflowError::JobFinished(id));
        }

        match record.job.reviewer_id.as_deref() {
            Some(existing) if existing == reviewer_id => {}
            Some(existing) => {
                return Err(AppflowError::ReviewerAlreadyAssigned {
                    job: id,
                    existing: existing.to_string(),
                })
            }
            None => record.job.reviewer_id = Some(reviewer_id.to_string()),
        }

        let now = Utc::now();
        if resume_now && matches!(record.state, JobState::Delayed { .. }) {
            reschedule(&wt, &mut record, now)?;
        }
        record.updated_at = now;
        store(&wt, &record)?;
        wt.commit()?;
        Ok(())
    }

    fn requeue_expired(&self, now: DateTime<Utc>) -> Result<u32> {
        let wt = self.db.begin_write()?;

        let expired: Vec<JobRecord> = {
            let table = wt.open_table(JOBS)?;
            let mut expired = Vec::new();
            for entry in table.iter()? {
                let (_, v) = entry?;
                let record: JobRecord = serde_json::from_slice(v.value())?;
                if matches!(record.state, JobState::Active { leased_until, .. } if leased_until < now)
                {
                    expired.push(record);
                }
            }
            expired
        };

        let count = expired.len() as u32;
        for mut record in expired {
            warn!(job_id = %record.id, "lease expired, returning job to the ready set");
            record.state = JobState::Queued;
            record.ready_at = now;
            record.updated_at = Utc::now();
            store(&wt, &record)?;
            index(&wt, &record)?;
        }
        wt.commit()?;
        Ok(count)
    }

    fn get(&self, id: JobId) -> Result<JobRecord> {
        let rt = self.db.begin_read()?;
        let table = rt.open_table(JOBS)?;
        let record = match table.get(id.as_u128())? {
            Some(guard) => serde_json::from_slice::<JobRecord>(guard.value())?,
            None => return Err(AppflowError::JobNotFound(id)),
        };
        Ok(record)
    }

    /// All jobs, newest first.
    fn list(&self) -> Result<Vec<JobRecord>> {
        let rt = self.db.begin_read()?;
        let table = rt.open_table(JOBS)?;

        let mut result = Vec::new();
        for entry in table.iter()? {
            let (_, v) = entry?;
            let record: JobRecord = serde_json::from_slice(v.value())?;
            result.push(record);
        }
        result.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        Ok(result)
    }

    fn dead_letters(&self) -> Result<Vec<JobRecord>> {
        Ok(self
            .list()?
            .into_iter()
            .filter(|r| matches!(r.state, JobState::DeadLettered { .. }))
            .collect())
    }

    /// Put a dead-lettered job back in the ready set with a fresh budget.
    fn retry_dead(&self, id: JobId) -> Result<()> {
        let wt = self.db.begin_write()?;
        let mut record = load(&wt, id)?.ok_or(AppflowError::JobNotFound(id))?;
        if !matches!(record.state, JobState::DeadLettered { .. }) {
            return Err(AppflowError::JobNotDead(id));
        }
        let now = Utc::now();
        record.job.attempt = 0;
        record.state = JobState::Queued;
        record.ready_at = now;
        record.updated_at = now;
        store(&wt, &record)?;
        index(&wt, &record)?;
        wt.commit()?;
        Ok(())
    }

    /// Remove a dead-lettered job for good.
    fn purge(&self, id: JobId) -> Result<()> {
        let wt = self.db.begin_write()?;
        let record = load(&wt, id)?.ok_or(AppflowError::JobNotFound(id))?;
        if !matches!(record.state, JobState::DeadLettered { .. }) {
            return Err(AppflowError::JobNotDead(id));
        }
        {
            let mut table = wt.open_table(JOBS)?;
            table.remove(id.as_u128())?;
        }
        wt.commit()?;
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
