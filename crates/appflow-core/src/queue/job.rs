//! Transition job data model.
//!
//! A `TransitionJob` is the payload: which application, which status, who
//! asked. It is created once per request and mutated in place across pause
//! and resume cycles (the reviewer and note are filled in later). A
//! `JobRecord` wraps it with the queue's bookkeeping.

use crate::types::ApplicationStatus;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

pub type JobId = Uuid;

// ---------------------------------------------------------------------------
// TransitionJob
// ---------------------------------------------------------------------------

/// Persisted payload. Field names are a stable contract across delay cycles.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransitionJob {
    pub entity_id: String,
    pub requested_status: ApplicationStatus,
    pub requesting_user_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reviewer_id: Option<String>,
    /// Human-readable status note, set when the job is parked for review.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub note: Option<String>,
    /// Failed executions so far.
    #[serde(default)]
    pub attempt: u32,
}

impl TransitionJob {
    pub fn new(
        entity_id: impl Into<String>,
        requested_status: ApplicationStatus,
        requesting_user_id: impl Into<String>,
    ) -> Self {
        Self {
            entity_id: entity_id.into(),
            requested_status,
            requesting_user_id: requesting_user_id.into(),
            reviewer_id: None,
            note: None,
            attempt: 0,
        }
    }

    pub fn with_reviewer(mut self, reviewer_id: impl Into<String>) -> Self {
        self.reviewer_id = Some(reviewer_id.into());
        self
    }
}

// ---------------------------------------------------------------------------
// JobState
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DelayReason {
    /// Parked until an admin co-signs. Not a failure.
    Review,
    /// Waiting out the backoff after a transient failure.
    Backoff,
}

/// Lifecycle of a job in the queue.
///
/// `Queued → Active → Completed | Delayed | DeadLettered`, and
/// `Delayed → Active` once `until` has passed. An `Active` job whose lease
/// runs out is put back to `Queued`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum JobState {
    Queued,
    Active {
        token: Uuid,
        leased_until: DateTime<Utc>,
    },
    Delayed {
        reason: DelayReason,
        until: DateTime<Utc>,
    },
    Completed {
        status: ApplicationStatus,
    },
    DeadLettered {
        reason: String,
        permanent: bool,
    },
}

impl JobState {
    pub fn label(&self) -> &'static str {
        match self {
            JobState::Queued => "queued",
            JobState::Active { .. } => "active",
            JobState::Delayed {
                reason: DelayReason::Review,
                ..
            } => "awaiting_review",
            JobState::Delayed {
                reason: DelayReason::Backoff,
                ..
            } => "backoff",
            JobState::Completed { .. } => "completed",
            JobState::DeadLettered { .. } => "dead",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            JobState::Completed { .. } | JobState::DeadLettered { .. }
        )
    }

    /// Eligible for delivery once its ready time has passed.
    pub fn is_runnable(&self) -> bool {
        matches!(self, JobState::Queued | JobState::Delayed { .. })
    }
}

impl fmt::Display for JobState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.label())
    }
}

// ---------------------------------------------------------------------------
// JobRecord
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobRecord {
    pub id: JobId,
    pub job: TransitionJob,
    pub state: JobState,
    /// Earliest time the job may be delivered. Meaningful while runnable.
    pub ready_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_error: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl JobRecord {
    pub fn new(job: TransitionJob) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4(),
            job,
            state: JobState::Queued,
            ready_at: now,
            last_error: None,
            created_at: now,
            updated_at: now,
        }
    }
}

// ---------------------------------------------------------------------------
// Delivery
// ---------------------------------------------------------------------------

/// Authorizes follow-up calls for one delivery of one job.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DeliveryToken {
    pub job_id: JobId,
    pub lease: Uuid,
}

/// A job handed to exactly one worker.
#[derive(Debug, Clone)]
pub struct Delivery {
    pub token: DeliveryToken,
    pub job: TransitionJob,
}

/// What `fail` did with the job.
#[derive(Debug, Clone, PartialEq)]
pub enum FailDisposition {
    Retrying {
        attempt: u32,
        retry_at: DateTime<Utc>,
    },
    DeadLettered {
        attempt: u32,
    },
}
