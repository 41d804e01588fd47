use thiserror::Error;
use uuid::Uuid;

#[derive(Debug, Error)]
pub enum AppflowError {
    #[error("not initialized: run 'appflow init'")]
    NotInitialized,

    #[error("application not found: {0}")]
    ApplicationNotFound(String),

    #[error("actor not found: {0}")]
    ActorNotFound(String),

    #[error("job not found: {0}")]
    JobNotFound(Uuid),

    #[error("invalid status: {0}")]
    InvalidStatus(String),

    #[error("invalid role: {0}")]
    InvalidRole(String),

    #[error("actor {0} is not a provider")]
    NotAProvider(String),

    #[error("delivery of job {0} is no longer held by this worker")]
    StaleDelivery(Uuid),

    #[error("job {job} already has reviewer {existing}")]
    ReviewerAlreadyAssigned { job: Uuid, existing: String },

    #[error("job {0} is not dead-lettered")]
    JobNotDead(Uuid),

    #[error("job {0} has already finished")]
    JobFinished(Uuid),

    #[error("transaction conflict: {0}")]
    Conflict(String),

    #[error("storage error: {0}")]
    Storage(#[from] redb::Error),

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Yaml(#[from] serde_yaml::Error),

    #[error(transparent)]
    Json(#[from] serde_json::Error),
}

impl AppflowError {
    /// Infrastructure failures that may succeed on a later attempt.
    ///
    /// Everything else is a defect in the request or the stored data and
    /// will fail the same way every time.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            AppflowError::Storage(_) | AppflowError::Conflict(_) | AppflowError::Io(_)
        )
    }
}

// redb reports a distinct error type per operation; fold them into one variant.

impl From<redb::DatabaseError> for AppflowError {
    fn from(e: redb::DatabaseError) -> Self {
        AppflowError::Storage(e.into())
    }
}

impl From<redb::TransactionError> for AppflowError {
    fn from(e: redb::TransactionError) -> Self {
        AppflowError::Storage(e.into())
    }
}

impl From<redb::TableError> for AppflowError {
    fn from(e: redb::TableError) -> Self {
        AppflowError::Storage(e.into())
    }
}

impl From<redb::StorageError> for AppflowError {
    fn from(e: redb::StorageError) -> Self {
        AppflowError::Storage(e.into())
    }
}

impl From<redb::CommitError> for AppflowError {
    fn from(e: redb::CommitError) -> Self {
        AppflowError::Storage(e.into())
    }
}

pub type Result<T> = std::result::Result<T, AppflowError>;
