//! Shared error types for the services crate.

use thiserror::Error;

use storage::repository::StorageError;
use storage::sqlite::SqliteInitError;
use study_core::model::{PlanError, PlanId, SessionRef};
use study_core::timer::TimerError;

/// Errors emitted by `SyncCoordinator`.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum SyncError {
    #[error("plan {0} not found")]
    PlanNotFound(PlanId),
    #[error("plan {0} was deleted")]
    PlanDeleted(PlanId),
    #[error("no session at {0}")]
    SessionNotFound(SessionRef),
    #[error("no active timer for the requested session")]
    NoActiveTimer,
    #[error(transparent)]
    InvalidState(#[from] TimerError),
    #[error(transparent)]
    Plan(#[from] PlanError),
    #[error("persistence unavailable: {0}")]
    PersistenceUnavailable(#[source] StorageError),
}

/// A cached progress value that could not be read back.
#[derive(Debug, Error)]
#[error("cache entry {key} is unreadable: {reason}")]
pub struct CacheDecodeError {
    pub key: String,
    pub reason: String,
}

/// Errors emitted by a `ContentSummarizer`.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum SummarizerError {
    #[error("content summarizer is not configured")]
    Disabled,
    #[error("content summarizer returned an empty response")]
    EmptyResponse,
    #[error("content summarizer returned an unusable plan: {0}")]
    InvalidSkeleton(String),
    #[error("content summarizer request failed with status {0}")]
    HttpStatus(reqwest::StatusCode),
    #[error(transparent)]
    Http(#[from] reqwest::Error),
}

/// Plan generation failed in the summarizer. Never retried.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum PlanGenerationError {
    #[error("plan generation failed: {0}")]
    PlanGenerationFailed(#[source] SummarizerError),
}

/// Errors emitted by `PlanService`.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum PlanServiceError {
    #[error(transparent)]
    Generation(#[from] PlanGenerationError),
    #[error(transparent)]
    Plan(#[from] PlanError),
    #[error(transparent)]
    Storage(#[from] StorageError),
}

/// Errors emitted while bootstrapping app services.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum AppServicesError {
    #[error(transparent)]
    Sqlite(#[from] SqliteInitError),
}

impl SyncError {
    pub(crate) fn from_lookup(plan_id: PlanId, err: StorageError) -> Self {
        match err {
            StorageError::NotFound => SyncError::PlanNotFound(plan_id),
            other => SyncError::PersistenceUnavailable(other),
        }
    }
}
