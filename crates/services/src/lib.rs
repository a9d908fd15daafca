#![forbid(unsafe_code)]

pub mod app_services;
pub mod config;
pub mod error;
pub mod plan_service;
pub mod summarizer;
pub mod sync;

pub use study_core::Clock;

pub use app_services::AppServices;
pub use config::SyncConfig;
pub use error::{
    AppServicesError, CacheDecodeError, PlanGenerationError, PlanServiceError, SummarizerError,
    SyncError,
};
pub use plan_service::PlanService;
pub use summarizer::{
    ChatSummarizer, ContentSummarizer, DaySkeleton, PlanSkeleton, SessionSkeleton,
    StudyPreferences, SummarizerConfig,
};
pub use sync::{
    CachedProgress, MutationOutcome, PlanPhase, PlanStatus, PlansObserver, ProgressObserver,
    ProgressUpdate, SyncCoordinator, TimerObserver, TimerOutcome, TimerView,
};
