use std::sync::Arc;

use storage::repository::Storage;

use crate::config::SyncConfig;
use crate::error::AppServicesError;
use crate::plan_service::PlanService;
use crate::summarizer::{ChatSummarizer, ContentSummarizer};
use crate::sync::SyncCoordinator;
use crate::Clock;

/// Assembles app-facing services over one storage backend.
#[derive(Clone)]
pub struct AppServices {
    storage: Storage,
    sync: SyncCoordinator,
    plans: Arc<PlanService>,
}

impl AppServices {
    /// Build services backed by `SQLite` storage, with the summarizer
    /// configured from the environment.
    ///
    /// # Errors
    ///
    /// Returns `AppServicesError` if storage initialization fails.
    pub async fn new_sqlite(
        db_url: &str,
        clock: Clock,
        config: SyncConfig,
    ) -> Result<Self, AppServicesError> {
        let storage = Storage::sqlite(db_url).await?;
        Ok(Self::from_storage(
            storage,
            clock,
            config,
            Arc::new(ChatSummarizer::from_env()),
        ))
    }

    /// Build services over in-memory storage.
    #[must_use]
    pub fn in_memory(clock: Clock, config: SyncConfig) -> Self {
        Self::from_storage(
            Storage::in_memory(),
            clock,
            config,
            Arc::new(ChatSummarizer::from_env()),
        )
    }

    /// Must be called from within a tokio runtime.
    #[must_use]
    pub fn from_storage(
        storage: Storage,
        clock: Clock,
        config: SyncConfig,
        summarizer: Arc<dyn ContentSummarizer>,
    ) -> Self {
        let sync = SyncCoordinator::new(clock.clone(), &storage, config);
        let plans = Arc::new(PlanService::new(
            clock,
            Arc::clone(&storage.plans),
            summarizer,
        ));
        Self {
            storage,
            sync,
            plans,
        }
    }

    #[must_use]
    pub fn storage(&self) -> &Storage {
        &self.storage
    }

    #[must_use]
    pub fn sync(&self) -> SyncCoordinator {
        self.sync.clone()
    }

    #[must_use]
    pub fn plans(&self) -> Arc<PlanService> {
        Arc::clone(&self.plans)
    }
}
