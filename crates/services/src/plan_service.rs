use std::sync::Arc;

use storage::repository::{NewPlanRecord, PlanPatch, PlanStore, StorageError};
use study_core::model::{Plan, PlanDraft, PlanId, UserId};

use crate::error::{PlanGenerationError, PlanServiceError};
use crate::summarizer::{ContentSummarizer, StudyPreferences};
use crate::Clock;

/// Creates plans from study material and manages their metadata.
#[derive(Clone)]
pub struct PlanService {
    clock: Clock,
    plans: Arc<dyn PlanStore>,
    summarizer: Arc<dyn ContentSummarizer>,
}

impl PlanService {
    #[must_use]
    pub fn new(
        clock: Clock,
        plans: Arc<dyn PlanStore>,
        summarizer: Arc<dyn ContentSummarizer>,
    ) -> Self {
        Self {
            clock,
            plans,
            summarizer,
        }
    }

    /// Summarize `content` into a plan for `user_id` and persist it.
    ///
    /// # Errors
    ///
    /// Returns `PlanServiceError::Generation` if the summarizer fails. The
    /// request is not retried.
    /// Returns `PlanServiceError::Plan` if the outline does not validate.
    /// Returns `PlanServiceError::Storage` if persistence fails.
    pub async fn generate_plan(
        &self,
        user_id: &UserId,
        title: &str,
        content: &str,
        preferences: &StudyPreferences,
    ) -> Result<PlanId, PlanServiceError> {
        let skeleton = match self.summarizer.summarize(content, preferences).await {
            Ok(skeleton) => skeleton,
            Err(err) => {
                log::warn!("plan generation for {user_id} failed: {err}");
                return Err(PlanGenerationError::PlanGenerationFailed(err).into());
            }
        };
        let draft = skeleton.into_draft(user_id.clone(), title)?;
        self.import_plan(draft).await
    }

    /// Validate and persist an already assembled plan.
    ///
    /// # Errors
    ///
    /// Returns `PlanServiceError::Plan` for validation failures.
    /// Returns `PlanServiceError::Storage` if persistence fails.
    pub async fn import_plan(&self, draft: PlanDraft) -> Result<PlanId, PlanServiceError> {
        let validated = draft.validate(self.clock.now())?;
        let plan_id = self
            .plans
            .add_plan(NewPlanRecord::from_validated(&validated))
            .await?;
        log::info!(
            "created plan {plan_id} for {} ({} days)",
            validated.user_id,
            validated.days.len()
        );
        Ok(plan_id)
    }

    /// Rename a plan.
    ///
    /// # Errors
    ///
    /// Returns `PlanServiceError::Plan` if the title is empty.
    /// Returns `PlanServiceError::Storage` if the plan is missing or the
    /// write fails.
    pub async fn rename_plan(&self, plan_id: PlanId, title: &str) -> Result<(), PlanServiceError> {
        let mut plan = self.plans.get_plan(plan_id).await?;
        let now = self.clock.now();
        plan.rename(title, now)?;
        self.plans
            .update_plan(plan_id, PlanPatch::new(now).with_title(plan.title()))
            .await?;
        Ok(())
    }

    /// List a user's plans ordered by id.
    ///
    /// # Errors
    ///
    /// Returns `PlanServiceError::Storage` if repository access fails.
    pub async fn list_plans(&self, user_id: &UserId) -> Result<Vec<Plan>, PlanServiceError> {
        Ok(self.plans.list_plans(user_id).await?)
    }

    /// Fetch a plan by id. Returns `Ok(None)` when it does not exist.
    ///
    /// # Errors
    ///
    /// Returns `PlanServiceError::Storage` if repository access fails.
    pub async fn get_plan(&self, plan_id: PlanId) -> Result<Option<Plan>, PlanServiceError> {
        match self.plans.get_plan(plan_id).await {
            Ok(plan) => Ok(Some(plan)),
            Err(StorageError::NotFound) => Ok(None),
            Err(err) => Err(err.into()),
        }
    }
}
