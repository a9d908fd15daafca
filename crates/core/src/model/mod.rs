mod ids;
mod plan;

pub use ids::{ParseIdError, PlanId, SessionRef, UserId};
pub use plan::{Day, MS_PER_MINUTE, Plan, PlanDraft, PlanError, Session, ValidatedPlan};
