use study_core::model::{Day, Plan, PlanId, UserId};
use sqlx::Row;

use crate::repository::StorageError;

pub(crate) fn ser<E: core::fmt::Display>(e: E) -> StorageError {
    StorageError::Serialization(e.to_string())
}

pub(crate) fn conn<E: core::fmt::Display>(e: E) -> StorageError {
    StorageError::Connection(e.to_string())
}

pub(crate) fn plan_id_from_i64(v: i64) -> Result<PlanId, StorageError> {
    u64::try_from(v)
        .map(PlanId::new)
        .map_err(|_| StorageError::Serialization("plan_id sign overflow".into()))
}

pub(crate) fn plan_id_to_i64(id: PlanId) -> Result<i64, StorageError> {
    i64::try_from(id.value()).map_err(|_| StorageError::Serialization("plan_id overflow".into()))
}

pub(crate) fn days_to_json(days: &[Day]) -> Result<String, StorageError> {
    serde_json::to_string(days).map_err(ser)
}

pub(crate) fn map_plan_row(row: &sqlx::sqlite::SqliteRow) -> Result<Plan, StorageError> {
    let id = plan_id_from_i64(row.try_get::<i64, _>("id").map_err(ser)?)?;
    let user_id = UserId::new(row.try_get::<String, _>("user_id").map_err(ser)?);
    let title: String = row.try_get("title").map_err(ser)?;
    let overview: String = row.try_get("overview").map_err(ser)?;
    let days_json: String = row.try_get("days").map_err(ser)?;
    let days: Vec<Day> = serde_json::from_str(&days_json).map_err(ser)?;

    let progress_i64: i64 = row.try_get("progress").map_err(ser)?;
    let progress = u16::try_from(progress_i64)
        .map_err(|_| StorageError::Serialization(format!("invalid progress: {progress_i64}")))?;

    let last_updated: chrono::DateTime<chrono::Utc> = row.try_get("last_updated").map_err(ser)?;
    let created_at: chrono::DateTime<chrono::Utc> = row.try_get("created_at").map_err(ser)?;

    Plan::from_persisted(
        id,
        user_id,
        title,
        overview,
        days,
        progress,
        last_updated,
        created_at,
    )
    .map_err(ser)
}
