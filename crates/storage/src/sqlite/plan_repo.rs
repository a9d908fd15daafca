use async_trait::async_trait;
use study_core::model::{Plan, PlanId, UserId};

use super::SqliteRepository;
use super::mapping::{conn, days_to_json, map_plan_row, plan_id_from_i64, plan_id_to_i64};
use crate::repository::{NewPlanRecord, PlanPatch, PlanStore, StorageError};
use crate::subscription::PlanSubscription;

const SELECT_PLAN: &str = r"
    SELECT id, user_id, title, overview, days, progress, last_updated, created_at
    FROM plans
";

impl SqliteRepository {
    async fn fetch_user_plans(&self, user_id: &UserId) -> Result<Vec<Plan>, StorageError> {
        let rows = sqlx::query(&format!("{SELECT_PLAN} WHERE user_id = ?1 ORDER BY id"))
            .bind(user_id.as_str())
            .fetch_all(&self.pool)
            .await
            .map_err(conn)?;
        rows.iter().map(map_plan_row).collect()
    }

    /// Push the user's current plans to live subscribers.
    ///
    /// Must be called while holding `write_order`.
    async fn publish_user(&self, user_id: &UserId) {
        if self.hub.subscriber_count(user_id) == 0 {
            return;
        }
        match self.fetch_user_plans(user_id).await {
            Ok(snapshot) => self.hub.publish(user_id, &snapshot),
            Err(err) => log::warn!("failed to build snapshot for user {user_id}: {err}"),
        }
    }
}

#[async_trait]
impl PlanStore for SqliteRepository {
    async fn add_plan(&self, record: NewPlanRecord) -> Result<PlanId, StorageError> {
        let days = days_to_json(&record.days)?;
        let _order = self.write_order.lock().await;

        let res = sqlx::query(
            r"
                INSERT INTO plans (
                    user_id, title, overview, days, progress, last_updated, created_at
                )
                VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)
            ",
        )
        .bind(record.user_id.as_str())
        .bind(&record.title)
        .bind(&record.overview)
        .bind(days)
        .bind(i64::from(record.progress))
        .bind(record.created_at)
        .bind(record.created_at)
        .execute(&self.pool)
        .await
        .map_err(conn)?;

        let id = plan_id_from_i64(res.last_insert_rowid())?;
        self.publish_user(&record.user_id).await;
        Ok(id)
    }

    async fn get_plan(&self, id: PlanId) -> Result<Plan, StorageError> {
        let row = sqlx::query(&format!("{SELECT_PLAN} WHERE id = ?1"))
            .bind(plan_id_to_i64(id)?)
            .fetch_optional(&self.pool)
            .await
            .map_err(conn)?
            .ok_or(StorageError::NotFound)?;
        map_plan_row(&row)
    }

    async fn list_plans(&self, user_id: &UserId) -> Result<Vec<Plan>, StorageError> {
        self.fetch_user_plans(user_id).await
    }

    async fn update_plan(&self, id: PlanId, patch: PlanPatch) -> Result<(), StorageError> {
        let _order = self.write_order.lock().await;
        let current = self.get_plan(id).await?;
        let updated = patch.apply_to(&current)?;

        sqlx::query(
            r"
                UPDATE plans
                SET title = ?2, days = ?3, progress = ?4, last_updated = ?5
                WHERE id = ?1
            ",
        )
        .bind(plan_id_to_i64(id)?)
        .bind(updated.title())
        .bind(days_to_json(updated.days())?)
        .bind(i64::from(updated.progress()))
        .bind(updated.last_updated())
        .execute(&self.pool)
        .await
        .map_err(conn)?;

        self.publish_user(updated.user_id()).await;
        Ok(())
    }

    async fn delete_plan(&self, id: PlanId) -> Result<(), StorageError> {
        let _order = self.write_order.lock().await;
        let current = self.get_plan(id).await?;

        sqlx::query("DELETE FROM plans WHERE id = ?1")
            .bind(plan_id_to_i64(id)?)
            .execute(&self.pool)
            .await
            .map_err(conn)?;

        self.publish_user(current.user_id()).await;
        Ok(())
    }

    async fn subscribe(&self, user_id: &UserId) -> Result<PlanSubscription, StorageError> {
        let _order = self.write_order.lock().await;
        let initial = self.fetch_user_plans(user_id).await?;
        Ok(self.hub.subscribe(user_id.clone(), initial))
    }
}
