use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use study_core::model::{Day, Plan, PlanId, UserId, ValidatedPlan};
use thiserror::Error;

use crate::subscription::{PlanSubscription, SubscriberHub};

/// Errors surfaced by storage adapters.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum StorageError {
    #[error("not found")]
    NotFound,

    #[error("conflict")]
    Conflict,

    #[error("connection error: {0}")]
    Connection(String),

    #[error("serialization error: {0}")]
    Serialization(String),
}

/// Persisted shape for a plan that has not been assigned an id yet.
#[derive(Debug, Clone)]
pub struct NewPlanRecord {
    pub user_id: UserId,
    pub title: String,
    pub overview: String,
    pub days: Vec<Day>,
    pub progress: u8,
    pub created_at: DateTime<Utc>,
}

impl NewPlanRecord {
    #[must_use]
    pub fn from_validated(plan: &ValidatedPlan) -> Self {
        Self {
            user_id: plan.user_id.clone(),
            title: plan.title.clone(),
            overview: plan.overview.clone(),
            days: plan.days.clone(),
            progress: plan.progress,
            created_at: plan.created_at,
        }
    }
}

/// Partial update of a stored plan. Every write stamps `last_updated`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PlanPatch {
    pub title: Option<String>,
    pub days: Option<Vec<Day>>,
    pub progress: Option<u8>,
    pub last_updated: DateTime<Utc>,
}

impl PlanPatch {
    #[must_use]
    pub fn new(last_updated: DateTime<Utc>) -> Self {
        Self {
            title: None,
            days: None,
            progress: None,
            last_updated,
        }
    }

    #[must_use]
    pub fn with_title(mut self, title: impl Into<String>) -> Self {
        self.title = Some(title.into());
        self
    }

    #[must_use]
    pub fn with_days(mut self, days: Vec<Day>) -> Self {
        self.days = Some(days);
        self
    }

    #[must_use]
    pub fn with_progress(mut self, progress: u8) -> Self {
        self.progress = Some(progress);
        self
    }

    /// Produce the plan that results from applying this patch to `plan`.
    ///
    /// # Errors
    ///
    /// Returns `StorageError::Serialization` if the patched progress is out of range.
    pub fn apply_to(&self, plan: &Plan) -> Result<Plan, StorageError> {
        Plan::from_persisted(
            plan.id(),
            plan.user_id().clone(),
            self.title.clone().unwrap_or_else(|| plan.title().to_owned()),
            plan.overview().to_owned(),
            self.days.clone().unwrap_or_else(|| plan.days().to_vec()),
            u16::from(self.progress.unwrap_or_else(|| plan.progress())),
            self.last_updated,
            plan.created_at(),
        )
        .map_err(|err| StorageError::Serialization(err.to_string()))
    }
}

/// Durable, multi-client plan store with a live subscription.
#[async_trait]
pub trait PlanStore: Send + Sync {
    /// Persist a new plan and return the id the store assigned.
    ///
    /// # Errors
    ///
    /// Returns `StorageError` if the plan cannot be stored.
    async fn add_plan(&self, record: NewPlanRecord) -> Result<PlanId, StorageError>;

    /// Fetch a plan by ID.
    ///
    /// # Errors
    ///
    /// Returns `StorageError::NotFound` if missing, or other storage errors.
    async fn get_plan(&self, id: PlanId) -> Result<Plan, StorageError>;

    /// List a user's plans ordered by id.
    ///
    /// # Errors
    ///
    /// Returns `StorageError` on adapter failures.
    async fn list_plans(&self, user_id: &UserId) -> Result<Vec<Plan>, StorageError>;

    /// Apply a partial update.
    ///
    /// # Errors
    ///
    /// Returns `StorageError::NotFound` if missing, or other storage errors.
    async fn update_plan(&self, id: PlanId, patch: PlanPatch) -> Result<(), StorageError>;

    /// Delete a plan.
    ///
    /// # Errors
    ///
    /// Returns `StorageError::NotFound` if missing, or other storage errors.
    async fn delete_plan(&self, id: PlanId) -> Result<(), StorageError>;

    /// Open a live subscription on all plans owned by `user_id`.
    ///
    /// The current snapshot is delivered first; every later write to one of
    /// the user's plans pushes a fresh snapshot.
    ///
    /// # Errors
    ///
    /// Returns `StorageError` if the subscription cannot be opened.
    async fn subscribe(&self, user_id: &UserId) -> Result<PlanSubscription, StorageError>;
}

/// Key-value cache of last-known values, scoped by key prefix.
#[async_trait]
pub trait ProgressCache: Send + Sync {
    /// Read a raw cached value.
    ///
    /// # Errors
    ///
    /// Returns `StorageError` on adapter failures. A missing key is `Ok(None)`.
    async fn get(&self, key: &str) -> Result<Option<String>, StorageError>;

    /// Insert or overwrite a value.
    ///
    /// # Errors
    ///
    /// Returns `StorageError` on adapter failures.
    async fn set(&self, key: &str, value: &str) -> Result<(), StorageError>;

    /// Remove one key. Removing a missing key is not an error.
    ///
    /// # Errors
    ///
    /// Returns `StorageError` on adapter failures.
    async fn remove(&self, key: &str) -> Result<(), StorageError>;

    /// List keys starting with `prefix`, sorted.
    ///
    /// # Errors
    ///
    /// Returns `StorageError` on adapter failures.
    async fn keys_with_prefix(&self, prefix: &str) -> Result<Vec<String>, StorageError>;

    /// Remove every key starting with `prefix` and return how many were removed.
    ///
    /// # Errors
    ///
    /// Returns `StorageError` on adapter failures.
    async fn remove_matching(&self, prefix: &str) -> Result<usize, StorageError>;
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Simple in-memory store and cache for testing and prototyping.
#[derive(Clone, Default)]
pub struct InMemoryStore {
    plans: Arc<Mutex<BTreeMap<PlanId, Plan>>>,
    next_id: Arc<AtomicU64>,
    cache: Arc<Mutex<BTreeMap<String, String>>>,
    hub: SubscriberHub,
}

impl InMemoryStore {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Drop every live subscription, as a lost connection would.
    pub fn disconnect_subscribers(&self) {
        self.hub.disconnect_all();
    }

    #[must_use]
    pub fn subscriber_count(&self, user_id: &UserId) -> usize {
        self.hub.subscriber_count(user_id)
    }

    fn snapshot_for(plans: &BTreeMap<PlanId, Plan>, user_id: &UserId) -> Vec<Plan> {
        plans
            .values()
            .filter(|plan| plan.user_id() == user_id)
            .cloned()
            .collect()
    }

    fn publish(&self, plans: &BTreeMap<PlanId, Plan>, user_id: &UserId) {
        self.hub.publish(user_id, &Self::snapshot_for(plans, user_id));
    }
}

#[async_trait]
impl PlanStore for InMemoryStore {
    async fn add_plan(&self, record: NewPlanRecord) -> Result<PlanId, StorageError> {
        let id = PlanId::new(self.next_id.fetch_add(1, Ordering::SeqCst) + 1);
        let plan = Plan::from_persisted(
            id,
            record.user_id.clone(),
            record.title,
            record.overview,
            record.days,
            u16::from(record.progress),
            record.created_at,
            record.created_at,
        )
        .map_err(|err| StorageError::Serialization(err.to_string()))?;

        let mut guard = lock(&self.plans);
        guard.insert(id, plan);
        self.publish(&guard, &record.user_id);
        Ok(id)
    }

    async fn get_plan(&self, id: PlanId) -> Result<Plan, StorageError> {
        lock(&self.plans)
            .get(&id)
            .cloned()
            .ok_or(StorageError::NotFound)
    }

    async fn list_plans(&self, user_id: &UserId) -> Result<Vec<Plan>, StorageError> {
        Ok(Self::snapshot_for(&lock(&self.plans), user_id))
    }

    async fn update_plan(&self, id: PlanId, patch: PlanPatch) -> Result<(), StorageError> {
        let mut guard = lock(&self.plans);
        let current = guard.get(&id).ok_or(StorageError::NotFound)?;
        let updated = patch.apply_to(current)?;
        let user_id = updated.user_id().clone();
        guard.insert(id, updated);
        self.publish(&guard, &user_id);
        Ok(())
    }

    async fn delete_plan(&self, id: PlanId) -> Result<(), StorageError> {
        let mut guard = lock(&self.plans);
        let removed = guard.remove(&id).ok_or(StorageError::NotFound)?;
        self.publish(&guard, removed.user_id());
        Ok(())
    }

    async fn subscribe(&self, user_id: &UserId) -> Result<PlanSubscription, StorageError> {
        let guard = lock(&self.plans);
        let initial = Self::snapshot_for(&guard, user_id);
        Ok(self.hub.subscribe(user_id.clone(), initial))
    }
}

#[async_trait]
impl ProgressCache for InMemoryStore {
    async fn get(&self, key: &str) -> Result<Option<String>, StorageError> {
        Ok(lock(&self.cache).get(key).cloned())
    }

    async fn set(&self, key: &str, value: &str) -> Result<(), StorageError> {
        lock(&self.cache).insert(key.to_owned(), value.to_owned());
        Ok(())
    }

    async fn remove(&self, key: &str) -> Result<(), StorageError> {
        lock(&self.cache).remove(key);
        Ok(())
    }

    async fn keys_with_prefix(&self, prefix: &str) -> Result<Vec<String>, StorageError> {
        Ok(lock(&self.cache)
            .keys()
            .filter(|key| key.starts_with(prefix))
            .cloned()
            .collect())
    }

    async fn remove_matching(&self, prefix: &str) -> Result<usize, StorageError> {
        let mut guard = lock(&self.cache);
        let before = guard.len();
        guard.retain(|key, _| !key.starts_with(prefix));
        Ok(before - guard.len())
    }
}

/// Aggregates the plan store and cache behind trait objects for easy backend swapping.
#[derive(Clone)]
pub struct Storage {
    pub plans: Arc<dyn PlanStore>,
    pub cache: Arc<dyn ProgressCache>,
}

impl Storage {
    #[must_use]
    pub fn in_memory() -> Self {
        let store = InMemoryStore::new();
        let plans: Arc<dyn PlanStore> = Arc::new(store.clone());
        let cache: Arc<dyn ProgressCache> = Arc::new(store);
        Self { plans, cache }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use study_core::model::{PlanDraft, Session};
    use study_core::time::fixed_now;

    fn record(user: &str) -> NewPlanRecord {
        let day = Day::new(
            1,
            "2024-01-01",
            vec![
                Session::new("Intro", "", 25).unwrap(),
                Session::new("Practice", "", 25).unwrap(),
            ],
        );
        let validated = PlanDraft {
            user_id: UserId::new(user),
            title: "Plan".into(),
            overview: String::new(),
            days: vec![day],
        }
        .validate(fixed_now())
        .unwrap();
        NewPlanRecord::from_validated(&validated)
    }

    #[tokio::test]
    async fn add_get_update_delete() {
        let store = InMemoryStore::new();
        let id = store.add_plan(record("u1")).await.unwrap();
        assert_eq!(id, PlanId::new(1));

        let mut plan = store.get_plan(id).await.unwrap();
        plan.toggle_session(0, 0, fixed_now()).unwrap();
        let later = fixed_now() + chrono::Duration::seconds(5);
        store
            .update_plan(
                id,
                PlanPatch::new(later)
                    .with_days(plan.days().to_vec())
                    .with_progress(plan.progress()),
            )
            .await
            .unwrap();

        let stored = store.get_plan(id).await.unwrap();
        assert_eq!(stored.progress(), 50);
        assert_eq!(stored.last_updated(), later);
        assert_eq!(stored.title(), "Plan");

        store.delete_plan(id).await.unwrap();
        assert!(matches!(
            store.get_plan(id).await,
            Err(StorageError::NotFound)
        ));
        assert!(matches!(
            store.delete_plan(id).await,
            Err(StorageError::NotFound)
        ));
    }

    #[tokio::test]
    async fn subscription_sees_writes_in_order() {
        let store = InMemoryStore::new();
        let user = UserId::new("u1");
        let mut sub = store.subscribe(&user).await.unwrap();
        assert_eq!(sub.next_snapshot().await.unwrap().len(), 0);

        let id = store.add_plan(record("u1")).await.unwrap();
        store.add_plan(record("someone-else")).await.unwrap();
        store
            .update_plan(id, PlanPatch::new(fixed_now()).with_progress(100))
            .await
            .unwrap();

        let first = sub.next_snapshot().await.unwrap();
        assert_eq!(first.len(), 1);
        assert_eq!(first[0].progress(), 0);
        let second = sub.next_snapshot().await.unwrap();
        assert_eq!(second[0].progress(), 100);
        assert!(sub.try_next_snapshot().is_none());
    }

    #[tokio::test]
    async fn cache_prefix_operations() {
        let store = InMemoryStore::new();
        store.set("progress:a:1", "x").await.unwrap();
        store.set("progress:a:2", "y").await.unwrap();
        store.set("progress:b:1", "z").await.unwrap();

        assert_eq!(
            store.keys_with_prefix("progress:a:").await.unwrap(),
            vec!["progress:a:1".to_string(), "progress:a:2".to_string()]
        );
        assert_eq!(store.remove_matching("progress:a:").await.unwrap(), 2);
        assert_eq!(store.get("progress:a:1").await.unwrap(), None);
        assert_eq!(store.get("progress:b:1").await.unwrap().as_deref(), Some("z"));
    }
}
