use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use services::sync::cache_codec::{self, CachedProgress};
use services::{
    AppServices, ContentSummarizer, DaySkeleton, PlanPhase, PlanSkeleton, SessionSkeleton,
    StudyPreferences, SummarizerError, SyncConfig, SyncCoordinator, SyncError,
};
use storage::repository::{
    InMemoryStore, NewPlanRecord, PlanPatch, PlanStore, ProgressCache, Storage, StorageError,
};
use storage::subscription::{PlanSubscription, SubscriberHub};
use study_core::model::{Day, Plan, PlanDraft, PlanId, Session, UserId};
use study_core::time::{fixed_clock, fixed_now};
use tokio::time::{sleep, timeout};

/// Plan store whose subscription only delivers what the test pushes, with
/// switches to fail writes and subscriptions.
#[derive(Clone, Default)]
struct ScriptedStore {
    inner: InMemoryStore,
    hub: SubscriberHub,
    fail_writes: Arc<AtomicBool>,
    fail_subscribe: Arc<AtomicBool>,
}

impl ScriptedStore {
    async fn push(&self, user_id: &UserId) {
        let plans = self.inner.list_plans(user_id).await.unwrap();
        self.hub.publish(user_id, &plans);
    }

    fn push_plans(&self, user_id: &UserId, plans: &[Plan]) {
        self.hub.publish(user_id, plans);
    }

    /// Another client completes a session directly in the store.
    async fn complete_elsewhere(&self, plan_id: PlanId, session_index: usize) {
        let mut plan = self.inner.get_plan(plan_id).await.unwrap();
        plan.session_mut(0, session_index).unwrap().mark_completed();
        let progress = plan.refresh_progress();
        self.inner
            .update_plan(
                plan_id,
                PlanPatch::new(fixed_now())
                    .with_days(plan.days().to_vec())
                    .with_progress(progress),
            )
            .await
            .unwrap();
    }
}

#[async_trait]
impl PlanStore for ScriptedStore {
    async fn add_plan(&self, record: NewPlanRecord) -> Result<PlanId, StorageError> {
        self.inner.add_plan(record).await
    }

    async fn get_plan(&self, id: PlanId) -> Result<Plan, StorageError> {
        self.inner.get_plan(id).await
    }

    async fn list_plans(&self, user_id: &UserId) -> Result<Vec<Plan>, StorageError> {
        self.inner.list_plans(user_id).await
    }

    async fn update_plan(&self, id: PlanId, patch: PlanPatch) -> Result<(), StorageError> {
        if self.fail_writes.load(Ordering::SeqCst) {
            return Err(StorageError::Connection("offline".into()));
        }
        self.inner.update_plan(id, patch).await
    }

    async fn delete_plan(&self, id: PlanId) -> Result<(), StorageError> {
        self.inner.delete_plan(id).await
    }

    async fn subscribe(&self, user_id: &UserId) -> Result<PlanSubscription, StorageError> {
        if self.fail_subscribe.load(Ordering::SeqCst) {
            return Err(StorageError::Connection("offline".into()));
        }
        let initial = self.inner.list_plans(user_id).await?;
        Ok(self.hub.subscribe(user_id.clone(), initial))
    }
}

struct Harness {
    store: ScriptedStore,
    sync: SyncCoordinator,
    alice: UserId,
}

impl Harness {
    fn new() -> Self {
        let store = ScriptedStore::default();
        let storage = Storage {
            plans: Arc::new(store.clone()),
            cache: Arc::new(store.inner.clone()),
        };
        Self {
            sync: SyncCoordinator::new(fixed_clock(), &storage, SyncConfig::manual()),
            store,
            alice: UserId::new("alice"),
        }
    }

    async fn add_plan(&self, completed: &[bool]) -> PlanId {
        let sessions = completed
            .iter()
            .enumerate()
            .map(|(i, done)| {
                let mut session = Session::new(format!("Chapter {i}"), "", 20).unwrap();
                if *done {
                    session.mark_completed();
                }
                session
            })
            .collect();
        let validated = PlanDraft {
            user_id: self.alice.clone(),
            title: "History".into(),
            overview: String::new(),
            days: vec![Day::new(1, "2024-03-01", sessions)],
        }
        .validate(fixed_now())
        .unwrap();
        self.store
            .add_plan(NewPlanRecord::from_validated(&validated))
            .await
            .unwrap()
    }

    async fn cache_raw(&self, plan_id: PlanId) -> Option<String> {
        self.store
            .inner
            .get(&cache_codec::cache_key(&self.alice, plan_id))
            .await
            .unwrap()
    }

    async fn seed_cache(&self, plan_id: PlanId, raw: &str) {
        self.store
            .inner
            .set(&cache_codec::cache_key(&self.alice, plan_id), raw)
            .await
            .unwrap();
    }

    async fn wait_confirmed(&self, plan_id: PlanId, progress: u8) {
        let mut observer = self.sync.observe_progress(plan_id).unwrap();
        timeout(
            Duration::from_secs(2),
            observer.wait_for(|update| {
                update.is_some_and(|u| u.phase == PlanPhase::RemoteConfirmed && u.progress == progress)
            }),
        )
        .await
        .expect("remote value not applied in time")
        .unwrap();
    }
}

fn encoded(progress: u8) -> String {
    serde_json::to_string(&CachedProgress {
        progress,
        last_updated: fixed_now(),
    })
    .unwrap()
}

#[tokio::test]
async fn later_remote_snapshot_wins_over_optimistic_value() {
    let h = Harness::new();
    let plan_id = h.add_plan(&[true, false, false, false]).await;
    h.sync.attach_user(&h.alice).await.unwrap();
    h.wait_confirmed(plan_id, 25).await;
    let mut observer = h.sync.observe_progress(plan_id).unwrap();

    let local = h.sync.toggle_session_completion(plan_id, 0, 1).await.unwrap();
    assert_eq!(local.progress, 50);
    let optimistic = observer.borrow_and_update().unwrap();
    assert_eq!(optimistic.progress, 50);
    assert_eq!(optimistic.phase, PlanPhase::LocallyMutated);

    sleep(Duration::from_millis(300)).await;
    h.store.complete_elsewhere(plan_id, 2).await;
    h.store.push(&h.alice).await;

    h.wait_confirmed(plan_id, 75).await;
    let last = observer.borrow_and_update().unwrap();
    assert_eq!(last.progress, 75);
    assert!(!last.dirty);
    assert_eq!(
        h.sync.observe_all_plans_progress(&h.alice).borrow().get(&plan_id),
        Some(&75)
    );
}

#[tokio::test]
async fn late_snapshot_does_not_resurrect_deleted_plan() {
    let h = Harness::new();
    let doomed = h.add_plan(&[false, false]).await;
    let kept = h.add_plan(&[false, false]).await;
    h.sync.attach_user(&h.alice).await.unwrap();
    h.wait_confirmed(kept, 0).await;
    let mut all = h.sync.observe_all_plans_progress(&h.alice);

    h.sync.toggle_session_completion(doomed, 0, 0).await.unwrap();
    let doomed_plan = h.store.get_plan(doomed).await.unwrap();
    h.sync.delete_plan(doomed).await.unwrap();
    assert!(!all.borrow_and_update().contains_key(&doomed));
    assert_eq!(h.cache_raw(doomed).await, None);

    h.store.complete_elsewhere(kept, 0).await;
    let mut late = h.store.list_plans(&h.alice).await.unwrap();
    late.insert(0, doomed_plan);
    h.store.push_plans(&h.alice, &late);

    let map = timeout(
        Duration::from_secs(2),
        all.wait_for(|map| map.get(&kept) == Some(&50)),
    )
    .await
    .expect("snapshot not applied in time")
    .unwrap()
    .clone();
    assert!(!map.contains_key(&doomed));
    assert_eq!(h.sync.plan_status(doomed).phase, PlanPhase::Deleted);
    assert_eq!(h.cache_raw(doomed).await, None);
}

#[tokio::test]
async fn corrupt_cache_entry_heals_from_remote() {
    let h = Harness::new();
    let plan_id = h.add_plan(&[true, false]).await;
    h.seed_cache(plan_id, "{not json").await;
    h.store.fail_subscribe.store(true, Ordering::SeqCst);

    assert!(h.sync.attach_user(&h.alice).await.is_err());
    assert_eq!(h.sync.plan_status(plan_id).phase, PlanPhase::Uninitialized);

    h.store.fail_subscribe.store(false, Ordering::SeqCst);
    h.sync.reconnect_user(&h.alice).await.unwrap();
    h.wait_confirmed(plan_id, 50).await;

    timeout(Duration::from_secs(2), async {
        loop {
            let raw = h.cache_raw(plan_id).await.unwrap_or_default();
            if cache_codec::decode("k", &raw).is_ok_and(|value| value.progress == 50) {
                break;
            }
            sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .expect("cache not rewritten in time");
}

#[tokio::test]
async fn cached_values_are_served_while_offline() {
    let h = Harness::new();
    let plan_id = h.add_plan(&[true, true, false, false]).await;
    h.seed_cache(plan_id, &encoded(40)).await;
    h.store.fail_subscribe.store(true, Ordering::SeqCst);

    let err = h.sync.attach_user(&h.alice).await.unwrap_err();
    assert!(matches!(err, SyncError::PersistenceUnavailable(_)));
    assert!(!h.sync.is_connected(&h.alice));
    let status = h.sync.plan_status(plan_id);
    assert_eq!(status.phase, PlanPhase::CacheHydrated);
    assert_eq!(status.progress, Some(40));

    h.store.fail_subscribe.store(false, Ordering::SeqCst);
    h.sync.reconnect_user(&h.alice).await.unwrap();
    h.wait_confirmed(plan_id, 50).await;
    assert!(h.sync.is_connected(&h.alice));
}

#[tokio::test]
async fn failed_write_stays_dirty_until_retried() {
    let h = Harness::new();
    let plan_id = h.add_plan(&[false, false]).await;
    h.sync.attach_user(&h.alice).await.unwrap();
    h.wait_confirmed(plan_id, 0).await;

    h.store.fail_writes.store(true, Ordering::SeqCst);
    let outcome = h.sync.toggle_session_completion(plan_id, 0, 0).await.unwrap();
    assert!(!outcome.saved);
    assert_eq!(outcome.progress, 50);
    let status = h.sync.plan_status(plan_id);
    assert!(status.dirty);
    assert_eq!(status.progress, Some(50));
    assert_eq!(h.store.get_plan(plan_id).await.unwrap().progress(), 0);
    assert_eq!(
        cache_codec::decode("k", &h.cache_raw(plan_id).await.unwrap())
            .unwrap()
            .progress,
        50
    );

    let still_down = h.sync.retry_save(plan_id).await.unwrap();
    assert!(!still_down.saved);

    h.store.fail_writes.store(false, Ordering::SeqCst);
    let retried = h.sync.retry_save(plan_id).await.unwrap();
    assert!(retried.saved);
    assert!(!h.sync.plan_status(plan_id).dirty);
    assert_eq!(h.store.get_plan(plan_id).await.unwrap().progress(), 50);
}

#[tokio::test]
async fn dropped_subscription_keeps_last_values_until_reconnect() {
    let h = Harness::new();
    let plan_id = h.add_plan(&[true, false]).await;
    h.sync.attach_user(&h.alice).await.unwrap();
    h.wait_confirmed(plan_id, 50).await;

    h.store.hub.disconnect_all();
    timeout(Duration::from_secs(2), async {
        while h.sync.is_connected(&h.alice) {
            sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .expect("disconnect not noticed in time");
    assert_eq!(h.sync.plan_status(plan_id).progress, Some(50));

    h.store.complete_elsewhere(plan_id, 1).await;
    h.sync.reconnect_user(&h.alice).await.unwrap();
    h.wait_confirmed(plan_id, 100).await;
    assert!(h.sync.is_connected(&h.alice));
}

#[tokio::test]
async fn logout_purges_only_the_users_cache() {
    let h = Harness::new();
    let plan_id = h.add_plan(&[false, false]).await;
    let bob_key = cache_codec::cache_key(&UserId::new("bob"), PlanId::new(77));
    h.store.inner.set(&bob_key, &encoded(10)).await.unwrap();
    h.sync.attach_user(&h.alice).await.unwrap();
    h.sync.toggle_session_completion(plan_id, 0, 0).await.unwrap();
    assert!(h.cache_raw(plan_id).await.is_some());

    let removed = h.sync.logout(&h.alice).await.unwrap();

    assert_eq!(removed, 1);
    assert_eq!(h.cache_raw(plan_id).await, None);
    assert!(h.store.inner.get(&bob_key).await.unwrap().is_some());
    assert!(!h.sync.is_connected(&h.alice));
}

struct OutlineSummarizer;

#[async_trait]
impl ContentSummarizer for OutlineSummarizer {
    async fn summarize(
        &self,
        content: &str,
        preferences: &StudyPreferences,
    ) -> Result<PlanSkeleton, SummarizerError> {
        Ok(PlanSkeleton {
            overview: content.to_owned(),
            days: (1..=preferences.days)
                .map(|day_number| DaySkeleton {
                    day_number,
                    date: String::new(),
                    sessions: vec![SessionSkeleton {
                        title: format!("Part {day_number}"),
                        description: String::new(),
                        duration_minutes: preferences.minutes_per_day,
                    }],
                })
                .collect(),
        })
    }
}

#[tokio::test]
async fn generated_plan_syncs_through_sqlite() {
    let storage = Storage::sqlite("sqlite:file:memdb_sync_flow?mode=memory&cache=shared")
        .await
        .expect("sqlite storage");
    let app = AppServices::from_storage(
        storage,
        fixed_clock(),
        SyncConfig::manual(),
        Arc::new(OutlineSummarizer),
    );
    let user = UserId::new("carol");
    let prefs = StudyPreferences {
        days: 4,
        minutes_per_day: 25,
        start_date: None,
    };

    let plan_id = app
        .plans()
        .generate_plan(&user, "Chemistry", "Atoms and bonds", &prefs)
        .await
        .unwrap();
    let sync = app.sync();
    sync.attach_user(&user).await.unwrap();
    let mut observer = sync.observe_progress(plan_id).unwrap();

    sync.toggle_session_completion(plan_id, 2, 0).await.unwrap();

    let confirmed = timeout(
        Duration::from_secs(2),
        observer.wait_for(|update| {
            update.is_some_and(|u| u.phase == PlanPhase::RemoteConfirmed && u.progress == 25)
        }),
    )
    .await
    .expect("sqlite snapshot not applied in time")
    .unwrap()
    .unwrap();
    assert!(!confirmed.dirty);

    let stored = app.plans().get_plan(plan_id).await.unwrap().unwrap();
    assert_eq!(stored.progress(), 25);
    assert!(stored.session(2, 0).unwrap().is_completed());
}
