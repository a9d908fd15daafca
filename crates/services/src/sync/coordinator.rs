use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};
use std::time::Duration;

use storage::repository::{PlanPatch, PlanStore, ProgressCache, Storage, StorageError};
use storage::subscription::PlanSubscription;
use study_core::Clock;
use study_core::model::{Plan, PlanError, PlanId, SessionRef, UserId};
use study_core::timer::{SessionTimer, TimerError, TimerState};
use tokio::sync::watch;
use tokio::task::JoinHandle;

use super::cache_codec::{self, CachedProgress, cache_key, plan_id_from_key, user_prefix};
use super::state::{
    MutationOutcome, PendingWrite, PlanBook, PlanStatus, PlansObserver, ProgressObserver,
    TimerObserver, TimerOutcome, TimerView, session_in,
};
use crate::config::SyncConfig;
use crate::error::SyncError;

//
// ─── STATE ─────────────────────────────────────────────────────────────────────
//

struct ActiveTimer {
    timer: SessionTimer,
    driver: Option<JoinHandle<()>>,
}

impl ActiveTimer {
    fn stop_driver(&mut self) {
        if let Some(driver) = self.driver.take() {
            driver.abort();
        }
    }
}

#[derive(Default)]
struct State {
    book: PlanBook,
    /// The single running or paused timer.
    timer: Option<ActiveTimer>,
}

struct Inner {
    clock: Clock,
    config: SyncConfig,
    plans: Arc<dyn PlanStore>,
    cache: Arc<dyn ProgressCache>,
    state: Mutex<State>,
    /// Serializes cache writes with deletions so a purged entry is never rewritten.
    cache_gate: tokio::sync::Mutex<()>,
    timer_tx: watch::Sender<Option<TimerView>>,
}

impl Drop for Inner {
    fn drop(&mut self) {
        let state = self
            .state
            .get_mut()
            .unwrap_or_else(PoisonError::into_inner);
        for consumer in state.book.take_consumers() {
            consumer.abort();
        }
        if let Some(active) = state.timer.as_mut() {
            active.stop_driver();
        }
    }
}

//
// ─── COORDINATOR ───────────────────────────────────────────────────────────────
//

/// Reconciles cached, optimistic and remote progress for every plan the
/// client shows, and owns the one active session timer.
///
/// Cheap to clone; clones share the same state.
#[derive(Clone)]
pub struct SyncCoordinator {
    inner: Arc<Inner>,
}

impl SyncCoordinator {
    #[must_use]
    pub fn new(clock: Clock, storage: &Storage, config: SyncConfig) -> Self {
        Self {
            inner: Arc::new(Inner {
                clock,
                config,
                plans: Arc::clone(&storage.plans),
                cache: Arc::clone(&storage.cache),
                state: Mutex::new(State::default()),
                cache_gate: tokio::sync::Mutex::new(()),
                timer_tx: watch::channel(None).0,
            }),
        }
    }

    fn upgrade(weak: &Weak<Inner>) -> Option<Self> {
        weak.upgrade().map(|inner| Self { inner })
    }

    fn lock(&self) -> MutexGuard<'_, State> {
        self.inner
            .state
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    //
    // ─── USERS ─────────────────────────────────────────────────────────────────
    //

    /// Start serving `user_id`'s plans.
    ///
    /// Cached values are published first, then the live subscription is
    /// opened. Attaching an attached user is a no-op.
    ///
    /// # Errors
    ///
    /// Returns `SyncError::PersistenceUnavailable` if the subscription cannot
    /// be opened. Cached values stay published and `reconnect_user` can be
    /// retried.
    pub async fn attach_user(&self, user_id: &UserId) -> Result<(), SyncError> {
        {
            let mut state = self.lock();
            let user = state.book.user_mut(user_id);
            if user.attached {
                return Ok(());
            }
            user.attached = true;
        }
        log::info!("attaching user {user_id}");
        self.hydrate_from_cache(user_id).await;
        self.open_subscription(user_id).await
    }

    /// Replace a dropped subscription with a fresh one.
    ///
    /// # Errors
    ///
    /// Returns `SyncError::PersistenceUnavailable` if the subscription cannot be opened.
    pub async fn reconnect_user(&self, user_id: &UserId) -> Result<(), SyncError> {
        let attached = self
            .lock()
            .book
            .user(user_id)
            .is_some_and(|user| user.attached);
        if !attached {
            return self.attach_user(user_id).await;
        }
        log::info!("reconnecting user {user_id}");
        self.open_subscription(user_id).await
    }

    /// Stop serving `user_id`: flush and drop its timer, close the
    /// subscription and every observer of its plans. The cache is kept.
    pub async fn detach_user(&self, user_id: &UserId) {
        let (consumer, pending) = {
            let mut state = self.lock();
            let State { book, timer } = &mut *state;
            let owned = timer
                .as_ref()
                .is_some_and(|active| book.owner(active.timer.at().plan_id) == Some(user_id));
            let pending = match timer.take_if(|_| owned) {
                Some(active) => {
                    self.inner.timer_tx.send_replace(None);
                    self.stop_locked(book, active, false).1
                }
                None => None,
            };
            let consumer = book.remove_user(user_id).and_then(|user| user.consumer);
            (consumer, pending)
        };
        if let Some(consumer) = consumer {
            consumer.abort();
        }
        if let Some(pending) = pending {
            self.flush_write(pending).await;
        }
        log::info!("detached user {user_id}");
    }

    /// Detach `user_id` and purge every cached value it owns.
    ///
    /// # Errors
    ///
    /// Returns `SyncError::PersistenceUnavailable` if the cache purge fails.
    pub async fn logout(&self, user_id: &UserId) -> Result<usize, SyncError> {
        self.detach_user(user_id).await;
        let _gate = self.inner.cache_gate.lock().await;
        let removed = self
            .inner
            .cache
            .remove_matching(&user_prefix(user_id))
            .await
            .map_err(SyncError::PersistenceUnavailable)?;
        log::info!("logged out user {user_id}, purged {removed} cached values");
        Ok(removed)
    }

    #[must_use]
    pub fn is_connected(&self, user_id: &UserId) -> bool {
        self.lock()
            .book
            .user(user_id)
            .is_some_and(|user| user.connected)
    }

    async fn hydrate_from_cache(&self, user_id: &UserId) {
        let prefix = user_prefix(user_id);
        let keys = match self.inner.cache.keys_with_prefix(&prefix).await {
            Ok(keys) => keys,
            Err(err) => {
                log::warn!("cache unavailable for user {user_id}: {err}");
                return;
            }
        };
        for key in keys {
            let Some(plan_id) = plan_id_from_key(&key, &prefix) else {
                continue;
            };
            let raw = match self.inner.cache.get(&key).await {
                Ok(Some(raw)) => raw,
                Ok(None) => continue,
                Err(err) => {
                    log::warn!("cache read for {key} failed: {err}");
                    continue;
                }
            };
            match cache_codec::decode(&key, &raw) {
                Ok(cached) => {
                    self.lock().book.hydrate(user_id, plan_id, cached);
                }
                Err(err) => log::warn!("{err}; treating as a cache miss"),
            }
        }
    }

    async fn open_subscription(&self, user_id: &UserId) -> Result<(), SyncError> {
        let subscription = match self.inner.plans.subscribe(user_id).await {
            Ok(subscription) => subscription,
            Err(err) => {
                log::warn!("subscription for user {user_id} failed: {err}");
                if let Some(user) = self.lock().book.existing_user_mut(user_id) {
                    user.connected = false;
                }
                return Err(SyncError::PersistenceUnavailable(err));
            }
        };

        let mut state = self.lock();
        let Some(user) = state.book.existing_user_mut(user_id) else {
            return Ok(());
        };
        if let Some(previous) = user.consumer.take() {
            previous.abort();
        }
        user.generation += 1;
        user.connected = true;
        user.consumer = Some(self.spawn_consumer(user_id.clone(), subscription, user.generation));
        Ok(())
    }

    fn spawn_consumer(
        &self,
        user_id: UserId,
        mut subscription: PlanSubscription,
        generation: u64,
    ) -> JoinHandle<()> {
        let weak = Arc::downgrade(&self.inner);
        tokio::spawn(async move {
            while let Some(snapshot) = subscription.next_snapshot().await {
                let Some(coordinator) = Self::upgrade(&weak) else {
                    return;
                };
                coordinator.apply_snapshot(&user_id, snapshot).await;
            }
            if let Some(coordinator) = Self::upgrade(&weak) {
                coordinator.mark_disconnected(&user_id, generation);
            }
        })
    }

    fn mark_disconnected(&self, user_id: &UserId, generation: u64) {
        let mut state = self.lock();
        let Some(user) = state.book.existing_user_mut(user_id) else {
            return;
        };
        if user.generation == generation {
            user.connected = false;
            user.consumer = None;
            log::warn!("subscription for user {user_id} dropped, serving last known values");
        }
    }

    async fn apply_snapshot(&self, user_id: &UserId, snapshot: Vec<Plan>) {
        let outcome = {
            let mut state = self.lock();
            let State { book, timer } = &mut *state;
            let keep_time = timer.as_ref().and_then(|active| {
                let at = active.timer.at();
                book.session(at).ok().map(|session| (at, session.time_spent_ms()))
            });
            let outcome = book.apply_snapshot(user_id, snapshot, keep_time);

            if let Some(active) = timer.as_ref() {
                let at = active.timer.at();
                if book.is_deleted(at.plan_id) || book.session(at).is_err() {
                    log::warn!("discarding timer on {at}, its session is gone");
                    self.discard_timer(timer);
                } else {
                    self.inner
                        .timer_tx
                        .send_replace(Some(timer_view(&active.timer, book)));
                }
            }
            outcome
        };
        self.store_cached(&outcome.confirmed).await;
        self.purge_cached(user_id, &outcome.removed).await;
    }

    //
    // ─── OBSERVERS ─────────────────────────────────────────────────────────────
    //

    /// Latest progress of one plan.
    ///
    /// # Errors
    ///
    /// Returns `SyncError::PlanDeleted` for a deleted plan.
    pub fn observe_progress(&self, plan_id: PlanId) -> Result<ProgressObserver, SyncError> {
        self.lock().book.observe(plan_id)
    }

    /// Progress of every known plan of `user_id`.
    #[must_use]
    pub fn observe_all_plans_progress(&self, user_id: &UserId) -> PlansObserver {
        self.lock().book.observe_user(user_id)
    }

    #[must_use]
    pub fn observe_timer(&self) -> TimerObserver {
        self.inner.timer_tx.subscribe()
    }

    #[must_use]
    pub fn plan_status(&self, plan_id: PlanId) -> PlanStatus {
        self.lock().book.status(plan_id)
    }

    /// Stop observing a plan: flush and drop its timer, cancel the tick
    /// driver and close the plan's observer.
    pub async fn release_plan(&self, plan_id: PlanId) -> Option<MutationOutcome> {
        let pending = {
            let mut state = self.lock();
            let State { book, timer } = &mut *state;
            let pending = match timer.take_if(|active| active.timer.at().plan_id == plan_id) {
                Some(active) => {
                    self.inner.timer_tx.send_replace(None);
                    self.stop_locked(book, active, false).1
                }
                None => None,
            };
            book.close_observer(plan_id);
            pending
        };
        log::debug!("released plan {plan_id}");
        match pending {
            Some(pending) => Some(self.flush_write(pending).await),
            None => None,
        }
    }

    //
    // ─── MUTATIONS ─────────────────────────────────────────────────────────────
    //

    /// Flip a session's completion and save the plan.
    ///
    /// # Errors
    ///
    /// Returns `SyncError` if the plan or session cannot be found. A failed
    /// remote write is reported through `MutationOutcome::saved`.
    pub async fn toggle_session_completion(
        &self,
        plan_id: PlanId,
        day_index: usize,
        session_index: usize,
    ) -> Result<MutationOutcome, SyncError> {
        let at = SessionRef::new(plan_id, day_index, session_index);
        self.ensure_plan(plan_id).await?;
        let now = self.inner.clock.now();
        let pending = {
            let mut state = self.lock();
            let State { book, timer } = &mut *state;
            let (completed, pending) = book.mutate(plan_id, now, |plan| {
                Ok(session_in(plan, at)?.toggle_completed())
            })?;
            log::debug!("toggled {at}: completed={completed}");
            if let Some(active) = timer.as_ref().filter(|active| active.timer.at() == at) {
                self.inner
                    .timer_tx
                    .send_replace(Some(timer_view(&active.timer, book)));
            }
            pending
        };
        Ok(self.flush_write(pending).await)
    }

    /// Write the current in-memory tree of a dirty plan again.
    ///
    /// # Errors
    ///
    /// Returns `SyncError` if the plan is unknown or deleted.
    pub async fn retry_save(&self, plan_id: PlanId) -> Result<MutationOutcome, SyncError> {
        self.ensure_plan(plan_id).await?;
        let pending = self.lock().book.resend(plan_id)?;
        Ok(self.flush_write(pending).await)
    }

    /// Delete a plan remotely, then forget it locally for good.
    ///
    /// Late snapshots that still contain the plan are ignored.
    ///
    /// # Errors
    ///
    /// Returns `SyncError::PersistenceUnavailable` if the remote delete fails,
    /// or `SyncError::PlanNotFound` for a plan that was never seen.
    pub async fn delete_plan(&self, plan_id: PlanId) -> Result<(), SyncError> {
        let known = {
            let state = self.lock();
            if state.book.is_deleted(plan_id) {
                return Ok(());
            }
            state.book.owner(plan_id).is_some()
        };
        if !known {
            self.ensure_plan(plan_id).await?;
        }

        match self.inner.plans.delete_plan(plan_id).await {
            Ok(()) | Err(StorageError::NotFound) => {}
            Err(err) => return Err(SyncError::PersistenceUnavailable(err)),
        }

        let _gate = self.inner.cache_gate.lock().await;
        let owner = {
            let mut state = self.lock();
            let State { book, timer } = &mut *state;
            if timer
                .as_ref()
                .is_some_and(|active| active.timer.at().plan_id == plan_id)
            {
                self.discard_timer(timer);
            }
            book.tombstone(plan_id)
        };
        if let Some(owner) = owner {
            if let Err(err) = self.inner.cache.remove(&cache_key(&owner, plan_id)).await {
                log::warn!("cache purge for plan {plan_id} failed: {err}");
            }
        }
        log::info!("deleted plan {plan_id}");
        Ok(())
    }

    //
    // ─── TIMER ─────────────────────────────────────────────────────────────────
    //

    /// Start timing a session. Any other active timer is stopped without
    /// completing its session, and its tracked time is saved.
    ///
    /// # Errors
    ///
    /// Returns `SyncError::InvalidState` if this session's timer is already
    /// active, or a lookup error for unknown plans and sessions.
    pub async fn start_session(
        &self,
        plan_id: PlanId,
        day_index: usize,
        session_index: usize,
        duration_minutes: u32,
    ) -> Result<TimerOutcome, SyncError> {
        let at = SessionRef::new(plan_id, day_index, session_index);
        if duration_minutes == 0 {
            return Err(SyncError::Plan(PlanError::InvalidDuration));
        }
        self.ensure_plan(plan_id).await?;

        let (view, previous) = {
            let mut state = self.lock();
            let State { book, timer } = &mut *state;
            if let Some(active) = timer.as_ref().filter(|active| active.timer.at() == at) {
                return Err(invalid(TimerError::InvalidState {
                    operation: "start",
                    state: active.timer.state(),
                }));
            }
            let mut fresh = SessionTimer::new(self.inner.clock.clone(), at);
            fresh
                .start(book.session(at)?, duration_minutes)
                .map_err(invalid)?;
            let previous = timer
                .take()
                .and_then(|active| self.stop_locked(book, active, false).1);
            let view = timer_view(&fresh, book);
            *timer = Some(ActiveTimer {
                timer: fresh,
                driver: None,
            });
            self.inner.timer_tx.send_replace(Some(view));
            (view, previous)
        };
        log::debug!("timer started on {at} for {duration_minutes} minutes");

        self.spawn_driver(at);
        let write = match previous {
            Some(pending) => Some(self.flush_write(pending).await),
            None => None,
        };
        Ok(TimerOutcome { view, write })
    }

    /// Pause the active timer and save the time it tracked.
    ///
    /// # Errors
    ///
    /// Returns `SyncError::NoActiveTimer` if this session is not being timed,
    /// or `SyncError::InvalidState` if its timer is already paused.
    pub async fn pause_session(
        &self,
        plan_id: PlanId,
        day_index: usize,
        session_index: usize,
    ) -> Result<TimerOutcome, SyncError> {
        let at = SessionRef::new(plan_id, day_index, session_index);
        let now = self.inner.clock.now();
        let (view, pending) = {
            let mut state = self.lock();
            let State { book, timer } = &mut *state;
            let active = timer
                .as_mut()
                .filter(|active| active.timer.at() == at)
                .ok_or(SyncError::NoActiveTimer)?;
            let (after, pending) = book.mutate(plan_id, now, |plan| {
                active
                    .timer
                    .pause(session_in(plan, at)?)
                    .map_err(invalid)
            })?;
            active.stop_driver();
            let view = timer_view(&active.timer, book);
            if after.is_terminal() {
                log::info!("session {at} completed");
                *timer = None;
            }
            self.inner.timer_tx.send_replace(Some(view));
            (view, pending)
        };
        Ok(TimerOutcome {
            view,
            write: Some(self.flush_write(pending).await),
        })
    }

    /// Resume a paused timer.
    ///
    /// # Errors
    ///
    /// Returns `SyncError::NoActiveTimer` if this session is not being timed,
    /// or `SyncError::InvalidState` if its timer is not paused.
    pub async fn resume_session(
        &self,
        plan_id: PlanId,
        day_index: usize,
        session_index: usize,
    ) -> Result<TimerView, SyncError> {
        let at = SessionRef::new(plan_id, day_index, session_index);
        let view = {
            let mut state = self.lock();
            let State { book, timer } = &mut *state;
            let active = timer
                .as_mut()
                .filter(|active| active.timer.at() == at)
                .ok_or(SyncError::NoActiveTimer)?;
            active.timer.resume().map_err(invalid)?;
            let view = timer_view(&active.timer, book);
            self.inner.timer_tx.send_replace(Some(view));
            view
        };
        self.spawn_driver(at);
        Ok(view)
    }

    /// End the active timer, optionally completing its session.
    ///
    /// # Errors
    ///
    /// Returns `SyncError::NoActiveTimer` if this session is not being timed.
    pub async fn stop_session(
        &self,
        plan_id: PlanId,
        day_index: usize,
        session_index: usize,
        mark_completed: bool,
    ) -> Result<TimerOutcome, SyncError> {
        let at = SessionRef::new(plan_id, day_index, session_index);
        let (view, pending) = {
            let mut state = self.lock();
            let State { book, timer } = &mut *state;
            let active = timer
                .take_if(|active| active.timer.at() == at)
                .ok_or(SyncError::NoActiveTimer)?;
            let (view, pending) = self.stop_locked(book, active, mark_completed);
            self.inner.timer_tx.send_replace(Some(view));
            (view, pending)
        };
        let write = match pending {
            Some(pending) => Some(self.flush_write(pending).await),
            None => None,
        };
        Ok(TimerOutcome { view, write })
    }

    /// Recompute the active countdown; completes and saves the session when
    /// it reaches zero. The spawned tick driver calls this.
    ///
    /// # Errors
    ///
    /// Returns `SyncError::NoActiveTimer` when nothing is being timed.
    pub async fn tick(&self) -> Result<TimerOutcome, SyncError> {
        let now = self.inner.clock.now();
        let (view, pending) = {
            let mut state = self.lock();
            let State { book, timer } = &mut *state;
            let active = timer.as_mut().ok_or(SyncError::NoActiveTimer)?;
            let at = active.timer.at();
            let tick = active
                .timer
                .tick(book.session_mut(at)?)
                .map_err(invalid)?;
            let pending = if tick.completed_now {
                log::info!("session {at} completed");
                Some(book.commit(at.plan_id, now)?)
            } else {
                None
            };
            let view = timer_view(&active.timer, book);
            if tick.state.is_terminal() {
                // The driver may be the caller, so it is detached rather than aborted.
                *timer = None;
            }
            self.inner.timer_tx.send_replace(Some(view));
            (view, pending)
        };
        let write = match pending {
            Some(pending) => Some(self.flush_write(pending).await),
            None => None,
        };
        Ok(TimerOutcome { view, write })
    }

    /// Current view of the active timer, if any.
    #[must_use]
    pub fn active_timer(&self) -> Option<TimerView> {
        let state = self.lock();
        state
            .timer
            .as_ref()
            .map(|active| timer_view(&active.timer, &state.book))
    }

    fn spawn_driver(&self, at: SessionRef) {
        let Some(interval) = self.inner.config.tick_interval else {
            return;
        };
        let weak = Arc::downgrade(&self.inner);
        let driver = tokio::spawn(async move {
            loop {
                let Some(wait) = Self::upgrade(&weak).and_then(|c| c.driver_wait(at, interval))
                else {
                    break;
                };
                tokio::time::sleep(wait).await;
                let Some(coordinator) = Self::upgrade(&weak) else {
                    break;
                };
                match coordinator.tick().await {
                    Ok(outcome)
                        if outcome.view.at == at && outcome.view.state == TimerState::Running => {}
                    Ok(_) => break,
                    Err(err) => {
                        log::debug!("tick driver for {at} stopped: {err}");
                        break;
                    }
                }
            }
        });

        let mut state = self.lock();
        match state
            .timer
            .as_mut()
            .filter(|active| active.timer.at() == at && active.timer.state() == TimerState::Running)
        {
            Some(active) => {
                if let Some(previous) = active.driver.replace(driver) {
                    previous.abort();
                }
            }
            None => driver.abort(),
        }
    }

    fn driver_wait(&self, at: SessionRef, interval: Duration) -> Option<Duration> {
        let state = self.lock();
        let active = state.timer.as_ref().filter(|active| {
            active.timer.at() == at && active.timer.state() == TimerState::Running
        })?;
        let remaining = Duration::from_millis(active.timer.remaining_ms().max(1));
        Some(interval.min(remaining))
    }

    /// Stop a timer that was taken out of the active slot and commit the
    /// flushed time. Failures leave the plan untouched.
    fn stop_locked(
        &self,
        book: &mut PlanBook,
        mut active: ActiveTimer,
        mark_completed: bool,
    ) -> (TimerView, Option<PendingWrite>) {
        active.stop_driver();
        let at = active.timer.at();
        let now = self.inner.clock.now();
        let result = book.mutate(at.plan_id, now, |plan| {
            active
                .timer
                .stop(session_in(plan, at)?, mark_completed)
                .map_err(invalid)
        });
        let pending = match result {
            Ok((state, pending)) => {
                log::debug!("timer on {at} ended: {state}");
                Some(pending)
            }
            Err(err) => {
                log::warn!("could not flush timer on {at}: {err}");
                None
            }
        };
        (timer_view(&active.timer, book), pending)
    }

    fn discard_timer(&self, timer: &mut Option<ActiveTimer>) {
        if let Some(mut active) = timer.take() {
            active.stop_driver();
            log::debug!("timer on {} discarded", active.timer.at());
            self.inner.timer_tx.send_replace(None);
        }
    }

    //
    // ─── PERSISTENCE ───────────────────────────────────────────────────────────
    //

    async fn ensure_plan(&self, plan_id: PlanId) -> Result<(), SyncError> {
        {
            let state = self.lock();
            if state.book.is_deleted(plan_id) {
                return Err(SyncError::PlanDeleted(plan_id));
            }
            if state.book.has_tree(plan_id) {
                return Ok(());
            }
        }
        let plan = self
            .inner
            .plans
            .get_plan(plan_id)
            .await
            .map_err(|err| SyncError::from_lookup(plan_id, err))?;
        self.lock().book.accept_fetched(plan)
    }

    /// Write the cache, then the remote store. Never retried.
    async fn flush_write(&self, mut pending: PendingWrite) -> MutationOutcome {
        self.cache_pending(&pending).await;

        let patch = PlanPatch::new(pending.last_updated)
            .with_days(std::mem::take(&mut pending.days))
            .with_progress(pending.progress);
        let saved = match self.inner.plans.update_plan(pending.plan_id, patch).await {
            Ok(()) => true,
            Err(err) => {
                if self.lock().book.is_deleted(pending.plan_id) {
                    log::debug!("dropped write for deleted plan {}: {err}", pending.plan_id);
                } else {
                    log::warn!(
                        "saving plan {} failed, keeping local value: {err}",
                        pending.plan_id
                    );
                }
                false
            }
        };
        self.lock().book.record_write(&pending, saved);
        MutationOutcome {
            plan_id: pending.plan_id,
            progress: pending.progress,
            saved,
        }
    }

    /// Cache the latest in-memory value of a plan, or the pending value once
    /// the plan is no longer tracked.
    async fn cache_pending(&self, pending: &PendingWrite) {
        let _gate = self.inner.cache_gate.lock().await;
        let value = {
            let state = self.lock();
            if state.book.is_deleted(pending.plan_id) {
                return;
            }
            state
                .book
                .cached_value(pending.plan_id)
                .unwrap_or_else(|| (pending.user_id.clone(), pending.cached()))
        };
        self.write_cache(&value.0, pending.plan_id, &value.1).await;
    }

    async fn store_cached(&self, plan_ids: &[PlanId]) {
        if plan_ids.is_empty() {
            return;
        }
        let _gate = self.inner.cache_gate.lock().await;
        for plan_id in plan_ids {
            let value = self.lock().book.cached_value(*plan_id);
            if let Some((user_id, cached)) = value {
                self.write_cache(&user_id, *plan_id, &cached).await;
            }
        }
    }

    async fn purge_cached(&self, user_id: &UserId, plan_ids: &[PlanId]) {
        if plan_ids.is_empty() {
            return;
        }
        let _gate = self.inner.cache_gate.lock().await;
        for plan_id in plan_ids {
            if let Err(err) = self.inner.cache.remove(&cache_key(user_id, *plan_id)).await {
                log::warn!("cache purge for plan {plan_id} failed: {err}");
            }
        }
    }

    async fn write_cache(&self, user_id: &UserId, plan_id: PlanId, cached: &CachedProgress) {
        let key = cache_key(user_id, plan_id);
        let raw = match cache_codec::encode(&key, cached) {
            Ok(raw) => raw,
            Err(err) => {
                log::warn!("{err}");
                return;
            }
        };
        if let Err(err) = self.inner.cache.set(&key, &raw).await {
            log::warn!("cache write for plan {plan_id} failed: {err}");
        }
    }
}

fn invalid(err: TimerError) -> SyncError {
    log::error!("timer misuse: {err}");
    SyncError::InvalidState(err)
}

fn timer_view(timer: &SessionTimer, book: &PlanBook) -> TimerView {
    TimerView {
        at: timer.at(),
        state: timer.state(),
        duration_ms: timer.duration_ms(),
        remaining_ms: timer.remaining_ms(),
        time_spent_ms: book
            .session(timer.at())
            .map_or(0, |session| session.time_spent_ms()),
    }
}
