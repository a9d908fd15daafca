//! Per-plan bookkeeping of the sync coordinator.
//!
//! Everything here is synchronous and runs under the coordinator's state
//! lock. Each change is published to observers before the lock is released.

use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet};

use chrono::{DateTime, Utc};
use study_core::aggregate;
use study_core::model::{Day, Plan, PlanError, PlanId, Session, SessionRef, UserId};
use study_core::timer::TimerState;
use tokio::sync::watch;
use tokio::task::JoinHandle;

use super::cache_codec::CachedProgress;
use crate::error::SyncError;

//
// ─── PUBLIC VIEW TYPES ─────────────────────────────────────────────────────────
//

/// Where the value currently shown for a plan came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PlanPhase {
    Uninitialized,
    /// Provisional value read from the local cache.
    CacheHydrated,
    /// Value taken from the remote store.
    RemoteConfirmed,
    /// Optimistic local value, possibly not yet saved.
    LocallyMutated,
    /// Terminal.
    Deleted,
}

/// Latest progress value published for one plan.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ProgressUpdate {
    pub plan_id: PlanId,
    pub progress: u8,
    pub phase: PlanPhase,
    /// The last local write has not reached the remote store.
    pub dirty: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PlanStatus {
    pub plan_id: PlanId,
    pub phase: PlanPhase,
    pub progress: Option<u8>,
    pub dirty: bool,
    pub last_updated: Option<DateTime<Utc>>,
}

/// Result of a local mutation. `saved` is false when the remote write failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MutationOutcome {
    pub plan_id: PlanId,
    pub progress: u8,
    pub saved: bool,
}

/// Display state of the active session timer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TimerView {
    pub at: SessionRef,
    pub state: TimerState,
    pub duration_ms: u64,
    pub remaining_ms: u64,
    pub time_spent_ms: u64,
}

/// Result of a timer operation, with the write it caused if any.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TimerOutcome {
    pub view: TimerView,
    pub write: Option<MutationOutcome>,
}

pub type ProgressObserver = watch::Receiver<Option<ProgressUpdate>>;
pub type PlansObserver = watch::Receiver<BTreeMap<PlanId, u8>>;
pub type TimerObserver = watch::Receiver<Option<TimerView>>;

//
// ─── INTERNAL STATE ────────────────────────────────────────────────────────────
//

/// A local change waiting to be written to the cache and the remote store.
#[derive(Debug, Clone)]
pub(crate) struct PendingWrite {
    pub user_id: UserId,
    pub plan_id: PlanId,
    pub days: Vec<Day>,
    pub progress: u8,
    pub last_updated: DateTime<Utc>,
    pub seq: u64,
}

impl PendingWrite {
    pub fn cached(&self) -> CachedProgress {
        CachedProgress {
            progress: self.progress,
            last_updated: self.last_updated,
        }
    }
}

#[derive(Debug)]
struct PlanEntry {
    user_id: UserId,
    plan: Option<Plan>,
    progress: Option<u8>,
    last_updated: Option<DateTime<Utc>>,
    phase: PlanPhase,
    dirty: bool,
    write_seq: u64,
    /// Fetched on demand and not yet part of any snapshot.
    awaiting_snapshot: bool,
}

impl PlanEntry {
    fn new(user_id: UserId) -> Self {
        Self {
            user_id,
            plan: None,
            progress: None,
            last_updated: None,
            phase: PlanPhase::Uninitialized,
            dirty: false,
            write_seq: 0,
            awaiting_snapshot: false,
        }
    }

    fn accept_remote(&mut self, plan: Plan) {
        self.progress = Some(plan.progress());
        self.last_updated = Some(plan.last_updated());
        self.phase = PlanPhase::RemoteConfirmed;
        self.dirty = false;
        self.plan = Some(plan);
    }

    fn update(&self, plan_id: PlanId) -> Option<ProgressUpdate> {
        Some(ProgressUpdate {
            plan_id,
            progress: self.progress?,
            phase: self.phase,
            dirty: self.dirty,
        })
    }
}

/// Per-user subscription bookkeeping and the all-plans channel.
#[derive(Debug)]
pub(crate) struct UserEntry {
    plans_tx: watch::Sender<BTreeMap<PlanId, u8>>,
    pub attached: bool,
    pub connected: bool,
    pub generation: u64,
    pub consumer: Option<JoinHandle<()>>,
}

/// What a snapshot changed.
#[derive(Debug, Default)]
pub(crate) struct SnapshotOutcome {
    pub confirmed: Vec<PlanId>,
    pub removed: Vec<PlanId>,
}

#[derive(Debug, Default)]
pub(crate) struct PlanBook {
    entries: HashMap<PlanId, PlanEntry>,
    observers: HashMap<PlanId, watch::Sender<Option<ProgressUpdate>>>,
    users: HashMap<UserId, UserEntry>,
    tombstones: HashSet<PlanId>,
}

impl PlanBook {
    pub fn is_deleted(&self, plan_id: PlanId) -> bool {
        self.tombstones.contains(&plan_id)
    }

    pub fn has_tree(&self, plan_id: PlanId) -> bool {
        self.entries
            .get(&plan_id)
            .is_some_and(|entry| entry.plan.is_some())
    }

    pub fn owner(&self, plan_id: PlanId) -> Option<&UserId> {
        self.entries.get(&plan_id).map(|entry| &entry.user_id)
    }

    /// Publish a cached value, unless something fresher is already known.
    pub fn hydrate(&mut self, user_id: &UserId, plan_id: PlanId, cached: CachedProgress) -> bool {
        if self.is_deleted(plan_id) {
            return false;
        }
        let entry = self
            .entries
            .entry(plan_id)
            .or_insert_with(|| PlanEntry::new(user_id.clone()));
        if entry.phase != PlanPhase::Uninitialized {
            return false;
        }
        entry.progress = Some(cached.progress);
        entry.last_updated = Some(cached.last_updated);
        entry.phase = PlanPhase::CacheHydrated;
        self.publish(plan_id);
        true
    }

    /// Adopt a plan fetched on demand. A tree already known is kept.
    pub fn accept_fetched(&mut self, plan: Plan) -> Result<(), SyncError> {
        let plan_id = plan.id();
        if self.is_deleted(plan_id) {
            return Err(SyncError::PlanDeleted(plan_id));
        }
        let entry = self
            .entries
            .entry(plan_id)
            .or_insert_with(|| PlanEntry::new(plan.user_id().clone()));
        if entry.plan.is_none() {
            entry.accept_remote(plan);
            entry.awaiting_snapshot = true;
            self.publish(plan_id);
        }
        Ok(())
    }

    fn tree_mut(&mut self, plan_id: PlanId) -> Result<&mut Plan, SyncError> {
        if self.is_deleted(plan_id) {
            return Err(SyncError::PlanDeleted(plan_id));
        }
        self.entries
            .get_mut(&plan_id)
            .and_then(|entry| entry.plan.as_mut())
            .ok_or(SyncError::PlanNotFound(plan_id))
    }

    pub fn session(&self, at: SessionRef) -> Result<&Session, SyncError> {
        if self.is_deleted(at.plan_id) {
            return Err(SyncError::PlanDeleted(at.plan_id));
        }
        self.entries
            .get(&at.plan_id)
            .and_then(|entry| entry.plan.as_ref())
            .ok_or(SyncError::PlanNotFound(at.plan_id))?
            .session(at.day_index, at.session_index)
            .ok_or(SyncError::SessionNotFound(at))
    }

    pub fn session_mut(&mut self, at: SessionRef) -> Result<&mut Session, SyncError> {
        session_in(self.tree_mut(at.plan_id)?, at)
    }

    /// Apply `change` to the plan tree, then commit it as a local mutation.
    ///
    /// Nothing is modified or published when `change` fails.
    pub fn mutate<T>(
        &mut self,
        plan_id: PlanId,
        now: DateTime<Utc>,
        change: impl FnOnce(&mut Plan) -> Result<T, SyncError>,
    ) -> Result<(T, PendingWrite), SyncError> {
        let value = change(self.tree_mut(plan_id)?)?;
        Ok((value, self.commit(plan_id, now)?))
    }

    /// Recompute progress for an already modified tree and publish it optimistically.
    pub fn commit(&mut self, plan_id: PlanId, now: DateTime<Utc>) -> Result<PendingWrite, SyncError> {
        let entry = self
            .entries
            .get_mut(&plan_id)
            .ok_or(SyncError::PlanNotFound(plan_id))?;
        let plan = entry
            .plan
            .as_mut()
            .ok_or(SyncError::PlanNotFound(plan_id))?;
        let progress = plan.refresh_progress();
        plan.touch(now);
        let days = plan.days().to_vec();

        entry.progress = Some(progress);
        entry.last_updated = Some(now);
        entry.phase = PlanPhase::LocallyMutated;
        entry.write_seq += 1;
        let pending = PendingWrite {
            user_id: entry.user_id.clone(),
            plan_id,
            days,
            progress,
            last_updated: now,
            seq: entry.write_seq,
        };
        self.publish(plan_id);
        Ok(pending)
    }

    /// Re-issue the current in-memory tree without changing it.
    pub fn resend(&mut self, plan_id: PlanId) -> Result<PendingWrite, SyncError> {
        let plan = self.tree_mut(plan_id)?;
        let days = plan.days().to_vec();
        let progress = plan.progress();
        let last_updated = plan.last_updated();
        let entry = self
            .entries
            .get_mut(&plan_id)
            .ok_or(SyncError::PlanNotFound(plan_id))?;
        entry.write_seq += 1;
        Ok(PendingWrite {
            user_id: entry.user_id.clone(),
            plan_id,
            days,
            progress,
            last_updated,
            seq: entry.write_seq,
        })
    }

    /// Record whether a remote write landed.
    ///
    /// A failure always flags the plan dirty. A success only clears the flag
    /// when no newer write was issued in the meantime.
    pub fn record_write(&mut self, pending: &PendingWrite, saved: bool) {
        let Some(entry) = self.entries.get_mut(&pending.plan_id) else {
            return;
        };
        let dirty = if saved {
            entry.dirty && entry.write_seq != pending.seq
        } else {
            true
        };
        if dirty != entry.dirty {
            entry.dirty = dirty;
            self.publish(pending.plan_id);
        }
    }

    /// Apply a full snapshot of `user_id`'s plans.
    ///
    /// Every plan in the snapshot replaces the local value. `keep_time` names
    /// the session of a running timer whose tracked time must not go down;
    /// no other session is protected, so an older snapshot may briefly lower
    /// a stopped session's time until the newer one arrives.
    ///
    /// Known plans of the user that are missing from the snapshot are
    /// forgotten, not tombstoned, and a later snapshot containing them adopts
    /// them again. Plans fetched on demand stay until a snapshot has included
    /// them, since the snapshot may predate their creation.
    pub fn apply_snapshot(
        &mut self,
        user_id: &UserId,
        snapshot: Vec<Plan>,
        keep_time: Option<(SessionRef, u64)>,
    ) -> SnapshotOutcome {
        let mut outcome = SnapshotOutcome::default();
        let mut seen = BTreeSet::new();

        for mut plan in snapshot {
            let plan_id = plan.id();
            if plan.user_id() != user_id {
                continue;
            }
            if self.is_deleted(plan_id) {
                log::debug!("ignoring snapshot entry for deleted plan {plan_id}");
                continue;
            }
            if let Some((at, floor)) = keep_time.filter(|(at, _)| at.plan_id == plan_id) {
                if let Ok(session) = session_in(&mut plan, at) {
                    session.keep_time_at_least(floor);
                }
            }
            let computed = aggregate(plan.days());
            if computed != plan.progress() {
                log::debug!(
                    "plan {plan_id}: stored progress {} differs from session tree ({computed})",
                    plan.progress()
                );
            }

            seen.insert(plan_id);
            let entry = self
                .entries
                .entry(plan_id)
                .or_insert_with(|| PlanEntry::new(user_id.clone()));
            entry.accept_remote(plan);
            entry.awaiting_snapshot = false;
            self.publish(plan_id);
            outcome.confirmed.push(plan_id);
        }

        outcome.removed = self
            .entries
            .iter()
            .filter(|(plan_id, entry)| {
                &entry.user_id == user_id && !entry.awaiting_snapshot && !seen.contains(*plan_id)
            })
            .map(|(plan_id, _)| *plan_id)
            .collect();
        outcome.removed.sort();
        for plan_id in &outcome.removed {
            log::info!("plan {plan_id} disappeared from the remote store");
            self.forget(*plan_id);
        }
        outcome
    }

    /// Mark a plan deleted for good and close its observers.
    ///
    /// Returns the plan's owner when it was known.
    pub fn tombstone(&mut self, plan_id: PlanId) -> Option<UserId> {
        self.tombstones.insert(plan_id);
        self.forget(plan_id)
    }

    /// Drop a plan's entry, close its observer and remove it from the
    /// all-plans map. The plan can be adopted again later.
    fn forget(&mut self, plan_id: PlanId) -> Option<UserId> {
        let entry = self.entries.remove(&plan_id);
        if let Some(tx) = self.observers.remove(&plan_id) {
            tx.send_replace(Some(ProgressUpdate {
                plan_id,
                progress: entry.as_ref().and_then(|e| e.progress).unwrap_or(0),
                phase: PlanPhase::Deleted,
                dirty: false,
            }));
        }
        let user_id = entry?.user_id;
        if let Some(user) = self.users.get(&user_id) {
            user.plans_tx
                .send_if_modified(|map| map.remove(&plan_id).is_some());
        }
        Some(user_id)
    }

    /// Drop the plan's observer channel; receivers see it close.
    pub fn close_observer(&mut self, plan_id: PlanId) {
        self.observers.remove(&plan_id);
    }

    pub fn observe(&mut self, plan_id: PlanId) -> Result<ProgressObserver, SyncError> {
        if self.is_deleted(plan_id) {
            return Err(SyncError::PlanDeleted(plan_id));
        }
        let current = self
            .entries
            .get(&plan_id)
            .and_then(|entry| entry.update(plan_id));
        Ok(self
            .observers
            .entry(plan_id)
            .or_insert_with(|| watch::channel(current).0)
            .subscribe())
    }

    pub fn observe_user(&mut self, user_id: &UserId) -> PlansObserver {
        self.user_mut(user_id).plans_tx.subscribe()
    }

    pub fn user(&self, user_id: &UserId) -> Option<&UserEntry> {
        self.users.get(user_id)
    }

    pub fn existing_user_mut(&mut self, user_id: &UserId) -> Option<&mut UserEntry> {
        self.users.get_mut(user_id)
    }

    /// The user's entry, created with the current all-plans map if missing.
    pub fn user_mut(&mut self, user_id: &UserId) -> &mut UserEntry {
        let current = if self.users.contains_key(user_id) {
            BTreeMap::new()
        } else {
            self.progress_map(user_id)
        };
        self.users
            .entry(user_id.clone())
            .or_insert_with(|| UserEntry {
                plans_tx: watch::channel(current).0,
                attached: false,
                connected: false,
                generation: 0,
                consumer: None,
            })
    }

    /// Forget everything known about `user_id`. Nothing is tombstoned.
    pub fn remove_user(&mut self, user_id: &UserId) -> Option<UserEntry> {
        let plan_ids = self.user_plan_ids(user_id);
        for plan_id in plan_ids {
            self.entries.remove(&plan_id);
            self.observers.remove(&plan_id);
        }
        self.users.remove(user_id)
    }

    pub fn user_plan_ids(&self, user_id: &UserId) -> Vec<PlanId> {
        let mut ids: Vec<PlanId> = self
            .entries
            .iter()
            .filter(|(_, entry)| &entry.user_id == user_id)
            .map(|(plan_id, _)| *plan_id)
            .collect();
        ids.sort();
        ids
    }

    /// Value to write to the cache for a live plan.
    pub fn cached_value(&self, plan_id: PlanId) -> Option<(UserId, CachedProgress)> {
        if self.is_deleted(plan_id) {
            return None;
        }
        let entry = self.entries.get(&plan_id)?;
        Some((
            entry.user_id.clone(),
            CachedProgress {
                progress: entry.progress?,
                last_updated: entry.last_updated?,
            },
        ))
    }

    pub fn status(&self, plan_id: PlanId) -> PlanStatus {
        if self.is_deleted(plan_id) {
            return PlanStatus {
                plan_id,
                phase: PlanPhase::Deleted,
                progress: None,
                dirty: false,
                last_updated: None,
            };
        }
        match self.entries.get(&plan_id) {
            Some(entry) => PlanStatus {
                plan_id,
                phase: entry.phase,
                progress: entry.progress,
                dirty: entry.dirty,
                last_updated: entry.last_updated,
            },
            None => PlanStatus {
                plan_id,
                phase: PlanPhase::Uninitialized,
                progress: None,
                dirty: false,
                last_updated: None,
            },
        }
    }

    /// Take every subscription consumer task handle.
    pub fn take_consumers(&mut self) -> Vec<JoinHandle<()>> {
        self.users
            .values_mut()
            .filter_map(|user| user.consumer.take())
            .collect()
    }

    fn progress_map(&self, user_id: &UserId) -> BTreeMap<PlanId, u8> {
        self.entries
            .iter()
            .filter(|(_, entry)| &entry.user_id == user_id)
            .filter_map(|(plan_id, entry)| Some((*plan_id, entry.progress?)))
            .collect()
    }

    fn publish(&mut self, plan_id: PlanId) {
        let Some(entry) = self.entries.get(&plan_id) else {
            return;
        };
        let Some(update) = entry.update(plan_id) else {
            return;
        };
        if let Some(tx) = self.observers.get(&plan_id) {
            tx.send_replace(Some(update));
        }
        if let Some(user) = self.users.get(&entry.user_id) {
            user.plans_tx
                .send_if_modified(|map| map.insert(plan_id, update.progress) != Some(update.progress));
        }
        log::debug!(
            "plan {plan_id}: progress {} ({:?}{})",
            update.progress,
            update.phase,
            if update.dirty { ", dirty" } else { "" }
        );
    }
}

pub(crate) fn session_in(plan: &mut Plan, at: SessionRef) -> Result<&mut Session, SyncError> {
    plan.session_mut(at.day_index, at.session_index)
        .map_err(|err| match err {
            PlanError::SessionNotFound { .. } => SyncError::SessionNotFound(at),
            other => SyncError::Plan(other),
        })
}
