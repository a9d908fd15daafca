use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::model::ids::{PlanId, UserId};
use crate::progress::aggregate;

/// Milliseconds in one planned minute.
pub const MS_PER_MINUTE: u64 = 60_000;

//
// ─── ERRORS ────────────────────────────────────────────────────────────────────
//

#[derive(Debug, Error, Clone, PartialEq, Eq)]
#[non_exhaustive]
pub enum PlanError {
    #[error("plan title cannot be empty")]
    EmptyTitle,

    #[error("session title cannot be empty")]
    EmptySessionTitle,

    #[error("session duration must be > 0 minutes")]
    InvalidDuration,

    #[error("day numbers must start at 1 and increase (found {found}, expected > {previous})")]
    InvalidDayNumber { previous: u32, found: u32 },

    #[error("progress must be within 0..=100 (got {0})")]
    InvalidProgress(u16),

    #[error("no session at day {day_index}, session {session_index}")]
    SessionNotFound {
        day_index: usize,
        session_index: usize,
    },
}

//
// ─── SESSION ───────────────────────────────────────────────────────────────────
//

/// Smallest schedulable unit of study time within a day.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Session {
    title: String,
    #[serde(default)]
    description: String,
    duration_minutes: u32,
    #[serde(default)]
    completed: bool,
    #[serde(default)]
    time_spent_ms: u64,
}

impl Session {
    /// Creates a new, not yet started session.
    ///
    /// # Errors
    ///
    /// Returns `PlanError::EmptySessionTitle` or `PlanError::InvalidDuration`.
    pub fn new(
        title: impl Into<String>,
        description: impl Into<String>,
        duration_minutes: u32,
    ) -> Result<Self, PlanError> {
        let title = title.into();
        if title.trim().is_empty() {
            return Err(PlanError::EmptySessionTitle);
        }
        if duration_minutes == 0 {
            return Err(PlanError::InvalidDuration);
        }
        Ok(Self {
            title,
            description: description.into(),
            duration_minutes,
            completed: false,
            time_spent_ms: 0,
        })
    }

    #[must_use]
    pub fn title(&self) -> &str {
        &self.title
    }

    #[must_use]
    pub fn description(&self) -> &str {
        &self.description
    }

    #[must_use]
    pub fn duration_minutes(&self) -> u32 {
        self.duration_minutes
    }

    /// Planned duration in milliseconds.
    #[must_use]
    pub fn duration_ms(&self) -> u64 {
        u64::from(self.duration_minutes) * MS_PER_MINUTE
    }

    #[must_use]
    pub fn is_completed(&self) -> bool {
        self.completed
    }

    #[must_use]
    pub fn time_spent_ms(&self) -> u64 {
        self.time_spent_ms
    }

    /// Marks the session completed.
    ///
    /// A session completed without any tracked time gets its planned duration
    /// as an estimate, so it never shows as done with zero effort.
    pub fn mark_completed(&mut self) {
        self.completed = true;
        if self.time_spent_ms == 0 {
            self.time_spent_ms = self.duration_ms();
        }
    }

    /// Clears the completion flag. Tracked time is kept.
    pub fn mark_incomplete(&mut self) {
        self.completed = false;
    }

    /// Flips completion and returns the new state.
    pub fn toggle_completed(&mut self) -> bool {
        if self.completed {
            self.mark_incomplete();
        } else {
            self.mark_completed();
        }
        self.completed
    }

    /// Adds tracked study time.
    pub fn record_time(&mut self, elapsed_ms: u64) {
        self.time_spent_ms = self.time_spent_ms.saturating_add(elapsed_ms);
    }

    /// Raises tracked time to at least `floor_ms`; never lowers it.
    pub fn keep_time_at_least(&mut self, floor_ms: u64) {
        self.time_spent_ms = self.time_spent_ms.max(floor_ms);
    }
}

//
// ─── DAY ───────────────────────────────────────────────────────────────────────
//

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Day {
    day_number: u32,
    date: String,
    sessions: Vec<Session>,
}

impl Day {
    #[must_use]
    pub fn new(day_number: u32, date: impl Into<String>, sessions: Vec<Session>) -> Self {
        Self {
            day_number,
            date: date.into(),
            sessions,
        }
    }

    #[must_use]
    pub fn day_number(&self) -> u32 {
        self.day_number
    }

    #[must_use]
    pub fn date(&self) -> &str {
        &self.date
    }

    #[must_use]
    pub fn sessions(&self) -> &[Session] {
        &self.sessions
    }

    pub fn sessions_mut(&mut self) -> &mut [Session] {
        &mut self.sessions
    }
}

fn validate_days(days: &[Day]) -> Result<(), PlanError> {
    let mut previous = 0_u32;
    for day in days {
        if day.day_number <= previous {
            return Err(PlanError::InvalidDayNumber {
                previous,
                found: day.day_number,
            });
        }
        previous = day.day_number;
        for session in &day.sessions {
            if session.title.trim().is_empty() {
                return Err(PlanError::EmptySessionTitle);
            }
            if session.duration_minutes == 0 {
                return Err(PlanError::InvalidDuration);
            }
        }
    }
    Ok(())
}

//
// ─── PLAN ──────────────────────────────────────────────────────────────────────
//

/// Unsaved plan, produced by plan generation before the store assigns an id.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PlanDraft {
    pub user_id: UserId,
    pub title: String,
    pub overview: String,
    pub days: Vec<Day>,
}

impl PlanDraft {
    /// Validate the draft and stamp it with its creation time.
    ///
    /// # Errors
    ///
    /// Returns `PlanError` if the title is empty or the day tree is malformed.
    pub fn validate(self, now: DateTime<Utc>) -> Result<ValidatedPlan, PlanError> {
        if self.title.trim().is_empty() {
            return Err(PlanError::EmptyTitle);
        }
        validate_days(&self.days)?;
        let progress = aggregate(&self.days);
        Ok(ValidatedPlan {
            user_id: self.user_id,
            title: self.title.trim().to_owned(),
            overview: self.overview,
            days: self.days,
            progress,
            created_at: now,
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ValidatedPlan {
    pub user_id: UserId,
    pub title: String,
    pub overview: String,
    pub days: Vec<Day>,
    pub progress: u8,
    pub created_at: DateTime<Utc>,
}

impl ValidatedPlan {
    #[must_use]
    pub fn assign_id(self, id: PlanId) -> Plan {
        Plan {
            id,
            user_id: self.user_id,
            title: self.title,
            overview: self.overview,
            days: self.days,
            progress: self.progress,
            last_updated: self.created_at,
            created_at: self.created_at,
        }
    }
}

/// A multi-day study schedule owned by one user.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Plan {
    id: PlanId,
    user_id: UserId,
    title: String,
    overview: String,
    days: Vec<Day>,
    progress: u8,
    last_updated: DateTime<Utc>,
    created_at: DateTime<Utc>,
}

impl Plan {
    /// Rehydrate a plan from persisted storage.
    ///
    /// The stored `progress` is kept as-is; it may briefly disagree with the
    /// day tree while a write propagates.
    ///
    /// # Errors
    ///
    /// Returns `PlanError::InvalidProgress` if progress exceeds 100.
    #[allow(clippy::too_many_arguments)]
    pub fn from_persisted(
        id: PlanId,
        user_id: UserId,
        title: String,
        overview: String,
        days: Vec<Day>,
        progress: u16,
        last_updated: DateTime<Utc>,
        created_at: DateTime<Utc>,
    ) -> Result<Self, PlanError> {
        let progress = u8::try_from(progress)
            .ok()
            .filter(|p| *p <= 100)
            .ok_or(PlanError::InvalidProgress(progress))?;
        Ok(Self {
            id,
            user_id,
            title,
            overview,
            days,
            progress,
            last_updated,
            created_at,
        })
    }

    #[must_use]
    pub fn id(&self) -> PlanId {
        self.id
    }

    #[must_use]
    pub fn user_id(&self) -> &UserId {
        &self.user_id
    }

    #[must_use]
    pub fn title(&self) -> &str {
        &self.title
    }

    #[must_use]
    pub fn overview(&self) -> &str {
        &self.overview
    }

    #[must_use]
    pub fn days(&self) -> &[Day] {
        &self.days
    }

    #[must_use]
    pub fn progress(&self) -> u8 {
        self.progress
    }

    #[must_use]
    pub fn last_updated(&self) -> DateTime<Utc> {
        self.last_updated
    }

    #[must_use]
    pub fn created_at(&self) -> DateTime<Utc> {
        self.created_at
    }

    /// Total number of sessions across all days.
    #[must_use]
    pub fn session_count(&self) -> usize {
        self.days.iter().map(|day| day.sessions.len()).sum()
    }

    #[must_use]
    pub fn session(&self, day_index: usize, session_index: usize) -> Option<&Session> {
        self.days.get(day_index)?.sessions.get(session_index)
    }

    /// Mutable access to a session.
    ///
    /// # Errors
    ///
    /// Returns `PlanError::SessionNotFound` for out-of-range indices.
    pub fn session_mut(
        &mut self,
        day_index: usize,
        session_index: usize,
    ) -> Result<&mut Session, PlanError> {
        self.days
            .get_mut(day_index)
            .and_then(|day| day.sessions.get_mut(session_index))
            .ok_or(PlanError::SessionNotFound {
                day_index,
                session_index,
            })
    }

    /// Flip a session's completion, recompute progress, and return the new progress.
    ///
    /// # Errors
    ///
    /// Returns `PlanError::SessionNotFound` for out-of-range indices.
    pub fn toggle_session(
        &mut self,
        day_index: usize,
        session_index: usize,
        at: DateTime<Utc>,
    ) -> Result<u8, PlanError> {
        self.session_mut(day_index, session_index)?
            .toggle_completed();
        self.last_updated = at;
        Ok(self.refresh_progress())
    }

    /// Recompute `progress` from the day tree.
    pub fn refresh_progress(&mut self) -> u8 {
        self.progress = aggregate(&self.days);
        self.progress
    }

    /// Record that the plan was written at `at`.
    pub fn touch(&mut self, at: DateTime<Utc>) {
        self.last_updated = at;
    }

    /// Rename the plan.
    ///
    /// # Errors
    ///
    /// Returns `PlanError::EmptyTitle` if the new title is blank.
    pub fn rename(&mut self, title: impl Into<String>, at: DateTime<Utc>) -> Result<(), PlanError> {
        let title = title.into();
        if title.trim().is_empty() {
            return Err(PlanError::EmptyTitle);
        }
        self.title = title.trim().to_owned();
        self.last_updated = at;
        Ok(())
    }
}

//
// ─── TESTS ─────────────────────────────────────────────────────────────────────
//
