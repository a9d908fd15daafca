//! Per-session stopwatch with drift-free countdown.
//!
//! Remaining time is always recomputed from the instant the timer last
//! started running, never by counting ticks, so missed or throttled ticks
//! cannot desynchronize the countdown from real elapsed time.

use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::model::{MS_PER_MINUTE, Session, SessionRef};
use crate::time::{Clock, elapsed_ms};

//
// ─── STATE ─────────────────────────────────────────────────────────────────────
//

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum TimerState {
    Idle,
    Running,
    Paused,
    /// Stopped without completing the session. Terminal.
    Stopped,
    /// Session completed, either explicitly or by the countdown reaching zero. Terminal.
    Completed,
}

impl TimerState {
    /// Running or paused.
    #[must_use]
    pub fn is_active(self) -> bool {
        matches!(self, TimerState::Running | TimerState::Paused)
    }

    #[must_use]
    pub fn is_terminal(self) -> bool {
        matches!(self, TimerState::Stopped | TimerState::Completed)
    }
}

impl fmt::Display for TimerState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            TimerState::Idle => "idle",
            TimerState::Running => "running",
            TimerState::Paused => "paused",
            TimerState::Stopped => "stopped",
            TimerState::Completed => "completed",
        };
        f.write_str(label)
    }
}

/// Misuse of the timer state machine. Always a caller bug.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
#[non_exhaustive]
pub enum TimerError {
    #[error("cannot {operation} a timer that is {state}")]
    InvalidState {
        operation: &'static str,
        state: TimerState,
    },
}

/// What a `tick` observed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TimerTick {
    pub state: TimerState,
    pub remaining_ms: u64,
    /// True only on the tick that performed natural completion.
    pub completed_now: bool,
}

//
// ─── TIMER ─────────────────────────────────────────────────────────────────────
//

/// Stopwatch bound to one session.
///
/// The timer does not own the session; every transition that changes
/// tracked time or completion takes the session as `&mut`. Callers are
/// responsible for passing the session at [`SessionTimer::at`].
#[derive(Debug, Clone)]
pub struct SessionTimer {
    clock: Clock,
    at: SessionRef,
    state: TimerState,
    duration_ms: u64,
    started_at: Option<DateTime<Utc>>,
    base_remaining_ms: u64,
    remaining_ms: u64,
}

impl SessionTimer {
    #[must_use]
    pub fn new(clock: Clock, at: SessionRef) -> Self {
        Self {
            clock,
            at,
            state: TimerState::Idle,
            duration_ms: 0,
            started_at: None,
            base_remaining_ms: 0,
            remaining_ms: 0,
        }
    }

    #[must_use]
    pub fn at(&self) -> SessionRef {
        self.at
    }

    #[must_use]
    pub fn state(&self) -> TimerState {
        self.state
    }

    #[must_use]
    pub fn duration_ms(&self) -> u64 {
        self.duration_ms
    }

    /// Remaining countdown as of now, without changing state.
    #[must_use]
    pub fn remaining_ms(&self) -> u64 {
        match (self.state, self.started_at) {
            (TimerState::Running, Some(started_at)) => self
                .base_remaining_ms
                .saturating_sub(elapsed_ms(started_at, self.clock.now())),
            _ => self.remaining_ms,
        }
    }

    /// Begin counting down `duration_minutes`, minus what the session already tracked.
    ///
    /// # Errors
    ///
    /// Returns `TimerError::InvalidState` unless the timer is idle.
    pub fn start(&mut self, session: &Session, duration_minutes: u32) -> Result<(), TimerError> {
        self.require("start", &[TimerState::Idle])?;
        self.duration_ms = u64::from(duration_minutes) * MS_PER_MINUTE;
        self.base_remaining_ms = self.duration_ms.saturating_sub(session.time_spent_ms());
        self.remaining_ms = self.base_remaining_ms;
        self.started_at = Some(self.clock.now());
        self.state = TimerState::Running;
        Ok(())
    }

    /// Recompute the countdown; completes the session when it reaches zero.
    ///
    /// # Errors
    ///
    /// Returns `TimerError::InvalidState` unless the timer is running or paused.
    pub fn tick(&mut self, session: &mut Session) -> Result<TimerTick, TimerError> {
        self.require("tick", &[TimerState::Running, TimerState::Paused])?;
        if self.state == TimerState::Paused {
            return Ok(self.snapshot(false));
        }
        self.remaining_ms = self.remaining_ms();
        if self.remaining_ms == 0 {
            self.complete_naturally(session);
            return Ok(self.snapshot(true));
        }
        Ok(self.snapshot(false))
    }

    /// Freeze the countdown and flush the running interval into the session.
    ///
    /// If the countdown already ran out, the session completes instead and
    /// `TimerState::Completed` is returned.
    ///
    /// # Errors
    ///
    /// Returns `TimerError::InvalidState` unless the timer is running.
    pub fn pause(&mut self, session: &mut Session) -> Result<TimerState, TimerError> {
        self.require("pause", &[TimerState::Running])?;
        if self.flush_running(session) {
            return Ok(self.state);
        }
        self.state = TimerState::Paused;
        Ok(self.state)
    }

    /// Continue counting down from where `pause` left off.
    ///
    /// # Errors
    ///
    /// Returns `TimerError::InvalidState` unless the timer is paused.
    pub fn resume(&mut self) -> Result<(), TimerError> {
        self.require("resume", &[TimerState::Paused])?;
        self.base_remaining_ms = self.remaining_ms;
        self.started_at = Some(self.clock.now());
        self.state = TimerState::Running;
        Ok(())
    }

    /// End this timer, flushing any running interval.
    ///
    /// Completes the session when `mark_completed` is set or the countdown
    /// already reached zero.
    ///
    /// # Errors
    ///
    /// Returns `TimerError::InvalidState` unless the timer is running or paused.
    pub fn stop(
        &mut self,
        session: &mut Session,
        mark_completed: bool,
    ) -> Result<TimerState, TimerError> {
        self.require("stop", &[TimerState::Running, TimerState::Paused])?;
        if self.state == TimerState::Running && self.flush_running(session) {
            return Ok(self.state);
        }
        self.started_at = None;
        if mark_completed {
            session.mark_completed();
            self.state = TimerState::Completed;
        } else {
            self.state = TimerState::Stopped;
        }
        Ok(self.state)
    }

    /// Adds the running interval to the session. Returns true when that
    /// interval exhausted the countdown and the session was completed.
    fn flush_running(&mut self, session: &mut Session) -> bool {
        let now = self.clock.now();
        let elapsed = self
            .started_at
            .take()
            .map_or(0, |started_at| elapsed_ms(started_at, now));
        if elapsed >= self.base_remaining_ms {
            self.complete_naturally(session);
            return true;
        }
        session.record_time(elapsed);
        self.remaining_ms = self.base_remaining_ms - elapsed;
        false
    }

    fn complete_naturally(&mut self, session: &mut Session) {
        session.record_time(self.base_remaining_ms);
        session.mark_completed();
        self.started_at = None;
        self.remaining_ms = 0;
        self.state = TimerState::Completed;
    }

    fn snapshot(&self, completed_now: bool) -> TimerTick {
        TimerTick {
            state: self.state,
            remaining_ms: self.remaining_ms,
            completed_now,
        }
    }

    fn require(&self, operation: &'static str, allowed: &[TimerState]) -> Result<(), TimerError> {
        if allowed.contains(&self.state) {
            Ok(())
        } else {
            Err(TimerError::InvalidState {
                operation,
                state: self.state,
            })
        }
    }
}

//
// ─── TESTS ─────────────────────────────────────────────────────────────────────
//

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::PlanId;
    use crate::time::{ManualClock, manual_clock};
    use proptest::prelude::*;

    fn at() -> SessionRef {
        SessionRef::new(PlanId::new(1), 0, 0)
    }

    fn session(minutes: u32) -> Session {
        Session::new("Focus", "", minutes).unwrap()
    }

    fn started(minutes: u32) -> (ManualClock, SessionTimer, Session) {
        let (handle, clock) = manual_clock();
        let mut timer = SessionTimer::new(clock, at());
        let session = session(minutes);
        timer.start(&session, minutes).unwrap();
        (handle, timer, session)
    }

    #[test]
    fn natural_completion_caps_time_at_duration() {
        let (clock, mut timer, mut session) = started(5);
        clock.advance_ms(301_000);

        let tick = timer.tick(&mut session).unwrap();

        assert!(tick.completed_now);
        assert_eq!(tick.state, TimerState::Completed);
        assert_eq!(tick.remaining_ms, 0);
        assert!(session.is_completed());
        assert_eq!(session.time_spent_ms(), 300_000);
    }

    #[test]
    fn pause_resume_stop_accumulates_running_intervals() {
        let (clock, mut timer, mut session) = started(5);

        clock.advance_ms(120_000);
        assert_eq!(timer.pause(&mut session).unwrap(), TimerState::Paused);
        assert_eq!(session.time_spent_ms(), 120_000);

        clock.advance_ms(80_000);
        timer.resume().unwrap();
        clock.advance_ms(60_000);
        assert_eq!(timer.stop(&mut session, false).unwrap(), TimerState::Stopped);

        assert_eq!(session.time_spent_ms(), 180_000);
        assert!(!session.is_completed());
    }

    #[test]
    fn jump_between_ticks_is_not_counted_per_tick() {
        let (clock, mut timer, mut session) = started(10);
        clock.advance_ms(1_000);
        let first = timer.tick(&mut session).unwrap();
        assert_eq!(first.remaining_ms, 599_000);

        clock.advance_ms(240_000);
        let second = timer.tick(&mut session).unwrap();
        assert_eq!(second.remaining_ms, 599_000 - 240_000);
    }

    #[test]
    fn paused_timer_does_not_count_down() {
        let (clock, mut timer, mut session) = started(1);
        clock.advance_ms(10_000);
        timer.pause(&mut session).unwrap();
        clock.advance_ms(3_600_000);

        let tick = timer.tick(&mut session).unwrap();
        assert_eq!(tick.state, TimerState::Paused);
        assert_eq!(tick.remaining_ms, 50_000);
        assert!(!session.is_completed());
    }

    #[test]
    fn start_subtracts_already_tracked_time() {
        let (clock, clock_view) = manual_clock();
        let mut session = session(5);
        session.record_time(240_000);
        let mut timer = SessionTimer::new(clock_view, at());
        timer.start(&session, 5).unwrap();
        assert_eq!(timer.remaining_ms(), 60_000);

        clock.advance_ms(60_000);
        let tick = timer.tick(&mut session).unwrap();
        assert!(tick.completed_now);
        assert_eq!(session.time_spent_ms(), 300_000);
    }

    #[test]
    fn pause_after_expiry_completes() {
        let (clock, mut timer, mut session) = started(1);
        clock.advance_ms(61_000);
        assert_eq!(timer.pause(&mut session).unwrap(), TimerState::Completed);
        assert!(session.is_completed());
        assert_eq!(session.time_spent_ms(), 60_000);
    }

    #[test]
    fn explicit_completion_without_time_uses_estimate() {
        let (_clock, mut timer, mut session) = started(5);
        assert_eq!(timer.stop(&mut session, true).unwrap(), TimerState::Completed);
        assert!(session.is_completed());
        assert_eq!(session.time_spent_ms(), 300_000);
    }

    #[test]
    fn stop_from_paused_does_not_double_count() {
        let (clock, mut timer, mut session) = started(5);
        clock.advance_ms(30_000);
        timer.pause(&mut session).unwrap();
        clock.advance_ms(30_000);
        timer.stop(&mut session, false).unwrap();
        assert_eq!(session.time_spent_ms(), 30_000);
    }

    #[test]
    fn wrong_state_transitions_are_errors() {
        let (_clock, clock) = manual_clock();
        let mut timer = SessionTimer::new(clock, at());
        let mut s = session(5);

        assert_eq!(
            timer.pause(&mut s).unwrap_err(),
            TimerError::InvalidState {
                operation: "pause",
                state: TimerState::Idle
            }
        );
        assert!(timer.resume().is_err());
        assert!(timer.stop(&mut s, false).is_err());
        assert!(timer.tick(&mut s).is_err());

        timer.start(&s, 5).unwrap();
        assert!(timer.start(&s, 5).is_err());
        assert!(timer.resume().is_err());

        timer.stop(&mut s, false).unwrap();
        assert!(timer.stop(&mut s, false).is_err());
        assert!(timer.pause(&mut s).is_err());
    }

    #[test]
    fn clock_going_backwards_never_reduces_time() {
        let (clock, mut timer, mut session) = started(5);
        clock.advance_ms(-5_000);
        timer.pause(&mut session).unwrap();
        assert_eq!(session.time_spent_ms(), 0);
    }

    #[derive(Debug, Clone, Copy)]
    enum Op {
        Advance(i64),
        Tick,
        Pause,
        Resume,
    }

    fn op() -> impl Strategy<Value = Op> {
        prop_oneof![
            (0_i64..120_000).prop_map(Op::Advance),
            Just(Op::Tick),
            Just(Op::Pause),
            Just(Op::Resume),
        ]
    }

    proptest! {
        #[test]
        fn time_spent_is_monotonic_and_sums_running_intervals(ops in prop::collection::vec(op(), 0..40), minutes in 1_u32..30) {
            let (clock, mut timer, mut session) = started(minutes);
            let duration_ms = u64::from(minutes) * MS_PER_MINUTE;
            let mut running_ms = 0_u64;
            let mut last_spent = 0_u64;

            for op in ops {
                match op {
                    Op::Advance(ms) => {
                        if timer.state() == TimerState::Running {
                            running_ms += u64::try_from(ms).unwrap();
                        }
                        clock.advance_ms(ms);
                    }
                    Op::Tick => {
                        let _ = timer.tick(&mut session);
                    }
                    Op::Pause => {
                        let _ = timer.pause(&mut session);
                    }
                    Op::Resume => {
                        let _ = timer.resume();
                    }
                }
                prop_assert!(session.time_spent_ms() >= last_spent);
                last_spent = session.time_spent_ms();
            }
            if timer.state().is_active() {
                timer.stop(&mut session, false).unwrap();
            }

            prop_assert!(session.time_spent_ms() >= last_spent);
            prop_assert_eq!(session.time_spent_ms(), running_ms.min(duration_ms));
            prop_assert_eq!(session.is_completed(), running_ms >= duration_ms);
        }
    }
}
