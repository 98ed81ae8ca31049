use std::sync::Arc;

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, warn};

use crate::{
    model::ActivityRecord,
    store::local::LocalStore,
    utils::{clock::Clock, time},
};

/// The single storage slot holding an in-progress stopwatch session.
/// At most one session exists at a time.
pub const SESSION_SLOT_KEY: &str = "stopwatch_session";

/// What survives a reload: everything needed to resume the stopwatch
/// from wall-clock arithmetic alone.
#[derive(PartialEq, Debug, Serialize, Deserialize, Clone)]
#[serde(rename_all = "camelCase")]
pub struct StopwatchSession {
    /// Epoch milliseconds. Written once at start, never rewritten.
    pub start_time: i64,
    pub category: String,
    pub activity_name: String,
    /// Target duration in minutes.
    pub target_duration: u32,
}

/// User-visible stopwatch failures.
#[derive(Debug, Error)]
pub enum SessionError {
    #[error("Please start the stopwatch first.")]
    NotRunning,
    #[error("A stopwatch for \"{}\" is already running. Resume or cancel it first.", .existing.activity_name)]
    AlreadyRunning { existing: StopwatchSession },
    #[error("Pick a category and an activity before starting the stopwatch.")]
    NotArmed,
}

/// The user's selection before pressing start.
#[derive(PartialEq, Debug, Clone)]
pub struct ArmedActivity {
    pub category: String,
    pub activity_name: String,
    pub target_duration: u32,
}

/// State machine for one timed activity: idle, armed (selection made)
/// or running (session persisted).
///
/// While running, elapsed time is a pure function of the persisted
/// start instant and the current wall clock. Nothing accumulates, so
/// neither a dropped tick nor a process restart can skew it.
pub struct StopwatchManager {
    store: Arc<dyn LocalStore>,
    clock: Arc<dyn Clock>,
    armed: Option<ArmedActivity>,
    session: Option<StopwatchSession>,
    reached_target: bool,
}

impl StopwatchManager {
    /// Creates the manager, resuming a persisted session when one
    /// exists. Corrupt slot contents count as no session.
    pub fn recover(store: Arc<dyn LocalStore>, clock: Arc<dyn Clock>) -> Self {
        let session = match store.get(SESSION_SLOT_KEY) {
            Ok(Some(raw)) => match serde_json::from_str::<StopwatchSession>(&raw) {
                Ok(session) => {
                    debug!(
                        "Resuming stopwatch for {:?} started at {}",
                        session.activity_name, session.start_time
                    );
                    Some(session)
                }
                Err(e) => {
                    warn!("Discarding unreadable stopwatch session: {e}");
                    None
                }
            },
            Ok(None) => None,
            Err(e) => {
                warn!("Reading the stopwatch slot failed: {e:?}");
                None
            }
        };
        let mut manager = Self {
            store,
            clock,
            armed: None,
            session,
            reached_target: false,
        };
        // A session that already passed its target shows the flag
        // within the first tick of mounting.
        manager.tick();
        manager
    }

    pub fn is_running(&self) -> bool {
        self.session.is_some()
    }

    pub fn session(&self) -> Option<&StopwatchSession> {
        self.session.as_ref()
    }

    /// Records what to time. A running session keeps its own copy of
    /// these fields, so arming is only meaningful while idle.
    pub fn arm(
        &mut self,
        category: impl Into<String>,
        activity_name: impl Into<String>,
        target_duration: u32,
    ) {
        self.armed = Some(ArmedActivity {
            category: category.into(),
            activity_name: activity_name.into(),
            target_duration,
        });
    }

    /// Starts the clock and persists the session, the only write the
    /// slot ever sees before deletion. Rejected while a session exists;
    /// the caller decides whether to resume or cancel the old one.
    pub fn start(&mut self) -> Result<(), SessionError> {
        if let Some(existing) = &self.session {
            return Err(SessionError::AlreadyRunning {
                existing: existing.clone(),
            });
        }
        let armed = self.armed.take().ok_or(SessionError::NotArmed)?;
        let session = StopwatchSession {
            start_time: self.clock.epoch_millis(),
            category: armed.category,
            activity_name: armed.activity_name,
            target_duration: armed.target_duration,
        };
        self.persist(&session);
        self.session = Some(session);
        self.reached_target = false;
        Ok(())
    }

    /// Seconds since start, recomputed from wall clock. Zero while
    /// idle or when the clock moved backwards.
    pub fn elapsed_seconds(&self) -> i64 {
        let Some(session) = &self.session else {
            return 0;
        };
        ((self.clock.epoch_millis() - session.start_time) / 1000).max(0)
    }

    /// Recomputes elapsed time and latches the target flag. Safe to
    /// call every second; it never writes to the slot.
    pub fn tick(&mut self) -> i64 {
        let elapsed = self.elapsed_seconds();
        if let Some(session) = &self.session {
            if elapsed / 60 >= i64::from(session.target_duration) {
                self.reached_target = true;
            }
        }
        elapsed
    }

    /// True once the target duration has been reached. Sticky for the
    /// rest of the session, even if a clock correction lowers the
    /// computed elapsed time on a later tick.
    pub fn target_reached(&self) -> bool {
        self.reached_target
    }

    /// Stops the clock, frees the slot and emits the finished record.
    /// The duration is minutes rounded to two decimals, clamped at
    /// zero; the record's calendar date is today at save time.
    pub fn save(&mut self) -> Result<ActivityRecord, SessionError> {
        let session = self.session.take().ok_or(SessionError::NotRunning)?;
        self.reached_target = false;
        self.clear_slot();

        let end_millis = self.clock.epoch_millis();
        let elapsed_millis = (end_millis - session.start_time).max(0);
        let duration = round_to_hundredths(elapsed_millis as f64 / 60_000.0);
        let start = time::from_epoch_millis(session.start_time).unwrap_or_else(|| self.clock.time());
        let end = time::from_epoch_millis(end_millis).unwrap_or_else(|| self.clock.time());

        Ok(ActivityRecord {
            id: end_millis.to_string(),
            category: session.category,
            activity: session.activity_name,
            start_time: time::iso_millis(start),
            end_time: time::iso_millis(end),
            duration,
            notes: None,
            date: time::day_string(self.clock.time()),
        })
    }

    /// Abandons the session without emitting anything.
    pub fn cancel(&mut self) {
        self.session = None;
        self.reached_target = false;
        self.clear_slot();
    }

    fn persist(&self, session: &StopwatchSession) {
        match serde_json::to_string(session) {
            Ok(serialized) => {
                if let Err(e) = self.store.set(SESSION_SLOT_KEY, &serialized) {
                    // The stopwatch still runs in memory; only reload
                    // recovery is lost.
                    warn!("Persisting the stopwatch session failed: {e:?}");
                }
            }
            Err(e) => warn!("Serializing the stopwatch session failed: {e}"),
        }
    }

    fn clear_slot(&self) {
        if let Err(e) = self.store.remove(SESSION_SLOT_KEY) {
            warn!("Clearing the stopwatch slot failed: {e:?}");
        }
    }
}

fn round_to_hundredths(minutes: f64) -> f64 {
    (minutes * 100.0).round() / 100.0
}
