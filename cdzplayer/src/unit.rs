//! Per-track playback unit state machine.
//!
//! One `PlayerUnit` wraps a single local decode/render slot. Decode internals
//! are out of scope; this type owns the state machine and the control
//! surface the local player drives:
//!
//! ```text
//! Idle -(fetch ok)-> Initialized -> Preparing -(prepared)-> Prepared
//!   Prepared -> Started <-> Paused -> Stopped -> Preparing ...
//!   Started -(track end)-> PlaybackCompleted
//!   any -> Released
//! ```
//!
//! Seeks requested before `Prepared` are stored and applied on the prepare
//! completion. Gapless hand-off to another unit is armed only once the
//! target unit is itself `Prepared` or later; earlier requests are kept and
//! re-armed by the owner when the target gets there.

use std::fmt;
use std::time::Duration;

use tracing::{debug, warn};

use cdzqueue::PlaybackEntry;

use crate::error::{PlayerError, Result};

/// Playback states of a single local unit.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum UnitState {
    Idle,
    Initialized,
    Preparing,
    Prepared,
    Started,
    Paused,
    Stopped,
    PlaybackCompleted,
    Released,
}

impl UnitState {
    /// True once the unit went through prepare completion at least once and
    /// has not been torn down since.
    pub fn is_at_least_prepared(&self) -> bool {
        matches!(
            self,
            UnitState::Prepared
                | UnitState::Started
                | UnitState::Paused
                | UnitState::PlaybackCompleted
        )
    }
}

impl fmt::Display for UnitState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            UnitState::Idle => "idle",
            UnitState::Initialized => "initialized",
            UnitState::Preparing => "preparing",
            UnitState::Prepared => "prepared",
            UnitState::Started => "started",
            UnitState::Paused => "paused",
            UnitState::Stopped => "stopped",
            UnitState::PlaybackCompleted => "playback-completed",
            UnitState::Released => "released",
        };
        write!(f, "{label}")
    }
}

/// Arena handle of a unit inside the local player. The "current" and "next"
/// roles rotate across units, so they are addressed by handle rather than by
/// direct reference.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct UnitHandle(pub usize);

impl fmt::Display for UnitHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "unit[{}]", self.0)
    }
}

/// What a `play()` request actually did.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum PlayOutcome {
    /// Playback is running.
    Started,
    /// The unit was idle; a preload was requested instead.
    PreloadStarted,
    /// The unit was stopped; a prepare was requested instead.
    PrepareStarted,
    /// Preparation is already in flight; playback will start once prepared.
    NotReady,
}

/// Categorized decode/render failure. Does not force a state transition by
/// itself; the owner decides how to react.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum UnitErrorKind {
    DataFetch,
    Decode,
    Render,
}

impl fmt::Display for UnitErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            UnitErrorKind::DataFetch => write!(f, "data-fetch"),
            UnitErrorKind::Decode => write!(f, "decode"),
            UnitErrorKind::Render => write!(f, "render"),
        }
    }
}

/// Whether a failed fetch should be retried or given up on.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum FetchDisposition {
    Retry,
    GiveUp,
}

/// A single local decode/render slot plus its playback entry.
#[derive(Debug)]
pub struct PlayerUnit {
    entry: PlaybackEntry,
    state: UnitState,
    fetch_in_flight: bool,
    fetch_attempts: u32,
    deferred_seek: Option<Duration>,
    position: Duration,
    next: Option<UnitHandle>,
    pending_next: Option<UnitHandle>,
}

impl PlayerUnit {
    pub fn new(entry: PlaybackEntry) -> Self {
        Self {
            entry,
            state: UnitState::Idle,
            fetch_in_flight: false,
            fetch_attempts: 0,
            deferred_seek: None,
            position: Duration::ZERO,
            next: None,
            pending_next: None,
        }
    }

    pub fn entry(&self) -> &PlaybackEntry {
        &self.entry
    }

    pub fn entry_mut(&mut self) -> &mut PlaybackEntry {
        &mut self.entry
    }

    pub fn state(&self) -> UnitState {
        self.state
    }

    pub fn position(&self) -> Duration {
        self.position
    }

    /// Armed gapless successor, if any.
    pub fn armed_next(&self) -> Option<UnitHandle> {
        self.next
    }

    /// Successor waiting for the target unit to reach `Prepared`.
    pub fn pending_next(&self) -> Option<UnitHandle> {
        self.pending_next
    }

    // =====================================================================
    //  Transitions
    // =====================================================================

    /// Marks the asynchronous data fetch as started. Valid from `Idle`, or
    /// from `Released` which is reconstructed into a fresh idle unit first.
    pub fn begin_preload(&mut self) -> Result<()> {
        match self.state {
            UnitState::Idle => {}
            UnitState::Released => {
                debug!(entry = %self.entry.playback_id, "reconstructing released unit");
                self.state = UnitState::Idle;
                self.fetch_attempts = 0;
                self.deferred_seek = None;
                self.position = Duration::ZERO;
            }
            from => return Err(self.invalid(from, "preload")),
        }
        self.fetch_in_flight = true;
        Ok(())
    }

    /// Fetch success: initialize, then immediately start preparing.
    pub fn on_data_ready(&mut self) -> Result<()> {
        if !matches!(self.state, UnitState::Idle) {
            let from = self.state;
            return Err(self.invalid(from, "initialize"));
        }
        self.fetch_in_flight = false;
        self.fetch_attempts = 0;
        self.state = UnitState::Initialized;
        self.begin_prepare()
    }

    /// Fetch failure: retry until the bound, then give up for good.
    pub fn on_fetch_failed(&mut self, max_retries: u32) -> FetchDisposition {
        self.fetch_attempts += 1;
        if self.fetch_attempts < max_retries {
            warn!(
                entry = %self.entry.playback_id,
                attempt = self.fetch_attempts,
                "data fetch failed, retrying"
            );
            FetchDisposition::Retry
        } else {
            self.fetch_in_flight = false;
            FetchDisposition::GiveUp
        }
    }

    pub fn fetch_attempts(&self) -> u32 {
        self.fetch_attempts
    }

    /// Enters `Preparing`. Valid from `Initialized` and `Stopped`.
    pub fn begin_prepare(&mut self) -> Result<()> {
        match self.state {
            UnitState::Initialized | UnitState::Stopped => {
                self.state = UnitState::Preparing;
                Ok(())
            }
            from => Err(self.invalid(from, "prepare")),
        }
    }

    /// Prepare completion callback. Applies the deferred seek, if one was
    /// requested while the unit was not ready, and returns it.
    pub fn on_prepared(&mut self) -> Result<Option<Duration>> {
        if self.state != UnitState::Preparing {
            let from = self.state;
            return Err(self.invalid(from, "prepared"));
        }
        self.state = UnitState::Prepared;
        let applied = self.deferred_seek.take();
        if let Some(position) = applied {
            self.position = position;
            debug!(entry = %self.entry.playback_id, ?position, "applied deferred seek");
        }
        Ok(applied)
    }

    pub fn play(&mut self) -> Result<PlayOutcome> {
        match self.state {
            UnitState::Prepared | UnitState::Paused | UnitState::PlaybackCompleted => {
                if self.state == UnitState::PlaybackCompleted {
                    self.position = Duration::ZERO;
                }
                self.state = UnitState::Started;
                Ok(PlayOutcome::Started)
            }
            UnitState::Started => Ok(PlayOutcome::Started),
            UnitState::Idle => Ok(PlayOutcome::PreloadStarted),
            UnitState::Stopped => Ok(PlayOutcome::PrepareStarted),
            UnitState::Initialized | UnitState::Preparing => Ok(PlayOutcome::NotReady),
            from @ UnitState::Released => Err(self.invalid(from, "play")),
        }
    }

    pub fn pause(&mut self) -> Result<()> {
        match self.state {
            UnitState::Started | UnitState::Paused => {
                self.state = UnitState::Paused;
                Ok(())
            }
            from => Err(self.invalid(from, "pause")),
        }
    }

    /// Stops the unit. No-op success from `Stopped`/`Released`.
    pub fn stop(&mut self) -> Result<()> {
        match self.state {
            UnitState::Prepared
            | UnitState::Started
            | UnitState::Paused
            | UnitState::PlaybackCompleted => {
                self.state = UnitState::Stopped;
                Ok(())
            }
            UnitState::Stopped | UnitState::Released => Ok(()),
            from => Err(self.invalid(from, "stop")),
        }
    }

    /// Frees the backend resource. Valid from any state.
    pub fn release(&mut self) {
        self.state = UnitState::Released;
        self.fetch_in_flight = false;
        self.deferred_seek = None;
        self.next = None;
        self.pending_next = None;
    }

    /// Seeks, or stores the seek for the prepare completion when the unit is
    /// not ready yet. Returns true when applied immediately.
    pub fn seek(&mut self, position: Duration) -> bool {
        if self.state.is_at_least_prepared() {
            self.position = position;
            true
        } else {
            self.deferred_seek = Some(position);
            false
        }
    }

    /// Arms the gapless hand-off to `handle`. Only armed when the target
    /// unit is already prepared; otherwise kept for a later re-arm.
    pub fn set_next(&mut self, handle: UnitHandle, target_ready: bool) {
        if target_ready {
            self.next = Some(handle);
            self.pending_next = None;
        } else {
            self.pending_next = Some(handle);
        }
    }

    pub fn clear_next(&mut self) {
        self.next = None;
        self.pending_next = None;
    }

    /// Natural end of the track.
    pub fn on_playback_complete(&mut self) -> Result<()> {
        match self.state {
            UnitState::Started => {
                self.state = UnitState::PlaybackCompleted;
                Ok(())
            }
            from => Err(self.invalid(from, "complete")),
        }
    }

    /// Records a categorized decode/render failure. Logged; no transition.
    pub fn record_error(&self, kind: UnitErrorKind, message: &str) {
        warn!(
            entry = %self.entry.playback_id,
            state = %self.state,
            kind = %kind,
            message,
            "playback unit error"
        );
    }

    pub fn update_position(&mut self, position: Duration) {
        self.position = position;
    }

    fn invalid(&self, from: UnitState, operation: &str) -> PlayerError {
        PlayerError::InvalidTransition {
            from: from.to_string(),
            operation: operation.to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use cdzqueue::{EntryId, PlaybackId};

    fn unit() -> PlayerUnit {
        PlayerUnit::new(PlaybackEntry::queued(
            EntryId::new("library", "track-1"),
            PlaybackId(1),
        ))
    }

    fn prepared_unit() -> PlayerUnit {
        let mut u = unit();
        u.begin_preload().unwrap();
        u.on_data_ready().unwrap();
        u.on_prepared().unwrap();
        u
    }

    #[test]
    fn nominal_lifecycle() {
        let mut u = unit();
        assert_eq!(u.state(), UnitState::Idle);

        u.begin_preload().unwrap();
        u.on_data_ready().unwrap();
        assert_eq!(u.state(), UnitState::Preparing);

        u.on_prepared().unwrap();
        assert_eq!(u.state(), UnitState::Prepared);

        assert_eq!(u.play().unwrap(), PlayOutcome::Started);
        u.pause().unwrap();
        assert_eq!(u.state(), UnitState::Paused);
        assert_eq!(u.play().unwrap(), PlayOutcome::Started);

        u.on_playback_complete().unwrap();
        assert_eq!(u.state(), UnitState::PlaybackCompleted);
        u.stop().unwrap();
        assert_eq!(u.state(), UnitState::Stopped);

        u.release();
        assert_eq!(u.state(), UnitState::Released);
    }

    #[test]
    fn play_before_ready_reports_what_it_triggered() {
        let mut u = unit();
        assert_eq!(u.play().unwrap(), PlayOutcome::PreloadStarted);

        u.begin_preload().unwrap();
        u.on_data_ready().unwrap();
        assert_eq!(u.play().unwrap(), PlayOutcome::NotReady);

        u.on_prepared().unwrap();
        u.play().unwrap();
        u.stop().unwrap();
        assert_eq!(u.play().unwrap(), PlayOutcome::PrepareStarted);
    }

    #[test]
    fn seek_before_prepared_is_deferred() {
        let mut u = unit();
        assert!(!u.seek(Duration::from_secs(42)));

        u.begin_preload().unwrap();
        u.on_data_ready().unwrap();
        let applied = u.on_prepared().unwrap();

        assert_eq!(applied, Some(Duration::from_secs(42)));
        assert_eq!(u.position(), Duration::from_secs(42));
    }

    #[test]
    fn seek_after_prepared_is_immediate() {
        let mut u = prepared_unit();
        assert!(u.seek(Duration::from_secs(7)));
        assert_eq!(u.position(), Duration::from_secs(7));
    }

    #[test]
    fn stop_is_noop_from_stopped_and_released() {
        let mut u = prepared_unit();
        u.stop().unwrap();
        u.stop().unwrap();
        u.release();
        u.stop().unwrap();
    }

    #[test]
    fn stop_from_idle_is_invalid() {
        let mut u = unit();
        assert!(matches!(
            u.stop(),
            Err(PlayerError::InvalidTransition { .. })
        ));
    }

    #[test]
    fn released_unit_reconstructs_on_preload() {
        let mut u = prepared_unit();
        u.release();
        u.begin_preload().unwrap();
        assert_eq!(u.state(), UnitState::Idle);
        u.on_data_ready().unwrap();
        u.on_prepared().unwrap();
        assert_eq!(u.state(), UnitState::Prepared);
    }

    #[test]
    fn set_next_defers_until_target_ready() {
        let mut u = prepared_unit();
        u.set_next(UnitHandle(3), false);
        assert_eq!(u.armed_next(), None);
        assert_eq!(u.pending_next(), Some(UnitHandle(3)));

        u.set_next(UnitHandle(3), true);
        assert_eq!(u.armed_next(), Some(UnitHandle(3)));
        assert_eq!(u.pending_next(), None);
    }

    #[test]
    fn bounded_fetch_retry() {
        let mut u = unit();
        u.begin_preload().unwrap();
        assert_eq!(u.on_fetch_failed(3), FetchDisposition::Retry);
        assert_eq!(u.on_fetch_failed(3), FetchDisposition::Retry);
        assert_eq!(u.on_fetch_failed(3), FetchDisposition::GiveUp);
        assert_eq!(u.fetch_attempts(), 3);
    }

    #[test]
    fn replay_after_completion_restarts_from_zero() {
        let mut u = prepared_unit();
        u.play().unwrap();
        u.update_position(Duration::from_secs(180));
        u.on_playback_complete().unwrap();

        assert_eq!(u.play().unwrap(), PlayOutcome::Started);
        assert_eq!(u.position(), Duration::ZERO);
    }
}
