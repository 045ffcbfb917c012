//! Events flowing from the audio backends back into the controller.

use tokio::sync::mpsc;

use cdzqueue::PlaybackEntry;

use crate::unit::UnitErrorKind;

/// Backend-originated playback events. The controller lane consumes these
/// and re-runs the preload scheduler in response.
#[derive(Clone, Debug)]
pub enum PlayerEvent {
    /// An entry started rendering.
    EntryStarted(PlaybackEntry),
    /// An entry finished naturally (gapless hand-off already performed when
    /// a next unit was armed).
    EntryCompleted(PlaybackEntry),
    /// The backend entered or left a buffering stall.
    BufferingChanged { buffering: bool },
    /// A unit failed; `terminal` when the bounded fetch retry is exhausted.
    UnitError {
        entry: PlaybackEntry,
        kind: UnitErrorKind,
        message: String,
        terminal: bool,
    },
    /// The remote link dropped.
    RemoteDisconnected,
}

pub type PlayerEventSender = mpsc::UnboundedSender<PlayerEvent>;
pub type PlayerEventReceiver = mpsc::UnboundedReceiver<PlayerEvent>;

/// Creates the backend-to-controller event channel.
pub fn player_event_channel() -> (PlayerEventSender, PlayerEventReceiver) {
    mpsc::unbounded_channel()
}
