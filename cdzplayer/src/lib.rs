//! # cdzplayer - Audio backends for Cadenza
//!
//! Two backend variants behind one capability surface:
//! - `LocalPlayer` : an arena of per-track `PlayerUnit` state machines with
//!   gapless hand-off and durable crash-resume mirrors,
//! - `RemotePlayer` : a proxy over a remote receiver's own queue, with the
//!   missing-callback timeout workaround.
//!
//! The controller depends only on the `AudioPlayer` enum so that preload
//! and transport logic stay backend-neutral.

mod error;
mod events;
mod local;
mod player;
mod provider;
mod remote;
mod unit;

pub use error::{PlayerError, Result};
pub use events::{PlayerEvent, PlayerEventReceiver, PlayerEventSender, player_event_channel};
pub use local::LocalPlayer;
pub use player::{AudioPlayer, AudioPlayerState};
pub use provider::{
    AudioDataProvider, CatalogResolver, DownloadPriority, FetchEvent, InstantDataProvider,
    StaticCatalogResolver, TrackMetadata,
};
pub use remote::{
    REMOTE_REQUEST_TIMEOUT, RemoteLink, RemoteNotification, RemotePlayer, RemoteReply,
    RemoteRequest, RemoteStatus,
};
pub use unit::{
    FetchDisposition, PlayOutcome, PlayerUnit, UnitErrorKind, UnitHandle, UnitState,
};
