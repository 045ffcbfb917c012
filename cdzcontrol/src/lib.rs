//! # cdzcontrol - Playback orchestration for Cadenza
//!
//! The controller owns the internal play queue, a buffered view of the
//! selected external playlist, the play history, and the preload arithmetic
//! that keeps the active audio backend fed for gapless playback. It
//! reconciles external playlist edits against an in-progress, possibly
//! shuffled or random playback order, and migrates all in-flight state when
//! the backend switches between local output and a remote receiver.
//!
//! # Architecture
//!
//! - **PlaybackController** : host-facing handle; every mutating operation
//!   runs on a single serializing lane task
//! - **PreloadPlan** : the preload/depreload arithmetic, bounded by the
//!   backend capacity
//! - **RandomSequencer** : seeded, memoized pseudorandom walk over the
//!   playlist, resumable without materializing the order
//! - **PlaylistDiff** : positional reconciliation of external playlist
//!   edits against buffered entries
//! - **ControllerEventBus** : outbound event fan-out to the host

mod config;
mod controller;
mod diff;
mod error;
mod events;
mod playlist_store;
mod scheduler;
mod selection;
mod sequencer;

pub use config::PlayerConfig;
pub use controller::{
    ControllerContext, ControllerStatus, PlaybackController, SortKey,
};
pub use diff::{DiffApplication, PlaylistDiff, apply_playlist_edit, is_buffer_correct};
pub use error::{ControlError, Result};
pub use events::{ControllerEvent, ControllerEventBus, PlaybackState};
pub use playlist_store::{MemoryPlaylistStore, PlaylistStore};
pub use scheduler::{PreloadPlan, top_up_capacity};
pub use selection::{OrderMode, PlaylistSelection};
pub use sequencer::{NextPosition, RandomSequencer, chain_next, next_position, shuffled_positions};
