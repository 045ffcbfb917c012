//! Playlist selection: the user's current binding to an external playlist.

use std::fmt;

use serde::{Deserialize, Serialize};

/// Playback order over the selected playlist.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OrderMode {
    /// Playlist order.
    Sequential,
    /// One-time unbiased shuffle of the known entries.
    Shuffle,
    /// Seeded pseudorandom walk, reproducible without materializing the
    /// whole order.
    Random,
}

impl fmt::Display for OrderMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            OrderMode::Sequential => write!(f, "sequential"),
            OrderMode::Shuffle => write!(f, "shuffle"),
            OrderMode::Random => write!(f, "random"),
        }
    }
}

/// One episode of "the user picked this playlist, in this order mode,
/// starting here".
///
/// The `selection_id` increments every time the user picks a playlist or
/// changes order/repeat mode; buffered entries carrying an older id are
/// stale and get rebuilt.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct PlaylistSelection {
    pub selection_id: u64,
    pub playlist_id: String,
    /// Logical position in the full external playlist.
    pub playlist_position: usize,
    /// Index into the playback-order buffer; differs from
    /// `playlist_position` under shuffle/random.
    pub playback_position: usize,
    pub order_mode: OrderMode,
    pub repeat: bool,
}

impl PlaylistSelection {
    pub fn new(
        selection_id: u64,
        playlist_id: impl Into<String>,
        playlist_position: usize,
        order_mode: OrderMode,
        repeat: bool,
    ) -> Self {
        Self {
            selection_id,
            playlist_id: playlist_id.into(),
            playlist_position,
            playback_position: 0,
            order_mode,
            repeat,
        }
    }
}
