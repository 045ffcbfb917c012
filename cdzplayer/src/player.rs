//! Backend-agnostic audio player façade.
//!
//! `AudioPlayer` wraps both supported backends (local multi-unit playback
//! and the remote receiver proxy) behind a single control surface. The
//! scheduler and the controller must only interact with backends through
//! this type so that preload arithmetic and transport logic stay
//! backend-neutral.

use std::time::Duration;

use serde::{Deserialize, Serialize};

use cdzqueue::PlaybackEntry;

use crate::error::Result;
use crate::local::LocalPlayer;
use crate::remote::RemotePlayer;

/// Transfer snapshot of a backend, captured on migration and replayed into
/// the replacement backend.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct AudioPlayerState {
    /// Entry currently engaged, if any.
    pub current_entry: Option<PlaybackEntry>,
    /// Backend-side play history, oldest first.
    pub history: Vec<PlaybackEntry>,
    /// Remaining preloaded entries in play order, queue entries before
    /// playlist entries, current entry excluded.
    pub preloaded: Vec<PlaybackEntry>,
    /// Last known seek position of the current entry.
    pub position: Duration,
}

/// The two audio backend variants behind one capability surface.
#[derive(Clone)]
pub enum AudioPlayer {
    /// Local multi-instance decode/render backend.
    Local(LocalPlayer),
    /// Remote receiver proxying its own device-side queue.
    Remote(RemotePlayer),
}

impl AudioPlayer {
    // =====================================================================
    //  Preload / depreload
    // =====================================================================

    /// Hands `entries` to the backend at `at_offset` in its preloaded play
    /// order, primed for gapless playback.
    pub async fn preload_at(&self, at_offset: usize, entries: Vec<PlaybackEntry>) -> Result<()> {
        match self {
            AudioPlayer::Local(p) => p.preload_at(at_offset, entries).await,
            AudioPlayer::Remote(p) => p.preload_at(at_offset, entries).await,
        }
    }

    /// Appends `entries` at the tail of the preloaded set.
    pub async fn preload(&self, entries: Vec<PlaybackEntry>) -> Result<()> {
        let at = self.get_num_preloaded();
        self.preload_at(at, entries).await
    }

    /// Withdraws entries from the preloaded set; returns them with
    /// `preloaded` cleared.
    pub async fn depreload(&self, entries: &[PlaybackEntry]) -> Result<Vec<PlaybackEntry>> {
        match self {
            AudioPlayer::Local(p) => p.depreload(entries).await,
            AudioPlayer::Remote(p) => p.depreload(entries).await,
        }
    }

    // =====================================================================
    //  Transport
    // =====================================================================

    pub async fn play(&self) -> Result<()> {
        match self {
            AudioPlayer::Local(p) => p.play().await,
            AudioPlayer::Remote(p) => p.play().await,
        }
    }

    pub async fn pause(&self) -> Result<()> {
        match self {
            AudioPlayer::Local(p) => p.pause().await,
            AudioPlayer::Remote(p) => p.pause().await,
        }
    }

    pub async fn stop(&self) -> Result<()> {
        match self {
            AudioPlayer::Local(p) => p.stop().await,
            AudioPlayer::Remote(p) => p.stop().await,
        }
    }

    pub async fn seek(&self, position: Duration) -> Result<()> {
        match self {
            AudioPlayer::Local(p) => p.seek(position).await,
            AudioPlayer::Remote(p) => p.seek(position).await,
        }
    }

    pub async fn next(&self) -> Result<()> {
        match self {
            AudioPlayer::Local(p) => p.next().await,
            AudioPlayer::Remote(p) => p.next().await,
        }
    }

    pub async fn previous(&self) -> Result<()> {
        match self {
            AudioPlayer::Local(p) => p.previous().await,
            AudioPlayer::Remote(p) => p.previous().await,
        }
    }

    // =====================================================================
    //  Introspection
    // =====================================================================

    pub fn get_current_entry(&self) -> Option<PlaybackEntry> {
        match self {
            AudioPlayer::Local(p) => p.get_current_entry(),
            AudioPlayer::Remote(p) => p.get_current_entry(),
        }
    }

    pub fn get_queue_entries(&self, max: usize) -> Vec<PlaybackEntry> {
        match self {
            AudioPlayer::Local(p) => p.get_queue_entries(max),
            AudioPlayer::Remote(p) => p.get_queue_entries(max),
        }
    }

    pub fn get_playlist_entries(&self, max: usize) -> Vec<PlaybackEntry> {
        match self {
            AudioPlayer::Local(p) => p.get_playlist_entries(max),
            AudioPlayer::Remote(p) => p.get_playlist_entries(max),
        }
    }

    pub fn get_num_preloaded(&self) -> usize {
        match self {
            AudioPlayer::Local(p) => p.get_num_preloaded(),
            AudioPlayer::Remote(p) => p.get_num_preloaded(),
        }
    }

    pub fn get_max_to_preload(&self) -> usize {
        match self {
            AudioPlayer::Local(p) => p.get_max_to_preload(),
            AudioPlayer::Remote(p) => p.get_max_to_preload(),
        }
    }

    pub fn get_history(&self) -> Vec<PlaybackEntry> {
        match self {
            AudioPlayer::Local(p) => p.get_history(),
            AudioPlayer::Remote(p) => p.get_history(),
        }
    }

    pub fn is_playing(&self) -> bool {
        match self {
            AudioPlayer::Local(p) => p.is_playing(),
            AudioPlayer::Remote(p) => p.is_playing(),
        }
    }

    pub fn volume(&self) -> f32 {
        match self {
            AudioPlayer::Local(p) => p.volume(),
            AudioPlayer::Remote(p) => p.volume(),
        }
    }

    pub fn set_volume(&self, volume: f32) {
        match self {
            AudioPlayer::Local(p) => p.set_volume(volume),
            AudioPlayer::Remote(p) => p.set_volume(volume),
        }
    }

    // =====================================================================
    //  Migration
    // =====================================================================

    /// Captures the transfer snapshot used by backend migration.
    pub fn get_last_state(&self) -> AudioPlayerState {
        match self {
            AudioPlayer::Local(p) => p.get_last_state(),
            AudioPlayer::Remote(p) => p.get_last_state(),
        }
    }

    /// Replays a snapshot captured from the previous backend.
    pub async fn restore(&self, snapshot: AudioPlayerState) -> Result<()> {
        match self {
            AudioPlayer::Local(p) => p.restore(snapshot).await,
            AudioPlayer::Remote(p) => p.restore(snapshot).await,
        }
    }

    /// Tears the backend down; every later call fails fast.
    pub async fn destroy(&self) -> Result<()> {
        match self {
            AudioPlayer::Local(p) => p.destroy().await,
            AudioPlayer::Remote(p) => p.destroy().await,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use cdzqueue::{EntryId, PlaybackId};

    #[test]
    fn transfer_snapshot_serializes_for_host_persistence() {
        let snapshot = AudioPlayerState {
            current_entry: Some(PlaybackEntry::queued(
                EntryId::new("library", "now"),
                PlaybackId(3),
            )),
            history: vec![PlaybackEntry::queued(
                EntryId::new("library", "done"),
                PlaybackId(1),
            )],
            preloaded: vec![PlaybackEntry::queued(
                EntryId::new("library", "next"),
                PlaybackId(4),
            )],
            position: Duration::from_secs(95),
        };

        let json = serde_json::to_string(&snapshot).unwrap();
        let back: AudioPlayerState = serde_json::from_str(&json).unwrap();

        assert_eq!(back.current_entry.unwrap().playback_id, PlaybackId(3));
        assert_eq!(back.preloaded.len(), 1);
        assert_eq!(back.position, Duration::from_secs(95));
    }
}
