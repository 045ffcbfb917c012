//! Playback entry model for Cadenza.
//!
//! This module defines:
//!   - the canonical `PlaybackEntry` structure shared by every queue,
//!   - `EntryId`, the stable catalog identity of a track,
//!   - `PlaybackId`, the process-lifetime scheduling identity,
//!   - `PlaybackIdAllocator`, the monotonic batch reservation source.
//!
//! Identity model:
//!   - The logical identity of a track is its `EntryId`
//!     (catalog source + catalog id). Two entries with the same `EntryId`
//!     are the *same track* for containment checks, even when they carry
//!     different `PlaybackId`s.
//!   - The scheduling identity is the `PlaybackId`: unique within a
//!     controller lifetime, strictly increasing across reservations. It is
//!     what removal and reordering operate on, so the same track queued
//!     twice stays individually addressable.

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};

use serde::{Deserialize, Serialize};

/// Stable reference to a catalog item.
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct EntryId {
    /// Catalog that owns the item (local library, streaming provider, …).
    pub source: String,
    /// Item identifier inside that catalog.
    pub id: String,
}

impl EntryId {
    pub fn new(source: impl Into<String>, id: impl Into<String>) -> Self {
        Self {
            source: source.into(),
            id: id.into(),
        }
    }
}

impl fmt::Display for EntryId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.source, self.id)
    }
}

/// Process-lifetime scheduling identity of a queued entry.
///
/// Reserved in batches from a `PlaybackIdAllocator`. The `INVALID` sentinel
/// marks entries that have not been assigned one yet (dry-run expected
/// entries used by buffer verification).
#[derive(
    Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize,
)]
pub struct PlaybackId(pub u64);

impl PlaybackId {
    /// Sentinel for entries without a reserved id.
    pub const INVALID: PlaybackId = PlaybackId(u64::MAX);

    pub fn is_valid(&self) -> bool {
        *self != Self::INVALID
    }
}

impl fmt::Display for PlaybackId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_valid() {
            write!(f, "#{}", self.0)
        } else {
            write!(f, "#invalid")
        }
    }
}

/// Monotonic batch reservation source for `PlaybackId`s.
///
/// Ids handed out by one allocator are unique and strictly increasing across
/// all reservation calls, whatever thread asks for them.
#[derive(Debug)]
pub struct PlaybackIdAllocator {
    next: AtomicU64,
}

impl PlaybackIdAllocator {
    pub fn new() -> Self {
        Self {
            next: AtomicU64::new(1),
        }
    }

    /// Reserves `count` consecutive ids.
    pub fn reserve(&self, count: usize) -> Vec<PlaybackId> {
        let start = self.next.fetch_add(count as u64, Ordering::SeqCst);
        (start..start + count as u64).map(PlaybackId).collect()
    }

    /// Reserves a single id.
    pub fn reserve_one(&self) -> PlaybackId {
        PlaybackId(self.next.fetch_add(1, Ordering::SeqCst))
    }
}

impl Default for PlaybackIdAllocator {
    fn default() -> Self {
        Self::new()
    }
}

/// Which collection an entry belongs to in the merged view.
///
/// Queue entries may never appear after playlist entries in a merged view;
/// the scheduler relies on this ordering when it computes preload windows.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EntryKind {
    Queue,
    Playlist,
    History,
}

impl fmt::Display for EntryKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            EntryKind::Queue => write!(f, "queue"),
            EntryKind::Playlist => write!(f, "playlist"),
            EntryKind::History => write!(f, "history"),
        }
    }
}

/// A single scheduled playback unit.
///
/// Created when queued, when pulled from a playlist by the scheduler or the
/// diff engine, or when reconstructed from the durable store at startup.
/// Mutated only by position/selection rewrite; the `entry_id` never changes.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct PlaybackEntry {
    /// Catalog identity of the track.
    pub entry_id: EntryId,

    /// Scheduling identity; `PlaybackId::INVALID` for dry-run entries.
    pub playback_id: PlaybackId,

    /// Collection this entry belongs to.
    pub kind: EntryKind,

    /// Position in the full external playlist. Only meaningful for
    /// `EntryKind::Playlist`.
    pub playlist_position: Option<usize>,

    /// Playlist-selection episode that produced this entry. Entries whose
    /// selection id no longer matches the active selection are stale.
    pub playlist_selection_id: u64,

    /// Whether the owning audio backend currently holds this entry primed
    /// for playback.
    pub preloaded: bool,
}

impl PlaybackEntry {
    /// Entry queued directly by the user.
    pub fn queued(entry_id: EntryId, playback_id: PlaybackId) -> Self {
        Self {
            entry_id,
            playback_id,
            kind: EntryKind::Queue,
            playlist_position: None,
            playlist_selection_id: 0,
            preloaded: false,
        }
    }

    /// Entry pulled from the active playlist selection.
    pub fn from_playlist(
        entry_id: EntryId,
        playback_id: PlaybackId,
        playlist_position: usize,
        playlist_selection_id: u64,
    ) -> Self {
        Self {
            entry_id,
            playback_id,
            kind: EntryKind::Playlist,
            playlist_position: Some(playlist_position),
            playlist_selection_id,
            preloaded: false,
        }
    }

    pub fn is_playlist(&self) -> bool {
        self.kind == EntryKind::Playlist
    }

    /// True when both entries reference the same catalog item.
    pub fn same_item(&self, other: &PlaybackEntry) -> bool {
        self.entry_id == other.entry_id
    }

    pub fn with_kind(mut self, kind: EntryKind) -> Self {
        self.kind = kind;
        self
    }

    pub fn with_preloaded(mut self, preloaded: bool) -> Self {
        self.preloaded = preloaded;
        self
    }
}

/// Entries compare equal by catalog identity only. Two entries with the same
/// `entry_id` and different `playback_id`s are the same for containment
/// checks but distinct for removal-by-id.
impl PartialEq for PlaybackEntry {
    fn eq(&self, other: &Self) -> bool {
        self.entry_id == other.entry_id
    }
}

impl Eq for PlaybackEntry {}
