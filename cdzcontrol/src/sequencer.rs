//! Random/shuffle sequencer.
//!
//! For `OrderMode::Random`, every entry pulled from the playlist gets a seed
//! from a deterministic chain:
//!
//! ```text
//! seed[0]   = chain_next(origin playback id)
//! seed[i+1] = chain_next(seed[i])
//! next      = (current + 1 + seed) mod playlist_size
//! ```
//!
//! Seeds are memoized per playback id, so the same entry always requests the
//! same seed from the same walk point. That makes the walk exactly
//! resumable after a backend migration or an app restart from only the
//! per-entry seed map and the last playlist playback entry pointer, without
//! persisting the materialized order.
//!
//! `OrderMode::Shuffle` materializes the window once with an unbiased
//! Fisher-Yates pass; `Sequential` is a plain wrap-around increment.

use std::collections::HashMap;

use rand::seq::SliceRandom;

use cdzqueue::PlaybackId;

use crate::selection::OrderMode;

// Knuth MMIX linear congruential constants.
const CHAIN_MULTIPLIER: u64 = 6364136223846793005;
const CHAIN_INCREMENT: u64 = 1442695040888963407;

/// One step of the fixed deterministic pseudorandom chain.
pub fn chain_next(seed: u64) -> u64 {
    seed.wrapping_mul(CHAIN_MULTIPLIER)
        .wrapping_add(CHAIN_INCREMENT)
}

/// Computed next playlist position plus the wrap-around flag used for
/// repeat-off termination.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct NextPosition {
    pub position: usize,
    /// True when the walk wrapped past the end of the playlist.
    pub wrapped: bool,
}

/// Next position for the given order mode. `seed` is only read in random
/// mode. `len` must be non-zero.
pub fn next_position(mode: OrderMode, current: usize, seed: u64, len: usize) -> NextPosition {
    debug_assert!(len > 0);
    let position = match mode {
        OrderMode::Random => (((current as u128) + 1 + seed as u128) % len as u128) as usize,
        OrderMode::Sequential | OrderMode::Shuffle => (current + 1) % len,
    };
    NextPosition {
        position,
        wrapped: position < current,
    }
}

/// Unbiased one-time shuffle of a playlist-position window.
pub fn shuffled_positions(len: usize) -> Vec<usize> {
    let mut positions: Vec<usize> = (0..len).collect();
    let mut rng = rand::rng();
    positions.shuffle(&mut rng);
    positions
}

/// Seed-chain walker with per-entry memoization.
#[derive(Clone, Debug, Default)]
pub struct RandomSequencer {
    memo: HashMap<PlaybackId, u64>,
    last_seed: Option<u64>,
}

impl RandomSequencer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Seed for the entry identified by `playback_id`. Memoized: asking
    /// again returns the same seed without advancing the walk. `origin` is
    /// the playback id of the entry the walk starts from (the last known
    /// playlist playback entry).
    pub fn seed_for(&mut self, playback_id: PlaybackId, origin: PlaybackId) -> u64 {
        if let Some(seed) = self.memo.get(&playback_id) {
            return *seed;
        }
        let seed = match self.last_seed {
            Some(previous) => chain_next(previous),
            None => chain_next(origin.0),
        };
        self.last_seed = Some(seed);
        self.memo.insert(playback_id, seed);
        seed
    }

    /// Memoized seed, without advancing the walk.
    pub fn memoized(&self, playback_id: PlaybackId) -> Option<u64> {
        self.memo.get(&playback_id).copied()
    }

    /// Re-anchors the walk on an already-memoized entry, typically the last
    /// playlist playback entry found in current/history after a restart.
    /// Returns false when that entry is unknown to the memo.
    pub fn resume_from(&mut self, playback_id: PlaybackId) -> bool {
        match self.memo.get(&playback_id) {
            Some(seed) => {
                self.last_seed = Some(*seed);
                true
            }
            None => false,
        }
    }

    /// Forgets everything; used when the playlist selection changes.
    pub fn reset(&mut self) {
        self.memo.clear();
        self.last_seed = None;
    }

    /// Per-entry seed map for host persistence.
    pub fn export_memo(&self) -> HashMap<PlaybackId, u64> {
        self.memo.clone()
    }

    pub fn restore_memo(&mut self, memo: HashMap<PlaybackId, u64>) {
        self.memo = memo;
        self.last_seed = None;
    }
}
