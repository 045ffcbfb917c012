//! Playlist reconciliation.
//!
//! External playlist edits arrive as a full new position list. The diff
//! engine computes the added/deleted/moved positions against the previously
//! known list, and applies the minimal corresponding edit to the
//! already-materialized playback entries: deletes remove buffered entries,
//! adds materialize new ones with freshly reserved playback ids, moves
//! rewrite `playlist_position` in place without touching playback id or
//! preload state.
//!
//! Identity is positional but keyed by `EntryId`, with first-occurrence
//! pairing for duplicated ids. Pure insertions and deletions shift the
//! positions of later entries without counting as moves; only entries whose
//! relative order among the survivors changed are reported as moved.

use std::collections::{HashMap, VecDeque};

use tracing::debug;

use cdzqueue::{EntryId, PlaybackEntry, PlaybackIdAllocator};

use crate::selection::{OrderMode, PlaylistSelection};
use crate::sequencer::{RandomSequencer, next_position};

/// Positional diff between two playlist snapshots.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct PlaylistDiff {
    /// Positions present in the new list only.
    pub added: Vec<usize>,
    /// Positions present in the old list only.
    pub deleted: Vec<usize>,
    /// (old position, new position) pairs whose relative order changed.
    pub moved: Vec<(usize, usize)>,
}

/// Old-position to new-position mapping of entries surviving the edit.
pub fn position_map(old: &[EntryId], new: &[EntryId]) -> HashMap<usize, usize> {
    match_positions(old, new).into_iter().collect()
}

/// (old position, new position) pairs of entries present in both lists,
/// in new-list order.
fn match_positions(old: &[EntryId], new: &[EntryId]) -> Vec<(usize, usize)> {
    let mut remaining: HashMap<&EntryId, VecDeque<usize>> = HashMap::new();
    for (position, id) in old.iter().enumerate() {
        remaining.entry(id).or_default().push_back(position);
    }
    let mut matched = Vec::new();
    for (new_position, id) in new.iter().enumerate() {
        if let Some(positions) = remaining.get_mut(id) {
            if let Some(old_position) = positions.pop_front() {
                matched.push((old_position, new_position));
            }
        }
    }
    matched
}

impl PlaylistDiff {
    /// Computes the positional diff between two id lists.
    pub fn between(old: &[EntryId], new: &[EntryId]) -> Self {
        let matched = match_positions(old, new);

        let matched_old: std::collections::HashSet<usize> =
            matched.iter().map(|(o, _)| *o).collect();
        let matched_new: std::collections::HashSet<usize> =
            matched.iter().map(|(_, n)| *n).collect();

        let deleted: Vec<usize> = (0..old.len())
            .filter(|position| !matched_old.contains(position))
            .collect();
        let added: Vec<usize> = (0..new.len())
            .filter(|position| !matched_new.contains(position))
            .collect();

        // An entry moved only when its rank among the survivors changed;
        // shifts induced by inserts/deletes around it do not count.
        let mut old_ranks: Vec<usize> = matched.iter().map(|(o, _)| *o).collect();
        old_ranks.sort_unstable();
        let moved: Vec<(usize, usize)> = matched
            .iter()
            .enumerate()
            .filter_map(|(new_rank, (old_position, new_position))| {
                let old_rank = old_ranks
                    .binary_search(old_position)
                    .expect("matched position is present");
                (old_rank != new_rank).then_some((*old_position, *new_position))
            })
            .collect();

        Self {
            added,
            deleted,
            moved,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.added.is_empty() && self.deleted.is_empty() && self.moved.is_empty()
    }
}

/// Result of applying a diff to the buffered playback entries.
#[derive(Debug, Default)]
pub struct DiffApplication {
    /// Buffered entries whose playlist position was deleted.
    pub removed: Vec<PlaybackEntry>,
    /// Freshly materialized entries for added positions (duplicates of
    /// already-buffered ids are skipped).
    pub added: Vec<PlaybackEntry>,
    /// How many buffered entries had their playlist position rewritten.
    pub repositioned: usize,
}

/// Applies the edit `old_ids -> new_ids` to the buffered playlist entries.
///
/// `buffered` holds the materialized playlist entries in playback order;
/// entries surviving the edit keep their playback id and preload state, and
/// have their `playlist_position` remapped to the new list.
pub fn apply_playlist_edit(
    buffered: &mut Vec<PlaybackEntry>,
    old_ids: &[EntryId],
    new_ids: &[EntryId],
    selection_id: u64,
    allocator: &PlaybackIdAllocator,
) -> DiffApplication {
    let diff = PlaylistDiff::between(old_ids, new_ids);
    if diff.is_empty() {
        return DiffApplication::default();
    }
    debug!(
        added = diff.added.len(),
        deleted = diff.deleted.len(),
        moved = diff.moved.len(),
        "applying playlist edit"
    );

    let position_map: HashMap<usize, usize> = match_positions(old_ids, new_ids)
        .into_iter()
        .collect();

    let mut removed = Vec::new();
    let mut repositioned = 0;
    let mut kept = Vec::with_capacity(buffered.len());
    for mut entry in buffered.drain(..) {
        let Some(old_position) = entry.playlist_position else {
            kept.push(entry);
            continue;
        };
        match position_map.get(&old_position) {
            Some(new_position) => {
                if entry.playlist_position != Some(*new_position) {
                    entry.playlist_position = Some(*new_position);
                    repositioned += 1;
                }
                kept.push(entry);
            }
            None => removed.push(entry),
        }
    }
    *buffered = kept;

    let mut added = Vec::new();
    let ids = allocator.reserve(diff.added.len());
    for (position, playback_id) in diff.added.iter().zip(ids) {
        let entry_id = &new_ids[*position];
        // Avoid duplicating an entry the buffer already carries.
        if buffered.iter().any(|e| &e.entry_id == entry_id) {
            continue;
        }
        added.push(PlaybackEntry::from_playlist(
            entry_id.clone(),
            playback_id,
            *position,
            selection_id,
        ));
    }

    DiffApplication {
        removed,
        added,
        repositioned,
    }
}

/// Invariant check of the playlist-playback buffer.
///
/// The buffer is correct iff:
///   (a) every buffered entry belongs to the active selection episode,
///   (b) its size stays within the prefetch bound,
///   (c) no playlist entry precedes a non-playlist entry in the merged view,
///   (d) its contents are exactly what the sequencer would produce from the
///       current position (sequential and random orders; a shuffled window
///       is its own reference order).
///
/// A failed check means the whole buffer must be cleared and depreloaded
/// before refilling.
pub fn is_buffer_correct(
    merged_view: &[PlaybackEntry],
    buffer: &[PlaybackEntry],
    selection: &PlaylistSelection,
    sequencer: &RandomSequencer,
    playlist_len: usize,
    max_prefetch: usize,
) -> bool {
    if buffer
        .iter()
        .any(|entry| entry.playlist_selection_id != selection.selection_id)
    {
        return false;
    }

    if buffer.len() > max_prefetch {
        return false;
    }

    let mut seen_playlist = false;
    for entry in merged_view {
        if entry.is_playlist() {
            seen_playlist = true;
        } else if seen_playlist {
            return false;
        }
    }

    if playlist_len == 0 {
        return buffer.is_empty();
    }

    match selection.order_mode {
        OrderMode::Shuffle => true,
        mode => {
            let mut position = selection.playlist_position;
            let mut entries = buffer.iter();
            // A buffer head sitting exactly at the current selection
            // position is the walk start (playback not yet past it), not a
            // produced successor.
            if buffer.first().and_then(|e| e.playlist_position) == Some(position) {
                entries.next();
            }
            for entry in entries {
                let seed = match mode {
                    OrderMode::Random => match sequencer.memoized(entry.playback_id) {
                        Some(seed) => seed,
                        None => return false,
                    },
                    _ => 0,
                };
                let expected = next_position(mode, position, seed, playlist_len).position;
                if entry.playlist_position != Some(expected) {
                    return false;
                }
                position = expected;
            }
            true
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use cdzqueue::PlaybackId;

    fn ids(names: &[&str]) -> Vec<EntryId> {
        names
            .iter()
            .map(|name| EntryId::new("playlist", *name))
            .collect()
    }

    #[test]
    fn insertion_is_one_added_and_nothing_else() {
        let old = ids(&["a", "b", "c"]);
        let new = ids(&["a", "b", "x", "c"]);
        let diff = PlaylistDiff::between(&old, &new);

        assert_eq!(diff.added, vec![2]);
        assert!(diff.deleted.is_empty());
        assert!(diff.moved.is_empty());
    }

    #[test]
    fn replace_at_same_position_is_delete_plus_add_not_move() {
        let old = ids(&["a", "b", "c"]);
        let new = ids(&["x", "b", "c"]);
        let diff = PlaylistDiff::between(&old, &new);

        assert_eq!(diff.deleted, vec![0]);
        assert_eq!(diff.added, vec![0]);
        assert!(diff.moved.is_empty());
    }

    #[test]
    fn reorder_is_reported_as_moves() {
        let old = ids(&["a", "b", "c"]);
        let new = ids(&["b", "a", "c"]);
        let diff = PlaylistDiff::between(&old, &new);

        assert!(diff.added.is_empty());
        assert!(diff.deleted.is_empty());
        assert_eq!(diff.moved, vec![(1, 0), (0, 1)]);
    }

    #[test]
    fn duplicated_ids_pair_by_first_occurrence() {
        let old = ids(&["a", "a", "b"]);
        let new = ids(&["a", "b"]);
        let diff = PlaylistDiff::between(&old, &new);

        assert_eq!(diff.deleted, vec![1]);
        assert!(diff.added.is_empty());
        assert!(diff.moved.is_empty());
    }

    fn buffered(name: &str, playback_id: u64, position: usize) -> PlaybackEntry {
        PlaybackEntry::from_playlist(
            EntryId::new("playlist", name),
            PlaybackId(playback_id),
            position,
            1,
        )
    }

    #[test]
    fn apply_removes_deleted_and_remaps_survivors() {
        let old = ids(&["a", "b", "c"]);
        let new = ids(&["b", "c"]);
        let allocator = PlaybackIdAllocator::new();
        let mut buffer = vec![
            buffered("a", 10, 0),
            buffered("b", 11, 1),
            buffered("c", 12, 2),
        ];

        let outcome = apply_playlist_edit(&mut buffer, &old, &new, 1, &allocator);

        assert_eq!(outcome.removed.len(), 1);
        assert_eq!(outcome.removed[0].entry_id.id, "a");
        assert!(outcome.added.is_empty());
        assert_eq!(buffer.len(), 2);
        assert_eq!(buffer[0].playlist_position, Some(0));
        assert_eq!(buffer[1].playlist_position, Some(1));
        // Playback ids survive the remap.
        assert_eq!(buffer[0].playback_id, PlaybackId(11));
    }

    #[test]
    fn apply_materializes_added_entries_with_fresh_ids() {
        let old = ids(&["a", "b"]);
        let new = ids(&["a", "x", "b"]);
        let allocator = PlaybackIdAllocator::new();
        let mut buffer = vec![buffered("a", 10, 0), buffered("b", 11, 1)];

        let outcome = apply_playlist_edit(&mut buffer, &old, &new, 1, &allocator);

        assert_eq!(outcome.added.len(), 1);
        let materialized = &outcome.added[0];
        assert_eq!(materialized.entry_id.id, "x");
        assert_eq!(materialized.playlist_position, Some(1));
        assert!(materialized.playback_id.is_valid());
        // The survivor behind the insertion shifted without being a move.
        assert_eq!(buffer[1].playlist_position, Some(2));
    }

    #[test]
    fn apply_preserves_preload_state_on_moves() {
        let old = ids(&["a", "b"]);
        let new = ids(&["b", "a"]);
        let allocator = PlaybackIdAllocator::new();
        let mut buffer = vec![
            buffered("a", 10, 0).with_preloaded(true),
            buffered("b", 11, 1),
        ];

        let outcome = apply_playlist_edit(&mut buffer, &old, &new, 1, &allocator);

        assert_eq!(outcome.repositioned, 2);
        assert!(buffer[0].preloaded);
        assert_eq!(buffer[0].playlist_position, Some(1));
        assert_eq!(buffer[0].playback_id, PlaybackId(10));
    }

    fn selection(mode: OrderMode) -> PlaylistSelection {
        PlaylistSelection::new(1, "pl", 0, mode, true)
    }

    #[test]
    fn buffer_with_stale_selection_is_incorrect() {
        let mut entry = buffered("a", 10, 1);
        entry.playlist_selection_id = 99;
        let sequencer = RandomSequencer::new();

        assert!(!is_buffer_correct(
            &[],
            &[entry],
            &selection(OrderMode::Sequential),
            &sequencer,
            4,
            10,
        ));
    }

    #[test]
    fn sequential_buffer_must_match_the_walk() {
        let sequencer = RandomSequencer::new();
        let good = vec![buffered("b", 10, 1), buffered("c", 11, 2)];
        let bad = vec![buffered("b", 10, 1), buffered("d", 11, 3)];

        assert!(is_buffer_correct(
            &good,
            &good,
            &selection(OrderMode::Sequential),
            &sequencer,
            4,
            10,
        ));
        assert!(!is_buffer_correct(
            &bad,
            &bad,
            &selection(OrderMode::Sequential),
            &sequencer,
            4,
            10,
        ));
    }

    #[test]
    fn queue_entry_after_playlist_entry_is_incorrect() {
        let sequencer = RandomSequencer::new();
        let playlist_entry = buffered("b", 10, 1);
        let queue_entry = PlaybackEntry::queued(EntryId::new("library", "q"), PlaybackId(20));
        let merged = vec![playlist_entry.clone(), queue_entry];

        assert!(!is_buffer_correct(
            &merged,
            &[playlist_entry],
            &selection(OrderMode::Sequential),
            &sequencer,
            4,
            10,
        ));
    }

    #[test]
    fn random_buffer_verifies_through_the_memo() {
        let mut sequencer = RandomSequencer::new();
        let origin = PlaybackId(5);
        let seed_one = sequencer.seed_for(PlaybackId(10), origin);
        let position_one = next_position(OrderMode::Random, 0, seed_one, 6).position;
        let seed_two = sequencer.seed_for(PlaybackId(11), origin);
        let position_two = next_position(OrderMode::Random, position_one, seed_two, 6).position;

        let buffer = vec![
            buffered("x", 10, position_one),
            buffered("y", 11, position_two),
        ];
        assert!(is_buffer_correct(
            &buffer,
            &buffer,
            &selection(OrderMode::Random),
            &sequencer,
            6,
            10,
        ));

        // An entry the memo never saw cannot be verified.
        let foreign = vec![buffered("z", 99, 3)];
        assert!(!is_buffer_correct(
            &foreign,
            &foreign,
            &selection(OrderMode::Random),
            &sequencer,
            6,
            10,
        ));
    }

    #[test]
    fn oversized_buffer_is_incorrect() {
        let sequencer = RandomSequencer::new();
        let buffer: Vec<PlaybackEntry> = (0..4)
            .map(|i| buffered("e", 10 + i as u64, i + 1))
            .collect();
        assert!(!is_buffer_correct(
            &buffer,
            &buffer,
            &selection(OrderMode::Sequential),
            &sequencer,
            10,
            3,
        ));
    }
}
