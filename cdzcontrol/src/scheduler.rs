//! Preload/depreload arithmetic.
//!
//! Given an insertion into the merged queue+playlist view, the plan decides
//! how many of the new entries enter the backend's preloaded set, how many
//! stale preloaded entries must leave it, and where everything lands, all
//! bounded by the backend capacity.
//!
//! The application order is fixed: depreload playlist entries (tail first),
//! then queue entries (tail first), then preload the new entries, then
//! buffer the remainder. Applying in that order never transiently exceeds
//! the backend capacity and keeps queue-before-playlist ordering intact.

/// Computed preload/depreload plan for one insertion.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct PreloadPlan {
    /// How many of the new entries go straight to the backend.
    pub preload_count: usize,
    /// Preloaded playlist entries to withdraw, taken from the tail.
    pub depreload_playlist: usize,
    /// Preloaded queue entries to withdraw, taken from the tail.
    pub depreload_queue: usize,
    /// Offset inside the backend's preloaded order where the new entries
    /// are inserted.
    pub backend_offset: usize,
    /// Offset inside the controller queue where the non-preloaded
    /// remainder is inserted, after the withdrawn entries were put back at
    /// its head.
    pub buffer_offset: usize,
}

impl PreloadPlan {
    /// Computes the plan for inserting `new_len` entries at `to_position`
    /// in the merged view, given the backend's current preloaded counts and
    /// its capacity.
    pub fn compute(
        to_position: usize,
        new_len: usize,
        preloaded_queue: usize,
        preloaded_playlist: usize,
        capacity: usize,
    ) -> Self {
        // New entries are preloaded only when they land inside the
        // preloaded queue window.
        let preload_count = if to_position < capacity && to_position <= preloaded_queue {
            new_len.min(capacity - to_position)
        } else {
            0
        };

        let depreload_total = (preloaded_queue + preload_count + preloaded_playlist)
            .saturating_sub(capacity);
        // Playlist entries leave first, then queue entries.
        let depreload_playlist = depreload_total.min(preloaded_playlist);
        let depreload_queue = (depreload_total - depreload_playlist).min(preloaded_queue);

        let backend_offset = preloaded_queue.min(to_position);

        // Merged target of the first non-preloaded new entry is
        // `to_position + preload_count`; subtracting the backend-resident
        // queue count after the plan runs yields the controller offset.
        let buffer_offset = (to_position as isize - preloaded_queue as isize
            + depreload_queue as isize)
            .max(0) as usize;

        Self {
            preload_count,
            depreload_playlist,
            depreload_queue,
            backend_offset,
            buffer_offset,
        }
    }

    /// Entries left over for the controller-side buffer.
    pub fn buffered_count(&self, new_len: usize) -> usize {
        new_len - self.preload_count
    }
}

/// How many entries a refill pass may still push into the backend.
pub fn top_up_capacity(num_preloaded: usize, capacity: usize) -> usize {
    capacity.saturating_sub(num_preloaded)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn append_outside_the_preloaded_window_buffers_everything() {
        // Capacity 3, nothing preloaded, insert at merged position 2:
        // 2 > preloaded_queue, so nothing preloads here (the top-up pass
        // fills the backend afterwards).
        let plan = PreloadPlan::compute(2, 1, 0, 0, 3);
        assert_eq!(plan.preload_count, 0);
        assert_eq!(plan.depreload_playlist, 0);
        assert_eq!(plan.depreload_queue, 0);
        assert_eq!(plan.buffer_offset, 2);
    }

    #[test]
    fn insert_inside_the_window_preloads_up_to_capacity() {
        let plan = PreloadPlan::compute(1, 2, 2, 0, 3);
        assert_eq!(plan.preload_count, 2);
        assert_eq!(plan.backend_offset, 1);
        // 2 + 2 - 3 = 1 entry over capacity; no playlist entries to shed.
        assert_eq!(plan.depreload_playlist, 0);
        assert_eq!(plan.depreload_queue, 1);
        assert_eq!(plan.buffer_offset, 0);
    }

    #[test]
    fn playlist_entries_are_shed_before_queue_entries() {
        let plan = PreloadPlan::compute(1, 2, 2, 1, 3);
        assert_eq!(plan.preload_count, 2);
        // Over by two: the single playlist entry leaves first, then one
        // queue entry.
        assert_eq!(plan.depreload_playlist, 1);
        assert_eq!(plan.depreload_queue, 1);
    }

    #[test]
    fn head_insert_with_full_backend() {
        let plan = PreloadPlan::compute(0, 1, 2, 1, 3);
        assert_eq!(plan.preload_count, 1);
        assert_eq!(plan.backend_offset, 0);
        assert_eq!(plan.depreload_playlist, 1);
        assert_eq!(plan.depreload_queue, 0);
        assert_eq!(plan.buffer_offset, 0);
    }

    #[test]
    fn oversized_insert_overflows_into_the_buffer_in_order() {
        let plan = PreloadPlan::compute(0, 5, 2, 0, 3);
        assert_eq!(plan.preload_count, 3);
        assert_eq!(plan.buffered_count(5), 2);
        // Both previously preloaded queue entries leave (2 + 3 - 3 = 2),
        // reinserted at the controller head; the remainder lands right
        // after the preloaded window.
        assert_eq!(plan.depreload_queue, 2);
        assert_eq!(plan.buffer_offset, 0);
    }

    #[test]
    fn merged_view_never_exceeds_capacity() {
        // Exhaustive sweep over small shapes.
        for capacity in 1..5usize {
            for preloaded_queue in 0..=capacity {
                for preloaded_playlist in 0..=(capacity - preloaded_queue) {
                    for to_position in 0..6usize {
                        for new_len in 0..6usize {
                            let plan = PreloadPlan::compute(
                                to_position,
                                new_len,
                                preloaded_queue,
                                preloaded_playlist,
                                capacity,
                            );
                            let after = preloaded_queue - plan.depreload_queue
                                + preloaded_playlist
                                - plan.depreload_playlist
                                + plan.preload_count;
                            assert!(
                                after <= capacity,
                                "over capacity: {plan:?} q={preloaded_queue} p={preloaded_playlist} cap={capacity} to={to_position} n={new_len}"
                            );
                            assert!(plan.preload_count <= new_len);
                            assert!(plan.depreload_queue <= preloaded_queue);
                            assert!(plan.depreload_playlist <= preloaded_playlist);
                        }
                    }
                }
            }
        }
    }

    #[test]
    fn top_up_capacity_is_the_remaining_headroom() {
        assert_eq!(top_up_capacity(1, 3), 2);
        assert_eq!(top_up_capacity(3, 3), 0);
        assert_eq!(top_up_capacity(5, 3), 0);
    }
}
