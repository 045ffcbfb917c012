//! Playback controller: the serializing command lane.
//!
//! Every mutating operation (queue, dequeue, move, shuffle, sort, transport,
//! playlist selection, preload recomputation) is submitted to a single lane
//! task; the lane executes at most one operation at a time, which removes
//! interleaved-mutation races on the ordered queues and on the backend's
//! preloaded set. Operations compose as chained asynchronous steps; a failed
//! step is logged and surfaced to the caller, already-applied in-memory
//! mutations are never rolled back, and subsequent queued operations keep
//! running.
//!
//! Backend migration drains and replaces the lane: the command sender is
//! closed, the lane finishes its backlog within a bounded wait, the outgoing
//! backend's state is captured and replayed into the new backend, and a
//! fresh lane resumes scheduling.

use std::sync::{Arc, Mutex as StdMutex};
use std::time::Duration;

use rand::seq::SliceRandom;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use cdzplayer::{
    AudioDataProvider, AudioPlayer, CatalogResolver, LocalPlayer, PlayerEvent,
    PlayerEventReceiver, PlayerEventSender, RemoteLink, RemotePlayer, player_event_channel,
};
use cdzqueue::{
    EntryId, EntryKind, EntryQueue, PlaybackEntry, PlaybackId, PlaybackIdAllocator, QueueId,
    QueueStore,
};

use crate::config::PlayerConfig;
use crate::diff::{apply_playlist_edit, is_buffer_correct};
use crate::error::{ControlError, Result};
use crate::events::{ControllerEvent, ControllerEventBus, PlaybackState};
use crate::playlist_store::PlaylistStore;
use crate::scheduler::{PreloadPlan, top_up_capacity};
use crate::sequencer::{RandomSequencer, next_position, shuffled_positions};
use crate::selection::{OrderMode, PlaylistSelection};

/// Sort key for the queue sort operation; compared through resolved
/// catalog metadata.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SortKey {
    Title,
    Artist,
    Album,
    Duration,
}

/// Collaborators and configuration injected into the controller. This is
/// the explicit context object; there is no process-wide instance.
#[derive(Clone)]
pub struct ControllerContext {
    pub store: Arc<dyn QueueStore>,
    pub provider: Arc<dyn AudioDataProvider>,
    pub resolver: Arc<dyn CatalogResolver>,
    pub playlist_store: Arc<dyn PlaylistStore>,
    pub config: PlayerConfig,
}

/// Introspection snapshot of the controller.
#[derive(Clone, Debug)]
pub struct ControllerStatus {
    pub playback_state: PlaybackState,
    pub current_entry: Option<PlaybackEntry>,
    pub num_preloaded: usize,
    pub queue_size: usize,
    pub playlist_buffer_size: usize,
    pub end_of_playlist: bool,
    pub selection: Option<PlaylistSelection>,
}

enum Command {
    Queue {
        entry_ids: Vec<EntryId>,
        position: Option<usize>,
        reply: oneshot::Sender<Result<()>>,
    },
    Dequeue {
        playback_ids: Vec<PlaybackId>,
        reply: oneshot::Sender<Result<()>>,
    },
    MoveEntry {
        playback_id: PlaybackId,
        to_position: usize,
        reply: oneshot::Sender<Result<()>>,
    },
    ShuffleQueue {
        reply: oneshot::Sender<Result<()>>,
    },
    SortQueue {
        key: SortKey,
        reply: oneshot::Sender<Result<()>>,
    },
    Play {
        reply: oneshot::Sender<Result<()>>,
    },
    Pause {
        reply: oneshot::Sender<Result<()>>,
    },
    Stop {
        reply: oneshot::Sender<Result<()>>,
    },
    Seek {
        position: Duration,
        reply: oneshot::Sender<Result<()>>,
    },
    Next {
        reply: oneshot::Sender<Result<()>>,
    },
    Previous {
        reply: oneshot::Sender<Result<()>>,
    },
    SelectPlaylist {
        playlist_id: String,
        start_position: usize,
        order_mode: OrderMode,
        repeat: bool,
        reply: oneshot::Sender<Result<()>>,
    },
    SetOrderMode {
        order_mode: OrderMode,
        reply: oneshot::Sender<Result<()>>,
    },
    SetRepeat {
        repeat: bool,
        reply: oneshot::Sender<Result<()>>,
    },
    Sync {
        reply: oneshot::Sender<Result<()>>,
    },
    PlaylistChanged {
        playlist_id: String,
        new_ids: Vec<EntryId>,
        reply: Option<oneshot::Sender<Result<()>>>,
    },
    RestoreQueues {
        reply: oneshot::Sender<Result<()>>,
    },
    GetStatus {
        reply: oneshot::Sender<ControllerStatus>,
    },
    GetUpcoming {
        reply: oneshot::Sender<Vec<PlaybackEntry>>,
    },
    GetHistory {
        reply: oneshot::Sender<Vec<PlaybackEntry>>,
    },
}

/// State owned by the lane task. Single owner: no lock needed beyond the
/// per-queue list locks.
struct LaneState {
    player: AudioPlayer,
    queue: EntryQueue,
    playlist_buffer: EntryQueue,
    playlist_playback: EntryQueue,
    history: EntryQueue,
    selection: Option<PlaylistSelection>,
    selection_counter: u64,
    sequencer: RandomSequencer,
    allocator: Arc<PlaybackIdAllocator>,
    known_playlist: Vec<EntryId>,
    shuffle_order: Option<Vec<usize>>,
    /// Position (playlist position, or shuffled-order index in shuffle
    /// mode) of the last entry produced by the walk.
    last_walk_position: Option<usize>,
    /// Playback id anchoring the random seed chain for this selection.
    walk_origin: PlaybackId,
    end_of_playlist: bool,
    playback_state: PlaybackState,
    config: PlayerConfig,
    events: ControllerEventBus,
    resolver: Arc<dyn CatalogResolver>,
    playlist_store: Arc<dyn PlaylistStore>,
    cmd_tx: Option<mpsc::UnboundedSender<Command>>,
}

impl LaneState {
    fn new(context: &ControllerContext, player: AudioPlayer, events: ControllerEventBus) -> Self {
        let make_queue = |queue_id: QueueId| {
            let queue = EntryQueue::new(queue_id.clone(), Arc::clone(&context.store));
            let bus = events.clone();
            queue.add_observer(Arc::new(move |previous_size, size| {
                bus.broadcast(ControllerEvent::QueueChanged {
                    queue_id: queue_id.clone(),
                    previous_size,
                    size,
                });
            }));
            queue
        };
        Self {
            player,
            queue: make_queue(QueueId::queue()),
            playlist_buffer: make_queue(QueueId::playlist_buffer()),
            playlist_playback: make_queue(QueueId::playlist_playback()),
            history: make_queue(QueueId::history()),
            selection: None,
            selection_counter: 0,
            sequencer: RandomSequencer::new(),
            allocator: Arc::new(PlaybackIdAllocator::new()),
            known_playlist: Vec::new(),
            shuffle_order: None,
            last_walk_position: None,
            walk_origin: PlaybackId::INVALID,
            end_of_playlist: false,
            playback_state: PlaybackState::Stopped,
            config: context.config.clone(),
            events: events.clone(),
            resolver: Arc::clone(&context.resolver),
            playlist_store: Arc::clone(&context.playlist_store),
            cmd_tx: None,
        }
    }

    fn preloaded_queue_entries(&self) -> Vec<PlaybackEntry> {
        self.player.get_queue_entries(usize::MAX)
    }

    fn preloaded_playlist_entries(&self) -> Vec<PlaybackEntry> {
        self.player.get_playlist_entries(usize::MAX)
    }

    /// Merged view: backend queue entries, controller queue, backend
    /// playlist entries, controller playlist buffer.
    fn merged_view(&self) -> Vec<PlaybackEntry> {
        let mut merged = self.preloaded_queue_entries();
        merged.extend(self.queue.snapshot());
        merged.extend(self.preloaded_playlist_entries());
        merged.extend(self.playlist_buffer.snapshot());
        merged
    }

    /// Keeps the playlist-playback queue equal to the merged playlist view.
    fn sync_playlist_playback(&self) {
        let mut view = self.preloaded_playlist_entries();
        view.extend(self.playlist_buffer.snapshot());
        let current = self.playlist_playback.snapshot();
        let same = current.len() == view.len()
            && current.iter().zip(view.iter()).all(|(a, b)| {
                a.playback_id == b.playback_id && a.playlist_position == b.playlist_position
            });
        if !same {
            let _ = self.playlist_playback.replace_with(view);
        }
    }

    // =====================================================================
    //  Scheduler application
    // =====================================================================

    /// Applies a preload plan in the mandated order: depreload playlist,
    /// depreload queue, preload new entries, buffer the remainder.
    async fn apply_plan(&mut self, plan: PreloadPlan, new_entries: Vec<PlaybackEntry>) -> Result<()> {
        if plan.depreload_playlist > 0 {
            let preloaded = self.preloaded_playlist_entries();
            let victims = preloaded[preloaded.len() - plan.depreload_playlist..].to_vec();
            let removed = self.player.depreload(&victims).await?;
            let _ = self.playlist_buffer.add(0, removed)?;
        }
        if plan.depreload_queue > 0 {
            let preloaded = self.preloaded_queue_entries();
            let victims = preloaded[preloaded.len() - plan.depreload_queue..].to_vec();
            let removed = self.player.depreload(&victims).await?;
            let _ = self.queue.add(0, removed)?;
        }

        let mut new_entries = new_entries;
        let to_buffer = new_entries.split_off(plan.preload_count);
        if !new_entries.is_empty() {
            self.player.preload_at(plan.backend_offset, new_entries).await?;
        }
        if !to_buffer.is_empty() {
            let at = plan.buffer_offset.min(self.queue.size());
            let _ = self.queue.add(at, to_buffer)?;
        }
        Ok(())
    }

    /// Refills the backend to capacity: controller queue head first, then
    /// playlist production.
    async fn top_up(&mut self) -> Result<()> {
        loop {
            let headroom = top_up_capacity(
                self.player.get_num_preloaded(),
                self.player.get_max_to_preload(),
            );
            if headroom == 0 {
                break;
            }
            if !self.queue.is_empty() {
                let (mut polled, _) = self.queue.poll(1);
                if let Some(entry) = polled.pop() {
                    // Queue entries stay ahead of any preloaded playlist
                    // entry.
                    let at = self.preloaded_queue_entries().len();
                    self.player.preload_at(at, vec![entry]).await?;
                    continue;
                }
            }
            if let Some(entry) = self.next_playlist_entry() {
                self.player.preload(vec![entry]).await?;
                continue;
            }
            break;
        }
        self.sync_playlist_playback();
        Ok(())
    }

    /// Next playlist entry to preload: buffered first, then freshly
    /// produced by the walk.
    fn next_playlist_entry(&mut self) -> Option<PlaybackEntry> {
        if !self.playlist_buffer.is_empty() {
            let (mut polled, _) = self.playlist_buffer.poll(1);
            return polled.pop();
        }
        self.produce_playlist_entry()
    }

    /// Advances the playback-order walk and materializes the entry there.
    fn produce_playlist_entry(&mut self) -> Option<PlaybackEntry> {
        let selection = self.selection.clone()?;
        if self.end_of_playlist {
            return None;
        }
        let len = self.known_playlist.len();
        if len == 0 {
            return None;
        }

        let playback_id = self.allocator.reserve_one();
        let walk_position = match self.last_walk_position {
            None => {
                // First production of this episode starts at the selected
                // position; it also anchors the random seed chain.
                self.walk_origin = playback_id;
                match selection.order_mode {
                    OrderMode::Shuffle => 0,
                    _ => selection.playlist_position.min(len - 1),
                }
            }
            Some(current) => {
                let seed = match selection.order_mode {
                    OrderMode::Random => self.sequencer.seed_for(playback_id, self.walk_origin),
                    _ => 0,
                };
                let next = next_position(selection.order_mode, current, seed, len);
                if next.wrapped && !selection.repeat {
                    info!("end of playlist reached");
                    self.end_of_playlist = true;
                    return None;
                }
                next.position
            }
        };

        let playlist_position = match (&selection.order_mode, &self.shuffle_order) {
            (OrderMode::Shuffle, Some(order)) => *order.get(walk_position)?,
            _ => walk_position,
        };
        let entry_id = self.known_playlist.get(playlist_position)?.clone();
        self.last_walk_position = Some(walk_position);
        Some(PlaybackEntry::from_playlist(
            entry_id,
            playback_id,
            playlist_position,
            selection.selection_id,
        ))
    }

    /// Re-anchors the walk on the most recent playlist entry of the active
    /// selection, scanning the current entry first, then the history.
    fn reanchor_walk(&mut self) {
        let Some(selection) = self.selection.clone() else {
            return;
        };
        let mut candidates = Vec::new();
        candidates.extend(self.player.get_current_entry());
        let mut history = self.history.snapshot();
        history.reverse();
        candidates.extend(history);

        let anchor = candidates.into_iter().find(|entry| {
            entry.is_playlist() && entry.playlist_selection_id == selection.selection_id
        });
        match anchor {
            Some(entry) => {
                self.walk_origin = entry.playback_id;
                self.sequencer.resume_from(entry.playback_id);
                self.last_walk_position = match (&selection.order_mode, &self.shuffle_order) {
                    (OrderMode::Shuffle, Some(order)) => entry
                        .playlist_position
                        .and_then(|p| order.iter().position(|x| *x == p)),
                    _ => entry.playlist_position,
                };
            }
            None => {
                self.last_walk_position = None;
                self.walk_origin = PlaybackId::INVALID;
            }
        }
    }

    /// Runs the buffer invariant check; on failure the whole playlist
    /// buffer is depreloaded, cleared and rebuilt from the walk anchor.
    async fn verify_playlist_buffer(&mut self) -> Result<()> {
        let Some(selection) = self.selection.clone() else {
            return Ok(());
        };
        let mut buffer = self.preloaded_playlist_entries();
        buffer.extend(self.playlist_buffer.snapshot());
        let correct = is_buffer_correct(
            &self.merged_view(),
            &buffer,
            &selection,
            &self.sequencer,
            self.known_playlist.len(),
            self.config.max_prefetch_count,
        );
        if correct {
            return Ok(());
        }
        warn!(
            selection = selection.selection_id,
            buffered = buffer.len(),
            "playlist-playback buffer failed verification, rebuilding"
        );
        self.clear_playlist_buffer().await?;
        self.reanchor_walk();
        Ok(())
    }

    /// Depreloads every playlist entry and clears the controller-side
    /// playlist buffers.
    async fn clear_playlist_buffer(&mut self) -> Result<()> {
        let preloaded = self.preloaded_playlist_entries();
        if !preloaded.is_empty() {
            self.player.depreload(&preloaded).await?;
        }
        let _ = self.playlist_buffer.clear();
        let _ = self.playlist_playback.clear();
        Ok(())
    }

    /// Stops playback once the playlist ran out with repeat off.
    async fn finish_if_playlist_ended(&mut self) -> Result<()> {
        if !self.end_of_playlist {
            return Ok(());
        }
        let exhausted = self.preloaded_playlist_entries().is_empty()
            && self.playlist_buffer.is_empty()
            && self.player.get_current_entry().is_none();
        if exhausted {
            info!("playlist ended without repeat, stopping playback");
            self.player.stop().await.ok();
            self.end_of_playlist = false;
            self.set_playback_state(PlaybackState::Stopped);
        }
        Ok(())
    }

    fn set_playback_state(&mut self, state: PlaybackState) {
        if self.playback_state != state {
            self.playback_state = state;
            self.events
                .broadcast(ControllerEvent::PlaybackStateChanged(state));
        }
    }

    // =====================================================================
    //  Command handlers
    // =====================================================================

    async fn handle_queue(
        &mut self,
        entry_ids: Vec<EntryId>,
        position: Option<usize>,
    ) -> Result<()> {
        let ids = self.allocator.reserve(entry_ids.len());
        let entries: Vec<PlaybackEntry> = entry_ids
            .into_iter()
            .zip(ids)
            .map(|(entry_id, playback_id)| PlaybackEntry::queued(entry_id, playback_id))
            .collect();

        let preloaded_queue = self.preloaded_queue_entries().len();
        let preloaded_playlist = self.preloaded_playlist_entries().len();
        let merged_queue_len = preloaded_queue + self.queue.size();
        let to_position = position.unwrap_or(merged_queue_len).min(merged_queue_len);

        let plan = PreloadPlan::compute(
            to_position,
            entries.len(),
            preloaded_queue,
            preloaded_playlist,
            self.player.get_max_to_preload(),
        );
        debug!(?plan, to_position, "queueing {} entries", entries.len());
        self.apply_plan(plan, entries).await?;
        self.top_up().await
    }

    async fn handle_dequeue(&mut self, playback_ids: Vec<PlaybackId>) -> Result<()> {
        let mut preloaded_victims = Vec::new();
        let mut missing = Vec::new();
        for playback_id in playback_ids {
            let preloaded = self
                .preloaded_queue_entries()
                .into_iter()
                .chain(self.preloaded_playlist_entries())
                .find(|e| e.playback_id == playback_id);
            if let Some(entry) = preloaded {
                preloaded_victims.push(entry);
            } else if self.queue.position_of(playback_id).is_some() {
                let _ = self.queue.remove_ids(&[playback_id]);
            } else if self.playlist_buffer.position_of(playback_id).is_some() {
                let _ = self.playlist_buffer.remove_ids(&[playback_id]);
            } else {
                // Severe anomaly: the caller dequeued an entry nobody owns.
                error!(%playback_id, "dequeue could not locate entry");
                missing.push(playback_id);
            }
        }
        if !preloaded_victims.is_empty() {
            self.player.depreload(&preloaded_victims).await?;
        }
        self.top_up().await?;
        if let Some(playback_id) = missing.first() {
            return Err(ControlError::InconsistentState(format!(
                "entry {playback_id} is neither preloaded nor buffered"
            )));
        }
        Ok(())
    }

    async fn handle_move(&mut self, playback_id: PlaybackId, to_position: usize) -> Result<()> {
        // Withdraw the entry from wherever it lives, then reinsert through
        // the regular scheduling path, keeping its playback id.
        let entry = if let Some(entry) = self
            .preloaded_queue_entries()
            .into_iter()
            .find(|e| e.playback_id == playback_id)
        {
            let mut removed = self.player.depreload(&[entry]).await?;
            removed.pop()
        } else if let Some(index) = self.queue.position_of(playback_id) {
            let entry = self.queue.get(index);
            let _ = self.queue.remove_ids(&[playback_id]);
            entry
        } else {
            None
        };
        let Some(entry) = entry else {
            return Err(ControlError::InconsistentState(format!(
                "cannot move unknown entry {playback_id}"
            )));
        };

        let preloaded_queue = self.preloaded_queue_entries().len();
        let preloaded_playlist = self.preloaded_playlist_entries().len();
        let merged_queue_len = preloaded_queue + self.queue.size();
        let to_position = to_position.min(merged_queue_len);
        let plan = PreloadPlan::compute(
            to_position,
            1,
            preloaded_queue,
            preloaded_playlist,
            self.player.get_max_to_preload(),
        );
        self.apply_plan(plan, vec![entry]).await?;
        self.top_up().await
    }

    /// Withdraws every preloaded queue entry except the current one, so a
    /// reorder can cover the whole user queue.
    async fn drain_queue_for_reorder(&mut self) -> Result<Vec<PlaybackEntry>> {
        let current = self.player.get_current_entry();
        let victims: Vec<PlaybackEntry> = self
            .preloaded_queue_entries()
            .into_iter()
            .filter(|e| Some(e.playback_id) != current.as_ref().map(|c| c.playback_id))
            .collect();
        let mut merged = if victims.is_empty() {
            Vec::new()
        } else {
            self.player.depreload(&victims).await?
        };
        merged.extend(self.queue.snapshot());
        Ok(merged)
    }

    async fn handle_shuffle_queue(&mut self) -> Result<()> {
        let mut merged = self.drain_queue_for_reorder().await?;
        {
            let mut rng = rand::rng();
            merged.shuffle(&mut rng);
        }
        let _ = self.queue.replace_with(merged);
        self.top_up().await
    }

    async fn handle_sort_queue(&mut self, key: SortKey) -> Result<()> {
        let merged = self.drain_queue_for_reorder().await?;
        let ids: Vec<EntryId> = merged.iter().map(|e| e.entry_id.clone()).collect();
        let metadata = self.resolver.resolve_many(&ids).await?;

        let mut keyed: Vec<(PlaybackEntry, String, u64)> = merged
            .into_iter()
            .zip(metadata)
            .map(|(entry, meta)| {
                let text = match key {
                    SortKey::Title => meta.title.unwrap_or_default(),
                    SortKey::Artist => meta.artist.unwrap_or_default(),
                    SortKey::Album => meta.album.unwrap_or_default(),
                    SortKey::Duration => String::new(),
                };
                (entry, text.to_lowercase(), meta.duration_secs.unwrap_or(0))
            })
            .collect();
        match key {
            SortKey::Duration => keyed.sort_by_key(|(_, _, duration)| *duration),
            _ => keyed.sort_by(|a, b| a.1.cmp(&b.1)),
        }
        let _ = self
            .queue
            .replace_with(keyed.into_iter().map(|(entry, _, _)| entry).collect());
        self.top_up().await
    }

    async fn handle_play(&mut self) -> Result<()> {
        if self.player.get_num_preloaded() == 0 {
            self.top_up().await?;
        }
        self.player.play().await?;
        self.set_playback_state(PlaybackState::Playing);
        Ok(())
    }

    async fn handle_pause(&mut self) -> Result<()> {
        self.player.pause().await?;
        self.set_playback_state(PlaybackState::Paused);
        Ok(())
    }

    async fn handle_stop(&mut self) -> Result<()> {
        self.player.stop().await?;
        self.set_playback_state(PlaybackState::Stopped);
        Ok(())
    }

    async fn handle_seek(&mut self, position: Duration) -> Result<()> {
        self.player.seek(position).await?;
        self.events
            .broadcast(ControllerEvent::SeekPositionChanged(position));
        Ok(())
    }

    async fn handle_next(&mut self) -> Result<()> {
        self.player.next().await?;
        self.top_up().await?;
        self.events.broadcast(ControllerEvent::CurrentEntryChanged(
            self.player.get_current_entry(),
        ));
        Ok(())
    }

    async fn handle_previous(&mut self) -> Result<()> {
        self.player.previous().await?;
        self.events.broadcast(ControllerEvent::CurrentEntryChanged(
            self.player.get_current_entry(),
        ));
        Ok(())
    }

    async fn handle_select_playlist(
        &mut self,
        playlist_id: String,
        start_position: usize,
        order_mode: OrderMode,
        repeat: bool,
    ) -> Result<()> {
        self.selection_counter += 1;
        let ids = self.playlist_store.read(&playlist_id).await?;
        info!(
            playlist = %playlist_id,
            entries = ids.len(),
            %order_mode,
            "selecting playlist"
        );

        self.clear_playlist_buffer().await?;
        self.sequencer.reset();
        self.end_of_playlist = false;
        self.last_walk_position = None;
        self.walk_origin = PlaybackId::INVALID;
        self.known_playlist = ids;

        self.shuffle_order = (order_mode == OrderMode::Shuffle).then(|| {
            // Current position first, the rest shuffled behind it.
            let mut order = shuffled_positions(self.known_playlist.len());
            if let Some(index) = order.iter().position(|p| *p == start_position) {
                order.swap(0, index);
            }
            order
        });

        let selection = PlaylistSelection::new(
            self.selection_counter,
            playlist_id.clone(),
            start_position,
            order_mode,
            repeat,
        );
        self.selection = Some(selection.clone());
        self.spawn_playlist_watcher(playlist_id);
        self.top_up().await?;

        self.events
            .broadcast(ControllerEvent::PlaylistSelectionChanged(Some(selection)));
        self.events
            .broadcast(ControllerEvent::PlaybackOrderChanged(order_mode));
        self.events
            .broadcast(ControllerEvent::RepeatModeChanged(repeat));
        Ok(())
    }

    /// Watches the selected playlist for external edits and feeds them back
    /// into the lane. Stale watchers are filtered by playlist id.
    fn spawn_playlist_watcher(&self, playlist_id: String) {
        let Some(cmd_tx) = self.cmd_tx.clone() else {
            return;
        };
        let mut stream = self.playlist_store.subscribe(&playlist_id);
        tokio::spawn(async move {
            use futures::StreamExt;
            while let Some(new_ids) = stream.next().await {
                let command = Command::PlaylistChanged {
                    playlist_id: playlist_id.clone(),
                    new_ids,
                    reply: None,
                };
                if cmd_tx.send(command).is_err() {
                    break;
                }
            }
        });
    }

    /// An order/repeat change is a new selection episode: the buffered
    /// entries become stale and the buffer is rebuilt.
    async fn reselect(&mut self, order_mode: OrderMode, repeat: bool) -> Result<()> {
        let Some(previous) = self.selection.clone() else {
            return Err(ControlError::NoSelection);
        };
        self.selection_counter += 1;

        // Resume from the entry currently playing when it belongs to the
        // outgoing episode.
        let anchor_position = self
            .player
            .get_current_entry()
            .filter(|e| e.is_playlist())
            .and_then(|e| e.playlist_position)
            .unwrap_or(previous.playlist_position);

        self.clear_playlist_buffer().await?;
        self.sequencer.reset();
        self.end_of_playlist = false;
        self.last_walk_position = None;
        self.walk_origin = PlaybackId::INVALID;
        self.shuffle_order = (order_mode == OrderMode::Shuffle).then(|| {
            let mut order = shuffled_positions(self.known_playlist.len());
            if let Some(index) = order.iter().position(|p| *p == anchor_position) {
                order.swap(0, index);
            }
            order
        });

        let mut selection = previous;
        selection.selection_id = self.selection_counter;
        selection.playlist_position = anchor_position;
        selection.playback_position = 0;
        selection.order_mode = order_mode;
        selection.repeat = repeat;
        self.selection = Some(selection.clone());

        // The current entry keeps playing; only the upcoming buffer is
        // rebuilt around it, and it anchors the new seed chain.
        if let Some(current) = self.player.get_current_entry() {
            self.walk_origin = current.playback_id;
            self.last_walk_position = match (&order_mode, &self.shuffle_order) {
                (OrderMode::Shuffle, Some(_)) => Some(0),
                _ => Some(anchor_position),
            };
        }
        self.top_up().await?;
        self.events
            .broadcast(ControllerEvent::PlaylistSelectionChanged(Some(selection)));
        Ok(())
    }

    async fn handle_set_order_mode(&mut self, order_mode: OrderMode) -> Result<()> {
        let repeat = self.selection.as_ref().map(|s| s.repeat).unwrap_or(false);
        self.reselect(order_mode, repeat).await?;
        self.events
            .broadcast(ControllerEvent::PlaybackOrderChanged(order_mode));
        Ok(())
    }

    async fn handle_set_repeat(&mut self, repeat: bool) -> Result<()> {
        let order_mode = self
            .selection
            .as_ref()
            .map(|s| s.order_mode)
            .ok_or(ControlError::NoSelection)?;
        self.reselect(order_mode, repeat).await?;
        self.events
            .broadcast(ControllerEvent::RepeatModeChanged(repeat));
        Ok(())
    }

    async fn handle_playlist_changed(
        &mut self,
        playlist_id: String,
        new_ids: Vec<EntryId>,
    ) -> Result<()> {
        let Some(selection) = self.selection.clone() else {
            self.known_playlist = new_ids;
            return Ok(());
        };
        if selection.playlist_id != playlist_id {
            // Stale watcher for a previously selected playlist.
            return Ok(());
        }
        let old_ids = std::mem::take(&mut self.known_playlist);

        let mut merged = self.preloaded_playlist_entries();
        let preloaded_len = merged.len();
        merged.extend(self.playlist_buffer.snapshot());
        let outcome = apply_playlist_edit(
            &mut merged,
            &old_ids,
            &new_ids,
            selection.selection_id,
            &self.allocator,
        );

        let preloaded_victims: Vec<PlaybackEntry> = outcome
            .removed
            .iter()
            .filter(|e| e.preloaded)
            .cloned()
            .collect();
        if !preloaded_victims.is_empty() {
            self.player.depreload(&preloaded_victims).await?;
        }

        // Survivors keep their split: still-preloaded entries live in the
        // backend, the rest is the controller buffer plus the additions in
        // playlist order.
        let buffered_after: Vec<PlaybackEntry> = merged
            .iter()
            .skip(preloaded_len.saturating_sub(preloaded_victims.len()))
            .filter(|e| !e.preloaded)
            .cloned()
            .collect();
        let mut buffered_after = buffered_after;
        let mut additions = outcome.added;
        additions.sort_by_key(|e| e.playlist_position);
        buffered_after.extend(additions);
        let _ = self.playlist_buffer.replace_with(buffered_after);

        // Remap the selection pointer through the surviving current entry.
        if let Some(current) = self.player.get_current_entry().filter(|e| e.is_playlist()) {
            if let Some(updated) = merged
                .iter()
                .find(|e| e.playback_id == current.playback_id)
            {
                if let (Some(selection), Some(position)) =
                    (self.selection.as_mut(), updated.playlist_position)
                {
                    selection.playlist_position = position;
                }
            }
        }
        if let Some(last) = merged.iter().rev().find_map(|e| e.playlist_position) {
            if self.selection.as_ref().map(|s| s.order_mode) != Some(OrderMode::Shuffle) {
                self.last_walk_position = Some(last);
            }
        }
        // A materialized shuffle window indexes playlist positions; remap
        // it through the edit and append the new positions at its end.
        if let Some(order) = self.shuffle_order.as_mut() {
            let map = crate::diff::position_map(&old_ids, &new_ids);
            let mut remapped: Vec<usize> =
                order.iter().filter_map(|p| map.get(p).copied()).collect();
            let mut fresh: Vec<usize> = (0..new_ids.len())
                .filter(|p| !remapped.contains(p))
                .collect();
            remapped.append(&mut fresh);
            *order = remapped;
        }
        self.known_playlist = new_ids;
        if self.selection.as_ref().map(|s| s.repeat).unwrap_or(false) {
            self.end_of_playlist = false;
        }

        self.verify_playlist_buffer().await?;
        self.top_up().await
    }

    async fn handle_sync(&mut self) -> Result<()> {
        self.verify_playlist_buffer().await?;
        self.top_up().await?;
        self.finish_if_playlist_ended().await
    }

    async fn handle_restore_queues(&mut self) -> Result<()> {
        self.queue.restore().await?;
        self.playlist_buffer.restore().await?;
        self.playlist_playback.restore().await?;
        self.history.restore().await?;
        self.reanchor_walk();
        Ok(())
    }

    fn status(&self) -> ControllerStatus {
        ControllerStatus {
            playback_state: self.playback_state,
            current_entry: self.player.get_current_entry(),
            num_preloaded: self.player.get_num_preloaded(),
            queue_size: self.queue.size(),
            playlist_buffer_size: self.playlist_buffer.size(),
            end_of_playlist: self.end_of_playlist,
            selection: self.selection.clone(),
        }
    }

    fn upcoming(&self) -> Vec<PlaybackEntry> {
        self.merged_view()
    }

    // =====================================================================
    //  Backend events
    // =====================================================================

    async fn handle_player_event(&mut self, event: PlayerEvent) {
        match event {
            PlayerEvent::EntryStarted(entry) => {
                if let (Some(selection), Some(position)) =
                    (self.selection.as_mut(), entry.playlist_position)
                {
                    if entry.playlist_selection_id == selection.selection_id {
                        selection.playlist_position = position;
                    }
                }
                self.set_playback_state(PlaybackState::Playing);
                self.events
                    .broadcast(ControllerEvent::CurrentEntryChanged(Some(entry)));
            }
            PlayerEvent::EntryCompleted(entry) => {
                if let Some(selection) = self.selection.as_mut() {
                    if entry.playlist_selection_id == selection.selection_id {
                        selection.playback_position += 1;
                    }
                }
                let _ = self
                    .history
                    .append(vec![entry.with_kind(EntryKind::History)]);
                let overflow = self.history.size().saturating_sub(self.config.history_limit);
                if overflow > 0 {
                    let _ = self.history.poll(overflow);
                }
                if let Err(e) = self.top_up().await {
                    error!(error = %e, "preload recomputation after completion failed");
                }
                self.events.broadcast(ControllerEvent::CurrentEntryChanged(
                    self.player.get_current_entry(),
                ));
                if let Err(e) = self.finish_if_playlist_ended().await {
                    error!(error = %e, "end-of-playlist handling failed");
                }
            }
            PlayerEvent::BufferingChanged { buffering } => {
                debug!(buffering, "backend buffering state changed");
            }
            PlayerEvent::UnitError {
                entry,
                kind,
                message,
                terminal,
            } => {
                // No auto-skip: surfaced, the host decides.
                error!(
                    entry = %entry.playback_id,
                    %kind,
                    terminal,
                    message = %message,
                    "backend unit error"
                );
            }
            PlayerEvent::RemoteDisconnected => {
                warn!("remote backend disconnected");
                self.set_playback_state(PlaybackState::Stopped);
            }
        }
    }

    async fn handle(&mut self, command: Command) {
        match command {
            Command::Queue {
                entry_ids,
                position,
                reply,
            } => {
                let result = self.handle_queue(entry_ids, position).await;
                self.log_and_reply("queue", result, reply);
            }
            Command::Dequeue { playback_ids, reply } => {
                let result = self.handle_dequeue(playback_ids).await;
                self.log_and_reply("dequeue", result, reply);
            }
            Command::MoveEntry {
                playback_id,
                to_position,
                reply,
            } => {
                let result = self.handle_move(playback_id, to_position).await;
                self.log_and_reply("move", result, reply);
            }
            Command::ShuffleQueue { reply } => {
                let result = self.handle_shuffle_queue().await;
                self.log_and_reply("shuffle", result, reply);
            }
            Command::SortQueue { key, reply } => {
                let result = self.handle_sort_queue(key).await;
                self.log_and_reply("sort", result, reply);
            }
            Command::Play { reply } => {
                let result = self.handle_play().await;
                self.log_and_reply("play", result, reply);
            }
            Command::Pause { reply } => {
                let result = self.handle_pause().await;
                self.log_and_reply("pause", result, reply);
            }
            Command::Stop { reply } => {
                let result = self.handle_stop().await;
                self.log_and_reply("stop", result, reply);
            }
            Command::Seek { position, reply } => {
                let result = self.handle_seek(position).await;
                self.log_and_reply("seek", result, reply);
            }
            Command::Next { reply } => {
                let result = self.handle_next().await;
                self.log_and_reply("next", result, reply);
            }
            Command::Previous { reply } => {
                let result = self.handle_previous().await;
                self.log_and_reply("previous", result, reply);
            }
            Command::SelectPlaylist {
                playlist_id,
                start_position,
                order_mode,
                repeat,
                reply,
            } => {
                let result = self
                    .handle_select_playlist(playlist_id, start_position, order_mode, repeat)
                    .await;
                self.log_and_reply("select-playlist", result, reply);
            }
            Command::SetOrderMode { order_mode, reply } => {
                let result = self.handle_set_order_mode(order_mode).await;
                self.log_and_reply("set-order-mode", result, reply);
            }
            Command::SetRepeat { repeat, reply } => {
                let result = self.handle_set_repeat(repeat).await;
                self.log_and_reply("set-repeat", result, reply);
            }
            Command::Sync { reply } => {
                let result = self.handle_sync().await;
                self.log_and_reply("sync", result, reply);
            }
            Command::PlaylistChanged {
                playlist_id,
                new_ids,
                reply,
            } => {
                let result = self.handle_playlist_changed(playlist_id, new_ids).await;
                match reply {
                    Some(reply) => self.log_and_reply("playlist-changed", result, reply),
                    None => {
                        if let Err(e) = result {
                            error!(operation = "playlist-changed", error = %e, "lane operation failed");
                        }
                    }
                }
            }
            Command::RestoreQueues { reply } => {
                let result = self.handle_restore_queues().await;
                self.log_and_reply("restore-queues", result, reply);
            }
            Command::GetStatus { reply } => {
                let _ = reply.send(self.status());
            }
            Command::GetUpcoming { reply } => {
                let _ = reply.send(self.upcoming());
            }
            Command::GetHistory { reply } => {
                let _ = reply.send(self.history.snapshot());
            }
        }
    }

    /// Failed operations are logged and surfaced to the caller; the lane
    /// keeps serving subsequent commands.
    fn log_and_reply(
        &self,
        operation: &str,
        result: Result<()>,
        reply: oneshot::Sender<Result<()>>,
    ) {
        if let Err(e) = &result {
            error!(operation, error = %e, "lane operation failed");
        }
        let _ = reply.send(result);
    }
}

async fn run_lane(
    mut state: LaneState,
    mut commands: mpsc::UnboundedReceiver<Command>,
    mut player_events: PlayerEventReceiver,
) -> LaneState {
    let mut events_open = true;
    loop {
        tokio::select! {
            command = commands.recv() => match command {
                Some(command) => state.handle(command).await,
                None => break,
            },
            event = player_events.recv(), if events_open => match event {
                Some(event) => state.handle_player_event(event).await,
                None => events_open = false,
            }
        }
    }
    debug!("controller lane drained");
    state
}

/// Host-facing playback controller handle.
pub struct PlaybackController {
    sender: StdMutex<Option<mpsc::UnboundedSender<Command>>>,
    lane: tokio::sync::Mutex<Option<JoinHandle<LaneState>>>,
    events: ControllerEventBus,
    context: ControllerContext,
}

impl PlaybackController {
    /// Controller driving a fresh local backend.
    pub fn new_local(context: ControllerContext) -> Self {
        let (player_tx, player_rx) = player_event_channel();
        let player = AudioPlayer::Local(LocalPlayer::new(
            Arc::clone(&context.store),
            Arc::clone(&context.provider),
            player_tx,
            context.config.local_max_preload,
            context.config.max_fetch_retries,
        ));
        Self::with_player(context, player, player_rx)
    }

    /// Controller driving an explicit backend (used by tests and by hosts
    /// starting on a remote receiver).
    pub fn with_player(
        context: ControllerContext,
        player: AudioPlayer,
        player_events: PlayerEventReceiver,
    ) -> Self {
        let events = ControllerEventBus::new();
        let mut state = LaneState::new(&context, player, events.clone());
        let (cmd_tx, cmd_rx) = mpsc::unbounded_channel();
        state.cmd_tx = Some(cmd_tx.clone());
        let handle = tokio::spawn(run_lane(state, cmd_rx, player_events));
        Self {
            sender: StdMutex::new(Some(cmd_tx)),
            lane: tokio::sync::Mutex::new(Some(handle)),
            events,
            context,
        }
    }

    pub fn subscribe_events(&self) -> crossbeam_channel::Receiver<ControllerEvent> {
        self.events.subscribe()
    }

    async fn send<R>(&self, build: impl FnOnce(oneshot::Sender<R>) -> Command) -> Result<R> {
        let (tx, rx) = oneshot::channel();
        let sender = self
            .sender
            .lock()
            .unwrap()
            .clone()
            .ok_or(ControlError::LaneClosed)?;
        sender
            .send(build(tx))
            .map_err(|_| ControlError::LaneClosed)?;
        rx.await.map_err(|_| ControlError::LaneClosed)
    }

    async fn send_op(
        &self,
        build: impl FnOnce(oneshot::Sender<Result<()>>) -> Command,
    ) -> Result<()> {
        self.send(build).await?
    }

    // =====================================================================
    //  Public operations
    // =====================================================================

    /// Appends catalog items to the play queue.
    pub async fn queue(&self, entry_ids: Vec<EntryId>) -> Result<()> {
        self.send_op(|reply| Command::Queue {
            entry_ids,
            position: None,
            reply,
        })
        .await
    }

    /// Inserts catalog items at a position in the merged queue view.
    pub async fn queue_at(&self, position: usize, entry_ids: Vec<EntryId>) -> Result<()> {
        self.send_op(|reply| Command::Queue {
            entry_ids,
            position: Some(position),
            reply,
        })
        .await
    }

    pub async fn dequeue(&self, playback_ids: Vec<PlaybackId>) -> Result<()> {
        self.send_op(|reply| Command::Dequeue { playback_ids, reply }).await
    }

    pub async fn move_entry(&self, playback_id: PlaybackId, to_position: usize) -> Result<()> {
        self.send_op(|reply| Command::MoveEntry {
            playback_id,
            to_position,
            reply,
        })
        .await
    }

    pub async fn shuffle_queue(&self) -> Result<()> {
        self.send_op(|reply| Command::ShuffleQueue { reply }).await
    }

    pub async fn sort_queue(&self, key: SortKey) -> Result<()> {
        self.send_op(|reply| Command::SortQueue { key, reply }).await
    }

    pub async fn play(&self) -> Result<()> {
        self.send_op(|reply| Command::Play { reply }).await
    }

    pub async fn pause(&self) -> Result<()> {
        self.send_op(|reply| Command::Pause { reply }).await
    }

    pub async fn stop(&self) -> Result<()> {
        self.send_op(|reply| Command::Stop { reply }).await
    }

    pub async fn seek(&self, position: Duration) -> Result<()> {
        self.send_op(|reply| Command::Seek { position, reply }).await
    }

    pub async fn next(&self) -> Result<()> {
        self.send_op(|reply| Command::Next { reply }).await
    }

    pub async fn previous(&self) -> Result<()> {
        self.send_op(|reply| Command::Previous { reply }).await
    }

    pub async fn select_playlist(
        &self,
        playlist_id: &str,
        start_position: usize,
        order_mode: OrderMode,
        repeat: bool,
    ) -> Result<()> {
        let playlist_id = playlist_id.to_string();
        self.send_op(|reply| Command::SelectPlaylist {
            playlist_id,
            start_position,
            order_mode,
            repeat,
            reply,
        })
        .await
    }

    pub async fn set_order_mode(&self, order_mode: OrderMode) -> Result<()> {
        self.send_op(|reply| Command::SetOrderMode { order_mode, reply })
            .await
    }

    pub async fn set_repeat(&self, repeat: bool) -> Result<()> {
        self.send_op(|reply| Command::SetRepeat { repeat, reply }).await
    }

    /// Recomputes the preload state: buffer verification, backend refill,
    /// end-of-playlist handling.
    pub async fn sync(&self) -> Result<()> {
        self.send_op(|reply| Command::Sync { reply }).await
    }

    /// Applies an external playlist edit (hosts without a push-updated
    /// store subscription call this directly).
    pub async fn playlist_changed(&self, playlist_id: &str, new_ids: Vec<EntryId>) -> Result<()> {
        let playlist_id = playlist_id.to_string();
        self.send_op(|reply| Command::PlaylistChanged {
            playlist_id,
            new_ids,
            reply: Some(reply),
        })
        .await
    }

    /// Reconstructs the controller queues from the durable store. Startup
    /// only.
    pub async fn restore_queues(&self) -> Result<()> {
        self.send_op(|reply| Command::RestoreQueues { reply }).await
    }

    pub async fn status(&self) -> Result<ControllerStatus> {
        self.send(|reply| Command::GetStatus { reply }).await
    }

    pub async fn current_entry(&self) -> Result<Option<PlaybackEntry>> {
        Ok(self.status().await?.current_entry)
    }

    /// Merged upcoming view: backend-preloaded and controller-buffered
    /// entries, queue entries first.
    pub async fn upcoming(&self) -> Result<Vec<PlaybackEntry>> {
        self.send(|reply| Command::GetUpcoming { reply }).await
    }

    pub async fn history(&self) -> Result<Vec<PlaybackEntry>> {
        self.send(|reply| Command::GetHistory { reply }).await
    }

    // =====================================================================
    //  Backend migration
    // =====================================================================

    /// Swaps the audio backend, migrating all in-flight state.
    ///
    /// The lane is drained within the configured bounded wait, the outgoing
    /// backend's state is captured and destroyed, the replacement backend
    /// is built by `factory`, the state is replayed into it, and a fresh
    /// lane resumes. Commands sent while the swap is in progress fail with
    /// `LaneClosed`.
    pub async fn switch_player<F>(&self, factory: F) -> Result<()>
    where
        F: FnOnce(PlayerEventSender) -> AudioPlayer,
    {
        let sender = self
            .sender
            .lock()
            .unwrap()
            .take()
            .ok_or(ControlError::LaneClosed)?;
        drop(sender);

        let mut lane = self.lane.lock().await;
        let mut handle = lane.take().ok_or(ControlError::LaneClosed)?;
        let drained = tokio::time::timeout(self.context.config.lane_drain_timeout, &mut handle).await;
        let mut state = match drained {
            Ok(Ok(state)) => state,
            Ok(Err(e)) => {
                return Err(ControlError::InconsistentState(format!(
                    "lane task failed during migration: {e}"
                )));
            }
            Err(_) => {
                handle.abort();
                return Err(ControlError::MigrationTimeout);
            }
        };

        let was_playing = state.playback_state == PlaybackState::Playing;
        let snapshot = state.player.get_last_state();
        info!(
            preloaded = snapshot.preloaded.len(),
            history = snapshot.history.len(),
            "migrating backend state"
        );
        if let Err(e) = state.player.destroy().await {
            warn!(error = %e, "outgoing backend destroy failed");
        }

        let (player_tx, player_rx) = player_event_channel();
        let replacement = factory(player_tx);
        replacement.restore(snapshot).await?;
        if was_playing {
            replacement.play().await?;
        }
        state.player = replacement;

        let (cmd_tx, cmd_rx) = mpsc::unbounded_channel();
        state.cmd_tx = Some(cmd_tx.clone());
        if let Some(selection) = state.selection.clone() {
            state.spawn_playlist_watcher(selection.playlist_id);
        }
        *lane = Some(tokio::spawn(run_lane(state, cmd_rx, player_rx)));
        *self.sender.lock().unwrap() = Some(cmd_tx);
        Ok(())
    }

    /// Migrates to a fresh local backend.
    pub async fn switch_to_local(&self) -> Result<()> {
        let store = Arc::clone(&self.context.store);
        let provider = Arc::clone(&self.context.provider);
        let config = self.context.config.clone();
        self.switch_player(move |events| {
            AudioPlayer::Local(LocalPlayer::new(
                store,
                provider,
                events,
                config.local_max_preload,
                config.max_fetch_retries,
            ))
        })
        .await
    }

    /// Migrates to a remote receiver backend over the given link.
    pub async fn switch_to_remote(&self, link: Arc<dyn RemoteLink>) -> Result<()> {
        let max_preload = self.context.config.local_max_preload;
        self.switch_player(move |events| {
            AudioPlayer::Remote(RemotePlayer::new(link, events, max_preload))
        })
        .await
    }

    /// Drains the lane and destroys the backend.
    pub async fn shutdown(&self) -> Result<()> {
        let sender = self.sender.lock().unwrap().take();
        drop(sender);
        let mut lane = self.lane.lock().await;
        if let Some(handle) = lane.take() {
            if let Ok(state) = handle.await {
                state.player.destroy().await.ok();
            }
        }
        Ok(())
    }
}
