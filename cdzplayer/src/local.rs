//! Local multi-instance audio backend.
//!
//! `LocalPlayer` manages an arena of `PlayerUnit`s (the "current" and "next"
//! roles rotate, so units are addressed by `UnitHandle`), keeps the
//! preloaded entries mirrored into a crash-resume queue pair backed by the
//! durable store, and arms gapless hand-off between consecutive units.
//!
//! Rules enforced here:
//!   - the preloaded set never exceeds `max_to_preload`,
//!   - queue-kind mirror rows and playlist-kind mirror rows are kept in
//!     play order at all times,
//!   - pending play requests are satisfied as soon as the target unit
//!     reaches `Prepared`.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use futures::StreamExt;
use tracing::{debug, info, warn};

use cdzqueue::{EntryId, EntryKind, EntryQueue, PlaybackEntry, PlaybackId, QueueId, QueueStore};

use crate::error::{PlayerError, Result};
use crate::events::{PlayerEvent, PlayerEventSender};
use crate::player::AudioPlayerState;
use crate::provider::AudioDataProvider;
use crate::unit::{FetchDisposition, PlayOutcome, PlayerUnit, UnitErrorKind, UnitHandle, UnitState};

struct LocalState {
    /// Unit arena; a `None` slot is free for reuse.
    units: Vec<Option<PlayerUnit>>,
    /// Preloaded entries in play order; the head is the current entry once
    /// playback has been engaged.
    order: Vec<UnitHandle>,
    current: Option<UnitHandle>,
    /// Transport intent: true between play() and pause()/stop().
    playing: bool,
    /// A play was requested while the target unit was not ready.
    pending_play: bool,
    history: Vec<PlaybackEntry>,
    last_position: Duration,
    volume: f32,
}

impl LocalState {
    fn unit(&self, handle: UnitHandle) -> Result<&PlayerUnit> {
        self.units
            .get(handle.0)
            .and_then(|slot| slot.as_ref())
            .ok_or(PlayerError::UnknownUnit(handle.0))
    }

    fn unit_mut(&mut self, handle: UnitHandle) -> Result<&mut PlayerUnit> {
        self.units
            .get_mut(handle.0)
            .and_then(|slot| slot.as_mut())
            .ok_or(PlayerError::UnknownUnit(handle.0))
    }

    fn allocate(&mut self, unit: PlayerUnit) -> UnitHandle {
        if let Some(free) = self.units.iter().position(|slot| slot.is_none()) {
            self.units[free] = Some(unit);
            UnitHandle(free)
        } else {
            self.units.push(Some(unit));
            UnitHandle(self.units.len() - 1)
        }
    }

    fn release_slot(&mut self, handle: UnitHandle) {
        if let Some(slot) = self.units.get_mut(handle.0) {
            if let Some(unit) = slot.as_mut() {
                unit.release();
            }
            *slot = None;
        }
        self.order.retain(|h| *h != handle);
        if self.current == Some(handle) {
            self.current = None;
        }
    }

    fn handle_of(&self, playback_id: PlaybackId) -> Option<UnitHandle> {
        self.order.iter().copied().find(|h| {
            self.unit(*h)
                .map(|u| u.entry().playback_id == playback_id)
                .unwrap_or(false)
        })
    }

    fn entries_in_order(&self) -> Vec<PlaybackEntry> {
        self.order
            .iter()
            .filter_map(|h| self.unit(*h).ok().map(|u| u.entry().clone()))
            .collect()
    }

    /// Splits the preloaded set into (queue rows, playlist rows), in order.
    fn mirror_split(&self) -> (Vec<PlaybackEntry>, Vec<PlaybackEntry>) {
        let mut queue_rows = Vec::new();
        let mut playlist_rows = Vec::new();
        for entry in self.entries_in_order() {
            if entry.is_playlist() {
                playlist_rows.push(entry);
            } else {
                queue_rows.push(entry);
            }
        }
        (queue_rows, playlist_rows)
    }

    /// Recomputes the gapless arm of the current unit toward its successor.
    fn rearm_gapless(&mut self) {
        let Some(current) = self.current else { return };
        let position = match self.order.iter().position(|h| *h == current) {
            Some(p) => p,
            None => return,
        };
        let successor = self.order.get(position + 1).copied();
        let ready = successor
            .and_then(|h| self.unit(h).ok())
            .map(|u| u.state().is_at_least_prepared())
            .unwrap_or(false);
        match successor {
            Some(next) => {
                if let Ok(unit) = self.unit_mut(current) {
                    unit.set_next(next, ready);
                }
            }
            None => {
                if let Ok(unit) = self.unit_mut(current) {
                    unit.clear_next();
                }
            }
        }
    }
}

#[derive(Clone)]
struct Shared {
    state: Arc<Mutex<LocalState>>,
    mirror_queue: EntryQueue,
    mirror_playlist: EntryQueue,
    provider: Arc<dyn AudioDataProvider>,
    events: PlayerEventSender,
    max_fetch_retries: u32,
}

impl Shared {
    fn lock(&self) -> MutexGuard<'_, LocalState> {
        self.state.lock().unwrap()
    }

    /// Mirrors the preloaded set to the crash-resume queues. Called after
    /// the state lock is dropped; a mirror failure is a store problem, not a
    /// playback problem.
    fn sync_mirrors(&self, queue_rows: Vec<PlaybackEntry>, playlist_rows: Vec<PlaybackEntry>) {
        let _ = self.mirror_queue.replace_with(queue_rows);
        let _ = self.mirror_playlist.replace_with(playlist_rows);
    }

    fn emit(&self, event: PlayerEvent) {
        let _ = self.events.send(event);
    }
}

/// The local audio backend: several decode/render units, gapless chaining,
/// durable crash-resume mirrors.
///
/// Cloning yields another handle on the same backend; the host's render
/// layer keeps one to signal track completions.
#[derive(Clone)]
pub struct LocalPlayer {
    shared: Shared,
    max_preload: usize,
    destroyed: Arc<AtomicBool>,
}

impl LocalPlayer {
    pub fn new(
        store: Arc<dyn QueueStore>,
        provider: Arc<dyn AudioDataProvider>,
        events: PlayerEventSender,
        max_preload: usize,
        max_fetch_retries: u32,
    ) -> Self {
        let shared = Shared {
            state: Arc::new(Mutex::new(LocalState {
                units: Vec::new(),
                order: Vec::new(),
                current: None,
                playing: false,
                pending_play: false,
                history: Vec::new(),
                last_position: Duration::ZERO,
                volume: 1.0,
            })),
            mirror_queue: EntryQueue::new(QueueId::player_queue(), Arc::clone(&store)),
            mirror_playlist: EntryQueue::new(QueueId::player_playlist(), store),
            provider,
            events,
            max_fetch_retries,
        };
        Self {
            shared,
            max_preload,
            destroyed: Arc::new(AtomicBool::new(false)),
        }
    }

    fn check_alive(&self) -> Result<()> {
        if self.destroyed.load(Ordering::SeqCst) {
            return Err(PlayerError::Destroyed);
        }
        Ok(())
    }

    /// Rebuilds the preloaded set from the crash-resume mirrors. Startup
    /// only, before any other operation.
    pub async fn resume_from_store(&self) -> Result<()> {
        self.check_alive()?;
        self.shared.mirror_queue.restore().await?;
        self.shared.mirror_playlist.restore().await?;
        let mut rows = self.shared.mirror_queue.snapshot();
        rows.extend(self.shared.mirror_playlist.snapshot());
        if rows.is_empty() {
            return Ok(());
        }
        info!(entries = rows.len(), "resuming preloaded entries from store");
        self.preload_at(0, rows).await
    }

    // =====================================================================
    //  Preload / depreload
    // =====================================================================

    /// Hands `entries` to the backend, primed for playback, inserted at
    /// `at_offset` in the preloaded play order.
    pub async fn preload_at(&self, at_offset: usize, entries: Vec<PlaybackEntry>) -> Result<()> {
        self.check_alive()?;
        if entries.is_empty() {
            return Ok(());
        }
        let fetches;
        let mirrors;
        {
            let mut state = self.shared.lock();
            if state.order.len() + entries.len() > self.max_preload {
                return Err(PlayerError::rejected(
                    0,
                    &format!(
                        "preload of {} entries exceeds capacity {} ({} already preloaded)",
                        entries.len(),
                        self.max_preload,
                        state.order.len()
                    ),
                ));
            }
            let mut started = Vec::with_capacity(entries.len());
            let at = at_offset.min(state.order.len());
            for (offset, entry) in entries.into_iter().enumerate() {
                let entry = entry.with_preloaded(true);
                let entry_id = entry.entry_id.clone();
                let mut unit = PlayerUnit::new(entry);
                unit.begin_preload()?;
                let handle = state.allocate(unit);
                state.order.insert(at + offset, handle);
                started.push((handle, entry_id));
            }
            state.rearm_gapless();
            fetches = started;
            mirrors = state.mirror_split();
        }
        self.shared.sync_mirrors(mirrors.0, mirrors.1);
        for (handle, entry_id) in fetches {
            spawn_fetch(self.shared.clone(), handle, entry_id);
        }
        Ok(())
    }

    /// Withdraws previously preloaded entries, releasing their units.
    /// Returns the withdrawn entries with `preloaded` cleared, in the order
    /// they were requested.
    pub async fn depreload(&self, entries: &[PlaybackEntry]) -> Result<Vec<PlaybackEntry>> {
        self.check_alive()?;
        let removed;
        let mirrors;
        {
            let mut state = self.shared.lock();
            let mut out = Vec::new();
            for entry in entries {
                let Some(handle) = state.handle_of(entry.playback_id) else {
                    warn!(entry = %entry.playback_id, "depreload of unknown entry ignored");
                    continue;
                };
                let stored = state.unit(handle)?.entry().clone().with_preloaded(false);
                state.release_slot(handle);
                out.push(stored);
            }
            state.rearm_gapless();
            removed = out;
            mirrors = state.mirror_split();
        }
        self.shared.sync_mirrors(mirrors.0, mirrors.1);
        debug!(removed = removed.len(), "depreloaded entries");
        Ok(removed)
    }

    // =====================================================================
    //  Transport
    // =====================================================================

    pub async fn play(&self) -> Result<()> {
        self.check_alive()?;
        let event;
        {
            let mut state = self.shared.lock();
            let current = match state.current.or_else(|| state.order.first().copied()) {
                Some(handle) => handle,
                None => {
                    return Err(PlayerError::backend_unavailable(
                        "nothing preloaded to play",
                    ));
                }
            };
            state.current = Some(current);
            state.playing = true;
            let was_started = state.unit(current)?.state() == UnitState::Started;
            let outcome = state.unit_mut(current)?.play()?;
            event = match outcome {
                PlayOutcome::Started => {
                    state.pending_play = false;
                    if was_started {
                        None
                    } else {
                        Some(PlayerEvent::EntryStarted(
                            state.unit(current)?.entry().clone(),
                        ))
                    }
                }
                PlayOutcome::PrepareStarted => {
                    // Data is already primed locally; the prepare completes
                    // synchronously and playback starts right away.
                    let unit = state.unit_mut(current)?;
                    unit.begin_prepare()?;
                    unit.on_prepared()?;
                    unit.play()?;
                    state.pending_play = false;
                    Some(PlayerEvent::EntryStarted(
                        state.unit(current)?.entry().clone(),
                    ))
                }
                PlayOutcome::PreloadStarted | PlayOutcome::NotReady => {
                    state.pending_play = true;
                    Some(PlayerEvent::BufferingChanged { buffering: true })
                }
            };
            state.rearm_gapless();
        }
        if let Some(event) = event {
            self.shared.emit(event);
        }
        Ok(())
    }

    pub async fn pause(&self) -> Result<()> {
        self.check_alive()?;
        let mut state = self.shared.lock();
        let current = state
            .current
            .ok_or_else(|| PlayerError::backend_unavailable("nothing playing"))?;
        state.unit_mut(current)?.pause()?;
        state.playing = false;
        state.pending_play = false;
        Ok(())
    }

    pub async fn stop(&self) -> Result<()> {
        self.check_alive()?;
        let mut state = self.shared.lock();
        if let Some(current) = state.current {
            state.unit_mut(current)?.stop()?;
        }
        state.playing = false;
        state.pending_play = false;
        Ok(())
    }

    pub async fn seek(&self, position: Duration) -> Result<()> {
        self.check_alive()?;
        let mut state = self.shared.lock();
        let current = state
            .current
            .or_else(|| state.order.first().copied())
            .ok_or_else(|| PlayerError::backend_unavailable("nothing to seek in"))?;
        state.current = Some(current);
        let applied = state.unit_mut(current)?.seek(position);
        state.last_position = position;
        debug!(?position, applied, "seek");
        Ok(())
    }

    /// Skips to the next preloaded entry. The skipped entry moves into the
    /// backend history.
    pub async fn next(&self) -> Result<()> {
        self.check_alive()?;
        let pending;
        let mirrors;
        {
            let mut state = self.shared.lock();
            let current = state
                .current
                .or_else(|| state.order.first().copied())
                .ok_or_else(|| PlayerError::backend_unavailable("nothing to skip"))?;
            let entry = state.unit(current)?.entry().clone();
            state.release_slot(current);
            state.history.push(entry);
            state.current = state.order.first().copied();
            state.last_position = Duration::ZERO;
            pending = state.playing && state.current.is_some();
            state.pending_play = false;
            state.rearm_gapless();
            mirrors = state.mirror_split();
        }
        self.shared.sync_mirrors(mirrors.0, mirrors.1);
        if pending {
            self.play().await?;
        }
        Ok(())
    }

    /// Returns to the most recent history entry; with an empty history the
    /// current entry restarts from zero.
    pub async fn previous(&self) -> Result<()> {
        self.check_alive()?;
        // Compute the reinsertion plan while holding the lock, then release
        // the guard before any `.await` so the future stays `Send`. A `None`
        // plan means there is no history and we restart the current entry.
        let plan = {
            let mut state = self.shared.lock();
            match state.history.pop() {
                None => None,
                Some(entry) => {
                    if state.order.len() >= self.max_preload {
                        // Make room at the tail before reinserting at the head.
                        if let Some(tail) = state.order.last().copied() {
                            state.release_slot(tail);
                        }
                    }
                    let entry_id = entry.entry_id.clone();
                    let mut unit = PlayerUnit::new(entry.with_preloaded(true));
                    unit.begin_preload()?;
                    let handle = state.allocate(unit);
                    state.order.insert(0, handle);
                    state.current = Some(handle);
                    state.last_position = Duration::ZERO;
                    state.pending_play = state.playing;
                    state.rearm_gapless();
                    Some(((handle, entry_id), state.mirror_split()))
                }
            }
        };
        let Some((fetch, mirrors)) = plan else {
            return self.seek(Duration::ZERO).await;
        };
        self.shared.sync_mirrors(mirrors.0, mirrors.1);
        spawn_fetch(self.shared.clone(), fetch.0, fetch.1);
        Ok(())
    }

    /// Signal from the render layer that the current track finished.
    /// Performs the gapless hand-off when a next unit is armed.
    pub fn on_track_complete(&self) -> Result<()> {
        self.check_alive()?;
        let mut events = Vec::new();
        let mirrors;
        {
            let mut state = self.shared.lock();
            let current = state
                .current
                .ok_or_else(|| PlayerError::backend_unavailable("no current entry"))?;
            state.unit_mut(current)?.on_playback_complete()?;
            let finished = state.unit(current)?.entry().clone();
            let armed = state.unit(current)?.armed_next();
            state.release_slot(current);
            state.history.push(finished.clone());
            state.last_position = Duration::ZERO;

            let next = armed.filter(|h| state.order.contains(h));
            match next.or_else(|| state.order.first().copied()) {
                Some(handle) if state.playing => {
                    state.current = Some(handle);
                    let unit = state.unit_mut(handle)?;
                    if unit.state().is_at_least_prepared() {
                        unit.play()?;
                        events.push(PlayerEvent::EntryStarted(unit.entry().clone()));
                    } else {
                        state.pending_play = true;
                        events.push(PlayerEvent::BufferingChanged { buffering: true });
                    }
                }
                Some(handle) => {
                    state.current = Some(handle);
                }
                None => {
                    state.current = None;
                    state.playing = false;
                }
            }
            state.rearm_gapless();
            events.push(PlayerEvent::EntryCompleted(finished));
            mirrors = state.mirror_split();
        }
        self.shared.sync_mirrors(mirrors.0, mirrors.1);
        for event in events {
            self.shared.emit(event);
        }
        Ok(())
    }

    // =====================================================================
    //  Introspection
    // =====================================================================

    pub fn get_current_entry(&self) -> Option<PlaybackEntry> {
        let state = self.shared.lock();
        state
            .current
            .and_then(|h| state.unit(h).ok())
            .map(|u| u.entry().clone())
    }

    pub fn get_queue_entries(&self, max: usize) -> Vec<PlaybackEntry> {
        let state = self.shared.lock();
        state
            .entries_in_order()
            .into_iter()
            .filter(|e| e.kind == EntryKind::Queue)
            .take(max)
            .collect()
    }

    pub fn get_playlist_entries(&self, max: usize) -> Vec<PlaybackEntry> {
        let state = self.shared.lock();
        state
            .entries_in_order()
            .into_iter()
            .filter(|e| e.is_playlist())
            .take(max)
            .collect()
    }

    pub fn get_num_preloaded(&self) -> usize {
        self.shared.lock().order.len()
    }

    pub fn get_max_to_preload(&self) -> usize {
        self.max_preload
    }

    pub fn get_history(&self) -> Vec<PlaybackEntry> {
        self.shared.lock().history.clone()
    }

    pub fn is_playing(&self) -> bool {
        self.shared.lock().playing
    }

    pub fn volume(&self) -> f32 {
        self.shared.lock().volume
    }

    pub fn set_volume(&self, volume: f32) {
        self.shared.lock().volume = volume.clamp(0.0, 1.0);
    }

    /// Transfer snapshot for backend migration.
    pub fn get_last_state(&self) -> AudioPlayerState {
        let state = self.shared.lock();
        let current_entry = state
            .current
            .and_then(|h| state.unit(h).ok())
            .map(|u| u.entry().clone());
        let position = state
            .current
            .and_then(|h| state.unit(h).ok())
            .map(|u| u.position())
            .unwrap_or(state.last_position);
        let preloaded = state
            .entries_in_order()
            .into_iter()
            .filter(|e| Some(&e.playback_id) != current_entry.as_ref().map(|c| &c.playback_id))
            .collect();
        AudioPlayerState {
            current_entry,
            history: state.history.clone(),
            preloaded,
            position,
        }
    }

    /// Replays a transfer snapshot captured from another backend.
    pub async fn restore(&self, snapshot: AudioPlayerState) -> Result<()> {
        self.check_alive()?;
        {
            let mut state = self.shared.lock();
            state.history = snapshot.history.clone();
            state.last_position = snapshot.position;
        }
        let mut entries = Vec::new();
        entries.extend(snapshot.current_entry.clone());
        entries.extend(snapshot.preloaded);
        if entries.is_empty() {
            return Ok(());
        }
        self.preload_at(0, entries).await?;
        {
            let mut state = self.shared.lock();
            state.current = state.order.first().copied();
        }
        if snapshot.current_entry.is_some() && !snapshot.position.is_zero() {
            self.seek(snapshot.position).await?;
        }
        Ok(())
    }

    /// Releases every unit and clears the crash-resume mirrors. The player
    /// fails fast on every subsequent call.
    pub async fn destroy(&self) -> Result<()> {
        if self.destroyed.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        {
            let mut state = self.shared.lock();
            let handles: Vec<UnitHandle> = state.order.clone();
            for handle in handles {
                state.release_slot(handle);
            }
            state.current = None;
            state.playing = false;
            state.pending_play = false;
        }
        let _ = self.shared.mirror_queue.clear();
        let _ = self.shared.mirror_playlist.clear();
        info!("local player destroyed");
        Ok(())
    }
}

/// Drives the asynchronous data fetch of one unit, with bounded retry, and
/// advances the unit to `Prepared` on success.
fn spawn_fetch(shared: Shared, handle: UnitHandle, entry_id: EntryId) {
    tokio::spawn(async move {
        loop {
            match shared.provider.fetch(&entry_id).await {
                Ok(mut stream) => {
                    while stream.next().await.is_some() {}
                    break;
                }
                Err(e) => {
                    let disposition;
                    let entry;
                    {
                        let mut state = shared.lock();
                        let Ok(unit) = state.unit_mut(handle) else {
                            return; // depreloaded meanwhile
                        };
                        disposition = unit.on_fetch_failed(shared.max_fetch_retries);
                        entry = unit.entry().clone();
                        unit.record_error(UnitErrorKind::DataFetch, &e.to_string());
                    }
                    match disposition {
                        FetchDisposition::Retry => continue,
                        FetchDisposition::GiveUp => {
                            let attempts = {
                                let state = shared.lock();
                                state
                                    .unit(handle)
                                    .map(|u| u.fetch_attempts())
                                    .unwrap_or_default()
                            };
                            shared.emit(PlayerEvent::UnitError {
                                entry,
                                kind: UnitErrorKind::DataFetch,
                                message: format!("giving up after {attempts} attempts: {e}"),
                                terminal: true,
                            });
                            return;
                        }
                    }
                }
            }
        }

        // Fetch succeeded: initialize, prepare, honor a pending play.
        let mut events = Vec::new();
        {
            let mut state = shared.lock();
            let Ok(unit) = state.unit_mut(handle) else {
                return; // depreloaded meanwhile
            };
            if unit.state() != UnitState::Idle {
                return;
            }
            if unit.on_data_ready().is_err() {
                return;
            }
            if let Err(e) = unit.on_prepared() {
                warn!(error = %e, "prepare completion failed");
                return;
            }
            state.rearm_gapless();
            if state.pending_play && state.current == Some(handle) {
                state.pending_play = false;
                if let Ok(unit) = state.unit_mut(handle) {
                    if unit.play().is_ok() {
                        events.push(PlayerEvent::BufferingChanged { buffering: false });
                        events.push(PlayerEvent::EntryStarted(unit.entry().clone()));
                    }
                }
            }
        }
        for event in events {
            shared.emit(event);
        }
    });
}
