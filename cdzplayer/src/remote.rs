//! Remote receiver backend.
//!
//! The remote variant proxies a receiver device that manages its own play
//! queue. Cadenza only keeps a mirror of that queue plus the transfer
//! snapshot; the wire protocol lives behind the `RemoteLink` collaborator.
//!
//! Completion callbacks from the remote link are not 100% reliable: a
//! request superseded by another one may never see its callback. Every
//! outgoing request therefore races against `REMOTE_REQUEST_TIMEOUT` and
//! force-fails with `RequestTimeout` when the link stays silent, so that
//! dependent operations never deadlock. This is a documented workaround,
//! not a tuning knob.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use futures::StreamExt;
use futures::stream::BoxStream;
use tracing::{debug, info, warn};

use cdzqueue::{EntryKind, PlaybackEntry, PlaybackId};

use crate::error::{PlayerError, Result};
use crate::events::{PlayerEvent, PlayerEventSender};
use crate::player::AudioPlayerState;

/// Upper bound on the wait for a remote completion callback.
pub const REMOTE_REQUEST_TIMEOUT: Duration = Duration::from_secs(5);

/// Requests understood by the remote receiver.
#[derive(Clone, Debug)]
pub enum RemoteRequest {
    QueueInsert {
        at: usize,
        entries: Vec<PlaybackEntry>,
    },
    QueueRemove {
        playback_ids: Vec<PlaybackId>,
    },
    Play,
    Pause,
    Stop,
    SeekTo(Duration),
    Next,
    Previous,
    Status,
}

/// Completion callback payload for one request.
#[derive(Clone, Debug)]
pub enum RemoteReply {
    Accepted,
    Status(RemoteStatus),
    Rejected { code: u32, message: String },
}

#[derive(Clone, Debug, Default)]
pub struct RemoteStatus {
    pub playing: bool,
    pub position: Duration,
}

/// Unsolicited notifications pushed by the receiver.
#[derive(Clone, Debug)]
pub enum RemoteNotification {
    /// The receiver finished its current item and advanced its own queue.
    TrackFinished,
    PositionChanged(Duration),
    Disconnected,
}

/// Wire transport toward the remote receiver. Implementations are out of
/// scope; the trait only promises a completion callback *may* arrive.
#[async_trait]
pub trait RemoteLink: Send + Sync {
    fn is_connected(&self) -> bool;

    async fn request(&self, request: RemoteRequest) -> Result<RemoteReply>;
}

#[derive(Default)]
struct RemoteMirror {
    /// Mirror of the receiver's queue; the head is the current item once
    /// playback has been engaged.
    order: Vec<PlaybackEntry>,
    engaged: bool,
    playing: bool,
    history: Vec<PlaybackEntry>,
    position: Duration,
    volume: f32,
}

/// Backend proxying a remote receiver's own queue. Cloning yields another
/// handle on the same proxy.
#[derive(Clone)]
pub struct RemotePlayer {
    link: Arc<dyn RemoteLink>,
    mirror: Arc<Mutex<RemoteMirror>>,
    events: PlayerEventSender,
    max_preload: usize,
    destroyed: Arc<AtomicBool>,
}

impl RemotePlayer {
    pub fn new(link: Arc<dyn RemoteLink>, events: PlayerEventSender, max_preload: usize) -> Self {
        Self {
            link,
            mirror: Arc::new(Mutex::new(RemoteMirror {
                volume: 1.0,
                ..RemoteMirror::default()
            })),
            events,
            max_preload,
            destroyed: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Sends one request, racing the missing-callback timeout.
    async fn send(&self, request: RemoteRequest) -> Result<RemoteReply> {
        if self.destroyed.load(Ordering::SeqCst) {
            return Err(PlayerError::Destroyed);
        }
        if !self.link.is_connected() {
            // Fail fast with a descriptive, non-fatal error instead of
            // blocking on a dead link.
            return Err(PlayerError::backend_unavailable(
                "remote receiver is not connected",
            ));
        }
        let label = format!("{request:?}");
        let reply = tokio::time::timeout(REMOTE_REQUEST_TIMEOUT, self.link.request(request))
            .await
            .map_err(|_| {
                warn!(request = %label, "remote completion callback never arrived");
                PlayerError::RequestTimeout(label.clone())
            })??;
        match reply {
            RemoteReply::Rejected { code, message } => {
                Err(PlayerError::RequestRejected { code, message })
            }
            reply => Ok(reply),
        }
    }

    // =====================================================================
    //  Preload / depreload
    // =====================================================================

    pub async fn preload_at(&self, at_offset: usize, entries: Vec<PlaybackEntry>) -> Result<()> {
        if entries.is_empty() {
            return Ok(());
        }
        {
            let mirror = self.mirror.lock().unwrap();
            if mirror.order.len() + entries.len() > self.max_preload {
                return Err(PlayerError::rejected(
                    0,
                    &format!(
                        "preload of {} entries exceeds remote capacity {}",
                        entries.len(),
                        self.max_preload
                    ),
                ));
            }
        }
        let entries: Vec<PlaybackEntry> =
            entries.into_iter().map(|e| e.with_preloaded(true)).collect();
        self.send(RemoteRequest::QueueInsert {
            at: at_offset,
            entries: entries.clone(),
        })
        .await?;
        let mut mirror = self.mirror.lock().unwrap();
        let at = at_offset.min(mirror.order.len());
        for (offset, entry) in entries.into_iter().enumerate() {
            mirror.order.insert(at + offset, entry);
        }
        debug!(preloaded = mirror.order.len(), "remote queue updated");
        Ok(())
    }

    pub async fn depreload(&self, entries: &[PlaybackEntry]) -> Result<Vec<PlaybackEntry>> {
        let ids: Vec<PlaybackId> = entries.iter().map(|e| e.playback_id).collect();
        self.send(RemoteRequest::QueueRemove {
            playback_ids: ids.clone(),
        })
        .await?;
        let mut mirror = self.mirror.lock().unwrap();
        let mut removed = Vec::new();
        for id in ids {
            if let Some(position) = mirror.order.iter().position(|e| e.playback_id == id) {
                removed.push(mirror.order.remove(position).with_preloaded(false));
            }
        }
        Ok(removed)
    }

    // =====================================================================
    //  Transport
    // =====================================================================

    pub async fn play(&self) -> Result<()> {
        {
            let mirror = self.mirror.lock().unwrap();
            if mirror.order.is_empty() {
                return Err(PlayerError::backend_unavailable("remote queue is empty"));
            }
        }
        self.send(RemoteRequest::Play).await?;
        let started = {
            let mut mirror = self.mirror.lock().unwrap();
            let newly_engaged = !mirror.engaged || !mirror.playing;
            mirror.engaged = true;
            mirror.playing = true;
            newly_engaged.then(|| mirror.order.first().cloned()).flatten()
        };
        if let Some(entry) = started {
            let _ = self.events.send(PlayerEvent::EntryStarted(entry));
        }
        Ok(())
    }

    pub async fn pause(&self) -> Result<()> {
        self.send(RemoteRequest::Pause).await?;
        self.mirror.lock().unwrap().playing = false;
        Ok(())
    }

    pub async fn stop(&self) -> Result<()> {
        self.send(RemoteRequest::Stop).await?;
        let mut mirror = self.mirror.lock().unwrap();
        mirror.playing = false;
        mirror.engaged = false;
        Ok(())
    }

    pub async fn seek(&self, position: Duration) -> Result<()> {
        self.send(RemoteRequest::SeekTo(position)).await?;
        self.mirror.lock().unwrap().position = position;
        Ok(())
    }

    pub async fn next(&self) -> Result<()> {
        self.send(RemoteRequest::Next).await?;
        let mut mirror = self.mirror.lock().unwrap();
        if !mirror.order.is_empty() {
            let finished = mirror.order.remove(0);
            mirror.history.push(finished);
            mirror.position = Duration::ZERO;
        }
        Ok(())
    }

    pub async fn previous(&self) -> Result<()> {
        self.send(RemoteRequest::Previous).await?;
        let mut mirror = self.mirror.lock().unwrap();
        if let Some(entry) = mirror.history.pop() {
            mirror.order.insert(0, entry);
        }
        mirror.position = Duration::ZERO;
        Ok(())
    }

    // =====================================================================
    //  Notifications
    // =====================================================================

    /// Applies one unsolicited receiver notification to the mirror.
    pub fn handle_notification(&self, notification: RemoteNotification) {
        apply_notification(&self.mirror, &self.events, notification);
    }

    /// Pumps a notification stream into the mirror until it ends.
    pub fn attach_notifications(&self, stream: BoxStream<'static, RemoteNotification>) {
        let mirror = Arc::clone(&self.mirror);
        let events = self.events.clone();
        tokio::spawn(async move {
            let mut stream = stream;
            while let Some(notification) = stream.next().await {
                apply_notification(&mirror, &events, notification);
            }
        });
    }

    // =====================================================================
    //  Introspection
    // =====================================================================

    pub fn get_current_entry(&self) -> Option<PlaybackEntry> {
        let mirror = self.mirror.lock().unwrap();
        if mirror.engaged {
            mirror.order.first().cloned()
        } else {
            None
        }
    }

    pub fn get_queue_entries(&self, max: usize) -> Vec<PlaybackEntry> {
        let mirror = self.mirror.lock().unwrap();
        mirror
            .order
            .iter()
            .filter(|e| e.kind == EntryKind::Queue)
            .take(max)
            .cloned()
            .collect()
    }

    pub fn get_playlist_entries(&self, max: usize) -> Vec<PlaybackEntry> {
        let mirror = self.mirror.lock().unwrap();
        mirror
            .order
            .iter()
            .filter(|e| e.is_playlist())
            .take(max)
            .cloned()
            .collect()
    }

    pub fn get_num_preloaded(&self) -> usize {
        self.mirror.lock().unwrap().order.len()
    }

    pub fn get_max_to_preload(&self) -> usize {
        self.max_preload
    }

    pub fn get_history(&self) -> Vec<PlaybackEntry> {
        self.mirror.lock().unwrap().history.clone()
    }

    pub fn is_playing(&self) -> bool {
        self.mirror.lock().unwrap().playing
    }

    pub fn volume(&self) -> f32 {
        self.mirror.lock().unwrap().volume
    }

    pub fn set_volume(&self, volume: f32) {
        self.mirror.lock().unwrap().volume = volume.clamp(0.0, 1.0);
    }

    pub fn get_last_state(&self) -> AudioPlayerState {
        let mirror = self.mirror.lock().unwrap();
        let current_entry = if mirror.engaged {
            mirror.order.first().cloned()
        } else {
            None
        };
        let preloaded = mirror
            .order
            .iter()
            .skip(if mirror.engaged { 1 } else { 0 })
            .cloned()
            .collect();
        AudioPlayerState {
            current_entry,
            history: mirror.history.clone(),
            preloaded,
            position: mirror.position,
        }
    }

    pub async fn restore(&self, snapshot: AudioPlayerState) -> Result<()> {
        {
            let mut mirror = self.mirror.lock().unwrap();
            mirror.history = snapshot.history.clone();
            mirror.position = snapshot.position;
        }
        let mut entries = Vec::new();
        entries.extend(snapshot.current_entry.clone());
        entries.extend(snapshot.preloaded);
        if entries.is_empty() {
            return Ok(());
        }
        self.preload_at(0, entries).await?;
        if snapshot.current_entry.is_some() {
            self.mirror.lock().unwrap().engaged = true;
            if !snapshot.position.is_zero() {
                self.seek(snapshot.position).await?;
            }
        }
        Ok(())
    }

    pub async fn destroy(&self) -> Result<()> {
        if self.destroyed.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        // Best effort: the receiver may already be gone.
        if self.link.is_connected() {
            let _ = tokio::time::timeout(
                REMOTE_REQUEST_TIMEOUT,
                self.link.request(RemoteRequest::Stop),
            )
            .await;
        }
        info!("remote player destroyed");
        Ok(())
    }
}

fn apply_notification(
    mirror: &Mutex<RemoteMirror>,
    events: &PlayerEventSender,
    notification: RemoteNotification,
) {
    match notification {
        RemoteNotification::TrackFinished => {
            let (finished, started) = {
                let mut mirror = mirror.lock().unwrap();
                if mirror.order.is_empty() {
                    (None, None)
                } else {
                    let finished = mirror.order.remove(0);
                    mirror.history.push(finished.clone());
                    mirror.position = Duration::ZERO;
                    let started = if mirror.playing {
                        mirror.order.first().cloned()
                    } else {
                        None
                    };
                    if mirror.order.is_empty() {
                        mirror.playing = false;
                        mirror.engaged = false;
                    }
                    (Some(finished), started)
                }
            };
            if let Some(finished) = finished {
                let _ = events.send(PlayerEvent::EntryCompleted(finished));
            }
            if let Some(started) = started {
                let _ = events.send(PlayerEvent::EntryStarted(started));
            }
        }
        RemoteNotification::PositionChanged(position) => {
            mirror.lock().unwrap().position = position;
        }
        RemoteNotification::Disconnected => {
            warn!("remote receiver disconnected");
            let _ = events.send(PlayerEvent::RemoteDisconnected);
        }
    }
}
