//! External playlist store collaborator interface.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use futures::stream::BoxStream;
use tokio::sync::broadcast;

use cdzqueue::EntryId;

use crate::error::{ControlError, Result};

/// Push-updated view over externally stored playlists. Implementations are
/// the host's; `MemoryPlaylistStore` backs tests and simple setups.
#[async_trait]
pub trait PlaylistStore: Send + Sync {
    /// Ordered contents of the playlist.
    async fn read(&self, playlist_id: &str) -> Result<Vec<EntryId>>;

    /// Push-updated stream of the playlist contents.
    fn subscribe(&self, playlist_id: &str) -> BoxStream<'static, Vec<EntryId>>;

    async fn insert(&self, playlist_id: &str, position: usize, entries: &[EntryId]) -> Result<()>;

    async fn remove(&self, playlist_id: &str, position: usize) -> Result<()>;

    async fn move_item(&self, playlist_id: &str, from: usize, to: usize) -> Result<()>;
}

/// In-memory playlist store.
pub struct MemoryPlaylistStore {
    playlists: Mutex<HashMap<String, Vec<EntryId>>>,
    updates: broadcast::Sender<(String, Vec<EntryId>)>,
}

impl MemoryPlaylistStore {
    pub fn new() -> Arc<Self> {
        let (updates, _) = broadcast::channel(64);
        Arc::new(Self {
            playlists: Mutex::new(HashMap::new()),
            updates,
        })
    }

    pub fn put(&self, playlist_id: &str, entries: Vec<EntryId>) {
        self.playlists
            .lock()
            .unwrap()
            .insert(playlist_id.to_string(), entries);
        self.publish(playlist_id);
    }

    fn publish(&self, playlist_id: &str) {
        let entries = self
            .playlists
            .lock()
            .unwrap()
            .get(playlist_id)
            .cloned()
            .unwrap_or_default();
        let _ = self.updates.send((playlist_id.to_string(), entries));
    }
}

#[async_trait]
impl PlaylistStore for MemoryPlaylistStore {
    async fn read(&self, playlist_id: &str) -> Result<Vec<EntryId>> {
        Ok(self
            .playlists
            .lock()
            .unwrap()
            .get(playlist_id)
            .cloned()
            .unwrap_or_default())
    }

    fn subscribe(&self, playlist_id: &str) -> BoxStream<'static, Vec<EntryId>> {
        let wanted = playlist_id.to_string();
        let rx = self.updates.subscribe();
        Box::pin(futures::stream::unfold(rx, move |mut rx| {
            let wanted = wanted.clone();
            async move {
                loop {
                    match rx.recv().await {
                        Ok((id, entries)) if id == wanted => return Some((entries, rx)),
                        Ok(_) => continue,
                        Err(broadcast::error::RecvError::Lagged(_)) => continue,
                        Err(broadcast::error::RecvError::Closed) => return None,
                    }
                }
            }
        }))
    }

    async fn insert(&self, playlist_id: &str, position: usize, entries: &[EntryId]) -> Result<()> {
        {
            let mut playlists = self.playlists.lock().unwrap();
            let playlist = playlists.entry(playlist_id.to_string()).or_default();
            let at = position.min(playlist.len());
            for (offset, entry) in entries.iter().enumerate() {
                playlist.insert(at + offset, entry.clone());
            }
        }
        self.publish(playlist_id);
        Ok(())
    }

    async fn remove(&self, playlist_id: &str, position: usize) -> Result<()> {
        {
            let mut playlists = self.playlists.lock().unwrap();
            let playlist = playlists
                .get_mut(playlist_id)
                .ok_or_else(|| ControlError::PlaylistStore(format!("unknown playlist {playlist_id}")))?;
            if position >= playlist.len() {
                return Err(ControlError::PlaylistStore(format!(
                    "position {position} out of range"
                )));
            }
            playlist.remove(position);
        }
        self.publish(playlist_id);
        Ok(())
    }

    async fn move_item(&self, playlist_id: &str, from: usize, to: usize) -> Result<()> {
        {
            let mut playlists = self.playlists.lock().unwrap();
            let playlist = playlists
                .get_mut(playlist_id)
                .ok_or_else(|| ControlError::PlaylistStore(format!("unknown playlist {playlist_id}")))?;
            if from >= playlist.len() || to >= playlist.len() {
                return Err(ControlError::PlaylistStore(format!(
                    "move {from} -> {to} out of range"
                )));
            }
            let entry = playlist.remove(from);
            playlist.insert(to, entry);
        }
        self.publish(playlist_id);
        Ok(())
    }
}
