//! Durable queue store collaborator interface.
//!
//! At runtime the in-memory queues are the source of truth; the store is a
//! write-behind cache of them. Implementations live in the host application
//! (SQLite, flat files, …). `MemoryQueueStore` here backs the tests and
//! simple hosts.

use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use futures::stream::BoxStream;
use tokio::sync::broadcast;

use crate::entry::{PlaybackEntry, PlaybackId};
use crate::error::{Error, Result};

/// Stable external identity of one ordered queue.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct QueueId(pub String);

impl QueueId {
    /// Internal user queue.
    pub fn queue() -> Self {
        QueueId("queue".into())
    }

    /// Controller-side buffered view of the active playlist.
    pub fn playlist_buffer() -> Self {
        QueueId("playlist-buffer".into())
    }

    /// Playback-order view of the active playlist selection (preloaded and
    /// buffered entries together).
    pub fn playlist_playback() -> Self {
        QueueId("playlist-playback".into())
    }

    /// Play history.
    pub fn history() -> Self {
        QueueId("history".into())
    }

    /// Local player mirror of its preloaded queue entries (crash resume).
    pub fn player_queue() -> Self {
        QueueId("player-queue".into())
    }

    /// Local player mirror of its preloaded playlist entries (crash resume).
    pub fn player_playlist() -> Self {
        QueueId("player-playlist".into())
    }
}

impl fmt::Display for QueueId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Persistence collaborator for ordered entry queues.
///
/// Every mutator mirrors an already-applied in-memory change; a failure here
/// must not be interpreted as a failed queue operation.
#[async_trait]
pub trait QueueStore: Send + Sync {
    /// Inserts `entries` at `position` in the stored queue.
    async fn insert(
        &self,
        queue_id: &QueueId,
        position: usize,
        entries: &[PlaybackEntry],
    ) -> Result<()>;

    /// Removes the rows matching the given playback ids.
    async fn remove(&self, queue_id: &QueueId, playback_ids: &[PlaybackId]) -> Result<()>;

    /// Removes every row of the queue.
    async fn remove_all(&self, queue_id: &QueueId) -> Result<()>;

    /// Replaces the whole stored queue.
    async fn replace(&self, queue_id: &QueueId, entries: &[PlaybackEntry]) -> Result<()>;

    /// Reads the stored queue in order. Used once at startup to reconstruct
    /// the in-memory state.
    async fn load(&self, queue_id: &QueueId) -> Result<Vec<PlaybackEntry>>;

    /// Push-updated stream of the stored queue contents.
    fn subscribe(&self, queue_id: &QueueId) -> BoxStream<'static, Vec<PlaybackEntry>>;
}

/// In-memory `QueueStore` for tests and hosts without persistence.
pub struct MemoryQueueStore {
    queues: Mutex<HashMap<QueueId, Vec<PlaybackEntry>>>,
    updates: broadcast::Sender<(QueueId, Vec<PlaybackEntry>)>,
    fail_writes: AtomicBool,
}

impl MemoryQueueStore {
    pub fn new() -> Arc<Self> {
        let (updates, _) = broadcast::channel(64);
        Arc::new(Self {
            queues: Mutex::new(HashMap::new()),
            updates,
            fail_writes: AtomicBool::new(false),
        })
    }

    /// Makes every subsequent write fail. Lets tests exercise the
    /// eventual-consistency contract of `EntryQueue`.
    pub fn set_fail_writes(&self, fail: bool) {
        self.fail_writes.store(fail, Ordering::SeqCst);
    }

    /// Direct view of the stored rows, bypassing the queue layer.
    pub fn stored(&self, queue_id: &QueueId) -> Vec<PlaybackEntry> {
        self.queues
            .lock()
            .unwrap()
            .get(queue_id)
            .cloned()
            .unwrap_or_default()
    }

    fn check_writable(&self, queue_id: &QueueId) -> Result<()> {
        if self.fail_writes.load(Ordering::SeqCst) {
            return Err(Error::StorageWriteFailed(
                queue_id.to_string(),
                "memory store configured to fail".into(),
            ));
        }
        Ok(())
    }

    fn publish(&self, queue_id: &QueueId) {
        let entries = self.stored(queue_id);
        let _ = self.updates.send((queue_id.clone(), entries));
    }
}

#[async_trait]
impl QueueStore for MemoryQueueStore {
    async fn insert(
        &self,
        queue_id: &QueueId,
        position: usize,
        entries: &[PlaybackEntry],
    ) -> Result<()> {
        self.check_writable(queue_id)?;
        {
            let mut queues = self.queues.lock().unwrap();
            let queue = queues.entry(queue_id.clone()).or_default();
            let at = position.min(queue.len());
            for (offset, entry) in entries.iter().enumerate() {
                queue.insert(at + offset, entry.clone());
            }
        }
        self.publish(queue_id);
        Ok(())
    }

    async fn remove(&self, queue_id: &QueueId, playback_ids: &[PlaybackId]) -> Result<()> {
        self.check_writable(queue_id)?;
        {
            let mut queues = self.queues.lock().unwrap();
            if let Some(queue) = queues.get_mut(queue_id) {
                queue.retain(|entry| !playback_ids.contains(&entry.playback_id));
            }
        }
        self.publish(queue_id);
        Ok(())
    }

    async fn remove_all(&self, queue_id: &QueueId) -> Result<()> {
        self.check_writable(queue_id)?;
        self.queues.lock().unwrap().remove(queue_id);
        self.publish(queue_id);
        Ok(())
    }

    async fn replace(&self, queue_id: &QueueId, entries: &[PlaybackEntry]) -> Result<()> {
        self.check_writable(queue_id)?;
        self.queues
            .lock()
            .unwrap()
            .insert(queue_id.clone(), entries.to_vec());
        self.publish(queue_id);
        Ok(())
    }

    async fn load(&self, queue_id: &QueueId) -> Result<Vec<PlaybackEntry>> {
        Ok(self.stored(queue_id))
    }

    fn subscribe(&self, queue_id: &QueueId) -> BoxStream<'static, Vec<PlaybackEntry>> {
        let wanted = queue_id.clone();
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
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::entry::EntryId;

    fn entry(id: &str, playback_id: u64) -> PlaybackEntry {
        PlaybackEntry::queued(EntryId::new("library", id), PlaybackId(playback_id))
    }

    #[tokio::test]
    async fn memory_store_round_trip() {
        let store = MemoryQueueStore::new();
        let queue_id = QueueId::queue();

        store
            .insert(&queue_id, 0, &[entry("a", 1), entry("b", 2)])
            .await
            .unwrap();
        store.insert(&queue_id, 1, &[entry("c", 3)]).await.unwrap();

        let loaded = store.load(&queue_id).await.unwrap();
        let ids: Vec<&str> = loaded.iter().map(|e| e.entry_id.id.as_str()).collect();
        assert_eq!(ids, vec!["a", "c", "b"]);

        store.remove(&queue_id, &[PlaybackId(3)]).await.unwrap();
        assert_eq!(store.load(&queue_id).await.unwrap().len(), 2);
    }

    #[tokio::test]
    async fn subscribe_receives_updates() {
        use futures::StreamExt;

        let store = MemoryQueueStore::new();
        let queue_id = QueueId::queue();
        let mut stream = store.subscribe(&queue_id);

        store.insert(&queue_id, 0, &[entry("a", 1)]).await.unwrap();
        let update = stream.next().await.unwrap();
        assert_eq!(update.len(), 1);
    }

    #[tokio::test]
    async fn failing_store_reports_error() {
        let store = MemoryQueueStore::new();
        store.set_fail_writes(true);
        let err = store
            .insert(&QueueId::queue(), 0, &[entry("a", 1)])
            .await
            .unwrap_err();
        assert!(matches!(err, Error::StorageWriteFailed(..)));
    }
}
