//! Observable ordered entry queue with write-behind persistence.
//!
//! Design goals:
//!   - Every mutator updates the in-memory list synchronously, so readers
//!     observe the change immediately, then issues the durable write as a
//!     spawned task whose handle is returned to the caller.
//!   - A failed durable write is logged and surfaced through the returned
//!     task, but the in-memory state is **not** rolled back: at runtime the
//!     store is a cache of the queue, not its source of truth.
//!   - Observers fire exactly once per external mutation, with the previous
//!     and new sizes, outside the list lock (an observer may re-enter the
//!     queue for reads).
//!
//! The list lock is deliberately fine-grained: observer callbacks and
//! mutators may run on different execution contexts.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, RwLock};

use tokio::task::JoinHandle;
use tracing::{debug, error};

use crate::entry::{PlaybackEntry, PlaybackId};
use crate::error::{Error, Result};
use crate::store::{QueueId, QueueStore};

/// Handle on the asynchronous durable write behind a queue mutation.
pub type WriteTask = JoinHandle<Result<()>>;

/// Observer invoked with (previous size, new size) after each mutation.
pub type QueueObserver = Arc<dyn Fn(usize, usize) + Send + Sync>;

/// An append/insert/remove-ordered list of playback entries with a stable
/// external identity, bound to a durable store.
#[derive(Clone)]
pub struct EntryQueue {
    queue_id: QueueId,
    entries: Arc<Mutex<Vec<PlaybackEntry>>>,
    observers: Arc<RwLock<HashMap<u64, QueueObserver>>>,
    observer_counter: Arc<AtomicU64>,
    store: Arc<dyn QueueStore>,
}

impl EntryQueue {
    pub fn new(queue_id: QueueId, store: Arc<dyn QueueStore>) -> Self {
        Self {
            queue_id,
            entries: Arc::new(Mutex::new(Vec::new())),
            observers: Arc::new(RwLock::new(HashMap::new())),
            observer_counter: Arc::new(AtomicU64::new(1)),
            store,
        }
    }

    pub fn queue_id(&self) -> &QueueId {
        &self.queue_id
    }

    /// Reconstructs the in-memory list from the durable store. Startup only;
    /// does not issue a durable write.
    pub async fn restore(&self) -> Result<()> {
        let stored = self.store.load(&self.queue_id).await?;
        let (previous, new) = {
            let mut entries = self.entries.lock().unwrap();
            let previous = entries.len();
            *entries = stored;
            (previous, entries.len())
        };
        debug!(queue = %self.queue_id, entries = new, "restored queue from store");
        self.notify(previous, new);
        Ok(())
    }

    // =====================================================================
    //  Mutators: synchronous memory update + spawned durable write
    // =====================================================================

    /// Inserts `entries` at `at_index`, shifting the tail.
    pub fn add(&self, at_index: usize, new_entries: Vec<PlaybackEntry>) -> Result<WriteTask> {
        let (previous, new) = {
            let mut entries = self.entries.lock().unwrap();
            if at_index > entries.len() {
                return Err(Error::IndexOutOfRange(at_index, entries.len()));
            }
            let previous = entries.len();
            for (offset, entry) in new_entries.iter().enumerate() {
                entries.insert(at_index + offset, entry.clone());
            }
            (previous, entries.len())
        };
        debug!(
            queue = %self.queue_id,
            at = at_index,
            added = new - previous,
            "queue add"
        );
        self.notify(previous, new);
        Ok(self.spawn_write(move |store, queue_id| async move {
            store.insert(&queue_id, at_index, &new_entries).await
        }))
    }

    /// Appends `entries` at the end.
    pub fn append(&self, new_entries: Vec<PlaybackEntry>) -> WriteTask {
        let (at, previous, new) = {
            let mut entries = self.entries.lock().unwrap();
            let at = entries.len();
            entries.extend(new_entries.iter().cloned());
            (at, at, entries.len())
        };
        debug!(queue = %self.queue_id, added = new - previous, "queue append");
        self.notify(previous, new);
        self.spawn_write(move |store, queue_id| async move {
            store.insert(&queue_id, at, &new_entries).await
        })
    }

    /// Removes the listed entries, matching by playback id.
    pub fn remove(&self, to_remove: &[PlaybackEntry]) -> WriteTask {
        let ids: Vec<PlaybackId> = to_remove.iter().map(|e| e.playback_id).collect();
        self.remove_ids(&ids)
    }

    /// Removes the entries with the given playback ids.
    pub fn remove_ids(&self, ids: &[PlaybackId]) -> WriteTask {
        let ids = ids.to_vec();
        let (previous, new) = {
            let mut entries = self.entries.lock().unwrap();
            let previous = entries.len();
            entries.retain(|entry| !ids.contains(&entry.playback_id));
            (previous, entries.len())
        };
        if previous != new {
            debug!(queue = %self.queue_id, removed = previous - new, "queue remove");
            self.notify(previous, new);
        }
        self.spawn_write(move |store, queue_id| async move {
            store.remove(&queue_id, &ids).await
        })
    }

    /// Replaces the whole list.
    pub fn replace_with(&self, new_entries: Vec<PlaybackEntry>) -> WriteTask {
        let stored = new_entries.clone();
        let (previous, new) = {
            let mut entries = self.entries.lock().unwrap();
            let previous = entries.len();
            *entries = new_entries;
            (previous, entries.len())
        };
        debug!(queue = %self.queue_id, entries = new, "queue replace");
        self.notify(previous, new);
        self.spawn_write(move |store, queue_id| async move {
            store.replace(&queue_id, &stored).await
        })
    }

    /// Removes and returns the first `n` entries.
    pub fn poll(&self, n: usize) -> (Vec<PlaybackEntry>, WriteTask) {
        let (polled, previous, new) = {
            let mut entries = self.entries.lock().unwrap();
            let previous = entries.len();
            let n = n.min(entries.len());
            let polled: Vec<PlaybackEntry> = entries.drain(..n).collect();
            (polled, previous, entries.len())
        };
        if previous != new {
            debug!(queue = %self.queue_id, polled = polled.len(), "queue poll");
            self.notify(previous, new);
        }
        let ids: Vec<PlaybackId> = polled.iter().map(|e| e.playback_id).collect();
        let task = self.spawn_write(move |store, queue_id| async move {
            store.remove(&queue_id, &ids).await
        });
        (polled, task)
    }

    /// Empties the queue.
    pub fn clear(&self) -> WriteTask {
        let (previous, new) = {
            let mut entries = self.entries.lock().unwrap();
            let previous = entries.len();
            entries.clear();
            (previous, 0)
        };
        if previous != new {
            debug!(queue = %self.queue_id, "queue clear");
            self.notify(previous, new);
        }
        self.spawn_write(move |store, queue_id| async move {
            store.remove_all(&queue_id).await
        })
    }

    /// Rewrites entries in place (playlist positions, preload flags, …) and
    /// mirrors the full list to the store.
    pub fn rewrite<F>(&self, mut rewrite: F) -> WriteTask
    where
        F: FnMut(&mut PlaybackEntry),
    {
        let (snapshot, previous, new) = {
            let mut entries = self.entries.lock().unwrap();
            for entry in entries.iter_mut() {
                rewrite(entry);
            }
            (entries.clone(), entries.len(), entries.len())
        };
        self.notify(previous, new);
        self.spawn_write(move |store, queue_id| async move {
            store.replace(&queue_id, &snapshot).await
        })
    }

    // =====================================================================
    //  Readers
    // =====================================================================

    pub fn get(&self, index: usize) -> Option<PlaybackEntry> {
        self.entries.lock().unwrap().get(index).cloned()
    }

    pub fn size(&self) -> usize {
        self.entries.lock().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.lock().unwrap().is_empty()
    }

    pub fn snapshot(&self) -> Vec<PlaybackEntry> {
        self.entries.lock().unwrap().clone()
    }

    pub fn first(&self) -> Option<PlaybackEntry> {
        self.entries.lock().unwrap().first().cloned()
    }

    pub fn last(&self) -> Option<PlaybackEntry> {
        self.entries.lock().unwrap().last().cloned()
    }

    /// Containment by catalog identity (`PlaybackEntry` equality).
    pub fn contains(&self, entry: &PlaybackEntry) -> bool {
        self.entries.lock().unwrap().contains(entry)
    }

    pub fn position_of(&self, playback_id: PlaybackId) -> Option<usize> {
        self.entries
            .lock()
            .unwrap()
            .iter()
            .position(|entry| entry.playback_id == playback_id)
    }

    // =====================================================================
    //  Observers
    // =====================================================================

    /// Registers a size-change observer; returns its removal token.
    pub fn add_observer(&self, observer: QueueObserver) -> u64 {
        let token = self.observer_counter.fetch_add(1, Ordering::SeqCst);
        self.observers.write().unwrap().insert(token, observer);
        token
    }

    pub fn remove_observer(&self, token: u64) {
        self.observers.write().unwrap().remove(&token);
    }

    fn notify(&self, previous: usize, new: usize) {
        // Snapshot the observer list first: a callback may re-enter the
        // queue or mutate the registry.
        let observers: Vec<QueueObserver> =
            self.observers.read().unwrap().values().cloned().collect();
        for observer in observers {
            observer(previous, new);
        }
    }

    fn spawn_write<F, Fut>(&self, write: F) -> WriteTask
    where
        F: FnOnce(Arc<dyn QueueStore>, QueueId) -> Fut + Send + 'static,
        Fut: std::future::Future<Output = Result<()>> + Send + 'static,
    {
        let store = Arc::clone(&self.store);
        let queue_id = self.queue_id.clone();
        tokio::spawn(async move {
            let result = write(store, queue_id.clone()).await;
            if let Err(e) = &result {
                error!(queue = %queue_id, error = %e, "durable queue write failed");
            }
            result
        })
    }
}

impl std::fmt::Debug for EntryQueue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EntryQueue")
            .field("queue_id", &self.queue_id)
            .field("size", &self.size())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::entry::EntryId;
    use crate::store::MemoryQueueStore;
    use std::sync::atomic::AtomicUsize;

    fn entry(id: &str, playback_id: u64) -> PlaybackEntry {
        PlaybackEntry::queued(EntryId::new("library", id), PlaybackId(playback_id))
    }

    #[tokio::test]
    async fn add_is_visible_before_durable_write_completes() {
        let store = MemoryQueueStore::new();
        let queue = EntryQueue::new(QueueId::queue(), store.clone());

        let task = queue.add(0, vec![entry("a", 1), entry("b", 2)]).unwrap();
        // Read-after-write: memory is authoritative immediately.
        assert_eq!(queue.size(), 2);

        task.await.unwrap().unwrap();
        assert_eq!(store.stored(&QueueId::queue()).len(), 2);
    }

    #[tokio::test]
    async fn failed_durable_write_does_not_roll_back() {
        let store = MemoryQueueStore::new();
        let queue = EntryQueue::new(QueueId::queue(), store.clone());
        store.set_fail_writes(true);

        let task = queue.add(0, vec![entry("a", 1)]).unwrap();
        let result = task.await.unwrap();

        assert!(matches!(result, Err(Error::StorageWriteFailed(..))));
        assert_eq!(queue.size(), 1);
        assert!(store.stored(&QueueId::queue()).is_empty());
    }

    #[tokio::test]
    async fn observer_fires_once_per_mutation_with_sizes() {
        let store = MemoryQueueStore::new();
        let queue = EntryQueue::new(QueueId::queue(), store);

        let calls = Arc::new(Mutex::new(Vec::new()));
        let seen = Arc::clone(&calls);
        queue.add_observer(Arc::new(move |previous, new| {
            seen.lock().unwrap().push((previous, new));
        }));

        queue.add(0, vec![entry("a", 1), entry("b", 2)]).unwrap();
        queue.remove(&[entry("a", 1)]);
        let (polled, _) = queue.poll(1);

        assert_eq!(polled.len(), 1);
        assert_eq!(
            calls.lock().unwrap().clone(),
            vec![(0, 2), (2, 1), (1, 0)]
        );
    }

    #[tokio::test]
    async fn remove_matches_by_playback_id() {
        let store = MemoryQueueStore::new();
        let queue = EntryQueue::new(QueueId::queue(), store);

        // Same catalog item queued twice under different playback ids.
        queue.add(0, vec![entry("a", 1), entry("a", 2)]).unwrap();
        queue.remove(&[entry("a", 2)]);

        assert_eq!(queue.size(), 1);
        assert_eq!(queue.get(0).unwrap().playback_id, PlaybackId(1));
    }

    #[tokio::test]
    async fn poll_returns_head_in_order() {
        let store = MemoryQueueStore::new();
        let queue = EntryQueue::new(QueueId::queue(), store);

        queue
            .add(0, vec![entry("a", 1), entry("b", 2), entry("c", 3)])
            .unwrap();
        let (polled, _) = queue.poll(2);

        let ids: Vec<&str> = polled.iter().map(|e| e.entry_id.id.as_str()).collect();
        assert_eq!(ids, vec!["a", "b"]);
        assert_eq!(queue.size(), 1);
    }

    #[tokio::test]
    async fn observer_can_read_the_queue_without_deadlock() {
        let store = MemoryQueueStore::new();
        let queue = EntryQueue::new(QueueId::queue(), store);

        let sizes_seen = Arc::new(AtomicUsize::new(0));
        let reader = queue.clone();
        let seen = Arc::clone(&sizes_seen);
        queue.add_observer(Arc::new(move |_, _| {
            seen.store(reader.size(), Ordering::SeqCst);
        }));

        queue.add(0, vec![entry("a", 1)]).unwrap();
        assert_eq!(sizes_seen.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn restore_reconstructs_from_store() {
        let store = MemoryQueueStore::new();
        store
            .replace(&QueueId::history(), &[entry("a", 1), entry("b", 2)])
            .await
            .unwrap();

        let queue = EntryQueue::new(QueueId::history(), store);
        queue.restore().await.unwrap();
        assert_eq!(queue.size(), 2);
    }
}
