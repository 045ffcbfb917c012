//! Collaborator interfaces toward the catalog and the audio data layer.
//!
//! Cadenza never touches audio bytes itself: fetching, caching and decoding
//! belong to the host. The player crates only need to know *when* the data
//! for an entry is primed, and how to ask for metadata used as sort keys.

use std::collections::HashMap;
use std::sync::Mutex;

use async_trait::async_trait;
use futures::stream::BoxStream;
use serde::{Deserialize, Serialize};

use cdzqueue::EntryId;

use crate::error::{PlayerError, Result};

/// Priority hint for background downloads.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DownloadPriority {
    High,
    Normal,
    Low,
}

/// Progress events produced while fetching the audio data of one entry.
#[derive(Clone, Debug)]
pub enum FetchEvent {
    /// A chunk of audio bytes arrived.
    Data(Vec<u8>),
    /// Progress notification, `total` when the size is known up front.
    Progress { received: u64, total: Option<u64> },
    /// The whole resource is primed.
    Complete,
}

/// Audio data provider collaborator.
#[async_trait]
pub trait AudioDataProvider: Send + Sync {
    /// Starts fetching the audio data for `entry_id` and returns its
    /// progress stream. The stream ends after `FetchEvent::Complete`.
    async fn fetch(&self, entry_id: &EntryId) -> Result<BoxStream<'static, FetchEvent>>;

    /// Requests a background download of `entry_id`.
    async fn download(&self, entry_id: &EntryId, priority: DownloadPriority) -> Result<()>;
}

/// Rich metadata for a catalog item (title, artist, album, duration, …).
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct TrackMetadata {
    pub title: Option<String>,
    pub artist: Option<String>,
    pub album: Option<String>,
    pub album_art_uri: Option<String>,
    pub duration_secs: Option<u64>,
    pub track_number: Option<u32>,
}

/// Catalog/metadata resolver collaborator.
#[async_trait]
pub trait CatalogResolver: Send + Sync {
    async fn resolve(&self, entry_id: &EntryId) -> Result<TrackMetadata>;

    /// Batched resolution, used for sort-key comparison.
    async fn resolve_many(&self, entry_ids: &[EntryId]) -> Result<Vec<TrackMetadata>>;
}

/// Provider whose fetches complete immediately. Backs tests and hosts whose
/// data layer primes entries elsewhere.
pub struct InstantDataProvider {
    failures: Mutex<HashMap<EntryId, u32>>,
}

impl InstantDataProvider {
    pub fn new() -> Self {
        Self {
            failures: Mutex::new(HashMap::new()),
        }
    }

    /// Makes the next `count` fetches of `entry_id` fail, to exercise the
    /// retry policy.
    pub fn fail_next(&self, entry_id: EntryId, count: u32) {
        self.failures.lock().unwrap().insert(entry_id, count);
    }
}

impl Default for InstantDataProvider {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl AudioDataProvider for InstantDataProvider {
    async fn fetch(&self, entry_id: &EntryId) -> Result<BoxStream<'static, FetchEvent>> {
        {
            let mut failures = self.failures.lock().unwrap();
            if let Some(remaining) = failures.get_mut(entry_id) {
                if *remaining > 0 {
                    *remaining -= 1;
                    return Err(PlayerError::rejected(0, "simulated fetch failure"));
                }
            }
        }
        Ok(Box::pin(futures::stream::iter(vec![
            FetchEvent::Progress {
                received: 0,
                total: Some(0),
            },
            FetchEvent::Complete,
        ])))
    }

    async fn download(&self, _entry_id: &EntryId, _priority: DownloadPriority) -> Result<()> {
        Ok(())
    }
}

/// Resolver backed by a static metadata map.
pub struct StaticCatalogResolver {
    metadata: HashMap<EntryId, TrackMetadata>,
}

impl StaticCatalogResolver {
    pub fn new(metadata: HashMap<EntryId, TrackMetadata>) -> Self {
        Self { metadata }
    }
}

#[async_trait]
impl CatalogResolver for StaticCatalogResolver {
    async fn resolve(&self, entry_id: &EntryId) -> Result<TrackMetadata> {
        Ok(self.metadata.get(entry_id).cloned().unwrap_or_default())
    }

    async fn resolve_many(&self, entry_ids: &[EntryId]) -> Result<Vec<TrackMetadata>> {
        let mut out = Vec::with_capacity(entry_ids.len());
        for id in entry_ids {
            out.push(self.metadata.get(id).cloned().unwrap_or_default());
        }
        Ok(out)
    }
}
