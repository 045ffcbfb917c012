//! # cdzqueue - Ordered playback queues for Cadenza
//!
//! This crate provides the building blocks every other Cadenza crate works
//! with:
//! - `PlaybackEntry` / `EntryId` / `PlaybackId` : the entry model
//! - `PlaybackIdAllocator` : monotonic batch id reservation
//! - `EntryQueue` : observable ordered list with write-behind persistence
//! - `QueueStore` : the durable persistence collaborator interface
//!
//! # Persistence contract
//!
//! In-memory queues are authoritative at runtime. Mutators apply in memory
//! synchronously and mirror the change to the store asynchronously; a store
//! failure is logged and surfaced through the returned write task, never
//! rolled back.

mod entry;
mod error;
mod queue;
mod store;

// Réexports publics
pub use entry::{EntryId, EntryKind, PlaybackEntry, PlaybackId, PlaybackIdAllocator};
pub use error::{Error, Result};
pub use queue::{EntryQueue, QueueObserver, WriteTask};
pub use store::{MemoryQueueStore, QueueId, QueueStore};
