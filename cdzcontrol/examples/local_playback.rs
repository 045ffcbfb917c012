//! Minimal local playback demo.
//!
//! Builds a controller over the in-memory collaborators, queues a few
//! tracks, selects a playlist and prints what the scheduler hands to the
//! backend.
//!
//! Usage:
//!   cargo run --example local_playback

use std::sync::Arc;

use cdzcontrol::{
    ControllerContext, MemoryPlaylistStore, OrderMode, PlaybackController, PlayerConfig,
};
use cdzplayer::{InstantDataProvider, StaticCatalogResolver};
use cdzqueue::{EntryId, MemoryQueueStore};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let _ = tracing_subscriber::fmt::try_init();
    println!("Starting Cadenza local playback demo...");

    let playlist_store = MemoryPlaylistStore::new();
    playlist_store.put(
        "demo-playlist",
        (0..8)
            .map(|i| EntryId::new("playlist", format!("track-{i}")))
            .collect(),
    );

    let context = ControllerContext {
        store: MemoryQueueStore::new(),
        provider: Arc::new(InstantDataProvider::new()),
        resolver: Arc::new(StaticCatalogResolver::new(Default::default())),
        playlist_store,
        config: PlayerConfig::default(),
    };
    let controller = PlaybackController::new_local(context);

    let events = controller.subscribe_events();

    controller
        .queue(vec![
            EntryId::new("library", "intro"),
            EntryId::new("library", "jingle"),
        ])
        .await?;
    controller
        .select_playlist("demo-playlist", 0, OrderMode::Sequential, true)
        .await?;
    controller.play().await?;

    tokio::time::sleep(std::time::Duration::from_millis(100)).await;

    println!("\nUpcoming entries:");
    for entry in controller.upcoming().await? {
        println!(
            "  {} {} (kind={}, preloaded={})",
            entry.playback_id, entry.entry_id, entry.kind, entry.preloaded
        );
    }

    let status = controller.status().await?;
    println!("\nPlayback state: {}", status.playback_state);
    println!("Preloaded: {}", status.num_preloaded);

    println!("\nEvents observed:");
    for event in events.try_iter() {
        println!("  {event:?}");
    }

    controller.shutdown().await?;
    Ok(())
}
