use std::sync::Arc;
use std::time::Duration;

use cdzplayer::{
    AudioPlayer, InstantDataProvider, LocalPlayer, PlayerEvent, PlayerEventReceiver,
    player_event_channel,
};
use cdzqueue::{EntryId, MemoryQueueStore, PlaybackEntry, PlaybackId, QueueId, QueueStore};

fn entry(id: &str, playback_id: u64) -> PlaybackEntry {
    PlaybackEntry::queued(EntryId::new("library", id), PlaybackId(playback_id))
}

fn local_player(max_preload: usize) -> (AudioPlayer, PlayerEventReceiver, Arc<MemoryQueueStore>) {
    let store = MemoryQueueStore::new();
    let provider = Arc::new(InstantDataProvider::new());
    let (tx, rx) = player_event_channel();
    let player = AudioPlayer::Local(LocalPlayer::new(
        store.clone(),
        provider,
        tx,
        max_preload,
        3,
    ));
    (player, rx, store)
}

/// Lets spawned fetch and persistence tasks run to completion.
async fn settle() {
    for _ in 0..50 {
        tokio::task::yield_now().await;
    }
}

fn drain(rx: &mut PlayerEventReceiver) -> Vec<PlayerEvent> {
    let mut events = Vec::new();
    while let Ok(event) = rx.try_recv() {
        events.push(event);
    }
    events
}

#[tokio::test]
async fn preload_then_play_starts_first_entry() {
    let (player, mut rx, _store) = local_player(3);

    player
        .preload_at(0, vec![entry("a", 1), entry("b", 2)])
        .await
        .unwrap();
    settle().await;

    player.play().await.unwrap();
    assert!(player.is_playing());
    assert_eq!(
        player.get_current_entry().unwrap().entry_id.id.as_str(),
        "a"
    );

    let events = drain(&mut rx);
    assert!(
        events
            .iter()
            .any(|e| matches!(e, PlayerEvent::EntryStarted(s) if s.entry_id.id == "a"))
    );
}

#[tokio::test]
async fn preload_beyond_capacity_is_rejected() {
    let (player, _rx, _store) = local_player(2);

    player
        .preload_at(0, vec![entry("a", 1), entry("b", 2)])
        .await
        .unwrap();
    let err = player.preload_at(2, vec![entry("c", 3)]).await.unwrap_err();
    assert!(matches!(err, cdzplayer::PlayerError::RequestRejected { .. }));
    assert_eq!(player.get_num_preloaded(), 2);
}

#[tokio::test]
async fn play_before_fetch_completes_is_pending_then_starts() {
    let (player, mut rx, _store) = local_player(3);

    // No settle: the fetch task has not run yet when play() arrives.
    player.preload_at(0, vec![entry("a", 1)]).await.unwrap();
    player.play().await.unwrap();

    let events = drain(&mut rx);
    assert!(
        events
            .iter()
            .any(|e| matches!(e, PlayerEvent::BufferingChanged { buffering: true }))
    );

    settle().await;
    let events = drain(&mut rx);
    assert!(
        events
            .iter()
            .any(|e| matches!(e, PlayerEvent::EntryStarted(s) if s.entry_id.id == "a"))
    );
}

#[tokio::test]
async fn completion_hands_off_gaplessly_and_records_history() {
    let (player, mut rx, _store) = local_player(3);

    player
        .preload_at(0, vec![entry("a", 1), entry("b", 2)])
        .await
        .unwrap();
    settle().await;
    player.play().await.unwrap();
    drain(&mut rx);

    let AudioPlayer::Local(local) = &player else {
        unreachable!()
    };
    local.on_track_complete().unwrap();

    assert_eq!(
        player.get_current_entry().unwrap().entry_id.id.as_str(),
        "b"
    );
    assert!(player.is_playing());
    let history = player.get_history();
    assert_eq!(history.len(), 1);
    assert_eq!(history[0].entry_id.id, "a");

    let events = drain(&mut rx);
    assert!(
        events
            .iter()
            .any(|e| matches!(e, PlayerEvent::EntryCompleted(c) if c.entry_id.id == "a"))
    );
    assert!(
        events
            .iter()
            .any(|e| matches!(e, PlayerEvent::EntryStarted(s) if s.entry_id.id == "b"))
    );
}

#[tokio::test]
async fn completion_of_last_entry_stops_playback() {
    let (player, _rx, _store) = local_player(3);

    player.preload_at(0, vec![entry("a", 1)]).await.unwrap();
    settle().await;
    player.play().await.unwrap();

    let AudioPlayer::Local(local) = &player else {
        unreachable!()
    };
    local.on_track_complete().unwrap();

    assert!(!player.is_playing());
    assert!(player.get_current_entry().is_none());
    assert_eq!(player.get_num_preloaded(), 0);
}

#[tokio::test]
async fn depreload_returns_entries_unprimed_and_updates_mirror() {
    let (player, _rx, store) = local_player(3);

    player
        .preload_at(0, vec![entry("a", 1), entry("b", 2), entry("c", 3)])
        .await
        .unwrap();
    settle().await;

    let removed = player.depreload(&[entry("c", 3)]).await.unwrap();
    assert_eq!(removed.len(), 1);
    assert!(!removed[0].preloaded);
    assert_eq!(player.get_num_preloaded(), 2);

    settle().await;
    let mirrored = store.stored(&QueueId::player_queue());
    assert_eq!(mirrored.len(), 2);
    assert!(mirrored.iter().all(|e| e.entry_id.id != "c"));
}

#[tokio::test]
async fn fetch_retry_gives_up_after_bound() {
    let store = MemoryQueueStore::new();
    let provider = Arc::new(InstantDataProvider::new());
    provider.fail_next(EntryId::new("library", "bad"), 10);
    let (tx, mut rx) = player_event_channel();
    let player = LocalPlayer::new(store, provider, tx, 3, 3);

    player
        .preload_at(0, vec![entry("bad", 1)])
        .await
        .unwrap();
    settle().await;

    let events = drain(&mut rx);
    assert!(events.iter().any(|e| matches!(
        e,
        PlayerEvent::UnitError { terminal: true, .. }
    )));
}

#[tokio::test]
async fn migration_snapshot_replays_identically() {
    let (player, _rx, _store) = local_player(4);

    player
        .preload_at(0, vec![entry("a", 1), entry("b", 2), entry("c", 3)])
        .await
        .unwrap();
    settle().await;
    player.play().await.unwrap();
    player.seek(Duration::from_secs(30)).await.unwrap();

    let snapshot = player.get_last_state();
    assert_eq!(snapshot.current_entry.as_ref().unwrap().entry_id.id, "a");
    assert_eq!(snapshot.preloaded.len(), 2);
    assert_eq!(snapshot.position, Duration::from_secs(30));

    let (replacement, _rx2, _store2) = local_player(4);
    replacement.restore(snapshot.clone()).await.unwrap();
    settle().await;

    let replayed = replacement.get_last_state();
    assert_eq!(
        replayed.current_entry.as_ref().map(|e| &e.entry_id),
        snapshot.current_entry.as_ref().map(|e| &e.entry_id)
    );
    let order = |s: &cdzplayer::AudioPlayerState| {
        s.preloaded
            .iter()
            .map(|e| e.entry_id.id.clone())
            .collect::<Vec<_>>()
    };
    assert_eq!(order(&replayed), order(&snapshot));
    assert_eq!(replayed.history.len(), snapshot.history.len());
    assert_eq!(replayed.position, snapshot.position);
}

#[tokio::test]
async fn destroyed_player_fails_fast() {
    let (player, _rx, store) = local_player(3);

    player.preload_at(0, vec![entry("a", 1)]).await.unwrap();
    settle().await;
    player.destroy().await.unwrap();
    settle().await;

    assert!(matches!(
        player.play().await,
        Err(cdzplayer::PlayerError::Destroyed)
    ));
    assert!(store.stored(&QueueId::player_queue()).is_empty());
}

#[tokio::test]
async fn resume_from_store_rebuilds_preloaded_set() {
    let store = MemoryQueueStore::new();
    store
        .replace(
            &QueueId::player_queue(),
            &[
                entry("a", 1).with_preloaded(true),
                entry("b", 2).with_preloaded(true),
            ],
        )
        .await
        .unwrap();

    let provider = Arc::new(InstantDataProvider::new());
    let (tx, _rx) = player_event_channel();
    let player = LocalPlayer::new(store, provider, tx, 3, 3);
    player.resume_from_store().await.unwrap();
    settle().await;

    assert_eq!(player.get_num_preloaded(), 2);
    assert_eq!(player.get_queue_entries(10).len(), 2);
}
