use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;

use cdzplayer::{
    AudioPlayer, PlayerError, PlayerEvent, PlayerEventReceiver, RemoteLink, RemoteNotification,
    RemotePlayer, RemoteReply, RemoteRequest, player_event_channel,
};
use cdzqueue::{EntryId, PlaybackEntry, PlaybackId};

fn entry(id: &str, playback_id: u64) -> PlaybackEntry {
    PlaybackEntry::queued(EntryId::new("library", id), PlaybackId(playback_id))
}

/// Scriptable remote link: records every request, optionally stays silent
/// (the missing-callback bug) or rejects.
struct MockLink {
    connected: AtomicBool,
    silent: AtomicBool,
    reject: AtomicBool,
    requests: Mutex<Vec<String>>,
}

impl MockLink {
    fn new() -> Arc<Self> {
        Arc::new(Self {
            connected: AtomicBool::new(true),
            silent: AtomicBool::new(false),
            reject: AtomicBool::new(false),
            requests: Mutex::new(Vec::new()),
        })
    }

    fn request_log(&self) -> Vec<String> {
        self.requests.lock().unwrap().clone()
    }
}

#[async_trait]
impl RemoteLink for MockLink {
    fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }

    async fn request(&self, request: RemoteRequest) -> cdzplayer::Result<RemoteReply> {
        self.requests
            .lock()
            .unwrap()
            .push(format!("{request:?}"));
        if self.silent.load(Ordering::SeqCst) {
            // The superseded-request bug: no callback ever arrives.
            futures::future::pending::<()>().await;
        }
        if self.reject.load(Ordering::SeqCst) {
            return Ok(RemoteReply::Rejected {
                code: 404,
                message: "media not found".into(),
            });
        }
        Ok(RemoteReply::Accepted)
    }
}

fn remote_player(link: Arc<MockLink>) -> (AudioPlayer, PlayerEventReceiver) {
    let (tx, rx) = player_event_channel();
    (AudioPlayer::Remote(RemotePlayer::new(link, tx, 3)), rx)
}

fn drain(rx: &mut PlayerEventReceiver) -> Vec<PlayerEvent> {
    let mut events = Vec::new();
    while let Ok(event) = rx.try_recv() {
        events.push(event);
    }
    events
}

#[tokio::test]
async fn preload_and_play_drive_the_link() {
    let link = MockLink::new();
    let (player, mut rx) = remote_player(link.clone());

    player
        .preload_at(0, vec![entry("a", 1), entry("b", 2)])
        .await
        .unwrap();
    player.play().await.unwrap();

    assert_eq!(player.get_num_preloaded(), 2);
    assert_eq!(
        player.get_current_entry().unwrap().entry_id.id.as_str(),
        "a"
    );
    let log = link.request_log();
    assert!(log[0].starts_with("QueueInsert"));
    assert_eq!(log[1], "Play");

    let events = drain(&mut rx);
    assert!(
        events
            .iter()
            .any(|e| matches!(e, PlayerEvent::EntryStarted(s) if s.entry_id.id == "a"))
    );
}

#[tokio::test]
async fn disconnected_link_fails_fast() {
    let link = MockLink::new();
    link.connected.store(false, Ordering::SeqCst);
    let (player, _rx) = remote_player(link);

    let err = player.preload_at(0, vec![entry("a", 1)]).await.unwrap_err();
    assert!(matches!(err, PlayerError::BackendUnavailable(_)));
}

#[tokio::test(start_paused = true)]
async fn silent_link_times_out_instead_of_deadlocking() {
    let link = MockLink::new();
    link.silent.store(true, Ordering::SeqCst);
    let (player, _rx) = remote_player(link);

    let started = tokio::time::Instant::now();
    let err = player.preload_at(0, vec![entry("a", 1)]).await.unwrap_err();

    assert!(matches!(err, PlayerError::RequestTimeout(_)));
    assert_eq!(started.elapsed(), cdzplayer::REMOTE_REQUEST_TIMEOUT);
}

#[tokio::test]
async fn rejected_reply_is_surfaced_with_its_code() {
    let link = MockLink::new();
    link.reject.store(true, Ordering::SeqCst);
    let (player, _rx) = remote_player(link);

    let err = player.preload_at(0, vec![entry("a", 1)]).await.unwrap_err();
    match err {
        PlayerError::RequestRejected { code, message } => {
            assert_eq!(code, 404);
            assert!(message.contains("not found"));
        }
        other => panic!("unexpected error: {other}"),
    }
    // The mirror must not be touched by a rejected insert.
    assert_eq!(player.get_num_preloaded(), 0);
}

#[tokio::test]
async fn track_finished_notification_advances_the_mirror() {
    let link = MockLink::new();
    let (player, mut rx) = remote_player(link);

    player
        .preload_at(0, vec![entry("a", 1), entry("b", 2)])
        .await
        .unwrap();
    player.play().await.unwrap();
    drain(&mut rx);

    let AudioPlayer::Remote(remote) = &player else {
        unreachable!()
    };
    remote.handle_notification(RemoteNotification::TrackFinished);

    assert_eq!(
        player.get_current_entry().unwrap().entry_id.id.as_str(),
        "b"
    );
    assert_eq!(player.get_history().len(), 1);

    let events = drain(&mut rx);
    assert!(
        events
            .iter()
            .any(|e| matches!(e, PlayerEvent::EntryCompleted(c) if c.entry_id.id == "a"))
    );
}

#[tokio::test]
async fn migration_snapshot_round_trips_through_a_fresh_remote() {
    let link = MockLink::new();
    let (player, _rx) = remote_player(link);

    player
        .preload_at(0, vec![entry("a", 1), entry("b", 2), entry("c", 3)])
        .await
        .unwrap();
    player.play().await.unwrap();
    player.seek(Duration::from_secs(12)).await.unwrap();

    let snapshot = player.get_last_state();
    assert_eq!(snapshot.current_entry.as_ref().unwrap().entry_id.id, "a");
    assert_eq!(snapshot.preloaded.len(), 2);

    let (replacement, _rx2) = remote_player(MockLink::new());
    replacement.restore(snapshot.clone()).await.unwrap();

    let replayed = replacement.get_last_state();
    assert_eq!(
        replayed.current_entry.as_ref().map(|e| &e.entry_id),
        snapshot.current_entry.as_ref().map(|e| &e.entry_id)
    );
    assert_eq!(replayed.preloaded.len(), snapshot.preloaded.len());
    assert_eq!(replayed.position, Duration::from_secs(12));
}
