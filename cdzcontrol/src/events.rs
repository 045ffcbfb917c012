//! Outbound controller events.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use crossbeam_channel::{Receiver, Sender, unbounded};
use serde::{Deserialize, Serialize};

use cdzqueue::{PlaybackEntry, QueueId};

use crate::selection::{OrderMode, PlaylistSelection};

/// Coarse transport state exposed to the host.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PlaybackState {
    Playing,
    Paused,
    Stopped,
}

impl std::fmt::Display for PlaybackState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            PlaybackState::Playing => write!(f, "playing"),
            PlaybackState::Paused => write!(f, "paused"),
            PlaybackState::Stopped => write!(f, "stopped"),
        }
    }
}

/// Events broadcast to the host application.
#[derive(Clone, Debug)]
pub enum ControllerEvent {
    PlaybackStateChanged(PlaybackState),
    CurrentEntryChanged(Option<PlaybackEntry>),
    QueueChanged {
        queue_id: QueueId,
        previous_size: usize,
        size: usize,
    },
    PlaylistSelectionChanged(Option<PlaylistSelection>),
    PlaybackOrderChanged(OrderMode),
    RepeatModeChanged(bool),
    SeekPositionChanged(Duration),
}

/// Subscriber bus for controller events. Dead receivers are dropped on the
/// next broadcast.
#[derive(Clone, Default)]
pub struct ControllerEventBus {
    subscribers: Arc<Mutex<Vec<Sender<ControllerEvent>>>>,
}

impl ControllerEventBus {
    pub fn new() -> Self {
        Self {
            subscribers: Arc::new(Mutex::new(Vec::new())),
        }
    }

    pub fn subscribe(&self) -> Receiver<ControllerEvent> {
        let (tx, rx) = unbounded::<ControllerEvent>();
        {
            let mut subscribers = self.subscribers.lock().unwrap();
            subscribers.push(tx);
        }
        rx
    }

    pub fn broadcast(&self, event: ControllerEvent) {
        let mut subscribers = self.subscribers.lock().unwrap();
        subscribers.retain(|tx| tx.send(event.clone()).is_ok());
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn broadcast_reaches_all_live_subscribers() {
        let bus = ControllerEventBus::new();
        let first = bus.subscribe();
        let second = bus.subscribe();

        bus.broadcast(ControllerEvent::RepeatModeChanged(true));

        assert!(matches!(
            first.try_recv().unwrap(),
            ControllerEvent::RepeatModeChanged(true)
        ));
        assert!(matches!(
            second.try_recv().unwrap(),
            ControllerEvent::RepeatModeChanged(true)
        ));
    }

    #[test]
    fn dropped_subscriber_is_pruned() {
        let bus = ControllerEventBus::new();
        let keep = bus.subscribe();
        drop(bus.subscribe());

        bus.broadcast(ControllerEvent::RepeatModeChanged(false));
        bus.broadcast(ControllerEvent::RepeatModeChanged(true));

        assert_eq!(keep.len(), 2);
    }
}
