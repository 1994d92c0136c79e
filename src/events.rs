use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;

use crate::{gateway::announcer::AnnouncementKind, scheduler::rotation::PerformerId};

/// Snapshot of what the show is doing, published on every change.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PlaybackStatus {
    pub performer_id: Option<PerformerId>,
    pub performer_name: Option<String>,
    pub track: Option<String>,
    pub song_number: u32,
    pub playing: bool,
    pub paused: bool,
    pub rotation_active: bool,
    pub playing_break: bool,
    pub break_index: usize,
    /// House music is filling while no rotation runs.
    pub fallback_playing: bool,
    pub lineup: Vec<PerformerId>,
}

/// State-change notifications for any listener (status UI, logs, tests).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ShowEvent {
    StatusChanged {
        status: PlaybackStatus,
    },
    TrackStarted {
        track: String,
        performer_id: Option<PerformerId>,
        at_ms: u64,
    },
    AnnouncementPlayed {
        kind: AnnouncementKind,
        at_ms: u64,
    },
    AnnouncementSkipped {
        kind: AnnouncementKind,
        reason: String,
    },
    RotationChanged {
        order: Vec<PerformerId>,
    },
    WatchdogRecovery {
        silent_for_ms: u64,
        recovered: bool,
    },
    CommandProcessed {
        id: u64,
    },
}

/// Broadcast distribution of [`ShowEvent`]s.
///
/// Publishing never blocks; slow subscribers see `Lagged` and skip ahead.
#[derive(Clone)]
pub struct EventBus {
    tx: broadcast::Sender<ShowEvent>,
}

impl EventBus {
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity);
        Self { tx }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<ShowEvent> {
        self.tx.subscribe()
    }

    /// Emit an event, ignoring if no subscribers are listening.
    pub fn emit_lossy(&self, event: ShowEvent) {
        let _ = self.tx.send(event);
    }

    pub fn subscriber_count(&self) -> usize {
        self.tx.receiver_count()
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(256)
    }
}
