use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;

use crate::scheduler::rotation::{Performer, PerformerId};

/// Operator requests arriving from the remote surface.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum CommandAction {
    Skip,
    Pause,
    Resume,
    TogglePause,
    SetVolume {
        volume: f32,
    },
    Seek {
        position_ms: u64,
    },
    /// Empty lineup means "the configured or persisted lineup".
    StartRotation {
        #[serde(default)]
        lineup: Vec<PerformerId>,
    },
    StopRotation,
    SkipDancer {
        performer_id: PerformerId,
    },
    /// Break songs after `after`, by track name.
    SetBreakSongs {
        after: PerformerId,
        names: Vec<String>,
    },
    UpdateRoster {
        performers: Vec<Performer>,
    },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Command {
    /// Monotonically increasing; re-deliveries carry the same id.
    pub id: u64,
    pub action: CommandAction,
    #[serde(default)]
    pub timestamp_ms: u64,
}

/// Idempotency bookkeeping for the command stream.
///
/// Commands are processed at most once (by id) and acknowledged upward;
/// re-acknowledging an id that was already acknowledged is a no-op.
#[derive(Debug, Default)]
pub struct CommandIntake {
    last_processed: u64,
    last_acked: u64,
    ack_tx: Option<mpsc::UnboundedSender<u64>>,
}

impl CommandIntake {
    pub fn new(ack_tx: Option<mpsc::UnboundedSender<u64>>) -> Self {
        Self {
            last_processed: 0,
            last_acked: 0,
            ack_tx,
        }
    }

    /// Whether `cmd` is new. Does not mark it processed.
    pub fn admit(&self, cmd: &Command) -> bool {
        cmd.id > self.last_processed
    }

    pub fn mark_processed(&mut self, id: u64) {
        self.last_processed = self.last_processed.max(id);
    }

    pub fn last_processed(&self) -> u64 {
        self.last_processed
    }

    /// Acknowledge everything up to `upto_id`. Returns `false` when that was
    /// already acknowledged.
    pub fn ack_commands(&mut self, upto_id: u64) -> bool {
        if upto_id <= self.last_acked {
            return false;
        }
        self.last_acked = upto_id;
        if let Some(tx) = &self.ack_tx {
            let _ = tx.send(upto_id);
        }
        true
    }
}
