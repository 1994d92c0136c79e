pub mod local;

use std::collections::HashMap;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::{error::Result, scheduler::rotation::PerformerId};

pub use local::LocalStore;

/// Persisted rotation cursor.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RotationSnapshot {
    pub order: Vec<PerformerId>,
    pub current_index: usize,
}

/// Durable state the scheduler keeps across restarts.
#[async_trait]
pub trait ShowStore: Send + Sync {
    async fn save_rotation_state(&self, order: &[PerformerId], current_index: usize) -> Result<()>;

    async fn load_rotation_state(&self) -> Result<Option<RotationSnapshot>>;

    async fn save_cooldown(&self, track_name: &str, played_at_ms: u64) -> Result<()>;

    async fn load_cooldowns(&self) -> Result<HashMap<String, u64>>;
}
