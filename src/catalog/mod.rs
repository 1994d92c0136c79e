pub mod http;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::error::Result;

pub use http::HttpCatalog;

/// A playable catalog entry. `name` is the identity used for cooldowns and
/// cross-performer exclusion.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Track {
    pub key: String,
    pub name: String,
    /// Where the audio lives (a file path for the cpal output).
    pub locator: String,
    #[serde(default)]
    pub genre: Option<String>,
    #[serde(default)]
    pub duration_ms: Option<u64>,
    /// Long-form content that gets the raised duration cap.
    #[serde(default)]
    pub feature: bool,
}

/// Parameters of a set selection.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SelectionQuery {
    pub count: usize,
    pub exclude_names: Vec<String>,
    /// Empty means any genre.
    pub genres: Vec<String>,
    /// Soft preference; matching tracks come first.
    pub preferred: Vec<String>,
}

/// The external track catalog.
#[async_trait]
pub trait TrackCatalog: Send + Sync {
    async fn select_tracks(&self, query: &SelectionQuery) -> Result<Vec<Track>>;

    async fn random_tracks(
        &self,
        count: usize,
        exclude_keys: &[String],
        genres: &[String],
    ) -> Result<Vec<Track>>;

    async fn resolve_by_name(&self, name: &str) -> Result<Option<Track>>;
}
