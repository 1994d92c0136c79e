use std::{
    collections::HashMap,
    path::{Path, PathBuf},
    time::Duration,
};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;

use crate::error::{Error, Result};

/// Response header carrying the narration length, when the gateway knows it.
const DURATION_HEADER: &str = "x-duration-ms";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AnnouncementKind {
    /// Opening of the rotation.
    Intro,
    /// Between songs of the same performer.
    Round,
    /// A performer leaves and a break follows.
    Outro,
    /// Outgoing performer hands over to the incoming one.
    Transition,
}

impl std::fmt::Display for AnnouncementKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            AnnouncementKind::Intro => write!(f, "intro"),
            AnnouncementKind::Round => write!(f, "round"),
            AnnouncementKind::Outro => write!(f, "outro"),
            AnnouncementKind::Transition => write!(f, "transition"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AnnouncementRequest {
    pub kind: AnnouncementKind,
    pub performer: String,
    pub next_performer: Option<String>,
    pub round: u32,
    pub energy_level: u8,
}

impl AnnouncementRequest {
    /// Stable cache key over (kind, names, energy level).
    pub fn cache_key(&self) -> String {
        let names = match &self.next_performer {
            Some(next) => format!("{}-{}", self.performer, next),
            None => self.performer.clone(),
        };
        let raw = format!("{}-{}-e{}", self.kind, names, self.energy_level);
        raw.chars()
            .map(|c| if c.is_ascii_alphanumeric() || c == '-' { c.to_ascii_lowercase() } else { '_' })
            .collect()
    }
}

/// A playable narration clip.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AnnouncementAsset {
    pub locator: String,
    pub duration_ms: Option<u64>,
}

/// Source of narration audio. Calls may be slow or never succeed; callers
/// bound them with their own timeout.
#[async_trait]
pub trait AnnouncementGateway: Send + Sync {
    async fn announcement_asset(&self, request: &AnnouncementRequest) -> Result<AnnouncementAsset>;
}

// ── HTTP gateway with asset cache ────────────────────────────────────────────

/// Fetches narration over HTTP (`POST /announcements`) and caches the audio
/// on disk, keyed by [`AnnouncementRequest::cache_key`].
pub struct HttpAnnouncer {
    base_url: String,
    client: reqwest::Client,
    cache_dir: PathBuf,
    cache: Mutex<HashMap<String, AnnouncementAsset>>,
}

impl HttpAnnouncer {
    pub fn new(base_url: &str, cache_dir: impl Into<PathBuf>, timeout: Duration) -> Result<Self> {
        let cache_dir = cache_dir.into();
        std::fs::create_dir_all(&cache_dir)?;
        Ok(Self {
            base_url: base_url.trim_end_matches('/').to_string(),
            client: reqwest::Client::builder().timeout(timeout).build()?,
            cache_dir,
            cache: Mutex::new(HashMap::new()),
        })
    }

    fn cache_path(&self, key: &str) -> PathBuf {
        self.cache_dir.join(format!("{key}.mp3"))
    }

    async fn fetch(&self, request: &AnnouncementRequest, path: &Path) -> Result<AnnouncementAsset> {
        let resp = self
            .client
            .post(format!("{}/announcements", self.base_url))
            .json(request)
            .send()
            .await?;
        if !resp.status().is_success() {
            return Err(Error::Announcement(format!(
                "{} announcement: HTTP {}",
                request.kind,
                resp.status()
            )));
        }
        let duration_ms = resp
            .headers()
            .get(DURATION_HEADER)
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.parse::<u64>().ok());
        let bytes = resp.bytes().await?;
        if bytes.is_empty() {
            return Err(Error::Announcement(format!("{} announcement: empty body", request.kind)));
        }
        tokio::fs::write(path, &bytes).await?;
        Ok(AnnouncementAsset {
            locator: path.to_string_lossy().into_owned(),
            duration_ms,
        })
    }
}

#[async_trait]
impl AnnouncementGateway for HttpAnnouncer {
    async fn announcement_asset(&self, request: &AnnouncementRequest) -> Result<AnnouncementAsset> {
        let key = request.cache_key();
        if let Some(hit) = self.cache.lock().await.get(&key) {
            return Ok(hit.clone());
        }

        let path = self.cache_path(&key);
        let asset = if tokio::fs::try_exists(&path).await.unwrap_or(false) {
            log::debug!("Announcement {key} served from disk cache");
            AnnouncementAsset {
                locator: path.to_string_lossy().into_owned(),
                duration_ms: None,
            }
        } else {
            let asset = self.fetch(request, &path).await?;
            log::info!("Announcement {key} fetched");
            asset
        };

        self.cache.lock().await.insert(key, asset.clone());
        Ok(asset)
    }
}
