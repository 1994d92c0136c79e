use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::{
    error::{Error, Result},
    scheduler::rotation::{Performer, PerformerId},
};

// ── Selection policy ──────────────────────────────────────────────────────────

/// How a performer's personal playlist influences track selection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum SelectionPolicy {
    /// Playlist tracks are offered to the catalog as a soft preference and
    /// ordered first in the resulting set.
    #[default]
    PlaylistFirst,
    /// Playlists are ignored; sets come from the catalog folders only.
    FoldersOnly,
}

// ── Engine ────────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Standard crossfade window.
    pub crossfade_ms: u64,
    /// Compressed crossfade used when tracks start in quick succession.
    pub rapid_crossfade_ms: u64,
    /// A track started within this long after the previous one is "rapid".
    pub rapid_window_ms: u64,
    /// Ramp used when a switch is requested without crossfade.
    pub cut_fade_ms: u64,
    pub duck_ramp_ms: u64,
    /// Music level while ducked (0.0 – 1.0, relative to master).
    pub duck_level: f32,
    pub max_track_ms: u64,
    /// Cap for tracks flagged as feature content.
    pub max_feature_track_ms: u64,
    pub safety_fade_ms: u64,
    pub ending_soon_lead_ms: u64,
    pub announcement_near_end_ms: u64,
    pub monitor_interval_ms: u64,
    pub ramp_step_ms: u64,
    pub master_volume: f32,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            crossfade_ms: 5_000,
            rapid_crossfade_ms: 1_200,
            rapid_window_ms: 10_000,
            cut_fade_ms: 300,
            duck_ramp_ms: 4_500,
            duck_level: 0.25,
            max_track_ms: 180_000,
            max_feature_track_ms: 3_600_000,
            safety_fade_ms: 5_000,
            ending_soon_lead_ms: 15_000,
            announcement_near_end_ms: 3_000,
            monitor_interval_ms: 250,
            ramp_step_ms: 50,
            master_volume: 1.0,
        }
    }
}

// ── Scheduler ─────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SchedulerConfig {
    /// Default set length; a performer may override it.
    pub songs_per_set: u32,
    pub selection_policy: SelectionPolicy,
    /// Restrict selection to these genres (empty = any).
    pub active_genres: Vec<String>,
    pub cooldown_ms: u64,
    pub catalog_timeout_ms: u64,
    pub announcement_timeout_ms: u64,
    /// Longest the scheduler waits for narration before cutting to the next track.
    pub announcement_overlap_ms: u64,
    pub announcements_enabled: bool,
    /// Energy level passed to the narrator (1 – 5).
    pub energy_level: u8,
    pub stale_transition_ms: u64,
    /// Extra candidates fetched per set, kept for load-failure retries.
    pub spare_tracks: usize,
    /// Size of the random batch tried once a set's candidates are exhausted.
    pub fallback_batch: usize,
    /// Number of tracks seeded into the local fallback pool at launch.
    pub local_pool_size: usize,
    /// Keep music going with random tracks while no rotation is active.
    pub house_music: bool,
    /// Break songs auto-filled after each performer at start (0 = operator only).
    pub auto_break_songs: usize,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            songs_per_set: 3,
            selection_policy: SelectionPolicy::PlaylistFirst,
            active_genres: Vec::new(),
            cooldown_ms: 4 * 60 * 60 * 1000,
            catalog_timeout_ms: 5_000,
            announcement_timeout_ms: 45_000,
            announcement_overlap_ms: 10_000,
            announcements_enabled: true,
            energy_level: 3,
            stale_transition_ms: 30_000,
            spare_tracks: 3,
            fallback_batch: 5,
            local_pool_size: 200,
            house_music: true,
            auto_break_songs: 0,
        }
    }
}

// ── Watchdog ──────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct WatchdogConfig {
    pub enabled: bool,
    pub tick_ms: u64,
    pub silence_threshold_ms: u64,
    pub recovery_batch: usize,
}

impl Default for WatchdogConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            tick_ms: 3_000,
            silence_threshold_ms: 5_000,
            recovery_batch: 5,
        }
    }
}

// ── Top level ─────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ShowConfig {
    pub engine: EngineConfig,
    pub scheduler: SchedulerConfig,
    pub watchdog: WatchdogConfig,
    pub catalog_url: String,
    pub announcer_url: Option<String>,
    /// Where synthesized narration is cached (relative to the data dir if not absolute).
    pub announcement_cache_dir: String,
    pub command_feed_url: Option<String>,
    pub command_feed_token: String,
    /// SQLite file (relative to the data dir if not absolute).
    pub database_path: String,
    /// Initial roster; replaced at runtime through `update_roster` commands.
    pub performers: Vec<Performer>,
    /// Lineup used when there is no persisted rotation to resume.
    pub lineup: Vec<PerformerId>,
    pub auto_start: bool,
}

impl Default for ShowConfig {
    fn default() -> Self {
        Self {
            engine: EngineConfig::default(),
            scheduler: SchedulerConfig::default(),
            watchdog: WatchdogConfig::default(),
            catalog_url: "http://127.0.0.1:8750".to_string(),
            announcer_url: None,
            announcement_cache_dir: "announcements".to_string(),
            command_feed_url: None,
            command_feed_token: String::new(),
            database_path: "showfloor.db".to_string(),
            performers: Vec::new(),
            lineup: Vec::new(),
            auto_start: false,
        }
    }
}

impl ShowConfig {
    /// Clamp values that would break the engine or the state machine.
    pub fn normalized(mut self) -> Self {
        self.scheduler.songs_per_set = self.scheduler.songs_per_set.max(1);
        self.scheduler.energy_level = self.scheduler.energy_level.clamp(1, 5);
        self.engine.duck_level = self.engine.duck_level.clamp(0.0, 1.0);
        self.engine.master_volume = self.engine.master_volume.clamp(0.0, 1.0);
        self.engine.ramp_step_ms = self.engine.ramp_step_ms.max(5);
        self.engine.monitor_interval_ms = self.engine.monitor_interval_ms.max(10);
        self.engine.safety_fade_ms = self.engine.safety_fade_ms.min(self.engine.max_track_ms);
        self.watchdog.tick_ms = self.watchdog.tick_ms.max(100);
        self
    }
}

/// Load the show configuration from a JSON file. A missing file is not an
/// error: the defaults are returned so a bare install still runs.
pub fn load_config(path: &Path) -> Result<ShowConfig> {
    if !path.exists() {
        log::warn!(
            "Config file {} not found, using defaults",
            path.display()
        );
        return Ok(ShowConfig::default());
    }
    let raw = std::fs::read_to_string(path)?;
    parse_config_json(&raw)
}

pub fn parse_config_json(json: &str) -> Result<ShowConfig> {
    let config: ShowConfig = serde_json::from_str(json)
        .map_err(|e| Error::Config(format!("invalid show config: {e}")))?;
    Ok(config.normalized())
}
