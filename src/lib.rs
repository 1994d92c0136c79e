pub mod audio;
pub mod catalog;
pub mod clock;
pub mod config;
pub mod db;
pub mod error;
pub mod events;
pub mod gateway;
pub mod scheduler;
pub mod state;

#[cfg(test)]
pub(crate) mod testing;

use std::{
    path::{Path, PathBuf},
    sync::Arc,
    time::Duration,
};

use audio::CpalOutput;
use catalog::http::HttpCatalog;
use clock::TokioClock;
use db::LocalStore;
use error::{Error, Result};
use gateway::announcer::{AnnouncementGateway, HttpAnnouncer};
use state::{AppState, Backends};

/// Build the runtime, start the show and block until Ctrl-C.
pub fn run() -> Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()?;
    runtime.block_on(serve())
}

async fn serve() -> Result<()> {
    let app_data_dir = compute_app_data_dir();
    std::fs::create_dir_all(&app_data_dir)?;

    // ── Configuration ────────────────────────────────────────────────────────
    let config_path = std::env::var("SHOWFLOOR_CONFIG")
        .map(PathBuf::from)
        .unwrap_or_else(|_| app_data_dir.join("showfloor.json"));
    let config = config::load_config(&config_path)?;
    log::info!("Loaded config from {}", config_path.display());

    // ── Backends ─────────────────────────────────────────────────────────────
    let db_path = resolve(&app_data_dir, &config.database_path);
    let store = LocalStore::open(&db_path.to_string_lossy()).await?;

    let output = CpalOutput::start(config.engine.master_volume)?;

    let request_timeout = Duration::from_millis(config.scheduler.catalog_timeout_ms);
    let catalog = HttpCatalog::new(&config.catalog_url, request_timeout)?;

    let announcer: Option<Arc<dyn AnnouncementGateway>> = match &config.announcer_url {
        Some(url) if config.scheduler.announcements_enabled => {
            let cache_dir = resolve(&app_data_dir, &config.announcement_cache_dir);
            let timeout = Duration::from_millis(config.scheduler.announcement_timeout_ms);
            Some(Arc::new(HttpAnnouncer::new(url, cache_dir, timeout)?))
        }
        _ => {
            log::info!("Announcements disabled");
            None
        }
    };

    // ── Show ─────────────────────────────────────────────────────────────────
    let app = AppState::launch(
        config,
        Backends {
            output: Arc::new(output),
            catalog: Arc::new(catalog),
            announcer,
            store: Arc::new(store),
            clock: Arc::new(TokioClock::new()),
        },
    )
    .await;

    tokio::signal::ctrl_c()
        .await
        .map_err(|e| Error::Config(format!("cannot listen for Ctrl-C: {e}")))?;
    log::info!("Ctrl-C received, shutting down");
    app.shutdown().await;
    Ok(())
}

// ── Helpers ──────────────────────────────────────────────────────────────────

/// Join `path` onto the data dir unless it is already absolute.
fn resolve(app_data_dir: &Path, path: &str) -> PathBuf {
    let p = Path::new(path);
    if p.is_absolute() {
        p.to_path_buf()
    } else {
        app_data_dir.join(p)
    }
}

/// Return the platform-specific application data directory.
fn compute_app_data_dir() -> PathBuf {
    const IDENTIFIER: &str = "net.showfloor.player";

    #[cfg(target_os = "macos")]
    {
        let home = std::env::var("HOME").unwrap_or_else(|_| ".".into());
        PathBuf::from(format!("{home}/Library/Application Support/{IDENTIFIER}"))
    }

    #[cfg(target_os = "windows")]
    {
        let appdata = std::env::var("APPDATA").unwrap_or_else(|_| ".".into());
        PathBuf::from(format!("{appdata}\\{IDENTIFIER}"))
    }

    #[cfg(not(any(target_os = "macos", target_os = "windows")))]
    {
        let home = std::env::var("HOME").unwrap_or_else(|_| ".".into());
        PathBuf::from(format!("{home}/.config/{IDENTIFIER}"))
    }
}
