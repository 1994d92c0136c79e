use std::time::Duration;

use thiserror::Error;

/// Crate-wide error type.
///
/// Nothing in the show loop surfaces these to an operator: the scheduler,
/// watchdog and engine log them and fall back (local pool, next candidate,
/// skipped narration). They exist so the leaves can report *what* failed.
#[derive(Debug, Error)]
pub enum Error {
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("Catalog error: {0}")]
    Catalog(String),

    #[error("Catalog request timed out after {0:?}")]
    CatalogTimeout(Duration),

    #[error("Announcement error: {0}")]
    Announcement(String),

    #[error("Audio output error: {0}")]
    AudioOutput(String),

    #[error("Audio decode error: {0}")]
    Decode(String),

    #[error("Invalid rotation state: {0}")]
    InvalidState(String),

    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("File I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Command feed error: {0}")]
    Feed(String),
}

pub type Result<T> = std::result::Result<T, Error>;
