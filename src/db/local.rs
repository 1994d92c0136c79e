use std::collections::HashMap;

use async_trait::async_trait;
use sqlx::{sqlite::SqlitePool, Row};

use super::{RotationSnapshot, ShowStore};
use crate::{error::Result, scheduler::rotation::PerformerId};

/// Initialise (or migrate) the local SQLite database at `db_path`.
/// Creates all tables if they don't exist.
pub async fn init_db(db_path: &str) -> Result<SqlitePool> {
    let url = format!("sqlite:{db_path}?mode=rwc");
    let pool = SqlitePool::connect(&url).await?;
    run_migrations(&pool).await?;
    Ok(pool)
}

async fn run_migrations(pool: &SqlitePool) -> Result<()> {
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS rotation_state (
            id            INTEGER PRIMARY KEY DEFAULT 1,
            order_json    TEXT    NOT NULL DEFAULT '[]',
            current_index INTEGER NOT NULL DEFAULT 0,
            updated_at    INTEGER NOT NULL DEFAULT (strftime('%s','now'))
        );

        CREATE TABLE IF NOT EXISTS track_cooldowns (
            track_name     TEXT    PRIMARY KEY,
            last_played_ms INTEGER NOT NULL
        );
        "#,
    )
    .execute(pool)
    .await?;
    Ok(())
}

/// SQLite-backed [`ShowStore`].
#[derive(Clone)]
pub struct LocalStore {
    pool: SqlitePool,
}

impl LocalStore {
    pub async fn open(db_path: &str) -> Result<Self> {
        Ok(Self {
            pool: init_db(db_path).await?,
        })
    }
}

#[async_trait]
impl ShowStore for LocalStore {
    async fn save_rotation_state(&self, order: &[PerformerId], current_index: usize) -> Result<()> {
        let order_json = serde_json::to_string(order)?;
        sqlx::query(
            r#"
            INSERT INTO rotation_state (id, order_json, current_index, updated_at)
            VALUES (1, ?, ?, strftime('%s','now'))
            ON CONFLICT(id) DO UPDATE SET
                order_json = excluded.order_json,
                current_index = excluded.current_index,
                updated_at = excluded.updated_at
            "#,
        )
        .bind(order_json)
        .bind(current_index as i64)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn load_rotation_state(&self) -> Result<Option<RotationSnapshot>> {
        let row = sqlx::query("SELECT order_json, current_index FROM rotation_state WHERE id = 1")
            .fetch_optional(&self.pool)
            .await?;
        let Some(row) = row else {
            return Ok(None);
        };
        let order: Vec<PerformerId> = serde_json::from_str(&row.get::<String, _>("order_json"))?;
        let current_index = row.get::<i64, _>("current_index").max(0) as usize;
        Ok(Some(RotationSnapshot {
            order,
            current_index,
        }))
    }

    async fn save_cooldown(&self, track_name: &str, played_at_ms: u64) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO track_cooldowns (track_name, last_played_ms) VALUES (?, ?)
            ON CONFLICT(track_name) DO UPDATE SET last_played_ms = excluded.last_played_ms
            "#,
        )
        .bind(track_name)
        .bind(played_at_ms as i64)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn load_cooldowns(&self) -> Result<HashMap<String, u64>> {
        let rows = sqlx::query("SELECT track_name, last_played_ms FROM track_cooldowns")
            .fetch_all(&self.pool)
            .await?;
        Ok(rows
            .into_iter()
            .map(|r| {
                (
                    r.get::<String, _>("track_name"),
                    r.get::<i64, _>("last_played_ms").max(0) as u64,
                )
            })
            .collect())
    }
}
