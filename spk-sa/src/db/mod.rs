//! Database access for spk-sa
//!
//! Free functions over a shared `SqlitePool`; the schema itself is created by
//! `spk_common::db::init_database`.

pub mod sessions;
pub mod settings;
pub mod stage_results;

use sqlx::SqlitePool;
use spk_common::Result;
use std::path::Path;

/// Open (or create) the service database and ensure its schema
pub async fn init_database_pool(db_path: &Path) -> Result<SqlitePool> {
    let pool = spk_common::db::init_database(db_path).await?;
    tracing::info!("Database tables ready (settings, sessions, stage_results)");
    Ok(pool)
}

pub(crate) fn parse_timestamp(value: &str, column: &str) -> Result<chrono::DateTime<chrono::Utc>> {
    chrono::DateTime::parse_from_rfc3339(value)
        .map(|dt| dt.with_timezone(&chrono::Utc))
        .map_err(|e| spk_common::Error::Internal(format!("Failed to parse {}: {}", column, e)))
}
