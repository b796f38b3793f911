//! Settings database operations
//!
//! Key-value accessors over the `settings` table. Stage timeout overrides stored here
//! take priority over environment and TOML configuration.

use sqlx::{Pool, Sqlite};
use spk_common::db::init::DEFAULT_MAX_LOCK_WAIT_MS;
use spk_common::events::StageName;
use spk_common::{Error, Result};
use std::collections::HashMap;
use std::time::Duration;

/// Settings key holding the timeout override for one stage
pub fn stage_timeout_key(stage: StageName) -> String {
    format!("sa_stage_timeout_ms.{}", stage)
}

/// Upper bound for retried writes (`sa_database_max_lock_wait_ms`)
pub async fn get_max_lock_wait_ms(db: &Pool<Sqlite>) -> Result<u64> {
    get_setting::<u64>(db, "sa_database_max_lock_wait_ms")
        .await
        .map(|opt| opt.unwrap_or(DEFAULT_MAX_LOCK_WAIT_MS as u64))
}

/// Stage timeout overrides present in the database
pub async fn get_stage_timeout_overrides(db: &Pool<Sqlite>) -> Result<HashMap<StageName, Duration>> {
    let mut overrides = HashMap::new();
    for stage in StageName::ALL {
        if let Some(ms) = get_setting::<u64>(db, &stage_timeout_key(stage)).await? {
            overrides.insert(stage, Duration::from_millis(ms));
        }
    }
    Ok(overrides)
}

pub async fn set_stage_timeout(db: &Pool<Sqlite>, stage: StageName, timeout: Duration) -> Result<()> {
    set_setting(db, &stage_timeout_key(stage), timeout.as_millis()).await
}

/// Generic setting getter; NULL values read as unset
pub async fn get_setting<T>(db: &Pool<Sqlite>, key: &str) -> Result<Option<T>>
where
    T: std::str::FromStr,
    T::Err: std::fmt::Display,
{
    let row: Option<(Option<String>,)> = sqlx::query_as("SELECT value FROM settings WHERE key = ?")
        .bind(key)
        .fetch_optional(db)
        .await
        .map_err(Error::Database)?;

    match row.and_then(|(value,)| value) {
        Some(value) => {
            let parsed = value
                .trim()
                .parse::<T>()
                .map_err(|e| Error::Config(format!("Parse setting '{}' failed: {}", key, e)))?;
            Ok(Some(parsed))
        }
        None => Ok(None),
    }
}

/// Generic setting setter
pub async fn set_setting<T>(db: &Pool<Sqlite>, key: &str, value: T) -> Result<()>
where
    T: std::fmt::Display,
{
    sqlx::query(
        "INSERT INTO settings (key, value) VALUES (?, ?)
         ON CONFLICT(key) DO UPDATE SET value = excluded.value, updated_at = CURRENT_TIMESTAMP",
    )
    .bind(key)
    .bind(value.to_string())
    .execute(db)
    .await
    .map_err(Error::Database)?;

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    async fn setup_test_db() -> (TempDir, Pool<Sqlite>) {
        let temp_dir = TempDir::new().unwrap();
        let pool = spk_common::db::init_database(&temp_dir.path().join("spk.db"))
            .await
            .unwrap();
        (temp_dir, pool)
    }

    #[tokio::test]
    async fn test_missing_setting_is_none() {
        let (_dir, db) = setup_test_db().await;
        let value: Option<u64> = get_setting(&db, "does_not_exist").await.unwrap();
        assert_eq!(value, None);
    }

    #[tokio::test]
    async fn test_set_then_get_overwrites() {
        let (_dir, db) = setup_test_db().await;
        set_setting(&db, "sa_test_key", 10).await.unwrap();
        set_setting(&db, "sa_test_key", 20).await.unwrap();
        let value: Option<u32> = get_setting(&db, "sa_test_key").await.unwrap();
        assert_eq!(value, Some(20));
    }

    #[tokio::test]
    async fn test_unparseable_setting_is_config_error() {
        let (_dir, db) = setup_test_db().await;
        set_setting(&db, "sa_test_key", "not-a-number").await.unwrap();
        let result: Result<Option<u64>> = get_setting(&db, "sa_test_key").await;
        assert!(matches!(result, Err(Error::Config(_))));
    }

    #[tokio::test]
    async fn test_stage_timeout_overrides() {
        let (_dir, db) = setup_test_db().await;
        assert!(get_stage_timeout_overrides(&db).await.unwrap().is_empty());

        set_stage_timeout(&db, StageName::Questions, Duration::from_secs(3))
            .await
            .unwrap();

        let overrides = get_stage_timeout_overrides(&db).await.unwrap();
        assert_eq!(overrides.len(), 1);
        assert_eq!(overrides.get(&StageName::Questions), Some(&Duration::from_secs(3)));
    }

    #[tokio::test]
    async fn test_max_lock_wait_default() {
        let (_dir, db) = setup_test_db().await;
        assert_eq!(get_max_lock_wait_ms(&db).await.unwrap(), 5000);
    }
}
