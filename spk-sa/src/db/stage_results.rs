//! Stage result database operations
//!
//! Rows are insert-only: the primary key (session_id, stage) plus `ON CONFLICT DO
//! NOTHING` keeps the first resolution of a stage and ignores every later one.

use sqlx::{Row, SqlitePool};
use spk_common::events::{StageName, StageStatus};
use spk_common::{Error, Result};
use uuid::Uuid;

use super::parse_timestamp;
use super::settings::get_max_lock_wait_ms;
use crate::models::StageResult;
use crate::utils::retry_on_lock;

/// Insert a resolved result; `Ok(false)` when the stage was already resolved
pub async fn insert_stage_result(pool: &SqlitePool, result: &StageResult) -> Result<bool> {
    if !result.status.is_resolved() {
        return Err(Error::InvalidInput(format!(
            "Stage {} is not resolved",
            result.stage
        )));
    }

    let session_id = result.session_id.to_string();
    let payload = result
        .payload
        .as_ref()
        .map(serde_json::to_string)
        .transpose()
        .map_err(|e| Error::Internal(format!("Failed to serialize payload: {}", e)))?;
    let completed_at = result.completed_at.to_rfc3339();
    let max_wait_ms = get_max_lock_wait_ms(pool).await?;

    let rows = retry_on_lock("insert_stage_result", max_wait_ms, || async {
        let outcome = sqlx::query(
            r#"
            INSERT INTO stage_results (session_id, stage, status, payload, error, completed_at)
            VALUES (?, ?, ?, ?, ?, ?)
            ON CONFLICT(session_id, stage) DO NOTHING
            "#,
        )
        .bind(&session_id)
        .bind(result.stage.as_str())
        .bind(result.status.as_str())
        .bind(&payload)
        .bind(&result.error)
        .bind(&completed_at)
        .execute(pool)
        .await
        .map_err(Error::Database)?;

        Ok(outcome.rows_affected())
    })
    .await?;

    Ok(rows == 1)
}

/// All stored results of a session in canonical stage order
pub async fn load_stage_results(pool: &SqlitePool, session_id: Uuid) -> Result<Vec<StageResult>> {
    let rows = sqlx::query(
        "SELECT stage, status, payload, error, completed_at FROM stage_results WHERE session_id = ?",
    )
    .bind(session_id.to_string())
    .fetch_all(pool)
    .await?;

    let mut results = Vec::with_capacity(rows.len());
    for row in rows {
        let stage: String = row.get("stage");
        let status: String = row.get("status");
        let payload: Option<String> = row.get("payload");
        let completed_at: String = row.get("completed_at");

        let payload = payload
            .map(|p| serde_json::from_str(&p))
            .transpose()
            .map_err(|e| Error::Internal(format!("Failed to deserialize payload: {}", e)))?;

        results.push(StageResult {
            session_id,
            stage: stage.parse::<StageName>()?,
            status: status.parse::<StageStatus>()?,
            payload,
            error: row.get("error"),
            completed_at: parse_timestamp(&completed_at, "completed_at")?,
        });
    }

    results.sort_by_key(|r| r.stage);
    Ok(results)
}

/// Remove every stored result of a session
pub async fn delete_stage_results(pool: &SqlitePool, session_id: Uuid) -> Result<u64> {
    let result = sqlx::query("DELETE FROM stage_results WHERE session_id = ?")
        .bind(session_id.to_string())
        .execute(pool)
        .await?;

    Ok(result.rows_affected())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::sessions::save_session;
    use crate::models::Session;
    use serde_json::json;
    use tempfile::TempDir;

    async fn setup() -> (TempDir, SqlitePool, Uuid) {
        let temp_dir = TempDir::new().unwrap();
        let pool = spk_common::db::init_database(&temp_dir.path().join("spk.db"))
            .await
            .unwrap();
        let session = Session::new("training-1");
        save_session(&pool, &session).await.unwrap();
        (temp_dir, pool, session.id)
    }

    #[tokio::test]
    async fn test_first_write_wins() {
        let (_dir, pool, id) = setup().await;

        let first = StageResult::ready(id, StageName::Metrics, json!({"wpm": 120}));
        let second = StageResult::failed(id, StageName::Metrics, "late failure");

        assert!(insert_stage_result(&pool, &first).await.unwrap());
        assert!(!insert_stage_result(&pool, &second).await.unwrap());

        let stored = load_stage_results(&pool, id).await.unwrap();
        assert_eq!(stored.len(), 1);
        assert_eq!(stored[0].status, StageStatus::Ready);
        assert_eq!(stored[0].payload, Some(json!({"wpm": 120})));
    }

    #[tokio::test]
    async fn test_results_load_in_stage_order() {
        let (_dir, pool, id) = setup().await;

        for stage in [StageName::Feedback, StageName::Transcription, StageName::Metrics] {
            insert_stage_result(&pool, &StageResult::ready(id, stage, json!({})))
                .await
                .unwrap();
        }

        let stages: Vec<StageName> = load_stage_results(&pool, id)
            .await
            .unwrap()
            .into_iter()
            .map(|r| r.stage)
            .collect();
        assert_eq!(
            stages,
            vec![StageName::Transcription, StageName::Metrics, StageName::Feedback]
        );
    }

    #[tokio::test]
    async fn test_delete_stage_results() {
        let (_dir, pool, id) = setup().await;
        insert_stage_result(&pool, &StageResult::failed(id, StageName::Questions, "timeout"))
            .await
            .unwrap();

        assert_eq!(delete_stage_results(&pool, id).await.unwrap(), 1);
        assert!(load_stage_results(&pool, id).await.unwrap().is_empty());
    }
}
