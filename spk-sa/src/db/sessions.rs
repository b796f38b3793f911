//! Session database operations
//!
//! Status changes are compare-and-set on the expected old status, so two writers can
//! never both move a session out of the same state. Writes go through
//! [`retry_on_lock`] to absorb transient lock contention.

use chrono::Utc;
use sqlx::{sqlite::SqliteRow, Row, SqlitePool};
use spk_common::events::SessionStatus;
use spk_common::{Error, Result};
use uuid::Uuid;

use super::parse_timestamp;
use super::settings::get_max_lock_wait_ms;
use crate::models::Session;
use crate::utils::retry_on_lock;

const SESSION_COLUMNS: &str = "id, training_id, status, audio_ref, duration_seconds, \
                               progress, message, created_at, updated_at";

/// Insert a new session
pub async fn save_session(pool: &SqlitePool, session: &Session) -> Result<()> {
    let id = session.id.to_string();
    let status = session.status.as_str();
    let created_at = session.created_at.to_rfc3339();
    let updated_at = session.updated_at.to_rfc3339();
    let progress = session.progress as i64;

    let max_wait_ms = get_max_lock_wait_ms(pool).await?;

    retry_on_lock("save_session", max_wait_ms, || async {
        sqlx::query(
            r#"
            INSERT INTO sessions (
                id, training_id, status, audio_ref, duration_seconds,
                progress, message, created_at, updated_at
            ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(&id)
        .bind(&session.training_id)
        .bind(status)
        .bind(&session.audio_ref)
        .bind(session.duration_seconds)
        .bind(progress)
        .bind(&session.message)
        .bind(&created_at)
        .bind(&updated_at)
        .execute(pool)
        .await
        .map_err(Error::Database)?;

        Ok(())
    })
    .await
}

/// Load one session
pub async fn load_session(pool: &SqlitePool, session_id: Uuid) -> Result<Option<Session>> {
    let sql = format!("SELECT {} FROM sessions WHERE id = ?", SESSION_COLUMNS);
    let row = sqlx::query(&sql)
        .bind(session_id.to_string())
        .fetch_optional(pool)
        .await?;

    row.map(|row| session_from_row(&row)).transpose()
}

/// Sessions of one training, oldest first
pub async fn list_sessions_for_training(pool: &SqlitePool, training_id: &str) -> Result<Vec<Session>> {
    let sql = format!(
        "SELECT {} FROM sessions WHERE training_id = ? ORDER BY created_at ASC",
        SESSION_COLUMNS
    );
    let rows = sqlx::query(&sql).bind(training_id).fetch_all(pool).await?;

    rows.iter().map(session_from_row).collect()
}

/// Sessions currently in `status`
pub async fn list_sessions_with_status(pool: &SqlitePool, status: SessionStatus) -> Result<Vec<Session>> {
    let sql = format!("SELECT {} FROM sessions WHERE status = ?", SESSION_COLUMNS);
    let rows = sqlx::query(&sql).bind(status.as_str()).fetch_all(pool).await?;

    rows.iter().map(session_from_row).collect()
}

/// Compare-and-set the session status
///
/// Returns `Ok(false)` when the session is no longer in `expected` (another writer got
/// there first). An edge the state machine forbids is an error.
pub async fn transition_status(
    pool: &SqlitePool,
    session_id: Uuid,
    expected: SessionStatus,
    new_status: SessionStatus,
    message: &str,
) -> Result<bool> {
    transition_status_at(pool, session_id, expected, new_status, message, None).await
}

/// [`transition_status`] that also raises the progress snapshot in the same write
pub async fn transition_status_at(
    pool: &SqlitePool,
    session_id: Uuid,
    expected: SessionStatus,
    new_status: SessionStatus,
    message: &str,
    progress: Option<u8>,
) -> Result<bool> {
    if !expected.can_transition_to(new_status) {
        return Err(Error::InvalidTransition {
            from: expected.to_string(),
            to: new_status.to_string(),
        });
    }

    let id = session_id.to_string();
    let now = Utc::now().to_rfc3339();
    let max_wait_ms = get_max_lock_wait_ms(pool).await?;

    let rows = retry_on_lock("transition_status", max_wait_ms, || async {
        let result = sqlx::query(
            r#"
            UPDATE sessions
            SET status = ?, message = ?, progress = COALESCE(MAX(progress, ?), progress), updated_at = ?
            WHERE id = ? AND status = ?
            "#,
        )
        .bind(new_status.as_str())
        .bind(message)
        .bind(progress.map(i64::from))
        .bind(&now)
        .bind(&id)
        .bind(expected.as_str())
        .execute(pool)
        .await
        .map_err(Error::Database)?;

        Ok(result.rows_affected())
    })
    .await?;

    if rows == 1 {
        tracing::debug!(
            session_id = %session_id,
            from = %expected,
            to = %new_status,
            "Session status changed"
        );
    }

    Ok(rows == 1)
}

/// Record stored audio and move the session to `uploaded`
///
/// Only sessions still awaiting audio accept an upload; returns `Ok(false)` otherwise.
pub async fn attach_audio(
    pool: &SqlitePool,
    session_id: Uuid,
    audio_ref: &str,
    duration_seconds: Option<f64>,
) -> Result<bool> {
    let id = session_id.to_string();
    let now = Utc::now().to_rfc3339();
    let max_wait_ms = get_max_lock_wait_ms(pool).await?;

    let rows = retry_on_lock("attach_audio", max_wait_ms, || async {
        let result = sqlx::query(
            r#"
            UPDATE sessions
            SET status = 'uploaded', audio_ref = ?, duration_seconds = ?,
                progress = 0, message = 'Audio uploaded', updated_at = ?
            WHERE id = ? AND status IN ('initialized', 'recording')
            "#,
        )
        .bind(audio_ref)
        .bind(duration_seconds)
        .bind(&now)
        .bind(&id)
        .execute(pool)
        .await
        .map_err(Error::Database)?;

        Ok(result.rows_affected())
    })
    .await?;

    Ok(rows == 1)
}

/// Persist the latest broadcast snapshot (progress never moves backwards)
pub async fn update_snapshot(pool: &SqlitePool, session_id: Uuid, progress: u8, message: &str) -> Result<()> {
    let id = session_id.to_string();
    let now = Utc::now().to_rfc3339();
    let max_wait_ms = get_max_lock_wait_ms(pool).await?;

    retry_on_lock("update_snapshot", max_wait_ms, || async {
        sqlx::query(
            "UPDATE sessions SET progress = MAX(progress, ?), message = ?, updated_at = ? WHERE id = ?",
        )
        .bind(progress as i64)
        .bind(message)
        .bind(&now)
        .bind(&id)
        .execute(pool)
        .await
        .map_err(Error::Database)?;

        Ok(())
    })
    .await
}

/// Delete a session; its stage results go with it
pub async fn delete_session(pool: &SqlitePool, session_id: Uuid) -> Result<bool> {
    let id = session_id.to_string();
    let max_wait_ms = get_max_lock_wait_ms(pool).await?;

    retry_on_lock("delete_session", max_wait_ms, || async {
        let mut tx = pool.begin().await.map_err(Error::Database)?;
        sqlx::query("DELETE FROM stage_results WHERE session_id = ?")
            .bind(&id)
            .execute(&mut *tx)
            .await
            .map_err(Error::Database)?;
        let result = sqlx::query("DELETE FROM sessions WHERE id = ?")
            .bind(&id)
            .execute(&mut *tx)
            .await
            .map_err(Error::Database)?;
        tx.commit().await.map_err(Error::Database)?;

        Ok(result.rows_affected() == 1)
    })
    .await
}

fn session_from_row(row: &SqliteRow) -> Result<Session> {
    let id: String = row.get("id");
    let id = Uuid::parse_str(&id)
        .map_err(|e| Error::Internal(format!("Failed to parse session id: {}", e)))?;

    let status: String = row.get("status");
    let status: SessionStatus = status.parse()?;

    let progress: i64 = row.get("progress");
    let created_at: String = row.get("created_at");
    let updated_at: String = row.get("updated_at");

    Ok(Session {
        id,
        training_id: row.get("training_id"),
        status,
        audio_ref: row.get("audio_ref"),
        duration_seconds: row.get("duration_seconds"),
        progress: progress.clamp(0, 100) as u8,
        message: row.get("message"),
        created_at: parse_timestamp(&created_at, "created_at")?,
        updated_at: parse_timestamp(&updated_at, "updated_at")?,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    async fn setup_test_db() -> (TempDir, SqlitePool) {
        let temp_dir = TempDir::new().unwrap();
        let pool = spk_common::db::init_database(&temp_dir.path().join("spk.db"))
            .await
            .unwrap();
        (temp_dir, pool)
    }

    #[tokio::test]
    async fn test_save_and_load_roundtrip() {
        let (_dir, pool) = setup_test_db().await;
        let session = Session::new("training-1");
        save_session(&pool, &session).await.unwrap();

        let loaded = load_session(&pool, session.id).await.unwrap().unwrap();
        assert_eq!(loaded.id, session.id);
        assert_eq!(loaded.training_id, "training-1");
        assert_eq!(loaded.status, SessionStatus::Initialized);
        assert_eq!(loaded.message, session.message);
    }

    #[tokio::test]
    async fn test_load_missing_session() {
        let (_dir, pool) = setup_test_db().await;
        assert!(load_session(&pool, Uuid::new_v4()).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_transition_is_compare_and_set() {
        let (_dir, pool) = setup_test_db().await;
        let session = Session::new("training-1");
        save_session(&pool, &session).await.unwrap();
        assert!(attach_audio(&pool, session.id, "a.wav", Some(12.0)).await.unwrap());

        let first = transition_status(
            &pool,
            session.id,
            SessionStatus::Uploaded,
            SessionStatus::Processing,
            "Analysis started",
        )
        .await
        .unwrap();
        let second = transition_status(
            &pool,
            session.id,
            SessionStatus::Uploaded,
            SessionStatus::Processing,
            "Analysis started",
        )
        .await
        .unwrap();

        assert!(first);
        assert!(!second);
    }

    #[tokio::test]
    async fn test_terminal_transition_raises_progress_in_same_write() {
        let (_dir, pool) = setup_test_db().await;
        let session = Session::new("training-1");
        save_session(&pool, &session).await.unwrap();
        assert!(attach_audio(&pool, session.id, "a.wav", None).await.unwrap());
        assert!(transition_status(&pool, session.id, SessionStatus::Uploaded, SessionStatus::Processing, "")
            .await
            .unwrap());
        update_snapshot(&pool, session.id, 95, "Generating feedback").await.unwrap();

        assert!(transition_status_at(
            &pool,
            session.id,
            SessionStatus::Processing,
            SessionStatus::Completed,
            "done",
            Some(100),
        )
        .await
        .unwrap());

        let loaded = load_session(&pool, session.id).await.unwrap().unwrap();
        assert_eq!(loaded.status, SessionStatus::Completed);
        assert_eq!(loaded.progress, 100);

        // Without a progress the snapshot is left alone
        let other = Session::new("training-1");
        save_session(&pool, &other).await.unwrap();
        assert!(transition_status(&pool, other.id, SessionStatus::Initialized, SessionStatus::Recording, "")
            .await
            .unwrap());
        assert_eq!(load_session(&pool, other.id).await.unwrap().unwrap().progress, 0);
    }

    #[tokio::test]
    async fn test_forbidden_edge_is_error() {
        let (_dir, pool) = setup_test_db().await;
        let result = transition_status(
            &pool,
            Uuid::new_v4(),
            SessionStatus::Completed,
            SessionStatus::Processing,
            "",
        )
        .await;
        assert!(matches!(result, Err(Error::InvalidTransition { .. })));
    }

    #[tokio::test]
    async fn test_attach_audio_only_once() {
        let (_dir, pool) = setup_test_db().await;
        let session = Session::new("training-1");
        save_session(&pool, &session).await.unwrap();

        assert!(attach_audio(&pool, session.id, "a.wav", None).await.unwrap());
        assert!(!attach_audio(&pool, session.id, "b.wav", None).await.unwrap());

        let loaded = load_session(&pool, session.id).await.unwrap().unwrap();
        assert_eq!(loaded.audio_ref.as_deref(), Some("a.wav"));
        assert_eq!(loaded.status, SessionStatus::Uploaded);
    }

    #[tokio::test]
    async fn test_snapshot_progress_is_monotonic() {
        let (_dir, pool) = setup_test_db().await;
        let session = Session::new("training-1");
        save_session(&pool, &session).await.unwrap();

        update_snapshot(&pool, session.id, 45, "Metrics ready").await.unwrap();
        update_snapshot(&pool, session.id, 30, "Late message").await.unwrap();

        let loaded = load_session(&pool, session.id).await.unwrap().unwrap();
        assert_eq!(loaded.progress, 45);
        assert_eq!(loaded.message, "Late message");
    }

    #[tokio::test]
    async fn test_list_and_delete() {
        let (_dir, pool) = setup_test_db().await;
        let a = Session::new("training-1");
        let b = Session::new("training-1");
        let other = Session::new("training-2");
        for s in [&a, &b, &other] {
            save_session(&pool, s).await.unwrap();
        }

        assert_eq!(list_sessions_for_training(&pool, "training-1").await.unwrap().len(), 2);
        assert!(delete_session(&pool, a.id).await.unwrap());
        assert!(!delete_session(&pool, a.id).await.unwrap());
        assert_eq!(list_sessions_for_training(&pool, "training-1").await.unwrap().len(), 1);
        assert_eq!(
            list_sessions_with_status(&pool, SessionStatus::Initialized)
                .await
                .unwrap()
                .len(),
            2
        );
    }
}
