//! Stage Cache
//!
//! Memoized stage results keyed by (session, stage), backed by the `stage_results`
//! table. Results are write-once: the first `put` for a key wins and later puts leave
//! the stored tuple untouched. The memo lives in front of the database so that replay to
//! late subscribers does not hit SQLite on every connect.

use sqlx::SqlitePool;
use spk_common::events::StageName;
use spk_common::Result;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::RwLock;
use tracing::debug;
use uuid::Uuid;

use crate::db::stage_results;
use crate::models::StageResult;

#[derive(Clone)]
pub struct StageCache {
    db: SqlitePool,
    memo: Arc<RwLock<HashMap<(Uuid, StageName), StageResult>>>,
}

impl StageCache {
    pub fn new(db: SqlitePool) -> Self {
        Self {
            db,
            memo: Arc::new(RwLock::new(HashMap::new())),
        }
    }

    /// Resolved result of one stage, if any
    pub async fn get(&self, session_id: Uuid, stage: StageName) -> Result<Option<StageResult>> {
        if let Some(result) = self.memo.read().await.get(&(session_id, stage)) {
            return Ok(Some(result.clone()));
        }

        Ok(self
            .load(session_id)
            .await?
            .into_iter()
            .find(|r| r.stage == stage))
    }

    /// Every resolved result of a session in canonical stage order
    pub async fn load(&self, session_id: Uuid) -> Result<Vec<StageResult>> {
        let stored = stage_results::load_stage_results(&self.db, session_id).await?;

        let mut memo = self.memo.write().await;
        for result in &stored {
            memo.entry((session_id, result.stage))
                .or_insert_with(|| result.clone());
        }

        Ok(stored)
    }

    /// Store a resolved result; `false` if the stage already had one
    pub async fn put(&self, result: StageResult) -> Result<bool> {
        let key = (result.session_id, result.stage);
        if self.memo.read().await.contains_key(&key) {
            debug!(
                session_id = %result.session_id,
                stage = %result.stage,
                "Stage already resolved, ignoring write"
            );
            return Ok(false);
        }

        let inserted = stage_results::insert_stage_result(&self.db, &result).await?;
        if inserted {
            self.memo.write().await.entry(key).or_insert(result);
        } else {
            debug!(
                session_id = %result.session_id,
                stage = %result.stage,
                "Stage already persisted, ignoring write"
            );
        }
        Ok(inserted)
    }

    /// Drop memo entries and stored rows of a session
    pub async fn evict(&self, session_id: Uuid) -> Result<()> {
        self.forget(session_id).await;
        stage_results::delete_stage_results(&self.db, session_id).await?;
        Ok(())
    }

    /// Drop memo entries only (rows already gone with the session)
    pub async fn forget(&self, session_id: Uuid) {
        self.memo.write().await.retain(|(id, _), _| *id != session_id);
    }
}
