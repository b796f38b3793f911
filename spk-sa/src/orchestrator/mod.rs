//! Stage Orchestrator
//!
//! Drives one session through the fixed stage graph:
//!
//! ```text
//! transcription → metrics → { pitch_evaluation, questions, feedback }
//! ```
//!
//! At most one run exists per session. Starting is guarded twice: an in-process run
//! registry (held under a mutex while starting) and a compare-and-set of the persisted
//! status `uploaded → processing`. Each stage call has its own timeout and is raced
//! against the session's cancellation token; a failed or timed-out stage becomes an
//! `error` result and still unblocks its dependents. Only a failed transcription is
//! fatal.

pub mod progress;

pub use progress::ProgressTracker;

use futures::future::BoxFuture;
use futures::stream::{FuturesUnordered, StreamExt};
use futures::FutureExt;
use serde_json::{Map, Value};
use sqlx::SqlitePool;
use spk_common::events::{
    EventType, ProgressEvent, SessionStatus, StageName, StageStatus, StageSummary,
};
use spk_common::{Error, Result};
use std::collections::{BTreeMap, HashMap};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tokio::time::error::Elapsed;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::adapter::{AdapterError, MlAdapter, SessionContext};
use crate::broadcaster::Broadcaster;
use crate::cache::StageCache;
use crate::config::ServiceConfig;
use crate::db::{sessions, settings};
use crate::models::{Session, StageResult};

/// Result of a Start request
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StartOutcome {
    /// A run was launched (fresh, or resuming an interrupted one)
    Started,
    /// A run for this session is already live; nothing new was launched
    AlreadyRunning,
    /// Session has no audio yet
    NotReady(SessionStatus),
    /// Session already reached a terminal status
    Finished(SessionStatus),
}

type StageCall = BoxFuture<
    'static,
    (StageName, Duration, std::result::Result<std::result::Result<Value, AdapterError>, Elapsed>),
>;

#[derive(Clone)]
pub struct Orchestrator {
    db: SqlitePool,
    cache: StageCache,
    broadcaster: Broadcaster,
    adapter: Arc<dyn MlAdapter>,
    config: Arc<ServiceConfig>,
    uploads_dir: PathBuf,
    /// Live runs and their cancellation tokens
    runs: Arc<Mutex<HashMap<Uuid, CancellationToken>>>,
}

impl Orchestrator {
    pub fn new(
        db: SqlitePool,
        cache: StageCache,
        broadcaster: Broadcaster,
        adapter: Arc<dyn MlAdapter>,
        config: Arc<ServiceConfig>,
        uploads_dir: PathBuf,
    ) -> Self {
        Self {
            db,
            cache,
            broadcaster,
            adapter,
            config,
            uploads_dir,
            runs: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    /// Start analysis of a session (idempotent)
    pub async fn start(&self, session_id: Uuid) -> Result<StartOutcome> {
        let mut runs = self.runs.lock().await;
        if runs.contains_key(&session_id) {
            debug!(session_id = %session_id, "Start ignored: run already live");
            return Ok(StartOutcome::AlreadyRunning);
        }

        let session = sessions::load_session(&self.db, session_id)
            .await?
            .ok_or_else(|| Error::NotFound(format!("Session not found: {}", session_id)))?;

        let resumed = match session.status {
            SessionStatus::Uploaded => {
                let claimed = sessions::transition_status(
                    &self.db,
                    session_id,
                    SessionStatus::Uploaded,
                    SessionStatus::Processing,
                    "Analysis started",
                )
                .await?;
                if !claimed {
                    // Another writer moved the session first; report what it is now
                    return self.outcome_for_current(session_id).await;
                }
                false
            }
            // Processing with no live run: left over from a previous process
            SessionStatus::Processing => true,
            status if status.awaiting_audio() => return Ok(StartOutcome::NotReady(status)),
            status => return Ok(StartOutcome::Finished(status)),
        };

        let token = CancellationToken::new();
        runs.insert(session_id, token.clone());
        self.broadcaster.open(session_id);
        drop(runs);

        info!(session_id = %session_id, resumed, "Starting analysis pipeline");

        let orchestrator = self.clone();
        let mut session = session;
        session.status = SessionStatus::Processing;
        tokio::spawn(async move {
            orchestrator.run(session, token).await;
        });

        Ok(StartOutcome::Started)
    }

    async fn outcome_for_current(&self, session_id: Uuid) -> Result<StartOutcome> {
        let session = sessions::load_session(&self.db, session_id)
            .await?
            .ok_or_else(|| Error::NotFound(format!("Session not found: {}", session_id)))?;
        Ok(match session.status {
            SessionStatus::Processing => StartOutcome::AlreadyRunning,
            status if status.is_terminal() => StartOutcome::Finished(status),
            status => StartOutcome::NotReady(status),
        })
    }

    /// Whether a run for this session is live in this process
    pub async fn is_running(&self, session_id: Uuid) -> bool {
        self.runs.lock().await.contains_key(&session_id)
    }

    pub async fn running_count(&self) -> usize {
        self.runs.lock().await.len()
    }

    /// Cancel in-flight stage calls of a session; `true` if a run was live
    pub async fn cancel(&self, session_id: Uuid) -> bool {
        cancel_run(&mut *self.runs.lock().await, session_id)
    }

    /// Cancel and fail a processing session with reason "cancelled"
    ///
    /// The run registry stays locked until the session has left `processing`, so a
    /// concurrent Start cannot mistake it for an interrupted run. Returns the session's
    /// status afterwards.
    pub async fn abort(&self, session_id: Uuid) -> Result<SessionStatus> {
        let mut runs = self.runs.lock().await;
        cancel_run(&mut runs, session_id);

        let failed = sessions::transition_status(
            &self.db,
            session_id,
            SessionStatus::Processing,
            SessionStatus::Failed,
            "cancelled",
        )
        .await?;
        drop(runs);

        if failed {
            let progress = self.current_progress(session_id).await;
            self.broadcaster.publish(
                ProgressEvent::new(EventType::Error, session_id, progress, "cancelled")
                    .with_status(SessionStatus::Failed),
            );
            self.broadcaster.close(session_id, progress);
            return Ok(SessionStatus::Failed);
        }

        let session = sessions::load_session(&self.db, session_id)
            .await?
            .ok_or_else(|| Error::NotFound(format!("Session not found: {}", session_id)))?;
        Ok(session.status)
    }

    /// Cancel any live run, close the channel and delete the session with its results
    ///
    /// Returns `false` if there was no such session.
    pub async fn remove(&self, session_id: Uuid) -> Result<bool> {
        let mut runs = self.runs.lock().await;
        if cancel_run(&mut runs, session_id) {
            debug!(session_id = %session_id, "Cancelled live run before delete");
        }
        let progress = self.current_progress(session_id).await;
        let deleted = sessions::delete_session(&self.db, session_id).await?;
        drop(runs);

        self.broadcaster.close(session_id, progress);
        self.cache.forget(session_id).await;
        Ok(deleted)
    }

    /// Resume every session left `processing` without a live run
    pub async fn resume_interrupted(&self) -> Result<usize> {
        let interrupted = sessions::list_sessions_with_status(&self.db, SessionStatus::Processing).await?;
        let mut resumed = 0;
        for session in interrupted {
            match self.start(session.id).await {
                Ok(StartOutcome::Started) => resumed += 1,
                Ok(outcome) => debug!(session_id = %session.id, ?outcome, "Interrupted session not resumed"),
                Err(e) => warn!(session_id = %session.id, error = %e, "Failed to resume session"),
            }
        }
        if resumed > 0 {
            info!(count = resumed, "Resumed interrupted sessions");
        }
        Ok(resumed)
    }

    async fn current_progress(&self, session_id: Uuid) -> u8 {
        match sessions::load_session(&self.db, session_id).await {
            Ok(Some(session)) => session.progress,
            _ => 0,
        }
    }

    /// Publish a live event and persist it as the status snapshot
    async fn emit(&self, event: ProgressEvent) {
        if let Err(e) =
            sessions::update_snapshot(&self.db, event.session_id, event.progress, &event.message).await
        {
            warn!(session_id = %event.session_id, error = %e, "Failed to persist status snapshot");
        }
        self.broadcaster.publish(event);
    }

    async fn run(&self, session: Session, token: CancellationToken) {
        let session_id = session.id;
        let mut tracker = ProgressTracker::new();

        let outcome = self.execute(&session, &token, &mut tracker).await;

        if token.is_cancelled() {
            debug!(session_id = %session_id, "Run stopped after cancellation");
            return;
        }

        match outcome {
            Ok(resolved) => self.finish_completed(session_id, resolved).await,
            Err(reason) => self.finish_failed(session_id, &reason, tracker.current()).await,
        }
    }

    /// Run every unresolved stage; `Err(reason)` on a fatal failure
    async fn execute(
        &self,
        session: &Session,
        token: &CancellationToken,
        tracker: &mut ProgressTracker,
    ) -> std::result::Result<BTreeMap<StageName, StageResult>, String> {
        let session_id = session.id;

        tracker.reach(progress::INITIALIZING);
        self.emit(ProgressEvent::new(
            EventType::Progress,
            session_id,
            tracker.current(),
            "Initializing analysis",
        ))
        .await;

        let cached = self
            .cache
            .load(session_id)
            .await
            .map_err(|e| format!("Failed to read stage cache: {}", e))?;

        let mut resolved: BTreeMap<StageName, StageResult> = BTreeMap::new();
        for result in cached {
            tracker.resolve(result.stage);
            self.broadcaster
                .publish(result.to_event(tracker.current()).as_cached());
            resolved.insert(result.stage, result);
        }
        if !resolved.is_empty() {
            info!(session_id = %session_id, cached = resolved.len(), "Skipping cached stages");
        }

        if let Some(reason) = fatal_reason(&resolved) {
            return Err(reason);
        }
        if resolved.len() == StageName::ALL.len() {
            return Ok(resolved);
        }

        self.adapter
            .ping()
            .await
            .map_err(|e| format!("Analysis service unreachable: {}", e))?;

        let overrides = match settings::get_stage_timeout_overrides(&self.db).await {
            Ok(overrides) => overrides,
            Err(e) => {
                warn!(error = %e, "Ignoring unreadable stage timeout overrides");
                HashMap::new()
            }
        };
        let timeouts = self.config.stage_timeouts_with(&overrides);

        let mut in_flight: FuturesUnordered<StageCall> = FuturesUnordered::new();
        let mut launched: Vec<StageName> = Vec::new();

        loop {
            if token.is_cancelled() {
                return Err("cancelled".to_string());
            }

            for stage in StageName::ALL {
                let ready = !resolved.contains_key(&stage)
                    && !launched.contains(&stage)
                    && stage.dependencies().iter().all(|dep| resolved.contains_key(dep));
                if !ready {
                    continue;
                }

                let timeout = timeouts
                    .get(&stage)
                    .copied()
                    .unwrap_or_else(|| self.config.stage_timeout(stage));
                let context = self.context_for(session, stage, &resolved);

                self.emit(
                    ProgressEvent::new(
                        EventType::Progress,
                        session_id,
                        tracker.current(),
                        format!("Running {}", stage),
                    )
                    .with_stage(stage),
                )
                .await;
                debug!(session_id = %session_id, stage = %stage, timeout_ms = timeout.as_millis() as u64, "Stage launched");

                launched.push(stage);
                in_flight.push(self.call_stage(stage, context, timeout));
            }

            if in_flight.is_empty() {
                return Ok(resolved);
            }

            let (stage, limit, outcome) = tokio::select! {
                biased;
                _ = token.cancelled() => {
                    return Err("cancelled".to_string());
                }
                next = in_flight.next() => match next {
                    Some(next) => next,
                    None => return Ok(resolved),
                },
            };

            let candidate = match outcome {
                Ok(Ok(payload)) => StageResult::ready(session_id, stage, payload),
                Ok(Err(e)) => {
                    warn!(session_id = %session_id, stage = %stage, error = %e, "Stage failed");
                    StageResult::failed(session_id, stage, e.to_string())
                }
                Err(_) => {
                    warn!(session_id = %session_id, stage = %stage, timeout_ms = limit.as_millis() as u64, "Stage timed out");
                    StageResult::failed(
                        session_id,
                        stage,
                        format!("timed out after {} ms", limit.as_millis()),
                    )
                }
            };

            let result = self
                .persist(candidate)
                .await
                .map_err(|e| format!("Failed to store {} result: {}", stage, e))?;

            tracker.resolve(stage);
            self.emit(result.to_event(tracker.current())).await;

            if stage.is_critical() && result.status == StageStatus::Error {
                let reason = result.error.clone().unwrap_or_else(|| "unknown error".to_string());
                return Err(format!("{} failed: {}", stage, reason));
            }
            resolved.insert(stage, result);
        }
    }

    fn call_stage(&self, stage: StageName, context: SessionContext, timeout: Duration) -> StageCall {
        let adapter = Arc::clone(&self.adapter);
        async move {
            let outcome = tokio::time::timeout(timeout, adapter.invoke(stage, &context)).await;
            (stage, timeout, outcome)
        }
        .boxed()
    }

    /// Write-once store; a concurrent earlier write wins and is returned instead
    async fn persist(&self, candidate: StageResult) -> Result<StageResult> {
        let session_id = candidate.session_id;
        let stage = candidate.stage;
        if self.cache.put(candidate.clone()).await? {
            return Ok(candidate);
        }
        Ok(self.cache.get(session_id, stage).await?.unwrap_or(candidate))
    }

    fn context_for(
        &self,
        session: &Session,
        stage: StageName,
        resolved: &BTreeMap<StageName, StageResult>,
    ) -> SessionContext {
        let inputs = stage
            .dependencies()
            .iter()
            .filter_map(|dep| {
                resolved
                    .get(dep)
                    .and_then(|r| r.payload.clone())
                    .map(|payload| (*dep, payload))
            })
            .collect();

        let audio_ref = session
            .audio_ref
            .as_ref()
            .map(|name| self.uploads_dir.join(name).display().to_string())
            .unwrap_or_default();

        SessionContext {
            session_id: session.id,
            training_id: session.training_id.clone(),
            audio_ref,
            duration: session.duration_seconds,
            inputs,
        }
    }

    async fn finish_completed(&self, session_id: Uuid, resolved: BTreeMap<StageName, StageResult>) {
        let summary = StageSummary::from_statuses(resolved.values().map(|r| r.status));
        let message = format!(
            "Analysis complete: {} of {} stages ready",
            summary.completed, summary.total
        );

        match sessions::transition_status_at(
            &self.db,
            session_id,
            SessionStatus::Processing,
            SessionStatus::Completed,
            &message,
            Some(progress::COMPLETED),
        )
        .await
        {
            Ok(true) => {}
            Ok(false) => {
                debug!(session_id = %session_id, "Session left processing before completion");
                self.runs.lock().await.remove(&session_id);
                return;
            }
            Err(e) => {
                error!(session_id = %session_id, error = %e, "Failed to mark session completed");
                self.finish_failed(session_id, &format!("Failed to store completion: {}", e), 0)
                    .await;
                return;
            }
        }

        self.runs.lock().await.remove(&session_id);

        info!(
            session_id = %session_id,
            completed = summary.completed,
            failed = summary.failed,
            "Analysis pipeline completed"
        );

        self.broadcaster.publish(
            ProgressEvent::new(EventType::SessionCompleted, session_id, progress::COMPLETED, message)
                .with_status(SessionStatus::Completed)
                .with_data(aggregate(resolved.values()))
                .with_summary(summary),
        );
        self.broadcaster.close(session_id, progress::COMPLETED);
    }

    async fn finish_failed(&self, session_id: Uuid, reason: &str, progress: u8) {
        error!(session_id = %session_id, reason, "Analysis pipeline failed");

        match sessions::transition_status(
            &self.db,
            session_id,
            SessionStatus::Processing,
            SessionStatus::Failed,
            reason,
        )
        .await
        {
            Ok(true) => {}
            Ok(false) => debug!(session_id = %session_id, "Session left processing before failure"),
            Err(e) => error!(session_id = %session_id, error = %e, "Failed to mark session failed"),
        }
        self.runs.lock().await.remove(&session_id);

        self.broadcaster.publish(
            ProgressEvent::new(EventType::Error, session_id, progress, reason)
                .with_status(SessionStatus::Failed),
        );
        self.broadcaster.close(session_id, progress);
    }
}

fn cancel_run(runs: &mut HashMap<Uuid, CancellationToken>, session_id: Uuid) -> bool {
    match runs.remove(&session_id) {
        Some(token) => {
            token.cancel();
            info!(session_id = %session_id, "Analysis run cancelled");
            true
        }
        None => false,
    }
}

/// Reason a set of resolved stages is fatal, if it is
fn fatal_reason(resolved: &BTreeMap<StageName, StageResult>) -> Option<String> {
    resolved
        .values()
        .find(|r| r.stage.is_critical() && r.status == StageStatus::Error)
        .map(|r| {
            format!(
                "{} failed: {}",
                r.stage,
                r.error.as_deref().unwrap_or("unknown error")
            )
        })
}

/// Ready payloads keyed by stage name
pub fn aggregate<'a>(results: impl IntoIterator<Item = &'a StageResult>) -> Value {
    let mut data = Map::new();
    for result in results {
        if let Some(payload) = &result.payload {
            data.insert(result.stage.as_str().to_string(), payload.clone());
        }
    }
    Value::Object(data)
}
