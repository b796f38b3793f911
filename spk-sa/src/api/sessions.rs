//! Session lifecycle and Status API endpoints
//!
//! Create, record, upload, start, poll, abort, re-run and delete. The status snapshot
//! returned here is the one the orchestrator persists with every event it broadcasts.

use axum::{
    body::Bytes,
    extract::{DefaultBodyLimit, Path, Query, State},
    http::StatusCode,
    routing::{get, post},
    Json, Router,
};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use spk_common::events::{SessionStatus, StageName, StageStatus, StageSummary};
use std::collections::BTreeMap;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::db::sessions;
use crate::models::Session;
use crate::orchestrator::{aggregate, StartOutcome};
use crate::{ApiError, ApiResult, AppState};

/// POST /sessions request
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CreateSessionRequest {
    pub training_id: String,
}

/// POST /sessions/:id/audio query
#[derive(Debug, Default, Deserialize)]
pub struct UploadQuery {
    /// Client file name, sanitized before use
    pub filename: Option<String>,
    /// Client-reported duration in seconds, used when probing finds none
    pub duration: Option<f64>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct UploadResponse {
    pub session: Session,
    pub mime_type: String,
    pub size: u64,
    /// Whether the upload launched the pipeline
    pub analysis_started: bool,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StartResponse {
    pub session_id: Uuid,
    /// started | already_running | finished
    pub outcome: String,
    pub status: SessionStatus,
}

/// GET /sessions/:id/status response
#[derive(Debug, Serialize, Deserialize)]
pub struct StatusResponse {
    pub id: Uuid,
    pub status: SessionStatus,
    pub progress: u8,
    pub message: String,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct StageState {
    pub status: StageStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct SessionResults {
    pub id: Uuid,
    pub status: SessionStatus,
    /// Ready payloads keyed by stage
    pub results: Value,
    pub stages: BTreeMap<StageName, StageState>,
    pub summary: StageSummary,
}

/// GET /sessions/:id/results response
#[derive(Debug, Serialize, Deserialize)]
pub struct ResultsResponse {
    pub session: SessionResults,
}

#[derive(Debug, Serialize)]
pub struct SessionListResponse {
    pub sessions: Vec<Session>,
}

/// Load a session or fail with 404
pub(crate) async fn require_session(state: &AppState, session_id: Uuid) -> ApiResult<Session> {
    sessions::load_session(&state.db, session_id)
        .await?
        .ok_or_else(|| ApiError::NotFound(format!("Session not found: {}", session_id)))
}

/// POST /sessions
pub async fn create_session(
    State(state): State<AppState>,
    Json(request): Json<CreateSessionRequest>,
) -> ApiResult<(StatusCode, Json<Session>)> {
    let training_id = request.training_id.trim();
    if training_id.is_empty() {
        return Err(ApiError::BadRequest("trainingId must not be empty".to_string()));
    }

    let session = Session::new(training_id);
    sessions::save_session(&state.db, &session).await?;

    info!(session_id = %session.id, training_id, "Session created");
    Ok((StatusCode::CREATED, Json(session)))
}

/// GET /sessions/:id
pub async fn get_session(
    State(state): State<AppState>,
    Path(session_id): Path<Uuid>,
) -> ApiResult<Json<Session>> {
    Ok(Json(require_session(&state, session_id).await?))
}

/// GET /trainings/:training_id/sessions
pub async fn list_training_sessions(
    State(state): State<AppState>,
    Path(training_id): Path<String>,
) -> ApiResult<Json<SessionListResponse>> {
    let sessions = sessions::list_sessions_for_training(&state.db, &training_id).await?;
    Ok(Json(SessionListResponse { sessions }))
}

/// POST /sessions/:id/recording
pub async fn start_recording(
    State(state): State<AppState>,
    Path(session_id): Path<Uuid>,
) -> ApiResult<Json<Session>> {
    let mut session = require_session(&state, session_id).await?;
    let transition = session.transition_to(SessionStatus::Recording)?;

    let moved = sessions::transition_status(
        &state.db,
        session_id,
        transition.old_status,
        transition.new_status,
        "Recording",
    )
    .await?;
    if !moved {
        return Err(ApiError::Conflict(format!(
            "Session {} changed status concurrently",
            session_id
        )));
    }

    Ok(Json(require_session(&state, session_id).await?))
}

/// POST /sessions/:id/audio
///
/// Raw audio body. Starts analysis right away when configured to, or when a client is
/// already subscribed and waiting for events.
pub async fn upload_audio(
    State(state): State<AppState>,
    Path(session_id): Path<Uuid>,
    Query(query): Query<UploadQuery>,
    body: Bytes,
) -> ApiResult<Json<UploadResponse>> {
    let session = require_session(&state, session_id).await?;
    if !session.status.awaiting_audio() {
        return Err(ApiError::Conflict(format!(
            "Session {} already has audio (status {})",
            session_id, session.status
        )));
    }

    let original_name = query.filename.as_deref().unwrap_or("recording.wav");
    let stored = state
        .config
        .upload
        .store(&state.uploads_dir, session_id, original_name, &body)
        .await?;

    let duration = stored
        .duration_seconds
        .or(query.duration.filter(|d| d.is_finite() && *d > 0.0));

    let attached = sessions::attach_audio(&state.db, session_id, &stored.audio_ref, duration).await?;
    if !attached {
        if let Err(e) = tokio::fs::remove_file(&stored.path).await {
            warn!(session_id = %session_id, error = %e, "Failed to remove orphaned upload");
        }
        return Err(ApiError::Conflict(format!(
            "Session {} already has audio",
            session_id
        )));
    }

    info!(
        session_id = %session_id,
        audio_ref = %stored.audio_ref,
        size = stored.size,
        duration = ?duration,
        "Audio uploaded"
    );

    let waiting = state.broadcaster.subscriber_count(session_id) > 0;
    let analysis_started = if state.config.auto_start_on_upload || waiting {
        matches!(state.orchestrator.start(session_id).await?, StartOutcome::Started)
    } else {
        false
    };

    Ok(Json(UploadResponse {
        session: require_session(&state, session_id).await?,
        mime_type: stored.mime_type,
        size: stored.size,
        analysis_started,
    }))
}

/// POST /sessions/:id/start
pub async fn start_analysis(
    State(state): State<AppState>,
    Path(session_id): Path<Uuid>,
) -> ApiResult<(StatusCode, Json<StartResponse>)> {
    let (code, outcome) = match state.orchestrator.start(session_id).await? {
        StartOutcome::Started => (StatusCode::ACCEPTED, "started"),
        StartOutcome::AlreadyRunning => (StatusCode::OK, "already_running"),
        StartOutcome::Finished(_) => (StatusCode::OK, "finished"),
        StartOutcome::NotReady(status) => {
            return Err(ApiError::Conflict(format!(
                "Session {} has no audio yet (status {})",
                session_id, status
            )));
        }
    };

    let session = require_session(&state, session_id).await?;
    Ok((
        code,
        Json(StartResponse {
            session_id,
            outcome: outcome.to_string(),
            status: session.status,
        }),
    ))
}

/// GET /sessions/:id/status
pub async fn get_status(
    State(state): State<AppState>,
    Path(session_id): Path<Uuid>,
) -> ApiResult<Json<StatusResponse>> {
    let session = require_session(&state, session_id).await?;
    Ok(Json(StatusResponse {
        id: session.id,
        status: session.status,
        progress: session.progress,
        message: session.message,
    }))
}

/// GET /sessions/:id/results
pub async fn get_results(
    State(state): State<AppState>,
    Path(session_id): Path<Uuid>,
) -> ApiResult<Json<ResultsResponse>> {
    let session = require_session(&state, session_id).await?;
    if !session.is_terminal() {
        return Err(ApiError::Conflict(format!(
            "Session {} is still {}",
            session_id, session.status
        )));
    }

    let results = state.cache.load(session_id).await?;
    let mut stages: BTreeMap<StageName, StageState> = StageName::ALL
        .iter()
        .map(|stage| {
            (
                *stage,
                StageState {
                    status: StageStatus::Pending,
                    error: None,
                },
            )
        })
        .collect();
    for result in &results {
        stages.insert(
            result.stage,
            StageState {
                status: result.status,
                error: result.error.clone(),
            },
        );
    }

    Ok(Json(ResultsResponse {
        session: SessionResults {
            id: session.id,
            status: session.status,
            results: aggregate(&results),
            stages,
            summary: StageSummary::from_statuses(results.iter().map(|r| r.status)),
        },
    }))
}

/// POST /sessions/:id/abort
pub async fn abort_session(
    State(state): State<AppState>,
    Path(session_id): Path<Uuid>,
) -> ApiResult<Json<StatusResponse>> {
    let session = require_session(&state, session_id).await?;
    if session.status != SessionStatus::Processing {
        return Err(ApiError::Conflict(format!(
            "Session {} is not processing (status {})",
            session_id, session.status
        )));
    }

    let status = state.orchestrator.abort(session_id).await?;
    info!(session_id = %session_id, status = %status, "Session aborted");

    let session = require_session(&state, session_id).await?;
    Ok(Json(StatusResponse {
        id: session.id,
        status: session.status,
        progress: session.progress,
        message: session.message,
    }))
}

/// POST /sessions/:id/rerun
///
/// Finished sessions keep their history; the re-run gets a fresh id over the same audio.
pub async fn rerun_session(
    State(state): State<AppState>,
    Path(session_id): Path<Uuid>,
) -> ApiResult<(StatusCode, Json<Session>)> {
    let source = require_session(&state, session_id).await?;
    if !source.is_terminal() {
        return Err(ApiError::Conflict(format!(
            "Session {} has not finished (status {})",
            session_id, source.status
        )));
    }

    let rerun = Session::rerun_of(&source)?;
    sessions::save_session(&state.db, &rerun).await?;
    info!(session_id = %rerun.id, source_id = %session_id, "Session re-run created");

    if state.config.auto_start_on_upload {
        let outcome = state.orchestrator.start(rerun.id).await?;
        debug!(session_id = %rerun.id, ?outcome, "Re-run auto start");
    }

    Ok((StatusCode::CREATED, Json(require_session(&state, rerun.id).await?)))
}

/// DELETE /sessions/:id
///
/// Audio files stay on disk: re-runs may share them.
pub async fn delete_session(
    State(state): State<AppState>,
    Path(session_id): Path<Uuid>,
) -> ApiResult<StatusCode> {
    require_session(&state, session_id).await?;

    if !state.orchestrator.remove(session_id).await? {
        return Err(ApiError::NotFound(format!("Session not found: {}", session_id)));
    }

    info!(session_id = %session_id, "Session deleted");
    Ok(StatusCode::NO_CONTENT)
}

/// Build session routes; `upload_limit` bounds the raw audio body
pub fn session_routes(upload_limit: usize) -> Router<AppState> {
    Router::new()
        .route("/sessions", post(create_session))
        .route("/sessions/:id", get(get_session).delete(delete_session))
        .route("/trainings/:training_id/sessions", get(list_training_sessions))
        .route("/sessions/:id/recording", post(start_recording))
        .route(
            "/sessions/:id/audio",
            post(upload_audio).layer(DefaultBodyLimit::max(upload_limit)),
        )
        .route("/sessions/:id/start", post(start_analysis))
        .route("/sessions/:id/status", get(get_status))
        .route("/sessions/:id/results", get(get_results))
        .route("/sessions/:id/abort", post(abort_session))
        .route("/sessions/:id/rerun", post(rerun_session))
}
