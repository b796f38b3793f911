//! Server-Sent Events (SSE) for per-session analysis progress
//!
//! Every stream opens with a `status` event. A session that is still running continues
//! with cached stage replays and then live events; a finished session gets its stored
//! results, a terminal `completed`/`error` event, and `connection_closing`.

use axum::{
    extract::{Path, State},
    response::sse::{Event, Sse},
    routing::get,
    Router,
};
use futures::stream::{self, BoxStream, Stream, StreamExt};
use spk_common::events::{EventType, ProgressEvent, SessionStatus, StageSummary};
use spk_common::sse::progress_sse;
use std::convert::Infallible;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::api::sessions::require_session;
use crate::models::Session;
use crate::orchestrator::aggregate;
use crate::{ApiResult, AppState};

/// GET /sessions/:id/events
///
/// Subscribes before starting the pipeline so the first live events cannot be missed.
/// Starting is idempotent: an `uploaded` session is launched, a `processing` one with a
/// live run is simply joined.
pub async fn session_event_stream(
    State(state): State<AppState>,
    Path(session_id): Path<Uuid>,
) -> ApiResult<Sse<impl Stream<Item = Result<Event, Infallible>>>> {
    let initial = require_session(&state, session_id).await?;
    let subscription = state.broadcaster.subscribe(session_id).await?;

    info!(session_id = %session_id, status = %initial.status, "SSE client connected");

    if matches!(initial.status, SessionStatus::Uploaded | SessionStatus::Processing) {
        match state.orchestrator.start(session_id).await {
            Ok(outcome) => debug!(session_id = %session_id, ?outcome, "Start on subscribe"),
            Err(e) => {
                warn!(session_id = %session_id, error = %e, "Start on subscribe failed");
                state.record_error(format!("Start of {} failed: {}", session_id, e)).await;
            }
        }
    }

    // A run may have finished between the first read and the subscription
    let current = require_session(&state, session_id).await?;

    let events: BoxStream<'static, ProgressEvent> = if current.is_terminal() {
        drop(subscription);
        stream::iter(finished_session_events(&state, &current).await?).boxed()
    } else {
        let status = ProgressEvent::status(
            session_id,
            initial.status,
            initial.progress,
            initial.message.clone(),
        );
        stream::once(async move { status })
            .chain(subscription.into_stream())
            .boxed()
    };

    Ok(progress_sse(events, state.config.keepalive_interval))
}

/// Full event sequence for a subscriber joining a finished session
async fn finished_session_events(state: &AppState, session: &Session) -> ApiResult<Vec<ProgressEvent>> {
    let results = state.cache.load(session.id).await?;

    let mut events = Vec::with_capacity(results.len() + 3);
    events.push(ProgressEvent::status(
        session.id,
        session.status,
        session.progress,
        session.message.clone(),
    ));
    events.extend(
        results
            .iter()
            .map(|result| result.to_event(result.stage.checkpoint()).as_cached()),
    );

    let terminal = match session.status {
        SessionStatus::Completed => {
            ProgressEvent::new(EventType::Completed, session.id, session.progress, session.message.clone())
                .with_data(aggregate(&results))
                .with_summary(StageSummary::from_statuses(results.iter().map(|r| r.status)))
        }
        _ => ProgressEvent::new(EventType::Error, session.id, session.progress, session.message.clone()),
    };
    events.push(terminal.with_status(session.status).as_cached());
    events.push(ProgressEvent::connection_closing(session.id, session.progress));

    Ok(events)
}

/// Build SSE routes
pub fn event_routes() -> Router<AppState> {
    Router::new().route("/sessions/:id/events", get(session_event_stream))
}
