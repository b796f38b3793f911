//! Test application: temp database, scripted adapter, router and SSE reading

use axum::body::Body;
use axum::Router;
use http_body_util::BodyExt;
use spk_common::client::SseParser;
use spk_common::events::{EventType, ProgressEvent, SessionStatus, StageName};
use spk_sa::config::ServiceConfig;
use spk_sa::db::sessions;
use spk_sa::models::Session;
use spk_sa::{build_router, AppState};
use std::sync::Arc;
use std::time::Duration;
use tempfile::TempDir;
use uuid::Uuid;

use super::{wav_bytes, ScriptedAdapter};

/// Keep `_dir` alive for the duration of the test
pub struct TestApp {
    pub _dir: TempDir,
    pub state: AppState,
    pub adapter: Arc<ScriptedAdapter>,
}

/// Configuration with short timeouts and a fast keepalive
pub fn test_config() -> ServiceConfig {
    let mut config = ServiceConfig::default();
    for stage in StageName::ALL {
        config.stage_timeouts.insert(stage, Duration::from_secs(5));
    }
    config.keepalive_interval = Duration::from_secs(1);
    config
}

pub async fn create_test_app(adapter: ScriptedAdapter, config: ServiceConfig) -> TestApp {
    let dir = TempDir::new().unwrap();
    let pool = spk_sa::db::init_database_pool(&dir.path().join("spk.db"))
        .await
        .unwrap();
    let uploads_dir = dir.path().join("uploads");
    std::fs::create_dir_all(&uploads_dir).unwrap();

    let adapter = Arc::new(adapter);
    let state = AppState::new(pool, config, adapter.clone(), uploads_dir);

    TestApp {
        _dir: dir,
        state,
        adapter,
    }
}

impl TestApp {
    pub fn router(&self) -> Router {
        build_router(self.state.clone())
    }

    /// Session with stored audio, ready to start
    pub async fn uploaded_session(&self) -> Session {
        let session = Session::new("training-1");
        sessions::save_session(&self.state.db, &session).await.unwrap();

        let stored = self
            .state
            .config
            .upload
            .store(&self.state.uploads_dir, session.id, "pitch.wav", &wav_bytes(1.0))
            .await
            .unwrap();
        assert!(sessions::attach_audio(
            &self.state.db,
            session.id,
            &stored.audio_ref,
            stored.duration_seconds
        )
        .await
        .unwrap());

        self.session(session.id).await
    }

    pub async fn session(&self, id: Uuid) -> Session {
        sessions::load_session(&self.state.db, id).await.unwrap().unwrap()
    }

    /// Poll until the session is completed or failed
    pub async fn wait_for_terminal(&self, id: Uuid) -> Session {
        let deadline = tokio::time::Instant::now() + Duration::from_secs(10);
        loop {
            let session = self.session(id).await;
            if session.status.is_terminal() && !self.state.orchestrator.is_running(id).await {
                return session;
            }
            assert!(
                tokio::time::Instant::now() < deadline,
                "session {} stuck in {}",
                id,
                session.status
            );
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    }

    pub async fn wait_for_status(&self, id: Uuid, status: SessionStatus) {
        let deadline = tokio::time::Instant::now() + Duration::from_secs(10);
        while self.session(id).await.status != status {
            assert!(tokio::time::Instant::now() < deadline, "session {} never became {}", id, status);
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    }
}

/// Read an SSE body until `connection_closing`, the end of the body, or the time limit
pub async fn read_sse(body: Body, limit: Duration) -> Vec<ProgressEvent> {
    read_sse_until(body, limit, |event| event.event_type == EventType::ConnectionClosing).await.0
}

/// Read an SSE body until `stop` matches an event; returns the events and the body so
/// the caller can keep reading or drop it to disconnect
pub async fn read_sse_until<F>(mut body: Body, limit: Duration, stop: F) -> (Vec<ProgressEvent>, Body)
where
    F: Fn(&ProgressEvent) -> bool,
{
    let deadline = tokio::time::Instant::now() + limit;
    let mut parser = SseParser::new();
    let mut events = Vec::new();

    loop {
        let frame = match tokio::time::timeout_at(deadline, body.frame()).await {
            Ok(Some(Ok(frame))) => frame,
            _ => return (events, body),
        };
        let Ok(data) = frame.into_data() else {
            continue;
        };

        for sse_frame in parser.push(&String::from_utf8_lossy(&data)) {
            let event = sse_frame.progress_event().unwrap();
            let done = stop(&event);
            events.push(event);
            if done {
                return (events, body);
            }
        }
    }
}
