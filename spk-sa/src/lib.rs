//! spk-sa library interface
//!
//! Session Analysis service: runs the stage pipeline for uploaded recordings and
//! streams progressive results to clients over SSE.

pub mod adapter;
pub mod api;
pub mod broadcaster;
pub mod cache;
pub mod config;
pub mod db;
pub mod error;
pub mod models;
pub mod orchestrator;
pub mod upload;
pub mod utils;

pub use crate::error::{ApiError, ApiResult};

use axum::Router;
use chrono::{DateTime, Utc};
use sqlx::SqlitePool;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::sync::RwLock;
use tower::ServiceBuilder;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;

use crate::adapter::MlAdapter;
use crate::broadcaster::Broadcaster;
use crate::cache::StageCache;
use crate::config::ServiceConfig;
use crate::orchestrator::Orchestrator;

/// Application state shared across handlers
#[derive(Clone)]
pub struct AppState {
    /// Database connection pool
    pub db: SqlitePool,
    pub config: Arc<ServiceConfig>,
    /// Write-once stage results
    pub cache: StageCache,
    /// Per-session event channels
    pub broadcaster: Broadcaster,
    pub orchestrator: Orchestrator,
    /// Where uploaded recordings are stored
    pub uploads_dir: PathBuf,
    /// Service startup timestamp for uptime tracking
    pub startup_time: DateTime<Utc>,
    /// Last error for diagnostic purposes
    pub last_error: Arc<RwLock<Option<String>>>,
}

impl AppState {
    pub fn new(
        db: SqlitePool,
        config: ServiceConfig,
        adapter: Arc<dyn MlAdapter>,
        uploads_dir: PathBuf,
    ) -> Self {
        let config = Arc::new(config);
        let cache = StageCache::new(db.clone());
        let broadcaster = Broadcaster::new(
            cache.clone(),
            config.event_channel_capacity,
            config.max_subscribers_per_session,
        );
        let orchestrator = Orchestrator::new(
            db.clone(),
            cache.clone(),
            broadcaster.clone(),
            adapter,
            Arc::clone(&config),
            uploads_dir.clone(),
        );

        Self {
            db,
            config,
            cache,
            broadcaster,
            orchestrator,
            uploads_dir,
            startup_time: Utc::now(),
            last_error: Arc::new(RwLock::new(None)),
        }
    }

    /// Remember an error for `/health`
    pub async fn record_error(&self, message: impl Into<String>) {
        *self.last_error.write().await = Some(message.into());
    }
}

/// Build application router
pub fn build_router(state: AppState) -> Router {
    // Slack above the policy limit so the upload policy reports oversize bodies
    let body_limit = usize::try_from(state.config.upload.max_bytes)
        .unwrap_or(usize::MAX)
        .saturating_add(1024);

    Router::new()
        .merge(api::session_routes(body_limit))
        .merge(api::event_routes())
        .merge(api::health_routes())
        .layer(
            ServiceBuilder::new()
                .layer(TraceLayer::new_for_http())
                .layer(CorsLayer::permissive()),
        )
        .with_state(state)
}
