//! HTTP API handlers for spk-sa
//!
//! REST endpoints for the session lifecycle plus the per-session SSE stream.

pub mod health;
pub mod sessions;
pub mod sse;

pub use health::health_routes;
pub use sessions::session_routes;
pub use sse::event_routes;
