//! # SPK Common Library
//!
//! Shared code for the SPK speech-coaching services including:
//! - Database initialization (sessions, stage results, settings)
//! - Event types (ProgressEvent, stage and session enums) and the EventBus
//! - Server-Sent Events framing
//! - Configuration loading and root folder resolution
//! - Client-side event stream state machine

pub mod client;
pub mod config;
#[cfg(feature = "sqlx")]
pub mod db;
pub mod error;
pub mod events;
pub mod sse;

pub use error::{Error, Result};
