//! ML Service Adapter
//!
//! The orchestrator's only view of the external analysis service: one async call per
//! stage that yields a JSON payload or fails. Implementations must not retry or invent
//! results on failure; the orchestrator turns every error into a stage error (or a
//! fatal error for critical stages).

mod http;

pub use http::HttpMlAdapter;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use spk_common::events::StageName;
use std::collections::BTreeMap;
use thiserror::Error;
use uuid::Uuid;

/// Adapter failure
#[derive(Debug, Clone, Error, PartialEq)]
pub enum AdapterError {
    /// Service could not be reached
    #[error("ML service unavailable: {0}")]
    Unavailable(String),

    /// Service answered with a failure for this stage
    #[error("ML service failed: {0}")]
    Failed(String),

    /// Service answered with something that is not a stage payload
    #[error("Invalid ML service response: {0}")]
    InvalidResponse(String),
}

/// Everything a stage call may need
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionContext {
    pub session_id: Uuid,
    pub training_id: String,
    /// Stored audio path as seen by the service host
    pub audio_ref: String,
    pub duration: Option<f64>,
    /// Payloads of resolved (ready) dependency stages
    #[serde(default)]
    pub inputs: BTreeMap<StageName, Value>,
}

impl SessionContext {
    /// Payload of a ready dependency
    pub fn input(&self, stage: StageName) -> Option<&Value> {
        self.inputs.get(&stage)
    }
}

/// Stage invocation contract
#[async_trait]
pub trait MlAdapter: Send + Sync {
    /// Run one stage. Dropping the future abandons the call.
    async fn invoke(&self, stage: StageName, context: &SessionContext) -> Result<Value, AdapterError>;

    /// Check that the service is reachable
    async fn ping(&self) -> Result<(), AdapterError>;
}
