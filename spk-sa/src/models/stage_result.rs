//! Resolved outcome of one stage of one session

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use spk_common::events::{ProgressEvent, StageName, StageStatus};
use uuid::Uuid;

/// Write-once stage outcome
///
/// Only resolved results (`ready` or `error`) exist as values of this type; a stage
/// without one is pending.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StageResult {
    pub session_id: Uuid,
    pub stage: StageName,
    pub status: StageStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub payload: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    pub completed_at: DateTime<Utc>,
}

impl StageResult {
    pub fn ready(session_id: Uuid, stage: StageName, payload: Value) -> Self {
        Self {
            session_id,
            stage,
            status: StageStatus::Ready,
            payload: Some(payload),
            error: None,
            completed_at: Utc::now(),
        }
    }

    pub fn failed(session_id: Uuid, stage: StageName, reason: impl Into<String>) -> Self {
        Self {
            session_id,
            stage,
            status: StageStatus::Error,
            payload: None,
            error: Some(reason.into()),
            completed_at: Utc::now(),
        }
    }

    pub fn is_ready(&self) -> bool {
        self.status == StageStatus::Ready
    }

    /// `{stage}_ready` / `{stage}_error` event announcing this result
    pub fn to_event(&self, progress: u8) -> ProgressEvent {
        // Constructors only produce resolved statuses
        let event_type = self
            .stage
            .resolution_event(self.status)
            .unwrap_or_else(|| self.stage.error_event());

        let message = match (&self.status, &self.error) {
            (StageStatus::Error, Some(reason)) => format!("{} failed: {}", self.stage, reason),
            (StageStatus::Error, None) => format!("{} failed", self.stage),
            _ => format!("{} ready", self.stage),
        };

        let event = ProgressEvent::new(event_type, self.session_id, progress, message)
            .with_stage(self.stage);
        match &self.payload {
            Some(payload) => event.with_data(payload.clone()),
            None => event,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use spk_common::events::EventType;

    #[test]
    fn test_ready_event_carries_payload() {
        let id = Uuid::new_v4();
        let result = StageResult::ready(id, StageName::Transcription, json!({"segments": []}));
        let event = result.to_event(30);
        assert_eq!(event.event_type, EventType::TranscriptionCompleted);
        assert_eq!(event.stage, Some(StageName::Transcription));
        assert_eq!(event.data, Some(json!({"segments": []})));
        assert!(!event.cached);
    }

    #[test]
    fn test_error_event_carries_reason() {
        let result = StageResult::failed(Uuid::new_v4(), StageName::Questions, "timed out");
        let event = result.to_event(80);
        assert_eq!(event.event_type, EventType::QuestionsError);
        assert!(event.message.contains("timed out"));
        assert!(event.data.is_none());
    }
}
