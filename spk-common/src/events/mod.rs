//! Event types for the SPK progressive event stream
//!
//! Provides the wire event definition (ProgressEvent) and the EventBus used as the
//! per-session broadcast channel.

// Sub-modules (supporting types)
mod session_types;
mod stage_types;

pub use session_types::SessionStatus;
pub use stage_types::{StageName, StageStatus, StageSummary};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use tokio::sync::broadcast;
use uuid::Uuid;

/// Event `type` values on the wire
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventType {
    /// Session status snapshot, first event of every subscription
    Status,
    /// Pipeline or stage progress without a result
    Progress,
    TranscriptionCompleted,
    TranscriptionError,
    MetricsReady,
    MetricsError,
    PitchAnalysisReady,
    QuestionsReady,
    FeedbackReady,
    PitchAnalysisError,
    QuestionsError,
    FeedbackError,
    /// Live aggregate emitted when the pipeline finishes
    SessionCompleted,
    /// Aggregate for a subscriber joining an already completed session
    Completed,
    /// Fatal pipeline failure
    Error,
    /// Last frame before the server ends the stream
    ConnectionClosing,
}

impl EventType {
    /// Get event type as string (SSE `event:` field)
    pub fn as_str(&self) -> &'static str {
        match self {
            EventType::Status => "status",
            EventType::Progress => "progress",
            EventType::TranscriptionCompleted => "transcription_completed",
            EventType::TranscriptionError => "transcription_error",
            EventType::MetricsReady => "metrics_ready",
            EventType::MetricsError => "metrics_error",
            EventType::PitchAnalysisReady => "pitch_analysis_ready",
            EventType::QuestionsReady => "questions_ready",
            EventType::FeedbackReady => "feedback_ready",
            EventType::PitchAnalysisError => "pitch_analysis_error",
            EventType::QuestionsError => "questions_error",
            EventType::FeedbackError => "feedback_error",
            EventType::SessionCompleted => "session_completed",
            EventType::Completed => "completed",
            EventType::Error => "error",
            EventType::ConnectionClosing => "connection_closing",
        }
    }

    /// Events after which the session produces no further results
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            EventType::SessionCompleted | EventType::Completed | EventType::Error
        )
    }

    /// `{stage}_ready` / `{stage}_error` style events
    pub fn is_stage_resolution(&self) -> bool {
        StageName::ALL
            .iter()
            .any(|stage| stage.ready_event() == *self || stage.error_event() == *self)
    }
}

impl fmt::Display for EventType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One event of a session's progressive stream
///
/// Ephemeral: the durable form of a stage outcome is the stored stage result.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProgressEvent {
    #[serde(rename = "type")]
    pub event_type: EventType,
    pub session_id: Uuid,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stage: Option<StageName>,
    /// Overall progress 0-100
    pub progress: u8,
    #[serde(default)]
    pub message: String,
    /// Stage payload, or the aggregate of all ready payloads on completion
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<serde_json::Value>,
    /// True when replaying an already persisted result
    #[serde(default)]
    pub cached: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status: Option<SessionStatus>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub summary: Option<StageSummary>,
    pub timestamp: DateTime<Utc>,
}

impl ProgressEvent {
    pub fn new(
        event_type: EventType,
        session_id: Uuid,
        progress: u8,
        message: impl Into<String>,
    ) -> Self {
        Self {
            event_type,
            session_id,
            stage: None,
            progress: progress.min(100),
            message: message.into(),
            data: None,
            cached: false,
            status: None,
            summary: None,
            timestamp: Utc::now(),
        }
    }

    /// Session status snapshot
    pub fn status(session_id: Uuid, status: SessionStatus, progress: u8, message: impl Into<String>) -> Self {
        Self::new(EventType::Status, session_id, progress, message).with_status(status)
    }

    pub fn connection_closing(session_id: Uuid, progress: u8) -> Self {
        Self::new(EventType::ConnectionClosing, session_id, progress, "Stream closing")
    }

    pub fn with_stage(mut self, stage: StageName) -> Self {
        self.stage = Some(stage);
        self
    }

    pub fn with_data(mut self, data: serde_json::Value) -> Self {
        self.data = Some(data);
        self
    }

    pub fn with_status(mut self, status: SessionStatus) -> Self {
        self.status = Some(status);
        self
    }

    pub fn with_summary(mut self, summary: StageSummary) -> Self {
        self.summary = Some(summary);
        self
    }

    pub fn as_cached(mut self) -> Self {
        self.cached = true;
        self
    }

    /// Stage this event resolves, if it is a `{stage}_ready`/`{stage}_error` event
    pub fn resolved_stage(&self) -> Option<StageName> {
        if self.event_type.is_stage_resolution() {
            self.stage
        } else {
            None
        }
    }
}

// ========================================
// EventBus Implementation
// ========================================

/// Broadcast channel for ProgressEvents
///
/// Uses tokio::broadcast internally, providing:
/// - Non-blocking publish (slow subscribers don't block producers)
/// - Multiple concurrent subscribers, each receiving every event
/// - Automatic cleanup when subscribers drop
/// - Lagged message detection for slow subscribers
///
/// The analysis service keeps one EventBus per session.
#[derive(Clone)]
pub struct EventBus {
    tx: broadcast::Sender<ProgressEvent>,
}

impl EventBus {
    /// Creates a new EventBus with specified channel capacity
    ///
    /// # Arguments
    ///
    /// * `capacity` - Number of events to buffer before lagging slow receivers
    ///
    /// # Examples
    ///
    /// ```
    /// use spk_common::events::EventBus;
    ///
    /// let event_bus = EventBus::new(64);
    /// assert_eq!(event_bus.subscriber_count(), 0);
    /// ```
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity);
        Self { tx }
    }

    /// Subscribe to all future events
    ///
    /// Events emitted before subscription are not received.
    pub fn subscribe(&self) -> broadcast::Receiver<ProgressEvent> {
        self.tx.subscribe()
    }

    /// Emit an event to all subscribers
    ///
    /// Returns `Ok(subscriber_count)` if at least one subscriber exists,
    /// `Err` if no subscribers are listening.
    #[allow(clippy::result_large_err)]
    pub fn emit(
        &self,
        event: ProgressEvent,
    ) -> Result<usize, broadcast::error::SendError<ProgressEvent>> {
        self.tx.send(event)
    }

    /// Get the current number of active subscribers
    pub fn subscriber_count(&self) -> usize {
        self.tx.receiver_count()
    }
}
