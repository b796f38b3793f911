//! Client side of the progressive event stream
//!
//! `SseParser` turns raw `text/event-stream` bytes into frames, skipping comment
//! (keepalive) lines. `StreamClient` folds ProgressEvents into a view of one session
//! through the states `Connecting → Replaying → Live → Closed`. Card visibility is a pure
//! function of a stage and its status.

use std::collections::BTreeMap;

use serde_json::Value;
use tracing::debug;

use crate::events::{EventType, ProgressEvent, SessionStatus, StageName, StageStatus, StageSummary};

/// One dispatched SSE frame
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct SseFrame {
    /// `event:` field, `None` when the frame had none
    pub event: Option<String>,
    /// `data:` lines joined with `\n`
    pub data: String,
}

impl SseFrame {
    /// Decode the frame's data as a ProgressEvent
    pub fn progress_event(&self) -> Result<ProgressEvent, serde_json::Error> {
        serde_json::from_str(&self.data)
    }
}

/// Incremental `text/event-stream` parser
///
/// Chunks may split lines or frames anywhere; incomplete input stays buffered until the
/// next `push`.
#[derive(Debug, Default)]
pub struct SseParser {
    buffer: String,
    event: Option<String>,
    data: Vec<String>,
}

impl SseParser {
    pub fn new() -> Self {
        Self::default()
    }

    /// Feed a chunk, returning every frame it completed
    pub fn push(&mut self, chunk: &str) -> Vec<SseFrame> {
        self.buffer.push_str(chunk);
        let mut frames = Vec::new();

        while let Some(pos) = self.buffer.find('\n') {
            let line: String = self.buffer.drain(..=pos).collect();
            let line = line.trim_end_matches('\n').trim_end_matches('\r');

            if line.is_empty() {
                if let Some(frame) = self.dispatch() {
                    frames.push(frame);
                }
                continue;
            }

            // Comment line (keepalive)
            if line.starts_with(':') {
                continue;
            }

            let (field, value) = match line.split_once(':') {
                Some((field, value)) => (field, value.strip_prefix(' ').unwrap_or(value)),
                None => (line, ""),
            };

            match field {
                "event" => self.event = Some(value.to_string()),
                "data" => self.data.push(value.to_string()),
                // id / retry carry nothing the session view needs
                _ => {}
            }
        }

        frames
    }

    fn dispatch(&mut self) -> Option<SseFrame> {
        let event = self.event.take();
        if self.data.is_empty() {
            return None;
        }
        let data = std::mem::take(&mut self.data).join("\n");
        Some(SseFrame { event, data })
    }
}

/// Connection state of a StreamClient
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamState {
    /// Waiting for the stream to open (initial, or after a drop)
    Connecting,
    /// Receiving the status snapshot and cached replays
    Replaying,
    /// Receiving live events
    Live,
    /// Server ended the stream after a terminal event
    Closed,
}

/// How the UI presents one analysis card
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Visibility {
    /// Not rendered
    Hidden,
    /// Skeleton while the stage runs
    Placeholder,
    /// Result rendered
    Shown,
    /// Error notice in place of the result
    Failed,
}

/// Visibility of a stage's card for a stage status
///
/// A failed critical stage fails the whole session, so its card is replaced by the
/// session error rather than shown as a card-level failure.
pub fn card_visibility(stage: StageName, status: StageStatus) -> Visibility {
    match status {
        StageStatus::Pending => Visibility::Placeholder,
        StageStatus::Ready => Visibility::Shown,
        StageStatus::Error if stage.is_critical() => Visibility::Hidden,
        StageStatus::Error => Visibility::Failed,
    }
}

/// Client-side view of one session's event stream
#[derive(Debug, Clone)]
pub struct StreamClient {
    state: StreamState,
    session_status: Option<SessionStatus>,
    progress: u8,
    stages: BTreeMap<StageName, StageStatus>,
    payloads: BTreeMap<StageName, Value>,
    summary: Option<StageSummary>,
    error: Option<String>,
    finished: bool,
}

impl Default for StreamClient {
    fn default() -> Self {
        Self::new()
    }
}

impl StreamClient {
    pub fn new() -> Self {
        Self {
            state: StreamState::Connecting,
            session_status: None,
            progress: 0,
            stages: StageName::ALL.iter().map(|s| (*s, StageStatus::Pending)).collect(),
            payloads: BTreeMap::new(),
            summary: None,
            error: None,
            finished: false,
        }
    }

    pub fn state(&self) -> StreamState {
        self.state
    }

    pub fn session_status(&self) -> Option<SessionStatus> {
        self.session_status
    }

    /// Highest overall progress seen so far
    pub fn progress(&self) -> u8 {
        self.progress
    }

    pub fn stage_status(&self, stage: StageName) -> StageStatus {
        self.stages.get(&stage).copied().unwrap_or(StageStatus::Pending)
    }

    pub fn payload(&self, stage: StageName) -> Option<&Value> {
        self.payloads.get(&stage)
    }

    pub fn summary(&self) -> Option<StageSummary> {
        self.summary
    }

    pub fn error(&self) -> Option<&str> {
        self.error.as_deref()
    }

    /// A terminal event has been received
    pub fn is_finished(&self) -> bool {
        self.finished
    }

    /// Whether a dropped stream should be reopened
    pub fn should_reconnect(&self) -> bool {
        !self.finished
    }

    /// Card visibility for every stage in canonical order
    pub fn cards(&self) -> Vec<(StageName, Visibility)> {
        self.stages
            .iter()
            .map(|(stage, status)| (*stage, card_visibility(*stage, *status)))
            .collect()
    }

    /// The transport opened
    pub fn on_open(&mut self) {
        if self.state == StreamState::Connecting {
            self.state = StreamState::Replaying;
        }
    }

    /// The transport dropped without a `connection_closing` frame
    pub fn on_disconnect(&mut self) {
        self.state = if self.finished {
            StreamState::Closed
        } else {
            StreamState::Connecting
        };
    }

    /// Feed one raw SSE frame; frames that are not ProgressEvents are ignored
    pub fn on_frame(&mut self, frame: &SseFrame) {
        match frame.progress_event() {
            Ok(event) => self.apply(&event),
            Err(e) => debug!("Ignoring undecodable SSE frame: {}", e),
        }
    }

    /// Fold one event into the session view
    pub fn apply(&mut self, event: &ProgressEvent) {
        if self.state == StreamState::Closed {
            return;
        }
        if self.state == StreamState::Connecting {
            self.state = StreamState::Replaying;
        }

        if event.event_type == EventType::ConnectionClosing {
            self.state = StreamState::Closed;
            return;
        }

        if !event.cached && event.event_type != EventType::Status {
            self.state = StreamState::Live;
        }

        self.progress = self.progress.max(event.progress);

        match event.event_type {
            EventType::Status => {
                self.session_status = event.status;
                if let Some(status) = event.status {
                    if status.is_terminal() {
                        self.finished = true;
                    }
                }
            }
            EventType::SessionCompleted | EventType::Completed => {
                self.finished = true;
                self.session_status = Some(SessionStatus::Completed);
                self.summary = event.summary;
            }
            EventType::Error => {
                self.finished = true;
                self.session_status = Some(SessionStatus::Failed);
                self.error = Some(event.message.clone());
            }
            _ => {
                if let Some(stage) = event.resolved_stage() {
                    self.resolve(stage, event);
                }
            }
        }
    }

    fn resolve(&mut self, stage: StageName, event: &ProgressEvent) {
        // Stage results are write-once; replays of a known result change nothing
        if self.stage_status(stage).is_resolved() {
            return;
        }
        let status = if event.event_type == stage.ready_event() {
            StageStatus::Ready
        } else {
            StageStatus::Error
        };
        self.stages.insert(stage, status);
        if let Some(data) = &event.data {
            self.payloads.insert(stage, data.clone());
        }
    }
}
