//! Analysis stage types shared by the pipeline and its clients

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use super::EventType;

/// One independently computable analysis unit
///
/// Declaration order is the canonical stage order used for replay.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StageName {
    /// Speech-to-text; every other stage needs its output
    Transcription,
    /// Speech-pace metrics (words per minute, pauses, fillers)
    Metrics,
    /// Pitch/structure evaluation
    PitchEvaluation,
    /// Follow-up questions an audience might ask
    Questions,
    /// Presentation feedback
    Feedback,
}

impl StageName {
    /// All stages in canonical order
    pub const ALL: [StageName; 5] = [
        StageName::Transcription,
        StageName::Metrics,
        StageName::PitchEvaluation,
        StageName::Questions,
        StageName::Feedback,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            StageName::Transcription => "transcription",
            StageName::Metrics => "metrics",
            StageName::PitchEvaluation => "pitch_evaluation",
            StageName::Questions => "questions",
            StageName::Feedback => "feedback",
        }
    }

    /// Stages that must be resolved (ready or error) before this one may start
    pub fn dependencies(&self) -> &'static [StageName] {
        match self {
            StageName::Transcription => &[],
            StageName::Metrics => &[StageName::Transcription],
            StageName::PitchEvaluation | StageName::Questions | StageName::Feedback => {
                &[StageName::Transcription, StageName::Metrics]
            }
        }
    }

    /// A critical stage failing makes the whole session fail
    pub fn is_critical(&self) -> bool {
        matches!(self, StageName::Transcription)
    }

    /// Overall progress reported once this stage resolves
    ///
    /// Always greater than the checkpoint of every dependency.
    pub fn checkpoint(&self) -> u8 {
        match self {
            StageName::Transcription => 30,
            StageName::Metrics => 45,
            StageName::PitchEvaluation => 65,
            StageName::Questions => 80,
            StageName::Feedback => 95,
        }
    }

    /// Event type announcing a successful result for this stage
    pub fn ready_event(&self) -> EventType {
        match self {
            StageName::Transcription => EventType::TranscriptionCompleted,
            StageName::Metrics => EventType::MetricsReady,
            StageName::PitchEvaluation => EventType::PitchAnalysisReady,
            StageName::Questions => EventType::QuestionsReady,
            StageName::Feedback => EventType::FeedbackReady,
        }
    }

    /// Event type announcing a failed result for this stage
    pub fn error_event(&self) -> EventType {
        match self {
            StageName::Transcription => EventType::TranscriptionError,
            StageName::Metrics => EventType::MetricsError,
            StageName::PitchEvaluation => EventType::PitchAnalysisError,
            StageName::Questions => EventType::QuestionsError,
            StageName::Feedback => EventType::FeedbackError,
        }
    }

    /// Event type for a resolved stage status, `None` while pending
    pub fn resolution_event(&self, status: StageStatus) -> Option<EventType> {
        match status {
            StageStatus::Pending => None,
            StageStatus::Ready => Some(self.ready_event()),
            StageStatus::Error => Some(self.error_event()),
        }
    }
}

impl fmt::Display for StageName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for StageName {
    type Err = crate::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        StageName::ALL
            .iter()
            .copied()
            .find(|stage| stage.as_str() == s)
            .ok_or_else(|| crate::Error::InvalidInput(format!("Unknown stage: {}", s)))
    }
}

/// Resolution status of one stage of one session
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StageStatus {
    Pending,
    Ready,
    Error,
}

impl StageStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            StageStatus::Pending => "pending",
            StageStatus::Ready => "ready",
            StageStatus::Error => "error",
        }
    }

    /// Ready and error are final
    pub fn is_resolved(&self) -> bool {
        !matches!(self, StageStatus::Pending)
    }
}

impl fmt::Display for StageStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for StageStatus {
    type Err = crate::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(StageStatus::Pending),
            "ready" => Ok(StageStatus::Ready),
            "error" => Ok(StageStatus::Error),
            other => Err(crate::Error::InvalidInput(format!("Unknown stage status: {}", other))),
        }
    }
}

/// Stage counts carried by completion events
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct StageSummary {
    pub total: usize,
    pub completed: usize,
    pub failed: usize,
}

impl StageSummary {
    /// Summarize stage statuses; `total` is always the full stage count
    pub fn from_statuses<I>(statuses: I) -> Self
    where
        I: IntoIterator<Item = StageStatus>,
    {
        let mut summary = StageSummary {
            total: StageName::ALL.len(),
            ..Default::default()
        };
        for status in statuses {
            match status {
                StageStatus::Ready => summary.completed += 1,
                StageStatus::Error => summary.failed += 1,
                StageStatus::Pending => {}
            }
        }
        summary
    }
}
