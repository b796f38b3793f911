//! Session record and lifecycle
//!
//! A session moves `initialized → recording → uploaded → processing → completed | failed`
//! (`initialized → uploaded` for direct uploads). Edges are defined by
//! [`SessionStatus::can_transition_to`]; nothing moves backwards.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use spk_common::events::SessionStatus;
use spk_common::{Error, Result};
use uuid::Uuid;

/// Status change record
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StateTransition {
    pub session_id: Uuid,
    pub old_status: SessionStatus,
    pub new_status: SessionStatus,
    pub transitioned_at: DateTime<Utc>,
}

/// One recording/upload and its analysis lifecycle
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Session {
    pub id: Uuid,
    /// Owning training (opaque identifier)
    pub training_id: String,
    pub status: SessionStatus,
    /// Stored audio file name inside the uploads directory
    pub audio_ref: Option<String>,
    /// Audio duration in seconds, once known
    #[serde(rename = "duration")]
    pub duration_seconds: Option<f64>,
    /// Latest broadcast progress (0-100)
    pub progress: u8,
    /// Latest broadcast message
    pub message: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Session {
    pub fn new(training_id: impl Into<String>) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4(),
            training_id: training_id.into(),
            status: SessionStatus::Initialized,
            audio_ref: None,
            duration_seconds: None,
            progress: 0,
            message: "Session created".to_string(),
            created_at: now,
            updated_at: now,
        }
    }

    /// Fresh session over the same audio, ready to be analyzed again
    pub fn rerun_of(source: &Session) -> Result<Self> {
        let audio_ref = source.audio_ref.clone().ok_or_else(|| {
            Error::InvalidInput(format!("Session {} has no audio to re-run", source.id))
        })?;

        let mut session = Session::new(source.training_id.clone());
        session.audio_ref = Some(audio_ref);
        session.duration_seconds = source.duration_seconds;
        session.status = SessionStatus::Uploaded;
        session.message = format!("Re-run of session {}", source.id);
        Ok(session)
    }

    /// Move to `new_status` if the state machine allows it
    pub fn transition_to(&mut self, new_status: SessionStatus) -> Result<StateTransition> {
        if !self.status.can_transition_to(new_status) {
            return Err(Error::InvalidTransition {
                from: self.status.to_string(),
                to: new_status.to_string(),
            });
        }

        let transition = StateTransition {
            session_id: self.id,
            old_status: self.status,
            new_status,
            transitioned_at: Utc::now(),
        };
        self.status = new_status;
        self.updated_at = transition.transitioned_at;
        Ok(transition)
    }

    pub fn is_terminal(&self) -> bool {
        self.status.is_terminal()
    }
}
