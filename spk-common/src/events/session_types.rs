//! Session lifecycle status

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Session status
///
/// `initialized → recording → uploaded → processing → completed | failed`.
/// A direct upload may skip `recording`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SessionStatus {
    Initialized,
    Recording,
    Uploaded,
    Processing,
    Completed,
    Failed,
}

impl SessionStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            SessionStatus::Initialized => "initialized",
            SessionStatus::Recording => "recording",
            SessionStatus::Uploaded => "uploaded",
            SessionStatus::Processing => "processing",
            SessionStatus::Completed => "completed",
            SessionStatus::Failed => "failed",
        }
    }

    /// Whether `self → next` is an edge of the state machine
    pub fn can_transition_to(&self, next: SessionStatus) -> bool {
        use SessionStatus::*;
        matches!(
            (self, next),
            (Initialized, Recording)
                | (Initialized, Uploaded)
                | (Recording, Uploaded)
                | (Uploaded, Processing)
                | (Processing, Completed)
                | (Processing, Failed)
        )
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, SessionStatus::Completed | SessionStatus::Failed)
    }

    /// Audio has not been persisted yet
    pub fn awaiting_audio(&self) -> bool {
        matches!(self, SessionStatus::Initialized | SessionStatus::Recording)
    }
}

impl fmt::Display for SessionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for SessionStatus {
    type Err = crate::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "initialized" => Ok(SessionStatus::Initialized),
            "recording" => Ok(SessionStatus::Recording),
            "uploaded" => Ok(SessionStatus::Uploaded),
            "processing" => Ok(SessionStatus::Processing),
            "completed" => Ok(SessionStatus::Completed),
            "failed" => Ok(SessionStatus::Failed),
            other => Err(crate::Error::InvalidInput(format!("Unknown session status: {}", other))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const ALL: [SessionStatus; 6] = [
        SessionStatus::Initialized,
        SessionStatus::Recording,
        SessionStatus::Uploaded,
        SessionStatus::Processing,
        SessionStatus::Completed,
        SessionStatus::Failed,
    ];

    #[test]
    fn test_terminal_states_have_no_exits() {
        for from in [SessionStatus::Completed, SessionStatus::Failed] {
            for to in ALL {
                assert!(!from.can_transition_to(to), "{} -> {} must be rejected", from, to);
            }
        }
    }

    #[test]
    fn test_no_backward_transitions() {
        assert!(!SessionStatus::Processing.can_transition_to(SessionStatus::Uploaded));
        assert!(!SessionStatus::Uploaded.can_transition_to(SessionStatus::Recording));
        assert!(!SessionStatus::Recording.can_transition_to(SessionStatus::Initialized));
    }

    #[test]
    fn test_only_uploaded_enters_processing() {
        for from in ALL {
            let allowed = from.can_transition_to(SessionStatus::Processing);
            assert_eq!(allowed, from == SessionStatus::Uploaded);
        }
    }

    #[test]
    fn test_status_string_roundtrip() {
        for status in ALL {
            assert_eq!(status.as_str().parse::<SessionStatus>().unwrap(), status);
        }
    }
}
