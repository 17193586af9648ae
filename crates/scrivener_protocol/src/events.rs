//! Progress events for ephemeral test runs.
//!
//! Test runs have no persisted run row; their progress is pushed to the
//! subscribers of one session only.

use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

use crate::job::PayloadError;
use crate::types::TokenUsage;

/// Validated test-run session id (a UUID).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SessionId(Uuid);

impl SessionId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    /// Parse a session id. Missing or malformed ids are refused outright.
    pub fn parse(raw: &str) -> Result<Self, PayloadError> {
        let trimmed = raw.trim();
        if trimmed.is_empty() {
            return Err(PayloadError::InvalidSessionId(raw.to_string()));
        }
        Uuid::parse_str(trimmed)
            .map(SessionId)
            .map_err(|_| PayloadError::InvalidSessionId(raw.to_string()))
    }
}

impl Default for SessionId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum ProgressEvent {
    FileStart {
        session_id: SessionId,
        index: u32,
        file_name: String,
        total: u32,
    },
    FileComplete {
        session_id: SessionId,
        index: u32,
        file_name: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        response: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        token_usage: Option<TokenUsage>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        error: Option<String>,
    },
    RunComplete {
        session_id: SessionId,
        completed: u32,
        failed: u32,
        token_usage: TokenUsage,
    },
    RunError {
        session_id: SessionId,
        message: String,
    },
}

impl ProgressEvent {
    pub fn session_id(&self) -> SessionId {
        match self {
            ProgressEvent::FileStart { session_id, .. }
            | ProgressEvent::FileComplete { session_id, .. }
            | ProgressEvent::RunComplete { session_id, .. }
            | ProgressEvent::RunError { session_id, .. } => *session_id,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_session_id_rejects_malformed() {
        assert!(SessionId::parse("").is_err());
        assert!(SessionId::parse("not-a-session").is_err());
        let id = SessionId::new();
        assert_eq!(SessionId::parse(&id.to_string()).unwrap(), id);
    }

    #[test]
    fn test_event_tagging() {
        let session_id = SessionId::new();
        let event = ProgressEvent::RunError {
            session_id,
            message: "boom".into(),
        };
        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(json["event"], "run_error");
        assert_eq!(event.session_id(), session_id);
    }
}
