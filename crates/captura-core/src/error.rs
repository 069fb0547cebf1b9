use serde_json::Value;
use thiserror::Error;

use crate::capture::CaptureStatus;

/// A textual value that does not name a known domain variant.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("invalid {kind}: {value:?}")]
pub struct ParseError {
    pub kind: &'static str,
    pub value: String,
}

impl ParseError {
    pub fn new(kind: &'static str, value: impl Into<String>) -> Self {
        Self {
            kind,
            value: value.into(),
        }
    }
}

/// Failure reported by a repository (log, audit, credential, element or
/// rate-limit store).
#[derive(Debug, Error)]
pub enum RepoError {
    /// The backing store cannot be reached at all.
    #[error("backing store unavailable: {0}")]
    Unavailable(String),

    #[error("capture log {0} is terminal and can no longer change")]
    TerminalLog(i64),

    #[error("capture log {id}: invalid transition {from} -> {to}")]
    InvalidTransition {
        id: i64,
        from: CaptureStatus,
        to: CaptureStatus,
    },

    #[error("not found: {0}")]
    NotFound(String),

    #[error("serialisation error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("{0}")]
    Backend(String),
}

/// Why a portal login failed.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum AuthenticationError {
    #[error("invalid credential: {0}")]
    InvalidCredential(String),

    #[error("authentication timed out after {0} ms")]
    Timeout(u64),

    /// The portal answered, but not in the shape the login flow expects.
    #[error("portal changed: {0}")]
    PortalChanged(String),

    #[error("portal transport error: {0}")]
    Transport(String),

    #[error("secret unavailable: {0}")]
    SecretUnavailable(String),
}

/// Failure raised by a capture performer, with whatever it managed to fetch.
#[derive(Debug, Clone, Error)]
#[error("{message}")]
pub struct CaptureExecutionError {
    pub message: String,
    pub partial_payload: Option<Value>,
    pub logs: Vec<String>,
}

impl CaptureExecutionError {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            partial_payload: None,
            logs: Vec::new(),
        }
    }

    pub fn with_partial_payload(mut self, payload: Value) -> Self {
        self.partial_payload = Some(payload);
        self
    }

    pub fn with_logs(mut self, logs: Vec<String>) -> Self {
        self.logs = logs;
        self
    }
}
