//! Capture batches (`capture_logs`) and their per-credential audit rows
//! (`captura_raw_log`).

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::credential::{InstanceLevel, TribunalCode};
use crate::error::ParseError;

/// Kind of extraction run against a portal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CaptureType {
    AcervoGeral,
    Arquivados,
    Audiencias,
    Pendentes,
    Partes,
    Combinada,
    Pericias,
    Timeline,
}

impl CaptureType {
    pub const ALL: [CaptureType; 8] = [
        Self::AcervoGeral,
        Self::Arquivados,
        Self::Audiencias,
        Self::Pendentes,
        Self::Partes,
        Self::Combinada,
        Self::Pericias,
        Self::Timeline,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::AcervoGeral => "acervo_geral",
            Self::Arquivados => "arquivados",
            Self::Audiencias => "audiencias",
            Self::Pendentes => "pendentes",
            Self::Partes => "partes",
            Self::Combinada => "combinada",
            Self::Pericias => "pericias",
            Self::Timeline => "timeline",
        }
    }
}

impl FromStr for CaptureType {
    type Err = ParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::ALL
            .into_iter()
            .find(|t| t.as_str() == s.trim())
            .ok_or_else(|| ParseError::new("capture type", s))
    }
}

impl fmt::Display for CaptureType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Batch-level status: `pending → in_progress → success | error`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CaptureStatus {
    Pending,
    InProgress,
    Success,
    Error,
}

impl CaptureStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::InProgress => "in_progress",
            Self::Success => "success",
            Self::Error => "error",
        }
    }

    /// Terminal rows are write-once.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Success | Self::Error)
    }

    /// Transitions only move forward; a batch may fail straight from pending.
    pub fn can_transition_to(&self, next: CaptureStatus) -> bool {
        matches!(
            (self, next),
            (Self::Pending, Self::InProgress)
                | (Self::Pending, Self::Error)
                | (Self::InProgress, Self::Success)
                | (Self::InProgress, Self::Error)
        )
    }
}

impl FromStr for CaptureStatus {
    type Err = ParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim() {
            "pending" => Ok(Self::Pending),
            "in_progress" => Ok(Self::InProgress),
            "success" => Ok(Self::Success),
            "error" => Ok(Self::Error),
            other => Err(ParseError::new("capture status", other)),
        }
    }
}

impl fmt::Display for CaptureStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One capture batch. Created at batch start; mutated only by the
/// orchestrator; frozen once terminal.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CaptureLog {
    pub id: i64,
    pub capture_type: CaptureType,
    pub advogado_id: i64,
    pub credential_ids: Vec<i64>,
    pub status: CaptureStatus,
    pub started_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
    pub result: Option<Value>,
    pub error_message: Option<String>,
}

#[derive(Debug, Clone)]
pub struct NewCaptureLog {
    pub capture_type: CaptureType,
    pub advogado_id: i64,
    pub credential_ids: Vec<i64>,
    pub status: CaptureStatus,
    pub started_at: DateTime<Utc>,
}

/// Terminal write applied exactly once to a capture log.
#[derive(Debug, Clone)]
pub struct CaptureCompletion {
    pub status: CaptureStatus,
    pub result: Value,
    pub error_message: Option<String>,
    pub finished_at: DateTime<Utc>,
}

/// Filter for listing capture logs, newest first.
#[derive(Debug, Clone)]
pub struct CaptureLogQuery {
    pub advogado_id: Option<i64>,
    pub capture_type: Option<CaptureType>,
    pub status: Option<CaptureStatus>,
    pub limit: usize,
    pub offset: usize,
}

impl Default for CaptureLogQuery {
    fn default() -> Self {
        Self {
            advogado_id: None,
            capture_type: None,
            status: None,
            limit: 50,
            offset: 0,
        }
    }
}

impl CaptureLogQuery {
    pub fn matches(&self, log: &CaptureLog) -> bool {
        self.advogado_id.is_none_or(|id| log.advogado_id == id)
            && self.capture_type.is_none_or(|t| log.capture_type == t)
            && self.status.is_none_or(|s| log.status == s)
    }
}

/// Outcome of one credential attempt as recorded in the audit trail.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RawStatus {
    Success,
    Error,
}

impl RawStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Success => "success",
            Self::Error => "error",
        }
    }
}

impl FromStr for RawStatus {
    type Err = ParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim() {
            "success" => Ok(Self::Success),
            "error" => Ok(Self::Error),
            other => Err(ParseError::new("raw capture status", other)),
        }
    }
}

/// Immutable audit row for one capture attempt.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RawCaptureRecord {
    pub external_id: String,
    pub capture_log_id: i64,
    pub capture_type: CaptureType,
    pub advogado_id: i64,
    pub credential_id: Option<i64>,
    pub tribunal: TribunalCode,
    pub instance: InstanceLevel,
    pub status: RawStatus,
    pub request: Value,
    pub raw_payload: Option<Value>,
    pub processed_result: Option<Value>,
    pub logs: Vec<String>,
    pub error: Option<String>,
    pub created_at: DateTime<Utc>,
}

/// Audit row before the store assigns its external id.
#[derive(Debug, Clone)]
pub struct NewRawCapture {
    pub capture_log_id: i64,
    pub capture_type: CaptureType,
    pub advogado_id: i64,
    pub credential_id: Option<i64>,
    pub tribunal: TribunalCode,
    pub instance: InstanceLevel,
    pub status: RawStatus,
    pub request: Value,
    pub raw_payload: Option<Value>,
    pub processed_result: Option<Value>,
    pub logs: Vec<String>,
    pub error: Option<String>,
    pub created_at: DateTime<Utc>,
}

/// What a capture performer hands back on success.
#[derive(Debug, Clone, Default)]
pub struct CaptureOutput {
    pub processed_result: Value,
    pub raw_payload: Value,
    pub logs: Vec<String>,
    /// Sub-payloads captured along the way (e.g. per-process party lists),
    /// each recorded as its own audit row.
    pub derived: Vec<DerivedPayload>,
}

#[derive(Debug, Clone)]
pub struct DerivedPayload {
    pub capture_type: CaptureType,
    pub request: Value,
    pub raw_payload: Value,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_transitions_are_forward_only() {
        use CaptureStatus::*;
        assert!(Pending.can_transition_to(InProgress));
        assert!(InProgress.can_transition_to(Success));
        assert!(InProgress.can_transition_to(Error));
        assert!(!InProgress.can_transition_to(Pending));
        assert!(!Success.can_transition_to(Error));
        assert!(!Error.can_transition_to(Success));
        assert!(!Success.can_transition_to(Success));
    }

    #[test]
    fn terminal_states() {
        assert!(CaptureStatus::Success.is_terminal());
        assert!(CaptureStatus::Error.is_terminal());
        assert!(!CaptureStatus::InProgress.is_terminal());
    }

    #[test]
    fn capture_type_round_trips_through_str() {
        for t in CaptureType::ALL {
            assert_eq!(t.as_str().parse::<CaptureType>().unwrap(), t);
        }
        assert!("acervo".parse::<CaptureType>().is_err());
    }

    #[test]
    fn capture_type_serde_is_snake_case() {
        let json = serde_json::to_string(&CaptureType::AcervoGeral).unwrap();
        assert_eq!(json, "\"acervo_geral\"");
    }

    #[test]
    fn query_matches_filters() {
        let log = CaptureLog {
            id: 1,
            capture_type: CaptureType::Pendentes,
            advogado_id: 7,
            credential_ids: vec![1],
            status: CaptureStatus::InProgress,
            started_at: Utc::now(),
            finished_at: None,
            result: None,
            error_message: None,
        };
        assert!(CaptureLogQuery::default().matches(&log));
        let by_advogado = CaptureLogQuery {
            advogado_id: Some(8),
            ..Default::default()
        };
        assert!(!by_advogado.matches(&log));
        let by_type = CaptureLogQuery {
            capture_type: Some(CaptureType::Pendentes),
            status: Some(CaptureStatus::InProgress),
            ..Default::default()
        };
        assert!(by_type.matches(&log));
    }
}
