//! Seams between the engine and everything it does not own: backing stores,
//! portal sessions, and the per-capture-type scraping step.
//!
//! All traits are object-safe (`async_trait`) so the engine can hold them as
//! `Arc<dyn ...>` and tests can swap in fakes.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::capture::{
    CaptureCompletion, CaptureLog, CaptureLogQuery, CaptureOutput, CaptureStatus, NewCaptureLog,
    NewRawCapture, RawCaptureRecord,
};
use crate::credential::{Credential, InstanceLevel, TribunalCode};
use crate::element::{ElementType, StoredElement, UpsertOutcome};
use crate::error::{AuthenticationError, CaptureExecutionError, RepoError};
use crate::schedule::{NewSchedule, Schedule};
use crate::session::Session;
use crate::tribunal::TribunalConfig;

// ── Repositories ──

#[async_trait]
pub trait CredentialStore: Send + Sync {
    async fn credential(&self, id: i64) -> Result<Option<Credential>, RepoError>;
}

#[async_trait]
pub trait TribunalConfigProvider: Send + Sync {
    async fn resolve(
        &self,
        tribunal: &TribunalCode,
        instance: InstanceLevel,
    ) -> Result<Option<TribunalConfig>, RepoError>;
}

#[async_trait]
pub trait CaptureLogStore: Send + Sync {
    async fn create(&self, log: NewCaptureLog) -> Result<CaptureLog, RepoError>;

    async fn get(&self, id: i64) -> Result<Option<CaptureLog>, RepoError>;

    /// Newest first.
    async fn list(&self, query: &CaptureLogQuery) -> Result<Vec<CaptureLog>, RepoError>;

    /// Move a non-terminal log from `from` to `to`. Fails with
    /// `InvalidTransition` when the row is not currently in `from`.
    async fn transition(
        &self,
        id: i64,
        from: CaptureStatus,
        to: CaptureStatus,
    ) -> Result<CaptureLog, RepoError>;

    /// Apply the single terminal write. Atomic: either every field lands or
    /// none does. Fails with `TerminalLog` if the row is already terminal.
    async fn complete(&self, id: i64, completion: CaptureCompletion)
    -> Result<CaptureLog, RepoError>;
}

/// Append-only audit trail. There is deliberately no update method.
#[async_trait]
pub trait RawCaptureStore: Send + Sync {
    async fn insert(&self, record: NewRawCapture) -> Result<RawCaptureRecord, RepoError>;

    async fn get(&self, external_id: &str) -> Result<Option<RawCaptureRecord>, RepoError>;

    async fn list_for_log(&self, capture_log_id: i64) -> Result<Vec<RawCaptureRecord>, RepoError>;
}

/// Live store of persisted elements, keyed by `(type, natural key)`.
#[async_trait]
pub trait PersistenceStore: Send + Sync {
    async fn find(&self, kind: ElementType, key: &str) -> Result<Option<StoredElement>, RepoError>;

    /// Insert or update by natural key. Repeating the call with the same
    /// payload leaves one row.
    async fn upsert(
        &self,
        kind: ElementType,
        key: &str,
        payload: &Value,
    ) -> Result<UpsertOutcome, RepoError>;
}

/// One recorded event in a sliding window.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WindowEntry {
    pub at_ms: i64,
    /// Unique per event so equal timestamps stay distinct.
    pub member: String,
}

/// Window contents at a given version, for compare-and-swap.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct WindowSnapshot {
    pub entries: Vec<WindowEntry>,
    pub version: u64,
}

/// Versioned key/value store behind the rate limiter.
///
/// Implementations report an unreachable backend as `RepoError::Unavailable`.
#[async_trait]
pub trait WindowStore: Send + Sync {
    async fn load(&self, key: &str) -> Result<Option<WindowSnapshot>, RepoError>;

    /// Replace the window only if its version still equals `expected`
    /// (`None` = key must not exist). Returns `false` on conflict.
    async fn compare_and_swap(
        &self,
        key: &str,
        expected: Option<u64>,
        entries: Vec<WindowEntry>,
        expires_at_ms: i64,
    ) -> Result<bool, RepoError>;

    async fn remove(&self, key: &str) -> Result<(), RepoError>;

    /// Drop every window whose `expires_at_ms` is at or before `now_ms`.
    /// Returns how many were removed.
    async fn purge_expired(&self, now_ms: i64) -> Result<usize, RepoError>;
}

#[async_trait]
pub trait ScheduleStore: Send + Sync {
    async fn create(&self, schedule: NewSchedule) -> Result<Schedule, RepoError>;

    /// Active schedules with `next_run <= now`.
    async fn due(&self, now: DateTime<Utc>) -> Result<Vec<Schedule>, RepoError>;

    /// Set `next_run` to `next` only if it still equals `expected`.
    async fn advance(
        &self,
        id: i64,
        expected: DateTime<Utc>,
        next: DateTime<Utc>,
    ) -> Result<bool, RepoError>;

    async fn mark_run(&self, id: i64, at: DateTime<Utc>) -> Result<(), RepoError>;
}

// ── External collaborators ──

#[async_trait]
pub trait SessionAuthenticator: Send + Sync {
    async fn authenticate(
        &self,
        credential: &Credential,
        config: &TribunalConfig,
    ) -> Result<Session, AuthenticationError>;

    /// Release a session. Consumes the handle so it cannot be reused.
    async fn close(&self, session: Session);
}

/// Runs one capture against an open session. One implementation per
/// capture type.
#[async_trait]
pub trait CapturePerformer: Send + Sync {
    async fn perform(
        &self,
        session: &Session,
        params: &Value,
    ) -> Result<CaptureOutput, CaptureExecutionError>;
}
