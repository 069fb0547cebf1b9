//! Domain model for captura: credentials and tribunal ordering, capture logs
//! and their audit rows, reconciliation elements, schedules, and the traits
//! the engine uses to reach stores and court portals.

pub mod capture;
pub mod config;
pub mod credential;
pub mod element;
pub mod error;
pub mod ports;
pub mod schedule;
pub mod session;
pub mod tribunal;

pub use capture::{
    CaptureCompletion, CaptureLog, CaptureLogQuery, CaptureOutput, CaptureStatus, CaptureType,
    DerivedPayload, NewCaptureLog, NewRawCapture, RawCaptureRecord, RawStatus,
};
pub use config::{CapturaConfig, FailMode};
pub use credential::{Credential, InstanceLevel, TribunalCode, order_by_tribunal, tribunal_number};
pub use element::{
    Element, ElementFilter, ElementType, ExtractionMode, PersistenceStatus, StoredElement,
    UpsertOutcome,
};
pub use error::{AuthenticationError, CaptureExecutionError, ParseError, RepoError};
pub use schedule::{NewSchedule, Periodicity, Schedule, next_run_after, parse_time_of_day};
pub use session::Session;
pub use tribunal::{CustomTimeouts, TribunalConfig};
