//! Recurring capture schedules (`agendamentos`).

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Days, NaiveTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::capture::CaptureType;
use crate::error::ParseError;

/// How often a schedule fires.
///
/// Textual form: `diario` or `a_cada_<n>_dias`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub enum Periodicity {
    Diario,
    ACadaNDias(u32),
}

impl Periodicity {
    /// Days between consecutive runs.
    pub fn interval_days(&self) -> u32 {
        match self {
            Self::Diario => 1,
            Self::ACadaNDias(n) => *n,
        }
    }
}

impl FromStr for Periodicity {
    type Err = ParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.trim();
        if s == "diario" {
            return Ok(Self::Diario);
        }
        let n = s
            .strip_prefix("a_cada_")
            .and_then(|rest| rest.strip_suffix("_dias"))
            .and_then(|n| n.parse::<u32>().ok())
            .filter(|n| *n >= 1)
            .ok_or_else(|| ParseError::new("periodicity", s))?;
        Ok(Self::ACadaNDias(n))
    }
}

impl TryFrom<String> for Periodicity {
    type Error = ParseError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<Periodicity> for String {
    fn from(p: Periodicity) -> Self {
        p.to_string()
    }
}

impl fmt::Display for Periodicity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Diario => f.write_str("diario"),
            Self::ACadaNDias(n) => write!(f, "a_cada_{n}_dias"),
        }
    }
}

/// Parse an `HH:MM` wall-clock time (UTC).
pub fn parse_time_of_day(s: &str) -> Result<NaiveTime, ParseError> {
    NaiveTime::parse_from_str(s.trim(), "%H:%M").map_err(|_| ParseError::new("time of day", s))
}

/// Next fire time strictly after `now`.
///
/// The next occurrence of `time_of_day` after `now`, plus `n - 1` extra days
/// for `a_cada_n_dias`.
pub fn next_run_after(
    periodicity: Periodicity,
    time_of_day: NaiveTime,
    now: DateTime<Utc>,
) -> DateTime<Utc> {
    let today = now.date_naive().and_time(time_of_day).and_utc();
    let first = if today > now {
        today
    } else {
        today + Days::new(1)
    };
    let extra = u64::from(periodicity.interval_days().saturating_sub(1));
    first + Days::new(extra)
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Schedule {
    pub id: i64,
    pub capture_type: CaptureType,
    pub advogado_id: i64,
    pub credential_ids: Vec<i64>,
    pub periodicity: Periodicity,
    pub time_of_day: NaiveTime,
    pub params: Value,
    pub active: bool,
    pub next_run: DateTime<Utc>,
    pub last_run: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone)]
pub struct NewSchedule {
    pub capture_type: CaptureType,
    pub advogado_id: i64,
    pub credential_ids: Vec<i64>,
    pub periodicity: Periodicity,
    pub time_of_day: NaiveTime,
    pub params: Value,
    pub active: bool,
    pub next_run: DateTime<Utc>,
}
