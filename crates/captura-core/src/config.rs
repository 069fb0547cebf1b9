use std::fmt;
use std::str::FromStr;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::ParseError;

/// Rate-limiter behaviour when its backing store cannot be reached.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FailMode {
    /// Admit every request.
    Open,
    /// Reject every request with `redis_unavailable`.
    #[default]
    Closed,
}

impl FailMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Open => "open",
            Self::Closed => "closed",
        }
    }
}

impl FromStr for FailMode {
    type Err = ParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "open" => Ok(Self::Open),
            "closed" => Ok(Self::Closed),
            _ => Err(ParseError::new("rate limit fail mode", s)),
        }
    }
}

impl fmt::Display for FailMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Process-wide settings shared by the engine components.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct CapturaConfig {
    /// Login timeout when the tribunal config carries no override.
    #[serde(with = "millis")]
    pub auth_timeout: Duration,
    /// Batches running at once; further batches queue after their ack.
    pub max_concurrent_batches: usize,
    #[serde(with = "millis")]
    pub credential_cache_ttl: Duration,
    pub rate_limit_fail_mode: FailMode,
    #[serde(with = "millis")]
    pub scheduler_poll_interval: Duration,
}

impl Default for CapturaConfig {
    fn default() -> Self {
        Self {
            auth_timeout: Duration::from_secs(30),
            max_concurrent_batches: 4,
            credential_cache_ttl: Duration::from_secs(300),
            rate_limit_fail_mode: FailMode::Closed,
            scheduler_poll_interval: Duration::from_secs(60),
        }
    }
}

mod millis {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_u64(d.as_millis() as u64)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Duration, D::Error> {
        u64::deserialize(d).map(Duration::from_millis)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults() {
        let cfg = CapturaConfig::default();
        assert_eq!(cfg.auth_timeout, Duration::from_secs(30));
        assert_eq!(cfg.max_concurrent_batches, 4);
        assert_eq!(cfg.rate_limit_fail_mode, FailMode::Closed);
    }

    #[test]
    fn partial_json_fills_defaults() {
        let cfg: CapturaConfig =
            serde_json::from_str(r#"{"auth_timeout": 5000, "rate_limit_fail_mode": "open"}"#)
                .unwrap();
        assert_eq!(cfg.auth_timeout, Duration::from_secs(5));
        assert_eq!(cfg.rate_limit_fail_mode, FailMode::Open);
        assert_eq!(cfg.credential_cache_ttl, Duration::from_secs(300));
    }

    #[test]
    fn fail_mode_parse() {
        assert_eq!("OPEN".parse::<FailMode>().unwrap(), FailMode::Open);
        assert_eq!("closed".parse::<FailMode>().unwrap(), FailMode::Closed);
        assert!("maybe".parse::<FailMode>().is_err());
    }
}
