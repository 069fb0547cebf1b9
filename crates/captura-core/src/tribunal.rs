use serde::{Deserialize, Serialize};

use crate::credential::{InstanceLevel, TribunalCode};

/// Per-portal timeout overrides (milliseconds).
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CustomTimeouts {
    pub login_ms: Option<u64>,
    pub api_ms: Option<u64>,
}

/// Endpoints of one portal (tribunal + instance).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TribunalConfig {
    pub tribunal: TribunalCode,
    pub instance: InstanceLevel,
    /// Judicial system behind the portal, e.g. `"PJE"`.
    pub system: String,
    pub base_url: String,
    pub login_url: String,
    pub api_url: String,
    #[serde(default)]
    pub custom_timeouts: CustomTimeouts,
}
