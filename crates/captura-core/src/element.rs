//! Elements: atomic persistable units discovered inside a raw payload.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::ParseError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ElementType {
    Parte,
    Endereco,
    Representante,
    Pendente,
    Audiencia,
    Processo,
}

impl ElementType {
    pub const ALL: [ElementType; 6] = [
        Self::Parte,
        Self::Endereco,
        Self::Representante,
        Self::Pendente,
        Self::Audiencia,
        Self::Processo,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Parte => "parte",
            Self::Endereco => "endereco",
            Self::Representante => "representante",
            Self::Pendente => "pendente",
            Self::Audiencia => "audiencia",
            Self::Processo => "processo",
        }
    }
}

impl FromStr for ElementType {
    type Err = ParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::ALL
            .into_iter()
            .find(|t| t.as_str() == s.trim())
            .ok_or_else(|| ParseError::new("element type", s))
    }
}

impl fmt::Display for ElementType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Whether an element is already in the live store.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PersistenceStatus {
    Existente,
    Faltando,
}

impl PersistenceStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Existente => "existente",
            Self::Faltando => "faltando",
        }
    }
}

/// An element classified against the live store. Derived on every call,
/// never persisted as such.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Element {
    pub element_type: ElementType,
    /// Composite identifier, unique within one raw record.
    pub identifier: String,
    pub name: String,
    pub persistence_status: PersistenceStatus,
    pub payload: Value,
    /// Live-store row id when `existente`.
    pub record_id: Option<i64>,
    pub note: Option<String>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ElementFilter {
    #[default]
    Todos,
    Faltantes,
    Existentes,
}

impl ElementFilter {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Todos => "todos",
            Self::Faltantes => "faltantes",
            Self::Existentes => "existentes",
        }
    }

    pub fn matches(&self, element: &Element) -> bool {
        match self {
            Self::Todos => true,
            Self::Faltantes => element.persistence_status == PersistenceStatus::Faltando,
            Self::Existentes => element.persistence_status == PersistenceStatus::Existente,
        }
    }
}

impl FromStr for ElementFilter {
    type Err = ParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim() {
            "todos" => Ok(Self::Todos),
            "faltantes" => Ok(Self::Faltantes),
            "existentes" => Ok(Self::Existentes),
            other => Err(ParseError::new("element filter", other)),
        }
    }
}

/// Shape of an extraction report.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ExtractionMode {
    /// Flat element list, whatever the capture type.
    #[default]
    Generico,
    /// Flat list plus a per-kind breakdown of parties, addresses, representatives.
    Partes,
}

impl FromStr for ExtractionMode {
    type Err = ParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim() {
            "generico" => Ok(Self::Generico),
            "partes" => Ok(Self::Partes),
            other => Err(ParseError::new("extraction mode", other)),
        }
    }
}

/// Live-store row matched by natural key.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StoredElement {
    pub id: i64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct UpsertOutcome {
    pub id: i64,
    pub created: bool,
}
