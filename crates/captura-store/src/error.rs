use captura_core::{ParseError, RepoError};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum StoreError {
    #[cfg(feature = "duckdb")]
    #[error("duckdb error: {0}")]
    DuckDb(#[from] ::duckdb::Error),

    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("corrupt column: {0}")]
    Parse(#[from] ParseError),

    #[error("corrupt timestamp: {0}")]
    Timestamp(#[from] chrono::ParseError),

    #[error("{0}")]
    Other(String),
}

impl From<StoreError> for RepoError {
    fn from(e: StoreError) -> Self {
        match e {
            StoreError::Json(e) => RepoError::Serialization(e),
            other => RepoError::Backend(other.to_string()),
        }
    }
}
