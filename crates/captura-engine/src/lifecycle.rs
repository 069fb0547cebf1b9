//! Batch-level status of a capture run and its final summary.

use std::sync::Arc;

use captura_core::ports::CaptureLogStore;
use captura_core::{
    CaptureCompletion, CaptureLog, CaptureLogQuery, CaptureStatus, CaptureType, InstanceLevel,
    NewCaptureLog, RawStatus, RepoError, TribunalCode,
};
use chrono::Utc;
use serde::Serialize;
use serde_json::{Value, json};
use tracing::{error, info};

/// What happened to one credential inside a batch.
#[derive(Debug, Clone, Serialize)]
pub struct CredentialOutcome {
    #[serde(rename = "credencial_id")]
    pub credential_id: i64,
    pub tribunal: TribunalCode,
    #[serde(rename = "grau")]
    pub instance: InstanceLevel,
    pub status: RawStatus,
    #[serde(rename = "resultado", skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,
    #[serde(rename = "erro", skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    /// External id of the audit row, when it was written.
    #[serde(rename = "raw_log_id", skip_serializing_if = "Option::is_none")]
    pub raw_log_id: Option<String>,
}

/// Running tally of a batch: one outcome per attempted credential plus the
/// flat error list shown to operators.
#[derive(Debug, Clone, Default)]
pub struct BatchReport {
    pub outcomes: Vec<CredentialOutcome>,
    pub errors: Vec<String>,
}

impl BatchReport {
    pub fn push(&mut self, outcome: CredentialOutcome, errors: Vec<String>) {
        self.outcomes.push(outcome);
        self.errors.extend(errors);
    }

    /// `error` if anything failed, even alongside successes.
    pub fn status(&self) -> CaptureStatus {
        if self.errors.is_empty() {
            CaptureStatus::Success
        } else {
            CaptureStatus::Error
        }
    }

    pub fn to_result(&self) -> Value {
        json!({
            "credenciais_processadas": self.outcomes.len(),
            "resultados": self.outcomes,
            "erros": self.errors,
        })
    }

    pub fn error_message(&self) -> Option<String> {
        (!self.errors.is_empty()).then(|| self.errors.join("; "))
    }
}

/// `"<TRT> <grau> (ID <credential>): <message>"`
pub fn format_credential_error(
    tribunal: &TribunalCode,
    instance: InstanceLevel,
    credential_id: i64,
    message: &str,
) -> String {
    format!("{tribunal} {instance} (ID {credential_id}): {message}")
}

/// Owns every status write on `capture_logs`.
pub struct CaptureLogLifecycle {
    store: Arc<dyn CaptureLogStore>,
}

impl CaptureLogLifecycle {
    pub fn new(store: Arc<dyn CaptureLogStore>) -> Self {
        Self { store }
    }

    /// Create the log for an accepted batch, already `in_progress`.
    pub async fn begin(
        &self,
        capture_type: CaptureType,
        advogado_id: i64,
        credential_ids: Vec<i64>,
    ) -> Result<CaptureLog, RepoError> {
        self.store
            .create(NewCaptureLog {
                capture_type,
                advogado_id,
                credential_ids,
                status: CaptureStatus::InProgress,
                started_at: Utc::now(),
            })
            .await
    }

    /// Apply the terminal write for a batch.
    pub async fn finish(&self, log_id: i64, report: &BatchReport) -> Result<CaptureLog, RepoError> {
        let completion = CaptureCompletion {
            status: report.status(),
            result: report.to_result(),
            error_message: report.error_message(),
            finished_at: Utc::now(),
        };
        match self.store.complete(log_id, completion).await {
            Ok(log) => {
                info!(
                    log_id,
                    status = %log.status,
                    processed = report.outcomes.len(),
                    errors = report.errors.len(),
                    "capture batch finished"
                );
                Ok(log)
            }
            Err(e) => {
                error!(log_id, error = %e, "failed to finalise capture log");
                Err(e)
            }
        }
    }

    pub async fn get(&self, log_id: i64) -> Result<Option<CaptureLog>, RepoError> {
        self.store.get(log_id).await
    }

    pub async fn list(&self, query: &CaptureLogQuery) -> Result<Vec<CaptureLog>, RepoError> {
        self.store.list(query).await
    }
}
