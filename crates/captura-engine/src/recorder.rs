use std::sync::Arc;

use captura_core::ports::RawCaptureStore;
use captura_core::{
    CaptureOutput, CaptureType, Credential, DerivedPayload, NewRawCapture, RawCaptureRecord,
    RawStatus, RepoError,
};
use chrono::Utc;
use serde_json::Value;
use tracing::{debug, error};

/// Batch-level context shared by every audit row of one run.
#[derive(Debug, Clone, Copy)]
pub struct AttemptContext {
    pub capture_log_id: i64,
    pub capture_type: CaptureType,
    pub advogado_id: i64,
}

/// Appends immutable audit rows (`captura_raw_log`), one per attempt.
pub struct RawCaptureRecorder {
    store: Arc<dyn RawCaptureStore>,
}

impl RawCaptureRecorder {
    pub fn new(store: Arc<dyn RawCaptureStore>) -> Self {
        Self { store }
    }

    fn row(
        ctx: AttemptContext,
        credential: &Credential,
        capture_type: CaptureType,
        status: RawStatus,
        request: Value,
    ) -> NewRawCapture {
        NewRawCapture {
            capture_log_id: ctx.capture_log_id,
            capture_type,
            advogado_id: ctx.advogado_id,
            credential_id: Some(credential.id),
            tribunal: credential.tribunal.clone(),
            instance: credential.instance,
            status,
            request,
            raw_payload: None,
            processed_result: None,
            logs: Vec::new(),
            error: None,
            created_at: Utc::now(),
        }
    }

    async fn insert(&self, row: NewRawCapture) -> Result<RawCaptureRecord, RepoError> {
        let log_id = row.capture_log_id;
        let credential_id = row.credential_id;
        match self.store.insert(row).await {
            Ok(record) => {
                debug!(
                    log_id,
                    external_id = %record.external_id,
                    status = record.status.as_str(),
                    "raw capture recorded"
                );
                Ok(record)
            }
            Err(e) => {
                error!(log_id, ?credential_id, error = %e, "failed to write raw capture row");
                Err(e)
            }
        }
    }

    pub async fn record_success(
        &self,
        ctx: AttemptContext,
        credential: &Credential,
        request: Value,
        output: &CaptureOutput,
    ) -> Result<RawCaptureRecord, RepoError> {
        let mut row = Self::row(ctx, credential, ctx.capture_type, RawStatus::Success, request);
        row.raw_payload = Some(output.raw_payload.clone());
        row.processed_result = Some(output.processed_result.clone());
        row.logs = output.logs.clone();
        self.insert(row).await
    }

    pub async fn record_failure(
        &self,
        ctx: AttemptContext,
        credential: &Credential,
        request: Value,
        message: &str,
        partial_payload: Option<Value>,
        logs: Vec<String>,
    ) -> Result<RawCaptureRecord, RepoError> {
        let mut row = Self::row(ctx, credential, ctx.capture_type, RawStatus::Error, request);
        row.raw_payload = partial_payload;
        row.logs = logs;
        row.error = Some(message.to_string());
        self.insert(row).await
    }

    /// Audit row for a sub-payload captured alongside the main one.
    pub async fn record_derived(
        &self,
        ctx: AttemptContext,
        credential: &Credential,
        derived: &DerivedPayload,
    ) -> Result<RawCaptureRecord, RepoError> {
        let mut row = Self::row(
            ctx,
            credential,
            derived.capture_type,
            RawStatus::Success,
            derived.request.clone(),
        );
        row.raw_payload = Some(derived.raw_payload.clone());
        self.insert(row).await
    }

    pub async fn get(&self, external_id: &str) -> Result<Option<RawCaptureRecord>, RepoError> {
        self.store.get(external_id).await
    }

    pub async fn list_for_log(&self, log_id: i64) -> Result<Vec<RawCaptureRecord>, RepoError> {
        self.store.list_for_log(log_id).await
    }
}
