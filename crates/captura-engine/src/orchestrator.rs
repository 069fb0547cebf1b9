//! Capture orchestrator: ack-then-process batches over a set of credentials.
//!
//! `start_capture` validates and resolves credentials synchronously, creates
//! the capture log as `in_progress`, hands the batch to a background task and
//! returns the log id. The background task walks the credentials one at a
//! time in tribunal order. Each credential is isolated: a missing portal
//! configuration, a failed login or a failed capture is recorded against that
//! credential and the batch moves on. The capture log row is the only thing
//! pollers observe.
//!
//! Batches run concurrently up to `max_concurrent_batches`; extra batches are
//! acknowledged immediately and wait for a slot.

use std::collections::HashMap;
use std::panic::AssertUnwindSafe;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use captura_core::ports::{
    CaptureLogStore, CapturePerformer, CredentialStore, RawCaptureStore, SessionAuthenticator,
    TribunalConfigProvider,
};
use captura_core::{
    AuthenticationError, CapturaConfig, CaptureLog, CaptureLogQuery, CaptureOutput, CaptureType,
    Credential, RawCaptureRecord, RawStatus, RepoError, order_by_tribunal,
};
use futures::FutureExt;
use serde_json::{Value, json};
use thiserror::Error;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tracing::{error, info, warn};

use crate::credentials::{CredentialResolver, ResolveError};
use crate::lifecycle::{BatchReport, CaptureLogLifecycle, CredentialOutcome, format_credential_error};
use crate::recorder::{AttemptContext, RawCaptureRecorder};

#[derive(Debug, Error)]
pub enum OrchestratorError {
    #[error("no credentials given")]
    NoCredentials,

    #[error("no capture performer registered for {0}")]
    UnsupportedCaptureType(CaptureType),

    #[error(transparent)]
    Resolve(#[from] ResolveError),

    #[error("capture log {0} not found")]
    LogNotFound(i64),

    #[error("store error: {0}")]
    Repo(#[from] RepoError),
}

#[derive(Debug, Clone)]
pub struct CaptureRequest {
    pub capture_type: CaptureType,
    pub advogado_id: i64,
    pub credential_ids: Vec<i64>,
    pub params: Value,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CaptureAck {
    pub log_id: i64,
}

struct Batch {
    ctx: AttemptContext,
    credentials: Vec<Credential>,
    params: Value,
    performer: Arc<dyn CapturePerformer>,
}

struct Inner {
    resolver: CredentialResolver,
    configs: Arc<dyn TribunalConfigProvider>,
    authenticator: Arc<dyn SessionAuthenticator>,
    performers: HashMap<CaptureType, Arc<dyn CapturePerformer>>,
    lifecycle: CaptureLogLifecycle,
    recorder: RawCaptureRecorder,
    auth_timeout: Duration,
    slots: Arc<Semaphore>,
}

pub struct CaptureOrchestratorBuilder {
    credentials: Arc<dyn CredentialStore>,
    configs: Arc<dyn TribunalConfigProvider>,
    authenticator: Arc<dyn SessionAuthenticator>,
    logs: Arc<dyn CaptureLogStore>,
    raw: Arc<dyn RawCaptureStore>,
    performers: HashMap<CaptureType, Arc<dyn CapturePerformer>>,
    config: CapturaConfig,
}

impl CaptureOrchestratorBuilder {
    pub fn performer(mut self, capture_type: CaptureType, performer: Arc<dyn CapturePerformer>) -> Self {
        self.performers.insert(capture_type, performer);
        self
    }

    pub fn config(mut self, config: CapturaConfig) -> Self {
        self.config = config;
        self
    }

    pub fn build(self) -> CaptureOrchestrator {
        let inner = Inner {
            resolver: CredentialResolver::new(self.credentials, self.config.credential_cache_ttl),
            configs: self.configs,
            authenticator: self.authenticator,
            performers: self.performers,
            lifecycle: CaptureLogLifecycle::new(self.logs),
            recorder: RawCaptureRecorder::new(self.raw),
            auth_timeout: self.config.auth_timeout,
            slots: Arc::new(Semaphore::new(self.config.max_concurrent_batches.max(1))),
        };
        CaptureOrchestrator {
            inner: Arc::new(inner),
            tasks: Mutex::new(JoinSet::new()),
        }
    }
}

pub struct CaptureOrchestrator {
    inner: Arc<Inner>,
    tasks: Mutex<JoinSet<()>>,
}

impl CaptureOrchestrator {
    pub fn builder(
        credentials: Arc<dyn CredentialStore>,
        configs: Arc<dyn TribunalConfigProvider>,
        authenticator: Arc<dyn SessionAuthenticator>,
        logs: Arc<dyn CaptureLogStore>,
        raw: Arc<dyn RawCaptureStore>,
    ) -> CaptureOrchestratorBuilder {
        CaptureOrchestratorBuilder {
            credentials,
            configs,
            authenticator,
            logs,
            raw,
            performers: HashMap::new(),
            config: CapturaConfig::default(),
        }
    }

    /// Validate, create the capture log and schedule the batch. Returns as
    /// soon as the log exists; nothing is written when this fails.
    ///
    /// Must be called from within a tokio runtime.
    pub async fn start_capture(&self, request: CaptureRequest) -> Result<CaptureAck, OrchestratorError> {
        if request.credential_ids.is_empty() {
            return Err(OrchestratorError::NoCredentials);
        }
        let performer = self
            .inner
            .performers
            .get(&request.capture_type)
            .cloned()
            .ok_or(OrchestratorError::UnsupportedCaptureType(request.capture_type))?;
        let credentials = self
            .inner
            .resolver
            .resolve(request.advogado_id, &request.credential_ids)
            .await?;
        let credentials = order_by_tribunal(credentials);

        let log = self
            .inner
            .lifecycle
            .begin(
                request.capture_type,
                request.advogado_id,
                credentials.iter().map(|c| c.id).collect(),
            )
            .await?;
        info!(
            log_id = log.id,
            capture_type = %request.capture_type,
            advogado_id = request.advogado_id,
            credentials = credentials.len(),
            "capture batch accepted"
        );

        let batch = Batch {
            ctx: AttemptContext {
                capture_log_id: log.id,
                capture_type: request.capture_type,
                advogado_id: request.advogado_id,
            },
            credentials,
            params: request.params,
            performer,
        };
        let inner = Arc::clone(&self.inner);
        let mut tasks = self.tasks.lock().unwrap_or_else(PoisonError::into_inner);
        while tasks.try_join_next().is_some() {}
        tasks.spawn(async move {
            let _slot = inner.slots.clone().acquire_owned().await.ok();
            inner.run_batch(batch).await;
        });
        Ok(CaptureAck { log_id: log.id })
    }

    /// Current state of a capture log, for polling.
    pub async fn get_capture_log(&self, log_id: i64) -> Result<CaptureLog, OrchestratorError> {
        self.inner
            .lifecycle
            .get(log_id)
            .await?
            .ok_or(OrchestratorError::LogNotFound(log_id))
    }

    pub async fn list_capture_logs(
        &self,
        query: &CaptureLogQuery,
    ) -> Result<Vec<CaptureLog>, OrchestratorError> {
        Ok(self.inner.lifecycle.list(query).await?)
    }

    pub async fn raw_records(&self, log_id: i64) -> Result<Vec<RawCaptureRecord>, OrchestratorError> {
        Ok(self.inner.recorder.list_for_log(log_id).await?)
    }

    /// Wait for every batch started so far to finish.
    pub async fn drain(&self) {
        let mut tasks = {
            let mut guard = self.tasks.lock().unwrap_or_else(PoisonError::into_inner);
            std::mem::take(&mut *guard)
        };
        while let Some(res) = tasks.join_next().await {
            if let Err(e) = res {
                error!(error = %e, "capture batch task failed");
            }
        }
    }
}

impl Inner {
    async fn run_batch(&self, batch: Batch) {
        let log_id = batch.ctx.capture_log_id;
        let mut report = BatchReport::default();
        let walked = AssertUnwindSafe(self.walk(&batch, &mut report))
            .catch_unwind()
            .await;
        if walked.is_err() {
            error!(log_id, "capture batch panicked");
            report.errors.push("capture batch aborted by an internal panic".into());
        }
        // finish() already logs its failure; the row stays in_progress.
        let _ = self.lifecycle.finish(log_id, &report).await;
    }

    async fn walk(&self, batch: &Batch, report: &mut BatchReport) {
        for credential in &batch.credentials {
            let (outcome, errors) = self.attempt(batch, credential).await;
            report.push(outcome, errors);
        }
    }

    /// One credential, start to finish. Never fails; every problem becomes
    /// an error entry and an `error` audit row.
    async fn attempt(&self, batch: &Batch, credential: &Credential) -> (CredentialOutcome, Vec<String>) {
        let log_id = batch.ctx.capture_log_id;
        let request = json!({
            "tipo_captura": batch.ctx.capture_type,
            "credencial_id": credential.id,
            "tribunal": credential.tribunal,
            "grau": credential.instance,
            "parametros": batch.params,
        });

        let config = match self.configs.resolve(&credential.tribunal, credential.instance).await {
            Ok(Some(config)) => config,
            Ok(None) => {
                let msg = format!(
                    "tribunal configuration not found for {} {}",
                    credential.tribunal, credential.instance
                );
                return self.failed(batch, credential, request, msg, None, Vec::new()).await;
            }
            Err(e) => {
                let msg = format!("tribunal configuration lookup failed: {e}");
                return self.failed(batch, credential, request, msg, None, Vec::new()).await;
            }
        };

        let limit = config
            .custom_timeouts
            .login_ms
            .map(Duration::from_millis)
            .unwrap_or(self.auth_timeout);
        let authenticated =
            tokio::time::timeout(limit, self.authenticator.authenticate(credential, &config)).await;
        let session = match authenticated {
            Ok(Ok(session)) => session,
            Ok(Err(e)) => {
                let msg = format!("authentication failed: {e}");
                return self.failed(batch, credential, request, msg, None, Vec::new()).await;
            }
            Err(_) => {
                let e = AuthenticationError::Timeout(limit.as_millis() as u64);
                let msg = format!("authentication failed: {e}");
                return self.failed(batch, credential, request, msg, None, Vec::new()).await;
            }
        };

        let performed = AssertUnwindSafe(batch.performer.perform(&session, &batch.params))
            .catch_unwind()
            .await;
        self.authenticator.close(session).await;

        match performed {
            Ok(Ok(output)) => self.succeeded(batch, credential, request, output).await,
            Ok(Err(e)) => {
                let msg = format!("capture failed: {}", e.message);
                self.failed(batch, credential, request, msg, e.partial_payload, e.logs)
                    .await
            }
            Err(_) => {
                warn!(log_id, credential_id = credential.id, "capture performer panicked");
                let msg = "capture failed: performer panicked".to_string();
                self.failed(batch, credential, request, msg, None, Vec::new()).await
            }
        }
    }

    async fn succeeded(
        &self,
        batch: &Batch,
        credential: &Credential,
        request: Value,
        output: CaptureOutput,
    ) -> (CredentialOutcome, Vec<String>) {
        let mut errors = Vec::new();
        let raw_log_id = match self
            .recorder
            .record_success(batch.ctx, credential, request, &output)
            .await
        {
            Ok(record) => Some(record.external_id),
            Err(e) => {
                errors.push(self.audit_error(credential, &e));
                None
            }
        };
        for derived in &output.derived {
            if let Err(e) = self.recorder.record_derived(batch.ctx, credential, derived).await {
                errors.push(self.audit_error(credential, &e));
            }
        }
        info!(
            log_id = batch.ctx.capture_log_id,
            credential_id = credential.id,
            tribunal = %credential.tribunal,
            derived = output.derived.len(),
            "credential captured"
        );
        let outcome = CredentialOutcome {
            credential_id: credential.id,
            tribunal: credential.tribunal.clone(),
            instance: credential.instance,
            status: RawStatus::Success,
            result: Some(output.processed_result),
            error: None,
            raw_log_id,
        };
        (outcome, errors)
    }

    async fn failed(
        &self,
        batch: &Batch,
        credential: &Credential,
        request: Value,
        message: String,
        partial_payload: Option<Value>,
        logs: Vec<String>,
    ) -> (CredentialOutcome, Vec<String>) {
        warn!(
            log_id = batch.ctx.capture_log_id,
            credential_id = credential.id,
            tribunal = %credential.tribunal,
            error = %message,
            "credential attempt failed"
        );
        let mut errors = vec![format_credential_error(
            &credential.tribunal,
            credential.instance,
            credential.id,
            &message,
        )];
        let raw_log_id = match self
            .recorder
            .record_failure(batch.ctx, credential, request, &message, partial_payload, logs)
            .await
        {
            Ok(record) => Some(record.external_id),
            Err(e) => {
                errors.push(self.audit_error(credential, &e));
                None
            }
        };
        let outcome = CredentialOutcome {
            credential_id: credential.id,
            tribunal: credential.tribunal.clone(),
            instance: credential.instance,
            status: RawStatus::Error,
            result: None,
            error: Some(message),
            raw_log_id,
        };
        (outcome, errors)
    }

    fn audit_error(&self, credential: &Credential, e: &RepoError) -> String {
        format_credential_error(
            &credential.tribunal,
            credential.instance,
            credential.id,
            &format!("audit row not written: {e}"),
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{FakeAuthenticator, FakePerformer, fixture_store};
    use captura_core::{CaptureExecutionError, CaptureStatus, DerivedPayload};
    use captura_store::MemoryStore;

    fn orchestrator(
        store: &Arc<MemoryStore>,
        auth: Arc<FakeAuthenticator>,
        performer: Arc<FakePerformer>,
    ) -> CaptureOrchestrator {
        CaptureOrchestrator::builder(
            store.clone(),
            store.clone(),
            auth,
            store.clone(),
            store.clone(),
        )
        .performer(CaptureType::Pendentes, performer)
        .build()
    }

    fn request(ids: Vec<i64>) -> CaptureRequest {
        CaptureRequest {
            capture_type: CaptureType::Pendentes,
            advogado_id: 1,
            credential_ids: ids,
            params: json!({}),
        }
    }

    #[tokio::test]
    async fn missing_config_is_isolated_to_its_credential() {
        let store = fixture_store();
        let auth = Arc::new(FakeAuthenticator::default());
        let performer = Arc::new(
            FakePerformer::default().with_payload("TRT2", json!([{"resultado": [{"id": 1}]}])),
        );
        let orch = orchestrator(&store, auth.clone(), performer.clone());

        let ack = orch.start_capture(request(vec![5, 6])).await.unwrap();
        orch.drain().await;

        let log = orch.get_capture_log(ack.log_id).await.unwrap();
        assert_eq!(log.status, CaptureStatus::Error);
        let result = log.result.unwrap();
        assert_eq!(result["credenciais_processadas"], 2);
        let errors = result["erros"].as_array().unwrap();
        assert_eq!(errors.len(), 1);
        assert!(errors[0].as_str().unwrap().contains("(ID 6)"));
        assert!(errors[0].as_str().unwrap().contains("configuration not found"));
        assert_eq!(log.error_message.as_deref(), errors[0].as_str());

        let rows = orch.raw_records(ack.log_id).await.unwrap();
        assert_eq!(rows.len(), 2);
        let by_cred = |id| rows.iter().find(|r| r.credential_id == Some(id)).unwrap();
        assert_eq!(by_cred(5).status, RawStatus::Success);
        assert_eq!(by_cred(6).status, RawStatus::Error);
        assert_eq!(by_cred(5).raw_payload, Some(json!([{"resultado": [{"id": 1}]}])));

        assert_eq!(performer.visited(), vec!["TRT2"]);
        assert_eq!(auth.opened(), auth.closed());
    }

    #[tokio::test]
    async fn credentials_visit_in_numeric_tribunal_order() {
        let store = fixture_store();
        let auth = Arc::new(FakeAuthenticator::default());
        let performer = Arc::new(FakePerformer::default());
        let orch = orchestrator(&store, auth, performer.clone());

        let ack = orch.start_capture(request(vec![7, 5])).await.unwrap();
        orch.drain().await;

        assert_eq!(performer.visited(), vec!["TRT2", "TRT10"]);
        let log = orch.get_capture_log(ack.log_id).await.unwrap();
        assert_eq!(log.status, CaptureStatus::Success);
        assert_eq!(log.credential_ids, vec![5, 7]);
        assert!(log.error_message.is_none());
        assert!(log.finished_at.is_some());
    }

    #[tokio::test]
    async fn fail_fast_errors_write_nothing() {
        let store = fixture_store();
        let orch = orchestrator(
            &store,
            Arc::new(FakeAuthenticator::default()),
            Arc::new(FakePerformer::default()),
        );

        let err = orch.start_capture(request(vec![5, 404])).await.unwrap_err();
        assert!(matches!(err, OrchestratorError::Resolve(ResolveError::NotFound(_))));
        let err = orch.start_capture(request(vec![5, 8])).await.unwrap_err();
        assert!(matches!(
            err,
            OrchestratorError::Resolve(ResolveError::OwnershipMismatch { .. })
        ));
        let err = orch.start_capture(request(vec![])).await.unwrap_err();
        assert!(matches!(err, OrchestratorError::NoCredentials));
        let mut other = request(vec![5]);
        other.capture_type = CaptureType::Timeline;
        let err = orch.start_capture(other).await.unwrap_err();
        assert!(matches!(err, OrchestratorError::UnsupportedCaptureType(_)));

        let logs = orch
            .list_capture_logs(&CaptureLogQuery::default())
            .await
            .unwrap();
        assert!(logs.is_empty());
    }

    #[tokio::test]
    async fn auth_failure_does_not_stop_the_batch() {
        let store = fixture_store();
        let auth = Arc::new(
            FakeAuthenticator::default()
                .failing(5, AuthenticationError::InvalidCredential("bad password".into())),
        );
        let performer = Arc::new(FakePerformer::default());
        let orch = orchestrator(&store, auth.clone(), performer.clone());

        let ack = orch.start_capture(request(vec![5, 7])).await.unwrap();
        orch.drain().await;

        let log = orch.get_capture_log(ack.log_id).await.unwrap();
        assert_eq!(log.status, CaptureStatus::Error);
        assert!(log.error_message.unwrap().contains("bad password"));
        assert_eq!(performer.visited(), vec!["TRT10"]);
        assert_eq!(auth.opened(), 1);
        assert_eq!(auth.closed(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn auth_timeout_is_a_per_credential_error() {
        let store = fixture_store();
        let auth = Arc::new(FakeAuthenticator::default().stalling(5, Duration::from_secs(120)));
        let performer = Arc::new(FakePerformer::default());
        let orch = orchestrator(&store, auth, performer.clone());

        let ack = orch.start_capture(request(vec![5, 7])).await.unwrap();
        orch.drain().await;

        let log = orch.get_capture_log(ack.log_id).await.unwrap();
        assert_eq!(log.status, CaptureStatus::Error);
        assert!(log.error_message.unwrap().contains("timed out after 30000 ms"));
        assert_eq!(performer.visited(), vec!["TRT10"]);
    }

    #[tokio::test]
    async fn capture_failure_keeps_partial_payload_and_closes_session() {
        let store = fixture_store();
        let auth = Arc::new(FakeAuthenticator::default());
        let performer = Arc::new(FakePerformer::default().failing(
            "TRT2",
            CaptureExecutionError::new("page 2 failed")
                .with_partial_payload(json!([{"resultado": [1]}]))
                .with_logs(vec!["page 1 ok".into()]),
        ));
        let orch = orchestrator(&store, auth.clone(), performer);

        let ack = orch.start_capture(request(vec![5])).await.unwrap();
        orch.drain().await;

        let rows = orch.raw_records(ack.log_id).await.unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].status, RawStatus::Error);
        assert_eq!(rows[0].raw_payload, Some(json!([{"resultado": [1]}])));
        assert_eq!(rows[0].logs, vec!["page 1 ok".to_string()]);
        assert!(rows[0].error.as_deref().unwrap().contains("page 2 failed"));
        assert_eq!(auth.opened(), 1);
        assert_eq!(auth.closed(), 1);
    }

    #[tokio::test]
    async fn performer_panic_is_contained() {
        let store = fixture_store();
        let auth = Arc::new(FakeAuthenticator::default());
        let performer = Arc::new(FakePerformer::default().panicking("TRT2"));
        let orch = orchestrator(&store, auth.clone(), performer.clone());

        let ack = orch.start_capture(request(vec![5, 7])).await.unwrap();
        orch.drain().await;

        let log = orch.get_capture_log(ack.log_id).await.unwrap();
        assert_eq!(log.status, CaptureStatus::Error);
        assert!(log.error_message.unwrap().contains("panicked"));
        assert_eq!(performer.visited(), vec!["TRT2", "TRT10"]);
        assert_eq!(auth.opened(), 2);
        assert_eq!(auth.closed(), 2);
    }

    #[tokio::test]
    async fn derived_payloads_get_their_own_rows() {
        let store = fixture_store();
        let performer = Arc::new(FakePerformer::default().with_derived(DerivedPayload {
            capture_type: CaptureType::Partes,
            request: json!({"processo_id": 10}),
            raw_payload: json!([{"nome": "A", "cpf": "1"}]),
        }));
        let orch = orchestrator(&store, Arc::new(FakeAuthenticator::default()), performer);

        let ack = orch.start_capture(request(vec![5])).await.unwrap();
        orch.drain().await;

        let rows = orch.raw_records(ack.log_id).await.unwrap();
        assert_eq!(rows.len(), 2);
        assert!(rows.iter().any(|r| r.capture_type == CaptureType::Partes));
        let log = orch.get_capture_log(ack.log_id).await.unwrap();
        assert_eq!(log.status, CaptureStatus::Success);
        assert_eq!(log.result.unwrap()["credenciais_processadas"], 1);
    }

    #[tokio::test]
    async fn ack_returns_before_batch_completes() {
        let store = fixture_store();
        let auth = Arc::new(FakeAuthenticator::default().stalling(5, Duration::from_millis(200)));
        let orch = orchestrator(&store, auth, Arc::new(FakePerformer::default()));

        let ack = orch.start_capture(request(vec![5])).await.unwrap();
        let log = orch.get_capture_log(ack.log_id).await.unwrap();
        assert_eq!(log.status, CaptureStatus::InProgress);
        assert!(log.finished_at.is_none());

        orch.drain().await;
        let log = orch.get_capture_log(ack.log_id).await.unwrap();
        assert_eq!(log.status, CaptureStatus::Success);
    }

    #[tokio::test]
    async fn unknown_log_is_not_found() {
        let store = fixture_store();
        let orch = orchestrator(
            &store,
            Arc::new(FakeAuthenticator::default()),
            Arc::new(FakePerformer::default()),
        );
        assert!(matches!(
            orch.get_capture_log(999).await,
            Err(OrchestratorError::LogNotFound(999))
        ));
    }
}
