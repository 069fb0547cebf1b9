//! Fakes and fixtures shared by the engine's unit tests.

use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use captura_core::ports::{CapturePerformer, SessionAuthenticator};
use captura_core::{
    AuthenticationError, CaptureExecutionError, CaptureOutput, Credential,
    CustomTimeouts, DerivedPayload, InstanceLevel, Session, TribunalConfig,
};
use captura_store::MemoryStore;
use serde_json::{Value, json};

pub fn credential(id: i64, advogado_id: i64, tribunal: &str) -> Credential {
    Credential {
        id,
        advogado_id,
        tribunal: tribunal.parse().unwrap(),
        instance: InstanceLevel::PrimeiroGrau,
        secret_ref: format!("env:SECRET_{id}"),
    }
}

pub fn tribunal_config(tribunal: &str) -> TribunalConfig {
    let host = tribunal.to_ascii_lowercase();
    TribunalConfig {
        tribunal: tribunal.parse().unwrap(),
        instance: InstanceLevel::PrimeiroGrau,
        system: "PJE".into(),
        base_url: format!("https://pje.{host}.jus.br"),
        login_url: format!("https://pje.{host}.jus.br/login"),
        api_url: format!("https://pje.{host}.jus.br/api"),
        custom_timeouts: CustomTimeouts::default(),
    }
}

/// Advogado 1 owns 5 (TRT2), 6 (TRT9), 7 (TRT10); advogado 2 owns 8 (TRT3).
/// Tribunal configs exist for TRT2, TRT3 and TRT10 only.
pub fn fixture_store() -> Arc<MemoryStore> {
    let store = MemoryStore::new();
    store.insert_credential(credential(5, 1, "TRT2")).unwrap();
    store.insert_credential(credential(6, 1, "TRT9")).unwrap();
    store.insert_credential(credential(7, 1, "TRT10")).unwrap();
    store.insert_credential(credential(8, 2, "TRT3")).unwrap();
    for t in ["TRT2", "TRT3", "TRT10"] {
        store.insert_tribunal_config(tribunal_config(t)).unwrap();
    }
    Arc::new(store)
}

/// Counts opened and closed sessions; fails or stalls on demand.
#[derive(Default)]
pub struct FakeAuthenticator {
    opened: AtomicUsize,
    closed: AtomicUsize,
    failures: HashMap<i64, AuthenticationError>,
    stalls: HashMap<i64, Duration>,
}

impl FakeAuthenticator {
    pub fn failing(mut self, credential_id: i64, error: AuthenticationError) -> Self {
        self.failures.insert(credential_id, error);
        self
    }

    pub fn stalling(mut self, credential_id: i64, delay: Duration) -> Self {
        self.stalls.insert(credential_id, delay);
        self
    }

    pub fn opened(&self) -> usize {
        self.opened.load(Ordering::SeqCst)
    }

    pub fn closed(&self) -> usize {
        self.closed.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl SessionAuthenticator for FakeAuthenticator {
    async fn authenticate(
        &self,
        credential: &Credential,
        config: &TribunalConfig,
    ) -> Result<Session, AuthenticationError> {
        if let Some(delay) = self.stalls.get(&credential.id) {
            tokio::time::sleep(*delay).await;
        }
        if let Some(e) = self.failures.get(&credential.id) {
            return Err(e.clone());
        }
        self.opened.fetch_add(1, Ordering::SeqCst);
        Ok(Session::new(
            format!("session-{}", credential.id),
            config.tribunal.clone(),
            config.instance,
            "token",
            config.api_url.clone(),
        ))
    }

    async fn close(&self, _session: Session) {
        self.closed.fetch_add(1, Ordering::SeqCst);
    }
}

/// Returns a canned payload per tribunal and records the visiting order.
#[derive(Default)]
pub struct FakePerformer {
    payloads: HashMap<String, Value>,
    failures: HashMap<String, CaptureExecutionError>,
    panics: Vec<String>,
    derived: Vec<DerivedPayload>,
    pub visited: Mutex<Vec<String>>,
}

impl FakePerformer {
    pub fn with_payload(mut self, tribunal: &str, payload: Value) -> Self {
        self.payloads.insert(tribunal.into(), payload);
        self
    }

    pub fn failing(mut self, tribunal: &str, error: CaptureExecutionError) -> Self {
        self.failures.insert(tribunal.into(), error);
        self
    }

    pub fn panicking(mut self, tribunal: &str) -> Self {
        self.panics.push(tribunal.into());
        self
    }

    pub fn with_derived(mut self, derived: DerivedPayload) -> Self {
        self.derived.push(derived);
        self
    }

    pub fn visited(&self) -> Vec<String> {
        self.visited.lock().unwrap().clone()
    }
}

#[async_trait]
impl CapturePerformer for FakePerformer {
    async fn perform(
        &self,
        session: &Session,
        params: &Value,
    ) -> Result<CaptureOutput, CaptureExecutionError> {
        let tribunal = session.tribunal().to_string();
        self.visited.lock().unwrap().push(tribunal.clone());
        if self.panics.contains(&tribunal) {
            panic!("performer blew up on {tribunal}");
        }
        if let Some(e) = self.failures.get(&tribunal) {
            return Err(e.clone());
        }
        let raw = self
            .payloads
            .get(&tribunal)
            .cloned()
            .unwrap_or_else(|| json!({ "resultado": [], "params": params }));
        Ok(CaptureOutput {
            processed_result: json!({ "tribunal": tribunal }),
            raw_payload: raw,
            logs: vec![format!("captured {tribunal}")],
            derived: self.derived.clone(),
        })
    }
}
