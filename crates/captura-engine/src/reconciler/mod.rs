//! Diff recorded raw payloads against the live store.
//!
//! Nothing here is cached: elements are re-extracted from the immutable raw
//! payload and re-classified on every call, so results follow the live store.

mod payload;
mod strategies;

pub use payload::EntityKind;
pub use strategies::{
    ExtractionStrategy, Extracted, ListingStrategy, PartesStrategy, StrategyTable,
};

use std::sync::Arc;

use captura_core::ports::{PersistenceStore, RawCaptureStore};
use captura_core::{
    CaptureType, Element, ElementFilter, ElementType, ExtractionMode, PersistenceStatus,
    RawCaptureRecord, RepoError,
};
use serde::Serialize;
use thiserror::Error;
use tracing::{info, warn};

#[derive(Debug, Error)]
pub enum ReconcileError {
    #[error("raw capture {0} not found")]
    RecordNotFound(String),

    #[error("raw capture {0} has no payload")]
    NoPayload(String),

    #[error("capture type {0} does not support re-persistence")]
    NotRepersistable(CaptureType),

    #[error("raw capture {external_id} payload could not be read: {reason}")]
    CorruptPayload { external_id: String, reason: String },

    #[error("element {identifier} not found in raw capture {external_id}")]
    ElementNotFound {
        external_id: String,
        identifier: String,
    },

    #[error("store error: {0}")]
    Repo(#[from] RepoError),
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct Totals {
    pub total: usize,
    pub existentes: usize,
    pub faltantes: usize,
    /// Elements left after the filter.
    pub filtrados: usize,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct KindTotals {
    pub total: usize,
    pub existentes: usize,
    pub faltantes: usize,
}

impl KindTotals {
    fn count(&mut self, element: &Element) {
        self.total += 1;
        match element.persistence_status {
            PersistenceStatus::Existente => self.existentes += 1,
            PersistenceStatus::Faltando => self.faltantes += 1,
        }
    }
}

/// Per-kind breakdown returned in `partes` mode.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct PartesBreakdown {
    pub partes: KindTotals,
    pub enderecos: KindTotals,
    pub representantes: KindTotals,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ElementsReport {
    pub external_id: String,
    pub capture_type: Option<CaptureType>,
    pub elements: Vec<Element>,
    pub totals: Totals,
    pub supports_repersistence: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub breakdown: Option<PartesBreakdown>,
}

impl ElementsReport {
    fn empty(external_id: &str, capture_type: Option<CaptureType>, message: String) -> Self {
        Self {
            external_id: external_id.to_string(),
            capture_type,
            elements: Vec::new(),
            totals: Totals::default(),
            supports_repersistence: false,
            message: Some(message),
            breakdown: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RepersistOutcome {
    pub identifier: String,
    pub record_id: i64,
    /// `false` when the row already existed and was updated in place.
    pub created: bool,
}

/// Result of one element inside `repersist_missing`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RepersistAttempt {
    pub identifier: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub record_id: Option<i64>,
    pub created: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

struct Loaded {
    record: RawCaptureRecord,
    strategy: Arc<dyn ExtractionStrategy>,
    extracted: Vec<Extracted>,
}

pub struct ElementReconciler {
    raw: Arc<dyn RawCaptureStore>,
    store: Arc<dyn PersistenceStore>,
    strategies: StrategyTable,
}

impl ElementReconciler {
    pub fn new(raw: Arc<dyn RawCaptureStore>, store: Arc<dyn PersistenceStore>) -> Self {
        Self::with_strategies(raw, store, StrategyTable::default())
    }

    pub fn with_strategies(
        raw: Arc<dyn RawCaptureStore>,
        store: Arc<dyn PersistenceStore>,
        strategies: StrategyTable,
    ) -> Self {
        Self {
            raw,
            store,
            strategies,
        }
    }

    async fn load(&self, external_id: &str) -> Result<Loaded, ReconcileError> {
        let record = self
            .raw
            .get(external_id)
            .await?
            .ok_or_else(|| ReconcileError::RecordNotFound(external_id.to_string()))?;
        let Some(raw) = record.raw_payload.as_ref() else {
            return Err(ReconcileError::NoPayload(external_id.to_string()));
        };
        let strategy = self
            .strategies
            .get(record.capture_type)
            .cloned()
            .ok_or(ReconcileError::NotRepersistable(record.capture_type))?;
        let extracted = strategy
            .extract(raw)
            .map_err(|reason| ReconcileError::CorruptPayload {
                external_id: external_id.to_string(),
                reason,
            })?;
        Ok(Loaded {
            record,
            strategy,
            extracted,
        })
    }

    async fn classify(&self, extracted: &[Extracted]) -> Result<Vec<Element>, RepoError> {
        let mut elements = Vec::with_capacity(extracted.len());
        for e in extracted {
            let stored = self.store.find(e.element_type, &e.key).await?;
            elements.push(Element {
                element_type: e.element_type,
                identifier: e.identifier(),
                name: e.name.clone(),
                persistence_status: if stored.is_some() {
                    PersistenceStatus::Existente
                } else {
                    PersistenceStatus::Faltando
                },
                payload: e.payload.clone(),
                record_id: stored.map(|s| s.id),
                note: e.note.clone(),
            });
        }
        Ok(elements)
    }

    /// Classify every element of a raw capture against the live store.
    ///
    /// Never fails: a missing record, an empty or unreadable payload, an
    /// unsupported capture type or an unreachable store all degrade to an
    /// empty report with `supports_repersistence = false` and a message.
    pub async fn extract_elements(
        &self,
        external_id: &str,
        filter: ElementFilter,
        mode: ExtractionMode,
    ) -> ElementsReport {
        let loaded = match self.load(external_id).await {
            Ok(loaded) => loaded,
            Err(ReconcileError::NotRepersistable(capture_type)) => {
                return ElementsReport::empty(
                    external_id,
                    Some(capture_type),
                    format!("element extraction is not available for capture type {capture_type}"),
                );
            }
            Err(e) => {
                warn!(external_id, error = %e, "element extraction degraded");
                return ElementsReport::empty(external_id, None, e.to_string());
            }
        };
        let capture_type = loaded.record.capture_type;

        let classified = match self.classify(&loaded.extracted).await {
            Ok(elements) => elements,
            Err(e) => {
                warn!(external_id, error = %e, "element classification failed");
                return ElementsReport::empty(
                    external_id,
                    Some(capture_type),
                    format!("live store lookup failed: {e}"),
                );
            }
        };

        let mut totals = Totals {
            total: classified.len(),
            ..Totals::default()
        };
        let mut breakdown = PartesBreakdown::default();
        for element in &classified {
            match element.persistence_status {
                PersistenceStatus::Existente => totals.existentes += 1,
                PersistenceStatus::Faltando => totals.faltantes += 1,
            }
            match element.element_type {
                ElementType::Parte => breakdown.partes.count(element),
                ElementType::Endereco => breakdown.enderecos.count(element),
                ElementType::Representante => breakdown.representantes.count(element),
                _ => {}
            }
        }

        let elements: Vec<Element> = classified.into_iter().filter(|e| filter.matches(e)).collect();
        totals.filtrados = elements.len();
        let message = elements
            .is_empty()
            .then(|| format!("no elements match filter {}", filter.as_str()));

        ElementsReport {
            external_id: external_id.to_string(),
            capture_type: Some(capture_type),
            elements,
            totals,
            supports_repersistence: loaded.strategy.supports_repersistence(),
            message,
            breakdown: (mode == ExtractionMode::Partes).then_some(breakdown),
        }
    }

    pub async fn has_gaps(&self, external_id: &str) -> bool {
        self.extract_elements(external_id, ElementFilter::Faltantes, ExtractionMode::Generico)
            .await
            .totals
            .faltantes
            > 0
    }

    fn repersistable(&self, external_id: &str, loaded: &Loaded) -> Result<(), ReconcileError> {
        if loaded.strategy.supports_repersistence() {
            Ok(())
        } else {
            warn!(external_id, capture_type = %loaded.record.capture_type, "re-persistence refused");
            Err(ReconcileError::NotRepersistable(loaded.record.capture_type))
        }
    }

    /// Upsert element `index`, first upserting any missing owner above it.
    async fn persist(&self, extracted: &[Extracted], index: usize) -> Result<RepersistOutcome, RepoError> {
        let mut chain = Vec::new();
        let mut owner = extracted[index].owner;
        while let Some(i) = owner {
            chain.push(i);
            owner = extracted[i].owner;
        }
        for &i in chain.iter().rev() {
            let e = &extracted[i];
            if self.store.find(e.element_type, &e.key).await?.is_none() {
                self.store.upsert(e.element_type, &e.key, &e.payload).await?;
            }
        }

        let e = &extracted[index];
        let outcome = self.store.upsert(e.element_type, &e.key, &e.payload).await?;
        Ok(RepersistOutcome {
            identifier: e.identifier(),
            record_id: outcome.id,
            created: outcome.created,
        })
    }

    /// Re-run persistence for one element. Safe to repeat.
    pub async fn repersist_element(
        &self,
        external_id: &str,
        identifier: &str,
    ) -> Result<RepersistOutcome, ReconcileError> {
        let loaded = self.load(external_id).await?;
        self.repersistable(external_id, &loaded)?;
        let index = loaded
            .extracted
            .iter()
            .position(|e| e.identifier() == identifier)
            .ok_or_else(|| ReconcileError::ElementNotFound {
                external_id: external_id.to_string(),
                identifier: identifier.to_string(),
            })?;
        let outcome = self.persist(&loaded.extracted, index).await?;
        info!(external_id, identifier, record_id = outcome.record_id, created = outcome.created, "element re-persisted");
        Ok(outcome)
    }

    /// Re-persist every element currently reported `faltando`.
    pub async fn repersist_missing(
        &self,
        external_id: &str,
    ) -> Result<Vec<RepersistAttempt>, ReconcileError> {
        let loaded = self.load(external_id).await?;
        self.repersistable(external_id, &loaded)?;
        let classified = self.classify(&loaded.extracted).await?;

        let mut attempts = Vec::new();
        for (index, element) in classified.iter().enumerate() {
            if element.persistence_status != PersistenceStatus::Faltando {
                continue;
            }
            // An owner persisted earlier in this loop is found again, not duplicated.
            let attempt = match self.persist(&loaded.extracted, index).await {
                Ok(outcome) => RepersistAttempt {
                    identifier: outcome.identifier,
                    record_id: Some(outcome.record_id),
                    created: outcome.created,
                    error: None,
                },
                Err(e) => {
                    warn!(external_id, identifier = %element.identifier, error = %e, "element re-persistence failed");
                    RepersistAttempt {
                        identifier: element.identifier.clone(),
                        record_id: None,
                        created: false,
                        error: Some(e.to_string()),
                    }
                }
            };
            attempts.push(attempt);
        }
        info!(external_id, attempted = attempts.len(), "missing elements re-persisted");
        Ok(attempts)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::credential;
    use captura_core::ports::CaptureLogStore;
    use captura_core::{CaptureStatus, InstanceLevel, NewCaptureLog, NewRawCapture, RawStatus};
    use captura_store::MemoryStore;
    use chrono::Utc;
    use serde_json::{Value, json};

    async fn record(store: &MemoryStore, capture_type: CaptureType, raw: Option<Value>) -> String {
        let log = store
            .create(NewCaptureLog {
                capture_type,
                advogado_id: 1,
                credential_ids: vec![5],
                status: CaptureStatus::InProgress,
                started_at: Utc::now(),
            })
            .await
            .unwrap();
        let cred = credential(5, 1, "TRT2");
        RawCaptureStore::insert(
            store,
            NewRawCapture {
                capture_log_id: log.id,
                capture_type,
                advogado_id: 1,
                credential_id: Some(cred.id),
                tribunal: cred.tribunal,
                instance: InstanceLevel::PrimeiroGrau,
                status: RawStatus::Success,
                request: json!({}),
                raw_payload: raw,
                processed_result: None,
                logs: Vec::new(),
                error: None,
                created_at: Utc::now(),
            },
        )
        .await
        .unwrap()
        .external_id
    }

    fn partes_payload() -> Value {
        json!({
            "ATIVO": [{
                "nome": "Maria",
                "cpf": "111.222.333-44",
                "endereco": {"logradouro": "Rua A"},
                "representantes": [{"nome": "Dr. José", "numeroDocumento": "999"}]
            }],
            "PASSIVO": [{"nome": "Empresa", "cnpj": "12.345.678/0001-90"}]
        })
    }

    fn reconciler(store: &Arc<MemoryStore>) -> ElementReconciler {
        ElementReconciler::new(store.clone(), store.clone())
    }

    #[tokio::test]
    async fn classification_follows_live_store() {
        let store = Arc::new(MemoryStore::new());
        let id = record(&store, CaptureType::Partes, Some(partes_payload())).await;
        store
            .upsert(ElementType::Parte, "cliente:11122233344", &json!({}))
            .await
            .unwrap();

        let r = reconciler(&store);
        let report = r
            .extract_elements(&id, ElementFilter::Todos, ExtractionMode::Partes)
            .await;
        assert!(report.supports_repersistence);
        assert_eq!(report.totals.total, 4);
        assert_eq!(report.totals.existentes, 1);
        assert_eq!(report.totals.faltantes, 3);
        assert_eq!(report.totals.filtrados, 4);
        let breakdown = report.breakdown.unwrap();
        assert_eq!(breakdown.partes.total, 2);
        assert_eq!(breakdown.partes.existentes, 1);
        assert_eq!(breakdown.enderecos.total, 1);

        let missing = r
            .extract_elements(&id, ElementFilter::Faltantes, ExtractionMode::Generico)
            .await;
        assert_eq!(missing.totals.filtrados, 3);
        assert!(missing.breakdown.is_none());
        assert!(
            missing
                .elements
                .iter()
                .all(|e| e.persistence_status == PersistenceStatus::Faltando)
        );
    }

    #[tokio::test]
    async fn repeated_extraction_is_identical() {
        let store = Arc::new(MemoryStore::new());
        let id = record(&store, CaptureType::Partes, Some(partes_payload())).await;
        let r = reconciler(&store);
        let a = r.extract_elements(&id, ElementFilter::Todos, ExtractionMode::Generico).await;
        let b = r.extract_elements(&id, ElementFilter::Todos, ExtractionMode::Generico).await;
        assert_eq!(a, b);
    }

    #[tokio::test]
    async fn repersisting_every_gap_converges() {
        let store = Arc::new(MemoryStore::new());
        let id = record(&store, CaptureType::Partes, Some(partes_payload())).await;
        let r = reconciler(&store);
        assert!(r.has_gaps(&id).await);

        let report = r
            .extract_elements(&id, ElementFilter::Faltantes, ExtractionMode::Generico)
            .await;
        // Children first, to exercise owner upserts.
        for element in report.elements.iter().rev() {
            r.repersist_element(&id, &element.identifier).await.unwrap();
        }

        let after = r
            .extract_elements(&id, ElementFilter::Todos, ExtractionMode::Generico)
            .await;
        assert_eq!(after.totals.faltantes, 0);
        assert_eq!(store.element_count().unwrap(), 4);
        assert!(!r.has_gaps(&id).await);
    }

    #[tokio::test]
    async fn repersist_is_idempotent() {
        let store = Arc::new(MemoryStore::new());
        let id = record(&store, CaptureType::Partes, Some(partes_payload())).await;
        let r = reconciler(&store);
        let first = r
            .repersist_element(&id, "parte:parte_contraria:12345678000190")
            .await
            .unwrap();
        let second = r
            .repersist_element(&id, "parte:parte_contraria:12345678000190")
            .await
            .unwrap();
        assert!(first.created);
        assert!(!second.created);
        assert_eq!(first.record_id, second.record_id);
        assert_eq!(store.element_count().unwrap(), 1);
    }

    #[tokio::test]
    async fn repersist_missing_fills_all_gaps() {
        let store = Arc::new(MemoryStore::new());
        let id = record(&store, CaptureType::Partes, Some(partes_payload())).await;
        let r = reconciler(&store);
        let attempts = r.repersist_missing(&id).await.unwrap();
        assert_eq!(attempts.len(), 4);
        assert!(attempts.iter().all(|a| a.error.is_none()));
        assert!(r.repersist_missing(&id).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn flat_types_are_read_only() {
        let store = Arc::new(MemoryStore::new());
        let raw = json!([{"resultado": [{"id": 1}, {"id": 2}]}]);
        let id = record(&store, CaptureType::Pendentes, Some(raw)).await;
        let r = reconciler(&store);

        let report = r
            .extract_elements(&id, ElementFilter::Todos, ExtractionMode::Generico)
            .await;
        assert_eq!(report.totals.total, 2);
        assert!(!report.supports_repersistence);
        assert!(matches!(
            r.repersist_element(&id, "pendente:1").await,
            Err(ReconcileError::NotRepersistable(CaptureType::Pendentes))
        ));
    }

    #[tokio::test]
    async fn bad_records_degrade_to_empty() {
        let store = Arc::new(MemoryStore::new());
        let r = reconciler(&store);

        let missing = r
            .extract_elements("nope", ElementFilter::Todos, ExtractionMode::Generico)
            .await;
        assert!(missing.elements.is_empty());
        assert!(!missing.supports_repersistence);
        assert!(missing.message.unwrap().contains("not found"));

        let empty = record(&store, CaptureType::Partes, None).await;
        let report = r
            .extract_elements(&empty, ElementFilter::Todos, ExtractionMode::Generico)
            .await;
        assert!(report.message.unwrap().contains("no payload"));

        let corrupt = record(&store, CaptureType::Partes, Some(json!("garbage"))).await;
        let report = r
            .extract_elements(&corrupt, ElementFilter::Todos, ExtractionMode::Generico)
            .await;
        assert_eq!(report.totals.total, 0);
        assert!(!report.supports_repersistence);

        for raw in [json!({"partes": "oops"}), json!({"unexpected": [1, 2]})] {
            let id = record(&store, CaptureType::Partes, Some(raw.clone())).await;
            let report = r
                .extract_elements(&id, ElementFilter::Todos, ExtractionMode::Generico)
                .await;
            assert_eq!(report.totals.total, 0, "{raw}");
            assert!(!report.supports_repersistence, "{raw}");
            assert!(
                report.message.unwrap().contains("could not be read"),
                "{raw}"
            );
        }

        let timeline = record(&store, CaptureType::Timeline, Some(json!({}))).await;
        let report = r
            .extract_elements(&timeline, ElementFilter::Todos, ExtractionMode::Generico)
            .await;
        assert_eq!(report.capture_type, Some(CaptureType::Timeline));
        assert!(report.message.unwrap().contains("not available"));
    }

    #[tokio::test]
    async fn unreachable_store_degrades() {
        let store = Arc::new(MemoryStore::new());
        let id = record(&store, CaptureType::Partes, Some(partes_payload())).await;
        store.set_available(false);
        let report = reconciler(&store)
            .extract_elements(&id, ElementFilter::Todos, ExtractionMode::Generico)
            .await;
        assert!(report.elements.is_empty());
        assert!(!report.supports_repersistence);
    }

    #[tokio::test]
    async fn unknown_element_is_reported() {
        let store = Arc::new(MemoryStore::new());
        let id = record(&store, CaptureType::Partes, Some(partes_payload())).await;
        assert!(matches!(
            reconciler(&store).repersist_element(&id, "parte:cliente:0").await,
            Err(ReconcileError::ElementNotFound { .. })
        ));
    }
}
