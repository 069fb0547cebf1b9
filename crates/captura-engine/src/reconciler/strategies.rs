//! Per-capture-type extraction, dispatched through [`StrategyTable`].

use std::collections::HashMap;
use std::sync::Arc;

use captura_core::{CaptureType, ElementType};
use serde_json::Value;

use super::payload::{
    EntityKind, ListingPayload, PartyEnvelope, addresses, display_name, document, item_key,
    representatives,
};

/// One element pulled out of a raw payload, before classification.
#[derive(Debug, Clone, PartialEq)]
pub struct Extracted {
    pub element_type: ElementType,
    /// Natural key in the live store.
    pub key: String,
    pub name: String,
    pub payload: Value,
    /// Index of the element this one hangs off (a party for its address).
    pub owner: Option<usize>,
    pub note: Option<String>,
}

impl Extracted {
    /// `<type>:<natural key>`, unique within one raw record.
    pub fn identifier(&self) -> String {
        format!("{}:{}", self.element_type, self.key)
    }
}

pub trait ExtractionStrategy: Send + Sync {
    /// Decode a raw payload into elements, owners before dependants.
    fn extract(&self, raw: &Value) -> Result<Vec<Extracted>, String>;

    fn supports_repersistence(&self) -> bool {
        false
    }
}

/// Collects elements, collapsing repeated identifiers onto the first one.
#[derive(Default)]
struct Collector {
    elements: Vec<Extracted>,
    index: HashMap<String, usize>,
}

impl Collector {
    fn push(&mut self, element: Extracted) -> usize {
        let id = element.identifier();
        if let Some(&i) = self.index.get(&id) {
            return i;
        }
        let i = self.elements.len();
        self.index.insert(id, i);
        self.elements.push(element);
        i
    }

    fn push_addresses(&mut self, owner: usize, prefix: &str, source: &Value) {
        for (addr, payload) in addresses(source) {
            self.push(Extracted {
                element_type: ElementType::Endereco,
                key: format!("{prefix}:{addr}"),
                name: address_label(&payload),
                payload,
                owner: Some(owner),
                note: None,
            });
        }
    }
}

fn address_label(addr: &Value) -> String {
    ["logradouro", "municipio", "cep"]
        .iter()
        .filter_map(|k| addr.get(*k).and_then(Value::as_str))
        .collect::<Vec<_>>()
        .join(", ")
}

/// Parties with their addresses and representatives.
pub struct PartesStrategy;

impl ExtractionStrategy for PartesStrategy {
    fn extract(&self, raw: &Value) -> Result<Vec<Extracted>, String> {
        let envelope: PartyEnvelope = serde_json::from_value(raw.clone())
            .map_err(|e| format!("unrecognised party payload: {e}"))?;
        let mut out = Collector::default();

        for party in envelope.into_parties() {
            let Some(doc) = document(&party) else {
                continue;
            };
            let kind = EntityKind::classify(&party);
            let party_key = format!("{}:{doc}", kind.as_str());
            let party_name = display_name(&party);
            let owner = out.push(Extracted {
                element_type: ElementType::Parte,
                key: party_key.clone(),
                name: party_name.clone(),
                payload: party.clone(),
                owner: None,
                note: Some(kind.as_str().into()),
            });
            out.push_addresses(owner, &party_key, &party);

            for rep in representatives(&party) {
                let Some(rep_doc) = document(rep) else {
                    continue;
                };
                let rep_index = out.push(Extracted {
                    element_type: ElementType::Representante,
                    key: format!("{party_key}:{rep_doc}"),
                    name: display_name(rep),
                    payload: rep.clone(),
                    owner: Some(owner),
                    note: Some(format!("representa {party_name}")),
                });
                out.push_addresses(rep_index, &format!("representante:{rep_doc}"), rep);
            }
        }
        Ok(out.elements)
    }

    fn supports_repersistence(&self) -> bool {
        true
    }
}

/// Read-only flat list of items keyed by their portal `id`.
pub struct ListingStrategy {
    pub element_type: ElementType,
}

impl ExtractionStrategy for ListingStrategy {
    fn extract(&self, raw: &Value) -> Result<Vec<Extracted>, String> {
        let listing: ListingPayload = serde_json::from_value(raw.clone())
            .map_err(|e| format!("unrecognised listing payload: {e}"))?;
        let mut out = Collector::default();
        for item in listing.into_items() {
            let Some(key) = item_key(&item) else {
                continue;
            };
            out.push(Extracted {
                element_type: self.element_type,
                key,
                name: display_name(&item),
                payload: item,
                owner: None,
                note: None,
            });
        }
        Ok(out.elements)
    }
}

/// Capture type → extraction strategy.
pub struct StrategyTable {
    strategies: HashMap<CaptureType, Arc<dyn ExtractionStrategy>>,
}

impl StrategyTable {
    pub fn empty() -> Self {
        Self {
            strategies: HashMap::new(),
        }
    }

    pub fn register(&mut self, capture_type: CaptureType, strategy: Arc<dyn ExtractionStrategy>) {
        self.strategies.insert(capture_type, strategy);
    }

    pub fn get(&self, capture_type: CaptureType) -> Option<&Arc<dyn ExtractionStrategy>> {
        self.strategies.get(&capture_type)
    }
}

impl Default for StrategyTable {
    fn default() -> Self {
        let mut table = Self::empty();
        table.register(CaptureType::Partes, Arc::new(PartesStrategy));
        let listings = [
            (CaptureType::Pendentes, ElementType::Pendente),
            (CaptureType::Audiencias, ElementType::Audiencia),
            (CaptureType::AcervoGeral, ElementType::Processo),
            (CaptureType::Arquivados, ElementType::Processo),
        ];
        for (capture_type, element_type) in listings {
            table.register(capture_type, Arc::new(ListingStrategy { element_type }));
        }
        table
    }
}
