//! Typed views over raw capture payloads.
//!
//! Party payloads arrive in several envelopes depending on which portal
//! endpoint produced them; listings arrive as the array of pages fetched or
//! as a single page. Both are decoded once into the shapes below and the
//! extraction strategies only ever see these.

use serde::Deserialize;
use serde_json::{Map, Value};

/// Accepted party envelopes. An object that matches none of them, such as
/// `{"partes": "x"}` or one without any polo key, fails to decode.
#[derive(Debug, Deserialize)]
#[serde(untagged)]
pub enum PartyEnvelope {
    List(Vec<Value>),
    Partes {
        partes: Vec<Value>,
    },
    Data {
        data: Vec<Value>,
    },
    Content {
        content: Vec<Value>,
    },
    Polos(Polos),
}

/// Parties grouped by polo. Absent polos are empty, but at least one of
/// `ATIVO`, `PASSIVO`, `TERCEIROS` or `OUTROS` must be present.
#[derive(Debug, Deserialize)]
#[serde(try_from = "PoloFields")]
pub struct Polos {
    ativo: Vec<Value>,
    passivo: Vec<Value>,
    terceiros: Vec<Value>,
    outros: Vec<Value>,
}

#[derive(Deserialize)]
struct PoloFields {
    #[serde(rename = "ATIVO")]
    ativo: Option<Vec<Value>>,
    #[serde(rename = "PASSIVO")]
    passivo: Option<Vec<Value>>,
    #[serde(rename = "TERCEIROS")]
    terceiros: Option<Vec<Value>>,
    #[serde(rename = "OUTROS")]
    outros: Option<Vec<Value>>,
}

impl TryFrom<PoloFields> for Polos {
    type Error = &'static str;

    fn try_from(f: PoloFields) -> Result<Self, Self::Error> {
        if f.ativo.is_none() && f.passivo.is_none() && f.terceiros.is_none() && f.outros.is_none() {
            return Err("object carries no ATIVO, PASSIVO, TERCEIROS or OUTROS key");
        }
        Ok(Self {
            ativo: f.ativo.unwrap_or_default(),
            passivo: f.passivo.unwrap_or_default(),
            terceiros: f.terceiros.unwrap_or_default(),
            outros: f.outros.unwrap_or_default(),
        })
    }
}

impl PartyEnvelope {
    /// Flatten into one party list. Parties taken from a polo array carry
    /// that polo unless they already name one.
    pub fn into_parties(self) -> Vec<Value> {
        match self {
            Self::List(v) | Self::Partes { partes: v } | Self::Data { data: v } | Self::Content { content: v } => v,
            Self::Polos(Polos {
                ativo,
                passivo,
                terceiros,
                outros,
            }) => [
                ("ativo", ativo),
                ("passivo", passivo),
                ("terceiro", terceiros),
                ("outros", outros),
            ]
            .into_iter()
            .flat_map(|(polo, parties)| parties.into_iter().map(move |p| with_polo(p, polo)))
            .collect(),
        }
    }
}

fn with_polo(mut party: Value, polo: &str) -> Value {
    if let Value::Object(map) = &mut party {
        map.entry("polo").or_insert_with(|| Value::String(polo.into()));
    }
    party
}

#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum ListingEntry {
    Page { resultado: Vec<Value> },
    Item(Value),
}

/// A listing capture: an array of pages (or of bare items), or one page.
#[derive(Debug, Deserialize)]
#[serde(untagged)]
pub enum ListingPayload {
    Entries(Vec<ListingEntry>),
    Page { resultado: Vec<Value> },
}

impl ListingPayload {
    pub fn into_items(self) -> Vec<Value> {
        match self {
            Self::Page { resultado } => resultado,
            Self::Entries(entries) => entries
                .into_iter()
                .flat_map(|e| match e {
                    ListingEntry::Page { resultado } => resultado,
                    ListingEntry::Item(item) => vec![item],
                })
                .collect(),
        }
    }
}

/// Role of a party relative to the advogado's client.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EntityKind {
    Cliente,
    ParteContraria,
    Terceiro,
}

impl EntityKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Cliente => "cliente",
            Self::ParteContraria => "parte_contraria",
            Self::Terceiro => "terceiro",
        }
    }

    fn from_polo(polo: &str) -> Option<Self> {
        match polo.trim().to_lowercase().as_str() {
            "ativo" | "at" => Some(Self::Cliente),
            "passivo" | "pa" => Some(Self::ParteContraria),
            "terceiro" | "terceiros" | "tc" => Some(Self::Terceiro),
            _ => None,
        }
    }

    fn from_role(role: &str) -> Option<Self> {
        let role = role.trim().to_uppercase();
        if role.contains("AUTOR") || role.contains("RECLAMANTE") {
            Some(Self::Cliente)
        } else if role.contains("REU") || role.contains("RÉU") || role.contains("RECLAMAD") {
            Some(Self::ParteContraria)
        } else if role.contains("PERITO")
            || role.contains("TESTEMUNHA")
            || role.contains("MINISTÉRIO")
            || role.contains("MINISTERIO")
        {
            Some(Self::Terceiro)
        } else {
            None
        }
    }

    /// Polo first, then `tipo`, then `tipoParte.descricao`.
    pub fn classify(party: &Value) -> Self {
        let polo = party.get("polo").and_then(Value::as_str).and_then(Self::from_polo);
        let tipo = || party.get("tipo").and_then(Value::as_str).and_then(Self::from_role);
        let descricao = || {
            party
                .pointer("/tipoParte/descricao")
                .and_then(Value::as_str)
                .and_then(Self::from_role)
        };
        polo.or_else(tipo)
            .or_else(descricao)
            .unwrap_or(Self::ParteContraria)
    }
}

/// First of `documento`, `numeroDocumento`, `cpf`, `cnpj`, digits only.
pub fn document(value: &Value) -> Option<String> {
    ["documento", "numeroDocumento", "cpf", "cnpj"]
        .iter()
        .filter_map(|k| value.get(*k))
        .map(|v| match v {
            Value::String(s) => s.chars().filter(char::is_ascii_digit).collect::<String>(),
            Value::Number(n) => n.to_string(),
            _ => String::new(),
        })
        .find(|d| !d.is_empty())
}

pub fn display_name(value: &Value) -> String {
    ["nome", "nomeParte", "numeroProcesso", "descricao"]
        .iter()
        .filter_map(|k| value.get(*k).and_then(Value::as_str))
        .next()
        .unwrap_or_default()
        .to_string()
}

/// Addresses from `endereco` or `dadosCompletos.endereco`, object or array,
/// each paired with a key unique within its owner.
pub fn addresses(value: &Value) -> Vec<(String, Value)> {
    let source = value
        .get("endereco")
        .or_else(|| value.pointer("/dadosCompletos/endereco"));
    match source {
        Some(Value::Object(map)) => vec![(address_key(map, None), Value::Object(map.clone()))],
        Some(Value::Array(items)) => items
            .iter()
            .enumerate()
            .filter_map(|(i, item)| item.as_object().map(|m| (address_key(m, Some(i)), item.clone())))
            .collect(),
        _ => Vec::new(),
    }
}

fn address_key(map: &Map<String, Value>, index: Option<usize>) -> String {
    match map.get("id") {
        Some(Value::String(s)) if !s.is_empty() => s.clone(),
        Some(Value::Number(n)) => n.to_string(),
        _ => index.map_or_else(|| "principal".to_string(), |i| i.to_string()),
    }
}

pub fn representatives(party: &Value) -> &[Value] {
    party
        .get("representantes")
        .and_then(Value::as_array)
        .map(Vec::as_slice)
        .unwrap_or_default()
}

/// `id` of a listed item as a string key.
pub fn item_key(item: &Value) -> Option<String> {
    match item.get("id")? {
        Value::String(s) if !s.is_empty() => Some(s.clone()),
        Value::Number(n) => Some(n.to_string()),
        _ => None,
    }
}
