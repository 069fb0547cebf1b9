//! Generic capture over the portal's JSON API.
//!
//! Listing endpoints are paginated (`resultado`, `paginaAtual`, `qtdPaginas`);
//! the raw payload of a listing capture is the array of pages exactly as
//! received. A failure part-way through keeps the pages already fetched as
//! the partial payload.

use async_trait::async_trait;
use captura_core::ports::CapturePerformer;
use captura_core::{
    CaptureExecutionError, CaptureOutput, CaptureType, DerivedPayload, Session,
};
use serde_json::{Map, Value, json};
use tracing::{debug, info};

use crate::PortalError;

const PAGE_SIZE: u32 = 100;

/// Parameter keys that steer the performer and are not forwarded as query
/// parameters.
const CONTROL_KEYS: [&str; 3] = ["capturar_partes", "processos", "processo_id"];

/// [`CapturePerformer`] for one capture type against the portal API.
///
/// `params` recognised:
/// - `capturar_partes: bool`: for docket captures, also fetch the parties of
///   every listed process (each recorded as a derived `partes` payload)
/// - `processos: [id, ...]`: process ids for `partes`
/// - `processo_id`: process id for `timeline`
/// - any other scalar is forwarded as a query parameter
pub struct ApiCapturePerformer {
    client: reqwest::Client,
    capture_type: CaptureType,
    max_pages: u32,
}

impl ApiCapturePerformer {
    pub fn new(capture_type: CaptureType) -> Self {
        Self::with_client(reqwest::Client::new(), capture_type)
    }

    pub fn with_client(client: reqwest::Client, capture_type: CaptureType) -> Self {
        Self {
            client,
            capture_type,
            max_pages: 200,
        }
    }

    pub fn with_max_pages(mut self, max_pages: u32) -> Self {
        self.max_pages = max_pages.max(1);
        self
    }

    async fn get_json(
        &self,
        session: &Session,
        url: &str,
        query: &[(String, String)],
    ) -> Result<Value, PortalError> {
        let mut request = self
            .client
            .get(url)
            .bearer_auth(session.token())
            .query(query);
        if let Some(t) = session.api_timeout() {
            request = request.timeout(t);
        }
        let resp = request.send().await?;
        let status = resp.status();
        if !status.is_success() {
            let body = resp.text().await.unwrap_or_default();
            return Err(PortalError::Server {
                status: status.as_u16(),
                body,
            });
        }
        Ok(resp.json().await?)
    }

    /// Fetch every page of a listing. On error, returns the pages fetched so far.
    async fn fetch_pages(
        &self,
        session: &Session,
        url: &str,
        query: &[(String, String)],
        logs: &mut Vec<String>,
    ) -> Result<Vec<Value>, (PortalError, Vec<Value>)> {
        let mut pages = Vec::new();
        let mut page = 1u32;
        loop {
            let mut q = query.to_vec();
            q.push(("pagina".into(), page.to_string()));
            q.push(("tamanhoPagina".into(), PAGE_SIZE.to_string()));
            let body = match self.get_json(session, url, &q).await {
                Ok(body) => body,
                Err(e) => return Err((e, pages)),
            };
            let Some(items) = body.get("resultado").and_then(Value::as_array) else {
                // Not paginated: the body is the whole listing.
                logs.push(format!("{url}: unpaginated response"));
                pages.push(body);
                return Ok(pages);
            };
            let total_pages = body
                .get("qtdPaginas")
                .and_then(Value::as_u64)
                .unwrap_or(1)
                .max(1);
            logs.push(format!(
                "{url}: page {page}/{total_pages}, {} items",
                items.len()
            ));
            pages.push(body);
            if u64::from(page) >= total_pages || page >= self.max_pages {
                return Ok(pages);
            }
            page += 1;
        }
    }

    async fn listing(
        &self,
        session: &Session,
        capture_type: CaptureType,
        params: &Value,
        logs: &mut Vec<String>,
    ) -> Result<CaptureOutput, CaptureExecutionError> {
        let user = portal_user(session)?;
        let suffix = match capture_type {
            CaptureType::AcervoGeral => "processos",
            CaptureType::Arquivados => "processos/arquivados",
            CaptureType::Audiencias => "audiencias",
            CaptureType::Pendentes => "pendentes-manifestacao",
            CaptureType::Pericias => "pericias",
            other => {
                return Err(CaptureExecutionError::new(format!(
                    "{other} is not a listing capture"
                )));
            }
        };
        let url = format!("{}/paineladvogado/{user}/{suffix}", session.api_url());
        let query = forwarded_query(params);
        let pages = self
            .fetch_pages(session, &url, &query, logs)
            .await
            .map_err(|(e, pages)| {
                CaptureExecutionError::new(format!("{capture_type} listing failed: {e}"))
                    .with_partial_payload(Value::Array(pages))
                    .with_logs(logs.clone())
            })?;
        let items = flatten_pages(&pages);
        info!(
            capture_type = %capture_type,
            tribunal = %session.tribunal(),
            items = items.len(),
            pages = pages.len(),
            "listing captured"
        );

        let mut derived = Vec::new();
        let wants_partes = params
            .get("capturar_partes")
            .and_then(Value::as_bool)
            .unwrap_or(false);
        if wants_partes
            && matches!(
                capture_type,
                CaptureType::AcervoGeral | CaptureType::Arquivados
            )
        {
            for id in items.iter().filter_map(|item| item.get("id")).cloned() {
                let partes = self
                    .process_partes(session, &id)
                    .await
                    .map_err(|e| {
                        CaptureExecutionError::new(format!(
                            "partes of processo {id} failed: {e}"
                        ))
                        .with_partial_payload(Value::Array(pages.clone()))
                        .with_logs(logs.clone())
                    })?;
                derived.push(DerivedPayload {
                    capture_type: CaptureType::Partes,
                    request: json!({ "processo_id": id }),
                    raw_payload: partes,
                });
            }
            logs.push(format!("captured partes of {} processos", derived.len()));
        }

        Ok(CaptureOutput {
            processed_result: json!({
                "total": items.len(),
                "paginas": pages.len(),
                "partes_capturadas": derived.len(),
            }),
            raw_payload: Value::Array(pages),
            logs: logs.clone(),
            derived,
        })
    }

    async fn process_partes(&self, session: &Session, id: &Value) -> Result<Value, PortalError> {
        let url = format!(
            "{}/processos/id/{}/partes",
            session.api_url(),
            scalar_to_string(id)
        );
        debug!(url = %url, "fetching partes");
        self.get_json(session, &url, &[]).await
    }

    async fn partes(
        &self,
        session: &Session,
        params: &Value,
        logs: &mut Vec<String>,
    ) -> Result<CaptureOutput, CaptureExecutionError> {
        let ids: Vec<Value> = params
            .get("processos")
            .and_then(Value::as_array)
            .cloned()
            .unwrap_or_default();
        if ids.is_empty() {
            return Err(CaptureExecutionError::new(
                "partes capture needs a non-empty `processos` list",
            ));
        }
        let mut all = Vec::new();
        for id in &ids {
            let body = self.process_partes(session, id).await.map_err(|e| {
                CaptureExecutionError::new(format!("partes of processo {id} failed: {e}"))
                    .with_partial_payload(Value::Array(all.clone()))
                    .with_logs(logs.clone())
            })?;
            let parties = party_list(body);
            logs.push(format!("processo {id}: {} partes", parties.len()));
            all.extend(parties);
        }
        Ok(CaptureOutput {
            processed_result: json!({ "processos": ids.len(), "partes": all.len() }),
            raw_payload: Value::Array(all),
            logs: logs.clone(),
            derived: Vec::new(),
        })
    }

    async fn timeline(
        &self,
        session: &Session,
        params: &Value,
        logs: &mut Vec<String>,
    ) -> Result<CaptureOutput, CaptureExecutionError> {
        let id = params
            .get("processo_id")
            .map(scalar_to_string)
            .ok_or_else(|| CaptureExecutionError::new("timeline capture needs `processo_id`"))?;
        let url = format!("{}/processos/id/{id}/timeline", session.api_url());
        let body = self
            .get_json(session, &url, &forwarded_query(params))
            .await
            .map_err(|e| {
                CaptureExecutionError::new(format!("timeline failed: {e}")).with_logs(logs.clone())
            })?;
        let events = body.as_array().map_or(0, Vec::len);
        logs.push(format!("timeline of processo {id}: {events} events"));
        Ok(CaptureOutput {
            processed_result: json!({ "eventos": events }),
            raw_payload: body,
            logs: logs.clone(),
            derived: Vec::new(),
        })
    }

    /// Docket, hearings and pending items in one session.
    async fn combinada(
        &self,
        session: &Session,
        params: &Value,
        logs: &mut Vec<String>,
    ) -> Result<CaptureOutput, CaptureExecutionError> {
        let mut raw = Map::new();
        let mut processed = Map::new();
        let mut derived = Vec::new();
        for part in [
            CaptureType::AcervoGeral,
            CaptureType::Audiencias,
            CaptureType::Pendentes,
        ] {
            match self.listing(session, part, params, logs).await {
                Ok(out) => {
                    raw.insert(part.as_str().into(), out.raw_payload);
                    processed.insert(part.as_str().into(), out.processed_result);
                    derived.extend(out.derived);
                }
                Err(mut e) => {
                    if let Some(partial) = e.partial_payload.take() {
                        raw.insert(part.as_str().into(), partial);
                    }
                    e.partial_payload = Some(Value::Object(raw));
                    return Err(e);
                }
            }
        }
        Ok(CaptureOutput {
            processed_result: Value::Object(processed),
            raw_payload: Value::Object(raw),
            logs: logs.clone(),
            derived,
        })
    }
}

#[async_trait]
impl CapturePerformer for ApiCapturePerformer {
    async fn perform(
        &self,
        session: &Session,
        params: &Value,
    ) -> Result<CaptureOutput, CaptureExecutionError> {
        let mut logs = Vec::new();
        match self.capture_type {
            CaptureType::Partes => self.partes(session, params, &mut logs).await,
            CaptureType::Timeline => self.timeline(session, params, &mut logs).await,
            CaptureType::Combinada => self.combinada(session, params, &mut logs).await,
            listing => self.listing(session, listing, params, &mut logs).await,
        }
    }
}

fn portal_user(session: &Session) -> Result<&str, CaptureExecutionError> {
    session
        .portal_user_id()
        .ok_or_else(|| CaptureExecutionError::new("session carries no portal user id"))
}

fn forwarded_query(params: &Value) -> Vec<(String, String)> {
    let Some(map) = params.as_object() else {
        return Vec::new();
    };
    map.iter()
        .filter(|(k, _)| !CONTROL_KEYS.contains(&k.as_str()))
        .filter(|(_, v)| v.is_string() || v.is_number() || v.is_boolean())
        .map(|(k, v)| (k.clone(), scalar_to_string(v)))
        .collect()
}

fn scalar_to_string(v: &Value) -> String {
    match v {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

fn flatten_pages(pages: &[Value]) -> Vec<Value> {
    pages
        .iter()
        .flat_map(|page| match page {
            Value::Array(items) => items.clone(),
            other => other
                .get("resultado")
                .and_then(Value::as_array)
                .cloned()
                .unwrap_or_default(),
        })
        .collect()
}

/// Parties of one process as a flat list, whichever envelope the portal used.
fn party_list(body: Value) -> Vec<Value> {
    match body {
        Value::Array(items) => items,
        Value::Object(map) => {
            let polos = ["ATIVO", "PASSIVO", "TERCEIROS", "OUTROS"];
            if polos.iter().any(|p| map.contains_key(*p)) {
                return polos
                    .iter()
                    .flat_map(|p| {
                        map.get(*p)
                            .and_then(Value::as_array)
                            .into_iter()
                            .flatten()
                            .cloned()
                            .map(move |mut item| {
                                if let Value::Object(o) = &mut item {
                                    o.entry("polo")
                                        .or_insert_with(|| Value::String(p.to_ascii_lowercase()));
                                }
                                item
                            })
                    })
                    .collect();
            }
            ["partes", "data", "content"]
                .iter()
                .find_map(|k| map.get(*k).and_then(Value::as_array).cloned())
                .unwrap_or_default()
        }
        _ => Vec::new(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use captura_core::InstanceLevel;
    use wiremock::matchers::{header, method, path, query_param};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn session(server: &MockServer) -> Session {
        Session::new(
            "s1",
            "TRT2".parse().unwrap(),
            InstanceLevel::PrimeiroGrau,
            "tok",
            format!("{}/api", server.uri()),
        )
        .with_portal_user_id("42")
    }

    fn page(items: Value, current: u64, total: u64) -> Value {
        json!({ "resultado": items, "paginaAtual": current, "qtdPaginas": total })
    }

    #[tokio::test]
    async fn listing_follows_pagination() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/api/paineladvogado/42/pendentes-manifestacao"))
            .and(query_param("pagina", "1"))
            .and(header("authorization", "Bearer tok"))
            .respond_with(
                ResponseTemplate::new(200).set_body_json(page(json!([{"id": 1}, {"id": 2}]), 1, 2)),
            )
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/api/paineladvogado/42/pendentes-manifestacao"))
            .and(query_param("pagina", "2"))
            .respond_with(ResponseTemplate::new(200).set_body_json(page(json!([{"id": 3}]), 2, 2)))
            .mount(&server)
            .await;

        let performer = ApiCapturePerformer::new(CaptureType::Pendentes);
        let out = performer
            .perform(&session(&server), &json!({}))
            .await
            .unwrap();
        assert_eq!(out.processed_result["total"], 3);
        assert_eq!(out.raw_payload.as_array().unwrap().len(), 2);
        assert_eq!(out.logs.len(), 2);
        assert!(out.derived.is_empty());
    }

    #[tokio::test]
    async fn failure_mid_listing_keeps_partial_pages() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/api/paineladvogado/42/processos"))
            .and(query_param("pagina", "1"))
            .respond_with(ResponseTemplate::new(200).set_body_json(page(json!([{"id": 1}]), 1, 3)))
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/api/paineladvogado/42/processos"))
            .and(query_param("pagina", "2"))
            .respond_with(ResponseTemplate::new(502))
            .mount(&server)
            .await;

        let err = ApiCapturePerformer::new(CaptureType::AcervoGeral)
            .perform(&session(&server), &json!({}))
            .await
            .unwrap_err();
        assert!(err.message.contains("502"));
        let partial = err.partial_payload.unwrap();
        assert_eq!(partial.as_array().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn docket_with_partes_yields_derived_payloads() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/api/paineladvogado/42/processos"))
            .respond_with(
                ResponseTemplate::new(200).set_body_json(page(json!([{"id": 10}, {"id": 11}]), 1, 1)),
            )
            .mount(&server)
            .await;
        for id in [10, 11] {
            Mock::given(method("GET"))
                .and(path(format!("/api/processos/id/{id}/partes")))
                .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                    "ATIVO": [{"nome": "Cliente", "cpf": "111.222.333-44", "polo": "ativo"}],
                    "PASSIVO": [{"nome": "Empresa", "cnpj": "12.345.678/0001-90", "polo": "passivo"}]
                })))
                .mount(&server)
                .await;
        }

        let out = ApiCapturePerformer::new(CaptureType::AcervoGeral)
            .perform(&session(&server), &json!({"capturar_partes": true}))
            .await
            .unwrap();
        assert_eq!(out.derived.len(), 2);
        assert_eq!(out.derived[0].capture_type, CaptureType::Partes);
        assert_eq!(out.derived[0].request, json!({"processo_id": 10}));
        assert_eq!(out.processed_result["partes_capturadas"], 2);
    }

    #[tokio::test]
    async fn partes_requires_process_list() {
        let server = MockServer::start().await;
        let err = ApiCapturePerformer::new(CaptureType::Partes)
            .perform(&session(&server), &json!({}))
            .await
            .unwrap_err();
        assert!(err.message.contains("processos"));
    }

    #[test]
    fn forwarded_query_skips_control_keys() {
        let q = forwarded_query(&json!({
            "capturar_partes": true,
            "processo_id": 9,
            "dataInicio": "2025-01-01",
            "ordem": 1,
            "lista": [1, 2]
        }));
        let keys: Vec<&str> = q.iter().map(|(k, _)| k.as_str()).collect();
        assert_eq!(keys, vec!["dataInicio", "ordem"]);
    }

    #[test]
    fn party_list_accepts_envelopes() {
        assert_eq!(party_list(json!([{"a": 1}])).len(), 1);
        assert_eq!(party_list(json!({"partes": [{"a": 1}, {"b": 2}]})).len(), 2);
        assert_eq!(
            party_list(json!({"ATIVO": [{"a": 1}], "PASSIVO": [{"b": 2}]})).len(),
            2
        );
        assert!(party_list(json!("nope")).is_empty());
    }
}
