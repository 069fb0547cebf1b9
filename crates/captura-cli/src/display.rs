//! Terminal rendering for capture logs, audit rows, element reports and
//! rate-limit verdicts.

use captura_core::{CaptureLog, PersistenceStatus, RawCaptureRecord};
use captura_engine::{ElementsReport, RateLimitResult};
use chrono::{DateTime, SecondsFormat, Utc};
use serde_json::Value;

const MAX_ELEMENTS: usize = 50;
const MAX_ERROR_CHARS: usize = 120;

fn field(name: &str, value: impl std::fmt::Display) {
    println!("  {:<22} {}", name, value);
}

fn timestamp(at: &DateTime<Utc>) -> String {
    at.to_rfc3339_opts(SecondsFormat::Secs, true)
}

fn truncate(s: &str, max: usize) -> String {
    if s.chars().count() <= max {
        s.to_string()
    } else {
        let cut: String = s.chars().take(max).collect();
        format!("{cut}...")
    }
}

// ── Capture logs ──

/// Print one capture log as a vertical card.
pub fn print_capture_log(log: &CaptureLog) {
    println!("=== Capture log {} ===", log.id);
    field("tipo_captura", log.capture_type);
    field("advogado_id", log.advogado_id);
    field(
        "credenciais",
        log.credential_ids
            .iter()
            .map(i64::to_string)
            .collect::<Vec<_>>()
            .join(", "),
    );
    field("status", log.status);
    field("iniciado_em", timestamp(&log.started_at));
    if let Some(at) = &log.finished_at {
        field("finalizado_em", timestamp(at));
    }

    if let Some(result) = &log.result {
        if let Some(n) = result.get("credenciais_processadas") {
            field("processadas", n);
        }
        if let Some(outcomes) = result.get("resultados").and_then(Value::as_array) {
            println!();
            println!("Credentials");
            for o in outcomes {
                println!(
                    "  #{:<6} {:<6} {:<16} {:<8} {}",
                    o["credencial_id"].as_i64().unwrap_or_default(),
                    o["tribunal"].as_str().unwrap_or("-"),
                    o["grau"].as_str().unwrap_or("-"),
                    o["status"].as_str().unwrap_or("-"),
                    o["raw_log_id"].as_str().unwrap_or(""),
                );
            }
        }
    }

    if let Some(errors) = log
        .result
        .as_ref()
        .and_then(|r| r.get("erros"))
        .and_then(Value::as_array)
        .filter(|e| !e.is_empty())
    {
        println!();
        println!("Errors ({})", errors.len());
        for e in errors {
            println!("  - {}", e.as_str().unwrap_or_default());
        }
    }
}

// ── Audit rows ──

pub fn print_raw_records(records: &[RawCaptureRecord]) {
    if records.is_empty() {
        println!("No audit rows.");
        return;
    }
    println!(
        "{:<38} {:<13} {:<6} {:<6} {:<8} {}",
        "external_id", "tipo", "trt", "cred", "status", "erro"
    );
    for r in records {
        println!(
            "{:<38} {:<13} {:<6} {:<6} {:<8} {}",
            r.external_id,
            r.capture_type.as_str(),
            r.tribunal.to_string(),
            r.credential_id.map_or_else(|| "-".to_string(), |id| id.to_string()),
            r.status.as_str(),
            truncate(r.error.as_deref().unwrap_or(""), MAX_ERROR_CHARS),
        );
    }
    println!("{} row(s)", records.len());
}

// ── Reconciliation ──

pub fn print_elements(report: &ElementsReport) {
    println!("=== Raw capture {} ===", report.external_id);
    if let Some(t) = report.capture_type {
        field("tipo_captura", t);
    }
    field("repersistivel", if report.supports_repersistence { "yes" } else { "no" });
    field("total", report.totals.total);
    field("existentes", report.totals.existentes);
    field("faltantes", report.totals.faltantes);
    field("filtrados", report.totals.filtrados);
    if let Some(msg) = &report.message {
        field("mensagem", msg);
    }

    if let Some(b) = &report.breakdown {
        println!();
        println!("Breakdown");
        for (name, k) in [
            ("partes", b.partes),
            ("enderecos", b.enderecos),
            ("representantes", b.representantes),
        ] {
            println!(
                "  {:<22} {} total, {} existentes, {} faltantes",
                name, k.total, k.existentes, k.faltantes
            );
        }
    }

    if report.elements.is_empty() {
        return;
    }
    println!();
    println!("Elements");
    let show = report.elements.len().min(MAX_ELEMENTS);
    for e in &report.elements[..show] {
        let mark = match e.persistence_status {
            PersistenceStatus::Existente => "ok",
            PersistenceStatus::Faltando => "--",
        };
        println!("  [{mark}] {:<60} {}", e.identifier, e.name);
    }
    if report.elements.len() > show {
        println!("  ... and {} more", report.elements.len() - show);
    }
}

// ── Rate limits ──

pub fn print_rate_limit(result: &RateLimitResult, now: DateTime<Utc>) {
    field("allowed", if result.allowed { "yes" } else { "no" });
    if let Some(reason) = result.blocked_reason {
        field("blocked_reason", reason.as_str());
    }
    for (name, value) in result.headers(now) {
        field(name, value);
    }
}
