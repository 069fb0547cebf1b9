//! DuckDB storage for capture logs, the raw audit trail, credentials,
//! tribunal configuration, live elements, rate-limit windows and schedules.

use std::path::Path;
use std::sync::{Arc, Mutex, MutexGuard};

use arrow::record_batch::RecordBatch;
use async_trait::async_trait;
use captura_core::ports::{
    CaptureLogStore, CredentialStore, PersistenceStore, RawCaptureStore, ScheduleStore,
    TribunalConfigProvider, WindowEntry, WindowSnapshot, WindowStore,
};
use captura_core::{
    CaptureCompletion, CaptureLog, CaptureLogQuery, CaptureStatus, Credential, CustomTimeouts,
    ElementType, InstanceLevel, NewCaptureLog, NewRawCapture, NewSchedule, RawCaptureRecord,
    RepoError, Schedule, StoredElement, TribunalCode, TribunalConfig, UpsertOutcome,
    parse_time_of_day,
};
use chrono::{DateTime, SecondsFormat, Utc};
use duckdb::{Connection, params};
use serde_json::Value;
use tracing::{debug, info};

use crate::StoreError;

const SCHEMA: &str = "
CREATE SEQUENCE IF NOT EXISTS capture_logs_id_seq START 1;
CREATE TABLE IF NOT EXISTS capture_logs (
    id             BIGINT PRIMARY KEY DEFAULT nextval('capture_logs_id_seq'),
    tipo_captura   VARCHAR NOT NULL,
    advogado_id    BIGINT NOT NULL,
    credencial_ids VARCHAR NOT NULL,
    status         VARCHAR NOT NULL,
    criado_em      VARCHAR NOT NULL,
    finalizado_em  VARCHAR,
    resultado      VARCHAR,
    erro           VARCHAR
);
CREATE TABLE IF NOT EXISTS captura_raw_log (
    id                   VARCHAR PRIMARY KEY,
    captura_log_id       BIGINT NOT NULL,
    tipo_captura         VARCHAR NOT NULL,
    advogado_id          BIGINT NOT NULL,
    credencial_id        BIGINT,
    trt                  VARCHAR NOT NULL,
    grau                 VARCHAR NOT NULL,
    status               VARCHAR NOT NULL,
    requisicao           VARCHAR NOT NULL,
    payload_bruto        VARCHAR,
    resultado_processado VARCHAR,
    logs                 VARCHAR NOT NULL,
    erro                 VARCHAR,
    criado_em            VARCHAR NOT NULL
);
CREATE TABLE IF NOT EXISTS credenciais (
    id          BIGINT PRIMARY KEY,
    advogado_id BIGINT NOT NULL,
    tribunal    VARCHAR NOT NULL,
    grau        VARCHAR NOT NULL,
    secret_ref  VARCHAR NOT NULL
);
CREATE TABLE IF NOT EXISTS tribunais_config (
    tribunal         VARCHAR NOT NULL,
    grau             VARCHAR NOT NULL,
    sistema          VARCHAR NOT NULL,
    base_url         VARCHAR NOT NULL,
    login_url        VARCHAR NOT NULL,
    api_url          VARCHAR NOT NULL,
    login_timeout_ms BIGINT,
    api_timeout_ms   BIGINT,
    PRIMARY KEY (tribunal, grau)
);
CREATE SEQUENCE IF NOT EXISTS elementos_id_seq START 1;
CREATE TABLE IF NOT EXISTS elementos (
    id            BIGINT PRIMARY KEY DEFAULT nextval('elementos_id_seq'),
    tipo          VARCHAR NOT NULL,
    chave         VARCHAR NOT NULL,
    payload       VARCHAR NOT NULL,
    atualizado_em VARCHAR NOT NULL,
    UNIQUE (tipo, chave)
);
CREATE TABLE IF NOT EXISTS rate_limit_windows (
    chave         VARCHAR PRIMARY KEY,
    entries       VARCHAR NOT NULL,
    version       BIGINT NOT NULL,
    expires_at_ms BIGINT NOT NULL
);
CREATE SEQUENCE IF NOT EXISTS agendamentos_id_seq START 1;
CREATE TABLE IF NOT EXISTS agendamentos (
    id               BIGINT PRIMARY KEY DEFAULT nextval('agendamentos_id_seq'),
    tipo_captura     VARCHAR NOT NULL,
    advogado_id      BIGINT NOT NULL,
    credencial_ids   VARCHAR NOT NULL,
    periodicidade    VARCHAR NOT NULL,
    horario          VARCHAR NOT NULL,
    parametros       VARCHAR NOT NULL,
    ativo            BOOLEAN NOT NULL,
    proxima_execucao VARCHAR NOT NULL,
    ultima_execucao  VARCHAR
);
";

const LOG_COLUMNS: &str = "id, tipo_captura, advogado_id, credencial_ids, status, criado_em, \
                           finalizado_em, resultado, erro";

const RAW_COLUMNS: &str = "id, captura_log_id, tipo_captura, advogado_id, credencial_id, trt, \
                           grau, status, requisicao, payload_bruto, resultado_processado, logs, \
                           erro, criado_em";

const SCHEDULE_COLUMNS: &str = "id, tipo_captura, advogado_id, credencial_ids, periodicidade, \
                                horario, parametros, ativo, proxima_execucao, ultima_execucao";

/// DuckDB-backed implementation of every repository port.
///
/// Timestamps are stored as RFC 3339 text with a fixed precision so that
/// lexical order equals chronological order. JSON columns are VARCHAR.
///
/// Supports both in-memory (ephemeral) and persistent (file-backed) modes.
/// Use [`open`](Self::open) for in-memory and [`open_persistent`](Self::open_persistent)
/// for file-backed storage that survives across process restarts.
///
/// Port methods run their statements on tokio's blocking pool and must be
/// called from within a runtime. The inherent reference-data and
/// `query_arrow` methods are synchronous.
pub struct DuckStore {
    conn: Arc<Mutex<Connection>>,
}

impl DuckStore {
    /// Open an in-memory DuckDB database with the schema applied.
    pub fn open() -> Result<Self, StoreError> {
        let store = Self {
            conn: Arc::new(Mutex::new(Connection::open_in_memory()?)),
        };
        store.migrate()?;
        Ok(store)
    }

    /// Open or create a persistent DuckDB database at the given path.
    pub fn open_persistent(path: &Path) -> Result<Self, StoreError> {
        let store = Self {
            conn: Arc::new(Mutex::new(Connection::open(path)?)),
        };
        store.migrate()?;
        info!(path = %path.display(), "opened capture database");
        Ok(store)
    }

    /// Create any missing tables and sequences. Safe to call repeatedly.
    pub fn migrate(&self) -> Result<(), StoreError> {
        self.conn()?.execute_batch(SCHEMA)?;
        Ok(())
    }

    fn conn(&self) -> Result<MutexGuard<'_, Connection>, StoreError> {
        self.conn
            .lock()
            .map_err(|_| StoreError::Other("duckdb connection lock poisoned".into()))
    }

    /// Run `f` against the connection on the blocking pool.
    async fn with_conn<T, F>(&self, f: F) -> Result<T, RepoError>
    where
        F: FnOnce(&Connection) -> Result<T, RepoError> + Send + 'static,
        T: Send + 'static,
    {
        let conn = Arc::clone(&self.conn);
        tokio::task::spawn_blocking(move || {
            let conn = conn
                .lock()
                .map_err(|_| StoreError::Other("duckdb connection lock poisoned".into()))?;
            f(&conn)
        })
        .await
        .map_err(|e| RepoError::Backend(format!("duckdb task failed: {e}")))?
    }

    // ── Reference data ──

    pub fn insert_credential(&self, credential: &Credential) -> Result<(), StoreError> {
        self.conn()?.execute(
            "INSERT INTO credenciais (id, advogado_id, tribunal, grau, secret_ref)
             VALUES (?, ?, ?, ?, ?)",
            params![
                credential.id,
                credential.advogado_id,
                credential.tribunal.to_string(),
                credential.instance.as_str(),
                credential.secret_ref,
            ],
        )?;
        Ok(())
    }

    pub fn insert_tribunal_config(&self, config: &TribunalConfig) -> Result<(), StoreError> {
        self.conn()?.execute(
            "INSERT OR REPLACE INTO tribunais_config
             (tribunal, grau, sistema, base_url, login_url, api_url, login_timeout_ms, api_timeout_ms)
             VALUES (?, ?, ?, ?, ?, ?, ?, ?)",
            params![
                config.tribunal.to_string(),
                config.instance.as_str(),
                config.system,
                config.base_url,
                config.login_url,
                config.api_url,
                config.custom_timeouts.login_ms.map(|ms| ms as i64),
                config.custom_timeouts.api_ms.map(|ms| ms as i64),
            ],
        )?;
        Ok(())
    }

    // ── Escape hatch ──

    /// Execute arbitrary SQL and return Arrow RecordBatches.
    pub fn query_arrow(&self, sql: &str) -> Result<Vec<RecordBatch>, StoreError> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare(sql)?;
        let batches: Vec<RecordBatch> = stmt.query_arrow([])?.collect();
        Ok(batches)
    }

    // ── Row readers ──

    fn read_log(conn: &Connection, id: i64) -> Result<Option<CaptureLog>, StoreError> {
        let sql = format!("SELECT {LOG_COLUMNS} FROM capture_logs WHERE id = ?");
        let row = optional(conn.query_row(&sql, params![id], LogRow::from_row))?;
        row.map(LogRow::into_log).transpose()
    }
}

fn ts(at: &DateTime<Utc>) -> String {
    at.to_rfc3339_opts(SecondsFormat::Micros, true)
}

fn parse_ts(s: &str) -> Result<DateTime<Utc>, StoreError> {
    Ok(DateTime::parse_from_rfc3339(s)?.with_timezone(&Utc))
}

fn optional<T>(res: duckdb::Result<T>) -> Result<Option<T>, StoreError> {
    match res {
        Ok(v) => Ok(Some(v)),
        Err(duckdb::Error::QueryReturnedNoRows) => Ok(None),
        Err(e) => Err(e.into()),
    }
}

fn opt_json(v: &Option<Value>) -> Result<Option<String>, StoreError> {
    v.as_ref()
        .map(serde_json::to_string)
        .transpose()
        .map_err(StoreError::from)
}

fn parse_opt_json(s: Option<String>) -> Result<Option<Value>, StoreError> {
    s.map(|s| serde_json::from_str(&s))
        .transpose()
        .map_err(StoreError::from)
}

struct LogRow {
    id: i64,
    capture_type: String,
    advogado_id: i64,
    credential_ids: String,
    status: String,
    started_at: String,
    finished_at: Option<String>,
    result: Option<String>,
    error_message: Option<String>,
}

impl LogRow {
    fn from_row(row: &duckdb::Row<'_>) -> duckdb::Result<Self> {
        Ok(Self {
            id: row.get(0)?,
            capture_type: row.get(1)?,
            advogado_id: row.get(2)?,
            credential_ids: row.get(3)?,
            status: row.get(4)?,
            started_at: row.get(5)?,
            finished_at: row.get(6)?,
            result: row.get(7)?,
            error_message: row.get(8)?,
        })
    }

    fn into_log(self) -> Result<CaptureLog, StoreError> {
        Ok(CaptureLog {
            id: self.id,
            capture_type: self.capture_type.parse()?,
            advogado_id: self.advogado_id,
            credential_ids: serde_json::from_str(&self.credential_ids)?,
            status: self.status.parse()?,
            started_at: parse_ts(&self.started_at)?,
            finished_at: self.finished_at.as_deref().map(parse_ts).transpose()?,
            result: parse_opt_json(self.result)?,
            error_message: self.error_message,
        })
    }
}

struct RawRow {
    external_id: String,
    capture_log_id: i64,
    capture_type: String,
    advogado_id: i64,
    credential_id: Option<i64>,
    tribunal: String,
    instance: String,
    status: String,
    request: String,
    raw_payload: Option<String>,
    processed_result: Option<String>,
    logs: String,
    error: Option<String>,
    created_at: String,
}

impl RawRow {
    fn from_row(row: &duckdb::Row<'_>) -> duckdb::Result<Self> {
        Ok(Self {
            external_id: row.get(0)?,
            capture_log_id: row.get(1)?,
            capture_type: row.get(2)?,
            advogado_id: row.get(3)?,
            credential_id: row.get(4)?,
            tribunal: row.get(5)?,
            instance: row.get(6)?,
            status: row.get(7)?,
            request: row.get(8)?,
            raw_payload: row.get(9)?,
            processed_result: row.get(10)?,
            logs: row.get(11)?,
            error: row.get(12)?,
            created_at: row.get(13)?,
        })
    }

    fn into_record(self) -> Result<RawCaptureRecord, StoreError> {
        Ok(RawCaptureRecord {
            external_id: self.external_id,
            capture_log_id: self.capture_log_id,
            capture_type: self.capture_type.parse()?,
            advogado_id: self.advogado_id,
            credential_id: self.credential_id,
            tribunal: self.tribunal.parse()?,
            instance: self.instance.parse()?,
            status: self.status.parse()?,
            request: serde_json::from_str(&self.request)?,
            raw_payload: parse_opt_json(self.raw_payload)?,
            processed_result: parse_opt_json(self.processed_result)?,
            logs: serde_json::from_str(&self.logs)?,
            error: self.error,
            created_at: parse_ts(&self.created_at)?,
        })
    }
}

struct ScheduleRow {
    id: i64,
    capture_type: String,
    advogado_id: i64,
    credential_ids: String,
    periodicity: String,
    time_of_day: String,
    params: String,
    active: bool,
    next_run: String,
    last_run: Option<String>,
}

impl ScheduleRow {
    fn from_row(row: &duckdb::Row<'_>) -> duckdb::Result<Self> {
        Ok(Self {
            id: row.get(0)?,
            capture_type: row.get(1)?,
            advogado_id: row.get(2)?,
            credential_ids: row.get(3)?,
            periodicity: row.get(4)?,
            time_of_day: row.get(5)?,
            params: row.get(6)?,
            active: row.get(7)?,
            next_run: row.get(8)?,
            last_run: row.get(9)?,
        })
    }

    fn into_schedule(self) -> Result<Schedule, StoreError> {
        Ok(Schedule {
            id: self.id,
            capture_type: self.capture_type.parse()?,
            advogado_id: self.advogado_id,
            credential_ids: serde_json::from_str(&self.credential_ids)?,
            periodicity: self.periodicity.parse()?,
            time_of_day: parse_time_of_day(&self.time_of_day)?,
            params: serde_json::from_str(&self.params)?,
            active: self.active,
            next_run: parse_ts(&self.next_run)?,
            last_run: self.last_run.as_deref().map(parse_ts).transpose()?,
        })
    }
}

// ── Credentials and tribunal configuration ──

#[async_trait]
impl CredentialStore for DuckStore {
    async fn credential(&self, id: i64) -> Result<Option<Credential>, RepoError> {
        self.with_conn(move |conn| {
            let row = optional(conn.query_row(
                "SELECT id, advogado_id, tribunal, grau, secret_ref FROM credenciais WHERE id = ?",
                params![id],
                |r| {
                    Ok((
                        r.get::<_, i64>(0)?,
                        r.get::<_, i64>(1)?,
                        r.get::<_, String>(2)?,
                        r.get::<_, String>(3)?,
                        r.get::<_, String>(4)?,
                    ))
                },
            ))?;
            let Some((id, advogado_id, tribunal, grau, secret_ref)) = row else {
                return Ok(None);
            };
            Ok(Some(Credential {
                id,
                advogado_id,
                tribunal: tribunal.parse().map_err(StoreError::from)?,
                instance: grau.parse().map_err(StoreError::from)?,
                secret_ref,
            }))
        })
        .await
    }
}

#[async_trait]
impl TribunalConfigProvider for DuckStore {
    async fn resolve(
        &self,
        tribunal: &TribunalCode,
        instance: InstanceLevel,
    ) -> Result<Option<TribunalConfig>, RepoError> {
        let tribunal = tribunal.clone();
        self.with_conn(move |conn| {
            let row = optional(conn.query_row(
                "SELECT sistema, base_url, login_url, api_url, login_timeout_ms, api_timeout_ms
                 FROM tribunais_config WHERE tribunal = ? AND grau = ?",
                params![tribunal.to_string(), instance.as_str()],
                |r| {
                    Ok((
                        r.get::<_, String>(0)?,
                        r.get::<_, String>(1)?,
                        r.get::<_, String>(2)?,
                        r.get::<_, String>(3)?,
                        r.get::<_, Option<i64>>(4)?,
                        r.get::<_, Option<i64>>(5)?,
                    ))
                },
            ))?;
            Ok(
                row.map(|(system, base_url, login_url, api_url, login_ms, api_ms)| TribunalConfig {
                    tribunal,
                    instance,
                    system,
                    base_url,
                    login_url,
                    api_url,
                    custom_timeouts: CustomTimeouts {
                        login_ms: login_ms.map(|ms| ms as u64),
                        api_ms: api_ms.map(|ms| ms as u64),
                    },
                }),
            )
        })
        .await
    }
}

// ── Capture logs ──

#[async_trait]
impl CaptureLogStore for DuckStore {
    async fn create(&self, log: NewCaptureLog) -> Result<CaptureLog, RepoError> {
        self.with_conn(move |conn| {
            let id: i64 = conn
                .query_row(
                    "INSERT INTO capture_logs (tipo_captura, advogado_id, credencial_ids, status, criado_em)
                     VALUES (?, ?, ?, ?, ?) RETURNING id",
                    params![
                        log.capture_type.as_str(),
                        log.advogado_id,
                        serde_json::to_string(&log.credential_ids)?,
                        log.status.as_str(),
                        ts(&log.started_at),
                    ],
                    |r| r.get(0),
                )
                .map_err(StoreError::from)?;
            debug!(id, capture_type = %log.capture_type, "capture log created");
            Self::read_log(conn, id)?
                .ok_or_else(|| RepoError::NotFound(format!("capture log {id}")))
        })
        .await
    }

    async fn get(&self, id: i64) -> Result<Option<CaptureLog>, RepoError> {
        self.with_conn(move |conn| Ok(Self::read_log(conn, id)?))
            .await
    }

    async fn list(&self, query: &CaptureLogQuery) -> Result<Vec<CaptureLog>, RepoError> {
        let query = query.clone();
        self.with_conn(move |conn| {
            let sql = format!(
                "SELECT {LOG_COLUMNS} FROM capture_logs
                 WHERE (?::BIGINT IS NULL OR advogado_id = ?)
                   AND (?::VARCHAR IS NULL OR tipo_captura = ?)
                   AND (?::VARCHAR IS NULL OR status = ?)
                 ORDER BY criado_em DESC, id DESC
                 LIMIT ? OFFSET ?"
            );
            let capture_type = query.capture_type.map(|t| t.as_str());
            let status = query.status.map(|s| s.as_str());
            let mut stmt = conn.prepare(&sql).map_err(StoreError::from)?;
            let rows = stmt
                .query_map(
                    params![
                        query.advogado_id,
                        query.advogado_id,
                        capture_type,
                        capture_type,
                        status,
                        status,
                        query.limit as i64,
                        query.offset as i64,
                    ],
                    LogRow::from_row,
                )
                .map_err(StoreError::from)?;
            let mut logs = Vec::new();
            for row in rows {
                logs.push(row.map_err(StoreError::from)?.into_log()?);
            }
            Ok(logs)
        })
        .await
    }

    async fn transition(
        &self,
        id: i64,
        from: CaptureStatus,
        to: CaptureStatus,
    ) -> Result<CaptureLog, RepoError> {
        self.with_conn(move |conn| {
            let current = Self::read_log(conn, id)?
                .ok_or_else(|| RepoError::NotFound(format!("capture log {id}")))?;
            if current.status.is_terminal() {
                return Err(RepoError::TerminalLog(id));
            }
            if current.status != from || !from.can_transition_to(to) {
                return Err(RepoError::InvalidTransition {
                    id,
                    from: current.status,
                    to,
                });
            }
            let changed = conn
                .execute(
                    "UPDATE capture_logs SET status = ? WHERE id = ? AND status = ?",
                    params![to.as_str(), id, from.as_str()],
                )
                .map_err(StoreError::from)?;
            if changed == 0 {
                return Err(RepoError::InvalidTransition { id, from, to });
            }
            Self::read_log(conn, id)?
                .ok_or_else(|| RepoError::NotFound(format!("capture log {id}")))
        })
        .await
    }

    async fn complete(
        &self,
        id: i64,
        completion: CaptureCompletion,
    ) -> Result<CaptureLog, RepoError> {
        self.with_conn(move |conn| {
            let current = Self::read_log(conn, id)?
                .ok_or_else(|| RepoError::NotFound(format!("capture log {id}")))?;
            if current.status.is_terminal() {
                return Err(RepoError::TerminalLog(id));
            }
            if !completion.status.is_terminal()
                || !current.status.can_transition_to(completion.status)
            {
                return Err(RepoError::InvalidTransition {
                    id,
                    from: current.status,
                    to: completion.status,
                });
            }
            // One statement, guarded on the status we just read.
            let changed = conn
                .execute(
                    "UPDATE capture_logs
                     SET status = ?, resultado = ?, erro = ?, finalizado_em = ?
                     WHERE id = ? AND status = ?",
                    params![
                        completion.status.as_str(),
                        serde_json::to_string(&completion.result)?,
                        completion.error_message,
                        ts(&completion.finished_at),
                        id,
                        current.status.as_str(),
                    ],
                )
                .map_err(StoreError::from)?;
            if changed == 0 {
                return Err(RepoError::TerminalLog(id));
            }
            Self::read_log(conn, id)?
                .ok_or_else(|| RepoError::NotFound(format!("capture log {id}")))
        })
        .await
    }
}

// ── Raw audit rows ──

#[async_trait]
impl RawCaptureStore for DuckStore {
    async fn insert(&self, record: NewRawCapture) -> Result<RawCaptureRecord, RepoError> {
        self.with_conn(move |conn| {
            if Self::read_log(conn, record.capture_log_id)?.is_none() {
                return Err(RepoError::NotFound(format!(
                    "capture log {}",
                    record.capture_log_id
                )));
            }
            let external_id = uuid::Uuid::new_v4().to_string();
            let sql = format!(
                "INSERT INTO captura_raw_log ({RAW_COLUMNS}) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)"
            );
            conn.execute(
                &sql,
                params![
                    external_id,
                    record.capture_log_id,
                    record.capture_type.as_str(),
                    record.advogado_id,
                    record.credential_id,
                    record.tribunal.to_string(),
                    record.instance.as_str(),
                    record.status.as_str(),
                    serde_json::to_string(&record.request)?,
                    opt_json(&record.raw_payload)?,
                    opt_json(&record.processed_result)?,
                    serde_json::to_string(&record.logs)?,
                    record.error,
                    ts(&record.created_at),
                ],
            )
            .map_err(StoreError::from)?;
            Ok(RawCaptureRecord {
                external_id,
                capture_log_id: record.capture_log_id,
                capture_type: record.capture_type,
                advogado_id: record.advogado_id,
                credential_id: record.credential_id,
                tribunal: record.tribunal,
                instance: record.instance,
                status: record.status,
                request: record.request,
                raw_payload: record.raw_payload,
                processed_result: record.processed_result,
                logs: record.logs,
                error: record.error,
                created_at: record.created_at,
            })
        })
        .await
    }

    async fn get(&self, external_id: &str) -> Result<Option<RawCaptureRecord>, RepoError> {
        let external_id = external_id.to_string();
        self.with_conn(move |conn| {
            let sql = format!("SELECT {RAW_COLUMNS} FROM captura_raw_log WHERE id = ?");
            let row = optional(conn.query_row(&sql, params![external_id], RawRow::from_row))?;
            Ok(row.map(RawRow::into_record).transpose()?)
        })
        .await
    }

    async fn list_for_log(&self, capture_log_id: i64) -> Result<Vec<RawCaptureRecord>, RepoError> {
        self.with_conn(move |conn| {
            let sql = format!(
                "SELECT {RAW_COLUMNS} FROM captura_raw_log WHERE captura_log_id = ? ORDER BY criado_em, id"
            );
            let mut stmt = conn.prepare(&sql).map_err(StoreError::from)?;
            let rows = stmt
                .query_map(params![capture_log_id], RawRow::from_row)
                .map_err(StoreError::from)?;
            let mut records = Vec::new();
            for row in rows {
                records.push(row.map_err(StoreError::from)?.into_record()?);
            }
            Ok(records)
        })
        .await
    }
}

// ── Live elements ──

fn element_id(conn: &Connection, kind: ElementType, key: &str) -> Result<Option<i64>, StoreError> {
    optional(conn.query_row(
        "SELECT id FROM elementos WHERE tipo = ? AND chave = ?",
        params![kind.as_str(), key],
        |r| r.get::<_, i64>(0),
    ))
}

#[async_trait]
impl PersistenceStore for DuckStore {
    async fn find(&self, kind: ElementType, key: &str) -> Result<Option<StoredElement>, RepoError> {
        let key = key.to_string();
        self.with_conn(move |conn| {
            Ok(element_id(conn, kind, &key)?.map(|id| StoredElement { id }))
        })
        .await
    }

    async fn upsert(
        &self,
        kind: ElementType,
        key: &str,
        payload: &Value,
    ) -> Result<UpsertOutcome, RepoError> {
        let key = key.to_string();
        let body = serde_json::to_string(payload)?;
        self.with_conn(move |conn| {
            let now = ts(&Utc::now());
            if let Some(id) = element_id(conn, kind, &key)? {
                conn.execute(
                    "UPDATE elementos SET payload = ?, atualizado_em = ? WHERE id = ?",
                    params![body, now, id],
                )
                .map_err(StoreError::from)?;
                return Ok(UpsertOutcome { id, created: false });
            }
            let id: i64 = conn
                .query_row(
                    "INSERT INTO elementos (tipo, chave, payload, atualizado_em)
                     VALUES (?, ?, ?, ?) RETURNING id",
                    params![kind.as_str(), key, body, now],
                    |r| r.get(0),
                )
                .map_err(StoreError::from)?;
            Ok(UpsertOutcome { id, created: true })
        })
        .await
    }
}

// ── Rate-limit windows ──

#[async_trait]
impl WindowStore for DuckStore {
    async fn load(&self, key: &str) -> Result<Option<WindowSnapshot>, RepoError> {
        let key = key.to_string();
        self.with_conn(move |conn| {
            let row = optional(conn.query_row(
                "SELECT entries, version FROM rate_limit_windows WHERE chave = ?",
                params![key],
                |r| Ok((r.get::<_, String>(0)?, r.get::<_, i64>(1)?)),
            ))?;
            let Some((entries, version)) = row else {
                return Ok(None);
            };
            let entries: Vec<WindowEntry> = serde_json::from_str(&entries)?;
            Ok(Some(WindowSnapshot {
                entries,
                version: version as u64,
            }))
        })
        .await
    }

    async fn compare_and_swap(
        &self,
        key: &str,
        expected: Option<u64>,
        entries: Vec<WindowEntry>,
        expires_at_ms: i64,
    ) -> Result<bool, RepoError> {
        let key = key.to_string();
        let body = serde_json::to_string(&entries)?;
        self.with_conn(move |conn| {
            let changed = match expected {
                None => conn.execute(
                    "INSERT INTO rate_limit_windows (chave, entries, version, expires_at_ms)
                     VALUES (?, ?, 1, ?) ON CONFLICT DO NOTHING",
                    params![key, body, expires_at_ms],
                ),
                Some(version) => conn.execute(
                    "UPDATE rate_limit_windows
                     SET entries = ?, version = version + 1, expires_at_ms = ?
                     WHERE chave = ? AND version = ?",
                    params![body, expires_at_ms, key, version as i64],
                ),
            }
            .map_err(StoreError::from)?;
            Ok(changed == 1)
        })
        .await
    }

    async fn remove(&self, key: &str) -> Result<(), RepoError> {
        let key = key.to_string();
        self.with_conn(move |conn| {
            conn.execute("DELETE FROM rate_limit_windows WHERE chave = ?", params![key])
                .map_err(StoreError::from)?;
            Ok(())
        })
        .await
    }

    async fn purge_expired(&self, now_ms: i64) -> Result<usize, RepoError> {
        self.with_conn(move |conn| {
            let purged = conn
                .execute(
                    "DELETE FROM rate_limit_windows WHERE expires_at_ms <= ?",
                    params![now_ms],
                )
                .map_err(StoreError::from)?;
            if purged > 0 {
                debug!(purged, "expired rate limit windows removed");
            }
            Ok(purged)
        })
        .await
    }
}

// ── Schedules ──

#[async_trait]
impl ScheduleStore for DuckStore {
    async fn create(&self, schedule: NewSchedule) -> Result<Schedule, RepoError> {
        self.with_conn(move |conn| {
            let id: i64 = conn
                .query_row(
                    "INSERT INTO agendamentos
                     (tipo_captura, advogado_id, credencial_ids, periodicidade, horario, parametros,
                      ativo, proxima_execucao)
                     VALUES (?, ?, ?, ?, ?, ?, ?, ?) RETURNING id",
                    params![
                        schedule.capture_type.as_str(),
                        schedule.advogado_id,
                        serde_json::to_string(&schedule.credential_ids)?,
                        schedule.periodicity.to_string(),
                        schedule.time_of_day.format("%H:%M").to_string(),
                        serde_json::to_string(&schedule.params)?,
                        schedule.active,
                        ts(&schedule.next_run),
                    ],
                    |r| r.get(0),
                )
                .map_err(StoreError::from)?;
            Ok(Schedule {
                id,
                capture_type: schedule.capture_type,
                advogado_id: schedule.advogado_id,
                credential_ids: schedule.credential_ids,
                periodicity: schedule.periodicity,
                time_of_day: schedule.time_of_day,
                params: schedule.params,
                active: schedule.active,
                next_run: schedule.next_run,
                last_run: None,
            })
        })
        .await
    }

    async fn due(&self, now: DateTime<Utc>) -> Result<Vec<Schedule>, RepoError> {
        self.with_conn(move |conn| {
            let sql = format!(
                "SELECT {SCHEDULE_COLUMNS} FROM agendamentos
                 WHERE ativo AND proxima_execucao <= ? ORDER BY proxima_execucao, id"
            );
            let mut stmt = conn.prepare(&sql).map_err(StoreError::from)?;
            let rows = stmt
                .query_map(params![ts(&now)], ScheduleRow::from_row)
                .map_err(StoreError::from)?;
            let mut schedules = Vec::new();
            for row in rows {
                schedules.push(row.map_err(StoreError::from)?.into_schedule()?);
            }
            Ok(schedules)
        })
        .await
    }

    async fn advance(
        &self,
        id: i64,
        expected: DateTime<Utc>,
        next: DateTime<Utc>,
    ) -> Result<bool, RepoError> {
        self.with_conn(move |conn| {
            let changed = conn
                .execute(
                    "UPDATE agendamentos SET proxima_execucao = ? WHERE id = ? AND proxima_execucao = ?",
                    params![ts(&next), id, ts(&expected)],
                )
                .map_err(StoreError::from)?;
            Ok(changed == 1)
        })
        .await
    }

    async fn mark_run(&self, id: i64, at: DateTime<Utc>) -> Result<(), RepoError> {
        self.with_conn(move |conn| {
            let changed = conn
                .execute(
                    "UPDATE agendamentos SET ultima_execucao = ? WHERE id = ?",
                    params![ts(&at), id],
                )
                .map_err(StoreError::from)?;
            if changed == 0 {
                return Err(RepoError::NotFound(format!("schedule {id}")));
            }
            Ok(())
        })
        .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use captura_core::{CaptureType, Periodicity, RawStatus};
    use serde_json::json;

    fn new_log(advogado_id: i64) -> NewCaptureLog {
        NewCaptureLog {
            capture_type: CaptureType::AcervoGeral,
            advogado_id,
            credential_ids: vec![5, 6],
            status: CaptureStatus::InProgress,
            started_at: Utc::now(),
        }
    }

    #[test]
    fn open_in_memory() {
        let store = DuckStore::open().unwrap();
        let batches = store.query_arrow("SELECT 1 AS x").unwrap();
        assert_eq!(batches.len(), 1);
        assert_eq!(batches[0].num_rows(), 1);
    }

    #[test]
    fn migrate_is_repeatable() {
        let store = DuckStore::open().unwrap();
        store.migrate().unwrap();
        store.migrate().unwrap();
    }

    #[tokio::test]
    async fn credentials_and_configs_round_trip() {
        let store = DuckStore::open().unwrap();
        let cred = Credential {
            id: 5,
            advogado_id: 1,
            tribunal: "TRT2".parse().unwrap(),
            instance: InstanceLevel::PrimeiroGrau,
            secret_ref: "env:TRT2_SECRET".into(),
        };
        store.insert_credential(&cred).unwrap();
        assert_eq!(store.credential(5).await.unwrap(), Some(cred.clone()));
        assert_eq!(store.credential(6).await.unwrap(), None);

        let config = TribunalConfig {
            tribunal: cred.tribunal.clone(),
            instance: cred.instance,
            system: "PJE".into(),
            base_url: "https://pje.trt2.jus.br".into(),
            login_url: "https://pje.trt2.jus.br/login".into(),
            api_url: "https://pje.trt2.jus.br/api".into(),
            custom_timeouts: CustomTimeouts {
                login_ms: Some(45_000),
                api_ms: None,
            },
        };
        store.insert_tribunal_config(&config).unwrap();
        let found = store
            .resolve(&cred.tribunal, InstanceLevel::PrimeiroGrau)
            .await
            .unwrap();
        assert_eq!(found, Some(config));
        let missing = store
            .resolve(&"TRT9".parse().unwrap(), InstanceLevel::PrimeiroGrau)
            .await
            .unwrap();
        assert!(missing.is_none());
    }

    #[tokio::test]
    async fn capture_log_lifecycle() {
        let store = DuckStore::open().unwrap();
        let log = CaptureLogStore::create(&store, new_log(1)).await.unwrap();
        assert_eq!(log.status, CaptureStatus::InProgress);
        assert_eq!(log.credential_ids, vec![5, 6]);

        let done = store
            .complete(
                log.id,
                CaptureCompletion {
                    status: CaptureStatus::Error,
                    result: json!({"credenciais_processadas": 2}),
                    error_message: Some("TRT9 primeiro_grau (ID 6): missing".into()),
                    finished_at: Utc::now(),
                },
            )
            .await
            .unwrap();
        assert_eq!(done.status, CaptureStatus::Error);
        assert_eq!(done.result.as_ref().unwrap()["credenciais_processadas"], 2);

        let again = store
            .complete(
                log.id,
                CaptureCompletion {
                    status: CaptureStatus::Success,
                    result: json!({}),
                    error_message: None,
                    finished_at: Utc::now(),
                },
            )
            .await;
        assert!(matches!(again, Err(RepoError::TerminalLog(_))));
        let row = CaptureLogStore::get(&store, log.id).await.unwrap().unwrap();
        assert_eq!(row, done);
    }

    #[tokio::test]
    async fn list_filters_by_advogado() {
        let store = DuckStore::open().unwrap();
        CaptureLogStore::create(&store, new_log(1)).await.unwrap();
        CaptureLogStore::create(&store, new_log(2)).await.unwrap();
        CaptureLogStore::create(&store, new_log(1)).await.unwrap();
        let query = CaptureLogQuery {
            advogado_id: Some(1),
            ..Default::default()
        };
        let rows = store.list(&query).await.unwrap();
        assert_eq!(rows.len(), 2);
        assert!(rows.iter().all(|r| r.advogado_id == 1));
    }

    #[tokio::test]
    async fn raw_rows_round_trip() {
        let store = DuckStore::open().unwrap();
        let log = CaptureLogStore::create(&store, new_log(1)).await.unwrap();
        let row = RawCaptureStore::insert(
            &store,
            NewRawCapture {
                capture_log_id: log.id,
                capture_type: CaptureType::Partes,
                advogado_id: 1,
                credential_id: Some(5),
                tribunal: "TRT2".parse().unwrap(),
                instance: InstanceLevel::PrimeiroGrau,
                status: RawStatus::Success,
                request: json!({"processo_id": 10}),
                raw_payload: Some(json!([{"nome": "Fulano", "cpf": "123"}])),
                processed_result: Some(json!({"partes": 1})),
                logs: vec!["ok".into()],
                error: None,
                created_at: Utc::now(),
            },
        )
        .await
        .unwrap();
        let back = RawCaptureStore::get(&store, &row.external_id)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(back.raw_payload, row.raw_payload);
        assert_eq!(back.logs, vec!["ok".to_string()]);
        assert_eq!(store.list_for_log(log.id).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn element_upsert_by_natural_key() {
        let store = DuckStore::open().unwrap();
        assert!(store.find(ElementType::Parte, "cliente:123").await.unwrap().is_none());
        let first = store
            .upsert(ElementType::Parte, "cliente:123", &json!({"nome": "A"}))
            .await
            .unwrap();
        let second = store
            .upsert(ElementType::Parte, "cliente:123", &json!({"nome": "B"}))
            .await
            .unwrap();
        assert!(first.created);
        assert!(!second.created);
        assert_eq!(first.id, second.id);
        let found = store.find(ElementType::Parte, "cliente:123").await.unwrap();
        assert_eq!(found, Some(StoredElement { id: first.id }));
    }

    #[tokio::test]
    async fn window_compare_and_swap() {
        let store = DuckStore::open().unwrap();
        let entry = WindowEntry {
            at_ms: 1_000,
            member: "a".into(),
        };
        assert!(store
            .compare_and_swap("k", None, vec![entry.clone()], 61_000)
            .await
            .unwrap());
        assert!(!store.compare_and_swap("k", None, vec![], 61_000).await.unwrap());
        let snap = store.load("k").await.unwrap().unwrap();
        assert_eq!(snap.version, 1);
        assert_eq!(snap.entries, vec![entry]);
        assert!(store.compare_and_swap("k", Some(1), vec![], 0).await.unwrap());
        assert!(!store.compare_and_swap("k", Some(1), vec![], 0).await.unwrap());
        store.remove("k").await.unwrap();
        assert!(store.load("k").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn expired_windows_are_purged() {
        let store = DuckStore::open().unwrap();
        let entry = |at_ms| WindowEntry {
            at_ms,
            member: format!("m{at_ms}"),
        };
        store
            .compare_and_swap("old", None, vec![entry(1_000)], 61_000)
            .await
            .unwrap();
        store
            .compare_and_swap("fresh", None, vec![entry(100_000)], 160_000)
            .await
            .unwrap();

        assert_eq!(store.purge_expired(60_999).await.unwrap(), 0);
        assert_eq!(store.purge_expired(61_000).await.unwrap(), 1);
        assert!(store.load("old").await.unwrap().is_none());
        assert!(store.load("fresh").await.unwrap().is_some());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn spawned_writers_share_the_connection() {
        let store = Arc::new(DuckStore::open().unwrap());
        let mut tasks = tokio::task::JoinSet::new();
        for advogado_id in 0..16 {
            let store = store.clone();
            tasks.spawn(async move {
                CaptureLogStore::create(store.as_ref(), new_log(advogado_id))
                    .await
                    .map(|log| log.id)
            });
        }
        let mut ids = Vec::new();
        while let Some(joined) = tasks.join_next().await {
            ids.push(joined.unwrap().unwrap());
        }
        ids.sort_unstable();
        ids.dedup();
        assert_eq!(ids.len(), 16);

        let all = store
            .list(&CaptureLogQuery {
                limit: 100,
                ..Default::default()
            })
            .await
            .unwrap();
        assert_eq!(all.len(), 16);
    }

    #[tokio::test]
    async fn schedule_advance_is_compare_and_swap() {
        let store = DuckStore::open().unwrap();
        let next_run = Utc::now() - chrono::Duration::minutes(1);
        let schedule = ScheduleStore::create(
            &store,
            NewSchedule {
                capture_type: CaptureType::Pendentes,
                advogado_id: 1,
                credential_ids: vec![5],
                periodicity: Periodicity::Diario,
                time_of_day: parse_time_of_day("08:00").unwrap(),
                params: json!({}),
                active: true,
                next_run,
            },
        )
        .await
        .unwrap();
        assert_eq!(store.due(Utc::now()).await.unwrap().len(), 1);
        let later = next_run + chrono::Duration::days(1);
        assert!(store.advance(schedule.id, next_run, later).await.unwrap());
        assert!(!store.advance(schedule.id, next_run, later).await.unwrap());
        assert!(store.due(Utc::now()).await.unwrap().is_empty());
    }

    // ── Persistent storage tests ──

    #[tokio::test]
    async fn persistent_reopen_keeps_rows() {
        let tmp = tempfile::TempDir::new().unwrap();
        let db_path = tmp.path().join("captura.duckdb");

        let store = DuckStore::open_persistent(&db_path).unwrap();
        assert!(db_path.exists());
        let log = CaptureLogStore::create(&store, new_log(1)).await.unwrap();
        drop(store);

        let store = DuckStore::open_persistent(&db_path).unwrap();
        let back = CaptureLogStore::get(&store, log.id).await.unwrap().unwrap();
        assert_eq!(back.id, log.id);
    }
}
