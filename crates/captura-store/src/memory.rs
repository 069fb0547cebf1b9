//! In-memory implementation of every repository port.
//!
//! One mutex guards all tables, so each trait call is atomic with respect to
//! every other call. `set_available(false)` simulates an unreachable backend:
//! every call then fails with `RepoError::Unavailable`.

use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Mutex, MutexGuard};

use async_trait::async_trait;
use captura_core::ports::{
    CaptureLogStore, CredentialStore, PersistenceStore, RawCaptureStore, ScheduleStore,
    TribunalConfigProvider, WindowEntry, WindowSnapshot, WindowStore,
};
use captura_core::{
    CaptureCompletion, CaptureLog, CaptureLogQuery, CaptureStatus, Credential, ElementType,
    InstanceLevel, NewCaptureLog, NewRawCapture, NewSchedule, RawCaptureRecord, RepoError,
    Schedule, StoredElement, TribunalCode, TribunalConfig, UpsertOutcome,
};
use chrono::{DateTime, Utc};
use serde_json::Value;

#[derive(Default)]
struct Tables {
    credentials: BTreeMap<i64, Credential>,
    tribunals: HashMap<(TribunalCode, InstanceLevel), TribunalConfig>,
    logs: BTreeMap<i64, CaptureLog>,
    raw: Vec<RawCaptureRecord>,
    elements: HashMap<(ElementType, String), (i64, Value)>,
    windows: HashMap<String, (WindowSnapshot, i64)>,
    schedules: BTreeMap<i64, Schedule>,
    next_id: i64,
}

impl Tables {
    fn next_id(&mut self) -> i64 {
        self.next_id += 1;
        self.next_id
    }
}

pub struct MemoryStore {
    tables: Mutex<Tables>,
    available: AtomicBool,
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryStore {
    pub fn new() -> Self {
        Self {
            tables: Mutex::new(Tables::default()),
            available: AtomicBool::new(true),
        }
    }

    /// Toggle simulated backend reachability.
    pub fn set_available(&self, available: bool) {
        self.available.store(available, Ordering::SeqCst);
    }

    pub fn insert_credential(&self, credential: Credential) -> Result<(), RepoError> {
        self.lock()?.credentials.insert(credential.id, credential);
        Ok(())
    }

    pub fn insert_tribunal_config(&self, config: TribunalConfig) -> Result<(), RepoError> {
        self.lock()?
            .tribunals
            .insert((config.tribunal.clone(), config.instance), config);
        Ok(())
    }

    /// Number of rows in the live element store.
    pub fn element_count(&self) -> Result<usize, RepoError> {
        Ok(self.lock()?.elements.len())
    }

    fn lock(&self) -> Result<MutexGuard<'_, Tables>, RepoError> {
        if !self.available.load(Ordering::SeqCst) {
            return Err(RepoError::Unavailable("memory store switched off".into()));
        }
        self.tables
            .lock()
            .map_err(|_| RepoError::Backend("memory store lock poisoned".into()))
    }
}

// ── Credentials and tribunal configuration ──

#[async_trait]
impl CredentialStore for MemoryStore {
    async fn credential(&self, id: i64) -> Result<Option<Credential>, RepoError> {
        Ok(self.lock()?.credentials.get(&id).cloned())
    }
}

#[async_trait]
impl TribunalConfigProvider for MemoryStore {
    async fn resolve(
        &self,
        tribunal: &TribunalCode,
        instance: InstanceLevel,
    ) -> Result<Option<TribunalConfig>, RepoError> {
        Ok(self
            .lock()?
            .tribunals
            .get(&(tribunal.clone(), instance))
            .cloned())
    }
}

// ── Capture logs ──

#[async_trait]
impl CaptureLogStore for MemoryStore {
    async fn create(&self, log: NewCaptureLog) -> Result<CaptureLog, RepoError> {
        let mut t = self.lock()?;
        let id = t.next_id();
        let row = CaptureLog {
            id,
            capture_type: log.capture_type,
            advogado_id: log.advogado_id,
            credential_ids: log.credential_ids,
            status: log.status,
            started_at: log.started_at,
            finished_at: None,
            result: None,
            error_message: None,
        };
        t.logs.insert(id, row.clone());
        Ok(row)
    }

    async fn get(&self, id: i64) -> Result<Option<CaptureLog>, RepoError> {
        Ok(self.lock()?.logs.get(&id).cloned())
    }

    async fn list(&self, query: &CaptureLogQuery) -> Result<Vec<CaptureLog>, RepoError> {
        let t = self.lock()?;
        let mut rows: Vec<CaptureLog> = t
            .logs
            .values()
            .filter(|log| query.matches(log))
            .cloned()
            .collect();
        rows.sort_by(|a, b| b.started_at.cmp(&a.started_at).then(b.id.cmp(&a.id)));
        Ok(rows
            .into_iter()
            .skip(query.offset)
            .take(query.limit)
            .collect())
    }

    async fn transition(
        &self,
        id: i64,
        from: CaptureStatus,
        to: CaptureStatus,
    ) -> Result<CaptureLog, RepoError> {
        let mut t = self.lock()?;
        let row = t
            .logs
            .get_mut(&id)
            .ok_or_else(|| RepoError::NotFound(format!("capture log {id}")))?;
        if row.status.is_terminal() {
            return Err(RepoError::TerminalLog(id));
        }
        if row.status != from || !from.can_transition_to(to) {
            return Err(RepoError::InvalidTransition {
                id,
                from: row.status,
                to,
            });
        }
        row.status = to;
        Ok(row.clone())
    }

    async fn complete(
        &self,
        id: i64,
        completion: CaptureCompletion,
    ) -> Result<CaptureLog, RepoError> {
        let mut t = self.lock()?;
        let row = t
            .logs
            .get_mut(&id)
            .ok_or_else(|| RepoError::NotFound(format!("capture log {id}")))?;
        if row.status.is_terminal() {
            return Err(RepoError::TerminalLog(id));
        }
        if !completion.status.is_terminal() || !row.status.can_transition_to(completion.status) {
            return Err(RepoError::InvalidTransition {
                id,
                from: row.status,
                to: completion.status,
            });
        }
        row.status = completion.status;
        row.result = Some(completion.result);
        row.error_message = completion.error_message;
        row.finished_at = Some(completion.finished_at);
        Ok(row.clone())
    }
}

// ── Raw audit rows ──

#[async_trait]
impl RawCaptureStore for MemoryStore {
    async fn insert(&self, record: NewRawCapture) -> Result<RawCaptureRecord, RepoError> {
        let mut t = self.lock()?;
        if !t.logs.contains_key(&record.capture_log_id) {
            return Err(RepoError::NotFound(format!(
                "capture log {}",
                record.capture_log_id
            )));
        }
        let row = RawCaptureRecord {
            external_id: uuid::Uuid::new_v4().to_string(),
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
        };
        t.raw.push(row.clone());
        Ok(row)
    }

    async fn get(&self, external_id: &str) -> Result<Option<RawCaptureRecord>, RepoError> {
        Ok(self
            .lock()?
            .raw
            .iter()
            .find(|r| r.external_id == external_id)
            .cloned())
    }

    async fn list_for_log(&self, capture_log_id: i64) -> Result<Vec<RawCaptureRecord>, RepoError> {
        Ok(self
            .lock()?
            .raw
            .iter()
            .filter(|r| r.capture_log_id == capture_log_id)
            .cloned()
            .collect())
    }
}

// ── Live elements ──

#[async_trait]
impl PersistenceStore for MemoryStore {
    async fn find(&self, kind: ElementType, key: &str) -> Result<Option<StoredElement>, RepoError> {
        Ok(self
            .lock()?
            .elements
            .get(&(kind, key.to_string()))
            .map(|(id, _)| StoredElement { id: *id }))
    }

    async fn upsert(
        &self,
        kind: ElementType,
        key: &str,
        payload: &Value,
    ) -> Result<UpsertOutcome, RepoError> {
        let mut t = self.lock()?;
        if let Some((id, stored)) = t.elements.get_mut(&(kind, key.to_string())) {
            *stored = payload.clone();
            return Ok(UpsertOutcome {
                id: *id,
                created: false,
            });
        }
        let id = t.next_id();
        t.elements
            .insert((kind, key.to_string()), (id, payload.clone()));
        Ok(UpsertOutcome { id, created: true })
    }
}

// ── Rate-limit windows ──

#[async_trait]
impl WindowStore for MemoryStore {
    async fn load(&self, key: &str) -> Result<Option<WindowSnapshot>, RepoError> {
        Ok(self.lock()?.windows.get(key).map(|(snap, _)| snap.clone()))
    }

    async fn compare_and_swap(
        &self,
        key: &str,
        expected: Option<u64>,
        entries: Vec<WindowEntry>,
        expires_at_ms: i64,
    ) -> Result<bool, RepoError> {
        let mut t = self.lock()?;
        let current = t.windows.get(key).map(|(snap, _)| snap.version);
        if current != expected {
            return Ok(false);
        }
        let version = expected.map_or(1, |v| v + 1);
        t.windows.insert(
            key.to_string(),
            (WindowSnapshot { entries, version }, expires_at_ms),
        );
        Ok(true)
    }

    async fn remove(&self, key: &str) -> Result<(), RepoError> {
        self.lock()?.windows.remove(key);
        Ok(())
    }

    async fn purge_expired(&self, now_ms: i64) -> Result<usize, RepoError> {
        let mut t = self.lock()?;
        let before = t.windows.len();
        t.windows.retain(|_, (_, expires_at_ms)| *expires_at_ms > now_ms);
        Ok(before - t.windows.len())
    }
}

// ── Schedules ──

#[async_trait]
impl ScheduleStore for MemoryStore {
    async fn create(&self, schedule: NewSchedule) -> Result<Schedule, RepoError> {
        let mut t = self.lock()?;
        let id = t.next_id();
        let row = Schedule {
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
        };
        t.schedules.insert(id, row.clone());
        Ok(row)
    }

    async fn due(&self, now: DateTime<Utc>) -> Result<Vec<Schedule>, RepoError> {
        Ok(self
            .lock()?
            .schedules
            .values()
            .filter(|s| s.active && s.next_run <= now)
            .cloned()
            .collect())
    }

    async fn advance(
        &self,
        id: i64,
        expected: DateTime<Utc>,
        next: DateTime<Utc>,
    ) -> Result<bool, RepoError> {
        let mut t = self.lock()?;
        match t.schedules.get_mut(&id) {
            Some(s) if s.next_run == expected => {
                s.next_run = next;
                Ok(true)
            }
            Some(_) => Ok(false),
            None => Err(RepoError::NotFound(format!("schedule {id}"))),
        }
    }

    async fn mark_run(&self, id: i64, at: DateTime<Utc>) -> Result<(), RepoError> {
        let mut t = self.lock()?;
        let s = t
            .schedules
            .get_mut(&id)
            .ok_or_else(|| RepoError::NotFound(format!("schedule {id}")))?;
        s.last_run = Some(at);
        Ok(())
    }
}
