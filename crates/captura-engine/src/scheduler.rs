//! Fires due schedules through the orchestrator.

use std::sync::Arc;
use std::time::Duration;

use captura_core::ports::ScheduleStore;
use captura_core::{RepoError, Schedule, next_run_after};
use chrono::{DateTime, Utc};
use serde::Serialize;
use tracing::{debug, info, warn};

use crate::orchestrator::{CaptureOrchestrator, CaptureRequest};

/// What happened to one due schedule.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ScheduledRun {
    pub schedule_id: i64,
    /// Capture log started, when dispatch succeeded.
    pub log_id: Option<i64>,
    pub next_run: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

pub struct Scheduler {
    store: Arc<dyn ScheduleStore>,
    orchestrator: Arc<CaptureOrchestrator>,
}

impl Scheduler {
    pub fn new(store: Arc<dyn ScheduleStore>, orchestrator: Arc<CaptureOrchestrator>) -> Self {
        Self {
            store,
            orchestrator,
        }
    }

    /// Dispatch every active schedule due at `now`.
    ///
    /// `next_run` is claimed with a compare-and-swap before dispatching, so a
    /// schedule observed by two schedulers fires once. A dispatch that fails
    /// fast keeps the advanced `next_run`; it is retried at the next slot.
    pub async fn run_due(&self, now: DateTime<Utc>) -> Result<Vec<ScheduledRun>, RepoError> {
        let due = self.store.due(now).await?;
        let mut runs = Vec::with_capacity(due.len());
        for schedule in due {
            let next = next_run_after(schedule.periodicity, schedule.time_of_day, now);
            if !self.store.advance(schedule.id, schedule.next_run, next).await? {
                debug!(schedule_id = schedule.id, "schedule claimed elsewhere");
                continue;
            }
            runs.push(self.dispatch(schedule, next, now).await);
        }
        Ok(runs)
    }

    async fn dispatch(&self, schedule: Schedule, next: DateTime<Utc>, now: DateTime<Utc>) -> ScheduledRun {
        let schedule_id = schedule.id;
        let request = CaptureRequest {
            capture_type: schedule.capture_type,
            advogado_id: schedule.advogado_id,
            credential_ids: schedule.credential_ids,
            params: schedule.params,
        };
        match self.orchestrator.start_capture(request).await {
            Ok(ack) => {
                if let Err(e) = self.store.mark_run(schedule_id, now).await {
                    warn!(schedule_id, error = %e, "failed to record schedule run");
                }
                info!(schedule_id, log_id = ack.log_id, %next, "scheduled capture started");
                ScheduledRun {
                    schedule_id,
                    log_id: Some(ack.log_id),
                    next_run: next,
                    error: None,
                }
            }
            Err(e) => {
                warn!(schedule_id, error = %e, "scheduled capture rejected");
                ScheduledRun {
                    schedule_id,
                    log_id: None,
                    next_run: next,
                    error: Some(e.to_string()),
                }
            }
        }
    }

    /// Poll forever.
    pub async fn run(&self, poll_interval: Duration) {
        let mut ticker = tokio::time::interval(poll_interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            ticker.tick().await;
            if let Err(e) = self.run_due(Utc::now()).await {
                warn!(error = %e, "schedule poll failed");
            }
        }
    }
}
