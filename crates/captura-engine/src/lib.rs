//! Capture engine: credential resolution, batch orchestration with an
//! immutable audit trail, element reconciliation, rate limiting and
//! scheduling. Everything external is reached through `captura_core::ports`.

pub mod credentials;
pub mod lifecycle;
pub mod orchestrator;
pub mod rate_limit;
pub mod reconciler;
pub mod recorder;
pub mod scheduler;

#[cfg(test)]
mod testing;

pub use credentials::{CacheStats, CredentialCache, CredentialResolver, ResolveError};
pub use lifecycle::{BatchReport, CaptureLogLifecycle, CredentialOutcome};
pub use orchestrator::{
    CaptureAck, CaptureOrchestrator, CaptureOrchestratorBuilder, CaptureRequest, OrchestratorError,
};
pub use rate_limit::{
    BlockedReason, RateLimitConfig, RateLimitError, RateLimitResult, RateLimiter, RateRule, Scope,
    Tier,
};
pub use reconciler::{
    ElementReconciler, ElementsReport, ReconcileError, RepersistAttempt, RepersistOutcome, Totals,
};
pub use recorder::{AttemptContext, RawCaptureRecorder};
pub use scheduler::{ScheduledRun, Scheduler};
