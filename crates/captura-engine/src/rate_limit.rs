//! Sliding-window rate limiting over a versioned [`WindowStore`].
//!
//! Each rule owns one key holding the timestamps admitted in its trailing
//! window. A check evicts expired entries, counts, and appends only when under
//! the limit, all committed with one compare-and-swap; a lost race retries
//! from a fresh read. Endpoint and tool rules stack on top of the tier's
//! rules and all of them must admit. When a later rule rejects, the entries
//! already written for the same check are taken back out.
//!
//! If the backing store cannot be reached (or contention outlasts the retry
//! budget) the configured [`FailMode`] decides: `closed` rejects with
//! `redis_unavailable`, `open` admits.
//!
//! Every window carries an expiry one window past its newest entry. At most
//! once per `purge_interval` of check time, a check first asks the store to
//! drop expired windows, so identifiers that stop calling do not accumulate.

use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;
use std::sync::atomic::{AtomicI64, Ordering};
use std::time::Duration;

use captura_core::{FailMode, ParseError, RepoError};
use captura_core::ports::{WindowEntry, WindowStore};
use chrono::{DateTime, SecondsFormat, TimeDelta, Utc};
use serde::Serialize;
use thiserror::Error;
use tracing::{debug, warn};
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Tier {
    Anonymous,
    Authenticated,
    Service,
}

impl Tier {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Anonymous => "anonymous",
            Self::Authenticated => "authenticated",
            Self::Service => "service",
        }
    }
}

impl FromStr for Tier {
    type Err = ParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim() {
            "anonymous" => Ok(Self::Anonymous),
            "authenticated" => Ok(Self::Authenticated),
            "service" => Ok(Self::Service),
            other => Err(ParseError::new("rate limit tier", other)),
        }
    }
}

impl fmt::Display for Tier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RateRule {
    pub limit: u32,
    pub window: Duration,
}

impl RateRule {
    pub const fn per_minute(limit: u32) -> Self {
        Self {
            limit,
            window: Duration::from_secs(60),
        }
    }

    pub const fn per_hour(limit: u32) -> Self {
        Self {
            limit,
            window: Duration::from_secs(3600),
        }
    }

    fn window_ms(&self) -> i64 {
        self.window.as_millis() as i64
    }
}

/// What a check is scoped to beyond the tier.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Scope<'a> {
    Generic,
    Endpoint(&'a str),
    Tool(&'a str),
}

#[derive(Debug, Clone)]
pub struct RateLimitConfig {
    pub tiers: HashMap<Tier, Vec<RateRule>>,
    /// Path prefix → rule; the longest matching prefix applies.
    pub endpoints: Vec<(String, RateRule)>,
    pub tools: HashMap<String, RateRule>,
    pub fail_mode: FailMode,
    /// Compare-and-swap attempts per key before giving up.
    pub max_retries: u32,
    /// Minimum check time between sweeps of expired windows.
    pub purge_interval: Duration,
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        let tiers = HashMap::from([
            (
                Tier::Anonymous,
                vec![RateRule::per_minute(5), RateRule::per_hour(100)],
            ),
            (Tier::Authenticated, vec![RateRule::per_minute(100)]),
            (Tier::Service, vec![RateRule::per_minute(1000)]),
        ]);
        let endpoints = [
            ("/api/mcp", 100),
            ("/api/mcp/stream", 20),
            ("/api/plate/ai", 30),
            ("/api/auth", 10),
        ]
        .into_iter()
        .map(|(p, n)| (p.to_string(), RateRule::per_minute(n)))
        .collect();
        let tools = [("busca_semantica", 30), ("captura_iniciar", 10)]
            .into_iter()
            .map(|(t, n)| (t.to_string(), RateRule::per_minute(n)))
            .collect();
        Self {
            tiers,
            endpoints,
            tools,
            fail_mode: FailMode::Closed,
            max_retries: 8,
            purge_interval: Duration::from_secs(60),
        }
    }
}

impl RateLimitConfig {
    pub fn with_fail_mode(mut self, fail_mode: FailMode) -> Self {
        self.fail_mode = fail_mode;
        self
    }

    fn endpoint_rule(&self, path: &str) -> Option<(&str, RateRule)> {
        self.endpoints
            .iter()
            .filter(|(prefix, _)| {
                path == prefix
                    || path
                        .strip_prefix(prefix.as_str())
                        .is_some_and(|rest| rest.starts_with('/'))
            })
            .max_by_key(|(prefix, _)| prefix.len())
            .map(|(prefix, rule)| (prefix.as_str(), *rule))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum BlockedReason {
    RateLimit,
    RedisUnavailable,
}

impl BlockedReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::RateLimit => "rate_limit",
            Self::RedisUnavailable => "redis_unavailable",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RateLimitResult {
    pub allowed: bool,
    pub remaining: u32,
    pub reset_at: DateTime<Utc>,
    pub limit: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub blocked_reason: Option<BlockedReason>,
}

impl RateLimitResult {
    /// Response headers for this result.
    pub fn headers(&self, now: DateTime<Utc>) -> Vec<(&'static str, String)> {
        let mut headers = vec![
            ("X-RateLimit-Limit", self.limit.to_string()),
            ("X-RateLimit-Remaining", self.remaining.to_string()),
            (
                "X-RateLimit-Reset",
                self.reset_at.to_rfc3339_opts(SecondsFormat::Millis, true),
            ),
        ];
        if !self.allowed {
            let ms = (self.reset_at - now).num_milliseconds().max(0);
            let secs = ((ms + 999) / 1000).max(1);
            headers.push(("Retry-After", secs.to_string()));
        }
        headers
    }

    pub fn into_error(self) -> Option<RateLimitError> {
        match self.blocked_reason? {
            BlockedReason::RateLimit => Some(RateLimitError::Exceeded {
                limit: self.limit,
                reset_at: self.reset_at,
            }),
            BlockedReason::RedisUnavailable => Some(RateLimitError::Unavailable),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RateLimitError {
    #[error("rate limit exceeded ({limit} requests); retry after {reset_at}")]
    Exceeded {
        limit: u32,
        reset_at: DateTime<Utc>,
    },

    #[error("rate limiting is temporarily unavailable; request rejected")]
    Unavailable,
}

struct Admission {
    allowed: bool,
    count: u32,
    oldest_ms: Option<i64>,
}

struct KeyedRule {
    key: String,
    rule: RateRule,
}

impl KeyedRule {
    fn result(&self, admission: &Admission, now_ms: i64) -> RateLimitResult {
        let reset_ms = admission.oldest_ms.unwrap_or(now_ms) + self.rule.window_ms();
        RateLimitResult {
            allowed: admission.allowed,
            remaining: self.rule.limit.saturating_sub(admission.count),
            reset_at: from_ms(reset_ms),
            limit: self.rule.limit,
            blocked_reason: (!admission.allowed).then_some(BlockedReason::RateLimit),
        }
    }
}

fn from_ms(ms: i64) -> DateTime<Utc> {
    DateTime::from_timestamp_millis(ms).unwrap_or_default()
}

pub struct RateLimiter {
    store: Arc<dyn WindowStore>,
    config: RateLimitConfig,
    next_purge_ms: AtomicI64,
}

impl RateLimiter {
    pub fn new(store: Arc<dyn WindowStore>, config: RateLimitConfig) -> Self {
        Self {
            store,
            config,
            next_purge_ms: AtomicI64::new(i64::MIN),
        }
    }

    pub fn config(&self) -> &RateLimitConfig {
        &self.config
    }

    pub async fn check(&self, identifier: &str, tier: Tier) -> RateLimitResult {
        self.check_at(identifier, tier, Scope::Generic, Utc::now()).await
    }

    pub async fn check_endpoint(&self, identifier: &str, tier: Tier, path: &str) -> RateLimitResult {
        self.check_at(identifier, tier, Scope::Endpoint(path), Utc::now())
            .await
    }

    pub async fn check_tool(&self, identifier: &str, tier: Tier, tool: &str) -> RateLimitResult {
        self.check_at(identifier, tier, Scope::Tool(tool), Utc::now())
            .await
    }

    fn rules(&self, identifier: &str, tier: Tier, scope: Scope<'_>) -> Vec<KeyedRule> {
        let base = format!("ratelimit:{tier}:{identifier}");
        let mut rules: Vec<KeyedRule> = self
            .config
            .tiers
            .get(&tier)
            .into_iter()
            .flatten()
            .map(|rule| KeyedRule {
                key: format!("{base}:{}", rule.window_ms()),
                rule: *rule,
            })
            .collect();
        let extra = match scope {
            Scope::Generic => None,
            Scope::Endpoint(path) => self
                .config
                .endpoint_rule(path)
                .map(|(prefix, rule)| (format!("{base}:endpoint:{prefix}"), rule)),
            Scope::Tool(tool) => self
                .config
                .tools
                .get(tool)
                .map(|rule| (format!("{base}:tool:{tool}"), *rule)),
        };
        if let Some((prefix, rule)) = extra {
            rules.push(KeyedRule {
                key: format!("{prefix}:{}", rule.window_ms()),
                rule,
            });
        }
        rules
    }

    fn degraded(&self, rules: &[KeyedRule], now_ms: i64) -> RateLimitResult {
        let rule = rules
            .first()
            .map(|r| r.rule)
            .unwrap_or(RateRule::per_minute(0));
        let reset_at = from_ms(now_ms + rule.window_ms());
        match self.config.fail_mode {
            FailMode::Open => RateLimitResult {
                allowed: true,
                remaining: rule.limit,
                reset_at,
                limit: rule.limit,
                blocked_reason: None,
            },
            FailMode::Closed => RateLimitResult {
                allowed: false,
                remaining: 0,
                reset_at,
                limit: rule.limit,
                blocked_reason: Some(BlockedReason::RedisUnavailable),
            },
        }
    }

    /// Check and record one request at `now` against every applicable rule.
    pub async fn check_at(
        &self,
        identifier: &str,
        tier: Tier,
        scope: Scope<'_>,
        now: DateTime<Utc>,
    ) -> RateLimitResult {
        let now_ms = now.timestamp_millis();
        self.maybe_purge(now_ms).await;
        let rules = self.rules(identifier, tier, scope);
        let member = Uuid::new_v4().to_string();

        let mut admitted: Vec<&KeyedRule> = Vec::with_capacity(rules.len());
        let mut tightest: Option<RateLimitResult> = None;
        for keyed in &rules {
            let admission = match self.admit(keyed, now_ms, &member).await {
                Ok(a) => a,
                Err(e) => {
                    warn!(
                        key = %keyed.key,
                        error = %e,
                        fail_mode = %self.config.fail_mode,
                        "rate limit store unavailable"
                    );
                    self.roll_back(&admitted, &member).await;
                    return self.degraded(&rules, now_ms);
                }
            };
            let result = keyed.result(&admission, now_ms);
            if !admission.allowed {
                debug!(key = %keyed.key, limit = keyed.rule.limit, "rate limit exceeded");
                self.roll_back(&admitted, &member).await;
                return result;
            }
            admitted.push(keyed);
            if tightest
                .as_ref()
                .is_none_or(|t| result.remaining < t.remaining)
            {
                tightest = Some(result);
            }
        }
        tightest.unwrap_or_else(|| self.degraded(&rules, now_ms))
    }

    /// Sweep expired windows if the last sweep is at least `purge_interval`
    /// of check time old. One concurrent caller wins the slot.
    async fn maybe_purge(&self, now_ms: i64) {
        let due = self.next_purge_ms.load(Ordering::Acquire);
        if now_ms < due {
            return;
        }
        let interval_ms = i64::try_from(self.config.purge_interval.as_millis()).unwrap_or(i64::MAX);
        let next = now_ms.saturating_add(interval_ms);
        if self
            .next_purge_ms
            .compare_exchange(due, next, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return;
        }
        match self.store.purge_expired(now_ms).await {
            Ok(0) => {}
            Ok(purged) => debug!(purged, "expired rate limit windows purged"),
            Err(e) => warn!(error = %e, "rate limit purge failed"),
        }
    }

    /// Drop every window expired at `now`. Returns how many were removed.
    pub async fn purge_expired(&self, now: DateTime<Utc>) -> Result<usize, RepoError> {
        self.store.purge_expired(now.timestamp_millis()).await
    }

    /// Evict, count and conditionally append for one key, as a single
    /// compare-and-swap retried on conflict.
    async fn admit(&self, keyed: &KeyedRule, now_ms: i64, member: &str) -> Result<Admission, RepoError> {
        let window_ms = keyed.rule.window_ms();
        for _ in 0..self.config.max_retries.max(1) {
            let snapshot = self.store.load(&keyed.key).await?;
            let (mut entries, expected) = match snapshot {
                Some(s) => (s.entries, Some(s.version)),
                None => (Vec::new(), None),
            };
            entries.retain(|e| e.at_ms > now_ms - window_ms);
            let oldest_ms = entries.iter().map(|e| e.at_ms).min();

            if entries.len() as u64 >= u64::from(keyed.rule.limit) {
                return Ok(Admission {
                    allowed: false,
                    count: entries.len() as u32,
                    oldest_ms,
                });
            }

            entries.push(WindowEntry {
                at_ms: now_ms,
                member: member.to_string(),
            });
            let count = entries.len() as u32;
            if self
                .store
                .compare_and_swap(&keyed.key, expected, entries, now_ms + window_ms)
                .await?
            {
                return Ok(Admission {
                    allowed: true,
                    count,
                    oldest_ms: oldest_ms.or(Some(now_ms)),
                });
            }
            debug!(key = %keyed.key, "rate limit window changed underneath, retrying");
        }
        Err(RepoError::Unavailable(format!(
            "rate limit window {} stayed contended",
            keyed.key
        )))
    }

    /// Take this check's entries back out of keys it was already admitted to.
    async fn roll_back(&self, admitted: &[&KeyedRule], member: &str) {
        for keyed in admitted {
            if let Err(e) = self.retract(keyed, member).await {
                warn!(key = %keyed.key, error = %e, "rate limit rollback failed");
            }
        }
    }

    async fn retract(&self, keyed: &KeyedRule, member: &str) -> Result<(), RepoError> {
        for _ in 0..self.config.max_retries.max(1) {
            let Some(snapshot) = self.store.load(&keyed.key).await? else {
                return Ok(());
            };
            let mut entries = snapshot.entries;
            let before = entries.len();
            entries.retain(|e| e.member != member);
            if entries.len() == before {
                return Ok(());
            }
            let expires_at_ms = entries
                .iter()
                .map(|e| e.at_ms + keyed.rule.window_ms())
                .max()
                .unwrap_or(0);
            if self
                .store
                .compare_and_swap(&keyed.key, Some(snapshot.version), entries, expires_at_ms)
                .await?
            {
                return Ok(());
            }
        }
        Err(RepoError::Unavailable(format!(
            "rate limit window {} stayed contended",
            keyed.key
        )))
    }

    /// Same answer as a check at `now`, without recording anything.
    pub async fn status(
        &self,
        identifier: &str,
        tier: Tier,
        scope: Scope<'_>,
        now: DateTime<Utc>,
    ) -> RateLimitResult {
        let now_ms = now.timestamp_millis();
        let rules = self.rules(identifier, tier, scope);
        let mut tightest: Option<RateLimitResult> = None;
        for keyed in &rules {
            let snapshot = match self.store.load(&keyed.key).await {
                Ok(s) => s.unwrap_or_default(),
                Err(e) => {
                    warn!(key = %keyed.key, error = %e, "rate limit store unavailable");
                    return self.degraded(&rules, now_ms);
                }
            };
            let live: Vec<i64> = snapshot
                .entries
                .iter()
                .map(|e| e.at_ms)
                .filter(|at| *at > now_ms - keyed.rule.window_ms())
                .collect();
            let admission = Admission {
                allowed: (live.len() as u64) < u64::from(keyed.rule.limit),
                count: live.len() as u32,
                oldest_ms: live.iter().min().copied(),
            };
            let result = keyed.result(&admission, now_ms);
            if !result.allowed {
                return result;
            }
            if tightest
                .as_ref()
                .is_none_or(|t| result.remaining < t.remaining)
            {
                tightest = Some(result);
            }
        }
        tightest.unwrap_or_else(|| self.degraded(&rules, now_ms))
    }

    /// Clear every window of `identifier` in `tier`, including endpoint and
    /// tool windows. Store failures are logged, never returned.
    pub async fn reset(&self, identifier: &str, tier: Tier) {
        let mut keys: Vec<String> = self
            .rules(identifier, tier, Scope::Generic)
            .into_iter()
            .map(|k| k.key)
            .collect();
        let scoped = self
            .config
            .endpoints
            .iter()
            .map(|(prefix, _)| Scope::Endpoint(prefix.as_str()))
            .chain(self.config.tools.keys().map(|tool| Scope::Tool(tool.as_str())));
        for scope in scoped {
            for keyed in self.rules(identifier, tier, scope) {
                if !keys.contains(&keyed.key) {
                    keys.push(keyed.key);
                }
            }
        }
        for key in keys {
            if let Err(e) = self.store.remove(&key).await {
                warn!(key = %key, error = %e, "rate limit reset failed");
            }
        }
    }
}

/// `now + delta`, for tests and callers stepping a fixed clock.
pub fn advance(now: DateTime<Utc>, by: Duration) -> DateTime<Utc> {
    now + TimeDelta::from_std(by).unwrap_or(TimeDelta::MAX)
}
