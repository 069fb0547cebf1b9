//! Credential resolution with ownership checks and a TTL cache.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use captura_core::ports::CredentialStore;
use captura_core::{Credential, RepoError};
use thiserror::Error;
use tokio::time::Instant;
use tracing::debug;

#[derive(Debug, Error)]
pub enum ResolveError {
    #[error("credentials not found: {0:?}")]
    NotFound(Vec<i64>),

    #[error("credentials {credential_ids:?} do not belong to advogado {advogado_id}")]
    OwnershipMismatch {
        advogado_id: i64,
        credential_ids: Vec<i64>,
    },

    #[error("credential store: {0}")]
    Store(#[from] RepoError),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CacheStats {
    pub entries: usize,
    pub valid: usize,
    pub expired: usize,
}

/// Inserts between sweeps of expired entries.
const SWEEP_EVERY: u64 = 64;

/// Credentials by id, each valid for `ttl` after insertion.
///
/// Rows are immutable once issued, so a cached credential is never stale in
/// content; the TTL only bounds memory and picks up deletions. Every
/// [`SWEEP_EVERY`]th insert also drops whatever has expired.
pub struct CredentialCache {
    ttl: Duration,
    entries: Mutex<HashMap<i64, (Credential, Instant)>>,
    inserts: AtomicU64,
}

impl CredentialCache {
    pub fn new(ttl: Duration) -> Self {
        Self {
            ttl,
            entries: Mutex::new(HashMap::new()),
            inserts: AtomicU64::new(0),
        }
    }

    fn entries(&self) -> MutexGuard<'_, HashMap<i64, (Credential, Instant)>> {
        self.entries.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn get(&self, id: i64) -> Option<Credential> {
        let now = Instant::now();
        self.entries()
            .get(&id)
            .filter(|(_, at)| now.duration_since(*at) < self.ttl)
            .map(|(c, _)| c.clone())
    }

    pub fn insert(&self, credential: Credential) {
        self.entries()
            .insert(credential.id, (credential, Instant::now()));
        let count = self.inserts.fetch_add(1, Ordering::Relaxed) + 1;
        if count % SWEEP_EVERY == 0 {
            let dropped = self.clean_expired();
            if dropped > 0 {
                debug!(dropped, "expired credentials swept from cache");
            }
        }
    }

    pub fn clear(&self) {
        self.entries().clear();
    }

    /// Drop expired entries, returning how many were removed.
    pub fn clean_expired(&self) -> usize {
        let now = Instant::now();
        let mut entries = self.entries();
        let before = entries.len();
        entries.retain(|_, (_, at)| now.duration_since(*at) < self.ttl);
        before - entries.len()
    }

    pub fn stats(&self) -> CacheStats {
        let now = Instant::now();
        let entries = self.entries();
        let valid = entries
            .values()
            .filter(|(_, at)| now.duration_since(*at) < self.ttl)
            .count();
        CacheStats {
            entries: entries.len(),
            valid,
            expired: entries.len() - valid,
        }
    }
}

/// Maps `(advogado, credential ids)` to usable credentials.
pub struct CredentialResolver {
    store: Arc<dyn CredentialStore>,
    cache: CredentialCache,
}

impl CredentialResolver {
    pub fn new(store: Arc<dyn CredentialStore>, cache_ttl: Duration) -> Self {
        Self {
            store,
            cache: CredentialCache::new(cache_ttl),
        }
    }

    pub fn cache(&self) -> &CredentialCache {
        &self.cache
    }

    /// Fetch every requested credential and check it belongs to `advogado_id`.
    ///
    /// Fails with `NotFound` listing every missing id, then with
    /// `OwnershipMismatch` listing every foreign one. Duplicate ids collapse to
    /// one credential. Returns credentials in request order.
    pub async fn resolve(
        &self,
        advogado_id: i64,
        credential_ids: &[i64],
    ) -> Result<Vec<Credential>, ResolveError> {
        let mut seen = HashSet::new();
        let mut found = Vec::with_capacity(credential_ids.len());
        let mut missing = Vec::new();

        for &id in credential_ids {
            if !seen.insert(id) {
                continue;
            }
            if let Some(c) = self.cache.get(id) {
                found.push(c);
                continue;
            }
            match self.store.credential(id).await? {
                Some(c) => {
                    self.cache.insert(c.clone());
                    found.push(c);
                }
                None => missing.push(id),
            }
        }

        if !missing.is_empty() {
            return Err(ResolveError::NotFound(missing));
        }

        let foreign: Vec<i64> = found
            .iter()
            .filter(|c| c.advogado_id != advogado_id)
            .map(|c| c.id)
            .collect();
        if !foreign.is_empty() {
            return Err(ResolveError::OwnershipMismatch {
                advogado_id,
                credential_ids: foreign,
            });
        }

        debug!(advogado_id, count = found.len(), "credentials resolved");
        Ok(found)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{credential, fixture_store};

    #[tokio::test]
    async fn resolves_owned_credentials() {
        let store = fixture_store();
        let resolver = CredentialResolver::new(store, Duration::from_secs(300));
        let creds = resolver.resolve(1, &[6, 5, 6]).await.unwrap();
        let ids: Vec<i64> = creds.iter().map(|c| c.id).collect();
        assert_eq!(ids, vec![6, 5]);
    }

    #[tokio::test]
    async fn missing_ids_fail_fast() {
        let resolver = CredentialResolver::new(fixture_store(), Duration::from_secs(300));
        let err = resolver.resolve(1, &[5, 404, 405]).await.unwrap_err();
        assert!(matches!(err, ResolveError::NotFound(ids) if ids == vec![404, 405]));
    }

    #[tokio::test]
    async fn foreign_credentials_are_rejected() {
        let resolver = CredentialResolver::new(fixture_store(), Duration::from_secs(300));
        let err = resolver.resolve(1, &[5, 8]).await.unwrap_err();
        assert!(matches!(
            err,
            ResolveError::OwnershipMismatch { advogado_id: 1, ref credential_ids } if credential_ids == &vec![8]
        ));
    }

    #[tokio::test]
    async fn resolution_fills_cache() {
        let resolver = CredentialResolver::new(fixture_store(), Duration::from_secs(300));
        resolver.resolve(1, &[5, 6]).await.unwrap();
        let stats = resolver.cache().stats();
        assert_eq!(stats.entries, 2);
        assert_eq!(stats.valid, 2);
    }

    #[tokio::test(start_paused = true)]
    async fn cache_entries_expire() {
        let cache = CredentialCache::new(Duration::from_secs(300));
        cache.insert(credential(5, 1, "TRT2"));
        assert!(cache.get(5).is_some());

        tokio::time::advance(Duration::from_secs(301)).await;
        assert!(cache.get(5).is_none());
        assert_eq!(
            cache.stats(),
            CacheStats {
                entries: 1,
                valid: 0,
                expired: 1
            }
        );
        assert_eq!(cache.clean_expired(), 1);
        assert_eq!(cache.stats().entries, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn inserts_sweep_expired_entries() {
        let cache = CredentialCache::new(Duration::from_secs(300));
        cache.insert(credential(5, 1, "TRT2"));
        tokio::time::advance(Duration::from_secs(301)).await;

        for id in 100..100 + SWEEP_EVERY as i64 - 2 {
            cache.insert(credential(id, 1, "TRT3"));
        }
        assert_eq!(cache.stats().expired, 1);

        cache.insert(credential(99, 1, "TRT3"));
        let stats = cache.stats();
        assert_eq!(stats.expired, 0);
        assert_eq!(stats.entries, SWEEP_EVERY as usize - 1);
    }

    #[tokio::test(start_paused = true)]
    async fn resolver_refetches_after_expiry() {
        let resolver = CredentialResolver::new(fixture_store(), Duration::from_secs(300));
        resolver.resolve(1, &[5]).await.unwrap();
        tokio::time::advance(Duration::from_secs(301)).await;
        assert!(resolver.cache().get(5).is_none());
        resolver.resolve(1, &[5]).await.unwrap();
        assert_eq!(resolver.cache().stats().valid, 1);
    }

    #[test]
    fn clear_empties_cache() {
        let cache = CredentialCache::new(Duration::from_secs(300));
        cache.insert(credential(5, 1, "TRT2"));
        cache.clear();
        assert_eq!(cache.stats().entries, 0);
    }
}
