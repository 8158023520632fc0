//! Shared Credential Cache
//!
//! Backends that need OAuth ask this cache for a bearer token by scope.
//! The cache performs at most one refresh per scope no matter how many
//! backends or concurrent requests want it: each scope has a single async
//! slot, and whoever holds it refreshes while everyone else waits and then
//! reads the fresh token.

pub mod google;

pub use google::GoogleTokenProvider;

use std::collections::HashMap;
use std::sync::Arc;

use anyhow::Result;
use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use parking_lot::Mutex;
use tracing::debug;

/// Expiry margin: a token within this window of expiring is refreshed
/// early so an in-flight API call never races the deadline.
const EXPIRY_MARGIN_SECS: i64 = 60;

/// A bearer token with its expiry.
#[derive(Debug, Clone)]
pub struct Token {
    pub access_token: String,
    pub expires_at: DateTime<Utc>,
}

impl Token {
    pub fn is_expired(&self) -> bool {
        Utc::now() + Duration::seconds(EXPIRY_MARGIN_SECS) >= self.expires_at
    }
}

/// Something that can mint a fresh token for one credential scope.
#[async_trait]
pub trait TokenProvider: Send + Sync {
    /// Credential scope this provider refreshes; the cache key.
    fn scope(&self) -> &str;

    /// Perform one refresh against the upstream token endpoint.
    async fn refresh(&self) -> Result<Token>;
}

/// Per-scope token store with single-flight refresh.
#[derive(Default)]
pub struct CredentialCache {
    slots: Mutex<HashMap<String, Arc<tokio::sync::Mutex<Option<Token>>>>>,
}

impl CredentialCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Get a valid token for the provider's scope, refreshing at most once
    /// regardless of concurrent demand. Waiters that arrive during an
    /// in-flight refresh block on the scope slot and then reuse the result.
    pub async fn token(&self, provider: &dyn TokenProvider) -> Result<Token> {
        let slot = self.slot(provider.scope());
        let mut guard = slot.lock().await;

        if let Some(token) = guard.as_ref() {
            if !token.is_expired() {
                return Ok(token.clone());
            }
        }

        debug!("Refreshing credentials for scope {}", provider.scope());
        let token = provider.refresh().await?;
        *guard = Some(token.clone());
        Ok(token)
    }

    fn slot(&self, scope: &str) -> Arc<tokio::sync::Mutex<Option<Token>>> {
        let mut slots = self.slots.lock();
        slots.entry(scope.to_string()).or_default().clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct CountingProvider {
        scope: String,
        refreshes: AtomicUsize,
        ttl_secs: i64,
    }

    impl CountingProvider {
        fn new(scope: &str, ttl_secs: i64) -> Self {
            Self {
                scope: scope.to_string(),
                refreshes: AtomicUsize::new(0),
                ttl_secs,
            }
        }
    }

    #[async_trait]
    impl TokenProvider for CountingProvider {
        fn scope(&self) -> &str {
            &self.scope
        }

        async fn refresh(&self) -> Result<Token> {
            // Long enough for every concurrent waiter to pile up on the slot.
            tokio::time::sleep(std::time::Duration::from_millis(20)).await;
            let n = self.refreshes.fetch_add(1, Ordering::SeqCst) + 1;
            Ok(Token {
                access_token: format!("token-{n}"),
                expires_at: Utc::now() + Duration::seconds(self.ttl_secs),
            })
        }
    }

    #[tokio::test]
    async fn concurrent_demand_refreshes_once() {
        let cache = Arc::new(CredentialCache::new());
        let provider = Arc::new(CountingProvider::new("gmail", 3600));

        let mut handles = Vec::new();
        for _ in 0..16 {
            let cache = cache.clone();
            let provider = provider.clone();
            handles.push(tokio::spawn(async move {
                cache.token(provider.as_ref()).await.unwrap()
            }));
        }
        for handle in handles {
            let token = handle.await.unwrap();
            assert_eq!(token.access_token, "token-1");
        }
        assert_eq!(provider.refreshes.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn expired_token_triggers_second_refresh() {
        let cache = CredentialCache::new();
        let provider = CountingProvider::new("calendar", -10);

        let first = cache.token(&provider).await.unwrap();
        assert_eq!(first.access_token, "token-1");
        // Already expired, so the next request refreshes again.
        let second = cache.token(&provider).await.unwrap();
        assert_eq!(second.access_token, "token-2");
        assert_eq!(provider.refreshes.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn scopes_are_cached_independently() {
        let cache = CredentialCache::new();
        let gmail = CountingProvider::new("gmail", 3600);
        let calendar = CountingProvider::new("calendar", 3600);

        cache.token(&gmail).await.unwrap();
        cache.token(&calendar).await.unwrap();
        cache.token(&gmail).await.unwrap();

        assert_eq!(gmail.refreshes.load(Ordering::SeqCst), 1);
        assert_eq!(calendar.refreshes.load(Ordering::SeqCst), 1);
    }
}
