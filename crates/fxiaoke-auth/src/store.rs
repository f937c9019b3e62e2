//! Token cache with per-record expiry
//!
//! A record present in the store is assumed live. Once its TTL has elapsed
//! it must read as absent, whichever way the backend achieves that.

use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::time::Duration;

use tokio::sync::RwLock;
use tokio::time::Instant;
use tracing::debug;

use crate::credentials::AccessToken;
use crate::error::Result;

/// Deadline used when `now + ttl` does not fit in an `Instant`.
const FAR_FUTURE: Duration = Duration::from_secs(86_400 * 365 * 30);

/// Boxed future returned by [`TokenStore`] methods.
pub type StoreFuture<'a, T> = Pin<Box<dyn Future<Output = Result<T>> + Send + 'a>>;

/// Keyed token cache consumed by the token manager.
///
/// Uses `Pin<Box<dyn Future>>` return types for dyn-compatibility (`Arc<dyn TokenStore>`).
pub trait TokenStore: Send + Sync {
    /// Cached token for `app_id`, if present and not expired. No side effects
    /// beyond dropping an already-expired record.
    fn lookup<'a>(&'a self, app_id: &'a str) -> StoreFuture<'a, Option<AccessToken>>;

    /// Store or replace the record for `token.app_id`; it becomes unreadable
    /// once `ttl` has elapsed.
    fn upsert<'a>(&'a self, token: &'a AccessToken, ttl: Duration) -> StoreFuture<'a, ()>;

    /// Delete any record for `app_id` and return how many were removed.
    /// Idempotent: removing an absent record returns 0.
    fn invalidate<'a>(&'a self, app_id: &'a str) -> StoreFuture<'a, u64>;
}

#[derive(Debug, Clone)]
struct Entry {
    token: AccessToken,
    deadline: Instant,
}

impl Entry {
    fn is_expired(&self, now: Instant) -> bool {
        now >= self.deadline
    }
}

/// In-process token store.
///
/// Deadlines use `tokio::time::Instant`, so paused-clock tests observe
/// expiry without real waiting. Expired records are evicted on lookup and
/// swept on every upsert; there is no background task.
#[derive(Debug, Default)]
pub struct MemoryTokenStore {
    entries: RwLock<HashMap<String, Entry>>,
}

impl MemoryTokenStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of records held, including expired ones not yet evicted.
    pub async fn len(&self) -> usize {
        self.entries.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }

    fn deadline_after(now: Instant, ttl: Duration) -> Instant {
        now.checked_add(ttl).unwrap_or_else(|| now + FAR_FUTURE)
    }

    async fn lookup_inner(&self, app_id: &str) -> Option<AccessToken> {
        let now = Instant::now();
        {
            let entries = self.entries.read().await;
            match entries.get(app_id) {
                None => return None,
                Some(entry) if !entry.is_expired(now) => return Some(entry.token.clone()),
                Some(_) => {}
            }
        }

        // Expired: evict unless a writer replaced it in the meantime
        let mut entries = self.entries.write().await;
        if entries
            .get(app_id)
            .is_some_and(|entry| entry.is_expired(Instant::now()))
        {
            entries.remove(app_id);
            debug!(app_id, "evicted expired token");
        }
        None
    }
}

impl TokenStore for MemoryTokenStore {
    fn lookup<'a>(&'a self, app_id: &'a str) -> StoreFuture<'a, Option<AccessToken>> {
        Box::pin(async move { Ok(self.lookup_inner(app_id).await) })
    }

    fn upsert<'a>(&'a self, token: &'a AccessToken, ttl: Duration) -> StoreFuture<'a, ()> {
        Box::pin(async move {
            let now = Instant::now();
            let deadline = Self::deadline_after(now, ttl);
            let mut entries = self.entries.write().await;
            let before = entries.len();
            entries.retain(|_, entry| !entry.is_expired(now));
            let purged = before - entries.len();
            if purged > 0 {
                debug!(purged, "purged expired tokens");
            }
            entries.insert(
                token.app_id.clone(),
                Entry {
                    token: token.clone(),
                    deadline,
                },
            );
            debug!(app_id = %token.app_id, ttl_secs = ttl.as_secs(), "cached token");
            Ok(())
        })
    }

    fn invalidate<'a>(&'a self, app_id: &'a str) -> StoreFuture<'a, u64> {
        Box::pin(async move {
            let mut entries = self.entries.write().await;
            let removed = u64::from(entries.remove(app_id).is_some());
            debug!(app_id, removed, "invalidated token");
            Ok(removed)
        })
    }
}
