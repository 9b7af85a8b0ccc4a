//! Query result caching and single-flight sharing of identical reads

use crate::error::Result;
use crate::executor::Row;
use futures::future::{FutureExt, Shared};
use parking_lot::{Mutex, RwLock};
use sha2::{Digest, Sha256};
use std::collections::HashMap;
use std::fmt;
use std::future::Future;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::oneshot;
use tracing::debug;

/// Storage for serialized query results
pub trait QueryCache: Send + Sync {
    fn get(&self, key: &str) -> Option<String>;

    /// Store `value`; `None` keeps it until evicted
    fn set(&self, key: &str, value: String, ttl: Option<Duration>);

    fn delete(&self, key: &str);

    fn clear(&self);
}

/// SHA-256 digest of the key components.
///
/// Each component is length-prefixed, so `["ab", "c"]` and `["a", "bc"]`
/// give different keys. Keys are stable across builds and processes.
pub fn cache_key(components: &[&str]) -> String {
    let mut hasher = Sha256::new();
    for component in components {
        hasher.update((component.len() as u64).to_le_bytes());
        hasher.update(component.as_bytes());
    }
    format!("burrow:{:x}", hasher.finalize())
}

/// Cache settings carried by a query or command
#[derive(Clone)]
pub struct CachePolicy {
    /// `None` caches without expiry
    pub ttl: Option<Duration>,
    /// Overrides the connection's cache
    pub cache: Option<Arc<dyn QueryCache>>,
}

impl CachePolicy {
    pub fn new(ttl: Option<Duration>) -> Self {
        Self { ttl, cache: None }
    }

    pub fn with_cache(mut self, cache: Arc<dyn QueryCache>) -> Self {
        self.cache = Some(cache);
        self
    }
}

impl fmt::Debug for CachePolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CachePolicy")
            .field("ttl", &self.ttl)
            .field("custom_cache", &self.cache.is_some())
            .finish()
    }
}

#[derive(Debug, Clone)]
struct CacheEntry {
    value: String,
    expires_at: Option<Instant>,
    last_access: Instant,
}

impl CacheEntry {
    fn is_expired(&self, now: Instant) -> bool {
        self.expires_at.map_or(false, |at| now >= at)
    }
}

/// Thread-safe in-memory cache with TTL and LRU eviction
#[derive(Debug)]
pub struct MemoryCache {
    data: RwLock<HashMap<String, CacheEntry>>,
    max_entries: usize,
}

impl MemoryCache {
    pub fn new() -> Self {
        Self::with_capacity(1000)
    }

    pub fn with_capacity(max_entries: usize) -> Self {
        Self {
            data: RwLock::new(HashMap::new()),
            max_entries,
        }
    }

    pub fn len(&self) -> usize {
        self.data.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn evict_lru(data: &mut HashMap<String, CacheEntry>) {
        let lru = data
            .iter()
            .min_by_key(|(_, entry)| entry.last_access)
            .map(|(key, _)| key.clone());
        if let Some(key) = lru {
            data.remove(&key);
            debug!("Evicted LRU cache entry: {}", key);
        }
    }
}

impl Default for MemoryCache {
    fn default() -> Self {
        Self::new()
    }
}

impl QueryCache for MemoryCache {
    fn get(&self, key: &str) -> Option<String> {
        let now = Instant::now();
        let mut data = self.data.write();
        match data.get_mut(key) {
            Some(entry) if entry.is_expired(now) => {
                data.remove(key);
                None
            }
            Some(entry) => {
                entry.last_access = now;
                Some(entry.value.clone())
            }
            None => None,
        }
    }

    fn set(&self, key: &str, value: String, ttl: Option<Duration>) {
        let now = Instant::now();
        let mut data = self.data.write();
        data.retain(|_, entry| !entry.is_expired(now));
        if !data.contains_key(key) && data.len() >= self.max_entries {
            Self::evict_lru(&mut data);
        }
        data.insert(
            key.to_string(),
            CacheEntry {
                value,
                expires_at: ttl.map(|d| now + d),
                last_access: now,
            },
        );
    }

    fn delete(&self, key: &str) {
        self.data.write().remove(key);
    }

    fn clear(&self) {
        self.data.write().clear();
    }
}

type SharedRows = Shared<oneshot::Receiver<Result<Arc<Vec<Row>>>>>;

/// Coalesces concurrent identical reads into one execution.
///
/// The first caller for a key runs the query; later callers await its
/// result. If the first caller is dropped before finishing, waiting callers
/// run the query themselves.
#[derive(Default)]
pub struct ShareGroup {
    inflight: Mutex<HashMap<String, SharedRows>>,
}

enum Ticket {
    Leader(oneshot::Sender<Result<Arc<Vec<Row>>>>),
    Follower(SharedRows),
}

struct RemoveOnDrop<'a> {
    group: &'a ShareGroup,
    key: &'a str,
}

impl Drop for RemoveOnDrop<'_> {
    fn drop(&mut self) {
        self.group.inflight.lock().remove(self.key);
    }
}

impl ShareGroup {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of reads currently in flight
    pub fn inflight(&self) -> usize {
        self.inflight.lock().len()
    }

    /// Run `fetch` unless an identical read is already in flight.
    ///
    /// `fetch` is only polled by the leader, or by a follower whose leader
    /// went away.
    pub async fn run<Fut>(&self, key: &str, fetch: Fut) -> Result<Arc<Vec<Row>>>
    where
        Fut: Future<Output = Result<Vec<Row>>>,
    {
        let ticket = {
            let mut inflight = self.inflight.lock();
            match inflight.get(key) {
                Some(shared) => Ticket::Follower(shared.clone()),
                None => {
                    let (tx, rx) = oneshot::channel();
                    inflight.insert(key.to_string(), rx.shared());
                    Ticket::Leader(tx)
                }
            }
        };

        match ticket {
            Ticket::Follower(shared) => match shared.await {
                Ok(result) => result,
                Err(_) => fetch.await.map(Arc::new),
            },
            Ticket::Leader(tx) => {
                let guard = RemoveOnDrop { group: self, key };
                let result = fetch.await.map(Arc::new);
                drop(guard);
                let _ = tx.send(result.clone());
                result
            }
        }
    }
}

impl fmt::Debug for ShareGroup {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ShareGroup")
            .field("inflight", &self.inflight())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::Error;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[test]
    fn test_cache_key_is_stable() {
        let a = cache_key(&["Command", "fetchAll", "dsn", "SELECT 1"]);
        let b = cache_key(&["Command", "fetchAll", "dsn", "SELECT 1"]);
        let c = cache_key(&["Command", "fetchAll", "dsn", "SELECT 2"]);
        assert_eq!(a, b);
        assert_ne!(a, c);
        assert_ne!(cache_key(&["ab", "c"]), cache_key(&["a", "bc"]));
        assert_eq!(a.len(), "burrow:".len() + 64);
    }

    #[test]
    fn test_cache_key_known_digest() {
        // SHA-256 of eight zero bytes
        assert_eq!(
            cache_key(&[""]),
            "burrow:af5570f5a1810b7af78caf4bc70a660f0df51e42baf91d4de5b2328de0e83dfc"
        );
    }

    #[test]
    fn test_memory_cache_ttl() {
        let cache = MemoryCache::new();
        cache.set("k", "v".to_string(), None);
        assert_eq!(cache.get("k").as_deref(), Some("v"));
        cache.set("gone", "v".to_string(), Some(Duration::ZERO));
        assert_eq!(cache.get("gone"), None);
        cache.delete("k");
        assert!(cache.is_empty());
    }

    #[test]
    fn test_memory_cache_evicts_lru() {
        let cache = MemoryCache::with_capacity(2);
        cache.set("a", "1".to_string(), None);
        cache.set("b", "2".to_string(), None);
        cache.get("a");
        cache.set("c", "3".to_string(), None);
        assert_eq!(cache.len(), 2);
        assert!(cache.get("a").is_some());
        assert!(cache.get("b").is_none());
    }

    #[tokio::test]
    async fn test_share_group_coalesces() {
        let group = Arc::new(ShareGroup::new());
        let calls = Arc::new(AtomicUsize::new(0));
        let (release_tx, release_rx) = oneshot::channel::<()>();

        let leader = {
            let group = group.clone();
            let calls = calls.clone();
            tokio::spawn(async move {
                group
                    .run("k", async move {
                        calls.fetch_add(1, Ordering::SeqCst);
                        let _ = release_rx.await;
                        Ok(vec![Row::new().with("n", 1)])
                    })
                    .await
            })
        };
        while group.inflight() == 0 {
            tokio::task::yield_now().await;
        }

        let follower = {
            let group = group.clone();
            let calls = calls.clone();
            tokio::spawn(async move {
                group
                    .run("k", async move {
                        calls.fetch_add(1, Ordering::SeqCst);
                        Ok(Vec::new())
                    })
                    .await
            })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;
        let _ = release_tx.send(());

        let a = leader.await.unwrap().unwrap();
        let b = follower.await.unwrap().unwrap();
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert_eq!(a.len(), 1);
        assert_eq!(b.len(), 1);
        assert_eq!(group.inflight(), 0);
    }

    #[tokio::test]
    async fn test_share_group_shares_errors() {
        let group = ShareGroup::new();
        let result = group
            .run("k", async { Err(Error::database("boom")) })
            .await;
        assert!(result.is_err());
        assert_eq!(group.inflight(), 0);
    }
}
