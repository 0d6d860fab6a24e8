//! Short-TTL response cache and per-key call coalescing.

use std::collections::HashMap;
use std::num::NonZeroUsize;
use std::sync::{Arc, Mutex as StdMutex, PoisonError};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use lru::LruCache;
use tokio::sync::{Mutex, watch};
use tracing::debug;

use crate::model::AnalysisResponse;

/// Cache collaborator used by the orchestration service
#[async_trait]
pub trait CacheStore: Send + Sync {
    async fn get(&self, key: &str) -> Option<AnalysisResponse>;
    async fn put(&self, key: &str, value: AnalysisResponse, ttl: Duration);
}

/// Derive the cache key for a classification request.
pub fn cache_key(text: &str, context: Option<&str>) -> String {
    let mut hasher = blake3::Hasher::new();
    hasher.update(text.as_bytes());
    // None and Some("") must not collide
    match context {
        Some(ctx) => {
            hasher.update(b"\x1fs");
            hasher.update(ctx.as_bytes());
        }
        None => {
            hasher.update(b"\x1fn");
        }
    }
    format!("cache_{}", &hasher.finalize().to_hex()[..32])
}

struct CachedEntry {
    value: AnalysisResponse,
    expires_at: Instant,
}

/// Bounded LRU with per-entry expiry
pub struct InMemoryCache {
    entries: Mutex<LruCache<String, CachedEntry>>,
}

impl InMemoryCache {
    pub fn new(max_entries: usize) -> Self {
        Self {
            entries: Mutex::new(LruCache::new(
                NonZeroUsize::new(max_entries).unwrap_or(NonZeroUsize::MIN),
            )),
        }
    }

    pub async fn len(&self) -> usize {
        self.entries.lock().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }
}

#[async_trait]
impl CacheStore for InMemoryCache {
    async fn get(&self, key: &str) -> Option<AnalysisResponse> {
        let mut entries = self.entries.lock().await;
        let expired = match entries.get(key) {
            Some(entry) if entry.expires_at > Instant::now() => return Some(entry.value.clone()),
            Some(_) => true,
            None => false,
        };
        if expired {
            entries.pop(key);
            debug!("Cache entry expired: {}", key);
        }
        None
    }

    async fn put(&self, key: &str, value: AnalysisResponse, ttl: Duration) {
        let entry = CachedEntry {
            value,
            expires_at: Instant::now() + ttl,
        };
        self.entries.lock().await.put(key.to_string(), entry);
    }
}

type Flights<T> = Arc<StdMutex<HashMap<String, Arc<watch::Sender<Option<T>>>>>>;

/// Per-key call coalescing. The first caller for a key leads and runs the
/// work; callers arriving while it runs receive the leader's value,
/// whatever it is, instead of running the work themselves.
pub struct SingleFlight<T> {
    flights: Flights<T>,
}

impl<T> Default for SingleFlight<T> {
    fn default() -> Self {
        Self {
            flights: Arc::new(StdMutex::new(HashMap::new())),
        }
    }
}

pub enum Flight<T> {
    Leader(FlightLeader<T>),
    Follower(FlightFollower<T>),
}

impl<T: Clone> SingleFlight<T> {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn join(&self, key: &str) -> Flight<T> {
        let mut flights = self.flights.lock().unwrap_or_else(PoisonError::into_inner);
        if let Some(tx) = flights.get(key) {
            return Flight::Follower(FlightFollower(tx.subscribe()));
        }
        let (tx, _) = watch::channel(None);
        let tx = Arc::new(tx);
        flights.insert(key.to_string(), tx.clone());
        Flight::Leader(FlightLeader {
            key: key.to_string(),
            tx,
            flights: self.flights.clone(),
        })
    }

    /// Keys with a leader still running
    pub fn in_flight(&self) -> usize {
        self.flights
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }
}

/// Dropping the leader without `complete` releases the key with no value.
pub struct FlightLeader<T> {
    key: String,
    tx: Arc<watch::Sender<Option<T>>>,
    flights: Flights<T>,
}

impl<T> FlightLeader<T> {
    pub fn complete(self, value: T) {
        self.tx.send_replace(Some(value));
    }
}

impl<T> Drop for FlightLeader<T> {
    fn drop(&mut self) {
        let mut flights = self.flights.lock().unwrap_or_else(PoisonError::into_inner);
        if flights
            .get(&self.key)
            .is_some_and(|tx| Arc::ptr_eq(tx, &self.tx))
        {
            flights.remove(&self.key);
        }
    }
}

pub struct FlightFollower<T>(watch::Receiver<Option<T>>);

impl<T: Clone> FlightFollower<T> {
    /// The leader's value, or `None` if the leader gave up without one.
    pub async fn outcome(mut self) -> Option<T> {
        let _ = self.0.wait_for(Option::is_some).await;
        self.0.borrow().clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn response(cid: &str) -> AnalysisResponse {
        AnalysisResponse::classification(Vec::new(), Vec::new(), cid)
    }

    #[test]
    fn cache_key_depends_on_text_and_context() {
        let a = cache_key("성실한 직원", None);
        assert!(a.starts_with("cache_"));
        assert_eq!(a, cache_key("성실한 직원", None));
        assert_ne!(a, cache_key("성실한 직원", Some("")));
        assert_ne!(a, cache_key("성실한 직원", Some("team")));
        assert_ne!(a, cache_key("늦은 직원", None));
    }

    #[tokio::test]
    async fn entries_expire_after_ttl() {
        let cache = InMemoryCache::new(10);
        cache
            .put("k", response("c1"), Duration::from_millis(30))
            .await;
        assert_eq!(
            cache.get("k").await.map(|r| r.correlation_id),
            Some("c1".to_string())
        );

        tokio::time::sleep(Duration::from_millis(60)).await;
        assert!(cache.get("k").await.is_none());
        assert!(cache.is_empty().await);
    }

    #[tokio::test]
    async fn capacity_evicts_least_recently_used() {
        let cache = InMemoryCache::new(2);
        let ttl = Duration::from_secs(60);
        cache.put("a", response("a"), ttl).await;
        cache.put("b", response("b"), ttl).await;
        assert!(cache.get("a").await.is_some());
        cache.put("c", response("c"), ttl).await;

        assert!(cache.get("b").await.is_none());
        assert!(cache.get("a").await.is_some());
        assert_eq!(cache.len().await, 2);
    }

    #[tokio::test]
    async fn followers_receive_the_leader_value() {
        let flights: SingleFlight<AnalysisResponse> = SingleFlight::new();
        let Flight::Leader(leader) = flights.join("k") else {
            panic!("first caller leads");
        };

        let mut waiters = Vec::new();
        for _ in 0..3 {
            let Flight::Follower(follower) = flights.join("k") else {
                panic!("later callers follow");
            };
            waiters.push(tokio::spawn(follower.outcome()));
        }
        assert_eq!(flights.in_flight(), 1);

        tokio::time::sleep(Duration::from_millis(20)).await;
        leader.complete(AnalysisResponse::failure("model offline", "c1"));

        for waiter in waiters {
            let shared = waiter.await.unwrap().expect("leader published");
            assert!(!shared.success);
            assert_eq!(shared.correlation_id, "c1");
        }
        assert_eq!(flights.in_flight(), 0);
    }

    #[tokio::test]
    async fn abandoned_leader_releases_the_key() {
        let flights: SingleFlight<AnalysisResponse> = SingleFlight::new();
        let Flight::Leader(leader) = flights.join("k") else {
            panic!("first caller leads");
        };
        let Flight::Follower(follower) = flights.join("k") else {
            panic!("second caller follows");
        };

        drop(leader);
        assert!(follower.outcome().await.is_none());
        assert_eq!(flights.in_flight(), 0);
        assert!(matches!(flights.join("k"), Flight::Leader(_)));
    }

    #[test]
    fn different_keys_lead_independently() {
        let flights: SingleFlight<AnalysisResponse> = SingleFlight::new();
        let a = flights.join("a");
        let b = flights.join("b");
        assert!(matches!(a, Flight::Leader(_)));
        assert!(matches!(b, Flight::Leader(_)));
        assert_eq!(flights.in_flight(), 2);
    }
}
