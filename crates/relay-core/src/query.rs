//! Cache-aside resolution of subscriptions.
//!
//! Every filter of a subscription is compiled and answered on its own, from
//! the result cache when possible and from the store otherwise. Results are
//! merged by event id and re-sorted newest first.

use parking_lot::Mutex as SyncMutex;
use serde::Deserialize;
use serde_json::Value;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex as AsyncMutex;
use tracing::{debug, warn};

use crate::cache::ResultCache;
use crate::error::StoreError;
use crate::event::Event;
use crate::filter::{self, CompiledFilter};
use crate::message::RelayMessage;
use crate::store::EventStore;

/// Lifetime of a cached filter result.
pub const DEFAULT_CACHE_TTL: Duration = Duration::from_secs(1800);

#[derive(Debug, Clone)]
pub struct QueryOptions {
    /// How long a cached result stays valid after it is written.
    pub cache_ttl: Duration,
    /// Upper bound for one cache call; slower calls count as a miss.
    pub cache_timeout: Duration,
}

impl Default for QueryOptions {
    fn default() -> Self {
        Self {
            cache_ttl: DEFAULT_CACHE_TTL,
            cache_timeout: Duration::from_millis(250),
        }
    }
}

/// A client subscription: an identifier and the filters it ORs together.
#[derive(Debug, Clone, Deserialize)]
pub struct Subscription {
    #[serde(rename = "subscription_id")]
    pub id: String,
    #[serde(default)]
    pub filters: Vec<Value>,
}

impl Subscription {
    pub fn new(id: impl Into<String>, filters: Vec<Value>) -> Self {
        Self {
            id: id.into(),
            filters,
        }
    }
}

type Gate = Arc<AsyncMutex<()>>;

pub struct QueryEngine {
    store: EventStore,
    cache: Arc<dyn ResultCache>,
    options: QueryOptions,
    /// One gate per cache key with a store query in progress.
    inflight: SyncMutex<HashMap<String, Gate>>,
}

impl QueryEngine {
    pub fn new(store: EventStore, cache: Arc<dyn ResultCache>, options: QueryOptions) -> Self {
        Self {
            store,
            cache,
            options,
            inflight: SyncMutex::new(HashMap::new()),
        }
    }

    pub fn store(&self) -> &EventStore {
        &self.store
    }

    /// Events matching any filter of `subscription`, deduplicated by id,
    /// newest first, at most as many as the largest filter limit.
    pub async fn resolve(&self, subscription: &Subscription) -> Result<Vec<Event>, StoreError> {
        let mut seen = HashSet::new();
        let mut merged = Vec::new();
        let mut limit = 0;

        for raw in &subscription.filters {
            let compiled = filter::compile(raw);
            limit = limit.max(compiled.limit);
            for event in self.run_filter(&compiled).await? {
                if seen.insert(event.id.clone()) {
                    merged.push(event);
                }
            }
        }

        // Stable: ties keep the per-filter order.
        merged.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        merged.truncate(limit);
        debug!(
            "Subscription {} resolved to {} event(s) from {} filter(s)",
            subscription.id,
            merged.len(),
            subscription.filters.len()
        );
        Ok(merged)
    }

    /// [`QueryEngine::resolve`] rendered as one `EVENT` message per result
    /// followed by `EOSE`.
    pub async fn subscribe(&self, subscription: &Subscription) -> Result<Vec<RelayMessage>, StoreError> {
        let events = self.resolve(subscription).await?;
        let mut messages: Vec<RelayMessage> = events
            .into_iter()
            .map(|event| RelayMessage::Event {
                subscription_id: subscription.id.clone(),
                event,
            })
            .collect();
        messages.push(RelayMessage::Eose {
            subscription_id: subscription.id.clone(),
        });
        Ok(messages)
    }

    async fn run_filter(&self, compiled: &CompiledFilter) -> Result<Vec<Event>, StoreError> {
        let Some(key) = compiled.cache_key() else {
            return Ok(Vec::new());
        };
        if let Some(events) = self.cached(&key).await {
            debug!("Cache hit for {}", key);
            return Ok(events);
        }

        let flight = self.join_flight(&key);
        let _leader = flight.gate.lock().await;
        // Whoever held the gate before us may have filled the cache.
        if let Some(events) = self.cached(&key).await {
            debug!("Cache hit for {} after waiting", key);
            return Ok(events);
        }

        debug!("Cache miss for {}", key);
        let events = self.store.query(&compiled.predicate, compiled.limit).await?;
        self.remember(&key, &events).await;
        Ok(events)
    }

    fn join_flight(&self, key: &str) -> Flight<'_> {
        let gate = Arc::clone(self.inflight.lock().entry(key.to_string()).or_default());
        Flight {
            inflight: &self.inflight,
            key: key.to_string(),
            gate,
        }
    }

    async fn cached(&self, key: &str) -> Option<Vec<Event>> {
        let bytes = match tokio::time::timeout(self.options.cache_timeout, self.cache.get(key)).await {
            Ok(Ok(Some(bytes))) => bytes,
            Ok(Ok(None)) => return None,
            Ok(Err(e)) => {
                warn!("Cache read for {} failed: {}", key, e);
                return None;
            }
            Err(_) => {
                warn!("Cache read for {} timed out after {:?}", key, self.options.cache_timeout);
                return None;
            }
        };
        match serde_json::from_slice(&bytes) {
            Ok(events) => Some(events),
            Err(e) => {
                warn!("Discarding undecodable cache entry {}: {}", key, e);
                None
            }
        }
    }

    async fn remember(&self, key: &str, events: &[Event]) {
        let payload = match serde_json::to_vec(events) {
            Ok(payload) => payload,
            Err(e) => {
                warn!("Could not serialize result for {}: {}", key, e);
                return;
            }
        };
        let put = self.cache.put(key, payload, self.options.cache_ttl);
        match tokio::time::timeout(self.options.cache_timeout, put).await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => warn!("Cache write for {} failed: {}", key, e),
            Err(_) => warn!("Cache write for {} timed out after {:?}", key, self.options.cache_timeout),
        }
    }
}

/// Membership in the single-flight group of one cache key. The last member
/// to leave removes the gate.
struct Flight<'a> {
    inflight: &'a SyncMutex<HashMap<String, Gate>>,
    key: String,
    gate: Gate,
}

impl Drop for Flight<'_> {
    fn drop(&mut self) {
        let mut inflight = self.inflight.lock();
        // One reference in the map, one here.
        if Arc::strong_count(&self.gate) == 2 {
            inflight.remove(&self.key);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::MemoryCache;
    use crate::error::CacheError;
    use crate::event::Tag;
    use crate::testing::signed_event;
    use async_trait::async_trait;
    use serde_json::json;

    struct FailingCache;

    #[async_trait]
    impl ResultCache for FailingCache {
        async fn get(&self, _key: &str) -> Result<Option<Vec<u8>>, CacheError> {
            Err(CacheError::Unavailable("connection refused".into()))
        }

        async fn put(&self, _key: &str, _value: Vec<u8>, _ttl: Duration) -> Result<(), CacheError> {
            Err(CacheError::Unavailable("connection refused".into()))
        }
    }

    struct StalledCache;

    #[async_trait]
    impl ResultCache for StalledCache {
        async fn get(&self, _key: &str) -> Result<Option<Vec<u8>>, CacheError> {
            tokio::time::sleep(Duration::from_secs(60)).await;
            Ok(None)
        }

        async fn put(&self, _key: &str, _value: Vec<u8>, _ttl: Duration) -> Result<(), CacheError> {
            tokio::time::sleep(Duration::from_secs(60)).await;
            Ok(())
        }
    }

    async fn seeded_store() -> (EventStore, Vec<Event>) {
        let store = EventStore::open_in_memory().unwrap();
        let mut events = Vec::new();
        for i in 0..5 {
            let ev = signed_event(1, 1, 1000 + i, &format!("note {i}"), vec![]);
            store.insert(ev.clone()).await.unwrap();
            events.push(ev);
        }
        (store, events)
    }

    fn engine_with(store: EventStore, cache: Arc<dyn ResultCache>) -> QueryEngine {
        QueryEngine::new(store, cache, QueryOptions::default())
    }

    #[tokio::test]
    async fn limit_returns_newest_first() {
        let (store, events) = seeded_store().await;
        let engine = engine_with(store, Arc::new(MemoryCache::default()));

        let sub = Subscription::new("s", vec![json!({"kinds": [1], "limit": 2})]);
        let got = engine.resolve(&sub).await.unwrap();
        assert_eq!(got, vec![events[4].clone(), events[3].clone()]);
    }

    #[tokio::test]
    async fn repeat_query_is_served_from_cache() {
        let (store, _) = seeded_store().await;
        let cache = Arc::new(MemoryCache::default());
        let engine = engine_with(store.clone(), cache.clone());
        let sub = Subscription::new("s", vec![json!({"kinds": [1]})]);

        let first = engine.resolve(&sub).await.unwrap();
        let key = filter::compile(&json!({"kinds": [1]})).cache_key().unwrap();
        let cached_bytes = cache.get(&key).await.unwrap().unwrap();
        assert_eq!(cached_bytes, serde_json::to_vec(&first).unwrap());

        let second = engine.resolve(&sub).await.unwrap();
        assert_eq!(serde_json::to_vec(&second).unwrap(), cached_bytes);
        assert_eq!(store.metrics().queries(), 1);
    }

    #[tokio::test]
    async fn empty_result_is_cached_as_present() {
        let (store, _) = seeded_store().await;
        let cache = Arc::new(MemoryCache::default());
        let engine = engine_with(store.clone(), cache.clone());
        let sub = Subscription::new("s", vec![json!({"kinds": [42]})]);

        assert!(engine.resolve(&sub).await.unwrap().is_empty());
        let key = filter::compile(&json!({"kinds": [42]})).cache_key().unwrap();
        assert_eq!(cache.get(&key).await.unwrap(), Some(b"[]".to_vec()));

        assert!(engine.resolve(&sub).await.unwrap().is_empty());
        assert_eq!(store.metrics().queries(), 1);
    }

    #[tokio::test]
    async fn expired_entry_goes_back_to_the_store() {
        let (store, _) = seeded_store().await;
        let options = QueryOptions {
            cache_ttl: Duration::from_millis(50),
            ..QueryOptions::default()
        };
        let engine = QueryEngine::new(store.clone(), Arc::new(MemoryCache::default()), options);
        let sub = Subscription::new("s", vec![json!({"kinds": [1]})]);

        engine.resolve(&sub).await.unwrap();
        engine.resolve(&sub).await.unwrap();
        assert_eq!(store.metrics().queries(), 1);

        tokio::time::sleep(Duration::from_millis(100)).await;
        engine.resolve(&sub).await.unwrap();
        assert_eq!(store.metrics().queries(), 2);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn concurrent_identical_misses_query_once() {
        let (store, events) = seeded_store().await;
        let engine = Arc::new(engine_with(store.clone(), Arc::new(MemoryCache::default())));

        let sub = Subscription::new("s", vec![json!({"authors": [events[0].pubkey.clone()]})]);
        let mut handles = Vec::new();
        for _ in 0..16 {
            let engine = Arc::clone(&engine);
            let sub = sub.clone();
            handles.push(tokio::spawn(async move { engine.resolve(&sub).await }));
        }
        for handle in handles {
            assert_eq!(handle.await.unwrap().unwrap().len(), 5);
        }
        assert_eq!(store.metrics().queries(), 1);
        assert!(engine.inflight.lock().is_empty());
    }

    #[tokio::test]
    async fn failing_cache_falls_through_to_store() {
        let (store, events) = seeded_store().await;
        let engine = engine_with(store.clone(), Arc::new(FailingCache));
        let sub = Subscription::new("s", vec![json!({"limit": 1})]);

        assert_eq!(engine.resolve(&sub).await.unwrap(), vec![events[4].clone()]);
        assert_eq!(engine.resolve(&sub).await.unwrap(), vec![events[4].clone()]);
        assert_eq!(store.metrics().queries(), 2);
    }

    #[tokio::test]
    async fn stalled_cache_times_out_as_miss() {
        let (store, events) = seeded_store().await;
        let options = QueryOptions {
            cache_timeout: Duration::from_millis(20),
            ..QueryOptions::default()
        };
        let engine = QueryEngine::new(store, Arc::new(StalledCache), options);
        let sub = Subscription::new("s", vec![json!({"limit": 1})]);
        assert_eq!(engine.resolve(&sub).await.unwrap(), vec![events[4].clone()]);
    }

    #[tokio::test]
    async fn corrupt_cache_entry_is_ignored() {
        let (store, _) = seeded_store().await;
        let cache = Arc::new(MemoryCache::default());
        let key = filter::compile(&json!({"kinds": [1]})).cache_key().unwrap();
        cache.put(&key, b"not json".to_vec(), DEFAULT_CACHE_TTL).await.unwrap();

        let engine = engine_with(store.clone(), cache.clone());
        let got = engine
            .resolve(&Subscription::new("s", vec![json!({"kinds": [1]})]))
            .await
            .unwrap();
        assert_eq!(got.len(), 5);
        assert_eq!(store.metrics().queries(), 1);
        assert_eq!(cache.get(&key).await.unwrap().unwrap(), serde_json::to_vec(&got).unwrap());
    }

    #[tokio::test]
    async fn malformed_filter_does_not_affect_others() {
        let (store, events) = seeded_store().await;
        let engine = engine_with(store.clone(), Arc::new(MemoryCache::default()));
        let sub = Subscription::new(
            "s",
            vec![json!({"kinds": "1"}), json!({"ids": [events[2].id.clone()]})],
        );

        assert_eq!(engine.resolve(&sub).await.unwrap(), vec![events[2].clone()]);
        assert_eq!(store.metrics().queries(), 1);
    }

    #[tokio::test]
    async fn filters_are_ored_and_deduplicated() {
        let store = EventStore::open_in_memory().unwrap();
        let tagged = signed_event(2, 1, 300, "tagged", vec![Tag::new(["e", "root"])]);
        let meta = signed_event(2, 0, 200, "meta", vec![]);
        let other = signed_event(3, 1, 100, "other", vec![]);
        for ev in [&tagged, &meta, &other] {
            store.insert(ev.clone()).await.unwrap();
        }
        let engine = engine_with(store, Arc::new(MemoryCache::default()));

        let sub = Subscription::new(
            "s",
            vec![
                json!({"authors": [tagged.pubkey.clone()]}),
                json!({"#e": ["root"]}),
                json!({"kinds": [1], "until": 150}),
            ],
        );
        assert_eq!(engine.resolve(&sub).await.unwrap(), vec![tagged, meta, other]);
    }

    #[tokio::test]
    async fn merged_result_is_cut_at_largest_limit() {
        let (store, events) = seeded_store().await;
        let engine = engine_with(store, Arc::new(MemoryCache::default()));
        let sub = Subscription::new(
            "s",
            vec![json!({"limit": 1}), json!({"ids": [events[0].id.clone(), events[1].id.clone()], "limit": 2})],
        );
        assert_eq!(
            engine.resolve(&sub).await.unwrap(),
            vec![events[4].clone(), events[1].clone()]
        );
    }

    #[tokio::test]
    async fn subscribe_ends_with_eose() {
        let (store, events) = seeded_store().await;
        let engine = engine_with(store, Arc::new(MemoryCache::default()));

        let messages = engine
            .subscribe(&Subscription::new("feed", vec![json!({"limit": 2})]))
            .await
            .unwrap();
        assert_eq!(
            messages,
            vec![
                RelayMessage::Event {
                    subscription_id: "feed".into(),
                    event: events[4].clone()
                },
                RelayMessage::Event {
                    subscription_id: "feed".into(),
                    event: events[3].clone()
                },
                RelayMessage::Eose {
                    subscription_id: "feed".into()
                },
            ]
        );

        let empty = engine
            .subscribe(&Subscription::new("none", vec![json!({"kinds": []})]))
            .await
            .unwrap();
        assert_eq!(
            empty,
            vec![RelayMessage::Eose {
                subscription_id: "none".into()
            }]
        );
    }

    #[test]
    fn subscription_decodes_from_request_body() {
        let sub: Subscription =
            serde_json::from_value(json!({"subscription_id": "abc", "filters": [{"kinds": [1]}]})).unwrap();
        assert_eq!(sub.id, "abc");
        assert_eq!(sub.filters, vec![json!({"kinds": [1]})]);
    }
}
