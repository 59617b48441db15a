//! Centrally-managed caches
//!
//! All mutable cross-call state lives here; modules hold `Arc<Cache<..>>`
//! handles obtained from the registry instead of keeping their own global
//! maps. Caches are advisory, never authoritative: every consumer must
//! behave correctly on a miss.

use std::any::Any;
use std::collections::HashMap;
use std::future::Future;
use std::hash::Hash;
use std::num::NonZeroUsize;
use std::sync::{Arc, Mutex};

use lru::LruCache;
use tokio::sync::OnceCell;

enum Backing<K: Hash + Eq, V> {
    Map(HashMap<K, V>),
    Lru(LruCache<K, V>),
}

/// A named cache: either an unbounded map or a size-bounded LRU.
pub struct Cache<K: Hash + Eq, V> {
    name: String,
    inner: Mutex<Backing<K, V>>,
    /// In-flight loads for single-flight memoization.
    flights: tokio::sync::Mutex<HashMap<K, Arc<OnceCell<V>>>>,
}

impl<K: Hash + Eq + Clone, V: Clone> Cache<K, V> {
    fn new_map(name: &str) -> Self {
        Self {
            name: name.to_string(),
            inner: Mutex::new(Backing::Map(HashMap::new())),
            flights: tokio::sync::Mutex::new(HashMap::new()),
        }
    }

    fn new_lru(name: &str, capacity: usize) -> Self {
        let cap = NonZeroUsize::new(capacity.max(1)).expect("capacity clamped to >= 1");
        Self {
            name: name.to_string(),
            inner: Mutex::new(Backing::Lru(LruCache::new(cap))),
            flights: tokio::sync::Mutex::new(HashMap::new()),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn get(&self, key: &K) -> Option<V> {
        let mut inner = self.inner.lock().expect("cache mutex poisoned");
        match &mut *inner {
            Backing::Map(m) => m.get(key).cloned(),
            Backing::Lru(l) => l.get(key).cloned(),
        }
    }

    pub fn insert(&self, key: K, value: V) {
        let mut inner = self.inner.lock().expect("cache mutex poisoned");
        match &mut *inner {
            Backing::Map(m) => {
                m.insert(key, value);
            }
            Backing::Lru(l) => {
                l.put(key, value);
            }
        }
    }

    pub fn remove(&self, key: &K) -> Option<V> {
        let mut inner = self.inner.lock().expect("cache mutex poisoned");
        match &mut *inner {
            Backing::Map(m) => m.remove(key),
            Backing::Lru(l) => l.pop(key),
        }
    }

    pub fn len(&self) -> usize {
        let inner = self.inner.lock().expect("cache mutex poisoned");
        match &*inner {
            Backing::Map(m) => m.len(),
            Backing::Lru(l) => l.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn clear(&self) {
        let mut inner = self.inner.lock().expect("cache mutex poisoned");
        match &mut *inner {
            Backing::Map(m) => m.clear(),
            Backing::Lru(l) => l.clear(),
        }
    }

    /// Snapshot of all entries. Iteration order is unspecified.
    pub fn entries(&self) -> Vec<(K, V)> {
        let inner = self.inner.lock().expect("cache mutex poisoned");
        match &*inner {
            Backing::Map(m) => m.iter().map(|(k, v)| (k.clone(), v.clone())).collect(),
            Backing::Lru(l) => l.iter().map(|(k, v)| (k.clone(), v.clone())).collect(),
        }
    }

    /// Drop entries whose key fails the predicate. Used for path-scoped
    /// invalidation (a changed file invalidates every walk rooted above it).
    pub fn retain(&self, mut keep: impl FnMut(&K) -> bool) {
        let mut inner = self.inner.lock().expect("cache mutex poisoned");
        match &mut *inner {
            Backing::Map(m) => m.retain(|k, _| keep(k)),
            Backing::Lru(l) => {
                let doomed: Vec<K> = l
                    .iter()
                    .filter(|(k, _)| !keep(k))
                    .map(|(k, _)| k.clone())
                    .collect();
                for k in doomed {
                    l.pop(&k);
                }
            }
        }
    }

    /// Memoize with deduplication: concurrent calls for the same key share
    /// one loader invocation. Successful results are cached; failures are
    /// not, so the next caller retries.
    pub async fn get_or_load<F, Fut, E>(&self, key: K, loader: F) -> Result<V, E>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<V, E>>,
    {
        if let Some(v) = self.get(&key) {
            return Ok(v);
        }

        let cell = {
            let mut flights = self.flights.lock().await;
            flights
                .entry(key.clone())
                .or_insert_with(|| Arc::new(OnceCell::new()))
                .clone()
        };

        let result = cell.get_or_try_init(loader).await.cloned();

        let mut flights = self.flights.lock().await;
        if let Ok(v) = &result {
            self.insert(key.clone(), v.clone());
        }
        flights.remove(&key);
        result
    }
}

/// Type-erased view for pattern invalidation.
trait AnyCache: Send + Sync {
    fn clear_all(&self);
}

impl<K, V> AnyCache for Cache<K, V>
where
    K: Hash + Eq + Clone + Send + Sync + 'static,
    V: Clone + Send + Sync + 'static,
{
    fn clear_all(&self) {
        self.clear();
    }
}

struct Entry {
    typed: Arc<dyn Any + Send + Sync>,
    erased: Arc<dyn AnyCache>,
}

/// Registry of named caches. One instance lives in the engine's root
/// context; components receive handles, never the registry itself, except
/// where they need pattern invalidation.
#[derive(Default)]
pub struct CacheRegistry {
    entries: Mutex<HashMap<String, Entry>>,
}

impl CacheRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Get or create an unbounded, iterable map cache under `namespace`.
    pub fn map<K, V>(&self, namespace: &str) -> Arc<Cache<K, V>>
    where
        K: Hash + Eq + Clone + Send + Sync + 'static,
        V: Clone + Send + Sync + 'static,
    {
        self.get_or_insert(namespace, || Cache::new_map(namespace))
    }

    /// Get or create a size-bounded LRU cache under `namespace`.
    pub fn lru<K, V>(&self, namespace: &str, capacity: usize) -> Arc<Cache<K, V>>
    where
        K: Hash + Eq + Clone + Send + Sync + 'static,
        V: Clone + Send + Sync + 'static,
    {
        self.get_or_insert(namespace, || Cache::new_lru(namespace, capacity))
    }

    fn get_or_insert<K, V>(&self, namespace: &str, make: impl FnOnce() -> Cache<K, V>) -> Arc<Cache<K, V>>
    where
        K: Hash + Eq + Clone + Send + Sync + 'static,
        V: Clone + Send + Sync + 'static,
    {
        let mut entries = self.entries.lock().expect("registry mutex poisoned");
        if let Some(entry) = entries.get(namespace) {
            if let Ok(cache) = entry.typed.clone().downcast::<Cache<K, V>>() {
                return cache;
            }
            // Same namespace registered with different types: a programming
            // error, but not worth crashing a sync run over.
            debug_assert!(false, "cache namespace {namespace:?} re-registered with new types");
            tracing::warn!(namespace, "cache namespace re-registered with different types");
        }
        let cache = Arc::new(make());
        entries.insert(
            namespace.to_string(),
            Entry {
                typed: cache.clone(),
                erased: cache.clone(),
            },
        );
        cache
    }

    /// Invalidate all caches whose namespace matches `pattern`. A trailing
    /// `*` makes it a prefix match; otherwise the match is exact.
    pub fn clear(&self, pattern: &str) {
        let entries = self.entries.lock().expect("registry mutex poisoned");
        let matches: Vec<&Entry> = match pattern.strip_suffix('*') {
            Some(prefix) => entries
                .iter()
                .filter(|(name, _)| name.starts_with(prefix))
                .map(|(_, e)| e)
                .collect(),
            None => entries.get(pattern).into_iter().collect(),
        };
        for entry in matches {
            entry.erased.clear_all();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[test]
    fn test_map_basic_ops() {
        let reg = CacheRegistry::new();
        let cache: Arc<Cache<String, u32>> = reg.map("test.map");
        cache.insert("a".into(), 1);
        cache.insert("b".into(), 2);
        assert_eq!(cache.get(&"a".into()), Some(1));
        assert_eq!(cache.len(), 2);
        cache.remove(&"a".into());
        assert_eq!(cache.get(&"a".into()), None);
    }

    #[test]
    fn test_lru_evicts_oldest() {
        let reg = CacheRegistry::new();
        let cache: Arc<Cache<u32, u32>> = reg.lru("test.lru", 2);
        cache.insert(1, 10);
        cache.insert(2, 20);
        // Touch 1 so 2 becomes the eviction victim.
        assert_eq!(cache.get(&1), Some(10));
        cache.insert(3, 30);
        assert_eq!(cache.get(&2), None);
        assert_eq!(cache.get(&1), Some(10));
        assert_eq!(cache.get(&3), Some(30));
    }

    #[test]
    fn test_same_namespace_returns_same_cache() {
        let reg = CacheRegistry::new();
        let a: Arc<Cache<String, u32>> = reg.map("shared");
        let b: Arc<Cache<String, u32>> = reg.map("shared");
        a.insert("k".into(), 7);
        assert_eq!(b.get(&"k".into()), Some(7));
    }

    #[test]
    fn test_clear_pattern_prefix_and_exact() {
        let reg = CacheRegistry::new();
        let a: Arc<Cache<String, u32>> = reg.map("fs.walk");
        let b: Arc<Cache<String, u32>> = reg.map("fs.dirs");
        let c: Arc<Cache<String, u32>> = reg.map("index.books");
        a.insert("x".into(), 1);
        b.insert("y".into(), 2);
        c.insert("z".into(), 3);

        reg.clear("fs.*");
        assert!(a.is_empty());
        assert!(b.is_empty());
        assert_eq!(c.len(), 1);

        reg.clear("index.books");
        assert!(c.is_empty());
    }

    #[test]
    fn test_retain() {
        let reg = CacheRegistry::new();
        let cache: Arc<Cache<String, u32>> = reg.map("test.retain");
        cache.insert("keep".into(), 1);
        cache.insert("drop".into(), 2);
        cache.retain(|k| k == "keep");
        assert_eq!(cache.get(&"keep".into()), Some(1));
        assert_eq!(cache.get(&"drop".into()), None);
    }

    #[tokio::test]
    async fn test_get_or_load_single_flight() {
        let reg = CacheRegistry::new();
        let cache: Arc<Cache<String, u32>> = reg.map("test.flight");
        let calls = Arc::new(AtomicUsize::new(0));

        let mut handles = Vec::new();
        for _ in 0..8 {
            let cache = cache.clone();
            let calls = calls.clone();
            handles.push(tokio::spawn(async move {
                cache
                    .get_or_load("k".to_string(), || async {
                        calls.fetch_add(1, Ordering::SeqCst);
                        tokio::time::sleep(std::time::Duration::from_millis(10)).await;
                        Ok::<_, ()>(42u32)
                    })
                    .await
            }));
        }
        for h in handles {
            assert_eq!(h.await.unwrap(), Ok(42));
        }
        assert_eq!(calls.load(Ordering::SeqCst), 1, "loader should run once");
        assert_eq!(cache.get(&"k".to_string()), Some(42));
    }

    #[tokio::test]
    async fn test_get_or_load_failure_not_cached() {
        let reg = CacheRegistry::new();
        let cache: Arc<Cache<String, u32>> = reg.map("test.fail");
        let calls = Arc::new(AtomicUsize::new(0));

        let c = calls.clone();
        let first: Result<u32, String> = cache
            .get_or_load("k".to_string(), || async move {
                c.fetch_add(1, Ordering::SeqCst);
                Err("boom".to_string())
            })
            .await;
        assert!(first.is_err());

        let c = calls.clone();
        let second = cache
            .get_or_load("k".to_string(), || async move {
                c.fetch_add(1, Ordering::SeqCst);
                Ok::<_, String>(9)
            })
            .await;
        assert_eq!(second, Ok(9));
        assert_eq!(calls.load(Ordering::SeqCst), 2, "failure must not be cached");
    }
}
