//! The optional per-pool result cache and the per-call directives that
//! steer it.
//!
//! Cache lookups and stores are best-effort by contract: a failing get or
//! put is logged and the call proceeds as if the cache were absent.

use std::{str::FromStr, sync::Arc, time::Duration};

use faststr::FastStr;
use linked_hash_map::LinkedHashMap;
use parking_lot::Mutex;
use tokio::time::Instant;

use crate::{
    error::{Error, Result},
    value::Value,
};

#[derive(Clone, Copy, Debug, PartialEq, Eq, Default)]
pub enum CachePolicy {
    /// Evict the least recently used entry on overflow.
    #[default]
    Lru,
    /// Entries carry a weight >= 1; the weight sum is bounded by the cache
    /// size and least recently used entries are evicted to fit.
    Weight,
}

impl FromStr for CachePolicy {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "lru" => Ok(CachePolicy::Lru),
            "weight" => Ok(CachePolicy::Weight),
            other => Err(Error::config(format!("unknown cache policy '{other}'"))),
        }
    }
}

#[derive(Clone, Debug)]
pub struct CacheOptions {
    pub size: usize,
    pub policy: CachePolicy,
    pub default_ttl: Duration,
    pub evict_period: Duration,
}

impl Default for CacheOptions {
    fn default() -> Self {
        CacheOptions {
            size: 100,
            policy: CachePolicy::Lru,
            default_ttl: Duration::from_secs(60),
            evict_period: Duration::from_secs(10),
        }
    }
}

/// How a particular call wants to interact with the pool cache.
pub enum CacheKey {
    /// Derive the key from the call name and arguments.
    Derived,
    /// Use the supplied key.
    Explicit(FastStr),
    /// Bypass the cache entirely for this call.
    Disabled,
}

impl Default for CacheKey {
    fn default() -> Self {
        CacheKey::Derived
    }
}

pub type CacheGetHook = Arc<dyn Fn(&FastStr) -> Result<Option<Value>> + Send + Sync>;
pub type CachePutHook = Arc<dyn Fn(&FastStr, &Value) -> Result<()> + Send + Sync>;

/// Per-call cache directives; hooks, when present, replace the pool cache
/// for this call (the way an application supplies its own cache source).
#[derive(Default)]
pub struct CacheControl {
    pub key: CacheKey,
    pub ttl: Option<Duration>,
    pub weight: Option<usize>,
    pub get_hook: Option<CacheGetHook>,
    pub put_hook: Option<CachePutHook>,
}

impl Clone for CacheControl {
    fn clone(&self) -> Self {
        CacheControl {
            key: match &self.key {
                CacheKey::Derived => CacheKey::Derived,
                CacheKey::Explicit(k) => CacheKey::Explicit(k.clone()),
                CacheKey::Disabled => CacheKey::Disabled,
            },
            ttl: self.ttl,
            weight: self.weight,
            get_hook: self.get_hook.clone(),
            put_hook: self.put_hook.clone(),
        }
    }
}

impl CacheControl {
    pub fn keyed(key: impl Into<FastStr>) -> Self {
        CacheControl {
            key: CacheKey::Explicit(key.into()),
            ..Default::default()
        }
    }

    pub fn disabled() -> Self {
        CacheControl {
            key: CacheKey::Disabled,
            ..Default::default()
        }
    }
}

struct CacheEntry {
    value: Value,
    expires: Instant,
    weight: usize,
}

struct CacheInner {
    entries: LinkedHashMap<FastStr, CacheEntry>,
    total_weight: usize,
    last_evict: Instant,
}

pub struct ResultCache {
    options: CacheOptions,
    inner: Mutex<CacheInner>,
}

impl ResultCache {
    pub fn new(options: CacheOptions) -> Self {
        ResultCache {
            options,
            inner: Mutex::new(CacheInner {
                entries: LinkedHashMap::new(),
                total_weight: 0,
                last_evict: Instant::now(),
            }),
        }
    }

    /// `None` on miss or expiry; a hit refreshes the entry's recency.
    pub fn get(&self, key: &FastStr) -> Option<Value> {
        let now = Instant::now();
        let mut inner = self.inner.lock();
        match inner.entries.get_refresh(key) {
            Some(entry) if entry.expires > now => Some(entry.value.clone()),
            Some(_) => {
                if let Some(stale) = inner.entries.remove(key) {
                    inner.total_weight -= stale.weight;
                }
                None
            }
            None => None,
        }
    }

    /// Inserts, replacing any older entry under the same key, and evicts
    /// least recently used entries until the bound holds again.
    pub fn put(&self, key: FastStr, value: Value, ttl: Option<Duration>, weight: Option<usize>) {
        let weight = match self.options.policy {
            CachePolicy::Lru => 1,
            CachePolicy::Weight => weight.unwrap_or(1).max(1),
        };
        if self.options.policy == CachePolicy::Weight && weight > self.options.size {
            tracing::warn!(
                "[AVIARY] cache entry weight {weight} exceeds cache size {}, not stored",
                self.options.size
            );
            return;
        }
        let expires = Instant::now() + ttl.unwrap_or(self.options.default_ttl);
        let mut inner = self.inner.lock();
        if let Some(old) = inner.entries.remove(&key) {
            inner.total_weight -= old.weight;
        }
        match self.options.policy {
            CachePolicy::Lru => {
                while inner.entries.len() >= self.options.size {
                    if let Some((_, old)) = inner.entries.pop_front() {
                        inner.total_weight -= old.weight;
                    }
                }
            }
            CachePolicy::Weight => {
                while inner.total_weight + weight > self.options.size {
                    match inner.entries.pop_front() {
                        Some((_, old)) => inner.total_weight -= old.weight,
                        None => break,
                    }
                }
            }
        }
        inner.total_weight += weight;
        inner.entries.insert(
            key,
            CacheEntry {
                value,
                expires,
                weight,
            },
        );
    }

    /// Opportunistic expiry scan, rate-limited by `evict_period`; invoked
    /// from the pool sweeper.
    pub fn maybe_evict(&self) {
        let now = Instant::now();
        let mut inner = self.inner.lock();
        if now.saturating_duration_since(inner.last_evict) < self.options.evict_period {
            return;
        }
        inner.last_evict = now;
        let stale: Vec<FastStr> = inner
            .entries
            .iter()
            .filter(|(_, entry)| entry.expires <= now)
            .map(|(key, _)| key.clone())
            .collect();
        for key in stale {
            if let Some(entry) = inner.entries.remove(&key) {
                inner.total_weight -= entry.weight;
            }
        }
    }

    pub fn len(&self) -> usize {
        self.inner.lock().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn options(&self) -> &CacheOptions {
        &self.options
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn cache(size: usize, policy: CachePolicy) -> ResultCache {
        ResultCache::new(CacheOptions {
            size,
            policy,
            default_ttl: Duration::from_secs(60),
            evict_period: Duration::from_secs(1),
        })
    }

    #[tokio::test(start_paused = true)]
    async fn lru_evicts_least_recently_used() {
        let cache = cache(2, CachePolicy::Lru);
        cache.put("a".into(), Value::Int(1), None, None);
        cache.put("b".into(), Value::Int(2), None, None);

        // touch "a" so "b" becomes the eviction candidate
        assert_eq!(cache.get(&"a".into()), Some(Value::Int(1)));
        cache.put("c".into(), Value::Int(3), None, None);

        assert_eq!(cache.get(&"a".into()), Some(Value::Int(1)));
        assert_eq!(cache.get(&"b".into()), None);
        assert_eq!(cache.get(&"c".into()), Some(Value::Int(3)));
    }

    #[tokio::test(start_paused = true)]
    async fn weight_policy_bounds_total_weight() {
        let cache = cache(10, CachePolicy::Weight);
        cache.put("a".into(), Value::Int(1), None, Some(6));
        cache.put("b".into(), Value::Int(2), None, Some(4));
        // inserting 5 must evict from the front until it fits
        cache.put("c".into(), Value::Int(3), None, Some(5));

        assert_eq!(cache.get(&"a".into()), None);
        assert_eq!(cache.get(&"b".into()), Some(Value::Int(2)));
        assert_eq!(cache.get(&"c".into()), Some(Value::Int(3)));
    }

    #[tokio::test(start_paused = true)]
    async fn oversized_weight_entry_is_not_stored() {
        let cache = cache(4, CachePolicy::Weight);
        cache.put("a".into(), Value::Int(1), None, Some(5));
        assert!(cache.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn entries_expire() {
        let cache = cache(4, CachePolicy::Lru);
        cache.put("a".into(), Value::Int(1), Some(Duration::from_secs(5)), None);
        assert_eq!(cache.get(&"a".into()), Some(Value::Int(1)));

        tokio::time::advance(Duration::from_secs(6)).await;
        assert_eq!(cache.get(&"a".into()), None);
    }

    #[tokio::test(start_paused = true)]
    async fn replacing_an_entry_updates_weight() {
        let cache = cache(10, CachePolicy::Weight);
        cache.put("a".into(), Value::Int(1), None, Some(8));
        cache.put("a".into(), Value::Int(2), None, Some(3));
        cache.put("b".into(), Value::Int(3), None, Some(7));
        assert_eq!(cache.get(&"a".into()), Some(Value::Int(2)));
        assert_eq!(cache.get(&"b".into()), Some(Value::Int(3)));
    }

    #[tokio::test(start_paused = true)]
    async fn sweep_removes_expired_entries() {
        let cache = cache(4, CachePolicy::Lru);
        cache.put("a".into(), Value::Int(1), Some(Duration::from_secs(1)), None);
        cache.put("b".into(), Value::Int(2), Some(Duration::from_secs(60)), None);

        tokio::time::advance(Duration::from_secs(2)).await;
        cache.maybe_evict();
        assert_eq!(cache.len(), 1);
    }
}
