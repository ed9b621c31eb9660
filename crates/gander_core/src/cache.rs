/*
 * SPDX-FileCopyrightText: 2026 Gander Project
 * SPDX-License-Identifier: AGPL-3.0-only
 */

use futures_util::future::BoxFuture;
use std::{
    collections::HashMap,
    hash::Hash,
    sync::Arc,
    time::{Duration, Instant},
};
use tokio::sync::Mutex;

type Filler<K, V> = Arc<dyn Fn(K) -> BoxFuture<'static, Option<V>> + Send + Sync>;

/// Read-through cache with per-key single flight. The filler for a key runs
/// at most once concurrently; readers for that key block on the one call.
/// A filler returning None means the result is not cached (and callers see
/// the miss). Optional TTL and LRU size limit; Clear/Flush invalidate.
pub struct Cache<K, V> {
    filler: Filler<K, V>,
    ttl: Option<Duration>,
    limit: Option<usize>,
    inner: Arc<Mutex<Inner<K, V>>>,
}

impl<K, V> Clone for Cache<K, V> {
    fn clone(&self) -> Self {
        Self {
            filler: self.filler.clone(),
            ttl: self.ttl,
            limit: self.limit,
            inner: self.inner.clone(),
        }
    }
}

struct Inner<K, V> {
    entries: HashMap<K, Arc<Mutex<Slot<V>>>>,
    // Front is least recently used.
    order: Vec<K>,
}

struct Slot<V> {
    value: Option<V>,
    filled_at: Option<Instant>,
}

pub struct CacheOptions {
    pub ttl: Option<Duration>,
    pub limit: Option<usize>,
}

impl Default for CacheOptions {
    fn default() -> Self {
        Self {
            ttl: None,
            limit: None,
        }
    }
}

impl<K, V> Cache<K, V>
where
    K: Clone + Eq + Hash + Send + 'static,
    V: Clone + Send + 'static,
{
    pub fn new<F>(opts: CacheOptions, filler: F) -> Self
    where
        F: Fn(K) -> BoxFuture<'static, Option<V>> + Send + Sync + 'static,
    {
        Self {
            filler: Arc::new(filler),
            ttl: opts.ttl,
            limit: opts.limit,
            inner: Arc::new(Mutex::new(Inner {
                entries: HashMap::new(),
                order: Vec::new(),
            })),
        }
    }

    pub async fn get(&self, key: K) -> Option<V> {
        let slot = {
            let mut inner = self.inner.lock().await;
            let slot = inner
                .entries
                .entry(key.clone())
                .or_insert_with(|| {
                    Arc::new(Mutex::new(Slot {
                        value: None,
                        filled_at: None,
                    }))
                })
                .clone();
            inner.order.retain(|k| k != &key);
            inner.order.push(key.clone());
            if let Some(limit) = self.limit {
                while inner.order.len() > limit {
                    let evicted = inner.order.remove(0);
                    inner.entries.remove(&evicted);
                }
            }
            slot
        };

        let mut slot = slot.lock().await;
        if let (Some(v), Some(at)) = (&slot.value, slot.filled_at) {
            let fresh = match self.ttl {
                Some(ttl) => at.elapsed() < ttl,
                None => true,
            };
            if fresh {
                return Some(v.clone());
            }
        }

        let filled = (self.filler)(key).await;
        match filled {
            Some(v) => {
                slot.value = Some(v.clone());
                slot.filled_at = Some(Instant::now());
                Some(v)
            }
            None => {
                slot.value = None;
                slot.filled_at = None;
                None
            }
        }
    }

    pub async fn clear(&self, key: &K) {
        let mut inner = self.inner.lock().await;
        inner.entries.remove(key);
        inner.order.retain(|k| k != key);
    }

    pub async fn flush(&self) {
        let mut inner = self.inner.lock().await;
        inner.entries.clear();
        inner.order.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn counting_cache(
        opts: CacheOptions,
        calls: Arc<AtomicUsize>,
    ) -> Cache<String, String> {
        Cache::new(opts, move |k: String| {
            let calls = calls.clone();
            Box::pin(async move {
                calls.fetch_add(1, Ordering::SeqCst);
                tokio::time::sleep(Duration::from_millis(10)).await;
                Some(format!("value-of-{k}"))
            })
        })
    }

    #[tokio::test]
    async fn filler_runs_once_for_concurrent_readers() {
        let calls = Arc::new(AtomicUsize::new(0));
        let cache = counting_cache(CacheOptions::default(), calls.clone());
        let mut handles = Vec::new();
        for _ in 0..8 {
            let cache = cache.clone();
            handles.push(tokio::spawn(async move { cache.get("k".to_string()).await }));
        }
        for h in handles {
            assert_eq!(h.await.unwrap().unwrap(), "value-of-k");
        }
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn ttl_expires_entries() {
        let calls = Arc::new(AtomicUsize::new(0));
        let cache = counting_cache(
            CacheOptions {
                ttl: Some(Duration::from_millis(30)),
                limit: None,
            },
            calls.clone(),
        );
        cache.get("k".to_string()).await;
        cache.get("k".to_string()).await;
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        tokio::time::sleep(Duration::from_millis(50)).await;
        cache.get("k".to_string()).await;
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn size_limit_evicts_least_recently_used() {
        let calls = Arc::new(AtomicUsize::new(0));
        let cache = counting_cache(
            CacheOptions {
                ttl: None,
                limit: Some(2),
            },
            calls.clone(),
        );
        cache.get("a".to_string()).await;
        cache.get("b".to_string()).await;
        cache.get("c".to_string()).await; // evicts a
        assert_eq!(calls.load(Ordering::SeqCst), 3);
        cache.get("b".to_string()).await; // still cached
        assert_eq!(calls.load(Ordering::SeqCst), 3);
        cache.get("a".to_string()).await; // refilled
        assert_eq!(calls.load(Ordering::SeqCst), 4);
    }

    #[tokio::test]
    async fn clear_forces_refill_and_none_is_not_cached() {
        let calls = Arc::new(AtomicUsize::new(0));
        let inner_calls = calls.clone();
        let cache: Cache<String, String> =
            Cache::new(CacheOptions::default(), move |k: String| {
                let calls = inner_calls.clone();
                Box::pin(async move {
                    let n = calls.fetch_add(1, Ordering::SeqCst);
                    if k == "missing" {
                        None
                    } else {
                        Some(format!("{k}-{n}"))
                    }
                })
            });
        assert_eq!(cache.get("k".to_string()).await.unwrap(), "k-0");
        cache.clear(&"k".to_string()).await;
        assert_eq!(cache.get("k".to_string()).await.unwrap(), "k-1");

        assert!(cache.get("missing".to_string()).await.is_none());
        assert!(cache.get("missing".to_string()).await.is_none());
        assert_eq!(calls.load(Ordering::SeqCst), 4);
    }
}
