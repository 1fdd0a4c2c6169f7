//! Single-flight LRU cache with per-entry TTL and tag invalidation.
//!
//! Used both for embedding vectors (keyed by normalized query text) and
//! for full query verdicts (keyed by tenant + persona + normalized text).
//! "Single-flight" means concurrent lookups of the same missing key share
//! one producer call instead of stampeding the backend: the first caller
//! computes, the rest await a watch channel.
//!
//! Invalidation is by tag. Every entry is inserted under a tag (the
//! tenant id for verdict entries), and re-ingesting a tenant's documents
//! drops that tenant's entries without touching anyone else's.

use std::collections::{HashMap, HashSet, VecDeque};
use std::future::Future;
use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::sync::{watch, Mutex};

enum Slot<V> {
    Ready {
        value: V,
        tag: String,
        inserted_at: Instant,
        ttl: Duration,
    },
    /// A producer is running; receivers resolve when it finishes.
    InFlight(watch::Receiver<Option<V>>),
}

struct Inner<V> {
    slots: HashMap<String, Slot<V>>,
    /// Keys in recency order, oldest first. Revisits push a duplicate;
    /// eviction and compaction skip entries whose key was since refreshed
    /// or removed. `touch` compacts once the queue
    /// outgrows twice the live set, so hot keys cannot grow it without
    /// bound.
    order: VecDeque<String>,
    capacity: usize,
}

impl<V: Clone> Inner<V> {
    fn touch(&mut self, key: &str) {
        self.order.push_back(key.to_string());
        if self.order.len() > 2 * self.capacity.max(self.slots.len()) {
            self.compact();
        }
    }

    /// Rebuild `order` keeping only the most recent touch per live key.
    fn compact(&mut self) {
        let mut seen: HashSet<String> = HashSet::with_capacity(self.slots.len());
        let mut kept: VecDeque<String> = VecDeque::with_capacity(self.slots.len());
        while let Some(key) = self.order.pop_back() {
            if self.slots.contains_key(&key) && seen.insert(key.clone()) {
                kept.push_front(key);
            }
        }
        self.order = kept;
    }

    fn evict_to_capacity(&mut self) {
        while self.ready_count() > self.capacity {
            let Some(old) = self.order.pop_front() else {
                break;
            };
            // Only evict if this queue entry is the latest touch and the
            // slot is a settled value. In-flight slots are never evicted.
            if self.order.iter().any(|k| k == &old) {
                continue;
            }
            if matches!(self.slots.get(&old), Some(Slot::Ready { .. })) {
                self.slots.remove(&old);
            }
        }
    }

    fn ready_count(&self) -> usize {
        self.slots
            .values()
            .filter(|s| matches!(s, Slot::Ready { .. }))
            .count()
    }
}

/// Shared, cloneable cache handle.
pub struct SingleFlightCache<V> {
    inner: Arc<Mutex<Inner<V>>>,
}

impl<V> Clone for SingleFlightCache<V> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<V: Clone + Send + 'static> SingleFlightCache<V> {
    pub fn new(capacity: usize) -> Self {
        Self {
            inner: Arc::new(Mutex::new(Inner {
                slots: HashMap::new(),
                order: VecDeque::new(),
                capacity: capacity.max(1),
            })),
        }
    }

    /// Look up `key`; on a miss run `producer` exactly once across all
    /// concurrent callers and cache its success under `tag` for `ttl`.
    ///
    /// Returns the value and whether it came from the cache. Producer
    /// errors are returned to every waiting caller and nothing is cached.
    pub async fn get_or_compute<F, Fut, E>(
        &self,
        key: &str,
        tag: &str,
        ttl: Duration,
        producer: F,
    ) -> Result<(V, bool), E>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<V, E>>,
    {
        let tx = loop {
            let mut rx = {
                let mut inner = self.inner.lock().await;
                match inner.slots.get(key) {
                    Some(Slot::Ready {
                        value,
                        inserted_at,
                        ttl,
                        ..
                    }) if inserted_at.elapsed() < *ttl => {
                        let value = value.clone();
                        inner.touch(key);
                        return Ok((value, true));
                    }
                    Some(Slot::Ready { .. }) => {
                        // Expired: fall through to claim the slot.
                        inner.slots.remove(key);
                        let (tx, rx) = watch::channel(None);
                        inner.slots.insert(key.to_string(), Slot::InFlight(rx));
                        break tx;
                    }
                    Some(Slot::InFlight(rx)) => rx.clone(),
                    None => {
                        let (tx, rx) = watch::channel(None);
                        inner.slots.insert(key.to_string(), Slot::InFlight(rx));
                        break tx;
                    }
                }
            };

            // Another caller owns the flight; wait for it to settle.
            if rx.changed().await.is_ok() {
                if let Some(value) = rx.borrow().clone() {
                    return Ok((value, true));
                }
            }
            // Producer failed or was dropped; retry and maybe become the
            // new owner.
        };

        match producer().await {
            Ok(value) => {
                let mut inner = self.inner.lock().await;
                inner.slots.insert(
                    key.to_string(),
                    Slot::Ready {
                        value: value.clone(),
                        tag: tag.to_string(),
                        inserted_at: Instant::now(),
                        ttl,
                    },
                );
                inner.touch(key);
                inner.evict_to_capacity();
                let _ = tx.send(Some(value.clone()));
                Ok((value, false))
            }
            Err(err) => {
                let mut inner = self.inner.lock().await;
                if matches!(inner.slots.get(key), Some(Slot::InFlight(_))) {
                    inner.slots.remove(key);
                }
                drop(inner);
                // Waiters see the sender drop and retry on their own.
                drop(tx);
                Err(err)
            }
        }
    }

    /// Drop one settled entry. Used for values that turn out to be
    /// uncacheable after the fact (escalation verdicts).
    pub async fn remove(&self, key: &str) {
        let mut inner = self.inner.lock().await;
        if matches!(inner.slots.get(key), Some(Slot::Ready { .. })) {
            inner.slots.remove(key);
        }
    }

    /// Drop every settled entry inserted under `tag`. In-flight slots are
    /// left alone; their producers started before the invalidation.
    pub async fn invalidate_tag(&self, tag: &str) {
        let mut inner = self.inner.lock().await;
        inner
            .slots
            .retain(|_, slot| !matches!(slot, Slot::Ready { tag: t, .. } if t == tag));
    }

    /// Number of settled entries, for the metrics endpoint.
    pub async fn len(&self) -> usize {
        self.inner.lock().await.ready_count()
    }
}
