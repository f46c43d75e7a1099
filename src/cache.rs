// =============================================================================
// Market Cache — TTL'd key/value store with single-flight fetch coalescing
// =============================================================================
//
// Keys are structured (`DataKey`); values are `MarketPayload`.  Expired
// entries are treated as absent for `get`, but retained so degraded reads can
// fall back to the last known value when upstream is struggling.
//
// Single-flight: when multiple callers race on a missing key, exactly one
// runs the fetcher; the rest subscribe to a watch channel and receive the
// same result, errors included.  A failed or cancelled fetch never poisons
// the key — the previous stale entry (if any) is restored and the next
// caller retries.
//
// Locking: one parking_lot mutex over the slot map, never held across await.
// Timing uses tokio's clock so tests can pause and advance time.
// =============================================================================

use std::collections::HashMap;
use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use parking_lot::Mutex;
use serde::Serialize;
use tokio::sync::watch;
use tokio::time::Instant;
use tracing::{debug, warn};

use crate::config::CacheTtls;
use crate::market::error::MarketError;
use crate::market::types::{DataKey, DataKind, MarketPayload};

type FetchResult = Result<MarketPayload, MarketError>;

// ---------------------------------------------------------------------------
// Slots
// ---------------------------------------------------------------------------

#[derive(Clone)]
struct Entry {
    payload: MarketPayload,
    fetched_at: Instant,
    ttl: Duration,
}

impl Entry {
    fn is_fresh(&self, now: Instant) -> bool {
        now.saturating_duration_since(self.fetched_at) < self.ttl
    }
}

/// Outcome of deciding what a caller should do for a key, computed while
/// holding the slot-map lock so the lock is never held across an await.
enum Role {
    Hit(MarketPayload),
    Follower(watch::Receiver<Option<FetchResult>>),
    Primary(watch::Sender<Option<FetchResult>>),
}

enum Slot {
    Ready(Entry),
    /// A fetch is in flight.  `stale` preserves the expired entry that the
    /// fetch is replacing, for restoration on failure.
    Pending {
        rx: watch::Receiver<Option<FetchResult>>,
        stale: Option<Entry>,
    },
}

// ---------------------------------------------------------------------------
// MarketCache
// ---------------------------------------------------------------------------

/// Shared in-process cache for the data plane.
pub struct MarketCache {
    slots: Mutex<HashMap<DataKey, Slot>>,
    ttls: CacheTtls,
    hits: AtomicU64,
    misses: AtomicU64,
    coalesced: AtomicU64,
    fetch_failures: AtomicU64,
}

/// Serialisable snapshot of cache counters for the stats endpoint.
#[derive(Debug, Clone, Serialize)]
pub struct CacheSnapshot {
    pub entries: usize,
    pub in_flight: usize,
    pub hits: u64,
    pub misses: u64,
    pub coalesced: u64,
    pub fetch_failures: u64,
}

impl MarketCache {
    pub fn new(ttls: CacheTtls) -> Self {
        Self {
            slots: Mutex::new(HashMap::new()),
            ttls,
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
            coalesced: AtomicU64::new(0),
            fetch_failures: AtomicU64::new(0),
        }
    }

    /// TTL for a data kind, from configuration.
    pub fn ttl_for(&self, kind: DataKind) -> Duration {
        let ms = match kind {
            DataKind::Ticker => self.ttls.ticker_ms,
            DataKind::Candles => self.ttls.candles_ms,
            DataKind::Accounts => self.ttls.accounts_ms,
            DataKind::Balance => self.ttls.balance_ms,
        };
        Duration::from_millis(ms)
    }

    // -------------------------------------------------------------------------
    // Plain reads / writes
    // -------------------------------------------------------------------------

    /// Fresh value or miss.  Expired entries are misses.
    pub fn get(&self, key: &DataKey) -> Option<MarketPayload> {
        let slots = self.slots.lock();
        match slots.get(key) {
            Some(Slot::Ready(entry)) if entry.is_fresh(Instant::now()) => {
                self.hits.fetch_add(1, Ordering::Relaxed);
                Some(entry.payload.clone())
            }
            _ => {
                self.misses.fetch_add(1, Ordering::Relaxed);
                None
            }
        }
    }

    /// Last known value regardless of freshness, with its age.  Used for
    /// degraded reads when upstream is unavailable.
    pub fn get_stale(&self, key: &DataKey) -> Option<(MarketPayload, Duration)> {
        let slots = self.slots.lock();
        let entry = match slots.get(key)? {
            Slot::Ready(entry) => entry,
            Slot::Pending { stale, .. } => stale.as_ref()?,
        };
        let age = Instant::now().saturating_duration_since(entry.fetched_at);
        Some((entry.payload.clone(), age))
    }

    /// Store a value with an explicit TTL.
    pub fn set(&self, key: DataKey, payload: MarketPayload, ttl: Duration) {
        let mut slots = self.slots.lock();
        slots.insert(
            key,
            Slot::Ready(Entry {
                payload,
                fetched_at: Instant::now(),
                ttl,
            }),
        );
    }

    /// Drop every ready entry whose canonical key form starts with `prefix`.
    /// In-flight fetches are left alone; they re-insert on completion.
    pub fn invalidate_prefix(&self, prefix: &str) {
        let mut slots = self.slots.lock();
        let before = slots.len();
        slots.retain(|key, slot| {
            !(matches!(slot, Slot::Ready(_)) && key.to_string().starts_with(prefix))
        });
        debug!(prefix, removed = before - slots.len(), "cache invalidated");
    }

    // -------------------------------------------------------------------------
    // Single-flight fetch
    // -------------------------------------------------------------------------

    /// Return the fresh cached value, or fetch it exactly once across all
    /// concurrent callers.
    ///
    /// Followers suspend until the primary's result arrives and then share
    /// it, including an error result.  The error is not cached: the next
    /// caller after a failure starts a new fetch.
    pub async fn get_or_fetch<F, Fut>(&self, key: DataKey, fetcher: F) -> FetchResult
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = FetchResult>,
    {
        let ttl = self.ttl_for(key.kind());

        match self.claim_role(&key) {
            Role::Hit(payload) => Ok(payload),
            Role::Follower(mut rx) => {
                self.coalesced.fetch_add(1, Ordering::Relaxed);

                // Follower path: wait for the primary's result.
                loop {
                    if let Some(result) = rx.borrow().clone() {
                        return result;
                    }
                    if rx.changed().await.is_err() {
                        // Primary vanished without publishing a result.
                        warn!(key = %key, "fetch primary dropped without result");
                        return Err(MarketError::Transient("coalesced fetch cancelled".into()));
                    }
                }
            }
            Role::Primary(tx) => {
                self.misses.fetch_add(1, Ordering::Relaxed);
                self.run_primary(key, ttl, tx, fetcher()).await
            }
        }
    }

    /// Decide our role for `key` under the lock: hit, follower, or primary.
    /// Claiming the primary role atomically inserts the pending slot so the
    /// lock never needs to be held across an await point.
    fn claim_role(&self, key: &DataKey) -> Role {
        let mut slots = self.slots.lock();

        if let Some(Slot::Ready(entry)) = slots.get(key) {
            if entry.is_fresh(Instant::now()) {
                let payload = entry.payload.clone();
                self.hits.fetch_add(1, Ordering::Relaxed);
                return Role::Hit(payload);
            }
        }

        if let Some(Slot::Pending { rx, .. }) = slots.get(key) {
            return Role::Follower(rx.clone());
        }

        let stale = match slots.remove(key) {
            Some(Slot::Ready(entry)) => Some(entry),
            _ => None,
        };
        let (tx, rx) = watch::channel(None);
        slots.insert(key.clone(), Slot::Pending { rx, stale });
        Role::Primary(tx)
    }

    /// Run the fetcher as the single primary for `key`.
    async fn run_primary<Fut>(
        &self,
        key: DataKey,
        ttl: Duration,
        tx: watch::Sender<Option<FetchResult>>,
        fut: Fut,
    ) -> FetchResult
    where
        Fut: Future<Output = FetchResult>,
    {
        // Completion guard: if the primary is cancelled mid-fetch (tick
        // deadline), restore the stale entry and release the followers.
        let mut guard = PrimaryGuard {
            cache: self,
            key: key.clone(),
            tx: Some(tx),
            completed: false,
        };

        let result = fut.await;
        guard.completed = true;
        let tx = guard.tx.take().expect("guard owns the sender until completion");

        {
            let mut slots = self.slots.lock();
            match &result {
                Ok(payload) => {
                    slots.insert(
                        key.clone(),
                        Slot::Ready(Entry {
                            payload: payload.clone(),
                            fetched_at: Instant::now(),
                            ttl,
                        }),
                    );
                }
                Err(err) => {
                    self.fetch_failures.fetch_add(1, Ordering::Relaxed);
                    warn!(key = %key, error = %err, "fetch failed — key not poisoned");
                    // Restore the pre-fetch stale entry, if one existed.
                    match slots.remove(&key) {
                        Some(Slot::Pending {
                            stale: Some(entry), ..
                        }) => {
                            slots.insert(key.clone(), Slot::Ready(entry));
                        }
                        _ => {}
                    }
                }
            }
        }

        let _ = tx.send(Some(result.clone()));
        result
    }

    // -------------------------------------------------------------------------
    // Snapshot
    // -------------------------------------------------------------------------

    pub fn snapshot(&self) -> CacheSnapshot {
        let slots = self.slots.lock();
        let in_flight = slots
            .values()
            .filter(|s| matches!(s, Slot::Pending { .. }))
            .count();
        CacheSnapshot {
            entries: slots.len() - in_flight,
            in_flight,
            hits: self.hits.load(Ordering::Relaxed),
            misses: self.misses.load(Ordering::Relaxed),
            coalesced: self.coalesced.load(Ordering::Relaxed),
            fetch_failures: self.fetch_failures.load(Ordering::Relaxed),
        }
    }
}

impl std::fmt::Debug for MarketCache {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let snap = self.snapshot();
        f.debug_struct("MarketCache")
            .field("entries", &snap.entries)
            .field("in_flight", &snap.in_flight)
            .field("hits", &snap.hits)
            .field("misses", &snap.misses)
            .finish()
    }
}

/// Restores the slot map if the primary fetch future is dropped before
/// completing (deadline cancellation).
struct PrimaryGuard<'a> {
    cache: &'a MarketCache,
    key: DataKey,
    tx: Option<watch::Sender<Option<FetchResult>>>,
    completed: bool,
}

impl Drop for PrimaryGuard<'_> {
    fn drop(&mut self) {
        if self.completed {
            return;
        }
        let mut slots = self.cache.slots.lock();
        match slots.remove(&self.key) {
            Some(Slot::Pending {
                stale: Some(entry), ..
            }) => {
                slots.insert(self.key.clone(), Slot::Ready(entry));
            }
            _ => {}
        }
        drop(slots);
        if let Some(tx) = self.tx.take() {
            let _ = tx.send(Some(Err(MarketError::Transient(
                "fetch cancelled before completion".into(),
            ))));
        }
    }
}

// =============================================================================
// Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;
    use crate::market::types::Ticker;
    use std::sync::atomic::AtomicU32;
    use std::sync::Arc;

    fn ticker_key() -> DataKey {
        DataKey::Ticker {
            pair: "BTC-USD".into(),
        }
    }

    fn ticker_payload(price: f64) -> MarketPayload {
        MarketPayload::Ticker(Ticker {
            pair: "BTC-USD".into(),
            price,
            volume_24h: 0.0,
            ts: 0,
        })
    }

    fn cache() -> MarketCache {
        MarketCache::new(CacheTtls::default())
    }

    #[tokio::test(start_paused = true)]
    async fn set_then_get_until_expiry() {
        let cache = cache();
        cache.set(ticker_key(), ticker_payload(100.0), Duration::from_secs(30));

        assert!(cache.get(&ticker_key()).is_some());

        tokio::time::advance(Duration::from_secs(31)).await;
        assert!(cache.get(&ticker_key()).is_none());

        // Expired entries survive as stale data.
        let (stale, age) = cache.get_stale(&ticker_key()).unwrap();
        assert!(stale.as_ticker().is_some());
        assert!(age >= Duration::from_secs(31));
    }

    #[tokio::test(start_paused = true)]
    async fn concurrent_callers_share_one_fetch() {
        let cache = Arc::new(cache());
        let fetches = Arc::new(AtomicU32::new(0));

        let mut handles = Vec::new();
        for _ in 0..10 {
            let cache = cache.clone();
            let fetches = fetches.clone();
            handles.push(tokio::spawn(async move {
                cache
                    .get_or_fetch(ticker_key(), move || async move {
                        fetches.fetch_add(1, Ordering::Relaxed);
                        tokio::time::sleep(Duration::from_millis(100)).await;
                        Ok(ticker_payload(123.0))
                    })
                    .await
            }));
        }

        for h in handles {
            let result = h.await.unwrap().unwrap();
            assert!((result.as_ticker().unwrap().price - 123.0).abs() < f64::EPSILON);
        }
        assert_eq!(fetches.load(Ordering::Relaxed), 1);
        assert_eq!(cache.snapshot().coalesced, 9);
    }

    #[tokio::test(start_paused = true)]
    async fn failed_fetch_does_not_poison_the_key() {
        let cache = cache();

        let result = cache
            .get_or_fetch(ticker_key(), || async {
                Err(MarketError::Transient("boom".into()))
            })
            .await;
        assert!(result.is_err());

        // Next caller runs a fresh fetcher and succeeds.
        let result = cache
            .get_or_fetch(ticker_key(), || async { Ok(ticker_payload(50.0)) })
            .await;
        assert!(result.is_ok());
        assert!(cache.get(&ticker_key()).is_some());
    }

    #[tokio::test(start_paused = true)]
    async fn failure_restores_previous_stale_entry() {
        let cache = cache();
        cache.set(ticker_key(), ticker_payload(75.0), Duration::from_millis(10));
        tokio::time::advance(Duration::from_millis(20)).await;

        let result = cache
            .get_or_fetch(ticker_key(), || async {
                Err(MarketError::Transient("down".into()))
            })
            .await;
        assert!(result.is_err());

        // The expired value is still available for degraded reads.
        let (stale, _) = cache.get_stale(&ticker_key()).unwrap();
        assert!((stale.as_ticker().unwrap().price - 75.0).abs() < f64::EPSILON);
    }

    #[tokio::test(start_paused = true)]
    async fn cancelled_primary_releases_the_key() {
        let cache = Arc::new(cache());

        let c = cache.clone();
        let doomed = tokio::spawn(async move {
            c.get_or_fetch(ticker_key(), || async {
                tokio::time::sleep(Duration::from_secs(3600)).await;
                Ok(ticker_payload(0.0))
            })
            .await
        });

        tokio::time::sleep(Duration::from_millis(10)).await;
        doomed.abort();
        let _ = doomed.await;

        // The key is free again: a new fetch runs and completes.
        let result = cache
            .get_or_fetch(ticker_key(), || async { Ok(ticker_payload(99.0)) })
            .await;
        assert!(result.is_ok());
    }

    #[tokio::test(start_paused = true)]
    async fn invalidate_prefix_drops_matching_ready_entries() {
        let cache = cache();
        cache.set(ticker_key(), ticker_payload(1.0), Duration::from_secs(60));
        cache.set(
            DataKey::Ticker {
                pair: "ETH-USD".into(),
            },
            ticker_payload(2.0),
            Duration::from_secs(60),
        );
        cache.set(
            DataKey::Accounts,
            MarketPayload::Accounts(Vec::new()),
            Duration::from_secs(60),
        );

        cache.invalidate_prefix("ticker:");
        assert!(cache.get(&ticker_key()).is_none());
        assert!(cache.get(&DataKey::Accounts).is_some());
    }

    #[tokio::test(start_paused = true)]
    async fn fresh_hit_skips_the_fetcher() {
        let cache = cache();
        cache.set(ticker_key(), ticker_payload(10.0), Duration::from_secs(60));

        let result = cache
            .get_or_fetch(ticker_key(), || async {
                panic!("fetcher must not run on a fresh hit")
            })
            .await
            .unwrap();
        assert!((result.as_ticker().unwrap().price - 10.0).abs() < f64::EPSILON);
    }
}
