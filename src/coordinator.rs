// =============================================================================
// Data Coordinator — the only caller of the exchange client
// =============================================================================
//
// Every market-data need in the engine funnels through `request`/`batch`:
// cache-first, then a single-flight fetch through the rate gate.  Outcomes
// are classified so callers never see raw transport errors:
//
//   fresh hit            -> Fresh
//   fetched ok           -> Fresh (and cached with the kind's TTL)
//   transient/ratelimit  -> bounded retries, then stale fallback or Degraded
//   deadline exceeded    -> StaleData, in-flight work cancelled
//   fatal                -> Fatal
//
// The cache owns single-flight; the coordinator holds no per-key lock.
// =============================================================================

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use thiserror::Error;
use tokio::time::Instant;
use tracing::{debug, warn};

use crate::cache::MarketCache;
use crate::gate::{Priority, RateGate};
use crate::market::client::MarketClient;
use crate::market::error::MarketError;
use crate::market::types::{DataKey, MarketPayload};

/// Upstream attempts per request before the outcome degrades.
const FETCH_ATTEMPTS: u32 = 3;

// ---------------------------------------------------------------------------
// Outcomes
// ---------------------------------------------------------------------------

/// Data handed back to an evaluator, with its provenance.
#[derive(Debug, Clone)]
pub enum DataOutcome {
    /// Within TTL — either a cache hit or just fetched.
    Fresh(MarketPayload),
    /// Upstream was unavailable; this is the last known value.
    Stale {
        payload: MarketPayload,
        age: Duration,
    },
}

impl DataOutcome {
    pub fn into_payload(self) -> MarketPayload {
        match self {
            Self::Fresh(p) => p,
            Self::Stale { payload, .. } => payload,
        }
    }
}

/// Why a key could not be served.
#[derive(Debug, Clone, Error)]
pub enum DataError {
    /// Upstream kept failing and no stale value exists.
    #[error("degraded upstream data: {0}")]
    Degraded(String),

    /// The caller's deadline elapsed before data arrived.
    #[error("data unavailable before deadline")]
    StaleData,

    /// Retrying will not help (auth, bad request, parse).
    #[error("fatal upstream error: {0}")]
    Fatal(String),
}

// ---------------------------------------------------------------------------
// DataCoordinator
// ---------------------------------------------------------------------------

/// Shared front door for market data.
pub struct DataCoordinator {
    client: Arc<dyn MarketClient>,
    gate: Arc<RateGate>,
    cache: Arc<MarketCache>,
    requests: AtomicU64,
    degraded_served: AtomicU64,
}

/// Serialisable counters for the stats endpoint.
#[derive(Debug, Clone, Serialize)]
pub struct CoordinatorSnapshot {
    pub requests: u64,
    pub degraded_served: u64,
}

impl DataCoordinator {
    pub fn new(client: Arc<dyn MarketClient>, gate: Arc<RateGate>, cache: Arc<MarketCache>) -> Self {
        Self {
            client,
            gate,
            cache,
            requests: AtomicU64::new(0),
            degraded_served: AtomicU64::new(0),
        }
    }

    pub fn gate(&self) -> &Arc<RateGate> {
        &self.gate
    }

    pub fn cache(&self) -> &Arc<MarketCache> {
        &self.cache
    }

    // -------------------------------------------------------------------------
    // Single request
    // -------------------------------------------------------------------------

    /// Resolve one key: cache-first, single-flight fetch on miss, degraded
    /// fallback on upstream trouble, `StaleData` past the deadline.
    pub async fn request(
        &self,
        key: DataKey,
        priority: Priority,
        deadline: Instant,
    ) -> Result<DataOutcome, DataError> {
        self.requests.fetch_add(1, Ordering::Relaxed);

        if let Some(payload) = self.cache.get(&key) {
            return Ok(DataOutcome::Fresh(payload));
        }

        let fetch = self
            .cache
            .get_or_fetch(key.clone(), || self.fetch_through_gate(key.clone(), priority));

        match tokio::time::timeout_at(deadline, fetch).await {
            Err(_) => {
                debug!(key = %key, "deadline elapsed — request cancelled");
                Err(DataError::StaleData)
            }
            Ok(Ok(payload)) => Ok(DataOutcome::Fresh(payload)),
            Ok(Err(MarketError::Fatal(msg))) => Err(DataError::Fatal(msg)),
            Ok(Err(err)) => {
                // Transient or rate-limited after all retries: serve the last
                // known value when one exists.
                if let Some((payload, age)) = self.cache.get_stale(&key) {
                    self.degraded_served.fetch_add(1, Ordering::Relaxed);
                    warn!(
                        key = %key,
                        age_ms = age.as_millis() as u64,
                        error = %err,
                        "serving stale value while upstream is degraded"
                    );
                    Ok(DataOutcome::Stale { payload, age })
                } else {
                    Err(DataError::Degraded(err.to_string()))
                }
            }
        }
    }

    // -------------------------------------------------------------------------
    // Batch
    // -------------------------------------------------------------------------

    /// Resolve many distinct keys concurrently, preserving single-flight per
    /// key.  This is the entry point the scheduler uses once per tick.
    pub async fn batch(
        &self,
        keys: Vec<DataKey>,
        priority: Priority,
        deadline: Instant,
    ) -> HashMap<DataKey, Result<DataOutcome, DataError>> {
        let futures = keys.into_iter().map(|key| async move {
            let result = self.request(key.clone(), priority, deadline).await;
            (key, result)
        });

        futures_util::future::join_all(futures).await.into_iter().collect()
    }

    // -------------------------------------------------------------------------
    // Upstream fetch (runs as the cache's single-flight primary)
    // -------------------------------------------------------------------------

    /// Acquire a gate token, call upstream, classify.  Transient and
    /// rate-limited responses are retried up to [`FETCH_ATTEMPTS`] times; the
    /// gate's backoff paces the retries.
    async fn fetch_through_gate(
        &self,
        key: DataKey,
        priority: Priority,
    ) -> Result<MarketPayload, MarketError> {
        let mut last_err: Option<MarketError> = None;

        for attempt in 1..=FETCH_ATTEMPTS {
            self.gate.acquire(priority).await;

            match self.call_upstream(&key).await {
                Ok(payload) => {
                    self.gate.on_success();
                    return Ok(payload);
                }
                Err(err) if err.is_rate_limited() => {
                    self.gate.on_rate_limited();
                    debug!(key = %key, attempt, "rate limited — retrying through backoff");
                    last_err = Some(err);
                }
                Err(err) if err.is_transient() => {
                    debug!(key = %key, attempt, error = %err, "transient failure — retrying");
                    last_err = Some(err);
                }
                Err(err) => return Err(err),
            }
        }

        Err(last_err.unwrap_or_else(|| MarketError::Transient("no attempt made".into())))
    }

    /// Map a key onto the corresponding client call.
    async fn call_upstream(&self, key: &DataKey) -> Result<MarketPayload, MarketError> {
        match key {
            DataKey::Ticker { pair } => self
                .client
                .get_ticker(pair)
                .await
                .map(MarketPayload::Ticker),
            DataKey::Candles {
                pair,
                granularity_sec,
                limit,
            } => self
                .client
                .get_candles(pair, *granularity_sec, *limit)
                .await
                .map(MarketPayload::Candles),
            DataKey::Accounts => self
                .client
                .get_accounts()
                .await
                .map(MarketPayload::Accounts),
            DataKey::Balance { currency } => self
                .client
                .get_balance(currency)
                .await
                .map(MarketPayload::Balance),
        }
    }

    // -------------------------------------------------------------------------
    // Snapshot
    // -------------------------------------------------------------------------

    pub fn snapshot(&self) -> CoordinatorSnapshot {
        CoordinatorSnapshot {
            requests: self.requests.load(Ordering::Relaxed),
            degraded_served: self.degraded_served.load(Ordering::Relaxed),
        }
    }
}

impl std::fmt::Debug for DataCoordinator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DataCoordinator")
            .field("requests", &self.requests.load(Ordering::Relaxed))
            .field("degraded_served", &self.degraded_served.load(Ordering::Relaxed))
            .finish()
    }
}
