// =============================================================================
// Rate Gate — global token bucket for all upstream calls
// =============================================================================
//
// Every upstream request, regardless of which bot triggered it, acquires one
// token here first.  The bucket holds at most `burst` tokens and refills at
// `rate` tokens per minute, so aggregate upstream volume stays under the
// budget no matter how many evaluators fan in.
//
// Waiters are granted in priority order (TRADING first), FIFO within a
// priority.  On an observed upstream rate-limit response the gate enters
// exponential backoff: the inter-token interval doubles up to a 60 s ceiling
// and the bucket drains; each successful call halves the interval back toward
// the base rate.
//
// Timing uses tokio's clock so tests can pause and advance time.
// =============================================================================

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use parking_lot::Mutex;
use serde::Serialize;
use tokio::sync::Notify;
use tokio::time::Instant;
use tracing::{debug, warn};

/// Backoff ceiling for the inter-token interval.
const MAX_BACKOFF_INTERVAL: Duration = Duration::from_secs(60);

// ---------------------------------------------------------------------------
// Priority
// ---------------------------------------------------------------------------

/// Who is asking for a token.  Higher priorities preempt lower ones; ties are
/// broken by arrival order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Priority {
    Background,
    MarketData,
    BotEvaluation,
    Trading,
}

// ---------------------------------------------------------------------------
// Internal state
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy)]
struct Waiter {
    priority: Priority,
    seq: u64,
}

struct GateState {
    tokens: f64,
    burst: f64,
    /// Interval between refilled tokens at the base rate.
    base_interval: Duration,
    /// Current interval — equals `base_interval` unless backing off.
    interval: Duration,
    last_refill: Instant,
    queue: Vec<Waiter>,
    next_seq: u64,
}

impl GateState {
    /// Credit tokens for the time elapsed since the last refill.
    fn refill(&mut self, now: Instant) {
        let per_token = self.interval.as_secs_f64();
        if per_token <= 0.0 {
            self.tokens = self.burst;
            self.last_refill = now;
            return;
        }

        let elapsed = now.saturating_duration_since(self.last_refill);
        let add = elapsed.as_secs_f64() / per_token;
        if add > 0.0 {
            self.tokens = (self.tokens + add).min(self.burst);
            self.last_refill = now;
        }
    }

    /// True when `seq` is the frontmost waiter: no other entry has a higher
    /// priority, and none shares the priority with an earlier arrival.
    fn is_next(&self, seq: u64) -> bool {
        let Some(me) = self.queue.iter().find(|w| w.seq == seq) else {
            return false;
        };
        !self.queue.iter().any(|w| {
            w.seq != seq
                && (w.priority > me.priority || (w.priority == me.priority && w.seq < me.seq))
        })
    }

    fn remove(&mut self, seq: u64) {
        self.queue.retain(|w| w.seq != seq);
    }

    /// How long until one whole token is available.
    fn time_to_token(&self) -> Duration {
        if self.tokens >= 1.0 {
            // A token exists but someone ahead of us holds the front; wake on
            // notify, with a short fallback poll.
            return Duration::from_millis(50);
        }
        let needed = 1.0 - self.tokens;
        self.interval.mul_f64(needed)
    }
}

// ---------------------------------------------------------------------------
// RateGate
// ---------------------------------------------------------------------------

/// Global serialization point for upstream calls.
pub struct RateGate {
    state: Mutex<GateState>,
    notify: Notify,
    served: AtomicU64,
    rate_limited_seen: AtomicU64,
}

/// Serialisable snapshot of the gate for the stats endpoint.
#[derive(Debug, Clone, Serialize)]
pub struct GateSnapshot {
    pub calls_served: u64,
    pub rate_limited_responses: u64,
    pub tokens_available: f64,
    pub queue_depth: usize,
    pub base_interval_ms: u64,
    pub current_interval_ms: u64,
    pub backing_off: bool,
}

impl RateGate {
    /// Create a gate allowing `rate_per_minute` calls per minute with the
    /// given burst capacity.
    pub fn new(rate_per_minute: u32, burst: u32) -> Self {
        let rate = rate_per_minute.max(1);
        let base_interval = Duration::from_secs_f64(60.0 / rate as f64);

        debug!(
            rate_per_minute = rate,
            burst,
            base_interval_ms = base_interval.as_millis() as u64,
            "RateGate initialised"
        );

        Self {
            state: Mutex::new(GateState {
                tokens: burst.max(1) as f64,
                burst: burst.max(1) as f64,
                base_interval,
                interval: base_interval,
                last_refill: Instant::now(),
                queue: Vec::new(),
                next_seq: 0,
            }),
            notify: Notify::new(),
            served: AtomicU64::new(0),
            rate_limited_seen: AtomicU64::new(0),
        }
    }

    // -------------------------------------------------------------------------
    // Acquire
    // -------------------------------------------------------------------------

    /// Wait until the caller is granted a token.
    ///
    /// Suspension point: callers block here, nowhere else in the data plane.
    /// Cancel-safe — a dropped waiter leaves the queue and wakes the rest.
    pub async fn acquire(&self, priority: Priority) {
        let seq = {
            let mut s = self.state.lock();
            let seq = s.next_seq;
            s.next_seq += 1;
            s.queue.push(Waiter { priority, seq });
            seq
        };

        let mut ticket = Ticket {
            gate: self,
            seq,
            granted: false,
        };

        loop {
            let wait = {
                let mut s = self.state.lock();
                s.refill(Instant::now());

                if s.tokens >= 1.0 && s.is_next(seq) {
                    s.tokens -= 1.0;
                    s.remove(seq);
                    None
                } else {
                    Some(s.time_to_token())
                }
            };

            match wait {
                None => {
                    ticket.granted = true;
                    self.served.fetch_add(1, Ordering::Relaxed);
                    // Wake the next waiter in case more tokens are available.
                    self.notify.notify_waiters();
                    return;
                }
                Some(d) => {
                    tokio::select! {
                        _ = self.notify.notified() => {}
                        _ = tokio::time::sleep(d) => {}
                    }
                }
            }
        }
    }

    // -------------------------------------------------------------------------
    // Backoff feedback
    // -------------------------------------------------------------------------

    /// Record an upstream rate-limit response: double the inter-token interval
    /// (up to the ceiling) and drain the bucket.
    pub fn on_rate_limited(&self) {
        self.rate_limited_seen.fetch_add(1, Ordering::Relaxed);
        let mut s = self.state.lock();
        let doubled = s.interval.saturating_mul(2);
        s.interval = doubled.min(MAX_BACKOFF_INTERVAL);
        s.tokens = 0.0;
        s.last_refill = Instant::now();
        warn!(
            interval_ms = s.interval.as_millis() as u64,
            "upstream rate limit observed — backing off"
        );
    }

    /// Record a successful upstream call: halve the interval back toward the
    /// base rate.
    pub fn on_success(&self) {
        let mut s = self.state.lock();
        if s.interval > s.base_interval {
            let halved = s.interval / 2;
            s.interval = halved.max(s.base_interval);
            debug!(
                interval_ms = s.interval.as_millis() as u64,
                "backoff easing after successful call"
            );
        }
    }

    // -------------------------------------------------------------------------
    // Snapshot
    // -------------------------------------------------------------------------

    /// Produce a serialisable snapshot of the gate counters.
    pub fn snapshot(&self) -> GateSnapshot {
        let mut s = self.state.lock();
        s.refill(Instant::now());
        GateSnapshot {
            calls_served: self.served.load(Ordering::Relaxed),
            rate_limited_responses: self.rate_limited_seen.load(Ordering::Relaxed),
            tokens_available: s.tokens,
            queue_depth: s.queue.len(),
            base_interval_ms: s.base_interval.as_millis() as u64,
            current_interval_ms: s.interval.as_millis() as u64,
            backing_off: s.interval > s.base_interval,
        }
    }
}

impl std::fmt::Debug for RateGate {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = self.state.lock();
        f.debug_struct("RateGate")
            .field("tokens", &s.tokens)
            .field("burst", &s.burst)
            .field("interval_ms", &(s.interval.as_millis() as u64))
            .field("queue_depth", &s.queue.len())
            .finish()
    }
}

/// Queue-entry guard: a waiter dropped mid-wait (tick cancellation) must not
/// hold up the grant order.
struct Ticket<'a> {
    gate: &'a RateGate,
    seq: u64,
    granted: bool,
}

impl Drop for Ticket<'_> {
    fn drop(&mut self) {
        if !self.granted {
            self.gate.state.lock().remove(self.seq);
            self.gate.notify.notify_waiters();
        }
    }
}

// =============================================================================
// Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[tokio::test(start_paused = true)]
    async fn burst_is_granted_immediately() {
        let gate = RateGate::new(10, 3);
        for _ in 0..3 {
            gate.acquire(Priority::MarketData).await;
        }
        let snap = gate.snapshot();
        assert_eq!(snap.calls_served, 3);
        assert!(snap.tokens_available < 1.0);
    }

    #[tokio::test(start_paused = true)]
    async fn empty_bucket_waits_for_refill() {
        let gate = Arc::new(RateGate::new(60, 1)); // one token per second
        gate.acquire(Priority::MarketData).await;

        let g = gate.clone();
        let waiter = tokio::spawn(async move {
            g.acquire(Priority::MarketData).await;
            tokio::time::Instant::now()
        });

        let start = tokio::time::Instant::now();
        let granted_at = waiter.await.unwrap();
        // The second grant must wait roughly one inter-token interval.
        assert!(granted_at - start >= Duration::from_millis(900));
    }

    #[tokio::test(start_paused = true)]
    async fn rolling_minute_stays_within_rate() {
        let gate = Arc::new(RateGate::new(10, 10));
        let served = Arc::new(AtomicU64::new(0));

        // Drain the initial burst.
        for _ in 0..10 {
            gate.acquire(Priority::MarketData).await;
        }

        // Queue 30 more waiters and advance exactly one minute.
        let mut handles = Vec::new();
        for _ in 0..30 {
            let g = gate.clone();
            let c = served.clone();
            handles.push(tokio::spawn(async move {
                g.acquire(Priority::MarketData).await;
                c.fetch_add(1, Ordering::Relaxed);
            }));
        }

        tokio::time::sleep(Duration::from_secs(60)).await;
        let granted = served.load(Ordering::Relaxed);
        assert!(granted <= 10, "granted {granted} tokens in one minute");

        for h in handles {
            h.abort();
        }
    }

    #[tokio::test(start_paused = true)]
    async fn higher_priority_preempts_waiting_queue() {
        let gate = Arc::new(RateGate::new(60, 1));
        gate.acquire(Priority::MarketData).await; // drain

        let order = Arc::new(Mutex::new(Vec::new()));

        let g = gate.clone();
        let o = order.clone();
        let low = tokio::spawn(async move {
            g.acquire(Priority::Background).await;
            o.lock().push("background");
        });

        // Let the background waiter enqueue first.
        tokio::time::sleep(Duration::from_millis(10)).await;

        let g = gate.clone();
        let o = order.clone();
        let high = tokio::spawn(async move {
            g.acquire(Priority::Trading).await;
            o.lock().push("trading");
        });

        tokio::time::sleep(Duration::from_secs(3)).await;
        low.await.unwrap();
        high.await.unwrap();

        assert_eq!(*order.lock(), vec!["trading", "background"]);
    }

    #[tokio::test(start_paused = true)]
    async fn ties_break_by_arrival_order() {
        let gate = Arc::new(RateGate::new(60, 1));
        gate.acquire(Priority::MarketData).await; // drain

        let order = Arc::new(Mutex::new(Vec::new()));
        let mut handles = Vec::new();
        for name in ["first", "second", "third"] {
            let g = gate.clone();
            let o = order.clone();
            handles.push(tokio::spawn(async move {
                g.acquire(Priority::MarketData).await;
                o.lock().push(name);
            }));
            // Deterministic arrival order.
            tokio::time::sleep(Duration::from_millis(5)).await;
        }

        tokio::time::sleep(Duration::from_secs(4)).await;
        for h in handles {
            h.await.unwrap();
        }
        assert_eq!(*order.lock(), vec!["first", "second", "third"]);
    }

    #[tokio::test(start_paused = true)]
    async fn backoff_doubles_and_success_halves() {
        let gate = RateGate::new(10, 10); // base interval 6s
        let base = gate.snapshot().base_interval_ms;

        gate.on_rate_limited();
        assert_eq!(gate.snapshot().current_interval_ms, base * 2);

        gate.on_rate_limited();
        assert_eq!(gate.snapshot().current_interval_ms, base * 4);

        gate.on_success();
        assert_eq!(gate.snapshot().current_interval_ms, base * 2);

        gate.on_success();
        assert_eq!(gate.snapshot().current_interval_ms, base);
        assert!(!gate.snapshot().backing_off);

        // Bounded below by the base rate.
        gate.on_success();
        assert_eq!(gate.snapshot().current_interval_ms, base);
    }

    #[tokio::test(start_paused = true)]
    async fn backoff_interval_is_capped() {
        let gate = RateGate::new(10, 10);
        for _ in 0..20 {
            gate.on_rate_limited();
        }
        assert_eq!(
            gate.snapshot().current_interval_ms,
            MAX_BACKOFF_INTERVAL.as_millis() as u64
        );
    }

    #[tokio::test(start_paused = true)]
    async fn dropped_waiter_unblocks_the_queue() {
        let gate = Arc::new(RateGate::new(60, 1));
        gate.acquire(Priority::MarketData).await; // drain

        // High-priority waiter that is dropped before a token arrives.
        let g = gate.clone();
        let doomed = tokio::spawn(async move {
            g.acquire(Priority::Trading).await;
        });
        tokio::time::sleep(Duration::from_millis(10)).await;
        doomed.abort();

        let g = gate.clone();
        let survivor = tokio::spawn(async move {
            g.acquire(Priority::Background).await;
        });

        tokio::time::sleep(Duration::from_secs(2)).await;
        survivor.await.unwrap();
        assert_eq!(gate.snapshot().queue_depth, 0);
    }
}
