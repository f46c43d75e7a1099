// =============================================================================
// Market data types — tickers, candle series, accounts, orders, cache keys
// =============================================================================

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

// ---------------------------------------------------------------------------
// Ticker
// ---------------------------------------------------------------------------

/// Latest price view for a single pair.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Ticker {
    pub pair: String,
    pub price: f64,
    pub volume_24h: f64,
    pub ts: i64,
}

// ---------------------------------------------------------------------------
// Candles
// ---------------------------------------------------------------------------

/// A single OHLCV candle as returned by the upstream API.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct Candle {
    pub open: f64,
    pub high: f64,
    pub low: f64,
    pub close: f64,
    pub volume: f64,
    pub ts: i64,
}

/// Column-oriented candle storage: one array per field, equal lengths,
/// ascending by `ts`.  Signal math runs plain numeric loops over `close`
/// without shuffling row structs.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CandleSeries {
    pub open: Vec<f64>,
    pub high: Vec<f64>,
    pub low: Vec<f64>,
    pub close: Vec<f64>,
    pub volume: Vec<f64>,
    pub ts: Vec<i64>,
}

impl CandleSeries {
    pub fn with_capacity(n: usize) -> Self {
        Self {
            open: Vec::with_capacity(n),
            high: Vec::with_capacity(n),
            low: Vec::with_capacity(n),
            close: Vec::with_capacity(n),
            volume: Vec::with_capacity(n),
            ts: Vec::with_capacity(n),
        }
    }

    /// Append one candle, keeping all columns in lockstep.
    pub fn push(&mut self, candle: Candle) {
        self.open.push(candle.open);
        self.high.push(candle.high);
        self.low.push(candle.low);
        self.close.push(candle.close);
        self.volume.push(candle.volume);
        self.ts.push(candle.ts);
    }

    pub fn len(&self) -> usize {
        self.close.len()
    }

    pub fn is_empty(&self) -> bool {
        self.close.is_empty()
    }

    /// Most recent close, if any.
    pub fn last_close(&self) -> Option<f64> {
        self.close.last().copied()
    }

    /// Timestamp of the most recent candle, if any.
    pub fn last_ts(&self) -> Option<i64> {
        self.ts.last().copied()
    }
}

impl FromIterator<Candle> for CandleSeries {
    fn from_iter<I: IntoIterator<Item = Candle>>(iter: I) -> Self {
        let mut series = CandleSeries::default();
        for candle in iter {
            series.push(candle);
        }
        series
    }
}

// ---------------------------------------------------------------------------
// Accounts / balances
// ---------------------------------------------------------------------------

/// Balance view for a single currency.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AccountBalance {
    pub currency: String,
    #[serde(default)]
    pub available: f64,
    #[serde(default)]
    pub hold: f64,
}

// ---------------------------------------------------------------------------
// Orders
// ---------------------------------------------------------------------------

/// Exchange acknowledgement of a submitted order.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OrderAck {
    pub exchange_order_id: String,
    pub status: OrderState,
}

/// Fill detail returned by the order-status endpoint.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OrderFill {
    pub status: OrderState,
    pub filled_size: f64,
    pub avg_price: f64,
    pub fee: f64,
}

/// Coarse order state as reported by the exchange.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OrderState {
    Pending,
    Filled,
    Rejected,
}

// ---------------------------------------------------------------------------
// DataKey — structured cache key
// ---------------------------------------------------------------------------

/// Kind of market data a key addresses; selects the TTL.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DataKind {
    Ticker,
    Candles,
    Accounts,
    Balance,
}

/// Structured key identifying one upstream request.
///
/// The canonical string form (`ticker:{pair}`,
/// `candles:{pair}:{granularity}:{limit}`, `accounts`,
/// `balance:{currency}`) is used for logging and prefix invalidation.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum DataKey {
    Ticker {
        pair: String,
    },
    Candles {
        pair: String,
        granularity_sec: u32,
        limit: u32,
    },
    Accounts,
    Balance {
        currency: String,
    },
}

impl DataKey {
    pub fn kind(&self) -> DataKind {
        match self {
            Self::Ticker { .. } => DataKind::Ticker,
            Self::Candles { .. } => DataKind::Candles,
            Self::Accounts => DataKind::Accounts,
            Self::Balance { .. } => DataKind::Balance,
        }
    }

    /// Pair this key addresses, when it is pair-scoped.
    pub fn pair(&self) -> Option<&str> {
        match self {
            Self::Ticker { pair } | Self::Candles { pair, .. } => Some(pair),
            _ => None,
        }
    }
}

impl std::fmt::Display for DataKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Ticker { pair } => write!(f, "ticker:{pair}"),
            Self::Candles {
                pair,
                granularity_sec,
                limit,
            } => write!(f, "candles:{pair}:{granularity_sec}:{limit}"),
            Self::Accounts => write!(f, "accounts"),
            Self::Balance { currency } => write!(f, "balance:{currency}"),
        }
    }
}

// ---------------------------------------------------------------------------
// MarketPayload — the value side of a cache entry
// ---------------------------------------------------------------------------

/// Fetched market data, one variant per [`DataKind`].
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum MarketPayload {
    Ticker(Ticker),
    Candles(CandleSeries),
    Accounts(Vec<AccountBalance>),
    Balance(AccountBalance),
}

impl MarketPayload {
    pub fn as_ticker(&self) -> Option<&Ticker> {
        match self {
            Self::Ticker(t) => Some(t),
            _ => None,
        }
    }

    pub fn as_candles(&self) -> Option<&CandleSeries> {
        match self {
            Self::Candles(c) => Some(c),
            _ => None,
        }
    }
}

// ---------------------------------------------------------------------------
// MarketSnapshot — per-tick view handed to the evaluators
// ---------------------------------------------------------------------------

/// Market data for one pair within a snapshot.
#[derive(Debug, Clone, Default)]
pub struct PairData {
    pub ticker: Option<Ticker>,
    pub candles: Option<CandleSeries>,
}

/// The consistent set of market data assembled once per tick.
///
/// Owned by the tick that produced it; evaluators borrow it and it is dropped
/// when the tick completes.  Entries may have been fetched at slightly
/// different times — consistency is per key, not across keys.
#[derive(Debug, Clone)]
pub struct MarketSnapshot {
    pub pairs: HashMap<String, PairData>,
    pub accounts: Vec<AccountBalance>,
    pub taken_at: DateTime<Utc>,
}

impl MarketSnapshot {
    pub fn new(taken_at: DateTime<Utc>) -> Self {
        Self {
            pairs: HashMap::new(),
            accounts: Vec::new(),
            taken_at,
        }
    }

    pub fn pair(&self, pair: &str) -> Option<&PairData> {
        self.pairs.get(pair)
    }

    /// Available balance for `currency`, zero when absent.
    pub fn available_balance(&self, currency: &str) -> f64 {
        self.accounts
            .iter()
            .find(|a| a.currency == currency)
            .map(|a| a.available)
            .unwrap_or(0.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn candle(close: f64, ts: i64) -> Candle {
        Candle {
            open: close,
            high: close,
            low: close,
            close,
            volume: 1.0,
            ts,
        }
    }

    #[test]
    fn series_columns_stay_in_lockstep() {
        let series: CandleSeries = (0..5).map(|i| candle(100.0 + i as f64, i)).collect();
        assert_eq!(series.len(), 5);
        assert_eq!(series.open.len(), series.ts.len());
        assert_eq!(series.last_close(), Some(104.0));
        assert_eq!(series.last_ts(), Some(4));
    }

    #[test]
    fn key_display_is_canonical() {
        let key = DataKey::Candles {
            pair: "BTC-USD".into(),
            granularity_sec: 60,
            limit: 100,
        };
        assert_eq!(key.to_string(), "candles:BTC-USD:60:100");
        assert_eq!(DataKey::Accounts.to_string(), "accounts");
        assert_eq!(
            DataKey::Balance {
                currency: "USD".into()
            }
            .to_string(),
            "balance:USD"
        );
    }

    #[test]
    fn snapshot_balance_lookup() {
        let mut snap = MarketSnapshot::new(Utc::now());
        snap.accounts.push(AccountBalance {
            currency: "USD".into(),
            available: 500.0,
            hold: 10.0,
        });
        assert!((snap.available_balance("USD") - 500.0).abs() < f64::EPSILON);
        assert_eq!(snap.available_balance("BTC"), 0.0);
    }
}
