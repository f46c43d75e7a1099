// =============================================================================
// Exchange REST client — HMAC-SHA256 signed requests behind the MarketClient
// trait
// =============================================================================
//
// SECURITY: The secret key is never logged or serialized. All signed requests
// include the API key as a header and a recvWindow of 5 000 ms to tolerate
// minor clock drift between the engine and the exchange.
//
// The trait is the seam the rest of the engine sees; tests substitute a mock.
// Only the DataCoordinator and TradeService are expected to hold a client.
// =============================================================================

use std::time::{SystemTime, UNIX_EPOCH};

use async_trait::async_trait;
use hmac::{Hmac, Mac};
use reqwest::header::{HeaderMap, HeaderValue};
use sha2::Sha256;
use tracing::{debug, instrument, warn};

use crate::market::error::MarketError;
use crate::market::types::{
    AccountBalance, Candle, CandleSeries, OrderAck, OrderFill, OrderState, Ticker,
};
use crate::types::TradeSide;

type HmacSha256 = Hmac<Sha256>;

/// Default recv-window sent with every signed request (milliseconds).
const RECV_WINDOW: u64 = 5000;

// ---------------------------------------------------------------------------
// Trait
// ---------------------------------------------------------------------------

/// Upstream exchange operations the engine depends on.
///
/// Implementations return [`MarketError`] classified as rate-limited,
/// transient, or fatal; callers pattern-match instead of parsing messages.
#[async_trait]
pub trait MarketClient: Send + Sync {
    async fn get_ticker(&self, pair: &str) -> Result<Ticker, MarketError>;

    /// Candles sorted ascending by ts.
    async fn get_candles(
        &self,
        pair: &str,
        granularity_sec: u32,
        limit: u32,
    ) -> Result<CandleSeries, MarketError>;

    async fn get_accounts(&self) -> Result<Vec<AccountBalance>, MarketError>;

    async fn get_balance(&self, currency: &str) -> Result<AccountBalance, MarketError>;

    /// Submit a market order sized in quote currency.  `client_order_id` makes
    /// the submit idempotent on the exchange side.
    async fn place_order(
        &self,
        pair: &str,
        side: TradeSide,
        size_quote: f64,
        client_order_id: &str,
    ) -> Result<OrderAck, MarketError>;

    async fn get_order(&self, exchange_order_id: &str, pair: &str)
        -> Result<OrderFill, MarketError>;
}

// ---------------------------------------------------------------------------
// HTTP implementation
// ---------------------------------------------------------------------------

/// REST client with HMAC-SHA256 request signing.
#[derive(Clone)]
pub struct ExchangeClient {
    secret: String,
    base_url: String,
    client: reqwest::Client,
}

impl ExchangeClient {
    /// Create a new `ExchangeClient`.
    ///
    /// # Arguments
    /// * `api_key` — API key (sent as a header, never in query params).
    /// * `secret`  — secret key used exclusively for HMAC signing.
    pub fn new(api_key: impl Into<String>, secret: impl Into<String>) -> Self {
        let api_key = api_key.into();
        let secret = secret.into();

        let mut default_headers = HeaderMap::new();
        if let Ok(val) = HeaderValue::from_str(&api_key) {
            default_headers.insert("X-MBX-APIKEY", val);
        }

        let client = reqwest::Client::builder()
            .default_headers(default_headers)
            .timeout(std::time::Duration::from_secs(10))
            .build()
            .expect("failed to build reqwest client");

        debug!("ExchangeClient initialised (base_url=https://api.binance.com)");

        Self {
            secret,
            base_url: "https://api.binance.com".to_string(),
            client,
        }
    }

    /// Override the base URL (test servers, regional endpoints).
    pub fn with_base_url(mut self, base_url: impl Into<String>) -> Self {
        self.base_url = base_url.into();
        self
    }

    // -------------------------------------------------------------------------
    // Signing helpers
    // -------------------------------------------------------------------------

    /// Produce an HMAC-SHA256 hex signature of `query`.
    fn sign(&self, query: &str) -> String {
        let mut mac =
            HmacSha256::new_from_slice(self.secret.as_bytes()).expect("HMAC accepts any key size");
        mac.update(query.as_bytes());
        hex::encode(mac.finalize().into_bytes())
    }

    /// Current UNIX timestamp in milliseconds.
    fn timestamp_ms() -> u64 {
        SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .expect("system clock before UNIX epoch")
            .as_millis() as u64
    }

    /// Build the full query string for a signed request (appends timestamp,
    /// recvWindow, and signature).
    fn signed_query(&self, params: &str) -> String {
        let ts = Self::timestamp_ms();
        let base = if params.is_empty() {
            format!("timestamp={ts}&recvWindow={RECV_WINDOW}")
        } else {
            format!("{params}&timestamp={ts}&recvWindow={RECV_WINDOW}")
        };
        let sig = self.sign(&base);
        format!("{base}&signature={sig}")
    }

    // -------------------------------------------------------------------------
    // Request plumbing
    // -------------------------------------------------------------------------

    /// Send a request and classify the outcome: non-2xx statuses become the
    /// appropriate [`MarketError`] class, 2xx bodies parse into JSON.
    async fn send_classified(
        &self,
        req: reqwest::RequestBuilder,
    ) -> Result<serde_json::Value, MarketError> {
        let resp = req.send().await?;
        let status = resp.status();
        let text = resp.text().await?;

        if !status.is_success() {
            return Err(MarketError::from_status(status, &text));
        }

        serde_json::from_str(&text)
            .map_err(|e| MarketError::Fatal(format!("malformed upstream body: {e}")))
    }

    /// Parse a JSON value that may be either a string or a number into `f64`.
    fn parse_str_f64(val: &serde_json::Value) -> Result<f64, MarketError> {
        if let Some(s) = val.as_str() {
            s.parse::<f64>()
                .map_err(|_| MarketError::Fatal(format!("failed to parse '{s}' as f64")))
        } else if let Some(n) = val.as_f64() {
            Ok(n)
        } else {
            Err(MarketError::Fatal(format!(
                "expected string or number, got: {val}"
            )))
        }
    }

    /// "BTC-USD" -> "BTCUSD" (exchange symbol form).
    fn symbol(pair: &str) -> String {
        pair.replace('-', "")
    }

    /// Map a granularity in seconds onto the exchange's interval token.
    fn interval(granularity_sec: u32) -> String {
        match granularity_sec {
            60 => "1m".to_string(),
            300 => "5m".to_string(),
            900 => "15m".to_string(),
            3600 => "1h".to_string(),
            14400 => "4h".to_string(),
            86400 => "1d".to_string(),
            other => format!("{}m", (other / 60).max(1)),
        }
    }
}

#[async_trait]
impl MarketClient for ExchangeClient {
    /// GET /api/v3/ticker/24hr (public).
    #[instrument(skip(self), name = "exchange::get_ticker")]
    async fn get_ticker(&self, pair: &str) -> Result<Ticker, MarketError> {
        let url = format!(
            "{}/api/v3/ticker/24hr?symbol={}",
            self.base_url,
            Self::symbol(pair)
        );

        let body = self.send_classified(self.client.get(&url)).await?;

        let price = Self::parse_str_f64(&body["lastPrice"])?;
        let volume_24h = Self::parse_str_f64(&body["volume"])?;
        let ts = body["closeTime"].as_i64().unwrap_or(0);

        debug!(pair, price, "ticker fetched");

        Ok(Ticker {
            pair: pair.to_string(),
            price,
            volume_24h,
            ts,
        })
    }

    /// GET /api/v3/klines (public).
    ///
    /// Array indices:
    ///   [0] openTime, [1] open, [2] high, [3] low, [4] close, [5] volume
    #[instrument(skip(self), name = "exchange::get_candles")]
    async fn get_candles(
        &self,
        pair: &str,
        granularity_sec: u32,
        limit: u32,
    ) -> Result<CandleSeries, MarketError> {
        let url = format!(
            "{}/api/v3/klines?symbol={}&interval={}&limit={}",
            self.base_url,
            Self::symbol(pair),
            Self::interval(granularity_sec),
            limit
        );

        let body = self.send_classified(self.client.get(&url)).await?;

        let raw = body
            .as_array()
            .ok_or_else(|| MarketError::Fatal("klines response is not an array".into()))?;

        let mut series = CandleSeries::with_capacity(raw.len());

        for entry in raw {
            let arr = entry
                .as_array()
                .ok_or_else(|| MarketError::Fatal("kline entry is not an array".into()))?;

            if arr.len() < 6 {
                warn!("skipping malformed kline entry with {} elements", arr.len());
                continue;
            }

            series.push(Candle {
                ts: arr[0].as_i64().unwrap_or(0),
                open: Self::parse_str_f64(&arr[1])?,
                high: Self::parse_str_f64(&arr[2])?,
                low: Self::parse_str_f64(&arr[3])?,
                close: Self::parse_str_f64(&arr[4])?,
                volume: Self::parse_str_f64(&arr[5])?,
            });
        }

        debug!(pair, granularity_sec, count = series.len(), "candles fetched");
        Ok(series)
    }

    /// GET /api/v3/account (signed).
    #[instrument(skip(self), name = "exchange::get_accounts")]
    async fn get_accounts(&self) -> Result<Vec<AccountBalance>, MarketError> {
        let qs = self.signed_query("");
        let url = format!("{}/api/v3/account?{}", self.base_url, qs);

        let body = self.send_classified(self.client.get(&url)).await?;

        let balances = body["balances"]
            .as_array()
            .ok_or_else(|| MarketError::Fatal("account response missing 'balances'".into()))?;

        let mut out = Vec::new();
        for b in balances {
            let currency = b["asset"].as_str().unwrap_or("").to_string();
            let available = Self::parse_str_f64(&b["free"]).unwrap_or(0.0);
            let hold = Self::parse_str_f64(&b["locked"]).unwrap_or(0.0);
            if available > 0.0 || hold > 0.0 {
                out.push(AccountBalance {
                    currency,
                    available,
                    hold,
                });
            }
        }

        debug!(count = out.len(), "account balances fetched");
        Ok(out)
    }

    /// Convenience: single-currency view over the accounts endpoint.
    #[instrument(skip(self), name = "exchange::get_balance")]
    async fn get_balance(&self, currency: &str) -> Result<AccountBalance, MarketError> {
        let accounts = self.get_accounts().await?;

        match accounts.into_iter().find(|a| a.currency == currency) {
            Some(balance) => Ok(balance),
            None => {
                warn!(currency, "currency not found in balances — returning zero");
                Ok(AccountBalance {
                    currency: currency.to_string(),
                    available: 0.0,
                    hold: 0.0,
                })
            }
        }
    }

    /// POST /api/v3/order (signed) — market order sized in quote currency.
    #[instrument(skip(self, size_quote), name = "exchange::place_order")]
    async fn place_order(
        &self,
        pair: &str,
        side: TradeSide,
        size_quote: f64,
        client_order_id: &str,
    ) -> Result<OrderAck, MarketError> {
        let side_str = match side {
            TradeSide::Buy => "BUY",
            TradeSide::Sell => "SELL",
        };
        let params = format!(
            "symbol={}&side={}&type=MARKET&quoteOrderQty={}&newClientOrderId={}",
            Self::symbol(pair),
            side_str,
            size_quote,
            client_order_id
        );
        let qs = self.signed_query(&params);
        let url = format!("{}/api/v3/order?{}", self.base_url, qs);

        debug!(pair, side = %side, size_quote, "placing order");

        let body = self.send_classified(self.client.post(&url)).await?;

        let exchange_order_id = body["orderId"]
            .as_u64()
            .map(|id| id.to_string())
            .or_else(|| body["orderId"].as_str().map(String::from))
            .ok_or_else(|| MarketError::Fatal("order response missing orderId".into()))?;

        let status = match body["status"].as_str().unwrap_or("") {
            "FILLED" => OrderState::Filled,
            "REJECTED" | "EXPIRED" | "CANCELED" => OrderState::Rejected,
            _ => OrderState::Pending,
        };

        debug!(pair, exchange_order_id = %exchange_order_id, "order placed");
        Ok(OrderAck {
            exchange_order_id,
            status,
        })
    }

    /// GET /api/v3/order (signed).
    #[instrument(skip(self), name = "exchange::get_order")]
    async fn get_order(
        &self,
        exchange_order_id: &str,
        pair: &str,
    ) -> Result<OrderFill, MarketError> {
        let params = format!(
            "symbol={}&orderId={}",
            Self::symbol(pair),
            exchange_order_id
        );
        let qs = self.signed_query(&params);
        let url = format!("{}/api/v3/order?{}", self.base_url, qs);

        let body = self.send_classified(self.client.get(&url)).await?;

        let status = match body["status"].as_str().unwrap_or("") {
            "FILLED" => OrderState::Filled,
            "REJECTED" | "EXPIRED" | "CANCELED" => OrderState::Rejected,
            _ => OrderState::Pending,
        };

        let filled_size = Self::parse_str_f64(&body["executedQty"]).unwrap_or(0.0);
        let quote_filled = Self::parse_str_f64(&body["cummulativeQuoteQty"]).unwrap_or(0.0);
        let avg_price = if filled_size > 0.0 {
            quote_filled / filled_size
        } else {
            0.0
        };

        Ok(OrderFill {
            status,
            filled_size,
            avg_price,
            // The order endpoint does not carry commission detail.
            fee: 0.0,
        })
    }
}

impl std::fmt::Debug for ExchangeClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ExchangeClient")
            .field("secret", &"<redacted>")
            .field("base_url", &self.base_url)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn symbol_strips_separator() {
        assert_eq!(ExchangeClient::symbol("BTC-USD"), "BTCUSD");
        assert_eq!(ExchangeClient::symbol("ETHUSDT"), "ETHUSDT");
    }

    #[test]
    fn interval_maps_common_granularities() {
        assert_eq!(ExchangeClient::interval(60), "1m");
        assert_eq!(ExchangeClient::interval(300), "5m");
        assert_eq!(ExchangeClient::interval(3600), "1h");
        assert_eq!(ExchangeClient::interval(86400), "1d");
        assert_eq!(ExchangeClient::interval(120), "2m");
    }

    #[test]
    fn signature_is_deterministic_hex() {
        let client = ExchangeClient::new("key", "secret");
        let sig1 = client.sign("a=1&b=2");
        let sig2 = client.sign("a=1&b=2");
        assert_eq!(sig1, sig2);
        assert_eq!(sig1.len(), 64);
        assert!(sig1.chars().all(|c| c.is_ascii_hexdigit()));
    }

    #[test]
    fn debug_redacts_secret() {
        let client = ExchangeClient::new("key", "super-secret");
        let rendered = format!("{client:?}");
        assert!(!rendered.contains("super-secret"));
        assert!(rendered.contains("<redacted>"));
    }
}
