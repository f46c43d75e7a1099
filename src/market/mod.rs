pub mod client;
pub mod error;
pub mod types;

// Re-export the common surface (e.g. `use crate::market::MarketClient`).
pub use client::{ExchangeClient, MarketClient};
pub use error::MarketError;
pub use types::{
    AccountBalance, Candle, CandleSeries, DataKey, DataKind, MarketPayload, MarketSnapshot,
    OrderAck, OrderFill, OrderState, PairData, Ticker,
};
