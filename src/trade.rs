// =============================================================================
// Trade Service — turns an accepted intent into an order and a fill
// =============================================================================
//
// Steps: size the order, persist a pending Trade, submit through the rate
// gate at TRADING priority, confirm, then commit the fill — trade row,
// tranche mutation, and bot live fields — in one store transaction.
//
// A failure marks the trade failed and mutates nothing else; the error is
// surfaced into the decision record.
//
// Dry-run mode simulates an immediate fill at the intent price with zero
// fee and exercises the identical persistence path, so paper trading tests
// the same code that trades live.
// =============================================================================

use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::bot::{status_after_fill, Bot, Tranche, TrancheStatus};
use crate::config::{EngineConfig, TrancheCloseOrder};
use crate::gate::{Priority, RateGate};
use crate::market::client::MarketClient;
use crate::market::error::MarketError;
use crate::market::types::OrderState;
use crate::safety::DailyLedger;
use crate::store::{Store, StoreError, TrancheMutation};
use crate::types::{Temperature, TradeSide, TradeStatus};

// ---------------------------------------------------------------------------
// Trade model
// ---------------------------------------------------------------------------

/// A submitted (or simulated) order and its lifecycle.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Trade {
    pub id: Uuid,
    pub bot_id: Uuid,
    pub pair: String,
    pub side: TradeSide,
    /// Order size in quote currency.
    pub size_usd: f64,
    /// Fill price (intent price until confirmed).
    pub price: f64,
    pub fee: f64,
    pub exchange_order_id: Option<String>,
    pub status: TradeStatus,
    pub composite_score_at_decision: Option<f64>,
    /// Realized P&L for sells, net of fee.  `None` for buys.
    pub realized_pnl: Option<f64>,
    pub created_ts: DateTime<Utc>,
    pub filled_ts: Option<DateTime<Utc>>,
}

/// An intent accepted by the safety gate, ready to execute.
#[derive(Debug, Clone)]
pub struct TradeIntent {
    pub side: TradeSide,
    /// Market price at decision time.
    pub price: f64,
    pub composite: Option<f64>,
    pub temperature: Temperature,
}

/// Execution failures.
#[derive(Debug, Error)]
pub enum TradeError {
    #[error("exchange rejected order: {0}")]
    Rejected(String),
    #[error("upstream error during execution: {0}")]
    Market(#[from] MarketError),
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error("no open tranche to sell")]
    NothingToSell,
}

// ---------------------------------------------------------------------------
// Sizing and tranche selection
// ---------------------------------------------------------------------------

/// Quote size for a buy, honoring the temperature scaler and the tranche
/// floor.
pub fn buy_size_usd(bot: &Bot, temperature: Temperature, config: &EngineConfig) -> f64 {
    let base = bot.position_size_usd;
    let scaled = if config.scale_by_temperature && temperature == Temperature::Warm {
        base * 0.75
    } else {
        base
    };
    scaled.max(config.min_tranche_usd)
}

/// Pick which open tranche a sell closes.
///
/// FIFO takes the oldest entry; ties break toward the lowest entry price.
/// The lowest-entry order takes the minimum entry price outright.
pub fn select_tranche_to_close(
    tranches: &[Tranche],
    order: TrancheCloseOrder,
) -> Option<&Tranche> {
    let open = tranches.iter().filter(|t| t.status == TrancheStatus::Open);
    match order {
        TrancheCloseOrder::Fifo => open.min_by(|a, b| {
            a.entry_ts
                .cmp(&b.entry_ts)
                .then(a.entry_price.total_cmp(&b.entry_price))
        }),
        TrancheCloseOrder::LowestEntry => {
            open.min_by(|a, b| a.entry_price.total_cmp(&b.entry_price))
        }
    }
}

// ---------------------------------------------------------------------------
// TradeService
// ---------------------------------------------------------------------------

/// Executes accepted intents against the exchange (or the simulator).
pub struct TradeService {
    client: Arc<dyn MarketClient>,
    gate: Arc<RateGate>,
    store: Store,
    ledger: Arc<DailyLedger>,
}

impl TradeService {
    pub fn new(
        client: Arc<dyn MarketClient>,
        gate: Arc<RateGate>,
        store: Store,
        ledger: Arc<DailyLedger>,
    ) -> Self {
        Self {
            client,
            gate,
            store,
            ledger,
        }
    }

    /// Execute an accepted intent for `bot`.
    ///
    /// On success the bot's tranches, position status, and last-trade fields
    /// are updated in memory and persisted atomically with the trade row.
    /// On failure the bot is untouched apart from the failed trade row.
    pub async fn execute(
        &self,
        bot: &mut Bot,
        intent: &TradeIntent,
        config: &EngineConfig,
    ) -> Result<Trade, TradeError> {
        match intent.side {
            TradeSide::Buy => self.execute_buy(bot, intent, config).await,
            TradeSide::Sell => self.execute_sell(bot, intent, config).await,
        }
    }

    // -------------------------------------------------------------------------
    // Buy
    // -------------------------------------------------------------------------

    async fn execute_buy(
        &self,
        bot: &mut Bot,
        intent: &TradeIntent,
        config: &EngineConfig,
    ) -> Result<Trade, TradeError> {
        let size_usd = buy_size_usd(bot, intent.temperature, config);
        let mut trade = self.new_pending_trade(bot, intent, size_usd);
        self.store.insert_trade(&trade).await?;

        let (fill_price, fee) = match self.submit(&mut trade, size_usd, config).await {
            Ok(fill) => fill,
            Err(err) => {
                self.spawn_mark_failed(trade.id);
                return Err(err);
            }
        };

        trade.status = TradeStatus::Filled;
        trade.price = fill_price;
        trade.fee = fee;
        trade.filled_ts = Some(Utc::now());

        let tranche = Tranche {
            id: Uuid::new_v4(),
            bot_id: bot.id,
            entry_trade_id: trade.id,
            size_usd,
            entry_price: fill_price,
            entry_ts: Utc::now(),
            status: TrancheStatus::Open,
        };

        bot.tranches.push(tranche.clone());
        bot.position_status = status_after_fill(
            bot.position_status,
            TradeSide::Buy,
            bot.open_tranche_count(),
            bot.max_positions.min(config.max_position_tranches),
        );
        bot.last_trade_ts = Some(trade.filled_ts.unwrap_or_else(Utc::now));
        bot.last_trade_price = Some(fill_price);

        self.store
            .commit_fill(&trade, TrancheMutation::Open(&tranche), bot)
            .await?;
        self.ledger.record_trade(0.0);

        info!(
            bot_id = %bot.id,
            trade_id = %trade.id,
            size_usd,
            fill_price,
            open_tranches = bot.open_tranche_count(),
            position_status = %bot.position_status,
            "buy filled — tranche opened"
        );

        Ok(trade)
    }

    // -------------------------------------------------------------------------
    // Sell
    // -------------------------------------------------------------------------

    async fn execute_sell(
        &self,
        bot: &mut Bot,
        intent: &TradeIntent,
        config: &EngineConfig,
    ) -> Result<Trade, TradeError> {
        let target = select_tranche_to_close(&bot.tranches, config.tranche_close_order)
            .cloned()
            .ok_or(TradeError::NothingToSell)?;

        // The sell releases the tranche's base quantity at the current price.
        let size_usd = target.base_quantity() * intent.price;
        let mut trade = self.new_pending_trade(bot, intent, size_usd);
        self.store.insert_trade(&trade).await?;

        let (fill_price, fee) = match self.submit(&mut trade, size_usd, config).await {
            Ok(fill) => fill,
            Err(err) => {
                self.spawn_mark_failed(trade.id);
                return Err(err);
            }
        };

        let realized = target.realized_pnl(fill_price) - fee;

        trade.status = TradeStatus::Filled;
        trade.price = fill_price;
        trade.fee = fee;
        trade.realized_pnl = Some(realized);
        trade.filled_ts = Some(Utc::now());

        bot.tranches.retain(|t| t.id != target.id);
        bot.position_status = status_after_fill(
            bot.position_status,
            TradeSide::Sell,
            bot.open_tranche_count(),
            bot.max_positions.min(config.max_position_tranches),
        );
        bot.last_trade_ts = Some(trade.filled_ts.unwrap_or_else(Utc::now));
        bot.last_trade_price = Some(fill_price);

        self.store
            .commit_fill(
                &trade,
                TrancheMutation::Close {
                    tranche_id: target.id,
                },
                bot,
            )
            .await?;
        self.ledger.record_trade(realized);

        info!(
            bot_id = %bot.id,
            trade_id = %trade.id,
            closed_tranche = %target.id,
            fill_price,
            realized_pnl = realized,
            remaining_tranches = bot.open_tranche_count(),
            position_status = %bot.position_status,
            "sell filled — tranche closed"
        );

        Ok(trade)
    }

    // -------------------------------------------------------------------------
    // Submission
    // -------------------------------------------------------------------------

    fn new_pending_trade(&self, bot: &Bot, intent: &TradeIntent, size_usd: f64) -> Trade {
        Trade {
            id: Uuid::new_v4(),
            bot_id: bot.id,
            pair: bot.pair.clone(),
            side: intent.side,
            size_usd,
            price: intent.price,
            fee: 0.0,
            exchange_order_id: None,
            status: TradeStatus::Pending,
            composite_score_at_decision: intent.composite,
            realized_pnl: None,
            created_ts: Utc::now(),
            filled_ts: None,
        }
    }

    /// Submit the order (or simulate it) and return `(fill_price, fee)`.
    async fn submit(
        &self,
        trade: &mut Trade,
        size_usd: f64,
        config: &EngineConfig,
    ) -> Result<(f64, f64), TradeError> {
        if config.dry_run {
            trade.exchange_order_id = Some(format!("sim-{}", trade.id));
            debug!(trade_id = %trade.id, "dry run — simulating immediate fill");
            return Ok((trade.price, 0.0));
        }

        self.gate.acquire(Priority::Trading).await;

        let client_order_id = trade.id.to_string();
        let ack = match self
            .client
            .place_order(&trade.pair, trade.side, size_usd, &client_order_id)
            .await
        {
            Ok(ack) => {
                self.gate.on_success();
                ack
            }
            Err(err) => {
                if err.is_rate_limited() {
                    self.gate.on_rate_limited();
                }
                warn!(trade_id = %trade.id, error = %err, "order submission failed");
                return Err(err.into());
            }
        };

        trade.exchange_order_id = Some(ack.exchange_order_id.clone());

        if ack.status == OrderState::Rejected {
            return Err(TradeError::Rejected(format!(
                "order {} rejected on submit",
                ack.exchange_order_id
            )));
        }

        // Confirm the fill.  Market orders fill effectively immediately; one
        // status poll retrieves the actual price and fee.
        self.gate.acquire(Priority::Trading).await;
        match self.client.get_order(&ack.exchange_order_id, &trade.pair).await {
            Ok(fill) if fill.status == OrderState::Rejected => {
                Err(TradeError::Rejected(format!(
                    "order {} rejected by the exchange",
                    ack.exchange_order_id
                )))
            }
            Ok(fill) if fill.status == OrderState::Filled && fill.avg_price > 0.0 => {
                self.gate.on_success();
                Ok((fill.avg_price, fill.fee))
            }
            Ok(_) => {
                // Still pending on the exchange side; book at the intent
                // price and let reconciliation settle the difference.
                self.gate.on_success();
                warn!(
                    trade_id = %trade.id,
                    order_id = %ack.exchange_order_id,
                    "fill confirmation pending — booking at intent price"
                );
                Ok((trade.price, 0.0))
            }
            Err(err) => {
                if err.is_rate_limited() {
                    self.gate.on_rate_limited();
                }
                // The order was accepted; book at intent price rather than
                // falsely failing a live order.
                warn!(
                    trade_id = %trade.id,
                    error = %err,
                    "fill confirmation unavailable — booking at intent price"
                );
                Ok((trade.price, 0.0))
            }
        }
    }

    /// Mark a trade failed without blocking the caller's error path.
    fn spawn_mark_failed(&self, trade_id: Uuid) {
        let store = self.store.clone();
        tokio::spawn(async move {
            if let Err(err) = store.mark_trade_failed(trade_id).await {
                warn!(trade_id = %trade_id, error = %err, "failed to mark trade failed");
            }
        });
    }
}

impl std::fmt::Debug for TradeService {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TradeService").finish_non_exhaustive()
    }
}

// =============================================================================
// Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;
    use crate::market::types::{
        AccountBalance, CandleSeries, OrderAck, OrderFill, Ticker,
    };
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicU32, Ordering};

    /// Upstream stub: orders fail when `fail_orders` is set.
    struct StubClient {
        fail_orders: bool,
        orders_placed: AtomicU32,
    }

    impl StubClient {
        fn new(fail_orders: bool) -> Arc<Self> {
            Arc::new(Self {
                fail_orders,
                orders_placed: AtomicU32::new(0),
            })
        }
    }

    #[async_trait]
    impl MarketClient for StubClient {
        async fn get_ticker(&self, _pair: &str) -> Result<Ticker, MarketError> {
            unimplemented!()
        }
        async fn get_candles(
            &self,
            _pair: &str,
            _granularity_sec: u32,
            _limit: u32,
        ) -> Result<CandleSeries, MarketError> {
            unimplemented!()
        }
        async fn get_accounts(&self) -> Result<Vec<AccountBalance>, MarketError> {
            unimplemented!()
        }
        async fn get_balance(&self, _currency: &str) -> Result<AccountBalance, MarketError> {
            unimplemented!()
        }

        async fn place_order(
            &self,
            _pair: &str,
            _side: TradeSide,
            _size_quote: f64,
            client_order_id: &str,
        ) -> Result<OrderAck, MarketError> {
            self.orders_placed.fetch_add(1, Ordering::SeqCst);
            if self.fail_orders {
                return Err(MarketError::Fatal("insufficient funds".into()));
            }
            Ok(OrderAck {
                exchange_order_id: format!("ex-{client_order_id}"),
                status: OrderState::Filled,
            })
        }

        async fn get_order(
            &self,
            _exchange_order_id: &str,
            _pair: &str,
        ) -> Result<OrderFill, MarketError> {
            Ok(OrderFill {
                status: OrderState::Filled,
                filled_size: 0.001,
                avg_price: 30_100.0,
                fee: 0.05,
            })
        }
    }

    async fn service(client: Arc<StubClient>) -> (TradeService, Store) {
        let store = Store::in_memory().await.unwrap();
        let gate = Arc::new(RateGate::new(600, 10));
        let ledger = Arc::new(DailyLedger::new());
        (
            TradeService::new(client, gate, store.clone(), ledger),
            store,
        )
    }

    async fn bot_in_store(store: &Store) -> Bot {
        let bot = Bot::new("exec-test", "BTC-USD");
        store.upsert_bot(&bot).await.unwrap();
        bot
    }

    fn buy_intent(price: f64) -> TradeIntent {
        TradeIntent {
            side: TradeSide::Buy,
            price,
            composite: Some(-0.3),
            temperature: Temperature::Hot,
        }
    }

    fn sell_intent(price: f64) -> TradeIntent {
        TradeIntent {
            side: TradeSide::Sell,
            price,
            composite: Some(0.3),
            temperature: Temperature::Hot,
        }
    }

    #[tokio::test]
    async fn dry_run_buy_opens_a_tranche() {
        let (service, store) = service(StubClient::new(false)).await;
        let mut bot = bot_in_store(&store).await;
        let config = EngineConfig::default(); // dry_run = true

        let trade = service
            .execute(&mut bot, &buy_intent(30_000.0), &config)
            .await
            .unwrap();

        assert_eq!(trade.status, TradeStatus::Filled);
        assert!((trade.size_usd - bot.position_size_usd).abs() < 1e-9);
        assert_eq!(bot.open_tranche_count(), 1);
        assert_eq!(bot.position_status, crate::types::PositionStatus::Building);
        assert!(bot.last_trade_ts.is_some());

        // Persisted too.
        assert_eq!(store.open_tranches(bot.id).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn sell_closes_oldest_tranche_fifo() {
        let (service, store) = service(StubClient::new(false)).await;
        let mut bot = bot_in_store(&store).await;
        let mut config = EngineConfig::default();
        config.tranche_cooldown_min = 0;

        // Open two tranches at different prices/times.
        service
            .execute(&mut bot, &buy_intent(100.0), &config)
            .await
            .unwrap();
        bot.tranches[0].entry_ts = Utc::now() - chrono::Duration::hours(2);
        let oldest_id = bot.tranches[0].id;
        service
            .execute(&mut bot, &buy_intent(120.0), &config)
            .await
            .unwrap();

        // Sell at 110: closes the 2-hour-old tranche entered at 100.
        let trade = service
            .execute(&mut bot, &sell_intent(110.0), &config)
            .await
            .unwrap();

        assert_eq!(bot.open_tranche_count(), 1);
        assert!(bot.tranches.iter().all(|t| t.id != oldest_id));
        // qty = 100/100 = 1.0; realized = (110 - 100) * 1.0 = 10.
        assert!((trade.realized_pnl.unwrap() - 10.0).abs() < 1e-9);
        assert_eq!(bot.position_status, crate::types::PositionStatus::Open);
    }

    #[tokio::test]
    async fn sell_last_tranche_closes_the_position() {
        let (service, store) = service(StubClient::new(false)).await;
        let mut bot = bot_in_store(&store).await;
        let mut config = EngineConfig::default();
        config.tranche_cooldown_min = 0;

        service
            .execute(&mut bot, &buy_intent(100.0), &config)
            .await
            .unwrap();
        service
            .execute(&mut bot, &sell_intent(105.0), &config)
            .await
            .unwrap();

        assert_eq!(bot.open_tranche_count(), 0);
        assert_eq!(bot.position_status, crate::types::PositionStatus::Closed);
    }

    #[tokio::test]
    async fn lowest_entry_order_closes_cheapest_first() {
        let (service, store) = service(StubClient::new(false)).await;
        let mut bot = bot_in_store(&store).await;
        let mut config = EngineConfig::default();
        config.tranche_cooldown_min = 0;
        config.tranche_close_order = TrancheCloseOrder::LowestEntry;

        service
            .execute(&mut bot, &buy_intent(120.0), &config)
            .await
            .unwrap();
        service
            .execute(&mut bot, &buy_intent(100.0), &config)
            .await
            .unwrap();
        let cheap_id = bot.tranches[1].id;

        service
            .execute(&mut bot, &sell_intent(110.0), &config)
            .await
            .unwrap();

        assert!(bot.tranches.iter().all(|t| t.id != cheap_id));
        // The expensive tranche remains.
        assert!((bot.tranches[0].entry_price - 120.0).abs() < 1e-9);
    }

    #[tokio::test]
    async fn sell_without_tranches_errors() {
        let (service, store) = service(StubClient::new(false)).await;
        let mut bot = bot_in_store(&store).await;
        let config = EngineConfig::default();

        let result = service
            .execute(&mut bot, &sell_intent(100.0), &config)
            .await;
        assert!(matches!(result, Err(TradeError::NothingToSell)));
    }

    #[tokio::test]
    async fn live_rejection_marks_failed_without_mutating_tranches() {
        let client = StubClient::new(true);
        let (service, store) = service(client.clone()).await;
        let mut bot = bot_in_store(&store).await;
        let mut config = EngineConfig::default();
        config.dry_run = false;

        let result = service
            .execute(&mut bot, &buy_intent(30_000.0), &config)
            .await;
        assert!(result.is_err());
        assert_eq!(client.orders_placed.load(Ordering::SeqCst), 1);
        assert_eq!(bot.open_tranche_count(), 0);
        assert!(bot.last_trade_ts.is_none());

        // Give the async failure marker a beat, then verify the row.
        tokio::time::sleep(std::time::Duration::from_millis(50)).await;
        let trades = store.trades_for_bot(bot.id, 10).await.unwrap();
        assert_eq!(trades.len(), 1);
        assert_eq!(trades[0].status, TradeStatus::Failed);
        assert!(store.open_tranches(bot.id).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn live_fill_uses_exchange_price_and_fee() {
        let client = StubClient::new(false);
        let (service, store) = service(client).await;
        let mut bot = bot_in_store(&store).await;
        let mut config = EngineConfig::default();
        config.dry_run = false;

        let trade = service
            .execute(&mut bot, &buy_intent(30_000.0), &config)
            .await
            .unwrap();

        // Fill detail comes from get_order, not the intent.
        assert!((trade.price - 30_100.0).abs() < 1e-9);
        assert!((trade.fee - 0.05).abs() < 1e-9);
        assert!(trade.exchange_order_id.as_deref().unwrap().starts_with("ex-"));
    }

    #[tokio::test]
    async fn warm_temperature_scales_size_when_enabled() {
        let mut config = EngineConfig::default();
        config.scale_by_temperature = true;
        let bot = Bot::new("sizer", "BTC-USD");

        let hot = buy_size_usd(&bot, Temperature::Hot, &config);
        let warm = buy_size_usd(&bot, Temperature::Warm, &config);
        assert!((hot - 100.0).abs() < 1e-9);
        assert!((warm - 75.0).abs() < 1e-9);

        // The floor holds even for scaled sizes.
        let mut small = Bot::new("small", "BTC-USD");
        small.position_size_usd = 10.0;
        let scaled = buy_size_usd(&small, Temperature::Warm, &config);
        assert!((scaled - config.min_tranche_usd).abs() < 1e-9);
    }
}
