// =============================================================================
// Engine — the single value tying the data plane, bots, and execution together
// =============================================================================
//
// Built once at startup and passed around as `Arc<Engine>`; there is no
// hidden global state.  The engine owns:
//
//   - configuration (hot-reloadable fields behind a lock)
//   - the data plane (gate -> cache -> coordinator)
//   - the bot registry and persistent store
//   - the daily ledger and trade service
//   - in-memory ring buffers of recent decisions and errors for the API
// =============================================================================

use std::sync::Arc;

use chrono::Utc;
use parking_lot::RwLock;
use serde::Serialize;
use tracing::{error, info, warn};
use uuid::Uuid;

use crate::bot::{Bot, BotRegistry};
use crate::cache::{CacheSnapshot, MarketCache};
use crate::config::EngineConfig;
use crate::coordinator::{CoordinatorSnapshot, DataCoordinator, DataOutcome};
use crate::evaluator::DecisionRecord;
use crate::gate::{GateSnapshot, Priority, RateGate};
use crate::market::client::MarketClient;
use crate::market::types::DataKey;
use crate::safety::{DailyLedger, DailyStats};
use crate::store::Store;
use crate::trade::{TradeIntent, TradeService};
use crate::types::{BotStatus, PositionStatus, Temperature, TradeSide};

/// Maximum recent decisions retained in memory for the API.
const MAX_RECENT_DECISIONS: usize = 200;
/// Maximum recent errors retained in memory.
const MAX_RECENT_ERRORS: usize = 50;

/// A recorded error event for the operational error log.
#[derive(Debug, Clone, Serialize)]
pub struct ErrorRecord {
    pub message: String,
    pub at: String,
}

/// Aggregate statistics for the stats endpoint.
#[derive(Debug, Clone, Serialize)]
pub struct EngineStats {
    pub uptime_secs: u64,
    pub gate: GateSnapshot,
    pub cache: CacheSnapshot,
    pub coordinator: CoordinatorSnapshot,
    pub daily: DailyStats,
    pub bots_total: usize,
    pub bots_running: usize,
    pub active_positions: u32,
}

/// Central engine state shared across all async tasks via `Arc<Engine>`.
pub struct Engine {
    pub config: RwLock<EngineConfig>,
    pub coordinator: Arc<DataCoordinator>,
    pub store: Store,
    pub registry: Arc<BotRegistry>,
    pub ledger: Arc<DailyLedger>,
    pub trade_service: Arc<TradeService>,

    recent_decisions: RwLock<Vec<DecisionRecord>>,
    recent_errors: RwLock<Vec<ErrorRecord>>,
    start_time: std::time::Instant,
}

impl Engine {
    /// Wire up every subsystem and reload persisted state.
    pub async fn bootstrap(
        config: EngineConfig,
        client: Arc<dyn MarketClient>,
    ) -> anyhow::Result<Arc<Self>> {
        let store = Store::connect(&config.database_path).await?;

        let gate = Arc::new(RateGate::new(config.rate_limit_per_minute, config.burst()));
        let cache = Arc::new(MarketCache::new(config.cache_ttls.clone()));
        let coordinator = Arc::new(DataCoordinator::new(client.clone(), gate.clone(), cache));

        let ledger = Arc::new(DailyLedger::new());
        let (trades_today, pnl_today) = store.daily_trade_stats().await?;
        ledger.seed(trades_today, pnl_today);

        let trade_service = Arc::new(TradeService::new(
            client,
            gate,
            store.clone(),
            ledger.clone(),
        ));

        let registry = Arc::new(BotRegistry::new());
        for bot in store.load_bots().await? {
            // A bot that fails validation is a stored invariant violation:
            // load it stopped rather than refusing to start the engine.
            if let Err(reason) = bot.validate() {
                error!(bot_id = %bot.id, name = %bot.name, reason = %reason, "stored bot failed validation — loading stopped");
                let mut stopped = bot;
                stopped.status = BotStatus::Stopped;
                registry.insert(stopped);
            } else {
                registry.insert(bot);
            }
        }

        info!(
            bots = registry.list().len(),
            trades_today,
            "engine bootstrapped"
        );

        Ok(Arc::new(Self {
            config: RwLock::new(config),
            coordinator,
            store,
            registry,
            ledger,
            trade_service,
            recent_decisions: RwLock::new(Vec::new()),
            recent_errors: RwLock::new(Vec::new()),
            start_time: std::time::Instant::now(),
        }))
    }

    /// Test harness constructor: everything in memory.
    #[cfg(test)]
    pub async fn for_tests(
        config: EngineConfig,
        client: Arc<dyn MarketClient>,
        store: Store,
    ) -> Arc<Self> {
        let gate = Arc::new(RateGate::new(config.rate_limit_per_minute, config.burst()));
        let cache = Arc::new(MarketCache::new(config.cache_ttls.clone()));
        let coordinator = Arc::new(DataCoordinator::new(client.clone(), gate.clone(), cache));
        let ledger = Arc::new(DailyLedger::new());
        let trade_service = Arc::new(TradeService::new(
            client,
            gate,
            store.clone(),
            ledger.clone(),
        ));

        Arc::new(Self {
            config: RwLock::new(config),
            coordinator,
            store,
            registry: Arc::new(BotRegistry::new()),
            ledger,
            trade_service,
            recent_decisions: RwLock::new(Vec::new()),
            recent_errors: RwLock::new(Vec::new()),
            start_time: std::time::Instant::now(),
        })
    }

    // -------------------------------------------------------------------------
    // Ring buffers
    // -------------------------------------------------------------------------

    /// Record a decision in the in-memory ring (capped).
    pub fn push_decision(&self, record: DecisionRecord) {
        let mut decisions = self.recent_decisions.write();
        decisions.push(record);
        while decisions.len() > MAX_RECENT_DECISIONS {
            decisions.remove(0);
        }
    }

    pub fn recent_decisions(&self) -> Vec<DecisionRecord> {
        self.recent_decisions.read().clone()
    }

    /// Record an operational error (capped ring).
    pub fn push_error(&self, message: impl Into<String>) {
        let mut errors = self.recent_errors.write();
        errors.push(ErrorRecord {
            message: message.into(),
            at: Utc::now().to_rfc3339(),
        });
        while errors.len() > MAX_RECENT_ERRORS {
            errors.remove(0);
        }
    }

    pub fn recent_errors(&self) -> Vec<ErrorRecord> {
        self.recent_errors.read().clone()
    }

    // -------------------------------------------------------------------------
    // Bot lifecycle operations (used by the control API)
    // -------------------------------------------------------------------------

    /// Validate and persist a new bot.
    pub async fn create_bot(&self, bot: Bot) -> Result<Bot, String> {
        bot.validate()?;
        self.store
            .upsert_bot(&bot)
            .await
            .map_err(|e| format!("persist failed: {e}"))?;
        self.registry.insert(bot.clone());
        info!(bot_id = %bot.id, name = %bot.name, pair = %bot.pair, "bot created");
        Ok(bot)
    }

    /// Validate and persist changes to an existing bot.
    pub async fn update_bot(&self, bot: Bot) -> Result<Bot, String> {
        bot.validate()?;
        if self.registry.get(bot.id).is_none() {
            return Err(format!("no bot with id {}", bot.id));
        }
        self.store
            .upsert_bot(&bot)
            .await
            .map_err(|e| format!("persist failed: {e}"))?;
        self.registry.insert(bot.clone());
        info!(bot_id = %bot.id, "bot updated");
        Ok(bot)
    }

    pub async fn delete_bot(&self, id: Uuid) -> Result<(), String> {
        if self.registry.remove(id).is_none() {
            return Err(format!("no bot with id {id}"));
        }
        self.store
            .delete_bot(id)
            .await
            .map_err(|e| format!("delete failed: {e}"))
    }

    pub async fn set_bot_status(&self, id: Uuid, status: BotStatus) -> Result<Bot, String> {
        let handle = self
            .registry
            .get(id)
            .ok_or_else(|| format!("no bot with id {id}"))?;

        let snapshot = {
            let mut bot = handle.bot.write();
            if status == BotStatus::Running {
                bot.validate()?;
            }
            bot.status = status;
            bot.clone()
        };

        self.store
            .upsert_bot(&snapshot)
            .await
            .map_err(|e| format!("persist failed: {e}"))?;
        info!(bot_id = %id, status = %status, "bot status changed");
        Ok(snapshot)
    }

    // -------------------------------------------------------------------------
    // Emergency stop
    // -------------------------------------------------------------------------

    /// Force a bot to flat: status -> Closing, sell every open tranche
    /// through the normal execution path, then Closed and Stopped.
    ///
    /// Safety-gate checks are intentionally not applied — this is the
    /// operator's abort lever — but each sell still persists through the
    /// transactional fill path.
    pub async fn emergency_stop(&self, id: Uuid) -> Result<Bot, String> {
        let handle = self
            .registry
            .get(id)
            .ok_or_else(|| format!("no bot with id {id}"))?;

        // Serialize against the scheduler's tick for this bot.
        let _tick = handle.tick_lock.lock().await;

        let (pair, had_tranches) = {
            let mut bot = handle.bot.write();
            bot.status = BotStatus::Stopped;
            if bot.open_tranche_count() > 0 {
                bot.position_status = PositionStatus::Closing;
            }
            (bot.pair.clone(), bot.open_tranche_count() > 0)
        };

        warn!(bot_id = %id, "emergency stop requested");

        if had_tranches {
            // One price fetch serves the whole liquidation.
            let config = self.config.read().clone();
            let deadline = tokio::time::Instant::now() + std::time::Duration::from_secs(30);
            let key = DataKey::Ticker { pair: pair.clone() };
            let price = match self
                .coordinator
                .request(key, Priority::Trading, deadline)
                .await
            {
                Ok(outcome) => match outcome {
                    DataOutcome::Fresh(p) | DataOutcome::Stale { payload: p, .. } => {
                        p.as_ticker().map(|t| t.price).unwrap_or(0.0)
                    }
                },
                Err(e) => {
                    return Err(format!("cannot price liquidation: {e}"));
                }
            };
            if price <= 0.0 {
                return Err("cannot price liquidation: zero price".into());
            }

            loop {
                let mut bot = handle.bot.read().clone();
                if bot.open_tranche_count() == 0 {
                    break;
                }

                let intent = TradeIntent {
                    side: TradeSide::Sell,
                    price,
                    composite: None,
                    temperature: Temperature::Hot,
                };

                match self.trade_service.execute(&mut bot, &intent, &config).await {
                    Ok(_) => {
                        *handle.bot.write() = bot;
                    }
                    Err(e) => {
                        self.push_error(format!("emergency stop sell failed for {id}: {e}"));
                        return Err(format!("liquidation sell failed: {e}"));
                    }
                }
            }
        }

        let snapshot = {
            let mut bot = handle.bot.write();
            bot.position_status = PositionStatus::Closed;
            bot.clear_window();
            bot.clone()
        };

        self.store
            .upsert_bot(&snapshot)
            .await
            .map_err(|e| format!("persist failed: {e}"))?;

        info!(bot_id = %id, "emergency stop complete — bot flat and stopped");
        Ok(snapshot)
    }

    // -------------------------------------------------------------------------
    // Stats
    // -------------------------------------------------------------------------

    pub fn stats(&self) -> EngineStats {
        EngineStats {
            uptime_secs: self.start_time.elapsed().as_secs(),
            gate: self.coordinator.gate().snapshot(),
            cache: self.coordinator.cache().snapshot(),
            coordinator: self.coordinator.snapshot(),
            daily: self.ledger.stats(),
            bots_total: self.registry.list().len(),
            bots_running: self.registry.running().len(),
            active_positions: self.registry.active_position_count(),
        }
    }
}

impl std::fmt::Debug for Engine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Engine")
            .field("bots", &self.registry.list().len())
            .field("uptime_secs", &self.start_time.elapsed().as_secs())
            .finish()
    }
}
