// =============================================================================
// Bot model — configuration, live state, tranche accounting, registry
// =============================================================================
//
// A bot binds one market pair to one signal configuration and one position
// lifecycle.  The persistent store owns Bot and Tranche rows; the registry
// holds the in-memory working set with a per-bot tick lock so two ticks for
// the same bot never overlap.
//
// Tranche accounting (all sizes in quote currency):
//   base quantity       = sum(size / entry_price)
//   average entry price = sum(size) / base quantity       (harmonic mean)
//   unrealized P&L      = base quantity * current - sum(size)
//   realized P&L (exit) = (exit - entry) * (size / entry)
// =============================================================================

use std::collections::HashMap;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use tracing::{info, warn};
use uuid::Uuid;

use crate::signals::SignalConfig;
use crate::types::{BotStatus, PositionStatus, Temperature, TradeAction, TradeSide};

// ---------------------------------------------------------------------------
// Tranche
// ---------------------------------------------------------------------------

/// Open/closed state of a tranche.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TrancheStatus {
    Open,
    Closed,
}

/// One buy fill contributing to a bot's aggregate position.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Tranche {
    pub id: Uuid,
    pub bot_id: Uuid,
    pub entry_trade_id: Uuid,
    pub size_usd: f64,
    pub entry_price: f64,
    pub entry_ts: DateTime<Utc>,
    pub status: TrancheStatus,
}

impl Tranche {
    /// Base-currency quantity this tranche holds.
    pub fn base_quantity(&self) -> f64 {
        if self.entry_price > 0.0 {
            self.size_usd / self.entry_price
        } else {
            0.0
        }
    }

    /// Realized P&L if this tranche exits at `exit_price`.
    pub fn realized_pnl(&self, exit_price: f64) -> f64 {
        (exit_price - self.entry_price) * self.base_quantity()
    }
}

// ---------------------------------------------------------------------------
// Aggregate accounting over a set of open tranches
// ---------------------------------------------------------------------------

/// Total open exposure in quote currency.
pub fn open_exposure_usd(tranches: &[Tranche]) -> f64 {
    tranches
        .iter()
        .filter(|t| t.status == TrancheStatus::Open)
        .map(|t| t.size_usd)
        .sum()
}

/// Total base-currency quantity held.
pub fn base_quantity(tranches: &[Tranche]) -> f64 {
    tranches
        .iter()
        .filter(|t| t.status == TrancheStatus::Open)
        .map(Tranche::base_quantity)
        .sum()
}

/// Size-weighted harmonic mean entry price, `None` with no open tranches.
pub fn average_entry_price(tranches: &[Tranche]) -> Option<f64> {
    let qty = base_quantity(tranches);
    if qty > 0.0 {
        Some(open_exposure_usd(tranches) / qty)
    } else {
        None
    }
}

/// Mark-to-market P&L of the open tranches at `current_price`.
pub fn unrealized_pnl(tranches: &[Tranche], current_price: f64) -> f64 {
    base_quantity(tranches) * current_price - open_exposure_usd(tranches)
}

// ---------------------------------------------------------------------------
// Position lifecycle
// ---------------------------------------------------------------------------

/// Advance the position status after a filled order.
///
/// `open_after` is the number of open tranches once the fill is applied.
pub fn status_after_fill(
    current: PositionStatus,
    side: TradeSide,
    open_after: u32,
    max_tranches: u32,
) -> PositionStatus {
    match side {
        TradeSide::Buy => {
            if open_after >= max_tranches {
                PositionStatus::Open
            } else {
                PositionStatus::Building
            }
        }
        TradeSide::Sell => {
            if open_after == 0 {
                PositionStatus::Closed
            } else if current == PositionStatus::Closing {
                // Emergency liquidation continues until flat.
                PositionStatus::Closing
            } else {
                // A partial sell passes through Reducing and settles on Open.
                PositionStatus::Open
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Bot
// ---------------------------------------------------------------------------

/// A configured trading agent bound to one pair.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Bot {
    pub id: Uuid,
    pub name: String,
    /// e.g. "BTC-USD".
    pub pair: String,
    pub status: BotStatus,

    // --- Risk caps -----------------------------------------------------------
    /// Size of each tranche in quote currency.
    pub position_size_usd: f64,
    /// Maximum open tranches for this bot.
    pub max_positions: u32,
    pub stop_loss_pct: f64,
    pub take_profit_pct: f64,
    pub cooldown_minutes: f64,
    /// Minimum price move (fraction of last trade price) before another trade.
    pub trade_step_pct: f64,

    pub signal_config: SignalConfig,

    // --- Live fields ---------------------------------------------------------
    #[serde(default)]
    pub current_combined_score: f64,
    #[serde(default)]
    pub temperature: Temperature,
    #[serde(default)]
    pub position_status: PositionStatus,

    /// Confirmation window: the action waiting for enough agreeing ticks.
    #[serde(default)]
    pub pending_action: Option<TradeAction>,
    #[serde(default)]
    pub window_start_ts: Option<DateTime<Utc>>,

    #[serde(default)]
    pub last_trade_ts: Option<DateTime<Utc>>,
    #[serde(default)]
    pub last_trade_price: Option<f64>,

    /// Open tranches, oldest first.  Closed tranches live in the store only.
    #[serde(default)]
    pub tranches: Vec<Tranche>,

    pub created_at: DateTime<Utc>,
}

impl Bot {
    /// Create a bot with defaults for the live fields.
    pub fn new(name: impl Into<String>, pair: impl Into<String>) -> Self {
        Self {
            id: Uuid::new_v4(),
            name: name.into(),
            pair: pair.into(),
            status: BotStatus::Stopped,
            position_size_usd: 100.0,
            max_positions: 3,
            stop_loss_pct: 5.0,
            take_profit_pct: 10.0,
            cooldown_minutes: 15.0,
            trade_step_pct: 0.5,
            signal_config: SignalConfig::default(),
            current_combined_score: 0.0,
            temperature: Temperature::Frozen,
            position_status: PositionStatus::Closed,
            pending_action: None,
            window_start_ts: None,
            last_trade_ts: None,
            last_trade_price: None,
            tranches: Vec::new(),
            created_at: Utc::now(),
        }
    }

    /// Validate the bot's own invariants plus its signal configuration.
    ///
    /// An `Err` is an invariant violation: callers must refuse to run the bot
    /// and log the reason with full context.
    pub fn validate(&self) -> Result<(), String> {
        if self.name.trim().is_empty() {
            return Err("bot name must not be empty".into());
        }
        if self.pair.trim().is_empty() {
            return Err("trading pair must not be empty".into());
        }
        if !(self.position_size_usd > 0.0) {
            return Err(format!(
                "position_size_usd {} must be positive",
                self.position_size_usd
            ));
        }
        if self.max_positions == 0 {
            return Err("max_positions must be at least 1".into());
        }
        if !(self.stop_loss_pct > 0.0) {
            return Err(format!("stop_loss_pct {} must be positive", self.stop_loss_pct));
        }
        if !(self.take_profit_pct > 0.0) {
            return Err(format!(
                "take_profit_pct {} must be positive",
                self.take_profit_pct
            ));
        }
        if self.cooldown_minutes < 0.0 {
            return Err(format!(
                "cooldown_minutes {} must not be negative",
                self.cooldown_minutes
            ));
        }
        if self.trade_step_pct < 0.0 {
            return Err(format!(
                "trade_step_pct {} must not be negative",
                self.trade_step_pct
            ));
        }
        self.signal_config.validate()
    }

    /// Quote currency of the pair ("USD" for "BTC-USD").
    pub fn quote_currency(&self) -> &str {
        self.pair.split('-').nth(1).unwrap_or("USD")
    }

    /// Base currency of the pair ("BTC" for "BTC-USD").
    pub fn base_currency(&self) -> &str {
        self.pair.split('-').next().unwrap_or(self.pair.as_str())
    }

    /// Ceiling on total open exposure.
    pub fn exposure_ceiling_usd(&self) -> f64 {
        self.position_size_usd * self.max_positions as f64
    }

    /// Open tranches only (the in-memory list should already hold only open
    /// ones, but be defensive about rows loaded from older stores).
    pub fn open_tranches(&self) -> Vec<&Tranche> {
        self.tranches
            .iter()
            .filter(|t| t.status == TrancheStatus::Open)
            .collect()
    }

    pub fn open_tranche_count(&self) -> u32 {
        self.open_tranches().len() as u32
    }

    /// Reset the confirmation window.
    pub fn clear_window(&mut self) {
        self.pending_action = None;
        self.window_start_ts = None;
    }
}

// ---------------------------------------------------------------------------
// Registry
// ---------------------------------------------------------------------------

/// A bot plus its tick serialization lock.
pub struct BotHandle {
    pub bot: RwLock<Bot>,
    /// Held for the duration of one evaluation+trade pass.  Two ticks for the
    /// same bot never overlap.
    pub tick_lock: tokio::sync::Mutex<()>,
}

impl BotHandle {
    pub fn new(bot: Bot) -> Arc<Self> {
        Arc::new(Self {
            bot: RwLock::new(bot),
            tick_lock: tokio::sync::Mutex::new(()),
        })
    }
}

/// In-memory working set of bots, keyed by id.
pub struct BotRegistry {
    bots: RwLock<HashMap<Uuid, Arc<BotHandle>>>,
}

impl BotRegistry {
    pub fn new() -> Self {
        Self {
            bots: RwLock::new(HashMap::new()),
        }
    }

    /// Insert a bot, replacing any previous entry with the same id.
    pub fn insert(&self, bot: Bot) -> Arc<BotHandle> {
        let id = bot.id;
        let handle = BotHandle::new(bot);
        self.bots.write().insert(id, handle.clone());
        handle
    }

    pub fn remove(&self, id: Uuid) -> Option<Arc<BotHandle>> {
        let removed = self.bots.write().remove(&id);
        if removed.is_some() {
            info!(bot_id = %id, "bot removed from registry");
        }
        removed
    }

    pub fn get(&self, id: Uuid) -> Option<Arc<BotHandle>> {
        self.bots.read().get(&id).cloned()
    }

    /// All bots, sorted by name for stable listings.
    pub fn list(&self) -> Vec<Arc<BotHandle>> {
        let mut handles: Vec<_> = self.bots.read().values().cloned().collect();
        handles.sort_by_key(|h| h.bot.read().name.clone());
        handles
    }

    /// Bots that the scheduler should evaluate this tick.
    pub fn running(&self) -> Vec<Arc<BotHandle>> {
        self.bots
            .read()
            .values()
            .filter(|h| h.bot.read().status == BotStatus::Running)
            .cloned()
            .collect()
    }

    /// Count of bots holding at least one open tranche (for the global
    /// concurrent-positions cap).
    pub fn active_position_count(&self) -> u32 {
        self.bots
            .read()
            .values()
            .filter(|h| h.bot.read().open_tranche_count() > 0)
            .count() as u32
    }

    /// Stop a bot after an invariant violation, recording why.
    pub fn halt_bot(&self, id: Uuid, reason: &str) {
        if let Some(handle) = self.get(id) {
            let mut bot = handle.bot.write();
            bot.status = BotStatus::Stopped;
            warn!(bot_id = %id, name = %bot.name, reason, "bot halted");
        }
    }
}

impl Default for BotRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for BotRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BotRegistry")
            .field("bots", &self.bots.read().len())
            .finish()
    }
}
