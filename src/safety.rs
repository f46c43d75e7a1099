// =============================================================================
// Safety Gate — pre-trade checks and the daily ledger
// =============================================================================
//
// `check` is a stateless function over the decision plus bot/global state:
// every check must pass before a promoted action becomes an order.  Each
// rejection carries a typed reason that lands in the decision record; the
// decision is not retried within the same tick.
//
// The daily ledger tracks trade count and realized P&L per UTC day and
// resets itself when the date rolls over.
// =============================================================================

use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use serde::Serialize;
use tracing::{debug, info, warn};

use crate::bot::Bot;
use crate::config::EngineConfig;
use crate::types::{Temperature, TradeSide};

// ---------------------------------------------------------------------------
// Rejection reasons
// ---------------------------------------------------------------------------

/// Why the gate refused a promoted action.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum RejectReason {
    Cooldown {
        remaining_min: f64,
    },
    TradeStep {
        move_pct: f64,
        required_pct: f64,
    },
    PositionCap {
        open_tranches: u32,
        max_tranches: u32,
    },
    ExposureCap {
        current_usd: f64,
        intended_usd: f64,
        ceiling_usd: f64,
    },
    NoOpenTranche,
    DailyTradeCap {
        trades_today: u32,
        max_daily_trades: u32,
    },
    DailyLossCap {
        loss_today_usd: f64,
        max_daily_loss_usd: f64,
    },
    ConcurrentPositions {
        active_positions: u32,
        max_active_positions: u32,
    },
    InsufficientBalance {
        currency: String,
        available: f64,
        required: f64,
    },
    TemperatureFloor {
        temperature: Temperature,
        floor: Temperature,
    },
}

impl RejectReason {
    /// Coarse subtype for observability dashboards.
    pub fn subtype(&self) -> &'static str {
        match self {
            Self::Cooldown { .. } => "cooldown",
            Self::TradeStep { .. } => "trade_step",
            Self::PositionCap { .. } | Self::ExposureCap { .. } | Self::NoOpenTranche => "position",
            Self::DailyTradeCap { .. } | Self::DailyLossCap { .. } => "daily_cap",
            Self::ConcurrentPositions { .. } => "position",
            Self::InsufficientBalance { .. } => "balance",
            Self::TemperatureFloor { .. } => "temperature",
        }
    }
}

impl std::fmt::Display for RejectReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Cooldown { remaining_min } => {
                write!(f, "cooldown: {remaining_min:.1} min remaining")
            }
            Self::TradeStep {
                move_pct,
                required_pct,
            } => write!(
                f,
                "trade step: price moved {move_pct:.2}% (need {required_pct:.2}%)"
            ),
            Self::PositionCap {
                open_tranches,
                max_tranches,
            } => write!(f, "position cap: {open_tranches}/{max_tranches} tranches open"),
            Self::ExposureCap {
                current_usd,
                intended_usd,
                ceiling_usd,
            } => write!(
                f,
                "exposure cap: {current_usd:.2} + {intended_usd:.2} exceeds {ceiling_usd:.2}"
            ),
            Self::NoOpenTranche => write!(f, "no open tranche to sell"),
            Self::DailyTradeCap {
                trades_today,
                max_daily_trades,
            } => write!(f, "daily trade cap: {trades_today}/{max_daily_trades}"),
            Self::DailyLossCap {
                loss_today_usd,
                max_daily_loss_usd,
            } => write!(
                f,
                "daily loss cap: {loss_today_usd:.2} of {max_daily_loss_usd:.2} lost"
            ),
            Self::ConcurrentPositions {
                active_positions,
                max_active_positions,
            } => write!(
                f,
                "concurrent positions: {active_positions}/{max_active_positions}"
            ),
            Self::InsufficientBalance {
                currency,
                available,
                required,
            } => write!(
                f,
                "insufficient {currency}: {available:.6} available, {required:.6} required"
            ),
            Self::TemperatureFloor { temperature, floor } => {
                write!(f, "temperature {temperature} below floor {floor}")
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Daily ledger
// ---------------------------------------------------------------------------

/// Per-UTC-day aggregates shared across all bots.
#[derive(Debug, Clone, Serialize)]
pub struct DailyStats {
    pub date: String,
    pub trades: u32,
    pub realized_pnl_usd: f64,
}

struct LedgerInner {
    date: String,
    trades: u32,
    realized_pnl_usd: f64,
}

/// Thread-safe daily trade/loss counters with automatic date rollover.
pub struct DailyLedger {
    state: RwLock<LedgerInner>,
}

impl DailyLedger {
    pub fn new() -> Self {
        Self {
            state: RwLock::new(LedgerInner {
                date: Utc::now().format("%Y-%m-%d").to_string(),
                trades: 0,
                realized_pnl_usd: 0.0,
            }),
        }
    }

    /// Record a completed trade and its realized P&L contribution.
    pub fn record_trade(&self, realized_pnl_usd: f64) {
        self.maybe_reset();
        let mut s = self.state.write();
        s.trades += 1;
        s.realized_pnl_usd += realized_pnl_usd;
        debug!(
            trades = s.trades,
            realized_pnl = s.realized_pnl_usd,
            "daily ledger updated"
        );
    }

    /// Restore counters from persisted trades at startup.
    pub fn seed(&self, trades: u32, realized_pnl_usd: f64) {
        let mut s = self.state.write();
        s.trades = trades;
        s.realized_pnl_usd = realized_pnl_usd;
    }

    pub fn stats(&self) -> DailyStats {
        self.maybe_reset();
        let s = self.state.read();
        DailyStats {
            date: s.date.clone(),
            trades: s.trades,
            realized_pnl_usd: s.realized_pnl_usd,
        }
    }

    /// If the UTC date changed since the last check, reset the counters.
    fn maybe_reset(&self) {
        let today = Utc::now().format("%Y-%m-%d").to_string();
        {
            let s = self.state.read();
            if s.date == today {
                return;
            }
        }
        let mut s = self.state.write();
        // Re-check under the write lock; another thread may have reset.
        if s.date != today {
            info!(old_date = %s.date, new_date = %today, "date rolled — resetting daily ledger");
            s.date = today;
            s.trades = 0;
            s.realized_pnl_usd = 0.0;
        }
    }
}

impl Default for DailyLedger {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for DailyLedger {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = self.state.read();
        f.debug_struct("DailyLedger")
            .field("date", &s.date)
            .field("trades", &s.trades)
            .field("realized_pnl_usd", &s.realized_pnl_usd)
            .finish()
    }
}

// ---------------------------------------------------------------------------
// Gate context and check
// ---------------------------------------------------------------------------

/// Everything the gate needs beyond the bot itself.
#[derive(Debug, Clone)]
pub struct SafetyContext<'a> {
    pub config: &'a EngineConfig,
    pub now: DateTime<Utc>,
    pub current_price: f64,
    /// Quote to spend (buys).
    pub intended_size_usd: f64,
    /// Base quantity to release (sells).
    pub intended_base_qty: f64,
    pub quote_balance: f64,
    pub base_balance: f64,
    /// Bots holding at least one open tranche, engine-wide.
    pub active_positions: u32,
    pub daily: DailyStats,
}

/// Run every pre-trade check; the first failure wins.
pub fn check(
    bot: &Bot,
    side: TradeSide,
    temperature: Temperature,
    ctx: &SafetyContext<'_>,
) -> Result<(), RejectReason> {
    // --- Cooldown ------------------------------------------------------------
    if let Some(last_ts) = bot.last_trade_ts {
        let elapsed_min = (ctx.now - last_ts).num_milliseconds() as f64 / 60_000.0;
        if elapsed_min < bot.cooldown_minutes {
            return Err(RejectReason::Cooldown {
                remaining_min: bot.cooldown_minutes - elapsed_min,
            });
        }
    }

    // Buys that add a tranche also honour the tranche cooldown.
    if side == TradeSide::Buy {
        if let Some(latest_entry) = bot
            .open_tranches()
            .iter()
            .map(|t| t.entry_ts)
            .max()
        {
            let elapsed_min = (ctx.now - latest_entry).num_milliseconds() as f64 / 60_000.0;
            let required = ctx.config.tranche_cooldown_min as f64;
            if elapsed_min < required {
                return Err(RejectReason::Cooldown {
                    remaining_min: required - elapsed_min,
                });
            }
        }
    }

    // --- Trade step ----------------------------------------------------------
    if let Some(last_price) = bot.last_trade_price {
        if last_price > 0.0 && ctx.current_price > 0.0 {
            let move_pct = ((ctx.current_price - last_price).abs() / last_price) * 100.0;
            if move_pct < bot.trade_step_pct {
                return Err(RejectReason::TradeStep {
                    move_pct,
                    required_pct: bot.trade_step_pct,
                });
            }
        }
    }

    // --- Position caps -------------------------------------------------------
    let open = bot.open_tranche_count();
    let max_tranches = bot.max_positions.min(ctx.config.max_position_tranches);

    match side {
        TradeSide::Buy => {
            if open >= max_tranches {
                return Err(RejectReason::PositionCap {
                    open_tranches: open,
                    max_tranches,
                });
            }

            let current_usd = crate::bot::open_exposure_usd(&bot.tranches);
            let ceiling = bot.exposure_ceiling_usd();
            if current_usd + ctx.intended_size_usd > ceiling + 1e-9 {
                return Err(RejectReason::ExposureCap {
                    current_usd,
                    intended_usd: ctx.intended_size_usd,
                    ceiling_usd: ceiling,
                });
            }

            // Opening a brand-new position also counts against the global cap.
            if open == 0 && ctx.active_positions >= ctx.config.max_active_positions {
                return Err(RejectReason::ConcurrentPositions {
                    active_positions: ctx.active_positions,
                    max_active_positions: ctx.config.max_active_positions,
                });
            }
        }
        TradeSide::Sell => {
            if open == 0 {
                return Err(RejectReason::NoOpenTranche);
            }
        }
    }

    // --- Daily caps ----------------------------------------------------------
    if ctx.daily.trades >= ctx.config.max_daily_trades {
        return Err(RejectReason::DailyTradeCap {
            trades_today: ctx.daily.trades,
            max_daily_trades: ctx.config.max_daily_trades,
        });
    }

    let loss_today = (-ctx.daily.realized_pnl_usd).max(0.0);
    if loss_today >= ctx.config.max_daily_loss_usd {
        return Err(RejectReason::DailyLossCap {
            loss_today_usd: loss_today,
            max_daily_loss_usd: ctx.config.max_daily_loss_usd,
        });
    }

    // --- Balance -------------------------------------------------------------
    match side {
        TradeSide::Buy => {
            if ctx.quote_balance < ctx.intended_size_usd {
                return Err(RejectReason::InsufficientBalance {
                    currency: bot.quote_currency().to_string(),
                    available: ctx.quote_balance,
                    required: ctx.intended_size_usd,
                });
            }
        }
        TradeSide::Sell => {
            if ctx.base_balance < ctx.intended_base_qty {
                return Err(RejectReason::InsufficientBalance {
                    currency: bot.base_currency().to_string(),
                    available: ctx.base_balance,
                    required: ctx.intended_base_qty,
                });
            }
        }
    }

    // --- Temperature floor ---------------------------------------------------
    if temperature < ctx.config.temperature_floor {
        return Err(RejectReason::TemperatureFloor {
            temperature,
            floor: ctx.config.temperature_floor,
        });
    }

    Ok(())
}

/// Log a rejection with structured context.
pub fn log_rejection(bot: &Bot, side: TradeSide, reason: &RejectReason) {
    warn!(
        bot_id = %bot.id,
        name = %bot.name,
        side = %side,
        subtype = reason.subtype(),
        reason = %reason,
        "trade intent rejected by safety gate"
    );
}
