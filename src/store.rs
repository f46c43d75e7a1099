// =============================================================================
// Store — SQLite persistence for bots, tranches, trades, decision history
// =============================================================================
//
// Schema is created on startup with CREATE TABLE IF NOT EXISTS; the engine
// reloads its full working set from here after a restart, confirmation
// windows and open tranches included.
//
// Mutations that span a trade and bot/tranche state run inside a single
// transaction (`commit_fill`): a failure rolls back all of it.
//
// Timestamps are stored as RFC 3339 text; enums as their snake_case tokens.
// =============================================================================

use chrono::{DateTime, Duration, Utc};
use sqlx::sqlite::{SqlitePool, SqlitePoolOptions, SqliteRow};
use sqlx::Row;
use thiserror::Error;
use tracing::{debug, info};
use uuid::Uuid;

use crate::bot::{Bot, Tranche, TrancheStatus};
use crate::evaluator::DecisionRecord;
use crate::trade::Trade;
use crate::types::{BotStatus, PositionStatus, Temperature, TradeAction, TradeSide, TradeStatus};

/// Persistence failures.  Only these (and invariant violations) may stop a
/// bot.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
    #[error("corrupt row: {0}")]
    Corrupt(String),
}

/// How a fill mutates the tranche set.
pub enum TrancheMutation<'a> {
    /// Buy fill: open this new tranche.
    Open(&'a Tranche),
    /// Sell fill: close this tranche.
    Close { tranche_id: Uuid },
}

/// SQLite-backed repository.
#[derive(Clone)]
pub struct Store {
    pool: SqlitePool,
}

impl Store {
    // -------------------------------------------------------------------------
    // Construction & schema
    // -------------------------------------------------------------------------

    /// Connect and ensure the schema exists.
    pub async fn connect(url: &str) -> Result<Self, StoreError> {
        let pool = SqlitePoolOptions::new()
            .max_connections(5)
            .connect(url)
            .await?;
        let store = Self { pool };
        store.ensure_schema().await?;
        info!(url, "store connected");
        Ok(store)
    }

    /// Private in-memory database, used by tests.
    pub async fn in_memory() -> Result<Self, StoreError> {
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect("sqlite::memory:")
            .await?;
        let store = Self { pool };
        store.ensure_schema().await?;
        Ok(store)
    }

    async fn ensure_schema(&self) -> Result<(), StoreError> {
        sqlx::raw_sql(
            r#"
            CREATE TABLE IF NOT EXISTS bots (
                id TEXT PRIMARY KEY,
                name TEXT NOT NULL,
                pair TEXT NOT NULL,
                status TEXT NOT NULL,

                position_size_usd REAL NOT NULL,
                max_positions INTEGER NOT NULL,
                stop_loss_pct REAL NOT NULL,
                take_profit_pct REAL NOT NULL,
                cooldown_minutes REAL NOT NULL,
                trade_step_pct REAL NOT NULL,
                signal_config TEXT NOT NULL,

                current_combined_score REAL NOT NULL DEFAULT 0,
                temperature TEXT NOT NULL DEFAULT 'frozen',
                position_status TEXT NOT NULL DEFAULT 'closed',
                pending_action TEXT,
                window_start_ts TEXT,
                last_trade_ts TEXT,
                last_trade_price REAL,
                created_at TEXT NOT NULL
            );

            CREATE TABLE IF NOT EXISTS tranches (
                id TEXT PRIMARY KEY,
                bot_id TEXT NOT NULL REFERENCES bots(id),
                entry_trade_id TEXT NOT NULL,
                size_usd REAL NOT NULL,
                entry_price REAL NOT NULL,
                entry_ts TEXT NOT NULL,
                status TEXT NOT NULL
            );
            CREATE INDEX IF NOT EXISTS idx_tranches_bot_status
                ON tranches(bot_id, status);

            CREATE TABLE IF NOT EXISTS trades (
                id TEXT PRIMARY KEY,
                bot_id TEXT NOT NULL REFERENCES bots(id),
                pair TEXT NOT NULL,
                side TEXT NOT NULL,
                size_usd REAL NOT NULL,
                price REAL NOT NULL,
                fee REAL NOT NULL DEFAULT 0,
                exchange_order_id TEXT UNIQUE,
                status TEXT NOT NULL,
                composite_score REAL,
                realized_pnl REAL,
                created_ts TEXT NOT NULL,
                filled_ts TEXT
            );
            CREATE INDEX IF NOT EXISTS idx_trades_bot_created
                ON trades(bot_id, created_ts);

            CREATE TABLE IF NOT EXISTS decision_history (
                id TEXT PRIMARY KEY,
                bot_id TEXT NOT NULL,
                ts TEXT NOT NULL,
                record TEXT NOT NULL
            );
            CREATE INDEX IF NOT EXISTS idx_decisions_bot_ts
                ON decision_history(bot_id, ts);
            "#,
        )
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    // -------------------------------------------------------------------------
    // Bots
    // -------------------------------------------------------------------------

    /// Insert or update a bot row (config and live fields).
    pub async fn upsert_bot(&self, bot: &Bot) -> Result<(), StoreError> {
        let signal_config = serde_json::to_string(&bot.signal_config)?;

        sqlx::query(
            r#"
            INSERT INTO bots (
                id, name, pair, status,
                position_size_usd, max_positions, stop_loss_pct, take_profit_pct,
                cooldown_minutes, trade_step_pct, signal_config,
                current_combined_score, temperature, position_status,
                pending_action, window_start_ts, last_trade_ts, last_trade_price,
                created_at
            ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            ON CONFLICT(id) DO UPDATE SET
                name = excluded.name,
                pair = excluded.pair,
                status = excluded.status,
                position_size_usd = excluded.position_size_usd,
                max_positions = excluded.max_positions,
                stop_loss_pct = excluded.stop_loss_pct,
                take_profit_pct = excluded.take_profit_pct,
                cooldown_minutes = excluded.cooldown_minutes,
                trade_step_pct = excluded.trade_step_pct,
                signal_config = excluded.signal_config,
                current_combined_score = excluded.current_combined_score,
                temperature = excluded.temperature,
                position_status = excluded.position_status,
                pending_action = excluded.pending_action,
                window_start_ts = excluded.window_start_ts,
                last_trade_ts = excluded.last_trade_ts,
                last_trade_price = excluded.last_trade_price
            "#,
        )
        .bind(bot.id.to_string())
        .bind(&bot.name)
        .bind(&bot.pair)
        .bind(bot.status.to_string())
        .bind(bot.position_size_usd)
        .bind(bot.max_positions as i64)
        .bind(bot.stop_loss_pct)
        .bind(bot.take_profit_pct)
        .bind(bot.cooldown_minutes)
        .bind(bot.trade_step_pct)
        .bind(signal_config)
        .bind(bot.current_combined_score)
        .bind(bot.temperature.to_string())
        .bind(bot.position_status.to_string())
        .bind(bot.pending_action.map(|a| a.to_string()))
        .bind(bot.window_start_ts.map(|t| t.to_rfc3339()))
        .bind(bot.last_trade_ts.map(|t| t.to_rfc3339()))
        .bind(bot.last_trade_price)
        .bind(bot.created_at.to_rfc3339())
        .execute(&self.pool)
        .await?;

        debug!(bot_id = %bot.id, "bot upserted");
        Ok(())
    }

    /// Load all bots with their open tranches attached.
    pub async fn load_bots(&self) -> Result<Vec<Bot>, StoreError> {
        let rows = sqlx::query("SELECT * FROM bots ORDER BY name")
            .fetch_all(&self.pool)
            .await?;

        let mut bots = Vec::with_capacity(rows.len());
        for row in rows {
            let mut bot = bot_from_row(&row)?;
            bot.tranches = self.open_tranches(bot.id).await?;
            bots.push(bot);
        }

        info!(count = bots.len(), "bots loaded from store");
        Ok(bots)
    }

    /// Delete a bot and its tranches.  Trades and decisions remain for audit.
    pub async fn delete_bot(&self, id: Uuid) -> Result<(), StoreError> {
        let mut tx = self.pool.begin().await?;
        sqlx::query("DELETE FROM tranches WHERE bot_id = ?")
            .bind(id.to_string())
            .execute(&mut *tx)
            .await?;
        sqlx::query("DELETE FROM bots WHERE id = ?")
            .bind(id.to_string())
            .execute(&mut *tx)
            .await?;
        tx.commit().await?;
        info!(bot_id = %id, "bot deleted");
        Ok(())
    }

    // -------------------------------------------------------------------------
    // Tranches
    // -------------------------------------------------------------------------

    pub async fn open_tranches(&self, bot_id: Uuid) -> Result<Vec<Tranche>, StoreError> {
        let rows = sqlx::query(
            "SELECT * FROM tranches WHERE bot_id = ? AND status = 'open' ORDER BY entry_ts",
        )
        .bind(bot_id.to_string())
        .fetch_all(&self.pool)
        .await?;

        rows.iter().map(tranche_from_row).collect()
    }

    // -------------------------------------------------------------------------
    // Trades
    // -------------------------------------------------------------------------

    /// Persist a freshly-created pending trade.
    pub async fn insert_trade(&self, trade: &Trade) -> Result<(), StoreError> {
        sqlx::query(
            r#"
            INSERT INTO trades (
                id, bot_id, pair, side, size_usd, price, fee,
                exchange_order_id, status, composite_score, realized_pnl,
                created_ts, filled_ts
            ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(trade.id.to_string())
        .bind(trade.bot_id.to_string())
        .bind(&trade.pair)
        .bind(trade.side.to_string())
        .bind(trade.size_usd)
        .bind(trade.price)
        .bind(trade.fee)
        .bind(trade.exchange_order_id.as_deref())
        .bind(trade.status.to_string())
        .bind(trade.composite_score_at_decision)
        .bind(trade.realized_pnl)
        .bind(trade.created_ts.to_rfc3339())
        .bind(trade.filled_ts.map(|t| t.to_rfc3339()))
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    /// Mark a trade failed.  Tranches are untouched by design.
    pub async fn mark_trade_failed(&self, trade_id: Uuid) -> Result<(), StoreError> {
        sqlx::query("UPDATE trades SET status = 'failed' WHERE id = ?")
            .bind(trade_id.to_string())
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    /// Apply a fill atomically: trade row, tranche mutation, and the bot's
    /// live fields all commit or none do.
    pub async fn commit_fill(
        &self,
        trade: &Trade,
        mutation: TrancheMutation<'_>,
        bot: &Bot,
    ) -> Result<(), StoreError> {
        let mut tx = self.pool.begin().await?;

        sqlx::query(
            r#"
            UPDATE trades SET
                status = ?, price = ?, fee = ?, exchange_order_id = ?,
                realized_pnl = ?, filled_ts = ?
            WHERE id = ?
            "#,
        )
        .bind(trade.status.to_string())
        .bind(trade.price)
        .bind(trade.fee)
        .bind(trade.exchange_order_id.as_deref())
        .bind(trade.realized_pnl)
        .bind(trade.filled_ts.map(|t| t.to_rfc3339()))
        .bind(trade.id.to_string())
        .execute(&mut *tx)
        .await?;

        match mutation {
            TrancheMutation::Open(tranche) => {
                sqlx::query(
                    r#"
                    INSERT INTO tranches (
                        id, bot_id, entry_trade_id, size_usd, entry_price,
                        entry_ts, status
                    ) VALUES (?, ?, ?, ?, ?, ?, ?)
                    "#,
                )
                .bind(tranche.id.to_string())
                .bind(tranche.bot_id.to_string())
                .bind(tranche.entry_trade_id.to_string())
                .bind(tranche.size_usd)
                .bind(tranche.entry_price)
                .bind(tranche.entry_ts.to_rfc3339())
                .bind(match tranche.status {
                    TrancheStatus::Open => "open",
                    TrancheStatus::Closed => "closed",
                })
                .execute(&mut *tx)
                .await?;
            }
            TrancheMutation::Close { tranche_id } => {
                sqlx::query("UPDATE tranches SET status = 'closed' WHERE id = ?")
                    .bind(tranche_id.to_string())
                    .execute(&mut *tx)
                    .await?;
            }
        }

        sqlx::query(
            r#"
            UPDATE bots SET
                current_combined_score = ?, temperature = ?, position_status = ?,
                pending_action = ?, window_start_ts = ?,
                last_trade_ts = ?, last_trade_price = ?
            WHERE id = ?
            "#,
        )
        .bind(bot.current_combined_score)
        .bind(bot.temperature.to_string())
        .bind(bot.position_status.to_string())
        .bind(bot.pending_action.map(|a| a.to_string()))
        .bind(bot.window_start_ts.map(|t| t.to_rfc3339()))
        .bind(bot.last_trade_ts.map(|t| t.to_rfc3339()))
        .bind(bot.last_trade_price)
        .bind(bot.id.to_string())
        .execute(&mut *tx)
        .await?;

        tx.commit().await?;
        debug!(trade_id = %trade.id, bot_id = %bot.id, "fill committed");
        Ok(())
    }

    /// Most recent trades for a bot, newest first.
    pub async fn trades_for_bot(&self, bot_id: Uuid, limit: u32) -> Result<Vec<Trade>, StoreError> {
        let rows = sqlx::query(
            "SELECT * FROM trades WHERE bot_id = ? ORDER BY created_ts DESC LIMIT ?",
        )
        .bind(bot_id.to_string())
        .bind(limit as i64)
        .fetch_all(&self.pool)
        .await?;

        rows.iter().map(trade_from_row).collect()
    }

    /// Today's filled trade count and realized P&L, for seeding the daily
    /// ledger after a restart.
    pub async fn daily_trade_stats(&self) -> Result<(u32, f64), StoreError> {
        let start_of_day = Utc::now()
            .date_naive()
            .and_hms_opt(0, 0, 0)
            .map(|dt| dt.and_utc().to_rfc3339())
            .unwrap_or_default();

        let row = sqlx::query(
            r#"
            SELECT COUNT(*) AS n, COALESCE(SUM(realized_pnl), 0.0) AS pnl
            FROM trades
            WHERE status = 'filled' AND created_ts >= ?
            "#,
        )
        .bind(start_of_day)
        .fetch_one(&self.pool)
        .await?;

        let n: i64 = row.get("n");
        let pnl: f64 = row.get("pnl");
        Ok((n as u32, pnl))
    }

    // -------------------------------------------------------------------------
    // Decision history
    // -------------------------------------------------------------------------

    /// Append one decision record (the full record as JSON).
    pub async fn append_decision(&self, record: &DecisionRecord) -> Result<(), StoreError> {
        let json = serde_json::to_string(record)?;
        sqlx::query(
            "INSERT INTO decision_history (id, bot_id, ts, record) VALUES (?, ?, ?, ?)",
        )
        .bind(record.id.to_string())
        .bind(record.bot_id.to_string())
        .bind(record.created_at.to_rfc3339())
        .bind(json)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    /// Most recent decisions for a bot, newest first.
    pub async fn decisions_for_bot(
        &self,
        bot_id: Uuid,
        limit: u32,
    ) -> Result<Vec<DecisionRecord>, StoreError> {
        let rows = sqlx::query(
            "SELECT record FROM decision_history WHERE bot_id = ? ORDER BY ts DESC LIMIT ?",
        )
        .bind(bot_id.to_string())
        .bind(limit as i64)
        .fetch_all(&self.pool)
        .await?;

        rows.iter()
            .map(|row| {
                let json: String = row.get("record");
                serde_json::from_str(&json).map_err(StoreError::from)
            })
            .collect()
    }

    /// Delete decisions older than the retention window.
    pub async fn prune_decisions(&self, retention_days: u32) -> Result<u64, StoreError> {
        let cutoff = (Utc::now() - Duration::days(retention_days as i64)).to_rfc3339();
        let result = sqlx::query("DELETE FROM decision_history WHERE ts < ?")
            .bind(cutoff)
            .execute(&self.pool)
            .await?;
        let pruned = result.rows_affected();
        if pruned > 0 {
            debug!(pruned, retention_days, "decision history pruned");
        }
        Ok(pruned)
    }
}

impl std::fmt::Debug for Store {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Store").finish_non_exhaustive()
    }
}

// ---------------------------------------------------------------------------
// Row mapping
// ---------------------------------------------------------------------------

fn parse_uuid(s: &str) -> Result<Uuid, StoreError> {
    Uuid::parse_str(s).map_err(|e| StoreError::Corrupt(format!("bad uuid '{s}': {e}")))
}

fn parse_ts(s: &str) -> Result<DateTime<Utc>, StoreError> {
    DateTime::parse_from_rfc3339(s)
        .map(|t| t.with_timezone(&Utc))
        .map_err(|e| StoreError::Corrupt(format!("bad timestamp '{s}': {e}")))
}

fn parse_opt_ts(s: Option<String>) -> Result<Option<DateTime<Utc>>, StoreError> {
    s.map(|v| parse_ts(&v)).transpose()
}

fn bot_from_row(row: &SqliteRow) -> Result<Bot, StoreError> {
    let id: String = row.get("id");
    let status: String = row.get("status");
    let temperature: String = row.get("temperature");
    let position_status: String = row.get("position_status");
    let signal_config: String = row.get("signal_config");
    let pending_action: Option<String> = row.get("pending_action");
    let window_start_ts: Option<String> = row.get("window_start_ts");
    let last_trade_ts: Option<String> = row.get("last_trade_ts");
    let created_at: String = row.get("created_at");

    Ok(Bot {
        id: parse_uuid(&id)?,
        name: row.get("name"),
        pair: row.get("pair"),
        status: match status.as_str() {
            "running" => BotStatus::Running,
            _ => BotStatus::Stopped,
        },
        position_size_usd: row.get("position_size_usd"),
        max_positions: row.get::<i64, _>("max_positions") as u32,
        stop_loss_pct: row.get("stop_loss_pct"),
        take_profit_pct: row.get("take_profit_pct"),
        cooldown_minutes: row.get("cooldown_minutes"),
        trade_step_pct: row.get("trade_step_pct"),
        signal_config: serde_json::from_str(&signal_config)?,
        current_combined_score: row.get("current_combined_score"),
        temperature: match temperature.as_str() {
            "hot" => Temperature::Hot,
            "warm" => Temperature::Warm,
            "cool" => Temperature::Cool,
            _ => Temperature::Frozen,
        },
        position_status: match position_status.as_str() {
            "building" => PositionStatus::Building,
            "open" => PositionStatus::Open,
            "reducing" => PositionStatus::Reducing,
            "closing" => PositionStatus::Closing,
            _ => PositionStatus::Closed,
        },
        pending_action: match pending_action.as_deref() {
            Some("buy") => Some(TradeAction::Buy),
            Some("sell") => Some(TradeAction::Sell),
            _ => None,
        },
        window_start_ts: parse_opt_ts(window_start_ts)?,
        last_trade_ts: parse_opt_ts(last_trade_ts)?,
        last_trade_price: row.get("last_trade_price"),
        tranches: Vec::new(),
        created_at: parse_ts(&created_at)?,
    })
}

fn tranche_from_row(row: &SqliteRow) -> Result<Tranche, StoreError> {
    let id: String = row.get("id");
    let bot_id: String = row.get("bot_id");
    let entry_trade_id: String = row.get("entry_trade_id");
    let entry_ts: String = row.get("entry_ts");
    let status: String = row.get("status");

    Ok(Tranche {
        id: parse_uuid(&id)?,
        bot_id: parse_uuid(&bot_id)?,
        entry_trade_id: parse_uuid(&entry_trade_id)?,
        size_usd: row.get("size_usd"),
        entry_price: row.get("entry_price"),
        entry_ts: parse_ts(&entry_ts)?,
        status: match status.as_str() {
            "open" => TrancheStatus::Open,
            _ => TrancheStatus::Closed,
        },
    })
}

fn trade_from_row(row: &SqliteRow) -> Result<Trade, StoreError> {
    let id: String = row.get("id");
    let bot_id: String = row.get("bot_id");
    let side: String = row.get("side");
    let status: String = row.get("status");
    let created_ts: String = row.get("created_ts");
    let filled_ts: Option<String> = row.get("filled_ts");

    Ok(Trade {
        id: parse_uuid(&id)?,
        bot_id: parse_uuid(&bot_id)?,
        pair: row.get("pair"),
        side: match side.as_str() {
            "sell" => TradeSide::Sell,
            _ => TradeSide::Buy,
        },
        size_usd: row.get("size_usd"),
        price: row.get("price"),
        fee: row.get("fee"),
        exchange_order_id: row.get("exchange_order_id"),
        status: match status.as_str() {
            "filled" => TradeStatus::Filled,
            "failed" => TradeStatus::Failed,
            _ => TradeStatus::Pending,
        },
        composite_score_at_decision: row.get("composite_score"),
        realized_pnl: row.get("realized_pnl"),
        created_ts: parse_ts(&created_ts)?,
        filled_ts: parse_opt_ts(filled_ts)?,
    })
}

// =============================================================================
// Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::TradeSide;

    fn sample_bot() -> Bot {
        let mut bot = Bot::new("persist-test", "BTC-USD");
        bot.status = BotStatus::Running;
        bot.current_combined_score = -0.27;
        bot.temperature = Temperature::Warm;
        bot.pending_action = Some(TradeAction::Buy);
        bot.window_start_ts = Some(Utc::now());
        bot
    }

    fn sample_trade(bot: &Bot) -> Trade {
        Trade {
            id: Uuid::new_v4(),
            bot_id: bot.id,
            pair: bot.pair.clone(),
            side: TradeSide::Buy,
            size_usd: 100.0,
            price: 30_000.0,
            fee: 0.1,
            exchange_order_id: Some(format!("ex-{}", Uuid::new_v4())),
            status: TradeStatus::Pending,
            composite_score_at_decision: Some(-0.27),
            realized_pnl: None,
            created_ts: Utc::now(),
            filled_ts: None,
        }
    }

    fn sample_tranche(bot: &Bot, trade: &Trade) -> Tranche {
        Tranche {
            id: Uuid::new_v4(),
            bot_id: bot.id,
            entry_trade_id: trade.id,
            size_usd: trade.size_usd,
            entry_price: trade.price,
            entry_ts: Utc::now(),
            status: TrancheStatus::Open,
        }
    }

    #[tokio::test]
    async fn bot_roundtrip_preserves_config_and_window() {
        let store = Store::in_memory().await.unwrap();
        let bot = sample_bot();
        store.upsert_bot(&bot).await.unwrap();

        let loaded = store.load_bots().await.unwrap();
        assert_eq!(loaded.len(), 1);
        let back = &loaded[0];
        assert_eq!(back.id, bot.id);
        assert_eq!(back.status, BotStatus::Running);
        assert_eq!(back.pending_action, Some(TradeAction::Buy));
        assert!(back.window_start_ts.is_some());
        assert_eq!(
            back.signal_config.rsi.params.period,
            bot.signal_config.rsi.params.period
        );
        assert!((back.current_combined_score - (-0.27)).abs() < 1e-9);
    }

    #[tokio::test]
    async fn upsert_updates_in_place() {
        let store = Store::in_memory().await.unwrap();
        let mut bot = sample_bot();
        store.upsert_bot(&bot).await.unwrap();

        bot.name = "renamed".into();
        bot.status = BotStatus::Stopped;
        store.upsert_bot(&bot).await.unwrap();

        let loaded = store.load_bots().await.unwrap();
        assert_eq!(loaded.len(), 1);
        assert_eq!(loaded[0].name, "renamed");
        assert_eq!(loaded[0].status, BotStatus::Stopped);
    }

    #[tokio::test]
    async fn buy_fill_opens_tranche_atomically() {
        let store = Store::in_memory().await.unwrap();
        let mut bot = sample_bot();
        store.upsert_bot(&bot).await.unwrap();

        let mut trade = sample_trade(&bot);
        store.insert_trade(&trade).await.unwrap();

        trade.status = TradeStatus::Filled;
        trade.filled_ts = Some(Utc::now());
        let tranche = sample_tranche(&bot, &trade);
        bot.position_status = PositionStatus::Building;
        bot.last_trade_ts = Some(Utc::now());
        bot.last_trade_price = Some(trade.price);

        store
            .commit_fill(&trade, TrancheMutation::Open(&tranche), &bot)
            .await
            .unwrap();

        let tranches = store.open_tranches(bot.id).await.unwrap();
        assert_eq!(tranches.len(), 1);
        assert!((tranches[0].size_usd - 100.0).abs() < 1e-9);

        let trades = store.trades_for_bot(bot.id, 10).await.unwrap();
        assert_eq!(trades[0].status, TradeStatus::Filled);

        let loaded = store.load_bots().await.unwrap();
        assert_eq!(loaded[0].position_status, PositionStatus::Building);
        assert_eq!(loaded[0].tranches.len(), 1);
    }

    #[tokio::test]
    async fn sell_fill_closes_tranche() {
        let store = Store::in_memory().await.unwrap();
        let mut bot = sample_bot();
        store.upsert_bot(&bot).await.unwrap();

        let mut buy = sample_trade(&bot);
        store.insert_trade(&buy).await.unwrap();
        buy.status = TradeStatus::Filled;
        let tranche = sample_tranche(&bot, &buy);
        store
            .commit_fill(&buy, TrancheMutation::Open(&tranche), &bot)
            .await
            .unwrap();

        let mut sell = sample_trade(&bot);
        sell.side = TradeSide::Sell;
        store.insert_trade(&sell).await.unwrap();
        sell.status = TradeStatus::Filled;
        sell.realized_pnl = Some(12.5);
        bot.position_status = PositionStatus::Closed;
        store
            .commit_fill(
                &sell,
                TrancheMutation::Close {
                    tranche_id: tranche.id,
                },
                &bot,
            )
            .await
            .unwrap();

        assert!(store.open_tranches(bot.id).await.unwrap().is_empty());

        let (count, pnl) = store.daily_trade_stats().await.unwrap();
        assert_eq!(count, 2);
        assert!((pnl - 12.5).abs() < 1e-9);
    }

    #[tokio::test]
    async fn failed_trade_leaves_tranches_untouched() {
        let store = Store::in_memory().await.unwrap();
        let bot = sample_bot();
        store.upsert_bot(&bot).await.unwrap();

        let trade = sample_trade(&bot);
        store.insert_trade(&trade).await.unwrap();
        store.mark_trade_failed(trade.id).await.unwrap();

        let trades = store.trades_for_bot(bot.id, 10).await.unwrap();
        assert_eq!(trades[0].status, TradeStatus::Failed);
        assert!(store.open_tranches(bot.id).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn decisions_append_list_and_prune() {
        let store = Store::in_memory().await.unwrap();
        let bot = sample_bot();
        store.upsert_bot(&bot).await.unwrap();

        for _ in 0..3 {
            let record = DecisionRecord::faulted(&bot, "stale_data", Utc::now());
            store.append_decision(&record).await.unwrap();
        }

        let decisions = store.decisions_for_bot(bot.id, 10).await.unwrap();
        assert_eq!(decisions.len(), 3);
        assert_eq!(decisions[0].fault.as_deref(), Some("stale_data"));

        // Nothing is older than 30 days yet.
        let pruned = store.prune_decisions(30).await.unwrap();
        assert_eq!(pruned, 0);
        // A zero-day retention wipes everything.
        let pruned = store.prune_decisions(0).await.unwrap();
        assert_eq!(pruned, 3);
    }

    #[tokio::test]
    async fn delete_bot_cascades_to_tranches() {
        let store = Store::in_memory().await.unwrap();
        let bot = sample_bot();
        store.upsert_bot(&bot).await.unwrap();

        let mut trade = sample_trade(&bot);
        store.insert_trade(&trade).await.unwrap();
        trade.status = TradeStatus::Filled;
        let tranche = sample_tranche(&bot, &trade);
        store
            .commit_fill(&trade, TrancheMutation::Open(&tranche), &bot)
            .await
            .unwrap();

        store.delete_bot(bot.id).await.unwrap();
        assert!(store.load_bots().await.unwrap().is_empty());
        assert!(store.open_tranches(bot.id).await.unwrap().is_empty());
        // Trades remain for audit.
        assert_eq!(store.trades_for_bot(bot.id, 10).await.unwrap().len(), 1);
    }
}
