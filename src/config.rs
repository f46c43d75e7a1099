// =============================================================================
// Engine Configuration — Hot-reloadable settings with atomic save
// =============================================================================
//
// Every process-wide tunable lives here: the upstream request budget, cache
// TTLs, tick cadences, global safety caps, and execution options.  All fields
// carry `#[serde(default)]` so that adding new fields never breaks loading an
// older config file.
//
// Persistence uses an atomic tmp + rename pattern to prevent corruption on
// crash.
// =============================================================================

use std::path::Path;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use tracing::info;

use crate::types::Temperature;

// =============================================================================
// Default-value helpers (required by serde `default = "..."` attribute)
// =============================================================================

fn default_rate_limit_per_minute() -> u32 {
    10
}

fn default_fast_tick_ms() -> u64 {
    5_000
}

fn default_slow_tick_ms() -> u64 {
    60_000
}

fn default_max_active_positions() -> u32 {
    10
}

fn default_max_daily_trades() -> u32 {
    50
}

fn default_max_daily_loss_usd() -> f64 {
    250.0
}

fn default_min_tranche_usd() -> f64 {
    10.0
}

fn default_max_position_tranches() -> u32 {
    3
}

fn default_tranche_cooldown_min() -> u32 {
    15
}

fn default_evaluator_parallelism() -> usize {
    4
}

fn default_temperature_floor() -> Temperature {
    Temperature::Warm
}

fn default_true() -> bool {
    true
}

fn default_bind_addr() -> String {
    "0.0.0.0:3001".to_string()
}

fn default_database_path() -> String {
    "sqlite://meridian.db?mode=rwc".to_string()
}

fn default_decision_retention_days() -> u32 {
    30
}

fn default_ttl_ticker_ms() -> u64 {
    30_000
}

fn default_ttl_candles_ms() -> u64 {
    300_000
}

fn default_ttl_accounts_ms() -> u64 {
    120_000
}

fn default_ttl_balance_ms() -> u64 {
    60_000
}

// =============================================================================
// CacheTtls
// =============================================================================

/// Per-kind cache TTLs in milliseconds.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CacheTtls {
    #[serde(default = "default_ttl_ticker_ms")]
    pub ticker_ms: u64,
    #[serde(default = "default_ttl_candles_ms")]
    pub candles_ms: u64,
    #[serde(default = "default_ttl_accounts_ms")]
    pub accounts_ms: u64,
    #[serde(default = "default_ttl_balance_ms")]
    pub balance_ms: u64,
}

impl Default for CacheTtls {
    fn default() -> Self {
        Self {
            ticker_ms: default_ttl_ticker_ms(),
            candles_ms: default_ttl_candles_ms(),
            accounts_ms: default_ttl_accounts_ms(),
            balance_ms: default_ttl_balance_ms(),
        }
    }
}

// =============================================================================
// TrancheCloseOrder
// =============================================================================

/// Which open tranche a sell closes first.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TrancheCloseOrder {
    /// Oldest entry timestamp first.
    Fifo,
    /// Lowest entry price first.
    LowestEntry,
}

impl Default for TrancheCloseOrder {
    fn default() -> Self {
        Self::Fifo
    }
}

// =============================================================================
// EngineConfig
// =============================================================================

/// Top-level configuration for the Meridian engine.
///
/// Every field has a serde default so that older JSON files missing new fields
/// still deserialise correctly.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineConfig {
    // --- Upstream request budget ---------------------------------------------

    /// Global upstream call budget: tokens refilled per minute.
    #[serde(default = "default_rate_limit_per_minute")]
    pub rate_limit_per_minute: u32,

    /// Token-bucket burst capacity. Defaults to the per-minute rate.
    #[serde(default)]
    pub rate_limit_burst: Option<u32>,

    /// Per-kind cache TTLs.
    #[serde(default)]
    pub cache_ttls: CacheTtls,

    // --- Tick cadences -------------------------------------------------------

    /// Fast tick period: the evaluation sweep over all running bots.
    #[serde(default = "default_fast_tick_ms")]
    pub fast_tick_ms: u64,

    /// Slow tick period: proactive cache warming for long-TTL keys.
    #[serde(default = "default_slow_tick_ms")]
    pub slow_tick_ms: u64,

    // --- Global safety caps --------------------------------------------------

    /// Maximum open positions across all bots.
    #[serde(default = "default_max_active_positions")]
    pub max_active_positions: u32,

    /// Maximum trades per UTC day across all bots.
    #[serde(default = "default_max_daily_trades")]
    pub max_daily_trades: u32,

    /// Maximum realised loss per UTC day in quote currency.
    #[serde(default = "default_max_daily_loss_usd")]
    pub max_daily_loss_usd: f64,

    /// Smallest tranche the engine will open.
    #[serde(default = "default_min_tranche_usd")]
    pub min_tranche_usd: f64,

    /// Maximum open tranches per bot.
    #[serde(default = "default_max_position_tranches")]
    pub max_position_tranches: u32,

    /// Minimum minutes between tranche-opening buys for one bot.
    #[serde(default = "default_tranche_cooldown_min")]
    pub tranche_cooldown_min: u32,

    /// Coldest temperature an intent may carry and still trade.
    #[serde(default = "default_temperature_floor")]
    pub temperature_floor: Temperature,

    // --- Evaluation ----------------------------------------------------------

    /// Bounded parallelism of the per-bot evaluation workers.
    #[serde(default = "default_evaluator_parallelism")]
    pub evaluator_parallelism: usize,

    // --- Execution -----------------------------------------------------------

    /// When true, orders are simulated locally with an immediate fill at the
    /// intent price; nothing reaches the exchange. Default ON for safety.
    #[serde(default = "default_true")]
    pub dry_run: bool,

    /// Scale intended size down for Warm-temperature intents.
    #[serde(default)]
    pub scale_by_temperature: bool,

    /// Which open tranche a sell closes first.
    #[serde(default)]
    pub tranche_close_order: TrancheCloseOrder,

    // --- Housekeeping --------------------------------------------------------

    /// Days of decision history retained before pruning.
    #[serde(default = "default_decision_retention_days")]
    pub decision_retention_days: u32,

    /// Control API bind address.
    #[serde(default = "default_bind_addr")]
    pub bind_addr: String,

    /// SQLite connection string.
    #[serde(default = "default_database_path")]
    pub database_path: String,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            rate_limit_per_minute: default_rate_limit_per_minute(),
            rate_limit_burst: None,
            cache_ttls: CacheTtls::default(),
            fast_tick_ms: default_fast_tick_ms(),
            slow_tick_ms: default_slow_tick_ms(),
            max_active_positions: default_max_active_positions(),
            max_daily_trades: default_max_daily_trades(),
            max_daily_loss_usd: default_max_daily_loss_usd(),
            min_tranche_usd: default_min_tranche_usd(),
            max_position_tranches: default_max_position_tranches(),
            tranche_cooldown_min: default_tranche_cooldown_min(),
            temperature_floor: default_temperature_floor(),
            evaluator_parallelism: default_evaluator_parallelism(),
            dry_run: true,
            scale_by_temperature: false,
            tranche_close_order: TrancheCloseOrder::default(),
            decision_retention_days: default_decision_retention_days(),
            bind_addr: default_bind_addr(),
            database_path: default_database_path(),
        }
    }
}

impl EngineConfig {
    /// Effective burst capacity: configured value or the per-minute rate.
    pub fn burst(&self) -> u32 {
        self.rate_limit_burst
            .unwrap_or(self.rate_limit_per_minute)
            .max(1)
    }

    /// Load configuration from a JSON file at `path`.
    ///
    /// If the file does not exist, returns an error so the caller can fall
    /// back to defaults with a warning.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();

        let content = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read engine config from {}", path.display()))?;

        let config: Self = serde_json::from_str(&content)
            .with_context(|| format!("failed to parse engine config from {}", path.display()))?;

        info!(
            path = %path.display(),
            rate_limit_per_minute = config.rate_limit_per_minute,
            fast_tick_ms = config.fast_tick_ms,
            dry_run = config.dry_run,
            "engine config loaded"
        );

        Ok(config)
    }

    /// Persist the current configuration to `path` using an atomic write
    /// (write to `.tmp`, then rename).
    pub fn save(&self, path: impl AsRef<Path>) -> Result<()> {
        let path = path.as_ref();

        let content = serde_json::to_string_pretty(self)
            .context("failed to serialise engine config to JSON")?;

        let tmp_path = path.with_extension("json.tmp");

        std::fs::write(&tmp_path, &content)
            .with_context(|| format!("failed to write tmp config to {}", tmp_path.display()))?;

        std::fs::rename(&tmp_path, path)
            .with_context(|| format!("failed to rename tmp config to {}", path.display()))?;

        info!(path = %path.display(), "engine config saved (atomic)");
        Ok(())
    }
}

// =============================================================================
// Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_has_expected_values() {
        let cfg = EngineConfig::default();
        assert_eq!(cfg.rate_limit_per_minute, 10);
        assert_eq!(cfg.burst(), 10);
        assert_eq!(cfg.fast_tick_ms, 5_000);
        assert_eq!(cfg.slow_tick_ms, 60_000);
        assert_eq!(cfg.max_position_tranches, 3);
        assert_eq!(cfg.temperature_floor, Temperature::Warm);
        assert_eq!(cfg.tranche_close_order, TrancheCloseOrder::Fifo);
        assert!(cfg.dry_run);
        assert_eq!(cfg.cache_ttls.ticker_ms, 30_000);
        assert_eq!(cfg.cache_ttls.candles_ms, 300_000);
    }

    #[test]
    fn deserialise_empty_json_uses_defaults() {
        let cfg: EngineConfig = serde_json::from_str("{}").unwrap();
        assert_eq!(cfg.rate_limit_per_minute, 10);
        assert_eq!(cfg.evaluator_parallelism, 4);
        assert!(cfg.dry_run);
    }

    #[test]
    fn deserialise_partial_json_fills_defaults() {
        let json = r#"{ "rate_limit_per_minute": 8, "dry_run": false }"#;
        let cfg: EngineConfig = serde_json::from_str(json).unwrap();
        assert_eq!(cfg.rate_limit_per_minute, 8);
        assert_eq!(cfg.burst(), 8);
        assert!(!cfg.dry_run);
        assert_eq!(cfg.max_daily_trades, 50);
    }

    #[test]
    fn explicit_burst_overrides_rate() {
        let json = r#"{ "rate_limit_per_minute": 8, "rate_limit_burst": 16 }"#;
        let cfg: EngineConfig = serde_json::from_str(json).unwrap();
        assert_eq!(cfg.burst(), 16);
    }

    #[test]
    fn roundtrip_serialisation() {
        let cfg = EngineConfig::default();
        let json = serde_json::to_string(&cfg).unwrap();
        let cfg2: EngineConfig = serde_json::from_str(&json).unwrap();
        assert_eq!(cfg.rate_limit_per_minute, cfg2.rate_limit_per_minute);
        assert_eq!(cfg.tranche_close_order, cfg2.tranche_close_order);
        assert_eq!(cfg.temperature_floor, cfg2.temperature_floor);
    }
}
