// =============================================================================
// Signal pipeline — pure scoring functions and per-bot signal configuration
// =============================================================================
//
// Each signal is a pure function from a candle series to a bounded opinion in
// [-1, +1]: negative = buy pressure, positive = sell pressure, so the sign of
// the composite matches the action thresholds directly.
//
// Signals are a closed set of kinds with one parameter record each and a
// dispatch match — no trait objects, trivially testable.
//
// A signal that lacks data declares itself Insufficient and is *omitted* from
// the composite (the remaining weights re-normalize); it never contributes a
// fake zero.
// =============================================================================

pub mod ema;
pub mod ma_cross;
pub mod macd;
pub mod rsi;

use serde::{Deserialize, Serialize};

use crate::market::types::CandleSeries;
pub use ma_cross::MaCrossParams;
pub use macd::MacdParams;
pub use rsi::RsiParams;

// ---------------------------------------------------------------------------
// Score types
// ---------------------------------------------------------------------------

/// One signal's opinion, with audit metadata.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SignalScore {
    pub name: String,
    /// Bounded opinion in [-1, +1]; negative = buy pressure.
    pub score: f64,
    /// Configured weight before re-normalization.
    pub weight: f64,
    /// Indicator internals for the decision audit trail.
    pub metadata: serde_json::Value,
}

/// Outcome of evaluating one signal.
#[derive(Debug, Clone)]
pub enum SignalOutcome {
    Score(SignalScore),
    /// Not enough candles (or degenerate parameters) — omit this signal.
    Insufficient,
}

impl SignalOutcome {
    pub fn score(&self) -> Option<&SignalScore> {
        match self {
            Self::Score(s) => Some(s),
            Self::Insufficient => None,
        }
    }
}

// ---------------------------------------------------------------------------
// Kinds
// ---------------------------------------------------------------------------

/// The closed set of signal families.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SignalKind {
    Rsi,
    MaCross,
    Macd,
}

impl SignalKind {
    /// Fixed evaluation order, so composites are reproducible.
    pub const ALL: [SignalKind; 3] = [Self::Rsi, Self::MaCross, Self::Macd];
}

// ---------------------------------------------------------------------------
// Per-bot configuration
// ---------------------------------------------------------------------------

fn default_true() -> bool {
    true
}

fn default_rsi_weight() -> f64 {
    0.4
}

fn default_ma_cross_weight() -> f64 {
    0.35
}

fn default_macd_weight() -> f64 {
    0.25
}

fn default_buy_threshold() -> f64 {
    -0.1
}

fn default_sell_threshold() -> f64 {
    0.1
}

fn default_confirmation_minutes() -> f64 {
    2.0
}

/// RSI slot in a bot's signal configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RsiSlot {
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default = "default_rsi_weight")]
    pub weight: f64,
    #[serde(default)]
    pub params: RsiParams,
}

impl Default for RsiSlot {
    fn default() -> Self {
        Self {
            enabled: true,
            weight: default_rsi_weight(),
            params: RsiParams::default(),
        }
    }
}

/// MA-cross slot.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MaCrossSlot {
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default = "default_ma_cross_weight")]
    pub weight: f64,
    #[serde(default)]
    pub params: MaCrossParams,
}

impl Default for MaCrossSlot {
    fn default() -> Self {
        Self {
            enabled: true,
            weight: default_ma_cross_weight(),
            params: MaCrossParams::default(),
        }
    }
}

/// MACD slot.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MacdSlot {
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default = "default_macd_weight")]
    pub weight: f64,
    #[serde(default)]
    pub params: MacdParams,
}

impl Default for MacdSlot {
    fn default() -> Self {
        Self {
            enabled: true,
            weight: default_macd_weight(),
            params: MacdParams::default(),
        }
    }
}

/// A bot's full signal configuration: weights, parameters, thresholds.
///
/// Stored as structured JSON in the bots table; every field has a serde
/// default so older rows keep deserialising.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SignalConfig {
    #[serde(default)]
    pub rsi: RsiSlot,
    #[serde(default)]
    pub ma_cross: MaCrossSlot,
    #[serde(default)]
    pub macd: MacdSlot,

    /// Composite at or below this promotes a buy candidate.  Must be <= 0.
    #[serde(default = "default_buy_threshold")]
    pub buy_threshold: f64,

    /// Composite at or above this promotes a sell candidate.  Must be >= 0.
    #[serde(default = "default_sell_threshold")]
    pub sell_threshold: f64,

    /// How long a candidate action must persist before promotion.
    #[serde(default = "default_confirmation_minutes")]
    pub confirmation_minutes: f64,
}

impl Default for SignalConfig {
    fn default() -> Self {
        Self {
            rsi: RsiSlot::default(),
            ma_cross: MaCrossSlot::default(),
            macd: MacdSlot::default(),
            buy_threshold: default_buy_threshold(),
            sell_threshold: default_sell_threshold(),
            confirmation_minutes: default_confirmation_minutes(),
        }
    }
}

impl SignalConfig {
    /// Validate the cross-field invariants.  An `Err` here is an
    /// invariant violation: the offending bot must not run.
    pub fn validate(&self) -> Result<(), String> {
        let weights = [
            (self.rsi.enabled, self.rsi.weight),
            (self.ma_cross.enabled, self.ma_cross.weight),
            (self.macd.enabled, self.macd.weight),
        ];

        for (_, w) in weights.iter().filter(|(enabled, _)| *enabled) {
            if !w.is_finite() || *w < 0.0 {
                return Err(format!("signal weight {w} is not a non-negative number"));
            }
        }

        let total: f64 = weights
            .iter()
            .filter(|(enabled, _)| *enabled)
            .map(|(_, w)| w)
            .sum();
        if total > 1.0 + 1e-9 {
            return Err(format!("enabled signal weights sum to {total:.4} (> 1.0)"));
        }

        if !(self.buy_threshold <= 0.0) {
            return Err(format!("buy_threshold {} must be <= 0", self.buy_threshold));
        }
        if !(self.sell_threshold >= 0.0) {
            return Err(format!("sell_threshold {} must be >= 0", self.sell_threshold));
        }

        if self.confirmation_minutes < 0.0 || !self.confirmation_minutes.is_finite() {
            return Err(format!(
                "confirmation_minutes {} must be a non-negative number",
                self.confirmation_minutes
            ));
        }

        Ok(())
    }

    /// Whether a kind participates in evaluation at all.
    pub fn is_enabled(&self, kind: SignalKind) -> bool {
        match kind {
            SignalKind::Rsi => self.rsi.enabled,
            SignalKind::MaCross => self.ma_cross.enabled,
            SignalKind::Macd => self.macd.enabled,
        }
    }

    /// Candle history needed to satisfy every enabled signal, with headroom
    /// so smoothing has settled values to work from.
    pub fn candle_limit(&self) -> u32 {
        let mut needed = 0usize;
        if self.rsi.enabled {
            needed = needed.max(rsi::required_periods(&self.rsi.params));
        }
        if self.ma_cross.enabled {
            needed = needed.max(ma_cross::required_periods(&self.ma_cross.params));
        }
        if self.macd.enabled {
            needed = needed.max(macd::required_periods(&self.macd.params));
        }
        (needed as u32 + 10).max(50)
    }

    /// Evaluate one kind against a candle series.
    pub fn compute(&self, kind: SignalKind, series: &CandleSeries) -> SignalOutcome {
        match kind {
            SignalKind::Rsi => rsi::compute(series, &self.rsi.params, self.rsi.weight),
            SignalKind::MaCross => {
                ma_cross::compute(series, &self.ma_cross.params, self.ma_cross.weight)
            }
            SignalKind::Macd => macd::compute(series, &self.macd.params, self.macd.weight),
        }
    }

    /// Evaluate every enabled signal in the fixed kind order.
    pub fn compute_enabled(&self, series: &CandleSeries) -> Vec<SignalOutcome> {
        SignalKind::ALL
            .iter()
            .filter(|kind| self.is_enabled(**kind))
            .map(|kind| self.compute(*kind, series))
            .collect()
    }
}

// =============================================================================
// Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;
    use crate::market::types::Candle;

    fn series(n: usize) -> CandleSeries {
        (0..n)
            .map(|i| {
                let c = 100.0 + (i as f64 * 0.3).sin() * 5.0;
                Candle {
                    open: c,
                    high: c,
                    low: c,
                    close: c,
                    volume: 1.0,
                    ts: i as i64,
                }
            })
            .collect()
    }

    #[test]
    fn default_config_is_valid() {
        let cfg = SignalConfig::default();
        assert!(cfg.validate().is_ok());
        assert!((cfg.rsi.weight + cfg.ma_cross.weight + cfg.macd.weight - 1.0).abs() < 1e-9);
    }

    #[test]
    fn overweight_config_is_rejected() {
        let mut cfg = SignalConfig::default();
        cfg.rsi.weight = 0.8;
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn disabled_signals_do_not_count_toward_the_weight_cap() {
        let mut cfg = SignalConfig::default();
        cfg.rsi.weight = 0.8;
        cfg.ma_cross.enabled = false;
        cfg.macd.enabled = false;
        assert!(cfg.validate().is_ok());
    }

    #[test]
    fn threshold_ordering_is_enforced() {
        let mut cfg = SignalConfig::default();
        cfg.buy_threshold = 0.2;
        assert!(cfg.validate().is_err());

        let mut cfg = SignalConfig::default();
        cfg.sell_threshold = -0.2;
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn candle_limit_covers_the_slowest_signal() {
        let cfg = SignalConfig::default();
        // MACD needs 35; plus headroom.
        assert!(cfg.candle_limit() >= 45);

        let mut cfg = SignalConfig::default();
        cfg.macd.params.slow_period = 100;
        assert!(cfg.candle_limit() >= 110);
    }

    #[test]
    fn compute_enabled_respects_flags_and_order() {
        let mut cfg = SignalConfig::default();
        cfg.ma_cross.enabled = false;

        let outcomes = cfg.compute_enabled(&series(120));
        assert_eq!(outcomes.len(), 2);
        let names: Vec<_> = outcomes
            .iter()
            .filter_map(|o| o.score().map(|s| s.name.clone()))
            .collect();
        assert_eq!(names, vec!["rsi", "macd"]);
    }

    #[test]
    fn config_roundtrips_through_json() {
        let cfg = SignalConfig::default();
        let json = serde_json::to_string(&cfg).unwrap();
        let back: SignalConfig = serde_json::from_str(&json).unwrap();
        assert_eq!(back.rsi.params.period, cfg.rsi.params.period);
        assert!((back.buy_threshold - cfg.buy_threshold).abs() < f64::EPSILON);
    }

    #[test]
    fn empty_json_uses_defaults() {
        let cfg: SignalConfig = serde_json::from_str("{}").unwrap();
        assert!(cfg.rsi.enabled);
        assert!((cfg.confirmation_minutes - 2.0).abs() < f64::EPSILON);
    }
}
