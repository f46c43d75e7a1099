// =============================================================================
// Evaluator — per-bot composite scoring, confirmation window, temperature
// =============================================================================
//
// The scoring pass is pure: given the same snapshot and configuration it
// produces identical output, which keeps every decision reproducible from
// the audit trail.  Window state lives on the bot and is advanced separately
// by `apply_confirmation`, under the bot's tick lock.
//
// Composite = sum(w_i * s_i) / sum(w_i) over the enabled-and-available
// signals.  Unavailable signals are omitted and the remaining weights
// re-normalize; with nothing available the bot holds.
// =============================================================================

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::debug;
use uuid::Uuid;

use crate::bot::Bot;
use crate::market::types::PairData;
use crate::signals::{SignalConfig, SignalScore};
use crate::types::{Temperature, TradeAction};

// ---------------------------------------------------------------------------
// Output types
// ---------------------------------------------------------------------------

/// Result of one pure scoring pass.
#[derive(Debug, Clone)]
pub struct Evaluation {
    /// Re-normalized composite, `None` when no signal had enough data.
    pub composite: Option<f64>,
    /// Scores that participated, in fixed kind order.
    pub signals: Vec<SignalScore>,
    /// Action the composite maps to this tick (before confirmation).
    pub candidate: TradeAction,
    pub temperature: Temperature,
}

/// Auditable record of one evaluation, persisted to decision history.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DecisionRecord {
    pub id: Uuid,
    pub bot_id: Uuid,
    pub pair: String,
    /// Candidate action this tick.
    pub action: TradeAction,
    /// Whether the confirmation window promoted the action.
    pub promoted: bool,
    pub composite: Option<f64>,
    pub signals: Vec<SignalScore>,
    pub temperature: Temperature,
    /// Data-plane fault that prevented evaluation (e.g. "stale_data").
    #[serde(skip_serializing_if = "Option::is_none")]
    pub fault: Option<String>,
    /// Safety-gate verdict when a promoted action was refused.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reject_reason: Option<String>,
    /// Trade produced by this decision, if any.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub trade_id: Option<Uuid>,
    pub snapshot_ts: DateTime<Utc>,
    pub created_at: DateTime<Utc>,
}

impl DecisionRecord {
    /// Record for a tick that could not evaluate (missing/stale data).
    pub fn faulted(bot: &Bot, fault: impl Into<String>, snapshot_ts: DateTime<Utc>) -> Self {
        Self {
            id: Uuid::new_v4(),
            bot_id: bot.id,
            pair: bot.pair.clone(),
            action: TradeAction::Hold,
            promoted: false,
            composite: None,
            signals: Vec::new(),
            temperature: bot.temperature,
            fault: Some(fault.into()),
            reject_reason: None,
            trade_id: None,
            snapshot_ts,
            created_at: Utc::now(),
        }
    }

    /// Record for a completed evaluation.
    pub fn from_evaluation(
        bot: &Bot,
        evaluation: &Evaluation,
        promoted: bool,
        snapshot_ts: DateTime<Utc>,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            bot_id: bot.id,
            pair: bot.pair.clone(),
            action: evaluation.candidate,
            promoted,
            composite: evaluation.composite,
            signals: evaluation.signals.clone(),
            temperature: evaluation.temperature,
            fault: None,
            reject_reason: None,
            trade_id: None,
            snapshot_ts,
            created_at: Utc::now(),
        }
    }
}

// ---------------------------------------------------------------------------
// Pure scoring
// ---------------------------------------------------------------------------

/// Combine available scores into the re-normalized composite.
///
/// Returns `None` when no score is available or the weights sum to zero.
/// The result is clamped to [-1, +1]; with each score bounded and weights
/// non-negative the clamp is a formality, but it guarantees the invariant
/// against pathological configs.
pub fn combine_scores(scores: &[SignalScore]) -> Option<f64> {
    let total_weight: f64 = scores.iter().map(|s| s.weight).sum();
    if scores.is_empty() || total_weight <= 0.0 {
        return None;
    }

    let weighted: f64 = scores.iter().map(|s| s.weight * s.score).sum();
    Some((weighted / total_weight).clamp(-1.0, 1.0))
}

/// Map a composite onto a candidate action.
pub fn action_for(composite: f64, config: &SignalConfig) -> TradeAction {
    if composite <= config.buy_threshold {
        TradeAction::Buy
    } else if composite >= config.sell_threshold {
        TradeAction::Sell
    } else {
        TradeAction::Hold
    }
}

/// Canonical temperature table.
///
/// Hot: |c| >= 0.7, or within 10 % of the threshold the composite is heading
/// for.  Warm: |c| >= 0.4.  Cool: |c| >= 0.15.  Frozen otherwise.
pub fn temperature_for(composite: f64, config: &SignalConfig) -> Temperature {
    let magnitude = composite.abs();

    if magnitude >= 0.7 {
        return Temperature::Hot;
    }

    // Distance to the threshold on the side the composite is trending toward.
    let target = if composite < 0.0 {
        config.buy_threshold.abs()
    } else {
        config.sell_threshold.abs()
    };
    if target > 0.0 && magnitude >= target * 0.9 {
        return Temperature::Hot;
    }

    if magnitude >= 0.4 {
        Temperature::Warm
    } else if magnitude >= 0.15 {
        Temperature::Cool
    } else {
        Temperature::Frozen
    }
}

/// One pure scoring pass over a pair's snapshot data.
pub fn evaluate(config: &SignalConfig, data: &PairData) -> Evaluation {
    let Some(candles) = data.candles.as_ref() else {
        return Evaluation {
            composite: None,
            signals: Vec::new(),
            candidate: TradeAction::Hold,
            temperature: Temperature::Frozen,
        };
    };

    let signals: Vec<SignalScore> = config
        .compute_enabled(candles)
        .into_iter()
        .filter_map(|outcome| outcome.score().cloned())
        .collect();

    let composite = combine_scores(&signals);

    let (candidate, temperature) = match composite {
        Some(c) => (action_for(c, config), temperature_for(c, config)),
        None => (TradeAction::Hold, Temperature::Frozen),
    };

    Evaluation {
        composite,
        signals,
        candidate,
        temperature,
    }
}

// ---------------------------------------------------------------------------
// Confirmation window
// ---------------------------------------------------------------------------

/// Advance the bot's confirmation window with this tick's candidate.
///
/// A Buy/Sell candidate must persist across consecutive agreeing ticks for
/// `confirmation_minutes` before it is promoted; any disagreeing tick
/// (including Hold) resets the window.  Returns the promoted action, if any.
pub fn apply_confirmation(
    bot: &mut Bot,
    candidate: TradeAction,
    now: DateTime<Utc>,
) -> Option<TradeAction> {
    if candidate == TradeAction::Hold {
        if bot.pending_action.is_some() {
            debug!(bot_id = %bot.id, "confirmation window reset by hold tick");
        }
        bot.clear_window();
        return None;
    }

    // A direction change restarts the window at this tick.
    if bot.pending_action != Some(candidate) {
        bot.pending_action = Some(candidate);
        bot.window_start_ts = Some(now);
    }

    let started = bot.window_start_ts.unwrap_or(now);
    let elapsed_min = (now - started).num_milliseconds() as f64 / 60_000.0;
    let required = bot.signal_config.confirmation_minutes;

    if elapsed_min >= required {
        debug!(
            bot_id = %bot.id,
            action = %candidate,
            elapsed_min,
            required_min = required,
            "confirmation window satisfied — promoting"
        );
        bot.clear_window();
        Some(candidate)
    } else {
        None
    }
}

// =============================================================================
// Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;
    use crate::market::types::{Candle, CandleSeries};

    fn score(name: &str, value: f64, weight: f64) -> SignalScore {
        SignalScore {
            name: name.to_string(),
            score: value,
            weight,
            metadata: serde_json::Value::Null,
        }
    }

    fn pair_data(n: usize) -> PairData {
        let candles: CandleSeries = (0..n)
            .map(|i| {
                let c = 100.0 + (i as f64 * 0.4).sin() * 4.0;
                Candle {
                    open: c,
                    high: c,
                    low: c,
                    close: c,
                    volume: 1.0,
                    ts: i as i64,
                }
            })
            .collect();
        PairData {
            ticker: None,
            candles: Some(candles),
        }
    }

    // ---- composite combination -------------------------------------------

    #[test]
    fn fully_weighted_composite_matches_hand_calculation() {
        // RSI=0.4 at -0.5, MA=0.35 at -0.2, MACD=0.25 at 0.
        let scores = vec![
            score("rsi", -0.5, 0.4),
            score("ma_cross", -0.2, 0.35),
            score("macd", 0.0, 0.25),
        ];
        let composite = combine_scores(&scores).unwrap();
        assert!((composite - (-0.27)).abs() < 1e-9);

        let config = SignalConfig::default();
        assert_eq!(action_for(composite, &config), TradeAction::Buy);
    }

    #[test]
    fn missing_signal_renormalizes_the_rest() {
        // MACD unavailable: composite = (0.4*-0.5 + 0.35*-0.2) / 0.75
        let scores = vec![score("rsi", -0.5, 0.4), score("ma_cross", -0.2, 0.35)];
        let composite = combine_scores(&scores).unwrap();
        let expected = (0.4 * -0.5 + 0.35 * -0.2) / 0.75;
        assert!((composite - expected).abs() < 1e-9);
    }

    #[test]
    fn no_signals_means_no_composite() {
        assert!(combine_scores(&[]).is_none());
        assert!(combine_scores(&[score("rsi", 0.5, 0.0)]).is_none());
    }

    #[test]
    fn composite_is_always_bounded() {
        let scores = vec![score("rsi", 1.0, 0.4), score("ma_cross", 1.0, 0.6)];
        let composite = combine_scores(&scores).unwrap();
        assert!((-1.0..=1.0).contains(&composite));
    }

    // ---- action mapping --------------------------------------------------

    #[test]
    fn thresholds_split_the_action_space() {
        let config = SignalConfig::default(); // +-0.1
        assert_eq!(action_for(-0.1, &config), TradeAction::Buy);
        assert_eq!(action_for(-0.05, &config), TradeAction::Hold);
        assert_eq!(action_for(0.05, &config), TradeAction::Hold);
        assert_eq!(action_for(0.1, &config), TradeAction::Sell);
    }

    // ---- temperature -----------------------------------------------------

    #[test]
    fn temperature_table_is_canonical() {
        let config = SignalConfig::default();
        assert_eq!(temperature_for(0.75, &config), Temperature::Hot);
        assert_eq!(temperature_for(-0.75, &config), Temperature::Hot);
        assert_eq!(temperature_for(0.5, &config), Temperature::Warm);
        assert_eq!(temperature_for(-0.2, &config), Temperature::Cool);
        assert_eq!(temperature_for(0.01, &config), Temperature::Frozen);
    }

    #[test]
    fn near_threshold_composite_runs_hot() {
        let mut config = SignalConfig::default();
        config.buy_threshold = -0.5;
        config.sell_threshold = 0.9;
        // Within 10% of the buy threshold while trending toward it.
        assert_eq!(temperature_for(-0.46, &config), Temperature::Hot);
        // Same magnitude trending toward the distant sell threshold is
        // merely warm.
        assert_eq!(temperature_for(0.46, &config), Temperature::Warm);
    }

    // ---- evaluation ------------------------------------------------------

    #[test]
    fn evaluation_is_deterministic() {
        let config = SignalConfig::default();
        let data = pair_data(120);

        let a = evaluate(&config, &data);
        let b = evaluate(&config, &data);

        assert_eq!(a.composite, b.composite);
        assert_eq!(a.candidate, b.candidate);
        assert_eq!(a.temperature, b.temperature);
        assert_eq!(a.signals.len(), b.signals.len());
        for (x, y) in a.signals.iter().zip(b.signals.iter()) {
            assert_eq!(x.name, y.name);
            assert!((x.score - y.score).abs() < f64::EPSILON);
        }
    }

    #[test]
    fn short_history_holds_without_composite() {
        let config = SignalConfig::default();
        let data = pair_data(5);
        let eval = evaluate(&config, &data);
        assert!(eval.composite.is_none());
        assert_eq!(eval.candidate, TradeAction::Hold);
        assert!(eval.signals.is_empty());
    }

    #[test]
    fn missing_candles_hold() {
        let config = SignalConfig::default();
        let data = PairData {
            ticker: None,
            candles: None,
        };
        let eval = evaluate(&config, &data);
        assert_eq!(eval.candidate, TradeAction::Hold);
    }

    // ---- confirmation window ---------------------------------------------

    fn bot_with_confirmation(minutes: f64) -> Bot {
        let mut bot = Bot::new("test", "BTC-USD");
        bot.signal_config.confirmation_minutes = minutes;
        bot
    }

    #[test]
    fn candidate_promotes_after_the_window() {
        // confirmation = 2 min, tick = 60 s: promoted on the third tick.
        let mut bot = bot_with_confirmation(2.0);
        let t0 = Utc::now();

        assert!(apply_confirmation(&mut bot, TradeAction::Buy, t0).is_none());
        assert!(apply_confirmation(
            &mut bot,
            TradeAction::Buy,
            t0 + chrono::Duration::seconds(60)
        )
        .is_none());
        let promoted = apply_confirmation(
            &mut bot,
            TradeAction::Buy,
            t0 + chrono::Duration::seconds(120),
        );
        assert_eq!(promoted, Some(TradeAction::Buy));
        // Window resets after promotion.
        assert!(bot.pending_action.is_none());
    }

    #[test]
    fn disagreeing_tick_resets_the_window() {
        let mut bot = bot_with_confirmation(2.0);
        let t0 = Utc::now();

        assert!(apply_confirmation(&mut bot, TradeAction::Buy, t0).is_none());
        // A hold wipes the pending buy.
        assert!(apply_confirmation(
            &mut bot,
            TradeAction::Hold,
            t0 + chrono::Duration::seconds(60)
        )
        .is_none());
        assert!(bot.pending_action.is_none());

        // The buy must start over; two minutes from t0 is not enough now.
        assert!(apply_confirmation(
            &mut bot,
            TradeAction::Buy,
            t0 + chrono::Duration::seconds(120)
        )
        .is_none());
        assert!(apply_confirmation(
            &mut bot,
            TradeAction::Buy,
            t0 + chrono::Duration::seconds(180)
        )
        .is_none());
        let promoted = apply_confirmation(
            &mut bot,
            TradeAction::Buy,
            t0 + chrono::Duration::seconds(240),
        );
        assert_eq!(promoted, Some(TradeAction::Buy));
    }

    #[test]
    fn direction_flip_restarts_the_window() {
        let mut bot = bot_with_confirmation(2.0);
        let t0 = Utc::now();

        assert!(apply_confirmation(&mut bot, TradeAction::Buy, t0).is_none());
        // Flip to sell: the old window must not carry over.
        assert!(apply_confirmation(
            &mut bot,
            TradeAction::Sell,
            t0 + chrono::Duration::seconds(120)
        )
        .is_none());
        assert_eq!(bot.pending_action, Some(TradeAction::Sell));
        assert!(apply_confirmation(
            &mut bot,
            TradeAction::Sell,
            t0 + chrono::Duration::seconds(180)
        )
        .is_none());
    }

    #[test]
    fn zero_confirmation_promotes_immediately() {
        let mut bot = bot_with_confirmation(0.0);
        let promoted = apply_confirmation(&mut bot, TradeAction::Sell, Utc::now());
        assert_eq!(promoted, Some(TradeAction::Sell));
    }
}
