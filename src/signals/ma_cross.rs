// =============================================================================
// MA-cross signal — EMA spread normalized by recent volatility
// =============================================================================
//
// The raw opinion is the relative spread between a fast and a slow EMA,
// divided by the standard deviation of recent close-to-close returns so the
// same configuration behaves consistently across quiet and wild pairs.  A
// tanh squash bounds the result in [-1, +1].
//
// Sign convention: fast below slow => negative (buy pressure), fast above
// slow => positive (sell pressure).
// =============================================================================

use serde::{Deserialize, Serialize};

use super::ema::latest_ema;
use super::{SignalOutcome, SignalScore};
use crate::market::types::CandleSeries;

fn default_fast_period() -> usize {
    12
}

fn default_slow_period() -> usize {
    26
}

/// MA-cross signal parameters.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MaCrossParams {
    #[serde(default = "default_fast_period")]
    pub fast_period: usize,
    #[serde(default = "default_slow_period")]
    pub slow_period: usize,
}

impl Default for MaCrossParams {
    fn default() -> Self {
        Self {
            fast_period: default_fast_period(),
            slow_period: default_slow_period(),
        }
    }
}

/// Candles needed before this signal can produce a score.
pub fn required_periods(params: &MaCrossParams) -> usize {
    params.slow_period + 1
}

/// Evaluate the MA-cross signal over `series`.
pub fn compute(series: &CandleSeries, params: &MaCrossParams, weight: f64) -> SignalOutcome {
    if series.len() < required_periods(params)
        || params.fast_period == 0
        || params.fast_period >= params.slow_period
    {
        return SignalOutcome::Insufficient;
    }

    let closes = &series.close;
    let (Some(fast), Some(slow)) = (
        latest_ema(closes, params.fast_period),
        latest_ema(closes, params.slow_period),
    ) else {
        return SignalOutcome::Insufficient;
    };

    if slow == 0.0 {
        return SignalOutcome::Insufficient;
    }

    let spread = (fast - slow) / slow;
    let vol = return_volatility(closes, params.slow_period);
    if !vol.is_finite() {
        return SignalOutcome::Insufficient;
    }

    // Volatility floor keeps a dead-flat series from dividing by ~zero.
    let normalized = spread / vol.max(1e-6);
    let score = normalized.tanh().clamp(-1.0, 1.0);

    SignalOutcome::Score(SignalScore {
        name: "ma_cross".to_string(),
        score,
        weight,
        metadata: serde_json::json!({
            "fast_ema": fast,
            "slow_ema": slow,
            "spread": spread,
            "volatility": vol,
            "fast_period": params.fast_period,
            "slow_period": params.slow_period,
        }),
    })
}

/// Standard deviation of relative close-to-close changes over the trailing
/// `window` returns.
fn return_volatility(closes: &[f64], window: usize) -> f64 {
    let returns: Vec<f64> = closes
        .windows(2)
        .rev()
        .take(window)
        .filter(|w| w[0] != 0.0)
        .map(|w| (w[1] - w[0]) / w[0])
        .collect();

    if returns.is_empty() {
        return 0.0;
    }

    let mean = returns.iter().sum::<f64>() / returns.len() as f64;
    let var = returns.iter().map(|r| (r - mean).powi(2)).sum::<f64>() / returns.len() as f64;
    var.sqrt()
}
