// =============================================================================
// RSI signal — Wilder's smoothing mapped onto [-1, +1]
// =============================================================================
//
// RSI itself:
//   Step 1 — price deltas from consecutive closes.
//   Step 2 — seed average gain / loss with the SMA of the first `period`
//            gains / losses.
//   Step 3 — Wilder's smoothing:
//              avg_gain = (prev_avg_gain * (period - 1) + gain) / period
//   Step 4 — RS = avg_gain / avg_loss, RSI = 100 - 100 / (1 + RS)
//
// Score mapping (negative = buy pressure, positive = sell pressure):
//   rsi <= oversold:   linear from -0.5 at the band down to -1.0 at rsi 0
//   inside the bands:  linear through 0 at the midpoint, ±0.5 at the bands
//   rsi >= overbought: linear from +0.5 at the band up to +1.0 at rsi 100
//
// The three segments join continuously, so the score has no jumps as RSI
// crosses a band.
// =============================================================================

use serde::{Deserialize, Serialize};

use super::{SignalOutcome, SignalScore};
use crate::market::types::CandleSeries;

fn default_period() -> usize {
    14
}

fn default_oversold() -> f64 {
    30.0
}

fn default_overbought() -> f64 {
    70.0
}

/// RSI signal parameters.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RsiParams {
    #[serde(default = "default_period")]
    pub period: usize,
    #[serde(default = "default_oversold")]
    pub oversold: f64,
    #[serde(default = "default_overbought")]
    pub overbought: f64,
}

impl Default for RsiParams {
    fn default() -> Self {
        Self {
            period: default_period(),
            oversold: default_oversold(),
            overbought: default_overbought(),
        }
    }
}

/// Candles needed before this signal can produce a score.
pub fn required_periods(params: &RsiParams) -> usize {
    params.period + 1
}

/// Evaluate the RSI signal over `series`.
pub fn compute(series: &CandleSeries, params: &RsiParams, weight: f64) -> SignalOutcome {
    if series.len() < required_periods(params) {
        return SignalOutcome::Insufficient;
    }

    let Some(rsi) = latest_rsi(&series.close, params.period) else {
        return SignalOutcome::Insufficient;
    };

    let score = score_from_rsi(rsi, params);

    SignalOutcome::Score(SignalScore {
        name: "rsi".to_string(),
        score,
        weight,
        metadata: serde_json::json!({
            "rsi": rsi,
            "period": params.period,
            "oversold": params.oversold,
            "overbought": params.overbought,
        }),
    })
}

/// Map an RSI value in [0, 100] onto a score in [-1, +1].
fn score_from_rsi(rsi: f64, params: &RsiParams) -> f64 {
    let mid = (params.oversold + params.overbought) / 2.0;

    let score = if rsi <= params.oversold {
        let depth = if params.oversold > 0.0 {
            (params.oversold - rsi) / params.oversold
        } else {
            1.0
        };
        -(0.5 + 0.5 * depth)
    } else if rsi >= params.overbought {
        let span = 100.0 - params.overbought;
        let depth = if span > 0.0 {
            (rsi - params.overbought) / span
        } else {
            1.0
        };
        0.5 + 0.5 * depth
    } else {
        let half_band = params.overbought - mid;
        if half_band > 0.0 {
            0.5 * (rsi - mid) / half_band
        } else {
            0.0
        }
    };

    score.clamp(-1.0, 1.0)
}

/// Most recent RSI value via Wilder's smoothing, `None` when the input is too
/// short or the math degenerates.
fn latest_rsi(closes: &[f64], period: usize) -> Option<f64> {
    if period == 0 || closes.len() < period + 1 {
        return None;
    }

    let deltas: Vec<f64> = closes.windows(2).map(|w| w[1] - w[0]).collect();

    let (sum_gain, sum_loss) = deltas[..period]
        .iter()
        .fold((0.0_f64, 0.0_f64), |(g, l), &d| {
            if d > 0.0 {
                (g + d, l)
            } else {
                (g, l + d.abs())
            }
        });

    let period_f = period as f64;
    let mut avg_gain = sum_gain / period_f;
    let mut avg_loss = sum_loss / period_f;

    for &delta in &deltas[period..] {
        let gain = if delta > 0.0 { delta } else { 0.0 };
        let loss = if delta < 0.0 { delta.abs() } else { 0.0 };
        avg_gain = (avg_gain * (period_f - 1.0) + gain) / period_f;
        avg_loss = (avg_loss * (period_f - 1.0) + loss) / period_f;
    }

    let rsi = if avg_loss == 0.0 && avg_gain == 0.0 {
        50.0 // No movement at all.
    } else if avg_loss == 0.0 {
        100.0 // Only gains.
    } else {
        let rs = avg_gain / avg_loss;
        100.0 - 100.0 / (1.0 + rs)
    };

    rsi.is_finite().then_some(rsi)
}

// =============================================================================
// Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;
    use crate::market::types::Candle;

    fn series(closes: &[f64]) -> CandleSeries {
        closes
            .iter()
            .enumerate()
            .map(|(i, &c)| Candle {
                open: c,
                high: c,
                low: c,
                close: c,
                volume: 1.0,
                ts: i as i64,
            })
            .collect()
    }

    #[test]
    fn insufficient_data_is_omitted_not_zero() {
        let s = series(&[1.0; 10]);
        let outcome = compute(&s, &RsiParams::default(), 0.4);
        assert!(matches!(outcome, SignalOutcome::Insufficient));
    }

    #[test]
    fn ascending_prices_push_toward_sell() {
        let closes: Vec<f64> = (1..=40).map(|x| x as f64).collect();
        let outcome = compute(&series(&closes), &RsiParams::default(), 0.4);
        let score = outcome.score().unwrap();
        // All gains => RSI 100 => maximum sell pressure.
        assert!((score.score - 1.0).abs() < 1e-9);
    }

    #[test]
    fn descending_prices_push_toward_buy() {
        let closes: Vec<f64> = (1..=40).rev().map(|x| x as f64).collect();
        let outcome = compute(&series(&closes), &RsiParams::default(), 0.4);
        let score = outcome.score().unwrap();
        assert!((score.score + 1.0).abs() < 1e-9);
    }

    #[test]
    fn flat_market_is_neutral() {
        let outcome = compute(&series(&[100.0; 40]), &RsiParams::default(), 0.4);
        let score = outcome.score().unwrap();
        assert!(score.score.abs() < 1e-9);
    }

    #[test]
    fn mapping_is_continuous_at_the_bands() {
        let params = RsiParams::default();
        let eps = 1e-6;
        let below = score_from_rsi(params.oversold - eps, &params);
        let at = score_from_rsi(params.oversold, &params);
        let above = score_from_rsi(params.oversold + eps, &params);
        assert!((below - at).abs() < 1e-3);
        assert!((above - at).abs() < 1e-3);
        assert!((at + 0.5).abs() < 1e-9);

        let at_over = score_from_rsi(params.overbought, &params);
        assert!((at_over - 0.5).abs() < 1e-9);
    }

    #[test]
    fn score_is_always_bounded() {
        let params = RsiParams::default();
        for rsi in 0..=100 {
            let s = score_from_rsi(rsi as f64, &params);
            assert!((-1.0..=1.0).contains(&s), "score {s} out of range at rsi {rsi}");
        }
    }

    #[test]
    fn metadata_carries_indicator_internals() {
        let closes: Vec<f64> = (1..=40).map(|x| x as f64).collect();
        let outcome = compute(&series(&closes), &RsiParams::default(), 0.4);
        let score = outcome.score().unwrap();
        assert!(score.metadata["rsi"].as_f64().is_some());
        assert_eq!(score.metadata["period"].as_u64(), Some(14));
    }
}
