// =============================================================================
// MACD signal — line vs signal line, histogram-driven score
// =============================================================================
//
//   macd      = EMA(fast) - EMA(slow)        (per candle)
//   signal    = EMA(macd, signal_period)
//   histogram = macd - signal
//
// The score blends the histogram (how hard momentum is accelerating) with
// the macd-vs-signal sign, both normalized by price so the result is
// dimensionless, then squashes to [-1, +1].
//
// Sign convention matches the other signals: positive = sell pressure.
// =============================================================================

use serde::{Deserialize, Serialize};

use super::ema::ema_series;
use super::{SignalOutcome, SignalScore};
use crate::market::types::CandleSeries;

fn default_fast_period() -> usize {
    12
}

fn default_slow_period() -> usize {
    26
}

fn default_signal_period() -> usize {
    9
}

/// Dimensionless histogram magnitudes are tiny (~1e-3); this scale places a
/// typical strong divergence near the tanh knee.
const HISTOGRAM_SCALE: f64 = 400.0;

/// MACD signal parameters.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MacdParams {
    #[serde(default = "default_fast_period")]
    pub fast_period: usize,
    #[serde(default = "default_slow_period")]
    pub slow_period: usize,
    #[serde(default = "default_signal_period")]
    pub signal_period: usize,
}

impl Default for MacdParams {
    fn default() -> Self {
        Self {
            fast_period: default_fast_period(),
            slow_period: default_slow_period(),
            signal_period: default_signal_period(),
        }
    }
}

/// Candles needed before this signal can produce a score.
pub fn required_periods(params: &MacdParams) -> usize {
    params.slow_period + params.signal_period
}

/// Evaluate the MACD signal over `series`.
pub fn compute(series: &CandleSeries, params: &MacdParams, weight: f64) -> SignalOutcome {
    if series.len() < required_periods(params)
        || params.fast_period == 0
        || params.signal_period == 0
        || params.fast_period >= params.slow_period
    {
        return SignalOutcome::Insufficient;
    }

    let closes = &series.close;
    let fast = ema_series(closes, params.fast_period);
    let slow = ema_series(closes, params.slow_period);
    if fast.is_empty() || slow.is_empty() {
        return SignalOutcome::Insufficient;
    }

    // Align the two series on the close index: fast[i] covers close index
    // i + fast_period - 1, slow[j] covers j + slow_period - 1.
    let offset = params.slow_period - params.fast_period;
    let macd: Vec<f64> = slow
        .iter()
        .enumerate()
        .filter_map(|(j, s)| fast.get(j + offset).map(|f| f - s))
        .collect();

    let signal_line = ema_series(&macd, params.signal_period);
    let (Some(&macd_now), Some(&signal_now)) = (macd.last(), signal_line.last()) else {
        return SignalOutcome::Insufficient;
    };

    let Some(price) = series.last_close().filter(|p| *p > 0.0) else {
        return SignalOutcome::Insufficient;
    };

    let histogram = macd_now - signal_now;
    let rel_histogram = histogram / price;
    let rel_macd = macd_now / price;

    // Histogram dominates; the macd-line term keeps the sign stable when the
    // histogram hovers near zero.
    let raw = (rel_histogram * 0.7 + rel_macd * 0.3) * HISTOGRAM_SCALE;
    let score = raw.tanh().clamp(-1.0, 1.0);

    SignalOutcome::Score(SignalScore {
        name: "macd".to_string(),
        score,
        weight,
        metadata: serde_json::json!({
            "macd": macd_now,
            "signal": signal_now,
            "histogram": histogram,
            "fast_period": params.fast_period,
            "slow_period": params.slow_period,
            "signal_period": params.signal_period,
        }),
    })
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

    /// Accelerating rise: momentum builds, histogram goes positive.
    fn accelerating_up(n: usize) -> Vec<f64> {
        (0..n).map(|i| 100.0 + 0.01 * (i as f64).powi(2)).collect()
    }

    fn accelerating_down(n: usize) -> Vec<f64> {
        (0..n).map(|i| 500.0 - 0.01 * (i as f64).powi(2)).collect()
    }

    #[test]
    fn insufficient_data_is_omitted() {
        let outcome = compute(&series(&[1.0; 20]), &MacdParams::default(), 0.25);
        assert!(matches!(outcome, SignalOutcome::Insufficient));
    }

    #[test]
    fn requires_slow_plus_signal_periods() {
        let params = MacdParams::default();
        assert_eq!(required_periods(&params), 35);
        let outcome = compute(&series(&accelerating_up(34)), &params, 0.25);
        assert!(matches!(outcome, SignalOutcome::Insufficient));
        let outcome = compute(&series(&accelerating_up(35)), &params, 0.25);
        assert!(matches!(outcome, SignalOutcome::Score(_)));
    }

    #[test]
    fn accelerating_rise_scores_positive() {
        let outcome = compute(&series(&accelerating_up(80)), &MacdParams::default(), 0.25);
        let score = outcome.score().unwrap();
        assert!(score.score > 0.0, "got {}", score.score);
        assert!(score.score <= 1.0);
    }

    #[test]
    fn accelerating_fall_scores_negative() {
        let outcome = compute(&series(&accelerating_down(80)), &MacdParams::default(), 0.25);
        let score = outcome.score().unwrap();
        assert!(score.score < 0.0, "got {}", score.score);
        assert!(score.score >= -1.0);
    }

    #[test]
    fn flat_series_is_neutral() {
        let outcome = compute(&series(&[250.0; 80]), &MacdParams::default(), 0.25);
        let score = outcome.score().unwrap();
        assert!(score.score.abs() < 1e-9);
    }

    #[test]
    fn degenerate_params_are_omitted() {
        let params = MacdParams {
            fast_period: 26,
            slow_period: 26,
            signal_period: 9,
        };
        let outcome = compute(&series(&accelerating_up(80)), &params, 0.25);
        assert!(matches!(outcome, SignalOutcome::Insufficient));
    }

    #[test]
    fn score_is_bounded_on_extreme_input() {
        // A violent price jump must still clamp inside the bounds.
        let mut closes = vec![100.0; 60];
        closes.extend(std::iter::repeat(10_000.0).take(20));
        let outcome = compute(&series(&closes), &MacdParams::default(), 0.25);
        let score = outcome.score().unwrap();
        assert!((-1.0..=1.0).contains(&score.score));
    }
}
