// =============================================================================
// Exponential Moving Average (EMA)
// =============================================================================
//
// Formula:
//   multiplier = 2 / (period + 1)
//   EMA_t      = close_t * multiplier + EMA_{t-1} * (1 - multiplier)
//
// The very first EMA value is seeded with the SMA of the first `period`
// values.  Both the MA-cross and MACD signals build on this series.
// =============================================================================

/// Compute the EMA series for `values` and look-back `period`.
///
/// Each output element corresponds to an input starting at index
/// `period - 1`.
///
/// # Edge cases
/// - `period == 0` => empty vec (division guard)
/// - `values.len() < period` => empty vec
/// - A non-finite intermediate stops the series; downstream consumers should
///   not trust a broken tail.
pub fn ema_series(values: &[f64], period: usize) -> Vec<f64> {
    if period == 0 || values.len() < period {
        return Vec::new();
    }

    let multiplier = 2.0 / (period + 1) as f64;

    // Seed: SMA of the first `period` values.
    let sma: f64 = values[..period].iter().sum::<f64>() / period as f64;
    if !sma.is_finite() {
        return Vec::new();
    }

    let mut result = Vec::with_capacity(values.len() - period + 1);
    result.push(sma);

    let mut prev = sma;
    for &v in &values[period..] {
        let ema = v * multiplier + prev * (1.0 - multiplier);
        if !ema.is_finite() {
            break;
        }
        result.push(ema);
        prev = ema;
    }

    result
}

/// Most recent EMA value, if the series can be computed at all.
pub fn latest_ema(values: &[f64], period: usize) -> Option<f64> {
    ema_series(values, period).last().copied()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_input() {
        assert!(ema_series(&[], 5).is_empty());
    }

    #[test]
    fn period_zero() {
        assert!(ema_series(&[1.0, 2.0, 3.0], 0).is_empty());
    }

    #[test]
    fn insufficient_data() {
        assert!(ema_series(&[1.0, 2.0], 5).is_empty());
    }

    #[test]
    fn period_equals_length_yields_sma() {
        let ema = ema_series(&[2.0, 4.0, 6.0], 3);
        assert_eq!(ema.len(), 1);
        assert!((ema[0] - 4.0).abs() < 1e-10);
    }

    #[test]
    fn known_values() {
        // 5-period EMA of [1..10]: SMA seed 3.0, multiplier 1/3.
        let values: Vec<f64> = (1..=10).map(|x| x as f64).collect();
        let ema = ema_series(&values, 5);
        assert_eq!(ema.len(), 6);

        let mult = 2.0 / 6.0;
        let mut expected = 3.0;
        let mut expected_vec = vec![expected];
        for &v in &values[5..] {
            expected = v * mult + expected * (1.0 - mult);
            expected_vec.push(expected);
        }
        for (a, b) in ema.iter().zip(expected_vec.iter()) {
            assert!((a - b).abs() < 1e-10, "got {a}, expected {b}");
        }
    }

    #[test]
    fn nan_input_truncates_series() {
        let values = vec![1.0, 2.0, 3.0, f64::NAN, 5.0];
        let ema = ema_series(&values, 3);
        assert_eq!(ema.len(), 1);
    }
}
