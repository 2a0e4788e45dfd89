// =============================================================================
// Simple Moving Average (SMA) and rolling standard deviation
// =============================================================================
//
// Used directly for the long-window trend filter and the volume filter, and
// as the middle band of the Bollinger envelope.

/// Arithmetic mean of the trailing `window` values, aligned with the input.
///
/// Indices before `window - 1` are NaN; so is every window containing a
/// non-finite value.
pub fn sma_series(values: &[f64], window: usize) -> Vec<f64> {
    let mut out = vec![f64::NAN; values.len()];
    if window == 0 || values.len() < window {
        return out;
    }

    for end in window - 1..values.len() {
        let slice = &values[end + 1 - window..=end];
        let mean = slice.iter().sum::<f64>() / window as f64;
        if mean.is_finite() {
            out[end] = mean;
        }
    }
    out
}

/// Population standard deviation of the trailing `window` values, aligned with
/// the input (NaN during warm-up).
pub fn rolling_std(values: &[f64], window: usize) -> Vec<f64> {
    let mut out = vec![f64::NAN; values.len()];
    if window == 0 || values.len() < window {
        return out;
    }

    for end in window - 1..values.len() {
        let slice = &values[end + 1 - window..=end];
        let mean = slice.iter().sum::<f64>() / window as f64;
        let variance = slice.iter().map(|x| (x - mean).powi(2)).sum::<f64>() / window as f64;
        let std = variance.sqrt();
        if std.is_finite() {
            out[end] = std;
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sma_basic() {
        let sma = sma_series(&[1.0, 2.0, 3.0, 4.0, 5.0], 3);
        assert!(sma[0].is_nan() && sma[1].is_nan());
        assert!((sma[2] - 2.0).abs() < 1e-12);
        assert!((sma[3] - 3.0).abs() < 1e-12);
        assert!((sma[4] - 4.0).abs() < 1e-12);
    }

    #[test]
    fn sma_insufficient_data_is_all_nan() {
        assert!(sma_series(&[1.0, 2.0], 3).iter().all(|v| v.is_nan()));
        assert!(sma_series(&[1.0, 2.0], 0).iter().all(|v| v.is_nan()));
    }

    #[test]
    fn sma_window_with_nan_is_undefined() {
        let sma = sma_series(&[1.0, f64::NAN, 3.0, 4.0, 5.0], 2);
        assert!(sma[1].is_nan());
        assert!(sma[2].is_nan());
        assert!((sma[3] - 3.5).abs() < 1e-12);
    }

    #[test]
    fn rolling_std_of_flat_series_is_zero() {
        let std = rolling_std(&[7.0; 10], 5);
        for v in &std[4..] {
            assert!(v.abs() < 1e-12);
        }
    }

    #[test]
    fn rolling_std_known_value() {
        // Population std of [2, 4, 4, 4, 5, 5, 7, 9] is exactly 2.
        let std = rolling_std(&[2.0, 4.0, 4.0, 4.0, 5.0, 5.0, 7.0, 9.0], 8);
        assert!((std[7] - 2.0).abs() < 1e-12);
    }
}
