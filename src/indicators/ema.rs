// =============================================================================
// Exponential Moving Average (EMA)
// =============================================================================
//
// EMA gives more weight to recent prices, making it more responsive to new
// information than the Simple Moving Average (SMA).
//
// Formula:
//   multiplier = 2 / (period + 1)
//   EMA_t      = close_t * multiplier + EMA_{t-1} * (1 - multiplier)
//
// The recurrence is seeded with the first close.  The first `period - 1`
// outputs are warm-up values and are reported as NaN.
// =============================================================================

/// Compute the EMA series for `values`, aligned index-for-index with the input.
///
/// # Edge cases
/// - `period == 0` => all NaN
/// - Indices `< period - 1` => NaN (warm-up)
/// - A non-finite input poisons the rest of the series (NaN from there on);
///   downstream consumers should not trust a broken series.
pub fn ema_series(values: &[f64], period: usize) -> Vec<f64> {
    let mut out = vec![f64::NAN; values.len()];
    if period == 0 || values.is_empty() {
        return out;
    }

    let multiplier = 2.0 / (period as f64 + 1.0);
    let mut prev = values[0];

    for (i, &value) in values.iter().enumerate() {
        let ema = if i == 0 {
            value
        } else {
            value * multiplier + prev * (1.0 - multiplier)
        };
        if !ema.is_finite() {
            break;
        }
        prev = ema;
        if i + 1 >= period {
            out[i] = ema;
        }
    }

    out
}
