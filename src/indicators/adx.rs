// =============================================================================
// Average Directional Index (ADX) with +DI / -DI
// =============================================================================
//
// ADX quantifies trend **strength** regardless of direction; the directional
// indicators say which side is dominating.
//
// Calculation pipeline:
//   1. Compute +DM (positive directional movement) and -DM per bar.
//   2. Compute True Range (TR) per bar.
//   3. Apply Wilder's smoothing (period) to +DM, -DM, and TR.
//   4. Derive +DI = smoothed(+DM) / smoothed(TR) * 100
//            -DI = smoothed(-DM) / smoothed(TR) * 100
//   5. DX  = |+DI - -DI| / (+DI + -DI) * 100
//   6. ADX = Wilder's smoothed average of DX over `period` bars.
//
// Alignment: +DI / -DI are first defined at bar index `period`, ADX at
// `2 * period - 1`.  A window needs `2 * period` bars for one ADX value.
// =============================================================================

use crate::market_data::Bar;

/// Aligned ADX / DI series (NaN during warm-up).
#[derive(Debug, Clone)]
pub struct AdxSeries {
    pub adx: Vec<f64>,
    pub plus_di: Vec<f64>,
    pub minus_di: Vec<f64>,
}

impl AdxSeries {
    fn undefined(len: usize) -> Self {
        Self {
            adx: vec![f64::NAN; len],
            plus_di: vec![f64::NAN; len],
            minus_di: vec![f64::NAN; len],
        }
    }
}

/// Compute ADX, +DI and -DI for every bar.
///
/// Returns all-NaN series when `period` is zero or there are not enough bars
/// for the directional indicators.
pub fn adx_series(bars: &[Bar], period: usize) -> AdxSeries {
    let n = bars.len();
    let mut out = AdxSeries::undefined(n);
    if period == 0 || n < period + 1 {
        return out;
    }

    let period_f = period as f64;

    // ------------------------------------------------------------------
    // Step 1 & 2: Raw +DM, -DM, and True Range; transition i ends at bar i + 1
    // ------------------------------------------------------------------
    let mut plus_dm = Vec::with_capacity(n - 1);
    let mut minus_dm = Vec::with_capacity(n - 1);
    let mut tr_vals = Vec::with_capacity(n - 1);

    for pair in bars.windows(2) {
        let (prev, cur) = (&pair[0], &pair[1]);

        let tr = (cur.high - cur.low)
            .max((cur.high - prev.close).abs())
            .max((cur.low - prev.close).abs());

        let up_move = cur.high - prev.high;
        let down_move = prev.low - cur.low;

        plus_dm.push(if up_move > down_move && up_move > 0.0 { up_move } else { 0.0 });
        minus_dm.push(if down_move > up_move && down_move > 0.0 { down_move } else { 0.0 });
        tr_vals.push(tr);
    }

    // ------------------------------------------------------------------
    // Step 3-5: Wilder's smoothing, DI and DX per bar
    // ------------------------------------------------------------------
    let mut smooth_plus_dm: f64 = plus_dm[..period].iter().sum();
    let mut smooth_minus_dm: f64 = minus_dm[..period].iter().sum();
    let mut smooth_tr: f64 = tr_vals[..period].iter().sum();

    let mut dx_values: Vec<(usize, f64)> = Vec::with_capacity(n - period);

    for t in (period - 1)..tr_vals.len() {
        if t >= period {
            smooth_plus_dm = smooth_plus_dm - smooth_plus_dm / period_f + plus_dm[t];
            smooth_minus_dm = smooth_minus_dm - smooth_minus_dm / period_f + minus_dm[t];
            smooth_tr = smooth_tr - smooth_tr / period_f + tr_vals[t];
        }

        let Some((plus_di, minus_di, dx)) = directional(smooth_plus_dm, smooth_minus_dm, smooth_tr)
        else {
            break;
        };

        let bar_idx = t + 1;
        out.plus_di[bar_idx] = plus_di;
        out.minus_di[bar_idx] = minus_di;
        dx_values.push((bar_idx, dx));
    }

    // ------------------------------------------------------------------
    // Step 6: ADX = Wilder's smoothed average of DX
    // ------------------------------------------------------------------
    if dx_values.len() < period {
        return out;
    }

    let mut adx = dx_values[..period].iter().map(|(_, dx)| dx).sum::<f64>() / period_f;
    out.adx[dx_values[period - 1].0] = adx;

    for &(bar_idx, dx) in &dx_values[period..] {
        adx = (adx * (period_f - 1.0) + dx) / period_f;
        if !adx.is_finite() {
            break;
        }
        out.adx[bar_idx] = adx;
    }

    out
}

// =============================================================================
// Internal helpers
// =============================================================================

/// Derive `(+DI, -DI, DX)` from smoothed +DM, -DM and TR.
///
/// A zero true range (perfectly flat bars) yields zero directional movement
/// rather than a division by zero.  Returns `None` for non-finite results.
fn directional(smooth_plus_dm: f64, smooth_minus_dm: f64, smooth_tr: f64) -> Option<(f64, f64, f64)> {
    if smooth_tr == 0.0 {
        return Some((0.0, 0.0, 0.0));
    }

    let plus_di = (smooth_plus_dm / smooth_tr) * 100.0;
    let minus_di = (smooth_minus_dm / smooth_tr) * 100.0;

    let di_sum = plus_di + minus_di;
    let dx = if di_sum == 0.0 {
        0.0
    } else {
        ((plus_di - minus_di).abs() / di_sum) * 100.0
    };

    if plus_di.is_finite() && minus_di.is_finite() && dx.is_finite() {
        Some((plus_di, minus_di, dx))
    } else {
        None
    }
}
