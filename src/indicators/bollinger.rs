// =============================================================================
// Bollinger Bands
// =============================================================================
//
// Bollinger Bands consist of a middle band (SMA), an upper band (SMA + k*σ),
// and a lower band (SMA - k*σ), with σ the population standard deviation over
// the same window.

use super::sma::{rolling_std, sma_series};

/// Aligned Bollinger series (NaN during warm-up).
#[derive(Debug, Clone)]
pub struct BollingerSeries {
    pub upper: Vec<f64>,
    pub middle: Vec<f64>,
    pub lower: Vec<f64>,
}

/// Calculate Bollinger Bands for every close.
///
/// - `upper`  = SMA + `num_std` * σ
/// - `middle` = SMA
/// - `lower`  = SMA - `num_std` * σ
pub fn bollinger_series(closes: &[f64], window: usize, num_std: f64) -> BollingerSeries {
    let middle = sma_series(closes, window);
    let std = rolling_std(closes, window);

    let upper = middle
        .iter()
        .zip(&std)
        .map(|(m, s)| m + num_std * s)
        .collect();
    let lower = middle
        .iter()
        .zip(&std)
        .map(|(m, s)| m - num_std * s)
        .collect();

    BollingerSeries {
        upper,
        middle,
        lower,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bollinger_basic() {
        let closes: Vec<f64> = (1..=20).map(|x| x as f64).collect();
        let bb = bollinger_series(&closes, 20, 2.0);
        let i = 19;
        assert!(bb.upper[i] > bb.middle[i]);
        assert!(bb.lower[i] < bb.middle[i]);
        assert!((bb.middle[i] - 10.5).abs() < 1e-12);
        assert!(((bb.upper[i] - bb.middle[i]) - (bb.middle[i] - bb.lower[i])).abs() < 1e-9);
    }

    #[test]
    fn bollinger_insufficient_data() {
        let bb = bollinger_series(&[1.0, 2.0, 3.0], 20, 2.0);
        assert!(bb.upper.iter().all(|v| v.is_nan()));
        assert!(bb.lower.iter().all(|v| v.is_nan()));
    }

    #[test]
    fn bollinger_flat_collapses_bands() {
        let bb = bollinger_series(&[100.0; 20], 20, 2.0);
        assert!((bb.upper[19] - 100.0).abs() < 1e-10);
        assert!((bb.lower[19] - 100.0).abs() < 1e-10);
    }
}
