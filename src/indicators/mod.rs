// =============================================================================
// Technical Indicators Module
// =============================================================================
//
// Pure, side-effect-free implementations of the indicators used by the signal
// evaluator.  Every series function returns a vector aligned index-for-index
// with its input, holding NaN wherever the lookback window is incomplete, so
// callers are forced to handle insufficient data explicitly.
//
// `enrich` recomputes the whole set from scratch over the retention window on
// every tick; the window cap bounds the cost.

pub mod adx;
pub mod bollinger;
pub mod ema;
pub mod rsi;
pub mod sma;

use serde::{Deserialize, Serialize};

use crate::market_data::Bar;

// =============================================================================
// Settings
// =============================================================================

fn default_ema_fast() -> usize {
    9
}

fn default_ema_slow() -> usize {
    21
}

fn default_ema_trend() -> usize {
    20
}

fn default_sma_trend() -> usize {
    200
}

fn default_rsi_period() -> usize {
    14
}

fn default_bb_window() -> usize {
    20
}

fn default_bb_std() -> f64 {
    2.0
}

fn default_adx_period() -> usize {
    14
}

fn default_volume_window() -> usize {
    20
}

/// Window lengths of the indicator set.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IndicatorSettings {
    /// Fast EMA of the moving-average cross.
    #[serde(default = "default_ema_fast")]
    pub ema_fast: usize,

    /// Slow EMA of the moving-average cross.
    #[serde(default = "default_ema_slow")]
    pub ema_slow: usize,

    /// EMA used as the breakout trend filter.
    #[serde(default = "default_ema_trend")]
    pub ema_trend: usize,

    /// Long-window SMA used as the mean-reversion trend filter.
    #[serde(default = "default_sma_trend")]
    pub sma_trend: usize,

    #[serde(default = "default_rsi_period")]
    pub rsi_period: usize,

    #[serde(default = "default_bb_window")]
    pub bb_window: usize,

    /// Band width in standard deviations.
    #[serde(default = "default_bb_std")]
    pub bb_std: f64,

    #[serde(default = "default_adx_period")]
    pub adx_period: usize,

    #[serde(default = "default_volume_window")]
    pub volume_window: usize,
}

impl Default for IndicatorSettings {
    fn default() -> Self {
        Self {
            ema_fast: default_ema_fast(),
            ema_slow: default_ema_slow(),
            ema_trend: default_ema_trend(),
            sma_trend: default_sma_trend(),
            rsi_period: default_rsi_period(),
            bb_window: default_bb_window(),
            bb_std: default_bb_std(),
            adx_period: default_adx_period(),
            volume_window: default_volume_window(),
        }
    }
}

impl IndicatorSettings {
    /// Number of bars needed before `indicator` produces its first value.
    pub fn lookback(&self, indicator: Indicator) -> usize {
        match indicator {
            Indicator::EmaFast => self.ema_fast,
            Indicator::EmaSlow => self.ema_slow,
            Indicator::EmaTrend => self.ema_trend,
            Indicator::SmaTrend => self.sma_trend,
            Indicator::Rsi => self.rsi_period + 1,
            Indicator::Bollinger => self.bb_window,
            Indicator::Adx => 2 * self.adx_period,
            Indicator::DirectionalIndex => self.adx_period + 1,
            Indicator::VolumeSma => self.volume_window,
        }
    }

    /// Longest lookback among `indicators`.
    pub fn max_lookback(&self, indicators: &[Indicator]) -> usize {
        indicators
            .iter()
            .map(|i| self.lookback(*i))
            .max()
            .unwrap_or(0)
    }
}

// =============================================================================
// Enriched bars
// =============================================================================

/// Identifies one column of [`IndicatorValues`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Indicator {
    EmaFast,
    EmaSlow,
    EmaTrend,
    SmaTrend,
    Rsi,
    /// Upper, middle and lower band.
    Bollinger,
    Adx,
    /// +DI and -DI.
    DirectionalIndex,
    VolumeSma,
}

impl Indicator {
    pub fn name(self) -> &'static str {
        match self {
            Self::EmaFast => "ema_fast",
            Self::EmaSlow => "ema_slow",
            Self::EmaTrend => "ema_trend",
            Self::SmaTrend => "sma_trend",
            Self::Rsi => "rsi",
            Self::Bollinger => "bollinger",
            Self::Adx => "adx",
            Self::DirectionalIndex => "di",
            Self::VolumeSma => "volume_sma",
        }
    }
}

/// Indicator values for one bar; NaN where undefined.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct IndicatorValues {
    pub ema_fast: f64,
    pub ema_slow: f64,
    pub ema_trend: f64,
    pub sma_trend: f64,
    pub rsi: f64,
    pub bb_upper: f64,
    pub bb_middle: f64,
    pub bb_lower: f64,
    pub adx: f64,
    pub plus_di: f64,
    pub minus_di: f64,
    pub volume_sma: f64,
}

impl IndicatorValues {
    /// `true` when every value backing `indicator` is finite.
    pub fn is_defined(&self, indicator: Indicator) -> bool {
        match indicator {
            Indicator::EmaFast => self.ema_fast.is_finite(),
            Indicator::EmaSlow => self.ema_slow.is_finite(),
            Indicator::EmaTrend => self.ema_trend.is_finite(),
            Indicator::SmaTrend => self.sma_trend.is_finite(),
            Indicator::Rsi => self.rsi.is_finite(),
            Indicator::Bollinger => {
                self.bb_upper.is_finite() && self.bb_middle.is_finite() && self.bb_lower.is_finite()
            }
            Indicator::Adx => self.adx.is_finite(),
            Indicator::DirectionalIndex => self.plus_di.is_finite() && self.minus_di.is_finite(),
            Indicator::VolumeSma => self.volume_sma.is_finite(),
        }
    }
}

/// A bar annotated with the indicator set, using only past and current bars.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct EnrichedBar {
    pub bar: Bar,
    pub ind: IndicatorValues,
}

/// Annotate `bars` (oldest first) with every indicator in `settings`.
pub fn enrich(bars: &[Bar], settings: &IndicatorSettings) -> Vec<EnrichedBar> {
    let closes: Vec<f64> = bars.iter().map(|b| b.close).collect();
    let volumes: Vec<f64> = bars.iter().map(|b| b.volume).collect();

    let ema_fast = ema::ema_series(&closes, settings.ema_fast);
    let ema_slow = ema::ema_series(&closes, settings.ema_slow);
    let ema_trend = ema::ema_series(&closes, settings.ema_trend);
    let sma_trend = sma::sma_series(&closes, settings.sma_trend);
    let rsi = rsi::rsi_series(&closes, settings.rsi_period);
    let bb = bollinger::bollinger_series(&closes, settings.bb_window, settings.bb_std);
    let adx = adx::adx_series(bars, settings.adx_period);
    let volume_sma = sma::sma_series(&volumes, settings.volume_window);

    bars.iter()
        .enumerate()
        .map(|(i, bar)| EnrichedBar {
            bar: *bar,
            ind: IndicatorValues {
                ema_fast: ema_fast[i],
                ema_slow: ema_slow[i],
                ema_trend: ema_trend[i],
                sma_trend: sma_trend[i],
                rsi: rsi[i],
                bb_upper: bb.upper[i],
                bb_middle: bb.middle[i],
                bb_lower: bb.lower[i],
                adx: adx.adx[i],
                plus_di: adx.plus_di[i],
                minus_di: adx.minus_di[i],
                volume_sma: volume_sma[i],
            },
        })
        .collect()
}
