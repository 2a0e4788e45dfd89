// =============================================================================
// Signal Evaluator: rule groups over the enriched bar history
// =============================================================================
//
// Pure function of (enriched history, parameters).  The latest bar `c` and the
// one before it `prev` are checked against independent rule groups:
//
//   1. Breakout        - close outside a Bollinger band, reversal candle,
//                        elevated volume, ADX trend-strength floor.
//   2. EMA cross       - fast EMA crosses the slow EMA, RSI on the right side
//                        of the midline.
//   3. Mean reversion  - RSI extreme against the long-window trend filter.
//   4. Momentum        - directional candle closing beyond the previous bar's
//                        range, elevated volume, RSI skew, DI dominance.
//
// Every LONG group is tried before any SHORT group, so LONG wins when both
// directions fire on the same bar.  Thresholds are configuration; the named
// profiles reproduce the strategy variants the bot has been run with.
// =============================================================================

use serde::{Deserialize, Serialize};

use crate::indicators::{EnrichedBar, Indicator, IndicatorSettings};
use crate::types::{Decision, Direction};

// =============================================================================
// Parameters
// =============================================================================

fn default_true() -> bool {
    true
}

fn default_volume_multiplier() -> f64 {
    1.5
}

fn default_adx_min() -> f64 {
    15.0
}

fn default_rsi_midline() -> f64 {
    50.0
}

fn default_rsi_oversold() -> f64 {
    30.0
}

fn default_rsi_overbought() -> f64 {
    70.0
}

fn default_momentum_rsi_long() -> f64 {
    55.0
}

fn default_momentum_rsi_short() -> f64 {
    45.0
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BreakoutRule {
    #[serde(default = "default_true")]
    pub enabled: bool,

    /// Require the current candle body to point the other way from the
    /// previous one (bullish after bearish for LONG).
    #[serde(default = "default_true")]
    pub require_reversal_candle: bool,

    /// Volume must exceed `volume_multiplier × volume SMA`.
    #[serde(default = "default_volume_multiplier")]
    pub volume_multiplier: f64,

    /// ADX must exceed this floor.
    #[serde(default = "default_adx_min")]
    pub adx_min: f64,

    /// Additionally require close above (LONG) / below (SHORT) the trend EMA.
    #[serde(default)]
    pub trend_filter: bool,

    /// Optional RSI confirmation: LONG needs RSI above this.
    #[serde(default)]
    pub rsi_long_min: Option<f64>,

    /// Optional RSI confirmation: SHORT needs RSI below this.
    #[serde(default)]
    pub rsi_short_max: Option<f64>,
}

impl Default for BreakoutRule {
    fn default() -> Self {
        Self {
            enabled: true,
            require_reversal_candle: true,
            volume_multiplier: default_volume_multiplier(),
            adx_min: default_adx_min(),
            trend_filter: false,
            rsi_long_min: None,
            rsi_short_max: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EmaCrossRule {
    #[serde(default = "default_true")]
    pub enabled: bool,

    #[serde(default = "default_rsi_midline")]
    pub rsi_midline: f64,
}

impl Default for EmaCrossRule {
    fn default() -> Self {
        Self {
            enabled: true,
            rsi_midline: default_rsi_midline(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MeanReversionRule {
    #[serde(default = "default_true")]
    pub enabled: bool,

    #[serde(default = "default_rsi_oversold")]
    pub rsi_oversold: f64,

    #[serde(default = "default_rsi_overbought")]
    pub rsi_overbought: f64,
}

impl Default for MeanReversionRule {
    fn default() -> Self {
        Self {
            enabled: true,
            rsi_oversold: default_rsi_oversold(),
            rsi_overbought: default_rsi_overbought(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MomentumRule {
    #[serde(default = "default_true")]
    pub enabled: bool,

    #[serde(default = "default_volume_multiplier")]
    pub volume_multiplier: f64,

    #[serde(default = "default_momentum_rsi_long")]
    pub rsi_long_min: f64,

    #[serde(default = "default_momentum_rsi_short")]
    pub rsi_short_max: f64,
}

impl Default for MomentumRule {
    fn default() -> Self {
        Self {
            enabled: true,
            volume_multiplier: default_volume_multiplier(),
            rsi_long_min: default_momentum_rsi_long(),
            rsi_short_max: default_momentum_rsi_short(),
        }
    }
}

/// Thresholds and switches for every rule group.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct SignalParams {
    #[serde(default)]
    pub breakout: BreakoutRule,
    #[serde(default)]
    pub ema_cross: EmaCrossRule,
    #[serde(default)]
    pub mean_reversion: MeanReversionRule,
    #[serde(default)]
    pub momentum: MomentumRule,
}

impl SignalParams {
    /// Enabled rule groups in evaluation order.
    pub fn enabled_rules(&self) -> Vec<RuleGroup> {
        let mut rules = Vec::with_capacity(4);
        if self.breakout.enabled {
            rules.push(RuleGroup::Breakout);
        }
        if self.ema_cross.enabled {
            rules.push(RuleGroup::EmaCross);
        }
        if self.mean_reversion.enabled {
            rules.push(RuleGroup::MeanReversion);
        }
        if self.momentum.enabled {
            rules.push(RuleGroup::Momentum);
        }
        rules
    }

    /// Indicators the enabled rule groups read.
    pub fn required_indicators(&self) -> Vec<Indicator> {
        let mut required = Vec::new();
        for rule in self.enabled_rules() {
            let needs: &[Indicator] = match rule {
                RuleGroup::Breakout => &[Indicator::Bollinger, Indicator::VolumeSma, Indicator::Adx],
                RuleGroup::EmaCross => &[Indicator::EmaFast, Indicator::EmaSlow, Indicator::Rsi],
                RuleGroup::MeanReversion => &[Indicator::Rsi, Indicator::SmaTrend],
                RuleGroup::Momentum => &[
                    Indicator::VolumeSma,
                    Indicator::Rsi,
                    Indicator::DirectionalIndex,
                ],
            };
            required.extend_from_slice(needs);
        }
        if self.breakout.enabled && self.breakout.trend_filter {
            required.push(Indicator::EmaTrend);
        }
        if self.breakout.enabled
            && (self.breakout.rsi_long_min.is_some() || self.breakout.rsi_short_max.is_some())
        {
            required.push(Indicator::Rsi);
        }
        required.sort_by_key(|i| i.name());
        required.dedup();
        required
    }

    /// Bars needed before the evaluator will decide: at least two, and at
    /// least the longest lookback among the required indicators.
    pub fn min_bars(&self, settings: &IndicatorSettings) -> usize {
        settings.max_lookback(&self.required_indicators()).max(2)
    }
}

// =============================================================================
// Profiles
// =============================================================================

/// Named presets of [`SignalParams`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StrategyProfile {
    /// Realtime breakout bot: band break with EMA trend filter, RSI 60/40,
    /// ADX > 25, volume above its mean. No other groups.
    Classic,
    /// Tight scalper: ADX > 10, volume 1.0x, RSI extremes at 40/60.
    Scalper,
    /// Reversal breakout with EMA cross and 30/70 mean reversion, ADX > 15,
    /// volume 1.5x.
    Reversal,
    /// Everything in `Reversal` plus the strong-momentum group.
    Momentum,
}

impl StrategyProfile {
    pub fn params(self) -> SignalParams {
        match self {
            Self::Classic => SignalParams {
                breakout: BreakoutRule {
                    enabled: true,
                    require_reversal_candle: false,
                    volume_multiplier: 1.0,
                    adx_min: 25.0,
                    trend_filter: true,
                    rsi_long_min: Some(60.0),
                    rsi_short_max: Some(40.0),
                },
                ema_cross: EmaCrossRule {
                    enabled: false,
                    ..EmaCrossRule::default()
                },
                mean_reversion: MeanReversionRule {
                    enabled: false,
                    ..MeanReversionRule::default()
                },
                momentum: MomentumRule {
                    enabled: false,
                    ..MomentumRule::default()
                },
            },
            Self::Scalper => SignalParams {
                breakout: BreakoutRule {
                    volume_multiplier: 1.0,
                    adx_min: 10.0,
                    ..BreakoutRule::default()
                },
                ema_cross: EmaCrossRule::default(),
                mean_reversion: MeanReversionRule {
                    enabled: true,
                    rsi_oversold: 40.0,
                    rsi_overbought: 60.0,
                },
                momentum: MomentumRule {
                    enabled: false,
                    ..MomentumRule::default()
                },
            },
            Self::Reversal => SignalParams {
                momentum: MomentumRule {
                    enabled: false,
                    ..MomentumRule::default()
                },
                ..SignalParams::default()
            },
            Self::Momentum => SignalParams::default(),
        }
    }
}

impl std::fmt::Display for StrategyProfile {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Classic => write!(f, "classic"),
            Self::Scalper => write!(f, "scalper"),
            Self::Reversal => write!(f, "reversal"),
            Self::Momentum => write!(f, "momentum"),
        }
    }
}

impl std::str::FromStr for StrategyProfile {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "classic" => Ok(Self::Classic),
            "scalper" => Ok(Self::Scalper),
            "reversal" => Ok(Self::Reversal),
            "momentum" => Ok(Self::Momentum),
            other => anyhow::bail!("unknown strategy profile '{other}'"),
        }
    }
}

// =============================================================================
// Evaluation
// =============================================================================

/// Which rule group produced a signal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum RuleGroup {
    Breakout,
    EmaCross,
    MeanReversion,
    Momentum,
}

impl std::fmt::Display for RuleGroup {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Breakout => write!(f, "breakout"),
            Self::EmaCross => write!(f, "ema_cross"),
            Self::MeanReversion => write!(f, "mean_reversion"),
            Self::Momentum => write!(f, "momentum"),
        }
    }
}

/// Result of one evaluation.
#[derive(Debug, Clone, PartialEq)]
pub enum Evaluation {
    Signal { direction: Direction, rule: RuleGroup },
    NoSignal,
    /// Not enough enriched history to decide. Not an error.
    InsufficientData { reason: String },
}

impl Evaluation {
    pub fn decision(&self) -> Decision {
        match self {
            Self::Signal { direction, .. } => Decision::from(*direction),
            Self::NoSignal | Self::InsufficientData { .. } => Decision::None,
        }
    }
}

/// Map the enriched history (oldest first) to a decision.
pub fn evaluate(
    history: &[EnrichedBar],
    params: &SignalParams,
    settings: &IndicatorSettings,
) -> Evaluation {
    let rules = params.enabled_rules();
    if rules.is_empty() {
        return Evaluation::NoSignal;
    }

    let min_bars = params.min_bars(settings);
    if history.len() < min_bars {
        return Evaluation::InsufficientData {
            reason: format!("{} bars < {} required", history.len(), min_bars),
        };
    }

    let c = &history[history.len() - 1];
    let prev = &history[history.len() - 2];

    for indicator in params.required_indicators() {
        if !c.ind.is_defined(indicator) || !prev.ind.is_defined(indicator) {
            return Evaluation::InsufficientData {
                reason: format!("{} undefined on the latest bars", indicator.name()),
            };
        }
    }

    for direction in [Direction::Long, Direction::Short] {
        for &rule in &rules {
            let fired = match rule {
                RuleGroup::Breakout => breakout(&params.breakout, direction, c, prev),
                RuleGroup::EmaCross => ema_cross(&params.ema_cross, direction, c, prev),
                RuleGroup::MeanReversion => mean_reversion(&params.mean_reversion, direction, c),
                RuleGroup::Momentum => momentum(&params.momentum, direction, c, prev),
            };
            if fired {
                return Evaluation::Signal { direction, rule };
            }
        }
    }

    Evaluation::NoSignal
}

// =============================================================================
// Rule groups
// =============================================================================

fn volume_elevated(c: &EnrichedBar, multiplier: f64) -> bool {
    c.bar.volume > multiplier * c.ind.volume_sma
}

fn breakout(rule: &BreakoutRule, direction: Direction, c: &EnrichedBar, prev: &EnrichedBar) -> bool {
    let close = c.bar.close;
    let (outside_band, reversal, trend_ok, rsi_ok) = match direction {
        Direction::Long => (
            close > c.ind.bb_upper,
            c.bar.is_bullish() && prev.bar.is_bearish(),
            close > c.ind.ema_trend,
            rule.rsi_long_min.map_or(true, |min| c.ind.rsi > min),
        ),
        Direction::Short => (
            close < c.ind.bb_lower,
            c.bar.is_bearish() && prev.bar.is_bullish(),
            close < c.ind.ema_trend,
            rule.rsi_short_max.map_or(true, |max| c.ind.rsi < max),
        ),
    };

    outside_band
        && (!rule.require_reversal_candle || reversal)
        && (!rule.trend_filter || trend_ok)
        && rsi_ok
        && volume_elevated(c, rule.volume_multiplier)
        && c.ind.adx > rule.adx_min
}

fn ema_cross(rule: &EmaCrossRule, direction: Direction, c: &EnrichedBar, prev: &EnrichedBar) -> bool {
    match direction {
        Direction::Long => {
            prev.ind.ema_fast <= prev.ind.ema_slow
                && c.ind.ema_fast > c.ind.ema_slow
                && c.ind.rsi > rule.rsi_midline
        }
        Direction::Short => {
            prev.ind.ema_fast >= prev.ind.ema_slow
                && c.ind.ema_fast < c.ind.ema_slow
                && c.ind.rsi < rule.rsi_midline
        }
    }
}

fn mean_reversion(rule: &MeanReversionRule, direction: Direction, c: &EnrichedBar) -> bool {
    match direction {
        Direction::Long => c.ind.rsi < rule.rsi_oversold && c.bar.close > c.ind.sma_trend,
        Direction::Short => c.ind.rsi > rule.rsi_overbought && c.bar.close < c.ind.sma_trend,
    }
}

fn momentum(rule: &MomentumRule, direction: Direction, c: &EnrichedBar, prev: &EnrichedBar) -> bool {
    let directional = match direction {
        Direction::Long => {
            c.bar.is_bullish()
                && c.bar.close > prev.bar.high
                && c.ind.rsi > rule.rsi_long_min
                && c.ind.plus_di > c.ind.minus_di
        }
        Direction::Short => {
            c.bar.is_bearish()
                && c.bar.close < prev.bar.low
                && c.ind.rsi < rule.rsi_short_max
                && c.ind.minus_di > c.ind.plus_di
        }
    };
    directional && volume_elevated(c, rule.volume_multiplier)
}
