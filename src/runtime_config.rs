// =============================================================================
// Bot Configuration: static settings with atomic save and env overrides
// =============================================================================
//
// Every tunable lives here: instrument, cadence, leverage, sizing, bracket
// percentages, admission cap, timeout and the signal thresholds.  Loaded once
// at startup; the tick processor receives an immutable copy.
//
// Persistence uses an atomic tmp + rename pattern to prevent corruption on
// crash.  All fields carry serde defaults so that adding new fields never
// breaks loading an older config file.
//
// Percentages are fractions: 0.02 means 2 %.
// =============================================================================

use std::path::Path;

use anyhow::{ensure, Context, Result};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::indicators::IndicatorSettings;
use crate::market_data::interval_secs;
use crate::planner::{callback_rate_percent, BracketParams};
use crate::sizing::{PositionSizer, SizingStrategy};
use crate::strategy::{SignalParams, StrategyProfile};
use crate::types::AccountMode;

pub const DEFAULT_CONFIG_PATH: &str = "bot_config.json";

// =============================================================================
// Default-value helpers (required by serde `default = "..."` attribute)
// =============================================================================

fn default_true() -> bool {
    true
}

fn default_symbol() -> String {
    "BTCUSDT".to_string()
}

fn default_interval() -> String {
    "5m".to_string()
}

fn default_leverage() -> u32 {
    20
}

fn default_max_open_trades() -> usize {
    10
}

fn default_retention_bars() -> usize {
    250
}

fn default_timeout_bars() -> u32 {
    15
}

fn default_profile() -> StrategyProfile {
    StrategyProfile::Momentum
}

fn default_stop_loss_percent() -> Decimal {
    Decimal::new(2, 2)
}

fn default_take_profit_percent() -> Decimal {
    Decimal::new(4, 2)
}

fn default_trailing_start_percent() -> Decimal {
    Decimal::new(1, 2)
}

fn default_trailing_callback_percent() -> Decimal {
    Decimal::new(5, 3)
}

fn default_tick_size() -> Decimal {
    Decimal::new(1, 1)
}

fn default_step_size() -> Decimal {
    Decimal::new(1, 3)
}

fn default_settle_delay_ms() -> u64 {
    2_000
}

// =============================================================================
// BotConfig
// =============================================================================

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BotConfig {
    // --- Modes ----------------------------------------------------------------

    /// Demo simulates fills; Live sends signed orders.
    #[serde(default)]
    pub account_mode: AccountMode,

    /// Route REST traffic to the futures testnet.
    #[serde(default)]
    pub use_testnet: bool,

    // --- Instrument & cadence ------------------------------------------------

    #[serde(default = "default_symbol")]
    pub symbol: String,

    /// Kline interval, e.g. "1m", "5m", "1h".
    #[serde(default = "default_interval")]
    pub interval: String,

    /// Subscribe to the closed-kline stream in addition to polling.
    #[serde(default = "default_true")]
    pub use_websocket: bool,

    /// Wait after each candle boundary before polling, so the exchange has
    /// finalised the bar.
    #[serde(default = "default_settle_delay_ms")]
    pub settle_delay_ms: u64,

    // --- Limits -------------------------------------------------------------

    #[serde(default = "default_leverage")]
    pub leverage: u32,

    /// Admission cap on concurrently open positions.
    #[serde(default = "default_max_open_trades")]
    pub max_open_trades: usize,

    /// Bars kept in the retention window.
    #[serde(default = "default_retention_bars")]
    pub retention_bars: usize,

    /// Force-close tracked positions after this many bars; 0 disables.
    #[serde(default = "default_timeout_bars")]
    pub timeout_bars: u32,

    // --- Signals ------------------------------------------------------------

    /// Named threshold preset.
    #[serde(default = "default_profile")]
    pub profile: StrategyProfile,

    /// Explicit thresholds; when present they replace the profile preset.
    #[serde(default)]
    pub signals: Option<SignalParams>,

    #[serde(default)]
    pub indicators: IndicatorSettings,

    // --- Sizing & bracket ---------------------------------------------------

    #[serde(default)]
    pub sizing: SizingStrategy,

    #[serde(default = "default_stop_loss_percent")]
    pub stop_loss_percent: Decimal,

    #[serde(default = "default_take_profit_percent")]
    pub take_profit_percent: Decimal,

    /// Trailing stop activates this far into profit.
    #[serde(default = "default_trailing_start_percent")]
    pub trailing_start_percent: Decimal,

    #[serde(default = "default_trailing_callback_percent")]
    pub trailing_callback_percent: Decimal,

    #[serde(default = "default_true")]
    pub enable_stop_loss: bool,

    #[serde(default = "default_true")]
    pub enable_take_profit: bool,

    #[serde(default = "default_true")]
    pub enable_trailing: bool,

    /// Price increment of the instrument.
    #[serde(default = "default_tick_size")]
    pub tick_size: Decimal,

    /// Quantity increment of the instrument.
    #[serde(default = "default_step_size")]
    pub step_size: Decimal,
}

impl Default for BotConfig {
    fn default() -> Self {
        Self {
            account_mode: AccountMode::Demo,
            use_testnet: false,
            symbol: default_symbol(),
            interval: default_interval(),
            use_websocket: true,
            settle_delay_ms: default_settle_delay_ms(),
            leverage: default_leverage(),
            max_open_trades: default_max_open_trades(),
            retention_bars: default_retention_bars(),
            timeout_bars: default_timeout_bars(),
            profile: default_profile(),
            signals: None,
            indicators: IndicatorSettings::default(),
            sizing: SizingStrategy::default(),
            stop_loss_percent: default_stop_loss_percent(),
            take_profit_percent: default_take_profit_percent(),
            trailing_start_percent: default_trailing_start_percent(),
            trailing_callback_percent: default_trailing_callback_percent(),
            enable_stop_loss: true,
            enable_take_profit: true,
            enable_trailing: true,
            tick_size: default_tick_size(),
            step_size: default_step_size(),
        }
    }
}

impl BotConfig {
    /// Load configuration from a JSON file at `path`.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();

        let content = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read bot config from {}", path.display()))?;

        let config: Self = serde_json::from_str(&content)
            .with_context(|| format!("failed to parse bot config from {}", path.display()))?;

        info!(
            path = %path.display(),
            symbol = %config.symbol,
            interval = %config.interval,
            account_mode = %config.account_mode,
            "bot config loaded"
        );

        Ok(config)
    }

    /// Load `path`, or write a default config there when the file does not
    /// exist yet.  A file that exists but cannot be read or parsed is an
    /// error; it is never replaced.
    pub fn load_or_init(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        if path.exists() {
            return Self::load(path);
        }

        let config = Self::default();
        warn!(path = %path.display(), "no bot config found, writing defaults");
        config.save(path)?;
        Ok(config)
    }

    /// Persist the configuration to `path` using an atomic write
    /// (write to `.tmp`, then rename).
    pub fn save(&self, path: impl AsRef<Path>) -> Result<()> {
        let path = path.as_ref();

        let content =
            serde_json::to_string_pretty(self).context("failed to serialise bot config to JSON")?;

        let tmp_path = path.with_extension("json.tmp");

        std::fs::write(&tmp_path, &content)
            .with_context(|| format!("failed to write tmp config to {}", tmp_path.display()))?;

        std::fs::rename(&tmp_path, path)
            .with_context(|| format!("failed to rename tmp config to {}", path.display()))?;

        info!(path = %path.display(), "bot config saved (atomic)");
        Ok(())
    }

    /// Apply `BOT_SYMBOL`, `BOT_INTERVAL`, `BOT_ACCOUNT_MODE` and
    /// `BOT_PROFILE` from the process environment.
    pub fn apply_env_overrides(&mut self) -> Result<()> {
        self.apply_overrides(|key| std::env::var(key).ok())
    }

    /// Apply overrides from an arbitrary key lookup.
    pub fn apply_overrides(&mut self, lookup: impl Fn(&str) -> Option<String>) -> Result<()> {
        let non_empty = |key: &str| lookup(key).map(|v| v.trim().to_string()).filter(|v| !v.is_empty());

        if let Some(symbol) = non_empty("BOT_SYMBOL") {
            self.symbol = symbol.to_uppercase();
        }
        if let Some(interval) = non_empty("BOT_INTERVAL") {
            self.interval = interval;
        }
        if let Some(mode) = non_empty("BOT_ACCOUNT_MODE") {
            self.account_mode = mode.parse().context("BOT_ACCOUNT_MODE")?;
        }
        if let Some(profile) = non_empty("BOT_PROFILE") {
            self.profile = profile.parse().context("BOT_PROFILE")?;
            // An explicit profile wins over thresholds stored in the file.
            self.signals = None;
        }
        Ok(())
    }

    /// Thresholds in effect: explicit `signals` or the profile preset.
    pub fn signal_params(&self) -> SignalParams {
        self.signals.clone().unwrap_or_else(|| self.profile.params())
    }

    /// Length of one bar in seconds.
    pub fn bar_duration_secs(&self) -> Result<u64> {
        interval_secs(&self.interval)
            .with_context(|| format!("unsupported kline interval '{}'", self.interval))
    }

    /// Timeout sweep threshold in seconds; 0 when disabled.
    pub fn timeout_secs(&self) -> Result<i64> {
        Ok(i64::from(self.timeout_bars) * self.bar_duration_secs()? as i64)
    }

    pub fn bracket_params(&self) -> BracketParams {
        BracketParams {
            stop_loss_percent: self.stop_loss_percent,
            take_profit_percent: self.take_profit_percent,
            trailing_start_percent: self.trailing_start_percent,
            trailing_callback_percent: self.trailing_callback_percent,
            enable_stop_loss: self.enable_stop_loss,
            enable_take_profit: self.enable_take_profit,
            enable_trailing: self.enable_trailing,
            tick_size: self.tick_size,
        }
    }

    pub fn sizer(&self) -> PositionSizer {
        PositionSizer::new(
            self.sizing.clone(),
            self.leverage,
            self.stop_loss_percent,
            self.step_size,
        )
    }

    /// Reject configurations the engine cannot run safely.
    pub fn validate(&self) -> Result<()> {
        ensure!(!self.symbol.trim().is_empty(), "symbol must not be empty");
        self.bar_duration_secs()?;
        ensure!(
            (1..=125).contains(&self.leverage),
            "leverage {} outside 1..=125",
            self.leverage
        );
        ensure!(self.max_open_trades >= 1, "max_open_trades must be at least 1");

        for (name, value) in [
            ("stop_loss_percent", self.stop_loss_percent),
            ("take_profit_percent", self.take_profit_percent),
            ("trailing_start_percent", self.trailing_start_percent),
            ("trailing_callback_percent", self.trailing_callback_percent),
        ] {
            ensure!(
                value > Decimal::ZERO && value < Decimal::ONE,
                "{name} must be a fraction in (0, 1), got {value}"
            );
        }

        if self.enable_trailing {
            callback_rate_percent(self.trailing_callback_percent)
                .context("trailing_callback_percent must be 0.001..=0.1 once rounded to 0.1%")?;
        }

        ensure!(self.tick_size > Decimal::ZERO, "tick_size must be positive");
        ensure!(self.step_size > Decimal::ZERO, "step_size must be positive");

        match &self.sizing {
            SizingStrategy::FlatCapital { capital_per_trade } => {
                ensure!(*capital_per_trade > Decimal::ZERO, "capital_per_trade must be positive");
            }
            SizingStrategy::RiskBased {
                capital,
                risk_percent,
            } => {
                ensure!(*capital > Decimal::ZERO, "capital must be positive");
                ensure!(
                    *risk_percent > Decimal::ZERO && *risk_percent < Decimal::ONE,
                    "risk_percent must be a fraction in (0, 1), got {risk_percent}"
                );
            }
        }

        let params = self.signal_params();
        ensure!(
            !params.enabled_rules().is_empty(),
            "at least one signal rule group must be enabled"
        );
        let min_bars = params.min_bars(&self.indicators);
        ensure!(
            self.retention_bars >= min_bars,
            "retention_bars {} cannot cover the {} bars the enabled rules need",
            self.retention_bars,
            min_bars
        );
        Ok(())
    }
}

// =============================================================================
// Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;
    use std::collections::HashMap;

    #[test]
    fn default_config_has_expected_values() {
        let cfg = BotConfig::default();
        assert_eq!(cfg.account_mode, AccountMode::Demo);
        assert_eq!(cfg.symbol, "BTCUSDT");
        assert_eq!(cfg.interval, "5m");
        assert_eq!(cfg.leverage, 20);
        assert_eq!(cfg.max_open_trades, 10);
        assert_eq!(cfg.timeout_bars, 15);
        assert_eq!(cfg.stop_loss_percent, dec!(0.02));
        assert_eq!(cfg.trailing_callback_percent, dec!(0.005));
        assert_eq!(cfg.step_size, dec!(0.001));
        assert!(cfg.validate().is_ok());
    }

    #[test]
    fn deserialise_empty_json_uses_defaults() {
        let cfg: BotConfig = serde_json::from_str("{}").unwrap();
        assert_eq!(cfg, BotConfig::default());
    }

    #[test]
    fn deserialise_partial_json_fills_defaults() {
        let json = r#"{ "symbol": "ETHUSDT", "profile": "classic", "retention_bars": 100,
                        "sizing": { "mode": "risk_based", "capital": "1000", "risk_percent": "0.01" } }"#;
        let cfg: BotConfig = serde_json::from_str(json).unwrap();
        assert_eq!(cfg.symbol, "ETHUSDT");
        assert_eq!(cfg.profile, StrategyProfile::Classic);
        assert_eq!(cfg.signal_params(), StrategyProfile::Classic.params());
        assert!(matches!(cfg.sizing, SizingStrategy::RiskBased { .. }));
        assert_eq!(cfg.leverage, 20);
        assert!(cfg.validate().is_ok());
    }

    #[test]
    fn explicit_signals_override_profile() {
        let mut cfg = BotConfig::default();
        let mut custom = SignalParams::default();
        custom.breakout.adx_min = 40.0;
        cfg.signals = Some(custom.clone());
        assert_eq!(cfg.signal_params(), custom);
    }

    #[test]
    fn overrides_apply_and_profile_resets_signals() {
        let env: HashMap<&str, &str> = HashMap::from([
            ("BOT_SYMBOL", " ethusdt "),
            ("BOT_INTERVAL", "1m"),
            ("BOT_ACCOUNT_MODE", "live"),
            ("BOT_PROFILE", "scalper"),
        ]);
        let mut cfg = BotConfig {
            signals: Some(SignalParams::default()),
            ..BotConfig::default()
        };
        cfg.apply_overrides(|k| env.get(k).map(|v| v.to_string())).unwrap();
        assert_eq!(cfg.symbol, "ETHUSDT");
        assert_eq!(cfg.interval, "1m");
        assert_eq!(cfg.account_mode, AccountMode::Live);
        assert_eq!(cfg.profile, StrategyProfile::Scalper);
        assert!(cfg.signals.is_none());
    }

    #[test]
    fn bad_override_is_an_error() {
        let mut cfg = BotConfig::default();
        assert!(cfg
            .apply_overrides(|k| (k == "BOT_ACCOUNT_MODE").then(|| "yolo".to_string()))
            .is_err());
    }

    #[test]
    fn timeout_in_seconds() {
        let cfg = BotConfig::default();
        assert_eq!(cfg.bar_duration_secs().unwrap(), 300);
        assert_eq!(cfg.timeout_secs().unwrap(), 4500);
        let off = BotConfig {
            timeout_bars: 0,
            ..BotConfig::default()
        };
        assert_eq!(off.timeout_secs().unwrap(), 0);
    }

    #[test]
    fn validation_rejects_out_of_range_values() {
        let bad_pct = BotConfig {
            stop_loss_percent: dec!(2),
            ..BotConfig::default()
        };
        assert!(bad_pct.validate().is_err());

        let zero_pct = BotConfig {
            take_profit_percent: Decimal::ZERO,
            ..BotConfig::default()
        };
        assert!(zero_pct.validate().is_err());

        let bad_interval = BotConfig {
            interval: "7x".into(),
            ..BotConfig::default()
        };
        assert!(bad_interval.validate().is_err());

        let short_window = BotConfig {
            retention_bars: 100,
            ..BotConfig::default()
        };
        assert!(short_window.validate().is_err());

        let no_cap = BotConfig {
            max_open_trades: 0,
            ..BotConfig::default()
        };
        assert!(no_cap.validate().is_err());
    }

    #[test]
    fn callback_below_exchange_minimum_is_rejected() {
        let tiny = BotConfig {
            trailing_callback_percent: dec!(0.0004),
            ..BotConfig::default()
        };
        assert!(tiny.validate().is_err());

        let wide = BotConfig {
            trailing_callback_percent: dec!(0.2),
            ..BotConfig::default()
        };
        assert!(wide.validate().is_err());

        // Irrelevant once the trailing leg is off.
        let no_trailing = BotConfig {
            enable_trailing: false,
            ..tiny
        };
        assert!(no_trailing.validate().is_ok());

        let edge = BotConfig {
            trailing_callback_percent: dec!(0.001),
            ..BotConfig::default()
        };
        assert!(edge.validate().is_ok());
    }

    #[test]
    fn save_then_load_is_atomic_and_lossless() {
        let dir = std::env::temp_dir().join(format!("bot-config-{}", uuid::Uuid::new_v4()));
        std::fs::create_dir_all(&dir).unwrap();
        let path = dir.join("bot_config.json");

        let cfg = BotConfig {
            symbol: "SOLUSDT".into(),
            profile: StrategyProfile::Reversal,
            ..BotConfig::default()
        };
        cfg.save(&path).unwrap();
        assert!(!path.with_extension("json.tmp").exists());
        assert_eq!(BotConfig::load(&path).unwrap(), cfg);

        std::fs::remove_dir_all(&dir).unwrap();
    }

    fn scratch_dir() -> std::path::PathBuf {
        let dir = std::env::temp_dir().join(format!("bot-config-{}", uuid::Uuid::new_v4()));
        std::fs::create_dir_all(&dir).unwrap();
        dir
    }

    #[test]
    fn missing_file_is_initialised_with_defaults() {
        let dir = scratch_dir();
        let path = dir.join("bot_config.json");

        let cfg = BotConfig::load_or_init(&path).unwrap();
        assert_eq!(cfg, BotConfig::default());
        assert_eq!(BotConfig::load(&path).unwrap(), cfg);

        std::fs::remove_dir_all(&dir).unwrap();
    }

    #[test]
    fn malformed_file_is_fatal_and_left_untouched() {
        let dir = scratch_dir();
        let path = dir.join("bot_config.json");
        let broken = r#"{"profile":"classic","retention_bars":100,}"#;
        std::fs::write(&path, broken).unwrap();

        assert!(BotConfig::load_or_init(&path).is_err());
        assert_eq!(std::fs::read_to_string(&path).unwrap(), broken);

        std::fs::remove_dir_all(&dir).unwrap();
    }
}
