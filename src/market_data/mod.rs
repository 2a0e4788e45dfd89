pub mod candle_buffer;

// Re-export the Bar struct for convenient access (e.g. `use crate::market_data::Bar`).
pub use candle_buffer::{Bar, BarWindow, PushOutcome};

/// Duration of one candle of a Binance interval string ("1m", "5m", "4h", ...)
/// in seconds. Returns `None` for unknown or malformed intervals.
pub fn interval_secs(interval: &str) -> Option<u64> {
    let interval = interval.trim();
    if interval.len() < 2 {
        return None;
    }
    let (count, unit) = interval.split_at(interval.len() - 1);
    let count: u64 = count.parse().ok().filter(|n| *n > 0)?;
    let unit_secs = match unit {
        "m" => 60,
        "h" => 3_600,
        "d" => 86_400,
        "w" => 604_800,
        _ => return None,
    };
    Some(count * unit_secs)
}

/// Milliseconds from `now_ms` until the next candle boundary of
/// `interval_secs`, plus `settle_ms` so the exchange has finalised the bar.
pub fn millis_until_next_boundary(now_ms: i64, interval_secs: u64, settle_ms: u64) -> u64 {
    let period_ms = (interval_secs * 1_000) as i64;
    if period_ms <= 0 {
        return settle_ms;
    }
    let into_period = now_ms.rem_euclid(period_ms);
    (period_ms - into_period) as u64 + settle_ms
}
