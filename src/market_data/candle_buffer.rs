use std::collections::VecDeque;

use anyhow::{Context, Result};
use futures_util::StreamExt;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tokio_tungstenite::connect_async;
use tracing::{debug, error, info, warn};

// ---------------------------------------------------------------------------
// Data types
// ---------------------------------------------------------------------------

/// One closed OHLCV candle. Immutable once appended to a [`BarWindow`].
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Bar {
    /// Candle open time, epoch milliseconds.
    pub open_time: i64,
    pub open: f64,
    pub high: f64,
    pub low: f64,
    pub close: f64,
    pub volume: f64,
}

impl Bar {
    pub fn new(open_time: i64, open: f64, high: f64, low: f64, close: f64, volume: f64) -> Self {
        Self {
            open_time,
            open,
            high,
            low,
            close,
            volume,
        }
    }

    /// `true` when the candle closed above its open.
    pub fn is_bullish(&self) -> bool {
        self.close > self.open
    }

    /// `true` when the candle closed below its open.
    pub fn is_bearish(&self) -> bool {
        self.close < self.open
    }
}

/// What happened to a bar offered to [`BarWindow::push`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PushOutcome {
    /// New bar appended at the end of the window.
    Appended,
    /// Same open time as the newest bar; the newest bar was replaced.
    Replaced,
    /// Older than the newest bar; ignored.
    Stale,
}

// ---------------------------------------------------------------------------
// BarWindow -- bounded, time-ordered retention window for one instrument
// ---------------------------------------------------------------------------

/// Append-only ring of closed bars, capped at `capacity` with FIFO eviction.
///
/// The same candle can arrive twice (once from the REST poll, once from the
/// kline stream); a bar with the newest bar's open time replaces it instead
/// of being appended.
#[derive(Debug, Clone)]
pub struct BarWindow {
    bars: VecDeque<Bar>,
    capacity: usize,
}

impl BarWindow {
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(2);
        Self {
            bars: VecDeque::with_capacity(capacity + 1),
            capacity,
        }
    }

    pub fn push(&mut self, bar: Bar) -> PushOutcome {
        let outcome = match self.bars.back() {
            Some(last) if bar.open_time < last.open_time => return PushOutcome::Stale,
            Some(last) if bar.open_time == last.open_time => {
                self.bars.pop_back();
                PushOutcome::Replaced
            }
            _ => PushOutcome::Appended,
        };
        self.bars.push_back(bar);
        while self.bars.len() > self.capacity {
            self.bars.pop_front();
        }
        outcome
    }

    /// Merge a batch of bars (oldest first), e.g. a REST kline snapshot.
    /// Returns how many bars were appended.
    pub fn extend<I: IntoIterator<Item = Bar>>(&mut self, bars: I) -> usize {
        bars.into_iter()
            .filter(|bar| self.push(*bar) == PushOutcome::Appended)
            .count()
    }

    /// Contiguous oldest-first copy of the retained bars.
    pub fn to_vec(&self) -> Vec<Bar> {
        self.bars.iter().copied().collect()
    }

    pub fn last(&self) -> Option<&Bar> {
        self.bars.back()
    }

    pub fn len(&self) -> usize {
        self.bars.len()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }
}

// ---------------------------------------------------------------------------
// Kline WebSocket stream (push source)
// ---------------------------------------------------------------------------

const FUTURES_WS_BASE: &str = "wss://fstream.binance.com/ws";

/// Helper: Binance sends numeric values as JSON strings inside kline objects.
fn parse_string_f64(val: &serde_json::Value, name: &str) -> Result<f64> {
    match val {
        serde_json::Value::String(s) => s
            .parse::<f64>()
            .with_context(|| format!("failed to parse {name} as f64: {s}")),
        serde_json::Value::Number(n) => n
            .as_f64()
            .with_context(|| format!("field {name} is not a valid f64")),
        _ => anyhow::bail!("field {name} has unexpected JSON type"),
    }
}

/// Parse a kline event. Returns `Ok(None)` for anything that is not a closed
/// kline (other event types, in-progress candles).
///
/// Accepts both the single-stream payload and the combined-stream envelope:
/// ```json
/// { "e": "kline", "s": "BTCUSDT", "k": { "t": ..., "o": "...", "x": true, ... } }
/// ```
pub fn parse_closed_kline(text: &str) -> Result<Option<Bar>> {
    let root: serde_json::Value =
        serde_json::from_str(text).context("failed to parse kline JSON")?;

    let data = if root.get("data").is_some() {
        &root["data"]
    } else {
        &root
    };

    if data["e"].as_str() != Some("kline") {
        return Ok(None);
    }

    let k = &data["k"];
    let is_closed = k["x"].as_bool().context("missing field k.x")?;
    if !is_closed {
        return Ok(None);
    }

    let bar = Bar {
        open_time: k["t"].as_i64().context("missing field k.t")?,
        open: parse_string_f64(&k["o"], "k.o")?,
        high: parse_string_f64(&k["h"], "k.h")?,
        low: parse_string_f64(&k["l"], "k.l")?,
        close: parse_string_f64(&k["c"], "k.c")?,
        volume: parse_string_f64(&k["v"], "k.v")?,
    };
    Ok(Some(bar))
}

/// Connect to the futures kline stream for one `(symbol, interval)` pair and
/// forward every closed candle to `tx`.
///
/// Runs until the stream disconnects or an error occurs, then returns so that
/// the caller can reconnect.
pub async fn run_kline_stream(symbol: &str, interval: &str, tx: &mpsc::Sender<Bar>) -> Result<()> {
    let lower = symbol.to_lowercase();
    let url = format!("{FUTURES_WS_BASE}/{lower}@kline_{interval}");
    info!(url = %url, symbol = %symbol, interval = %interval, "connecting to kline WebSocket");

    let (ws_stream, _response) = connect_async(&url)
        .await
        .context("failed to connect to kline WebSocket")?;

    info!(symbol = %symbol, interval = %interval, "kline WebSocket connected");
    let (_write, mut read) = ws_stream.split();

    loop {
        match read.next().await {
            Some(Ok(msg)) => {
                if let tokio_tungstenite::tungstenite::Message::Text(text) = msg {
                    match parse_closed_kline(&text) {
                        Ok(Some(bar)) => {
                            debug!(open_time = bar.open_time, close = bar.close, "closed candle");
                            if tx.send(bar).await.is_err() {
                                warn!(symbol = %symbol, "tick processor gone; closing kline stream");
                                return Ok(());
                            }
                        }
                        Ok(None) => {}
                        Err(e) => warn!(error = %e, "failed to parse kline message"),
                    }
                }
            }
            Some(Err(e)) => {
                error!(error = %e, "kline WebSocket read error");
                return Err(e.into());
            }
            None => {
                warn!(symbol = %symbol, interval = %interval, "kline WebSocket stream ended");
                return Ok(());
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    fn bar_at(open_time: i64, close: f64) -> Bar {
        Bar::new(open_time, close, close + 1.0, close - 1.0, close, 100.0)
    }

    #[test]
    fn window_evicts_oldest_first() {
        let mut window = BarWindow::new(3);
        for i in 0..5 {
            window.push(bar_at(i * 60_000, 100.0 + i as f64));
        }
        let closes: Vec<f64> = window.to_vec().iter().map(|b| b.close).collect();
        assert_eq!(closes, vec![102.0, 103.0, 104.0]);
    }

    #[test]
    fn redelivered_candle_replaces_newest() {
        let mut window = BarWindow::new(10);
        assert_eq!(window.push(bar_at(0, 50.0)), PushOutcome::Appended);
        assert_eq!(window.push(bar_at(60_000, 51.0)), PushOutcome::Appended);
        assert_eq!(window.push(bar_at(60_000, 52.0)), PushOutcome::Replaced);
        assert_eq!(window.len(), 2);
        assert_eq!(window.last().map(|b| b.close), Some(52.0));
    }

    #[test]
    fn stale_candle_is_ignored() {
        let mut window = BarWindow::new(10);
        window.push(bar_at(120_000, 10.0));
        assert_eq!(window.push(bar_at(60_000, 9.0)), PushOutcome::Stale);
        assert_eq!(window.len(), 1);
    }

    #[test]
    fn extend_counts_only_new_bars() {
        let mut window = BarWindow::new(10);
        window.push(bar_at(0, 1.0));
        let appended = window.extend(vec![bar_at(0, 1.5), bar_at(60_000, 2.0), bar_at(120_000, 3.0)]);
        assert_eq!(appended, 2);
        assert_eq!(window.len(), 3);
    }

    #[test]
    fn parse_closed_kline_ok() {
        let json = r#"{
            "e": "kline",
            "s": "BTCUSDT",
            "k": {
                "t": 1700000000000,
                "T": 1700000299999,
                "i": "5m",
                "o": "37000.00",
                "h": "37050.00",
                "l": "36990.00",
                "c": "37020.00",
                "v": "123.456",
                "x": true
            }
        }"#;
        let bar = parse_closed_kline(json).expect("should parse").expect("closed");
        assert_eq!(bar.open_time, 1_700_000_000_000);
        assert!((bar.close - 37020.0).abs() < f64::EPSILON);
        assert!((bar.volume - 123.456).abs() < 1e-12);
    }

    #[test]
    fn parse_ignores_open_candles_and_other_events() {
        let open = r#"{"e":"kline","k":{"t":0,"o":"1","h":"1","l":"1","c":"1","v":"1","x":false}}"#;
        assert!(parse_closed_kline(open).unwrap().is_none());

        let trade = r#"{"e":"aggTrade","p":"1.0"}"#;
        assert!(parse_closed_kline(trade).unwrap().is_none());
    }

    #[test]
    fn parse_combined_envelope() {
        let json = r#"{"stream":"btcusdt@kline_5m","data":{"e":"kline","k":{"t":5,"o":"1","h":"2","l":"0.5","c":"1.5","v":"10","x":true}}}"#;
        let bar = parse_closed_kline(json).unwrap().unwrap();
        assert_eq!(bar.open_time, 5);
        assert!(bar.is_bullish());
    }
}
