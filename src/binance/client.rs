// =============================================================================
// Binance USDⓈ-M Futures REST Client: HMAC-SHA256 signed requests
// =============================================================================
//
// SECURITY: The secret key is never logged or serialized. All signed requests
// include X-MBX-APIKEY as a header and a recvWindow of 5 000 ms to tolerate
// minor clock drift between the bot and Binance servers.
// =============================================================================

use anyhow::{Context, Result};
use async_trait::async_trait;
use hmac::{Hmac, Mac};
use reqwest::header::{HeaderMap, HeaderValue};
use reqwest::Method;
use rust_decimal::Decimal;
use sha2::Sha256;
use std::str::FromStr;
use tracing::{debug, instrument, warn};

use crate::gateway::{ExchangeGateway, GatewayError, OrderAck};
use crate::market_data::Bar;
use crate::planner::OrderRequest;

type HmacSha256 = Hmac<Sha256>;

/// Default recv-window sent with every signed request (milliseconds).
const RECV_WINDOW: u64 = 5000;

pub const MAINNET_URL: &str = "https://fapi.binance.com";
pub const TESTNET_URL: &str = "https://testnet.binancefuture.com";

/// Largest page the klines endpoint serves.
const MAX_KLINES: u32 = 1500;

/// Binance futures REST client with HMAC-SHA256 request signing.
#[derive(Clone)]
pub struct BinanceFuturesClient {
    secret: String,
    base_url: String,
    client: reqwest::Client,
}

impl BinanceFuturesClient {
    // -------------------------------------------------------------------------
    // Construction
    // -------------------------------------------------------------------------

    /// Create a new client against `base_url`.
    ///
    /// # Arguments
    /// * `api_key` - Binance API key (sent as a header, never in query params).
    /// * `secret`  - Binance secret key used exclusively for HMAC signing.
    pub fn new(
        api_key: impl Into<String>,
        secret: impl Into<String>,
        base_url: impl Into<String>,
    ) -> Result<Self> {
        let api_key = api_key.into();
        let base_url = base_url.into().trim_end_matches('/').to_string();

        let mut default_headers = HeaderMap::new();
        if !api_key.is_empty() {
            let val = HeaderValue::from_str(&api_key).context("API key is not a valid header value")?;
            default_headers.insert("X-MBX-APIKEY", val);
        }

        let client = reqwest::Client::builder()
            .default_headers(default_headers)
            .timeout(std::time::Duration::from_secs(10))
            .build()
            .context("failed to build reqwest client")?;

        debug!(base_url = %base_url, "BinanceFuturesClient initialised");

        Ok(Self {
            secret: secret.into(),
            base_url,
            client,
        })
    }

    // -------------------------------------------------------------------------
    // Signing helpers
    // -------------------------------------------------------------------------

    /// Produce an HMAC-SHA256 hex signature of `query`.
    fn sign(&self, query: &str) -> Result<String, GatewayError> {
        let mut mac = HmacSha256::new_from_slice(self.secret.as_bytes())
            .map_err(|e| GatewayError::Rejected(format!("invalid secret: {e}")))?;
        mac.update(query.as_bytes());
        Ok(hex::encode(mac.finalize().into_bytes()))
    }

    /// Build the full query string for a signed request (appends timestamp,
    /// recvWindow, and signature).
    fn signed_query(&self, params: &str) -> Result<String, GatewayError> {
        if self.secret.is_empty() {
            return Err(GatewayError::Rejected(
                "signed endpoint called without API credentials".into(),
            ));
        }
        let ts = chrono::Utc::now().timestamp_millis();
        let base = if params.is_empty() {
            format!("timestamp={ts}&recvWindow={RECV_WINDOW}")
        } else {
            format!("{params}&timestamp={ts}&recvWindow={RECV_WINDOW}")
        };
        let sig = self.sign(&base)?;
        Ok(format!("{base}&signature={sig}"))
    }

    /// Send a request and decode the JSON body, mapping non-2xx answers to
    /// [`GatewayError::Api`].
    async fn send(&self, method: Method, path: &str, query: &str) -> Result<serde_json::Value, GatewayError> {
        let url = format!("{}{}?{}", self.base_url, path, query);

        let resp = self.client.request(method.clone(), &url).send().await?;
        let status = resp.status();
        let body = resp.text().await?;

        if !status.is_success() {
            let err = GatewayError::from_api_response(status.as_u16(), &body);
            warn!(%method, path, error = %err, "Binance request failed");
            return Err(err);
        }

        serde_json::from_str(&body).map_err(|e| GatewayError::Parse(format!("{path}: {e}")))
    }

    // -------------------------------------------------------------------------
    // Endpoints
    // -------------------------------------------------------------------------

    /// GET /fapi/v1/klines (public).
    #[instrument(skip(self), name = "binance::get_klines")]
    pub async fn get_klines(&self, symbol: &str, interval: &str, limit: u32) -> Result<Vec<Bar>, GatewayError> {
        // One extra row: the newest kline is usually still forming.
        let limit = (limit + 1).min(MAX_KLINES);
        let query = format!("symbol={symbol}&interval={interval}&limit={limit}");
        let body = self.send(Method::GET, "/fapi/v1/klines", &query).await?;

        let now_ms = chrono::Utc::now().timestamp_millis();
        let bars = parse_klines(&body, now_ms).map_err(|e| GatewayError::Parse(format!("{e:#}")))?;
        debug!(symbol, interval, count = bars.len(), "klines fetched");
        Ok(bars)
    }

    /// GET /fapi/v2/positionRisk (signed).
    #[instrument(skip(self), name = "binance::get_position_risk")]
    pub async fn get_position_risk(&self, symbol: &str) -> Result<serde_json::Value, GatewayError> {
        let query = self.signed_query(&format!("symbol={symbol}"))?;
        self.send(Method::GET, "/fapi/v2/positionRisk", &query).await
    }

    /// POST /fapi/v1/order (signed).
    #[instrument(skip(self, order), fields(leg = %order.leg, coid = %order.client_order_id), name = "binance::place_order")]
    pub async fn place_order(&self, order: &OrderRequest) -> Result<OrderAck, GatewayError> {
        let query = self.signed_query(&order_params(order))?;
        let body = self.send(Method::POST, "/fapi/v1/order", &query).await?;
        let ack = parse_order_ack(&body).map_err(|e| GatewayError::Parse(format!("{e:#}")))?;
        debug!(order_id = ack.order_id, status = %ack.status, "order accepted");
        Ok(ack)
    }

    /// POST /fapi/v1/leverage (signed).
    #[instrument(skip(self), name = "binance::change_leverage")]
    pub async fn change_leverage(&self, symbol: &str, leverage: u32) -> Result<(), GatewayError> {
        let query = self.signed_query(&format!("symbol={symbol}&leverage={leverage}"))?;
        let body = self.send(Method::POST, "/fapi/v1/leverage", &query).await?;
        debug!(symbol, leverage = %body["leverage"], "leverage set");
        Ok(())
    }
}

#[async_trait]
impl ExchangeGateway for BinanceFuturesClient {
    async fn fetch_recent_bars(&self, symbol: &str, interval: &str, limit: u32) -> Result<Vec<Bar>, GatewayError> {
        let mut bars = self.get_klines(symbol, interval, limit).await?;
        let excess = bars.len().saturating_sub(limit as usize);
        bars.drain(..excess);
        Ok(bars)
    }

    async fn open_position_count(&self, symbol: &str) -> Result<usize, GatewayError> {
        let body = self.get_position_risk(symbol).await?;
        count_open_positions(&body, symbol).map_err(|e| GatewayError::Parse(format!("{e:#}")))
    }

    async fn submit_order(&self, order: &OrderRequest) -> Result<OrderAck, GatewayError> {
        self.place_order(order).await
    }

    async fn set_leverage(&self, symbol: &str, leverage: u32) -> Result<(), GatewayError> {
        self.change_leverage(symbol, leverage).await
    }
}

impl std::fmt::Debug for BinanceFuturesClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BinanceFuturesClient")
            .field("secret", &"<redacted>")
            .field("base_url", &self.base_url)
            .finish()
    }
}

// =============================================================================
// Wire encoding / decoding
// =============================================================================

/// Query parameters for POST /fapi/v1/order.
pub fn order_params(order: &OrderRequest) -> String {
    let mut params = format!(
        "symbol={}&side={}&type={}",
        order.symbol,
        order.side.as_binance_str(),
        order.order_type.as_binance_str()
    );

    if let Some(q) = order.quantity {
        params.push_str(&format!("&quantity={}", q.normalize()));
    }
    if let Some(p) = order.price {
        params.push_str(&format!("&price={}", p.normalize()));
    }
    if let Some(p) = order.stop_price {
        params.push_str(&format!("&stopPrice={}", p.normalize()));
    }
    if let Some(p) = order.activation_price {
        params.push_str(&format!("&activationPrice={}", p.normalize()));
    }
    if let Some(r) = order.callback_rate {
        params.push_str(&format!("&callbackRate={}", r.normalize()));
    }
    if order.good_till_cancel {
        params.push_str("&timeInForce=GTC");
    }
    // The exchange rejects reduceOnly alongside closePosition.
    if order.close_position {
        params.push_str("&closePosition=true");
    } else if order.reduce_only {
        params.push_str("&reduceOnly=true");
    }
    params.push_str(&format!("&newClientOrderId={}", order.client_order_id));
    params.push_str("&newOrderRespType=RESULT");
    params
}

/// Parse the klines array-of-arrays, keeping only candles closed before
/// `now_ms`.
///
/// Array indices:
///   [0] openTime, [1] open, [2] high, [3] low, [4] close, [5] volume,
///   [6] closeTime, ...
fn parse_klines(body: &serde_json::Value, now_ms: i64) -> Result<Vec<Bar>> {
    let raw = body.as_array().context("klines response is not an array")?;

    let mut bars = Vec::with_capacity(raw.len());
    for entry in raw {
        let arr = entry.as_array().context("kline entry is not an array")?;
        if arr.len() < 7 {
            warn!("skipping malformed kline entry with {} elements", arr.len());
            continue;
        }

        let close_time = arr[6].as_i64().context("kline closeTime is not an integer")?;
        if close_time >= now_ms {
            continue;
        }

        bars.push(Bar::new(
            arr[0].as_i64().context("kline openTime is not an integer")?,
            parse_str_f64(&arr[1])?,
            parse_str_f64(&arr[2])?,
            parse_str_f64(&arr[3])?,
            parse_str_f64(&arr[4])?,
            parse_str_f64(&arr[5])?,
        ));
    }
    Ok(bars)
}

/// Positions with a non-zero `positionAmt` on `symbol`. In hedge mode the
/// long and short legs count separately.
fn count_open_positions(body: &serde_json::Value, symbol: &str) -> Result<usize> {
    let entries = body.as_array().context("positionRisk response is not an array")?;

    let mut open = 0;
    for entry in entries {
        if entry["symbol"].as_str() != Some(symbol) {
            continue;
        }
        let amt = entry["positionAmt"]
            .as_str()
            .context("positionAmt missing")?;
        let amt = Decimal::from_str(amt).with_context(|| format!("bad positionAmt '{amt}'"))?;
        if !amt.is_zero() {
            open += 1;
        }
    }
    Ok(open)
}

fn parse_order_ack(body: &serde_json::Value) -> Result<OrderAck> {
    let decimal_field = |name: &str| -> Result<Option<Decimal>> {
        match body[name].as_str() {
            None => Ok(None),
            Some(s) => {
                let v = Decimal::from_str(s).with_context(|| format!("bad {name} '{s}'"))?;
                Ok((!v.is_zero()).then_some(v))
            }
        }
    };

    Ok(OrderAck {
        order_id: body["orderId"].as_i64().context("orderId missing")?,
        client_order_id: body["clientOrderId"].as_str().unwrap_or_default().to_string(),
        status: body["status"].as_str().unwrap_or("UNKNOWN").to_string(),
        avg_price: decimal_field("avgPrice")?,
        executed_qty: decimal_field("executedQty")?,
    })
}

/// Parse a JSON value that may be either a string or a number into `f64`.
fn parse_str_f64(val: &serde_json::Value) -> Result<f64> {
    if let Some(s) = val.as_str() {
        s.parse::<f64>()
            .with_context(|| format!("failed to parse '{s}' as f64"))
    } else if let Some(n) = val.as_f64() {
        Ok(n)
    } else {
        anyhow::bail!("expected string or number, got: {val}")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::planner::{plan_bracket, timeout_close, BracketParams, OrderLeg};
    use crate::types::Direction;
    use rust_decimal_macros::dec;
    use serde_json::json;
    use uuid::Uuid;

    fn bracket() -> crate::planner::BracketPlan {
        let params = BracketParams {
            stop_loss_percent: dec!(0.02),
            take_profit_percent: dec!(0.04),
            trailing_start_percent: dec!(0.01),
            trailing_callback_percent: dec!(0.005),
            enable_stop_loss: true,
            enable_take_profit: true,
            enable_trailing: true,
            tick_size: dec!(0.1),
        };
        plan_bracket("BTCUSDT", Direction::Long, 27000.0, dec!(0.007), &params, Uuid::nil()).unwrap()
    }

    #[test]
    fn entry_params() {
        let qs = order_params(&bracket().entry);
        assert!(qs.starts_with("symbol=BTCUSDT&side=BUY&type=MARKET&quantity=0.007"));
        assert!(!qs.contains("reduceOnly"));
        assert!(qs.contains("newClientOrderId=en-"));
    }

    #[test]
    fn stop_uses_close_position_without_reduce_only() {
        let plan = bracket();
        let sl = plan.protective.iter().find(|o| o.leg == OrderLeg::StopLoss).unwrap();
        let qs = order_params(sl);
        assert!(qs.contains("type=STOP_MARKET"));
        assert!(qs.contains("stopPrice=26460"));
        assert!(qs.contains("closePosition=true"));
        assert!(!qs.contains("reduceOnly"));
        assert!(!qs.contains("quantity="));
    }

    #[test]
    fn trailing_and_take_profit_params() {
        let plan = bracket();
        let ts = plan.protective.iter().find(|o| o.leg == OrderLeg::TrailingStop).unwrap();
        let qs = order_params(ts);
        assert!(qs.contains("type=TRAILING_STOP_MARKET"));
        assert!(qs.contains("activationPrice=27270"));
        assert!(qs.contains("callbackRate=0.5"));
        assert!(qs.contains("reduceOnly=true"));

        let tp = plan.protective.iter().find(|o| o.leg == OrderLeg::TakeProfit).unwrap();
        let qs = order_params(tp);
        assert!(qs.contains("type=LIMIT"));
        assert!(qs.contains("price=28080"));
        assert!(qs.contains("timeInForce=GTC"));
    }

    #[test]
    fn timeout_close_params() {
        let qs = order_params(&timeout_close("BTCUSDT", Direction::Long, dec!(0.007), Uuid::nil()));
        assert!(qs.contains("side=SELL&type=MARKET&quantity=0.007"));
        assert!(qs.contains("reduceOnly=true"));
    }

    #[test]
    fn klines_drop_unclosed_candle() {
        let body = json!([
            [1_000, "1.0", "2.0", "0.5", "1.5", "10.0", 1_299, "0", 1, "0", "0", "0"],
            [1_300, "1.5", "2.5", "1.0", "2.0", "12.0", 1_599, "0", 1, "0", "0", "0"],
            [1_600, "2.0", "2.2", "1.9", "2.1", "3.0", 1_899, "0", 1, "0", "0", "0"]
        ]);
        let bars = parse_klines(&body, 1_700).unwrap();
        assert_eq!(bars.len(), 2);
        assert_eq!(bars[1].open_time, 1_300);
        assert_eq!(bars[1].close, 2.0);
        assert_eq!(bars[0].volume, 10.0);
    }

    #[test]
    fn klines_reject_garbage() {
        let body = json!([[1_000, "x", "2.0", "0.5", "1.5", "10.0", 1_299]]);
        assert!(parse_klines(&body, 10_000).is_err());
        assert!(parse_klines(&json!({"code": -1}), 10_000).is_err());
    }

    #[test]
    fn position_count_from_non_zero_amounts() {
        let body = json!([
            {"symbol": "BTCUSDT", "positionAmt": "0.000", "positionSide": "BOTH"},
            {"symbol": "ETHUSDT", "positionAmt": "1.000", "positionSide": "BOTH"}
        ]);
        assert_eq!(count_open_positions(&body, "BTCUSDT").unwrap(), 0);

        let body = json!([
            {"symbol": "BTCUSDT", "positionAmt": "0.007", "positionSide": "LONG"},
            {"symbol": "BTCUSDT", "positionAmt": "-0.003", "positionSide": "SHORT"}
        ]);
        assert_eq!(count_open_positions(&body, "BTCUSDT").unwrap(), 2);
    }

    #[test]
    fn order_ack_zero_avg_price_is_none() {
        let ack = parse_order_ack(&json!({
            "orderId": 42,
            "clientOrderId": "en-abc",
            "status": "NEW",
            "avgPrice": "0.00000",
            "executedQty": "0"
        }))
        .unwrap();
        assert_eq!(ack.order_id, 42);
        assert_eq!(ack.avg_price, None);
        assert_eq!(ack.executed_qty, None);

        let filled = parse_order_ack(&json!({
            "orderId": 43,
            "clientOrderId": "en-abc",
            "status": "FILLED",
            "avgPrice": "27001.10",
            "executedQty": "0.007"
        }))
        .unwrap();
        assert_eq!(filled.avg_price, Some(dec!(27001.10)));
        assert_eq!(filled.executed_qty, Some(dec!(0.007)));
    }

    #[test]
    fn signed_query_requires_secret() {
        let client = BinanceFuturesClient::new("", "", TESTNET_URL).unwrap();
        assert!(matches!(client.signed_query("symbol=BTCUSDT"), Err(GatewayError::Rejected(_))));

        let client = BinanceFuturesClient::new("key", "secret", TESTNET_URL).unwrap();
        let qs = client.signed_query("symbol=BTCUSDT").unwrap();
        assert!(qs.starts_with("symbol=BTCUSDT&timestamp="));
        let sig = qs.rsplit("signature=").next().unwrap();
        assert_eq!(sig.len(), 64);
    }

    #[test]
    fn debug_redacts_secret() {
        let client = BinanceFuturesClient::new("key", "super-secret", MAINNET_URL).unwrap();
        assert!(!format!("{client:?}").contains("super-secret"));
    }
}
