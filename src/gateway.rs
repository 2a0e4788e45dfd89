// =============================================================================
// Exchange Gateway: the request/response contract the engine trades through
// =============================================================================
//
// The tick processor only ever talks to `dyn ExchangeGateway`.  Two adapters
// implement it: the signed Binance USDⓈ-M REST client (live) and the paper
// gateway (demo).  Tests use an in-memory mock.
// =============================================================================

use async_trait::async_trait;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::market_data::Bar;
use crate::planner::OrderRequest;

#[derive(Debug, Error)]
pub enum GatewayError {
    /// Network failure, timeout, connection reset.
    #[error("transport error: {0}")]
    Transport(String),

    /// Error payload returned by the exchange.
    #[error("exchange error {code} (HTTP {status}): {message}")]
    Api {
        status: u16,
        code: i64,
        message: String,
    },

    /// The exchange answered with something we could not read.
    #[error("malformed response: {0}")]
    Parse(String),

    /// Missing credentials or a request the adapter refuses to send.
    #[error("request rejected locally: {0}")]
    Rejected(String),
}

impl GatewayError {
    /// Parse a `{"code": -1000, "msg": "..."}` error body.
    pub fn from_api_response(status: u16, body: &str) -> Self {
        #[derive(Deserialize)]
        struct ApiError {
            code: i64,
            msg: String,
        }

        match serde_json::from_str::<ApiError>(body) {
            Ok(err) => Self::Api {
                status,
                code: err.code,
                message: err.msg,
            },
            Err(_) => Self::Api {
                status,
                code: 0,
                message: body.chars().take(256).collect(),
            },
        }
    }

    /// Whether the same request may succeed if sent again later.
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::Transport(_) => true,
            Self::Api { status, code, .. } => {
                *status >= 500
                    || *status == 429
                    || *status == 418
                    // UNKNOWN, DISCONNECTED, TOO_MANY_REQUESTS, TIMEOUT,
                    // TOO_MANY_ORDERS, SERVER_BUSY
                    || matches!(code, -1000 | -1001 | -1003 | -1007 | -1015 | -1016)
            }
            Self::Parse(_) | Self::Rejected(_) => false,
        }
    }
}

impl From<reqwest::Error> for GatewayError {
    fn from(e: reqwest::Error) -> Self {
        if e.is_decode() {
            Self::Parse(e.to_string())
        } else {
            Self::Transport(e.to_string())
        }
    }
}

/// Exchange acknowledgement of a submitted order.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OrderAck {
    pub order_id: i64,
    pub client_order_id: String,
    pub status: String,
    /// Average fill price when the order filled immediately.
    pub avg_price: Option<Decimal>,
    pub executed_qty: Option<Decimal>,
}

#[async_trait]
pub trait ExchangeGateway: Send + Sync {
    /// The most recent CLOSED bars, oldest first, at most `limit`.
    async fn fetch_recent_bars(
        &self,
        symbol: &str,
        interval: &str,
        limit: u32,
    ) -> Result<Vec<Bar>, GatewayError>;

    /// Number of open positions on `symbol` as the exchange sees them.
    async fn open_position_count(&self, symbol: &str) -> Result<usize, GatewayError>;

    async fn submit_order(&self, order: &OrderRequest) -> Result<OrderAck, GatewayError>;

    async fn set_leverage(&self, symbol: &str, leverage: u32) -> Result<(), GatewayError>;
}
