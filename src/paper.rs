// =============================================================================
// Paper Gateway: demo-mode order simulation on live market data
// =============================================================================
//
// Klines come from the public futures endpoint; nothing signed is ever sent.
// Market orders fill immediately at the last close seen for the symbol and
// move a simulated net position (one-way mode, like the live account).
// Protective legs are acknowledged and kept as resting orders but never
// trigger; the timeout sweep is what flattens paper positions.
// =============================================================================

use std::collections::HashMap;

use async_trait::async_trait;
use parking_lot::Mutex;
use rust_decimal::Decimal;
use tracing::info;

use crate::binance::BinanceFuturesClient;
use crate::gateway::{ExchangeGateway, GatewayError, OrderAck};
use crate::market_data::Bar;
use crate::planner::{OrderRequest, OrderType};
use crate::sizing::price_to_decimal;
use crate::types::OrderSide;

#[derive(Debug, Default)]
struct PaperBook {
    last_price: HashMap<String, f64>,
    /// Signed net quantity per symbol (positive = long).
    net: HashMap<String, Decimal>,
    resting: Vec<OrderRequest>,
    leverage: HashMap<String, u32>,
    next_order_id: i64,
}

#[derive(Debug)]
pub struct PaperGateway {
    market: Option<BinanceFuturesClient>,
    book: Mutex<PaperBook>,
}

impl PaperGateway {
    /// Paper gateway pulling klines from `market`.
    pub fn new(market: BinanceFuturesClient) -> Self {
        Self {
            market: Some(market),
            book: Mutex::new(PaperBook::default()),
        }
    }

    /// Paper gateway without a market-data source; prices are fed through
    /// [`PaperGateway::record_price`].
    #[cfg(test)]
    pub fn offline() -> Self {
        Self {
            market: None,
            book: Mutex::new(PaperBook::default()),
        }
    }

    /// Remember `price` as the fill price for the next market order.
    pub fn record_price(&self, symbol: &str, price: f64) {
        self.book.lock().last_price.insert(symbol.to_string(), price);
    }

    /// Simulated signed net position.
    pub fn net_position(&self, symbol: &str) -> Decimal {
        self.book.lock().net.get(symbol).copied().unwrap_or_default()
    }

    #[cfg(test)]
    pub fn resting_orders(&self, symbol: &str) -> usize {
        self.book.lock().resting.iter().filter(|o| o.symbol == symbol).count()
    }
}

#[async_trait]
impl ExchangeGateway for PaperGateway {
    async fn fetch_recent_bars(&self, symbol: &str, interval: &str, limit: u32) -> Result<Vec<Bar>, GatewayError> {
        let Some(market) = &self.market else {
            return Ok(Vec::new());
        };
        let bars = market.fetch_recent_bars(symbol, interval, limit).await?;
        if let Some(last) = bars.last() {
            self.record_price(symbol, last.close);
        }
        Ok(bars)
    }

    async fn open_position_count(&self, symbol: &str) -> Result<usize, GatewayError> {
        Ok(usize::from(!self.net_position(symbol).is_zero()))
    }

    async fn submit_order(&self, order: &OrderRequest) -> Result<OrderAck, GatewayError> {
        let mut book = self.book.lock();
        book.next_order_id += 1;
        let order_id = book.next_order_id;

        if order.order_type != OrderType::Market {
            book.resting.push(order.clone());
            info!(
                symbol = %order.symbol,
                leg = %order.leg,
                order_type = order.order_type.as_binance_str(),
                order_id,
                "paper order resting"
            );
            return Ok(OrderAck {
                order_id,
                client_order_id: order.client_order_id.clone(),
                status: "NEW".into(),
                avg_price: None,
                executed_qty: None,
            });
        }

        let qty = order
            .quantity
            .ok_or_else(|| GatewayError::Rejected("market order without quantity".into()))?;
        let signed = match order.side {
            OrderSide::Buy => qty,
            OrderSide::Sell => -qty,
        };

        let current = book.net.get(&order.symbol).copied().unwrap_or_default();
        let next = if order.reduce_only {
            // Reduce toward zero, never flip.
            if current.is_zero() || current.is_sign_positive() == signed.is_sign_positive() {
                current
            } else if signed.abs() >= current.abs() {
                Decimal::ZERO
            } else {
                current + signed
            }
        } else {
            current + signed
        };
        let executed = (next - current).abs();
        book.net.insert(order.symbol.clone(), next);
        if next.is_zero() {
            book.resting.retain(|o| o.symbol != order.symbol);
        }

        let fill_price = book.last_price.get(&order.symbol).copied().and_then(price_to_decimal);

        info!(
            symbol = %order.symbol,
            leg = %order.leg,
            side = %order.side,
            qty = %executed,
            price = ?fill_price,
            net = %next,
            order_id,
            "paper fill"
        );

        Ok(OrderAck {
            order_id,
            client_order_id: order.client_order_id.clone(),
            status: "FILLED".into(),
            avg_price: fill_price,
            executed_qty: (!executed.is_zero()).then_some(executed),
        })
    }

    async fn set_leverage(&self, symbol: &str, leverage: u32) -> Result<(), GatewayError> {
        self.book.lock().leverage.insert(symbol.to_string(), leverage);
        info!(symbol, leverage, "paper leverage set");
        Ok(())
    }
}
