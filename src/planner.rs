// =============================================================================
// Order Planner: bracket construction
// =============================================================================
//
// For a LONG/SHORT decision the planner emits, in submission order:
//
//   1. MARKET entry for the sized quantity.
//   2. STOP_MARKET fixed stop (closePosition).
//   3. TRAILING_STOP_MARKET with activation price and callback rate
//      (reduce-only, full quantity).
//   4. LIMIT GTC take-profit (reduce-only, full quantity).
//
// Legs 2-4 are independently switchable.  Offset prices are computed in exact
// decimal and snapped to the tick grid: LONG brackets round down, SHORT
// brackets round up, so rounding never tightens a stop and never pushes a
// target further away.
// =============================================================================

use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

use crate::sizing::{price_to_decimal, round_to_increment, Rounding};
use crate::types::{Direction, OrderSide};

#[derive(Debug, Error, PartialEq)]
pub enum PlanError {
    #[error("entry price {0} is not a positive finite number")]
    InvalidEntryPrice(f64),

    #[error("quantity must be positive, got {0}")]
    InvalidQuantity(Decimal),

    #[error("{leg} price rounds to {price}, not a valid order price")]
    NonPositivePrice { leg: OrderLeg, price: Decimal },

    #[error("trailing callback rate {0}% outside the exchange range 0.1..=10")]
    CallbackRateOutOfRange(Decimal),

    #[error("decimal overflow while pricing {0}")]
    Overflow(OrderLeg),
}

// =============================================================================
// Order requests
// =============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum OrderType {
    Market,
    Limit,
    StopMarket,
    TrailingStopMarket,
}

impl OrderType {
    pub fn as_binance_str(&self) -> &'static str {
        match self {
            Self::Market => "MARKET",
            Self::Limit => "LIMIT",
            Self::StopMarket => "STOP_MARKET",
            Self::TrailingStopMarket => "TRAILING_STOP_MARKET",
        }
    }
}

/// Role of an order within a bracket or the timeout sweep.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum OrderLeg {
    Entry,
    StopLoss,
    TrailingStop,
    TakeProfit,
    TimeoutClose,
}

impl OrderLeg {
    /// Short code used as the client order id prefix.
    fn code(&self) -> &'static str {
        match self {
            Self::Entry => "en",
            Self::StopLoss => "sl",
            Self::TrailingStop => "ts",
            Self::TakeProfit => "tp",
            Self::TimeoutClose => "tc",
        }
    }
}

impl std::fmt::Display for OrderLeg {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Entry => write!(f, "entry"),
            Self::StopLoss => write!(f, "stop_loss"),
            Self::TrailingStop => write!(f, "trailing_stop"),
            Self::TakeProfit => write!(f, "take_profit"),
            Self::TimeoutClose => write!(f, "timeout_close"),
        }
    }
}

/// One order as the gateway should submit it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OrderRequest {
    pub symbol: String,
    pub leg: OrderLeg,
    pub side: OrderSide,
    pub order_type: OrderType,
    /// `None` when `close_position` is set.
    pub quantity: Option<Decimal>,
    /// Limit price.
    pub price: Option<Decimal>,
    /// Trigger price for STOP_MARKET.
    pub stop_price: Option<Decimal>,
    /// Activation price for TRAILING_STOP_MARKET.
    pub activation_price: Option<Decimal>,
    /// Trailing callback in percent (1.0 = 1%).
    pub callback_rate: Option<Decimal>,
    /// Only GTC is used.
    pub good_till_cancel: bool,
    pub reduce_only: bool,
    pub close_position: bool,
    pub client_order_id: String,
}

impl OrderRequest {
    fn new(symbol: &str, leg: OrderLeg, side: OrderSide, order_type: OrderType, id: Uuid) -> Self {
        Self {
            symbol: symbol.to_string(),
            leg,
            side,
            order_type,
            quantity: None,
            price: None,
            stop_price: None,
            activation_price: None,
            callback_rate: None,
            good_till_cancel: false,
            reduce_only: false,
            close_position: false,
            client_order_id: client_order_id(leg, id),
        }
    }
}

/// `<leg>-<uuid simple>`: 35 characters, inside the exchange's 36 limit.
fn client_order_id(leg: OrderLeg, id: Uuid) -> String {
    format!("{}-{}", leg.code(), id.simple())
}

// =============================================================================
// Bracket parameters
// =============================================================================

/// Protective-leg percentages (fractions) and switches.
#[derive(Debug, Clone, PartialEq)]
pub struct BracketParams {
    pub stop_loss_percent: Decimal,
    pub take_profit_percent: Decimal,
    pub trailing_start_percent: Decimal,
    pub trailing_callback_percent: Decimal,
    pub enable_stop_loss: bool,
    pub enable_take_profit: bool,
    pub enable_trailing: bool,
    pub tick_size: Decimal,
}

/// Entry followed by the enabled protective legs, in submission order.
#[derive(Debug, Clone, PartialEq)]
pub struct BracketPlan {
    pub position_id: Uuid,
    pub direction: Direction,
    pub entry: OrderRequest,
    pub protective: Vec<OrderRequest>,
}

/// Build the bracket for `direction` at `entry_price`.
///
/// `position_id` seeds every client order id so the legs of one bracket can be
/// correlated on the exchange.
pub fn plan_bracket(
    symbol: &str,
    direction: Direction,
    entry_price: f64,
    quantity: Decimal,
    params: &BracketParams,
    position_id: Uuid,
) -> Result<BracketPlan, PlanError> {
    let entry_price = price_to_decimal(entry_price)
        .filter(|p| *p > Decimal::ZERO)
        .ok_or(PlanError::InvalidEntryPrice(entry_price))?;
    if quantity <= Decimal::ZERO {
        return Err(PlanError::InvalidQuantity(quantity));
    }

    let entry_side = direction.entry_side();
    let exit_side = direction.exit_side();
    let rounding = match direction {
        Direction::Long => Rounding::Down,
        Direction::Short => Rounding::Up,
    };
    // +1 for prices on the profit side of a LONG, -1 for a SHORT.
    let profit_sign = match direction {
        Direction::Long => Decimal::ONE,
        Direction::Short => Decimal::NEGATIVE_ONE,
    };

    let price_at = |leg: OrderLeg, offset: Decimal| -> Result<Decimal, PlanError> {
        let factor = Decimal::ONE
            .checked_add(offset.checked_mul(profit_sign).ok_or(PlanError::Overflow(leg))?)
            .ok_or(PlanError::Overflow(leg))?;
        let raw = entry_price
            .checked_mul(factor)
            .ok_or(PlanError::Overflow(leg))?;
        let price = round_to_increment(raw, params.tick_size, rounding);
        if price <= Decimal::ZERO {
            return Err(PlanError::NonPositivePrice { leg, price });
        }
        Ok(price)
    };

    let mut entry = OrderRequest::new(symbol, OrderLeg::Entry, entry_side, OrderType::Market, position_id);
    entry.quantity = Some(quantity);

    let mut protective = Vec::with_capacity(3);

    if params.enable_stop_loss {
        let leg = OrderLeg::StopLoss;
        let mut order = OrderRequest::new(symbol, leg, exit_side, OrderType::StopMarket, position_id);
        order.stop_price = Some(price_at(leg, -params.stop_loss_percent)?);
        order.close_position = true;
        protective.push(order);
    }

    if params.enable_trailing {
        let leg = OrderLeg::TrailingStop;
        let callback = callback_rate_percent(params.trailing_callback_percent)?;

        let mut order =
            OrderRequest::new(symbol, leg, exit_side, OrderType::TrailingStopMarket, position_id);
        order.activation_price = Some(price_at(leg, params.trailing_start_percent)?);
        order.callback_rate = Some(callback);
        order.quantity = Some(quantity);
        order.reduce_only = true;
        protective.push(order);
    }

    if params.enable_take_profit {
        let leg = OrderLeg::TakeProfit;
        let mut order = OrderRequest::new(symbol, leg, exit_side, OrderType::Limit, position_id);
        order.price = Some(price_at(leg, params.take_profit_percent)?);
        order.quantity = Some(quantity);
        order.good_till_cancel = true;
        order.reduce_only = true;
        protective.push(order);
    }

    Ok(BracketPlan {
        position_id,
        direction,
        entry,
        protective,
    })
}

/// Market reduce-only order flattening `quantity` of a `direction` position.
pub fn timeout_close(symbol: &str, direction: Direction, quantity: Decimal, position_id: Uuid) -> OrderRequest {
    let mut order = OrderRequest::new(
        symbol,
        OrderLeg::TimeoutClose,
        direction.exit_side(),
        OrderType::Market,
        position_id,
    );
    order.quantity = Some(quantity);
    order.reduce_only = true;
    order
}

/// Binance `callbackRate` for a fractional callback: percent with one decimal,
/// accepted range 0.1..=10.
pub fn callback_rate_percent(fraction: Decimal) -> Result<Decimal, PlanError> {
    let callback = fraction
        .checked_mul(Decimal::ONE_HUNDRED)
        .ok_or(PlanError::Overflow(OrderLeg::TrailingStop))?
        .round_dp(1);
    if callback < Decimal::new(1, 1) || callback > Decimal::TEN {
        return Err(PlanError::CallbackRateOutOfRange(callback));
    }
    Ok(callback)
}
