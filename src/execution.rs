// =============================================================================
// Execution Engine: submits bracket plans and timeout closes through the
// exchange gateway
// =============================================================================
//
// Entry first.  Protective legs go out only once the entry is acknowledged.
// A protective leg that fails is retried exactly once; if it fails again the
// position is live WITHOUT that protection and an `UNPROTECTED_POSITION`
// alert is raised for the operator.
// =============================================================================

use std::sync::Arc;

use rust_decimal::prelude::ToPrimitive;
use tracing::{error, info, instrument, warn};

use crate::gateway::{ExchangeGateway, GatewayError};
use crate::planner::{timeout_close, BracketPlan, OrderLeg, OrderRequest};
use crate::position_engine::OpenPosition;

// ---------------------------------------------------------------------------
// Result type
// ---------------------------------------------------------------------------

/// Outcome of a bracket submission whose entry was accepted.
#[derive(Debug, Clone, PartialEq)]
pub enum ExecutionResult {
    /// Entry and every enabled protective leg accepted.
    Protected(OpenPosition),
    /// Entry accepted but some protective legs were not.
    PartialBracket {
        position: OpenPosition,
        unprotected: Vec<OrderLeg>,
    },
}

impl ExecutionResult {
    pub fn position(&self) -> &OpenPosition {
        match self {
            Self::Protected(position) => position,
            Self::PartialBracket { position, .. } => position,
        }
    }
}

impl std::fmt::Display for ExecutionResult {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Protected(p) => write!(f, "Protected({} {})", p.direction, p.id),
            Self::PartialBracket { position, unprotected } => {
                write!(f, "PartialBracket({} {}, missing {:?})", position.direction, position.id, unprotected)
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Engine
// ---------------------------------------------------------------------------

pub struct ExecutionEngine {
    gateway: Arc<dyn ExchangeGateway>,
}

impl ExecutionEngine {
    pub fn new(gateway: Arc<dyn ExchangeGateway>) -> Self {
        Self { gateway }
    }

    /// Submit `plan`: entry, then each protective leg in order.
    ///
    /// `reference_price` is the close the decision was taken on; it becomes
    /// the tracked entry price when the exchange does not report a fill price.
    /// Returns `Err` only when the entry itself was rejected, in which case
    /// nothing is open.
    #[instrument(skip(self, plan), fields(position = %plan.position_id, direction = %plan.direction))]
    pub async fn execute_bracket(
        &self,
        plan: &BracketPlan,
        reference_price: f64,
        now_secs: i64,
    ) -> Result<ExecutionResult, GatewayError> {
        let ack = self.gateway.submit_order(&plan.entry).await.map_err(|e| {
            warn!(error = %e, "entry order rejected");
            e
        })?;

        let entry_price = ack
            .avg_price
            .and_then(|p| p.to_f64())
            .unwrap_or(reference_price);
        let quantity = ack
            .executed_qty
            .or(plan.entry.quantity)
            .unwrap_or_default();

        let position = OpenPosition {
            id: plan.position_id,
            entry_timestamp: now_secs,
            entry_price,
            direction: plan.direction,
            quantity,
        };

        info!(
            order_id = ack.order_id,
            entry_price,
            qty = %quantity,
            "entry filled"
        );

        let mut unprotected = Vec::new();
        for leg in &plan.protective {
            if !self.submit_protective(leg).await {
                unprotected.push(leg.leg);
            }
        }

        if unprotected.is_empty() {
            Ok(ExecutionResult::Protected(position))
        } else {
            Ok(ExecutionResult::PartialBracket {
                position,
                unprotected,
            })
        }
    }

    /// One attempt plus one immediate retry. `false` leaves the position
    /// without this leg.
    async fn submit_protective(&self, order: &OrderRequest) -> bool {
        let first = match self.gateway.submit_order(order).await {
            Ok(ack) => {
                info!(leg = %order.leg, order_id = ack.order_id, "protective leg placed");
                return true;
            }
            Err(e) => e,
        };

        error!(
            alert = "UNPROTECTED_POSITION",
            leg = %order.leg,
            coid = %order.client_order_id,
            error = %first,
            "protective leg rejected, retrying once"
        );

        match self.gateway.submit_order(order).await {
            Ok(ack) => {
                info!(leg = %order.leg, order_id = ack.order_id, "protective leg placed on retry");
                true
            }
            Err(e) => {
                error!(
                    alert = "UNPROTECTED_POSITION",
                    leg = %order.leg,
                    coid = %order.client_order_id,
                    error = %e,
                    "protective leg failed twice; position is live without it"
                );
                false
            }
        }
    }

    /// Flatten `position` with a reduce-only market order.
    ///
    /// The bracket's stop, trailing and take-profit orders are not cancelled
    /// (the gateway has no cancel); they stay resting on the exchange and can
    /// act on a later position on the same symbol until removed by hand.
    #[instrument(skip(self, position), fields(position = %position.id))]
    pub async fn close_position(&self, symbol: &str, position: &OpenPosition) -> Result<(), GatewayError> {
        let order = timeout_close(symbol, position.direction, position.quantity, position.id);
        let ack = self.gateway.submit_order(&order).await?;
        info!(
            order_id = ack.order_id,
            direction = %position.direction,
            qty = %position.quantity,
            "timeout close submitted"
        );
        Ok(())
    }
}

impl std::fmt::Debug for ExecutionEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ExecutionEngine")
            .field("gateway", &"<dyn ExchangeGateway>")
            .finish()
    }
}
