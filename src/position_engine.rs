// =============================================================================
// Position Ledger: positions opened by this engine, with the timeout sweep
// =============================================================================
//
// Life-cycle:
//   Open  ->  Closed (timeout sweep submits a reduce-only market close)
//   Open  ->  dropped (exchange reports the instrument flat: a protective leg
//             or a manual action closed it)
//
// The ledger is plain state owned by the tick processor; it is never shared
// across tasks, so no locking.
// =============================================================================

use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use tracing::{debug, info};
use uuid::Uuid;

use crate::types::Direction;

/// A position this engine opened and is still tracking.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OpenPosition {
    /// Shared with the client order ids of its bracket.
    pub id: Uuid,
    /// UNIX seconds at entry.
    pub entry_timestamp: i64,
    pub entry_price: f64,
    pub direction: Direction,
    pub quantity: Decimal,
}

impl OpenPosition {
    /// `true` once `now - entry >= timeout_secs`.
    pub fn is_expired(&self, now: i64, timeout_secs: i64) -> bool {
        now - self.entry_timestamp >= timeout_secs
    }
}

#[derive(Debug, Default)]
pub struct PositionLedger {
    open: Vec<OpenPosition>,
}

impl PositionLedger {
    pub fn new() -> Self {
        Self::default()
    }

    /// Track a freshly entered position.
    pub fn open(&mut self, position: OpenPosition) {
        info!(
            id = %position.id,
            direction = %position.direction,
            entry_price = position.entry_price,
            qty = %position.quantity,
            "position tracked"
        );
        self.open.push(position);
    }

    /// Remove and return every position whose age has reached
    /// `timeout_secs`. A zero timeout disables the sweep.
    pub fn take_expired(&mut self, now: i64, timeout_secs: i64) -> Vec<OpenPosition> {
        if timeout_secs <= 0 {
            return Vec::new();
        }

        let (expired, kept): (Vec<_>, Vec<_>) = std::mem::take(&mut self.open)
            .into_iter()
            .partition(|p| p.is_expired(now, timeout_secs));
        self.open = kept;

        if !expired.is_empty() {
            debug!(count = expired.len(), remaining = self.open.len(), "positions expired");
        }
        expired
    }

    /// Put back a position whose close could not be submitted, so the next
    /// sweep retries it.
    pub fn restore(&mut self, position: OpenPosition) {
        self.open.push(position);
        self.open.sort_by_key(|p| p.entry_timestamp);
    }

    /// Forget everything; used when the exchange reports no open position.
    pub fn clear(&mut self) -> usize {
        let dropped = self.open.len();
        if dropped > 0 {
            info!(dropped, "exchange reports flat; dropping tracked positions");
        }
        self.open.clear();
        dropped
    }

    pub fn positions(&self) -> &[OpenPosition] {
        &self.open
    }

    pub fn len(&self) -> usize {
        self.open.len()
    }

    pub fn is_empty(&self) -> bool {
        self.open.is_empty()
    }
}
