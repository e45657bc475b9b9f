//! Core OMS types
//!
//! Orders, fills and the id sequence shared by the matching engine and the
//! broker.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use crate::oms::OrderRequest;
use crate::{Side, Symbol};

/// Order ID type - u64 for performance
pub type OrderId = u64;

pub type FillId = u64;

/// Quantities below this are treated as zero
pub const QUANTITY_EPSILON: f64 = 1e-8;

/// Lock-free id sequence.
///
/// Clones share the same counter, so the matching engine and the broker of one
/// simulation hand out ids from a single space. Separate simulations get
/// separate sequences and stay reproducible.
#[derive(Debug, Clone)]
pub struct IdGenerator(Arc<AtomicU64>);

impl IdGenerator {
    pub fn new() -> Self {
        Self(Arc::new(AtomicU64::new(1)))
    }

    pub fn next_id(&self) -> u64 {
        self.0.fetch_add(1, Ordering::Relaxed)
    }
}

impl Default for IdGenerator {
    fn default() -> Self {
        Self::new()
    }
}

/// Order type - determines execution logic
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum OrderType {
    /// Execute at the opposing touch of the current bar
    Market,

    /// Buy limit: executes when low ≤ limit_price
    /// Sell limit: executes when high ≥ limit_price
    Limit,

    /// Buy stop: triggers when high ≥ stop_price
    /// Sell stop: triggers when low ≤ stop_price
    /// Once triggered it executes as a market order
    Stop,

    /// Triggers like a stop, then rests as a limit order
    StopLimit,
}

/// Time-in-force specification
#[allow(clippy::upper_case_acronyms)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum TimeInForce {
    /// Good till cancelled
    #[default]
    GTC,

    /// Immediate or cancel (fill what is available, cancel the rest)
    IOC,

    /// Fill or kill (fill completely in one pass or cancel)
    FOK,

    /// Expires at the end of the creation day unless an expiry is given
    DAY,
}

/// Order state machine
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum OrderStatus {
    Pending,
    PartiallyFilled,
    Filled,
    Cancelled,
    Rejected,
}

impl OrderStatus {
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            OrderStatus::Filled | OrderStatus::Cancelled | OrderStatus::Rejected
        )
    }
}

/// Top of book at the moment of a fill
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct MarketSnapshot {
    pub bid: f64,
    pub ask: f64,
    pub volume: f64,
}

/// Individual fill record
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Fill {
    pub id: FillId,

    /// Order ID that generated this fill
    pub order_id: OrderId,

    pub timestamp: DateTime<Utc>,

    pub price: f64,

    /// Filled quantity in lots
    pub volume: f64,

    pub commission: f64,

    pub market: MarketSnapshot,
}

/// Order with its fill state
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Order {
    /// Unique order ID, assigned on submission
    pub id: OrderId,

    pub symbol: Symbol,

    pub side: Side,

    pub order_type: OrderType,

    /// Total order quantity in lots
    pub quantity: f64,

    /// Limit price (for limit/stop-limit orders)
    pub limit_price: Option<f64>,

    /// Stop price (for stop/stop-limit orders)
    pub stop_price: Option<f64>,

    pub time_in_force: TimeInForce,

    pub created_at: DateTime<Utc>,

    pub expires_at: Option<DateTime<Utc>>,

    /// Bracket applied to the position each fill opens
    pub stop_loss: Option<f64>,
    pub take_profit: Option<f64>,

    pub comment: String,

    pub status: OrderStatus,

    pub filled_quantity: f64,

    pub remaining_quantity: f64,

    /// Volume-weighted average fill price
    pub average_fill_price: f64,

    pub fills: Vec<Fill>,

    /// Stop condition has been met (stop / stop-limit orders)
    pub triggered: bool,

    /// Rejection or cancellation reason
    pub reason: Option<String>,
}

impl Order {
    /// Build an unsubmitted order (id 0) from a request
    pub fn from_request(request: &OrderRequest, created_at: DateTime<Utc>) -> Self {
        Self {
            id: 0,
            symbol: request.symbol.clone(),
            side: request.side,
            order_type: request.order_type,
            quantity: request.quantity,
            limit_price: request.limit_price,
            stop_price: request.stop_price,
            time_in_force: request.time_in_force,
            created_at,
            expires_at: request.expires_at,
            stop_loss: request.stop_loss,
            take_profit: request.take_profit,
            comment: request.comment.clone(),
            status: OrderStatus::Pending,
            filled_quantity: 0.0,
            remaining_quantity: request.quantity,
            average_fill_price: 0.0,
            fills: Vec::new(),
            triggered: false,
            reason: None,
        }
    }

    /// Check if order can still be filled
    pub fn is_active(&self) -> bool {
        matches!(
            self.status,
            OrderStatus::Pending | OrderStatus::PartiallyFilled
        )
    }

    pub fn is_terminal(&self) -> bool {
        self.status.is_terminal()
    }

    /// Apply a fill: quantities, VWAP and status
    pub fn apply_fill(&mut self, fill: Fill) {
        let prev_total_value = self.average_fill_price * self.filled_quantity;
        let new_total_qty = self.filled_quantity + fill.volume;

        self.average_fill_price = if new_total_qty > 0.0 {
            (prev_total_value + fill.price * fill.volume) / new_total_qty
        } else {
            fill.price
        };

        self.filled_quantity = new_total_qty;
        self.remaining_quantity = (self.quantity - self.filled_quantity).max(0.0);

        self.status = if self.remaining_quantity <= QUANTITY_EPSILON {
            self.remaining_quantity = 0.0;
            OrderStatus::Filled
        } else {
            OrderStatus::PartiallyFilled
        };

        self.fills.push(fill);
    }

    /// Move to a terminal non-filled state. Terminal orders are left untouched.
    pub(crate) fn close_out(&mut self, status: OrderStatus, reason: impl Into<String>) -> bool {
        if self.is_terminal() {
            return false;
        }
        self.status = status;
        self.reason = Some(reason.into());
        true
    }

    /// Total commission from all fills
    pub fn total_commission(&self) -> f64 {
        self.fills.iter().map(|f| f.commission).sum()
    }
}
