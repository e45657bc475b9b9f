//! Typed rejection and error enums.
//!
//! Order rejections are split the way callers need to handle them:
//! structural problems with the order itself ([`OrderRejection`]), and
//! broker-side capacity, risk, liquidity and simulated-unreliability
//! rejections ([`RejectionReason`]). Both are terminal for the order.

use thiserror::Error;

use crate::oms::OrderType;
use crate::{PositionId, Symbol};

/// Structurally invalid order, rejected before it enters any book
#[derive(Debug, Clone, Error, PartialEq)]
pub enum OrderRejection {
    #[error("Invalid quantity: {0}")]
    InvalidQuantity(f64),

    #[error("{0:?} order requires a positive limit price")]
    MissingLimitPrice(OrderType),

    #[error("{0:?} order requires a positive stop price")]
    MissingStopPrice(OrderType),

    #[error("Order expiry precedes its creation time")]
    ExpiryBeforeCreation,
}

/// Why the broker refused (or failed) to execute an order
#[derive(Debug, Clone, Error, PartialEq)]
pub enum RejectionReason {
    #[error(transparent)]
    InvalidOrder(#[from] OrderRejection),

    #[error("Invalid lot size: {lots} (allowed {min}..={max})")]
    InvalidLotSize { lots: f64, min: f64, max: f64 },

    #[error("Maximum open positions reached ({max})")]
    MaxPositionsReached { max: usize },

    #[error("Insufficient margin: required {required:.2}, free {free:.2}")]
    InsufficientMargin { required: f64, free: f64 },

    #[error("Exposure limit exceeded: {exposure:.2} > {cap:.2}")]
    ExposureLimitExceeded { exposure: f64, cap: f64 },

    #[error("Market closed")]
    MarketClosed,

    #[error("Insufficient liquidity: bar volume {volume} below {min}")]
    InsufficientLiquidity { volume: f64, min: f64 },

    #[error("Broker rejection")]
    BrokerRejection,

    #[error("Max slippage exceeded: {slippage_pips:.2} pips > {max_pips:.2}")]
    MaxSlippageExceeded { slippage_pips: f64, max_pips: f64 },

    #[error("Broker executes market orders only, got {0:?}")]
    UnsupportedOrderType(OrderType),

    #[error("No market data for {0}")]
    NoMarketData(Symbol),
}

impl RejectionReason {
    /// Rejections that model broker unreliability rather than caller error
    pub fn is_stochastic(&self) -> bool {
        matches!(
            self,
            RejectionReason::BrokerRejection | RejectionReason::MaxSlippageExceeded { .. }
        )
    }
}

/// Errors from position-level broker operations
#[derive(Debug, Clone, Error, PartialEq)]
pub enum BrokerError {
    #[error("Position {0} not found (already closed?)")]
    PositionNotFound(PositionId),

    #[error("Invalid close price: {0}")]
    InvalidPrice(f64),

    #[error("No market data for {0}")]
    NoMarketData(Symbol),
}
