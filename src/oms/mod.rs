//! Order Management System
//!
//! Order types, the pending-order matching engine and its execution rules.

pub mod execution;
pub mod orderbook;
pub mod request;
pub mod types;

pub use execution::ExecutionEngine;
pub use orderbook::{validate_order, OrderMatchingEngine};
pub use request::OrderRequest;
pub use types::{
    Fill, FillId, IdGenerator, MarketSnapshot, Order, OrderId, OrderStatus, OrderType,
    TimeInForce, QUANTITY_EPSILON,
};
