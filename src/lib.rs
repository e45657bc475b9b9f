//! Trading Simulator
//!
//! A bar-driven trading simulator: an order matching engine for resting
//! orders, a broker model with spread, slippage, commission, swap, margin and
//! rejections, performance analytics, a deterministic backtest loop and an
//! async paper-trading worker that share one engine.

pub mod analytics;
pub mod backtest;
pub mod broker;
pub mod config;
pub mod data;
pub mod engine;
pub mod error;
pub mod events;
pub mod oms;
pub mod paper;
pub mod rng;
pub mod strategies;
pub mod types;

pub use config::Config;
pub use engine::{SignalOutcome, SimulationEngine, SubmitOutcome};
pub use error::{BrokerError, OrderRejection, RejectionReason};
pub use strategies::{Signal, SignalAction, Strategy};
pub use types::*;
