//! Trading strategies
//!
//! The simulator calls a [`Strategy`] once per processed bar and turns the
//! returned [`Signal`] into orders.

pub mod sma_crossover;

pub use sma_crossover::{SmaCrossover, SmaCrossoverConfig};

use serde::{Deserialize, Serialize};

use crate::Bar;

// =============================================================================
// Strategy Trait
// =============================================================================

/// Trading strategy trait.
///
/// `history` is the time-ordered sequence of valid bars up to and including
/// `bar`. Strategies may keep incremental indicator state between calls.
pub trait Strategy: Send {
    /// Strategy identifier
    fn name(&self) -> &'static str;

    fn analyze(&mut self, history: &[Bar], bar: &Bar) -> Option<Signal>;
}

/// What a signal asks the simulator to do
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SignalAction {
    Buy,
    Sell,
    /// Close every open position of the symbol
    Close,
}

/// Trading signal
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Signal {
    pub action: SignalAction,
    pub lot_size: f64,
    pub stop_loss: Option<f64>,
    pub take_profit: Option<f64>,
    pub reason: String,
}

impl Signal {
    pub fn buy(lot_size: f64) -> Self {
        Self::entry(SignalAction::Buy, lot_size)
    }

    pub fn sell(lot_size: f64) -> Self {
        Self::entry(SignalAction::Sell, lot_size)
    }

    pub fn close(reason: impl Into<String>) -> Self {
        Self {
            action: SignalAction::Close,
            lot_size: 0.0,
            stop_loss: None,
            take_profit: None,
            reason: reason.into(),
        }
    }

    fn entry(action: SignalAction, lot_size: f64) -> Self {
        Self {
            action,
            lot_size,
            stop_loss: None,
            take_profit: None,
            reason: String::new(),
        }
    }

    pub fn with_stop_loss(mut self, stop_loss: f64) -> Self {
        self.stop_loss = Some(stop_loss);
        self
    }

    pub fn with_take_profit(mut self, take_profit: f64) -> Self {
        self.take_profit = Some(take_profit);
        self
    }

    pub fn with_reason(mut self, reason: impl Into<String>) -> Self {
        self.reason = reason.into();
        self
    }
}
