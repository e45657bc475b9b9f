//! Account state snapshot

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::Money;

/// Margin alert level derived from the margin level
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum MarginAlert {
    #[default]
    None,
    MarginCall,
    StopOut,
}

/// Account balances, recomputed every bar and after every open/close
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AccountState {
    pub timestamp: DateTime<Utc>,
    pub balance: Money,
    /// balance + unrealized P&L
    pub equity: Money,
    pub unrealized_pnl: Money,
    pub margin_used: f64,
    pub free_margin: f64,
    /// equity / margin used × 100, 0 when no margin is used
    pub margin_level: f64,
    pub open_positions: usize,
    pub alert: MarginAlert,
}

impl AccountState {
    pub fn initial(balance: Money, timestamp: DateTime<Utc>) -> Self {
        Self {
            timestamp,
            balance,
            equity: balance,
            unrealized_pnl: Money::ZERO,
            margin_used: 0.0,
            free_margin: balance.to_f64(),
            margin_level: 0.0,
            open_positions: 0,
            alert: MarginAlert::None,
        }
    }

    /// Classify a margin level against the configured thresholds
    pub fn classify(
        margin_used: f64,
        margin_level: f64,
        margin_call_level: f64,
        stop_out_level: f64,
    ) -> MarginAlert {
        if margin_used <= 0.0 {
            MarginAlert::None
        } else if margin_level < stop_out_level {
            MarginAlert::StopOut
        } else if margin_level < margin_call_level {
            MarginAlert::MarginCall
        } else {
            MarginAlert::None
        }
    }
}
