//! Open and closed broker positions

use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};

use crate::config::InstrumentSpec;
use crate::oms::OrderId;
use crate::{Bar, ExitReason, Money, PositionId, Side, Symbol};

/// One position per accepted fill. Owned by the broker and moved into the
/// closed collection when it is closed.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Position {
    pub id: PositionId,
    pub order_id: OrderId,
    pub symbol: Symbol,
    /// Buy = long, Sell = short
    pub side: Side,
    pub lot_size: f64,

    /// Executed (slipped) price
    pub entry_price: f64,
    /// Price the order asked for
    pub requested_price: f64,
    pub current_price: f64,

    pub stop_loss: Option<f64>,
    pub take_profit: Option<f64>,

    pub commission: Money,
    pub swap: Money,
    pub spread_cost: Money,
    pub slippage_cost: Money,

    pub margin_required: f64,

    pub open_time: DateTime<Utc>,
    pub days_held: i64,
    pub last_swap_date: NaiveDate,

    pub unrealized_pnl: Money,
    /// Net P&L, set on close
    pub realized_pnl: Option<Money>,

    pub exit_price: Option<f64>,
    pub exit_time: Option<DateTime<Utc>>,
    pub exit_reason: Option<ExitReason>,
}

impl Position {
    /// Direction-adjusted price move from entry to `price`
    pub fn price_move(&self, price: f64) -> f64 {
        (price - self.entry_price) * self.side.sign()
    }

    /// Gross P&L at `price`, costs excluded
    pub fn gross_pnl_at(&self, price: f64, instrument: &InstrumentSpec) -> f64 {
        instrument.value_of(self.price_move(price), self.lot_size)
    }

    /// Mark the position to `price`
    pub fn update_unrealized_pnl(&mut self, price: f64, instrument: &InstrumentSpec) {
        self.current_price = price;
        self.unrealized_pnl = Money::from_f64(self.gross_pnl_at(price, instrument));
    }

    /// Bar range reaches the stop-loss level
    pub fn stop_loss_hit(&self, bar: &Bar) -> bool {
        match (self.stop_loss, self.side) {
            (Some(sl), Side::Buy) => bar.low <= sl,
            (Some(sl), Side::Sell) => bar.high >= sl,
            (None, _) => false,
        }
    }

    /// Bar range reaches the take-profit level
    pub fn take_profit_hit(&self, bar: &Bar) -> bool {
        match (self.take_profit, self.side) {
            (Some(tp), Side::Buy) => bar.high >= tp,
            (Some(tp), Side::Sell) => bar.low <= tp,
            (None, _) => false,
        }
    }

    /// Costs charged so far (commission + swap + spread)
    pub fn total_costs(&self) -> Money {
        self.commission + self.swap + self.spread_cost
    }

    /// Notional value at `price`
    pub fn notional(&self, price: f64, instrument: &InstrumentSpec) -> f64 {
        self.lot_size * instrument.contract_size * price
    }
}
