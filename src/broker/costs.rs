//! Transaction cost and margin model

use crate::config::BrokerConfig;
use crate::{Bar, Side, Symbol};

/// Which protective level closed a position
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExitKind {
    StopLoss,
    TakeProfit,
}

/// Spread, slippage, swap, commission and margin formulas of one broker
#[derive(Debug, Clone)]
pub struct CostModel {
    config: BrokerConfig,
}

impl CostModel {
    pub fn new(config: BrokerConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &BrokerConfig {
        &self.config
    }

    pub fn is_low_liquidity(&self, volume: f64) -> bool {
        volume < self.config.low_liquidity_volume
    }

    /// Spread in pips for a bar: base, inflated in thin markets, capped
    pub fn spread_pips(&self, volume: f64) -> f64 {
        let mut spread = self.config.base_spread_pips;
        if self.is_low_liquidity(volume) {
            spread *= self.config.low_liquidity_spread_multiplier;
        }
        spread.min(self.config.max_spread_pips)
    }

    /// Entry slippage range in pips; the upper bound doubles in thin markets
    pub fn entry_slippage_range(&self, volume: f64) -> (f64, f64) {
        let min = self.config.min_slippage_pips;
        let mut max = self.config.max_slippage_pips;
        if self.is_low_liquidity(volume) {
            max *= 2.0;
        }
        (min, max.max(min))
    }

    /// Exit slippage range: wider for stops, narrower for targets
    pub fn exit_slippage_range(&self, volume: f64, kind: ExitKind) -> (f64, f64) {
        let (min, max) = self.entry_slippage_range(volume);
        let multiplier = match kind {
            ExitKind::StopLoss => self.config.stop_slippage_multiplier,
            ExitKind::TakeProfit => self.config.target_slippage_multiplier,
        };
        (min * multiplier, max * multiplier)
    }

    pub fn rejection_probability(&self, volume: f64) -> f64 {
        if self.is_low_liquidity(volume) {
            self.config
                .rejection_probability
                .max(self.config.low_liquidity_rejection_probability)
        } else {
            self.config.rejection_probability
        }
    }

    pub fn commission(&self, lots: f64) -> f64 {
        lots * self.config.commission_per_lot
    }

    /// Account-currency cost of crossing `spread_pips` on `lots`
    pub fn spread_cost(&self, symbol: &Symbol, spread_pips: f64, lots: f64) -> f64 {
        let instrument = self.config.instrument_for(symbol);
        instrument
            .value_of(instrument.pips_to_price(spread_pips), lots)
            .abs()
    }

    /// Account-currency value of `slippage_pips` on `lots`
    pub fn slippage_cost(&self, symbol: &Symbol, slippage_pips: f64, lots: f64) -> f64 {
        self.spread_cost(symbol, slippage_pips, lots)
    }

    pub fn notional(&self, symbol: &Symbol, lots: f64, price: f64) -> f64 {
        lots * self.config.instrument_for(symbol).contract_size * price
    }

    pub fn margin_required(&self, symbol: &Symbol, lots: f64, price: f64) -> f64 {
        self.notional(symbol, lots, price) / self.config.leverage
    }

    /// Swap for holding `lots` over `days` calendar days
    pub fn swap(&self, side: Side, lots: f64, days: i64) -> f64 {
        self.config.swap_rate(side) * lots * days as f64
    }

    /// Weekend bars are outside market hours unless weekend trading is on
    pub fn is_market_open(&self, bar: &Bar) -> bool {
        use chrono::{Datelike, Weekday};
        self.config.weekend_trading || !matches!(bar.time.weekday(), Weekday::Sat | Weekday::Sun)
    }
}
