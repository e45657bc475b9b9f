//! Moving-average crossover reference strategy
//!
//! Long-only: buys when the fast SMA crosses above the slow SMA (with
//! pip-distance stop-loss and take-profit) and closes when it crosses back
//! below. Indicators are updated incrementally through the `ta` crate, so
//! one instance follows the bars of a single symbol.

use anyhow::{anyhow, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use ta::indicators::SimpleMovingAverage;
use ta::Next;

use super::{Signal, Strategy};
use crate::Bar;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SmaCrossoverConfig {
    pub fast_period: usize,
    pub slow_period: usize,
    pub lot_size: f64,
    pub stop_loss_pips: Option<f64>,
    pub take_profit_pips: Option<f64>,
    pub pip_size: f64,
}

impl Default for SmaCrossoverConfig {
    fn default() -> Self {
        Self {
            fast_period: 10,
            slow_period: 30,
            lot_size: 0.1,
            stop_loss_pips: Some(50.0),
            take_profit_pips: Some(100.0),
            pip_size: 0.0001,
        }
    }
}

pub struct SmaCrossover {
    config: SmaCrossoverConfig,

    fast: SimpleMovingAverage,
    slow: SimpleMovingAverage,
    bars_seen: usize,
    last_processed_time: Option<DateTime<Utc>>,

    // Fast minus slow on the previous bar, once both averages are warm
    previous_spread: Option<f64>,
}

impl SmaCrossover {
    pub fn new(config: SmaCrossoverConfig) -> Result<Self> {
        if config.fast_period >= config.slow_period {
            return Err(anyhow!(
                "fast period ({}) must be shorter than slow period ({})",
                config.fast_period,
                config.slow_period
            ));
        }
        let fast = SimpleMovingAverage::new(config.fast_period)
            .map_err(|e| anyhow!("invalid fast period {}: {:?}", config.fast_period, e))?;
        let slow = SimpleMovingAverage::new(config.slow_period)
            .map_err(|e| anyhow!("invalid slow period {}: {:?}", config.slow_period, e))?;

        Ok(Self {
            config,
            fast,
            slow,
            bars_seen: 0,
            last_processed_time: None,
            previous_spread: None,
        })
    }

    fn entry_signal(&self, bar: &Bar) -> Signal {
        let mut signal = Signal::buy(self.config.lot_size).with_reason("SMA bullish crossover");
        if let Some(pips) = self.config.stop_loss_pips {
            signal = signal.with_stop_loss(bar.close - pips * self.config.pip_size);
        }
        if let Some(pips) = self.config.take_profit_pips {
            signal = signal.with_take_profit(bar.close + pips * self.config.pip_size);
        }
        signal
    }
}

impl Strategy for SmaCrossover {
    fn name(&self) -> &'static str {
        "sma_crossover"
    }

    fn analyze(&mut self, _history: &[Bar], bar: &Bar) -> Option<Signal> {
        // Each bar feeds the indicators once
        if self.last_processed_time.is_some_and(|t| bar.time <= t) {
            return None;
        }
        self.last_processed_time = Some(bar.time);

        let fast = self.fast.next(bar.close);
        let slow = self.slow.next(bar.close);
        self.bars_seen += 1;

        if self.bars_seen < self.config.slow_period {
            return None;
        }

        let spread = fast - slow;
        let previous = self.previous_spread.replace(spread)?;

        if previous <= 0.0 && spread > 0.0 {
            Some(self.entry_signal(bar))
        } else if previous >= 0.0 && spread < 0.0 {
            Some(Signal::close("SMA bearish crossover"))
        } else {
            None
        }
    }
}
