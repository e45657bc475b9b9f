//! Backtesting engine
//!
//! Replays a bar series through the [`SimulationEngine`] and a [`Strategy`].
//! Per bar the engine matches pending orders, scans open positions and
//! snapshots equity; the strategy then sees the history up to and including
//! the bar and its signal is turned into orders. Remaining positions are
//! force-closed on the last bar before metrics are produced.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{info, warn};

use crate::analytics::{EquityPoint, Metrics};
use crate::broker::AccountState;
use crate::config::Config;
use crate::engine::{SimulationEngine, SubmitOutcome};
use crate::error::RejectionReason;
use crate::events::SharedSink;
use crate::oms::OrderRequest;
use crate::rng::{RandomSource, SeededRandom};
use crate::strategies::{Signal, SignalAction, Strategy};
use crate::{Bar, ExitReason, Symbol, Trade};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunState {
    Initialized,
    Running,
    Finished,
}

#[derive(Debug, Error, PartialEq)]
pub enum BacktestError {
    #[error("Backtest has already been run")]
    AlreadyRun,

    #[error("No valid bars to backtest")]
    NoData,
}

/// A strategy signal the broker refused
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RejectedSignal {
    pub time: DateTime<Utc>,
    pub action: SignalAction,
    pub reason: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BacktestResult {
    pub symbol: Symbol,
    pub strategy: String,
    pub bars_processed: u64,
    pub bars_skipped: usize,
    pub trades: Vec<Trade>,
    pub equity_curve: Vec<EquityPoint>,
    pub metrics: Metrics,
    pub rejections: Vec<RejectedSignal>,
    pub final_account: AccountState,
}

/// Backtest engine
pub struct Backtester {
    engine: SimulationEngine,
    strategy: Box<dyn Strategy>,
    state: RunState,
    rejections: Vec<RejectedSignal>,
}

impl Backtester {
    /// Backtester whose broker draws from a generator seeded with `config.backtest.seed`
    pub fn new(config: Config, strategy: Box<dyn Strategy>) -> Self {
        let rng = Box::new(SeededRandom::new(config.backtest.seed));
        Self::with_random_source(config, strategy, rng)
    }

    pub fn with_random_source(
        config: Config,
        strategy: Box<dyn Strategy>,
        rng: Box<dyn RandomSource>,
    ) -> Self {
        Backtester {
            engine: SimulationEngine::new(&config, rng),
            strategy,
            state: RunState::Initialized,
            rejections: Vec::new(),
        }
    }

    pub fn with_event_sink(mut self, sink: SharedSink) -> Self {
        self.engine = self.engine.with_event_sink(sink);
        self
    }

    pub fn state(&self) -> RunState {
        self.state
    }

    pub fn engine(&self) -> &SimulationEngine {
        &self.engine
    }

    /// Submit an order outside the signal path (market → broker, others → matching engine)
    pub fn submit_order(&mut self, request: OrderRequest) -> Result<SubmitOutcome, RejectionReason> {
        self.engine.submit_order(request)
    }

    /// Run the backtest over `bars`. Malformed bars are skipped.
    pub fn run(&mut self, symbol: &Symbol, bars: &[Bar]) -> Result<BacktestResult, BacktestError> {
        if self.state != RunState::Initialized {
            return Err(BacktestError::AlreadyRun);
        }
        self.state = RunState::Running;

        info!(
            symbol = %symbol,
            strategy = self.strategy.name(),
            bars = bars.len(),
            "Starting backtest"
        );

        let mut history: Vec<Bar> = Vec::with_capacity(bars.len());
        let mut skipped = 0usize;

        for bar in bars {
            if let Err(e) = self.engine.on_bar(symbol, bar) {
                warn!(symbol = %symbol, time = %bar.time, "Skipping bar: {}", e);
                skipped += 1;
                continue;
            }
            history.push(bar.clone());

            if let Some(signal) = self.strategy.analyze(&history, bar) {
                self.apply_signal(symbol, bar, signal);
            }
        }

        if history.is_empty() {
            self.state = RunState::Finished;
            return Err(BacktestError::NoData);
        }

        let closed = self.engine.close_all(Some(symbol), ExitReason::BacktestEnd);
        if !closed.is_empty() {
            info!(count = closed.len(), "Closed remaining positions at end of backtest");
        }

        self.state = RunState::Finished;

        let analyzer = self.engine.analyzer();
        let metrics = analyzer.calculate_metrics();

        info!(
            trades = metrics.total_trades,
            net_profit = format!("{:.2}", metrics.net_profit),
            max_drawdown_pct = format!("{:.2}", metrics.max_drawdown_pct),
            rejections = self.rejections.len(),
            "Backtest finished"
        );

        Ok(BacktestResult {
            symbol: symbol.clone(),
            strategy: self.strategy.name().to_string(),
            bars_processed: self.engine.bars_processed(),
            bars_skipped: skipped,
            trades: analyzer.trades().to_vec(),
            equity_curve: analyzer.equity_curve().to_vec(),
            metrics,
            rejections: std::mem::take(&mut self.rejections),
            final_account: self.engine.account().clone(),
        })
    }

    fn apply_signal(&mut self, symbol: &Symbol, bar: &Bar, signal: Signal) {
        if let Err(reason) = self.engine.apply_signal(symbol, &signal) {
            self.rejections.push(RejectedSignal {
                time: bar.time,
                action: signal.action,
                reason: reason.to_string(),
            });
        }
    }
}
