//! Paper trading worker
//!
//! One tokio task owns the [`SimulationEngine`]. Callers talk to it through a
//! [`PaperHandle`], which sends commands over a bounded queue and awaits a
//! oneshot reply. A fixed-interval tick polls the [`DataFeed`] for every
//! tracked symbol and runs the bar through the same path as a backtest.
//! Commands and ticks are handled one at a time, so a manual close can never
//! interleave with the stop-loss / take-profit scan.

use std::collections::{HashMap, VecDeque};
use std::time::Duration;

use anyhow::Result;
use serde::Serialize;
use thiserror::Error;
use tokio::sync::{mpsc, oneshot};
use tokio::time::{interval, MissedTickBehavior};
use tracing::{info, warn};

use crate::analytics::Metrics;
use crate::broker::AccountState;
use crate::config::PaperConfig;
use crate::engine::{SimulationEngine, SubmitOutcome};
use crate::error::{BrokerError, RejectionReason};
use crate::oms::{OrderId, OrderRequest};
use crate::strategies::Strategy;
use crate::{Bar, ExitReason, PositionId, Symbol, Trade};

/// Bars kept per symbol for the strategy
const HISTORY_LIMIT: usize = 5_000;

// =============================================================================
// Data Feed
// =============================================================================

/// Source of new bars, polled once per tick and symbol
pub trait DataFeed: Send + 'static {
    /// Next bar for `symbol`, or `None` if nothing new is available
    fn poll_bar(&mut self, symbol: &Symbol) -> Result<Option<Bar>>;
}

/// Feed that replays preloaded bars, one per poll
#[derive(Debug, Default)]
pub struct ReplayFeed {
    queues: HashMap<Symbol, VecDeque<Bar>>,
}

impl ReplayFeed {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_bars(mut self, symbol: Symbol, bars: Vec<Bar>) -> Self {
        self.queues.entry(symbol).or_default().extend(bars);
        self
    }

    pub fn remaining(&self, symbol: &Symbol) -> usize {
        self.queues.get(symbol).map_or(0, VecDeque::len)
    }
}

impl DataFeed for ReplayFeed {
    fn poll_bar(&mut self, symbol: &Symbol) -> Result<Option<Bar>> {
        Ok(self.queues.get_mut(symbol).and_then(VecDeque::pop_front))
    }
}

// =============================================================================
// Commands
// =============================================================================

#[derive(Debug, Error)]
pub enum PaperError {
    #[error("Paper trading worker has stopped")]
    WorkerStopped,

    #[error(transparent)]
    Rejected(#[from] RejectionReason),

    #[error(transparent)]
    Broker(#[from] BrokerError),
}

enum Command {
    Submit {
        request: OrderRequest,
        reply: oneshot::Sender<Result<SubmitOutcome, RejectionReason>>,
    },
    Cancel {
        order_id: OrderId,
        reply: oneshot::Sender<bool>,
    },
    Close {
        position_id: PositionId,
        reply: oneshot::Sender<Result<Trade, BrokerError>>,
    },
    Account {
        reply: oneshot::Sender<AccountState>,
    },
    Status {
        reply: oneshot::Sender<PaperStatus>,
    },
    Stop {
        reply: oneshot::Sender<PaperSummary>,
    },
}

#[derive(Debug, Clone, Serialize)]
pub struct PaperStatus {
    pub ticks: u64,
    pub bars_processed: u64,
    pub feed_errors: u64,
    pub open_positions: usize,
    pub pending_orders: usize,
}

/// Returned by [`PaperHandle::stop`] once every position has been closed
#[derive(Debug, Clone, Serialize)]
pub struct PaperSummary {
    pub status: PaperStatus,
    pub trades: Vec<Trade>,
    pub metrics: Metrics,
    pub final_account: AccountState,
}

// =============================================================================
// Worker
// =============================================================================

pub struct PaperTrader<F: DataFeed> {
    engine: SimulationEngine,
    feed: F,
    symbols: Vec<Symbol>,
    poll_interval: Duration,
    command_buffer: usize,
    strategies: HashMap<Symbol, Box<dyn Strategy>>,
    history: HashMap<Symbol, Vec<Bar>>,
    ticks: u64,
    feed_errors: u64,
}

impl<F: DataFeed> PaperTrader<F> {
    pub fn new(engine: SimulationEngine, feed: F, config: &PaperConfig) -> Self {
        Self {
            engine,
            feed,
            symbols: config.symbols(),
            poll_interval: Duration::from_millis(config.poll_interval_ms.max(1)),
            command_buffer: config.command_buffer.max(1),
            strategies: HashMap::new(),
            history: HashMap::new(),
            ticks: 0,
            feed_errors: 0,
        }
    }

    /// Run `strategy` on every new bar of `symbol`. Each symbol owns its
    /// strategy instance, so indicator state never mixes between symbols.
    pub fn with_strategy(mut self, symbol: Symbol, strategy: Box<dyn Strategy>) -> Self {
        self.strategies.insert(symbol, strategy);
        self
    }

    /// Start the worker on the current tokio runtime
    pub fn spawn(self) -> PaperHandle {
        let (commands, receiver) = mpsc::channel(self.command_buffer);
        tokio::spawn(self.run(receiver));
        PaperHandle { commands }
    }

    async fn run(mut self, mut commands: mpsc::Receiver<Command>) {
        let mut ticker = interval(self.poll_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        info!(
            symbols = ?self.symbols,
            interval_ms = self.poll_interval.as_millis() as u64,
            strategies = ?self
                .strategies
                .iter()
                .map(|(symbol, s)| format!("{}={}", symbol, s.name()))
                .collect::<Vec<_>>(),
            "Paper trading worker started"
        );

        let stop_reply = loop {
            tokio::select! {
                biased;

                command = commands.recv() => match command {
                    Some(command) => {
                        if let Some(reply) = self.handle(command) {
                            break Some(reply);
                        }
                    }
                    None => {
                        info!("All paper trading handles dropped");
                        break None;
                    }
                },
                _ = ticker.tick() => self.tick(),
            }
        };

        let summary = self.shutdown();
        if let Some(reply) = stop_reply {
            let _ = reply.send(summary);
        }
    }

    /// Returns the reply channel of a stop request
    fn handle(&mut self, command: Command) -> Option<oneshot::Sender<PaperSummary>> {
        // A dropped reply receiver means the caller gave up; the action still stands.
        match command {
            Command::Submit { request, reply } => {
                let _ = reply.send(self.engine.submit_order(request));
            }
            Command::Cancel { order_id, reply } => {
                let _ = reply.send(self.engine.cancel_order(order_id, "cancelled by user"));
            }
            Command::Close { position_id, reply } => {
                let _ = reply.send(self.engine.close_position(position_id, ExitReason::Manual));
            }
            Command::Account { reply } => {
                let _ = reply.send(self.engine.account().clone());
            }
            Command::Status { reply } => {
                let _ = reply.send(self.status());
            }
            Command::Stop { reply } => return Some(reply),
        }
        None
    }

    fn tick(&mut self) {
        self.ticks += 1;

        for symbol in self.symbols.clone() {
            match self.feed.poll_bar(&symbol) {
                Ok(Some(bar)) => self.process_bar(&symbol, bar),
                Ok(None) => {}
                Err(e) => {
                    self.feed_errors += 1;
                    warn!(symbol = %symbol, "Data feed error: {:#}", e);
                }
            }
        }
    }

    fn process_bar(&mut self, symbol: &Symbol, bar: Bar) {
        if let Err(e) = self.engine.on_bar(symbol, &bar) {
            warn!(symbol = %symbol, time = %bar.time, "Skipping bar: {}", e);
            return;
        }

        let Some(strategy) = self.strategies.get_mut(symbol) else {
            return;
        };

        let history = self.history.entry(symbol.clone()).or_default();
        history.push(bar.clone());
        if history.len() > HISTORY_LIMIT {
            history.drain(..history.len() - HISTORY_LIMIT);
        }

        if let Some(signal) = strategy.analyze(history, &bar) {
            if let Err(reason) = self.engine.apply_signal(symbol, &signal) {
                warn!(symbol = %symbol, action = ?signal.action, "Signal rejected: {}", reason);
            }
        }
    }

    fn status(&self) -> PaperStatus {
        PaperStatus {
            ticks: self.ticks,
            bars_processed: self.engine.bars_processed(),
            feed_errors: self.feed_errors,
            open_positions: self.engine.account().open_positions,
            pending_orders: self.engine.matching().pending_count(),
        }
    }

    fn shutdown(&mut self) -> PaperSummary {
        let closed = self.engine.close_all(None, ExitReason::Shutdown);
        if !closed.is_empty() {
            info!(count = closed.len(), "Closed open positions on shutdown");
        }

        let summary = PaperSummary {
            status: self.status(),
            trades: self.engine.analyzer().trades().to_vec(),
            metrics: self.engine.metrics(),
            final_account: self.engine.account().clone(),
        };

        info!(
            ticks = summary.status.ticks,
            bars = summary.status.bars_processed,
            trades = summary.trades.len(),
            balance = %summary.final_account.balance,
            "Paper trading worker stopped"
        );
        summary
    }
}

// =============================================================================
// Handle
// =============================================================================

/// Cloneable handle to a running paper trading worker
#[derive(Clone)]
pub struct PaperHandle {
    commands: mpsc::Sender<Command>,
}

impl PaperHandle {
    async fn request<T>(
        &self,
        command: impl FnOnce(oneshot::Sender<T>) -> Command,
    ) -> Result<T, PaperError> {
        let (reply, response) = oneshot::channel();
        self.commands
            .send(command(reply))
            .await
            .map_err(|_| PaperError::WorkerStopped)?;
        response.await.map_err(|_| PaperError::WorkerStopped)
    }

    pub async fn submit_order(&self, request: OrderRequest) -> Result<SubmitOutcome, PaperError> {
        Ok(self
            .request(|reply| Command::Submit { request, reply })
            .await??)
    }

    pub async fn cancel_order(&self, order_id: OrderId) -> Result<bool, PaperError> {
        self.request(|reply| Command::Cancel { order_id, reply }).await
    }

    pub async fn close_position(&self, position_id: PositionId) -> Result<Trade, PaperError> {
        Ok(self
            .request(|reply| Command::Close { position_id, reply })
            .await??)
    }

    pub async fn account(&self) -> Result<AccountState, PaperError> {
        self.request(|reply| Command::Account { reply }).await
    }

    pub async fn status(&self) -> Result<PaperStatus, PaperError> {
        self.request(|reply| Command::Status { reply }).await
    }

    /// Stop the worker after its current iteration, closing every open position
    pub async fn stop(&self) -> Result<PaperSummary, PaperError> {
        self.request(|reply| Command::Stop { reply }).await
    }

    pub fn is_running(&self) -> bool {
        !self.commands.is_closed()
    }
}
