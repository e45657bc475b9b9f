//! Simulation engine
//!
//! Composes the order matching engine, the broker and the performance
//! analyzer into the single state object driven by both the backtest loop and
//! the paper-trading worker. One bar flows through it as: pending orders are
//! matched, fills open positions, open positions are scanned for stop-loss /
//! take-profit, equity is snapshotted and closed trades reach the analyzer.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{debug, info, warn};

use crate::analytics::{Metrics, PerformanceAnalyzer};
use crate::broker::{AccountState, BrokerSimulator, MarketExecution, Position};
use crate::config::Config;
use crate::error::{BrokerError, RejectionReason};
use crate::events::{EngineEvent, SharedSink, TracingSink};
use crate::oms::{Fill, IdGenerator, Order, OrderId, OrderMatchingEngine, OrderRequest, OrderType};
use crate::rng::RandomSource;
use crate::strategies::{Signal, SignalAction};
use crate::{Bar, BarValidationError, ExitReason, PositionId, Side, Symbol, Trade};

/// Result of an accepted order submission
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum SubmitOutcome {
    /// Market order executed by the broker
    Executed(MarketExecution),
    /// Non-market order resting in the matching engine
    Pending(OrderId),
}

impl SubmitOutcome {
    pub fn order_id(&self) -> OrderId {
        match self {
            SubmitOutcome::Executed(execution) => execution.order_id,
            SubmitOutcome::Pending(id) => *id,
        }
    }
}

/// What a strategy signal turned into
#[derive(Debug, Clone)]
pub enum SignalOutcome {
    Submitted(SubmitOutcome),
    Closed(Vec<Trade>),
}

/// What happened while processing one bar
#[derive(Debug, Clone)]
pub struct BarReport {
    pub fills: Vec<Fill>,
    pub opened_positions: Vec<PositionId>,
    pub closed_trades: Vec<Trade>,
    pub account: AccountState,
}

pub struct SimulationEngine {
    matching: OrderMatchingEngine,
    broker: BrokerSimulator,
    analyzer: PerformanceAnalyzer,
    sink: SharedSink,
    last_bars: HashMap<Symbol, Bar>,
    clock: Option<DateTime<Utc>>,
    bars_processed: u64,
}

impl SimulationEngine {
    pub fn new(config: &Config, rng: Box<dyn RandomSource>) -> Self {
        let ids = IdGenerator::new();
        let sink: SharedSink = Arc::new(TracingSink);

        Self {
            matching: OrderMatchingEngine::new(&config.matching)
                .with_id_generator(ids.clone())
                .with_event_sink(sink.clone()),
            broker: BrokerSimulator::new(config.broker.clone(), rng)
                .with_id_generator(ids)
                .with_event_sink(sink.clone()),
            analyzer: PerformanceAnalyzer::new(
                config.broker.initial_balance,
                config.analyzer.clone(),
            ),
            sink,
            last_bars: HashMap::new(),
            clock: None,
            bars_processed: 0,
        }
    }

    /// Route every engine event to `sink`
    pub fn with_event_sink(mut self, sink: SharedSink) -> Self {
        self.matching = self.matching.with_event_sink(sink.clone());
        self.broker = self.broker.with_event_sink(sink.clone());
        self.sink = sink;
        self
    }

    // ========================================================================
    // Orders
    // ========================================================================

    /// Market orders go to the broker against the symbol's latest bar; every
    /// other kind rests in the matching engine.
    pub fn submit_order(
        &mut self,
        request: OrderRequest,
    ) -> Result<SubmitOutcome, RejectionReason> {
        if request.order_type == OrderType::Market {
            let Some(bar) = self.last_bars.get(&request.symbol).cloned() else {
                warn!(symbol = %request.symbol, "Market order rejected: no bar seen yet");
                return Err(RejectionReason::NoMarketData(request.symbol));
            };
            return self
                .broker
                .submit_order(&request, &bar)
                .map(SubmitOutcome::Executed);
        }

        if let Err(reason) = self.broker.check_lot_size(request.quantity) {
            warn!(symbol = %request.symbol, "Order rejected: {}", reason);
            return Err(reason);
        }

        let created_at = self
            .last_bars
            .get(&request.symbol)
            .map(|bar| bar.time)
            .or(self.clock)
            .unwrap_or_else(Utc::now);
        let order = Order::from_request(&request, created_at);
        let id = self.matching.submit(order)?;
        Ok(SubmitOutcome::Pending(id))
    }

    pub fn cancel_order(&mut self, order_id: OrderId, reason: &str) -> bool {
        self.matching.cancel(order_id, reason)
    }

    /// CLOSE closes every position of `symbol`; BUY / SELL become a market
    /// order carrying the signal's stop-loss and take-profit.
    pub fn apply_signal(
        &mut self,
        symbol: &Symbol,
        signal: &Signal,
    ) -> Result<SignalOutcome, RejectionReason> {
        let side = match signal.action {
            SignalAction::Close => {
                let closed = self.close_all(Some(symbol), ExitReason::Signal);
                if !closed.is_empty() {
                    info!(symbol = %symbol, count = closed.len(), reason = %signal.reason, "Closed on signal");
                }
                return Ok(SignalOutcome::Closed(closed));
            }
            SignalAction::Buy => Side::Buy,
            SignalAction::Sell => Side::Sell,
        };

        let request = OrderRequest::market(symbol.clone(), side, signal.lot_size)
            .with_brackets(signal.stop_loss, signal.take_profit)
            .with_comment(signal.reason.clone());
        self.submit_order(request).map(SignalOutcome::Submitted)
    }

    // ========================================================================
    // Bars
    // ========================================================================

    /// Run one bar through the engine. Malformed bars are rejected untouched.
    pub fn on_bar(&mut self, symbol: &Symbol, bar: &Bar) -> Result<BarReport, BarValidationError> {
        bar.validate()?;

        self.clock = Some(self.clock.map_or(bar.time, |t| t.max(bar.time)));
        self.last_bars.insert(symbol.clone(), bar.clone());

        // Each fill opens its position before the next order is matched, so
        // capacity checks see the fills earlier on this bar
        let broker = &mut self.broker;
        let mut opened_positions = Vec::new();
        let fills = self.matching.process_bar_with(symbol, bar, |order, fill| {
            opened_positions.push(broker.open_from_fill(order, fill)?);
            Ok(())
        });

        self.broker.update_positions(symbol, bar);
        self.record_equity(bar.time);
        let closed_trades = self.collect_trades();
        self.bars_processed += 1;

        debug!(
            symbol = %symbol,
            time = %bar.time,
            fills = fills.len(),
            closed = closed_trades.len(),
            "Bar processed"
        );

        Ok(BarReport {
            fills,
            opened_positions,
            closed_trades,
            account: self.broker.account().clone(),
        })
    }

    /// Snapshot the account into the equity curve
    pub fn record_equity(&mut self, time: DateTime<Utc>) {
        let account = self.broker.account();
        self.analyzer.add_equity_point(
            time,
            account.balance,
            account.equity,
            account.open_positions,
            account.margin_level,
        );
        self.sink.emit(&EngineEvent::AccountSnapshot(account.clone()));
    }

    fn collect_trades(&mut self) -> Vec<Trade> {
        let trades = self.broker.drain_new_trades();
        for trade in &trades {
            self.analyzer.add_trade(trade.clone());
        }
        trades
    }

    // ========================================================================
    // Positions
    // ========================================================================

    /// Close a position at its symbol's latest close
    pub fn close_position(
        &mut self,
        position_id: PositionId,
        reason: ExitReason,
    ) -> Result<Trade, BrokerError> {
        let symbol = self
            .broker
            .position(position_id)
            .map(|p| p.symbol.clone())
            .ok_or(BrokerError::PositionNotFound(position_id))?;
        let bar = self
            .last_bars
            .get(&symbol)
            .ok_or_else(|| BrokerError::NoMarketData(symbol.clone()))?;
        let (price, time) = (bar.close, bar.time);

        let trade = self.broker.close_position(position_id, price, time, reason)?;
        self.collect_trades();
        Ok(trade)
    }

    /// Close every open position, or only those of `symbol`
    pub fn close_all(&mut self, symbol: Option<&Symbol>, reason: ExitReason) -> Vec<Trade> {
        let time = symbol
            .and_then(|s| self.last_bars.get(s))
            .map(|bar| bar.time)
            .or(self.clock)
            .unwrap_or_else(Utc::now);
        self.broker.close_all(symbol, time, reason);
        self.collect_trades()
    }

    // ========================================================================
    // Accessors
    // ========================================================================

    pub fn account(&self) -> &AccountState {
        self.broker.account()
    }

    pub fn positions(&self) -> impl Iterator<Item = &Position> {
        self.broker.positions()
    }

    pub fn metrics(&self) -> Metrics {
        self.analyzer.calculate_metrics()
    }

    pub fn analyzer(&self) -> &PerformanceAnalyzer {
        &self.analyzer
    }

    pub fn broker(&self) -> &BrokerSimulator {
        &self.broker
    }

    pub fn matching(&self) -> &OrderMatchingEngine {
        &self.matching
    }

    pub fn last_bar(&self, symbol: &Symbol) -> Option<&Bar> {
        self.last_bars.get(symbol)
    }

    pub fn bars_processed(&self) -> u64 {
        self.bars_processed
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{BrokerConfig, MatchingConfig};
    use crate::events::CollectingSink;
    use crate::oms::OrderStatus;
    use crate::rng::FixedRandom;
    use crate::Side;
    use chrono::{Duration, TimeZone};

    fn t0() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 3, 4, 10, 0, 0).unwrap()
    }

    fn eurusd() -> Symbol {
        Symbol::new("EURUSD")
    }

    fn bar(minutes: i64, low: f64, high: f64, close: f64) -> Bar {
        Bar::new_unchecked(t0() + Duration::minutes(minutes), close, high, low, close, 1_000.0)
    }

    fn engine() -> SimulationEngine {
        let config = Config {
            broker: BrokerConfig::frictionless(),
            ..Config::default()
        };
        SimulationEngine::new(&config, Box::new(FixedRandom::lowest()))
    }

    #[test]
    fn test_market_order_needs_a_bar() {
        let mut engine = engine();
        let err = engine
            .submit_order(OrderRequest::market_buy(eurusd(), 0.1))
            .unwrap_err();
        assert_eq!(err, RejectionReason::NoMarketData(eurusd()));
    }

    #[test]
    fn test_limit_fill_opens_bracketed_position() {
        let sink = Arc::new(CollectingSink::new());
        let mut engine = engine().with_event_sink(sink.clone());
        engine.on_bar(&eurusd(), &bar(0, 1.0990, 1.1010, 1.1000)).unwrap();

        let outcome = engine
            .submit_order(
                OrderRequest::limit_buy(eurusd(), 0.5, 1.0950)
                    .with_brackets(Some(1.0900), Some(1.1050)),
            )
            .unwrap();
        assert!(matches!(outcome, SubmitOutcome::Pending(_)));

        let report = engine.on_bar(&eurusd(), &bar(1, 1.0945, 1.0990, 1.0960)).unwrap();
        assert_eq!(report.fills.len(), 1);
        assert_eq!(report.opened_positions.len(), 1);

        let position = engine.positions().next().unwrap();
        assert_eq!(position.entry_price, 1.0950);
        assert_eq!(position.stop_loss, Some(1.0900));
        assert_eq!(position.side, Side::Buy);

        let report = engine.on_bar(&eurusd(), &bar(2, 1.0990, 1.1060, 1.1040)).unwrap();
        assert_eq!(report.closed_trades.len(), 1);
        assert_eq!(report.closed_trades[0].exit_reason, ExitReason::TakeProfit);
        assert_eq!(engine.analyzer().trades().len(), 1);

        assert_eq!(sink.count("order_created"), 1);
        assert_eq!(sink.count("fill"), 1);
        assert_eq!(sink.count("position_opened"), 1);
        assert_eq!(sink.count("position_closed"), 1);
        assert_eq!(sink.count("trade"), 1);
        assert_eq!(sink.count("account_snapshot"), 3);
    }

    #[test]
    fn test_limit_fill_respects_position_cap() {
        let config = Config {
            broker: BrokerConfig::frictionless()
                .with_initial_balance(1_000.0)
                .with_max_open_positions(1),
            ..Config::default()
        };
        let sink = Arc::new(CollectingSink::new());
        let mut engine =
            SimulationEngine::new(&config, Box::new(FixedRandom::lowest())).with_event_sink(sink.clone());
        engine.on_bar(&eurusd(), &bar(0, 1.0990, 1.1010, 1.1000)).unwrap();

        engine
            .submit_order(OrderRequest::market_buy(eurusd(), 0.1))
            .unwrap();
        let err = engine
            .submit_order(OrderRequest::market_buy(eurusd(), 0.1))
            .unwrap_err();
        assert_eq!(err, RejectionReason::MaxPositionsReached { max: 1 });

        let id = engine
            .submit_order(OrderRequest::limit_buy(eurusd(), 50.0, 1.0950))
            .unwrap()
            .order_id();
        let report = engine.on_bar(&eurusd(), &bar(1, 1.0945, 1.0990, 1.0960)).unwrap();

        assert!(report.fills.is_empty());
        assert!(report.opened_positions.is_empty());
        assert_eq!(report.account.open_positions, 1);
        assert!(report.account.free_margin >= 0.0);

        let order = engine.matching().get_order(id).unwrap();
        assert_eq!(order.status, OrderStatus::Cancelled);
        assert!(order
            .reason
            .as_deref()
            .is_some_and(|r| r.starts_with("Maximum open positions")));
        assert_eq!(sink.count("order_cancelled"), 1);
        assert_eq!(sink.count("position_opened"), 1);
    }

    #[test]
    fn test_entry_costs_before_first_snapshot_are_not_drawdown() {
        let config = Config {
            broker: BrokerConfig::frictionless(),
            matching: MatchingConfig {
                commission_per_lot: 7.0,
                ..MatchingConfig::default()
            },
            ..Config::default()
        };
        let mut engine = SimulationEngine::new(&config, Box::new(FixedRandom::lowest()));
        engine
            .submit_order(OrderRequest::limit_buy(eurusd(), 1.0, 1.1000))
            .unwrap();

        for minute in 0..5 {
            engine.on_bar(&eurusd(), &bar(minute, 1.0990, 1.1010, 1.1000)).unwrap();
        }
        assert!((engine.account().balance.to_f64() - 9_993.0).abs() < 1e-9);

        let trades = engine.close_all(None, ExitReason::Manual);
        assert_eq!(trades.len(), 1);

        let metrics = engine.metrics();
        assert_eq!(metrics.max_drawdown, 0.0);
        assert_eq!(metrics.max_drawdown_pct, 0.0);
    }

    #[test]
    fn test_pending_lot_size_checked_at_submit() {
        let mut engine = engine();
        let err = engine
            .submit_order(OrderRequest::limit_buy(eurusd(), 500.0, 1.09))
            .unwrap_err();
        assert!(matches!(err, RejectionReason::InvalidLotSize { .. }));
        assert_eq!(engine.matching().pending_count(), 0);
    }

    #[test]
    fn test_malformed_bar_rejected() {
        let mut engine = engine();
        let broken = Bar::new_unchecked(t0(), 1.1, 1.0, 1.2, 1.1, 10.0);
        assert!(engine.on_bar(&eurusd(), &broken).is_err());
        assert_eq!(engine.bars_processed(), 0);
        assert!(engine.analyzer().equity_curve().is_empty());
    }

    #[test]
    fn test_close_all_feeds_analyzer() {
        let mut engine = engine();
        engine.on_bar(&eurusd(), &bar(0, 1.0990, 1.1010, 1.1000)).unwrap();
        engine
            .submit_order(OrderRequest::market_buy(eurusd(), 0.1))
            .unwrap();
        engine
            .submit_order(OrderRequest::market_sell(eurusd(), 0.2))
            .unwrap();

        engine.on_bar(&eurusd(), &bar(1, 1.0995, 1.1025, 1.1020)).unwrap();
        let trades = engine.close_all(Some(&eurusd()), ExitReason::Signal);

        assert_eq!(trades.len(), 2);
        assert_eq!(engine.positions().count(), 0);
        assert_eq!(engine.metrics().total_trades, 2);
        // +20 pips on 0.1, −20 pips on 0.2
        assert!((engine.metrics().net_profit + 20.0).abs() < 1e-6);
    }

    #[test]
    fn test_close_position_twice() {
        let mut engine = engine();
        engine.on_bar(&eurusd(), &bar(0, 1.0990, 1.1010, 1.1000)).unwrap();
        let outcome = engine
            .submit_order(OrderRequest::market_buy(eurusd(), 0.1))
            .unwrap();
        let SubmitOutcome::Executed(execution) = outcome else {
            panic!("market order should execute");
        };

        engine
            .close_position(execution.position_id, ExitReason::Manual)
            .unwrap();
        assert_eq!(
            engine
                .close_position(execution.position_id, ExitReason::Manual)
                .unwrap_err(),
            BrokerError::PositionNotFound(execution.position_id)
        );
        assert_eq!(engine.analyzer().trades().len(), 1);
    }
}
