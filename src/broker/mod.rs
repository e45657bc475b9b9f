//! Simulated retail broker
//!
//! Executes market orders with spread, slippage, commission and stochastic
//! rejection; owns the open positions, monitors their stop-loss / take-profit
//! levels bar by bar, accrues swap and keeps the account ledger.
//!
//! Costs hit the balance exactly once: commission and spread when the
//! position opens, swap as it accrues. Closing credits only the gross P&L.

pub mod account;
pub mod costs;
pub mod position;

pub use account::{AccountState, MarginAlert};
pub use costs::{CostModel, ExitKind};
pub use position::Position;

use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use tracing::{info, warn};

use crate::config::{BrokerConfig, ExitPriority};
use crate::error::{BrokerError, RejectionReason};
use crate::events::{EngineEvent, SharedSink, TracingSink};
use crate::oms::{
    validate_order, Fill, IdGenerator, MarketSnapshot, Order, OrderId, OrderRequest, OrderStatus,
    OrderType,
};
use crate::rng::RandomSource;
use crate::{Bar, ExitReason, Money, PositionId, Side, Symbol, Trade};

/// Accepted market order: the order ticket plus what the fill cost
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MarketExecution {
    pub order_id: OrderId,
    pub position_id: PositionId,
    pub symbol: Symbol,
    pub side: Side,
    pub lot_size: f64,
    pub requested_price: f64,
    pub executed_price: f64,
    pub slippage_pips: f64,
    pub spread_pips: f64,
    pub commission: Money,
    pub spread_cost: Money,
    pub slippage_cost: Money,
    pub time: DateTime<Utc>,
}

/// Broker simulator
pub struct BrokerSimulator {
    costs: CostModel,
    rng: Box<dyn RandomSource>,
    ids: IdGenerator,
    next_position_id: PositionId,
    next_trade_id: u64,

    balance: Money,
    positions: BTreeMap<PositionId, Position>,
    closed_positions: Vec<Position>,
    trade_history: Vec<Trade>,
    new_trades: Vec<Trade>,
    market_orders: Vec<Order>,
    last_prices: HashMap<Symbol, f64>,
    account: AccountState,

    sink: SharedSink,
}

impl BrokerSimulator {
    pub fn new(config: BrokerConfig, rng: Box<dyn RandomSource>) -> Self {
        let balance = Money::from_f64(config.initial_balance);
        Self {
            costs: CostModel::new(config),
            rng,
            ids: IdGenerator::new(),
            next_position_id: 1,
            next_trade_id: 1,
            balance,
            positions: BTreeMap::new(),
            closed_positions: Vec::new(),
            trade_history: Vec::new(),
            new_trades: Vec::new(),
            market_orders: Vec::new(),
            last_prices: HashMap::new(),
            account: AccountState::initial(balance, DateTime::<Utc>::default()),
            sink: Arc::new(TracingSink),
        }
    }

    /// Share an id sequence (orders and fills) with another component
    pub fn with_id_generator(mut self, ids: IdGenerator) -> Self {
        self.ids = ids;
        self
    }

    pub fn with_event_sink(mut self, sink: SharedSink) -> Self {
        self.sink = sink;
        self
    }

    pub fn config(&self) -> &BrokerConfig {
        self.costs.config()
    }

    pub fn costs(&self) -> &CostModel {
        &self.costs
    }

    // ========================================================================
    // Order execution
    // ========================================================================

    /// Execute a market order at the bar's close.
    ///
    /// Checks run in a fixed order and the first failure wins: lot size,
    /// position count, margin, exposure, market hours, bar volume, then the
    /// stochastic broker rejection. An accepted fill whose slippage exceeds
    /// the allowed maximum is rejected after the fact.
    pub fn submit_order(
        &mut self,
        request: &OrderRequest,
        bar: &Bar,
    ) -> Result<MarketExecution, RejectionReason> {
        let mut order = Order::from_request(request, bar.time);
        order.id = self.ids.next_id();

        if order.order_type != OrderType::Market {
            let reason = RejectionReason::UnsupportedOrderType(order.order_type);
            return Err(self.reject(order, reason));
        }
        if let Err(rejection) = validate_order(&order) {
            return Err(self.reject(order, rejection.into()));
        }

        self.mark_symbol(&order.symbol, bar.close);
        self.recompute_account(bar.time);

        if let Err(reason) = self.pre_validate(&order, bar) {
            return Err(self.reject(order, reason));
        }

        let rejection_probability = self.costs.rejection_probability(bar.volume);
        if self.rng.chance(rejection_probability) {
            return Err(self.reject(order, RejectionReason::BrokerRejection));
        }

        let instrument = self.costs.config().instrument_for(&order.symbol).clone();
        let lots = order.quantity;
        let spread_pips = self.costs.spread_pips(bar.volume);
        let (min_slip, max_slip) = self.costs.entry_slippage_range(bar.volume);
        let slippage_pips = self.rng.uniform(min_slip, max_slip);

        let requested_price = bar.close;
        let executed_price =
            requested_price + order.side.sign() * instrument.pips_to_price(slippage_pips);

        let deviation_pips = instrument.price_to_pips((executed_price - requested_price).abs());
        let max_allowed = self.costs.config().max_allowed_slippage_pips;
        if deviation_pips > max_allowed + 1e-9 {
            let reason = RejectionReason::MaxSlippageExceeded {
                slippage_pips: deviation_pips,
                max_pips: max_allowed,
            };
            return Err(self.reject(order, reason));
        }

        let commission = Money::from_f64(self.costs.commission(lots));
        let spread_cost =
            Money::from_f64(self.costs.spread_cost(&order.symbol, spread_pips, lots));
        let slippage_cost =
            Money::from_f64(self.costs.slippage_cost(&order.symbol, slippage_pips, lots));
        self.balance -= commission + spread_cost;

        let half_spread = instrument.pips_to_price(spread_pips) / 2.0;
        let fill = Fill {
            id: self.ids.next_id(),
            order_id: order.id,
            timestamp: bar.time,
            price: executed_price,
            volume: lots,
            commission: commission.to_f64(),
            market: MarketSnapshot {
                bid: bar.bid.unwrap_or(bar.close - half_spread),
                ask: bar.ask.unwrap_or(bar.close + half_spread),
                volume: bar.volume,
            },
        };
        order.apply_fill(fill.clone());

        info!(
            order_id = order.id,
            symbol = %order.symbol,
            side = %order.side,
            lots,
            requested = requested_price,
            executed = executed_price,
            slippage_pips,
            spread_pips,
            "Market order executed"
        );
        self.sink.emit(&EngineEvent::OrderCreated(order.clone()));
        self.sink.emit(&EngineEvent::Fill {
            symbol: order.symbol.clone(),
            fill,
        });

        let position_id = self.open_position(
            &order,
            executed_price,
            requested_price,
            commission,
            spread_cost,
            slippage_cost,
            bar.time,
        );

        let execution = MarketExecution {
            order_id: order.id,
            position_id,
            symbol: order.symbol.clone(),
            side: order.side,
            lot_size: lots,
            requested_price,
            executed_price,
            slippage_pips,
            spread_pips,
            commission,
            spread_cost,
            slippage_cost,
            time: bar.time,
        };
        self.market_orders.push(order);
        Ok(execution)
    }

    /// Lot size must lie within the configured bounds
    pub fn check_lot_size(&self, lots: f64) -> Result<(), RejectionReason> {
        let config = self.costs.config();
        if !lots.is_finite() || lots < config.min_lot_size || lots > config.max_lot_size {
            return Err(RejectionReason::InvalidLotSize {
                lots,
                min: config.min_lot_size,
                max: config.max_lot_size,
            });
        }
        Ok(())
    }

    /// Position count, free margin and total exposure for a new position of
    /// `lots` in `symbol` opened at `price`
    pub fn check_capacity(
        &self,
        symbol: &Symbol,
        lots: f64,
        price: f64,
    ) -> Result<(), RejectionReason> {
        let config = self.costs.config();

        if self.positions.len() >= config.max_open_positions {
            return Err(RejectionReason::MaxPositionsReached {
                max: config.max_open_positions,
            });
        }

        let required = self.costs.margin_required(symbol, lots, price);
        if required > self.account.free_margin {
            return Err(RejectionReason::InsufficientMargin {
                required,
                free: self.account.free_margin,
            });
        }

        let exposure = self.total_exposure() + self.costs.notional(symbol, lots, price);
        if exposure > config.max_total_exposure {
            return Err(RejectionReason::ExposureLimitExceeded {
                exposure,
                cap: config.max_total_exposure,
            });
        }

        Ok(())
    }

    fn pre_validate(&self, order: &Order, bar: &Bar) -> Result<(), RejectionReason> {
        let config = self.costs.config();
        let lots = order.quantity;

        self.check_lot_size(lots)?;
        self.check_capacity(&order.symbol, lots, bar.close)?;

        if !self.costs.is_market_open(bar) {
            return Err(RejectionReason::MarketClosed);
        }

        if bar.volume < config.min_bar_volume {
            return Err(RejectionReason::InsufficientLiquidity {
                volume: bar.volume,
                min: config.min_bar_volume,
            });
        }

        Ok(())
    }

    fn reject(&mut self, mut order: Order, reason: RejectionReason) -> RejectionReason {
        warn!(
            order_id = order.id,
            symbol = %order.symbol,
            side = %order.side,
            lots = order.quantity,
            stochastic = reason.is_stochastic(),
            "Order rejected: {}",
            reason
        );
        order.close_out(OrderStatus::Rejected, reason.to_string());
        self.sink.emit(&EngineEvent::OrderRejected(order.clone()));
        self.market_orders.push(order);
        reason
    }

    /// Open a position for a fill produced by the matching engine.
    ///
    /// The fill must pass the same capacity checks as a market order; a
    /// refused fill leaves the ledger untouched. The fill price already
    /// contains the spread, so only commission is charged.
    pub fn open_from_fill(
        &mut self,
        order: &Order,
        fill: &Fill,
    ) -> Result<PositionId, RejectionReason> {
        self.mark_symbol(&order.symbol, fill.price);
        self.recompute_account(fill.timestamp);

        if let Err(reason) = self.check_capacity(&order.symbol, fill.volume, fill.price) {
            warn!(
                order_id = order.id,
                symbol = %order.symbol,
                lots = fill.volume,
                price = fill.price,
                "Fill refused: {}",
                reason
            );
            return Err(reason);
        }

        let commission = Money::from_f64(fill.commission);
        self.balance -= commission;

        let mut ticket = order.clone();
        ticket.quantity = fill.volume;
        Ok(self.open_position(
            &ticket,
            fill.price,
            fill.price,
            commission,
            Money::ZERO,
            Money::ZERO,
            fill.timestamp,
        ))
    }

    #[allow(clippy::too_many_arguments)]
    fn open_position(
        &mut self,
        order: &Order,
        entry_price: f64,
        requested_price: f64,
        commission: Money,
        spread_cost: Money,
        slippage_cost: Money,
        time: DateTime<Utc>,
    ) -> PositionId {
        let id = self.next_position_id;
        self.next_position_id += 1;

        let position = Position {
            id,
            order_id: order.id,
            symbol: order.symbol.clone(),
            side: order.side,
            lot_size: order.quantity,
            entry_price,
            requested_price,
            current_price: entry_price,
            stop_loss: order.stop_loss,
            take_profit: order.take_profit,
            commission,
            swap: Money::ZERO,
            spread_cost,
            slippage_cost,
            margin_required: self
                .costs
                .margin_required(&order.symbol, order.quantity, entry_price),
            open_time: time,
            days_held: 0,
            last_swap_date: time.date_naive(),
            unrealized_pnl: Money::ZERO,
            realized_pnl: None,
            exit_price: None,
            exit_time: None,
            exit_reason: None,
        };

        info!(
            position_id = id,
            symbol = %position.symbol,
            side = %position.side,
            lots = position.lot_size,
            entry = entry_price,
            stop_loss = ?position.stop_loss,
            take_profit = ?position.take_profit,
            "Position opened"
        );
        self.sink.emit(&EngineEvent::PositionOpened(position.clone()));
        self.positions.insert(id, position);
        self.recompute_account(time);
        id
    }

    // ========================================================================
    // Position monitoring
    // ========================================================================

    /// Scan the symbol's open positions against a bar.
    ///
    /// A position whose stop-loss or take-profit lies inside the bar range is
    /// closed at that level, adjusted by adverse slippage. When both lie inside,
    /// `exit_priority` decides. Positions left open accrue swap for every
    /// elapsed calendar day and are marked to the bar close.
    pub fn update_positions(&mut self, symbol: &Symbol, bar: &Bar) -> Vec<Trade> {
        self.last_prices.insert(symbol.clone(), bar.close);
        let priority = self.costs.config().exit_priority;

        let ids: Vec<PositionId> = self
            .positions
            .values()
            .filter(|p| &p.symbol == symbol)
            .map(|p| p.id)
            .collect();

        let mut closed = Vec::new();
        for id in ids {
            let Some(position) = self.positions.get(&id) else {
                continue;
            };
            let exit = match (position.stop_loss_hit(bar), position.take_profit_hit(bar), priority) {
                (true, false, _) | (true, true, ExitPriority::StopLossFirst) => Some(ExitKind::StopLoss),
                (false, true, _) | (true, true, ExitPriority::TakeProfitFirst) => {
                    Some(ExitKind::TakeProfit)
                }
                (false, false, _) => None,
            };

            match exit {
                Some(kind) => {
                    if let Ok(trade) = self.close_at_level(id, kind, bar) {
                        closed.push(trade);
                    }
                }
                None => {
                    self.accrue_swap(id, bar.date());
                    if let Some(position) = self.positions.get_mut(&id) {
                        let instrument = self.costs.config().instrument_for(&position.symbol);
                        position.update_unrealized_pnl(bar.close, instrument);
                        self.sink.emit(&EngineEvent::PositionUpdated(position.clone()));
                    }
                }
            }
        }

        self.recompute_account(bar.time);
        closed
    }

    fn close_at_level(
        &mut self,
        id: PositionId,
        kind: ExitKind,
        bar: &Bar,
    ) -> Result<Trade, BrokerError> {
        let position = self
            .positions
            .get(&id)
            .ok_or(BrokerError::PositionNotFound(id))?;
        let (level, reason) = match kind {
            ExitKind::StopLoss => (position.stop_loss, ExitReason::StopLoss),
            ExitKind::TakeProfit => (position.take_profit, ExitReason::TakeProfit),
        };
        let level = level.ok_or(BrokerError::InvalidPrice(f64::NAN))?;
        let side = position.side;
        let lots = position.lot_size;
        let symbol = position.symbol.clone();

        let (min_slip, max_slip) = self.costs.exit_slippage_range(bar.volume, kind);
        let slippage_pips = self.rng.uniform(min_slip, max_slip);
        let pip_price = self
            .costs
            .config()
            .instrument_for(&symbol)
            .pips_to_price(slippage_pips);
        let exit_price = level - side.sign() * pip_price;
        let slippage_cost =
            Money::from_f64(self.costs.slippage_cost(&symbol, slippage_pips, lots));

        self.close_internal(id, exit_price, bar.time, reason, slippage_cost)
    }

    fn accrue_swap(&mut self, id: PositionId, date: NaiveDate) {
        let Some(position) = self.positions.get_mut(&id) else {
            return;
        };
        let days = (date - position.last_swap_date).num_days();
        if days <= 0 {
            return;
        }
        let swap = Money::from_f64(self.costs.swap(position.side, position.lot_size, days));
        position.swap += swap;
        position.days_held += days;
        position.last_swap_date = date;
        self.balance -= swap;
    }

    fn mark_symbol(&mut self, symbol: &Symbol, price: f64) {
        self.last_prices.insert(symbol.clone(), price);
        let instrument = self.costs.config().instrument_for(symbol);
        for position in self.positions.values_mut().filter(|p| &p.symbol == symbol) {
            position.update_unrealized_pnl(price, instrument);
        }
    }

    // ========================================================================
    // Closing
    // ========================================================================

    /// Close a position at `price` (no exit slippage)
    pub fn close_position(
        &mut self,
        id: PositionId,
        price: f64,
        time: DateTime<Utc>,
        reason: ExitReason,
    ) -> Result<Trade, BrokerError> {
        if !(price > 0.0) || !price.is_finite() {
            return Err(BrokerError::InvalidPrice(price));
        }
        self.close_internal(id, price, time, reason, Money::ZERO)
    }

    /// Close every open position (of one symbol, or all) at the last known price
    pub fn close_all(
        &mut self,
        symbol: Option<&Symbol>,
        time: DateTime<Utc>,
        reason: ExitReason,
    ) -> Vec<Trade> {
        let targets: Vec<(PositionId, f64)> = self
            .positions
            .values()
            .filter(|p| symbol.map_or(true, |s| &p.symbol == s))
            .map(|p| {
                let price = self
                    .last_prices
                    .get(&p.symbol)
                    .copied()
                    .unwrap_or(p.current_price);
                (p.id, price)
            })
            .collect();

        targets
            .into_iter()
            .filter_map(|(id, price)| match self.close_position(id, price, time, reason) {
                Ok(trade) => Some(trade),
                Err(e) => {
                    warn!(position_id = id, "Failed to close position: {}", e);
                    None
                }
            })
            .collect()
    }

    fn close_internal(
        &mut self,
        id: PositionId,
        exit_price: f64,
        time: DateTime<Utc>,
        reason: ExitReason,
        exit_slippage_cost: Money,
    ) -> Result<Trade, BrokerError> {
        let mut position = self
            .positions
            .remove(&id)
            .ok_or(BrokerError::PositionNotFound(id))?;

        let instrument = self.costs.config().instrument_for(&position.symbol);
        let gross = Money::from_f64(position.gross_pnl_at(exit_price, instrument));
        let pips = instrument.price_to_pips(position.price_move(exit_price));

        position.slippage_cost += exit_slippage_cost;
        let net = gross - position.total_costs();

        position.current_price = exit_price;
        position.unrealized_pnl = Money::ZERO;
        position.realized_pnl = Some(net);
        position.exit_price = Some(exit_price);
        position.exit_time = Some(time);
        position.exit_reason = Some(reason);

        self.balance += gross;
        self.recompute_account(time);

        let trade = Trade {
            id: self.next_trade_id,
            position_id: position.id,
            symbol: position.symbol.clone(),
            side: position.side,
            lot_size: position.lot_size,
            entry_price: position.entry_price,
            exit_price,
            entry_time: position.open_time,
            exit_time: time,
            gross_pnl: gross,
            commission: position.commission,
            swap: position.swap,
            spread_cost: position.spread_cost,
            slippage_cost: position.slippage_cost,
            net_pnl: net,
            exit_reason: reason,
            pips,
            duration_secs: (time - position.open_time).num_seconds(),
            balance_after: self.balance,
            equity_after: self.account.equity,
        };
        self.next_trade_id += 1;

        info!(
            position_id = position.id,
            symbol = %position.symbol,
            side = %position.side,
            entry = position.entry_price,
            exit = exit_price,
            pips = format!("{:.1}", pips),
            net_pnl = %net,
            reason = %reason,
            "Position closed"
        );
        self.sink.emit(&EngineEvent::PositionClosed(position.clone()));
        self.sink.emit(&EngineEvent::Trade(trade.clone()));

        self.closed_positions.push(position);
        self.trade_history.push(trade.clone());
        self.new_trades.push(trade.clone());
        Ok(trade)
    }

    // ========================================================================
    // Account
    // ========================================================================

    /// Recompute equity and margin from scratch
    fn recompute_account(&mut self, time: DateTime<Utc>) {
        let config = self.costs.config();
        let unrealized: Money = self.positions.values().map(|p| p.unrealized_pnl).sum();
        let margin_used: f64 = self.positions.values().map(|p| p.margin_required).sum();
        let equity = self.balance + unrealized;
        let margin_level = if margin_used > 0.0 {
            equity.to_f64() / margin_used * 100.0
        } else {
            0.0
        };
        let alert = AccountState::classify(
            margin_used,
            margin_level,
            config.margin_call_level,
            config.stop_out_level,
        );

        if alert != self.account.alert {
            match alert {
                MarginAlert::StopOut => warn!(
                    margin_level = format!("{:.1}", margin_level),
                    threshold = config.stop_out_level,
                    "Stop-out level breached"
                ),
                MarginAlert::MarginCall => warn!(
                    margin_level = format!("{:.1}", margin_level),
                    threshold = config.margin_call_level,
                    "Margin call"
                ),
                MarginAlert::None => info!("Margin level restored"),
            }
        }

        self.account = AccountState {
            timestamp: time,
            balance: self.balance,
            equity,
            unrealized_pnl: unrealized,
            margin_used,
            free_margin: equity.to_f64() - margin_used,
            margin_level,
            open_positions: self.positions.len(),
            alert,
        };
    }

    pub fn account(&self) -> &AccountState {
        &self.account
    }

    pub fn balance(&self) -> Money {
        self.balance
    }

    /// Total notional of open positions at their current prices
    pub fn total_exposure(&self) -> f64 {
        let config = self.costs.config();
        self.positions
            .values()
            .map(|p| p.notional(p.current_price, config.instrument_for(&p.symbol)))
            .sum()
    }

    pub fn position(&self, id: PositionId) -> Option<&Position> {
        self.positions.get(&id)
    }

    /// Open positions ordered by id
    pub fn positions(&self) -> impl Iterator<Item = &Position> {
        self.positions.values()
    }

    pub fn open_position_count(&self) -> usize {
        self.positions.len()
    }

    pub fn closed_positions(&self) -> &[Position] {
        &self.closed_positions
    }

    pub fn trade_history(&self) -> &[Trade] {
        &self.trade_history
    }

    /// Trades closed since the last call
    pub fn drain_new_trades(&mut self) -> Vec<Trade> {
        std::mem::take(&mut self.new_trades)
    }

    /// Market orders handled by the broker, accepted and rejected
    pub fn market_orders(&self) -> &[Order] {
        &self.market_orders
    }

    pub fn last_price(&self, symbol: &Symbol) -> Option<f64> {
        self.last_prices.get(symbol).copied()
    }
}
