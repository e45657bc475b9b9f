//! Pending-order book for a single simulated counterparty
//!
//! Holds non-market orders until a bar satisfies them. Orders are matched in
//! submission order (ids are monotonic, so the `BTreeMap` key order is the
//! submission order) and every fill consumes the bar's remaining volume.

use chrono::{DateTime, NaiveTime, Utc};
use std::collections::BTreeMap;
use std::sync::Arc;
use tracing::{debug, info, warn};

use crate::config::MatchingConfig;
use crate::error::{OrderRejection, RejectionReason};
use crate::events::{EngineEvent, SharedSink, TracingSink};
use crate::oms::execution::ExecutionEngine;
use crate::oms::types::{
    Fill, IdGenerator, Order, OrderId, OrderStatus, OrderType, TimeInForce, QUANTITY_EPSILON,
};
use crate::{Bar, Symbol};

/// Order matching engine: pending set plus terminal-order history
pub struct OrderMatchingEngine {
    execution: ExecutionEngine,
    ids: IdGenerator,

    pending: BTreeMap<OrderId, Order>,
    filled: Vec<Order>,
    cancelled: Vec<Order>,
    rejected: Vec<Order>,

    sink: SharedSink,
}

impl OrderMatchingEngine {
    pub fn new(config: &MatchingConfig) -> Self {
        Self {
            execution: ExecutionEngine::from_config(config),
            ids: IdGenerator::new(),
            pending: BTreeMap::new(),
            filled: Vec::new(),
            cancelled: Vec::new(),
            rejected: Vec::new(),
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

    pub fn execution(&self) -> &ExecutionEngine {
        &self.execution
    }

    /// Validate and queue an order. Rejected orders are kept for reporting
    /// but never enter the pending set.
    pub fn submit(&mut self, mut order: Order) -> Result<OrderId, OrderRejection> {
        order.id = self.ids.next_id();

        if let Err(rejection) = validate_order(&order) {
            warn!(
                order_id = order.id,
                symbol = %order.symbol,
                "Order rejected: {}",
                rejection
            );
            order.close_out(OrderStatus::Rejected, rejection.to_string());
            self.sink.emit(&EngineEvent::OrderRejected(order.clone()));
            self.rejected.push(order);
            return Err(rejection);
        }

        if order.time_in_force == TimeInForce::DAY && order.expires_at.is_none() {
            order.expires_at = Some(end_of_day(order.created_at));
        }

        info!(
            order_id = order.id,
            symbol = %order.symbol,
            side = %order.side,
            order_type = ?order.order_type,
            quantity = order.quantity,
            tif = ?order.time_in_force,
            "Order accepted"
        );
        self.sink.emit(&EngineEvent::OrderCreated(order.clone()));

        let id = order.id;
        self.pending.insert(id, order);
        Ok(id)
    }

    /// Cancel a pending order. Returns false if the order is not pending.
    pub fn cancel(&mut self, order_id: OrderId, reason: &str) -> bool {
        match self.pending.remove(&order_id) {
            Some(order) => {
                self.retire_cancelled(order, reason);
                true
            }
            None => {
                debug!(order_id, "Cancel ignored: order not pending");
                false
            }
        }
    }

    /// Expire stale orders, then match the symbol's pending orders against the bar
    pub fn process_bar(&mut self, symbol: &Symbol, bar: &Bar) -> Vec<Fill> {
        self.process_bar_with(symbol, bar, |_, _| Ok(()))
    }

    /// Like [`process_bar`](Self::process_bar), but every fill is offered to
    /// `admit` before it is committed. A refused fill is discarded and the
    /// order is cancelled with the refusal as its reason; fills it received on
    /// earlier bars are kept.
    pub fn process_bar_with<F>(&mut self, symbol: &Symbol, bar: &Bar, mut admit: F) -> Vec<Fill>
    where
        F: FnMut(&Order, &Fill) -> Result<(), RejectionReason>,
    {
        self.expire_orders(bar.time);

        let mut fills = Vec::new();
        let mut available = bar.volume.max(0.0);

        let ids: Vec<OrderId> = self
            .pending
            .iter()
            .filter(|(_, order)| &order.symbol == symbol)
            .map(|(id, _)| *id)
            .collect();

        for id in ids {
            let Some(mut order) = self.pending.remove(&id) else {
                continue;
            };

            if self.execution.update_trigger(&mut order, bar) {
                info!(order_id = id, stop_price = ?order.stop_price, "Stop triggered");
            }

            let immediate = matches!(order.time_in_force, TimeInForce::IOC | TimeInForce::FOK);

            match self.execution.check_fill(&order, bar) {
                None if immediate => {
                    self.retire_cancelled(order, "not immediately marketable");
                    continue;
                }
                None => {}
                Some(_) if order.time_in_force == TimeInForce::FOK
                    && available + QUANTITY_EPSILON < order.remaining_quantity =>
                {
                    self.retire_cancelled(order, "FOK: insufficient volume");
                    continue;
                }
                Some(price) => {
                    let qty = order.remaining_quantity.min(available);
                    if qty > QUANTITY_EPSILON {
                        let fill_id = self.ids.next_id();
                        let mut candidate = order.clone();
                        let fill = self
                            .execution
                            .execute_partial_fill(&mut candidate, fill_id, price, qty, bar);

                        if let Err(reason) = admit(&candidate, &fill) {
                            warn!(order_id = id, "Fill refused: {}", reason);
                            self.retire_cancelled(order, &reason.to_string());
                            continue;
                        }
                        order = candidate;
                        available = (available - fill.volume).max(0.0);

                        info!(
                            order_id = id,
                            price = fill.price,
                            volume = fill.volume,
                            remaining = order.remaining_quantity,
                            "Order filled"
                        );
                        self.sink.emit(&EngineEvent::Fill {
                            symbol: symbol.clone(),
                            fill: fill.clone(),
                        });
                        fills.push(fill);
                    }

                    if order.time_in_force == TimeInForce::IOC && order.is_active() {
                        self.retire_cancelled(order, "IOC: remainder cancelled");
                        continue;
                    }
                }
            }

            if order.status == OrderStatus::Filled {
                self.filled.push(order);
            } else {
                self.pending.insert(id, order);
            }
        }

        fills
    }

    /// Cancel every pending order whose expiry lies before `now`
    fn expire_orders(&mut self, now: DateTime<Utc>) {
        let expired: Vec<OrderId> = self
            .pending
            .values()
            .filter(|order| order.expires_at.is_some_and(|expiry| expiry < now))
            .map(|order| order.id)
            .collect();

        for id in expired {
            if let Some(order) = self.pending.remove(&id) {
                self.retire_cancelled(order, "expired");
            }
        }
    }

    fn retire_cancelled(&mut self, mut order: Order, reason: &str) {
        order.close_out(OrderStatus::Cancelled, reason);
        info!(
            order_id = order.id,
            filled = order.filled_quantity,
            "Order cancelled: {}",
            reason
        );
        self.sink.emit(&EngineEvent::OrderCancelled(order.clone()));
        self.cancelled.push(order);
    }

    /// Look up an order in any collection
    pub fn get_order(&self, order_id: OrderId) -> Option<&Order> {
        self.pending.get(&order_id).or_else(|| {
            self.filled
                .iter()
                .chain(&self.cancelled)
                .chain(&self.rejected)
                .find(|order| order.id == order_id)
        })
    }

    pub fn is_pending(&self, order_id: OrderId) -> bool {
        self.pending.contains_key(&order_id)
    }

    /// Pending orders in submission order
    pub fn pending_orders(&self) -> impl Iterator<Item = &Order> {
        self.pending.values()
    }

    pub fn pending_count(&self) -> usize {
        self.pending.len()
    }

    pub fn filled_orders(&self) -> &[Order] {
        &self.filled
    }

    pub fn cancelled_orders(&self) -> &[Order] {
        &self.cancelled
    }

    pub fn rejected_orders(&self) -> &[Order] {
        &self.rejected
    }
}

/// Structural checks applied before an order enters the book
pub fn validate_order(order: &Order) -> Result<(), OrderRejection> {
    if !(order.quantity > 0.0) || !order.quantity.is_finite() {
        return Err(OrderRejection::InvalidQuantity(order.quantity));
    }

    let positive = |price: Option<f64>| price.is_some_and(|p| p > 0.0 && p.is_finite());

    if matches!(order.order_type, OrderType::Limit | OrderType::StopLimit)
        && !positive(order.limit_price)
    {
        return Err(OrderRejection::MissingLimitPrice(order.order_type));
    }
    if matches!(order.order_type, OrderType::Stop | OrderType::StopLimit)
        && !positive(order.stop_price)
    {
        return Err(OrderRejection::MissingStopPrice(order.order_type));
    }
    if order.expires_at.is_some_and(|expiry| expiry < order.created_at) {
        return Err(OrderRejection::ExpiryBeforeCreation);
    }
    Ok(())
}

/// 23:59:59.999 UTC on the day of `time`
fn end_of_day(time: DateTime<Utc>) -> DateTime<Utc> {
    let last_ms = NaiveTime::from_hms_milli_opt(23, 59, 59, 999).unwrap_or_default();
    DateTime::from_naive_utc_and_offset(time.date_naive().and_time(last_ms), Utc)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::CollectingSink;
    use crate::oms::OrderRequest;
    use crate::Side;
    use chrono::{Duration, TimeZone};

    fn t0() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 3, 4, 10, 0, 0).unwrap()
    }

    fn eurusd() -> Symbol {
        Symbol::new("EURUSD")
    }

    fn bar_at(time: DateTime<Utc>, low: f64, high: f64, close: f64, volume: f64) -> Bar {
        Bar::new_unchecked(time, close, high, low, close, volume)
    }

    fn engine() -> OrderMatchingEngine {
        OrderMatchingEngine::new(&MatchingConfig::default())
    }

    fn submit(engine: &mut OrderMatchingEngine, request: OrderRequest) -> OrderId {
        engine.submit(Order::from_request(&request, t0())).unwrap()
    }

    #[test]
    fn test_rejects_invalid_orders() {
        let mut engine = engine();

        let bad_qty = Order::from_request(&OrderRequest::market_buy(eurusd(), 0.0), t0());
        assert_eq!(
            engine.submit(bad_qty),
            Err(OrderRejection::InvalidQuantity(0.0))
        );

        let mut no_limit = OrderRequest::limit_buy(eurusd(), 1.0, 1.1);
        no_limit.limit_price = None;
        assert_eq!(
            engine.submit(Order::from_request(&no_limit, t0())),
            Err(OrderRejection::MissingLimitPrice(OrderType::Limit))
        );

        let mut no_stop = OrderRequest::stop(eurusd(), Side::Sell, 1.0, 1.09);
        no_stop.stop_price = Some(-1.0);
        assert_eq!(
            engine.submit(Order::from_request(&no_stop, t0())),
            Err(OrderRejection::MissingStopPrice(OrderType::Stop))
        );

        assert_eq!(engine.pending_count(), 0);
        assert_eq!(engine.rejected_orders().len(), 3);
        assert!(engine
            .rejected_orders()
            .iter()
            .all(|o| o.status == OrderStatus::Rejected));
    }

    #[test]
    fn test_day_order_defaults_to_end_of_day() {
        let mut engine = engine();
        let id = submit(
            &mut engine,
            OrderRequest::limit_buy(eurusd(), 1.0, 1.0900).with_time_in_force(TimeInForce::DAY),
        );

        let expiry = engine.get_order(id).unwrap().expires_at.unwrap();
        assert_eq!(
            expiry,
            Utc.with_ymd_and_hms(2024, 3, 4, 23, 59, 59).unwrap() + Duration::milliseconds(999)
        );

        // Same day: still pending
        engine.process_bar(&eurusd(), &bar_at(t0() + Duration::hours(13), 1.095, 1.1, 1.097, 100.0));
        assert!(engine.is_pending(id));

        // Next day: expired before matching, even though the limit is touched
        let fills =
            engine.process_bar(&eurusd(), &bar_at(t0() + Duration::days(1), 1.08, 1.1, 1.09, 100.0));
        assert!(fills.is_empty());
        let order = engine.get_order(id).unwrap();
        assert_eq!(order.status, OrderStatus::Cancelled);
        assert_eq!(order.reason.as_deref(), Some("expired"));
    }

    #[test]
    fn test_limit_partial_fill_then_complete() {
        let mut engine = engine();
        let id = submit(&mut engine, OrderRequest::limit_buy(eurusd(), 5.0, 1.0950));

        let fills = engine.process_bar(&eurusd(), &bar_at(t0(), 1.0940, 1.0990, 1.0960, 2.0));
        assert_eq!(fills.len(), 1);
        assert_eq!(fills[0].price, 1.0950);
        assert_eq!(fills[0].volume, 2.0);
        assert_eq!(
            engine.get_order(id).unwrap().status,
            OrderStatus::PartiallyFilled
        );

        let later = t0() + Duration::minutes(5);
        let fills = engine.process_bar(&eurusd(), &bar_at(later, 1.0945, 1.0990, 1.0960, 10.0));
        assert_eq!(fills[0].volume, 3.0);

        let order = engine.get_order(id).unwrap();
        assert_eq!(order.status, OrderStatus::Filled);
        assert!(!engine.is_pending(id));
        let filled: f64 = order.fills.iter().map(|f| f.volume).sum();
        assert!((filled - order.filled_quantity).abs() < 1e-12);
        assert!(order.filled_quantity <= order.quantity);
    }

    #[test]
    fn test_volume_consumed_in_submission_order() {
        let mut engine = engine();
        let first = submit(&mut engine, OrderRequest::market_buy(eurusd(), 3.0));
        let second = submit(&mut engine, OrderRequest::market_sell(eurusd(), 3.0));

        let fills = engine.process_bar(&eurusd(), &bar_at(t0(), 1.099, 1.101, 1.1, 4.0));
        assert_eq!(fills.len(), 2);
        assert_eq!(fills[0].order_id, first);
        assert_eq!(fills[0].volume, 3.0);
        assert_eq!(fills[1].order_id, second);
        assert!((fills[1].volume - 1.0).abs() < 1e-12);
        assert_eq!(
            engine.get_order(second).unwrap().status,
            OrderStatus::PartiallyFilled
        );
    }

    #[test]
    fn test_fok_never_partially_fills() {
        let mut engine = engine();
        let id = submit(
            &mut engine,
            OrderRequest::market_buy(eurusd(), 5.0).with_time_in_force(TimeInForce::FOK),
        );

        let fills = engine.process_bar(&eurusd(), &bar_at(t0(), 1.099, 1.101, 1.1, 4.0));
        assert!(fills.is_empty());

        let order = engine.get_order(id).unwrap();
        assert_eq!(order.status, OrderStatus::Cancelled);
        assert!(order.fills.is_empty());
    }

    #[test]
    fn test_fok_fills_completely_when_volume_allows() {
        let mut engine = engine();
        let id = submit(
            &mut engine,
            OrderRequest::market_buy(eurusd(), 5.0).with_time_in_force(TimeInForce::FOK),
        );

        let fills = engine.process_bar(&eurusd(), &bar_at(t0(), 1.099, 1.101, 1.1, 50.0));
        assert_eq!(fills.len(), 1);
        let order = engine.get_order(id).unwrap();
        assert_eq!(order.status, OrderStatus::Filled);
        assert_eq!(order.fills.len(), 1);
        assert_eq!(order.fills[0].volume, order.quantity);
    }

    #[test]
    fn test_ioc_cancels_remainder() {
        let mut engine = engine();
        let id = submit(
            &mut engine,
            OrderRequest::market_sell(eurusd(), 5.0).with_time_in_force(TimeInForce::IOC),
        );

        let fills = engine.process_bar(&eurusd(), &bar_at(t0(), 1.099, 1.101, 1.1, 2.0));
        assert_eq!(fills.len(), 1);

        let order = engine.get_order(id).unwrap();
        assert_eq!(order.status, OrderStatus::Cancelled);
        assert_eq!(order.filled_quantity, 2.0);
        assert_eq!(order.remaining_quantity, 3.0);
    }

    #[test]
    fn test_ioc_limit_not_marketable_is_cancelled() {
        let mut engine = engine();
        let id = submit(
            &mut engine,
            OrderRequest::limit_buy(eurusd(), 1.0, 1.0500).with_time_in_force(TimeInForce::IOC),
        );

        engine.process_bar(&eurusd(), &bar_at(t0(), 1.099, 1.101, 1.1, 100.0));
        assert_eq!(engine.get_order(id).unwrap().status, OrderStatus::Cancelled);
    }

    #[test]
    fn test_other_symbols_untouched() {
        let mut engine = engine();
        let id = submit(&mut engine, OrderRequest::market_buy(Symbol::new("GBPUSD"), 1.0));
        let fills = engine.process_bar(&eurusd(), &bar_at(t0(), 1.099, 1.101, 1.1, 100.0));
        assert!(fills.is_empty());
        assert!(engine.is_pending(id));
    }

    #[test]
    fn test_day_order_partial_fill_then_expiry() {
        let mut engine = engine();
        let id = submit(
            &mut engine,
            OrderRequest::limit_buy(eurusd(), 5.0, 1.0950).with_time_in_force(TimeInForce::DAY),
        );

        let fills = engine.process_bar(&eurusd(), &bar_at(t0(), 1.0940, 1.0990, 1.0960, 2.0));
        assert_eq!(fills.len(), 1);

        let fills =
            engine.process_bar(&eurusd(), &bar_at(t0() + Duration::days(1), 1.0940, 1.0990, 1.0960, 100.0));
        assert!(fills.is_empty());

        let order = engine.get_order(id).unwrap();
        assert_eq!(order.status, OrderStatus::Cancelled);
        assert_eq!(order.reason.as_deref(), Some("expired"));
        assert_eq!(order.fills.len(), 1);
        assert_eq!(order.filled_quantity, 2.0);
        assert_eq!(order.remaining_quantity, 3.0);
        assert!((order.filled_quantity + order.remaining_quantity - order.quantity).abs() < 1e-12);
    }

    #[test]
    fn test_stop_limit_triggers_and_fills_on_same_bar() {
        let mut engine = engine();
        let id = submit(
            &mut engine,
            OrderRequest::stop_limit(eurusd(), Side::Buy, 1.0, 1.1000, 1.0995),
        );

        // High crosses the stop, low comes back through the limit
        let fills = engine.process_bar(&eurusd(), &bar_at(t0(), 1.0990, 1.1005, 1.0998, 100.0));
        assert_eq!(fills.len(), 1);
        assert_eq!(fills[0].price, 1.0995);

        let order = engine.get_order(id).unwrap();
        assert!(order.triggered);
        assert_eq!(order.status, OrderStatus::Filled);
        assert!(!engine.is_pending(id));
    }

    #[test]
    fn test_refused_fill_cancels_order() {
        let sink = Arc::new(CollectingSink::new());
        let mut engine = engine().with_event_sink(sink.clone());
        let id = submit(&mut engine, OrderRequest::limit_buy(eurusd(), 5.0, 1.0950));

        // First bar admits a partial fill, the second refuses the rest
        let fills = engine.process_bar(&eurusd(), &bar_at(t0(), 1.0940, 1.0990, 1.0960, 2.0));
        assert_eq!(fills.len(), 1);

        let later = t0() + Duration::minutes(5);
        let fills = engine.process_bar_with(
            &eurusd(),
            &bar_at(later, 1.0940, 1.0990, 1.0960, 100.0),
            |_, _| Err(RejectionReason::MaxPositionsReached { max: 1 }),
        );
        assert!(fills.is_empty());

        let order = engine.get_order(id).unwrap();
        assert_eq!(order.status, OrderStatus::Cancelled);
        assert_eq!(
            order.reason.as_deref(),
            Some(RejectionReason::MaxPositionsReached { max: 1 }.to_string().as_str())
        );
        assert_eq!(order.fills.len(), 1);
        assert_eq!(order.filled_quantity, 2.0);
        assert_eq!(sink.count("fill"), 1);
        assert_eq!(sink.count("order_cancelled"), 1);
    }

    #[test]
    fn test_cancel_and_events() {
        let sink = Arc::new(CollectingSink::new());
        let mut engine = engine().with_event_sink(sink.clone());
        let id = submit(&mut engine, OrderRequest::limit_sell(eurusd(), 1.0, 1.2));

        assert!(engine.cancel(id, "user"));
        assert!(!engine.cancel(id, "user"));
        assert_eq!(engine.cancelled_orders().len(), 1);
        assert_eq!(sink.count("order_created"), 1);
        assert_eq!(sink.count("order_cancelled"), 1);
    }
}
