//! Execution rules with intra-bar fill detection

use crate::config::MatchingConfig;
use crate::oms::types::{Fill, FillId, MarketSnapshot, Order, OrderType};
use crate::{Bar, Side};

/// Decides whether and at what price an order executes against a bar
#[derive(Debug, Clone)]
pub struct ExecutionEngine {
    commission_per_lot: f64,
    default_half_spread: f64,
}

impl ExecutionEngine {
    /// Create new execution engine
    pub fn new(commission_per_lot: f64, default_half_spread: f64) -> Self {
        Self {
            commission_per_lot,
            default_half_spread,
        }
    }

    pub fn from_config(config: &MatchingConfig) -> Self {
        Self::new(config.commission_per_lot, config.default_half_spread)
    }

    /// Quote of the bar; `close ± default_half_spread` when the bar carries none
    pub fn snapshot(&self, bar: &Bar) -> MarketSnapshot {
        let (bid, ask) = match (bar.bid, bar.ask) {
            (Some(bid), Some(ask)) => (bid, ask),
            _ => (
                bar.close - self.default_half_spread,
                bar.close + self.default_half_spread,
            ),
        };
        MarketSnapshot {
            bid,
            ask,
            volume: bar.volume,
        }
    }

    /// Opposing touch: ask for buys, bid for sells
    pub fn market_price(&self, side: Side, bar: &Bar) -> f64 {
        let quote = self.snapshot(bar);
        match side {
            Side::Buy => quote.ask,
            Side::Sell => quote.bid,
        }
    }

    /// Latch the stop condition of stop / stop-limit orders.
    /// Returns true only on the bar that triggers the order.
    pub fn update_trigger(&self, order: &mut Order, bar: &Bar) -> bool {
        if order.triggered || !matches!(order.order_type, OrderType::Stop | OrderType::StopLimit) {
            return false;
        }
        let Some(stop_price) = order.stop_price else {
            return false;
        };
        let hit = match order.side {
            Side::Buy => bar.high >= stop_price,
            Side::Sell => bar.low <= stop_price,
        };
        order.triggered = hit;
        hit
    }

    /// Price at which the order can execute on this bar, if any
    pub fn check_fill(&self, order: &Order, bar: &Bar) -> Option<f64> {
        match order.order_type {
            OrderType::Market => Some(self.market_price(order.side, bar)),

            OrderType::Limit => limit_touched(order, bar),

            // Triggered stops become market orders
            OrderType::Stop if order.triggered => Some(self.market_price(order.side, bar)),

            // Triggered stop-limits rest as limit orders
            OrderType::StopLimit if order.triggered => limit_touched(order, bar),

            OrderType::Stop | OrderType::StopLimit => None,
        }
    }

    /// Execute up to `max_fill_qty` of the order at `fill_price`
    pub fn execute_partial_fill(
        &self,
        order: &mut Order,
        fill_id: FillId,
        fill_price: f64,
        max_fill_qty: f64,
        bar: &Bar,
    ) -> Fill {
        let fill_qty = f64::min(order.remaining_quantity, max_fill_qty);

        let fill = Fill {
            id: fill_id,
            order_id: order.id,
            timestamp: bar.time,
            price: fill_price,
            volume: fill_qty,
            commission: fill_qty * self.commission_per_lot,
            market: self.snapshot(bar),
        };

        order.apply_fill(fill.clone());
        fill
    }
}

impl Default for ExecutionEngine {
    fn default() -> Self {
        Self::from_config(&MatchingConfig::default())
    }
}

// Buy limit: fills if bar low ≤ limit price
// Sell limit: fills if bar high ≥ limit price
fn limit_touched(order: &Order, bar: &Bar) -> Option<f64> {
    let limit_price = order.limit_price?;
    let touched = match order.side {
        Side::Buy => bar.low <= limit_price,
        Side::Sell => bar.high >= limit_price,
    };
    touched.then_some(limit_price)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::oms::types::OrderStatus;
    use crate::oms::OrderRequest;
    use crate::Symbol;
    use chrono::{TimeZone, Utc};

    fn create_bar(open: f64, high: f64, low: f64, close: f64) -> Bar {
        let time = Utc.with_ymd_and_hms(2024, 3, 4, 10, 0, 0).unwrap();
        Bar::new_unchecked(time, open, high, low, close, 1000.0)
    }

    fn order(request: OrderRequest) -> Order {
        let bar = create_bar(1.1, 1.1, 1.1, 1.1);
        Order::from_request(&request, bar.time)
    }

    fn eurusd() -> Symbol {
        Symbol::new("EURUSD")
    }

    #[test]
    fn test_buy_limit_fill() {
        let engine = ExecutionEngine::default();
        let order = order(OrderRequest::limit_buy(eurusd(), 1.0, 1.0950));

        // Bar touches limit price
        let bar = create_bar(1.0980, 1.0990, 1.0945, 1.0960);
        assert_eq!(engine.check_fill(&order, &bar), Some(1.0950));

        // Bar doesn't reach limit price
        let bar = create_bar(1.0980, 1.0990, 1.0955, 1.0960);
        assert_eq!(engine.check_fill(&order, &bar), None);
    }

    #[test]
    fn test_sell_limit_fill() {
        let engine = ExecutionEngine::default();
        let order = order(OrderRequest::limit_sell(eurusd(), 1.0, 1.1050));

        let bar = create_bar(1.1000, 1.1060, 1.0990, 1.1040);
        assert_eq!(engine.check_fill(&order, &bar), Some(1.1050));
    }

    #[test]
    fn test_market_uses_quote_or_half_spread() {
        let engine = ExecutionEngine::new(7.0, 0.0001);
        let bar = create_bar(1.1000, 1.1010, 1.0990, 1.1000);
        assert!((engine.market_price(Side::Buy, &bar) - 1.1001).abs() < 1e-12);
        assert!((engine.market_price(Side::Sell, &bar) - 1.0999).abs() < 1e-12);

        let quoted = bar.with_quote(1.0998, 1.1003);
        assert_eq!(engine.market_price(Side::Buy, &quoted), 1.1003);
        assert_eq!(engine.market_price(Side::Sell, &quoted), 1.0998);
    }

    #[test]
    fn test_buy_stop_triggers_then_fills() {
        let engine = ExecutionEngine::default();
        let mut order = order(OrderRequest::stop(eurusd(), Side::Buy, 1.0, 1.1020));

        let quiet = create_bar(1.1000, 1.1010, 1.0990, 1.1005);
        assert!(!engine.update_trigger(&mut order, &quiet));
        assert_eq!(engine.check_fill(&order, &quiet), None);

        let breakout = create_bar(1.1005, 1.1030, 1.1000, 1.1025);
        assert!(engine.update_trigger(&mut order, &breakout));
        assert!(order.triggered);
        assert!(engine.check_fill(&order, &breakout).is_some());

        // Stays triggered afterwards
        assert!(!engine.update_trigger(&mut order, &quiet));
        assert!(order.triggered);
    }

    #[test]
    fn test_stop_limit_waits_for_limit() {
        let engine = ExecutionEngine::default();
        let mut order = order(OrderRequest::stop_limit(
            eurusd(),
            Side::Sell,
            1.0,
            1.0980,
            1.0990,
        ));

        // Triggered (low ≤ stop) but high never returns to the limit
        let drop = create_bar(1.0985, 1.0986, 1.0970, 1.0975);
        engine.update_trigger(&mut order, &drop);
        assert!(order.triggered);
        assert_eq!(engine.check_fill(&order, &drop), None);

        let bounce = create_bar(1.0975, 1.0995, 1.0972, 1.0990);
        assert_eq!(engine.check_fill(&order, &bounce), Some(1.0990));
    }

    #[test]
    fn test_partial_fill_commission() {
        let engine = ExecutionEngine::new(7.0, 0.0);
        let mut order = order(OrderRequest::limit_buy(eurusd(), 10.0, 1.1));
        let bar = create_bar(1.1, 1.1, 1.1, 1.1);

        let fill = engine.execute_partial_fill(&mut order, 1, 1.1, 3.0, &bar);
        assert_eq!(fill.volume, 3.0);
        assert!((fill.commission - 21.0).abs() < 1e-12);
        assert_eq!(order.status, OrderStatus::PartiallyFilled);
        assert!((order.remaining_quantity - 7.0).abs() < 1e-12);
    }
}
