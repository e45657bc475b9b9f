//! Order requests issued by strategies and callers

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::oms::types::{OrderType, TimeInForce};
use crate::{Side, Symbol};

/// Order request from strategy
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OrderRequest {
    pub symbol: Symbol,
    pub side: Side,
    pub order_type: OrderType,
    /// Quantity in lots
    pub quantity: f64,
    pub limit_price: Option<f64>,
    pub stop_price: Option<f64>,
    pub time_in_force: TimeInForce,
    pub expires_at: Option<DateTime<Utc>>,
    pub stop_loss: Option<f64>,
    pub take_profit: Option<f64>,
    pub comment: String,
}

impl OrderRequest {
    fn new(symbol: Symbol, side: Side, order_type: OrderType, quantity: f64) -> Self {
        Self {
            symbol,
            side,
            order_type,
            quantity,
            limit_price: None,
            stop_price: None,
            time_in_force: TimeInForce::GTC,
            expires_at: None,
            stop_loss: None,
            take_profit: None,
            comment: String::new(),
        }
    }

    pub fn market(symbol: Symbol, side: Side, quantity: f64) -> Self {
        Self::new(symbol, side, OrderType::Market, quantity)
    }

    /// Create a market buy order
    pub fn market_buy(symbol: Symbol, quantity: f64) -> Self {
        Self::market(symbol, Side::Buy, quantity)
    }

    /// Create a market sell order
    pub fn market_sell(symbol: Symbol, quantity: f64) -> Self {
        Self::market(symbol, Side::Sell, quantity)
    }

    pub fn limit(symbol: Symbol, side: Side, quantity: f64, limit_price: f64) -> Self {
        let mut request = Self::new(symbol, side, OrderType::Limit, quantity);
        request.limit_price = Some(limit_price);
        request
    }

    /// Create a limit buy order
    pub fn limit_buy(symbol: Symbol, quantity: f64, limit_price: f64) -> Self {
        Self::limit(symbol, Side::Buy, quantity, limit_price)
    }

    /// Create a limit sell order
    pub fn limit_sell(symbol: Symbol, quantity: f64, limit_price: f64) -> Self {
        Self::limit(symbol, Side::Sell, quantity, limit_price)
    }

    pub fn stop(symbol: Symbol, side: Side, quantity: f64, stop_price: f64) -> Self {
        let mut request = Self::new(symbol, side, OrderType::Stop, quantity);
        request.stop_price = Some(stop_price);
        request
    }

    pub fn stop_limit(
        symbol: Symbol,
        side: Side,
        quantity: f64,
        stop_price: f64,
        limit_price: f64,
    ) -> Self {
        let mut request = Self::new(symbol, side, OrderType::StopLimit, quantity);
        request.stop_price = Some(stop_price);
        request.limit_price = Some(limit_price);
        request
    }

    pub fn with_time_in_force(mut self, time_in_force: TimeInForce) -> Self {
        self.time_in_force = time_in_force;
        self
    }

    pub fn with_expiry(mut self, expires_at: DateTime<Utc>) -> Self {
        self.expires_at = Some(expires_at);
        self
    }

    pub fn with_stop_loss(mut self, stop_loss: f64) -> Self {
        self.stop_loss = Some(stop_loss);
        self
    }

    pub fn with_take_profit(mut self, take_profit: f64) -> Self {
        self.take_profit = Some(take_profit);
        self
    }

    /// Attach optional stop-loss and take-profit levels
    pub fn with_brackets(mut self, stop_loss: Option<f64>, take_profit: Option<f64>) -> Self {
        self.stop_loss = stop_loss;
        self.take_profit = take_profit;
        self
    }

    pub fn with_comment(mut self, comment: impl Into<String>) -> Self {
        self.comment = comment.into();
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_builders() {
        let request = OrderRequest::stop_limit(Symbol::new("EURUSD"), Side::Sell, 0.5, 1.0980, 1.0975)
            .with_time_in_force(TimeInForce::DAY)
            .with_brackets(Some(1.1020), None)
            .with_comment("breakdown");

        assert_eq!(request.order_type, OrderType::StopLimit);
        assert_eq!(request.stop_price, Some(1.0980));
        assert_eq!(request.limit_price, Some(1.0975));
        assert_eq!(request.time_in_force, TimeInForce::DAY);
        assert_eq!(request.stop_loss, Some(1.1020));
        assert_eq!(request.take_profit, None);
        assert_eq!(request.comment, "breakdown");
    }
}
