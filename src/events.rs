//! Engine event stream
//!
//! The matching engine, broker and simulation engine report every state change
//! as an [`EngineEvent`] to a per-instance [`EventSink`]. Sinks are observers:
//! they receive shared references and cannot reach back into the engine.

use serde::Serialize;
use std::io::Write;
use std::sync::{Arc, Mutex};
use tracing::{debug, warn};

use crate::broker::{AccountState, Position};
use crate::oms::{Fill, Order};
use crate::{Symbol, Trade};

/// Flat, serializable record of one engine state change
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum EngineEvent {
    OrderCreated(Order),
    OrderRejected(Order),
    OrderCancelled(Order),
    Fill { symbol: Symbol, fill: Fill },
    PositionOpened(Position),
    PositionUpdated(Position),
    PositionClosed(Position),
    Trade(Trade),
    AccountSnapshot(AccountState),
}

impl EngineEvent {
    pub fn kind(&self) -> &'static str {
        match self {
            EngineEvent::OrderCreated(_) => "order_created",
            EngineEvent::OrderRejected(_) => "order_rejected",
            EngineEvent::OrderCancelled(_) => "order_cancelled",
            EngineEvent::Fill { .. } => "fill",
            EngineEvent::PositionOpened(_) => "position_opened",
            EngineEvent::PositionUpdated(_) => "position_updated",
            EngineEvent::PositionClosed(_) => "position_closed",
            EngineEvent::Trade(_) => "trade",
            EngineEvent::AccountSnapshot(_) => "account_snapshot",
        }
    }
}

/// Receiver of engine events
pub trait EventSink: Send + Sync {
    fn emit(&self, event: &EngineEvent);
}

pub type SharedSink = Arc<dyn EventSink>;

/// Discards everything
#[derive(Debug, Default, Clone, Copy)]
pub struct NullSink;

impl EventSink for NullSink {
    fn emit(&self, _event: &EngineEvent) {}
}

/// Logs every event at debug level
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingSink;

impl EventSink for TracingSink {
    fn emit(&self, event: &EngineEvent) {
        match event {
            EngineEvent::Fill { symbol, fill } => debug!(
                event = "fill",
                symbol = %symbol,
                order_id = fill.order_id,
                price = fill.price,
                volume = fill.volume,
            ),
            EngineEvent::Trade(trade) => debug!(
                event = "trade",
                position_id = trade.position_id,
                net_pnl = %trade.net_pnl,
                exit_reason = %trade.exit_reason,
            ),
            EngineEvent::AccountSnapshot(account) => debug!(
                event = "account_snapshot",
                balance = %account.balance,
                equity = %account.equity,
                margin_level = account.margin_level,
            ),
            other => debug!(event = other.kind(), "{:?}", other),
        }
    }
}

/// Keeps every event in memory
#[derive(Debug, Default)]
pub struct CollectingSink {
    events: Mutex<Vec<EngineEvent>>,
}

impl CollectingSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn events(&self) -> Vec<EngineEvent> {
        self.events
            .lock()
            .map(|events| events.clone())
            .unwrap_or_default()
    }

    /// Number of collected events of the given kind
    pub fn count(&self, kind: &str) -> usize {
        self.events
            .lock()
            .map(|events| events.iter().filter(|e| e.kind() == kind).count())
            .unwrap_or(0)
    }
}

impl EventSink for CollectingSink {
    fn emit(&self, event: &EngineEvent) {
        if let Ok(mut events) = self.events.lock() {
            events.push(event.clone());
        }
    }
}

/// Writes one JSON object per line
pub struct JsonLinesSink<W: Write + Send> {
    writer: Mutex<W>,
}

impl<W: Write + Send> JsonLinesSink<W> {
    pub fn new(writer: W) -> Self {
        Self {
            writer: Mutex::new(writer),
        }
    }

    pub fn into_inner(self) -> W {
        match self.writer.into_inner() {
            Ok(writer) => writer,
            Err(poisoned) => poisoned.into_inner(),
        }
    }
}

impl<W: Write + Send> EventSink for JsonLinesSink<W> {
    fn emit(&self, event: &EngineEvent) {
        let Ok(mut writer) = self.writer.lock() else {
            return;
        };
        let result = serde_json::to_writer(&mut *writer, event)
            .map_err(std::io::Error::from)
            .and_then(|_| writer.write_all(b"\n"));
        if let Err(e) = result {
            warn!("Failed to write {} event: {}", event.kind(), e);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::oms::MarketSnapshot;
    use chrono::{TimeZone, Utc};

    fn fill_event() -> EngineEvent {
        EngineEvent::Fill {
            symbol: Symbol::new("EURUSD"),
            fill: Fill {
                id: 1,
                order_id: 7,
                timestamp: Utc.with_ymd_and_hms(2024, 3, 4, 10, 0, 0).unwrap(),
                price: 1.1,
                volume: 0.5,
                commission: 3.5,
                market: MarketSnapshot {
                    bid: 1.0999,
                    ask: 1.1,
                    volume: 250.0,
                },
            },
        }
    }

    #[test]
    fn test_collecting_sink() {
        let sink = CollectingSink::new();
        sink.emit(&fill_event());
        sink.emit(&fill_event());
        assert_eq!(sink.events().len(), 2);
        assert_eq!(sink.count("fill"), 2);
        assert_eq!(sink.count("trade"), 0);
    }

    #[test]
    fn test_json_lines_sink() {
        let sink = JsonLinesSink::new(Vec::new());
        sink.emit(&fill_event());
        let output = String::from_utf8(sink.into_inner()).unwrap();

        let lines: Vec<&str> = output.lines().collect();
        assert_eq!(lines.len(), 1);
        let value: serde_json::Value = serde_json::from_str(lines[0]).unwrap();
        assert_eq!(value["event"], "fill");
        assert_eq!(value["symbol"], "EURUSD");
        assert_eq!(value["fill"]["order_id"], 7);
    }
}
