//! Paper trading worker tests
//!
//! The worker runs on the test runtime with a short tick interval; tests poll
//! its status until the replayed feed has been consumed.

use std::time::Duration;

use chrono::{TimeZone, Utc};
use tokio::time::{sleep, timeout};

use tradesim::config::{BrokerConfig, PaperConfig};
use tradesim::oms::OrderRequest;
use tradesim::paper::{DataFeed, PaperError, PaperHandle, PaperTrader, ReplayFeed};
use tradesim::rng::FixedRandom;
use tradesim::{
    Bar, Config, ExitReason, RejectionReason, Signal, SimulationEngine, Strategy, SubmitOutcome,
    Symbol,
};

fn eurusd() -> Symbol {
    Symbol::new("EURUSD")
}

fn bars(closes: &[f64]) -> Vec<Bar> {
    let start = Utc.with_ymd_and_hms(2024, 3, 4, 8, 0, 0).unwrap();
    closes
        .iter()
        .enumerate()
        .map(|(i, &c)| {
            Bar::new(
                start + chrono::Duration::minutes(i as i64),
                c,
                c + 0.0005,
                c - 0.0005,
                c,
                1_000.0,
            )
            .unwrap()
        })
        .collect()
}

/// Buys once, on the first bar it sees
struct BuyFirstBar(bool);

impl Strategy for BuyFirstBar {
    fn name(&self) -> &'static str {
        "buy_first_bar"
    }

    fn analyze(&mut self, _history: &[Bar], _bar: &Bar) -> Option<Signal> {
        if std::mem::replace(&mut self.0, true) {
            None
        } else {
            Some(Signal::buy(0.2))
        }
    }
}

fn paper_config() -> PaperConfig {
    PaperConfig {
        symbols: vec!["EURUSD".to_string()],
        poll_interval_ms: 5,
        command_buffer: 16,
    }
}

fn engine() -> SimulationEngine {
    let config = Config {
        broker: BrokerConfig::frictionless(),
        ..Config::default()
    };
    SimulationEngine::new(&config, Box::new(FixedRandom::lowest()))
}

async fn wait_for_bars(handle: &PaperHandle, count: u64) {
    timeout(Duration::from_secs(5), async {
        loop {
            let status = handle.status().await.unwrap();
            if status.bars_processed >= count {
                return;
            }
            sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .expect("worker did not consume the feed in time");
}

#[tokio::test]
async fn test_worker_replays_feed_and_stops() {
    let feed = ReplayFeed::new().with_bars(eurusd(), bars(&[1.1000, 1.1010, 1.1020]));
    let handle = PaperTrader::new(engine(), feed, &paper_config()).spawn();

    wait_for_bars(&handle, 3).await;

    let summary = handle.stop().await.unwrap();
    assert_eq!(summary.status.bars_processed, 3);
    assert!(summary.status.ticks >= 3);
    assert!(summary.trades.is_empty());
    assert!(!handle.is_running() || handle.status().await.is_err());
}

#[tokio::test]
async fn test_orders_submitted_while_running() {
    let feed = ReplayFeed::new().with_bars(eurusd(), bars(&[1.1000, 1.1010, 1.1020, 1.1030]));
    let handle = PaperTrader::new(engine(), feed, &paper_config()).spawn();

    wait_for_bars(&handle, 1).await;

    let outcome = handle
        .submit_order(OrderRequest::market_buy(eurusd(), 0.1))
        .await
        .unwrap();
    let SubmitOutcome::Executed(execution) = outcome else {
        panic!("market order should execute immediately");
    };

    let account = handle.account().await.unwrap();
    assert_eq!(account.open_positions, 1);

    let trade = handle.close_position(execution.position_id).await.unwrap();
    assert_eq!(trade.exit_reason, ExitReason::Manual);

    // A second close finds nothing to close
    let err = handle.close_position(execution.position_id).await.unwrap_err();
    assert!(matches!(err, PaperError::Broker(_)));

    let summary = handle.stop().await.unwrap();
    assert_eq!(summary.trades.len(), 1);
    assert_eq!(summary.metrics.total_trades, 1);
}

#[tokio::test]
async fn test_rejections_are_returned_to_the_caller() {
    let feed = ReplayFeed::new().with_bars(eurusd(), bars(&[1.1000]));
    let handle = PaperTrader::new(engine(), feed, &paper_config()).spawn();

    wait_for_bars(&handle, 1).await;

    let err = handle
        .submit_order(OrderRequest::market_buy(eurusd(), 1_000.0))
        .await
        .unwrap_err();
    assert!(matches!(
        err,
        PaperError::Rejected(RejectionReason::InvalidLotSize { .. })
    ));

    let err = handle
        .submit_order(OrderRequest::market_buy(Symbol::new("GBPUSD"), 0.1))
        .await
        .unwrap_err();
    assert!(matches!(
        err,
        PaperError::Rejected(RejectionReason::NoMarketData(_))
    ));

    handle.stop().await.unwrap();
}

#[tokio::test]
async fn test_pending_order_cancelled_through_handle() {
    let feed = ReplayFeed::new().with_bars(eurusd(), bars(&[1.1000]));
    let handle = PaperTrader::new(engine(), feed, &paper_config()).spawn();

    wait_for_bars(&handle, 1).await;

    let id = handle
        .submit_order(OrderRequest::limit_buy(eurusd(), 0.1, 1.0500))
        .await
        .unwrap()
        .order_id();
    assert_eq!(handle.status().await.unwrap().pending_orders, 1);

    assert!(handle.cancel_order(id).await.unwrap());
    assert!(!handle.cancel_order(id).await.unwrap());
    assert_eq!(handle.status().await.unwrap().pending_orders, 0);

    handle.stop().await.unwrap();
}

#[tokio::test]
async fn test_stop_closes_open_positions() {
    let feed = ReplayFeed::new().with_bars(eurusd(), bars(&[1.1000, 1.1005]));
    let handle = PaperTrader::new(engine(), feed, &paper_config())
        .with_strategy(eurusd(), Box::new(BuyFirstBar(false)))
        .spawn();

    wait_for_bars(&handle, 2).await;
    assert_eq!(handle.account().await.unwrap().open_positions, 1);

    let summary = handle.stop().await.unwrap();
    assert_eq!(summary.trades.len(), 1);
    assert_eq!(summary.trades[0].exit_reason, ExitReason::Shutdown);
    assert_eq!(summary.final_account.open_positions, 0);
}

#[tokio::test]
async fn test_feed_errors_do_not_stop_the_worker() {
    struct FlakyFeed {
        polls: usize,
        inner: ReplayFeed,
    }

    impl DataFeed for FlakyFeed {
        fn poll_bar(&mut self, symbol: &Symbol) -> anyhow::Result<Option<Bar>> {
            self.polls += 1;
            if self.polls % 2 == 1 {
                anyhow::bail!("connection reset");
            }
            self.inner.poll_bar(symbol)
        }
    }

    let feed = FlakyFeed {
        polls: 0,
        inner: ReplayFeed::new().with_bars(eurusd(), bars(&[1.1000, 1.1010])),
    };
    let handle = PaperTrader::new(engine(), feed, &paper_config()).spawn();

    wait_for_bars(&handle, 2).await;

    let summary = handle.stop().await.unwrap();
    assert_eq!(summary.status.bars_processed, 2);
    assert!(summary.status.feed_errors >= 2);
}

#[tokio::test]
async fn test_each_symbol_runs_its_own_strategy() {
    let gbpusd = Symbol::new("GBPUSD");
    let config = PaperConfig {
        symbols: vec!["EURUSD".to_string(), "GBPUSD".to_string()],
        ..paper_config()
    };
    // Both symbols print bars at the same timestamps
    let feed = ReplayFeed::new()
        .with_bars(eurusd(), bars(&[1.1000, 1.1005]))
        .with_bars(gbpusd.clone(), bars(&[1.2700, 1.2705]));
    let handle = PaperTrader::new(engine(), feed, &config)
        .with_strategy(eurusd(), Box::new(BuyFirstBar(false)))
        .with_strategy(gbpusd, Box::new(BuyFirstBar(false)))
        .spawn();

    wait_for_bars(&handle, 4).await;
    assert_eq!(handle.account().await.unwrap().open_positions, 2);

    let summary = handle.stop().await.unwrap();
    assert_eq!(summary.trades.len(), 2);
    assert!(summary
        .trades
        .iter()
        .all(|t| t.exit_reason == ExitReason::Shutdown));
}
