//! Paper trading command implementation

use anyhow::{Context, Result};
use std::time::Duration;
use tokio::time::sleep;
use tracing::{error, info};

use tradesim::data;
use tradesim::paper::{PaperSummary, PaperTrader, ReplayFeed};
use tradesim::rng::SeededRandom;
use tradesim::strategies::SmaCrossover;
use tradesim::SimulationEngine;

pub fn run(
    config_path: Option<String>,
    data_path: String,
    symbol_override: Option<String>,
    interval_override: Option<u64>,
    bar_limit: Option<usize>,
) -> Result<()> {
    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .context("Failed to build tokio runtime")?;

    runtime.block_on(run_async(
        config_path,
        data_path,
        symbol_override,
        interval_override,
        bar_limit,
    ))
}

async fn run_async(
    config_path: Option<String>,
    data_path: String,
    symbol_override: Option<String>,
    interval_override: Option<u64>,
    bar_limit: Option<usize>,
) -> Result<()> {
    let mut config = super::load_config(config_path.as_deref())?;

    if let Some(symbol) = symbol_override {
        config.paper.symbols = vec![symbol];
    }
    if let Some(interval_ms) = interval_override {
        config.paper.poll_interval_ms = interval_ms;
    }

    let symbol = config
        .paper
        .symbols()
        .into_iter()
        .next()
        .context("No paper trading symbol configured")?;

    let mut bars = data::load_csv(&data_path)?;
    if let Some(limit) = bar_limit {
        bars.truncate(limit);
    }
    let total_bars = bars.len();

    info!("Symbol: {}", symbol);
    info!("Bars to replay: {}", total_bars);
    info!("Tick interval: {}ms", config.paper.poll_interval_ms);
    info!("Initial balance: {:.2}", config.broker.initial_balance);

    let strategy = SmaCrossover::new(config.strategy.clone())?;
    let engine = SimulationEngine::new(&config, Box::new(SeededRandom::new(config.backtest.seed)));
    let feed = ReplayFeed::new().with_bars(symbol.clone(), bars);

    let handle = PaperTrader::new(engine, feed, &config.paper)
        .with_strategy(symbol.clone(), Box::new(strategy))
        .spawn();

    let poll = Duration::from_millis(config.paper.poll_interval_ms.max(50));

    info!("Starting paper trading loop...");

    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                info!("Received Ctrl+C, initiating shutdown...");
                break;
            }
            _ = sleep(poll) => {
                match handle.status().await {
                    Ok(status) if status.ticks as usize >= total_bars => {
                        info!("Feed exhausted after {} ticks", status.ticks);
                        break;
                    }
                    Ok(_) => {}
                    Err(e) => {
                        error!("Paper trading worker error: {}", e);
                        break;
                    }
                }
            }
        }
    }

    let summary = handle.stop().await?;
    print_summary(&summary);

    info!("Paper trading session ended.");
    Ok(())
}

fn print_summary(summary: &PaperSummary) {
    let m = &summary.metrics;

    println!("\n{}", "=".repeat(60));
    println!("PAPER TRADING SUMMARY");
    println!("{}", "=".repeat(60));
    println!("Ticks:              {}", summary.status.ticks);
    println!("Bars Processed:     {}", summary.status.bars_processed);
    println!("Feed Errors:        {}", summary.status.feed_errors);
    println!("Final Balance:      {:.2}", summary.final_account.balance.to_f64());
    println!("Net Profit:         {:.2}", m.net_profit);
    println!("Total Trades:       {}", m.total_trades);
    println!("Win Rate:           {:.2}%", m.win_rate);
    println!("Max Drawdown:       {:.2}%", m.max_drawdown_pct);
    println!("{}", "=".repeat(60));
}
