//! Backtest command implementation

use anyhow::{Context, Result};
use tracing::{info, warn};

use tradesim::backtest::{BacktestResult, Backtester};
use tradesim::data;
use tradesim::strategies::SmaCrossover;

pub fn run(
    config_path: Option<String>,
    data_path: String,
    symbol_override: Option<String>,
    seed_override: Option<u64>,
    output: Option<String>,
) -> Result<()> {
    info!("Starting backtest");

    let mut config = super::load_config(config_path.as_deref())?;

    if let Some(symbol) = symbol_override {
        info!("Overriding symbol to: {}", symbol);
        config.backtest.symbol = symbol;
    }

    if let Some(seed) = seed_override {
        info!("Overriding seed to: {}", seed);
        config.backtest.seed = seed;
    }

    info!("Loading data from: {}", data_path);
    let bars = data::load_csv(&data_path)?;
    let validation = data::validate_bars(&bars);
    for warning in &validation.warnings {
        warn!("{}", warning);
    }
    if !validation.is_valid() {
        anyhow::bail!("Invalid bar data: {}", validation.errors.join("; "));
    }

    let strategy = SmaCrossover::new(config.strategy.clone())?;
    let symbol = config.backtest.symbol();
    let initial_balance = config.broker.initial_balance;

    let mut backtester = Backtester::new(config, Box::new(strategy));

    info!("Running backtest...");
    let result = backtester.run(&symbol, &bars)?;

    print_report(&result, initial_balance);

    if let Some(path) = output {
        let json = serde_json::to_string_pretty(&result).context("Failed to serialize result")?;
        std::fs::write(&path, json).context(format!("Failed to write {}", path))?;
        info!("Result written to: {}", path);
    }

    info!("Backtest completed successfully");

    Ok(())
}

fn print_report(result: &BacktestResult, initial_balance: f64) {
    let m = &result.metrics;

    println!("\n{}", "=".repeat(60));
    println!("BACKTEST RESULTS - {} ({})", result.symbol, result.strategy);
    println!("{}", "=".repeat(60));
    println!("Bars Processed:     {} ({} skipped)", result.bars_processed, result.bars_skipped);
    println!("Initial Balance:    {:.2}", initial_balance);
    println!("Final Balance:      {:.2}", result.final_account.balance.to_f64());
    println!("Net Profit:         {:.2}", m.net_profit);
    println!("Total Return:       {:.2}%", m.total_return_pct);
    println!("Sharpe Ratio:       {:.2}", m.sharpe_ratio);
    println!("Sortino Ratio:      {:.2}", m.sortino_ratio);
    println!("Calmar Ratio:       {:.2}", m.calmar_ratio);
    println!("Max Drawdown:       {:.2}%", m.max_drawdown_pct);
    println!("Win Rate:           {:.2}%", m.win_rate);
    println!("Profit Factor:      {:.2}", m.profit_factor);
    println!("Total Trades:       {}", m.total_trades);
    println!("Winning Trades:     {}", m.winning_trades);
    println!("Losing Trades:      {}", m.losing_trades);
    println!("Average Win:        {:.2}", m.average_win);
    println!("Average Loss:       {:.2}", m.average_loss);
    println!("Largest Win:        {:.2}", m.largest_win);
    println!("Largest Loss:       {:.2}", m.largest_loss);
    println!("Total Costs:        {:.2}", m.total_costs);
    println!("Rejected Signals:   {}", result.rejections.len());
    println!("{}", "=".repeat(60));
}
