//! Trading simulator - main entry point
//!
//! This binary provides two subcommands:
//! - backtest: Replay a CSV bar file through the simulator and a strategy
//! - paper: Run the paper trading worker against a replayed CSV feed

use anyhow::Result;
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use tracing::info;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter, Layer};

mod commands;

#[derive(Parser, Debug)]
#[command(name = "tradesim")]
#[command(about = "Broker simulator for backtesting and paper trading", long_about = None)]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Verbose output
    #[arg(short, long, global = true)]
    verbose: bool,

    /// Emit console logs as JSON lines
    #[arg(long, global = true)]
    json_logs: bool,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Run a strategy backtest over a CSV bar file
    Backtest {
        /// Path to configuration file (defaults apply when omitted)
        #[arg(short, long)]
        config: Option<String>,

        /// CSV file with datetime,open,high,low,close,volume[,bid,ask]
        #[arg(short, long)]
        data: String,

        /// Symbol the bars belong to (overrides config file)
        #[arg(short, long)]
        symbol: Option<String>,

        /// Seed of the broker's random source (overrides config file)
        #[arg(long)]
        seed: Option<u64>,

        /// Write the full result (trades, equity curve, metrics) as JSON
        #[arg(short, long)]
        output: Option<String>,
    },

    /// Paper trade against a CSV file replayed one bar per tick
    Paper {
        /// Path to configuration file (defaults apply when omitted)
        #[arg(short, long)]
        config: Option<String>,

        /// CSV file replayed as the live feed
        #[arg(short, long)]
        data: String,

        /// Symbol the bars belong to (overrides config file)
        #[arg(short, long)]
        symbol: Option<String>,

        /// Tick interval in milliseconds (overrides config file)
        #[arg(long)]
        interval_ms: Option<u64>,

        /// Stop after this many bars (default: the whole file)
        #[arg(long)]
        bars: Option<usize>,
    },
}

fn setup_logging(verbose: bool, json: bool, command_name: &str) -> Result<()> {
    std::fs::create_dir_all("logs")?;

    // {command}_{date}.log
    let log_filename = format!(
        "{}_{}.log",
        command_name,
        chrono::Local::now().format("%Y-%m-%d_%H-%M-%S")
    );
    let log_path = PathBuf::from("logs").join(&log_filename);

    let level = if verbose { "debug" } else { "info" };
    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));

    let file_appender = tracing_appender::rolling::never("logs", &log_filename);

    let console_layer = if json {
        tracing_subscriber::fmt::layer()
            .json()
            .with_target(true)
            .with_current_span(false)
            .boxed()
    } else {
        tracing_subscriber::fmt::layer()
            .with_target(true)
            .with_thread_ids(false)
            .with_thread_names(false)
            .with_line_number(true)
            .with_file(true)
            .with_ansi(true)
            .boxed()
    };

    // Same format as the console, without ANSI colors
    let file_layer = tracing_subscriber::fmt::layer()
        .with_writer(file_appender)
        .with_target(true)
        .with_line_number(true)
        .with_file(true)
        .with_ansi(false);

    tracing_subscriber::registry()
        .with(env_filter)
        .with(console_layer)
        .with(file_layer)
        .init();

    info!("Logging initialized");
    info!("Log file: {}", log_path.display());

    Ok(())
}

fn main() -> Result<()> {
    dotenv::dotenv().ok();

    let cli = Cli::parse();

    let command_name = match &cli.command {
        Commands::Backtest { .. } => "backtest",
        Commands::Paper { .. } => "paper",
    };

    setup_logging(cli.verbose, cli.json_logs, command_name)?;

    match cli.command {
        Commands::Backtest {
            config,
            data,
            symbol,
            seed,
            output,
        } => commands::backtest::run(config, data, symbol, seed, output),

        Commands::Paper {
            config,
            data,
            symbol,
            interval_ms,
            bars,
        } => commands::paper::run(config, data, symbol, interval_ms, bars),
    }
}
