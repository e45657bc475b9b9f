//! Configuration management
//!
//! Loads the simulator configuration from a JSON file. Every field has a
//! default, so a config file only needs to list what it overrides. A few
//! values can also be overridden from the environment (`TRADESIM_SEED`,
//! `TRADESIM_INITIAL_BALANCE`).

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fs;
use std::path::Path;
use thiserror::Error;

use crate::strategies::SmaCrossoverConfig;
use crate::Symbol;

/// Configuration consistency errors
#[derive(Debug, Error, PartialEq)]
pub enum ConfigError {
    #[error("{field}: min ({min}) must be <= max ({max})")]
    InvalidRange {
        field: &'static str,
        min: f64,
        max: f64,
    },

    #[error("{0} must be positive")]
    NonPositive(&'static str),

    #[error("{field} must be a probability in [0, 1], got {value}")]
    InvalidProbability { field: &'static str, value: f64 },
}

/// Main configuration structure
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub broker: BrokerConfig,
    pub matching: MatchingConfig,
    pub analyzer: AnalyzerConfig,
    pub backtest: BacktestConfig,
    pub paper: PaperConfig,
    /// Parameters of the reference strategy run by the binary
    pub strategy: SmaCrossoverConfig,
}

impl Config {
    /// Load configuration from JSON file
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let contents = fs::read_to_string(path.as_ref()).context("Failed to read config file")?;
        let mut config: Config =
            serde_json::from_str(&contents).context("Failed to parse config JSON")?;

        config.apply_env_overrides()?;
        config.validate().context("Invalid configuration")?;
        Ok(config)
    }

    /// Apply `TRADESIM_*` environment overrides
    pub fn apply_env_overrides(&mut self) -> Result<()> {
        if let Ok(seed) = std::env::var("TRADESIM_SEED") {
            self.backtest.seed = seed
                .parse()
                .context(format!("TRADESIM_SEED is not an integer: {}", seed))?;
        }
        if let Ok(balance) = std::env::var("TRADESIM_INITIAL_BALANCE") {
            self.broker.initial_balance = balance
                .parse()
                .context(format!("TRADESIM_INITIAL_BALANCE is not a number: {}", balance))?;
        }
        Ok(())
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        self.broker.validate()?;
        if self.matching.commission_per_lot < 0.0 {
            return Err(ConfigError::NonPositive("matching.commission_per_lot"));
        }
        if self.analyzer.periods_per_year <= 0.0 {
            return Err(ConfigError::NonPositive("analyzer.periods_per_year"));
        }
        if self.paper.poll_interval_ms == 0 {
            return Err(ConfigError::NonPositive("paper.poll_interval_ms"));
        }
        if self.paper.command_buffer == 0 {
            return Err(ConfigError::NonPositive("paper.command_buffer"));
        }
        Ok(())
    }
}

/// How profit is computed for the traded instrument
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PnlMode {
    /// `pips × pip_value_per_lot × lots` (FX pairs)
    PipQuoted,
    /// `(exit − entry) × direction × lots × contract_size` (crypto, CFDs)
    PriceDifference,
}

/// Contract specification of the simulated instrument
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct InstrumentSpec {
    /// Price increment of one pip (0.0001 for most pairs, 0.01 for yen pairs)
    pub pip_size: f64,
    /// Account-currency value of one pip for one lot
    pub pip_value_per_lot: f64,
    /// Units of base currency per lot
    pub contract_size: f64,
    pub pnl_mode: PnlMode,
}

impl Default for InstrumentSpec {
    fn default() -> Self {
        Self {
            pip_size: 0.0001,
            pip_value_per_lot: 10.0,
            contract_size: 100_000.0,
            pnl_mode: PnlMode::PipQuoted,
        }
    }
}

impl InstrumentSpec {
    /// Spot crypto style instrument: P&L is the raw price difference
    pub fn price_difference(contract_size: f64, pip_size: f64) -> Self {
        Self {
            pip_size,
            pip_value_per_lot: contract_size * pip_size,
            contract_size,
            pnl_mode: PnlMode::PriceDifference,
        }
    }

    pub fn pips_to_price(&self, pips: f64) -> f64 {
        pips * self.pip_size
    }

    pub fn price_to_pips(&self, price_delta: f64) -> f64 {
        if self.pip_size > 0.0 {
            price_delta / self.pip_size
        } else {
            0.0
        }
    }

    /// Account-currency value of a price move of `price_delta` on `lots`
    pub fn value_of(&self, price_delta: f64, lots: f64) -> f64 {
        match self.pnl_mode {
            PnlMode::PipQuoted => self.price_to_pips(price_delta) * self.pip_value_per_lot * lots,
            PnlMode::PriceDifference => price_delta * lots * self.contract_size,
        }
    }
}

/// Which protective level wins when one bar touches both stop-loss and
/// take-profit
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExitPriority {
    /// Assume the adverse level was touched first
    #[default]
    StopLossFirst,
    TakeProfitFirst,
}

/// Broker cost, risk and execution model
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BrokerConfig {
    pub initial_balance: f64,
    pub leverage: f64,
    /// Instrument used for symbols without an entry in `instruments`
    pub instrument: InstrumentSpec,
    /// Per-symbol instruments, keyed by symbol name
    pub instruments: HashMap<String, InstrumentSpec>,

    pub base_spread_pips: f64,
    pub max_spread_pips: f64,
    /// Spread multiplier applied when bar volume is below `low_liquidity_volume`
    pub low_liquidity_spread_multiplier: f64,

    pub commission_per_lot: f64,

    pub min_slippage_pips: f64,
    pub max_slippage_pips: f64,
    /// Fills deviating further than this from the requested price are rejected
    pub max_allowed_slippage_pips: f64,
    /// Scale of the slippage range used for stop-loss exits
    pub stop_slippage_multiplier: f64,
    /// Scale of the slippage range used for take-profit exits
    pub target_slippage_multiplier: f64,

    /// Account-currency cost per lot per day held (negative = credit)
    pub swap_long: f64,
    pub swap_short: f64,

    pub rejection_probability: f64,
    pub low_liquidity_rejection_probability: f64,
    pub low_liquidity_volume: f64,
    pub min_bar_volume: f64,

    pub min_lot_size: f64,
    pub max_lot_size: f64,
    pub max_open_positions: usize,
    /// Cap on total notional exposure across open positions
    pub max_total_exposure: f64,

    /// Margin level (%) that triggers a margin-call warning
    pub margin_call_level: f64,
    /// Margin level (%) that triggers a stop-out warning
    pub stop_out_level: f64,

    pub weekend_trading: bool,
    pub exit_priority: ExitPriority,
}

impl Default for BrokerConfig {
    fn default() -> Self {
        Self {
            initial_balance: 10_000.0,
            leverage: 100.0,
            instrument: InstrumentSpec::default(),
            instruments: HashMap::new(),
            base_spread_pips: 1.5,
            max_spread_pips: 5.0,
            low_liquidity_spread_multiplier: 2.0,
            commission_per_lot: 7.0,
            min_slippage_pips: 0.0,
            max_slippage_pips: 0.5,
            max_allowed_slippage_pips: 3.0,
            stop_slippage_multiplier: 2.0,
            target_slippage_multiplier: 0.5,
            swap_long: 0.5,
            swap_short: 0.3,
            rejection_probability: 0.01,
            low_liquidity_rejection_probability: 0.05,
            low_liquidity_volume: 100.0,
            min_bar_volume: 0.0,
            min_lot_size: 0.01,
            max_lot_size: 100.0,
            max_open_positions: 10,
            max_total_exposure: 5_000_000.0,
            margin_call_level: 100.0,
            stop_out_level: 50.0,
            weekend_trading: false,
            exit_priority: ExitPriority::StopLossFirst,
        }
    }
}

impl BrokerConfig {
    /// A broker with no spread, commission, swap, slippage or random rejections
    pub fn frictionless() -> Self {
        Self {
            base_spread_pips: 0.0,
            max_spread_pips: 0.0,
            commission_per_lot: 0.0,
            min_slippage_pips: 0.0,
            max_slippage_pips: 0.0,
            swap_long: 0.0,
            swap_short: 0.0,
            rejection_probability: 0.0,
            low_liquidity_rejection_probability: 0.0,
            weekend_trading: true,
            ..Self::default()
        }
    }

    pub fn with_initial_balance(mut self, balance: f64) -> Self {
        self.initial_balance = balance;
        self
    }

    pub fn with_leverage(mut self, leverage: f64) -> Self {
        self.leverage = leverage;
        self
    }

    pub fn with_instrument(mut self, instrument: InstrumentSpec) -> Self {
        self.instrument = instrument;
        self
    }

    pub fn with_symbol_instrument(
        mut self,
        symbol: impl Into<String>,
        instrument: InstrumentSpec,
    ) -> Self {
        self.instruments.insert(symbol.into(), instrument);
        self
    }

    /// Contract specification used to value positions in `symbol`
    pub fn instrument_for(&self, symbol: &Symbol) -> &InstrumentSpec {
        self.instruments
            .get(symbol.as_str())
            .unwrap_or(&self.instrument)
    }

    /// Set base and maximum spread in pips
    pub fn with_spread(mut self, base_pips: f64, max_pips: f64) -> Self {
        self.base_spread_pips = base_pips;
        self.max_spread_pips = max_pips;
        self
    }

    pub fn with_commission(mut self, per_lot: f64) -> Self {
        self.commission_per_lot = per_lot;
        self
    }

    /// Set the slippage draw range and the post-hoc rejection limit, in pips
    pub fn with_slippage(mut self, min_pips: f64, max_pips: f64, max_allowed_pips: f64) -> Self {
        self.min_slippage_pips = min_pips;
        self.max_slippage_pips = max_pips;
        self.max_allowed_slippage_pips = max_allowed_pips;
        self
    }

    pub fn with_swap(mut self, long: f64, short: f64) -> Self {
        self.swap_long = long;
        self.swap_short = short;
        self
    }

    pub fn with_rejection_probabilities(mut self, normal: f64, low_liquidity: f64) -> Self {
        self.rejection_probability = normal;
        self.low_liquidity_rejection_probability = low_liquidity;
        self
    }

    pub fn with_liquidity(mut self, low_liquidity_volume: f64, min_bar_volume: f64) -> Self {
        self.low_liquidity_volume = low_liquidity_volume;
        self.min_bar_volume = min_bar_volume;
        self
    }

    pub fn with_lot_limits(mut self, min: f64, max: f64) -> Self {
        self.min_lot_size = min;
        self.max_lot_size = max;
        self
    }

    pub fn with_max_open_positions(mut self, max: usize) -> Self {
        self.max_open_positions = max;
        self
    }

    pub fn with_max_total_exposure(mut self, cap: f64) -> Self {
        self.max_total_exposure = cap;
        self
    }

    pub fn with_weekend_trading(mut self, enabled: bool) -> Self {
        self.weekend_trading = enabled;
        self
    }

    pub fn with_exit_priority(mut self, priority: ExitPriority) -> Self {
        self.exit_priority = priority;
        self
    }

    /// Swap rate for a position direction
    pub fn swap_rate(&self, side: crate::Side) -> f64 {
        match side {
            crate::Side::Buy => self.swap_long,
            crate::Side::Sell => self.swap_short,
        }
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.initial_balance <= 0.0 {
            return Err(ConfigError::NonPositive("broker.initial_balance"));
        }
        if self.leverage <= 0.0 {
            return Err(ConfigError::NonPositive("broker.leverage"));
        }
        if self.instrument.pip_size <= 0.0 {
            return Err(ConfigError::NonPositive("broker.instrument.pip_size"));
        }
        if self.instrument.contract_size <= 0.0 {
            return Err(ConfigError::NonPositive("broker.instrument.contract_size"));
        }
        for instrument in self.instruments.values() {
            if instrument.pip_size <= 0.0 {
                return Err(ConfigError::NonPositive("broker.instruments.pip_size"));
            }
            if instrument.contract_size <= 0.0 {
                return Err(ConfigError::NonPositive("broker.instruments.contract_size"));
            }
        }
        check_range("broker.spread_pips", self.base_spread_pips, self.max_spread_pips)?;
        check_range("broker.slippage_pips", self.min_slippage_pips, self.max_slippage_pips)?;
        check_range("broker.lot_size", self.min_lot_size, self.max_lot_size)?;
        check_probability("broker.rejection_probability", self.rejection_probability)?;
        check_probability(
            "broker.low_liquidity_rejection_probability",
            self.low_liquidity_rejection_probability,
        )?;
        Ok(())
    }
}

fn check_range(field: &'static str, min: f64, max: f64) -> Result<(), ConfigError> {
    if min > max {
        return Err(ConfigError::InvalidRange { field, min, max });
    }
    Ok(())
}

fn check_probability(field: &'static str, value: f64) -> Result<(), ConfigError> {
    if !(0.0..=1.0).contains(&value) {
        return Err(ConfigError::InvalidProbability { field, value });
    }
    Ok(())
}

/// Pending-order matching parameters
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct MatchingConfig {
    pub commission_per_lot: f64,
    /// Half-spread (price units) assumed when a bar carries no bid/ask
    pub default_half_spread: f64,
}

impl Default for MatchingConfig {
    fn default() -> Self {
        Self {
            commission_per_lot: 7.0,
            default_half_spread: 0.00005,
        }
    }
}

/// Performance analytics parameters
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AnalyzerConfig {
    /// Annual risk-free rate used for Sharpe / Sortino
    pub risk_free_rate: f64,
    /// Equity snapshots per year (252 for daily bars)
    pub periods_per_year: f64,
    /// |net P&L| at or below this is counted as breakeven
    pub breakeven_tolerance: f64,
}

impl Default for AnalyzerConfig {
    fn default() -> Self {
        Self {
            risk_free_rate: 0.02,
            periods_per_year: 252.0,
            breakeven_tolerance: 0.0,
        }
    }
}

/// Backtest run parameters
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BacktestConfig {
    pub symbol: String,
    /// Seed of the broker's random source
    pub seed: u64,
}

impl Default for BacktestConfig {
    fn default() -> Self {
        Self {
            symbol: "EURUSD".to_string(),
            seed: 42,
        }
    }
}

impl BacktestConfig {
    pub fn symbol(&self) -> Symbol {
        Symbol::new(&self.symbol)
    }
}

/// Paper trading worker parameters
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PaperConfig {
    pub symbols: Vec<String>,
    pub poll_interval_ms: u64,
    /// Capacity of the worker's command queue
    pub command_buffer: usize,
}

impl Default for PaperConfig {
    fn default() -> Self {
        Self {
            symbols: vec!["EURUSD".to_string()],
            poll_interval_ms: 1_000,
            command_buffer: 64,
        }
    }
}

impl PaperConfig {
    pub fn symbols(&self) -> Vec<Symbol> {
        self.symbols.iter().map(Symbol::new).collect()
    }
}
