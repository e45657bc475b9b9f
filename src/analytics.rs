//! Performance analytics over closed trades and the equity curve

use chrono::{DateTime, Utc};
use itertools::Itertools;
use ordered_float::OrderedFloat;
use serde::{Deserialize, Serialize};
use statrs::statistics::{Data, OrderStatistics, Statistics};

use crate::config::AnalyzerConfig;
use crate::{Money, Trade};

/// One equity-curve sample, taken once per processed bar
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EquityPoint {
    pub time: DateTime<Utc>,
    pub balance: Money,
    pub equity: Money,
    pub open_positions: usize,
    pub margin_level: f64,
}

/// Performance report. Every field is zero when no trade was recorded.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Metrics {
    pub total_trades: usize,
    pub winning_trades: usize,
    pub losing_trades: usize,
    pub breakeven_trades: usize,
    pub win_rate: f64,
    pub loss_rate: f64,

    pub gross_profit: f64,
    pub gross_loss: f64,
    pub net_profit: f64,
    pub profit_factor: f64,
    pub average_win: f64,
    pub average_loss: f64,
    pub largest_win: f64,
    pub largest_loss: f64,
    pub expectancy: f64,

    pub max_consecutive_wins: usize,
    pub max_consecutive_losses: usize,
    /// Positive for a running win streak, negative for a losing one
    pub current_streak: i64,

    pub max_drawdown: f64,
    pub max_drawdown_pct: f64,
    pub max_drawdown_duration_bars: usize,
    pub max_drawdown_duration_days: f64,

    pub total_return: f64,
    pub total_return_pct: f64,
    pub sharpe_ratio: f64,
    pub sortino_ratio: f64,
    pub calmar_ratio: f64,
    pub recovery_factor: f64,
    /// Annualized standard deviation of per-period returns
    pub volatility: f64,
    /// 5th percentile of per-period returns
    pub value_at_risk_95: f64,

    pub total_commission: f64,
    pub total_swap: f64,
    pub total_spread: f64,
    pub total_slippage: f64,
    pub total_costs: f64,
    pub costs_pct_of_gross_profit: f64,

    pub total_pips: f64,
    pub average_pips: f64,
    pub average_trade_duration_hours: f64,
    pub trading_span_days: f64,
}

/// Collects trades and equity snapshots and turns them into [`Metrics`]
#[derive(Debug, Clone)]
pub struct PerformanceAnalyzer {
    config: AnalyzerConfig,
    initial_balance: f64,
    trades: Vec<Trade>,
    equity_curve: Vec<EquityPoint>,
}

#[derive(Debug, Clone, Copy, PartialEq)]
enum Outcome {
    Win,
    Loss,
    Breakeven,
}

impl PerformanceAnalyzer {
    pub fn new(initial_balance: f64, config: AnalyzerConfig) -> Self {
        Self {
            config,
            initial_balance,
            trades: Vec::new(),
            equity_curve: Vec::new(),
        }
    }

    pub fn add_trade(&mut self, trade: Trade) {
        self.trades.push(trade);
    }

    pub fn add_equity_point(
        &mut self,
        time: DateTime<Utc>,
        balance: Money,
        equity: Money,
        open_positions: usize,
        margin_level: f64,
    ) {
        self.equity_curve.push(EquityPoint {
            time,
            balance,
            equity,
            open_positions,
            margin_level,
        });
    }

    /// Closed trades in close order
    pub fn trades(&self) -> &[Trade] {
        &self.trades
    }

    pub fn equity_curve(&self) -> &[EquityPoint] {
        &self.equity_curve
    }

    fn outcome(&self, trade: &Trade) -> Outcome {
        let pnl = trade.net_pnl.to_f64();
        let tolerance = self.config.breakeven_tolerance;
        if pnl > tolerance {
            Outcome::Win
        } else if pnl < -tolerance {
            Outcome::Loss
        } else {
            Outcome::Breakeven
        }
    }

    pub fn calculate_metrics(&self) -> Metrics {
        if self.trades.is_empty() {
            return Metrics::default();
        }

        let mut metrics = Metrics {
            total_trades: self.trades.len(),
            ..Metrics::default()
        };
        let count = self.trades.len() as f64;

        // Win / loss statistics
        let outcomes: Vec<Outcome> = self.trades.iter().map(|t| self.outcome(t)).collect();
        let pnl = |t: &Trade| t.net_pnl.to_f64();

        let wins: Vec<f64> = self
            .trades
            .iter()
            .zip(&outcomes)
            .filter(|(_, o)| **o == Outcome::Win)
            .map(|(t, _)| pnl(t))
            .collect();
        let losses: Vec<f64> = self
            .trades
            .iter()
            .zip(&outcomes)
            .filter(|(_, o)| **o == Outcome::Loss)
            .map(|(t, _)| pnl(t))
            .collect();

        metrics.winning_trades = wins.len();
        metrics.losing_trades = losses.len();
        metrics.breakeven_trades = self.trades.len() - wins.len() - losses.len();
        metrics.win_rate = wins.len() as f64 / count * 100.0;
        metrics.loss_rate = losses.len() as f64 / count * 100.0;

        metrics.gross_profit = wins.iter().sum();
        metrics.gross_loss = losses.iter().map(|l| l.abs()).sum();
        let net_profit: Money = self.trades.iter().map(|t| t.net_pnl).sum();
        metrics.net_profit = net_profit.to_f64();
        metrics.profit_factor = if metrics.gross_loss > 0.0 {
            metrics.gross_profit / metrics.gross_loss
        } else {
            0.0
        };
        if !wins.is_empty() {
            metrics.average_win = metrics.gross_profit / wins.len() as f64;
        }
        if !losses.is_empty() {
            metrics.average_loss = metrics.gross_loss / losses.len() as f64;
        }
        metrics.largest_win = wins
            .iter()
            .map(|w| OrderedFloat(*w))
            .max()
            .map_or(0.0, |w| w.0);
        metrics.largest_loss = losses
            .iter()
            .map(|l| OrderedFloat(*l))
            .min()
            .map_or(0.0, |l| l.0);
        metrics.expectancy = metrics.net_profit / count;

        // Streaks; breakeven trades end any streak
        let mut streak: i64 = 0;
        for outcome in &outcomes {
            streak = match (outcome, streak) {
                (Outcome::Win, s) if s > 0 => s + 1,
                (Outcome::Win, _) => 1,
                (Outcome::Loss, s) if s < 0 => s - 1,
                (Outcome::Loss, _) => -1,
                (Outcome::Breakeven, _) => 0,
            };
            if streak > 0 {
                metrics.max_consecutive_wins = metrics.max_consecutive_wins.max(streak as usize);
            } else if streak < 0 {
                metrics.max_consecutive_losses =
                    metrics.max_consecutive_losses.max(streak.unsigned_abs() as usize);
            }
        }
        metrics.current_streak = streak;

        // Costs
        let sum = |f: fn(&Trade) -> Money| -> f64 { self.trades.iter().map(f).sum::<Money>().to_f64() };
        metrics.total_commission = sum(|t| t.commission);
        metrics.total_swap = sum(|t| t.swap);
        metrics.total_spread = sum(|t| t.spread_cost);
        metrics.total_slippage = sum(|t| t.slippage_cost);
        metrics.total_costs = sum(|t| t.total_costs());
        if metrics.gross_profit > 0.0 {
            metrics.costs_pct_of_gross_profit = metrics.total_costs / metrics.gross_profit * 100.0;
        }

        // Pips and timing
        metrics.total_pips = self.trades.iter().map(|t| t.pips).sum();
        metrics.average_pips = metrics.total_pips / count;
        metrics.average_trade_duration_hours =
            self.trades.iter().map(|t| t.duration_hours()).sum::<f64>() / count;
        let first_entry = self.trades.iter().map(|t| t.entry_time).min();
        let last_exit = self.trades.iter().map(|t| t.exit_time).max();
        if let (Some(start), Some(end)) = (first_entry, last_exit) {
            metrics.trading_span_days = (end - start).num_seconds() as f64 / 86_400.0;
        }

        // Returns
        let final_equity = self
            .equity_curve
            .last()
            .map_or(self.initial_balance + metrics.net_profit, |p| p.equity.to_f64());
        metrics.total_return = final_equity - self.initial_balance;
        if self.initial_balance > 0.0 {
            metrics.total_return_pct = metrics.total_return / self.initial_balance * 100.0;
        }

        self.apply_drawdown(&mut metrics);
        self.apply_risk_ratios(&mut metrics);

        if metrics.max_drawdown_pct > 0.0 {
            metrics.calmar_ratio = metrics.total_return_pct / metrics.max_drawdown_pct;
        }
        if metrics.max_drawdown > 0.0 {
            metrics.recovery_factor = metrics.net_profit / metrics.max_drawdown;
        }

        metrics
    }

    /// Max drawdown from the running peak, in currency, percent, bars and days
    fn apply_drawdown(&self, metrics: &mut Metrics) {
        let Some(first) = self.equity_curve.first() else {
            return;
        };

        let mut peak = first.equity.to_f64();
        let mut peak_index = 0usize;
        let mut peak_time = first.time;

        for (i, point) in self.equity_curve.iter().enumerate() {
            let equity = point.equity.to_f64();
            if equity >= peak {
                peak = equity;
                peak_index = i;
                peak_time = point.time;
                continue;
            }

            let drawdown = peak - equity;
            metrics.max_drawdown = metrics.max_drawdown.max(drawdown);
            if peak > 0.0 {
                metrics.max_drawdown_pct = metrics.max_drawdown_pct.max(drawdown / peak * 100.0);
            }
            metrics.max_drawdown_duration_bars = metrics.max_drawdown_duration_bars.max(i - peak_index);
            let days = (point.time - peak_time).num_seconds() as f64 / 86_400.0;
            metrics.max_drawdown_duration_days = metrics.max_drawdown_duration_days.max(days);
        }
    }

    /// Sharpe, Sortino, volatility and VaR from per-period equity returns
    fn apply_risk_ratios(&self, metrics: &mut Metrics) {
        let returns = self.period_returns();
        if returns.len() < 2 {
            return;
        }

        let periods = self.config.periods_per_year;
        let risk_free = self.config.risk_free_rate / periods;
        let mean = returns.iter().mean();
        let std_dev = returns.iter().std_dev();

        if std_dev.is_finite() && std_dev > 0.0 {
            metrics.sharpe_ratio = (mean - risk_free) / std_dev * periods.sqrt();
            metrics.volatility = std_dev * periods.sqrt();
        }

        let downside: Vec<f64> = returns.iter().copied().filter(|r| *r < 0.0).collect();
        if downside.len() >= 2 {
            let downside_dev = downside.iter().std_dev();
            if downside_dev.is_finite() && downside_dev > 0.0 {
                metrics.sortino_ratio = (mean - risk_free) / downside_dev * periods.sqrt();
            }
        }

        let mut data = Data::new(returns);
        let var = data.percentile(5);
        if var.is_finite() {
            metrics.value_at_risk_95 = var;
        }
    }

    fn period_returns(&self) -> Vec<f64> {
        self.equity_curve
            .iter()
            .map(|p| p.equity.to_f64())
            .tuple_windows()
            .filter(|(prev, _)| *prev != 0.0)
            .map(|(prev, next)| (next - prev) / prev)
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{ExitReason, Side, Symbol};
    use approx::assert_relative_eq;
    use chrono::{Duration, TimeZone};

    fn t0() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 3, 4, 0, 0, 0).unwrap()
    }

    fn trade(id: u64, net: f64, commission: f64) -> Trade {
        let net = Money::from_f64(net);
        let commission = Money::from_f64(commission);
        Trade {
            id,
            position_id: id,
            symbol: Symbol::new("EURUSD"),
            side: Side::Buy,
            lot_size: 0.1,
            entry_price: 1.1,
            exit_price: 1.1,
            entry_time: t0() + Duration::hours(id as i64),
            exit_time: t0() + Duration::hours(id as i64 + 2),
            gross_pnl: net + commission,
            commission,
            swap: Money::ZERO,
            spread_cost: Money::ZERO,
            slippage_cost: Money::ZERO,
            net_pnl: net,
            exit_reason: ExitReason::Signal,
            pips: net.to_f64(),
            duration_secs: 7_200,
            balance_after: Money::ZERO,
            equity_after: Money::ZERO,
        }
    }

    fn analyzer_with_curve(equities: &[f64]) -> PerformanceAnalyzer {
        let mut analyzer = PerformanceAnalyzer::new(equities[0], AnalyzerConfig::default());
        for (i, equity) in equities.iter().enumerate() {
            let equity = Money::from_f64(*equity);
            analyzer.add_equity_point(t0() + Duration::days(i as i64), equity, equity, 0, 0.0);
        }
        analyzer
    }

    #[test]
    fn test_zero_trades_gives_zero_metrics() {
        let analyzer = analyzer_with_curve(&[10_000.0, 9_000.0, 11_000.0]);
        let metrics = analyzer.calculate_metrics();
        assert_eq!(metrics.total_trades, 0);
        assert_eq!(metrics.sharpe_ratio, 0.0);
        assert_eq!(metrics.max_drawdown_pct, 0.0);
        assert_eq!(metrics.profit_factor, 0.0);
        assert_eq!(metrics.net_profit, 0.0);
    }

    #[test]
    fn test_win_loss_statistics() {
        let mut analyzer = analyzer_with_curve(&[10_000.0, 10_100.0]);
        analyzer.add_trade(trade(1, 100.0, 1.0));
        analyzer.add_trade(trade(2, -50.0, 1.0));
        analyzer.add_trade(trade(3, 200.0, 1.0));
        analyzer.add_trade(trade(4, 0.0, 1.0));

        let m = analyzer.calculate_metrics();
        assert_eq!(m.total_trades, 4);
        assert_eq!(m.winning_trades, 2);
        assert_eq!(m.losing_trades, 1);
        assert_eq!(m.breakeven_trades, 1);
        assert_relative_eq!(m.win_rate, 50.0);
        assert_relative_eq!(m.gross_profit, 300.0);
        assert_relative_eq!(m.gross_loss, 50.0);
        assert_relative_eq!(m.profit_factor, 6.0);
        assert_relative_eq!(m.largest_win, 200.0);
        assert_relative_eq!(m.largest_loss, -50.0);
        assert_relative_eq!(m.net_profit, 250.0);
        assert_relative_eq!(m.expectancy, 62.5);
        assert_relative_eq!(m.total_commission, 4.0);
        assert_eq!(m.current_streak, 0);
    }

    #[test]
    fn test_streaks() {
        let mut analyzer = analyzer_with_curve(&[10_000.0]);
        for (i, pnl) in [10.0, 20.0, 30.0, -5.0, -5.0, 10.0, -1.0, -1.0, -1.0, -1.0]
            .iter()
            .enumerate()
        {
            analyzer.add_trade(trade(i as u64, *pnl, 0.0));
        }
        let m = analyzer.calculate_metrics();
        assert_eq!(m.max_consecutive_wins, 3);
        assert_eq!(m.max_consecutive_losses, 4);
        assert_eq!(m.current_streak, -4);
    }

    #[test]
    fn test_no_losses_profit_factor_zero() {
        let mut analyzer = analyzer_with_curve(&[10_000.0, 10_050.0]);
        analyzer.add_trade(trade(1, 50.0, 0.0));
        assert_eq!(analyzer.calculate_metrics().profit_factor, 0.0);
    }

    #[test]
    fn test_drawdown() {
        let mut analyzer = analyzer_with_curve(&[10_000.0, 11_000.0, 9_900.0, 10_450.0, 11_500.0]);
        analyzer.add_trade(trade(1, 1_500.0, 0.0));

        let m = analyzer.calculate_metrics();
        assert_relative_eq!(m.max_drawdown, 1_100.0);
        assert_relative_eq!(m.max_drawdown_pct, 10.0);
        assert_eq!(m.max_drawdown_duration_bars, 2);
        assert_relative_eq!(m.max_drawdown_duration_days, 2.0);
        assert_relative_eq!(m.total_return_pct, 15.0);
        assert_relative_eq!(m.calmar_ratio, 1.5);
    }

    #[test]
    fn test_monotone_curve_has_no_drawdown() {
        let mut analyzer = analyzer_with_curve(&[10_000.0, 10_000.0, 10_100.0, 10_300.0]);
        analyzer.add_trade(trade(1, 300.0, 0.0));

        let m = analyzer.calculate_metrics();
        assert_eq!(m.max_drawdown, 0.0);
        assert_eq!(m.max_drawdown_pct, 0.0);
        assert_eq!(m.calmar_ratio, 0.0);
        assert!(m.sharpe_ratio > 0.0);
    }

    #[test]
    fn test_peak_starts_at_first_equity_point() {
        // Entry costs were charged before the first snapshot
        let mut analyzer = PerformanceAnalyzer::new(10_000.0, AnalyzerConfig::default());
        for i in 0..4 {
            let equity = Money::from_f64(9_993.0);
            analyzer.add_equity_point(t0() + Duration::days(i), equity, equity, 1, 0.0);
        }
        analyzer.add_trade(trade(1, -7.0, 7.0));

        let m = analyzer.calculate_metrics();
        assert_eq!(m.max_drawdown, 0.0);
        assert_eq!(m.max_drawdown_pct, 0.0);
        assert_eq!(m.max_drawdown_duration_bars, 0);
    }

    #[test]
    fn test_flat_curve_sharpe_is_zero() {
        let mut analyzer = analyzer_with_curve(&[10_000.0, 10_000.0, 10_000.0]);
        analyzer.add_trade(trade(1, 0.0, 0.0));
        let m = analyzer.calculate_metrics();
        assert_eq!(m.sharpe_ratio, 0.0);
        assert_eq!(m.sortino_ratio, 0.0);
        assert_eq!(m.volatility, 0.0);
    }

    #[test]
    fn test_sortino_uses_downside_only() {
        let mut analyzer =
            analyzer_with_curve(&[10_000.0, 10_200.0, 10_100.0, 10_400.0, 10_250.0, 10_600.0]);
        analyzer.add_trade(trade(1, 600.0, 0.0));
        let m = analyzer.calculate_metrics();
        assert!(m.sortino_ratio > 0.0);
        assert!(m.value_at_risk_95 < 0.0);
    }
}
