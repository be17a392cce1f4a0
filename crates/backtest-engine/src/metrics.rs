use rust_decimal::prelude::ToPrimitive;
use rust_decimal::Decimal;
use statrs::statistics::Statistics;

use crate::models::{EquityPoint, PerformanceMetrics, Trade};

/// Cap applied when there are no losing trades; infinity is not valid JSON.
const MAX_PROFIT_FACTOR: f64 = 999.99;
/// Bars-per-year assumption used to annualize bar returns.
const TRADING_DAYS: f64 = 252.0;

/// Compute the standardized metrics record from the equity curve and
/// trade log. Deterministic: same inputs, same outputs, bit for bit.
pub fn compute_metrics(
    equity_curve: &[EquityPoint],
    trades: &[Trade],
    initial_capital: Decimal,
    bars_total: usize,
    bars_exposed: usize,
    traded_notional: f64,
) -> PerformanceMetrics {
    let initial = initial_capital.to_f64().unwrap_or(0.0);
    if initial <= 0.0 || equity_curve.is_empty() {
        return PerformanceMetrics::default();
    }

    let final_equity = equity_curve
        .last()
        .map(|p| p.equity.to_f64().unwrap_or(initial))
        .unwrap_or(initial);
    let total_return_pct = (final_equity - initial) / initial * 100.0;

    // Bar-over-bar returns drive the risk ratios.
    let mut returns = Vec::with_capacity(equity_curve.len());
    let mut prev = initial;
    for point in equity_curve {
        let equity = point.equity.to_f64().unwrap_or(prev);
        if prev > 0.0 {
            returns.push((equity - prev) / prev);
        }
        prev = equity;
    }

    let mean = if returns.is_empty() {
        0.0
    } else {
        returns.iter().mean()
    };
    let std = if returns.len() < 2 {
        0.0
    } else {
        returns.iter().std_dev()
    };
    let downside = downside_dev(&returns);
    let annualization = TRADING_DAYS.sqrt();

    let sharpe = if std > 0.0 {
        mean / std * annualization
    } else {
        0.0
    };
    let sortino = if downside > 0.0 {
        mean / downside * annualization
    } else {
        0.0
    };

    let max_drawdown_pct = equity_curve
        .iter()
        .map(|p| p.drawdown_pct)
        .fold(0.0, f64::max);

    // Annualized return from the calendar span of the curve.
    let annualized_return_pct = {
        let first = equity_curve.first().unwrap().ts;
        let last = equity_curve.last().unwrap().ts;
        let days = (last - first).num_days().max(1) as f64;
        let growth = final_equity / initial;
        if growth > 0.0 && days >= 1.0 {
            (growth.powf(365.25 / days) - 1.0) * 100.0
        } else {
            0.0
        }
    };

    let wins = trades.iter().filter(|t| t.pnl > Decimal::ZERO).count();
    let win_rate = if trades.is_empty() {
        0.0
    } else {
        wins as f64 / trades.len() as f64 * 100.0
    };

    let gross_profit: f64 = trades
        .iter()
        .filter(|t| t.pnl > Decimal::ZERO)
        .map(|t| t.pnl.to_f64().unwrap_or(0.0))
        .sum();
    let gross_loss: f64 = trades
        .iter()
        .filter(|t| t.pnl < Decimal::ZERO)
        .map(|t| -t.pnl.to_f64().unwrap_or(0.0))
        .sum();
    let profit_factor = if gross_loss > 0.0 {
        (gross_profit / gross_loss).min(MAX_PROFIT_FACTOR)
    } else if gross_profit > 0.0 {
        MAX_PROFIT_FACTOR
    } else {
        0.0
    };

    let exposure = if bars_total > 0 {
        bars_exposed as f64 / bars_total as f64
    } else {
        0.0
    };
    let turnover = traded_notional / initial;

    PerformanceMetrics {
        total_return_pct,
        annualized_return_pct,
        sharpe,
        sortino,
        max_drawdown_pct,
        win_rate,
        profit_factor,
        exposure,
        turnover,
    }
}

fn downside_dev(returns: &[f64]) -> f64 {
    if returns.is_empty() {
        return 0.0;
    }
    let var = returns
        .iter()
        .map(|r| if *r < 0.0 { r * r } else { 0.0 })
        .sum::<f64>()
        / returns.len() as f64;
    var.sqrt()
}
