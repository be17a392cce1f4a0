use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

use decision_engine::Direction;
use trading_core::{PositionSizing, StrategyConfig};

/// Commission charged per fill.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(tag = "model", rename_all = "snake_case")]
pub enum CommissionModel {
    /// Flat amount per trade.
    Fixed { amount: f64 },
    /// Fraction of the fill notional (0.001 = 10 bps).
    Percent { rate: f64 },
}

impl Default for CommissionModel {
    fn default() -> Self {
        CommissionModel::Percent { rate: 0.001 }
    }
}

/// Price degradation applied to fills, always against the trader.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(tag = "model", rename_all = "snake_case")]
pub enum SlippageModel {
    /// Absolute price offset.
    Fixed { amount: f64 },
    /// Fraction of the fill price.
    Percent { rate: f64 },
    /// Proportional to the bar's ATR: `factor * atr`.
    VolatilityScaled { atr_period: usize, factor: f64 },
}

impl Default for SlippageModel {
    fn default() -> Self {
        SlippageModel::Percent { rate: 0.0005 }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BacktestConfig {
    pub initial_capital: Decimal,
    #[serde(default)]
    pub commission: CommissionModel,
    #[serde(default)]
    pub slippage: SlippageModel,
    pub sizing: PositionSizing,
    /// Stop distance as a fraction of entry price.
    pub stop_loss: Option<f64>,
    pub take_profit: Option<f64>,
    /// Maximum position notional as a fraction of equity.
    pub max_exposure: f64,
    pub allow_short: bool,
    /// Pending limit/stop orders expire after this many bars.
    pub order_expiry_bars: usize,
}

impl BacktestConfig {
    /// Derive execution settings from a strategy's risk section.
    pub fn from_strategy(config: &StrategyConfig, initial_capital: Decimal) -> Self {
        Self {
            initial_capital,
            commission: CommissionModel::default(),
            slippage: SlippageModel::default(),
            sizing: config.risk.position_sizing.clone(),
            stop_loss: config.risk.stop_loss,
            take_profit: config.risk.take_profit,
            max_exposure: config.risk.max_exposure,
            allow_short: false,
            order_expiry_bars: 5,
        }
    }
}

/// Order kinds the execution simulator understands.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum OrderKind {
    /// Fills at the next bar's open plus slippage.
    Market,
    /// Fills when the bar trades through the limit price; conservative
    /// fill at the limit itself.
    Limit { price: f64 },
    /// Triggers when the bar trades through the stop; conservative fill
    /// at the worse of open and stop.
    Stop { price: f64 },
}

/// Position lifecycle: Flat -> PendingEntry -> Open -> PendingExit -> Flat.
/// Order cancellation transitions back without a fill.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PositionState {
    Flat,
    PendingEntry,
    Open,
    PendingExit,
}

/// One completed round trip.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Trade {
    pub direction: Direction,
    pub entry_ts: DateTime<Utc>,
    pub entry_price: Decimal,
    pub exit_ts: DateTime<Utc>,
    pub exit_price: Decimal,
    pub quantity: Decimal,
    pub pnl: Decimal,
    pub return_pct: f64,
    pub commission: Decimal,
    pub slippage_cost: Decimal,
    pub bars_held: usize,
    pub entry_rule: String,
    pub exit_reason: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EquityPoint {
    pub ts: DateTime<Utc>,
    pub equity: Decimal,
    pub drawdown_pct: f64,
}

/// Standardized performance record; every number is a deterministic
/// function of the trade log and equity curve.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PerformanceMetrics {
    pub total_return_pct: f64,
    pub annualized_return_pct: f64,
    pub sharpe: f64,
    pub sortino: f64,
    pub max_drawdown_pct: f64,
    pub win_rate: f64,
    pub profit_factor: f64,
    /// Fraction of bars with an open position.
    pub exposure: f64,
    /// Total traded notional over initial capital.
    pub turnover: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BacktestResult {
    pub symbol: String,
    pub initial_capital: Decimal,
    pub final_equity: Decimal,
    pub total_trades: usize,
    pub winning_trades: usize,
    pub losing_trades: usize,
    pub metrics: PerformanceMetrics,
    pub equity_curve: Vec<EquityPoint>,
    pub trades: Vec<Trade>,
    /// Signals that were rejected by exposure or sizing constraints.
    pub rejected_entries: usize,
}
