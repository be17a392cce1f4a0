use chrono::{DateTime, Utc};
use rust_decimal::prelude::FromPrimitive;
use rust_decimal::Decimal;
use std::collections::HashMap;

use decision_engine::{DecisionEngine, Direction, Signal, SignalType};
use fuzzy_engine::FuzzyFrame;
use indicator_engine::{indicators, IndicatorFrame};
use trading_core::{Bar, KtrdrError, PositionSizing};

use crate::execution::{commission_amount, protective_exit, slippage_amount, try_fill};
use crate::metrics::compute_metrics;
use crate::models::{
    BacktestConfig, BacktestResult, EquityPoint, OrderKind, PositionState, SlippageModel, Trade,
};

/// Event-driven replay over one master bar series: signals place pending
/// orders, orders fill on later bars through the execution simulator, and
/// the portfolio is marked to market every bar.
pub struct BacktestEngine {
    config: BacktestConfig,
}

struct PendingOrder {
    kind: OrderKind,
    direction: Direction,
    placed_index: usize,
    rule: String,
}

struct OpenPosition {
    direction: Direction,
    quantity: f64,
    entry_price: f64,
    entry_ts: DateTime<Utc>,
    entry_index: usize,
    entry_rule: String,
    stop_price: Option<f64>,
    target_price: Option<f64>,
    entry_commission: f64,
    entry_slippage: f64,
}

impl BacktestEngine {
    pub fn new(config: BacktestConfig) -> Self {
        Self { config }
    }

    /// Fire the decision engine per bar, then replay the resulting
    /// signals through the simulator.
    pub fn run(
        &self,
        symbol: &str,
        bars: &[Bar],
        indicators_frame: &IndicatorFrame,
        fuzzy: &FuzzyFrame,
        decisions: &DecisionEngine,
    ) -> Result<BacktestResult, KtrdrError> {
        if bars.len() != indicators_frame.len() || bars.len() != fuzzy.len() {
            return Err(KtrdrError::DataIntegrity(format!(
                "misaligned frames: {} bars, {} indicator rows, {} fuzzy rows",
                bars.len(),
                indicators_frame.len(),
                fuzzy.len()
            )));
        }
        let per_bar: Vec<Vec<Signal>> = (0..bars.len())
            .map(|i| decisions.on_row(i, bars, indicators_frame, fuzzy))
            .collect();
        self.simulate(symbol, bars, per_bar)
    }

    /// Replay pre-generated signals (indexed by bar timestamp).
    pub fn run_signals(
        &self,
        symbol: &str,
        bars: &[Bar],
        signals: &[Signal],
    ) -> Result<BacktestResult, KtrdrError> {
        let index_by_ts: HashMap<DateTime<Utc>, usize> =
            bars.iter().enumerate().map(|(i, b)| (b.ts, i)).collect();
        let mut per_bar: Vec<Vec<Signal>> = vec![Vec::new(); bars.len()];
        for signal in signals {
            if let Some(&i) = index_by_ts.get(&signal.timestamp) {
                per_bar[i].push(signal.clone());
            }
        }
        self.simulate(symbol, bars, per_bar)
    }

    fn simulate(
        &self,
        symbol: &str,
        bars: &[Bar],
        per_bar: Vec<Vec<Signal>>,
    ) -> Result<BacktestResult, KtrdrError> {
        if bars.is_empty() {
            return Err(KtrdrError::DataIntegrity("empty bar series".to_string()));
        }

        let atr_series = match self.config.slippage {
            SlippageModel::VolatilityScaled { atr_period, .. } => {
                Some(indicators::atr(bars, atr_period))
            }
            _ => None,
        };

        let initial = decimal_to_f64(self.config.initial_capital);
        let mut cash = initial;
        let mut state = PositionState::Flat;
        let mut pending_entry: Option<PendingOrder> = None;
        let mut pending_exit: Option<PendingOrder> = None;
        let mut position: Option<OpenPosition> = None;

        let mut trades: Vec<Trade> = Vec::new();
        let mut equity_curve: Vec<EquityPoint> = Vec::with_capacity(bars.len());
        let mut peak_equity = initial;
        let mut bars_exposed = 0usize;
        let mut traded_notional = 0.0f64;
        let mut rejected_entries = 0usize;

        for (i, bar) in bars.iter().enumerate() {
            let atr = atr_series
                .as_ref()
                .map(|v| v[i])
                .filter(|v| v.is_finite());

            // 1. Pending entry fills (or expires) against this bar.
            if state == PositionState::PendingEntry {
                let order = pending_entry.take().expect("pending entry in state");
                let is_buy = order.direction == Direction::Long;
                if let Some(fill) = try_fill(order.kind, is_buy, bar, self.config.slippage, atr) {
                    match self.position_size(cash, fill.price) {
                        Some(quantity) => {
                            let commission =
                                commission_amount(self.config.commission, fill.price, quantity);
                            let affordable = order.direction != Direction::Long
                                || quantity * fill.price + commission <= cash + 1e-9;
                            if affordable {
                                match order.direction {
                                    Direction::Long => {
                                        cash -= quantity * fill.price + commission;
                                    }
                                    Direction::Short => {
                                        cash += quantity * fill.price - commission;
                                    }
                                    Direction::Close => unreachable!("entries are long or short"),
                                }
                                traded_notional += quantity * fill.price;
                                position = Some(OpenPosition {
                                    direction: order.direction,
                                    quantity,
                                    entry_price: fill.price,
                                    entry_ts: bar.ts,
                                    entry_index: i,
                                    entry_rule: order.rule,
                                    stop_price: self.stop_price(order.direction, fill.price),
                                    target_price: self.target_price(order.direction, fill.price),
                                    entry_commission: commission,
                                    entry_slippage: fill.slippage_cost_per_unit * quantity,
                                });
                                state = PositionState::Open;
                            } else {
                                rejected_entries += 1;
                                state = PositionState::Flat;
                            }
                        }
                        None => {
                            rejected_entries += 1;
                            state = PositionState::Flat;
                        }
                    }
                } else if i.saturating_sub(order.placed_index) >= self.config.order_expiry_bars {
                    state = PositionState::Flat; // expired without a fill
                } else {
                    pending_entry = Some(order);
                }
            }

            // 2. Pending exit fills against this bar.
            if state == PositionState::PendingExit {
                let order = pending_exit.take().expect("pending exit in state");
                let pos = position.as_ref().expect("open position behind pending exit");
                let is_buy = pos.direction == Direction::Short;
                if let Some(fill) = try_fill(order.kind, is_buy, bar, self.config.slippage, atr) {
                    let pos = position.take().unwrap();
                    self.close_position(
                        pos,
                        fill.price,
                        fill.slippage_cost_per_unit,
                        bar.ts,
                        i,
                        "signal",
                        &mut cash,
                        &mut traded_notional,
                        &mut trades,
                    );
                    state = PositionState::Flat;
                } else if i.saturating_sub(order.placed_index) >= self.config.order_expiry_bars {
                    state = PositionState::Open; // cancelled, position stays open
                } else {
                    pending_exit = Some(order);
                }
            }

            // 3. Protective stop/target on the open position.
            if state == PositionState::Open {
                let pos_ref = position.as_ref().unwrap();
                if let Some((raw_price, reason)) =
                    protective_exit(pos_ref.direction, pos_ref.stop_price, pos_ref.target_price, bar)
                {
                    let slip = slippage_amount(self.config.slippage, raw_price, atr);
                    let exit_price = match pos_ref.direction {
                        Direction::Long => (raw_price - slip).max(0.0),
                        _ => raw_price + slip,
                    };
                    let pos = position.take().unwrap();
                    self.close_position(
                        pos,
                        exit_price,
                        slip,
                        bar.ts,
                        i,
                        reason,
                        &mut cash,
                        &mut traded_notional,
                        &mut trades,
                    );
                    state = PositionState::Flat;
                    pending_exit = None;
                }
            }

            // 4. New signals place next-bar orders.
            for signal in &per_bar[i] {
                match (signal.signal_type, state) {
                    (SignalType::Entry, PositionState::Flat) => {
                        if signal.direction == Direction::Short && !self.config.allow_short {
                            continue;
                        }
                        pending_entry = Some(PendingOrder {
                            kind: OrderKind::Market,
                            direction: signal.direction,
                            placed_index: i,
                            rule: signal.explanation.rule.clone(),
                        });
                        state = PositionState::PendingEntry;
                    }
                    (SignalType::Exit, PositionState::Open) => {
                        pending_exit = Some(PendingOrder {
                            kind: OrderKind::Market,
                            direction: Direction::Close,
                            placed_index: i,
                            rule: signal.explanation.rule.clone(),
                        });
                        state = PositionState::PendingExit;
                    }
                    // An adverse exit signal while waiting to enter
                    // cancels the pending order without a fill.
                    (SignalType::Exit, PositionState::PendingEntry) => {
                        pending_entry = None;
                        state = PositionState::Flat;
                    }
                    _ => {}
                }
            }

            // 5. Mark to market at the close.
            let marked = cash
                + position.as_ref().map_or(0.0, |p| match p.direction {
                    Direction::Long => p.quantity * bar.close,
                    Direction::Short => -p.quantity * bar.close,
                    Direction::Close => 0.0,
                });
            peak_equity = peak_equity.max(marked);
            let drawdown_pct = if peak_equity > 0.0 {
                (peak_equity - marked) / peak_equity * 100.0
            } else {
                0.0
            };
            equity_curve.push(EquityPoint {
                ts: bar.ts,
                equity: f64_to_decimal(marked),
                drawdown_pct,
            });
            if position.is_some() {
                bars_exposed += 1;
            }
        }

        // Force-close whatever is still open at the final bar's close.
        if let Some(pos) = position.take() {
            let last = bars.last().unwrap();
            self.close_position(
                pos,
                last.close,
                0.0,
                last.ts,
                bars.len() - 1,
                "end_of_data",
                &mut cash,
                &mut traded_notional,
                &mut trades,
            );
            // Rewrite the last equity point with the realized cash.
            let drawdown_pct = if peak_equity > 0.0 {
                (peak_equity - cash).max(0.0) / peak_equity * 100.0
            } else {
                0.0
            };
            *equity_curve.last_mut().unwrap() = EquityPoint {
                ts: last.ts,
                equity: f64_to_decimal(cash),
                drawdown_pct,
            };
        }

        let winning = trades.iter().filter(|t| t.pnl > Decimal::ZERO).count();
        let losing = trades.iter().filter(|t| t.pnl < Decimal::ZERO).count();
        let metrics = compute_metrics(
            &equity_curve,
            &trades,
            self.config.initial_capital,
            bars.len(),
            bars_exposed,
            traded_notional,
        );

        tracing::debug!(
            symbol,
            trades = trades.len(),
            final_equity = cash,
            "backtest finished"
        );
        Ok(BacktestResult {
            symbol: symbol.to_string(),
            initial_capital: self.config.initial_capital,
            final_equity: f64_to_decimal(cash),
            total_trades: trades.len(),
            winning_trades: winning,
            losing_trades: losing,
            metrics,
            equity_curve,
            trades,
            rejected_entries,
        })
    }

    /// Units to trade at `price` with `equity` available, or `None` when
    /// sizing or the exposure limit rejects the trade.
    fn position_size(&self, equity: f64, price: f64) -> Option<f64> {
        if price <= 0.0 || equity <= 0.0 {
            return None;
        }
        let quantity = match &self.config.sizing {
            PositionSizing::FixedFraction { fraction } => equity * fraction / price,
            PositionSizing::PercentRisk { risk_percent } => {
                let stop_fraction = self.config.stop_loss?;
                equity * (risk_percent / 100.0) / (price * stop_fraction)
            }
            PositionSizing::Fixed { units } => *units,
        };
        if quantity <= 0.0 {
            return None;
        }
        if quantity * price > self.config.max_exposure * equity + 1e-9 {
            return None;
        }
        Some(quantity)
    }

    fn stop_price(&self, direction: Direction, entry: f64) -> Option<f64> {
        self.config.stop_loss.map(|fraction| match direction {
            Direction::Short => entry * (1.0 + fraction),
            _ => entry * (1.0 - fraction),
        })
    }

    fn target_price(&self, direction: Direction, entry: f64) -> Option<f64> {
        self.config.take_profit.map(|fraction| match direction {
            Direction::Short => entry * (1.0 - fraction),
            _ => entry * (1.0 + fraction),
        })
    }

    #[allow(clippy::too_many_arguments)]
    fn close_position(
        &self,
        pos: OpenPosition,
        exit_price: f64,
        exit_slip_per_unit: f64,
        exit_ts: DateTime<Utc>,
        exit_index: usize,
        reason: &str,
        cash: &mut f64,
        traded_notional: &mut f64,
        trades: &mut Vec<Trade>,
    ) {
        let exit_commission =
            commission_amount(self.config.commission, exit_price, pos.quantity);
        match pos.direction {
            Direction::Long => *cash += pos.quantity * exit_price - exit_commission,
            Direction::Short => *cash -= pos.quantity * exit_price + exit_commission,
            Direction::Close => {}
        }
        *traded_notional += pos.quantity * exit_price;

        let gross = match pos.direction {
            Direction::Long => pos.quantity * (exit_price - pos.entry_price),
            Direction::Short => pos.quantity * (pos.entry_price - exit_price),
            Direction::Close => 0.0,
        };
        let total_commission = pos.entry_commission + exit_commission;
        let pnl = gross - total_commission;
        let basis = pos.quantity * pos.entry_price;

        trades.push(Trade {
            direction: pos.direction,
            entry_ts: pos.entry_ts,
            entry_price: f64_to_decimal(pos.entry_price),
            exit_ts,
            exit_price: f64_to_decimal(exit_price),
            quantity: f64_to_decimal(pos.quantity),
            pnl: f64_to_decimal(pnl),
            return_pct: if basis > 0.0 { pnl / basis * 100.0 } else { 0.0 },
            commission: f64_to_decimal(total_commission),
            slippage_cost: f64_to_decimal(
                pos.entry_slippage + exit_slip_per_unit * pos.quantity,
            ),
            bars_held: exit_index - pos.entry_index,
            entry_rule: pos.entry_rule,
            exit_reason: reason.to_string(),
        });
    }
}

fn decimal_to_f64(d: Decimal) -> f64 {
    use rust_decimal::prelude::ToPrimitive;
    d.to_f64().unwrap_or(0.0)
}

fn f64_to_decimal(v: f64) -> Decimal {
    Decimal::from_f64(v).unwrap_or(Decimal::ZERO)
}
