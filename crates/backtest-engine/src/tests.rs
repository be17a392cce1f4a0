use chrono::{DateTime, Duration, Utc};
use rust_decimal::prelude::ToPrimitive;
use rust_decimal::Decimal;
use std::collections::BTreeMap;

use decision_engine::{DecisionEngine, Direction, Signal, SignalExplanation, SignalType};
use fuzzy_engine::FuzzyFrame;
use indicator_engine::IndicatorFrame;
use trading_core::{Bar, BarSource, PositionSizing, RulesConfig};

use crate::engine::BacktestEngine;
use crate::models::{BacktestConfig, CommissionModel, SlippageModel};

/// Helper: one bar per day from (open, high, low, close) tuples.
fn daily_bars(closes: &[(f64, f64, f64, f64)]) -> Vec<Bar> {
    let start = "2024-01-02T00:00:00Z".parse::<DateTime<Utc>>().unwrap();
    closes
        .iter()
        .enumerate()
        .map(|(i, &(open, high, low, close))| Bar {
            ts: start + Duration::days(i as i64),
            open,
            high,
            low,
            close,
            volume: 1_000_000.0,
            source: BarSource::Broker,
        })
        .collect()
}

/// Helper: create an entry signal at a bar timestamp.
fn entry_signal(ts: DateTime<Utc>, strength: f64) -> Signal {
    Signal {
        signal_type: SignalType::Entry,
        direction: Direction::Long,
        strength,
        timestamp: ts,
        explanation: SignalExplanation {
            rule: "test_entry".to_string(),
            fired_values: BTreeMap::new(),
            memberships: BTreeMap::new(),
        },
    }
}

fn exit_signal(ts: DateTime<Utc>) -> Signal {
    Signal {
        signal_type: SignalType::Exit,
        direction: Direction::Close,
        strength: 1.0,
        timestamp: ts,
        explanation: SignalExplanation {
            rule: "test_exit".to_string(),
            fired_values: BTreeMap::new(),
            memberships: BTreeMap::new(),
        },
    }
}

fn test_config() -> BacktestConfig {
    BacktestConfig {
        initial_capital: Decimal::from(100_000),
        commission: CommissionModel::Percent { rate: 0.001 },
        slippage: SlippageModel::Percent { rate: 0.001 },
        sizing: PositionSizing::FixedFraction { fraction: 0.5 },
        stop_loss: None,
        take_profit: None,
        max_exposure: 1.0,
        allow_short: false,
        order_expiry_bars: 5,
    }
}

// ============================================================================
// Next-bar execution: signals fill at the NEXT bar's open, never same bar
// ============================================================================

#[test]
fn signals_fill_at_next_bar_open() {
    let bars = daily_bars(&[
        (100.0, 105.0, 99.0, 103.0),
        (104.0, 108.0, 102.0, 106.0),
        (107.0, 110.0, 105.0, 109.0),
        (108.0, 112.0, 107.0, 111.0),
    ]);
    let signals = vec![entry_signal(bars[0].ts, 0.9)];

    let result = BacktestEngine::new(test_config())
        .run_signals("AAPL", &bars, &signals)
        .unwrap();

    assert_eq!(result.total_trades, 1);
    let trade = &result.trades[0];
    // Day 2 open (104) plus 0.1% slippage, not the signal bar's prices.
    let expected = 104.0 * 1.001;
    let actual = trade.entry_price.to_f64().unwrap();
    assert!(
        (actual - expected).abs() < 1e-9,
        "expected fill at {expected}, got {actual}"
    );
    assert_eq!(trade.exit_reason, "end_of_data");
}

#[test]
fn exit_signal_closes_on_the_following_bar() {
    let bars = daily_bars(&[
        (100.0, 105.0, 99.0, 103.0),
        (104.0, 108.0, 102.0, 106.0),
        (107.0, 110.0, 105.0, 109.0),
        (108.0, 112.0, 107.0, 111.0),
    ]);
    let signals = vec![entry_signal(bars[0].ts, 0.9), exit_signal(bars[2].ts)];

    let result = BacktestEngine::new(test_config())
        .run_signals("AAPL", &bars, &signals)
        .unwrap();

    assert_eq!(result.total_trades, 1);
    let trade = &result.trades[0];
    assert_eq!(trade.exit_reason, "signal");
    assert_eq!(trade.exit_ts, bars[3].ts);
    // Day 4 open (108) minus sell slippage.
    let expected = 108.0 * 0.999;
    assert!((trade.exit_price.to_f64().unwrap() - expected).abs() < 1e-9);
    assert_eq!(trade.bars_held, 2);
}

// ============================================================================
// Protective exits
// ============================================================================

#[test]
fn stop_loss_closes_the_position() {
    let mut config = test_config();
    config.stop_loss = Some(0.05);
    config.slippage = SlippageModel::Fixed { amount: 0.0 };
    let bars = daily_bars(&[
        (100.0, 101.0, 99.0, 100.0),
        (100.0, 101.0, 99.0, 100.0), // entry at open 100, stop at 95
        (99.0, 100.0, 94.0, 96.0),   // low 94 pierces the stop
        (96.0, 97.0, 95.0, 96.0),
    ]);
    let signals = vec![entry_signal(bars[0].ts, 1.0)];

    let result = BacktestEngine::new(config)
        .run_signals("AAPL", &bars, &signals)
        .unwrap();

    assert_eq!(result.total_trades, 1);
    let trade = &result.trades[0];
    assert_eq!(trade.exit_reason, "stop_loss");
    assert!((trade.exit_price.to_f64().unwrap() - 95.0).abs() < 1e-9);
    assert!(trade.pnl < Decimal::ZERO);
}

#[test]
fn take_profit_closes_the_position() {
    let mut config = test_config();
    config.take_profit = Some(0.05);
    config.slippage = SlippageModel::Fixed { amount: 0.0 };
    let bars = daily_bars(&[
        (100.0, 101.0, 99.0, 100.0),
        (100.0, 101.0, 99.0, 100.0), // entry at 100, target 105
        (103.0, 106.0, 102.0, 104.0), // high 106 crosses the target
    ]);
    let signals = vec![entry_signal(bars[0].ts, 1.0)];

    let result = BacktestEngine::new(config)
        .run_signals("AAPL", &bars, &signals)
        .unwrap();

    let trade = &result.trades[0];
    assert_eq!(trade.exit_reason, "take_profit");
    assert!(trade.pnl > Decimal::ZERO);
}

// ============================================================================
// State machine
// ============================================================================

#[test]
fn adverse_exit_cancels_a_pending_entry_without_a_fill() {
    let bars = daily_bars(&[
        (100.0, 105.0, 99.0, 103.0),
        (104.0, 108.0, 102.0, 106.0),
        (107.0, 110.0, 105.0, 109.0),
    ]);
    // Entry and exit signal on the same bar: the exit cancels the pending
    // entry before anything fills.
    let signals = vec![entry_signal(bars[0].ts, 0.9), exit_signal(bars[0].ts)];

    let result = BacktestEngine::new(test_config())
        .run_signals("AAPL", &bars, &signals)
        .unwrap();
    assert_eq!(result.total_trades, 0);
    assert_eq!(
        result.final_equity.to_f64().unwrap(),
        100_000.0,
        "no fill may touch the portfolio"
    );
}

#[test]
fn duplicate_entry_signals_do_not_pyramid() {
    let bars = daily_bars(&[
        (100.0, 105.0, 99.0, 103.0),
        (104.0, 108.0, 102.0, 106.0),
        (107.0, 110.0, 105.0, 109.0),
        (108.0, 112.0, 107.0, 111.0),
    ]);
    let signals = vec![
        entry_signal(bars[0].ts, 0.9),
        entry_signal(bars[1].ts, 0.9),
        entry_signal(bars[2].ts, 0.9),
    ];

    let result = BacktestEngine::new(test_config())
        .run_signals("AAPL", &bars, &signals)
        .unwrap();
    assert_eq!(result.total_trades, 1);
}

// ============================================================================
// Sizing and exposure
// ============================================================================

#[test]
fn exposure_limit_rejects_oversized_entries() {
    let mut config = test_config();
    config.sizing = PositionSizing::Fixed { units: 10_000.0 }; // ~1M notional
    let bars = daily_bars(&[
        (100.0, 105.0, 99.0, 103.0),
        (104.0, 108.0, 102.0, 106.0),
        (107.0, 110.0, 105.0, 109.0),
    ]);
    let signals = vec![entry_signal(bars[0].ts, 0.9)];

    let result = BacktestEngine::new(config)
        .run_signals("AAPL", &bars, &signals)
        .unwrap();
    assert_eq!(result.total_trades, 0);
    assert_eq!(result.rejected_entries, 1);
}

#[test]
fn percent_risk_sizing_uses_the_stop_distance() {
    let mut config = test_config();
    config.sizing = PositionSizing::PercentRisk { risk_percent: 1.0 };
    config.stop_loss = Some(0.05);
    config.slippage = SlippageModel::Fixed { amount: 0.0 };
    config.commission = CommissionModel::Fixed { amount: 0.0 };
    let bars = daily_bars(&[
        (100.0, 101.0, 99.0, 100.0),
        (100.0, 101.0, 99.0, 100.0),
        (100.0, 101.0, 99.0, 100.0),
    ]);
    let signals = vec![entry_signal(bars[0].ts, 1.0)];

    let result = BacktestEngine::new(config)
        .run_signals("AAPL", &bars, &signals)
        .unwrap();
    assert_eq!(result.total_trades, 1);
    // Risking 1% of 100k = 1000 over a 5% stop on a 100 entry: 200 units.
    let quantity = result.trades[0].quantity.to_f64().unwrap();
    assert!((quantity - 200.0).abs() < 1e-6, "got {quantity}");
}

// ============================================================================
// Determinism and accounting
// ============================================================================

#[test]
fn identical_inputs_produce_an_identical_trade_log() {
    let bars = daily_bars(&[
        (100.0, 105.0, 99.0, 103.0),
        (104.0, 108.0, 102.0, 106.0),
        (107.0, 110.0, 105.0, 101.0),
        (100.0, 103.0, 98.0, 99.0),
        (99.0, 104.0, 97.0, 103.0),
    ]);
    let signals = vec![
        entry_signal(bars[0].ts, 0.9),
        exit_signal(bars[2].ts),
        entry_signal(bars[3].ts, 0.8),
    ];

    let engine = BacktestEngine::new(test_config());
    let a = engine.run_signals("AAPL", &bars, &signals).unwrap();
    let b = engine.run_signals("AAPL", &bars, &signals).unwrap();

    assert_eq!(
        serde_json::to_string(&a.trades).unwrap(),
        serde_json::to_string(&b.trades).unwrap()
    );
    assert_eq!(a.final_equity, b.final_equity);
    assert_eq!(a.metrics, b.metrics);
}

#[test]
fn equity_curve_is_marked_every_bar() {
    let bars = daily_bars(&[
        (100.0, 105.0, 99.0, 103.0),
        (104.0, 108.0, 102.0, 106.0),
        (107.0, 110.0, 105.0, 109.0),
    ]);
    let result = BacktestEngine::new(test_config())
        .run_signals("AAPL", &bars, &[])
        .unwrap();
    assert_eq!(result.equity_curve.len(), 3);
    assert!(result
        .equity_curve
        .iter()
        .all(|p| p.equity == Decimal::from(100_000)));
    assert_eq!(result.metrics.exposure, 0.0);
}

// ============================================================================
// Wiring with the real decision engine
// ============================================================================

#[test]
fn rule_driven_replay_enters_and_exits() {
    // rsi_low membership high early (entry), rsi high later (exit).
    let bars = daily_bars(&[
        (100.0, 101.0, 99.0, 100.0),
        (100.0, 101.0, 99.0, 100.5),
        (101.0, 103.0, 100.0, 102.0),
        (102.0, 105.0, 101.0, 104.0),
        (104.0, 107.0, 103.0, 106.0),
    ]);
    let ts: Vec<DateTime<Utc>> = bars.iter().map(|b| b.ts).collect();
    let mut indicators = IndicatorFrame::new(ts.clone());
    indicators.insert("rsi", vec![25.0, 28.0, 40.0, 60.0, 75.0]);
    let mut fuzzy = FuzzyFrame::new(ts);
    fuzzy.insert("rsi_low", vec![0.9, 0.8, 0.3, 0.0, 0.0]);

    let rules = RulesConfig {
        entry: vec!["rsi_low > 0.7".to_string()],
        exit: vec!["rsi > 70".to_string()],
        signal_threshold: 0.2,
    };
    let decisions = DecisionEngine::from_rules(
        &rules,
        &["rsi".to_string(), "rsi_low".to_string()],
        &["rsi_low".to_string()],
    )
    .unwrap();

    let result = BacktestEngine::new(test_config())
        .run("AAPL", &bars, &indicators, &fuzzy, &decisions)
        .unwrap();

    assert_eq!(result.total_trades, 1);
    let trade = &result.trades[0];
    assert_eq!(trade.entry_rule, "rsi_low > 0.7");
    // Entry signal on bar 0 fills at bar 1 open; exit signal on bar 4
    // has no following bar, so the position closes at end of data.
    assert_eq!(trade.entry_ts, bars[1].ts);
    assert_eq!(trade.exit_reason, "end_of_data");
    assert!(trade.pnl > Decimal::ZERO);
}

#[test]
fn misaligned_frames_are_rejected() {
    let bars = daily_bars(&[(100.0, 101.0, 99.0, 100.0)]);
    let indicators = IndicatorFrame::new(vec![]);
    let fuzzy = FuzzyFrame::new(vec![]);
    let decisions =
        DecisionEngine::from_rules(&RulesConfig::default(), &[], &[]).unwrap();
    let err = BacktestEngine::new(test_config())
        .run("AAPL", &bars, &indicators, &fuzzy, &decisions)
        .unwrap_err();
    assert!(err.to_string().contains("misaligned"), "{err}");
}

#[test]
fn commission_and_slippage_are_accounted() {
    let mut config = test_config();
    config.sizing = PositionSizing::Fixed { units: 100.0 };
    let bars = daily_bars(&[
        (100.0, 101.0, 99.0, 100.0),
        (100.0, 101.0, 99.0, 100.0),
        (100.0, 101.0, 99.0, 100.0),
    ]);
    let signals = vec![entry_signal(bars[0].ts, 1.0), exit_signal(bars[1].ts)];

    let result = BacktestEngine::new(config)
        .run_signals("AAPL", &bars, &signals)
        .unwrap();
    let trade = &result.trades[0];
    // Flat price series: the loss is exactly costs (2x slippage + 2x
    // commission on ~100 notional per unit).
    assert!(trade.pnl < Decimal::ZERO);
    assert!(trade.commission > Decimal::ZERO);
    assert!(trade.slippage_cost > Decimal::ZERO);
}
