use decision_engine::Direction;
use trading_core::Bar;

use crate::models::{CommissionModel, OrderKind, SlippageModel};

/// A fill produced by the execution simulator.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Fill {
    pub price: f64,
    pub slippage_cost_per_unit: f64,
}

/// Per-unit slippage for a fill around `price` on `bar`.
pub fn slippage_amount(model: SlippageModel, price: f64, atr: Option<f64>) -> f64 {
    match model {
        SlippageModel::Fixed { amount } => amount,
        SlippageModel::Percent { rate } => price * rate,
        SlippageModel::VolatilityScaled { factor, .. } => {
            // Falls back to a small percent when ATR is still warming up.
            atr.map_or(price * 0.0005, |a| a * factor)
        }
    }
}

/// Commission for a fill of `quantity` units at `price`.
pub fn commission_amount(model: CommissionModel, price: f64, quantity: f64) -> f64 {
    match model {
        CommissionModel::Fixed { amount } => amount,
        CommissionModel::Percent { rate } => price * quantity * rate,
    }
}

/// Try to fill an order against one bar. `is_buy` is true for long
/// entries and short exits. Returns `None` when the order does not
/// trigger inside the bar.
///
/// Fills are conservative: limit orders fill at the limit itself, stops
/// at the worse of the open and the stop price, and slippage always moves
/// the price against the trader.
pub fn try_fill(
    kind: OrderKind,
    is_buy: bool,
    bar: &Bar,
    slippage: SlippageModel,
    atr: Option<f64>,
) -> Option<Fill> {
    let raw_price = match kind {
        OrderKind::Market => bar.open,
        OrderKind::Limit { price } => {
            let triggered = if is_buy {
                bar.low <= price
            } else {
                bar.high >= price
            };
            if !triggered {
                return None;
            }
            // Worst fill within the bar for a triggered limit is the
            // limit price itself, except when the open gaps through it.
            if is_buy {
                price.min(bar.open)
            } else {
                price.max(bar.open)
            }
        }
        OrderKind::Stop { price } => {
            let triggered = if is_buy {
                bar.high >= price
            } else {
                bar.low <= price
            };
            if !triggered {
                return None;
            }
            if is_buy {
                price.max(bar.open)
            } else {
                price.min(bar.open)
            }
        }
    };

    let slip = slippage_amount(slippage, raw_price, atr);
    let price = if is_buy {
        raw_price + slip
    } else {
        (raw_price - slip).max(0.0)
    };
    Some(Fill {
        price,
        slippage_cost_per_unit: slip,
    })
}

/// Protective exit check for an open position against one bar. Both the
/// stop and the target can trigger inside a single bar; the stop wins
/// (worst case).
pub fn protective_exit(
    direction: Direction,
    stop_price: Option<f64>,
    target_price: Option<f64>,
    bar: &Bar,
) -> Option<(f64, &'static str)> {
    match direction {
        Direction::Long => {
            if let Some(stop) = stop_price {
                if bar.low <= stop {
                    return Some((stop.min(bar.open), "stop_loss"));
                }
            }
            if let Some(target) = target_price {
                if bar.high >= target {
                    return Some((target, "take_profit"));
                }
            }
        }
        Direction::Short => {
            if let Some(stop) = stop_price {
                if bar.high >= stop {
                    return Some((stop.max(bar.open), "stop_loss"));
                }
            }
            if let Some(target) = target_price {
                if bar.low <= target {
                    return Some((target, "take_profit"));
                }
            }
        }
        Direction::Close => {}
    }
    None
}
