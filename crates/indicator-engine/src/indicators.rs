use trading_core::Bar;

use crate::frame::UNDEFINED;

// Every kernel returns a vector aligned 1:1 with its input; positions
// inside the warm-up window carry the undefined sentinel, never zero.

/// Simple Moving Average. Warm-up: `period - 1` rows.
pub fn sma(data: &[f64], period: usize) -> Vec<f64> {
    let mut out = vec![UNDEFINED; data.len()];
    if period == 0 || data.len() < period {
        return out;
    }
    let mut window_sum: f64 = data[..period].iter().sum();
    out[period - 1] = window_sum / period as f64;
    for i in period..data.len() {
        window_sum += data[i] - data[i - period];
        out[i] = window_sum / period as f64;
    }
    out
}

/// Exponential Moving Average seeded with the SMA of the first window.
/// Warm-up: `period - 1` rows.
pub fn ema(data: &[f64], period: usize) -> Vec<f64> {
    let mut out = vec![UNDEFINED; data.len()];
    if period == 0 || data.len() < period {
        return out;
    }
    let multiplier = 2.0 / (period as f64 + 1.0);
    let seed: f64 = data[..period].iter().sum::<f64>() / period as f64;
    out[period - 1] = seed;
    for i in period..data.len() {
        out[i] = (data[i] - out[i - 1]) * multiplier + out[i - 1];
    }
    out
}

/// EMA over a series whose head may be undefined (used for MACD signal).
fn ema_over_defined(data: &[f64], period: usize) -> Vec<f64> {
    let mut out = vec![UNDEFINED; data.len()];
    let Some(first) = data.iter().position(|v| !v.is_nan()) else {
        return out;
    };
    let defined = &data[first..];
    let tail = ema(defined, period);
    out[first..].copy_from_slice(&tail);
    out
}

/// Wilder's Relative Strength Index. Warm-up: `period` rows.
pub fn rsi(data: &[f64], period: usize) -> Vec<f64> {
    let mut out = vec![UNDEFINED; data.len()];
    if period == 0 || data.len() < period + 1 {
        return out;
    }

    let mut avg_gain = 0.0;
    let mut avg_loss = 0.0;
    for i in 1..=period {
        let change = data[i] - data[i - 1];
        if change > 0.0 {
            avg_gain += change;
        } else {
            avg_loss += -change;
        }
    }
    avg_gain /= period as f64;
    avg_loss /= period as f64;
    out[period] = rsi_value(avg_gain, avg_loss);

    for i in period + 1..data.len() {
        let change = data[i] - data[i - 1];
        let (gain, loss) = if change > 0.0 {
            (change, 0.0)
        } else {
            (0.0, -change)
        };
        avg_gain = (avg_gain * (period - 1) as f64 + gain) / period as f64;
        avg_loss = (avg_loss * (period - 1) as f64 + loss) / period as f64;
        out[i] = rsi_value(avg_gain, avg_loss);
    }
    out
}

fn rsi_value(avg_gain: f64, avg_loss: f64) -> f64 {
    if avg_loss == 0.0 {
        return 100.0;
    }
    let rs = avg_gain / avg_loss;
    100.0 - 100.0 / (1.0 + rs)
}

pub struct MacdOutput {
    pub line: Vec<f64>,
    pub signal: Vec<f64>,
    pub histogram: Vec<f64>,
}

/// MACD line, signal and histogram. Line warm-up: `slow - 1`; signal and
/// histogram warm-up: `slow + signal_period - 2`.
pub fn macd(data: &[f64], fast: usize, slow: usize, signal_period: usize) -> MacdOutput {
    let ema_fast = ema(data, fast);
    let ema_slow = ema(data, slow);
    let line: Vec<f64> = ema_fast
        .iter()
        .zip(&ema_slow)
        .map(|(&f, &s)| {
            if f.is_nan() || s.is_nan() {
                UNDEFINED
            } else {
                f - s
            }
        })
        .collect();
    let signal = ema_over_defined(&line, signal_period);
    let histogram: Vec<f64> = line
        .iter()
        .zip(&signal)
        .map(|(&l, &s)| {
            if l.is_nan() || s.is_nan() {
                UNDEFINED
            } else {
                l - s
            }
        })
        .collect();
    MacdOutput {
        line,
        signal,
        histogram,
    }
}

pub struct BollingerOutput {
    pub middle: Vec<f64>,
    pub upper: Vec<f64>,
    pub lower: Vec<f64>,
}

/// Bollinger Bands around an SMA with `k` population standard deviations.
pub fn bollinger(data: &[f64], period: usize, k: f64) -> BollingerOutput {
    let middle = sma(data, period);
    let mut upper = vec![UNDEFINED; data.len()];
    let mut lower = vec![UNDEFINED; data.len()];
    if period == 0 || data.len() < period {
        return BollingerOutput {
            middle,
            upper,
            lower,
        };
    }
    for i in period - 1..data.len() {
        let window = &data[i + 1 - period..=i];
        let mean = middle[i];
        let var = window.iter().map(|v| (v - mean).powi(2)).sum::<f64>() / period as f64;
        let sd = var.sqrt();
        upper[i] = mean + k * sd;
        lower[i] = mean - k * sd;
    }
    BollingerOutput {
        middle,
        upper,
        lower,
    }
}

/// Wilder-smoothed Average True Range. Warm-up: `period - 1` rows.
pub fn atr(bars: &[Bar], period: usize) -> Vec<f64> {
    let mut out = vec![UNDEFINED; bars.len()];
    if period == 0 || bars.len() < period {
        return out;
    }
    let tr: Vec<f64> = bars
        .iter()
        .enumerate()
        .map(|(i, bar)| {
            if i == 0 {
                bar.high - bar.low
            } else {
                let prev_close = bars[i - 1].close;
                (bar.high - bar.low)
                    .max((bar.high - prev_close).abs())
                    .max((bar.low - prev_close).abs())
            }
        })
        .collect();

    let mut value: f64 = tr[..period].iter().sum::<f64>() / period as f64;
    out[period - 1] = value;
    for i in period..bars.len() {
        value = (value * (period - 1) as f64 + tr[i]) / period as f64;
        out[i] = value;
    }
    out
}

pub struct StochasticOutput {
    pub k: Vec<f64>,
    pub d: Vec<f64>,
}

/// Stochastic oscillator %K / %D. A flat window (high == low) reads 50.
pub fn stochastic(bars: &[Bar], k_period: usize, d_period: usize) -> StochasticOutput {
    let mut k = vec![UNDEFINED; bars.len()];
    if k_period == 0 || bars.len() < k_period {
        return StochasticOutput {
            d: k.clone(),
            k,
        };
    }
    for i in k_period - 1..bars.len() {
        let window = &bars[i + 1 - k_period..=i];
        let hh = window.iter().map(|b| b.high).fold(f64::MIN, f64::max);
        let ll = window.iter().map(|b| b.low).fold(f64::MAX, f64::min);
        k[i] = if hh > ll {
            100.0 * (bars[i].close - ll) / (hh - ll)
        } else {
            50.0
        };
    }
    let d = ema_over_defined(&k, d_period.max(1));
    StochasticOutput { k, d }
}

/// Rate of change over `period` bars, in percent. Warm-up: `period` rows.
pub fn roc(data: &[f64], period: usize) -> Vec<f64> {
    let mut out = vec![UNDEFINED; data.len()];
    if period == 0 {
        return out;
    }
    for i in period..data.len() {
        let base = data[i - period];
        out[i] = if base != 0.0 {
            100.0 * (data[i] - base) / base
        } else {
            UNDEFINED
        };
    }
    out
}

/// On-Balance Volume. Defined from the first row (seeded at zero).
pub fn obv(bars: &[Bar]) -> Vec<f64> {
    let mut out = vec![0.0; bars.len()];
    for i in 1..bars.len() {
        let delta = if bars[i].close > bars[i - 1].close {
            bars[i].volume
        } else if bars[i].close < bars[i - 1].close {
            -bars[i].volume
        } else {
            0.0
        };
        out[i] = out[i - 1] + delta;
    }
    out
}

/// Williams %R. A flat window reads -50.
pub fn williams_r(bars: &[Bar], period: usize) -> Vec<f64> {
    let mut out = vec![UNDEFINED; bars.len()];
    if period == 0 || bars.len() < period {
        return out;
    }
    for i in period - 1..bars.len() {
        let window = &bars[i + 1 - period..=i];
        let hh = window.iter().map(|b| b.high).fold(f64::MIN, f64::max);
        let ll = window.iter().map(|b| b.low).fold(f64::MAX, f64::min);
        out[i] = if hh > ll {
            -100.0 * (hh - bars[i].close) / (hh - ll)
        } else {
            -50.0
        };
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::frame::is_defined;
    use chrono::{Duration, Utc};
    use trading_core::BarSource;

    fn bars_from_closes(closes: &[f64]) -> Vec<Bar> {
        let start = "2024-01-01T00:00:00Z".parse::<chrono::DateTime<Utc>>().unwrap();
        closes
            .iter()
            .enumerate()
            .map(|(i, &close)| Bar {
                ts: start + Duration::days(i as i64),
                open: close,
                high: close + 1.0,
                low: close - 1.0,
                close,
                volume: 1_000.0,
                source: BarSource::Broker,
            })
            .collect()
    }

    #[test]
    fn sma_warmup_and_values() {
        // 50-row ramp; SMA(20) must be undefined through row 19 and equal
        // to the window mean from row 20 on.
        let data: Vec<f64> = (1..=50).map(|i| i as f64).collect();
        let out = sma(&data, 20);
        assert_eq!(out.len(), 50);
        for i in 0..19 {
            assert!(!is_defined(out[i]), "row {i} should be warm-up");
        }
        let expected_first: f64 = (1..=20).sum::<i64>() as f64 / 20.0;
        assert!((out[19] - expected_first).abs() < 1e-9);
        for i in 19..50 {
            let window = &data[i + 1 - 20..=i];
            let reference = window.iter().sum::<f64>() / 20.0;
            assert!(
                (out[i] - reference).abs() < 1e-9,
                "row {i}: {} vs {}",
                out[i],
                reference
            );
        }
    }

    #[test]
    fn ema_seeds_with_sma() {
        let data = vec![2.0, 4.0, 6.0, 8.0, 10.0, 12.0];
        let out = ema(&data, 3);
        assert!(!is_defined(out[0]));
        assert!(!is_defined(out[1]));
        assert!((out[2] - 4.0).abs() < 1e-12); // (2+4+6)/3
        let mult = 2.0 / 4.0;
        let expected_3 = (8.0 - 4.0) * mult + 4.0;
        assert!((out[3] - expected_3).abs() < 1e-12);
    }

    #[test]
    fn rsi_all_gains_saturates() {
        let data: Vec<f64> = (1..=30).map(|i| i as f64).collect();
        let out = rsi(&data, 14);
        for i in 0..14 {
            assert!(!is_defined(out[i]));
        }
        for i in 14..30 {
            assert!((out[i] - 100.0).abs() < 1e-9);
        }
    }

    #[test]
    fn rsi_known_mixed_series() {
        let data = vec![
            44.34, 44.09, 44.15, 43.61, 44.33, 44.83, 45.10, 45.42, 45.84, 46.08, 45.89, 46.03,
            45.61, 46.28, 46.28,
        ];
        let out = rsi(&data, 14);
        assert!(is_defined(out[14]));
        assert!(out[14] > 0.0 && out[14] < 100.0);
    }

    #[test]
    fn macd_warmups_cascade() {
        let data: Vec<f64> = (0..60).map(|i| 100.0 + (i as f64) * 0.3).collect();
        let out = macd(&data, 12, 26, 9);
        assert!(!is_defined(out.line[24]));
        assert!(is_defined(out.line[25]));
        // Signal needs 9 defined MACD values: defined from index 25 + 8.
        assert!(!is_defined(out.signal[32]));
        assert!(is_defined(out.signal[33]));
        assert!(is_defined(out.histogram[33]));
    }

    #[test]
    fn bollinger_bands_bracket_the_mean() {
        let data: Vec<f64> = (0..30).map(|i| 50.0 + (i % 5) as f64).collect();
        let out = bollinger(&data, 10, 2.0);
        for i in 9..30 {
            assert!(out.lower[i] <= out.middle[i] && out.middle[i] <= out.upper[i]);
        }
    }

    #[test]
    fn atr_positive_after_warmup() {
        let bars = bars_from_closes(&(1..=30).map(|i| 100.0 + i as f64).collect::<Vec<_>>());
        let out = atr(&bars, 14);
        for i in 0..13 {
            assert!(!is_defined(out[i]));
        }
        for i in 13..30 {
            assert!(out[i] > 0.0);
        }
    }

    #[test]
    fn stochastic_bounded() {
        let closes: Vec<f64> = (0..40).map(|i| 100.0 + ((i * 7) % 13) as f64).collect();
        let bars = bars_from_closes(&closes);
        let out = stochastic(&bars, 14, 3);
        for i in 13..40 {
            assert!((0.0..=100.0).contains(&out.k[i]));
        }
    }

    #[test]
    fn obv_accumulates_signed_volume() {
        let bars = bars_from_closes(&[10.0, 11.0, 10.5, 10.5, 12.0]);
        let out = obv(&bars);
        assert_eq!(out, vec![0.0, 1_000.0, 0.0, 0.0, 1_000.0]);
    }

    #[test]
    fn williams_r_bounded() {
        let closes: Vec<f64> = (0..30).map(|i| 100.0 + ((i * 3) % 7) as f64).collect();
        let bars = bars_from_closes(&closes);
        let out = williams_r(&bars, 14);
        for i in 13..30 {
            assert!((-100.0..=0.0).contains(&out[i]));
        }
    }
}
