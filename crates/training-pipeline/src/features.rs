use chrono::{DateTime, Utc};
use std::collections::BTreeMap;

use fuzzy_engine::FuzzyFrame;
use indicator_engine::{is_defined, IndicatorFrame, UNDEFINED};
use trading_core::{Bar, KtrdrError, StrategyConfig, Symbol, Timeframe};

use crate::labels;

/// Aligned per-timeframe inputs for one symbol: the bar series plus its
/// indicator and fuzzy frames.
pub struct TimeframeInputs {
    pub timeframe: Timeframe,
    pub bars: Vec<Bar>,
    pub indicators: IndicatorFrame,
    pub fuzzy: FuzzyFrame,
}

/// Features and labels for one symbol, warm-up and horizon rows dropped.
/// No symbol identity appears in the matrix; the tag rides alongside for
/// split-time bookkeeping only.
pub struct SymbolDataset {
    pub symbol: Symbol,
    pub ts: Vec<DateTime<Utc>>,
    /// Row-major, `rows x feature_names.len()`.
    pub rows: Vec<Vec<f64>>,
    pub labels: Vec<usize>,
}

/// Multi-symbol concatenation with per-symbol bookkeeping.
pub struct Dataset {
    pub feature_names: Vec<String>,
    pub label_classes: Vec<String>,
    pub rows: Vec<Vec<f64>>,
    pub labels: Vec<usize>,
    /// Originating symbol per row; never a model input.
    pub symbol_tags: Vec<String>,
    pub sample_counts: BTreeMap<String, usize>,
    pub date_range: Option<(DateTime<Utc>, DateTime<Utc>)>,
}

/// Feature column names in deterministic config order. Base-timeframe
/// columns keep their plain names; coarser timeframes are prefixed
/// (`1d.rsi`) and joined by last-known value.
pub fn feature_names(config: &StrategyConfig, base: Timeframe) -> Vec<String> {
    let mut names = Vec::new();
    for timeframe in sorted_timeframes(config) {
        let prefix = if timeframe == base {
            String::new()
        } else {
            format!("{timeframe}.")
        };
        for name in &config.features.include_indicators {
            names.push(format!("{prefix}{name}"));
        }
        for name in &config.features.include_fuzzy {
            names.push(format!("{prefix}{name}"));
        }
    }
    names
}

/// Configured timeframes, finest first. The finest is the base grid that
/// labels and rows are aligned to.
pub fn sorted_timeframes(config: &StrategyConfig) -> Vec<Timeframe> {
    let mut tfs = config.timeframes.clone();
    tfs.sort_by_key(|tf| tf.to_minutes());
    tfs.dedup();
    tfs
}

/// Align a coarse-timeframe column onto the fine grid by carrying the
/// last known value forward. Fine timestamps before the first coarse
/// observation stay undefined.
pub fn align_last_known(
    coarse_ts: &[DateTime<Utc>],
    coarse_values: &[f64],
    fine_ts: &[DateTime<Utc>],
) -> Vec<f64> {
    let mut out = Vec::with_capacity(fine_ts.len());
    let mut idx = 0usize;
    let mut current = UNDEFINED;
    for &ts in fine_ts {
        while idx < coarse_ts.len() && coarse_ts[idx] <= ts {
            current = coarse_values[idx];
            idx += 1;
        }
        out.push(current);
    }
    out
}

/// Build the feature/label dataset for one symbol from its per-timeframe
/// inputs. Rows where any selected column is undefined, or whose label
/// horizon runs past the series end, are dropped.
pub fn build_symbol_dataset(
    config: &StrategyConfig,
    symbol: &Symbol,
    inputs: &[TimeframeInputs],
) -> Result<SymbolDataset, KtrdrError> {
    let timeframes = sorted_timeframes(config);
    let base_tf = timeframes[0];
    let base = inputs
        .iter()
        .find(|i| i.timeframe == base_tf)
        .ok_or_else(|| {
            KtrdrError::config("timeframes", format!("missing base timeframe {base_tf} inputs"))
        })?;
    let base_ts: Vec<DateTime<Utc>> = base.bars.iter().map(|b| b.ts).collect();

    // Collect every selected column, aligned to the base grid.
    let mut columns: Vec<Vec<f64>> = Vec::new();
    for timeframe in &timeframes {
        let input = inputs
            .iter()
            .find(|i| i.timeframe == *timeframe)
            .ok_or_else(|| {
                KtrdrError::config("timeframes", format!("missing inputs for {timeframe}"))
            })?;
        let selected = config
            .features
            .include_indicators
            .iter()
            .map(|name| (name, &input.indicators))
            .chain(
                config
                    .features
                    .include_fuzzy
                    .iter()
                    .map(|name| (name, &input.fuzzy)),
            );
        for (name, frame) in selected {
            let column = frame.column(name).ok_or_else(|| {
                KtrdrError::config(
                    format!("features.{name}"),
                    format!("column not produced for timeframe {timeframe}"),
                )
            })?;
            if *timeframe == base_tf {
                columns.push(column.to_vec());
            } else {
                columns.push(align_last_known(&input.indicators.ts, column, &base_ts));
            }
        }
    }

    let label_column = labels::generate(&config.labels, &base.bars);

    let mut ts = Vec::new();
    let mut rows = Vec::new();
    let mut label_out = Vec::new();
    for i in 0..base.bars.len() {
        let Some(label) = label_column[i] else {
            continue;
        };
        let row: Vec<f64> = columns.iter().map(|c| c[i]).collect();
        if row.iter().any(|&v| !is_defined(v)) {
            continue; // warm-up row
        }
        ts.push(base_ts[i]);
        rows.push(row);
        label_out.push(label);
    }

    Ok(SymbolDataset {
        symbol: symbol.clone(),
        ts,
        rows,
        labels: label_out,
    })
}

/// Concatenate per-symbol datasets sequentially in the given order,
/// preserving intra-symbol temporal order. No shuffling, and no symbol
/// identifier enters the feature rows.
pub fn concat_datasets(
    config: &StrategyConfig,
    base: Timeframe,
    datasets: Vec<SymbolDataset>,
) -> Dataset {
    let mut rows = Vec::new();
    let mut labels_out = Vec::new();
    let mut tags = Vec::new();
    let mut counts = BTreeMap::new();
    let mut date_range: Option<(DateTime<Utc>, DateTime<Utc>)> = None;

    for ds in datasets {
        counts.insert(ds.symbol.to_string(), ds.rows.len());
        if let (Some(&first), Some(&last)) = (ds.ts.first(), ds.ts.last()) {
            date_range = Some(match date_range {
                None => (first, last),
                Some((lo, hi)) => (lo.min(first), hi.max(last)),
            });
        }
        for (row, label) in ds.rows.into_iter().zip(ds.labels) {
            rows.push(row);
            labels_out.push(label);
            tags.push(ds.symbol.to_string());
        }
    }

    Dataset {
        feature_names: feature_names(config, base),
        label_classes: labels::LABEL_CLASSES.iter().map(|s| s.to_string()).collect(),
        rows,
        labels: labels_out,
        symbol_tags: tags,
        sample_counts: counts,
        date_range,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ts_series(n: usize) -> Vec<DateTime<Utc>> {
        let start = "2024-01-01T00:00:00Z".parse::<DateTime<Utc>>().unwrap();
        (0..n).map(|i| start + chrono::Duration::hours(i as i64)).collect()
    }

    #[test]
    fn last_known_value_alignment() {
        let coarse_ts: Vec<DateTime<Utc>> = vec![
            "2024-01-01T00:00:00Z".parse().unwrap(),
            "2024-01-02T00:00:00Z".parse().unwrap(),
        ];
        let coarse = vec![1.0, 2.0];
        let fine = ts_series(30); // hourly from Jan 1 00:00
        let aligned = align_last_known(&coarse_ts, &coarse, &fine);
        assert_eq!(aligned[0], 1.0);
        assert_eq!(aligned[23], 1.0);
        assert_eq!(aligned[24], 2.0); // Jan 2 00:00
        assert_eq!(aligned[29], 2.0);
    }

    #[test]
    fn fine_rows_before_first_coarse_value_are_undefined() {
        let coarse_ts: Vec<DateTime<Utc>> = vec!["2024-01-01T05:00:00Z".parse().unwrap()];
        let aligned = align_last_known(&coarse_ts, &[7.0], &ts_series(8));
        assert!(aligned[..5].iter().all(|v| v.is_nan()));
        assert_eq!(aligned[5], 7.0);
        assert_eq!(aligned[7], 7.0);
    }
}
