use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::KtrdrError;
use crate::types::{Bar, SeriesKey, TimeRange};
use crate::Timeframe;

/// One indicator observation aligned to a bar timestamp. `value` is either
/// a single number or a multi-field record; warm-up sentinels are encoded
/// as JSON null and must never be read as zero.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IndicatorRow {
    pub ts: DateTime<Utc>,
    pub value: serde_json::Value,
}

/// Persistence contract for bars and indicator frames.
///
/// Implementations guarantee: batch-atomic idempotent upserts keyed by
/// `(ts, symbol, timeframe)`, strictly ascending read order, tolerance of
/// concurrent readers with one writer per series, and that a failed upsert
/// leaves the series untouched.
#[async_trait]
pub trait TimeSeriesStore: Send + Sync {
    /// Insert-or-replace a validated batch. Returns the number of rows
    /// written. The whole batch is rejected on any integrity violation.
    async fn upsert_bars(&self, key: &SeriesKey, rows: &[Bar]) -> Result<u64, KtrdrError>;

    /// Rows in strictly ascending `ts`; missing ranges are empty, not errors.
    async fn load_bars(
        &self,
        key: &SeriesKey,
        range: Option<TimeRange>,
    ) -> Result<Vec<Bar>, KtrdrError>;

    async fn date_range(
        &self,
        key: &SeriesKey,
    ) -> Result<Option<(DateTime<Utc>, DateTime<Utc>)>, KtrdrError>;

    async fn delete_bars(
        &self,
        key: &SeriesKey,
        range: Option<TimeRange>,
    ) -> Result<u64, KtrdrError>;

    async fn upsert_indicator(
        &self,
        key: &SeriesKey,
        indicator_name: &str,
        params_hash: &str,
        rows: &[IndicatorRow],
    ) -> Result<u64, KtrdrError>;

    /// Sorted unique symbols, optionally restricted to one timeframe.
    async fn list_symbols(&self, timeframe: Option<Timeframe>) -> Result<Vec<String>, KtrdrError>;
}

/// Shared pre-write validation used by every store implementation:
/// OHLC/volume invariants, grid alignment and strictly ascending order.
pub fn validate_bar_batch(key: &SeriesKey, rows: &[Bar]) -> Result<(), KtrdrError> {
    let mut prev: Option<DateTime<Utc>> = None;
    for bar in rows {
        bar.validate()?;
        if !key.timeframe.is_aligned(bar.ts) {
            return Err(KtrdrError::DataIntegrity(format!(
                "{key}: bar at {} is not aligned to the {} grid",
                bar.ts, key.timeframe
            )));
        }
        if let Some(p) = prev {
            if bar.ts <= p {
                return Err(KtrdrError::DataIntegrity(format!(
                    "{key}: non-monotonic timestamps ({} after {})",
                    bar.ts, p
                )));
            }
        }
        prev = Some(bar.ts);
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{BarSource, Symbol};

    fn key() -> SeriesKey {
        SeriesKey::new(Symbol::new("AAPL").unwrap(), Timeframe::Day1)
    }

    fn bar(ts: &str, close: f64) -> Bar {
        Bar {
            ts: ts.parse().unwrap(),
            open: close,
            high: close + 1.0,
            low: close - 1.0,
            close,
            volume: 100.0,
            source: BarSource::Broker,
        }
    }

    #[test]
    fn accepts_ascending_aligned_batch() {
        let rows = vec![
            bar("2024-01-02T00:00:00Z", 100.0),
            bar("2024-01-03T00:00:00Z", 101.0),
        ];
        assert!(validate_bar_batch(&key(), &rows).is_ok());
    }

    #[test]
    fn rejects_unaligned_timestamp() {
        let rows = vec![bar("2024-01-02T09:30:00Z", 100.0)];
        let err = validate_bar_batch(&key(), &rows).unwrap_err();
        assert!(err.to_string().contains("not aligned"), "{err}");
    }

    #[test]
    fn rejects_duplicate_or_reversed_timestamps() {
        let rows = vec![
            bar("2024-01-03T00:00:00Z", 100.0),
            bar("2024-01-02T00:00:00Z", 101.0),
        ];
        let err = validate_bar_batch(&key(), &rows).unwrap_err();
        assert!(err.to_string().contains("non-monotonic"), "{err}");
    }
}
