use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::BTreeMap;
use std::sync::RwLock;

use trading_core::{
    validate_bar_batch, Bar, IndicatorRow, KtrdrError, SeriesKey, TimeRange, TimeSeriesStore,
    Timeframe,
};

type IndicatorKey = (SeriesKey, String, String);

#[derive(Default)]
struct Inner {
    bars: BTreeMap<SeriesKey, BTreeMap<DateTime<Utc>, Bar>>,
    indicators: BTreeMap<IndicatorKey, BTreeMap<DateTime<Utc>, serde_json::Value>>,
}

/// In-memory `TimeSeriesStore` with the same validation and idempotence
/// semantics as the Postgres store. Used throughout the test suites.
#[derive(Default)]
pub struct MemoryStore {
    inner: RwLock<Inner>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Total persisted bar rows, across all series.
    pub fn bar_count(&self) -> usize {
        let inner = self.inner.read().unwrap();
        inner.bars.values().map(|m| m.len()).sum()
    }
}

#[async_trait]
impl TimeSeriesStore for MemoryStore {
    async fn upsert_bars(&self, key: &SeriesKey, rows: &[Bar]) -> Result<u64, KtrdrError> {
        if rows.is_empty() {
            return Ok(0);
        }
        validate_bar_batch(key, rows)?;
        let mut inner = self.inner.write().unwrap();
        let series = inner.bars.entry(key.clone()).or_default();
        for bar in rows {
            series.insert(bar.ts, bar.clone());
        }
        Ok(rows.len() as u64)
    }

    async fn load_bars(
        &self,
        key: &SeriesKey,
        range: Option<TimeRange>,
    ) -> Result<Vec<Bar>, KtrdrError> {
        let inner = self.inner.read().unwrap();
        let Some(series) = inner.bars.get(key) else {
            return Ok(Vec::new());
        };
        let bars = match range {
            Some(r) => series.range(r.start..=r.end).map(|(_, b)| b.clone()).collect(),
            None => series.values().cloned().collect(),
        };
        Ok(bars)
    }

    async fn date_range(
        &self,
        key: &SeriesKey,
    ) -> Result<Option<(DateTime<Utc>, DateTime<Utc>)>, KtrdrError> {
        let inner = self.inner.read().unwrap();
        let range = inner.bars.get(key).and_then(|series| {
            let min = series.keys().next()?;
            let max = series.keys().next_back()?;
            Some((*min, *max))
        });
        Ok(range)
    }

    async fn delete_bars(
        &self,
        key: &SeriesKey,
        range: Option<TimeRange>,
    ) -> Result<u64, KtrdrError> {
        let mut inner = self.inner.write().unwrap();
        let Some(series) = inner.bars.get_mut(key) else {
            return Ok(0);
        };
        let count = match range {
            Some(r) => {
                let keys: Vec<_> = series.range(r.start..=r.end).map(|(ts, _)| *ts).collect();
                for ts in &keys {
                    series.remove(ts);
                }
                keys.len()
            }
            None => {
                let count = series.len();
                series.clear();
                count
            }
        };
        Ok(count as u64)
    }

    async fn upsert_indicator(
        &self,
        key: &SeriesKey,
        indicator_name: &str,
        params_hash: &str,
        rows: &[IndicatorRow],
    ) -> Result<u64, KtrdrError> {
        let mut inner = self.inner.write().unwrap();
        let frame = inner
            .indicators
            .entry((key.clone(), indicator_name.to_string(), params_hash.to_string()))
            .or_default();
        for row in rows {
            frame.insert(row.ts, row.value.clone());
        }
        Ok(rows.len() as u64)
    }

    async fn list_symbols(&self, timeframe: Option<Timeframe>) -> Result<Vec<String>, KtrdrError> {
        let inner = self.inner.read().unwrap();
        let mut symbols: Vec<String> = inner
            .bars
            .iter()
            .filter(|(key, series)| {
                !series.is_empty() && timeframe.map_or(true, |tf| key.timeframe == tf)
            })
            .map(|(key, _)| key.symbol.as_str().to_string())
            .collect();
        symbols.sort();
        symbols.dedup();
        Ok(symbols)
    }
}
