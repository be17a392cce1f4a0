pub mod cache;
pub mod calendar;
pub mod gaps;
pub mod repair;

use chrono::{DateTime, Utc};
use std::collections::{BTreeSet, HashMap};
use std::sync::{Arc, Mutex};

use trading_core::{
    Bar, GapKind, KtrdrError, MarketDataProvider, QualityReport, SeriesKey, Symbol, TimeRange,
    TimeSeriesStore,
};

use crate::cache::FrameCache;
use crate::calendar::TradingCalendar;

pub use crate::calendar::us_market_holidays;

/// How much of the requested range the manager is expected to make present.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum LoadMode {
    /// Store rows only; the provider is never contacted.
    Local,
    /// Ensure data from the last stored bar through the end of the range.
    Tail,
    /// Ensure data from the start of the range through the first stored bar.
    Backfill,
    /// Ensure the full range by fetching only classified data gaps.
    Full,
}

#[derive(Debug, Clone)]
pub struct DataManagerConfig {
    /// Per-provider-call cap, in grid points.
    pub fetch_cap_points: usize,
    /// Capacity of the in-process frame cache.
    pub cache_capacity: usize,
    /// Enable zero-volume doji smoothing during the repair pass.
    pub smooth_zero_volume: bool,
    /// Escalate partial frames (pacing, dropped connections) to errors.
    pub strict: bool,
}

impl Default for DataManagerConfig {
    fn default() -> Self {
        Self {
            fetch_cap_points: 1_000,
            cache_capacity: 64,
            smooth_zero_volume: false,
            strict: false,
        }
    }
}

/// Parse a timestamp at the API boundary. Naive local times (no UTC
/// offset) are rejected outright.
pub fn parse_utc(s: &str) -> Result<DateTime<Utc>, KtrdrError> {
    DateTime::parse_from_rfc3339(s)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| KtrdrError::config("timestamp", format!("'{s}' is not an offset-aware RFC 3339 instant: {e}")))
}

/// The only entry point for bar data anywhere in the system: hybrid
/// local/remote loading with gap classification, minimal fetching,
/// merge/repair and an LRU frame cache.
pub struct DataManager {
    store: Arc<dyn TimeSeriesStore>,
    provider: Arc<dyn MarketDataProvider>,
    config: DataManagerConfig,
    cache: FrameCache,
    calendars: Mutex<HashMap<Symbol, TradingCalendar>>,
}

impl DataManager {
    pub fn new(
        store: Arc<dyn TimeSeriesStore>,
        provider: Arc<dyn MarketDataProvider>,
        config: DataManagerConfig,
    ) -> Self {
        let cache = FrameCache::new(config.cache_capacity);
        Self {
            store,
            provider,
            config,
            cache,
            calendars: Mutex::new(HashMap::new()),
        }
    }

    /// Load `[range.start, range.end]` for one series under the given
    /// mode, returning ordered bars plus a quality report.
    pub async fn load_data(
        &self,
        key: &SeriesKey,
        range: TimeRange,
        mode: LoadMode,
    ) -> Result<(Vec<Bar>, QualityReport), KtrdrError> {
        if let Some(hit) = self.cache.get(key, range, mode) {
            tracing::debug!(series = %key, ?mode, "frame cache hit");
            return Ok(hit);
        }

        let local = self.store.load_bars(key, Some(range)).await?;
        let calendar = self.calendar_for(&key.symbol).await;

        let mut report = QualityReport::default();
        let fetch_ranges = match mode {
            LoadMode::Local => Vec::new(),
            LoadMode::Full => {
                let present: BTreeSet<_> = local.iter().map(|b| b.ts).collect();
                let gaps = gaps::classify_gaps(key.timeframe, range, &present, &calendar);
                gaps::fetch_ranges(&gaps, key.timeframe, self.config.fetch_cap_points)
            }
            LoadMode::Tail => self.tail_range(key, range).await?,
            LoadMode::Backfill => self.backfill_range(key, range).await?,
        };

        let fetched = self.fetch_all(key, &fetch_ranges, &mut report).await?;
        report.fetched = fetched.len();

        let mut frame = if fetched.is_empty() {
            local
        } else {
            repair::merge_bars(local, fetched)
        };
        if self.config.smooth_zero_volume {
            report.repaired = repair::smooth_zero_volume_dojis(&mut frame);
        }

        // Persist one batch per series and drop stale cache entries. The
        // store re-validates the final frame (ordering, OHLC, alignment).
        if report.fetched > 0 || report.repaired > 0 {
            self.store.upsert_bars(key, &frame).await?;
            self.cache.invalidate_series(key);
        }

        // Reclassify against the final frame so the report shows what is
        // still missing and why.
        let present: BTreeSet<_> = frame.iter().map(|b| b.ts).collect();
        report.remaining_gaps = gaps::classify_gaps(key.timeframe, range, &present, &calendar);
        report.total = frame.len();

        if self.config.strict && report.incomplete {
            return Err(KtrdrError::RateLimited(format!(
                "strict load of {key} left an incomplete frame: {:?}",
                report.warnings
            )));
        }

        self.cache
            .put(key, range, mode, frame.clone(), report.clone());
        Ok((frame, report))
    }

    /// Grid span from the last stored bar (exclusive) to the range end.
    async fn tail_range(
        &self,
        key: &SeriesKey,
        range: TimeRange,
    ) -> Result<Vec<TimeRange>, KtrdrError> {
        let start = match self.store.date_range(key).await? {
            Some((_, last)) if last >= range.end => return Ok(Vec::new()),
            Some((_, last)) => key.timeframe.next(last).max(range.start),
            None => range.start,
        };
        Ok(self.chunked(key, start, range.end))
    }

    /// Grid span from the range start to the first stored bar (exclusive).
    async fn backfill_range(
        &self,
        key: &SeriesKey,
        range: TimeRange,
    ) -> Result<Vec<TimeRange>, KtrdrError> {
        let end = match self.store.date_range(key).await? {
            Some((first, _)) if first <= range.start => return Ok(Vec::new()),
            Some((first, _)) => {
                // Last grid point strictly before the first stored bar.
                let grid = key.timeframe.grid(range.start, first);
                let Some(&end) = grid.iter().rev().find(|&&ts| ts < first) else {
                    return Ok(Vec::new());
                };
                end.min(range.end)
            }
            None => range.end,
        };
        Ok(self.chunked(key, range.start, end))
    }

    fn chunked(&self, key: &SeriesKey, start: DateTime<Utc>, end: DateTime<Utc>) -> Vec<TimeRange> {
        if start > end {
            return Vec::new();
        }
        let points = key.timeframe.grid(start, end).len();
        let gap = trading_core::Gap {
            start,
            end,
            kind: GapKind::Data,
            points,
        };
        gaps::fetch_ranges(&[gap], key.timeframe, self.config.fetch_cap_points)
    }

    /// Fetch every range, applying the recovery policy: pacing and
    /// dropped connections degrade to a partial frame (unless strict),
    /// `NoData` stays a remaining gap, anything else is fatal.
    async fn fetch_all(
        &self,
        key: &SeriesKey,
        ranges: &[TimeRange],
        report: &mut QualityReport,
    ) -> Result<Vec<Bar>, KtrdrError> {
        let mut fetched = Vec::new();
        for range in ranges {
            match self
                .provider
                .fetch_bars(&key.symbol, key.timeframe, *range)
                .await
            {
                Ok(bars) => fetched.extend(bars),
                Err(KtrdrError::NoData { .. }) => {
                    tracing::debug!(series = %key, %range, "provider returned no data");
                }
                Err(e @ KtrdrError::RateLimited(_)) => {
                    tracing::warn!(series = %key, %range, "rate limited, returning partial frame");
                    report.incomplete = true;
                    report.warnings.push(format!("rate limited at {range}: {e}"));
                    break;
                }
                Err(e @ KtrdrError::ConnectionLost(_)) => {
                    tracing::warn!(series = %key, %range, "connection lost mid-range, keeping fetched bars");
                    report.incomplete = true;
                    report.warnings.push(format!("connection lost at {range}: {e}"));
                    break;
                }
                Err(e) => return Err(e),
            }
        }
        Ok(fetched)
    }

    /// Per-symbol calendar built from contract details, falling back to
    /// the default US-equity calendar when the provider cannot answer.
    async fn calendar_for(&self, symbol: &Symbol) -> TradingCalendar {
        if let Some(cal) = self.calendars.lock().unwrap().get(symbol) {
            return cal.clone();
        }
        let calendar = match self.provider.contract_details(symbol).await {
            Ok(details) => TradingCalendar::new(details.trading_hours, details.holidays),
            Err(e) => {
                tracing::debug!(%symbol, "no contract details ({e}); using default calendar");
                TradingCalendar::default()
            }
        };
        self.calendars
            .lock()
            .unwrap()
            .insert(symbol.clone(), calendar.clone());
        calendar
    }
}
