use chrono::{DateTime, Datelike, Duration, Months, NaiveDate, TimeZone, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use crate::error::KtrdrError;

/// Where a persisted bar came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BarSource {
    /// Fetched from the upstream broker gateway.
    Broker,
    /// Generated locally (e.g. grid fill for an illiquid session).
    Synthetic,
    /// Locally repaired (e.g. zero-volume doji smoothing).
    Repaired,
}

impl Default for BarSource {
    fn default() -> Self {
        BarSource::Broker
    }
}

/// OHLCV bar data, always stamped with a UTC instant aligned to its
/// timeframe grid.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Bar {
    pub ts: DateTime<Utc>,
    pub open: f64,
    pub high: f64,
    pub low: f64,
    pub close: f64,
    pub volume: f64,
    #[serde(default)]
    pub source: BarSource,
}

impl Bar {
    /// Check the OHLC containment invariant, non-negative volume and
    /// finiteness of every field.
    pub fn validate(&self) -> Result<(), KtrdrError> {
        let fields = [self.open, self.high, self.low, self.close, self.volume];
        if fields.iter().any(|v| !v.is_finite()) {
            return Err(KtrdrError::DataIntegrity(format!(
                "non-finite value in bar at {}",
                self.ts
            )));
        }
        let body_low = self.open.min(self.close);
        let body_high = self.open.max(self.close);
        if !(self.low <= body_low && body_high <= self.high) {
            return Err(KtrdrError::DataIntegrity(format!(
                "OHLC invariant violated at {}: o={} h={} l={} c={}",
                self.ts, self.open, self.high, self.low, self.close
            )));
        }
        if self.volume < 0.0 {
            return Err(KtrdrError::DataIntegrity(format!(
                "negative volume at {}: {}",
                self.ts, self.volume
            )));
        }
        Ok(())
    }
}

/// Bar grid spacing.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum Timeframe {
    #[serde(rename = "1m")]
    Min1,
    #[serde(rename = "5m")]
    Min5,
    #[serde(rename = "15m")]
    Min15,
    #[serde(rename = "30m")]
    Min30,
    #[serde(rename = "1h")]
    Hour1,
    #[serde(rename = "2h")]
    Hour2,
    #[serde(rename = "4h")]
    Hour4,
    #[serde(rename = "1d")]
    Day1,
    #[serde(rename = "1w")]
    Week1,
    #[serde(rename = "1M")]
    Month1,
}

impl Timeframe {
    pub fn as_str(&self) -> &'static str {
        match self {
            Timeframe::Min1 => "1m",
            Timeframe::Min5 => "5m",
            Timeframe::Min15 => "15m",
            Timeframe::Min30 => "30m",
            Timeframe::Hour1 => "1h",
            Timeframe::Hour2 => "2h",
            Timeframe::Hour4 => "4h",
            Timeframe::Day1 => "1d",
            Timeframe::Week1 => "1w",
            Timeframe::Month1 => "1M",
        }
    }

    pub fn to_minutes(&self) -> i64 {
        match self {
            Timeframe::Min1 => 1,
            Timeframe::Min5 => 5,
            Timeframe::Min15 => 15,
            Timeframe::Min30 => 30,
            Timeframe::Hour1 => 60,
            Timeframe::Hour2 => 120,
            Timeframe::Hour4 => 240,
            Timeframe::Day1 => 1440,
            Timeframe::Week1 => 10080,
            // Nominal; month steps use calendar arithmetic, not this value.
            Timeframe::Month1 => 43200,
        }
    }

    /// True for grids finer than one day. Intraday grids are subject to
    /// trading-hours classification; daily and coarser grids are not.
    pub fn is_intraday(&self) -> bool {
        self.to_minutes() < 1440
    }

    /// Floor `ts` onto this grid.
    pub fn align_floor(&self, ts: DateTime<Utc>) -> DateTime<Utc> {
        match self {
            Timeframe::Week1 => {
                let date = ts.date_naive();
                let monday = date - Duration::days(date.weekday().num_days_from_monday() as i64);
                Utc.from_utc_datetime(&monday.and_hms_opt(0, 0, 0).unwrap())
            }
            Timeframe::Month1 => {
                let first = NaiveDate::from_ymd_opt(ts.year(), ts.month(), 1).unwrap();
                Utc.from_utc_datetime(&first.and_hms_opt(0, 0, 0).unwrap())
            }
            _ => {
                let step = self.to_minutes() * 60;
                let secs = ts.timestamp();
                Utc.timestamp_opt(secs - secs.rem_euclid(step), 0).unwrap()
            }
        }
    }

    /// Whether `ts` sits exactly on this grid.
    pub fn is_aligned(&self, ts: DateTime<Utc>) -> bool {
        self.align_floor(ts) == ts && ts.timestamp_subsec_nanos() == 0
    }

    /// The grid point immediately after `ts` (which must be aligned).
    pub fn next(&self, ts: DateTime<Utc>) -> DateTime<Utc> {
        match self {
            Timeframe::Month1 => ts + Months::new(1),
            _ => ts + Duration::minutes(self.to_minutes()),
        }
    }

    /// All grid points in `[t0, t1]`, starting at the first aligned point
    /// at or after `t0`.
    pub fn grid(&self, t0: DateTime<Utc>, t1: DateTime<Utc>) -> Vec<DateTime<Utc>> {
        let mut points = Vec::new();
        let mut ts = self.align_floor(t0);
        if ts < t0 {
            ts = self.next(ts);
        }
        while ts <= t1 {
            points.push(ts);
            ts = self.next(ts);
        }
        points
    }
}

impl fmt::Display for Timeframe {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Timeframe {
    type Err = KtrdrError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "1m" => Ok(Timeframe::Min1),
            "5m" => Ok(Timeframe::Min5),
            "15m" => Ok(Timeframe::Min15),
            "30m" => Ok(Timeframe::Min30),
            "1h" => Ok(Timeframe::Hour1),
            "2h" => Ok(Timeframe::Hour2),
            "4h" => Ok(Timeframe::Hour4),
            "1d" => Ok(Timeframe::Day1),
            "1w" => Ok(Timeframe::Week1),
            "1M" => Ok(Timeframe::Month1),
            other => Err(KtrdrError::Config {
                path: "timeframe".to_string(),
                message: format!("unknown timeframe '{other}'"),
            }),
        }
    }
}

/// Validated instrument symbol: non-empty printable ASCII, at most 32 chars.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct Symbol(String);

impl Symbol {
    pub const MAX_LEN: usize = 32;

    pub fn new(s: impl Into<String>) -> Result<Self, KtrdrError> {
        let s = s.into();
        if s.is_empty() || s.len() > Self::MAX_LEN {
            return Err(KtrdrError::Config {
                path: "symbol".to_string(),
                message: format!("symbol must be 1..={} chars, got {}", Self::MAX_LEN, s.len()),
            });
        }
        if !s.bytes().all(|b| b.is_ascii_graphic()) {
            return Err(KtrdrError::Config {
                path: "symbol".to_string(),
                message: format!("symbol '{s}' contains non-printable or non-ASCII characters"),
            });
        }
        Ok(Symbol(s))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl TryFrom<String> for Symbol {
    type Error = KtrdrError;

    fn try_from(s: String) -> Result<Self, Self::Error> {
        Symbol::new(s)
    }
}

impl From<Symbol> for String {
    fn from(s: Symbol) -> String {
        s.0
    }
}

impl fmt::Display for Symbol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl FromStr for Symbol {
    type Err = KtrdrError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Symbol::new(s)
    }
}

/// Primary partitioning identity for bar series.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct SeriesKey {
    pub symbol: Symbol,
    pub timeframe: Timeframe,
}

impl SeriesKey {
    pub fn new(symbol: Symbol, timeframe: Timeframe) -> Self {
        Self { symbol, timeframe }
    }
}

impl fmt::Display for SeriesKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.symbol, self.timeframe)
    }
}

/// Closed UTC time range `[start, end]`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct TimeRange {
    pub start: DateTime<Utc>,
    pub end: DateTime<Utc>,
}

impl TimeRange {
    pub fn new(start: DateTime<Utc>, end: DateTime<Utc>) -> Result<Self, KtrdrError> {
        if end < start {
            return Err(KtrdrError::Config {
                path: "range".to_string(),
                message: format!("range end {end} precedes start {start}"),
            });
        }
        Ok(Self { start, end })
    }

    pub fn contains(&self, ts: DateTime<Utc>) -> bool {
        self.start <= ts && ts <= self.end
    }

    pub fn duration(&self) -> Duration {
        self.end - self.start
    }
}

impl fmt::Display for TimeRange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}, {}]", self.start, self.end)
    }
}

/// Why a run of grid points is missing from a series.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum GapKind {
    Weekend,
    Holiday,
    OutsideTradingHours,
    /// A genuine hole in the data; the only kind that triggers a fetch.
    Data,
}

/// A maximal contiguous run of missing grid points.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Gap {
    pub start: DateTime<Utc>,
    pub end: DateTime<Utc>,
    pub kind: GapKind,
    /// Number of grid points the gap spans.
    pub points: usize,
}

/// Summary of a DataManager load: how much was served locally, fetched,
/// repaired, and what could not be filled.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct QualityReport {
    pub total: usize,
    pub fetched: usize,
    pub repaired: usize,
    pub remaining_gaps: Vec<Gap>,
    /// Set when a provider failure left the frame partially filled.
    pub incomplete: bool,
    pub warnings: Vec<String>,
}

impl QualityReport {
    pub fn is_complete(&self) -> bool {
        !self.incomplete && self.remaining_gaps.iter().all(|g| g.kind != GapKind::Data)
    }
}
