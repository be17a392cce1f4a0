use async_trait::async_trait;
use chrono::{NaiveDate, NaiveTime};
use serde::{Deserialize, Serialize};
use std::time::Duration;

use crate::error::KtrdrError;
use crate::types::{Bar, Symbol, TimeRange, Timeframe};

/// Default per-request timeout for historical bar requests.
pub const BAR_REQUEST_TIMEOUT: Duration = Duration::from_secs(30);
/// Default timeout for status checks; status must stay lightweight.
pub const STATUS_TIMEOUT: Duration = Duration::from_secs(5);
/// Minimum grace after session establishment before issuing requests.
pub const SYNC_GRACE: Duration = Duration::from_secs(2);
/// Maximum session (client id) retries before failing fast.
pub const MAX_SESSION_RETRIES: u32 = 3;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProviderStatus {
    Disconnected,
    Connecting,
    Connected,
    Degraded,
}

/// Regular trading session in UTC. `None` open/close means the instrument
/// trades around the clock.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TradingHours {
    pub open_utc: Option<NaiveTime>,
    pub close_utc: Option<NaiveTime>,
}

impl TradingHours {
    pub fn around_the_clock() -> Self {
        Self {
            open_utc: None,
            close_utc: None,
        }
    }

    pub fn session(open_utc: NaiveTime, close_utc: NaiveTime) -> Self {
        Self {
            open_utc: Some(open_utc),
            close_utc: Some(close_utc),
        }
    }

    /// Whether a UTC time-of-day falls inside the regular session.
    /// Handles sessions that wrap midnight.
    pub fn contains(&self, t: NaiveTime) -> bool {
        match (self.open_utc, self.close_utc) {
            (Some(open), Some(close)) => {
                if open <= close {
                    open <= t && t < close
                } else {
                    t >= open || t < close
                }
            }
            _ => true,
        }
    }
}

/// Instrument metadata from the upstream provider, consumed by gap
/// classification and symbol validation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ContractDetails {
    pub symbol: Symbol,
    pub exchange: String,
    pub currency: String,
    pub trading_hours: TradingHours,
    /// Full-day market holidays on the instrument's primary exchange.
    #[serde(default)]
    pub holidays: Vec<NaiveDate>,
}

/// Upstream source of historical bars. Implementations must observe the
/// pacing discipline documented on `fetch_bars` — callers never bypass it.
#[async_trait]
pub trait MarketDataProvider: Send + Sync {
    /// Fetch historical bars for `[range.start, range.end]`.
    ///
    /// Implementations bound in-flight requests and, on a pacing
    /// violation, back off exponentially with full jitter (base 1s,
    /// cap 60s) before surfacing `RateLimited`.
    async fn fetch_bars(
        &self,
        symbol: &Symbol,
        timeframe: Timeframe,
        range: TimeRange,
    ) -> Result<Vec<Bar>, KtrdrError>;

    async fn contract_details(&self, symbol: &Symbol) -> Result<ContractDetails, KtrdrError>;

    /// Establish a session. Returns only after the provider's
    /// synchronization-complete signal (with at least `SYNC_GRACE`).
    async fn connect(&self) -> Result<(), KtrdrError>;

    async fn disconnect(&self) -> Result<(), KtrdrError>;

    /// Lightweight health check; must not issue heavy calls.
    async fn status(&self) -> ProviderStatus;

    /// Provider name for logging.
    fn provider_name(&self) -> &str;
}
