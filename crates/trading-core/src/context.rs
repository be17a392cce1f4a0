use chrono::{DateTime, Utc};
use std::path::PathBuf;
use std::sync::Arc;

use crate::provider::MarketDataProvider;
use crate::store::TimeSeriesStore;

/// Time source. Production code uses `SystemClock`; tests inject a
/// `FixedClock` so "now"-relative logic is deterministic.
pub trait Clock: Send + Sync {
    fn now(&self) -> DateTime<Utc>;
}

#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }
}

#[derive(Debug, Clone, Copy)]
pub struct FixedClock(pub DateTime<Utc>);

impl Clock for FixedClock {
    fn now(&self) -> DateTime<Utc> {
        self.0
    }
}

/// Explicitly constructed runtime wiring handed to orchestrators and
/// pipeline entry points. There is no process-wide state besides the
/// connection pool owned by the store adapter.
#[derive(Clone)]
pub struct CoreContext {
    pub store: Arc<dyn TimeSeriesStore>,
    pub provider: Arc<dyn MarketDataProvider>,
    pub model_dir: PathBuf,
    pub clock: Arc<dyn Clock>,
}

impl CoreContext {
    pub fn new(
        store: Arc<dyn TimeSeriesStore>,
        provider: Arc<dyn MarketDataProvider>,
        model_dir: impl Into<PathBuf>,
    ) -> Self {
        Self {
            store,
            provider,
            model_dir: model_dir.into(),
            clock: Arc::new(SystemClock),
        }
    }

    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }
}
