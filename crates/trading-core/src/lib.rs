pub mod config;
pub mod context;
pub mod error;
pub mod progress;
pub mod provider;
pub mod result;
pub mod store;
pub mod types;

pub use config::{
    Activation, EarlyStopping, FeatureConfig, FuzzyKind, FuzzyScale, FuzzySetConfig,
    IndicatorConfig, LabelConfig, LabelGenerator, LabelParams, ModelConfig, Optimizer,
    PositionSizing, RiskConfig, RulesConfig, SplitKind, StrategyConfig, TrainingConfig,
    PRICE_COLUMNS,
};
pub use context::{Clock, CoreContext, FixedClock, SystemClock};
pub use error::{ErrorInfo, ErrorKind, KtrdrError};
pub use progress::{CancelToken, ProgressCallback, ProgressKind, ProgressMetrics, ProgressUpdate};
pub use provider::{ContractDetails, MarketDataProvider, ProviderStatus, TradingHours};
pub use result::{
    ClassMetrics, DataSummary, EpochRecord, ModelInfo, ResourceUsage, RunArtifacts, RunStatus,
    SessionInfo, TestMetrics, TrainingMetrics, TrainingRunResult,
};
pub use store::{validate_bar_batch, IndicatorRow, TimeSeriesStore};
pub use types::{
    Bar, BarSource, Gap, GapKind, QualityReport, SeriesKey, Symbol, TimeRange, Timeframe,
};

/// Initialize a global tracing subscriber driven by `RUST_LOG`.
///
/// Safe to call more than once; subsequent calls are no-ops.
pub fn init_tracing() {
    use tracing_subscriber::EnvFilter;

    let _ = tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .try_init();
}
