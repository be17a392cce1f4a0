pub mod engine;
pub mod execution;
pub mod metrics;
pub mod models;

#[cfg(test)]
mod tests;

pub use engine::BacktestEngine;
pub use models::{
    BacktestConfig, BacktestResult, CommissionModel, EquityPoint, OrderKind, PerformanceMetrics,
    PositionState, SlippageModel, Trade,
};
