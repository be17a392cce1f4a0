pub mod frame;
pub mod indicators;
pub mod registry;

pub use frame::{is_defined, params_hash, IndicatorFrame, UNDEFINED};
pub use registry::{compute_indicator, lookup, resolve_params, warmup, IndicatorSpec, REGISTRY};

use trading_core::{Bar, IndicatorConfig, KtrdrError};

/// Pure, stateless indicator computation over one symbol's bar series.
///
/// Input is always a single `(symbol, timeframe)` series; callers doing
/// multi-symbol work invoke the engine once per symbol, which is what
/// resets rolling state at symbol boundaries.
pub struct IndicatorEngine;

impl IndicatorEngine {
    /// Compute every configured indicator into one frame aligned with
    /// `bars`. Warm-up rows are undefined sentinels, never zero.
    pub fn compute(configs: &[IndicatorConfig], bars: &[Bar]) -> Result<IndicatorFrame, KtrdrError> {
        let ts = bars.iter().map(|b| b.ts).collect();
        let mut frame = IndicatorFrame::new(ts);
        for config in configs {
            frame.merge(compute_indicator(config, bars)?);
        }
        Ok(frame)
    }
}
