use chrono::{DateTime, Utc};
use std::collections::BTreeMap;

use trading_core::{Bar, BarSource};

/// Merge freshly fetched rows into the local set by timestamp. Upstream
/// rows always replace prior `Synthetic`/`Repaired` rows; overlapping
/// broker rows are replaced wholesale as well, matching upsert semantics.
pub fn merge_bars(local: Vec<Bar>, fetched: Vec<Bar>) -> Vec<Bar> {
    let mut by_ts: BTreeMap<DateTime<Utc>, Bar> =
        local.into_iter().map(|b| (b.ts, b)).collect();
    for bar in fetched {
        by_ts.insert(bar.ts, bar);
    }
    by_ts.into_values().collect()
}

/// Smooth zero-volume doji bars: a bar with no volume whose OHLC collapsed
/// to a single price is treated as a synthetic fill and flattened onto the
/// previous close. Returns the number of repaired rows.
pub fn smooth_zero_volume_dojis(bars: &mut [Bar]) -> usize {
    let mut repaired = 0;
    for i in 1..bars.len() {
        let prev_close = bars[i - 1].close;
        let bar = &mut bars[i];
        let is_doji = bar.volume == 0.0
            && bar.open == bar.high
            && bar.high == bar.low
            && bar.low == bar.close;
        if is_doji && bar.close != prev_close {
            bar.open = prev_close;
            bar.high = prev_close;
            bar.low = prev_close;
            bar.close = prev_close;
            bar.source = BarSource::Repaired;
            repaired += 1;
        }
    }
    repaired
}
