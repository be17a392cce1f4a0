use trading_core::{Bar, LabelConfig, LabelGenerator};

/// Class indices are stable: 0 = Down, 1 = Flat, 2 = Up.
pub const LABEL_CLASSES: [&str; 3] = ["down", "flat", "up"];

/// Generate one label per bar, or `None` where the horizon extends past
/// the end of the series (those rows are dropped by the feature builder).
pub fn generate(config: &LabelConfig, bars: &[Bar]) -> Vec<Option<usize>> {
    match config.generator {
        LabelGenerator::DirectionalMove => directional_move(
            bars,
            config.params.horizon,
            config.params.upper_threshold,
            config.params.lower_threshold,
        ),
    }
}

/// Fractional close-to-close move over `horizon` bars, classified by the
/// thresholds.
fn directional_move(
    bars: &[Bar],
    horizon: usize,
    upper: f64,
    lower: f64,
) -> Vec<Option<usize>> {
    bars.iter()
        .enumerate()
        .map(|(i, bar)| {
            let target = bars.get(i + horizon)?;
            if bar.close == 0.0 {
                return None;
            }
            let ret = (target.close - bar.close) / bar.close;
            Some(if ret >= upper {
                2
            } else if ret <= lower {
                0
            } else {
                1
            })
        })
        .collect()
}
