use indicator_engine::{is_defined, IndicatorFrame, UNDEFINED};
use trading_core::{Bar, FuzzyKind, FuzzyScale, FuzzySetConfig, KtrdrError};

/// Fuzzy membership columns share the aligned column-frame representation
/// with indicators; values are in `[0, 1]` or undefined.
pub type FuzzyFrame = IndicatorFrame;

/// One triangular membership function over a named input column.
#[derive(Debug, Clone, PartialEq)]
pub struct TriangularSet {
    pub name: String,
    pub input: String,
    pub a: f64,
    pub b: f64,
    pub c: f64,
    pub scale: FuzzyScale,
}

impl TriangularSet {
    pub fn from_config(config: &FuzzySetConfig) -> Result<Self, KtrdrError> {
        match config.kind {
            FuzzyKind::Triangular => {}
        }
        if config.params.len() != 3 {
            return Err(KtrdrError::config(
                format!("fuzzy_sets[{}].params", config.name),
                "triangular sets take [a, b, c]",
            ));
        }
        let (a, b, c) = (config.params[0], config.params[1], config.params[2]);
        if !(a <= b && b <= c) {
            return Err(KtrdrError::config(
                format!("fuzzy_sets[{}].params", config.name),
                format!("require a <= b <= c, got [{a}, {b}, {c}]"),
            ));
        }
        Ok(Self {
            name: config.name.clone(),
            input: config.input.clone(),
            a,
            b,
            c,
            scale: config.scale,
        })
    }

    /// Membership of a single value. Undefined inputs stay undefined; a
    /// degenerate edge (`a == b` or `b == c`) evaluates as a shoulder.
    pub fn membership(&self, x: f64) -> f64 {
        if !is_defined(x) {
            return UNDEFINED;
        }
        let x = match self.scale {
            FuzzyScale::Linear => x,
            FuzzyScale::Log => {
                if x <= 0.0 {
                    return UNDEFINED;
                }
                x.ln()
            }
        };
        let (a, b, c) = (self.a, self.b, self.c);

        let value = if a == b && x <= b {
            // Left shoulder: saturated at and below the peak.
            1.0
        } else if b == c && x >= b {
            // Right shoulder: saturated at and above the peak.
            1.0
        } else if x < a || x > c {
            0.0
        } else if x < b {
            (x - a) / (b - a)
        } else if x == b {
            1.0
        } else {
            (c - x) / (c - b)
        };
        value.clamp(0.0, 1.0)
    }
}

/// Evaluates a family of fuzzy sets over indicator and price columns.
pub struct FuzzyEngine {
    sets: Vec<TriangularSet>,
}

impl FuzzyEngine {
    pub fn from_config(configs: &[FuzzySetConfig]) -> Result<Self, KtrdrError> {
        let sets = configs
            .iter()
            .map(TriangularSet::from_config)
            .collect::<Result<Vec<_>, _>>()?;
        Ok(Self { sets })
    }

    pub fn set_names(&self) -> impl Iterator<Item = &str> {
        self.sets.iter().map(|s| s.name.as_str())
    }

    /// Produce one membership column per set, aligned with the inputs.
    /// Sets may share an input; memberships are independent of each other
    /// (no partition-of-unity constraint).
    pub fn fuzzify(
        &self,
        indicators: &IndicatorFrame,
        bars: &[Bar],
    ) -> Result<FuzzyFrame, KtrdrError> {
        let mut out = FuzzyFrame::new(indicators.ts.clone());
        for set in &self.sets {
            let inputs = resolve_input(&set.input, indicators, bars)?;
            let memberships: Vec<f64> = inputs.iter().map(|&x| set.membership(x)).collect();
            out.insert(set.name.clone(), memberships);
        }
        Ok(out)
    }
}

/// An input column is either a price column of the bar series or an
/// indicator column of the frame.
fn resolve_input(
    input: &str,
    indicators: &IndicatorFrame,
    bars: &[Bar],
) -> Result<Vec<f64>, KtrdrError> {
    if let Some(column) = indicators.column(input) {
        return Ok(column.to_vec());
    }
    let extract: Option<fn(&Bar) -> f64> = match input {
        "open" => Some(|b| b.open),
        "high" => Some(|b| b.high),
        "low" => Some(|b| b.low),
        "close" => Some(|b| b.close),
        "volume" => Some(|b| b.volume),
        _ => None,
    };
    match extract {
        Some(f) => Ok(bars.iter().map(f).collect()),
        None => Err(KtrdrError::config(
            format!("fuzzy input '{input}'"),
            "does not resolve to an indicator or price column",
        )),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{DateTime, Duration, Utc};
    use trading_core::BarSource;

    fn set(a: f64, b: f64, c: f64) -> TriangularSet {
        TriangularSet {
            name: "t".to_string(),
            input: "x".to_string(),
            a,
            b,
            c,
            scale: FuzzyScale::Linear,
        }
    }

    #[test]
    fn triangle_reference_vector() {
        // {a=30, b=50, c=70} over [20,30,40,50,60,70,80].
        let s = set(30.0, 50.0, 70.0);
        let inputs = [20.0, 30.0, 40.0, 50.0, 60.0, 70.0, 80.0];
        let expected = [0.0, 0.0, 0.5, 1.0, 0.5, 0.0, 0.0];
        for (x, want) in inputs.iter().zip(expected) {
            assert_eq!(s.membership(*x), want, "mu({x})");
        }
    }

    #[test]
    fn left_shoulder_when_a_equals_b() {
        let s = set(30.0, 30.0, 70.0);
        assert_eq!(s.membership(30.0), 1.0);
        assert_eq!(s.membership(50.0), 0.5);
        assert_eq!(s.membership(70.0), 0.0);
        // Saturated below the peak, not clipped to the support edge.
        assert_eq!(s.membership(10.0), 1.0);
    }

    #[test]
    fn right_shoulder_when_b_equals_c() {
        let s = set(30.0, 70.0, 70.0);
        assert_eq!(s.membership(70.0), 1.0);
        assert_eq!(s.membership(90.0), 1.0);
        assert_eq!(s.membership(50.0), 0.5);
        assert_eq!(s.membership(20.0), 0.0);
    }

    #[test]
    fn undefined_input_stays_undefined() {
        let s = set(0.0, 50.0, 100.0);
        assert!(s.membership(UNDEFINED).is_nan());
    }

    #[test]
    fn log_scale_rejects_non_positive() {
        let mut s = set(0.0, 5.0, 10.0);
        s.scale = FuzzyScale::Log;
        assert!(s.membership(-1.0).is_nan());
        assert!(s.membership(0.0).is_nan());
        // ln(e^5) = 5 = b.
        assert_eq!(s.membership(5.0_f64.exp()), 1.0);
    }

    #[test]
    fn fuzzify_over_indicator_and_price_columns() {
        let start = "2024-01-01T00:00:00Z".parse::<DateTime<Utc>>().unwrap();
        let bars: Vec<Bar> = (0..4)
            .map(|i| Bar {
                ts: start + Duration::days(i),
                open: 10.0,
                high: 11.0,
                low: 9.0,
                close: 10.0 + i as f64,
                volume: 100.0,
                source: BarSource::Broker,
            })
            .collect();
        let mut indicators = IndicatorFrame::new(bars.iter().map(|b| b.ts).collect());
        indicators.insert("rsi", vec![UNDEFINED, 30.0, 50.0, 70.0]);

        let configs = vec![
            FuzzySetConfig {
                input: "rsi".to_string(),
                name: "rsi_mid".to_string(),
                kind: FuzzyKind::Triangular,
                params: vec![30.0, 50.0, 70.0],
                scale: FuzzyScale::Linear,
            },
            FuzzySetConfig {
                input: "close".to_string(),
                name: "cheap".to_string(),
                kind: FuzzyKind::Triangular,
                params: vec![0.0, 10.0, 12.0],
                scale: FuzzyScale::Linear,
            },
        ];
        let engine = FuzzyEngine::from_config(&configs).unwrap();
        let frame = engine.fuzzify(&indicators, &bars).unwrap();

        let rsi_mid = frame.column("rsi_mid").unwrap();
        assert!(rsi_mid[0].is_nan()); // warm-up propagates
        assert_eq!(rsi_mid[1], 0.0);
        assert_eq!(rsi_mid[2], 1.0);
        assert_eq!(rsi_mid[3], 0.0);

        let cheap = frame.column("cheap").unwrap();
        assert_eq!(cheap[0], 1.0); // close = 10 = b
        assert_eq!(cheap[1], 0.5); // close = 11
        assert_eq!(cheap[2], 0.0); // close = 12 = c
    }
}
