use std::collections::BTreeMap;

use trading_core::{Bar, IndicatorConfig, KtrdrError};

use crate::frame::IndicatorFrame;
use crate::indicators;

#[derive(Debug, Clone, Copy)]
pub enum ParamKind {
    /// Integer period-like parameter; non-integer JSON numbers are rejected.
    Int { min: i64, max: i64, default: i64 },
    Float { min: f64, max: f64, default: f64 },
}

#[derive(Debug, Clone, Copy)]
pub struct ParamSpec {
    pub name: &'static str,
    pub kind: ParamKind,
}

/// One registry entry: what an indicator consumes and produces.
#[derive(Debug, Clone, Copy)]
pub struct IndicatorSpec {
    pub name: &'static str,
    pub inputs: &'static [&'static str],
    pub params: &'static [ParamSpec],
    /// Empty for single-column indicators (column named after the
    /// indicator); field names for multi-output ones (`name.field`).
    pub outputs: &'static [&'static str],
}

const PERIOD: ParamSpec = ParamSpec {
    name: "period",
    kind: ParamKind::Int {
        min: 1,
        max: 5_000,
        default: 14,
    },
};

pub const REGISTRY: &[IndicatorSpec] = &[
    IndicatorSpec {
        name: "sma",
        inputs: &["close"],
        params: &[PERIOD],
        outputs: &[],
    },
    IndicatorSpec {
        name: "ema",
        inputs: &["close"],
        params: &[PERIOD],
        outputs: &[],
    },
    IndicatorSpec {
        name: "rsi",
        inputs: &["close"],
        params: &[PERIOD],
        outputs: &[],
    },
    IndicatorSpec {
        name: "macd",
        inputs: &["close"],
        params: &[
            ParamSpec {
                name: "fast",
                kind: ParamKind::Int {
                    min: 1,
                    max: 5_000,
                    default: 12,
                },
            },
            ParamSpec {
                name: "slow",
                kind: ParamKind::Int {
                    min: 1,
                    max: 5_000,
                    default: 26,
                },
            },
            ParamSpec {
                name: "signal",
                kind: ParamKind::Int {
                    min: 1,
                    max: 5_000,
                    default: 9,
                },
            },
        ],
        outputs: &["line", "signal", "histogram"],
    },
    IndicatorSpec {
        name: "bollinger",
        inputs: &["close"],
        params: &[
            ParamSpec {
                name: "period",
                kind: ParamKind::Int {
                    min: 2,
                    max: 5_000,
                    default: 20,
                },
            },
            ParamSpec {
                name: "k",
                kind: ParamKind::Float {
                    min: 0.1,
                    max: 10.0,
                    default: 2.0,
                },
            },
        ],
        outputs: &["middle", "upper", "lower"],
    },
    IndicatorSpec {
        name: "atr",
        inputs: &["high", "low", "close"],
        params: &[PERIOD],
        outputs: &[],
    },
    IndicatorSpec {
        name: "stochastic",
        inputs: &["high", "low", "close"],
        params: &[
            ParamSpec {
                name: "k_period",
                kind: ParamKind::Int {
                    min: 1,
                    max: 5_000,
                    default: 14,
                },
            },
            ParamSpec {
                name: "d_period",
                kind: ParamKind::Int {
                    min: 1,
                    max: 5_000,
                    default: 3,
                },
            },
        ],
        outputs: &["k", "d"],
    },
    IndicatorSpec {
        name: "roc",
        inputs: &["close"],
        params: &[ParamSpec {
            name: "period",
            kind: ParamKind::Int {
                min: 1,
                max: 5_000,
                default: 10,
            },
        }],
        outputs: &[],
    },
    IndicatorSpec {
        name: "obv",
        inputs: &["close", "volume"],
        params: &[],
        outputs: &[],
    },
    IndicatorSpec {
        name: "williams_r",
        inputs: &["high", "low", "close"],
        params: &[PERIOD],
        outputs: &[],
    },
];

pub fn lookup(name: &str) -> Option<&'static IndicatorSpec> {
    REGISTRY.iter().find(|spec| spec.name == name)
}

/// Validated parameter bag for one indicator instance.
#[derive(Debug)]
pub struct ResolvedParams {
    values: BTreeMap<&'static str, f64>,
}

impl ResolvedParams {
    pub fn int(&self, name: &str) -> usize {
        self.values[name] as usize
    }

    pub fn float(&self, name: &str) -> f64 {
        self.values[name]
    }
}

/// Validate raw config params against the spec's schema. Unknown keys,
/// out-of-range values and non-integer periods are Config errors naming
/// the exact field.
pub fn resolve_params(
    spec: &IndicatorSpec,
    raw: &BTreeMap<String, serde_json::Value>,
) -> Result<ResolvedParams, KtrdrError> {
    let path = |param: &str| format!("indicators[{}].params.{param}", spec.name);

    for key in raw.keys() {
        if !spec.params.iter().any(|p| p.name == key) {
            return Err(KtrdrError::config(
                path(key),
                format!("unknown parameter for '{}'", spec.name),
            ));
        }
    }

    let mut values = BTreeMap::new();
    for param in spec.params {
        match param.kind {
            ParamKind::Int { min, max, default } => {
                let value = match raw.get(param.name) {
                    None => default,
                    Some(v) => v.as_i64().ok_or_else(|| {
                        KtrdrError::config(
                            path(param.name),
                            format!("must be an integer, got {v}"),
                        )
                    })?,
                };
                if value < min || value > max {
                    return Err(KtrdrError::config(
                        path(param.name),
                        format!("must be in [{min}, {max}], got {value}"),
                    ));
                }
                values.insert(param.name, value as f64);
            }
            ParamKind::Float { min, max, default } => {
                let value = match raw.get(param.name) {
                    None => default,
                    Some(v) => v.as_f64().ok_or_else(|| {
                        KtrdrError::config(path(param.name), format!("must be a number, got {v}"))
                    })?,
                };
                if !value.is_finite() || value < min || value > max {
                    return Err(KtrdrError::config(
                        path(param.name),
                        format!("must be in [{min}, {max}], got {value}"),
                    ));
                }
                values.insert(param.name, value);
            }
        }
    }
    Ok(ResolvedParams { values })
}

/// Bars an indicator needs before its first defined output.
pub fn warmup(config: &IndicatorConfig) -> Result<usize, KtrdrError> {
    let spec = lookup(&config.name).ok_or_else(|| {
        KtrdrError::config(
            format!("indicators[{}].name", config.name),
            "unknown indicator",
        )
    })?;
    let params = resolve_params(spec, &config.params)?;
    Ok(match spec.name {
        "sma" | "ema" | "atr" | "williams_r" => params.int("period") - 1,
        "rsi" | "roc" => params.int("period"),
        "macd" => params.int("slow") + params.int("signal") - 2,
        "bollinger" => params.int("period") - 1,
        "stochastic" => params.int("k_period") + params.int("d_period") - 2,
        "obv" => 0,
        _ => 0,
    })
}

/// Compute one configured indicator over a single-symbol bar series.
pub fn compute_indicator(
    config: &IndicatorConfig,
    bars: &[Bar],
) -> Result<IndicatorFrame, KtrdrError> {
    let spec = lookup(&config.name).ok_or_else(|| {
        KtrdrError::config(
            format!("indicators[{}].name", config.name),
            "unknown indicator",
        )
    })?;
    let params = resolve_params(spec, &config.params)?;

    let closes: Vec<f64> = bars.iter().map(|b| b.close).collect();
    let ts = bars.iter().map(|b| b.ts).collect();
    let mut frame = IndicatorFrame::new(ts);

    match spec.name {
        "sma" => frame.insert("sma", indicators::sma(&closes, params.int("period"))),
        "ema" => frame.insert("ema", indicators::ema(&closes, params.int("period"))),
        "rsi" => frame.insert("rsi", indicators::rsi(&closes, params.int("period"))),
        "macd" => {
            let out = indicators::macd(
                &closes,
                params.int("fast"),
                params.int("slow"),
                params.int("signal"),
            );
            frame.insert("macd.line", out.line);
            frame.insert("macd.signal", out.signal);
            frame.insert("macd.histogram", out.histogram);
        }
        "bollinger" => {
            let out = indicators::bollinger(&closes, params.int("period"), params.float("k"));
            frame.insert("bollinger.middle", out.middle);
            frame.insert("bollinger.upper", out.upper);
            frame.insert("bollinger.lower", out.lower);
        }
        "atr" => frame.insert("atr", indicators::atr(bars, params.int("period"))),
        "stochastic" => {
            let out =
                indicators::stochastic(bars, params.int("k_period"), params.int("d_period"));
            frame.insert("stochastic.k", out.k);
            frame.insert("stochastic.d", out.d);
        }
        "roc" => frame.insert("roc", indicators::roc(&closes, params.int("period"))),
        "obv" => frame.insert("obv", indicators::obv(bars)),
        "williams_r" => {
            frame.insert("williams_r", indicators::williams_r(bars, params.int("period")))
        }
        other => {
            return Err(KtrdrError::config(
                format!("indicators[{other}].name"),
                "unknown indicator",
            ))
        }
    }
    Ok(frame)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn raw(pairs: &[(&str, serde_json::Value)]) -> BTreeMap<String, serde_json::Value> {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.clone()))
            .collect()
    }

    #[test]
    fn rejects_non_integer_period() {
        let spec = lookup("rsi").unwrap();
        let err = resolve_params(spec, &raw(&[("period", json!(14.5))])).unwrap_err();
        assert!(err.to_string().contains("must be an integer"), "{err}");
        assert!(err.to_string().contains("indicators[rsi].params.period"));
    }

    #[test]
    fn rejects_out_of_range_period() {
        let spec = lookup("sma").unwrap();
        let err = resolve_params(spec, &raw(&[("period", json!(0))])).unwrap_err();
        assert!(err.to_string().contains("must be in [1, 5000]"), "{err}");
    }

    #[test]
    fn rejects_unknown_parameter() {
        let spec = lookup("sma").unwrap();
        let err = resolve_params(spec, &raw(&[("window", json!(10))])).unwrap_err();
        assert!(err.to_string().contains("unknown parameter"), "{err}");
    }

    #[test]
    fn defaults_apply_when_params_omitted() {
        let spec = lookup("macd").unwrap();
        let params = resolve_params(spec, &BTreeMap::new()).unwrap();
        assert_eq!(params.int("fast"), 12);
        assert_eq!(params.int("slow"), 26);
        assert_eq!(params.int("signal"), 9);
    }

    #[test]
    fn warmup_formulas() {
        let config = |name: &str, pairs: &[(&str, serde_json::Value)]| IndicatorConfig {
            name: name.to_string(),
            params: raw(pairs),
        };
        assert_eq!(warmup(&config("sma", &[("period", json!(20))])).unwrap(), 19);
        assert_eq!(warmup(&config("rsi", &[("period", json!(14))])).unwrap(), 14);
        assert_eq!(warmup(&config("macd", &[])).unwrap(), 33);
        assert_eq!(warmup(&config("obv", &[])).unwrap(), 0);
    }
}
