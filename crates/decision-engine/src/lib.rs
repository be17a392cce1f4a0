pub mod expr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::Arc;

use fuzzy_engine::FuzzyFrame;
use indicator_engine::{is_defined, IndicatorFrame};
use trading_core::{Bar, KtrdrError, RulesConfig, StrategyConfig};

use crate::expr::Expr;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SignalType {
    Entry,
    Exit,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Direction {
    Long,
    Short,
    Close,
}

/// Structured trace attached to every emitted signal: which rule fired,
/// the values its identifiers held, and the memberships involved.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SignalExplanation {
    pub rule: String,
    pub fired_values: BTreeMap<String, f64>,
    pub memberships: BTreeMap<String, f64>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Signal {
    pub signal_type: SignalType,
    pub direction: Direction,
    /// In `[0, 1]`; signals below the configured threshold are suppressed.
    pub strength: f64,
    pub timestamp: DateTime<Utc>,
    pub explanation: SignalExplanation,
}

/// Optional classifier hook. When present, signal strength comes from the
/// model's class probabilities instead of fuzzy aggregation.
pub trait ProbabilityModel: Send + Sync {
    /// Probabilities aligned with `classes()`.
    fn class_probabilities(&self, features: &[f64]) -> Vec<f64>;
    fn classes(&self) -> Vec<String>;
}

#[derive(Debug)]
struct CompiledRule {
    source: String,
    expr: Expr,
    /// Identifiers that name fuzzy membership columns.
    fuzzy_terms: Vec<String>,
}

/// Evaluates strategy rules over aligned (bar, indicator, fuzzy) rows and
/// emits explained signals.
pub struct DecisionEngine {
    entry: Vec<CompiledRule>,
    exit: Vec<CompiledRule>,
    signal_threshold: f64,
    model: Option<Arc<dyn ProbabilityModel>>,
}

impl std::fmt::Debug for DecisionEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DecisionEngine")
            .field("entry", &self.entry)
            .field("exit", &self.exit)
            .field("signal_threshold", &self.signal_threshold)
            .field("model", &self.model.as_ref().map(|_| "<ProbabilityModel>"))
            .finish()
    }
}

impl DecisionEngine {
    /// Compile the strategy's rule section. Unknown identifiers are
    /// config errors naming the exact rule; known columns are the price
    /// columns plus everything the indicator and fuzzy stages can emit.
    pub fn from_config(config: &StrategyConfig) -> Result<Self, KtrdrError> {
        let fuzzy_names: Vec<String> =
            config.fuzzy_sets.iter().map(|s| s.name.clone()).collect();
        let indicator_names: Vec<String> =
            config.indicators.iter().map(|i| i.name.clone()).collect();

        let compile_list = |rules: &[String], kind: &str| -> Result<Vec<CompiledRule>, KtrdrError> {
            rules
                .iter()
                .enumerate()
                .map(|(i, source)| {
                    let path = format!("rules.{kind}[{i}]");
                    let expr = expr::parse(source, &path)?;
                    for ident in expr.identifiers() {
                        let known = trading_core::PRICE_COLUMNS.contains(&ident.as_str())
                            || fuzzy_names.contains(&ident)
                            || indicator_names.contains(&ident)
                            || ident
                                .split_once('.')
                                .is_some_and(|(base, field)| {
                                    !field.is_empty() && indicator_names.contains(&base.to_string())
                                });
                        if !known {
                            return Err(KtrdrError::config(
                                path.clone(),
                                format!("unknown column '{ident}'"),
                            ));
                        }
                    }
                    let fuzzy_terms = expr
                        .identifiers()
                        .into_iter()
                        .filter(|ident| fuzzy_names.contains(ident))
                        .collect();
                    Ok(CompiledRule {
                        source: source.clone(),
                        expr,
                        fuzzy_terms,
                    })
                })
                .collect()
        };

        Ok(Self {
            entry: compile_list(&config.rules.entry, "entry")?,
            exit: compile_list(&config.rules.exit, "exit")?,
            signal_threshold: config.rules.signal_threshold,
            model: None,
        })
    }

    /// Compile a bare rules section (used by tests and the backtester's
    /// rule-only mode).
    pub fn from_rules(
        rules: &RulesConfig,
        known_columns: &[String],
        fuzzy_names: &[String],
    ) -> Result<Self, KtrdrError> {
        let compile_list = |list: &[String], kind: &str| -> Result<Vec<CompiledRule>, KtrdrError> {
            list.iter()
                .enumerate()
                .map(|(i, source)| {
                    let path = format!("rules.{kind}[{i}]");
                    let expr = expr::parse(source, &path)?;
                    for ident in expr.identifiers() {
                        if !known_columns.contains(&ident)
                            && !trading_core::PRICE_COLUMNS.contains(&ident.as_str())
                        {
                            return Err(KtrdrError::config(
                                path.clone(),
                                format!("unknown column '{ident}'"),
                            ));
                        }
                    }
                    let fuzzy_terms = expr
                        .identifiers()
                        .into_iter()
                        .filter(|ident| fuzzy_names.contains(ident))
                        .collect();
                    Ok(CompiledRule {
                        source: source.clone(),
                        expr,
                        fuzzy_terms,
                    })
                })
                .collect()
        };
        Ok(Self {
            entry: compile_list(&rules.entry, "entry")?,
            exit: compile_list(&rules.exit, "exit")?,
            signal_threshold: rules.signal_threshold,
            model: None,
        })
    }

    pub fn with_model(mut self, model: Arc<dyn ProbabilityModel>) -> Self {
        self.model = Some(model);
        self
    }

    /// Evaluate one aligned row and emit the surviving signals.
    pub fn on_row(
        &self,
        index: usize,
        bars: &[Bar],
        indicators: &IndicatorFrame,
        fuzzy: &FuzzyFrame,
    ) -> Vec<Signal> {
        let bar = &bars[index];
        let lookup = |name: &str| -> f64 {
            match name {
                "open" => bar.open,
                "high" => bar.high,
                "low" => bar.low,
                "close" => bar.close,
                "volume" => bar.volume,
                _ => indicators
                    .column(name)
                    .or_else(|| fuzzy.column(name))
                    .map(|c| c[index])
                    .unwrap_or(f64::NAN),
            }
        };

        let mut signals = Vec::new();
        for (rules, signal_type, direction) in [
            (&self.entry, SignalType::Entry, Direction::Long),
            (&self.exit, SignalType::Exit, Direction::Close),
        ] {
            for rule in rules.iter() {
                if !rule.expr.eval(&lookup) {
                    continue;
                }
                let strength = self.strength_for(rule, signal_type, &lookup);
                if strength < self.signal_threshold {
                    tracing::trace!(rule = %rule.source, strength, "signal below threshold");
                    continue;
                }
                let fired_values: BTreeMap<String, f64> = rule
                    .expr
                    .identifiers()
                    .into_iter()
                    .map(|ident| {
                        let value = lookup(&ident);
                        (ident, value)
                    })
                    .collect();
                let memberships: BTreeMap<String, f64> = rule
                    .fuzzy_terms
                    .iter()
                    .map(|name| (name.clone(), lookup(name)))
                    .collect();
                signals.push(Signal {
                    signal_type,
                    direction,
                    strength,
                    timestamp: bar.ts,
                    explanation: SignalExplanation {
                        rule: rule.source.clone(),
                        fired_values,
                        memberships,
                    },
                });
            }
        }
        signals
    }

    /// Evaluate every row of an aligned frame set.
    pub fn evaluate(
        &self,
        bars: &[Bar],
        indicators: &IndicatorFrame,
        fuzzy: &FuzzyFrame,
    ) -> Vec<Signal> {
        (0..bars.len())
            .flat_map(|i| self.on_row(i, bars, indicators, fuzzy))
            .collect()
    }

    /// Model class probability when a model is attached, otherwise the
    /// max membership across the rule's fuzzy terms (1.0 for rules that
    /// reference no fuzzy column).
    fn strength_for(
        &self,
        rule: &CompiledRule,
        signal_type: SignalType,
        lookup: &dyn Fn(&str) -> f64,
    ) -> f64 {
        if let Some(model) = &self.model {
            let features: Vec<f64> = rule.fuzzy_terms.iter().map(|name| lookup(name)).collect();
            let probs = model.class_probabilities(&features);
            let classes = model.classes();
            let target = match signal_type {
                SignalType::Entry => "up",
                SignalType::Exit => "down",
            };
            if let Some(idx) = classes.iter().position(|c| c == target) {
                return probs.get(idx).copied().unwrap_or(0.0).clamp(0.0, 1.0);
            }
        }
        let max_membership = rule
            .fuzzy_terms
            .iter()
            .map(|name| lookup(name))
            .filter(|v| is_defined(*v))
            .fold(f64::NEG_INFINITY, f64::max);
        if max_membership.is_finite() {
            max_membership.clamp(0.0, 1.0)
        } else {
            1.0
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;
    use indicator_engine::UNDEFINED;
    use trading_core::BarSource;

    fn bars(closes: &[f64]) -> Vec<Bar> {
        let start = "2024-01-01T00:00:00Z".parse::<DateTime<Utc>>().unwrap();
        closes
            .iter()
            .enumerate()
            .map(|(i, &close)| Bar {
                ts: start + Duration::days(i as i64),
                open: close,
                high: close + 1.0,
                low: close - 1.0,
                close,
                volume: 100.0,
                source: BarSource::Broker,
            })
            .collect()
    }

    fn frames(
        n: usize,
        rsi: Vec<f64>,
        rsi_low: Vec<f64>,
    ) -> (IndicatorFrame, FuzzyFrame) {
        let start = "2024-01-01T00:00:00Z".parse::<DateTime<Utc>>().unwrap();
        let ts: Vec<DateTime<Utc>> = (0..n).map(|i| start + Duration::days(i as i64)).collect();
        let mut indicators = IndicatorFrame::new(ts.clone());
        indicators.insert("rsi", rsi);
        let mut fuzzy = FuzzyFrame::new(ts);
        fuzzy.insert("rsi_low", rsi_low);
        (indicators, fuzzy)
    }

    fn engine(threshold: f64) -> DecisionEngine {
        let rules = RulesConfig {
            entry: vec!["rsi_low > 0.5".to_string()],
            exit: vec!["rsi > 70".to_string()],
            signal_threshold: threshold,
        };
        DecisionEngine::from_rules(
            &rules,
            &["rsi".to_string(), "rsi_low".to_string()],
            &["rsi_low".to_string()],
        )
        .unwrap()
    }

    #[test]
    fn entry_signal_carries_explanation() {
        let bars = bars(&[100.0, 101.0, 102.0]);
        let (indicators, fuzzy) = frames(
            3,
            vec![25.0, 28.0, 75.0],
            vec![0.9, 0.8, 0.0],
        );
        let signals = engine(0.3).evaluate(&bars, &indicators, &fuzzy);

        let entries: Vec<&Signal> = signals
            .iter()
            .filter(|s| s.signal_type == SignalType::Entry)
            .collect();
        assert_eq!(entries.len(), 2);
        let first = entries[0];
        assert_eq!(first.direction, Direction::Long);
        assert_eq!(first.strength, 0.9);
        assert_eq!(first.explanation.rule, "rsi_low > 0.5");
        assert_eq!(first.explanation.memberships["rsi_low"], 0.9);
        assert_eq!(first.explanation.fired_values["rsi_low"], 0.9);

        let exits: Vec<&Signal> = signals
            .iter()
            .filter(|s| s.signal_type == SignalType::Exit)
            .collect();
        assert_eq!(exits.len(), 1);
        assert_eq!(exits[0].direction, Direction::Close);
        assert_eq!(exits[0].timestamp, bars[2].ts);
    }

    #[test]
    fn threshold_suppresses_weak_signals() {
        let bars = bars(&[100.0]);
        let (indicators, fuzzy) = frames(1, vec![25.0], vec![0.6]);
        // Fires with membership 0.6; a 0.7 threshold suppresses it.
        assert_eq!(engine(0.7).evaluate(&bars, &indicators, &fuzzy).len(), 0);
        assert_eq!(engine(0.5).evaluate(&bars, &indicators, &fuzzy).len(), 1);
    }

    #[test]
    fn warmup_rows_never_fire() {
        let bars = bars(&[100.0, 101.0]);
        let (indicators, fuzzy) = frames(2, vec![UNDEFINED, 25.0], vec![UNDEFINED, 0.9]);
        let signals = engine(0.1).evaluate(&bars, &indicators, &fuzzy);
        assert_eq!(signals.len(), 1);
        assert_eq!(signals[0].timestamp, bars[1].ts);
    }

    #[test]
    fn unknown_rule_column_is_config_error() {
        let rules = RulesConfig {
            entry: vec!["vwap > 0".to_string()],
            exit: vec![],
            signal_threshold: 0.0,
        };
        let err = DecisionEngine::from_rules(&rules, &[], &[]).unwrap_err();
        assert!(err.to_string().contains("rules.entry[0]"), "{err}");
        assert!(err.to_string().contains("vwap"), "{err}");
    }

    #[test]
    fn compiles_rules_from_a_strategy_config() {
        let config = trading_core::StrategyConfig::from_yaml_str(
            r#"
name: rules-test
symbols: [AAPL]
timeframes: ["1d"]
indicators:
  - name: rsi
    params: { period: 14 }
  - name: macd
fuzzy_sets:
  - { input: rsi, name: rsi_low, kind: triangular, params: [0, 25, 45] }
features:
  include_fuzzy: [rsi_low]
labels:
  generator: directional_move
  params: { horizon: 3, upper_threshold: 0.01, lower_threshold: -0.01 }
model:
  architecture: mlp
  layers: [8]
training:
  epochs: 1
  batch_size: 8
  learning_rate: 0.001
  val_split: 0.2
  seed: 1
rules:
  entry: ["rsi_low > 0.5 and macd.line > macd.signal"]
  exit: ["rsi > 70"]
  signal_threshold: 0.25
"#,
        )
        .unwrap();
        assert!(DecisionEngine::from_config(&config).is_ok());

        let mut bad = config.clone();
        bad.rules.entry = vec!["momentum > 0".to_string()];
        let err = DecisionEngine::from_config(&bad).unwrap_err();
        assert!(err.to_string().contains("momentum"), "{err}");
    }

    struct ConstModel(Vec<f64>);

    impl ProbabilityModel for ConstModel {
        fn class_probabilities(&self, _features: &[f64]) -> Vec<f64> {
            self.0.clone()
        }
        fn classes(&self) -> Vec<String> {
            vec!["down".into(), "flat".into(), "up".into()]
        }
    }

    #[test]
    fn model_probability_overrides_fuzzy_strength() {
        let bars = bars(&[100.0]);
        let (indicators, fuzzy) = frames(1, vec![25.0], vec![0.6]);
        let engine = engine(0.1).with_model(Arc::new(ConstModel(vec![0.1, 0.1, 0.8])));
        let signals = engine.evaluate(&bars, &indicators, &fuzzy);
        let entry = signals
            .iter()
            .find(|s| s.signal_type == SignalType::Entry)
            .unwrap();
        assert_eq!(entry.strength, 0.8);
    }
}
