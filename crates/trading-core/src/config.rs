use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::path::Path;

use crate::error::KtrdrError;
use crate::types::{Symbol, Timeframe};

/// Bar columns that indicator inputs and fuzzy inputs may reference
/// directly, without going through an indicator.
pub const PRICE_COLUMNS: &[&str] = &["open", "high", "low", "close", "volume"];

/// Declarative strategy description. Unknown keys anywhere in the document
/// are rejected at parse time.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct StrategyConfig {
    pub name: String,
    pub symbols: Vec<Symbol>,
    pub timeframes: Vec<Timeframe>,
    pub indicators: Vec<IndicatorConfig>,
    #[serde(default)]
    pub fuzzy_sets: Vec<FuzzySetConfig>,
    pub features: FeatureConfig,
    pub labels: LabelConfig,
    pub model: ModelConfig,
    pub training: TrainingConfig,
    #[serde(default)]
    pub risk: RiskConfig,
    #[serde(default)]
    pub rules: RulesConfig,
}

/// One indicator instance. `name` identifies the registry entry ("rsi",
/// "sma", ...) and must be unique within a strategy; multi-output
/// indicators expose columns as `name.field` (e.g. `macd.line`).
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct IndicatorConfig {
    pub name: String,
    #[serde(default)]
    pub params: BTreeMap<String, serde_json::Value>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FuzzyKind {
    Triangular,
}

/// How the raw input is transformed before membership evaluation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum FuzzyScale {
    #[default]
    Linear,
    /// Natural log of the input; non-positive inputs become undefined.
    Log,
}

/// One fuzzy set over an indicator column or price column.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct FuzzySetConfig {
    pub input: String,
    pub name: String,
    pub kind: FuzzyKind,
    /// Triangular: `[a, b, c]` with `a <= b <= c`.
    pub params: Vec<f64>,
    #[serde(default)]
    pub scale: FuzzyScale,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct FeatureConfig {
    #[serde(default)]
    pub include_indicators: Vec<String>,
    #[serde(default)]
    pub include_fuzzy: Vec<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LabelGenerator {
    /// Directional move of `close` over `horizon` bars, classified by the
    /// upper/lower thresholds into Down / Flat / Up.
    DirectionalMove,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct LabelParams {
    pub horizon: usize,
    /// Fractional return at or above which the row is labeled Up.
    pub upper_threshold: f64,
    /// Fractional return at or below which the row is labeled Down.
    pub lower_threshold: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct LabelConfig {
    pub generator: LabelGenerator,
    pub params: LabelParams,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum Activation {
    #[default]
    Relu,
    Tanh,
    Sigmoid,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum Optimizer {
    Sgd,
    #[default]
    Adam,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ModelConfig {
    /// Only "mlp" is recognized.
    pub architecture: String,
    /// Hidden layer widths, input to output order.
    pub layers: Vec<usize>,
    #[serde(default)]
    pub dropout: f64,
    #[serde(default)]
    pub activation: Activation,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum SplitKind {
    /// Chronological train/val/test partition. The safe default.
    #[default]
    TimeOrdered,
    /// Seeded random partition; opt-in, carries temporal-leakage risk.
    Random,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct EarlyStopping {
    pub patience: usize,
    #[serde(default)]
    pub min_delta: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct TrainingConfig {
    pub epochs: usize,
    pub batch_size: usize,
    pub learning_rate: f64,
    pub val_split: f64,
    #[serde(default = "default_test_split")]
    pub test_split: f64,
    #[serde(default)]
    pub early_stopping: Option<EarlyStopping>,
    pub seed: u64,
    #[serde(default)]
    pub split: SplitKind,
    #[serde(default)]
    pub optimizer: Optimizer,
    /// Keep the best checkpoint on cancellation instead of discarding it.
    #[serde(default)]
    pub checkpointing: bool,
}

fn default_test_split() -> f64 {
    0.15
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "mode", rename_all = "snake_case")]
pub enum PositionSizing {
    /// Allocate a fixed fraction of equity per trade.
    FixedFraction { fraction: f64 },
    /// Risk a percentage of equity against the configured stop distance.
    PercentRisk { risk_percent: f64 },
    /// Fixed number of units per trade.
    Fixed { units: f64 },
}

impl Default for PositionSizing {
    fn default() -> Self {
        PositionSizing::FixedFraction { fraction: 0.1 }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct RiskConfig {
    #[serde(default)]
    pub position_sizing: PositionSizing,
    /// Stop distance as a fraction of entry price.
    #[serde(default)]
    pub stop_loss: Option<f64>,
    #[serde(default)]
    pub take_profit: Option<f64>,
    /// Maximum gross exposure as a fraction of equity.
    #[serde(default = "default_max_exposure")]
    pub max_exposure: f64,
}

fn default_max_exposure() -> f64 {
    1.0
}

impl Default for RiskConfig {
    fn default() -> Self {
        Self {
            position_sizing: PositionSizing::default(),
            stop_loss: None,
            take_profit: None,
            max_exposure: default_max_exposure(),
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct RulesConfig {
    /// Entry predicates over indicator/fuzzy column names.
    #[serde(default)]
    pub entry: Vec<String>,
    #[serde(default)]
    pub exit: Vec<String>,
    /// Signals with strength below this are suppressed.
    #[serde(default)]
    pub signal_threshold: f64,
}

impl StrategyConfig {
    pub fn from_yaml_str(doc: &str) -> Result<Self, KtrdrError> {
        let config: StrategyConfig =
            serde_yaml::from_str(doc).map_err(|e| KtrdrError::Config {
                path: e
                    .location()
                    .map(|l| format!("line {}, column {}", l.line(), l.column()))
                    .unwrap_or_else(|| "document".to_string()),
                message: e.to_string(),
            })?;
        config.validate()?;
        Ok(config)
    }

    pub fn load(path: impl AsRef<Path>) -> Result<Self, KtrdrError> {
        let path = path.as_ref();
        let doc = std::fs::read_to_string(path).map_err(|e| KtrdrError::Config {
            path: path.display().to_string(),
            message: format!("cannot read strategy config: {e}"),
        })?;
        Self::from_yaml_str(&doc)
    }

    /// Full structural validation: field ranges plus reference resolution
    /// between features, fuzzy sets and indicators.
    pub fn validate(&self) -> Result<(), KtrdrError> {
        if self.name.trim().is_empty() {
            return Err(KtrdrError::config("name", "strategy name must not be empty"));
        }
        if self.symbols.is_empty() {
            return Err(KtrdrError::config("symbols", "at least one symbol required"));
        }
        if self.timeframes.is_empty() {
            return Err(KtrdrError::config(
                "timeframes",
                "at least one timeframe required",
            ));
        }

        let indicator_names = self.validate_indicators()?;
        let fuzzy_names = self.validate_fuzzy_sets(&indicator_names)?;
        self.validate_features(&indicator_names, &fuzzy_names)?;
        self.validate_labels()?;
        self.validate_model()?;
        self.validate_training()?;
        self.validate_risk()?;
        Ok(())
    }

    fn validate_indicators(&self) -> Result<BTreeSet<String>, KtrdrError> {
        let mut names = BTreeSet::new();
        for (i, ind) in self.indicators.iter().enumerate() {
            if ind.name.trim().is_empty() {
                return Err(KtrdrError::config(
                    format!("indicators[{i}].name"),
                    "indicator name must not be empty",
                ));
            }
            if !names.insert(ind.name.clone()) {
                return Err(KtrdrError::config(
                    format!("indicators[{i}].name"),
                    format!("duplicate indicator name '{}'", ind.name),
                ));
            }
        }
        Ok(names)
    }

    /// A fuzzy input must resolve to a price column or an indicator column.
    /// Referencing another fuzzy set is rejected, which makes the
    /// indicator -> fuzzy -> feature graph acyclic by construction.
    fn validate_fuzzy_sets(
        &self,
        indicator_names: &BTreeSet<String>,
    ) -> Result<BTreeSet<String>, KtrdrError> {
        let mut names = BTreeSet::new();
        for (i, set) in self.fuzzy_sets.iter().enumerate() {
            let field = format!("fuzzy_sets[{i}]");
            if !names.insert(set.name.clone()) {
                return Err(KtrdrError::config(
                    format!("{field}.name"),
                    format!("duplicate fuzzy set name '{}'", set.name),
                ));
            }
            if names.contains(&set.input) {
                return Err(KtrdrError::config(
                    format!("{field}.input"),
                    format!(
                        "fuzzy set '{}' references fuzzy set '{}'; inputs must be indicator or price columns",
                        set.name, set.input
                    ),
                ));
            }
            if !column_resolves(&set.input, indicator_names) {
                return Err(KtrdrError::config(
                    format!("{field}.input"),
                    format!("unknown input column '{}'", set.input),
                ));
            }
            match set.kind {
                FuzzyKind::Triangular => {
                    if set.params.len() != 3 {
                        return Err(KtrdrError::config(
                            format!("{field}.params"),
                            format!("triangular sets take [a, b, c], got {} values", set.params.len()),
                        ));
                    }
                    let (a, b, c) = (set.params[0], set.params[1], set.params[2]);
                    if !(a <= b && b <= c) {
                        return Err(KtrdrError::config(
                            format!("{field}.params"),
                            format!("require a <= b <= c, got [{a}, {b}, {c}]"),
                        ));
                    }
                }
            }
        }
        Ok(names)
    }

    fn validate_features(
        &self,
        indicator_names: &BTreeSet<String>,
        fuzzy_names: &BTreeSet<String>,
    ) -> Result<(), KtrdrError> {
        if self.features.include_indicators.is_empty() && self.features.include_fuzzy.is_empty() {
            return Err(KtrdrError::config(
                "features",
                "at least one indicator or fuzzy feature required",
            ));
        }
        for (i, name) in self.features.include_indicators.iter().enumerate() {
            if !column_resolves(name, indicator_names) {
                return Err(KtrdrError::config(
                    format!("features.include_indicators[{i}]"),
                    format!("unknown indicator column '{name}'"),
                ));
            }
        }
        for (i, name) in self.features.include_fuzzy.iter().enumerate() {
            if !fuzzy_names.contains(name) {
                return Err(KtrdrError::config(
                    format!("features.include_fuzzy[{i}]"),
                    format!("unknown fuzzy set '{name}'"),
                ));
            }
        }
        Ok(())
    }

    fn validate_labels(&self) -> Result<(), KtrdrError> {
        let p = &self.labels.params;
        if p.horizon == 0 {
            return Err(KtrdrError::config(
                "labels.params.horizon",
                "horizon must be at least 1 bar",
            ));
        }
        if p.upper_threshold <= 0.0 {
            return Err(KtrdrError::config(
                "labels.params.upper_threshold",
                "must be positive",
            ));
        }
        if p.lower_threshold >= 0.0 {
            return Err(KtrdrError::config(
                "labels.params.lower_threshold",
                "must be negative",
            ));
        }
        Ok(())
    }

    fn validate_model(&self) -> Result<(), KtrdrError> {
        if self.model.architecture != "mlp" {
            return Err(KtrdrError::config(
                "model.architecture",
                format!("unknown architecture '{}'", self.model.architecture),
            ));
        }
        if self.model.layers.is_empty() {
            return Err(KtrdrError::config(
                "model.layers",
                "at least one hidden layer required",
            ));
        }
        if self.model.layers.iter().any(|&w| w == 0) {
            return Err(KtrdrError::config(
                "model.layers",
                "layer widths must be positive",
            ));
        }
        if !(0.0..1.0).contains(&self.model.dropout) {
            return Err(KtrdrError::config(
                "model.dropout",
                format!("dropout must be in [0, 1), got {}", self.model.dropout),
            ));
        }
        Ok(())
    }

    fn validate_training(&self) -> Result<(), KtrdrError> {
        let t = &self.training;
        if t.epochs == 0 {
            return Err(KtrdrError::config("training.epochs", "must be positive"));
        }
        if t.batch_size == 0 {
            return Err(KtrdrError::config("training.batch_size", "must be positive"));
        }
        if t.learning_rate <= 0.0 || !t.learning_rate.is_finite() {
            return Err(KtrdrError::config(
                "training.learning_rate",
                format!("must be positive and finite, got {}", t.learning_rate),
            ));
        }
        if !(0.0..1.0).contains(&t.val_split) || t.val_split == 0.0 {
            return Err(KtrdrError::config(
                "training.val_split",
                format!("must be in (0, 1), got {}", t.val_split),
            ));
        }
        if !(0.0..1.0).contains(&t.test_split) || t.test_split == 0.0 {
            return Err(KtrdrError::config(
                "training.test_split",
                format!("must be in (0, 1), got {}", t.test_split),
            ));
        }
        if t.val_split + t.test_split >= 1.0 {
            return Err(KtrdrError::config(
                "training",
                format!(
                    "val_split + test_split must leave room for training, got {}",
                    t.val_split + t.test_split
                ),
            ));
        }
        Ok(())
    }

    fn validate_risk(&self) -> Result<(), KtrdrError> {
        match self.risk.position_sizing {
            PositionSizing::FixedFraction { fraction } => {
                if !(0.0 < fraction && fraction <= 1.0) {
                    return Err(KtrdrError::config(
                        "risk.position_sizing.fraction",
                        format!("must be in (0, 1], got {fraction}"),
                    ));
                }
            }
            PositionSizing::PercentRisk { risk_percent } => {
                if !(0.0 < risk_percent && risk_percent <= 100.0) {
                    return Err(KtrdrError::config(
                        "risk.position_sizing.risk_percent",
                        format!("must be in (0, 100], got {risk_percent}"),
                    ));
                }
                if self.risk.stop_loss.is_none() {
                    return Err(KtrdrError::config(
                        "risk.stop_loss",
                        "percent_risk sizing requires a stop distance",
                    ));
                }
            }
            PositionSizing::Fixed { units } => {
                if units <= 0.0 {
                    return Err(KtrdrError::config(
                        "risk.position_sizing.units",
                        format!("must be positive, got {units}"),
                    ));
                }
            }
        }
        if let Some(stop) = self.risk.stop_loss {
            if !(0.0 < stop && stop < 1.0) {
                return Err(KtrdrError::config(
                    "risk.stop_loss",
                    format!("must be a fraction in (0, 1), got {stop}"),
                ));
            }
        }
        if self.risk.max_exposure <= 0.0 {
            return Err(KtrdrError::config(
                "risk.max_exposure",
                "must be positive",
            ));
        }
        Ok(())
    }
}

/// True when `column` names a price column, an indicator, or a dotted field
/// of an indicator (`macd.line`). Field existence is checked later by the
/// indicator registry; here we only resolve the owning indicator.
fn column_resolves(column: &str, indicator_names: &BTreeSet<String>) -> bool {
    if PRICE_COLUMNS.contains(&column) || indicator_names.contains(column) {
        return true;
    }
    match column.split_once('.') {
        Some((base, field)) => !field.is_empty() && indicator_names.contains(base),
        None => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_yaml() -> &'static str {
        r#"
name: trend-follow
symbols: [AAPL, MSFT]
timeframes: ["1h", "1d"]
indicators:
  - name: rsi
    params: { period: 14 }
  - name: sma
    params: { period: 20 }
fuzzy_sets:
  - { input: rsi, name: rsi_low, kind: triangular, params: [0, 20, 40] }
  - { input: rsi, name: rsi_high, kind: triangular, params: [60, 80, 100] }
features:
  include_indicators: [sma]
  include_fuzzy: [rsi_low, rsi_high]
labels:
  generator: directional_move
  params: { horizon: 5, upper_threshold: 0.01, lower_threshold: -0.01 }
model:
  architecture: mlp
  layers: [32, 16]
  dropout: 0.2
  activation: relu
training:
  epochs: 50
  batch_size: 64
  learning_rate: 0.001
  val_split: 0.2
  seed: 42
rules:
  entry: ["rsi_low > 0.5"]
  exit: ["rsi_high > 0.5"]
  signal_threshold: 0.3
"#
    }

    #[test]
    fn sample_config_parses_and_validates() {
        let config = StrategyConfig::from_yaml_str(sample_yaml()).unwrap();
        assert_eq!(config.name, "trend-follow");
        assert_eq!(config.symbols.len(), 2);
        assert_eq!(config.timeframes, vec![Timeframe::Hour1, Timeframe::Day1]);
        assert_eq!(config.training.split, SplitKind::TimeOrdered);
    }

    #[test]
    fn unknown_keys_rejected() {
        let doc = sample_yaml().replace("name: trend-follow", "name: x\nsurprise: 1");
        let err = StrategyConfig::from_yaml_str(&doc).unwrap_err();
        assert!(err.to_string().contains("surprise"), "{err}");
    }

    #[test]
    fn fuzzy_set_referencing_fuzzy_set_is_a_cycle_error() {
        let doc = sample_yaml().replace(
            "{ input: rsi, name: rsi_high",
            "{ input: rsi_low, name: rsi_high",
        );
        let err = StrategyConfig::from_yaml_str(&doc).unwrap_err();
        assert!(err.to_string().contains("fuzzy_sets[1].input"), "{err}");
    }

    #[test]
    fn unknown_feature_reference_rejected() {
        let doc = sample_yaml().replace("include_indicators: [sma]", "include_indicators: [vwap]");
        let err = StrategyConfig::from_yaml_str(&doc).unwrap_err();
        assert!(err.to_string().contains("include_indicators[0]"), "{err}");
    }

    #[test]
    fn triangle_ordering_enforced() {
        let doc = sample_yaml().replace("[0, 20, 40]", "[40, 20, 0]");
        let err = StrategyConfig::from_yaml_str(&doc).unwrap_err();
        assert!(err.to_string().contains("a <= b <= c"), "{err}");
    }

    #[test]
    fn split_ratios_must_leave_training_data() {
        let doc = sample_yaml().replace("val_split: 0.2", "val_split: 0.9");
        assert!(StrategyConfig::from_yaml_str(&doc).is_err());
    }

    #[test]
    fn dotted_indicator_field_resolves() {
        let mut names = BTreeSet::new();
        names.insert("macd".to_string());
        assert!(column_resolves("macd.line", &names));
        assert!(column_resolves("close", &names));
        assert!(!column_resolves("macd.", &names));
        assert!(!column_resolves("vwap", &names));
    }
}
