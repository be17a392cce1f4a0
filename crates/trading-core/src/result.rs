use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::PathBuf;

use crate::error::ErrorInfo;
use crate::types::Timeframe;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    Completed,
    Failed,
    Cancelled,
}

/// One row of the epoch history.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EpochRecord {
    pub epoch: usize,
    pub train_loss: f64,
    pub val_loss: f64,
    pub train_accuracy: f64,
    pub val_accuracy: f64,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TrainingMetrics {
    pub final_train_loss: f64,
    pub final_val_loss: f64,
    pub final_train_accuracy: f64,
    pub final_val_accuracy: f64,
    pub history: Vec<EpochRecord>,
}

/// Per-class evaluation breakdown.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ClassMetrics {
    pub label: String,
    pub precision: f64,
    pub recall: f64,
    pub f1: f64,
    pub support: usize,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TestMetrics {
    pub accuracy: f64,
    pub loss: f64,
    /// Macro-averaged over classes.
    pub precision: f64,
    pub recall: f64,
    pub f1: f64,
    pub confusion_matrix: Vec<Vec<u64>>,
    #[serde(default)]
    pub per_class: Vec<ClassMetrics>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RunArtifacts {
    /// Mean absolute first-layer weight per input feature.
    pub feature_importance: BTreeMap<String, f64>,
    pub per_symbol_metrics: BTreeMap<String, TestMetrics>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ModelInfo {
    pub architecture: String,
    pub parameter_count: usize,
    pub feature_names: Vec<String>,
    pub label_classes: Vec<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct DataSummary {
    pub symbols: Vec<String>,
    pub timeframes: Vec<Timeframe>,
    pub sample_counts_per_symbol: BTreeMap<String, usize>,
    pub total_samples: usize,
    pub date_range: Option<(DateTime<Utc>, DateTime<Utc>)>,
}

/// Identity of one local orchestrated operation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SessionInfo {
    pub operation_id: String,
    pub strategy_name: String,
    pub symbols: Vec<String>,
    pub timeframes: Vec<Timeframe>,
    pub mode: String,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ResourceUsage {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub wall_time_secs: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub peak_memory_bytes: Option<u64>,
}

/// Standardized output of a training run. The pipeline is the single
/// source of truth for this record; orchestrators only attach session
/// metadata and status, never reshape it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TrainingRunResult {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub model_path: Option<PathBuf>,
    pub training_metrics: TrainingMetrics,
    pub test_metrics: TestMetrics,
    pub artifacts: RunArtifacts,
    pub model_info: ModelInfo,
    pub data_summary: DataSummary,
    /// Attached by the local orchestrator.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub session_info: Option<SessionInfo>,
    /// Attached by the remote orchestrator.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub session_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub status: Option<RunStatus>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<ErrorInfo>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub resource_usage: Option<ResourceUsage>,
}

impl TrainingRunResult {
    /// A failed-run record carrying only the error payload.
    pub fn failed(error: ErrorInfo) -> Self {
        Self {
            model_path: None,
            training_metrics: TrainingMetrics::default(),
            test_metrics: TestMetrics::default(),
            artifacts: RunArtifacts::default(),
            model_info: ModelInfo::default(),
            data_summary: DataSummary::default(),
            session_info: None,
            session_id: None,
            status: Some(RunStatus::Failed),
            error: Some(error),
            resource_usage: None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::{ErrorKind, KtrdrError};

    #[test]
    fn failed_record_serializes_error_kind() {
        let result =
            TrainingRunResult::failed(ErrorInfo::new(&KtrdrError::Model("NaN loss".into())));
        let json = serde_json::to_value(&result).unwrap();
        assert_eq!(json["status"], "failed");
        assert_eq!(json["error"]["kind"], "ModelError");
        assert!(json.get("model_path").is_none());
    }

    #[test]
    fn local_and_remote_records_share_schema() {
        let mut local = TrainingRunResult::failed(ErrorInfo::new(&KtrdrError::Cancelled));
        local.status = Some(RunStatus::Cancelled);
        local.session_info = Some(SessionInfo {
            operation_id: "op-1".into(),
            strategy_name: "s".into(),
            symbols: vec!["AAPL".into()],
            timeframes: vec![Timeframe::Day1],
            mode: "local".into(),
        });
        let mut remote = local.clone();
        remote.session_info = None;
        remote.session_id = Some("sess-1".into());

        // Same struct, so the schema is identical by construction; check
        // the serde round trip anyway.
        let local_json = serde_json::to_string(&local).unwrap();
        let remote_json = serde_json::to_string(&remote).unwrap();
        let _: TrainingRunResult = serde_json::from_str(&local_json).unwrap();
        let _: TrainingRunResult = serde_json::from_str(&remote_json).unwrap();
        assert_eq!(
            ErrorKind::Cancelled,
            local.error.as_ref().unwrap().kind
        );
    }
}
