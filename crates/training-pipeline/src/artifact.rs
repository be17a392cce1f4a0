use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::fs;
use std::path::{Path, PathBuf};
use uuid::Uuid;

use trading_core::{KtrdrError, StrategyConfig, TestMetrics, TrainingMetrics};

use crate::network::LayerWeights;
use crate::normalize::NormStats;

pub const WEIGHTS_FILE: &str = "weights.bin";
pub const CONFIG_FILE: &str = "config.yaml";
pub const METADATA_FILE: &str = "metadata.json";

/// `metadata.json` — the source of truth for load-time validation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModelMetadata {
    pub strategy_name: String,
    pub version: String,
    pub created_at: DateTime<Utc>,
    /// sha256 of the weight blob.
    pub content_hash: String,
    pub architecture: String,
    pub parameter_count: usize,
    pub feature_names: Vec<String>,
    pub label_classes: Vec<String>,
    pub normalization: NormStats,
    pub training_metrics: TrainingMetrics,
    pub test_metrics: TestMetrics,
}

/// Everything persisted under `models/<strategy>/<version>/`.
#[derive(Debug, Clone)]
pub struct ModelArtifact {
    pub metadata: ModelMetadata,
    pub weights: Vec<LayerWeights>,
    pub config: StrategyConfig,
}

fn persistence(e: impl std::fmt::Display) -> KtrdrError {
    KtrdrError::Persistence(e.to_string())
}

pub fn weights_hash(blob: &[u8]) -> String {
    hex::encode(Sha256::digest(blob))
}

impl ModelArtifact {
    /// Atomic persistence: everything is written into a hidden temp
    /// directory next to the destination, then published with one rename.
    /// Readers see either the old version or the new one, never a partial
    /// directory.
    pub fn save(&self, model_dir: &Path) -> Result<PathBuf, KtrdrError> {
        let strategy_dir = model_dir.join(&self.metadata.strategy_name);
        let final_dir = strategy_dir.join(&self.metadata.version);
        fs::create_dir_all(&strategy_dir).map_err(persistence)?;

        let tmp_dir = strategy_dir.join(format!(".tmp-{}", Uuid::new_v4()));
        fs::create_dir_all(&tmp_dir).map_err(persistence)?;

        let result = (|| -> Result<(), KtrdrError> {
            let blob = postcard::to_allocvec(&self.weights).map_err(persistence)?;
            debug_assert_eq!(self.metadata.content_hash, weights_hash(&blob));
            fs::write(tmp_dir.join(WEIGHTS_FILE), &blob).map_err(persistence)?;

            let config_doc = serde_yaml::to_string(&self.config).map_err(persistence)?;
            fs::write(tmp_dir.join(CONFIG_FILE), config_doc).map_err(persistence)?;

            let metadata_doc =
                serde_json::to_string_pretty(&self.metadata).map_err(persistence)?;
            fs::write(tmp_dir.join(METADATA_FILE), metadata_doc).map_err(persistence)?;

            fs::rename(&tmp_dir, &final_dir).map_err(persistence)?;
            Ok(())
        })();

        if result.is_err() {
            let _ = fs::remove_dir_all(&tmp_dir);
        }
        result?;

        tracing::info!(path = %final_dir.display(), "model artifact persisted");
        Ok(final_dir)
    }

    /// Load and validate one version directory. The weight blob must hash
    /// to the value recorded in `metadata.json`.
    pub fn load(version_dir: &Path) -> Result<Self, KtrdrError> {
        let metadata_doc =
            fs::read_to_string(version_dir.join(METADATA_FILE)).map_err(persistence)?;
        let metadata: ModelMetadata =
            serde_json::from_str(&metadata_doc).map_err(persistence)?;

        let blob = fs::read(version_dir.join(WEIGHTS_FILE)).map_err(persistence)?;
        let actual = weights_hash(&blob);
        if actual != metadata.content_hash {
            return Err(KtrdrError::Model(format!(
                "weight blob hash mismatch in {}: expected {}, got {actual}",
                version_dir.display(),
                metadata.content_hash
            )));
        }
        let weights: Vec<LayerWeights> = postcard::from_bytes(&blob).map_err(persistence)?;

        let config_doc =
            fs::read_to_string(version_dir.join(CONFIG_FILE)).map_err(persistence)?;
        let config: StrategyConfig = serde_yaml::from_str(&config_doc).map_err(persistence)?;

        Ok(Self {
            metadata,
            weights,
            config,
        })
    }

    /// Existing version names for one strategy, sorted.
    pub fn list_versions(model_dir: &Path, strategy_name: &str) -> Vec<String> {
        let Ok(entries) = fs::read_dir(model_dir.join(strategy_name)) else {
            return Vec::new();
        };
        let mut versions: Vec<String> = entries
            .filter_map(|e| e.ok())
            .filter(|e| e.path().is_dir())
            .map(|e| e.file_name().to_string_lossy().into_owned())
            .filter(|name| !name.starts_with('.'))
            .collect();
        versions.sort();
        versions
    }
}
