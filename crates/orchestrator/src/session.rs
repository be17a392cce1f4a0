use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use data_manager::LoadMode;
use trading_core::{StrategyConfig, TimeRange};

/// Job submitted to a training host.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TrainingJobRequest {
    pub strategy_config: StrategyConfig,
    pub range: TimeRange,
    pub mode: JobLoadMode,
}

/// Serializable mirror of the DataManager load mode for the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobLoadMode {
    Local,
    Tail,
    Backfill,
    Full,
}

impl From<JobLoadMode> for LoadMode {
    fn from(mode: JobLoadMode) -> Self {
        match mode {
            JobLoadMode::Local => LoadMode::Local,
            JobLoadMode::Tail => LoadMode::Tail,
            JobLoadMode::Backfill => LoadMode::Backfill,
            JobLoadMode::Full => LoadMode::Full,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionState {
    Pending,
    Running,
    Completed,
    Failed,
    Cancelled,
}

/// Lightweight status record a host reports while a session runs.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionStatus {
    pub session_id: String,
    pub state: SessionState,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub epoch: Option<usize>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub total_epochs: Option<usize>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub started_at: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub finished_at: Option<DateTime<Utc>>,
}
