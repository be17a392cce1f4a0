use serde::{Deserialize, Serialize};
use std::sync::Arc;

/// Cooperative cancellation token shared across the pipeline and its
/// coordination shells. Checked synchronously inside the training loop.
pub type CancelToken = tokio_util::sync::CancellationToken;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProgressKind {
    Batch,
    Epoch,
}

/// Loss/accuracy snapshot attached to a progress update. Fields are
/// optional because batch updates only know the running train loss.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ProgressMetrics {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub train_loss: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub val_loss: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub train_accuracy: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub val_accuracy: Option<f64>,
}

/// A single training progress event. Emitted per batch and per epoch;
/// consumers decide how much to forward.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProgressUpdate {
    pub progress_type: ProgressKind,
    pub epoch: usize,
    pub total_epochs: usize,
    /// 1-based batch index within the epoch; 0 for epoch-level updates.
    pub batch: usize,
    pub total_batches: usize,
    pub metrics: ProgressMetrics,
}

impl ProgressUpdate {
    pub fn epoch(epoch: usize, total_epochs: usize, metrics: ProgressMetrics) -> Self {
        Self {
            progress_type: ProgressKind::Epoch,
            epoch,
            total_epochs,
            batch: 0,
            total_batches: 0,
            metrics,
        }
    }

    pub fn batch(
        epoch: usize,
        total_epochs: usize,
        batch: usize,
        total_batches: usize,
        train_loss: f64,
    ) -> Self {
        Self {
            progress_type: ProgressKind::Batch,
            epoch,
            total_epochs,
            batch,
            total_batches,
            metrics: ProgressMetrics {
                train_loss: Some(train_loss),
                ..Default::default()
            },
        }
    }
}

/// Callback invoked by the training loop. Must be cheap; throttling is the
/// caller's job, never the loop's.
pub type ProgressCallback = Arc<dyn Fn(ProgressUpdate) + Send + Sync>;
