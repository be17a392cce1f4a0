use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use uuid::Uuid;

use data_manager::{DataManagerConfig, LoadMode};
use trading_core::{
    CancelToken, CoreContext, ErrorInfo, KtrdrError, ProgressCallback, ProgressUpdate,
    RunStatus, SessionInfo, StrategyConfig, TimeRange, TrainingRunResult,
};
use training_pipeline::TrainingPipeline;

/// Handle to one running local training operation: a progress stream, a
/// cancel switch, and the eventual result.
pub struct TrainingHandle {
    pub operation_id: String,
    progress: Option<mpsc::Receiver<ProgressUpdate>>,
    cancel: CancelToken,
    join: JoinHandle<TrainingRunResult>,
}

impl TrainingHandle {
    /// Set the cooperative cancel flag. The training loop observes it
    /// within its bounded check interval.
    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    /// Take the caller-visible progress channel. Can be taken once.
    pub fn take_progress(&mut self) -> Option<mpsc::Receiver<ProgressUpdate>> {
        self.progress.take()
    }

    /// Await the standardized result record.
    pub async fn result(self) -> TrainingRunResult {
        match self.join.await {
            Ok(result) => result,
            Err(e) => TrainingRunResult::failed(ErrorInfo::new(&KtrdrError::Model(format!(
                "training worker panicked: {e}"
            )))),
        }
    }
}

/// Coordination shell that runs the pipeline in a worker task, bridges
/// its progress callback into a channel, and stamps session metadata onto
/// the unchanged pipeline result.
pub struct LocalOrchestrator {
    ctx: CoreContext,
    dm_config: DataManagerConfig,
}

impl LocalOrchestrator {
    pub fn new(ctx: CoreContext, dm_config: DataManagerConfig) -> Self {
        Self { ctx, dm_config }
    }

    pub fn start_training(
        &self,
        config: StrategyConfig,
        range: TimeRange,
        mode: LoadMode,
    ) -> TrainingHandle {
        let operation_id = Uuid::new_v4().to_string();
        let cancel = CancelToken::new();
        let (tx, rx) = mpsc::channel::<ProgressUpdate>(256);

        // Progress is best effort: a full channel drops the update rather
        // than slowing the training loop.
        let progress: ProgressCallback = Arc::new(move |update| {
            let _ = tx.try_send(update);
        });

        let pipeline = TrainingPipeline::new(&self.ctx, self.dm_config.clone());
        let session_info = SessionInfo {
            operation_id: operation_id.clone(),
            strategy_name: config.name.clone(),
            symbols: config.symbols.iter().map(|s| s.to_string()).collect(),
            timeframes: config.timeframes.clone(),
            mode: "local".to_string(),
        };
        let worker_cancel = cancel.clone();

        let join = tokio::spawn(async move {
            tracing::info!(operation_id = %session_info.operation_id, "training operation started");
            let outcome = pipeline
                .train_strategy(&config, range, mode, Some(progress), Some(worker_cancel))
                .await;

            let mut record = match outcome {
                Ok(record) => record,
                Err(KtrdrError::Cancelled) => {
                    let mut record =
                        TrainingRunResult::failed(ErrorInfo::new(&KtrdrError::Cancelled));
                    record.status = Some(RunStatus::Cancelled);
                    record
                }
                Err(e) => {
                    tracing::error!(error = %e, "training failed");
                    TrainingRunResult::failed(
                        ErrorInfo::new(&e).with_context("strategy", config.name.clone()),
                    )
                }
            };
            if record.status.is_none() {
                record.status = Some(RunStatus::Completed);
            }
            record.session_info = Some(session_info);
            record
        });

        TrainingHandle {
            operation_id,
            progress: Some(rx),
            cancel,
            join,
        }
    }
}
