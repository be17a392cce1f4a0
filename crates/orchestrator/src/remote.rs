use async_trait::async_trait;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;

use trading_core::{
    CancelToken, ErrorInfo, KtrdrError, ProgressCallback, ProgressKind, ProgressUpdate,
    RunStatus, TrainingRunResult,
};
use training_pipeline::TrainingPipeline;

use crate::session::{SessionState, SessionStatus, TrainingJobRequest};

/// Progress is forwarded to the session state at most every N batches.
pub const PROGRESS_EVERY_N_BATCHES: usize = 10;
/// The session cancel flag is observed every M batches.
pub const CANCEL_CHECK_EVERY_M_BATCHES: usize = 5;
/// Bounded retries for the final result post.
pub const RESULT_POST_MAX_RETRIES: u32 = 5;

/// Bridges the pipeline's per-batch progress callback into a session
/// update stream. Throttling is done by skipping updates; the bridge
/// never sleeps in the callback path.
pub struct ThrottledBridge {
    batches_seen: AtomicUsize,
    every_n_batches: usize,
    check_cancel_every: usize,
    cancel_flag: Arc<AtomicBool>,
    token: CancelToken,
    sink: mpsc::UnboundedSender<ProgressUpdate>,
}

impl ThrottledBridge {
    pub fn new(
        sink: mpsc::UnboundedSender<ProgressUpdate>,
        cancel_flag: Arc<AtomicBool>,
    ) -> Arc<Self> {
        Arc::new(Self {
            batches_seen: AtomicUsize::new(0),
            every_n_batches: PROGRESS_EVERY_N_BATCHES,
            check_cancel_every: CANCEL_CHECK_EVERY_M_BATCHES,
            cancel_flag,
            token: CancelToken::new(),
            sink,
        })
    }

    /// The cooperative token handed to the pipeline.
    pub fn token(&self) -> CancelToken {
        self.token.clone()
    }

    pub fn callback(self: &Arc<Self>) -> ProgressCallback {
        let bridge = Arc::clone(self);
        Arc::new(move |update: ProgressUpdate| match update.progress_type {
            // Epoch summaries always go through.
            ProgressKind::Epoch => {
                let _ = bridge.sink.send(update);
            }
            ProgressKind::Batch => {
                let seen = bridge.batches_seen.fetch_add(1, Ordering::Relaxed) + 1;
                if seen % bridge.check_cancel_every == 0
                    && bridge.cancel_flag.load(Ordering::Relaxed)
                {
                    bridge.token.cancel();
                }
                if seen % bridge.every_n_batches == 0 {
                    let _ = bridge.sink.send(update);
                }
            }
        })
    }
}

/// How a host session talks back to its coordinator: best-effort progress
/// posts and the one result post that matters.
#[async_trait]
pub trait SessionTransport: Send + Sync {
    async fn post_progress(
        &self,
        session_id: &str,
        update: &ProgressUpdate,
    ) -> Result<(), KtrdrError>;

    async fn post_result(
        &self,
        session_id: &str,
        result: &TrainingRunResult,
    ) -> Result<(), KtrdrError>;
}

/// Host-side shell: runs the pipeline for one session, forwards throttled
/// progress, and stores the pipeline result unchanged. No reconstruction
/// or aggregation happens here; the coordinator attaches its own session
/// metadata when it hands the record back.
pub struct SessionRunner {
    pipeline: TrainingPipeline,
    transport: Arc<dyn SessionTransport>,
}

impl SessionRunner {
    pub fn new(pipeline: TrainingPipeline, transport: Arc<dyn SessionTransport>) -> Self {
        Self {
            pipeline,
            transport,
        }
    }

    pub async fn run(
        &self,
        session_id: &str,
        job: TrainingJobRequest,
        cancel_flag: Arc<AtomicBool>,
    ) -> SessionState {
        let (tx, mut rx) = mpsc::unbounded_channel::<ProgressUpdate>();
        let bridge = ThrottledBridge::new(tx, cancel_flag);

        // Progress drain: failed posts are dropped, never retried; the
        // training loop is not allowed to feel the network.
        let transport = Arc::clone(&self.transport);
        let progress_session = session_id.to_string();
        let forwarder = tokio::spawn(async move {
            while let Some(update) = rx.recv().await {
                if let Err(e) = transport.post_progress(&progress_session, &update).await {
                    tracing::debug!(error = %e, "dropped progress update");
                }
            }
        });

        let outcome = self
            .pipeline
            .train_strategy(
                &job.strategy_config,
                job.range,
                job.mode.into(),
                Some(bridge.callback()),
                Some(bridge.token()),
            )
            .await;
        drop(bridge);
        forwarder.abort();

        let record = match outcome {
            Ok(record) => record,
            Err(KtrdrError::Cancelled) => {
                let mut record = TrainingRunResult::failed(ErrorInfo::new(&KtrdrError::Cancelled));
                record.status = Some(RunStatus::Cancelled);
                record
            }
            Err(e) => {
                tracing::error!(session_id, error = %e, "session training failed");
                TrainingRunResult::failed(ErrorInfo::new(&e))
            }
        };
        let state = match record.status {
            Some(RunStatus::Completed) | None => SessionState::Completed,
            Some(RunStatus::Cancelled) => SessionState::Cancelled,
            Some(RunStatus::Failed) => SessionState::Failed,
        };

        match post_result_with_retry(self.transport.as_ref(), session_id, &record).await {
            Ok(()) => state,
            Err(e) => {
                tracing::error!(session_id, error = %e, "result post exhausted retries");
                SessionState::Failed
            }
        }
    }
}

/// Post the final result with exponential backoff, up to the bounded
/// retry count.
pub async fn post_result_with_retry(
    transport: &dyn SessionTransport,
    session_id: &str,
    result: &TrainingRunResult,
) -> Result<(), KtrdrError> {
    let mut last_error = None;
    for attempt in 0..RESULT_POST_MAX_RETRIES {
        match transport.post_result(session_id, result).await {
            Ok(()) => return Ok(()),
            Err(e) => {
                tracing::warn!(session_id, attempt, error = %e, "result post failed");
                last_error = Some(e);
                if attempt + 1 < RESULT_POST_MAX_RETRIES {
                    tokio::time::sleep(Duration::from_secs(1u64 << attempt)).await;
                }
            }
        }
    }
    Err(last_error.unwrap_or_else(|| KtrdrError::ConnectionLost("result post failed".into())))
}

/// Client-side shell: submits a job to a remote training host, polls for
/// completion, and returns the stored result verbatim, adding only
/// session id, status and timing.
pub struct RemoteOrchestrator {
    http: reqwest::Client,
    host_url: String,
    poll_interval: Duration,
}

impl RemoteOrchestrator {
    pub fn new(host_url: impl Into<String>) -> Result<Self, KtrdrError> {
        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(30))
            .build()
            .map_err(|e| KtrdrError::ConnectionLost(e.to_string()))?;
        Ok(Self {
            http,
            host_url: host_url.into(),
            poll_interval: Duration::from_secs(2),
        })
    }

    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }

    pub async fn submit(&self, job: &TrainingJobRequest) -> Result<String, KtrdrError> {
        #[derive(serde::Deserialize)]
        struct Submitted {
            session_id: String,
        }
        let url = format!("{}/api/trainings", self.host_url);
        let response: Submitted = self
            .http
            .post(&url)
            .json(job)
            .send()
            .await
            .map_err(transport_error)?
            .error_for_status()
            .map_err(transport_error)?
            .json()
            .await
            .map_err(transport_error)?;
        Ok(response.session_id)
    }

    pub async fn status(&self, session_id: &str) -> Result<SessionStatus, KtrdrError> {
        let url = format!("{}/api/trainings/{session_id}/status", self.host_url);
        self.http
            .get(&url)
            .send()
            .await
            .map_err(transport_error)?
            .error_for_status()
            .map_err(transport_error)?
            .json()
            .await
            .map_err(transport_error)
    }

    pub async fn fetch_result(&self, session_id: &str) -> Result<TrainingRunResult, KtrdrError> {
        let url = format!("{}/api/trainings/{session_id}/result", self.host_url);
        self.http
            .get(&url)
            .send()
            .await
            .map_err(transport_error)?
            .error_for_status()
            .map_err(transport_error)?
            .json()
            .await
            .map_err(transport_error)
    }

    /// Set the session-scoped cancel flag on the host.
    pub async fn cancel(&self, session_id: &str) -> Result<(), KtrdrError> {
        let url = format!("{}/api/trainings/{session_id}/cancel", self.host_url);
        self.http
            .post(&url)
            .send()
            .await
            .map_err(transport_error)?
            .error_for_status()
            .map_err(transport_error)?;
        Ok(())
    }

    /// Submit, poll until the session reaches a terminal state, then
    /// return the stored result verbatim plus session metadata.
    pub async fn run_to_completion(
        &self,
        job: &TrainingJobRequest,
    ) -> Result<TrainingRunResult, KtrdrError> {
        let started = std::time::Instant::now();
        let session_id = self.submit(job).await?;
        tracing::info!(session_id, "training job submitted");

        loop {
            let status = self.status(&session_id).await?;
            match status.state {
                SessionState::Completed | SessionState::Failed | SessionState::Cancelled => break,
                SessionState::Pending | SessionState::Running => {
                    tokio::time::sleep(self.poll_interval).await;
                }
            }
        }

        let mut result = self.fetch_result(&session_id).await?;
        // Attach only session id, status and timing; the record itself is
        // the pipeline's, untouched.
        result.session_id = Some(session_id);
        if result.status.is_none() {
            result.status = Some(RunStatus::Completed);
        }
        let usage = result.resource_usage.get_or_insert_with(Default::default);
        usage.wall_time_secs = Some(started.elapsed().as_secs_f64());
        Ok(result)
    }
}

fn transport_error(e: reqwest::Error) -> KtrdrError {
    KtrdrError::ConnectionLost(e.to_string())
}
