use nalgebra::DMatrix;
use rand::SeedableRng;
use rand_chacha::ChaCha8Rng;

use trading_core::{
    CancelToken, EpochRecord, KtrdrError, ProgressCallback, ProgressMetrics, ProgressUpdate,
    TrainingConfig, TrainingMetrics,
};

use crate::evaluate::loss_and_accuracy;
use crate::network::{Mlp, OptimizerState};

/// The training loop observes the cancel token at least this often.
pub const CANCEL_CHECK_INTERVAL: usize = 10;

/// What the training loop produced. `cancelled` is only ever true when
/// checkpointing let a cancelled run keep its best completed epoch.
#[derive(Debug)]
pub struct TrainOutcome {
    pub metrics: TrainingMetrics,
    pub cancelled: bool,
}

/// Run the mini-batch training loop. Progress and cancellation are passed
/// straight through from the caller; the loop itself never sleeps or
/// throttles. Cancellation exits cleanly: with `Cancelled` (and no usable
/// weights) by default, or with the best completed checkpoint when
/// `checkpointing` is enabled and at least one epoch finished.
#[allow(clippy::too_many_arguments)]
pub fn train(
    model: &mut Mlp,
    train_x: &DMatrix<f64>,
    train_y: &[usize],
    val_x: &DMatrix<f64>,
    val_y: &[usize],
    config: &TrainingConfig,
    progress: Option<&ProgressCallback>,
    cancel: Option<&CancelToken>,
) -> Result<TrainOutcome, KtrdrError> {
    if train_y.is_empty() {
        return Err(KtrdrError::Model("empty training split".to_string()));
    }

    let mut optimizer = OptimizerState::new(
        config.optimizer,
        config.learning_rate,
        &model.to_weights(),
    );
    // Dropout masks draw from their own stream so changing the epoch count
    // does not perturb weight initialization.
    let mut dropout_rng = ChaCha8Rng::seed_from_u64(config.seed.wrapping_add(1));

    let total_batches = train_y.len().div_ceil(config.batch_size);
    let mut history: Vec<EpochRecord> = Vec::with_capacity(config.epochs);
    let mut best_val_loss = f64::INFINITY;
    let mut best_weights = None;
    let track_best = config.early_stopping.is_some() || config.checkpointing;
    let mut patience_left = config.early_stopping.as_ref().map(|es| es.patience);
    let mut cancelled = false;

    'epochs: for epoch in 1..=config.epochs {
        for (batch_idx, start) in (0..train_y.len()).step_by(config.batch_size).enumerate() {
            let batch = batch_idx + 1;
            if let Some(token) = cancel {
                if batch % CANCEL_CHECK_INTERVAL == 1 && token.is_cancelled() {
                    tracing::info!(epoch, batch, "training cancelled");
                    if config.checkpointing && !history.is_empty() {
                        cancelled = true;
                        break 'epochs;
                    }
                    return Err(KtrdrError::Cancelled);
                }
            }

            let len = config.batch_size.min(train_y.len() - start);
            let x = train_x.rows(start, len).into_owned();
            let loss =
                model.train_batch(&x, &train_y[start..start + len], &mut optimizer, &mut dropout_rng)?;

            if let Some(cb) = progress {
                cb(ProgressUpdate::batch(
                    epoch,
                    config.epochs,
                    batch,
                    total_batches,
                    loss,
                ));
            }
        }

        let (train_loss, train_accuracy) = loss_and_accuracy(model, train_x, train_y);
        let (val_loss, val_accuracy) = loss_and_accuracy(model, val_x, val_y);
        if !train_loss.is_finite() || !val_loss.is_finite() {
            return Err(KtrdrError::Model(format!(
                "training diverged at epoch {epoch}: train_loss={train_loss} val_loss={val_loss}"
            )));
        }
        history.push(EpochRecord {
            epoch,
            train_loss,
            val_loss,
            train_accuracy,
            val_accuracy,
        });
        if let Some(cb) = progress {
            cb(ProgressUpdate::epoch(
                epoch,
                config.epochs,
                ProgressMetrics {
                    train_loss: Some(train_loss),
                    val_loss: Some(val_loss),
                    train_accuracy: Some(train_accuracy),
                    val_accuracy: Some(val_accuracy),
                },
            ));
        }

        if track_best {
            let min_delta = config
                .early_stopping
                .as_ref()
                .map(|es| es.min_delta)
                .unwrap_or(0.0);
            if val_loss < best_val_loss - min_delta {
                best_val_loss = val_loss;
                best_weights = Some(model.to_weights());
                if let Some(es) = &config.early_stopping {
                    patience_left = Some(es.patience);
                }
            } else if let Some(left) = patience_left.as_mut() {
                if *left == 0 {
                    tracing::info!(epoch, best_val_loss, "early stopping");
                    break;
                }
                *left -= 1;
            }
        }
    }

    // Early stopping and checkpointing restore the best validation epoch.
    if let Some(weights) = best_weights {
        model.restore(&weights);
    }

    let last = history.last().cloned().unwrap_or(EpochRecord {
        epoch: 0,
        train_loss: 0.0,
        val_loss: 0.0,
        train_accuracy: 0.0,
        val_accuracy: 0.0,
    });
    let (final_train_loss, final_train_accuracy) = loss_and_accuracy(model, train_x, train_y);
    let (final_val_loss, final_val_accuracy) = if val_y.is_empty() {
        (last.val_loss, last.val_accuracy)
    } else {
        loss_and_accuracy(model, val_x, val_y)
    };

    Ok(TrainOutcome {
        metrics: TrainingMetrics {
            final_train_loss,
            final_val_loss,
            final_train_accuracy,
            final_val_accuracy,
            history,
        },
        cancelled,
    })
}
