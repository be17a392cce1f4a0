use nalgebra::DMatrix;
use rand::SeedableRng;
use rand_chacha::ChaCha8Rng;
use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::Arc;

use data_manager::{DataManager, DataManagerConfig, LoadMode};
use fuzzy_engine::FuzzyEngine;
use indicator_engine::{is_defined, params_hash, IndicatorEngine, IndicatorFrame};
use trading_core::{
    CancelToken, Clock, CoreContext, DataSummary, IndicatorRow, KtrdrError, ModelInfo,
    ProgressCallback, RunArtifacts, RunStatus, SeriesKey, StrategyConfig, TimeRange,
    TimeSeriesStore, TrainingRunResult,
};

use crate::artifact::{weights_hash, ModelArtifact, ModelMetadata};
use crate::evaluate;
use crate::features::{self, TimeframeInputs};
use crate::network::Mlp;
use crate::normalize::NormStats;
use crate::split;
use crate::trainer;

/// The training work function family: data through features through the
/// training loop to an atomically persisted artifact. Owns no progress or
/// cancellation state of its own; both are forwarded to the training loop.
pub struct TrainingPipeline {
    data: Arc<DataManager>,
    store: Arc<dyn TimeSeriesStore>,
    model_dir: PathBuf,
    clock: Arc<dyn Clock>,
}

impl TrainingPipeline {
    pub fn new(ctx: &CoreContext, dm_config: DataManagerConfig) -> Self {
        let data = Arc::new(DataManager::new(
            ctx.store.clone(),
            ctx.provider.clone(),
            dm_config,
        ));
        Self {
            data,
            store: ctx.store.clone(),
            model_dir: ctx.model_dir.clone(),
            clock: ctx.clock.clone(),
        }
    }

    /// Train one strategy over `[range.start, range.end]` and return the
    /// standardized result record. Cancellation surfaces as `Cancelled`
    /// (no artifact) unless checkpointing kept a completed epoch.
    pub async fn train_strategy(
        &self,
        config: &StrategyConfig,
        range: TimeRange,
        mode: LoadMode,
        progress: Option<ProgressCallback>,
        cancel: Option<CancelToken>,
    ) -> Result<TrainingRunResult, KtrdrError> {
        config.validate()?;
        let timeframes = features::sorted_timeframes(config);
        let base_tf = timeframes[0];
        let fuzzy = FuzzyEngine::from_config(&config.fuzzy_sets)?;

        // 1-2: load bars, compute indicator and fuzzy frames per symbol
        // and per timeframe. The engine call per symbol is what resets
        // rolling indicator state at symbol boundaries.
        let mut datasets = Vec::new();
        for symbol in &config.symbols {
            let mut inputs = Vec::new();
            for tf in &timeframes {
                let key = SeriesKey::new(symbol.clone(), *tf);
                let (bars, report) = self.data.load_data(&key, range, mode).await?;
                if bars.is_empty() {
                    return Err(KtrdrError::NoData {
                        symbol: symbol.to_string(),
                        timeframe: tf.to_string(),
                    });
                }
                if !report.is_complete() {
                    tracing::warn!(series = %key, gaps = report.remaining_gaps.len(), "training on an incomplete frame");
                }

                let indicators = IndicatorEngine::compute(&config.indicators, &bars)?;
                self.persist_indicators(&key, config, &indicators).await?;
                let fuzzy_frame = fuzzy.fuzzify(&indicators, &bars)?;
                inputs.push(TimeframeInputs {
                    timeframe: *tf,
                    bars,
                    indicators,
                    fuzzy: fuzzy_frame,
                });
            }
            datasets.push(features::build_symbol_dataset(config, symbol, &inputs)?);
        }

        // 3-5: per-symbol features/labels concatenated in config order.
        let dataset = features::concat_datasets(config, base_tf, datasets);
        if dataset.rows.is_empty() {
            return Err(KtrdrError::Model(
                "no training samples survived warm-up and labeling".to_string(),
            ));
        }

        // 6-7: split, then normalize with training-split statistics only.
        let split = split::split_rows(&dataset.symbol_tags, &config.training);
        let stats = NormStats::fit(&dataset.rows, &split.train);
        let normalized = stats.apply(&dataset.rows);

        let n_features = dataset.feature_names.len();
        let gather = |indices: &[usize]| -> (DMatrix<f64>, Vec<usize>) {
            let x = DMatrix::from_fn(indices.len(), n_features, |r, c| normalized[indices[r]][c]);
            let y = indices.iter().map(|&i| dataset.labels[i]).collect();
            (x, y)
        };
        let (train_x, train_y) = gather(&split.train);
        let (val_x, val_y) = gather(&split.val);
        let (test_x, test_y) = gather(&split.test);

        // 8: seeded model, training loop with pass-through progress/cancel.
        // The loop is CPU-bound and runs on the blocking pool so the
        // caller's executor stays responsive.
        let model_config = config.model.clone();
        let training_config = config.training.clone();
        let classes = dataset.label_classes.len();
        let (model, outcome) = tokio::task::spawn_blocking(move || {
            let mut rng = ChaCha8Rng::seed_from_u64(training_config.seed);
            let mut model = Mlp::new(
                n_features,
                &model_config.layers,
                classes,
                model_config.activation,
                model_config.dropout,
                &mut rng,
            );
            let outcome = trainer::train(
                &mut model,
                &train_x,
                &train_y,
                &val_x,
                &val_y,
                &training_config,
                progress.as_ref(),
                cancel.as_ref(),
            );
            (model, outcome)
        })
        .await
        .map_err(|e| KtrdrError::Model(format!("training task failed: {e}")))?;
        let outcome = outcome?;

        // 9: evaluation, overall and per originating symbol.
        let test_metrics =
            evaluate::dataset_metrics(&model, &test_x, &test_y, &dataset.label_classes);
        let mut per_symbol_metrics = BTreeMap::new();
        for symbol in &config.symbols {
            let name = symbol.to_string();
            let indices: Vec<usize> = split
                .test
                .iter()
                .copied()
                .filter(|&i| dataset.symbol_tags[i] == name)
                .collect();
            if indices.is_empty() {
                continue;
            }
            let (x, y) = gather(&indices);
            per_symbol_metrics.insert(
                name,
                evaluate::dataset_metrics(&model, &x, &y, &dataset.label_classes),
            );
        }

        let feature_importance: BTreeMap<String, f64> = dataset
            .feature_names
            .iter()
            .cloned()
            .zip(model.input_weight_magnitudes())
            .collect();

        // 10: atomic artifact persistence.
        let created_at = self.clock.now();
        let weights = model.to_weights();
        let blob = postcard::to_allocvec(&weights)
            .map_err(|e| KtrdrError::Persistence(e.to_string()))?;
        let metadata = ModelMetadata {
            strategy_name: config.name.clone(),
            version: format!("v{}", created_at.format("%Y%m%d%H%M%S")),
            created_at,
            content_hash: weights_hash(&blob),
            architecture: config.model.architecture.clone(),
            parameter_count: model.parameter_count(),
            feature_names: dataset.feature_names.clone(),
            label_classes: dataset.label_classes.clone(),
            normalization: stats,
            training_metrics: outcome.metrics.clone(),
            test_metrics: test_metrics.clone(),
        };
        let artifact = ModelArtifact {
            metadata,
            weights,
            config: config.clone(),
        };
        let model_path = artifact.save(&self.model_dir)?;

        Ok(TrainingRunResult {
            model_path: Some(model_path),
            training_metrics: outcome.metrics,
            test_metrics,
            artifacts: RunArtifacts {
                feature_importance,
                per_symbol_metrics,
            },
            model_info: ModelInfo {
                architecture: config.model.architecture.clone(),
                parameter_count: artifact.metadata.parameter_count,
                feature_names: dataset.feature_names,
                label_classes: dataset.label_classes,
            },
            data_summary: DataSummary {
                symbols: config.symbols.iter().map(|s| s.to_string()).collect(),
                timeframes,
                sample_counts_per_symbol: dataset.sample_counts,
                total_samples: dataset.rows.len(),
                date_range: dataset.date_range,
            },
            session_info: None,
            session_id: None,
            status: Some(if outcome.cancelled {
                RunStatus::Cancelled
            } else {
                RunStatus::Completed
            }),
            error: None,
            resource_usage: None,
        })
    }

    /// Write computed indicator columns through the store contract. Single
    /// columns persist as numbers, multi-output indicators as one record
    /// per timestamp; warm-up stays null.
    async fn persist_indicators(
        &self,
        key: &SeriesKey,
        config: &StrategyConfig,
        frame: &IndicatorFrame,
    ) -> Result<(), KtrdrError> {
        for ind in &config.indicators {
            let hash = params_hash(&ind.params);
            let prefix = format!("{}.", ind.name);
            let fields: Vec<&str> = frame
                .column_names()
                .filter(|c| *c == ind.name || c.starts_with(&prefix))
                .collect();

            let rows: Vec<IndicatorRow> = if fields.len() == 1 && fields[0] == ind.name {
                frame.to_rows(&ind.name)
            } else {
                (0..frame.len())
                    .map(|i| {
                        let mut record = serde_json::Map::new();
                        for field in &fields {
                            let value = frame.column(field).map(|c| c[i]).unwrap_or(f64::NAN);
                            let json = if is_defined(value) {
                                serde_json::json!(value)
                            } else {
                                serde_json::Value::Null
                            };
                            record.insert(
                                field.strip_prefix(&prefix).unwrap_or(field).to_string(),
                                json,
                            );
                        }
                        IndicatorRow {
                            ts: frame.ts[i],
                            value: serde_json::Value::Object(record),
                        }
                    })
                    .collect()
            };
            self.store
                .upsert_indicator(key, &ind.name, &hash, &rows)
                .await?;
        }
        Ok(())
    }
}
