pub mod artifact;
pub mod evaluate;
pub mod features;
pub mod labels;
pub mod network;
pub mod normalize;
pub mod pipeline;
pub mod split;
pub mod trainer;

pub use artifact::{ModelArtifact, ModelMetadata};
pub use network::{LayerWeights, Mlp};
pub use normalize::NormStats;
pub use pipeline::TrainingPipeline;
pub use trainer::{TrainOutcome, CANCEL_CHECK_INTERVAL};

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use chrono::{DateTime, Duration, Utc};
    use std::sync::Arc;
    use timeseries_store::MemoryStore;
    use trading_core::{
        Bar, BarSource, CancelToken, ContractDetails, CoreContext, KtrdrError,
        MarketDataProvider, ProviderStatus, RunStatus, SeriesKey, StrategyConfig, Symbol,
        TimeRange, TimeSeriesStore, Timeframe,
    };

    use data_manager::{DataManagerConfig, LoadMode};

    /// Training tests run in Local mode; the provider must never be hit.
    struct UnreachableProvider;

    #[async_trait]
    impl MarketDataProvider for UnreachableProvider {
        async fn fetch_bars(
            &self,
            _symbol: &Symbol,
            _timeframe: Timeframe,
            _range: TimeRange,
        ) -> Result<Vec<Bar>, KtrdrError> {
            panic!("provider must not be contacted in Local mode");
        }

        async fn contract_details(&self, symbol: &Symbol) -> Result<ContractDetails, KtrdrError> {
            Err(KtrdrError::Contract {
                symbol: symbol.to_string(),
                message: "offline".to_string(),
            })
        }

        async fn connect(&self) -> Result<(), KtrdrError> {
            Ok(())
        }

        async fn disconnect(&self) -> Result<(), KtrdrError> {
            Ok(())
        }

        async fn status(&self) -> ProviderStatus {
            ProviderStatus::Disconnected
        }

        fn provider_name(&self) -> &str {
            "unreachable"
        }
    }

    fn strategy_yaml(symbols: &str) -> String {
        format!(
            r#"
name: pipeline-test
symbols: {symbols}
timeframes: ["1d"]
indicators:
  - name: rsi
    params: {{ period: 14 }}
  - name: sma
    params: {{ period: 10 }}
fuzzy_sets:
  - {{ input: rsi, name: rsi_low, kind: triangular, params: [0, 25, 45] }}
  - {{ input: rsi, name: rsi_high, kind: triangular, params: [55, 75, 100] }}
features:
  include_indicators: [sma]
  include_fuzzy: [rsi_low, rsi_high]
labels:
  generator: directional_move
  params: {{ horizon: 3, upper_threshold: 0.01, lower_threshold: -0.01 }}
model:
  architecture: mlp
  layers: [16]
  dropout: 0.0
  activation: relu
training:
  epochs: 8
  batch_size: 32
  learning_rate: 0.005
  val_split: 0.15
  test_split: 0.15
  seed: 42
"#
        )
    }

    fn synthetic_bars(n: usize) -> Vec<Bar> {
        let start = "2023-01-02T00:00:00Z".parse::<DateTime<Utc>>().unwrap();
        (0..n)
            .map(|i| {
                let t = i as f64;
                let close = 100.0 + 10.0 * (t / 9.0).sin() + 0.02 * t;
                Bar {
                    ts: start + Duration::days(i as i64),
                    open: close - 0.3,
                    high: close + 1.2,
                    low: close - 1.2,
                    close,
                    volume: 50_000.0 + 100.0 * t,
                    source: BarSource::Broker,
                }
            })
            .collect()
    }

    async fn seeded_context(symbols: &[&str], model_dir: &std::path::Path) -> CoreContext {
        let store = Arc::new(MemoryStore::new());
        let bars = synthetic_bars(250);
        for symbol in symbols {
            let key = SeriesKey::new(Symbol::new(*symbol).unwrap(), Timeframe::Day1);
            store.upsert_bars(&key, &bars).await.unwrap();
        }
        CoreContext::new(store, Arc::new(UnreachableProvider), model_dir)
    }

    fn full_range() -> TimeRange {
        TimeRange::new(
            "2023-01-02T00:00:00Z".parse().unwrap(),
            "2023-09-30T00:00:00Z".parse().unwrap(),
        )
        .unwrap()
    }

    #[tokio::test]
    async fn end_to_end_training_produces_a_complete_result() {
        let model_dir = tempfile::tempdir().unwrap();
        let ctx = seeded_context(&["AAPL"], model_dir.path()).await;
        let pipeline = TrainingPipeline::new(&ctx, DataManagerConfig::default());
        let config = StrategyConfig::from_yaml_str(&strategy_yaml("[AAPL]")).unwrap();

        let result = pipeline
            .train_strategy(&config, full_range(), LoadMode::Local, None, None)
            .await
            .unwrap();

        assert_eq!(result.status, Some(RunStatus::Completed));
        let model_path = result.model_path.as_ref().unwrap();
        assert!(model_path.join("weights.bin").exists());
        assert!(model_path.join("config.yaml").exists());
        assert!(model_path.join("metadata.json").exists());

        // Artifact round trip validates the content hash.
        let artifact = ModelArtifact::load(model_path).unwrap();
        assert_eq!(artifact.metadata.feature_names, result.model_info.feature_names);
        assert_eq!(
            artifact.metadata.label_classes,
            vec!["down", "flat", "up"]
        );

        // Feature importance covers exactly the feature columns.
        let importance_keys: Vec<&String> =
            result.artifacts.feature_importance.keys().collect();
        assert_eq!(importance_keys.len(), result.model_info.feature_names.len());

        assert_eq!(result.data_summary.symbols, vec!["AAPL"]);
        assert_eq!(result.data_summary.total_samples,
            result.data_summary.sample_counts_per_symbol["AAPL"]);
        assert!(!result.training_metrics.history.is_empty());
        assert!(result.test_metrics.confusion_matrix.len() == 3);
    }

    #[tokio::test]
    async fn symbol_order_does_not_change_sample_counts_or_metrics() {
        // Identical underlying series for both symbols: permuting the
        // symbol order must leave counts identical and metrics equal.
        let dir_a = tempfile::tempdir().unwrap();
        let dir_b = tempfile::tempdir().unwrap();
        let ctx_a = seeded_context(&["AAPL", "MSFT"], dir_a.path()).await;
        let ctx_b = seeded_context(&["AAPL", "MSFT"], dir_b.path()).await;

        let config_a = StrategyConfig::from_yaml_str(&strategy_yaml("[AAPL, MSFT]")).unwrap();
        let config_b = StrategyConfig::from_yaml_str(&strategy_yaml("[MSFT, AAPL]")).unwrap();

        let result_a = TrainingPipeline::new(&ctx_a, DataManagerConfig::default())
            .train_strategy(&config_a, full_range(), LoadMode::Local, None, None)
            .await
            .unwrap();
        let result_b = TrainingPipeline::new(&ctx_b, DataManagerConfig::default())
            .train_strategy(&config_b, full_range(), LoadMode::Local, None, None)
            .await
            .unwrap();

        assert_eq!(
            result_a.data_summary.sample_counts_per_symbol,
            result_b.data_summary.sample_counts_per_symbol
        );
        assert_eq!(result_a.data_summary.total_samples, result_b.data_summary.total_samples);
        let diff = (result_a.test_metrics.accuracy - result_b.test_metrics.accuracy).abs();
        assert!(diff <= 0.001, "accuracy drifted across symbol orders: {diff}");
    }

    #[tokio::test]
    async fn cancelled_run_writes_no_artifact() {
        let model_dir = tempfile::tempdir().unwrap();
        let ctx = seeded_context(&["AAPL"], model_dir.path()).await;
        let pipeline = TrainingPipeline::new(&ctx, DataManagerConfig::default());
        let mut config = StrategyConfig::from_yaml_str(&strategy_yaml("[AAPL]")).unwrap();
        config.training.epochs = 100;

        let token = CancelToken::new();
        token.cancel();
        let err = pipeline
            .train_strategy(&config, full_range(), LoadMode::Local, None, Some(token))
            .await
            .unwrap_err();
        assert!(matches!(err, KtrdrError::Cancelled));

        // No model directory appeared, not even a temp one.
        let entries: Vec<_> = std::fs::read_dir(model_dir.path())
            .unwrap()
            .filter_map(|e| e.ok())
            .collect();
        assert!(entries.is_empty(), "artifact leaked: {entries:?}");
    }

    #[tokio::test]
    async fn fixed_seed_reproduces_metrics_exactly() {
        let dir_a = tempfile::tempdir().unwrap();
        let dir_b = tempfile::tempdir().unwrap();

        let run = |dir: std::path::PathBuf| async move {
            let ctx = seeded_context(&["AAPL"], &dir).await;
            TrainingPipeline::new(&ctx, DataManagerConfig::default())
                .train_strategy(
                    &StrategyConfig::from_yaml_str(&strategy_yaml("[AAPL]")).unwrap(),
                    full_range(),
                    LoadMode::Local,
                    None,
                    None,
                )
                .await
                .unwrap()
        };
        let result_a = run(dir_a.path().to_path_buf()).await;
        let result_b = run(dir_b.path().to_path_buf()).await;

        assert_eq!(result_a.training_metrics, result_b.training_metrics);
        assert_eq!(result_a.test_metrics, result_b.test_metrics);
    }
}
