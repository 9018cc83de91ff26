//! Strategy Training Pipeline.
//!
//! End-to-end composition of the Data Repository, Indicator Engine, Fuzzy
//! Engine, Feature Engineer, ZigZag Labeler, Model Trainer and Model
//! Storage, driven by a strategy manifest. The pipeline itself has no
//! opinion about how it's scheduled; [`crate::operations`] surfaces a run of
//! it as a `training` operation.

use crate::cancellation::Token;
use crate::data::DataRepository;
use crate::error::{KtrdrError, KtrdrResult};
use crate::features::{self, FeatureConfig};
use crate::fuzzy;
use crate::indicators;
use crate::manifest::StrategyManifest;
use crate::operations::orchestrator::ProgressReporter;
use crate::operations::progress::RendererRegistry;
use crate::operations::OperationKind;
use crate::storage::ModelStorage;
use crate::training::{self, network::Network, TrainingConfig, TrainingHistory};
use crate::zigzag;
use chrono::{DateTime, Utc};
use nalgebra::DMatrix;
use rand::SeedableRng;
use rand_chacha::ChaCha8Rng;
use serde_json::json;
use std::collections::HashMap;
use std::path::PathBuf;

pub struct TrainingRequest {
    pub strategy: String,
    pub symbol: String,
    pub timeframe: String,
    pub start: Option<DateTime<Utc>>,
    pub end: Option<DateTime<Utc>>,
    pub manifest: StrategyManifest,
}

/// What the pipeline produced, before the orchestrator translates it into an
/// operation result-summary or a `cancelled` transition.
#[derive(Debug)]
pub enum PipelineOutcome {
    Completed {
        result_summary: serde_json::Value,
    },
    Cancelled {
        checkpoint_path: PathBuf,
        epoch_reached: usize,
    },
}

/// `[0, train_end)`, `[train_end, val_end)`, `[val_end, rows)` — chronological,
/// never shuffled, since shuffling a time series before a train/val/test split
/// leaks future information into training.
fn chronological_split(rows: usize, train_ratio: f64, val_ratio: f64) -> (usize, usize) {
    let train_end = ((rows as f64) * train_ratio).round() as usize;
    let val_end = (train_end + ((rows as f64) * val_ratio).round() as usize).min(rows);
    (train_end.min(rows), val_end)
}

fn columns(matrix: &DMatrix<f64>, start: usize, end: usize) -> DMatrix<f64> {
    matrix.columns(start, end - start).clone_owned()
}

fn metrics_json(history: &TrainingHistory) -> (serde_json::Value, serde_json::Value) {
    let last = |v: &[f64]| v.last().copied().unwrap_or(f64::NAN);
    let train = json!({
        "loss": last(&history.train_loss),
        "accuracy": last(&history.train_accuracy),
    });
    let validation = json!({
        "loss": last(&history.val_loss),
        "accuracy": last(&history.val_accuracy),
    });
    (train, validation)
}

/// Drives C2 -> C7 -> C8 -> C9 -> C10, trains via C11, persists via C12.
/// `token` is polled between training epochs (C11's own checkpoint) and once
/// more before each pipeline stage, so a cancellation requested while data is
/// loading or features are being computed is still observed promptly.
#[allow(clippy::too_many_arguments)]
pub fn run(
    repository: &DataRepository,
    storage: &ModelStorage,
    request: TrainingRequest,
    token: &Token,
    reporter: &ProgressReporter,
) -> KtrdrResult<PipelineOutcome> {
    let manifest = &request.manifest;

    if token.is_requested() {
        return Ok(PipelineOutcome::Cancelled {
            checkpoint_path: PathBuf::new(),
            epoch_reached: 0,
        });
    }
    reporter.report(
        0.0,
        format!("loading {}/{}", request.symbol, request.timeframe),
        HashMap::new(),
    );
    let bar_frame = repository.load(&request.symbol, &request.timeframe, request.start, request.end)?;

    let indicator_frame = indicators::compute(&bar_frame, &manifest.indicators)?;
    let fuzzy_frame = fuzzy::evaluate(&indicator_frame, &manifest.fuzzy_sets)?;
    let feature_config = FeatureConfig::from(&manifest.features);
    let feature_matrix = features::prepare(&bar_frame, &fuzzy_frame, &feature_config);
    let labels = zigzag::generate(
        &bar_frame,
        manifest.training.zigzag_threshold,
        manifest.training.zigzag_lookahead,
    );

    let (trimmed, kept_rows) = feature_matrix.drop_nan_rows();
    let trimmed_labels: Vec<usize> = kept_rows.iter().map(|&i| labels[i].class_index()).collect();
    let rows = trimmed.rows();
    if rows == 0 {
        return Err(KtrdrError::invalid_input(
            "no rows survive warm-up trimming; lower lookback or provide more history",
        ));
    }

    let (train_end, val_end) = chronological_split(
        rows,
        manifest.training.train_ratio,
        manifest.training.val_ratio,
    );
    if train_end == 0 || val_end == train_end || val_end == rows {
        return Err(KtrdrError::invalid_input(
            "train/val/test split ratios leave an empty partition for the available row count",
        ));
    }

    let full_matrix = trimmed.to_dmatrix();
    let x_train = columns(&full_matrix, 0, train_end);
    let x_val = columns(&full_matrix, train_end, val_end);
    let x_test = columns(&full_matrix, val_end, rows);
    let y_train = &trimmed_labels[0..train_end];
    let y_val = &trimmed_labels[train_end..val_end];
    let y_test = &trimmed_labels[val_end..rows];

    let training_config = TrainingConfig {
        hidden_layers: manifest.model.hidden_layers.clone(),
        max_epochs: manifest.training.max_epochs,
        patience: manifest.training.patience,
        learning_rate: manifest.model.learning_rate,
    };
    // Weight init and permutation shuffling are reproducible given the same
    // manifest; the seed is derived from the strategy name so two strategies
    // trained in the same process don't share an RNG stream.
    let seed = request
        .strategy
        .bytes()
        .fold(0xa5a5_a5a5_u64, |acc, b| acc.wrapping_mul(31).wrapping_add(b as u64));
    let mut rng = ChaCha8Rng::seed_from_u64(seed);
    let renderers = RendererRegistry::default();

    let outcome = training::fit(
        &x_train,
        y_train,
        &x_val,
        y_val,
        &training_config,
        &mut rng,
        token,
        |epoch, total, history| {
            let mut state = HashMap::new();
            state.insert("epoch_index".to_string(), epoch.to_string());
            state.insert("total_epochs".to_string(), total.to_string());
            state.insert("batch_number".to_string(), "1".to_string());
            state.insert("batch_total".to_string(), "1".to_string());
            if let (Some(&loss), Some(&acc)) = (history.train_loss.last(), history.train_accuracy.last()) {
                state.insert("train_loss".to_string(), loss.to_string());
                state.insert("train_accuracy".to_string(), acc.to_string());
            }
            let (percentage, step, context) = renderers.render(OperationKind::Training, &state);
            reporter.report(percentage, step, context);
        },
    )?;

    match outcome {
        training::FitOutcome::Cancelled { checkpoint, history } => {
            let epoch_reached = history.train_loss.len();
            let metrics = json!({"cancelled_at_epoch": epoch_reached});
            let effective_config =
                serde_json::to_value(manifest).map_err(|e| KtrdrError::storage(e.to_string()))?;
            let path = storage.save(
                &checkpoint,
                &request.strategy,
                &request.symbol,
                &request.timeframe,
                &metrics,
                &json!({}),
                &effective_config,
            )?;
            Ok(PipelineOutcome::Cancelled {
                checkpoint_path: path,
                epoch_reached,
            })
        }
        training::FitOutcome::Completed { model, history } => {
            finalize(
                &request,
                storage,
                &model,
                &history,
                &x_test,
                y_test,
                &trimmed,
                &mut rng,
            )
        }
    }
}

fn finalize(
    request: &TrainingRequest,
    storage: &ModelStorage,
    model: &Network,
    history: &TrainingHistory,
    x_test: &DMatrix<f64>,
    y_test: &[usize],
    trimmed: &crate::features::FeatureMatrix,
    rng: &mut ChaCha8Rng,
) -> KtrdrResult<PipelineOutcome> {
    let manifest = &request.manifest;
    let test_accuracy = model.accuracy(x_test, y_test);
    let (train_metrics, validation_metrics) = metrics_json(history);

    let importance = training::permutation_importance(
        model,
        x_test,
        y_test,
        trimmed.names(),
        manifest.training.importance_iterations,
        rng,
    );
    let importance_json =
        serde_json::to_value(&importance).map_err(|e| KtrdrError::storage(e.to_string()))?;

    let metrics = json!({
        "train": train_metrics,
        "validation": validation_metrics,
        "test": {"accuracy": test_accuracy},
        "history": {
            "train_loss": history.train_loss,
            "val_loss": history.val_loss,
            "train_accuracy": history.train_accuracy,
            "val_accuracy": history.val_accuracy,
        },
    });
    let effective_config =
        serde_json::to_value(manifest).map_err(|e| KtrdrError::storage(e.to_string()))?;

    let artefact_path = storage.save(
        model,
        &request.strategy,
        &request.symbol,
        &request.timeframe,
        &metrics,
        &importance_json,
        &effective_config,
    )?;

    let result_summary = json!({
        "training_metrics": train_metrics,
        "validation_metrics": validation_metrics,
        "artifacts": {
            "model_path": artefact_path.display().to_string(),
            "analytics_directory": artefact_path.display().to_string(),
        },
    });

    Ok(PipelineOutcome::Completed { result_summary })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::data::file_backend::FileBackend;
    use crate::data::{Bar, BarFrame};
    use crate::fuzzy::MembershipFunction;
    use crate::indicators::{IndicatorKind, IndicatorSpec};
    use crate::manifest::{FeaturesSection, ModelSection, StrategyManifest, TrainingSection};
    use crate::operations::{OperationsRegistry, OperationKind};
    use crate::cancellation::CancellationCoordinator;
    use std::collections::BTreeMap;

    fn synthetic_bars(n: usize) -> BarFrame {
        let bars = (0..n)
            .map(|i| {
                let base = 100.0 + ((i % 20) as f64 - 10.0) * 0.5 + i as f64 * 0.01;
                Bar {
                    ts: DateTime::<Utc>::from_timestamp(i as i64 * 3600, 0).unwrap(),
                    open: base,
                    high: base + 1.0,
                    low: base - 1.0,
                    close: base + 0.2,
                    volume: 1000.0 + i as f64,
                }
            })
            .collect();
        BarFrame::new(bars).unwrap()
    }

    fn toy_manifest() -> StrategyManifest {
        let mut sets = BTreeMap::new();
        sets.insert(
            "oversold".to_string(),
            MembershipFunction::Triangular {
                a: 0.0,
                b: 50.0,
                c: 100.0,
            },
        );
        let mut fuzzy_sets = BTreeMap::new();
        fuzzy_sets.insert("rsi_5".to_string(), sets);

        StrategyManifest {
            name: "toy".to_string(),
            indicators: vec![IndicatorSpec {
                feature_id: "rsi_5".to_string(),
                kind: IndicatorKind::Rsi { period: 5 },
            }],
            fuzzy_sets,
            model: ModelSection {
                hidden_layers: vec![4],
                learning_rate: 0.05,
            },
            features: FeaturesSection {
                lookback: 2,
                include_price_context: false,
                include_volume_context: false,
            },
            training: TrainingSection {
                zigzag_threshold: 0.02,
                zigzag_lookahead: 5,
                train_ratio: 0.6,
                val_ratio: 0.2,
                test_ratio: 0.2,
                patience: 5,
                max_epochs: 15,
                batch_size: 32,
                importance_iterations: 2,
            },
        }
    }

    #[test]
    fn end_to_end_training_produces_result_summary_and_artefact() {
        let data_dir = tempfile::tempdir().unwrap();
        let model_dir = tempfile::tempdir().unwrap();
        let backend = FileBackend::new(data_dir.path()).unwrap();
        let repository = DataRepository::new(Box::new(backend));
        repository.save("AAPL", "1h", &synthetic_bars(120)).unwrap();
        let storage = ModelStorage::new(model_dir.path());

        let registry = OperationsRegistry::new();
        let op_id = registry.create(OperationKind::Training, HashMap::new());
        let reporter = ProgressReporter::new(registry.clone(), op_id.clone());
        let coordinator = CancellationCoordinator::default();
        let token = coordinator.create_token(&op_id);

        let request = TrainingRequest {
            strategy: "toy-strategy".to_string(),
            symbol: "AAPL".to_string(),
            timeframe: "1h".to_string(),
            start: None,
            end: None,
            manifest: toy_manifest(),
        };

        let outcome = run(&repository, &storage, request, &token, &reporter).unwrap();
        match outcome {
            PipelineOutcome::Completed { result_summary } => {
                assert!(result_summary["artifacts"]["model_path"].is_string());
                assert!(result_summary["training_metrics"]["loss"].is_number());
            }
            PipelineOutcome::Cancelled { .. } => panic!("expected completion"),
        }

        let record = registry.get(&op_id).unwrap();
        assert!(record.progress.percentage > 0.0);
    }

    #[test]
    fn missing_symbol_fails_with_data_not_found() {
        let data_dir = tempfile::tempdir().unwrap();
        let model_dir = tempfile::tempdir().unwrap();
        let backend = FileBackend::new(data_dir.path()).unwrap();
        let repository = DataRepository::new(Box::new(backend));
        let storage = ModelStorage::new(model_dir.path());

        let registry = OperationsRegistry::new();
        let op_id = registry.create(OperationKind::Training, HashMap::new());
        let reporter = ProgressReporter::new(registry.clone(), op_id.clone());
        let coordinator = CancellationCoordinator::default();
        let token = coordinator.create_token(&op_id);

        let request = TrainingRequest {
            strategy: "toy-strategy".to_string(),
            symbol: "MISSING".to_string(),
            timeframe: "1h".to_string(),
            start: None,
            end: None,
            manifest: toy_manifest(),
        };

        let err = run(&repository, &storage, request, &token, &reporter).unwrap_err();
        assert_eq!(err.category(), "data-not-found");
    }

    #[test]
    fn already_cancelled_token_short_circuits_before_loading() {
        let data_dir = tempfile::tempdir().unwrap();
        let model_dir = tempfile::tempdir().unwrap();
        let backend = FileBackend::new(data_dir.path()).unwrap();
        let repository = DataRepository::new(Box::new(backend));
        let storage = ModelStorage::new(model_dir.path());

        let registry = OperationsRegistry::new();
        let op_id = registry.create(OperationKind::Training, HashMap::new());
        let reporter = ProgressReporter::new(registry.clone(), op_id.clone());
        let coordinator = CancellationCoordinator::default();
        let token = coordinator.create_token(&op_id);
        token.request("user stop");

        let request = TrainingRequest {
            strategy: "toy-strategy".to_string(),
            symbol: "AAPL".to_string(),
            timeframe: "1h".to_string(),
            start: None,
            end: None,
            manifest: toy_manifest(),
        };

        let outcome = run(&repository, &storage, request, &token, &reporter).unwrap();
        assert!(matches!(outcome, PipelineOutcome::Cancelled { .. }));
    }
}
