//! Model Trainer.
//!
//! Trains the feed-forward classifier in [`network`] with early stopping on
//! validation loss, cooperative cancellation between epochs, and permutation
//! feature importance.

pub mod network;

use crate::cancellation::Token;
use crate::error::{KtrdrError, KtrdrResult};
use nalgebra::DMatrix;
use network::{Adam, Network};
use rand::seq::SliceRandom;
use rand_chacha::ChaCha8Rng;
use std::collections::BTreeMap;

#[derive(Debug, Clone)]
pub struct TrainingConfig {
    pub hidden_layers: Vec<usize>,
    pub max_epochs: usize,
    pub patience: usize,
    pub learning_rate: f64,
}

impl Default for TrainingConfig {
    fn default() -> Self {
        Self {
            hidden_layers: vec![16, 8],
            max_epochs: 200,
            patience: 10,
            learning_rate: 0.01,
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct TrainingHistory {
    pub train_loss: Vec<f64>,
    pub train_accuracy: Vec<f64>,
    pub val_loss: Vec<f64>,
    pub val_accuracy: Vec<f64>,
}

pub enum FitOutcome {
    Completed {
        model: Network,
        history: TrainingHistory,
    },
    /// Cancellation was observed between epochs; `checkpoint` holds the
    /// weights as of the last completed epoch.
    Cancelled {
        checkpoint: Network,
        history: TrainingHistory,
    },
}

/// Trains against `(x_train, y_train)`, tracking `(x_val, y_val)` loss for
/// early stopping. Columns are samples in both `x_train`/`x_val`. Restores
/// the best-by-validation-loss weights before returning on normal
/// completion; a cancellation mid-training returns the last completed
/// epoch's weights instead, since "best" weights may lag behind what the
/// caller wants checkpointed right now.
pub fn fit(
    x_train: &DMatrix<f64>,
    y_train: &[usize],
    x_val: &DMatrix<f64>,
    y_val: &[usize],
    config: &TrainingConfig,
    rng: &mut ChaCha8Rng,
    token: &Token,
    mut on_epoch: impl FnMut(usize, usize, &TrainingHistory),
) -> KtrdrResult<FitOutcome> {
    let mut network = Network::new(x_train.nrows(), &config.hidden_layers, rng);
    let mut adam = Adam::new(&network, config.learning_rate);
    let mut history = TrainingHistory::default();

    let mut best_val_loss = f64::INFINITY;
    let mut best_model = network.clone();
    let mut best_epoch = 0usize;
    let mut epochs_without_improvement = 0usize;

    for epoch in 0..config.max_epochs {
        let (train_loss, weight_grads, bias_grads) = network.loss_and_gradients(x_train, y_train);
        if !train_loss.is_finite() {
            return Err(KtrdrError::TrainingDiverged {
                message: format!("non-finite training loss at epoch {epoch}"),
                best_epoch: Some(best_epoch),
            });
        }
        adam.step(&mut network, &weight_grads, &bias_grads);

        let train_accuracy = network.accuracy(x_train, y_train);
        let (val_loss, _, _) = network.loss_and_gradients(x_val, y_val);
        let val_accuracy = network.accuracy(x_val, y_val);

        history.train_loss.push(train_loss);
        history.train_accuracy.push(train_accuracy);
        history.val_loss.push(val_loss);
        history.val_accuracy.push(val_accuracy);

        if val_loss < best_val_loss {
            best_val_loss = val_loss;
            best_model = network.clone();
            best_epoch = epoch;
            epochs_without_improvement = 0;
        } else {
            epochs_without_improvement += 1;
        }

        on_epoch(epoch, config.max_epochs, &history);

        if token.is_requested() {
            tracing::debug!(epoch, "training cancellation observed, checkpointing");
            return Ok(FitOutcome::Cancelled {
                checkpoint: network,
                history,
            });
        }

        if epochs_without_improvement >= config.patience {
            break;
        }
    }

    Ok(FitOutcome::Completed {
        model: best_model,
        history,
    })
}

/// For each feature column: shuffle it `iterations` times, average the
/// resulting accuracy drop from baseline. Scores normalize to sum to 1
/// unless the total drop is non-positive, in which case they are returned
/// un-normalized and a warning is logged.
pub fn permutation_importance(
    model: &Network,
    x: &DMatrix<f64>,
    y: &[usize],
    feature_names: &[String],
    iterations: usize,
    rng: &mut ChaCha8Rng,
) -> BTreeMap<String, f64> {
    let baseline = model.accuracy(x, y);
    let mut drops = Vec::with_capacity(feature_names.len());

    for feature_row in 0..feature_names.len() {
        let mut total_drop = 0.0;
        for _ in 0..iterations.max(1) {
            let mut permuted = x.clone();
            let mut order: Vec<usize> = (0..x.ncols()).collect();
            order.shuffle(rng);
            let original_row: Vec<f64> = x.row(feature_row).iter().copied().collect();
            for (col, &src) in order.iter().enumerate() {
                permuted[(feature_row, col)] = original_row[src];
            }
            let shuffled_accuracy = model.accuracy(&permuted, y);
            total_drop += baseline - shuffled_accuracy;
        }
        drops.push(total_drop / iterations.max(1) as f64);
    }

    let total: f64 = drops.iter().sum();
    let mut scores = BTreeMap::new();
    if total > 0.0 {
        for (name, drop) in feature_names.iter().zip(&drops) {
            scores.insert(name.clone(), drop / total);
        }
    } else {
        tracing::warn!("permutation importance total drop is non-positive; returning un-normalized scores");
        for (name, drop) in feature_names.iter().zip(&drops) {
            scores.insert(name.clone(), *drop);
        }
    }
    scores
}
