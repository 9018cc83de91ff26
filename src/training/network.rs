//! Feed-forward classifier over `nalgebra` matrices.
//!
//! ReLU hidden layers, softmax + cross-entropy output over three classes.
//! Weight initialization and any stochastic step (permutation shuffling) is
//! driven by a caller-supplied `rand_chacha` RNG for reproducibility.

use nalgebra::{DMatrix, DVector};
use rand::Rng;
use rand_chacha::ChaCha8Rng;

/// Class order fixed across the crate: index 0 is BUY, 1 is HOLD, 2 is SELL.
pub const CLASSES: [&str; 3] = ["BUY", "HOLD", "SELL"];
pub const OUTPUT_DIM: usize = CLASSES.len();

#[derive(Debug, Clone)]
pub struct Network {
    pub weights: Vec<DMatrix<f64>>,
    pub biases: Vec<DVector<f64>>,
}

struct ForwardCache {
    /// `activations[0]` is the input; `activations[i]` for `i > 0` is the
    /// output of layer `i` (ReLU for hidden layers, softmax for the last).
    activations: Vec<DMatrix<f64>>,
    /// Pre-activation `z` for each layer, one entry per layer (no input entry).
    pre_activations: Vec<DMatrix<f64>>,
}

impl Network {
    /// He initialization for ReLU hidden layers, small-scale init for the
    /// output layer. Columns are samples; rows are features, matching
    /// `nalgebra`'s column-major layout used throughout this module.
    pub fn new(input_dim: usize, hidden_layers: &[usize], rng: &mut ChaCha8Rng) -> Self {
        let mut dims = vec![input_dim];
        dims.extend_from_slice(hidden_layers);
        dims.push(OUTPUT_DIM);

        let mut weights = Vec::with_capacity(dims.len() - 1);
        let mut biases = Vec::with_capacity(dims.len() - 1);
        for pair in dims.windows(2) {
            let (fan_in, fan_out) = (pair[0], pair[1]);
            let scale = (2.0 / fan_in as f64).sqrt();
            let w = DMatrix::from_fn(fan_out, fan_in, |_, _| {
                (rng.gen::<f64>() * 2.0 - 1.0) * scale
            });
            weights.push(w);
            biases.push(DVector::zeros(fan_out));
        }
        Self { weights, biases }
    }

    pub fn layer_count(&self) -> usize {
        self.weights.len()
    }

    fn forward(&self, x: &DMatrix<f64>) -> ForwardCache {
        let mut activations = vec![x.clone()];
        let mut pre_activations = Vec::with_capacity(self.weights.len());
        let last = self.weights.len() - 1;

        for (i, (w, b)) in self.weights.iter().zip(&self.biases).enumerate() {
            let prev = activations.last().unwrap();
            let z = w * prev + b.clone() * DVector::from_element(prev.ncols(), 1.0).transpose();
            let a = if i == last { softmax_columns(&z) } else { z.map(|v| v.max(0.0)) };
            pre_activations.push(z);
            activations.push(a);
        }

        ForwardCache {
            activations,
            pre_activations,
        }
    }

    /// Softmax probabilities for each sample (columns of `x`).
    pub fn predict_proba(&self, x: &DMatrix<f64>) -> DMatrix<f64> {
        self.forward(x).activations.last().unwrap().clone()
    }

    pub fn predict_class(&self, x: &DMatrix<f64>) -> Vec<usize> {
        let proba = self.predict_proba(x);
        (0..proba.ncols())
            .map(|c| {
                (0..proba.nrows())
                    .max_by(|&a, &b| proba[(a, c)].total_cmp(&proba[(b, c)]))
                    .unwrap()
            })
            .collect()
    }

    /// Mean cross-entropy loss and gradients for one batch. `y` holds class
    /// indices (`0..OUTPUT_DIM`), one per column of `x`.
    pub fn loss_and_gradients(
        &self,
        x: &DMatrix<f64>,
        y: &[usize],
    ) -> (f64, Vec<DMatrix<f64>>, Vec<DVector<f64>>) {
        let n = x.ncols() as f64;
        let cache = self.forward(x);
        let proba = cache.activations.last().unwrap();

        let mut loss = 0.0;
        for (col, &label) in y.iter().enumerate() {
            loss -= proba[(label, col)].max(1e-12).ln();
        }
        loss /= n;

        let mut one_hot = DMatrix::zeros(OUTPUT_DIM, x.ncols());
        for (col, &label) in y.iter().enumerate() {
            one_hot[(label, col)] = 1.0;
        }

        let mut delta = (proba - &one_hot) / n;
        let mut weight_grads = vec![DMatrix::zeros(1, 1); self.weights.len()];
        let mut bias_grads = vec![DVector::zeros(1); self.biases.len()];

        for layer in (0..self.weights.len()).rev() {
            let prev_activation = &cache.activations[layer];
            weight_grads[layer] = &delta * prev_activation.transpose();
            bias_grads[layer] = delta.column_sum();

            if layer > 0 {
                let w = &self.weights[layer];
                let propagated = w.transpose() * &delta;
                let z_prev = &cache.pre_activations[layer - 1];
                let relu_derivative = z_prev.map(|v| if v > 0.0 { 1.0 } else { 0.0 });
                delta = propagated.component_mul(&relu_derivative);
            }
        }

        (loss, weight_grads, bias_grads)
    }

    pub fn accuracy(&self, x: &DMatrix<f64>, y: &[usize]) -> f64 {
        let predicted = self.predict_class(x);
        let correct = predicted.iter().zip(y).filter(|(p, a)| p == a).count();
        correct as f64 / y.len() as f64
    }
}

fn softmax_columns(z: &DMatrix<f64>) -> DMatrix<f64> {
    let mut out = z.clone();
    for mut col in out.column_iter_mut() {
        let max = col.max();
        col.apply(|v| *v = (*v - max).exp());
        let sum: f64 = col.sum();
        col.apply(|v| *v /= sum);
    }
    out
}

/// Per-parameter first/second moment estimates, implemented directly rather
/// than pulled from a tensor/autograd framework.
pub struct Adam {
    beta1: f64,
    beta2: f64,
    epsilon: f64,
    learning_rate: f64,
    step: i32,
    m_w: Vec<DMatrix<f64>>,
    v_w: Vec<DMatrix<f64>>,
    m_b: Vec<DVector<f64>>,
    v_b: Vec<DVector<f64>>,
}

impl Adam {
    pub fn new(network: &Network, learning_rate: f64) -> Self {
        Self {
            beta1: 0.9,
            beta2: 0.999,
            epsilon: 1e-8,
            learning_rate,
            step: 0,
            m_w: network.weights.iter().map(|w| w.map(|_| 0.0)).collect(),
            v_w: network.weights.iter().map(|w| w.map(|_| 0.0)).collect(),
            m_b: network.biases.iter().map(|b| b.map(|_| 0.0)).collect(),
            v_b: network.biases.iter().map(|b| b.map(|_| 0.0)).collect(),
        }
    }

    pub fn step(
        &mut self,
        network: &mut Network,
        weight_grads: &[DMatrix<f64>],
        bias_grads: &[DVector<f64>],
    ) {
        self.step += 1;
        let t = self.step as f64;
        let bias_correction1 = 1.0 - self.beta1.powf(t);
        let bias_correction2 = 1.0 - self.beta2.powf(t);

        for layer in 0..network.weights.len() {
            self.m_w[layer] = &self.m_w[layer] * self.beta1 + &weight_grads[layer] * (1.0 - self.beta1);
            self.v_w[layer] = self.v_w[layer].map(|v| v * self.beta2)
                + weight_grads[layer].map(|g| g * g * (1.0 - self.beta2));
            let m_hat = &self.m_w[layer] / bias_correction1;
            let v_hat = &self.v_w[layer] / bias_correction2;
            let update = m_hat.zip_map(&v_hat, |m, v| self.learning_rate * m / (v.sqrt() + self.epsilon));
            network.weights[layer] -= update;

            self.m_b[layer] = &self.m_b[layer] * self.beta1 + &bias_grads[layer] * (1.0 - self.beta1);
            self.v_b[layer] = self.v_b[layer].map(|v| v * self.beta2)
                + bias_grads[layer].map(|g| g * g * (1.0 - self.beta2));
            let m_hat_b = &self.m_b[layer] / bias_correction1;
            let v_hat_b = &self.v_b[layer] / bias_correction2;
            let update_b = m_hat_b.zip_map(&v_hat_b, |m, v| self.learning_rate * m / (v.sqrt() + self.epsilon));
            network.biases[layer] -= update_b;
        }
    }
}
