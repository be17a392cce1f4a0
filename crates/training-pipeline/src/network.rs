use nalgebra::{DMatrix, DVector};
use rand::Rng;
use rand_chacha::ChaCha8Rng;
use serde::{Deserialize, Serialize};

use trading_core::{Activation, KtrdrError, Optimizer};

/// Serializable weights of one dense layer (row-major, `input x output`).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LayerWeights {
    pub inputs: usize,
    pub outputs: usize,
    pub w: Vec<f64>,
    pub b: Vec<f64>,
}

struct Layer {
    /// `inputs x outputs`.
    w: DMatrix<f64>,
    b: DVector<f64>,
}

/// Feed-forward classifier: dense hidden layers with a shared activation,
/// softmax output, cross-entropy loss. All math is `f64` on nalgebra so a
/// fixed seed reproduces bit-exactly on one machine.
pub struct Mlp {
    layers: Vec<Layer>,
    activation: Activation,
    dropout: f64,
}

impl Mlp {
    /// Xavier-uniform initialization from a seeded RNG.
    pub fn new(
        input_dim: usize,
        hidden: &[usize],
        classes: usize,
        activation: Activation,
        dropout: f64,
        rng: &mut ChaCha8Rng,
    ) -> Self {
        let mut dims = vec![input_dim];
        dims.extend_from_slice(hidden);
        dims.push(classes);

        let layers = dims
            .windows(2)
            .map(|pair| {
                let (fan_in, fan_out) = (pair[0], pair[1]);
                let limit = (6.0 / (fan_in + fan_out) as f64).sqrt();
                let w = DMatrix::from_fn(fan_in, fan_out, |_, _| rng.gen_range(-limit..limit));
                let b = DVector::zeros(fan_out);
                Layer { w, b }
            })
            .collect();

        Self {
            layers,
            activation,
            dropout,
        }
    }

    pub fn parameter_count(&self) -> usize {
        self.layers
            .iter()
            .map(|l| l.w.len() + l.b.len())
            .sum()
    }

    /// Mean absolute first-layer weight per input feature; a cheap
    /// feature-importance proxy stored with the run artifacts.
    pub fn input_weight_magnitudes(&self) -> Vec<f64> {
        let first = &self.layers[0];
        (0..first.w.nrows())
            .map(|i| first.w.row(i).iter().map(|v| v.abs()).sum::<f64>() / first.w.ncols() as f64)
            .collect()
    }

    fn activate(&self, z: &mut DMatrix<f64>) {
        match self.activation {
            Activation::Relu => z.apply(|v| *v = v.max(0.0)),
            Activation::Tanh => z.apply(|v| *v = v.tanh()),
            Activation::Sigmoid => z.apply(|v| *v = 1.0 / (1.0 + (-*v).exp())),
        }
    }

    /// Derivative in terms of the activated output.
    fn activate_grad(&self, a: &DMatrix<f64>) -> DMatrix<f64> {
        match self.activation {
            Activation::Relu => a.map(|v| if v > 0.0 { 1.0 } else { 0.0 }),
            Activation::Tanh => a.map(|v| 1.0 - v * v),
            Activation::Sigmoid => a.map(|v| v * (1.0 - v)),
        }
    }

    /// Forward pass returning class probabilities, one row per sample.
    pub fn forward(&self, x: &DMatrix<f64>) -> DMatrix<f64> {
        let (probs, _) = self.forward_cached(x, None);
        probs
    }

    /// Forward pass keeping per-layer activations for backprop. When an
    /// RNG is supplied, inverted dropout is applied to hidden activations.
    fn forward_cached(
        &self,
        x: &DMatrix<f64>,
        mut dropout_rng: Option<&mut ChaCha8Rng>,
    ) -> (DMatrix<f64>, Vec<DMatrix<f64>>) {
        let mut activations = vec![x.clone()];
        let last = self.layers.len() - 1;

        for (i, layer) in self.layers.iter().enumerate() {
            let mut z = activations[i].clone() * &layer.w;
            for mut row in z.row_iter_mut() {
                row += layer.b.transpose();
            }
            if i < last {
                self.activate(&mut z);
                if self.dropout > 0.0 {
                    if let Some(rng) = dropout_rng.as_deref_mut() {
                        let keep = 1.0 - self.dropout;
                        z.apply(|v| {
                            *v = if rng.gen::<f64>() < keep { *v / keep } else { 0.0 }
                        });
                    }
                }
            } else {
                softmax_rows(&mut z);
            }
            activations.push(z);
        }

        (activations[activations.len() - 1].clone(), activations)
    }

    /// One mini-batch gradient step. Returns the batch cross-entropy loss.
    pub fn train_batch(
        &mut self,
        x: &DMatrix<f64>,
        targets: &[usize],
        optimizer: &mut OptimizerState,
        dropout_rng: &mut ChaCha8Rng,
    ) -> Result<f64, KtrdrError> {
        let batch = x.nrows() as f64;
        let rng = if self.dropout > 0.0 {
            Some(&mut *dropout_rng)
        } else {
            None
        };
        let (probs, activations) = self.forward_cached(x, rng);
        let loss = cross_entropy(&probs, targets);
        if !loss.is_finite() {
            return Err(KtrdrError::Model(format!(
                "training diverged: non-finite loss {loss}"
            )));
        }

        // Softmax + cross-entropy: output delta is (p - one_hot) / batch.
        let mut delta = probs;
        for (row, &class) in targets.iter().enumerate() {
            delta[(row, class)] -= 1.0;
        }
        delta /= batch;

        for i in (0..self.layers.len()).rev() {
            let grad_w = activations[i].transpose() * &delta;
            let grad_b = DVector::from_iterator(
                delta.ncols(),
                delta.column_iter().map(|c| c.sum()),
            );

            let next_delta = if i > 0 {
                let upstream = &delta * self.layers[i].w.transpose();
                upstream.component_mul(&self.activate_grad(&activations[i]))
            } else {
                DMatrix::zeros(0, 0)
            };

            let layer = &mut self.layers[i];
            optimizer.apply(i, &mut layer.w, &mut layer.b, grad_w, grad_b);
            delta = next_delta;
        }

        Ok(loss)
    }

    pub fn to_weights(&self) -> Vec<LayerWeights> {
        self.layers
            .iter()
            .map(|l| LayerWeights {
                inputs: l.w.nrows(),
                outputs: l.w.ncols(),
                w: l.w.as_slice().to_vec(),
                b: l.b.as_slice().to_vec(),
            })
            .collect()
    }

    pub fn from_weights(
        weights: &[LayerWeights],
        activation: Activation,
    ) -> Result<Self, KtrdrError> {
        if weights.is_empty() {
            return Err(KtrdrError::Model("empty weight blob".to_string()));
        }
        let layers = weights
            .iter()
            .map(|lw| {
                if lw.w.len() != lw.inputs * lw.outputs || lw.b.len() != lw.outputs {
                    return Err(KtrdrError::Model(format!(
                        "weight blob shape mismatch: {}x{} with {} weights",
                        lw.inputs,
                        lw.outputs,
                        lw.w.len()
                    )));
                }
                Ok(Layer {
                    w: DMatrix::from_column_slice(lw.inputs, lw.outputs, &lw.w),
                    b: DVector::from_column_slice(&lw.b),
                })
            })
            .collect::<Result<Vec<_>, _>>()?;
        Ok(Self {
            layers,
            activation,
            dropout: 0.0,
        })
    }

    /// Restore weights from a snapshot taken with `to_weights`.
    pub fn restore(&mut self, weights: &[LayerWeights]) {
        for (layer, lw) in self.layers.iter_mut().zip(weights) {
            layer.w = DMatrix::from_column_slice(lw.inputs, lw.outputs, &lw.w);
            layer.b = DVector::from_column_slice(&lw.b);
        }
    }
}

fn softmax_rows(z: &mut DMatrix<f64>) {
    for mut row in z.row_iter_mut() {
        let max = row.iter().cloned().fold(f64::NEG_INFINITY, f64::max);
        let mut sum = 0.0;
        for v in row.iter_mut() {
            *v = (*v - max).exp();
            sum += *v;
        }
        for v in row.iter_mut() {
            *v /= sum;
        }
    }
}

/// Mean cross-entropy of softmax probabilities against class indices.
pub fn cross_entropy(probs: &DMatrix<f64>, targets: &[usize]) -> f64 {
    let eps = 1e-12;
    let total: f64 = targets
        .iter()
        .enumerate()
        .map(|(row, &class)| -(probs[(row, class)] + eps).ln())
        .sum();
    total / targets.len() as f64
}

/// Per-layer optimizer state. SGD is stateless; Adam keeps first/second
/// moment estimates.
pub struct OptimizerState {
    kind: Optimizer,
    learning_rate: f64,
    step: u64,
    m: Vec<(DMatrix<f64>, DVector<f64>)>,
    v: Vec<(DMatrix<f64>, DVector<f64>)>,
}

const ADAM_BETA1: f64 = 0.9;
const ADAM_BETA2: f64 = 0.999;
const ADAM_EPS: f64 = 1e-8;

impl OptimizerState {
    pub fn new(kind: Optimizer, learning_rate: f64, shapes: &[LayerWeights]) -> Self {
        let zeros = |lw: &LayerWeights| {
            (
                DMatrix::zeros(lw.inputs, lw.outputs),
                DVector::zeros(lw.outputs),
            )
        };
        Self {
            kind,
            learning_rate,
            step: 0,
            m: shapes.iter().map(zeros).collect(),
            v: shapes.iter().map(zeros).collect(),
        }
    }

    fn apply(
        &mut self,
        layer: usize,
        w: &mut DMatrix<f64>,
        b: &mut DVector<f64>,
        grad_w: DMatrix<f64>,
        grad_b: DVector<f64>,
    ) {
        match self.kind {
            Optimizer::Sgd => {
                *w -= grad_w * self.learning_rate;
                *b -= grad_b * self.learning_rate;
            }
            Optimizer::Adam => {
                if layer == self.m.len() - 1 {
                    // One step per batch; the last layer is applied first
                    // in the backward sweep.
                    self.step += 1;
                }
                let t = self.step.max(1) as f64;
                let (mw, mb) = &mut self.m[layer];
                let (vw, vb) = &mut self.v[layer];

                *mw = &*mw * ADAM_BETA1 + &grad_w * (1.0 - ADAM_BETA1);
                *mb = &*mb * ADAM_BETA1 + &grad_b * (1.0 - ADAM_BETA1);
                *vw = &*vw * ADAM_BETA2 + grad_w.map(|g| g * g) * (1.0 - ADAM_BETA2);
                *vb = &*vb * ADAM_BETA2 + grad_b.map(|g| g * g) * (1.0 - ADAM_BETA2);

                let bias1 = 1.0 - ADAM_BETA1.powf(t);
                let bias2 = 1.0 - ADAM_BETA2.powf(t);
                let lr = self.learning_rate * bias2.sqrt() / bias1;

                for i in 0..w.len() {
                    w[i] -= lr * mw[i] / (vw[i].sqrt() + ADAM_EPS);
                }
                for i in 0..b.len() {
                    b[i] -= lr * mb[i] / (vb[i].sqrt() + ADAM_EPS);
                }
            }
        }
    }
}
