//! Classical feed-forward network with manual backpropagation
//!
//! Two hidden affine+ReLU+dropout stages (the second at half width) feeding a
//! sigmoid output layer, trained against binary cross-entropy. Gradients are
//! computed explicitly from activations cached during the forward pass; the
//! training flag gates dropout and nothing else.

use rand::Rng;
use serde::{Deserialize, Serialize};

use crate::error::{FusionError, Result};
use crate::model::{Adam, Matrix};

/// Default dropout probability, applied after each hidden stage
pub const DEFAULT_DROPOUT: f32 = 0.2;

/// One affine layer: `y = x W^T + b`
#[derive(Debug, Clone, Serialize, Deserialize)]
pub(crate) struct Linear {
    in_dim: usize,
    out_dim: usize,
    /// Row-major `out_dim x in_dim`
    w: Vec<f32>,
    b: Vec<f32>,
}

impl Linear {
    /// Xavier-uniform initialization
    pub(crate) fn new(in_dim: usize, out_dim: usize) -> Self {
        let limit = (6.0 / (in_dim + out_dim) as f32).sqrt();
        let mut rng = rand::rng();
        let w = (0..in_dim * out_dim)
            .map(|_| rng.random_range(-limit..limit))
            .collect();
        Self {
            in_dim,
            out_dim,
            w,
            b: vec![0.0; out_dim],
        }
    }

    /// Forward for a whole batch
    pub(crate) fn forward(&self, x: &Matrix) -> Matrix {
        let mut out = Matrix::zeros(x.rows(), self.out_dim);
        for r in 0..x.rows() {
            let row = x.row_slice(r);
            for o in 0..self.out_dim {
                let wrow = &self.w[o * self.in_dim..(o + 1) * self.in_dim];
                let mut acc = self.b[o];
                for (xi, wi) in row.iter().zip(wrow) {
                    acc += xi * wi;
                }
                out.set(r, o, acc);
            }
        }
        out
    }

    /// Accumulate weight/bias gradients from `dz` (batch x out) and the layer
    /// input (batch x in); returns the gradient w.r.t. the input
    pub(crate) fn backward(&self, input: &Matrix, dz: &Matrix) -> (Vec<f32>, Vec<f32>, Matrix) {
        let mut gw = vec![0.0f32; self.w.len()];
        let mut gb = vec![0.0f32; self.out_dim];
        let mut dx = Matrix::zeros(input.rows(), self.in_dim);

        for r in 0..input.rows() {
            let xrow = input.row_slice(r);
            for o in 0..self.out_dim {
                let d = dz.get(r, o);
                gb[o] += d;
                let wrow = &self.w[o * self.in_dim..(o + 1) * self.in_dim];
                for i in 0..self.in_dim {
                    gw[o * self.in_dim + i] += d * xrow[i];
                    let cur = dx.get(r, i);
                    dx.set(r, i, cur + d * wrow[i]);
                }
            }
        }
        (gw, gb, dx)
    }

    pub(crate) fn weights_mut(&mut self) -> &mut [f32] {
        &mut self.w
    }

    pub(crate) fn bias_mut(&mut self) -> &mut [f32] {
        &mut self.b
    }

    pub(crate) fn weight_len(&self) -> usize {
        self.w.len()
    }

    pub(crate) fn bias_len(&self) -> usize {
        self.b.len()
    }
}

/// Activations cached by a forward pass, consumed by backpropagation
#[derive(Debug)]
pub(crate) struct DenseCache {
    input: Matrix,
    a1: Matrix,
    mask1: Matrix,
    d1: Matrix,
    a2: Matrix,
    mask2: Matrix,
    d2: Matrix,
    pub(crate) output: Matrix,
}

/// Gradients for every tensor of the classifier, in registration order
#[derive(Debug)]
pub(crate) struct DenseGrads {
    pub(crate) tensors: [Vec<f32>; 6],
}

/// Feed-forward classifier over fixed-width feature vectors
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DenseClassifier {
    input_size: usize,
    hidden_size: usize,
    output_size: usize,
    dropout_rate: f32,
    training: bool,
    l1: Linear,
    l2: Linear,
    l3: Linear,
    optimizer: Adam,
    slots: [usize; 6],
}

impl DenseClassifier {
    /// Create a classifier with the default dropout rate
    pub fn new(input_size: usize, hidden_size: usize, output_size: usize) -> Result<Self> {
        Self::with_dropout(input_size, hidden_size, output_size, DEFAULT_DROPOUT)
    }

    /// Create a classifier with an explicit dropout rate
    pub fn with_dropout(
        input_size: usize,
        hidden_size: usize,
        output_size: usize,
        dropout_rate: f32,
    ) -> Result<Self> {
        if input_size == 0 || output_size == 0 {
            return Err(FusionError::Config(
                "input and output sizes must be positive".into(),
            ));
        }
        if hidden_size < 2 {
            return Err(FusionError::Config(
                "hidden size must be at least 2 (the second stage halves it)".into(),
            ));
        }
        if !(0.0..1.0).contains(&dropout_rate) {
            return Err(FusionError::Config(format!(
                "dropout rate must be in [0, 1), got {dropout_rate}"
            )));
        }

        let half = hidden_size / 2;
        let l1 = Linear::new(input_size, hidden_size);
        let l2 = Linear::new(hidden_size, half);
        let l3 = Linear::new(half, output_size);

        let mut optimizer = Adam::new(0.01);
        let slots = [
            optimizer.register(l1.weight_len()),
            optimizer.register(l1.bias_len()),
            optimizer.register(l2.weight_len()),
            optimizer.register(l2.bias_len()),
            optimizer.register(l3.weight_len()),
            optimizer.register(l3.bias_len()),
        ];

        Ok(Self {
            input_size,
            hidden_size,
            output_size,
            dropout_rate,
            training: false,
            l1,
            l2,
            l3,
            optimizer,
            slots,
        })
    }

    pub fn input_size(&self) -> usize {
        self.input_size
    }

    pub fn hidden_size(&self) -> usize {
        self.hidden_size
    }

    pub fn output_size(&self) -> usize {
        self.output_size
    }

    /// Toggle training mode; the flag gates dropout only
    pub fn set_training(&mut self, training: bool) {
        self.training = training;
    }

    pub fn is_training(&self) -> bool {
        self.training
    }

    /// Forward pass honoring the current mode flag
    pub fn forward(&self, batch: &Matrix) -> Result<Matrix> {
        batch.check_width("classifier input", self.input_size)?;
        Ok(self.forward_cached(batch, self.training).output)
    }

    /// Inference-mode forward pass; never applies dropout
    pub fn predict(&self, batch: &Matrix) -> Result<Matrix> {
        batch.check_width("classifier input", self.input_size)?;
        Ok(self.forward_cached(batch, false).output)
    }

    /// One gradient-descent step over the batch; returns the BCE loss
    pub fn train_step(&mut self, batch: &Matrix, targets: &Matrix, learning_rate: f32) -> Result<f32> {
        batch.check_width("classifier input", self.input_size)?;
        targets.check_width("classifier target", self.output_size)?;
        if batch.rows() != targets.rows() {
            return Err(FusionError::Validation(format!(
                "batch has {} rows but targets have {}",
                batch.rows(),
                targets.rows()
            )));
        }

        self.training = true;
        let cache = self.forward_cached(batch, true);
        let loss = bce_loss(&cache.output, targets);
        let dz3 = bce_output_grad(&cache.output, targets);
        let grads = self.backward(&cache, &dz3);

        self.optimizer.set_learning_rate(learning_rate);
        self.optimizer.begin_step();
        self.apply_grads(&grads)?;
        Ok(loss)
    }

    /// Full forward pass with cached activations
    ///
    /// `training` selects whether dropout masks are drawn; the cache is valid
    /// input for [`DenseClassifier::backward`] either way.
    pub(crate) fn forward_cached(&self, batch: &Matrix, training: bool) -> DenseCache {
        let z1 = self.l1.forward(batch);
        let a1 = relu(&z1);
        let (d1, mask1) = self.dropout(&a1, training);

        let z2 = self.l2.forward(&d1);
        let a2 = relu(&z2);
        let (d2, mask2) = self.dropout(&a2, training);

        let z3 = self.l3.forward(&d2);
        let output = sigmoid(&z3);

        DenseCache {
            input: batch.clone(),
            a1,
            mask1,
            d1,
            a2,
            mask2,
            d2,
            output,
        }
    }

    /// Backpropagate from the output pre-activation gradient `dz3`
    pub(crate) fn backward(&self, cache: &DenseCache, dz3: &Matrix) -> DenseGrads {
        let (gw3, gb3, gd2) = self.l3.backward(&cache.d2, dz3);
        let dz2 = hidden_grad(&gd2, &cache.a2, &cache.mask2);
        let (gw2, gb2, gd1) = self.l2.backward(&cache.d1, &dz2);
        let dz1 = hidden_grad(&gd1, &cache.a1, &cache.mask1);
        let (gw1, gb1, _) = self.l1.backward(&cache.input, &dz1);

        DenseGrads {
            tensors: [gw1, gb1, gw2, gb2, gw3, gb3],
        }
    }

    /// Convert a gradient w.r.t. the sigmoid output into `dz3`
    pub(crate) fn output_grad_to_pre_activation(&self, cache: &DenseCache, grad_output: &Matrix) -> Matrix {
        let mut dz3 = Matrix::zeros(grad_output.rows(), grad_output.cols());
        for r in 0..grad_output.rows() {
            for c in 0..grad_output.cols() {
                let y = cache.output.get(r, c);
                dz3.set(r, c, grad_output.get(r, c) * y * (1.0 - y));
            }
        }
        dz3
    }

    /// Apply gradients through this classifier's own optimizer
    pub(crate) fn apply_grads(&mut self, grads: &DenseGrads) -> Result<()> {
        let [gw1, gb1, gw2, gb2, gw3, gb3] = &grads.tensors;
        self.optimizer.update(self.slots[0], self.l1.weights_mut(), gw1)?;
        self.optimizer.update(self.slots[1], self.l1.bias_mut(), gb1)?;
        self.optimizer.update(self.slots[2], self.l2.weights_mut(), gw2)?;
        self.optimizer.update(self.slots[3], self.l2.bias_mut(), gb2)?;
        self.optimizer.update(self.slots[4], self.l3.weights_mut(), gw3)?;
        self.optimizer.update(self.slots[5], self.l3.bias_mut(), gb3)?;
        Ok(())
    }

    /// Borrow one of the three affine layers (0-indexed, input-first)
    pub(crate) fn layer(&self, idx: usize) -> &Linear {
        match idx {
            0 => &self.l1,
            1 => &self.l2,
            _ => &self.l3,
        }
    }

    pub(crate) fn layer_mut(&mut self, idx: usize) -> &mut Linear {
        match idx {
            0 => &mut self.l1,
            1 => &mut self.l2,
            _ => &mut self.l3,
        }
    }

    /// Inverted dropout: surviving activations are scaled by 1/(1-p)
    fn dropout(&self, a: &Matrix, training: bool) -> (Matrix, Matrix) {
        let mut mask = Matrix::zeros(a.rows(), a.cols());
        if !training || self.dropout_rate == 0.0 {
            mask.as_mut_slice().fill(1.0);
            return (a.clone(), mask);
        }

        let scale = 1.0 / (1.0 - self.dropout_rate);
        let mut rng = rand::rng();
        let mut out = a.clone();
        for (o, m) in out.as_mut_slice().iter_mut().zip(mask.as_mut_slice()) {
            if rng.random::<f32>() < self.dropout_rate {
                *o = 0.0;
                *m = 0.0;
            } else {
                *o *= scale;
                *m = scale;
            }
        }
        (out, mask)
    }
}

/// Gradient through a dropout mask and the preceding ReLU
fn hidden_grad(upstream: &Matrix, activation: &Matrix, mask: &Matrix) -> Matrix {
    let mut out = Matrix::zeros(upstream.rows(), upstream.cols());
    for ((o, (&u, &m)), &a) in out
        .as_mut_slice()
        .iter_mut()
        .zip(upstream.as_slice().iter().zip(mask.as_slice()))
        .zip(activation.as_slice())
    {
        *o = if a > 0.0 { u * m } else { 0.0 };
    }
    out
}

fn relu(x: &Matrix) -> Matrix {
    let mut out = x.clone();
    for v in out.as_mut_slice() {
        *v = v.max(0.0);
    }
    out
}

fn sigmoid(x: &Matrix) -> Matrix {
    let mut out = x.clone();
    for v in out.as_mut_slice() {
        *v = 1.0 / (1.0 + (-*v).exp());
    }
    out
}

/// Mean binary cross-entropy over every element of the batch
pub(crate) fn bce_loss(output: &Matrix, targets: &Matrix) -> f32 {
    let n = output.as_slice().len().max(1);
    let mut total = 0.0f32;
    for (&y, &t) in output.as_slice().iter().zip(targets.as_slice()) {
        let y = y.clamp(1e-7, 1.0 - 1e-7);
        total -= t * y.ln() + (1.0 - t) * (1.0 - y).ln();
    }
    total / n as f32
}

/// Combined BCE + sigmoid gradient w.r.t. the output pre-activation
pub(crate) fn bce_output_grad(output: &Matrix, targets: &Matrix) -> Matrix {
    let n = output.as_slice().len().max(1) as f32;
    let mut grad = Matrix::zeros(output.rows(), output.cols());
    for ((g, &y), &t) in grad
        .as_mut_slice()
        .iter_mut()
        .zip(output.as_slice())
        .zip(targets.as_slice())
    {
        *g = (y - t) / n;
    }
    grad
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_forward_shape_and_range() {
        let net = DenseClassifier::new(4, 8, 3).unwrap();
        let batch = Matrix::from_rows(&[vec![0.1, 0.2, 0.3, 0.4], vec![0.9, 0.8, 0.7, 0.6]]).unwrap();
        let out = net.forward(&batch).unwrap();
        assert_eq!(out.rows(), 2);
        assert_eq!(out.cols(), 3);
        assert!(out.as_slice().iter().all(|&v| (0.0..=1.0).contains(&v)));
    }

    #[test]
    fn test_wrong_width_rejected() {
        let net = DenseClassifier::new(4, 8, 3).unwrap();
        let err = net.forward(&Matrix::row(&[0.1, 0.2])).unwrap_err();
        assert_eq!(
            err.to_string(),
            "validation error: classifier input: expected width 4, got 2"
        );
    }

    #[test]
    fn test_training_reduces_loss() {
        let mut net = DenseClassifier::with_dropout(2, 8, 1, 0.0).unwrap();
        let batch = Matrix::from_rows(&[
            vec![0.0, 0.0],
            vec![0.0, 1.0],
            vec![1.0, 0.0],
            vec![1.0, 1.0],
        ])
        .unwrap();
        let targets = Matrix::from_rows(&[vec![0.0], vec![1.0], vec![1.0], vec![1.0]]).unwrap();

        let first = net.train_step(&batch, &targets, 0.05).unwrap();
        let mut last = first;
        for _ in 0..300 {
            last = net.train_step(&batch, &targets, 0.05).unwrap();
        }
        assert!(last < first, "loss did not decrease: {first} -> {last}");
    }

    #[test]
    fn test_predict_ignores_training_flag() {
        let mut net = DenseClassifier::new(3, 8, 2).unwrap();
        net.set_training(true);
        let batch = Matrix::row(&[0.5, 0.5, 0.5]);
        // predict never applies dropout, so repeated calls agree exactly
        let a = net.predict(&batch).unwrap();
        let b = net.predict(&batch).unwrap();
        assert_eq!(a, b);
    }

    #[test]
    fn test_mismatched_target_rows() {
        let mut net = DenseClassifier::new(2, 4, 1).unwrap();
        let batch = Matrix::from_rows(&[vec![0.0, 0.0], vec![1.0, 1.0]]).unwrap();
        let targets = Matrix::row(&[1.0]);
        assert!(net.train_step(&batch, &targets, 0.01).is_err());
    }

    #[test]
    fn test_constructor_validation() {
        assert!(DenseClassifier::new(0, 8, 2).is_err());
        assert!(DenseClassifier::new(2, 1, 2).is_err());
        assert!(DenseClassifier::with_dropout(2, 8, 2, 1.0).is_err());
    }
}
