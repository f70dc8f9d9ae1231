//! Hybrid fusion model combining the quantum and classical paths
//!
//! Owns one [`StateSimulator`] and one [`DenseClassifier`] (whose output width
//! equals the hidden size), fuses their outputs under the configured policy,
//! and squashes the result through a fusion layer, an output layer, and a
//! sigmoid. Exactly one sample per forward pass runs through the simulator —
//! the first batch row — and its probability vector is tiled across every row
//! before fusion. That broadcast is part of the model's semantics, not a
//! shape coercion: the quantum contribution is per-batch, not per-sample, and
//! gradients flow through the classical path only.

use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicBool, Ordering};

use crate::error::{FusionError, Result};
use crate::model::dense::{bce_loss, bce_output_grad, Linear};
use crate::model::{Adam, DenseClassifier, FusionMode, Matrix, StateSimulator};

/// Hyperparameters fixed at construction
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModelHyperparams {
    pub input_size: usize,
    pub hidden_size: usize,
    pub output_size: usize,
    pub n_qubits: usize,
    pub quantum_depth: usize,
    pub fusion_mode: FusionMode,
    pub quantum_weight: f32,
    pub shots: u32,
    pub dropout_rate: f32,
}

impl Default for ModelHyperparams {
    fn default() -> Self {
        Self {
            input_size: 2,
            hidden_size: 8,
            output_size: 2,
            n_qubits: 2,
            quantum_depth: 3,
            fusion_mode: FusionMode::Concat,
            quantum_weight: 0.5,
            shots: crate::model::quantum::DEFAULT_SHOTS,
            dropout_rate: crate::model::dense::DEFAULT_DROPOUT,
        }
    }
}

impl ModelHyperparams {
    /// Width of the fused feature vector entering the fusion layer
    pub fn fusion_input_dim(&self) -> usize {
        match self.fusion_mode {
            FusionMode::Concat => self.hidden_size + (1 << self.n_qubits),
            FusionMode::WeightedSum => self.hidden_size,
        }
    }

    /// Reject inconsistent hyperparameter combinations
    pub fn validate(&self) -> Result<()> {
        if self.input_size == 0 || self.hidden_size == 0 || self.output_size == 0 {
            return Err(FusionError::Config(
                "model dimensions must be positive".into(),
            ));
        }
        if !(0.0..=1.0).contains(&self.quantum_weight) {
            return Err(FusionError::Config(format!(
                "quantum weight must be in [0, 1], got {}",
                self.quantum_weight
            )));
        }
        // The full first row feeds the simulator, which accepts exactly
        // n_qubits features; any other input width is rejected here rather
        // than truncated or padded.
        if self.input_size != self.n_qubits {
            return Err(FusionError::Config(format!(
                "input size {} must equal the {}-qubit register width",
                self.input_size, self.n_qubits
            )));
        }
        if self.fusion_mode == FusionMode::WeightedSum && self.hidden_size != (1 << self.n_qubits) {
            return Err(FusionError::Config(format!(
                "weighted_sum requires hidden_size == 2^n_qubits ({} != {}); \
                 no pad/truncate rule is defined",
                self.hidden_size,
                1usize << self.n_qubits
            )));
        }
        Ok(())
    }
}

/// Serializable snapshot of parameters plus hyperparameters
///
/// Everything `predict` depends on is in here; the optimizer's moment state
/// travels separately so a checkpoint restores training momentum too.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModelState {
    pub config: ModelHyperparams,
    classifier: DenseClassifier,
    fusion: Linear,
    output: Linear,
    simulator: StateSimulator,
}

/// Optimizer slot layout; registration order is fixed. Slots 0..6 hold the
/// classifier's three weight/bias pairs.
const SLOT_FUSION_W: usize = 6;
const SLOT_FUSION_B: usize = 7;
const SLOT_OUTPUT_W: usize = 8;
const SLOT_OUTPUT_B: usize = 9;

/// The hybrid model: quantum path + classical path + fusion policy
#[derive(Debug)]
pub struct FusionModel {
    params: ModelHyperparams,
    simulator: StateSimulator,
    classifier: DenseClassifier,
    fusion: Linear,
    output: Linear,
    optimizer: Adam,
    training: AtomicBool,
}

impl FusionModel {
    /// Build a model from validated hyperparameters
    pub fn new(params: ModelHyperparams) -> Result<Self> {
        params.validate()?;

        let simulator = StateSimulator::with_shots(params.n_qubits, params.shots)?;
        // The classical path emits a hidden representation, so its output
        // width is the hidden size.
        let classifier = DenseClassifier::with_dropout(
            params.input_size,
            params.hidden_size,
            params.hidden_size,
            params.dropout_rate,
        )?;
        let fusion = Linear::new(params.fusion_input_dim(), params.output_size);
        let output = Linear::new(params.output_size, params.output_size);
        let optimizer = Self::build_optimizer(&classifier, &fusion, &output, 0.001);

        Ok(Self {
            params,
            simulator,
            classifier,
            fusion,
            output,
            optimizer,
            training: AtomicBool::new(false),
        })
    }

    fn build_optimizer(
        classifier: &DenseClassifier,
        fusion: &Linear,
        output: &Linear,
        learning_rate: f32,
    ) -> Adam {
        let mut optimizer = Adam::new(learning_rate);
        for idx in 0..3 {
            let layer = classifier.layer(idx);
            optimizer.register(layer.weight_len());
            optimizer.register(layer.bias_len());
        }
        optimizer.register(fusion.weight_len());
        optimizer.register(fusion.bias_len());
        optimizer.register(output.weight_len());
        optimizer.register(output.bias_len());
        optimizer
    }

    pub fn input_size(&self) -> usize {
        self.params.input_size
    }

    pub fn output_size(&self) -> usize {
        self.params.output_size
    }

    /// Current mode; training gates the classifier's dropout only
    pub fn is_training(&self) -> bool {
        self.training.load(Ordering::Relaxed)
    }

    /// Hyperparameters as fixed at construction
    pub fn get_config(&self) -> ModelHyperparams {
        self.params.clone()
    }

    /// Snapshot parameters plus hyperparameters as one serializable unit
    pub fn save_state(&self) -> ModelState {
        ModelState {
            config: self.params.clone(),
            classifier: self.classifier.clone(),
            fusion: self.fusion.clone(),
            output: self.output.clone(),
            simulator: self.simulator.clone(),
        }
    }

    /// Current optimizer moment state
    pub fn optimizer_state(&self) -> Adam {
        self.optimizer.clone()
    }

    /// Rebuild a model from a snapshot with a fresh optimizer
    pub fn load_state(state: ModelState) -> Result<Self> {
        let optimizer = Self::build_optimizer(&state.classifier, &state.fusion, &state.output, 0.001);
        Self::load_state_with_optimizer(state, optimizer)
    }

    /// Rebuild a model from a snapshot, restoring optimizer momentum
    pub fn load_state_with_optimizer(state: ModelState, optimizer: Adam) -> Result<Self> {
        state.config.validate()?;
        Ok(Self {
            params: state.config,
            simulator: state.simulator,
            classifier: state.classifier,
            fusion: state.fusion,
            output: state.output,
            optimizer,
            training: AtomicBool::new(false),
        })
    }

    /// Inference over a batch; output is elementwise in [0, 1] with shape
    /// `(batch, output_size)`. Switches the model to evaluation mode and
    /// never mutates parameters.
    pub fn predict(&self, batch: &Matrix) -> Result<Matrix> {
        self.training.store(false, Ordering::Relaxed);
        let pass = self.forward(batch, false)?;
        Ok(pass.output)
    }

    /// Train over the full batch for `epochs` optimizer steps; returns the
    /// mean loss across epochs. Switches the model to training mode.
    pub fn train(
        &mut self,
        batch: &Matrix,
        targets: &Matrix,
        epochs: usize,
        learning_rate: f32,
    ) -> Result<f32> {
        batch.check_width("input", self.params.input_size)?;
        targets.check_width("target", self.params.output_size)?;
        if batch.rows() != targets.rows() {
            return Err(FusionError::Validation(format!(
                "batch has {} rows but targets have {}",
                batch.rows(),
                targets.rows()
            )));
        }
        if targets.as_slice().iter().any(|&t| !(0.0..=1.0).contains(&t)) {
            return Err(FusionError::Validation(
                "targets must lie in [0, 1] for binary cross-entropy".into(),
            ));
        }
        if epochs == 0 {
            return Err(FusionError::Validation("epochs must be positive".into()));
        }

        self.training.store(true, Ordering::Relaxed);
        self.classifier.set_training(true);
        self.optimizer.set_learning_rate(learning_rate);

        let mut total_loss = 0.0f32;
        for _ in 0..epochs {
            let pass = self.forward(batch, true)?;
            total_loss += bce_loss(&pass.output, targets);

            // Backprop: sigmoid+BCE collapse into (y - t) / N at the output
            // pre-activation, then straight back through the two affine
            // layers, the fusion split, and the classifier.
            let dz_out = bce_output_grad(&pass.output, targets);
            let (g_ow, g_ob, dz_fused_out) = self.output.backward(&pass.fusion_out, &dz_out);
            let (g_fw, g_fb, d_fused) = self.fusion.backward(&pass.fused, &dz_fused_out);
            let d_hidden = self.hidden_grad_from_fused(&d_fused);
            let dz_dense = self
                .classifier
                .output_grad_to_pre_activation(&pass.cache, &d_hidden);
            let dense_grads = self.classifier.backward(&pass.cache, &dz_dense);

            self.optimizer.begin_step();
            for (idx, grad) in dense_grads.tensors.iter().enumerate() {
                let layer = self.classifier.layer_mut(idx / 2);
                let tensor = if idx % 2 == 0 {
                    layer.weights_mut()
                } else {
                    layer.bias_mut()
                };
                self.optimizer.update(idx, tensor, grad)?;
            }
            self.optimizer
                .update(SLOT_FUSION_W, self.fusion.weights_mut(), &g_fw)?;
            self.optimizer
                .update(SLOT_FUSION_B, self.fusion.bias_mut(), &g_fb)?;
            self.optimizer
                .update(SLOT_OUTPUT_W, self.output.weights_mut(), &g_ow)?;
            self.optimizer
                .update(SLOT_OUTPUT_B, self.output.bias_mut(), &g_ob)?;
        }

        Ok(total_loss / epochs as f32)
    }

    /// Slice the fused gradient back to the classifier's hidden output
    fn hidden_grad_from_fused(&self, d_fused: &Matrix) -> Matrix {
        match self.params.fusion_mode {
            // concat: the first hidden_size columns belong to the classical
            // path; the rest hit the constant quantum block.
            FusionMode::Concat => {
                let mut d_hidden = Matrix::zeros(d_fused.rows(), self.params.hidden_size);
                for r in 0..d_fused.rows() {
                    for c in 0..self.params.hidden_size {
                        d_hidden.set(r, c, d_fused.get(r, c));
                    }
                }
                d_hidden
            }
            // weighted_sum: fused = hidden + w * quantum, so the gradient
            // passes through unchanged.
            FusionMode::WeightedSum => d_fused.clone(),
        }
    }

    /// Shared forward pass; validation errors propagate unchanged, anything
    /// else inside the pass is wrapped as a computation error
    fn forward(&self, batch: &Matrix, training: bool) -> Result<ForwardPass> {
        batch.check_width("input", self.params.input_size)?;

        let cache = self.classifier.forward_cached(batch, training);

        // Quantum path: one sample only, the full first row of the batch.
        let probabilities = match self.simulator.process_sample(batch.row_slice(0)) {
            Ok(p) => p,
            Err(e @ FusionError::Validation(_)) => return Err(e),
            Err(e) => return Err(FusionError::Computation(format!("quantum path failed: {e}"))),
        };
        let quantum = tile_rows(&probabilities, batch.rows());

        let fused = match self.params.fusion_mode {
            FusionMode::Concat => concat_columns(&cache.output, &quantum),
            FusionMode::WeightedSum => {
                let mut fused = cache.output.clone();
                for (f, q) in fused.as_mut_slice().iter_mut().zip(quantum.as_slice()) {
                    *f += self.params.quantum_weight * q;
                }
                fused
            }
        };

        let fusion_out = self.fusion.forward(&fused);
        let pre_squash = self.output.forward(&fusion_out);
        let mut output = pre_squash;
        for v in output.as_mut_slice() {
            *v = 1.0 / (1.0 + (-*v).exp());
        }

        Ok(ForwardPass {
            cache,
            fused,
            fusion_out,
            output,
        })
    }
}

/// Intermediate values kept alive for backpropagation
struct ForwardPass {
    cache: crate::model::dense::DenseCache,
    fused: Matrix,
    fusion_out: Matrix,
    output: Matrix,
}

/// Tile one probability vector across every row of the batch
fn tile_rows(values: &[f32], rows: usize) -> Matrix {
    let mut out = Matrix::zeros(rows, values.len());
    for r in 0..rows {
        for (c, &v) in values.iter().enumerate() {
            out.set(r, c, v);
        }
    }
    out
}

/// Concatenate two batches column-wise
fn concat_columns(a: &Matrix, b: &Matrix) -> Matrix {
    let mut out = Matrix::zeros(a.rows(), a.cols() + b.cols());
    for r in 0..a.rows() {
        for c in 0..a.cols() {
            out.set(r, c, a.get(r, c));
        }
        for c in 0..b.cols() {
            out.set(r, a.cols() + c, b.get(r, c));
        }
    }
    out
}
