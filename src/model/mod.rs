//! Hybrid model components
//!
//! Provides:
//! - Row-major `Matrix` used for batches, activations, and parameters
//! - `StateSimulator` for the quantum path (probability vector over 2^n outcomes)
//! - `DenseClassifier` for the classical path (trainable feed-forward network)
//! - `FusionModel` combining both under a configurable fusion policy
//! - Serializable `Adam` optimizer shared by every trainable tensor

pub mod dense;
pub mod fusion;
pub mod optimizer;
pub mod quantum;

use serde::{Deserialize, Serialize};

use crate::error::{FusionError, Result};

pub use dense::DenseClassifier;
pub use fusion::{FusionModel, ModelHyperparams, ModelState};
pub use optimizer::Adam;
pub use quantum::{CircuitInfo, StateSimulator};

/// Fusion policy combining the quantum and classical feature spaces
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FusionMode {
    /// Concatenate hidden representation and probability vector
    Concat,
    /// Add the probability vector scaled by `quantum_weight`
    WeightedSum,
}

impl std::fmt::Display for FusionMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            FusionMode::Concat => write!(f, "concat"),
            FusionMode::WeightedSum => write!(f, "weighted_sum"),
        }
    }
}

impl std::str::FromStr for FusionMode {
    type Err = FusionError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "concat" => Ok(FusionMode::Concat),
            "weighted_sum" => Ok(FusionMode::WeightedSum),
            other => Err(FusionError::Config(format!(
                "unknown fusion mode '{other}', expected 'concat' or 'weighted_sum'"
            ))),
        }
    }
}

/// Row-major 2D array of f32
///
/// A rank-1 input is represented as a single-row matrix via [`Matrix::row`].
/// Higher ranks are unrepresentable by construction; ragged nested input is
/// rejected at construction time.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Matrix {
    rows: usize,
    cols: usize,
    data: Vec<f32>,
}

impl Matrix {
    /// Create a zero-filled matrix
    pub fn zeros(rows: usize, cols: usize) -> Self {
        Self {
            rows,
            cols,
            data: vec![0.0; rows * cols],
        }
    }

    /// Promote a single sample to a 1xN batch
    pub fn row(values: &[f32]) -> Self {
        Self {
            rows: 1,
            cols: values.len(),
            data: values.to_vec(),
        }
    }

    /// Create from nested rows, rejecting ragged input
    pub fn from_rows(rows: &[Vec<f32>]) -> Result<Self> {
        if rows.is_empty() {
            return Err(FusionError::Validation("input batch is empty".into()));
        }
        let cols = rows[0].len();
        let mut data = Vec::with_capacity(rows.len() * cols);
        for (i, row) in rows.iter().enumerate() {
            if row.len() != cols {
                return Err(FusionError::Validation(format!(
                    "ragged batch: row 0 has width {cols}, row {i} has width {}",
                    row.len()
                )));
            }
            data.extend_from_slice(row);
        }
        Ok(Self {
            rows: rows.len(),
            cols,
            data,
        })
    }

    pub fn rows(&self) -> usize {
        self.rows
    }

    pub fn cols(&self) -> usize {
        self.cols
    }

    /// Borrow row `i` as a slice
    pub fn row_slice(&self, i: usize) -> &[f32] {
        &self.data[i * self.cols..(i + 1) * self.cols]
    }

    /// Flat row-major view of the whole matrix
    pub fn as_slice(&self) -> &[f32] {
        &self.data
    }

    pub fn as_mut_slice(&mut self) -> &mut [f32] {
        &mut self.data
    }

    pub fn get(&self, r: usize, c: usize) -> f32 {
        self.data[r * self.cols + c]
    }

    pub fn set(&mut self, r: usize, c: usize, v: f32) {
        self.data[r * self.cols + c] = v;
    }

    /// Validate a batch against the expected feature width
    ///
    /// `what` names the offending argument in the error message.
    pub fn check_width(&self, what: &str, expected: usize) -> Result<()> {
        if self.rows == 0 {
            return Err(FusionError::Validation(format!("{what} batch is empty")));
        }
        if self.cols != expected {
            return Err(FusionError::width_mismatch(what, expected, self.cols));
        }
        Ok(())
    }
}
