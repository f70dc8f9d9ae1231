//! qfusion - Hybrid Quantum-Classical Prediction Library
//!
//! A self-updating prediction system combining:
//! - A seeded n-qubit state simulator producing measurement probabilities
//! - A trainable dense classifier with manual backpropagation
//! - A fusion model joining both feature spaces under a configurable policy
//! - Append-only SQLite persistence with independent model checkpoints
//! - A continuous learning loop that trains and checkpoints in the background
//!
//! # Example
//!
//! ```ignore
//! use qfusion::config::FusionConfig;
//! use qfusion::model::{FusionModel, Matrix};
//!
//! fn main() -> anyhow::Result<()> {
//!     let config = FusionConfig::default();
//!     let model = FusionModel::new(config.hyperparams())?;
//!     let probs = model.predict(&Matrix::row(&[0.3, 0.7]))?;
//!     println!("{:?}", probs.row_slice(0));
//!     Ok(())
//! }
//! ```

// Core modules (order matters for cross-module dependencies)
pub mod error;
pub mod model; // Must come before config since config reuses its defaults
pub mod config;
pub mod store;
pub mod data;
pub mod learning;
pub mod cli;

// Re-export commonly used types for convenience
pub use config::FusionConfig;

pub use error::{FusionError, Result};

pub use model::{
    Adam,
    DenseClassifier,
    FusionMode,
    FusionModel,
    Matrix,
    ModelHyperparams,
    ModelState,
    StateSimulator,
};

pub use store::{PersistentStore, StoreEntry};

pub use data::{DataCollector, DataSource};

pub use learning::{ContinuousLearner, LoopState};

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Library name
pub const NAME: &str = env!("CARGO_PKG_NAME");

/// Get the library info
pub fn info() -> String {
    format!("{} v{} - Hybrid Quantum-Classical Prediction Library", NAME, VERSION)
}
