//! Configuration management
//!
//! All hyperparameters and loop settings live in one TOML document with
//! per-field defaults. An unreadable or unparsable file is a fatal startup
//! error; missing keys fall back to the documented defaults.

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;

use crate::model::fusion::ModelHyperparams;
use crate::model::FusionMode;

/// Main configuration structure
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FusionConfig {
    /// Width of the classical input vector
    #[serde(default = "default_input_size")]
    pub input_size: usize,
    /// Width of the hidden representation
    #[serde(default = "default_hidden_size")]
    pub hidden_size: usize,
    /// Width of the model output
    #[serde(default = "default_output_size")]
    pub output_size: usize,
    /// Simulated register size; the quantum path spans 2^n_qubits outcomes
    #[serde(default = "default_n_qubits")]
    pub n_qubits: usize,
    /// Nominal circuit depth, kept for diagnostics
    #[serde(default = "default_quantum_depth")]
    pub quantum_depth: usize,
    /// Fusion policy: "concat" or "weighted_sum"
    #[serde(default = "default_fusion_mode")]
    pub fusion_mode: FusionMode,
    /// Quantum contribution in weighted_sum mode, in [0, 1]
    #[serde(default = "default_quantum_weight")]
    pub quantum_weight: f32,
    /// Measurement shots per simulator call
    #[serde(default = "default_shots")]
    pub shots: u32,
    /// Dropout probability for the classifier's hidden stages
    #[serde(default = "default_dropout_rate")]
    pub dropout_rate: f32,
    /// Learning rate for continuous training
    #[serde(default = "default_learning_rate")]
    pub learning_rate: f32,
    /// Training examples per batch
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,
    /// Seconds between learning cycles
    #[serde(default = "default_update_interval_secs")]
    pub update_interval_secs: u64,
    /// Checkpoints retained after each cycle's pruning pass
    #[serde(default = "default_checkpoint_keep_last")]
    pub checkpoint_keep_last: usize,
    /// SQLite database location
    #[serde(default = "default_database_path")]
    pub database_path: PathBuf,
}

fn default_input_size() -> usize {
    2
}

fn default_hidden_size() -> usize {
    8
}

fn default_output_size() -> usize {
    2
}

fn default_n_qubits() -> usize {
    2
}

fn default_quantum_depth() -> usize {
    3
}

fn default_fusion_mode() -> FusionMode {
    FusionMode::Concat
}

fn default_quantum_weight() -> f32 {
    0.5
}

fn default_shots() -> u32 {
    crate::model::quantum::DEFAULT_SHOTS
}

fn default_dropout_rate() -> f32 {
    crate::model::dense::DEFAULT_DROPOUT
}

fn default_learning_rate() -> f32 {
    0.001
}

fn default_batch_size() -> usize {
    32
}

fn default_update_interval_secs() -> u64 {
    60
}

fn default_checkpoint_keep_last() -> usize {
    16
}

fn default_database_path() -> PathBuf {
    data_dir().join("memory.db")
}

/// Platform data directory for this application
pub fn data_dir() -> PathBuf {
    dirs::data_local_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("qfusion")
}

impl Default for FusionConfig {
    fn default() -> Self {
        Self {
            input_size: default_input_size(),
            hidden_size: default_hidden_size(),
            output_size: default_output_size(),
            n_qubits: default_n_qubits(),
            quantum_depth: default_quantum_depth(),
            fusion_mode: default_fusion_mode(),
            quantum_weight: default_quantum_weight(),
            shots: default_shots(),
            dropout_rate: default_dropout_rate(),
            learning_rate: default_learning_rate(),
            batch_size: default_batch_size(),
            update_interval_secs: default_update_interval_secs(),
            checkpoint_keep_last: default_checkpoint_keep_last(),
            database_path: default_database_path(),
        }
    }
}

impl FusionConfig {
    /// Load from a TOML file; any read or parse failure is fatal
    pub fn load(path: &std::path::Path) -> Result<Self> {
        let raw = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file {}", path.display()))?;
        let config: FusionConfig = toml::from_str(&raw)
            .with_context(|| format!("Failed to parse config file {}", path.display()))?;
        Ok(config)
    }

    /// Write the configuration back out as TOML
    pub fn save(&self, path: &std::path::Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let raw = toml::to_string_pretty(self)?;
        std::fs::write(path, raw)
            .with_context(|| format!("Failed to write config file {}", path.display()))?;
        Ok(())
    }

    /// Model hyperparameters carved out of the full configuration
    pub fn hyperparams(&self) -> ModelHyperparams {
        ModelHyperparams {
            input_size: self.input_size,
            hidden_size: self.hidden_size,
            output_size: self.output_size,
            n_qubits: self.n_qubits,
            quantum_depth: self.quantum_depth,
            fusion_mode: self.fusion_mode,
            quantum_weight: self.quantum_weight,
            shots: self.shots,
            dropout_rate: self.dropout_rate,
        }
    }

    /// Validate everything the model constructor will also enforce, plus the
    /// loop settings only this struct knows about
    pub fn validate(&self) -> crate::error::Result<()> {
        self.hyperparams().validate()?;
        if self.batch_size == 0 {
            return Err(crate::error::FusionError::Config(
                "batch size must be positive".into(),
            ));
        }
        if self.update_interval_secs == 0 {
            return Err(crate::error::FusionError::Config(
                "update interval must be positive".into(),
            ));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_are_valid() {
        let config = FusionConfig::default();
        config.validate().unwrap();
        assert_eq!(config.batch_size, 32);
        assert_eq!(config.update_interval_secs, 60);
    }

    #[test]
    fn test_missing_keys_fall_back_to_defaults() {
        let config: FusionConfig = toml::from_str("n_qubits = 3\ninput_size = 3").unwrap();
        assert_eq!(config.n_qubits, 3);
        assert_eq!(config.hidden_size, 8);
        assert_eq!(config.fusion_mode, FusionMode::Concat);
    }

    #[test]
    fn test_unparsable_document_is_an_error() {
        assert!(toml::from_str::<FusionConfig>("fusion_mode = \"blend\"").is_err());
    }

    #[test]
    fn test_weighted_sum_width_rule_enforced() {
        let config = FusionConfig {
            fusion_mode: FusionMode::WeightedSum,
            hidden_size: 8,
            n_qubits: 2,
            ..Default::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_round_trip_through_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.toml");

        let mut config = FusionConfig::default();
        config.n_qubits = 3;
        config.input_size = 3;
        config.save(&path).unwrap();

        let loaded = FusionConfig::load(&path).unwrap();
        assert_eq!(loaded.n_qubits, 3);
        assert_eq!(loaded.hidden_size, config.hidden_size);
    }

    #[test]
    fn test_load_missing_file_fails() {
        assert!(FusionConfig::load(std::path::Path::new("/nonexistent/config.toml")).is_err());
    }
}
