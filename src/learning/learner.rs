//! Unattended periodic learning loop
//!
//! One cycle: collect → preprocess → persist → train in batches →
//! checkpoint → sleep. The sleep is the loop's sole cancellation point;
//! `stop()` is observed there and at the top of the next cycle, never in the
//! middle of a training step. The loop is the sole writer of the model
//! parameters; concurrent predictions take the read lock and only ever see
//! fully applied optimizer steps.

use chrono::Utc;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::{watch, RwLock};
use tokio::task::JoinHandle;
use tokio::time::sleep;
use tracing::{debug, error, info, warn};

use crate::config::FusionConfig;
use crate::data::{CollectedRecord, DataCollector};
use crate::error::{FusionError, Result};
use crate::model::{FusionModel, Matrix};
use crate::store::PersistentStore;

/// Lifecycle of the learning loop
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoopState {
    Idle,
    Running,
    /// Stopped cooperatively via `stop()`
    Stopped,
    /// An error escaped a cycle; the loop terminated and the error is
    /// available through the join handle
    Faulted,
}

/// Long-lived scheduled task keeping the fusion model up to date
pub struct ContinuousLearner {
    model: Arc<RwLock<FusionModel>>,
    store: Arc<PersistentStore>,
    collector: Arc<DataCollector>,
    batch_size: usize,
    learning_rate: f32,
    interval: Duration,
    checkpoint_keep_last: usize,
    state: Mutex<LoopState>,
    shutdown_tx: watch::Sender<bool>,
    shutdown_rx: watch::Receiver<bool>,
}

impl ContinuousLearner {
    pub fn new(
        model: Arc<RwLock<FusionModel>>,
        store: Arc<PersistentStore>,
        collector: Arc<DataCollector>,
        config: &FusionConfig,
    ) -> Self {
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        Self {
            model,
            store,
            collector,
            batch_size: config.batch_size,
            learning_rate: config.learning_rate,
            interval: Duration::from_secs(config.update_interval_secs),
            checkpoint_keep_last: config.checkpoint_keep_last,
            state: Mutex::new(LoopState::Idle),
            shutdown_tx,
            shutdown_rx,
        }
    }

    /// Current lifecycle state
    pub fn state(&self) -> LoopState {
        *self.state.lock().expect("state lock poisoned")
    }

    /// Request a cooperative stop; takes effect at or before the next
    /// suspension point, never mid-step
    pub fn stop(&self) {
        info!("Stop requested for the learning loop");
        let _ = self.shutdown_tx.send(true);
    }

    /// Spawn the loop on the current runtime; a fault propagates through the
    /// returned handle
    pub fn spawn(self: Arc<Self>) -> JoinHandle<Result<()>> {
        tokio::spawn(async move { self.run().await })
    }

    /// Run the loop until stopped or faulted
    pub async fn run(&self) -> Result<()> {
        {
            let mut state = self.state.lock().expect("state lock poisoned");
            if *state == LoopState::Running {
                warn!("Learning loop already running");
                return Ok(());
            }
            *state = LoopState::Running;
        }
        info!(
            "Learning loop started (interval {:?}, batch size {})",
            self.interval, self.batch_size
        );

        let mut shutdown = self.shutdown_rx.clone();
        loop {
            if *shutdown.borrow() {
                break;
            }

            if let Err(e) = self.cycle().await {
                *self.state.lock().expect("state lock poisoned") = LoopState::Faulted;
                error!("Learning cycle faulted: {e}");
                return Err(FusionError::LoopFault(e.to_string()));
            }

            // Sole cancellation point: finish the sleep or leave early on
            // stop, but never interrupt an in-flight cycle.
            tokio::select! {
                _ = sleep(self.interval) => {}
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        break;
                    }
                }
            }
        }

        *self.state.lock().expect("state lock poisoned") = LoopState::Stopped;
        info!("Learning loop stopped");
        Ok(())
    }

    /// One collect/train/checkpoint cycle
    async fn cycle(&self) -> Result<()> {
        let record = self.collector.collect().await;
        if record.is_empty() {
            debug!("Nothing collected, skipping cycle");
            return Ok(());
        }

        let processed = preprocess(record);
        let content = serde_json::to_value(&processed)?;
        let entry_id = self
            .store
            .store("training_data", &content, Some(&processed.metadata))
            .await?;
        debug!("Persisted collected record as entry {entry_id}");

        let (input_size, output_size) = {
            let model = self.model.read().await;
            (model.input_size(), model.output_size())
        };
        let examples = featurize(&processed.text, input_size, output_size);
        if examples.is_empty() {
            debug!("Collected text produced no training examples");
            return Ok(());
        }

        let mut batches_trained = 0usize;
        for chunk in examples.chunks(self.batch_size) {
            let inputs: Vec<Vec<f32>> = chunk.iter().map(|(x, _)| x.clone()).collect();
            let targets: Vec<Vec<f32>> = chunk.iter().map(|(_, y)| y.clone()).collect();
            let batch = Matrix::from_rows(&inputs)?;
            let targets = Matrix::from_rows(&targets)?;

            let loss = {
                let mut model = self.model.write().await;
                model.train(&batch, &targets, 1, self.learning_rate)?
            };
            debug!("Batch {} loss: {loss:.6}", batches_trained + 1);
            batches_trained += 1;
        }

        let key = {
            let model = self.model.read().await;
            self.store
                .save_checkpoint(&model.save_state(), &model.optimizer_state())
                .await?
        };
        self.store
            .prune_checkpoints(self.checkpoint_keep_last)
            .await?;

        info!(
            "Cycle complete: {} examples in {batches_trained} batches, checkpoint {key}",
            examples.len()
        );
        Ok(())
    }
}

/// Normalize collected text and stamp the record
///
/// Text is case-folded and trimmed; metadata passes through unchanged; the
/// timestamp is refreshed to the preprocessing time.
pub fn preprocess(record: CollectedRecord) -> CollectedRecord {
    CollectedRecord {
        text: record.text.to_lowercase().trim().to_string(),
        metadata: record.metadata,
        timestamp: Utc::now(),
    }
}

/// Derive fixed-width training examples from free text
///
/// Each sentence becomes one example: tokens are hashed into `input_size`
/// buckets for the features and `output_size` buckets for the target, then
/// each vector is scaled by its largest count so every value lands in [0, 1].
/// Deterministic, so identical text always yields identical examples.
pub fn featurize(text: &str, input_size: usize, output_size: usize) -> Vec<(Vec<f32>, Vec<f32>)> {
    text.split(['.', '\n'])
        .filter_map(|sentence| {
            let tokens: Vec<&str> = sentence.split_whitespace().collect();
            if tokens.is_empty() {
                return None;
            }
            Some((
                hash_buckets(&tokens, input_size),
                hash_buckets(&tokens, output_size),
            ))
        })
        .collect()
}

fn hash_buckets(tokens: &[&str], dim: usize) -> Vec<f32> {
    use std::hash::{DefaultHasher, Hash, Hasher};

    let mut counts = vec![0.0f32; dim];
    for token in tokens {
        let mut hasher = DefaultHasher::new();
        token.hash(&mut hasher);
        counts[(hasher.finish() % dim as u64) as usize] += 1.0;
    }
    let max = counts.iter().cloned().fold(0.0f32, f32::max);
    if max > 0.0 {
        for c in &mut counts {
            *c /= max;
        }
    }
    counts
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeMap;

    #[test]
    fn test_preprocess_normalizes_text_and_keeps_metadata() {
        let mut metadata = BTreeMap::new();
        metadata.insert("source".to_string(), "unit".to_string());
        let record = CollectedRecord {
            text: "  Quantum NETWORKS  ".to_string(),
            metadata: metadata.clone(),
            timestamp: Utc::now(),
        };

        let processed = preprocess(record);
        assert_eq!(processed.text, "quantum networks");
        assert_eq!(processed.metadata, metadata);
    }

    #[test]
    fn test_featurize_shapes_and_range() {
        let examples = featurize("alpha beta gamma. delta epsilon", 4, 2);
        assert_eq!(examples.len(), 2);
        for (x, y) in &examples {
            assert_eq!(x.len(), 4);
            assert_eq!(y.len(), 2);
            assert!(x.iter().chain(y).all(|&v| (0.0..=1.0).contains(&v)));
        }
    }

    #[test]
    fn test_featurize_is_deterministic() {
        let a = featurize("same text every time", 8, 2);
        let b = featurize("same text every time", 8, 2);
        assert_eq!(a, b);
    }

    #[test]
    fn test_featurize_empty_text_yields_nothing() {
        assert!(featurize("", 4, 2).is_empty());
        assert!(featurize(" . . \n", 4, 2).is_empty());
    }
}
