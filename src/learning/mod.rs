//! Continuous learning system
//!
//! A long-lived background task that pulls freshly collected data,
//! preprocesses and persists it, trains the fusion model in batches, and
//! checkpoints the result every productive cycle.

pub mod learner;

pub use learner::{featurize, preprocess, ContinuousLearner, LoopState};
