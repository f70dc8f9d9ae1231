//! Adam optimizer with serializable moment state
//!
//! Each trainable tensor registers a slot holding its first and second
//! moment estimates. The whole optimizer serializes as one unit so a
//! checkpoint restores momentum exactly where training left off.

use serde::{Deserialize, Serialize};

use crate::error::{FusionError, Result};

const BETA1: f32 = 0.9;
const BETA2: f32 = 0.999;
const EPS: f32 = 1e-8;

/// Moment estimates for one parameter tensor
#[derive(Debug, Clone, Serialize, Deserialize)]
struct AdamSlot {
    m: Vec<f32>,
    v: Vec<f32>,
}

/// Adam optimizer over a fixed set of parameter tensors
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Adam {
    learning_rate: f32,
    step: u64,
    slots: Vec<AdamSlot>,
}

impl Adam {
    /// Create an optimizer with no registered tensors
    pub fn new(learning_rate: f32) -> Self {
        Self {
            learning_rate,
            step: 0,
            slots: Vec::new(),
        }
    }

    /// Register a tensor of the given length, returning its slot index
    pub fn register(&mut self, len: usize) -> usize {
        self.slots.push(AdamSlot {
            m: vec![0.0; len],
            v: vec![0.0; len],
        });
        self.slots.len() - 1
    }

    pub fn learning_rate(&self) -> f32 {
        self.learning_rate
    }

    pub fn set_learning_rate(&mut self, lr: f32) {
        self.learning_rate = lr;
    }

    /// Number of optimizer steps applied so far
    pub fn steps(&self) -> u64 {
        self.step
    }

    /// Advance the shared step counter; call once per optimizer step,
    /// before updating any tensor
    pub fn begin_step(&mut self) {
        self.step += 1;
    }

    /// Apply one Adam update to the tensor registered at `slot`
    pub fn update(&mut self, slot: usize, params: &mut [f32], grads: &[f32]) -> Result<()> {
        let state = self
            .slots
            .get_mut(slot)
            .ok_or_else(|| FusionError::Computation(format!("unknown optimizer slot {slot}")))?;
        if params.len() != state.m.len() || grads.len() != state.m.len() {
            return Err(FusionError::Computation(format!(
                "optimizer slot {slot} holds {} values, got {} params / {} grads",
                state.m.len(),
                params.len(),
                grads.len()
            )));
        }

        let t = self.step.max(1) as i32;
        let bias1 = 1.0 - BETA1.powi(t);
        let bias2 = 1.0 - BETA2.powi(t);

        for i in 0..params.len() {
            let g = grads[i];
            state.m[i] = BETA1 * state.m[i] + (1.0 - BETA1) * g;
            state.v[i] = BETA2 * state.v[i] + (1.0 - BETA2) * g * g;
            let m_hat = state.m[i] / bias1;
            let v_hat = state.v[i] / bias2;
            params[i] -= self.learning_rate * m_hat / (v_hat.sqrt() + EPS);
        }
        Ok(())
    }
}
