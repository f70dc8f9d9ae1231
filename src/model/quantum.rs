//! Simulated n-qubit register producing measurement probability vectors
//!
//! The circuit is fixed: a Hadamard layer putting every register into uniform
//! superposition, one RY rotation per register with angle `input[i] * PI`, a
//! linear CNOT chain entangling adjacent registers, and a measurement layer
//! sampled over a configurable number of shots. The circuit is rebuilt from
//! scratch on every call, so `process` has no observable state between calls.

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use serde::{Deserialize, Serialize};
use std::f64::consts::PI;

use crate::error::{FusionError, Result};
use crate::model::Matrix;

/// Default number of measurement shots per inference
pub const DEFAULT_SHOTS: u32 = 1000;

/// Default sampling seed; makes `process` deterministic out of the box
pub const DEFAULT_SEED: u64 = 42;

/// Diagnostic description of the simulated circuit
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct CircuitInfo {
    pub n_qubits: usize,
    pub n_classical_bits: usize,
    pub depth: usize,
}

/// Simulator for an n-qubit register
///
/// With a fixed `seed` (the default), `process` is fully deterministic:
/// identical input yields identical output. With `seed: None` each call
/// samples from the thread RNG and repeated calls agree only within
/// shot-sampling tolerance.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StateSimulator {
    n_qubits: usize,
    shots: u32,
    seed: Option<u64>,
}

impl StateSimulator {
    /// Create a simulator with the default shot count and seed
    pub fn new(n_qubits: usize) -> Result<Self> {
        Self::with_shots(n_qubits, DEFAULT_SHOTS)
    }

    /// Create a simulator with an explicit shot count
    pub fn with_shots(n_qubits: usize, shots: u32) -> Result<Self> {
        if n_qubits == 0 {
            return Err(FusionError::Config(
                "simulator requires at least one qubit".into(),
            ));
        }
        // 2^n amplitudes are materialized; keep the register size sane
        if n_qubits > 24 {
            return Err(FusionError::Config(format!(
                "{n_qubits} qubits exceeds the supported register size (24)"
            )));
        }
        if shots == 0 {
            return Err(FusionError::Config("shot count must be positive".into()));
        }
        Ok(Self {
            n_qubits,
            shots,
            seed: Some(DEFAULT_SEED),
        })
    }

    /// Override the sampling seed; `None` opts into true shot noise
    pub fn set_seed(&mut self, seed: Option<u64>) {
        self.seed = seed;
    }

    pub fn n_qubits(&self) -> usize {
        self.n_qubits
    }

    pub fn shots(&self) -> u32 {
        self.shots
    }

    /// Rotation layer + entangling layer + measurement layer
    pub fn circuit_depth(&self) -> usize {
        3
    }

    /// Circuit dimensions for diagnostics
    pub fn circuit_size(&self) -> CircuitInfo {
        CircuitInfo {
            n_qubits: self.n_qubits,
            n_classical_bits: self.n_qubits,
            depth: self.circuit_depth(),
        }
    }

    /// Run the circuit for a single sample and return the normalized
    /// probability vector over all 2^n outcomes
    ///
    /// Index `i` encodes the measured bits with qubit 0 in the least
    /// significant position. The input must be a 1 x n_qubits batch.
    pub fn process(&self, input: &Matrix) -> Result<Vec<f32>> {
        input.check_width("simulator input", self.n_qubits)?;
        if input.rows() != 1 {
            return Err(FusionError::Validation(format!(
                "simulator expects a single sample, got a batch of {}",
                input.rows()
            )));
        }
        self.process_sample(input.row_slice(0))
    }

    /// Run the circuit for a raw feature slice of length n_qubits
    pub fn process_sample(&self, input: &[f32]) -> Result<Vec<f32>> {
        if input.len() != self.n_qubits {
            return Err(FusionError::width_mismatch(
                "simulator input",
                self.n_qubits,
                input.len(),
            ));
        }

        let amplitudes = self.evolve(input);
        let counts = self.sample(&amplitudes);

        // Normalize counts into probabilities; if every shot somehow failed
        // to land, fall back to the uniform distribution rather than a
        // degenerate all-zero vector.
        let dim = 1usize << self.n_qubits;
        let total: u64 = counts.iter().map(|&c| c as u64).sum();
        let mut probs = vec![0.0f32; dim];
        if total == 0 {
            let uniform = 1.0 / dim as f32;
            probs.fill(uniform);
            return Ok(probs);
        }
        for (p, &c) in probs.iter_mut().zip(&counts) {
            *p = c as f32 / total as f32;
        }
        let sum: f32 = probs.iter().sum();
        for p in &mut probs {
            *p /= sum;
        }
        Ok(probs)
    }

    /// Build the statevector for the fixed circuit
    ///
    /// H, RY, and CNOT all have real matrix entries, so the amplitudes stay
    /// real throughout and a plain f64 vector suffices.
    fn evolve(&self, input: &[f32]) -> Vec<f64> {
        let dim = 1usize << self.n_qubits;
        let mut amps = vec![0.0f64; dim];
        amps[0] = 1.0;

        let inv_sqrt2 = std::f64::consts::FRAC_1_SQRT_2;
        for q in 0..self.n_qubits {
            apply_single_qubit(&mut amps, q, |a, b| {
                ((a + b) * inv_sqrt2, (a - b) * inv_sqrt2)
            });
        }
        for (q, &x) in input.iter().enumerate() {
            let half = f64::from(x) * PI / 2.0;
            let (s, c) = half.sin_cos();
            apply_single_qubit(&mut amps, q, |a, b| (c * a - s * b, s * a + c * b));
        }
        for q in 0..self.n_qubits.saturating_sub(1) {
            apply_cnot(&mut amps, q, q + 1);
        }
        amps
    }

    /// Tabulate `shots` independent measurements against the statevector
    fn sample(&self, amplitudes: &[f64]) -> Vec<u32> {
        let mut cumulative = Vec::with_capacity(amplitudes.len());
        let mut acc = 0.0f64;
        for &a in amplitudes {
            acc += a * a;
            cumulative.push(acc);
        }
        let total = acc;

        let mut counts = vec![0u32; amplitudes.len()];
        let mut draw = |rng: &mut dyn rand::RngCore| {
            let u: f64 = rng.random::<f64>() * total;
            let idx = cumulative.partition_point(|&c| c <= u);
            let idx = idx.min(counts.len() - 1);
            counts[idx] += 1;
        };
        match self.seed {
            Some(seed) => {
                let mut rng = StdRng::seed_from_u64(seed);
                for _ in 0..self.shots {
                    draw(&mut rng);
                }
            }
            None => {
                let mut rng = rand::rng();
                for _ in 0..self.shots {
                    draw(&mut rng);
                }
            }
        }
        counts
    }
}

/// Apply a real 2x2 gate to qubit `q` of the statevector
fn apply_single_qubit<F>(amps: &mut [f64], q: usize, gate: F)
where
    F: Fn(f64, f64) -> (f64, f64),
{
    let stride = 1usize << q;
    let mut i = 0;
    while i < amps.len() {
        if i & stride == 0 {
            let j = i | stride;
            let (a, b) = (amps[i], amps[j]);
            let (na, nb) = gate(a, b);
            amps[i] = na;
            amps[j] = nb;
        }
        i += 1;
    }
}

/// Apply CNOT with the given control and target qubits
fn apply_cnot(amps: &mut [f64], control: usize, target: usize) {
    let cbit = 1usize << control;
    let tbit = 1usize << target;
    for i in 0..amps.len() {
        if i & cbit != 0 && i & tbit == 0 {
            amps.swap(i, i | tbit);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn assert_valid_distribution(probs: &[f32], dim: usize) {
        assert_eq!(probs.len(), dim);
        assert!(probs.iter().all(|&p| p >= 0.0));
        let sum: f32 = probs.iter().sum();
        assert!((sum - 1.0).abs() < 1e-6, "sum was {sum}");
    }

    #[test]
    fn test_distribution_for_all_register_sizes() {
        for n in 1..=8 {
            let sim = StateSimulator::new(n).unwrap();
            let input: Vec<f32> = (0..n).map(|i| i as f32 / n as f32).collect();
            let probs = sim.process_sample(&input).unwrap();
            assert_valid_distribution(&probs, 1 << n);
        }
    }

    #[test]
    fn test_seeded_process_is_idempotent() {
        let sim = StateSimulator::new(3).unwrap();
        let input = Matrix::row(&[0.1, 0.5, 0.9]);
        let a = sim.process(&input).unwrap();
        let b = sim.process(&input).unwrap();
        assert_eq!(a, b);
    }

    #[test]
    fn test_unseeded_runs_agree_within_sampling_tolerance() {
        let mut sim = StateSimulator::with_shots(2, 4000).unwrap();
        sim.set_seed(None);
        let input = Matrix::row(&[0.3, 0.7]);
        let a = sim.process(&input).unwrap();
        let b = sim.process(&input).unwrap();
        for (x, y) in a.iter().zip(&b) {
            assert!((x - y).abs() < 0.1, "sampling deviation too large");
        }
    }

    #[test]
    fn test_rejects_wrong_width() {
        let sim = StateSimulator::new(2).unwrap();
        let err = sim.process(&Matrix::row(&[0.5])).unwrap_err();
        assert!(matches!(err, crate::error::FusionError::Validation(_)));
    }

    #[test]
    fn test_rejects_multi_sample_batch() {
        let sim = StateSimulator::new(2).unwrap();
        let batch = Matrix::from_rows(&[vec![0.1, 0.2], vec![0.3, 0.4]]).unwrap();
        assert!(sim.process(&batch).is_err());
    }

    #[test]
    fn test_zero_rotation_splits_between_chain_states() {
        // With x = 0 every register stays in uniform superposition; the CNOT
        // chain shuffles outcomes but the distribution remains uniform.
        let sim = StateSimulator::with_shots(2, 100_000).unwrap();
        let probs = sim.process_sample(&[0.0, 0.0]).unwrap();
        for &p in &probs {
            assert!((p - 0.25).abs() < 0.02, "probability was {p}");
        }
    }

    #[test]
    fn test_circuit_diagnostics() {
        let sim = StateSimulator::new(4).unwrap();
        assert_eq!(sim.circuit_depth(), 3);
        let info = sim.circuit_size();
        assert_eq!(info.n_qubits, 4);
        assert_eq!(info.n_classical_bits, 4);
        assert_eq!(info.depth, 3);
    }

    #[test]
    fn test_invalid_construction() {
        assert!(StateSimulator::new(0).is_err());
        assert!(StateSimulator::with_shots(2, 0).is_err());
        assert!(StateSimulator::new(25).is_err());
    }
}
