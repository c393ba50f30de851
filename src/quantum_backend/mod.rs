// src/quantum_backend/mod.rs

pub mod native_simulator;
pub use native_simulator::NativeSimulator;

use crate::error::ErrorKind;
use crate::path::Instruction;
use num_complex::Complex64;

/// Outcomes within this distance of 0 or 1 are treated as determinate:
/// the path records the forced bit instead of forking.
pub const EPSILON: f64 = 1e-10;

/// Contract over the external state-vector engine. Implementations are
/// stateless across calls: every invocation evolves a fresh |0…0⟩ through
/// the given ledger, honoring measurement and reset projector markers.
pub trait QuantumBackend {
    fn evolve_ledger(
        &self,
        instructions: &[Instruction],
        num_qubits: usize,
    ) -> Result<Vec<Complex64>, String>;
}

/// Thin validation layer between the interpreter and the engine. Engine
/// output that is the wrong length, non-finite, or yields a probability
/// outside [0, 1] is an `AdapterFailure`, fatal to the whole run.
pub struct AmplitudeAdapter {
    backend: Box<dyn QuantumBackend>,
}

impl AmplitudeAdapter {
    pub fn new(backend: Box<dyn QuantumBackend>) -> Self {
        Self { backend }
    }

    /// Born-rule probability of reading 1 on `qubit` after the ledger.
    pub fn probability_of_one(
        &self,
        instructions: &[Instruction],
        num_qubits: usize,
        qubit: usize,
    ) -> Result<f64, ErrorKind> {
        let state = self.state_vector(instructions, num_qubits)?;
        let mask = 1usize << qubit;
        let p: f64 = state
            .iter()
            .enumerate()
            .filter(|(i, _)| i & mask != 0)
            .map(|(_, amp)| amp.norm_sqr())
            .sum();
        if !p.is_finite() || p < -1e-9 || p > 1.0 + 1e-9 {
            return Err(ErrorKind::AdapterFailure(format!(
                "engine reported probability {} for qubit {}",
                p, qubit
            )));
        }
        Ok(p.clamp(0.0, 1.0))
    }

    /// Full amplitude vector for the ledger, validated.
    pub fn state_vector(
        &self,
        instructions: &[Instruction],
        num_qubits: usize,
    ) -> Result<Vec<Complex64>, ErrorKind> {
        let state = self
            .backend
            .evolve_ledger(instructions, num_qubits)
            .map_err(ErrorKind::AdapterFailure)?;
        let expected = 1usize << num_qubits;
        if state.len() != expected {
            return Err(ErrorKind::AdapterFailure(format!(
                "engine returned {} amplitudes for {} qubits",
                state.len(),
                num_qubits
            )));
        }
        if state.iter().any(|amp| !amp.re.is_finite() || !amp.im.is_finite()) {
            return Err(ErrorKind::AdapterFailure(
                "engine returned non-finite amplitudes".to_string(),
            ));
        }
        Ok(state)
    }
}

impl Default for AmplitudeAdapter {
    fn default() -> Self {
        Self::new(Box::new(NativeSimulator::default()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct BrokenBackend;
    impl QuantumBackend for BrokenBackend {
        fn evolve_ledger(
            &self,
            _instructions: &[Instruction],
            _num_qubits: usize,
        ) -> Result<Vec<Complex64>, String> {
            Ok(vec![Complex64::new(f64::NAN, 0.0), Complex64::new(0.0, 0.0)])
        }
    }

    struct WrongLengthBackend;
    impl QuantumBackend for WrongLengthBackend {
        fn evolve_ledger(
            &self,
            _instructions: &[Instruction],
            _num_qubits: usize,
        ) -> Result<Vec<Complex64>, String> {
            Ok(vec![Complex64::new(1.0, 0.0)])
        }
    }

    #[test]
    fn test_nan_amplitudes_are_adapter_failure() {
        let adapter = AmplitudeAdapter::new(Box::new(BrokenBackend));
        let err = adapter.probability_of_one(&[], 1, 0).unwrap_err();
        assert!(matches!(err, ErrorKind::AdapterFailure(_)));
    }

    #[test]
    fn test_wrong_length_is_adapter_failure() {
        let adapter = AmplitudeAdapter::new(Box::new(WrongLengthBackend));
        let err = adapter.state_vector(&[], 1).unwrap_err();
        assert!(matches!(err, ErrorKind::AdapterFailure(_)));
    }

    #[test]
    fn test_default_adapter_reports_superposition() {
        let adapter = AmplitudeAdapter::default();
        let ledger = vec![Instruction::Gate {
            gate: "h".to_string(),
            targets: vec![0],
            parameters: vec![],
            modifiers: vec![],
        }];
        let p = adapter.probability_of_one(&ledger, 1, 0).unwrap();
        assert!((p - 0.5).abs() < 1e-10);
    }
}
