// src/quantum_backend/native_simulator.rs

use super::QuantumBackend;
use crate::path::{Instruction, Modifier};
use num_complex::Complex64;
use rayon::prelude::*;
use std::f64::consts::FRAC_1_SQRT_2;

/// A projected branch with squared norm at or below this has no support;
/// the ledger forced an outcome the state cannot produce.
const PROJECTION_FLOOR: f64 = 1e-12;

/// Dense state-vector engine: 2^n amplitudes, gates applied by bit-mask
/// index pairing, projector markers for measure/reset.
pub struct NativeSimulator {
    /// State sizes at or above this length map amplitudes through rayon.
    parallel_threshold: usize,
}

impl NativeSimulator {
    pub fn new(parallel_threshold: usize) -> Self {
        Self { parallel_threshold }
    }
}

impl Default for NativeSimulator {
    fn default() -> Self {
        Self::new(1 << 12)
    }
}

impl QuantumBackend for NativeSimulator {
    fn evolve_ledger(
        &self,
        instructions: &[Instruction],
        num_qubits: usize,
    ) -> Result<Vec<Complex64>, String> {
        let mut state = vec![Complex64::new(0.0, 0.0); 1usize << num_qubits];
        state[0] = Complex64::new(1.0, 0.0);

        for inst in instructions {
            match inst {
                Instruction::Gate { gate, targets, parameters, modifiers } => {
                    self.apply_gate(&mut state, num_qubits, gate, targets, parameters, modifiers)?;
                }
                Instruction::Measure { qubit, outcome } => {
                    check_qubit(*qubit, num_qubits)?;
                    project(&mut state, *qubit, *outcome)?;
                }
                Instruction::Reset { qubit } => {
                    check_qubit(*qubit, num_qubits)?;
                    reset(&mut state, *qubit)?;
                }
            }
        }
        Ok(state)
    }
}

fn check_qubit(qubit: usize, num_qubits: usize) -> Result<(), String> {
    if qubit >= num_qubits {
        Err(format!("qubit {} out of range for {} qubits", qubit, num_qubits))
    } else {
        Ok(())
    }
}

impl NativeSimulator {
    fn apply_gate(
        &self,
        state: &mut Vec<Complex64>,
        num_qubits: usize,
        gate: &str,
        targets: &[usize],
        parameters: &[f64],
        modifiers: &[Modifier],
    ) -> Result<(), String> {
        let (mut mat, core_qubits, implicit_controls) = base_matrix(gate, parameters)?;

        // Fold the modifier stack from the inside out: inv/pow transform
        // the core matrix (controls commute past both), ctrl/negctrl
        // prepend control slots so the outermost modifier claims the
        // leading targets.
        let mut polarity: Vec<bool> = vec![true; implicit_controls];
        for m in modifiers.iter().rev() {
            match m {
                Modifier::Inv => mat = adjoint(&mat),
                Modifier::Pow(x) => mat = matrix_power(&mat, *x)?,
                Modifier::Ctrl(k) => {
                    let mut v = vec![true; *k];
                    v.extend(polarity);
                    polarity = v;
                }
                Modifier::NegCtrl(k) => {
                    let mut v = vec![false; *k];
                    v.extend(polarity);
                    polarity = v;
                }
            }
        }

        let expected = polarity.len() + core_qubits;
        if targets.len() != expected {
            return Err(format!(
                "gate {} with its modifiers expects {} qubits, got {}",
                gate,
                expected,
                targets.len()
            ));
        }
        for &t in targets {
            check_qubit(t, num_qubits)?;
        }
        for (i, &a) in targets.iter().enumerate() {
            if targets[i + 1..].contains(&a) {
                return Err(format!("gate {} targets qubit {} twice", gate, a));
            }
        }

        let (ctrl_qubits, core_targets) = targets.split_at(polarity.len());
        let mut pos_mask = 0usize;
        let mut neg_mask = 0usize;
        for (&q, &positive) in ctrl_qubits.iter().zip(polarity.iter()) {
            if positive {
                pos_mask |= 1 << q;
            } else {
                neg_mask |= 1 << q;
            }
        }

        apply_matrix(state, &mat, core_targets, pos_mask, neg_mask, self.parallel_threshold);
        Ok(())
    }
}

/// Map every basis amplitude through the (controlled) matrix. The first
/// core target is the most significant bit of the local matrix index.
fn apply_matrix(
    state: &mut Vec<Complex64>,
    mat: &[Complex64],
    targets: &[usize],
    pos_mask: usize,
    neg_mask: usize,
    parallel_threshold: usize,
) {
    let q = targets.len();
    let dim = 1usize << q;
    let old = std::mem::take(state);

    let compute = |i: usize| -> Complex64 {
        if i & pos_mask != pos_mask || i & neg_mask != 0 {
            return old[i];
        }
        let mut row = 0usize;
        let mut base = i;
        for (m, &t) in targets.iter().enumerate() {
            if (i >> t) & 1 == 1 {
                row |= 1 << (q - 1 - m);
            }
            base &= !(1usize << t);
        }
        let mut acc = Complex64::new(0.0, 0.0);
        for col in 0..dim {
            let entry = mat[row * dim + col];
            if entry.norm_sqr() == 0.0 {
                continue;
            }
            let mut idx = base;
            for (m, &t) in targets.iter().enumerate() {
                if (col >> (q - 1 - m)) & 1 == 1 {
                    idx |= 1 << t;
                }
            }
            acc += entry * old[idx];
        }
        acc
    };

    *state = if old.len() >= parallel_threshold {
        (0..old.len()).into_par_iter().map(compute).collect()
    } else {
        (0..old.len()).map(compute).collect()
    };
}

/// Project `qubit` onto `outcome` and renormalize.
fn project(state: &mut [Complex64], qubit: usize, outcome: u8) -> Result<(), String> {
    let mask = 1usize << qubit;
    let norm_sq: f64 = state
        .iter()
        .enumerate()
        .filter(|(i, _)| ((i & mask != 0) as u8) == outcome)
        .map(|(_, amp)| amp.norm_sqr())
        .sum();
    if norm_sq <= PROJECTION_FLOOR {
        return Err(format!(
            "projection of qubit {} onto outcome {} annihilates the state",
            qubit, outcome
        ));
    }
    let scale = 1.0 / norm_sq.sqrt();
    for (i, amp) in state.iter_mut().enumerate() {
        if ((i & mask != 0) as u8) == outcome {
            *amp *= scale;
        } else {
            *amp = Complex64::new(0.0, 0.0);
        }
    }
    Ok(())
}

/// Force `qubit` to |0⟩: project onto 0 when that branch has support,
/// otherwise project onto 1 and flip. Either way the post-state carries
/// the qubit in |0⟩, matching the measure-then-X formulation.
fn reset(state: &mut [Complex64], qubit: usize) -> Result<(), String> {
    let mask = 1usize << qubit;
    let p0: f64 = state
        .iter()
        .enumerate()
        .filter(|(i, _)| i & mask == 0)
        .map(|(_, amp)| amp.norm_sqr())
        .sum();
    if p0 > PROJECTION_FLOOR {
        project(state, qubit, 0)
    } else {
        project(state, qubit, 1)?;
        for i in 0..state.len() {
            if i & mask != 0 {
                state[i & !mask] = state[i];
                state[i] = Complex64::new(0.0, 0.0);
            }
        }
        Ok(())
    }
}

/// Matrix for a built-in gate: (flattened row-major matrix, core qubit
/// count, implicit control count). cnot/cz/ccx are expressed as their
/// controlled single-qubit cores so modifier algebra (pow, inv) composes.
fn base_matrix(
    name: &str,
    params: &[f64],
) -> Result<(Vec<Complex64>, usize, usize), String> {
    let z = Complex64::new(0.0, 0.0);
    let o = Complex64::new(1.0, 0.0);
    let i = Complex64::new(0.0, 1.0);
    let h = Complex64::new(FRAC_1_SQRT_2, 0.0);

    let param = |k: usize| -> Result<f64, String> {
        params
            .get(k)
            .copied()
            .ok_or_else(|| format!("gate {} is missing parameter {}", name, k))
    };

    let out = match name {
        "id" => (vec![o, z, z, o], 1, 0),
        "x" => (vec![z, o, o, z], 1, 0),
        "y" => (vec![z, -i, i, z], 1, 0),
        "z" => (vec![o, z, z, -o], 1, 0),
        "h" => (vec![h, h, h, -h], 1, 0),
        "s" => (vec![o, z, z, i], 1, 0),
        "sdg" => (vec![o, z, z, -i], 1, 0),
        "t" => (vec![o, z, z, Complex64::from_polar(1.0, std::f64::consts::FRAC_PI_4)], 1, 0),
        "tdg" => (vec![o, z, z, Complex64::from_polar(1.0, -std::f64::consts::FRAC_PI_4)], 1, 0),
        "rx" => {
            let half = param(0)? / 2.0;
            let c = Complex64::new(half.cos(), 0.0);
            let s = Complex64::new(0.0, -half.sin());
            (vec![c, s, s, c], 1, 0)
        }
        "ry" => {
            let half = param(0)? / 2.0;
            let c = Complex64::new(half.cos(), 0.0);
            let s = Complex64::new(half.sin(), 0.0);
            (vec![c, -s, s, c], 1, 0)
        }
        "rz" => {
            let half = param(0)? / 2.0;
            (
                vec![
                    Complex64::from_polar(1.0, -half),
                    z,
                    z,
                    Complex64::from_polar(1.0, half),
                ],
                1,
                0,
            )
        }
        "u" => {
            let theta = param(0)?;
            let phi = param(1)?;
            let lambda = param(2)?;
            let half = theta / 2.0;
            (
                vec![
                    Complex64::new(half.cos(), 0.0),
                    Complex64::from_polar(-half.sin(), lambda),
                    Complex64::from_polar(half.sin(), phi),
                    Complex64::from_polar(half.cos(), phi + lambda),
                ],
                1,
                0,
            )
        }
        "phase" => (vec![o, z, z, Complex64::from_polar(1.0, param(0)?)], 1, 0),
        "gphase" => (vec![Complex64::from_polar(1.0, param(0)?)], 0, 0),
        "cnot" => (vec![z, o, o, z], 1, 1),
        "cz" => (vec![o, z, z, -o], 1, 1),
        "ccx" => (vec![z, o, o, z], 1, 2),
        "swap" => (
            vec![
                o, z, z, z, //
                z, z, o, z, //
                z, o, z, z, //
                z, z, z, o,
            ],
            2,
            0,
        ),
        other => return Err(format!("unknown gate '{}'", other)),
    };
    Ok(out)
}

fn mat_dim(mat: &[Complex64]) -> usize {
    (mat.len() as f64).sqrt().round() as usize
}

fn adjoint(mat: &[Complex64]) -> Vec<Complex64> {
    let dim = mat_dim(mat);
    let mut out = vec![Complex64::new(0.0, 0.0); mat.len()];
    for r in 0..dim {
        for c in 0..dim {
            out[c * dim + r] = mat[r * dim + c].conj();
        }
    }
    out
}

fn mat_mul(a: &[Complex64], b: &[Complex64], dim: usize) -> Vec<Complex64> {
    let mut out = vec![Complex64::new(0.0, 0.0); dim * dim];
    for r in 0..dim {
        for c in 0..dim {
            let mut acc = Complex64::new(0.0, 0.0);
            for k in 0..dim {
                acc += a[r * dim + k] * b[k * dim + c];
            }
            out[r * dim + c] = acc;
        }
    }
    out
}

fn identity(dim: usize) -> Vec<Complex64> {
    let mut out = vec![Complex64::new(0.0, 0.0); dim * dim];
    for r in 0..dim {
        out[r * dim + r] = Complex64::new(1.0, 0.0);
    }
    out
}

/// Raise a unitary to a real power. Integer exponents repeat (inverting
/// first when negative); fractional exponents use the axis-angle closed
/// form, which exists for 2×2 unitaries only.
fn matrix_power(mat: &[Complex64], x: f64) -> Result<Vec<Complex64>, String> {
    if (x - x.round()).abs() < 1e-12 {
        let n = x.round() as i64;
        let dim = mat_dim(mat);
        let base = if n < 0 { adjoint(mat) } else { mat.to_vec() };
        let mut acc = identity(dim);
        for _ in 0..n.unsigned_abs() {
            acc = mat_mul(&acc, &base, dim);
        }
        return Ok(acc);
    }
    if mat.len() != 4 {
        return Err("fractional pow is only supported on single-qubit gates".to_string());
    }

    // U = e^{iφ} (cos θ I - i sin θ n·σ); then U^x rotates by xθ with
    // global phase xφ.
    let det = mat[0] * mat[3] - mat[1] * mat[2];
    let phi = det.arg() / 2.0;
    let unphase = Complex64::from_polar(1.0, -phi);
    let v: Vec<Complex64> = mat.iter().map(|m| m * unphase).collect();

    let cos_t = ((v[0] + v[3]) / 2.0).re;
    let i = Complex64::new(0.0, 1.0);
    let sx = ((v[1] + v[2]) * i / 2.0).re;
    let sy = ((v[2] - v[1]) / 2.0).re;
    let sz = ((v[3] - v[0]) * (-i) / 2.0).re;
    let sin_t = (sx * sx + sy * sy + sz * sz).sqrt();

    if sin_t < 1e-12 {
        // V is ±identity: the gate is a pure phase.
        let scalar = Complex64::from_polar(1.0, phi) * cos_t.signum();
        let powered = scalar.powf(x);
        let z = Complex64::new(0.0, 0.0);
        return Ok(vec![powered, z, z, powered]);
    }

    let (nx, ny, nz) = (sx / sin_t, sy / sin_t, sz / sin_t);
    let theta = sin_t.atan2(cos_t);
    let (c, s) = ((x * theta).cos(), (x * theta).sin());
    let out_phase = Complex64::from_polar(1.0, x * phi);
    let m00 = out_phase * Complex64::new(c, -s * nz);
    let m01 = out_phase * (Complex64::new(0.0, -s) * Complex64::new(nx, -ny));
    let m10 = out_phase * (Complex64::new(0.0, -s) * Complex64::new(nx, ny));
    let m11 = out_phase * Complex64::new(c, s * nz);
    Ok(vec![m00, m01, m10, m11])
}

#[cfg(test)]
mod tests {
    use super::*;

    fn gate(name: &str, targets: Vec<usize>, params: Vec<f64>) -> Instruction {
        Instruction::Gate {
            gate: name.to_string(),
            targets,
            parameters: params,
            modifiers: vec![],
        }
    }

    fn modified(
        name: &str,
        targets: Vec<usize>,
        params: Vec<f64>,
        modifiers: Vec<Modifier>,
    ) -> Instruction {
        Instruction::Gate { gate: name.to_string(), targets, parameters: params, modifiers }
    }

    fn prob_one(state: &[Complex64], qubit: usize) -> f64 {
        state
            .iter()
            .enumerate()
            .filter(|(i, _)| i & (1 << qubit) != 0)
            .map(|(_, a)| a.norm_sqr())
            .sum()
    }

    #[test]
    fn test_hadamard_superposition() {
        let sim = NativeSimulator::default();
        let state = sim.evolve_ledger(&[gate("h", vec![0], vec![])], 1).unwrap();
        assert!((prob_one(&state, 0) - 0.5).abs() < 1e-10);
    }

    #[test]
    fn test_cnot_entangles() {
        let sim = NativeSimulator::default();
        let ledger = vec![gate("h", vec![0], vec![]), gate("cnot", vec![0, 1], vec![])];
        let state = sim.evolve_ledger(&ledger, 2).unwrap();
        assert!((state[0b00].norm_sqr() - 0.5).abs() < 1e-10);
        assert!((state[0b11].norm_sqr() - 0.5).abs() < 1e-10);
        assert!(state[0b01].norm_sqr() < 1e-12);
        assert!(state[0b10].norm_sqr() < 1e-12);
    }

    #[test]
    fn test_measure_marker_projects_and_renormalizes() {
        let sim = NativeSimulator::default();
        let ledger = vec![
            gate("h", vec![0], vec![]),
            gate("cnot", vec![0, 1], vec![]),
            Instruction::Measure { qubit: 0, outcome: 1 },
        ];
        let state = sim.evolve_ledger(&ledger, 2).unwrap();
        assert!((state[0b11].norm_sqr() - 1.0).abs() < 1e-10);
    }

    #[test]
    fn test_contradictory_projection_fails() {
        let sim = NativeSimulator::default();
        let ledger = vec![Instruction::Measure { qubit: 0, outcome: 1 }];
        assert!(sim.evolve_ledger(&ledger, 1).is_err());
    }

    #[test]
    fn test_reset_from_one() {
        let sim = NativeSimulator::default();
        let ledger = vec![gate("x", vec![0], vec![]), Instruction::Reset { qubit: 0 }];
        let state = sim.evolve_ledger(&ledger, 1).unwrap();
        assert!((state[0].norm_sqr() - 1.0).abs() < 1e-10);
    }

    #[test]
    fn test_ctrl_modifier_equals_cnot() {
        let sim = NativeSimulator::default();
        let a = sim
            .evolve_ledger(
                &[
                    gate("h", vec![0], vec![]),
                    modified("x", vec![0, 1], vec![], vec![Modifier::Ctrl(1)]),
                ],
                2,
            )
            .unwrap();
        let b = sim
            .evolve_ledger(
                &[gate("h", vec![0], vec![]), gate("cnot", vec![0, 1], vec![])],
                2,
            )
            .unwrap();
        for (x, y) in a.iter().zip(b.iter()) {
            assert!((x - y).norm() < 1e-10);
        }
    }

    #[test]
    fn test_negctrl_fires_on_zero() {
        let sim = NativeSimulator::default();
        let ledger = vec![modified("x", vec![0, 1], vec![], vec![Modifier::NegCtrl(1)])];
        let state = sim.evolve_ledger(&ledger, 2).unwrap();
        // Control qubit 0 is |0⟩, so the target flips.
        assert!((prob_one(&state, 1) - 1.0).abs() < 1e-10);
    }

    #[test]
    fn test_inv_of_s_is_sdg() {
        let sim = NativeSimulator::default();
        let a = sim
            .evolve_ledger(
                &[
                    gate("h", vec![0], vec![]),
                    modified("s", vec![0], vec![], vec![Modifier::Inv]),
                ],
                1,
            )
            .unwrap();
        let b = sim
            .evolve_ledger(&[gate("h", vec![0], vec![]), gate("sdg", vec![0], vec![])], 1)
            .unwrap();
        for (x, y) in a.iter().zip(b.iter()) {
            assert!((x - y).norm() < 1e-10);
        }
    }

    #[test]
    fn test_sqrt_x_squared_is_x() {
        let sim = NativeSimulator::default();
        let ledger = vec![
            modified("x", vec![0], vec![], vec![Modifier::Pow(0.5)]),
            modified("x", vec![0], vec![], vec![Modifier::Pow(0.5)]),
        ];
        let state = sim.evolve_ledger(&ledger, 1).unwrap();
        assert!(state[0].norm_sqr() < 1e-10);
        assert!((state[1].norm_sqr() - 1.0).abs() < 1e-10);
    }

    #[test]
    fn test_integer_pow_repeats() {
        let sim = NativeSimulator::default();
        let ledger = vec![modified("x", vec![0], vec![], vec![Modifier::Pow(2.0)])];
        let state = sim.evolve_ledger(&ledger, 1).unwrap();
        assert!((state[0].norm_sqr() - 1.0).abs() < 1e-10);
    }

    #[test]
    fn test_negative_pow_inverts() {
        let sim = NativeSimulator::default();
        let ledger = vec![
            gate("h", vec![0], vec![]),
            gate("t", vec![0], vec![]),
            modified("t", vec![0], vec![], vec![Modifier::Pow(-1.0)]),
            gate("h", vec![0], vec![]),
        ];
        let state = sim.evolve_ledger(&ledger, 1).unwrap();
        assert!((state[0].norm_sqr() - 1.0).abs() < 1e-10);
    }

    #[test]
    fn test_swap_exchanges_amplitudes() {
        let sim = NativeSimulator::default();
        let ledger = vec![gate("x", vec![0], vec![]), gate("swap", vec![0, 1], vec![])];
        let state = sim.evolve_ledger(&ledger, 2).unwrap();
        assert!((prob_one(&state, 1) - 1.0).abs() < 1e-10);
        assert!(prob_one(&state, 0) < 1e-12);
    }

    #[test]
    fn test_ccx_needs_both_controls() {
        let sim = NativeSimulator::default();
        let ledger = vec![gate("x", vec![0], vec![]), gate("ccx", vec![0, 1, 2], vec![])];
        let state = sim.evolve_ledger(&ledger, 3).unwrap();
        assert!(prob_one(&state, 2) < 1e-12);

        let ledger = vec![
            gate("x", vec![0], vec![]),
            gate("x", vec![1], vec![]),
            gate("ccx", vec![0, 1, 2], vec![]),
        ];
        let state = sim.evolve_ledger(&ledger, 3).unwrap();
        assert!((prob_one(&state, 2) - 1.0).abs() < 1e-10);
    }

    #[test]
    fn test_controlled_gphase_is_phase() {
        let sim = NativeSimulator::default();
        let theta = 0.7;
        let a = sim
            .evolve_ledger(
                &[
                    gate("h", vec![0], vec![]),
                    modified("gphase", vec![0], vec![theta], vec![Modifier::Ctrl(1)]),
                ],
                1,
            )
            .unwrap();
        let b = sim
            .evolve_ledger(
                &[gate("h", vec![0], vec![]), gate("phase", vec![0], vec![theta])],
                1,
            )
            .unwrap();
        for (x, y) in a.iter().zip(b.iter()) {
            assert!((x - y).norm() < 1e-10);
        }
    }

    #[test]
    fn test_qubit_reuse_is_engine_error() {
        let sim = NativeSimulator::default();
        let err = sim.evolve_ledger(&[gate("cnot", vec![0, 0], vec![])], 1);
        assert!(err.is_err());
    }

    #[test]
    fn test_gate_unknown_name() {
        let sim = NativeSimulator::default();
        assert!(sim.evolve_ledger(&[gate("warp", vec![0], vec![])], 1).is_err());
    }
}
