// src/path.rs
use crate::environment::ScopeStack;
use crate::error::{PathId, RuntimeError};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// Gate modifiers as recorded in the ledger. Outer modifiers precede
/// inner ones; `Ctrl`/`NegCtrl` consume the leading target slots.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Modifier {
    Ctrl(usize),
    NegCtrl(usize),
    Inv,
    Pow(f64),
}

/// One committed quantum operation. The ledger of these records is the
/// whole contract with the amplitude engine: gates plus measurement and
/// reset markers, nothing else.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Instruction {
    Gate {
        gate: String,
        targets: Vec<usize>,
        parameters: Vec<f64>,
        modifiers: Vec<Modifier>,
    },
    /// Projector marker: the engine projects this qubit onto `outcome`
    /// and renormalizes.
    Measure { qubit: usize, outcome: u8 },
    /// Projector marker: the engine forces this qubit to |0⟩.
    Reset { qubit: usize },
}

/// Control-flow flags consumed by the nearest enclosing loop (or, for
/// `returned`, by the enclosing subroutine call).
#[derive(Debug, Clone, Default)]
pub struct PathFlags {
    pub broke: bool,
    pub continuing: bool,
    pub returned: bool,
}

impl PathFlags {
    pub fn any(&self) -> bool {
        self.broke || self.continuing || self.returned
    }
}

/// One classical execution history: its own environment, measurement
/// record, committed instruction ledger, and bookkeeping flags.
#[derive(Debug, Clone)]
pub struct Path {
    pub id: PathId,
    pub active: bool,
    pub scopes: ScopeStack,
    /// Qualified qubit name (e.g. "q[0]") to the ordered outcomes
    /// observed on that qubit over this path's history.
    pub measurements: HashMap<String, Vec<u8>>,
    pub instructions: Vec<Instruction>,
    pub return_value: Option<crate::environment::value::Value>,
    pub flags: PathFlags,
    pub error: Option<RuntimeError>,
    /// Product of the Born probabilities of every branch taken.
    pub weight: f64,
}

impl Path {
    pub fn seed(id: PathId) -> Self {
        Self {
            id,
            active: true,
            scopes: ScopeStack::new(),
            measurements: HashMap::new(),
            instructions: Vec::new(),
            return_value: None,
            flags: PathFlags::default(),
            error: None,
            weight: 1.0,
        }
    }

    /// Clone this path into a fork child. The environment spine is shared
    /// copy-on-write at frame granularity; the ledger and measurement
    /// record are copied eagerly (both are append-only).
    pub fn fork(&self, child_id: PathId) -> Self {
        Self {
            id: child_id,
            active: self.active,
            scopes: self.scopes.clone(),
            measurements: self.measurements.clone(),
            instructions: self.instructions.clone(),
            return_value: self.return_value.clone(),
            flags: self.flags.clone(),
            error: None,
            weight: self.weight,
        }
    }

    pub fn record_measurement(&mut self, qubit_name: &str, qubit_index: usize, outcome: u8) {
        self.measurements
            .entry(qubit_name.to_string())
            .or_default()
            .push(outcome);
        self.instructions.push(Instruction::Measure { qubit: qubit_index, outcome });
    }

    pub fn terminate(&mut self) {
        self.active = false;
    }

    pub fn terminate_with(&mut self, error: RuntimeError) {
        self.active = false;
        self.error = Some(error);
    }
}
