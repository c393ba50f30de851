// src/lib.rs
// Branched execution engine for dynamic quantum circuits: an OpenQASM
// 3.0-style front end, an interpreter that forks an execution path per
// feasible measurement outcome, and a ledger-driven state-vector backend.

pub mod environment;
pub mod error;
pub mod evaluator;
pub mod lexer;
pub mod parser;
pub mod path;
pub mod quantum_backend;

pub use environment::value::{Value, ValueType};
pub use environment::{AliasTarget, FrameKind, ScopeStack};
pub use error::{EngineError, ErrorKind, ParseError, PathId, RuntimeError};
pub use evaluator::{
    evolve, evolve_with, run_source, sample_counts, BranchedResult, PathRecord,
};
pub use path::{Instruction, Modifier, Path};
pub use quantum_backend::{AmplitudeAdapter, NativeSimulator, QuantumBackend, EPSILON};
