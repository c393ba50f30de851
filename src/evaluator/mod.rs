// src/evaluator/mod.rs
pub mod gates;

use crate::environment::value::{
    apply_binary, apply_unary, bitstring_value, cast, coerce_assign, Value, ValueType,
};
use crate::environment::{AliasTarget, FrameKind, ScopeStack};
use crate::error::{EngineError, ErrorKind, PathId, RuntimeError};
use crate::lexer::Lexer;
use crate::parser::ast::*;
use crate::parser::Parser;
use crate::path::{Instruction, Modifier, Path};
use crate::quantum_backend::{AmplitudeAdapter, EPSILON};
use gates::{apply_numeric_builtin, builtin_gate_signature, canonical_gate_name};
use num_complex::Complex64;
use rand::Rng;
use serde::Serialize;
use std::collections::{BTreeMap, HashMap, HashSet};

/// Subroutine recursion cap; deeper recursion terminates the path.
pub const RECURSION_LIMIT: usize = 1024;

/// Gate inlining depth cap, catching mutually recursive gate bodies.
const GATE_INLINE_LIMIT: usize = 64;

#[derive(Debug, Clone)]
struct GateDefinition {
    params: Vec<String>,
    qubits: Vec<String>,
    body: Vec<Stmt>,
}

#[derive(Debug, Clone)]
struct FunctionDefinition {
    params: Vec<FuncParam>,
    return_ty: Option<TypeSpec>,
    body: Vec<Stmt>,
}

/// Flat, process-wide qubit numbering. Declarations append fresh indices;
/// the registry is shared by every path and never forks.
#[derive(Debug, Default)]
struct QubitRegistry {
    names: Vec<String>,
    registers: HashMap<String, (usize, usize)>,
}

impl QubitRegistry {
    /// Idempotent per register name: the same declaration visited on a
    /// second path reuses the indices it allocated on the first.
    fn declare(&mut self, name: &str, size: usize, singular: bool) -> Result<usize, ErrorKind> {
        if let Some(&(start, existing)) = self.registers.get(name) {
            if existing != size {
                return Err(ErrorKind::WidthMismatch(format!(
                    "qubit register '{}' redeclared with size {} (was {})",
                    name, size, existing
                )));
            }
            return Ok(start);
        }
        let start = self.names.len();
        for i in 0..size {
            if singular {
                self.names.push(name.to_string());
            } else {
                self.names.push(format!("{}[{}]", name, i));
            }
        }
        self.registers.insert(name.to_string(), (start, size));
        Ok(start)
    }

    fn count(&self) -> usize {
        self.names.len()
    }

    fn qualified(&self, index: usize) -> &str {
        &self.names[index]
    }
}

/// One path in the driver's result: classical environment snapshot,
/// measurement record, committed ledger, and the branch weight.
#[derive(Debug, Clone, Serialize)]
pub struct PathRecord {
    pub id: PathId,
    pub active: bool,
    #[serde(skip)]
    pub error: Option<RuntimeError>,
    pub classical: BTreeMap<String, Value>,
    pub measurements: BTreeMap<String, Vec<u8>>,
    pub instructions: Vec<Instruction>,
    pub weight: f64,
}

impl PathRecord {
    /// Last observed outcome on a qubit, if it was ever measured.
    pub fn last_outcome(&self, qubit_name: &str) -> Option<u8> {
        self.measurements.get(qubit_name).and_then(|v| v.last().copied())
    }
}

/// Final population of a branched run, in fork order.
#[derive(Debug, Clone, Serialize)]
pub struct BranchedResult {
    pub paths: Vec<PathRecord>,
    pub active_paths: Vec<PathId>,
    pub num_qubits: usize,
    /// Qualified qubit names in global-index order.
    pub qubit_names: Vec<String>,
}

impl BranchedResult {
    pub fn path(&self, id: PathId) -> Option<&PathRecord> {
        self.paths.iter().find(|p| p.id == id)
    }

    pub fn active_records(&self) -> impl Iterator<Item = &PathRecord> {
        self.paths.iter().filter(|p| p.active)
    }

    /// Materialize the amplitude vector of one path through the adapter.
    pub fn state_vector(
        &self,
        id: PathId,
        adapter: &AmplitudeAdapter,
    ) -> Result<Vec<Complex64>, RuntimeError> {
        let record = self
            .path(id)
            .ok_or_else(|| RuntimeError::new(ErrorKind::Type(format!("no path {}", id))))?;
        adapter
            .state_vector(&record.instructions, self.num_qubits)
            .map_err(|kind| RuntimeError::new(kind).on_path(id))
    }
}

/// Draw `shots` paths by branch weight and tally outcome bitstrings, one
/// character per measured qubit in global-index order.
pub fn sample_counts<R: Rng>(
    result: &BranchedResult,
    shots: u32,
    rng: &mut R,
) -> HashMap<String, u32> {
    let records: Vec<&PathRecord> = result.active_records().collect();
    let total: f64 = records.iter().map(|r| r.weight).sum();
    let mut counts: HashMap<String, u32> = HashMap::new();
    if records.is_empty() || total <= 0.0 {
        return counts;
    }
    for _ in 0..shots {
        let mut x = rng.gen::<f64>() * total;
        let mut chosen = records[records.len() - 1];
        for &r in &records {
            x -= r.weight;
            if x <= 0.0 {
                chosen = r;
                break;
            }
        }
        let bitstring: String = result
            .qubit_names
            .iter()
            .filter_map(|name| chosen.last_outcome(name))
            .map(|bit| if bit == 0 { '0' } else { '1' })
            .collect();
        *counts.entry(bitstring).or_insert(0) += 1;
    }
    counts
}

/// Parse source text and run it through the branched interpreter.
pub fn run_source(
    source: &str,
    inputs: &HashMap<String, Value>,
) -> Result<BranchedResult, EngineError> {
    let tokens = Lexer::new(source).tokenize()?;
    let program = Parser::new(tokens).parse()?;
    Ok(evolve(&program, inputs)?)
}

/// Interpret a program over a branching population of paths, using the
/// bundled dense state-vector engine for measurement probabilities.
pub fn evolve(
    program: &Program,
    inputs: &HashMap<String, Value>,
) -> Result<BranchedResult, RuntimeError> {
    evolve_with(program, inputs, AmplitudeAdapter::default())
}

/// Same as [`evolve`] with a caller-supplied amplitude engine.
pub fn evolve_with(
    program: &Program,
    inputs: &HashMap<String, Value>,
    adapter: AmplitudeAdapter,
) -> Result<BranchedResult, RuntimeError> {
    let mut evaluator = Evaluator::new(adapter, inputs.clone());
    evaluator.run(program)
}

type Evaluated = Vec<(PathId, Value)>;

pub struct Evaluator {
    paths: Vec<Path>,
    /// Population order; fork children sit immediately after their parent.
    order: Vec<PathId>,
    registry: QubitRegistry,
    gate_defs: HashMap<String, GateDefinition>,
    func_defs: HashMap<String, FunctionDefinition>,
    adapter: AmplitudeAdapter,
    inputs: HashMap<String, Value>,
    call_depth: usize,
}

impl Evaluator {
    fn new(adapter: AmplitudeAdapter, inputs: HashMap<String, Value>) -> Self {
        Self {
            paths: Vec::new(),
            order: Vec::new(),
            registry: QubitRegistry::default(),
            gate_defs: HashMap::new(),
            func_defs: HashMap::new(),
            adapter,
            inputs,
            call_depth: 0,
        }
    }

    fn run(&mut self, program: &Program) -> Result<BranchedResult, RuntimeError> {
        self.paths.push(Path::seed(0));
        self.order.push(0);

        let finished = self.exec_block(&program.statements, vec![0])?;
        for id in finished {
            // A `return` at top level is normal completion.
            self.paths[id].flags = Default::default();
        }

        let paths: Vec<PathRecord> = self
            .order
            .iter()
            .map(|&id| {
                let p = &self.paths[id];
                PathRecord {
                    id: p.id,
                    active: p.active,
                    error: p.error.clone(),
                    classical: p.scopes.global_snapshot(),
                    measurements: p.measurements.iter().map(|(k, v)| (k.clone(), v.clone())).collect(),
                    instructions: p.instructions.clone(),
                    weight: p.weight,
                }
            })
            .collect();
        let active_paths = self
            .order
            .iter()
            .copied()
            .filter(|&id| self.paths[id].active)
            .collect();
        Ok(BranchedResult {
            paths,
            active_paths,
            num_qubits: self.registry.count(),
            qubit_names: self.registry.names.clone(),
        })
    }

    // ---- Population plumbing ----

    /// Restore population order over an arbitrary subset of path ids.
    fn reorder(&self, set: Vec<PathId>) -> Vec<PathId> {
        if set.len() <= 1 {
            return set;
        }
        let members: HashSet<PathId> = set.into_iter().collect();
        self.order.iter().copied().filter(|id| members.contains(id)).collect()
    }

    /// Terminate a path with a path-fatal error, or unwind the run for a
    /// run-fatal one.
    fn fail(&mut self, id: PathId, kind: ErrorKind, loc: Loc) -> Result<(), RuntimeError> {
        let err = RuntimeError::at(kind, loc).on_path(id);
        if err.is_run_fatal() {
            return Err(err);
        }
        self.paths[id].terminate_with(err);
        Ok(())
    }

    // ---- Statement execution ----

    fn exec_block(&mut self, stmts: &[Stmt], live: Vec<PathId>) -> Result<Vec<PathId>, RuntimeError> {
        let mut flowing = live;
        let mut suspended: Vec<PathId> = Vec::new();
        for stmt in stmts {
            if flowing.is_empty() {
                break;
            }
            let after = self.exec_stmt(stmt, flowing)?;
            flowing = Vec::new();
            for id in after {
                if self.paths[id].flags.any() {
                    suspended.push(id);
                } else {
                    flowing.push(id);
                }
            }
        }
        flowing.extend(suspended);
        Ok(self.reorder(flowing))
    }

    /// Run a block inside a fresh frame of the given kind on every path.
    fn exec_scoped(
        &mut self,
        kind: FrameKind,
        stmts: &[Stmt],
        live: Vec<PathId>,
    ) -> Result<Vec<PathId>, RuntimeError> {
        for &id in &live {
            self.paths[id].scopes.enter(kind);
        }
        let out = self.exec_block(stmts, live)?;
        for &id in &out {
            self.paths[id].scopes.leave();
        }
        Ok(out)
    }

    fn exec_stmt(&mut self, stmt: &Stmt, live: Vec<PathId>) -> Result<Vec<PathId>, RuntimeError> {
        match stmt {
            Stmt::Include { .. } => Ok(live),
            Stmt::QubitDecl { name, size, loc } => self.exec_qubit_decl(name, size, *loc, live),
            Stmt::ClassicalDecl { ty, name, mutability, init, loc } => {
                self.exec_classical_decl(ty, name, *mutability, init, *loc, live)
            }
            Stmt::AliasDecl { name, target, loc } => self.exec_alias_decl(name, target, *loc, live),
            Stmt::Assign { target, op, value, loc } => {
                self.exec_assign(target, *op, value, *loc, live)
            }
            Stmt::MeasureAssign { target, qubit, loc } => {
                self.exec_measure(Some(target), qubit, *loc, live)
            }
            Stmt::MeasureStmt { qubit, loc } => self.exec_measure(None, qubit, *loc, live),
            Stmt::Reset { qubit, loc } => self.exec_reset(qubit, *loc, live),
            Stmt::GateCall { modifiers, name, params, qubits, loc } => {
                self.exec_gate_call(modifiers, name, params, qubits, *loc, live)
            }
            Stmt::GateDef { name, params, qubits, body, loc } => {
                self.exec_gate_def(name, params, qubits, body, *loc, live)
            }
            Stmt::FuncDef { name, params, return_ty, body, loc } => {
                self.exec_func_def(name, params, return_ty, body, *loc, live)
            }
            Stmt::Return { value, loc: _ } => self.exec_return(value, live),
            Stmt::If { cond, then_body, else_body, loc: _ } => {
                let (t, f) = self.partition_by_cond(cond, live)?;
                let t_out = self.exec_scoped(FrameKind::If, then_body, t)?;
                let f_out = match else_body {
                    Some(body) => self.exec_scoped(FrameKind::Else, body, f)?,
                    None => f,
                };
                let mut out = t_out;
                out.extend(f_out);
                Ok(self.reorder(out))
            }
            Stmt::While { cond, body, loc: _ } => self.exec_while(cond, body, live),
            Stmt::ForRange { var_ty, var, iterable, body, loc } => {
                self.exec_for(var_ty, var, iterable, body, *loc, live)
            }
            Stmt::Switch { selector, cases, default, loc } => {
                self.exec_switch(selector, cases, default, *loc, live)
            }
            Stmt::Break { .. } => {
                for &id in &live {
                    self.paths[id].flags.broke = true;
                }
                Ok(live)
            }
            Stmt::Continue { .. } => {
                for &id in &live {
                    self.paths[id].flags.continuing = true;
                }
                Ok(live)
            }
            Stmt::Block { body, loc: _ } => self.exec_scoped(FrameKind::Block, body, live),
            Stmt::ExprStmt { expr, loc: _ } => self.exec_expr_stmt(expr, live),
        }
    }

    fn exec_qubit_decl(
        &mut self,
        name: &str,
        size: &Option<Expr>,
        loc: Loc,
        live: Vec<PathId>,
    ) -> Result<Vec<PathId>, RuntimeError> {
        let mut out = Vec::new();
        for id in live {
            let (count, singular) = match size {
                Some(expr) => match self.eval_single(expr, id)? {
                    Some(v) => match v.as_index() {
                        Ok(n) if n > 0 => (n as usize, false),
                        Ok(n) => {
                            self.fail(
                                id,
                                ErrorKind::Type(format!("qubit register size must be positive, got {}", n)),
                                loc,
                            )?;
                            continue;
                        }
                        Err(kind) => {
                            self.fail(id, kind, loc)?;
                            continue;
                        }
                    },
                    None => continue,
                },
                None => (1, true),
            };
            let start = match self.registry.declare(name, count, singular) {
                Ok(start) => start,
                Err(kind) => {
                    self.fail(id, kind, loc)?;
                    continue;
                }
            };
            let (ty, value) = if singular {
                (ValueType::Qubit, Value::QubitRef(start))
            } else {
                (
                    ValueType::QubitArray(count),
                    Value::QubitArray((start..start + count).collect()),
                )
            };
            match self.paths[id].scopes.declare(name, ty, Mutability::Const, value) {
                Ok(()) => out.push(id),
                Err(kind) => self.fail(id, kind, loc)?,
            }
        }
        Ok(self.reorder(out))
    }

    fn exec_classical_decl(
        &mut self,
        ty: &TypeSpec,
        name: &str,
        mutability: Mutability,
        init: &Option<Expr>,
        loc: Loc,
        live: Vec<PathId>,
    ) -> Result<Vec<PathId>, RuntimeError> {
        let mut out = Vec::new();
        for id in live {
            let Some(resolved) = self.resolve_type_spec(ty, id, loc)? else { continue };

            // Input variables bind from the externally supplied map; the
            // initializer, if any, is only a default.
            if mutability == Mutability::Input {
                let supplied = self.inputs.get(name).cloned();
                let value = match supplied {
                    Some(v) => v,
                    None => match init {
                        Some(expr) => match self.eval_single(expr, id)? {
                            Some(v) => v,
                            None => continue,
                        },
                        None => {
                            return Err(RuntimeError::at(
                                ErrorKind::MissingInput(name.to_string()),
                                loc,
                            )
                            .on_path(id));
                        }
                    },
                };
                let coerced = match coerce_assign(&resolved, &value) {
                    Ok(v) => v,
                    Err(kind) => {
                        self.fail(id, kind, loc)?;
                        continue;
                    }
                };
                match self.paths[id].scopes.declare(name, resolved, mutability, coerced) {
                    Ok(()) => out.push(id),
                    Err(kind) => self.fail(id, kind, loc)?,
                }
                continue;
            }

            if mutability == Mutability::Const && init.is_none() {
                self.fail(
                    id,
                    ErrorKind::Type(format!("const '{}' needs an initializer", name)),
                    loc,
                )?;
                continue;
            }

            let initials: Evaluated = match init {
                Some(expr) => self.eval_expr(expr, id)?,
                None => vec![(id, default_value(&resolved))],
            };
            for (pid, value) in initials {
                let coerced = match coerce_assign(&resolved, &value) {
                    Ok(v) => v,
                    Err(kind) => {
                        self.fail(pid, kind, loc)?;
                        continue;
                    }
                };
                match self.paths[pid].scopes.declare(name, resolved.clone(), mutability, coerced) {
                    Ok(()) => out.push(pid),
                    Err(kind) => self.fail(pid, kind, loc)?,
                }
            }
        }
        Ok(self.reorder(out))
    }

    fn exec_alias_decl(
        &mut self,
        name: &str,
        target: &Expr,
        loc: Loc,
        live: Vec<PathId>,
    ) -> Result<Vec<PathId>, RuntimeError> {
        let mut out = Vec::new();
        for id in live {
            let Some(resolved) = self.alias_target(target, id, loc)? else { continue };
            match self.paths[id].scopes.declare_alias(name, resolved) {
                Ok(()) => out.push(id),
                Err(kind) => self.fail(id, kind, loc)?,
            }
        }
        Ok(self.reorder(out))
    }

    /// Resolve a `let` target into an alias binding: qubit collections
    /// (possibly sliced or concatenated), or a whole classical variable.
    fn alias_target(
        &mut self,
        expr: &Expr,
        id: PathId,
        loc: Loc,
    ) -> Result<Option<AliasTarget>, RuntimeError> {
        if let Expr::Ident { name, .. } = expr {
            match self.paths[id].scopes.lookup(name) {
                Ok(Value::QubitRef(i)) => return Ok(Some(AliasTarget::Qubits(vec![i]))),
                Ok(Value::QubitArray(is)) => return Ok(Some(AliasTarget::Qubits(is))),
                Ok(_) => return Ok(Some(AliasTarget::Classical(name.clone()))),
                Err(kind) => {
                    self.fail(id, kind, loc)?;
                    return Ok(None);
                }
            }
        }
        if let Expr::Binary { op: BinaryOp::Concat, lhs, rhs, .. } = expr {
            let Some(left) = self.alias_target(lhs, id, loc)? else { return Ok(None) };
            let Some(right) = self.alias_target(rhs, id, loc)? else { return Ok(None) };
            match (left, right) {
                (AliasTarget::Qubits(mut a), AliasTarget::Qubits(b)) => {
                    a.extend(b);
                    return Ok(Some(AliasTarget::Qubits(a)));
                }
                _ => {
                    self.fail(
                        id,
                        ErrorKind::Type("'++' concatenates qubit collections".to_string()),
                        loc,
                    )?;
                    return Ok(None);
                }
            }
        }
        // Anything else must evaluate to qubits (e.g. a register slice).
        match self.eval_single(expr, id)? {
            Some(Value::QubitRef(i)) => Ok(Some(AliasTarget::Qubits(vec![i]))),
            Some(Value::QubitArray(is)) => Ok(Some(AliasTarget::Qubits(is))),
            Some(other) => {
                self.fail(
                    id,
                    ErrorKind::Type(format!(
                        "alias target must be qubits or a named variable, got {}",
                        other.type_name()
                    )),
                    loc,
                )?;
                Ok(None)
            }
            None => Ok(None),
        }
    }

    fn exec_assign(
        &mut self,
        target: &Expr,
        op: AssignOp,
        value: &Expr,
        loc: Loc,
        live: Vec<PathId>,
    ) -> Result<Vec<PathId>, RuntimeError> {
        let mut out = Vec::new();
        for id in live {
            for (pid, rhs) in self.eval_expr(value, id)? {
                let applied = if op == AssignOp::Set {
                    rhs
                } else {
                    let current = match self.read_target(target, pid)? {
                        Some(v) => v,
                        None => continue,
                    };
                    match apply_binary(compound_op(op), &current, &rhs) {
                        Ok(v) => v,
                        Err(kind) => {
                            self.fail(pid, kind, loc)?;
                            continue;
                        }
                    }
                };
                if self.assign_target(target, applied, pid, loc)? {
                    out.push(pid);
                }
            }
        }
        Ok(self.reorder(out))
    }

    fn read_target(
        &mut self,
        target: &Expr,
        id: PathId,
    ) -> Result<Option<Value>, RuntimeError> {
        self.eval_single(target, id)
    }

    /// Write into an assignment target: a bare name, or one level of
    /// indexing into a bit register or array.
    fn assign_target(
        &mut self,
        target: &Expr,
        value: Value,
        id: PathId,
        loc: Loc,
    ) -> Result<bool, RuntimeError> {
        match target {
            Expr::Ident { name, .. } => {
                match self.paths[id].scopes.assign(name, value) {
                    Ok(()) => Ok(true),
                    Err(kind) => {
                        self.fail(id, kind, loc)?;
                        Ok(false)
                    }
                }
            }
            Expr::Index { base, index, loc: iloc } => {
                let Expr::Ident { name, .. } = base.as_ref() else {
                    self.fail(
                        id,
                        ErrorKind::Type("only one level of indexing is assignable".to_string()),
                        *iloc,
                    )?;
                    return Ok(false);
                };
                let Some(index_value) = self.eval_single(index, id)? else { return Ok(false) };
                let i = match index_value.as_index() {
                    Ok(i) => i,
                    Err(kind) => {
                        self.fail(id, kind, *iloc)?;
                        return Ok(false);
                    }
                };
                let (_, _, current) = match self.paths[id].scopes.lookup_var(name) {
                    Ok(v) => v,
                    Err(kind) => {
                        self.fail(id, kind, *iloc)?;
                        return Ok(false);
                    }
                };
                let updated = match set_element(current, i, value) {
                    Ok(v) => v,
                    Err(kind) => {
                        self.fail(id, kind, *iloc)?;
                        return Ok(false);
                    }
                };
                match self.paths[id].scopes.assign(name, updated) {
                    Ok(()) => Ok(true),
                    Err(kind) => {
                        self.fail(id, kind, loc)?;
                        Ok(false)
                    }
                }
            }
            other => {
                self.fail(
                    id,
                    ErrorKind::Type("invalid assignment target".to_string()),
                    other.loc(),
                )?;
                Ok(false)
            }
        }
    }

    // ---- Measurement ----

    fn exec_measure(
        &mut self,
        target: Option<&Expr>,
        qubit: &Expr,
        loc: Loc,
        live: Vec<PathId>,
    ) -> Result<Vec<PathId>, RuntimeError> {
        let mut out = Vec::new();
        for id in live {
            let Some(qubits) = self.qubit_operand(qubit, id, loc)? else { continue };

            // Measure the operand's qubits in order; each indeterminate
            // qubit splits every pending branch in two.
            let mut work: Vec<(PathId, u64)> = vec![(id, 0)];
            for (bit_pos, &q) in qubits.iter().enumerate() {
                let mut next = Vec::new();
                for (pid, acc) in work {
                    for (branch, outcome) in self.measure_one(pid, q, loc)? {
                        next.push((branch, acc | ((outcome as u64) << bit_pos)));
                    }
                }
                work = next;
            }

            for (pid, bits) in work {
                match target {
                    Some(t) => {
                        let value = if qubits.len() == 1 {
                            Value::Bit(bits as u8)
                        } else {
                            Value::BitRegister { width: qubits.len(), bits }
                        };
                        if self.assign_target(t, value, pid, loc)? {
                            out.push(pid);
                        }
                    }
                    None => out.push(pid),
                }
            }
        }
        Ok(self.reorder(out))
    }

    /// Measure one qubit on one path. Deterministic outcomes record and
    /// continue; indeterminate ones fork, with the 0-child keeping the
    /// parent's population slot and the 1-child inserted right after it.
    fn measure_one(
        &mut self,
        id: PathId,
        qubit: usize,
        loc: Loc,
    ) -> Result<Vec<(PathId, u8)>, RuntimeError> {
        let num_qubits = self.registry.count();
        let p1 = match self
            .adapter
            .probability_of_one(&self.paths[id].instructions, num_qubits, qubit)
        {
            Ok(p) => p,
            Err(kind) => {
                self.fail(id, kind, loc)?;
                return Ok(vec![]);
            }
        };
        let name = self.registry.qualified(qubit).to_string();

        if p1 <= EPSILON {
            self.paths[id].weight *= 1.0 - p1;
            self.paths[id].record_measurement(&name, qubit, 0);
            Ok(vec![(id, 0)])
        } else if p1 >= 1.0 - EPSILON {
            self.paths[id].weight *= p1;
            self.paths[id].record_measurement(&name, qubit, 1);
            Ok(vec![(id, 1)])
        } else {
            let child_id = self.paths.len();
            let mut child = self.paths[id].fork(child_id);
            self.paths[id].weight *= 1.0 - p1;
            self.paths[id].record_measurement(&name, qubit, 0);
            child.weight *= p1;
            child.record_measurement(&name, qubit, 1);
            self.paths.push(child);
            let slot = self
                .order
                .iter()
                .position(|&x| x == id)
                .expect("forking path is always in the population order");
            self.order.insert(slot + 1, child_id);
            Ok(vec![(id, 0), (child_id, 1)])
        }
    }

    fn exec_reset(
        &mut self,
        qubit: &Expr,
        loc: Loc,
        live: Vec<PathId>,
    ) -> Result<Vec<PathId>, RuntimeError> {
        let mut out = Vec::new();
        for id in live {
            let Some(qubits) = self.qubit_operand(qubit, id, loc)? else { continue };
            for q in qubits {
                self.paths[id].instructions.push(Instruction::Reset { qubit: q });
            }
            out.push(id);
        }
        Ok(self.reorder(out))
    }

    /// Evaluate an operand naming one or more qubits.
    fn qubit_operand(
        &mut self,
        expr: &Expr,
        id: PathId,
        loc: Loc,
    ) -> Result<Option<Vec<usize>>, RuntimeError> {
        match self.eval_single(expr, id)? {
            Some(Value::QubitRef(i)) => Ok(Some(vec![i])),
            Some(Value::QubitArray(is)) => Ok(Some(is)),
            Some(other) => {
                self.fail(
                    id,
                    ErrorKind::Type(format!("expected qubits, got {}", other.type_name())),
                    loc,
                )?;
                Ok(None)
            }
            None => Ok(None),
        }
    }

    // ---- Gates ----

    fn exec_gate_def(
        &mut self,
        name: &str,
        params: &[String],
        qubits: &[String],
        body: &[Stmt],
        loc: Loc,
        live: Vec<PathId>,
    ) -> Result<Vec<PathId>, RuntimeError> {
        let check = || -> Result<(), ErrorKind> {
            if builtin_gate_signature(name).is_some() {
                return Err(ErrorKind::Redeclaration(format!(
                    "gate '{}' shadows a built-in gate",
                    name
                )));
            }
            for stmt in body {
                match stmt {
                    Stmt::GateCall { name: callee, .. } => {
                        // A gate body may not mention its own name.
                        if callee == name {
                            return Err(ErrorKind::Type(format!(
                                "gate '{}' may not reference itself",
                                name
                            )));
                        }
                    }
                    _ => {
                        return Err(ErrorKind::Type(
                            "gate bodies may contain only gate applications".to_string(),
                        ));
                    }
                }
            }
            Ok(())
        };

        if let Err(kind) = check() {
            for id in live {
                self.fail(id, kind.clone(), loc)?;
            }
            return Ok(vec![]);
        }

        let def = GateDefinition {
            params: params.to_vec(),
            qubits: qubits.to_vec(),
            body: body.to_vec(),
        };
        if let Some(existing) = self.gate_defs.get(name) {
            // The same definition statement revisited on another path is
            // fine; a genuinely different redefinition is not.
            if existing.body != def.body
                || existing.params != def.params
                || existing.qubits != def.qubits
            {
                for id in live {
                    self.fail(id, ErrorKind::Redeclaration(name.to_string()), loc)?;
                }
                return Ok(vec![]);
            }
            return Ok(live);
        }
        self.gate_defs.insert(name.to_string(), def);
        Ok(live)
    }

    fn exec_func_def(
        &mut self,
        name: &str,
        params: &[FuncParam],
        return_ty: &Option<TypeSpec>,
        body: &[Stmt],
        loc: Loc,
        live: Vec<PathId>,
    ) -> Result<Vec<PathId>, RuntimeError> {
        let def = FunctionDefinition {
            params: params.to_vec(),
            return_ty: return_ty.clone(),
            body: body.to_vec(),
        };
        if let Some(existing) = self.func_defs.get(name) {
            if existing.body != def.body || existing.params != def.params {
                for id in live {
                    self.fail(id, ErrorKind::Redeclaration(name.to_string()), loc)?;
                }
                return Ok(vec![]);
            }
            return Ok(live);
        }
        self.func_defs.insert(name.to_string(), def);
        Ok(live)
    }

    fn exec_gate_call(
        &mut self,
        modifiers: &[GateModifier],
        name: &str,
        params: &[Expr],
        qubits: &[Expr],
        loc: Loc,
        live: Vec<PathId>,
    ) -> Result<Vec<PathId>, RuntimeError> {
        let mut out = Vec::new();
        for id in live {
            let Some(mods) = self.resolve_modifiers(modifiers, id, loc)? else { continue };

            for (pid, param_values) in self.eval_seq(params, id)? {
                let mut param_floats = Vec::with_capacity(param_values.len());
                let mut bad = false;
                for v in &param_values {
                    match gate_param(v) {
                        Ok(f) => param_floats.push(f),
                        Err(kind) => {
                            self.fail(pid, kind, loc)?;
                            bad = true;
                            break;
                        }
                    }
                }
                if bad {
                    continue;
                }

                let mut targets = Vec::with_capacity(qubits.len());
                let mut dead = false;
                for operand in qubits {
                    match self.single_qubit_operand(operand, pid, loc)? {
                        Some(q) => targets.push(q),
                        None => {
                            dead = true;
                            break;
                        }
                    }
                }
                if dead {
                    continue;
                }

                if self.apply_gate(pid, name, mods.clone(), targets, param_floats, 0, loc)? {
                    out.push(pid);
                }
            }
        }
        Ok(self.reorder(out))
    }

    fn single_qubit_operand(
        &mut self,
        expr: &Expr,
        id: PathId,
        loc: Loc,
    ) -> Result<Option<usize>, RuntimeError> {
        match self.eval_single(expr, id)? {
            Some(Value::QubitRef(i)) => Ok(Some(i)),
            Some(Value::QubitArray(is)) if is.len() == 1 => Ok(Some(is[0])),
            Some(other) => {
                self.fail(
                    id,
                    ErrorKind::Type(format!(
                        "gate operands must be single qubits, got {}",
                        other.type_name()
                    )),
                    loc,
                )?;
                Ok(None)
            }
            None => Ok(None),
        }
    }

    fn resolve_modifiers(
        &mut self,
        modifiers: &[GateModifier],
        id: PathId,
        loc: Loc,
    ) -> Result<Option<Vec<Modifier>>, RuntimeError> {
        let mut out = Vec::with_capacity(modifiers.len());
        for m in modifiers {
            match m {
                GateModifier::Inv => out.push(Modifier::Inv),
                GateModifier::Pow(expr) => {
                    let Some(v) = self.eval_single(expr, id)? else { return Ok(None) };
                    match v.as_float() {
                        Ok(x) => out.push(Modifier::Pow(x)),
                        Err(kind) => {
                            self.fail(id, kind, loc)?;
                            return Ok(None);
                        }
                    }
                }
                GateModifier::Ctrl(count) | GateModifier::NegCtrl(count) => {
                    let k = match count {
                        None => 1,
                        Some(expr) => {
                            let Some(v) = self.eval_single(expr, id)? else { return Ok(None) };
                            match v.as_index() {
                                Ok(k) if k >= 1 => k as usize,
                                Ok(k) => {
                                    self.fail(
                                        id,
                                        ErrorKind::Type(format!(
                                            "control count must be at least 1, got {}",
                                            k
                                        )),
                                        loc,
                                    )?;
                                    return Ok(None);
                                }
                                Err(kind) => {
                                    self.fail(id, kind, loc)?;
                                    return Ok(None);
                                }
                            }
                        }
                    };
                    if matches!(m, GateModifier::Ctrl(_)) {
                        out.push(Modifier::Ctrl(k));
                    } else {
                        out.push(Modifier::NegCtrl(k));
                    }
                }
            }
        }
        Ok(Some(out))
    }

    /// Apply a (possibly modified) gate on one path: emit a ledger record
    /// for built-ins, or inline a user gate body, folding the modifier
    /// stack into every emitted instruction.
    fn apply_gate(
        &mut self,
        id: PathId,
        name: &str,
        full_mods: Vec<Modifier>,
        full_targets: Vec<usize>,
        params: Vec<f64>,
        depth: usize,
        loc: Loc,
    ) -> Result<bool, RuntimeError> {
        let n_ctrl: usize = full_mods
            .iter()
            .map(|m| match m {
                Modifier::Ctrl(k) | Modifier::NegCtrl(k) => *k,
                _ => 0,
            })
            .sum();
        if full_targets.len() < n_ctrl {
            self.fail(
                id,
                ErrorKind::ArityMismatch(format!(
                    "modifiers of '{}' need {} control qubits, got {} operands",
                    name,
                    n_ctrl,
                    full_targets.len()
                )),
                loc,
            )?;
            return Ok(false);
        }

        if let Some(def) = self.gate_defs.get(name).cloned() {
            if depth >= GATE_INLINE_LIMIT {
                self.fail(
                    id,
                    ErrorKind::Type(format!("gate '{}' expands too deeply", name)),
                    loc,
                )?;
                return Ok(false);
            }
            let core = &full_targets[n_ctrl..];
            if core.len() != def.qubits.len() {
                self.fail(
                    id,
                    ErrorKind::ArityMismatch(format!(
                        "gate '{}' expects {} qubits, got {}",
                        name,
                        def.qubits.len(),
                        core.len()
                    )),
                    loc,
                )?;
                return Ok(false);
            }
            if params.len() != def.params.len() {
                self.fail(
                    id,
                    ErrorKind::ArityMismatch(format!(
                        "gate '{}' expects {} parameters, got {}",
                        name,
                        def.params.len(),
                        params.len()
                    )),
                    loc,
                )?;
                return Ok(false);
            }

            self.paths[id].scopes.enter(FrameKind::Gate);
            for (pname, &value) in def.params.iter().zip(params.iter()) {
                if let Err(kind) = self.paths[id].scopes.declare(
                    pname,
                    ValueType::Angle,
                    Mutability::Const,
                    Value::Angle(value),
                ) {
                    self.fail(id, kind, loc)?;
                    return Ok(false);
                }
            }
            for (qname, &q) in def.qubits.iter().zip(core.iter()) {
                if let Err(kind) = self.paths[id].scopes.declare(
                    qname,
                    ValueType::Qubit,
                    Mutability::Const,
                    Value::QubitRef(q),
                ) {
                    self.fail(id, kind, loc)?;
                    return Ok(false);
                }
            }

            let ctx_ctrls = &full_targets[..n_ctrl];
            for stmt in &def.body {
                let Stmt::GateCall { modifiers, name: inner, params: iparams, qubits: iqubits, loc: iloc } = stmt
                else {
                    unreachable!("gate bodies are validated at definition");
                };
                let Some(inner_mods) = self.resolve_modifiers(modifiers, id, *iloc)? else {
                    return Ok(false);
                };
                let mut inner_params = Vec::with_capacity(iparams.len());
                for p in iparams {
                    let Some(v) = self.eval_single(p, id)? else { return Ok(false) };
                    match gate_param(&v) {
                        Ok(f) => inner_params.push(f),
                        Err(kind) => {
                            self.fail(id, kind, *iloc)?;
                            return Ok(false);
                        }
                    }
                }
                let mut inner_targets: Vec<usize> = ctx_ctrls.to_vec();
                for operand in iqubits {
                    match self.single_qubit_operand(operand, id, *iloc)? {
                        Some(q) => inner_targets.push(q),
                        None => return Ok(false),
                    }
                }
                let mut child_mods = full_mods.clone();
                child_mods.extend(inner_mods);
                if !self.apply_gate(id, inner, child_mods, inner_targets, inner_params, depth + 1, *iloc)? {
                    return Ok(false);
                }
            }
            self.paths[id].scopes.leave();
            return Ok(true);
        }

        let canonical = canonical_gate_name(name).to_string();
        let Some(sig) = builtin_gate_signature(&canonical) else {
            self.fail(id, ErrorKind::UnresolvedIdentifier(name.to_string()), loc)?;
            return Ok(false);
        };
        if full_targets.len() != n_ctrl + sig.qubits {
            self.fail(
                id,
                ErrorKind::ArityMismatch(format!(
                    "gate '{}' with its modifiers expects {} qubits, got {}",
                    name,
                    n_ctrl + sig.qubits,
                    full_targets.len()
                )),
                loc,
            )?;
            return Ok(false);
        }
        if params.len() != sig.params {
            self.fail(
                id,
                ErrorKind::ArityMismatch(format!(
                    "gate '{}' expects {} parameters, got {}",
                    name,
                    sig.params,
                    params.len()
                )),
                loc,
            )?;
            return Ok(false);
        }
        for (i, &q) in full_targets.iter().enumerate() {
            if full_targets[i + 1..].contains(&q) {
                self.fail(
                    id,
                    ErrorKind::QubitReuse(format!(
                        "gate '{}' targets {} twice",
                        name,
                        self.registry.qualified(q)
                    )),
                    loc,
                )?;
                return Ok(false);
            }
        }
        self.paths[id].instructions.push(Instruction::Gate {
            gate: canonical,
            targets: full_targets,
            parameters: params,
            modifiers: full_mods,
        });
        Ok(true)
    }

    // ---- Control flow ----

    fn partition_by_cond(
        &mut self,
        cond: &Expr,
        live: Vec<PathId>,
    ) -> Result<(Vec<PathId>, Vec<PathId>), RuntimeError> {
        let mut t = Vec::new();
        let mut f = Vec::new();
        for id in live {
            for (pid, value) in self.eval_expr(cond, id)? {
                match value.truthy() {
                    Ok(true) => t.push(pid),
                    Ok(false) => f.push(pid),
                    Err(kind) => self.fail(pid, kind, cond.loc())?,
                }
            }
        }
        Ok((self.reorder(t), self.reorder(f)))
    }

    fn exec_while(
        &mut self,
        cond: &Expr,
        body: &[Stmt],
        live: Vec<PathId>,
    ) -> Result<Vec<PathId>, RuntimeError> {
        let mut exited = Vec::new();
        let mut looping = live;
        loop {
            if looping.is_empty() {
                break;
            }
            let (t, f) = self.partition_by_cond(cond, looping)?;
            exited.extend(f);
            if t.is_empty() {
                break;
            }
            let after = self.exec_scoped(FrameKind::While, body, t)?;
            let mut next = Vec::new();
            for id in after {
                let flags = &mut self.paths[id].flags;
                if flags.returned {
                    exited.push(id);
                } else if flags.broke {
                    flags.broke = false;
                    exited.push(id);
                } else {
                    flags.continuing = false;
                    next.push(id);
                }
            }
            looping = next;
        }
        Ok(self.reorder(exited))
    }

    fn exec_for(
        &mut self,
        var_ty: &TypeSpec,
        var: &str,
        iterable: &Expr,
        body: &[Stmt],
        loc: Loc,
        live: Vec<PathId>,
    ) -> Result<Vec<PathId>, RuntimeError> {
        // Iteration sequences are evaluated per path; paths with the same
        // sequence advance together so forks stay population-ordered.
        let mut groups: Vec<(Vec<Value>, Vec<PathId>)> = Vec::new();
        for id in live {
            let Some(seq) = self.iteration_values(iterable, id, loc)? else { continue };
            match groups.iter_mut().find(|(s, _)| *s == seq) {
                Some((_, members)) => members.push(id),
                None => groups.push((seq, vec![id])),
            }
        }

        let mut out = Vec::new();
        for (seq, members) in groups {
            let mut current = members;
            let mut done = Vec::new();
            for item in &seq {
                if current.is_empty() {
                    break;
                }
                // Fresh iteration frame with the loop variable bound.
                let mut entered = Vec::new();
                for id in current {
                    let Some(resolved) = self.resolve_type_spec(var_ty, id, loc)? else { continue };
                    let coerced = match coerce_assign(&resolved, item) {
                        Ok(v) => v,
                        Err(kind) => {
                            self.fail(id, kind, loc)?;
                            continue;
                        }
                    };
                    self.paths[id].scopes.enter(FrameKind::ForIter);
                    match self.paths[id].scopes.declare(var, resolved, Mutability::Mutable, coerced)
                    {
                        Ok(()) => entered.push(id),
                        Err(kind) => {
                            self.paths[id].scopes.leave();
                            self.fail(id, kind, loc)?;
                        }
                    }
                }
                let after = self.exec_block(body, entered)?;
                let mut next = Vec::new();
                for id in after {
                    self.paths[id].scopes.leave();
                    let flags = &mut self.paths[id].flags;
                    if flags.returned {
                        done.push(id);
                    } else if flags.broke {
                        flags.broke = false;
                        done.push(id);
                    } else {
                        flags.continuing = false;
                        next.push(id);
                    }
                }
                current = next;
            }
            done.extend(current);
            out.extend(done);
        }
        Ok(self.reorder(out))
    }

    fn iteration_values(
        &mut self,
        iterable: &Expr,
        id: PathId,
        loc: Loc,
    ) -> Result<Option<Vec<Value>>, RuntimeError> {
        if let Expr::Range { start, step, end, .. } = iterable {
            let Some(indices) = self.range_indices(start, step.as_deref(), end, id, loc)? else {
                return Ok(None);
            };
            return Ok(Some(indices.into_iter().map(Value::int).collect()));
        }
        match self.eval_single(iterable, id)? {
            Some(Value::Array { values, .. }) => Ok(Some(values)),
            Some(Value::BitRegister { width, bits }) => {
                Ok(Some((0..width).map(|i| Value::Bit(((bits >> i) & 1) as u8)).collect()))
            }
            Some(other) => {
                self.fail(
                    id,
                    ErrorKind::Type(format!(
                        "cannot iterate over {}",
                        other.type_name()
                    )),
                    loc,
                )?;
                Ok(None)
            }
            None => Ok(None),
        }
    }

    /// Inclusive range `[start : (step :)? end]` as concrete indices.
    fn range_indices(
        &mut self,
        start: &Expr,
        step: Option<&Expr>,
        end: &Expr,
        id: PathId,
        loc: Loc,
    ) -> Result<Option<Vec<i64>>, RuntimeError> {
        let Some(start_v) = self.eval_single(start, id)? else { return Ok(None) };
        let Some(end_v) = self.eval_single(end, id)? else { return Ok(None) };
        let step_v = match step {
            Some(e) => match self.eval_single(e, id)? {
                Some(v) => v,
                None => return Ok(None),
            },
            None => Value::int(1),
        };
        let (a, b, s) = match (start_v.as_index(), end_v.as_index(), step_v.as_index()) {
            (Ok(a), Ok(b), Ok(s)) => (a, b, s),
            (Err(kind), ..) | (_, Err(kind), _) | (.., Err(kind)) => {
                self.fail(id, kind, loc)?;
                return Ok(None);
            }
        };
        if s == 0 {
            self.fail(id, ErrorKind::Type("range step cannot be zero".to_string()), loc)?;
            return Ok(None);
        }
        let mut values = Vec::new();
        let mut v = a;
        if s > 0 {
            while v <= b {
                values.push(v);
                v += s;
            }
        } else {
            while v >= b {
                values.push(v);
                v += s;
            }
        }
        Ok(Some(values))
    }

    fn exec_switch(
        &mut self,
        selector: &Expr,
        cases: &[SwitchCase],
        default: &Option<Vec<Stmt>>,
        loc: Loc,
        live: Vec<PathId>,
    ) -> Result<Vec<PathId>, RuntimeError> {
        // Bucket paths by the first matching arm; usize::MAX marks the
        // default arm, and unmatched paths fall through as a no-op.
        let mut buckets: HashMap<usize, Vec<PathId>> = HashMap::new();
        let mut untouched = Vec::new();
        for id in live {
            for (pid, value) in self.eval_expr(selector, id)? {
                let sel = match value.as_i128() {
                    Ok(v) => v,
                    Err(kind) => {
                        self.fail(pid, kind, loc)?;
                        continue;
                    }
                };
                let mut arm = None;
                'arms: for (k, case) in cases.iter().enumerate() {
                    for label in &case.labels {
                        let Some(lv) = self.eval_single(label, pid)? else { continue 'arms };
                        match lv.as_i128() {
                            Ok(l) if l == sel => {
                                arm = Some(k);
                                break 'arms;
                            }
                            Ok(_) => {}
                            Err(kind) => {
                                self.fail(pid, kind, label.loc())?;
                                continue 'arms;
                            }
                        }
                    }
                }
                if self.paths[pid].error.is_some() {
                    continue;
                }
                match arm {
                    Some(k) => buckets.entry(k).or_default().push(pid),
                    None if default.is_some() => {
                        buckets.entry(usize::MAX).or_default().push(pid)
                    }
                    None => untouched.push(pid),
                }
            }
        }

        let mut out = untouched;
        for (k, case) in cases.iter().enumerate() {
            if let Some(members) = buckets.remove(&k) {
                out.extend(self.exec_scoped(FrameKind::Block, &case.body, members)?);
            }
        }
        if let (Some(body), Some(members)) = (default.as_ref(), buckets.remove(&usize::MAX)) {
            out.extend(self.exec_scoped(FrameKind::Block, body, members)?);
        }
        Ok(self.reorder(out))
    }

    fn exec_return(
        &mut self,
        value: &Option<Expr>,
        live: Vec<PathId>,
    ) -> Result<Vec<PathId>, RuntimeError> {
        let mut out = Vec::new();
        for id in live {
            match value {
                Some(expr) => {
                    for (pid, v) in self.eval_expr(expr, id)? {
                        self.paths[pid].return_value = Some(v);
                        self.paths[pid].flags.returned = true;
                        out.push(pid);
                    }
                }
                None => {
                    self.paths[id].return_value = None;
                    self.paths[id].flags.returned = true;
                    out.push(id);
                }
            }
        }
        Ok(self.reorder(out))
    }

    fn exec_expr_stmt(
        &mut self,
        expr: &Expr,
        live: Vec<PathId>,
    ) -> Result<Vec<PathId>, RuntimeError> {
        let mut out = Vec::new();
        for id in live {
            if let Expr::Call { name, args, loc: cloc } = expr {
                // Void subroutine calls are legal as statements.
                if self.func_defs.contains_key(name) {
                    for (pid, _) in self.eval_call(name, args, id, *cloc)? {
                        out.push(pid);
                    }
                    continue;
                }
            }
            for (pid, _) in self.eval_expr(expr, id)? {
                out.push(pid);
            }
        }
        Ok(self.reorder(out))
    }

    // ---- Expression evaluation ----

    /// Evaluate an expression on one path. Subroutine calls inside the
    /// expression may fork, so the result is a set of (path, value)
    /// pairs; a path that errors is terminated and dropped from the set.
    fn eval_expr(&mut self, expr: &Expr, id: PathId) -> Result<Evaluated, RuntimeError> {
        match expr {
            Expr::IntLit { value, .. } => Ok(vec![(id, Value::int(*value))]),
            Expr::FloatLit { value, .. } => Ok(vec![(id, Value::Float(*value))]),
            Expr::BoolLit { value, .. } => Ok(vec![(id, Value::Bool(*value))]),
            Expr::BitstringLit { bits, .. } => Ok(vec![(id, bitstring_value(bits))]),
            Expr::StrLit { value, .. } => Ok(vec![(id, Value::Str(value.clone()))]),
            Expr::Constant { kind, .. } => {
                let v = match kind {
                    NamedConstant::Pi => Value::Float(std::f64::consts::PI),
                    NamedConstant::Tau => Value::Float(std::f64::consts::TAU),
                    NamedConstant::Euler => Value::Float(std::f64::consts::E),
                    NamedConstant::Im => Value::Complex(Complex64::new(0.0, 1.0)),
                };
                Ok(vec![(id, v)])
            }
            Expr::Ident { name, loc } => match self.paths[id].scopes.lookup(name) {
                Ok(v) => Ok(vec![(id, v)]),
                Err(kind) => {
                    self.fail(id, kind, *loc)?;
                    Ok(vec![])
                }
            },
            Expr::Index { base, index, loc } => self.eval_index(base, index, *loc, id),
            Expr::Range { loc, .. } => {
                self.fail(
                    id,
                    ErrorKind::Type("a range is not a value in this position".to_string()),
                    *loc,
                )?;
                Ok(vec![])
            }
            Expr::ArrayLit { elems, .. } => {
                let mut out = Vec::new();
                for (pid, values) in self.eval_seq(elems, id)? {
                    let elem = values
                        .first()
                        .map(|v| v.value_type())
                        .unwrap_or(ValueType::Float);
                    out.push((pid, Value::Array { elem, values }));
                }
                Ok(out)
            }
            Expr::Unary { op, expr: inner, loc } => {
                let mut out = Vec::new();
                for (pid, v) in self.eval_expr(inner, id)? {
                    match apply_unary(*op, &v) {
                        Ok(v) => out.push((pid, v)),
                        Err(kind) => self.fail(pid, kind, *loc)?,
                    }
                }
                Ok(out)
            }
            Expr::Binary { op, lhs, rhs, loc } => self.eval_binary(*op, lhs, rhs, *loc, id),
            Expr::Cast { ty, expr: inner, loc } => {
                let Some(resolved) = self.resolve_type_spec(ty, id, *loc)? else {
                    return Ok(vec![]);
                };
                let mut out = Vec::new();
                for (pid, v) in self.eval_expr(inner, id)? {
                    match cast(&resolved, &v) {
                        Ok(v) => out.push((pid, v)),
                        Err(kind) => self.fail(pid, kind, *loc)?,
                    }
                }
                Ok(out)
            }
            Expr::Call { name, args, loc } => {
                if self.func_defs.contains_key(name) {
                    let mut out = Vec::new();
                    for (pid, ret) in self.eval_call(name, args, id, *loc)? {
                        match ret {
                            Some(v) => out.push((pid, v)),
                            None => self.fail(
                                pid,
                                ErrorKind::Type(format!("subroutine '{}' returns no value", name)),
                                *loc,
                            )?,
                        }
                    }
                    return Ok(out);
                }
                let mut out = Vec::new();
                for (pid, argv) in self.eval_seq(args, id)? {
                    match apply_numeric_builtin(name, &argv) {
                        Some(Ok(v)) => out.push((pid, v)),
                        Some(Err(kind)) => self.fail(pid, kind, *loc)?,
                        None => self.fail(
                            pid,
                            ErrorKind::UnresolvedIdentifier(name.to_string()),
                            *loc,
                        )?,
                    }
                }
                Ok(out)
            }
            Expr::Ternary { cond, then_expr, else_expr, loc } => {
                let mut out = Vec::new();
                for (pid, c) in self.eval_expr(cond, id)? {
                    match c.truthy() {
                        Ok(true) => out.extend(self.eval_expr(then_expr, pid)?),
                        Ok(false) => out.extend(self.eval_expr(else_expr, pid)?),
                        Err(kind) => self.fail(pid, kind, *loc)?,
                    }
                }
                Ok(out)
            }
        }
    }

    fn eval_binary(
        &mut self,
        op: BinaryOp,
        lhs: &Expr,
        rhs: &Expr,
        loc: Loc,
        id: PathId,
    ) -> Result<Evaluated, RuntimeError> {
        // Short-circuit logic keeps the right operand unevaluated.
        if matches!(op, BinaryOp::LogicAnd | BinaryOp::LogicOr) {
            let mut out = Vec::new();
            for (pid, lv) in self.eval_expr(lhs, id)? {
                let decided = match lv.truthy() {
                    Ok(b) => b,
                    Err(kind) => {
                        self.fail(pid, kind, loc)?;
                        continue;
                    }
                };
                let shortcut = match op {
                    BinaryOp::LogicAnd => !decided,
                    _ => decided,
                };
                if shortcut {
                    out.push((pid, Value::Bool(decided)));
                    continue;
                }
                for (pid2, rv) in self.eval_expr(rhs, pid)? {
                    match rv.truthy() {
                        Ok(b) => out.push((pid2, Value::Bool(b))),
                        Err(kind) => self.fail(pid2, kind, loc)?,
                    }
                }
            }
            return Ok(out);
        }

        let mut out = Vec::new();
        for (pid, lv) in self.eval_expr(lhs, id)? {
            for (pid2, rv) in self.eval_expr(rhs, pid)? {
                match apply_binary(op, &lv, &rv) {
                    Ok(v) => out.push((pid2, v)),
                    Err(kind) => self.fail(pid2, kind, loc)?,
                }
            }
        }
        Ok(out)
    }

    fn eval_index(
        &mut self,
        base: &Expr,
        index: &Expr,
        loc: Loc,
        id: PathId,
    ) -> Result<Evaluated, RuntimeError> {
        let mut out = Vec::new();
        for (pid, base_value) in self.eval_expr(base, id)? {
            if let Expr::Range { start, step, end, .. } = index {
                let Some(indices) = self.range_indices(start, step.as_deref(), end, pid, loc)?
                else {
                    continue;
                };
                match slice_value(&base_value, &indices) {
                    Ok(v) => out.push((pid, v)),
                    Err(kind) => self.fail(pid, kind, loc)?,
                }
                continue;
            }
            for (pid2, iv) in self.eval_expr(index, pid)? {
                let i = match iv.as_index() {
                    Ok(i) => i,
                    Err(kind) => {
                        self.fail(pid2, kind, loc)?;
                        continue;
                    }
                };
                match element_value(&base_value, i) {
                    Ok(v) => out.push((pid2, v)),
                    Err(kind) => self.fail(pid2, kind, loc)?,
                }
            }
        }
        Ok(out)
    }

    /// Evaluate a list of expressions in order, threading forks through
    /// each position.
    fn eval_seq(
        &mut self,
        exprs: &[Expr],
        id: PathId,
    ) -> Result<Vec<(PathId, Vec<Value>)>, RuntimeError> {
        let mut acc: Vec<(PathId, Vec<Value>)> = vec![(id, Vec::new())];
        for expr in exprs {
            let mut next = Vec::new();
            for (pid, values) in acc {
                for (pid2, v) in self.eval_expr(expr, pid)? {
                    let mut extended = values.clone();
                    extended.push(v);
                    next.push((pid2, extended));
                }
            }
            acc = next;
        }
        Ok(acc)
    }

    /// Evaluate an expression that must not fork (widths, indices, case
    /// labels, modifier arguments). Returns None when the path died.
    fn eval_single(&mut self, expr: &Expr, id: PathId) -> Result<Option<Value>, RuntimeError> {
        let mut results = self.eval_expr(expr, id)?;
        match results.len() {
            0 => Ok(None),
            1 => Ok(Some(results.remove(0).1)),
            _ => {
                // The expression forked; every branch is now poisoned.
                for (pid, _) in results {
                    self.fail(
                        pid,
                        ErrorKind::Type(
                            "expression in this position must be deterministic".to_string(),
                        ),
                        expr.loc(),
                    )?;
                }
                Ok(None)
            }
        }
    }

    fn eval_call(
        &mut self,
        name: &str,
        args: &[Expr],
        id: PathId,
        loc: Loc,
    ) -> Result<Vec<(PathId, Option<Value>)>, RuntimeError> {
        let def = self
            .func_defs
            .get(name)
            .cloned()
            .expect("eval_call is only reached for registered subroutines");
        if args.len() != def.params.len() {
            self.fail(
                id,
                ErrorKind::ArityMismatch(format!(
                    "'{}' expects {} arguments, got {}",
                    name,
                    def.params.len(),
                    args.len()
                )),
                loc,
            )?;
            return Ok(vec![]);
        }
        if self.call_depth >= RECURSION_LIMIT {
            self.fail(
                id,
                ErrorKind::Type(format!("recursion depth exceeded calling '{}'", name)),
                loc,
            )?;
            return Ok(vec![]);
        }

        self.call_depth += 1;
        let result = self.eval_call_inner(&def, name, args, id, loc);
        self.call_depth -= 1;
        result
    }

    fn eval_call_inner(
        &mut self,
        def: &FunctionDefinition,
        name: &str,
        args: &[Expr],
        id: PathId,
        loc: Loc,
    ) -> Result<Vec<(PathId, Option<Value>)>, RuntimeError> {
        let mut out = Vec::new();
        for (pid, arg_values) in self.eval_seq(args, id)? {
            // Parameter types are resolved in the caller's scope before
            // the barrier frame goes up.
            let mut bindings = Vec::with_capacity(def.params.len());
            let mut dead = false;
            for (param, value) in def.params.iter().zip(arg_values.iter()) {
                let Some(ty) = self.resolve_type_spec(&param.ty, pid, loc)? else {
                    dead = true;
                    break;
                };
                match coerce_assign(&ty, value) {
                    Ok(v) => bindings.push((param.name.clone(), ty, v)),
                    Err(kind) => {
                        self.fail(pid, kind, loc)?;
                        dead = true;
                        break;
                    }
                }
            }
            if dead {
                continue;
            }

            let depth_before = self.paths[pid].scopes.depth();
            self.paths[pid].scopes.enter(FrameKind::Function);
            let mut declared = true;
            for (pname, ty, value) in bindings {
                if let Err(kind) =
                    self.paths[pid].scopes.declare(&pname, ty, Mutability::Mutable, value)
                {
                    self.fail(pid, kind, loc)?;
                    declared = false;
                    break;
                }
            }
            if !declared {
                continue;
            }

            let finished = self.exec_block(&def.body, vec![pid])?;
            for fid in finished {
                self.paths[fid].scopes.truncate(depth_before);
                let flags = &mut self.paths[fid].flags;
                flags.returned = false;
                if flags.broke || flags.continuing {
                    flags.broke = false;
                    flags.continuing = false;
                    self.fail(
                        fid,
                        ErrorKind::Type("'break' or 'continue' outside of a loop".to_string()),
                        loc,
                    )?;
                    continue;
                }
                let returned = self.paths[fid].return_value.take();
                match (&def.return_ty, returned) {
                    (Some(ts), Some(v)) => {
                        let Some(ty) = self.resolve_type_spec(ts, fid, loc)? else { continue };
                        match coerce_assign(&ty, &v) {
                            Ok(v) => out.push((fid, Some(v))),
                            Err(kind) => self.fail(fid, kind, loc)?,
                        }
                    }
                    (Some(_), None) => {
                        self.fail(
                            fid,
                            ErrorKind::Type(format!(
                                "subroutine '{}' ended without returning a value",
                                name
                            )),
                            loc,
                        )?;
                    }
                    (None, Some(_)) => {
                        self.fail(
                            fid,
                            ErrorKind::Type(format!(
                                "subroutine '{}' has no declared return type",
                                name
                            )),
                            loc,
                        )?;
                    }
                    (None, None) => out.push((fid, None)),
                }
            }
        }
        Ok(out)
    }

    // ---- Types ----

    fn resolve_type_spec(
        &mut self,
        ts: &TypeSpec,
        id: PathId,
        loc: Loc,
    ) -> Result<Option<ValueType>, RuntimeError> {
        let width_of = |this: &mut Self,
                        expr: &Option<Box<Expr>>,
                        default: usize|
         -> Result<Option<usize>, RuntimeError> {
            match expr {
                None => Ok(Some(default)),
                Some(e) => match this.eval_single(e, id)? {
                    None => Ok(None),
                    Some(v) => match v.as_index() {
                        Ok(w) if w >= 1 && w <= 64 => Ok(Some(w as usize)),
                        Ok(w) => {
                            this.fail(
                                id,
                                ErrorKind::WidthMismatch(format!(
                                    "width {} is outside the supported 1..=64",
                                    w
                                )),
                                loc,
                            )?;
                            Ok(None)
                        }
                        Err(kind) => {
                            this.fail(id, kind, loc)?;
                            Ok(None)
                        }
                    },
                },
            }
        };

        let resolved = match ts {
            TypeSpec::Bit { width: None } => Some(ValueType::Bit),
            TypeSpec::Bit { width } => {
                width_of(self, width, 1)?.map(ValueType::BitRegister)
            }
            TypeSpec::Int { width } => width_of(self, width, 32)?
                .map(|w| ValueType::Int { width: w, signed: true }),
            TypeSpec::UInt { width } => width_of(self, width, 32)?
                .map(|w| ValueType::Int { width: w, signed: false }),
            TypeSpec::Float { width } => width_of(self, width, 64)?.map(|_| ValueType::Float),
            TypeSpec::Angle => Some(ValueType::Angle),
            TypeSpec::Bool => Some(ValueType::Bool),
            TypeSpec::Complex => Some(ValueType::Complex),
            TypeSpec::Qubit { size: None } => Some(ValueType::Qubit),
            TypeSpec::Qubit { size } => width_of(self, size, 1)?.map(ValueType::QubitArray),
            TypeSpec::Array { elem, dims } => {
                let Some(inner) = self.resolve_type_spec(elem, id, loc)? else { return Ok(None) };
                let mut sizes = Vec::with_capacity(dims.len());
                for d in dims {
                    let Some(v) = self.eval_single(d, id)? else { return Ok(None) };
                    match v.as_index() {
                        Ok(n) if n >= 0 => sizes.push(n as usize),
                        Ok(n) => {
                            self.fail(
                                id,
                                ErrorKind::Type(format!("array dimension must be non-negative, got {}", n)),
                                loc,
                            )?;
                            return Ok(None);
                        }
                        Err(kind) => {
                            self.fail(id, kind, loc)?;
                            return Ok(None);
                        }
                    }
                }
                Some(ValueType::Array(Box::new(inner), sizes))
            }
        };
        Ok(resolved)
    }
}

fn compound_op(op: AssignOp) -> BinaryOp {
    match op {
        AssignOp::Add => BinaryOp::Add,
        AssignOp::Sub => BinaryOp::Sub,
        AssignOp::Mul => BinaryOp::Mul,
        AssignOp::Div => BinaryOp::Div,
        AssignOp::Mod => BinaryOp::Mod,
        AssignOp::BitAnd => BinaryOp::BitAnd,
        AssignOp::BitOr => BinaryOp::BitOr,
        AssignOp::BitXor => BinaryOp::BitXor,
        AssignOp::Shl => BinaryOp::Shl,
        AssignOp::Shr => BinaryOp::Shr,
        AssignOp::Set => unreachable!("plain assignment has no compound operator"),
    }
}

fn gate_param(v: &Value) -> Result<f64, ErrorKind> {
    match v {
        Value::Float(f) => Ok(*f),
        // Angle parameters are recorded with their raw, unreduced value.
        Value::Angle(a) => Ok(*a),
        Value::Int { .. } | Value::Bit(_) | Value::BitRegister { .. } => v.as_float(),
        other => Err(ErrorKind::Type(format!(
            "gate parameters must be numeric, got {}",
            other.type_name()
        ))),
    }
}

fn default_value(ty: &ValueType) -> Value {
    match ty {
        ValueType::Bool => Value::Bool(false),
        ValueType::Bit => Value::Bit(0),
        ValueType::BitRegister(n) => Value::BitRegister { width: *n, bits: 0 },
        ValueType::Int { width, signed } => {
            Value::Int { width: *width, signed: *signed, value: 0 }
        }
        ValueType::Float => Value::Float(0.0),
        ValueType::Complex => Value::Complex(Complex64::new(0.0, 0.0)),
        ValueType::Angle => Value::Angle(0.0),
        ValueType::Array(elem, dims) => {
            if dims.is_empty() {
                return Value::Array { elem: (**elem).clone(), values: Vec::new() };
            }
            let inner_ty = if dims.len() == 1 {
                (**elem).clone()
            } else {
                ValueType::Array(elem.clone(), dims[1..].to_vec())
            };
            let values = (0..dims[0]).map(|_| default_value(&inner_ty)).collect();
            Value::Array { elem: inner_ty, values }
        }
        ValueType::Qubit => Value::QubitRef(0),
        ValueType::QubitArray(n) => Value::QubitArray((0..*n).collect()),
        ValueType::Str => Value::Str(String::new()),
    }
}

fn element_value(base: &Value, i: i64) -> Result<Value, ErrorKind> {
    let check = |len: usize| -> Result<usize, ErrorKind> {
        if i < 0 || i as usize >= len {
            Err(ErrorKind::IndexOutOfBounds(format!("index {} out of range 0..{}", i, len)))
        } else {
            Ok(i as usize)
        }
    };
    match base {
        Value::BitRegister { width, bits } => {
            let i = check(*width)?;
            Ok(Value::Bit(((bits >> i) & 1) as u8))
        }
        Value::Array { values, .. } => {
            let i = check(values.len())?;
            Ok(values[i].clone())
        }
        Value::QubitArray(indices) => {
            let i = check(indices.len())?;
            Ok(Value::QubitRef(indices[i]))
        }
        other => Err(ErrorKind::Type(format!("{} is not indexable", other.type_name()))),
    }
}

fn slice_value(base: &Value, indices: &[i64]) -> Result<Value, ErrorKind> {
    match base {
        Value::BitRegister { width, bits } => {
            let mut out = 0u64;
            for (j, &i) in indices.iter().enumerate() {
                if i < 0 || i as usize >= *width {
                    return Err(ErrorKind::IndexOutOfBounds(format!(
                        "slice index {} out of range 0..{}",
                        i, width
                    )));
                }
                out |= ((bits >> i) & 1) << j;
            }
            Ok(Value::BitRegister { width: indices.len(), bits: out })
        }
        Value::QubitArray(qubits) => {
            let mut out = Vec::with_capacity(indices.len());
            for &i in indices {
                if i < 0 || i as usize >= qubits.len() {
                    return Err(ErrorKind::IndexOutOfBounds(format!(
                        "slice index {} out of range 0..{}",
                        i,
                        qubits.len()
                    )));
                }
                out.push(qubits[i as usize]);
            }
            Ok(Value::QubitArray(out))
        }
        Value::Array { elem, values } => {
            let mut out = Vec::with_capacity(indices.len());
            for &i in indices {
                if i < 0 || i as usize >= values.len() {
                    return Err(ErrorKind::IndexOutOfBounds(format!(
                        "slice index {} out of range 0..{}",
                        i,
                        values.len()
                    )));
                }
                out.push(values[i as usize].clone());
            }
            Ok(Value::Array { elem: elem.clone(), values: out })
        }
        other => Err(ErrorKind::Type(format!("{} is not sliceable", other.type_name()))),
    }
}

fn set_element(base: Value, i: i64, value: Value) -> Result<Value, ErrorKind> {
    match base {
        Value::BitRegister { width, bits } => {
            if i < 0 || i as usize >= width {
                return Err(ErrorKind::IndexOutOfBounds(format!(
                    "index {} out of range 0..{}",
                    i, width
                )));
            }
            let bit = match coerce_assign(&ValueType::Bit, &value)? {
                Value::Bit(b) => b,
                _ => unreachable!("bit coercion yields a bit"),
            };
            let mask = 1u64 << i;
            let bits = if bit == 1 { bits | mask } else { bits & !mask };
            Ok(Value::BitRegister { width, bits })
        }
        Value::Array { elem, mut values } => {
            if i < 0 || i as usize >= values.len() {
                return Err(ErrorKind::IndexOutOfBounds(format!(
                    "index {} out of range 0..{}",
                    i,
                    values.len()
                )));
            }
            values[i as usize] = coerce_assign(&elem, &value)?;
            Ok(Value::Array { elem, values })
        }
        other => Err(ErrorKind::Type(format!(
            "{} does not support indexed assignment",
            other.type_name()
        ))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::rngs::StdRng;
    use rand::SeedableRng;

    fn run(src: &str) -> BranchedResult {
        run_source(src, &HashMap::new()).unwrap()
    }

    fn active(result: &BranchedResult) -> Vec<&PathRecord> {
        result.active_records().collect()
    }

    #[test]
    fn test_s1_single_measurement_forks() {
        let result = run("OPENQASM 3.0;\nqubit[1] q;\nbit b;\nh q[0];\nb = measure q[0];");
        let paths = active(&result);
        assert_eq!(paths.len(), 2);
        assert_eq!(paths[0].measurements["q[0]"], vec![0]);
        assert_eq!(paths[1].measurements["q[0]"], vec![1]);
        assert!((paths[0].weight - 0.5).abs() < 1e-10);
        assert!((paths[1].weight - 0.5).abs() < 1e-10);
        assert_eq!(paths[0].classical["b"], Value::Bit(0));
        assert_eq!(paths[1].classical["b"], Value::Bit(1));
    }

    #[test]
    fn test_s2_bell_pair_outcomes_correlate() {
        let result = run(
            "qubit[2] q; bit b0; bit b1;\n\
             h q[0]; cnot q[0], q[1];\n\
             b0 = measure q[0]; b1 = measure q[1];",
        );
        let paths = active(&result);
        assert_eq!(paths.len(), 2);
        for p in &paths {
            assert_eq!(p.classical["b0"], p.classical["b1"]);
        }
    }

    #[test]
    fn test_s3_feedforward_conditional_x() {
        let result = run(
            "qubit[2] q; bit b; bit b2;\n\
             h q[0];\n\
             b = measure q[0];\n\
             if (b == 1) x q[1];\n\
             b2 = measure q[1];",
        );
        let paths = active(&result);
        assert_eq!(paths.len(), 2);
        let adapter = AmplitudeAdapter::default();
        for p in &paths {
            let state = result.state_vector(p.id, &adapter).unwrap();
            match p.classical["b"] {
                Value::Bit(0) => {
                    assert!((state[0b00].norm_sqr() - 1.0).abs() < 1e-10);
                    assert_eq!(p.classical["b2"], Value::Bit(0));
                }
                Value::Bit(1) => {
                    assert!((state[0b11].norm_sqr() - 1.0).abs() < 1e-10);
                    assert_eq!(p.classical["b2"], Value::Bit(1));
                }
                ref other => panic!("unexpected outcome {:?}", other),
            }
        }
    }

    #[test]
    fn test_s4_binomial_path_counts() {
        let result = run(
            "qubit[4] q; bit[4] b; int count = 0;\n\
             for uint i in [0:3] {\n\
                 h q[i];\n\
                 b[i] = measure q[i];\n\
                 if (b[i] == 1) count = count + 1;\n\
             }",
        );
        let paths = active(&result);
        assert_eq!(paths.len(), 16);
        let mut histogram: HashMap<i64, usize> = HashMap::new();
        for p in &paths {
            let count = match p.classical["count"] {
                Value::Int { value, .. } => value,
                ref other => panic!("unexpected count {:?}", other),
            };
            *histogram.entry(count).or_insert(0) += 1;
        }
        assert_eq!(histogram[&0], 1);
        assert_eq!(histogram[&1], 4);
        assert_eq!(histogram[&2], 6);
        assert_eq!(histogram[&3], 4);
        assert_eq!(histogram[&4], 1);
    }

    #[test]
    fn test_s5_while_loop_branch_structure() {
        let result = run(
            "qubit[1] q; bit b; int count = 0;\n\
             while (b == 0 && count < 3) {\n\
                 h q[0];\n\
                 b = measure q[0];\n\
                 count = count + 1;\n\
             }",
        );
        let paths = active(&result);
        assert_eq!(paths.len(), 4);
        for p in &paths {
            let count = match p.classical["count"] {
                Value::Int { value, .. } => value,
                ref other => panic!("unexpected count {:?}", other),
            };
            let b = p.classical["b"].clone();
            match count {
                1 | 2 => assert_eq!(b, Value::Bit(1)),
                3 => assert!(b == Value::Bit(0) || b == Value::Bit(1)),
                other => panic!("unexpected iteration count {}", other),
            }
        }
    }

    #[test]
    fn test_s6_recursive_factorial_guard() {
        let result = run(
            "qubit[1] q; bit b;\n\
             def factorial(int n) -> int {\n\
                 if (n <= 1) { return 1; }\n\
                 return n * factorial(n - 1);\n\
             }\n\
             int result = factorial(4);\n\
             if (result == 24) { h q[0]; }\n\
             b = measure q[0];",
        );
        let paths = active(&result);
        assert_eq!(paths.len(), 2);
        for p in &paths {
            assert_eq!(p.classical["result"], Value::int(24));
        }
        let outcomes: Vec<u8> =
            paths.iter().map(|p| p.last_outcome("q[0]").unwrap()).collect();
        assert_eq!(outcomes, vec![0, 1]);
    }

    #[test]
    fn test_deterministic_measurement_does_not_fork() {
        let result = run("qubit[1] q; bit b; x q[0]; b = measure q[0];");
        let paths = active(&result);
        assert_eq!(paths.len(), 1);
        assert_eq!(paths[0].classical["b"], Value::Bit(1));
        assert_eq!(paths[0].measurements["q[0]"], vec![1]);
    }

    #[test]
    fn test_fork_ordering_zero_child_keeps_slot() {
        let result = run(
            "qubit[2] q; bit a; bit b;\n\
             h q[0]; h q[1];\n\
             a = measure q[0];\n\
             b = measure q[1];",
        );
        let paths = active(&result);
        let outcomes: Vec<(Value, Value)> = paths
            .iter()
            .map(|p| (p.classical["a"].clone(), p.classical["b"].clone()))
            .collect();
        // Lexicographic order falls out of the split-insertion rule.
        assert_eq!(
            outcomes,
            vec![
                (Value::Bit(0), Value::Bit(0)),
                (Value::Bit(0), Value::Bit(1)),
                (Value::Bit(1), Value::Bit(0)),
                (Value::Bit(1), Value::Bit(1)),
            ]
        );
    }

    #[test]
    fn test_instruction_determinism_across_runs() {
        let src = "qubit[2] q; bit b;\n\
                   h q[0]; cnot q[0], q[1];\n\
                   b = measure q[0];\n\
                   if (b == 1) x q[1];";
        let a = run(src);
        let b = run(src);
        assert_eq!(a.paths.len(), b.paths.len());
        for (pa, pb) in a.paths.iter().zip(b.paths.iter()) {
            assert_eq!(pa.instructions, pb.instructions);
        }
    }

    #[test]
    fn test_measurement_collapse_markers_in_ledger() {
        let result = run("qubit[1] q; bit b; h q[0]; b = measure q[0];");
        for p in active(&result) {
            let outcome = p.last_outcome("q[0]").unwrap();
            assert!(p
                .instructions
                .contains(&Instruction::Measure { qubit: 0, outcome }));
        }
    }

    #[test]
    fn test_register_measurement_forks_per_qubit() {
        let result = run("qubit[2] q; bit[2] b; h q[0]; h q[1]; b = measure q;");
        let paths = active(&result);
        assert_eq!(paths.len(), 4);
        let values: Vec<u64> = paths
            .iter()
            .map(|p| match p.classical["b"] {
                Value::BitRegister { bits, .. } => bits,
                ref other => panic!("unexpected register {:?}", other),
            })
            .collect();
        let mut sorted = values.clone();
        sorted.sort_unstable();
        assert_eq!(sorted, vec![0b00, 0b01, 0b10, 0b11]);
    }

    #[test]
    fn test_teleportation_feedforward() {
        let theta = 0.7_f64;
        let result = run(&format!(
            "qubit[3] q; bit[2] m;\n\
             ry({theta}) q[0];\n\
             h q[1]; cnot q[1], q[2];\n\
             cnot q[0], q[1]; h q[0];\n\
             m[0] = measure q[0];\n\
             m[1] = measure q[1];\n\
             if (m[1] == 1) x q[2];\n\
             if (m[0] == 1) z q[2];"
        ));
        let paths = active(&result);
        assert_eq!(paths.len(), 4);

        let expected0 = (theta / 2.0).cos();
        let expected1 = (theta / 2.0).sin();
        let adapter = AmplitudeAdapter::default();
        for p in &paths {
            assert!((p.weight - 0.25).abs() < 1e-9);
            let m0 = p.last_outcome("q[0]").unwrap() as usize;
            let m1 = p.last_outcome("q[1]").unwrap() as usize;
            let state = result.state_vector(p.id, &adapter).unwrap();
            let a0 = state[m0 | (m1 << 1)];
            let a1 = state[m0 | (m1 << 1) | (1 << 2)];
            // Destination qubit equals the source state up to global phase.
            let fidelity = (a0.conj() * expected0 + a1.conj() * expected1).norm();
            assert!((fidelity - 1.0).abs() < 1e-10);
        }
    }

    #[test]
    fn test_reset_collapses_without_forking() {
        let result = run("qubit[1] q; bit b; h q[0]; reset q[0]; b = measure q[0];");
        let paths = active(&result);
        assert_eq!(paths.len(), 1);
        assert_eq!(paths[0].classical["b"], Value::Bit(0));
        assert!(paths[0].instructions.contains(&Instruction::Reset { qubit: 0 }));
    }

    #[test]
    fn test_scope_isolation_block_locals_invisible_outside() {
        let result = run(
            "qubit[1] q; int x = 1;\n\
             { int y = 2; x = y; }\n\
             x = y;",
        );
        let paths = &result.paths;
        assert_eq!(paths.len(), 1);
        assert!(!paths[0].active);
        let err = paths[0].error.as_ref().unwrap();
        assert_eq!(err.kind, ErrorKind::UnresolvedIdentifier("y".to_string()));
    }

    #[test]
    fn test_scope_isolation_if_else_independent() {
        let result = run(
            "qubit[1] q; bit b; h q[0]; b = measure q[0];\n\
             if (b == 1) { int inner = 10; } else { int inner = 20; }",
        );
        let paths = active(&result);
        assert_eq!(paths.len(), 2);
        for p in &paths {
            assert!(!p.classical.contains_key("inner"));
        }
    }

    #[test]
    fn test_classical_branch_exclusion() {
        let result = run(
            "qubit[1] q; bit b; int took = -1;\n\
             h q[0]; b = measure q[0];\n\
             if (b == 1) { took = 1; } else { took = 0; }",
        );
        for p in active(&result) {
            let b = match p.classical["b"] {
                Value::Bit(b) => b as i64,
                ref other => panic!("unexpected bit {:?}", other),
            };
            assert_eq!(p.classical["took"], Value::int(b));
        }
    }

    #[test]
    fn test_path_error_does_not_halt_siblings() {
        let result = run(
            "qubit[1] q; bit b; int x = 1;\n\
             h q[0]; b = measure q[0];\n\
             if (b == 1) { x = x / 0; }\n\
             x = x + 1;",
        );
        assert_eq!(result.paths.len(), 2);
        assert_eq!(result.active_paths.len(), 1);
        let failed = result.paths.iter().find(|p| !p.active).unwrap();
        assert_eq!(failed.error.as_ref().unwrap().kind, ErrorKind::DivisionByZero);
        let survivor = result.paths.iter().find(|p| p.active).unwrap();
        assert_eq!(survivor.classical["x"], Value::int(2));
    }

    #[test]
    fn test_missing_input_is_run_fatal() {
        let err = run_source("qubit[1] q; input int n;", &HashMap::new()).unwrap_err();
        match err {
            EngineError::Runtime(e) => {
                assert_eq!(e.kind, ErrorKind::MissingInput("n".to_string()));
            }
            other => panic!("expected runtime error, got {:?}", other),
        }
    }

    #[test]
    fn test_inputs_bind_and_extras_are_ignored() {
        let mut inputs = HashMap::new();
        inputs.insert("n".to_string(), Value::int(3));
        inputs.insert("unused".to_string(), Value::int(9));
        let result = run_source(
            "qubit[1] q; input int n; int doubled = n * 2;",
            &inputs,
        )
        .unwrap();
        assert_eq!(result.paths[0].classical["doubled"], Value::int(6));
    }

    #[test]
    fn test_input_default_used_when_unsupplied() {
        let result = run_source("qubit[1] q; input int n = 5; int m = n + 1;", &HashMap::new())
            .unwrap();
        assert_eq!(result.paths[0].classical["m"], Value::int(6));
    }

    #[test]
    fn test_const_mutation_terminates_path() {
        let result = run("qubit[1] q; const int k = 3; k = 4;");
        assert!(!result.paths[0].active);
        assert_eq!(
            result.paths[0].error.as_ref().unwrap().kind,
            ErrorKind::ConstMutation("k".to_string())
        );
    }

    #[test]
    fn test_barrier_hides_mutable_global_in_subroutine() {
        let result = run(
            "qubit[1] q; int g = 1; const int k = 2;\n\
             def peek() -> int { return k; }\n\
             def poke() -> int { return g; }\n\
             int a = peek();\n\
             int b = poke();",
        );
        assert!(!result.paths[0].active);
        assert_eq!(
            result.paths[0].error.as_ref().unwrap().kind,
            ErrorKind::UnresolvedIdentifier("g".to_string())
        );
    }

    #[test]
    fn test_switch_first_match_and_default() {
        let result = run(
            "qubit[1] q; int x = 2; int y = 0;\n\
             switch (x) { case 0, 1 { y = 10; } case 2 { y = 20; } default { y = 30; } }\n\
             int z = 0;\n\
             switch (x) { case 7 { z = 1; } }",
        );
        let p = &result.paths[0];
        assert!(p.active);
        assert_eq!(p.classical["y"], Value::int(20));
        // No matching case and no default: the switch is a no-op.
        assert_eq!(p.classical["z"], Value::int(0));
    }

    #[test]
    fn test_break_and_continue() {
        let result = run(
            "qubit[1] q; int total = 0;\n\
             for uint i in [0:9] {\n\
                 if (i == 3) { continue; }\n\
                 if (i == 5) { break; }\n\
                 total = total + 1;\n\
             }\n\
             int spins = 0;\n\
             while (true) { spins = spins + 1; if (spins >= 4) { break; } }",
        );
        let p = &result.paths[0];
        assert!(p.active);
        // Iterations 0,1,2,4 count; 3 is skipped and 5 breaks.
        assert_eq!(p.classical["total"], Value::int(4));
        assert_eq!(p.classical["spins"], Value::int(4));
    }

    #[test]
    fn test_gate_definition_inlines_with_modifiers() {
        let result = run(
            "qubit[2] q;\n\
             gate flip a { x a; }\n\
             ctrl @ flip q[0], q[1];",
        );
        let p = &result.paths[0];
        assert!(p.active);
        assert_eq!(
            p.instructions,
            vec![Instruction::Gate {
                gate: "x".to_string(),
                targets: vec![0, 1],
                parameters: vec![],
                modifiers: vec![Modifier::Ctrl(1)],
            }]
        );
    }

    #[test]
    fn test_parameterized_gate_definition() {
        let result = run(
            "qubit[1] q;\n\
             gate tilt(theta) a { rx(theta / 2) a; }\n\
             tilt(1.0) q[0];",
        );
        let p = &result.paths[0];
        assert!(p.active);
        match &p.instructions[0] {
            Instruction::Gate { gate, parameters, .. } => {
                assert_eq!(gate, "rx");
                assert!((parameters[0] - 0.5).abs() < 1e-12);
            }
            other => panic!("unexpected instruction {:?}", other),
        }
    }

    #[test]
    fn test_recursive_gate_definition_rejected() {
        let result = run("qubit[1] q; gate loop a { loop a; }");
        assert!(!result.paths[0].active);
        let err = result.paths[0].error.as_ref().unwrap();
        assert!(matches!(err.kind, ErrorKind::Type(_)));
    }

    #[test]
    fn test_gate_shadowing_builtin_rejected() {
        let result = run("qubit[1] q; gate h a { x a; }");
        assert!(!result.paths[0].active);
        assert!(matches!(
            result.paths[0].error.as_ref().unwrap().kind,
            ErrorKind::Redeclaration(_)
        ));
    }

    #[test]
    fn test_qubit_reuse_terminates_path() {
        let result = run("qubit[2] q; cnot q[0], q[0];");
        assert!(!result.paths[0].active);
        assert!(matches!(
            result.paths[0].error.as_ref().unwrap().kind,
            ErrorKind::QubitReuse(_)
        ));
    }

    #[test]
    fn test_alias_slice_and_concat() {
        let result = run(
            "qubit[3] q; qubit[2] r;\n\
             let tail = q[1:2] ++ r[0];\n\
             x tail[0]; x tail[2];",
        );
        let p = &result.paths[0];
        assert!(p.active);
        let targets: Vec<Vec<usize>> = p
            .instructions
            .iter()
            .map(|i| match i {
                Instruction::Gate { targets, .. } => targets.clone(),
                other => panic!("unexpected instruction {:?}", other),
            })
            .collect();
        // tail = [q1, q2, r0] = global indices [1, 2, 3].
        assert_eq!(targets, vec![vec![1], vec![3]]);
    }

    #[test]
    fn test_measurement_through_alias_uses_canonical_name() {
        let result = run("qubit[2] q; bit b; let second = q[1]; x q[1]; b = measure second;");
        let p = &result.paths[0];
        assert_eq!(p.measurements["q[1]"], vec![1]);
    }

    #[test]
    fn test_sample_counts_bell_pair() {
        let result = run(
            "qubit[2] q; bit b0; bit b1;\n\
             h q[0]; cnot q[0], q[1];\n\
             b0 = measure q[0]; b1 = measure q[1];",
        );
        let mut rng = StdRng::seed_from_u64(7);
        let counts = sample_counts(&result, 1000, &mut rng);
        let total: u32 = counts.values().sum();
        assert_eq!(total, 1000);
        assert!(counts.keys().all(|k| k == "00" || k == "11"));
        // Both outcomes should show up over 1000 shots of a fair coin.
        assert!(counts.get("00").copied().unwrap_or(0) > 350);
        assert!(counts.get("11").copied().unwrap_or(0) > 350);
    }

    #[test]
    fn test_result_serializes_to_json() {
        let result = run("qubit[1] q; bit b; h q[0]; b = measure q[0];");
        let json = serde_json::to_string(&result).unwrap();
        assert!(json.contains("\"instructions\""));
        assert!(json.contains("\"measurements\""));
    }

    #[test]
    fn test_ternary_and_compound_assignment() {
        let result = run(
            "qubit[1] q; int x = 5;\n\
             x += 3;\n\
             x *= 2;\n\
             int y = x > 10 ? 1 : 0;",
        );
        let p = &result.paths[0];
        assert_eq!(p.classical["x"], Value::int(16));
        assert_eq!(p.classical["y"], Value::int(1));
    }

    #[test]
    fn test_pow_builtin_in_classical_expressions() {
        let result = run(
            "qubit[1] q;\n\
             float p = pow(2, 10);\n\
             rx(pow(2, -1)) q[0];",
        );
        let p = &result.paths[0];
        assert!(p.active);
        assert_eq!(p.classical["p"], Value::Float(1024.0));
        match &p.instructions[0] {
            Instruction::Gate { gate, parameters, .. } => {
                assert_eq!(gate, "rx");
                assert!((parameters[0] - 0.5).abs() < 1e-12);
            }
            other => panic!("unexpected instruction {:?}", other),
        }
    }

    #[test]
    fn test_for_over_discrete_set() {
        let result = run(
            "qubit[1] q; int total = 0;\n\
             for int v in {2, 3, 5} { total += v; }",
        );
        assert_eq!(result.paths[0].classical["total"], Value::int(10));
    }

    #[test]
    fn test_for_iteration_variable_scoped_per_iteration() {
        let result = run(
            "qubit[1] q; int last = -1;\n\
             for uint i in [0:2] { last = int(i); }\n\
             int probe = i;",
        );
        assert!(!result.paths[0].active);
        assert_eq!(
            result.paths[0].error.as_ref().unwrap().kind,
            ErrorKind::UnresolvedIdentifier("i".to_string())
        );
    }

    #[test]
    fn test_stepped_range() {
        let result = run(
            "qubit[1] q; int total = 0;\n\
             for uint i in [0:2:8] { total += int(i); }",
        );
        // 0 + 2 + 4 + 6 + 8
        assert_eq!(result.paths[0].classical["total"], Value::int(20));
    }

    #[test]
    fn test_output_variable_defaults_and_updates() {
        let result = run("qubit[1] q; output int tally; tally = 7;");
        assert_eq!(result.paths[0].classical["tally"], Value::int(7));
    }

    #[test]
    fn test_measure_inside_subroutine_forks_caller() {
        let result = run(
            "qubit[1] q;\n\
             def flip() -> bit { bit b; h q[0]; b = measure q[0]; return b; }\n\
             bit out;\n\
             out = bit(flip());",
        );
        let paths = active(&result);
        assert_eq!(paths.len(), 2);
        let outs: Vec<Value> = paths.iter().map(|p| p.classical["out"].clone()).collect();
        assert_eq!(outs, vec![Value::Bit(0), Value::Bit(1)]);
    }

    #[test]
    fn test_weights_multiply_along_history() {
        let result = run(
            "qubit[2] q; bit a; bit b;\n\
             ry(1.2) q[0];\n\
             a = measure q[0];\n\
             h q[1];\n\
             b = measure q[1];",
        );
        let p1 = (0.6_f64).sin().powi(2);
        let expected = [(1.0 - p1) * 0.5, (1.0 - p1) * 0.5, p1 * 0.5, p1 * 0.5];
        let mut weights: Vec<f64> = active(&result).iter().map(|p| p.weight).collect();
        weights.sort_by(|a, b| a.partial_cmp(b).unwrap());
        let mut want = expected.to_vec();
        want.sort_by(|a, b| a.partial_cmp(b).unwrap());
        for (w, e) in weights.iter().zip(want.iter()) {
            assert!((w - e).abs() < 1e-9);
        }
    }
}
