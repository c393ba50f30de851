// src/environment/mod.rs
pub mod value;

use crate::error::ErrorKind;
use crate::parser::ast::Mutability;
use std::collections::{BTreeMap, HashMap};
use std::rc::Rc;
use value::{coerce_assign, Value, ValueType};

/// Kinds of lexical frames. `Function` and `Gate` are barriers: lookup
/// past them reaches only `const` bindings of the enclosing scopes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FrameKind {
    Global,
    Block,
    ForIter,
    If,
    Else,
    While,
    Function,
    Gate,
}

impl FrameKind {
    fn is_barrier(&self) -> bool {
        matches!(self, FrameKind::Function | FrameKind::Gate)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Variable {
    pub ty: ValueType,
    pub mutability: Mutability,
    pub value: Value,
}

/// What an alias points at: a fixed set of qubit indices, or a classical
/// base variable (writes through the alias reach the base storage).
#[derive(Debug, Clone, PartialEq)]
pub enum AliasTarget {
    Qubits(Vec<usize>),
    Classical(String),
}

#[derive(Debug, Clone, PartialEq)]
enum Binding {
    Var(Variable),
    Alias(AliasTarget),
}

#[derive(Debug, Clone, PartialEq)]
pub struct Frame {
    kind: FrameKind,
    bindings: HashMap<String, Binding>,
}

impl Frame {
    fn new(kind: FrameKind) -> Self {
        Self { kind, bindings: HashMap::new() }
    }
}

/// Where a lookup landed: classical storage at (frame index, name), or a
/// resolved qubit reference.
enum Resolved {
    Storage { frame: usize, name: String },
    Qubits(Vec<usize>),
}

/// Lexical environment as a spine of shared frames. Forking a path clones
/// only the `Vec<Rc<Frame>>`; writes go through `Rc::make_mut`, so frames
/// are copied per-path at first mutation.
#[derive(Debug, Clone)]
pub struct ScopeStack {
    frames: Vec<Rc<Frame>>,
}

impl ScopeStack {
    pub fn new() -> Self {
        Self { frames: vec![Rc::new(Frame::new(FrameKind::Global))] }
    }

    pub fn enter(&mut self, kind: FrameKind) {
        self.frames.push(Rc::new(Frame::new(kind)));
    }

    pub fn leave(&mut self) {
        debug_assert!(self.frames.len() > 1, "cannot leave the global frame");
        self.frames.pop();
    }

    pub fn depth(&self) -> usize {
        self.frames.len()
    }

    /// Pop frames until the stack is `depth` frames deep again. Used to
    /// unwind mid-construct exits (`return` inside nested blocks).
    pub fn truncate(&mut self, depth: usize) {
        while self.frames.len() > depth {
            self.frames.pop();
        }
    }

    pub fn declare(
        &mut self,
        name: &str,
        ty: ValueType,
        mutability: Mutability,
        value: Value,
    ) -> Result<(), ErrorKind> {
        let top = self.frames.last_mut().expect("scope stack is never empty");
        if Rc::make_mut(top).bindings.contains_key(name) {
            return Err(ErrorKind::Redeclaration(name.to_string()));
        }
        Rc::make_mut(top)
            .bindings
            .insert(name.to_string(), Binding::Var(Variable { ty, mutability, value }));
        Ok(())
    }

    pub fn declare_alias(&mut self, name: &str, target: AliasTarget) -> Result<(), ErrorKind> {
        let top = self.frames.last_mut().expect("scope stack is never empty");
        if Rc::make_mut(top).bindings.contains_key(name) {
            return Err(ErrorKind::Redeclaration(name.to_string()));
        }
        Rc::make_mut(top).bindings.insert(name.to_string(), Binding::Alias(target));
        Ok(())
    }

    /// Walk outward from `from` (exclusive upper frame count), honoring
    /// barrier visibility and following classical alias chains.
    fn resolve_from(&self, name: &str, from: usize, hops: usize) -> Result<Resolved, ErrorKind> {
        if hops > 32 {
            return Err(ErrorKind::Type(format!("alias cycle through '{}'", name)));
        }
        let mut crossed_barrier = false;
        for i in (0..from).rev() {
            let frame = &self.frames[i];
            if let Some(binding) = frame.bindings.get(name) {
                match binding {
                    Binding::Var(var) => {
                        if crossed_barrier && var.mutability != Mutability::Const {
                            // Mutable bindings are invisible across a
                            // subroutine or gate barrier; keep walking.
                            continue;
                        }
                        return Ok(Resolved::Storage { frame: i, name: name.to_string() });
                    }
                    Binding::Alias(target) => {
                        if crossed_barrier {
                            continue;
                        }
                        match target {
                            AliasTarget::Qubits(indices) => {
                                return Ok(Resolved::Qubits(indices.clone()))
                            }
                            AliasTarget::Classical(base) => {
                                return self.resolve_from(base, i + 1, hops + 1);
                            }
                        }
                    }
                }
            }
            if frame.kind.is_barrier() {
                crossed_barrier = true;
            }
        }
        Err(ErrorKind::UnresolvedIdentifier(name.to_string()))
    }

    pub fn lookup(&self, name: &str) -> Result<Value, ErrorKind> {
        match self.resolve_from(name, self.frames.len(), 0)? {
            Resolved::Storage { frame, name } => {
                let var = match self.frames[frame].bindings.get(&name) {
                    Some(Binding::Var(var)) => var,
                    _ => unreachable!("resolve returned a non-variable binding"),
                };
                Ok(var.value.clone())
            }
            Resolved::Qubits(indices) => {
                if indices.len() == 1 {
                    Ok(Value::QubitRef(indices[0]))
                } else {
                    Ok(Value::QubitArray(indices))
                }
            }
        }
    }

    /// Variable metadata for assignment checks and compound updates.
    pub fn lookup_var(&self, name: &str) -> Result<(ValueType, Mutability, Value), ErrorKind> {
        match self.resolve_from(name, self.frames.len(), 0)? {
            Resolved::Storage { frame, name } => {
                let var = match self.frames[frame].bindings.get(&name) {
                    Some(Binding::Var(var)) => var,
                    _ => unreachable!("resolve returned a non-variable binding"),
                };
                Ok((var.ty.clone(), var.mutability, var.value.clone()))
            }
            Resolved::Qubits(_) => Err(ErrorKind::Type(format!(
                "'{}' names qubits, not classical storage",
                name
            ))),
        }
    }

    pub fn assign(&mut self, name: &str, value: Value) -> Result<(), ErrorKind> {
        match self.resolve_from(name, self.frames.len(), 0)? {
            Resolved::Storage { frame, name } => {
                let slot = &mut self.frames[frame];
                let existing = match slot.bindings.get(&name) {
                    Some(Binding::Var(var)) => var,
                    _ => unreachable!("resolve returned a non-variable binding"),
                };
                match existing.mutability {
                    Mutability::Const | Mutability::Input => {
                        return Err(ErrorKind::ConstMutation(name));
                    }
                    Mutability::Mutable | Mutability::Output => {}
                }
                let coerced = coerce_assign(&existing.ty, &value)?;
                let frame_mut = Rc::make_mut(slot);
                if let Some(Binding::Var(var)) = frame_mut.bindings.get_mut(&name) {
                    var.value = coerced;
                }
                Ok(())
            }
            Resolved::Qubits(_) => Err(ErrorKind::Type(format!(
                "cannot assign to qubit reference '{}'",
                name
            ))),
        }
    }

    /// Snapshot of the global frame's classical variables, for results.
    pub fn global_snapshot(&self) -> BTreeMap<String, Value> {
        let mut out = BTreeMap::new();
        for (name, binding) in &self.frames[0].bindings {
            if let Binding::Var(var) = binding {
                match var.value {
                    Value::QubitRef(_) | Value::QubitArray(_) => {}
                    _ => {
                        out.insert(name.clone(), var.value.clone());
                    }
                }
            }
        }
        out
    }
}

impl Default for ScopeStack {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn int_ty() -> ValueType {
        ValueType::Int { width: 32, signed: true }
    }

    #[test]
    fn test_lookup_walks_outward() {
        let mut scopes = ScopeStack::new();
        scopes
            .declare("x", int_ty(), Mutability::Mutable, Value::int(1))
            .unwrap();
        scopes.enter(FrameKind::Block);
        assert_eq!(scopes.lookup("x").unwrap(), Value::int(1));
    }

    #[test]
    fn test_redeclaration_in_same_frame() {
        let mut scopes = ScopeStack::new();
        scopes
            .declare("x", int_ty(), Mutability::Mutable, Value::int(1))
            .unwrap();
        let err = scopes.declare("x", int_ty(), Mutability::Mutable, Value::int(2));
        assert_eq!(err, Err(ErrorKind::Redeclaration("x".to_string())));
    }

    #[test]
    fn test_shadowing_in_inner_frame() {
        let mut scopes = ScopeStack::new();
        scopes
            .declare("x", int_ty(), Mutability::Mutable, Value::int(1))
            .unwrap();
        scopes.enter(FrameKind::Block);
        scopes
            .declare("x", int_ty(), Mutability::Mutable, Value::int(2))
            .unwrap();
        assert_eq!(scopes.lookup("x").unwrap(), Value::int(2));
        scopes.leave();
        assert_eq!(scopes.lookup("x").unwrap(), Value::int(1));
    }

    #[test]
    fn test_const_mutation_rejected() {
        let mut scopes = ScopeStack::new();
        scopes
            .declare("c", int_ty(), Mutability::Const, Value::int(4))
            .unwrap();
        let err = scopes.assign("c", Value::int(5));
        assert_eq!(err, Err(ErrorKind::ConstMutation("c".to_string())));
    }

    #[test]
    fn test_barrier_hides_mutable_globals() {
        let mut scopes = ScopeStack::new();
        scopes
            .declare("g", int_ty(), Mutability::Mutable, Value::int(1))
            .unwrap();
        scopes
            .declare("k", int_ty(), Mutability::Const, Value::int(7))
            .unwrap();
        scopes.enter(FrameKind::Function);
        // Mutable globals are invisible inside the subroutine.
        assert_eq!(
            scopes.lookup("g"),
            Err(ErrorKind::UnresolvedIdentifier("g".to_string()))
        );
        // Const bindings cross the barrier.
        assert_eq!(scopes.lookup("k").unwrap(), Value::int(7));
    }

    #[test]
    fn test_barrier_frame_own_bindings_visible() {
        let mut scopes = ScopeStack::new();
        scopes.enter(FrameKind::Function);
        scopes
            .declare("param", int_ty(), Mutability::Mutable, Value::int(3))
            .unwrap();
        assert_eq!(scopes.lookup("param").unwrap(), Value::int(3));
    }

    #[test]
    fn test_classical_alias_writes_propagate() {
        let mut scopes = ScopeStack::new();
        scopes
            .declare("base", int_ty(), Mutability::Mutable, Value::int(1))
            .unwrap();
        scopes
            .declare_alias("view", AliasTarget::Classical("base".to_string()))
            .unwrap();
        scopes.assign("view", Value::int(9)).unwrap();
        assert_eq!(scopes.lookup("base").unwrap(), Value::int(9));
        assert_eq!(scopes.lookup("view").unwrap(), Value::int(9));
    }

    #[test]
    fn test_qubit_alias_resolves_to_indices() {
        let mut scopes = ScopeStack::new();
        scopes
            .declare_alias("pair", AliasTarget::Qubits(vec![2, 3]))
            .unwrap();
        assert_eq!(scopes.lookup("pair").unwrap(), Value::QubitArray(vec![2, 3]));
    }

    #[test]
    fn test_cow_fork_isolation() {
        let mut a = ScopeStack::new();
        a.declare("x", int_ty(), Mutability::Mutable, Value::int(1))
            .unwrap();
        let mut b = a.clone();
        b.assign("x", Value::int(2)).unwrap();
        assert_eq!(a.lookup("x").unwrap(), Value::int(1));
        assert_eq!(b.lookup("x").unwrap(), Value::int(2));
    }
}
