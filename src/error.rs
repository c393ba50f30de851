// src/error.rs
use crate::parser::ast::Loc;
use std::fmt;
use thiserror::Error;

/// Identifier of one execution path in the branched population.
pub type PathId = usize;

/// Source-level failure. Fatal to the whole run: no paths exist yet.
#[derive(Debug, Clone, PartialEq, Error)]
#[error("parse error at [Line {line}, Col {column}]: {message}")]
pub struct ParseError {
    pub message: String,
    pub line: usize,
    pub column: usize,
}

impl ParseError {
    pub fn new(message: String, line: usize, column: usize) -> Self {
        Self { message, line, column }
    }
}

/// Classification of everything that can go wrong after parsing.
///
/// Most kinds are fatal only to the path that tripped them; the run-fatal
/// ones unwind the whole interpretation (see [`ErrorKind::is_run_fatal`]).
#[derive(Debug, Clone, PartialEq, Error)]
pub enum ErrorKind {
    #[error("type error: {0}")]
    Type(String),
    #[error("width mismatch: {0}")]
    WidthMismatch(String),
    #[error("arity mismatch: {0}")]
    ArityMismatch(String),
    #[error("unresolved identifier '{0}'")]
    UnresolvedIdentifier(String),
    #[error("redeclaration of '{0}'")]
    Redeclaration(String),
    #[error("cannot assign to constant '{0}'")]
    ConstMutation(String),
    #[error("index out of bounds: {0}")]
    IndexOutOfBounds(String),
    #[error("division by zero")]
    DivisionByZero,
    #[error("qubit reuse: {0}")]
    QubitReuse(String),
    #[error("missing input '{0}'")]
    MissingInput(String),
    #[error("amplitude engine failure: {0}")]
    AdapterFailure(String),
}

impl ErrorKind {
    /// Run-fatal errors unwind the whole interpretation; everything else
    /// terminates only the offending path while siblings continue.
    pub fn is_run_fatal(&self) -> bool {
        matches!(self, ErrorKind::MissingInput(_) | ErrorKind::AdapterFailure(_))
    }
}

/// A structured runtime failure: the kind, the offending source location
/// when one is known, and the path that tripped it.
#[derive(Debug, Clone, PartialEq)]
pub struct RuntimeError {
    pub kind: ErrorKind,
    pub loc: Option<Loc>,
    pub path: Option<PathId>,
}

impl RuntimeError {
    pub fn new(kind: ErrorKind) -> Self {
        Self { kind, loc: None, path: None }
    }

    pub fn at(kind: ErrorKind, loc: Loc) -> Self {
        Self { kind, loc: Some(loc), path: None }
    }

    pub fn on_path(mut self, path: PathId) -> Self {
        self.path = Some(path);
        self
    }

    pub fn is_run_fatal(&self) -> bool {
        self.kind.is_run_fatal()
    }
}

impl fmt::Display for RuntimeError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.kind)?;
        if let Some(loc) = &self.loc {
            write!(f, " at {}", loc)?;
        }
        if let Some(path) = self.path {
            write!(f, " on path {}", path)?;
        }
        Ok(())
    }
}

impl std::error::Error for RuntimeError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        Some(&self.kind)
    }
}

/// Either failure mode of running source text end to end.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum EngineError {
    #[error(transparent)]
    Parse(#[from] ParseError),
    #[error(transparent)]
    Runtime(#[from] RuntimeError),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fatality_classification() {
        assert!(ErrorKind::MissingInput("x".into()).is_run_fatal());
        assert!(ErrorKind::AdapterFailure("nan".into()).is_run_fatal());
        assert!(!ErrorKind::DivisionByZero.is_run_fatal());
        assert!(!ErrorKind::ConstMutation("c".into()).is_run_fatal());
    }

    #[test]
    fn test_display_carries_location_and_path() {
        let err = RuntimeError::at(
            ErrorKind::UnresolvedIdentifier("foo".into()),
            Loc { line: 3, column: 7 },
        )
        .on_path(2);
        let text = err.to_string();
        assert!(text.contains("foo"));
        assert!(text.contains("[Line 3, Col 7]"));
        assert!(text.contains("path 2"));
    }
}
