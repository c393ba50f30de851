// src/parser/ast.rs
use std::fmt;

#[derive(Debug, Clone, PartialEq, Copy)]
pub struct Loc {
    pub line: usize,
    pub column: usize,
}

impl fmt::Display for Loc {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "[Line {}, Col {}]", self.line, self.column)
    }
}

/// A parsed program: optional version header plus top-level statements.
#[derive(Debug, Clone, PartialEq)]
pub struct Program {
    pub version: Option<(u32, Option<u32>)>,
    pub statements: Vec<Stmt>,
}

/// Declared classical types. Widths stay as expressions until the
/// interpreter resolves them (they may be const expressions).
#[derive(Debug, Clone, PartialEq)]
pub enum TypeSpec {
    Bit { width: Option<Box<Expr>> },
    Int { width: Option<Box<Expr>> },
    UInt { width: Option<Box<Expr>> },
    Float { width: Option<Box<Expr>> },
    Angle,
    Bool,
    Complex,
    Array { elem: Box<TypeSpec>, dims: Vec<Expr> },
    Qubit { size: Option<Box<Expr>> },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Mutability {
    Const,
    Mutable,
    Input,
    Output,
}

#[derive(Debug, Clone, PartialEq)]
pub struct FuncParam {
    pub ty: TypeSpec,
    pub name: String,
}

#[derive(Debug, Clone, PartialEq)]
pub struct SwitchCase {
    pub labels: Vec<Expr>,
    pub body: Vec<Stmt>,
}

/// Gate modifiers as written. `Ctrl`/`NegCtrl` carry the optional
/// control-count expression (default 1).
#[derive(Debug, Clone, PartialEq)]
pub enum GateModifier {
    Ctrl(Option<Expr>),
    NegCtrl(Option<Expr>),
    Inv,
    Pow(Expr),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AssignOp {
    Set,
    Add,
    Sub,
    Mul,
    Div,
    Mod,
    BitAnd,
    BitOr,
    BitXor,
    Shl,
    Shr,
}

#[derive(Debug, Clone, PartialEq)]
pub enum Stmt {
    Include {
        path: String,
        loc: Loc,
    },
    QubitDecl {
        name: String,
        size: Option<Expr>,
        loc: Loc,
    },
    ClassicalDecl {
        ty: TypeSpec,
        name: String,
        mutability: Mutability,
        init: Option<Expr>,
        loc: Loc,
    },
    AliasDecl {
        name: String,
        target: Expr,
        loc: Loc,
    },
    Assign {
        target: Expr,
        op: AssignOp,
        value: Expr,
        loc: Loc,
    },
    /// `b = measure q;` and `measure q -> b;`
    MeasureAssign {
        target: Expr,
        qubit: Expr,
        loc: Loc,
    },
    /// `measure q;` with the outcome discarded classically.
    MeasureStmt {
        qubit: Expr,
        loc: Loc,
    },
    Reset {
        qubit: Expr,
        loc: Loc,
    },
    GateCall {
        modifiers: Vec<GateModifier>,
        name: String,
        params: Vec<Expr>,
        qubits: Vec<Expr>,
        loc: Loc,
    },
    GateDef {
        name: String,
        params: Vec<String>,
        qubits: Vec<String>,
        body: Vec<Stmt>,
        loc: Loc,
    },
    FuncDef {
        name: String,
        params: Vec<FuncParam>,
        return_ty: Option<TypeSpec>,
        body: Vec<Stmt>,
        loc: Loc,
    },
    Return {
        value: Option<Expr>,
        loc: Loc,
    },
    If {
        cond: Expr,
        then_body: Vec<Stmt>,
        else_body: Option<Vec<Stmt>>,
        loc: Loc,
    },
    While {
        cond: Expr,
        body: Vec<Stmt>,
        loc: Loc,
    },
    ForRange {
        var_ty: TypeSpec,
        var: String,
        iterable: Expr,
        body: Vec<Stmt>,
        loc: Loc,
    },
    Switch {
        selector: Expr,
        cases: Vec<SwitchCase>,
        default: Option<Vec<Stmt>>,
        loc: Loc,
    },
    Break {
        loc: Loc,
    },
    Continue {
        loc: Loc,
    },
    Block {
        body: Vec<Stmt>,
        loc: Loc,
    },
    ExprStmt {
        expr: Expr,
        loc: Loc,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NamedConstant {
    Pi,
    Tau,
    Euler,
    Im,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UnaryOp {
    Neg,
    Not,
    BitNot,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BinaryOp {
    Add,
    Sub,
    Mul,
    Div,
    Mod,
    Pow,
    Eq,
    Ne,
    Lt,
    Gt,
    Le,
    Ge,
    LogicAnd,
    LogicOr,
    BitAnd,
    BitOr,
    BitXor,
    Shl,
    Shr,
    /// `++` register concatenation (alias targets only).
    Concat,
}

#[derive(Debug, Clone, PartialEq)]
pub enum Expr {
    IntLit {
        value: i64,
        loc: Loc,
    },
    FloatLit {
        value: f64,
        loc: Loc,
    },
    BoolLit {
        value: bool,
        loc: Loc,
    },
    BitstringLit {
        bits: String,
        loc: Loc,
    },
    StrLit {
        value: String,
        loc: Loc,
    },
    Constant {
        kind: NamedConstant,
        loc: Loc,
    },
    Ident {
        name: String,
        loc: Loc,
    },
    Index {
        base: Box<Expr>,
        index: Box<Expr>,
        loc: Loc,
    },
    /// `[start : end]` or `[start : step : end]`; end is inclusive.
    Range {
        start: Box<Expr>,
        step: Option<Box<Expr>>,
        end: Box<Expr>,
        loc: Loc,
    },
    ArrayLit {
        elems: Vec<Expr>,
        loc: Loc,
    },
    Unary {
        op: UnaryOp,
        expr: Box<Expr>,
        loc: Loc,
    },
    Binary {
        op: BinaryOp,
        lhs: Box<Expr>,
        rhs: Box<Expr>,
        loc: Loc,
    },
    Cast {
        ty: TypeSpec,
        expr: Box<Expr>,
        loc: Loc,
    },
    Call {
        name: String,
        args: Vec<Expr>,
        loc: Loc,
    },
    Ternary {
        cond: Box<Expr>,
        then_expr: Box<Expr>,
        else_expr: Box<Expr>,
        loc: Loc,
    },
}

impl Expr {
    pub fn loc(&self) -> Loc {
        match self {
            Expr::IntLit { loc, .. }
            | Expr::FloatLit { loc, .. }
            | Expr::BoolLit { loc, .. }
            | Expr::BitstringLit { loc, .. }
            | Expr::StrLit { loc, .. }
            | Expr::Constant { loc, .. }
            | Expr::Ident { loc, .. }
            | Expr::Index { loc, .. }
            | Expr::Range { loc, .. }
            | Expr::ArrayLit { loc, .. }
            | Expr::Unary { loc, .. }
            | Expr::Binary { loc, .. }
            | Expr::Cast { loc, .. }
            | Expr::Call { loc, .. }
            | Expr::Ternary { loc, .. } => *loc,
        }
    }
}

impl Stmt {
    pub fn loc(&self) -> Loc {
        match self {
            Stmt::Include { loc, .. }
            | Stmt::QubitDecl { loc, .. }
            | Stmt::ClassicalDecl { loc, .. }
            | Stmt::AliasDecl { loc, .. }
            | Stmt::Assign { loc, .. }
            | Stmt::MeasureAssign { loc, .. }
            | Stmt::MeasureStmt { loc, .. }
            | Stmt::Reset { loc, .. }
            | Stmt::GateCall { loc, .. }
            | Stmt::GateDef { loc, .. }
            | Stmt::FuncDef { loc, .. }
            | Stmt::Return { loc, .. }
            | Stmt::If { loc, .. }
            | Stmt::While { loc, .. }
            | Stmt::ForRange { loc, .. }
            | Stmt::Switch { loc, .. }
            | Stmt::Break { loc }
            | Stmt::Continue { loc }
            | Stmt::Block { loc, .. }
            | Stmt::ExprStmt { loc, .. } => *loc,
        }
    }
}
