// src/parser/mod.rs
pub mod ast;

use crate::error::ParseError;
use crate::lexer::token::{Token, TokenWithLocation};
use ast::*;

pub struct Parser {
    tokens: Vec<TokenWithLocation>,
    position: usize,
}

impl Parser {
    pub fn new(tokens: Vec<TokenWithLocation>) -> Self {
        Self { tokens, position: 0 }
    }

    pub fn parse(&mut self) -> Result<Program, ParseError> {
        let version = if self.check(&Token::OpenQasm) {
            Some(self.parse_version()?)
        } else {
            None
        };

        let mut statements = Vec::new();
        while !self.is_at_end() {
            self.parse_statement_into(&mut statements)?;
        }
        Ok(Program { version, statements })
    }

    fn parse_version(&mut self) -> Result<(u32, Option<u32>), ParseError> {
        self.expect(&Token::OpenQasm)?;
        let tok = self.advance_token();
        let version = match &tok.token {
            Token::IntLiteral(major) if *major >= 0 => (*major as u32, None),
            Token::FloatLiteral(v) if *v >= 0.0 => {
                // "3.0" arrives as one float literal; split it back apart.
                let major = v.trunc() as u32;
                let minor = ((v - v.trunc()) * 10.0).round() as u32;
                (major, Some(minor))
            }
            _ => {
                return Err(self.error_at(&tok, "expected version number after OPENQASM"));
            }
        };
        self.expect(&Token::Semicolon)?;
        Ok(version)
    }

    fn parse_statement_into(&mut self, out: &mut Vec<Stmt>) -> Result<(), ParseError> {
        let loc = self.current_loc();
        match &self.current().token {
            Token::Include => {
                self.advance();
                let tok = self.advance_token();
                let path = match &tok.token {
                    Token::StringLiteral(s) => s.clone(),
                    Token::BitstringLiteral(s) => s.clone(),
                    _ => return Err(self.error_at(&tok, "expected file path after include")),
                };
                self.expect(&Token::Semicolon)?;
                out.push(Stmt::Include { path, loc });
            }
            Token::Qubit => out.push(self.parse_qubit_decl(loc)?),
            Token::Const => {
                self.advance();
                self.parse_classical_decl(Mutability::Const, loc, out)?;
            }
            Token::Input => {
                self.advance();
                self.parse_classical_decl(Mutability::Input, loc, out)?;
            }
            Token::Output => {
                self.advance();
                self.parse_classical_decl(Mutability::Output, loc, out)?;
            }
            Token::Bit
            | Token::Int
            | Token::Uint
            | Token::Float
            | Token::Angle
            | Token::Bool
            | Token::Complex
            | Token::Array => {
                self.parse_classical_decl(Mutability::Mutable, loc, out)?;
            }
            Token::Gate => out.push(self.parse_gate_def(loc)?),
            Token::Def => out.push(self.parse_func_def(loc)?),
            Token::Let => out.push(self.parse_alias_decl(loc)?),
            Token::If => out.push(self.parse_if(loc)?),
            Token::While => out.push(self.parse_while(loc)?),
            Token::For => out.push(self.parse_for(loc)?),
            Token::Switch => out.push(self.parse_switch(loc)?),
            Token::Break => {
                self.advance();
                self.expect(&Token::Semicolon)?;
                out.push(Stmt::Break { loc });
            }
            Token::Continue => {
                self.advance();
                self.expect(&Token::Semicolon)?;
                out.push(Stmt::Continue { loc });
            }
            Token::Return => {
                self.advance();
                let value = if self.check(&Token::Semicolon) {
                    None
                } else {
                    Some(self.parse_expression()?)
                };
                self.expect(&Token::Semicolon)?;
                out.push(Stmt::Return { value, loc });
            }
            Token::Measure => {
                self.advance();
                let qubit = self.parse_postfix_operand()?;
                if self.match_token(&Token::Arrow) {
                    let target = self.parse_postfix_operand()?;
                    self.expect(&Token::Semicolon)?;
                    out.push(Stmt::MeasureAssign { target, qubit, loc });
                } else {
                    self.expect(&Token::Semicolon)?;
                    out.push(Stmt::MeasureStmt { qubit, loc });
                }
            }
            Token::Reset => {
                self.advance();
                let qubit = self.parse_postfix_operand()?;
                self.expect(&Token::Semicolon)?;
                out.push(Stmt::Reset { qubit, loc });
            }
            Token::Ctrl | Token::NegCtrl | Token::Inv | Token::Pow => {
                out.push(self.parse_gate_call(loc)?);
            }
            Token::LeftBrace => {
                self.advance();
                let body = self.parse_block_body()?;
                out.push(Stmt::Block { body, loc });
            }
            Token::Identifier(_) => self.parse_identifier_statement(loc, out)?,
            _ => {
                let tok = self.current().clone();
                return Err(self.error_at(&tok, "expected a statement"));
            }
        }
        Ok(())
    }

    fn parse_qubit_decl(&mut self, loc: Loc) -> Result<Stmt, ParseError> {
        self.expect(&Token::Qubit)?;
        let size = if self.match_token(&Token::LeftBracket) {
            let e = self.parse_expression()?;
            self.expect(&Token::RightBracket)?;
            Some(e)
        } else {
            None
        };
        let name = self.expect_identifier()?;
        self.expect(&Token::Semicolon)?;
        Ok(Stmt::QubitDecl { name, size, loc })
    }

    fn parse_classical_decl(
        &mut self,
        mutability: Mutability,
        loc: Loc,
        out: &mut Vec<Stmt>,
    ) -> Result<(), ParseError> {
        let ty = self.parse_type_spec()?;
        let name = self.expect_identifier()?;
        let init = if self.match_token(&Token::Equal) {
            if self.check(&Token::Measure) {
                // `bit b = measure q;` desugars to a declaration followed by a
                // measurement assignment into the fresh variable, in the same
                // scope as the declaration.
                self.advance();
                let qubit = self.parse_postfix_operand()?;
                self.expect(&Token::Semicolon)?;
                let target = Expr::Ident { name: name.clone(), loc };
                out.push(Stmt::ClassicalDecl { ty, name, mutability, init: None, loc });
                out.push(Stmt::MeasureAssign { target, qubit, loc });
                return Ok(());
            }
            Some(self.parse_expression()?)
        } else {
            None
        };
        self.expect(&Token::Semicolon)?;
        out.push(Stmt::ClassicalDecl { ty, name, mutability, init, loc });
        Ok(())
    }

    fn parse_type_spec(&mut self) -> Result<TypeSpec, ParseError> {
        let tok = self.advance_token();
        let spec = match &tok.token {
            Token::Bit => TypeSpec::Bit { width: self.parse_optional_width()? },
            Token::Int => TypeSpec::Int { width: self.parse_optional_width()? },
            Token::Uint => TypeSpec::UInt { width: self.parse_optional_width()? },
            Token::Float => TypeSpec::Float { width: self.parse_optional_width()? },
            Token::Angle => TypeSpec::Angle,
            Token::Bool => TypeSpec::Bool,
            Token::Complex => TypeSpec::Complex,
            Token::Qubit => {
                let size = self.parse_optional_width()?;
                TypeSpec::Qubit { size }
            }
            Token::Array => {
                self.expect(&Token::LeftBracket)?;
                let elem = Box::new(self.parse_type_spec()?);
                let mut dims = Vec::new();
                while self.match_token(&Token::Comma) {
                    dims.push(self.parse_expression()?);
                }
                self.expect(&Token::RightBracket)?;
                if dims.is_empty() {
                    return Err(self.error_at(&tok, "array type needs at least one dimension"));
                }
                TypeSpec::Array { elem, dims }
            }
            _ => return Err(self.error_at(&tok, "expected a type")),
        };
        Ok(spec)
    }

    fn parse_optional_width(&mut self) -> Result<Option<Box<Expr>>, ParseError> {
        if self.match_token(&Token::LeftBracket) {
            let e = self.parse_expression()?;
            self.expect(&Token::RightBracket)?;
            Ok(Some(Box::new(e)))
        } else {
            Ok(None)
        }
    }

    fn parse_gate_def(&mut self, loc: Loc) -> Result<Stmt, ParseError> {
        self.expect(&Token::Gate)?;
        let name = self.expect_identifier()?;
        let mut params = Vec::new();
        if self.match_token(&Token::LeftParen) {
            if !self.check(&Token::RightParen) {
                loop {
                    params.push(self.expect_identifier()?);
                    if !self.match_token(&Token::Comma) {
                        break;
                    }
                }
            }
            self.expect(&Token::RightParen)?;
        }
        let mut qubits = Vec::new();
        loop {
            qubits.push(self.expect_identifier()?);
            if !self.match_token(&Token::Comma) {
                break;
            }
        }
        self.expect(&Token::LeftBrace)?;
        let body = self.parse_block_body()?;
        Ok(Stmt::GateDef { name, params, qubits, body, loc })
    }

    fn parse_func_def(&mut self, loc: Loc) -> Result<Stmt, ParseError> {
        self.expect(&Token::Def)?;
        let name = self.expect_identifier()?;
        self.expect(&Token::LeftParen)?;
        let mut params = Vec::new();
        if !self.check(&Token::RightParen) {
            loop {
                let ty = self.parse_type_spec()?;
                let pname = self.expect_identifier()?;
                params.push(FuncParam { ty, name: pname });
                if !self.match_token(&Token::Comma) {
                    break;
                }
            }
        }
        self.expect(&Token::RightParen)?;
        let return_ty = if self.match_token(&Token::Arrow) {
            Some(self.parse_type_spec()?)
        } else {
            None
        };
        self.expect(&Token::LeftBrace)?;
        let body = self.parse_block_body()?;
        Ok(Stmt::FuncDef { name, params, return_ty, body, loc })
    }

    fn parse_alias_decl(&mut self, loc: Loc) -> Result<Stmt, ParseError> {
        self.expect(&Token::Let)?;
        let name = self.expect_identifier()?;
        self.expect(&Token::Equal)?;
        let target = self.parse_expression()?;
        self.expect(&Token::Semicolon)?;
        Ok(Stmt::AliasDecl { name, target, loc })
    }

    fn parse_if(&mut self, loc: Loc) -> Result<Stmt, ParseError> {
        self.expect(&Token::If)?;
        self.expect(&Token::LeftParen)?;
        let cond = self.parse_expression()?;
        self.expect(&Token::RightParen)?;
        let then_body = self.parse_body()?;
        let else_body = if self.match_token(&Token::Else) {
            Some(self.parse_body()?)
        } else {
            None
        };
        Ok(Stmt::If { cond, then_body, else_body, loc })
    }

    fn parse_while(&mut self, loc: Loc) -> Result<Stmt, ParseError> {
        self.expect(&Token::While)?;
        self.expect(&Token::LeftParen)?;
        let cond = self.parse_expression()?;
        self.expect(&Token::RightParen)?;
        let body = self.parse_body()?;
        Ok(Stmt::While { cond, body, loc })
    }

    fn parse_for(&mut self, loc: Loc) -> Result<Stmt, ParseError> {
        self.expect(&Token::For)?;
        let var_ty = self.parse_type_spec()?;
        let var = self.expect_identifier()?;
        self.expect(&Token::In)?;
        let iterable = if self.check(&Token::LeftBracket) {
            self.parse_bracketed_range()?
        } else {
            self.parse_expression()?
        };
        let body = self.parse_body()?;
        Ok(Stmt::ForRange { var_ty, var, iterable, body, loc })
    }

    fn parse_bracketed_range(&mut self) -> Result<Expr, ParseError> {
        let loc = self.current_loc();
        self.expect(&Token::LeftBracket)?;
        let first = self.parse_expression()?;
        self.expect(&Token::Colon)?;
        let second = self.parse_expression()?;
        let expr = if self.match_token(&Token::Colon) {
            let third = self.parse_expression()?;
            Expr::Range {
                start: Box::new(first),
                step: Some(Box::new(second)),
                end: Box::new(third),
                loc,
            }
        } else {
            Expr::Range { start: Box::new(first), step: None, end: Box::new(second), loc }
        };
        self.expect(&Token::RightBracket)?;
        Ok(expr)
    }

    fn parse_switch(&mut self, loc: Loc) -> Result<Stmt, ParseError> {
        self.expect(&Token::Switch)?;
        self.expect(&Token::LeftParen)?;
        let selector = self.parse_expression()?;
        self.expect(&Token::RightParen)?;
        self.expect(&Token::LeftBrace)?;
        let mut cases = Vec::new();
        let mut default = None;
        loop {
            if self.match_token(&Token::RightBrace) {
                break;
            }
            if self.match_token(&Token::Case) {
                let mut labels = vec![self.parse_expression()?];
                while self.match_token(&Token::Comma) {
                    labels.push(self.parse_expression()?);
                }
                self.expect(&Token::LeftBrace)?;
                let body = self.parse_block_body()?;
                cases.push(SwitchCase { labels, body });
            } else if self.match_token(&Token::Default) {
                if default.is_some() {
                    let tok = self.previous().clone();
                    return Err(self.error_at(&tok, "duplicate default arm in switch"));
                }
                self.expect(&Token::LeftBrace)?;
                default = Some(self.parse_block_body()?);
            } else {
                let tok = self.current().clone();
                return Err(self.error_at(&tok, "expected case, default, or '}' in switch"));
            }
        }
        Ok(Stmt::Switch { selector, cases, default, loc })
    }

    /// Body of a control-flow construct: a braced block or one statement.
    fn parse_body(&mut self) -> Result<Vec<Stmt>, ParseError> {
        if self.match_token(&Token::LeftBrace) {
            self.parse_block_body()
        } else {
            let mut body = Vec::new();
            self.parse_statement_into(&mut body)?;
            Ok(body)
        }
    }

    /// Statements up to (and consuming) a closing brace.
    fn parse_block_body(&mut self) -> Result<Vec<Stmt>, ParseError> {
        let mut body = Vec::new();
        while !self.check(&Token::RightBrace) {
            if self.is_at_end() {
                let tok = self.current().clone();
                return Err(self.error_at(&tok, "expected '}'"));
            }
            self.parse_statement_into(&mut body)?;
        }
        self.expect(&Token::RightBrace)?;
        Ok(body)
    }

    fn parse_gate_call(&mut self, loc: Loc) -> Result<Stmt, ParseError> {
        let mut modifiers = Vec::new();
        loop {
            match &self.current().token {
                Token::Ctrl => {
                    self.advance();
                    let count = self.parse_modifier_arg()?;
                    modifiers.push(GateModifier::Ctrl(count));
                }
                Token::NegCtrl => {
                    self.advance();
                    let count = self.parse_modifier_arg()?;
                    modifiers.push(GateModifier::NegCtrl(count));
                }
                Token::Inv => {
                    self.advance();
                    modifiers.push(GateModifier::Inv);
                }
                Token::Pow => {
                    self.advance();
                    self.expect(&Token::LeftParen)?;
                    let e = self.parse_expression()?;
                    self.expect(&Token::RightParen)?;
                    modifiers.push(GateModifier::Pow(e));
                }
                _ => break,
            }
            self.expect(&Token::At)?;
        }

        let name = self.expect_identifier()?;
        let mut params = Vec::new();
        if self.match_token(&Token::LeftParen) {
            if !self.check(&Token::RightParen) {
                loop {
                    params.push(self.parse_expression()?);
                    if !self.match_token(&Token::Comma) {
                        break;
                    }
                }
            }
            self.expect(&Token::RightParen)?;
        }
        let mut qubits = Vec::new();
        if !self.check(&Token::Semicolon) {
            loop {
                qubits.push(self.parse_postfix_operand()?);
                if !self.match_token(&Token::Comma) {
                    break;
                }
            }
        }
        self.expect(&Token::Semicolon)?;
        Ok(Stmt::GateCall { modifiers, name, params, qubits, loc })
    }

    fn parse_modifier_arg(&mut self) -> Result<Option<Expr>, ParseError> {
        if self.match_token(&Token::LeftParen) {
            let e = self.parse_expression()?;
            self.expect(&Token::RightParen)?;
            Ok(Some(e))
        } else {
            Ok(None)
        }
    }

    /// Statement starting with a bare identifier: assignment, measurement
    /// assignment, gate application, or expression statement.
    fn parse_identifier_statement(
        &mut self,
        loc: Loc,
        out: &mut Vec<Stmt>,
    ) -> Result<(), ParseError> {
        let expr = self.parse_postfix_operand()?;

        let assign_op = match &self.current().token {
            Token::Equal => Some(AssignOp::Set),
            Token::PlusEqual => Some(AssignOp::Add),
            Token::MinusEqual => Some(AssignOp::Sub),
            Token::StarEqual => Some(AssignOp::Mul),
            Token::SlashEqual => Some(AssignOp::Div),
            Token::PercentEqual => Some(AssignOp::Mod),
            Token::AmpEqual => Some(AssignOp::BitAnd),
            Token::PipeEqual => Some(AssignOp::BitOr),
            Token::CaretEqual => Some(AssignOp::BitXor),
            Token::LessLessEqual => Some(AssignOp::Shl),
            Token::GreaterGreaterEqual => Some(AssignOp::Shr),
            _ => None,
        };

        if let Some(op) = assign_op {
            self.advance();
            if op == AssignOp::Set && self.check(&Token::Measure) {
                self.advance();
                let qubit = self.parse_postfix_operand()?;
                self.expect(&Token::Semicolon)?;
                out.push(Stmt::MeasureAssign { target: expr, qubit, loc });
            } else {
                let value = self.parse_expression()?;
                self.expect(&Token::Semicolon)?;
                out.push(Stmt::Assign { target: expr, op, value, loc });
            }
            return Ok(());
        }

        if self.check(&Token::Semicolon) {
            self.advance();
            // `gphase(theta);` is a zero-operand gate application, not a call.
            if let Expr::Call { name, args, loc: call_loc } = &expr {
                if name == "gphase" {
                    out.push(Stmt::GateCall {
                        modifiers: vec![],
                        name: name.clone(),
                        params: args.clone(),
                        qubits: vec![],
                        loc: *call_loc,
                    });
                    return Ok(());
                }
            }
            out.push(Stmt::ExprStmt { expr, loc });
            return Ok(());
        }

        // Otherwise this is a gate application: the parsed expression names
        // the gate (possibly with parameters) and operands follow.
        let (name, params) = match expr {
            Expr::Ident { name, .. } => (name, vec![]),
            Expr::Call { name, args, .. } => (name, args),
            other => {
                return Err(ParseError::new(
                    "expected assignment, gate operands, or ';'".to_string(),
                    other.loc().line,
                    other.loc().column,
                ));
            }
        };
        let mut qubits = Vec::new();
        loop {
            qubits.push(self.parse_postfix_operand()?);
            if !self.match_token(&Token::Comma) {
                break;
            }
        }
        self.expect(&Token::Semicolon)?;
        out.push(Stmt::GateCall { modifiers: vec![], name, params, qubits, loc });
        Ok(())
    }

    // ---- Expressions ----

    pub fn parse_expression(&mut self) -> Result<Expr, ParseError> {
        self.parse_ternary()
    }

    fn parse_ternary(&mut self) -> Result<Expr, ParseError> {
        let cond = self.parse_logic_or()?;
        if self.check(&Token::Question) {
            let loc = self.current_loc();
            self.advance();
            let then_expr = self.parse_expression()?;
            self.expect(&Token::Colon)?;
            let else_expr = self.parse_ternary()?;
            return Ok(Expr::Ternary {
                cond: Box::new(cond),
                then_expr: Box::new(then_expr),
                else_expr: Box::new(else_expr),
                loc,
            });
        }
        Ok(cond)
    }

    fn parse_logic_or(&mut self) -> Result<Expr, ParseError> {
        let mut lhs = self.parse_logic_and()?;
        while self.check(&Token::PipePipe) {
            let loc = self.current_loc();
            self.advance();
            let rhs = self.parse_logic_and()?;
            lhs = Expr::Binary { op: BinaryOp::LogicOr, lhs: Box::new(lhs), rhs: Box::new(rhs), loc };
        }
        Ok(lhs)
    }

    fn parse_logic_and(&mut self) -> Result<Expr, ParseError> {
        let mut lhs = self.parse_bit_or()?;
        while self.check(&Token::AmpAmp) {
            let loc = self.current_loc();
            self.advance();
            let rhs = self.parse_bit_or()?;
            lhs = Expr::Binary { op: BinaryOp::LogicAnd, lhs: Box::new(lhs), rhs: Box::new(rhs), loc };
        }
        Ok(lhs)
    }

    fn parse_bit_or(&mut self) -> Result<Expr, ParseError> {
        let mut lhs = self.parse_bit_xor()?;
        while self.check(&Token::Pipe) {
            let loc = self.current_loc();
            self.advance();
            let rhs = self.parse_bit_xor()?;
            lhs = Expr::Binary { op: BinaryOp::BitOr, lhs: Box::new(lhs), rhs: Box::new(rhs), loc };
        }
        Ok(lhs)
    }

    fn parse_bit_xor(&mut self) -> Result<Expr, ParseError> {
        let mut lhs = self.parse_bit_and()?;
        while self.check(&Token::Caret) {
            let loc = self.current_loc();
            self.advance();
            let rhs = self.parse_bit_and()?;
            lhs = Expr::Binary { op: BinaryOp::BitXor, lhs: Box::new(lhs), rhs: Box::new(rhs), loc };
        }
        Ok(lhs)
    }

    fn parse_bit_and(&mut self) -> Result<Expr, ParseError> {
        let mut lhs = self.parse_equality()?;
        while self.check(&Token::Amp) {
            let loc = self.current_loc();
            self.advance();
            let rhs = self.parse_equality()?;
            lhs = Expr::Binary { op: BinaryOp::BitAnd, lhs: Box::new(lhs), rhs: Box::new(rhs), loc };
        }
        Ok(lhs)
    }

    fn parse_equality(&mut self) -> Result<Expr, ParseError> {
        let mut lhs = self.parse_comparison()?;
        loop {
            let op = match &self.current().token {
                Token::EqualEqual => BinaryOp::Eq,
                Token::BangEqual => BinaryOp::Ne,
                _ => break,
            };
            let loc = self.current_loc();
            self.advance();
            let rhs = self.parse_comparison()?;
            lhs = Expr::Binary { op, lhs: Box::new(lhs), rhs: Box::new(rhs), loc };
        }
        Ok(lhs)
    }

    fn parse_comparison(&mut self) -> Result<Expr, ParseError> {
        let mut lhs = self.parse_shift()?;
        loop {
            let op = match &self.current().token {
                Token::Less => BinaryOp::Lt,
                Token::Greater => BinaryOp::Gt,
                Token::LessEqual => BinaryOp::Le,
                Token::GreaterEqual => BinaryOp::Ge,
                _ => break,
            };
            let loc = self.current_loc();
            self.advance();
            let rhs = self.parse_shift()?;
            lhs = Expr::Binary { op, lhs: Box::new(lhs), rhs: Box::new(rhs), loc };
        }
        Ok(lhs)
    }

    fn parse_shift(&mut self) -> Result<Expr, ParseError> {
        let mut lhs = self.parse_additive()?;
        loop {
            let op = match &self.current().token {
                Token::LessLess => BinaryOp::Shl,
                Token::GreaterGreater => BinaryOp::Shr,
                _ => break,
            };
            let loc = self.current_loc();
            self.advance();
            let rhs = self.parse_additive()?;
            lhs = Expr::Binary { op, lhs: Box::new(lhs), rhs: Box::new(rhs), loc };
        }
        Ok(lhs)
    }

    fn parse_additive(&mut self) -> Result<Expr, ParseError> {
        let mut lhs = self.parse_multiplicative()?;
        loop {
            let op = match &self.current().token {
                Token::Plus => BinaryOp::Add,
                Token::Minus => BinaryOp::Sub,
                Token::PlusPlus => BinaryOp::Concat,
                _ => break,
            };
            let loc = self.current_loc();
            self.advance();
            let rhs = self.parse_multiplicative()?;
            lhs = Expr::Binary { op, lhs: Box::new(lhs), rhs: Box::new(rhs), loc };
        }
        Ok(lhs)
    }

    fn parse_multiplicative(&mut self) -> Result<Expr, ParseError> {
        let mut lhs = self.parse_unary()?;
        loop {
            let op = match &self.current().token {
                Token::Star => BinaryOp::Mul,
                Token::Slash => BinaryOp::Div,
                Token::Percent => BinaryOp::Mod,
                _ => break,
            };
            let loc = self.current_loc();
            self.advance();
            let rhs = self.parse_unary()?;
            lhs = Expr::Binary { op, lhs: Box::new(lhs), rhs: Box::new(rhs), loc };
        }
        Ok(lhs)
    }

    fn parse_unary(&mut self) -> Result<Expr, ParseError> {
        let op = match &self.current().token {
            Token::Minus => Some(UnaryOp::Neg),
            Token::Bang => Some(UnaryOp::Not),
            Token::Tilde => Some(UnaryOp::BitNot),
            _ => None,
        };
        if let Some(op) = op {
            let loc = self.current_loc();
            self.advance();
            let expr = self.parse_unary()?;
            return Ok(Expr::Unary { op, expr: Box::new(expr), loc });
        }
        self.parse_power()
    }

    fn parse_power(&mut self) -> Result<Expr, ParseError> {
        let base = self.parse_postfix_operand()?;
        if self.check(&Token::StarStar) {
            let loc = self.current_loc();
            self.advance();
            let rhs = self.parse_unary()?;
            return Ok(Expr::Binary {
                op: BinaryOp::Pow,
                lhs: Box::new(base),
                rhs: Box::new(rhs),
                loc,
            });
        }
        Ok(base)
    }

    /// Primary expression followed by call and index suffixes. Also used
    /// for gate/measure operands and assignment targets.
    fn parse_postfix_operand(&mut self) -> Result<Expr, ParseError> {
        let mut expr = self.parse_primary()?;
        loop {
            if self.check(&Token::LeftParen) {
                let name = match &expr {
                    Expr::Ident { name, .. } => name.clone(),
                    _ => break,
                };
                let loc = self.current_loc();
                self.advance();
                let mut args = Vec::new();
                if !self.check(&Token::RightParen) {
                    loop {
                        args.push(self.parse_expression()?);
                        if !self.match_token(&Token::Comma) {
                            break;
                        }
                    }
                }
                self.expect(&Token::RightParen)?;
                expr = Expr::Call { name, args, loc };
            } else if self.check(&Token::LeftBracket) {
                let loc = self.current_loc();
                self.advance();
                let first = self.parse_expression()?;
                let index = if self.match_token(&Token::Colon) {
                    let second = self.parse_expression()?;
                    if self.match_token(&Token::Colon) {
                        let third = self.parse_expression()?;
                        Expr::Range {
                            start: Box::new(first),
                            step: Some(Box::new(second)),
                            end: Box::new(third),
                            loc,
                        }
                    } else {
                        Expr::Range {
                            start: Box::new(first),
                            step: None,
                            end: Box::new(second),
                            loc,
                        }
                    }
                } else {
                    first
                };
                self.expect(&Token::RightBracket)?;
                expr = Expr::Index { base: Box::new(expr), index: Box::new(index), loc };
            } else {
                break;
            }
        }
        Ok(expr)
    }

    fn parse_primary(&mut self) -> Result<Expr, ParseError> {
        let loc = self.current_loc();
        let tok = self.advance_token();
        let expr = match &tok.token {
            Token::IntLiteral(v) => Expr::IntLit { value: *v, loc },
            Token::FloatLiteral(v) => Expr::FloatLit { value: *v, loc },
            Token::True => Expr::BoolLit { value: true, loc },
            Token::False => Expr::BoolLit { value: false, loc },
            Token::BitstringLiteral(bits) => Expr::BitstringLit { bits: bits.clone(), loc },
            Token::StringLiteral(s) => Expr::StrLit { value: s.clone(), loc },
            Token::Pi => Expr::Constant { kind: NamedConstant::Pi, loc },
            Token::Tau => Expr::Constant { kind: NamedConstant::Tau, loc },
            Token::Euler => Expr::Constant { kind: NamedConstant::Euler, loc },
            Token::Im => Expr::Constant { kind: NamedConstant::Im, loc },
            Token::Identifier(name) => Expr::Ident { name: name.clone(), loc },
            // `pow` doubles as a gate modifier keyword and the classical
            // two-argument built-in; in expression position it is a callee.
            Token::Pow => Expr::Ident { name: "pow".to_string(), loc },
            Token::LeftParen => {
                let inner = self.parse_expression()?;
                self.expect(&Token::RightParen)?;
                inner
            }
            Token::LeftBrace => {
                let mut elems = Vec::new();
                if !self.check(&Token::RightBrace) {
                    loop {
                        elems.push(self.parse_expression()?);
                        if !self.match_token(&Token::Comma) {
                            break;
                        }
                    }
                }
                self.expect(&Token::RightBrace)?;
                Expr::ArrayLit { elems, loc }
            }
            Token::Bit
            | Token::Int
            | Token::Uint
            | Token::Float
            | Token::Angle
            | Token::Bool
            | Token::Complex => {
                // Cast expression: type(value), e.g. `int[8](b)`.
                self.position -= 1;
                let ty = self.parse_type_spec()?;
                self.expect(&Token::LeftParen)?;
                let inner = self.parse_expression()?;
                self.expect(&Token::RightParen)?;
                Expr::Cast { ty, expr: Box::new(inner), loc }
            }
            _ => return Err(self.error_at(&tok, "expected an expression")),
        };
        Ok(expr)
    }

    // ---- Token helpers ----

    fn current(&self) -> &TokenWithLocation {
        &self.tokens[self.position.min(self.tokens.len() - 1)]
    }

    fn previous(&self) -> &TokenWithLocation {
        &self.tokens[self.position.saturating_sub(1)]
    }

    fn current_loc(&self) -> Loc {
        let tok = self.current();
        Loc { line: tok.line, column: tok.column }
    }

    fn advance(&mut self) {
        if self.position < self.tokens.len() - 1 {
            self.position += 1;
        }
    }

    fn advance_token(&mut self) -> TokenWithLocation {
        let tok = self.current().clone();
        self.advance();
        tok
    }

    fn check(&self, token: &Token) -> bool {
        &self.current().token == token
    }

    fn match_token(&mut self, token: &Token) -> bool {
        if self.check(token) {
            self.advance();
            true
        } else {
            false
        }
    }

    fn expect(&mut self, token: &Token) -> Result<(), ParseError> {
        if self.match_token(token) {
            Ok(())
        } else {
            let tok = self.current().clone();
            Err(self.error_at(&tok, &format!("expected {:?}, found {:?}", token, tok.token)))
        }
    }

    fn expect_identifier(&mut self) -> Result<String, ParseError> {
        let tok = self.advance_token();
        match &tok.token {
            Token::Identifier(name) => Ok(name.clone()),
            _ => Err(self.error_at(&tok, &format!("expected identifier, found {:?}", tok.token))),
        }
    }

    fn error_at(&self, tok: &TokenWithLocation, message: &str) -> ParseError {
        ParseError::new(message.to_string(), tok.line, tok.column)
    }

    fn is_at_end(&self) -> bool {
        self.current().token == Token::Eof
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::lexer::Lexer;

    fn parse(src: &str) -> Program {
        let tokens = Lexer::new(src).tokenize().unwrap();
        Parser::new(tokens).parse().unwrap()
    }

    #[test]
    fn test_version_header() {
        let prog = parse("OPENQASM 3.0;\nqubit q;");
        assert_eq!(prog.version, Some((3, Some(0))));
        assert_eq!(prog.statements.len(), 1);
    }

    #[test]
    fn test_qubit_and_classical_decls() {
        let prog = parse("qubit[2] q; bit[2] b; const int[32] n = 4; input float theta;");
        assert!(matches!(&prog.statements[0], Stmt::QubitDecl { name, .. } if name == "q"));
        assert!(matches!(
            &prog.statements[2],
            Stmt::ClassicalDecl { mutability: Mutability::Const, .. }
        ));
        assert!(matches!(
            &prog.statements[3],
            Stmt::ClassicalDecl { mutability: Mutability::Input, init: None, .. }
        ));
    }

    #[test]
    fn test_gate_call_forms() {
        let prog = parse("h q[0]; cnot q[0], q[1]; rx(pi / 2) q[0]; gphase(0.5);");
        match &prog.statements[0] {
            Stmt::GateCall { name, qubits, .. } => {
                assert_eq!(name, "h");
                assert_eq!(qubits.len(), 1);
            }
            other => panic!("expected gate call, got {:?}", other),
        }
        match &prog.statements[2] {
            Stmt::GateCall { name, params, .. } => {
                assert_eq!(name, "rx");
                assert_eq!(params.len(), 1);
            }
            other => panic!("expected gate call, got {:?}", other),
        }
        match &prog.statements[3] {
            Stmt::GateCall { name, qubits, params, .. } => {
                assert_eq!(name, "gphase");
                assert!(qubits.is_empty());
                assert_eq!(params.len(), 1);
            }
            other => panic!("expected gphase call, got {:?}", other),
        }
    }

    #[test]
    fn test_modifier_chain() {
        let prog = parse("ctrl @ negctrl(2) @ inv @ pow(0.5) @ x q[0], q[1], q[2], q[3];");
        match &prog.statements[0] {
            Stmt::GateCall { modifiers, name, qubits, .. } => {
                assert_eq!(name, "x");
                assert_eq!(qubits.len(), 4);
                assert_eq!(modifiers.len(), 4);
                assert!(matches!(modifiers[0], GateModifier::Ctrl(None)));
                assert!(matches!(modifiers[1], GateModifier::NegCtrl(Some(_))));
                assert!(matches!(modifiers[2], GateModifier::Inv));
                assert!(matches!(modifiers[3], GateModifier::Pow(_)));
            }
            other => panic!("expected gate call, got {:?}", other),
        }
    }

    #[test]
    fn test_measure_forms() {
        let prog = parse("b = measure q[0]; measure q[1] -> b; measure q[2]; bit c = measure q[0];");
        assert!(matches!(&prog.statements[0], Stmt::MeasureAssign { .. }));
        assert!(matches!(&prog.statements[1], Stmt::MeasureAssign { .. }));
        assert!(matches!(&prog.statements[2], Stmt::MeasureStmt { .. }));
        // `bit c = measure q[0];` desugars to two sibling statements.
        assert!(matches!(&prog.statements[3], Stmt::ClassicalDecl { init: None, .. }));
        assert!(matches!(&prog.statements[4], Stmt::MeasureAssign { .. }));
    }

    #[test]
    fn test_control_flow() {
        let prog = parse(
            "if (b == 1) x q[0]; else { z q[0]; } while (i < 3) { i += 1; } \
             for uint i in [0:2:8] { h q[0]; } break_check();",
        );
        assert!(matches!(&prog.statements[0], Stmt::If { else_body: Some(_), .. }));
        assert!(matches!(&prog.statements[1], Stmt::While { .. }));
        match &prog.statements[2] {
            Stmt::ForRange { iterable: Expr::Range { step: Some(_), .. }, .. } => {}
            other => panic!("expected ranged for, got {:?}", other),
        }
    }

    #[test]
    fn test_switch_statement() {
        let prog = parse(
            "switch (x) { case 0, 1 { y = 1; } case 2 { y = 2; } default { y = 3; } }",
        );
        match &prog.statements[0] {
            Stmt::Switch { cases, default, .. } => {
                assert_eq!(cases.len(), 2);
                assert_eq!(cases[0].labels.len(), 2);
                assert!(default.is_some());
            }
            other => panic!("expected switch, got {:?}", other),
        }
    }

    #[test]
    fn test_definitions() {
        let prog = parse(
            "gate bell a, b { h a; cnot a, b; } \
             def parity(bit[2] b) -> int { return int(b[0]) + int(b[1]); }",
        );
        match &prog.statements[0] {
            Stmt::GateDef { name, qubits, body, .. } => {
                assert_eq!(name, "bell");
                assert_eq!(qubits.len(), 2);
                assert_eq!(body.len(), 2);
            }
            other => panic!("expected gate def, got {:?}", other),
        }
        match &prog.statements[1] {
            Stmt::FuncDef { name, params, return_ty, .. } => {
                assert_eq!(name, "parity");
                assert_eq!(params.len(), 1);
                assert!(return_ty.is_some());
            }
            other => panic!("expected func def, got {:?}", other),
        }
    }

    #[test]
    fn test_alias_with_slice_and_concat() {
        let prog = parse("let pair = q[0:1] ++ r[2];");
        match &prog.statements[0] {
            Stmt::AliasDecl { name, target, .. } => {
                assert_eq!(name, "pair");
                assert!(matches!(target, Expr::Binary { op: BinaryOp::Concat, .. }));
            }
            other => panic!("expected alias, got {:?}", other),
        }
    }

    #[test]
    fn test_expression_precedence() {
        let prog = parse("x = 1 + 2 * 3 ** 2;");
        match &prog.statements[0] {
            Stmt::Assign { value, .. } => match value {
                Expr::Binary { op: BinaryOp::Add, rhs, .. } => {
                    assert!(matches!(**rhs, Expr::Binary { op: BinaryOp::Mul, .. }));
                }
                other => panic!("expected addition at the top, got {:?}", other),
            },
            other => panic!("expected assignment, got {:?}", other),
        }
    }

    #[test]
    fn test_cast_and_ternary() {
        let prog = parse("y = b == 1 ? int[8](x) : 0;");
        match &prog.statements[0] {
            Stmt::Assign { value: Expr::Ternary { then_expr, .. }, .. } => {
                assert!(matches!(**then_expr, Expr::Cast { .. }));
            }
            other => panic!("expected ternary assignment, got {:?}", other),
        }
    }

    #[test]
    fn test_pow_callable_in_expression_position() {
        let prog = parse("x = pow(2, 3); pow(2) @ x q[0];");
        match &prog.statements[0] {
            Stmt::Assign { value: Expr::Call { name, args, .. }, .. } => {
                assert_eq!(name, "pow");
                assert_eq!(args.len(), 2);
            }
            other => panic!("expected pow call, got {:?}", other),
        }
        // The modifier spelling still parses as a modifier.
        match &prog.statements[1] {
            Stmt::GateCall { modifiers, .. } => {
                assert!(matches!(modifiers[0], GateModifier::Pow(_)));
            }
            other => panic!("expected modified gate call, got {:?}", other),
        }
    }

    #[test]
    fn test_compound_assignment() {
        let prog = parse("count += 1; mask <<= 2;");
        assert!(matches!(&prog.statements[0], Stmt::Assign { op: AssignOp::Add, .. }));
        assert!(matches!(&prog.statements[1], Stmt::Assign { op: AssignOp::Shl, .. }));
    }

    #[test]
    fn test_parse_error_has_location() {
        let tokens = Lexer::new("qubit[2 q;").tokenize().unwrap();
        let err = Parser::new(tokens).parse().unwrap_err();
        assert_eq!(err.line, 1);
        assert!(err.message.contains("expected"));
    }
}
