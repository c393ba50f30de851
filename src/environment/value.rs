// src/environment/value.rs
use crate::error::ErrorKind;
use crate::parser::ast::BinaryOp;
use num_complex::Complex64;
use serde::Serialize;
use std::fmt;

const TWO_PI: f64 = std::f64::consts::TAU;

/// Runtime type of a classical or quantum value, with widths resolved.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub enum ValueType {
    Bool,
    Bit,
    BitRegister(usize),
    Int { width: usize, signed: bool },
    Float,
    Complex,
    Angle,
    Array(Box<ValueType>, Vec<usize>),
    Qubit,
    QubitArray(usize),
    Str,
}

impl ValueType {
    pub fn name(&self) -> String {
        match self {
            ValueType::Bool => "bool".to_string(),
            ValueType::Bit => "bit".to_string(),
            ValueType::BitRegister(n) => format!("bit[{}]", n),
            ValueType::Int { width, signed: true } => format!("int[{}]", width),
            ValueType::Int { width, signed: false } => format!("uint[{}]", width),
            ValueType::Float => "float".to_string(),
            ValueType::Complex => "complex".to_string(),
            ValueType::Angle => "angle".to_string(),
            ValueType::Array(elem, dims) => format!("array[{}; {:?}]", elem.name(), dims),
            ValueType::Qubit => "qubit".to_string(),
            ValueType::QubitArray(n) => format!("qubit[{}]", n),
            ValueType::Str => "string".to_string(),
        }
    }
}

/// A runtime value. Bit registers pack their bits LSB-first into `bits`;
/// `int[w]` values are kept normalized to two's complement at width `w`.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub enum Value {
    Bool(bool),
    Bit(u8),
    BitRegister { width: usize, bits: u64 },
    Int { width: usize, signed: bool, value: i64 },
    Float(f64),
    Complex(Complex64),
    Angle(f64),
    Array { elem: ValueType, values: Vec<Value> },
    QubitRef(usize),
    QubitArray(Vec<usize>),
    Str(String),
}

impl Value {
    pub fn type_name(&self) -> String {
        self.value_type().name()
    }

    pub fn value_type(&self) -> ValueType {
        match self {
            Value::Bool(_) => ValueType::Bool,
            Value::Bit(_) => ValueType::Bit,
            Value::BitRegister { width, .. } => ValueType::BitRegister(*width),
            Value::Int { width, signed, .. } => {
                ValueType::Int { width: *width, signed: *signed }
            }
            Value::Float(_) => ValueType::Float,
            Value::Complex(_) => ValueType::Complex,
            Value::Angle(_) => ValueType::Angle,
            Value::Array { elem, values } => {
                ValueType::Array(Box::new(elem.clone()), vec![values.len()])
            }
            Value::QubitRef(_) => ValueType::Qubit,
            Value::QubitArray(indices) => ValueType::QubitArray(indices.len()),
            Value::Str(_) => ValueType::Str,
        }
    }

    pub fn int(value: i64) -> Self {
        Value::Int { width: 32, signed: true, value: wrap_int(32, true, value as i128) }
    }

    pub fn uint(width: usize, value: u64) -> Self {
        Value::Int { width, signed: false, value: wrap_int(width, false, value as i128) }
    }

    /// Truthiness for guards. The boolean coercion of a bit register is
    /// the OR of its bits.
    pub fn truthy(&self) -> Result<bool, ErrorKind> {
        match self {
            Value::Bool(b) => Ok(*b),
            Value::Bit(b) => Ok(*b != 0),
            Value::BitRegister { bits, .. } => Ok(*bits != 0),
            Value::Int { value, .. } => Ok(*value != 0),
            other => Err(ErrorKind::Type(format!(
                "value of type {} cannot be used as a condition",
                other.type_name()
            ))),
        }
    }

    pub fn as_float(&self) -> Result<f64, ErrorKind> {
        match self {
            Value::Float(f) => Ok(*f),
            Value::Angle(a) => Ok(*a),
            Value::Int { .. } | Value::Bit(_) | Value::BitRegister { .. } => {
                Ok(self.as_i128()? as f64)
            }
            other => Err(ErrorKind::Type(format!(
                "expected a number, got {}",
                other.type_name()
            ))),
        }
    }

    pub fn as_i128(&self) -> Result<i128, ErrorKind> {
        match self {
            Value::Bit(b) => Ok(*b as i128),
            Value::BitRegister { bits, .. } => Ok(*bits as i128),
            Value::Int { signed: true, value, .. } => Ok(*value as i128),
            Value::Int { signed: false, width, value } => {
                Ok((*value as u64 & width_mask(*width)) as i128)
            }
            Value::Bool(b) => Ok(*b as i128),
            other => Err(ErrorKind::Type(format!(
                "expected an integer, got {}",
                other.type_name()
            ))),
        }
    }

    pub fn as_index(&self) -> Result<i64, ErrorKind> {
        Ok(self.as_i128()? as i64)
    }

    fn is_integerish(&self) -> bool {
        matches!(
            self,
            Value::Int { .. } | Value::Bit(_) | Value::BitRegister { .. } | Value::Bool(_)
        )
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Value::Bool(b) => write!(f, "{}", b),
            Value::Bit(b) => write!(f, "{}", b),
            Value::BitRegister { width, bits } => {
                write!(f, "\"")?;
                for i in (0..*width).rev() {
                    write!(f, "{}", (bits >> i) & 1)?;
                }
                write!(f, "\"")
            }
            Value::Int { signed: true, value, .. } => write!(f, "{}", value),
            Value::Int { signed: false, width, value } => {
                write!(f, "{}", *value as u64 & width_mask(*width))
            }
            Value::Float(v) => write!(f, "{}", v),
            Value::Complex(c) => write!(f, "{}+{}i", c.re, c.im),
            Value::Angle(a) => write!(f, "{}", a),
            Value::Array { values, .. } => {
                let parts: Vec<String> = values.iter().map(|v| v.to_string()).collect();
                write!(f, "[{}]", parts.join(", "))
            }
            Value::QubitRef(i) => write!(f, "<qubit {}>", i),
            Value::QubitArray(is) => write!(f, "<qubits {:?}>", is),
            Value::Str(s) => write!(f, "{}", s),
        }
    }
}

pub fn width_mask(width: usize) -> u64 {
    if width >= 64 {
        u64::MAX
    } else {
        (1u64 << width) - 1
    }
}

/// Wrap a raw integer into two's complement at `width`, sign-extending
/// for signed types.
pub fn wrap_int(width: usize, signed: bool, raw: i128) -> i64 {
    let bits = (raw as u64) & width_mask(width);
    if signed && width < 64 && (bits >> (width - 1)) & 1 == 1 {
        (bits | !width_mask(width)) as i64
    } else {
        bits as i64
    }
}

fn int_width(v: &Value) -> usize {
    match v {
        Value::Int { width, .. } => *width,
        Value::BitRegister { width, .. } => *width,
        _ => 32,
    }
}

fn int_signed(v: &Value) -> bool {
    matches!(v, Value::Int { signed: true, .. })
}

fn angles_equal(a: f64, b: f64) -> bool {
    let d = (a - b).rem_euclid(TWO_PI);
    d.abs() < 1e-12 || (d - TWO_PI).abs() < 1e-12
}

/// Apply a binary operator with the promotion lattice:
/// complex > float/angle > int, and integer division promotes to float.
pub fn apply_binary(op: BinaryOp, lhs: &Value, rhs: &Value) -> Result<Value, ErrorKind> {
    use BinaryOp::*;
    match op {
        Add | Sub | Mul | Div | Mod | Pow => arith(op, lhs, rhs),
        Eq | Ne | Lt | Gt | Le | Ge => compare(op, lhs, rhs),
        LogicAnd => Ok(Value::Bool(lhs.truthy()? && rhs.truthy()?)),
        LogicOr => Ok(Value::Bool(lhs.truthy()? || rhs.truthy()?)),
        BitAnd | BitOr | BitXor => bitwise(op, lhs, rhs),
        Shl | Shr => shift(op, lhs, rhs),
        Concat => Err(ErrorKind::Type(
            "'++' concatenation is only valid in alias targets".to_string(),
        )),
    }
}

fn arith(op: BinaryOp, lhs: &Value, rhs: &Value) -> Result<Value, ErrorKind> {
    use BinaryOp::*;

    if matches!(lhs, Value::Complex(_)) || matches!(rhs, Value::Complex(_)) {
        let a = as_complex(lhs)?;
        let b = as_complex(rhs)?;
        let out = match op {
            Add => a + b,
            Sub => a - b,
            Mul => a * b,
            Div => {
                if b.norm_sqr() == 0.0 {
                    return Err(ErrorKind::DivisionByZero);
                }
                a / b
            }
            Pow => a.powc(b),
            Mod => {
                return Err(ErrorKind::Type(
                    "'%' is not defined for complex operands".to_string(),
                ))
            }
            _ => unreachable!(),
        };
        return Ok(Value::Complex(out));
    }

    let float_side = matches!(lhs, Value::Float(_) | Value::Angle(_))
        || matches!(rhs, Value::Float(_) | Value::Angle(_));

    // Integer division yields float; everything else stays integral.
    if lhs.is_integerish() && rhs.is_integerish() && !float_side {
        let a = lhs.as_i128()?;
        let b = rhs.as_i128()?;
        let width = int_width(lhs).max(int_width(rhs));
        // Bit and bool operands promote to plain signed int; otherwise the
        // result is signed when either int operand is.
        let signed = if matches!(lhs, Value::Int { .. }) || matches!(rhs, Value::Int { .. }) {
            int_signed(lhs) || int_signed(rhs)
        } else {
            true
        };
        let raw = match op {
            Add => a + b,
            Sub => a - b,
            Mul => a * b,
            Div => {
                if b == 0 {
                    return Err(ErrorKind::DivisionByZero);
                }
                return Ok(Value::Float(a as f64 / b as f64));
            }
            Mod => {
                if b == 0 {
                    return Err(ErrorKind::DivisionByZero);
                }
                a % b
            }
            Pow => {
                if b < 0 {
                    return Ok(Value::Float((a as f64).powf(b as f64)));
                }
                let mut acc: i128 = 1;
                for _ in 0..b {
                    acc = acc.wrapping_mul(a);
                }
                acc
            }
            _ => unreachable!(),
        };
        return Ok(Value::Int { width, signed, value: wrap_int(width, signed, raw) });
    }

    let a = lhs.as_float()?;
    let b = rhs.as_float()?;
    let angle_result = match op {
        Add | Sub => matches!(lhs, Value::Angle(_)) && matches!(rhs, Value::Angle(_)),
        Mul | Div => {
            matches!(lhs, Value::Angle(_)) != matches!(rhs, Value::Angle(_))
        }
        _ => false,
    };
    let out = match op {
        Add => a + b,
        Sub => a - b,
        Mul => a * b,
        Div => {
            if b == 0.0 {
                return Err(ErrorKind::DivisionByZero);
            }
            a / b
        }
        Mod => {
            return Err(ErrorKind::Type(
                "'%' requires integer operands".to_string(),
            ))
        }
        Pow => a.powf(b),
        _ => unreachable!(),
    };
    if angle_result {
        Ok(Value::Angle(out))
    } else {
        Ok(Value::Float(out))
    }
}

fn as_complex(v: &Value) -> Result<Complex64, ErrorKind> {
    match v {
        Value::Complex(c) => Ok(*c),
        other => Ok(Complex64::new(other.as_float()?, 0.0)),
    }
}

fn compare(op: BinaryOp, lhs: &Value, rhs: &Value) -> Result<Value, ErrorKind> {
    use BinaryOp::*;
    use std::cmp::Ordering;

    // Equality-only cases first.
    match (lhs, rhs) {
        (Value::Bool(a), Value::Bool(b)) => {
            return match op {
                Eq => Ok(Value::Bool(a == b)),
                Ne => Ok(Value::Bool(a != b)),
                _ => Err(ErrorKind::Type("bool values only support == and !=".to_string())),
            };
        }
        (Value::Str(a), Value::Str(b)) => {
            return match op {
                Eq => Ok(Value::Bool(a == b)),
                Ne => Ok(Value::Bool(a != b)),
                _ => Err(ErrorKind::Type("strings only support == and !=".to_string())),
            };
        }
        (Value::Complex(a), Value::Complex(b)) => {
            return match op {
                Eq => Ok(Value::Bool(a == b)),
                Ne => Ok(Value::Bool(a != b)),
                _ => Err(ErrorKind::Type(
                    "complex values only support == and !=".to_string(),
                )),
            };
        }
        // Angle equivalence is modulo 2π.
        (Value::Angle(a), Value::Angle(b)) => {
            if matches!(op, Eq | Ne) {
                let eq = angles_equal(*a, *b);
                return Ok(Value::Bool(if op == Eq { eq } else { !eq }));
            }
        }
        _ => {}
    }

    let ordering = if lhs.is_integerish() && rhs.is_integerish() {
        lhs.as_i128()?.cmp(&rhs.as_i128()?)
    } else {
        let a = lhs.as_float()?;
        let b = rhs.as_float()?;
        a.partial_cmp(&b).unwrap_or(Ordering::Greater)
    };
    let out = match op {
        Eq => ordering == Ordering::Equal,
        Ne => ordering != Ordering::Equal,
        Lt => ordering == Ordering::Less,
        Gt => ordering == Ordering::Greater,
        Le => ordering != Ordering::Greater,
        Ge => ordering != Ordering::Less,
        _ => unreachable!(),
    };
    Ok(Value::Bool(out))
}

fn bitwise(op: BinaryOp, lhs: &Value, rhs: &Value) -> Result<Value, ErrorKind> {
    use BinaryOp::*;
    if !lhs.is_integerish() || !rhs.is_integerish() {
        return Err(ErrorKind::Type(format!(
            "bitwise operator requires integer or bit-register operands, got {} and {}",
            lhs.type_name(),
            rhs.type_name()
        )));
    }
    let a = lhs.as_i128()? as u64;
    let b = rhs.as_i128()? as u64;
    let bits = match op {
        BitAnd => a & b,
        BitOr => a | b,
        BitXor => a ^ b,
        _ => unreachable!(),
    };
    // Result width is the width of the wider operand (a lone bit counts
    // as width 1), and the result stays a bit register when either side
    // is one.
    let operand_width = |v: &Value| -> usize {
        match v {
            Value::Bit(_) | Value::Bool(_) => 1,
            Value::Int { width, .. } => *width,
            Value::BitRegister { width, .. } => *width,
            _ => 32,
        }
    };
    match (lhs, rhs) {
        (Value::Bit(_), Value::Bit(_)) => Ok(Value::Bit((bits & 1) as u8)),
        (Value::BitRegister { .. }, _) | (_, Value::BitRegister { .. }) => {
            let width = operand_width(lhs).max(operand_width(rhs));
            Ok(Value::BitRegister { width, bits: bits & width_mask(width) })
        }
        _ => {
            let width = int_width(lhs).max(int_width(rhs));
            let signed = int_signed(lhs) && int_signed(rhs);
            Ok(Value::Int { width, signed, value: wrap_int(width, signed, bits as i128) })
        }
    }
}

fn shift(op: BinaryOp, lhs: &Value, rhs: &Value) -> Result<Value, ErrorKind> {
    let amount = rhs.as_i128()?;
    if amount < 0 {
        return Err(ErrorKind::Type("negative shift amount".to_string()));
    }
    let amount = (amount as u32).min(127);
    match lhs {
        Value::BitRegister { width, bits } => {
            let out = match op {
                BinaryOp::Shl => bits.checked_shl(amount).unwrap_or(0),
                _ => bits.checked_shr(amount).unwrap_or(0),
            };
            Ok(Value::BitRegister { width: *width, bits: out & width_mask(*width) })
        }
        Value::Int { .. } | Value::Bit(_) => {
            let a = lhs.as_i128()?;
            let (width, signed) = match lhs {
                Value::Int { width, signed, .. } => (*width, *signed),
                _ => (32, true),
            };
            let raw = match op {
                BinaryOp::Shl => a << amount,
                // Arithmetic shift for signed, logical for unsigned.
                _ => {
                    if signed {
                        a >> amount
                    } else {
                        (a as u64).checked_shr(amount).unwrap_or(0) as i128
                    }
                }
            };
            Ok(Value::Int { width, signed, value: wrap_int(width, signed, raw) })
        }
        other => Err(ErrorKind::Type(format!(
            "shift requires an integer or bit-register left operand, got {}",
            other.type_name()
        ))),
    }
}

/// Apply a unary operator.
pub fn apply_unary(op: crate::parser::ast::UnaryOp, v: &Value) -> Result<Value, ErrorKind> {
    use crate::parser::ast::UnaryOp;
    match op {
        UnaryOp::Not => Ok(Value::Bool(!v.truthy()?)),
        UnaryOp::Neg => match v {
            Value::Int { width, signed, value } => Ok(Value::Int {
                width: *width,
                signed: *signed,
                value: wrap_int(*width, *signed, -(*value as i128)),
            }),
            Value::Float(f) => Ok(Value::Float(-f)),
            Value::Angle(a) => Ok(Value::Angle(-a)),
            Value::Complex(c) => Ok(Value::Complex(-c)),
            Value::Bit(b) => Ok(Value::int(-(*b as i64))),
            other => Err(ErrorKind::Type(format!(
                "unary '-' is not defined for {}",
                other.type_name()
            ))),
        },
        UnaryOp::BitNot => match v {
            Value::Int { width, signed, value } => Ok(Value::Int {
                width: *width,
                signed: *signed,
                value: wrap_int(*width, *signed, !(*value as i128)),
            }),
            Value::BitRegister { width, bits } => Ok(Value::BitRegister {
                width: *width,
                bits: !bits & width_mask(*width),
            }),
            Value::Bit(b) => Ok(Value::Bit(1 - b)),
            other => Err(ErrorKind::Type(format!(
                "unary '~' is not defined for {}",
                other.type_name()
            ))),
        },
    }
}

/// Explicit cast, e.g. `int[8](b)` or `bit[4](n)`.
pub fn cast(ty: &ValueType, v: &Value) -> Result<Value, ErrorKind> {
    match ty {
        ValueType::Bool => Ok(Value::Bool(v.truthy()?)),
        ValueType::Bit => match v {
            Value::Bit(b) => Ok(Value::Bit(*b)),
            Value::Bool(b) => Ok(Value::Bit(*b as u8)),
            Value::BitRegister { width: 1, bits } => Ok(Value::Bit(*bits as u8 & 1)),
            Value::Int { .. } => Ok(Value::Bit((v.as_i128()? & 1) as u8)),
            other => Err(ErrorKind::Type(format!(
                "cannot cast {} to bit",
                other.type_name()
            ))),
        },
        // bit[n](int) takes the low n bits, LSB first.
        ValueType::BitRegister(n) => {
            let bits = match v {
                Value::Bit(b) => *b as u64,
                Value::Bool(b) => *b as u64,
                Value::BitRegister { bits, .. } => *bits,
                Value::Int { .. } => v.as_i128()? as u64,
                other => {
                    return Err(ErrorKind::Type(format!(
                        "cannot cast {} to bit[{}]",
                        other.type_name(),
                        n
                    )))
                }
            };
            Ok(Value::BitRegister { width: *n, bits: bits & width_mask(*n) })
        }
        // int[m](bit[n]) zero-extends or truncates, then applies signedness.
        ValueType::Int { width, signed } => {
            let raw = match v {
                Value::Float(f) => f.trunc() as i128,
                Value::Angle(a) => a.trunc() as i128,
                _ => v.as_i128()?,
            };
            Ok(Value::Int {
                width: *width,
                signed: *signed,
                value: wrap_int(*width, *signed, raw),
            })
        }
        ValueType::Float => Ok(Value::Float(v.as_float()?)),
        ValueType::Angle => Ok(Value::Angle(v.as_float()?)),
        ValueType::Complex => Ok(Value::Complex(as_complex(v)?)),
        other => Err(ErrorKind::Type(format!(
            "cannot cast {} to {}",
            v.type_name(),
            other.name()
        ))),
    }
}

/// Implicit conversion on declaration and assignment. Narrower than
/// [`cast`]: no float-to-int truncation, no bool reinterpretation.
pub fn coerce_assign(ty: &ValueType, v: &Value) -> Result<Value, ErrorKind> {
    match (ty, v) {
        (ValueType::Bool, Value::Bool(_)) => Ok(v.clone()),
        (ValueType::Bool, Value::Bit(b)) => Ok(Value::Bool(*b != 0)),
        (ValueType::Bit, Value::Bit(_)) => Ok(v.clone()),
        (ValueType::Bit, Value::Bool(b)) => Ok(Value::Bit(*b as u8)),
        (ValueType::Bit, Value::BitRegister { width: 1, bits }) => {
            Ok(Value::Bit(*bits as u8 & 1))
        }
        (ValueType::Bit, Value::Int { value, .. }) if *value == 0 || *value == 1 => {
            Ok(Value::Bit(*value as u8))
        }
        (ValueType::BitRegister(n), Value::BitRegister { width, bits }) => {
            if n == width {
                Ok(v.clone())
            } else {
                Err(ErrorKind::WidthMismatch(format!(
                    "cannot assign bit[{}] to bit[{}]",
                    width, n
                )))
            }
        }
        (ValueType::BitRegister(1), Value::Bit(b)) => {
            Ok(Value::BitRegister { width: 1, bits: *b as u64 })
        }
        (ValueType::Int { width, signed }, v) if v.is_integerish() => Ok(Value::Int {
            width: *width,
            signed: *signed,
            value: wrap_int(*width, *signed, v.as_i128()?),
        }),
        (ValueType::Float, Value::Float(_)) => Ok(v.clone()),
        (ValueType::Float, v) if v.is_integerish() => Ok(Value::Float(v.as_float()?)),
        (ValueType::Float, Value::Angle(a)) => Ok(Value::Float(*a)),
        (ValueType::Angle, Value::Angle(_)) => Ok(v.clone()),
        (ValueType::Angle, Value::Float(f)) => Ok(Value::Angle(*f)),
        (ValueType::Angle, v) if v.is_integerish() => Ok(Value::Angle(v.as_float()?)),
        (ValueType::Complex, Value::Complex(_)) => Ok(v.clone()),
        (ValueType::Complex, Value::Float(f)) => Ok(Value::Complex(Complex64::new(*f, 0.0))),
        (ValueType::Complex, v) if v.is_integerish() => {
            Ok(Value::Complex(Complex64::new(v.as_float()?, 0.0)))
        }
        (ValueType::Array(elem, dims), Value::Array { values, .. }) => {
            if dims.len() == 1 && dims[0] != values.len() {
                return Err(ErrorKind::WidthMismatch(format!(
                    "array of length {} assigned to array[{}; {}]",
                    values.len(),
                    elem.name(),
                    dims[0]
                )));
            }
            let coerced: Result<Vec<Value>, ErrorKind> =
                values.iter().map(|v| coerce_assign(elem, v)).collect();
            Ok(Value::Array { elem: (**elem).clone(), values: coerced? })
        }
        (ValueType::Qubit, Value::QubitRef(_)) => Ok(v.clone()),
        (ValueType::Qubit, Value::QubitArray(is)) if is.len() == 1 => {
            Ok(Value::QubitRef(is[0]))
        }
        (ValueType::QubitArray(n), Value::QubitArray(is)) => {
            if *n == is.len() {
                Ok(v.clone())
            } else {
                Err(ErrorKind::WidthMismatch(format!(
                    "qubit register of size {} bound to qubit[{}]",
                    is.len(),
                    n
                )))
            }
        }
        (ValueType::QubitArray(_), Value::QubitRef(i)) => Ok(Value::QubitArray(vec![*i])),
        (ValueType::Str, Value::Str(_)) => Ok(v.clone()),
        (ty, v) => Err(ErrorKind::Type(format!(
            "cannot assign {} to a variable of type {}",
            v.type_name(),
            ty.name()
        ))),
    }
}

/// Parse a bitstring literal ("0101", MSB written first) into a register.
pub fn bitstring_value(bits: &str) -> Value {
    let width = bits.len();
    let mut packed = 0u64;
    for (i, c) in bits.chars().enumerate() {
        if c == '1' {
            packed |= 1 << (width - 1 - i);
        }
    }
    Value::BitRegister { width, bits: packed }
}
