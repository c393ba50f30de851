// src/evaluator/gates.rs
use crate::environment::value::{wrap_int, Value};
use crate::error::ErrorKind;

/// Shape of a built-in gate: how many qubit operands and how many angle
/// parameters an application must supply.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct GateSignature {
    pub qubits: usize,
    pub params: usize,
}

/// Canonical spelling of a built-in gate name. Aliases collapse so the
/// ledger always carries one spelling per gate.
pub fn canonical_gate_name(name: &str) -> &str {
    match name {
        "cx" => "cnot",
        "p" => "phase",
        other => other,
    }
}

pub fn builtin_gate_signature(name: &str) -> Option<GateSignature> {
    let sig = match canonical_gate_name(name) {
        "id" | "x" | "y" | "z" | "h" | "s" | "sdg" | "t" | "tdg" => {
            GateSignature { qubits: 1, params: 0 }
        }
        "rx" | "ry" | "rz" | "phase" => GateSignature { qubits: 1, params: 1 },
        "u" => GateSignature { qubits: 1, params: 3 },
        "cnot" | "cz" | "swap" => GateSignature { qubits: 2, params: 0 },
        "ccx" => GateSignature { qubits: 3, params: 0 },
        "gphase" => GateSignature { qubits: 0, params: 1 },
        _ => return None,
    };
    Some(sig)
}

/// Numeric built-ins usable in classical expressions. Returns None for
/// names that are not built-ins (they resolve as user subroutines).
pub fn apply_numeric_builtin(name: &str, args: &[Value]) -> Option<Result<Value, ErrorKind>> {
    let unary = |f: fn(f64) -> f64| -> Result<Value, ErrorKind> {
        if args.len() != 1 {
            return Err(ErrorKind::ArityMismatch(format!(
                "{} expects 1 argument, got {}",
                name,
                args.len()
            )));
        }
        Ok(Value::Float(f(args[0].as_float()?)))
    };

    let result = match name {
        "sin" => unary(f64::sin),
        "cos" => unary(f64::cos),
        "tan" => unary(f64::tan),
        "arcsin" => unary(f64::asin),
        "arccos" => unary(f64::acos),
        "arctan" => unary(f64::atan),
        "exp" => unary(f64::exp),
        "ln" => unary(f64::ln),
        "sqrt" => unary(f64::sqrt),
        "floor" => unary(f64::floor),
        "ceil" => unary(f64::ceil),
        "pow" => {
            if args.len() != 2 {
                Err(ErrorKind::ArityMismatch(format!(
                    "pow expects 2 arguments, got {}",
                    args.len()
                )))
            } else {
                match (args[0].as_float(), args[1].as_float()) {
                    (Ok(a), Ok(b)) => Ok(Value::Float(a.powf(b))),
                    (Err(kind), _) | (_, Err(kind)) => Err(kind),
                }
            }
        }
        "abs" => {
            if args.len() != 1 {
                Err(ErrorKind::ArityMismatch(format!(
                    "abs expects 1 argument, got {}",
                    args.len()
                )))
            } else {
                match &args[0] {
                    // The magnitude wraps back into the operand's width, so
                    // abs of int[w]'s minimum stays representable.
                    Value::Int { width, signed, value } => Ok(Value::Int {
                        width: *width,
                        signed: *signed,
                        value: wrap_int(*width, *signed, (*value as i128).abs()),
                    }),
                    Value::Complex(c) => Ok(Value::Float(c.norm())),
                    other => other.as_float().map(|f| Value::Float(f.abs())),
                }
            }
        }
        "real" => {
            if args.len() != 1 {
                Err(ErrorKind::ArityMismatch("real expects 1 argument".to_string()))
            } else {
                match &args[0] {
                    Value::Complex(c) => Ok(Value::Float(c.re)),
                    other => other.as_float().map(Value::Float),
                }
            }
        }
        "imag" => {
            if args.len() != 1 {
                Err(ErrorKind::ArityMismatch("imag expects 1 argument".to_string()))
            } else {
                match &args[0] {
                    Value::Complex(c) => Ok(Value::Float(c.im)),
                    other => other.as_float().map(|_| Value::Float(0.0)),
                }
            }
        }
        _ => return None,
    };
    Some(result)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_gate_signatures() {
        assert_eq!(
            builtin_gate_signature("h"),
            Some(GateSignature { qubits: 1, params: 0 })
        );
        assert_eq!(
            builtin_gate_signature("rx"),
            Some(GateSignature { qubits: 1, params: 1 })
        );
        assert_eq!(
            builtin_gate_signature("u"),
            Some(GateSignature { qubits: 1, params: 3 })
        );
        assert_eq!(
            builtin_gate_signature("ccx"),
            Some(GateSignature { qubits: 3, params: 0 })
        );
        assert_eq!(
            builtin_gate_signature("gphase"),
            Some(GateSignature { qubits: 0, params: 1 })
        );
        assert_eq!(builtin_gate_signature("bell"), None);
    }

    #[test]
    fn test_aliases_collapse() {
        assert_eq!(canonical_gate_name("cx"), "cnot");
        assert_eq!(canonical_gate_name("p"), "phase");
        assert_eq!(
            builtin_gate_signature("cx"),
            builtin_gate_signature("cnot")
        );
    }

    #[test]
    fn test_numeric_builtins() {
        let out = apply_numeric_builtin("sqrt", &[Value::Float(4.0)]).unwrap().unwrap();
        assert_eq!(out, Value::Float(2.0));
        let out = apply_numeric_builtin("abs", &[Value::int(-3)]).unwrap().unwrap();
        assert_eq!(out, Value::int(3));
        let out = apply_numeric_builtin("pow", &[Value::int(2), Value::Float(3.0)])
            .unwrap()
            .unwrap();
        assert_eq!(out, Value::Float(8.0));
        assert!(apply_numeric_builtin("factorial", &[]).is_none());
    }

    #[test]
    fn test_abs_wraps_at_width() {
        let min = Value::Int { width: 8, signed: true, value: -128 };
        let out = apply_numeric_builtin("abs", &[min]).unwrap().unwrap();
        // |−128| is unrepresentable in int[8]; it wraps like the
        // arithmetic ops do.
        assert_eq!(out, Value::Int { width: 8, signed: true, value: -128 });
    }

    #[test]
    fn test_builtin_arity_checked() {
        let err = apply_numeric_builtin("sin", &[]).unwrap();
        assert!(matches!(err, Err(ErrorKind::ArityMismatch(_))));
        let err = apply_numeric_builtin("pow", &[Value::int(2)]).unwrap();
        assert!(matches!(err, Err(ErrorKind::ArityMismatch(_))));
    }
}
