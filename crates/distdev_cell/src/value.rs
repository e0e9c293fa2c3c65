//! Operations on cell values.
//!
//! Cell values are plain JSON values so they cross the wire unchanged.
//! Integers are `i64`; anything else numeric is treated as a float.

use crate::ast::BinOp;
use crate::error::{CellError, CellResult};
use serde_json::Value;
use std::cmp::Ordering;

/// Maximum number of elements a single operation may materialise
pub const MAX_SEQUENCE_LEN: usize = 1_000_000;

#[derive(Debug, Clone, Copy)]
enum Num {
    Int(i64),
    Float(f64),
}

impl Num {
    fn of(value: &Value) -> Option<Self> {
        match value {
            Value::Number(n) => n
                .as_i64()
                .map(Num::Int)
                .or_else(|| n.as_f64().map(Num::Float)),
            _ => None,
        }
    }

    fn as_f64(self) -> f64 {
        match self {
            Num::Int(i) => i as f64,
            Num::Float(f) => f,
        }
    }
}

/// Name of a value's type as shown in error messages
#[must_use]
pub fn type_name(value: &Value) -> &'static str {
    match value {
        Value::Null => "none",
        Value::Bool(_) => "bool",
        Value::Number(n) if n.is_i64() => "int",
        Value::Number(_) => "float",
        Value::String(_) => "str",
        Value::Array(_) => "list",
        Value::Object(_) => "dict",
    }
}

/// Truthiness: `none`, `false`, zero and empty containers are false
#[must_use]
pub fn truthy(value: &Value) -> bool {
    match value {
        Value::Null => false,
        Value::Bool(b) => *b,
        Value::Number(n) => n.as_f64().is_some_and(|f| f != 0.0),
        Value::String(s) => !s.is_empty(),
        Value::Array(items) => !items.is_empty(),
        Value::Object(map) => !map.is_empty(),
    }
}

/// Text form used by `str` and the logging builtins
#[must_use]
pub fn display(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        other => repr(other),
    }
}

fn repr(value: &Value) -> String {
    match value {
        Value::Null => "none".to_string(),
        Value::Bool(b) => b.to_string(),
        Value::Number(n) => match Num::of(value) {
            Some(Num::Float(f)) if f.fract() == 0.0 && f.abs() < 1e16 => format!("{:.1}", f),
            _ => n.to_string(),
        },
        Value::String(s) => format!("{:?}", s),
        Value::Array(items) => {
            let inner: Vec<String> = items.iter().map(repr).collect();
            format!("[{}]", inner.join(", "))
        }
        Value::Object(map) => {
            let inner: Vec<String> = map
                .iter()
                .map(|(k, v)| format!("{:?}: {}", k, repr(v)))
                .collect();
            format!("{{{}}}", inner.join(", "))
        }
    }
}

/// Wrap a float result, rejecting NaN and infinities
///
/// # Errors
///
/// Returns [`CellError::Arithmetic`] for a non-finite value
pub fn float(f: f64) -> CellResult<Value> {
    serde_json::Number::from_f64(f)
        .map(Value::Number)
        .ok_or_else(|| CellError::Arithmetic(format!("result {} is not finite", f)))
}

fn overflow(op: BinOp) -> CellError {
    CellError::Arithmetic(format!("integer overflow in '{}'", op.symbol()))
}

fn zero_division() -> CellError {
    CellError::Arithmetic("division by zero".to_string())
}

fn not_arithmetic(op: BinOp) -> CellError {
    CellError::Type(format!("'{}' is not an arithmetic operator", op.symbol()))
}

fn unsupported(op: BinOp, left: &Value, right: &Value) -> CellError {
    CellError::Type(format!(
        "unsupported operand types for {}: '{}' and '{}'",
        op.symbol(),
        type_name(left),
        type_name(right)
    ))
}

/// Integer division rounding toward negative infinity
///
/// # Errors
///
/// Returns [`CellError::Arithmetic`] on division by zero or overflow
pub fn floor_div(a: i64, b: i64) -> CellResult<i64> {
    if b == 0 {
        return Err(zero_division());
    }
    let q = a.checked_div(b).ok_or_else(|| overflow(BinOp::FloorDiv))?;
    let r = a.wrapping_rem(b);
    Ok(if r != 0 && ((r < 0) != (b < 0)) { q - 1 } else { q })
}

/// Remainder with the sign of the divisor
///
/// # Errors
///
/// Returns [`CellError::Arithmetic`] on division by zero
pub fn floor_mod(a: i64, b: i64) -> CellResult<i64> {
    if b == 0 {
        return Err(zero_division());
    }
    let r = a.wrapping_rem(b);
    Ok(if r != 0 && ((r < 0) != (b < 0)) { r + b } else { r })
}

/// Apply a binary operator
///
/// # Errors
///
/// Returns a type error for unsupported operands and an arithmetic error on
/// overflow, division by zero or a non-finite float
pub fn binary(op: BinOp, left: &Value, right: &Value) -> CellResult<Value> {
    match op {
        BinOp::Eq => return Ok(Value::Bool(equals(left, right))),
        BinOp::Ne => return Ok(Value::Bool(!equals(left, right))),
        BinOp::Lt | BinOp::Le | BinOp::Gt | BinOp::Ge => {
            let ordering = compare(left, right).ok_or_else(|| {
                CellError::Type(format!(
                    "'{}' not supported between '{}' and '{}'",
                    op.symbol(),
                    type_name(left),
                    type_name(right)
                ))
            })?;
            let result = match op {
                BinOp::Lt => ordering == Ordering::Less,
                BinOp::Le => ordering != Ordering::Greater,
                BinOp::Gt => ordering == Ordering::Greater,
                _ => ordering != Ordering::Less,
            };
            return Ok(Value::Bool(result));
        }
        _ => {}
    }

    if let (Some(a), Some(b)) = (Num::of(left), Num::of(right)) {
        return numeric(op, a, b);
    }

    match (op, left, right) {
        (BinOp::Add, Value::String(a), Value::String(b)) => Ok(Value::String(format!("{}{}", a, b))),
        (BinOp::Add, Value::Array(a), Value::Array(b)) => {
            check_len(a.len().saturating_add(b.len()))?;
            Ok(Value::Array(a.iter().chain(b.iter()).cloned().collect()))
        }
        (BinOp::Mul, Value::String(s), count) | (BinOp::Mul, count, Value::String(s))
            if count.is_i64() =>
        {
            let n = repeat_count(count, s.len())?;
            Ok(Value::String(s.repeat(n)))
        }
        (BinOp::Mul, Value::Array(items), count) | (BinOp::Mul, count, Value::Array(items))
            if count.is_i64() =>
        {
            let n = repeat_count(count, items.len())?;
            let mut out = Vec::with_capacity(items.len() * n);
            for _ in 0..n {
                out.extend(items.iter().cloned());
            }
            Ok(Value::Array(out))
        }
        _ => Err(unsupported(op, left, right)),
    }
}

fn numeric(op: BinOp, a: Num, b: Num) -> CellResult<Value> {
    if let (Num::Int(a), Num::Int(b)) = (a, b) {
        let result = match op {
            BinOp::Add => a.checked_add(b).ok_or_else(|| overflow(op))?,
            BinOp::Sub => a.checked_sub(b).ok_or_else(|| overflow(op))?,
            BinOp::Mul => a.checked_mul(b).ok_or_else(|| overflow(op))?,
            BinOp::FloorDiv => floor_div(a, b)?,
            BinOp::Mod => floor_mod(a, b)?,
            BinOp::Div => {
                if b == 0 {
                    return Err(zero_division());
                }
                return float(a as f64 / b as f64);
            }
            _ => return Err(not_arithmetic(op)),
        };
        return Ok(Value::from(result));
    }

    let (a, b) = (a.as_f64(), b.as_f64());
    let result = match op {
        BinOp::Add => a + b,
        BinOp::Sub => a - b,
        BinOp::Mul => a * b,
        BinOp::Div | BinOp::FloorDiv | BinOp::Mod if b == 0.0 => return Err(zero_division()),
        BinOp::Div => a / b,
        BinOp::FloorDiv => (a / b).floor(),
        BinOp::Mod => a - b * (a / b).floor(),
        _ => return Err(not_arithmetic(op)),
    };
    float(result)
}

fn check_len(len: usize) -> CellResult<()> {
    if len > MAX_SEQUENCE_LEN {
        return Err(CellError::Arithmetic(format!(
            "sequence of length {} exceeds the limit of {}",
            len, MAX_SEQUENCE_LEN
        )));
    }
    Ok(())
}

fn repeat_count(count: &Value, unit: usize) -> CellResult<usize> {
    let n = count.as_i64().unwrap_or(0).max(0);
    let n = usize::try_from(n).unwrap_or(usize::MAX);
    check_len(unit.saturating_mul(n))?;
    Ok(n)
}

/// Equality; integers and floats compare by numeric value
#[must_use]
pub fn equals(left: &Value, right: &Value) -> bool {
    match (Num::of(left), Num::of(right)) {
        (Some(Num::Int(a)), Some(Num::Int(b))) => a == b,
        (Some(a), Some(b)) => a.as_f64() == b.as_f64(),
        _ => match (left, right) {
            (Value::Array(a), Value::Array(b)) => {
                a.len() == b.len() && a.iter().zip(b).all(|(x, y)| equals(x, y))
            }
            _ => left == right,
        },
    }
}

fn compare(left: &Value, right: &Value) -> Option<Ordering> {
    match (Num::of(left), Num::of(right)) {
        (Some(Num::Int(a)), Some(Num::Int(b))) => Some(a.cmp(&b)),
        (Some(a), Some(b)) => a.as_f64().partial_cmp(&b.as_f64()),
        _ => match (left, right) {
            (Value::String(a), Value::String(b)) => Some(a.cmp(b)),
            (Value::Bool(a), Value::Bool(b)) => Some(a.cmp(b)),
            _ => None,
        },
    }
}

/// Arithmetic negation
///
/// # Errors
///
/// Returns a type error for non-numbers and an arithmetic error on overflow
pub fn negate(value: &Value) -> CellResult<Value> {
    match Num::of(value) {
        Some(Num::Int(i)) => i
            .checked_neg()
            .map(Value::from)
            .ok_or_else(|| CellError::Arithmetic("integer overflow in unary '-'".to_string())),
        Some(Num::Float(f)) => float(-f),
        None => Err(CellError::Type(format!(
            "bad operand type for unary -: '{}'",
            type_name(value)
        ))),
    }
}

/// `target[index]`; negative integers count from the end
///
/// # Errors
///
/// Returns an index error when out of range and a type error for an
/// unsupported target or index type
pub fn index(target: &Value, index: &Value) -> CellResult<Value> {
    match (target, index) {
        (Value::Array(items), Value::Number(_)) => {
            let i = position(index, items.len())?;
            Ok(items[i].clone())
        }
        (Value::String(s), Value::Number(_)) => {
            let chars: Vec<char> = s.chars().collect();
            let i = position(index, chars.len())?;
            Ok(Value::String(chars[i].to_string()))
        }
        (Value::Object(map), Value::String(key)) => map
            .get(key)
            .cloned()
            .ok_or_else(|| CellError::Index(format!("key {:?} not found", key))),
        _ => Err(CellError::Type(format!(
            "'{}' cannot be indexed by '{}'",
            type_name(target),
            type_name(index)
        ))),
    }
}

fn position(index: &Value, len: usize) -> CellResult<usize> {
    let i = index
        .as_i64()
        .ok_or_else(|| CellError::Type("indices must be integers".to_string()))?;
    let len_i = i64::try_from(len).unwrap_or(i64::MAX);
    let resolved = if i < 0 { i + len_i } else { i };
    if resolved < 0 || resolved >= len_i {
        return Err(CellError::Index(format!(
            "index {} out of range for length {}",
            i, len
        )));
    }
    usize::try_from(resolved).map_err(|_| CellError::Index(format!("index {} out of range", i)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_python_floor_semantics() {
        assert_eq!(floor_div(7, 2).unwrap(), 3);
        assert_eq!(floor_div(-7, 2).unwrap(), -4);
        assert_eq!(floor_div(7, -2).unwrap(), -4);
        assert_eq!(floor_mod(-7, 2).unwrap(), 1);
        assert_eq!(floor_mod(7, -2).unwrap(), -1);
        assert_eq!(floor_mod(i64::MIN, -1).unwrap(), 0);
    }

    #[test]
    fn test_division_always_float() {
        assert_eq!(binary(BinOp::Div, &json!(6), &json!(3)).unwrap(), json!(2.0));
        assert!(matches!(
            binary(BinOp::Div, &json!(1), &json!(0)),
            Err(CellError::Arithmetic(_))
        ));
    }

    #[test]
    fn test_overflow_is_error() {
        assert!(binary(BinOp::Add, &json!(i64::MAX), &json!(1)).is_err());
        assert!(binary(BinOp::FloorDiv, &json!(i64::MIN), &json!(-1)).is_err());
        assert!(negate(&json!(i64::MIN)).is_err());
    }

    #[test]
    fn test_mixed_numeric() {
        assert_eq!(binary(BinOp::Add, &json!(1), &json!(0.5)).unwrap(), json!(1.5));
        assert_eq!(binary(BinOp::Eq, &json!(1), &json!(1.0)).unwrap(), json!(true));
        assert_eq!(binary(BinOp::Lt, &json!(1), &json!(1.5)).unwrap(), json!(true));
    }

    #[test]
    fn test_sequences() {
        assert_eq!(binary(BinOp::Add, &json!("a"), &json!("b")).unwrap(), json!("ab"));
        assert_eq!(binary(BinOp::Mul, &json!("ab"), &json!(2)).unwrap(), json!("abab"));
        assert_eq!(binary(BinOp::Add, &json!([1]), &json!([2])).unwrap(), json!([1, 2]));
        assert_eq!(binary(BinOp::Mul, &json!(2), &json!([0])).unwrap(), json!([0, 0]));
        assert!(binary(BinOp::Mul, &json!([0]), &json!(i64::MAX)).is_err());
        assert!(matches!(
            binary(BinOp::Sub, &json!("a"), &json!(1)),
            Err(CellError::Type(_))
        ));
    }

    #[test]
    fn test_index() {
        assert_eq!(index(&json!([1, 2, 3]), &json!(-1)).unwrap(), json!(3));
        assert_eq!(index(&json!("héllo"), &json!(1)).unwrap(), json!("é"));
        assert_eq!(index(&json!({"k": 5}), &json!("k")).unwrap(), json!(5));
        assert!(matches!(index(&json!([]), &json!(0)), Err(CellError::Index(_))));
    }

    #[test]
    fn test_display() {
        assert_eq!(display(&json!("plain")), "plain");
        assert_eq!(display(&json!(null)), "none");
        assert_eq!(display(&json!(2.0)), "2.0");
        assert_eq!(display(&json!([1, "a", null])), "[1, \"a\", none]");
    }

    #[test]
    fn test_truthy() {
        assert!(!truthy(&json!(0)));
        assert!(!truthy(&json!("")));
        assert!(!truthy(&json!(null)));
        assert!(truthy(&json!([0])));
    }
}
