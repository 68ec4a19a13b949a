//! Operator semantics shared by the interpreter and constant evaluation.

use std::cmp::Ordering;

use crate::error::{Error, Result};
use crate::syntax::ast::{BinaryOp, CastType, UnaryOp};
use crate::value::{ArrayKey, ArrayValue, Number, Value};

/// Apply a non-short-circuiting binary operator.
///
/// `&&`, `||` and `??` are evaluated lazily by the caller; passing them here
/// evaluates them eagerly on already-computed operands.
pub fn binary(op: BinaryOp, left: &Value, right: &Value) -> Result<Value> {
    match op {
        BinaryOp::Add | BinaryOp::Sub | BinaryOp::Mul => arithmetic(op, left, right),
        BinaryOp::Div => divide(left, right),
        BinaryOp::Mod => modulo(left, right),
        BinaryOp::Concat => Ok(Value::String(format!(
            "{}{}",
            left.to_output_string(),
            right.to_output_string()
        ))),
        BinaryOp::Eq => Ok(Value::Bool(left.loose_eq(right))),
        BinaryOp::NotEq => Ok(Value::Bool(!left.loose_eq(right))),
        BinaryOp::Identical => Ok(Value::Bool(left.identical(right))),
        BinaryOp::NotIdentical => Ok(Value::Bool(!left.identical(right))),
        BinaryOp::Lt => Ok(Value::Bool(compare(left, right) == Ordering::Less)),
        BinaryOp::Gt => Ok(Value::Bool(compare(left, right) == Ordering::Greater)),
        BinaryOp::LtEq => Ok(Value::Bool(compare(left, right) != Ordering::Greater)),
        BinaryOp::GtEq => Ok(Value::Bool(compare(left, right) != Ordering::Less)),
        BinaryOp::And => Ok(Value::Bool(left.is_truthy() && right.is_truthy())),
        BinaryOp::Or => Ok(Value::Bool(left.is_truthy() || right.is_truthy())),
        BinaryOp::Coalesce => Ok(match left {
            Value::Null => right.clone(),
            other => other.clone(),
        }),
        BinaryOp::BitAnd | BinaryOp::BitOr => {
            let (a, b) = (int_operand(op, left, right)?, int_operand(op, right, left)?);
            Ok(Value::Int(if op == BinaryOp::BitAnd { a & b } else { a | b }))
        }
    }
}

pub fn unary(op: UnaryOp, value: &Value) -> Result<Value> {
    match op {
        UnaryOp::Not => Ok(Value::Bool(!value.is_truthy())),
        UnaryOp::Neg => match operand(BinaryOp::Sub, value, value)? {
            Number::Int(i) => Ok(i
                .checked_neg()
                .map_or(Value::Float(-(i as f64)), Value::Int)),
            Number::Float(f) => Ok(Value::Float(-f)),
        },
        UnaryOp::Plus => Ok(number_value(operand(BinaryOp::Add, value, value)?)),
        UnaryOp::Silence => Ok(value.clone()),
    }
}

pub fn cast(ty: CastType, value: &Value) -> Value {
    match ty {
        CastType::Int => Value::Int(match value.to_number() {
            Some(Number::Int(i)) => i,
            Some(Number::Float(f)) => f as i64,
            None => leading_number(value).map_or(0, |n| n.as_f64() as i64),
        }),
        CastType::Float => Value::Float(match value.to_number() {
            Some(n) => n.as_f64(),
            None => leading_number(value).map_or(0.0, Number::as_f64),
        }),
        CastType::String => Value::String(value.to_output_string()),
        CastType::Bool => Value::Bool(value.is_truthy()),
        CastType::Array => match value {
            Value::Array(_) => value.clone(),
            Value::Null => Value::Array(ArrayValue::new()),
            Value::Object(object) => {
                let mut array = ArrayValue::new();
                for (name, prop) in &object.borrow().properties {
                    array.insert(ArrayKey::Str(name.clone()), prop.clone());
                }
                Value::Array(array)
            }
            other => Value::Array(ArrayValue::from_list([other.clone()])),
        },
    }
}

/// Three-way comparison with loose typing.
pub fn compare(left: &Value, right: &Value) -> Ordering {
    match (left, right) {
        (Value::String(a), Value::String(b)) => match (left.to_number(), right.to_number()) {
            (Some(x), Some(y)) => cmp_f64(x.as_f64(), y.as_f64()),
            _ => a.cmp(b),
        },
        (Value::Bool(_), _) | (_, Value::Bool(_)) | (Value::Null, _) | (_, Value::Null) => {
            left.is_truthy().cmp(&right.is_truthy())
        }
        (Value::Array(a), Value::Array(b)) => a.len().cmp(&b.len()),
        _ => match (left.to_number(), right.to_number()) {
            (Some(x), Some(y)) => cmp_f64(x.as_f64(), y.as_f64()),
            _ => left.to_output_string().cmp(&right.to_output_string()),
        },
    }
}

fn cmp_f64(a: f64, b: f64) -> Ordering {
    a.partial_cmp(&b).unwrap_or(Ordering::Equal)
}

fn number_value(n: Number) -> Value {
    match n {
        Number::Int(i) => Value::Int(i),
        Number::Float(f) => Value::Float(f),
    }
}

/// Numeric prefix of a string, as used when a non-numeric string meets an
/// arithmetic operator (`"12abc"` → 12).
fn leading_number(value: &Value) -> Option<Number> {
    let Value::String(s) = value else {
        return None;
    };
    let s = s.trim_start();
    let end = s
        .char_indices()
        .take_while(|(i, c)| {
            c.is_ascii_digit() || *c == '.' || (*i == 0 && (*c == '-' || *c == '+'))
        })
        .map(|(i, c)| i + c.len_utf8())
        .last()?;
    let prefix = &s[..end];
    prefix
        .parse::<i64>()
        .map(Number::Int)
        .or_else(|_| prefix.parse::<f64>().map(Number::Float))
        .ok()
}

fn operand(op: BinaryOp, value: &Value, other: &Value) -> Result<Number> {
    match value {
        Value::Array(_)
        | Value::Object(_)
        | Value::Closure(_)
        | Value::Enum(_)
        | Value::Resource(_) => {
            Err(Error::exception(
                "TypeError",
                format!(
                    "Unsupported operand types: {} {} {}",
                    value.type_name(),
                    op.as_str(),
                    other.type_name()
                ),
            ))
        }
        _ => Ok(value
            .to_number()
            .or_else(|| leading_number(value))
            .unwrap_or(Number::Int(0))),
    }
}

fn int_operand(op: BinaryOp, value: &Value, other: &Value) -> Result<i64> {
    Ok(match operand(op, value, other)? {
        Number::Int(i) => i,
        Number::Float(f) => f as i64,
    })
}

fn arithmetic(op: BinaryOp, left: &Value, right: &Value) -> Result<Value> {
    let a = operand(op, left, right)?;
    let b = operand(op, right, left)?;
    if let (Number::Int(x), Number::Int(y)) = (a, b) {
        let result = match op {
            BinaryOp::Add => x.checked_add(y),
            BinaryOp::Sub => x.checked_sub(y),
            _ => x.checked_mul(y),
        };
        if let Some(i) = result {
            return Ok(Value::Int(i));
        }
    }
    let (x, y) = (a.as_f64(), b.as_f64());
    Ok(Value::Float(match op {
        BinaryOp::Add => x + y,
        BinaryOp::Sub => x - y,
        _ => x * y,
    }))
}

fn divide(left: &Value, right: &Value) -> Result<Value> {
    let a = operand(BinaryOp::Div, left, right)?;
    let b = operand(BinaryOp::Div, right, left)?;
    if b.as_f64() == 0.0 {
        return Err(Error::exception("DivisionByZeroError", "Division by zero"));
    }
    if let (Number::Int(x), Number::Int(y)) = (a, b) {
        if x % y == 0 {
            return Ok(Value::Int(x / y));
        }
    }
    Ok(Value::Float(a.as_f64() / b.as_f64()))
}

fn modulo(left: &Value, right: &Value) -> Result<Value> {
    let a = int_operand(BinaryOp::Mod, left, right)?;
    let b = int_operand(BinaryOp::Mod, right, left)?;
    if b == 0 {
        return Err(Error::exception("DivisionByZeroError", "Modulo by zero"));
    }
    Ok(Value::Int(a.wrapping_rem(b)))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_arithmetic_promotes_on_overflow() {
        assert_eq!(
            binary(BinaryOp::Add, &Value::Int(2), &Value::Int(3)).unwrap(),
            Value::Int(5)
        );
        assert_eq!(
            binary(BinaryOp::Add, &Value::Int(i64::MAX), &Value::Int(1)).unwrap(),
            Value::Float(i64::MAX as f64 + 1.0)
        );
        assert_eq!(
            binary(BinaryOp::Div, &Value::Int(7), &Value::Int(2)).unwrap(),
            Value::Float(3.5)
        );
    }

    #[test]
    fn test_division_by_zero() {
        let err = binary(BinaryOp::Div, &Value::Int(1), &Value::Int(0)).unwrap_err();
        assert!(
            matches!(err, Error::Exception { ref class, .. } if class == "DivisionByZeroError")
        );
    }

    #[test]
    fn test_unsupported_operands() {
        let array = Value::Array(ArrayValue::new());
        let err = binary(BinaryOp::Add, &array, &Value::Int(1)).unwrap_err();
        assert_eq!(err.to_string(), "TypeError: Unsupported operand types: array + int");
    }

    #[test]
    fn test_compare_and_cast() {
        assert_eq!(compare(&Value::string("10"), &Value::string("9")), Ordering::Greater);
        assert_eq!(compare(&Value::string("abc"), &Value::string("abd")), Ordering::Less);
        assert_eq!(cast(CastType::Int, &Value::string("12abc")), Value::Int(12));
        assert_eq!(cast(CastType::Bool, &Value::string("0")), Value::Bool(false));
    }
}
