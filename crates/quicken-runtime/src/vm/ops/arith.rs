//! Operators, comparisons and truth tests

use super::HandlerResult;
use crate::error::VmError;
use crate::opcode::Opcode;
use crate::value::{ListRef, Value};
use crate::vm::{ControlFlow, Instr, Vm};
use std::cmp::Ordering;
use std::sync::Arc;

/// `BINARY_OP` operator codes. In-place forms are the plain code plus
/// [`nb::INPLACE_OFFSET`].
pub mod nb {
    pub const ADD: u32 = 0;
    pub const AND: u32 = 1;
    pub const FLOOR_DIVIDE: u32 = 2;
    pub const LSHIFT: u32 = 3;
    pub const MATRIX_MULTIPLY: u32 = 4;
    pub const MULTIPLY: u32 = 5;
    pub const REMAINDER: u32 = 6;
    pub const OR: u32 = 7;
    pub const POWER: u32 = 8;
    pub const RSHIFT: u32 = 9;
    pub const SUBTRACT: u32 = 10;
    pub const TRUE_DIVIDE: u32 = 11;
    pub const XOR: u32 = 12;
    pub const INPLACE_OFFSET: u32 = 13;

    const SYMBOLS: [&str; 13] = [
        "+", "&", "//", "<<", "@", "*", "%", "|", "**", ">>", "-", "/", "^",
    ];

    /// Source form of an operator code, e.g. `+` or `+=`.
    pub fn symbol(code: u32) -> Option<String> {
        if code < INPLACE_OFFSET {
            Some(SYMBOLS[code as usize].to_string())
        } else {
            SYMBOLS
                .get((code - INPLACE_OFFSET) as usize)
                .map(|s| format!("{s}="))
        }
    }

    /// Operator code for `+`, `+=`, `**` and so on.
    pub fn from_symbol(text: &str) -> Option<u32> {
        if let Some(code) = SYMBOLS.iter().position(|s| *s == text) {
            return Some(code as u32);
        }
        let plain = text.strip_suffix('=')?;
        SYMBOLS
            .iter()
            .position(|s| *s == plain)
            .map(|code| code as u32 + INPLACE_OFFSET)
    }

    /// Plain operator code with the in-place offset removed.
    pub fn plain(code: u32) -> u32 {
        if code >= INPLACE_OFFSET {
            code - INPLACE_OFFSET
        } else {
            code
        }
    }
}

/// `COMPARE_OP` comparison kinds, stored in `oparg >> 5`.
pub mod cmp {
    pub const LT: u32 = 0;
    pub const LE: u32 = 1;
    pub const EQ: u32 = 2;
    pub const NE: u32 = 3;
    pub const GT: u32 = 4;
    pub const GE: u32 = 5;
    /// Bit requesting the result be coerced to `bool`.
    pub const COERCE_BOOL: u32 = 16;

    const SYMBOLS: [&str; 6] = ["<", "<=", "==", "!=", ">", ">="];

    pub fn symbol(kind: u32) -> Option<&'static str> {
        SYMBOLS.get(kind as usize).copied()
    }

    pub fn from_symbol(text: &str) -> Option<u32> {
        SYMBOLS.iter().position(|s| *s == text).map(|k| k as u32)
    }
}

// ===== BINARY_OP =====

pub(crate) fn binary_op(vm: &mut Vm, instr: Instr) -> HandlerResult {
    vm.observe(&instr, Opcode::BinaryOp);
    let right = vm.pop(&instr)?;
    let left = vm.pop(&instr)?;
    let result = binary(instr.arg, &left, &right)?;
    vm.push(result);
    Ok(ControlFlow::Continue)
}

fn unsupported_operands(code: u32, left: &Value, right: &Value) -> VmError {
    let symbol = nb::symbol(nb::plain(code)).unwrap_or_else(|| "?".to_string());
    VmError::type_error(format!(
        "unsupported operand type(s) for {}: '{}' and '{}'",
        symbol,
        left.type_name(),
        right.type_name()
    ))
}

fn overflow() -> VmError {
    VmError::Overflow("integer result out of range".into())
}

/// Apply operator `code` (in-place forms included).
pub fn binary(code: u32, left: &Value, right: &Value) -> Result<Value, VmError> {
    if code >= 2 * nb::INPLACE_OFFSET {
        return Err(VmError::ValueError(format!("invalid BINARY_OP operator {code}")));
    }
    let op = nb::plain(code);
    // No built-in type implements `@`.
    if op == nb::MATRIX_MULTIPLY {
        return Err(unsupported_operands(code, left, right));
    }
    match (left, right) {
        (Value::Str(a), Value::Str(b)) if op == nb::ADD => {
            let mut joined = String::with_capacity(a.len() + b.len());
            joined.push_str(a);
            joined.push_str(b);
            Ok(Value::str(joined))
        }
        (Value::Str(s), n) | (n, Value::Str(s)) if op == nb::MULTIPLY && n.as_int().is_some() => {
            let times = repeat_count(n)?;
            Ok(Value::str(s.repeat(times)))
        }
        (Value::List(a), Value::List(b)) if op == nb::ADD => {
            let mut items = a.lock().clone();
            items.extend(b.lock().iter().cloned());
            Ok(Value::list(items))
        }
        (Value::List(items), n) | (n, Value::List(items))
            if op == nb::MULTIPLY && n.as_int().is_some() =>
        {
            Ok(Value::list(repeat_items(&items.lock(), repeat_count(n)?)))
        }
        (Value::Tuple(a), Value::Tuple(b)) if op == nb::ADD => {
            Ok(Value::tuple(a.iter().chain(b.iter()).cloned().collect()))
        }
        (Value::Tuple(items), n) | (n, Value::Tuple(items))
            if op == nb::MULTIPLY && n.as_int().is_some() =>
        {
            Ok(Value::tuple(repeat_items(items, repeat_count(n)?)))
        }
        (Value::Float(_), _) | (_, Value::Float(_)) => match (left.as_float(), right.as_float()) {
            (Some(a), Some(b)) => float_binary(op, a, b)
                .ok_or_else(|| unsupported_operands(code, left, right))?,
            _ => Err(unsupported_operands(code, left, right)),
        },
        _ => match (left.as_int(), right.as_int()) {
            (Some(a), Some(b)) => int_binary(op, a, b)
                .ok_or_else(|| unsupported_operands(code, left, right))?,
            _ => Err(unsupported_operands(code, left, right)),
        },
    }
}

fn repeat_count(n: &Value) -> Result<usize, VmError> {
    let n = n.as_int().unwrap_or(0);
    usize::try_from(n.max(0)).map_err(|_| overflow())
}

fn repeat_items(items: &[Value], times: usize) -> Vec<Value> {
    let mut out = Vec::with_capacity(items.len().saturating_mul(times));
    for _ in 0..times {
        out.extend(items.iter().cloned());
    }
    out
}

/// Integer arithmetic with Python semantics. `None` when the operator does
/// not apply to ints.
pub(crate) fn int_binary(op: u32, a: i64, b: i64) -> Option<Result<Value, VmError>> {
    let result = match op {
        nb::ADD => a.checked_add(b).map(Value::Int).ok_or_else(overflow),
        nb::SUBTRACT => a.checked_sub(b).map(Value::Int).ok_or_else(overflow),
        nb::MULTIPLY => a.checked_mul(b).map(Value::Int).ok_or_else(overflow),
        nb::FLOOR_DIVIDE => floor_div(a, b).map(Value::Int),
        nb::REMAINDER => floor_mod(a, b).map(Value::Int),
        nb::TRUE_DIVIDE => {
            if b == 0 {
                Err(VmError::ZeroDivision("division by zero".into()))
            } else {
                Ok(Value::Float(a as f64 / b as f64))
            }
        }
        nb::POWER => int_pow(a, b),
        nb::LSHIFT => {
            if b < 0 {
                Err(VmError::ValueError("negative shift count".into()))
            } else if a == 0 {
                Ok(Value::Int(0))
            } else if b >= 64 || (a << b) >> b != a {
                Err(overflow())
            } else {
                Ok(Value::Int(a << b))
            }
        }
        nb::RSHIFT => {
            if b < 0 {
                Err(VmError::ValueError("negative shift count".into()))
            } else {
                Ok(Value::Int(a >> b.min(63)))
            }
        }
        nb::AND => Ok(Value::Int(a & b)),
        nb::OR => Ok(Value::Int(a | b)),
        nb::XOR => Ok(Value::Int(a ^ b)),
        _ => return None,
    };
    Some(result)
}

fn floor_div(a: i64, b: i64) -> Result<i64, VmError> {
    if b == 0 {
        return Err(VmError::ZeroDivision(
            "integer division or modulo by zero".into(),
        ));
    }
    let q = a.checked_div(b).ok_or_else(overflow)?;
    if a % b != 0 && ((a < 0) != (b < 0)) {
        Ok(q - 1)
    } else {
        Ok(q)
    }
}

fn floor_mod(a: i64, b: i64) -> Result<i64, VmError> {
    if b == 0 {
        return Err(VmError::ZeroDivision(
            "integer division or modulo by zero".into(),
        ));
    }
    let r = a.checked_rem(b).unwrap_or(0);
    if r != 0 && ((r < 0) != (b < 0)) {
        Ok(r + b)
    } else {
        Ok(r)
    }
}

fn int_pow(a: i64, b: i64) -> Result<Value, VmError> {
    if b < 0 {
        if a == 0 {
            return Err(VmError::ZeroDivision(
                "0.0 cannot be raised to a negative power".into(),
            ));
        }
        return Ok(Value::Float((a as f64).powf(b as f64)));
    }
    let exp = u32::try_from(b).map_err(|_| overflow())?;
    a.checked_pow(exp).map(Value::Int).ok_or_else(overflow)
}

pub(crate) fn float_binary(op: u32, a: f64, b: f64) -> Option<Result<Value, VmError>> {
    let result = match op {
        nb::ADD => Ok(a + b),
        nb::SUBTRACT => Ok(a - b),
        nb::MULTIPLY => Ok(a * b),
        nb::TRUE_DIVIDE => {
            if b == 0.0 {
                Err(VmError::ZeroDivision("float division by zero".into()))
            } else {
                Ok(a / b)
            }
        }
        nb::FLOOR_DIVIDE => {
            if b == 0.0 {
                Err(VmError::ZeroDivision("float floor division by zero".into()))
            } else {
                Ok((a / b).floor())
            }
        }
        nb::REMAINDER => {
            if b == 0.0 {
                Err(VmError::ZeroDivision("float modulo".into()))
            } else {
                Ok(a - b * (a / b).floor())
            }
        }
        nb::POWER => {
            if a == 0.0 && b < 0.0 {
                Err(VmError::ZeroDivision(
                    "0.0 cannot be raised to a negative power".into(),
                ))
            } else {
                Ok(a.powf(b))
            }
        }
        _ => return None,
    };
    Some(result.map(Value::Float))
}

// ===== Unary =====

pub(crate) fn unary_negative(vm: &mut Vm, instr: Instr) -> HandlerResult {
    let value = vm.pop(&instr)?;
    let result = match &value {
        Value::Float(x) => Value::Float(-x),
        other => match other.as_int() {
            Some(n) => Value::Int(n.checked_neg().ok_or_else(overflow)?),
            None => {
                return Err(VmError::type_error(format!(
                    "bad operand type for unary -: '{}'",
                    other.type_name()
                )))
            }
        },
    };
    vm.push(result);
    Ok(ControlFlow::Continue)
}

pub(crate) fn unary_not(vm: &mut Vm, instr: Instr) -> HandlerResult {
    let value = vm.pop(&instr)?;
    vm.push(Value::Bool(!value.is_truthy()));
    Ok(ControlFlow::Continue)
}

pub(crate) fn unary_invert(vm: &mut Vm, instr: Instr) -> HandlerResult {
    let value = vm.pop(&instr)?;
    let n = value.as_int().ok_or_else(|| {
        VmError::type_error(format!(
            "bad operand type for unary ~: '{}'",
            value.type_name()
        ))
    })?;
    vm.push(Value::Int(!n));
    Ok(ControlFlow::Continue)
}

pub(crate) fn to_bool(vm: &mut Vm, instr: Instr) -> HandlerResult {
    vm.observe(&instr, Opcode::ToBool);
    let value = vm.pop(&instr)?;
    vm.push(Value::Bool(value.is_truthy()));
    Ok(ControlFlow::Continue)
}

// ===== Comparisons =====

pub(crate) fn compare_op(vm: &mut Vm, instr: Instr) -> HandlerResult {
    vm.observe(&instr, Opcode::CompareOp);
    let right = vm.pop(&instr)?;
    let left = vm.pop(&instr)?;
    let result = compare(instr.arg >> 5, &left, &right)?;
    vm.push(Value::Bool(result));
    Ok(ControlFlow::Continue)
}

/// Evaluate comparison `kind` (`oparg >> 5`).
pub fn compare(kind: u32, left: &Value, right: &Value) -> Result<bool, VmError> {
    match kind {
        cmp::EQ => return Ok(left == right),
        cmp::NE => return Ok(left != right),
        cmp::LT | cmp::LE | cmp::GT | cmp::GE => {}
        _ => {
            return Err(VmError::ValueError(format!(
                "invalid COMPARE_OP kind {kind}"
            )))
        }
    }
    if matches!(left, Value::Float(_)) || matches!(right, Value::Float(_)) {
        if let (Some(a), Some(b)) = (left.as_float(), right.as_float()) {
            return Ok(float_compare(kind, a, b));
        }
    }
    let ordering = order(left, right).ok_or_else(|| {
        VmError::type_error(format!(
            "'{}' not supported between instances of '{}' and '{}'",
            cmp::symbol(kind).unwrap_or("?"),
            left.type_name(),
            right.type_name()
        ))
    })?;
    Ok(ordering_matches(kind, ordering))
}

/// IEEE comparison: every ordering against NaN is false, `!=` is true.
pub(crate) fn float_compare(kind: u32, a: f64, b: f64) -> bool {
    match kind {
        cmp::LT => a < b,
        cmp::LE => a <= b,
        cmp::EQ => a == b,
        cmp::NE => a != b,
        cmp::GT => a > b,
        _ => a >= b,
    }
}

pub(crate) fn ordering_matches(kind: u32, ordering: Ordering) -> bool {
    match kind {
        cmp::LT => ordering == Ordering::Less,
        cmp::LE => ordering != Ordering::Greater,
        cmp::GT => ordering == Ordering::Greater,
        cmp::GE => ordering != Ordering::Less,
        cmp::EQ => ordering == Ordering::Equal,
        _ => ordering != Ordering::Equal,
    }
}

fn order(left: &Value, right: &Value) -> Option<Ordering> {
    match (left, right) {
        (Value::Str(a), Value::Str(b)) => Some(a.cmp(b)),
        (Value::Tuple(a), Value::Tuple(b)) => order_seq(a, b),
        (Value::List(a), Value::List(b)) => {
            let (a, b) = snapshot_pair(a, b);
            order_seq(&a, &b)
        }
        (Value::Float(_), _) | (_, Value::Float(_)) => {
            left.as_float()?.partial_cmp(&right.as_float()?)
        }
        _ => Some(left.as_int()?.cmp(&right.as_int()?)),
    }
}

fn snapshot_pair(a: &ListRef, b: &ListRef) -> (Vec<Value>, Vec<Value>) {
    let left = a.lock().clone();
    let right = if Arc::ptr_eq(a, b) {
        left.clone()
    } else {
        b.lock().clone()
    };
    (left, right)
}

fn order_seq(a: &[Value], b: &[Value]) -> Option<Ordering> {
    for (x, y) in a.iter().zip(b.iter()) {
        if x != y {
            return order(x, y);
        }
    }
    Some(a.len().cmp(&b.len()))
}

/// `is` / `is not` (oparg 1).
pub(crate) fn is_op(vm: &mut Vm, instr: Instr) -> HandlerResult {
    let right = vm.pop(&instr)?;
    let left = vm.pop(&instr)?;
    vm.push(Value::Bool(left.is(&right) != (instr.arg == 1)));
    Ok(ControlFlow::Continue)
}

/// `in` / `not in` (oparg 1). The container is on top.
pub(crate) fn contains_op(vm: &mut Vm, instr: Instr) -> HandlerResult {
    let container = vm.pop(&instr)?;
    let item = vm.pop(&instr)?;
    let found = contains(&container, &item)?;
    vm.push(Value::Bool(found != (instr.arg == 1)));
    Ok(ControlFlow::Continue)
}

pub(crate) fn contains(container: &Value, item: &Value) -> Result<bool, VmError> {
    match (container, item) {
        (Value::Str(haystack), Value::Str(needle)) => Ok(haystack.contains(&**needle)),
        (Value::Str(_), other) => Err(VmError::type_error(format!(
            "'in <string>' requires string as left operand, not {}",
            other.type_name()
        ))),
        (Value::List(items), _) => Ok(items.lock().iter().any(|v| v == item)),
        (Value::Tuple(items), _) => Ok(items.iter().any(|v| v == item)),
        (Value::Range(range), _) => Ok(item.as_int().map_or(false, |n| range.contains(n))),
        (other, _) => Err(VmError::type_error(format!(
            "argument of type '{}' is not iterable",
            other.type_name()
        ))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use rstest::rstest;

    #[rstest]
    #[case(nb::ADD, 7, 2, Value::Int(9))]
    #[case(nb::SUBTRACT, 7, 2, Value::Int(5))]
    #[case(nb::MULTIPLY, 7, 2, Value::Int(14))]
    #[case(nb::FLOOR_DIVIDE, -7, 2, Value::Int(-4))]
    #[case(nb::REMAINDER, -7, 2, Value::Int(1))]
    #[case(nb::REMAINDER, 7, -2, Value::Int(-1))]
    #[case(nb::TRUE_DIVIDE, 7, 2, Value::Float(3.5))]
    #[case(nb::POWER, 2, 10, Value::Int(1024))]
    #[case(nb::POWER, 2, -1, Value::Float(0.5))]
    #[case(nb::LSHIFT, 1, 4, Value::Int(16))]
    #[case(nb::RSHIFT, -16, 2, Value::Int(-4))]
    #[case(nb::AND, 6, 3, Value::Int(2))]
    #[case(nb::OR, 6, 3, Value::Int(7))]
    #[case(nb::XOR, 6, 3, Value::Int(5))]
    #[case(nb::ADD + nb::INPLACE_OFFSET, 1, 1, Value::Int(2))]
    fn test_int_operators(#[case] code: u32, #[case] a: i64, #[case] b: i64, #[case] expected: Value) {
        assert_eq!(binary(code, &Value::Int(a), &Value::Int(b)), Ok(expected));
    }

    #[test]
    fn test_overflow_and_zero_division() {
        assert!(matches!(
            binary(nb::ADD, &Value::Int(i64::MAX), &Value::Int(1)),
            Err(VmError::Overflow(_))
        ));
        assert!(matches!(
            binary(nb::FLOOR_DIVIDE, &Value::Int(1), &Value::Int(0)),
            Err(VmError::ZeroDivision(_))
        ));
        assert!(matches!(
            binary(nb::TRUE_DIVIDE, &Value::Float(1.0), &Value::Int(0)),
            Err(VmError::ZeroDivision(_))
        ));
    }

    #[test]
    fn test_sequence_operators() {
        assert_eq!(
            binary(nb::ADD, &Value::str("ab"), &Value::str("cd")),
            Ok(Value::str("abcd"))
        );
        assert_eq!(
            binary(nb::MULTIPLY, &Value::Int(3), &Value::str("x")),
            Ok(Value::str("xxx"))
        );
        assert_eq!(
            binary(
                nb::ADD,
                &Value::list(vec![Value::Int(1)]),
                &Value::list(vec![Value::Int(2)])
            ),
            Ok(Value::list(vec![Value::Int(1), Value::Int(2)]))
        );
    }

    #[test]
    fn test_type_error_message() {
        assert_eq!(
            binary(nb::SUBTRACT, &Value::str("a"), &Value::Int(1)),
            Err(VmError::TypeError(
                "unsupported operand type(s) for -: 'str' and 'int'".into()
            ))
        );
        assert_eq!(
            binary(nb::MATRIX_MULTIPLY, &Value::Float(1.0), &Value::Float(2.0)),
            Err(VmError::TypeError(
                "unsupported operand type(s) for @: 'float' and 'float'".into()
            ))
        );
        assert!(binary(nb::XOR, &Value::Float(1.0), &Value::Int(1)).is_err());
    }

    #[test]
    fn test_float_operators() {
        assert_eq!(
            binary(nb::ADD, &Value::Float(1.5), &Value::Int(1)),
            Ok(Value::Float(2.5))
        );
        assert_eq!(
            binary(nb::REMAINDER, &Value::Float(-1.0), &Value::Float(3.0)),
            Ok(Value::Float(2.0))
        );
    }

    #[test]
    fn test_symbols() {
        assert_eq!(nb::from_symbol("+"), Some(nb::ADD));
        assert_eq!(nb::from_symbol("**="), Some(nb::POWER + nb::INPLACE_OFFSET));
        assert_eq!(nb::from_symbol("<>"), None);
        assert_eq!(nb::symbol(nb::INPLACE_OFFSET + nb::SUBTRACT).as_deref(), Some("-="));
        assert_eq!(cmp::from_symbol(">="), Some(cmp::GE));
    }

    #[rstest]
    #[case(cmp::LT, Value::Int(1), Value::Float(1.5), true)]
    #[case(cmp::GE, Value::str("b"), Value::str("a"), true)]
    #[case(cmp::EQ, Value::Int(1), Value::Bool(true), true)]
    #[case(cmp::NE, Value::None, Value::None, false)]
    #[case(cmp::LE, Value::tuple(vec![Value::Int(1)]), Value::tuple(vec![Value::Int(1), Value::Int(0)]), true)]
    fn test_compare(#[case] kind: u32, #[case] a: Value, #[case] b: Value, #[case] expected: bool) {
        assert_eq!(compare(kind, &a, &b), Ok(expected));
    }

    #[test]
    fn test_nan_comparisons() {
        assert_eq!(compare(cmp::LT, &Value::Float(f64::NAN), &Value::Int(1)), Ok(false));
        assert_eq!(compare(cmp::GE, &Value::Float(f64::NAN), &Value::Int(1)), Ok(false));
        assert_eq!(
            compare(cmp::NE, &Value::Float(f64::NAN), &Value::Float(f64::NAN)),
            Ok(true)
        );
    }

    #[test]
    fn test_unorderable() {
        assert!(matches!(
            compare(cmp::LT, &Value::str("a"), &Value::Int(1)),
            Err(VmError::TypeError(_))
        ));
    }

    #[test]
    fn test_contains() {
        assert_eq!(contains(&Value::str("hello"), &Value::str("ell")), Ok(true));
        assert_eq!(
            contains(&Value::list(vec![Value::Int(1)]), &Value::Float(1.0)),
            Ok(true)
        );
        assert!(contains(&Value::Int(3), &Value::Int(1)).is_err());
    }
}
