//! Builtin functions
//!
//! Resolved by `LOAD_GLOBAL` when no global of the same name exists.

use super::ops::arith::{self, nb};
use super::Vm;
use crate::error::VmError;
use crate::value::{Arity, Builtin, RangeValue, Value};

pub static BUILTINS: &[Builtin] = &[
    Builtin {
        name: "len",
        arity: Arity::Exact(1),
        func: builtin_len,
    },
    Builtin {
        name: "print",
        arity: Arity::Any,
        func: builtin_print,
    },
    Builtin {
        name: "abs",
        arity: Arity::Exact(1),
        func: builtin_abs,
    },
    Builtin {
        name: "range",
        arity: Arity::Between(1, 3),
        func: builtin_range,
    },
    Builtin {
        name: "str",
        arity: Arity::Between(0, 1),
        func: builtin_str,
    },
    Builtin {
        name: "sum",
        arity: Arity::Between(1, 2),
        func: builtin_sum,
    },
    Builtin {
        name: "list",
        arity: Arity::Between(0, 1),
        func: builtin_list,
    },
];

pub fn lookup_builtin(name: &str) -> Option<Builtin> {
    BUILTINS.iter().find(|b| b.name == name).copied()
}

/// `len(x)`; also the fast path of `CALL_NO_KW_LEN`.
pub(crate) fn length(value: &Value) -> Result<usize, VmError> {
    match value {
        Value::Str(s) => Ok(s.chars().count()),
        Value::List(items) => Ok(items.lock().len()),
        Value::Tuple(items) => Ok(items.len()),
        Value::Range(range) => Ok(range.len()),
        other => Err(VmError::type_error(format!(
            "object of type '{}' has no len()",
            other.type_name()
        ))),
    }
}

fn builtin_len(_vm: &Vm, args: &[Value]) -> Result<Value, VmError> {
    let len = length(&args[0])?;
    i64::try_from(len)
        .map(Value::Int)
        .map_err(|_| VmError::Overflow("length does not fit in an int".into()))
}

fn builtin_print(vm: &Vm, args: &[Value]) -> Result<Value, VmError> {
    let mut line = args
        .iter()
        .map(ToString::to_string)
        .collect::<Vec<_>>()
        .join(" ");
    line.push('\n');
    vm.write_output(&line)?;
    Ok(Value::None)
}

fn builtin_abs(_vm: &Vm, args: &[Value]) -> Result<Value, VmError> {
    match &args[0] {
        Value::Float(x) => Ok(Value::Float(x.abs())),
        other => match other.as_int() {
            Some(n) => n
                .checked_abs()
                .map(Value::Int)
                .ok_or_else(|| VmError::Overflow("integer result out of range".into())),
            None => Err(VmError::type_error(format!(
                "bad operand type for abs(): '{}'",
                other.type_name()
            ))),
        },
    }
}

fn int_arg(value: &Value, what: &str) -> Result<i64, VmError> {
    value.as_int().ok_or_else(|| {
        VmError::type_error(format!(
            "'{}' object cannot be interpreted as an integer ({what})",
            value.type_name()
        ))
    })
}

fn builtin_range(_vm: &Vm, args: &[Value]) -> Result<Value, VmError> {
    let (start, stop, step) = match args {
        [stop] => (0, int_arg(stop, "stop")?, 1),
        [start, stop] => (int_arg(start, "start")?, int_arg(stop, "stop")?, 1),
        [start, stop, step] => (
            int_arg(start, "start")?,
            int_arg(stop, "stop")?,
            int_arg(step, "step")?,
        ),
        _ => return Err(VmError::type_error("range expected 1 to 3 arguments")),
    };
    if step == 0 {
        return Err(VmError::ValueError("range() arg 3 must not be zero".into()));
    }
    Ok(Value::Range(RangeValue { start, stop, step }))
}

fn builtin_str(_vm: &Vm, args: &[Value]) -> Result<Value, VmError> {
    Ok(match args.first() {
        Some(value) => Value::str(value.to_string()),
        None => Value::str(""),
    })
}

fn builtin_sum(_vm: &Vm, args: &[Value]) -> Result<Value, VmError> {
    let start = args.get(1).cloned().unwrap_or(Value::Int(0));
    if matches!(start, Value::Str(_)) {
        return Err(VmError::type_error(
            "sum() can't sum strings [use ''.join(seq) instead]",
        ));
    }
    args[0]
        .to_vec()?
        .iter()
        .try_fold(start, |total, item| arith::binary(nb::ADD, &total, item))
}

fn builtin_list(_vm: &Vm, args: &[Value]) -> Result<Value, VmError> {
    match args.first() {
        Some(value) => Ok(Value::list(value.to_vec()?)),
        None => Ok(Value::list(Vec::new())),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use rstest::rstest;

    fn call(name: &str, args: &[Value]) -> Result<Value, VmError> {
        let builtin = lookup_builtin(name).unwrap();
        (builtin.func)(&Vm::new(), args)
    }

    #[rstest]
    #[case("len", vec![Value::str("héllo")], Value::Int(5))]
    #[case("abs", vec![Value::Int(-3)], Value::Int(3))]
    #[case("abs", vec![Value::Float(-1.5)], Value::Float(1.5))]
    #[case("str", vec![Value::Float(2.0)], Value::str("2.0"))]
    #[case("str", vec![], Value::str(""))]
    #[case("sum", vec![Value::list(vec![Value::Int(1), Value::Int(2)])], Value::Int(3))]
    #[case("sum", vec![Value::tuple(vec![Value::Float(0.5)]), Value::Int(1)], Value::Float(1.5))]
    fn test_builtins(#[case] name: &str, #[case] args: Vec<Value>, #[case] expected: Value) {
        assert_eq!(call(name, &args), Ok(expected));
    }

    #[test]
    fn test_range_and_list() {
        let range = call("range", &[Value::Int(5), Value::Int(0), Value::Int(-2)]).unwrap();
        assert_eq!(
            call("list", &[range]),
            Ok(Value::list(vec![Value::Int(5), Value::Int(3), Value::Int(1)]))
        );
        assert_eq!(
            call("range", &[Value::Int(0), Value::Int(1), Value::Int(0)]),
            Err(VmError::ValueError("range() arg 3 must not be zero".into()))
        );
    }

    #[test]
    fn test_len_of_int_is_type_error() {
        assert_eq!(
            call("len", &[Value::Int(1)]),
            Err(VmError::TypeError("object of type 'int' has no len()".into()))
        );
    }

    #[test]
    fn test_lookup() {
        assert!(lookup_builtin("print").is_some());
        assert!(lookup_builtin("eval").is_none());
        assert_eq!(BUILTINS.len(), 7);
    }
}
