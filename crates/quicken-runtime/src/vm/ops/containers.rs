//! Lists, tuples, subscripts, unpacking and iteration setup

use super::HandlerResult;
use crate::error::VmError;
use crate::opcode::Opcode;
use crate::value::{IterState, Value};
use crate::vm::{ControlFlow, Instr, Vm};

pub(crate) fn build_list(vm: &mut Vm, instr: Instr) -> HandlerResult {
    let items = vm.pop_n(instr.arg as usize, &instr)?;
    vm.push(Value::list(items));
    Ok(ControlFlow::Continue)
}

pub(crate) fn build_tuple(vm: &mut Vm, instr: Instr) -> HandlerResult {
    let items = vm.pop_n(instr.arg as usize, &instr)?;
    vm.push(Value::tuple(items));
    Ok(ControlFlow::Continue)
}

/// Pop a value and append it to the list `oparg` slots down.
pub(crate) fn list_append(vm: &mut Vm, instr: Instr) -> HandlerResult {
    let value = vm.pop(&instr)?;
    let list = target_list(vm, &instr)?;
    list.lock().push(value);
    Ok(ControlFlow::Continue)
}

pub(crate) fn list_extend(vm: &mut Vm, instr: Instr) -> HandlerResult {
    let iterable = vm.pop(&instr)?;
    let list = target_list(vm, &instr)?;
    let items = iterable.to_vec()?;
    list.lock().extend(items);
    Ok(ControlFlow::Continue)
}

fn target_list(vm: &Vm, instr: &Instr) -> Result<crate::value::ListRef, VmError> {
    let depth = (instr.arg as usize).checked_sub(1).ok_or(VmError::BadOperand {
        what: "list depth",
        index: 0,
        offset: instr.site,
    })?;
    match vm.peek_at(depth, instr)? {
        Value::List(items) => Ok(items.clone()),
        other => Err(VmError::type_error(format!(
            "{} expects a list, found '{}'",
            instr.name(),
            other.type_name()
        ))),
    }
}

/// Resolve a possibly negative index against `len`.
pub(crate) fn normalize_index(index: i64, len: usize) -> Option<usize> {
    let len = i64::try_from(len).ok()?;
    let resolved = if index < 0 { index + len } else { index };
    if (0..len).contains(&resolved) {
        usize::try_from(resolved).ok()
    } else {
        None
    }
}

fn index_error(kind: &str) -> VmError {
    VmError::IndexError(format!("{kind} index out of range"))
}

fn int_index(container: &Value, key: &Value) -> Result<i64, VmError> {
    key.as_int().ok_or_else(|| {
        VmError::type_error(format!(
            "{} indices must be integers, not {}",
            container.type_name(),
            key.type_name()
        ))
    })
}

pub(crate) fn subscript(container: &Value, key: &Value) -> Result<Value, VmError> {
    match container {
        Value::List(items) => {
            let index = int_index(container, key)?;
            let items = items.lock();
            normalize_index(index, items.len())
                .map(|i| items[i].clone())
                .ok_or_else(|| index_error("list"))
        }
        Value::Tuple(items) => {
            let index = int_index(container, key)?;
            normalize_index(index, items.len())
                .map(|i| items[i].clone())
                .ok_or_else(|| index_error("tuple"))
        }
        Value::Str(s) => {
            let index = int_index(container, key)?;
            let len = s.chars().count();
            normalize_index(index, len)
                .and_then(|i| s.chars().nth(i))
                .map(|ch| Value::str(ch.to_string()))
                .ok_or_else(|| index_error("string"))
        }
        Value::Range(range) => {
            let index = int_index(container, key)?;
            normalize_index(index, range.len())
                .and_then(|i| range.get(i))
                .map(Value::Int)
                .ok_or_else(|| index_error("range object"))
        }
        other => Err(VmError::type_error(format!(
            "'{}' object is not subscriptable",
            other.type_name()
        ))),
    }
}

pub(crate) fn binary_subscr(vm: &mut Vm, instr: Instr) -> HandlerResult {
    vm.observe(&instr, Opcode::BinarySubscr);
    let key = vm.pop(&instr)?;
    let container = vm.pop(&instr)?;
    let value = subscript(&container, &key)?;
    vm.push(value);
    Ok(ControlFlow::Continue)
}

/// `container[key] = value` with stack `[value, container, key]`.
pub(crate) fn store_subscr(vm: &mut Vm, instr: Instr) -> HandlerResult {
    vm.observe(&instr, Opcode::StoreSubscr);
    let key = vm.pop(&instr)?;
    let container = vm.pop(&instr)?;
    let value = vm.pop(&instr)?;
    match &container {
        Value::List(items) => {
            let index = int_index(&container, &key)?;
            let mut items = items.lock();
            let slot = normalize_index(index, items.len())
                .ok_or_else(|| VmError::IndexError("list assignment index out of range".into()))?;
            items[slot] = value;
            Ok(ControlFlow::Continue)
        }
        other => Err(VmError::type_error(format!(
            "'{}' object does not support item assignment",
            other.type_name()
        ))),
    }
}

/// Push the items so the first one ends up on top.
pub(crate) fn push_unpacked(vm: &mut Vm, items: Vec<Value>) {
    for item in items.into_iter().rev() {
        vm.push(item);
    }
}

pub(crate) fn unpack_sequence(vm: &mut Vm, instr: Instr) -> HandlerResult {
    vm.observe(&instr, Opcode::UnpackSequence);
    let sequence = vm.pop(&instr)?;
    let items = sequence.to_vec()?;
    let expected = instr.arg as usize;
    if items.len() < expected {
        return Err(VmError::ValueError(format!(
            "not enough values to unpack (expected {expected}, got {})",
            items.len()
        )));
    }
    if items.len() > expected {
        return Err(VmError::ValueError(format!(
            "too many values to unpack (expected {expected})"
        )));
    }
    push_unpacked(vm, items);
    Ok(ControlFlow::Continue)
}

pub(crate) fn iterate(value: Value) -> Result<Value, VmError> {
    let state = match value {
        Value::Iter(_) => return Ok(value),
        Value::List(items) => IterState::List { items, index: 0 },
        Value::Tuple(items) => IterState::Tuple { items, index: 0 },
        Value::Range(range) => IterState::Range {
            next: range.start,
            stop: range.stop,
            step: range.step,
        },
        Value::Str(s) => IterState::Str {
            chars: s.chars().collect(),
            index: 0,
        },
        other => {
            return Err(VmError::type_error(format!(
                "'{}' object is not iterable",
                other.type_name()
            )))
        }
    };
    Ok(Value::iter(state))
}

pub(crate) fn get_iter(vm: &mut Vm, instr: Instr) -> HandlerResult {
    let iterable = vm.pop(&instr)?;
    let iter = iterate(iterable)?;
    vm.push(iter);
    Ok(ControlFlow::Continue)
}
