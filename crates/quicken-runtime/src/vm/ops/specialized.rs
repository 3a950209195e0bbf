//! Fast paths for specialized opcodes
//!
//! Every handler re-runs its variant's guard. On a pass the fast path runs;
//! a failed guard, or a fast path that cannot finish (integer overflow, an
//! index that moved out of range), de-optimizes the site and runs the generic
//! handler for this execution. Fast paths leave the stack untouched until
//! they know they will succeed.

use super::arith::{self, cmp};
use super::containers::push_unpacked;
use super::control::{enter_function, exhausted_target, pop_call};
use super::stack::push_global;
use super::HandlerResult;
use crate::error::VmError;
use crate::opcode::Opcode;
use crate::specialize::{Guard, FAMILIES};
use crate::value::Value;
use crate::vm::builtins::length;
use crate::vm::{ControlFlow, Instr, Vm};
use once_cell::sync::Lazy;
use std::sync::Arc;

type FastPath = fn(&mut Vm, &Instr) -> Result<Option<ControlFlow>, VmError>;

static GUARDS: Lazy<[Option<Guard>; 256]> = Lazy::new(|| {
    let mut guards: [Option<Guard>; 256] = [None; 256];
    for variant in FAMILIES.iter().flat_map(|family| family.variants.iter()) {
        guards[variant.op as usize] = Some(variant.guard);
    }
    guards
});

#[inline]
fn run(vm: &mut Vm, instr: Instr, variant: Opcode, fast: FastPath) -> HandlerResult {
    let passed = GUARDS[variant as usize].map_or(false, |guard| guard(vm, &instr));
    if passed {
        if let Some(flow) = fast(vm, &instr)? {
            vm.stats().record_hit(variant);
            return Ok(flow);
        }
    }
    vm.deopt(&instr, variant)
}

/// Replace the top `count` values with `value`.
fn replace_top(vm: &mut Vm, count: usize, value: Value, instr: &Instr) -> Result<(), VmError> {
    vm.pop_n(count, instr)?;
    vm.push(value);
    Ok(())
}

// ===== BINARY_OP =====

fn int_operands(vm: &Vm) -> Option<(i64, i64)> {
    match (vm.peek(1)?, vm.peek(0)?) {
        (Value::Int(a), Value::Int(b)) => Some((*a, *b)),
        _ => None,
    }
}

fn float_operands(vm: &Vm) -> Option<(f64, f64)> {
    match (vm.peek(1)?, vm.peek(0)?) {
        (Value::Float(a), Value::Float(b)) => Some((*a, *b)),
        _ => None,
    }
}

fn int_fast(vm: &mut Vm, instr: &Instr, op: fn(i64, i64) -> Option<i64>) -> Result<Option<ControlFlow>, VmError> {
    let Some(result) = int_operands(vm).and_then(|(a, b)| op(a, b)) else {
        return Ok(None);
    };
    replace_top(vm, 2, Value::Int(result), instr)?;
    Ok(Some(ControlFlow::Continue))
}

fn float_fast(vm: &mut Vm, instr: &Instr, op: fn(f64, f64) -> f64) -> Result<Option<ControlFlow>, VmError> {
    let Some((a, b)) = float_operands(vm) else {
        return Ok(None);
    };
    replace_top(vm, 2, Value::Float(op(a, b)), instr)?;
    Ok(Some(ControlFlow::Continue))
}

pub(crate) fn binary_op_add_int(vm: &mut Vm, instr: Instr) -> HandlerResult {
    run(vm, instr, Opcode::BinaryOpAddInt, |vm, instr| {
        int_fast(vm, instr, i64::checked_add)
    })
}

pub(crate) fn binary_op_subtract_int(vm: &mut Vm, instr: Instr) -> HandlerResult {
    run(vm, instr, Opcode::BinaryOpSubtractInt, |vm, instr| {
        int_fast(vm, instr, i64::checked_sub)
    })
}

pub(crate) fn binary_op_multiply_int(vm: &mut Vm, instr: Instr) -> HandlerResult {
    run(vm, instr, Opcode::BinaryOpMultiplyInt, |vm, instr| {
        int_fast(vm, instr, i64::checked_mul)
    })
}

pub(crate) fn binary_op_add_float(vm: &mut Vm, instr: Instr) -> HandlerResult {
    run(vm, instr, Opcode::BinaryOpAddFloat, |vm, instr| {
        float_fast(vm, instr, |a, b| a + b)
    })
}

pub(crate) fn binary_op_subtract_float(vm: &mut Vm, instr: Instr) -> HandlerResult {
    run(vm, instr, Opcode::BinaryOpSubtractFloat, |vm, instr| {
        float_fast(vm, instr, |a, b| a - b)
    })
}

pub(crate) fn binary_op_multiply_float(vm: &mut Vm, instr: Instr) -> HandlerResult {
    run(vm, instr, Opcode::BinaryOpMultiplyFloat, |vm, instr| {
        float_fast(vm, instr, |a, b| a * b)
    })
}

fn concat(vm: &Vm) -> Option<Value> {
    match (vm.peek(1)?, vm.peek(0)?) {
        (Value::Str(a), Value::Str(b)) => {
            let mut joined = String::with_capacity(a.len() + b.len());
            joined.push_str(a);
            joined.push_str(b);
            Some(Value::str(joined))
        }
        _ => None,
    }
}

pub(crate) fn binary_op_add_unicode(vm: &mut Vm, instr: Instr) -> HandlerResult {
    run(vm, instr, Opcode::BinaryOpAddUnicode, |vm, instr| {
        let Some(joined) = concat(vm) else {
            return Ok(None);
        };
        replace_top(vm, 2, joined, instr)?;
        Ok(Some(ControlFlow::Continue))
    })
}

/// Concatenate and store straight into the local the following
/// `STORE_FAST` names, then skip that instruction.
pub(crate) fn binary_op_inplace_add_unicode(vm: &mut Vm, instr: Instr) -> HandlerResult {
    run(vm, instr, Opcode::BinaryOpInplaceAddUnicode, |vm, instr| {
        let Some((op, local)) = vm
            .code()
            .and_then(|code| code.load_unit(instr.next))
            .map(crate::bytecode::split)
        else {
            return Ok(None);
        };
        if op != Opcode::StoreFast as u8 {
            return Ok(None);
        }
        let Some(joined) = concat(vm) else {
            return Ok(None);
        };
        vm.pop_n(2, instr)?;
        *vm.local_slot(u32::from(local), instr)? = joined;
        Ok(Some(ControlFlow::Jump(instr.next + 1)))
    })
}

// ===== COMPARE_OP =====

fn compare_fast(vm: &mut Vm, instr: &Instr, result: Option<bool>) -> Result<Option<ControlFlow>, VmError> {
    let Some(result) = result else {
        return Ok(None);
    };
    replace_top(vm, 2, Value::Bool(result), instr)?;
    Ok(Some(ControlFlow::Continue))
}

pub(crate) fn compare_op_int(vm: &mut Vm, instr: Instr) -> HandlerResult {
    run(vm, instr, Opcode::CompareOpInt, |vm, instr| {
        let kind = instr.arg >> 5;
        let result = int_operands(vm)
            .filter(|_| kind <= cmp::GE)
            .map(|(a, b)| arith::ordering_matches(kind, a.cmp(&b)));
        compare_fast(vm, instr, result)
    })
}

pub(crate) fn compare_op_float(vm: &mut Vm, instr: Instr) -> HandlerResult {
    run(vm, instr, Opcode::CompareOpFloat, |vm, instr| {
        let kind = instr.arg >> 5;
        let result = float_operands(vm)
            .filter(|_| kind <= cmp::GE)
            .map(|(a, b)| arith::float_compare(kind, a, b));
        compare_fast(vm, instr, result)
    })
}

pub(crate) fn compare_op_str(vm: &mut Vm, instr: Instr) -> HandlerResult {
    run(vm, instr, Opcode::CompareOpStr, |vm, instr| {
        let kind = instr.arg >> 5;
        let result = match (vm.peek(1), vm.peek(0)) {
            (Some(Value::Str(a)), Some(Value::Str(b))) if kind == cmp::EQ => Some(a == b),
            (Some(Value::Str(a)), Some(Value::Str(b))) if kind == cmp::NE => Some(a != b),
            _ => None,
        };
        compare_fast(vm, instr, result)
    })
}

// ===== TO_BOOL =====

fn truth_fast(vm: &mut Vm, instr: &Instr) -> Result<Option<ControlFlow>, VmError> {
    let truth = vm.peek_at(0, instr)?.is_truthy();
    *vm.peek_mut(0, instr)? = Value::Bool(truth);
    Ok(Some(ControlFlow::Continue))
}

/// Already a bool: nothing to do.
pub(crate) fn to_bool_bool(vm: &mut Vm, instr: Instr) -> HandlerResult {
    run(vm, instr, Opcode::ToBoolBool, |_, _| Ok(Some(ControlFlow::Continue)))
}

pub(crate) fn to_bool_int(vm: &mut Vm, instr: Instr) -> HandlerResult {
    run(vm, instr, Opcode::ToBoolInt, truth_fast)
}

pub(crate) fn to_bool_list(vm: &mut Vm, instr: Instr) -> HandlerResult {
    run(vm, instr, Opcode::ToBoolList, truth_fast)
}

pub(crate) fn to_bool_none(vm: &mut Vm, instr: Instr) -> HandlerResult {
    run(vm, instr, Opcode::ToBoolNone, |vm, instr| {
        *vm.peek_mut(0, instr)? = Value::Bool(false);
        Ok(Some(ControlFlow::Continue))
    })
}

pub(crate) fn to_bool_str(vm: &mut Vm, instr: Instr) -> HandlerResult {
    run(vm, instr, Opcode::ToBoolStr, truth_fast)
}

pub(crate) fn to_bool_always_true(vm: &mut Vm, instr: Instr) -> HandlerResult {
    run(vm, instr, Opcode::ToBoolAlwaysTrue, |vm, instr| {
        *vm.peek_mut(0, instr)? = Value::Bool(true);
        Ok(Some(ControlFlow::Continue))
    })
}

// ===== BINARY_SUBSCR / STORE_SUBSCR =====

fn top_index(vm: &Vm) -> Option<usize> {
    match vm.peek(0)? {
        Value::Int(n) => usize::try_from(*n).ok(),
        _ => None,
    }
}

fn subscr_fast(vm: &mut Vm, instr: &Instr, item: Option<Value>) -> Result<Option<ControlFlow>, VmError> {
    let Some(item) = item else {
        return Ok(None);
    };
    replace_top(vm, 2, item, instr)?;
    Ok(Some(ControlFlow::Continue))
}

pub(crate) fn binary_subscr_list_int(vm: &mut Vm, instr: Instr) -> HandlerResult {
    run(vm, instr, Opcode::BinarySubscrListInt, |vm, instr| {
        let item = match (vm.peek(1), top_index(vm)) {
            (Some(Value::List(items)), Some(index)) => items.lock().get(index).cloned(),
            _ => None,
        };
        subscr_fast(vm, instr, item)
    })
}

pub(crate) fn binary_subscr_tuple_int(vm: &mut Vm, instr: Instr) -> HandlerResult {
    run(vm, instr, Opcode::BinarySubscrTupleInt, |vm, instr| {
        let item = match (vm.peek(1), top_index(vm)) {
            (Some(Value::Tuple(items)), Some(index)) => items.get(index).cloned(),
            _ => None,
        };
        subscr_fast(vm, instr, item)
    })
}

pub(crate) fn binary_subscr_str_int(vm: &mut Vm, instr: Instr) -> HandlerResult {
    run(vm, instr, Opcode::BinarySubscrStrInt, |vm, instr| {
        let item = match (vm.peek(1), top_index(vm)) {
            (Some(Value::Str(s)), Some(index)) if s.is_ascii() => s
                .as_bytes()
                .get(index)
                .map(|byte| Value::str(char::from(*byte).to_string())),
            _ => None,
        };
        subscr_fast(vm, instr, item)
    })
}

pub(crate) fn store_subscr_list_int(vm: &mut Vm, instr: Instr) -> HandlerResult {
    run(vm, instr, Opcode::StoreSubscrListInt, |vm, instr| {
        let (Some(Value::List(items)), Some(index)) = (vm.peek(1).cloned(), top_index(vm)) else {
            return Ok(None);
        };
        let value = vm.peek_at(2, instr)?.clone();
        {
            let mut items = items.lock();
            let Some(slot) = items.get_mut(index) else {
                return Ok(None);
            };
            *slot = value;
        }
        vm.pop_n(3, instr)?;
        Ok(Some(ControlFlow::Continue))
    })
}

// ===== UNPACK_SEQUENCE =====

fn unpack_fast(vm: &mut Vm, instr: &Instr, items: Option<Vec<Value>>) -> Result<Option<ControlFlow>, VmError> {
    let Some(items) = items.filter(|items| items.len() == instr.arg as usize) else {
        return Ok(None);
    };
    vm.pop(instr)?;
    push_unpacked(vm, items);
    Ok(Some(ControlFlow::Continue))
}

fn top_tuple(vm: &Vm) -> Option<Vec<Value>> {
    match vm.peek(0)? {
        Value::Tuple(items) => Some(items.to_vec()),
        _ => None,
    }
}

pub(crate) fn unpack_sequence_tuple(vm: &mut Vm, instr: Instr) -> HandlerResult {
    run(vm, instr, Opcode::UnpackSequenceTuple, |vm, instr| {
        let items = top_tuple(vm);
        unpack_fast(vm, instr, items)
    })
}

pub(crate) fn unpack_sequence_two_tuple(vm: &mut Vm, instr: Instr) -> HandlerResult {
    run(vm, instr, Opcode::UnpackSequenceTwoTuple, |vm, instr| {
        let items = top_tuple(vm);
        unpack_fast(vm, instr, items)
    })
}

pub(crate) fn unpack_sequence_list(vm: &mut Vm, instr: Instr) -> HandlerResult {
    run(vm, instr, Opcode::UnpackSequenceList, |vm, instr| {
        let items = match vm.peek(0) {
            Some(Value::List(items)) => Some(items.lock().clone()),
            _ => None,
        };
        unpack_fast(vm, instr, items)
    })
}

// ===== FOR_ITER =====

fn iter_fast(vm: &mut Vm, instr: &Instr) -> Result<Option<ControlFlow>, VmError> {
    let next = match vm.peek(0) {
        Some(Value::Iter(state)) => state.lock().next_value(),
        _ => return Ok(None),
    };
    match next {
        Some(item) => vm.push(item),
        None => {
            vm.pop(instr)?;
            return Ok(Some(ControlFlow::Jump(exhausted_target(instr))));
        }
    }
    Ok(Some(ControlFlow::Continue))
}

pub(crate) fn for_iter_list(vm: &mut Vm, instr: Instr) -> HandlerResult {
    run(vm, instr, Opcode::ForIterList, iter_fast)
}

pub(crate) fn for_iter_tuple(vm: &mut Vm, instr: Instr) -> HandlerResult {
    run(vm, instr, Opcode::ForIterTuple, iter_fast)
}

pub(crate) fn for_iter_range(vm: &mut Vm, instr: Instr) -> HandlerResult {
    run(vm, instr, Opcode::ForIterRange, iter_fast)
}

// ===== CALL =====

pub(crate) fn call_py_exact_args(vm: &mut Vm, instr: Instr) -> HandlerResult {
    run(vm, instr, Opcode::CallPyExactArgs, |vm, instr| {
        let (callable, args) = pop_call(vm, instr.arg as usize, instr)?;
        let Value::Function(func) = callable else {
            return Err(VmError::type_error("CALL_PY_EXACT_ARGS on a non-function"));
        };
        Ok(Some(enter_function(vm, &func, args)))
    })
}

fn builtin_fast(vm: &mut Vm, instr: &Instr) -> Result<Option<ControlFlow>, VmError> {
    let (callable, args) = pop_call(vm, instr.arg as usize, instr)?;
    let Value::Builtin(builtin) = callable else {
        return Err(VmError::type_error("builtin call on a non-builtin"));
    };
    let result = (builtin.func)(vm, &args)?;
    vm.push(result);
    Ok(Some(ControlFlow::Continue))
}

pub(crate) fn call_no_kw_builtin_fast(vm: &mut Vm, instr: Instr) -> HandlerResult {
    run(vm, instr, Opcode::CallNoKwBuiltinFast, builtin_fast)
}

pub(crate) fn call_no_kw_builtin_o(vm: &mut Vm, instr: Instr) -> HandlerResult {
    run(vm, instr, Opcode::CallNoKwBuiltinO, builtin_fast)
}

pub(crate) fn call_no_kw_len(vm: &mut Vm, instr: Instr) -> HandlerResult {
    run(vm, instr, Opcode::CallNoKwLen, |vm, instr| {
        let len = length(vm.peek_at(0, instr)?)?;
        let len = i64::try_from(len)
            .map_err(|_| VmError::Overflow("length does not fit in an int".into()))?;
        replace_top(vm, 3, Value::Int(len), instr)?;
        Ok(Some(ControlFlow::Continue))
    })
}

// ===== LOAD_GLOBAL =====

fn global_name(vm: &Vm, instr: &Instr) -> Option<Arc<str>> {
    vm.code()?.names.get((instr.arg >> 1) as usize).cloned()
}

pub(crate) fn load_global_module(vm: &mut Vm, instr: Instr) -> HandlerResult {
    run(vm, instr, Opcode::LoadGlobalModule, |vm, instr| {
        let value = global_name(vm, instr).and_then(|name| vm.global(&name).cloned());
        let Some(value) = value else {
            return Ok(None);
        };
        push_global(vm, value, instr);
        Ok(Some(ControlFlow::Continue))
    })
}

pub(crate) fn load_global_builtin(vm: &mut Vm, instr: Instr) -> HandlerResult {
    run(vm, instr, Opcode::LoadGlobalBuiltin, |vm, instr| {
        let value = global_name(vm, instr)
            .filter(|name| vm.global(name).is_none())
            .and_then(|name| vm.builtin(&name).cloned());
        let Some(value) = value else {
            return Ok(None);
        };
        push_global(vm, value, instr);
        Ok(Some(ControlFlow::Continue))
    })
}
