//! Jumps, loops, calls and returns

use super::HandlerResult;
use crate::error::VmError;
use crate::opcode::Opcode;
use crate::value::{Builtin, Function, Value};
use crate::vm::{ControlFlow, Frame, Instr, Vm};
use std::sync::Arc;

/// Prefixes are folded by the decoder, so this only runs for a prefix that
/// was jumped to directly.
pub(crate) fn extended_arg(_vm: &mut Vm, instr: Instr) -> HandlerResult {
    Ok(ControlFlow::Jump(instr.next))
}

// ===== Jumps =====

pub(crate) fn jump_forward(_vm: &mut Vm, instr: Instr) -> HandlerResult {
    Ok(ControlFlow::Jump(instr.forward(instr.arg)))
}

pub(crate) fn jump_backward(_vm: &mut Vm, instr: Instr) -> HandlerResult {
    Ok(ControlFlow::Jump(instr.backward(instr.arg)?))
}

fn pop_jump_if(vm: &mut Vm, instr: Instr, test: fn(&Value) -> bool) -> HandlerResult {
    let value = vm.pop(&instr)?;
    if test(&value) {
        Ok(ControlFlow::Jump(instr.forward(instr.arg)))
    } else {
        Ok(ControlFlow::Continue)
    }
}

pub(crate) fn pop_jump_if_true(vm: &mut Vm, instr: Instr) -> HandlerResult {
    pop_jump_if(vm, instr, Value::is_truthy)
}

pub(crate) fn pop_jump_if_false(vm: &mut Vm, instr: Instr) -> HandlerResult {
    pop_jump_if(vm, instr, |v| !v.is_truthy())
}

pub(crate) fn pop_jump_if_none(vm: &mut Vm, instr: Instr) -> HandlerResult {
    pop_jump_if(vm, instr, |v| matches!(v, Value::None))
}

pub(crate) fn pop_jump_if_not_none(vm: &mut Vm, instr: Instr) -> HandlerResult {
    pop_jump_if(vm, instr, |v| !matches!(v, Value::None))
}

// ===== Loops =====

/// Target when the iterator is exhausted: past the `END_FOR` that follows
/// the loop body.
pub(crate) fn exhausted_target(instr: &Instr) -> usize {
    instr.forward(instr.arg).saturating_add(1)
}

/// Push the next item, or pop the iterator and leave the loop.
pub(crate) fn for_iter(vm: &mut Vm, instr: Instr) -> HandlerResult {
    vm.observe(&instr, Opcode::ForIter);
    let next = match vm.peek_at(0, &instr)? {
        Value::Iter(state) => state.lock().next_value(),
        other => {
            return Err(VmError::type_error(format!(
                "'{}' object is not an iterator",
                other.type_name()
            )))
        }
    };
    match next {
        Some(item) => {
            vm.push(item);
            Ok(ControlFlow::Continue)
        }
        None => {
            vm.pop(&instr)?;
            Ok(ControlFlow::Jump(exhausted_target(&instr)))
        }
    }
}

// ===== Functions =====

pub(crate) fn make_function(vm: &mut Vm, instr: Instr) -> HandlerResult {
    let code = match vm.pop(&instr)? {
        Value::Code(code) => code,
        other => {
            return Err(VmError::type_error(format!(
                "MAKE_FUNCTION expects a code object, found '{}'",
                other.type_name()
            )))
        }
    };
    vm.push(Value::Function(Arc::new(Function {
        name: Arc::clone(&code.name),
        code,
    })));
    Ok(ControlFlow::Continue)
}

pub(crate) fn check_arity(builtin: &Builtin, given: usize) -> Result<(), VmError> {
    if builtin.arity.accepts(given) {
        return Ok(());
    }
    let expected = match builtin.arity {
        crate::value::Arity::Exact(1) => "exactly one argument".to_string(),
        crate::value::Arity::Exact(n) => format!("exactly {n} arguments"),
        crate::value::Arity::Between(lo, hi) => format!("from {lo} to {hi} arguments"),
        crate::value::Arity::Any => "any number of arguments".to_string(),
    };
    Err(VmError::type_error(format!(
        "{}() takes {} ({} given)",
        builtin.name, expected, given
    )))
}

pub(crate) fn check_arg_count(func: &Function, given: usize) -> Result<(), VmError> {
    let expected = func.code.arg_count as usize;
    if expected == given {
        return Ok(());
    }
    Err(VmError::type_error(format!(
        "{}() takes {} positional argument{} but {} {} given",
        func.name,
        expected,
        if expected == 1 { "" } else { "s" },
        given,
        if given == 1 { "was" } else { "were" }
    )))
}

/// Pop `[callable, self_or_null, args..]` for a call with `argc` arguments.
/// A non-NULL `self` becomes the first argument.
pub(crate) fn pop_call(vm: &mut Vm, argc: usize, instr: &Instr) -> Result<(Value, Vec<Value>), VmError> {
    let mut args = vm.pop_n(argc, instr)?;
    let self_or_null = vm.pop(instr)?;
    let callable = vm.pop(instr)?;
    if !self_or_null.is_null() {
        args.insert(0, self_or_null);
    }
    Ok((callable, args))
}

/// Call `callable` from bytecode: builtins run inline, functions get a frame.
pub(crate) fn invoke(vm: &mut Vm, callable: Value, args: Vec<Value>) -> HandlerResult {
    match callable {
        Value::Builtin(builtin) => {
            check_arity(&builtin, args.len())?;
            let result = (builtin.func)(vm, &args)?;
            vm.push(result);
            Ok(ControlFlow::Continue)
        }
        Value::Function(func) => {
            check_arg_count(&func, args.len())?;
            Ok(enter_function(vm, &func, args))
        }
        other => Err(VmError::type_error(format!(
            "'{}' object is not callable",
            other.type_name()
        ))),
    }
}

pub(crate) fn enter_function(vm: &Vm, func: &Function, args: Vec<Value>) -> ControlFlow {
    ControlFlow::Call(Frame::new(Arc::clone(&func.code), args, vm.stack_len()))
}

pub(crate) fn call(vm: &mut Vm, instr: Instr) -> HandlerResult {
    vm.observe(&instr, Opcode::Call);
    let (callable, args) = pop_call(vm, instr.arg as usize, &instr)?;
    invoke(vm, callable, args)
}

pub(crate) fn return_value(vm: &mut Vm, instr: Instr) -> HandlerResult {
    let value = vm.pop(&instr)?;
    Ok(ControlFlow::Return(value))
}

pub(crate) fn return_const(vm: &mut Vm, instr: Instr) -> HandlerResult {
    let value = vm.constant(instr.arg, &instr)?;
    Ok(ControlFlow::Return(value))
}
