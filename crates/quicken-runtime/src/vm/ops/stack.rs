//! Constants, locals, globals and stack shuffling

use super::HandlerResult;
use crate::error::VmError;
use crate::opcode::Opcode;
use crate::value::Value;
use crate::vm::{ControlFlow, Instr, Vm};

pub(crate) fn nop(_vm: &mut Vm, _instr: Instr) -> HandlerResult {
    Ok(ControlFlow::Continue)
}

/// Function entry and resumption point. Re-dispatches the same instruction
/// when monitoring changed since the code object was last instrumented.
pub(crate) fn resume(vm: &mut Vm, instr: Instr) -> HandlerResult {
    let code = vm.current_code()?;
    if vm.sync_monitoring(&code) {
        return Ok(ControlFlow::Jump(instr.start));
    }
    Ok(ControlFlow::Continue)
}

pub(crate) fn pop_top(vm: &mut Vm, instr: Instr) -> HandlerResult {
    vm.pop(&instr)?;
    Ok(ControlFlow::Continue)
}

pub(crate) fn push_null(vm: &mut Vm, _instr: Instr) -> HandlerResult {
    vm.push(Value::Null);
    Ok(ControlFlow::Continue)
}

/// Push a copy of the value `oparg - 1` slots below the top.
pub(crate) fn copy(vm: &mut Vm, instr: Instr) -> HandlerResult {
    let depth = (instr.arg as usize).checked_sub(1).ok_or(VmError::BadOperand {
        what: "COPY depth",
        index: 0,
        offset: instr.site,
    })?;
    let value = vm.peek_at(depth, &instr)?.clone();
    vm.push(value);
    Ok(ControlFlow::Continue)
}

/// Swap the top of stack with the value `oparg - 1` slots below it.
pub(crate) fn swap(vm: &mut Vm, instr: Instr) -> HandlerResult {
    let depth = (instr.arg as usize).checked_sub(1).ok_or(VmError::BadOperand {
        what: "SWAP depth",
        index: 0,
        offset: instr.site,
    })?;
    vm.swap_top(depth, &instr)?;
    Ok(ControlFlow::Continue)
}

/// Pops the exhausted iterator and its last value.
pub(crate) fn end_for(vm: &mut Vm, instr: Instr) -> HandlerResult {
    vm.pop_n(2, &instr)?;
    Ok(ControlFlow::Continue)
}

pub(crate) fn load_const(vm: &mut Vm, instr: Instr) -> HandlerResult {
    let value = vm.constant(instr.arg, &instr)?;
    vm.push(value);
    Ok(ControlFlow::Continue)
}

fn bound_local(vm: &mut Vm, index: u32, instr: &Instr) -> Result<Value, VmError> {
    let value = vm.local_slot(index, instr)?.clone();
    if value.is_null() {
        return Err(VmError::UnboundLocal(index.to_string()));
    }
    Ok(value)
}

pub(crate) fn load_fast(vm: &mut Vm, instr: Instr) -> HandlerResult {
    let value = bound_local(vm, instr.arg, &instr)?;
    vm.push(value);
    Ok(ControlFlow::Continue)
}

/// Push the local (NULL when unbound) and unbind it.
pub(crate) fn load_fast_and_clear(vm: &mut Vm, instr: Instr) -> HandlerResult {
    let value = std::mem::replace(vm.local_slot(instr.arg, &instr)?, Value::Null);
    vm.push(value);
    Ok(ControlFlow::Continue)
}

pub(crate) fn load_fast_load_fast(vm: &mut Vm, instr: Instr) -> HandlerResult {
    let first = bound_local(vm, instr.arg >> 4, &instr)?;
    let second = bound_local(vm, instr.arg & 15, &instr)?;
    vm.push(first);
    vm.push(second);
    Ok(ControlFlow::Continue)
}

/// Storing NULL unbinds the local.
pub(crate) fn store_fast(vm: &mut Vm, instr: Instr) -> HandlerResult {
    let value = vm.pop(&instr)?;
    *vm.local_slot(instr.arg, &instr)? = value;
    Ok(ControlFlow::Continue)
}

pub(crate) fn store_fast_load_fast(vm: &mut Vm, instr: Instr) -> HandlerResult {
    let value = vm.pop(&instr)?;
    *vm.local_slot(instr.arg >> 4, &instr)? = value;
    let loaded = bound_local(vm, instr.arg & 15, &instr)?;
    vm.push(loaded);
    Ok(ControlFlow::Continue)
}

pub(crate) fn store_fast_store_fast(vm: &mut Vm, instr: Instr) -> HandlerResult {
    let first = vm.pop(&instr)?;
    let second = vm.pop(&instr)?;
    *vm.local_slot(instr.arg >> 4, &instr)? = first;
    *vm.local_slot(instr.arg & 15, &instr)? = second;
    Ok(ControlFlow::Continue)
}

pub(crate) fn delete_fast(vm: &mut Vm, instr: Instr) -> HandlerResult {
    bound_local(vm, instr.arg, &instr)?;
    *vm.local_slot(instr.arg, &instr)? = Value::Null;
    Ok(ControlFlow::Continue)
}

/// Push the global (or builtin) named by `oparg >> 1`, then NULL when the
/// low bit is set.
pub(crate) fn load_global(vm: &mut Vm, instr: Instr) -> HandlerResult {
    vm.observe(&instr, Opcode::LoadGlobal);
    let name = vm.name_at(instr.arg >> 1, &instr)?;
    let value = vm
        .lookup_name(&name)
        .cloned()
        .ok_or_else(|| VmError::NameError(name.to_string()))?;
    push_global(vm, value, &instr);
    Ok(ControlFlow::Continue)
}

pub(crate) fn push_global(vm: &mut Vm, value: Value, instr: &Instr) {
    vm.push(value);
    if instr.arg & 1 == 1 {
        vm.push(Value::Null);
    }
}

pub(crate) fn store_global(vm: &mut Vm, instr: Instr) -> HandlerResult {
    let name = vm.name_at(instr.arg, &instr)?;
    let value = vm.pop(&instr)?;
    vm.set_global(name, value);
    Ok(ControlFlow::Continue)
}

pub(crate) fn delete_global(vm: &mut Vm, instr: Instr) -> HandlerResult {
    let name = vm.name_at(instr.arg, &instr)?;
    vm.remove_global(&name)
        .map(|_| ControlFlow::Continue)
        .ok_or_else(|| VmError::NameError(name.to_string()))
}
