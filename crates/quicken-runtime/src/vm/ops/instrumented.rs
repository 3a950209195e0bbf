//! Monitoring wrappers
//!
//! An instrumented site holds the outermost of its layers. Each handler here
//! fires its hooks and then runs the layer beneath it, down to the original
//! opcode recorded in the code object's side table. The original runs without
//! specializer feedback.

use super::HandlerResult;
use crate::bytecode::{split, CodeObject, Layers};
use crate::error::VmError;
use crate::monitor::{inner, EventDetail, Events, Monitoring};
use crate::opcode::{Opcode, OpcodeRegistry};
use crate::value::Value;
use crate::vm::{ControlFlow, Instr, Vm};
use std::sync::Arc;

/// Everything a wrapper needs about its site.
struct Site {
    code: Arc<CodeObject>,
    monitor: Arc<Monitoring>,
    /// Opcode of the next layer down.
    below: u8,
    /// Original opcode, as reported to observers.
    original: Opcode,
}

impl Site {
    fn resolve(vm: &Vm, instr: &Instr, current: Layers) -> Result<Self, VmError> {
        let code = vm.current_code()?;
        let record = code.site(instr.site);
        let (below, original) = if !record.layers.is_empty() {
            (
                inner(record.original, record.layers, current),
                record.original,
            )
        } else if code.load_unit(instr.site).map(|u| split(u).0) != Some(instr.op) {
            // Uninstrumented after this unit was fetched.
            (record.original, record.original)
        } else {
            let base = OpcodeRegistry::global()
                .info(instr.op)
                .base
                .ok_or(VmError::UnknownOpcode {
                    opcode: instr.op,
                    offset: instr.site,
                })?;
            (base, base)
        };
        Ok(Self {
            code,
            monitor: vm.monitor(),
            below,
            original: Opcode::from_u8(original).unwrap_or(Opcode::Nop),
        })
    }

    fn fire(&self, instr: &Instr, event: Events, detail: EventDetail) {
        self.monitor
            .fire(&self.code, instr.site, self.original, event, detail);
    }

    fn run_below(&self, vm: &mut Vm, instr: Instr) -> HandlerResult {
        let handler = vm.table().resolve(self.below);
        handler(vm, instr.as_inner(self.below))
    }
}

/// `PY_START` for a function entry (`RESUME 0`), `PY_RESUME` otherwise.
pub(crate) fn resume(vm: &mut Vm, instr: Instr) -> HandlerResult {
    let code = vm.current_code()?;
    if vm.sync_monitoring(&code) {
        return Ok(ControlFlow::Jump(instr.start));
    }
    let site = Site::resolve(vm, &instr, Layers::EVENT)?;
    let event = if instr.arg == 0 {
        Events::PY_START
    } else {
        Events::PY_RESUME
    };
    site.fire(&instr, event, EventDetail::None);
    site.run_below(vm, instr)
}

pub(crate) fn stop_iteration(vm: &mut Vm, instr: Instr) -> HandlerResult {
    let site = Site::resolve(vm, &instr, Layers::EVENT)?;
    site.fire(&instr, Events::STOP_ITERATION, EventDetail::None);
    site.run_below(vm, instr)
}

pub(crate) fn return_value(vm: &mut Vm, instr: Instr) -> HandlerResult {
    let site = Site::resolve(vm, &instr, Layers::EVENT)?;
    let value = vm.peek_at(0, &instr)?.clone();
    site.fire(&instr, Events::PY_RETURN, EventDetail::Return(value));
    site.run_below(vm, instr)
}

pub(crate) fn return_const(vm: &mut Vm, instr: Instr) -> HandlerResult {
    let site = Site::resolve(vm, &instr, Layers::EVENT)?;
    let value = vm.constant(instr.arg, &instr)?;
    site.fire(&instr, Events::PY_RETURN, EventDetail::Return(value));
    site.run_below(vm, instr)
}

pub(crate) fn yield_value(vm: &mut Vm, instr: Instr) -> HandlerResult {
    let site = Site::resolve(vm, &instr, Layers::EVENT)?;
    let value = vm.peek_at(0, &instr)?.clone();
    site.fire(&instr, Events::PY_YIELD, EventDetail::Yield(value));
    site.run_below(vm, instr)
}

/// Stack: `[global_super, class, self]`.
pub(crate) fn load_super_attr(vm: &mut Vm, instr: Instr) -> HandlerResult {
    let site = Site::resolve(vm, &instr, Layers::EVENT)?;
    let callable = vm.peek_at(2, &instr)?.clone();
    site.fire(
        &instr,
        Events::CALL,
        EventDetail::Call {
            callable,
            arg_count: 2,
        },
    );
    site.run_below(vm, instr)
}

/// `CALL` before the call; `C_RETURN` once a builtin callee has returned.
pub(crate) fn call(vm: &mut Vm, instr: Instr) -> HandlerResult {
    let site = Site::resolve(vm, &instr, Layers::EVENT)?;
    let callable = vm.peek_at(instr.arg as usize + 1, &instr)?.clone();
    let is_builtin = matches!(callable, Value::Builtin(_));
    let detail = EventDetail::Call {
        callable,
        arg_count: instr.arg,
    };
    site.fire(&instr, Events::CALL, detail.clone());
    let flow = site.run_below(vm, instr)?;
    if is_builtin && matches!(flow, ControlFlow::Continue) {
        site.fire(&instr, Events::C_RETURN, detail);
    }
    Ok(flow)
}

/// Stack: `[callable, NULL, args, kwargs?]` with kwargs present when
/// `oparg & 1`.
pub(crate) fn call_function_ex(vm: &mut Vm, instr: Instr) -> HandlerResult {
    let site = Site::resolve(vm, &instr, Layers::EVENT)?;
    let has_kwargs = (instr.arg & 1) as usize;
    let callable = vm.peek_at(2 + has_kwargs, &instr)?.clone();
    let arg_count = match vm.peek_at(has_kwargs, &instr)? {
        Value::Tuple(args) => args.len() as u32,
        _ => 0,
    };
    site.fire(
        &instr,
        Events::CALL,
        EventDetail::Call {
            callable,
            arg_count,
        },
    );
    site.run_below(vm, instr)
}

/// `JUMP` once the jump has been resolved.
pub(crate) fn jump(vm: &mut Vm, instr: Instr) -> HandlerResult {
    let site = Site::resolve(vm, &instr, Layers::EVENT)?;
    let flow = site.run_below(vm, instr)?;
    if let ControlFlow::Jump(target) = flow {
        site.fire(&instr, Events::JUMP, EventDetail::Jump { target });
    }
    Ok(flow)
}

/// `BRANCH` for conditional jumps and `FOR_ITER`, after the direction is
/// known.
pub(crate) fn branch(vm: &mut Vm, instr: Instr) -> HandlerResult {
    let site = Site::resolve(vm, &instr, Layers::EVENT)?;
    let flow = site.run_below(vm, instr)?;
    let (target, taken) = match flow {
        ControlFlow::Jump(target) => (target, true),
        _ => (instr.next, false),
    };
    site.fire(&instr, Events::BRANCH, EventDetail::Branch { target, taken });
    Ok(flow)
}

pub(crate) fn instruction(vm: &mut Vm, instr: Instr) -> HandlerResult {
    let site = Site::resolve(vm, &instr, Layers::INSTRUCTION)?;
    site.fire(&instr, Events::INSTRUCTION, EventDetail::None);
    site.run_below(vm, instr)
}

pub(crate) fn line(vm: &mut Vm, instr: Instr) -> HandlerResult {
    let site = Site::resolve(vm, &instr, Layers::LINE)?;
    let line = site.code.line_at(instr.site).unwrap_or(0);
    site.fire(&instr, Events::LINE, EventDetail::Line(line));
    site.run_below(vm, instr)
}
