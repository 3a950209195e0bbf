//! Opcode dispatch
//!
//! A dense table of 256 handler entry points indexed by the raw opcode byte.
//! Every slot is filled: assigned opcodes get their handler, everything else
//! gets the fault handler, so [`DispatchTable::resolve`] never fails.

use super::frame::Frame;
use super::ops;
use super::Vm;
use crate::bytecode::Decoded;
use crate::error::VmError;
use crate::opcode::{OpClass, Opcode, OpcodeRegistry, RegistryError};
use crate::specialize;
use crate::value::Value;
use once_cell::sync::Lazy;
use std::fmt;

/// Entry point for one opcode.
pub type OpHandler = fn(&mut Vm, Instr) -> Result<ControlFlow, VmError>;

static GLOBAL: Lazy<DispatchTable> = Lazy::new(|| {
    DispatchTable::build(OpcodeRegistry::global())
        .unwrap_or_else(|err| panic!("standard dispatch table is incomplete: {err}"))
});

/// A decoded instruction as seen by its handler.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Instr {
    pub op: u8,
    /// Full operand with `EXTENDED_ARG` prefixes folded in.
    pub arg: u32,
    /// First unit of the instruction (first prefix, if any).
    pub start: usize,
    /// Unit holding the opcode.
    pub site: usize,
    /// Unit after the instruction.
    pub next: usize,
    /// Whether the generic handler should feed the specializer.
    pub adaptive: bool,
}

impl Instr {
    pub fn new(decoded: Decoded, adaptive: bool) -> Self {
        Self {
            op: decoded.op,
            arg: decoded.arg,
            start: decoded.start,
            site: decoded.site,
            next: decoded.next,
            adaptive,
        }
    }

    /// Same site, different opcode, no specializer feedback.
    pub fn as_inner(self, op: u8) -> Self {
        Self {
            op,
            adaptive: false,
            ..self
        }
    }

    pub fn name(&self) -> &'static str {
        OpcodeRegistry::global().info(self.op).name
    }

    /// Target of a forward relative jump.
    pub fn forward(&self, delta: u32) -> usize {
        self.next.saturating_add(delta as usize)
    }

    /// Target of a backward relative jump.
    pub fn backward(&self, delta: u32) -> Result<usize, VmError> {
        self.next
            .checked_sub(delta as usize)
            .ok_or(VmError::BadJump { offset: self.site })
    }
}

/// What the loop does after a handler returns.
#[derive(Debug)]
pub enum ControlFlow {
    /// Fall through to the next instruction.
    Continue,
    /// Continue at this unit index in the current frame.
    Jump(usize),
    /// Push a new frame; the caller resumes at its next instruction.
    Call(Frame),
    /// Pop the current frame, handing the value to the caller.
    Return(Value),
}

/// How a slot was filled.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SlotKind {
    Handler,
    /// Assigned opcode whose semantics this VM does not implement.
    Unsupported,
    Fault,
}

/// Opcode byte to handler.
pub struct DispatchTable {
    handlers: [OpHandler; 256],
    kinds: [SlotKind; 256],
    adaptive: [bool; 256],
}

impl DispatchTable {
    /// Fill all 256 slots from `registry`.
    pub fn build(registry: &OpcodeRegistry) -> Result<Self, RegistryError> {
        let mut handlers: [OpHandler; 256] = [fault as OpHandler; 256];
        let mut kinds = [SlotKind::Fault; 256];
        let mut adaptive = [false; 256];

        for info in registry.iter() {
            let Some(op) = info.opcode() else {
                continue;
            };
            let (handler, kind) = match (ops::handler_for(op), info.class) {
                (Some(handler), _) => (handler, SlotKind::Handler),
                (None, OpClass::Specialized) => {
                    match info.base.and_then(Opcode::from_u8).and_then(ops::handler_for) {
                        Some(handler) => (handler, SlotKind::Handler),
                        None => (unsupported as OpHandler, SlotKind::Unsupported),
                    }
                }
                (None, OpClass::Base) => (unsupported as OpHandler, SlotKind::Unsupported),
                (None, OpClass::Instrumented) => {
                    return Err(RegistryError::MissingHandler { name: info.name })
                }
                (None, OpClass::Reserved) => continue,
            };
            let slot = info.value as usize;
            handlers[slot] = handler;
            kinds[slot] = kind;
            adaptive[slot] = info.class == OpClass::Base && specialize::family(op).is_some();
        }

        Ok(Self {
            handlers,
            kinds,
            adaptive,
        })
    }

    /// The table for the standard numbering.
    pub fn global() -> &'static DispatchTable {
        &GLOBAL
    }

    #[inline(always)]
    pub fn resolve(&self, op: u8) -> OpHandler {
        self.handlers[op as usize]
    }

    pub fn slot_kind(&self, op: u8) -> SlotKind {
        self.kinds[op as usize]
    }

    /// Base opcode with a specialization family.
    #[inline(always)]
    pub fn is_adaptive(&self, op: u8) -> bool {
        self.adaptive[op as usize]
    }
}

impl fmt::Debug for DispatchTable {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let count = |kind| self.kinds.iter().filter(|k| **k == kind).count();
        f.debug_struct("DispatchTable")
            .field("handlers", &count(SlotKind::Handler))
            .field("unsupported", &count(SlotKind::Unsupported))
            .field("fault", &count(SlotKind::Fault))
            .finish()
    }
}

/// Reserved or unassigned opcode byte. Leaves the stack untouched.
fn fault(vm: &mut Vm, instr: Instr) -> Result<ControlFlow, VmError> {
    vm.stats().record_fault();
    tracing::error!(
        target: "quicken::vm",
        opcode = instr.op,
        offset = instr.site,
        code = %vm.code().map_or("<none>", |code| &*code.name),
        "unknown opcode; aborting code unit"
    );
    Err(VmError::UnknownOpcode {
        opcode: instr.op,
        offset: instr.site,
    })
}

fn unsupported(vm: &mut Vm, instr: Instr) -> Result<ControlFlow, VmError> {
    tracing::warn!(
        target: "quicken::vm",
        opcode = instr.name(),
        offset = instr.site,
        code = %vm.code().map_or("<none>", |code| &*code.name),
        "unsupported opcode"
    );
    Err(VmError::Unsupported {
        name: instr.name(),
        offset: instr.site,
    })
}
