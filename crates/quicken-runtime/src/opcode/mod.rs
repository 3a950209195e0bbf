//! Opcode numbering and classification
//!
//! The opcode space is one byte wide and split into four classes:
//! - **Base** opcodes are what a compiler emits.
//! - **Specialized** opcodes refine a base opcode for one observed operand
//!   shape. They only appear through runtime rewriting.
//! - **Instrumented** opcodes (237-254) wrap a base opcode (or, for
//!   `INSTRUMENTED_LINE` / `INSTRUMENTED_INSTRUCTION`, any opcode) with an
//!   observation hook.
//! - **Reserved** values have no handler and dispatch to the fault handler.
//!
//! Operands are encoded in the high byte of each 16-bit code unit.

mod registry;
mod table;

pub use registry::{OpcodeInfo, OpcodeRegistry, RegistryBuilder, RegistryError, MAGIC_NUMBER};
pub use table::Opcode;

pub(crate) use table::DEFINITIONS;

use serde::Serialize;
use std::fmt;

/// Opcodes at or above this value (and below the instrumented range) take an operand.
pub const HAVE_ARGUMENT: u8 = 67;

/// First opcode value of the instrumented range.
pub const MIN_INSTRUMENTED_OPCODE: u8 = 237;

/// Classification of an opcode value.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum OpClass {
    Base,
    Specialized,
    Instrumented,
    Reserved,
}

impl OpClass {
    pub fn as_str(self) -> &'static str {
        match self {
            OpClass::Base => "base",
            OpClass::Specialized => "specialized",
            OpClass::Instrumented => "instrumented",
            OpClass::Reserved => "reserved",
        }
    }
}

impl fmt::Display for OpClass {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// How an opcode consumes its operand byte.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Operand {
    /// The operand byte is ignored.
    None,
    /// One byte, widened by preceding `EXTENDED_ARG` prefixes.
    Arg,
    /// `EXTENDED_ARG` itself: contributes high-order bits to the next instruction.
    Prefix,
}

/// Direction of a relative jump operand.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum JumpDirection {
    /// Target is `next_instruction + oparg`.
    Forward,
    /// Target is `next_instruction - oparg`.
    Backward,
}

/// A stack slot count, possibly depending on the operand.
#[derive(Debug, Clone, Copy)]
pub enum Count {
    Fixed(u32),
    /// `mul * oparg + add`
    Oparg { mul: u32, add: u32 },
    /// `add + (oparg & 1)`
    LowBit(u32),
    Custom(fn(u32) -> u32),
}

impl Count {
    #[inline]
    pub fn eval(self, oparg: u32) -> u32 {
        match self {
            Count::Fixed(n) => n,
            Count::Oparg { mul, add } => mul.wrapping_mul(oparg).wrapping_add(add),
            Count::LowBit(add) => add + (oparg & 1),
            Count::Custom(f) => f(oparg),
        }
    }
}

pub(crate) const fn fixed(n: u32) -> Count {
    Count::Fixed(n)
}

pub(crate) const fn oparg(add: u32) -> Count {
    Count::Oparg { mul: 1, add }
}

pub(crate) const fn oparg_times(mul: u32, add: u32) -> Count {
    Count::Oparg { mul, add }
}

pub(crate) const fn low_bit(add: u32) -> Count {
    Count::LowBit(add)
}

pub(crate) const fn custom(f: fn(u32) -> u32) -> Count {
    Count::Custom(f)
}

/// Stack inputs and outputs of one instruction.
#[derive(Debug, Clone, Copy)]
pub struct StackEffect {
    pub pops: Count,
    pub pushes: Count,
}

impl StackEffect {
    pub const fn new(pops: Count, pushes: Count) -> Self {
        Self { pops, pushes }
    }

    /// `(pops, pushes)` for a concrete operand.
    #[inline]
    pub fn eval(&self, oparg: u32) -> (u32, u32) {
        (self.pops.eval(oparg), self.pushes.eval(oparg))
    }

    /// Net change in stack depth.
    pub fn net(&self, oparg: u32) -> i64 {
        let (pops, pushes) = self.eval(oparg);
        pushes as i64 - pops as i64
    }

    /// True when both effects agree for every single-byte operand.
    pub fn agrees_with(&self, other: &StackEffect) -> bool {
        (0..=255u32).all(|arg| self.eval(arg) == other.eval(arg))
    }
}

/// How a definition relates to other opcodes.
#[derive(Debug, Clone, Copy)]
pub enum DefKind {
    Base,
    Specialized(Opcode),
    Instrumented(Opcode),
    /// Instrumented opcode that can wrap any other opcode.
    Wrapper,
    Reserved,
}

/// One row of an opcode definition list.
#[derive(Debug, Clone, Copy)]
pub struct OpcodeDef {
    /// Numeric value. Wider than a byte so out-of-range rows are detectable.
    pub value: u16,
    pub name: &'static str,
    pub kind: DefKind,
    /// `None` inherits the base opcode's effect.
    pub effect: Option<StackEffect>,
}

impl Opcode {
    /// Registry entry for this opcode.
    #[inline]
    pub fn info(self) -> &'static OpcodeInfo {
        OpcodeRegistry::global().info(self as u8)
    }

    #[inline]
    pub fn class(self) -> OpClass {
        self.info().class
    }

    /// Generic opcode this one refines; itself for base opcodes.
    pub fn base(self) -> Opcode {
        self.info()
            .base
            .and_then(Opcode::from_u8)
            .unwrap_or(self)
    }

    #[inline]
    pub fn has_arg(self) -> bool {
        self.info().operand != Operand::None
    }

    pub fn is_specialized(self) -> bool {
        self.class() == OpClass::Specialized
    }

    pub fn is_instrumented(self) -> bool {
        self.class() == OpClass::Instrumented
    }

    pub fn jump(self) -> Option<JumpDirection> {
        self.info().jump
    }

    /// Ends the code object (no fall-through to the next unit).
    pub fn is_terminator(self) -> bool {
        matches!(
            self.base(),
            Opcode::ReturnValue
                | Opcode::ReturnConst
                | Opcode::JumpForward
                | Opcode::JumpBackward
                | Opcode::JumpBackwardNoInterrupt
                | Opcode::RaiseVarargs
                | Opcode::Reraise
                | Opcode::InterpreterExit
        )
    }
}

impl fmt::Display for Opcode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl TryFrom<u8> for Opcode {
    type Error = u8;

    fn try_from(byte: u8) -> Result<Self, Self::Error> {
        Opcode::from_u8(byte).ok_or(byte)
    }
}

/// Jump direction of an opcode, derived from its base.
pub(crate) fn jump_direction(op: Opcode) -> Option<JumpDirection> {
    use Opcode::*;
    match op {
        JumpForward | PopJumpIfFalse | PopJumpIfTrue | PopJumpIfNone | PopJumpIfNotNone
        | ForIter | Send | InstrumentedJumpForward | InstrumentedPopJumpIfFalse
        | InstrumentedPopJumpIfTrue | InstrumentedPopJumpIfNone
        | InstrumentedPopJumpIfNotNone | InstrumentedForIter => Some(JumpDirection::Forward),
        JumpBackward | JumpBackwardNoInterrupt | InstrumentedJumpBackward => {
            Some(JumpDirection::Backward)
        }
        _ => None,
    }
}
