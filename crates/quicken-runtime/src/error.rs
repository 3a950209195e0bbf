//! Runtime error types
//!
//! Two families cross the runtime boundary:
//! - [`DecodeError`]: the instruction stream itself is malformed.
//! - [`VmError`]: execution failed. [`VmError::is_fatal`] separates aborts
//!   (corrupted or unsupported bytecode) from ordinary program errors.
//!
//! Guard misses in specialized instructions never surface here; they are
//! recovered inside the handler.

use thiserror::Error;

/// Maximum number of `EXTENDED_ARG` prefixes before one instruction.
pub const MAX_EXTENDED_ARGS: usize = 3;

/// Malformed instruction stream.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum DecodeError {
    #[error("more than {} EXTENDED_ARG prefixes at offset {offset}", MAX_EXTENDED_ARGS)]
    OperandOverflow { offset: usize },

    #[error("EXTENDED_ARG at offset {offset} is not followed by an instruction")]
    DanglingExtendedArg { offset: usize },

    #[error("instruction stream ended at offset {offset} without returning")]
    Truncated { offset: usize },
}

impl DecodeError {
    pub fn offset(&self) -> usize {
        match self {
            Self::OperandOverflow { offset }
            | Self::DanglingExtendedArg { offset }
            | Self::Truncated { offset } => *offset,
        }
    }
}

/// Execution failure.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum VmError {
    #[error("decode error: {0}")]
    Decode(#[from] DecodeError),

    #[error("unknown opcode {opcode} at offset {offset}: bytecode is corrupt or was built for another opcode table")]
    UnknownOpcode { opcode: u8, offset: usize },

    #[error("opcode {name} at offset {offset} is not supported by this VM")]
    Unsupported { name: &'static str, offset: usize },

    #[error("stack underflow in {name} at offset {offset}")]
    StackUnderflow { name: &'static str, offset: usize },

    #[error("{what} index {index} out of range at offset {offset}")]
    BadOperand {
        what: &'static str,
        index: usize,
        offset: usize,
    },

    #[error("jump from offset {offset} leaves the code object")]
    BadJump { offset: usize },

    #[error("no frame is executing")]
    NoFrame,

    #[error("TypeError: {0}")]
    TypeError(String),

    #[error("NameError: name '{0}' is not defined")]
    NameError(String),

    #[error("UnboundLocalError: local variable {0} referenced before assignment")]
    UnboundLocal(String),

    #[error("ZeroDivisionError: {0}")]
    ZeroDivision(String),

    #[error("OverflowError: {0}")]
    Overflow(String),

    #[error("IndexError: {0}")]
    IndexError(String),

    #[error("ValueError: {0}")]
    ValueError(String),

    #[error("RecursionError: maximum recursion depth of {0} frames exceeded")]
    RecursionLimit(usize),

    #[error("I/O error: {0}")]
    Io(String),
}

impl VmError {
    /// Aborts of the executing unit: the bytecode cannot be trusted.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            Self::Decode(_)
                | Self::UnknownOpcode { .. }
                | Self::Unsupported { .. }
                | Self::StackUnderflow { .. }
                | Self::BadOperand { .. }
                | Self::BadJump { .. }
                | Self::NoFrame
        )
    }

    pub(crate) fn type_error(msg: impl Into<String>) -> Self {
        Self::TypeError(msg.into())
    }
}

impl From<std::io::Error> for VmError {
    fn from(err: std::io::Error) -> Self {
        Self::Io(err.to_string())
    }
}
