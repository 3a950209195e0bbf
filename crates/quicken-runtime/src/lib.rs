//! Quicken runtime
//!
//! An adaptive bytecode interpreter core: a 256-entry opcode dispatch table,
//! in-place specialization of hot instructions ("quickening") with guard-based
//! de-optimization, and an instrumentation layer that rewrites sites to
//! observation opcodes when monitoring tools subscribe to events.

pub mod bytecode;
pub mod error;
pub mod monitor;
pub mod opcode;
pub mod specialize;
pub mod value;
pub mod vm;

pub use bytecode::asm::{assemble, AsmError, AsmErrorKind};
pub use bytecode::disasm::{disassemble, DisasmOptions, View};
pub use bytecode::serialize::{from_bytes, load, save, to_bytes, LoadError, SaveError};
pub use bytecode::{validate, CodeBuilder, CodeObject, ValidationError, ValidationReport};
pub use error::{DecodeError, VmError};
pub use monitor::{EventDetail, Events, HookAction, MonitorError, MonitorEvent, Monitoring, ToolId};
pub use opcode::{OpClass, Opcode, OpcodeInfo, OpcodeRegistry, MAGIC_NUMBER};
pub use specialize::{SpecializationConfig, SpecializationStats};
pub use value::Value;
pub use vm::{DispatchTable, Vm, VmConfig};

/// Quicken version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
