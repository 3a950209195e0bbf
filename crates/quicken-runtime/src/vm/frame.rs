//! Call frame implementation

use crate::bytecode::CodeObject;
use crate::value::Value;
use std::sync::Arc;

/// One activation of a code object.
///
/// Locals live in the frame rather than on the value stack. An unbound local
/// holds [`Value::Null`].
///
/// ## Stack Layout Example
///
/// ```text
/// main called f(1, 2); CALL popped [f, NULL, 1, 2] before entering f:
///
/// [main temporaries] | [f temporaries]
///                     ^
///                     f.stack_base
/// ```
#[derive(Debug, Clone)]
pub struct Frame {
    pub code: Arc<CodeObject>,
    /// Unit index of the next instruction start.
    pub ip: usize,
    pub locals: Vec<Value>,
    /// Stack height when the frame was entered; the frame never pops below it.
    pub stack_base: usize,
}

impl Frame {
    /// Frame for `code` with the leading locals bound to `args`.
    pub fn new(code: Arc<CodeObject>, args: Vec<Value>, stack_base: usize) -> Self {
        let mut locals = args;
        let count = (code.local_count as usize).max(locals.len());
        locals.resize(count, Value::Null);
        Self {
            code,
            ip: 0,
            locals,
            stack_base,
        }
    }
}
