//! Stack-based virtual machine
//!
//! Executes code objects with a value stack and call frames.
//! - Each step decodes one instruction (folding `EXTENDED_ARG` prefixes) and
//!   calls the handler the dispatch table holds for its opcode byte.
//! - Generic handlers of specializable opcodes report operand shapes to the
//!   [`Specializer`]; specialized handlers re-check their guard and fall back
//!   to the generic handler on a miss.
//! - Code objects are brought up to the current [`Monitoring`] version when a
//!   frame is entered and at every `RESUME`.

mod builtins;
pub mod dispatch;
mod frame;
pub(crate) mod ops;

pub use builtins::{lookup_builtin, BUILTINS};
pub use dispatch::{ControlFlow, DispatchTable, Instr, OpHandler, SlotKind};
pub use frame::Frame;

use crate::bytecode::CodeObject;
use crate::error::VmError;
use crate::monitor::Monitoring;
use crate::opcode::Opcode;
use crate::specialize::{self, SpecializationConfig, SpecializationStats, Specializer};
use crate::value::Value;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::io::Write;
use std::sync::Arc;

/// Destination for `print()`.
pub type OutputWriter = Arc<Mutex<Box<dyn Write + Send>>>;

/// Writer that forwards to the process's stdout.
pub fn stdout_writer() -> OutputWriter {
    Arc::new(Mutex::new(Box::new(std::io::stdout())))
}

/// Writer that collects output in memory, plus a handle to read it back.
pub fn buffer_writer() -> (OutputWriter, Arc<Mutex<Vec<u8>>>) {
    let buffer = Arc::new(Mutex::new(Vec::new()));
    let writer: OutputWriter = Arc::new(Mutex::new(Box::new(SharedBuffer(Arc::clone(&buffer)))));
    (writer, buffer)
}

struct SharedBuffer(Arc<Mutex<Vec<u8>>>);

impl Write for SharedBuffer {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        self.0.lock().extend_from_slice(buf);
        Ok(buf.len())
    }

    fn flush(&mut self) -> std::io::Result<()> {
        Ok(())
    }
}

/// VM tuning.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct VmConfig {
    /// Call depth at which `RecursionLimit` is raised.
    pub max_frames: usize,
    pub specialization: SpecializationConfig,
    /// Count executions per opcode.
    pub profile: bool,
}

impl Default for VmConfig {
    fn default() -> Self {
        Self {
            max_frames: 1000,
            specialization: SpecializationConfig::default(),
            profile: false,
        }
    }
}

impl VmConfig {
    /// Settings from a loaded `quicken.toml`.
    pub fn from_config(config: &quicken_config::QuickenConfig) -> Self {
        let settings = &config.specialization;
        Self {
            max_frames: config.vm.max_frames,
            specialization: SpecializationConfig {
                enabled: settings.enabled,
                warmup: settings.warmup,
                cooldown: settings.cooldown,
                max_backoff: settings.max_backoff,
            },
            profile: config.vm.profile,
        }
    }
}

/// Virtual machine state
pub struct Vm {
    /// Value stack, shared by all frames
    stack: Vec<Value>,
    /// Call frames, innermost last
    frames: Vec<Frame>,
    globals: HashMap<Arc<str>, Value>,
    builtins: HashMap<&'static str, Value>,
    table: &'static DispatchTable,
    specializer: Specializer,
    monitoring: Arc<Monitoring>,
    config: VmConfig,
    /// Output writer for print() (defaults to stdout)
    output: OutputWriter,
}

impl Vm {
    pub fn new() -> Self {
        Self::with_config(VmConfig::default())
    }

    pub fn with_config(config: VmConfig) -> Self {
        let stats = Arc::new(SpecializationStats::new());
        if config.profile {
            stats.enable_profiling();
        }
        Self {
            stack: Vec::with_capacity(256),
            frames: Vec::new(),
            globals: HashMap::new(),
            builtins: BUILTINS
                .iter()
                .map(|builtin| (builtin.name, Value::Builtin(*builtin)))
                .collect(),
            table: DispatchTable::global(),
            specializer: Specializer::new(config.specialization, stats),
            monitoring: Arc::new(Monitoring::new()),
            config,
            output: stdout_writer(),
        }
    }

    /// Report to `monitoring` instead of a private instance.
    pub fn with_monitoring(mut self, monitoring: Arc<Monitoring>) -> Self {
        self.monitoring = monitoring;
        self
    }

    /// Record into shared statistics.
    pub fn with_stats(mut self, stats: Arc<SpecializationStats>) -> Self {
        if self.config.profile {
            stats.enable_profiling();
        }
        self.specializer = Specializer::new(self.config.specialization, stats);
        self
    }

    pub fn set_output_writer(&mut self, writer: OutputWriter) {
        self.output = writer;
    }

    pub fn config(&self) -> &VmConfig {
        &self.config
    }

    pub fn monitoring(&self) -> &Arc<Monitoring> {
        &self.monitoring
    }

    pub fn stats(&self) -> &Arc<SpecializationStats> {
        self.specializer.stats()
    }

    pub fn set_global(&mut self, name: impl Into<Arc<str>>, value: Value) {
        self.globals.insert(name.into(), value);
    }

    pub fn globals(&self) -> &HashMap<Arc<str>, Value> {
        &self.globals
    }

    /// Execute `code` as the outermost frame and return its result.
    pub fn run(&mut self, code: Arc<CodeObject>) -> Result<Value, VmError> {
        self.stack.clear();
        self.frames.clear();
        self.enter(Frame::new(code, Vec::new(), 0))?;
        let result = self.execute();
        if result.is_err() {
            self.frames.clear();
            self.stack.clear();
        }
        result
    }

    /// Call a function value with positional arguments.
    pub fn call(&mut self, callable: &Value, args: Vec<Value>) -> Result<Value, VmError> {
        match callable {
            Value::Builtin(builtin) => {
                ops::control::check_arity(builtin, args.len())?;
                (builtin.func)(self, &args)
            }
            Value::Function(func) => {
                ops::control::check_arg_count(func, args.len())?;
                self.stack.clear();
                self.frames.clear();
                self.enter(Frame::new(Arc::clone(&func.code), args, 0))?;
                self.execute()
            }
            other => Err(VmError::type_error(format!(
                "'{}' object is not callable",
                other.type_name()
            ))),
        }
    }

    fn enter(&mut self, frame: Frame) -> Result<(), VmError> {
        if self.frames.len() >= self.config.max_frames {
            return Err(VmError::RecursionLimit(self.config.max_frames));
        }
        self.sync_monitoring(&frame.code);
        self.frames.push(frame);
        Ok(())
    }

    /// Instrument `code` for the current monitoring version if it is stale.
    #[inline]
    pub(crate) fn sync_monitoring(&self, code: &Arc<CodeObject>) -> bool {
        if code.monitor_version() == self.monitoring.version() {
            return false;
        }
        self.monitoring.instrument(code);
        true
    }

    fn execute(&mut self) -> Result<Value, VmError> {
        loop {
            let frame = self.frames.last().ok_or(VmError::NoFrame)?;
            let decoded = frame.code.fetch(frame.ip)?;
            let len = frame.code.len();
            let instr = Instr::new(decoded, self.table.is_adaptive(decoded.op));

            self.specializer.stats().record_execution(instr.op);
            let handler = self.table.resolve(instr.op);
            let flow = match handler(self, instr) {
                Ok(flow) => flow,
                Err(err) => {
                    if err.is_fatal() {
                        tracing::debug!(
                            target: "quicken::vm",
                            offset = instr.site,
                            error = %err,
                            "unwinding after fatal error"
                        );
                    }
                    return Err(err);
                }
            };

            match flow {
                ControlFlow::Continue => self.frame_mut()?.ip = instr.next,
                ControlFlow::Jump(target) => {
                    if target >= len {
                        return Err(VmError::BadJump { offset: instr.site });
                    }
                    self.frame_mut()?.ip = target;
                }
                ControlFlow::Call(callee) => {
                    self.frame_mut()?.ip = instr.next;
                    self.enter(callee)?;
                }
                ControlFlow::Return(value) => {
                    let finished = self.frames.pop().ok_or(VmError::NoFrame)?;
                    self.stack.truncate(finished.stack_base);
                    if self.frames.is_empty() {
                        return Ok(value);
                    }
                    self.push(value);
                }
            }
        }
    }

    // ===== Accessors used by guards and handlers =====

    /// Value `depth` slots below the top of the current frame's stack.
    #[inline]
    pub fn peek(&self, depth: usize) -> Option<&Value> {
        let base = self.frames.last().map_or(0, |frame| frame.stack_base);
        let index = self.stack.len().checked_sub(depth + 1)?;
        if index < base {
            return None;
        }
        self.stack.get(index)
    }

    /// Local slot of the current frame.
    #[inline]
    pub fn local(&self, index: usize) -> Option<&Value> {
        self.frames.last()?.locals.get(index)
    }

    /// Code object of the current frame.
    #[inline]
    pub fn code(&self) -> Option<&Arc<CodeObject>> {
        self.frames.last().map(|frame| &frame.code)
    }

    pub fn global(&self, name: &str) -> Option<&Value> {
        self.globals.get(name)
    }

    pub fn builtin(&self, name: &str) -> Option<&Value> {
        self.builtins.get(name)
    }

    /// Current stack depth of the innermost frame.
    pub fn depth(&self) -> usize {
        let base = self.frames.last().map_or(0, |frame| frame.stack_base);
        self.stack.len().saturating_sub(base)
    }

    /// Absolute stack height, across all frames.
    pub(crate) fn stack_len(&self) -> usize {
        self.stack.len()
    }

    pub(crate) fn write_output(&self, text: &str) -> Result<(), VmError> {
        let mut out = self.output.lock();
        out.write_all(text.as_bytes())?;
        Ok(())
    }

    // ===== Stack helpers =====

    #[inline(always)]
    pub(crate) fn push(&mut self, value: Value) {
        self.stack.push(value);
    }

    #[inline(always)]
    pub(crate) fn pop(&mut self, instr: &Instr) -> Result<Value, VmError> {
        if self.depth() == 0 {
            return Err(underflow(instr));
        }
        self.stack.pop().ok_or_else(|| underflow(instr))
    }

    /// Pop `count` values, returned bottom first.
    pub(crate) fn pop_n(&mut self, count: usize, instr: &Instr) -> Result<Vec<Value>, VmError> {
        if self.depth() < count {
            return Err(underflow(instr));
        }
        let at = self.stack.len() - count;
        Ok(self.stack.split_off(at))
    }

    /// Value `depth` slots below the top, or a stack underflow.
    #[inline]
    pub(crate) fn peek_at(&self, depth: usize, instr: &Instr) -> Result<&Value, VmError> {
        self.peek(depth).ok_or_else(|| underflow(instr))
    }

    pub(crate) fn peek_mut(&mut self, depth: usize, instr: &Instr) -> Result<&mut Value, VmError> {
        if self.depth() <= depth {
            return Err(underflow(instr));
        }
        let index = self.stack.len() - depth - 1;
        Ok(&mut self.stack[index])
    }

    /// Swap the top of stack with the value `depth` slots below it.
    pub(crate) fn swap_top(&mut self, depth: usize, instr: &Instr) -> Result<(), VmError> {
        if self.depth() <= depth {
            return Err(underflow(instr));
        }
        let top = self.stack.len() - 1;
        self.stack.swap(top, top - depth);
        Ok(())
    }

    // ===== Frame helpers =====

    pub(crate) fn frame(&self) -> Result<&Frame, VmError> {
        self.frames.last().ok_or(VmError::NoFrame)
    }

    pub(crate) fn frame_mut(&mut self) -> Result<&mut Frame, VmError> {
        self.frames.last_mut().ok_or(VmError::NoFrame)
    }

    pub(crate) fn current_code(&self) -> Result<Arc<CodeObject>, VmError> {
        self.frame().map(|frame| Arc::clone(&frame.code))
    }

    pub(crate) fn constant(&self, index: u32, instr: &Instr) -> Result<Value, VmError> {
        self.frame()?
            .code
            .constants
            .get(index as usize)
            .cloned()
            .ok_or(VmError::BadOperand {
                what: "constant",
                index: index as usize,
                offset: instr.site,
            })
    }

    pub(crate) fn name_at(&self, index: u32, instr: &Instr) -> Result<Arc<str>, VmError> {
        self.frame()?
            .code
            .names
            .get(index as usize)
            .cloned()
            .ok_or(VmError::BadOperand {
                what: "name",
                index: index as usize,
                offset: instr.site,
            })
    }

    pub(crate) fn local_slot(&mut self, index: u32, instr: &Instr) -> Result<&mut Value, VmError> {
        self.frame_mut()?
            .locals
            .get_mut(index as usize)
            .ok_or(VmError::BadOperand {
                what: "local",
                index: index as usize,
                offset: instr.site,
            })
    }

    pub(crate) fn lookup_name(&self, name: &str) -> Option<&Value> {
        self.globals.get(name).or_else(|| self.builtins.get(name))
    }

    pub(crate) fn remove_global(&mut self, name: &str) -> Option<Value> {
        self.globals.remove(name)
    }

    pub(crate) fn table(&self) -> &'static DispatchTable {
        self.table
    }

    pub(crate) fn monitor(&self) -> Arc<Monitoring> {
        Arc::clone(&self.monitoring)
    }

    // ===== Specialization hooks =====

    /// Feed the specializer from a generic handler. Must run before the
    /// handler consumes its operands.
    #[inline]
    pub(crate) fn observe(&self, instr: &Instr, base: Opcode) {
        if !instr.adaptive || !self.specializer.is_enabled() {
            return;
        }
        let Some(family) = specialize::family(base) else {
            return;
        };
        let candidate = specialize::select(family, self, instr);
        if let Some(code) = self.code() {
            self.specializer.observe(code, instr.site, base, candidate);
        }
    }

    /// Guard miss in `variant`: de-optimize the site and run the generic
    /// handler for this execution.
    pub(crate) fn deopt(&mut self, instr: &Instr, variant: Opcode) -> Result<ControlFlow, VmError> {
        self.stats().record_miss(variant);
        if let Some(code) = self.code() {
            self.specializer.deoptimize(code, instr.site, variant);
        }
        let base = variant.base() as u8;
        let generic = self.table.resolve(base);
        generic(self, instr.as_inner(base))
    }
}

impl Default for Vm {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for Vm {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Vm")
            .field("stack", &self.stack.len())
            .field("frames", &self.frames.len())
            .field("globals", &self.globals.len())
            .field("config", &self.config)
            .finish()
    }
}

fn underflow(instr: &Instr) -> VmError {
    VmError::StackUnderflow {
        name: instr.name(),
        offset: instr.site,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bytecode::unit;
    use pretty_assertions::assert_eq;

    fn run(code: Arc<CodeObject>) -> Result<Value, VmError> {
        Vm::new().run(code)
    }

    #[test]
    fn test_return_const() {
        let code = CodeObject::builder("main")
            .constant(42i64)
            .op(Opcode::Resume, 0)
            .op(Opcode::ReturnConst, 0)
            .build();
        assert_eq!(run(code), Ok(Value::Int(42)));
    }

    #[test]
    fn test_running_off_the_end_is_truncated() {
        let code = CodeObject::builder("main").op(Opcode::Nop, 0).build();
        assert!(matches!(
            run(code),
            Err(VmError::Decode(crate::error::DecodeError::Truncated { offset: 1 }))
        ));
    }

    #[test]
    fn test_underflow_does_not_cross_frames() {
        let code = CodeObject::builder("main").op(Opcode::PopTop, 0).build();
        assert_eq!(
            run(code),
            Err(VmError::StackUnderflow {
                name: "POP_TOP",
                offset: 0
            })
        );
    }

    #[test]
    fn test_fault_leaves_stack_alone() {
        let code = CodeObject::builder("main")
            .constant(1i64)
            .op(Opcode::LoadConst, 0)
            .raw(&[unit(255, 0)])
            .build();
        let mut vm = Vm::new();
        vm.enter(Frame::new(code, Vec::new(), 0)).unwrap();
        let err = vm.execute().unwrap_err();
        assert_eq!(
            err,
            VmError::UnknownOpcode {
                opcode: 255,
                offset: 1
            }
        );
        assert_eq!(vm.depth(), 1);
        assert_eq!(vm.stats().faults(), 1);
    }

    #[test]
    fn test_recursion_limit() {
        // f() calls itself forever
        let f = CodeObject::builder("f")
            .name("f")
            .op(Opcode::LoadGlobal, 1)
            .op(Opcode::Call, 0)
            .op(Opcode::ReturnValue, 0)
            .build();
        let main = CodeObject::builder("main")
            .constant(Value::Code(f))
            .name("f")
            .op(Opcode::LoadConst, 0)
            .op(Opcode::MakeFunction, 0)
            .op(Opcode::StoreGlobal, 0)
            .op(Opcode::LoadGlobal, 1)
            .op(Opcode::Call, 0)
            .op(Opcode::ReturnValue, 0)
            .build();
        let mut vm = Vm::with_config(VmConfig {
            max_frames: 50,
            ..VmConfig::default()
        });
        assert_eq!(vm.run(main), Err(VmError::RecursionLimit(50)));
    }

    #[test]
    fn test_print_goes_to_output_writer() {
        let (writer, buffer) = buffer_writer();
        let code = CodeObject::builder("main")
            .name("print")
            .constant("hi")
            .op(Opcode::LoadGlobal, 1)
            .op(Opcode::LoadConst, 0)
            .op(Opcode::Call, 1)
            .op(Opcode::ReturnValue, 0)
            .build();
        let mut vm = Vm::new();
        vm.set_output_writer(writer);
        assert_eq!(vm.run(code), Ok(Value::None));
        assert_eq!(String::from_utf8(buffer.lock().clone()).unwrap(), "hi\n");
    }
}
