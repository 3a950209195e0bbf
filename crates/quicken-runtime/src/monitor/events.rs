//! Monitoring events, tools and observers

use crate::opcode::Opcode;
use crate::value::Value;
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;
use thiserror::Error;

bitflags::bitflags! {
    /// Event classes a tool can subscribe to.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
    pub struct Events: u16 {
        const PY_START = 1 << 0;
        const PY_RESUME = 1 << 1;
        const PY_RETURN = 1 << 2;
        const PY_YIELD = 1 << 3;
        const CALL = 1 << 4;
        const LINE = 1 << 5;
        const INSTRUCTION = 1 << 6;
        const JUMP = 1 << 7;
        const BRANCH = 1 << 8;
        const STOP_ITERATION = 1 << 9;
        const C_RETURN = 1 << 10;
    }
}

const EVENT_NAMES: &[(&str, Events)] = &[
    ("py_start", Events::PY_START),
    ("py_resume", Events::PY_RESUME),
    ("py_return", Events::PY_RETURN),
    ("py_yield", Events::PY_YIELD),
    ("call", Events::CALL),
    ("line", Events::LINE),
    ("instruction", Events::INSTRUCTION),
    ("jump", Events::JUMP),
    ("branch", Events::BRANCH),
    ("stop_iteration", Events::STOP_ITERATION),
    ("c_return", Events::C_RETURN),
];

impl Events {
    /// Lower-case name of a single event.
    pub fn name(self) -> Option<&'static str> {
        EVENT_NAMES
            .iter()
            .find(|(_, event)| *event == self)
            .map(|(name, _)| *name)
    }

    /// Parse one event name, case-insensitively.
    pub fn parse_one(name: &str) -> Result<Events, MonitorError> {
        let wanted = name.trim().to_ascii_lowercase();
        EVENT_NAMES
            .iter()
            .find(|(candidate, _)| *candidate == wanted)
            .map(|(_, event)| *event)
            .ok_or_else(|| MonitorError::UnknownEvent(name.trim().to_string()))
    }

    /// Parse a comma-separated list such as `"call,line"`.
    pub fn parse_list(list: &str) -> Result<Events, MonitorError> {
        list.split(',')
            .filter(|part| !part.trim().is_empty())
            .try_fold(Events::empty(), |acc, part| Ok(acc | Events::parse_one(part)?))
    }

    /// Individual events in bit order.
    pub fn each(self) -> impl Iterator<Item = Events> {
        EVENT_NAMES
            .iter()
            .map(|(_, event)| *event)
            .filter(move |event| self.contains(*event))
    }

    pub fn is_single(self) -> bool {
        self.bits().count_ones() == 1
    }
}

impl FromStr for Events {
    type Err = MonitorError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Events::parse_list(s)
    }
}

impl fmt::Display for Events {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let names: Vec<_> = self.each().filter_map(Events::name).collect();
        f.write_str(&names.join(","))
    }
}

/// Events an instrumented opcode raises.
pub(crate) fn counterpart_events(op: Opcode) -> Events {
    use Opcode::*;
    match op {
        InstrumentedResume => Events::PY_START | Events::PY_RESUME,
        InstrumentedEndFor | InstrumentedEndSend => Events::STOP_ITERATION,
        InstrumentedReturnValue | InstrumentedReturnConst => Events::PY_RETURN,
        InstrumentedYieldValue => Events::PY_YIELD,
        InstrumentedLoadSuperAttr | InstrumentedCallFunctionEx => Events::CALL,
        InstrumentedCall => Events::CALL | Events::C_RETURN,
        InstrumentedForIter => Events::BRANCH,
        InstrumentedJumpForward | InstrumentedJumpBackward => Events::JUMP,
        InstrumentedPopJumpIfTrue
        | InstrumentedPopJumpIfFalse
        | InstrumentedPopJumpIfNone
        | InstrumentedPopJumpIfNotNone => Events::BRANCH,
        InstrumentedInstruction => Events::INSTRUCTION,
        InstrumentedLine => Events::LINE,
        _ => Events::empty(),
    }
}

/// Number of tool slots.
pub const MAX_TOOLS: usize = 6;

/// A monitoring tool slot, `0..=5`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ToolId(u8);

impl ToolId {
    pub const DEBUGGER: ToolId = ToolId(0);
    pub const COVERAGE: ToolId = ToolId(1);
    pub const PROFILER: ToolId = ToolId(2);
    pub const OPTIMIZER: ToolId = ToolId(5);

    pub fn new(id: u8) -> Result<Self, MonitorError> {
        if (id as usize) < MAX_TOOLS {
            Ok(Self(id))
        } else {
            Err(MonitorError::InvalidTool(id))
        }
    }

    pub fn get(self) -> u8 {
        self.0
    }

    pub(crate) fn index(self) -> usize {
        self.0 as usize
    }

    pub(crate) fn all() -> impl Iterator<Item = ToolId> {
        (0..MAX_TOOLS as u8).map(ToolId)
    }
}

impl fmt::Display for ToolId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "tool {}", self.0)
    }
}

/// Event-specific payload.
#[derive(Debug, Clone, PartialEq)]
pub enum EventDetail {
    None,
    /// New source line.
    Line(u32),
    Jump {
        target: usize,
    },
    Branch {
        target: usize,
        taken: bool,
    },
    Call {
        callable: Value,
        arg_count: u32,
    },
    Return(Value),
    Yield(Value),
}

/// One event delivered to an observer.
#[derive(Debug, Clone)]
pub struct MonitorEvent {
    pub tool: ToolId,
    pub event: Events,
    /// Name of the executing code object.
    pub code: Arc<str>,
    /// Unit offset of the instruction's opcode.
    pub offset: usize,
    /// Opcode the site held before instrumentation.
    pub opcode: Opcode,
    pub detail: EventDetail,
}

/// What an observer wants done with the event at this site.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum HookAction {
    #[default]
    Continue,
    /// Stop raising this event at this site until events are restarted.
    Disable,
}

/// Receives monitoring events.
pub trait Observer: Send + Sync {
    fn on_event(&self, event: &MonitorEvent) -> HookAction;
}

impl<F> Observer for F
where
    F: Fn(&MonitorEvent) -> HookAction + Send + Sync,
{
    fn on_event(&self, event: &MonitorEvent) -> HookAction {
        self(event)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum MonitorError {
    #[error("tool id {0} is out of range (0..=5)")]
    InvalidTool(u8),

    #[error("{tool} is already in use by '{name}'")]
    ToolInUse { tool: ToolId, name: String },

    #[error("{0} is not in use")]
    ToolNotInUse(ToolId),

    #[error("unknown event '{0}'")]
    UnknownEvent(String),

    #[error("observers are registered for exactly one event, got '{0}'")]
    NotSingleEvent(Events),
}
