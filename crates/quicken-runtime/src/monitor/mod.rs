//! Execution monitoring
//!
//! Tools attach to a [`Monitoring`] instance, subscribe to [`Events`]
//! globally or per code object, and register one [`Observer`] per event.
//! Subscribed sites are rewritten to `INSTRUMENTED_*` opcodes whose handlers
//! fire the hooks before (or, for jumps and branches, after) running the
//! original instruction. Sites without subscribers run their original opcode
//! and pay nothing.
//!
//! Every change to the subscription state bumps a version number and eagerly
//! re-instruments the live code objects this instance has seen. Code objects
//! entered for the first time are instrumented lazily by the VM when their
//! recorded version differs.

mod events;
mod instrument;

pub use events::{
    EventDetail, Events, HookAction, MonitorError, MonitorEvent, Observer, ToolId, MAX_TOOLS,
};

pub(crate) use events::counterpart_events;
pub(crate) use instrument::inner;

use crate::bytecode::CodeObject;
use crate::opcode::Opcode;
use parking_lot::RwLock;
use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};

struct Tool {
    name: String,
    events: Events,
    observers: HashMap<u16, Arc<dyn Observer>>,
}

struct TrackedCode {
    code: Weak<CodeObject>,
    local: [Events; MAX_TOOLS],
}

impl TrackedCode {
    fn new(code: &Arc<CodeObject>) -> Self {
        Self {
            code: Arc::downgrade(code),
            local: [Events::empty(); MAX_TOOLS],
        }
    }
}

#[derive(Default)]
struct MonitorState {
    tools: [Option<Tool>; MAX_TOOLS],
    codes: HashMap<u64, TrackedCode>,
    /// Events switched off per `(code id, site)` and tool.
    disabled: HashMap<(u64, usize), [Events; MAX_TOOLS]>,
}

impl MonitorState {
    fn tool(&self, tool: ToolId) -> Result<&Tool, MonitorError> {
        self.tools[tool.index()]
            .as_ref()
            .ok_or(MonitorError::ToolNotInUse(tool))
    }

    fn tool_mut(&mut self, tool: ToolId) -> Result<&mut Tool, MonitorError> {
        self.tools[tool.index()]
            .as_mut()
            .ok_or(MonitorError::ToolNotInUse(tool))
    }

    /// Events `tool` wants at a site.
    fn tool_events(&self, tool: ToolId, code: u64, site: usize) -> Events {
        let Some(entry) = &self.tools[tool.index()] else {
            return Events::empty();
        };
        let local = self
            .codes
            .get(&code)
            .map_or(Events::empty(), |tracked| tracked.local[tool.index()]);
        let disabled = self
            .disabled
            .get(&(code, site))
            .map_or(Events::empty(), |off| off[tool.index()]);
        (entry.events | local) - disabled
    }

    fn site_events(&self, code: u64, site: usize) -> Events {
        ToolId::all().fold(Events::empty(), |acc, tool| {
            acc | self.tool_events(tool, code, site)
        })
    }

    fn instrument(&self, code: &CodeObject, version: u64) {
        let id = code.id();
        let sites = instrument::apply(code, |site| self.site_events(id, site));
        code.set_monitor_version(version);
        tracing::trace!(
            target: "quicken::monitor",
            code = %code.name,
            sites,
            version,
            "instrumented code object"
        );
    }

    fn instrument_all(&mut self, version: u64) {
        self.codes.retain(|_, tracked| tracked.code.strong_count() > 0);
        let live: Vec<_> = self
            .codes
            .values()
            .filter_map(|tracked| tracked.code.upgrade())
            .collect();
        for code in &live {
            self.instrument(code, version);
        }
        tracing::debug!(
            target: "quicken::monitor",
            codes = live.len(),
            version,
            "re-instrumented live code"
        );
    }
}

/// Source of instrumentation versions for every [`Monitoring`] in the
/// process. Code objects start at 0, which no monitor ever holds.
static NEXT_VERSION: AtomicU64 = AtomicU64::new(1);

fn next_version() -> u64 {
    NEXT_VERSION.fetch_add(1, Ordering::Relaxed)
}

/// Monitoring state shared by every VM that reports to the same tools.
pub struct Monitoring {
    state: RwLock<MonitorState>,
    version: AtomicU64,
}

impl Monitoring {
    pub fn new() -> Self {
        Self {
            state: RwLock::new(MonitorState::default()),
            version: AtomicU64::new(next_version()),
        }
    }

    /// Bumped by every change that can alter instrumentation.
    #[inline]
    pub fn version(&self) -> u64 {
        self.version.load(Ordering::Acquire)
    }

    /// Apply `change` and re-instrument every live code object.
    fn update<R>(
        &self,
        change: impl FnOnce(&mut MonitorState) -> Result<R, MonitorError>,
    ) -> Result<R, MonitorError> {
        let mut state = self.state.write();
        let out = change(&mut state)?;
        let version = next_version();
        self.version.store(version, Ordering::Release);
        state.instrument_all(version);
        Ok(out)
    }

    /// Claim a tool slot.
    pub fn use_tool(&self, tool: ToolId, name: impl Into<String>) -> Result<(), MonitorError> {
        let name = name.into();
        self.update(|state| {
            if let Some(existing) = &state.tools[tool.index()] {
                return Err(MonitorError::ToolInUse {
                    tool,
                    name: existing.name.clone(),
                });
            }
            tracing::info!(target: "quicken::monitor", tool = tool.get(), %name, "tool attached");
            state.tools[tool.index()] = Some(Tool {
                name,
                events: Events::empty(),
                observers: HashMap::new(),
            });
            Ok(())
        })
    }

    /// Release a tool slot, dropping its observers and subscriptions and
    /// restoring every site it had instrumented.
    pub fn free_tool(&self, tool: ToolId) -> Result<(), MonitorError> {
        self.update(|state| {
            let entry = state.tools[tool.index()]
                .take()
                .ok_or(MonitorError::ToolNotInUse(tool))?;
            for tracked in state.codes.values_mut() {
                tracked.local[tool.index()] = Events::empty();
            }
            for off in state.disabled.values_mut() {
                off[tool.index()] = Events::empty();
            }
            state.disabled.retain(|_, off| off.iter().any(|e| !e.is_empty()));
            tracing::info!(target: "quicken::monitor", tool = tool.get(), name = %entry.name, "tool detached");
            Ok(())
        })
    }

    pub fn tool_name(&self, tool: ToolId) -> Option<String> {
        self.state.read().tools[tool.index()]
            .as_ref()
            .map(|entry| entry.name.clone())
    }

    /// Register `observer` for a single event. Returns the observer it replaces.
    pub fn register(
        &self,
        tool: ToolId,
        event: Events,
        observer: impl Observer + 'static,
    ) -> Result<Option<Arc<dyn Observer>>, MonitorError> {
        if !event.is_single() {
            return Err(MonitorError::NotSingleEvent(event));
        }
        let mut state = self.state.write();
        let entry = state.tool_mut(tool)?;
        Ok(entry.observers.insert(event.bits(), Arc::new(observer)))
    }

    pub fn unregister(
        &self,
        tool: ToolId,
        event: Events,
    ) -> Result<Option<Arc<dyn Observer>>, MonitorError> {
        let mut state = self.state.write();
        let entry = state.tool_mut(tool)?;
        Ok(entry.observers.remove(&event.bits()))
    }

    /// Replace a tool's global event set.
    pub fn set_events(&self, tool: ToolId, events: Events) -> Result<(), MonitorError> {
        self.update(|state| {
            state.tool_mut(tool)?.events = events;
            Ok(())
        })?;
        tracing::debug!(target: "quicken::monitor", tool = tool.get(), %events, "global events set");
        Ok(())
    }

    pub fn get_events(&self, tool: ToolId) -> Result<Events, MonitorError> {
        Ok(self.state.read().tool(tool)?.events)
    }

    /// Add events to a tool's global set.
    pub fn enable(&self, tool: ToolId, events: Events) -> Result<(), MonitorError> {
        self.update(|state| {
            state.tool_mut(tool)?.events |= events;
            Ok(())
        })
    }

    /// Remove events from a tool's global set.
    pub fn disable(&self, tool: ToolId, events: Events) -> Result<(), MonitorError> {
        self.update(|state| {
            state.tool_mut(tool)?.events -= events;
            Ok(())
        })
    }

    /// Replace a tool's event set for one code object.
    pub fn set_local_events(
        &self,
        tool: ToolId,
        code: &Arc<CodeObject>,
        events: Events,
    ) -> Result<(), MonitorError> {
        self.update(|state| {
            state.tool(tool)?;
            state
                .codes
                .entry(code.id())
                .or_insert_with(|| TrackedCode::new(code))
                .local[tool.index()] = events;
            Ok(())
        })
    }

    pub fn get_local_events(
        &self,
        tool: ToolId,
        code: &CodeObject,
    ) -> Result<Events, MonitorError> {
        let state = self.state.read();
        state.tool(tool)?;
        Ok(state
            .codes
            .get(&code.id())
            .map_or(Events::empty(), |tracked| tracked.local[tool.index()]))
    }

    /// Re-enable every event an observer switched off with [`HookAction::Disable`].
    pub fn restart_events(&self) {
        let _ = self.update(|state| {
            state.disabled.clear();
            Ok(())
        });
    }

    /// Bring a code object up to the current version and start tracking it.
    pub fn instrument(&self, code: &Arc<CodeObject>) {
        if code.monitor_version() == self.version() {
            return;
        }
        let mut state = self.state.write();
        state
            .codes
            .entry(code.id())
            .or_insert_with(|| TrackedCode::new(code));
        state.instrument(code, self.version());
    }

    /// Events active at a site across all tools.
    pub fn site_events(&self, code: &CodeObject, site: usize) -> Events {
        self.state.read().site_events(code.id(), site)
    }

    /// Deliver `event` to every tool that wants it at this site.
    pub(crate) fn fire(
        &self,
        code: &Arc<CodeObject>,
        site: usize,
        opcode: Opcode,
        event: Events,
        detail: EventDetail,
    ) {
        let targets: Vec<(ToolId, Arc<dyn Observer>)> = {
            let state = self.state.read();
            ToolId::all()
                .filter(|&tool| state.tool_events(tool, code.id(), site).contains(event))
                .filter_map(|tool| {
                    let entry = state.tools[tool.index()].as_ref()?;
                    let observer = entry.observers.get(&event.bits())?;
                    Some((tool, Arc::clone(observer)))
                })
                .collect()
        };
        if targets.is_empty() {
            return;
        }

        let mut disable = Vec::new();
        for (tool, observer) in targets {
            let payload = MonitorEvent {
                tool,
                event,
                code: code.name.clone(),
                offset: site,
                opcode,
                detail: detail.clone(),
            };
            if observer.on_event(&payload) == HookAction::Disable {
                disable.push(tool);
            }
        }
        if disable.is_empty() {
            return;
        }

        let _ = self.update(|state| {
            let off = state.disabled.entry((code.id(), site)).or_default();
            for tool in &disable {
                off[tool.index()] |= event;
            }
            Ok(())
        });
        tracing::debug!(
            target: "quicken::monitor",
            code = %code.name,
            site,
            %event,
            "event disabled at site"
        );
    }
}

impl Default for Monitoring {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for Monitoring {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = self.state.read();
        let tools: Vec<_> = state
            .tools
            .iter()
            .enumerate()
            .filter_map(|(i, t)| t.as_ref().map(|t| (i, t.name.clone(), t.events)))
            .collect();
        f.debug_struct("Monitoring")
            .field("version", &self.version())
            .field("tools", &tools)
            .field("tracked", &state.codes.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bytecode::split;
    use pretty_assertions::assert_eq;
    use std::sync::atomic::AtomicUsize;

    fn sample() -> Arc<CodeObject> {
        CodeObject::builder("sample")
            .constant(1i64)
            .op(Opcode::PushNull, 0)
            .op(Opcode::LoadConst, 0)
            .op(Opcode::Call, 0)
            .op(Opcode::ReturnValue, 0)
            .build()
    }

    fn opcodes(code: &CodeObject) -> Vec<u8> {
        code.snapshot().into_iter().map(|u| split(u).0).collect()
    }

    #[test]
    fn test_tool_slots() {
        let monitoring = Monitoring::new();
        monitoring.use_tool(ToolId::DEBUGGER, "dbg").unwrap();
        assert_eq!(
            monitoring.use_tool(ToolId::DEBUGGER, "other"),
            Err(MonitorError::ToolInUse {
                tool: ToolId::DEBUGGER,
                name: "dbg".into()
            })
        );
        assert_eq!(monitoring.tool_name(ToolId::DEBUGGER).as_deref(), Some("dbg"));
        monitoring.free_tool(ToolId::DEBUGGER).unwrap();
        assert_eq!(
            monitoring.free_tool(ToolId::DEBUGGER),
            Err(MonitorError::ToolNotInUse(ToolId::DEBUGGER))
        );
        assert_eq!(
            monitoring.set_events(ToolId::PROFILER, Events::CALL),
            Err(MonitorError::ToolNotInUse(ToolId::PROFILER))
        );
    }

    #[test]
    fn test_register_requires_single_event() {
        let monitoring = Monitoring::new();
        monitoring.use_tool(ToolId::PROFILER, "prof").unwrap();
        let observer = |_: &MonitorEvent| HookAction::Continue;
        assert_eq!(
            monitoring
                .register(ToolId::PROFILER, Events::CALL | Events::LINE, observer)
                .err(),
            Some(MonitorError::NotSingleEvent(Events::CALL | Events::LINE))
        );
        assert!(monitoring
            .register(ToolId::PROFILER, Events::CALL, observer)
            .unwrap()
            .is_none());
        assert!(monitoring
            .register(ToolId::PROFILER, Events::CALL, observer)
            .unwrap()
            .is_some());
    }

    #[test]
    fn test_set_events_reinstruments_tracked_code() {
        let monitoring = Monitoring::new();
        let code = sample();
        let before = code.snapshot();
        monitoring.use_tool(ToolId::PROFILER, "prof").unwrap();
        monitoring.instrument(&code);

        monitoring.set_events(ToolId::PROFILER, Events::CALL).unwrap();
        assert_eq!(opcodes(&code)[2], Opcode::InstrumentedCall as u8);
        assert_eq!(code.monitor_version(), monitoring.version());

        monitoring.free_tool(ToolId::PROFILER).unwrap();
        assert_eq!(code.snapshot(), before);
    }

    #[test]
    fn test_first_entry_tracks_code_on_unused_monitor() {
        let monitoring = Monitoring::new();
        let code = sample();
        monitoring.instrument(&code);
        assert_eq!(code.monitor_version(), monitoring.version());

        // Attaching later reaches the code without another `instrument` call.
        monitoring.use_tool(ToolId::PROFILER, "prof").unwrap();
        monitoring.set_events(ToolId::PROFILER, Events::CALL).unwrap();
        assert_eq!(opcodes(&code)[2], Opcode::InstrumentedCall as u8);
    }

    #[test]
    fn test_versions_are_distinct_across_monitors() {
        let first = Monitoring::new();
        let second = Monitoring::new();
        assert_ne!(first.version(), second.version());

        let code = sample();
        first.instrument(&code);
        second.instrument(&code);
        second.use_tool(ToolId::COVERAGE, "cov").unwrap();
        second.set_events(ToolId::COVERAGE, Events::PY_RETURN).unwrap();
        assert_eq!(opcodes(&code)[3], Opcode::InstrumentedReturnValue as u8);
    }

    #[test]
    fn test_lazy_instrumentation() {
        let monitoring = Monitoring::new();
        monitoring.use_tool(ToolId::COVERAGE, "cov").unwrap();
        monitoring
            .set_events(ToolId::COVERAGE, Events::PY_RETURN)
            .unwrap();
        let code = sample();
        assert_eq!(opcodes(&code)[3], Opcode::ReturnValue as u8);
        monitoring.instrument(&code);
        assert_eq!(opcodes(&code)[3], Opcode::InstrumentedReturnValue as u8);
    }

    #[test]
    fn test_local_events_only_touch_one_code_object() {
        let monitoring = Monitoring::new();
        let first = sample();
        let second = sample();
        monitoring.use_tool(ToolId::DEBUGGER, "dbg").unwrap();
        monitoring.instrument(&second);
        monitoring
            .set_local_events(ToolId::DEBUGGER, &first, Events::CALL)
            .unwrap();
        assert_eq!(opcodes(&first)[2], Opcode::InstrumentedCall as u8);
        assert_eq!(opcodes(&second)[2], Opcode::Call as u8);
        assert_eq!(
            monitoring.get_local_events(ToolId::DEBUGGER, &first),
            Ok(Events::CALL)
        );
    }

    #[test]
    fn test_fire_and_disable() {
        let monitoring = Monitoring::new();
        let code = sample();
        let calls = Arc::new(AtomicUsize::new(0));
        monitoring.use_tool(ToolId::PROFILER, "prof").unwrap();
        let seen = Arc::clone(&calls);
        monitoring
            .register(ToolId::PROFILER, Events::CALL, move |event: &MonitorEvent| {
                assert_eq!(event.offset, 2);
                seen.fetch_add(1, Ordering::SeqCst);
                HookAction::Disable
            })
            .unwrap();
        monitoring.set_events(ToolId::PROFILER, Events::CALL).unwrap();
        monitoring.instrument(&code);

        let fire = || {
            monitoring.fire(&code, 2, Opcode::Call, Events::CALL, EventDetail::None);
        };
        fire();
        fire();
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert_eq!(opcodes(&code)[2], Opcode::Call as u8);

        monitoring.restart_events();
        assert_eq!(opcodes(&code)[2], Opcode::InstrumentedCall as u8);
        fire();
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn test_dropped_code_is_forgotten() {
        let monitoring = Monitoring::new();
        monitoring.use_tool(ToolId::DEBUGGER, "dbg").unwrap();
        monitoring.set_events(ToolId::DEBUGGER, Events::LINE).unwrap();
        {
            let code = sample();
            monitoring.instrument(&code);
        }
        monitoring.set_events(ToolId::DEBUGGER, Events::empty()).unwrap();
        assert_eq!(monitoring.state.read().codes.len(), 0);
    }
}
