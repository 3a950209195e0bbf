//! Code objects and the live instruction stream
//!
//! Each code unit is 16 bits: opcode in the low byte, operand in the high
//! byte. Units are stored as `AtomicU16` so that rewriting a site publishes
//! the opcode and operand together; a concurrent reader sees either the old
//! pair or the new one.
//!
//! Alongside the units, every code object owns:
//! - one [`AdaptiveSlot`] per unit (specialization counters)
//! - one monitoring side-table entry per unit, holding the original opcode
//!   of an instrumented site and which instrumentation layers are active

pub mod asm;
pub mod disasm;
pub mod extended_arg;
pub mod serialize;
pub mod validator;

pub use extended_arg::{decode_at, decode_slice, encode, Decoded};
pub use validator::{validate, ValidationError, ValidationErrorKind, ValidationReport};

use crate::opcode::{OpClass, Opcode, OpcodeRegistry};
use crate::specialize::AdaptiveSlot;
use crate::value::Value;
use std::fmt;
use std::sync::atomic::{AtomicU16, AtomicU64, Ordering};
use std::sync::Arc;

static NEXT_CODE_ID: AtomicU64 = AtomicU64::new(1);

/// Pack an opcode and operand byte into a code unit.
#[inline]
pub const fn unit(op: u8, arg: u8) -> u16 {
    (op as u16) | ((arg as u16) << 8)
}

/// Split a code unit into `(opcode, operand byte)`.
#[inline]
pub const fn split(unit: u16) -> (u8, u8) {
    (unit as u8, (unit >> 8) as u8)
}

bitflags::bitflags! {
    /// Instrumentation layers stacked on one site, outermost first.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
    pub struct Layers: u8 {
        const LINE = 1 << 0;
        const INSTRUCTION = 1 << 1;
        const EVENT = 1 << 2;
    }
}

/// Monitoring record for one site.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SiteRecord {
    /// Opcode the site held before instrumentation (generic or specialized).
    pub original: u8,
    pub layers: Layers,
}

impl SiteRecord {
    fn pack(self) -> u16 {
        unit(self.original, self.layers.bits())
    }

    fn unpack(raw: u16) -> Self {
        let (original, layers) = split(raw);
        Self {
            original,
            layers: Layers::from_bits_truncate(layers),
        }
    }
}

/// An executable unit of bytecode.
pub struct CodeObject {
    id: u64,
    pub name: Arc<str>,
    pub arg_count: u32,
    pub local_count: u32,
    pub constants: Vec<Value>,
    /// Global names referenced by `LOAD_GLOBAL` / `STORE_GLOBAL`.
    pub names: Vec<Arc<str>>,
    /// Source line per unit; `0` where unknown.
    pub lines: Vec<u32>,
    units: Box<[AtomicU16]>,
    adaptive: Box<[AdaptiveSlot]>,
    sites: Box<[AtomicU16]>,
    monitor_version: AtomicU64,
}

impl CodeObject {
    pub fn builder(name: impl Into<Arc<str>>) -> CodeBuilder {
        CodeBuilder::new(name)
    }

    /// Process-unique identity.
    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn len(&self) -> usize {
        self.units.len()
    }

    pub fn is_empty(&self) -> bool {
        self.units.is_empty()
    }

    #[inline]
    pub fn load_unit(&self, index: usize) -> Option<u16> {
        self.units.get(index).map(|u| u.load(Ordering::Acquire))
    }

    #[inline]
    pub(crate) fn adaptive(&self, site: usize) -> Option<&AdaptiveSlot> {
        self.adaptive.get(site)
    }

    /// Decode the instruction starting at `start`.
    #[inline]
    pub fn fetch(&self, start: usize) -> Result<Decoded, crate::error::DecodeError> {
        decode_at(self.units.len(), |i| self.units[i].load(Ordering::Acquire), start)
    }

    /// Source line of a unit, if known.
    pub fn line_at(&self, index: usize) -> Option<u32> {
        self.lines.get(index).copied().filter(|&line| line != 0)
    }

    /// Live units, including any specialized or instrumented opcodes.
    pub fn snapshot(&self) -> Vec<u16> {
        self.units.iter().map(|u| u.load(Ordering::Acquire)).collect()
    }

    /// Units as compiled: specialized opcodes mapped to their base and
    /// instrumented opcodes mapped to their original's base.
    pub fn deoptimized(&self) -> Vec<u16> {
        let registry = OpcodeRegistry::global();
        self.units
            .iter()
            .enumerate()
            .map(|(index, cell)| {
                let (op, arg) = split(cell.load(Ordering::Acquire));
                let op = match registry.info(op).class {
                    OpClass::Instrumented => self.site(index).original,
                    _ => op,
                };
                let base = registry.info(op).base.unwrap_or(op);
                unit(base, arg)
            })
            .collect()
    }

    /// Replace opcode `from` with `to` at `site`, keeping the operand.
    ///
    /// When the site is currently instrumented the swap is applied to the
    /// recorded original instead, so the change takes effect once the
    /// instrumentation is removed. Returns `false` if the site holds neither.
    pub fn rewrite(&self, site: usize, from: u8, to: u8) -> bool {
        let Some(cell) = self.units.get(site) else {
            return false;
        };
        let registry = OpcodeRegistry::global();
        let current = cell.load(Ordering::Acquire);
        let (op, arg) = split(current);

        if op == from {
            return cell
                .compare_exchange(current, unit(to, arg), Ordering::AcqRel, Ordering::Acquire)
                .is_ok();
        }
        if registry.info(op).class != OpClass::Instrumented {
            return false;
        }

        let record_cell = &self.sites[site];
        let raw = record_cell.load(Ordering::Acquire);
        let record = SiteRecord::unpack(raw);
        if record.original != from {
            return false;
        }
        let updated = SiteRecord {
            original: to,
            ..record
        };
        record_cell
            .compare_exchange(raw, updated.pack(), Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }

    /// Monitoring record for a site.
    pub fn site(&self, index: usize) -> SiteRecord {
        self.sites
            .get(index)
            .map(|cell| SiteRecord::unpack(cell.load(Ordering::Acquire)))
            .unwrap_or(SiteRecord {
                original: 0,
                layers: Layers::empty(),
            })
    }

    /// Install `layers` on a site, recording its original opcode.
    ///
    /// `outermost` maps `(original, layers)` to the opcode the unit should
    /// hold. Retries until the unit is updated without interference from a
    /// concurrent rewrite.
    pub(crate) fn set_layers(
        &self,
        site: usize,
        layers: impl Fn(u8) -> Layers,
        outermost: impl Fn(u8, Layers) -> u8,
    ) -> bool {
        let Some(cell) = self.units.get(site) else {
            return false;
        };
        let registry = OpcodeRegistry::global();
        loop {
            let current = cell.load(Ordering::Acquire);
            let (op, arg) = split(current);
            let original = if registry.info(op).class == OpClass::Instrumented {
                self.site(site).original
            } else {
                op
            };
            let wanted = layers(original);
            self.sites[site].store(
                SiteRecord {
                    original,
                    layers: wanted,
                }
                .pack(),
                Ordering::Release,
            );
            let target = if wanted.is_empty() {
                original
            } else {
                outermost(original, wanted)
            };
            if cell
                .compare_exchange(current, unit(target, arg), Ordering::AcqRel, Ordering::Acquire)
                .is_ok()
            {
                return !wanted.is_empty();
            }
        }
    }

    pub(crate) fn monitor_version(&self) -> u64 {
        self.monitor_version.load(Ordering::Acquire)
    }

    pub(crate) fn set_monitor_version(&self, version: u64) {
        self.monitor_version.store(version, Ordering::Release);
    }

    /// Nested code objects among the constants.
    pub fn nested(&self) -> impl Iterator<Item = &Arc<CodeObject>> {
        self.constants.iter().filter_map(|c| match c {
            Value::Code(code) => Some(code),
            _ => None,
        })
    }
}

impl fmt::Debug for CodeObject {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CodeObject")
            .field("name", &self.name)
            .field("arg_count", &self.arg_count)
            .field("local_count", &self.local_count)
            .field("constants", &self.constants.len())
            .field("units", &self.units.len())
            .finish()
    }
}

/// Assembles a [`CodeObject`] from parts.
#[derive(Debug, Clone)]
pub struct CodeBuilder {
    name: Arc<str>,
    arg_count: u32,
    local_count: u32,
    constants: Vec<Value>,
    names: Vec<Arc<str>>,
    units: Vec<u16>,
    lines: Vec<u32>,
    line: u32,
}

impl CodeBuilder {
    pub fn new(name: impl Into<Arc<str>>) -> Self {
        Self {
            name: name.into(),
            arg_count: 0,
            local_count: 0,
            constants: Vec::new(),
            names: Vec::new(),
            units: Vec::new(),
            lines: Vec::new(),
            line: 0,
        }
    }

    pub fn args(mut self, count: u32) -> Self {
        self.arg_count = count;
        self.local_count = self.local_count.max(count);
        self
    }

    pub fn locals(mut self, count: u32) -> Self {
        self.local_count = count.max(self.arg_count);
        self
    }

    pub fn constant(mut self, value: impl Into<Value>) -> Self {
        self.constants.push(value.into());
        self
    }

    pub fn name(mut self, name: impl Into<Arc<str>>) -> Self {
        self.names.push(name.into());
        self
    }

    /// Line number attached to subsequently emitted units.
    pub fn line(mut self, line: u32) -> Self {
        self.line = line;
        self
    }

    /// Emit one instruction, with `EXTENDED_ARG` prefixes when `arg` needs them.
    pub fn op(mut self, op: Opcode, arg: u32) -> Self {
        for unit in encode(op as u8, arg) {
            self.units.push(unit);
            self.lines.push(self.line);
        }
        self
    }

    /// Emit raw units verbatim.
    pub fn raw(mut self, units: &[u16]) -> Self {
        self.units.extend_from_slice(units);
        self.lines.extend(std::iter::repeat(self.line).take(units.len()));
        self
    }

    pub fn with_lines(mut self, lines: Vec<u32>) -> Self {
        self.lines = lines;
        self
    }

    pub fn build(self) -> Arc<CodeObject> {
        let len = self.units.len();
        let mut lines = self.lines;
        lines.resize(len, 0);
        Arc::new(CodeObject {
            id: NEXT_CODE_ID.fetch_add(1, Ordering::Relaxed),
            name: self.name,
            arg_count: self.arg_count,
            local_count: self.local_count,
            constants: self.constants,
            names: self.names,
            lines,
            units: self.units.into_iter().map(AtomicU16::new).collect(),
            adaptive: (0..len).map(|_| AdaptiveSlot::new()).collect(),
            sites: (0..len).map(|_| AtomicU16::new(0)).collect(),
            monitor_version: AtomicU64::new(0),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn sample() -> Arc<CodeObject> {
        CodeObject::builder("sample")
            .constant(1i64)
            .op(Opcode::LoadConst, 0)
            .op(Opcode::LoadConst, 0)
            .op(Opcode::BinaryOp, 0)
            .op(Opcode::ReturnValue, 0)
            .build()
    }

    #[test]
    fn test_unit_packing() {
        assert_eq!(unit(Opcode::LoadConst as u8, 7), 0x078E);
        assert_eq!(split(0x078E), (142, 7));
    }

    #[test]
    fn test_rewrite_requires_expected_opcode() {
        let code = sample();
        let add = Opcode::BinaryOpAddInt as u8;
        assert!(!code.rewrite(2, Opcode::Call as u8, add));
        assert!(code.rewrite(2, Opcode::BinaryOp as u8, add));
        assert_eq!(split(code.snapshot()[2]).0, add);
        assert_eq!(code.deoptimized()[2], unit(Opcode::BinaryOp as u8, 0));
    }

    #[test]
    fn test_rewrite_under_instrumentation_updates_record() {
        let code = sample();
        let binary_op = Opcode::BinaryOp as u8;
        code.set_layers(2, |_| Layers::INSTRUCTION, |_, _| {
            Opcode::InstrumentedInstruction as u8
        });
        assert!(code.rewrite(2, binary_op, Opcode::BinaryOpAddInt as u8));
        assert_eq!(
            split(code.snapshot()[2]).0,
            Opcode::InstrumentedInstruction as u8
        );
        assert_eq!(code.site(2).original, Opcode::BinaryOpAddInt as u8);

        code.set_layers(2, |_| Layers::empty(), |op, _| op);
        assert_eq!(split(code.snapshot()[2]).0, Opcode::BinaryOpAddInt as u8);
    }

    #[test]
    fn test_builder_emits_prefixes() {
        let code = CodeObject::builder("wide")
            .line(3)
            .op(Opcode::LoadConst, 0x0102)
            .build();
        assert_eq!(
            code.snapshot(),
            vec![
                unit(Opcode::ExtendedArg as u8, 0x01),
                unit(Opcode::LoadConst as u8, 0x02)
            ]
        );
        assert_eq!(code.line_at(1), Some(3));
    }
}
