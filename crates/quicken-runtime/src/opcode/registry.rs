//! Opcode registry
//!
//! The registry is built once from a definition list and is immutable after
//! construction. Every value in `0..=255` has exactly one [`OpcodeInfo`];
//! values that no definition claims are tagged [`OpClass::Reserved`].

use super::{
    jump_direction, DefKind, JumpDirection, OpClass, Opcode, OpcodeDef, Operand, StackEffect,
    DEFINITIONS, HAVE_ARGUMENT, MIN_INSTRUMENTED_OPCODE,
};
use crate::monitor::{counterpart_events, Events};
use once_cell::sync::Lazy;
use std::collections::HashMap;
use thiserror::Error;

/// Identifies this opcode numbering in serialized bytecode.
pub const MAGIC_NUMBER: u16 = 3551;

const UNKNOWN_NAME: &str = "<unknown>";

static GLOBAL: Lazy<OpcodeRegistry> = Lazy::new(|| {
    RegistryBuilder::standard()
        .build()
        .unwrap_or_else(|err| panic!("standard opcode table is inconsistent: {err}"))
});

/// Errors raised while building a registry. All of them are fatal at startup.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RegistryError {
    #[error("opcode {name} has value {value}, outside 0..=255")]
    OutOfRange { name: &'static str, value: u16 },

    #[error("opcode value {value} is assigned to both {first} and {second}")]
    DuplicateValue {
        value: u8,
        first: &'static str,
        second: &'static str,
    },

    #[error("opcode name {name} is registered twice")]
    DuplicateName { name: &'static str },

    #[error("{name} refines {base}, which is not a registered base opcode")]
    DanglingBase {
        name: &'static str,
        base: &'static str,
    },

    #[error("{name} declares a stack effect that differs from its base {base}")]
    StackEffectMismatch {
        name: &'static str,
        base: &'static str,
    },

    #[error("base opcode {name} has no stack effect")]
    MissingStackEffect { name: &'static str },

    #[error("{base} has two instrumented counterparts: {first} and {second}")]
    DuplicateCounterpart {
        base: &'static str,
        first: &'static str,
        second: &'static str,
    },

    #[error("instrumented opcode {name} has no handler")]
    MissingHandler { name: &'static str },
}

/// Everything the VM knows about one opcode value.
#[derive(Debug, Clone)]
pub struct OpcodeInfo {
    pub value: u8,
    pub name: &'static str,
    pub class: OpClass,
    /// Base opcode for specialized and instrumented opcodes.
    pub base: Option<u8>,
    pub operand: Operand,
    /// `None` for reserved values and for wrappers, whose effect is the wrapped opcode's.
    pub effect: Option<StackEffect>,
    pub jump: Option<JumpDirection>,
    /// Monitoring events raised by this opcode (instrumented opcodes only).
    pub events: Events,
    /// Instrumented opcode that wraps whatever opcode the site originally held.
    pub wrapper: bool,
}

impl OpcodeInfo {
    fn unassigned(value: u8) -> Self {
        Self {
            value,
            name: UNKNOWN_NAME,
            class: OpClass::Reserved,
            base: None,
            operand: Operand::None,
            effect: None,
            jump: None,
            events: Events::empty(),
            wrapper: false,
        }
    }

    /// The typed opcode, if this value is assigned in the standard numbering.
    pub fn opcode(&self) -> Option<Opcode> {
        if self.class == OpClass::Reserved {
            return None;
        }
        Opcode::from_u8(self.value)
    }
}

/// Immutable value <-> name <-> class mapping for all 256 opcode values.
#[derive(Debug)]
pub struct OpcodeRegistry {
    infos: Box<[OpcodeInfo]>,
    names: HashMap<&'static str, u8>,
    counterparts: [Option<u8>; 256],
}

impl OpcodeRegistry {
    /// The process-wide registry for the standard numbering.
    pub fn global() -> &'static OpcodeRegistry {
        &GLOBAL
    }

    #[inline]
    pub fn info(&self, value: u8) -> &OpcodeInfo {
        &self.infos[value as usize]
    }

    pub fn lookup(&self, name: &str) -> Option<&OpcodeInfo> {
        self.names.get(name).map(|&value| self.info(value))
    }

    pub fn value_of(&self, name: &str) -> Option<u8> {
        self.names.get(name).copied()
    }

    /// All 256 entries in numeric order.
    pub fn iter(&self) -> impl Iterator<Item = &OpcodeInfo> {
        self.infos.iter()
    }

    pub fn is_reserved(&self, value: u8) -> bool {
        self.info(value).class == OpClass::Reserved
    }

    /// INSTRUMENTED_ counterpart of a base opcode.
    pub fn counterpart(&self, base: u8) -> Option<u8> {
        self.counterparts[base as usize]
    }

    /// `(pops, pushes)` for a value and operand. `None` for reserved values and wrappers.
    pub fn stack_effect(&self, value: u8, oparg: u32) -> Option<(u32, u32)> {
        self.info(value).effect.map(|effect| effect.eval(oparg))
    }

    /// Specialized opcodes refining `base`, in numeric order.
    pub fn specializations_of(&self, base: u8) -> impl Iterator<Item = &OpcodeInfo> {
        self.infos
            .iter()
            .filter(move |info| info.class == OpClass::Specialized && info.base == Some(base))
    }

    pub fn count(&self, class: OpClass) -> usize {
        self.infos.iter().filter(|info| info.class == class).count()
    }
}

/// Builds an [`OpcodeRegistry`] from a definition list, checking every
/// construction invariant.
#[derive(Debug, Clone, Default)]
pub struct RegistryBuilder {
    defs: Vec<OpcodeDef>,
}

impl RegistryBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Builder pre-loaded with the standard definitions.
    pub fn standard() -> Self {
        Self {
            defs: DEFINITIONS.to_vec(),
        }
    }

    pub fn register(mut self, def: OpcodeDef) -> Self {
        self.defs.push(def);
        self
    }

    pub fn build(self) -> Result<OpcodeRegistry, RegistryError> {
        let mut slots: Vec<Option<&OpcodeDef>> = vec![None; 256];
        let mut names = HashMap::with_capacity(self.defs.len());

        for def in &self.defs {
            let value = u8::try_from(def.value).map_err(|_| RegistryError::OutOfRange {
                name: def.name,
                value: def.value,
            })?;
            if let Some(first) = slots[value as usize] {
                return Err(RegistryError::DuplicateValue {
                    value,
                    first: first.name,
                    second: def.name,
                });
            }
            if names.insert(def.name, value).is_some() {
                return Err(RegistryError::DuplicateName { name: def.name });
            }
            slots[value as usize] = Some(def);
        }

        let mut infos = Vec::with_capacity(256);
        let mut counterparts: [Option<u8>; 256] = [None; 256];

        for value in 0..=255u8 {
            let info = match slots[value as usize] {
                None => OpcodeInfo::unassigned(value),
                Some(def) => resolve(value, def, &slots)?,
            };

            if info.class == OpClass::Instrumented {
                if let Some(base) = info.base {
                    if let Some(first) = counterparts[base as usize] {
                        return Err(RegistryError::DuplicateCounterpart {
                            base: name_at(&slots, base),
                            first: name_at(&slots, first),
                            second: info.name,
                        });
                    }
                    counterparts[base as usize] = Some(value);
                }
            }
            infos.push(info);
        }

        Ok(OpcodeRegistry {
            infos: infos.into_boxed_slice(),
            names,
            counterparts,
        })
    }
}

fn name_at(slots: &[Option<&OpcodeDef>], value: u8) -> &'static str {
    slots[value as usize].map_or(UNKNOWN_NAME, |def| def.name)
}

fn resolve(
    value: u8,
    def: &OpcodeDef,
    slots: &[Option<&OpcodeDef>],
) -> Result<OpcodeInfo, RegistryError> {
    let (class, base, wrapper) = match def.kind {
        DefKind::Base => (OpClass::Base, None, false),
        DefKind::Specialized(base) => (OpClass::Specialized, Some(base), false),
        DefKind::Instrumented(base) => (OpClass::Instrumented, Some(base), false),
        DefKind::Wrapper => (OpClass::Instrumented, None, true),
        DefKind::Reserved => (OpClass::Reserved, None, false),
    };

    let base_def = match base {
        Some(base) => Some(
            slots[base as u8 as usize]
                .filter(|candidate| matches!(candidate.kind, DefKind::Base))
                .ok_or(RegistryError::DanglingBase {
                    name: def.name,
                    base: base.name(),
                })?,
        ),
        None => None,
    };

    let effect = match (def.kind, base_def) {
        (DefKind::Base, _) => Some(
            def.effect
                .ok_or(RegistryError::MissingStackEffect { name: def.name })?,
        ),
        (_, Some(base_def)) => {
            let inherited = base_def
                .effect
                .ok_or(RegistryError::MissingStackEffect {
                    name: base_def.name,
                })?;
            if let Some(own) = def.effect {
                if !own.agrees_with(&inherited) {
                    return Err(RegistryError::StackEffectMismatch {
                        name: def.name,
                        base: base_def.name,
                    });
                }
            }
            Some(inherited)
        }
        _ => None,
    };

    let operand = if class == OpClass::Reserved || wrapper {
        Operand::None
    } else {
        operand_kind(base.map_or(value, |base| base as u8))
    };

    let own = Opcode::from_u8(value);
    let jump = own
        .and_then(jump_direction)
        .or_else(|| base.and_then(jump_direction));
    let events = match (class, own) {
        (OpClass::Instrumented, Some(op)) => counterpart_events(op),
        _ => Events::empty(),
    };

    Ok(OpcodeInfo {
        value,
        name: def.name,
        class,
        base: base.map(|base| base as u8),
        operand,
        effect,
        jump,
        events,
        wrapper,
    })
}

fn operand_kind(value: u8) -> Operand {
    if value == Opcode::ExtendedArg as u8 {
        Operand::Prefix
    } else if (HAVE_ARGUMENT..MIN_INSTRUMENTED_OPCODE).contains(&value) {
        Operand::Arg
    } else {
        Operand::None
    }
}
