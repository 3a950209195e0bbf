//! Layer placement
//!
//! A site can carry up to three instrumentation layers. From the outside in:
//! `INSTRUMENTED_LINE`, `INSTRUMENTED_INSTRUCTION`, the opcode's event
//! counterpart, and finally the original opcode. The unit holds the
//! outermost layer; each layer's handler fires its hooks and then runs the
//! next layer down.

use super::Events;
use crate::bytecode::{CodeObject, Layers};
use crate::opcode::{Opcode, OpcodeRegistry};

/// Layers a site needs given the events active there.
pub(crate) fn layers_for(original: u8, active: Events, starts_line: bool) -> Layers {
    let mut layers = Layers::empty();
    if active.is_empty() {
        return layers;
    }
    let registry = OpcodeRegistry::global();
    let base = registry.info(original).base.unwrap_or(original);
    if let Some(counterpart) = registry.counterpart(base) {
        if registry.info(counterpart).events.intersects(active) {
            layers |= Layers::EVENT;
        }
    }
    if active.contains(Events::INSTRUCTION) {
        layers |= Layers::INSTRUCTION;
    }
    if active.contains(Events::LINE) && starts_line {
        layers |= Layers::LINE;
    }
    layers
}

/// Event counterpart for the original opcode of a site, if it has one.
pub(crate) fn counterpart_of(original: u8) -> Option<u8> {
    let registry = OpcodeRegistry::global();
    registry.counterpart(registry.info(original).base.unwrap_or(original))
}

/// Opcode the unit holds for `layers`.
pub(crate) fn outermost(original: u8, layers: Layers) -> u8 {
    if layers.contains(Layers::LINE) {
        Opcode::InstrumentedLine as u8
    } else if layers.contains(Layers::INSTRUCTION) {
        Opcode::InstrumentedInstruction as u8
    } else if layers.contains(Layers::EVENT) {
        counterpart_of(original).unwrap_or(original)
    } else {
        original
    }
}

/// Opcode to run beneath the layer `current`.
pub(crate) fn inner(original: u8, layers: Layers, current: Layers) -> u8 {
    let below = if current == Layers::LINE {
        layers & (Layers::INSTRUCTION | Layers::EVENT)
    } else if current == Layers::INSTRUCTION {
        layers & Layers::EVENT
    } else {
        Layers::empty()
    };
    outermost(original, below)
}

/// Re-place layers on every instruction of `code`. `site_events` gives the
/// events active at an opcode unit. Returns the number of instrumented sites.
pub(crate) fn apply(code: &CodeObject, site_events: impl Fn(usize) -> Events) -> usize {
    let mut instrumented = 0;
    let mut start = 0;
    let mut previous_line = None;
    while start < code.len() {
        let Ok(decoded) = code.fetch(start) else {
            break;
        };
        let line = code.line_at(decoded.site);
        let starts_line = line.is_some() && line != previous_line;
        if line.is_some() {
            previous_line = line;
        }
        let active = site_events(decoded.site);
        if code.set_layers(
            decoded.site,
            |original| layers_for(original, active, starts_line),
            outermost,
        ) {
            instrumented += 1;
        }
        start = decoded.next;
    }
    instrumented
}
