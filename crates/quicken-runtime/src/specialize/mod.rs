//! Specialization engine
//!
//! Each instruction site cycles between two states:
//! - **generic**: the base opcode runs its full handler and reports the
//!   variant its operands would qualify for. `warmup` consecutive reports of
//!   the same variant rewrite the site to that variant.
//! - **specialized**: the variant's handler re-checks its guard. On a miss it
//!   rewrites the site back to the base opcode, runs the generic handler for
//!   this execution, and puts the slot into a cooldown that grows with every
//!   miss (exponential backoff).
//!
//! Rewrites go through [`CodeObject::rewrite`], a compare-and-swap on the
//! code unit, so concurrent executions of the same code stay consistent.

mod families;
mod stats;

pub use families::{family, guard_of, select, Family, Guard, Variant, FAMILIES};
pub use stats::{OpcodeStats, SpecializationStats, StatsSnapshot};

use crate::bytecode::CodeObject;
use crate::opcode::Opcode;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;

/// Tuning knobs for the engine.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SpecializationConfig {
    pub enabled: bool,
    /// Consecutive matching observations before a site is rewritten.
    pub warmup: u16,
    /// Observations skipped after the first miss; doubled per later miss.
    pub cooldown: u16,
    /// Cap on the backoff exponent.
    pub max_backoff: u8,
}

impl Default for SpecializationConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            warmup: 16,
            cooldown: 52,
            max_backoff: 12,
        }
    }
}

const COUNTER_SHIFT: u32 = 8;
const BACKOFF_SHIFT: u32 = 24;
const BACKOFF_MASK: u32 = 0xF;
const COOLING_BIT: u32 = 1 << 28;

/// Unpacked view of an [`AdaptiveSlot`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct SlotState {
    /// Variant being counted towards; `0` when none.
    pub candidate: u8,
    /// Hit count while warming, remaining observations while cooling.
    pub counter: u16,
    pub backoff: u8,
    pub cooling: bool,
}

impl SlotState {
    fn pack(self) -> u32 {
        let mut word = self.candidate as u32
            | (self.counter as u32) << COUNTER_SHIFT
            | (self.backoff as u32 & BACKOFF_MASK) << BACKOFF_SHIFT;
        if self.cooling {
            word |= COOLING_BIT;
        }
        word
    }

    fn unpack(word: u32) -> Self {
        Self {
            candidate: word as u8,
            counter: (word >> COUNTER_SHIFT) as u16,
            backoff: ((word >> BACKOFF_SHIFT) & BACKOFF_MASK) as u8,
            cooling: word & COOLING_BIT != 0,
        }
    }

    /// One generic execution. Returns the variant to promote to, if any.
    fn observe(self, candidate: Option<u8>, config: &SpecializationConfig) -> (Self, Option<u8>) {
        if self.cooling {
            let next = if self.counter > 1 {
                Self {
                    counter: self.counter - 1,
                    ..self
                }
            } else {
                Self {
                    candidate: 0,
                    counter: 0,
                    cooling: false,
                    ..self
                }
            };
            return (next, None);
        }

        let Some(candidate) = candidate else {
            return (
                Self {
                    candidate: 0,
                    counter: 0,
                    ..self
                },
                None,
            );
        };

        let counter = if self.candidate == candidate {
            self.counter.saturating_add(1)
        } else {
            1
        };
        if counter >= config.warmup.max(1) {
            let next = Self {
                candidate: 0,
                counter: 0,
                ..self
            };
            (next, Some(candidate))
        } else {
            (
                Self {
                    candidate,
                    counter,
                    ..self
                },
                None,
            )
        }
    }

    fn miss(self, config: &SpecializationConfig) -> Self {
        let length = ((config.cooldown as u32) << self.backoff).min(u16::MAX as u32) as u16;
        Self {
            candidate: 0,
            counter: length,
            backoff: (self.backoff + 1).min(config.max_backoff.min(BACKOFF_MASK as u8)),
            cooling: length > 0,
        }
    }
}

/// Per-site specialization counters, packed into one atomic word.
#[derive(Debug, Default)]
pub struct AdaptiveSlot(AtomicU32);

impl AdaptiveSlot {
    pub const fn new() -> Self {
        Self(AtomicU32::new(0))
    }

    pub fn state(&self) -> SlotState {
        SlotState::unpack(self.0.load(Ordering::Relaxed))
    }

    fn update(&self, f: impl Fn(SlotState) -> (SlotState, Option<u8>)) -> Option<u8> {
        let mut current = self.0.load(Ordering::Relaxed);
        loop {
            let (next, promoted) = f(SlotState::unpack(current));
            let packed = next.pack();
            if packed == current {
                return promoted;
            }
            match self
                .0
                .compare_exchange_weak(current, packed, Ordering::AcqRel, Ordering::Relaxed)
            {
                Ok(_) => return promoted,
                Err(actual) => current = actual,
            }
        }
    }

    pub(crate) fn observe(&self, candidate: Option<u8>, config: &SpecializationConfig) -> Option<u8> {
        self.update(|state| state.observe(candidate, config))
    }

    pub(crate) fn miss(&self, config: &SpecializationConfig) -> SlotState {
        self.update(|state| (state.miss(config), None));
        self.state()
    }
}

/// Drives promotion and de-optimization for one VM.
#[derive(Debug, Clone)]
pub struct Specializer {
    config: SpecializationConfig,
    stats: Arc<SpecializationStats>,
}

impl Specializer {
    pub fn new(config: SpecializationConfig, stats: Arc<SpecializationStats>) -> Self {
        Self { config, stats }
    }

    pub fn config(&self) -> &SpecializationConfig {
        &self.config
    }

    pub fn stats(&self) -> &Arc<SpecializationStats> {
        &self.stats
    }

    pub fn is_enabled(&self) -> bool {
        self.config.enabled
    }

    /// Record one generic execution of `base` at `site`; rewrites the site
    /// once the same variant has been seen `warmup` times in a row.
    pub(crate) fn observe(
        &self,
        code: &CodeObject,
        site: usize,
        base: Opcode,
        candidate: Option<Opcode>,
    ) -> Option<Opcode> {
        if !self.config.enabled {
            return None;
        }
        let slot = code.adaptive(site)?;
        let promoted = slot.observe(candidate.map(|op| op as u8), &self.config)?;
        let variant = Opcode::from_u8(promoted)?;
        if !code.rewrite(site, base as u8, promoted) {
            return None;
        }
        self.stats.record_promotion(variant);
        tracing::debug!(
            target: "quicken::specialize",
            code = %code.name,
            site,
            from = base.name(),
            to = variant.name(),
            "promoted instruction"
        );
        Some(variant)
    }

    /// Guard miss in `variant` at `site`: rewrite back to the base opcode and
    /// start a cooldown.
    pub(crate) fn deoptimize(&self, code: &CodeObject, site: usize, variant: Opcode) {
        let base = variant.base();
        let rewritten = code.rewrite(site, variant as u8, base as u8);
        let cooldown = code
            .adaptive(site)
            .map(|slot| slot.miss(&self.config).counter)
            .unwrap_or(0);
        self.stats.record_deopt(variant);
        tracing::debug!(
            target: "quicken::specialize",
            code = %code.name,
            site,
            from = variant.name(),
            to = base.name(),
            cooldown,
            rewritten,
            "de-optimized instruction"
        );
    }
}
