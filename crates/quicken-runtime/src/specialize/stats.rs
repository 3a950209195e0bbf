//! Specialization statistics
//!
//! Per-opcode counters for promotions, de-optimizations and guard outcomes,
//! plus optional execution counts when profiling is enabled. All counters are
//! relaxed atomics so that handlers on any thread can record without locking.

use crate::opcode::{OpClass, Opcode, OpcodeRegistry};
use serde::Serialize;
use std::fmt::Write as _;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

fn counters() -> Box<[AtomicU64]> {
    (0..256).map(|_| AtomicU64::new(0)).collect()
}

/// Counters shared by every VM that uses the same engine.
#[derive(Debug)]
pub struct SpecializationStats {
    profiling: AtomicBool,
    promotions: Box<[AtomicU64]>,
    deopts: Box<[AtomicU64]>,
    hits: Box<[AtomicU64]>,
    misses: Box<[AtomicU64]>,
    executions: Box<[AtomicU64]>,
    faults: AtomicU64,
}

impl SpecializationStats {
    pub fn new() -> Self {
        Self {
            profiling: AtomicBool::new(false),
            promotions: counters(),
            deopts: counters(),
            hits: counters(),
            misses: counters(),
            executions: counters(),
            faults: AtomicU64::new(0),
        }
    }

    /// Stats with per-opcode execution counting switched on.
    pub fn profiling() -> Self {
        let stats = Self::new();
        stats.enable_profiling();
        stats
    }

    pub fn enable_profiling(&self) {
        self.profiling.store(true, Ordering::Relaxed);
    }

    pub fn disable_profiling(&self) {
        self.profiling.store(false, Ordering::Relaxed);
    }

    #[inline]
    pub fn is_profiling(&self) -> bool {
        self.profiling.load(Ordering::Relaxed)
    }

    pub(crate) fn record_promotion(&self, variant: Opcode) {
        self.promotions[variant as usize].fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_deopt(&self, variant: Opcode) {
        self.deopts[variant as usize].fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub(crate) fn record_hit(&self, variant: Opcode) {
        self.hits[variant as usize].fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_miss(&self, variant: Opcode) {
        self.misses[variant as usize].fetch_add(1, Ordering::Relaxed);
    }

    /// Count one dispatch of `op`. No-op unless profiling.
    #[inline]
    pub(crate) fn record_execution(&self, op: u8) {
        if self.is_profiling() {
            self.executions[op as usize].fetch_add(1, Ordering::Relaxed);
        }
    }

    pub(crate) fn record_fault(&self) {
        self.faults.fetch_add(1, Ordering::Relaxed);
    }

    pub fn promotions(&self, op: Opcode) -> u64 {
        self.promotions[op as usize].load(Ordering::Relaxed)
    }

    pub fn deopts(&self, op: Opcode) -> u64 {
        self.deopts[op as usize].load(Ordering::Relaxed)
    }

    pub fn hits(&self, op: Opcode) -> u64 {
        self.hits[op as usize].load(Ordering::Relaxed)
    }

    pub fn misses(&self, op: Opcode) -> u64 {
        self.misses[op as usize].load(Ordering::Relaxed)
    }

    pub fn executions(&self, op: u8) -> u64 {
        self.executions[op as usize].load(Ordering::Relaxed)
    }

    /// Dispatches that landed on the fault handler.
    pub fn faults(&self) -> u64 {
        self.faults.load(Ordering::Relaxed)
    }

    pub fn reset(&self) {
        for table in [
            &self.promotions,
            &self.deopts,
            &self.hits,
            &self.misses,
            &self.executions,
        ] {
            for counter in table.iter() {
                counter.store(0, Ordering::Relaxed);
            }
        }
        self.faults.store(0, Ordering::Relaxed);
    }

    /// Consistent-enough copy of every non-zero counter, in opcode order.
    pub fn snapshot(&self) -> StatsSnapshot {
        let registry = OpcodeRegistry::global();
        let mut opcodes = Vec::new();
        for info in registry.iter() {
            let i = info.value as usize;
            let entry = OpcodeStats {
                opcode: info.value,
                name: info.name,
                class: info.class,
                promotions: self.promotions[i].load(Ordering::Relaxed),
                deopts: self.deopts[i].load(Ordering::Relaxed),
                hits: self.hits[i].load(Ordering::Relaxed),
                misses: self.misses[i].load(Ordering::Relaxed),
                executions: self.executions[i].load(Ordering::Relaxed),
            };
            if !entry.is_zero() {
                opcodes.push(entry);
            }
        }
        StatsSnapshot {
            profiling: self.is_profiling(),
            faults: self.faults(),
            opcodes,
        }
    }

    /// Human-readable summary.
    pub fn report(&self) -> String {
        self.snapshot().report()
    }

    pub fn to_json(&self) -> serde_json::Result<String> {
        serde_json::to_string_pretty(&self.snapshot())
    }
}

impl Default for SpecializationStats {
    fn default() -> Self {
        Self::new()
    }
}

/// Counters for one opcode value.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct OpcodeStats {
    pub opcode: u8,
    pub name: &'static str,
    pub class: OpClass,
    pub promotions: u64,
    pub deopts: u64,
    pub hits: u64,
    pub misses: u64,
    pub executions: u64,
}

impl OpcodeStats {
    fn is_zero(&self) -> bool {
        self.promotions == 0
            && self.deopts == 0
            && self.hits == 0
            && self.misses == 0
            && self.executions == 0
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct StatsSnapshot {
    pub profiling: bool,
    pub faults: u64,
    pub opcodes: Vec<OpcodeStats>,
}

impl StatsSnapshot {
    pub fn get(&self, op: Opcode) -> Option<&OpcodeStats> {
        self.opcodes.iter().find(|s| s.opcode == op as u8)
    }

    pub fn total_promotions(&self) -> u64 {
        self.opcodes.iter().map(|s| s.promotions).sum()
    }

    pub fn total_deopts(&self) -> u64 {
        self.opcodes.iter().map(|s| s.deopts).sum()
    }

    pub fn total_executions(&self) -> u64 {
        self.opcodes.iter().map(|s| s.executions).sum()
    }

    pub fn report(&self) -> String {
        let mut report = String::from("=== Specialization Report ===\n");
        let _ = writeln!(report, "Promotions: {}", self.total_promotions());
        let _ = writeln!(report, "De-optimizations: {}", self.total_deopts());
        let _ = writeln!(report, "Faults: {}", self.faults);

        let specialized: Vec<_> = self
            .opcodes
            .iter()
            .filter(|s| s.class == OpClass::Specialized)
            .collect();
        if specialized.is_empty() {
            report.push_str("\nNo specialized instructions.\n");
        } else {
            let _ = writeln!(
                report,
                "\n  {:<32} {:>8} {:>8} {:>10} {:>8}",
                "variant", "promote", "deopt", "hits", "misses"
            );
            for s in specialized {
                let _ = writeln!(
                    report,
                    "  {:<32} {:>8} {:>8} {:>10} {:>8}",
                    s.name, s.promotions, s.deopts, s.hits, s.misses
                );
            }
        }

        if self.profiling {
            let total = self.total_executions();
            let _ = writeln!(report, "\nTotal instructions executed: {}", total);
            let mut by_count: Vec<_> = self.opcodes.iter().filter(|s| s.executions > 0).collect();
            by_count.sort_by(|a, b| b.executions.cmp(&a.executions).then(a.opcode.cmp(&b.opcode)));
            for s in by_count {
                let percentage = s.executions as f64 / total as f64 * 100.0;
                let _ = writeln!(
                    report,
                    "  {:<32} {:>10} ({:>6.2}%)",
                    s.name, s.executions, percentage
                );
            }
        }

        report
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_new_is_empty() {
        let stats = SpecializationStats::new();
        assert!(!stats.is_profiling());
        let snapshot = stats.snapshot();
        assert!(snapshot.opcodes.is_empty());
        assert_eq!(snapshot.faults, 0);
    }

    #[test]
    fn test_executions_only_counted_when_profiling() {
        let stats = SpecializationStats::new();
        stats.record_execution(Opcode::Nop as u8);
        assert_eq!(stats.executions(Opcode::Nop as u8), 0);

        stats.enable_profiling();
        stats.record_execution(Opcode::Nop as u8);
        stats.record_execution(Opcode::Nop as u8);
        assert_eq!(stats.executions(Opcode::Nop as u8), 2);
    }

    #[test]
    fn test_snapshot_collects_non_zero_rows() {
        let stats = SpecializationStats::new();
        stats.record_promotion(Opcode::BinaryOpAddInt);
        stats.record_hit(Opcode::BinaryOpAddInt);
        stats.record_hit(Opcode::BinaryOpAddInt);
        stats.record_miss(Opcode::BinaryOpAddInt);
        stats.record_deopt(Opcode::BinaryOpAddInt);
        stats.record_fault();

        let snapshot = stats.snapshot();
        assert_eq!(snapshot.opcodes.len(), 1);
        assert_eq!(
            snapshot.get(Opcode::BinaryOpAddInt),
            Some(&OpcodeStats {
                opcode: 4,
                name: "BINARY_OP_ADD_INT",
                class: OpClass::Specialized,
                promotions: 1,
                deopts: 1,
                hits: 2,
                misses: 1,
                executions: 0,
            })
        );
        assert_eq!(snapshot.faults, 1);
    }

    #[test]
    fn test_reset() {
        let stats = SpecializationStats::profiling();
        stats.record_promotion(Opcode::CompareOpInt);
        stats.record_execution(Opcode::CompareOpInt as u8);
        stats.record_fault();
        stats.reset();
        assert!(stats.snapshot().opcodes.is_empty());
        assert_eq!(stats.faults(), 0);
        assert!(stats.is_profiling());
    }

    #[test]
    fn test_report_lists_variants_and_percentages() {
        let stats = SpecializationStats::profiling();
        stats.record_promotion(Opcode::ToBoolInt);
        stats.record_execution(Opcode::LoadFast as u8);
        stats.record_execution(Opcode::LoadFast as u8);
        stats.record_execution(Opcode::ToBoolInt as u8);

        let report = stats.report();
        assert!(report.contains("Promotions: 1"));
        assert!(report.contains("TO_BOOL_INT"));
        assert!(report.contains("Total instructions executed: 3"));
        assert!(report.contains("66.67%"));
    }

    #[test]
    fn test_report_without_specializations() {
        let report = SpecializationStats::new().report();
        assert!(report.contains("No specialized instructions"));
        assert!(!report.contains("Total instructions executed"));
    }

    #[test]
    fn test_json_export() {
        let stats = SpecializationStats::new();
        stats.record_deopt(Opcode::ForIterRange);
        let json: serde_json::Value = serde_json::from_str(&stats.to_json().unwrap()).unwrap();
        assert_eq!(json["opcodes"][0]["name"], "FOR_ITER_RANGE");
        assert_eq!(json["opcodes"][0]["class"], "specialized");
        assert_eq!(json["opcodes"][0]["deopts"], 1);
    }
}
