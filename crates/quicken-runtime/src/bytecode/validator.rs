//! Bytecode validator: static analysis at the loader boundary
//!
//! Performs five checks:
//! 1. **Decode pass**: every instruction decodes, and every opcode is an
//!    assigned BASE opcode. Specialized and instrumented opcodes only come
//!    from runtime rewriting and are rejected in input.
//! 2. **Jump targets**: every relative jump lands inside the code object on
//!    an instruction start (the first `EXTENDED_ARG` prefix, if any).
//! 3. **Operand refs**: constant, global-name and local indices are in range.
//! 4. **Stack depth**: a worklist walk over every control-flow path using the
//!    registry's stack effects detects underflow and inconsistent merges, and
//!    reports the maximum depth.
//! 5. **Terminator**: no reachable path runs off the end of the code.
//!
//! The validator is advisory: the VM does not require it, and it collects
//! every error instead of stopping at the first.

use super::{decode_slice, CodeObject};
use crate::error::DecodeError;
use crate::opcode::{JumpDirection, OpClass, Opcode, OpcodeRegistry};
use std::collections::HashMap;
use std::fmt;

// ============================================================================
// Public API
// ============================================================================

/// A validation error with the unit offset where it was detected.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ValidationError {
    /// Unit offset of the offending instruction's opcode.
    pub offset: usize,
    pub kind: ValidationErrorKind,
}

impl fmt::Display for ValidationError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "offset {:#06x}: {}", self.offset, self.kind)
    }
}

impl std::error::Error for ValidationError {}

/// Kinds of errors the validator can detect.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ValidationErrorKind {
    /// The instruction stream itself is malformed.
    Decode(DecodeError),
    /// A reserved or unassigned opcode value.
    UnknownOpcode(u8),
    /// A specialized or instrumented opcode in compiler output.
    NotBaseOpcode { name: &'static str },
    JumpOutOfBounds { target: usize, len: usize },
    /// A jump target that is not the first unit of an instruction.
    JumpMisaligned { target: usize },
    IndexOutOfRange {
        what: &'static str,
        index: usize,
        size: usize,
    },
    StackUnderflow { op: &'static str, depth: u32 },
    /// Two paths reach the same instruction with different stack depths.
    InconsistentDepth { expected: u32, found: u32 },
    /// A reachable path falls off the end of the code.
    MissingTerminator,
}

impl fmt::Display for ValidationErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Decode(err) => write!(f, "{}", err),
            Self::UnknownOpcode(b) => write!(f, "unknown opcode {:#04x}", b),
            Self::NotBaseOpcode { name } => {
                write!(f, "{} is produced at runtime and cannot appear in input", name)
            }
            Self::JumpOutOfBounds { target, len } => {
                write!(f, "jump target {} is out of bounds (len={})", target, len)
            }
            Self::JumpMisaligned { target } => {
                write!(
                    f,
                    "jump target {} does not align to an instruction start",
                    target
                )
            }
            Self::IndexOutOfRange { what, index, size } => {
                write!(f, "{} index {} out of range (size={})", what, index, size)
            }
            Self::StackUnderflow { op, depth } => {
                write!(f, "stack underflow in {}: depth before = {}", op, depth)
            }
            Self::InconsistentDepth { expected, found } => {
                write!(
                    f,
                    "stack depth {} conflicts with depth {} from another path",
                    found, expected
                )
            }
            Self::MissingTerminator => write!(f, "execution can run past the last instruction"),
        }
    }
}

/// Facts gathered about valid code.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ValidationReport {
    /// Deepest value stack any path reaches.
    pub max_stack_depth: u32,
    /// Logical instructions (prefixes folded).
    pub instructions: usize,
    /// Instructions reachable from the entry.
    pub reachable: usize,
}

/// Validate the live units of `code`, collecting all errors found.
///
/// Nested code objects among the constants are not visited; validate them
/// separately.
pub fn validate(code: &CodeObject) -> Result<ValidationReport, Vec<ValidationError>> {
    let units = code.snapshot();
    let mut errors = Vec::new();

    // Pass 1: decode
    let decoded = decode_instructions(&units, &mut errors);
    let starts: HashMap<usize, usize> = decoded
        .iter()
        .enumerate()
        .map(|(index, instr)| (instr.start, index))
        .collect();

    // Pass 2: jump targets
    check_jump_targets(units.len(), &decoded, &starts, &mut errors);

    // Pass 3: constant, name and local references
    check_operand_refs(code, &decoded, &mut errors);

    // Pass 4: stack depth (also finds paths that run off the end)
    let depth = check_stack_depth(units.len(), &decoded, &starts, &mut errors);

    // Pass 5: termination
    check_terminator(&decoded, &mut errors);

    if errors.is_empty() {
        Ok(ValidationReport {
            max_stack_depth: depth.max,
            instructions: decoded.len(),
            reachable: depth.reachable,
        })
    } else {
        errors.sort_by_key(|err| err.offset);
        Err(errors)
    }
}

// ============================================================================
// Internal decoded instruction
// ============================================================================

#[derive(Debug, Clone, Copy)]
struct DecodedInstruction {
    start: usize,
    site: usize,
    next: usize,
    /// `None` when the opcode was rejected (an error was already emitted).
    opcode: Option<Opcode>,
    arg: u32,
}

impl DecodedInstruction {
    /// Where a taken jump goes, if this is a jump and the target is computable.
    fn jump_target(&self) -> Option<Result<usize, ()>> {
        let op = self.opcode?;
        Some(match op.jump()? {
            JumpDirection::Forward => Ok(self.next.saturating_add(self.arg as usize)),
            JumpDirection::Backward => self.next.checked_sub(self.arg as usize).ok_or(()),
        })
    }
}

// ============================================================================
// Pass 1: decode
// ============================================================================

fn decode_instructions(units: &[u16], errors: &mut Vec<ValidationError>) -> Vec<DecodedInstruction> {
    let registry = OpcodeRegistry::global();
    let mut decoded = Vec::new();
    let mut offset = 0;

    while offset < units.len() {
        let instr = match decode_slice(units, offset) {
            Ok(instr) => instr,
            Err(err) => {
                errors.push(ValidationError {
                    offset: err.offset(),
                    kind: ValidationErrorKind::Decode(err),
                });
                break;
            }
        };

        let info = registry.info(instr.op);
        let opcode = match info.class {
            OpClass::Base => info.opcode(),
            OpClass::Reserved => {
                errors.push(ValidationError {
                    offset: instr.site,
                    kind: ValidationErrorKind::UnknownOpcode(instr.op),
                });
                None
            }
            OpClass::Specialized | OpClass::Instrumented => {
                errors.push(ValidationError {
                    offset: instr.site,
                    kind: ValidationErrorKind::NotBaseOpcode { name: info.name },
                });
                None
            }
        };

        decoded.push(DecodedInstruction {
            start: instr.start,
            site: instr.site,
            next: instr.next,
            opcode,
            arg: instr.arg,
        });
        offset = instr.next;
    }

    decoded
}

// ============================================================================
// Pass 2: jump targets
// ============================================================================

fn check_jump_targets(
    len: usize,
    decoded: &[DecodedInstruction],
    starts: &HashMap<usize, usize>,
    errors: &mut Vec<ValidationError>,
) {
    for instr in decoded {
        let Some(target) = instr.jump_target() else {
            continue;
        };
        let kind = match target {
            Err(()) => Some(ValidationErrorKind::JumpOutOfBounds { target: 0, len }),
            Ok(target) if target >= len => {
                Some(ValidationErrorKind::JumpOutOfBounds { target, len })
            }
            Ok(target) if !starts.contains_key(&target) => {
                Some(ValidationErrorKind::JumpMisaligned { target })
            }
            Ok(_) => None,
        };
        if let Some(kind) = kind {
            errors.push(ValidationError {
                offset: instr.site,
                kind,
            });
        }
    }
}

// ============================================================================
// Pass 3: operand references
// ============================================================================

fn check_operand_refs(
    code: &CodeObject,
    decoded: &[DecodedInstruction],
    errors: &mut Vec<ValidationError>,
) {
    use Opcode::*;

    let constants = code.constants.len();
    let names = code.names.len();
    let locals = code.local_count as usize;

    for instr in decoded {
        let Some(op) = instr.opcode else {
            continue;
        };
        let arg = instr.arg as usize;
        let refs: &[(&'static str, usize, usize)] = match op {
            LoadConst | ReturnConst => &[("constant", arg, constants)],
            LoadFast | LoadFastCheck | LoadFastAndClear | StoreFast | DeleteFast => {
                &[("local", arg, locals)]
            }
            LoadFastLoadFast | StoreFastLoadFast | StoreFastStoreFast => {
                &[("local", arg >> 4, locals), ("local", arg & 0xF, locals)]
            }
            LoadGlobal => &[("name", arg >> 1, names)],
            StoreGlobal | DeleteGlobal | LoadName | StoreName | DeleteName => {
                &[("name", arg, names)]
            }
            _ => &[],
        };
        for &(what, index, size) in refs {
            if index >= size {
                errors.push(ValidationError {
                    offset: instr.site,
                    kind: ValidationErrorKind::IndexOutOfRange { what, index, size },
                });
            }
        }
    }
}

// ============================================================================
// Pass 4: stack depth
// ============================================================================

struct DepthSummary {
    max: u32,
    reachable: usize,
}

/// Successor edges of an instruction with `after` values on the stack once it
/// has run. `FOR_ITER` leaves the loop with its iterator popped, past the
/// `END_FOR` its operand points at.
fn successors(instr: &DecodedInstruction, op: Opcode, after: u32) -> Vec<(usize, u32)> {
    let mut out = Vec::with_capacity(2);
    if !op.is_terminator() {
        out.push((instr.next, after));
    }
    match (op, instr.jump_target()) {
        (Opcode::ForIter, Some(Ok(target))) => {
            out.push((target.saturating_add(1), after.saturating_sub(2)));
        }
        (_, Some(Ok(target))) => out.push((target, after)),
        _ => {}
    }
    out
}

fn check_stack_depth(
    len: usize,
    decoded: &[DecodedInstruction],
    starts: &HashMap<usize, usize>,
    errors: &mut Vec<ValidationError>,
) -> DepthSummary {
    let registry = OpcodeRegistry::global();
    let mut depths: Vec<Option<u32>> = vec![None; decoded.len()];
    let mut summary = DepthSummary {
        max: 0,
        reachable: 0,
    };
    if decoded.is_empty() {
        return summary;
    }

    depths[0] = Some(0);
    let mut worklist = vec![0usize];

    while let Some(index) = worklist.pop() {
        let instr = &decoded[index];
        let Some(depth) = depths[index] else {
            continue;
        };
        summary.reachable += 1;
        let Some(op) = instr.opcode else {
            continue;
        };
        let Some((pops, pushes)) = registry.stack_effect(op as u8, instr.arg) else {
            continue;
        };
        if depth < pops {
            errors.push(ValidationError {
                offset: instr.site,
                kind: ValidationErrorKind::StackUnderflow {
                    op: op.name(),
                    depth,
                },
            });
            continue;
        }
        let after = depth - pops + pushes;
        summary.max = summary.max.max(after);

        for (target, target_depth) in successors(instr, op, after) {
            if target >= len {
                // Out-of-range jumps were reported by pass 2.
                if target == instr.next {
                    errors.push(ValidationError {
                        offset: instr.site,
                        kind: ValidationErrorKind::MissingTerminator,
                    });
                }
                continue;
            }
            let Some(&next_index) = starts.get(&target) else {
                continue;
            };
            match depths[next_index] {
                None => {
                    depths[next_index] = Some(target_depth);
                    worklist.push(next_index);
                }
                Some(expected) if expected != target_depth => {
                    errors.push(ValidationError {
                        offset: decoded[next_index].site,
                        kind: ValidationErrorKind::InconsistentDepth {
                            expected,
                            found: target_depth,
                        },
                    });
                }
                Some(_) => {}
            }
        }
    }

    summary
}

// ============================================================================
// Pass 5: termination
// ============================================================================

fn check_terminator(decoded: &[DecodedInstruction], errors: &mut Vec<ValidationError>) {
    if decoded.is_empty() {
        errors.push(ValidationError {
            offset: 0,
            kind: ValidationErrorKind::MissingTerminator,
        });
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bytecode::unit;
    use crate::value::Value;
    use pretty_assertions::assert_eq;
    use std::sync::Arc;

    fn kinds(code: &Arc<CodeObject>) -> Vec<ValidationErrorKind> {
        validate(code)
            .unwrap_err()
            .into_iter()
            .map(|err| err.kind)
            .collect()
    }

    #[test]
    fn test_valid_arithmetic() {
        let code = CodeObject::builder("main")
            .constant(1i64)
            .op(Opcode::Resume, 0)
            .op(Opcode::LoadConst, 0)
            .op(Opcode::LoadConst, 0)
            .op(Opcode::BinaryOp, 0)
            .op(Opcode::ReturnValue, 0)
            .build();
        let report = validate(&code).unwrap();
        assert_eq!(report.max_stack_depth, 2);
        assert_eq!(report.instructions, 5);
        assert_eq!(report.reachable, 5);
    }

    #[test]
    fn test_for_loop_depths() {
        let code = CodeObject::builder("main")
            .locals(1)
            .constant(Value::tuple(vec![Value::Int(1)]))
            .op(Opcode::LoadConst, 0)
            .op(Opcode::GetIter, 0)
            .op(Opcode::ForIter, 2)
            .op(Opcode::StoreFast, 0)
            .op(Opcode::JumpBackward, 3)
            .op(Opcode::EndFor, 0)
            .op(Opcode::ReturnConst, 0)
            .build();
        let report = validate(&code).unwrap();
        assert_eq!(report.max_stack_depth, 2);
        // END_FOR is only a landing pad
        assert_eq!(report.reachable, 6);
    }

    #[test]
    fn test_unknown_and_runtime_only_opcodes() {
        let code = CodeObject::builder("main")
            .raw(&[unit(255, 0), unit(Opcode::BinaryOpAddInt as u8, 0)])
            .op(Opcode::ReturnConst, 0)
            .constant(Value::None)
            .build();
        assert_eq!(
            kinds(&code),
            vec![
                ValidationErrorKind::UnknownOpcode(255),
                ValidationErrorKind::NotBaseOpcode {
                    name: "BINARY_OP_ADD_INT"
                },
            ]
        );
    }

    #[test]
    fn test_jump_out_of_bounds_and_misaligned() {
        let code = CodeObject::builder("main")
            .constant(Value::None)
            .op(Opcode::JumpForward, 9)
            .op(Opcode::LoadConst, 0x100)
            .op(Opcode::ReturnConst, 0)
            .build();
        let errors = validate(&code).unwrap_err();
        assert!(errors.contains(&ValidationError {
            offset: 0,
            kind: ValidationErrorKind::JumpOutOfBounds { target: 10, len: 4 }
        }));

        let misaligned = CodeObject::builder("main")
            .constant(Value::None)
            .op(Opcode::JumpForward, 1)
            .op(Opcode::LoadConst, 0x100)
            .op(Opcode::ReturnConst, 0)
            .build();
        assert!(kinds(&misaligned).contains(&ValidationErrorKind::JumpMisaligned { target: 2 }));
    }

    #[test]
    fn test_operand_references() {
        let code = CodeObject::builder("main")
            .locals(1)
            .op(Opcode::LoadConst, 3)
            .op(Opcode::LoadFastLoadFast, 0x02)
            .op(Opcode::LoadGlobal, 1)
            .op(Opcode::ReturnValue, 0)
            .build();
        assert_eq!(
            kinds(&code)
                .into_iter()
                .filter(|kind| matches!(kind, ValidationErrorKind::IndexOutOfRange { .. }))
                .collect::<Vec<_>>(),
            vec![
                ValidationErrorKind::IndexOutOfRange {
                    what: "constant",
                    index: 3,
                    size: 0
                },
                ValidationErrorKind::IndexOutOfRange {
                    what: "local",
                    index: 2,
                    size: 1
                },
                ValidationErrorKind::IndexOutOfRange {
                    what: "name",
                    index: 0,
                    size: 0
                },
            ]
        );
    }

    #[test]
    fn test_stack_underflow() {
        let code = CodeObject::builder("main")
            .constant(1i64)
            .op(Opcode::LoadConst, 0)
            .op(Opcode::BinaryOp, 0)
            .op(Opcode::ReturnValue, 0)
            .build();
        assert_eq!(
            kinds(&code),
            vec![ValidationErrorKind::StackUnderflow {
                op: "BINARY_OP",
                depth: 1
            }]
        );
    }

    #[test]
    fn test_inconsistent_merge() {
        let balanced = CodeObject::builder("main")
            .locals(1)
            .constant(1i64)
            .op(Opcode::LoadFast, 0)
            .op(Opcode::PopJumpIfFalse, 2)
            .op(Opcode::LoadConst, 0)
            .op(Opcode::PopTop, 0)
            .op(Opcode::ReturnConst, 0)
            .build();
        assert!(validate(&balanced).is_ok());

        // the fall-through path reaches the join with one extra value
        let bad = CodeObject::builder("main")
            .locals(1)
            .constant(1i64)
            .op(Opcode::LoadFast, 0)
            .op(Opcode::LoadFast, 0)
            .op(Opcode::PopJumpIfFalse, 1)
            .op(Opcode::LoadConst, 0)
            .op(Opcode::ReturnValue, 0)
            .build();
        assert_eq!(
            validate(&bad).unwrap_err(),
            vec![ValidationError {
                offset: 4,
                kind: ValidationErrorKind::InconsistentDepth {
                    expected: 1,
                    found: 2
                }
            }]
        );
    }

    #[test]
    fn test_missing_terminator() {
        let code = CodeObject::builder("main").op(Opcode::Nop, 0).build();
        assert_eq!(kinds(&code), vec![ValidationErrorKind::MissingTerminator]);

        let empty = CodeObject::builder("main").build();
        assert_eq!(kinds(&empty), vec![ValidationErrorKind::MissingTerminator]);
    }

    #[test]
    fn test_dangling_extended_arg() {
        let code = CodeObject::builder("main")
            .raw(&[unit(Opcode::ExtendedArg as u8, 1)])
            .build();
        assert_eq!(
            kinds(&code)[0],
            ValidationErrorKind::Decode(DecodeError::DanglingExtendedArg { offset: 0 })
        );
    }

    #[test]
    fn test_error_display() {
        let err = ValidationError {
            offset: 12,
            kind: ValidationErrorKind::UnknownOpcode(0xff),
        };
        assert_eq!(err.to_string(), "offset 0x000c: unknown opcode 0xff");
    }
}
