//! Specialization families and their guards
//!
//! A family lists the variants of one base opcode. Each variant has a guard
//! (a cheap shape check over the operands the instruction is about to
//! consume) and a specificity. When several guards pass, the variant with the
//! highest specificity wins; equal specificity goes to the variant listed
//! first.
//!
//! The same guard runs twice: once in the generic handler to pick a
//! candidate, and again in the specialized handler before its fast path.

use crate::bytecode::split;
use crate::opcode::Opcode;
use crate::value::{Arity, IterTag, TypeTag, Value};
use crate::vm::ops::arith::nb;
use crate::vm::{Instr, Vm};
use std::sync::Arc;

/// Shape check for one variant.
pub type Guard = fn(&Vm, &Instr) -> bool;

#[derive(Clone, Copy)]
pub struct Variant {
    pub op: Opcode,
    pub specificity: u8,
    pub guard: Guard,
}

impl std::fmt::Debug for Variant {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Variant")
            .field("op", &self.op)
            .field("specificity", &self.specificity)
            .finish()
    }
}

#[derive(Debug)]
pub struct Family {
    pub base: Opcode,
    pub variants: &'static [Variant],
}

const fn variant(op: Opcode, specificity: u8, guard: Guard) -> Variant {
    Variant {
        op,
        specificity,
        guard,
    }
}

pub static FAMILIES: &[Family] = &[
    Family {
        base: Opcode::BinaryOp,
        variants: &[
            variant(Opcode::BinaryOpAddInt, 1, binary_add_int),
            variant(Opcode::BinaryOpSubtractInt, 1, binary_subtract_int),
            variant(Opcode::BinaryOpMultiplyInt, 1, binary_multiply_int),
            variant(Opcode::BinaryOpAddFloat, 1, binary_add_float),
            variant(Opcode::BinaryOpSubtractFloat, 1, binary_subtract_float),
            variant(Opcode::BinaryOpMultiplyFloat, 1, binary_multiply_float),
            variant(Opcode::BinaryOpAddUnicode, 1, binary_add_unicode),
            variant(Opcode::BinaryOpInplaceAddUnicode, 2, binary_inplace_add_unicode),
        ],
    },
    Family {
        base: Opcode::CompareOp,
        variants: &[
            variant(Opcode::CompareOpInt, 1, compare_int),
            variant(Opcode::CompareOpFloat, 1, compare_float),
            variant(Opcode::CompareOpStr, 1, compare_str),
        ],
    },
    Family {
        base: Opcode::ToBool,
        variants: &[
            variant(Opcode::ToBoolBool, 1, to_bool_bool),
            variant(Opcode::ToBoolInt, 1, to_bool_int),
            variant(Opcode::ToBoolList, 1, to_bool_list),
            variant(Opcode::ToBoolNone, 1, to_bool_none),
            variant(Opcode::ToBoolStr, 1, to_bool_str),
            variant(Opcode::ToBoolAlwaysTrue, 1, to_bool_always_true),
        ],
    },
    Family {
        base: Opcode::BinarySubscr,
        variants: &[
            variant(Opcode::BinarySubscrListInt, 1, subscr_list_int),
            variant(Opcode::BinarySubscrTupleInt, 1, subscr_tuple_int),
            variant(Opcode::BinarySubscrStrInt, 1, subscr_str_int),
        ],
    },
    Family {
        base: Opcode::StoreSubscr,
        variants: &[variant(Opcode::StoreSubscrListInt, 1, store_subscr_list_int)],
    },
    Family {
        base: Opcode::UnpackSequence,
        variants: &[
            variant(Opcode::UnpackSequenceTuple, 1, unpack_tuple),
            variant(Opcode::UnpackSequenceList, 1, unpack_list),
            variant(Opcode::UnpackSequenceTwoTuple, 2, unpack_two_tuple),
        ],
    },
    Family {
        base: Opcode::ForIter,
        variants: &[
            variant(Opcode::ForIterList, 1, for_iter_list),
            variant(Opcode::ForIterTuple, 1, for_iter_tuple),
            variant(Opcode::ForIterRange, 1, for_iter_range),
        ],
    },
    Family {
        base: Opcode::Call,
        variants: &[
            variant(Opcode::CallPyExactArgs, 1, call_py_exact_args),
            variant(Opcode::CallNoKwBuiltinFast, 1, call_builtin_fast),
            variant(Opcode::CallNoKwBuiltinO, 2, call_builtin_o),
            variant(Opcode::CallNoKwLen, 3, call_len),
        ],
    },
    Family {
        base: Opcode::LoadGlobal,
        variants: &[
            variant(Opcode::LoadGlobalModule, 1, load_global_module),
            variant(Opcode::LoadGlobalBuiltin, 1, load_global_builtin),
        ],
    },
];

/// Family whose base is `base`.
pub fn family(base: Opcode) -> Option<&'static Family> {
    FAMILIES.iter().find(|family| family.base == base)
}

/// Guard of a specialized opcode.
pub fn guard_of(op: Opcode) -> Option<Guard> {
    FAMILIES
        .iter()
        .flat_map(|family| family.variants.iter())
        .find(|v| v.op == op)
        .map(|v| v.guard)
}

/// Most specific variant whose guard passes; earliest listed on ties.
pub fn select(family: &Family, vm: &Vm, instr: &Instr) -> Option<Opcode> {
    let mut best: Option<&Variant> = None;
    for candidate in family.variants {
        if !(candidate.guard)(vm, instr) {
            continue;
        }
        if best.map_or(true, |b| candidate.specificity > b.specificity) {
            best = Some(candidate);
        }
    }
    best.map(|v| v.op)
}

// ===== BINARY_OP =====

fn operator_is(instr: &Instr, op: u32) -> bool {
    instr.arg == op || instr.arg == op + nb::INPLACE_OFFSET
}

fn both(vm: &Vm, tag: TypeTag) -> bool {
    matches!(
        (vm.peek(1), vm.peek(0)),
        (Some(a), Some(b)) if a.type_tag() == tag && b.type_tag() == tag
    )
}

fn binary_add_int(vm: &Vm, instr: &Instr) -> bool {
    operator_is(instr, nb::ADD) && both(vm, TypeTag::Int)
}

fn binary_subtract_int(vm: &Vm, instr: &Instr) -> bool {
    operator_is(instr, nb::SUBTRACT) && both(vm, TypeTag::Int)
}

fn binary_multiply_int(vm: &Vm, instr: &Instr) -> bool {
    operator_is(instr, nb::MULTIPLY) && both(vm, TypeTag::Int)
}

fn binary_add_float(vm: &Vm, instr: &Instr) -> bool {
    operator_is(instr, nb::ADD) && both(vm, TypeTag::Float)
}

fn binary_subtract_float(vm: &Vm, instr: &Instr) -> bool {
    operator_is(instr, nb::SUBTRACT) && both(vm, TypeTag::Float)
}

fn binary_multiply_float(vm: &Vm, instr: &Instr) -> bool {
    operator_is(instr, nb::MULTIPLY) && both(vm, TypeTag::Float)
}

fn binary_add_unicode(vm: &Vm, instr: &Instr) -> bool {
    operator_is(instr, nb::ADD) && both(vm, TypeTag::Str)
}

/// `s = s + t` / `s += t` where the next instruction stores back into the
/// local that holds the left operand.
fn binary_inplace_add_unicode(vm: &Vm, instr: &Instr) -> bool {
    if !binary_add_unicode(vm, instr) {
        return false;
    }
    let Some((op, arg)) = vm.code().and_then(|code| code.load_unit(instr.next)).map(split)
    else {
        return false;
    };
    if op != Opcode::StoreFast as u8 {
        return false;
    }
    matches!(
        (vm.local(arg as usize), vm.peek(1)),
        (Some(Value::Str(local)), Some(Value::Str(left))) if Arc::ptr_eq(local, left)
    )
}

// ===== COMPARE_OP =====

fn compare_int(vm: &Vm, _instr: &Instr) -> bool {
    both(vm, TypeTag::Int)
}

fn compare_float(vm: &Vm, _instr: &Instr) -> bool {
    both(vm, TypeTag::Float)
}

/// Only equality comparisons have a string fast path.
fn compare_str(vm: &Vm, instr: &Instr) -> bool {
    let cmp = instr.arg >> 5;
    (cmp == 2 || cmp == 3) && both(vm, TypeTag::Str)
}

// ===== TO_BOOL =====

fn top_is(vm: &Vm, tag: TypeTag) -> bool {
    vm.peek(0).map_or(false, |v| v.type_tag() == tag)
}

fn to_bool_bool(vm: &Vm, _instr: &Instr) -> bool {
    top_is(vm, TypeTag::Bool)
}

fn to_bool_int(vm: &Vm, _instr: &Instr) -> bool {
    top_is(vm, TypeTag::Int)
}

fn to_bool_list(vm: &Vm, _instr: &Instr) -> bool {
    top_is(vm, TypeTag::List)
}

fn to_bool_none(vm: &Vm, _instr: &Instr) -> bool {
    top_is(vm, TypeTag::None)
}

fn to_bool_str(vm: &Vm, _instr: &Instr) -> bool {
    top_is(vm, TypeTag::Str)
}

fn to_bool_always_true(vm: &Vm, _instr: &Instr) -> bool {
    matches!(
        vm.peek(0).map(Value::type_tag),
        Some(TypeTag::Function | TypeTag::Builtin | TypeTag::Code | TypeTag::Iter)
    )
}

// ===== BINARY_SUBSCR / STORE_SUBSCR =====

fn index_at(vm: &Vm, depth: usize) -> Option<usize> {
    match vm.peek(depth) {
        Some(Value::Int(n)) => usize::try_from(*n).ok(),
        _ => None,
    }
}

fn subscr_list_int(vm: &Vm, _instr: &Instr) -> bool {
    match (vm.peek(1), index_at(vm, 0)) {
        (Some(Value::List(items)), Some(index)) => index < items.lock().len(),
        _ => false,
    }
}

fn subscr_tuple_int(vm: &Vm, _instr: &Instr) -> bool {
    match (vm.peek(1), index_at(vm, 0)) {
        (Some(Value::Tuple(items)), Some(index)) => index < items.len(),
        _ => false,
    }
}

/// ASCII strings only, so the index is a byte offset.
fn subscr_str_int(vm: &Vm, _instr: &Instr) -> bool {
    match (vm.peek(1), index_at(vm, 0)) {
        (Some(Value::Str(s)), Some(index)) => s.is_ascii() && index < s.len(),
        _ => false,
    }
}

fn store_subscr_list_int(vm: &Vm, _instr: &Instr) -> bool {
    match (vm.peek(1), index_at(vm, 0)) {
        (Some(Value::List(items)), Some(index)) => index < items.lock().len(),
        _ => false,
    }
}

// ===== UNPACK_SEQUENCE =====

fn unpack_tuple(vm: &Vm, instr: &Instr) -> bool {
    matches!(vm.peek(0), Some(Value::Tuple(items)) if items.len() == instr.arg as usize)
}

fn unpack_two_tuple(vm: &Vm, instr: &Instr) -> bool {
    instr.arg == 2 && unpack_tuple(vm, instr)
}

fn unpack_list(vm: &Vm, instr: &Instr) -> bool {
    matches!(vm.peek(0), Some(Value::List(items)) if items.lock().len() == instr.arg as usize)
}

// ===== FOR_ITER =====

fn iter_is(vm: &Vm, tag: IterTag) -> bool {
    matches!(vm.peek(0), Some(Value::Iter(state)) if state.lock().tag() == tag)
}

fn for_iter_list(vm: &Vm, _instr: &Instr) -> bool {
    iter_is(vm, IterTag::List)
}

fn for_iter_tuple(vm: &Vm, _instr: &Instr) -> bool {
    iter_is(vm, IterTag::Tuple)
}

fn for_iter_range(vm: &Vm, _instr: &Instr) -> bool {
    iter_is(vm, IterTag::Range)
}

// ===== CALL =====
//
// Stack layout: [callable, self_or_null, arg0 .. argN-1]

fn callee<'a>(vm: &'a Vm, instr: &Instr) -> Option<(&'a Value, &'a Value)> {
    let argc = instr.arg as usize;
    Some((vm.peek(argc + 1)?, vm.peek(argc)?))
}

fn call_py_exact_args(vm: &Vm, instr: &Instr) -> bool {
    matches!(
        callee(vm, instr),
        Some((Value::Function(func), Value::Null)) if func.code.arg_count == instr.arg
    )
}

fn call_builtin_fast(vm: &Vm, instr: &Instr) -> bool {
    matches!(
        callee(vm, instr),
        Some((Value::Builtin(b), Value::Null)) if b.arity.accepts(instr.arg as usize)
    )
}

fn call_builtin_o(vm: &Vm, instr: &Instr) -> bool {
    instr.arg == 1
        && matches!(
            callee(vm, instr),
            Some((Value::Builtin(b), Value::Null)) if b.arity == Arity::Exact(1)
        )
}

fn call_len(vm: &Vm, instr: &Instr) -> bool {
    instr.arg == 1
        && matches!(
            callee(vm, instr),
            Some((Value::Builtin(b), Value::Null)) if b.name == "len"
        )
}

// ===== LOAD_GLOBAL =====

fn global_name<'a>(vm: &'a Vm, instr: &Instr) -> Option<&'a Arc<str>> {
    vm.code()?.names.get((instr.arg >> 1) as usize)
}

fn load_global_module(vm: &Vm, instr: &Instr) -> bool {
    global_name(vm, instr).map_or(false, |name| vm.global(name).is_some())
}

fn load_global_builtin(vm: &Vm, instr: &Instr) -> bool {
    global_name(vm, instr)
        .map_or(false, |name| vm.global(name).is_none() && vm.builtin(name).is_some())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::opcode::OpcodeRegistry;

    #[test]
    fn test_every_variant_refines_its_family_base() {
        for family in FAMILIES {
            for v in family.variants {
                assert_eq!(v.op.base(), family.base, "{}", v.op);
                assert!(v.op.is_specialized());
            }
        }
    }

    #[test]
    fn test_variant_stack_effects_match_base() {
        let registry = OpcodeRegistry::global();
        for family in FAMILIES {
            let base = registry.info(family.base as u8).effect.unwrap();
            for v in family.variants {
                let effect = registry.info(v.op as u8).effect.unwrap();
                assert!(effect.agrees_with(&base), "{}", v.op);
            }
        }
    }

    #[test]
    fn test_lookup() {
        assert!(family(Opcode::BinaryOp).is_some());
        assert!(family(Opcode::Nop).is_none());
        assert!(guard_of(Opcode::CallNoKwLen).is_some());
        assert!(guard_of(Opcode::BinaryOp).is_none());
    }
}
