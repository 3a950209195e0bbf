//! Opcode handlers
//!
//! Handlers are grouped by concern:
//! - `stack`: constants, locals, globals and stack shuffling
//! - `arith`: operators, comparisons and truth tests
//! - `containers`: lists, tuples, subscripts, unpacking and iteration setup
//! - `control`: jumps, loops, calls and returns
//! - `specialized`: fast paths for specialized opcodes
//! - `instrumented`: monitoring wrappers

pub mod arith;
pub(crate) mod containers;
pub(crate) mod control;
pub(crate) mod specialized;
pub(crate) mod instrumented;
pub(crate) mod stack;

use super::dispatch::{ControlFlow, OpHandler};
use crate::error::VmError;
use crate::opcode::Opcode;

pub(crate) type HandlerResult = Result<ControlFlow, VmError>;

/// Dedicated handler for `op`, if this VM implements one.
pub(crate) fn handler_for(op: Opcode) -> Option<OpHandler> {
    use Opcode::*;
    let handler: OpHandler = match op {
        // ===== Stack and variables =====
        Cache | Nop => stack::nop,
        Resume => stack::resume,
        PopTop => stack::pop_top,
        PushNull => stack::push_null,
        Copy => stack::copy,
        Swap => stack::swap,
        EndFor => stack::end_for,
        LoadConst => stack::load_const,
        LoadFast => stack::load_fast,
        LoadFastCheck => stack::load_fast,
        LoadFastAndClear => stack::load_fast_and_clear,
        LoadFastLoadFast => stack::load_fast_load_fast,
        StoreFast => stack::store_fast,
        StoreFastLoadFast => stack::store_fast_load_fast,
        StoreFastStoreFast => stack::store_fast_store_fast,
        DeleteFast => stack::delete_fast,
        LoadGlobal => stack::load_global,
        StoreGlobal => stack::store_global,
        DeleteGlobal => stack::delete_global,

        // ===== Operators =====
        BinaryOp => arith::binary_op,
        UnaryNegative => arith::unary_negative,
        UnaryNot => arith::unary_not,
        UnaryInvert => arith::unary_invert,
        ToBool => arith::to_bool,
        CompareOp => arith::compare_op,
        IsOp => arith::is_op,
        ContainsOp => arith::contains_op,

        // ===== Containers =====
        BuildList => containers::build_list,
        BuildTuple => containers::build_tuple,
        ListAppend => containers::list_append,
        ListExtend => containers::list_extend,
        BinarySubscr => containers::binary_subscr,
        StoreSubscr => containers::store_subscr,
        UnpackSequence => containers::unpack_sequence,
        GetIter => containers::get_iter,

        // ===== Control flow =====
        ExtendedArg => control::extended_arg,
        ForIter => control::for_iter,
        JumpForward => control::jump_forward,
        JumpBackward | JumpBackwardNoInterrupt => control::jump_backward,
        PopJumpIfTrue => control::pop_jump_if_true,
        PopJumpIfFalse => control::pop_jump_if_false,
        PopJumpIfNone => control::pop_jump_if_none,
        PopJumpIfNotNone => control::pop_jump_if_not_none,
        MakeFunction => control::make_function,
        Call => control::call,
        ReturnValue => control::return_value,
        ReturnConst => control::return_const,

        // ===== Specialized =====
        BinaryOpAddInt => specialized::binary_op_add_int,
        BinaryOpSubtractInt => specialized::binary_op_subtract_int,
        BinaryOpMultiplyInt => specialized::binary_op_multiply_int,
        BinaryOpAddFloat => specialized::binary_op_add_float,
        BinaryOpSubtractFloat => specialized::binary_op_subtract_float,
        BinaryOpMultiplyFloat => specialized::binary_op_multiply_float,
        BinaryOpAddUnicode => specialized::binary_op_add_unicode,
        BinaryOpInplaceAddUnicode => specialized::binary_op_inplace_add_unicode,
        CompareOpInt => specialized::compare_op_int,
        CompareOpFloat => specialized::compare_op_float,
        CompareOpStr => specialized::compare_op_str,
        ToBoolBool => specialized::to_bool_bool,
        ToBoolInt => specialized::to_bool_int,
        ToBoolList => specialized::to_bool_list,
        ToBoolNone => specialized::to_bool_none,
        ToBoolStr => specialized::to_bool_str,
        ToBoolAlwaysTrue => specialized::to_bool_always_true,
        BinarySubscrListInt => specialized::binary_subscr_list_int,
        BinarySubscrTupleInt => specialized::binary_subscr_tuple_int,
        BinarySubscrStrInt => specialized::binary_subscr_str_int,
        StoreSubscrListInt => specialized::store_subscr_list_int,
        UnpackSequenceTuple => specialized::unpack_sequence_tuple,
        UnpackSequenceTwoTuple => specialized::unpack_sequence_two_tuple,
        UnpackSequenceList => specialized::unpack_sequence_list,
        ForIterList => specialized::for_iter_list,
        ForIterTuple => specialized::for_iter_tuple,
        ForIterRange => specialized::for_iter_range,
        CallPyExactArgs => specialized::call_py_exact_args,
        CallNoKwBuiltinFast => specialized::call_no_kw_builtin_fast,
        CallNoKwBuiltinO => specialized::call_no_kw_builtin_o,
        CallNoKwLen => specialized::call_no_kw_len,
        LoadGlobalModule => specialized::load_global_module,
        LoadGlobalBuiltin => specialized::load_global_builtin,

        // ===== Instrumented =====
        InstrumentedResume => instrumented::resume,
        InstrumentedEndFor | InstrumentedEndSend => instrumented::stop_iteration,
        InstrumentedReturnValue => instrumented::return_value,
        InstrumentedReturnConst => instrumented::return_const,
        InstrumentedYieldValue => instrumented::yield_value,
        InstrumentedLoadSuperAttr => instrumented::load_super_attr,
        InstrumentedForIter => instrumented::branch,
        InstrumentedCall => instrumented::call,
        InstrumentedCallFunctionEx => instrumented::call_function_ex,
        InstrumentedInstruction => instrumented::instruction,
        InstrumentedJumpForward | InstrumentedJumpBackward => instrumented::jump,
        InstrumentedPopJumpIfTrue
        | InstrumentedPopJumpIfFalse
        | InstrumentedPopJumpIfNone
        | InstrumentedPopJumpIfNotNone => instrumented::branch,
        InstrumentedLine => instrumented::line,

        _ => return None,
    };
    Some(handler)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::specialize::FAMILIES;

    #[test]
    fn test_every_variant_has_a_fast_path() {
        for family in FAMILIES {
            assert!(handler_for(family.base).is_some(), "{}", family.base);
            for variant in family.variants {
                assert!(handler_for(variant.op).is_some(), "{}", variant.op);
            }
        }
    }

    #[test]
    fn test_every_instrumented_opcode_has_a_handler() {
        for op in Opcode::ALL.iter().filter(|op| op.is_instrumented()) {
            assert!(handler_for(*op).is_some(), "{}", op);
        }
    }
}
