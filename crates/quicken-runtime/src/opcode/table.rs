//! The standard opcode definition list.
//!
//! Row order is numeric order. Specialized and instrumented rows carry no
//! stack effect of their own: they inherit their base opcode's.

use super::{custom, fixed, low_bit, oparg, oparg_times, DefKind, OpcodeDef, StackEffect};

macro_rules! def_kind {
    (Base) => {
        DefKind::Base
    };
    (Wrapper) => {
        DefKind::Wrapper
    };
    (Reserved) => {
        DefKind::Reserved
    };
    (Specialized($base:ident)) => {
        DefKind::Specialized(Opcode::$base)
    };
    (Instrumented($base:ident)) => {
        DefKind::Instrumented(Opcode::$base)
    };
}

macro_rules! def_effect {
    () => {
        None
    };
    ([$pops:expr, $pushes:expr]) => {
        Some(StackEffect::new($pops, $pushes))
    };
}

macro_rules! opcodes {
    ($(
        $variant:ident = $value:literal, $name:literal, $kind:ident $(($base:ident))? $([$pops:expr, $pushes:expr])?;
    )*) => {
        /// Every assigned opcode value.
        #[repr(u8)]
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
        pub enum Opcode {
            $($variant = $value,)*
        }

        impl Opcode {
            /// All assigned opcodes in numeric order.
            pub const ALL: &'static [Opcode] = &[$(Opcode::$variant,)*];

            /// Canonical upper-case name.
            pub const fn name(self) -> &'static str {
                match self {
                    $(Opcode::$variant => $name,)*
                }
            }

            pub const fn from_u8(byte: u8) -> Option<Opcode> {
                match byte {
                    $($value => Some(Opcode::$variant),)*
                    _ => None,
                }
            }
        }

        pub(crate) static DEFINITIONS: &[OpcodeDef] = &[
            $(OpcodeDef {
                value: $value,
                name: $name,
                kind: def_kind!($kind $(($base))?),
                effect: def_effect!($([$pops, $pushes])?),
            },)*
        ];
    };
}

fn build_slice_pops(arg: u32) -> u32 {
    if arg == 3 {
        3
    } else {
        2
    }
}

fn unpack_ex_pushes(arg: u32) -> u32 {
    (arg & 0xFF) + (arg >> 8) + 1
}

opcodes! {
    Cache = 0, "CACHE", Base [fixed(0), fixed(0)];
    BeforeAsyncWith = 1, "BEFORE_ASYNC_WITH", Base [fixed(1), fixed(2)];
    BeforeWith = 2, "BEFORE_WITH", Base [fixed(1), fixed(2)];
    BinaryOpAddFloat = 3, "BINARY_OP_ADD_FLOAT", Specialized(BinaryOp);
    BinaryOpAddInt = 4, "BINARY_OP_ADD_INT", Specialized(BinaryOp);
    BinaryOpAddUnicode = 5, "BINARY_OP_ADD_UNICODE", Specialized(BinaryOp);
    BinaryOpInplaceAddUnicode = 6, "BINARY_OP_INPLACE_ADD_UNICODE", Specialized(BinaryOp);
    BinaryOpMultiplyFloat = 7, "BINARY_OP_MULTIPLY_FLOAT", Specialized(BinaryOp);
    BinaryOpMultiplyInt = 8, "BINARY_OP_MULTIPLY_INT", Specialized(BinaryOp);
    BinaryOpSubtractFloat = 9, "BINARY_OP_SUBTRACT_FLOAT", Specialized(BinaryOp);
    BinaryOpSubtractInt = 10, "BINARY_OP_SUBTRACT_INT", Specialized(BinaryOp);
    BinarySlice = 11, "BINARY_SLICE", Base [fixed(3), fixed(1)];
    BinarySubscr = 12, "BINARY_SUBSCR", Base [fixed(2), fixed(1)];
    BinarySubscrDict = 13, "BINARY_SUBSCR_DICT", Specialized(BinarySubscr);
    BinarySubscrGetitem = 14, "BINARY_SUBSCR_GETITEM", Specialized(BinarySubscr);
    BinarySubscrListInt = 15, "BINARY_SUBSCR_LIST_INT", Specialized(BinarySubscr);
    BinarySubscrStrInt = 16, "BINARY_SUBSCR_STR_INT", Specialized(BinarySubscr);
    Reserved = 17, "RESERVED", Reserved;
    BinarySubscrTupleInt = 18, "BINARY_SUBSCR_TUPLE_INT", Specialized(BinarySubscr);
    CheckEgMatch = 19, "CHECK_EG_MATCH", Base [fixed(2), fixed(2)];
    CheckExcMatch = 20, "CHECK_EXC_MATCH", Base [fixed(2), fixed(2)];
    CleanupThrow = 21, "CLEANUP_THROW", Base [fixed(3), fixed(2)];
    DeleteSubscr = 22, "DELETE_SUBSCR", Base [fixed(2), fixed(0)];
    EndAsyncFor = 23, "END_ASYNC_FOR", Base [fixed(2), fixed(0)];
    EndFor = 24, "END_FOR", Base [fixed(2), fixed(0)];
    EndSend = 25, "END_SEND", Base [fixed(2), fixed(1)];
    ExitInitCheck = 26, "EXIT_INIT_CHECK", Base [fixed(1), fixed(0)];
    FormatSimple = 27, "FORMAT_SIMPLE", Base [fixed(1), fixed(1)];
    FormatWithSpec = 28, "FORMAT_WITH_SPEC", Base [fixed(2), fixed(1)];
    GetAiter = 29, "GET_AITER", Base [fixed(1), fixed(1)];
    GetAnext = 30, "GET_ANEXT", Base [fixed(1), fixed(2)];
    GetIter = 31, "GET_ITER", Base [fixed(1), fixed(1)];
    GetLen = 32, "GET_LEN", Base [fixed(1), fixed(2)];
    GetYieldFromIter = 33, "GET_YIELD_FROM_ITER", Base [fixed(1), fixed(1)];
    InterpreterExit = 34, "INTERPRETER_EXIT", Base [fixed(1), fixed(0)];
    LoadAssertionError = 35, "LOAD_ASSERTION_ERROR", Base [fixed(0), fixed(1)];
    LoadBuildClass = 36, "LOAD_BUILD_CLASS", Base [fixed(0), fixed(1)];
    LoadLocals = 37, "LOAD_LOCALS", Base [fixed(0), fixed(1)];
    MakeFunction = 38, "MAKE_FUNCTION", Base [fixed(1), fixed(1)];
    MatchKeys = 39, "MATCH_KEYS", Base [fixed(2), fixed(3)];
    MatchMapping = 40, "MATCH_MAPPING", Base [fixed(1), fixed(2)];
    MatchSequence = 41, "MATCH_SEQUENCE", Base [fixed(1), fixed(2)];
    Nop = 42, "NOP", Base [fixed(0), fixed(0)];
    PopExcept = 43, "POP_EXCEPT", Base [fixed(1), fixed(0)];
    PopTop = 44, "POP_TOP", Base [fixed(1), fixed(0)];
    PushExcInfo = 45, "PUSH_EXC_INFO", Base [fixed(1), fixed(2)];
    PushNull = 46, "PUSH_NULL", Base [fixed(0), fixed(1)];
    ReturnGenerator = 47, "RETURN_GENERATOR", Base [fixed(0), fixed(0)];
    ReturnValue = 48, "RETURN_VALUE", Base [fixed(1), fixed(0)];
    SetupAnnotations = 49, "SETUP_ANNOTATIONS", Base [fixed(0), fixed(0)];
    StoreAttrInstanceValue = 50, "STORE_ATTR_INSTANCE_VALUE", Specialized(StoreAttr);
    StoreAttrSlot = 51, "STORE_ATTR_SLOT", Specialized(StoreAttr);
    StoreSlice = 52, "STORE_SLICE", Base [fixed(4), fixed(0)];
    StoreSubscr = 53, "STORE_SUBSCR", Base [fixed(3), fixed(0)];
    StoreSubscrDict = 54, "STORE_SUBSCR_DICT", Specialized(StoreSubscr);
    StoreSubscrListInt = 55, "STORE_SUBSCR_LIST_INT", Specialized(StoreSubscr);
    ToBool = 56, "TO_BOOL", Base [fixed(1), fixed(1)];
    ToBoolAlwaysTrue = 57, "TO_BOOL_ALWAYS_TRUE", Specialized(ToBool);
    ToBoolBool = 58, "TO_BOOL_BOOL", Specialized(ToBool);
    ToBoolInt = 59, "TO_BOOL_INT", Specialized(ToBool);
    ToBoolList = 60, "TO_BOOL_LIST", Specialized(ToBool);
    ToBoolNone = 61, "TO_BOOL_NONE", Specialized(ToBool);
    ToBoolStr = 62, "TO_BOOL_STR", Specialized(ToBool);
    UnaryInvert = 63, "UNARY_INVERT", Base [fixed(1), fixed(1)];
    UnaryNegative = 64, "UNARY_NEGATIVE", Base [fixed(1), fixed(1)];
    UnaryNot = 65, "UNARY_NOT", Base [fixed(1), fixed(1)];
    WithExceptStart = 66, "WITH_EXCEPT_START", Base [fixed(4), fixed(5)];
    BinaryOp = 67, "BINARY_OP", Base [fixed(2), fixed(1)];
    BuildConstKeyMap = 68, "BUILD_CONST_KEY_MAP", Base [oparg(1), fixed(1)];
    BuildList = 69, "BUILD_LIST", Base [oparg(0), fixed(1)];
    BuildMap = 70, "BUILD_MAP", Base [oparg_times(2, 0), fixed(1)];
    BuildSet = 71, "BUILD_SET", Base [oparg(0), fixed(1)];
    BuildSlice = 72, "BUILD_SLICE", Base [custom(build_slice_pops), fixed(1)];
    BuildString = 73, "BUILD_STRING", Base [oparg(0), fixed(1)];
    BuildTuple = 74, "BUILD_TUPLE", Base [oparg(0), fixed(1)];
    Call = 75, "CALL", Base [oparg(2), fixed(1)];
    CallBoundMethodExactArgs = 76, "CALL_BOUND_METHOD_EXACT_ARGS", Specialized(Call);
    CallBuiltinClass = 77, "CALL_BUILTIN_CLASS", Specialized(Call);
    CallBuiltinFastWithKeywords = 78, "CALL_BUILTIN_FAST_WITH_KEYWORDS", Specialized(Call);
    CallFunctionEx = 79, "CALL_FUNCTION_EX", Base [low_bit(3), fixed(1)];
    CallIntrinsic1 = 80, "CALL_INTRINSIC_1", Base [fixed(1), fixed(1)];
    CallIntrinsic2 = 81, "CALL_INTRINSIC_2", Base [fixed(2), fixed(1)];
    CallMethodDescriptorFastWithKeywords = 82, "CALL_METHOD_DESCRIPTOR_FAST_WITH_KEYWORDS", Specialized(Call);
    CallNoKwAllocAndEnterInit = 83, "CALL_NO_KW_ALLOC_AND_ENTER_INIT", Specialized(Call);
    CallNoKwBuiltinFast = 84, "CALL_NO_KW_BUILTIN_FAST", Specialized(Call);
    CallNoKwBuiltinO = 85, "CALL_NO_KW_BUILTIN_O", Specialized(Call);
    CallNoKwIsinstance = 86, "CALL_NO_KW_ISINSTANCE", Specialized(Call);
    CallNoKwLen = 87, "CALL_NO_KW_LEN", Specialized(Call);
    CallNoKwListAppend = 88, "CALL_NO_KW_LIST_APPEND", Specialized(Call);
    CallNoKwMethodDescriptorFast = 89, "CALL_NO_KW_METHOD_DESCRIPTOR_FAST", Specialized(Call);
    CallNoKwMethodDescriptorNoargs = 90, "CALL_NO_KW_METHOD_DESCRIPTOR_NOARGS", Specialized(Call);
    CallNoKwMethodDescriptorO = 91, "CALL_NO_KW_METHOD_DESCRIPTOR_O", Specialized(Call);
    CallNoKwStr1 = 92, "CALL_NO_KW_STR_1", Specialized(Call);
    CallNoKwTuple1 = 93, "CALL_NO_KW_TUPLE_1", Specialized(Call);
    CallNoKwType1 = 94, "CALL_NO_KW_TYPE_1", Specialized(Call);
    CallPyExactArgs = 95, "CALL_PY_EXACT_ARGS", Specialized(Call);
    CallPyWithDefaults = 96, "CALL_PY_WITH_DEFAULTS", Specialized(Call);
    CompareOp = 97, "COMPARE_OP", Base [fixed(2), fixed(1)];
    CompareOpFloat = 98, "COMPARE_OP_FLOAT", Specialized(CompareOp);
    CompareOpInt = 99, "COMPARE_OP_INT", Specialized(CompareOp);
    CompareOpStr = 100, "COMPARE_OP_STR", Specialized(CompareOp);
    ContainsOp = 101, "CONTAINS_OP", Base [fixed(2), fixed(1)];
    ConvertValue = 102, "CONVERT_VALUE", Base [fixed(1), fixed(1)];
    Copy = 103, "COPY", Base [oparg(0), oparg(1)];
    CopyFreeVars = 104, "COPY_FREE_VARS", Base [fixed(0), fixed(0)];
    DeleteAttr = 105, "DELETE_ATTR", Base [fixed(1), fixed(0)];
    DeleteDeref = 106, "DELETE_DEREF", Base [fixed(0), fixed(0)];
    DeleteFast = 107, "DELETE_FAST", Base [fixed(0), fixed(0)];
    DeleteGlobal = 108, "DELETE_GLOBAL", Base [fixed(0), fixed(0)];
    DeleteName = 109, "DELETE_NAME", Base [fixed(0), fixed(0)];
    DictMerge = 110, "DICT_MERGE", Base [oparg(4), oparg(3)];
    DictUpdate = 111, "DICT_UPDATE", Base [oparg(1), oparg(0)];
    EnterExecutor = 112, "ENTER_EXECUTOR", Base [fixed(0), fixed(0)];
    ExtendedArg = 113, "EXTENDED_ARG", Base [fixed(0), fixed(0)];
    ForIter = 114, "FOR_ITER", Base [fixed(1), fixed(2)];
    ForIterGen = 115, "FOR_ITER_GEN", Specialized(ForIter);
    ForIterList = 116, "FOR_ITER_LIST", Specialized(ForIter);
    ForIterRange = 117, "FOR_ITER_RANGE", Specialized(ForIter);
    ForIterTuple = 118, "FOR_ITER_TUPLE", Specialized(ForIter);
    GetAwaitable = 119, "GET_AWAITABLE", Base [fixed(1), fixed(1)];
    ImportFrom = 120, "IMPORT_FROM", Base [fixed(1), fixed(2)];
    ImportName = 121, "IMPORT_NAME", Base [fixed(2), fixed(1)];
    IsOp = 122, "IS_OP", Base [fixed(2), fixed(1)];
    JumpBackward = 123, "JUMP_BACKWARD", Base [fixed(0), fixed(0)];
    JumpBackwardNoInterrupt = 124, "JUMP_BACKWARD_NO_INTERRUPT", Base [fixed(0), fixed(0)];
    JumpForward = 125, "JUMP_FORWARD", Base [fixed(0), fixed(0)];
    KwNames = 126, "KW_NAMES", Base [fixed(0), fixed(0)];
    ListAppend = 127, "LIST_APPEND", Base [oparg(1), oparg(0)];
    ListExtend = 128, "LIST_EXTEND", Base [oparg(1), oparg(0)];
    LoadAttr = 129, "LOAD_ATTR", Base [fixed(1), low_bit(1)];
    LoadAttrClass = 130, "LOAD_ATTR_CLASS", Specialized(LoadAttr);
    LoadAttrGetattributeOverridden = 131, "LOAD_ATTR_GETATTRIBUTE_OVERRIDDEN", Specialized(LoadAttr);
    LoadAttrInstanceValue = 132, "LOAD_ATTR_INSTANCE_VALUE", Specialized(LoadAttr);
    LoadAttrMethodLazyDict = 133, "LOAD_ATTR_METHOD_LAZY_DICT", Specialized(LoadAttr);
    LoadAttrMethodNoDict = 134, "LOAD_ATTR_METHOD_NO_DICT", Specialized(LoadAttr);
    LoadAttrMethodWithValues = 135, "LOAD_ATTR_METHOD_WITH_VALUES", Specialized(LoadAttr);
    LoadAttrModule = 136, "LOAD_ATTR_MODULE", Specialized(LoadAttr);
    LoadAttrNondescriptorNoDict = 137, "LOAD_ATTR_NONDESCRIPTOR_NO_DICT", Specialized(LoadAttr);
    LoadAttrNondescriptorWithValues = 138, "LOAD_ATTR_NONDESCRIPTOR_WITH_VALUES", Specialized(LoadAttr);
    LoadAttrProperty = 139, "LOAD_ATTR_PROPERTY", Specialized(LoadAttr);
    LoadAttrSlot = 140, "LOAD_ATTR_SLOT", Specialized(LoadAttr);
    LoadAttrWithHint = 141, "LOAD_ATTR_WITH_HINT", Specialized(LoadAttr);
    LoadConst = 142, "LOAD_CONST", Base [fixed(0), fixed(1)];
    LoadDeref = 143, "LOAD_DEREF", Base [fixed(0), fixed(1)];
    LoadFast = 144, "LOAD_FAST", Base [fixed(0), fixed(1)];
    LoadFastAndClear = 145, "LOAD_FAST_AND_CLEAR", Base [fixed(0), fixed(1)];
    LoadFastCheck = 146, "LOAD_FAST_CHECK", Base [fixed(0), fixed(1)];
    LoadFastLoadFast = 147, "LOAD_FAST_LOAD_FAST", Base [fixed(0), fixed(2)];
    LoadFromDictOrDeref = 148, "LOAD_FROM_DICT_OR_DEREF", Base [fixed(1), fixed(1)];
    LoadFromDictOrGlobals = 149, "LOAD_FROM_DICT_OR_GLOBALS", Base [fixed(1), fixed(1)];
    LoadGlobal = 150, "LOAD_GLOBAL", Base [fixed(0), low_bit(1)];
    LoadGlobalBuiltin = 151, "LOAD_GLOBAL_BUILTIN", Specialized(LoadGlobal);
    LoadGlobalModule = 152, "LOAD_GLOBAL_MODULE", Specialized(LoadGlobal);
    LoadName = 153, "LOAD_NAME", Base [fixed(0), fixed(1)];
    LoadSuperAttr = 154, "LOAD_SUPER_ATTR", Base [fixed(3), low_bit(1)];
    LoadSuperAttrAttr = 155, "LOAD_SUPER_ATTR_ATTR", Specialized(LoadSuperAttr);
    LoadSuperAttrMethod = 156, "LOAD_SUPER_ATTR_METHOD", Specialized(LoadSuperAttr);
    MakeCell = 157, "MAKE_CELL", Base [fixed(0), fixed(0)];
    MapAdd = 158, "MAP_ADD", Base [oparg(2), oparg(0)];
    MatchClass = 159, "MATCH_CLASS", Base [fixed(3), fixed(1)];
    PopJumpIfFalse = 160, "POP_JUMP_IF_FALSE", Base [fixed(1), fixed(0)];
    PopJumpIfNone = 161, "POP_JUMP_IF_NONE", Base [fixed(1), fixed(0)];
    PopJumpIfNotNone = 162, "POP_JUMP_IF_NOT_NONE", Base [fixed(1), fixed(0)];
    PopJumpIfTrue = 163, "POP_JUMP_IF_TRUE", Base [fixed(1), fixed(0)];
    RaiseVarargs = 164, "RAISE_VARARGS", Base [oparg(0), fixed(0)];
    Reraise = 165, "RERAISE", Base [oparg(1), oparg(0)];
    Resume = 166, "RESUME", Base [fixed(0), fixed(0)];
    ReturnConst = 167, "RETURN_CONST", Base [fixed(0), fixed(0)];
    Send = 168, "SEND", Base [fixed(2), fixed(2)];
    SendGen = 169, "SEND_GEN", Specialized(Send);
    SetAdd = 170, "SET_ADD", Base [oparg(1), oparg(0)];
    SetFunctionAttribute = 171, "SET_FUNCTION_ATTRIBUTE", Base [fixed(2), fixed(1)];
    SetUpdate = 172, "SET_UPDATE", Base [oparg(1), oparg(0)];
    StoreAttr = 173, "STORE_ATTR", Base [fixed(2), fixed(0)];
    StoreAttrWithHint = 174, "STORE_ATTR_WITH_HINT", Specialized(StoreAttr);
    StoreDeref = 175, "STORE_DEREF", Base [fixed(1), fixed(0)];
    StoreFast = 176, "STORE_FAST", Base [fixed(1), fixed(0)];
    StoreFastLoadFast = 177, "STORE_FAST_LOAD_FAST", Base [fixed(1), fixed(1)];
    StoreFastStoreFast = 178, "STORE_FAST_STORE_FAST", Base [fixed(2), fixed(0)];
    StoreGlobal = 179, "STORE_GLOBAL", Base [fixed(1), fixed(0)];
    StoreName = 180, "STORE_NAME", Base [fixed(1), fixed(0)];
    Swap = 181, "SWAP", Base [oparg(0), oparg(0)];
    UnpackEx = 182, "UNPACK_EX", Base [fixed(1), custom(unpack_ex_pushes)];
    UnpackSequence = 183, "UNPACK_SEQUENCE", Base [fixed(1), oparg(0)];
    UnpackSequenceList = 184, "UNPACK_SEQUENCE_LIST", Specialized(UnpackSequence);
    UnpackSequenceTuple = 185, "UNPACK_SEQUENCE_TUPLE", Specialized(UnpackSequence);
    UnpackSequenceTwoTuple = 186, "UNPACK_SEQUENCE_TWO_TUPLE", Specialized(UnpackSequence);
    YieldValue = 187, "YIELD_VALUE", Base [fixed(1), fixed(1)];
    InstrumentedResume = 237, "INSTRUMENTED_RESUME", Instrumented(Resume);
    InstrumentedEndFor = 238, "INSTRUMENTED_END_FOR", Instrumented(EndFor);
    InstrumentedEndSend = 239, "INSTRUMENTED_END_SEND", Instrumented(EndSend);
    InstrumentedReturnValue = 240, "INSTRUMENTED_RETURN_VALUE", Instrumented(ReturnValue);
    InstrumentedReturnConst = 241, "INSTRUMENTED_RETURN_CONST", Instrumented(ReturnConst);
    InstrumentedYieldValue = 242, "INSTRUMENTED_YIELD_VALUE", Instrumented(YieldValue);
    InstrumentedLoadSuperAttr = 243, "INSTRUMENTED_LOAD_SUPER_ATTR", Instrumented(LoadSuperAttr);
    InstrumentedForIter = 244, "INSTRUMENTED_FOR_ITER", Instrumented(ForIter);
    InstrumentedCall = 245, "INSTRUMENTED_CALL", Instrumented(Call);
    InstrumentedCallFunctionEx = 246, "INSTRUMENTED_CALL_FUNCTION_EX", Instrumented(CallFunctionEx);
    InstrumentedInstruction = 247, "INSTRUMENTED_INSTRUCTION", Wrapper;
    InstrumentedJumpForward = 248, "INSTRUMENTED_JUMP_FORWARD", Instrumented(JumpForward);
    InstrumentedJumpBackward = 249, "INSTRUMENTED_JUMP_BACKWARD", Instrumented(JumpBackward);
    InstrumentedPopJumpIfTrue = 250, "INSTRUMENTED_POP_JUMP_IF_TRUE", Instrumented(PopJumpIfTrue);
    InstrumentedPopJumpIfFalse = 251, "INSTRUMENTED_POP_JUMP_IF_FALSE", Instrumented(PopJumpIfFalse);
    InstrumentedPopJumpIfNone = 252, "INSTRUMENTED_POP_JUMP_IF_NONE", Instrumented(PopJumpIfNone);
    InstrumentedPopJumpIfNotNone = 253, "INSTRUMENTED_POP_JUMP_IF_NOT_NONE", Instrumented(PopJumpIfNotNone);
    InstrumentedLine = 254, "INSTRUMENTED_LINE", Wrapper;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_definitions_are_sorted_and_unique() {
        for pair in DEFINITIONS.windows(2) {
            assert!(pair[0].value < pair[1].value, "{} out of order", pair[1].name);
        }
    }

    #[test]
    fn test_assigned_ranges() {
        assert_eq!(Opcode::ALL.len(), 188 + 18);
        assert_eq!(Opcode::YieldValue as u8, 187);
        assert_eq!(Opcode::InstrumentedResume as u8, 237);
        assert!((188..237).all(|b| Opcode::from_u8(b).is_none()));
    }

    #[test]
    fn test_variable_effects() {
        let slice = StackEffect::new(custom(build_slice_pops), fixed(1));
        assert_eq!(slice.eval(2), (2, 1));
        assert_eq!(slice.eval(3), (3, 1));
        assert_eq!(unpack_ex_pushes(0x0102), 4);
    }
}
