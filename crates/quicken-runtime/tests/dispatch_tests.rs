//! Dispatch table and interpreter loop integration tests
//!
//! Covers table totality, fault handling for unassigned opcodes, operand
//! extension and a handful of complete programs.

use pretty_assertions::assert_eq;
use quicken_runtime::bytecode::{split, unit};
use quicken_runtime::opcode::HAVE_ARGUMENT;
use quicken_runtime::vm::{buffer_writer, SlotKind};
use quicken_runtime::{
    assemble, CodeObject, DispatchTable, OpClass, Opcode, OpcodeRegistry, Value, Vm, VmError,
};
use rstest::rstest;

// =============================================================================
// Table shape
// =============================================================================

#[test]
fn test_every_byte_resolves() {
    let table = DispatchTable::global();
    let registry = OpcodeRegistry::global();
    for byte in 0..=255u8 {
        let kind = table.slot_kind(byte);
        match registry.info(byte).class {
            OpClass::Reserved => assert_eq!(kind, SlotKind::Fault, "byte {byte}"),
            _ => assert_ne!(kind, SlotKind::Fault, "byte {byte}"),
        }
    }
}

#[rstest]
#[case(17)]
#[case(188)]
#[case(200)]
#[case(236)]
#[case(255)]
fn test_unassigned_values_are_reserved(#[case] byte: u8) {
    assert_eq!(OpcodeRegistry::global().info(byte).class, OpClass::Reserved);
    assert_eq!(DispatchTable::global().slot_kind(byte), SlotKind::Fault);
}

#[test]
fn test_instrumented_range_is_contiguous() {
    let registry = OpcodeRegistry::global();
    for byte in 237..=254u8 {
        assert_eq!(registry.info(byte).class, OpClass::Instrumented, "byte {byte}");
    }
    assert_eq!(registry.info(236).class, OpClass::Reserved);
    assert_eq!(registry.info(255).class, OpClass::Reserved);
}

#[test]
fn test_operand_boundary() {
    let registry = OpcodeRegistry::global();
    assert!(registry.info(Opcode::ReturnValue as u8).value < HAVE_ARGUMENT);
    assert_eq!(Opcode::BinaryOp as u8, HAVE_ARGUMENT);
    assert_eq!(registry.value_of("BINARY_OP"), Some(Opcode::BinaryOp as u8));
}

// =============================================================================
// Faults
// =============================================================================

#[rstest]
#[case(17)]
#[case(200)]
#[case(255)]
fn test_unassigned_opcode_aborts_once(#[case] byte: u8) {
    let code = CodeObject::builder("main")
        .constant(1i64)
        .op(Opcode::LoadConst, 0)
        .raw(&[unit(byte, 0)])
        .op(Opcode::ReturnValue, 0)
        .build();
    let mut vm = Vm::new();
    let err = vm.run(code).unwrap_err();
    assert_eq!(
        err,
        VmError::UnknownOpcode {
            opcode: byte,
            offset: 1
        }
    );
    assert!(err.is_fatal());
    assert_eq!(vm.stats().faults(), 1);
}

#[test]
fn test_fault_does_not_poison_the_vm() {
    let bad = CodeObject::builder("bad").raw(&[unit(255, 0)]).build();
    let good = assemble(".code main\n.const 7\n RETURN_CONST 0\n.end").unwrap();
    let mut vm = Vm::new();
    assert!(vm.run(bad).is_err());
    assert_eq!(vm.run(good), Ok(Value::Int(7)));
    assert_eq!(vm.depth(), 0);
}

#[test]
fn test_cache_units_are_skipped() {
    let code = CodeObject::builder("main")
        .constant(3i64)
        .op(Opcode::Cache, 0)
        .op(Opcode::LoadConst, 0)
        .op(Opcode::Cache, 0)
        .op(Opcode::Cache, 0)
        .op(Opcode::ReturnValue, 0)
        .build();
    let mut vm = Vm::new();
    assert_eq!(vm.run(code), Ok(Value::Int(3)));
}

// =============================================================================
// Operand extension
// =============================================================================

#[test]
fn test_extended_arg_reaches_high_constants() {
    let mut builder = CodeObject::builder("main");
    for i in 0..300i64 {
        builder = builder.constant(i);
    }
    let code = builder.op(Opcode::LoadConst, 299).op(Opcode::ReturnValue, 0).build();
    let units = code.snapshot();
    assert_eq!(split(units[0]), (Opcode::ExtendedArg as u8, 1));
    assert_eq!(split(units[1]), (Opcode::LoadConst as u8, 43));
    assert_eq!(Vm::new().run(code), Ok(Value::Int(299)));
}

#[test]
fn test_jump_into_prefix_runs_prefixed_instruction() {
    // Jumping to the EXTENDED_ARG of a prefixed instruction decodes it whole.
    let mut builder = CodeObject::builder("main").constant(Value::None);
    for i in 1..=260i64 {
        builder = builder.constant(i);
    }
    let code = builder
        .op(Opcode::JumpForward, 0)
        .op(Opcode::LoadConst, 260)
        .op(Opcode::ReturnValue, 0)
        .build();
    assert_eq!(Vm::new().run(code), Ok(Value::Int(260)));
}

// =============================================================================
// Programs
// =============================================================================

const SUM_OF_SQUARES: &str = r#"
    ; x = 'outer'; return (sum([x * x for x in range(100)]), x)
    .code main
    .locals 1
    .name sum
    .name range
    .const 100
    .const "outer"
        RESUME 0
        LOAD_CONST 1
        STORE_FAST 0
        LOAD_GLOBAL 1            ; NULL + sum
        LOAD_GLOBAL 3            ; NULL + range
        LOAD_CONST 0
        CALL 1
        GET_ITER
        LOAD_FAST_AND_CLEAR 0
        SWAP 2
        BUILD_LIST 0
        SWAP 2
    loop:
        FOR_ITER @done
        STORE_FAST 0
        LOAD_FAST_LOAD_FAST 0x00
        BINARY_OP *
        LIST_APPEND 2
        JUMP_BACKWARD @loop
    done:
        END_FOR
        SWAP 2
        STORE_FAST 0
        CALL 1
        LOAD_FAST 0
        BUILD_TUPLE 2
        RETURN_VALUE
    .end
"#;

#[test]
fn test_inlined_comprehension_restores_its_variable() {
    let code = assemble(SUM_OF_SQUARES).unwrap();
    let result = Vm::new().run(code).unwrap();
    assert_eq!(
        result,
        Value::tuple(vec![Value::Int(328_350), Value::str("outer")])
    );
}

#[test]
fn test_comprehension_variable_does_not_leak() {
    // Same comprehension with x unbound beforehand: reading x afterwards fails.
    let source = SUM_OF_SQUARES
        .replace("        LOAD_CONST 1\n        STORE_FAST 0\n", "")
        .replace("        LOAD_FAST 0\n        BUILD_TUPLE 2\n", "        LOAD_FAST 0\n");
    let code = assemble(&source).unwrap();
    assert_eq!(Vm::new().run(code), Err(VmError::UnboundLocal("0".into())));
}

#[test]
fn test_print_through_output_writer() {
    let source = r#"
        .code main
        .name print
        .const "hello"
        .const None
            LOAD_GLOBAL 1
            LOAD_CONST 0
            CALL 1
            POP_TOP
            RETURN_CONST 1
        .end
    "#;
    let (writer, buffer) = buffer_writer();
    let mut vm = Vm::new();
    vm.set_output_writer(writer);
    assert_eq!(vm.run(assemble(source).unwrap()), Ok(Value::None));
    assert_eq!(String::from_utf8(buffer.lock().clone()).unwrap(), "hello\n");
}
