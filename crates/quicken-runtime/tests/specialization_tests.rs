//! Specialization integration tests
//!
//! Drives real programs through warmup, promotion, guard misses and
//! de-optimization, and checks that rewriting never changes results.

use pretty_assertions::assert_eq;
use proptest::prelude::*;
use quicken_runtime::bytecode::split;
use quicken_runtime::specialize::SpecializationConfig;
use quicken_runtime::value::Function;
use quicken_runtime::{assemble, CodeObject, OpClass, Opcode, OpcodeRegistry, Value, Vm, VmConfig};
use std::sync::Arc;

const ADD: &str = "
    .code add
    .args 2
    .locals 2
        LOAD_FAST_LOAD_FAST 0x01
        BINARY_OP +
        RETURN_VALUE
    .end
";

/// Site of `BINARY_OP` in [`ADD`].
const ADD_SITE: usize = 1;

fn function(code: &Arc<CodeObject>) -> Value {
    Value::Function(Arc::new(Function {
        name: Arc::clone(&code.name),
        code: Arc::clone(code),
    }))
}

fn opcode_at(code: &CodeObject, site: usize) -> u8 {
    split(code.snapshot()[site]).0
}

fn unspecialized() -> Vm {
    Vm::with_config(VmConfig {
        specialization: SpecializationConfig {
            enabled: false,
            ..Default::default()
        },
        ..Default::default()
    })
}

// =============================================================================
// Promotion and de-optimization
// =============================================================================

#[test]
fn test_int_add_promotes_then_float_demotes() {
    let code = assemble(ADD).unwrap();
    let add = function(&code);
    let mut vm = Vm::new();

    for i in 0..1000 {
        assert_eq!(
            vm.call(&add, vec![Value::Int(i), Value::Int(1)]),
            Ok(Value::Int(i + 1))
        );
    }
    assert_eq!(opcode_at(&code, ADD_SITE), Opcode::BinaryOpAddInt as u8);
    assert_eq!(vm.stats().promotions(Opcode::BinaryOpAddInt), 1);
    assert!(vm.stats().hits(Opcode::BinaryOpAddInt) > 900);

    assert_eq!(
        vm.call(&add, vec![Value::Float(1.25), Value::Float(2.25)]),
        Ok(Value::Float(3.5))
    );
    assert_eq!(opcode_at(&code, ADD_SITE), Opcode::BinaryOp as u8);
    assert_eq!(vm.stats().deopts(Opcode::BinaryOpAddInt), 1);
}

#[test]
fn test_demoted_site_can_settle_on_another_variant() {
    let code = assemble(ADD).unwrap();
    let add = function(&code);
    let mut vm = Vm::new();

    for _ in 0..20 {
        vm.call(&add, vec![Value::Int(1), Value::Int(2)]).unwrap();
    }
    for _ in 0..200 {
        vm.call(&add, vec![Value::str("a"), Value::str("b")]).unwrap();
    }
    assert_eq!(opcode_at(&code, ADD_SITE), Opcode::BinaryOpAddUnicode as u8);
    assert_eq!(vm.stats().deopts(Opcode::BinaryOpAddInt), 1);
    assert_eq!(vm.stats().promotions(Opcode::BinaryOpAddUnicode), 1);
}

#[test]
fn test_loop_specializes_every_hot_site() {
    let source = "
        ; total = 0; for i in range(1000): total += i
        .code main
        .locals 2
        .name range
        .const 0
        .const 1000
            RESUME 0
            LOAD_CONST 0
            STORE_FAST 0
            LOAD_GLOBAL 1
            LOAD_CONST 1
            CALL 1
            GET_ITER
        top:
            FOR_ITER @done
            STORE_FAST 1
            LOAD_FAST_LOAD_FAST 0x01
            BINARY_OP +=
            STORE_FAST 0
            JUMP_BACKWARD @top
        done:
            END_FOR
            LOAD_FAST 0
            RETURN_VALUE
        .end
    ";
    let code = assemble(source).unwrap();
    let mut vm = Vm::new();
    assert_eq!(vm.run(Arc::clone(&code)), Ok(Value::Int(499_500)));

    let registry = OpcodeRegistry::global();
    let live: Vec<&str> = code
        .snapshot()
        .iter()
        .map(|unit| registry.info(split(*unit).0).name)
        .collect();
    assert!(live.contains(&"FOR_ITER_RANGE"), "{live:?}");
    assert!(live.contains(&"BINARY_OP_ADD_INT"), "{live:?}");

    // The compiled form is untouched underneath.
    let original = assemble(source).unwrap();
    assert_eq!(code.deoptimized(), original.snapshot());
}

#[test]
fn test_disabled_engine_matches_config() {
    let mut config = quicken_config::QuickenConfig::default();
    config.specialization.enabled = false;
    let code = assemble(ADD).unwrap();
    let add = function(&code);
    let mut vm = Vm::with_config(VmConfig::from_config(&config));
    for _ in 0..100 {
        vm.call(&add, vec![Value::Int(2), Value::Int(2)]).unwrap();
    }
    assert_eq!(code.snapshot(), code.deoptimized());
    assert_eq!(vm.stats().snapshot().total_promotions(), 0);
}

#[test]
fn test_custom_warmup_from_config() {
    let mut config = quicken_config::QuickenConfig::default();
    config.specialization.warmup = 2;
    let code = assemble(ADD).unwrap();
    let add = function(&code);
    let mut vm = Vm::with_config(VmConfig::from_config(&config));
    for _ in 0..2 {
        vm.call(&add, vec![Value::Int(2), Value::Int(2)]).unwrap();
    }
    assert_eq!(opcode_at(&code, ADD_SITE), Opcode::BinaryOpAddInt as u8);
}

#[test]
fn test_stats_export() {
    let code = assemble(ADD).unwrap();
    let add = function(&code);
    let mut vm = Vm::new();
    for _ in 0..50 {
        vm.call(&add, vec![Value::Int(1), Value::Int(1)]).unwrap();
    }
    let snapshot = vm.stats().snapshot();
    let row = snapshot.get(Opcode::BinaryOpAddInt).unwrap();
    assert_eq!(row.promotions, 1);
    assert_eq!(row.class, OpClass::Specialized);

    let json: serde_json::Value = serde_json::from_str(&vm.stats().to_json().unwrap()).unwrap();
    assert!(json["opcodes"]
        .as_array()
        .unwrap()
        .iter()
        .any(|row| row["name"] == "BINARY_OP_ADD_INT"));
}

// =============================================================================
// Results never depend on the rewritten form
// =============================================================================

#[derive(Debug, Clone)]
enum Shape {
    Int(i64, i64),
    Float(f64, f64),
    Str(String, String),
}

impl Shape {
    fn args(&self) -> Vec<Value> {
        match self {
            Shape::Int(a, b) => vec![Value::Int(*a), Value::Int(*b)],
            Shape::Float(a, b) => vec![Value::Float(*a), Value::Float(*b)],
            Shape::Str(a, b) => vec![Value::str(a.as_str()), Value::str(b.as_str())],
        }
    }

    fn expected(&self) -> Value {
        match self {
            Shape::Int(a, b) => Value::Int(a + b),
            Shape::Float(a, b) => Value::Float(a + b),
            Shape::Str(a, b) => Value::str(format!("{a}{b}")),
        }
    }
}

fn shape() -> impl Strategy<Value = Shape> {
    prop_oneof![
        (-1_000_000i64..1_000_000, -1_000_000i64..1_000_000).prop_map(|(a, b)| Shape::Int(a, b)),
        (-1e6f64..1e6, -1e6f64..1e6).prop_map(|(a, b)| Shape::Float(a, b)),
        ("[a-z]{0,4}", "[a-z]{0,4}").prop_map(|(a, b)| Shape::Str(a, b)),
    ]
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(64))]

    #[test]
    fn prop_alternating_shapes_keep_results_and_stack(
        runs in prop::collection::vec((shape(), 1usize..40), 1..8)
    ) {
        let code = assemble(ADD).unwrap();
        let add = function(&code);
        let mut vm = Vm::new();
        let reference_add = function(&assemble(ADD).unwrap());
        let mut reference = unspecialized();
        let registry = OpcodeRegistry::global();

        for (shape, repeat) in &runs {
            for _ in 0..*repeat {
                let got = vm.call(&add, shape.args()).unwrap();
                prop_assert_eq!(&got, &shape.expected());
                prop_assert_eq!(got, reference.call(&reference_add, shape.args()).unwrap());
                prop_assert_eq!(vm.depth(), 0);

                let info = registry.info(opcode_at(&code, ADD_SITE));
                prop_assert!(
                    info.value == Opcode::BinaryOp as u8
                        || info.base == Some(Opcode::BinaryOp as u8),
                    "site holds {}", info.name
                );
            }
        }
        prop_assert_eq!(code.deoptimized(), assemble(ADD).unwrap().snapshot());
    }
}
