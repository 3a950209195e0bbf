//! Opcodes command - list the opcode table

use crate::ClassFilter;
use anyhow::Result;
use quicken_runtime::opcode::Operand;
use quicken_runtime::{OpClass, OpcodeInfo, OpcodeRegistry};
use serde_json::json;

pub fn run(json: bool, class: Option<ClassFilter>) -> Result<()> {
    let registry = OpcodeRegistry::global();
    let wanted = class.map(op_class);
    let entries: Vec<&OpcodeInfo> = registry
        .iter()
        .filter(|info| wanted.map_or(true, |class| info.class == class))
        .collect();

    if json {
        let rows: Vec<_> = entries.iter().map(|info| to_json(registry, info)).collect();
        println!("{}", serde_json::to_string_pretty(&rows)?);
    } else {
        println!("{:>5}  {:<36}{:<14}{:<24}FLAGS", "VALUE", "NAME", "CLASS", "BASE");
        for info in entries {
            println!("{}", table_row(registry, info));
        }
    }
    Ok(())
}

fn op_class(filter: ClassFilter) -> OpClass {
    match filter {
        ClassFilter::Base => OpClass::Base,
        ClassFilter::Specialized => OpClass::Specialized,
        ClassFilter::Instrumented => OpClass::Instrumented,
        ClassFilter::Reserved => OpClass::Reserved,
    }
}

fn class_name(class: OpClass) -> &'static str {
    match class {
        OpClass::Base => "base",
        OpClass::Specialized => "specialized",
        OpClass::Instrumented => "instrumented",
        OpClass::Reserved => "reserved",
    }
}

fn base_name(registry: &OpcodeRegistry, info: &OpcodeInfo) -> Option<&'static str> {
    info.base.map(|base| registry.info(base).name)
}

fn flags(info: &OpcodeInfo) -> String {
    let mut flags = Vec::new();
    match info.operand {
        Operand::Arg => flags.push("arg"),
        Operand::Prefix => flags.push("prefix"),
        Operand::None => {}
    }
    if info.jump.is_some() {
        flags.push("jump");
    }
    if info.wrapper {
        flags.push("wrapper");
    }
    flags.join(",")
}

fn table_row(registry: &OpcodeRegistry, info: &OpcodeInfo) -> String {
    format!(
        "{:>5}  {:<36}{:<14}{:<24}{}",
        info.value,
        info.name,
        class_name(info.class),
        base_name(registry, info).unwrap_or("-"),
        flags(info)
    )
}

fn to_json(registry: &OpcodeRegistry, info: &OpcodeInfo) -> serde_json::Value {
    json!({
        "value": info.value,
        "name": info.name,
        "class": info.class,
        "base": base_name(registry, info),
        "has_arg": info.operand != Operand::None,
        "jump": info.jump,
        "events": info.events.each().filter_map(|event| event.name()).collect::<Vec<_>>(),
    })
}
