//! Bytecode disassembler
//!
//! Renders a code object one logical instruction per row, with
//! `EXTENDED_ARG` prefixes folded into the operand:
//!
//! ```text
//! Disassembly of <code main> (args=0, locals=1)
//!    1      0    RESUME                             0
//!           1    LOAD_CONST                         0 (10)
//!           2 >> FOR_ITER                           4 (to 7)
//!    2      3   *STORE_FAST                         0
//! ```
//!
//! Columns: source line (when it changes), `>>` on jump targets, offset of
//! the first unit, a marker (`*` specialized, `!` instrumented, `?`
//! unassigned), opcode name, operand and a decoded preview.
//! Used by `quicken dis`.

use super::{decode_slice, CodeObject};
use crate::opcode::{JumpDirection, OpClass, Opcode, OpcodeRegistry, Operand};
use crate::vm::ops::arith::{cmp, nb};
use crate::value::Value;
use std::collections::HashSet;
use std::fmt;

const PREVIEW_LIMIT: usize = 40;

/// Which units to render.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum View {
    /// What the VM executes now, including specialized and instrumented opcodes.
    #[default]
    Live,
    /// As compiled: every rewrite undone.
    Deoptimized,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DisasmOptions {
    pub view: View,
    /// Also render code objects nested in the constants.
    pub nested: bool,
}

impl Default for DisasmOptions {
    fn default() -> Self {
        Self {
            view: View::Live,
            nested: true,
        }
    }
}

/// Disassemble `code` to text.
pub fn disassemble(code: &CodeObject, options: DisasmOptions) -> String {
    Disassembly { code, options }.to_string()
}

struct Disassembly<'a> {
    code: &'a CodeObject,
    options: DisasmOptions,
}

impl fmt::Display for Disassembly<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        render(self.code, self.options, f)?;
        if self.options.nested {
            for nested in self.code.nested() {
                writeln!(f)?;
                write!(
                    f,
                    "{}",
                    Disassembly {
                        code: nested,
                        options: self.options
                    }
                )?;
            }
        }
        Ok(())
    }
}

fn render(code: &CodeObject, options: DisasmOptions, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    let units = match options.view {
        View::Live => code.snapshot(),
        View::Deoptimized => code.deoptimized(),
    };
    let registry = OpcodeRegistry::global();

    writeln!(
        f,
        "Disassembly of <code {}> (args={}, locals={})",
        code.name, code.arg_count, code.local_count
    )?;

    // First pass: instruction starts and jump targets.
    let mut rows = Vec::new();
    let mut offset = 0;
    let mut failure = None;
    while offset < units.len() {
        match decode_slice(&units, offset) {
            Ok(decoded) => {
                offset = decoded.next;
                rows.push(decoded);
            }
            Err(err) => {
                failure = Some(err);
                break;
            }
        }
    }
    let targets: HashSet<usize> = rows
        .iter()
        .filter_map(|row| jump_target(code, row.op, row.arg, row.next, row.site))
        .collect();

    let mut last_line = None;
    for row in &rows {
        let info = registry.info(row.op);
        let line = code.line_at(row.start);
        let line_col = match line {
            Some(n) if line != last_line => n.to_string(),
            _ => String::new(),
        };
        if line.is_some() {
            last_line = line;
        }
        let marker = match info.class {
            OpClass::Base => ' ',
            OpClass::Specialized => '*',
            OpClass::Instrumented => '!',
            OpClass::Reserved => '?',
        };
        let name = if info.class == OpClass::Reserved {
            format!("<{}>", row.op)
        } else {
            info.name.to_string()
        };
        let arg = if info.operand == Operand::None && row.arg == 0 {
            String::new()
        } else {
            row.arg.to_string()
        };
        let detail = describe(code, row.op, row.arg, row.next, row.site)
            .map(|text| format!(" ({text})"))
            .unwrap_or_default();

        writeln!(
            f,
            "{:>4} {:>6} {:2}{}{:<32}{:>4}{}",
            line_col,
            row.start,
            if targets.contains(&row.start) { ">>" } else { "" },
            marker,
            name,
            arg,
            detail
        )?;
    }

    if let Some(err) = failure {
        writeln!(f, "{:>4} {:>6}   <{}>", "", err.offset(), err)?;
    }
    Ok(())
}

/// Opcode whose operand meaning applies at a site: the original for
/// instrumented sites, the base for specialized ones.
fn semantic_opcode(code: &CodeObject, op: u8, site: usize) -> Option<Opcode> {
    let registry = OpcodeRegistry::global();
    let info = registry.info(op);
    let op = match info.class {
        OpClass::Instrumented => code.site(site).original,
        OpClass::Reserved => return None,
        _ => op,
    };
    Opcode::from_u8(op).map(Opcode::base)
}

fn jump_target(code: &CodeObject, op: u8, arg: u32, next: usize, site: usize) -> Option<usize> {
    let registry = OpcodeRegistry::global();
    let info = registry.info(op);
    // Wrappers jump the way the instruction they wrap does.
    let direction = if info.wrapper {
        registry.info(code.site(site).original).jump
    } else {
        info.jump
    };
    match direction? {
        JumpDirection::Forward => next.checked_add(arg as usize),
        JumpDirection::Backward => next.checked_sub(arg as usize),
    }
}

fn preview(value: &Value) -> String {
    let text = value.repr();
    if text.chars().count() > PREVIEW_LIMIT {
        let cut: String = text.chars().take(PREVIEW_LIMIT - 3).collect();
        format!("{cut}...")
    } else {
        text
    }
}

fn describe(code: &CodeObject, op: u8, arg: u32, next: usize, site: usize) -> Option<String> {
    use Opcode::*;

    let info = OpcodeRegistry::global().info(op);
    if info.wrapper {
        let original = code.site(site).original;
        return Some(format!(
            "wraps {}",
            OpcodeRegistry::global().info(original).name
        ));
    }
    let semantic = semantic_opcode(code, op, site)?;
    let name = |index: usize| code.names.get(index).map(|n| n.to_string());
    Some(match semantic {
        LoadConst | ReturnConst => preview(code.constants.get(arg as usize)?),
        LoadGlobal if arg & 1 == 1 => format!("NULL + {}", name(arg as usize >> 1)?),
        LoadGlobal => name(arg as usize >> 1)?,
        StoreGlobal | DeleteGlobal => name(arg as usize)?,
        LoadFastLoadFast | StoreFastLoadFast | StoreFastStoreFast => {
            format!("{}, {}", arg >> 4, arg & 0xF)
        }
        BinaryOp => nb::symbol(arg)?,
        CompareOp => {
            let symbol = cmp::symbol(arg >> 5)?;
            if arg & cmp::COERCE_BOOL != 0 {
                format!("bool({symbol})")
            } else {
                symbol.to_string()
            }
        }
        IsOp => (if arg == 1 { "is not" } else { "is" }).to_string(),
        ContainsOp => (if arg == 1 { "not in" } else { "in" }).to_string(),
        _ => {
            let target = jump_target(code, op, arg, next, site)?;
            format!("to {target}")
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bytecode::unit;
    use std::sync::Arc;

    fn sample() -> Arc<CodeObject> {
        CodeObject::builder("main")
            .locals(1)
            .constant(Value::list(Vec::new()))
            .constant("a long string constant that will not fit in the preview column")
            .name("len")
            .line(1)
            .op(Opcode::Resume, 0)
            .op(Opcode::LoadGlobal, 1)
            .op(Opcode::LoadConst, 1)
            .op(Opcode::Call, 1)
            .line(2)
            .op(Opcode::StoreFast, 0)
            .op(Opcode::LoadFast, 0)
            .op(Opcode::LoadFast, 0)
            .op(Opcode::CompareOp, (cmp::GT << 5) | cmp::COERCE_BOOL)
            .op(Opcode::PopJumpIfFalse, 0x101)
            .op(Opcode::ReturnConst, 0)
            .build()
    }

    #[test]
    fn test_columns_and_previews() {
        let text = disassemble(&sample(), DisasmOptions::default());
        let lines: Vec<&str> = text.lines().collect();
        assert_eq!(lines[0], "Disassembly of <code main> (args=0, locals=1)");
        assert!(lines[1].starts_with("   1      0  "));
        assert!(lines[2].contains("LOAD_GLOBAL") && lines[2].ends_with("(NULL + len)"));
        assert!(lines[3].contains("'a long string constant that will not..."));
        assert!(lines[5].starts_with("   2"));
        assert!(lines[8].ends_with("(bool(>))"));
        // prefix folded into one row
        assert!(lines[9].contains("POP_JUMP_IF_FALSE") && lines[9].contains(" 257 (to 267)"));
        assert_eq!(lines.len(), 11);
    }

    #[test]
    fn test_markers_for_rewritten_sites() {
        let code = sample();
        assert!(code.rewrite(3, Opcode::Call as u8, Opcode::CallNoKwLen as u8));
        let live = disassemble(&code, DisasmOptions::default());
        assert!(live.lines().any(|l| l.contains("*CALL_NO_KW_LEN")));

        let deopt = disassemble(
            &code,
            DisasmOptions {
                view: View::Deoptimized,
                nested: false,
            },
        );
        assert!(!deopt.contains('*'));
        assert!(deopt.lines().any(|l| l.contains(" CALL ")));
    }

    #[test]
    fn test_jump_targets_are_marked() {
        let code = CodeObject::builder("loop")
            .op(Opcode::Nop, 0)
            .op(Opcode::JumpBackward, 2)
            .build();
        let text = disassemble(&code, DisasmOptions::default());
        assert!(text.lines().nth(1).unwrap().contains(">> NOP"));
        assert!(text.contains("(to 0)"));
    }

    #[test]
    fn test_unknown_opcode_and_decode_failure() {
        let code = CodeObject::builder("bad")
            .raw(&[unit(255, 0), unit(Opcode::ExtendedArg as u8, 1)])
            .build();
        let text = disassemble(&code, DisasmOptions::default());
        assert!(text.contains("?<255>"));
        assert!(text.contains("EXTENDED_ARG at offset 1 is not followed by an instruction"));
    }

    #[test]
    fn test_nested_code_is_rendered() {
        let inner = CodeObject::builder("inner").op(Opcode::ReturnConst, 0).build();
        let outer = CodeObject::builder("outer")
            .constant(Value::Code(inner))
            .op(Opcode::ReturnConst, 0)
            .build();
        let text = disassemble(&outer, DisasmOptions::default());
        assert!(text.contains("(<code object inner>)"));
        assert!(text.contains("Disassembly of <code inner>"));
    }
}
