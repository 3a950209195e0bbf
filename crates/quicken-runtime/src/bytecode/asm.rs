//! Text assembler
//!
//! Source is a sequence of code blocks:
//!
//! ```text
//! ; add two numbers
//! .code add
//! .args 2
//!     LOAD_FAST_LOAD_FAST 0x01
//!     BINARY_OP +
//!     RETURN_VALUE
//! .end
//!
//! .code main
//! .const code add
//! .const 2
//! .const 40
//! .line 1
//!     LOAD_CONST 0
//!     MAKE_FUNCTION
//!     PUSH_NULL
//!     LOAD_CONST 1
//!     LOAD_CONST 2
//!     CALL 2
//!     RETURN_VALUE
//! .end
//! ```
//!
//! Directives: `.code NAME` / `.end`, `.args N`, `.locals N`, `.const VALUE`,
//! `.name IDENT`, `.line N`. Labels (`loop:`) mark instruction starts and are
//! referenced as `@loop` by jump opcodes; the assembler turns them into
//! relative offsets and sizes `EXTENDED_ARG` prefixes to a fixed point.
//! `BINARY_OP` takes operator symbols (`+`, `//`, `+=`) and `COMPARE_OP`
//! takes comparison symbols (`<`, `==`), optionally prefixed with `bool`.
//!
//! A `.const code NAME` refers to a block defined earlier in the file. The
//! entry point is the block named `main`, or the first block.

use super::extended_arg::prefix_count;
use super::CodeObject;
use crate::opcode::{JumpDirection, OpClass, Opcode, OpcodeRegistry, HAVE_ARGUMENT};
use crate::value::Value;
use crate::vm::ops::arith::{cmp, nb};
use std::collections::HashMap;
use std::sync::Arc;
use thiserror::Error;

/// An assembly error with the 1-based source line where it was detected.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("line {line}: {kind}")]
pub struct AsmError {
    pub line: usize,
    pub kind: AsmErrorKind,
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum AsmErrorKind {
    #[error("unknown directive '{0}'")]
    UnknownDirective(String),

    #[error("directive {directive} expects {expected}, found '{found}'")]
    BadDirectiveArgument {
        directive: &'static str,
        expected: &'static str,
        found: String,
    },

    #[error("unknown opcode '{0}'")]
    UnknownOpcode(String),

    #[error("{0} is produced at runtime and cannot be assembled")]
    NotBaseOpcode(&'static str),

    #[error("EXTENDED_ARG is emitted automatically")]
    ExplicitExtendedArg,

    #[error("{0} takes no operand")]
    UnexpectedOperand(&'static str),

    #[error("invalid operand '{operand}' for {op}")]
    InvalidOperand { op: &'static str, operand: String },

    #[error("{0} is not a jump and cannot take a label")]
    NotAJump(&'static str),

    #[error("label '{0}' is not defined")]
    UndefinedLabel(String),

    #[error("label '{0}' is defined twice")]
    DuplicateLabel(String),

    #[error("label '{label}' is behind a forward jump or ahead of a backward jump")]
    WrongDirection { label: String },

    #[error("invalid constant '{0}'")]
    InvalidConstant(String),

    #[error("code block '{0}' is not defined before this point")]
    UnknownCode(String),

    #[error("code block '{0}' is defined twice")]
    DuplicateCode(String),

    #[error("instruction or directive outside a .code block")]
    OutsideBlock,

    #[error(".code inside block '{0}' (missing .end)")]
    NestedBlock(String),

    #[error("block '{0}' is missing .end")]
    UnterminatedBlock(String),

    #[error("no code blocks")]
    Empty,
}

/// Assemble `source` and return the entry code object.
pub fn assemble(source: &str) -> Result<Arc<CodeObject>, AsmError> {
    let mut codes: HashMap<String, Arc<CodeObject>> = HashMap::new();
    let mut order: Vec<String> = Vec::new();
    let mut block: Option<Block> = None;
    let mut last_line = 0;

    for (index, raw) in source.lines().enumerate() {
        let line = index + 1;
        last_line = line;
        let text = strip_comment(raw).trim();
        if text.is_empty() {
            continue;
        }
        let at = |kind| AsmError { line, kind };

        if let Some(directive) = text.strip_prefix('.') {
            let (name, rest) = split_word(directive);
            match name {
                "code" => {
                    if let Some(open) = &block {
                        return Err(at(AsmErrorKind::NestedBlock(open.name.clone())));
                    }
                    let name = identifier("code", rest).map_err(at)?;
                    if codes.contains_key(name) {
                        return Err(at(AsmErrorKind::DuplicateCode(name.to_string())));
                    }
                    block = Some(Block::new(name));
                }
                "end" => {
                    let done = block.take().ok_or(at(AsmErrorKind::OutsideBlock))?;
                    let name = done.name.clone();
                    let code = done.finish()?;
                    order.push(name.clone());
                    codes.insert(name, code);
                }
                _ => {
                    let open = block.as_mut().ok_or(at(AsmErrorKind::OutsideBlock))?;
                    open.directive(name, rest, &codes).map_err(at)?;
                }
            }
            continue;
        }

        let open = block.as_mut().ok_or(at(AsmErrorKind::OutsideBlock))?;
        open.statement(text, line).map_err(at)?;
    }

    if let Some(open) = block {
        return Err(AsmError {
            line: last_line,
            kind: AsmErrorKind::UnterminatedBlock(open.name),
        });
    }

    let entry = if codes.contains_key("main") {
        "main"
    } else {
        order.first().map(String::as_str).ok_or(AsmError {
            line: last_line,
            kind: AsmErrorKind::Empty,
        })?
    };
    codes.remove(entry).ok_or(AsmError {
        line: last_line,
        kind: AsmErrorKind::Empty,
    })
}

fn strip_comment(line: &str) -> &str {
    // `;` and `#` start comments, except inside string constants
    let mut in_string = false;
    let mut escaped = false;
    for (i, c) in line.char_indices() {
        match c {
            _ if escaped => escaped = false,
            '\\' if in_string => escaped = true,
            '"' => in_string = !in_string,
            ';' | '#' if !in_string => return &line[..i],
            _ => {}
        }
    }
    line
}

fn split_word(text: &str) -> (&str, &str) {
    match text.find(char::is_whitespace) {
        Some(i) => (&text[..i], text[i..].trim()),
        None => (text, ""),
    }
}

fn identifier<'a>(directive: &'static str, text: &'a str) -> Result<&'a str, AsmErrorKind> {
    let valid = !text.is_empty()
        && !text.starts_with(|c: char| c.is_ascii_digit())
        && text.chars().all(|c| c.is_alphanumeric() || c == '_');
    if valid {
        Ok(text)
    } else {
        Err(AsmErrorKind::BadDirectiveArgument {
            directive,
            expected: "an identifier",
            found: text.to_string(),
        })
    }
}

fn count(directive: &'static str, text: &str) -> Result<u32, AsmErrorKind> {
    parse_int(text)
        .and_then(|n| u32::try_from(n).ok())
        .ok_or_else(|| AsmErrorKind::BadDirectiveArgument {
            directive,
            expected: "a non-negative integer",
            found: text.to_string(),
        })
}

fn parse_int(text: &str) -> Option<i64> {
    let (negative, digits) = match text.strip_prefix('-') {
        Some(rest) => (true, rest),
        None => (false, text),
    };
    let digits = digits.replace('_', "");
    let value = if let Some(hex) = digits.strip_prefix("0x").or_else(|| digits.strip_prefix("0X")) {
        i64::from_str_radix(hex, 16).ok()?
    } else if !digits.is_empty() && digits.chars().all(|c| c.is_ascii_digit()) {
        digits.parse().ok()?
    } else {
        return None;
    };
    Some(if negative { -value } else { value })
}

// ============================================================================
// Blocks
// ============================================================================

#[derive(Debug, Clone)]
enum Operand {
    Value(u32),
    Label(String),
}

#[derive(Debug, Clone)]
struct Statement {
    line: usize,
    source_line: u32,
    op: Opcode,
    operand: Operand,
}

#[derive(Debug)]
struct Block {
    name: String,
    args: u32,
    locals: u32,
    constants: Vec<Value>,
    names: Vec<Arc<str>>,
    /// Current `.line` value.
    source_line: u32,
    statements: Vec<Statement>,
    /// Label -> index of the statement it precedes.
    labels: HashMap<String, usize>,
}

impl Block {
    fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
            args: 0,
            locals: 0,
            constants: Vec::new(),
            names: Vec::new(),
            source_line: 0,
            statements: Vec::new(),
            labels: HashMap::new(),
        }
    }

    fn directive(
        &mut self,
        name: &str,
        rest: &str,
        codes: &HashMap<String, Arc<CodeObject>>,
    ) -> Result<(), AsmErrorKind> {
        match name {
            "args" => self.args = count("args", rest)?,
            "locals" => self.locals = count("locals", rest)?,
            "line" => self.source_line = count("line", rest)?,
            "name" => self.names.push(Arc::from(identifier("name", rest)?)),
            "const" => self.constants.push(parse_constant(rest, codes)?),
            other => return Err(AsmErrorKind::UnknownDirective(format!(".{other}"))),
        }
        Ok(())
    }

    fn statement(&mut self, text: &str, line: usize) -> Result<(), AsmErrorKind> {
        let mut text = text;
        // Any number of labels may precede an instruction on the same line.
        while let Some(colon) = text.find(':') {
            let (label, rest) = text.split_at(colon);
            let label = label.trim();
            if label.is_empty() || !label.chars().all(|c| c.is_alphanumeric() || c == '_') {
                break;
            }
            if self
                .labels
                .insert(label.to_string(), self.statements.len())
                .is_some()
            {
                return Err(AsmErrorKind::DuplicateLabel(label.to_string()));
            }
            text = rest[1..].trim();
        }
        if text.is_empty() {
            return Ok(());
        }

        let (mnemonic, operand_text) = split_word(text);
        let op = parse_opcode(mnemonic)?;
        let operand = parse_operand(op, operand_text)?;
        self.statements.push(Statement {
            line,
            source_line: self.source_line,
            op,
            operand,
        });
        Ok(())
    }

    /// Resolve labels and build the code object.
    fn finish(self) -> Result<Arc<CodeObject>, AsmError> {
        let args = self.resolve_operands()?;
        let mut builder = CodeObject::builder(self.name.as_str())
            .args(self.args)
            .locals(self.locals);
        for constant in self.constants {
            builder = builder.constant(constant);
        }
        for name in self.names {
            builder = builder.name(name);
        }
        for (statement, arg) in self.statements.iter().zip(args) {
            builder = builder.line(statement.source_line).op(statement.op, arg);
        }
        Ok(builder.build())
    }

    /// Final operand of every statement. Label operands depend on the size of
    /// the code between jump and target, which depends on the operands, so
    /// sizes are iterated until they stop growing.
    fn resolve_operands(&self) -> Result<Vec<u32>, AsmError> {
        let mut sizes = vec![1usize; self.statements.len()];
        loop {
            let mut starts = Vec::with_capacity(sizes.len() + 1);
            let mut offset = 0;
            for size in &sizes {
                starts.push(offset);
                offset += size;
            }
            starts.push(offset);

            let mut args = Vec::with_capacity(self.statements.len());
            let mut changed = false;
            for (index, statement) in self.statements.iter().enumerate() {
                let arg = match &statement.operand {
                    Operand::Value(value) => *value,
                    Operand::Label(label) => self.relative(statement, label, &starts, index)?,
                };
                let size = prefix_count(arg) + 1;
                if size > sizes[index] {
                    sizes[index] = size;
                    changed = true;
                }
                args.push(arg);
            }
            if !changed {
                return Ok(args);
            }
        }
    }

    fn relative(
        &self,
        statement: &Statement,
        label: &str,
        starts: &[usize],
        index: usize,
    ) -> Result<u32, AsmError> {
        let at = |kind| AsmError {
            line: statement.line,
            kind,
        };
        let &target_index = self
            .labels
            .get(label)
            .ok_or_else(|| at(AsmErrorKind::UndefinedLabel(label.to_string())))?;
        let target = starts[target_index];
        let next = starts[index + 1];
        let delta = match statement.op.jump() {
            Some(JumpDirection::Forward) => target.checked_sub(next),
            Some(JumpDirection::Backward) => next.checked_sub(target),
            None => return Err(at(AsmErrorKind::NotAJump(statement.op.name()))),
        };
        delta
            .and_then(|d| u32::try_from(d).ok())
            .ok_or_else(|| {
                at(AsmErrorKind::WrongDirection {
                    label: label.to_string(),
                })
            })
    }
}

fn parse_opcode(mnemonic: &str) -> Result<Opcode, AsmErrorKind> {
    let upper = mnemonic.to_ascii_uppercase();
    let info = OpcodeRegistry::global()
        .lookup(&upper)
        .ok_or_else(|| AsmErrorKind::UnknownOpcode(mnemonic.to_string()))?;
    let op = info
        .opcode()
        .ok_or_else(|| AsmErrorKind::UnknownOpcode(mnemonic.to_string()))?;
    if op == Opcode::ExtendedArg {
        return Err(AsmErrorKind::ExplicitExtendedArg);
    }
    if info.class != OpClass::Base {
        return Err(AsmErrorKind::NotBaseOpcode(info.name));
    }
    Ok(op)
}

fn parse_operand(op: Opcode, text: &str) -> Result<Operand, AsmErrorKind> {
    if text.is_empty() {
        return Ok(Operand::Value(0));
    }
    if (op as u8) < HAVE_ARGUMENT {
        return Err(AsmErrorKind::UnexpectedOperand(op.name()));
    }
    let invalid = || AsmErrorKind::InvalidOperand {
        op: op.name(),
        operand: text.to_string(),
    };
    if let Some(label) = text.strip_prefix('@') {
        if op.jump().is_none() {
            return Err(AsmErrorKind::NotAJump(op.name()));
        }
        return Ok(Operand::Label(label.to_string()));
    }
    if let Some(n) = parse_int(text) {
        return u32::try_from(n).map(Operand::Value).map_err(|_| invalid());
    }
    let symbolic = match op {
        Opcode::BinaryOp => nb::from_symbol(text),
        Opcode::CompareOp => match text.strip_prefix("bool") {
            Some(rest) => cmp::from_symbol(rest.trim()).map(|k| (k << 5) | cmp::COERCE_BOOL),
            None => cmp::from_symbol(text).map(|k| k << 5),
        },
        _ => None,
    };
    symbolic.map(Operand::Value).ok_or_else(invalid)
}

// ============================================================================
// Constants
// ============================================================================

fn parse_constant(
    text: &str,
    codes: &HashMap<String, Arc<CodeObject>>,
) -> Result<Value, AsmErrorKind> {
    if let Some(name) = text.strip_prefix("code ") {
        let name = name.trim();
        return codes
            .get(name)
            .map(|code| Value::Code(Arc::clone(code)))
            .ok_or_else(|| AsmErrorKind::UnknownCode(name.to_string()));
    }
    let mut parser = ConstParser {
        text,
        chars: text.char_indices().peekable(),
    };
    let value = parser.value()?;
    parser.skip_space();
    if parser.chars.peek().is_some() {
        return Err(AsmErrorKind::InvalidConstant(text.to_string()));
    }
    Ok(value)
}

struct ConstParser<'a> {
    text: &'a str,
    chars: std::iter::Peekable<std::str::CharIndices<'a>>,
}

impl ConstParser<'_> {
    fn error(&self) -> AsmErrorKind {
        AsmErrorKind::InvalidConstant(self.text.to_string())
    }

    fn skip_space(&mut self) {
        while matches!(self.chars.peek(), Some((_, c)) if c.is_whitespace()) {
            self.chars.next();
        }
    }

    fn value(&mut self) -> Result<Value, AsmErrorKind> {
        self.skip_space();
        match self.chars.peek().copied() {
            Some((_, '"')) => self.string(),
            Some((_, '(')) => self.tuple(),
            Some((start, _)) => {
                let mut end = self.text.len();
                while let Some(&(i, c)) = self.chars.peek() {
                    if c == ',' || c == ')' || c.is_whitespace() {
                        end = i;
                        break;
                    }
                    self.chars.next();
                }
                scalar(&self.text[start..end]).ok_or_else(|| self.error())
            }
            None => Err(self.error()),
        }
    }

    fn string(&mut self) -> Result<Value, AsmErrorKind> {
        self.chars.next();
        let mut out = String::new();
        loop {
            let (_, c) = self.chars.next().ok_or_else(|| self.error())?;
            match c {
                '"' => return Ok(Value::str(out)),
                '\\' => {
                    let (_, escaped) = self.chars.next().ok_or_else(|| self.error())?;
                    out.push(match escaped {
                        'n' => '\n',
                        't' => '\t',
                        'r' => '\r',
                        '0' => '\0',
                        '\\' | '"' | '\'' => escaped,
                        _ => return Err(self.error()),
                    });
                }
                _ => out.push(c),
            }
        }
    }

    fn tuple(&mut self) -> Result<Value, AsmErrorKind> {
        self.chars.next();
        let mut items = Vec::new();
        loop {
            self.skip_space();
            if let Some((_, ')')) = self.chars.peek() {
                self.chars.next();
                return Ok(Value::tuple(items));
            }
            items.push(self.value()?);
            self.skip_space();
            match self.chars.next() {
                Some((_, ',')) => {}
                Some((_, ')')) => return Ok(Value::tuple(items)),
                _ => return Err(self.error()),
            }
        }
    }
}

fn scalar(token: &str) -> Option<Value> {
    match token {
        "None" => return Some(Value::None),
        "True" => return Some(Value::Bool(true)),
        "False" => return Some(Value::Bool(false)),
        "inf" => return Some(Value::Float(f64::INFINITY)),
        "-inf" => return Some(Value::Float(f64::NEG_INFINITY)),
        "nan" => return Some(Value::Float(f64::NAN)),
        _ => {}
    }
    if let Some(n) = parse_int(token) {
        return Some(Value::Int(n));
    }
    let looks_float = token.contains(|c| matches!(c, '.' | 'e' | 'E'))
        && token
            .chars()
            .all(|c| c.is_ascii_digit() || matches!(c, '.' | 'e' | 'E' | '-' | '+' | '_'));
    if looks_float {
        return token.replace('_', "").parse().ok().map(Value::Float);
    }
    None
}
