//! Binary code object format (`.qbc`)
//!
//! All integers are big-endian.
//!
//! ```text
//! header   "QBC\0"  u16 registry magic  u16 flags (bit 0: line tables present)
//! code     str name  u32 args  u32 locals
//!          u32 n  constant * n
//!          u32 n  str * n              (global names)
//!          u32 n  u16 * n              (code units)
//!          [u32 * units]               (line table, when flag bit 0 is set)
//! str      u32 len  utf-8 bytes
//! constant u8 tag, then: 0 None | 1 True | 2 False | 3 i64 | 4 f64 | 5 str
//!          | 6 code | 7 u32 n constant * n (tuple)
//! ```
//!
//! Units are written in their as-compiled form: specialized and instrumented
//! opcodes never reach the file. Every loaded code object is validated.

use super::{validate, CodeObject, ValidationError};
use crate::opcode::MAGIC_NUMBER;
use crate::value::Value;
use std::path::Path;
use std::sync::Arc;
use thiserror::Error;

const FILE_MAGIC: &[u8; 4] = b"QBC\0";
const FLAG_LINES: u16 = 1;
/// Nested code objects deeper than this are rejected.
const MAX_NESTING: usize = 64;

const TAG_NONE: u8 = 0;
const TAG_TRUE: u8 = 1;
const TAG_FALSE: u8 = 2;
const TAG_INT: u8 = 3;
const TAG_FLOAT: u8 = 4;
const TAG_STR: u8 = 5;
const TAG_CODE: u8 = 6;
const TAG_TUPLE: u8 = 7;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SaveError {
    #[error("constants of type '{0}' cannot be serialized")]
    Unserializable(&'static str),

    #[error("I/O error: {0}")]
    Io(String),
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum LoadError {
    #[error("bad magic number: this is not a quicken bytecode file")]
    BadMagic,

    #[error("bytecode was built for opcode table {found}, this VM uses {expected}; reassemble the source")]
    VersionMismatch { found: u16, expected: u16 },

    #[error("bytecode truncated while reading {0}")]
    Truncated(&'static str),

    #[error("invalid UTF-8 in {0}")]
    InvalidUtf8(&'static str),

    #[error("unknown constant tag {0:#04x}")]
    UnknownConstTag(u8),

    #[error("code objects nested more than {} deep", MAX_NESTING)]
    NestingTooDeep,

    #[error("{0} trailing bytes after the code object")]
    TrailingBytes(usize),

    #[error("code object '{code}' failed validation: {}", join_errors(.errors))]
    Invalid {
        code: String,
        errors: Vec<ValidationError>,
    },

    #[error("I/O error: {0}")]
    Io(String),
}

fn join_errors(errors: &[ValidationError]) -> String {
    errors
        .iter()
        .map(ToString::to_string)
        .collect::<Vec<_>>()
        .join("; ")
}

// ============================================================================
// Writing
// ============================================================================

/// Serialize `code` and everything nested in its constants.
pub fn to_bytes(code: &CodeObject) -> Result<Vec<u8>, SaveError> {
    let mut bytes = Vec::new();
    bytes.extend_from_slice(FILE_MAGIC);
    bytes.extend_from_slice(&MAGIC_NUMBER.to_be_bytes());
    bytes.extend_from_slice(&FLAG_LINES.to_be_bytes());
    write_code(code, &mut bytes)?;
    Ok(bytes)
}

pub fn save(code: &CodeObject, path: &Path) -> Result<(), SaveError> {
    let bytes = to_bytes(code)?;
    std::fs::write(path, bytes).map_err(|e| SaveError::Io(e.to_string()))
}

fn write_str(s: &str, bytes: &mut Vec<u8>) {
    bytes.extend_from_slice(&(s.len() as u32).to_be_bytes());
    bytes.extend_from_slice(s.as_bytes());
}

fn write_code(code: &CodeObject, bytes: &mut Vec<u8>) -> Result<(), SaveError> {
    write_str(&code.name, bytes);
    bytes.extend_from_slice(&code.arg_count.to_be_bytes());
    bytes.extend_from_slice(&code.local_count.to_be_bytes());

    bytes.extend_from_slice(&(code.constants.len() as u32).to_be_bytes());
    for constant in &code.constants {
        write_constant(constant, bytes)?;
    }

    bytes.extend_from_slice(&(code.names.len() as u32).to_be_bytes());
    for name in &code.names {
        write_str(name, bytes);
    }

    let units = code.deoptimized();
    bytes.extend_from_slice(&(units.len() as u32).to_be_bytes());
    for unit in &units {
        bytes.extend_from_slice(&unit.to_be_bytes());
    }
    for index in 0..units.len() {
        let line = code.lines.get(index).copied().unwrap_or(0);
        bytes.extend_from_slice(&line.to_be_bytes());
    }
    Ok(())
}

fn write_constant(value: &Value, bytes: &mut Vec<u8>) -> Result<(), SaveError> {
    match value {
        Value::None => bytes.push(TAG_NONE),
        Value::Bool(true) => bytes.push(TAG_TRUE),
        Value::Bool(false) => bytes.push(TAG_FALSE),
        Value::Int(n) => {
            bytes.push(TAG_INT);
            bytes.extend_from_slice(&n.to_be_bytes());
        }
        Value::Float(x) => {
            bytes.push(TAG_FLOAT);
            bytes.extend_from_slice(&x.to_be_bytes());
        }
        Value::Str(s) => {
            bytes.push(TAG_STR);
            write_str(s, bytes);
        }
        Value::Code(code) => {
            bytes.push(TAG_CODE);
            write_code(code, bytes)?;
        }
        Value::Tuple(items) => {
            bytes.push(TAG_TUPLE);
            bytes.extend_from_slice(&(items.len() as u32).to_be_bytes());
            for item in items.iter() {
                write_constant(item, bytes)?;
            }
        }
        // Runtime-only values
        other => return Err(SaveError::Unserializable(other.type_name())),
    }
    Ok(())
}

// ============================================================================
// Reading
// ============================================================================

/// Deserialize and validate a code object.
pub fn from_bytes(bytes: &[u8]) -> Result<Arc<CodeObject>, LoadError> {
    let mut reader = Reader { bytes, pos: 0 };
    if reader.take(4, "header")? != FILE_MAGIC {
        return Err(LoadError::BadMagic);
    }
    let found = reader.u16("header")?;
    if found != MAGIC_NUMBER {
        return Err(LoadError::VersionMismatch {
            found,
            expected: MAGIC_NUMBER,
        });
    }
    let flags = reader.u16("header")?;
    let code = reader.code(flags & FLAG_LINES != 0, 0)?;
    let trailing = bytes.len() - reader.pos;
    if trailing != 0 {
        return Err(LoadError::TrailingBytes(trailing));
    }
    Ok(code)
}

pub fn load(path: &Path) -> Result<Arc<CodeObject>, LoadError> {
    let bytes = std::fs::read(path).map_err(|e| LoadError::Io(e.to_string()))?;
    from_bytes(&bytes)
}

struct Reader<'a> {
    bytes: &'a [u8],
    pos: usize,
}

impl<'a> Reader<'a> {
    fn take(&mut self, len: usize, what: &'static str) -> Result<&'a [u8], LoadError> {
        let end = self
            .pos
            .checked_add(len)
            .filter(|&end| end <= self.bytes.len())
            .ok_or(LoadError::Truncated(what))?;
        let slice = &self.bytes[self.pos..end];
        self.pos = end;
        Ok(slice)
    }

    fn array<const N: usize>(&mut self, what: &'static str) -> Result<[u8; N], LoadError> {
        let mut out = [0u8; N];
        out.copy_from_slice(self.take(N, what)?);
        Ok(out)
    }

    fn u8(&mut self, what: &'static str) -> Result<u8, LoadError> {
        Ok(self.array::<1>(what)?[0])
    }

    fn u16(&mut self, what: &'static str) -> Result<u16, LoadError> {
        self.array(what).map(u16::from_be_bytes)
    }

    fn u32(&mut self, what: &'static str) -> Result<u32, LoadError> {
        self.array(what).map(u32::from_be_bytes)
    }

    /// A count that must be satisfiable by the bytes left, at `min` bytes each.
    fn count(&mut self, min: usize, what: &'static str) -> Result<usize, LoadError> {
        let n = self.u32(what)? as usize;
        if n.saturating_mul(min) > self.bytes.len() - self.pos {
            return Err(LoadError::Truncated(what));
        }
        Ok(n)
    }

    fn str(&mut self, what: &'static str) -> Result<Arc<str>, LoadError> {
        let len = self.u32(what)? as usize;
        let raw = self.take(len, what)?;
        std::str::from_utf8(raw)
            .map(Arc::from)
            .map_err(|_| LoadError::InvalidUtf8(what))
    }

    fn code(&mut self, lines: bool, depth: usize) -> Result<Arc<CodeObject>, LoadError> {
        if depth > MAX_NESTING {
            return Err(LoadError::NestingTooDeep);
        }
        let name = self.str("code name")?;
        let args = self.u32("argument count")?;
        let locals = self.u32("local count")?;

        let mut builder = CodeObject::builder(Arc::clone(&name)).args(args).locals(locals);
        let constant_count = self.count(1, "constants")?;
        for _ in 0..constant_count {
            builder = builder.constant(self.constant(lines, depth)?);
        }
        let name_count = self.count(4, "names")?;
        for _ in 0..name_count {
            builder = builder.name(self.str("global name")?);
        }
        let unit_count = self.count(2, "code units")?;
        let mut units = Vec::with_capacity(unit_count);
        for _ in 0..unit_count {
            units.push(self.u16("code units")?);
        }
        builder = builder.raw(&units);
        if lines {
            let mut table = Vec::with_capacity(unit_count);
            for _ in 0..unit_count {
                table.push(self.u32("line table")?);
            }
            builder = builder.with_lines(table);
        }

        let code = builder.build();
        validate(&code).map_err(|errors| LoadError::Invalid {
            code: name.to_string(),
            errors,
        })?;
        Ok(code)
    }

    fn constant(&mut self, lines: bool, depth: usize) -> Result<Value, LoadError> {
        Ok(match self.u8("constant tag")? {
            TAG_NONE => Value::None,
            TAG_TRUE => Value::Bool(true),
            TAG_FALSE => Value::Bool(false),
            TAG_INT => Value::Int(self.array("int constant").map(i64::from_be_bytes)?),
            TAG_FLOAT => Value::Float(self.array("float constant").map(f64::from_be_bytes)?),
            TAG_STR => Value::Str(self.str("string constant")?),
            TAG_CODE => Value::Code(self.code(lines, depth + 1)?),
            TAG_TUPLE => {
                if depth > MAX_NESTING {
                    return Err(LoadError::NestingTooDeep);
                }
                let count = self.count(1, "tuple constant")?;
                let mut items = Vec::with_capacity(count);
                for _ in 0..count {
                    items.push(self.constant(lines, depth + 1)?);
                }
                Value::tuple(items)
            }
            tag => return Err(LoadError::UnknownConstTag(tag)),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bytecode::{unit, ValidationErrorKind};
    use crate::opcode::Opcode;
    use crate::vm::Vm;
    use pretty_assertions::assert_eq;

    fn program() -> Arc<CodeObject> {
        let square = CodeObject::builder("square")
            .args(1)
            .line(2)
            .op(Opcode::LoadFast, 0)
            .op(Opcode::LoadFast, 0)
            .op(Opcode::BinaryOp, 5)
            .op(Opcode::ReturnValue, 0)
            .build();
        CodeObject::builder("main")
            .constant(Value::Code(square))
            .constant(-7i64)
            .constant(Value::tuple(vec![Value::str("é"), Value::Float(0.5), Value::None]))
            .name("unused")
            .line(1)
            .op(Opcode::LoadConst, 0)
            .op(Opcode::MakeFunction, 0)
            .op(Opcode::PushNull, 0)
            .op(Opcode::LoadConst, 1)
            .op(Opcode::Call, 1)
            .op(Opcode::ReturnValue, 0)
            .build()
    }

    #[test]
    fn test_program_survives_a_save_and_load() {
        let original = program();
        let loaded = from_bytes(&to_bytes(&original).unwrap()).unwrap();
        assert_eq!(loaded.snapshot(), original.snapshot());
        assert_eq!(&loaded.constants[1..], &original.constants[1..]);
        assert_eq!(loaded.names, original.names);
        assert_eq!(loaded.lines, original.lines);
        let Value::Code(nested) = &loaded.constants[0] else {
            panic!("expected a nested code object");
        };
        assert_eq!(&*nested.name, "square");
        assert_eq!(nested.arg_count, 1);
        assert_eq!(nested.line_at(0), Some(2));
        assert_eq!(Vm::new().run(loaded), Ok(Value::Int(49)));
    }

    #[test]
    fn test_specialized_units_are_written_as_compiled() {
        let code = program();
        assert!(code.rewrite(4, Opcode::Call as u8, Opcode::CallPyExactArgs as u8));
        let loaded = from_bytes(&to_bytes(&code).unwrap()).unwrap();
        assert_eq!(loaded.snapshot()[4], unit(Opcode::Call as u8, 1));
    }

    #[test]
    fn test_header_errors() {
        let bytes = to_bytes(&program()).unwrap();

        let mut wrong_magic = bytes.clone();
        wrong_magic[0] = b'X';
        assert!(matches!(from_bytes(&wrong_magic), Err(LoadError::BadMagic)));

        let mut wrong_table = bytes.clone();
        wrong_table[4..6].copy_from_slice(&(MAGIC_NUMBER + 1).to_be_bytes());
        assert!(matches!(
            from_bytes(&wrong_table),
            Err(LoadError::VersionMismatch { found, expected: MAGIC_NUMBER }) if found == MAGIC_NUMBER + 1
        ));

        assert!(matches!(
            from_bytes(&bytes[..bytes.len() - 1]),
            Err(LoadError::Truncated(_))
        ));
        assert!(matches!(from_bytes(b"QB"), Err(LoadError::Truncated("header"))));
    }

    #[test]
    fn test_unknown_tag_and_bad_utf8() {
        let code = CodeObject::builder("m")
            .constant("ab")
            .op(Opcode::ReturnConst, 0)
            .build();
        let bytes = to_bytes(&code).unwrap();
        // header (8) + name (4 + 1) + args + locals (8) + count (4) = 25
        let mut bad_tag = bytes.clone();
        bad_tag[25] = 0x42;
        assert!(matches!(from_bytes(&bad_tag), Err(LoadError::UnknownConstTag(0x42))));

        let mut bad_utf8 = bytes;
        bad_utf8[30] = 0xff;
        assert!(matches!(
            from_bytes(&bad_utf8),
            Err(LoadError::InvalidUtf8("string constant"))
        ));
    }

    #[test]
    fn test_invalid_code_is_rejected() {
        let code = CodeObject::builder("broken")
            .op(Opcode::PopTop, 0)
            .op(Opcode::ReturnConst, 0)
            .build();
        match from_bytes(&to_bytes(&code).unwrap()) {
            Err(LoadError::Invalid { code, errors }) => {
                assert_eq!(code, "broken");
                assert!(errors.iter().any(|e| matches!(
                    e.kind,
                    ValidationErrorKind::StackUnderflow { .. }
                )));
            }
            other => panic!("expected a validation failure, got {other:?}"),
        }
    }

    #[test]
    fn test_runtime_values_cannot_be_saved() {
        let code = CodeObject::builder("m")
            .constant(Value::list(Vec::new()))
            .op(Opcode::ReturnConst, 0)
            .build();
        assert_eq!(to_bytes(&code), Err(SaveError::Unserializable("list")));
    }

    #[test]
    fn test_save_and_load_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("prog.qbc");
        save(&program(), &path).unwrap();
        let loaded = load(&path).unwrap();
        assert_eq!(&*loaded.name, "main");
        assert!(matches!(
            load(&dir.path().join("missing.qbc")),
            Err(LoadError::Io(_))
        ));
    }
}
