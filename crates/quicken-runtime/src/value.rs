//! Runtime value representation
//!
//! - `None`, `Bool`, `Int`, `Float`: immediate values
//! - `Str`, `Tuple`: immutable, reference-counted
//! - `List`: shared and mutable (`Arc<Mutex<Vec<Value>>>`), reference semantics
//! - `Iter`: shared iteration cursor over a list, tuple, range or string
//! - `Null`: stack marker for "no value" (empty `self` slot, unbound local)
//!
//! [`Value::type_tag`] is the constant-time shape query used by specialization guards.

use crate::bytecode::CodeObject;
use crate::error::VmError;
use crate::vm::Vm;
use parking_lot::Mutex;
use std::fmt;
use std::sync::Arc;

/// Shared mutable list storage.
pub type ListRef = Arc<Mutex<Vec<Value>>>;

/// Builtin function entry point.
pub type BuiltinFn = fn(&Vm, &[Value]) -> Result<Value, VmError>;

/// Shape of a value, as seen by guards.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum TypeTag {
    Null,
    None,
    Bool,
    Int,
    Float,
    Str,
    List,
    Tuple,
    Range,
    Iter,
    Code,
    Function,
    Builtin,
}

impl TypeTag {
    pub fn name(self) -> &'static str {
        match self {
            TypeTag::Null => "NULL",
            TypeTag::None => "NoneType",
            TypeTag::Bool => "bool",
            TypeTag::Int => "int",
            TypeTag::Float => "float",
            TypeTag::Str => "str",
            TypeTag::List => "list",
            TypeTag::Tuple => "tuple",
            TypeTag::Range => "range",
            TypeTag::Iter => "iterator",
            TypeTag::Code => "code",
            TypeTag::Function => "function",
            TypeTag::Builtin => "builtin_function_or_method",
        }
    }
}

/// `range(start, stop, step)`; `step` is never zero.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RangeValue {
    pub start: i64,
    pub stop: i64,
    pub step: i64,
}

impl RangeValue {
    pub fn len(&self) -> usize {
        let span = if self.step > 0 {
            self.stop.saturating_sub(self.start)
        } else {
            self.start.saturating_sub(self.stop)
        };
        if span <= 0 {
            0
        } else {
            let step = self.step.unsigned_abs();
            ((span as u64 + step - 1) / step) as usize
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn get(&self, index: usize) -> Option<i64> {
        if index >= self.len() {
            return None;
        }
        Some(self.start + self.step * index as i64)
    }

    pub fn contains(&self, value: i64) -> bool {
        let in_bounds = if self.step > 0 {
            value >= self.start && value < self.stop
        } else {
            value <= self.start && value > self.stop
        };
        in_bounds && (value - self.start) % self.step == 0
    }
}

/// Iteration cursor.
#[derive(Debug)]
pub enum IterState {
    List { items: ListRef, index: usize },
    Tuple { items: Arc<[Value]>, index: usize },
    Range { next: i64, stop: i64, step: i64 },
    Str { chars: Vec<char>, index: usize },
}

impl IterState {
    /// Advance the cursor; `None` once exhausted.
    pub fn next_value(&mut self) -> Option<Value> {
        match self {
            IterState::List { items, index } => {
                let item = items.lock().get(*index).cloned()?;
                *index += 1;
                Some(item)
            }
            IterState::Tuple { items, index } => {
                let item = items.get(*index).cloned()?;
                *index += 1;
                Some(item)
            }
            IterState::Range { next, stop, step } => {
                let more = if *step > 0 { *next < *stop } else { *next > *stop };
                if !more {
                    return None;
                }
                let item = *next;
                *next = next.saturating_add(*step);
                Some(Value::Int(item))
            }
            IterState::Str { chars, index } => {
                let ch = *chars.get(*index)?;
                *index += 1;
                Some(Value::str(ch.to_string()))
            }
        }
    }

    pub fn tag(&self) -> IterTag {
        match self {
            IterState::List { .. } => IterTag::List,
            IterState::Tuple { .. } => IterTag::Tuple,
            IterState::Range { .. } => IterTag::Range,
            IterState::Str { .. } => IterTag::Str,
        }
    }
}

/// What an iterator walks over.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IterTag {
    List,
    Tuple,
    Range,
    Str,
}

/// A function object created by `MAKE_FUNCTION`.
#[derive(Debug)]
pub struct Function {
    pub name: Arc<str>,
    pub code: Arc<CodeObject>,
}

/// Number of positional arguments a builtin accepts.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Arity {
    Exact(usize),
    Between(usize, usize),
    Any,
}

impl Arity {
    pub fn accepts(self, count: usize) -> bool {
        match self {
            Arity::Exact(n) => count == n,
            Arity::Between(lo, hi) => (lo..=hi).contains(&count),
            Arity::Any => true,
        }
    }
}

/// A native function callable from bytecode.
#[derive(Clone, Copy)]
pub struct Builtin {
    pub name: &'static str,
    pub arity: Arity,
    pub func: BuiltinFn,
}

impl fmt::Debug for Builtin {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "<builtin {}>", self.name)
    }
}

/// A runtime value.
#[derive(Debug, Clone)]
pub enum Value {
    Null,
    None,
    Bool(bool),
    Int(i64),
    Float(f64),
    Str(Arc<str>),
    List(ListRef),
    Tuple(Arc<[Value]>),
    Range(RangeValue),
    Iter(Arc<Mutex<IterState>>),
    Code(Arc<CodeObject>),
    Function(Arc<Function>),
    Builtin(Builtin),
}

impl Value {
    pub fn str(s: impl Into<Arc<str>>) -> Self {
        Value::Str(s.into())
    }

    pub fn list(items: Vec<Value>) -> Self {
        Value::List(Arc::new(Mutex::new(items)))
    }

    pub fn tuple(items: Vec<Value>) -> Self {
        Value::Tuple(items.into())
    }

    pub fn iter(state: IterState) -> Self {
        Value::Iter(Arc::new(Mutex::new(state)))
    }

    #[inline]
    pub fn type_tag(&self) -> TypeTag {
        match self {
            Value::Null => TypeTag::Null,
            Value::None => TypeTag::None,
            Value::Bool(_) => TypeTag::Bool,
            Value::Int(_) => TypeTag::Int,
            Value::Float(_) => TypeTag::Float,
            Value::Str(_) => TypeTag::Str,
            Value::List(_) => TypeTag::List,
            Value::Tuple(_) => TypeTag::Tuple,
            Value::Range(_) => TypeTag::Range,
            Value::Iter(_) => TypeTag::Iter,
            Value::Code(_) => TypeTag::Code,
            Value::Function(_) => TypeTag::Function,
            Value::Builtin(_) => TypeTag::Builtin,
        }
    }

    pub fn type_name(&self) -> &'static str {
        self.type_tag().name()
    }

    pub fn is_null(&self) -> bool {
        matches!(self, Value::Null)
    }

    pub fn is_truthy(&self) -> bool {
        match self {
            Value::Null | Value::None => false,
            Value::Bool(b) => *b,
            Value::Int(n) => *n != 0,
            Value::Float(x) => *x != 0.0,
            Value::Str(s) => !s.is_empty(),
            Value::List(items) => !items.lock().is_empty(),
            Value::Tuple(items) => !items.is_empty(),
            Value::Range(range) => !range.is_empty(),
            Value::Iter(_) | Value::Code(_) | Value::Function(_) | Value::Builtin(_) => true,
        }
    }

    /// Integer view of ints and bools.
    pub fn as_int(&self) -> Option<i64> {
        match self {
            Value::Int(n) => Some(*n),
            Value::Bool(b) => Some(*b as i64),
            _ => None,
        }
    }

    /// Float view of any number.
    pub fn as_float(&self) -> Option<f64> {
        match self {
            Value::Float(x) => Some(*x),
            Value::Int(n) => Some(*n as f64),
            Value::Bool(b) => Some(*b as i64 as f64),
            _ => None,
        }
    }

    /// Identity comparison (`is`).
    pub fn is(&self, other: &Value) -> bool {
        match (self, other) {
            (Value::Null, Value::Null) | (Value::None, Value::None) => true,
            (Value::Bool(a), Value::Bool(b)) => a == b,
            (Value::Int(a), Value::Int(b)) => a == b,
            (Value::Float(a), Value::Float(b)) => a.to_bits() == b.to_bits(),
            (Value::Str(a), Value::Str(b)) => Arc::ptr_eq(a, b),
            (Value::List(a), Value::List(b)) => Arc::ptr_eq(a, b),
            (Value::Tuple(a), Value::Tuple(b)) => Arc::ptr_eq(a, b),
            (Value::Range(a), Value::Range(b)) => a == b,
            (Value::Iter(a), Value::Iter(b)) => Arc::ptr_eq(a, b),
            (Value::Code(a), Value::Code(b)) => Arc::ptr_eq(a, b),
            (Value::Function(a), Value::Function(b)) => Arc::ptr_eq(a, b),
            (Value::Builtin(a), Value::Builtin(b)) => a.name == b.name,
            _ => false,
        }
    }

    /// Materialize an iterable into a vector.
    pub fn to_vec(&self) -> Result<Vec<Value>, VmError> {
        match self {
            Value::List(items) => Ok(items.lock().clone()),
            Value::Tuple(items) => Ok(items.to_vec()),
            Value::Range(range) => Ok((0..range.len())
                .filter_map(|i| range.get(i))
                .map(Value::Int)
                .collect()),
            Value::Str(s) => Ok(s.chars().map(|c| Value::str(c.to_string())).collect()),
            Value::Iter(state) => {
                let mut state = state.lock();
                let mut out = Vec::new();
                while let Some(item) = state.next_value() {
                    out.push(item);
                }
                Ok(out)
            }
            other => Err(VmError::type_error(format!(
                "'{}' object is not iterable",
                other.type_name()
            ))),
        }
    }

    /// Python-style `repr()`.
    pub fn repr(&self) -> String {
        match self {
            Value::Str(s) => format!("'{}'", s.replace('\\', "\\\\").replace('\'', "\\'")),
            other => other.to_string(),
        }
    }
}

fn format_float(x: f64) -> String {
    if x.is_nan() {
        "nan".to_string()
    } else if x.is_infinite() {
        if x > 0.0 { "inf" } else { "-inf" }.to_string()
    } else if x.fract() == 0.0 && x.abs() < 1e16 {
        format!("{:.1}", x)
    } else {
        format!("{}", x)
    }
}

fn join_repr(items: &[Value]) -> String {
    items.iter().map(Value::repr).collect::<Vec<_>>().join(", ")
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Value::Null => write!(f, "<NULL>"),
            Value::None => write!(f, "None"),
            Value::Bool(true) => write!(f, "True"),
            Value::Bool(false) => write!(f, "False"),
            Value::Int(n) => write!(f, "{}", n),
            Value::Float(x) => write!(f, "{}", format_float(*x)),
            Value::Str(s) => write!(f, "{}", s),
            Value::List(items) => write!(f, "[{}]", join_repr(&items.lock())),
            Value::Tuple(items) if items.len() == 1 => write!(f, "({},)", items[0].repr()),
            Value::Tuple(items) => write!(f, "({})", join_repr(items)),
            Value::Range(r) if r.step == 1 => write!(f, "range({}, {})", r.start, r.stop),
            Value::Range(r) => write!(f, "range({}, {}, {})", r.start, r.stop, r.step),
            Value::Iter(state) => write!(f, "<{:?}_iterator>", state.lock().tag()),
            Value::Code(code) => write!(f, "<code object {}>", code.name),
            Value::Function(func) => write!(f, "<function {}>", func.name),
            Value::Builtin(b) => write!(f, "<built-in function {}>", b.name),
        }
    }
}

impl PartialEq for Value {
    fn eq(&self, other: &Self) -> bool {
        match (self, other) {
            (Value::Str(a), Value::Str(b)) => a == b,
            (Value::List(a), Value::List(b)) => {
                if Arc::ptr_eq(a, b) {
                    return true;
                }
                let left = a.lock().clone();
                let right = b.lock().clone();
                left == right
            }
            (Value::Tuple(a), Value::Tuple(b)) => a[..] == b[..],
            (Value::Range(a), Value::Range(b)) => a == b,
            (Value::Float(_), _) | (_, Value::Float(_)) => {
                match (self.as_float(), other.as_float()) {
                    (Some(a), Some(b)) => a == b,
                    _ => false,
                }
            }
            _ => match (self.as_int(), other.as_int()) {
                (Some(a), Some(b)) => a == b,
                _ => self.is(other),
            },
        }
    }
}

impl From<i64> for Value {
    fn from(n: i64) -> Self {
        Value::Int(n)
    }
}

impl From<f64> for Value {
    fn from(x: f64) -> Self {
        Value::Float(x)
    }
}

impl From<bool> for Value {
    fn from(b: bool) -> Self {
        Value::Bool(b)
    }
}

impl From<&str> for Value {
    fn from(s: &str) -> Self {
        Value::str(s)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_display() {
        assert_eq!(Value::Float(3.0).to_string(), "3.0");
        assert_eq!(Value::Float(2.5).to_string(), "2.5");
        assert_eq!(
            Value::list(vec![Value::Int(1), Value::str("a")]).to_string(),
            "[1, 'a']"
        );
        assert_eq!(Value::tuple(vec![Value::Int(1)]).to_string(), "(1,)");
        assert_eq!(Value::Bool(true).to_string(), "True");
    }

    #[test]
    fn test_numeric_equality_crosses_types() {
        assert_eq!(Value::Int(1), Value::Float(1.0));
        assert_eq!(Value::Bool(true), Value::Int(1));
        assert_ne!(Value::Int(1), Value::str("1"));
    }

    #[test]
    fn test_range_len_and_contains() {
        let r = RangeValue {
            start: 0,
            stop: 10,
            step: 3,
        };
        assert_eq!(r.len(), 4);
        assert!(r.contains(9));
        assert!(!r.contains(10));
        let down = RangeValue {
            start: 5,
            stop: 0,
            step: -2,
        };
        assert_eq!(down.len(), 3);
        assert_eq!(down.get(2), Some(1));
    }

    #[test]
    fn test_iter_over_list_sees_appends() {
        let items: ListRef = Arc::new(Mutex::new(vec![Value::Int(1)]));
        let mut state = IterState::List {
            items: items.clone(),
            index: 0,
        };
        assert_eq!(state.next_value(), Some(Value::Int(1)));
        items.lock().push(Value::Int(2));
        assert_eq!(state.next_value(), Some(Value::Int(2)));
        assert_eq!(state.next_value(), None);
    }

    #[test]
    fn test_identity() {
        let s = Value::str("x");
        assert!(s.is(&s.clone()));
        assert!(!s.is(&Value::str("x")));
        assert!(Value::None.is(&Value::None));
    }
}
