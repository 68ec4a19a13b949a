//! Runtime values held in shell scope.
//!
//! Values are what the worker process owns as session state and what gets
//! transferred back to the supervisor at session end. Closures and resources
//! are process-local and are never serialized.

use std::cell::RefCell;
use std::collections::BTreeMap;
use std::fmt;
use std::rc::Rc;

use serde::{Deserialize, Serialize};

use crate::runtime::UserFunction;

/// Array key: arrays are ordered maps keyed by integers or strings.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ArrayKey {
    Int(i64),
    Str(String),
}

impl ArrayKey {
    /// Normalize a value into an array key. Numeric strings become integers.
    pub fn from_value(value: &Value) -> Option<Self> {
        match value {
            Value::Int(i) => Some(ArrayKey::Int(*i)),
            Value::Bool(b) => Some(ArrayKey::Int(*b as i64)),
            Value::Float(f) => Some(ArrayKey::Int(*f as i64)),
            Value::Null => Some(ArrayKey::Str(String::new())),
            Value::String(s) => match s.parse::<i64>() {
                Ok(i) if i.to_string() == *s => Some(ArrayKey::Int(i)),
                _ => Some(ArrayKey::Str(s.clone())),
            },
            _ => None,
        }
    }

    pub fn to_value(&self) -> Value {
        match self {
            ArrayKey::Int(i) => Value::Int(*i),
            ArrayKey::Str(s) => Value::String(s.clone()),
        }
    }
}

impl fmt::Display for ArrayKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ArrayKey::Int(i) => write!(f, "{}", i),
            ArrayKey::Str(s) => write!(f, "{:?}", s),
        }
    }
}

/// Insertion-ordered array.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ArrayValue {
    entries: Vec<(ArrayKey, Value)>,
    next_index: i64,
}

impl ArrayValue {
    pub fn new() -> Self {
        Self::default()
    }

    /// Build a list from values, keyed 0..n.
    pub fn from_list(values: impl IntoIterator<Item = Value>) -> Self {
        let mut array = Self::new();
        for value in values {
            array.push(value);
        }
        array
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn get(&self, key: &ArrayKey) -> Option<&Value> {
        self.entries.iter().find(|(k, _)| k == key).map(|(_, v)| v)
    }

    pub fn get_mut(&mut self, key: &ArrayKey) -> Option<&mut Value> {
        self.entries
            .iter_mut()
            .find(|(k, _)| k == key)
            .map(|(_, v)| v)
    }

    /// Insert or replace the value at `key`.
    pub fn insert(&mut self, key: ArrayKey, value: Value) {
        if let ArrayKey::Int(i) = key {
            self.next_index = self.next_index.max(i + 1);
        }
        match self.get_mut(&key) {
            Some(slot) => *slot = value,
            None => self.entries.push((key, value)),
        }
    }

    pub fn remove(&mut self, key: &ArrayKey) -> Option<Value> {
        let index = self.entries.iter().position(|(k, _)| k == key)?;
        Some(self.entries.remove(index).1)
    }

    pub fn contains_key(&self, key: &ArrayKey) -> bool {
        self.entries.iter().any(|(k, _)| k == key)
    }

    /// Remove and return the last entry.
    pub fn pop(&mut self) -> Option<Value> {
        let (_, value) = self.entries.pop()?;
        self.next_index = self
            .entries
            .iter()
            .filter_map(|(k, _)| match k {
                ArrayKey::Int(i) => Some(i + 1),
                ArrayKey::Str(_) => None,
            })
            .max()
            .unwrap_or(0);
        Some(value)
    }

    /// Append with the next integer key.
    pub fn push(&mut self, value: Value) {
        let key = ArrayKey::Int(self.next_index);
        self.next_index += 1;
        self.entries.push((key, value));
    }

    pub fn iter(&self) -> impl Iterator<Item = &(ArrayKey, Value)> {
        self.entries.iter()
    }

    pub fn values(&self) -> impl Iterator<Item = &Value> {
        self.entries.iter().map(|(_, v)| v)
    }
}

/// An object instance.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Object {
    pub class: String,
    pub properties: BTreeMap<String, Value>,
}

/// Shared handle to an object; objects have reference semantics.
pub type ObjectRef = Rc<RefCell<Object>>;

/// An enum case value.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EnumCase {
    pub enum_name: String,
    pub case: String,
    /// Declared by REPL input rather than a source file. Such cases cannot be
    /// rebuilt by a process that never evaluated that input.
    pub session_defined: bool,
}

/// A closure: a callable plus the variables it captured.
#[derive(Debug)]
pub struct Closure {
    pub function: Rc<UserFunction>,
    pub captured: BTreeMap<String, Value>,
    pub this: Option<ObjectRef>,
}

/// Opaque process-local handle (open streams and the like).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Resource {
    pub id: u64,
    pub kind: String,
}

/// A runtime value.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub enum Value {
    #[default]
    Null,
    Bool(bool),
    Int(i64),
    Float(f64),
    String(String),
    Array(ArrayValue),
    Object(ObjectRef),
    Enum(EnumCase),
    #[serde(skip)]
    Closure(Rc<Closure>),
    #[serde(skip)]
    Resource(Resource),
}

impl Value {
    pub fn string(s: impl Into<String>) -> Self {
        Value::String(s.into())
    }

    pub fn type_name(&self) -> &'static str {
        match self {
            Value::Null => "null",
            Value::Bool(_) => "bool",
            Value::Int(_) => "int",
            Value::Float(_) => "float",
            Value::String(_) => "string",
            Value::Array(_) => "array",
            Value::Object(_) => "object",
            Value::Enum(_) => "enum",
            Value::Closure(_) => "Closure",
            Value::Resource(_) => "resource",
        }
    }

    /// Whether this value can be sent to another process and rebuilt there.
    ///
    /// Resources, closures and session-defined enum cases are rejected at any
    /// nesting depth. So are objects that contain themselves: the wire format
    /// has no back-references.
    pub fn is_transferable(&self) -> bool {
        self.transferable_within(&mut Vec::new())
    }

    /// `open` holds the objects currently being walked, innermost last.
    fn transferable_within(&self, open: &mut Vec<*const RefCell<Object>>) -> bool {
        match self {
            Value::Closure(_) | Value::Resource(_) => false,
            Value::Enum(case) => !case.session_defined,
            Value::Array(array) => array.values().all(|item| item.transferable_within(open)),
            Value::Object(object) => {
                let ptr = Rc::as_ptr(object);
                if open.contains(&ptr) {
                    return false;
                }
                open.push(ptr);
                let ok = object
                    .borrow()
                    .properties
                    .values()
                    .all(|property| property.transferable_within(open));
                open.pop();
                ok
            }
            Value::Null
            | Value::Bool(_)
            | Value::Int(_)
            | Value::Float(_)
            | Value::String(_) => true,
        }
    }

    pub fn is_truthy(&self) -> bool {
        match self {
            Value::Null => false,
            Value::Bool(b) => *b,
            Value::Int(i) => *i != 0,
            Value::Float(f) => *f != 0.0,
            Value::String(s) => !(s.is_empty() || s == "0"),
            Value::Array(a) => !a.is_empty(),
            _ => true,
        }
    }

    /// Numeric view used by arithmetic. `None` for non-numeric values.
    pub fn to_number(&self) -> Option<Number> {
        match self {
            Value::Null => Some(Number::Int(0)),
            Value::Bool(b) => Some(Number::Int(*b as i64)),
            Value::Int(i) => Some(Number::Int(*i)),
            Value::Float(f) => Some(Number::Float(*f)),
            Value::String(s) => {
                let s = s.trim();
                if let Ok(i) = s.parse::<i64>() {
                    Some(Number::Int(i))
                } else {
                    s.parse::<f64>().ok().map(Number::Float)
                }
            }
            _ => None,
        }
    }

    /// String conversion used by `echo`, concatenation and interpolation.
    pub fn to_output_string(&self) -> String {
        match self {
            Value::Null => String::new(),
            Value::Bool(true) => "1".to_string(),
            Value::Bool(false) => String::new(),
            Value::Int(i) => i.to_string(),
            Value::Float(f) => format_float(*f),
            Value::String(s) => s.clone(),
            Value::Array(_) => "Array".to_string(),
            Value::Object(o) => o.borrow().class.clone(),
            Value::Enum(c) => format!("{}::{}", c.enum_name, c.case),
            Value::Closure(_) => "Closure".to_string(),
            Value::Resource(r) => format!("Resource id #{}", r.id),
        }
    }

    /// Strict (`===`) comparison.
    pub fn identical(&self, other: &Value) -> bool {
        match (self, other) {
            (Value::Object(a), Value::Object(b)) => Rc::ptr_eq(a, b),
            _ => self == other,
        }
    }

    /// Loose (`==`) comparison.
    pub fn loose_eq(&self, other: &Value) -> bool {
        match (self, other) {
            (Value::String(a), Value::String(b)) => a == b,
            (Value::Null, Value::String(s)) | (Value::String(s), Value::Null) => s.is_empty(),
            (Value::Bool(b), v) | (v, Value::Bool(b)) => *b == v.is_truthy(),
            (Value::Array(_), _) | (_, Value::Array(_)) => self == other,
            (Value::Object(_), _) | (_, Value::Object(_)) => self == other,
            _ => match (self.to_number(), other.to_number()) {
                (Some(a), Some(b)) => a.as_f64() == b.as_f64(),
                _ => self == other,
            },
        }
    }
}

impl PartialEq for Value {
    fn eq(&self, other: &Self) -> bool {
        match (self, other) {
            (Value::Null, Value::Null) => true,
            (Value::Bool(a), Value::Bool(b)) => a == b,
            (Value::Int(a), Value::Int(b)) => a == b,
            (Value::Float(a), Value::Float(b)) => a == b,
            (Value::String(a), Value::String(b)) => a == b,
            (Value::Array(a), Value::Array(b)) => a == b,
            (Value::Object(a), Value::Object(b)) => Rc::ptr_eq(a, b) || *a.borrow() == *b.borrow(),
            (Value::Enum(a), Value::Enum(b)) => a == b,
            (Value::Closure(a), Value::Closure(b)) => Rc::ptr_eq(a, b),
            (Value::Resource(a), Value::Resource(b)) => a == b,
            _ => false,
        }
    }
}

impl From<bool> for Value {
    fn from(b: bool) -> Self {
        Value::Bool(b)
    }
}

impl From<i64> for Value {
    fn from(i: i64) -> Self {
        Value::Int(i)
    }
}

impl From<&str> for Value {
    fn from(s: &str) -> Self {
        Value::String(s.to_string())
    }
}

impl From<String> for Value {
    fn from(s: String) -> Self {
        Value::String(s)
    }
}

/// Numeric operand.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Number {
    Int(i64),
    Float(f64),
}

impl Number {
    pub fn as_f64(self) -> f64 {
        match self {
            Number::Int(i) => i as f64,
            Number::Float(f) => f,
        }
    }
}

fn format_float(f: f64) -> String {
    if f.fract() == 0.0 && f.is_finite() && f.abs() < 1e15 {
        format!("{:.1}", f)
    } else {
        f.to_string()
    }
}

/// Short, single-line rendering for `=> value` output.
impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Value::Null => write!(f, "null"),
            Value::Bool(b) => write!(f, "{}", b),
            Value::Int(i) => write!(f, "{}", i),
            Value::Float(x) => write!(f, "{}", format_float(*x)),
            Value::String(s) => write!(f, "{:?}", s),
            Value::Array(array) => {
                write!(f, "[")?;
                let is_list = array
                    .iter()
                    .enumerate()
                    .all(|(i, (k, _))| *k == ArrayKey::Int(i as i64));
                for (i, (key, value)) in array.iter().enumerate() {
                    if i > 0 {
                        write!(f, ", ")?;
                    }
                    if is_list {
                        write!(f, "{}", value)?;
                    } else {
                        write!(f, "{} => {}", key, value)?;
                    }
                }
                write!(f, "]")
            }
            Value::Object(object) => {
                let object = object.borrow();
                write!(f, "{} {{", object.class)?;
                for (i, (name, value)) in object.properties.iter().enumerate() {
                    if i > 0 {
                        write!(f, ",")?;
                    }
                    write!(f, " ${}: {}", name, value)?;
                }
                write!(f, " }}")
            }
            Value::Enum(case) => write!(f, "{}::{}", case.enum_name, case.case),
            Value::Closure(closure) => write!(f, "Closure({})", closure.function.signature()),
            Value::Resource(r) => write!(f, "resource({}) #{}", r.kind, r.id),
        }
    }
}
