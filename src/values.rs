//! Property value model for indexed entities
//!
//! Every value that can be stored in an index entry lives here. Values are
//! immutable, carry a total order that is consistent with equality, and
//! serialize with serde. The order is type-ranked first, then within-type,
//! so heterogeneous tuples still sort deterministically.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::fmt;

/// A single property value.
///
/// `Null` doubles as the positional placeholder for absent slots in
/// partial tuples of any-of indexes.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum Value {
    Null,
    Bool(bool),
    Int(i64),
    Float(f64),
    Text(String),
    DateTime(DateTime<Utc>),
    /// 2-D spatial point
    Point { x: f64, y: f64 },
    List(Vec<Value>),
}

impl Value {
    /// Check if value is null
    pub fn is_null(&self) -> bool {
        matches!(self, Value::Null)
    }

    /// Get string value if this is a text value
    pub fn as_str(&self) -> Option<&str> {
        match self {
            Value::Text(s) => Some(s),
            _ => None,
        }
    }

    /// Get integer value if this is an integer
    pub fn as_int(&self) -> Option<i64> {
        match self {
            Value::Int(i) => Some(*i),
            _ => None,
        }
    }

    /// Get type name as string
    pub fn type_name(&self) -> &'static str {
        match self {
            Value::Null => "Null",
            Value::Bool(_) => "Bool",
            Value::Int(_) => "Int",
            Value::Float(_) => "Float",
            Value::Text(_) => "Text",
            Value::DateTime(_) => "DateTime",
            Value::Point { .. } => "Point",
            Value::List(_) => "List",
        }
    }

    fn type_rank(&self) -> u8 {
        match self {
            Value::Null => 0,
            Value::Bool(_) => 1,
            Value::Int(_) => 2,
            Value::Float(_) => 3,
            Value::Text(_) => 4,
            Value::DateTime(_) => 5,
            Value::Point { .. } => 6,
            Value::List(_) => 7,
        }
    }
}

impl PartialEq for Value {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == Ordering::Equal
    }
}

impl Eq for Value {}

impl PartialOrd for Value {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Value {
    fn cmp(&self, other: &Self) -> Ordering {
        match (self, other) {
            (Value::Null, Value::Null) => Ordering::Equal,
            (Value::Bool(a), Value::Bool(b)) => a.cmp(b),
            (Value::Int(a), Value::Int(b)) => a.cmp(b),
            // total_cmp keeps NaN orderable, so Eq/Ord stay lawful
            (Value::Float(a), Value::Float(b)) => a.total_cmp(b),
            (Value::Text(a), Value::Text(b)) => a.cmp(b),
            (Value::DateTime(a), Value::DateTime(b)) => a.cmp(b),
            (Value::Point { x: ax, y: ay }, Value::Point { x: bx, y: by }) => {
                ax.total_cmp(bx).then_with(|| ay.total_cmp(by))
            }
            (Value::List(a), Value::List(b)) => a.cmp(b),
            (a, b) => a.type_rank().cmp(&b.type_rank()),
        }
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Value::Null => write!(f, "null"),
            Value::Bool(b) => write!(f, "{}", b),
            Value::Int(i) => write!(f, "{}", i),
            Value::Float(x) => write!(f, "{}", x),
            Value::Text(s) => write!(f, "\"{}\"", s),
            Value::DateTime(dt) => write!(f, "{}", dt.to_rfc3339()),
            Value::Point { x, y } => write!(f, "point({}, {})", x, y),
            Value::List(values) => {
                write!(f, "[")?;
                for (i, v) in values.iter().enumerate() {
                    if i > 0 {
                        write!(f, ", ")?;
                    }
                    write!(f, "{}", v)?;
                }
                write!(f, "]")
            }
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

impl From<f64> for Value {
    fn from(x: f64) -> Self {
        Value::Float(x)
    }
}

impl From<&str> for Value {
    fn from(s: &str) -> Self {
        Value::Text(s.to_string())
    }
}

impl From<String> for Value {
    fn from(s: String) -> Self {
        Value::Text(s)
    }
}

impl From<DateTime<Utc>> for Value {
    fn from(dt: DateTime<Utc>) -> Self {
        Value::DateTime(dt)
    }
}

/// An ordered tuple of values, one per property key of an index, in
/// schema order. Absent slots hold [`Value::Null`].
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ValueTuple(Vec<Value>);

impl ValueTuple {
    pub fn new(values: Vec<Value>) -> Self {
        ValueTuple(values)
    }

    pub fn values(&self) -> &[Value] {
        &self.0
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// First slot of the tuple, the one single-property queries target
    pub fn first(&self) -> Option<&Value> {
        self.0.first()
    }

    /// True if at least one slot carries a real value
    pub fn is_occupied(&self) -> bool {
        self.0.iter().any(|v| !v.is_null())
    }
}

impl fmt::Display for ValueTuple {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "(")?;
        for (i, v) in self.0.iter().enumerate() {
            if i > 0 {
                write!(f, ", ")?;
            }
            write!(f, "{}", v)?;
        }
        write!(f, ")")
    }
}

impl From<Value> for ValueTuple {
    fn from(value: Value) -> Self {
        ValueTuple(vec![value])
    }
}

impl From<Vec<Value>> for ValueTuple {
    fn from(values: Vec<Value>) -> Self {
        ValueTuple(values)
    }
}

impl<const N: usize> From<[Value; N]> for ValueTuple {
    fn from(values: [Value; N]) -> Self {
        ValueTuple(values.to_vec())
    }
}

impl std::ops::Index<usize> for ValueTuple {
    type Output = Value;

    fn index(&self, i: usize) -> &Value {
        &self.0[i]
    }
}
