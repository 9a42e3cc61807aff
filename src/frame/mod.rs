//! Partitioned columnar tables
//!
//! Tables are immutable, column-oriented and split into row chunks. Every column of a table
//! shares the same chunk boundaries; chunks are the unit the partition directory places on
//! workers.

use serde::{Deserialize, Serialize};

pub mod column;
pub mod table;

pub use column::*;
pub use table::*;

/// Default number of rows per chunk.
pub const DEFAULT_CHUNK_ROWS: usize = 64 * 1024;

/// Column types supported by frames
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum DataType {
    Int64,
    Float64,
    Bool,
    /// Milliseconds since the Unix epoch
    Timestamp,
    /// Dictionary-encoded labels
    Categorical,
    String,
    /// Opaque payload bytes
    Binary,
}

impl DataType {
    pub fn is_numeric(&self) -> bool {
        matches!(self, DataType::Int64 | DataType::Float64)
    }

    pub fn is_textual(&self) -> bool {
        matches!(self, DataType::Categorical | DataType::String)
    }
}

/// A single cell value
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Value {
    Int64(i64),
    Float64(f64),
    Bool(bool),
    Timestamp(i64),
    Categorical(String),
    String(String),
    Binary(Vec<u8>),
    Null,
}

impl Value {
    /// Get the data type of this value, `None` for nulls
    pub fn data_type(&self) -> Option<DataType> {
        match self {
            Value::Int64(_) => Some(DataType::Int64),
            Value::Float64(_) => Some(DataType::Float64),
            Value::Bool(_) => Some(DataType::Bool),
            Value::Timestamp(_) => Some(DataType::Timestamp),
            Value::Categorical(_) => Some(DataType::Categorical),
            Value::String(_) => Some(DataType::String),
            Value::Binary(_) => Some(DataType::Binary),
            Value::Null => None,
        }
    }

    /// NaN floats count as missing.
    pub fn is_null(&self) -> bool {
        match self {
            Value::Null => true,
            Value::Float64(v) => v.is_nan(),
            _ => false,
        }
    }

    /// Numeric view used by tolerant comparisons.
    pub fn as_f64(&self) -> Option<f64> {
        match self {
            Value::Int64(v) | Value::Timestamp(v) => Some(*v as f64),
            Value::Float64(v) if !v.is_nan() => Some(*v),
            Value::Bool(b) => Some(if *b { 1.0 } else { 0.0 }),
            _ => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            Value::Categorical(s) | Value::String(s) => Some(s),
            _ => None,
        }
    }
}

impl std::fmt::Display for Value {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Value::Int64(v) | Value::Timestamp(v) => write!(f, "{}", v),
            Value::Float64(v) if v.is_nan() => write!(f, "NA"),
            Value::Float64(v) => write!(f, "{}", v),
            Value::Bool(v) => write!(f, "{}", v),
            Value::Categorical(s) | Value::String(s) => write!(f, "{}", s),
            Value::Binary(b) => write!(f, "<{} bytes>", b.len()),
            Value::Null => write!(f, "NA"),
        }
    }
}

impl From<i64> for Value {
    fn from(v: i64) -> Self {
        Value::Int64(v)
    }
}

impl From<f64> for Value {
    fn from(v: f64) -> Self {
        Value::Float64(v)
    }
}

impl From<bool> for Value {
    fn from(v: bool) -> Self {
        Value::Bool(v)
    }
}

impl From<&str> for Value {
    fn from(v: &str) -> Self {
        Value::String(v.to_string())
    }
}

impl<T: Into<Value>> From<Option<T>> for Value {
    fn from(v: Option<T>) -> Self {
        v.map(Into::into).unwrap_or(Value::Null)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_nan_is_null() {
        assert!(Value::Float64(f64::NAN).is_null());
        assert!(Value::Null.is_null());
        assert!(!Value::Float64(0.0).is_null());
        assert_eq!(Value::Float64(f64::NAN).as_f64(), None);
    }

    #[test]
    fn test_value_conversions() {
        assert_eq!(Value::from(Some(3i64)), Value::Int64(3));
        assert_eq!(Value::from(None::<i64>), Value::Null);
        assert_eq!(Value::from("x").as_str(), Some("x"));
        assert_eq!(Value::Int64(7).data_type(), Some(DataType::Int64));
    }
}
