use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::core::{Error, Result};

/// Storage type of a tag.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DataType {
    Bool,
    Int,
    Float,
    String,
}

impl DataType {
    pub fn code(&self) -> u8 {
        match self {
            DataType::Bool => 1,
            DataType::Int => 2,
            DataType::Float => 3,
            DataType::String => 4,
        }
    }

    pub fn from_code(code: u8) -> Result<Self> {
        match code {
            1 => Ok(DataType::Bool),
            2 => Ok(DataType::Int),
            3 => Ok(DataType::Float),
            4 => Ok(DataType::String),
            other => Err(Error::Corrupt(format!("unknown datatype code {other}"))),
        }
    }

    pub fn is_numeric(&self) -> bool {
        matches!(self, DataType::Int | DataType::Float)
    }
}

impl FromStr for DataType {
    type Err = Error;

    /// Accepts the datatype spellings found in PLC symbol exports.
    fn from_str(s: &str) -> Result<Self> {
        let lower = s.trim().to_ascii_lowercase();
        match lower.as_str() {
            "bool" | "boolean" | "bit" => Ok(DataType::Bool),
            "int" | "integer" | "dint" | "sint" | "lint" | "udint" | "uint" | "word" | "dword"
            | "int16" | "int32" | "int64" | "uint16" | "uint32" | "uint64" => Ok(DataType::Int),
            "float" | "real" | "lreal" | "double" | "float32" | "float64" | "ieee754" => {
                Ok(DataType::Float)
            }
            _ if lower == "string" || lower.starts_with("string(") => Ok(DataType::String),
            _ => Err(Error::Catalog(format!("unknown datatype {s:?}"))),
        }
    }
}

impl fmt::Display for DataType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            DataType::Bool => "bool",
            DataType::Int => "int",
            DataType::Float => "float",
            DataType::String => "string",
        };
        f.write_str(name)
    }
}

/// A single sampled value.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Value {
    Bool(bool),
    Int(i64),
    Float(f64),
    Text(String),
}

impl Value {
    pub fn datatype(&self) -> DataType {
        match self {
            Value::Bool(_) => DataType::Bool,
            Value::Int(_) => DataType::Int,
            Value::Float(_) => DataType::Float,
            Value::Text(_) => DataType::String,
        }
    }

    pub fn as_f64(&self) -> Option<f64> {
        match self {
            Value::Bool(b) => Some(if *b { 1.0 } else { 0.0 }),
            Value::Int(i) => Some(*i as f64),
            Value::Float(f) => Some(*f),
            Value::Text(_) => None,
        }
    }

    /// False only for NaN and infinite floats, which JSON cannot carry.
    pub fn is_finite(&self) -> bool {
        match self {
            Value::Float(f) => f.is_finite(),
            _ => true,
        }
    }

    /// Convert to the tag's storage type. `None` when the value cannot be
    /// represented (non-numeric text for a numeric tag, non-finite float for
    /// a numeric tag).
    pub fn coerce(&self, datatype: DataType) -> Option<Value> {
        match (datatype, self) {
            (DataType::String, Value::Text(s)) => Some(Value::Text(s.clone())),
            (DataType::String, other) => Some(Value::Text(other.to_string())),
            (DataType::Bool, Value::Bool(b)) => Some(Value::Bool(*b)),
            (DataType::Bool, Value::Int(i)) => Some(Value::Bool(*i != 0)),
            (DataType::Bool, Value::Float(f)) if !f.is_nan() => Some(Value::Bool(*f != 0.0)),
            (DataType::Bool, Value::Text(s)) => match s.trim().to_ascii_lowercase().as_str() {
                "true" | "1" => Some(Value::Bool(true)),
                "false" | "0" => Some(Value::Bool(false)),
                _ => None,
            },
            (DataType::Int, Value::Int(i)) => Some(Value::Int(*i)),
            (DataType::Int, Value::Bool(b)) => Some(Value::Int(i64::from(*b))),
            (DataType::Int, Value::Float(f)) if f.is_finite() => Some(Value::Int(f.trunc() as i64)),
            (DataType::Int, Value::Text(s)) => s.trim().parse().ok().map(Value::Int),
            (DataType::Float, Value::Text(s)) => s
                .trim()
                .parse::<f64>()
                .ok()
                .filter(|f| f.is_finite())
                .map(Value::Float),
            (DataType::Float, other) => other.as_f64().filter(|f| f.is_finite()).map(Value::Float),
            _ => None,
        }
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Value::Bool(b) => write!(f, "{b}"),
            Value::Int(i) => write!(f, "{i}"),
            Value::Float(x) => write!(f, "{x}"),
            Value::Text(s) => f.write_str(s),
        }
    }
}
