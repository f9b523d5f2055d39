// Stored value type
//
// Values are dynamically typed, the same way result rows are in a SQL engine.

use std::cmp::Ordering;
use std::fmt;
use std::str::FromStr;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// A single stored value
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Value {
    Null,
    Integer(i64),
    Float(f64),
    Text(String),
    Boolean(bool),
    Blob(Vec<u8>),
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ValueParseError {
    #[error("Invalid blob literal: {0}")]
    InvalidBlob(String),

    #[error("Unterminated text literal: {0}")]
    UnterminatedText(String),
}

impl Value {
    pub fn type_name(&self) -> &'static str {
        match self {
            Value::Null => "NULL",
            Value::Integer(_) => "INTEGER",
            Value::Float(_) => "FLOAT",
            Value::Text(_) => "TEXT",
            Value::Boolean(_) => "BOOLEAN",
            Value::Blob(_) => "BLOB",
        }
    }

    pub fn is_null(&self) -> bool {
        matches!(self, Value::Null)
    }

    pub fn as_integer(&self) -> Option<i64> {
        match self {
            Value::Integer(i) => Some(*i),
            _ => None,
        }
    }

    /// Numeric view of the value; integers are widened
    pub fn as_float(&self) -> Option<f64> {
        match self {
            Value::Integer(i) => Some(*i as f64),
            Value::Float(f) => Some(*f),
            _ => None,
        }
    }

    pub fn as_text(&self) -> Option<&str> {
        match self {
            Value::Text(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_bool(&self) -> Option<bool> {
        match self {
            Value::Boolean(b) => Some(*b),
            _ => None,
        }
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Value::Null => write!(f, "NULL"),
            Value::Integer(i) => write!(f, "{}", i),
            Value::Float(fl) => write!(f, "{}", fl),
            Value::Text(s) => write!(f, "'{}'", s.replace('\'', "''")),
            Value::Boolean(b) => write!(f, "{}", if *b { "TRUE" } else { "FALSE" }),
            Value::Blob(b) => write!(f, "X'{}'", hex::encode(b)),
        }
    }
}

impl PartialOrd for Value {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        match (self, other) {
            (Value::Null, Value::Null) => Some(Ordering::Equal),
            (Value::Null, _) => Some(Ordering::Less),
            (_, Value::Null) => Some(Ordering::Greater),

            (Value::Integer(a), Value::Integer(b)) => a.partial_cmp(b),
            (Value::Float(a), Value::Float(b)) => a.partial_cmp(b),
            (Value::Integer(a), Value::Float(b)) => (*a as f64).partial_cmp(b),
            (Value::Float(a), Value::Integer(b)) => a.partial_cmp(&(*b as f64)),
            (Value::Text(a), Value::Text(b)) => Some(a.cmp(b)),
            (Value::Boolean(a), Value::Boolean(b)) => a.partial_cmp(b),
            (Value::Blob(a), Value::Blob(b)) => Some(a.cmp(b)),

            _ => None,
        }
    }
}

/// Parses the literal syntax used by the shell:
/// `NULL`, `TRUE`/`FALSE`, integers, floats, `'quoted text'`, `X'cafe'` blobs.
/// Anything else is taken as bare text.
impl FromStr for Value {
    type Err = ValueParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.trim();

        if s.eq_ignore_ascii_case("null") {
            return Ok(Value::Null);
        }
        if s.eq_ignore_ascii_case("true") {
            return Ok(Value::Boolean(true));
        }
        if s.eq_ignore_ascii_case("false") {
            return Ok(Value::Boolean(false));
        }
        if let Ok(i) = s.parse::<i64>() {
            return Ok(Value::Integer(i));
        }
        // f64::from_str also accepts "inf" and "nan"; only treat digit-bearing input as numeric
        if s.chars().any(|c| c.is_ascii_digit()) {
            if let Ok(f) = s.parse::<f64>() {
                return Ok(Value::Float(f));
            }
        }
        if let Some(body) = s.strip_prefix("X'").or_else(|| s.strip_prefix("x'")) {
            let hex_digits = body
                .strip_suffix('\'')
                .ok_or_else(|| ValueParseError::InvalidBlob(s.to_string()))?;
            return hex::decode(hex_digits)
                .map(Value::Blob)
                .map_err(|_| ValueParseError::InvalidBlob(s.to_string()));
        }
        if let Some(body) = s.strip_prefix('\'') {
            let text = body
                .strip_suffix('\'')
                .ok_or_else(|| ValueParseError::UnterminatedText(s.to_string()))?;
            return Ok(Value::Text(text.replace("''", "'")));
        }

        Ok(Value::Text(s.to_string()))
    }
}

impl From<i64> for Value {
    fn from(v: i64) -> Self {
        Value::Integer(v)
    }
}

impl From<f64> for Value {
    fn from(v: f64) -> Self {
        Value::Float(v)
    }
}

impl From<bool> for Value {
    fn from(v: bool) -> Self {
        Value::Boolean(v)
    }
}

impl From<&str> for Value {
    fn from(v: &str) -> Self {
        Value::Text(v.to_string())
    }
}

impl From<String> for Value {
    fn from(v: String) -> Self {
        Value::Text(v)
    }
}

impl From<Vec<u8>> for Value {
    fn from(v: Vec<u8>) -> Self {
        Value::Blob(v)
    }
}
