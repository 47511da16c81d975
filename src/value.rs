//! The universal datum the evaluator operates on: a tagged variant with
//! SQL-like coalescing equality/ordering, integer/decimal promotion, and the
//! truthiness rules the specification defines.

use crate::error::{Error, Position};
use indexmap::IndexMap;
use std::sync::Arc;
use time::OffsetDateTime;

/// A dynamically typed value flowing through the expression evaluator.
#[derive(Clone, Debug)]
pub enum Value {
    /// The absence of a value.
    Null,
    /// A boolean.
    Bool(bool),
    /// A 64-bit signed integer.
    Int(i64),
    /// A decimal (floating point) number.
    Decimal(f64),
    /// A UTF-8 string.
    String(Arc<str>),
    /// An ordered list of values.
    List(Arc<Vec<Value>>),
    /// An insertion-ordered string-keyed map of values.
    Map(Arc<IndexMap<String, Value>>),
    /// A point in time.
    Time(OffsetDateTime),
    /// An opaque user-supplied object, accessed only through a registered
    /// field accessor.
    Opaque(Arc<dyn OpaqueObject>),
}

/// The contract an embedder's opaque objects must satisfy so that field
/// access (`value.field`) can dispatch into host data without the
/// evaluator knowing its concrete type.
pub trait OpaqueObject: core::fmt::Debug + Send + Sync {
    /// Returns the value of the named field, or `None` if it does not exist.
    fn field(&self, name: &str) -> Option<Value>;
    /// A debug-only type name, used in `TypeMismatch` error messages.
    fn type_name(&self) -> &'static str {
        "opaque"
    }
}

impl Value {
    /// Convenience constructor for string values.
    pub fn str(s: impl Into<Arc<str>>) -> Self {
        Value::String(s.into())
    }

    /// Convenience constructor for list values.
    pub fn list(v: Vec<Value>) -> Self {
        Value::List(Arc::new(v))
    }

    /// Convenience constructor for map values.
    pub fn map(m: IndexMap<String, Value>) -> Self {
        Value::Map(Arc::new(m))
    }

    /// The truthiness of this value, per the specification: null, false,
    /// empty string, empty list/map, and zero are falsy; everything else is
    /// truthy.
    pub fn is_truthy(&self) -> bool {
        match self {
            Value::Null => false,
            Value::Bool(b) => *b,
            Value::Int(n) => *n != 0,
            Value::Decimal(n) => *n != 0.0,
            Value::String(s) => !s.is_empty(),
            Value::List(l) => !l.is_empty(),
            Value::Map(m) => !m.is_empty(),
            Value::Time(_) | Value::Opaque(_) => true,
        }
    }

    /// A debug-only type name, used in error messages.
    pub fn type_name(&self) -> &'static str {
        match self {
            Value::Null => "null",
            Value::Bool(_) => "boolean",
            Value::Int(_) => "integer",
            Value::Decimal(_) => "decimal",
            Value::String(_) => "string",
            Value::List(_) => "list",
            Value::Map(_) => "map",
            Value::Time(_) => "time",
            Value::Opaque(o) => o.type_name(),
        }
    }

    /// Renders the value as text, the way the renderer substitutes it into
    /// document output: null becomes the empty string, booleans become
    /// `"true"`/`"false"`, decimals use the shortest non-exponential
    /// representation, and lists/maps get a deterministic textual form that
    /// is defined for debuggability but otherwise unused in practice.
    pub fn to_display_string(&self) -> String {
        match self {
            Value::Null => String::new(),
            Value::Bool(b) => b.to_string(),
            Value::Int(n) => n.to_string(),
            Value::Decimal(n) => format_decimal(*n),
            Value::String(s) => s.to_string(),
            Value::List(l) => {
                let parts: Vec<String> = l.iter().map(Value::to_display_string).collect();
                format!("[{}]", parts.join(", "))
            }
            Value::Map(m) => {
                let parts: Vec<String> = m
                    .iter()
                    .map(|(k, v)| format!("{k}: {}", v.to_display_string()))
                    .collect();
                format!("{{{}}}", parts.join(", "))
            }
            Value::Time(t) => t
                .format(&time::format_description::well_known::Rfc3339)
                .unwrap_or_default(),
            Value::Opaque(o) => format!("{o:?}"),
        }
    }

    /// Field access on this value: on a map, returns the mapped value (null
    /// if absent); on an opaque object, dispatches to its accessor; on
    /// null, returns null (safe navigation); everything else is a
    /// `TypeMismatch` unless `strict` is false, in which case it is null.
    pub fn field(&self, name: &str, pos: &Position, strict: bool) -> Result<Value, Error> {
        match self {
            Value::Null => Ok(Value::Null),
            Value::Map(m) => Ok(m.get(name).cloned().unwrap_or(Value::Null)),
            Value::Opaque(o) => Ok(o.field(name).unwrap_or(Value::Null)),
            other => {
                if strict {
                    Err(Error::TypeMismatch(
                        pos.clone(),
                        format!("cannot access field {name:?} of {}", other.type_name()),
                    ))
                } else {
                    Ok(Value::Null)
                }
            }
        }
    }

    /// Index access: integer index on a list (negative indexes from the
    /// end), string index on a map. Out-of-range indexing is null unless
    /// `strict`.
    pub fn index(&self, key: &Value, pos: &Position, strict: bool) -> Result<Value, Error> {
        match (self, key) {
            (Value::Null, _) => Ok(Value::Null),
            (Value::List(list), Value::Int(i)) => {
                let len = list.len() as i64;
                let idx = if *i < 0 { *i + len } else { *i };
                if idx >= 0 && idx < len {
                    Ok(list[idx as usize].clone())
                } else if strict {
                    Err(Error::IndexOutOfRange(pos.clone()))
                } else {
                    Ok(Value::Null)
                }
            }
            (Value::Map(map), Value::String(s)) => {
                Ok(map.get(s.as_ref()).cloned().unwrap_or(Value::Null))
            }
            (other, _) => {
                if strict {
                    Err(Error::TypeMismatch(
                        pos.clone(),
                        format!("cannot index into {}", other.type_name()),
                    ))
                } else {
                    Ok(Value::Null)
                }
            }
        }
    }
}

/// Formats a decimal using the shortest round-trip representation, with a
/// trailing `.0` suppressed for integral decimals. This resolves the
/// numeric-formatting Open Question in the specification.
pub fn format_decimal(n: f64) -> String {
    if n.is_nan() {
        return "NaN".to_string();
    }
    if n.is_infinite() {
        return if n > 0.0 { "Infinity" } else { "-Infinity" }.to_string();
    }
    if n == n.trunc() && n.abs() < 1e15 {
        format!("{}", n as i64)
    } else {
        let mut s = format!("{n}");
        if !s.contains('.') && !s.contains('e') {
            s.push_str(".0");
        }
        s
    }
}

/// Numeric promotion result: both operands widened to a common numeric
/// representation.
pub(crate) enum Numeric {
    Int(i64, i64),
    Decimal(f64, f64),
}

/// Promotes two values to a common numeric type per the arithmetic rules:
/// integer+integer stays integer; any decimal operand promotes both sides
/// to decimal.
pub(crate) fn promote(
    left: &Value,
    right: &Value,
    op: &str,
    pos: &Position,
) -> Result<Numeric, Error> {
    match (left, right) {
        (Value::Int(a), Value::Int(b)) => Ok(Numeric::Int(*a, *b)),
        (Value::Int(a), Value::Decimal(b)) => Ok(Numeric::Decimal(*a as f64, *b)),
        (Value::Decimal(a), Value::Int(b)) => Ok(Numeric::Decimal(*a, *b as f64)),
        (Value::Decimal(a), Value::Decimal(b)) => Ok(Numeric::Decimal(*a, *b)),
        _ => Err(Error::TypeMismatch(
            pos.clone(),
            format!(
                "operator {op} requires numeric operands, got {} and {}",
                left.type_name(),
                right.type_name()
            ),
        )),
    }
}

/// Three-valued-coalescing equality: values of differing type are unequal
/// (never an error), except numeric cross-type comparisons which promote.
impl PartialEq for Value {
    fn eq(&self, other: &Self) -> bool {
        match (self, other) {
            (Value::Null, Value::Null) => true,
            (Value::Bool(a), Value::Bool(b)) => a == b,
            (Value::Int(a), Value::Int(b)) => a == b,
            (Value::Decimal(a), Value::Decimal(b)) => a == b,
            (Value::Int(a), Value::Decimal(b)) | (Value::Decimal(b), Value::Int(a)) => {
                (*a as f64) == *b
            }
            (Value::String(a), Value::String(b)) => a == b,
            (Value::List(a), Value::List(b)) => a == b,
            (Value::Map(a), Value::Map(b)) => a.len() == b.len() && a.iter().all(|(k, v)| b.get(k) == Some(v)),
            (Value::Time(a), Value::Time(b)) => a == b,
            _ => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn truthiness_matches_spec() {
        assert!(!Value::Null.is_truthy());
        assert!(!Value::Bool(false).is_truthy());
        assert!(!Value::Int(0).is_truthy());
        assert!(!Value::str("").is_truthy());
        assert!(!Value::list(vec![]).is_truthy());
        assert!(Value::Int(1).is_truthy());
        assert!(Value::str("x").is_truthy());
    }

    #[test]
    fn decimal_formatting_suppresses_trailing_zero() {
        assert_eq!(format_decimal(3.0), "3");
        assert_eq!(format_decimal(3.5), "3.5");
        assert_eq!(format_decimal(-2.0), "-2");
    }

    #[test]
    fn negative_index_counts_from_end() {
        let pos = Position::default();
        let list = Value::list(vec![Value::Int(1), Value::Int(2), Value::Int(3)]);
        let v = list.index(&Value::Int(-1), &pos, true).unwrap();
        assert_eq!(v, Value::Int(3));
    }
}
