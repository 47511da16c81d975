//! Structural operations: the closed set of renderer-visible signals a
//! registered function may request instead of (or alongside) returning an
//! ordinary substitution value.
//!
//! `Value` stays exactly the closed variant the data model defines — no
//! new variant is added for this. Instead a structural op is carried as an
//! ordinary `Value::Map` tagged with a reserved key no template author is
//! expected to construct by hand; the renderer recognizes the tag when it
//! substitutes an expression-only token and intercepts it before treating
//! the value as display text.

use crate::value::Value;

/// The reserved map key marking a structural-op sentinel value.
const OP_KEY: &str = "$$structural_op";

/// A structural operation a function's return value may request. Applied
/// by the renderer post-substitution, at the granularity the operation
/// names (run, row, column, hyperlink).
#[derive(Clone, Debug, PartialEq)]
pub enum StructuralOp {
    /// Omit the enclosing table row from output.
    HideRow,
    /// Remove the enclosing table's column at `index` from the grid, every
    /// row's cells, and the width total.
    HideColumn(i64),
    /// Insert a run carrying a page break at this position.
    PageBreak,
    /// Rewrite the relationship target of the enclosing hyperlink.
    ReplaceLink(String),
    /// Insert pre-formatted structural markup verbatim at this position.
    RawMarkup(String),
}

impl StructuralOp {
    /// Wraps this op as a sentinel `Value` a function can return.
    pub fn into_value(self) -> Value {
        let mut m = indexmap::IndexMap::new();
        let (kind, payload) = match self {
            StructuralOp::HideRow => ("hide_row", Value::Null),
            StructuralOp::HideColumn(i) => ("hide_column", Value::Int(i)),
            StructuralOp::PageBreak => ("page_break", Value::Null),
            StructuralOp::ReplaceLink(url) => ("replace_link", Value::str(url)),
            StructuralOp::RawMarkup(xml) => ("raw_markup", Value::str(xml)),
        };
        m.insert(OP_KEY.to_string(), Value::str(kind));
        m.insert("payload".to_string(), payload);
        Value::map(m)
    }

    /// Recognizes a structural-op sentinel, if `value` carries one.
    pub fn from_value(value: &Value) -> Option<StructuralOp> {
        let Value::Map(m) = value else { return None };
        let Value::String(kind) = m.get(OP_KEY)? else { return None };
        let payload = m.get("payload").cloned().unwrap_or(Value::Null);
        match kind.as_ref() {
            "hide_row" => Some(StructuralOp::HideRow),
            "hide_column" => match payload {
                Value::Int(i) => Some(StructuralOp::HideColumn(i)),
                _ => None,
            },
            "page_break" => Some(StructuralOp::PageBreak),
            "replace_link" => match payload {
                Value::String(s) => Some(StructuralOp::ReplaceLink(s.to_string())),
                _ => None,
            },
            "raw_markup" => match payload {
                Value::String(s) => Some(StructuralOp::RawMarkup(s.to_string())),
                _ => None,
            },
            _ => None,
        }
    }
}

/// Registers the built-in functions templates call to request structural
/// ops (`hide_row()`, `hide_column(n)`, `page_break()`, `replace_link(url)`,
/// `raw_markup(xml)`) into `reg`.
pub fn register_builtins(reg: &mut crate::functions::FunctionRegistry) {
    reg.register("hide_row", 0, 0, |_| Ok(StructuralOp::HideRow.into_value()));
    reg.register("hide_column", 1, 1, |args| match &args[0] {
        Value::Int(i) => Ok(StructuralOp::HideColumn(*i).into_value()),
        other => Err(format!("hide_column() requires an integer, got {}", other.type_name())),
    });
    reg.register("page_break", 0, 0, |_| Ok(StructuralOp::PageBreak.into_value()));
    reg.register("replace_link", 1, 1, |args| match &args[0] {
        Value::String(s) => Ok(StructuralOp::ReplaceLink(s.to_string()).into_value()),
        other => Err(format!("replace_link() requires a string, got {}", other.type_name())),
    });
    reg.register("raw_markup", 1, 1, |args| match &args[0] {
        Value::String(s) => Ok(StructuralOp::RawMarkup(s.to_string()).into_value()),
        other => Err(format!("raw_markup() requires a string, got {}", other.type_name())),
    });
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round_trips_through_value() {
        let op = StructuralOp::HideColumn(2);
        let v = op.clone().into_value();
        assert_eq!(StructuralOp::from_value(&v), Some(op));
    }

    #[test]
    fn ordinary_values_are_not_mistaken_for_ops() {
        assert_eq!(StructuralOp::from_value(&Value::Int(5)), None);
        assert_eq!(StructuralOp::from_value(&Value::str("hide_row")), None);
    }
}
