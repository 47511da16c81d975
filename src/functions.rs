//! The function registry contract: user- and built-in-supplied callables
//! the evaluator dispatches `FunctionCall` nodes against.
//!
//! The specification treats the full library of built-in helpers (format,
//! case conversion, currency, date formatting, etc. — on the order of a
//! hundred functions) as an external collaborator; only the calling
//! contract is specified. This module implements that contract plus a
//! small, representative subset of built-ins so the evaluator and
//! validator are exercisable end-to-end.

use crate::value::Value;
use std::collections::HashMap;
use std::sync::Arc;

/// A function an expression may call by name.
pub trait Function: Send + Sync {
    /// The inclusive `[min, max]` number of arguments this function
    /// accepts.
    fn arity(&self) -> (usize, usize);
    /// Invokes the function with already-evaluated arguments. Returns a
    /// human-readable message on failure; the caller wraps it as a
    /// `TypeMismatch`.
    fn call(&self, args: &[Value]) -> Result<Value, String>;
}

/// A registered function paired with its declared arity, so a plain
/// closure can be registered without implementing [`Function`] by hand.
struct Entry {
    min: usize,
    max: usize,
    f: Box<dyn Fn(&[Value]) -> Result<Value, String> + Send + Sync>,
}

impl Function for Entry {
    fn arity(&self) -> (usize, usize) {
        (self.min, self.max)
    }

    fn call(&self, args: &[Value]) -> Result<Value, String> {
        (self.f)(args)
    }
}

/// The set of name-to-function entries an [`crate::engine::Engine`] or a
/// single render consults to resolve `FunctionCall` nodes. Read-only once
/// handed to a render, per the concurrency model: registration is only
/// permitted when no renders are in flight.
#[derive(Clone, Default)]
pub struct FunctionRegistry {
    functions: HashMap<String, Arc<dyn Function>>,
}

impl FunctionRegistry {
    /// An empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a function under `name` with the given arity.
    pub fn register(
        &mut self,
        name: impl Into<String>,
        min_arity: usize,
        max_arity: usize,
        f: impl Fn(&[Value]) -> Result<Value, String> + Send + Sync + 'static,
    ) {
        self.functions.insert(
            name.into(),
            Arc::new(Entry {
                min: min_arity,
                max: max_arity,
                f: Box::new(f),
            }),
        );
    }

    /// Merges a batch of functions supplied by a `function_provider`
    /// callback. Conflicts favor the provider (last-registered wins), the
    /// same rule the renderer uses for fragment style-table merges.
    pub fn extend(&mut self, other: FunctionRegistry) {
        self.functions.extend(other.functions);
    }

    /// Looks up a function by name.
    pub fn get(&self, name: &str) -> Option<&dyn Function> {
        self.functions.get(name).map(|f| f.as_ref())
    }

    /// True if `name` is registered.
    pub fn contains(&self, name: &str) -> bool {
        self.functions.contains_key(name)
    }

    /// A registry with the built-in helper subset registered.
    pub fn with_builtins() -> Self {
        let mut reg = Self::new();
        builtins::register_all(&mut reg);
        reg
    }
}

mod builtins {
    use super::FunctionRegistry;
    use crate::value::Value;

    pub(super) fn register_all(reg: &mut FunctionRegistry) {
        reg.register("upper", 1, 1, |args| Ok(string_fn(args, str::to_uppercase)));
        reg.register("lower", 1, 1, |args| Ok(string_fn(args, str::to_lowercase)));
        reg.register("len", 1, 1, len);
        reg.register("default", 2, 2, |args| {
            Ok(if args[0].is_truthy() {
                args[0].clone()
            } else {
                args[1].clone()
            })
        });
        reg.register("join", 1, 2, join);
        reg.register("format", 1, usize::MAX, format);
    }

    fn string_fn(args: &[Value], f: impl Fn(&str) -> String) -> Value {
        match &args[0] {
            Value::String(s) => Value::str(f(s)),
            other => Value::str(f(&other.to_display_string())),
        }
    }

    fn len(args: &[Value]) -> Result<Value, String> {
        match &args[0] {
            Value::String(s) => Ok(Value::Int(s.chars().count() as i64)),
            Value::List(l) => Ok(Value::Int(l.len() as i64)),
            Value::Map(m) => Ok(Value::Int(m.len() as i64)),
            other => Err(format!("len() does not accept {}", other.type_name())),
        }
    }

    fn join(args: &[Value]) -> Result<Value, String> {
        let sep = args.get(1).map_or(",", |v| match v {
            Value::String(s) => s.as_ref(),
            _ => ",",
        });
        match &args[0] {
            Value::List(l) => Ok(Value::str(
                l.iter()
                    .map(Value::to_display_string)
                    .collect::<Vec<_>>()
                    .join(sep),
            )),
            other => Err(format!("join() requires a list, got {}", other.type_name())),
        }
    }

    /// `format("{0} of {1}", a, b)`: positional `{n}` substitution.
    fn format(args: &[Value]) -> Result<Value, String> {
        let template = match &args[0] {
            Value::String(s) => s.clone(),
            other => return Err(format!("format() requires a string template, got {}", other.type_name())),
        };
        let rest = &args[1..];
        let mut out = String::with_capacity(template.len());
        let mut chars = template.chars().peekable();
        while let Some(c) = chars.next() {
            if c == '{' {
                let mut digits = String::new();
                while let Some(&d) = chars.peek() {
                    if d.is_ascii_digit() {
                        digits.push(d);
                        chars.next();
                    } else {
                        break;
                    }
                }
                if chars.peek() == Some(&'}') && !digits.is_empty() {
                    chars.next();
                    let index: usize = digits.parse().unwrap();
                    match rest.get(index) {
                        Some(v) => out.push_str(&v.to_display_string()),
                        None => return Err(format!("format() has no argument {index}")),
                    }
                    continue;
                }
                out.push('{');
                out.push_str(&digits);
            } else {
                out.push(c);
            }
        }
        Ok(Value::str(out))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn format_substitutes_positional_args() {
        let reg = FunctionRegistry::with_builtins();
        let f = reg.get("format").unwrap();
        let result = f
            .call(&[Value::str("{0} of {1}"), Value::str("Queen"), Value::str("Hearts")])
            .unwrap();
        assert_eq!(result, Value::str("Queen of Hearts"));
    }

    #[test]
    fn arity_is_enforced_by_caller_via_declared_bounds() {
        let reg = FunctionRegistry::with_builtins();
        let f = reg.get("default").unwrap();
        assert_eq!(f.arity(), (2, 2));
    }

    #[test]
    fn join_uses_custom_separator() {
        let reg = FunctionRegistry::with_builtins();
        let f = reg.get("join").unwrap();
        let v = f
            .call(&[
                Value::list(vec![Value::Int(1), Value::Int(2), Value::Int(3)]),
                Value::str(" - "),
            ])
            .unwrap();
        assert_eq!(v, Value::str("1 - 2 - 3"));
    }
}
