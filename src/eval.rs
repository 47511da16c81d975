//! The expression evaluator: produces a [`Value`] from an [`Expr`] AST node
//! under a [`Context`], invoking registered functions and applying the
//! arithmetic/comparison/logical operator tables the specification defines.

use crate::ast::{BinaryOp, Expr, UnaryOp};
use crate::codemap::Spanned;
use crate::context::Context;
use crate::error::{Error, Position};
use crate::functions::FunctionRegistry;
use crate::value::{self, Numeric, Value};

/// Evaluation-time configuration: whether lenient or strict lookup/indexing
/// rules apply.
#[derive(Clone, Copy, Debug, Default)]
pub struct EvalOptions {
    /// When true, a missing variable is a `MissingVariable` error instead of
    /// `Value::Null`, and out-of-range indexing is an `IndexOutOfRange`
    /// error instead of `Value::Null`.
    pub strict: bool,
}

/// Evaluates `expr` under `ctx`, using `functions` to resolve calls.
/// `source` is the full template source `expr`'s spans are relative to, used
/// only to render human-readable positions in errors.
pub fn eval(
    expr: &Spanned<Expr>,
    ctx: &mut Context,
    functions: &FunctionRegistry,
    part: &str,
    source: &str,
    opts: EvalOptions,
) -> Result<Value, Error> {
    let pos = || Position::new(part, source, expr.span.start);
    match &expr.node {
        Expr::Literal(v) => Ok(v.clone()),
        Expr::VariableRef(name) => match ctx.lookup(name) {
            Some(v) => Ok(v.clone()),
            None if opts.strict => Err(Error::MissingVariable(pos(), name.clone())),
            None => Ok(Value::Null),
        },
        Expr::FieldAccess(base, name) => {
            let base = eval(base, ctx, functions, part, source, opts)?;
            base.field(name, &pos(), opts.strict)
        }
        Expr::IndexAccess(base, index) => {
            let base = eval(base, ctx, functions, part, source, opts)?;
            let index = eval(index, ctx, functions, part, source, opts)?;
            base.index(&index, &pos(), opts.strict)
        }
        Expr::FunctionCall(name, args) => {
            let mut evaluated = Vec::with_capacity(args.len());
            for arg in args {
                evaluated.push(eval(arg, ctx, functions, part, source, opts)?);
            }
            call_function(name, evaluated, &pos(), functions)
        }
        Expr::Unary(op, operand) => {
            let v = eval(operand, ctx, functions, part, source, opts)?;
            apply_unary(*op, v, &pos())
        }
        Expr::Binary(BinaryOp::And, l, r) => {
            let lv = eval(l, ctx, functions, part, source, opts)?;
            if !lv.is_truthy() {
                return Ok(Value::Bool(false));
            }
            Ok(Value::Bool(
                eval(r, ctx, functions, part, source, opts)?.is_truthy(),
            ))
        }
        Expr::Binary(BinaryOp::Or, l, r) => {
            let lv = eval(l, ctx, functions, part, source, opts)?;
            if lv.is_truthy() {
                return Ok(Value::Bool(true));
            }
            Ok(Value::Bool(
                eval(r, ctx, functions, part, source, opts)?.is_truthy(),
            ))
        }
        Expr::Binary(op, l, r) => {
            let lv = eval(l, ctx, functions, part, source, opts)?;
            let rv = eval(r, ctx, functions, part, source, opts)?;
            apply_binary(*op, lv, rv, &pos())
        }
    }
}

fn apply_unary(op: UnaryOp, v: Value, pos: &Position) -> Result<Value, Error> {
    match op {
        UnaryOp::Not => Ok(Value::Bool(!v.is_truthy())),
        UnaryOp::Neg => match v {
            Value::Int(n) => Ok(Value::Int(-n)),
            Value::Decimal(n) => Ok(Value::Decimal(-n)),
            other => Err(Error::TypeMismatch(
                pos.clone(),
                format!("cannot negate {}", other.type_name()),
            )),
        },
    }
}

fn apply_binary(op: BinaryOp, l: Value, r: Value, pos: &Position) -> Result<Value, Error> {
    use BinaryOp::*;
    match op {
        Add | Sub | Mul | Mod => arith(op, l, r, pos),
        Div => divide(l, r, pos),
        Eq => Ok(Value::Bool(l == r)),
        Ne => Ok(Value::Bool(l != r)),
        Lt | Le | Gt | Ge => compare(op, l, r, pos),
        Contains => contains(l, r, pos),
        And | Or => unreachable!("short-circuit operators are handled in eval()"),
    }
}

fn arith(op: BinaryOp, l: Value, r: Value, pos: &Position) -> Result<Value, Error> {
    let name = op_name(op);
    match value::promote(&l, &r, name, pos)? {
        Numeric::Int(a, b) => {
            let result = match op {
                BinaryOp::Add => a.checked_add(b),
                BinaryOp::Sub => a.checked_sub(b),
                BinaryOp::Mul => a.checked_mul(b),
                BinaryOp::Mod => {
                    if b == 0 {
                        return Err(Error::DivisionByZero(pos.clone()));
                    }
                    a.checked_rem(b)
                }
                _ => unreachable!(),
            };
            result.map(Value::Int).ok_or_else(|| {
                Error::TypeMismatch(pos.clone(), format!("integer overflow in {name}"))
            })
        }
        Numeric::Decimal(a, b) => {
            let result = match op {
                BinaryOp::Add => a + b,
                BinaryOp::Sub => a - b,
                BinaryOp::Mul => a * b,
                BinaryOp::Mod => {
                    if b == 0.0 {
                        return Err(Error::DivisionByZero(pos.clone()));
                    }
                    a % b
                }
                _ => unreachable!(),
            };
            Ok(Value::Decimal(result))
        }
    }
}

fn divide(l: Value, r: Value, pos: &Position) -> Result<Value, Error> {
    match value::promote(&l, &r, "/", pos)? {
        Numeric::Int(a, b) => {
            if b == 0 {
                return Err(Error::DivisionByZero(pos.clone()));
            }
            if a % b == 0 {
                Ok(Value::Int(a / b))
            } else {
                Ok(Value::Decimal(a as f64 / b as f64))
            }
        }
        Numeric::Decimal(a, b) => {
            if b == 0.0 {
                return Err(Error::DivisionByZero(pos.clone()));
            }
            Ok(Value::Decimal(a / b))
        }
    }
}

fn compare(op: BinaryOp, l: Value, r: Value, pos: &Position) -> Result<Value, Error> {
    let ordering = match (&l, &r) {
        (Value::String(a), Value::String(b)) => a.as_bytes().cmp(b.as_bytes()),
        _ => match value::promote(&l, &r, op_name(op), pos)? {
            Numeric::Int(a, b) => a.cmp(&b),
            Numeric::Decimal(a, b) => a.partial_cmp(&b).ok_or_else(|| {
                Error::TypeMismatch(pos.clone(), "comparison produced NaN".to_string())
            })?,
        },
    };
    use core::cmp::Ordering::*;
    let result = match op {
        BinaryOp::Lt => ordering == Less,
        BinaryOp::Le => ordering != Greater,
        BinaryOp::Gt => ordering == Greater,
        BinaryOp::Ge => ordering != Less,
        _ => unreachable!(),
    };
    Ok(Value::Bool(result))
}

fn contains(l: Value, r: Value, pos: &Position) -> Result<Value, Error> {
    match (&l, &r) {
        (Value::List(items), needle) => Ok(Value::Bool(items.iter().any(|v| v == needle))),
        (Value::String(haystack), Value::String(needle)) => {
            Ok(Value::Bool(haystack.contains(needle.as_ref())))
        }
        _ => Err(Error::TypeMismatch(
            pos.clone(),
            format!(
                "contains requires a list or string on the left, got {}",
                l.type_name()
            ),
        )),
    }
}

fn op_name(op: BinaryOp) -> &'static str {
    match op {
        BinaryOp::Add => "+",
        BinaryOp::Sub => "-",
        BinaryOp::Mul => "*",
        BinaryOp::Div => "/",
        BinaryOp::Mod => "%",
        BinaryOp::Eq => "==",
        BinaryOp::Ne => "!=",
        BinaryOp::Lt => "<",
        BinaryOp::Le => "<=",
        BinaryOp::Gt => ">",
        BinaryOp::Ge => ">=",
        BinaryOp::And => "&&",
        BinaryOp::Or => "||",
        BinaryOp::Contains => "contains",
    }
}

fn call_function(
    name: &str,
    args: Vec<Value>,
    pos: &Position,
    functions: &FunctionRegistry,
) -> Result<Value, Error> {
    match name {
        "coalesce" => return Ok(eval_coalesce(args)),
        "switch" => return eval_switch(args, pos),
        _ => {}
    }
    let func = functions
        .get(name)
        .ok_or_else(|| Error::MissingFunction(pos.clone(), name.to_string()))?;
    let (min, max) = func.arity();
    if args.len() < min || args.len() > max {
        return Err(Error::ArityMismatch(
            pos.clone(),
            name.to_string(),
            min,
            max,
            args.len(),
        ));
    }
    func.call(&args).map_err(|msg| Error::TypeMismatch(pos.clone(), msg))
}

/// `coalesce(a, b, ..)`: first non-null, non-empty value. Unlike
/// [`Value::is_truthy`], only null and an empty string/list are skipped —
/// `false` and `0`/`0.0` are valid, returnable values.
fn eval_coalesce(args: Vec<Value>) -> Value {
    args.into_iter()
        .find(|v| !is_null_or_empty(v))
        .unwrap_or(Value::Null)
}

fn is_null_or_empty(v: &Value) -> bool {
    match v {
        Value::Null => true,
        Value::String(s) => s.is_empty(),
        Value::List(l) => l.is_empty(),
        _ => false,
    }
}

/// `switch(key, k1, v1, k2, v2, ..., default)`: matches `key` by equality
/// against each `k`, returning the paired value; an unpaired trailing
/// argument is the default; a missing default yields null.
fn eval_switch(args: Vec<Value>, pos: &Position) -> Result<Value, Error> {
    let mut iter = args.into_iter();
    let key = iter
        .next()
        .ok_or_else(|| Error::ArityMismatch(pos.clone(), "switch".to_string(), 1, usize::MAX, 0))?;
    let rest: Vec<Value> = iter.collect();
    let mut i = 0;
    while i + 1 < rest.len() {
        if rest[i] == key {
            return Ok(rest[i + 1].clone());
        }
        i += 2;
    }
    Ok(if i < rest.len() {
        rest[i].clone()
    } else {
        Value::Null
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::functions::FunctionRegistry;
    use indexmap::IndexMap;

    fn eval_str(src: &str, ctx: &mut Context, opts: EvalOptions) -> Result<Value, Error> {
        let expr = crate::parser::parse_expr(src, "test").unwrap();
        eval(&expr, ctx, &FunctionRegistry::with_builtins(), "test", src, opts)
    }

    #[test]
    fn arithmetic_promotes_to_decimal() {
        let mut ctx = Context::new(IndexMap::new());
        let v = eval_str("1 + 2.5", &mut ctx, EvalOptions::default()).unwrap();
        assert_eq!(v, Value::Decimal(3.5));
    }

    #[test]
    fn integer_division_stays_integer_when_exact() {
        let mut ctx = Context::new(IndexMap::new());
        let v = eval_str("6 / 2", &mut ctx, EvalOptions::default()).unwrap();
        assert_eq!(v, Value::Int(3));
    }

    #[test]
    fn division_by_zero_errors() {
        let mut ctx = Context::new(IndexMap::new());
        assert!(matches!(
            eval_str("1 / 0", &mut ctx, EvalOptions::default()),
            Err(Error::DivisionByZero(_))
        ));
    }

    #[test]
    fn missing_variable_is_null_in_lenient_mode_and_errors_in_strict() {
        let mut ctx = Context::new(IndexMap::new());
        let v = eval_str("missing", &mut ctx, EvalOptions::default()).unwrap();
        assert_eq!(v, Value::Null);
        let err = eval_str("missing", &mut ctx, EvalOptions { strict: true });
        assert!(matches!(err, Err(Error::MissingVariable(_, _))));
    }

    #[test]
    fn short_circuit_or_does_not_evaluate_right_side_errors() {
        let mut root = IndexMap::new();
        root.insert("x".to_string(), Value::Bool(true));
        let mut ctx = Context::new(root);
        // Division by zero on the right must not be reached.
        let v = eval_str("x || (1 / 0 == 1)", &mut ctx, EvalOptions::default()).unwrap();
        assert_eq!(v, Value::Bool(true));
    }

    #[test]
    fn switch_matches_first_equal_key() {
        let mut ctx = Context::new(IndexMap::new());
        let v = eval_str(
            r#"switch(2, 1, "one", 2, "two", "other")"#,
            &mut ctx,
            EvalOptions::default(),
        )
        .unwrap();
        assert_eq!(v, Value::str("two"));
    }

    #[test]
    fn contains_tests_list_membership() {
        let mut root = IndexMap::new();
        root.insert(
            "xs".to_string(),
            Value::list(vec![Value::Int(1), Value::Int(2)]),
        );
        let mut ctx = Context::new(root);
        let v = eval_str("xs contains 2", &mut ctx, EvalOptions::default()).unwrap();
        assert_eq!(v, Value::Bool(true));
    }

    #[test]
    fn coalesce_skips_only_null_and_empty_not_every_falsy_value() {
        let mut ctx = Context::new(IndexMap::new());
        let v = eval_str(r#"coalesce(false, "x")"#, &mut ctx, EvalOptions::default()).unwrap();
        assert_eq!(v, Value::Bool(false));
        let v = eval_str("coalesce(0, 5)", &mut ctx, EvalOptions::default()).unwrap();
        assert_eq!(v, Value::Int(0));
        let v = eval_str(r#"coalesce(null, "", x)"#, &mut ctx, EvalOptions::default()).unwrap();
        assert_eq!(v, Value::Null);
    }
}
