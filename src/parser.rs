//! The template surface grammar: `{{ ... }}` directives and the expression
//! language they embed, built with a PEG grammar in the style the teacher
//! repo uses for its own token grammar.

use crate::ast::{BinaryOp, Directive, Expr, ForBinding, UnaryOp};
use crate::codemap::{Span, Spanned};
use crate::error::{Error, Position};
use crate::value::Value;

peg::parser! {
    grammar expr_grammar() for str {
        rule _() = quiet!{[' ' | '\t' | '\n' | '\r']*}

        rule word_boundary() = !['a'..='z' | 'A'..='Z' | '0'..='9' | '_']

        rule ident() -> &'input str
            = quiet!{ s:$(['a'..='z' | 'A'..='Z' | '_'] ['a'..='z' | 'A'..='Z' | '0'..='9' | '_']*) { s } }
            / expected!("identifier")

        rule integer() -> Spanned<Expr>
            = start:position!() s:$("-"? ['0'..='9']+) end:position!() {
                Spanned::new(Expr::Literal(Value::Int(s.parse().unwrap())), Span::new(start, end))
            }

        rule decimal() -> Spanned<Expr>
            = start:position!() s:$("-"? ['0'..='9']+ "." ['0'..='9']+) end:position!() {
                Spanned::new(Expr::Literal(Value::Decimal(s.parse().unwrap())), Span::new(start, end))
            }

        rule string_lit() -> Spanned<Expr>
            = start:position!() "\"" s:$((!['"'] [_])*) "\"" end:position!() {
                Spanned::new(Expr::Literal(Value::str(unescape(s))), Span::new(start, end))
            }

        rule bool_lit() -> Spanned<Expr>
            = start:position!() b:$("true" / "false") word_boundary() end:position!() {
                Spanned::new(Expr::Literal(Value::Bool(b == "true")), Span::new(start, end))
            }

        rule null_lit() -> Spanned<Expr>
            = start:position!() "null" word_boundary() end:position!() {
                Spanned::new(Expr::Literal(Value::Null), Span::new(start, end))
            }

        rule var_ref() -> Spanned<Expr>
            = start:position!() name:ident() end:position!() {
                Spanned::new(Expr::VariableRef(name.to_string()), Span::new(start, end))
            }

        rule args() -> Vec<Spanned<Expr>>
            = _ e:expr() _ rest:("," _ e:expr() _ { e })* { let mut v = vec![e]; v.extend(rest); v }
            / _ { vec![] }

        rule primary() -> Spanned<Expr>
            = start:position!() name:ident() _ "(" _ a:args() _ ")" end:position!() {
                Spanned::new(Expr::FunctionCall(name.to_string(), a), Span::new(start, end))
            }
            / decimal()
            / integer()
            / string_lit()
            / bool_lit()
            / null_lit()
            / var_ref()
            / "(" _ e:expr() _ ")" { e }

        rule postfixed() -> Spanned<Expr>
            = base:primary() rest:postfix_step()* {
                rest.into_iter().fold(base, |acc, step| step.apply(acc))
            }

        rule postfix_step() -> PostfixStep
            = _ "." _ name:ident() end:position!() { PostfixStep::Field(name.to_string(), end) }
            / _ "[" _ idx:expr() _ "]" end:position!() { PostfixStep::Index(idx, end) }

        rule unary() -> Spanned<Expr>
            = start:position!() "!" _ e:unary() end:position!() {
                Spanned::new(Expr::Unary(UnaryOp::Not, Box::new(e)), Span::new(start, end))
            }
            / start:position!() "-" _ e:unary() end:position!() {
                Spanned::new(Expr::Unary(UnaryOp::Neg, Box::new(e)), Span::new(start, end))
            }
            / postfixed()

        rule mul_div() -> Spanned<Expr>
            = l:unary() rest:(_ op:$("*" / "/" / "%") _ r:unary() { (op, r) })* {
                rest.into_iter().fold(l, |l, (op, r)| bin_op(l, op, r))
            }

        rule add_sub() -> Spanned<Expr>
            = l:mul_div() rest:(_ op:$("+" / "-") _ r:mul_div() { (op, r) })* {
                rest.into_iter().fold(l, |l, (op, r)| bin_op(l, op, r))
            }

        rule compare_op() -> &'input str
            = $("==" / "!=" / "<=" / ">=" / "<" / ">")
            / $("contains") word_boundary() { "contains" }

        rule compare() -> Spanned<Expr>
            = l:add_sub() rest:(_ op:compare_op() _ r:add_sub() { (op, r) })* {
                rest.into_iter().fold(l, |l, (op, r)| bin_op(l, op, r))
            }

        rule logic_and() -> Spanned<Expr>
            = l:compare() rest:(_ "&&" _ r:compare() { r })* {
                rest.into_iter().fold(l, |l, r| bin_op(l, "&&", r))
            }

        rule logic_or() -> Spanned<Expr>
            = l:logic_and() rest:(_ "||" _ r:logic_and() { r })* {
                rest.into_iter().fold(l, |l, r| bin_op(l, "||", r))
            }

        pub rule expr() -> Spanned<Expr> = logic_or()

        // `for item in iterable}}` binds a single name to the element. With
        // two names (`for index, item in iterable}}`), the first binds the
        // 0-based index and the second the element, matching the Go
        // `for index, value` convention this directive is modeled on.
        rule for_binding() -> ForBinding
            = first:ident() _ second:("," _ i:ident() { i })? _ "in" word_boundary() _ iterable:expr() {
                match second {
                    Some(item) => ForBinding { item: item.to_string(), index: Some(first.to_string()), iterable },
                    None => ForBinding { item: first.to_string(), index: None, iterable },
                }
            }

        pub rule directive() -> Directive
            = "for" word_boundary() _ b:for_binding() { Directive::For(b) }
            / "if" word_boundary() _ e:expr() { Directive::If(e) }
            / ("elsif" / "elseif" / "else if") word_boundary() _ e:expr() { Directive::Elsif(e) }
            / "else" word_boundary() { Directive::Else }
            / "unless" word_boundary() _ e:expr() { Directive::Unless(e) }
            / "include" word_boundary() _ e:expr() { Directive::Include(e) }
            / "end" word_boundary() { Directive::End }
            / e:expr() { Directive::Expr(e) }
    }
}

enum PostfixStep {
    Field(String, usize),
    Index(Spanned<Expr>, usize),
}

impl PostfixStep {
    fn apply(self, base: Spanned<Expr>) -> Spanned<Expr> {
        let start = base.span.start;
        match self {
            PostfixStep::Field(name, end) => {
                Spanned::new(Expr::FieldAccess(Box::new(base), name), Span::new(start, end))
            }
            PostfixStep::Index(idx, end) => {
                Spanned::new(Expr::IndexAccess(Box::new(base), Box::new(idx)), Span::new(start, end))
            }
        }
    }
}

fn bin_op(l: Spanned<Expr>, op: &str, r: Spanned<Expr>) -> Spanned<Expr> {
    let op = match op {
        "+" => BinaryOp::Add,
        "-" => BinaryOp::Sub,
        "*" => BinaryOp::Mul,
        "/" => BinaryOp::Div,
        "%" => BinaryOp::Mod,
        "==" => BinaryOp::Eq,
        "!=" => BinaryOp::Ne,
        "<" => BinaryOp::Lt,
        "<=" => BinaryOp::Le,
        ">" => BinaryOp::Gt,
        ">=" => BinaryOp::Ge,
        "&&" => BinaryOp::And,
        "||" => BinaryOp::Or,
        "contains" => BinaryOp::Contains,
        _ => unreachable!("grammar only emits known operators"),
    };
    let span = l.span.merge(r.span);
    Spanned::new(Expr::Binary(op, Box::new(l), Box::new(r)), span)
}

fn unescape(s: &str) -> String {
    let mut out = String::with_capacity(s.len());
    let mut chars = s.chars();
    while let Some(c) = chars.next() {
        if c == '\\' {
            match chars.next() {
                Some('n') => out.push('\n'),
                Some('t') => out.push('\t'),
                Some('"') => out.push('"'),
                Some('\\') => out.push('\\'),
                Some(other) => out.push(other),
                None => {}
            }
        } else {
            out.push(c);
        }
    }
    out
}

/// Parses a standalone expression (used for `for`'s iterable and similar
/// embedded contexts as well as top-level `{{expr}}` tokens).
pub fn parse_expr(source: &str, part: &str) -> Result<Spanned<Expr>, Error> {
    expr_grammar::expr(source).map_err(|e| {
        Error::TemplateSyntax(Position::new(part, source, e.location.offset), e.to_string())
    })
}

/// Parses the content of a single `{{ ... }}` token into a [`Directive`].
pub fn parse_directive(source: &str, part: &str) -> Result<Directive, Error> {
    expr_grammar::directive(source.trim()).map_err(|e| {
        Error::TemplateSyntax(Position::new(part, source, e.location.offset), e.to_string())
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_field_and_index_chains() {
        let e = parse_expr("user.name", "t").unwrap();
        assert!(matches!(e.node, Expr::FieldAccess(_, ref f) if f == "name"));
        let e = parse_expr("items[0].name", "t").unwrap();
        assert!(matches!(e.node, Expr::FieldAccess(..)));
    }

    #[test]
    fn precedence_is_conventional() {
        let e = parse_expr("1 + 2 * 3", "t").unwrap();
        match e.node {
            Expr::Binary(BinaryOp::Add, _, ref r) => {
                assert!(matches!(r.node, Expr::Binary(BinaryOp::Mul, ..)));
            }
            _ => panic!("expected addition at top level"),
        }
    }

    #[test]
    fn logical_short_circuit_parses_left_to_right() {
        let e = parse_expr("a && b || c", "t").unwrap();
        assert!(matches!(e.node, Expr::Binary(BinaryOp::Or, ..)));
    }

    #[test]
    fn directive_aliases_normalize_to_elsif() {
        let d1 = parse_directive("elsif x", "t").unwrap();
        let d2 = parse_directive("elseif x", "t").unwrap();
        assert!(matches!(d1, Directive::Elsif(_)));
        assert!(matches!(d2, Directive::Elsif(_)));
    }

    #[test]
    fn for_binding_parses_index_and_item() {
        let d = parse_directive("for i, x in items", "t").unwrap();
        match d {
            Directive::For(b) => {
                assert_eq!(b.item, "x");
                assert_eq!(b.index.as_deref(), Some("i"));
            }
            _ => panic!("expected for directive"),
        }
    }

    #[test]
    fn unbalanced_expression_is_a_syntax_error() {
        assert!(parse_expr("(1 + 2", "t").is_err());
    }
}
