//! The validator: walks a prepared template's structural model without a
//! data context, collecting the set of referenced variables, functions, and
//! fragments, plus structural errors and warnings, the way a linter checks
//! a template before it is ever rendered.

use crate::ast::{Directive, Expr, ForBinding};
use crate::codemap::Spanned;
use crate::doc::{Body, BodyElement, Document, Table, TableRow};
use crate::error::{Error, Position};
use crate::fragment::FragmentStore;
use crate::functions::FunctionRegistry;
use crate::locate::{self, LocatedToken, ParagraphClass};
use crate::value::Value;
use std::collections::BTreeSet;

/// Which optional checks [`validate`] performs beyond collecting references
/// and structural errors.
#[derive(Clone, Copy, Debug, Default)]
pub struct ValidateOptions {
    /// Warn (or error, in strict mode) on a function call whose name is not
    /// registered.
    pub check_functions: bool,
    /// Warn (or error, in strict mode) on an `{{include "name"}}` whose
    /// fragment is not registered.
    pub check_fragments: bool,
    /// Promote every warning this validator would otherwise emit into an
    /// error instead.
    pub strict_mode: bool,
}

/// A non-fatal finding, or one promoted to an error under
/// [`ValidateOptions::strict_mode`].
#[derive(Clone, Debug, PartialEq)]
pub enum Warning {
    /// A function call referenced a name not present in the registry.
    UnregisteredFunction(Position, String),
    /// An `{{include "name"}}` referenced a fragment not present in the
    /// fragment store.
    UnregisteredFragment(Position, String),
    /// A directive paragraph also carried non-whitespace text outside its
    /// `{{ }}` span; the locator treats this as inline regardless of
    /// directive kind, per the tie-break rule.
    ExtraneousText(Position),
}

/// The result of validating a prepared template.
#[derive(Clone, Debug, Default)]
pub struct ValidationReport {
    /// Every identifier referenced by a bare `VariableRef`, across the
    /// whole template.
    pub variables: BTreeSet<String>,
    /// Every function called, paired with the argument count it was called
    /// with at each call site (a function may be validly called with
    /// different counts within its declared arity at different sites).
    pub functions: BTreeSet<(String, usize)>,
    /// Every statically-known fragment name referenced by `{{include}}`.
    /// Dynamic include targets (a non-literal expression) are not
    /// statically resolvable and are not collected here.
    pub fragments: BTreeSet<String>,
    /// Structural errors: unmatched directives, directives that failed to
    /// parse. Validation never aborts on these; they accumulate here.
    pub errors: Vec<Error>,
    /// Non-fatal findings, or errors if `strict_mode` promoted them.
    pub warnings: Vec<Warning>,
}

impl ValidationReport {
    /// True if this report has no errors and (outside strict mode) no
    /// warnings promoted to errors.
    pub fn is_ok(&self) -> bool {
        self.errors.is_empty()
    }

    fn raise(&mut self, opts: ValidateOptions, warning: Warning) {
        if opts.strict_mode {
            let err = match &warning {
                Warning::UnregisteredFunction(pos, name) => {
                    Error::MissingFunction(pos.clone(), name.clone())
                }
                Warning::UnregisteredFragment(pos, name) => {
                    Error::MissingFragment(pos.clone(), name.clone())
                }
                Warning::ExtraneousText(pos) => Error::TemplateSyntax(
                    pos.clone(),
                    "directive paragraph carries extraneous text".to_string(),
                ),
            };
            self.errors.push(err);
        } else {
            self.warnings.push(warning);
        }
    }
}

/// Validates a whole document's main body (and, identically, any header or
/// footer part a caller passes) against the given registries.
pub fn validate(
    doc: &Document,
    part: &str,
    functions: &FunctionRegistry,
    fragments: &FragmentStore,
    opts: ValidateOptions,
) -> ValidationReport {
    let mut report = ValidationReport::default();
    walk_body(&doc.body, part, functions, fragments, opts, &mut report);
    report
}

fn walk_body(
    body: &Body,
    part: &str,
    functions: &FunctionRegistry,
    fragments: &FragmentStore,
    opts: ValidateOptions,
    report: &mut ValidationReport,
) {
    walk_children(&body.children, part, functions, fragments, opts, report);
}

fn walk_children(
    children: &[BodyElement],
    part: &str,
    functions: &FunctionRegistry,
    fragments: &FragmentStore,
    opts: ValidateOptions,
    report: &mut ValidationReport,
) {
    let classes: Vec<Result<ParagraphClass, Error>> = children
        .iter()
        .map(|c| match c {
            BodyElement::Paragraph(p) => locate::classify_paragraph(p, part),
            _ => Ok(ParagraphClass::None),
        })
        .collect();

    let mut i = 0;
    while i < children.len() {
        let class = match &classes[i] {
            Ok(c) => c,
            Err(e) => {
                report.errors.push(e.clone());
                i += 1;
                continue;
            }
        };
        match class {
            ParagraphClass::None => {
                if let BodyElement::Table(t) = &children[i] {
                    walk_table(t, part, functions, fragments, opts, report);
                }
                i += 1;
            }
            ParagraphClass::ExpressionOnly(tokens) => {
                for tok in tokens {
                    walk_directive(&tok.directive, part, functions, fragments, opts, report);
                }
                i += 1;
            }
            ParagraphClass::Inline(tokens) => {
                let BodyElement::Paragraph(p) = &children[i] else {
                    unreachable!("Inline only classifies paragraphs")
                };
                if !locate::is_sole_content(&p.text(), tokens) {
                    report.raise(
                        opts,
                        Warning::ExtraneousText(Position::new(part, &p.text(), tokens[0].start)),
                    );
                }
                walk_inline_tokens(tokens, part, functions, fragments, opts, report);
                i += 1;
            }
            ParagraphClass::Opening(tok) if matches!(tok.directive, Directive::Include(_)) => {
                walk_directive(&tok.directive, part, functions, fragments, opts, report);
                i += 1;
            }
            ParagraphClass::Opening(_) => {
                let classes_only: Vec<ParagraphClass> = classes
                    .iter()
                    .map(|c| c.clone().unwrap_or(ParagraphClass::None))
                    .collect();
                match locate::scan_block(&classes_only, i, part) {
                    Ok(block) => {
                        for branch in &block.branches {
                            walk_directive(&branch.token.directive, part, functions, fragments, opts, report);
                        }
                        for (bi, branch) in block.branches.iter().enumerate() {
                            let lo = branch.index + 1;
                            let hi = block
                                .branches
                                .get(bi + 1)
                                .map(|b| b.index)
                                .unwrap_or(block.end);
                            walk_children(&children[lo..hi], part, functions, fragments, opts, report);
                        }
                        i = block.end + 1;
                    }
                    Err(e) => {
                        report.errors.push(e);
                        break;
                    }
                }
            }
            ParagraphClass::Continuation(_) | ParagraphClass::Closing(_) => {
                report.errors.push(Error::UnmatchedDirective(
                    Position::new(part, "", 0),
                    "stray `elsif`/`else`/`end` with no matching opening directive".to_string(),
                ));
                i += 1;
            }
        }
    }
}

fn walk_table(
    table: &Table,
    part: &str,
    functions: &FunctionRegistry,
    fragments: &FragmentStore,
    opts: ValidateOptions,
    report: &mut ValidationReport,
) {
    let classes: Vec<Result<ParagraphClass, Error>> = table
        .rows
        .iter()
        .map(|r| locate::classify_row(r, part))
        .collect();

    let mut i = 0;
    while i < table.rows.len() {
        let class = match &classes[i] {
            Ok(c) => c,
            Err(e) => {
                report.errors.push(e.clone());
                i += 1;
                continue;
            }
        };
        match class {
            ParagraphClass::None => {
                walk_row(&table.rows[i], part, functions, fragments, opts, report);
                i += 1;
            }
            ParagraphClass::Opening(_) => {
                let classes_only: Vec<ParagraphClass> = classes
                    .iter()
                    .map(|c| c.clone().unwrap_or(ParagraphClass::None))
                    .collect();
                match locate::scan_block(&classes_only, i, part) {
                    Ok(block) => {
                        for branch in &block.branches {
                            walk_directive(&branch.token.directive, part, functions, fragments, opts, report);
                        }
                        for (bi, branch) in block.branches.iter().enumerate() {
                            let lo = branch.index + 1;
                            let hi = block
                                .branches
                                .get(bi + 1)
                                .map(|b| b.index)
                                .unwrap_or(block.end);
                            for row in &table.rows[lo..hi] {
                                walk_row(row, part, functions, fragments, opts, report);
                            }
                        }
                        i = block.end + 1;
                    }
                    Err(e) => {
                        report.errors.push(e);
                        break;
                    }
                }
            }
            _ => {
                report.errors.push(Error::UnmatchedDirective(
                    Position::new(part, "", 0),
                    "stray continuation/closing directive row".to_string(),
                ));
                i += 1;
            }
        }
    }
}

fn walk_row(
    row: &TableRow,
    part: &str,
    functions: &FunctionRegistry,
    fragments: &FragmentStore,
    opts: ValidateOptions,
    report: &mut ValidationReport,
) {
    for cell in &row.cells {
        for p in &cell.paragraphs {
            let Ok(class) = locate::classify_paragraph(p, part) else {
                continue;
            };
            match class {
                ParagraphClass::ExpressionOnly(tokens) => {
                    for tok in &tokens {
                        walk_directive(&tok.directive, part, functions, fragments, opts, report);
                    }
                }
                ParagraphClass::Inline(tokens) => {
                    if !locate::is_sole_content(&p.text(), &tokens) {
                        report.raise(
                            opts,
                            Warning::ExtraneousText(Position::new(part, &p.text(), tokens[0].start)),
                        );
                    }
                    walk_inline_tokens(&tokens, part, functions, fragments, opts, report);
                }
                _ => {}
            }
        }
    }
}

/// Validates a flat token list from an inline (self-contained-within-one-
/// paragraph) directive run, tracking `for`/`if`/`unless`/`end` nesting
/// depth to flag stray continuation/closing tokens, without needing to
/// extract each branch's body range (there is nothing further to validate
/// inside a body beyond the tokens already in this same list).
fn walk_inline_tokens(
    tokens: &[LocatedToken],
    part: &str,
    functions: &FunctionRegistry,
    fragments: &FragmentStore,
    opts: ValidateOptions,
    report: &mut ValidationReport,
) {
    let mut depth = 0i32;
    for tok in tokens {
        walk_directive(&tok.directive, part, functions, fragments, opts, report);
        match &tok.directive {
            Directive::For(_) | Directive::If(_) | Directive::Unless(_) => depth += 1,
            Directive::End => {
                if depth == 0 {
                    report.errors.push(Error::UnmatchedDirective(
                        Position::new(part, "", tok.start),
                        "stray `end` inside an inline block".to_string(),
                    ));
                } else {
                    depth -= 1;
                }
            }
            Directive::Elsif(_) | Directive::Else if depth == 0 => {
                report.errors.push(Error::UnmatchedDirective(
                    Position::new(part, "", tok.start),
                    "stray `elsif`/`else` inside an inline block".to_string(),
                ));
            }
            _ => {}
        }
    }
    if depth > 0 {
        report.errors.push(Error::UnmatchedDirective(
            Position::new(part, "", 0),
            "no matching {{end}} for an inline directive".to_string(),
        ));
    }
}

fn walk_directive(
    directive: &Directive,
    part: &str,
    functions: &FunctionRegistry,
    fragments: &FragmentStore,
    opts: ValidateOptions,
    report: &mut ValidationReport,
) {
    match directive {
        Directive::Expr(e) => walk_expr(e, part, functions, opts, report),
        Directive::For(ForBinding { iterable, .. }) => {
            walk_expr(iterable, part, functions, opts, report)
        }
        Directive::If(cond) | Directive::Elsif(cond) | Directive::Unless(cond) => {
            walk_expr(cond, part, functions, opts, report)
        }
        Directive::Include(name_expr) => {
            walk_expr(name_expr, part, functions, opts, report);
            if let Expr::Literal(Value::String(name)) = &name_expr.node {
                report.fragments.insert(name.to_string());
                if opts.check_fragments && !fragments.contains(name) {
                    report.raise(
                        opts,
                        Warning::UnregisteredFragment(
                            Position::new(part, "", name_expr.span.start),
                            name.to_string(),
                        ),
                    );
                }
            }
        }
        Directive::Else | Directive::End => {}
    }
}

fn walk_expr(
    expr: &Spanned<Expr>,
    part: &str,
    functions: &FunctionRegistry,
    opts: ValidateOptions,
    report: &mut ValidationReport,
) {
    match &expr.node {
        Expr::Literal(_) => {}
        Expr::VariableRef(name) => {
            report.variables.insert(name.clone());
        }
        Expr::FieldAccess(base, _) => walk_expr(base, part, functions, opts, report),
        Expr::IndexAccess(base, index) => {
            walk_expr(base, part, functions, opts, report);
            walk_expr(index, part, functions, opts, report);
        }
        Expr::FunctionCall(name, args) => {
            report.functions.insert((name.clone(), args.len()));
            if opts.check_functions
                && !matches!(name.as_str(), "coalesce" | "switch")
                && !functions.contains(name)
            {
                report.raise(
                    opts,
                    Warning::UnregisteredFunction(
                        Position::new(part, "", expr.span.start),
                        name.clone(),
                    ),
                );
            }
            for arg in args {
                walk_expr(arg, part, functions, opts, report);
            }
        }
        Expr::Binary(_, l, r) => {
            walk_expr(l, part, functions, opts, report);
            walk_expr(r, part, functions, opts, report);
        }
        Expr::Unary(_, operand) => {
            walk_expr(operand, part, functions, opts, report);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::doc::{Paragraph, ParagraphChild, Run};

    fn p(text: &str) -> BodyElement {
        BodyElement::Paragraph(Paragraph {
            content: vec![ParagraphChild::Run(Run::text(text))],
            ..Default::default()
        })
    }

    #[test]
    fn collects_referenced_variables_and_functions() {
        let doc = Document {
            attrs: vec![],
            body: Body {
                children: vec![p("Hello, {{upper(name)}}!")],
                ..Default::default()
            },
        };
        let functions = FunctionRegistry::with_builtins();
        let fragments = FragmentStore::new();
        let report = validate(&doc, "t", &functions, &fragments, ValidateOptions::default());
        assert!(report.variables.contains("name"));
        assert!(report.functions.contains(&("upper".to_string(), 1)));
        assert!(report.is_ok());
    }

    #[test]
    fn flags_unregistered_function_as_warning_by_default() {
        let doc = Document {
            attrs: vec![],
            body: Body {
                children: vec![p("{{frobnicate(x)}}")],
                ..Default::default()
            },
        };
        let functions = FunctionRegistry::new();
        let fragments = FragmentStore::new();
        let opts = ValidateOptions { check_functions: true, ..Default::default() };
        let report = validate(&doc, "t", &functions, &fragments, opts);
        assert_eq!(report.warnings.len(), 1);
        assert!(report.is_ok());
    }

    #[test]
    fn strict_mode_promotes_warnings_to_errors() {
        let doc = Document {
            attrs: vec![],
            body: Body {
                children: vec![p("{{frobnicate(x)}}")],
                ..Default::default()
            },
        };
        let functions = FunctionRegistry::new();
        let fragments = FragmentStore::new();
        let opts = ValidateOptions { check_functions: true, strict_mode: true, ..Default::default() };
        let report = validate(&doc, "t", &functions, &fragments, opts);
        assert!(report.warnings.is_empty());
        assert_eq!(report.errors.len(), 1);
        assert!(!report.is_ok());
    }

    #[test]
    fn flags_extraneous_text_around_a_directive() {
        let doc = Document {
            attrs: vec![],
            body: Body {
                children: vec![p("prefix {{for x in xs}}")],
                ..Default::default()
            },
        };
        let functions = FunctionRegistry::with_builtins();
        let fragments = FragmentStore::new();
        let report = validate(&doc, "t", &functions, &fragments, ValidateOptions::default());
        assert!(report.warnings.iter().any(|w| matches!(w, Warning::ExtraneousText(_))));
    }

    #[test]
    fn reports_unmatched_directive_as_a_structural_error() {
        let doc = Document {
            attrs: vec![],
            body: Body {
                children: vec![p("{{if a}}"), p("body")],
                ..Default::default()
            },
        };
        let functions = FunctionRegistry::with_builtins();
        let fragments = FragmentStore::new();
        let report = validate(&doc, "t", &functions, &fragments, ValidateOptions::default());
        assert!(!report.is_ok());
    }

    #[test]
    fn collects_literal_fragment_names_and_checks_registration() {
        let doc = Document {
            attrs: vec![],
            body: Body {
                children: vec![p(r#"{{include "header"}}"#)],
                ..Default::default()
            },
        };
        let functions = FunctionRegistry::with_builtins();
        let fragments = FragmentStore::new();
        let opts = ValidateOptions { check_fragments: true, ..Default::default() };
        let report = validate(&doc, "t", &functions, &fragments, opts);
        assert!(report.fragments.contains("header"));
        assert_eq!(report.warnings.len(), 1);
    }
}
