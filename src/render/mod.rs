//! The structural renderer: walks a coalesced, directive-indexed document
//! tree and produces a new tree with directives evaluated and expressions
//! substituted, expanding loops and conditionals onto sibling paragraphs
//! or table rows as the directive locator classified them.

pub mod ops;

use crate::ast::{Directive, Expr, ForBinding};
use crate::cancel::CancellationToken;
use crate::codemap::Spanned;
use crate::context::Context;
use crate::doc::relationships::RelationshipTable;
use crate::doc::{
    Body, BodyElement, Document, Hyperlink, Paragraph, ParagraphChild, Run, Table, TableRow,
};
use crate::error::{Error, Position, Result};
use crate::eval::{self, EvalOptions};
use crate::fragment::{FragmentStore, IncludeStack, StyleTable};
use crate::functions::FunctionRegistry;
use crate::locate::{self, Block, ParagraphClass};
use crate::value::Value;
use ops::StructuralOp;

/// Per-row/per-cell signals a nested expression can raise that must be
/// applied at a coarser granularity than the paragraph it was found in.
#[derive(Debug, Default)]
pub struct RenderSignals {
    pub hide_row: bool,
    pub hide_columns: Vec<i64>,
}

/// The read-only collaborators and host-mutable state a render needs,
/// threaded through every recursive call. `ctx` (the data context) and the
/// include stack are passed alongside this rather than folded into it, so
/// recursive calls can hold a context frame guard and this environment
/// live at once without conflicting borrows.
pub struct RenderEnv<'a> {
    pub functions: &'a FunctionRegistry,
    pub fragments: &'a FragmentStore,
    pub host_relationships: &'a mut RelationshipTable,
    pub host_styles: &'a mut StyleTable,
    pub opts: EvalOptions,
    pub part: String,
    /// Checked between sibling elements during `render_children`; `None`
    /// means the caller supplied no cancellation signal.
    pub cancel: Option<&'a CancellationToken>,
}

fn eval_token(env: &RenderEnv, ctx: &mut Context, expr: &Spanned<Expr>, source: &str) -> Result<Value> {
    eval::eval(expr, ctx, env.functions, &env.part, source, env.opts)
}

fn iterate_value(v: &Value, pos: &Position) -> Result<Vec<(Value, Value)>> {
    match v {
        Value::List(items) => Ok(items
            .iter()
            .enumerate()
            .map(|(i, item)| (Value::Int(i as i64), item.clone()))
            .collect()),
        Value::Map(m) => Ok(m.iter().map(|(k, v)| (Value::str(k.clone()), v.clone())).collect()),
        other => Err(Error::TypeMismatch(
            pos.clone(),
            format!("for requires a list or map, got {}", other.type_name()),
        )),
    }
}

/// Renders a whole document under `ctx`.
pub fn render_document(
    doc: &Document,
    ctx: &mut Context,
    env: &mut RenderEnv,
    include_stack: &mut IncludeStack,
) -> Result<Document> {
    Ok(Document {
        attrs: doc.attrs.clone(),
        body: render_body(&doc.body, ctx, env, include_stack)?,
    })
}

/// Renders a document body: its children, then a final pass merging
/// tables that became adjacent once a directive-only paragraph between
/// them rendered to nothing.
pub fn render_body(
    body: &Body,
    ctx: &mut Context,
    env: &mut RenderEnv,
    include_stack: &mut IncludeStack,
) -> Result<Body> {
    let children = render_children(&body.children, ctx, env, include_stack)?;
    Ok(Body {
        children: merge_adjacent_tables(children),
        section_properties: body.section_properties.clone(),
    })
}

/// Renders a sibling sequence of body elements, resolving paragraph-level
/// `for`/`if`/`unless`/`include` directives that span them.
pub fn render_children(
    children: &[BodyElement],
    ctx: &mut Context,
    env: &mut RenderEnv,
    include_stack: &mut IncludeStack,
) -> Result<Vec<BodyElement>> {
    let classes: Vec<ParagraphClass> = children
        .iter()
        .map(|c| match c {
            BodyElement::Paragraph(p) => locate::classify_paragraph(p, &env.part),
            _ => Ok(ParagraphClass::None),
        })
        .collect::<Result<_>>()?;

    let mut out = Vec::new();
    let mut i = 0;
    while i < children.len() {
        if let Some(cancel) = env.cancel {
            cancel.check()?;
        }
        match &classes[i] {
            ParagraphClass::None => {
                match &children[i] {
                    BodyElement::Paragraph(p) => out.push(BodyElement::Paragraph(p.clone())),
                    BodyElement::Table(t) => {
                        out.push(BodyElement::Table(render_table(t, ctx, env, include_stack)?))
                    }
                    BodyElement::RawSection(r) => out.push(BodyElement::RawSection(r.clone())),
                }
                i += 1;
            }
            ParagraphClass::ExpressionOnly(tokens) => {
                let BodyElement::Paragraph(p) = &children[i] else {
                    unreachable!("ExpressionOnly only classifies paragraphs")
                };
                out.extend(render_expression_only(p, tokens, ctx, env, None)?);
                i += 1;
            }
            ParagraphClass::Inline(tokens) => {
                let BodyElement::Paragraph(p) = &children[i] else {
                    unreachable!("Inline only classifies paragraphs")
                };
                out.extend(render_inline(p, tokens, ctx, env, include_stack)?);
                i += 1;
            }
            ParagraphClass::Opening(tok) if matches!(tok.directive, Directive::Include(_)) => {
                let Directive::Include(name_expr) = &tok.directive else { unreachable!() };
                out.extend(render_include(name_expr, &tok.source, ctx, env, include_stack)?);
                i += 1;
            }
            ParagraphClass::Opening(tok) => {
                let block = locate::scan_block(&classes, i, &env.part)?;
                match &tok.directive {
                    Directive::For(binding) => {
                        out.extend(render_for_block(
                            binding,
                            &children[i + 1..block.end],
                            ctx,
                            env,
                            include_stack,
                            &tok.source,
                        )?);
                    }
                    Directive::If(_) | Directive::Unless(_) => {
                        out.extend(render_if_block(&block, children, ctx, env, include_stack)?);
                    }
                    _ => unreachable!("only for/if/unless reach scan_block"),
                }
                i = block.end + 1;
            }
            ParagraphClass::Continuation(_) | ParagraphClass::Closing(_) => {
                return Err(Error::UnmatchedDirective(
                    Position::new(&env.part, "", 0),
                    "stray `elsif`/`else`/`end` with no matching opening directive".to_string(),
                ));
            }
        }
    }
    Ok(out)
}

fn render_for_block(
    binding: &ForBinding,
    body: &[BodyElement],
    ctx: &mut Context,
    env: &mut RenderEnv,
    include_stack: &mut IncludeStack,
    source: &str,
) -> Result<Vec<BodyElement>> {
    let pos = Position::new(&env.part, source, binding.iterable.span.start);
    let iterable = eval_token(env, ctx, &binding.iterable, source)?;
    let items = iterate_value(&iterable, &pos)?;
    let mut out = Vec::new();
    for (index, item) in items {
        let mut frame = ctx.push();
        frame.bind(binding.item.clone(), item);
        if let Some(index_name) = &binding.index {
            frame.bind(index_name.clone(), index);
        }
        out.extend(render_children(body, frame.ctx(), env, include_stack)?);
    }
    Ok(out)
}

fn render_if_block(
    block: &Block,
    children: &[BodyElement],
    ctx: &mut Context,
    env: &mut RenderEnv,
    include_stack: &mut IncludeStack,
) -> Result<Vec<BodyElement>> {
    for (bi, branch) in block.branches.iter().enumerate() {
        let matched = match &branch.token.directive {
            Directive::If(cond) => eval_token(env, ctx, cond, &branch.token.source)?.is_truthy(),
            Directive::Unless(cond) => {
                !eval_token(env, ctx, cond, &branch.token.source)?.is_truthy()
            }
            Directive::Elsif(cond) => eval_token(env, ctx, cond, &branch.token.source)?.is_truthy(),
            Directive::Else => true,
            _ => unreachable!("if-block branches are always conditional directives"),
        };
        if matched {
            let body_lo = branch.index + 1;
            let body_hi = block.branches.get(bi + 1).map(|b| b.index).unwrap_or(block.end);
            return render_children(&children[body_lo..body_hi], ctx, env, include_stack);
        }
    }
    Ok(Vec::new())
}

fn render_include(
    name_expr: &Spanned<Expr>,
    source: &str,
    ctx: &mut Context,
    env: &mut RenderEnv,
    include_stack: &mut IncludeStack,
) -> Result<Vec<BodyElement>> {
    let pos = Position::new(&env.part, source, name_expr.span.start);
    let name_value = eval_token(env, ctx, name_expr, source)?;
    let name = match &name_value {
        Value::String(s) => s.to_string(),
        other => {
            return Err(Error::TypeMismatch(
                pos,
                format!("include requires a string fragment name, got {}", other.type_name()),
            ))
        }
    };
    let fragment = env
        .fragments
        .get(&name)
        .cloned()
        .ok_or_else(|| Error::MissingFragment(pos.clone(), name.clone()))?;
    let _guard = include_stack.enter(&name, &pos)?;
    let spliced = crate::fragment::splice(&fragment, env.host_relationships, env.host_styles);
    render_children(&spliced, ctx, env, include_stack)
}

/// Renders a named fragment inline (an `{{include}}` sharing a paragraph
/// with other text, or nested inside an inline `for`/`if`): splices and
/// renders the fragment the same way a paragraph-level include does, then
/// flattens its paragraphs' text, joined by newlines, since an inline
/// position cannot itself hold separate paragraphs.
fn render_include_inline(
    name_expr: &Spanned<Expr>,
    source: &str,
    ctx: &mut Context,
    env: &mut RenderEnv,
    include_stack: &mut IncludeStack,
) -> Result<String> {
    let elements = render_include(name_expr, source, ctx, env, include_stack)?;
    Ok(elements
        .iter()
        .filter_map(|e| match e {
            BodyElement::Paragraph(p) => Some(p.text()),
            _ => None,
        })
        .collect::<Vec<_>>()
        .join("\n"))
}

/// Renders a table: resolves row-level `for`/`if`/`unless` blocks whose
/// opening directive is the sole content of the first paragraph of the
/// first cell of a row, then applies any column hides requested by cell
/// content.
pub fn render_table(
    table: &Table,
    ctx: &mut Context,
    env: &mut RenderEnv,
    include_stack: &mut IncludeStack,
) -> Result<Table> {
    let classes: Vec<ParagraphClass> = table
        .rows
        .iter()
        .map(|r| locate::classify_row(r, &env.part))
        .collect::<Result<_>>()?;

    let mut rows = Vec::new();
    let mut hide_columns: Vec<i64> = Vec::new();
    let mut i = 0;
    while i < table.rows.len() {
        match &classes[i] {
            ParagraphClass::None => {
                if let Some(row) = render_row(&table.rows[i], ctx, env, include_stack, &mut hide_columns)? {
                    rows.push(row);
                }
                i += 1;
            }
            ParagraphClass::Opening(_) => {
                let block = locate::scan_block(&classes, i, &env.part)?;
                let ParagraphClass::Opening(tok) = &classes[i] else { unreachable!() };
                match &tok.directive {
                    Directive::For(binding) => {
                        rows.extend(render_for_rows(
                            binding,
                            &table.rows[i + 1..block.end],
                            ctx,
                            env,
                            include_stack,
                            &tok.source,
                            &mut hide_columns,
                        )?);
                    }
                    Directive::If(_) | Directive::Unless(_) => {
                        rows.extend(render_if_rows(
                            &block,
                            &table.rows,
                            ctx,
                            env,
                            include_stack,
                            &mut hide_columns,
                        )?);
                    }
                    _ => unreachable!("row-level Opening is always for/if/unless"),
                }
                i = block.end + 1;
            }
            _ => {
                return Err(Error::UnmatchedDirective(
                    Position::new(&env.part, "", 0),
                    "stray continuation/closing directive row".to_string(),
                ));
            }
        }
    }

    let mut result = Table {
        properties: table.properties.clone(),
        grid: table.grid.clone(),
        rows,
    };
    apply_hide_columns(&mut result, &hide_columns);
    Ok(result)
}

fn render_for_rows(
    binding: &ForBinding,
    body: &[TableRow],
    ctx: &mut Context,
    env: &mut RenderEnv,
    include_stack: &mut IncludeStack,
    source: &str,
    hide_columns: &mut Vec<i64>,
) -> Result<Vec<TableRow>> {
    let pos = Position::new(&env.part, source, binding.iterable.span.start);
    let iterable = eval_token(env, ctx, &binding.iterable, source)?;
    let items = iterate_value(&iterable, &pos)?;
    let mut out = Vec::new();
    for (index, item) in items {
        let mut frame = ctx.push();
        frame.bind(binding.item.clone(), item);
        if let Some(index_name) = &binding.index {
            frame.bind(index_name.clone(), index);
        }
        for row in body {
            if let Some(rendered) = render_row(row, frame.ctx(), env, include_stack, hide_columns)? {
                out.push(rendered);
            }
        }
    }
    Ok(out)
}

fn render_if_rows(
    block: &Block,
    rows: &[TableRow],
    ctx: &mut Context,
    env: &mut RenderEnv,
    include_stack: &mut IncludeStack,
    hide_columns: &mut Vec<i64>,
) -> Result<Vec<TableRow>> {
    for (bi, branch) in block.branches.iter().enumerate() {
        let matched = match &branch.token.directive {
            Directive::If(cond) => eval_token(env, ctx, cond, &branch.token.source)?.is_truthy(),
            Directive::Unless(cond) => {
                !eval_token(env, ctx, cond, &branch.token.source)?.is_truthy()
            }
            Directive::Elsif(cond) => eval_token(env, ctx, cond, &branch.token.source)?.is_truthy(),
            Directive::Else => true,
            _ => unreachable!("if-row branches are always conditional directives"),
        };
        if matched {
            let body_lo = branch.index + 1;
            let body_hi = block.branches.get(bi + 1).map(|b| b.index).unwrap_or(block.end);
            let mut out = Vec::new();
            for row in &rows[body_lo..body_hi] {
                if let Some(rendered) = render_row(row, ctx, env, include_stack, hide_columns)? {
                    out.push(rendered);
                }
            }
            return Ok(out);
        }
    }
    Ok(Vec::new())
}

/// Renders a single (non-directive-bound) row: each cell's paragraphs,
/// collecting any `hide_row`/`hide_column` signals raised within. Returns
/// `None` if the row itself should be omitted from output.
fn render_row(
    row: &TableRow,
    ctx: &mut Context,
    env: &mut RenderEnv,
    include_stack: &mut IncludeStack,
    hide_columns: &mut Vec<i64>,
) -> Result<Option<TableRow>> {
    let mut signals = RenderSignals::default();
    let mut cells = Vec::with_capacity(row.cells.len());
    for cell in &row.cells {
        let mut paragraphs = Vec::with_capacity(cell.paragraphs.len());
        for p in &cell.paragraphs {
            paragraphs.extend(render_cell_paragraph(p, ctx, env, include_stack, &mut signals)?);
        }
        if paragraphs.is_empty() {
            paragraphs.push(Paragraph::default());
        }
        cells.push(crate::doc::TableCell {
            properties: cell.properties.clone(),
            paragraphs,
        });
    }
    hide_columns.extend(signals.hide_columns);
    if signals.hide_row {
        return Ok(None);
    }
    Ok(Some(TableRow { properties: row.properties.clone(), cells }))
}

fn render_cell_paragraph(
    p: &Paragraph,
    ctx: &mut Context,
    env: &mut RenderEnv,
    include_stack: &mut IncludeStack,
    signals: &mut RenderSignals,
) -> Result<Vec<Paragraph>> {
    let class = locate::classify_paragraph(p, &env.part)?;
    match class {
        ParagraphClass::None => Ok(vec![p.clone()]),
        ParagraphClass::ExpressionOnly(tokens) => {
            let elements = render_expression_only(p, &tokens, ctx, env, Some(signals))?;
            Ok(elements
                .into_iter()
                .filter_map(|e| match e {
                    BodyElement::Paragraph(p) => Some(p),
                    _ => None,
                })
                .collect())
        }
        ParagraphClass::Inline(tokens) => {
            let elements = render_inline(p, &tokens, ctx, env, include_stack)?;
            Ok(elements
                .into_iter()
                .filter_map(|e| match e {
                    BodyElement::Paragraph(p) => Some(p),
                    _ => None,
                })
                .collect())
        }
        // A cell cannot itself host a paragraph-level for/if/include block
        // between its paragraphs in this model; such a directive inside a
        // cell is evaluated inline instead.
        ParagraphClass::Opening(_) | ParagraphClass::Continuation(_) | ParagraphClass::Closing(_) => {
            Ok(vec![p.clone()])
        }
    }
}

fn apply_hide_columns(table: &mut Table, hide_columns: &[i64]) {
    if hide_columns.is_empty() {
        return;
    }
    let mut sorted: Vec<usize> = hide_columns.iter().filter_map(|&i| usize::try_from(i).ok()).collect();
    sorted.sort_unstable();
    sorted.dedup();
    for &idx in sorted.iter().rev() {
        if idx < table.grid.len() {
            table.grid.remove(idx);
        }
        for row in &mut table.rows {
            if idx < row.cells.len() {
                row.cells.remove(idx);
            }
        }
    }
}

/// Substitutes every `{{expr}}` in a paragraph classified as
/// expression-only. Per the coalescing invariant, each token lives wholly
/// within one run (or within one hyperlink's runs), so substitution works
/// run-by-run rather than via the paragraph's flattened text.
fn render_expression_only(
    p: &Paragraph,
    _tokens: &[locate::LocatedToken],
    ctx: &mut Context,
    env: &mut RenderEnv,
    mut signals: Option<&mut RenderSignals>,
) -> Result<Vec<BodyElement>> {
    let mut raw_markup: Option<String> = None;
    let mut content = Vec::with_capacity(p.content.len());
    for child in &p.content {
        match child {
            ParagraphChild::Run(r) => {
                content.extend(substitute_run(r, ctx, env, &mut signals, &mut raw_markup)?);
            }
            ParagraphChild::Hyperlink(h) => {
                content.push(ParagraphChild::Hyperlink(substitute_hyperlink(
                    h,
                    ctx,
                    env,
                    &mut signals,
                )?));
            }
            other => content.push(other.clone()),
        }
    }
    if let Some(xml) = raw_markup {
        return Ok(vec![BodyElement::RawSection(crate::doc::RawElement {
            tag: "w:p".to_string(),
            attrs: Vec::new(),
            inner_xml: xml,
        })]);
    }
    Ok(vec![BodyElement::Paragraph(Paragraph {
        properties: p.properties.clone(),
        content,
    })])
}

fn substitute_run(
    r: &Run,
    ctx: &mut Context,
    env: &mut RenderEnv,
    signals: &mut Option<&mut RenderSignals>,
    raw_markup: &mut Option<String>,
) -> Result<Vec<ParagraphChild>> {
    let Some(text) = &r.text else {
        return Ok(vec![ParagraphChild::Run(r.clone())]);
    };
    if !text.contains("{{") && !text.contains("}}") {
        return Ok(vec![ParagraphChild::Run(r.clone())]);
    }
    let mut link_out = None;
    let substituted = substitute_text(text, ctx, env, signals, raw_markup, &mut link_out)?;
    Ok(split_on_newlines(&substituted, r))
}

fn substitute_hyperlink(
    h: &Hyperlink,
    ctx: &mut Context,
    env: &mut RenderEnv,
    signals: &mut Option<&mut RenderSignals>,
) -> Result<Hyperlink> {
    let mut link_url: Option<String> = None;
    let mut runs = Vec::with_capacity(h.runs.len());
    for r in &h.runs {
        let Some(text) = &r.text else {
            runs.push(r.clone());
            continue;
        };
        if !text.contains("{{") && !text.contains("}}") {
            runs.push(r.clone());
            continue;
        }
        let mut raw_markup = None;
        let mut link_out = None;
        let substituted = substitute_text(text, ctx, env, signals, &mut raw_markup, &mut link_out)?;
        if link_out.is_some() {
            link_url = link_out;
        }
        runs.extend(split_on_newlines(&substituted, r));
    }
    if let Some(url) = link_url {
        let target = crate::doc::relationships::RelationshipTarget::Url(url);
        let new_id = env.host_relationships.allocate(
            target,
            true,
            "http://schemas.openxmlformats.org/officeDocument/2006/relationships/hyperlink".to_string(),
        );
        return Ok(Hyperlink { relationship_id: new_id, runs });
    }
    Ok(Hyperlink { relationship_id: h.relationship_id.clone(), runs })
}

/// Unescapes the `}}}}` literal-brace escape (spec §4.1/§6) within a plain
/// (non-directive) text segment. `{{{{` is handled separately in
/// [`substitute_text`]'s main loop since it competes with real token starts.
fn unescape_literal_braces(segment: &str) -> std::borrow::Cow<'_, str> {
    if segment.contains("}}}}") {
        std::borrow::Cow::Owned(segment.replace("}}}}", "}}"))
    } else {
        std::borrow::Cow::Borrowed(segment)
    }
}

fn substitute_text(
    text: &str,
    ctx: &mut Context,
    env: &mut RenderEnv,
    signals: &mut Option<&mut RenderSignals>,
    raw_markup: &mut Option<String>,
    link_out: &mut Option<String>,
) -> Result<String> {
    let mut out = String::new();
    let mut i = 0;
    while i < text.len() {
        let Some(rel) = text[i..].find("{{") else {
            out.push_str(&unescape_literal_braces(&text[i..]));
            break;
        };
        let open = i + rel;
        out.push_str(&unescape_literal_braces(&text[i..open]));
        if text[open..].starts_with("{{{{") {
            out.push_str("{{");
            i = open + 4;
            continue;
        }
        let inner_start = open + 2;
        let close = text[inner_start..].find("}}").ok_or_else(|| {
            Error::TemplateSyntax(
                Position::new(&env.part, text, open),
                "unclosed `{{`".to_string(),
            )
        })?;
        let inner = &text[inner_start..inner_start + close];
        let directive = crate::parser::parse_directive(inner, &env.part)?;
        let end = inner_start + close + 2;
        let Directive::Expr(e) = directive else {
            return Err(Error::TemplateSyntax(
                Position::new(&env.part, text, open),
                "control directives are not valid inside an expression-only token".to_string(),
            ));
        };
        let v = eval_token(env, ctx, &e, inner.trim())?;
        match StructuralOp::from_value(&v) {
            Some(StructuralOp::HideRow) => {
                if let Some(s) = signals.as_mut() {
                    s.hide_row = true;
                }
            }
            Some(StructuralOp::HideColumn(idx)) => {
                if let Some(s) = signals.as_mut() {
                    s.hide_columns.push(idx);
                }
            }
            Some(StructuralOp::PageBreak) => {
                // Encoded as a marker the caller splits on, alongside
                // plain newlines, into its own break run.
                out.push('\u{c}');
            }
            Some(StructuralOp::ReplaceLink(url)) => {
                *link_out = Some(url);
            }
            Some(StructuralOp::RawMarkup(xml)) => {
                *raw_markup = Some(xml);
            }
            None => out.push_str(&v.to_display_string()),
        }
        i = end;
    }
    Ok(out)
}

/// Splits substituted text on `\n` (embedded newlines from a substituted
/// value) and on the page-break marker, producing separate break runs,
/// all sharing the original run's properties.
fn split_on_newlines(text: &str, template: &Run) -> Vec<ParagraphChild> {
    let mut out = Vec::new();
    let mut buf = String::new();
    for c in text.chars() {
        match c {
            '\n' | '\u{c}' => {
                if !buf.is_empty() {
                    out.push(ParagraphChild::Run(Run {
                        properties: template.properties.clone(),
                        text: Some(std::mem::take(&mut buf)),
                        preserve_space: template.preserve_space,
                        ..Default::default()
                    }));
                }
                let break_run = if c == '\u{c}' { Run::page_break() } else { Run::line_break() };
                out.push(ParagraphChild::Run(Run {
                    properties: template.properties.clone(),
                    ..break_run
                }));
            }
            other => buf.push(other),
        }
    }
    if !buf.is_empty() || out.is_empty() {
        out.push(ParagraphChild::Run(Run {
            properties: template.properties.clone(),
            text: Some(buf),
            preserve_space: template.preserve_space,
            ..Default::default()
        }));
    }
    out
}

struct InlineBlock {
    end: usize,
    branches: Vec<usize>,
}

fn scan_inline_block(tokens: &[locate::LocatedToken], start: usize) -> Result<InlineBlock> {
    let mut branches = vec![start];
    let mut depth = 0i32;
    let mut i = start + 1;
    while i < tokens.len() {
        match &tokens[i].directive {
            Directive::For(_) | Directive::If(_) | Directive::Unless(_) => {
                depth += 1;
                i += 1;
            }
            Directive::Include(_) => {
                i += 1;
            }
            Directive::Elsif(_) | Directive::Else if depth == 0 => {
                branches.push(i);
                i += 1;
            }
            Directive::End if depth == 0 => {
                return Ok(InlineBlock { end: i, branches });
            }
            Directive::End => {
                depth -= 1;
                i += 1;
            }
            _ => i += 1,
        }
    }
    Err(Error::UnmatchedDirective(
        Position::default(),
        "no matching {{end}} for this inline directive".to_string(),
    ))
}

/// Renders an inline self-contained block (a `for`/`if`/`unless` that
/// opens and closes within the same paragraph). Renders to plain
/// substituted text — formatting distinctions between runs spanned by an
/// inline directive are not preserved, matching how coarse-grained inline
/// control flow is in practice.
fn render_inline(
    p: &Paragraph,
    tokens: &[locate::LocatedToken],
    ctx: &mut Context,
    env: &mut RenderEnv,
    include_stack: &mut IncludeStack,
) -> Result<Vec<BodyElement>> {
    let text = p.text();
    let rendered =
        render_token_range(&text, tokens, 0, tokens.len(), 0, text.len(), ctx, env, include_stack)?;
    if rendered.is_empty() {
        return Ok(Vec::new());
    }
    let props = p.runs().next().map(|r| r.properties.clone()).unwrap_or_default();
    let template = Run { properties: props, ..Default::default() };
    Ok(vec![BodyElement::Paragraph(Paragraph {
        properties: p.properties.clone(),
        content: split_on_newlines(&rendered, &template),
    })])
}

#[allow(clippy::too_many_arguments)]
fn render_token_range(
    text: &str,
    tokens: &[locate::LocatedToken],
    lo: usize,
    hi: usize,
    text_lo: usize,
    text_hi: usize,
    ctx: &mut Context,
    env: &mut RenderEnv,
    include_stack: &mut IncludeStack,
) -> Result<String> {
    let mut out = String::new();
    let mut cursor = text_lo;
    let mut i = lo;
    while i < hi {
        let tok = &tokens[i];
        out.push_str(&text[cursor..tok.start]);
        match &tok.directive {
            Directive::Expr(e) => {
                let v = eval_token(env, ctx, e, &tok.source)?;
                if StructuralOp::from_value(&v).is_none() {
                    out.push_str(&v.to_display_string());
                }
                cursor = tok.end;
                i += 1;
            }
            Directive::Include(name_expr) => {
                let fragment_text =
                    render_include_inline(name_expr, &tok.source, ctx, env, include_stack)?;
                out.push_str(&fragment_text);
                cursor = tok.end;
                i += 1;
            }
            Directive::For(binding) => {
                let block = scan_inline_block(tokens, i)?;
                let body_lo = i + 1;
                let body_hi = block.end;
                let body_text_lo = tok.end;
                let body_text_hi = tokens[block.end].start;
                let pos = Position::new(&env.part, &tok.source, binding.iterable.span.start);
                let iterable = eval_token(env, ctx, &binding.iterable, &tok.source)?;
                let items = iterate_value(&iterable, &pos)?;
                for (index, item) in items {
                    let mut frame = ctx.push();
                    frame.bind(binding.item.clone(), item);
                    if let Some(index_name) = &binding.index {
                        frame.bind(index_name.clone(), index);
                    }
                    let rendered = render_token_range(
                        text,
                        tokens,
                        body_lo,
                        body_hi,
                        body_text_lo,
                        body_text_hi,
                        frame.ctx(),
                        env,
                        include_stack,
                    )?;
                    out.push_str(&rendered);
                }
                cursor = tokens[block.end].end;
                i = block.end + 1;
            }
            Directive::If(_) | Directive::Unless(_) => {
                let block = scan_inline_block(tokens, i)?;
                let mut chosen = None;
                for (bi, &branch_idx) in block.branches.iter().enumerate() {
                    let matched = match &tokens[branch_idx].directive {
                        Directive::If(cond) => {
                            eval_token(env, ctx, cond, &tokens[branch_idx].source)?.is_truthy()
                        }
                        Directive::Unless(cond) => {
                            !eval_token(env, ctx, cond, &tokens[branch_idx].source)?.is_truthy()
                        }
                        Directive::Elsif(cond) => {
                            eval_token(env, ctx, cond, &tokens[branch_idx].source)?.is_truthy()
                        }
                        Directive::Else => true,
                        _ => unreachable!(),
                    };
                    if matched {
                        let body_lo = branch_idx + 1;
                        let body_hi =
                            block.branches.get(bi + 1).copied().unwrap_or(block.end);
                        chosen = Some((body_lo, body_hi));
                        break;
                    }
                }
                if let Some((body_lo, body_hi)) = chosen {
                    let body_text_lo = tokens[body_lo - 1].end;
                    let body_text_hi = if body_hi == block.end {
                        tokens[block.end].start
                    } else {
                        tokens[body_hi].start
                    };
                    let rendered = render_token_range(
                        text, tokens, body_lo, body_hi, body_text_lo, body_text_hi, ctx, env,
                        include_stack,
                    )?;
                    out.push_str(&rendered);
                }
                cursor = tokens[block.end].end;
                i = block.end + 1;
            }
            Directive::Elsif(_) | Directive::Else | Directive::End => {
                return Err(Error::UnmatchedDirective(
                    Position::new(&env.part, &tok.source, 0),
                    "stray `elsif`/`else`/`end` inside an inline block".to_string(),
                ));
            }
        }
    }
    out.push_str(&text[cursor..text_hi]);
    Ok(out)
}

/// Merges adjacent tables that share an identical grid into one, which
/// happens when a directive-only paragraph between two authored tables
/// renders to nothing (its loop body was empty, or its condition was
/// false) and leaves them truly adjacent.
fn merge_adjacent_tables(children: Vec<BodyElement>) -> Vec<BodyElement> {
    let mut out: Vec<BodyElement> = Vec::with_capacity(children.len());
    for child in children {
        if let BodyElement::Table(t) = &child {
            if let Some(BodyElement::Table(prev)) = out.last_mut() {
                if prev.grid == t.grid && prev.properties == t.properties {
                    prev.rows.extend(t.rows.clone());
                    continue;
                }
            }
        }
        out.push(child);
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fragment::{Fragment, FragmentStore};
    use indexmap::IndexMap;

    fn env<'a>(
        functions: &'a FunctionRegistry,
        fragments: &'a FragmentStore,
        relationships: &'a mut RelationshipTable,
        styles: &'a mut StyleTable,
    ) -> RenderEnv<'a> {
        RenderEnv {
            functions,
            fragments,
            host_relationships: relationships,
            host_styles: styles,
            opts: EvalOptions::default(),
            part: "document.xml".to_string(),
            cancel: None,
        }
    }

    fn text_paragraph(text: &str) -> Paragraph {
        Paragraph {
            content: vec![ParagraphChild::Run(Run::text(text))],
            ..Default::default()
        }
    }

    #[test]
    fn substitutes_a_simple_expression() {
        let functions = FunctionRegistry::with_builtins();
        let fragments = FragmentStore::new();
        let mut rels = RelationshipTable::new();
        let mut styles = StyleTable::new();
        let mut e = env(&functions, &fragments, &mut rels, &mut styles);
        let mut root = IndexMap::new();
        root.insert("name".to_string(), Value::str("Ada"));
        let mut ctx = Context::new(root);
        let p = text_paragraph("Hello, {{name}}!");
        let mut stack = IncludeStack::new(10);
        let rendered = render_children(&[BodyElement::Paragraph(p)], &mut ctx, &mut e, &mut stack).unwrap();
        let BodyElement::Paragraph(p) = &rendered[0] else { panic!() };
        assert_eq!(p.text(), "Hello, Ada!");
    }

    #[test]
    fn renders_paragraph_level_for_loop() {
        let functions = FunctionRegistry::with_builtins();
        let fragments = FragmentStore::new();
        let mut rels = RelationshipTable::new();
        let mut styles = StyleTable::new();
        let mut e = env(&functions, &fragments, &mut rels, &mut styles);
        let mut root = IndexMap::new();
        root.insert(
            "items".to_string(),
            Value::list(vec![Value::str("a"), Value::str("b")]),
        );
        let mut ctx = Context::new(root);
        let body = vec![
            BodyElement::Paragraph(text_paragraph("{{for x in items}}")),
            BodyElement::Paragraph(text_paragraph("Item: {{x}}")),
            BodyElement::Paragraph(text_paragraph("{{end}}")),
        ];
        let mut stack = IncludeStack::new(10);
        let rendered = render_children(&body, &mut ctx, &mut e, &mut stack).unwrap();
        assert_eq!(rendered.len(), 2);
        let BodyElement::Paragraph(p0) = &rendered[0] else { panic!() };
        let BodyElement::Paragraph(p1) = &rendered[1] else { panic!() };
        assert_eq!(p0.text(), "Item: a");
        assert_eq!(p1.text(), "Item: b");
    }

    #[test]
    fn renders_table_row_repetition_with_loop_index() {
        use crate::doc::{TableCell, TableRow};

        fn row(text: &str) -> TableRow {
            TableRow {
                properties: Vec::new(),
                cells: vec![TableCell {
                    properties: Vec::new(),
                    paragraphs: vec![text_paragraph(text)],
                }],
            }
        }

        let functions = FunctionRegistry::with_builtins();
        let fragments = FragmentStore::new();
        let mut rels = RelationshipTable::new();
        let mut styles = StyleTable::new();
        let mut e = env(&functions, &fragments, &mut rels, &mut styles);
        let mut root = IndexMap::new();
        root.insert(
            "items".to_string(),
            Value::list(vec![Value::str("a"), Value::str("b"), Value::str("c")]),
        );
        let mut ctx = Context::new(root);
        let table = Table {
            properties: Default::default(),
            grid: vec![2000],
            rows: vec![
                row("{{for i, x in items}}"),
                row("- {{i}}: {{x}}"),
                row("{{end}}"),
            ],
        };
        let mut stack = IncludeStack::new(10);
        let rendered = render_table(&table, &mut ctx, &mut e, &mut stack).unwrap();
        assert_eq!(rendered.rows.len(), 3);
        assert_eq!(rendered.rows[0].cells[0].paragraphs[0].text(), "- 0: a");
        assert_eq!(rendered.rows[1].cells[0].paragraphs[0].text(), "- 1: b");
        assert_eq!(rendered.rows[2].cells[0].paragraphs[0].text(), "- 2: c");
    }

    #[test]
    fn literal_brace_escapes_survive_substitution() {
        let functions = FunctionRegistry::with_builtins();
        let fragments = FragmentStore::new();
        let mut rels = RelationshipTable::new();
        let mut styles = StyleTable::new();
        let mut e = env(&functions, &fragments, &mut rels, &mut styles);
        let mut root = IndexMap::new();
        root.insert("name".to_string(), Value::str("Ada"));
        let mut ctx = Context::new(root);
        let p = text_paragraph("Use {{{{name}}}} for {{name}}.");
        let mut stack = IncludeStack::new(10);
        let rendered = render_children(&[BodyElement::Paragraph(p)], &mut ctx, &mut e, &mut stack).unwrap();
        let BodyElement::Paragraph(p) = &rendered[0] else { panic!() };
        assert_eq!(p.text(), "Use {{name}} for Ada.");
    }

    #[test]
    fn page_break_call_emits_a_distinct_break_run_not_a_line_break() {
        let functions = FunctionRegistry::with_builtins();
        let fragments = FragmentStore::new();
        let mut rels = RelationshipTable::new();
        let mut styles = StyleTable::new();
        let mut e = env(&functions, &fragments, &mut rels, &mut styles);
        let mut ctx = Context::new(IndexMap::new());
        let p = text_paragraph("before{{page_break()}}after");
        let mut stack = IncludeStack::new(10);
        let rendered = render_children(&[BodyElement::Paragraph(p)], &mut ctx, &mut e, &mut stack).unwrap();
        let BodyElement::Paragraph(p) = &rendered[0] else { panic!() };
        let breaks: Vec<_> = p
            .content
            .iter()
            .filter_map(|c| match c {
                ParagraphChild::Run(r) if r.is_break => Some(r),
                _ => None,
            })
            .collect();
        assert_eq!(breaks.len(), 1);
        assert!(breaks[0].is_page_break);
    }

    #[test]
    fn renders_if_elsif_else_choosing_first_match() {
        let functions = FunctionRegistry::with_builtins();
        let fragments = FragmentStore::new();
        let mut rels = RelationshipTable::new();
        let mut styles = StyleTable::new();
        let mut e = env(&functions, &fragments, &mut rels, &mut styles);
        let mut root = IndexMap::new();
        root.insert("grade".to_string(), Value::Int(2));
        let mut ctx = Context::new(root);
        let body = vec![
            BodyElement::Paragraph(text_paragraph("{{if grade == 1}}")),
            BodyElement::Paragraph(text_paragraph("first")),
            BodyElement::Paragraph(text_paragraph("{{elsif grade == 2}}")),
            BodyElement::Paragraph(text_paragraph("second")),
            BodyElement::Paragraph(text_paragraph("{{else}}")),
            BodyElement::Paragraph(text_paragraph("other")),
            BodyElement::Paragraph(text_paragraph("{{end}}")),
        ];
        let mut stack = IncludeStack::new(10);
        let rendered = render_children(&body, &mut ctx, &mut e, &mut stack).unwrap();
        assert_eq!(rendered.len(), 1);
        let BodyElement::Paragraph(p) = &rendered[0] else { panic!() };
        assert_eq!(p.text(), "second");
    }

    #[test]
    fn fragment_include_splices_and_renders_under_context() {
        let functions = FunctionRegistry::with_builtins();
        let mut fragments = FragmentStore::new();
        fragments.register(Fragment {
            name: "sig".to_string(),
            body: Body {
                children: vec![BodyElement::Paragraph(text_paragraph("— the team, {{org}}"))],
                ..Default::default()
            },
            relationships: RelationshipTable::new(),
            styles: StyleTable::new(),
        });
        let mut rels = RelationshipTable::new();
        let mut styles = StyleTable::new();
        let mut e = env(&functions, &fragments, &mut rels, &mut styles);
        let mut root = IndexMap::new();
        root.insert("org".to_string(), Value::str("Acme"));
        let mut ctx = Context::new(root);
        let body = vec![BodyElement::Paragraph(text_paragraph(r#"{{include "sig"}}"#))];
        let mut stack = IncludeStack::new(10);
        let rendered = render_children(&body, &mut ctx, &mut e, &mut stack).unwrap();
        let BodyElement::Paragraph(p) = &rendered[0] else { panic!() };
        assert_eq!(p.text(), "— the team, Acme");
    }

    #[test]
    fn empty_inline_block_between_tables_disappears_and_tables_merge() {
        let functions = FunctionRegistry::with_builtins();
        let fragments = FragmentStore::new();
        let mut rels = RelationshipTable::new();
        let mut styles = StyleTable::new();
        let mut e = env(&functions, &fragments, &mut rels, &mut styles);
        let mut root = IndexMap::new();
        root.insert("rows".to_string(), Value::list(vec![]));
        let mut ctx = Context::new(root);
        let grid = vec![100, 100];
        let table_a = Table { properties: Default::default(), grid: grid.clone(), rows: vec![] };
        let table_b = Table { properties: Default::default(), grid, rows: vec![] };
        let body = Body {
            children: vec![
                BodyElement::Table(table_a),
                BodyElement::Paragraph(text_paragraph("{{for r in rows}}{{end}}")),
                BodyElement::Table(table_b),
            ],
            ..Default::default()
        };
        let mut stack = IncludeStack::new(10);
        let rendered = render_body(&body, &mut ctx, &mut e, &mut stack).unwrap();
        assert_eq!(rendered.children.len(), 1);
        assert!(matches!(rendered.children[0], BodyElement::Table(_)));
    }

    #[test]
    fn hide_row_function_removes_the_enclosing_row() {
        let mut functions = FunctionRegistry::with_builtins();
        ops::register_builtins(&mut functions);
        let fragments = FragmentStore::new();
        let mut rels = RelationshipTable::new();
        let mut styles = StyleTable::new();
        let mut e = env(&functions, &fragments, &mut rels, &mut styles);
        let mut ctx = Context::new(IndexMap::new());
        let row = TableRow {
            properties: vec![],
            cells: vec![crate::doc::TableCell {
                properties: vec![],
                paragraphs: vec![text_paragraph("{{hide_row()}}")],
            }],
        };
        let table = Table { properties: Default::default(), grid: vec![100], rows: vec![row] };
        let mut stack = IncludeStack::new(10);
        let rendered = render_table(&table, &mut ctx, &mut e, &mut stack).unwrap();
        assert!(rendered.rows.is_empty());
    }
}
