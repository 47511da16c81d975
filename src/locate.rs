//! The directive locator: classifies paragraphs and table rows by their
//! `{{ }}` content, and matches opening directives to their closing `end`
//! across sibling paragraphs or rows.

use crate::ast::Directive;
use crate::doc::{Paragraph, TableRow};
use crate::error::{Error, Position, Result};
use crate::parser;

/// A single `{{ ... }}` token found in a paragraph's text, with its byte
/// span within that text (inclusive of the delimiters) and its parsed
/// directive.
#[derive(Clone, Debug)]
pub struct LocatedToken {
    pub directive: Directive,
    /// Byte offset of the opening `{` of `{{` within the paragraph text.
    pub start: usize,
    /// Byte offset just past the closing `}` of `}}`.
    pub end: usize,
    /// The trimmed inner text passed to the parser — `directive`'s spans
    /// are relative to this, so it is what callers must hand back to
    /// [`crate::eval::eval`] as the source for position reporting.
    pub source: String,
}

/// How a paragraph (or row) was classified by its `{{ }}` content.
#[derive(Clone, Debug)]
pub enum ParagraphClass {
    /// No `{{ }}` tokens at all.
    None,
    /// A single `for`/`if`/`unless`/`include` token that is the
    /// paragraph's sole non-whitespace content. `include` has no matching
    /// `end` — it consumes only its own paragraph.
    Opening(LocatedToken),
    /// A single `elsif`/`else` token that is the paragraph's sole
    /// non-whitespace content.
    Continuation(LocatedToken),
    /// A single `end` token that is the paragraph's sole non-whitespace
    /// content.
    Closing(LocatedToken),
    /// One or more expression tokens, with no control directives, and (for
    /// single-token cases) possibly accompanied by other text — this is
    /// the common substitution case.
    ExpressionOnly(Vec<LocatedToken>),
    /// A control directive sharing the paragraph with other non-whitespace
    /// text (inline, per the tie-break rule), or multiple tokens at least
    /// one of which is a control directive (an inline block that opens and
    /// closes within the same paragraph).
    Inline(Vec<LocatedToken>),
}

impl ParagraphClass {
    pub fn is_none(&self) -> bool {
        matches!(self, ParagraphClass::None)
    }
}

/// Scans `text` for top-level `{{ ... }}` tokens (no nesting is expected
/// within a single paragraph's raw text; an inner `{{` inside an already
/// open token is a syntax error the parser will report) and parses each.
/// `{{{{` and `}}}}` are the literal-brace escapes (producing `{{`/`}}` in
/// rendered output) and are skipped here rather than mistaken for a token
/// delimiter.
fn scan_tokens(text: &str, part: &str) -> Result<Vec<LocatedToken>> {
    let mut tokens = Vec::new();
    let bytes = text.as_bytes();
    let mut i = 0;
    while i + 1 < bytes.len() {
        if text[i..].starts_with("{{{{") || text[i..].starts_with("}}}}") {
            i += 4;
        } else if bytes[i] == b'{' && bytes[i + 1] == b'{' {
            let inner_start = i + 2;
            let close = text[inner_start..].find("}}").ok_or_else(|| {
                Error::TemplateSyntax(
                    Position::new(part, text, i),
                    "unclosed `{{`".to_string(),
                )
            })?;
            let inner = &text[inner_start..inner_start + close];
            let directive = parser::parse_directive(inner, part)?;
            let end = inner_start + close + 2;
            tokens.push(LocatedToken {
                directive,
                start: i,
                end,
                source: inner.trim().to_string(),
            });
            i = end;
        } else {
            i += 1;
        }
    }
    Ok(tokens)
}

/// True if `text`, with every `{{ ... }}` token in `tokens` removed, is
/// entirely whitespace. Exposed to the validator, which uses it to flag
/// directive paragraphs carrying extraneous text.
pub(crate) fn is_sole_content(text: &str, tokens: &[LocatedToken]) -> bool {
    let mut last = 0;
    for t in tokens {
        if text[last..t.start].chars().any(|c| !c.is_whitespace()) {
            return false;
        }
        last = t.end;
    }
    text[last..].chars().all(|c| c.is_whitespace())
}

/// Classifies a block of text (a paragraph's concatenated run text, or a
/// table cell's) by its `{{ }}` content, per the locator's matching rules.
pub fn classify_text(text: &str, part: &str) -> Result<ParagraphClass> {
    let tokens = scan_tokens(text, part)?;
    if tokens.is_empty() {
        // A paragraph with no real directive but a literal-brace escape
        // still needs substitution to unescape it, so it cannot be
        // classified `None` (which the renderer passes through verbatim).
        if text.contains("{{{{") || text.contains("}}}}") {
            return Ok(ParagraphClass::ExpressionOnly(Vec::new()));
        }
        return Ok(ParagraphClass::None);
    }
    if tokens.len() == 1 {
        let sole = is_sole_content(text, &tokens);
        let token = tokens.into_iter().next().unwrap();
        return Ok(match (&token.directive, sole) {
            (
                Directive::For(_) | Directive::If(_) | Directive::Unless(_) | Directive::Include(_),
                true,
            ) => ParagraphClass::Opening(token),
            (Directive::Elsif(_) | Directive::Else, true) => ParagraphClass::Continuation(token),
            (Directive::End, true) => ParagraphClass::Closing(token),
            (Directive::Expr(_), _) => ParagraphClass::ExpressionOnly(vec![token]),
            // Non-whitespace text alongside a control directive: inline
            // regardless of directive kind, per the tie-break rule. The
            // engine surfaces a warning for this at validation time.
            (_, false) => ParagraphClass::Inline(vec![token]),
        });
    }
    if tokens.iter().all(|t| matches!(t.directive, Directive::Expr(_))) {
        return Ok(ParagraphClass::ExpressionOnly(tokens));
    }
    Ok(ParagraphClass::Inline(tokens))
}

/// Classifies a paragraph by its concatenated run text.
pub fn classify_paragraph(paragraph: &Paragraph, part: &str) -> Result<ParagraphClass> {
    classify_text(&paragraph.text(), part)
}

/// Classifies a table row by the text of the first paragraph of its first
/// cell. Only `Opening`/`Continuation`/`Closing` are meaningful at row
/// granularity; any other classification of that paragraph means the row
/// itself carries no row-level directive (expression substitution still
/// happens per-paragraph inside cells, independent of row classification).
pub fn classify_row(row: &TableRow, part: &str) -> Result<ParagraphClass> {
    let Some(first_cell) = row.cells.first() else {
        return Ok(ParagraphClass::None);
    };
    let Some(first_paragraph) = first_cell.paragraphs.first() else {
        return Ok(ParagraphClass::None);
    };
    match classify_paragraph(first_paragraph, part)? {
        class @ (ParagraphClass::Opening(_)
        | ParagraphClass::Continuation(_)
        | ParagraphClass::Closing(_)) => Ok(class),
        _ => Ok(ParagraphClass::None),
    }
}

/// A branch point within a matched block: the directive that opened it
/// (`None` for a plain `else`) and the index, within the scanned slice, of
/// the paragraph/row carrying it.
#[derive(Clone, Debug)]
pub struct BranchPoint {
    pub token: LocatedToken,
    pub index: usize,
}

/// A matched `for`/`if`/`unless` block: where it closes, and (for
/// `if`/`unless`) the `elsif`/`else` branch points found at its own depth.
#[derive(Clone, Debug)]
pub struct Block {
    pub end: usize,
    pub branches: Vec<BranchPoint>,
}

/// Scans `classes` (one [`ParagraphClass`] per sibling paragraph or row,
/// already computed by the caller) starting at the opening directive at
/// `start`, and finds its matching `end`, tracking nested opens/closes of
/// the same class and collecting `elsif`/`else` branch points at depth
/// zero. `part` and a position-finder are used only to build an error if
/// no match exists.
pub fn scan_block(classes: &[ParagraphClass], start: usize, part: &str) -> Result<Block> {
    let opening_token = match &classes[start] {
        ParagraphClass::Opening(t) => t.clone(),
        _ => {
            return Err(Error::Internal(
                "scan_block called on a non-opening paragraph".into(),
            ))
        }
    };
    let mut branches = vec![BranchPoint { token: opening_token, index: start }];
    let mut depth = 0i32;
    let mut i = start + 1;
    while i < classes.len() {
        match &classes[i] {
            // `include` is a leaf directive with no matching `end`; it
            // does not nest depth the way `for`/`if`/`unless` do.
            ParagraphClass::Opening(t) if matches!(t.directive, Directive::Include(_)) => {
                i += 1;
            }
            ParagraphClass::Opening(_) => {
                depth += 1;
                i += 1;
            }
            ParagraphClass::Continuation(t) if depth == 0 => {
                branches.push(BranchPoint { token: t.clone(), index: i });
                i += 1;
            }
            ParagraphClass::Closing(_) if depth == 0 => {
                return Ok(Block { end: i, branches });
            }
            ParagraphClass::Closing(_) => {
                depth -= 1;
                i += 1;
            }
            _ => i += 1,
        }
    }
    Err(Error::UnmatchedDirective(
        Position::new(part, "", 0),
        "no matching {{end}} for this opening directive".to_string(),
    ))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::doc::{Paragraph, ParagraphChild, Run};

    fn p(text: &str) -> Paragraph {
        Paragraph {
            content: vec![ParagraphChild::Run(Run::text(text))],
            ..Default::default()
        }
    }

    #[test]
    fn classifies_plain_text_as_none() {
        let class = classify_paragraph(&p("just words"), "t").unwrap();
        assert!(matches!(class, ParagraphClass::None));
    }

    #[test]
    fn classifies_sole_for_as_opening() {
        let class = classify_paragraph(&p("{{for x in xs}}"), "t").unwrap();
        assert!(matches!(class, ParagraphClass::Opening(_)));
    }

    #[test]
    fn classifies_for_with_surrounding_text_as_inline() {
        let class = classify_paragraph(&p("prefix {{for x in xs}}"), "t").unwrap();
        assert!(matches!(class, ParagraphClass::Inline(_)));
    }

    #[test]
    fn classifies_multiple_expressions_as_expression_only() {
        let class = classify_paragraph(&p("Hello {{a}}, you are {{b}}"), "t").unwrap();
        match class {
            ParagraphClass::ExpressionOnly(tokens) => assert_eq!(tokens.len(), 2),
            other => panic!("expected ExpressionOnly, got {other:?}"),
        }
    }

    #[test]
    fn scan_block_finds_matching_end_skipping_nested_block() {
        let classes = vec![
            classify_paragraph(&p("{{if a}}"), "t").unwrap(),
            classify_paragraph(&p("{{if b}}"), "t").unwrap(),
            classify_paragraph(&p("{{end}}"), "t").unwrap(),
            classify_paragraph(&p("{{end}}"), "t").unwrap(),
        ];
        let block = scan_block(&classes, 0, "t").unwrap();
        assert_eq!(block.end, 3);
        assert_eq!(block.branches.len(), 1);
    }

    #[test]
    fn scan_block_collects_elsif_and_else_branches() {
        let classes = vec![
            classify_paragraph(&p("{{if a}}"), "t").unwrap(),
            classify_paragraph(&p("{{elsif b}}"), "t").unwrap(),
            classify_paragraph(&p("{{else}}"), "t").unwrap(),
            classify_paragraph(&p("{{end}}"), "t").unwrap(),
        ];
        let block = scan_block(&classes, 0, "t").unwrap();
        assert_eq!(block.end, 3);
        assert_eq!(block.branches.len(), 3);
    }

    #[test]
    fn scan_block_does_not_let_a_nested_include_consume_the_end() {
        let classes = vec![
            classify_paragraph(&p("{{if a}}"), "t").unwrap(),
            classify_paragraph(&p(r#"{{include "header"}}"#), "t").unwrap(),
            classify_paragraph(&p("{{end}}"), "t").unwrap(),
        ];
        let block = scan_block(&classes, 0, "t").unwrap();
        assert_eq!(block.end, 2);
    }

    #[test]
    fn scan_block_reports_unmatched_opening_directive() {
        let classes = vec![classify_paragraph(&p("{{if a}}"), "t").unwrap()];
        assert!(scan_block(&classes, 0, "t").is_err());
    }
}
