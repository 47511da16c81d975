//! Run coalescing: merges adjacent runs so that directive tokens and
//! `{{ }}` expressions split across word-processor formatting boundaries
//! are reassembled into a single run before the directive locator and
//! renderer ever see them.
//!
//! Parsing already normalizes each `<w:r>` into runs that are each either a
//! line break or a text span, never both, so the "split a merged run that
//! contains both a break and text" case from the algorithm never arises
//! here — it is handled at parse time instead.

use crate::doc::{Body, BodyElement, Paragraph, ParagraphChild, Run, Table};

/// Coalesces every paragraph in a document body, recursing into tables.
/// Run once per part at preparation time, before the directive locator or
/// renderer ever sees the tree.
pub fn coalesce_body(body: &mut Body) {
    for child in &mut body.children {
        match child {
            BodyElement::Paragraph(p) => coalesce_paragraph(p),
            BodyElement::Table(t) => coalesce_table(t),
            BodyElement::RawSection(_) => {}
        }
    }
}

fn coalesce_table(table: &mut Table) {
    for row in &mut table.rows {
        for cell in &mut row.cells {
            for p in &mut cell.paragraphs {
                coalesce_paragraph(p);
            }
        }
    }
}

/// Coalesces runs throughout a paragraph in place: directly within the
/// paragraph's content, and independently within each hyperlink's runs, so
/// a hyperlink boundary is never crossed by a merge.
pub fn coalesce_paragraph(paragraph: &mut Paragraph) {
    for child in &mut paragraph.content {
        if let ParagraphChild::Hyperlink(h) = child {
            h.runs = merge_runs(std::mem::take(&mut h.runs));
        }
    }
    paragraph.content = merge_children(std::mem::take(&mut paragraph.content));
}

/// Coalesces a bare run sequence (used directly for hyperlink contents).
pub fn merge_runs(runs: Vec<Run>) -> Vec<Run> {
    let mut out: Vec<Run> = Vec::with_capacity(runs.len());
    for run in runs {
        if let Some(prev) = out.last_mut() {
            if try_merge(prev, &run) {
                continue;
            }
        }
        out.push(run);
    }
    out
}

fn merge_children(children: Vec<ParagraphChild>) -> Vec<ParagraphChild> {
    let mut out: Vec<ParagraphChild> = Vec::with_capacity(children.len());
    for child in children {
        match child {
            ParagraphChild::Run(run) => {
                if let Some(ParagraphChild::Run(prev)) = out.last_mut() {
                    if try_merge(prev, &run) {
                        continue;
                    }
                }
                out.push(ParagraphChild::Run(run));
            }
            other => out.push(other),
        }
    }
    out
}

/// Attempts to merge `next` into `prev`, mutating `prev` in place. Returns
/// whether a merge happened. Two passes are folded into one condition:
/// style-safe merging when the formatting records match structurally, and
/// a force-merge (keeping `prev`'s properties) when `prev`'s text still has
/// an unclosed `{{` — the only case where formatting is discarded, and
/// only for the run(s) spanning the open expression.
fn try_merge(prev: &mut Run, next: &Run) -> bool {
    if prev.is_break || next.is_break || prev.raw.is_some() || next.raw.is_some() {
        return false;
    }
    if prev.text.is_none() || next.text.is_none() {
        return false;
    }
    let structurally_mergeable = prev.properties.mergeable_with(&next.properties);
    let unclosed = prev
        .text
        .as_deref()
        .map(|t| brace_depth(t) > 0)
        .unwrap_or(false);
    if !structurally_mergeable && !unclosed {
        return false;
    }
    let mut text = prev.text.take().unwrap_or_default();
    text.push_str(next.text.as_deref().unwrap_or(""));
    prev.text = Some(text);
    prev.preserve_space = prev.preserve_space || next.preserve_space;
    true
}

/// The net nesting depth of `{{`/`}}` pairs in `text`, floored at zero. A
/// positive result means the text ends inside an unclosed expression.
fn brace_depth(text: &str) -> i32 {
    let bytes = text.as_bytes();
    let mut depth = 0i32;
    let mut i = 0;
    while i + 1 < bytes.len() {
        if bytes[i] == b'{' && bytes[i + 1] == b'{' {
            depth += 1;
            i += 2;
        } else if bytes[i] == b'}' && bytes[i + 1] == b'}' {
            depth -= 1;
            i += 2;
        } else {
            i += 1;
        }
    }
    depth.max(0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::doc::{Hyperlink, RunProperties};

    fn styled(text: &str, bold: bool) -> Run {
        Run {
            properties: RunProperties { bold, ..Default::default() },
            text: Some(text.into()),
            ..Default::default()
        }
    }

    #[test]
    fn merges_adjacent_runs_with_identical_properties() {
        let mut p = Paragraph {
            content: vec![
                ParagraphChild::Run(styled("{{foo", false)),
                ParagraphChild::Run(styled(".bar}}", false)),
            ],
            ..Default::default()
        };
        coalesce_paragraph(&mut p);
        assert_eq!(p.content.len(), 1);
        assert_eq!(p.text(), "{{foo.bar}}");
    }

    #[test]
    fn force_merges_across_differing_properties_when_brace_unclosed() {
        let mut p = Paragraph {
            content: vec![
                ParagraphChild::Run(styled("{{fo", false)),
                ParagraphChild::Run(styled("o.bar}}", true)),
                ParagraphChild::Run(styled(" trailing", true)),
            ],
            ..Default::default()
        };
        coalesce_paragraph(&mut p);
        // The unclosed expression forces the first two runs together,
        // taking the first run's (unbolded) properties; the trailing bold
        // run, having matching properties neither with the merged run nor
        // an open brace to force through, stays separate.
        assert_eq!(p.content.len(), 2);
        assert_eq!(p.text(), "{{foo.bar}} trailing");
        match &p.content[0] {
            ParagraphChild::Run(r) => assert!(!r.properties.bold),
            _ => panic!("expected a run"),
        }
    }

    #[test]
    fn does_not_merge_across_a_line_break() {
        let mut p = Paragraph {
            content: vec![
                ParagraphChild::Run(styled("left", false)),
                ParagraphChild::Run(Run::line_break()),
                ParagraphChild::Run(styled("right", false)),
            ],
            ..Default::default()
        };
        coalesce_paragraph(&mut p);
        assert_eq!(p.content.len(), 3);
    }

    #[test]
    fn coalesce_body_recurses_into_table_cells() {
        use crate::doc::{Table, TableCell, TableRow};

        let mut body = Body {
            children: vec![
                BodyElement::Paragraph(Paragraph {
                    content: vec![
                        ParagraphChild::Run(styled("{{top", false)),
                        ParagraphChild::Run(styled("-level}}", false)),
                    ],
                    ..Default::default()
                }),
                BodyElement::Table(Table {
                    rows: vec![TableRow {
                        cells: vec![TableCell {
                            paragraphs: vec![Paragraph {
                                content: vec![
                                    ParagraphChild::Run(styled("{{cell", false)),
                                    ParagraphChild::Run(styled(".value}}", false)),
                                ],
                                ..Default::default()
                            }],
                            ..Default::default()
                        }],
                        ..Default::default()
                    }],
                    ..Default::default()
                }),
            ],
            ..Default::default()
        };

        coalesce_body(&mut body);

        let BodyElement::Paragraph(p) = &body.children[0] else { panic!("expected a paragraph") };
        assert_eq!(p.content.len(), 1);

        let BodyElement::Table(t) = &body.children[1] else { panic!("expected a table") };
        let cell_paragraph = &t.rows[0].cells[0].paragraphs[0];
        assert_eq!(cell_paragraph.content.len(), 1);
        assert_eq!(cell_paragraph.text(), "{{cell.value}}");
    }

    #[test]
    fn hyperlink_contents_are_merged_independently() {
        let mut p = Paragraph {
            content: vec![
                ParagraphChild::Run(styled("{{", false)),
                ParagraphChild::Hyperlink(Hyperlink {
                    relationship_id: "rId1".into(),
                    runs: vec![styled("a", false), styled("b", false)],
                }),
                ParagraphChild::Run(styled("}}", false)),
            ],
            ..Default::default()
        };
        coalesce_paragraph(&mut p);
        // The hyperlink's own runs merge together, but the `{{` never
        // reaches across the hyperlink boundary to merge with its contents
        // or with the closing `}}` run after it.
        assert_eq!(p.content.len(), 3);
        match &p.content[1] {
            ParagraphChild::Hyperlink(h) => assert_eq!(h.runs.len(), 1),
            _ => panic!("expected a hyperlink"),
        }
    }
}
