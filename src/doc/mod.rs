//! The structural document model: a strongly-typed representation of the
//! WordprocessingML elements this crate understands, with raw-preserved
//! slices for everything it does not.

pub mod properties;
pub mod relationships;

pub use properties::{ParagraphProperties, RawElement, RunProperties, TableProperties};
pub use relationships::{Relationship, RelationshipTable};

/// The root of a parsed part (main document body, a header, or a footer).
#[derive(Clone, Debug, Default)]
pub struct Document {
    /// Raw root-element attributes (namespace declarations etc.), preserved
    /// verbatim.
    pub attrs: Vec<(String, String)>,
    /// The document body.
    pub body: Body,
}

/// The ordered content of a document body.
#[derive(Clone, Debug, Default)]
pub struct Body {
    /// The ordered top-level elements.
    pub children: Vec<BodyElement>,
    /// Trailing section properties, preserved verbatim (layout is out of
    /// scope, but the bytes must round-trip).
    pub section_properties: Option<RawElement>,
}

/// A top-level body element.
#[derive(Clone, Debug)]
pub enum BodyElement {
    Paragraph(Paragraph),
    Table(Table),
    /// An element this crate does not model structurally, preserved
    /// byte-exact.
    RawSection(RawElement),
}

/// A paragraph: an ordered list of inline children plus paragraph-level
/// formatting.
#[derive(Clone, Debug, Default)]
pub struct Paragraph {
    /// Recognized and raw-preserved paragraph formatting.
    pub properties: ParagraphProperties,
    /// The ordered inline content. There is a single source of truth here;
    /// runs and hyperlinks are not additionally tracked in separate arrays.
    pub content: Vec<ParagraphChild>,
}

impl Paragraph {
    /// Concatenates the visible text of every run in this paragraph,
    /// including runs nested inside hyperlinks. Used by the directive
    /// locator to classify a paragraph's syntactic content.
    pub fn text(&self) -> String {
        let mut out = String::new();
        for child in &self.content {
            child.append_text(&mut out);
        }
        out
    }

    /// An iterator over the runs directly in this paragraph (not descending
    /// into hyperlinks) — a filtered view derived from `content`, not a
    /// second source of truth.
    pub fn runs(&self) -> impl Iterator<Item = &Run> {
        self.content.iter().filter_map(|c| match c {
            ParagraphChild::Run(r) => Some(r),
            _ => None,
        })
    }
}

/// A single child of a paragraph's content list.
#[derive(Clone, Debug)]
pub enum ParagraphChild {
    Run(Run),
    Hyperlink(Hyperlink),
    /// A proofing error marker (spelling/grammar range), preserved as an
    /// opaque wrapper since it carries no template-relevant content.
    ProofingMark(RawElement),
    /// Any other inline element this crate does not model, preserved
    /// byte-exact.
    RawInline(RawElement),
}

impl ParagraphChild {
    fn append_text(&self, out: &mut String) {
        match self {
            ParagraphChild::Run(r) => {
                if let Some(t) = &r.text {
                    out.push_str(t);
                }
            }
            ParagraphChild::Hyperlink(h) => {
                for r in &h.runs {
                    if let Some(t) = &r.text {
                        out.push_str(t);
                    }
                }
            }
            ParagraphChild::ProofingMark(_) | ParagraphChild::RawInline(_) => {}
        }
    }
}

/// A contiguous span of uniformly formatted text, or a break, or an opaque
/// element this crate otherwise preserves verbatim inside a run-shaped
/// slot.
#[derive(Clone, Debug, Default)]
pub struct Run {
    /// Recognized and raw-preserved run formatting.
    pub properties: RunProperties,
    /// The run's text, if it is a text run.
    pub text: Option<String>,
    /// True if the run's text must round-trip exactly, including leading or
    /// trailing whitespace (`xml:space="preserve"`).
    pub preserve_space: bool,
    /// True if this run is a line break rather than (or in addition to) a
    /// text run.
    pub is_break: bool,
    /// True if `is_break` is a page break (`<w:br w:type="page"/>`) rather
    /// than a plain line break. Meaningless unless `is_break` is set.
    pub is_page_break: bool,
    /// An opaque run child (e.g. a drawing or field code) this crate does
    /// not interpret, preserved byte-exact alongside the recognized
    /// content.
    pub raw: Option<RawElement>,
}

impl Run {
    /// A plain text run with default formatting.
    pub fn text(s: impl Into<String>) -> Self {
        Self {
            text: Some(s.into()),
            ..Default::default()
        }
    }

    /// A line-break run.
    pub fn line_break() -> Self {
        Self {
            is_break: true,
            ..Default::default()
        }
    }

    /// A page-break run (`<w:br w:type="page"/>`), distinct from a plain
    /// line break.
    pub fn page_break() -> Self {
        Self {
            is_break: true,
            is_page_break: true,
            ..Default::default()
        }
    }
}

/// A hyperlink: a relationship id and the ordered runs inside it. Token
/// reassembly treats a hyperlink's contents as their own coalescing scope
/// so a `{{` opened inside a hyperlink never force-merges across its
/// boundary.
#[derive(Clone, Debug, Default)]
pub struct Hyperlink {
    /// The relationship id this hyperlink's target is stored under.
    pub relationship_id: String,
    /// The ordered runs inside the hyperlink.
    pub runs: Vec<Run>,
}

/// A table: grid definition, shared properties, and ordered rows.
#[derive(Clone, Debug, Default)]
pub struct Table {
    /// Table-wide formatting.
    pub properties: TableProperties,
    /// Declared column widths (twentieths of a point), defining the grid.
    pub grid: Vec<i64>,
    /// The ordered rows.
    pub rows: Vec<TableRow>,
}

/// A single table row.
#[derive(Clone, Debug, Default)]
pub struct TableRow {
    /// Row-level formatting, preserved verbatim (height, header-repeat
    /// flag, etc.) beyond what is recognized.
    pub properties: Vec<(String, String)>,
    /// The ordered cells.
    pub cells: Vec<TableCell>,
}

/// A single table cell.
#[derive(Clone, Debug, Default)]
pub struct TableCell {
    /// Cell-level formatting (span, merge, shading), preserved verbatim.
    pub properties: Vec<(String, String)>,
    /// The cell's paragraphs. A cell always contains at least one
    /// paragraph in well-formed WordprocessingML.
    pub paragraphs: Vec<Paragraph>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn paragraph_text_concatenates_runs_including_hyperlinks() {
        let p = Paragraph {
            content: vec![
                ParagraphChild::Run(Run::text("Hello, ")),
                ParagraphChild::Hyperlink(Hyperlink {
                    relationship_id: "rId1".into(),
                    runs: vec![Run::text("world")],
                }),
                ParagraphChild::Run(Run::text("!")),
            ],
            ..Default::default()
        };
        assert_eq!(p.text(), "Hello, world!");
    }
}
