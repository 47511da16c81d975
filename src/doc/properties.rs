//! Paragraph and run property records: a closed set of recognized fields
//! the renderer may consult or modify, plus a byte-preserved slice of
//! everything else so a round-trip with no directive application loses no
//! information.

/// An opaque, verbatim-preserved XML element, captured as a DOM subtree so
/// it can be re-serialized byte-for-byte (modulo attribute/element order
/// normalization, which the specification explicitly permits).
#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct RawElement {
    /// The element's qualified tag name.
    pub tag: String,
    /// The element's attributes, in encounter order.
    pub attrs: Vec<(String, String)>,
    /// The raw inner XML, serialized, for elements this crate does not
    /// recurse into.
    pub inner_xml: String,
}

/// Recognized run-level formatting fields, plus everything else captured
/// verbatim.
#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct RunProperties {
    pub bold: bool,
    pub italic: bool,
    pub underline: bool,
    pub strike: bool,
    pub font: Option<String>,
    pub size_half_points: Option<i64>,
    pub color: Option<String>,
    pub highlight: Option<String>,
    pub style_id: Option<String>,
    /// Unrecognized child elements of `w:rPr`, preserved verbatim in their
    /// original order.
    pub raw: Vec<RawElement>,
}

impl RunProperties {
    /// Structural equality used by the run coalescer to decide whether two
    /// runs are mergeable: every recognized field must match and every
    /// raw-preserved element must be byte-equal, in the same order.
    pub fn mergeable_with(&self, other: &Self) -> bool {
        self == other
    }
}

/// Recognized paragraph-level formatting fields, plus everything else
/// captured verbatim.
#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct ParagraphProperties {
    pub style_id: Option<String>,
    pub alignment: Option<String>,
    pub numbering_id: Option<i64>,
    pub numbering_level: Option<i64>,
    /// Unrecognized child elements of `w:pPr`, preserved verbatim.
    pub raw: Vec<RawElement>,
}

/// Recognized table-level formatting fields, plus everything else captured
/// verbatim.
#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct TableProperties {
    pub style_id: Option<String>,
    pub width_dxa: Option<i64>,
    /// Unrecognized child elements of `w:tblPr`, preserved verbatim.
    pub raw: Vec<RawElement>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn run_properties_equality_is_structural() {
        let a = RunProperties {
            bold: true,
            raw: vec![RawElement {
                tag: "w:lang".into(),
                attrs: vec![("w:val".into(), "en-US".into())],
                inner_xml: String::new(),
            }],
            ..Default::default()
        };
        let b = a.clone();
        assert!(a.mergeable_with(&b));

        let mut c = b.clone();
        c.raw[0].attrs[0].1 = "fr-FR".into();
        assert!(!a.mergeable_with(&c));
    }
}
