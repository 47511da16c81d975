//! Container and part I/O: reads a `.docx` ZIP package into the structural
//! document model, and serializes a rendered model back into a ZIP with
//! every part this crate does not interpret carried over byte-exact.
//!
//! Out of scope: OOXML schema validation (a part that round-trips here may
//! still be invalid per the full schema), legacy binary `.doc`, and
//! in-place ZIP editing — every save is a full rewrite of the archive.

use crate::doc::relationships::{Relationship, RelationshipTarget, RelationshipTable};
use crate::doc::{
    Body, BodyElement, Document, Hyperlink, ParagraphChild, ParagraphProperties, RawElement, Run,
    RunProperties, Table, TableCell, TableProperties, TableRow,
};
use crate::doc::Paragraph;
use crate::error::Error;
use crate::fragment::StyleTable;
use indexmap::IndexMap;
use minidom::Element;
use std::io::{Cursor, Read, Write};

const NS_W: &str = "http://schemas.openxmlformats.org/wordprocessingml/2006/main";
const NS_RELS_PKG: &str = "http://schemas.openxmlformats.org/package/2006/relationships";
const NS_MC: &str = "http://schemas.openxmlformats.org/markup-compatibility/2006";

/// A recognized OOXML document part, parsed into this crate's structural
/// model, plus every other archive entry preserved as opaque bytes.
#[derive(Clone)]
pub struct Package {
    pub document: Document,
    pub relationships: RelationshipTable,
    pub styles: StyleTable,
    document_part: String,
    rels_part: String,
    styles_part: Option<String>,
    /// Every ZIP entry not otherwise interpreted, in original archive
    /// order, copied back verbatim on save.
    other_entries: Vec<(String, Vec<u8>)>,
}

impl Package {
    /// Parses a `.docx` (or compatible WordprocessingML package) from its
    /// raw ZIP bytes.
    pub fn open(bytes: &[u8]) -> crate::error::Result<Package> {
        let mut archive = zip::ZipArchive::new(Cursor::new(bytes))
            .map_err(|e| Error::DocumentParse(format!("not a valid zip archive: {e}")))?;

        let mut entries: IndexMap<String, Vec<u8>> = IndexMap::new();
        for i in 0..archive.len() {
            let mut file = archive
                .by_index(i)
                .map_err(|e| Error::DocumentParse(format!("corrupt zip entry: {e}")))?;
            if file.is_dir() {
                continue;
            }
            let mut buf = Vec::with_capacity(file.size() as usize);
            file.read_to_end(&mut buf)
                .map_err(|e| Error::DocumentParse(format!("could not read {}: {e}", file.name())))?;
            entries.insert(file.name().to_string(), buf);
        }

        let root_rels = entries
            .get("_rels/.rels")
            .ok_or_else(|| Error::DocumentParse("package is missing _rels/.rels".to_string()))?;
        let document_part = find_main_document_part(root_rels)?;

        let (dir, file) = split_part_path(&document_part);
        let rels_part = if dir.is_empty() {
            format!("_rels/{file}.rels")
        } else {
            format!("{dir}/_rels/{file}.rels")
        };

        let document_bytes = entries
            .get(&document_part)
            .ok_or_else(|| Error::DocumentParse(format!("missing main document part {document_part}")))?;
        let document_xml = std::str::from_utf8(document_bytes)
            .map_err(|e| Error::DocumentParse(format!("{document_part} is not valid UTF-8: {e}")))?;

        let root: Element = document_xml
            .parse()
            .map_err(|e| Error::DocumentParse(format!("could not parse {document_part}: {e}")))?;
        let attrs = extract_root_attrs(document_xml);
        let body_el = root
            .children()
            .find(|e| e.name() == "body")
            .ok_or_else(|| Error::DocumentParse(format!("{document_part} has no <w:body>")))?;
        let body = parse_body(body_el)?;

        let relationships = match entries.get(&rels_part) {
            Some(bytes) => parse_relationships(bytes)?,
            None => RelationshipTable::new(),
        };

        let styles_part = relationships
            .iter()
            .find(|r| r.rel_type.ends_with("/styles"))
            .map(|r| resolve_relative(&dir, r.target_path()));
        let styles = match &styles_part {
            Some(part) => match entries.get(part) {
                Some(bytes) => parse_styles(bytes)?,
                None => StyleTable::new(),
            },
            None => StyleTable::new(),
        };

        let mut consumed = vec![document_part.clone(), rels_part.clone()];
        if let Some(p) = &styles_part {
            consumed.push(p.clone());
        }
        let other_entries = entries
            .into_iter()
            .filter(|(name, _)| !consumed.contains(name))
            .collect();

        Ok(Package {
            document: Document { attrs, body },
            relationships,
            styles,
            document_part,
            rels_part,
            styles_part,
            other_entries,
        })
    }

    /// Serializes this package (with `document`/`relationships`/`styles`
    /// possibly mutated by rendering) back into a `.docx` ZIP. Every part
    /// not tracked as document/relationships/styles is copied byte-exact.
    /// Builds a new package that shares this one's container layout (part
    /// names, every byte-passthrough entry) but carries a render's output
    /// model instead of the one this package was parsed with.
    pub fn with_rendered(
        &self,
        document: Document,
        relationships: RelationshipTable,
        styles: StyleTable,
    ) -> Package {
        Package {
            document,
            relationships,
            styles,
            document_part: self.document_part.clone(),
            rels_part: self.rels_part.clone(),
            styles_part: self.styles_part.clone(),
            other_entries: self.other_entries.clone(),
        }
    }

    pub fn save(&self) -> crate::error::Result<Vec<u8>> {
        let mut out = Cursor::new(Vec::new());
        {
            let mut zip = zip::ZipWriter::new(&mut out);
            let opts = zip::write::SimpleFileOptions::default()
                .compression_method(zip::CompressionMethod::Deflated);

            for (name, bytes) in &self.other_entries {
                zip.start_file(name, opts)
                    .map_err(|e| Error::Internal(format!("zip write error for {name}: {e}")))?;
                zip.write_all(bytes)
                    .map_err(|e| Error::Internal(format!("zip write error for {name}: {e}")))?;
            }

            let document_xml = write_document(&self.document);
            zip.start_file(&self.document_part, opts)
                .map_err(|e| Error::Internal(e.to_string()))?;
            zip.write_all(document_xml.as_bytes())
                .map_err(|e| Error::Internal(e.to_string()))?;

            let rels_xml = write_relationships(&self.relationships);
            zip.start_file(&self.rels_part, opts)
                .map_err(|e| Error::Internal(e.to_string()))?;
            zip.write_all(rels_xml.as_bytes())
                .map_err(|e| Error::Internal(e.to_string()))?;

            if let Some(styles_part) = &self.styles_part {
                let styles_xml = write_styles(&self.styles);
                zip.start_file(styles_part, opts)
                    .map_err(|e| Error::Internal(e.to_string()))?;
                zip.write_all(styles_xml.as_bytes())
                    .map_err(|e| Error::Internal(e.to_string()))?;
            }

            zip.finish().map_err(|e| Error::Internal(e.to_string()))?;
        }
        Ok(out.into_inner())
    }
}

impl Relationship {
    fn target_path(&self) -> &str {
        match &self.target {
            RelationshipTarget::Part(p) => p.as_str(),
            RelationshipTarget::Url(u) => u.as_str(),
        }
    }
}

fn split_part_path(part: &str) -> (String, String) {
    match part.rsplit_once('/') {
        Some((dir, file)) => (dir.to_string(), file.to_string()),
        None => (String::new(), part.to_string()),
    }
}

fn resolve_relative(dir: &str, target: &str) -> String {
    if target.starts_with('/') {
        return target.trim_start_matches('/').to_string();
    }
    if dir.is_empty() {
        target.to_string()
    } else {
        format!("{dir}/{target}")
    }
}

/// Finds the package's main document part by its `officeDocument`
/// relationship in `_rels/.rels`.
fn find_main_document_part(rels_bytes: &[u8]) -> crate::error::Result<String> {
    let text = std::str::from_utf8(rels_bytes)
        .map_err(|e| Error::DocumentParse(format!("_rels/.rels is not valid UTF-8: {e}")))?;
    let root: Element = text
        .parse()
        .map_err(|e| Error::DocumentParse(format!("could not parse _rels/.rels: {e}")))?;
    for rel in root.children().filter(|e| e.name() == "Relationship") {
        if rel.attr("Type").is_some_and(|t| t.ends_with("/officeDocument")) {
            if let Some(target) = rel.attr("Target") {
                return Ok(resolve_relative("", target));
            }
        }
    }
    Err(Error::DocumentParse(
        "_rels/.rels has no officeDocument relationship".to_string(),
    ))
}

fn parse_relationships(bytes: &[u8]) -> crate::error::Result<RelationshipTable> {
    let text = std::str::from_utf8(bytes)
        .map_err(|e| Error::DocumentParse(format!("relationships part is not valid UTF-8: {e}")))?;
    let root: Element = text
        .parse()
        .map_err(|e| Error::DocumentParse(format!("could not parse relationships part: {e}")))?;
    let mut table = RelationshipTable::new();
    for rel in root.children().filter(|e| e.name() == "Relationship") {
        let id = rel.attr("Id").unwrap_or_default().to_string();
        let rel_type = rel.attr("Type").unwrap_or_default().to_string();
        let target = rel.attr("Target").unwrap_or_default().to_string();
        let external = rel.attr("TargetMode").is_some_and(|m| m == "External");
        let target = if external {
            RelationshipTarget::Url(target)
        } else {
            RelationshipTarget::Part(target)
        };
        table.insert(Relationship { id, target, external, rel_type });
    }
    Ok(table)
}

fn parse_styles(bytes: &[u8]) -> crate::error::Result<StyleTable> {
    let text = std::str::from_utf8(bytes)
        .map_err(|e| Error::DocumentParse(format!("styles part is not valid UTF-8: {e}")))?;
    let root: Element = text
        .parse()
        .map_err(|e| Error::DocumentParse(format!("could not parse styles part: {e}")))?;
    let mut table = StyleTable::new();
    for style in root.children().filter(|e| e.name() == "style") {
        let Some(id) = style.attr("w:styleId").or_else(|| style.attr("styleId")) else {
            continue;
        };
        table.insert(id.to_string(), to_raw(style));
    }
    Ok(table)
}

/// Recovers the root element's raw attributes (namespace declarations
/// included) by scanning the original source text, since the XML parser
/// resolves `xmlns:*` into namespace bindings rather than exposing them as
/// ordinary attributes.
fn extract_root_attrs(xml: &str) -> Vec<(String, String)> {
    let Some(lt) = xml.find("<w:document").or_else(|| xml.find("<?xml")).and(xml.find("<w:document"))
    else {
        return Vec::new();
    };
    let rest = &xml[lt..];
    let Some(gt) = find_tag_end(rest) else {
        return Vec::new();
    };
    parse_tag_attrs(&rest[..gt])
}

fn find_tag_end(tag_text: &str) -> Option<usize> {
    let bytes = tag_text.as_bytes();
    let mut in_quote: Option<u8> = None;
    for (i, &b) in bytes.iter().enumerate() {
        match in_quote {
            Some(q) if b == q => in_quote = None,
            Some(_) => {}
            None if b == b'"' || b == b'\'' => in_quote = Some(b),
            None if b == b'>' => return Some(i),
            None => {}
        }
    }
    None
}

fn parse_tag_attrs(tag_text: &str) -> Vec<(String, String)> {
    let mut attrs = Vec::new();
    let bytes = tag_text.as_bytes();
    let mut i = 0;
    // Skip the element name itself.
    while i < bytes.len() && !bytes[i].is_ascii_whitespace() {
        i += 1;
    }
    while i < bytes.len() {
        while i < bytes.len() && bytes[i].is_ascii_whitespace() {
            i += 1;
        }
        let name_start = i;
        while i < bytes.len() && bytes[i] != b'=' && !bytes[i].is_ascii_whitespace() {
            i += 1;
        }
        if i >= bytes.len() || name_start == i {
            break;
        }
        let name = tag_text[name_start..i].to_string();
        while i < bytes.len() && (bytes[i] == b'=' || bytes[i].is_ascii_whitespace()) {
            i += 1;
        }
        let Some(&quote) = bytes.get(i) else { break };
        if quote != b'"' && quote != b'\'' {
            break;
        }
        i += 1;
        let value_start = i;
        while i < bytes.len() && bytes[i] != quote {
            i += 1;
        }
        let value = unescape_xml(&tag_text[value_start..i]);
        i += 1;
        attrs.push((name, value));
    }
    attrs
}

fn unescape_xml(s: &str) -> String {
    s.replace("&lt;", "<")
        .replace("&gt;", ">")
        .replace("&quot;", "\"")
        .replace("&apos;", "'")
        .replace("&amp;", "&")
}

fn escape_attr(s: &str) -> String {
    s.replace('&', "&amp;")
        .replace('<', "&lt;")
        .replace('>', "&gt;")
        .replace('"', "&quot;")
}

fn escape_text(s: &str) -> String {
    s.replace('&', "&amp;").replace('<', "&lt;").replace('>', "&gt;")
}

/// Resolves `mc:AlternateContent` to a single child: the first `mc:Choice`
/// whose `Requires` prefixes are all understood namespaces, else
/// `mc:Fallback`, else the first `mc:Choice`. Prevents silent data loss
/// while never duplicating content into the working tree.
fn resolve_alternate_content<'a>(el: &'a Element) -> Option<&'a Element> {
    if el.name() != "AlternateContent" || el.ns() != NS_MC {
        return None;
    }
    let choices: Vec<&Element> = el.children().filter(|c| c.name() == "Choice").collect();
    let understood = choices.iter().find(|c| {
        c.attr("Requires")
            .map(|req| req.split_whitespace().all(|prefix| prefix == "w" || prefix == "r"))
            .unwrap_or(true)
    });
    if let Some(choice) = understood {
        return Some(choice);
    }
    if let Some(fallback) = el.children().find(|c| c.name() == "Fallback") {
        return Some(fallback);
    }
    choices.into_iter().next()
}

/// Captures `el` as an opaque, verbatim-preserved element: its tag, its
/// attributes, and its children serialized back to XML text.
fn to_raw(el: &Element) -> RawElement {
    let tag = qualify(el);
    let attrs = el.attrs().map(|(k, v)| (k.to_string(), v.to_string())).collect();
    let mut inner_xml = String::new();
    for node in el.nodes() {
        write_node(&mut inner_xml, node);
    }
    RawElement { tag, attrs, inner_xml }
}

fn qualify(el: &Element) -> String {
    match el.ns().as_str() {
        NS_W => format!("w:{}", el.name()),
        NS_MC => format!("mc:{}", el.name()),
        other => {
            if other.is_empty() {
                el.name().to_string()
            } else {
                format!("{}:{}", prefix_for_ns(other), el.name())
            }
        }
    }
}

fn prefix_for_ns(uri: &str) -> &'static str {
    match uri {
        "http://schemas.openxmlformats.org/officeDocument/2006/relationships" => "r",
        "http://schemas.openxmlformats.org/drawingml/2006/wordprocessingDrawing" => "wp",
        "http://schemas.openxmlformats.org/drawingml/2006/main" => "a",
        "http://schemas.openxmlformats.org/drawingml/2006/picture" => "pic",
        "http://schemas.openxmlformats.org/officeDocument/2006/math" => "m",
        "urn:schemas-microsoft-com:vml" => "v",
        "urn:schemas-microsoft-com:office:office" => "o",
        _ => "ns",
    }
}

fn write_node(out: &mut String, node: &minidom::Node) {
    match node {
        minidom::Node::Element(child) => write_raw_subtree(out, child),
        minidom::Node::Text(t) => out.push_str(&escape_text(t)),
    }
}

fn write_raw_subtree(out: &mut String, el: &Element) {
    if let Some(resolved) = resolve_alternate_content(el) {
        write_raw_subtree(out, resolved);
        return;
    }
    let tag = qualify(el);
    out.push('<');
    out.push_str(&tag);
    for (k, v) in el.attrs() {
        out.push(' ');
        out.push_str(k);
        out.push_str("=\"");
        out.push_str(&escape_attr(v));
        out.push('"');
    }
    if el.nodes().next().is_none() {
        out.push_str("/>");
        return;
    }
    out.push('>');
    for node in el.nodes() {
        write_node(out, node);
    }
    out.push_str("</");
    out.push_str(&tag);
    out.push('>');
}

// ---- structural parsing ----

fn parse_body(body_el: &Element) -> crate::error::Result<Body> {
    let mut children = Vec::new();
    let mut section_properties = None;
    for child in resolved_children(body_el) {
        match child.name() {
            "p" => children.push(BodyElement::Paragraph(parse_paragraph(child)?)),
            "tbl" => children.push(BodyElement::Table(parse_table(child)?)),
            "sectPr" => section_properties = Some(to_raw(child)),
            _ => children.push(BodyElement::RawSection(to_raw(child))),
        }
    }
    Ok(Body { children, section_properties })
}

/// Children of `el`, with any `mc:AlternateContent` wrapper transparently
/// resolved to its chosen branch's own children.
fn resolved_children(el: &Element) -> Vec<&Element> {
    let mut out = Vec::new();
    for child in el.children() {
        if let Some(resolved) = resolve_alternate_content(child) {
            out.extend(resolved_children(resolved));
        } else {
            out.push(child);
        }
    }
    out
}

fn parse_paragraph(p_el: &Element) -> crate::error::Result<Paragraph> {
    let mut properties = ParagraphProperties::default();
    let mut content = Vec::new();
    for child in resolved_children(p_el) {
        match child.name() {
            "pPr" => properties = parse_paragraph_properties(child),
            "r" => content.push(ParagraphChild::Run(parse_run(child))),
            "hyperlink" => content.push(ParagraphChild::Hyperlink(parse_hyperlink(child))),
            "proofErr" => content.push(ParagraphChild::ProofingMark(to_raw(child))),
            _ => content.push(ParagraphChild::RawInline(to_raw(child))),
        }
    }
    Ok(Paragraph { properties, content })
}

fn parse_run(r_el: &Element) -> Run {
    let mut run = Run::default();
    for child in resolved_children(r_el) {
        match child.name() {
            "rPr" => run.properties = parse_run_properties(child),
            "t" => {
                let mut text = child.text();
                if let Some(existing) = run.text.take() {
                    text = existing + &text;
                }
                run.preserve_space = child.attr("xml:space") == Some("preserve");
                run.text = Some(text);
            }
            "tab" => {
                let mut text = run.text.take().unwrap_or_default();
                text.push('\t');
                run.text = Some(text);
            }
            "br" => {
                run.is_break = true;
                run.is_page_break = child.attr("w:type") == Some("page");
            }
            _ => run.raw = Some(to_raw(child)),
        }
    }
    run
}

fn parse_hyperlink(h_el: &Element) -> Hyperlink {
    let relationship_id = h_el
        .attr("r:id")
        .or_else(|| h_el.attr("id"))
        .unwrap_or_default()
        .to_string();
    let runs = resolved_children(h_el)
        .into_iter()
        .filter(|c| c.name() == "r")
        .map(parse_run)
        .collect();
    Hyperlink { relationship_id, runs }
}

fn parse_table(t_el: &Element) -> crate::error::Result<Table> {
    let mut properties = TableProperties::default();
    let mut grid = Vec::new();
    let mut rows = Vec::new();
    for child in resolved_children(t_el) {
        match child.name() {
            "tblPr" => properties = parse_table_properties(child),
            "tblGrid" => {
                grid = child
                    .children()
                    .filter(|c| c.name() == "gridCol")
                    .filter_map(|c| c.attr("w").and_then(|w| w.parse::<i64>().ok()))
                    .collect();
            }
            "tr" => rows.push(parse_row(child)),
            _ => {}
        }
    }
    Ok(Table { properties, grid, rows })
}

fn parse_row(tr_el: &Element) -> TableRow {
    let mut properties = Vec::new();
    let mut cells = Vec::new();
    for child in resolved_children(tr_el) {
        match child.name() {
            "trPr" => properties = parse_props_as_pairs(child),
            "tc" => cells.push(parse_cell(child)),
            _ => {}
        }
    }
    TableRow { properties, cells }
}

fn parse_cell(tc_el: &Element) -> TableCell {
    let mut properties = Vec::new();
    let mut paragraphs = Vec::new();
    for child in resolved_children(tc_el) {
        match child.name() {
            "tcPr" => properties = parse_props_as_pairs(child),
            "p" => {
                if let Ok(p) = parse_paragraph(child) {
                    paragraphs.push(p);
                }
            }
            _ => {}
        }
    }
    TableCell { properties, paragraphs }
}

/// A best-effort flattening of a `trPr`/`tcPr`-style properties element
/// into `(child tag, val attribute)` pairs, for the row/cell property
/// fields this crate does not otherwise model structurally.
fn parse_props_as_pairs(el: &Element) -> Vec<(String, String)> {
    el.children()
        .map(|c| (c.name().to_string(), c.attr("w:val").or_else(|| c.attr("val")).unwrap_or("").to_string()))
        .collect()
}

fn parse_run_properties(rpr: &Element) -> RunProperties {
    let mut props = RunProperties::default();
    for child in rpr.children() {
        let val = child.attr("w:val").or_else(|| child.attr("val"));
        match child.name() {
            "b" => props.bold = val != Some("0") && val != Some("false"),
            "i" => props.italic = val != Some("0") && val != Some("false"),
            "u" => props.underline = val != Some("none"),
            "strike" => props.strike = val != Some("0") && val != Some("false"),
            "rFonts" => {
                props.font = child
                    .attr("w:ascii")
                    .or_else(|| child.attr("ascii"))
                    .map(str::to_string)
            }
            "sz" => props.size_half_points = val.and_then(|v| v.parse().ok()),
            "color" => props.color = val.map(str::to_string),
            "highlight" => props.highlight = val.map(str::to_string),
            "rStyle" => props.style_id = val.map(str::to_string),
            _ => props.raw.push(to_raw(child)),
        }
    }
    props
}

fn parse_paragraph_properties(ppr: &Element) -> ParagraphProperties {
    let mut props = ParagraphProperties::default();
    for child in ppr.children() {
        let val = child.attr("w:val").or_else(|| child.attr("val"));
        match child.name() {
            "pStyle" => props.style_id = val.map(str::to_string),
            "jc" => props.alignment = val.map(str::to_string),
            "numPr" => {
                for grandchild in child.children() {
                    let gval = grandchild
                        .attr("w:val")
                        .or_else(|| grandchild.attr("val"))
                        .and_then(|v| v.parse().ok());
                    match grandchild.name() {
                        "ilvl" => props.numbering_level = gval,
                        "numId" => props.numbering_id = gval,
                        _ => {}
                    }
                }
            }
            _ => props.raw.push(to_raw(child)),
        }
    }
    props
}

fn parse_table_properties(tblpr: &Element) -> TableProperties {
    let mut props = TableProperties::default();
    for child in tblpr.children() {
        let val = child.attr("w:val").or_else(|| child.attr("val"));
        match child.name() {
            "tblStyle" => props.style_id = val.map(str::to_string),
            "tblW" => {
                props.width_dxa = child
                    .attr("w:w")
                    .or_else(|| child.attr("w"))
                    .and_then(|v| v.parse().ok())
            }
            _ => props.raw.push(to_raw(child)),
        }
    }
    props
}

// ---- structural serialization ----

fn write_document(doc: &Document) -> String {
    let mut out = String::new();
    out.push_str("<?xml version=\"1.0\" encoding=\"UTF-8\" standalone=\"yes\"?>\n");
    out.push_str("<w:document");
    for (k, v) in &doc.attrs {
        out.push(' ');
        out.push_str(k);
        out.push_str("=\"");
        out.push_str(&escape_attr(v));
        out.push('"');
    }
    out.push('>');
    write_body(&mut out, &doc.body);
    out.push_str("</w:document>");
    out
}

fn write_body(out: &mut String, body: &Body) {
    out.push_str("<w:body>");
    for el in &body.children {
        match el {
            BodyElement::Paragraph(p) => write_paragraph(out, p),
            BodyElement::Table(t) => write_table(out, t),
            BodyElement::RawSection(r) => write_raw_element(out, r),
        }
    }
    if let Some(sect_pr) = &body.section_properties {
        write_raw_element(out, sect_pr);
    }
    out.push_str("</w:body>");
}

fn write_raw_element(out: &mut String, el: &RawElement) {
    out.push('<');
    out.push_str(&el.tag);
    for (k, v) in &el.attrs {
        out.push(' ');
        out.push_str(k);
        out.push_str("=\"");
        out.push_str(&escape_attr(v));
        out.push('"');
    }
    if el.inner_xml.is_empty() {
        out.push_str("/>");
    } else {
        out.push('>');
        out.push_str(&el.inner_xml);
        out.push_str("</");
        out.push_str(&el.tag);
        out.push('>');
    }
}

fn write_paragraph(out: &mut String, p: &Paragraph) {
    out.push_str("<w:p>");
    write_paragraph_properties(out, &p.properties);
    for child in &p.content {
        match child {
            ParagraphChild::Run(r) => write_run(out, r),
            ParagraphChild::Hyperlink(h) => write_hyperlink(out, h),
            ParagraphChild::ProofingMark(r) | ParagraphChild::RawInline(r) => write_raw_element(out, r),
        }
    }
    out.push_str("</w:p>");
}

fn write_run(out: &mut String, r: &Run) {
    out.push_str("<w:r>");
    write_run_properties(out, &r.properties);
    if let Some(raw) = &r.raw {
        write_raw_element(out, raw);
    }
    if r.is_break {
        if r.is_page_break {
            out.push_str("<w:br w:type=\"page\"/>");
        } else {
            out.push_str("<w:br/>");
        }
    }
    if let Some(text) = &r.text {
        out.push_str("<w:t");
        if r.preserve_space {
            out.push_str(" xml:space=\"preserve\"");
        }
        out.push('>');
        out.push_str(&escape_text(text));
        out.push_str("</w:t>");
    }
    out.push_str("</w:r>");
}

fn write_hyperlink(out: &mut String, h: &Hyperlink) {
    out.push_str("<w:hyperlink r:id=\"");
    out.push_str(&escape_attr(&h.relationship_id));
    out.push_str("\">");
    for r in &h.runs {
        write_run(out, r);
    }
    out.push_str("</w:hyperlink>");
}

fn write_table(out: &mut String, t: &Table) {
    out.push_str("<w:tbl>");
    write_table_properties(out, &t.properties);
    if !t.grid.is_empty() {
        out.push_str("<w:tblGrid>");
        for w in &t.grid {
            out.push_str(&format!("<w:gridCol w:w=\"{w}\"/>"));
        }
        out.push_str("</w:tblGrid>");
    }
    for row in &t.rows {
        write_row(out, row);
    }
    out.push_str("</w:tbl>");
}

fn write_row(out: &mut String, row: &TableRow) {
    out.push_str("<w:tr>");
    write_props_as_pairs(out, "trPr", &row.properties);
    for cell in &row.cells {
        write_cell(out, cell);
    }
    out.push_str("</w:tr>");
}

fn write_cell(out: &mut String, cell: &TableCell) {
    out.push_str("<w:tc>");
    write_props_as_pairs(out, "tcPr", &cell.properties);
    for p in &cell.paragraphs {
        write_paragraph(out, p);
    }
    out.push_str("</w:tc>");
}

fn write_props_as_pairs(out: &mut String, wrapper_tag: &str, pairs: &[(String, String)]) {
    if pairs.is_empty() {
        return;
    }
    out.push_str("<w:");
    out.push_str(wrapper_tag);
    out.push('>');
    for (tag, val) in pairs {
        out.push_str("<w:");
        out.push_str(tag);
        if !val.is_empty() {
            out.push_str(" w:val=\"");
            out.push_str(&escape_attr(val));
            out.push('"');
        }
        out.push_str("/>");
    }
    out.push_str("</w:");
    out.push_str(wrapper_tag);
    out.push('>');
}

fn write_run_properties(out: &mut String, props: &RunProperties) {
    if props == &RunProperties::default() {
        return;
    }
    out.push_str("<w:rPr>");
    if let Some(style) = &props.style_id {
        out.push_str(&format!("<w:rStyle w:val=\"{}\"/>", escape_attr(style)));
    }
    if let Some(font) = &props.font {
        out.push_str(&format!("<w:rFonts w:ascii=\"{0}\" w:hAnsi=\"{0}\"/>", escape_attr(font)));
    }
    if props.bold {
        out.push_str("<w:b/>");
    }
    if props.italic {
        out.push_str("<w:i/>");
    }
    if props.underline {
        out.push_str("<w:u w:val=\"single\"/>");
    }
    if props.strike {
        out.push_str("<w:strike/>");
    }
    if let Some(color) = &props.color {
        out.push_str(&format!("<w:color w:val=\"{}\"/>", escape_attr(color)));
    }
    if let Some(size) = props.size_half_points {
        out.push_str(&format!("<w:sz w:val=\"{size}\"/>"));
    }
    if let Some(highlight) = &props.highlight {
        out.push_str(&format!("<w:highlight w:val=\"{}\"/>", escape_attr(highlight)));
    }
    for raw in &props.raw {
        write_raw_element(out, raw);
    }
    out.push_str("</w:rPr>");
}

fn write_paragraph_properties(out: &mut String, props: &ParagraphProperties) {
    if props == &ParagraphProperties::default() {
        return;
    }
    out.push_str("<w:pPr>");
    if let Some(style) = &props.style_id {
        out.push_str(&format!("<w:pStyle w:val=\"{}\"/>", escape_attr(style)));
    }
    if let Some(alignment) = &props.alignment {
        out.push_str(&format!("<w:jc w:val=\"{}\"/>", escape_attr(alignment)));
    }
    if props.numbering_id.is_some() || props.numbering_level.is_some() {
        out.push_str("<w:numPr>");
        if let Some(lvl) = props.numbering_level {
            out.push_str(&format!("<w:ilvl w:val=\"{lvl}\"/>"));
        }
        if let Some(id) = props.numbering_id {
            out.push_str(&format!("<w:numId w:val=\"{id}\"/>"));
        }
        out.push_str("</w:numPr>");
    }
    for raw in &props.raw {
        write_raw_element(out, raw);
    }
    out.push_str("</w:pPr>");
}

fn write_table_properties(out: &mut String, props: &TableProperties) {
    if props == &TableProperties::default() {
        return;
    }
    out.push_str("<w:tblPr>");
    if let Some(style) = &props.style_id {
        out.push_str(&format!("<w:tblStyle w:val=\"{}\"/>", escape_attr(style)));
    }
    if let Some(width) = props.width_dxa {
        out.push_str(&format!("<w:tblW w:w=\"{width}\" w:type=\"dxa\"/>"));
    }
    for raw in &props.raw {
        write_raw_element(out, raw);
    }
    out.push_str("</w:tblPr>");
}

fn write_relationships(table: &RelationshipTable) -> String {
    let mut out = String::new();
    out.push_str("<?xml version=\"1.0\" encoding=\"UTF-8\" standalone=\"yes\"?>\n");
    out.push_str("<Relationships xmlns=\"");
    out.push_str(NS_RELS_PKG);
    out.push_str("\">");
    for rel in table.iter() {
        out.push_str("<Relationship Id=\"");
        out.push_str(&escape_attr(&rel.id));
        out.push_str("\" Type=\"");
        out.push_str(&escape_attr(&rel.rel_type));
        out.push_str("\" Target=\"");
        out.push_str(&escape_attr(rel.target_path()));
        out.push('"');
        if rel.external {
            out.push_str(" TargetMode=\"External\"");
        }
        out.push_str("/>");
    }
    out.push_str("</Relationships>");
    out
}

fn write_styles(styles: &StyleTable) -> String {
    let mut out = String::new();
    out.push_str("<?xml version=\"1.0\" encoding=\"UTF-8\" standalone=\"yes\"?>\n");
    out.push_str("<w:styles xmlns:w=\"");
    out.push_str(NS_W);
    out.push_str("\">");
    for style in styles.values() {
        write_raw_element(&mut out, style);
    }
    out.push_str("</w:styles>");
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_docx() -> Vec<u8> {
        let mut out = Cursor::new(Vec::new());
        {
            let mut zip = zip::ZipWriter::new(&mut out);
            let opts = zip::write::SimpleFileOptions::default()
                .compression_method(zip::CompressionMethod::Deflated);

            zip.start_file("_rels/.rels", opts).unwrap();
            zip.write_all(br#"<?xml version="1.0"?><Relationships xmlns="http://schemas.openxmlformats.org/package/2006/relationships"><Relationship Id="rId1" Type="http://schemas.openxmlformats.org/officeDocument/2006/relationships/officeDocument" Target="word/document.xml"/></Relationships>"#).unwrap();

            zip.start_file("word/document.xml", opts).unwrap();
            zip.write_all(br#"<?xml version="1.0"?><w:document xmlns:w="http://schemas.openxmlformats.org/wordprocessingml/2006/main" xmlns:r="http://schemas.openxmlformats.org/officeDocument/2006/relationships"><w:body><w:p><w:r><w:t>Hello, {{name}}!</w:t></w:r></w:p></w:body></w:document>"#).unwrap();

            zip.start_file("word/_rels/document.xml.rels", opts).unwrap();
            zip.write_all(br#"<?xml version="1.0"?><Relationships xmlns="http://schemas.openxmlformats.org/package/2006/relationships"></Relationships>"#).unwrap();

            zip.finish().unwrap();
        }
        out.into_inner()
    }

    #[test]
    fn opens_a_minimal_docx_and_extracts_the_document_body() {
        let pkg = Package::open(&sample_docx()).unwrap();
        assert_eq!(pkg.document.body.children.len(), 1);
        let BodyElement::Paragraph(p) = &pkg.document.body.children[0] else {
            panic!("expected a paragraph")
        };
        assert_eq!(p.text(), "Hello, {{name}}!");
    }

    #[test]
    fn round_trips_root_namespace_declarations() {
        let pkg = Package::open(&sample_docx()).unwrap();
        assert!(pkg
            .document
            .attrs
            .iter()
            .any(|(k, v)| k == "xmlns:w" && v.contains("wordprocessingml")));
    }

    #[test]
    fn save_reproduces_a_parseable_archive() {
        let pkg = Package::open(&sample_docx()).unwrap();
        let bytes = pkg.save().unwrap();
        let reopened = Package::open(&bytes).unwrap();
        let BodyElement::Paragraph(p) = &reopened.document.body.children[0] else {
            panic!("expected a paragraph")
        };
        assert_eq!(p.text(), "Hello, {{name}}!");
    }
}
