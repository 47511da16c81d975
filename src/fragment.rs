//! The fragment includer: resolves `{{include}}` directives against a
//! registered set of named, pre-parsed sub-documents, splicing a deep copy
//! of the fragment body into the host at the include site with fresh
//! relationship ids and first-wins style merging.

use crate::doc::relationships::{remap_into_host, RelationshipTable};
use crate::doc::{Body, BodyElement, Hyperlink, Paragraph, ParagraphChild, RawElement, Table};
use crate::error::{Error, Position, Result};
use indexmap::IndexMap;
use std::collections::HashMap;

/// A style definition, keyed by its style id, preserved verbatim. Merged
/// into the host with first-registered-wins on a name collision.
pub type StyleTable = IndexMap<String, RawElement>;

/// A named, pre-parsed sub-document that may be spliced in at an
/// `{{include}}` site. Fragments are prepared the same way a top-level
/// template is (coalesced, directive-indexed) before being registered.
#[derive(Clone, Debug, Default)]
pub struct Fragment {
    pub name: String,
    pub body: Body,
    pub relationships: RelationshipTable,
    pub styles: StyleTable,
}

/// The set of fragments an engine or a single render has available,
/// keyed by the name used in `{{include "name"}}`.
#[derive(Clone, Debug, Default)]
pub struct FragmentStore {
    fragments: HashMap<String, Fragment>,
}

impl FragmentStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, fragment: Fragment) {
        self.fragments.insert(fragment.name.clone(), fragment);
    }

    pub fn get(&self, name: &str) -> Option<&Fragment> {
        self.fragments.get(name)
    }

    pub fn contains(&self, name: &str) -> bool {
        self.fragments.contains_key(name)
    }
}

/// Tracks the chain of fragment names currently being included, to detect
/// cycles, and the current nesting depth against a configured maximum.
#[derive(Debug, Default)]
pub struct IncludeStack {
    names: Vec<String>,
    max_depth: usize,
}

impl IncludeStack {
    pub fn new(max_depth: usize) -> Self {
        Self { names: Vec::new(), max_depth }
    }

    /// Pushes `name`, erroring on a cycle or on exceeding `max_depth`.
    /// Returns a guard that pops the name on drop.
    pub fn enter<'a>(&'a mut self, name: &str, pos: &Position) -> Result<IncludeGuard<'a>> {
        if self.names.iter().any(|n| n == name) {
            return Err(Error::CircularInclude(pos.clone(), name.to_string()));
        }
        if self.names.len() >= self.max_depth {
            return Err(Error::IncludeDepthExceeded(pos.clone()));
        }
        self.names.push(name.to_string());
        Ok(IncludeGuard { stack: self })
    }
}

pub struct IncludeGuard<'a> {
    stack: &'a mut IncludeStack,
}

impl Drop for IncludeGuard<'_> {
    fn drop(&mut self) {
        self.stack.names.pop();
    }
}

/// Merges `incoming` into `host` with first-registered-wins on a name
/// collision: an entry already present in `host` is never overwritten.
pub fn merge_styles(host: &mut StyleTable, incoming: &StyleTable) {
    for (name, def) in incoming {
        host.entry(name.clone()).or_insert_with(|| def.clone());
    }
}

/// Splices a deep copy of `fragment`'s body into `host_relationships`,
/// rewriting every hyperlink relationship id the copy references to a
/// fresh id registered in the host, and merging the fragment's style table
/// into `host_styles` (first-wins). Returns the rewritten body elements,
/// ready to be rendered under the current context.
pub fn splice(
    fragment: &Fragment,
    host_relationships: &mut RelationshipTable,
    host_styles: &mut StyleTable,
) -> Vec<BodyElement> {
    let remap = remap_into_host(host_relationships, &fragment.relationships);
    merge_styles(host_styles, &fragment.styles);
    fragment
        .body
        .children
        .iter()
        .cloned()
        .map(|el| rewrite_element(el, &remap))
        .collect()
}

fn rewrite_element(el: BodyElement, remap: &IndexMap<String, String>) -> BodyElement {
    match el {
        BodyElement::Paragraph(p) => BodyElement::Paragraph(rewrite_paragraph(p, remap)),
        BodyElement::Table(t) => BodyElement::Table(rewrite_table(t, remap)),
        BodyElement::RawSection(r) => BodyElement::RawSection(r),
    }
}

fn rewrite_paragraph(mut p: Paragraph, remap: &IndexMap<String, String>) -> Paragraph {
    for child in &mut p.content {
        if let ParagraphChild::Hyperlink(h) = child {
            rewrite_hyperlink(h, remap);
        }
    }
    p
}

fn rewrite_hyperlink(h: &mut Hyperlink, remap: &IndexMap<String, String>) {
    if let Some(new_id) = remap.get(&h.relationship_id) {
        h.relationship_id = new_id.clone();
    }
}

fn rewrite_table(mut t: Table, remap: &IndexMap<String, String>) -> Table {
    for row in &mut t.rows {
        for cell in &mut row.cells {
            for paragraph in &mut cell.paragraphs {
                let rewritten = rewrite_paragraph(std::mem::take(paragraph), remap);
                *paragraph = rewritten;
            }
        }
    }
    t
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::doc::relationships::{Relationship, RelationshipTarget};
    use crate::doc::Run;

    #[test]
    fn splice_rewrites_hyperlink_ids_and_preserves_targets() {
        let mut fragment_rels = RelationshipTable::new();
        fragment_rels.insert(Relationship {
            id: "rId1".into(),
            target: RelationshipTarget::Url("https://example.com".into()),
            external: true,
            rel_type: "http://schemas.openxmlformats.org/officeDocument/2006/relationships/hyperlink".into(),
        });
        let fragment = Fragment {
            name: "sig".into(),
            body: Body {
                children: vec![BodyElement::Paragraph(Paragraph {
                    content: vec![ParagraphChild::Hyperlink(Hyperlink {
                        relationship_id: "rId1".into(),
                        runs: vec![Run::text("link")],
                    })],
                    ..Default::default()
                })],
                ..Default::default()
            },
            relationships: fragment_rels,
            styles: StyleTable::new(),
        };
        let mut host_rels = RelationshipTable::new();
        host_rels.insert(Relationship {
            id: "rId1".into(),
            target: RelationshipTarget::Part("media/image1.png".into()),
            external: false,
            rel_type: "http://schemas.openxmlformats.org/officeDocument/2006/relationships/image".into(),
        });
        let mut host_styles = StyleTable::new();
        let spliced = splice(&fragment, &mut host_rels, &mut host_styles);
        let BodyElement::Paragraph(p) = &spliced[0] else { panic!("expected paragraph") };
        let ParagraphChild::Hyperlink(h) = &p.content[0] else { panic!("expected hyperlink") };
        assert_ne!(h.relationship_id, "rId1");
        assert_eq!(
            host_rels.get(&h.relationship_id).unwrap().target,
            RelationshipTarget::Url("https://example.com".into())
        );
    }

    #[test]
    fn include_stack_detects_cycles() {
        let mut stack = IncludeStack::new(10);
        let pos = Position::default();
        let _a = stack.enter("a", &pos).unwrap();
        assert!(stack.enter("a", &pos).is_err());
    }

    #[test]
    fn include_stack_enforces_max_depth() {
        let mut stack = IncludeStack::new(1);
        let pos = Position::default();
        let _a = stack.enter("a", &pos).unwrap();
        assert!(stack.enter("b", &pos).is_err());
    }

    #[test]
    fn style_merge_is_first_wins() {
        let mut host: StyleTable = StyleTable::new();
        host.insert("Heading1".into(), RawElement { tag: "host".into(), ..Default::default() });
        let mut incoming: StyleTable = StyleTable::new();
        incoming.insert("Heading1".into(), RawElement { tag: "fragment".into(), ..Default::default() });
        incoming.insert("Heading2".into(), RawElement { tag: "fragment".into(), ..Default::default() });
        merge_styles(&mut host, &incoming);
        assert_eq!(host.get("Heading1").unwrap().tag, "host");
        assert_eq!(host.get("Heading2").unwrap().tag, "fragment");
    }
}
