//! The per-part relationship table: opaque ids mapping to external or
//! internal targets, plus the remap machinery used when fragments are
//! spliced into a host.

use indexmap::IndexMap;

/// What a relationship id points at.
#[derive(Clone, Debug, Eq, PartialEq)]
pub enum RelationshipTarget {
    /// An external URL (hyperlink target).
    Url(String),
    /// An internal part path (e.g. a media file or a header part).
    Part(String),
}

/// A single relationship entry.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct Relationship {
    pub id: String,
    pub target: RelationshipTarget,
    /// True for `TargetMode="External"` relationships (hyperlinks, as
    /// opposed to internal media parts).
    pub external: bool,
    /// The relationship's `Type` attribute (a schema URI), preserved
    /// verbatim so it round-trips without this crate needing to know what
    /// every relationship type means.
    pub rel_type: String,
}

/// A part's relationship table: id -> target, with a unique-id invariant.
#[derive(Clone, Debug, Default)]
pub struct RelationshipTable {
    entries: IndexMap<String, Relationship>,
    next_numeric_id: u64,
}

impl RelationshipTable {
    /// Creates an empty relationship table.
    pub fn new() -> Self {
        Self::default()
    }

    /// Inserts a relationship, trusting the caller that `id` is unique.
    /// Used when parsing an existing part.
    pub fn insert(&mut self, relationship: Relationship) {
        if let Some(n) = relationship.id.strip_prefix("rId").and_then(|s| s.parse::<u64>().ok()) {
            self.next_numeric_id = self.next_numeric_id.max(n + 1);
        }
        self.entries.insert(relationship.id.clone(), relationship);
    }

    /// Looks up a relationship by id.
    pub fn get(&self, id: &str) -> Option<&Relationship> {
        self.entries.get(id)
    }

    /// Allocates and registers a fresh id unique in this table, for a given
    /// target. Used when rewriting relationship ids from a spliced
    /// fragment.
    pub fn allocate(&mut self, target: RelationshipTarget, external: bool, rel_type: String) -> String {
        loop {
            let candidate = format!("rId{}", self.next_numeric_id);
            self.next_numeric_id += 1;
            if !self.entries.contains_key(&candidate) {
                self.entries.insert(
                    candidate.clone(),
                    Relationship {
                        id: candidate.clone(),
                        target,
                        external,
                        rel_type,
                    },
                );
                return candidate;
            }
        }
    }

    /// Iterates over all entries, in insertion order.
    pub fn iter(&self) -> impl Iterator<Item = &Relationship> {
        self.entries.values()
    }

    /// The number of registered relationships.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

/// Computes a remap from a fragment's relationship ids to fresh ids unique
/// in `host`, registering each remapped target in `host`. The remap is
/// computed once per include site and applied to every hyperlink and media
/// reference in the spliced subtree; targets are copied byte-exact, only
/// the opaque id changes.
pub fn remap_into_host(
    host: &mut RelationshipTable,
    fragment: &RelationshipTable,
) -> IndexMap<String, String> {
    let mut remap = IndexMap::new();
    for rel in fragment.iter() {
        let new_id = host.allocate(rel.target.clone(), rel.external, rel.rel_type.clone());
        remap.insert(rel.id.clone(), new_id);
    }
    remap
}
