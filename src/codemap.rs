//! Source position tracking for template text, adapted from the teacher
//! repo's codemap: a byte-range `Span`, a `Spanned<T>` wrapper, and a
//! `FileMap` that turns a byte offset into a line/column pair for
//! position-tagged errors.

use peg::str::LineCol;

/// A range of text within a source string.
#[derive(Copy, Clone, Debug, Eq, Hash, PartialEq)]
pub struct Span {
    /// The byte offset of the first byte of the span.
    pub start: usize,
    /// The byte offset after the last byte of the span.
    pub end: usize,
}

impl Span {
    /// Creates a new span.
    #[inline]
    pub fn new(start: usize, end: usize) -> Self {
        Self { start, end }
    }

    /// Returns true if this span is empty.
    #[inline]
    pub fn is_empty(self) -> bool {
        self.start >= self.end
    }

    /// Creates a span that encloses both `self` and `other`.
    #[inline]
    pub fn merge(self, other: Span) -> Span {
        Span {
            start: self.start.min(other.start),
            end: self.end.max(other.end),
        }
    }

    /// Converts the span into a range usable for string indexing.
    #[inline]
    pub fn into_range(self) -> core::ops::Range<usize> {
        self.start..self.end
    }
}

impl From<core::ops::Range<usize>> for Span {
    fn from(r: core::ops::Range<usize>) -> Self {
        Span::new(r.start, r.end)
    }
}

/// Associates a [`Span`] with a value of arbitrary type.
#[derive(Clone, Debug, Eq, PartialEq, Hash)]
pub struct Spanned<T> {
    /// The value.
    pub node: T,
    /// The span that produced the value.
    pub span: Span,
}

impl<T> Spanned<T> {
    /// Creates a new [`Spanned`].
    #[inline]
    pub fn new(node: T, span: Span) -> Self {
        Self { node, span }
    }

    /// Maps a `Spanned<T>` to `Spanned<U>`, leaving the span untouched.
    pub fn map_node<U, F: FnOnce(T) -> U>(self, op: F) -> Spanned<U> {
        Spanned {
            node: op(self.node),
            span: self.span,
        }
    }
}

impl<T> core::ops::Deref for Spanned<T> {
    type Target = T;

    fn deref(&self) -> &T {
        &self.node
    }
}

/// A record of a source string's line beginnings, for translating byte
/// offsets into human-readable line/column positions.
#[derive(Clone, Debug)]
pub struct FileMap {
    /// Byte positions of line beginnings.
    lines: Vec<u32>,
    /// Total source length, for clamping.
    len: usize,
}

impl FileMap {
    /// Creates a new file map over `source`.
    pub fn new(source: &str) -> Self {
        let lines = core::iter::once(0)
            .chain(
                source
                    .match_indices('\n')
                    .map(|(p, _)| u32::try_from(p + 1).unwrap()),
            )
            .collect();
        Self {
            lines,
            len: source.len(),
        }
    }

    /// Gets the line and column of a byte position (1-indexed).
    pub fn find_line_col(&self, pos: usize) -> LineCol {
        let pos = pos.min(self.len);
        let line = self.find_line(pos);
        let line_start = self.lines[line] as usize;
        let column = pos - line_start + 1;
        LineCol {
            line: line + 1,
            column,
            offset: pos,
        }
    }

    fn find_line(&self, pos: usize) -> usize {
        let pos = u32::try_from(pos).unwrap();
        match self.lines.binary_search(&pos) {
            Ok(i) => i,
            Err(i) => i - 1,
        }
    }
}
