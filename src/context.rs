//! The data context: an ordered stack of frames mapping identifiers to
//! values, with hierarchical lookup nearest-frame-first.

use crate::value::Value;
use indexmap::IndexMap;

/// A single binding frame in the context chain.
#[derive(Debug, Default)]
struct Frame {
    bindings: IndexMap<String, Value>,
}

/// A scope chain of name-to-value bindings. Loop iteration pushes a frame
/// for the duration of one iteration body and pops it on exit, including on
/// evaluation failure.
#[derive(Debug)]
pub struct Context {
    frames: Vec<Frame>,
}

impl Context {
    /// Creates a new context with a single root frame containing `root`.
    pub fn new(root: IndexMap<String, Value>) -> Self {
        Self {
            frames: vec![Frame { bindings: root }],
        }
    }

    /// Looks up an identifier, searching frames nearest-first. Returns
    /// `None` if no frame binds it.
    pub fn lookup(&self, name: &str) -> Option<&Value> {
        self.frames
            .iter()
            .rev()
            .find_map(|frame| frame.bindings.get(name))
    }

    /// Pushes a new frame. Returns a guard that pops the frame when
    /// dropped, so a frame is released on every exit path — including
    /// early return from an evaluation error — without requiring the
    /// caller to remember to pop it.
    pub fn push(&mut self) -> FrameGuard<'_> {
        self.frames.push(Frame::default());
        FrameGuard { ctx: self }
    }

    /// Binds a name in the nearest (top) frame.
    pub fn bind(&mut self, name: impl Into<String>, value: Value) {
        self.frames
            .last_mut()
            .expect("context always has at least one frame")
            .bindings
            .insert(name.into(), value);
    }

    /// The current nesting depth, for diagnostics.
    pub fn depth(&self) -> usize {
        self.frames.len()
    }
}

/// RAII guard that pops its [`Context`] frame on drop.
pub struct FrameGuard<'a> {
    ctx: &'a mut Context,
}

impl FrameGuard<'_> {
    /// Binds a name in the frame this guard owns.
    pub fn bind(&mut self, name: impl Into<String>, value: Value) {
        self.ctx.bind(name, value);
    }

    /// Borrows the underlying context mutably, for recursive evaluation
    /// within the pushed scope.
    pub fn ctx(&mut self) -> &mut Context {
        self.ctx
    }
}

impl Drop for FrameGuard<'_> {
    fn drop(&mut self) {
        self.ctx.frames.pop();
    }
}
