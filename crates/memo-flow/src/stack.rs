//! Call stack frames for diagnostics and cycle reporting.
//!
//! Tasks interleave, so the active stack is not a thread-local: each
//! computation context carries a chain of frames, one per cell currently
//! being worked on along its own calling path.

use std::any::Any;
use std::fmt;
use std::rc::Rc;

use crate::key::Key;
use crate::memo::{Memo, Value};

/// One call: which function, on which input.
///
/// Frames compare by the identity of the cell they belong to, so two cycles
/// over equal-looking inputs stay distinguishable.
#[derive(Clone)]
pub struct StackFrame {
    name: Option<Rc<str>>,
    repr: Rc<str>,
    func: u32,
    input: Rc<dyn Any>,
    cell: u64,
}

impl StackFrame {
    pub(crate) fn new(
        name: Option<Rc<str>>,
        repr: Rc<str>,
        func: u32,
        input: Rc<dyn Any>,
        cell: u64,
    ) -> Self {
        StackFrame {
            name,
            repr,
            func,
            input,
            cell,
        }
    }

    /// The function name, or `None` for engine-internal cells.
    pub fn name(&self) -> Option<&str> {
        self.name.as_deref()
    }

    /// Debug rendering of the input, captured when the cell was created.
    pub fn input_repr(&self) -> &str {
        &self.repr
    }

    /// The input, if this frame belongs to `memo`.
    pub fn input_as<I: Key, O: Value>(&self, memo: &Memo<I, O>) -> Option<I> {
        if self.func != memo.index() {
            return None;
        }
        self.input.downcast_ref::<I>().cloned()
    }
}

impl PartialEq for StackFrame {
    fn eq(&self, other: &Self) -> bool {
        self.cell == other.cell
    }
}

impl Eq for StackFrame {}

impl fmt::Display for StackFrame {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.name {
            Some(name) => write!(f, "{}({})", name, self.repr),
            None => write!(f, "<internal>({})", self.repr),
        }
    }
}

impl fmt::Debug for StackFrame {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{self}")
    }
}

/// A link in the per-task chain of active frames.
pub(crate) struct FrameNode {
    pub(crate) frame: StackFrame,
    pub(crate) parent: Option<Rc<FrameNode>>,
}

/// Materialize a chain as a vector, innermost frame first.
pub(crate) fn stack_of(mut node: Option<&Rc<FrameNode>>) -> Vec<StackFrame> {
    let mut frames = Vec::new();
    while let Some(n) = node {
        frames.push(n.frame.clone());
        node = n.parent.as_ref();
    }
    frames
}
