//! Composable invalidation values.
//!
//! An [`Invalidation`] describes what to drop at the next run boundary; it
//! does nothing until handed to [`Engine::reset`](crate::Engine::reset).
//! Values combine associatively and commutatively, so independent subsystems
//! can each contribute their share and the caller merges them.

use std::rc::Rc;

use crate::cell::AnyCell;
use crate::memo::AnyFunction;

pub(crate) enum Leaf {
    Cell(Rc<dyn AnyCell>),
    Function(Rc<dyn AnyFunction>),
    ClearCaches,
}

/// A set of cache entries to drop at the next run boundary.
///
/// Obtain leaves from [`MemoCell::invalidate`](crate::MemoCell::invalidate)
/// and [`Memo::invalidate_cache`](crate::Memo::invalidate_cache), or clear
/// everything with [`Invalidation::clear_caches`].
#[derive(Default)]
pub struct Invalidation {
    pub(crate) leaves: Vec<Leaf>,
}

impl Invalidation {
    /// The no-op invalidation.
    pub fn empty() -> Self {
        Invalidation::default()
    }

    /// Drop every cell's cached result and reset the cycle detector.
    pub fn clear_caches() -> Self {
        Invalidation {
            leaves: vec![Leaf::ClearCaches],
        }
    }

    /// The union of two invalidations.
    pub fn combine(mut self, other: Invalidation) -> Self {
        self.leaves.extend(other.leaves);
        self
    }

    /// True for [`Invalidation::empty`] and unions of empties.
    pub fn is_empty(&self) -> bool {
        self.leaves.is_empty()
    }

    pub(crate) fn cell(cell: Rc<dyn AnyCell>) -> Self {
        Invalidation {
            leaves: vec![Leaf::Cell(cell)],
        }
    }

    pub(crate) fn function(function: Rc<dyn AnyFunction>) -> Self {
        Invalidation {
            leaves: vec![Leaf::Function(function)],
        }
    }
}
