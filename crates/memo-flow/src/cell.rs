//! Cell state: the cached node behind each `(function, input)` pair.

use std::cell::{Cell as StdCell, RefCell};
use std::rc::{Rc, Weak};

use crate::engine::{Engine, RunId};
use crate::error::Errors;
use crate::memo::MemoInner;
use crate::stack::{FrameNode, StackFrame};
use crate::task::{BoxFuture, Notify};

/// A recorded dependency edge: which cell, and its `last_changed` run at
/// record time. Order of recording is preserved and duplicates are kept.
#[derive(Clone)]
pub(crate) struct DepEdge {
    pub(crate) cell: Rc<dyn AnyCell>,
    pub(crate) changed_at: RunId,
}

/// The persistent cache of a cell.
pub(crate) enum Cached<O> {
    Unevaluated,
    Value(O),
    Failed(Errors),
}

/// How a cell reached `Finished` this run.
#[derive(Clone, Copy, PartialEq, Eq)]
pub(crate) enum FinishKind {
    /// Phase 1 proved the cached result still valid.
    Restored,
    /// Phase 2 ran the body.
    Computed,
    /// Phase 1 hit a dependency cycle; the persistent cache is untouched.
    RestoreCycle,
}

/// Per-run progress of a cell.
pub(crate) enum Phase<O> {
    /// Untouched this run.
    Idle,
    /// Phase 1 in progress; waiters block on the barrier.
    Restoring(Rc<Notify>),
    /// Restore failed or was ineligible; the compute has not been demanded.
    /// An abandoned cell stays here until a full demand restarts it.
    OutOfDate,
    /// Phase 2 in progress; waiters block on the barrier.
    Computing(Rc<Notify>),
    /// Settled for this run.
    Finished {
        kind: FinishKind,
        result: Result<O, Errors>,
    },
}

pub(crate) struct RunState<O> {
    pub(crate) run: RunId,
    pub(crate) phase: Phase<O>,
}

/// The type-erased part of a cell, shared by the dependency walk.
pub(crate) struct CellMeta {
    pub(crate) frame: StackFrame,
    pub(crate) last_validated: StdCell<Option<RunId>>,
    pub(crate) last_changed: StdCell<Option<RunId>>,
    pub(crate) deps: RefCell<Vec<DepEdge>>,
    /// The cycle-detection node for the tagged run, created at first demand.
    pub(crate) dag_node: StdCell<Option<(RunId, tangle::NodeId)>>,
    /// Run in which this cell was first counted; perf bookkeeping only.
    pub(crate) touched: StdCell<Option<RunId>>,
}

impl CellMeta {
    pub(crate) fn new(frame: StackFrame) -> Self {
        CellMeta {
            frame,
            last_validated: StdCell::new(None),
            last_changed: StdCell::new(None),
            deps: RefCell::new(Vec::new()),
            dag_node: StdCell::new(None),
            touched: StdCell::new(None),
        }
    }
}

/// A cell together with its typed cache.
pub(crate) struct CellInner<I, O> {
    pub(crate) meta: CellMeta,
    pub(crate) input: I,
    pub(crate) cached: RefCell<Cached<O>>,
    pub(crate) state: RefCell<RunState<O>>,
    pub(crate) memo: Weak<MemoInner<I, O>>,
}

impl<I, O> CellInner<I, O> {
    /// Drop everything this cell remembers; it behaves as never evaluated.
    pub(crate) fn clear(&self) {
        *self.cached.borrow_mut() = Cached::Unevaluated;
        self.meta.deps.borrow_mut().clear();
        self.meta.last_validated.set(None);
        self.meta.last_changed.set(None);
    }

    pub(crate) fn has_result(&self) -> bool {
        !matches!(&*self.cached.borrow(), Cached::Unevaluated)
    }
}

/// What a phase-1 walk learns about a dependency.
pub(crate) enum RestoreOutcome {
    /// The dependency is valid this run; its `last_changed` is attached.
    Restored(RunId),
    /// The dependency could not be validated without recomputing.
    OutOfDate,
}

/// Type-erased cell operations used by the restore walk and invalidation.
pub(crate) trait AnyCell {
    fn meta(&self) -> &CellMeta;

    /// Run this cell through phase 1 only, never its compute. `Err` re-raises
    /// a cycle discovered while restoring.
    fn restore_only(
        self: Rc<Self>,
        engine: Engine,
        frames: Option<Rc<FrameNode>>,
    ) -> BoxFuture<Result<RestoreOutcome, Errors>>;

    /// Mark the cell so that its next restore attempt fails.
    fn mark_invalid(&self);
}
