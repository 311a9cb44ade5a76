//! Function descriptors and their cell stores.

use std::cell::RefCell;
use std::future::Future;
use std::rc::{Rc, Weak};

use indexmap::IndexMap;

use crate::cell::{AnyCell, Cached, CellInner, CellMeta, Phase, RunState};
use crate::engine::{read_cell, Ctx, EngineInner};
use crate::error::Errors;
use crate::invalidate::Invalidation;
use crate::key::Key;
use crate::stack::StackFrame;
use crate::task::{BoxFuture, Task};

/// Trait for memo outputs. Results are cloned out of the cache on every read.
pub trait Value: Clone + 'static {}

// Blanket implementation for all types that satisfy the bounds
impl<T> Value for T where T: Clone + 'static {}

/// An output-equality predicate: when it holds between the old and the new
/// output, dependents keep their recorded edges.
pub type Cutoff<O> = Box<dyn Fn(&O, &O) -> bool>;

/// An output-equality cutoff built from `PartialEq`.
///
/// When a recomputation produces an equal output, dependents keep their
/// recorded edges and are not recomputed.
pub fn cutoff_eq<O: PartialEq>() -> Option<Cutoff<O>> {
    Some(Box::new(|old, new| old == new))
}

pub(crate) type BodyFn<I, O> = dyn Fn(Ctx, I) -> BoxFuture<Result<O, Errors>>;

pub(crate) struct MemoInner<I, O> {
    pub(crate) engine: Weak<EngineInner>,
    pub(crate) name: Rc<str>,
    pub(crate) index: u32,
    pub(crate) internal: bool,
    pub(crate) cutoff: Option<Cutoff<O>>,
    pub(crate) body: RefCell<Option<Rc<BodyFn<I, O>>>>,
    pub(crate) cells: RefCell<IndexMap<I, Rc<CellInner<I, O>>, ahash::RandomState>>,
}

impl<I: Key, O: Value> MemoInner<I, O> {
    /// Intern the cell for `input`: create it on first use, return the
    /// existing one otherwise. The name+input to cell mapping is injective.
    pub(crate) fn intern(this: &Rc<Self>, input: I) -> Rc<CellInner<I, O>> {
        if let Some(cell) = this.cells.borrow().get(&input) {
            return cell.clone();
        }
        let engine = this
            .engine
            .upgrade()
            .expect("engine dropped while function still in use");
        let id = engine.alloc_cell_id();
        let name = if this.internal {
            None
        } else {
            Some(this.name.clone())
        };
        let frame = StackFrame::new(
            name,
            Rc::from(format!("{input:?}")),
            this.index,
            Rc::new(input.clone()),
            id,
        );
        let cell = Rc::new(CellInner {
            meta: CellMeta::new(frame),
            input: input.clone(),
            cached: RefCell::new(Cached::Unevaluated),
            state: RefCell::new(RunState {
                run: engine.run_id(),
                phase: Phase::Idle,
            }),
            memo: Rc::downgrade(this),
        });
        this.cells.borrow_mut().insert(input, cell.clone());
        cell
    }
}

/// Erased per-function operations used by invalidation.
pub(crate) trait AnyFunction {
    fn invalidate_all(&self);
    fn clear_cells(&self);
}

impl<I: Key, O: Value> AnyFunction for MemoInner<I, O> {
    fn invalidate_all(&self) {
        for cell in self.cells.borrow().values() {
            cell.meta.last_validated.set(None);
        }
    }

    fn clear_cells(&self) {
        for cell in self.cells.borrow().values() {
            cell.clear();
        }
    }
}

/// A registered memoized function: a name, an input type, a computation body
/// and an optional output cutoff.
///
/// Create one with [`Engine::create`](crate::Engine::create), or with
/// [`Engine::declare`](crate::Engine::declare) followed by [`Memo::set_body`]
/// when the body needs to capture the handle itself:
///
/// ```
/// use memo_flow::{Engine, Memo};
///
/// let engine = Engine::new();
/// let count_down: Memo<u32, u32> = engine.declare("count_down", None);
/// let handle = count_down.clone();
/// count_down.set_body(move |ctx, n| {
///     let handle = handle.clone();
///     async move {
///         if n == 0 {
///             Ok(0)
///         } else {
///             Ok(ctx.exec(&handle, n - 1).await? + 1)
///         }
///     }
/// });
/// ```
pub struct Memo<I: Key, O: Value> {
    pub(crate) inner: Rc<MemoInner<I, O>>,
}

impl<I: Key, O: Value> Clone for Memo<I, O> {
    fn clone(&self) -> Self {
        Memo {
            inner: self.inner.clone(),
        }
    }
}

impl<I: Key, O: Value> Memo<I, O> {
    /// The function's name.
    pub fn name(&self) -> &str {
        &self.inner.name
    }

    pub(crate) fn index(&self) -> u32 {
        self.inner.index
    }

    /// Install (or replace) the computation body.
    pub fn set_body<F, Fut>(&self, body: F)
    where
        F: Fn(Ctx, I) -> Fut + 'static,
        Fut: Future<Output = Result<O, Errors>> + 'static,
    {
        let wrapped: Rc<BodyFn<I, O>> =
            Rc::new(move |ctx, input| Box::pin(body(ctx, input)) as BoxFuture<_>);
        *self.inner.body.borrow_mut() = Some(wrapped);
    }

    /// The unique cell for `input`, created on first use.
    pub fn cell(&self, input: I) -> MemoCell<I, O> {
        MemoCell {
            inner: MemoInner::intern(&self.inner, input),
        }
    }

    /// The cell for `input`, only if it has ever completed an evaluation.
    pub fn previously_evaluated_cell(&self, input: &I) -> Option<MemoCell<I, O>> {
        let cells = self.inner.cells.borrow();
        let cell = cells.get(input)?;
        if cell.has_result() {
            Some(MemoCell {
                inner: cell.clone(),
            })
        } else {
            None
        }
    }

    /// The dependencies recorded by the last evaluation of `input`, as
    /// `(function name, input rendering)` pairs in recording order. `None`
    /// for engine-internal dependencies' names, and `None` overall if the
    /// cell never completed.
    pub fn get_deps(&self, input: &I) -> Option<Vec<(Option<String>, String)>> {
        let cells = self.inner.cells.borrow();
        let cell = cells.get(input)?;
        if !cell.has_result() {
            return None;
        }
        let deps = cell.meta.deps.borrow();
        Some(
            deps.iter()
                .map(|edge| {
                    let frame = &edge.cell.meta().frame;
                    (
                        frame.name().map(str::to_string),
                        frame.input_repr().to_string(),
                    )
                })
                .collect(),
        )
    }

    /// An [`Invalidation`] that marks every cell of this function.
    pub fn invalidate_cache(&self) -> Invalidation {
        Invalidation::function(self.inner.clone())
    }
}

/// The interned cache entry for one `(function, input)` call.
pub struct MemoCell<I: Key, O: Value> {
    pub(crate) inner: Rc<CellInner<I, O>>,
}

impl<I: Key, O: Value> Clone for MemoCell<I, O> {
    fn clone(&self) -> Self {
        MemoCell {
            inner: self.inner.clone(),
        }
    }
}

impl<I: Key, O: Value> MemoCell<I, O> {
    /// The input this cell is keyed on.
    pub fn input(&self) -> &I {
        &self.inner.input
    }

    /// Read the cell through the regular restore/compute protocol.
    pub fn read(&self, ctx: &Ctx) -> Task<O> {
        Task::new(read_cell(ctx.clone(), self.inner.clone()))
    }

    /// An [`Invalidation`] that marks this one cell.
    pub fn invalidate(&self) -> Invalidation {
        let erased: Rc<dyn AnyCell> = self.inner.clone();
        Invalidation::cell(erased)
    }
}
