//! The engine: run controller, execution context and the per-cell
//! restore/compute state machine.
//!
//! Demanding a cell runs it through two phases. Phase 1 (*restore*) walks the
//! dependency edges recorded by the previous evaluation, asking each
//! dependency only to restore itself; if every edge's `last_changed` still
//! matches what was recorded, the cached result is revalidated without
//! running the body. Phase 2 (*compute*) clears the recorded edges and runs
//! the body, re-recording edges as the body issues calls. A restore walk
//! never forces a dependency's compute: a dependency that cannot restore is
//! left out of date until some full demand restarts it.
//!
//! Every cross-cell demand registers an edge in the per-run cycle-detection
//! graph before waiting, so a cycle — even one spanning several cooperating
//! tasks — is reported as an error instead of deadlocking.

use std::cell::{Cell as StdCell, OnceCell, RefCell};
use std::future::Future;
use std::rc::Rc;

use serde::{Deserialize, Serialize};
use tangle::{CyclePath, Dag};

use crate::cell::{
    AnyCell, Cached, CellInner, CellMeta, DepEdge, FinishKind, Phase, RestoreOutcome, RunState,
};
use crate::counters::{PerfCounters, PerfReport};
use crate::error::{CycleError, Error, Errors};
use crate::invalidate::{Invalidation, Leaf};
use crate::key::Key;
use crate::memo::{AnyFunction, Cutoff, Memo, MemoInner, Value};
use crate::stack::{stack_of, FrameNode, StackFrame};
use crate::task::{self, BoxFuture, Notify, Task};
use crate::tracer::{CellOutcome, NoopTracer, Tracer};

/// Identifier of one run: a top-level evaluation window.
///
/// The counter advances on [`Engine::reset`]; consecutive [`Engine::run`]
/// calls without a reset share a run and therefore share every result
/// settled within it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct RunId(pub u64);

pub(crate) struct EngineInner {
    run: StdCell<RunId>,
    next_cell_id: StdCell<u64>,
    next_func_index: StdCell<u32>,
    pub(crate) dag: RefCell<Dag<StackFrame>>,
    functions: RefCell<Vec<Rc<dyn AnyFunction>>>,
    pub(crate) counters: PerfCounters,
    tracer: Box<dyn Tracer>,
    run_cell: OnceCell<Rc<CellInner<(), RunId>>>,
}

impl EngineInner {
    pub(crate) fn run_id(&self) -> RunId {
        self.run.get()
    }

    pub(crate) fn alloc_cell_id(&self) -> u64 {
        let id = self.next_cell_id.get();
        self.next_cell_id.set(id + 1);
        id
    }

    /// The cycle-detection node for `meta` in the current run, created at
    /// first demand. Stale nodes from earlier runs are ignored (invariant:
    /// the graph only mirrors edges of the current run).
    fn dag_node(&self, meta: &CellMeta) -> tangle::NodeId {
        let run = self.run.get();
        match meta.dag_node.get() {
            Some((r, node)) if r == run => node,
            _ => {
                let node = self.dag.borrow_mut().add_node(meta.frame.clone());
                meta.dag_node.set(Some((run, node)));
                node
            }
        }
    }

    fn add_dag_edge(&self, from: tangle::NodeId, to: tangle::NodeId) -> Result<(), CyclePath> {
        self.dag.borrow_mut().add_edge(from, to)
    }

    /// Frames on a rejected edge's cycle, caller first.
    fn cycle_frames(&self, path: &CyclePath) -> Vec<StackFrame> {
        let dag = self.dag.borrow();
        path.nodes().iter().rev().map(|&n| dag.payload(n).clone()).collect()
    }
}

/// The memoization engine: function registry, cell caches, run counter,
/// cycle detector and perf counters in one context value.
///
/// Cheap to clone; all state is shared. The engine is single-threaded: state
/// is only mutated between suspension points of its cooperative tasks.
pub struct Engine {
    pub(crate) inner: Rc<EngineInner>,
}

impl Clone for Engine {
    fn clone(&self) -> Self {
        Engine {
            inner: self.inner.clone(),
        }
    }
}

impl Default for Engine {
    fn default() -> Self {
        Engine::new()
    }
}

impl Engine {
    /// A fresh engine with tracing disabled.
    pub fn new() -> Engine {
        Engine::with_tracer(NoopTracer)
    }

    /// A fresh engine reporting to `tracer`.
    pub fn with_tracer(tracer: impl Tracer) -> Engine {
        let inner = Rc::new(EngineInner {
            run: StdCell::new(RunId(0)),
            next_cell_id: StdCell::new(0),
            next_func_index: StdCell::new(0),
            dag: RefCell::new(Dag::new()),
            functions: RefCell::new(Vec::new()),
            counters: PerfCounters::new(),
            tracer: Box::new(tracer),
            run_cell: OnceCell::new(),
        });
        let engine = Engine { inner };

        // The run counter is itself a cell: anything that reads it records a
        // dependency on it, and reset invalidates it.
        let run_memo: Memo<(), RunId> = engine.declare_inner("run", None, true);
        let weak = Rc::downgrade(&engine.inner);
        run_memo.set_body(move |_ctx, _input: ()| {
            let weak = weak.clone();
            async move {
                let inner = weak.upgrade().expect("engine dropped while running");
                Ok(inner.run_id())
            }
        });
        let cell = MemoInner::intern(&run_memo.inner, ());
        let _ = engine.inner.run_cell.set(cell);
        engine
    }

    /// The thread-local default instance.
    pub fn global() -> Engine {
        thread_local! {
            static GLOBAL: Engine = Engine::new();
        }
        GLOBAL.with(Engine::clone)
    }

    /// Register a function: name, optional output cutoff, computation body.
    pub fn create<I, O, F, Fut>(&self, name: &str, cutoff: Option<Cutoff<O>>, body: F) -> Memo<I, O>
    where
        I: Key,
        O: Value,
        F: Fn(Ctx, I) -> Fut + 'static,
        Fut: Future<Output = Result<O, Errors>> + 'static,
    {
        let memo = self.declare(name, cutoff);
        memo.set_body(body);
        memo
    }

    /// Register a function without a body yet; install it with
    /// [`Memo::set_body`]. The handle can be captured by its own body.
    pub fn declare<I: Key, O: Value>(&self, name: &str, cutoff: Option<Cutoff<O>>) -> Memo<I, O> {
        self.declare_inner(name, cutoff, false)
    }

    fn declare_inner<I: Key, O: Value>(
        &self,
        name: &str,
        cutoff: Option<Cutoff<O>>,
        internal: bool,
    ) -> Memo<I, O> {
        let index = self.inner.next_func_index.get();
        self.inner.next_func_index.set(index + 1);
        let inner = Rc::new(MemoInner {
            engine: Rc::downgrade(&self.inner),
            name: Rc::from(name),
            index,
            internal,
            cutoff,
            body: RefCell::new(None),
            cells: RefCell::new(indexmap::IndexMap::with_hasher(ahash::RandomState::new())),
        });
        let erased: Rc<dyn AnyFunction> = inner.clone();
        self.inner.functions.borrow_mut().push(erased);
        Memo { inner }
    }

    /// Drive a task tree to completion in the current run.
    pub fn run<T, F, Fut>(&self, f: F) -> Result<T, Errors>
    where
        F: FnOnce(Ctx) -> Fut,
        Fut: Future<Output = Result<T, Errors>>,
    {
        task::block_on(f(Ctx::root(self.clone())))
    }

    /// Apply `invalidation`, advance the run counter and reset the cycle
    /// detector. The next [`Engine::run`] executes in the new run.
    pub fn reset(&self, invalidation: Invalidation) {
        for leaf in invalidation.leaves {
            match leaf {
                Leaf::Cell(cell) => cell.mark_invalid(),
                Leaf::Function(function) => function.invalidate_all(),
                Leaf::ClearCaches => {
                    for function in self.inner.functions.borrow().iter() {
                        function.clear_cells();
                    }
                }
            }
        }
        let next = RunId(self.inner.run.get().0 + 1);
        self.inner.run.set(next);
        *self.inner.dag.borrow_mut() = Dag::new();
        self.inner.counters.zero();
        self.inner.counters.rebase(&self.inner.dag.borrow());
        if let Some(cell) = self.inner.run_cell.get() {
            cell.mark_invalid();
        }
        self.inner.tracer.on_reset(next);
    }

    /// The active run id, without recording a dependency. Inside a body use
    /// [`Ctx::current_run`] instead.
    pub fn run_id(&self) -> RunId {
        self.inner.run_id()
    }

    /// Handle to the performance counters.
    pub fn perf(&self) -> Perf {
        Perf {
            inner: self.inner.clone(),
        }
    }

    fn cycle_to_errors(&self, path: &CyclePath, chain: Option<&Rc<FrameNode>>) -> Errors {
        let frames = self.inner.cycle_frames(path);
        self.inner.tracer.on_cycle(&frames);
        Error::cycle(CycleError::new(frames), stack_of(chain)).into()
    }
}

/// Handle to an engine's performance counters.
pub struct Perf {
    inner: Rc<EngineInner>,
}

impl Perf {
    /// Turn counting on or off. Counting is on by default.
    pub fn enable(&self, on: bool) {
        self.inner.counters.enable(on);
    }

    /// Zero the counters; the next report covers activity from here on.
    pub fn reset(&self) {
        self.inner.counters.zero();
        self.inner.counters.rebase(&self.inner.dag.borrow());
    }

    /// The counters accumulated since the run started (or since
    /// [`Perf::reset`]).
    pub fn report_for_current_run(&self) -> PerfReport {
        self.inner
            .counters
            .report(self.inner.run_id(), &self.inner.dag.borrow())
    }

    /// Check the internal counter invariants; panics on violation.
    pub fn assert_invariants(&self) {
        self.inner.counters.assert_invariants(&self.inner.dag.borrow());
    }
}

/// Execution context threaded through computation bodies.
///
/// A `Ctx` identifies the cell being computed (if any), its position in the
/// per-run cycle graph and its chain of active frames. Calls issued through
/// it are recorded as dependencies of that cell, in issue order, duplicates
/// included.
#[derive(Clone)]
pub struct Ctx {
    pub(crate) engine: Engine,
    cell: Option<Rc<dyn AnyCell>>,
    node: Option<tangle::NodeId>,
    frames: Option<Rc<FrameNode>>,
}

impl Ctx {
    fn root(engine: Engine) -> Ctx {
        Ctx {
            engine,
            cell: None,
            node: None,
            frames: None,
        }
    }

    /// The engine this context executes in.
    pub fn engine(&self) -> &Engine {
        &self.engine
    }

    /// Demand `memo(input)`: return the cached result if still valid,
    /// otherwise compute it. Concurrent demands of the same cell share a
    /// single computation.
    pub fn exec<I: Key, O: Value>(&self, memo: &Memo<I, O>, input: I) -> Task<O> {
        let cell = MemoInner::intern(&memo.inner, input);
        Task::new(read_cell(self.clone(), cell))
    }

    /// The active run id, recorded as a dependency of the calling cell.
    pub fn current_run(&self) -> Task<RunId> {
        let cell = self
            .engine
            .inner
            .run_cell
            .get()
            .expect("run cell is created with the engine")
            .clone();
        Task::new(read_cell(self.clone(), cell))
    }

    /// The chain of active frames for this task, innermost first.
    pub fn call_stack(&self) -> Vec<StackFrame> {
        stack_of(self.frames.as_ref())
    }
}

fn roll_state<I, O>(cell: &CellInner<I, O>, run: RunId) {
    let mut st = cell.state.borrow_mut();
    if st.run != run {
        *st = RunState {
            run,
            phase: Phase::Idle,
        };
    }
}

/// Whether phase 1 may be attempted at all: there must be a cached result,
/// the cell must not be marked invalid, and cached failures must be
/// reproducible.
fn restore_eligible<I, O>(cell: &CellInner<I, O>) -> bool {
    if cell.meta.last_validated.get().is_none() {
        return false;
    }
    match &*cell.cached.borrow() {
        Cached::Unevaluated => false,
        Cached::Value(_) => true,
        Cached::Failed(errors) => errors.all_reproducible(),
    }
}

fn cached_result<I, O: Value>(cell: &CellInner<I, O>) -> Result<O, Errors> {
    match &*cell.cached.borrow() {
        Cached::Value(value) => Ok(value.clone()),
        Cached::Failed(errors) => Err(errors.clone()),
        Cached::Unevaluated => unreachable!("restored cell has a cached result"),
    }
}

/// Demand a cell on behalf of `ctx`: register the cycle edge, run the cell
/// through its state machine, and record the dependency on completion.
pub(crate) async fn read_cell<I: Key, O: Value>(
    ctx: Ctx,
    cell: Rc<CellInner<I, O>>,
) -> Result<O, Errors> {
    let engine = ctx.engine.clone();
    if ctx.cell.is_some() {
        engine.inner.counters.edge_traversed();
    }
    let node = engine.inner.dag_node(&cell.meta);
    if let Some(caller) = ctx.node {
        if let Err(path) = engine.inner.add_dag_edge(caller, node) {
            return Err(engine.cycle_to_errors(&path, ctx.frames.as_ref()));
        }
    }

    let result = demand(&ctx, &cell).await;

    if let Some(caller_cell) = &ctx.cell {
        if let Some(changed_at) = cell.meta.last_changed.get() {
            let erased: Rc<dyn AnyCell> = cell.clone();
            caller_cell.meta().deps.borrow_mut().push(DepEdge {
                cell: erased,
                changed_at,
            });
        }
    }
    result
}

enum Action<O> {
    Done(Result<O, Errors>),
    Wait(Rc<Notify>),
    Restore,
    Mark,
    Compute,
}

async fn demand<I: Key, O: Value>(ctx: &Ctx, cell: &Rc<CellInner<I, O>>) -> Result<O, Errors> {
    let engine = ctx.engine.clone();
    loop {
        roll_state(cell, engine.inner.run_id());
        let action = {
            let st = cell.state.borrow();
            match &st.phase {
                Phase::Finished { result, .. } => Action::Done(result.clone()),
                Phase::Restoring(n) | Phase::Computing(n) => Action::Wait(n.clone()),
                Phase::OutOfDate => Action::Compute,
                Phase::Idle => {
                    if restore_eligible(cell) {
                        Action::Restore
                    } else {
                        Action::Mark
                    }
                }
            }
        };
        match action {
            Action::Done(result) => return result,
            Action::Wait(notify) => notify.wait().await,
            Action::Restore => restore_attempt(&engine, cell, ctx.frames.clone()).await,
            Action::Mark => {
                cell.state.borrow_mut().phase = Phase::OutOfDate
            }
            Action::Compute => return compute_cell(ctx, cell).await,
        }
    }
}

/// Phase 1: prove the cached result still valid without running the body.
///
/// Walks the recorded edges in order, asking each dependency to restore. The
/// walk stops at the first edge whose dependency changed or cannot restore;
/// the cell is then left out of date. A cycle discovered while restoring
/// fails the cell for this run without touching its persistent cache.
async fn restore_attempt<I: Key, O: Value>(
    engine: &Engine,
    cell: &Rc<CellInner<I, O>>,
    frames: Option<Rc<FrameNode>>,
) {
    let run = engine.inner.run_id();
    engine.inner.counters.restore_started(run, &cell.meta);
    engine.inner.tracer.on_restore_start(&cell.meta.frame);
    let notify = Notify::new();
    cell.state.borrow_mut().phase = Phase::Restoring(notify.clone());

    let my_node = engine.inner.dag_node(&cell.meta);
    let chain = Some(Rc::new(FrameNode {
        frame: cell.meta.frame.clone(),
        parent: frames,
    }));
    let deps: Vec<DepEdge> = cell.meta.deps.borrow().clone();

    enum Verdict {
        Valid,
        Changed,
        Failed(Errors),
    }
    let mut verdict = Verdict::Valid;
    for edge in deps {
        engine.inner.counters.edge_traversed();
        let dep_node = engine.inner.dag_node(edge.cell.meta());
        if let Err(path) = engine.inner.add_dag_edge(my_node, dep_node) {
            verdict = Verdict::Failed(engine.cycle_to_errors(&path, chain.as_ref()));
            break;
        }
        match edge
            .cell
            .clone()
            .restore_only(engine.clone(), chain.clone())
            .await
        {
            Err(errors) => {
                verdict = Verdict::Failed(errors);
                break;
            }
            Ok(RestoreOutcome::Restored(changed_at)) if changed_at == edge.changed_at => {}
            Ok(_) => {
                verdict = Verdict::Changed;
                break;
            }
        }
    }

    {
        let mut st = cell.state.borrow_mut();
        match verdict {
            Verdict::Valid => {
                cell.meta.last_validated.set(Some(run));
                engine
                    .inner
                    .tracer
                    .on_outcome(&cell.meta.frame, CellOutcome::Restored);
                st.phase = Phase::Finished {
                    kind: FinishKind::Restored,
                    result: cached_result(cell),
                };
            }
            Verdict::Changed => st.phase = Phase::OutOfDate,
            Verdict::Failed(errors) => {
                st.phase = Phase::Finished {
                    kind: FinishKind::RestoreCycle,
                    result: Err(errors),
                };
            }
        }
    }
    notify.notify();
}

/// Phase 2: run the body and cache whatever it produces.
async fn compute_cell<I: Key, O: Value>(
    ctx: &Ctx,
    cell: &Rc<CellInner<I, O>>,
) -> Result<O, Errors> {
    let engine = ctx.engine.clone();
    let run = engine.inner.run_id();
    engine.inner.counters.compute_started(run, &cell.meta);
    let notify = Notify::new();
    cell.state.borrow_mut().phase = Phase::Computing(notify.clone());
    cell.meta.deps.borrow_mut().clear();

    let node = engine.inner.dag_node(&cell.meta);
    let erased: Rc<dyn AnyCell> = cell.clone();
    let child = Ctx {
        engine: engine.clone(),
        cell: Some(erased),
        node: Some(node),
        frames: Some(Rc::new(FrameNode {
            frame: cell.meta.frame.clone(),
            parent: ctx.frames.clone(),
        })),
    };
    let memo = cell
        .memo
        .upgrade()
        .expect("function dropped while its cell is in use");
    let body = memo
        .body
        .borrow()
        .clone()
        .unwrap_or_else(|| panic!("no body installed for function '{}'", memo.name));
    let out = body(child.clone(), cell.input.clone()).await;

    let result = match out {
        Ok(value) => {
            let unchanged = {
                let cached = cell.cached.borrow();
                match (&memo.cutoff, &*cached) {
                    (Some(eq), Cached::Value(old)) => eq(old, &value),
                    _ => false,
                }
            };
            if !unchanged {
                cell.meta.last_changed.set(Some(run));
            }
            engine
                .inner
                .tracer
                .on_outcome(&cell.meta.frame, CellOutcome::Computed { changed: !unchanged });
            *cell.cached.borrow_mut() = Cached::Value(value.clone());
            Ok(value)
        }
        Err(errors) => {
            errors.set_stack_if_empty(&child.call_stack());
            cell.meta.last_changed.set(Some(run));
            engine
                .inner
                .tracer
                .on_outcome(&cell.meta.frame, CellOutcome::Failed);
            *cell.cached.borrow_mut() = Cached::Failed(errors.clone());
            Err(errors)
        }
    };
    cell.meta.last_validated.set(Some(run));
    cell.state.borrow_mut().phase = Phase::Finished {
        kind: FinishKind::Computed,
        result: result.clone(),
    };
    notify.notify();
    result
}

enum RestoreAction {
    Done(RunId),
    OutOfDate,
    Fail(Errors),
    Wait(Rc<Notify>),
    Attempt,
    Mark,
}

impl<I: Key, O: Value> AnyCell for CellInner<I, O> {
    fn meta(&self) -> &CellMeta {
        &self.meta
    }

    fn mark_invalid(&self) {
        self.meta.last_validated.set(None);
    }

    fn restore_only(
        self: Rc<Self>,
        engine: Engine,
        frames: Option<Rc<FrameNode>>,
    ) -> BoxFuture<Result<RestoreOutcome, Errors>> {
        Box::pin(async move {
            loop {
                roll_state(&self, engine.inner.run_id());
                let action = {
                    let st = self.state.borrow();
                    match &st.phase {
                        Phase::Finished {
                            kind: FinishKind::RestoreCycle,
                            result,
                        } => match result {
                            Err(errors) => RestoreAction::Fail(errors.clone()),
                            Ok(_) => unreachable!("a restore cycle always carries errors"),
                        },
                        Phase::Finished { .. } => RestoreAction::Done(
                            self.meta
                                .last_changed
                                .get()
                                .expect("a finished cell has a change run"),
                        ),
                        Phase::OutOfDate => RestoreAction::OutOfDate,
                        Phase::Restoring(n) | Phase::Computing(n) => {
                            RestoreAction::Wait(n.clone())
                        }
                        Phase::Idle => {
                            if restore_eligible(&self) {
                                RestoreAction::Attempt
                            } else {
                                RestoreAction::Mark
                            }
                        }
                    }
                };
                match action {
                    RestoreAction::Done(run) => return Ok(RestoreOutcome::Restored(run)),
                    RestoreAction::OutOfDate => return Ok(RestoreOutcome::OutOfDate),
                    RestoreAction::Fail(errors) => return Err(errors),
                    RestoreAction::Wait(notify) => notify.wait().await,
                    RestoreAction::Attempt => {
                        restore_attempt(&engine, &self, frames.clone()).await
                    }
                    RestoreAction::Mark => {
                        self.state.borrow_mut().phase = Phase::OutOfDate
                    }
                }
            }
        })
    }
}
