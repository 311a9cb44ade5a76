//! Tracer trait for observing engine execution.
//!
//! All methods have default empty implementations; [`NoopTracer`] uses them
//! all for zero cost when tracing is disabled. Install a tracer with
//! [`Engine::with_tracer`](crate::Engine::with_tracer).

use crate::engine::RunId;
use crate::stack::StackFrame;

/// How a demanded cell was satisfied.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CellOutcome {
    /// Phase 1 proved the cached result valid without running the body.
    Restored,
    /// The body ran; `changed` is false when the cutoff kept the old value.
    Computed {
        /// Whether the output differs from the previous run's output.
        changed: bool,
    },
    /// The body ran and failed; the failure is cached for this run.
    Failed,
}

/// Observer of engine execution.
pub trait Tracer: 'static {
    /// A cell started a phase-1 restore attempt.
    fn on_restore_start(&self, _frame: &StackFrame) {}

    /// A cell settled for the current run.
    fn on_outcome(&self, _frame: &StackFrame, _outcome: CellOutcome) {}

    /// A dependency cycle was detected; `path` lists the frames on it.
    fn on_cycle(&self, _path: &[StackFrame]) {}

    /// The run counter advanced.
    fn on_reset(&self, _run: RunId) {}
}

/// Tracer that discards all events; the default for
/// [`Engine::new`](crate::Engine::new).
pub struct NoopTracer;

impl Tracer for NoopTracer {}
