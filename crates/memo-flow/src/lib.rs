//! Memo-Flow: an incremental memoization engine.
//!
//! Callers register named functions keyed by their input. The engine runs
//! them on demand inside cooperative tasks, records which other memoized
//! calls each invocation consumed, and on later runs re-executes only those
//! whose transitive inputs changed.
//!
//! # Key Features
//!
//! - **Early cutoff**: a two-phase restore/compute traversal revalidates
//!   cached results by checking recorded dependency edges; an optional output
//!   cutoff stops recomputation from propagating past unchanged values
//! - **Cycle detection**: every cross-cell demand registers an edge in an
//!   incremental cycle-detection graph, so cyclic dependencies fail with the
//!   offending path instead of deadlocking
//! - **Error caching**: failures are cached like values; reproducible errors
//!   survive across runs, non-reproducible ones expire at every run boundary
//! - **Cooperative concurrency**: single-threaded fork/join tasks with
//!   cancellation-free error aggregation; concurrent demands of one cell
//!   share a single computation
//! - **Composable invalidation**: per-cell, per-function and global
//!   clear-caches values, applied at run boundaries
//!
//! # Example
//!
//! ```
//! use memo_flow::{Engine, Memo};
//!
//! let engine = Engine::new();
//! let double: Memo<u32, u32> =
//!     engine.create("double", None, |_ctx, x| async move { Ok(x * 2) });
//!
//! let result = engine
//!     .run(|ctx| async move { ctx.exec(&double, 21).await })
//!     .unwrap();
//! assert_eq!(result, 42);
//! ```
//!
//! Between runs, [`Engine::reset`] applies an [`Invalidation`] and advances
//! the run counter; the next run restores what it can and recomputes the
//! rest.

mod cell;
mod counters;
mod engine;
mod error;
mod invalidate;
mod key;
mod memo;
mod stack;
mod task;
mod tracer;

pub use counters::PerfReport;
pub use engine::{Ctx, Engine, Perf, RunId};
pub use error::{CycleError, Error, Errors, NonReproducible};
pub use invalidate::Invalidation;
pub use key::{DynKey, Key};
pub use memo::{cutoff_eq, Cutoff, Memo, MemoCell, Value};
pub use stack::StackFrame;
pub use task::{collect_errors, fork_and_join, fork_and_join_unit, yield_now, Task};
pub use tracer::{CellOutcome, NoopTracer, Tracer};
