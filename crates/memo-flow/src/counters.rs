//! Per-run performance counters.

use std::cell::Cell;

use serde::{Deserialize, Serialize};
use tangle::Dag;

use crate::cell::CellMeta;
use crate::engine::RunId;
use crate::stack::StackFrame;

/// Observable counters for the current run.
///
/// `restored` counts phase-1 attempts started, `computed` counts body
/// executions; a cell whose restore fails and whose compute is later demanded
/// contributes to both. `traversed_edges` counts dependency edges walked in
/// phase 1 plus calls issued by bodies in phase 2. The `dag_*` figures mirror
/// the cycle-detection graph built this run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PerfReport {
    /// The run the counters describe.
    pub run: RunId,
    /// Cells that started a restore attempt.
    pub restored: u64,
    /// Cells whose body was executed.
    pub computed: u64,
    /// Dependency edges walked across both phases.
    pub traversed_edges: u64,
    /// Nodes added to the cycle-detection graph.
    pub dag_nodes: u64,
    /// Edges added to the cycle-detection graph.
    pub dag_edges: u64,
    /// Constrained order searches performed by the cycle detector.
    pub dag_paths: u64,
}

pub(crate) struct PerfCounters {
    enabled: Cell<bool>,
    restored: Cell<u64>,
    computed: Cell<u64>,
    traversed: Cell<u64>,
    /// Distinct cells that started either phase this run.
    touched: Cell<u64>,
    /// Cells that entered phase 2 after an already-counted restore attempt.
    revisited: Cell<u64>,
    dag_nodes_base: Cell<u64>,
    dag_edges_base: Cell<u64>,
    dag_paths_base: Cell<u64>,
}

impl PerfCounters {
    pub(crate) fn new() -> Self {
        PerfCounters {
            enabled: Cell::new(true),
            restored: Cell::new(0),
            computed: Cell::new(0),
            traversed: Cell::new(0),
            touched: Cell::new(0),
            revisited: Cell::new(0),
            dag_nodes_base: Cell::new(0),
            dag_edges_base: Cell::new(0),
            dag_paths_base: Cell::new(0),
        }
    }

    pub(crate) fn enable(&self, on: bool) {
        self.enabled.set(on);
    }

    pub(crate) fn zero(&self) {
        self.restored.set(0);
        self.computed.set(0);
        self.traversed.set(0);
        self.touched.set(0);
        self.revisited.set(0);
    }

    /// Re-anchor the DAG figures so that the report describes only activity
    /// from this point on.
    pub(crate) fn rebase(&self, dag: &Dag<StackFrame>) {
        self.dag_nodes_base.set(dag.node_count());
        self.dag_edges_base.set(dag.edge_count());
        self.dag_paths_base.set(dag.search_count());
    }

    pub(crate) fn edge_traversed(&self) {
        if self.enabled.get() {
            self.traversed.set(self.traversed.get() + 1);
        }
    }

    fn touch(&self, run: RunId, meta: &CellMeta) {
        if meta.touched.get() == Some(run) {
            self.revisited.set(self.revisited.get() + 1);
        } else {
            meta.touched.set(Some(run));
            self.touched.set(self.touched.get() + 1);
        }
    }

    pub(crate) fn restore_started(&self, run: RunId, meta: &CellMeta) {
        if self.enabled.get() {
            self.restored.set(self.restored.get() + 1);
            self.touch(run, meta);
        }
    }

    pub(crate) fn compute_started(&self, run: RunId, meta: &CellMeta) {
        if self.enabled.get() {
            self.computed.set(self.computed.get() + 1);
            self.touch(run, meta);
        }
    }

    pub(crate) fn report(&self, run: RunId, dag: &Dag<StackFrame>) -> PerfReport {
        PerfReport {
            run,
            restored: self.restored.get(),
            computed: self.computed.get(),
            traversed_edges: self.traversed.get(),
            dag_nodes: dag.node_count() - self.dag_nodes_base.get(),
            dag_edges: dag.edge_count() - self.dag_edges_base.get(),
            dag_paths: dag.search_count() - self.dag_paths_base.get(),
        }
    }

    pub(crate) fn assert_invariants(&self, dag: &Dag<StackFrame>) {
        if !self.enabled.get() {
            return;
        }
        let restored = self.restored.get();
        let computed = self.computed.get();
        let touched = self.touched.get();
        let revisited = self.revisited.get();
        assert_eq!(
            restored + computed,
            touched + revisited,
            "phase starts must equal cells touched plus re-demanded cells"
        );
        let dag_edges = dag.edge_count() - self.dag_edges_base.get();
        assert!(
            self.traversed.get() >= dag_edges,
            "every cycle-detection edge corresponds to a traversed edge"
        );
    }
}
