use ahash::{HashMap, HashSet};

/// Identifier of a node in a [`Dag`].
///
/// Ids are dense indices handed out by [`Dag::add_node`] and are only
/// meaningful for the graph that created them.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct NodeId(u32);

impl NodeId {
    /// The dense index of this node.
    pub fn index(self) -> usize {
        self.0 as usize
    }
}

/// The path that would close a cycle, as returned by [`Dag::add_edge`].
///
/// For a rejected edge `from -> to`, the path lists the already existing
/// chain `to -> ... -> from`. A self edge yields a single-element path.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CyclePath(Vec<NodeId>);

impl CyclePath {
    /// Nodes on the cycle, starting at the rejected edge's target.
    pub fn nodes(&self) -> &[NodeId] {
        &self.0
    }
}

struct NodeData<T> {
    payload: T,
    /// Position in the maintained topological order. For every accepted edge
    /// `u -> v`, `ord(u) < ord(v)`.
    ord: u32,
    out: Vec<NodeId>,
    inc: Vec<NodeId>,
}

/// An append-only directed graph that stays acyclic.
///
/// A topological order is maintained incrementally: inserting an edge that
/// already respects the order is O(1); otherwise only the region between the
/// endpoints is searched and renumbered (Pearce–Kelly). An edge that would
/// close a cycle is rejected with the offending [`CyclePath`].
///
/// ```
/// use tangle::Dag;
///
/// let mut dag = Dag::new();
/// let a = dag.add_node('a');
/// let b = dag.add_node('b');
/// dag.add_edge(a, b).unwrap();
/// assert!(dag.add_edge(b, a).is_err());
/// ```
pub struct Dag<T> {
    nodes: Vec<NodeData<T>>,
    edges: u64,
    searches: u64,
    visited: u64,
}

impl<T> Default for Dag<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> Dag<T> {
    /// Create an empty graph.
    pub fn new() -> Self {
        Self {
            nodes: Vec::new(),
            edges: 0,
            searches: 0,
            visited: 0,
        }
    }

    /// Add a node carrying `payload` and return its id.
    pub fn add_node(&mut self, payload: T) -> NodeId {
        let id = NodeId(self.nodes.len() as u32);
        self.nodes.push(NodeData {
            payload,
            ord: id.0,
            out: Vec::new(),
            inc: Vec::new(),
        });
        id
    }

    /// The payload attached to `id`.
    pub fn payload(&self, id: NodeId) -> &T {
        &self.nodes[id.index()].payload
    }

    /// Number of nodes added so far.
    pub fn node_count(&self) -> u64 {
        self.nodes.len() as u64
    }

    /// Number of distinct edges inserted so far.
    pub fn edge_count(&self) -> u64 {
        self.edges
    }

    /// Number of constrained searches performed by [`Dag::add_edge`].
    pub fn search_count(&self) -> u64 {
        self.searches
    }

    /// Number of nodes visited across all constrained searches.
    pub fn visit_count(&self) -> u64 {
        self.visited
    }

    /// Whether the edge `from -> to` has already been inserted.
    pub fn has_edge(&self, from: NodeId, to: NodeId) -> bool {
        self.nodes[from.index()].out.contains(&to)
    }

    /// Insert the edge `from -> to`.
    ///
    /// Duplicate edges are accepted and ignored. If the edge would close a
    /// cycle, nothing is inserted and the existing path `to -> ... -> from`
    /// is returned.
    pub fn add_edge(&mut self, from: NodeId, to: NodeId) -> Result<(), CyclePath> {
        if from == to {
            return Err(CyclePath(vec![to]));
        }
        if self.has_edge(from, to) {
            return Ok(());
        }

        let ub = self.nodes[from.index()].ord;
        let lb = self.nodes[to.index()].ord;
        if lb < ub {
            // The order is violated: `to` currently precedes `from`. Search
            // the affected region; either a path back to `from` exists (a
            // cycle) or the region is renumbered.
            self.searches += 1;
            let forward = self.forward_search(from, to, ub)?;
            let backward = self.backward_search(from, lb);
            self.reorder(backward, forward);
        }

        self.nodes[from.index()].out.push(to);
        self.nodes[to.index()].inc.push(from);
        self.edges += 1;
        Ok(())
    }

    /// Nodes reachable from `to` with `ord <= ub`, or the cycle path if
    /// `from` is among them. Since ords strictly increase along existing
    /// edges, any path from `to` to `from` lies entirely within the bound.
    fn forward_search(&mut self, from: NodeId, to: NodeId, ub: u32) -> Result<Vec<NodeId>, CyclePath> {
        let mut found = Vec::new();
        let mut parent: HashMap<NodeId, NodeId> = HashMap::default();
        let mut seen: HashSet<NodeId> = HashSet::default();
        let mut stack = vec![to];
        seen.insert(to);
        while let Some(n) = stack.pop() {
            self.visited += 1;
            if n == from {
                let mut path = vec![from];
                let mut cur = from;
                while cur != to {
                    cur = parent[&cur];
                    path.push(cur);
                }
                path.reverse();
                return Err(CyclePath(path));
            }
            found.push(n);
            for i in 0..self.nodes[n.index()].out.len() {
                let m = self.nodes[n.index()].out[i];
                if self.nodes[m.index()].ord <= ub && seen.insert(m) {
                    parent.insert(m, n);
                    stack.push(m);
                }
            }
        }
        Ok(found)
    }

    /// Nodes that reach `from` with `ord >= lb`.
    fn backward_search(&mut self, from: NodeId, lb: u32) -> Vec<NodeId> {
        let mut found = Vec::new();
        let mut seen: HashSet<NodeId> = HashSet::default();
        let mut stack = vec![from];
        seen.insert(from);
        while let Some(n) = stack.pop() {
            self.visited += 1;
            found.push(n);
            for i in 0..self.nodes[n.index()].inc.len() {
                let m = self.nodes[n.index()].inc[i];
                if self.nodes[m.index()].ord >= lb && seen.insert(m) {
                    stack.push(m);
                }
            }
        }
        found
    }

    /// Renumber the affected region: the backward set keeps its relative
    /// order and moves in front of the forward set, reusing the combined
    /// pool of order values. Nodes outside the region are untouched.
    fn reorder(&mut self, mut backward: Vec<NodeId>, mut forward: Vec<NodeId>) {
        backward.sort_by_key(|n| self.nodes[n.index()].ord);
        forward.sort_by_key(|n| self.nodes[n.index()].ord);

        let mut pool: Vec<u32> = backward
            .iter()
            .chain(forward.iter())
            .map(|n| self.nodes[n.index()].ord)
            .collect();
        pool.sort_unstable();

        for (n, ord) in backward.iter().chain(forward.iter()).zip(pool) {
            self.nodes[n.index()].ord = ord;
        }
    }
}
