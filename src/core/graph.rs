//! Task graph and its scheduling algorithms.
//!
//! `TaskGraph` is plain serialisable data: nodes, edges and the fields derived
//! from them (parallel groups, total work, critical path). The algorithms here
//! are pure and synchronous. They build a petgraph `DiGraph` view on demand,
//! so a graph whose edges were edited by hand (or loaded from disk) is
//! analysed exactly like one produced by the planner.
//!
//! Edge direction is `from` (prerequisite) → `to` (dependent). Only
//! `depends-on` and `feeds-into` edges constrain ordering; `parallel-with` is
//! informational.
//!
//! Every traversal visits nodes in insertion order and neighbours in edge
//! insertion order, so results are reproducible.

use crate::core::task::{TaskId, TaskNode, TaskStatus};
use petgraph::algo::is_cyclic_directed;
use petgraph::graph::{DiGraph, NodeIndex};
use petgraph::visit::EdgeRef;
use petgraph::Direction;
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet, VecDeque};

/// Relationship carried by an edge.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum EdgeKind {
    /// `to` cannot start before `from` completes.
    #[default]
    DependsOn,
    /// `from` produces output that `to` consumes.
    FeedsInto,
    /// Informational: the two tasks may run side by side.
    ParallelWith,
}

impl EdgeKind {
    /// Whether the edge constrains execution order.
    pub fn is_ordering(&self) -> bool {
        matches!(self, EdgeKind::DependsOn | EdgeKind::FeedsInto)
    }
}

impl std::fmt::Display for EdgeKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            EdgeKind::DependsOn => write!(f, "depends-on"),
            EdgeKind::FeedsInto => write!(f, "feeds-into"),
            EdgeKind::ParallelWith => write!(f, "parallel-with"),
        }
    }
}

/// A directed edge between two tasks.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaskEdge {
    pub from: TaskId,
    pub to: TaskId,
    pub kind: EdgeKind,
}

impl TaskEdge {
    pub fn new(from: TaskId, to: TaskId, kind: EdgeKind) -> Self {
        Self { from, to, kind }
    }

    pub fn depends_on(from: TaskId, to: TaskId) -> Self {
        Self::new(from, to, EdgeKind::DependsOn)
    }
}

/// The task dependency graph for one build.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct TaskGraph {
    pub nodes: Vec<TaskNode>,
    pub edges: Vec<TaskEdge>,
    /// Sets of tasks with no edges at all; safe to dispatch together.
    pub parallel_groups: Vec<Vec<TaskId>>,
    pub estimated_total_work: u64,
    pub critical_path: Vec<TaskId>,
    /// Replans applied to this graph so far.
    #[serde(default)]
    pub replan_count: u32,
}

/// petgraph view over a `TaskGraph`.
///
/// Node `i` of the petgraph is `graph.nodes[i]`. Dangling edges are skipped.
struct GraphIndex {
    graph: DiGraph<TaskId, EdgeKind>,
    index: HashMap<TaskId, NodeIndex>,
}

impl GraphIndex {
    fn build(tasks: &TaskGraph, ordering_only: bool) -> Self {
        let mut graph = DiGraph::with_capacity(tasks.nodes.len(), tasks.edges.len());
        let mut index = HashMap::with_capacity(tasks.nodes.len());
        for node in &tasks.nodes {
            let ix = graph.add_node(node.id);
            index.entry(node.id).or_insert(ix);
        }
        for edge in &tasks.edges {
            if ordering_only && !edge.kind.is_ordering() {
                continue;
            }
            if let (Some(&from), Some(&to)) = (index.get(&edge.from), index.get(&edge.to)) {
                graph.add_edge(from, to, edge.kind);
            }
        }
        Self { graph, index }
    }

    /// Neighbours in edge insertion order.
    ///
    /// petgraph walks adjacency lists newest-first, so sort by edge index.
    fn neighbors(&self, ix: NodeIndex, dir: Direction) -> Vec<NodeIndex> {
        let mut edges: Vec<(usize, NodeIndex)> = self
            .graph
            .edges_directed(ix, dir)
            .map(|e| {
                let other = match dir {
                    Direction::Outgoing => e.target(),
                    Direction::Incoming => e.source(),
                };
                (e.id().index(), other)
            })
            .collect();
        edges.sort_by_key(|(id, _)| *id);
        edges.into_iter().map(|(_, n)| n).collect()
    }

    fn successors(&self, ix: NodeIndex) -> Vec<NodeIndex> {
        self.neighbors(ix, Direction::Outgoing)
    }

    fn predecessors(&self, ix: NodeIndex) -> Vec<NodeIndex> {
        self.neighbors(ix, Direction::Incoming)
    }

    fn id(&self, ix: NodeIndex) -> TaskId {
        self.graph[ix]
    }

    /// Kahn's algorithm over node indices. Nodes on a cycle are left out.
    fn kahn(&self) -> Vec<NodeIndex> {
        let mut in_degree: Vec<usize> = self
            .graph
            .node_indices()
            .map(|ix| self.graph.edges_directed(ix, Direction::Incoming).count())
            .collect();

        let mut queue: VecDeque<NodeIndex> = self
            .graph
            .node_indices()
            .filter(|ix| in_degree[ix.index()] == 0)
            .collect();

        let mut order = Vec::with_capacity(self.graph.node_count());
        while let Some(ix) = queue.pop_front() {
            order.push(ix);
            for next in self.successors(ix) {
                in_degree[next.index()] -= 1;
                if in_degree[next.index()] == 0 {
                    queue.push_back(next);
                }
            }
        }
        order
    }
}

impl TaskGraph {
    /// Create an empty graph.
    pub fn new() -> Self {
        Self::default()
    }

    /// Build a graph from nodes, deriving edges and every derived field.
    pub fn from_nodes(nodes: Vec<TaskNode>) -> Self {
        let mut graph = Self {
            nodes,
            ..Self::default()
        };
        graph.recompute();
        graph
    }

    pub fn task_count(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    pub fn contains_task(&self, id: &TaskId) -> bool {
        self.nodes.iter().any(|n| n.id == *id)
    }

    pub fn get_task(&self, id: &TaskId) -> Option<&TaskNode> {
        self.nodes.iter().find(|n| n.id == *id)
    }

    pub(crate) fn get_task_mut(&mut self, id: &TaskId) -> Option<&mut TaskNode> {
        self.nodes.iter_mut().find(|n| n.id == *id)
    }

    /// Look a task up by name (first match).
    pub fn find_by_name(&self, name: &str) -> Option<&TaskNode> {
        self.nodes.iter().find(|n| n.name == name)
    }

    /// Nodes that still take part in scheduling (not replaced by a split).
    pub fn active_nodes(&self) -> impl Iterator<Item = &TaskNode> {
        self.nodes.iter().filter(|n| !n.is_superseded())
    }

    /// Rebuild edges from the nodes, then every derived field.
    pub fn recompute(&mut self) {
        self.derive_edges();
        self.refresh_derived();
    }

    /// Recompute parallel groups, total work and critical path from the
    /// current nodes and edges, leaving the edges untouched.
    pub fn refresh_derived(&mut self) {
        self.parallel_groups = self.compute_parallel_groups();
        self.estimated_total_work = self.active_nodes().map(|n| n.estimated_work_units).sum();
        self.critical_path = self.compute_critical_path();
    }

    /// Derive edges from priorities and declared dependencies.
    ///
    /// Active nodes are sorted by descending priority (stable, so ties keep
    /// insertion order) and chained `sorted[i] → sorted[i+1]`. Declared
    /// dependencies not already covered by the chain are added as
    /// `depends-on` edges, even when they point at unknown ids, so that
    /// validation reports them.
    fn derive_edges(&mut self) {
        let mut sorted: Vec<&TaskNode> = self.active_nodes().collect();
        sorted.sort_by(|a, b| b.priority.cmp(&a.priority));

        let mut edges: Vec<TaskEdge> = sorted
            .windows(2)
            .map(|pair| TaskEdge::depends_on(pair[0].id, pair[1].id))
            .collect();

        let mut seen: HashSet<(TaskId, TaskId)> = edges.iter().map(|e| (e.from, e.to)).collect();
        for node in self.active_nodes() {
            for dep in &node.dependencies {
                if seen.insert((*dep, node.id)) {
                    edges.push(TaskEdge::depends_on(*dep, node.id));
                }
            }
        }
        self.edges = edges;
    }

    /// Edges whose endpoints do not both resolve to nodes.
    pub fn dangling_edges(&self) -> Vec<&TaskEdge> {
        let ids: HashSet<TaskId> = self.nodes.iter().map(|n| n.id).collect();
        self.edges
            .iter()
            .filter(|e| !ids.contains(&e.from) || !ids.contains(&e.to))
            .collect()
    }

    /// Find dependency cycles.
    ///
    /// Depth-first search with an explicit on-stack marker. Every back-edge
    /// into a node still on the stack reports one cycle: the current path
    /// from that node onwards, closed by the node itself (`[A, B, C, A]`).
    pub fn detect_cycles(&self) -> Vec<Vec<TaskId>> {
        let index = GraphIndex::build(self, true);
        if !is_cyclic_directed(&index.graph) {
            return Vec::new();
        }

        const UNVISITED: u8 = 0;
        const ON_STACK: u8 = 1;
        const DONE: u8 = 2;

        let mut state = vec![UNVISITED; index.graph.node_count()];
        let mut cycles = Vec::new();

        for start in index.graph.node_indices() {
            if state[start.index()] != UNVISITED {
                continue;
            }

            let mut path: Vec<NodeIndex> = vec![start];
            let mut stack: Vec<(NodeIndex, Vec<NodeIndex>, usize)> =
                vec![(start, index.successors(start), 0)];
            state[start.index()] = ON_STACK;

            while let Some((node, succs, pos)) = stack.last_mut() {
                if *pos < succs.len() {
                    let next = succs[*pos];
                    *pos += 1;
                    match state[next.index()] {
                        UNVISITED => {
                            state[next.index()] = ON_STACK;
                            path.push(next);
                            stack.push((next, index.successors(next), 0));
                        }
                        ON_STACK => {
                            if let Some(at) = path.iter().position(|&p| p == next) {
                                let mut cycle: Vec<TaskId> =
                                    path[at..].iter().map(|&ix| index.id(ix)).collect();
                                cycle.push(index.id(next));
                                cycles.push(cycle);
                            }
                        }
                        _ => {}
                    }
                } else {
                    state[node.index()] = DONE;
                    path.pop();
                    stack.pop();
                }
            }
        }

        cycles
    }

    /// Check whether the ordering edges form a DAG.
    pub fn is_acyclic(&self) -> bool {
        !is_cyclic_directed(&GraphIndex::build(self, true).graph)
    }

    /// Tasks ready to execute.
    ///
    /// A task is ready if it is pending and every task with an ordering edge
    /// into it has completed.
    pub fn ready_tasks(&self) -> Vec<&TaskNode> {
        let index = GraphIndex::build(self, true);
        self.nodes
            .iter()
            .enumerate()
            .filter(|(_, node)| node.status == TaskStatus::Pending)
            .filter(|(i, _)| {
                index
                    .predecessors(NodeIndex::new(*i))
                    .into_iter()
                    .all(|p| self.nodes[p.index()].is_completed())
            })
            .map(|(_, node)| node)
            .collect()
    }

    /// Topological execution order (Kahn's algorithm).
    ///
    /// Ties between simultaneously ready tasks resolve by insertion order.
    /// Tasks caught in a cycle are omitted.
    pub fn execution_order(&self) -> Vec<TaskId> {
        let index = GraphIndex::build(self, true);
        index.kahn().into_iter().map(|ix| index.id(ix)).collect()
    }

    /// Group tasks into waves that can run concurrently.
    ///
    /// Wave `n + 1` holds the tasks whose last prerequisite sits in wave `n`.
    pub fn execution_waves(&self) -> Vec<Vec<TaskId>> {
        let index = GraphIndex::build(self, true);
        let mut in_degree: Vec<usize> = index
            .graph
            .node_indices()
            .map(|ix| index.predecessors(ix).len())
            .collect();

        let mut wave: Vec<NodeIndex> = index
            .graph
            .node_indices()
            .filter(|ix| in_degree[ix.index()] == 0)
            .collect();

        let mut waves = Vec::new();
        while !wave.is_empty() {
            let mut next = Vec::new();
            for &ix in &wave {
                for succ in index.successors(ix) {
                    in_degree[succ.index()] -= 1;
                    if in_degree[succ.index()] == 0 {
                        next.push(succ);
                    }
                }
            }
            next.sort();
            waves.push(wave.iter().map(|&ix| index.id(ix)).collect());
            wave = next;
        }
        waves
    }

    /// Active tasks with neither incoming nor outgoing edges of any kind.
    ///
    /// Returns at most one group; empty when every task is connected.
    pub fn compute_parallel_groups(&self) -> Vec<Vec<TaskId>> {
        let index = GraphIndex::build(self, false);
        let isolated: Vec<TaskId> = self
            .nodes
            .iter()
            .enumerate()
            .filter(|(_, node)| !node.is_superseded())
            .filter(|(i, _)| {
                let ix = NodeIndex::new(*i);
                index.graph.edges_directed(ix, Direction::Incoming).next().is_none()
                    && index.graph.edges_directed(ix, Direction::Outgoing).next().is_none()
            })
            .map(|(_, node)| node.id)
            .collect();

        if isolated.is_empty() {
            Vec::new()
        } else {
            vec![isolated]
        }
    }

    /// Highest-work path through the ordering edges.
    ///
    /// Longest-path relaxation over the topological order, weighting each
    /// node by its estimated work. The end node is the first (in topological
    /// order) to reach the maximum distance; backtracking takes, at each
    /// step, the earliest incoming edge whose source attains the distance
    /// required to reach the current node.
    pub fn compute_critical_path(&self) -> Vec<TaskId> {
        let index = GraphIndex::build(self, true);
        let order = index.kahn();
        let weight = |ix: NodeIndex| {
            let node = &self.nodes[ix.index()];
            if node.is_superseded() {
                0
            } else {
                node.estimated_work_units
            }
        };

        let mut dist: Vec<Option<u64>> = vec![None; index.graph.node_count()];
        for &ix in &order {
            let best_pred = index
                .predecessors(ix)
                .into_iter()
                .filter_map(|p| dist[p.index()])
                .max()
                .unwrap_or(0);
            dist[ix.index()] = Some(best_pred + weight(ix));
        }

        let mut end: Option<(NodeIndex, u64)> = None;
        for &ix in &order {
            if self.nodes[ix.index()].is_superseded() {
                continue;
            }
            if let Some(d) = dist[ix.index()] {
                if end.map_or(true, |(_, best)| d > best) {
                    end = Some((ix, d));
                }
            }
        }

        let Some((mut current, _)) = end else {
            return Vec::new();
        };

        let mut path = vec![index.id(current)];
        while let Some(cur_dist) = dist[current.index()] {
            let needed = cur_dist - weight(current);
            let prev = index
                .predecessors(current)
                .into_iter()
                .find(|p| dist[p.index()] == Some(needed));
            match prev {
                Some(p) => {
                    path.push(index.id(p));
                    current = p;
                }
                None => break,
            }
        }
        path.reverse();
        path
    }

    /// Tasks with an ordering edge into `id`.
    pub fn dependencies_of(&self, id: &TaskId) -> Vec<&TaskNode> {
        let index = GraphIndex::build(self, true);
        match index.index.get(id) {
            Some(&ix) => index
                .predecessors(ix)
                .into_iter()
                .map(|p| &self.nodes[p.index()])
                .collect(),
            None => Vec::new(),
        }
    }

    /// Tasks with an ordering edge out of `id`.
    pub fn dependents_of(&self, id: &TaskId) -> Vec<&TaskNode> {
        let index = GraphIndex::build(self, true);
        match index.index.get(id) {
            Some(&ix) => index
                .successors(ix)
                .into_iter()
                .map(|s| &self.nodes[s.index()])
                .collect(),
            None => Vec::new(),
        }
    }

    /// Check if every active task has completed.
    pub fn all_complete(&self) -> bool {
        self.active_nodes().all(TaskNode::is_completed)
    }

    /// Count of active tasks that have not completed.
    pub fn pending_count(&self) -> usize {
        self.active_nodes().filter(|n| !n.is_completed()).count()
    }
}
