//! Dependency graph between live tasks.
//!
//! This module provides `DependencyGraph`, a petgraph `DiGraph` whose edges
//! point from a blocking task to the task it blocks. Insertion rejects
//! cycles, and resolution returns exactly the dependents whose last
//! outstanding blocker just finished.

use crate::core::task::{Task, TaskId};
use crate::error::{Error, Result};
use petgraph::graph::{DiGraph, EdgeIndex, NodeIndex};
use petgraph::Direction;
use std::collections::{HashMap, HashSet, VecDeque};

/// Result of registering a dependency edge.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EdgeOutcome {
    /// A new edge was inserted; the blocked task now waits on it.
    Added,
    /// The blocker is already terminal, so nothing was inserted.
    AlreadySatisfied,
    /// The edge was already present.
    Existing,
}

/// The live dependency graph.
///
/// Nodes are task ids, edge weights are insertion sequence numbers so that
/// dependents and blockers can be reported in the order they were linked.
pub struct DependencyGraph {
    /// Edges point from blocking to blocked.
    graph: DiGraph<TaskId, u64>,
    /// Index mapping from TaskId to NodeIndex for fast lookups.
    task_index: HashMap<TaskId, NodeIndex>,
    /// Tasks that have reached a terminal state.
    terminal: HashSet<TaskId>,
    next_seq: u64,
}

impl DependencyGraph {
    /// Create a new empty graph.
    pub fn new() -> Self {
        Self {
            graph: DiGraph::new(),
            task_index: HashMap::new(),
            terminal: HashSet::new(),
            next_seq: 0,
        }
    }

    /// Rebuild the graph from store records.
    ///
    /// Terminal tasks are registered as satisfied; every outstanding
    /// dependency of a live task becomes an edge.
    ///
    /// # Errors
    /// Returns `CyclicDependency` if the stored dependency sets form a cycle.
    pub fn from_tasks(tasks: &[Task]) -> Result<Self> {
        let mut graph = Self::new();
        for task in tasks {
            graph.add_task(task.id);
            if task.is_finished() {
                graph.mark_terminal(task.id);
            }
        }
        for task in tasks.iter().filter(|t| !t.is_finished()) {
            for dep in &task.dependencies {
                graph.add_dependency(task.id, *dep)?;
            }
        }
        Ok(graph)
    }

    /// Register a task. Adding an existing id returns its current index.
    pub fn add_task(&mut self, id: TaskId) -> NodeIndex {
        if let Some(&index) = self.task_index.get(&id) {
            return index;
        }
        let index = self.graph.add_node(id);
        self.task_index.insert(id, index);
        index
    }

    /// Mark a task terminal without touching its edges.
    pub fn mark_terminal(&mut self, id: TaskId) {
        self.add_task(id);
        self.terminal.insert(id);
    }

    pub fn is_terminal(&self, id: TaskId) -> bool {
        self.terminal.contains(&id)
    }

    pub fn contains(&self, id: TaskId) -> bool {
        self.task_index.contains_key(&id)
    }

    /// Record that `blocked` must wait for `blocking`.
    ///
    /// Unknown ids are registered on the fly.
    ///
    /// # Errors
    /// Returns `CyclicDependency` listing the cycle's ids in order if the new
    /// edge would close a cycle (including a self-edge). The graph is left
    /// unchanged in that case.
    pub fn add_dependency(&mut self, blocked: TaskId, blocking: TaskId) -> Result<EdgeOutcome> {
        if blocked == blocking {
            return Err(Error::CyclicDependency {
                cycle: vec![blocked, blocked],
            });
        }
        if self.terminal.contains(&blocking) {
            return Ok(EdgeOutcome::AlreadySatisfied);
        }

        let from = self.add_task(blocking);
        let to = self.add_task(blocked);
        if self.graph.find_edge(from, to).is_some() {
            return Ok(EdgeOutcome::Existing);
        }

        // A path blocked -> ... -> blocking plus the new edge closes a cycle.
        if let Some(path) = self.path_between(to, from) {
            let mut cycle: Vec<TaskId> = path.into_iter().map(|n| self.graph[n]).collect();
            cycle.push(blocked);
            return Err(Error::CyclicDependency { cycle });
        }

        let seq = self.next_seq;
        self.next_seq += 1;
        self.graph.add_edge(from, to, seq);
        Ok(EdgeOutcome::Added)
    }

    /// Insert a batch of `(blocked, blocking)` edges atomically.
    ///
    /// If any edge is rejected, edges added earlier in the batch are removed
    /// again and the error is returned, leaving the graph as it was.
    pub fn add_dependencies(&mut self, edges: &[(TaskId, TaskId)]) -> Result<Vec<EdgeOutcome>> {
        let mut outcomes = Vec::with_capacity(edges.len());
        for &(blocked, blocking) in edges {
            match self.add_dependency(blocked, blocking) {
                Ok(outcome) => outcomes.push(outcome),
                Err(e) => {
                    for (&(b, k), outcome) in edges.iter().zip(&outcomes) {
                        if *outcome == EdgeOutcome::Added {
                            self.remove_dependency(b, k);
                        }
                    }
                    return Err(e);
                }
            }
        }
        Ok(outcomes)
    }

    /// Drop the edge `blocking -> blocked` if present.
    pub fn remove_dependency(&mut self, blocked: TaskId, blocking: TaskId) -> bool {
        let (Some(&from), Some(&to)) = (self.task_index.get(&blocking), self.task_index.get(&blocked))
        else {
            return false;
        };
        match self.graph.find_edge(from, to) {
            Some(edge) => {
                self.graph.remove_edge(edge);
                true
            }
            None => false,
        }
    }

    /// Mark `finished` terminal, drop its outgoing edges and return the
    /// dependents that are now fully unblocked, in link order.
    ///
    /// A dependent with any other outstanding blocker is not returned.
    pub fn resolve(&mut self, finished: TaskId) -> Vec<TaskId> {
        self.terminal.insert(finished);
        let Some(&index) = self.task_index.get(&finished) else {
            return Vec::new();
        };

        let mut edges: Vec<(u64, EdgeIndex, NodeIndex)> = self
            .graph
            .edges_directed(index, Direction::Outgoing)
            .map(|e| {
                use petgraph::visit::EdgeRef;
                (*e.weight(), e.id(), e.target())
            })
            .collect();
        edges.sort_by_key(|(seq, _, _)| *seq);

        // Remove from the highest edge index down so earlier indices stay valid.
        let mut by_index: Vec<EdgeIndex> = edges.iter().map(|(_, e, _)| *e).collect();
        by_index.sort_by_key(|e| std::cmp::Reverse(e.index()));
        let targets: Vec<TaskId> = edges.iter().map(|(_, _, n)| self.graph[*n]).collect();
        for edge in by_index {
            self.graph.remove_edge(edge);
        }

        targets
            .into_iter()
            .filter(|id| !self.terminal.contains(id) && !self.is_blocked(*id))
            .collect()
    }

    /// Tasks currently blocking `id`, in link order.
    pub fn blockers(&self, id: TaskId) -> Vec<TaskId> {
        self.linked(id, Direction::Incoming)
    }

    /// Tasks currently blocked by `id`, in link order.
    pub fn dependents(&self, id: TaskId) -> Vec<TaskId> {
        self.linked(id, Direction::Outgoing)
    }

    /// Number of outstanding blockers for `id`.
    pub fn outstanding(&self, id: TaskId) -> usize {
        self.task_index
            .get(&id)
            .map(|&i| self.graph.edges_directed(i, Direction::Incoming).count())
            .unwrap_or(0)
    }

    pub fn is_blocked(&self, id: TaskId) -> bool {
        self.outstanding(id) > 0
    }

    /// Remove a task and every edge touching it.
    pub fn remove_task(&mut self, id: TaskId) {
        let Some(index) = self.task_index.remove(&id) else {
            return;
        };
        self.terminal.remove(&id);
        // DiGraph::remove_node moves the last node into the freed slot.
        let last = NodeIndex::new(self.graph.node_count() - 1);
        self.graph.remove_node(index);
        if index != last {
            if let Some(&moved) = self.graph.node_weight(index) {
                self.task_index.insert(moved, index);
            }
        }
    }

    /// Get the number of registered tasks.
    pub fn task_count(&self) -> usize {
        self.graph.node_count()
    }

    /// Get the number of live edges.
    pub fn dependency_count(&self) -> usize {
        self.graph.edge_count()
    }

    fn linked(&self, id: TaskId, direction: Direction) -> Vec<TaskId> {
        use petgraph::visit::EdgeRef;
        let Some(&index) = self.task_index.get(&id) else {
            return Vec::new();
        };
        let mut linked: Vec<(u64, TaskId)> = self
            .graph
            .edges_directed(index, direction)
            .map(|e| {
                let other = match direction {
                    Direction::Incoming => e.source(),
                    Direction::Outgoing => e.target(),
                };
                (*e.weight(), self.graph[other])
            })
            .collect();
        linked.sort_by_key(|(seq, _)| *seq);
        linked.into_iter().map(|(_, id)| id).collect()
    }

    /// Breadth-first search for a directed path, returning its nodes.
    fn path_between(&self, start: NodeIndex, goal: NodeIndex) -> Option<Vec<NodeIndex>> {
        let mut prev: HashMap<NodeIndex, NodeIndex> = HashMap::new();
        let mut queue = VecDeque::from([start]);
        let mut seen = HashSet::from([start]);
        while let Some(node) = queue.pop_front() {
            if node == goal {
                let mut path = vec![goal];
                let mut cur = goal;
                while let Some(&p) = prev.get(&cur) {
                    path.push(p);
                    cur = p;
                }
                path.reverse();
                return Some(path);
            }
            for next in self.graph.neighbors_directed(node, Direction::Outgoing) {
                if seen.insert(next) {
                    prev.insert(next, node);
                    queue.push_back(next);
                }
            }
        }
        None
    }
}

impl Default for DependencyGraph {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for DependencyGraph {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DependencyGraph")
            .field("tasks", &self.task_count())
            .field("dependencies", &self.dependency_count())
            .field("terminal", &self.terminal.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::state::TaskState;
    use crate::core::task::{NewTask, TreeId};

    fn ids(n: usize) -> Vec<TaskId> {
        (0..n).map(|_| TaskId::new()).collect()
    }

    #[test]
    fn test_add_dependency_and_blockers() {
        let [a, b, c] = ids(3)[..] else { panic!() };
        let mut dag = DependencyGraph::new();
        assert_eq!(dag.add_dependency(a, b).unwrap(), EdgeOutcome::Added);
        assert_eq!(dag.add_dependency(a, c).unwrap(), EdgeOutcome::Added);
        assert_eq!(dag.blockers(a), vec![b, c]);
        assert_eq!(dag.dependents(b), vec![a]);
        assert_eq!(dag.outstanding(a), 2);
        assert!(dag.is_blocked(a));
        assert!(!dag.is_blocked(b));
    }

    #[test]
    fn test_existing_edge_is_noop() {
        let [a, b] = ids(2)[..] else { panic!() };
        let mut dag = DependencyGraph::new();
        dag.add_dependency(a, b).unwrap();
        assert_eq!(dag.add_dependency(a, b).unwrap(), EdgeOutcome::Existing);
        assert_eq!(dag.dependency_count(), 1);
    }

    #[test]
    fn test_self_edge_rejected() {
        let a = TaskId::new();
        let mut dag = DependencyGraph::new();
        let err = dag.add_dependency(a, a).unwrap_err();
        assert!(matches!(err, Error::CyclicDependency { .. }));
        assert_eq!(dag.dependency_count(), 0);
    }

    #[test]
    fn test_cycle_rejected_and_graph_unchanged() {
        let [a, b, c] = ids(3)[..] else { panic!() };
        let mut dag = DependencyGraph::new();
        dag.add_dependency(a, b).unwrap(); // a waits on b
        dag.add_dependency(b, c).unwrap(); // b waits on c
        let err = dag.add_dependency(c, a).unwrap_err(); // c waits on a
        match err {
            Error::CyclicDependency { cycle } => {
                assert_eq!(cycle.first(), cycle.last());
                assert_eq!(cycle.len(), 4);
                assert!(cycle.contains(&a) && cycle.contains(&b) && cycle.contains(&c));
            }
            other => panic!("unexpected error: {other}"),
        }
        assert_eq!(dag.dependency_count(), 2);
        assert!(!dag.is_blocked(c));
    }

    #[test]
    fn test_mutual_pair_rejected_as_batch() {
        let [a, b] = ids(2)[..] else { panic!() };
        let mut dag = DependencyGraph::new();
        let err = dag.add_dependencies(&[(a, b), (b, a)]).unwrap_err();
        assert!(matches!(err, Error::CyclicDependency { .. }));
        assert_eq!(dag.dependency_count(), 0);
        assert!(!dag.is_blocked(a));
        assert!(!dag.is_blocked(b));
    }

    #[test]
    fn test_batch_keeps_preexisting_edges_on_failure() {
        let [a, b, c] = ids(3)[..] else { panic!() };
        let mut dag = DependencyGraph::new();
        dag.add_dependency(a, b).unwrap();
        assert!(dag.add_dependencies(&[(a, b), (c, a), (b, c)]).is_err());
        assert_eq!(dag.blockers(a), vec![b]);
        assert!(!dag.is_blocked(c));
        assert_eq!(dag.dependency_count(), 1);
    }

    #[test]
    fn test_terminal_blocker_already_satisfied() {
        let [a, b] = ids(2)[..] else { panic!() };
        let mut dag = DependencyGraph::new();
        dag.mark_terminal(b);
        assert_eq!(dag.add_dependency(a, b).unwrap(), EdgeOutcome::AlreadySatisfied);
        assert!(!dag.is_blocked(a));
    }

    #[test]
    fn test_resolve_is_all_or_nothing() {
        let [parent, x, y] = ids(3)[..] else { panic!() };
        let mut dag = DependencyGraph::new();
        dag.add_dependency(parent, x).unwrap();
        dag.add_dependency(parent, y).unwrap();

        assert!(dag.resolve(x).is_empty());
        assert!(dag.is_blocked(parent));
        assert_eq!(dag.resolve(y), vec![parent]);
        assert!(!dag.is_blocked(parent));
    }

    #[test]
    fn test_resolve_returns_dependents_in_link_order() {
        let [blocker, d1, d2, d3] = ids(4)[..] else { panic!() };
        let mut dag = DependencyGraph::new();
        dag.add_dependency(d2, blocker).unwrap();
        dag.add_dependency(d1, blocker).unwrap();
        dag.add_dependency(d3, blocker).unwrap();
        assert_eq!(dag.resolve(blocker), vec![d2, d1, d3]);
        assert_eq!(dag.dependency_count(), 0);
    }

    #[test]
    fn test_resolve_skips_terminal_dependents() {
        let [a, b] = ids(2)[..] else { panic!() };
        let mut dag = DependencyGraph::new();
        dag.add_dependency(a, b).unwrap();
        dag.mark_terminal(a);
        assert!(dag.resolve(b).is_empty());
    }

    #[test]
    fn test_resolve_twice_returns_nothing() {
        let [a, b] = ids(2)[..] else { panic!() };
        let mut dag = DependencyGraph::new();
        dag.add_dependency(a, b).unwrap();
        assert_eq!(dag.resolve(b), vec![a]);
        assert!(dag.resolve(b).is_empty());
    }

    #[test]
    fn test_remove_task_keeps_index_consistent() {
        let [a, b, c] = ids(3)[..] else { panic!() };
        let mut dag = DependencyGraph::new();
        dag.add_dependency(a, b).unwrap();
        dag.add_dependency(c, a).unwrap();
        dag.remove_task(b);
        assert!(!dag.contains(b));
        assert!(!dag.is_blocked(a));
        assert_eq!(dag.blockers(c), vec![a]);
        assert_eq!(dag.dependents(a), vec![c]);
    }

    #[test]
    fn test_from_tasks_rebuilds_edges() {
        let done_spec = NewTask::new("done");
        let done_id = done_spec.id;
        let mut done = Task::from_spec(done_spec, TreeId::from(done_id), 0);
        done.state = TaskState::Completed;

        let live_spec = NewTask::new("live");
        let live_id = live_spec.id;
        let blocker_spec = NewTask::new("blocker");
        let blocker_id = blocker_spec.id;
        let blocker = Task::from_spec(blocker_spec, TreeId::from(blocker_id), 0);
        let mut live = Task::from_spec(live_spec, TreeId::from(live_id), 0);
        live.dependencies = vec![done_id, blocker_id];

        let dag = DependencyGraph::from_tasks(&[done, live, blocker]).unwrap();
        assert_eq!(dag.blockers(live_id), vec![blocker_id]);
        assert!(dag.is_terminal(done_id));
    }
}
