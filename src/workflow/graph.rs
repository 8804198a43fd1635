/// Petgraph-backed task graph store
///
/// Owns task definitions, ordered edges and id allocation. Acyclicity is
/// enforced on every `connect`, so every stored graph is a DAG and the
/// topological order never fails.

use crate::error::GraphError;
use crate::workflow::types::{Edge, LoopEnd, NodeId, ParameterBinding, Payload, Task, TaskKind};
use petgraph::algo::has_path_connecting;
use petgraph::graph::{DiGraph, NodeIndex};
use petgraph::visit::{Dfs, Reversed};
use petgraph::Direction;
use std::cmp::Reverse;
use std::collections::{BTreeMap, BTreeSet, BinaryHeap, HashMap};

/// Directed acyclic graph of tasks
#[derive(Debug, Clone, Default)]
pub struct GraphStore {
    /// Adjacency used for reachability queries; node weights are task ids
    graph: DiGraph<NodeId, ()>,
    /// Task definitions keyed by id, iterated in ascending id order
    tasks: BTreeMap<NodeId, Task>,
    /// Edges in insertion order, carrying the bindings
    edges: Vec<Edge>,
    /// Mapping from node ID to graph node index
    node_id_to_index: HashMap<NodeId, NodeIndex>,
    /// Next id to hand out; wider than `NodeId` so the last id can be loaded
    next_id: u64,
    /// Set once a run starts; structural edits are rejected afterwards
    frozen: bool,
}

impl PartialEq for GraphStore {
    /// Structural equality: tasks, edges and bindings (runtime state is not part of the store)
    fn eq(&self, other: &Self) -> bool {
        self.tasks == other.tasks && self.edges == other.edges
    }
}

impl GraphStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a task in the build phase and return its fresh id
    pub fn add_task(
        &mut self,
        title: impl Into<String>,
        kind: TaskKind,
        config: Payload,
    ) -> Result<NodeId, GraphError> {
        self.ensure_mutable()?;
        let id = u32::try_from(self.next_id.max(1))
            .map(NodeId)
            .map_err(|_| GraphError::IdsExhausted)?;
        self.insert_task(Task::new(id, title, kind, config));
        Ok(id)
    }

    /// Insert a fully formed task, keeping its id (used when loading specs)
    pub(crate) fn insert_task(&mut self, task: Task) {
        let id = task.id;
        let index = self.graph.add_node(id);
        self.node_id_to_index.insert(id, index);
        self.tasks.insert(id, task);
        self.next_id = self.next_id.max(u64::from(id.0) + 1);
        tracing::debug!("  ➕ Added task {} (type: {})", id, self.tasks[&id].kind.name());
    }

    /// Connect `source` to `target`, rejecting unknown ids and cycles
    ///
    /// The graph is left unchanged when an error is returned.
    pub fn connect(
        &mut self,
        source: NodeId,
        target: NodeId,
        binding: ParameterBinding,
    ) -> Result<(), GraphError> {
        self.ensure_mutable()?;
        let from_index = self.index(source)?;
        let to_index = self.index(target)?;

        // A path target -> source means target is an ancestor of source
        if source == target || has_path_connecting(&self.graph, to_index, from_index, None) {
            tracing::warn!("🔁 Rejected edge {} → {}: would create a cycle", source, target);
            return Err(GraphError::Cycle { from: source, to: target });
        }

        self.graph.add_edge(from_index, to_index, ());
        self.edges.push(Edge { source, target, binding });
        tracing::debug!("  🔗 Added edge: {} → {}", source, target);
        Ok(())
    }

    pub fn task(&self, id: NodeId) -> Result<&Task, GraphError> {
        self.tasks.get(&id).ok_or(GraphError::UnknownNode(id))
    }

    /// Mutable access to a task definition during the build phase
    pub fn task_mut(&mut self, id: NodeId) -> Result<&mut Task, GraphError> {
        self.ensure_mutable()?;
        self.tasks.get_mut(&id).ok_or(GraphError::UnknownNode(id))
    }

    pub fn contains(&self, id: NodeId) -> bool {
        self.tasks.contains_key(&id)
    }

    /// All tasks in ascending id order
    pub fn tasks(&self) -> impl Iterator<Item = &Task> {
        self.tasks.values()
    }

    pub fn node_ids(&self) -> impl Iterator<Item = NodeId> + '_ {
        self.tasks.keys().copied()
    }

    pub fn len(&self) -> usize {
        self.tasks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tasks.is_empty()
    }

    /// All edges in insertion order
    pub fn edges(&self) -> &[Edge] {
        &self.edges
    }

    /// Edges targeting `id`, in insertion order
    pub fn incoming(&self, id: NodeId) -> impl Iterator<Item = &Edge> {
        self.edges.iter().filter(move |edge| edge.target == id)
    }

    /// Direct predecessors in edge-insertion order, without duplicates
    pub fn predecessors(&self, id: NodeId) -> Vec<NodeId> {
        dedup(self.incoming(id).map(|edge| edge.source))
    }

    /// Direct successors in edge-insertion order, without duplicates
    pub fn successors(&self, id: NodeId) -> Vec<NodeId> {
        dedup(
            self.edges
                .iter()
                .filter(|edge| edge.source == id)
                .map(|edge| edge.target),
        )
    }

    /// First added task without incoming edges
    pub fn root(&self) -> Option<NodeId> {
        self.tasks
            .keys()
            .copied()
            .find(|id| self.graph.neighbors_directed(self.node_id_to_index[id], Direction::Incoming).next().is_none())
    }

    /// All tasks reachable from `id`, excluding `id`
    pub fn descendants(&self, id: NodeId) -> BTreeSet<NodeId> {
        let Some(&start) = self.node_id_to_index.get(&id) else {
            return BTreeSet::new();
        };
        let mut reachable = BTreeSet::new();
        let mut dfs = Dfs::new(&self.graph, start);
        while let Some(index) = dfs.next(&self.graph) {
            if index != start {
                reachable.insert(self.graph[index]);
            }
        }
        reachable
    }

    /// All tasks from which `id` is reachable, excluding `id`
    pub fn ancestors(&self, id: NodeId) -> BTreeSet<NodeId> {
        let Some(&start) = self.node_id_to_index.get(&id) else {
            return BTreeSet::new();
        };
        let reversed = Reversed(&self.graph);
        let mut reachable = BTreeSet::new();
        let mut dfs = Dfs::new(reversed, start);
        while let Some(index) = dfs.next(reversed) {
            if index != start {
                reachable.insert(self.graph[index]);
            }
        }
        reachable
    }

    /// Lazy, deterministic topological order; ties go to the lowest id
    pub fn topological_order(&self) -> TopologicalOrder<'_> {
        TopologicalOrder::new(self)
    }

    pub fn freeze(&mut self) {
        self.frozen = true;
    }

    pub fn is_frozen(&self) -> bool {
        self.frozen
    }

    /// Resolve the loop-end task of a loop
    pub fn loop_end(&self, loop_id: NodeId) -> Result<NodeId, GraphError> {
        let invalid = |reason: String| GraphError::InvalidLoop { node: loop_id, reason };
        let TaskKind::Loop { loop_end, .. } = &self.task(loop_id)?.kind else {
            return Err(invalid("not a loop task".to_string()));
        };

        let end = match loop_end {
            None => return Err(invalid("no loop end task set".to_string())),
            Some(LoopEnd::Node(id)) => *id,
            Some(LoopEnd::Title(title)) => {
                let mut matches = self.tasks.values().filter(|task| &task.title == title);
                match (matches.next(), matches.next()) {
                    (Some(task), None) => task.id,
                    (None, _) => return Err(invalid(format!("no task titled '{title}'"))),
                    (Some(_), Some(_)) => return Err(invalid(format!("task title '{title}' is ambiguous"))),
                }
            }
        };

        if !self.descendants(loop_id).contains(&end) {
            return Err(invalid(format!("loop end {end} is not downstream of the loop")));
        }
        Ok(end)
    }

    /// Tasks strictly after the loop up to and including its loop end
    pub fn loop_body(&self, loop_id: NodeId) -> Result<BTreeSet<NodeId>, GraphError> {
        let end = self.loop_end(loop_id)?;
        let upstream_of_end = self.ancestors(end);
        let mut body: BTreeSet<NodeId> = self
            .descendants(loop_id)
            .into_iter()
            .filter(|id| upstream_of_end.contains(id))
            .collect();
        body.insert(end);
        Ok(body)
    }

    /// Check every loop task resolves to a downstream loop end and that only
    /// the loop end passes results out of a loop body
    pub fn validate(&self) -> Result<(), GraphError> {
        for task in self.tasks.values() {
            if !matches!(task.kind, TaskKind::Loop { .. }) {
                continue;
            }
            let end = self.loop_end(task.id)?;
            let body = self.loop_body(task.id)?;
            for member in body.iter().filter(|member| **member != end) {
                if let Some(outside) = self.successors(*member).into_iter().find(|next| !body.contains(next)) {
                    return Err(GraphError::InvalidLoop {
                        node: task.id,
                        reason: format!("task {member} inside the loop feeds task {outside} outside it"),
                    });
                }
            }
        }
        Ok(())
    }

    fn index(&self, id: NodeId) -> Result<NodeIndex, GraphError> {
        self.node_id_to_index
            .get(&id)
            .copied()
            .ok_or(GraphError::UnknownNode(id))
    }

    fn ensure_mutable(&self) -> Result<(), GraphError> {
        if self.frozen {
            return Err(GraphError::Frozen);
        }
        Ok(())
    }
}

fn dedup(ids: impl Iterator<Item = NodeId>) -> Vec<NodeId> {
    let mut seen = Vec::new();
    for id in ids {
        if !seen.contains(&id) {
            seen.push(id);
        }
    }
    seen
}

/// One-shot iterator over a graph in dependency order (Kahn's algorithm)
#[derive(Debug)]
pub struct TopologicalOrder<'a> {
    store: &'a GraphStore,
    in_degree: HashMap<NodeId, usize>,
    ready: BinaryHeap<Reverse<NodeId>>,
}

impl<'a> TopologicalOrder<'a> {
    fn new(store: &'a GraphStore) -> Self {
        let mut in_degree: HashMap<NodeId, usize> = store.tasks.keys().map(|id| (*id, 0)).collect();
        for edge in &store.edges {
            *in_degree.entry(edge.target).or_default() += 1;
        }
        let ready = in_degree
            .iter()
            .filter(|(_, degree)| **degree == 0)
            .map(|(id, _)| Reverse(*id))
            .collect();
        Self { store, in_degree, ready }
    }
}

impl Iterator for TopologicalOrder<'_> {
    type Item = NodeId;

    fn next(&mut self) -> Option<NodeId> {
        let Reverse(id) = self.ready.pop()?;
        for edge in self.store.edges.iter().filter(|edge| edge.source == id) {
            if let Some(degree) = self.in_degree.get_mut(&edge.target) {
                *degree -= 1;
                if *degree == 0 {
                    self.ready.push(Reverse(edge.target));
                }
            }
        }
        Some(id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn chain(len: usize) -> (GraphStore, Vec<NodeId>) {
        let mut graph = GraphStore::new();
        let ids: Vec<NodeId> = (0..len)
            .map(|i| graph.add_task(format!("t{i}"), TaskKind::Passthrough, Payload::new()).unwrap())
            .collect();
        for pair in ids.windows(2) {
            graph.connect(pair[0], pair[1], ParameterBinding::all()).unwrap();
        }
        (graph, ids)
    }

    #[test]
    fn ids_are_monotonic_from_one() {
        let (_, ids) = chain(3);
        assert_eq!(ids, vec![NodeId(1), NodeId(2), NodeId(3)]);
    }

    #[test]
    fn reverse_edge_is_rejected_and_graph_unchanged() {
        let (mut graph, ids) = chain(2);
        let before = graph.clone();

        let err = graph.connect(ids[1], ids[0], ParameterBinding::all()).unwrap_err();
        assert_eq!(err, GraphError::Cycle { from: ids[1], to: ids[0] });
        assert_eq!(graph, before);
        assert_eq!(graph.edges().len(), 1);
    }

    #[test]
    fn transitive_cycle_and_self_loop_are_rejected() {
        let (mut graph, ids) = chain(4);
        assert!(matches!(
            graph.connect(ids[3], ids[0], ParameterBinding::all()),
            Err(GraphError::Cycle { .. })
        ));
        assert!(matches!(
            graph.connect(ids[2], ids[2], ParameterBinding::all()),
            Err(GraphError::Cycle { .. })
        ));
    }

    #[test]
    fn unknown_node_is_rejected() {
        let (mut graph, ids) = chain(1);
        assert_eq!(
            graph.connect(ids[0], NodeId(42), ParameterBinding::all()),
            Err(GraphError::UnknownNode(NodeId(42)))
        );
    }

    #[test]
    fn topological_order_breaks_ties_by_id() {
        let mut graph = GraphStore::new();
        let a = graph.add_task("a", TaskKind::Passthrough, Payload::new()).unwrap();
        let b = graph.add_task("b", TaskKind::Passthrough, Payload::new()).unwrap();
        let c = graph.add_task("c", TaskKind::Passthrough, Payload::new()).unwrap();
        let d = graph.add_task("d", TaskKind::Passthrough, Payload::new()).unwrap();
        // d -> a, c -> b: roots are c and d
        graph.connect(d, a, ParameterBinding::all()).unwrap();
        graph.connect(c, b, ParameterBinding::all()).unwrap();

        let first: Vec<NodeId> = graph.topological_order().collect();
        let second: Vec<NodeId> = graph.topological_order().collect();
        assert_eq!(first, vec![c, b, d, a]);
        assert_eq!(first, second);
    }

    #[test]
    fn topological_order_respects_every_edge() {
        let mut graph = GraphStore::new();
        let ids: Vec<NodeId> = (0..6)
            .map(|i| graph.add_task(format!("t{i}"), TaskKind::Passthrough, Payload::new()).unwrap())
            .collect();
        for (s, t) in [(5, 0), (0, 3), (4, 3), (1, 2), (2, 0), (5, 4)] {
            graph.connect(ids[s], ids[t], ParameterBinding::all()).unwrap();
        }

        let order: Vec<NodeId> = graph.topological_order().collect();
        assert_eq!(order.len(), 6);
        let position = |id: NodeId| order.iter().position(|x| *x == id).unwrap();
        for edge in graph.edges() {
            assert!(position(edge.source) < position(edge.target));
        }
    }

    #[test]
    fn root_and_neighbours() {
        let mut graph = GraphStore::new();
        let a = graph.add_task("a", TaskKind::Passthrough, Payload::new()).unwrap();
        let b = graph.add_task("b", TaskKind::Passthrough, Payload::new()).unwrap();
        let c = graph.add_task("c", TaskKind::Passthrough, Payload::new()).unwrap();
        graph.connect(a, c, ParameterBinding::keys(["x"])).unwrap();
        graph.connect(b, c, ParameterBinding::keys(["y"])).unwrap();
        graph.connect(a, c, ParameterBinding::keys(["z"])).unwrap();

        assert_eq!(graph.root(), Some(a));
        assert_eq!(graph.predecessors(c), vec![a, b]);
        assert_eq!(graph.successors(a), vec![c]);
        assert_eq!(graph.incoming(c).count(), 3);
        assert_eq!(graph.ancestors(c), BTreeSet::from([a, b]));
    }

    #[test]
    fn frozen_graph_rejects_edits() {
        let (mut graph, ids) = chain(2);
        graph.freeze();
        assert_eq!(
            graph.add_task("late", TaskKind::Passthrough, Payload::new()),
            Err(GraphError::Frozen)
        );
        assert_eq!(
            graph.connect(ids[0], ids[1], ParameterBinding::all()),
            Err(GraphError::Frozen)
        );
    }

    #[test]
    fn loop_body_spans_loop_to_end() {
        let mut graph = GraphStore::new();
        let provider = graph.add_task("provider", TaskKind::Passthrough, Payload::new()).unwrap();
        let looped = graph
            .add_task("loop", TaskKind::looped_until("items", LoopEnd::Title("collector".into())), Payload::new())
            .unwrap();
        let work = graph.add_task("work", TaskKind::Passthrough, Payload::new()).unwrap();
        let collector = graph.add_task("collector", TaskKind::Passthrough, Payload::new()).unwrap();
        let after = graph.add_task("after", TaskKind::Passthrough, Payload::new()).unwrap();
        graph.connect(provider, looped, ParameterBinding::all()).unwrap();
        graph.connect(looped, work, ParameterBinding::all()).unwrap();
        graph.connect(work, collector, ParameterBinding::all()).unwrap();
        graph.connect(collector, after, ParameterBinding::all()).unwrap();
        graph.connect(provider, work, ParameterBinding::all()).unwrap();

        assert_eq!(graph.loop_end(looped), Ok(collector));
        assert_eq!(graph.loop_body(looped).unwrap(), BTreeSet::from([work, collector]));
        assert!(graph.validate().is_ok());
    }

    #[test]
    fn loop_end_must_be_downstream() {
        let mut graph = GraphStore::new();
        let end = graph.add_task("end", TaskKind::Passthrough, Payload::new()).unwrap();
        let looped = graph
            .add_task("loop", TaskKind::looped_until("items", LoopEnd::Node(end)), Payload::new())
            .unwrap();
        assert!(matches!(graph.validate(), Err(GraphError::InvalidLoop { node, .. }) if node == looped));
    }

    #[test]
    fn only_loop_end_may_leave_loop_body() {
        let mut graph = GraphStore::new();
        let fan_out = graph.add_task("loop", TaskKind::looped("items"), Payload::new()).unwrap();
        let work = graph.add_task("work", TaskKind::Passthrough, Payload::new()).unwrap();
        let end = graph.add_task("end", TaskKind::Passthrough, Payload::new()).unwrap();
        let side = graph.add_task("side", TaskKind::Passthrough, Payload::new()).unwrap();
        graph.connect(fan_out, work, ParameterBinding::all()).unwrap();
        graph.connect(work, end, ParameterBinding::all()).unwrap();
        graph.connect(end, side, ParameterBinding::all()).unwrap();
        if let TaskKind::Loop { loop_end, .. } = &mut graph.task_mut(fan_out).unwrap().kind {
            *loop_end = Some(LoopEnd::Node(end));
        }
        assert!(graph.validate().is_ok());

        graph.connect(work, side, ParameterBinding::all()).unwrap();
        assert!(matches!(
            graph.validate(),
            Err(GraphError::InvalidLoop { node, reason }) if node == fan_out && reason.contains("task 2")
        ));
    }

    #[test]
    fn allocation_stops_at_highest_id() {
        let mut graph = GraphStore::new();
        graph.insert_task(Task::new(NodeId(u32::MAX), "last", TaskKind::Passthrough, Payload::new()));
        assert_eq!(
            graph.add_task("overflow", TaskKind::Passthrough, Payload::new()),
            Err(GraphError::IdsExhausted)
        );
        assert_eq!(graph.len(), 1);
    }
}
