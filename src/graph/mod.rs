//! Dependency graph across resource instances.
//!
//! Nodes are declared instances in declaration order, followed by
//! instances that only exist in state, sorted by address. An edge
//! `consumer -> producer` means the consumer depends on the producer.

use std::cmp::Reverse;
use std::collections::{BTreeSet, BinaryHeap, HashMap};

use tracing::debug;

use crate::config::DesiredState;
use crate::error::GraphError;
use crate::schema::InstanceId;
use crate::state::StateSnapshot;

/// Directed acyclic graph of instances.
#[derive(Debug, Clone, Default)]
pub struct DependencyGraph {
    nodes: Vec<InstanceId>,
    index: HashMap<InstanceId, usize>,
    /// node -> producers it depends on
    dependencies: Vec<BTreeSet<usize>>,
    /// node -> consumers depending on it
    dependents: Vec<BTreeSet<usize>>,
    declared: usize,
}

impl DependencyGraph {
    /// Builds the graph from desired configuration and the applied state.
    ///
    /// # Errors
    ///
    /// Returns `UnknownReference` for a dependency on an undeclared instance
    /// and `Cycle` if the dependencies form a cycle.
    pub fn build(desired: &DesiredState, snapshot: &StateSnapshot) -> Result<Self, GraphError> {
        let mut graph = Self::default();

        for instance in desired.iter() {
            graph.add_node(instance.id.clone());
        }
        graph.declared = graph.nodes.len();

        // BTreeMap iteration is already sorted by address.
        for id in snapshot.instances.keys() {
            if !graph.index.contains_key(id) {
                graph.add_node(id.clone());
            }
        }

        for instance in desired.iter() {
            let from = graph.index[&instance.id];
            for target in instance.dependencies() {
                let Some(&to) = graph.index.get(&target) else {
                    return Err(GraphError::UnknownReference {
                        from: instance.id.to_string(),
                        to: target.to_string(),
                    });
                };
                if !desired.contains(&target) {
                    return Err(GraphError::UnknownReference {
                        from: instance.id.to_string(),
                        to: target.to_string(),
                    });
                }
                graph.add_edge(from, to);
            }
        }

        // State-only instances order their destroys through recorded dependencies.
        for i in graph.declared..graph.nodes.len() {
            let Some(state) = snapshot.get(&graph.nodes[i]) else {
                continue;
            };
            for target in &state.dependencies {
                if let Some(&to) = graph.index.get(target)
                    && to != i
                {
                    graph.add_edge(i, to);
                }
            }
        }

        graph.check_acyclic()?;
        debug!(
            nodes = graph.nodes.len(),
            declared = graph.declared,
            "Dependency graph built"
        );
        Ok(graph)
    }

    fn add_node(&mut self, id: InstanceId) {
        self.index.insert(id.clone(), self.nodes.len());
        self.nodes.push(id);
        self.dependencies.push(BTreeSet::new());
        self.dependents.push(BTreeSet::new());
    }

    fn add_edge(&mut self, from: usize, to: usize) {
        self.dependencies[from].insert(to);
        self.dependents[to].insert(from);
    }

    /// Depth-first search with an explicit recursion stack.
    fn check_acyclic(&self) -> Result<(), GraphError> {
        #[derive(Clone, Copy, PartialEq, Eq)]
        enum Mark {
            New,
            OnStack,
            Done,
        }

        fn visit(
            graph: &DependencyGraph,
            node: usize,
            marks: &mut [Mark],
            stack: &mut Vec<usize>,
        ) -> Result<(), GraphError> {
            marks[node] = Mark::OnStack;
            stack.push(node);
            for &next in &graph.dependencies[node] {
                match marks[next] {
                    Mark::Done => {}
                    Mark::New => visit(graph, next, marks, stack)?,
                    Mark::OnStack => {
                        let start = stack.iter().position(|&n| n == next).unwrap_or(0);
                        let mut path: Vec<String> = stack[start..]
                            .iter()
                            .map(|&n| graph.nodes[n].to_string())
                            .collect();
                        path.push(graph.nodes[next].to_string());
                        return Err(GraphError::Cycle { path });
                    }
                }
            }
            stack.pop();
            marks[node] = Mark::Done;
            Ok(())
        }

        let mut marks = vec![Mark::New; self.nodes.len()];
        let mut stack = Vec::new();
        for node in 0..self.nodes.len() {
            if marks[node] == Mark::New {
                visit(self, node, &mut marks, &mut stack)?;
            }
        }
        Ok(())
    }

    /// Producers-first order; ties broken by node position.
    #[must_use]
    pub fn topological_order(&self) -> Vec<usize> {
        let mut pending: Vec<usize> = self.dependencies.iter().map(BTreeSet::len).collect();
        let mut ready: BinaryHeap<Reverse<usize>> = pending
            .iter()
            .enumerate()
            .filter(|(_, count)| **count == 0)
            .map(|(node, _)| Reverse(node))
            .collect();

        let mut order = Vec::with_capacity(self.nodes.len());
        while let Some(Reverse(node)) = ready.pop() {
            order.push(node);
            for &consumer in &self.dependents[node] {
                pending[consumer] -= 1;
                if pending[consumer] == 0 {
                    ready.push(Reverse(consumer));
                }
            }
        }
        order
    }

    /// Every node that depends on `node`, directly or transitively.
    #[must_use]
    pub fn transitive_dependents(&self, node: usize) -> BTreeSet<usize> {
        let mut seen = BTreeSet::new();
        let mut queue = vec![node];
        while let Some(current) = queue.pop() {
            for &consumer in &self.dependents[current] {
                if seen.insert(consumer) {
                    queue.push(consumer);
                }
            }
        }
        seen
    }

    /// Instance at `node`.
    #[must_use]
    pub fn node(&self, node: usize) -> &InstanceId {
        &self.nodes[node]
    }

    /// Position of `id`.
    #[must_use]
    pub fn index_of(&self, id: &InstanceId) -> Option<usize> {
        self.index.get(id).copied()
    }

    /// Direct producers of `node`.
    #[must_use]
    pub fn dependencies(&self, node: usize) -> &BTreeSet<usize> {
        &self.dependencies[node]
    }

    /// Direct consumers of `node`.
    #[must_use]
    pub fn dependents(&self, node: usize) -> &BTreeSet<usize> {
        &self.dependents[node]
    }

    /// Returns true if the node is declared in configuration.
    #[must_use]
    pub const fn is_declared(&self, node: usize) -> bool {
        node < self.declared
    }

    /// All instances, in node order.
    #[must_use]
    pub fn nodes(&self) -> &[InstanceId] {
        &self.nodes
    }

    /// Number of nodes.
    #[must_use]
    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    /// Returns true if the graph has no nodes.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::DesiredInstance;
    use crate::schema::{Attributes, Reference, Value};
    use crate::state::InstanceState;

    fn instance(id: &str, refs: &[&str]) -> DesiredInstance {
        let mut attributes = Attributes::new();
        for (i, target) in refs.iter().enumerate() {
            attributes.insert(
                format!("ref{i}"),
                Value::Reference(
                    Reference::parse(&format!("${{{target}.id}}")).expect("reference"),
                ),
            );
        }
        DesiredInstance {
            id: id.parse().expect("address"),
            attributes,
            depends_on: vec![],
            create_before_destroy: None,
        }
    }

    fn names(graph: &DependencyGraph, order: &[usize]) -> Vec<String> {
        order.iter().map(|&n| graph.node(n).to_string()).collect()
    }

    #[test]
    fn test_producers_come_first() {
        let desired: DesiredState = vec![
            instance("server.web", &["network.main"]),
            instance("network.main", &[]),
        ]
        .into_iter()
        .collect();

        let graph = DependencyGraph::build(&desired, &StateSnapshot::new()).expect("graph");
        let order = graph.topological_order();
        assert_eq!(names(&graph, &order), vec!["network.main", "server.web"]);
    }

    #[test]
    fn test_ties_follow_declaration_order() {
        let desired: DesiredState = vec![
            instance("volume.b", &[]),
            instance("volume.a", &[]),
            instance("volume.c", &[]),
        ]
        .into_iter()
        .collect();

        let graph = DependencyGraph::build(&desired, &StateSnapshot::new()).expect("graph");
        assert_eq!(
            names(&graph, &graph.topological_order()),
            vec!["volume.b", "volume.a", "volume.c"]
        );
    }

    #[test]
    fn test_cycle_reports_path() {
        let desired: DesiredState = vec![
            instance("server.a", &["server.b"]),
            instance("server.b", &["server.c"]),
            instance("server.c", &["server.a"]),
        ]
        .into_iter()
        .collect();

        let err = DependencyGraph::build(&desired, &StateSnapshot::new()).expect_err("cycle");
        match err {
            GraphError::Cycle { path } => {
                assert_eq!(path, vec!["server.a", "server.b", "server.c", "server.a"]);
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn test_state_only_nodes_keep_recorded_dependencies() {
        let mut snapshot = StateSnapshot::new();
        let net = InstanceId::new("network", "old");
        let srv = InstanceId::new("server", "old");
        snapshot
            .instances
            .insert(net.clone(), InstanceState::new(&net, "n-1", Attributes::new()));
        snapshot.instances.insert(
            srv.clone(),
            InstanceState::new(&srv, "s-1", Attributes::new()).with_dependencies(vec![net.clone()]),
        );

        let graph = DependencyGraph::build(&DesiredState::new(), &snapshot).expect("graph");
        assert_eq!(graph.len(), 2);
        let srv_node = graph.index_of(&srv).expect("node");
        let net_node = graph.index_of(&net).expect("node");
        assert!(graph.dependencies(srv_node).contains(&net_node));
        assert!(!graph.is_declared(srv_node));
        assert_eq!(graph.transitive_dependents(net_node).len(), 1);
    }

    #[test]
    fn test_unknown_reference() {
        let desired: DesiredState = vec![instance("server.web", &["network.gone"])]
            .into_iter()
            .collect();
        let err = DependencyGraph::build(&desired, &StateSnapshot::new()).expect_err("unknown");
        assert!(matches!(err, GraphError::UnknownReference { .. }));
    }
}
