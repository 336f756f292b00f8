//! Directed dependency graph for incremental content rebuilds.
//!
//! Nodes are usually file paths: an edge `a -> b` means "`b` is produced from
//! `a`". Leaves (no outgoing edges) are emitted files.

use std::collections::{HashMap, HashSet};
use std::hash::Hash;

use serde::Serialize;

#[derive(Debug, Clone)]
struct Adjacency<T> {
    incoming: HashSet<T>,
    outgoing: HashSet<T>,
}

impl<T> Default for Adjacency<T> {
    fn default() -> Self {
        Self {
            incoming: HashSet::new(),
            outgoing: HashSet::new(),
        }
    }
}

/// Snapshot of a graph for debugging output.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct GraphExport<T> {
    /// Every node in the graph
    pub nodes: Vec<T>,
    /// Every edge as `(from, to)`
    pub edges: Vec<(T, T)>,
}

/// A directed graph with owned adjacency sets.
#[derive(Debug, Clone)]
pub struct DepGraph<T> {
    nodes: HashMap<T, Adjacency<T>>,
}

impl<T> Default for DepGraph<T> {
    fn default() -> Self {
        Self {
            nodes: HashMap::new(),
        }
    }
}

impl<T: Eq + Hash + Clone> DepGraph<T> {
    /// Create an empty graph.
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of nodes.
    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    /// Whether the graph has no nodes.
    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    pub fn has_node(&self, node: &T) -> bool {
        self.nodes.contains_key(node)
    }

    /// Add a node. Adding an existing node is a no-op.
    pub fn add_node(&mut self, node: T) {
        self.nodes.entry(node).or_default();
    }

    /// Remove a node along with every edge touching it.
    pub fn remove_node(&mut self, node: &T) {
        let Some(adjacency) = self.nodes.remove(node) else {
            return;
        };

        for target in &adjacency.outgoing {
            if let Some(entry) = self.nodes.get_mut(target) {
                entry.incoming.remove(node);
            }
        }
        for source in &adjacency.incoming {
            if let Some(entry) = self.nodes.get_mut(source) {
                entry.outgoing.remove(node);
            }
        }
    }

    pub fn has_edge(&self, from: &T, to: &T) -> bool {
        self.nodes
            .get(from)
            .is_some_and(|entry| entry.outgoing.contains(to))
    }

    /// Add an edge, creating missing endpoints.
    pub fn add_edge(&mut self, from: T, to: T) {
        self.add_node(from.clone());
        self.add_node(to.clone());

        if let Some(entry) = self.nodes.get_mut(&from) {
            entry.outgoing.insert(to.clone());
        }
        if let Some(entry) = self.nodes.get_mut(&to) {
            entry.incoming.insert(from);
        }
    }

    /// Remove an edge. Both endpoints stay in the graph.
    pub fn remove_edge(&mut self, from: &T, to: &T) {
        if let Some(entry) = self.nodes.get_mut(from) {
            entry.outgoing.remove(to);
        }
        if let Some(entry) = self.nodes.get_mut(to) {
            entry.incoming.remove(from);
        }
    }

    /// Number of incoming edges, 0 for unknown nodes.
    pub fn in_degree(&self, node: &T) -> usize {
        self.nodes.get(node).map_or(0, |entry| entry.incoming.len())
    }

    /// Number of outgoing edges, 0 for unknown nodes.
    pub fn out_degree(&self, node: &T) -> usize {
        self.nodes.get(node).map_or(0, |entry| entry.outgoing.len())
    }

    pub fn out_neighbors(&self, node: &T) -> impl Iterator<Item = &T> {
        self.nodes
            .get(node)
            .into_iter()
            .flat_map(|entry| entry.outgoing.iter())
    }

    pub fn in_neighbors(&self, node: &T) -> impl Iterator<Item = &T> {
        self.nodes
            .get(node)
            .into_iter()
            .flat_map(|entry| entry.incoming.iter())
    }

    pub fn nodes(&self) -> impl Iterator<Item = &T> {
        self.nodes.keys()
    }

    pub fn edges(&self) -> impl Iterator<Item = (&T, &T)> {
        self.nodes
            .iter()
            .flat_map(|(from, entry)| entry.outgoing.iter().map(move |to| (from, to)))
    }

    /// Copy every node and edge of `other` into this graph.
    pub fn merge_graph(&mut self, other: &DepGraph<T>) {
        for node in other.nodes() {
            self.add_node(node.clone());
        }
        for (from, to) in other.edges() {
            self.add_edge(from.clone(), to.clone());
        }
    }

    /// Replace the incoming edges of `node` with the ones `other` has for it.
    ///
    /// Sources that lose their last edge are removed as well.
    pub fn update_incoming_edges_for_node(&mut self, other: &DepGraph<T>, node: &T) {
        self.add_node(node.clone());

        for source in other.in_neighbors(node) {
            self.add_edge(source.clone(), node.clone());
        }

        let stale: Vec<T> = self
            .in_neighbors(node)
            .filter(|source| !other.has_edge(source, node))
            .cloned()
            .collect();

        for source in stale {
            self.remove_edge(&source, node);
            if self.in_degree(&source) == 0 && self.out_degree(&source) == 0 {
                self.remove_node(&source);
            }
        }
    }

    /// Remove nodes with no edges at all. Returns how many were removed.
    pub fn remove_orphan_nodes(&mut self) -> usize {
        let orphans: Vec<T> = self
            .nodes
            .iter()
            .filter(|(_, entry)| entry.incoming.is_empty() && entry.outgoing.is_empty())
            .map(|(node, _)| node.clone())
            .collect();

        for node in &orphans {
            self.nodes.remove(node);
        }
        orphans.len()
    }

    /// Leaf nodes reachable from `start`, including `start` itself if it is one.
    ///
    /// For `A -> B -> C` and `D -> B`, the leaves of `B` are `{C}`.
    pub fn leaf_nodes(&self, start: &T) -> HashSet<T> {
        let mut stack = vec![start.clone()];
        let mut visited = HashSet::new();
        let mut leaves = HashSet::new();

        while let Some(node) = stack.pop() {
            if !visited.insert(node.clone()) {
                continue;
            }
            if self.out_degree(&node) == 0 {
                leaves.insert(node.clone());
            }
            for neighbor in self.out_neighbors(&node) {
                if !visited.contains(neighbor) {
                    stack.push(neighbor.clone());
                }
            }
        }

        leaves
    }

    /// Non-leaf ancestors of the leaves reachable from `start`.
    ///
    /// For `A -> B -> C` and `D -> B`, the result for `B` is `{A, B, D}`.
    /// Assumes an emitted file never depends on another emitted file.
    pub fn leaf_node_ancestors(&self, start: &T) -> HashSet<T> {
        let mut visited = HashSet::new();
        let mut ancestors = HashSet::new();

        for leaf in self.leaf_nodes(start) {
            let mut stack = vec![leaf];
            while let Some(node) = stack.pop() {
                if !visited.insert(node.clone()) {
                    continue;
                }
                if self.out_degree(&node) != 0 {
                    ancestors.insert(node.clone());
                }
                for parent in self.in_neighbors(&node) {
                    if !visited.contains(parent) {
                        stack.push(parent.clone());
                    }
                }
            }
        }

        ancestors
    }

    pub fn export(&self) -> GraphExport<T> {
        GraphExport {
            nodes: self.nodes().cloned().collect(),
            edges: self
                .edges()
                .map(|(from, to)| (from.clone(), to.clone()))
                .collect(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn set(items: &[&'static str]) -> HashSet<&'static str> {
        items.iter().copied().collect()
    }

    /// A -> B -> C, D -> B
    fn diamond() -> DepGraph<&'static str> {
        let mut graph = DepGraph::new();
        graph.add_edge("A", "B");
        graph.add_edge("B", "C");
        graph.add_edge("D", "B");
        graph
    }

    #[test]
    fn adds_and_removes_edges() {
        let mut graph = DepGraph::new();
        graph.add_edge("A", "B");

        assert!(graph.has_node(&"A"));
        assert!(graph.has_edge(&"A", &"B"));
        assert!(!graph.has_edge(&"B", &"A"));
        assert_eq!(graph.out_degree(&"A"), 1);
        assert_eq!(graph.in_degree(&"B"), 1);

        graph.remove_edge(&"A", &"B");
        assert!(!graph.has_edge(&"A", &"B"));
        assert_eq!(graph.len(), 2);
    }

    #[test]
    fn removing_node_drops_its_edges() {
        let mut graph = diamond();
        graph.remove_node(&"B");

        assert!(!graph.has_node(&"B"));
        assert_eq!(graph.out_degree(&"A"), 0);
        assert_eq!(graph.in_degree(&"C"), 0);
        assert_eq!(graph.edges().count(), 0);
    }

    #[test]
    fn unknown_nodes_have_zero_degree() {
        let graph: DepGraph<&str> = DepGraph::new();
        assert_eq!(graph.in_degree(&"missing"), 0);
        assert_eq!(graph.out_degree(&"missing"), 0);
        assert!(graph.is_empty());
    }

    #[test]
    fn finds_leaf_nodes() {
        let graph = diamond();
        assert_eq!(graph.leaf_nodes(&"B"), set(&["C"]));
        assert_eq!(graph.leaf_nodes(&"A"), set(&["C"]));
        assert_eq!(graph.leaf_nodes(&"C"), set(&["C"]));
    }

    #[test]
    fn finds_leaf_node_ancestors() {
        let graph = diamond();
        assert_eq!(graph.leaf_node_ancestors(&"B"), set(&["A", "B", "D"]));
    }

    #[test]
    fn leaf_search_survives_cycles() {
        let mut graph = DepGraph::new();
        graph.add_edge("A", "B");
        graph.add_edge("B", "A");
        graph.add_edge("B", "C");

        assert_eq!(graph.leaf_nodes(&"A"), set(&["C"]));
        assert_eq!(graph.leaf_node_ancestors(&"A"), set(&["A", "B"]));
    }

    #[test]
    fn merges_graphs() {
        let mut graph = diamond();
        let mut other = DepGraph::new();
        other.add_edge("E", "C");
        other.add_node("F");

        graph.merge_graph(&other);

        assert!(graph.has_edge(&"E", &"C"));
        assert!(graph.has_node(&"F"));
        assert_eq!(graph.in_degree(&"C"), 2);
    }

    #[test]
    fn updates_incoming_edges() {
        let mut graph = diamond();
        let mut other = DepGraph::new();
        other.add_edge("A", "B");
        other.add_edge("E", "B");

        graph.update_incoming_edges_for_node(&other, &"B");

        assert!(graph.has_edge(&"A", &"B"));
        assert!(graph.has_edge(&"E", &"B"));
        assert!(!graph.has_edge(&"D", &"B"));
        // D had no other edges left
        assert!(!graph.has_node(&"D"));
    }

    #[test]
    fn removes_orphans() {
        let mut graph = diamond();
        graph.add_node("lonely");

        assert_eq!(graph.remove_orphan_nodes(), 1);
        assert!(!graph.has_node(&"lonely"));
        assert_eq!(graph.len(), 4);
    }

    #[test]
    fn exports_to_json() {
        let mut graph = DepGraph::new();
        graph.add_edge("a.md".to_string(), "a.html".to_string());

        let export = graph.export();
        assert_eq!(export.edges, vec![("a.md".to_string(), "a.html".to_string())]);

        let json = serde_json::to_string(&export).unwrap();
        assert!(json.contains("a.html"));
    }
}
