//! 4-direction task graph
//!
//! Nodes navigate UP (parent), DOWN (first child), LEFT (previous sibling),
//! and RIGHT (next sibling). Every edge is bidirectional and the reverse
//! link is maintained automatically: the structure is a tree in UP/DOWN,
//! augmented with doubly linked sibling chains in LEFT/RIGHT.

use std::collections::{HashMap, HashSet};
use std::sync::Mutex;

use thiserror::Error;

use crate::domain::TaskStatus;

/// Navigation direction in the task graph
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Direction {
    /// Parent / container task
    Up,
    /// First child / sub-task
    Down,
    /// Previous sibling
    Left,
    /// Next sibling
    Right,
}

impl Direction {
    /// Flip arrow direction for bidirectional edges
    pub fn reverse(self) -> Self {
        match self {
            Direction::Up => Direction::Down,
            Direction::Down => Direction::Up,
            Direction::Left => Direction::Right,
            Direction::Right => Direction::Left,
        }
    }

    fn index(self) -> usize {
        match self {
            Direction::Up => 0,
            Direction::Down => 1,
            Direction::Left => 2,
            Direction::Right => 3,
        }
    }
}

/// Where to attach a node under its new parent
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Position {
    First,
    Last,
    /// Insert directly after the given sibling
    After(String),
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum GraphError {
    #[error("node {0} does not exist")]
    MissingNode(String),

    #[error("edge {from} --{direction:?}--> {existing} already exists")]
    EdgeExists {
        from: String,
        direction: Direction,
        existing: String,
    },
}

/// Per-node metadata carried for rendering and advice queries
#[derive(Debug, Clone, Default)]
pub struct NodeMeta {
    pub r#abstract: String,
    pub description: String,
    pub status: TaskStatus,
}

struct GraphInner {
    /// node id -> neighbor per direction
    relations: HashMap<String, [Option<String>; 4]>,
    meta: HashMap<String, NodeMeta>,
}

/// Thread-safe 4-direction graph. All operations lock; reads return
/// consistent snapshots.
pub struct DirectionalGraph {
    inner: Mutex<GraphInner>,
}

impl Default for DirectionalGraph {
    fn default() -> Self {
        Self::new()
    }
}

impl DirectionalGraph {
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(GraphInner {
                relations: HashMap::new(),
                meta: HashMap::new(),
            }),
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, GraphInner> {
        self.inner.lock().expect("graph lock poisoned")
    }

    /// Register a node with all four directions unset
    pub fn add_node(&self, node_id: &str, meta: NodeMeta) {
        let mut inner = self.lock();
        inner.relations.insert(node_id.to_string(), Default::default());
        inner.meta.insert(node_id.to_string(), meta);
    }

    pub fn contains(&self, node_id: &str) -> bool {
        self.lock().relations.contains_key(node_id)
    }

    pub fn node_count(&self) -> usize {
        self.lock().relations.len()
    }

    /// Install `from --direction--> to` and the reverse edge. Passing `None`
    /// breaks the edge. Without `overwrite`, a differing existing edge is a
    /// conflict error.
    pub fn add_edge(
        &self,
        from: &str,
        direction: Direction,
        to: Option<&str>,
        overwrite: bool,
    ) -> Result<(), GraphError> {
        self.lock().add_edge(from, direction, to, overwrite)
    }

    /// Remove an edge and its reverse
    pub fn remove_edge(&self, from: &str, direction: Direction) -> Result<(), GraphError> {
        self.lock().add_edge(from, direction, None, true)
    }

    /// Neighbor in one direction, if any
    pub fn neighbor(&self, node_id: &str, direction: Direction) -> Option<String> {
        self.lock().neighbor(node_id, direction)
    }

    /// Walk one direction until hitting the end of the chain
    pub fn traverse(&self, node_id: &str, direction: Direction, include_self: bool) -> Vec<String> {
        self.lock().traverse(node_id, direction, include_self)
    }

    pub fn get_parent(&self, node_id: &str) -> Option<String> {
        self.lock().neighbor(node_id, Direction::Up)
    }

    /// All children in sibling order (DOWN, then the RIGHT chain)
    pub fn get_children(&self, node_id: &str) -> Vec<String> {
        self.lock().children(node_id)
    }

    /// Nodes sharing this node's parent, in chain order
    pub fn get_siblings(&self, node_id: &str, include_self: bool) -> Vec<String> {
        let inner = self.lock();
        let Some(parent) = inner.neighbor(node_id, Direction::Up) else {
            return if include_self { vec![node_id.to_string()] } else { Vec::new() };
        };
        inner
            .children(&parent)
            .into_iter()
            .filter(|s| include_self || s != node_id)
            .collect()
    }

    /// Previous siblings, nearest first
    pub fn get_prev_siblings(&self, node_id: &str) -> Vec<String> {
        self.lock().traverse(node_id, Direction::Left, false)
    }

    /// Next siblings, nearest first
    pub fn get_next_siblings(&self, node_id: &str) -> Vec<String> {
        self.lock().traverse(node_id, Direction::Right, false)
    }

    /// Ancestors, parent first
    pub fn get_ancestors(&self, node_id: &str) -> Vec<String> {
        self.lock().traverse(node_id, Direction::Up, false)
    }

    /// Entire subtree below the node
    pub fn get_descendants(&self, node_id: &str) -> HashSet<String> {
        self.lock().descendants(node_id)
    }

    pub fn get_leftmost_sibling(&self, node_id: &str) -> String {
        let chain = self.lock().traverse(node_id, Direction::Left, false);
        chain.last().cloned().unwrap_or_else(|| node_id.to_string())
    }

    pub fn get_rightmost_sibling(&self, node_id: &str) -> String {
        let chain = self.lock().traverse(node_id, Direction::Right, false);
        chain.last().cloned().unwrap_or_else(|| node_id.to_string())
    }

    /// Rewire a node under a new parent (dynamic re-scoping). The node is
    /// unspliced from its current sibling chain first.
    pub fn move_node(&self, node_id: &str, new_parent: &str, position: Position) -> Result<(), GraphError> {
        let mut inner = self.lock();
        if !inner.relations.contains_key(node_id) {
            return Err(GraphError::MissingNode(node_id.to_string()));
        }
        if !inner.relations.contains_key(new_parent) {
            return Err(GraphError::MissingNode(new_parent.to_string()));
        }

        inner.unsplice(node_id)?;

        match position {
            Position::First => {
                let old_first = inner.neighbor(new_parent, Direction::Down);
                inner.add_edge(new_parent, Direction::Down, Some(node_id), true)?;
                if let Some(old_first) = old_first {
                    inner.add_edge(node_id, Direction::Right, Some(&old_first), true)?;
                }
            }
            Position::Last => match inner.neighbor(new_parent, Direction::Down) {
                None => inner.add_edge(new_parent, Direction::Down, Some(node_id), true)?,
                Some(first) => {
                    let rightmost = inner
                        .traverse(&first, Direction::Right, true)
                        .last()
                        .cloned()
                        .expect("non-empty chain");
                    inner.add_edge(&rightmost, Direction::Right, Some(node_id), true)?;
                }
            },
            Position::After(sibling) => {
                let old_right = inner.neighbor(&sibling, Direction::Right);
                inner.add_edge(&sibling, Direction::Right, Some(node_id), true)?;
                if let Some(old_right) = old_right {
                    inner.add_edge(node_id, Direction::Right, Some(&old_right), true)?;
                }
            }
        }
        Ok(())
    }

    /// Remove a node and its entire subtree, returning every removed id
    pub fn remove_subtree(&self, node_id: &str) -> Result<HashSet<String>, GraphError> {
        let mut inner = self.lock();
        if !inner.relations.contains_key(node_id) {
            return Err(GraphError::MissingNode(node_id.to_string()));
        }

        let mut to_remove = inner.descendants(node_id);
        to_remove.insert(node_id.to_string());

        // Unsplicing reconnects the sibling chain and fixes (or clears) the
        // parent's DOWN link, so surviving siblings stay reachable.
        inner.unsplice(node_id)?;

        for id in &to_remove {
            inner.relations.remove(id);
            inner.meta.remove(id);
        }
        Ok(to_remove)
    }

    /// Merge updates into a node's metadata
    pub fn update_meta(&self, node_id: &str, f: impl FnOnce(&mut NodeMeta)) {
        let mut inner = self.lock();
        if let Some(meta) = inner.meta.get_mut(node_id) {
            f(meta);
        }
    }

    pub fn meta(&self, node_id: &str) -> Option<NodeMeta> {
        self.lock().meta.get(node_id).cloned()
    }

    /// Consistent snapshot of every node's metadata and edges
    pub fn snapshot(&self) -> Vec<(String, NodeMeta, [Option<String>; 4])> {
        let inner = self.lock();
        inner
            .relations
            .iter()
            .map(|(id, edges)| {
                (
                    id.clone(),
                    inner.meta.get(id).cloned().unwrap_or_default(),
                    edges.clone(),
                )
            })
            .collect()
    }
}

impl GraphInner {
    fn neighbor(&self, node_id: &str, direction: Direction) -> Option<String> {
        self.relations.get(node_id)?[direction.index()].clone()
    }

    fn add_edge(
        &mut self,
        from: &str,
        direction: Direction,
        to: Option<&str>,
        overwrite: bool,
    ) -> Result<(), GraphError> {
        if !self.relations.contains_key(from) {
            return Err(GraphError::MissingNode(from.to_string()));
        }
        if let Some(to) = to
            && !self.relations.contains_key(to)
        {
            return Err(GraphError::MissingNode(to.to_string()));
        }

        let existing = self.neighbor(from, direction);
        if let Some(existing) = &existing {
            if !overwrite && to != Some(existing.as_str()) {
                return Err(GraphError::EdgeExists {
                    from: from.to_string(),
                    direction,
                    existing: existing.clone(),
                });
            }
            // Break the displaced neighbor's reverse edge
            if to != Some(existing.as_str())
                && let Some(edges) = self.relations.get_mut(existing)
            {
                edges[direction.reverse().index()] = None;
            }
        }

        if let Some(edges) = self.relations.get_mut(from) {
            edges[direction.index()] = to.map(str::to_string);
        }
        if let Some(to) = to
            && let Some(edges) = self.relations.get_mut(to)
        {
            edges[direction.reverse().index()] = Some(from.to_string());
        }
        Ok(())
    }

    fn traverse(&self, node_id: &str, direction: Direction, include_self: bool) -> Vec<String> {
        let mut path = if include_self { vec![node_id.to_string()] } else { Vec::new() };
        let mut current = node_id.to_string();
        while let Some(next) = self.neighbor(&current, direction) {
            path.push(next.clone());
            current = next;
        }
        path
    }

    fn children(&self, node_id: &str) -> Vec<String> {
        match self.neighbor(node_id, Direction::Down) {
            Some(first) => self.traverse(&first, Direction::Right, true),
            None => Vec::new(),
        }
    }

    fn descendants(&self, node_id: &str) -> HashSet<String> {
        let mut found = HashSet::new();
        let mut to_visit = vec![node_id.to_string()];
        while let Some(current) = to_visit.pop() {
            for child in self.children(&current) {
                if found.insert(child.clone()) {
                    to_visit.push(child);
                }
            }
        }
        found
    }

    /// Remove a node from its sibling chain, reconnecting LEFT and RIGHT
    /// neighbors (and the parent's DOWN link when it was leftmost).
    fn unsplice(&mut self, node_id: &str) -> Result<(), GraphError> {
        let left = self.neighbor(node_id, Direction::Left);
        let right = self.neighbor(node_id, Direction::Right);

        match (left, right) {
            (Some(left), Some(right)) => {
                self.add_edge(&left, Direction::Right, Some(&right), true)?;
            }
            (Some(left), None) => {
                self.add_edge(&left, Direction::Right, None, true)?;
            }
            (None, Some(right)) => {
                // Leftmost: the parent's DOWN link moves to the next sibling
                // (the overwrite also clears this node's UP link).
                if let Some(parent) = self.neighbor(node_id, Direction::Up) {
                    self.add_edge(&parent, Direction::Down, Some(&right), true)?;
                } else {
                    self.add_edge(node_id, Direction::Right, None, true)?;
                }
            }
            (None, None) => {
                if let Some(parent) = self.neighbor(node_id, Direction::Up) {
                    self.add_edge(&parent, Direction::Down, None, true)?;
                }
            }
        }

        if let Some(edges) = self.relations.get_mut(node_id) {
            edges[Direction::Left.index()] = None;
            edges[Direction::Right.index()] = None;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn graph_with(ids: &[&str]) -> DirectionalGraph {
        let graph = DirectionalGraph::new();
        for id in ids {
            graph.add_node(id, NodeMeta::default());
        }
        graph
    }

    /// root with children a, b, c as a sibling chain
    fn family() -> DirectionalGraph {
        let graph = graph_with(&["root", "a", "b", "c"]);
        graph.add_edge("root", Direction::Down, Some("a"), false).unwrap();
        graph.add_edge("a", Direction::Right, Some("b"), false).unwrap();
        graph.add_edge("b", Direction::Right, Some("c"), false).unwrap();
        graph
    }

    #[test]
    fn test_add_edge_installs_reverse() {
        let graph = graph_with(&["a", "b"]);
        graph.add_edge("a", Direction::Down, Some("b"), false).unwrap();
        assert_eq!(graph.neighbor("a", Direction::Down).as_deref(), Some("b"));
        assert_eq!(graph.neighbor("b", Direction::Up).as_deref(), Some("a"));
    }

    #[test]
    fn test_add_edge_missing_node() {
        let graph = graph_with(&["a"]);
        let err = graph.add_edge("a", Direction::Down, Some("ghost"), false).unwrap_err();
        assert_eq!(err, GraphError::MissingNode("ghost".to_string()));
    }

    #[test]
    fn test_add_edge_conflict_without_overwrite() {
        let graph = graph_with(&["a", "b", "c"]);
        graph.add_edge("a", Direction::Down, Some("b"), false).unwrap();
        let err = graph.add_edge("a", Direction::Down, Some("c"), false).unwrap_err();
        assert!(matches!(err, GraphError::EdgeExists { .. }));
        // Re-asserting the same edge is not a conflict
        graph.add_edge("a", Direction::Down, Some("b"), false).unwrap();
    }

    #[test]
    fn test_overwrite_clears_displaced_reverse() {
        let graph = graph_with(&["a", "b", "c"]);
        graph.add_edge("a", Direction::Down, Some("b"), false).unwrap();
        graph.add_edge("a", Direction::Down, Some("c"), true).unwrap();
        assert_eq!(graph.neighbor("a", Direction::Down).as_deref(), Some("c"));
        assert_eq!(graph.neighbor("c", Direction::Up).as_deref(), Some("a"));
        assert_eq!(graph.neighbor("b", Direction::Up), None);
    }

    #[test]
    fn test_remove_edge() {
        let graph = graph_with(&["a", "b"]);
        graph.add_edge("a", Direction::Right, Some("b"), false).unwrap();
        graph.remove_edge("a", Direction::Right).unwrap();
        assert_eq!(graph.neighbor("a", Direction::Right), None);
        assert_eq!(graph.neighbor("b", Direction::Left), None);
    }

    #[test]
    fn test_children_follow_sibling_chain() {
        let graph = family();
        assert_eq!(graph.get_children("root"), vec!["a", "b", "c"]);
    }

    #[test]
    fn test_only_first_child_links_up() {
        let graph = family();
        // Middle siblings reach the parent via LEFT, not UP
        assert_eq!(graph.get_parent("a").as_deref(), Some("root"));
        assert_eq!(graph.get_parent("b"), None);
        assert_eq!(graph.get_prev_siblings("c"), vec!["b", "a"]);
    }

    #[test]
    fn test_siblings_and_ancestors() {
        let graph = family();
        assert_eq!(graph.get_siblings("a", false), vec!["b", "c"]);
        assert_eq!(graph.get_siblings("a", true), vec!["a", "b", "c"]);
        assert_eq!(graph.get_ancestors("a"), vec!["root"]);
        assert_eq!(graph.get_leftmost_sibling("c"), "a");
        assert_eq!(graph.get_rightmost_sibling("a"), "c");
    }

    #[test]
    fn test_descendants() {
        let graph = family();
        graph.add_node("b1", NodeMeta::default());
        graph.add_edge("b", Direction::Down, Some("b1"), false).unwrap();

        let desc = graph.get_descendants("root");
        assert_eq!(desc.len(), 4);
        assert!(desc.contains("b1"));
        assert!(!desc.contains("root"));
    }

    #[test]
    fn test_move_node_unsplices_middle() {
        let graph = family();
        graph.add_node("other", NodeMeta::default());
        graph.move_node("b", "other", Position::Last).unwrap();

        assert_eq!(graph.get_children("root"), vec!["a", "c"]);
        assert_eq!(graph.neighbor("a", Direction::Right).as_deref(), Some("c"));
        assert_eq!(graph.neighbor("c", Direction::Left).as_deref(), Some("a"));
        assert_eq!(graph.get_children("other"), vec!["b"]);
        assert_eq!(graph.get_parent("b").as_deref(), Some("other"));
    }

    #[test]
    fn test_move_leftmost_rewires_parent_down() {
        let graph = family();
        graph.add_node("other", NodeMeta::default());
        graph.move_node("a", "other", Position::Last).unwrap();

        assert_eq!(graph.get_children("root"), vec!["b", "c"]);
        assert_eq!(graph.neighbor("root", Direction::Down).as_deref(), Some("b"));
    }

    #[test]
    fn test_move_node_first_position() {
        let graph = family();
        graph.add_node("x", NodeMeta::default());
        graph.move_node("x", "root", Position::First).unwrap();
        assert_eq!(graph.get_children("root"), vec!["x", "a", "b", "c"]);
    }

    #[test]
    fn test_move_node_after_position() {
        let graph = family();
        graph.add_node("x", NodeMeta::default());
        graph.move_node("x", "root", Position::After("a".to_string())).unwrap();
        assert_eq!(graph.get_children("root"), vec!["a", "x", "b", "c"]);
    }

    #[test]
    fn test_remove_subtree_returns_removed_set() {
        let graph = family();
        graph.add_node("b1", NodeMeta::default());
        graph.add_edge("b", Direction::Down, Some("b1"), false).unwrap();

        let removed = graph.remove_subtree("b").unwrap();
        assert_eq!(removed.len(), 2);
        assert!(removed.contains("b"));
        assert!(removed.contains("b1"));
        assert!(!graph.contains("b"));
        assert!(!graph.contains("b1"));
        assert_eq!(graph.get_children("root"), vec!["a", "c"]);
    }

    #[test]
    fn test_remove_subtree_leftmost_keeps_siblings_reachable() {
        let graph = family();
        graph.remove_subtree("a").unwrap();
        assert_eq!(graph.get_children("root"), vec!["b", "c"]);
    }

    #[test]
    fn test_remove_subtree_only_child_clears_parent_down() {
        let graph = graph_with(&["root", "only"]);
        graph.add_edge("root", Direction::Down, Some("only"), false).unwrap();
        graph.remove_subtree("only").unwrap();
        assert_eq!(graph.neighbor("root", Direction::Down), None);
    }

    mod properties {
        use super::*;
        use proptest::prelude::*;
        use proptest::sample::Index;

        /// Build a random tree: node i attaches as last child of a random
        /// earlier node. Returns the graph and the node ids in creation order.
        fn build_tree(parents: &[Index]) -> (DirectionalGraph, Vec<String>) {
            let graph = DirectionalGraph::new();
            let mut ids = vec!["n0".to_string()];
            graph.add_node("n0", NodeMeta::default());

            for (i, pick) in parents.iter().enumerate() {
                let id = format!("n{}", i + 1);
                let parent = ids[pick.index(ids.len())].clone();
                graph.add_node(&id, NodeMeta::default());
                attach_last(&graph, &parent, &id);
                ids.push(id);
            }
            (graph, ids)
        }

        fn attach_last(graph: &DirectionalGraph, parent: &str, child: &str) {
            match graph.neighbor(parent, Direction::Down) {
                None => graph.add_edge(parent, Direction::Down, Some(child), false).unwrap(),
                Some(first) => {
                    let rightmost = graph.get_rightmost_sibling(&first);
                    graph.add_edge(&rightmost, Direction::Right, Some(child), false).unwrap();
                }
            }
        }

        /// Invariant: every edge has a matching reverse edge
        fn assert_mirrored(graph: &DirectionalGraph) {
            for (id, _, edges) in graph.snapshot() {
                for dir in [Direction::Up, Direction::Down, Direction::Left, Direction::Right] {
                    if let Some(other) = &edges[dir.index()] {
                        assert_eq!(
                            graph.neighbor(other, dir.reverse()).as_deref(),
                            Some(id.as_str()),
                            "edge {id} --{dir:?}--> {other} has no mirror"
                        );
                    }
                }
            }
        }

        /// Invariant: iterating RIGHT from the leftmost sibling visits every
        /// sibling exactly once and terminates
        fn assert_chains_sound(graph: &DirectionalGraph, ids: &[String]) {
            for id in ids {
                if !graph.contains(id) {
                    continue;
                }
                let leftmost = graph.get_leftmost_sibling(id);
                let chain = graph.traverse(&leftmost, Direction::Right, true);
                let unique: std::collections::HashSet<_> = chain.iter().collect();
                assert_eq!(unique.len(), chain.len(), "duplicate in sibling chain from {leftmost}");
                assert!(chain.contains(id));
                let last = chain.last().unwrap();
                assert_eq!(graph.neighbor(last, Direction::Right), None);
            }
        }

        proptest! {
            #[test]
            fn prop_edges_are_mirrored(parents in proptest::collection::vec(any::<Index>(), 1..40)) {
                let (graph, ids) = build_tree(&parents);
                assert_mirrored(&graph);
                assert_chains_sound(&graph, &ids);
            }

            #[test]
            fn prop_move_node_preserves_invariants(
                parents in proptest::collection::vec(any::<Index>(), 2..40),
                node_pick in any::<Index>(),
                target_pick in any::<Index>(),
            ) {
                let (graph, ids) = build_tree(&parents);
                let node = &ids[node_pick.index(ids.len() - 1) + 1]; // never the root
                let target = &ids[target_pick.index(ids.len())];

                // A move into the node's own subtree would create a cycle
                let subtree = graph.get_descendants(node);
                prop_assume!(target != node && !subtree.contains(target));

                graph.move_node(node, target, Position::Last).unwrap();

                assert_mirrored(&graph);
                assert_chains_sound(&graph, &ids);
                assert_eq!(
                    graph.get_children(target).last().map(String::as_str),
                    Some(node.as_str())
                );
                let leftmost = graph.get_leftmost_sibling(node);
                assert_eq!(graph.get_parent(&leftmost).as_deref(), Some(target.as_str()));
            }

            #[test]
            fn prop_remove_subtree_removes_exactly_descendants(
                parents in proptest::collection::vec(any::<Index>(), 1..40),
                node_pick in any::<Index>(),
            ) {
                let (graph, ids) = build_tree(&parents);
                let node = &ids[node_pick.index(ids.len())];

                let mut expected = graph.get_descendants(node);
                expected.insert(node.clone());

                let removed = graph.remove_subtree(node).unwrap();
                assert_eq!(removed, expected);
                for id in &removed {
                    assert!(!graph.contains(id));
                }
                assert_mirrored(&graph);
                assert_chains_sound(&graph, &ids);
            }
        }
    }
}
