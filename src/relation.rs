//! Task relation manager
//!
//! Owns the 4-direction graph for one task, allocates node ids, answers the
//! semantic queries nodes use to build context (upper-chain advice,
//! credential chain), and renders the Mermaid diagram artifact after every
//! structural change. Rendering is best-effort: a failed write is logged
//! and execution continues.

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use rand::Rng;
use tracing::{debug, warn};

use crate::domain::{SubTask, TaskStatus};
use crate::graph::{Direction, DirectionalGraph, GraphError, NodeMeta, Position};

/// Abstract keywords that mark a node as part of the credential chain
const CREDENTIAL_KEYWORDS: [&str; 4] = ["crack", "hash", "password", "credential"];

/// A node whose abstract suggests prior credential acquisition
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CredentialHit {
    pub node_id: String,
    pub r#abstract: String,
}

/// Tree-shaped read-only view of one node, for consumers that expect a
/// classic parent/children structure instead of the 4-direction graph.
#[derive(Debug, Clone)]
pub struct TreeNode {
    pub node_id: String,
    pub r#abstract: String,
    pub description: String,
    pub status: TaskStatus,
    pub parent_id: Option<String>,
    pub children: Vec<String>,
}

pub struct TaskRelationManager {
    graph: DirectionalGraph,
    diagram_path: PathBuf,
}

impl TaskRelationManager {
    pub fn new(diagram_path: impl Into<PathBuf>) -> Self {
        Self {
            graph: DirectionalGraph::new(),
            diagram_path: diagram_path.into(),
        }
    }

    pub fn diagram_path(&self) -> &Path {
        &self.diagram_path
    }

    /// Random 6-digit node id, retried until free
    pub fn generate_node_id(&self) -> String {
        loop {
            let id = format!("n{}", rand::rng().random_range(100_000..=999_999));
            if !self.graph.contains(&id) {
                return id;
            }
        }
    }

    /// Register the root node of the task
    pub fn add_root(&self, node_id: &str, r#abstract: &str, description: &str) {
        self.graph.add_node(
            node_id,
            NodeMeta {
                r#abstract: r#abstract.to_string(),
                description: description.to_string(),
                status: TaskStatus::Pending,
            },
        );
        self.render();
    }

    /// Add a planner chain under a parent: ids are allocated here, the first
    /// child hangs off the parent's DOWN link and the rest form the RIGHT
    /// chain. Returns the assigned ids in chain order.
    pub fn add_sub_tasks(&self, parent_id: &str, sub_tasks: &[SubTask]) -> Result<Vec<String>, GraphError> {
        if !self.graph.contains(parent_id) {
            return Err(GraphError::MissingNode(parent_id.to_string()));
        }

        let mut ids = Vec::with_capacity(sub_tasks.len());
        let mut prev: Option<String> = None;

        for sub in sub_tasks {
            let id = self.generate_node_id();
            self.graph.add_node(
                &id,
                NodeMeta {
                    r#abstract: sub.r#abstract.clone(),
                    description: sub.description.clone(),
                    status: TaskStatus::Pending,
                },
            );

            match &prev {
                None => match self.graph.neighbor(parent_id, Direction::Down) {
                    // A replanned parent had its subtree removed, so DOWN is
                    // normally free; append after any survivors otherwise.
                    None => self.graph.add_edge(parent_id, Direction::Down, Some(&id), false)?,
                    Some(first) => {
                        let rightmost = self.graph.get_rightmost_sibling(&first);
                        self.graph.add_edge(&rightmost, Direction::Right, Some(&id), false)?;
                    }
                },
                Some(prev) => self.graph.add_edge(prev, Direction::Right, Some(&id), false)?,
            }

            prev = Some(id.clone());
            ids.push(id);
        }

        self.render();
        Ok(ids)
    }

    /// Update the rendering copy of a node's status. The authoritative store
    /// lives in the task manager; this is write-through only.
    pub fn update_node_status(&self, node_id: &str, status: TaskStatus) {
        self.graph.update_meta(node_id, |meta| meta.status = status);
        self.render();
    }

    /// Remove a node and its subtree (e.g. before a replan)
    pub fn remove_node(&self, node_id: &str) -> Result<(), GraphError> {
        let removed = self.graph.remove_subtree(node_id)?;
        debug!(node_id, removed = removed.len(), "remove_node: subtree removed");
        self.render();
        Ok(())
    }

    /// Context string built from the parent's abstract and the completed
    /// LEFT-chain siblings, oldest first.
    pub fn get_upper_chain_advice(&self, node_id: &str) -> String {
        let mut parts = Vec::new();

        let parent_id = self.parent_of(node_id);
        if let Some(parent_id) = &parent_id
            && let Some(parent) = self.graph.meta(parent_id)
        {
            parts.push(format!("Parent task: {}", parent.r#abstract));
        }

        let mut prev: Vec<String> = self.graph.get_prev_siblings(node_id);
        prev.reverse(); // oldest first
        let completed: Vec<String> = prev
            .iter()
            .filter_map(|id| self.graph.meta(id))
            .filter(|meta| meta.status == TaskStatus::Completed)
            .map(|meta| format!("  - {} ({})", meta.r#abstract, meta.status))
            .collect();

        if !completed.is_empty() {
            parts.push("Previous steps completed:".to_string());
            parts.extend(completed);
        }

        parts.join("\n")
    }

    /// Re-scope a node under a new parent, appended as its last child
    pub fn move_node_to_new_parent(&self, node_id: &str, new_parent_id: &str, reason: &str) -> Result<(), GraphError> {
        debug!(node_id, new_parent_id, reason, "move_node_to_new_parent: re-scoping");
        self.graph.move_node(node_id, new_parent_id, Position::Last)?;
        self.render();
        Ok(())
    }

    /// Insert a variant node directly after a reference node in its sibling
    /// chain. Used by restart: the original stays terminal, the variant runs.
    pub fn add_sibling_variant(
        &self,
        ref_node_id: &str,
        r#abstract: &str,
        description: &str,
    ) -> Result<String, GraphError> {
        if !self.graph.contains(ref_node_id) {
            return Err(GraphError::MissingNode(ref_node_id.to_string()));
        }

        let id = self.generate_node_id();
        self.graph.add_node(
            &id,
            NodeMeta {
                r#abstract: r#abstract.to_string(),
                description: description.to_string(),
                status: TaskStatus::Pending,
            },
        );

        // Splice between the reference node and its old right neighbor. The
        // reference edge must be rewired first so the overwrite clears the
        // old neighbor's LEFT link before it is re-pointed at the variant.
        let old_right = self.graph.neighbor(ref_node_id, Direction::Right);
        self.graph.add_edge(ref_node_id, Direction::Right, Some(&id), true)?;
        if let Some(old_right) = old_right {
            self.graph.add_edge(&id, Direction::Right, Some(&old_right), true)?;
        }

        self.render();
        Ok(id)
    }

    /// Scan LEFT siblings then UP ancestors for nodes whose abstract
    /// suggests prior credential work, in traversal order.
    pub fn get_credential_chain(&self, node_id: &str) -> Vec<CredentialHit> {
        let mut candidates = self.graph.get_prev_siblings(node_id);
        candidates.extend(self.graph.get_ancestors(node_id));

        candidates
            .into_iter()
            .filter_map(|id| self.graph.meta(&id).map(|meta| (id, meta)))
            .filter(|(_, meta)| {
                let lowered = meta.r#abstract.to_lowercase();
                CREDENTIAL_KEYWORDS.iter().any(|kw| lowered.contains(kw))
            })
            .map(|(node_id, meta)| CredentialHit {
                node_id,
                r#abstract: meta.r#abstract,
            })
            .collect()
    }

    /// Per-node tree view (metadata + parent/children) computed from the
    /// graph, for consumers that expect a classic tree.
    pub fn tree_view(&self) -> HashMap<String, TreeNode> {
        self.graph
            .snapshot()
            .into_iter()
            .map(|(node_id, meta, _)| {
                let parent_id = self.parent_of(&node_id);
                let children = self.graph.get_children(&node_id);
                (
                    node_id.clone(),
                    TreeNode {
                        node_id,
                        r#abstract: meta.r#abstract,
                        description: meta.description,
                        status: meta.status,
                        parent_id,
                        children,
                    },
                )
            })
            .collect()
    }

    /// The root is the only node without a parent
    pub fn root_id(&self) -> Option<String> {
        self.graph
            .snapshot()
            .into_iter()
            .map(|(id, _, _)| id)
            .find(|id| self.parent_of(id).is_none())
    }

    /// Effective parent: the UP link for a first child, or the leftmost
    /// sibling's UP link for the rest of a chain.
    pub fn parent_of(&self, node_id: &str) -> Option<String> {
        let leftmost = self.graph.get_leftmost_sibling(node_id);
        self.graph.get_parent(&leftmost)
    }

    /// Direct children in sibling order
    pub fn children(&self, node_id: &str) -> Vec<String> {
        self.graph.get_children(node_id)
    }

    /// The node and every descendant, for subtree-wide operations
    pub fn subtree_ids(&self, node_id: &str) -> Vec<String> {
        let mut ids: Vec<String> = self.graph.get_descendants(node_id).into_iter().collect();
        ids.push(node_id.to_string());
        ids
    }

    pub fn contains(&self, node_id: &str) -> bool {
        self.graph.contains(node_id)
    }

    /// Current diagram artifact text
    pub fn graph_content(&self) -> String {
        std::fs::read_to_string(&self.diagram_path)
            .unwrap_or_else(|_| "graph TD\n    root[No graph generated yet]".to_string())
    }

    /// Render the Mermaid diagram. Best-effort: failures are logged.
    fn render(&self) {
        let content = self.render_to_string();
        if let Some(parent) = self.diagram_path.parent()
            && let Err(e) = std::fs::create_dir_all(parent)
        {
            warn!(error = %e, path = %self.diagram_path.display(), "render: failed to create diagram dir");
            return;
        }
        if let Err(e) = std::fs::write(&self.diagram_path, content) {
            warn!(error = %e, path = %self.diagram_path.display(), "render: failed to write diagram");
        }
    }

    /// Build the diagram text: node lines with status icons, solid DOWN
    /// edges, dotted RIGHT edges, and a style class per status.
    pub fn render_to_string(&self) -> String {
        let mut snapshot = self.graph.snapshot();
        snapshot.sort_by(|a, b| a.0.cmp(&b.0));

        let mut lines = vec!["graph TD".to_string()];

        for (node_id, meta, _) in &snapshot {
            let truncated: String = meta.r#abstract.chars().take(50).collect();
            let label = format!("{} {}", meta.status.icon(), truncated).replace('"', "'");
            lines.push(format!("    {node_id}[\"{label}\"]"));
        }

        for (node_id, _, _) in &snapshot {
            if let Some(down) = self.graph.neighbor(node_id, Direction::Down) {
                lines.push(format!("    {node_id} --> {down}"));
            }
            if let Some(right) = self.graph.neighbor(node_id, Direction::Right) {
                lines.push(format!("    {node_id} -.-> {right}"));
            }
        }

        lines.extend(
            [
                "",
                "    classDef completed fill:#2e7d32,stroke:#4caf50,stroke-width:3px,color:#ffffff",
                "    classDef working fill:#f57c00,stroke:#ff9800,stroke-width:3px,color:#ffffff",
                "    classDef planning fill:#1976d2,stroke:#2196f3,stroke-width:3px,color:#ffffff",
                "    classDef failed fill:#c62828,stroke:#f44336,stroke-width:3px,color:#ffffff",
                "    classDef cancelled fill:#616161,stroke:#9e9e9e,stroke-width:3px,color:#ffffff",
                "    classDef impossible fill:#6a1b9a,stroke:#9c27b0,stroke-width:3px,color:#ffffff",
                "    classDef pending fill:#37474f,stroke:#607d8b,stroke-width:2px,color:#e0e0e0",
            ]
            .map(String::from),
        );

        for (node_id, meta, _) in &snapshot {
            lines.push(format!("    class {node_id} {}", meta.status.as_str()));
        }

        lines.join("\n")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn sub(r#abstract: &str) -> SubTask {
        SubTask {
            r#abstract: r#abstract.to_string(),
            description: format!("{} description", r#abstract),
            verification: "done".to_string(),
            rationale: String::new(),
        }
    }

    fn trm() -> (TaskRelationManager, TempDir) {
        let dir = TempDir::new().unwrap();
        let trm = TaskRelationManager::new(dir.path().join("task.mermaid"));
        (trm, dir)
    }

    #[test]
    fn test_generate_node_id_format() {
        let (trm, _dir) = trm();
        let id = trm.generate_node_id();
        assert_eq!(id.len(), 7);
        assert!(id.starts_with('n'));
        assert!(id[1..].chars().all(|c| c.is_ascii_digit()));
    }

    #[test]
    fn test_add_sub_tasks_links_chain() {
        let (trm, _dir) = trm();
        trm.add_root("root", "Root task", "desc");

        let ids = trm
            .add_sub_tasks("root", &[sub("first"), sub("second"), sub("third")])
            .unwrap();
        assert_eq!(ids.len(), 3);

        // first child via DOWN, the rest via the RIGHT chain
        let children: Vec<String> = {
            let view = trm.tree_view();
            view["root"].children.clone()
        };
        assert_eq!(children, ids);
        assert_eq!(trm.parent_of(&ids[1]).as_deref(), Some("root"));
        assert_eq!(trm.parent_of(&ids[2]).as_deref(), Some("root"));
    }

    #[test]
    fn test_add_sub_tasks_missing_parent() {
        let (trm, _dir) = trm();
        assert!(trm.add_sub_tasks("ghost", &[sub("a")]).is_err());
    }

    #[test]
    fn test_upper_chain_advice_lists_completed_oldest_first() {
        let (trm, _dir) = trm();
        trm.add_root("root", "Assess example.com", "desc");
        let ids = trm
            .add_sub_tasks("root", &[sub("Port scan"), sub("Service fingerprint"), sub("Report")])
            .unwrap();

        trm.update_node_status(&ids[0], TaskStatus::Completed);
        trm.update_node_status(&ids[1], TaskStatus::Completed);

        let advice = trm.get_upper_chain_advice(&ids[2]);
        assert!(advice.contains("Parent task: Assess example.com"));
        let scan_pos = advice.find("Port scan").unwrap();
        let fp_pos = advice.find("Service fingerprint").unwrap();
        assert!(scan_pos < fp_pos, "oldest sibling should come first");
    }

    #[test]
    fn test_upper_chain_advice_skips_unfinished_siblings() {
        let (trm, _dir) = trm();
        trm.add_root("root", "Root", "desc");
        let ids = trm.add_sub_tasks("root", &[sub("done step"), sub("failed step"), sub("current")]).unwrap();

        trm.update_node_status(&ids[0], TaskStatus::Completed);
        trm.update_node_status(&ids[1], TaskStatus::Failed);

        let advice = trm.get_upper_chain_advice(&ids[2]);
        assert!(advice.contains("done step"));
        assert!(!advice.contains("failed step"));
    }

    #[test]
    fn test_credential_chain_order_and_filter() {
        let (trm, _dir) = trm();
        trm.add_root("root", "Crack the domain admin password", "desc");
        let ids = trm
            .add_sub_tasks(
                "root",
                &[sub("Dump NTLM hashes"), sub("Port scan"), sub("Use credentials")],
            )
            .unwrap();

        let chain = trm.get_credential_chain(&ids[2]);
        // LEFT siblings first (nearest first), then ancestors
        assert_eq!(chain.len(), 2);
        assert_eq!(chain[0].r#abstract, "Dump NTLM hashes");
        assert_eq!(chain[1].r#abstract, "Crack the domain admin password");
    }

    #[test]
    fn test_add_sibling_variant_splices() {
        let (trm, _dir) = trm();
        trm.add_root("root", "Root", "desc");
        let ids = trm.add_sub_tasks("root", &[sub("a"), sub("b")]).unwrap();

        let variant = trm.add_sibling_variant(&ids[0], "a-improved", "retry with fixes").unwrap();

        let view = trm.tree_view();
        assert_eq!(view["root"].children, vec![ids[0].clone(), variant.clone(), ids[1].clone()]);
    }

    #[test]
    fn test_move_node_to_new_parent() {
        let (trm, _dir) = trm();
        trm.add_root("root", "Root", "desc");
        let top = trm.add_sub_tasks("root", &[sub("recon"), sub("exploit")]).unwrap();
        let nested = trm.add_sub_tasks(&top[1], &[sub("payload")]).unwrap();

        trm.move_node_to_new_parent(&nested[0], &top[0], "failed exploit, retry from recon")
            .unwrap();

        let view = trm.tree_view();
        assert_eq!(view[&top[0]].children, vec![nested[0].clone()]);
        assert!(view[&top[1]].children.is_empty());
    }

    #[test]
    fn test_diagram_contains_nodes_edges_and_classes() {
        let (trm, _dir) = trm();
        trm.add_root("root", "Scan \"target\"", "desc");
        let ids = trm.add_sub_tasks("root", &[sub("a"), sub("b")]).unwrap();
        trm.update_node_status(&ids[0], TaskStatus::Completed);

        let diagram = trm.graph_content();
        assert!(diagram.starts_with("graph TD"));
        // Quotes are escaped to keep the label well-formed
        assert!(diagram.contains("⏳ Scan 'target'"));
        assert!(diagram.contains(&format!("root --> {}", ids[0])));
        assert!(diagram.contains(&format!("{} -.-> {}", ids[0], ids[1])));
        assert!(diagram.contains("classDef completed"));
        assert!(diagram.contains(&format!("class {} completed", ids[0])));
        assert!(diagram.contains(&format!("class {} pending", ids[1])));
    }

    #[test]
    fn test_render_survives_unwritable_path() {
        let trm = TaskRelationManager::new("/dev/null/not-a-dir/task.mermaid");
        trm.add_root("root", "Root", "desc");
        // No panic, and reads fall back to the placeholder
        assert!(trm.graph_content().contains("No graph generated yet"));
    }

    #[test]
    fn test_remove_node_drops_subtree() {
        let (trm, _dir) = trm();
        trm.add_root("root", "Root", "desc");
        let top = trm.add_sub_tasks("root", &[sub("a"), sub("b")]).unwrap();
        let nested = trm.add_sub_tasks(&top[0], &[sub("a1")]).unwrap();

        trm.remove_node(&top[0]).unwrap();
        assert!(!trm.contains(&top[0]));
        assert!(!trm.contains(&nested[0]));
        assert!(trm.contains(&top[1]));
    }

    #[test]
    fn test_root_id() {
        let (trm, _dir) = trm();
        trm.add_root("root", "Root", "desc");
        trm.add_sub_tasks("root", &[sub("a"), sub("b")]).unwrap();
        assert_eq!(trm.root_id().as_deref(), Some("root"));
    }
}
