//! Core data model: task statuses, task specs, planner wire shapes, and
//! manager-side records.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Execution status shared by tasks and nodes
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TaskStatus {
    Pending,
    Planning,
    Working,
    Completed,
    Failed,
    Cancelled,
    Impossible,
}

impl TaskStatus {
    /// Terminal statuses admit no further transition (restart creates a new
    /// node instead of mutating a terminal one).
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            TaskStatus::Completed | TaskStatus::Failed | TaskStatus::Cancelled | TaskStatus::Impossible
        )
    }

    /// A failed, cancelled, or impossible task/node may be restarted.
    pub fn is_restartable(&self) -> bool {
        matches!(
            self,
            TaskStatus::Failed | TaskStatus::Cancelled | TaskStatus::Impossible
        )
    }

    /// Status icon used in the diagram artifact
    pub fn icon(&self) -> &'static str {
        match self {
            TaskStatus::Pending => "⏳",
            TaskStatus::Planning => "🧠",
            TaskStatus::Working => "⚙️",
            TaskStatus::Completed => "✅",
            TaskStatus::Failed => "❌",
            TaskStatus::Cancelled => "🚫",
            TaskStatus::Impossible => "⛔",
        }
    }

    /// Wire/diagram name (also the Mermaid class name)
    pub fn as_str(&self) -> &'static str {
        match self {
            TaskStatus::Pending => "pending",
            TaskStatus::Planning => "planning",
            TaskStatus::Working => "working",
            TaskStatus::Completed => "completed",
            TaskStatus::Failed => "failed",
            TaskStatus::Cancelled => "cancelled",
            TaskStatus::Impossible => "impossible",
        }
    }
}

impl Default for TaskStatus {
    fn default() -> Self {
        TaskStatus::Pending
    }
}

impl std::fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A task as submitted: one-line abstract, detailed description, and the
/// criteria used to verify completion.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskSpec {
    pub r#abstract: String,
    pub description: String,
    pub verification: String,
}

impl TaskSpec {
    pub fn new(
        r#abstract: impl Into<String>,
        description: impl Into<String>,
        verification: impl Into<String>,
    ) -> Self {
        Self {
            r#abstract: r#abstract.into(),
            description: description.into(),
            verification: verification.into(),
        }
    }
}

/// One entry of a planner-produced chain. Ordering is significant: later
/// siblings see earlier siblings as context.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SubTask {
    pub r#abstract: String,
    pub description: String,
    pub verification: String,
    /// Why this step is needed
    #[serde(default)]
    pub rationale: String,
}

impl SubTask {
    pub fn spec(&self) -> TaskSpec {
        TaskSpec::new(&self.r#abstract, &self.description, &self.verification)
    }
}

/// Ordered chain of sub-tasks plus the overall strategy
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskChain {
    #[serde(default)]
    pub strategy: String,
    pub tasks: Vec<SubTask>,
}

/// Planner decision: branch into the chain, or run the single task directly
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BranchDecision {
    pub needs_branching: bool,
    #[serde(default)]
    pub reasoning: String,
    pub task_chain: TaskChain,
}

impl BranchDecision {
    /// Conservative single-task plan wrapping the input verbatim. Used when
    /// the planner output cannot be parsed or the circuit breaker is open.
    pub fn single(spec: &TaskSpec, reasoning: impl Into<String>) -> Self {
        Self {
            needs_branching: false,
            reasoning: reasoning.into(),
            task_chain: TaskChain {
                strategy: "Execute directly".to_string(),
                tasks: vec![SubTask {
                    r#abstract: spec.r#abstract.clone(),
                    description: spec.description.clone(),
                    verification: spec.verification.clone(),
                    rationale: "Direct execution".to_string(),
                }],
            },
        }
    }
}

/// Result of a completed (sub)tree of work
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskOutcome {
    pub task_id: String,
    pub r#abstract: String,
    pub description: String,
    pub verification: String,
    pub status: TaskStatus,
    pub result: Option<String>,
    pub graph: Option<String>,
    pub created_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub error: Option<String>,
}

/// Manager-side row for a submitted task
#[derive(Debug, Clone)]
pub struct TaskRecord {
    pub task_id: String,
    pub status: TaskStatus,
    pub spec: TaskSpec,
    pub created_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
    pub result: Option<String>,
    pub error: Option<String>,
    pub diagram_path: std::path::PathBuf,
    pub root_node_id: Option<String>,
    pub improvement_comments: Option<String>,
}

/// Manager-side row for a node. This is the authoritative status store; the
/// relation manager carries a duplicate for rendering only.
#[derive(Debug, Clone)]
pub struct NodeRecord {
    pub task_id: String,
    pub node_id: String,
    pub status: TaskStatus,
    pub r#abstract: String,
    pub parent_id: Option<String>,
    pub depth: u32,
    pub terminal_output: Vec<String>,
    pub llm_responses: Vec<String>,
    pub created_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
    pub error: Option<String>,
    pub cancelled: bool,
}

impl NodeRecord {
    pub fn new(task_id: &str, node_id: &str, r#abstract: &str, parent_id: Option<&str>, depth: u32) -> Self {
        Self {
            task_id: task_id.to_string(),
            node_id: node_id.to_string(),
            status: TaskStatus::Pending,
            r#abstract: r#abstract.to_string(),
            parent_id: parent_id.map(str::to_string),
            depth,
            terminal_output: Vec::new(),
            llm_responses: Vec::new(),
            created_at: Utc::now(),
            completed_at: None,
            error: None,
            cancelled: false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_terminal() {
        assert!(TaskStatus::Completed.is_terminal());
        assert!(TaskStatus::Failed.is_terminal());
        assert!(TaskStatus::Cancelled.is_terminal());
        assert!(TaskStatus::Impossible.is_terminal());
        assert!(!TaskStatus::Pending.is_terminal());
        assert!(!TaskStatus::Planning.is_terminal());
        assert!(!TaskStatus::Working.is_terminal());
    }

    #[test]
    fn test_status_serde_round_trip() {
        let json = serde_json::to_string(&TaskStatus::Impossible).unwrap();
        assert_eq!(json, "\"impossible\"");
        let status: TaskStatus = serde_json::from_str("\"working\"").unwrap();
        assert_eq!(status, TaskStatus::Working);
    }

    #[test]
    fn test_branch_decision_deserialize() {
        let json = r#"{
            "needs_branching": true,
            "reasoning": "multi-step recon",
            "task_chain": {
                "strategy": "passive then active",
                "tasks": [
                    {"abstract": "Passive DNS", "description": "crt.sh lookup", "verification": "subdomain list", "rationale": "no touch"},
                    {"abstract": "Active enum", "description": "subfinder", "verification": "merged list", "rationale": "coverage"}
                ]
            }
        }"#;

        let decision: BranchDecision = serde_json::from_str(json).unwrap();
        assert!(decision.needs_branching);
        assert_eq!(decision.task_chain.tasks.len(), 2);
        assert_eq!(decision.task_chain.tasks[0].r#abstract, "Passive DNS");
    }

    #[test]
    fn test_single_plan_wraps_input_verbatim() {
        let spec = TaskSpec::new("Ping 8.8.8.8", "Send 3 ICMP pings", "See 3 replies");
        let plan = BranchDecision::single(&spec, "planner unavailable");
        assert!(!plan.needs_branching);
        assert_eq!(plan.task_chain.tasks.len(), 1);
        assert_eq!(plan.task_chain.tasks[0].r#abstract, "Ping 8.8.8.8");
        assert_eq!(plan.task_chain.tasks[0].verification, "See 3 replies");
    }
}
