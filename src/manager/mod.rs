//! Task manager
//!
//! Owns every submitted task, the authoritative node registry, one relation
//! manager per task, per-node log writers, and the bounded worker pool.
//! Every status change flows through `update_node_status`, which writes the
//! `nodes` map first and then syncs the rendering copy in the relation
//! manager. Read paths join structure (TRM) with status (`nodes`), never
//! the other way around.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, Weak};

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::sync::Semaphore;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::agent::{OutputCallback, OutputKind};
use crate::config::{Config, ParallelConfig};
use crate::container::CommandRunner;
use crate::domain::{NodeRecord, TaskOutcome, TaskRecord, TaskSpec, TaskStatus};
use crate::limits::{limits, metrics};
use crate::llm::LlmClient;
use crate::node::{TaskError, TaskNode};
use crate::relation::TaskRelationManager;

mod logger;
mod reconcile;

pub use logger::NodeLogger;

/// One entry of the flat task/node listing
#[derive(Debug, Clone, Serialize)]
pub struct ListedEntry {
    #[serde(rename = "type")]
    pub kind: String,
    pub task_id: String,
    pub node_id: Option<String>,
    pub status: TaskStatus,
    pub r#abstract: String,
    pub parent_id: Option<String>,
    pub created_at: DateTime<Utc>,
    pub is_restartable: bool,
    pub terminal_outputs: Option<usize>,
    pub llm_responses: Option<usize>,
    pub root_node_id: Option<String>,
}

/// Full snapshot of one task for status queries
#[derive(Debug, Clone, Serialize)]
pub struct TaskStatusView {
    pub task_id: String,
    pub status: TaskStatus,
    pub r#abstract: String,
    pub description: String,
    pub verification: String,
    pub result: Option<String>,
    pub graph: Option<String>,
    pub created_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
    pub error: Option<String>,
    pub terminal_output: Vec<String>,
    pub llm_responses: Vec<String>,
    pub root_node_id: Option<String>,
}

/// One node in the hierarchical task listing (DFS order)
#[derive(Debug, Clone, Serialize)]
pub struct NodeTreeEntry {
    pub node_id: String,
    pub r#abstract: String,
    pub status: TaskStatus,
    pub depth: u32,
    pub parent_id: Option<String>,
    pub children: Vec<String>,
}

/// Detailed node snapshot
#[derive(Debug, Clone, Serialize)]
pub struct NodeDetails {
    pub node_id: String,
    pub task_id: String,
    pub status: TaskStatus,
    pub r#abstract: String,
    pub parent_id: Option<String>,
    pub depth: u32,
    pub terminal_output: Vec<String>,
    pub llm_responses: Vec<String>,
    pub created_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
    pub error: Option<String>,
}

/// Global task manager: source of truth for task and node state
pub struct TaskManager {
    config: Config,
    llm: Arc<dyn LlmClient>,
    runner: Arc<dyn CommandRunner>,

    tasks: Mutex<HashMap<String, TaskRecord>>,
    /// Authoritative node status store
    nodes: Mutex<HashMap<String, NodeRecord>>,
    trms: Mutex<HashMap<String, Arc<TaskRelationManager>>>,
    loggers: Mutex<HashMap<String, Arc<NodeLogger>>>,

    workers: Arc<Semaphore>,
    /// Back-reference handed to spawned workers and callbacks
    self_ref: Weak<TaskManager>,
}

impl TaskManager {
    pub fn new(config: Config, llm: Arc<dyn LlmClient>, runner: Arc<dyn CommandRunner>) -> Arc<Self> {
        let worker_count = limits().max_concurrent_tasks.max(1) as usize;

        for dir in [&config.storage.work_dir, &config.storage.log_dir] {
            if let Err(e) = std::fs::create_dir_all(dir) {
                warn!(error = %e, dir = %dir.display(), "failed to create storage dir");
            }
        }

        Arc::new_cyclic(|self_ref| Self {
            config,
            llm,
            runner,
            tasks: Mutex::new(HashMap::new()),
            nodes: Mutex::new(HashMap::new()),
            trms: Mutex::new(HashMap::new()),
            loggers: Mutex::new(HashMap::new()),
            workers: Arc::new(Semaphore::new(worker_count)),
            self_ref: self_ref.clone(),
        })
    }

    fn arc(&self) -> Arc<Self> {
        self.self_ref.upgrade().expect("manager dropped while in use")
    }

    pub fn parallel(&self) -> &ParallelConfig {
        &self.config.parallel
    }

    pub fn runner(&self) -> Arc<dyn CommandRunner> {
        self.runner.clone()
    }

    // === Task operations ===

    /// Create a new task and submit its root worker
    pub fn create_task(&self, spec: TaskSpec) -> String {
        let task_id = Uuid::new_v4().simple().to_string()[..8].to_string();
        info!(task_id, task = %spec.r#abstract, "create_task: submitting");

        let record = TaskRecord {
            task_id: task_id.clone(),
            status: TaskStatus::Pending,
            spec,
            created_at: Utc::now(),
            completed_at: None,
            result: None,
            error: None,
            diagram_path: self.config.storage.work_dir.join(format!("{task_id}.mermaid")),
            root_node_id: None,
            improvement_comments: None,
        };
        self.tasks.lock().expect("tasks lock poisoned").insert(task_id.clone(), record);

        let manager = self.arc();
        let id = task_id.clone();
        tokio::spawn(async move { manager.run_root(id).await });

        task_id
    }

    /// Background root worker: builds the relation manager and root node,
    /// then drives the tree to a terminal state.
    async fn run_root(self: Arc<Self>, task_id: String) {
        let (spec, diagram_path) = {
            let tasks = self.tasks.lock().expect("tasks lock poisoned");
            let Some(record) = tasks.get(&task_id) else {
                error!(task_id, "run_root: task disappeared before start");
                return;
            };
            (record.spec.clone(), record.diagram_path.clone())
        };

        self.set_task_status(&task_id, TaskStatus::Planning);

        let trm = Arc::new(TaskRelationManager::new(diagram_path));
        self.register_trm(&task_id, trm.clone());

        let root_node_id = trm.generate_node_id();
        trm.add_root(&root_node_id, &spec.r#abstract, &spec.description);
        self.register_node(&task_id, &root_node_id, &spec.r#abstract, None, 0);

        let root = TaskNode::new(
            spec,
            task_id.clone(),
            root_node_id,
            0,
            self.clone(),
            self.llm.clone(),
            self.runner.clone(),
        );

        match self.spawn_node(root).await {
            Ok(Ok(outcome)) => {
                info!(task_id, "run_root: task completed");
                self.finish_task(&task_id, TaskStatus::Completed, outcome.result, None);
            }
            Ok(Err(TaskError::Impossible(reason))) => {
                warn!(task_id, %reason, "run_root: task impossible");
                self.finish_task(&task_id, TaskStatus::Impossible, None, Some(reason));
            }
            Ok(Err(e)) => {
                error!(task_id, error = %e, "run_root: task failed");
                self.finish_task(&task_id, TaskStatus::Failed, None, Some(format!("{}: {e}", e.kind())));
            }
            Err(join_err) => {
                error!(task_id, error = %join_err, "run_root: root worker panicked");
                self.finish_task(&task_id, TaskStatus::Failed, None, Some(format!("worker panic: {join_err}")));
            }
        }
    }

    fn set_task_status(&self, task_id: &str, status: TaskStatus) {
        let mut tasks = self.tasks.lock().expect("tasks lock poisoned");
        if let Some(record) = tasks.get_mut(task_id)
            && !record.status.is_terminal()
        {
            record.status = status;
        }
    }

    /// Terminal task transition. A task already terminal (e.g. cancelled
    /// while running) keeps its state.
    fn finish_task(&self, task_id: &str, status: TaskStatus, result: Option<String>, error: Option<String>) {
        let mut tasks = self.tasks.lock().expect("tasks lock poisoned");
        if let Some(record) = tasks.get_mut(task_id) {
            if record.status.is_terminal() {
                debug!(task_id, "finish_task: already terminal, keeping existing state");
                return;
            }
            record.status = status;
            record.result = result;
            record.error = error;
            record.completed_at = Some(Utc::now());
        }
    }

    /// Snapshot of a task plus its root node's outputs and diagram
    pub fn get_task_status(&self, task_id: &str) -> Option<TaskStatusView> {
        let record = self.tasks.lock().expect("tasks lock poisoned").get(task_id).cloned()?;

        let graph = std::fs::read_to_string(&record.diagram_path).ok();

        let (terminal_output, llm_responses) = record
            .root_node_id
            .as_deref()
            .and_then(|root| {
                self.nodes
                    .lock()
                    .expect("nodes lock poisoned")
                    .get(root)
                    .map(|n| (n.terminal_output.clone(), n.llm_responses.clone()))
            })
            .unwrap_or_default();

        Some(TaskStatusView {
            task_id: record.task_id,
            status: record.status,
            r#abstract: record.spec.r#abstract,
            description: record.spec.description,
            verification: record.spec.verification,
            result: record.result,
            graph,
            created_at: record.created_at,
            completed_at: record.completed_at,
            error: record.error,
            terminal_output,
            llm_responses,
            root_node_id: record.root_node_id,
        })
    }

    /// Flat listing: one `root` entry per task followed by one `node` entry
    /// per node it owns. Node statuses come from the authoritative store.
    pub fn list_all_tasks(&self) -> Vec<ListedEntry> {
        let mut tasks: Vec<TaskRecord> = self.tasks.lock().expect("tasks lock poisoned").values().cloned().collect();
        tasks.sort_by_key(|t| t.created_at);

        let nodes = self.nodes.lock().expect("nodes lock poisoned").clone();
        let mut entries = Vec::new();

        for task in tasks {
            entries.push(ListedEntry {
                kind: "root".to_string(),
                task_id: task.task_id.clone(),
                node_id: None,
                status: task.status,
                r#abstract: task.spec.r#abstract.clone(),
                parent_id: None,
                created_at: task.created_at,
                is_restartable: task.status.is_restartable(),
                terminal_outputs: None,
                llm_responses: None,
                root_node_id: task.root_node_id.clone(),
            });

            let mut task_nodes: Vec<&NodeRecord> =
                nodes.values().filter(|n| n.task_id == task.task_id).collect();
            task_nodes.sort_by_key(|n| n.created_at);

            for node in task_nodes {
                entries.push(ListedEntry {
                    kind: "node".to_string(),
                    task_id: task.task_id.clone(),
                    node_id: Some(node.node_id.clone()),
                    status: node.status,
                    r#abstract: node.r#abstract.clone(),
                    parent_id: node.parent_id.clone(),
                    created_at: node.created_at,
                    is_restartable: node.status.is_restartable(),
                    terminal_outputs: Some(node.terminal_output.len()),
                    llm_responses: Some(node.llm_responses.len()),
                    root_node_id: None,
                });
            }
        }

        entries
    }

    /// Hierarchical node listing in DFS order: structure from the relation
    /// manager, statuses from the authoritative store.
    pub fn get_task_nodes(&self, task_id: &str) -> Vec<NodeTreeEntry> {
        let Some(trm) = self.trm(task_id) else {
            return Vec::new();
        };

        let tree = trm.tree_view();
        let statuses: HashMap<String, TaskStatus> = self
            .nodes
            .lock()
            .expect("nodes lock poisoned")
            .values()
            .filter(|n| n.task_id == task_id)
            .map(|n| (n.node_id.clone(), n.status))
            .collect();

        let Some(root) = trm.root_id() else {
            return Vec::new();
        };

        let mut entries = Vec::new();
        let mut stack = vec![(root, 0u32)];
        while let Some((node_id, depth)) = stack.pop() {
            let Some(node) = tree.get(&node_id) else {
                continue;
            };
            entries.push(NodeTreeEntry {
                node_id: node_id.clone(),
                r#abstract: node.r#abstract.clone(),
                status: statuses.get(&node_id).copied().unwrap_or(TaskStatus::Pending),
                depth,
                parent_id: node.parent_id.clone(),
                children: node.children.clone(),
            });
            for child in node.children.iter().rev() {
                stack.push((child.clone(), depth + 1));
            }
        }
        entries
    }

    /// Cancel a running task and every node it owns. Returns false when the
    /// task is unknown or already terminal (the second call is a no-op).
    pub fn cancel_task(&self, task_id: &str) -> bool {
        let cancelled = {
            let mut tasks = self.tasks.lock().expect("tasks lock poisoned");
            match tasks.get_mut(task_id) {
                Some(record) if !record.status.is_terminal() => {
                    record.status = TaskStatus::Cancelled;
                    record.completed_at = Some(Utc::now());
                    true
                }
                _ => false,
            }
        };

        if !cancelled {
            return false;
        }

        info!(task_id, "cancel_task: cancelling all nodes");
        for node_id in self.node_ids_of(task_id) {
            self.cancel_node(&node_id);
        }
        true
    }

    /// Force a task (and all its nodes) to completed
    pub fn mark_task_complete(&self, task_id: &str) -> bool {
        {
            let mut tasks = self.tasks.lock().expect("tasks lock poisoned");
            let Some(record) = tasks.get_mut(task_id) else {
                return false;
            };
            record.status = TaskStatus::Completed;
            record.completed_at = Some(Utc::now());
            record.result = Some("Manually marked as complete".to_string());
        }

        for node_id in self.node_ids_of(task_id) {
            self.mark_node_complete(&node_id);
        }
        true
    }

    /// Create a fresh task with the same spec, optionally extended with
    /// improvement comments. The original task is untouched.
    pub fn restart_task(&self, task_id: &str, comments: Option<&str>) -> Option<String> {
        let original = self.tasks.lock().expect("tasks lock poisoned").get(task_id).cloned()?;

        let mut spec = original.spec.clone();
        if let Some(comments) = comments.filter(|c| !c.is_empty()) {
            spec.description = format!("{}\n\nIMPROVEMENT NOTES:\n{comments}", spec.description);
        }

        let new_task_id = self.create_task(spec);
        if let Some(record) = self
            .tasks
            .lock()
            .expect("tasks lock poisoned")
            .get_mut(&new_task_id)
        {
            record.improvement_comments = comments.map(str::to_string);
        }
        Some(new_task_id)
    }

    // === Node operations ===

    /// Initialize a node record, create its logger, and sync the pending
    /// status to the relation manager.
    pub fn register_node(&self, task_id: &str, node_id: &str, r#abstract: &str, parent_id: Option<&str>, depth: u32) {
        let record = NodeRecord::new(task_id, node_id, r#abstract, parent_id, depth);
        let created_at = record.created_at;
        self.nodes
            .lock()
            .expect("nodes lock poisoned")
            .insert(node_id.to_string(), record);

        let metadata = serde_json::json!({
            "node_id": node_id,
            "task_id": task_id,
            "abstract": r#abstract,
            "parent_id": parent_id,
            "status": TaskStatus::Pending,
            "created_at": created_at,
        });
        match NodeLogger::new(&self.config.storage.log_dir, task_id, node_id, &metadata) {
            Ok(logger) => {
                debug!(node_id, path = %logger.path().display(), "register_node: logger created");
                self.loggers
                    .lock()
                    .expect("loggers lock poisoned")
                    .insert(node_id.to_string(), Arc::new(logger));
            }
            Err(e) => warn!(node_id, error = %e, "register_node: failed to create logger"),
        }

        if parent_id.is_none() {
            let mut tasks = self.tasks.lock().expect("tasks lock poisoned");
            if let Some(task) = tasks.get_mut(task_id) {
                task.root_node_id = Some(node_id.to_string());
            }
        }

        self.sync_status_to_trm(task_id, node_id, TaskStatus::Pending);
    }

    /// The one writer for node status. Terminal states are sticky: a second
    /// transition is ignored (restart creates a new node instead).
    pub fn update_node_status(&self, node_id: &str, status: TaskStatus, error: Option<&str>) -> bool {
        let task_id = {
            let mut nodes = self.nodes.lock().expect("nodes lock poisoned");
            let Some(record) = nodes.get_mut(node_id) else {
                return false;
            };
            if record.status.is_terminal() {
                debug!(node_id, current = %record.status, attempted = %status, "update_node_status: already terminal");
                return false;
            }
            record.status = status;
            if let Some(error) = error {
                record.error = Some(error.to_string());
            }
            if status.is_terminal() {
                record.completed_at = Some(Utc::now());
            }
            record.task_id.clone()
        };

        self.sync_status_to_trm(&task_id, node_id, status);
        true
    }

    fn sync_status_to_trm(&self, task_id: &str, node_id: &str, status: TaskStatus) {
        if let Some(trm) = self.trm(task_id) {
            trm.update_node_status(node_id, status);
        }
    }

    /// Cooperative cancellation: set the flag and the terminal status; the
    /// running worker observes the flag at its next check-point.
    pub fn cancel_node(&self, node_id: &str) -> bool {
        let task_id = {
            let mut nodes = self.nodes.lock().expect("nodes lock poisoned");
            let Some(record) = nodes.get_mut(node_id) else {
                return false;
            };
            if record.status.is_terminal() {
                return false;
            }
            record.cancelled = true;
            record.status = TaskStatus::Cancelled;
            record.completed_at = Some(Utc::now());
            record.task_id.clone()
        };

        metrics().increment("cancellations");
        self.sync_status_to_trm(&task_id, node_id, TaskStatus::Cancelled);
        true
    }

    /// Force a node to completed regardless of its current state
    pub fn mark_node_complete(&self, node_id: &str) -> bool {
        let task_id = {
            let mut nodes = self.nodes.lock().expect("nodes lock poisoned");
            let Some(record) = nodes.get_mut(node_id) else {
                return false;
            };
            record.status = TaskStatus::Completed;
            record.completed_at = Some(Utc::now());
            record.cancelled = false;
            record.task_id.clone()
        };

        self.sync_status_to_trm(&task_id, node_id, TaskStatus::Completed);
        true
    }

    /// Clear flags on a pending or cancelled node and mark it working
    pub fn force_start_node(&self, node_id: &str) -> bool {
        let task_id = {
            let mut nodes = self.nodes.lock().expect("nodes lock poisoned");
            let Some(record) = nodes.get_mut(node_id) else {
                return false;
            };
            if !matches!(record.status, TaskStatus::Pending | TaskStatus::Cancelled) {
                return false;
            }
            record.status = TaskStatus::Working;
            record.cancelled = false;
            record.error = None;
            record.completed_at = None;
            record.task_id.clone()
        };

        info!(node_id, "force_start_node");
        self.sync_status_to_trm(&task_id, node_id, TaskStatus::Working);
        true
    }

    /// Create a new node as the RIGHT sibling of the target, carrying an
    /// improved description. The original node is not mutated.
    pub fn restart_node(&self, node_id: &str, comments: Option<&str>) -> Option<String> {
        let (task_id, parent_id, r#abstract, depth) = {
            let nodes = self.nodes.lock().expect("nodes lock poisoned");
            let record = nodes.get(node_id)?;
            (
                record.task_id.clone(),
                record.parent_id.clone(),
                record.r#abstract.clone(),
                record.depth,
            )
        };

        let trm = self.trm(&task_id)?;

        let new_abstract = match comments.filter(|c| !c.is_empty()) {
            Some(comments) => {
                let short: String = comments.chars().take(50).collect();
                format!("{} [Improved: {short}]", r#abstract)
            }
            None => r#abstract,
        };
        let description = comments.filter(|c| !c.is_empty()).unwrap_or("Restarted node");

        let new_node_id = trm.add_sibling_variant(node_id, &new_abstract, description).ok()?;
        self.register_node(&task_id, &new_node_id, &new_abstract, parent_id.as_deref(), depth);
        info!(node_id, new_node_id, "restart_node: created sibling variant");
        Some(new_node_id)
    }

    /// Cancel and delete a node and its entire subtree from both the
    /// authoritative store and the relation manager.
    pub fn remove_node(&self, node_id: &str) -> bool {
        let task_id = {
            let nodes = self.nodes.lock().expect("nodes lock poisoned");
            match nodes.get(node_id) {
                Some(record) => record.task_id.clone(),
                None => return false,
            }
        };

        let Some(trm) = self.trm(&task_id) else {
            return false;
        };

        let subtree = trm.subtree_ids(node_id);
        for id in &subtree {
            self.cancel_node(id);
        }
        {
            let mut nodes = self.nodes.lock().expect("nodes lock poisoned");
            for id in &subtree {
                nodes.remove(id);
            }
        }
        {
            let mut loggers = self.loggers.lock().expect("loggers lock poisoned");
            for id in &subtree {
                loggers.remove(id);
            }
        }

        if let Err(e) = trm.remove_node(node_id) {
            warn!(node_id, error = %e, "remove_node: relation manager removal failed");
        }
        true
    }

    pub fn is_node_cancelled(&self, node_id: &str) -> bool {
        self.nodes
            .lock()
            .expect("nodes lock poisoned")
            .get(node_id)
            .map(|n| n.cancelled)
            .unwrap_or(false)
    }

    pub fn node_created_at(&self, node_id: &str) -> Option<DateTime<Utc>> {
        self.nodes
            .lock()
            .expect("nodes lock poisoned")
            .get(node_id)
            .map(|n| n.created_at)
    }

    /// Callback that mirrors every output chunk into the in-memory record
    /// and the node's log file.
    pub fn node_output_callback(&self, node_id: &str) -> OutputCallback {
        let manager = self.arc();
        let node_id = node_id.to_string();

        Arc::new(move |kind: OutputKind, content: &str| {
            {
                let mut nodes = manager.nodes.lock().expect("nodes lock poisoned");
                if let Some(record) = nodes.get_mut(&node_id) {
                    match kind {
                        OutputKind::Terminal => record.terminal_output.push(content.to_string()),
                        OutputKind::Model => record.llm_responses.push(content.to_string()),
                    }
                }
            }

            let logger = manager
                .loggers
                .lock()
                .expect("loggers lock poisoned")
                .get(&node_id)
                .cloned();
            if let Some(logger) = logger {
                match kind {
                    OutputKind::Terminal => logger.append_terminal(content),
                    OutputKind::Model => logger.append_llm(content),
                }
            }
        })
    }

    pub fn get_node_details(&self, node_id: &str) -> Option<NodeDetails> {
        let nodes = self.nodes.lock().expect("nodes lock poisoned");
        nodes.get(node_id).map(|record| NodeDetails {
            node_id: record.node_id.clone(),
            task_id: record.task_id.clone(),
            status: record.status,
            r#abstract: record.r#abstract.clone(),
            parent_id: record.parent_id.clone(),
            depth: record.depth,
            terminal_output: record.terminal_output.clone(),
            llm_responses: record.llm_responses.clone(),
            created_at: record.created_at,
            completed_at: record.completed_at,
            error: record.error.clone(),
        })
    }

    pub fn get_node_log(&self, node_id: &str) -> Option<String> {
        let logger = self
            .loggers
            .lock()
            .expect("loggers lock poisoned")
            .get(node_id)
            .cloned()?;
        Some(logger.content())
    }

    pub fn get_task_graph(&self, task_id: &str) -> Option<String> {
        let path = self
            .tasks
            .lock()
            .expect("tasks lock poisoned")
            .get(task_id)
            .map(|t| t.diagram_path.clone())?;
        std::fs::read_to_string(path).ok()
    }

    // === Worker pool ===

    /// Run a node on the worker pool under its depth-scaled timeout. A node
    /// that overruns is marked failed with reason `Execution timeout`.
    pub fn spawn_node(&self, node: Arc<TaskNode>) -> JoinHandle<Result<TaskOutcome, TaskError>> {
        let manager = self.arc();
        let workers = self.workers.clone();

        tokio::spawn(async move {
            let _permit = workers
                .acquire_owned()
                .await
                .map_err(|_| TaskError::Impossible("worker pool closed".to_string()))?;

            let budget = limits().node_timeout(node.depth());
            let node_id = node.node_id().to_string();

            match tokio::time::timeout(budget, node.clone().execute(None)).await {
                Ok(result) => result,
                Err(_) => {
                    warn!(node_id, budget_secs = budget.as_secs(), "spawn_node: node timed out");
                    manager.update_node_status(&node_id, TaskStatus::Failed, Some("Execution timeout"));
                    Err(TaskError::Impossible("Execution timeout".to_string()))
                }
            }
        })
    }

    // === Helpers ===

    /// Bind a relation manager to a task
    pub fn register_trm(&self, task_id: &str, trm: Arc<TaskRelationManager>) {
        self.trms.lock().expect("trms lock poisoned").insert(task_id.to_string(), trm);
    }

    pub(crate) fn trm(&self, task_id: &str) -> Option<Arc<TaskRelationManager>> {
        self.trms.lock().expect("trms lock poisoned").get(task_id).cloned()
    }

    fn node_ids_of(&self, task_id: &str) -> Vec<String> {
        self.nodes
            .lock()
            .expect("nodes lock poisoned")
            .values()
            .filter(|n| n.task_id == task_id)
            .map(|n| n.node_id.clone())
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testutil::{ScriptedLlm, ScriptedRunner};
    use tempfile::TempDir;

    fn manager() -> (Arc<TaskManager>, TempDir) {
        let dir = TempDir::new().unwrap();
        let config = Config {
            storage: crate::config::StorageConfig {
                work_dir: dir.path().join("work"),
                log_dir: dir.path().join("logs"),
            },
            ..Default::default()
        };
        let llm = Arc::new(ScriptedLlm::new(Vec::<String>::new()));
        let runner = Arc::new(ScriptedRunner::constant("ok"));
        (TaskManager::new(config, llm, runner), dir)
    }

    /// Register a task record + TRM without spawning the root worker
    fn seed_task(manager: &Arc<TaskManager>, task_id: &str) -> Arc<TaskRelationManager> {
        let diagram = manager.config.storage.work_dir.join(format!("{task_id}.mermaid"));
        let record = TaskRecord {
            task_id: task_id.to_string(),
            status: TaskStatus::Working,
            spec: TaskSpec::new("Root task", "desc", "done"),
            created_at: Utc::now(),
            completed_at: None,
            result: None,
            error: None,
            diagram_path: diagram.clone(),
            root_node_id: None,
            improvement_comments: None,
        };
        manager.tasks.lock().unwrap().insert(task_id.to_string(), record);

        let trm = Arc::new(TaskRelationManager::new(diagram));
        manager.trms.lock().unwrap().insert(task_id.to_string(), trm.clone());
        trm
    }

    #[tokio::test]
    async fn test_register_node_creates_logger_and_syncs_trm() {
        let (manager, _dir) = manager();
        let trm = seed_task(&manager, "task0001");
        trm.add_root("n000001", "Root task", "desc");

        manager.register_node("task0001", "n000001", "Root task", None, 0);

        let log = manager.get_node_log("n000001").unwrap();
        assert!(log.contains("NODE METADATA (JSON)"));
        assert!(log.contains("n000001"));

        // Root back-reference recorded on the task
        let record = manager.tasks.lock().unwrap().get("task0001").cloned().unwrap();
        assert_eq!(record.root_node_id.as_deref(), Some("n000001"));
    }

    #[tokio::test]
    async fn test_update_node_status_is_single_writer_and_sticky() {
        let (manager, _dir) = manager();
        let trm = seed_task(&manager, "task0001");
        trm.add_root("n000001", "Root task", "desc");
        manager.register_node("task0001", "n000001", "Root task", None, 0);

        assert!(manager.update_node_status("n000001", TaskStatus::Working, None));
        assert!(manager.update_node_status("n000001", TaskStatus::Failed, Some("boom")));

        let details = manager.get_node_details("n000001").unwrap();
        assert_eq!(details.status, TaskStatus::Failed);
        assert_eq!(details.error.as_deref(), Some("boom"));
        assert!(details.completed_at.is_some());

        // Terminal is sticky: no further transitions
        assert!(!manager.update_node_status("n000001", TaskStatus::Completed, None));
        assert_eq!(manager.get_node_details("n000001").unwrap().status, TaskStatus::Failed);

        // The rendering copy followed the authoritative store
        assert!(trm.render_to_string().contains("class n000001 failed"));
    }

    #[tokio::test]
    async fn test_cancel_task_is_idempotent() {
        let (manager, _dir) = manager();
        let trm = seed_task(&manager, "task0001");
        trm.add_root("n000001", "Root task", "desc");
        manager.register_node("task0001", "n000001", "Root task", None, 0);

        assert!(manager.cancel_task("task0001"));
        assert!(manager.is_node_cancelled("n000001"));

        // Second call is a no-op
        assert!(!manager.cancel_task("task0001"));
        assert!(!manager.cancel_task("missing"));
    }

    #[tokio::test]
    async fn test_restart_task_returns_new_id_and_keeps_original() {
        let (manager, _dir) = manager();
        seed_task(&manager, "task0001");

        let new_id = manager.restart_task("task0001", Some("try harder")).unwrap();
        assert_ne!(new_id, "task0001");

        let original = manager.tasks.lock().unwrap().get("task0001").cloned().unwrap();
        assert_eq!(original.status, TaskStatus::Working);
        assert!(original.improvement_comments.is_none());

        let restarted = manager.tasks.lock().unwrap().get(&new_id).cloned().unwrap();
        assert!(restarted.spec.description.contains("IMPROVEMENT NOTES"));
        assert!(restarted.spec.description.contains("try harder"));
        assert_eq!(restarted.improvement_comments.as_deref(), Some("try harder"));
    }

    #[tokio::test]
    async fn test_restart_node_creates_sibling_variant() {
        let (manager, _dir) = manager();
        let trm = seed_task(&manager, "task0001");
        trm.add_root("n000001", "Root task", "desc");
        manager.register_node("task0001", "n000001", "Root task", None, 0);

        let children = trm
            .add_sub_tasks(
                "n000001",
                &[crate::domain::SubTask {
                    r#abstract: "Port scan".to_string(),
                    description: "nmap".to_string(),
                    verification: "ports".to_string(),
                    rationale: String::new(),
                }],
            )
            .unwrap();
        manager.register_node("task0001", &children[0], "Port scan", Some("n000001"), 1);
        manager.update_node_status(&children[0], TaskStatus::Failed, Some("no output"));

        let variant = manager.restart_node(&children[0], Some("use -Pn")).unwrap();

        // The original stays terminal; the variant is a fresh pending node
        assert_eq!(manager.get_node_details(&children[0]).unwrap().status, TaskStatus::Failed);
        let details = manager.get_node_details(&variant).unwrap();
        assert_eq!(details.status, TaskStatus::Pending);
        assert!(details.r#abstract.contains("[Improved: use -Pn]"));
        assert_eq!(details.depth, 1);
    }

    #[tokio::test]
    async fn test_remove_node_drops_subtree_everywhere() {
        let (manager, _dir) = manager();
        let trm = seed_task(&manager, "task0001");
        trm.add_root("n000001", "Root task", "desc");
        manager.register_node("task0001", "n000001", "Root task", None, 0);

        let children = trm
            .add_sub_tasks(
                "n000001",
                &[
                    crate::domain::SubTask {
                        r#abstract: "a".to_string(),
                        description: "d".to_string(),
                        verification: "v".to_string(),
                        rationale: String::new(),
                    },
                    crate::domain::SubTask {
                        r#abstract: "b".to_string(),
                        description: "d".to_string(),
                        verification: "v".to_string(),
                        rationale: String::new(),
                    },
                ],
            )
            .unwrap();
        for id in &children {
            manager.register_node("task0001", id, "child", Some("n000001"), 1);
        }

        assert!(manager.remove_node(&children[0]));
        assert!(manager.get_node_details(&children[0]).is_none());
        assert!(!trm.contains(&children[0]));
        // Sibling survives
        assert!(manager.get_node_details(&children[1]).is_some());
        assert!(trm.contains(&children[1]));
    }

    #[tokio::test]
    async fn test_force_start_node_only_from_pending_or_cancelled() {
        let (manager, _dir) = manager();
        let trm = seed_task(&manager, "task0001");
        trm.add_root("n000001", "Root task", "desc");
        manager.register_node("task0001", "n000001", "Root task", None, 0);

        assert!(manager.force_start_node("n000001"));
        assert_eq!(manager.get_node_details("n000001").unwrap().status, TaskStatus::Working);

        // Working is not eligible
        assert!(!manager.force_start_node("n000001"));

        manager.cancel_node("n000001");
        assert!(manager.force_start_node("n000001"));
        assert!(!manager.is_node_cancelled("n000001"));
    }

    #[tokio::test]
    async fn test_list_all_tasks_joins_authoritative_status() {
        let (manager, _dir) = manager();
        let trm = seed_task(&manager, "task0001");
        trm.add_root("n000001", "Root task", "desc");
        manager.register_node("task0001", "n000001", "Root task", None, 0);
        manager.update_node_status("n000001", TaskStatus::Working, None);

        let entries = manager.list_all_tasks();
        assert_eq!(entries.len(), 2);
        assert_eq!(entries[0].kind, "root");
        assert_eq!(entries[1].kind, "node");
        assert_eq!(entries[1].status, TaskStatus::Working);
        assert_eq!(entries[1].node_id.as_deref(), Some("n000001"));
    }

    #[tokio::test]
    async fn test_get_task_nodes_dfs_order() {
        let (manager, _dir) = manager();
        let trm = seed_task(&manager, "task0001");
        trm.add_root("n000001", "Root task", "desc");
        manager.register_node("task0001", "n000001", "Root task", None, 0);

        let children = trm
            .add_sub_tasks(
                "n000001",
                &[
                    crate::domain::SubTask {
                        r#abstract: "first".to_string(),
                        description: "d".to_string(),
                        verification: "v".to_string(),
                        rationale: String::new(),
                    },
                    crate::domain::SubTask {
                        r#abstract: "second".to_string(),
                        description: "d".to_string(),
                        verification: "v".to_string(),
                        rationale: String::new(),
                    },
                ],
            )
            .unwrap();
        for id in &children {
            manager.register_node("task0001", id, "child", Some("n000001"), 1);
        }

        let entries = manager.get_task_nodes("task0001");
        assert_eq!(entries.len(), 3);
        assert_eq!(entries[0].node_id, "n000001");
        assert_eq!(entries[0].depth, 0);
        assert_eq!(entries[1].node_id, children[0]);
        assert_eq!(entries[1].depth, 1);
        assert_eq!(entries[2].node_id, children[1]);
    }

    #[tokio::test]
    async fn test_output_callback_writes_memory_and_log() {
        let (manager, _dir) = manager();
        let trm = seed_task(&manager, "task0001");
        trm.add_root("n000001", "Root task", "desc");
        manager.register_node("task0001", "n000001", "Root task", None, 0);

        let callback = manager.node_output_callback("n000001");
        callback(OutputKind::Terminal, "$ nmap target");
        callback(OutputKind::Model, "DONE: scanned");

        let details = manager.get_node_details("n000001").unwrap();
        assert_eq!(details.terminal_output, vec!["$ nmap target"]);
        assert_eq!(details.llm_responses, vec!["DONE: scanned"]);

        let log = manager.get_node_log("n000001").unwrap();
        assert!(log.contains("$ nmap target"));
        assert!(log.contains("DONE: scanned"));
    }
}
