//! Background status reconciliation
//!
//! Execution state and graph state can drift when a worker dies between
//! writing its log and reporting its status. This loop is the single
//! authority that repairs such drift: every tick it scans non-terminal
//! nodes and, where the node's log already contains the completion marker,
//! transitions the node to completed. No other background code writes to
//! terminal statuses post-hoc.

use std::time::Duration;

use tracing::{debug, info};

use crate::agent::DONE_MARKER;
use crate::domain::TaskStatus;

use super::TaskManager;

impl TaskManager {
    /// Run the reconciliation loop until the manager is dropped
    pub fn spawn_reconciler(&self, interval: Duration) -> tokio::task::JoinHandle<()> {
        let manager = self.self_ref.clone();
        info!(interval_secs = interval.as_secs(), "reconciler started");

        tokio::spawn(async move {
            loop {
                tokio::time::sleep(interval).await;
                let Some(manager) = manager.upgrade() else {
                    debug!("reconciler: manager dropped, exiting");
                    return;
                };
                let repaired = manager.reconcile_once();
                if repaired > 0 {
                    info!(repaired, "reconciler: repaired stuck node statuses");
                } else {
                    debug!("reconciler: tick, nothing to repair");
                }
            }
        })
    }

    /// One reconciliation tick. Returns the number of repaired nodes.
    pub fn reconcile_once(&self) -> usize {
        let candidates: Vec<String> = {
            let nodes = self.nodes.lock().expect("nodes lock poisoned");
            nodes
                .values()
                .filter(|n| !n.status.is_terminal())
                .map(|n| n.node_id.clone())
                .collect()
        };

        let mut repaired = 0;
        for node_id in candidates {
            let Some(log) = self.get_node_log(&node_id) else {
                continue;
            };
            if log.contains(DONE_MARKER) && self.update_node_status(&node_id, TaskStatus::Completed, None) {
                info!(node_id, "reconcile: log shows completion, repairing status");
                repaired += 1;
            }
        }
        repaired
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    use crate::agent::OutputKind;
    use crate::config::Config;
    use crate::domain::{TaskRecord, TaskSpec};
    use crate::relation::TaskRelationManager;
    use crate::testutil::{ScriptedLlm, ScriptedRunner};
    use chrono::Utc;
    use tempfile::TempDir;

    fn manager_with_node() -> (Arc<TaskManager>, Arc<TaskRelationManager>, TempDir) {
        let dir = TempDir::new().unwrap();
        let config = Config {
            storage: crate::config::StorageConfig {
                work_dir: dir.path().join("work"),
                log_dir: dir.path().join("logs"),
            },
            ..Default::default()
        };
        let manager = TaskManager::new(
            config,
            Arc::new(ScriptedLlm::new(Vec::<String>::new())),
            Arc::new(ScriptedRunner::constant("ok")),
        );

        let diagram = manager.config.storage.work_dir.join("task0001.mermaid");
        manager.tasks.lock().unwrap().insert(
            "task0001".to_string(),
            TaskRecord {
                task_id: "task0001".to_string(),
                status: crate::domain::TaskStatus::Working,
                spec: TaskSpec::new("Root", "desc", "done"),
                created_at: Utc::now(),
                completed_at: None,
                result: None,
                error: None,
                diagram_path: diagram.clone(),
                root_node_id: None,
                improvement_comments: None,
            },
        );
        let trm = Arc::new(TaskRelationManager::new(diagram));
        trm.add_root("n000001", "Root", "desc");
        manager.trms.lock().unwrap().insert("task0001".to_string(), trm.clone());
        manager.register_node("task0001", "n000001", "Root", None, 0);
        (manager, trm, dir)
    }

    #[tokio::test]
    async fn test_reconcile_repairs_done_in_log() {
        let (manager, trm, _dir) = manager_with_node();
        manager.update_node_status("n000001", TaskStatus::Working, None);

        // Worker wrote its completion marker but never reported status
        let callback = manager.node_output_callback("n000001");
        callback(OutputKind::Terminal, "=== TASK COMPLETED ===\nDONE: all replies received");

        let repaired = manager.reconcile_once();
        assert_eq!(repaired, 1);

        let details = manager.get_node_details("n000001").unwrap();
        assert_eq!(details.status, TaskStatus::Completed);
        assert!(details.completed_at.is_some());

        // The rendering copy was synced too
        assert!(trm.render_to_string().contains("class n000001 completed"));
    }

    #[tokio::test]
    async fn test_reconcile_ignores_terminal_and_markerless_nodes() {
        let (manager, _trm, _dir) = manager_with_node();

        // No marker in the log: nothing to repair
        assert_eq!(manager.reconcile_once(), 0);

        // Terminal node with a marker: still nothing (terminal is sticky)
        manager.update_node_status("n000001", TaskStatus::Failed, Some("gone wrong"));
        let callback = manager.node_output_callback("n000001");
        callback(OutputKind::Terminal, "DONE: too late");
        assert_eq!(manager.reconcile_once(), 0);
        assert_eq!(
            manager.get_node_details("n000001").unwrap().status,
            TaskStatus::Failed
        );
    }
}
