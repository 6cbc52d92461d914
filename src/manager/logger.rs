//! Per-node log files
//!
//! Each node gets `<log-dir>/nodes/<task-id>/<node-id>.log`: a JSON metadata
//! header written exactly once at registration, then append-only timestamped
//! sections for terminal output and LLM responses. The reconcile loop reads
//! these files back as the evidence source for status repair.

use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use tracing::debug;

const SECTION_BAR: &str =
    "================================================================================";

/// Thread-safe writer for one node's log file
pub struct NodeLogger {
    log_path: PathBuf,
    lock: Mutex<()>,
}

impl NodeLogger {
    /// Create the logger and write the one-time metadata header
    pub fn new(log_dir: &Path, task_id: &str, node_id: &str, metadata: &serde_json::Value) -> std::io::Result<Self> {
        let log_path = log_dir.join("nodes").join(task_id).join(format!("{node_id}.log"));
        if let Some(parent) = log_path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let header = format!(
            "{bar}\nNODE METADATA (JSON)\n{bar}\n{meta}\n\n{bar}\nTERMINAL OUTPUT\n{bar}\n",
            bar = SECTION_BAR,
            meta = serde_json::to_string_pretty(metadata).unwrap_or_else(|_| "{}".to_string()),
        );
        std::fs::write(&log_path, header)?;

        Ok(Self {
            log_path,
            lock: Mutex::new(()),
        })
    }

    pub fn path(&self) -> &Path {
        &self.log_path
    }

    fn append(&self, content: &str) {
        let _guard = self.lock.lock().expect("logger lock poisoned");
        let result = std::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.log_path)
            .and_then(|mut f| f.write_all(content.as_bytes()));
        if let Err(e) = result {
            debug!(error = %e, path = %self.log_path.display(), "append: log write failed");
        }
    }

    /// Append a timestamped terminal chunk
    pub fn append_terminal(&self, content: &str) {
        let timestamp = chrono::Local::now().format("%Y-%m-%d %H:%M:%S");
        self.append(&format!("[{timestamp}] {content}\n"));
    }

    /// Append a timestamped LLM response under its own section heading
    pub fn append_llm(&self, content: &str) {
        let timestamp = chrono::Local::now().format("%Y-%m-%d %H:%M:%S");
        self.append(&format!(
            "\n{bar}\nLLM RESPONSES\n{bar}\n[{timestamp}]\n{content}\n\n",
            bar = SECTION_BAR,
        ));
    }

    /// Read the whole log file back
    pub fn content(&self) -> String {
        std::fs::read_to_string(&self.log_path).unwrap_or_else(|_| "No log file yet".to_string())
    }
}
