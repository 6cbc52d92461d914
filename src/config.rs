//! RedHive configuration types and loading

use eyre::{Context, Result};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};

/// Main RedHive configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// LLM endpoint configuration
    pub llm: LlmConfig,

    /// Sandbox container configuration
    pub container: ContainerConfig,

    /// Staggered parallel execution settings
    pub parallel: ParallelConfig,

    /// Working/log directory layout
    pub storage: StorageConfig,
}

impl Config {
    /// Load configuration. An explicit path must parse; otherwise the first
    /// readable candidate wins and everything else falls back to defaults.
    pub fn load(config_path: Option<&PathBuf>) -> Result<Self> {
        if let Some(path) = config_path {
            return Self::parse_file(path).with_context(|| format!("Failed to load config from {}", path.display()));
        }

        for candidate in Self::candidate_paths() {
            if !candidate.exists() {
                continue;
            }
            match Self::parse_file(&candidate) {
                Ok(config) => return Ok(config),
                Err(e) => tracing::warn!(path = %candidate.display(), error = %e, "skipping unreadable config"),
            }
        }

        tracing::info!("No config file found, using defaults");
        Ok(Self::default())
    }

    /// Project-local config first, then the user config dir
    fn candidate_paths() -> Vec<PathBuf> {
        let mut candidates = vec![PathBuf::from(".redhive.yml")];
        if let Some(config_dir) = dirs::config_dir() {
            candidates.push(config_dir.join("redhive").join("redhive.yml"));
        }
        candidates
    }

    fn parse_file(path: &Path) -> Result<Self> {
        let content = fs::read_to_string(path).with_context(|| format!("Failed to read {}", path.display()))?;
        let config = serde_yaml::from_str(&content).with_context(|| format!("Failed to parse {}", path.display()))?;
        tracing::info!(path = %path.display(), "config loaded");
        Ok(config)
    }
}

/// LLM endpoint configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LlmConfig {
    /// Model identifier
    pub model: String,

    /// Environment variable containing the API key
    #[serde(rename = "api-key-env")]
    pub api_key_env: String,

    /// API base URL (the chat-completions path is appended)
    #[serde(rename = "base-url")]
    pub base_url: String,
}

impl Default for LlmConfig {
    fn default() -> Self {
        Self {
            model: "kimi-k2-0905-preview".to_string(),
            api_key_env: "MOONSHOT_API_KEY".to_string(),
            base_url: "https://api.moonshot.ai/v1".to_string(),
        }
    }
}

/// Sandbox container configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ContainerConfig {
    /// Name of the sandbox container, shared by all tasks
    pub name: String,

    /// Package-install command prefix for missing tools
    #[serde(rename = "install-command")]
    pub install_command: String,
}

impl Default for ContainerConfig {
    fn default() -> Self {
        Self {
            name: "redhive-kali".to_string(),
            install_command: "apt-get update && apt-get install -y".to_string(),
        }
    }
}

/// Staggered parallel execution settings
///
/// Submission of child batches is smeared across minutes so start-up bursts
/// stay under the vendor's request-per-minute quota.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ParallelConfig {
    /// Children submitted per batch
    #[serde(rename = "stagger-batch-size")]
    pub stagger_batch_size: u32,

    /// Wall-clock delay between batches (seconds)
    #[serde(rename = "stagger-delay-secs")]
    pub stagger_delay_secs: u64,

    /// Prefix sandbox file names with the node id to avoid collisions
    #[serde(rename = "use-node-prefixes")]
    pub use_node_prefixes: bool,

    /// Status reconciliation tick interval (seconds)
    #[serde(rename = "reconcile-interval-secs")]
    pub reconcile_interval_secs: u64,
}

impl Default for ParallelConfig {
    fn default() -> Self {
        Self {
            stagger_batch_size: 2,
            stagger_delay_secs: 180,
            use_node_prefixes: true,
            reconcile_interval_secs: 300,
        }
    }
}

impl ParallelConfig {
    /// Environment overrides on top of the loaded values
    pub fn with_env_overrides(mut self) -> Self {
        if let Ok(v) = std::env::var("STAGGER_BATCH_SIZE")
            && let Ok(n) = v.parse()
        {
            self.stagger_batch_size = n;
        }
        if let Ok(v) = std::env::var("STAGGER_DELAY")
            && let Ok(n) = v.parse()
        {
            self.stagger_delay_secs = n;
        }
        if let Ok(v) = std::env::var("RECONCILE_INTERVAL")
            && let Ok(n) = v.parse()
        {
            self.reconcile_interval_secs = n;
        }
        self
    }

    pub fn stagger_delay(&self) -> std::time::Duration {
        std::time::Duration::from_secs(self.stagger_delay_secs)
    }
}

/// Working/log directory layout
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageConfig {
    /// Diagram artifacts and task-level logs
    #[serde(rename = "work-dir")]
    pub work_dir: PathBuf,

    /// Per-node log files
    #[serde(rename = "log-dir")]
    pub log_dir: PathBuf,
}

impl Default for StorageConfig {
    fn default() -> Self {
        let base = dirs::data_local_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join("redhive");
        Self {
            work_dir: base.join("work"),
            log_dir: base.join("logs"),
        }
    }
}
