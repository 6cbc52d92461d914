//! Process-wide execution limits and kill-switch metrics
//!
//! Limits are soft kill-switches: they bound runaway loops without
//! hard-killing processes (which could corrupt sandbox state). They are read
//! from the environment at boot and can be replaced atomically at runtime.
//! Metrics are monotonic counters recording every kill-switch hit.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{LazyLock, RwLock};
use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Configurable execution limits
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ExecutionLimits {
    // Executor loop
    /// Max conversation turns per leaf
    pub mcp_max_iterations: u32,
    /// Consecutive empty outputs before the reminder nudge
    pub mcp_empty_output_threshold: u32,
    /// Consecutive comment-only replies before force-stop
    pub mcp_comment_only_threshold: u32,

    // LLM gateway
    /// Max attempts per LLM call
    pub llm_max_retries: u32,
    /// Base delay for exponential backoff (seconds)
    pub llm_base_delay: u64,
    /// Max seconds per LLM HTTP call
    pub llm_call_timeout: u64,

    // Task node
    /// Max attempts for direct execution
    pub task_direct_retries: u32,
    /// Max branching replans before giving up
    pub task_max_replans: u32,
    /// Consecutive planner failures before the circuit breaker opens
    pub task_llm_failure_threshold: u32,
    /// Leaf execution budget at depth 0 (seconds)
    pub task_base_timeout: u64,
    /// Additional budget per tree level (seconds)
    pub task_depth_timeout_increment: u64,

    // Concurrency
    /// Worker pool size (soft limit; staggering controls real parallelism)
    pub max_concurrent_tasks: u32,
    /// Max simultaneously in-flight LLM calls
    pub max_llm_concurrent: u32,

    // Sandbox command safety
    /// Max seconds per container exec
    pub docker_exec_timeout: u64,
    /// Stop the command at the timeout instead of abandoning it
    pub docker_kill_on_timeout: bool,

    // Observability
    pub enable_metrics: bool,
    /// Warn on commands exceeding 50% of the exec budget
    pub log_slow_commands: bool,
}

impl Default for ExecutionLimits {
    fn default() -> Self {
        Self {
            mcp_max_iterations: 20,
            mcp_empty_output_threshold: 5,
            mcp_comment_only_threshold: 5,
            llm_max_retries: 5,
            llm_base_delay: 2,
            llm_call_timeout: 90,
            task_direct_retries: 3,
            task_max_replans: 2,
            task_llm_failure_threshold: 3,
            task_base_timeout: 1800,
            task_depth_timeout_increment: 600,
            max_concurrent_tasks: 100,
            max_llm_concurrent: 5,
            docker_exec_timeout: 300,
            docker_kill_on_timeout: false,
            enable_metrics: true,
            log_slow_commands: true,
        }
    }
}

fn env_u32(name: &str, default: u32) -> u32 {
    std::env::var(name).ok().and_then(|v| v.parse().ok()).unwrap_or(default)
}

fn env_u64(name: &str, default: u64) -> u64 {
    std::env::var(name).ok().and_then(|v| v.parse().ok()).unwrap_or(default)
}

fn env_bool(name: &str, default: bool) -> bool {
    std::env::var(name)
        .ok()
        .map(|v| v.eq_ignore_ascii_case("true") || v == "1")
        .unwrap_or(default)
}

impl ExecutionLimits {
    /// Build limits from environment variables, falling back to defaults
    pub fn from_env() -> Self {
        let d = Self::default();
        Self {
            mcp_max_iterations: env_u32("MCP_MAX_ITERATIONS", d.mcp_max_iterations),
            mcp_empty_output_threshold: env_u32("MCP_EMPTY_THRESHOLD", d.mcp_empty_output_threshold),
            mcp_comment_only_threshold: env_u32("MCP_COMMENT_THRESHOLD", d.mcp_comment_only_threshold),
            llm_max_retries: env_u32("LLM_MAX_RETRIES", d.llm_max_retries),
            llm_base_delay: env_u64("LLM_BASE_DELAY", d.llm_base_delay),
            llm_call_timeout: env_u64("LLM_CALL_TIMEOUT", d.llm_call_timeout),
            task_direct_retries: env_u32("TASK_DIRECT_RETRIES", d.task_direct_retries),
            task_max_replans: env_u32("TASK_MAX_REPLANS", d.task_max_replans),
            task_llm_failure_threshold: env_u32("TASK_LLM_FAILURE_THRESHOLD", d.task_llm_failure_threshold),
            task_base_timeout: env_u64("TASK_BASE_TIMEOUT", d.task_base_timeout),
            task_depth_timeout_increment: env_u64("TASK_DEPTH_TIMEOUT_INCREMENT", d.task_depth_timeout_increment),
            max_concurrent_tasks: env_u32("MAX_CONCURRENT_TASKS", d.max_concurrent_tasks),
            max_llm_concurrent: env_u32("MAX_LLM_CONCURRENT", d.max_llm_concurrent),
            docker_exec_timeout: env_u64("DOCKER_EXEC_TIMEOUT", d.docker_exec_timeout),
            docker_kill_on_timeout: env_bool("DOCKER_KILL_ON_TIMEOUT", d.docker_kill_on_timeout),
            enable_metrics: env_bool("ENABLE_METRICS", d.enable_metrics),
            log_slow_commands: env_bool("LOG_SLOW_COMMANDS", d.log_slow_commands),
        }
    }

    /// Leaf execution budget at the given tree depth
    pub fn node_timeout(&self, depth: u32) -> Duration {
        Duration::from_secs(self.task_base_timeout + self.task_depth_timeout_increment * depth as u64)
    }

    pub fn llm_call_timeout(&self) -> Duration {
        Duration::from_secs(self.llm_call_timeout)
    }

    pub fn docker_exec_timeout(&self) -> Duration {
        Duration::from_secs(self.docker_exec_timeout)
    }

    /// Backoff before retry attempt `attempt` (1-based): base × 2^(attempt-1)
    pub fn llm_backoff(&self, attempt: u32) -> Duration {
        Duration::from_secs(self.llm_base_delay * 2u64.pow(attempt.saturating_sub(1)))
    }
}

static LIMITS: LazyLock<RwLock<ExecutionLimits>> = LazyLock::new(|| RwLock::new(ExecutionLimits::from_env()));

/// Snapshot of the current process-wide limits
pub fn limits() -> ExecutionLimits {
    LIMITS.read().expect("limits lock poisoned").clone()
}

/// Replace the process-wide limits atomically
pub fn update_limits(new: ExecutionLimits) {
    *LIMITS.write().expect("limits lock poisoned") = new;
}

/// Kill-switch hit counters. Thread-safe, monotonically non-decreasing,
/// reset only by explicit request.
#[derive(Debug, Default)]
pub struct ExecutionMetrics {
    mcp_timeouts: AtomicU64,
    mcp_iteration_limits: AtomicU64,
    mcp_comment_loops: AtomicU64,
    llm_rate_limits: AtomicU64,
    llm_failures: AtomicU64,
    llm_circuit_breaks: AtomicU64,
    task_retries_exhausted: AtomicU64,
    task_impossible: AtomicU64,
    cancellations: AtomicU64,
    docker_timeouts: AtomicU64,
    docker_slow_commands: AtomicU64,
}

/// Grouped snapshot of all counters
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MetricsSnapshot {
    pub mcp: McpMetrics,
    pub llm: LlmMetrics,
    pub task: TaskMetrics,
    pub cancellations: u64,
    pub docker: DockerMetrics,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct McpMetrics {
    pub timeouts: u64,
    pub iteration_limits: u64,
    pub comment_loops: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LlmMetrics {
    pub rate_limits: u64,
    pub failures: u64,
    pub circuit_breaks: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskMetrics {
    pub retries_exhausted: u64,
    pub impossible: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DockerMetrics {
    pub timeouts: u64,
    pub slow_commands: u64,
}

impl ExecutionMetrics {
    fn counter(&self, name: &str) -> Option<&AtomicU64> {
        match name {
            "mcp_timeouts" => Some(&self.mcp_timeouts),
            "mcp_iteration_limits" => Some(&self.mcp_iteration_limits),
            "mcp_comment_loops" => Some(&self.mcp_comment_loops),
            "llm_rate_limits" => Some(&self.llm_rate_limits),
            "llm_failures" => Some(&self.llm_failures),
            "llm_circuit_breaks" => Some(&self.llm_circuit_breaks),
            "task_retries_exhausted" => Some(&self.task_retries_exhausted),
            "task_impossible" => Some(&self.task_impossible),
            "cancellations" => Some(&self.cancellations),
            "docker_timeouts" => Some(&self.docker_timeouts),
            "docker_slow_commands" => Some(&self.docker_slow_commands),
            _ => None,
        }
    }

    /// Increment a counter by name. Unknown names are ignored.
    pub fn increment(&self, name: &str) {
        if !limits().enable_metrics {
            return;
        }
        match self.counter(name) {
            Some(c) => {
                c.fetch_add(1, Ordering::Relaxed);
            }
            None => tracing::warn!(metric = name, "increment: unknown metric name"),
        }
    }

    /// Current value of a counter by name
    pub fn get(&self, name: &str) -> u64 {
        self.counter(name).map(|c| c.load(Ordering::Relaxed)).unwrap_or(0)
    }

    /// Grouped snapshot of all counters
    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            mcp: McpMetrics {
                timeouts: self.mcp_timeouts.load(Ordering::Relaxed),
                iteration_limits: self.mcp_iteration_limits.load(Ordering::Relaxed),
                comment_loops: self.mcp_comment_loops.load(Ordering::Relaxed),
            },
            llm: LlmMetrics {
                rate_limits: self.llm_rate_limits.load(Ordering::Relaxed),
                failures: self.llm_failures.load(Ordering::Relaxed),
                circuit_breaks: self.llm_circuit_breaks.load(Ordering::Relaxed),
            },
            task: TaskMetrics {
                retries_exhausted: self.task_retries_exhausted.load(Ordering::Relaxed),
                impossible: self.task_impossible.load(Ordering::Relaxed),
            },
            cancellations: self.cancellations.load(Ordering::Relaxed),
            docker: DockerMetrics {
                timeouts: self.docker_timeouts.load(Ordering::Relaxed),
                slow_commands: self.docker_slow_commands.load(Ordering::Relaxed),
            },
        }
    }

    /// Zero every counter
    pub fn reset(&self) {
        for name in [
            "mcp_timeouts",
            "mcp_iteration_limits",
            "mcp_comment_loops",
            "llm_rate_limits",
            "llm_failures",
            "llm_circuit_breaks",
            "task_retries_exhausted",
            "task_impossible",
            "cancellations",
            "docker_timeouts",
            "docker_slow_commands",
        ] {
            if let Some(c) = self.counter(name) {
                c.store(0, Ordering::Relaxed);
            }
        }
    }
}

static METRICS: LazyLock<ExecutionMetrics> = LazyLock::new(ExecutionMetrics::default);

/// Process-wide metrics tracker
pub fn metrics() -> &'static ExecutionMetrics {
    &METRICS
}
