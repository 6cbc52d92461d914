//! Task node state machine
//!
//! A node collects context from its relatives, asks the planner whether to
//! decompose, and either drives the executor loop directly or spawns child
//! nodes under the staggered scheduler. Failed attempts retry with advice
//! feedback; failed plans are replanned under a bounded budget; anything
//! past the budgets raises `Impossible` for the parent to handle.

use std::sync::Arc;
use std::sync::atomic::{AtomicU32, Ordering};
use std::time::Duration;

use chrono::Utc;
use futures::future::BoxFuture;
use thiserror::Error;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::agent::{CancelCheck, DONE_MARKER, ExecAgent, IMPOSSIBLE_MARKER};
use crate::container::CommandRunner;
use crate::domain::{BranchDecision, TaskChain, TaskOutcome, TaskSpec, TaskStatus};
use crate::limits::{limits, metrics};
use crate::llm::{ChatMessage, LlmClient, LlmError};
use crate::manager::TaskManager;

pub mod parse;
pub mod prompts;
mod review;

/// Planner runs warmer than the executor/critic/digester (which run at 0)
const PLANNER_TEMPERATURE: f32 = 0.3;

/// Buffer a parent adds on top of child timeouts and stagger time
const CHILD_WAIT_BUFFER: Duration = Duration::from_secs(600);

/// Task-level execution errors
#[derive(Debug, Error)]
pub enum TaskError {
    /// Verification criteria not met; internal to direct execution retries
    #[error("verification criteria not met: {0}")]
    NeedRetry(String),

    /// Retries/replans exhausted or cancellation observed; ancestors may
    /// replan or re-raise
    #[error("{0}")]
    Impossible(String),

    /// The LLM gateway exhausted its retries
    #[error("{0}")]
    Llm(#[from] LlmError),
}

impl TaskError {
    /// Error-kind name prepended when a root failure becomes a task error
    pub fn kind(&self) -> &'static str {
        match self {
            TaskError::NeedRetry(_) => "NeedRetry",
            TaskError::Impossible(_) => "Impossible",
            TaskError::Llm(_) => "LLMFailure",
        }
    }
}

/// One node in a task's execution tree
pub struct TaskNode {
    spec: TaskSpec,
    task_id: String,
    node_id: String,
    depth: u32,
    manager: Arc<TaskManager>,
    llm: Arc<dyn LlmClient>,
    runner: Arc<dyn CommandRunner>,
    /// Consecutive planner failures feeding the circuit breaker
    llm_failures: AtomicU32,
}

impl TaskNode {
    pub fn new(
        spec: TaskSpec,
        task_id: String,
        node_id: String,
        depth: u32,
        manager: Arc<TaskManager>,
        llm: Arc<dyn LlmClient>,
        runner: Arc<dyn CommandRunner>,
    ) -> Arc<Self> {
        Arc::new(Self {
            spec,
            task_id,
            node_id,
            depth,
            manager,
            llm,
            runner,
            llm_failures: AtomicU32::new(0),
        })
    }

    pub fn node_id(&self) -> &str {
        &self.node_id
    }

    pub fn depth(&self) -> u32 {
        self.depth
    }

    /// Main entry point. Boxed because branching recurses through child
    /// nodes. Terminal errors set the node status before propagating.
    pub fn execute(self: Arc<Self>, rebranch_hint: Option<String>) -> BoxFuture<'static, Result<TaskOutcome, TaskError>> {
        Box::pin(async move {
            let result = self.run(rebranch_hint).await;

            match &result {
                Ok(_) => {}
                Err(TaskError::Impossible(reason)) => {
                    if self.cancelled() {
                        self.set_status(TaskStatus::Cancelled, Some(reason));
                    } else if self.set_status(TaskStatus::Impossible, Some(reason)) {
                        metrics().increment("task_impossible");
                    }
                }
                Err(e) => {
                    self.set_status(TaskStatus::Failed, Some(&e.to_string()));
                }
            }

            result
        })
    }

    async fn run(&self, rebranch_hint: Option<String>) -> Result<TaskOutcome, TaskError> {
        if self.cancelled() {
            return Err(TaskError::Impossible("Node was cancelled".to_string()));
        }

        let l = limits();
        let mut hint = rebranch_hint;
        let mut replans = 0u32;

        loop {
            let advice = self.collect_advice(hint.as_deref());
            self.set_status(TaskStatus::Planning, None);
            let plan = self.plan(&advice).await;

            if plan.task_chain.tasks.len() > 1 {
                info!(
                    node_id = %self.node_id,
                    children = plan.task_chain.tasks.len(),
                    strategy = %plan.task_chain.strategy,
                    "branching into sub-tasks"
                );
                match self.branch_and_execute(&plan.task_chain).await {
                    Err(TaskError::Impossible(reason)) if replans < l.task_max_replans && !self.cancelled() => {
                        replans += 1;
                        warn!(
                            node_id = %self.node_id,
                            replans,
                            %reason,
                            "child subtree impossible, replanning"
                        );
                        self.remove_children();
                        hint = Some(format!(
                            "Previous plan failed: {reason}. Attempt {}/{}",
                            replans + 1,
                            l.task_max_replans + 1
                        ));
                    }
                    other => return other,
                }
            } else {
                return self.direct_execute(advice).await;
            }
        }
    }

    // === Planner ===

    /// Ask the planner for a branching decision. Planner failures never
    /// escape: the circuit breaker and parse fallbacks both degrade to a
    /// single-task plan wrapping the input verbatim.
    async fn plan(&self, advice: &str) -> BranchDecision {
        let l = limits();

        if self.llm_failures.load(Ordering::Relaxed) >= l.task_llm_failure_threshold {
            metrics().increment("llm_circuit_breaks");
            warn!(node_id = %self.node_id, "planner circuit breaker open, bypassing call");
            return BranchDecision::single(&self.spec, "Planner circuit breaker open");
        }

        let messages = [
            ChatMessage::system(prompts::PLANNER_SYSTEM_PROMPT),
            ChatMessage::user(prompts::planner_user_prompt(&self.spec, advice)),
        ];

        match self.llm.chat(&messages, PLANNER_TEMPERATURE).await {
            Ok(response) => {
                self.llm_failures.store(0, Ordering::Relaxed);
                match parse::parse_branch_decision(&response) {
                    Some(decision) if !decision.task_chain.tasks.is_empty() => decision,
                    _ => {
                        debug!(node_id = %self.node_id, "unparseable planner response, using single-task plan");
                        BranchDecision::single(&self.spec, "Failed to parse planner response")
                    }
                }
            }
            Err(e) => {
                let failures = self.llm_failures.fetch_add(1, Ordering::Relaxed) + 1;
                warn!(node_id = %self.node_id, error = %e, failures, "planner call failed");
                BranchDecision::single(&self.spec, format!("Planner failed: {e}"))
            }
        }
    }

    // === Direct execution ===

    /// Run the executor loop against the sandbox, up to the retry budget,
    /// feeding failure advice back into each attempt.
    async fn direct_execute(&self, mut advice: String) -> Result<TaskOutcome, TaskError> {
        self.set_status(TaskStatus::Working, None);
        let retries = limits().task_direct_retries.max(1);

        for attempt in 1..=retries {
            if self.cancelled() {
                return Err(TaskError::Impossible("Node was cancelled".to_string()));
            }

            match self.direct_attempt(&advice).await {
                Ok(outcome) => return Ok(outcome),
                Err(TaskError::NeedRetry(reason)) => {
                    debug!(node_id = %self.node_id, attempt, %reason, "attempt failed, retrying with feedback");
                    advice.push_str(&format!(
                        "\n\nPrevious attempt {attempt} failed: {reason}\nTry a different approach."
                    ));
                }
                Err(e) => return Err(e),
            }
        }

        metrics().increment("task_retries_exhausted");
        self.set_status(
            TaskStatus::Failed,
            Some(&format!("Failed after {retries} attempts: verification criteria not met")),
        );
        Err(TaskError::Impossible(format!(
            "Failed after {retries} attempts: verification criteria not met"
        )))
    }

    async fn direct_attempt(&self, advice: &str) -> Result<TaskOutcome, TaskError> {
        let agent = ExecAgent::new(
            self.llm.clone(),
            self.runner.clone(),
            self.manager.node_output_callback(&self.node_id),
            self.cancel_check(),
        );

        let system_prompt = prompts::executor_system_prompt(&self.spec, advice);
        let transcript = agent.execute_task(&self.spec, &system_prompt).await?;

        if self.cancelled() {
            return Err(TaskError::Impossible("Node was cancelled".to_string()));
        }

        // A refusal marker bypasses the critic entirely
        if let Some(reason) = transcript
            .lines()
            .find_map(|line| line.trim().strip_prefix(IMPOSSIBLE_MARKER))
        {
            return Err(TaskError::Impossible(format!("Model refusal: {}", reason.trim())));
        }

        // Trust a completion marker; only markerless transcripts face the critic
        let verified = transcript.contains(DONE_MARKER)
            || review::check_task_result(&self.llm, &self.spec, &transcript).await?;

        if !verified {
            return Err(TaskError::NeedRetry("verification criteria not met".to_string()));
        }

        let summary = review::digest_result(&self.llm, &self.spec, &transcript).await?;
        self.set_status(TaskStatus::Completed, None);
        Ok(self.outcome(Some(summary)))
    }

    // === Branch execution ===

    /// Spawn a child node per plan entry, dispatch them in staggered
    /// batches, and aggregate their results by sub-task index.
    async fn branch_and_execute(&self, chain: &TaskChain) -> Result<TaskOutcome, TaskError> {
        self.set_status(TaskStatus::Working, None);

        let trm = self
            .manager
            .trm(&self.task_id)
            .ok_or_else(|| TaskError::Impossible("no relation manager for task".to_string()))?;

        let child_ids = trm
            .add_sub_tasks(&self.node_id, &chain.tasks)
            .map_err(|e| TaskError::Impossible(e.to_string()))?;
        let child_depth = self.depth + 1;

        let mut children = Vec::with_capacity(child_ids.len());
        for (sub, id) in chain.tasks.iter().zip(&child_ids) {
            self.manager
                .register_node(&self.task_id, id, &sub.r#abstract, Some(&self.node_id), child_depth);
            children.push(TaskNode::new(
                sub.spec(),
                self.task_id.clone(),
                id.clone(),
                child_depth,
                self.manager.clone(),
                self.llm.clone(),
                self.runner.clone(),
            ));
        }

        let parallel = self.manager.parallel().clone();
        let batch_size = parallel.stagger_batch_size.max(1) as usize;

        let mut handles = Vec::with_capacity(children.len());
        for (batch_index, batch) in children.chunks(batch_size).enumerate() {
            if batch_index > 0 {
                debug!(
                    node_id = %self.node_id,
                    batch_index,
                    delay_secs = parallel.stagger_delay_secs,
                    "stagger: waiting before next batch"
                );
                tokio::time::sleep(parallel.stagger_delay()).await;
            }
            for child in batch {
                handles.push(self.manager.spawn_node(child.clone()));
            }
        }

        // Wait budget: the deepest child's own timeout, plus the stagger
        // offsets already spent, plus a fixed buffer.
        let batches = children.len().div_ceil(batch_size);
        let total_stagger = parallel
            .stagger_delay()
            .checked_mul(batches.saturating_sub(1) as u32)
            .unwrap_or_default();
        let deadline = Instant::now() + limits().node_timeout(child_depth) + total_stagger + CHILD_WAIT_BUFFER;

        let mut outcomes = Vec::with_capacity(handles.len());
        let mut first_failure: Option<TaskError> = None;

        for (handle, child) in handles.into_iter().zip(&children) {
            let remaining = deadline.saturating_duration_since(Instant::now());
            let result = match tokio::time::timeout(remaining, handle).await {
                Ok(Ok(result)) => result,
                Ok(Err(join_err)) => Err(TaskError::Impossible(format!("child worker panicked: {join_err}"))),
                Err(_) => {
                    self.manager
                        .update_node_status(child.node_id(), TaskStatus::Failed, Some("Execution timeout"));
                    Err(TaskError::Impossible("Execution timeout".to_string()))
                }
            };

            match result {
                Ok(outcome) => outcomes.push(outcome),
                Err(e) => {
                    warn!(child = %child.node_id(), error = %e, "child node failed");
                    if first_failure.is_none() {
                        first_failure = Some(e);
                    }
                }
            }
        }

        if let Some(failure) = first_failure {
            return Err(failure);
        }

        let outcome = if outcomes.len() == 1 {
            outcomes.pop().expect("one outcome")
        } else {
            let combined = outcomes
                .iter()
                .enumerate()
                .map(|(index, o)| {
                    format!(
                        "[{}] {}: {}",
                        index + 1,
                        o.r#abstract,
                        o.result.as_deref().unwrap_or("(no result)")
                    )
                })
                .collect::<Vec<_>>()
                .join("\n\n");
            self.outcome(Some(combined))
        };

        self.set_status(TaskStatus::Completed, None);
        Ok(outcome)
    }

    /// Drop the current children before a replan
    fn remove_children(&self) {
        if let Some(trm) = self.manager.trm(&self.task_id) {
            for child in trm.children(&self.node_id) {
                self.manager.remove_node(&child);
            }
        }
    }

    // === Context ===

    /// Build the advice string: replan hint, then upper-chain context, then
    /// the credential chain listing.
    fn collect_advice(&self, hint: Option<&str>) -> String {
        let mut parts = Vec::new();

        if let Some(hint) = hint {
            parts.push(format!("REPLANNING NOTE: {hint}"));
        }

        if let Some(trm) = self.manager.trm(&self.task_id) {
            let chain = trm.get_upper_chain_advice(&self.node_id);
            if !chain.is_empty() {
                parts.push(chain);
            }

            let credentials = trm.get_credential_chain(&self.node_id);
            if !credentials.is_empty() {
                let mut lines = vec!["Credential-related prior work:".to_string()];
                lines.extend(
                    credentials
                        .iter()
                        .map(|hit| format!("  - [{}] {}", hit.node_id, hit.r#abstract)),
                );
                parts.push(lines.join("\n"));
            }
        }

        parts.join("\n\n")
    }

    // === Helpers ===

    fn cancelled(&self) -> bool {
        self.manager.is_node_cancelled(&self.node_id)
    }

    fn cancel_check(&self) -> CancelCheck {
        let manager = self.manager.clone();
        let node_id = self.node_id.clone();
        Arc::new(move || manager.is_node_cancelled(&node_id))
    }

    fn set_status(&self, status: TaskStatus, error: Option<&str>) -> bool {
        self.manager.update_node_status(&self.node_id, status, error)
    }

    fn outcome(&self, result: Option<String>) -> TaskOutcome {
        TaskOutcome {
            task_id: self.task_id.clone(),
            r#abstract: self.spec.r#abstract.clone(),
            description: self.spec.description.clone(),
            verification: self.spec.verification.clone(),
            status: TaskStatus::Completed,
            result,
            graph: self.manager.trm(&self.task_id).map(|trm| trm.graph_content()),
            created_at: self.manager.node_created_at(&self.node_id),
            completed_at: Some(Utc::now()),
            error: None,
        }
    }
}
