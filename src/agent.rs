//! Executor loop for leaf tasks
//!
//! Alternates model-produced shell commands with sandbox outputs until the
//! model emits a terminal marker. Three kill-switches bound a misbehaving
//! model: an iteration budget, a consecutive comment-only threshold, and a
//! consecutive empty-output threshold.

use std::sync::Arc;
use std::sync::LazyLock;

use regex::Regex;
use tracing::{debug, info, warn};

use crate::container::CommandRunner;
use crate::domain::TaskSpec;
use crate::limits::{limits, metrics};
use crate::llm::{ChatMessage, LlmClient, LlmError};

/// Output channel tag for the per-node callback
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OutputKind {
    /// Command lines and sandbox output
    Terminal,
    /// Raw model text
    Model,
}

/// Receives every chunk a node produces, tagged by channel
pub type OutputCallback = Arc<dyn Fn(OutputKind, &str) + Send + Sync>;

/// Cooperative cancellation probe, checked at the start of each iteration
pub type CancelCheck = Arc<dyn Fn() -> bool + Send + Sync>;

/// Leaf success marker; the rest of the line is the model's summary
pub const DONE_MARKER: &str = "DONE:";
/// Leaf refusal marker; bypasses the critic and marks the node impossible
pub const IMPOSSIBLE_MARKER: &str = "IMPOSSIBLE:";

/// Drives one leaf task against the sandbox
pub struct ExecAgent {
    llm: Arc<dyn LlmClient>,
    runner: Arc<dyn CommandRunner>,
    output: OutputCallback,
    cancelled: CancelCheck,
}

impl ExecAgent {
    pub fn new(
        llm: Arc<dyn LlmClient>,
        runner: Arc<dyn CommandRunner>,
        output: OutputCallback,
        cancelled: CancelCheck,
    ) -> Self {
        Self {
            llm,
            runner,
            output,
            cancelled,
        }
    }

    fn emit(&self, kind: OutputKind, content: &str) {
        (self.output)(kind, content);
    }

    /// Run the command/output loop until a terminal marker or kill-switch.
    /// Returns the full transcript; only fatal LLM errors propagate.
    pub async fn execute_task(&self, spec: &TaskSpec, system_prompt: &str) -> Result<String, LlmError> {
        let l = limits();
        let mut conversation = vec![
            ChatMessage::system(system_prompt),
            ChatMessage::user(format!("Begin working on this task: {}", spec.r#abstract)),
        ];

        let mut transcript: Vec<String> = Vec::new();
        let mut empty_count = 0u32;
        let mut comment_count = 0u32;

        for iteration in 1..=l.mcp_max_iterations {
            if (self.cancelled)() {
                let msg = "\n[SYSTEM] Task cancelled.\n".to_string();
                transcript.push(msg.clone());
                self.emit(OutputKind::Terminal, &msg);
                return Ok(transcript.join("\n"));
            }

            let response = self.llm.chat(&conversation, 0.0).await?;
            conversation.push(ChatMessage::assistant(&response));
            self.emit(OutputKind::Model, &response);

            let cmd = extract_command(&response);
            debug!(iteration, cmd = %cmd.chars().take(120).collect::<String>(), "next command");

            // Footers carry the full marker line so transcript consumers
            // (trust-DONE shortcut, reconcile loop) can grep for it.
            if cmd.starts_with(DONE_MARKER) {
                let msg = format!("\n=== TASK COMPLETED ===\n{cmd}\n");
                transcript.push(msg.clone());
                self.emit(OutputKind::Terminal, &msg);
                return Ok(transcript.join("\n"));
            }

            if cmd.starts_with(IMPOSSIBLE_MARKER) {
                let msg = format!("\n=== TASK IMPOSSIBLE ===\n{cmd}\n");
                transcript.push(msg.clone());
                self.emit(OutputKind::Terminal, &msg);
                return Ok(transcript.join("\n"));
            }

            if is_comment_only(&cmd) {
                comment_count += 1;

                if comment_count >= l.mcp_comment_only_threshold {
                    metrics().increment("mcp_comment_loops");
                    let msg = format!(
                        "\n[SYSTEM] Task terminated - stuck in comment-only loop after {} attempts.\n",
                        l.mcp_comment_only_threshold
                    );
                    transcript.push(msg.clone());
                    self.emit(OutputKind::Terminal, &msg);
                    warn!(iteration, "comment-only loop kill-switch fired");
                    return Ok(transcript.join("\n"));
                }

                let feedback = "[SYSTEM] Your last output was only a comment. Please provide an actual \
                                command to execute, or respond with 'DONE: reason' if the task cannot be completed.";
                let entry = format!("$ {cmd}\n{feedback}\n");
                transcript.push(entry.clone());
                self.emit(OutputKind::Terminal, &entry);
                conversation.push(ChatMessage::user(feedback));
                continue;
            }
            comment_count = 0;

            let exec = self.runner.run(&cmd).await;
            let entry = format!("$ {cmd}\n{}\n", exec.output);
            transcript.push(entry.clone());
            self.emit(OutputKind::Terminal, &entry);

            if exec.output.trim().len() < 10 {
                empty_count += 1;
            } else {
                empty_count = 0;
            }

            if empty_count >= l.mcp_empty_output_threshold {
                let msg = format!(
                    "\n[SYSTEM] Task appears stuck - no meaningful output after {} iterations. If you \
                     cannot make progress, respond with 'DONE: Unable to complete - reason'.\n",
                    l.mcp_empty_output_threshold
                );
                transcript.push(msg.clone());
                self.emit(OutputKind::Terminal, &msg);
                conversation.push(ChatMessage::user(&msg));
                empty_count = 0;
            }

            conversation.push(ChatMessage::user(format!("Command output:\n{}", exec.output)));
        }

        metrics().increment("mcp_iteration_limits");
        let msg = format!(
            "\n[SYSTEM] Reached maximum iteration limit ({}). Task incomplete.\n",
            l.mcp_max_iterations
        );
        transcript.push(msg.clone());
        self.emit(OutputKind::Terminal, &msg);
        info!("iteration budget exhausted");
        Ok(transcript.join("\n"))
    }
}

static FENCE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?s)```(?:bash|sh)?\s*\n(.*?)\n?```").expect("valid fence regex"));

/// Conversational lead-ins the model sometimes wraps around commands
const CHATTY_PHRASES: [&str; 11] = [
    "let me", "i will", "i need to", "i'll", "first,", "next,", "now,", "i apologize", "i see", "i notice", "sorry",
];

/// Extract the executable command from a model response: terminal markers
/// pass through, fenced blocks are unwrapped, chatty lines are dropped.
fn extract_command(response: &str) -> String {
    let response = response.trim();

    if response.starts_with(DONE_MARKER) || response.starts_with(IMPOSSIBLE_MARKER) {
        return response.to_string();
    }

    if let Some(captures) = FENCE.captures(response) {
        return captures[1].trim().to_string();
    }

    for line in response.lines() {
        let line = line.trim();
        if line.is_empty() {
            continue;
        }
        let lowered = line.to_lowercase();
        if CHATTY_PHRASES.iter().any(|phrase| lowered.contains(phrase)) {
            continue;
        }
        return line.to_string();
    }

    response.to_string()
}

/// True when every non-empty line is a `#` comment
fn is_comment_only(cmd: &str) -> bool {
    cmd.lines()
        .map(str::trim)
        .filter(|line| !line.is_empty())
        .all(|line| line.starts_with('#'))
}
