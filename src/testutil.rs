//! Scripted fakes shared by unit tests

use std::collections::VecDeque;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;

use crate::agent::{OutputCallback, OutputKind};
use crate::container::{CommandRunner, ExecOutcome};
use crate::llm::{ChatMessage, LlmClient, LlmError};

/// LLM fake that replays a fixed script, then repeats a fallback line
pub struct ScriptedLlm {
    script: Mutex<VecDeque<String>>,
    fallback: String,
    calls: Mutex<Vec<Vec<ChatMessage>>>,
}

impl ScriptedLlm {
    pub fn new<I, S>(script: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            script: Mutex::new(script.into_iter().map(Into::into).collect()),
            fallback: "DONE: script exhausted".to_string(),
            calls: Mutex::new(Vec::new()),
        }
    }

    /// Always answer with the same line
    pub fn repeating(line: impl Into<String>) -> Self {
        Self {
            script: Mutex::new(VecDeque::new()),
            fallback: line.into(),
            calls: Mutex::new(Vec::new()),
        }
    }

    /// Conversations seen so far, in call order
    pub fn calls(&self) -> Vec<Vec<ChatMessage>> {
        self.calls.lock().unwrap().clone()
    }

    pub fn call_count(&self) -> usize {
        self.calls.lock().unwrap().len()
    }
}

#[async_trait]
impl LlmClient for ScriptedLlm {
    async fn chat(&self, messages: &[ChatMessage], _temperature: f32) -> Result<String, LlmError> {
        self.calls.lock().unwrap().push(messages.to_vec());
        let next = self.script.lock().unwrap().pop_front();
        Ok(next.unwrap_or_else(|| self.fallback.clone()))
    }
}

/// LLM fake that always fails, for circuit-breaker and fallback paths
pub struct FailingLlm;

#[async_trait]
impl LlmClient for FailingLlm {
    async fn chat(&self, _messages: &[ChatMessage], _temperature: f32) -> Result<String, LlmError> {
        Err(LlmError::RetriesExhausted {
            attempts: 5,
            last: "Rate limited (HTTP 429)".to_string(),
        })
    }
}

/// Command runner fake returning a constant output for every command
pub struct ScriptedRunner {
    output: String,
    commands: Mutex<Vec<String>>,
}

impl ScriptedRunner {
    pub fn constant(output: impl Into<String>) -> Self {
        Self {
            output: output.into(),
            commands: Mutex::new(Vec::new()),
        }
    }

    /// Commands executed so far, in order
    pub fn commands(&self) -> Vec<String> {
        self.commands.lock().unwrap().clone()
    }
}

#[async_trait]
impl CommandRunner for ScriptedRunner {
    async fn run(&self, cmd: &str) -> ExecOutcome {
        self.commands.lock().unwrap().push(cmd.to_string());
        ExecOutcome::plain(self.output.clone())
    }
}

/// Captures callback output per channel
#[derive(Clone)]
pub struct CollectedOutput {
    terminal: Arc<Mutex<Vec<String>>>,
    model: Arc<Mutex<Vec<String>>>,
}

impl CollectedOutput {
    pub fn new() -> Self {
        Self {
            terminal: Arc::new(Mutex::new(Vec::new())),
            model: Arc::new(Mutex::new(Vec::new())),
        }
    }

    pub fn callback(&self) -> OutputCallback {
        let terminal = self.terminal.clone();
        let model = self.model.clone();
        Arc::new(move |kind, content: &str| {
            let store = match kind {
                OutputKind::Terminal => &terminal,
                OutputKind::Model => &model,
            };
            store.lock().unwrap().push(content.to_string());
        })
    }

    pub fn terminal_entries(&self) -> Vec<String> {
        self.terminal.lock().unwrap().clone()
    }

    pub fn model_entries(&self) -> Vec<String> {
        self.model.lock().unwrap().clone()
    }
}
