//! LLM gateway module
//!
//! The `LlmClient` trait is the seam every caller goes through: planner,
//! critic, digester, and the executor loop all hold an `Arc<dyn LlmClient>`,
//! so tests drive them with scripted fakes while production uses the
//! rate-limited HTTP gateway.

use async_trait::async_trait;

mod error;
mod gateway;
mod types;

pub use error::LlmError;
pub use gateway::LlmGateway;
pub use types::{ChatMessage, Role};

/// A chat-completions client
#[async_trait]
pub trait LlmClient: Send + Sync {
    /// Return the assistant's next message for the given conversation
    async fn chat(&self, messages: &[ChatMessage], temperature: f32) -> Result<String, LlmError>;
}
