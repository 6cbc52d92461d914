//! Critic and digester calls
//!
//! Both run at temperature 0 over a capped transcript prefix. Unparseable
//! responses degrade to conservative defaults; only gateway failures
//! propagate.

use std::sync::Arc;

use tracing::debug;

use crate::domain::TaskSpec;
use crate::llm::{ChatMessage, LlmClient, LlmError};

use super::parse::{parse_criteria_met, parse_digest};
use super::prompts;

/// Digest fallback length when the summarizer output cannot be parsed
const DIGEST_FALLBACK_CHARS: usize = 200;

/// Ask the critic whether the task's verification criteria are met
pub async fn check_task_result(
    llm: &Arc<dyn LlmClient>,
    spec: &TaskSpec,
    transcript: &str,
) -> Result<bool, LlmError> {
    let messages = [
        ChatMessage::system(prompts::CRITIC_SYSTEM_PROMPT),
        ChatMessage::user(prompts::critic_user_prompt(spec, transcript)),
    ];

    let response = llm.chat(&messages, 0.0).await?;
    let met = parse_criteria_met(&response);
    debug!(met, "check_task_result: critic verdict");
    Ok(met)
}

/// Digest the raw transcript into a short result summary
pub async fn digest_result(llm: &Arc<dyn LlmClient>, spec: &TaskSpec, transcript: &str) -> Result<String, LlmError> {
    let messages = [
        ChatMessage::system(prompts::DIGESTER_SYSTEM_PROMPT),
        ChatMessage::user(prompts::digester_user_prompt(spec, transcript)),
    ];

    let response = llm.chat(&messages, 0.0).await?;
    Ok(parse_digest(&response).unwrap_or_else(|| {
        debug!("digest_result: unparseable summary, truncating transcript");
        transcript.chars().take(DIGEST_FALLBACK_CHARS).collect()
    }))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testutil::ScriptedLlm;

    fn spec() -> TaskSpec {
        TaskSpec::new("Scan", "Run nmap", "Open ports listed")
    }

    #[tokio::test]
    async fn test_critic_accepts_fenced_verdict() {
        let llm: Arc<dyn LlmClient> =
            Arc::new(ScriptedLlm::new(["```json\n{\"criteria_met\": true, \"reasoning\": \"ok\"}\n```"]));
        assert!(check_task_result(&llm, &spec(), "transcript").await.unwrap());
    }

    #[tokio::test]
    async fn test_critic_unparseable_is_not_met() {
        let llm: Arc<dyn LlmClient> = Arc::new(ScriptedLlm::new(["looks good to me!"]));
        assert!(!check_task_result(&llm, &spec(), "transcript").await.unwrap());
    }

    #[tokio::test]
    async fn test_digest_parses_summary() {
        let llm: Arc<dyn LlmClient> = Arc::new(ScriptedLlm::new([r#"{"summary": "Found 2 open ports."}"#]));
        let summary = digest_result(&llm, &spec(), "transcript").await.unwrap();
        assert_eq!(summary, "Found 2 open ports.");
    }

    #[tokio::test]
    async fn test_digest_fallback_truncates_transcript() {
        let llm: Arc<dyn LlmClient> = Arc::new(ScriptedLlm::new(["no json in sight"]));
        let transcript = "t".repeat(500);
        let summary = digest_result(&llm, &spec(), &transcript).await.unwrap();
        assert_eq!(summary.len(), DIGEST_FALLBACK_CHARS);
    }
}
