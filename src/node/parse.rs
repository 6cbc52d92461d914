//! Parsing of duck-typed JSON at the LLM boundary
//!
//! Model responses at the planner/critic/digester boundary arrive as raw
//! objects, code-fenced objects, or JSON with prose around it. Every parse
//! failure falls back to a conservative default; no error escapes these
//! paths.

use crate::domain::BranchDecision;

/// Extract the first balanced `{…}` block, falling back to stripping a
/// triple-fenced block.
pub fn extract_json(response: &str) -> Option<String> {
    let response = response.trim();

    if let Some(block) = balanced_block(response) {
        return Some(block.to_string());
    }

    for fence in ["```json", "```"] {
        if let Some(start) = response.find(fence) {
            let body_start = start + fence.len();
            if let Some(end) = response[body_start..].find("```") {
                return Some(response[body_start..body_start + end].trim().to_string());
            }
        }
    }

    None
}

/// First brace-balanced block anywhere in the text
fn balanced_block(text: &str) -> Option<&str> {
    let start = text.find('{')?;
    let mut depth = 0usize;
    for (offset, ch) in text[start..].char_indices() {
        match ch {
            '{' => depth += 1,
            '}' => {
                depth -= 1;
                if depth == 0 {
                    return Some(&text[start..start + offset + ch.len_utf8()]);
                }
            }
            _ => {}
        }
    }
    None
}

/// Parse the planner's branching decision. `None` means the caller should
/// fall back to a single-task plan.
pub fn parse_branch_decision(response: &str) -> Option<BranchDecision> {
    let json = extract_json(response)?;
    serde_json::from_str(&json).ok()
}

/// Parse the critic verdict. Anything unparseable counts as not met.
pub fn parse_criteria_met(response: &str) -> bool {
    extract_json(response)
        .and_then(|json| serde_json::from_str::<serde_json::Value>(&json).ok())
        .and_then(|value| value.get("criteria_met").and_then(|v| v.as_bool()))
        .unwrap_or(false)
}

/// Parse the digester summary. `None` means the caller should truncate the
/// raw transcript instead.
pub fn parse_digest(response: &str) -> Option<String> {
    extract_json(response)
        .and_then(|json| serde_json::from_str::<serde_json::Value>(&json).ok())
        .and_then(|value| value.get("summary").and_then(|v| v.as_str()).map(str::to_string))
}
