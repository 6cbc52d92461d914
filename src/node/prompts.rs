//! System prompts for the planner, executor, critic, and digester stages

use crate::domain::TaskSpec;

/// Transcript prefix cap for critic/digester input
pub const TRANSCRIPT_CAP: usize = 12_000;

pub const PLANNER_SYSTEM_PROMPT: &str = r#"You are a penetration testing task planner.

Your job is to analyze a security task and decide if it needs to be broken down into smaller steps.

Guidelines:
- Atomic tasks (single nmap scan, single tool run) don't need branching
- Complex tasks (full recon, complete assessment) should be broken into 2-5 steps
- Each sub-task must be independently executable
- Sub-tasks should build on each other logically
- Be specific about tools and techniques

Always return valid JSON matching the schema provided."#;

pub fn planner_user_prompt(spec: &TaskSpec, advice: &str) -> String {
    format!(
        r#"Analyze this task and decide if it needs to be broken down:

Task: {task}
Description: {description}
Verification: {verification}

Context from previous work:
{advice}

Return a JSON object with this structure:
{{
    "needs_branching": true/false,
    "reasoning": "why you made this decision",
    "task_chain": {{
        "strategy": "overall approach",
        "tasks": [
            {{
                "abstract": "brief summary",
                "description": "what to do",
                "verification": "how to verify",
                "rationale": "why this step"
            }}
        ]
    }}
}}

Rules:
- If task is atomic (single command/action), set needs_branching=false and return 1 task
- If task is complex, set needs_branching=true and break into 2-5 atomic sub-tasks
- Each sub-task must be independently executable
- Order matters: tasks should build on each other"#,
        task = spec.r#abstract,
        description = spec.description,
        verification = spec.verification,
    )
}

pub fn executor_system_prompt(spec: &TaskSpec, advice: &str) -> String {
    format!(
        r#"You are an expert penetration tester executing a specific task.

TASK CONTEXT:
Abstract: {task}
Description: {description}
Verification: {verification}

CONTEXT FROM PREVIOUS WORK:
{advice}

Execute this task step by step, one command at a time.
When all verification criteria are met, respond with 'DONE: summary'.
If the task cannot be completed, respond with 'IMPOSSIBLE: reason'."#,
        task = spec.r#abstract,
        description = spec.description,
        verification = spec.verification,
    )
}

pub const CRITIC_SYSTEM_PROMPT: &str = r#"You are a task verification critic.
Your job is to determine if a task's verification criteria have been met based on the execution output.

Return ONLY a JSON object:
{
    "criteria_met": true/false,
    "reasoning": "explanation of your decision"
}"#;

pub fn critic_user_prompt(spec: &TaskSpec, transcript: &str) -> String {
    format!(
        r#"Task: {task}

Verification Criteria:
{verification}

Execution Output:
{transcript}

Have the verification criteria been met?"#,
        task = spec.r#abstract,
        verification = spec.verification,
        transcript = cap(transcript),
    )
}

pub const DIGESTER_SYSTEM_PROMPT: &str = r#"You are a task result summarizer.
Create a brief, clear summary of what was accomplished.

Return ONLY a JSON object:
{
    "summary": "2-3 sentence summary of what was done and found"
}"#;

pub fn digester_user_prompt(spec: &TaskSpec, transcript: &str) -> String {
    format!(
        r#"Task: {task}

Execution Output:
{transcript}

Provide a concise summary of what was accomplished."#,
        task = spec.r#abstract,
        transcript = cap(transcript),
    )
}

/// Cap a transcript to the first TRANSCRIPT_CAP characters
pub fn cap(transcript: &str) -> &str {
    match transcript.char_indices().nth(TRANSCRIPT_CAP) {
        Some((idx, _)) => &transcript[..idx],
        None => transcript,
    }
}
