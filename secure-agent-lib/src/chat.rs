//! Interactive chat against a running sandbox.

use serde::Serialize;

/// How a free-form message is answered.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ChatIntent {
    /// Fixed read-only command batch.
    RepoInspection,
    /// Sandbox and spend summary, no model call.
    StatusReport,
    /// Forwarded through the gateway.
    General,
}

/// Read-only commands run for [`ChatIntent::RepoInspection`].
pub const INSPECTION_COMMANDS: [&str; 4] = [
    "git status --short --branch",
    "git log --oneline -n 10",
    "ls -la",
    "git ls-files | head -n 100",
];

const STATUS_WORDS: [&str; 6] = ["status", "usage", "budget", "spend", "health", "metrics"];
const INSPECT_WORDS: [&str; 7] = [
    "files",
    "structure",
    "inspect",
    "layout",
    "tree",
    "git log",
    "what's in",
];

pub fn classify(message: &str) -> ChatIntent {
    let lower = message.to_lowercase();
    // Questions are for the model even when they mention a keyword.
    let question = lower.trim_end().ends_with('?') && lower.split_whitespace().count() > 6;
    if question {
        return ChatIntent::General;
    }
    if STATUS_WORDS.iter().any(|w| lower.contains(w)) {
        ChatIntent::StatusReport
    } else if INSPECT_WORDS.iter().any(|w| lower.contains(w)) {
        ChatIntent::RepoInspection
    } else {
        ChatIntent::General
    }
}

#[derive(Clone, Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ChatReply {
    pub intent: ChatIntent,
    pub content: String,
    pub tokens_used: u64,
}
