//! Task descriptions accepted by the coordinator.

use serde::{Deserialize, Serialize};

/// What the agent is asked to do, with a payload per kind.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum TaskKind {
    /// Read-only overview of the repository.
    Analyze,
    Review {
        #[serde(default)]
        focus: Option<String>,
    },
    Fix {
        issue: String,
    },
    Implement {
        feature: String,
    },
    Test {
        /// Overrides the detected test command.
        #[serde(default)]
        command: Option<String>,
    },
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AgentTask {
    #[serde(default = "new_task_id")]
    pub id: String,
    #[serde(flatten)]
    pub kind: TaskKind,
    pub description: String,
    #[serde(default)]
    pub repo_url: Option<String>,
    #[serde(default)]
    pub open_pull_request: bool,
    #[serde(default)]
    pub branch: Option<String>,
}

fn new_task_id() -> String {
    format!("task-{}", uuid::Uuid::new_v4().simple())
}

impl AgentTask {
    pub fn new(kind: TaskKind, description: impl Into<String>) -> Self {
        Self {
            id: new_task_id(),
            kind,
            description: description.into(),
            repo_url: None,
            open_pull_request: false,
            branch: None,
        }
    }

    pub fn with_repo(mut self, repo_url: impl Into<String>) -> Self {
        self.repo_url = Some(repo_url.into());
        self
    }

    pub fn with_pull_request(mut self, branch: Option<String>) -> Self {
        self.open_pull_request = true;
        self.branch = branch;
        self
    }

    pub fn kind_name(&self) -> &'static str {
        match self.kind {
            TaskKind::Analyze => "analyze",
            TaskKind::Review { .. } => "review",
            TaskKind::Fix { .. } => "fix",
            TaskKind::Implement { .. } => "implement",
            TaskKind::Test { .. } => "test",
        }
    }

    /// Tasks whose model answer is a patch to apply.
    pub fn produces_code(&self) -> bool {
        matches!(self.kind, TaskKind::Fix { .. } | TaskKind::Implement { .. })
    }

    /// Explicit repo URL, else the first repository reference in the text.
    pub fn repo_reference(&self) -> Option<String> {
        self.repo_url
            .clone()
            .filter(|u| !u.trim().is_empty())
            .or_else(|| extract_repo_reference(&self.description))
    }

    pub fn branch_name(&self) -> String {
        self.branch.clone().unwrap_or_else(|| {
            let tail: Vec<char> = self.id.chars().filter(char::is_ascii_alphanumeric).collect();
            let short: String = tail[tail.len().saturating_sub(8)..].iter().collect();
            format!("agent/{}-{short}", self.kind_name())
        })
    }

    /// Prompt sent through the gateway once pre-flight has run.
    pub fn prompt(&self, workspace_context: &str) -> String {
        let ask = match &self.kind {
            TaskKind::Analyze => "Summarize the structure, build system and notable risks of this repository.".to_string(),
            TaskKind::Review { focus } => match focus {
                Some(focus) => format!("Review the recent changes with a focus on {focus}."),
                None => "Review the recent changes and point out defects.".to_string(),
            },
            TaskKind::Fix { issue } => format!(
                "Fix the following issue: {issue}\nAnswer with a single unified diff against the repository root inside a ```diff block."
            ),
            TaskKind::Implement { feature } => format!(
                "Implement: {feature}\nAnswer with a single unified diff against the repository root inside a ```diff block."
            ),
            TaskKind::Test { .. } => "Explain the test results and the most likely cause of any failure.".to_string(),
        };
        format!(
            "Task: {}\n\n{ask}\n\nWorkspace:\n{workspace_context}",
            self.description
        )
    }
}

/// Find a GitHub-style repository reference in free text.
pub fn extract_repo_reference(text: &str) -> Option<String> {
    text.split_whitespace()
        .map(|word| {
            word.trim_matches(|c: char| matches!(c, '(' | ')' | '<' | '>' | '"' | '\'' | ',' | '`'))
                .trim_end_matches(['.', ':', ';', '!', '?'])
        })
        .find(|word| {
            (word.starts_with("https://") || word.starts_with("http://") || word.starts_with("git@"))
                && word.contains("github.com")
                && word.matches('/').count() >= 2
        })
        .map(str::to_string)
}

/// Pull the first fenced diff out of a model answer.
pub fn extract_diff(answer: &str) -> Option<String> {
    let start = answer.find("```diff").or_else(|| answer.find("```patch"))?;
    let body = &answer[start..];
    let body = &body[body.find('\n')? + 1..];
    let end = body.find("```")?;
    let diff = body[..end].trim_end();
    if diff.contains("--- ") && diff.contains("+++ ") {
        Some(format!("{diff}\n"))
    } else {
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn deserializes_tagged_payload() {
        let task: AgentTask = serde_json::from_value(serde_json::json!({
            "kind": "fix",
            "issue": "build fails on linux",
            "description": "make CI green",
            "repoUrl": "https://github.com/acme/widgets",
            "openPullRequest": true
        }))
        .unwrap();
        assert_eq!(
            task.kind,
            TaskKind::Fix {
                issue: "build fails on linux".into()
            }
        );
        assert!(task.open_pull_request);
        assert!(task.produces_code());
        assert!(task.id.starts_with("task-"));
    }

    #[test]
    fn unit_kind_round_trips() {
        let task = AgentTask::new(TaskKind::Analyze, "look around");
        let json = serde_json::to_value(&task).unwrap();
        assert_eq!(json["kind"], "analyze");
        let back: AgentTask = serde_json::from_value(json).unwrap();
        assert_eq!(back, task);
    }

    #[test]
    fn finds_repo_in_text() {
        assert_eq!(
            extract_repo_reference("please check (https://github.com/acme/widgets). thanks"),
            Some("https://github.com/acme/widgets".into())
        );
        assert_eq!(
            extract_repo_reference("clone git@github.com:acme/widgets.git first"),
            Some("git@github.com:acme/widgets.git".into())
        );
        assert_eq!(extract_repo_reference("no repo here"), None);
    }

    #[test]
    fn explicit_repo_wins() {
        let task = AgentTask::new(TaskKind::Analyze, "see https://github.com/a/b")
            .with_repo("https://github.com/c/d");
        assert_eq!(task.repo_reference().as_deref(), Some("https://github.com/c/d"));
    }

    #[test]
    fn extracts_fenced_diff() {
        let answer = "Here you go:\n```diff\n--- a/src/lib.rs\n+++ b/src/lib.rs\n@@ -1 +1 @@\n-old\n+new\n```\nDone.";
        let diff = extract_diff(answer).unwrap();
        assert!(diff.starts_with("--- a/src/lib.rs"));
        assert!(diff.ends_with("+new\n"));
        assert_eq!(extract_diff("```diff\nnot a patch\n```"), None);
        assert_eq!(extract_diff("no fences"), None);
    }

    #[test]
    fn default_branch_name_uses_kind() {
        let task = AgentTask::new(TaskKind::Fix { issue: "x".into() }, "d");
        assert!(task.branch_name().starts_with("agent/fix-"));
    }
}
