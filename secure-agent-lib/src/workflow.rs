//! Fixed pre-flight run before any model call.
//!
//! Bootstrap (clone plus environment setup) is fatal. Status, tests and the
//! task-specific analysis only ever record warnings.

use std::time::{Duration, Instant};

use serde::Serialize;

use sandbox_runtime::repo_setup::{StepStatus, Toolchain, setup_repository};
use sandbox_runtime::runtime::{ExecOptions, SandboxOrchestrator};
use sandbox_runtime::util::{shell_escape, truncate_chars};

use crate::error::Result;
use crate::task::{AgentTask, TaskKind};

const TEST_TIMEOUT: Duration = Duration::from_secs(600);
const STEP_OUTPUT_CHARS: usize = 4000;
const CONTEXT_CHARS_PER_STEP: usize = 1500;

#[derive(Clone, Debug, Serialize)]
pub struct StepResult {
    pub name: String,
    pub status: StepStatus,
    pub output: String,
    pub duration_ms: u64,
}

impl StepResult {
    pub fn new(name: &str, status: StepStatus, output: &str, started: Instant) -> Self {
        Self {
            name: name.to_string(),
            status,
            output: truncate_chars(output, STEP_OUTPUT_CHARS),
            duration_ms: started.elapsed().as_millis() as u64,
        }
    }
}

#[derive(Clone, Debug, Default, Serialize)]
pub struct WorkflowReport {
    pub toolchain: Option<Toolchain>,
    pub steps: Vec<StepResult>,
}

impl WorkflowReport {
    pub fn warnings(&self) -> usize {
        self.steps
            .iter()
            .filter(|s| s.status == StepStatus::Warning)
            .count()
    }

    /// Step outputs condensed for a prompt.
    pub fn context_summary(&self) -> String {
        let mut summary = String::new();
        for step in &self.steps {
            summary.push_str(&format!(
                "## {} ({:?})\n{}\n",
                step.name,
                step.status,
                truncate_chars(step.output.trim(), CONTEXT_CHARS_PER_STEP)
            ));
        }
        summary
    }
}

async fn run_step(
    orchestrator: &SandboxOrchestrator,
    sandbox_id: &str,
    name: &str,
    command: &str,
    options: ExecOptions,
) -> StepResult {
    let started = Instant::now();
    match orchestrator.exec(sandbox_id, command, options).await {
        Ok(result) => {
            let mut output = result.stdout;
            if !result.stderr.trim().is_empty() {
                output.push_str(&result.stderr);
            }
            StepResult::new(name, StepStatus::Ok, &output, started)
        }
        Err(err) => {
            tracing::warn!(sandbox_id, step = name, %err, "pre-flight step failed");
            StepResult::new(name, StepStatus::Warning, &err.to_string(), started)
        }
    }
}

fn analysis_command(task: &AgentTask) -> String {
    match &task.kind {
        TaskKind::Analyze | TaskKind::Implement { .. } => {
            "git ls-files | head -n 200 && echo && git ls-files | wc -l".to_string()
        }
        TaskKind::Review { .. } => {
            "git log --oneline -n 20 && git diff --stat HEAD~1 HEAD".to_string()
        }
        TaskKind::Fix { issue } => {
            let keyword = issue
                .split_whitespace()
                .filter(|w| w.len() > 3)
                .max_by_key(|w| w.len())
                .unwrap_or(issue.as_str());
            format!(
                "git grep -n -I -i -e {} | head -n 50 || true",
                shell_escape(keyword)
            )
        }
        TaskKind::Test { .. } => "git ls-files | grep -i test | head -n 100".to_string(),
    }
}

/// Bootstrap the repository, then run status, tests and analysis.
///
/// `on_step` sees every step as soon as it finishes.
pub async fn run_preflight(
    orchestrator: &SandboxOrchestrator,
    sandbox_id: &str,
    task: &AgentTask,
    mut on_step: impl FnMut(&StepResult),
) -> Result<WorkflowReport> {
    let mut report = WorkflowReport::default();

    let started = Instant::now();
    let setup = setup_repository(orchestrator, sandbox_id, task.repo_reference().as_deref()).await?;
    report.toolchain = setup.toolchain;
    for step in setup.steps {
        let result = StepResult::new(&step.name, step.status, &step.output, started);
        on_step(&result);
        report.steps.push(result);
    }

    let status = run_step(
        orchestrator,
        sandbox_id,
        "status",
        "git status --short --branch",
        ExecOptions::in_repo(),
    )
    .await;
    on_step(&status);
    report.steps.push(status);

    let test_command = match (&task.kind, report.toolchain) {
        (TaskKind::Test { command: Some(command) }, _) => Some(command.clone()),
        (_, Some(toolchain)) => Some(toolchain.test_command().to_string()),
        (_, None) => None,
    };
    let tests = match test_command {
        Some(command) => {
            let options = ExecOptions {
                timeout: Some(TEST_TIMEOUT),
                ..ExecOptions::in_repo()
            };
            run_step(orchestrator, sandbox_id, "tests", &command, options).await
        }
        None => StepResult::new(
            "tests",
            StepStatus::Warning,
            "test runner not found",
            Instant::now(),
        ),
    };
    on_step(&tests);
    report.steps.push(tests);

    let analysis = run_step(
        orchestrator,
        sandbox_id,
        "analysis",
        &analysis_command(task),
        ExecOptions::in_repo(),
    )
    .await;
    on_step(&analysis);
    report.steps.push(analysis);

    tracing::info!(
        sandbox_id,
        task_id = %task.id,
        warnings = report.warnings(),
        "pre-flight complete"
    );
    Ok(report)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fix_analysis_greps_longest_word() {
        let task = AgentTask::new(
            TaskKind::Fix {
                issue: "panic in tokenizer module".into(),
            },
            "d",
        );
        let command = analysis_command(&task);
        assert!(command.contains("'tokenizer'"));
    }

    #[test]
    fn summary_lists_steps() {
        let report = WorkflowReport {
            toolchain: None,
            steps: vec![StepResult::new(
                "tests",
                StepStatus::Warning,
                "test runner not found",
                Instant::now(),
            )],
        };
        let summary = report.context_summary();
        assert!(summary.contains("## tests (Warning)"));
        assert!(summary.contains("not found"));
        assert_eq!(report.warnings(), 1);
    }
}
