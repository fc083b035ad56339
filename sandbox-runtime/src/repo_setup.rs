//! Development-environment bootstrap inside a running sandbox.
//!
//! Fixed order: clone, install dependencies, set git identity. Only the clone
//! is fatal; the later steps record warnings and carry on.

use std::time::Duration;

use serde::Serialize;

use crate::error::{Result, SandboxError};
use crate::runtime::{ExecOptions, SandboxOrchestrator};
use crate::util::{shell_escape, truncate_chars};
use crate::{REPO_PATH, WORKSPACE_DIR};

const CLONE_TIMEOUT: Duration = Duration::from_secs(600);
const INSTALL_TIMEOUT: Duration = Duration::from_secs(900);
const STEP_OUTPUT_CHARS: usize = 2000;

/// Project toolchain, detected from the manifest at the repo root.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Toolchain {
    Node,
    Rust,
    Python,
    Go,
}

impl Toolchain {
    /// Manifests in detection order.
    const MANIFESTS: [(&'static str, Toolchain); 5] = [
        ("package.json", Toolchain::Node),
        ("Cargo.toml", Toolchain::Rust),
        ("pyproject.toml", Toolchain::Python),
        ("requirements.txt", Toolchain::Python),
        ("go.mod", Toolchain::Go),
    ];

    pub fn install_command(self, manifest: &str) -> &'static str {
        match (self, manifest) {
            (Toolchain::Node, _) => "npm install --no-audit --no-fund",
            (Toolchain::Rust, _) => "cargo fetch",
            (Toolchain::Python, "requirements.txt") => "pip install -r requirements.txt",
            (Toolchain::Python, _) => "pip install -e .",
            (Toolchain::Go, _) => "go mod download",
        }
    }

    pub fn test_command(self) -> &'static str {
        match self {
            Toolchain::Node => "npm test --silent",
            Toolchain::Rust => "cargo test",
            Toolchain::Python => "python -m pytest -q",
            Toolchain::Go => "go test ./...",
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum StepStatus {
    Ok,
    Warning,
    Failed,
}

#[derive(Clone, Debug, Serialize)]
pub struct SetupStep {
    pub name: String,
    pub status: StepStatus,
    pub output: String,
}

impl SetupStep {
    fn new(name: &str, status: StepStatus, output: impl AsRef<str>) -> Self {
        Self {
            name: name.to_string(),
            status,
            output: truncate_chars(output.as_ref(), STEP_OUTPUT_CHARS),
        }
    }
}

#[derive(Clone, Debug, Default, Serialize)]
pub struct SetupReport {
    pub toolchain: Option<Toolchain>,
    pub steps: Vec<SetupStep>,
}

impl SetupReport {
    pub fn warnings(&self) -> impl Iterator<Item = &SetupStep> {
        self.steps.iter().filter(|s| s.status == StepStatus::Warning)
    }
}

fn validate_repo_url(repo_url: &str) -> Result<()> {
    let allowed = ["https://", "http://", "git@", "ssh://"];
    if repo_url.starts_with('-') || !allowed.iter().any(|p| repo_url.starts_with(p)) {
        return Err(SandboxError::Validation(format!(
            "unsupported repository URL: {repo_url}"
        )));
    }
    Ok(())
}

/// First manifest present at the repo root, if any.
pub async fn detect_toolchain(
    orchestrator: &SandboxOrchestrator,
    sandbox_id: &str,
) -> Result<Option<(&'static str, Toolchain)>> {
    for (manifest, toolchain) in Toolchain::MANIFESTS {
        let found = orchestrator
            .exec(sandbox_id, &format!("test -f {manifest}"), ExecOptions::in_repo())
            .await;
        match found {
            Ok(_) => return Ok(Some((manifest, toolchain))),
            Err(SandboxError::Exec(crate::error::ExecError::NonZeroExit { .. })) => continue,
            Err(err) => return Err(err),
        }
    }
    Ok(None)
}

/// Clone `repo_url` (or initialize an empty repo) and prepare the toolchain.
pub async fn setup_repository(
    orchestrator: &SandboxOrchestrator,
    sandbox_id: &str,
    repo_url: Option<&str>,
) -> Result<SetupReport> {
    let mut report = SetupReport::default();

    let bootstrap = match repo_url {
        Some(url) => {
            validate_repo_url(url)?;
            format!(
                "mkdir -p {WORKSPACE_DIR} && git clone --depth 50 {} {REPO_PATH}",
                shell_escape(url)
            )
        }
        None => format!("mkdir -p {REPO_PATH} && git -C {REPO_PATH} init -q"),
    };
    let cloned = orchestrator
        .exec(sandbox_id, &bootstrap, ExecOptions::with_timeout(CLONE_TIMEOUT))
        .await
        .map_err(|err| {
            tracing::error!(sandbox_id, %err, "repository bootstrap failed");
            err
        })?;
    report
        .steps
        .push(SetupStep::new("clone", StepStatus::Ok, cloned.stderr));

    match detect_toolchain(orchestrator, sandbox_id).await {
        Ok(Some((manifest, toolchain))) => {
            report.toolchain = Some(toolchain);
            let options = ExecOptions {
                timeout: Some(INSTALL_TIMEOUT),
                ..ExecOptions::in_repo()
            };
            match orchestrator
                .exec(sandbox_id, toolchain.install_command(manifest), options)
                .await
            {
                Ok(result) => report
                    .steps
                    .push(SetupStep::new("install", StepStatus::Ok, result.stdout)),
                Err(err) => {
                    tracing::warn!(sandbox_id, %err, "dependency install failed");
                    report
                        .steps
                        .push(SetupStep::new("install", StepStatus::Warning, err.to_string()));
                }
            }
        }
        Ok(None) => {
            tracing::warn!(sandbox_id, "no dependency manifest found");
            report.steps.push(SetupStep::new(
                "install",
                StepStatus::Warning,
                "dependency manifest not found",
            ));
        }
        Err(err) => {
            report
                .steps
                .push(SetupStep::new("install", StepStatus::Warning, err.to_string()));
        }
    }

    let config = orchestrator.config();
    let identity = format!(
        "git config user.name {} && git config user.email {}",
        shell_escape(&config.git_author_name),
        shell_escape(&config.git_author_email)
    );
    match orchestrator
        .exec(sandbox_id, &identity, ExecOptions::in_repo())
        .await
    {
        Ok(_) => report
            .steps
            .push(SetupStep::new("git_identity", StepStatus::Ok, "")),
        Err(err) => report
            .steps
            .push(SetupStep::new("git_identity", StepStatus::Warning, err.to_string())),
    }

    tracing::info!(
        sandbox_id,
        toolchain = ?report.toolchain,
        warnings = report.warnings().count(),
        "repository ready"
    );
    Ok(report)
}
