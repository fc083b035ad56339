//! Per-agent state machine tying sandbox provisioning to model-driven work.
//!
//! `initializing -> ready -> busy <-> ready -> stopped`, with `error` only
//! reachable from a failed `initialize`. A task that fails for any reason
//! still returns the coordinator to `ready`.

use std::env;
use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::{Duration, Instant};

use serde::Serialize;
use tokio::sync::{broadcast, mpsc};
use tokio_stream::StreamExt;
use tokio_stream::wrappers::ReceiverStream;

use sandbox_runtime::pull_request::{
    PullRequestClient, PullRequestOutcome, PullRequestRequest, create_pull_request,
};
use sandbox_runtime::repo_setup::{StepStatus, setup_repository};
use sandbox_runtime::runtime::{ExecOptions, SandboxMetrics};
use sandbox_runtime::util::{env_or, shell_escape, truncate_chars};
use sandbox_runtime::{
    AiRequest, Capability, CreateSandboxRequest, Gateway, MintRequest, SandboxError,
    SandboxOrchestrator, SandboxRecord, StreamChunk, TokenManager,
};

use crate::chat::{ChatIntent, ChatReply, INSPECTION_COMMANDS, classify};
use crate::error::{CoordinatorError, Result};
use crate::task::{AgentTask, extract_diff};
use crate::workflow::{StepResult, run_preflight};

const EVENT_CAPACITY: usize = 128;
const PATCH_PATH: &str = "/tmp/agent.patch";
/// Escaping at most quintuples a chunk, which keeps each `sh -c` argument
/// well under the kernel's per-argument limit.
const PATCH_CHUNK_BYTES: usize = 16 * 1024;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum AgentState {
    Initializing,
    Ready,
    Busy,
    Stopped,
    Error,
}

impl AgentState {
    pub fn as_str(self) -> &'static str {
        match self {
            AgentState::Initializing => "initializing",
            AgentState::Ready => "ready",
            AgentState::Busy => "busy",
            AgentState::Stopped => "stopped",
            AgentState::Error => "error",
        }
    }
}

impl fmt::Display for AgentState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Clone, Debug)]
pub struct CoordinatorConfig {
    pub agent_id: String,
    pub budget: u64,
    pub token_ttl: Duration,
    pub capabilities: Vec<Capability>,
    pub max_requests_per_minute: u32,
    pub allowed_models: Vec<String>,
    pub max_tokens_per_request: u64,
    /// `maxTokens` sent with each task-level model call.
    pub max_tokens_per_call: u64,
    pub model: Option<String>,
    pub github_token: Option<String>,
    pub pr_base: Option<String>,
    /// Keep the sandbox after a successful task, for chat.
    pub keep_sandbox: bool,
}

impl Default for CoordinatorConfig {
    fn default() -> Self {
        Self {
            agent_id: format!("agent-{}", &uuid::Uuid::new_v4().simple().to_string()[..8]),
            budget: 100_000,
            token_ttl: Duration::from_secs(3600),
            capabilities: Capability::ALL.to_vec(),
            max_requests_per_minute: 60,
            allowed_models: Vec::new(),
            max_tokens_per_request: 4096,
            max_tokens_per_call: 2048,
            model: None,
            github_token: None,
            pr_base: None,
            keep_sandbox: false,
        }
    }
}

fn csv(value: &str) -> impl Iterator<Item = &str> {
    value.split(',').map(str::trim).filter(|s| !s.is_empty())
}

impl CoordinatorConfig {
    pub fn from_env() -> Self {
        let defaults = Self::default();
        let capabilities = env::var("AGENT_CAPABILITIES")
            .ok()
            .map(|raw| {
                csv(&raw)
                    .filter_map(|c| match c.parse::<Capability>() {
                        Ok(cap) => Some(cap),
                        Err(err) => {
                            tracing::warn!(%err, "ignoring capability");
                            None
                        }
                    })
                    .collect::<Vec<_>>()
            })
            .filter(|caps| !caps.is_empty())
            .unwrap_or(defaults.capabilities);
        Self {
            agent_id: env::var("AGENT_ID").unwrap_or(defaults.agent_id),
            budget: env_or("AGENT_TOKEN_BUDGET", defaults.budget),
            token_ttl: Duration::from_secs(env_or("AGENT_TOKEN_TTL_SECS", 3600)),
            capabilities,
            max_requests_per_minute: env_or("AGENT_MAX_RPM", defaults.max_requests_per_minute),
            allowed_models: env::var("AGENT_ALLOWED_MODELS")
                .map(|raw| csv(&raw).map(str::to_string).collect())
                .unwrap_or_default(),
            max_tokens_per_request: env_or(
                "AGENT_MAX_TOKENS_PER_REQUEST",
                defaults.max_tokens_per_request,
            ),
            max_tokens_per_call: env_or("AGENT_MAX_TOKENS_PER_CALL", defaults.max_tokens_per_call),
            model: env::var("AGENT_MODEL").ok().filter(|m| !m.is_empty()),
            github_token: env::var("GITHUB_TOKEN").ok().filter(|t| !t.is_empty()),
            pr_base: env::var("AGENT_PR_BASE").ok().filter(|b| !b.is_empty()),
            keep_sandbox: env_or("AGENT_KEEP_SANDBOX", false),
        }
    }
}

/// Shared services the coordinator drives.
#[derive(Clone)]
pub struct CoordinatorServices {
    pub tokens: Arc<TokenManager>,
    pub gateway: Arc<Gateway>,
    pub orchestrator: SandboxOrchestrator,
    pub pull_requests: PullRequestClient,
}

#[derive(Clone, Debug, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum CoordinatorEvent {
    StateChanged { from: AgentState, to: AgentState },
    TaskStarted { task_id: String },
    StepCompleted { task_id: String, step: StepResult },
    SpendUpdated { spent: u64, budget: u64 },
    TaskCompleted { task_id: String, success: bool },
}

/// Optional external observer of coordinator progress.
pub trait ProgressSink: Send + Sync {
    fn on_event(&self, event: &CoordinatorEvent);
}

#[derive(Clone, Debug, Serialize)]
pub struct TaskOutcome {
    pub task_id: String,
    pub sandbox_id: String,
    pub steps: Vec<StepResult>,
    pub answer: String,
    pub tokens_used: u64,
    pub patch_applied: Option<bool>,
    pub pull_request: Option<PullRequestOutcome>,
    pub duration_ms: u64,
}

#[derive(Clone, Debug, Serialize)]
pub struct CoordinatorStatus {
    pub agent_id: String,
    pub state: AgentState,
    pub spent: u64,
    pub budget: u64,
    pub sandbox: Option<SandboxRecord>,
    pub sandbox_metrics: Option<SandboxMetrics>,
    pub runtime: Vec<(String, u64)>,
}

#[derive(Clone)]
struct SessionHandle {
    token: String,
}

pub struct SecureAgentCoordinator {
    config: CoordinatorConfig,
    services: CoordinatorServices,
    state: Mutex<AgentState>,
    session: Mutex<Option<SessionHandle>>,
    sandbox: Mutex<Option<String>>,
    cancelled: AtomicBool,
    spent: Arc<AtomicU64>,
    events: broadcast::Sender<CoordinatorEvent>,
    progress: Option<Arc<dyn ProgressSink>>,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|e| e.into_inner())
}

impl SecureAgentCoordinator {
    pub fn new(config: CoordinatorConfig, services: CoordinatorServices) -> Self {
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        Self {
            config,
            services,
            state: Mutex::new(AgentState::Initializing),
            session: Mutex::new(None),
            sandbox: Mutex::new(None),
            cancelled: AtomicBool::new(false),
            spent: Arc::new(AtomicU64::new(0)),
            events,
            progress: None,
        }
    }

    pub fn with_progress(mut self, sink: Arc<dyn ProgressSink>) -> Self {
        self.progress = Some(sink);
        self
    }

    pub fn agent_id(&self) -> &str {
        &self.config.agent_id
    }

    pub fn state(&self) -> AgentState {
        *lock(&self.state)
    }

    pub fn spent(&self) -> u64 {
        self.spent.load(Ordering::SeqCst)
    }

    pub fn sandbox_id(&self) -> Option<String> {
        lock(&self.sandbox).clone()
    }

    /// Current session token, once initialized.
    pub fn session_token(&self) -> Option<String> {
        lock(&self.session).as_ref().map(|s| s.token.clone())
    }

    pub fn subscribe(&self) -> broadcast::Receiver<CoordinatorEvent> {
        self.events.subscribe()
    }

    fn emit(&self, event: CoordinatorEvent) {
        if let Some(sink) = &self.progress {
            sink.on_event(&event);
        }
        let _ = self.events.send(event);
    }

    fn set_state(&self, to: AgentState) {
        let from = std::mem::replace(&mut *lock(&self.state), to);
        if from != to {
            tracing::info!(agent_id = %self.config.agent_id, %from, %to, "coordinator state");
            self.emit(CoordinatorEvent::StateChanged { from, to });
        }
    }

    /// Move `from -> to` only if the current state is `from`.
    fn transition_if(&self, from: AgentState, to: AgentState) -> bool {
        {
            let mut state = lock(&self.state);
            if *state != from {
                return false;
            }
            *state = to;
        }
        tracing::info!(agent_id = %self.config.agent_id, %from, %to, "coordinator state");
        self.emit(CoordinatorEvent::StateChanged { from, to });
        true
    }

    fn require(&self, expected: AgentState, action: &'static str) -> Result<()> {
        let state = self.state();
        if state != expected {
            return Err(CoordinatorError::InvalidState { state, action });
        }
        Ok(())
    }

    fn session(&self) -> Result<SessionHandle> {
        lock(&self.session)
            .clone()
            .ok_or(CoordinatorError::InvalidState {
                state: self.state(),
                action: "use a session",
            })
    }

    fn ensure_not_cancelled(&self) -> Result<()> {
        if self.cancelled.load(Ordering::SeqCst) {
            return Err(CoordinatorError::Cancelled);
        }
        Ok(())
    }

    /// Mint a session token, start the gateway if needed and register.
    pub async fn initialize(&self) -> Result<()> {
        let state = self.state();
        if !matches!(state, AgentState::Initializing | AgentState::Error) {
            return Err(CoordinatorError::InvalidState {
                state,
                action: "initialize",
            });
        }
        match self.try_initialize().await {
            Ok(()) => {
                self.set_state(AgentState::Ready);
                Ok(())
            }
            Err(err) => {
                tracing::error!(agent_id = %self.config.agent_id, %err, "initialization failed");
                self.set_state(AgentState::Error);
                Err(err)
            }
        }
    }

    async fn try_initialize(&self) -> Result<()> {
        let minted = self.services.tokens.mint(MintRequest {
            agent_id: self.config.agent_id.clone(),
            budget: self.config.budget,
            capabilities: self.config.capabilities.clone(),
            ttl: self.config.token_ttl,
            max_requests_per_minute: self.config.max_requests_per_minute,
            allowed_models: self.config.allowed_models.clone(),
            max_tokens_per_request: self.config.max_tokens_per_request,
        })?;

        let registered = async {
            self.services.gateway.ensure_listening().await?;
            self.services
                .gateway
                .register_agent(&self.config.agent_id, &minted.token)
        }
        .await;
        if let Err(err) = registered {
            self.services.tokens.revoke_id(&minted.token_id);
            return Err(err.into());
        }

        *lock(&self.session) = Some(SessionHandle {
            token: minted.token,
        });
        self.cancelled.store(false, Ordering::SeqCst);
        tracing::info!(
            agent_id = %self.config.agent_id,
            token_id = %minted.token_id,
            budget = self.config.budget,
            "agent session ready"
        );
        Ok(())
    }

    /// Run one task end to end. The coordinator is back in `ready` afterwards
    /// whether or not the task succeeded.
    pub async fn execute_task(&self, task: AgentTask) -> Result<TaskOutcome> {
        if task.description.trim().is_empty() {
            return Err(CoordinatorError::InvalidTask("description is empty".into()));
        }
        if !self.transition_if(AgentState::Ready, AgentState::Busy) {
            return Err(CoordinatorError::InvalidState {
                state: self.state(),
                action: "execute a task",
            });
        }
        self.emit(CoordinatorEvent::TaskStarted {
            task_id: task.id.clone(),
        });
        tracing::info!(agent_id = %self.config.agent_id, task_id = %task.id, kind = task.kind_name(), "task started");

        let result = self.run_task(&task).await;

        match &result {
            Ok(outcome) => tracing::info!(
                task_id = %task.id,
                tokens_used = outcome.tokens_used,
                "task completed"
            ),
            Err(err) => tracing::error!(task_id = %task.id, %err, "task failed"),
        }
        if result.is_err() || !self.config.keep_sandbox {
            self.release_sandbox().await;
        }
        self.transition_if(AgentState::Busy, AgentState::Ready);
        self.emit(CoordinatorEvent::TaskCompleted {
            task_id: task.id.clone(),
            success: result.is_ok(),
        });
        result
    }

    async fn run_task(&self, task: &AgentTask) -> Result<TaskOutcome> {
        let started = Instant::now();
        let session = self.session()?;
        self.release_sandbox().await;

        let sandbox_id = self.provision(task.repo_reference(), &session).await?;
        self.ensure_not_cancelled()?;

        let report = run_preflight(&self.services.orchestrator, &sandbox_id, task, |step| {
            self.emit(CoordinatorEvent::StepCompleted {
                task_id: task.id.clone(),
                step: step.clone(),
            })
        })
        .await?;
        self.ensure_not_cancelled()?;

        let (answer, tokens_used) = self
            .ask(&session, task.prompt(&report.context_summary()))
            .await?;

        let mut outcome = TaskOutcome {
            task_id: task.id.clone(),
            sandbox_id: sandbox_id.clone(),
            steps: report.steps,
            answer,
            tokens_used,
            patch_applied: None,
            pull_request: None,
            duration_ms: 0,
        };

        if task.produces_code() {
            let step = self.apply_patch(&sandbox_id, &outcome.answer).await;
            outcome.patch_applied = Some(step.status == StepStatus::Ok);
            self.emit(CoordinatorEvent::StepCompleted {
                task_id: task.id.clone(),
                step: step.clone(),
            });
            outcome.steps.push(step);
        }

        if task.open_pull_request {
            self.ensure_not_cancelled()?;
            outcome.pull_request = self.open_pull_request(task, &sandbox_id, &outcome).await;
        }

        outcome.duration_ms = started.elapsed().as_millis() as u64;
        Ok(outcome)
    }

    async fn provision(&self, repo_url: Option<String>, session: &SessionHandle) -> Result<String> {
        let gateway_url = self
            .services
            .gateway
            .sandbox_url()
            .await
            .ok_or_else(|| SandboxError::Validation("gateway is not listening".into()))?;
        let sandbox_id = self
            .services
            .orchestrator
            .create_sandbox(CreateSandboxRequest {
                agent_id: self.config.agent_id.clone(),
                repo_url,
                session_token: session.token.clone(),
                gateway_url,
                capabilities: self
                    .config
                    .capabilities
                    .iter()
                    .map(|c| c.as_str().to_string())
                    .collect(),
            })
            .await?;
        *lock(&self.sandbox) = Some(sandbox_id.clone());
        Ok(sandbox_id)
    }

    /// Provision a sandbox for chat without running a task.
    pub async fn open_sandbox(&self, repo_url: Option<&str>) -> Result<String> {
        self.require(AgentState::Ready, "open a sandbox")?;
        let session = self.session()?;
        self.release_sandbox().await;
        let sandbox_id = self.provision(repo_url.map(str::to_string), &session).await?;
        if let Err(err) =
            setup_repository(&self.services.orchestrator, &sandbox_id, repo_url).await
        {
            self.release_sandbox().await;
            return Err(err.into());
        }
        Ok(sandbox_id)
    }

    /// One gateway call with spend tracking.
    async fn ask(&self, session: &SessionHandle, prompt: String) -> Result<(String, u64)> {
        self.ensure_not_cancelled()?;
        let response = self
            .services
            .gateway
            .make_ai_request(
                &self.config.agent_id,
                &session.token,
                AiRequest {
                    prompt,
                    model: self.config.model.clone(),
                    max_tokens: Some(self.config.max_tokens_per_call),
                    ..Default::default()
                },
            )
            .await?;
        let spent = self.spent.fetch_add(response.token_usage, Ordering::SeqCst) + response.token_usage;
        self.emit(CoordinatorEvent::SpendUpdated {
            spent,
            budget: self.config.budget,
        });
        Ok((response.result, response.token_usage))
    }

    async fn apply_patch(&self, sandbox_id: &str, answer: &str) -> StepResult {
        let started = Instant::now();
        let Some(diff) = extract_diff(answer) else {
            return StepResult::new(
                "apply_patch",
                StepStatus::Warning,
                "model answer contained no diff",
                started,
            );
        };
        let mut commands = vec![format!(": > {PATCH_PATH}")];
        commands.extend(
            split_utf8(&diff, PATCH_CHUNK_BYTES)
                .into_iter()
                .map(|chunk| format!("printf '%s' {} >> {PATCH_PATH}", shell_escape(chunk))),
        );
        commands.push(format!("git apply --whitespace=nowarn {PATCH_PATH}"));

        for command in &commands {
            if let Err(err) = self
                .services
                .orchestrator
                .exec(sandbox_id, command, ExecOptions::in_repo())
                .await
            {
                tracing::warn!(sandbox_id, %err, "patch did not apply");
                return StepResult::new("apply_patch", StepStatus::Warning, &err.to_string(), started);
            }
        }
        StepResult::new("apply_patch", StepStatus::Ok, "patch applied", started)
    }

    async fn open_pull_request(
        &self,
        task: &AgentTask,
        sandbox_id: &str,
        outcome: &TaskOutcome,
    ) -> Option<PullRequestOutcome> {
        if !self.config.capabilities.contains(&Capability::PullRequest) {
            tracing::warn!(task_id = %task.id, "pull_request capability not granted; skipping");
            return None;
        }
        if task.produces_code() && outcome.patch_applied != Some(true) {
            tracing::warn!(task_id = %task.id, "no applied changes; skipping pull request");
            return None;
        }
        let repo_url = task.repo_reference()?;
        let request = PullRequestRequest {
            sandbox_id: sandbox_id.to_string(),
            repo_url,
            branch: task.branch_name(),
            base: self.config.pr_base.clone(),
            title: truncate_chars(&format!("{}: {}", task.kind_name(), task.description), 72),
            body: format!(
                "Automated {} task `{}`.\n\n{}",
                task.kind_name(),
                task.id,
                truncate_chars(&outcome.answer, 4000)
            ),
        };
        match create_pull_request(
            &self.services.orchestrator,
            &self.services.pull_requests,
            &request,
        )
        .await
        {
            Ok(pr) => Some(pr),
            Err(err) => {
                tracing::warn!(task_id = %task.id, %err, "pull request failed");
                None
            }
        }
    }

    async fn release_sandbox(&self) {
        let Some(sandbox_id) = lock(&self.sandbox).take() else {
            return;
        };
        if let Err(err) = self.services.orchestrator.teardown(&sandbox_id).await {
            tracing::warn!(sandbox_id, %err, "sandbox teardown failed");
        }
    }

    /// Tear down the sandbox, then revoke the session token and unregister.
    pub async fn stop(&self) -> Result<()> {
        {
            let state = self.state();
            if state == AgentState::Stopped {
                return Ok(());
            }
        }
        self.cancelled.store(true, Ordering::SeqCst);
        self.set_state(AgentState::Stopped);

        self.release_sandbox().await;

        let session = lock(&self.session).take();
        if let Some(session) = session {
            if let Err(err) = self.services.tokens.revoke(&session.token) {
                tracing::error!(agent_id = %self.config.agent_id, %err, "token revocation failed");
            }
            if let Err(err) = self
                .services
                .gateway
                .unregister_agent(&self.config.agent_id, &session.token)
            {
                tracing::warn!(agent_id = %self.config.agent_id, %err, "unregister failed");
            }
        }
        tracing::info!(agent_id = %self.config.agent_id, spent = self.spent(), "coordinator stopped");
        Ok(())
    }

    pub async fn status(&self) -> CoordinatorStatus {
        let sandbox = self
            .sandbox_id()
            .and_then(|id| self.services.orchestrator.get(&id).ok());
        let sandbox_metrics = match &sandbox {
            Some(record) => self.services.orchestrator.get_metrics(&record.id).await.ok(),
            None => None,
        };
        CoordinatorStatus {
            agent_id: self.config.agent_id.clone(),
            state: self.state(),
            spent: self.spent(),
            budget: self.config.budget,
            sandbox,
            sandbox_metrics,
            runtime: self.services.orchestrator.metrics().snapshot(),
        }
    }

    fn chat_sandbox(&self) -> Result<String> {
        self.require(AgentState::Ready, "chat")?;
        self.sandbox_id().ok_or(CoordinatorError::InvalidState {
            state: self.state(),
            action: "chat without a running sandbox",
        })
    }

    /// Answer a free-form message against the current sandbox.
    pub async fn chat(&self, message: &str) -> Result<ChatReply> {
        let sandbox_id = self.chat_sandbox()?;
        let intent = classify(message);
        let (content, tokens_used) = match intent {
            ChatIntent::RepoInspection => (self.inspect_repo(&sandbox_id).await, 0),
            ChatIntent::StatusReport => (self.status_text().await, 0),
            ChatIntent::General => {
                let session = self.session()?;
                self.ask(&session, chat_prompt(message)).await?
            }
        };
        Ok(ChatReply {
            intent,
            content,
            tokens_used,
        })
    }

    /// Streaming variant of [`chat`](Self::chat). Canned intents arrive as a
    /// single content chunk followed by `complete`.
    pub async fn chat_stream(&self, message: &str) -> Result<ReceiverStream<StreamChunk>> {
        let sandbox_id = self.chat_sandbox()?;
        let intent = classify(message);
        if intent != ChatIntent::General {
            let content = match intent {
                ChatIntent::RepoInspection => self.inspect_repo(&sandbox_id).await,
                _ => self.status_text().await,
            };
            let (tx, rx) = mpsc::channel(2);
            let _ = tx
                .send(StreamChunk::Content {
                    content: content.clone(),
                    accumulated: content.clone(),
                })
                .await;
            let _ = tx
                .send(StreamChunk::Complete {
                    accumulated: content,
                    token_usage: 0,
                })
                .await;
            return Ok(ReceiverStream::new(rx));
        }

        self.ensure_not_cancelled()?;
        let session = self.session()?;
        let mut upstream = self
            .services
            .gateway
            .make_streaming_ai_request(
                &self.config.agent_id,
                &session.token,
                AiRequest {
                    prompt: chat_prompt(message),
                    model: self.config.model.clone(),
                    max_tokens: Some(self.config.max_tokens_per_call),
                    ..Default::default()
                },
            )
            .await?;

        let (tx, rx) = mpsc::channel(32);
        let spent = Arc::clone(&self.spent);
        let events = self.events.clone();
        let budget = self.config.budget;
        tokio::spawn(async move {
            while let Some(chunk) = upstream.next().await {
                if let StreamChunk::Complete { token_usage, .. } = &chunk {
                    let total = spent.fetch_add(*token_usage, Ordering::SeqCst) + token_usage;
                    let _ = events.send(CoordinatorEvent::SpendUpdated {
                        spent: total,
                        budget,
                    });
                }
                if tx.send(chunk).await.is_err() {
                    break;
                }
            }
        });
        Ok(ReceiverStream::new(rx))
    }

    async fn inspect_repo(&self, sandbox_id: &str) -> String {
        let mut out = String::new();
        for command in INSPECTION_COMMANDS {
            out.push_str(&format!("$ {command}\n"));
            match self
                .services
                .orchestrator
                .exec(sandbox_id, command, ExecOptions::in_repo())
                .await
            {
                Ok(result) => out.push_str(&result.stdout),
                Err(err) => out.push_str(&format!("({err})\n")),
            }
            out.push('\n');
        }
        out
    }

    async fn status_text(&self) -> String {
        let status = self.status().await;
        let mut out = format!(
            "agent {} is {}; spent {}/{} units\n",
            status.agent_id, status.state, status.spent, status.budget
        );
        if let Some(record) = &status.sandbox {
            out.push_str(&format!("sandbox {} is {}\n", record.id, record.state));
        }
        if let Some(m) = &status.sandbox_metrics {
            out.push_str(&format!(
                "cpu {:.1}%, memory {:.0}/{:.0} MiB, pids {}\n",
                m.cpu_percent, m.memory_mb, m.memory_limit_mb, m.pids
            ));
        }
        out
    }
}

fn chat_prompt(message: &str) -> String {
    format!("You are assisting inside a repository sandbox at {}.\n\n{message}", sandbox_runtime::REPO_PATH)
}

/// Split `text` into pieces of at most `max` bytes, never inside a character.
fn split_utf8(text: &str, max: usize) -> Vec<&str> {
    let mut pieces = Vec::new();
    let mut rest = text;
    while !rest.is_empty() {
        let mut end = rest.len().min(max);
        while !rest.is_char_boundary(end) {
            end -= 1;
        }
        let (head, tail) = rest.split_at(end);
        pieces.push(head);
        rest = tail;
    }
    pieces
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn split_respects_char_boundaries() {
        let text = "aé".repeat(5);
        let pieces = split_utf8(&text, 4);
        assert!(pieces.iter().all(|p| p.len() <= 4));
        assert_eq!(pieces.concat(), text);
        assert!(split_utf8("", 4).is_empty());
    }

    #[test]
    fn state_names() {
        assert_eq!(AgentState::Busy.to_string(), "busy");
        assert_eq!(
            serde_json::to_value(AgentState::Initializing).unwrap(),
            "initializing"
        );
    }

    #[test]
    fn csv_skips_blanks() {
        let parts: Vec<&str> = csv(" a, ,b,").collect();
        assert_eq!(parts, vec!["a", "b"]);
    }

    #[test]
    fn default_config_grants_all_capabilities() {
        let config = CoordinatorConfig::default();
        assert!(config.agent_id.starts_with("agent-"));
        assert_eq!(config.capabilities.len(), Capability::ALL.len());
        assert!(!config.keep_sandbox);
    }
}
