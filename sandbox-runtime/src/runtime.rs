use std::collections::HashMap;
use std::env;
use std::fmt;
use std::sync::Arc;
use std::time::{Duration, Instant};

use dashmap::DashMap;
use futures_util::StreamExt;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;

use crate::engine::{
    ContainerEngine, ContainerSpec, ExecOutput, ExecSignal, ExecSpec, HardeningProfile,
    ResourceLimits,
};
use crate::error::{ExecError, Result, SandboxError};
use crate::events::{EventBus, LifecycleEvent};
use crate::metrics::RuntimeMetrics;
use crate::output::BoundedOutput;
use crate::util::{env_or, now_ts, truncate_chars};
use crate::{DEFAULT_SANDBOX_IMAGE, DEFAULT_SANDBOX_NETWORK, EXEC_MARKER_ENV, REPO_PATH, WORKSPACE_DIR};

/// Runtime configuration, read from environment variables at startup.
#[derive(Clone, Debug)]
pub struct SandboxRuntimeConfig {
    pub image: String,
    pub network: String,
    pub memory_mb: u64,
    pub cpu_cores: u64,
    pub read_only_root: bool,
    pub tmpfs_size_mb: u64,
    pub ready_attempts: u32,
    pub ready_interval: Duration,
    pub stop_grace: Duration,
    pub exec_timeout: Duration,
    pub kill_grace: Duration,
    pub max_output_bytes: usize,
    pub max_lifetime_secs: u64,
    pub reaper_interval_secs: u64,
    pub docker_host: Option<String>,
    pub pull_image: bool,
    pub git_author_name: String,
    pub git_author_email: String,
    /// Port inside the sandbox published on host loopback, if any.
    pub dev_server_port: Option<u16>,
}

impl Default for SandboxRuntimeConfig {
    fn default() -> Self {
        Self {
            image: DEFAULT_SANDBOX_IMAGE.to_string(),
            network: DEFAULT_SANDBOX_NETWORK.to_string(),
            memory_mb: 2048,
            cpu_cores: 2,
            read_only_root: false,
            tmpfs_size_mb: 512,
            ready_attempts: 30,
            ready_interval: Duration::from_millis(1000),
            stop_grace: Duration::from_secs(10),
            exec_timeout: Duration::from_secs(300),
            kill_grace: Duration::from_secs(5),
            max_output_bytes: 1024 * 1024,
            max_lifetime_secs: 14_400,
            reaper_interval_secs: 60,
            docker_host: None,
            pull_image: true,
            git_author_name: "Secure Agent".to_string(),
            git_author_email: "agent@sandbox.local".to_string(),
            dev_server_port: None,
        }
    }
}

impl SandboxRuntimeConfig {
    pub fn from_env() -> Self {
        let defaults = Self::default();
        Self {
            image: env::var("SANDBOX_IMAGE").unwrap_or(defaults.image),
            network: env::var("SANDBOX_NETWORK").unwrap_or(defaults.network),
            memory_mb: env_or("SANDBOX_MEMORY_MB", defaults.memory_mb).max(64),
            cpu_cores: env_or("SANDBOX_CPU_CORES", defaults.cpu_cores).max(1),
            read_only_root: env_or("SANDBOX_READ_ONLY_ROOT", defaults.read_only_root),
            tmpfs_size_mb: env_or("SANDBOX_TMPFS_SIZE_MB", defaults.tmpfs_size_mb).max(1),
            ready_attempts: env_or("SANDBOX_READY_ATTEMPTS", defaults.ready_attempts).max(1),
            ready_interval: Duration::from_millis(env_or("SANDBOX_READY_INTERVAL_MS", 1000)),
            stop_grace: Duration::from_secs(env_or("SANDBOX_STOP_GRACE_SECS", 10)),
            exec_timeout: Duration::from_secs(env_or("SANDBOX_EXEC_TIMEOUT_SECS", 300)),
            kill_grace: Duration::from_secs(env_or("SANDBOX_KILL_GRACE_SECS", 5)),
            max_output_bytes: env_or("SANDBOX_MAX_OUTPUT_BYTES", defaults.max_output_bytes),
            max_lifetime_secs: env_or("SANDBOX_MAX_LIFETIME_SECS", defaults.max_lifetime_secs),
            reaper_interval_secs: env_or("SANDBOX_REAPER_INTERVAL", defaults.reaper_interval_secs),
            docker_host: env::var("DOCKER_HOST").ok().filter(|v| !v.trim().is_empty()),
            pull_image: env_or("SANDBOX_PULL_IMAGE", defaults.pull_image),
            git_author_name: env::var("GIT_AUTHOR_NAME").unwrap_or(defaults.git_author_name),
            git_author_email: env::var("GIT_AUTHOR_EMAIL").unwrap_or(defaults.git_author_email),
            dev_server_port: env::var("SANDBOX_DEV_SERVER_PORT")
                .ok()
                .and_then(|v| v.parse::<u16>().ok()),
        }
    }

    pub fn hardening(&self) -> HardeningProfile {
        HardeningProfile::strict(self.read_only_root, self.tmpfs_size_mb)
    }

    pub fn limits(&self) -> ResourceLimits {
        ResourceLimits {
            memory_mb: self.memory_mb,
            cpu_cores: self.cpu_cores,
        }
    }
}

/// Sandbox lifecycle.
///
/// `stopped -> starting -> running -> stopping -> stopped`, with `error`
/// reachable from every state.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SandboxState {
    Stopped,
    Starting,
    Running,
    Stopping,
    Error,
}

impl SandboxState {
    pub fn can_transition_to(self, next: SandboxState) -> bool {
        use SandboxState::*;
        matches!(
            (self, next),
            (Stopped, Starting)
                | (Starting, Running)
                | (Running, Stopping)
                | (Stopping, Stopped)
                | (Stopped | Starting | Running | Stopping, Error)
        )
    }

    /// Whether the runtime resource and record may be deleted.
    pub fn is_removable(self) -> bool {
        matches!(self, SandboxState::Stopped | SandboxState::Error)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            SandboxState::Stopped => "stopped",
            SandboxState::Starting => "starting",
            SandboxState::Running => "running",
            SandboxState::Stopping => "stopping",
            SandboxState::Error => "error",
        }
    }
}

impl fmt::Display for SandboxState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Clone, Debug, Serialize)]
pub struct SandboxRecord {
    pub id: String,
    pub engine_id: Option<String>,
    pub name: String,
    pub agent_id: String,
    pub repo_url: Option<String>,
    pub repo_path: String,
    pub state: SandboxState,
    pub created_at: u64,
    pub ready_at: Option<u64>,
    /// Host loopback port mapped to the dev-server port, if published.
    pub exposed_port: Option<u16>,
    pub limits: ResourceLimits,
    pub last_error: Option<String>,
}

/// Inputs for [`SandboxOrchestrator::create_sandbox`].
#[derive(Clone, Debug)]
pub struct CreateSandboxRequest {
    pub agent_id: String,
    pub repo_url: Option<String>,
    pub session_token: String,
    pub gateway_url: String,
    pub capabilities: Vec<String>,
}

/// Normalized point-in-time resource usage. All zeros when unavailable.
#[derive(Clone, Debug, Default, PartialEq, Serialize)]
pub struct SandboxMetrics {
    pub cpu_percent: f64,
    pub memory_mb: f64,
    pub memory_limit_mb: f64,
    pub memory_percent: f64,
    pub net_rx_bytes: u64,
    pub net_tx_bytes: u64,
    pub pids: u64,
}

#[derive(Clone, Debug, Default)]
pub struct ExecOptions {
    pub timeout: Option<Duration>,
    pub workdir: Option<String>,
    /// Extra variables for this exec only. Values never appear in the
    /// command text or lifecycle events.
    pub env: Vec<(String, String)>,
}

impl ExecOptions {
    pub fn with_timeout(timeout: Duration) -> Self {
        Self {
            timeout: Some(timeout),
            ..Default::default()
        }
    }

    pub fn in_repo() -> Self {
        Self {
            workdir: Some(REPO_PATH.to_string()),
            ..Default::default()
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct ExecResult {
    pub exit_code: i64,
    pub stdout: String,
    pub stderr: String,
    pub duration_ms: u64,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum OutputStream {
    Stdout,
    Stderr,
}

/// Events emitted by [`SandboxOrchestrator::exec_stream`].
#[derive(Clone, Debug, PartialEq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ExecEvent {
    Start { command: String },
    Output { stream: OutputStream, data: String },
    Complete { exit_code: i64, duration_ms: u64 },
    Error { message: String },
}

const EXEC_EVENT_BUFFER: usize = 64;
const EXIT_CODE_POLLS: u32 = 20;

/// Provisions and drives hardened per-agent sandboxes.
#[derive(Clone)]
pub struct SandboxOrchestrator {
    engine: Arc<dyn ContainerEngine>,
    config: Arc<SandboxRuntimeConfig>,
    records: Arc<DashMap<String, SandboxRecord>>,
    events: EventBus,
    metrics: Arc<RuntimeMetrics>,
}

impl SandboxOrchestrator {
    pub fn new(
        engine: Arc<dyn ContainerEngine>,
        config: SandboxRuntimeConfig,
        events: EventBus,
        metrics: Arc<RuntimeMetrics>,
    ) -> Self {
        Self {
            engine,
            config: Arc::new(config),
            records: Arc::new(DashMap::new()),
            events,
            metrics,
        }
    }

    pub fn config(&self) -> &SandboxRuntimeConfig {
        &self.config
    }

    pub fn events(&self) -> &EventBus {
        &self.events
    }

    pub fn metrics(&self) -> &RuntimeMetrics {
        &self.metrics
    }

    pub fn get(&self, sandbox_id: &str) -> Result<SandboxRecord> {
        self.records
            .get(sandbox_id)
            .map(|r| r.clone())
            .ok_or_else(|| SandboxError::NotFound(format!("sandbox {sandbox_id}")))
    }

    pub fn list(&self) -> Vec<SandboxRecord> {
        self.records.iter().map(|r| r.value().clone()).collect()
    }

    pub fn list_for_agent(&self, agent_id: &str) -> Vec<SandboxRecord> {
        self.records
            .iter()
            .filter(|r| r.agent_id == agent_id)
            .map(|r| r.value().clone())
            .collect()
    }

    /// Move a record along the state machine and publish the change.
    fn transition(&self, sandbox_id: &str, to: SandboxState) -> Result<SandboxState> {
        let (from, agent_id) = {
            let mut record = self
                .records
                .get_mut(sandbox_id)
                .ok_or_else(|| SandboxError::NotFound(format!("sandbox {sandbox_id}")))?;
            let from = record.state;
            if !from.can_transition_to(to) {
                return Err(SandboxError::InvalidTransition {
                    from: from.to_string(),
                    to: to.to_string(),
                });
            }
            record.state = to;
            if to == SandboxState::Running {
                record.ready_at = Some(now_ts());
            }
            (from, record.agent_id.clone())
        };
        tracing::debug!(sandbox_id, %from, %to, "sandbox transition");
        self.events.publish(LifecycleEvent::SandboxStateChanged {
            sandbox_id: sandbox_id.to_string(),
            agent_id,
            from,
            to,
        });
        Ok(from)
    }

    fn mark_error(&self, sandbox_id: &str, err: &SandboxError) {
        if let Some(mut record) = self.records.get_mut(sandbox_id) {
            record.last_error = Some(err.to_string());
        }
        if let Err(transition_err) = self.transition(sandbox_id, SandboxState::Error) {
            tracing::debug!(sandbox_id, %transition_err, "already in error state");
        }
    }

    /// Provision a hardened sandbox for `agent_id` and wait until it is running.
    ///
    /// On failure the record is left in `error` and the engine resource is
    /// removed on a best-effort basis.
    pub async fn create_sandbox(&self, request: CreateSandboxRequest) -> Result<String> {
        if request.agent_id.trim().is_empty() {
            return Err(SandboxError::Validation("agent_id is required".into()));
        }
        let hardening = self.config.hardening();
        hardening.ensure_mandatory()?;
        let limits = self.config.limits();
        if limits.memory_mb == 0 || limits.cpu_cores == 0 {
            return Err(SandboxError::Validation(
                "sandbox resource ceilings must be non-zero".into(),
            ));
        }

        let sandbox_id = format!("sandbox-{}", uuid::Uuid::new_v4());
        let name = container_name(&request.agent_id, &sandbox_id);
        let record = SandboxRecord {
            id: sandbox_id.clone(),
            engine_id: None,
            name: name.clone(),
            agent_id: request.agent_id.clone(),
            repo_url: request.repo_url.clone(),
            repo_path: REPO_PATH.to_string(),
            state: SandboxState::Stopped,
            created_at: now_ts(),
            ready_at: None,
            exposed_port: None,
            limits,
            last_error: None,
        };
        self.records.insert(sandbox_id.clone(), record);
        self.transition(&sandbox_id, SandboxState::Starting)?;

        let mut labels = HashMap::new();
        labels.insert("agent-sandbox.agent-id".to_string(), request.agent_id.clone());
        labels.insert("agent-sandbox.sandbox-id".to_string(), sandbox_id.clone());
        labels.insert(
            "agent-sandbox.capabilities".to_string(),
            request.capabilities.join(","),
        );

        // Only these three variables cross into the sandbox.
        let spec = ContainerSpec {
            name,
            image: self.config.image.clone(),
            env: vec![
                ("AGENT_ID".to_string(), request.agent_id.clone()),
                ("SESSION_TOKEN".to_string(), request.session_token.clone()),
                ("GATEWAY_URL".to_string(), request.gateway_url.clone()),
            ],
            labels,
            network: self.config.network.clone(),
            hardening,
            limits,
            workdir: WORKSPACE_DIR.to_string(),
            exposed_port: self.config.dev_server_port,
            command: Some(vec!["sleep".to_string(), "infinity".to_string()]),
        };

        match self.provision(&sandbox_id, &spec).await {
            Ok(()) => {
                self.metrics.record_sandbox_created();
                tracing::info!(
                    sandbox_id,
                    agent_id = %request.agent_id,
                    "sandbox running"
                );
                Ok(sandbox_id)
            }
            Err(err) => {
                tracing::error!(sandbox_id, agent_id = %request.agent_id, %err, "sandbox provisioning failed");
                self.metrics.record_sandbox_failed();
                self.mark_error(&sandbox_id, &err);
                let engine_id = self.records.get(&sandbox_id).and_then(|r| r.engine_id.clone());
                if let Some(engine_id) = engine_id {
                    if let Err(cleanup_err) = self.engine.remove(&engine_id).await {
                        tracing::warn!(sandbox_id, %cleanup_err, "failed to clean up container");
                    }
                }
                Err(err)
            }
        }
    }

    async fn provision(&self, sandbox_id: &str, spec: &ContainerSpec) -> Result<()> {
        self.engine.ensure_network(&spec.network).await?;
        let engine_id = self.engine.create(spec).await?;
        if let Some(mut record) = self.records.get_mut(sandbox_id) {
            record.engine_id = Some(engine_id.clone());
        }
        self.engine.start(&engine_id).await?;

        for attempt in 1..=self.config.ready_attempts {
            let info = self.engine.inspect(&engine_id, spec.exposed_port).await?;
            if info.status.is_running() {
                if let Some(mut record) = self.records.get_mut(sandbox_id) {
                    record.exposed_port = info.host_port;
                }
                self.transition(sandbox_id, SandboxState::Running)?;
                return Ok(());
            }
            if info.status.is_terminal() {
                return Err(SandboxError::Docker(format!(
                    "container {} entered {:?} during startup",
                    spec.name, info.status
                )));
            }
            tracing::debug!(sandbox_id, attempt, status = ?info.status, "waiting for sandbox");
            tokio::time::sleep(self.config.ready_interval).await;
        }
        Err(SandboxError::Docker(format!(
            "container {} not ready after {} attempts",
            spec.name, self.config.ready_attempts
        )))
    }

    fn running_engine_id(&self, sandbox_id: &str) -> Result<String> {
        let record = self.get(sandbox_id)?;
        if record.state != SandboxState::Running {
            return Err(ExecError::NotRunning(record.state.to_string()).into());
        }
        record
            .engine_id
            .ok_or_else(|| ExecError::NotRunning("no container".into()).into())
    }

    /// Run a shell command and collect its output.
    ///
    /// A non-zero exit is returned as [`ExecError::NonZeroExit`] carrying the
    /// captured output.
    pub async fn exec(
        &self,
        sandbox_id: &str,
        command: &str,
        options: ExecOptions,
    ) -> Result<ExecResult> {
        let engine_id = self.running_engine_id(sandbox_id)?;
        self.run_exec(sandbox_id, &engine_id, command, &options, None)
            .await
    }

    /// Run a shell command, streaming start/output/complete/error events.
    pub fn exec_stream(
        &self,
        sandbox_id: &str,
        command: &str,
        options: ExecOptions,
    ) -> Result<ReceiverStream<ExecEvent>> {
        let engine_id = self.running_engine_id(sandbox_id)?;
        let (tx, rx) = mpsc::channel(EXEC_EVENT_BUFFER);
        let this = self.clone();
        let sandbox_id = sandbox_id.to_string();
        let command = command.to_string();
        tokio::spawn(async move {
            let _ = tx
                .send(ExecEvent::Start {
                    command: command.clone(),
                })
                .await;
            let terminal = match this
                .run_exec(&sandbox_id, &engine_id, &command, &options, Some(&tx))
                .await
            {
                Ok(result) => ExecEvent::Complete {
                    exit_code: result.exit_code,
                    duration_ms: result.duration_ms,
                },
                Err(err) => ExecEvent::Error {
                    message: err.to_string(),
                },
            };
            let _ = tx.send(terminal).await;
        });
        Ok(ReceiverStream::new(rx))
    }

    async fn run_exec(
        &self,
        sandbox_id: &str,
        engine_id: &str,
        command: &str,
        options: &ExecOptions,
        events: Option<&mpsc::Sender<ExecEvent>>,
    ) -> Result<ExecResult> {
        let timeout = options.timeout.unwrap_or(self.config.exec_timeout);
        let marker = uuid::Uuid::new_v4().to_string();
        let spec = ExecSpec {
            cmd: vec!["sh".to_string(), "-c".to_string(), command.to_string()],
            env: std::iter::once((EXEC_MARKER_ENV.to_string(), marker.clone()))
                .chain(options.env.iter().cloned())
                .collect(),
            workdir: Some(
                options
                    .workdir
                    .clone()
                    .unwrap_or_else(|| WORKSPACE_DIR.to_string()),
            ),
        };

        self.events.publish(LifecycleEvent::ExecStarted {
            sandbox_id: sandbox_id.to_string(),
            command: truncate_chars(command, 200),
        });
        let started = Instant::now();
        let mut handle = self
            .engine
            .exec(engine_id, &spec)
            .await
            .map_err(|err| ExecError::Engine(err.to_string()))?;

        let mut output = BoundedOutput::new(self.config.max_output_bytes);
        let collect = async {
            while let Some(chunk) = handle.output.next().await {
                let chunk = chunk.map_err(|err| ExecError::Engine(err.to_string()))?;
                if let Some(tx) = events {
                    let (stream, data) = match &chunk {
                        ExecOutput::Stdout(data) => (OutputStream::Stdout, data.clone()),
                        ExecOutput::Stderr(data) => (OutputStream::Stderr, data.clone()),
                    };
                    let _ = tx.send(ExecEvent::Output { stream, data }).await;
                }
                if !output.push(&chunk) {
                    return Ok::<bool, ExecError>(false);
                }
            }
            Ok(true)
        };
        let outcome = tokio::time::timeout(timeout, collect).await;
        let duration_ms = started.elapsed().as_millis() as u64;

        let result = match outcome {
            Err(_) => {
                tracing::warn!(sandbox_id, timeout_secs = timeout.as_secs(), "command timed out");
                self.terminate(engine_id, &marker);
                let (stdout, stderr) = output.into_parts();
                Err(ExecError::Timeout {
                    timeout_secs: timeout.as_secs(),
                    stdout,
                    stderr,
                })
            }
            Ok(Err(err)) => Err(err),
            Ok(Ok(false)) => {
                tracing::warn!(sandbox_id, limit = output.limit_bytes(), "command output overflow");
                self.terminate(engine_id, &marker);
                let limit_bytes = output.limit_bytes();
                let (stdout, stderr) = output.into_parts();
                Err(ExecError::OutputOverflow {
                    limit_bytes,
                    stdout,
                    stderr,
                })
            }
            Ok(Ok(true)) => {
                let exit_code = self.wait_exit_code(&handle.exec_id).await;
                let (stdout, stderr) = output.into_parts();
                match exit_code {
                    Ok(0) => Ok(ExecResult {
                        exit_code: 0,
                        stdout,
                        stderr,
                        duration_ms,
                    }),
                    Ok(exit_code) => Err(ExecError::NonZeroExit {
                        exit_code,
                        stdout,
                        stderr,
                    }),
                    Err(err) => Err(err),
                }
            }
        };

        let exit_code = match &result {
            Ok(r) => Some(r.exit_code),
            Err(ExecError::NonZeroExit { exit_code, .. }) => Some(*exit_code),
            Err(_) => None,
        };
        self.metrics.record_exec(
            result.is_ok(),
            matches!(result, Err(ExecError::Timeout { .. })),
        );
        self.events.publish(LifecycleEvent::ExecFinished {
            sandbox_id: sandbox_id.to_string(),
            exit_code,
            duration_ms,
        });
        result.map_err(SandboxError::from)
    }

    async fn wait_exit_code(&self, exec_id: &str) -> std::result::Result<i64, ExecError> {
        for _ in 0..EXIT_CODE_POLLS {
            match self.engine.exec_exit_code(exec_id).await {
                Ok(Some(code)) => return Ok(code),
                Ok(None) => tokio::time::sleep(Duration::from_millis(50)).await,
                Err(err) => return Err(ExecError::Engine(err.to_string())),
            }
        }
        Err(ExecError::Engine(format!(
            "exit code for exec {exec_id} unavailable"
        )))
    }

    /// SIGTERM the exec now, SIGKILL after the kill grace. Runs detached so
    /// the caller gets its error at the deadline.
    fn terminate(&self, engine_id: &str, marker: &str) {
        let engine = self.engine.clone();
        let grace = self.config.kill_grace;
        let engine_id = engine_id.to_string();
        let marker = marker.to_string();
        tokio::spawn(async move {
            if let Err(err) = engine
                .signal_exec(&engine_id, &marker, ExecSignal::Term)
                .await
            {
                tracing::warn!(%err, "failed to send SIGTERM to timed-out command");
            }
            tokio::time::sleep(grace).await;
            if let Err(err) = engine
                .signal_exec(&engine_id, &marker, ExecSignal::Kill)
                .await
            {
                tracing::warn!(%err, "failed to send SIGKILL to timed-out command");
            }
        });
    }

    /// Graceful stop, escalating to a forced kill.
    pub async fn stop(&self, sandbox_id: &str) -> Result<()> {
        let record = self.get(sandbox_id)?;
        match record.state {
            SandboxState::Stopped => return Ok(()),
            SandboxState::Error => {
                // Make sure nothing keeps running behind an errored record.
                if let Some(engine_id) = &record.engine_id {
                    if let Err(err) = self.engine.kill(engine_id).await {
                        tracing::debug!(sandbox_id, %err, "kill of errored sandbox failed");
                    }
                }
                return Ok(());
            }
            _ => {}
        }
        self.transition(sandbox_id, SandboxState::Stopping)?;

        let Some(engine_id) = record.engine_id else {
            self.transition(sandbox_id, SandboxState::Stopped)?;
            return Ok(());
        };
        if let Err(stop_err) = self.engine.stop(&engine_id, self.config.stop_grace).await {
            tracing::warn!(sandbox_id, %stop_err, "graceful stop failed, killing");
            if let Err(kill_err) = self.engine.kill(&engine_id).await {
                self.mark_error(sandbox_id, &kill_err);
                return Err(kill_err);
            }
        }
        self.transition(sandbox_id, SandboxState::Stopped)?;
        tracing::info!(sandbox_id, "sandbox stopped");
        Ok(())
    }

    /// Delete the runtime resource and the record together.
    pub async fn remove(&self, sandbox_id: &str) -> Result<()> {
        let record = self.get(sandbox_id)?;
        if !record.state.is_removable() {
            return Err(SandboxError::InvalidTransition {
                from: record.state.to_string(),
                to: "removed".into(),
            });
        }
        if let Some(engine_id) = &record.engine_id {
            self.engine.remove(engine_id).await?;
        }
        self.records.remove(sandbox_id);
        if record.ready_at.is_some() {
            self.metrics.record_sandbox_removed();
        }
        self.events.publish(LifecycleEvent::SandboxRemoved {
            sandbox_id: sandbox_id.to_string(),
            agent_id: record.agent_id.clone(),
        });
        tracing::info!(sandbox_id, agent_id = %record.agent_id, "sandbox removed");
        Ok(())
    }

    /// Stop then remove. Removal is attempted even when the stop fails.
    pub async fn teardown(&self, sandbox_id: &str) -> Result<()> {
        if let Err(err) = self.stop(sandbox_id).await {
            tracing::warn!(sandbox_id, %err, "stop failed during teardown");
            if self.get(sandbox_id).map(|r| !r.state.is_removable()).unwrap_or(false) {
                self.mark_error(sandbox_id, &err);
            }
        }
        self.remove(sandbox_id).await
    }

    /// Current resource usage. Failures degrade to zeros.
    pub async fn get_metrics(&self, sandbox_id: &str) -> Result<SandboxMetrics> {
        let record = self.get(sandbox_id)?;
        let Some(engine_id) = record.engine_id else {
            return Ok(SandboxMetrics::default());
        };
        match self.engine.stats(&engine_id).await {
            Ok(report) => Ok(parse_stats(&report).unwrap_or_else(|| {
                tracing::warn!(sandbox_id, "unparseable stats report");
                SandboxMetrics::default()
            })),
            Err(err) => {
                tracing::warn!(sandbox_id, %err, "stats unavailable");
                Ok(SandboxMetrics::default())
            }
        }
    }

    pub async fn logs(&self, sandbox_id: &str, tail: usize) -> Result<String> {
        let record = self.get(sandbox_id)?;
        let engine_id = record
            .engine_id
            .ok_or_else(|| SandboxError::NotFound(format!("container for {sandbox_id}")))?;
        self.engine.logs(&engine_id, tail).await
    }
}

fn container_name(agent_id: &str, sandbox_id: &str) -> String {
    let slug: String = agent_id
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() { c.to_ascii_lowercase() } else { '-' })
        .take(32)
        .collect();
    let suffix = sandbox_id.rsplit('-').next().unwrap_or(sandbox_id);
    format!("agent-sandbox-{}-{suffix}", slug.trim_matches('-'))
}

fn as_u64(value: &Value, pointer: &str) -> Option<u64> {
    value.pointer(pointer).and_then(Value::as_u64)
}

/// Normalize a Docker-shaped stats document.
pub fn parse_stats(report: &Value) -> Option<SandboxMetrics> {
    let cpu_total = as_u64(report, "/cpu_stats/cpu_usage/total_usage")?;
    let memory_usage = as_u64(report, "/memory_stats/usage")?;

    let pre_total = as_u64(report, "/precpu_stats/cpu_usage/total_usage").unwrap_or(0);
    let system = as_u64(report, "/cpu_stats/system_cpu_usage").unwrap_or(0);
    let pre_system = as_u64(report, "/precpu_stats/system_cpu_usage").unwrap_or(0);
    let cpus = as_u64(report, "/cpu_stats/online_cpus")
        .filter(|n| *n > 0)
        .unwrap_or(1);
    let cpu_delta = cpu_total.saturating_sub(pre_total) as f64;
    let system_delta = system.saturating_sub(pre_system) as f64;
    let cpu_percent = if cpu_delta > 0.0 && system_delta > 0.0 {
        cpu_delta / system_delta * cpus as f64 * 100.0
    } else {
        0.0
    };

    let memory_limit = as_u64(report, "/memory_stats/limit").unwrap_or(0);
    let to_mb = |bytes: u64| bytes as f64 / (1024.0 * 1024.0);
    let memory_percent = if memory_limit > 0 {
        memory_usage as f64 / memory_limit as f64 * 100.0
    } else {
        0.0
    };

    let (net_rx_bytes, net_tx_bytes) = report
        .get("networks")
        .and_then(Value::as_object)
        .map(|nets| {
            nets.values().fold((0u64, 0u64), |(rx, tx), iface| {
                (
                    rx + iface.get("rx_bytes").and_then(Value::as_u64).unwrap_or(0),
                    tx + iface.get("tx_bytes").and_then(Value::as_u64).unwrap_or(0),
                )
            })
        })
        .unwrap_or((0, 0));

    Some(SandboxMetrics {
        cpu_percent,
        memory_mb: to_mb(memory_usage),
        memory_limit_mb: to_mb(memory_limit),
        memory_percent,
        net_rx_bytes,
        net_tx_bytes,
        pids: as_u64(report, "/pids_stats/current").unwrap_or(0),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::EngineStatus;
    use crate::engine::fake::{FakeEngine, ScriptedExec};
    use serde_json::json;
    use std::sync::atomic::Ordering;

    fn fast_config() -> SandboxRuntimeConfig {
        SandboxRuntimeConfig {
            ready_attempts: 3,
            ready_interval: Duration::from_millis(10),
            ..Default::default()
        }
    }

    fn orchestrator(engine: Arc<FakeEngine>) -> SandboxOrchestrator {
        SandboxOrchestrator::new(
            engine,
            fast_config(),
            EventBus::new(),
            Arc::new(RuntimeMetrics::new()),
        )
    }

    fn request() -> CreateSandboxRequest {
        CreateSandboxRequest {
            agent_id: "agent-1".into(),
            repo_url: Some("https://github.com/acme/widgets".into()),
            session_token: "v4.local.token".into(),
            gateway_url: "http://host.docker.internal:8787".into(),
            capabilities: vec!["ai_request".into()],
        }
    }

    #[test]
    fn state_machine_edges() {
        use SandboxState::*;
        assert!(Stopped.can_transition_to(Starting));
        assert!(Starting.can_transition_to(Running));
        assert!(Running.can_transition_to(Stopping));
        assert!(Stopping.can_transition_to(Stopped));
        assert!(Starting.can_transition_to(Error));
        assert!(!Stopped.can_transition_to(Running));
        assert!(!Starting.can_transition_to(Stopped));
        assert!(!Error.can_transition_to(Running));
    }

    #[tokio::test]
    async fn create_passes_through_starting_to_running() {
        let engine = Arc::new(FakeEngine::new());
        let orch = orchestrator(engine.clone());
        let mut events = orch.events().subscribe();

        let id = orch.create_sandbox(request()).await.unwrap();
        assert_eq!(orch.get(&id).unwrap().state, SandboxState::Running);

        let mut seen = Vec::new();
        while let Ok(LifecycleEvent::SandboxStateChanged { from, to, .. }) = events.try_recv() {
            seen.push((from, to));
        }
        assert_eq!(
            seen,
            vec![
                (SandboxState::Stopped, SandboxState::Starting),
                (SandboxState::Starting, SandboxState::Running),
            ]
        );

        let spec = &engine.created_specs()[0];
        let keys: Vec<&str> = spec.env.iter().map(|(k, _)| k.as_str()).collect();
        assert_eq!(keys, vec!["AGENT_ID", "SESSION_TOKEN", "GATEWAY_URL"]);
        assert!(spec.hardening.no_new_privileges);
        assert_eq!(spec.hardening.cap_drop, vec!["ALL".to_string()]);
        assert_eq!(spec.network, DEFAULT_SANDBOX_NETWORK);
    }

    #[tokio::test]
    async fn failed_create_lands_in_error() {
        let engine = Arc::new(FakeEngine::new());
        engine.fail_create.store(true, Ordering::SeqCst);
        let orch = orchestrator(engine);

        assert!(orch.create_sandbox(request()).await.is_err());
        let records = orch.list_for_agent("agent-1");
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].state, SandboxState::Error);
        assert!(records[0].last_error.is_some());
    }

    #[tokio::test]
    async fn readiness_exhaustion_lands_in_error_and_cleans_up() {
        let engine = Arc::new(FakeEngine::new());
        engine.never_ready.store(true, Ordering::SeqCst);
        let orch = orchestrator(engine.clone());

        let err = orch.create_sandbox(request()).await.unwrap_err();
        assert!(err.to_string().contains("not ready after 3 attempts"), "{err}");
        assert_eq!(orch.list()[0].state, SandboxState::Error);
        assert_eq!(engine.container_count(), 0);
    }

    #[tokio::test]
    async fn exec_requires_running_state() {
        let engine = Arc::new(FakeEngine::new());
        let orch = orchestrator(engine);
        let id = orch.create_sandbox(request()).await.unwrap();
        orch.stop(&id).await.unwrap();

        let err = orch.exec(&id, "ls", ExecOptions::default()).await.unwrap_err();
        assert!(matches!(err, SandboxError::Exec(ExecError::NotRunning(_))));
    }

    #[tokio::test]
    async fn non_zero_exit_carries_output() {
        let engine = Arc::new(
            FakeEngine::new().with_script("npm test", ScriptedExec {
                exit_code: 1,
                stdout: "1 failing".into(),
                stderr: "AssertionError".into(),
                delay: Duration::ZERO,
            }),
        );
        let orch = orchestrator(engine);
        let id = orch.create_sandbox(request()).await.unwrap();

        match orch.exec(&id, "npm test", ExecOptions::default()).await {
            Err(SandboxError::Exec(ExecError::NonZeroExit {
                exit_code,
                stdout,
                stderr,
            })) => {
                assert_eq!(exit_code, 1);
                assert_eq!(stdout, "1 failing");
                assert_eq!(stderr, "AssertionError");
            }
            other => panic!("unexpected result: {other:?}"),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn timeout_terminates_within_margin() {
        let engine = Arc::new(
            FakeEngine::new().with_script("sleep 30", ScriptedExec::hang(Duration::from_secs(30))),
        );
        let orch = orchestrator(engine.clone());
        let id = orch.create_sandbox(request()).await.unwrap();

        let started = tokio::time::Instant::now();
        let err = orch
            .exec(&id, "sleep 30", ExecOptions::with_timeout(Duration::from_secs(5)))
            .await
            .unwrap_err();
        let elapsed = started.elapsed();

        assert!(matches!(
            err,
            SandboxError::Exec(ExecError::Timeout { timeout_secs: 5, .. })
        ));
        assert!(elapsed < Duration::from_secs(10), "took {elapsed:?}");

        // Let the detached escalation run.
        tokio::time::sleep(Duration::from_secs(6)).await;
        let signals: Vec<ExecSignal> = engine.signals().into_iter().map(|(_, s)| s).collect();
        assert_eq!(signals, vec![ExecSignal::Term, ExecSignal::Kill]);
    }

    #[tokio::test]
    async fn output_overflow_terminates_command() {
        let engine = Arc::new(
            FakeEngine::new().with_script("yes", ScriptedExec::ok("y\n".repeat(10_000))),
        );
        let orch = SandboxOrchestrator::new(
            engine.clone(),
            SandboxRuntimeConfig {
                max_output_bytes: 1024,
                ..fast_config()
            },
            EventBus::new(),
            Arc::new(RuntimeMetrics::new()),
        );
        let id = orch.create_sandbox(request()).await.unwrap();

        match orch.exec(&id, "yes", ExecOptions::default()).await {
            Err(SandboxError::Exec(ExecError::OutputOverflow {
                limit_bytes,
                stdout,
                ..
            })) => {
                assert_eq!(limit_bytes, 1024);
                assert_eq!(stdout.len(), 1024);
            }
            other => panic!("unexpected result: {other:?}"),
        }
    }

    #[tokio::test]
    async fn exec_stream_emits_start_output_complete() {
        let engine = Arc::new(FakeEngine::new().with_script("git status", ScriptedExec::ok("clean")));
        let orch = orchestrator(engine);
        let id = orch.create_sandbox(request()).await.unwrap();

        let events: Vec<ExecEvent> = orch
            .exec_stream(&id, "git status", ExecOptions::default())
            .unwrap()
            .collect()
            .await;
        assert_eq!(
            events[0],
            ExecEvent::Start {
                command: "git status".into()
            }
        );
        assert_eq!(
            events[1],
            ExecEvent::Output {
                stream: OutputStream::Stdout,
                data: "clean".into()
            }
        );
        assert!(matches!(events[2], ExecEvent::Complete { exit_code: 0, .. }));
    }

    #[tokio::test]
    async fn remove_requires_stopped_or_error() {
        let engine = Arc::new(FakeEngine::new());
        let orch = orchestrator(engine.clone());
        let id = orch.create_sandbox(request()).await.unwrap();

        assert!(matches!(
            orch.remove(&id).await,
            Err(SandboxError::InvalidTransition { .. })
        ));
        orch.teardown(&id).await.unwrap();
        assert!(orch.get(&id).is_err());
        assert_eq!(engine.container_count(), 0);
    }

    #[tokio::test]
    async fn stop_escalates_to_kill() {
        let engine = Arc::new(FakeEngine::new());
        let orch = orchestrator(engine.clone());
        let id = orch.create_sandbox(request()).await.unwrap();
        engine.fail_stop.store(true, Ordering::SeqCst);

        orch.stop(&id).await.unwrap();
        assert_eq!(orch.get(&id).unwrap().state, SandboxState::Stopped);
        let calls = engine.calls();
        let stop = calls.iter().position(|c| c.starts_with("stop ")).unwrap();
        let kill = calls.iter().position(|c| c.starts_with("kill ")).unwrap();
        assert!(stop < kill);
    }

    #[tokio::test]
    async fn teardown_removes_dead_container() {
        let engine = Arc::new(FakeEngine::new());
        let orch = orchestrator(engine.clone());
        let id = orch.create_sandbox(request()).await.unwrap();
        let engine_id = orch.get(&id).unwrap().engine_id.unwrap();
        engine.set_status(&engine_id, EngineStatus::Dead);
        engine.fail_stop.store(true, Ordering::SeqCst);

        orch.teardown(&id).await.unwrap();
        assert!(orch.list().is_empty());
    }

    #[tokio::test]
    async fn metrics_parse_and_degrade() {
        let engine = Arc::new(FakeEngine::new());
        let orch = orchestrator(engine.clone());
        let id = orch.create_sandbox(request()).await.unwrap();

        let metrics = orch.get_metrics(&id).await.unwrap();
        assert!((metrics.cpu_percent - 40.0).abs() < 1e-6);
        assert!((metrics.memory_mb - 256.0).abs() < 1e-6);
        assert!((metrics.memory_percent - 12.5).abs() < 1e-6);
        assert_eq!(metrics.net_rx_bytes, 1024);
        assert_eq!(metrics.pids, 12);

        engine.set_stats(json!({ "garbage": true }));
        assert_eq!(orch.get_metrics(&id).await.unwrap(), SandboxMetrics::default());

        engine.fail_stats.store(true, Ordering::SeqCst);
        assert_eq!(orch.get_metrics(&id).await.unwrap(), SandboxMetrics::default());
    }

    #[test]
    fn container_names_are_sanitized() {
        let name = container_name("Agent_42/Alpha", "sandbox-1234-abcd");
        assert_eq!(name, "agent-sandbox-agent-42-alpha-abcd");
    }
}
