//! Runner for a single secure agent.
//!
//! Starts the model gateway, initializes the coordinator and then either runs
//! the task in `TASK_JSON` once, reads chat messages from stdin
//! (`AGENT_CHAT=true`), or idles until ctrl-c.

use std::sync::Arc;

use sandbox_runtime::backend::HttpModelBackend;
use sandbox_runtime::engine::docker::DockerEngine;
use sandbox_runtime::metrics::RuntimeMetrics;
use sandbox_runtime::pull_request::PullRequestClient;
use sandbox_runtime::reaper::spawn_reaper;
use sandbox_runtime::util::env_or;
use sandbox_runtime::{
    EventBus, Gateway, GatewayConfig, SandboxError, SandboxOrchestrator, SandboxRuntimeConfig,
    TokenManager, TokenManagerConfig,
};
use secure_agent_lib::{
    AgentTask, CoordinatorConfig, CoordinatorError, CoordinatorEvent, CoordinatorServices,
    ProgressSink, SecureAgentCoordinator,
};
use tokio::io::{AsyncBufReadExt, BufReader};
use tracing::{error, info, warn};

#[derive(Debug, thiserror::Error)]
enum RunnerError {
    #[error(transparent)]
    Sandbox(#[from] SandboxError),
    #[error(transparent)]
    Coordinator(#[from] CoordinatorError),
    #[error("invalid TASK_JSON: {0}")]
    Task(#[from] serde_json::Error),
    #[error("io: {0}")]
    Io(#[from] std::io::Error),
}

struct LogProgress;

impl ProgressSink for LogProgress {
    fn on_event(&self, event: &CoordinatorEvent) {
        match event {
            CoordinatorEvent::StepCompleted { task_id, step } => {
                info!(task_id = %task_id, step = %step.name, status = ?step.status, duration_ms = step.duration_ms, "step")
            }
            CoordinatorEvent::SpendUpdated { spent, budget } => info!(spent, budget, "spend"),
            other => tracing::debug!(event = ?other, "coordinator event"),
        }
    }
}

#[tokio::main]
async fn main() -> Result<(), RunnerError> {
    setup_log();

    let events = EventBus::new();
    let metrics = Arc::new(RuntimeMetrics::new());

    let runtime_config = SandboxRuntimeConfig::from_env();
    let engine = DockerEngine::connect(runtime_config.docker_host.as_deref(), runtime_config.pull_image).await?;
    let orchestrator = SandboxOrchestrator::new(
        Arc::new(engine),
        runtime_config,
        events.clone(),
        metrics.clone(),
    );

    let gateway_config = GatewayConfig::from_env();
    let backend = HttpModelBackend::new(
        &gateway_config.model_api_url,
        gateway_config.model_api_key.as_deref().unwrap_or_default(),
        gateway_config.request_timeout,
    )?;
    let tokens = Arc::new(TokenManager::new(TokenManagerConfig::from_env(), events.clone())?);
    let gateway = Arc::new(Gateway::new(
        gateway_config,
        tokens.clone(),
        Arc::new(backend),
        metrics,
        events,
    ));
    let addr = gateway.ensure_listening().await?;
    info!(%addr, "model gateway up");

    let sweeper = tokens.spawn_sweeper();
    let reaper = spawn_reaper(orchestrator.clone());

    let config = CoordinatorConfig::from_env();
    let pull_requests = PullRequestClient::new(config.github_token.clone());
    let coordinator = SecureAgentCoordinator::new(
        config,
        CoordinatorServices {
            tokens,
            gateway: gateway.clone(),
            orchestrator,
            pull_requests,
        },
    )
    .with_progress(Arc::new(LogProgress));
    coordinator.initialize().await?;
    info!(agent_id = coordinator.agent_id(), "agent ready");

    let result = run(&coordinator).await;
    if let Err(err) = &result {
        error!(%err, "agent run failed");
    }

    if let Err(err) = coordinator.stop().await {
        warn!(%err, "coordinator stop failed");
    }
    gateway.shutdown().await;
    sweeper.abort();
    reaper.abort();
    info!("agent exited");
    result
}

async fn run(coordinator: &SecureAgentCoordinator) -> Result<(), RunnerError> {
    if let Ok(raw) = std::env::var("TASK_JSON") {
        let task: AgentTask = serde_json::from_str(&raw)?;
        let outcome = coordinator.execute_task(task).await?;
        println!("{}", serde_json::to_string_pretty(&outcome)?);
        return Ok(());
    }

    if env_or("AGENT_CHAT", false) {
        let repo = std::env::var("AGENT_REPO_URL").ok();
        let sandbox_id = coordinator.open_sandbox(repo.as_deref()).await?;
        info!(%sandbox_id, "chat sandbox ready; reading messages from stdin");
        let mut lines = BufReader::new(tokio::io::stdin()).lines();
        loop {
            tokio::select! {
                line = lines.next_line() => {
                    let Some(line) = line? else { break };
                    if line.trim().is_empty() {
                        continue;
                    }
                    match coordinator.chat(&line).await {
                        Ok(reply) => println!("{}", reply.content),
                        Err(err) if err.is_budget() || err.is_security() => return Err(err.into()),
                        Err(err) => warn!(%err, "chat failed"),
                    }
                }
                _ = tokio::signal::ctrl_c() => break,
            }
        }
        return Ok(());
    }

    info!("no TASK_JSON; serving until ctrl-c");
    tokio::signal::ctrl_c().await?;
    Ok(())
}

fn setup_log() {
    use tracing_subscriber::prelude::*;
    use tracing_subscriber::{EnvFilter, fmt};
    if tracing_subscriber::registry()
        .with(fmt::layer())
        .with(EnvFilter::from_default_env())
        .try_init()
        .is_err()
    {}
}
