//! Coordinator flows against the in-memory engine and a scripted backend.

use std::net::{IpAddr, Ipv4Addr};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use serde_json::json;
use tokio_stream::StreamExt;
use wiremock::matchers::{method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

use sandbox_runtime::backend::{BackendEvent, MockBackend, MockReply};
use sandbox_runtime::engine::fake::{FakeEngine, ScriptedExec};
use sandbox_runtime::metrics::RuntimeMetrics;
use sandbox_runtime::pull_request::{PullRequestClient, PullRequestOutcome};
use sandbox_runtime::repo_setup::StepStatus;
use sandbox_runtime::{
    AuthError, Capability, EventBus, Gateway, GatewayConfig, LifecycleEvent, SandboxError,
    SandboxOrchestrator, SandboxRuntimeConfig, StreamChunk, TokenManager, TokenManagerConfig,
};
use secure_agent_lib::{
    AgentState, AgentTask, ChatIntent, CoordinatorConfig, CoordinatorError, CoordinatorEvent,
    CoordinatorServices, ProgressSink, SecureAgentCoordinator, TaskKind,
};

const PATCH_ANSWER: &str = "Here is the fix:\n```diff\n--- a/src/lib.rs\n+++ b/src/lib.rs\n@@ -1 +1 @@\n-fn broken() {}\n+fn fixed() {}\n```\n";

struct Harness {
    coordinator: SecureAgentCoordinator,
    engine: Arc<FakeEngine>,
    backend: Arc<MockBackend>,
    tokens: Arc<TokenManager>,
    gateway: Arc<Gateway>,
    orchestrator: SandboxOrchestrator,
    events: EventBus,
}

fn config(agent_id: &str) -> CoordinatorConfig {
    CoordinatorConfig {
        agent_id: agent_id.to_string(),
        budget: 10_000,
        max_tokens_per_call: 500,
        ..Default::default()
    }
}

fn harness_with(
    config: CoordinatorConfig,
    gateway_config: GatewayConfig,
    backend: MockBackend,
    pull_requests: PullRequestClient,
) -> Harness {
    let _ = tracing_subscriber::fmt().with_test_writer().try_init();
    let events = EventBus::new();
    let metrics = Arc::new(RuntimeMetrics::new());
    let engine = Arc::new(FakeEngine::new());
    let backend = Arc::new(backend);
    let tokens =
        Arc::new(TokenManager::new(TokenManagerConfig::default(), events.clone()).unwrap());
    let gateway = Arc::new(Gateway::new(
        gateway_config,
        tokens.clone(),
        backend.clone(),
        metrics.clone(),
        events.clone(),
    ));
    let orchestrator = SandboxOrchestrator::new(
        engine.clone(),
        SandboxRuntimeConfig {
            ready_interval: Duration::from_millis(1),
            pull_image: false,
            ..Default::default()
        },
        events.clone(),
        metrics,
    );
    let coordinator = SecureAgentCoordinator::new(
        config,
        CoordinatorServices {
            tokens: tokens.clone(),
            gateway: gateway.clone(),
            orchestrator: orchestrator.clone(),
            pull_requests,
        },
    );
    Harness {
        coordinator,
        engine,
        backend,
        tokens,
        gateway,
        orchestrator,
        events,
    }
}

fn harness(config: CoordinatorConfig, backend: MockBackend) -> Harness {
    harness_with(
        config,
        GatewayConfig {
            port: 0,
            ..Default::default()
        },
        backend,
        PullRequestClient::new(None),
    )
}

fn drain(rx: &mut tokio::sync::broadcast::Receiver<LifecycleEvent>) -> Vec<LifecycleEvent> {
    let mut seen = Vec::new();
    while let Ok(event) = rx.try_recv() {
        seen.push(event);
    }
    seen
}

#[tokio::test]
async fn initialize_registers_with_gateway() {
    let h = harness(config("agent-init"), MockBackend::text("ok", 10));
    assert_eq!(h.coordinator.state(), AgentState::Initializing);

    h.coordinator.initialize().await.unwrap();

    assert_eq!(h.coordinator.state(), AgentState::Ready);
    let session = h.gateway.session("agent-init").unwrap();
    assert_eq!(session.budget, 10_000);
    let token = h.coordinator.session_token().unwrap();
    let claims = h.tokens.verify(&token).unwrap();
    assert_eq!(claims.agent_id, "agent-init");
    assert!(h.gateway.sandbox_url().await.is_some());

    let again = h.coordinator.initialize().await.unwrap_err();
    assert!(matches!(again, CoordinatorError::InvalidState { .. }));
}

#[tokio::test]
async fn failed_initialize_revokes_minted_token() {
    let h = harness_with(
        config("agent-public"),
        GatewayConfig {
            bind: IpAddr::V4(Ipv4Addr::new(8, 8, 8, 8)),
            port: 0,
            ..Default::default()
        },
        MockBackend::text("ok", 10),
        PullRequestClient::new(None),
    );
    let mut rx = h.events.subscribe();

    assert!(h.coordinator.initialize().await.is_err());

    assert_eq!(h.coordinator.state(), AgentState::Error);
    assert!(h.coordinator.session_token().is_none());
    let seen = drain(&mut rx);
    assert!(seen.iter().any(|e| matches!(e, LifecycleEvent::TokenRevoked { .. })));
}

#[tokio::test]
async fn tasks_require_ready_state() {
    let h = harness(config("agent-early"), MockBackend::text("ok", 10));
    let err = h
        .coordinator
        .execute_task(AgentTask::new(TaskKind::Analyze, "look around"))
        .await
        .unwrap_err();
    assert!(matches!(
        err,
        CoordinatorError::InvalidState {
            state: AgentState::Initializing,
            ..
        }
    ));
    assert_eq!(h.engine.container_count(), 0);
}

#[tokio::test]
async fn empty_description_is_rejected() {
    let h = harness(config("agent-empty"), MockBackend::text("ok", 10));
    h.coordinator.initialize().await.unwrap();
    let err = h
        .coordinator
        .execute_task(AgentTask::new(TaskKind::Analyze, "  "))
        .await
        .unwrap_err();
    assert!(matches!(err, CoordinatorError::InvalidTask(_)));
    assert_eq!(h.coordinator.state(), AgentState::Ready);
}

#[tokio::test]
async fn analysis_survives_preflight_warnings() {
    let h = harness(
        config("agent-warn"),
        MockBackend::text("The repository is a small Rust library.", 120),
    );
    h.engine.script("test -f", ScriptedExec::fail(1, ""));
    h.engine
        .script("git status", ScriptedExec::fail(128, "not a git repository"));
    h.coordinator.initialize().await.unwrap();

    let outcome = h
        .coordinator
        .execute_task(
            AgentTask::new(TaskKind::Analyze, "summarize").with_repo("https://github.com/acme/widgets"),
        )
        .await
        .unwrap();

    assert_eq!(outcome.answer, "The repository is a small Rust library.");
    assert_eq!(outcome.tokens_used, 120);
    assert_eq!(outcome.patch_applied, None);
    let warned: Vec<&str> = outcome
        .steps
        .iter()
        .filter(|s| s.status == StepStatus::Warning)
        .map(|s| s.name.as_str())
        .collect();
    assert!(warned.contains(&"install"));
    assert!(warned.contains(&"status"));
    assert!(warned.contains(&"tests"));
    let tests = outcome.steps.iter().find(|s| s.name == "tests").unwrap();
    assert_eq!(tests.output, "test runner not found");

    assert_eq!(h.coordinator.state(), AgentState::Ready);
    assert_eq!(h.coordinator.spent(), 120);
    assert!(h.orchestrator.list().is_empty());
    assert!(h.coordinator.sandbox_id().is_none());

    let prompt = &h.backend.requests()[0].prompt;
    assert!(prompt.contains("Task: summarize"));
    assert!(prompt.contains("## tests"));
}

#[tokio::test]
async fn sandbox_receives_only_session_credentials() {
    let h = harness(
        CoordinatorConfig {
            keep_sandbox: true,
            ..config("agent-env")
        },
        MockBackend::text("ok", 5),
    );
    h.coordinator.initialize().await.unwrap();
    h.coordinator
        .execute_task(AgentTask::new(TaskKind::Analyze, "look"))
        .await
        .unwrap();

    let specs = h.engine.created_specs();
    assert_eq!(specs.len(), 1);
    let keys: Vec<&str> = specs[0].env.iter().map(|(k, _)| k.as_str()).collect();
    assert_eq!(keys, vec!["AGENT_ID", "SESSION_TOKEN", "GATEWAY_URL"]);
    let token = h.coordinator.session_token().unwrap();
    assert!(specs[0].env.contains(&("SESSION_TOKEN".to_string(), token)));
    let gateway_url = &specs[0].env[2].1;
    assert!(gateway_url.starts_with("http://host.docker.internal:"));
}

#[tokio::test]
async fn budget_exhaustion_is_fatal_but_recoverable() {
    let h = harness(
        CoordinatorConfig {
            budget: 100,
            ..config("agent-poor")
        },
        MockBackend::text("never", 10),
    );
    h.coordinator.initialize().await.unwrap();

    let err = h
        .coordinator
        .execute_task(AgentTask::new(TaskKind::Analyze, "summarize"))
        .await
        .unwrap_err();

    assert!(err.is_budget(), "unexpected error: {err}");
    assert_eq!(h.backend.calls.load(std::sync::atomic::Ordering::SeqCst), 0);
    assert_eq!(h.coordinator.state(), AgentState::Ready);
    assert!(h.orchestrator.list().is_empty());
    assert_eq!(h.coordinator.spent(), 0);
}

#[tokio::test]
async fn provisioning_failure_never_leaves_busy() {
    let h = harness(config("agent-flaky"), MockBackend::text("fine", 15));
    h.coordinator.initialize().await.unwrap();
    h.engine
        .fail_create
        .store(true, std::sync::atomic::Ordering::SeqCst);

    let err = h
        .coordinator
        .execute_task(AgentTask::new(TaskKind::Analyze, "summarize"))
        .await
        .unwrap_err();
    assert!(matches!(err, CoordinatorError::Sandbox(SandboxError::Docker(_))));
    assert_eq!(h.coordinator.state(), AgentState::Ready);

    h.engine
        .fail_create
        .store(false, std::sync::atomic::Ordering::SeqCst);
    let outcome = h
        .coordinator
        .execute_task(AgentTask::new(TaskKind::Analyze, "summarize"))
        .await
        .unwrap();
    assert_eq!(outcome.answer, "fine");
}

#[tokio::test]
async fn fix_task_applies_patch() {
    let h = harness(config("agent-fix"), MockBackend::text(PATCH_ANSWER, 300));
    h.coordinator.initialize().await.unwrap();

    let outcome = h
        .coordinator
        .execute_task(AgentTask::new(
            TaskKind::Fix {
                issue: "broken function name".into(),
            },
            "rename broken",
        ))
        .await
        .unwrap();

    assert_eq!(outcome.patch_applied, Some(true));
    let commands = h.engine.commands();
    let written = commands
        .iter()
        .position(|c| c.contains(">> /tmp/agent.patch") && c.contains("+fn fixed() {}"))
        .unwrap();
    let applied = commands
        .iter()
        .position(|c| c.contains("git apply --whitespace=nowarn /tmp/agent.patch"))
        .unwrap();
    assert!(written < applied);
    assert!(outcome.pull_request.is_none());
}

#[tokio::test]
async fn large_patch_is_written_in_chunks() {
    let added: String = (0..3000)
        .map(|i| format!("+const LINE_{i}: &str = \"it's line {i}\";\n"))
        .collect();
    let answer = format!(
        "```diff\n--- a/src/big.rs\n+++ b/src/big.rs\n@@ -0,0 +1,3000 @@\n{added}```\n"
    );
    let h = harness(config("agent-bigpatch"), MockBackend::text(&answer, 300));
    h.coordinator.initialize().await.unwrap();

    let outcome = h
        .coordinator
        .execute_task(AgentTask::new(
            TaskKind::Implement {
                feature: "constants".into(),
            },
            "add constants",
        ))
        .await
        .unwrap();

    assert_eq!(outcome.patch_applied, Some(true));
    let commands = h.engine.commands();
    let writes: Vec<&String> = commands
        .iter()
        .filter(|c| c.contains(">> /tmp/agent.patch"))
        .collect();
    assert!(writes.len() > 1);
    assert!(writes.iter().all(|c| c.len() < 128 * 1024));
    assert!(commands.iter().any(|c| c == ": > /tmp/agent.patch"));
    let last_write = commands
        .iter()
        .rposition(|c| c.contains(">> /tmp/agent.patch"))
        .unwrap();
    let applied = commands
        .iter()
        .position(|c| c.contains("git apply"))
        .unwrap();
    assert!(last_write < applied);
}

#[tokio::test]
async fn rejected_patch_is_a_warning() {
    let h = harness(config("agent-badpatch"), MockBackend::text(PATCH_ANSWER, 300));
    h.engine
        .script("git apply", ScriptedExec::fail(1, "error: patch failed"));
    h.coordinator.initialize().await.unwrap();

    let outcome = h
        .coordinator
        .execute_task(AgentTask::new(
            TaskKind::Implement {
                feature: "rename".into(),
            },
            "rename broken",
        ))
        .await
        .unwrap();

    assert_eq!(outcome.patch_applied, Some(false));
    let step = outcome.steps.last().unwrap();
    assert_eq!(step.name, "apply_patch");
    assert_eq!(step.status, StepStatus::Warning);
    assert!(step.output.contains("patch failed"));
    assert_eq!(h.coordinator.state(), AgentState::Ready);
}

#[tokio::test]
async fn opens_pull_request_after_patch() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/repos/acme/widgets/pulls"))
        .respond_with(ResponseTemplate::new(201).set_body_json(json!({
            "number": 42,
            "html_url": "https://github.com/acme/widgets/pull/42"
        })))
        .expect(1)
        .mount(&server)
        .await;

    let h = harness_with(
        CoordinatorConfig {
            pr_base: Some("main".into()),
            ..config("agent-pr")
        },
        GatewayConfig {
            port: 0,
            ..Default::default()
        },
        MockBackend::text(PATCH_ANSWER, 300),
        PullRequestClient::new(Some("ghp_test".into())).with_api_base(server.uri()),
    );
    h.coordinator.initialize().await.unwrap();

    let task = AgentTask::new(
        TaskKind::Fix {
            issue: "broken function".into(),
        },
        "fix https://github.com/acme/widgets",
    )
    .with_pull_request(Some("agent/fix-rename".into()));
    let outcome = h.coordinator.execute_task(task).await.unwrap();

    assert_eq!(
        outcome.pull_request,
        Some(PullRequestOutcome::Created {
            url: "https://github.com/acme/widgets/pull/42".into(),
            number: 42,
        })
    );
    let commands = h.engine.commands();
    assert!(commands
        .iter()
        .any(|c| c.contains("push --force-with-lease -u origin 'agent/fix-rename'")));
}

#[tokio::test]
async fn pull_request_requires_capability() {
    let h = harness(
        CoordinatorConfig {
            capabilities: vec![Capability::AiRequest, Capability::AiStream],
            ..config("agent-nopr")
        },
        MockBackend::text(PATCH_ANSWER, 300),
    );
    h.coordinator.initialize().await.unwrap();

    let task = AgentTask::new(
        TaskKind::Fix {
            issue: "broken".into(),
        },
        "fix it",
    )
    .with_repo("https://github.com/acme/widgets")
    .with_pull_request(None);
    let outcome = h.coordinator.execute_task(task).await.unwrap();

    assert_eq!(outcome.patch_applied, Some(true));
    assert!(outcome.pull_request.is_none());
    assert!(!h.engine.commands().iter().any(|c| c.contains("push --force-with-lease")));
}

#[tokio::test]
async fn stop_tears_down_before_revoking() {
    let h = harness(
        CoordinatorConfig {
            keep_sandbox: true,
            ..config("agent-stop")
        },
        MockBackend::text("done", 20),
    );
    h.coordinator.initialize().await.unwrap();
    let token = h.coordinator.session_token().unwrap();
    h.coordinator
        .execute_task(AgentTask::new(TaskKind::Analyze, "look"))
        .await
        .unwrap();
    assert!(h.coordinator.sandbox_id().is_some());

    let mut rx = h.events.subscribe();
    h.coordinator.stop().await.unwrap();

    let seen = drain(&mut rx);
    let removed = seen
        .iter()
        .position(|e| matches!(e, LifecycleEvent::SandboxRemoved { .. }))
        .unwrap();
    let revoked = seen
        .iter()
        .position(|e| matches!(e, LifecycleEvent::TokenRevoked { .. }))
        .unwrap();
    assert!(removed < revoked);

    assert_eq!(h.coordinator.state(), AgentState::Stopped);
    assert!(matches!(
        h.tokens.verify(&token),
        Err(SandboxError::Auth(AuthError::Revoked))
    ));
    assert!(h.gateway.session("agent-stop").is_none());
    assert!(h.orchestrator.list().is_empty());

    h.coordinator.stop().await.unwrap();
    let err = h
        .coordinator
        .execute_task(AgentTask::new(TaskKind::Analyze, "again"))
        .await
        .unwrap_err();
    assert!(matches!(
        err,
        CoordinatorError::InvalidState {
            state: AgentState::Stopped,
            ..
        }
    ));
}

#[tokio::test]
async fn chat_routes_by_intent() {
    let h = harness(config("agent-chat"), MockBackend::text("Use a builder.", 40));
    h.coordinator.initialize().await.unwrap();

    let err = h.coordinator.chat("status").await.unwrap_err();
    assert!(matches!(err, CoordinatorError::InvalidState { .. }));

    h.coordinator.open_sandbox(None).await.unwrap();

    let status = h.coordinator.chat("status").await.unwrap();
    assert_eq!(status.intent, ChatIntent::StatusReport);
    assert!(status.content.contains("agent agent-chat is ready"));
    assert_eq!(status.tokens_used, 0);

    let files = h.coordinator.chat("show me the files").await.unwrap();
    assert_eq!(files.intent, ChatIntent::RepoInspection);
    assert!(files.content.contains("$ git log --oneline -n 10"));

    let general = h.coordinator.chat("how do I name this helper function?").await.unwrap();
    assert_eq!(general.intent, ChatIntent::General);
    assert_eq!(general.content, "Use a builder.");
    assert_eq!(h.coordinator.spent(), 40);
    assert_eq!(h.backend.requests().len(), 1);
}

#[tokio::test]
async fn chat_stream_tracks_spend() {
    let h = harness(
        config("agent-stream"),
        MockBackend::new().with_reply(MockReply::Stream(vec![
            BackendEvent::Content { text: "a".into() },
            BackendEvent::Content { text: "b".into() },
            BackendEvent::Usage { units: 150 },
        ])),
    );
    h.coordinator.initialize().await.unwrap();
    h.coordinator.open_sandbox(None).await.unwrap();

    let chunks: Vec<StreamChunk> = h
        .coordinator
        .chat_stream("write a haiku")
        .await
        .unwrap()
        .collect()
        .await;

    match chunks.last().unwrap() {
        StreamChunk::Complete {
            accumulated,
            token_usage,
        } => {
            assert_eq!(accumulated, "ab");
            assert_eq!(*token_usage, 150);
        }
        other => panic!("unexpected final chunk: {other:?}"),
    }
    assert_eq!(h.coordinator.spent(), 150);

    let canned: Vec<StreamChunk> = h
        .coordinator
        .chat_stream("status")
        .await
        .unwrap()
        .collect()
        .await;
    assert_eq!(canned.len(), 2);
    assert!(matches!(canned[1], StreamChunk::Complete { token_usage: 0, .. }));
}

#[derive(Default)]
struct Recorder(Mutex<Vec<CoordinatorEvent>>);

impl ProgressSink for Recorder {
    fn on_event(&self, event: &CoordinatorEvent) {
        self.0.lock().unwrap().push(event.clone());
    }
}

#[tokio::test]
async fn progress_sink_sees_task_lifecycle() {
    let recorder = Arc::new(Recorder::default());
    let mut h = harness(config("agent-progress"), MockBackend::text("ok", 25));
    h.coordinator = h.coordinator.with_progress(recorder.clone());
    h.coordinator.initialize().await.unwrap();

    let task = AgentTask::new(TaskKind::Analyze, "look");
    let task_id = task.id.clone();
    h.coordinator.execute_task(task).await.unwrap();

    let events = recorder.0.lock().unwrap().clone();
    assert!(matches!(
        events.first(),
        Some(CoordinatorEvent::StateChanged {
            from: AgentState::Initializing,
            to: AgentState::Ready
        })
    ));
    assert!(events
        .iter()
        .any(|e| matches!(e, CoordinatorEvent::TaskStarted { task_id: id } if *id == task_id)));
    assert!(events
        .iter()
        .any(|e| matches!(e, CoordinatorEvent::StepCompleted { step, .. } if step.name == "analysis")));
    assert!(events
        .iter()
        .any(|e| matches!(e, CoordinatorEvent::SpendUpdated { spent: 25, .. })));
    assert!(matches!(
        events.last(),
        Some(CoordinatorEvent::TaskCompleted { success: true, .. })
    ));
}
