//! Reaper for sandbox lifecycle enforcement.
//!
//! - `reaper_tick()`: removes errored sandboxes and tears down ones past
//!   their max lifetime
//! - `spawn_reaper()`: runs the tick on the configured interval

use std::time::Duration;

use crate::runtime::{SandboxOrchestrator, SandboxState};
use crate::util::now_ts;

/// One reaper pass. Returns how many sandboxes were removed.
pub async fn reaper_tick(orchestrator: &SandboxOrchestrator) -> usize {
    let now = now_ts();
    let max_lifetime = orchestrator.config().max_lifetime_secs;
    let mut reaped = 0;

    for record in orchestrator.list() {
        let expired = max_lifetime > 0
            && record.state == SandboxState::Running
            && record.created_at + max_lifetime <= now;

        if record.state == SandboxState::Error {
            tracing::info!(sandbox_id = %record.id, "reaper: removing errored sandbox");
            if let Err(err) = orchestrator.remove(&record.id).await {
                tracing::error!(sandbox_id = %record.id, %err, "reaper: remove failed");
                continue;
            }
        } else if expired {
            tracing::info!(
                sandbox_id = %record.id,
                max_lifetime,
                "reaper: tearing down sandbox past max lifetime"
            );
            if let Err(err) = orchestrator.teardown(&record.id).await {
                tracing::error!(sandbox_id = %record.id, %err, "reaper: teardown failed");
                continue;
            }
        } else {
            continue;
        }
        orchestrator.metrics().record_reaped();
        reaped += 1;
    }
    reaped
}

pub fn spawn_reaper(orchestrator: SandboxOrchestrator) -> tokio::task::JoinHandle<()> {
    let period = Duration::from_secs(orchestrator.config().reaper_interval_secs.max(1));
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(period);
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        // First tick fires immediately.
        interval.tick().await;
        loop {
            interval.tick().await;
            let reaped = reaper_tick(&orchestrator).await;
            if reaped > 0 {
                tracing::info!(reaped, "reaper pass complete");
            }
        }
    })
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::sync::atomic::Ordering;

    use super::*;
    use crate::engine::fake::FakeEngine;
    use crate::events::EventBus;
    use crate::metrics::RuntimeMetrics;
    use crate::runtime::{CreateSandboxRequest, SandboxRuntimeConfig};

    fn orchestrator(engine: Arc<FakeEngine>, max_lifetime_secs: u64) -> SandboxOrchestrator {
        SandboxOrchestrator::new(
            engine,
            SandboxRuntimeConfig {
                ready_attempts: 2,
                ready_interval: Duration::from_millis(1),
                max_lifetime_secs,
                ..Default::default()
            },
            EventBus::new(),
            Arc::new(RuntimeMetrics::new()),
        )
    }

    fn request() -> CreateSandboxRequest {
        CreateSandboxRequest {
            agent_id: "agent-a".into(),
            repo_url: None,
            session_token: "tok".into(),
            gateway_url: "http://gw".into(),
            capabilities: vec![],
        }
    }

    #[tokio::test]
    async fn removes_errored_sandboxes() {
        let engine = Arc::new(FakeEngine::default());
        engine.never_ready.store(true, Ordering::SeqCst);
        let orch = orchestrator(engine.clone(), 0);
        assert!(orch.create_sandbox(request()).await.is_err());
        assert_eq!(orch.list()[0].state, SandboxState::Error);

        assert_eq!(reaper_tick(&orch).await, 1);
        assert!(orch.list().is_empty());
    }

    #[tokio::test]
    async fn leaves_healthy_sandboxes_alone() {
        let engine = Arc::new(FakeEngine::default());
        let orch = orchestrator(engine, 3600);
        orch.create_sandbox(request()).await.unwrap();

        assert_eq!(reaper_tick(&orch).await, 0);
        assert_eq!(orch.list().len(), 1);
    }

    #[tokio::test]
    async fn tears_down_expired_sandboxes() {
        let engine = Arc::new(FakeEngine::default());
        let orch = orchestrator(engine.clone(), 1);
        orch.create_sandbox(request()).await.unwrap();

        // created_at has second resolution.
        tokio::time::sleep(Duration::from_millis(1100)).await;
        assert_eq!(reaper_tick(&orch).await, 1);
        assert!(orch.list().is_empty());
        assert_eq!(engine.container_count(), 0);
    }
}
