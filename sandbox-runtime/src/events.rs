//! Lifecycle notifications.
//!
//! Components publish onto an [`EventBus`] they were constructed with; any
//! number of subscribers receive every event sent after they subscribed.
//! Publishing never blocks and never fails when nobody is listening.

use serde::Serialize;
use tokio::sync::broadcast;

use crate::runtime::SandboxState;

const EVENT_CAPACITY: usize = 256;

#[derive(Clone, Debug, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum LifecycleEvent {
    SandboxStateChanged {
        sandbox_id: String,
        agent_id: String,
        from: SandboxState,
        to: SandboxState,
    },
    SandboxRemoved {
        sandbox_id: String,
        agent_id: String,
    },
    ExecStarted {
        sandbox_id: String,
        command: String,
    },
    ExecFinished {
        sandbox_id: String,
        exit_code: Option<i64>,
        duration_ms: u64,
    },
    TokenMinted {
        token_id: String,
        agent_id: String,
    },
    TokenRevoked {
        token_id: String,
    },
    SessionRegistered {
        agent_id: String,
    },
    SessionUnregistered {
        agent_id: String,
    },
}

#[derive(Clone, Debug)]
pub struct EventBus {
    tx: broadcast::Sender<LifecycleEvent>,
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}

impl EventBus {
    pub fn new() -> Self {
        let (tx, _rx) = broadcast::channel(EVENT_CAPACITY);
        Self { tx }
    }

    pub fn publish(&self, event: LifecycleEvent) {
        // No receivers is fine.
        let _ = self.tx.send(event);
    }

    pub fn subscribe(&self) -> broadcast::Receiver<LifecycleEvent> {
        self.tx.subscribe()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn subscribers_receive_published_events() {
        let bus = EventBus::new();
        let mut a = bus.subscribe();
        let mut b = bus.subscribe();

        bus.publish(LifecycleEvent::TokenRevoked {
            token_id: "tok-1".into(),
        });

        for rx in [&mut a, &mut b] {
            match rx.recv().await.unwrap() {
                LifecycleEvent::TokenRevoked { token_id } => assert_eq!(token_id, "tok-1"),
                other => panic!("unexpected event: {other:?}"),
            }
        }
    }

    #[test]
    fn publish_without_subscribers_is_silent() {
        let bus = EventBus::new();
        bus.publish(LifecycleEvent::SessionRegistered {
            agent_id: "a".into(),
        });
    }
}
