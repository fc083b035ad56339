//! Secure agent coordination on top of `sandbox-runtime`.
//!
//! A [`SecureAgentCoordinator`] owns one agent identity: it mints the
//! session token, registers with the gateway, provisions a sandbox per task
//! and drives the pre-flight workflow and model calls inside it.

pub mod chat;
pub mod coordinator;
pub mod error;
pub mod task;
pub mod workflow;

pub use chat::{ChatIntent, ChatReply};
pub use coordinator::{
    AgentState, CoordinatorConfig, CoordinatorEvent, CoordinatorServices, CoordinatorStatus,
    ProgressSink, SecureAgentCoordinator, TaskOutcome,
};
pub use error::{CoordinatorError, Result};
pub use task::{AgentTask, TaskKind};
pub use workflow::{StepResult, WorkflowReport};
