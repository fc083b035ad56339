use sandbox_runtime::SandboxError;

use crate::coordinator::AgentState;

/// Errors returned by coordinator operations.
#[derive(Debug, thiserror::Error)]
pub enum CoordinatorError {
    #[error(transparent)]
    Sandbox(#[from] SandboxError),
    #[error("coordinator is {state}; cannot {action}")]
    InvalidState {
        state: AgentState,
        action: &'static str,
    },
    #[error("invalid task: {0}")]
    InvalidTask(String),
    #[error("task cancelled")]
    Cancelled,
}

impl CoordinatorError {
    pub fn is_budget(&self) -> bool {
        matches!(self, CoordinatorError::Sandbox(err) if err.is_budget())
    }

    pub fn is_security(&self) -> bool {
        matches!(self, CoordinatorError::Sandbox(err) if err.is_security())
    }
}

pub type Result<T> = std::result::Result<T, CoordinatorError>;
