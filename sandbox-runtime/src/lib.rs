//! Sandbox runtime for autonomous AI agents.
//!
//! This crate provides the container lifecycle, session tokens, and the
//! model gateway that sits between sandboxed agents and the model backend.
//! Sandboxes only ever receive a session token and the gateway URL; the
//! model credential stays in the gateway process.

pub mod audit;
pub mod backend;
pub mod engine;
pub mod error;
pub mod events;
pub mod gateway;
pub mod gateway_api;
pub mod http;
pub mod metrics;
pub mod output;
pub mod pull_request;
pub mod rate_limit;
pub mod reaper;
pub mod repo_setup;
pub mod runtime;
pub mod session_auth;
pub mod util;

pub use error::{AuthError, ExecError, SandboxError};
pub use events::{EventBus, LifecycleEvent};
pub use gateway::{AiRequest, AiResponse, Gateway, GatewayConfig, StreamChunk};
pub use runtime::{
    CreateSandboxRequest, SandboxOrchestrator, SandboxRecord, SandboxRuntimeConfig, SandboxState,
};
pub use session_auth::{Capability, MintRequest, SessionClaims, TokenManager, TokenManagerConfig};

pub const DEFAULT_SANDBOX_IMAGE: &str = "ghcr.io/agent-sandbox/devbox:latest";
pub const DEFAULT_SANDBOX_NETWORK: &str = "agent-sandbox-net";
pub const WORKSPACE_DIR: &str = "/workspace";
pub const REPO_PATH: &str = "/workspace/repo";
/// Env var tagging every exec so a runaway command can be signalled.
pub const EXEC_MARKER_ENV: &str = "SANDBOX_EXEC_ID";
pub const DEFAULT_TIMEOUT_SECS: u64 = 30;
