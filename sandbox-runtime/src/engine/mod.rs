//! Container engine abstraction.
//!
//! The orchestrator drives container lifecycle exclusively through the
//! [`ContainerEngine`] trait: create/start/stop/kill/remove, exec with streamed
//! output, point-in-time stats and log tails. [`docker::DockerEngine`] talks to
//! a Docker daemon; the in-memory `FakeEngine` backs tests.

pub mod docker;
#[cfg(any(test, feature = "test-utils"))]
pub mod fake;

use std::collections::HashMap;
use std::time::Duration;

use futures_util::stream::BoxStream;
use serde::{Deserialize, Serialize};

use crate::error::{Result, SandboxError};

/// Capabilities a sandbox keeps after `cap_drop=ALL`.
pub const DEFAULT_CAP_ALLOWLIST: &[&str] = &["CHOWN", "DAC_OVERRIDE", "FOWNER", "SETUID", "SETGID"];

/// Security options every sandbox container is created with.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct HardeningProfile {
    pub no_new_privileges: bool,
    pub cap_drop: Vec<String>,
    pub cap_add: Vec<String>,
    pub read_only_root: bool,
    /// Mount point -> size cap in MB.
    pub tmpfs: Vec<(String, u64)>,
    pub pids_limit: Option<i64>,
}

impl HardeningProfile {
    pub fn strict(read_only_root: bool, tmpfs_size_mb: u64) -> Self {
        let mut tmpfs = vec![("/tmp".to_string(), tmpfs_size_mb)];
        if read_only_root {
            // Writable scratch for tools that insist on $HOME caches.
            tmpfs.push(("/home/agent/.cache".to_string(), tmpfs_size_mb / 2));
        }
        Self {
            no_new_privileges: true,
            cap_drop: vec!["ALL".to_string()],
            cap_add: DEFAULT_CAP_ALLOWLIST.iter().map(|c| c.to_string()).collect(),
            read_only_root,
            tmpfs,
            pids_limit: Some(512),
        }
    }

    /// Reject profiles that would leave privilege escalation or the default
    /// capability set in place.
    pub fn ensure_mandatory(&self) -> Result<()> {
        if !self.no_new_privileges {
            return Err(SandboxError::Validation(
                "no-new-privileges must be enabled".into(),
            ));
        }
        if !self.cap_drop.iter().any(|c| c.eq_ignore_ascii_case("ALL")) {
            return Err(SandboxError::Validation(
                "all capabilities must be dropped".into(),
            ));
        }
        if let Some(cap) = self
            .cap_add
            .iter()
            .find(|c| !DEFAULT_CAP_ALLOWLIST.contains(&c.to_ascii_uppercase().as_str()))
        {
            return Err(SandboxError::Validation(format!(
                "capability {cap} is not in the sandbox allow-list"
            )));
        }
        if self.tmpfs.iter().any(|(_, size)| *size == 0) {
            return Err(SandboxError::Validation(
                "tmpfs mounts must be size-capped".into(),
            ));
        }
        Ok(())
    }
}

/// Explicit resource ceilings. Zero is never a valid ceiling.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResourceLimits {
    pub memory_mb: u64,
    pub cpu_cores: u64,
}

/// Everything needed to create one sandbox container.
#[derive(Clone, Debug)]
pub struct ContainerSpec {
    pub name: String,
    pub image: String,
    pub env: Vec<(String, String)>,
    pub labels: HashMap<String, String>,
    pub network: String,
    pub hardening: HardeningProfile,
    pub limits: ResourceLimits,
    pub workdir: String,
    pub exposed_port: Option<u16>,
    /// Keep-alive command; `None` uses the image default.
    pub command: Option<Vec<String>>,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum EngineStatus {
    Created,
    Running,
    Paused,
    Restarting,
    Exited(i64),
    Dead,
    Missing,
    Unknown(String),
}

impl EngineStatus {
    pub fn is_running(&self) -> bool {
        matches!(self, EngineStatus::Running)
    }

    /// States from which the container will not become ready without intervention.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            EngineStatus::Exited(_) | EngineStatus::Dead | EngineStatus::Missing
        )
    }
}

#[derive(Clone, Debug)]
pub struct ContainerInfo {
    pub status: EngineStatus,
    pub host_port: Option<u16>,
}

/// A command to run inside a running container.
#[derive(Clone, Debug, Default)]
pub struct ExecSpec {
    pub cmd: Vec<String>,
    pub env: Vec<(String, String)>,
    pub workdir: Option<String>,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ExecOutput {
    Stdout(String),
    Stderr(String),
}

pub struct ExecHandle {
    pub exec_id: String,
    pub output: BoxStream<'static, Result<ExecOutput>>,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ExecSignal {
    Term,
    Kill,
}

impl ExecSignal {
    pub fn as_str(self) -> &'static str {
        match self {
            ExecSignal::Term => "TERM",
            ExecSignal::Kill => "KILL",
        }
    }
}

/// Narrow lifecycle interface over a container runtime.
#[async_trait::async_trait]
pub trait ContainerEngine: Send + Sync {
    fn name(&self) -> &'static str;

    /// Create the private sandbox network if it does not exist yet.
    async fn ensure_network(&self, network: &str) -> Result<()>;

    /// Create (but do not start) a container. Returns the engine id.
    async fn create(&self, spec: &ContainerSpec) -> Result<String>;

    async fn start(&self, id: &str) -> Result<()>;

    async fn inspect(&self, id: &str, container_port: Option<u16>) -> Result<ContainerInfo>;

    /// Graceful stop; the engine escalates to SIGKILL after `grace`.
    async fn stop(&self, id: &str, grace: Duration) -> Result<()>;

    async fn kill(&self, id: &str) -> Result<()>;

    async fn remove(&self, id: &str) -> Result<()>;

    async fn exec(&self, id: &str, spec: &ExecSpec) -> Result<ExecHandle>;

    /// Exit code of a finished exec, `None` while still running.
    async fn exec_exit_code(&self, exec_id: &str) -> Result<Option<i64>>;

    /// Signal every process started by the exec tagged with `marker`.
    async fn signal_exec(&self, id: &str, marker: &str, signal: ExecSignal) -> Result<()>;

    /// Point-in-time resource report in the Docker stats JSON shape.
    async fn stats(&self, id: &str) -> Result<serde_json::Value>;

    async fn logs(&self, id: &str, tail: usize) -> Result<String>;
}
