//! In-memory container engine for tests.
//!
//! Commands are answered from scripts matched by substring against the joined
//! argv. Every engine call is recorded so tests can assert on ordering.

use std::collections::{HashMap, HashSet};
use std::sync::Mutex;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::time::Duration;

use futures_util::StreamExt;
use futures_util::stream;
use serde_json::json;

use super::{
    ContainerEngine, ContainerInfo, ContainerSpec, EngineStatus, ExecHandle, ExecOutput,
    ExecSignal, ExecSpec,
};
use crate::error::{Result, SandboxError};

const CHUNK_BYTES: usize = 8 * 1024;

/// Canned response for commands whose argv contains `pattern`.
#[derive(Clone, Debug, Default)]
pub struct ScriptedExec {
    pub exit_code: i64,
    pub stdout: String,
    pub stderr: String,
    /// Time the command "runs" after emitting its output.
    pub delay: Duration,
}

impl ScriptedExec {
    pub fn ok(stdout: impl Into<String>) -> Self {
        Self {
            stdout: stdout.into(),
            ..Default::default()
        }
    }

    pub fn fail(exit_code: i64, stderr: impl Into<String>) -> Self {
        Self {
            exit_code,
            stderr: stderr.into(),
            ..Default::default()
        }
    }

    pub fn hang(delay: Duration) -> Self {
        Self {
            delay,
            ..Default::default()
        }
    }
}

#[derive(Default)]
struct FakeState {
    containers: HashMap<String, (ContainerSpec, EngineStatus)>,
    networks: HashSet<String>,
    scripts: Vec<(String, ScriptedExec)>,
    exec_exits: HashMap<String, i64>,
    calls: Vec<String>,
    commands: Vec<String>,
    exec_envs: Vec<Vec<(String, String)>>,
    signals: Vec<(String, ExecSignal)>,
    stats: Option<serde_json::Value>,
    logs: String,
}

#[derive(Default)]
pub struct FakeEngine {
    state: Mutex<FakeState>,
    next_id: AtomicUsize,
    pub fail_create: AtomicBool,
    pub fail_start: AtomicBool,
    pub never_ready: AtomicBool,
    pub fail_stop: AtomicBool,
    pub fail_stats: AtomicBool,
}

impl FakeEngine {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_script(self, pattern: &str, response: ScriptedExec) -> Self {
        self.script(pattern, response);
        self
    }

    /// Later scripts take precedence over earlier ones.
    pub fn script(&self, pattern: &str, response: ScriptedExec) {
        if let Ok(mut state) = self.state.lock() {
            state.scripts.insert(0, (pattern.to_string(), response));
        }
    }

    pub fn set_stats(&self, stats: serde_json::Value) {
        if let Ok(mut state) = self.state.lock() {
            state.stats = Some(stats);
        }
    }

    pub fn set_logs(&self, logs: &str) {
        if let Ok(mut state) = self.state.lock() {
            state.logs = logs.to_string();
        }
    }

    /// Force a container into `status`, e.g. to simulate a crash.
    pub fn set_status(&self, id: &str, status: EngineStatus) {
        if let Ok(mut state) = self.state.lock() {
            if let Some(entry) = state.containers.get_mut(id) {
                entry.1 = status;
            }
        }
    }

    pub fn calls(&self) -> Vec<String> {
        self.state.lock().map(|s| s.calls.clone()).unwrap_or_default()
    }

    /// Shell command text of every exec, in order.
    pub fn commands(&self) -> Vec<String> {
        self.state
            .lock()
            .map(|s| s.commands.clone())
            .unwrap_or_default()
    }

    /// Environment of every exec, parallel to [`commands`](Self::commands).
    pub fn exec_envs(&self) -> Vec<Vec<(String, String)>> {
        self.state
            .lock()
            .map(|s| s.exec_envs.clone())
            .unwrap_or_default()
    }

    pub fn signals(&self) -> Vec<(String, ExecSignal)> {
        self.state
            .lock()
            .map(|s| s.signals.clone())
            .unwrap_or_default()
    }

    pub fn created_specs(&self) -> Vec<ContainerSpec> {
        self.state
            .lock()
            .map(|s| s.containers.values().map(|(spec, _)| spec.clone()).collect())
            .unwrap_or_default()
    }

    pub fn container_count(&self) -> usize {
        self.state.lock().map(|s| s.containers.len()).unwrap_or(0)
    }

    fn with_state<T>(&self, f: impl FnOnce(&mut FakeState) -> T) -> Result<T> {
        let mut state = self
            .state
            .lock()
            .map_err(|_| SandboxError::Docker("fake engine lock poisoned".into()))?;
        Ok(f(&mut state))
    }

    fn flag(flag: &AtomicBool) -> bool {
        flag.load(Ordering::SeqCst)
    }
}

fn default_stats() -> serde_json::Value {
    json!({
        "cpu_stats": {
            "cpu_usage": { "total_usage": 400_000_000u64 },
            "system_cpu_usage": 2_000_000_000u64,
            "online_cpus": 2
        },
        "precpu_stats": {
            "cpu_usage": { "total_usage": 200_000_000u64 },
            "system_cpu_usage": 1_000_000_000u64
        },
        "memory_stats": { "usage": 268_435_456u64, "limit": 2_147_483_648u64 },
        "networks": { "eth0": { "rx_bytes": 1024, "tx_bytes": 2048 } },
        "pids_stats": { "current": 12 }
    })
}

fn chunked(text: &str, wrap: fn(String) -> ExecOutput) -> Vec<Result<ExecOutput>> {
    let mut out = Vec::new();
    let mut rest = text;
    while !rest.is_empty() {
        let mut cut = rest.len().min(CHUNK_BYTES);
        while !rest.is_char_boundary(cut) {
            cut -= 1;
        }
        out.push(Ok(wrap(rest[..cut].to_string())));
        rest = &rest[cut..];
    }
    out
}

#[async_trait::async_trait]
impl ContainerEngine for FakeEngine {
    fn name(&self) -> &'static str {
        "fake"
    }

    async fn ensure_network(&self, network: &str) -> Result<()> {
        self.with_state(|s| {
            s.calls.push(format!("network {network}"));
            s.networks.insert(network.to_string());
        })
    }

    async fn create(&self, spec: &ContainerSpec) -> Result<String> {
        if Self::flag(&self.fail_create) {
            self.with_state(|s| s.calls.push(format!("create-failed {}", spec.name)))?;
            return Err(SandboxError::Docker("image not found".into()));
        }
        let id = format!("fake-{}", self.next_id.fetch_add(1, Ordering::SeqCst));
        self.with_state(|s| {
            s.calls.push(format!("create {}", spec.name));
            s.containers
                .insert(id.clone(), (spec.clone(), EngineStatus::Created));
        })?;
        Ok(id)
    }

    async fn start(&self, id: &str) -> Result<()> {
        if Self::flag(&self.fail_start) {
            return Err(SandboxError::Docker("start refused".into()));
        }
        let status = if Self::flag(&self.never_ready) {
            EngineStatus::Restarting
        } else {
            EngineStatus::Running
        };
        self.with_state(|s| {
            s.calls.push(format!("start {id}"));
            if let Some(entry) = s.containers.get_mut(id) {
                entry.1 = status;
            }
        })
    }

    async fn inspect(&self, id: &str, container_port: Option<u16>) -> Result<ContainerInfo> {
        self.with_state(|s| match s.containers.get(id) {
            Some((_, status)) => ContainerInfo {
                status: status.clone(),
                host_port: container_port.map(|p| p.saturating_add(40_000)),
            },
            None => ContainerInfo {
                status: EngineStatus::Missing,
                host_port: None,
            },
        })
    }

    async fn stop(&self, id: &str, _grace: Duration) -> Result<()> {
        self.with_state(|s| s.calls.push(format!("stop {id}")))?;
        if Self::flag(&self.fail_stop) {
            return Err(SandboxError::Docker("stop timed out".into()));
        }
        self.with_state(|s| {
            if let Some(entry) = s.containers.get_mut(id) {
                entry.1 = EngineStatus::Exited(0);
            }
        })
    }

    async fn kill(&self, id: &str) -> Result<()> {
        self.with_state(|s| {
            s.calls.push(format!("kill {id}"));
            if let Some(entry) = s.containers.get_mut(id) {
                entry.1 = EngineStatus::Exited(137);
            }
        })
    }

    async fn remove(&self, id: &str) -> Result<()> {
        self.with_state(|s| {
            s.calls.push(format!("remove {id}"));
            s.containers.remove(id);
        })
    }

    async fn exec(&self, id: &str, spec: &ExecSpec) -> Result<ExecHandle> {
        let exec_id = format!("exec-{}", self.next_id.fetch_add(1, Ordering::SeqCst));
        let command = spec.cmd.last().cloned().unwrap_or_default();
        let response = self.with_state(|s| {
            let running = matches!(s.containers.get(id), Some((_, EngineStatus::Running)));
            s.calls.push(format!("exec {id}"));
            s.commands.push(command.clone());
            s.exec_envs.push(spec.env.clone());
            let joined = spec.cmd.join(" ");
            let response = s
                .scripts
                .iter()
                .find(|(pattern, _)| joined.contains(pattern.as_str()))
                .map(|(_, r)| r.clone())
                .unwrap_or_default();
            if running {
                s.exec_exits.insert(exec_id.clone(), response.exit_code);
            }
            (running, response)
        })?;
        let (running, response) = response;
        if !running {
            return Err(SandboxError::Docker(format!("container {id} is not running")));
        }

        let mut items = chunked(&response.stdout, ExecOutput::Stdout);
        items.extend(chunked(&response.stderr, ExecOutput::Stderr));
        let delay = response.delay;
        let tail = stream::once(tokio::time::sleep(delay)).filter_map(|_| async { None });
        Ok(ExecHandle {
            exec_id,
            output: stream::iter(items).chain(tail).boxed(),
        })
    }

    async fn exec_exit_code(&self, exec_id: &str) -> Result<Option<i64>> {
        self.with_state(|s| s.exec_exits.get(exec_id).copied())
    }

    async fn signal_exec(&self, id: &str, marker: &str, signal: ExecSignal) -> Result<()> {
        self.with_state(|s| {
            s.calls.push(format!("signal {id} {}", signal.as_str()));
            s.signals.push((marker.to_string(), signal));
        })
    }

    async fn stats(&self, id: &str) -> Result<serde_json::Value> {
        if Self::flag(&self.fail_stats) {
            return Err(SandboxError::Docker("stats unavailable".into()));
        }
        self.with_state(|s| {
            if s.containers.contains_key(id) {
                Ok(s.stats.clone().unwrap_or_else(default_stats))
            } else {
                Err(SandboxError::NotFound(format!("container {id}")))
            }
        })?
    }

    async fn logs(&self, _id: &str, tail: usize) -> Result<String> {
        self.with_state(|s| {
            let lines: Vec<&str> = s.logs.lines().collect();
            let start = lines.len().saturating_sub(tail);
            lines[start..].join("\n")
        })
    }
}
