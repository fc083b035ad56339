use std::collections::{HashMap, HashSet};
use std::sync::Mutex;
use std::time::Duration;

use docktopus::DockerBuilder;
use docktopus::bollard::container::{
    Config as BollardConfig, CreateContainerOptions, InspectContainerOptions,
    KillContainerOptions, LogOutput, LogsOptions, RemoveContainerOptions, StatsOptions,
    StopContainerOptions,
};
use docktopus::bollard::errors::Error as BollardError;
use docktopus::bollard::exec::{CreateExecOptions, StartExecResults};
use docktopus::bollard::models::{
    ContainerStateStatusEnum, HostConfig, PortBinding, PortMap,
};
use docktopus::bollard::network::{CreateNetworkOptions, InspectNetworkOptions};
use docktopus::container::Container;
use futures_util::StreamExt;

use super::{
    ContainerEngine, ContainerInfo, ContainerSpec, EngineStatus, ExecHandle, ExecOutput,
    ExecSignal, ExecSpec,
};
use crate::error::{Result, SandboxError};
use crate::util::shell_escape;

/// Container engine backed by a Docker daemon.
pub struct DockerEngine {
    builder: DockerBuilder,
    pull_image: bool,
    pulled: Mutex<HashSet<String>>,
}

impl DockerEngine {
    pub async fn connect(docker_host: Option<&str>, pull_image: bool) -> Result<Self> {
        let builder = match docker_host {
            Some(host) => DockerBuilder::with_address(host).await.map_err(|err| {
                SandboxError::Docker(format!("Failed to connect to docker at {host}: {err}"))
            })?,
            None => DockerBuilder::new()
                .await
                .map_err(|err| SandboxError::Docker(format!("Failed to connect to docker: {err}")))?,
        };
        Ok(Self {
            builder,
            pull_image,
            pulled: Mutex::new(HashSet::new()),
        })
    }

    async fn ensure_image_pulled(&self, image: &str) -> Result<()> {
        if !self.pull_image {
            return Ok(());
        }
        let already = self
            .pulled
            .lock()
            .map_err(|_| SandboxError::Docker("image cache lock poisoned".into()))?
            .contains(image);
        if already {
            return Ok(());
        }
        self.builder
            .pull_image(image, None)
            .await
            .map_err(|err| SandboxError::Docker(format!("Failed to pull image {image}: {err}")))?;
        if let Ok(mut pulled) = self.pulled.lock() {
            pulled.insert(image.to_string());
        }
        Ok(())
    }
}

fn is_not_found(err: &BollardError) -> bool {
    matches!(
        err,
        BollardError::DockerResponseServerError {
            status_code: 404,
            ..
        }
    )
}

fn build_docker_config(spec: &ContainerSpec) -> BollardConfig<String> {
    let mut port_bindings = PortMap::new();
    let mut exposed_ports = HashMap::new();
    if let Some(port) = spec.exposed_port {
        // Published on loopback only; the agent's dev server is never public.
        port_bindings.insert(
            format!("{port}/tcp"),
            Some(vec![PortBinding {
                host_ip: Some("127.0.0.1".to_string()),
                host_port: None,
            }]),
        );
        exposed_ports.insert(format!("{port}/tcp"), HashMap::new());
    }

    let hardening = &spec.hardening;
    let mut security_opt = Vec::new();
    if hardening.no_new_privileges {
        security_opt.push("no-new-privileges:true".to_string());
    }
    let tmpfs: HashMap<String, String> = hardening
        .tmpfs
        .iter()
        .map(|(mount, size_mb)| (mount.clone(), format!("rw,nosuid,size={size_mb}m")))
        .collect();

    let host_config = HostConfig {
        port_bindings: Some(port_bindings),
        network_mode: Some(spec.network.clone()),
        extra_hosts: Some(vec!["host.docker.internal:host-gateway".to_string()]),
        cap_drop: Some(hardening.cap_drop.clone()),
        cap_add: Some(hardening.cap_add.clone()),
        security_opt: Some(security_opt),
        readonly_rootfs: Some(hardening.read_only_root),
        tmpfs: Some(tmpfs),
        pids_limit: hardening.pids_limit,
        memory: Some((spec.limits.memory_mb as i64) * 1024 * 1024),
        nano_cpus: Some((spec.limits.cpu_cores as i64) * 1_000_000_000),
        auto_remove: Some(false),
        ..Default::default()
    };

    BollardConfig {
        image: Some(spec.image.clone()),
        env: Some(spec.env.iter().map(|(k, v)| format!("{k}={v}")).collect()),
        labels: Some(spec.labels.clone()),
        working_dir: Some(spec.workdir.clone()),
        cmd: spec.command.clone(),
        exposed_ports: Some(exposed_ports),
        host_config: Some(host_config),
        ..Default::default()
    }
}

fn map_status(status: Option<ContainerStateStatusEnum>, exit_code: Option<i64>) -> EngineStatus {
    match status {
        Some(ContainerStateStatusEnum::CREATED) => EngineStatus::Created,
        Some(ContainerStateStatusEnum::RUNNING) => EngineStatus::Running,
        Some(ContainerStateStatusEnum::PAUSED) => EngineStatus::Paused,
        Some(ContainerStateStatusEnum::RESTARTING) => EngineStatus::Restarting,
        Some(ContainerStateStatusEnum::EXITED) => EngineStatus::Exited(exit_code.unwrap_or(-1)),
        Some(ContainerStateStatusEnum::DEAD) => EngineStatus::Dead,
        Some(other) => EngineStatus::Unknown(other.to_string()),
        None => EngineStatus::Unknown("unreported".into()),
    }
}

fn extract_host_port(
    ports: &HashMap<String, Option<Vec<PortBinding>>>,
    container_port: u16,
) -> Option<u16> {
    let key = format!("{container_port}/tcp");
    ports
        .get(&key)
        .and_then(|v| v.as_ref())
        .and_then(|bindings| bindings.first())
        .and_then(|binding| binding.host_port.as_ref())
        .and_then(|port| port.parse::<u16>().ok())
}

/// Shell snippet that signals every process whose environment carries the
/// exec marker. Exec'd processes are not children of PID 1, so the marker is
/// the only reliable handle on them.
fn signal_script(marker: &str, signal: ExecSignal) -> String {
    let needle = shell_escape(&format!("{}={marker}", crate::EXEC_MARKER_ENV));
    format!(
        "for p in /proc/[0-9]*; do \
         if tr '\\0' '\\n' < \"$p/environ\" 2>/dev/null | grep -qx {needle}; then \
         kill -s {sig} \"${{p#/proc/}}\" 2>/dev/null; fi; done; true",
        sig = signal.as_str()
    )
}

#[async_trait::async_trait]
impl ContainerEngine for DockerEngine {
    fn name(&self) -> &'static str {
        "docker"
    }

    async fn ensure_network(&self, network: &str) -> Result<()> {
        let client = self.builder.client();
        match client
            .inspect_network(network, None::<InspectNetworkOptions<String>>)
            .await
        {
            Ok(_) => return Ok(()),
            Err(err) if is_not_found(&err) => {}
            Err(err) => {
                return Err(SandboxError::Docker(format!(
                    "Failed to inspect network {network}: {err}"
                )));
            }
        }

        client
            .create_network(sandbox_network_options(network))
            .await
            .map_err(|err| {
                SandboxError::Docker(format!("Failed to create network {network}: {err}"))
            })?;
        tracing::info!(network, "created sandbox network");
        Ok(())
    }

    async fn create(&self, spec: &ContainerSpec) -> Result<String> {
        self.ensure_image_pulled(&spec.image).await?;
        let response = self
            .builder
            .client()
            .create_container(
                Some(CreateContainerOptions {
                    name: spec.name.clone(),
                    ..Default::default()
                }),
                build_docker_config(spec),
            )
            .await
            .map_err(|err| {
                SandboxError::Docker(format!("Failed to create container {}: {err}", spec.name))
            })?;
        for warning in &response.warnings {
            tracing::warn!(container = %spec.name, %warning, "docker create warning");
        }
        Ok(response.id)
    }

    async fn start(&self, id: &str) -> Result<()> {
        let mut container = Container::from_id(self.builder.client(), id)
            .await
            .map_err(|err| SandboxError::Docker(format!("Failed to load container: {err}")))?;
        container
            .start(false)
            .await
            .map_err(|err| SandboxError::Docker(format!("Failed to start container: {err}")))
    }

    async fn inspect(&self, id: &str, container_port: Option<u16>) -> Result<ContainerInfo> {
        let inspect = match self
            .builder
            .client()
            .inspect_container(id, None::<InspectContainerOptions>)
            .await
        {
            Ok(inspect) => inspect,
            Err(err) if is_not_found(&err) => {
                return Ok(ContainerInfo {
                    status: EngineStatus::Missing,
                    host_port: None,
                });
            }
            Err(err) => {
                return Err(SandboxError::Docker(format!(
                    "Failed to inspect container: {err}"
                )));
            }
        };

        let status = inspect
            .state
            .as_ref()
            .map(|state| map_status(state.status, state.exit_code))
            .unwrap_or_else(|| EngineStatus::Unknown("no state".into()));
        let host_port = container_port.and_then(|port| {
            inspect
                .network_settings
                .as_ref()
                .and_then(|settings| settings.ports.as_ref())
                .and_then(|ports| extract_host_port(ports, port))
        });
        Ok(ContainerInfo { status, host_port })
    }

    async fn stop(&self, id: &str, grace: Duration) -> Result<()> {
        match self
            .builder
            .client()
            .stop_container(
                id,
                Some(StopContainerOptions {
                    t: grace.as_secs() as i64,
                }),
            )
            .await
        {
            Ok(()) => Ok(()),
            // 304: already stopped.
            Err(BollardError::DockerResponseServerError {
                status_code: 304, ..
            }) => Ok(()),
            Err(err) => Err(SandboxError::Docker(format!(
                "Failed to stop container: {err}"
            ))),
        }
    }

    async fn kill(&self, id: &str) -> Result<()> {
        self.builder
            .client()
            .kill_container(
                id,
                Some(KillContainerOptions {
                    signal: "SIGKILL".to_string(),
                }),
            )
            .await
            .map_err(|err| SandboxError::Docker(format!("Failed to kill container: {err}")))
    }

    async fn remove(&self, id: &str) -> Result<()> {
        let container = match Container::from_id(self.builder.client(), id).await {
            Ok(container) => container,
            Err(err) => {
                tracing::debug!(container_id = id, %err, "container already gone");
                return Ok(());
            }
        };
        container
            .remove(Some(RemoveContainerOptions {
                force: true,
                v: true,
                ..Default::default()
            }))
            .await
            .map_err(|err| SandboxError::Docker(format!("Failed to remove container: {err}")))
    }

    async fn exec(&self, id: &str, spec: &ExecSpec) -> Result<ExecHandle> {
        let client = self.builder.client();
        let created = client
            .create_exec(
                id,
                CreateExecOptions {
                    cmd: Some(spec.cmd.clone()),
                    env: Some(spec.env.iter().map(|(k, v)| format!("{k}={v}")).collect()),
                    working_dir: spec.workdir.clone(),
                    attach_stdout: Some(true),
                    attach_stderr: Some(true),
                    ..Default::default()
                },
            )
            .await
            .map_err(|err| SandboxError::Docker(format!("Failed to create exec: {err}")))?;

        match client
            .start_exec(&created.id, None)
            .await
            .map_err(|err| SandboxError::Docker(format!("Failed to start exec: {err}")))?
        {
            StartExecResults::Attached { output, .. } => {
                let output = output
                    .filter_map(|item| async move {
                        match item {
                            Ok(LogOutput::StdErr { message }) => Some(Ok(ExecOutput::Stderr(
                                String::from_utf8_lossy(&message).into_owned(),
                            ))),
                            Ok(LogOutput::StdOut { message })
                            | Ok(LogOutput::Console { message }) => Some(Ok(ExecOutput::Stdout(
                                String::from_utf8_lossy(&message).into_owned(),
                            ))),
                            Ok(LogOutput::StdIn { .. }) => None,
                            Err(err) => Some(Err(SandboxError::Docker(format!(
                                "exec output stream failed: {err}"
                            )))),
                        }
                    })
                    .boxed();
                Ok(ExecHandle {
                    exec_id: created.id,
                    output,
                })
            }
            StartExecResults::Detached => Err(SandboxError::Docker(
                "exec started detached; output unavailable".into(),
            )),
        }
    }

    async fn exec_exit_code(&self, exec_id: &str) -> Result<Option<i64>> {
        let inspect = self
            .builder
            .client()
            .inspect_exec(exec_id)
            .await
            .map_err(|err| SandboxError::Docker(format!("Failed to inspect exec: {err}")))?;
        if inspect.running.unwrap_or(false) {
            return Ok(None);
        }
        Ok(inspect.exit_code)
    }

    async fn signal_exec(&self, id: &str, marker: &str, signal: ExecSignal) -> Result<()> {
        let spec = ExecSpec {
            cmd: vec!["sh".into(), "-c".into(), signal_script(marker, signal)],
            ..Default::default()
        };
        let mut handle = self.exec(id, &spec).await?;
        while handle.output.next().await.is_some() {}
        Ok(())
    }

    async fn stats(&self, id: &str) -> Result<serde_json::Value> {
        let mut stream = self.builder.client().stats(
            id,
            Some(StatsOptions {
                stream: false,
                one_shot: true,
            }),
        );
        let stats = stream
            .next()
            .await
            .ok_or_else(|| SandboxError::Docker("stats stream ended without a report".into()))?
            .map_err(|err| SandboxError::Docker(format!("Failed to read stats: {err}")))?;
        serde_json::to_value(stats)
            .map_err(|err| SandboxError::Docker(format!("Failed to encode stats: {err}")))
    }

    async fn logs(&self, id: &str, tail: usize) -> Result<String> {
        let opts = LogsOptions::<String> {
            stdout: true,
            stderr: true,
            tail: tail.to_string(),
            ..Default::default()
        };
        let mut logs = self.builder.client().logs(id, Some(opts));
        let mut text = String::new();
        while let Some(chunk) = logs.next().await {
            let chunk =
                chunk.map_err(|err| SandboxError::Docker(format!("Failed to read logs: {err}")))?;
            text.push_str(&chunk.to_string());
        }
        Ok(text)
    }
}

/// Dedicated bridge with inter-container traffic disabled. The network is not
/// `internal`: sandboxes keep outbound access for clone, install and push.
fn sandbox_network_options(network: &str) -> CreateNetworkOptions<String> {
    let mut options = HashMap::new();
    options.insert(
        "com.docker.network.bridge.enable_icc".to_string(),
        "false".to_string(),
    );
    CreateNetworkOptions {
        name: network.to_string(),
        driver: "bridge".to_string(),
        internal: false,
        options,
        ..Default::default()
    }
}
