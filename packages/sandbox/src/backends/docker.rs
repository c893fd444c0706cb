// ABOUTME: Local-container backend built on the Docker engine API
// ABOUTME: Uses bollard to provision, exec into, upload to and remove project containers

use super::{ExecRequest, ExecSink, ExecStream, ProvisionSpec, ResourceInfo, SandboxBackend, StreamType};
use crate::error::{Result, SandboxError};
use crate::settings::SandboxSettings;
use crate::types::{ProviderKind, ResourceUsage};
use async_trait::async_trait;
use bollard::{
    container::{
        Config, CreateContainerOptions, ListContainersOptions, LogOutput, RemoveContainerOptions,
        StartContainerOptions, StatsOptions, UploadToContainerOptions,
    },
    errors::Error as BollardError,
    exec::{CreateExecOptions, StartExecResults},
    image::CreateImageOptions,
    models::{ContainerInspectResponse, HostConfig, PortBinding, RestartPolicy, RestartPolicyNameEnum},
    Docker,
};
use futures::StreamExt;
use std::collections::HashMap;
use std::time::Duration;
use tracing::{debug, info, warn};

pub const MANAGED_LABEL: &str = "devbox.managed";
pub const PROJECT_LABEL: &str = "devbox.project_id";
pub const PROVIDER_LABEL: &str = "devbox.provider";

/// Capabilities kept after dropping ALL; enough for package managers and editors
const KEPT_CAPABILITIES: [&str; 6] = ["CHOWN", "DAC_OVERRIDE", "FOWNER", "SETGID", "SETUID", "KILL"];

pub struct DockerBackend {
    client: Docker,
    network: String,
    publish_host: String,
    /// Timeout for image pull operations
    pull_timeout: Duration,
}

impl DockerBackend {
    /// Connect using the local defaults (DOCKER_HOST or the unix socket).
    ///
    /// The connection is lazy; an absent daemon surfaces on first use.
    pub fn new(settings: &SandboxSettings) -> Result<Self> {
        let client = Docker::connect_with_defaults()
            .map_err(|e| SandboxError::BackendUnavailable(e.to_string()))?;
        Ok(Self::with_client(client, settings))
    }

    pub fn with_client(client: Docker, settings: &SandboxSettings) -> Self {
        Self {
            client,
            network: settings.docker_network.clone(),
            publish_host: settings.publish_host.clone(),
            pull_timeout: Duration::from_secs(600),
        }
    }

    async fn ensure_image(&self, image: &str) -> Result<()> {
        match self.client.inspect_image(image).await {
            Ok(_) => return Ok(()),
            Err(BollardError::DockerResponseServerError {
                status_code: 404, ..
            }) => {}
            Err(e) => return Err(map_docker_error("inspect image", e)),
        }

        info!(image = image, timeout = ?self.pull_timeout, "Pulling image");
        let options = CreateImageOptions {
            from_image: image.to_string(),
            ..Default::default()
        };
        let mut stream = self.client.create_image(Some(options), None, None);

        let pulled = tokio::time::timeout(self.pull_timeout, async {
            let mut last_status = String::new();
            while let Some(result) = stream.next().await {
                let progress = result.map_err(|e| map_docker_error("pull image", e))?;
                if let Some(error) = progress.error {
                    return Err(SandboxError::Backend(format!(
                        "failed to pull image {}: {}",
                        image, error
                    )));
                }
                if let Some(status) = progress.status {
                    if status != last_status {
                        debug!(image = image, "Pull status: {}", status);
                        last_status = status;
                    }
                }
            }
            Ok(())
        })
        .await;

        match pulled {
            Ok(result) => result,
            Err(_) => Err(SandboxError::Backend(format!(
                "timed out pulling image {} after {:?}",
                image, self.pull_timeout
            ))),
        }
    }

    async fn start(&self, container_id: &str) -> Result<()> {
        match self
            .client
            .start_container(container_id, None::<StartContainerOptions<String>>)
            .await
        {
            Ok(_) => Ok(()),
            // Already running
            Err(BollardError::DockerResponseServerError {
                status_code: 304, ..
            }) => Ok(()),
            Err(e) => Err(map_docker_error("start container", e)),
        }
    }

    async fn inspect_raw(&self, name_or_id: &str) -> Result<Option<ContainerInspectResponse>> {
        match self.client.inspect_container(name_or_id, None).await {
            Ok(inspect) => Ok(Some(inspect)),
            Err(BollardError::DockerResponseServerError {
                status_code: 404, ..
            }) => Ok(None),
            Err(e) => Err(map_docker_error("inspect container", e)),
        }
    }

    /// Start an adopted container if needed and confirm it stays up.
    async fn bring_up(&self, spec: &ProvisionSpec, container_id: &str) -> Result<ResourceInfo> {
        self.start(container_id).await.map_err(|e| provisioning(spec, e))?;

        let info = self
            .inspect_raw(container_id)
            .await?
            .map(resource_info)
            .ok_or_else(|| SandboxError::Provisioning {
                project_id: spec.project_id.clone(),
                message: format!("container {} disappeared while starting", container_id),
            })?;

        if !info.running {
            return Err(SandboxError::Provisioning {
                project_id: spec.project_id.clone(),
                message: format!("container {} is {} after start", info.name, info.state),
            });
        }
        Ok(info)
    }
}

#[async_trait]
impl SandboxBackend for DockerBackend {
    fn kind(&self) -> ProviderKind {
        ProviderKind::Docker
    }

    async fn ping(&self) -> Result<()> {
        self.client
            .ping()
            .await
            .map(|_| ())
            .map_err(|e| SandboxError::BackendUnavailable(e.to_string()))
    }

    async fn provision(&self, spec: &ProvisionSpec) -> Result<ResourceInfo> {
        if let Some(existing) = self.inspect_raw(&spec.resource_name).await? {
            let existing = resource_info(existing);
            info!(
                project_id = %spec.project_id,
                backend_ref = %existing.backend_ref,
                state = %existing.state,
                "Adopting existing container"
            );
            return self.bring_up(spec, &existing.backend_ref).await;
        }

        let config = container_config(spec, &self.network, &self.publish_host)?;

        self.ensure_image(&spec.image)
            .await
            .map_err(|e| provisioning(spec, e))?;

        tokio::fs::create_dir_all(&spec.host_workspace)
            .await
            .map_err(|e| SandboxError::Provisioning {
                project_id: spec.project_id.clone(),
                message: format!(
                    "cannot create workspace {}: {}",
                    spec.host_workspace.display(),
                    e
                ),
            })?;

        let options = CreateContainerOptions {
            name: spec.resource_name.clone(),
            platform: None,
        };

        let container_id = match self.client.create_container(Some(options), config).await {
            Ok(created) => {
                info!(project_id = %spec.project_id, backend_ref = %created.id, "Created container");
                created.id
            }
            // Another process created it between inspect and create
            Err(BollardError::DockerResponseServerError {
                status_code: 409, ..
            }) => {
                let existing = self.inspect_raw(&spec.resource_name).await?.ok_or_else(|| {
                    SandboxError::Provisioning {
                        project_id: spec.project_id.clone(),
                        message: "name conflict but no container found".to_string(),
                    }
                })?;
                resource_info(existing).backend_ref
            }
            Err(e) => return Err(provisioning(spec, map_docker_error("create container", e))),
        };

        self.bring_up(spec, &container_id).await
    }

    async fn inspect(&self, resource_name: &str) -> Result<Option<ResourceInfo>> {
        Ok(self.inspect_raw(resource_name).await?.map(resource_info))
    }

    async fn list_managed(&self) -> Result<Vec<ResourceInfo>> {
        let filters = HashMap::from([(
            "label".to_string(),
            vec![format!("{}=true", MANAGED_LABEL)],
        )]);
        let options = ListContainersOptions {
            all: true,
            filters,
            ..Default::default()
        };

        let containers = self
            .client
            .list_containers(Some(options))
            .await
            .map_err(|e| map_docker_error("list containers", e))?;

        let mut infos = Vec::new();
        for container in containers {
            let Some(id) = container.id else { continue };
            match self.inspect_raw(&id).await {
                Ok(Some(inspect)) => infos.push(resource_info(inspect)),
                Ok(None) => debug!(backend_ref = %id, "Container vanished while listing"),
                Err(e) => warn!(backend_ref = %id, error = %e, "Failed to inspect container"),
            }
        }
        Ok(infos)
    }

    async fn exec_stream(&self, backend_ref: &str, request: ExecRequest) -> Result<ExecStream> {
        debug!(backend_ref = backend_ref, argv = ?request.argv, "Starting exec");

        let env: Option<Vec<String>> = if request.env.is_empty() {
            None
        } else {
            Some(
                request
                    .env
                    .iter()
                    .map(|(k, v)| format!("{}={}", k, v))
                    .collect(),
            )
        };

        let exec_config = CreateExecOptions {
            cmd: Some(request.argv),
            env,
            working_dir: request.working_dir,
            attach_stdout: Some(true),
            attach_stderr: Some(true),
            ..Default::default()
        };

        let exec = self
            .client
            .create_exec(backend_ref, exec_config)
            .await
            .map_err(|e| exec_error(backend_ref, e))?;

        let started = self
            .client
            .start_exec(&exec.id, None)
            .await
            .map_err(|e| exec_error(backend_ref, e))?;

        let StartExecResults::Attached { mut output, .. } = started else {
            return Err(SandboxError::Exec(
                "exec was detached unexpectedly".to_string(),
            ));
        };

        let (sink, stream) = ExecStream::channel();
        let client = self.client.clone();
        let exec_id = exec.id;

        tokio::spawn(async move {
            while let Some(msg) = output.next().await {
                let delivered = match msg {
                    Ok(LogOutput::StdOut { message }) | Ok(LogOutput::Console { message }) => {
                        sink.send(StreamType::Stdout, message.to_vec())
                    }
                    Ok(LogOutput::StdErr { message }) => {
                        sink.send(StreamType::Stderr, message.to_vec())
                    }
                    Ok(_) => true,
                    Err(e) => {
                        sink.finish(Err(SandboxError::Exec(e.to_string())));
                        return;
                    }
                };
                if !delivered {
                    // Reader gave up (timeout); stop pulling output
                    return;
                }
            }
            finish_exec(&client, &exec_id, sink).await;
        });

        Ok(stream)
    }

    async fn upload_archive(&self, backend_ref: &str, dest: &str, archive: Vec<u8>) -> Result<()> {
        let mkdir = ExecRequest::new(vec!["mkdir".to_string(), "-p".to_string(), dest.to_string()]);
        let (code, _, stderr) = self.exec_stream(backend_ref, mkdir).await?.collect().await?;
        if code != 0 {
            return Err(SandboxError::FileSync(format!(
                "cannot create {}: {}",
                dest,
                String::from_utf8_lossy(&stderr).trim()
            )));
        }

        let options = UploadToContainerOptions {
            path: dest.to_string(),
            ..Default::default()
        };
        self.client
            .upload_to_container(backend_ref, Some(options), archive.into())
            .await
            .map_err(|e| match map_docker_error("upload archive", e) {
                SandboxError::Backend(message) => SandboxError::FileSync(message),
                other => other,
            })
    }

    async fn remove(&self, backend_ref: &str) -> Result<bool> {
        let options = RemoveContainerOptions {
            force: true,
            v: true,
            ..Default::default()
        };

        match self.client.remove_container(backend_ref, Some(options)).await {
            Ok(_) => {
                info!(backend_ref = backend_ref, "Removed container");
                Ok(true)
            }
            // Container already removed is not an error
            Err(BollardError::DockerResponseServerError {
                status_code: 404, ..
            }) => {
                debug!(backend_ref = backend_ref, "Container already removed");
                Ok(false)
            }
            Err(e) => Err(map_docker_error("remove container", e)),
        }
    }

    fn endpoint_url(&self, info: &ResourceInfo, port: u16) -> Option<String> {
        info.ports
            .get(&port)
            .map(|host_port| format!("http://{}:{}", self.publish_host, host_port))
    }

    async fn usage(&self, backend_ref: &str) -> Result<Option<ResourceUsage>> {
        let options = StatsOptions {
            stream: false,
            one_shot: true,
        };
        let mut stats_stream = self.client.stats(backend_ref, Some(options));

        let stats = match stats_stream.next().await {
            Some(Ok(stats)) => stats,
            Some(Err(BollardError::DockerResponseServerError {
                status_code: 404, ..
            }))
            | None => return Ok(None),
            Some(Err(e)) => return Err(map_docker_error("container stats", e)),
        };

        let cpu_delta = stats
            .cpu_stats
            .cpu_usage
            .total_usage
            .saturating_sub(stats.precpu_stats.cpu_usage.total_usage);
        let system_delta = stats
            .cpu_stats
            .system_cpu_usage
            .unwrap_or(0)
            .saturating_sub(stats.precpu_stats.system_cpu_usage.unwrap_or(0));

        let cpu_usage_percent = if system_delta > 0 && cpu_delta > 0 {
            (cpu_delta as f64 / system_delta as f64)
                * 100.0
                * stats.cpu_stats.online_cpus.unwrap_or(1) as f64
        } else {
            0.0
        };

        let (network_rx_bytes, network_tx_bytes) = stats
            .networks
            .map(|networks| {
                (
                    networks.values().map(|n| n.rx_bytes).sum(),
                    networks.values().map(|n| n.tx_bytes).sum(),
                )
            })
            .unwrap_or((0, 0));

        Ok(Some(ResourceUsage {
            cpu_usage_percent,
            memory_usage_mb: stats.memory_stats.usage.unwrap_or(0) / (1024 * 1024),
            memory_limit_mb: stats.memory_stats.limit.unwrap_or(0) / (1024 * 1024),
            network_rx_bytes,
            network_tx_bytes,
        }))
    }
}

async fn finish_exec(client: &Docker, exec_id: &str, sink: ExecSink) {
    let exit_code = client
        .inspect_exec(exec_id)
        .await
        .map_err(|e| SandboxError::Exec(e.to_string()))
        .and_then(|inspect| {
            inspect
                .exit_code
                .ok_or_else(|| SandboxError::Exec("exec finished without exit code".to_string()))
        });
    sink.finish(exit_code);
}

/// Build the container definition for a project sandbox.
fn container_config(
    spec: &ProvisionSpec,
    network: &str,
    publish_host: &str,
) -> Result<Config<String>> {
    let memory_bytes = i64::try_from(spec.memory_mb.saturating_mul(1024 * 1024))
        .map_err(|_| {
            SandboxError::Configuration(format!(
                "memory limit of {} MB is too large",
                spec.memory_mb
            ))
        })?;

    let labels = HashMap::from([
        (MANAGED_LABEL.to_string(), "true".to_string()),
        (PROJECT_LABEL.to_string(), spec.project_id.clone()),
        (
            PROVIDER_LABEL.to_string(),
            ProviderKind::Docker.as_str().to_string(),
        ),
    ]);

    let mut exposed_ports = HashMap::new();
    let mut port_bindings = HashMap::new();
    for port in spec.ide_ports.ports() {
        let container_port = format!("{}/tcp", port);
        exposed_ports.insert(container_port.clone(), HashMap::new());
        // No host port: the engine picks an ephemeral one
        port_bindings.insert(
            container_port,
            Some(vec![PortBinding {
                host_ip: Some(publish_host.to_string()),
                host_port: None,
            }]),
        );
    }

    let env: Vec<String> = spec
        .env_vars
        .iter()
        .map(|(k, v)| format!("{}={}", k, v))
        .collect();

    let host_config = HostConfig {
        binds: Some(vec![format!(
            "{}:{}:rw",
            spec.host_workspace.display(),
            spec.workspace_mount
        )]),
        port_bindings: Some(port_bindings),
        // CPU quota (100000 = 1 core)
        cpu_quota: Some((spec.cpu_cores * 100_000.0) as i64),
        cpu_period: Some(100_000),
        memory: Some(memory_bytes),
        pids_limit: Some(spec.pids_limit),
        network_mode: Some(network.to_string()),
        restart_policy: Some(RestartPolicy {
            name: Some(RestartPolicyNameEnum::NO),
            maximum_retry_count: Some(0),
        }),
        cap_drop: Some(vec!["ALL".to_string()]),
        cap_add: Some(KEPT_CAPABILITIES.iter().map(|c| c.to_string()).collect()),
        security_opt: Some(vec!["no-new-privileges".to_string()]),
        privileged: Some(false),
        ..Default::default()
    };

    Ok(Config {
        image: Some(spec.image.clone()),
        cmd: Some(spec.keepalive_command.clone()),
        entrypoint: Some(Vec::new()),
        env: Some(env),
        working_dir: Some(spec.workspace_mount.clone()),
        labels: Some(labels),
        exposed_ports: Some(exposed_ports),
        host_config: Some(host_config),
        tty: Some(false),
        ..Default::default()
    })
}

fn resource_info(inspect: ContainerInspectResponse) -> ResourceInfo {
    let state = inspect
        .state
        .as_ref()
        .and_then(|s| s.status.as_ref())
        .map(|s| s.to_string())
        .unwrap_or_else(|| "unknown".to_string());
    let running = inspect
        .state
        .as_ref()
        .and_then(|s| s.running)
        .unwrap_or(false);

    let mut ports = HashMap::new();
    if let Some(port_map) = inspect
        .network_settings
        .as_ref()
        .and_then(|ns| ns.ports.as_ref())
    {
        for (container_port, bindings) in port_map {
            // Format: "8080/tcp"
            let Some(port) = container_port
                .split('/')
                .next()
                .and_then(|p| p.parse::<u16>().ok())
            else {
                continue;
            };
            let host_port = bindings
                .as_ref()
                .and_then(|b| b.first())
                .and_then(|b| b.host_port.as_ref())
                .and_then(|p| p.parse::<u16>().ok());
            if let Some(host_port) = host_port {
                ports.insert(port, host_port);
            }
        }
    }

    let created_at = inspect
        .created
        .as_ref()
        .and_then(|s| chrono::DateTime::parse_from_rfc3339(s).ok())
        .map(|dt| dt.with_timezone(&chrono::Utc));

    let project_id = inspect
        .config
        .as_ref()
        .and_then(|c| c.labels.as_ref())
        .and_then(|labels| labels.get(PROJECT_LABEL).cloned());

    let backend_ref = inspect.id.clone().unwrap_or_default();
    ResourceInfo {
        name: inspect
            .name
            .clone()
            .unwrap_or_else(|| backend_ref.clone())
            .trim_start_matches('/')
            .to_string(),
        backend_ref,
        project_id,
        state,
        running,
        ip_address: inspect
            .network_settings
            .and_then(|ns| ns.ip_address)
            .filter(|s| !s.is_empty()),
        ports,
        created_at,
    }
}

fn map_docker_error(context: &str, e: BollardError) -> SandboxError {
    match e {
        BollardError::DockerResponseServerError {
            status_code,
            message,
        } => SandboxError::Backend(format!("{}: {} (status {})", context, message, status_code)),
        other => SandboxError::BackendUnavailable(format!("{}: {}", context, other)),
    }
}

fn exec_error(backend_ref: &str, e: BollardError) -> SandboxError {
    match e {
        BollardError::DockerResponseServerError {
            status_code: 404 | 409,
            message,
        } => SandboxError::Exec(format!("container {} is not running: {}", backend_ref, message)),
        other => map_docker_error("exec", other),
    }
}

fn provisioning(spec: &ProvisionSpec, e: SandboxError) -> SandboxError {
    match e {
        SandboxError::Backend(message) => SandboxError::Provisioning {
            project_id: spec.project_id.clone(),
            message,
        },
        other => other,
    }
}
