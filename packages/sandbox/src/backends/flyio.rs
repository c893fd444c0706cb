// ABOUTME: Remote-VM backend built on the Fly Machines REST API
// ABOUTME: Creates one machine per project and polls it until the API reports it started

use super::{
    ExecConcurrency, ExecRequest, ExecStream, ProvisionSpec, ResourceInfo, SandboxBackend,
    StreamType,
};
use crate::error::{Result, SandboxError};
use crate::retry::{poll_until, RetryError, RetryPolicy};
use crate::settings::{PortRange, SandboxSettings};
use crate::types::ProviderKind;
use async_trait::async_trait;
use base64::Engine;
use reqwest::{RequestBuilder, Response, StatusCode};
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::collections::HashMap;
use std::time::Duration;
use tracing::{debug, info, warn};

const PROJECT_METADATA: &str = "devbox_project_id";
const MANAGED_METADATA: &str = "devbox_managed";
const DEFAULT_EXEC_TIMEOUT_SECS: u64 = 60;

#[derive(Debug, Clone, Deserialize)]
struct Machine {
    id: String,
    #[serde(default)]
    name: String,
    #[serde(default)]
    state: String,
    #[serde(default)]
    private_ip: Option<String>,
    #[serde(default)]
    created_at: Option<String>,
    #[serde(default)]
    config: Option<MachineConfigView>,
}

#[derive(Debug, Clone, Default, Deserialize)]
struct MachineConfigView {
    #[serde(default)]
    metadata: HashMap<String, String>,
}

impl Machine {
    fn metadata(&self, key: &str) -> Option<&String> {
        self.config.as_ref().and_then(|c| c.metadata.get(key))
    }

    fn is_gone(&self) -> bool {
        matches!(self.state.as_str(), "destroyed" | "destroying")
    }
}

#[derive(Debug, Serialize)]
struct ExecBody {
    command: Vec<String>,
    timeout: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    stdin: Option<String>,
}

#[derive(Debug, Deserialize)]
struct ExecResponse {
    #[serde(default)]
    exit_code: i64,
    #[serde(default)]
    stdout: String,
    #[serde(default)]
    stderr: String,
}

/// HTTP client for one Fly app's machines.
#[derive(Clone)]
pub struct FlyioBackend {
    client: reqwest::Client,
    base_url: String,
    api_token: Option<String>,
    app_name: Option<String>,
    region: String,
    ide_ports: PortRange,
    readiness: RetryPolicy,
}

impl FlyioBackend {
    /// Missing credentials are reported when the backend is first used, not here.
    pub fn new(settings: &SandboxSettings) -> Result<Self> {
        let client = reqwest::Client::builder()
            .connect_timeout(Duration::from_secs(10))
            .build()
            .map_err(|e| SandboxError::Configuration(format!("HTTP client: {}", e)))?;

        Ok(Self {
            client,
            base_url: settings.fly.api_url.trim_end_matches('/').to_string(),
            api_token: settings.fly.api_token.clone(),
            app_name: settings.fly.app_name.clone(),
            region: settings.fly.region.clone(),
            ide_ports: settings.ide_ports,
            readiness: settings.fly.readiness.clone(),
        })
    }

    fn machines_url(&self) -> Result<String> {
        let app = self.app_name.as_deref().ok_or_else(|| {
            SandboxError::Configuration("FLY_APP_NAME is required for the fly provider".to_string())
        })?;
        Ok(format!("{}/v1/apps/{}/machines", self.base_url, app))
    }

    fn authorized(&self, request: RequestBuilder) -> RequestBuilder {
        match &self.api_token {
            Some(token) => request.bearer_auth(token),
            None => request,
        }
    }

    /// Send a request; `None` on 404, typed errors for everything unexpected.
    async fn send(&self, request: RequestBuilder, context: &str) -> Result<Option<Response>> {
        let resp = self
            .authorized(request)
            .send()
            .await
            .map_err(|e| SandboxError::BackendUnavailable(format!("{}: {}", context, e)))?;

        let status = resp.status();
        if status == StatusCode::NOT_FOUND {
            return Ok(None);
        }
        if status.is_success() {
            return Ok(Some(resp));
        }

        let body = resp.text().await.unwrap_or_default();
        let message = format!("{} returned {}: {}", context, status, body.trim());
        if status.is_server_error() || status == StatusCode::TOO_MANY_REQUESTS {
            Err(SandboxError::BackendUnavailable(message))
        } else {
            Err(SandboxError::Backend(message))
        }
    }

    async fn parse<T: serde::de::DeserializeOwned>(resp: Response, context: &str) -> Result<T> {
        resp.json::<T>()
            .await
            .map_err(|e| SandboxError::Backend(format!("failed to parse {} response: {}", context, e)))
    }

    async fn list_machines(&self) -> Result<Vec<Machine>> {
        let url = self.machines_url()?;
        match self.send(self.client.get(&url), "list machines").await? {
            Some(resp) => Self::parse(resp, "list machines").await,
            None => Err(SandboxError::Configuration(format!(
                "fly app {:?} not found",
                self.app_name
            ))),
        }
    }

    async fn get_machine(&self, machine_id: &str) -> Result<Option<Machine>> {
        let url = format!("{}/{}", self.machines_url()?, machine_id);
        match self.send(self.client.get(&url), "get machine").await? {
            Some(resp) => Ok(Some(Self::parse(resp, "get machine").await?)),
            None => Ok(None),
        }
    }

    async fn find_by_name(&self, name: &str) -> Result<Option<Machine>> {
        Ok(self
            .list_machines()
            .await?
            .into_iter()
            .find(|m| m.name == name && !m.is_gone()))
    }

    async fn create_machine(&self, spec: &ProvisionSpec) -> Result<Machine> {
        let url = self.machines_url()?;
        let body = json!({
            "name": spec.resource_name,
            "region": self.region,
            "config": {
                "image": spec.image,
                "env": spec.env_vars,
                "init": { "cmd": spec.keepalive_command },
                "guest": {
                    "cpu_kind": "shared",
                    "cpus": spec.cpu_cores.ceil().max(1.0) as u64,
                    "memory_mb": spec.memory_mb,
                },
                "restart": { "policy": "no" },
                "metadata": {
                    PROJECT_METADATA: spec.project_id,
                    MANAGED_METADATA: "true",
                },
            },
        });

        info!(project_id = %spec.project_id, name = %spec.resource_name, "Creating machine");

        let resp = self
            .send(self.client.post(&url).json(&body), "create machine")
            .await
            .map_err(|e| match e {
                SandboxError::Backend(message) => SandboxError::Provisioning {
                    project_id: spec.project_id.clone(),
                    message,
                },
                other => other,
            })?
            .ok_or_else(|| {
                SandboxError::Configuration(format!("fly app {:?} not found", self.app_name))
            })?;
        Self::parse(resp, "create machine").await
    }

    async fn start_machine(&self, machine_id: &str) -> Result<()> {
        let url = format!("{}/{}/start", self.machines_url()?, machine_id);
        self.send(self.client.post(&url), "start machine").await?;
        Ok(())
    }

    /// Poll until the machine reports `started`.
    async fn wait_started(&self, spec: &ProvisionSpec, machine_id: &str) -> Result<Machine> {
        let result = poll_until(&self.readiness, "fly machine start", |_| async move {
            match self.get_machine(machine_id).await? {
                Some(machine) if machine.state == "started" => Ok(Some(machine)),
                Some(machine) if matches!(machine.state.as_str(), "failed" | "destroyed") => Err(
                    SandboxError::Backend(format!("machine entered state {}", machine.state)),
                ),
                Some(machine) => {
                    debug!(backend_ref = machine_id, state = %machine.state, "Machine not ready");
                    Ok(None)
                }
                None => Err(SandboxError::Backend(format!(
                    "machine {} disappeared while starting",
                    machine_id
                ))),
            }
        })
        .await;

        result.map_err(|e| match e {
            RetryError::Exhausted { attempts, .. } => SandboxError::ProvisioningTimeout {
                project_id: spec.project_id.clone(),
                attempts,
            },
            RetryError::Aborted(SandboxError::Backend(message)) => SandboxError::Provisioning {
                project_id: spec.project_id.clone(),
                message,
            },
            RetryError::Aborted(other) => other,
        })
    }

    async fn exec_raw(
        &self,
        machine_id: &str,
        command: Vec<String>,
        timeout_secs: u64,
        stdin: Option<String>,
    ) -> Result<ExecResponse> {
        let url = format!("{}/{}/exec", self.machines_url()?, machine_id);
        let body = ExecBody {
            command,
            timeout: timeout_secs,
            stdin,
        };

        let resp = self
            .send(self.client.post(&url).json(&body), "exec")
            .await?
            .ok_or_else(|| SandboxError::Exec(format!("machine {} not found", machine_id)))?;
        Self::parse(resp, "exec").await
    }

    fn resource_info(&self, machine: Machine) -> ResourceInfo {
        let project_id = machine.metadata(PROJECT_METADATA).cloned();
        let created_at = machine
            .created_at
            .as_deref()
            .and_then(|s| chrono::DateTime::parse_from_rfc3339(s).ok())
            .map(|dt| dt.with_timezone(&chrono::Utc));
        // Private network: in-machine ports are reachable as-is
        let ports = self.ide_ports.ports().map(|p| (p, p)).collect();

        ResourceInfo {
            running: machine.state == "started",
            backend_ref: machine.id,
            name: machine.name,
            project_id,
            state: machine.state,
            ip_address: machine.private_ip,
            ports,
            created_at,
        }
    }
}

/// Fold working directory and environment into the argv, since the exec endpoint takes neither.
fn command_line(request: &ExecRequest) -> Vec<String> {
    let mut argv = Vec::new();
    if !request.env.is_empty() {
        argv.push("env".to_string());
        let mut vars: Vec<_> = request.env.iter().collect();
        vars.sort();
        argv.extend(vars.into_iter().map(|(k, v)| format!("{}={}", k, v)));
    }
    argv.extend(request.argv.iter().cloned());

    match &request.working_dir {
        Some(dir) => {
            let mut wrapped = vec![
                "sh".to_string(),
                "-c".to_string(),
                "cd \"$1\" && shift && exec \"$@\"".to_string(),
                "devbox".to_string(),
                dir.clone(),
            ];
            wrapped.extend(argv);
            wrapped
        }
        None => argv,
    }
}

#[async_trait]
impl SandboxBackend for FlyioBackend {
    fn kind(&self) -> ProviderKind {
        ProviderKind::Fly
    }

    async fn ping(&self) -> Result<()> {
        self.list_machines().await.map(|_| ())
    }

    async fn provision(&self, spec: &ProvisionSpec) -> Result<ResourceInfo> {
        let machine = match self.find_by_name(&spec.resource_name).await? {
            Some(existing) => {
                info!(
                    project_id = %spec.project_id,
                    backend_ref = %existing.id,
                    state = %existing.state,
                    "Adopting existing machine"
                );
                if existing.state != "started" {
                    self.start_machine(&existing.id).await?;
                }
                existing
            }
            None => self.create_machine(spec).await?,
        };

        let started = self.wait_started(spec, &machine.id).await?;
        info!(project_id = %spec.project_id, backend_ref = %started.id, "Machine started");
        Ok(self.resource_info(started))
    }

    async fn inspect(&self, resource_name: &str) -> Result<Option<ResourceInfo>> {
        Ok(self
            .find_by_name(resource_name)
            .await?
            .map(|m| self.resource_info(m)))
    }

    async fn list_managed(&self) -> Result<Vec<ResourceInfo>> {
        Ok(self
            .list_machines()
            .await?
            .into_iter()
            .filter(|m| !m.is_gone() && m.metadata(MANAGED_METADATA).map(String::as_str) == Some("true"))
            .map(|m| self.resource_info(m))
            .collect())
    }

    async fn exec_stream(&self, backend_ref: &str, request: ExecRequest) -> Result<ExecStream> {
        let command = command_line(&request);
        let timeout_secs = request
            .timeout
            .map(|t| t.as_secs().max(1))
            .unwrap_or(DEFAULT_EXEC_TIMEOUT_SECS);
        debug!(backend_ref = backend_ref, argv = ?command, "Starting exec");

        // The endpoint answers once the process exits, so output arrives in one piece
        let (sink, stream) = ExecStream::channel();
        let backend = self.clone();
        let machine_id = backend_ref.to_string();
        tokio::spawn(async move {
            match backend.exec_raw(&machine_id, command, timeout_secs, None).await {
                Ok(resp) => {
                    sink.send(StreamType::Stdout, resp.stdout.into_bytes());
                    sink.send(StreamType::Stderr, resp.stderr.into_bytes());
                    sink.finish(Ok(resp.exit_code));
                }
                Err(e) => sink.finish(Err(e)),
            }
        });
        Ok(stream)
    }

    async fn upload_archive(&self, backend_ref: &str, dest: &str, archive: Vec<u8>) -> Result<()> {
        let encoded = base64::engine::general_purpose::STANDARD.encode(&archive);
        let command = vec![
            "sh".to_string(),
            "-c".to_string(),
            "mkdir -p \"$1\" && base64 -d | tar -xf - -C \"$1\"".to_string(),
            "devbox".to_string(),
            dest.to_string(),
        ];

        let resp = self
            .exec_raw(backend_ref, command, DEFAULT_EXEC_TIMEOUT_SECS, Some(encoded))
            .await?;
        if resp.exit_code != 0 {
            return Err(SandboxError::FileSync(format!(
                "extract into {} exited {}: {}",
                dest,
                resp.exit_code,
                resp.stderr.trim()
            )));
        }
        Ok(())
    }

    async fn remove(&self, backend_ref: &str) -> Result<bool> {
        let url = format!("{}/{}", self.machines_url()?, backend_ref);
        let request = self.client.delete(&url).query(&[("force", "true")]);
        match self.send(request, "destroy machine").await? {
            Some(_) => {
                info!(backend_ref = backend_ref, "Destroyed machine");
                Ok(true)
            }
            None => {
                warn!(backend_ref = backend_ref, "Machine already gone");
                Ok(false)
            }
        }
    }

    fn exec_concurrency(&self) -> ExecConcurrency {
        ExecConcurrency::Serialized
    }

    fn endpoint_url(&self, info: &ResourceInfo, port: u16) -> Option<String> {
        let app = self.app_name.as_deref()?;
        Some(format!(
            "http://{}.vm.{}.internal:{}",
            info.backend_ref, app, port
        ))
    }
}
