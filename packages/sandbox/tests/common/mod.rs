// ABOUTME: Shared test fixtures: a backend that runs sandbox commands as local processes
// ABOUTME: Lets provider, executor, sync and IDE tests run without Docker or a remote API

#![allow(dead_code)]

use async_trait::async_trait;
use devbox_sandbox::{
    EditorProfile, ExecConcurrency, ExecRequest, ExecStream, OutputChunk, ProviderFactory,
    ProviderKind, ProvisionSpec, ResourceInfo, Result, RetryPolicy, SandboxBackend, SandboxError,
    SandboxSettings, PortRange, StreamType,
};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tempfile::TempDir;
use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::sync::{mpsc, oneshot};

#[derive(Debug, Clone)]
struct Resource {
    id: String,
    name: String,
    project_id: String,
    running: bool,
}

/// Backend whose "resources" are directories and whose execs are host processes
pub struct LocalBackend {
    kind: ProviderKind,
    root: TempDir,
    resources: Mutex<HashMap<String, Resource>>,
    provisions: AtomicU32,
    next_id: AtomicU32,
    provision_delay: Mutex<Duration>,
    failure: Mutex<Option<SandboxError>>,
    concurrency: ExecConcurrency,
}

impl LocalBackend {
    pub fn new() -> Self {
        Self::with_kind(ProviderKind::Docker)
    }

    pub fn with_kind(kind: ProviderKind) -> Self {
        Self {
            kind,
            root: TempDir::new().unwrap(),
            resources: Mutex::new(HashMap::new()),
            provisions: AtomicU32::new(0),
            next_id: AtomicU32::new(1),
            provision_delay: Mutex::new(Duration::ZERO),
            failure: Mutex::new(None),
            concurrency: ExecConcurrency::Parallel,
        }
    }

    pub fn with_provision_delay(self, delay: Duration) -> Self {
        self.set_provision_delay(delay);
        self
    }

    pub fn set_provision_delay(&self, delay: Duration) {
        *self.provision_delay.lock().unwrap() = delay;
    }

    pub fn serialized(mut self) -> Self {
        self.concurrency = ExecConcurrency::Serialized;
        self
    }

    pub fn provisions(&self) -> u32 {
        self.provisions.load(Ordering::SeqCst)
    }

    /// Make the next provision calls fail with `error` (or succeed again with `None`).
    pub fn fail_provisioning(&self, error: Option<SandboxError>) {
        *self.failure.lock().unwrap() = error;
    }

    /// Remove a resource behind the system's back.
    pub fn vanish(&self, name: &str) {
        self.resources.lock().unwrap().retain(|_, r| r.name != name);
    }

    /// Stop a resource behind the system's back.
    pub fn stop_out_of_band(&self, name: &str) {
        for resource in self.resources.lock().unwrap().values_mut() {
            if resource.name == name {
                resource.running = false;
            }
        }
    }

    /// Pretend a resource survived from an earlier process.
    pub fn seed(&self, project_id: &str, name: &str) -> String {
        let id = format!("local-{}", self.next_id.fetch_add(1, Ordering::SeqCst));
        std::fs::create_dir_all(self.root.path().join(&id)).unwrap();
        self.resources.lock().unwrap().insert(
            id.clone(),
            Resource {
                id: id.clone(),
                name: name.to_string(),
                project_id: project_id.to_string(),
                running: true,
            },
        );
        id
    }

    pub fn list_managed_names(&self) -> Vec<String> {
        self.resources
            .lock()
            .unwrap()
            .values()
            .map(|r| r.name.clone())
            .collect()
    }

    /// Host directory standing in for the resource's filesystem root.
    pub fn filesystem(&self, backend_ref: &str) -> PathBuf {
        self.root.path().join(backend_ref)
    }

    fn info(resource: &Resource) -> ResourceInfo {
        ResourceInfo {
            backend_ref: resource.id.clone(),
            name: resource.name.clone(),
            project_id: Some(resource.project_id.clone()),
            state: if resource.running { "running" } else { "exited" }.to_string(),
            running: resource.running,
            ip_address: Some("127.0.0.1".to_string()),
            ports: HashMap::new(),
            created_at: None,
        }
    }

    fn require_running(&self, backend_ref: &str) -> Result<()> {
        match self.resources.lock().unwrap().get(backend_ref) {
            Some(resource) if resource.running => Ok(()),
            _ => Err(SandboxError::Exec(format!("{} is not running", backend_ref))),
        }
    }
}

async fn pump<R: AsyncRead + Unpin>(
    mut reader: R,
    stream: StreamType,
    tx: mpsc::UnboundedSender<OutputChunk>,
) {
    let mut buf = [0u8; 4096];
    loop {
        match reader.read(&mut buf).await {
            Ok(0) | Err(_) => break,
            Ok(n) => {
                let chunk = OutputChunk {
                    timestamp: chrono::Utc::now(),
                    stream,
                    data: buf[..n].to_vec(),
                };
                if tx.send(chunk).is_err() {
                    break;
                }
            }
        }
    }
}

#[async_trait]
impl SandboxBackend for LocalBackend {
    fn kind(&self) -> ProviderKind {
        self.kind
    }

    async fn ping(&self) -> Result<()> {
        Ok(())
    }

    async fn provision(&self, spec: &ProvisionSpec) -> Result<ResourceInfo> {
        let delay = *self.provision_delay.lock().unwrap();
        tokio::time::sleep(delay).await;
        self.provisions.fetch_add(1, Ordering::SeqCst);

        if let Some(error) = self.failure.lock().unwrap().clone() {
            return Err(error);
        }

        let mut resources = self.resources.lock().unwrap();
        if let Some(existing) = resources.values_mut().find(|r| r.name == spec.resource_name) {
            existing.running = true;
            return Ok(Self::info(existing));
        }

        let id = format!("local-{}", self.next_id.fetch_add(1, Ordering::SeqCst));
        std::fs::create_dir_all(self.root.path().join(&id)).unwrap();
        let resource = Resource {
            id: id.clone(),
            name: spec.resource_name.clone(),
            project_id: spec.project_id.clone(),
            running: true,
        };
        let info = Self::info(&resource);
        resources.insert(id, resource);
        Ok(info)
    }

    async fn inspect(&self, resource_name: &str) -> Result<Option<ResourceInfo>> {
        Ok(self
            .resources
            .lock()
            .unwrap()
            .values()
            .find(|r| r.name == resource_name)
            .map(Self::info))
    }

    async fn list_managed(&self) -> Result<Vec<ResourceInfo>> {
        Ok(self
            .resources
            .lock()
            .unwrap()
            .values()
            .map(Self::info)
            .collect())
    }

    async fn exec_stream(&self, backend_ref: &str, request: ExecRequest) -> Result<ExecStream> {
        self.require_running(backend_ref)?;

        let (program, args) = request
            .argv
            .split_first()
            .ok_or_else(|| SandboxError::Exec("empty argv".to_string()))?;
        let mut child = tokio::process::Command::new(program)
            .args(args)
            .envs(&request.env)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()
            .map_err(|e| SandboxError::Exec(e.to_string()))?;

        let (tx, receiver) = mpsc::unbounded_channel();
        let (exit_tx, exit_code) = oneshot::channel();
        let stdout = child.stdout.take().unwrap();
        let stderr = child.stderr.take().unwrap();

        tokio::spawn(async move {
            tokio::join!(
                pump(stdout, StreamType::Stdout, tx.clone()),
                pump(stderr, StreamType::Stderr, tx)
            );
            let code = child
                .wait()
                .await
                .map(|status| status.code().unwrap_or(-1) as i64)
                .map_err(|e| SandboxError::Exec(e.to_string()));
            let _ = exit_tx.send(code);
        });

        Ok(ExecStream {
            receiver,
            exit_code,
        })
    }

    async fn upload_archive(&self, backend_ref: &str, dest: &str, archive: Vec<u8>) -> Result<()> {
        self.require_running(backend_ref)?;
        let target = self
            .filesystem(backend_ref)
            .join(dest.trim_start_matches('/'));
        std::fs::create_dir_all(&target).map_err(|e| SandboxError::FileSync(e.to_string()))?;
        tar::Archive::new(archive.as_slice())
            .unpack(&target)
            .map_err(|e| SandboxError::FileSync(e.to_string()))
    }

    async fn remove(&self, backend_ref: &str) -> Result<bool> {
        Ok(self.resources.lock().unwrap().remove(backend_ref).is_some())
    }

    fn exec_concurrency(&self) -> ExecConcurrency {
        self.concurrency
    }

    fn endpoint_url(&self, _info: &ResourceInfo, port: u16) -> Option<String> {
        Some(format!("http://127.0.0.1:{}", port))
    }
}

/// Settings pointing all in-sandbox scratch files at `scratch`.
///
/// Registers `vscode` and `jupyter` editors whose "server" is a marker file:
/// ready while `ready-<port>` exists, removed again when the process is stopped.
pub fn test_settings(scratch: &Path) -> SandboxSettings {
    let mut settings = SandboxSettings::default();
    settings.runtime_dir = scratch.join("run").display().to_string();
    settings.workspace_root = scratch.join("workspaces");
    settings.kill_grace = Duration::from_secs(5);
    settings.ide_stop_wait = Duration::from_secs(2);
    settings.ide_ports = PortRange {
        start: 8080,
        end: 8082,
    };
    settings.ide_readiness = RetryPolicy {
        attempt_timeout: Duration::from_secs(5),
        ..RetryPolicy::fixed(20, Duration::from_millis(100))
    };

    let dir = scratch.display().to_string();
    for editor in ["vscode", "jupyter"] {
        settings.register_editor(
            editor,
            EditorProfile::new(format!(
                "echo {editor} >> {dir}/launches-{{port}}; \
                 trap 'rm -f {dir}/ready-{{port}}; exit 0' TERM; \
                 touch {dir}/ready-{{port}}; sleep 30 & wait"
            ))
            .with_probe(format!("test -f {dir}/ready-{{port}}")),
        );
    }
    settings
}

/// Factory whose docker kind is served by `backend`.
pub fn factory(backend: Arc<LocalBackend>, settings: SandboxSettings) -> ProviderFactory {
    ProviderFactory::new(settings).with_backend(ProviderKind::Docker, backend)
}

/// Number of times the editor on `port` was launched.
pub fn launches(scratch: &Path, port: u16) -> usize {
    std::fs::read_to_string(scratch.join(format!("launches-{}", port)))
        .map(|s| s.lines().count())
        .unwrap_or(0)
}
