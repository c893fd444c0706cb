// ABOUTME: Backend trait and shared types for sandbox infrastructure
// ABOUTME: Local containers and remote VMs implement the same resource-level contract

use crate::error::{Result, SandboxError};
use crate::settings::PortRange;
use crate::types::{ProviderKind, ResourceUsage};
use async_trait::async_trait;
use std::collections::HashMap;
use std::path::PathBuf;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};

pub mod docker;
pub mod flyio;

pub use docker::DockerBackend;
pub use flyio::FlyioBackend;

/// Everything a backend needs to provision one project's resource
#[derive(Debug, Clone)]
pub struct ProvisionSpec {
    pub project_id: String,
    /// Deterministic name used to find and adopt an existing resource
    pub resource_name: String,
    pub image: String,
    pub cpu_cores: f64,
    pub memory_mb: u64,
    pub pids_limit: i64,
    pub env_vars: HashMap<String, String>,
    pub host_workspace: PathBuf,
    pub workspace_mount: String,
    pub ide_ports: PortRange,
    pub keepalive_command: Vec<String>,
}

/// Backend view of a resource
#[derive(Debug, Clone, PartialEq)]
pub struct ResourceInfo {
    pub backend_ref: String,
    pub name: String,
    /// Project label read back from the backend, if present
    pub project_id: Option<String>,
    pub state: String,
    pub running: bool,
    pub ip_address: Option<String>,
    /// sandbox port -> externally reachable port
    pub ports: HashMap<u16, u16>,
    pub created_at: Option<chrono::DateTime<chrono::Utc>>,
}

/// Whether a backend accepts overlapping exec calls on one resource
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExecConcurrency {
    Parallel,
    /// One exec at a time; callers queue in submission order
    Serialized,
}

#[derive(Debug, Clone, Default)]
pub struct ExecRequest {
    pub argv: Vec<String>,
    pub working_dir: Option<String>,
    pub env: HashMap<String, String>,
    /// Hint for backends that enforce their own deadline
    pub timeout: Option<Duration>,
}

impl ExecRequest {
    pub fn new(argv: Vec<String>) -> Self {
        Self {
            argv,
            ..Default::default()
        }
    }

    /// Run `script` through `sh -c`, passing `args` as `$1..`.
    pub fn shell(script: &str, args: &[&str]) -> Self {
        let mut argv = vec![
            "sh".to_string(),
            "-c".to_string(),
            script.to_string(),
            "devbox".to_string(),
        ];
        argv.extend(args.iter().map(|a| a.to_string()));
        Self::new(argv)
    }

    pub fn with_working_dir(mut self, dir: impl Into<String>) -> Self {
        self.working_dir = Some(dir.into());
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }
}

#[derive(Debug, Clone)]
pub struct OutputChunk {
    pub timestamp: chrono::DateTime<chrono::Utc>,
    pub stream: StreamType,
    pub data: Vec<u8>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamType {
    Stdout,
    Stderr,
}

/// Output of a running exec.
///
/// Chunks arrive on `receiver` as the process writes them; `exit_code`
/// resolves once the process is gone.
pub struct ExecStream {
    pub receiver: mpsc::UnboundedReceiver<OutputChunk>,
    pub exit_code: oneshot::Receiver<Result<i64>>,
}

impl ExecStream {
    /// Create a connected stream and the sending halves a backend feeds.
    pub fn channel() -> (ExecSink, Self) {
        let (chunk_tx, receiver) = mpsc::unbounded_channel();
        let (exit_tx, exit_code) = oneshot::channel();
        (
            ExecSink {
                chunks: chunk_tx,
                exit: exit_tx,
            },
            Self {
                receiver,
                exit_code,
            },
        )
    }

    /// A stream for an exec whose output was returned in one piece.
    pub fn completed(exit_code: i64, stdout: Vec<u8>, stderr: Vec<u8>) -> Self {
        let (sink, stream) = Self::channel();
        sink.send(StreamType::Stdout, stdout);
        sink.send(StreamType::Stderr, stderr);
        sink.finish(Ok(exit_code));
        stream
    }

    /// Drain every chunk and wait for the exit code.
    pub async fn collect(mut self) -> Result<(i64, Vec<u8>, Vec<u8>)> {
        let mut stdout = Vec::new();
        let mut stderr = Vec::new();
        while let Some(chunk) = self.receiver.recv().await {
            match chunk.stream {
                StreamType::Stdout => stdout.extend_from_slice(&chunk.data),
                StreamType::Stderr => stderr.extend_from_slice(&chunk.data),
            }
        }
        let code = self
            .exit_code
            .await
            .map_err(|_| SandboxError::Exec("exec ended without an exit code".to_string()))??;
        Ok((code, stdout, stderr))
    }
}

/// Backend side of an [`ExecStream`]
pub struct ExecSink {
    chunks: mpsc::UnboundedSender<OutputChunk>,
    exit: oneshot::Sender<Result<i64>>,
}

impl ExecSink {
    /// Forward a chunk; returns false once the reader has gone away.
    pub fn send(&self, stream: StreamType, data: Vec<u8>) -> bool {
        if data.is_empty() {
            return !self.chunks.is_closed();
        }
        self.chunks
            .send(OutputChunk {
                timestamp: chrono::Utc::now(),
                stream,
                data,
            })
            .is_ok()
    }

    pub fn finish(self, exit_code: Result<i64>) {
        // Reader may have stopped listening after a timeout
        let _ = self.exit.send(exit_code);
    }
}

/// Resource-level operations every sandbox backend provides
#[async_trait]
pub trait SandboxBackend: Send + Sync {
    fn kind(&self) -> ProviderKind;

    /// Cheap reachability check against the daemon or API
    async fn ping(&self) -> Result<()>;

    /// Create and start the resource, adopting one that already carries `spec.resource_name`
    async fn provision(&self, spec: &ProvisionSpec) -> Result<ResourceInfo>;

    /// Look a resource up by name; `None` when it does not exist
    async fn inspect(&self, resource_name: &str) -> Result<Option<ResourceInfo>>;

    /// Every resource labelled as managed by this system
    async fn list_managed(&self) -> Result<Vec<ResourceInfo>>;

    /// Start a process inside the resource and stream its output
    async fn exec_stream(&self, backend_ref: &str, request: ExecRequest) -> Result<ExecStream>;

    /// Extract a tar archive at `dest` inside the resource
    async fn upload_archive(&self, backend_ref: &str, dest: &str, archive: Vec<u8>) -> Result<()>;

    /// Remove the resource; `false` when it was already gone
    async fn remove(&self, backend_ref: &str) -> Result<bool>;

    fn exec_concurrency(&self) -> ExecConcurrency {
        ExecConcurrency::Parallel
    }

    /// Address a client uses to reach `port` inside the resource
    fn endpoint_url(&self, info: &ResourceInfo, port: u16) -> Option<String>;

    async fn usage(&self, _backend_ref: &str) -> Result<Option<ResourceUsage>> {
        Ok(None)
    }
}
