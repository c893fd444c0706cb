// ABOUTME: Core type definitions for sandbox handles, IDE sessions and command results
// ABOUTME: Holds the lifecycle state machines shared by the registry, provider and IDE manager

use crate::error::{Result, SandboxError};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::sync::Arc;
use tokio::sync::RwLock;

/// Exit code reported for a command killed on timeout (same as coreutils `timeout`)
pub const TIMEOUT_EXIT_CODE: i64 = 124;

/// Backend variant that owns a sandbox
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ProviderKind {
    /// Local container engine
    Docker,
    /// Remote Fly Machines VM
    Fly,
}

impl ProviderKind {
    pub const ALL: [ProviderKind; 2] = [ProviderKind::Docker, ProviderKind::Fly];

    pub fn as_str(&self) -> &'static str {
        match self {
            ProviderKind::Docker => "docker",
            ProviderKind::Fly => "fly",
        }
    }

    /// Identifiers of every supported kind.
    pub fn identifiers() -> Vec<&'static str> {
        Self::ALL.iter().map(|kind| kind.as_str()).collect()
    }

    /// Resolve an identifier, failing with a configuration error that lists valid kinds.
    pub fn parse(value: &str) -> Result<Self> {
        let normalized = value.trim().to_lowercase();
        Self::ALL
            .into_iter()
            .find(|kind| kind.as_str() == normalized)
            .ok_or_else(|| SandboxError::invalid_provider_kind(value, &Self::identifiers()))
    }
}

impl fmt::Display for ProviderKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Sandbox lifecycle status
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SandboxStatus {
    /// Backend resource is being provisioned
    Creating,
    /// Backend resource is up and accepting commands
    Running,
    /// Backend resource exists but is not running
    Stopped,
    /// Backend could not be reached or provisioning failed; retryable
    Unreachable,
    /// Torn down; terminal
    Destroyed,
}

impl SandboxStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            SandboxStatus::Creating => "creating",
            SandboxStatus::Running => "running",
            SandboxStatus::Stopped => "stopped",
            SandboxStatus::Unreachable => "unreachable",
            SandboxStatus::Destroyed => "destroyed",
        }
    }

    pub fn can_transition_to(&self, next: SandboxStatus) -> bool {
        use SandboxStatus::*;
        match (self, next) {
            (Destroyed, _) => false,
            (_, Destroyed) => true,
            (Creating, Running | Unreachable | Stopped) => true,
            (Running, Running | Stopped | Unreachable) => true,
            (Stopped, Creating | Running | Unreachable) => true,
            (Unreachable, Creating | Running | Stopped | Unreachable) => true,
            _ => false,
        }
    }
}

/// IDE session lifecycle status
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum IdeSessionStatus {
    Starting,
    Running,
    Stopped,
    Failed,
}

impl IdeSessionStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            IdeSessionStatus::Starting => "starting",
            IdeSessionStatus::Running => "running",
            IdeSessionStatus::Stopped => "stopped",
            IdeSessionStatus::Failed => "failed",
        }
    }

    /// A session in this state still holds its port.
    pub fn holds_port(&self) -> bool {
        matches!(self, IdeSessionStatus::Starting | IdeSessionStatus::Running)
    }
}

/// Editor service bound to a port inside a sandbox
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IdeSession {
    pub port: u16,
    pub editor_kind: String,
    pub status: IdeSessionStatus,
    pub started_at: DateTime<Utc>,
    pub url: Option<String>,
}

/// In-memory record of one project's sandbox.
///
/// `project_id` and `provider_kind` are fixed at construction.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SandboxHandle {
    project_id: String,
    provider_kind: ProviderKind,
    /// Deterministic backend resource name (`<prefix>-<project_id>`)
    pub resource_name: String,
    /// Container id or machine id once provisioned
    pub backend_ref: Option<String>,
    pub status: SandboxStatus,
    pub created_at: DateTime<Utc>,
    pub last_seen_at: DateTime<Utc>,
    pub ide_sessions: BTreeMap<u16, IdeSession>,
    pub last_error: Option<String>,
}

/// Handle shared between the registry and every caller that asked for it
pub type SharedHandle = Arc<RwLock<SandboxHandle>>;

impl SandboxHandle {
    pub fn new(project_id: &str, provider_kind: ProviderKind, resource_name: String) -> Self {
        let now = Utc::now();
        Self {
            project_id: project_id.to_string(),
            provider_kind,
            resource_name,
            backend_ref: None,
            status: SandboxStatus::Creating,
            created_at: now,
            last_seen_at: now,
            ide_sessions: BTreeMap::new(),
            last_error: None,
        }
    }

    pub fn project_id(&self) -> &str {
        &self.project_id
    }

    pub fn provider_kind(&self) -> ProviderKind {
        self.provider_kind
    }

    pub fn is_running(&self) -> bool {
        self.status == SandboxStatus::Running
    }

    /// Move to `next`, rejecting edges the lifecycle does not allow.
    pub fn transition(&mut self, next: SandboxStatus) -> Result<()> {
        if !self.status.can_transition_to(next) {
            return Err(SandboxError::InvalidStateTransition(format!(
                "sandbox {} cannot move from {} to {}",
                self.project_id,
                self.status.as_str(),
                next.as_str()
            )));
        }
        self.status = next;
        Ok(())
    }

    /// Record a successful backend interaction.
    pub fn touch(&mut self) {
        self.last_seen_at = Utc::now();
    }

    /// Backend reference of a running sandbox, or `SandboxNotFound`.
    pub fn live_ref(&self) -> Result<String> {
        match (&self.backend_ref, self.status) {
            (Some(backend_ref), SandboxStatus::Running) => Ok(backend_ref.clone()),
            _ => Err(SandboxError::SandboxNotFound(self.project_id.clone())),
        }
    }
}

/// Options accepted by `create_sandbox`; unset fields fall back to settings
#[derive(Debug, Clone, Default)]
pub struct CreateSandboxOptions {
    pub image: Option<String>,
    pub cpu_cores: Option<f64>,
    pub memory_mb: Option<u64>,
    pub env_vars: HashMap<String, String>,
}

/// Whether a command ran to completion or was killed on timeout
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CommandStatus {
    Completed,
    TimedOut,
}

/// Result of running a command inside a sandbox
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CommandOutput {
    pub exit_code: i64,
    pub stdout: String,
    pub stderr: String,
    pub status: CommandStatus,
    pub duration_ms: u64,
}

impl CommandOutput {
    pub fn timed_out(&self) -> bool {
        self.status == CommandStatus::TimedOut
    }

    pub fn success(&self) -> bool {
        self.status == CommandStatus::Completed && self.exit_code == 0
    }
}

/// Resource usage statistics
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResourceUsage {
    pub cpu_usage_percent: f64,
    pub memory_usage_mb: u64,
    pub memory_limit_mb: u64,
    pub network_rx_bytes: u64,
    pub network_tx_bytes: u64,
}

/// Backend-reported sandbox metadata
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SandboxInfo {
    pub project_id: String,
    pub provider_kind: ProviderKind,
    pub backend_ref: String,
    pub name: String,
    pub state: String,
    pub running: bool,
    pub ip_address: Option<String>,
    /// sandbox port -> externally reachable port
    pub ports: HashMap<u16, u16>,
    pub created_at: Option<DateTime<Utc>>,
    pub usage: Option<ResourceUsage>,
}

/// Summary returned by IDE setup
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IdeServerInfo {
    pub port: u16,
    pub editor_kind: String,
    pub status: IdeSessionStatus,
    pub url: Option<String>,
}

impl From<&IdeSession> for IdeServerInfo {
    fn from(session: &IdeSession) -> Self {
        Self {
            port: session.port,
            editor_kind: session.editor_kind.clone(),
            status: session.status,
            url: session.url.clone(),
        }
    }
}

/// Counts reported after a file sync
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SyncReport {
    pub files: usize,
    pub bytes: u64,
    pub skipped: usize,
}
