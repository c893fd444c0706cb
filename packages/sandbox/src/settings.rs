// ABOUTME: Sandbox settings loaded from environment variables
// ABOUTME: Resource limits, naming, IDE port range, editor profiles and Fly Machines access

use crate::error::SandboxError;
use crate::retry::RetryPolicy;
use devbox_config::constants::*;
use std::collections::HashMap;
use std::env;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;
use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq)]
pub enum SettingsError {
    #[error("Invalid value for {var}: '{value}'")]
    InvalidValue { var: String, value: String },
    #[error("Invalid port range: '{0}' (expected START-END)")]
    InvalidPortRange(String),
}

impl From<SettingsError> for SandboxError {
    fn from(e: SettingsError) -> Self {
        SandboxError::Configuration(e.to_string())
    }
}

/// Inclusive range of in-sandbox ports handed out to IDE sessions
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PortRange {
    pub start: u16,
    pub end: u16,
}

impl PortRange {
    pub fn contains(&self, port: u16) -> bool {
        port >= self.start && port <= self.end
    }

    pub fn ports(&self) -> impl Iterator<Item = u16> {
        self.start..=self.end
    }
}

impl FromStr for PortRange {
    type Err = SettingsError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let invalid = || SettingsError::InvalidPortRange(s.to_string());
        let (start, end) = s.trim().split_once('-').ok_or_else(invalid)?;
        let start = start.trim().parse::<u16>().map_err(|_| invalid())?;
        let end = end.trim().parse::<u16>().map_err(|_| invalid())?;
        if start == 0 || start > end {
            return Err(invalid());
        }
        Ok(PortRange { start, end })
    }
}

/// How to launch and probe one editor flavor.
///
/// Templates may use `{port}` and `{workspace}` placeholders.
#[derive(Debug, Clone, PartialEq)]
pub struct EditorProfile {
    pub launch: String,
    /// Shell command exiting 0 once the editor answers; defaults to a TCP probe
    pub probe: Option<String>,
}

impl EditorProfile {
    pub fn new(launch: impl Into<String>) -> Self {
        Self {
            launch: launch.into(),
            probe: None,
        }
    }

    pub fn with_probe(mut self, probe: impl Into<String>) -> Self {
        self.probe = Some(probe.into());
        self
    }
}

fn default_editors() -> HashMap<String, EditorProfile> {
    HashMap::from([
        (
            "vscode".to_string(),
            EditorProfile::new(
                "code-server --bind-addr 0.0.0.0:{port} --auth none --disable-telemetry {workspace}",
            ),
        ),
        (
            "openvscode".to_string(),
            EditorProfile::new(
                "openvscode-server --host 0.0.0.0 --port {port} --without-connection-token --default-folder {workspace}",
            ),
        ),
        (
            "jupyter".to_string(),
            EditorProfile::new(
                "jupyter lab --ip=0.0.0.0 --port={port} --no-browser --allow-root --ServerApp.token='' --notebook-dir={workspace}",
            ),
        ),
    ])
}

/// Remote-VM access settings
#[derive(Debug, Clone, PartialEq)]
pub struct FlySettings {
    pub api_token: Option<String>,
    pub app_name: Option<String>,
    pub api_url: String,
    pub region: String,
    /// Budget for waiting on a machine to reach `started`
    pub readiness: RetryPolicy,
}

impl Default for FlySettings {
    fn default() -> Self {
        Self {
            api_token: None,
            app_name: None,
            api_url: "https://api.machines.dev".to_string(),
            region: "iad".to_string(),
            readiness: RetryPolicy::fixed(30, Duration::from_millis(1000)),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct SandboxSettings {
    // Provider Selection (validated by the factory, not here)
    pub provider: Option<String>,

    // Naming & Image
    pub resource_prefix: String,
    pub image: String,
    pub keepalive_command: Vec<String>,

    // Workspace Layout
    pub workspace_root: PathBuf,
    pub workspace_mount: String,
    pub runtime_dir: String,

    // Resource Limits
    pub cpu_cores: f64,
    pub memory_mb: u64,
    pub pids_limit: i64,

    // Network Settings
    pub docker_network: String,
    pub publish_host: String,
    pub ide_ports: PortRange,

    // File Sync
    pub sync_ignore: Vec<String>,

    // Timeouts
    pub provision_timeout: Duration,
    pub kill_grace: Duration,
    pub ide_readiness: RetryPolicy,
    pub ide_stop_wait: Duration,

    pub editors: HashMap<String, EditorProfile>,
    pub fly: FlySettings,
}

impl Default for SandboxSettings {
    fn default() -> Self {
        let workspace_root = dirs::home_dir()
            .unwrap_or_else(env::temp_dir)
            .join(".devbox")
            .join("workspaces");

        Self {
            provider: None,
            resource_prefix: "devbox".to_string(),
            image: "codercom/code-server:latest".to_string(),
            keepalive_command: vec!["sleep".to_string(), "infinity".to_string()],
            workspace_root,
            workspace_mount: "/workspace".to_string(),
            runtime_dir: "/tmp/.devbox".to_string(),
            cpu_cores: 2.0,
            memory_mb: 2048,
            pids_limit: 512,
            docker_network: "bridge".to_string(),
            publish_host: "127.0.0.1".to_string(),
            ide_ports: PortRange {
                start: 8080,
                end: 8089,
            },
            sync_ignore: [
                ".git",
                "node_modules",
                "target",
                "__pycache__",
                ".venv",
                ".DS_Store",
            ]
            .iter()
            .map(|s| s.to_string())
            .collect(),
            provision_timeout: Duration::from_secs(180),
            kill_grace: Duration::from_secs(5),
            ide_readiness: RetryPolicy::default(),
            ide_stop_wait: Duration::from_secs(5),
            editors: default_editors(),
            fly: FlySettings::default(),
        }
    }
}

impl SandboxSettings {
    pub fn from_env() -> Result<Self, SettingsError> {
        Self::from_lookup(|name| env::var(name).ok())
    }

    /// Build settings from an arbitrary variable source; unset values keep their defaults.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, SettingsError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let get = |name: &str| {
            lookup(name)
                .map(|v| v.trim().to_string())
                .filter(|v| !v.is_empty())
        };
        let mut settings = Self::default();

        settings.provider = get(VM_PROVIDER);

        if let Some(prefix) = get(DEVBOX_RESOURCE_PREFIX) {
            settings.resource_prefix = prefix;
        }
        if let Some(image) = get(DEVBOX_SANDBOX_IMAGE) {
            settings.image = image;
        }
        if let Some(root) = get(DEVBOX_WORKSPACE_ROOT) {
            settings.workspace_root = PathBuf::from(root);
        }
        if let Some(mount) = get(DEVBOX_WORKSPACE_MOUNT) {
            settings.workspace_mount = mount;
        }
        if let Some(dir) = get(DEVBOX_RUNTIME_DIR) {
            settings.runtime_dir = dir;
        }
        if let Some(value) = get(DEVBOX_CPU_CORES) {
            settings.cpu_cores = parse_var(DEVBOX_CPU_CORES, &value)?;
            if !settings.cpu_cores.is_finite() || settings.cpu_cores <= 0.0 {
                return Err(SettingsError::InvalidValue {
                    var: DEVBOX_CPU_CORES.to_string(),
                    value,
                });
            }
        }
        if let Some(value) = get(DEVBOX_MEMORY_MB) {
            settings.memory_mb = parse_var(DEVBOX_MEMORY_MB, &value)?;
        }
        if let Some(value) = get(DEVBOX_PIDS_LIMIT) {
            settings.pids_limit = parse_var(DEVBOX_PIDS_LIMIT, &value)?;
        }
        if let Some(network) = get(DEVBOX_DOCKER_NETWORK) {
            settings.docker_network = network;
        }
        if let Some(host) = get(DEVBOX_PUBLISH_HOST) {
            settings.publish_host = host;
        }
        if let Some(range) = get(DEVBOX_IDE_PORT_RANGE) {
            settings.ide_ports = range.parse()?;
        }
        if let Some(ignore) = get(DEVBOX_SYNC_IGNORE) {
            settings.sync_ignore = ignore
                .split(',')
                .map(|s| s.trim().to_string())
                .filter(|s| !s.is_empty())
                .collect();
        }
        if let Some(value) = get(DEVBOX_PROVISION_TIMEOUT_SECS) {
            settings.provision_timeout =
                Duration::from_secs(parse_var(DEVBOX_PROVISION_TIMEOUT_SECS, &value)?);
        }
        if let Some(value) = get(DEVBOX_KILL_GRACE_SECS) {
            settings.kill_grace = Duration::from_secs(parse_var(DEVBOX_KILL_GRACE_SECS, &value)?);
        }

        // Fly Machines
        settings.fly.api_token = get(FLY_API_TOKEN);
        settings.fly.app_name = get(FLY_APP_NAME);
        if let Some(url) = get(FLY_API_URL) {
            settings.fly.api_url = url;
        }
        if let Some(region) = get(FLY_REGION) {
            settings.fly.region = region;
        }
        let attempts = match get(FLY_POLL_ATTEMPTS) {
            Some(value) => parse_var(FLY_POLL_ATTEMPTS, &value)?,
            None => settings.fly.readiness.max_attempts,
        };
        let interval = match get(FLY_POLL_INTERVAL_MS) {
            Some(value) => Duration::from_millis(parse_var(FLY_POLL_INTERVAL_MS, &value)?),
            None => settings.fly.readiness.initial_delay,
        };
        settings.fly.readiness = RetryPolicy::fixed(attempts, interval);

        Ok(settings)
    }

    /// Deterministic backend resource name for a project.
    pub fn resource_name(&self, project_id: &str) -> String {
        format!("{}-{}", self.resource_prefix, project_id)
    }

    /// Host directory bind-mounted as the project's workspace.
    pub fn host_workspace(&self, project_id: &str) -> PathBuf {
        self.workspace_root.join(project_id)
    }

    pub fn register_editor(&mut self, editor_kind: &str, profile: EditorProfile) {
        self.editors.insert(editor_kind.to_string(), profile);
    }
}

fn parse_var<T: FromStr>(var: &str, value: &str) -> Result<T, SettingsError> {
    value.parse::<T>().map_err(|_| SettingsError::InvalidValue {
        var: var.to_string(),
        value: value.to_string(),
    })
}
