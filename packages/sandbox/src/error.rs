// ABOUTME: Error taxonomy for sandbox provisioning, execution and IDE sessions
// ABOUTME: Carries enough structure for callers to decide between retry and abort

use thiserror::Error;

/// Main error type for sandbox operations.
///
/// Every variant holds owned strings so the error is `Clone`; the registry
/// hands the same failure to every caller that waited on one creation.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum SandboxError {
    /// Unknown provider kind or otherwise unusable configuration
    #[error("Configuration error: {0}")]
    Configuration(String),

    /// Backend refused or failed to create the sandbox
    #[error("Provisioning failed for project {project_id}: {message}")]
    Provisioning { project_id: String, message: String },

    /// Backend never reported a ready sandbox within the attempt budget
    #[error("Provisioning timed out for project {project_id} after {attempts} attempts")]
    ProvisioningTimeout { project_id: String, attempts: u32 },

    /// Docker daemon or remote API could not be reached
    #[error("Backend unavailable: {0}")]
    BackendUnavailable(String),

    /// No live sandbox exists for the project
    #[error("Sandbox not found for project: {0}")]
    SandboxNotFound(String),

    /// Editor process did not become ready within its budget
    #[error("IDE failed to start on port {port}: {message}")]
    IdeStartup { port: u16, message: String },

    /// Port already bound by another session or process
    #[error("Port {port} is unavailable: {reason}")]
    PortConflict { port: u16, reason: String },

    /// A live sandbox for the project belongs to another provider kind
    #[error("Project {project_id} already has a {existing} sandbox (requested {requested})")]
    ProviderMismatch {
        project_id: String,
        existing: String,
        requested: String,
    },

    /// Lifecycle edge not allowed by the state machine
    #[error("Invalid state transition: {0}")]
    InvalidStateTransition(String),

    /// Exec could not be started or its result could not be read
    #[error("Command execution failed: {0}")]
    Exec(String),

    /// Local tree could not be packed or uploaded
    #[error("File sync failed: {0}")]
    FileSync(String),

    /// Backend answered with an unexpected error
    #[error("Backend error: {0}")]
    Backend(String),
}

impl SandboxError {
    /// Build the configuration error reported for an unrecognized provider kind.
    pub fn invalid_provider_kind(value: &str, valid: &[&str]) -> Self {
        let shown = if value.trim().is_empty() {
            "<empty>".to_string()
        } else {
            format!("'{}'", value)
        };
        SandboxError::Configuration(format!(
            "invalid provider kind {}; valid kinds are: {}",
            shown,
            valid.join(", ")
        ))
    }

    /// Whether a caller may reasonably retry the same request later.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            SandboxError::Provisioning { .. }
                | SandboxError::ProvisioningTimeout { .. }
                | SandboxError::BackendUnavailable(_)
                | SandboxError::IdeStartup { .. }
                | SandboxError::PortConflict { .. }
        )
    }
}

/// Type alias for Results that return SandboxError
pub type Result<T> = std::result::Result<T, SandboxError>;
