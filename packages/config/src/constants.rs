// ABOUTME: Environment variable name constants
// ABOUTME: Centralized definitions of all environment variable names used across devbox

// Provider Selection
pub const VM_PROVIDER: &str = "VM_PROVIDER";

// Sandbox Naming & Image
pub const DEVBOX_RESOURCE_PREFIX: &str = "DEVBOX_RESOURCE_PREFIX";
pub const DEVBOX_SANDBOX_IMAGE: &str = "DEVBOX_SANDBOX_IMAGE";

// Workspace Layout
pub const DEVBOX_WORKSPACE_ROOT: &str = "DEVBOX_WORKSPACE_ROOT";
pub const DEVBOX_WORKSPACE_MOUNT: &str = "DEVBOX_WORKSPACE_MOUNT";
pub const DEVBOX_RUNTIME_DIR: &str = "DEVBOX_RUNTIME_DIR";

// Resource Limits
pub const DEVBOX_CPU_CORES: &str = "DEVBOX_CPU_CORES";
pub const DEVBOX_MEMORY_MB: &str = "DEVBOX_MEMORY_MB";
pub const DEVBOX_PIDS_LIMIT: &str = "DEVBOX_PIDS_LIMIT";

// Networking
pub const DEVBOX_DOCKER_NETWORK: &str = "DEVBOX_DOCKER_NETWORK";
pub const DEVBOX_PUBLISH_HOST: &str = "DEVBOX_PUBLISH_HOST";
pub const DEVBOX_IDE_PORT_RANGE: &str = "DEVBOX_IDE_PORT_RANGE";

// File Sync
pub const DEVBOX_SYNC_IGNORE: &str = "DEVBOX_SYNC_IGNORE";

// Timeouts
pub const DEVBOX_PROVISION_TIMEOUT_SECS: &str = "DEVBOX_PROVISION_TIMEOUT_SECS";
pub const DEVBOX_KILL_GRACE_SECS: &str = "DEVBOX_KILL_GRACE_SECS";

// Fly Machines Configuration
pub const FLY_API_TOKEN: &str = "FLY_API_TOKEN";
pub const FLY_APP_NAME: &str = "FLY_APP_NAME";
pub const FLY_API_URL: &str = "FLY_API_URL";
pub const FLY_REGION: &str = "FLY_REGION";
pub const FLY_POLL_ATTEMPTS: &str = "FLY_POLL_ATTEMPTS";
pub const FLY_POLL_INTERVAL_MS: &str = "FLY_POLL_INTERVAL_MS";

// Logging
pub const RUST_LOG: &str = "RUST_LOG";

// System Environment Variables
pub const HOME: &str = "HOME";
