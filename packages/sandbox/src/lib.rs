// ABOUTME: Per-project sandbox provisioning and IDE session orchestration
// ABOUTME: One provider contract over local Docker containers and remote Fly machines

pub mod backends;
pub mod error;
pub mod executor;
pub mod factory;
pub mod ide;
pub mod provider;
pub mod registry;
pub mod retry;
pub mod settings;
pub mod sync;
pub mod types;

pub use backends::{
    DockerBackend, ExecConcurrency, ExecRequest, ExecSink, ExecStream, FlyioBackend,
    OutputChunk, ProvisionSpec, ResourceInfo, SandboxBackend, StreamType,
};
pub use error::{Result, SandboxError};
pub use executor::CommandExecutor;
pub use factory::ProviderFactory;
pub use ide::IdeSessionManager;
pub use provider::SandboxProvider;
pub use registry::{ProjectGuard, SandboxRegistry};
pub use retry::{poll_until, RetryError, RetryPolicy};
pub use settings::{EditorProfile, FlySettings, PortRange, SandboxSettings, SettingsError};
pub use sync::FileSyncEngine;
pub use types::{
    CommandOutput, CommandStatus, CreateSandboxOptions, IdeServerInfo, IdeSession,
    IdeSessionStatus, ProviderKind, ResourceUsage, SandboxHandle, SandboxInfo, SandboxStatus,
    SharedHandle, SyncReport, TIMEOUT_EXIT_CODE,
};
