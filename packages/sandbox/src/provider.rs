// ABOUTME: Sandbox provider composing a backend with the registry, executor, file sync and IDE manager
// ABOUTME: Exposes the per-project lifecycle and reconciles cached state with the backend

use crate::backends::{ProvisionSpec, ResourceInfo, SandboxBackend};
use crate::error::{Result, SandboxError};
use crate::executor::CommandExecutor;
use crate::ide::IdeSessionManager;
use crate::registry::{ProjectGuard, SandboxRegistry};
use crate::settings::SandboxSettings;
use crate::sync::FileSyncEngine;
use crate::types::{
    CommandOutput, CreateSandboxOptions, IdeServerInfo, IdeSessionStatus, ProviderKind,
    SandboxHandle, SandboxInfo, SandboxStatus, SharedHandle, SyncReport,
};
use chrono::Utc;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

pub struct SandboxProvider {
    kind: ProviderKind,
    backend: Arc<dyn SandboxBackend>,
    registry: Arc<SandboxRegistry>,
    executor: Arc<CommandExecutor>,
    files: FileSyncEngine,
    ide: IdeSessionManager,
    settings: Arc<SandboxSettings>,
}

impl SandboxProvider {
    pub fn new(
        backend: Arc<dyn SandboxBackend>,
        registry: Arc<SandboxRegistry>,
        settings: Arc<SandboxSettings>,
    ) -> Self {
        let executor = Arc::new(CommandExecutor::new(backend.clone(), &settings));
        Self {
            kind: backend.kind(),
            files: FileSyncEngine::new(backend.clone(), &settings),
            ide: IdeSessionManager::new(executor.clone(), backend.clone(), &settings),
            executor,
            backend,
            registry,
            settings,
        }
    }

    pub fn kind(&self) -> ProviderKind {
        self.kind
    }

    pub fn registry(&self) -> &Arc<SandboxRegistry> {
        &self.registry
    }

    /// Check that the daemon or API answers.
    pub async fn ping(&self) -> Result<()> {
        self.backend.ping().await
    }

    fn validate_project_id(project_id: &str) -> Result<()> {
        let valid = !project_id.is_empty()
            && project_id.len() <= 128
            && project_id
                .chars()
                .next()
                .is_some_and(|c| c.is_ascii_alphanumeric())
            && project_id
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.'));
        if valid {
            Ok(())
        } else {
            Err(SandboxError::Configuration(format!(
                "invalid project id '{}': use letters, digits, '-', '_' or '.'",
                project_id
            )))
        }
    }

    fn provision_spec(&self, project_id: &str, options: CreateSandboxOptions) -> ProvisionSpec {
        ProvisionSpec {
            project_id: project_id.to_string(),
            resource_name: self.settings.resource_name(project_id),
            image: options.image.unwrap_or_else(|| self.settings.image.clone()),
            cpu_cores: options.cpu_cores.unwrap_or(self.settings.cpu_cores),
            memory_mb: options.memory_mb.unwrap_or(self.settings.memory_mb),
            pids_limit: self.settings.pids_limit,
            env_vars: options.env_vars,
            host_workspace: self.settings.host_workspace(project_id),
            workspace_mount: self.settings.workspace_mount.clone(),
            ide_ports: self.settings.ide_ports,
            keepalive_command: self.settings.keepalive_command.clone(),
        }
    }

    /// Handle tracked for this project by this provider's kind.
    async fn tracked(&self, project_id: &str) -> Result<Option<SharedHandle>> {
        let Some(handle) = self.registry.get(project_id).await else {
            return Ok(None);
        };
        let existing = handle.read().await.provider_kind();
        if existing != self.kind {
            return Err(SandboxError::ProviderMismatch {
                project_id: project_id.to_string(),
                existing: existing.to_string(),
                requested: self.kind.to_string(),
            });
        }
        Ok(Some(handle))
    }

    async fn live_handle(&self, project_id: &str) -> Result<SharedHandle> {
        self.tracked(project_id)
            .await?
            .ok_or_else(|| SandboxError::SandboxNotFound(project_id.to_string()))
    }

    /// Provision (or adopt) the project's sandbox and return its handle.
    ///
    /// Returns the existing handle when the sandbox is already running.
    pub async fn create_sandbox(
        &self,
        project_id: &str,
        options: CreateSandboxOptions,
    ) -> Result<SharedHandle> {
        Self::validate_project_id(project_id)?;

        {
            let guard = self.registry.lock(project_id).await;
            if let Some(handle) = guard.get().await {
                if handle.read().await.provider_kind() == self.kind {
                    self.reconcile_locked(&guard, Some(handle)).await?;
                }
            }
        }

        let spec = self.provision_spec(project_id, options);
        let resource_name = spec.resource_name.clone();
        let backend = self.backend.clone();
        let timeout = self.settings.provision_timeout;

        let handle = self
            .registry
            .get_or_create(project_id, self.kind, &resource_name, |handle| async move {
                info!(project_id = %spec.project_id, provider = %backend.kind(), "Provisioning sandbox");
                let resource = tokio::time::timeout(timeout, backend.provision(&spec))
                    .await
                    .map_err(|_| SandboxError::ProvisioningTimeout {
                        project_id: spec.project_id.clone(),
                        attempts: 1,
                    })??;

                let mut guard = handle.write().await;
                guard.backend_ref = Some(resource.backend_ref.clone());
                guard.transition(SandboxStatus::Running)?;
                guard.touch();
                info!(
                    project_id = %spec.project_id,
                    backend_ref = %resource.backend_ref,
                    "Sandbox running"
                );
                Ok(())
            })
            .await?;

        Ok(handle)
    }

    pub async fn get_sandbox(&self, project_id: &str) -> Result<Option<SharedHandle>> {
        self.tracked(project_id).await
    }

    /// Bring the cached handle in line with what the backend reports.
    ///
    /// Returns the backend's view of the resource, `None` when it does not exist.
    async fn reconcile_locked(
        &self,
        guard: &ProjectGuard<'_>,
        handle: Option<SharedHandle>,
    ) -> Result<Option<ResourceInfo>> {
        let project_id = guard.project_id();
        let resource = self
            .backend
            .inspect(&self.settings.resource_name(project_id))
            .await?;

        let never_provisioned = match &handle {
            Some(handle) => handle.read().await.backend_ref.is_none(),
            None => false,
        };

        match (handle, &resource) {
            (Some(handle), Some(found)) => {
                let mut h = handle.write().await;
                if found.running {
                    if h.status != SandboxStatus::Running {
                        info!(project_id = project_id, backend_ref = %found.backend_ref, "Sandbox found running again");
                        h.transition(SandboxStatus::Running)?;
                    }
                    h.backend_ref = Some(found.backend_ref.clone());
                    h.touch();
                } else if h.status == SandboxStatus::Running {
                    warn!(project_id = project_id, state = %found.state, "Sandbox stopped outside of devbox");
                    h.transition(SandboxStatus::Stopped)?;
                    stop_sessions(&mut h);
                }
            }
            (Some(_), None) if never_provisioned => {
                // Failed or timed-out create; kept for the retry
                debug!(project_id = project_id, "Sandbox has no resource yet");
            }
            (Some(handle), None) => {
                warn!(project_id = project_id, "Sandbox resource vanished; evicting handle");
                {
                    let mut h = handle.write().await;
                    stop_sessions(&mut h);
                    h.transition(SandboxStatus::Destroyed)?;
                }
                if let Some(backend_ref) = handle.read().await.backend_ref.clone() {
                    self.executor.forget(&backend_ref).await;
                }
                guard.evict().await;
            }
            (None, Some(found)) if found.running => {
                let mut adopted =
                    SandboxHandle::new(project_id, self.kind, self.settings.resource_name(project_id));
                adopted.backend_ref = Some(found.backend_ref.clone());
                adopted.transition(SandboxStatus::Running)?;
                let adopted = guard.adopt(adopted).await;
                self.restore_sessions(&adopted, found).await;
            }
            (None, _) => {}
        }

        Ok(resource)
    }

    /// Pick up editors an earlier process left running in an adopted sandbox.
    async fn restore_sessions(&self, handle: &SharedHandle, resource: &ResourceInfo) {
        match self.ide.rediscover(handle, resource).await {
            Ok(ports) if !ports.is_empty() => {
                info!(backend_ref = %resource.backend_ref, ports = ?ports, "Restored IDE sessions");
            }
            Ok(_) => {}
            Err(e) => warn!(backend_ref = %resource.backend_ref, error = %e, "Could not look for running IDE sessions"),
        }
    }

    async fn reconcile(&self, project_id: &str) -> Result<Option<ResourceInfo>> {
        let guard = self.registry.lock(project_id).await;
        let handle = guard.get().await;
        if let Some(handle) = &handle {
            if handle.read().await.provider_kind() != self.kind {
                // Owned by another provider; report our backend without touching its handle
                return self
                    .backend
                    .inspect(&self.settings.resource_name(project_id))
                    .await;
            }
        }
        self.reconcile_locked(&guard, handle).await
    }

    /// Ask the backend whether the project's sandbox is running.
    ///
    /// Unknown and vanished sandboxes are `false`; an unreachable backend is an error.
    pub async fn is_sandbox_active(&self, project_id: &str) -> Result<bool> {
        Ok(self
            .reconcile(project_id)
            .await?
            .is_some_and(|resource| resource.running))
    }

    pub async fn get_sandbox_info(&self, project_id: &str) -> Result<Option<SandboxInfo>> {
        let Some(resource) = self.reconcile(project_id).await? else {
            return Ok(None);
        };

        let usage = if resource.running {
            match self.backend.usage(&resource.backend_ref).await {
                Ok(usage) => usage,
                Err(e) => {
                    debug!(project_id = project_id, error = %e, "Usage unavailable");
                    None
                }
            }
        } else {
            None
        };

        Ok(Some(SandboxInfo {
            project_id: resource
                .project_id
                .clone()
                .unwrap_or_else(|| project_id.to_string()),
            provider_kind: self.kind,
            backend_ref: resource.backend_ref,
            name: resource.name,
            state: resource.state,
            running: resource.running,
            ip_address: resource.ip_address,
            ports: resource.ports,
            created_at: resource.created_at,
            usage,
        }))
    }

    pub async fn execute_command(
        &self,
        project_id: &str,
        command: &str,
        timeout: Duration,
    ) -> Result<CommandOutput> {
        let handle = self.live_handle(project_id).await?;
        let backend_ref = handle.read().await.live_ref()?;

        let output = self.executor.run(&backend_ref, command, timeout).await?;
        handle.write().await.touch();
        Ok(output)
    }

    pub async fn sync_files_to_vm(
        &self,
        project_id: &str,
        local_paths: &[PathBuf],
    ) -> Result<SyncReport> {
        let handle = self.live_handle(project_id).await?;
        let backend_ref = handle.read().await.live_ref()?;

        let report = self.files.sync(&backend_ref, local_paths).await?;
        handle.write().await.touch();
        Ok(report)
    }

    pub async fn setup_ide_server(
        &self,
        project_id: &str,
        editor_kind: &str,
        requested_port: Option<u16>,
    ) -> Result<IdeServerInfo> {
        let handle = self.live_handle(project_id).await?;
        self.ide.setup(&handle, editor_kind, requested_port).await
    }

    /// State of an IDE session, checked against the backend and the editor itself.
    ///
    /// `Stopped` whenever the sandbox is gone, not running or cannot be reached.
    pub async fn get_ide_status(&self, project_id: &str, port: Option<u16>) -> IdeSessionStatus {
        match self.reconcile(project_id).await {
            Ok(Some(resource)) if resource.running => {}
            Ok(_) => return IdeSessionStatus::Stopped,
            Err(e) => {
                debug!(project_id = project_id, error = %e, "Backend unavailable; reporting IDE stopped");
                return IdeSessionStatus::Stopped;
            }
        }

        match self.tracked(project_id).await {
            Ok(Some(handle)) => {
                self.ide.check_liveness(&handle, port).await;
                self.ide.status(&handle, port).await
            }
            _ => IdeSessionStatus::Stopped,
        }
    }

    pub async fn is_ide_running(&self, project_id: &str, port: Option<u16>) -> bool {
        self.get_ide_status(project_id, port).await == IdeSessionStatus::Running
    }

    pub async fn stop_ide_server(&self, project_id: &str, port: Option<u16>) -> Result<bool> {
        match self.tracked(project_id).await? {
            Some(handle) => self.ide.stop(&handle, port).await,
            None => Ok(false),
        }
    }

    /// Tear the sandbox down and forget it.
    ///
    /// `false` when there was nothing to destroy; never fails because the target is already gone.
    pub async fn destroy_sandbox(&self, project_id: &str) -> Result<bool> {
        let guard = self.registry.lock(project_id).await;

        let Some(handle) = guard.get().await else {
            // Not tracked, but a resource may survive from an earlier process
            let resource_name = self.settings.resource_name(project_id);
            return match self.backend.inspect(&resource_name).await? {
                Some(orphan) => {
                    info!(project_id = project_id, backend_ref = %orphan.backend_ref, "Removing untracked sandbox resource");
                    self.backend.remove(&orphan.backend_ref).await
                }
                None => Ok(false),
            };
        };

        let existing = handle.read().await.provider_kind();
        if existing != self.kind {
            return Err(SandboxError::ProviderMismatch {
                project_id: project_id.to_string(),
                existing: existing.to_string(),
                requested: self.kind.to_string(),
            });
        }

        if let Err(e) = self.ide.stop(&handle, None).await {
            warn!(project_id = project_id, error = %e, "Failed to stop IDE sessions before destroy");
        }

        let backend_ref = handle.read().await.backend_ref.clone();
        let removed = match &backend_ref {
            Some(backend_ref) => self.backend.remove(backend_ref).await?,
            None => match self
                .backend
                .inspect(&self.settings.resource_name(project_id))
                .await?
            {
                Some(resource) => self.backend.remove(&resource.backend_ref).await?,
                None => false,
            },
        };

        {
            let mut h = handle.write().await;
            stop_sessions(&mut h);
            h.transition(SandboxStatus::Destroyed)?;
        }
        if let Some(backend_ref) = &backend_ref {
            self.executor.forget(backend_ref).await;
        }
        guard.evict().await;

        info!(project_id = project_id, removed_resource = removed, "Sandbox destroyed");
        Ok(true)
    }

    /// Adopt running backend resources left by an earlier process.
    ///
    /// Returns the project ids that were added to the registry.
    pub async fn recover(&self) -> Result<Vec<String>> {
        let mut adopted = Vec::new();

        for resource in self.backend.list_managed().await? {
            let Some(project_id) = resource.project_id.clone() else {
                continue;
            };
            if !resource.running || resource.name != self.settings.resource_name(&project_id) {
                continue;
            }

            let guard = self.registry.lock(&project_id).await;
            if guard.get().await.is_some() {
                continue;
            }

            let mut handle =
                SandboxHandle::new(&project_id, self.kind, resource.name.clone());
            handle.backend_ref = Some(resource.backend_ref.clone());
            handle.transition(SandboxStatus::Running)?;
            if let Some(created_at) = resource.created_at {
                handle.created_at = created_at;
            }
            let handle = guard.adopt(handle).await;
            self.restore_sessions(&handle, &resource).await;
            adopted.push(project_id);
        }

        if !adopted.is_empty() {
            info!(count = adopted.len(), provider = %self.kind, "Recovered sandboxes");
        }
        Ok(adopted)
    }

    /// Snapshot of every sandbox this provider tracks.
    pub async fn list_sandboxes(&self) -> Vec<SandboxHandle> {
        let mut snapshots = Vec::new();
        for handle in self.registry.list().await {
            let h = handle.read().await;
            if h.provider_kind() == self.kind {
                snapshots.push(h.clone());
            }
        }
        snapshots.sort_by(|a, b| a.project_id().cmp(b.project_id()));
        snapshots
    }

    /// Project ids whose last successful operation is older than `max_idle`.
    pub async fn idle_sandboxes(&self, max_idle: Duration) -> Vec<String> {
        let max_idle = chrono::Duration::from_std(max_idle).unwrap_or(chrono::Duration::MAX);
        let now = Utc::now();
        self.list_sandboxes()
            .await
            .into_iter()
            .filter(|h| now.signed_duration_since(h.last_seen_at) > max_idle)
            .map(|h| h.project_id().to_string())
            .collect()
    }
}

fn stop_sessions(handle: &mut SandboxHandle) {
    for session in handle.ide_sessions.values_mut() {
        if session.status.holds_port() {
            session.status = IdeSessionStatus::Stopped;
            session.url = None;
        }
    }
}
