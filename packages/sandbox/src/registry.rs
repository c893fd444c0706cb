// ABOUTME: Process-wide map of sandbox handles keyed by project id
// ABOUTME: Serializes create and destroy per project so each project gets one sandbox

use crate::error::{Result, SandboxError};
use crate::types::{ProviderKind, SandboxHandle, SandboxStatus, SharedHandle};
use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;
use tokio::sync::{Mutex, OwnedMutexGuard, RwLock};
use tracing::{debug, info, warn};

#[derive(Default)]
struct Failure {
    generation: u64,
    error: Option<SandboxError>,
}

/// Per-project serialization point
#[derive(Default)]
struct Slot {
    gate: Arc<Mutex<()>>,
    failure: Mutex<Failure>,
}

#[derive(Default)]
pub struct SandboxRegistry {
    entries: RwLock<HashMap<String, SharedHandle>>,
    // Slots outlive their entries so late waiters still see the last failure
    slots: Mutex<HashMap<String, Arc<Slot>>>,
}

/// Exclusive access to one project's registry entry.
///
/// Held across create and destroy so they never interleave for the same project.
pub struct ProjectGuard<'a> {
    registry: &'a SandboxRegistry,
    project_id: String,
    _gate: OwnedMutexGuard<()>,
}

impl ProjectGuard<'_> {
    pub fn project_id(&self) -> &str {
        &self.project_id
    }

    pub async fn get(&self) -> Option<SharedHandle> {
        self.registry.get(&self.project_id).await
    }

    /// Register a handle for a resource found on the backend, unless one is already tracked.
    pub async fn adopt(&self, handle: SandboxHandle) -> SharedHandle {
        let mut entries = self.registry.entries.write().await;
        entries
            .entry(self.project_id.clone())
            .or_insert_with(|| {
                info!(project_id = %self.project_id, "Adopted sandbox into registry");
                Arc::new(RwLock::new(handle))
            })
            .clone()
    }

    /// Drop the entry; absent entries are fine.
    pub async fn evict(&self) -> Option<SharedHandle> {
        let removed = self.registry.entries.write().await.remove(&self.project_id);
        if removed.is_some() {
            debug!(project_id = %self.project_id, "Evicted sandbox from registry");
        }
        removed
    }
}

impl SandboxRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    async fn slot(&self, project_id: &str) -> Arc<Slot> {
        self.slots
            .lock()
            .await
            .entry(project_id.to_string())
            .or_default()
            .clone()
    }

    pub async fn lock(&self, project_id: &str) -> ProjectGuard<'_> {
        let slot = self.slot(project_id).await;
        let gate = slot.gate.clone().lock_owned().await;
        ProjectGuard {
            registry: self,
            project_id: project_id.to_string(),
            _gate: gate,
        }
    }

    pub async fn get(&self, project_id: &str) -> Option<SharedHandle> {
        self.entries.read().await.get(project_id).cloned()
    }

    /// Remove a project's handle. Removing an unknown project is a no-op.
    pub async fn remove(&self, project_id: &str) -> Option<SharedHandle> {
        self.lock(project_id).await.evict().await
    }

    pub async fn list(&self) -> Vec<SharedHandle> {
        self.entries.read().await.values().cloned().collect()
    }

    pub async fn len(&self) -> usize {
        self.entries.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.entries.read().await.is_empty()
    }

    /// Return the project's running handle, or provision one.
    ///
    /// Concurrent callers for the same project share one `provision` call:
    /// they wait for it and then receive the same handle or the same error.
    /// `provision` must leave the handle `Running` when it returns `Ok`; on
    /// error the handle is kept as `Unreachable` so the caller can retry.
    pub async fn get_or_create<F, Fut>(
        &self,
        project_id: &str,
        kind: ProviderKind,
        resource_name: &str,
        provision: F,
    ) -> Result<SharedHandle>
    where
        F: FnOnce(SharedHandle) -> Fut,
        Fut: Future<Output = Result<()>>,
    {
        let slot = self.slot(project_id).await;
        let seen = slot.failure.lock().await.generation;
        let _gate = slot.gate.clone().lock_owned().await;

        let existing = self.get(project_id).await;
        if let Some(handle) = &existing {
            let guard = handle.read().await;
            if guard.provider_kind() != kind {
                return Err(SandboxError::ProviderMismatch {
                    project_id: project_id.to_string(),
                    existing: guard.provider_kind().to_string(),
                    requested: kind.to_string(),
                });
            }
            if guard.is_running() {
                debug!(project_id = project_id, "Reusing running sandbox");
                return Ok(handle.clone());
            }
        }

        {
            // The creation we queued behind failed; report that failure
            let failure = slot.failure.lock().await;
            if failure.generation != seen {
                if let Some(error) = &failure.error {
                    return Err(error.clone());
                }
            }
        }

        let handle = match existing {
            Some(handle) => {
                {
                    let mut guard = handle.write().await;
                    if guard.status != SandboxStatus::Creating {
                        guard.transition(SandboxStatus::Creating)?;
                    }
                    guard.last_error = None;
                }
                handle
            }
            None => {
                let handle = Arc::new(RwLock::new(SandboxHandle::new(
                    project_id,
                    kind,
                    resource_name.to_string(),
                )));
                self.entries
                    .write()
                    .await
                    .insert(project_id.to_string(), handle.clone());
                handle
            }
        };

        match provision(handle.clone()).await {
            Ok(()) => Ok(handle),
            Err(error) => {
                warn!(project_id = project_id, error = %error, "Sandbox provisioning failed");
                {
                    let mut guard = handle.write().await;
                    if guard.status != SandboxStatus::Destroyed {
                        guard.status = SandboxStatus::Unreachable;
                    }
                    guard.last_error = Some(error.to_string());
                }
                let mut failure = slot.failure.lock().await;
                failure.generation += 1;
                failure.error = Some(error.clone());
                Err(error)
            }
        }
    }
}
