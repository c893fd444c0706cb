// ABOUTME: Resolves a provider kind from an argument or settings and builds the provider
// ABOUTME: Memoizes one provider per kind; all providers share one registry

use crate::backends::{DockerBackend, FlyioBackend, SandboxBackend};
use crate::error::{Result, SandboxError};
use crate::provider::SandboxProvider;
use crate::registry::SandboxRegistry;
use crate::settings::SandboxSettings;
use crate::types::ProviderKind;
use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::info;

pub struct ProviderFactory {
    settings: Arc<SandboxSettings>,
    registry: Arc<SandboxRegistry>,
    providers: Mutex<HashMap<ProviderKind, Arc<SandboxProvider>>>,
    overrides: HashMap<ProviderKind, Arc<dyn SandboxBackend>>,
}

impl ProviderFactory {
    pub fn new(settings: SandboxSettings) -> Self {
        Self {
            settings: Arc::new(settings),
            registry: Arc::new(SandboxRegistry::new()),
            providers: Mutex::new(HashMap::new()),
            overrides: HashMap::new(),
        }
    }

    /// Factory configured from the process environment.
    pub fn from_env() -> Result<Self> {
        Ok(Self::new(SandboxSettings::from_env()?))
    }

    /// Serve `kind` from the given backend instead of constructing the real one.
    pub fn with_backend(mut self, kind: ProviderKind, backend: Arc<dyn SandboxBackend>) -> Self {
        self.overrides.insert(kind, backend);
        self
    }

    pub fn settings(&self) -> &SandboxSettings {
        &self.settings
    }

    pub fn registry(&self) -> &Arc<SandboxRegistry> {
        &self.registry
    }

    /// Identifiers accepted by [`ProviderFactory::create`].
    pub fn list_available_kinds() -> BTreeSet<&'static str> {
        ProviderKind::ALL.iter().map(|kind| kind.as_str()).collect()
    }

    /// Resolve `kind` (or the configured default) to a provider.
    ///
    /// Repeated calls for one kind return the same instance.
    pub async fn create(&self, kind: Option<&str>) -> Result<Arc<SandboxProvider>> {
        let requested = kind
            .map(str::to_string)
            .or_else(|| self.settings.provider.clone())
            .unwrap_or_else(|| ProviderKind::Docker.as_str().to_string());
        let kind = ProviderKind::parse(&requested)?;

        let mut providers = self.providers.lock().await;
        if let Some(provider) = providers.get(&kind) {
            return Ok(provider.clone());
        }

        let backend = self.backend_for(kind)?;
        if backend.kind() != kind {
            return Err(SandboxError::Configuration(format!(
                "backend for {} reports kind {}",
                kind,
                backend.kind()
            )));
        }

        info!(provider = %kind, "Initialized sandbox provider");
        let provider = Arc::new(SandboxProvider::new(
            backend,
            self.registry.clone(),
            self.settings.clone(),
        ));
        providers.insert(kind, provider.clone());
        Ok(provider)
    }

    fn backend_for(&self, kind: ProviderKind) -> Result<Arc<dyn SandboxBackend>> {
        if let Some(backend) = self.overrides.get(&kind) {
            return Ok(backend.clone());
        }
        Ok(match kind {
            ProviderKind::Docker => Arc::new(DockerBackend::new(&self.settings)?),
            ProviderKind::Fly => Arc::new(FlyioBackend::new(&self.settings)?),
        })
    }
}
