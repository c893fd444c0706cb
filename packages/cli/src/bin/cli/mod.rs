// ABOUTME: Subcommand modules for the devbox CLI and the provider bootstrap they share
// ABOUTME: Every command resolves a provider and adopts sandboxes left by earlier runs

pub mod ide;
pub mod sandbox;

use anyhow::{Context, Result};
use devbox_sandbox::{ProviderFactory, SandboxProvider};
use std::sync::Arc;
use tracing::warn;

/// Resolve the provider for `kind` and pick up sandboxes that are already running.
pub async fn connect(kind: Option<&str>) -> Result<Arc<SandboxProvider>> {
    let factory = ProviderFactory::from_env().context("Invalid devbox configuration")?;
    let provider = factory.create(kind).await?;

    if let Err(e) = provider.recover().await {
        warn!(provider = %provider.kind(), error = %e, "Could not list existing sandboxes");
    }
    Ok(provider)
}
