// ABOUTME: Copies local file trees into a sandbox workspace as a tar archive
// ABOUTME: One-directional and additive; ignored paths are skipped, nothing is deleted remotely

use crate::backends::SandboxBackend;
use crate::error::{Result, SandboxError};
use crate::settings::SandboxSettings;
use crate::types::SyncReport;
use std::path::{Component, Path, PathBuf};
use std::sync::Arc;
use tracing::{debug, info};
use walkdir::WalkDir;

pub struct FileSyncEngine {
    backend: Arc<dyn SandboxBackend>,
    workspace_mount: String,
    ignore: Vec<String>,
}

impl FileSyncEngine {
    pub fn new(backend: Arc<dyn SandboxBackend>, settings: &SandboxSettings) -> Self {
        Self {
            backend,
            workspace_mount: settings.workspace_mount.clone(),
            ignore: settings.sync_ignore.clone(),
        }
    }

    /// Upload `local_paths` into the workspace of the resource behind `backend_ref`.
    ///
    /// A directory's contents land directly under the workspace; a single file
    /// keeps its file name.
    pub async fn sync(&self, backend_ref: &str, local_paths: &[PathBuf]) -> Result<SyncReport> {
        let paths = local_paths.to_vec();
        let ignore = self.ignore.clone();
        let (archive, report) = tokio::task::spawn_blocking(move || pack(&paths, &ignore))
            .await
            .map_err(|e| SandboxError::FileSync(format!("packing task failed: {}", e)))??;

        if report.files == 0 {
            debug!(backend_ref = backend_ref, skipped = report.skipped, "Nothing to sync");
            return Ok(report);
        }

        self.backend
            .upload_archive(backend_ref, &self.workspace_mount, archive)
            .await?;

        info!(
            backend_ref = backend_ref,
            files = report.files,
            bytes = report.bytes,
            skipped = report.skipped,
            "Synced files into sandbox"
        );
        Ok(report)
    }
}

/// A path is ignored when any component equals a pattern, or a `*.ext` pattern matches its name.
fn is_ignored(relative: &Path, ignore: &[String]) -> bool {
    relative.components().any(|component| {
        let Component::Normal(name) = component else {
            return false;
        };
        let name = name.to_string_lossy();
        ignore.iter().any(|pattern| match pattern.strip_prefix('*') {
            Some(suffix) => name.ends_with(suffix),
            None => name == pattern.as_str(),
        })
    })
}

fn pack(local_paths: &[PathBuf], ignore: &[String]) -> Result<(Vec<u8>, SyncReport)> {
    let mut builder = tar::Builder::new(Vec::new());
    builder.mode(tar::HeaderMode::Complete);
    let mut report = SyncReport::default();

    for root in local_paths {
        let metadata = std::fs::metadata(root).map_err(|e| {
            SandboxError::FileSync(format!("cannot read {}: {}", root.display(), e))
        })?;

        if metadata.is_file() {
            let name = root.file_name().map(PathBuf::from).ok_or_else(|| {
                SandboxError::FileSync(format!("invalid file name: {}", root.display()))
            })?;
            if is_ignored(&name, ignore) {
                report.skipped += 1;
                continue;
            }
            append_file(&mut builder, root, &name)?;
            report.files += 1;
            report.bytes += metadata.len();
            continue;
        }

        let mut walker = WalkDir::new(root).min_depth(1).follow_links(false).into_iter();
        while let Some(entry) = walker.next() {
            let entry = entry.map_err(|e| SandboxError::FileSync(e.to_string()))?;
            let relative = entry
                .path()
                .strip_prefix(root)
                .map_err(|e| SandboxError::FileSync(e.to_string()))?
                .to_path_buf();

            if is_ignored(&relative, ignore) {
                report.skipped += 1;
                if entry.file_type().is_dir() {
                    walker.skip_current_dir();
                }
                continue;
            }

            if entry.file_type().is_dir() {
                builder
                    .append_dir(&relative, entry.path())
                    .map_err(|e| SandboxError::FileSync(e.to_string()))?;
            } else if entry.file_type().is_file() {
                append_file(&mut builder, entry.path(), &relative)?;
                report.files += 1;
                report.bytes += entry
                    .metadata()
                    .map_err(|e| SandboxError::FileSync(e.to_string()))?
                    .len();
            } else {
                // Symlinks and special files are not carried over
                report.skipped += 1;
            }
        }
    }

    let archive = builder
        .into_inner()
        .map_err(|e| SandboxError::FileSync(e.to_string()))?;
    Ok((archive, report))
}

fn append_file(builder: &mut tar::Builder<Vec<u8>>, source: &Path, name: &Path) -> Result<()> {
    let mut file = std::fs::File::open(source)
        .map_err(|e| SandboxError::FileSync(format!("cannot open {}: {}", source.display(), e)))?;
    builder
        .append_file(name, &mut file)
        .map_err(|e| SandboxError::FileSync(format!("cannot pack {}: {}", source.display(), e)))
}
