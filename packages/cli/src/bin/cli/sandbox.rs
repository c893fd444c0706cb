// ABOUTME: CLI commands for the sandbox lifecycle (create, status, exec, sync, destroy, list)
// ABOUTME: Thin wrappers over SandboxProvider that print human-readable results

use super::connect;
use anyhow::{bail, Context, Result};
use clap::Subcommand;
use colored::*;
use comfy_table::{modifiers::UTF8_ROUND_CORNERS, presets::UTF8_FULL, ContentArrangement, Table};
use devbox_sandbox::{CreateSandboxOptions, ProviderFactory, SandboxStatus};
use std::collections::HashMap;
use std::path::PathBuf;
use std::time::Duration;

#[derive(Subcommand)]
pub enum SandboxCommands {
    /// Provision (or reuse) the sandbox for a project
    Create {
        project_id: String,

        /// Image to run instead of the configured default
        #[arg(long)]
        image: Option<String>,

        /// CPU cores to allot
        #[arg(long)]
        cpus: Option<f64>,

        /// Memory limit in MB
        #[arg(long)]
        memory_mb: Option<u64>,

        /// Environment variable for the sandbox (KEY=VALUE, repeatable)
        #[arg(long = "env", value_parser = parse_env_var)]
        env_vars: Vec<(String, String)>,
    },

    /// Report whether a project's sandbox is running
    Status { project_id: String },

    /// Show backend details for a project's sandbox as JSON
    Info { project_id: String },

    /// Run a shell command inside a project's sandbox
    Exec {
        project_id: String,

        /// Seconds before the command is killed
        #[arg(long, default_value = "60")]
        timeout: u64,

        /// Command line, passed to `sh -c`
        #[arg(trailing_var_arg = true, required = true)]
        command: Vec<String>,
    },

    /// Copy local files or directories into the sandbox workspace
    Sync {
        project_id: String,

        #[arg(required = true)]
        paths: Vec<PathBuf>,
    },

    /// Destroy a project's sandbox
    Destroy { project_id: String },

    /// List tracked sandboxes
    List {
        /// Only show sandboxes idle for at least this many minutes
        #[arg(long)]
        idle_mins: Option<u64>,
    },
}

fn parse_env_var(value: &str) -> Result<(String, String), String> {
    match value.split_once('=') {
        Some((key, val)) if !key.is_empty() => Ok((key.to_string(), val.to_string())),
        _ => Err(format!("expected KEY=VALUE, got '{}'", value)),
    }
}

pub fn kinds_command() {
    for kind in ProviderFactory::list_available_kinds() {
        println!("{}", kind);
    }
}

impl SandboxCommands {
    /// Run the command; the returned value is the process exit code.
    pub async fn execute(self, provider_kind: Option<&str>) -> Result<i32> {
        let provider = connect(provider_kind).await?;

        match self {
            SandboxCommands::Create {
                project_id,
                image,
                cpus,
                memory_mb,
                env_vars,
            } => {
                let options = CreateSandboxOptions {
                    image,
                    cpu_cores: cpus,
                    memory_mb,
                    env_vars: env_vars.into_iter().collect::<HashMap<_, _>>(),
                };
                let handle = provider.create_sandbox(&project_id, options).await?;
                let handle = handle.read().await;
                println!(
                    "{} {} ({} on {})",
                    "✓".green().bold(),
                    project_id.cyan(),
                    handle.backend_ref.as_deref().unwrap_or("-"),
                    provider.kind()
                );
                Ok(0)
            }
            SandboxCommands::Status { project_id } => {
                if provider.is_sandbox_active(&project_id).await? {
                    println!("{} {}", project_id.cyan(), "running".green());
                    Ok(0)
                } else {
                    println!("{} {}", project_id.cyan(), "not running".yellow());
                    Ok(1)
                }
            }
            SandboxCommands::Info { project_id } => {
                match provider.get_sandbox_info(&project_id).await? {
                    Some(info) => {
                        println!("{}", serde_json::to_string_pretty(&info)?);
                        Ok(0)
                    }
                    None => bail!("no sandbox for project '{}'", project_id),
                }
            }
            SandboxCommands::Exec {
                project_id,
                timeout,
                command,
            } => {
                let command = command.join(" ");
                let output = provider
                    .execute_command(&project_id, &command, Duration::from_secs(timeout))
                    .await?;

                print!("{}", output.stdout);
                eprint!("{}", output.stderr);
                if output.timed_out() {
                    eprintln!(
                        "{}",
                        format!("Command timed out after {}s", timeout).yellow()
                    );
                }
                Ok(i32::try_from(output.exit_code).unwrap_or(1))
            }
            SandboxCommands::Sync { project_id, paths } => {
                let report = provider
                    .sync_files_to_vm(&project_id, &paths)
                    .await
                    .with_context(|| format!("Failed to sync files into '{}'", project_id))?;
                println!(
                    "{} {} files ({} bytes), {} skipped",
                    "✓".green().bold(),
                    report.files,
                    report.bytes,
                    report.skipped
                );
                Ok(0)
            }
            SandboxCommands::Destroy { project_id } => {
                if provider.destroy_sandbox(&project_id).await? {
                    println!("{} destroyed {}", "✓".green().bold(), project_id.cyan());
                } else {
                    println!("{}", format!("No sandbox for '{}'", project_id).yellow());
                }
                Ok(0)
            }
            SandboxCommands::List { idle_mins } => {
                let idle = match idle_mins {
                    Some(mins) => Some(
                        provider
                            .idle_sandboxes(Duration::from_secs(mins * 60))
                            .await,
                    ),
                    None => None,
                };

                let sandboxes: Vec<_> = provider
                    .list_sandboxes()
                    .await
                    .into_iter()
                    .filter(|h| {
                        idle.as_ref()
                            .map_or(true, |ids| ids.iter().any(|id| id == h.project_id()))
                    })
                    .collect();

                if sandboxes.is_empty() {
                    println!("{}", "No sandboxes found".yellow());
                    return Ok(0);
                }

                let mut table = Table::new();
                table
                    .load_preset(UTF8_FULL)
                    .apply_modifier(UTF8_ROUND_CORNERS)
                    .set_content_arrangement(ContentArrangement::Dynamic);
                table.set_header(vec!["Project", "Status", "Resource", "IDE ports", "Last seen"]);

                for handle in &sandboxes {
                    let status = match handle.status {
                        SandboxStatus::Running => "running".green().to_string(),
                        SandboxStatus::Unreachable => "unreachable".red().to_string(),
                        other => other.as_str().to_string(),
                    };
                    let ports: Vec<String> = handle
                        .ide_sessions
                        .values()
                        .filter(|s| s.status.holds_port())
                        .map(|s| format!("{} ({})", s.port, s.editor_kind))
                        .collect();

                    table.add_row(vec![
                        handle.project_id().to_string(),
                        status,
                        handle.resource_name.clone(),
                        if ports.is_empty() { "-".to_string() } else { ports.join(", ") },
                        handle.last_seen_at.format("%Y-%m-%d %H:%M:%S").to_string(),
                    ]);
                }

                println!("{}", table);
                println!("Total: {} sandboxes", sandboxes.len().to_string().cyan());
                Ok(0)
            }
        }
    }
}
