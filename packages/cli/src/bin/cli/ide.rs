// ABOUTME: CLI commands for editor sessions inside a sandbox (start, status, stop)
// ABOUTME: Session state lives in the provider, so status only covers sessions started by this run

use super::connect;
use anyhow::Result;
use clap::Subcommand;
use colored::*;
use devbox_sandbox::IdeSessionStatus;

#[derive(Subcommand)]
pub enum IdeCommands {
    /// Start an editor server and wait until it answers
    Start {
        project_id: String,

        /// Editor profile to launch
        #[arg(long, default_value = "vscode")]
        editor: String,

        /// Port inside the sandbox (default: first free port in the IDE range)
        #[arg(long)]
        port: Option<u16>,
    },

    /// Show the state of an editor session
    Status {
        project_id: String,

        #[arg(long)]
        port: Option<u16>,
    },

    /// Stop one editor session, or all of them
    Stop {
        project_id: String,

        #[arg(long)]
        port: Option<u16>,
    },
}

fn paint(status: IdeSessionStatus) -> ColoredString {
    match status {
        IdeSessionStatus::Running => status.as_str().green(),
        IdeSessionStatus::Starting => status.as_str().yellow(),
        IdeSessionStatus::Failed => status.as_str().red(),
        IdeSessionStatus::Stopped => status.as_str().dimmed(),
    }
}

impl IdeCommands {
    pub async fn execute(self, provider_kind: Option<&str>) -> Result<i32> {
        let provider = connect(provider_kind).await?;

        match self {
            IdeCommands::Start {
                project_id,
                editor,
                port,
            } => {
                let info = provider.setup_ide_server(&project_id, &editor, port).await?;
                println!(
                    "{} {} on port {} ({})",
                    "✓".green().bold(),
                    info.editor_kind.cyan(),
                    info.port,
                    paint(info.status)
                );
                if let Some(url) = info.url {
                    println!("  {}", url.underline());
                }
                Ok(0)
            }
            IdeCommands::Status { project_id, port } => {
                let status = provider.get_ide_status(&project_id, port).await;
                println!("{} {}", project_id.cyan(), paint(status));
                Ok(if status == IdeSessionStatus::Running { 0 } else { 1 })
            }
            IdeCommands::Stop { project_id, port } => {
                if provider.stop_ide_server(&project_id, port).await? {
                    println!("{} stopped", "✓".green().bold());
                } else {
                    println!("{}", "No running editor session".yellow());
                }
                Ok(0)
            }
        }
    }
}
