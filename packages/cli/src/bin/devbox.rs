// ABOUTME: Entry point for the devbox command line tool
// ABOUTME: Parses arguments, sets up logging and dispatches to sandbox and IDE commands

use clap::{Parser, Subcommand};
use colored::*;
use devbox_config::constants::RUST_LOG;
use std::process;
use tracing_subscriber::EnvFilter;

mod cli;

use cli::ide::IdeCommands;
use cli::sandbox::SandboxCommands;

#[derive(Parser)]
#[command(name = "devbox")]
#[command(about = "Per-project sandboxes with remote editors")]
#[command(version)]
struct Cli {
    /// Provider kind (docker or fly); defaults to VM_PROVIDER, then docker
    #[arg(long, global = true)]
    provider: Option<String>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// List the provider kinds this build supports
    Kinds,
    #[command(flatten)]
    Sandbox(SandboxCommands),
    /// Manage editor sessions inside a sandbox
    #[command(subcommand)]
    Ide(IdeCommands),
}

fn init_tracing() {
    let filter = EnvFilter::try_from_env(RUST_LOG).unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();
}

#[tokio::main]
async fn main() {
    dotenvy::dotenv().ok();
    init_tracing();

    let cli = Cli::parse();

    let result = match cli.command {
        Commands::Kinds => {
            cli::sandbox::kinds_command();
            Ok(0)
        }
        Commands::Sandbox(command) => command.execute(cli.provider.as_deref()).await,
        Commands::Ide(command) => command.execute(cli.provider.as_deref()).await,
    };

    match result {
        Ok(0) => {}
        Ok(code) => process::exit(code),
        Err(e) => {
            eprintln!("{} {:#}", "Error:".red().bold(), e);
            process::exit(1);
        }
    }
}
