//! tfworkspace - ephemeral Terraform workspaces over HTTP.
//!
//! Usage:
//!   tfworkspace serve [--listen-addr 0.0.0.0:5000]   # Start HTTP server
//!   tfworkspace run <dir> <verb>                     # Run one verb locally

use std::io::Write;
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use futures_util::StreamExt;
use tracing_subscriber::EnvFilter;

use tfworkspace::config::ServeConfig;
use tfworkspace::deleter::RobustDeleter;
use tfworkspace::http_server;
use tfworkspace::orchestrator::{Orchestrator, Toolchain, Verb};
use tfworkspace::state::{AppState, SessionToken, SystemClock, WorkspaceStore};
use tfworkspace::variables::HclParser;
use tfworkspace::Workspaces;

#[derive(Parser, Debug)]
#[command(name = "tfworkspace")]
#[command(about = "Ephemeral Terraform workspaces with streamed command output")]
struct Args {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Start the HTTP server
    Serve(ServeConfig),

    /// Run a single verb in an existing directory, printing its output
    Run {
        /// Terraform project directory
        dir: PathBuf,

        /// One of init, plan, apply, plan-destroy, destroy
        verb: String,

        /// Provisioning binary to invoke
        #[arg(long, env = "TERRAFORM_BIN", default_value = "terraform")]
        terraform_bin: String,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_writer(std::io::stderr)
        .init();

    let args = Args::parse();

    match args.command {
        Commands::Serve(config) => serve(config).await,
        Commands::Run {
            dir,
            verb,
            terraform_bin,
        } => run_local(dir, &verb, terraform_bin).await,
    }
}

async fn serve(config: ServeConfig) -> Result<()> {
    std::fs::create_dir_all(&config.upload_folder).with_context(|| {
        format!(
            "failed to create upload folder {}",
            config.upload_folder.display()
        )
    })?;

    let store = WorkspaceStore::new(&config.upload_folder, Arc::new(SystemClock))
        .context("failed to resolve upload folder")?;
    tracing::info!(
        root = %store.root().display(),
        cleanup_interval = config.cleanup_interval,
        inactivity_timeout = config.inactivity_timeout,
        "configuration loaded",
    );

    let workspaces = Workspaces::new(
        store,
        Arc::new(RobustDeleter::new(config.retry_policy())),
        Orchestrator::new(config.toolchain()),
        Arc::new(HclParser),
    );

    http_server::run_server(&config, AppState::new(workspaces)).await
}

async fn run_local(dir: PathBuf, verb: &str, terraform_bin: String) -> Result<()> {
    let verb: Verb = verb.parse()?;
    let dir = std::fs::canonicalize(&dir)
        .with_context(|| format!("no such directory: {}", dir.display()))?;

    let orchestrator = Orchestrator::new(Toolchain::new(terraform_bin));
    let mut output = orchestrator.run(SessionToken::generate(), dir, verb);

    let mut stdout = std::io::stdout().lock();
    while let Some(line) = output.next().await {
        stdout.write_all(line.as_bytes())?;
        stdout.flush()?;
    }
    Ok(())
}
