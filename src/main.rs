#![deny(clippy::mod_module_files)]
use std::path::PathBuf;

use anyhow::Result;
use clap::{Parser, Subcommand};
use tracing_subscriber::{filter::LevelFilter, EnvFilter};

mod commands;

use commands::GlobalOptions;

#[derive(Parser, Debug)]
#[command(
    name = "git-docsync",
    version,
    about = "Sync a local document tree with a git-hosted repository"
)]
struct Cli {
    /// Config file (default: ~/.config/git-docsync/config.yaml)
    #[arg(long, global = true)]
    config: Option<PathBuf>,
    /// Run against an empty in-memory repository instead of the remote
    #[arg(long, global = true)]
    offline: bool,
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Pull the tracked roots of the work branch
    Pull {
        /// Also export the pulled tree into this directory
        #[arg(long)]
        into: Option<PathBuf>,
    },
    /// Commit the tracked roots of DIR to the work branch
    Push {
        dir: PathBuf,
        /// Honor the minimum interval between commits
        #[arg(long)]
        respect_interval: bool,
    },
    /// Merge the work branch into the main branch
    Deploy,
    /// Show configuration and cache state
    Status,
}

fn init_tracing() {
    let filter = EnvFilter::builder()
        .with_default_directive(LevelFilter::INFO.into())
        .from_env_lossy();
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();
}

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing();
    let cli = Cli::parse();
    let options = GlobalOptions {
        config: cli.config,
        offline: cli.offline,
    };

    match cli.command {
        Command::Pull { into } => commands::pull::handle(&options, into.as_deref()).await,
        Command::Push {
            dir,
            respect_interval,
        } => commands::push::handle(&options, &dir, respect_interval).await,
        Command::Deploy => commands::deploy::handle(&options).await,
        Command::Status => commands::status::handle(&options),
    }
}
