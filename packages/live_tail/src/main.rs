use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use tracing::info;
use tracing_subscriber::prelude::*;

use live_telemetry::config::Settings;

mod cli;

#[derive(Parser)]
#[command(name = "livetail")]
#[command(about = "Follow live run telemetry from a terminal")]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Directory holding livetail.toml (defaults to the user config dir)
    #[arg(long, global = true)]
    config_dir: Option<PathBuf>,

    /// Enable debug logging
    #[arg(short, long, global = true)]
    debug: bool,
}

#[derive(Subcommand)]
enum Commands {
    /// Subscribe to channels on the multiplexed connection and print frames
    Watch(cli::watch::WatchArgs),

    /// Follow the domain event feed
    Events(cli::events::EventsArgs),

    /// Tail a run's log
    Logs(cli::logs::LogsArgs),

    /// Follow an execution until it completes
    Exec(cli::exec::ExecArgs),

    /// Print the resolved configuration
    Config,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let default_directive = if cli.debug {
        "livetail=debug,live_telemetry=debug,info"
    } else {
        "livetail=info,live_telemetry=info,warn"
    };
    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(default_directive));
    tracing_subscriber::registry()
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .with(env_filter)
        .init();

    let config_dir = cli.config_dir.clone().unwrap_or_else(default_config_dir);
    let settings = Settings::load(&config_dir)
        .with_context(|| format!("Failed to load config from {}", config_dir.display()))?;
    info!(config_dir = %config_dir.display(), base_url = settings.endpoints.base_url(), "livetail starting");

    match cli.command {
        Commands::Watch(args) => cli::watch::run(&settings, args).await,
        Commands::Events(args) => cli::events::run(&settings, args).await,
        Commands::Logs(args) => cli::logs::run(&settings, args).await,
        Commands::Exec(args) => cli::exec::run(&settings, args).await,
        Commands::Config => cli::print_config(&config_dir),
    }
}

fn default_config_dir() -> PathBuf {
    dirs::config_dir()
        .map(|d| d.join("livetail"))
        .unwrap_or_else(|| PathBuf::from("."))
}
