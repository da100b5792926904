pub mod events;
pub mod exec;
pub mod logs;
pub mod watch;

use std::path::Path;

use anyhow::{Context, Result};
use tracing::{debug, info};

use live_telemetry::cache::{CacheInvalidator, CacheKey};
use live_telemetry::config::{FileConfig, load_config};
use live_telemetry::metrics::StreamMetrics;
use live_telemetry::visibility::VisibilityGate;

/// Shared HTTP client for push feeds and log polling.
pub fn http_client() -> Result<reqwest::Client> {
    reqwest::Client::builder()
        .user_agent(concat!("livetail/", env!("CARGO_PKG_VERSION")))
        .build()
        .context("Failed to build HTTP client")
}

/// The terminal has no cache to refresh; invalidations are reported so the
/// user can see what a dashboard would have refetched.
pub struct LoggingInvalidator;

impl CacheInvalidator for LoggingInvalidator {
    fn invalidate(&self, key: &CacheKey) {
        info!(key = %key, "cache invalidated");
    }
}

/// Map terminal signals onto the visibility gate: SIGUSR1 hides, SIGUSR2
/// shows. Lets a wrapping pager or tmux hook suspend polling.
#[cfg(unix)]
pub fn spawn_visibility_signals(gate: VisibilityGate) -> Result<()> {
    use tokio::signal::unix::{SignalKind, signal};

    let mut hide = signal(SignalKind::user_defined1()).context("Failed to install SIGUSR1")?;
    let mut show = signal(SignalKind::user_defined2()).context("Failed to install SIGUSR2")?;
    tokio::spawn(async move {
        loop {
            tokio::select! {
                Some(()) = hide.recv() => gate.set_visible(false),
                Some(()) = show.recv() => gate.set_visible(true),
                else => break,
            }
        }
    });
    Ok(())
}

#[cfg(not(unix))]
pub fn spawn_visibility_signals(_gate: VisibilityGate) -> Result<()> {
    Ok(())
}

pub fn log_metrics(metrics: &StreamMetrics) {
    match serde_json::to_string(&metrics.snapshot()) {
        Ok(json) => debug!(metrics = %json, "stream metrics"),
        Err(e) => debug!(error = %e, "failed to serialize metrics"),
    }
}

/// Print the merged configuration (defaults, file, environment) as JSON.
pub fn print_config(config_dir: &Path) -> Result<()> {
    let fc: FileConfig = load_config(config_dir)
        .extract()
        .context("Failed to resolve configuration")?;
    println!("{}", serde_json::to_string_pretty(&fc)?);
    Ok(())
}
