use std::sync::Arc;

use anyhow::Result;
use clap::Parser;
use tracing::{info, warn};

use live_telemetry::cache::{CacheKey, invalidate_on_channel};
use live_telemetry::connection::{ConnectionManager, InboundFrame, WebSocketConnector};
use live_telemetry::config::Settings;
use live_telemetry::metrics::StreamMetrics;

use super::{LoggingInvalidator, log_metrics};

#[derive(Parser)]
pub struct WatchArgs {
    /// Channels to subscribe to, e.g. `events`, `protocol:12`, `step:40`
    #[arg(required = true)]
    pub channels: Vec<String>,
}

/// Cache keys a dashboard would refetch for a frame on `channel`.
fn keys_for_channel(channel: &str) -> Vec<CacheKey> {
    match channel.split_once(':') {
        Some(("protocol", id)) => vec![CacheKey::protocol(id)],
        Some(("step", id)) => vec![CacheKey::step(id)],
        Some(("run", id)) => vec![CacheKey::run(id)],
        _ => Vec::new(),
    }
}

pub async fn run(settings: &Settings, args: WatchArgs) -> Result<()> {
    let metrics = Arc::new(StreamMetrics::new());
    let manager = ConnectionManager::with_metrics(
        WebSocketConnector::new(settings.endpoints.ws_url()),
        settings.connection.clone(),
        metrics.clone(),
    );

    let invalidator = Arc::new(LoggingInvalidator);
    let mut handles = Vec::new();
    for channel in &args.channels {
        handles.push(manager.subscribe(channel, print_frame));
        handles.push(invalidate_on_channel(
            &manager,
            channel,
            invalidator.clone(),
            |frame: &InboundFrame| {
                frame
                    .channel
                    .as_deref()
                    .map(keys_for_channel)
                    .unwrap_or_default()
            },
        ));
    }

    let mut states = manager.subscribe_state();
    manager.connect();
    info!(channels = ?args.channels, "watching");

    loop {
        tokio::select! {
            changed = states.changed() => {
                if changed.is_err() {
                    break;
                }
                let state = *states.borrow_and_update();
                info!(state = %state, "connection");
            }
            _ = tokio::signal::ctrl_c() => break,
        }
    }

    for handle in &handles {
        manager.unsubscribe(handle);
    }
    manager.shutdown().await;
    log_metrics(&metrics);
    Ok(())
}

fn print_frame(frame: &InboundFrame) {
    match serde_json::to_string(frame) {
        Ok(line) => println!("{line}"),
        Err(e) => warn!(error = %e, "failed to print frame"),
    }
}
