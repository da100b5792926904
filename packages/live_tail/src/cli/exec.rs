use std::sync::Arc;

use anyhow::{Result, bail};
use clap::Parser;
use tracing::{info, warn};

use live_telemetry::config::Settings;
use live_telemetry::execution::{ExecutionStreamClient, ExecutionStreamState};
use live_telemetry::metrics::StreamMetrics;
use live_telemetry::push::{HttpPushSource, StreamStatus};

use super::{LoggingInvalidator, http_client, log_metrics};

#[derive(Parser)]
pub struct ExecArgs {
    /// Execution id to follow
    pub subject: String,
}

/// Entries received since `printed`, oldest first. Entries already evicted
/// from the bounded log are skipped.
fn unprinted(state: &ExecutionStreamState, printed: u64) -> impl Iterator<Item = &String> {
    let new = state.received.saturating_sub(printed) as usize;
    let skip = state.logs.len().saturating_sub(new);
    state.logs.iter().skip(skip)
}

pub async fn run(settings: &Settings, args: ExecArgs) -> Result<()> {
    let metrics = Arc::new(StreamMetrics::new());
    let client = ExecutionStreamClient::open_with_metrics(
        Arc::new(HttpPushSource::new(http_client()?)),
        settings.endpoints.execution_url(&args.subject),
        &args.subject,
        settings.push.clone(),
        settings.execution.clone(),
        Arc::new(LoggingInvalidator),
        metrics.clone(),
    );

    let mut states = client.subscribe_state();
    let mut printed = 0u64;
    let mut run_status: Option<String> = None;
    let mut status = StreamStatus::Idle;

    loop {
        tokio::select! {
            changed = states.changed() => {
                if changed.is_err() {
                    break;
                }
                let state = states.borrow_and_update().clone();
                for line in unprinted(&state, printed) {
                    println!("{line}");
                }
                printed = state.received;

                if state.run_status != run_status {
                    if let Some(s) = &state.run_status {
                        info!(execution = %args.subject, status = %s, "execution status");
                    }
                    run_status = state.run_status.clone();
                }
                if state.status != status {
                    status = state.status;
                    match status {
                        StreamStatus::Error => warn!(execution = %args.subject, "execution feed error"),
                        s => info!(execution = %args.subject, status = %s, "execution feed"),
                    }
                }
                if state.completed {
                    break;
                }
                if state.status == StreamStatus::Error && client.is_finished() {
                    client.close().await;
                    bail!("execution feed for {} was rejected by the server", args.subject);
                }
            }
            _ = tokio::signal::ctrl_c() => break,
        }
    }

    client.close().await;
    log_metrics(&metrics);
    if let Some(s) = run_status {
        eprintln!("[livetail: {} {}]", args.subject, s);
    }
    Ok(())
}
