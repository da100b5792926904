use std::sync::Arc;

use anyhow::Result;
use clap::Parser;
use tracing::{info, warn};

use live_telemetry::config::Settings;
use live_telemetry::events::{DomainEvent, EventFilter, EventStreamClient};
use live_telemetry::metrics::StreamMetrics;
use live_telemetry::push::HttpPushSource;

use super::{http_client, log_metrics};

#[derive(Parser)]
pub struct EventsArgs {
    #[arg(long)]
    pub protocol_id: Option<i64>,

    #[arg(long)]
    pub project_id: Option<i64>,

    #[arg(long)]
    pub event_type: Option<String>,

    /// Repeatable: `--category execution --category policy`
    #[arg(long = "category")]
    pub categories: Vec<String>,

    /// Only events after this id (pass the last id printed on exit to resume)
    #[arg(long)]
    pub since_id: Option<i64>,
}

impl EventsArgs {
    fn filter(&self) -> EventFilter {
        EventFilter {
            protocol_id: self.protocol_id,
            project_id: self.project_id,
            event_type: self.event_type.clone(),
            categories: self.categories.clone(),
            since_id: self.since_id,
        }
    }
}

pub async fn run(settings: &Settings, args: EventsArgs) -> Result<()> {
    let metrics = Arc::new(StreamMetrics::new());
    let client = EventStreamClient::with_metrics(
        Arc::new(HttpPushSource::new(http_client()?)),
        settings.endpoints.events_url(),
        settings.push.clone(),
        metrics.clone(),
        print_event,
    );

    let mut states = client.subscribe_state();
    client.set_filter(args.filter(), true).await;

    let mut last_status = client.state().status;
    loop {
        tokio::select! {
            changed = states.changed() => {
                if changed.is_err() {
                    break;
                }
                let state = *states.borrow_and_update();
                if state.status != last_status {
                    info!(status = %state.status, last_event_id = state.last_event_id, "event feed");
                    last_status = state.status;
                }
            }
            _ = tokio::signal::ctrl_c() => break,
        }
    }

    let last_event_id = client.state().last_event_id;
    client.close().await;
    if last_event_id > 0 {
        eprintln!("[livetail: resume with --since-id {last_event_id}]");
    }
    log_metrics(&metrics);
    Ok(())
}

fn print_event(event: &DomainEvent) {
    match serde_json::to_string(event) {
        Ok(line) => println!("{line}"),
        Err(e) => warn!(id = event.id, error = %e, "failed to print event"),
    }
}
