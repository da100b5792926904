//! Event Stream Client: the filtered system-wide domain event feed.
//!
//! One client owns at most one open feed. Changing the filter or disabling
//! the client closes the previous feed, and waits for it, before anything new
//! is opened. Resuming after a gap is the caller's job: pass
//! [`EventFilter::resume_from`] with the last id it saw.

use std::sync::{Arc, Mutex};

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::config::PushSettings;
use crate::lock;
use crate::metrics::StreamMetrics;
use crate::push::{Flow, PushDriver, PushRequest, PushSource, SseMessage, StreamStatus};

/// Query parameters of the event feed. `None` and empty fields are not sent.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct EventFilter {
    pub protocol_id: Option<i64>,
    pub project_id: Option<i64>,
    pub event_type: Option<String>,
    pub categories: Vec<String>,
    /// Only events with an id strictly greater than this.
    pub since_id: Option<i64>,
}

impl EventFilter {
    /// The same filter, resumed after `last_event_id`. An id of 0 means
    /// nothing was seen yet and leaves `since_id` untouched.
    pub fn resume_from(mut self, last_event_id: i64) -> Self {
        if last_event_id > 0 {
            self.since_id = Some(self.since_id.map_or(last_event_id, |s| s.max(last_event_id)));
        }
        self
    }

    /// Query pairs in a stable order; categories repeat the `category` key.
    pub fn to_query_pairs(&self) -> Vec<(String, String)> {
        let mut pairs = Vec::new();
        if let Some(id) = self.protocol_id {
            pairs.push(("protocol_id".to_string(), id.to_string()));
        }
        if let Some(id) = self.project_id {
            pairs.push(("project_id".to_string(), id.to_string()));
        }
        if let Some(event_type) = &self.event_type {
            pairs.push(("event_type".to_string(), event_type.clone()));
        }
        for category in &self.categories {
            pairs.push(("category".to_string(), category.clone()));
        }
        if let Some(id) = self.since_id {
            pairs.push(("since_id".to_string(), id.to_string()));
        }
        pairs
    }
}

/// One pushed domain event. Fields beyond the well-known ones are kept in
/// `fields`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DomainEvent {
    pub id: i64,
    #[serde(default)]
    pub event_type: Option<String>,
    #[serde(default)]
    pub category: Option<String>,
    #[serde(default)]
    pub protocol_id: Option<i64>,
    #[serde(default)]
    pub project_id: Option<i64>,
    #[serde(flatten)]
    pub fields: Map<String, Value>,
}

impl DomainEvent {
    pub fn parse(data: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(data)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct EventStreamState {
    pub status: StreamStatus,
    /// Highest event id delivered so far. Never decreases.
    pub last_event_id: i64,
}

impl Default for EventStreamState {
    fn default() -> Self {
        Self {
            status: StreamStatus::Idle,
            last_event_id: 0,
        }
    }
}

/// Input to [`EventStreamState::reduce`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EventUpdate {
    Status(StreamStatus),
    Delivered(i64),
}

impl EventStreamState {
    pub fn reduce(self, update: EventUpdate) -> Self {
        match update {
            EventUpdate::Status(status) => Self { status, ..self },
            EventUpdate::Delivered(id) => Self {
                last_event_id: self.last_event_id.max(id),
                ..self
            },
        }
    }
}

pub type EventSink = Arc<dyn Fn(&DomainEvent) + Send + Sync>;

struct Feed {
    cancel: CancellationToken,
    task: JoinHandle<()>,
}

pub struct EventStreamClient {
    driver: Arc<PushDriver>,
    url: String,
    sink: EventSink,
    metrics: Arc<StreamMetrics>,
    state: Arc<watch::Sender<EventStreamState>>,
    feed: Mutex<Option<Feed>>,
}

impl EventStreamClient {
    pub fn new<F>(
        source: Arc<dyn PushSource>,
        url: impl Into<String>,
        settings: PushSettings,
        sink: F,
    ) -> Self
    where
        F: Fn(&DomainEvent) + Send + Sync + 'static,
    {
        Self::with_metrics(source, url, settings, Arc::new(StreamMetrics::new()), sink)
    }

    pub fn with_metrics<F>(
        source: Arc<dyn PushSource>,
        url: impl Into<String>,
        settings: PushSettings,
        metrics: Arc<StreamMetrics>,
        sink: F,
    ) -> Self
    where
        F: Fn(&DomainEvent) + Send + Sync + 'static,
    {
        let (state, _) = watch::channel(EventStreamState::default());
        Self {
            driver: Arc::new(PushDriver::new(source, settings, metrics.clone())),
            url: url.into(),
            sink: Arc::new(sink),
            metrics,
            state: Arc::new(state),
            feed: Mutex::new(None),
        }
    }

    /// Apply a filter. The previous feed is closed first; when `enabled` is
    /// false the client goes idle and opens nothing.
    ///
    /// Must be called from within a tokio runtime.
    pub async fn set_filter(&self, filter: EventFilter, enabled: bool) {
        self.close().await;
        if !enabled {
            return;
        }

        let request = PushRequest::new(self.url.clone()).with_query(filter.to_query_pairs());
        info!(url = %self.url, ?filter, "opening event feed");

        let cancel = CancellationToken::new();
        let task = tokio::spawn(run_feed(
            self.driver.clone(),
            request,
            cancel.clone(),
            self.state.clone(),
            self.sink.clone(),
            self.metrics.clone(),
        ));
        if let Some(racing) = lock(&self.feed).replace(Feed { cancel, task }) {
            racing.cancel.cancel();
        }
    }

    /// Close the feed, if any, and go idle. `last_event_id` is kept.
    pub async fn close(&self) {
        let feed = lock(&self.feed).take();
        if let Some(feed) = feed {
            feed.cancel.cancel();
            let _ = feed.task.await;
            debug!(url = %self.url, "event feed closed");
        }
        update(&self.state, EventUpdate::Status(StreamStatus::Idle));
    }

    pub fn state(&self) -> EventStreamState {
        *self.state.borrow()
    }

    pub fn subscribe_state(&self) -> watch::Receiver<EventStreamState> {
        self.state.subscribe()
    }
}

impl Drop for EventStreamClient {
    fn drop(&mut self) {
        if let Some(feed) = lock(&self.feed).take() {
            feed.cancel.cancel();
        }
    }
}

fn update(state: &watch::Sender<EventStreamState>, update: EventUpdate) {
    state.send_if_modified(|current| {
        let next = current.reduce(update);
        let changed = next != *current;
        *current = next;
        changed
    });
}

async fn run_feed(
    driver: Arc<PushDriver>,
    request: PushRequest,
    cancel: CancellationToken,
    state: Arc<watch::Sender<EventStreamState>>,
    sink: EventSink,
    metrics: Arc<StreamMetrics>,
) {
    let end = driver
        .drive(
            request,
            cancel,
            |status| update(&state, EventUpdate::Status(status)),
            |message: SseMessage| {
                match DomainEvent::parse(&message.data) {
                    Ok(event) => {
                        sink(&event);
                        update(&state, EventUpdate::Delivered(event.id));
                    }
                    Err(e) => {
                        metrics.frame_malformed();
                        warn!(error = %e, "dropping malformed event");
                    }
                }
                Flow::Continue
            },
        )
        .await;
    debug!(?end, "event feed task finished");
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;
    use crate::push::MemoryPushSource;

    fn pairs(p: &[(&str, &str)]) -> Vec<(String, String)> {
        p.iter().map(|(k, v)| (k.to_string(), v.to_string())).collect()
    }

    #[test]
    fn absent_fields_are_omitted() {
        assert!(EventFilter::default().to_query_pairs().is_empty());

        let filter = EventFilter {
            project_id: Some(9),
            ..Default::default()
        };
        assert_eq!(filter.to_query_pairs(), pairs(&[("project_id", "9")]));
    }

    #[test]
    fn categories_repeat() {
        let filter = EventFilter {
            protocol_id: Some(3),
            event_type: Some("step_completed".into()),
            categories: vec!["execution".into(), "policy".into()],
            since_id: Some(40),
            ..Default::default()
        };
        assert_eq!(
            filter.to_query_pairs(),
            pairs(&[
                ("protocol_id", "3"),
                ("event_type", "step_completed"),
                ("category", "execution"),
                ("category", "policy"),
                ("since_id", "40"),
            ])
        );
    }

    #[test]
    fn resume_from_never_lowers_since_id() {
        let filter = EventFilter::default().resume_from(12);
        assert_eq!(filter.since_id, Some(12));
        assert_eq!(filter.clone().resume_from(5).since_id, Some(12));
        assert_eq!(EventFilter::default().resume_from(0).since_id, None);
    }

    #[test]
    fn reducer_keeps_max_id() {
        let s = EventStreamState::default()
            .reduce(EventUpdate::Delivered(5))
            .reduce(EventUpdate::Delivered(3))
            .reduce(EventUpdate::Status(StreamStatus::Open));
        assert_eq!(s.last_event_id, 5);
        assert_eq!(s.status, StreamStatus::Open);
    }

    #[test]
    fn domain_event_keeps_extra_fields() {
        let event =
            DomainEvent::parse(r#"{"id":7,"event_type":"run_started","run_id":"run-42"}"#).unwrap();
        assert_eq!(event.id, 7);
        assert_eq!(event.event_type.as_deref(), Some("run_started"));
        assert_eq!(event.fields["run_id"], "run-42");
        assert!(DomainEvent::parse(r#"{"event_type":"x"}"#).is_err());
    }

    fn client(source: MemoryPushSource) -> (EventStreamClient, Arc<Mutex<Vec<i64>>>) {
        client_with_retry(source, 5)
    }

    fn client_with_retry(
        source: MemoryPushSource,
        retry_ms: u64,
    ) -> (EventStreamClient, Arc<Mutex<Vec<i64>>>) {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = seen.clone();
        let client = EventStreamClient::new(
            Arc::new(source),
            "mem://events",
            PushSettings {
                retry_delay: Duration::from_millis(retry_ms),
            },
            move |e: &DomainEvent| sink.lock().unwrap().push(e.id),
        );
        (client, seen)
    }

    async fn wait_for<F: Fn(&EventStreamState) -> bool>(client: &EventStreamClient, f: F) {
        let mut rx = client.subscribe_state();
        tokio::time::timeout(Duration::from_secs(2), rx.wait_for(|s| f(s)))
            .await
            .expect("state reached")
            .unwrap();
    }

    #[tokio::test]
    async fn delivers_events_and_drops_malformed() {
        let (source, mut accept) = MemoryPushSource::new();
        let metrics = Arc::new(StreamMetrics::new());
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = seen.clone();
        let client = EventStreamClient::with_metrics(
            Arc::new(source),
            "mem://events",
            PushSettings::default(),
            metrics.clone(),
            move |e: &DomainEvent| sink.lock().unwrap().push(e.id),
        );
        assert_eq!(client.state().status, StreamStatus::Idle);

        client
            .set_filter(
                EventFilter {
                    categories: vec!["execution".into()],
                    ..Default::default()
                },
                true,
            )
            .await;
        let conn = accept.recv().await.unwrap();
        assert_eq!(conn.request.query, pairs(&[("category", "execution")]));
        wait_for(&client, |s| s.status == StreamStatus::Open).await;

        conn.send_data(r#"{"id":1}"#);
        conn.send_data("not json");
        conn.send_data(r#"{"id":2}"#);
        wait_for(&client, |s| s.last_event_id == 2).await;

        assert_eq!(*seen.lock().unwrap(), vec![1, 2]);
        assert_eq!(client.state().status, StreamStatus::Open);
        let snapshot = metrics.snapshot();
        assert_eq!(snapshot.frames.malformed, 1);
        assert_eq!(snapshot.push.events, 3);
    }

    #[tokio::test]
    async fn changing_filter_closes_previous_feed_first() {
        let (source, mut accept) = MemoryPushSource::new();
        let (client, _seen) = client(source);

        client.set_filter(EventFilter::default(), true).await;
        let first = accept.recv().await.unwrap();

        let filter = EventFilter {
            protocol_id: Some(1),
            ..Default::default()
        };
        client.set_filter(filter, true).await;
        assert!(first.is_closed());
        let second = accept.recv().await.unwrap();
        assert_eq!(second.request.query, pairs(&[("protocol_id", "1")]));
    }

    #[tokio::test]
    async fn disabled_goes_idle_and_keeps_last_id() {
        let (source, mut accept) = MemoryPushSource::new();
        let (client, _seen) = client(source);

        client.set_filter(EventFilter::default(), true).await;
        let conn = accept.recv().await.unwrap();
        conn.send_data(r#"{"id":9}"#);
        wait_for(&client, |s| s.last_event_id == 9).await;

        client.set_filter(EventFilter::default(), false).await;
        assert!(conn.is_closed());
        assert_eq!(
            client.state(),
            EventStreamState {
                status: StreamStatus::Idle,
                last_event_id: 9,
            }
        );
        assert!(accept.try_recv().is_err());
    }

    #[tokio::test]
    async fn transport_error_is_reflected_then_recovers() {
        let (source, mut accept) = MemoryPushSource::new();
        let (client, _seen) = client_with_retry(source, 300);
        let mut states = client.subscribe_state();

        client.set_filter(EventFilter::default(), true).await;
        let first = accept.recv().await.unwrap();
        wait_for(&client, |s| s.status == StreamStatus::Open).await;

        states.borrow_and_update();
        first.fail();
        tokio::time::timeout(
            Duration::from_secs(2),
            states.wait_for(|s| s.status == StreamStatus::Error),
        )
        .await
        .unwrap()
        .unwrap();

        let _second = accept.recv().await.unwrap();
        wait_for(&client, |s| s.status == StreamStatus::Open).await;
    }

    #[tokio::test]
    async fn drop_closes_the_feed() {
        let (source, mut accept) = MemoryPushSource::new();
        let (client, _seen) = client(source);
        client.set_filter(EventFilter::default(), true).await;
        let conn = accept.recv().await.unwrap();

        drop(client);
        tokio::time::timeout(Duration::from_secs(2), async {
            while !conn.is_closed() {
                tokio::task::yield_now().await;
            }
        })
        .await
        .unwrap();
    }
}
