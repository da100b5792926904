//! Execution Stream Client: follow one execution's push feed.
//!
//! Unnamed messages are log entries, `status` and `complete` events carry
//! `{status, ...}`. Status and completion both invalidate the execution's
//! cached detail; completion also closes the feed for good.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex};

use serde::Deserialize;
use serde_json::Value;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::cache::{CacheInvalidator, CacheKey};
use crate::config::{ExecutionSettings, PushSettings};
use crate::error::StreamError;
use crate::lock;
use crate::metrics::StreamMetrics;
use crate::push::{
    DriveEnd, Flow, PushDriver, PushRequest, PushSource, SseMessage, StreamStatus,
};

#[derive(Debug, Clone, PartialEq)]
pub enum ExecutionFrame {
    LogEntry(String),
    StatusChange { status: String, data: Value },
    /// Terminal: nothing follows for this execution.
    Completion { status: String, data: Value },
}

#[derive(Deserialize)]
struct StatusPayload {
    status: String,
}

impl ExecutionFrame {
    /// Classify a push message by its event name.
    pub fn parse(message: &SseMessage) -> Result<Self, StreamError> {
        match message.event.as_deref() {
            None => Ok(Self::LogEntry(message.data.clone())),
            Some(event @ ("status" | "complete")) => {
                let data: Value = serde_json::from_str(&message.data)?;
                let StatusPayload { status } = serde_json::from_value(data.clone())?;
                Ok(if event == "status" {
                    Self::StatusChange { status, data }
                } else {
                    Self::Completion { status, data }
                })
            }
            Some(other) => Err(StreamError::Malformed(format!(
                "unknown execution event {other:?}"
            ))),
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completion { .. })
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct ExecutionStreamState {
    pub status: StreamStatus,
    /// Last status reported by the execution itself.
    pub run_status: Option<String>,
    /// Log entries in arrival order, oldest dropped beyond the cap.
    pub logs: VecDeque<String>,
    /// Log entries received in total, including dropped ones.
    pub received: u64,
    pub completed: bool,
}

impl Default for ExecutionStreamState {
    fn default() -> Self {
        Self {
            status: StreamStatus::Idle,
            run_status: None,
            logs: VecDeque::new(),
            received: 0,
            completed: false,
        }
    }
}

impl ExecutionStreamState {
    /// Fold one frame in. Frames after completion are ignored.
    pub fn apply(&mut self, frame: ExecutionFrame, max_log_entries: usize) {
        if self.completed {
            return;
        }
        match frame {
            ExecutionFrame::LogEntry(entry) => {
                self.logs.push_back(entry);
                self.received += 1;
                while self.logs.len() > max_log_entries {
                    self.logs.pop_front();
                }
            }
            ExecutionFrame::StatusChange { status, .. } => self.run_status = Some(status),
            ExecutionFrame::Completion { status, .. } => {
                self.run_status = Some(status);
                self.completed = true;
            }
        }
    }
}

pub struct ExecutionStreamClient {
    subject: String,
    state: watch::Sender<ExecutionStreamState>,
    cancel: CancellationToken,
    task: Mutex<Option<JoinHandle<()>>>,
}

/// Everything a feed task needs besides its request.
struct Feed {
    subject: String,
    settings: ExecutionSettings,
    invalidator: Arc<dyn CacheInvalidator>,
    metrics: Arc<StreamMetrics>,
}

impl ExecutionStreamClient {
    /// Open the feed for `subject` at `url`.
    ///
    /// Must be called from within a tokio runtime.
    pub fn open(
        source: Arc<dyn PushSource>,
        url: impl Into<String>,
        subject: &str,
        push: PushSettings,
        settings: ExecutionSettings,
        invalidator: Arc<dyn CacheInvalidator>,
    ) -> Self {
        Self::open_with_metrics(
            source,
            url,
            subject,
            push,
            settings,
            invalidator,
            Arc::new(StreamMetrics::new()),
        )
    }

    pub fn open_with_metrics(
        source: Arc<dyn PushSource>,
        url: impl Into<String>,
        subject: &str,
        push: PushSettings,
        settings: ExecutionSettings,
        invalidator: Arc<dyn CacheInvalidator>,
        metrics: Arc<StreamMetrics>,
    ) -> Self {
        let (state, _) = watch::channel(ExecutionStreamState::default());
        let cancel = CancellationToken::new();
        let driver = PushDriver::new(source, push, metrics.clone());
        let feed = Feed {
            subject: subject.to_string(),
            settings,
            invalidator,
            metrics,
        };
        info!(subject, "following execution");
        let task = tokio::spawn(run_feed(
            driver,
            PushRequest::new(url),
            cancel.clone(),
            state.clone(),
            feed,
        ));
        Self {
            subject: subject.to_string(),
            state,
            cancel,
            task: Mutex::new(Some(task)),
        }
    }

    pub fn subject(&self) -> &str {
        &self.subject
    }

    pub fn state(&self) -> ExecutionStreamState {
        self.state.borrow().clone()
    }

    pub fn subscribe_state(&self) -> watch::Receiver<ExecutionStreamState> {
        self.state.subscribe()
    }

    /// Close the feed and wait for it to shut. Safe to call after completion.
    pub async fn close(&self) {
        self.cancel.cancel();
        let task = lock(&self.task).take();
        if let Some(task) = task {
            let _ = task.await;
        }
        self.state.send_if_modified(|s| {
            let changed = s.status != StreamStatus::Closed;
            s.status = StreamStatus::Closed;
            changed
        });
    }

    /// Whether the feed task has ended (completion, hard failure or close).
    pub fn is_finished(&self) -> bool {
        lock(&self.task).as_ref().is_none_or(|t| t.is_finished())
    }
}

impl Drop for ExecutionStreamClient {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

fn set_status(state: &watch::Sender<ExecutionStreamState>, status: StreamStatus) {
    state.send_if_modified(|s| {
        let changed = s.status != status;
        s.status = status;
        changed
    });
}

async fn run_feed(
    driver: PushDriver,
    request: PushRequest,
    cancel: CancellationToken,
    state: watch::Sender<ExecutionStreamState>,
    feed: Feed,
) {
    let key = CacheKey::execution(&feed.subject);
    let end = driver
        .drive(
            request,
            cancel,
            |status| set_status(&state, status),
            |message| {
                let frame = match ExecutionFrame::parse(&message) {
                    Ok(frame) => frame,
                    Err(e) => {
                        feed.metrics.frame_malformed();
                        warn!(
                            subject = %feed.subject,
                            error = %e,
                            "dropping malformed execution frame"
                        );
                        return Flow::Continue;
                    }
                };
                let terminal = frame.is_terminal();
                let invalidates = !matches!(frame, ExecutionFrame::LogEntry(_));
                state.send_modify(|s| s.apply(frame, feed.settings.max_log_entries));
                if invalidates {
                    debug!(subject = %feed.subject, key = %key, "invalidating execution cache");
                    feed.invalidator.invalidate(&key);
                }
                if terminal { Flow::Close } else { Flow::Continue }
            },
        )
        .await;

    if end == DriveEnd::Closed {
        let status = state.borrow().run_status.clone().unwrap_or_default();
        info!(subject = %feed.subject, status = %status, "execution completed");
        set_status(&state, StreamStatus::Closed);
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;
    use crate::cache::RecordingInvalidator;
    use crate::push::MemoryPushSource;

    fn message(event: Option<&str>, data: &str) -> SseMessage {
        SseMessage {
            event: event.map(str::to_string),
            data: data.to_string(),
            id: None,
        }
    }

    #[test]
    fn parses_three_frame_kinds() {
        assert_eq!(
            ExecutionFrame::parse(&message(None, "step 1 ok")).unwrap(),
            ExecutionFrame::LogEntry("step 1 ok".into())
        );
        match ExecutionFrame::parse(&message(Some("status"), r#"{"status":"running","step":2}"#))
            .unwrap()
        {
            ExecutionFrame::StatusChange { status, data } => {
                assert_eq!(status, "running");
                assert_eq!(data["step"], 2);
            }
            other => panic!("unexpected {other:?}"),
        }
        assert!(
            ExecutionFrame::parse(&message(Some("complete"), r#"{"status":"failed"}"#))
                .unwrap()
                .is_terminal()
        );
    }

    #[test]
    fn malformed_frames_are_errors() {
        assert!(ExecutionFrame::parse(&message(Some("status"), "{")).is_err());
        assert!(ExecutionFrame::parse(&message(Some("status"), r#"{"state":"x"}"#)).is_err());
        assert!(ExecutionFrame::parse(&message(Some("bogus"), "{}")).is_err());
    }

    #[test]
    fn log_entries_are_bounded() {
        let mut state = ExecutionStreamState::default();
        for i in 0..5 {
            state.apply(ExecutionFrame::LogEntry(i.to_string()), 3);
        }
        assert_eq!(state.logs, ["2", "3", "4"]);
        assert_eq!(state.received, 5);
    }

    #[test]
    fn frames_after_completion_are_ignored() {
        let mut state = ExecutionStreamState::default();
        state.apply(
            ExecutionFrame::Completion {
                status: "succeeded".into(),
                data: Value::Null,
            },
            10,
        );
        state.apply(ExecutionFrame::LogEntry("late".into()), 10);
        assert!(state.completed);
        assert!(state.logs.is_empty());
        assert_eq!(state.run_status.as_deref(), Some("succeeded"));
    }

    fn open(source: MemoryPushSource, inv: Arc<RecordingInvalidator>) -> ExecutionStreamClient {
        ExecutionStreamClient::open(
            Arc::new(source),
            "mem://executions/exec-1/stream",
            "exec-1",
            PushSettings {
                retry_delay: Duration::from_millis(5),
            },
            ExecutionSettings { max_log_entries: 100 },
            inv,
        )
    }

    #[tokio::test]
    async fn logs_status_and_malformed_frames() {
        let (source, mut accept) = MemoryPushSource::new();
        let inv = Arc::new(RecordingInvalidator::new());
        let client = open(source, inv.clone());
        let conn = accept.recv().await.unwrap();

        conn.send_data("line 1");
        conn.send_event("status", "not json");
        conn.send_data("line 2");
        conn.send_event("status", r#"{"status":"running"}"#);

        let mut rx = client.subscribe_state();
        tokio::time::timeout(
            Duration::from_secs(2),
            rx.wait_for(|s| s.run_status.as_deref() == Some("running")),
        )
        .await
        .unwrap()
        .unwrap();

        let state = client.state();
        assert_eq!(state.logs, ["line 1", "line 2"]);
        assert_eq!(state.status, StreamStatus::Open);
        assert!(!state.completed);
        assert_eq!(inv.keys(), vec![CacheKey::execution("exec-1")]);
    }

    #[tokio::test]
    async fn close_shuts_the_feed() {
        let (source, mut accept) = MemoryPushSource::new();
        let client = open(source, Arc::new(RecordingInvalidator::new()));
        let conn = accept.recv().await.unwrap();

        client.close().await;
        assert!(conn.is_closed());
        assert!(client.is_finished());
        assert_eq!(client.state().status, StreamStatus::Closed);
    }

    #[tokio::test]
    async fn dropped_transport_reconnects_until_completion() {
        let (source, mut accept) = MemoryPushSource::new();
        let inv = Arc::new(RecordingInvalidator::new());
        let client = open(source, inv.clone());

        let first = accept.recv().await.unwrap();
        first.send_data("before");
        first.fail();

        let second = accept.recv().await.unwrap();
        second.send_event("complete", r#"{"status":"failed"}"#);

        let mut rx = client.subscribe_state();
        tokio::time::timeout(
            Duration::from_secs(2),
            rx.wait_for(|s| s.status == StreamStatus::Closed),
        )
        .await
        .unwrap()
        .unwrap();
        assert!(second.is_closed());
        assert_eq!(client.state().run_status.as_deref(), Some("failed"));
        assert_eq!(inv.keys().len(), 1);
    }
}
