//! Push feed sources.
//!
//! A [`PushSource`] opens one feed for a [`PushRequest`] and yields parsed SSE
//! items until the server ends it or the transport fails. Reopening is the
//! driver's job, not the source's.

use std::collections::VecDeque;
use std::sync::Arc;
use std::sync::atomic::{AtomicU32, Ordering};

use futures::StreamExt;
use futures::future::BoxFuture;
use futures::stream::{self, BoxStream};
use reqwest::header::{ACCEPT, CACHE_CONTROL};
use tokio::sync::mpsc;
use tracing::debug;

use super::sse::{SseItem, SseParser};
use crate::error::StreamError;

pub type PushStream = BoxStream<'static, Result<SseItem, StreamError>>;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PushRequest {
    pub url: String,
    /// Query parameters in order; a key may repeat.
    pub query: Vec<(String, String)>,
    /// Sent as `Last-Event-ID` when reopening after a transport error.
    pub last_event_id: Option<String>,
}

impl PushRequest {
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            query: Vec::new(),
            last_event_id: None,
        }
    }

    pub fn with_query(mut self, query: Vec<(String, String)>) -> Self {
        self.query = query;
        self
    }
}

pub trait PushSource: Send + Sync + 'static {
    fn open(&self, request: PushRequest) -> BoxFuture<'static, Result<PushStream, StreamError>>;
}

/// SSE over HTTP.
#[derive(Debug, Clone, Default)]
pub struct HttpPushSource {
    client: reqwest::Client,
}

impl HttpPushSource {
    pub fn new(client: reqwest::Client) -> Self {
        Self { client }
    }
}

impl PushSource for HttpPushSource {
    fn open(&self, request: PushRequest) -> BoxFuture<'static, Result<PushStream, StreamError>> {
        let client = self.client.clone();
        Box::pin(async move {
            let mut builder = client
                .get(&request.url)
                .query(&request.query)
                .header(ACCEPT, "text/event-stream")
                .header(CACHE_CONTROL, "no-cache");
            if let Some(id) = &request.last_event_id {
                builder = builder.header("Last-Event-ID", id.as_str());
            }

            let response = builder.send().await?;
            let status = response.status();
            // 204 means "stop reconnecting"
            if !status.is_success() || status == reqwest::StatusCode::NO_CONTENT {
                return Err(StreamError::Http {
                    status: status.as_u16(),
                });
            }
            debug!(url = %request.url, "push feed opened");

            let bytes = response.bytes_stream();
            let items = stream::unfold(
                (bytes, SseParser::new(), VecDeque::new()),
                |(mut bytes, mut parser, mut ready)| async move {
                    loop {
                        if let Some(item) = ready.pop_front() {
                            return Some((Ok(item), (bytes, parser, ready)));
                        }
                        match bytes.next().await {
                            Some(Ok(chunk)) => ready.extend(parser.feed(&chunk)),
                            Some(Err(e)) => {
                                return Some((Err(StreamError::from(e)), (bytes, parser, ready)));
                            }
                            None => return None,
                        }
                    }
                },
            );
            Ok(items.boxed())
        })
    }
}

/// One feed opened against a [`MemoryPushSource`].
pub struct PushConnection {
    pub request: PushRequest,
    tx: mpsc::UnboundedSender<Result<SseItem, StreamError>>,
}

impl PushConnection {
    /// Push raw SSE text through a parser, as a server would.
    pub fn send_raw(&self, raw: &str) -> bool {
        let mut parser = SseParser::new();
        parser
            .feed(raw.as_bytes())
            .into_iter()
            .all(|item| self.tx.send(Ok(item)).is_ok())
    }

    /// Send one unnamed `data:` message.
    pub fn send_data(&self, data: &str) -> bool {
        self.send_raw(&format!("data: {data}\n\n"))
    }

    pub fn send_event(&self, event: &str, data: &str) -> bool {
        self.send_raw(&format!("event: {event}\ndata: {data}\n\n"))
    }

    /// Fail the feed with a transport error.
    pub fn fail(self) {
        let _ = self
            .tx
            .send(Err(StreamError::Transport("connection reset".into())));
    }

    /// Whether the client side has dropped the feed.
    pub fn is_closed(&self) -> bool {
        self.tx.is_closed()
    }
}

/// In-process source: each `open` hands a [`PushConnection`] to the paired
/// receiver. Dropping the connection ends the feed.
#[derive(Clone)]
pub struct MemoryPushSource {
    accept_tx: mpsc::UnboundedSender<PushConnection>,
    failures: Arc<AtomicU32>,
}

impl MemoryPushSource {
    pub fn new() -> (Self, mpsc::UnboundedReceiver<PushConnection>) {
        let (accept_tx, accept_rx) = mpsc::unbounded_channel();
        let source = Self {
            accept_tx,
            failures: Arc::new(AtomicU32::new(0)),
        };
        (source, accept_rx)
    }

    /// Make the next `n` opens fail with a transient error.
    pub fn fail_next(&self, n: u32) {
        self.failures.store(n, Ordering::SeqCst);
    }
}

impl PushSource for MemoryPushSource {
    fn open(&self, request: PushRequest) -> BoxFuture<'static, Result<PushStream, StreamError>> {
        let failed = self
            .failures
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        let accept_tx = self.accept_tx.clone();
        Box::pin(async move {
            if failed {
                return Err(StreamError::Http { status: 503 });
            }
            let (tx, rx) = mpsc::unbounded_channel();
            accept_tx
                .send(PushConnection { request, tx })
                .map_err(|_| StreamError::Closed)?;
            let items = stream::unfold(rx, |mut rx| async move {
                rx.recv().await.map(|item| (item, rx))
            });
            Ok(items.boxed())
        })
    }
}
