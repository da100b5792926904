//! Reopen loop shared by the push-feed clients.
//!
//! Opens a feed, forwards messages, and when the feed breaks or ends reports
//! `Error`, waits the retry delay and reopens with `Last-Event-ID`, the way an
//! EventSource does. Only a rejected open (4xx, 204) ends the loop.

use std::sync::Arc;

use futures::StreamExt;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::StreamStatus;
use super::source::{PushRequest, PushSource};
use super::sse::{SseItem, SseMessage};
use crate::config::PushSettings;
use crate::metrics::StreamMetrics;

/// What the message callback wants next.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Flow {
    Continue,
    /// Close the feed and never reopen it.
    Close,
}

/// How a [`drive`] call ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DriveEnd {
    Cancelled,
    /// The message callback returned [`Flow::Close`].
    Closed,
    /// The server rejected the open; the feed will not be reopened.
    Failed,
}

pub struct PushDriver {
    source: Arc<dyn PushSource>,
    settings: PushSettings,
    metrics: Arc<StreamMetrics>,
}

impl PushDriver {
    pub fn new(
        source: Arc<dyn PushSource>,
        settings: PushSettings,
        metrics: Arc<StreamMetrics>,
    ) -> Self {
        Self {
            source,
            settings,
            metrics,
        }
    }

    /// Run until cancelled, closed by `on_message`, or failed for good.
    ///
    /// `on_status` sees `Connecting` once, `Open` on every successful open and
    /// `Error` on every failure. It is not called on cancellation.
    pub async fn drive<S, M>(
        &self,
        mut request: PushRequest,
        cancel: CancellationToken,
        mut on_status: S,
        mut on_message: M,
    ) -> DriveEnd
    where
        S: FnMut(StreamStatus),
        M: FnMut(SseMessage) -> Flow,
    {
        let mut retry = self.settings.retry_delay;
        on_status(StreamStatus::Connecting);

        loop {
            let opened = tokio::select! {
                _ = cancel.cancelled() => return DriveEnd::Cancelled,
                opened = self.source.open(request.clone()) => opened,
            };

            match opened {
                Ok(mut feed) => {
                    info!(url = %request.url, "push feed open");
                    on_status(StreamStatus::Open);
                    loop {
                        let item = tokio::select! {
                            _ = cancel.cancelled() => return DriveEnd::Cancelled,
                            item = feed.next() => item,
                        };
                        match item {
                            Some(Ok(SseItem::Message(message))) => {
                                self.metrics.push_event();
                                if let Some(id) = &message.id {
                                    request.last_event_id = Some(id.clone());
                                }
                                if on_message(message) == Flow::Close {
                                    debug!(url = %request.url, "push feed closed by consumer");
                                    return DriveEnd::Closed;
                                }
                            }
                            Some(Ok(SseItem::Retry(delay))) => retry = delay,
                            // Once open, any read failure is a lost connection
                            Some(Err(e)) => {
                                warn!(url = %request.url, error = %e, "push feed lost");
                                break;
                            }
                            None => {
                                debug!(url = %request.url, "push feed ended by server");
                                break;
                            }
                        }
                    }
                    self.metrics.push_error();
                    on_status(StreamStatus::Error);
                }
                Err(e) => {
                    self.metrics.push_error();
                    on_status(StreamStatus::Error);
                    if !e.is_transient() {
                        warn!(url = %request.url, error = %e, "push feed rejected");
                        return DriveEnd::Failed;
                    }
                    debug!(url = %request.url, error = %e, "push feed open failed");
                }
            }

            debug!(url = %request.url, delay_ms = retry.as_millis() as u64, "reopening push feed");
            tokio::select! {
                _ = cancel.cancelled() => return DriveEnd::Cancelled,
                _ = tokio::time::sleep(retry) => {}
            }
        }
    }
}
