//! Transport seam for the connection manager.
//!
//! A [`Connector`] opens a [`Link`]: a pair of in-process channels bridged to
//! the real socket by transport-owned tasks. The manager only ever sees text
//! frames and close notifications, which keeps it testable without a network.

use std::sync::Arc;
use std::sync::atomic::{AtomicU32, Ordering};

use futures::future::BoxFuture;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::error::StreamError;

/// WebSocket close code for a deliberate, normal shutdown.
pub const NORMAL_CLOSURE: u16 = 1000;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LinkEvent {
    /// One inbound text frame.
    Text(String),
    /// The peer closed the link. `Some(1000)` is a normal closure.
    Closed { code: Option<u16> },
}

/// An open link. Dropping `outgoing` or cancelling `close` tears the
/// underlying socket down; the end of `incoming` without a `Closed` event is
/// an abnormal close.
pub struct Link {
    pub outgoing: mpsc::UnboundedSender<String>,
    pub incoming: mpsc::UnboundedReceiver<LinkEvent>,
    pub close: CancellationToken,
}

pub trait Connector: Send + Sync + 'static {
    fn connect(&self) -> BoxFuture<'static, Result<Link, StreamError>>;
}

/// Server side of an in-memory link.
pub struct ServerEnd {
    /// Text frames written by the client.
    pub from_client: mpsc::UnboundedReceiver<String>,
    /// Push frames or a close to the client.
    pub to_client: mpsc::UnboundedSender<LinkEvent>,
    /// Cancelled when the client tears the link down.
    pub close: CancellationToken,
}

impl ServerEnd {
    pub fn send_text(&self, text: impl Into<String>) -> bool {
        self.to_client.send(LinkEvent::Text(text.into())).is_ok()
    }

    /// Drop the link without a close frame.
    pub fn abort(self) {}
}

/// In-process connector: every successful `connect` hands a [`ServerEnd`]
/// to the paired receiver. Used by tests and by hosts embedding a local
/// server.
#[derive(Clone)]
pub struct MemoryConnector {
    accept_tx: mpsc::UnboundedSender<ServerEnd>,
    failures: Arc<AtomicU32>,
}

impl MemoryConnector {
    pub fn new() -> (Self, mpsc::UnboundedReceiver<ServerEnd>) {
        let (accept_tx, accept_rx) = mpsc::unbounded_channel();
        let connector = Self {
            accept_tx,
            failures: Arc::new(AtomicU32::new(0)),
        };
        (connector, accept_rx)
    }

    /// Make the next `n` connection attempts fail.
    pub fn fail_next(&self, n: u32) {
        self.failures.store(n, Ordering::SeqCst);
    }
}

impl Connector for MemoryConnector {
    fn connect(&self) -> BoxFuture<'static, Result<Link, StreamError>> {
        let failed = self
            .failures
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        let accept_tx = self.accept_tx.clone();
        Box::pin(async move {
            if failed {
                return Err(StreamError::Transport("connection refused".into()));
            }
            let (out_tx, out_rx) = mpsc::unbounded_channel();
            let (in_tx, in_rx) = mpsc::unbounded_channel();
            let close = CancellationToken::new();
            accept_tx
                .send(ServerEnd {
                    from_client: out_rx,
                    to_client: in_tx,
                    close: close.clone(),
                })
                .map_err(|_| StreamError::Closed)?;
            Ok(Link {
                outgoing: out_tx,
                incoming: in_rx,
                close,
            })
        })
    }
}
