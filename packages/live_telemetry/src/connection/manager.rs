//! ConnectionManager: the process-wide multiplexed channel.
//!
//! One manager per application session owns one bidirectional link. Consumers
//! attach handlers to named channels; the manager keeps the server-side
//! subscription set in step with the local registry across reconnects,
//! answers server pings, and sends heartbeats.

use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::{Arc, Mutex, MutexGuard};

use serde::{Deserialize, Serialize};
use tokio::sync::{broadcast, mpsc, watch};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::backoff::Backoff;
use super::protocol::{ClientFrame, InboundFrame};
use super::registry::{ChannelRegistry, SubscriptionHandle, TransportChange};
use super::transport::{Connector, Link, LinkEvent, NORMAL_CLOSURE};
use crate::config::ConnectionSettings;
use crate::lock;
use crate::metrics::StreamMetrics;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
    Reconnecting,
    Error,
}

impl ConnectionState {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Disconnected => "disconnected",
            Self::Connecting => "connecting",
            Self::Connected => "connected",
            Self::Reconnecting => "reconnecting",
            Self::Error => "error",
        }
    }
}

impl std::fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Registry plus the sender of the live link, guarded together so a
/// registration and a link (re)open never interleave.
struct Core {
    registry: ChannelRegistry,
    outbound: Option<mpsc::UnboundedSender<String>>,
}

struct Shared {
    connector: Box<dyn Connector>,
    settings: ConnectionSettings,
    core: Mutex<Core>,
    state: watch::Sender<ConnectionState>,
    frames: broadcast::Sender<InboundFrame>,
    metrics: Arc<StreamMetrics>,
}

struct Session {
    cancel: CancellationToken,
    task: JoinHandle<()>,
}

enum SessionEnd {
    Cancelled,
    Normal,
    Abnormal,
}

pub struct ConnectionManager {
    shared: Arc<Shared>,
    session: Mutex<Option<Session>>,
}

impl ConnectionManager {
    pub fn new(connector: impl Connector, settings: ConnectionSettings) -> Self {
        Self::with_metrics(connector, settings, Arc::new(StreamMetrics::new()))
    }

    pub fn with_metrics(
        connector: impl Connector,
        settings: ConnectionSettings,
        metrics: Arc<StreamMetrics>,
    ) -> Self {
        let (state, _) = watch::channel(ConnectionState::Disconnected);
        let (frames, _) = broadcast::channel(256);
        Self {
            shared: Arc::new(Shared {
                connector: Box::new(connector),
                settings,
                core: Mutex::new(Core {
                    registry: ChannelRegistry::new(),
                    outbound: None,
                }),
                state,
                frames,
                metrics,
            }),
            session: Mutex::new(None),
        }
    }

    /// Start the connection loop unless one is already running.
    ///
    /// Must be called from within a tokio runtime.
    pub fn connect(&self) {
        let mut session = lock(&self.session);
        if session.as_ref().is_some_and(|s| !s.task.is_finished()) {
            return;
        }
        let cancel = CancellationToken::new();
        let task = tokio::spawn(self.shared.clone().run(cancel.clone()));
        *session = Some(Session { cancel, task });
    }

    /// Attach a handler to `channel`. The first holder of a channel
    /// subscribes it on the transport (immediately when connected, otherwise
    /// on the next open).
    pub fn subscribe<F>(&self, channel: &str, handler: F) -> SubscriptionHandle
    where
        F: Fn(&InboundFrame) + Send + Sync + 'static,
    {
        let mut core = self.shared.core();
        let (handle, change) = core.registry.register(channel, Arc::new(handler));
        if let TransportChange::Subscribe(channel) = change {
            debug!(channel = %channel, "first holder, subscribing");
            if let Some(tx) = &core.outbound {
                let _ = tx.send(
                    ClientFrame::Subscribe {
                        channels: vec![channel],
                    }
                    .to_json(),
                );
            }
        }
        handle
    }

    /// Detach one handler. The last holder of a channel unsubscribes it on
    /// the transport.
    pub fn unsubscribe(&self, handle: &SubscriptionHandle) {
        let mut core = self.shared.core();
        if let TransportChange::Unsubscribe(channel) = core.registry.unregister(handle) {
            debug!(channel = %channel, "last holder left, unsubscribing");
            if let Some(tx) = &core.outbound {
                let _ = tx.send(
                    ClientFrame::Unsubscribe {
                        channels: vec![channel],
                    }
                    .to_json(),
                );
            }
        }
    }

    /// Send a frame on the live link. Returns `false` when not connected;
    /// nothing is queued for later.
    pub fn send(&self, frame: &ClientFrame) -> bool {
        let core = self.shared.core();
        match &core.outbound {
            Some(tx) => tx.send(frame.to_json()).is_ok(),
            None => {
                debug!("send while disconnected, dropped");
                false
            }
        }
    }

    pub fn state(&self) -> ConnectionState {
        *self.shared.state.borrow()
    }

    pub fn is_connected(&self) -> bool {
        self.state() == ConnectionState::Connected
    }

    pub fn subscribe_state(&self) -> watch::Receiver<ConnectionState> {
        self.shared.state.subscribe()
    }

    /// Every dispatched frame, including channel-less ones. Pings and pongs
    /// are not included.
    pub fn frames(&self) -> broadcast::Receiver<InboundFrame> {
        self.shared.frames.subscribe()
    }

    /// Channels with at least one local holder.
    pub fn channels(&self) -> Vec<String> {
        self.shared.core().registry.channels()
    }

    pub fn metrics(&self) -> &Arc<StreamMetrics> {
        &self.shared.metrics
    }

    /// Force-close the link and stop reconnecting. Registrations are kept, so
    /// a later `connect()` resubscribes them.
    pub async fn disconnect(&self) {
        let session = lock(&self.session).take();
        if let Some(session) = session {
            session.cancel.cancel();
            let _ = session.task.await;
        }
        self.shared.core().outbound = None;
        self.shared.set_state(ConnectionState::Disconnected);
    }

    /// Dispose: close the link and drop every registration.
    pub async fn shutdown(&self) {
        self.disconnect().await;
        self.shared.core().registry.clear();
        info!("connection manager shut down");
    }
}

impl Drop for ConnectionManager {
    fn drop(&mut self) {
        if let Some(session) = lock(&self.session).take() {
            session.cancel.cancel();
        }
    }
}

impl Shared {
    fn core(&self) -> MutexGuard<'_, Core> {
        lock(&self.core)
    }

    fn set_state(&self, next: ConnectionState) {
        self.state.send_if_modified(|current| {
            if *current == next {
                false
            } else {
                debug!(from = %current, to = %next, "connection state");
                *current = next;
                true
            }
        });
    }

    async fn run(self: Arc<Self>, cancel: CancellationToken) {
        let mut backoff = Backoff::new(self.settings.reconnect_base, self.settings.reconnect_max);
        let mut reconnecting = false;

        loop {
            self.set_state(if reconnecting {
                ConnectionState::Reconnecting
            } else {
                ConnectionState::Connecting
            });

            let result = tokio::select! {
                _ = cancel.cancelled() => break,
                result = self.connector.connect() => result,
            };

            match result {
                Ok(link) => {
                    backoff.reset();
                    match self.run_session(link, &cancel).await {
                        SessionEnd::Cancelled => break,
                        SessionEnd::Normal => {
                            info!("connection closed normally");
                            self.set_state(ConnectionState::Disconnected);
                            return;
                        }
                        SessionEnd::Abnormal => {
                            info!("connection lost, will attempt reconnection");
                            self.set_state(ConnectionState::Reconnecting);
                        }
                    }
                }
                Err(e) => {
                    warn!(attempt = backoff.attempt(), error = %e, "connect failed");
                    self.set_state(ConnectionState::Error);
                }
            }
            reconnecting = true;

            if let Some(max) = self.settings.max_reconnect_attempts {
                if backoff.attempt() >= max {
                    warn!(attempts = max, "giving up reconnecting");
                    self.set_state(ConnectionState::Error);
                    return;
                }
            }

            let delay = backoff.next_delay();
            self.metrics.reconnect_scheduled();
            debug!(attempt = backoff.attempt(), ?delay, "reconnect scheduled");
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = tokio::time::sleep(delay) => {}
            }
        }

        self.core().outbound = None;
        self.set_state(ConnectionState::Disconnected);
    }

    async fn run_session(&self, link: Link, cancel: &CancellationToken) -> SessionEnd {
        let Link {
            outgoing,
            mut incoming,
            close,
        } = link;

        {
            let mut core = self.core();
            let channels = core.registry.channels();
            if !channels.is_empty() {
                debug!(count = channels.len(), "resubscribing channels");
                let _ = outgoing.send(ClientFrame::Subscribe { channels }.to_json());
            }
            core.outbound = Some(outgoing.clone());
            self.set_state(ConnectionState::Connected);
        }
        self.metrics.connected();
        info!("channel connected");

        let period = self.settings.heartbeat_interval;
        let mut heartbeat = tokio::time::interval_at(tokio::time::Instant::now() + period, period);

        let end = loop {
            tokio::select! {
                _ = cancel.cancelled() => break SessionEnd::Cancelled,
                _ = heartbeat.tick() => {
                    if outgoing.send(ClientFrame::Ping.to_json()).is_err() {
                        break SessionEnd::Abnormal;
                    }
                    self.metrics.heartbeat_sent();
                }
                event = incoming.recv() => match event {
                    Some(LinkEvent::Text(text)) => self.dispatch(&text, &outgoing),
                    Some(LinkEvent::Closed { code: Some(NORMAL_CLOSURE) }) => break SessionEnd::Normal,
                    Some(LinkEvent::Closed { .. }) | None => break SessionEnd::Abnormal,
                },
            }
        };

        self.core().outbound = None;
        close.cancel();
        end
    }

    fn dispatch(&self, text: &str, outgoing: &mpsc::UnboundedSender<String>) {
        let frame = match InboundFrame::parse(text) {
            Ok(frame) => frame,
            Err(e) => {
                self.metrics.frame_malformed();
                warn!(error = %e, "dropping malformed frame");
                return;
            }
        };

        if frame.is_ping() {
            let _ = outgoing.send(ClientFrame::Pong.to_json());
            return;
        }
        if frame.is_pong() {
            debug!("pong received");
            return;
        }

        self.metrics.frame_dispatched();
        if let Some(channel) = frame.channel.as_deref() {
            // Snapshot handlers so they may (un)subscribe without deadlocking
            let handlers = self.core().registry.handlers_for(channel);
            for handler in handlers {
                if catch_unwind(AssertUnwindSafe(|| handler(&frame))).is_err() {
                    self.metrics.handler_panicked();
                    warn!(channel = %channel, "frame handler panicked");
                }
            }
        }
        let _ = self.frames.send(frame);
    }
}
