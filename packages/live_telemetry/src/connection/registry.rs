//! Reference-counted channel registry.
//!
//! Pure bookkeeping for the connection manager: which handlers listen on
//! which channel, and whether a registration change must reach the
//! transport. A channel is announced to the server when its first handler
//! arrives and withdrawn when its last handler leaves.

use std::collections::BTreeMap;
use std::sync::Arc;

use super::protocol::InboundFrame;

/// Callback invoked for every frame on a subscribed channel.
pub type FrameHandler = Arc<dyn Fn(&InboundFrame) + Send + Sync>;

/// Opaque token returned by `subscribe`, consumed by `unsubscribe`.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct SubscriptionHandle {
    id: u64,
    channel: String,
}

impl SubscriptionHandle {
    pub fn channel(&self) -> &str {
        &self.channel
    }
}

struct Registration {
    id: u64,
    handler: FrameHandler,
}

/// Outcome of a registry mutation, as far as the transport is concerned.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransportChange {
    /// First holder: the channel must be subscribed on the transport.
    Subscribe(String),
    /// Last holder left: the channel must be unsubscribed on the transport.
    Unsubscribe(String),
    /// Shared channel, nothing to send.
    None,
}

#[derive(Default)]
pub struct ChannelRegistry {
    channels: BTreeMap<String, Vec<Registration>>,
    next_id: u64,
}

impl ChannelRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(
        &mut self,
        channel: &str,
        handler: FrameHandler,
    ) -> (SubscriptionHandle, TransportChange) {
        self.next_id += 1;
        let id = self.next_id;
        let holders = self.channels.entry(channel.to_string()).or_default();
        holders.push(Registration { id, handler });

        let change = if holders.len() == 1 {
            TransportChange::Subscribe(channel.to_string())
        } else {
            TransportChange::None
        };
        let handle = SubscriptionHandle {
            id,
            channel: channel.to_string(),
        };
        (handle, change)
    }

    /// Remove one registration. Unknown or already-removed handles are a no-op.
    pub fn unregister(&mut self, handle: &SubscriptionHandle) -> TransportChange {
        let Some(holders) = self.channels.get_mut(&handle.channel) else {
            return TransportChange::None;
        };
        let before = holders.len();
        holders.retain(|r| r.id != handle.id);
        if holders.len() == before {
            return TransportChange::None;
        }
        if holders.is_empty() {
            self.channels.remove(&handle.channel);
            TransportChange::Unsubscribe(handle.channel.clone())
        } else {
            TransportChange::None
        }
    }

    /// Handlers for a channel, in registration order.
    pub fn handlers_for(&self, channel: &str) -> Vec<FrameHandler> {
        self.channels
            .get(channel)
            .map(|holders| holders.iter().map(|r| r.handler.clone()).collect())
            .unwrap_or_default()
    }

    /// Every channel with at least one holder, each exactly once.
    pub fn channels(&self) -> Vec<String> {
        self.channels.keys().cloned().collect()
    }

    pub fn holder_count(&self, channel: &str) -> usize {
        self.channels.get(channel).map(Vec::len).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.channels.is_empty()
    }

    pub fn clear(&mut self) {
        self.channels.clear();
    }
}
