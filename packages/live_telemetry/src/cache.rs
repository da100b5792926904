//! Query-cache collaborator.
//!
//! The streaming layer never owns domain caches. It tells the host's cache
//! which keys went stale through [`CacheInvalidator`], and the host decides
//! how to refetch.

use std::fmt;
use std::sync::{Arc, Mutex};

use crate::connection::{ConnectionManager, InboundFrame, SubscriptionHandle};

/// Hierarchical cache key, e.g. `["execution", "exec-7"]`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct CacheKey(Vec<String>);

impl CacheKey {
    pub fn new<I, S>(parts: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self(parts.into_iter().map(Into::into).collect())
    }

    /// Detail/metadata of one execution.
    pub fn execution(id: &str) -> Self {
        Self::new(["execution", id])
    }

    pub fn run(id: &str) -> Self {
        Self::new(["run", id])
    }

    pub fn protocol(id: &str) -> Self {
        Self::new(["protocol", id])
    }

    pub fn step(id: &str) -> Self {
        Self::new(["step", id])
    }

    pub fn parts(&self) -> &[String] {
        &self.0
    }

    /// Whether `self` equals `prefix` or lies beneath it.
    pub fn starts_with(&self, prefix: &CacheKey) -> bool {
        self.0.starts_with(&prefix.0)
    }
}

impl fmt::Display for CacheKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0.join("/"))
    }
}

pub trait CacheInvalidator: Send + Sync {
    fn invalidate(&self, key: &CacheKey);
}

/// Invalidator for hosts without a cache.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopInvalidator;

impl CacheInvalidator for NoopInvalidator {
    fn invalidate(&self, _key: &CacheKey) {}
}

/// Records every invalidation in order. Handy for hosts that batch refetches
/// and for tests.
#[derive(Debug, Default)]
pub struct RecordingInvalidator {
    keys: Mutex<Vec<CacheKey>>,
}

impl RecordingInvalidator {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn keys(&self) -> Vec<CacheKey> {
        self.keys.lock().map(|k| k.clone()).unwrap_or_default()
    }

    /// Return and forget everything recorded so far.
    pub fn drain(&self) -> Vec<CacheKey> {
        self.keys
            .lock()
            .map(|mut k| std::mem::take(&mut *k))
            .unwrap_or_default()
    }
}

impl CacheInvalidator for RecordingInvalidator {
    fn invalidate(&self, key: &CacheKey) {
        if let Ok(mut keys) = self.keys.lock() {
            keys.push(key.clone());
        }
    }
}

/// Subscribe to `channel` and invalidate the keys `keys_for` derives from
/// each frame. Unsubscribe with the returned handle.
pub fn invalidate_on_channel<F>(
    manager: &ConnectionManager,
    channel: &str,
    invalidator: Arc<dyn CacheInvalidator>,
    keys_for: F,
) -> SubscriptionHandle
where
    F: Fn(&InboundFrame) -> Vec<CacheKey> + Send + Sync + 'static,
{
    manager.subscribe(channel, move |frame| {
        for key in keys_for(frame) {
            invalidator.invalidate(&key);
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn key_display_and_prefix() {
        let key = CacheKey::execution("exec-7");
        assert_eq!(key.to_string(), "execution/exec-7");
        assert!(key.starts_with(&CacheKey::new(["execution"])));
        assert!(!key.starts_with(&CacheKey::new(["run"])));
    }

    #[test]
    fn recording_invalidator_keeps_order() {
        let inv = RecordingInvalidator::new();
        inv.invalidate(&CacheKey::run("1"));
        inv.invalidate(&CacheKey::step("2"));
        assert_eq!(inv.keys(), vec![CacheKey::run("1"), CacheKey::step("2")]);
        assert_eq!(inv.drain().len(), 2);
        assert!(inv.keys().is_empty());
    }

    #[tokio::test]
    async fn channel_frames_invalidate_derived_keys() {
        use crate::config::ConnectionSettings;
        use crate::connection::MemoryConnector;
        use std::time::Duration;

        let (connector, mut accept) = MemoryConnector::new();
        let manager = ConnectionManager::new(connector, ConnectionSettings::default());
        let inv = Arc::new(RecordingInvalidator::new());
        invalidate_on_channel(&manager, "protocol:3", inv.clone(), |frame| {
            vec![CacheKey::protocol(
                frame.channel.as_deref().unwrap_or("").trim_start_matches("protocol:"),
            )]
        });

        manager.connect();
        let mut server = accept.recv().await.unwrap();
        server.from_client.recv().await.unwrap();

        let mut frames = manager.frames();
        server.send_text(r#"{"type":"protocol_updated","channel":"protocol:3"}"#);
        tokio::time::timeout(Duration::from_secs(2), frames.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(inv.keys(), vec![CacheKey::protocol("3")]);
    }
}
