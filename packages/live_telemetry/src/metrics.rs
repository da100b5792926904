//! Client-side streaming metrics
//!
//! Counters shared by every streaming component of a session, so the host
//! application can report how healthy its live connections are.

use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Instant;

/// Session-wide streaming metrics
#[derive(Debug, Default)]
pub struct StreamMetrics {
    // Channel connection
    /// Successful transport opens (first connect and reconnects)
    pub connects: AtomicU64,
    /// Reconnect attempts scheduled after an abnormal close or a failed connect
    pub reconnect_attempts: AtomicU64,

    // Frames
    /// Inbound frames dispatched to at least the global listener
    pub frames_dispatched: AtomicU64,
    /// Frames dropped because they could not be decoded
    pub frames_malformed: AtomicU64,
    /// Handlers that panicked during dispatch
    pub handler_panics: AtomicU64,
    /// Heartbeats sent
    pub heartbeats_sent: AtomicU64,

    // Push feeds
    /// Push events delivered to a sink
    pub push_events: AtomicU64,
    /// Push transport errors (each one is followed by an automatic retry)
    pub push_errors: AtomicU64,

    // Polling
    /// Log polls issued
    pub polls_issued: AtomicU64,
    /// Log polls that failed
    pub polls_failed: AtomicU64,

    start_time: Option<Instant>,
}

impl StreamMetrics {
    pub fn new() -> Self {
        Self {
            start_time: Some(Instant::now()),
            ..Default::default()
        }
    }

    pub fn connected(&self) {
        self.connects.fetch_add(1, Ordering::Relaxed);
    }

    pub fn reconnect_scheduled(&self) {
        self.reconnect_attempts.fetch_add(1, Ordering::Relaxed);
    }

    pub fn frame_dispatched(&self) {
        self.frames_dispatched.fetch_add(1, Ordering::Relaxed);
    }

    pub fn frame_malformed(&self) {
        self.frames_malformed.fetch_add(1, Ordering::Relaxed);
    }

    pub fn handler_panicked(&self) {
        self.handler_panics.fetch_add(1, Ordering::Relaxed);
    }

    pub fn heartbeat_sent(&self) {
        self.heartbeats_sent.fetch_add(1, Ordering::Relaxed);
    }

    pub fn push_event(&self) {
        self.push_events.fetch_add(1, Ordering::Relaxed);
    }

    pub fn push_error(&self) {
        self.push_errors.fetch_add(1, Ordering::Relaxed);
    }

    pub fn poll_issued(&self) {
        self.polls_issued.fetch_add(1, Ordering::Relaxed);
    }

    pub fn poll_failed(&self) {
        self.polls_failed.fetch_add(1, Ordering::Relaxed);
    }

    /// Get uptime in seconds
    pub fn uptime_secs(&self) -> u64 {
        self.start_time.map(|t| t.elapsed().as_secs()).unwrap_or(0)
    }

    /// Create a snapshot of all metrics
    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            uptime_secs: self.uptime_secs(),
            connection: ConnectionMetrics {
                connects: self.connects.load(Ordering::Relaxed),
                reconnect_attempts: self.reconnect_attempts.load(Ordering::Relaxed),
                heartbeats_sent: self.heartbeats_sent.load(Ordering::Relaxed),
            },
            frames: FrameMetrics {
                dispatched: self.frames_dispatched.load(Ordering::Relaxed),
                malformed: self.frames_malformed.load(Ordering::Relaxed),
                handler_panics: self.handler_panics.load(Ordering::Relaxed),
            },
            push: PushMetrics {
                events: self.push_events.load(Ordering::Relaxed),
                errors: self.push_errors.load(Ordering::Relaxed),
            },
            polling: PollMetrics {
                issued: self.polls_issued.load(Ordering::Relaxed),
                failed: self.polls_failed.load(Ordering::Relaxed),
            },
        }
    }
}

/// Serializable snapshot of metrics
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MetricsSnapshot {
    pub uptime_secs: u64,
    pub connection: ConnectionMetrics,
    pub frames: FrameMetrics,
    pub push: PushMetrics,
    pub polling: PollMetrics,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConnectionMetrics {
    pub connects: u64,
    pub reconnect_attempts: u64,
    pub heartbeats_sent: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FrameMetrics {
    pub dispatched: u64,
    pub malformed: u64,
    pub handler_panics: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PushMetrics {
    pub events: u64,
    pub errors: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PollMetrics {
    pub issued: u64,
    pub failed: u64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_frame_tracking() {
        let metrics = StreamMetrics::new();

        metrics.frame_dispatched();
        metrics.frame_dispatched();
        metrics.frame_malformed();
        assert_eq!(metrics.frames_dispatched.load(Ordering::Relaxed), 2);
        assert_eq!(metrics.frames_malformed.load(Ordering::Relaxed), 1);
    }

    #[test]
    fn test_snapshot() {
        let metrics = StreamMetrics::new();
        metrics.connected();
        metrics.reconnect_scheduled();
        metrics.poll_issued();
        metrics.poll_failed();
        metrics.push_event();

        let snapshot = metrics.snapshot();
        assert_eq!(snapshot.connection.connects, 1);
        assert_eq!(snapshot.connection.reconnect_attempts, 1);
        assert_eq!(snapshot.polling.issued, 1);
        assert_eq!(snapshot.polling.failed, 1);
        assert_eq!(snapshot.push.events, 1);
    }

    #[test]
    fn test_snapshot_serializes() {
        let json = serde_json::to_value(StreamMetrics::new().snapshot()).unwrap();
        assert_eq!(json["frames"]["dispatched"], 0);
    }
}
