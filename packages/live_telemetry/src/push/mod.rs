//! Resumable push feeds (Server-Sent Events).
//!
//! - `sse`: incremental wire parser
//! - `source`: `PushSource` seam, HTTP and in-memory sources
//! - `driver`: reopen loop with `Last-Event-ID` resume

mod driver;
pub mod source;
pub mod sse;
#[cfg(test)]
mod test_server;

use serde::{Deserialize, Serialize};

pub use driver::{DriveEnd, Flow, PushDriver};
pub use source::{
    HttpPushSource, MemoryPushSource, PushConnection, PushRequest, PushSource, PushStream,
};
pub use sse::{SseItem, SseMessage, SseParser};

/// Transport status of a push-feed client.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StreamStatus {
    /// Disabled or not started.
    Idle,
    Connecting,
    Open,
    Error,
    /// Ended for good after a terminal frame.
    Closed,
}

impl StreamStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Idle => "idle",
            Self::Connecting => "connecting",
            Self::Open => "open",
            Self::Error => "error",
            Self::Closed => "closed",
        }
    }
}

impl std::fmt::Display for StreamStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}
