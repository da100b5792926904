//! Channel protocol frames
//!
//! Wire types for the multiplexed bidirectional channel. Frames are JSON text
//! messages tagged by `type`.

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Frames the client sends to the server.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ClientFrame {
    Ping,
    Pong,
    Subscribe { channels: Vec<String> },
    Unsubscribe { channels: Vec<String> },
    Message { channel: String, payload: Value },
}

impl ClientFrame {
    pub fn to_json(&self) -> String {
        // Every variant is a plain struct of strings and JSON values.
        serde_json::to_string(self).unwrap_or_else(|_| String::from(r#"{"type":"ping"}"#))
    }
}

/// Frames the server sends to the client.
///
/// `type` is kept as an open string: only `ping` and `pong` are interpreted by
/// the manager, every other type is routed by `channel` untouched.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InboundFrame {
    #[serde(rename = "type")]
    pub frame_type: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub channel: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub payload: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<Value>,
    #[serde(
        default,
        rename = "ts",
        alias = "timestamp",
        skip_serializing_if = "Option::is_none"
    )]
    pub timestamp: Option<Value>,
}

impl InboundFrame {
    pub fn parse(text: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(text)
    }

    pub fn is_ping(&self) -> bool {
        self.frame_type == "ping"
    }

    pub fn is_pong(&self) -> bool {
        self.frame_type == "pong"
    }
}

/// Well-known channel names.
pub mod channels {
    pub const EVENTS: &str = "events";
    pub const AGENTS: &str = "agents";

    pub fn protocol(id: &str) -> String {
        format!("protocol:{id}")
    }

    pub fn step(id: &str) -> String {
        format!("step:{id}")
    }
}
