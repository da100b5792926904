//! Multiplexed channel connection.
//!
//! - `protocol`: client/server frame types
//! - `registry`: reference-counted channel → handler bookkeeping
//! - `backoff`: reconnect delay schedule
//! - `transport`: `Connector` seam and the in-memory connector
//! - `websocket`: tokio-tungstenite connector
//! - `manager`: the process-wide `ConnectionManager`

mod backoff;
mod manager;
pub mod protocol;
mod registry;
pub mod transport;
mod websocket;

pub use backoff::Backoff;
pub use manager::{ConnectionManager, ConnectionState};
pub use protocol::{ClientFrame, InboundFrame, channels};
pub use registry::{ChannelRegistry, FrameHandler, SubscriptionHandle, TransportChange};
pub use transport::{Connector, Link, LinkEvent, MemoryConnector, ServerEnd};
pub use websocket::WebSocketConnector;
