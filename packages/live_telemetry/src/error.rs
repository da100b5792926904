use thiserror::Error;
use tokio_tungstenite::tungstenite;

/// Errors produced inside the streaming layer.
///
/// None of these reach a renderer during steady-state streaming: components
/// log them and fold them into their status field. They surface as `Err` only
/// from construction, config loading and explicit I/O such as log download.
#[derive(Debug, Error)]
pub enum StreamError {
    #[error("transport error: {0}")]
    Transport(String),

    #[error("server responded with status {status}")]
    Http { status: u16 },

    #[error("request failed: {0}")]
    Request(#[from] reqwest::Error),

    #[error("malformed payload: {0}")]
    Malformed(String),

    #[error("websocket error: {0}")]
    WebSocket(#[from] tungstenite::Error),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("link closed")]
    Closed,
}

impl From<serde_json::Error> for StreamError {
    fn from(err: serde_json::Error) -> Self {
        Self::Malformed(err.to_string())
    }
}

impl StreamError {
    /// Whether retrying the same operation later can reasonably succeed.
    ///
    /// Connection-level failures, bodies cut off mid-read and 5xx/429
    /// responses are transient; a malformed payload or a 4xx response will
    /// fail the same way again.
    pub fn is_transient(&self) -> bool {
        match self {
            Self::Transport(_) | Self::Closed | Self::Io(_) => true,
            Self::Http { status } => *status >= 500 || *status == 429,
            Self::Request(err) => {
                err.is_connect()
                    || err.is_timeout()
                    || err.is_request()
                    || err.is_body()
                    || err.is_decode()
            }
            Self::WebSocket(err) => match err {
                tungstenite::Error::Io(io_err) => matches!(
                    io_err.kind(),
                    std::io::ErrorKind::ConnectionRefused
                        | std::io::ErrorKind::ConnectionReset
                        | std::io::ErrorKind::ConnectionAborted
                ),
                tungstenite::Error::ConnectionClosed | tungstenite::Error::AlreadyClosed => true,
                _ => false,
            },
            Self::Malformed(_) => false,
        }
    }
}

pub type Result<T, E = StreamError> = std::result::Result<T, E>;
