//! WebSocket connector built on tokio-tungstenite.

use futures::future::BoxFuture;
use futures::{SinkExt, StreamExt};
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::{self, Message};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};

use super::transport::{Connector, Link, LinkEvent};
use crate::error::StreamError;

#[derive(Debug, Clone)]
pub struct WebSocketConnector {
    url: String,
}

impl WebSocketConnector {
    pub fn new(url: impl Into<String>) -> Self {
        Self { url: url.into() }
    }

    pub fn url(&self) -> &str {
        &self.url
    }
}

impl Connector for WebSocketConnector {
    fn connect(&self) -> BoxFuture<'static, Result<Link, StreamError>> {
        let url = self.url.clone();
        Box::pin(async move {
            let (ws_stream, _) = tokio_tungstenite::connect_async(url.as_str()).await?;
            info!(url = %url, "websocket connected");
            let (mut ws_write, mut ws_read) = ws_stream.split();

            let (out_tx, mut out_rx) = mpsc::unbounded_channel::<String>();
            let (in_tx, in_rx) = mpsc::unbounded_channel::<LinkEvent>();
            let close = CancellationToken::new();

            // Writer: drain outgoing frames into the socket
            let writer_close = close.clone();
            tokio::spawn(async move {
                loop {
                    tokio::select! {
                        _ = writer_close.cancelled() => break,
                        msg = out_rx.recv() => {
                            match msg {
                                Some(text) => {
                                    if let Err(e) = ws_write.send(Message::Text(text.into())).await {
                                        error!("websocket write error: {}", e);
                                        break;
                                    }
                                }
                                None => break,
                            }
                        }
                    }
                }
                let _ = ws_write.send(Message::Close(None)).await;
                writer_close.cancel();
            });

            // Reader: socket frames into the incoming channel
            let reader_close = close.clone();
            tokio::spawn(async move {
                loop {
                    tokio::select! {
                        _ = reader_close.cancelled() => break,
                        msg = ws_read.next() => {
                            match msg {
                                Some(Ok(Message::Text(text))) => {
                                    if in_tx.send(LinkEvent::Text(text.to_string())).is_err() {
                                        break;
                                    }
                                }
                                Some(Ok(Message::Close(frame))) => {
                                    let code = frame.map(|f| u16::from(f.code));
                                    debug!(?code, "websocket closed by peer");
                                    let _ = in_tx.send(LinkEvent::Closed { code });
                                    break;
                                }
                                Some(Ok(Message::Binary(_))) => {
                                    debug!("binary frames not supported, ignored");
                                }
                                // tungstenite answers protocol pings itself
                                Some(Ok(_)) => {}
                                Some(Err(tungstenite::Error::ConnectionClosed)) | None => break,
                                Some(Err(e)) => {
                                    error!("websocket read error: {}", e);
                                    break;
                                }
                            }
                        }
                    }
                }
                reader_close.cancel();
            });

            Ok(Link {
                outgoing: out_tx,
                incoming: in_rx,
                close,
            })
        })
    }
}
