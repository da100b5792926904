//! Scripted HTTP/1.1 server for exercising [`HttpPushSource`] over a real
//! socket.
//!
//! [`HttpPushSource`]: super::HttpPushSource

use std::sync::{Arc, Mutex};

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};

/// How the server answers one accepted connection.
pub(crate) enum Reply {
    /// Stream the body, then end the response cleanly with EOF.
    Complete(&'static str),
    /// Send the body as a chunk, then drop the socket inside the next chunk.
    Truncated(&'static str),
    /// Send the body as a chunk and keep the connection open.
    Held(&'static str),
    /// Answer with this status and no body.
    Status(u16),
}

const SSE_CHUNKED: &str = "HTTP/1.1 200 OK\r\n\
    content-type: text/event-stream\r\n\
    transfer-encoding: chunked\r\n\r\n";

pub(crate) struct TestServer {
    pub url: String,
    requests: Arc<Mutex<Vec<String>>>,
}

impl TestServer {
    /// Answer one connection per reply, in order.
    pub async fn start(replies: Vec<Reply>) -> Self {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let requests = Arc::new(Mutex::new(Vec::new()));

        let log = requests.clone();
        tokio::spawn(async move {
            for reply in replies {
                let Ok((mut socket, _)) = listener.accept().await else {
                    return;
                };
                let head = read_head(&mut socket).await;
                log.lock().unwrap().push(head.to_ascii_lowercase());
                tokio::spawn(answer(socket, reply));
            }
        });

        Self {
            url: format!("http://{addr}/events"),
            requests,
        }
    }

    /// Request heads received so far, lowercased.
    pub fn requests(&self) -> Vec<String> {
        self.requests.lock().unwrap().clone()
    }
}

async fn read_head(socket: &mut TcpStream) -> String {
    let mut head = Vec::new();
    let mut buf = [0u8; 1024];
    while !head.windows(4).any(|w| w == b"\r\n\r\n") {
        match socket.read(&mut buf).await {
            Ok(0) | Err(_) => break,
            Ok(n) => head.extend_from_slice(&buf[..n]),
        }
    }
    String::from_utf8_lossy(&head).into_owned()
}

fn chunk(body: &str) -> String {
    format!("{:x}\r\n{body}\r\n", body.len())
}

async fn answer(mut socket: TcpStream, reply: Reply) {
    match reply {
        Reply::Complete(body) => {
            let response = format!(
                "HTTP/1.1 200 OK\r\ncontent-type: text/event-stream\r\nconnection: close\r\n\r\n{body}"
            );
            let _ = socket.write_all(response.as_bytes()).await;
            let _ = socket.shutdown().await;
        }
        Reply::Truncated(body) => {
            // Announces 64 bytes, delivers a handful.
            let response = format!("{SSE_CHUNKED}{}40\r\ndata: cut", chunk(body));
            let _ = socket.write_all(response.as_bytes()).await;
            let _ = socket.shutdown().await;
        }
        Reply::Held(body) => {
            let response = format!("{SSE_CHUNKED}{}", chunk(body));
            let _ = socket.write_all(response.as_bytes()).await;
            std::future::pending::<()>().await;
        }
        Reply::Status(status) => {
            let response = format!(
                "HTTP/1.1 {status} Rejected\r\nconnection: close\r\n\r\n"
            );
            let _ = socket.write_all(response.as_bytes()).await;
            let _ = socket.shutdown().await;
        }
    }
}
