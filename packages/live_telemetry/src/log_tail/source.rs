//! Offset-addressable log resource.

use std::sync::{Arc, Mutex};

use futures::future::BoxFuture;
use serde::{Deserialize, Serialize};

use crate::config::Endpoints;
use crate::error::StreamError;
use crate::lock;

/// One delta read: everything after the requested offset, and the cursor to
/// ask from next time.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LogChunk {
    #[serde(default)]
    pub chunk: String,
    pub next_offset: u64,
}

pub trait LogSource: Send + Sync + 'static {
    fn fetch(
        &self,
        subject: &str,
        offset: u64,
    ) -> BoxFuture<'static, Result<LogChunk, StreamError>>;
}

/// `GET {log url}?offset=N` returning `{chunk, next_offset}`.
#[derive(Debug, Clone)]
pub struct HttpLogSource {
    client: reqwest::Client,
    endpoints: Endpoints,
}

impl HttpLogSource {
    pub fn new(client: reqwest::Client, endpoints: Endpoints) -> Self {
        Self { client, endpoints }
    }
}

impl LogSource for HttpLogSource {
    fn fetch(
        &self,
        subject: &str,
        offset: u64,
    ) -> BoxFuture<'static, Result<LogChunk, StreamError>> {
        let request = self
            .client
            .get(self.endpoints.log_url(subject))
            .query(&[("offset", offset)]);
        Box::pin(async move {
            let response = request.send().await?;
            let status = response.status();
            if !status.is_success() {
                return Err(StreamError::Http {
                    status: status.as_u16(),
                });
            }
            let body = response.text().await?;
            Ok(serde_json::from_str(&body)?)
        })
    }
}

#[derive(Debug, Default)]
struct MemoryLog {
    text: String,
    failures: u32,
    requests: Vec<(String, u64)>,
}

/// A log held in memory. Offsets count characters. Every subject reads the
/// same text; requests are recorded for inspection.
#[derive(Debug, Clone, Default)]
pub struct MemoryLogSource {
    log: Arc<Mutex<MemoryLog>>,
}

impl MemoryLogSource {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_text(text: &str) -> Self {
        let source = Self::new();
        source.append(text);
        source
    }

    pub fn append(&self, text: &str) {
        lock(&self.log).text.push_str(text);
    }

    /// Make the next `n` fetches fail with a transient error.
    pub fn fail_next(&self, n: u32) {
        lock(&self.log).failures = n;
    }

    /// `(subject, offset)` of every fetch so far, in order.
    pub fn requests(&self) -> Vec<(String, u64)> {
        lock(&self.log).requests.clone()
    }
}

impl LogSource for MemoryLogSource {
    fn fetch(
        &self,
        subject: &str,
        offset: u64,
    ) -> BoxFuture<'static, Result<LogChunk, StreamError>> {
        let result = {
            let mut log = lock(&self.log);
            log.requests.push((subject.to_string(), offset));
            if log.failures > 0 {
                log.failures -= 1;
                Err(StreamError::Http { status: 502 })
            } else {
                let end = log.text.chars().count() as u64;
                let chunk = if offset >= end {
                    String::new()
                } else {
                    log.text.chars().skip(offset as usize).collect()
                };
                Ok(LogChunk {
                    chunk,
                    next_offset: end,
                })
            }
        };
        Box::pin(async move { result })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn memory_source_reads_deltas() {
        let source = MemoryLogSource::with_text("abc");
        let end = source.fetch("run-1", 999_999).await.unwrap();
        assert_eq!(
            end,
            LogChunk {
                chunk: String::new(),
                next_offset: 3
            }
        );

        source.append("de");
        let delta = source.fetch("run-1", 3).await.unwrap();
        assert_eq!(
            delta,
            LogChunk {
                chunk: "de".into(),
                next_offset: 5
            }
        );
        assert_eq!(
            source.requests(),
            vec![("run-1".to_string(), 999_999), ("run-1".to_string(), 3)]
        );
    }

    #[tokio::test]
    async fn memory_source_failures_are_transient() {
        let source = MemoryLogSource::new();
        source.fail_next(1);
        assert!(source.fetch("s", 0).await.unwrap_err().is_transient());
        assert!(source.fetch("s", 0).await.is_ok());
    }

    #[test]
    fn chunk_defaults_to_empty() {
        let chunk: LogChunk = serde_json::from_str(r#"{"next_offset":12}"#).unwrap();
        assert_eq!(chunk.chunk, "");
        assert_eq!(chunk.next_offset, 12);
    }

    #[tokio::test]
    async fn http_source_refused_is_transient() {
        let endpoints = Endpoints::from_file(&crate::config::ServerFileConfig {
            base_url: "http://127.0.0.1:1".into(),
            ..Default::default()
        });
        let source = HttpLogSource::new(reqwest::Client::new(), endpoints);
        let err = source.fetch("run-42", 0).await.unwrap_err();
        assert!(err.is_transient(), "got {err}");
    }
}
