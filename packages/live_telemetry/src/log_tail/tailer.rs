//! Log Tailer: follow the end of one subject's log.
//!
//! Attaching seeks to the end first (an offset no real log reaches) so the
//! history is not replayed, then polls deltas at a fixed interval while the
//! surface is visible. Every tick reads the offset from the published state,
//! and a generation counter discards responses that land after the subject
//! changed or the tailer jumped to the end.

use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use serde::{Deserialize, Serialize};
use tokio::sync::watch;
use tracing::{debug, info, warn};

use super::buffer::LogBuffer;
use super::source::LogSource;
use crate::config::TailSettings;
use crate::error::StreamError;
use crate::lock;
use crate::metrics::StreamMetrics;
use crate::poller::Poller;
use crate::visibility::VisibilityWatch;

/// Offset used to ask the server where the log currently ends.
pub const SEEK_TO_END: u64 = 999_999_999_999;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TailStatus {
    Connected,
    Disconnected,
    Error,
}

impl TailStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Connected => "connected",
            Self::Disconnected => "disconnected",
            Self::Error => "error",
        }
    }
}

impl std::fmt::Display for TailStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LogTailState {
    pub buffer: LogBuffer,
    /// Exclusive end of what has been consumed from the server. Only grows
    /// while a subject is attached.
    pub offset: u64,
    pub connection_status: TailStatus,
    pub is_streaming: bool,
}

impl LogTailState {
    fn new(max_chars: usize) -> Self {
        Self {
            buffer: LogBuffer::new(max_chars),
            offset: 0,
            connection_status: TailStatus::Disconnected,
            is_streaming: false,
        }
    }
}

struct Cursor {
    subject: Option<String>,
    generation: u64,
    needs_seek: bool,
}

struct Inner {
    source: Arc<dyn LogSource>,
    metrics: Arc<StreamMetrics>,
    state: watch::Sender<LogTailState>,
    cursor: Mutex<Cursor>,
}

pub struct LogTailer {
    inner: Arc<Inner>,
    settings: TailSettings,
    visibility: VisibilityWatch,
    poller: Mutex<Option<Poller>>,
}

impl LogTailer {
    pub fn new(
        source: Arc<dyn LogSource>,
        settings: TailSettings,
        visibility: VisibilityWatch,
    ) -> Self {
        Self::with_metrics(source, settings, visibility, Arc::new(StreamMetrics::new()))
    }

    pub fn with_metrics(
        source: Arc<dyn LogSource>,
        settings: TailSettings,
        visibility: VisibilityWatch,
        metrics: Arc<StreamMetrics>,
    ) -> Self {
        let (state, _) = watch::channel(LogTailState::new(settings.max_buffer_chars));
        Self {
            inner: Arc::new(Inner {
                source,
                metrics,
                state,
                cursor: Mutex::new(Cursor {
                    subject: None,
                    generation: 0,
                    needs_seek: false,
                }),
            }),
            settings,
            visibility,
            poller: Mutex::new(None),
        }
    }

    /// Attach to `subject`: reset state, seek to the end of its log and start
    /// polling. Anything still in flight for a previous subject is ignored.
    ///
    /// Must be called from within a tokio runtime.
    pub async fn start(&self, subject: &str) {
        self.stop_polling();
        let generation = {
            let mut cursor = lock(&self.inner.cursor);
            cursor.subject = Some(subject.to_string());
            cursor.generation += 1;
            cursor.needs_seek = true;
            let max_chars = self.settings.max_buffer_chars;
            self.inner.state.send_modify(|s| {
                *s = LogTailState::new(max_chars);
                s.is_streaming = true;
            });
            cursor.generation
        };
        info!(subject, "log tail attached");

        self.inner.tick().await;
        self.resume_after_seek(generation);
    }

    /// Stop polling. Buffer and offset are kept.
    pub fn pause(&self) {
        self.stop_polling();
        self.inner.state.send_if_modified(|s| {
            let changed = s.is_streaming;
            s.is_streaming = false;
            changed
        });
        debug!(subject = ?self.subject(), "log tail paused");
    }

    /// Resume polling from the current offset.
    pub fn resume(&self) {
        if self.subject().is_none() || self.is_streaming() {
            return;
        }
        self.inner.state.send_modify(|s| s.is_streaming = true);
        self.spawn_poller();
        debug!(subject = ?self.subject(), "log tail resumed");
    }

    /// Drop the buffer, seek to the current end of the log again and stream
    /// from there.
    pub async fn jump_to_end(&self) {
        self.stop_polling();
        let generation = {
            let mut cursor = lock(&self.inner.cursor);
            if cursor.subject.is_none() {
                return;
            }
            cursor.generation += 1;
            cursor.needs_seek = true;
            self.inner.state.send_modify(|s| {
                s.buffer.clear();
                s.is_streaming = true;
            });
            cursor.generation
        };
        self.inner.tick().await;
        self.resume_after_seek(generation);
    }

    /// Empty the buffer. Polling continues from the current offset.
    pub fn clear(&self) {
        self.inner.state.send_modify(|s| s.buffer.clear());
    }

    /// Write the buffer to `<dir>/<subject>.log` and return the path.
    pub async fn download(&self, dir: &Path) -> Result<PathBuf, StreamError> {
        let subject = self.subject().ok_or_else(|| {
            std::io::Error::new(std::io::ErrorKind::NotFound, "no log subject attached")
        })?;
        let path = dir.join(format!("{}.log", file_stem(&subject)));
        tokio::fs::write(&path, self.text()).await?;
        info!(subject = %subject, path = %path.display(), "log buffer saved");
        Ok(path)
    }

    /// Detach: stop polling and ignore anything still in flight.
    pub fn stop(&self) {
        self.stop_polling();
        let mut cursor = lock(&self.inner.cursor);
        cursor.generation += 1;
        cursor.subject = None;
        self.inner.state.send_modify(|s| {
            s.is_streaming = false;
            s.connection_status = TailStatus::Disconnected;
        });
    }

    pub fn text(&self) -> String {
        self.inner.state.borrow().buffer.as_str().to_string()
    }

    pub fn offset(&self) -> u64 {
        self.inner.state.borrow().offset
    }

    pub fn is_streaming(&self) -> bool {
        self.inner.state.borrow().is_streaming
    }

    pub fn subject(&self) -> Option<String> {
        lock(&self.inner.cursor).subject.clone()
    }

    pub fn state(&self) -> LogTailState {
        self.inner.state.borrow().clone()
    }

    pub fn subscribe_state(&self) -> watch::Receiver<LogTailState> {
        self.inner.state.subscribe()
    }

    fn spawn_poller(&self) {
        let inner = self.inner.clone();
        let poller = Poller::spawn(self.settings.poll_interval, self.visibility.clone(), move || {
            let inner = inner.clone();
            async move { inner.tick().await }
        });
        // The replaced poller, if any, cancels on drop.
        *lock(&self.poller) = Some(poller);
    }

    /// Start polling after an end-seek unless the tailer was detached,
    /// re-attached or paused while the seek was in flight.
    fn resume_after_seek(&self, generation: u64) {
        let current = lock(&self.inner.cursor).generation == generation;
        if current && self.is_streaming() {
            self.spawn_poller();
        }
    }

    fn stop_polling(&self) {
        if let Some(poller) = lock(&self.poller).take() {
            poller.cancel();
        }
    }
}

impl Drop for LogTailer {
    fn drop(&mut self) {
        self.stop_polling();
    }
}

impl Inner {
    /// One request: the end-seek while one is pending, a delta read
    /// otherwise.
    async fn tick(&self) {
        let (subject, generation, seek) = {
            let cursor = lock(&self.cursor);
            match &cursor.subject {
                Some(subject) => (subject.clone(), cursor.generation, cursor.needs_seek),
                None => return,
            }
        };
        let offset = if seek {
            SEEK_TO_END
        } else {
            self.state.borrow().offset
        };

        self.metrics.poll_issued();
        let result = self.source.fetch(&subject, offset).await;

        let mut cursor = lock(&self.cursor);
        if cursor.generation != generation {
            debug!(subject = %subject, offset, "stale log response ignored");
            return;
        }
        match result {
            Ok(chunk) => {
                if seek {
                    cursor.needs_seek = false;
                    debug!(subject = %subject, end = chunk.next_offset, "log end located");
                }
                self.state.send_modify(|s| {
                    if !seek {
                        s.buffer.push(&chunk.chunk);
                    }
                    s.offset = s.offset.max(chunk.next_offset);
                    s.connection_status = TailStatus::Connected;
                });
            }
            Err(e) => {
                self.metrics.poll_failed();
                warn!(subject = %subject, offset, error = %e, "log poll failed");
                self.state.send_if_modified(|s| {
                    let changed = s.connection_status != TailStatus::Error;
                    s.connection_status = TailStatus::Error;
                    changed
                });
            }
        }
    }
}

/// Subject reduced to something safe as a file name.
fn file_stem(subject: &str) -> String {
    subject
        .chars()
        .map(|c| match c {
            '/' | '\\' | ':' | '\0' => '_',
            c => c,
        })
        .collect()
}
