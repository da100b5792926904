//! Log Tailer.
//!
//! - `buffer`: sliding-window text buffer
//! - `source`: `LogSource` seam, HTTP and in-memory sources
//! - `tailer`: seek, poll and cursor bookkeeping

mod buffer;
pub mod source;
mod tailer;

pub use buffer::{DEFAULT_MAX_CHARS, LogBuffer};
pub use source::{HttpLogSource, LogChunk, LogSource, MemoryLogSource};
pub use tailer::{LogTailState, LogTailer, SEEK_TO_END, TailStatus};
