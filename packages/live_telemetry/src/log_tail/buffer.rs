//! Sliding-window text buffer for tailed logs.
//!
//! Appends go to the end; once the buffer holds more than `max_chars`
//! characters the oldest ones are discarded. The tail is always the freshest
//! content up to the cap.

/// Default cap, in characters.
pub const DEFAULT_MAX_CHARS: usize = 200_000;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LogBuffer {
    text: String,
    /// Character count of `text`, kept so appends don't rescan it.
    chars: usize,
    max_chars: usize,
}

impl LogBuffer {
    pub fn new(max_chars: usize) -> Self {
        Self {
            text: String::new(),
            chars: 0,
            max_chars,
        }
    }

    /// Append `chunk`, evicting from the front to stay within the cap.
    /// Returns the number of characters evicted.
    pub fn push(&mut self, chunk: &str) -> usize {
        self.text.push_str(chunk);
        self.chars += chunk.chars().count();

        let excess = self.chars.saturating_sub(self.max_chars);
        if excess == 0 {
            return 0;
        }
        let cut = self
            .text
            .char_indices()
            .nth(excess)
            .map_or(self.text.len(), |(i, _)| i);
        self.text.drain(..cut);
        self.chars -= excess;
        excess
    }

    pub fn as_str(&self) -> &str {
        &self.text
    }

    /// Length in characters.
    pub fn len(&self) -> usize {
        self.chars
    }

    pub fn is_empty(&self) -> bool {
        self.chars == 0
    }

    pub fn max_chars(&self) -> usize {
        self.max_chars
    }

    pub fn clear(&mut self) {
        self.text.clear();
        self.chars = 0;
    }
}

impl Default for LogBuffer {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_CHARS)
    }
}
