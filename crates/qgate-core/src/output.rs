//! Size-bounded capture of process output.

use std::collections::VecDeque;

/// Keeps the last `capacity` bytes written to it, dropping the oldest.
#[derive(Debug, Clone)]
pub struct TailBuffer {
    capacity: usize,
    buf: VecDeque<u8>,
    dropped: u64,
}

impl TailBuffer {
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity,
            buf: VecDeque::with_capacity(capacity.min(64 * 1024)),
            dropped: 0,
        }
    }

    /// Append bytes, evicting from the front once over capacity.
    pub fn push(&mut self, data: &[u8]) {
        if self.capacity == 0 {
            self.dropped += data.len() as u64;
            return;
        }
        if data.len() >= self.capacity {
            self.dropped += (self.buf.len() + data.len() - self.capacity) as u64;
            self.buf.clear();
            self.buf.extend(&data[data.len() - self.capacity..]);
            return;
        }
        let overflow = (self.buf.len() + data.len()).saturating_sub(self.capacity);
        if overflow > 0 {
            self.buf.drain(..overflow);
            self.dropped += overflow as u64;
        }
        self.buf.extend(data);
    }

    /// Number of bytes discarded so far.
    pub fn dropped(&self) -> u64 {
        self.dropped
    }

    pub fn len(&self) -> usize {
        self.buf.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buf.is_empty()
    }

    /// Render as lossy UTF-8, prefixed by a marker when bytes were dropped.
    pub fn render(&self) -> String {
        let (a, b) = self.buf.as_slices();
        let mut bytes = Vec::with_capacity(a.len() + b.len());
        bytes.extend_from_slice(a);
        bytes.extend_from_slice(b);
        let text = String::from_utf8_lossy(&bytes);
        if self.dropped > 0 {
            format!("[... {} bytes truncated ...]\n{}", self.dropped, text)
        } else {
            text.into_owned()
        }
    }
}
