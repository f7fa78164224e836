//! Reassembly of delimited frames from a byte stream.

use bytes::{Buf, Bytes, BytesMut};

use crate::core::constants::FRAME_DELIMITER;

/// Default cap on buffered bytes that contain no complete frame.
pub const DEFAULT_MAX_BUFFERED: usize = 64 * 1024;

/// Accumulates received chunks and yields complete `0x00 .. 0x00` spans.
///
/// Frames may straddle any number of chunks; bytes before the first
/// delimiter are noise and are dropped.
#[derive(Debug)]
pub struct FrameAssembler {
    buffer: BytesMut,
    max_buffered: usize,
}

impl Default for FrameAssembler {
    fn default() -> Self {
        Self::new()
    }
}

impl FrameAssembler {
    /// Create an assembler with the default buffer cap.
    pub fn new() -> Self {
        Self::with_max_buffered(DEFAULT_MAX_BUFFERED)
    }

    /// Create an assembler that discards its buffer past `max_buffered` bytes.
    pub fn with_max_buffered(max_buffered: usize) -> Self {
        Self {
            buffer: BytesMut::with_capacity(1024),
            max_buffered,
        }
    }

    /// Append a newly received chunk.
    pub fn push(&mut self, chunk: &[u8]) {
        self.buffer.extend_from_slice(chunk);
        if self.buffer.len() > self.max_buffered {
            tracing::debug!(
                buffered = self.buffer.len(),
                "reassembly buffer overflow, discarding"
            );
            self.buffer.clear();
        }
    }

    /// Extract the next complete frame, delimiters included.
    ///
    /// The closing delimiter stays buffered as the possible opener of the
    /// next span. A span whose real closing delimiter was lost therefore
    /// ends at the next frame's opener without swallowing that frame.
    pub fn next_frame(&mut self) -> Option<Bytes> {
        loop {
            let Some(start) = self.buffer.iter().position(|&b| b == FRAME_DELIMITER) else {
                self.buffer.clear();
                return None;
            };
            self.buffer.advance(start);

            let end = self.buffer[1..]
                .iter()
                .position(|&b| b == FRAME_DELIMITER)?
                + 1;

            if end == 1 {
                // Two adjacent delimiters: the first closed a frame whose
                // start we never saw, the second opens the next one.
                self.buffer.advance(1);
                continue;
            }

            let frame = Bytes::copy_from_slice(&self.buffer[..=end]);
            self.buffer.advance(end);
            return Some(frame);
        }
    }

    /// Bytes currently buffered.
    pub fn buffered(&self) -> usize {
        self.buffer.len()
    }

    /// Drop all buffered bytes.
    pub fn clear(&mut self) {
        self.buffer.clear();
    }
}
