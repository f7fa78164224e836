//! Duplicate suppression for multi-path delivery.

/// Highest data sequence delivered so far.
///
/// A frame is new only if its sequence is strictly ahead of the watermark
/// in 16-bit serial arithmetic, so delivery continues across the
/// `65535 -> 0` wrap. Anything at or behind the watermark is a duplicate
/// copy or arrived out of order, and is dropped.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SequenceWatermark {
    last: Option<u16>,
}

impl SequenceWatermark {
    /// Create an empty watermark; the first sequence seen is always new.
    pub fn new() -> Self {
        Self::default()
    }

    /// Last delivered sequence.
    pub fn last(&self) -> Option<u16> {
        self.last
    }

    /// Whether `sequence` is ahead of the watermark.
    pub fn is_new(&self, sequence: u16) -> bool {
        match self.last {
            None => true,
            Some(last) => (sequence.wrapping_sub(last) as i16) > 0,
        }
    }

    /// Record `sequence` as delivered.
    pub fn advance(&mut self, sequence: u16) {
        self.last = Some(sequence);
    }

    /// Check and advance in one step. Returns whether `sequence` was new.
    pub fn accept(&mut self, sequence: u16) -> bool {
        if self.is_new(sequence) {
            self.advance(sequence);
            true
        } else {
            false
        }
    }
}
