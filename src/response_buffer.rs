//! Multi-frame response reassembly for older hardware generations
//!
//! Some device generations deliver a command response as several notification
//! chunks terminated by a one-byte end marker instead of one complete frame.
//! The buffer accumulates raw chunks; `responses` re-scans the accumulated
//! bytes on each call and decodes every fully delimited segment. Buffers are
//! small, so recomputation is cheap.

use crate::messages::BufferedFrame;

/// End-of-response marker used by the buffered protocol
pub const END_OF_RESPONSE_MARKER: u8 = 0x00;

/// Accumulates notification chunks until response delimiters are seen
pub struct ResponseBuffer {
    data: Vec<u8>,
    end_marker: u8,
}

impl ResponseBuffer {
    pub fn new(end_marker: u8) -> Self {
        Self {
            data: Vec::new(),
            end_marker,
        }
    }

    /// Append a notification chunk to the buffer
    pub fn append(&mut self, bytes: &[u8]) {
        self.data.extend_from_slice(bytes);
    }

    /// Decode every delimited segment seen so far
    ///
    /// Only segments terminated by the end marker are considered; trailing
    /// bytes with no delimiter yet are left for a later call. Segments that
    /// fail to decode are dropped, not surfaced as errors.
    pub fn responses<R: BufferedFrame>(&self) -> Vec<R> {
        let terminated = match self.data.iter().rposition(|&b| b == self.end_marker) {
            Some(last_marker) => &self.data[..last_marker + 1],
            None => return Vec::new(),
        };

        terminated
            .split(|&b| b == self.end_marker)
            .filter(|segment| !segment.is_empty())
            .filter_map(R::decode)
            .collect()
    }

    /// Whether at least one complete (delimited) segment has been seen
    pub fn has_complete_segment(&self) -> bool {
        self.data.contains(&self.end_marker)
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    pub fn clear(&mut self) {
        self.data.clear();
    }
}

impl Default for ResponseBuffer {
    fn default() -> Self {
        Self::new(END_OF_RESPONSE_MARKER)
    }
}
