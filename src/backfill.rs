//! Backfill buffer reassembly and batch reconciliation
//!
//! Historical records arrive as raw chunks on the backfill endpoint while a
//! separate ready indication on the control endpoint declares what the
//! stream should contain. Each chunk opens with a sequence byte and the
//! buffer's identifier byte; a sequence byte of one starts a new buffer,
//! discarding any unfinished one. The declared length and CRC cover the raw
//! chunk bytes, headers included. Reconciliation validates the accumulated
//! buffer wholesale: a batch is either emitted complete and ordered, or
//! rejected with a single descriptive error.

use crate::crc::crc16;
use crate::messages::BackfillReadyRx;
use crate::records::{ActivationClock, GlucoseReading};
use crate::types::{LinkError, Result};
use log::{debug, warn};

/// Sequence byte value that marks the first chunk of a new buffer
pub const NEW_BUFFER_MARKER: u8 = 0x01;

/// Bytes of each chunk taken by the sequence and identifier header
const CHUNK_HEADER_LEN: usize = 2;

/// Bytes of stream preamble before the first record
const STREAM_PREAMBLE_LEN: usize = 4;

/// Encoded size of one historical record
const RECORD_LEN: usize = 8;

/// One decoded historical record, still in device-relative time
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BackfillRecord {
    /// Seconds since device activation
    pub timestamp: u32,
    glucose_raw: u16,
    pub state: u8,
    pub trend: i8,
}

impl BackfillRecord {
    pub fn glucose(&self) -> u16 {
        self.glucose_raw & 0x0fff
    }

    pub fn is_display_only(&self) -> bool {
        self.glucose_raw & 0x8000 != 0
    }
}

/// Accumulates backfill chunks for one identifier
///
/// Created on the first chunk of a stream; replaced wholesale when a new
/// first-chunk marker arrives; destroyed on validation, whether it succeeds
/// or fails.
#[derive(Debug)]
pub struct BackfillBuffer {
    identifier: u8,
    chunks: Vec<Vec<u8>>,
}

impl BackfillBuffer {
    pub fn new(identifier: u8) -> Self {
        Self {
            identifier,
            chunks: Vec::new(),
        }
    }

    pub fn identifier(&self) -> u8 {
        self.identifier
    }

    /// Append one raw chunk, header included
    ///
    /// Chunks that are too short or carry a different identifier byte are
    /// discarded.
    pub fn append(&mut self, chunk: &[u8]) {
        if chunk.len() <= CHUNK_HEADER_LEN {
            warn!("Discarding short backfill chunk ({} bytes)", chunk.len());
            return;
        }
        if chunk[1] != self.identifier {
            warn!(
                "Discarding backfill chunk for identifier {:#04x} (buffer is {:#04x})",
                chunk[1], self.identifier
            );
            return;
        }
        self.chunks.push(chunk.to_vec());
    }

    /// Total accumulated bytes, chunk headers included
    pub fn len(&self) -> usize {
        self.chunks.iter().map(Vec::len).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.chunks.is_empty()
    }

    /// CRC-16 over the raw accumulated bytes, chunk headers included
    pub fn crc16(&self) -> u16 {
        let joined: Vec<u8> = self.chunks.iter().flatten().copied().collect();
        crc16(&joined)
    }

    /// Decode the accumulated record stream
    ///
    /// Chunk headers and the stream preamble are stripped; a partial
    /// trailing record is dropped.
    pub fn records(&self) -> Vec<BackfillRecord> {
        let stream: Vec<u8> = self
            .chunks
            .iter()
            .flat_map(|chunk| &chunk[CHUNK_HEADER_LEN..])
            .copied()
            .collect();

        if stream.len() < STREAM_PREAMBLE_LEN {
            return Vec::new();
        }

        stream[STREAM_PREAMBLE_LEN..]
            .chunks_exact(RECORD_LEN)
            .map(|record| BackfillRecord {
                timestamp: u32::from_le_bytes(record[0..4].try_into().unwrap()),
                glucose_raw: u16::from_le_bytes(record[4..6].try_into().unwrap()),
                state: record[6],
                trend: record[7] as i8,
            })
            .collect()
    }
}

/// Validate an accumulated buffer against its ready indication and convert
/// it to ordered domain records
///
/// Rejection discards the whole batch; no partial batches are ever emitted.
pub fn reconcile(
    buffer: &BackfillBuffer,
    ready: &BackfillReadyRx,
    device_id: &str,
    clock: &ActivationClock,
) -> Result<Vec<GlucoseReading>> {
    if buffer.len() != ready.buffer_length as usize {
        return Err(LinkError::BackfillRejected(format!(
            "declared length {} but accumulated {} bytes",
            ready.buffer_length,
            buffer.len()
        )));
    }

    let computed = buffer.crc16();
    if computed != ready.buffer_crc {
        return Err(LinkError::BackfillRejected(format!(
            "declared CRC {:#06x} but computed {:#06x}",
            ready.buffer_crc, computed
        )));
    }

    let records = buffer.records();
    let (first, last) = match (records.first(), records.last()) {
        (Some(first), Some(last)) => (first, last),
        _ => {
            return Err(LinkError::BackfillRejected(
                "validated buffer contains no records".to_string(),
            ))
        }
    };

    if first.timestamp != ready.start_time
        || last.timestamp != ready.end_time
        || first.timestamp > last.timestamp
    {
        return Err(LinkError::BackfillRejected(format!(
            "declared interval {}..{} not reflected in records {}..{}",
            ready.start_time, ready.end_time, first.timestamp, last.timestamp
        )));
    }

    debug!(
        "Backfill batch validated: {} records spanning {}..{}",
        records.len(),
        first.timestamp,
        last.timestamp
    );

    Ok(records
        .iter()
        .map(|record| GlucoseReading {
            device_id: device_id.to_string(),
            glucose: record.glucose(),
            display_only: record.is_display_only(),
            state: record.state,
            trend: record.trend,
            status: ready.status,
            device_timestamp: record.timestamp,
            timestamp: clock.timestamp(record.timestamp),
            calibration: None,
        })
        .collect())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::messages::RxFrame;
    use chrono::Utc;

    fn from_hex(hex: &str) -> Vec<u8> {
        (0..hex.len())
            .step_by(2)
            .map(|i| u8::from_str_radix(&hex[i..i + 2], 16).unwrap())
            .collect()
    }

    /// Recorded 50-byte capture: five records over twenty minutes
    fn captured_buffer() -> BackfillBuffer {
        let mut buffer = BackfillBuffer::new(0x00);
        buffer.append(&from_hex("0100bc460000b7ff52008b0006eee30053008500"));
        buffer.append(&from_hex("020006eb0f025300800006ee3a0353007e0006f5"));
        buffer.append(&from_hex("030066045300790006f8"));
        buffer
    }

    fn captured_ready() -> BackfillReadyRx {
        BackfillReadyRx::decode(&from_hex("51000100b7ff52006604530032000000e6cb9805")).unwrap()
    }

    #[test]
    fn test_captured_stream_decodes() {
        let buffer = captured_buffer();
        assert_eq!(buffer.len(), 50);
        assert_eq!(buffer.crc16(), 0xcbe6);

        let records = buffer.records();
        assert_eq!(records.len(), 5);
        assert_eq!(records[0].glucose(), 139);
        assert_eq!(records[0].timestamp, 5_439_415);
        assert_eq!(records[0].state, 0x06);
        assert_eq!(records[0].trend, -18);
        assert_eq!(records[1].glucose(), 133);
        assert_eq!(records[1].trend, -21);
        assert_eq!(records[4].glucose(), 121);
        assert_eq!(records[4].timestamp, 5_440_614);
        assert_eq!(records[4].trend, -8);
    }

    #[test]
    fn test_reconcile_accepts_capture() {
        let now = Utc::now();
        let clock = ActivationClock::new(now, 5_440_614);
        let batch = reconcile(&captured_buffer(), &captured_ready(), "ABCDEF", &clock).unwrap();

        assert_eq!(batch.len(), 5);
        assert_eq!(batch[0].identity(), ("ABCDEF", 5_439_415));
        assert_eq!(batch[0].glucose, 139);
        assert_eq!(batch[4].timestamp, now);
        assert!(batch.windows(2).all(|w| w[0].timestamp <= w[1].timestamp));
    }

    #[test]
    fn test_reconcile_is_idempotent() {
        let clock = ActivationClock::new(Utc::now(), 5_440_614);
        let buffer = captured_buffer();
        let ready = captured_ready();

        let first = reconcile(&buffer, &ready, "ABCDEF", &clock).unwrap();
        assert_eq!(buffer.crc16(), ready.buffer_crc);
        let second = reconcile(&buffer, &ready, "ABCDEF", &clock).unwrap();
        assert_eq!(first, second);
    }

    #[test]
    fn test_length_mismatch_rejected_without_partial_emission() {
        let clock = ActivationClock::new(Utc::now(), 5_440_614);
        let mut ready = captured_ready();
        ready.buffer_length = 40;

        let mut buffer = BackfillBuffer::new(0x00);
        buffer.append(&from_hex("0100bc460000b7ff52008b0006eee30053008500"));
        buffer.append(&from_hex("020006eb0f025300800006ee3a0353007e00"));
        assert_eq!(buffer.len(), 38);

        let result = reconcile(&buffer, &ready, "ABCDEF", &clock);
        assert!(matches!(result, Err(LinkError::BackfillRejected(_))));
    }

    #[test]
    fn test_crc_mismatch_rejected() {
        let clock = ActivationClock::new(Utc::now(), 5_440_614);
        let mut ready = captured_ready();
        ready.buffer_crc ^= 0x0001;

        let result = reconcile(&captured_buffer(), &ready, "ABCDEF", &clock);
        assert!(matches!(result, Err(LinkError::BackfillRejected(_))));
    }

    #[test]
    fn test_declared_interval_must_match_records() {
        let clock = ActivationClock::new(Utc::now(), 5_440_614);
        let mut ready = captured_ready();
        ready.start_time += 1;

        let result = reconcile(&captured_buffer(), &ready, "ABCDEF", &clock);
        assert!(matches!(result, Err(LinkError::BackfillRejected(_))));
    }

    #[test]
    fn test_partial_trailing_record_dropped() {
        let mut buffer = BackfillBuffer::new(0x00);
        buffer.append(&from_hex("0100bc460000b7ff52008b0006eee30053008500"));
        buffer.append(&from_hex("020006eb0f025300800006ee3a0353007e0006"));

        assert_eq!(buffer.records().len(), 3);
    }

    #[test]
    fn test_mismatched_identifier_chunks_discarded() {
        let mut buffer = BackfillBuffer::new(0xc0);
        buffer.append(&from_hex("01c0440c00003d6a0e005c0007fe696b0e005d00"));
        buffer.append(&from_hex("0280aabbccdd"));

        assert_eq!(buffer.len(), 20);
    }

    #[test]
    fn test_short_chunks_discarded() {
        let mut buffer = BackfillBuffer::new(0x00);
        buffer.append(&[0x01, 0x00]);
        assert!(buffer.is_empty());
    }
}
