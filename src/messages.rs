//! Command and response frame codecs
//!
//! Byte 0 of every frame is the opcode; the remaining fields are fixed-width
//! little-endian values at fixed offsets, one layout per opcode. Frames on
//! the control endpoint carry a trailing CRC-16 (little-endian); frames on
//! the authentication endpoint do not. Older hardware generations answer on
//! the data endpoint with code-prefixed responses instead (see
//! [`CodedResponse`]).

use crate::crc::crc16;
use crate::types::{CompletionCode, DeviceStatus, Opcode};

/// A command frame that can be encoded for transmission
pub trait TxFrame {
    /// Serialize the frame, including any trailing CRC
    fn encode(&self) -> Vec<u8>;
}

/// A response frame that can be decoded from a notification payload
///
/// `decode` returns `None` for payloads with the wrong opcode, a bad length,
/// or a failed CRC check; the command engine keeps listening in that case.
pub trait RxFrame: Sized {
    const OPCODE: Opcode;

    fn decode(data: &[u8]) -> Option<Self>;
}

/// A code-prefixed response segment from the older buffered protocol
pub trait BufferedFrame: Sized {
    fn decode(data: &[u8]) -> Option<Self>;

    fn code(&self) -> CompletionCode;
}

fn append_crc(mut frame: Vec<u8>) -> Vec<u8> {
    let crc = crc16(&frame);
    frame.extend_from_slice(&crc.to_le_bytes());
    frame
}

/// Strip and verify the trailing CRC of a control-endpoint frame
fn checked_body(data: &[u8], expected_len: usize) -> Option<&[u8]> {
    if data.len() != expected_len {
        return None;
    }
    let (body, crc) = data.split_at(data.len() - 2);
    if crc16(body) != u16::from_le_bytes([crc[0], crc[1]]) {
        return None;
    }
    Some(body)
}

fn read_u16(data: &[u8], offset: usize) -> u16 {
    u16::from_le_bytes([data[offset], data[offset + 1]])
}

fn read_u32(data: &[u8], offset: usize) -> u32 {
    u32::from_le_bytes([
        data[offset],
        data[offset + 1],
        data[offset + 2],
        data[offset + 3],
    ])
}

// Authentication endpoint frames (no trailing CRC)

/// Protocol version byte sent with the auth request
const AUTH_PROTOCOL_VERSION: u8 = 0x02;

/// Opens the handshake with a fresh single-use token
pub struct AuthRequestTx {
    pub token: [u8; 8],
}

impl TxFrame for AuthRequestTx {
    fn encode(&self) -> Vec<u8> {
        let mut frame = Vec::with_capacity(10);
        frame.push(Opcode::AuthRequest.to_u8());
        frame.extend_from_slice(&self.token);
        frame.push(AUTH_PROTOCOL_VERSION);
        frame
    }
}

/// The device's hash of our token, plus its own challenge
pub struct AuthResponseRx {
    pub token_hash: [u8; 8],
    pub challenge: [u8; 8],
}

impl RxFrame for AuthResponseRx {
    const OPCODE: Opcode = Opcode::AuthResponse;

    fn decode(data: &[u8]) -> Option<Self> {
        if data.len() != 17 || data[0] != Self::OPCODE.to_u8() {
            return None;
        }
        Some(Self {
            token_hash: data[1..9].try_into().unwrap(),
            challenge: data[9..17].try_into().unwrap(),
        })
    }
}

/// Our hash of the device's challenge
pub struct AuthChallengeTx {
    pub challenge_hash: [u8; 8],
}

impl TxFrame for AuthChallengeTx {
    fn encode(&self) -> Vec<u8> {
        let mut frame = Vec::with_capacity(9);
        frame.push(Opcode::AuthChallenge.to_u8());
        frame.extend_from_slice(&self.challenge_hash);
        frame
    }
}

/// Final handshake acknowledgement with the session flags
#[derive(Debug, Clone, Copy)]
pub struct AuthStatusRx {
    pub authenticated: bool,
    pub bonded: bool,
}

impl RxFrame for AuthStatusRx {
    const OPCODE: Opcode = Opcode::AuthStatus;

    fn decode(data: &[u8]) -> Option<Self> {
        if data.len() != 3 || data[0] != Self::OPCODE.to_u8() {
            return None;
        }
        Some(Self {
            authenticated: data[1] == 1,
            bonded: data[2] == 1,
        })
    }
}

/// Keeps the link alive while the user confirms the bond request
pub struct KeepAliveTx {
    pub seconds: u8,
}

impl TxFrame for KeepAliveTx {
    fn encode(&self) -> Vec<u8> {
        vec![Opcode::KeepAlive.to_u8(), self.seconds]
    }
}

pub struct BondRequestTx;

impl TxFrame for BondRequestTx {
    fn encode(&self) -> Vec<u8> {
        vec![Opcode::BondRequest.to_u8()]
    }
}

// Control endpoint frames (trailing CRC-16)

pub struct DisconnectTx;

impl TxFrame for DisconnectTx {
    fn encode(&self) -> Vec<u8> {
        append_crc(vec![Opcode::Disconnect.to_u8()])
    }
}

pub struct TimeSyncTx;

impl TxFrame for TimeSyncTx {
    fn encode(&self) -> Vec<u8> {
        append_crc(vec![Opcode::TimeSync.to_u8()])
    }
}

/// Reports seconds since device activation; anchors the activation clock
#[derive(Debug, Clone, Copy)]
pub struct TimeSyncRx {
    pub status: u8,
    /// Seconds elapsed since the device was activated
    pub current_time: u32,
    /// Session start, as seconds since activation
    pub session_start: u32,
}

impl RxFrame for TimeSyncRx {
    const OPCODE: Opcode = Opcode::TimeSyncResponse;

    fn decode(data: &[u8]) -> Option<Self> {
        let body = checked_body(data, 12)?;
        if body[0] != Self::OPCODE.to_u8() {
            return None;
        }
        Some(Self {
            status: body[1],
            current_time: read_u32(body, 2),
            session_start: read_u32(body, 6),
        })
    }
}

impl TimeSyncRx {
    pub fn device_status(&self) -> Option<DeviceStatus> {
        DeviceStatus::from_u8(self.status)
    }
}

pub struct SessionStartTx {
    /// Requested start, as seconds since activation
    pub start_time: u32,
    /// The same instant as seconds since the Unix epoch
    pub wall_time: u32,
}

impl TxFrame for SessionStartTx {
    fn encode(&self) -> Vec<u8> {
        let mut frame = Vec::with_capacity(11);
        frame.push(Opcode::SessionStart.to_u8());
        frame.extend_from_slice(&self.start_time.to_le_bytes());
        frame.extend_from_slice(&self.wall_time.to_le_bytes());
        append_crc(frame)
    }
}

#[derive(Debug, Clone, Copy)]
pub struct SessionStartRx {
    pub status: u8,
}

impl RxFrame for SessionStartRx {
    const OPCODE: Opcode = Opcode::SessionStartResponse;

    fn decode(data: &[u8]) -> Option<Self> {
        let body = checked_body(data, 4)?;
        if body[0] != Self::OPCODE.to_u8() {
            return None;
        }
        Some(Self { status: body[1] })
    }
}

pub struct SessionStopTx {
    /// Requested stop, as seconds since activation
    pub stop_time: u32,
}

impl TxFrame for SessionStopTx {
    fn encode(&self) -> Vec<u8> {
        let mut frame = Vec::with_capacity(7);
        frame.push(Opcode::SessionStop.to_u8());
        frame.extend_from_slice(&self.stop_time.to_le_bytes());
        append_crc(frame)
    }
}

#[derive(Debug, Clone, Copy)]
pub struct SessionStopRx {
    pub status: u8,
}

impl RxFrame for SessionStopRx {
    const OPCODE: Opcode = Opcode::SessionStopResponse;

    fn decode(data: &[u8]) -> Option<Self> {
        let body = checked_body(data, 4)?;
        if body[0] != Self::OPCODE.to_u8() {
            return None;
        }
        Some(Self { status: body[1] })
    }
}

pub struct GlucoseTx;

impl TxFrame for GlucoseTx {
    fn encode(&self) -> Vec<u8> {
        append_crc(vec![Opcode::Glucose.to_u8()])
    }
}

/// Current glucose snapshot
///
/// Bit 15 of the raw glucose word flags a display-only (uncalibrated) value;
/// the low 12 bits carry the reading in mg/dL.
#[derive(Debug, Clone, Copy)]
pub struct GlucoseRx {
    pub status: u8,
    pub sequence: u32,
    /// Seconds since activation
    pub timestamp: u32,
    glucose_raw: u16,
    pub state: u8,
    pub trend: i8,
}

impl RxFrame for GlucoseRx {
    const OPCODE: Opcode = Opcode::GlucoseResponse;

    fn decode(data: &[u8]) -> Option<Self> {
        let body = checked_body(data, 16)?;
        if body[0] != Self::OPCODE.to_u8() {
            return None;
        }
        Some(Self {
            status: body[1],
            sequence: read_u32(body, 2),
            timestamp: read_u32(body, 6),
            glucose_raw: read_u16(body, 10),
            state: body[12],
            trend: body[13] as i8,
        })
    }
}

impl GlucoseRx {
    pub fn glucose(&self) -> u16 {
        self.glucose_raw & 0x0fff
    }

    pub fn is_display_only(&self) -> bool {
        self.glucose_raw & 0x8000 != 0
    }

    pub fn device_status(&self) -> Option<DeviceStatus> {
        DeviceStatus::from_u8(self.status)
    }
}

pub struct CalibrationDataTx;

impl TxFrame for CalibrationDataTx {
    fn encode(&self) -> Vec<u8> {
        append_crc(vec![Opcode::CalibrationData.to_u8()])
    }
}

/// Most recent accepted calibration
#[derive(Debug, Clone, Copy)]
pub struct CalibrationDataRx {
    pub status: u8,
    pub glucose: u16,
    /// Seconds since activation
    pub timestamp: u32,
}

impl RxFrame for CalibrationDataRx {
    const OPCODE: Opcode = Opcode::CalibrationDataResponse;

    fn decode(data: &[u8]) -> Option<Self> {
        let body = checked_body(data, 10)?;
        if body[0] != Self::OPCODE.to_u8() {
            return None;
        }
        Some(Self {
            status: body[1],
            glucose: read_u16(body, 2),
            timestamp: read_u32(body, 4),
        })
    }
}

pub struct CalibrateTx {
    pub glucose: u16,
    /// Calibration instant, as seconds since activation
    pub time: u32,
}

impl TxFrame for CalibrateTx {
    fn encode(&self) -> Vec<u8> {
        let mut frame = Vec::with_capacity(9);
        frame.push(Opcode::Calibrate.to_u8());
        frame.extend_from_slice(&self.glucose.to_le_bytes());
        frame.extend_from_slice(&self.time.to_le_bytes());
        append_crc(frame)
    }
}

#[derive(Debug, Clone, Copy)]
pub struct CalibrateRx {
    pub status: u8,
    pub accepted: bool,
}

impl RxFrame for CalibrateRx {
    const OPCODE: Opcode = Opcode::CalibrateResponse;

    fn decode(data: &[u8]) -> Option<Self> {
        let body = checked_body(data, 5)?;
        if body[0] != Self::OPCODE.to_u8() {
            return None;
        }
        Some(Self {
            status: body[1],
            accepted: body[2] == 1,
        })
    }
}

pub struct ResetTx;

impl TxFrame for ResetTx {
    fn encode(&self) -> Vec<u8> {
        append_crc(vec![Opcode::Reset.to_u8()])
    }
}

#[derive(Debug, Clone, Copy)]
pub struct ResetRx {
    pub status: u8,
}

impl RxFrame for ResetRx {
    const OPCODE: Opcode = Opcode::ResetResponse;

    fn decode(data: &[u8]) -> Option<Self> {
        let body = checked_body(data, 4)?;
        if body[0] != Self::OPCODE.to_u8() {
            return None;
        }
        Some(Self { status: body[1] })
    }
}

/// Requests historical records for a device-relative time window
pub struct BackfillTx {
    pub identifier: u8,
    pub start_time: u32,
    pub end_time: u32,
}

impl TxFrame for BackfillTx {
    fn encode(&self) -> Vec<u8> {
        let mut frame = Vec::with_capacity(20);
        frame.push(Opcode::Backfill.to_u8());
        frame.push(0x05);
        frame.push(0x02);
        frame.push(self.identifier);
        frame.extend_from_slice(&self.start_time.to_le_bytes());
        frame.extend_from_slice(&self.end_time.to_le_bytes());
        frame.extend_from_slice(&[0u8; 6]);
        append_crc(frame)
    }
}

/// Backfill ready indication
///
/// Declares what the raw chunk stream on the backfill endpoint should have
/// accumulated: total byte length, CRC-16, and the first/last record
/// timestamps. Reconciliation validates the buffer against these.
#[derive(Debug, Clone, Copy)]
pub struct BackfillReadyRx {
    pub status: u8,
    pub backfill_status: u8,
    pub identifier: u8,
    pub start_time: u32,
    pub end_time: u32,
    pub buffer_length: u16,
    pub buffer_crc: u16,
}

impl RxFrame for BackfillReadyRx {
    const OPCODE: Opcode = Opcode::BackfillResponse;

    fn decode(data: &[u8]) -> Option<Self> {
        let body = checked_body(data, 20)?;
        if body[0] != Self::OPCODE.to_u8() {
            return None;
        }
        Some(Self {
            status: body[1],
            backfill_status: body[2],
            identifier: body[3],
            start_time: read_u32(body, 4),
            end_time: read_u32(body, 8),
            buffer_length: read_u16(body, 12),
            buffer_crc: read_u16(body, 16),
        })
    }
}

// Older-generation buffered responses

/// A decoded segment from the multi-frame response buffer
///
/// The first byte is the completion code; any remaining bytes are the
/// command-specific body.
#[derive(Debug, Clone)]
pub struct CodedResponse {
    code: CompletionCode,
    pub body: Vec<u8>,
}

impl BufferedFrame for CodedResponse {
    fn decode(data: &[u8]) -> Option<Self> {
        let (&first, body) = data.split_first()?;
        Some(Self {
            code: CompletionCode::from_u8(first)?,
            body: body.to_vec(),
        })
    }

    fn code(&self) -> CompletionCode {
        self.code
    }
}
