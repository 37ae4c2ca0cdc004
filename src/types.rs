//! Common types, enums, and error definitions shared across the link layer

use std::fmt;
use thiserror::Error;

/// Result type alias for link operations
pub type Result<T> = std::result::Result<T, LinkError>;

/// Error taxonomy for device communication
///
/// Transaction-level failures propagate to the session state machine, which
/// decides whether to abort the session (authentication, transport) or to
/// continue with degraded capability (calibration read, a single queued
/// command). The core itself never retries.
#[derive(Error, Debug)]
pub enum LinkError {
    /// Link-level failure (write failed, link torn down). Aborts the session.
    #[error("Transport failure: {0}")]
    Transport(String),

    /// No satisfying response arrived within the transaction deadline.
    /// Retryable by the caller; never retried by the core.
    #[error("Timed out waiting for device response")]
    Timeout,

    /// The device failed the token challenge, or rejected ours. Fatal for
    /// the session; never retried automatically.
    #[error("Authentication failed: {0}")]
    Authentication(String),

    /// A payload was received but could not be decoded after the link was
    /// done sending.
    #[error("Invalid response: {0}")]
    InvalidResponse(String),

    /// Passive-mode inconsistency, e.g. backfill data arriving before an
    /// activation clock is known.
    #[error("Observation error: {0}")]
    Observation(String),

    /// A backfill batch failed length, checksum, or timestamp validation
    /// and was discarded wholesale.
    #[error("Backfill batch rejected: {0}")]
    BackfillRejected(String),
}

/// Known command/response opcodes
///
/// Byte 0 of every frame on the authentication and control endpoints is one
/// of these. Payload field layouts are fixed per opcode; see `messages`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum Opcode {
    AuthRequest = 0x01,
    AuthResponse = 0x03,
    AuthChallenge = 0x04,
    AuthStatus = 0x05,
    KeepAlive = 0x06,
    BondRequest = 0x07,
    Disconnect = 0x09,
    TimeSync = 0x24,
    TimeSyncResponse = 0x25,
    SessionStart = 0x26,
    SessionStartResponse = 0x27,
    SessionStop = 0x28,
    SessionStopResponse = 0x29,
    Glucose = 0x30,
    GlucoseResponse = 0x31,
    CalibrationData = 0x32,
    CalibrationDataResponse = 0x33,
    Calibrate = 0x34,
    CalibrateResponse = 0x35,
    Reset = 0x42,
    ResetResponse = 0x43,
    Backfill = 0x50,
    BackfillResponse = 0x51,
}

impl Opcode {
    /// Convert a leading frame byte to an Opcode
    pub fn from_u8(value: u8) -> Option<Self> {
        match value {
            0x01 => Some(Opcode::AuthRequest),
            0x03 => Some(Opcode::AuthResponse),
            0x04 => Some(Opcode::AuthChallenge),
            0x05 => Some(Opcode::AuthStatus),
            0x06 => Some(Opcode::KeepAlive),
            0x07 => Some(Opcode::BondRequest),
            0x09 => Some(Opcode::Disconnect),
            0x24 => Some(Opcode::TimeSync),
            0x25 => Some(Opcode::TimeSyncResponse),
            0x26 => Some(Opcode::SessionStart),
            0x27 => Some(Opcode::SessionStartResponse),
            0x28 => Some(Opcode::SessionStop),
            0x29 => Some(Opcode::SessionStopResponse),
            0x30 => Some(Opcode::Glucose),
            0x31 => Some(Opcode::GlucoseResponse),
            0x32 => Some(Opcode::CalibrationData),
            0x33 => Some(Opcode::CalibrationDataResponse),
            0x34 => Some(Opcode::Calibrate),
            0x35 => Some(Opcode::CalibrateResponse),
            0x42 => Some(Opcode::Reset),
            0x43 => Some(Opcode::ResetResponse),
            0x50 => Some(Opcode::Backfill),
            0x51 => Some(Opcode::BackfillResponse),
            _ => None,
        }
    }

    /// Convert an Opcode to its wire byte
    pub fn to_u8(self) -> u8 {
        self as u8
    }
}

/// Device status byte carried by current-generation response frames
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum DeviceStatus {
    Ok = 0x00,
    LowBattery = 0x81,
    Expired = 0x83,
}

impl DeviceStatus {
    pub fn from_u8(value: u8) -> Option<Self> {
        match value {
            0x00 => Some(DeviceStatus::Ok),
            0x81 => Some(DeviceStatus::LowBattery),
            0x83 => Some(DeviceStatus::Expired),
            _ => None,
        }
    }
}

/// Completion code carried by older-generation buffered responses
///
/// `Interrupted` is not a failure: it signals that a background idle listen
/// was preempted by our command, and the transaction keeps waiting.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum CompletionCode {
    RxTimeout = 0xaa,
    Interrupted = 0xbb,
    ZeroData = 0xcc,
    Success = 0xdd,
    InvalidParam = 0x11,
    UnknownCommand = 0x22,
}

impl CompletionCode {
    pub fn from_u8(value: u8) -> Option<Self> {
        match value {
            0xaa => Some(CompletionCode::RxTimeout),
            0xbb => Some(CompletionCode::Interrupted),
            0xcc => Some(CompletionCode::ZeroData),
            0xdd => Some(CompletionCode::Success),
            0x11 => Some(CompletionCode::InvalidParam),
            0x22 => Some(CompletionCode::UnknownCommand),
            _ => None,
        }
    }

    pub fn to_u8(self) -> u8 {
        self as u8
    }
}

impl fmt::Display for CompletionCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CompletionCode::RxTimeout => write!(f, "RX_TIMEOUT"),
            CompletionCode::Interrupted => write!(f, "INTERRUPTED"),
            CompletionCode::ZeroData => write!(f, "ZERO_DATA"),
            CompletionCode::Success => write!(f, "SUCCESS"),
            CompletionCode::InvalidParam => write!(f, "INVALID_PARAM"),
            CompletionCode::UnknownCommand => write!(f, "UNKNOWN_COMMAND"),
        }
    }
}

/// Render a payload as lowercase hex for logs and errors
pub fn hex_string(data: &[u8]) -> String {
    data.iter().map(|b| format!("{:02x}", b)).collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_opcode_conversion() {
        assert_eq!(Opcode::from_u8(0x31), Some(Opcode::GlucoseResponse));
        assert_eq!(Opcode::from_u8(0x51), Some(Opcode::BackfillResponse));
        assert_eq!(Opcode::from_u8(0xff), None);
        assert_eq!(Opcode::BackfillResponse.to_u8(), 0x51);
    }

    #[test]
    fn test_completion_code_conversion() {
        assert_eq!(CompletionCode::from_u8(0xdd), Some(CompletionCode::Success));
        assert_eq!(
            CompletionCode::from_u8(0xbb),
            Some(CompletionCode::Interrupted)
        );
        assert_eq!(CompletionCode::from_u8(0x42), None);
    }

    #[test]
    fn test_device_status_conversion() {
        assert_eq!(DeviceStatus::from_u8(0x00), Some(DeviceStatus::Ok));
        assert_eq!(DeviceStatus::from_u8(0x81), Some(DeviceStatus::LowBattery));
        assert_eq!(DeviceStatus::from_u8(0x42), None);
    }

    #[test]
    fn test_hex_string() {
        assert_eq!(hex_string(&[0x51, 0x00, 0xab]), "5100ab");
        assert_eq!(hex_string(&[]), "");
    }
}
