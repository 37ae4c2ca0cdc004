//! Domain records handed to the dose-decision layer
//!
//! Devices report time as seconds since their activation. The activation
//! clock anchors that relative time to the wall clock once per connection,
//! and every telemetry record carries both forms. `(device_id,
//! device_timestamp)` is the identity key used to de-duplicate records
//! across live and backfilled delivery.

use crate::messages::{CalibrationDataRx, GlucoseRx, TimeSyncRx};
use crate::types::DeviceStatus;
use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};

/// Maps device-relative elapsed seconds to wall-clock time
///
/// Derived once from a time-sync response and held for the life of the
/// connection.
#[derive(Debug, Clone, Copy)]
pub struct ActivationClock {
    activated_at: DateTime<Utc>,
}

impl ActivationClock {
    pub fn new(now: DateTime<Utc>, seconds_since_activation: u32) -> Self {
        Self {
            activated_at: now - Duration::seconds(seconds_since_activation as i64),
        }
    }

    pub fn from_time_sync(message: &TimeSyncRx) -> Self {
        Self::new(Utc::now(), message.current_time)
    }

    pub fn activated_at(&self) -> DateTime<Utc> {
        self.activated_at
    }

    /// Wall-clock instant of a device-relative timestamp
    pub fn timestamp(&self, device_seconds: u32) -> DateTime<Utc> {
        self.activated_at + Duration::seconds(device_seconds as i64)
    }
}

/// Sensor calibration state byte
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum CalibrationState {
    Stopped = 0x01,
    Warmup = 0x02,
    NeedsInitialCalibration = 0x04,
    NeedsSecondCalibration = 0x05,
    Ok = 0x06,
    NeedsCalibration = 0x07,
    SensorFailed = 0x0b,
    QuestionMarks = 0x12,
}

impl CalibrationState {
    pub fn from_u8(value: u8) -> Option<Self> {
        match value {
            0x01 => Some(CalibrationState::Stopped),
            0x02 => Some(CalibrationState::Warmup),
            0x04 => Some(CalibrationState::NeedsInitialCalibration),
            0x05 => Some(CalibrationState::NeedsSecondCalibration),
            0x06 => Some(CalibrationState::Ok),
            0x07 => Some(CalibrationState::NeedsCalibration),
            0x0b => Some(CalibrationState::SensorFailed),
            0x12 => Some(CalibrationState::QuestionMarks),
            _ => None,
        }
    }

    /// Whether glucose values reported in this state are usable
    pub fn has_reliable_glucose(&self) -> bool {
        matches!(self, CalibrationState::Ok | CalibrationState::NeedsCalibration)
    }
}

/// The most recent accepted calibration, when the device reported one
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct CalibrationInfo {
    pub glucose: u16,
    pub timestamp: DateTime<Utc>,
}

/// One glucose observation, live or backfilled
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GlucoseReading {
    pub device_id: String,
    /// mg/dL
    pub glucose: u16,
    /// Set when the device flagged the value as display-only (uncalibrated)
    pub display_only: bool,
    /// Raw calibration state byte; see [`CalibrationState`]
    pub state: u8,
    pub trend: i8,
    /// Raw device status byte; see [`DeviceStatus`]
    pub status: u8,
    /// Seconds since device activation; the de-duplication key
    pub device_timestamp: u32,
    pub timestamp: DateTime<Utc>,
    /// Calibration data read is best-effort; `None` records the degraded case
    pub calibration: Option<CalibrationInfo>,
}

impl GlucoseReading {
    /// Build a reading from a live glucose snapshot
    pub fn from_snapshot(
        device_id: &str,
        message: &GlucoseRx,
        clock: &ActivationClock,
        calibration: Option<&CalibrationDataRx>,
    ) -> Self {
        Self {
            device_id: device_id.to_string(),
            glucose: message.glucose(),
            display_only: message.is_display_only(),
            state: message.state,
            trend: message.trend,
            status: message.status,
            device_timestamp: message.timestamp,
            timestamp: clock.timestamp(message.timestamp),
            calibration: calibration.map(|c| CalibrationInfo {
                glucose: c.glucose,
                timestamp: clock.timestamp(c.timestamp),
            }),
        }
    }

    /// The natural identity key, shared by live and backfilled delivery
    pub fn identity(&self) -> (&str, u32) {
        (&self.device_id, self.device_timestamp)
    }

    pub fn calibration_state(&self) -> Option<CalibrationState> {
        CalibrationState::from_u8(self.state)
    }

    pub fn device_status(&self) -> Option<DeviceStatus> {
        DeviceStatus::from_u8(self.status)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::messages::RxFrame;

    #[test]
    fn test_activation_clock_offsets() {
        let now = Utc::now();
        let clock = ActivationClock::new(now, 5_440_614);

        assert_eq!(clock.activated_at(), now - Duration::seconds(5_440_614));
        assert_eq!(clock.timestamp(5_440_614), now);
        assert_eq!(
            clock.timestamp(5_440_914),
            now + Duration::seconds(300)
        );
    }

    #[test]
    fn test_calibration_state() {
        assert_eq!(CalibrationState::from_u8(0x06), Some(CalibrationState::Ok));
        assert!(CalibrationState::Ok.has_reliable_glucose());
        assert!(!CalibrationState::Warmup.has_reliable_glucose());
        assert_eq!(CalibrationState::from_u8(0x7f), None);
    }

    #[test]
    fn test_reading_identity() {
        let now = Utc::now();
        let clock = ActivationClock::new(now, 1000);
        let mut body = vec![0x31, 0x00];
        body.extend_from_slice(&1u32.to_le_bytes());
        body.extend_from_slice(&900u32.to_le_bytes());
        body.extend_from_slice(&120u16.to_le_bytes());
        body.push(0x06);
        body.push(0x02);
        let crc = crate::crc::crc16(&body);
        body.extend_from_slice(&crc.to_le_bytes());
        let message = crate::messages::GlucoseRx::decode(&body).unwrap();

        let reading = GlucoseReading::from_snapshot("ABCDEF", &message, &clock, None);
        assert_eq!(reading.identity(), ("ABCDEF", 900));
        assert_eq!(reading.glucose, 120);
        assert_eq!(reading.timestamp, now - Duration::seconds(100));
        assert!(reading.calibration.is_none());
    }
}
