//! Communication core for Bluetooth-connected diabetes-therapy devices
//!
//! This library turns an unreliable, notification-driven wireless link into
//! a serialized command/response protocol, a device session state machine,
//! a reassembly layer for chunked historical-data streams, and a codec that
//! compresses dosing schedules into the pulse-timing tables the pump
//! hardware expects.
//!
//! # Modules
//!
//! - `types`: error taxonomy and shared wire enums
//! - `crc`: CRC-16 checksum matching the device hardware
//! - `messages`: typed command/response frame codecs, one layout per opcode
//! - `response_buffer`: multi-frame response reassembly for older hardware
//! - `transport`: the interface the physical transport must implement
//! - `command_session`: one-transaction-at-a-time command engine
//! - `auth`: key derivation and challenge hashing
//! - `records`: activation clock and telemetry records
//! - `backfill`: historical-record buffer validation and reconciliation
//! - `pulse_table`: basal/bolus pulse-timing encoders
//! - `session`: the device session state machine

pub mod auth;
pub mod backfill;
pub mod command_session;
pub mod crc;
pub mod messages;
pub mod pulse_table;
pub mod records;
pub mod response_buffer;
pub mod session;
pub mod transport;
pub mod types;

pub use auth::{AuthSession, DeviceId};
pub use backfill::{reconcile, BackfillBuffer, BackfillRecord};
pub use command_session::{CommandRunner, Transaction};
pub use crc::crc16;
pub use messages::{BufferedFrame, CodedResponse, RxFrame, TxFrame};
pub use pulse_table::{
    basal_table, bolus_table, decode_basal_table, round_to_supported_rate, BasalSchedule,
    BasalScheduleEntry, BasalTableEntry, RateEntry, ZeroRateHandling,
};
pub use records::{ActivationClock, CalibrationInfo, CalibrationState, GlucoseReading};
pub use response_buffer::ResponseBuffer;
pub use session::{CommandSource, DeviceCommand, DeviceSession, SessionConfig, TelemetrySink};
pub use transport::{Endpoint, LinkTransport, Notification, WriteMode};
pub use types::{CompletionCode, DeviceStatus, LinkError, Opcode, Result};
