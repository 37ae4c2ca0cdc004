//! Device session state machine
//!
//! Drives one full interaction with a connected device: authenticate, bond
//! if needed, enable notifications, drain queued user commands, read the
//! telemetry snapshot, and disconnect. A session under another controller's
//! command instead runs the passive path, which only observes notifications
//! and dispatches them by leading opcode byte.
//!
//! All state for a link lives on the session's single serial context; a
//! pump and a sensor connected at the same time run independent sessions.

use crate::auth::{AuthSession, DeviceId};
use crate::backfill::{reconcile, BackfillBuffer, NEW_BUFFER_MARKER};
use crate::command_session::{CommandRunner, Transaction};
use crate::messages::{
    AuthChallengeTx, AuthRequestTx, AuthResponseRx, AuthStatusRx, BackfillReadyRx,
    BondRequestTx, CalibrateRx, CalibrateTx, CalibrationDataRx, CalibrationDataTx, DisconnectTx,
    GlucoseRx, GlucoseTx, KeepAliveTx, ResetRx, ResetTx, RxFrame, SessionStartRx, SessionStartTx,
    SessionStopRx, SessionStopTx, TimeSyncRx, TimeSyncTx, TxFrame,
};
use crate::records::{ActivationClock, GlucoseReading};
use crate::transport::{Endpoint, LinkTransport, Notification};
use crate::types::{hex_string, LinkError, Opcode, Result};
use chrono::{DateTime, Utc};
use log::{debug, info, warn};
use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;

/// Keep-alive window granted to the user to confirm pairing, in seconds
const BOND_KEEP_ALIVE_SECS: u8 = 25;

/// Per-session timing and mode configuration
#[derive(Debug, Clone)]
pub struct SessionConfig {
    /// Observe notifications only; issue no commands
    pub passive: bool,

    /// Deadline for ordinary command transactions
    pub command_timeout: Duration,

    /// Extended deadline covering the user's physical confirmation of a
    /// pairing request
    pub bond_confirmation_timeout: Duration,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            passive: false,
            command_timeout: Duration::from_secs(2),
            bond_confirmation_timeout: Duration::from_secs(15),
        }
    }
}

/// A user-requested device command pulled from the command queue
#[derive(Debug, Clone, PartialEq)]
pub enum DeviceCommand {
    StartSensorSession { at: DateTime<Utc> },
    StopSensorSession { at: DateTime<Utc> },
    Calibrate { glucose: u16, at: DateTime<Utc> },
    Reset,
}

/// External source of pending device commands
///
/// Called from the session's worker context; implementations must be
/// thread-safe. A failed command is reported and draining continues.
pub trait CommandSource: Send + Sync {
    fn dequeue_pending_command(&self) -> Option<DeviceCommand>;

    fn on_command_complete(&self, command: &DeviceCommand);

    fn on_command_failed(&self, command: &DeviceCommand, error: &LinkError);
}

/// Sink for telemetry and session error events
pub trait TelemetrySink: Send + Sync {
    fn on_reading(&self, reading: &GlucoseReading);

    /// A validated backfill batch, emitted complete and ordered
    fn on_backfill_batch(&self, batch: &[GlucoseReading]);

    /// A notification with an unrecognized leading opcode, surfaced raw
    fn on_unknown_data(&self, data: &[u8]);

    fn on_session_error(&self, error: &LinkError);
}

/// One connection's interaction state machine
pub struct DeviceSession {
    device_id: DeviceId,
    config: SessionConfig,
    transport: Arc<dyn LinkTransport>,
    runner: CommandRunner,
    sink: Arc<dyn TelemetrySink>,
    source: Option<Arc<dyn CommandSource>>,

    // Connection-lifetime observation state
    clock: Option<ActivationClock>,
    last_calibration: Option<CalibrationDataRx>,
    backfill: Option<BackfillBuffer>,
    backfill_subscribed: bool,
    emitted: HashSet<u32>,
}

impl DeviceSession {
    pub fn new(
        device_id: DeviceId,
        transport: Arc<dyn LinkTransport>,
        notifications: mpsc::Receiver<Notification>,
        sink: Arc<dyn TelemetrySink>,
        source: Option<Arc<dyn CommandSource>>,
        config: SessionConfig,
    ) -> Self {
        let runner = CommandRunner::new(transport.clone(), notifications);
        Self {
            device_id,
            config,
            transport,
            runner,
            sink,
            source,
            clock: None,
            last_calibration: None,
            backfill: None,
            backfill_subscribed: false,
            emitted: HashSet::new(),
        }
    }

    /// Run the session to completion
    ///
    /// A terminal error is delivered to the sink exactly once and also
    /// returned to the supervising task.
    pub async fn run(mut self) -> Result<()> {
        let result = if self.config.passive {
            self.run_passive().await
        } else {
            self.run_active().await
        };

        if let Err(error) = &result {
            self.sink.on_session_error(error);
        }
        result
    }

    async fn run_active(&mut self) -> Result<()> {
        self.transport.connect().await?;
        self.transport.subscribe(Endpoint::Authentication).await?;

        debug!("Authenticating with device {}", self.device_id.as_str());
        let status = self.authenticate().await?;

        if !status.bonded {
            debug!("Device not bonded; requesting bond");
            self.request_bond().await?;
        }
        self.enable_control_notifications(!status.bonded).await?;

        debug!("Reading device time");
        let time = self.execute::<TimeSyncRx>(&TimeSyncTx).await?;
        let clock = ActivationClock::from_time_sync(&time);
        info!("Device activated at {}", clock.activated_at());
        self.clock = Some(clock);

        self.drain_commands(&clock).await;

        debug!("Reading glucose");
        let glucose = self.execute::<GlucoseRx>(&GlucoseTx).await?;

        debug!("Reading calibration data");
        let calibration = match self.execute::<CalibrationDataRx>(&CalibrationDataTx).await {
            Ok(calibration) => Some(calibration),
            Err(error) => {
                // Tolerated: the reading is emitted without calibration
                warn!("Calibration data read failed: {}", error);
                None
            }
        };

        let reading = GlucoseReading::from_snapshot(
            self.device_id.as_str(),
            &glucose,
            &clock,
            calibration.as_ref(),
        );
        self.emit_reading(reading);

        self.disconnect().await;
        Ok(())
    }

    /// Exchange token and challenge hashes with the device
    ///
    /// Any hash mismatch or rejection is fatal for the session; no retry.
    async fn authenticate(&mut self) -> Result<AuthStatusRx> {
        let mut auth = AuthSession::new(self.device_id.clone());

        let response: AuthResponseRx = self
            .execute_on(Endpoint::Authentication, &AuthRequestTx { token: auth.token })
            .await?;

        if !auth.verify_token_hash(&response.token_hash) {
            return Err(LinkError::Authentication(
                "device failed the token challenge".to_string(),
            ));
        }

        let challenge_hash = auth.answer_challenge(response.challenge);
        let status: AuthStatusRx = self
            .execute_on(Endpoint::Authentication, &AuthChallengeTx { challenge_hash })
            .await?;

        if !status.authenticated {
            return Err(LinkError::Authentication(
                "device rejected our challenge response".to_string(),
            ));
        }

        auth.authenticated = true;
        auth.bonded = status.bonded;
        debug!(
            "Authenticated (bonded: {}) with {}",
            auth.bonded,
            auth.device_id.as_str()
        );
        Ok(status)
    }

    async fn request_bond(&mut self) -> Result<()> {
        let keep_alive = Transaction::new(
            Endpoint::Authentication,
            &KeepAliveTx {
                seconds: BOND_KEEP_ALIVE_SECS,
            },
            self.config.command_timeout,
        );
        self.runner.execute_no_response(keep_alive).await?;

        let bond = Transaction::new(
            Endpoint::Authentication,
            &BondRequestTx,
            self.config.command_timeout,
        );
        self.runner.execute_no_response(bond).await?;

        debug!("Bond request sent; waiting for the user to confirm");
        Ok(())
    }

    /// Enable control notifications, stretching the deadline over the
    /// user's pairing confirmation when a bond is pending
    async fn enable_control_notifications(&mut self, bond_pending: bool) -> Result<()> {
        let deadline = if bond_pending {
            self.config.bond_confirmation_timeout
        } else {
            self.config.command_timeout
        };

        match tokio::time::timeout(deadline, self.transport.subscribe(Endpoint::Control)).await {
            Ok(result) => result,
            Err(_) => Err(LinkError::Timeout),
        }
    }

    /// Pull and execute queued commands until the source runs dry
    ///
    /// A single command failure is reported to the source and does not
    /// abort the drain loop.
    async fn drain_commands(&mut self, clock: &ActivationClock) {
        let source = match self.source.clone() {
            Some(source) => source,
            None => return,
        };

        while let Some(command) = source.dequeue_pending_command() {
            debug!("Sending command: {:?}", command);
            match self.send_command(&command, clock).await {
                Ok(()) => source.on_command_complete(&command),
                Err(error) => {
                    warn!("Command {:?} failed: {}", command, error);
                    source.on_command_failed(&command, &error);
                }
            }
        }
    }

    async fn send_command(&mut self, command: &DeviceCommand, clock: &ActivationClock) -> Result<()> {
        match command {
            DeviceCommand::StartSensorSession { at } => {
                self.execute::<SessionStartRx>(&SessionStartTx {
                    start_time: device_seconds(clock, *at),
                    wall_time: at.timestamp().max(0) as u32,
                })
                .await?;
            }
            DeviceCommand::StopSensorSession { at } => {
                self.execute::<SessionStopRx>(&SessionStopTx {
                    stop_time: device_seconds(clock, *at),
                })
                .await?;
            }
            DeviceCommand::Calibrate { glucose, at } => {
                self.execute::<CalibrateRx>(&CalibrateTx {
                    glucose: *glucose,
                    time: device_seconds(clock, *at),
                })
                .await?;
            }
            DeviceCommand::Reset => {
                self.execute::<ResetRx>(&ResetTx).await?;
            }
        }
        Ok(())
    }

    /// Best-effort teardown; the link is going away regardless
    async fn disconnect(&mut self) {
        debug!("Initiating a disconnect");
        if let Err(error) = self.transport.unsubscribe(Endpoint::Control).await {
            debug!("Unsubscribe during disconnect failed: {}", error);
        }
        let transaction = Transaction::new(
            Endpoint::Control,
            &DisconnectTx,
            self.config.command_timeout,
        );
        if let Err(error) = self.runner.execute_no_response(transaction).await {
            debug!("Disconnect command failed: {}", error);
        }
        if let Err(error) = self.transport.disconnect().await {
            debug!("Transport disconnect failed: {}", error);
        }
    }

    // Passive listening

    async fn run_passive(&mut self) -> Result<()> {
        self.transport.connect().await?;
        debug!("Listening for authentication responses in passive mode");
        self.transport.subscribe(Endpoint::Authentication).await?;

        while let Some(notification) = self.runner.recv().await {
            match notification.endpoint {
                Endpoint::Authentication => self.observe_authentication(&notification.payload).await,
                Endpoint::Control => self.dispatch_control(notification.payload).await,
                Endpoint::Backfill => self.handle_backfill_chunk(&notification.payload),
                Endpoint::Data => {
                    debug!("Ignoring data endpoint traffic in passive mode");
                }
            }
        }

        debug!("Passive session ended; link closed");
        Ok(())
    }

    /// Enable control notifications once another controller's session is
    /// fully authenticated
    async fn observe_authentication(&mut self, payload: &[u8]) {
        match AuthStatusRx::decode(payload) {
            Some(status) if status.authenticated && status.bonded => {
                debug!("Observed an authenticated session; enabling control notifications");
                if let Err(error) = self.transport.subscribe(Endpoint::Control).await {
                    self.sink.on_session_error(&error);
                }
            }
            _ => {
                debug!("Ignoring authentication payload: {}", hex_string(payload));
            }
        }
    }

    /// Dispatch an inbound control notification by its leading opcode
    async fn dispatch_control(&mut self, payload: Vec<u8>) {
        let opcode = match payload.first().copied().map(Opcode::from_u8) {
            Some(Some(opcode)) => opcode,
            // Unrecognized leading byte: surfaced to the consumer raw
            Some(None) => {
                self.sink.on_unknown_data(&payload);
                return;
            }
            None => return,
        };

        match opcode {
            Opcode::GlucoseResponse => self.observe_glucose(&payload).await,
            Opcode::TimeSyncResponse => {
                if let Some(time) = TimeSyncRx::decode(&payload) {
                    self.clock = Some(ActivationClock::from_time_sync(&time));
                    debug!("Activation clock updated from time sync");
                }
            }
            Opcode::BackfillResponse => self.observe_backfill_ready(&payload),
            Opcode::CalibrationDataResponse => {
                if let Some(calibration) = CalibrationDataRx::decode(&payload) {
                    self.last_calibration = Some(calibration);
                }
            }
            other => {
                // All other recognized opcodes are ignored by design
                debug!("Ignoring {:?} notification in passive mode", other);
            }
        }
    }

    async fn observe_glucose(&mut self, payload: &[u8]) {
        let (message, clock) = match (GlucoseRx::decode(payload), self.clock) {
            (Some(message), Some(clock)) => (message, clock),
            _ => {
                self.sink.on_session_error(&LinkError::Observation(
                    "unable to handle glucose notification".to_string(),
                ));
                return;
            }
        };

        let reading = GlucoseReading::from_snapshot(
            self.device_id.as_str(),
            &message,
            &clock,
            self.last_calibration.as_ref(),
        );
        self.emit_reading(reading);

        if !self.backfill_subscribed {
            match self.transport.subscribe(Endpoint::Backfill).await {
                Ok(()) => self.backfill_subscribed = true,
                Err(error) => self.sink.on_session_error(&error),
            }
        }
    }

    fn observe_backfill_ready(&mut self, payload: &[u8]) {
        let ready = match BackfillReadyRx::decode(payload) {
            Some(ready) => ready,
            None => {
                debug!("Undecodable backfill ready payload: {}", hex_string(payload));
                return;
            }
        };

        if self.backfill.is_none() {
            self.sink.on_session_error(&LinkError::Observation(
                "backfill ready received but no buffer was started".to_string(),
            ));
            return;
        }
        let clock = match self.clock {
            Some(clock) => clock,
            None => {
                self.sink.on_session_error(&LinkError::Observation(
                    "backfill ready received but the activation clock is unknown".to_string(),
                ));
                return;
            }
        };

        // The buffer is consumed by validation, pass or fail
        let buffer = match self.backfill.take() {
            Some(buffer) => buffer,
            None => return,
        };
        match reconcile(&buffer, &ready, self.device_id.as_str(), &clock) {
            Ok(batch) => {
                for reading in &batch {
                    self.emitted.insert(reading.device_timestamp);
                }
                info!("Emitting backfill batch of {} records", batch.len());
                self.sink.on_backfill_batch(&batch);
            }
            Err(error) => self.sink.on_session_error(&error),
        }
    }

    /// Accumulate a raw chunk; a new-buffer marker replaces any unfinished
    /// buffer wholesale
    fn handle_backfill_chunk(&mut self, payload: &[u8]) {
        if payload.len() >= 2 && payload[0] == NEW_BUFFER_MARKER {
            info!("Starting new backfill buffer with identifier {}", payload[1]);
            self.backfill = Some(BackfillBuffer::new(payload[1]));
        }

        match &mut self.backfill {
            Some(buffer) => buffer.append(payload),
            None => warn!("Backfill chunk arrived with no active buffer"),
        }
    }

    // Shared plumbing

    async fn execute<R: RxFrame>(&mut self, frame: &dyn TxFrame) -> Result<R> {
        self.execute_on(Endpoint::Control, frame).await
    }

    async fn execute_on<R: RxFrame>(
        &mut self,
        endpoint: Endpoint,
        frame: &dyn TxFrame,
    ) -> Result<R> {
        self.runner
            .execute(Transaction::new(endpoint, frame, self.config.command_timeout))
            .await
    }

    /// Emit a live reading unless its identity key was already delivered,
    /// live or via a backfill batch
    fn emit_reading(&mut self, reading: GlucoseReading) {
        if self.emitted.insert(reading.device_timestamp) {
            self.sink.on_reading(&reading);
        } else {
            debug!(
                "Suppressing duplicate reading at device time {}",
                reading.device_timestamp
            );
        }
    }
}

fn device_seconds(clock: &ActivationClock, at: DateTime<Utc>) -> u32 {
    (at - clock.activated_at()).num_seconds().max(0) as u32
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crc::crc16;
    use crate::messages::TxFrame;
    use crate::transport::testing::MockTransport;
    use std::sync::Mutex;

    fn from_hex(hex: &str) -> Vec<u8> {
        (0..hex.len())
            .step_by(2)
            .map(|i| u8::from_str_radix(&hex[i..i + 2], 16).unwrap())
            .collect()
    }

    fn with_crc(mut body: Vec<u8>) -> Vec<u8> {
        let crc = crc16(&body);
        body.extend_from_slice(&crc.to_le_bytes());
        body
    }

    fn time_sync_frame(current_time: u32) -> Vec<u8> {
        let mut body = vec![0x25, 0x00];
        body.extend_from_slice(&current_time.to_le_bytes());
        body.extend_from_slice(&0u32.to_le_bytes());
        with_crc(body)
    }

    fn glucose_frame(timestamp: u32, glucose: u16) -> Vec<u8> {
        let mut body = vec![0x31, 0x00];
        body.extend_from_slice(&1u32.to_le_bytes());
        body.extend_from_slice(&timestamp.to_le_bytes());
        body.extend_from_slice(&glucose.to_le_bytes());
        body.push(0x06);
        body.push(0x00);
        with_crc(body)
    }

    fn calibration_frame(glucose: u16, timestamp: u32) -> Vec<u8> {
        let mut body = vec![0x33, 0x00];
        body.extend_from_slice(&glucose.to_le_bytes());
        body.extend_from_slice(&timestamp.to_le_bytes());
        with_crc(body)
    }

    fn notification(endpoint: Endpoint, payload: Vec<u8>) -> Notification {
        Notification { endpoint, payload }
    }

    /// Scripts a device that answers the token challenge correctly
    fn script_successful_auth(transport: &MockTransport, device_id: &DeviceId, bonded: bool) {
        let id = device_id.clone();
        transport.push_reply_with(move |_, written| {
            // written = opcode, token, protocol version
            let token: [u8; 8] = written[1..9].try_into().unwrap();
            let mut payload = vec![0x03];
            payload.extend_from_slice(&id.compute_hash(&token));
            payload.extend_from_slice(&[0x55; 8]);
            vec![notification(Endpoint::Authentication, payload)]
        });
        transport.push_reply(vec![notification(
            Endpoint::Authentication,
            vec![0x05, 0x01, u8::from(bonded)],
        )]);
    }

    #[derive(Default)]
    struct RecordingSink {
        readings: Mutex<Vec<GlucoseReading>>,
        batches: Mutex<Vec<Vec<GlucoseReading>>>,
        unknown: Mutex<Vec<Vec<u8>>>,
        errors: Mutex<Vec<String>>,
    }

    impl TelemetrySink for RecordingSink {
        fn on_reading(&self, reading: &GlucoseReading) {
            self.readings.lock().unwrap().push(reading.clone());
        }

        fn on_backfill_batch(&self, batch: &[GlucoseReading]) {
            self.batches.lock().unwrap().push(batch.to_vec());
        }

        fn on_unknown_data(&self, data: &[u8]) {
            self.unknown.lock().unwrap().push(data.to_vec());
        }

        fn on_session_error(&self, error: &LinkError) {
            self.errors.lock().unwrap().push(error.to_string());
        }
    }

    struct QueueSource {
        pending: Mutex<Vec<DeviceCommand>>,
        completed: Mutex<Vec<DeviceCommand>>,
        failed: Mutex<Vec<DeviceCommand>>,
    }

    impl QueueSource {
        fn new(commands: Vec<DeviceCommand>) -> Self {
            Self {
                pending: Mutex::new(commands),
                completed: Mutex::new(Vec::new()),
                failed: Mutex::new(Vec::new()),
            }
        }
    }

    impl CommandSource for QueueSource {
        fn dequeue_pending_command(&self) -> Option<DeviceCommand> {
            let mut pending = self.pending.lock().unwrap();
            if pending.is_empty() {
                None
            } else {
                Some(pending.remove(0))
            }
        }

        fn on_command_complete(&self, command: &DeviceCommand) {
            self.completed.lock().unwrap().push(command.clone());
        }

        fn on_command_failed(&self, command: &DeviceCommand, _error: &LinkError) {
            self.failed.lock().unwrap().push(command.clone());
        }
    }

    fn session(
        transport: Arc<MockTransport>,
        notifications: mpsc::Receiver<Notification>,
        sink: Arc<RecordingSink>,
        source: Option<Arc<dyn CommandSource>>,
        config: SessionConfig,
    ) -> DeviceSession {
        DeviceSession::new(
            DeviceId::new("ABCDEF").unwrap(),
            transport,
            notifications,
            sink,
            source,
            config,
        )
    }

    #[tokio::test(start_paused = true)]
    async fn test_active_session_reads_telemetry() {
        let (transport, rx) = MockTransport::new();
        let device_id = DeviceId::new("ABCDEF").unwrap();
        script_successful_auth(&transport, &device_id, true);
        transport.push_reply(vec![notification(Endpoint::Control, time_sync_frame(10_000))]);
        transport.push_reply(vec![notification(
            Endpoint::Control,
            glucose_frame(9_900, 120),
        )]);
        transport.push_reply(vec![notification(
            Endpoint::Control,
            calibration_frame(101, 9_000),
        )]);

        let transport = Arc::new(transport);
        let sink = Arc::new(RecordingSink::default());
        let result = session(
            transport.clone(),
            rx,
            sink.clone(),
            None,
            SessionConfig::default(),
        )
        .run()
        .await;

        assert!(result.is_ok());
        let readings = sink.readings.lock().unwrap();
        assert_eq!(readings.len(), 1);
        assert_eq!(readings[0].glucose, 120);
        assert_eq!(readings[0].device_timestamp, 9_900);
        let calibration = readings[0].calibration.unwrap();
        assert_eq!(calibration.glucose, 101);
        assert!(sink.errors.lock().unwrap().is_empty());

        // Auth request, challenge answer, time sync, glucose, calibration,
        // then the best-effort disconnect command
        let writes = transport.written();
        assert_eq!(writes.len(), 6);
        assert_eq!(writes[0].0, Endpoint::Authentication);
        assert_eq!(writes[5].1, DisconnectTx.encode());
    }

    #[tokio::test(start_paused = true)]
    async fn test_auth_mismatch_is_fatal_and_stops_writes() {
        let (transport, rx) = MockTransport::new();
        // Device answers with a bogus token hash
        transport.push_reply_with(move |_, _| {
            let mut payload = vec![0x03];
            payload.extend_from_slice(&[0xde; 8]);
            payload.extend_from_slice(&[0x55; 8]);
            vec![notification(Endpoint::Authentication, payload)]
        });

        let transport = Arc::new(transport);
        let sink = Arc::new(RecordingSink::default());
        let result = session(
            transport.clone(),
            rx,
            sink.clone(),
            None,
            SessionConfig::default(),
        )
        .run()
        .await;

        assert!(matches!(result, Err(LinkError::Authentication(_))));
        // Only the opening auth request was ever written
        assert_eq!(transport.written().len(), 1);
        assert_eq!(sink.errors.lock().unwrap().len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_bond_requested_when_not_bonded() {
        let (transport, rx) = MockTransport::new();
        let device_id = DeviceId::new("ABCDEF").unwrap();
        script_successful_auth(&transport, &device_id, false);
        // Keep-alive and bond request consume no replies; queue the rest
        transport.push_reply(vec![]);
        transport.push_reply(vec![]);
        transport.push_reply(vec![notification(Endpoint::Control, time_sync_frame(10_000))]);
        transport.push_reply(vec![notification(
            Endpoint::Control,
            glucose_frame(9_900, 95),
        )]);
        transport.push_reply(vec![notification(
            Endpoint::Control,
            calibration_frame(101, 9_000),
        )]);

        let transport = Arc::new(transport);
        let sink = Arc::new(RecordingSink::default());
        session(
            transport.clone(),
            rx,
            sink.clone(),
            None,
            SessionConfig::default(),
        )
        .run()
        .await
        .unwrap();

        let writes = transport.written();
        // Keep-alive then bond request follow the challenge answer
        assert_eq!(writes[2].1, KeepAliveTx { seconds: 25 }.encode());
        assert_eq!(writes[3].1, BondRequestTx.encode());
        assert_eq!(writes[2].0, Endpoint::Authentication);
    }

    #[tokio::test(start_paused = true)]
    async fn test_calibration_failure_degrades_gracefully() {
        let (transport, rx) = MockTransport::new();
        let device_id = DeviceId::new("ABCDEF").unwrap();
        script_successful_auth(&transport, &device_id, true);
        transport.push_reply(vec![notification(Endpoint::Control, time_sync_frame(10_000))]);
        transport.push_reply(vec![notification(
            Endpoint::Control,
            glucose_frame(9_900, 140),
        )]);
        // No reply for the calibration read: it times out

        let transport = Arc::new(transport);
        let sink = Arc::new(RecordingSink::default());
        let result = session(
            transport.clone(),
            rx,
            sink.clone(),
            None,
            SessionConfig::default(),
        )
        .run()
        .await;

        assert!(result.is_ok());
        let readings = sink.readings.lock().unwrap();
        assert_eq!(readings.len(), 1);
        assert!(readings[0].calibration.is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn test_command_drain_continues_after_failure() {
        let (transport, rx) = MockTransport::new();
        let device_id = DeviceId::new("ABCDEF").unwrap();
        script_successful_auth(&transport, &device_id, true);
        transport.push_reply(vec![notification(Endpoint::Control, time_sync_frame(10_000))]);
        // First command gets no reply (timeout); second succeeds
        transport.push_reply(vec![]);
        transport.push_reply(vec![notification(
            Endpoint::Control,
            with_crc(vec![0x43, 0x00]),
        )]);
        transport.push_reply(vec![notification(
            Endpoint::Control,
            glucose_frame(9_900, 110),
        )]);
        transport.push_reply(vec![notification(
            Endpoint::Control,
            calibration_frame(99, 9_000),
        )]);

        let source = Arc::new(QueueSource::new(vec![
            DeviceCommand::Calibrate {
                glucose: 100,
                at: Utc::now(),
            },
            DeviceCommand::Reset,
        ]));
        let transport = Arc::new(transport);
        let sink = Arc::new(RecordingSink::default());
        session(
            transport.clone(),
            rx,
            sink.clone(),
            Some(source.clone()),
            SessionConfig::default(),
        )
        .run()
        .await
        .unwrap();

        assert_eq!(source.failed.lock().unwrap().len(), 1);
        assert_eq!(
            source.completed.lock().unwrap().as_slice(),
            &[DeviceCommand::Reset]
        );
        // The drain continued and telemetry was still read
        assert_eq!(sink.readings.lock().unwrap().len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_passive_session_dispatches_by_opcode() {
        let (transport, rx) = MockTransport::new();
        let transport = Arc::new(transport);

        // Another controller authenticates; then telemetry flows
        transport
            .notify(Endpoint::Authentication, vec![0x05, 0x01, 0x01])
            .await;
        transport
            .notify(Endpoint::Control, time_sync_frame(5_440_614))
            .await;
        transport
            .notify(Endpoint::Control, calibration_frame(101, 5_000_000))
            .await;
        transport
            .notify(Endpoint::Control, glucose_frame(5_440_614, 121))
            .await;
        // Unknown leading opcode is surfaced raw
        transport.notify(Endpoint::Control, vec![0x7f, 0x01]).await;
        // Recognized but unhandled opcode is ignored by design
        transport
            .notify(Endpoint::Control, with_crc(vec![0x43, 0x00]))
            .await;
        transport.close();

        let sink = Arc::new(RecordingSink::default());
        let config = SessionConfig {
            passive: true,
            ..SessionConfig::default()
        };
        session(transport.clone(), rx, sink.clone(), None, config)
            .run()
            .await
            .unwrap();

        let readings = sink.readings.lock().unwrap();
        assert_eq!(readings.len(), 1);
        assert_eq!(readings[0].glucose, 121);
        assert_eq!(readings[0].calibration.unwrap().glucose, 101);
        assert_eq!(sink.unknown.lock().unwrap().as_slice(), &[vec![0x7f, 0x01]]);
        assert!(sink.errors.lock().unwrap().is_empty());
        // Control and backfill notifications were enabled along the way
        let subscriptions = transport.subscriptions.lock().unwrap();
        assert!(subscriptions.contains(&Endpoint::Control));
        assert!(subscriptions.contains(&Endpoint::Backfill));
    }

    #[tokio::test(start_paused = true)]
    async fn test_passive_glucose_without_clock_is_observation_error() {
        let (transport, rx) = MockTransport::new();
        let transport = Arc::new(transport);

        transport
            .notify(Endpoint::Control, glucose_frame(5_440_614, 121))
            .await;
        transport.close();

        let sink = Arc::new(RecordingSink::default());
        let config = SessionConfig {
            passive: true,
            ..SessionConfig::default()
        };
        session(transport.clone(), rx, sink.clone(), None, config)
            .run()
            .await
            .unwrap();

        assert!(sink.readings.lock().unwrap().is_empty());
        let errors = sink.errors.lock().unwrap();
        assert_eq!(errors.len(), 1);
        assert!(errors[0].contains("Observation"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_passive_backfill_batch_and_deduplication() {
        let (transport, rx) = MockTransport::new();
        let transport = Arc::new(transport);

        transport
            .notify(Endpoint::Control, time_sync_frame(5_440_614))
            .await;
        // Recorded 50-byte backfill capture, chunked
        transport
            .notify(
                Endpoint::Backfill,
                from_hex("0100bc460000b7ff52008b0006eee30053008500"),
            )
            .await;
        transport
            .notify(
                Endpoint::Backfill,
                from_hex("020006eb0f025300800006ee3a0353007e0006f5"),
            )
            .await;
        transport
            .notify(Endpoint::Backfill, from_hex("030066045300790006f8"))
            .await;
        transport
            .notify(
                Endpoint::Control,
                from_hex("51000100b7ff52006604530032000000e6cb9805"),
            )
            .await;
        // A live reading that duplicates the last backfilled record
        transport
            .notify(Endpoint::Control, glucose_frame(5_440_614, 121))
            .await;
        // And one genuinely new reading
        transport
            .notify(Endpoint::Control, glucose_frame(5_440_914, 118))
            .await;
        transport.close();

        let sink = Arc::new(RecordingSink::default());
        let config = SessionConfig {
            passive: true,
            ..SessionConfig::default()
        };
        session(transport.clone(), rx, sink.clone(), None, config)
            .run()
            .await
            .unwrap();

        let batches = sink.batches.lock().unwrap();
        assert_eq!(batches.len(), 1);
        assert_eq!(batches[0].len(), 5);
        assert_eq!(batches[0][0].glucose, 139);
        assert_eq!(batches[0][4].device_timestamp, 5_440_614);

        // The duplicate live reading was suppressed; the new one delivered
        let readings = sink.readings.lock().unwrap();
        assert_eq!(readings.len(), 1);
        assert_eq!(readings[0].device_timestamp, 5_440_914);
        assert!(sink.errors.lock().unwrap().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_passive_backfill_length_mismatch_rejected() {
        let (transport, rx) = MockTransport::new();
        let transport = Arc::new(transport);

        transport
            .notify(Endpoint::Control, time_sync_frame(5_440_614))
            .await;
        // Only 38 of the declared 50 bytes arrive
        transport
            .notify(
                Endpoint::Backfill,
                from_hex("0100bc460000b7ff52008b0006eee30053008500"),
            )
            .await;
        transport
            .notify(
                Endpoint::Backfill,
                from_hex("020006eb0f025300800006ee3a0353007e00"),
            )
            .await;
        transport
            .notify(
                Endpoint::Control,
                from_hex("51000100b7ff52006604530032000000e6cb9805"),
            )
            .await;
        transport.close();

        let sink = Arc::new(RecordingSink::default());
        let config = SessionConfig {
            passive: true,
            ..SessionConfig::default()
        };
        session(transport.clone(), rx, sink.clone(), None, config)
            .run()
            .await
            .unwrap();

        assert!(sink.batches.lock().unwrap().is_empty());
        let errors = sink.errors.lock().unwrap();
        assert_eq!(errors.len(), 1);
        assert!(errors[0].contains("rejected"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_passive_new_marker_replaces_unfinished_buffer() {
        let (transport, rx) = MockTransport::new();
        let transport = Arc::new(transport);

        transport
            .notify(Endpoint::Control, time_sync_frame(5_440_614))
            .await;
        // An unfinished buffer from an earlier stream
        transport
            .notify(Endpoint::Backfill, from_hex("01c0deadbeef"))
            .await;
        // A fresh stream restarts accumulation wholesale
        transport
            .notify(
                Endpoint::Backfill,
                from_hex("0100bc460000b7ff52008b0006eee30053008500"),
            )
            .await;
        transport
            .notify(
                Endpoint::Backfill,
                from_hex("020006eb0f025300800006ee3a0353007e0006f5"),
            )
            .await;
        transport
            .notify(Endpoint::Backfill, from_hex("030066045300790006f8"))
            .await;
        transport
            .notify(
                Endpoint::Control,
                from_hex("51000100b7ff52006604530032000000e6cb9805"),
            )
            .await;
        transport.close();

        let sink = Arc::new(RecordingSink::default());
        let config = SessionConfig {
            passive: true,
            ..SessionConfig::default()
        };
        session(transport.clone(), rx, sink.clone(), None, config)
            .run()
            .await
            .unwrap();

        assert_eq!(sink.batches.lock().unwrap().len(), 1);
        assert!(sink.errors.lock().unwrap().is_empty());
    }
}
