//! Serialized command/response transaction engine
//!
//! One transaction runs at a time per device link. A transaction issues
//! exactly one write and then waits until its completion conditions are
//! satisfied: the write acknowledgement, plus (when a response is expected)
//! an inbound notification whose payload decodes to the expected frame.
//! Notifications that are irrelevant, undecodable, or carry the
//! `Interrupted` completion code leave the transaction pending; only a
//! satisfying notification, the deadline, or a link failure resolves it.

use crate::messages::{BufferedFrame, RxFrame, TxFrame};
use crate::response_buffer::ResponseBuffer;
use crate::transport::{Endpoint, LinkTransport, Notification, WriteMode};
use crate::types::{hex_string, CompletionCode, LinkError, Result};
use log::{debug, warn};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::time::{timeout_at, Instant};

/// One in-flight command: target endpoint, payload, and deadline
pub struct Transaction {
    pub endpoint: Endpoint,
    pub payload: Vec<u8>,
    pub write_mode: WriteMode,
    pub timeout: Duration,
}

impl Transaction {
    pub fn new(endpoint: Endpoint, frame: &dyn TxFrame, timeout: Duration) -> Self {
        Self {
            endpoint,
            payload: frame.encode(),
            write_mode: WriteMode::Acknowledged,
            timeout,
        }
    }
}

/// Executes transactions on a device link's single serial context
///
/// The runner owns the link's notification receiver; because every method
/// takes `&mut self`, at most one transaction can be open on the link at a
/// time, by construction. Independent links have independent runners.
pub struct CommandRunner {
    transport: Arc<dyn LinkTransport>,
    notifications: mpsc::Receiver<Notification>,
}

impl CommandRunner {
    pub fn new(
        transport: Arc<dyn LinkTransport>,
        notifications: mpsc::Receiver<Notification>,
    ) -> Self {
        Self {
            transport,
            notifications,
        }
    }

    pub fn transport(&self) -> &Arc<dyn LinkTransport> {
        &self.transport
    }

    /// Receive the next inbound notification, if the link is still up
    ///
    /// Used by passive listening, where no transaction is open.
    pub async fn recv(&mut self) -> Option<Notification> {
        self.notifications.recv().await
    }

    /// Execute a transaction and decode its response
    ///
    /// Resolves exactly once: with the decoded frame, with
    /// [`LinkError::Timeout`] when the deadline elapses, or with
    /// [`LinkError::Transport`] when the link fails.
    pub async fn execute<R: RxFrame>(&mut self, transaction: Transaction) -> Result<R> {
        let deadline = Instant::now() + transaction.timeout;
        self.issue_write(&transaction, deadline).await?;

        loop {
            let notification = self.next_before(deadline).await?;
            if notification.endpoint != transaction.endpoint {
                debug!(
                    "Ignoring notification on {:?} while waiting on {:?}",
                    notification.endpoint, transaction.endpoint
                );
                continue;
            }

            if is_interrupted(&notification.payload) {
                // An idle background listen was preempted; the command is
                // still outstanding.
                debug!("Idle listen interrupted; continuing to wait");
                continue;
            }

            match R::decode(&notification.payload) {
                Some(frame) => return Ok(frame),
                None => {
                    debug!(
                        "Unrecognized payload {}; continuing to wait",
                        hex_string(&notification.payload)
                    );
                }
            }
        }
    }

    /// Execute a transaction whose only completion condition is the write
    /// acknowledgement
    pub async fn execute_no_response(&mut self, transaction: Transaction) -> Result<()> {
        let deadline = Instant::now() + transaction.timeout;
        self.issue_write(&transaction, deadline).await
    }

    /// Execute a transaction against the older buffered response framing
    ///
    /// Notification chunks are accumulated until an end-marker-delimited
    /// segment decodes to a non-`Interrupted` response; that response
    /// (success or terminal code) resolves the transaction. If the deadline
    /// elapses after complete segments arrived but none of them decoded,
    /// the link was done sending and the payload was garbage, which is
    /// [`LinkError::InvalidResponse`] rather than a timeout.
    pub async fn execute_buffered<R: BufferedFrame>(
        &mut self,
        transaction: Transaction,
    ) -> Result<R> {
        let deadline = Instant::now() + transaction.timeout;
        let mut buffer = ResponseBuffer::default();

        self.issue_write(&transaction, deadline).await?;

        loop {
            let notification = match self.next_before(deadline).await {
                Ok(notification) => notification,
                Err(LinkError::Timeout) => {
                    if buffer.has_complete_segment() && buffer.responses::<R>().is_empty() {
                        return Err(LinkError::InvalidResponse(
                            "no decodable segment in completed response".to_string(),
                        ));
                    }
                    return Err(LinkError::Timeout);
                }
                Err(error) => return Err(error),
            };

            if notification.endpoint != transaction.endpoint {
                continue;
            }

            debug!("Buffered chunk: {}", hex_string(&notification.payload));
            buffer.append(&notification.payload);

            for response in buffer.responses::<R>() {
                match response.code() {
                    CompletionCode::Interrupted => {
                        debug!("Buffered response interrupted; continuing to wait");
                    }
                    code => {
                        debug!("Buffered response resolved with {}", code);
                        return Ok(response);
                    }
                }
            }
        }
    }

    async fn issue_write(&mut self, transaction: &Transaction, deadline: Instant) -> Result<()> {
        debug!(
            "Writing {} byte command to {:?}: {}",
            transaction.payload.len(),
            transaction.endpoint,
            hex_string(&transaction.payload)
        );

        match timeout_at(
            deadline,
            self.transport
                .write(transaction.endpoint, &transaction.payload, transaction.write_mode),
        )
        .await
        {
            Ok(result) => result,
            Err(_) => {
                warn!("Write acknowledgement did not arrive before the deadline");
                Err(LinkError::Timeout)
            }
        }
    }

    async fn next_before(&mut self, deadline: Instant) -> Result<Notification> {
        match timeout_at(deadline, self.notifications.recv()).await {
            Ok(Some(notification)) => Ok(notification),
            Ok(None) => Err(LinkError::Transport(
                "link closed while a transaction was pending".to_string(),
            )),
            Err(_) => Err(LinkError::Timeout),
        }
    }
}

/// Whether a payload is the `Interrupted` completion code
///
/// Sent when our command preempted a background idle receive; the same
/// transaction keeps waiting for its real response.
fn is_interrupted(payload: &[u8]) -> bool {
    matches!(
        payload.first().and_then(|&b| CompletionCode::from_u8(b)),
        Some(CompletionCode::Interrupted)
    )
}
