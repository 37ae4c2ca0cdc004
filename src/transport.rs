//! Transport interface consumed by the link layer
//!
//! The physical wireless transport (scanning, pairing, GATT plumbing) is a
//! thin external collaborator. The core only needs connect/disconnect, an
//! acknowledged write, subscription control, and a stream of notifications.
//! Platform crates implement [`LinkTransport`]; tests use an in-memory mock.

use crate::types::Result;
use async_trait::async_trait;
use tokio::sync::mpsc;

/// An addressable read/write/notify channel on a device link
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Endpoint {
    /// Handshake and bonding traffic
    Authentication,
    /// Command/response traffic on current-generation hardware
    Control,
    /// Raw historical-record chunk stream
    Backfill,
    /// Buffered command/response traffic on older hardware generations
    Data,
}

/// Whether a write must be acknowledged by the device before completing
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WriteMode {
    Acknowledged,
    Unacknowledged,
}

/// An inbound notification from the device
#[derive(Debug, Clone)]
pub struct Notification {
    pub endpoint: Endpoint,
    pub payload: Vec<u8>,
}

/// Platform transport operations for one device link
///
/// `write` with [`WriteMode::Acknowledged`] must not return until the
/// device has acknowledged the write (or the link has failed); this is the
/// write-acknowledged completion condition of a transaction. Notifications
/// are delivered in arrival order through the channel handed to the link's
/// owner at connection time.
#[async_trait]
pub trait LinkTransport: Send + Sync {
    async fn connect(&self) -> Result<()>;

    async fn disconnect(&self) -> Result<()>;

    async fn write(&self, endpoint: Endpoint, payload: &[u8], mode: WriteMode) -> Result<()>;

    async fn subscribe(&self, endpoint: Endpoint) -> Result<()>;

    async fn unsubscribe(&self, endpoint: Endpoint) -> Result<()>;
}

/// Channel pair for delivering notifications to a link's owning task
pub fn notification_channel() -> (mpsc::Sender<Notification>, mpsc::Receiver<Notification>) {
    mpsc::channel(64)
}
