//! Transport-agnostic shipments + station transport interface.

use std::{fmt::Display, sync::Arc};

use tokio::sync::broadcast;

use crate::TransportError;

/// Ordering weight of a shipment. The delivery queue serves higher values first.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Priority(pub i32);

impl Priority {
    /// Handshake requests.
    pub const HANDSHAKE: Priority = Priority(-1);
    pub const DEFAULT: Priority = Priority(0);
    /// Document, login and report broadcasts.
    pub const BROADCAST: Priority = Priority(1);
}

impl Default for Priority {
    fn default() -> Self {
        Priority::DEFAULT
    }
}

/// An immutable, already serialized unit that should be pushed to the station.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Shipment {
    pub payload: Vec<u8>,
    pub priority: Priority,
    /// Id of the message this shipment was packed from, if any.
    pub origin: Option<String>,
}

impl Shipment {
    pub fn new(payload: Vec<u8>, priority: Priority, origin: Option<&str>) -> Self {
        Self {
            payload,
            priority,
            origin: origin.map(|s| s.to_string()),
        }
    }
}

/// A packet delivered from the station into the application.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InboundPacket {
    pub payload: Vec<u8>,
    /// Remote address the packet arrived from.
    pub remote: String,
    /// Optional transport timestamp (for logging/diagnostics).
    pub timestamp: Option<i64>,
}

impl InboundPacket {
    pub fn new(payload: Vec<u8>, remote: &str, timestamp: Option<i64>) -> Self {
        Self {
            payload,
            remote: remote.to_string(),
            timestamp,
        }
    }
}

/// Connectivity of the underlying channel as reported by the transport.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionStatus {
    Idle,
    Connecting,
    Ready,
    Error,
}

impl Display for ConnectionStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let status = match self {
            ConnectionStatus::Idle => "Idle",
            ConnectionStatus::Connecting => "Connecting",
            ConnectionStatus::Ready => "Ready",
            ConnectionStatus::Error => "Error",
        };
        write!(f, "{status}")
    }
}

/// Asynchronous connectivity change, stamped with the time (ms) it was observed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StatusEvent {
    pub status: ConnectionStatus,
    pub timestamp: u64,
}

impl StatusEvent {
    pub fn new(status: ConnectionStatus, timestamp: u64) -> Self {
        Self { status, timestamp }
    }
}

/// What a single I/O pump moved.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PollOutcome {
    pub incoming: bool,
    pub outgoing: bool,
}

impl PollOutcome {
    pub fn is_busy(&self) -> bool {
        self.incoming || self.outgoing
    }
}

pub trait Transport: Send + Sync + 'static {
    /// Start connecting to `remote`. Completion is reported through the status channel.
    fn connect(&self, remote: &str) -> Result<(), TransportError>;

    /// Push one shipment to `destination`.
    ///
    /// `Ok(false)` means the transport could not take it right now and the caller
    /// may retry; `Err` is an I/O failure of the channel itself.
    fn push(&self, shipment: &Shipment, destination: &str) -> Result<bool, TransportError>;

    /// Pump pending socket I/O once.
    fn poll(&self) -> Result<PollOutcome, TransportError>;

    /// Current connectivity.
    fn status(&self) -> ConnectionStatus;

    /// Subscribe to inbound packets.
    fn subscribe(&self) -> broadcast::Receiver<InboundPacket>;

    /// Subscribe to connectivity changes.
    fn subscribe_status(&self) -> broadcast::Receiver<StatusEvent>;

    fn close(&self);
}

/// Builds one transport per station endpoint.
pub trait TransportFactory: Send + Sync + 'static {
    fn create(&self, host: &str, port: u16) -> Result<Arc<dyn Transport>, TransportError>;
}
