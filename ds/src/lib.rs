//! Station transport layer: shipments, the transport capability the client
//! session drives, and an in-process loopback implementation.

pub mod error;
pub mod memory;
pub mod transport;

pub use error::TransportError;
pub use memory::{MemoryTransport, MemoryTransportFactory};
pub use transport::{
    ConnectionStatus, InboundPacket, PollOutcome, Priority, Shipment, StatusEvent, Transport,
    TransportFactory,
};
