//! In-process loopback transport.
//!
//! Records every pushed shipment and lets the caller inject inbound packets,
//! connectivity changes and push failures. Used by the client tests and the
//! demo binary in place of a socket transport.

use std::{
    collections::VecDeque,
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc,
    },
};

use log::{debug, info};
use parking_lot::Mutex;
use tokio::sync::broadcast;

use crate::{
    ConnectionStatus, InboundPacket, PollOutcome, Shipment, StatusEvent, Transport,
    TransportError, TransportFactory,
};

const CHANNEL_CAPACITY: usize = 100;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum PushFault {
    Refuse,
    Break,
}

#[derive(Debug)]
struct Inner {
    status: ConnectionStatus,
    remote: Option<String>,
    pushed: Vec<(Shipment, String)>,
    faults: VecDeque<PushFault>,
    auto_ready: bool,
    closed: bool,
    pending: PollOutcome,
}

pub struct MemoryTransport {
    inner: Mutex<Inner>,
    /// Logical clock stamping self-generated status events.
    ticks: AtomicU64,
    inbound_tx: broadcast::Sender<InboundPacket>,
    status_tx: broadcast::Sender<StatusEvent>,
}

impl MemoryTransport {
    /// A transport that becomes `Ready` as soon as `connect` is called.
    pub fn new() -> Self {
        Self::with_auto_ready(true)
    }

    /// A transport that stays `Connecting` until `set_status` is called.
    pub fn manual() -> Self {
        Self::with_auto_ready(false)
    }

    fn with_auto_ready(auto_ready: bool) -> Self {
        let (inbound_tx, _) = broadcast::channel(CHANNEL_CAPACITY);
        let (status_tx, _) = broadcast::channel(CHANNEL_CAPACITY);
        Self {
            inner: Mutex::new(Inner {
                status: ConnectionStatus::Idle,
                remote: None,
                pushed: Vec::new(),
                faults: VecDeque::new(),
                auto_ready,
                closed: false,
                pending: PollOutcome::default(),
            }),
            ticks: AtomicU64::new(0),
            inbound_tx,
            status_tx,
        }
    }

    fn next_tick(&self) -> u64 {
        self.ticks.fetch_add(1, Ordering::SeqCst) + 1
    }

    fn emit(&self, status: ConnectionStatus, timestamp: u64) {
        self.inner.lock().status = status;
        // No subscribers is fine: the session may not be listening yet.
        let _ = self.status_tx.send(StatusEvent::new(status, timestamp));
    }

    /// Change connectivity and report it with an explicit timestamp.
    pub fn set_status(&self, status: ConnectionStatus, timestamp: u64) {
        self.ticks.fetch_max(timestamp, Ordering::SeqCst);
        self.emit(status, timestamp);
    }

    /// Change connectivity, stamped with the next logical tick.
    pub fn change_status(&self, status: ConnectionStatus) {
        let tick = self.next_tick();
        self.emit(status, tick);
    }

    /// Hand a packet to subscribers as if the station had sent it.
    pub fn deliver(&self, payload: Vec<u8>) {
        let remote = self.inner.lock().remote.clone().unwrap_or_default();
        self.inner.lock().pending.incoming = true;
        let _ = self.inbound_tx.send(InboundPacket::new(payload, &remote, None));
    }

    /// Make the next `count` pushes return `Ok(false)`.
    pub fn refuse_next_pushes(&self, count: usize) {
        let mut inner = self.inner.lock();
        for _ in 0..count {
            inner.faults.push_back(PushFault::Refuse);
        }
    }

    /// Make the next push fail with a broken connection.
    pub fn break_next_push(&self) {
        self.inner.lock().faults.push_back(PushFault::Break);
    }

    /// Every accepted shipment with its destination, in push order.
    pub fn pushed(&self) -> Vec<(Shipment, String)> {
        self.inner.lock().pushed.clone()
    }

    pub fn take_pushed(&self) -> Vec<(Shipment, String)> {
        std::mem::take(&mut self.inner.lock().pushed)
    }
}

impl Default for MemoryTransport {
    fn default() -> Self {
        Self::new()
    }
}

impl Transport for MemoryTransport {
    fn connect(&self, remote: &str) -> Result<(), TransportError> {
        if remote.is_empty() {
            return Err(TransportError::ConnectFailed(remote.to_string()));
        }
        let auto_ready = {
            let mut inner = self.inner.lock();
            inner.remote = Some(remote.to_string());
            inner.closed = false;
            inner.auto_ready
        };
        info!("[connect] Loopback transport connecting to {remote}");
        self.change_status(ConnectionStatus::Connecting);
        if auto_ready {
            self.change_status(ConnectionStatus::Ready);
        }
        Ok(())
    }

    fn push(&self, shipment: &Shipment, destination: &str) -> Result<bool, TransportError> {
        let mut inner = self.inner.lock();
        if inner.closed {
            return Err(TransportError::Closed);
        }
        if inner.status != ConnectionStatus::Ready {
            return Ok(false);
        }
        match inner.faults.pop_front() {
            Some(PushFault::Refuse) => {
                debug!("Loopback transport refused shipment for {destination}");
                Ok(false)
            }
            Some(PushFault::Break) => {
                drop(inner);
                let tick = self.next_tick();
                self.emit(ConnectionStatus::Error, tick);
                Err(TransportError::ConnectionLost)
            }
            None => {
                inner.pushed.push((shipment.clone(), destination.to_string()));
                inner.pending.outgoing = true;
                Ok(true)
            }
        }
    }

    fn poll(&self) -> Result<PollOutcome, TransportError> {
        let mut inner = self.inner.lock();
        if inner.closed {
            return Err(TransportError::Closed);
        }
        if inner.status == ConnectionStatus::Error {
            return Err(TransportError::ConnectionLost);
        }
        Ok(std::mem::take(&mut inner.pending))
    }

    fn status(&self) -> ConnectionStatus {
        self.inner.lock().status
    }

    fn subscribe(&self) -> broadcast::Receiver<InboundPacket> {
        self.inbound_tx.subscribe()
    }

    fn subscribe_status(&self) -> broadcast::Receiver<StatusEvent> {
        self.status_tx.subscribe()
    }

    fn close(&self) {
        self.inner.lock().closed = true;
        let tick = self.next_tick();
        self.emit(ConnectionStatus::Idle, tick);
    }
}

/// Hands out loopback transports and keeps them reachable for inspection.
#[derive(Default)]
pub struct MemoryTransportFactory {
    created: Mutex<Vec<Arc<MemoryTransport>>>,
}

impl MemoryTransportFactory {
    pub fn new() -> Self {
        Self::default()
    }

    /// The most recently created transport.
    pub fn last(&self) -> Option<Arc<MemoryTransport>> {
        self.created.lock().last().cloned()
    }

    pub fn created_count(&self) -> usize {
        self.created.lock().len()
    }
}

impl TransportFactory for MemoryTransportFactory {
    fn create(&self, host: &str, port: u16) -> Result<Arc<dyn Transport>, TransportError> {
        debug!("Creating loopback transport for {host}:{port}");
        let transport = Arc::new(MemoryTransport::new());
        self.created.lock().push(transport.clone());
        Ok(transport)
    }
}
