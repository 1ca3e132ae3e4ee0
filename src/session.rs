//! One connection to one station.
//!
//! A [`Session`] owns the transport, the delivery queue and the lifecycle
//! state machine for a single station endpoint. It is shared between the
//! runner task (the only thing that moves the state machine) and caller tasks
//! that queue shipments or inspect state.

use std::sync::{
    atomic::{AtomicBool, Ordering},
    Arc,
};

use ds::{ConnectionStatus, InboundPacket, Shipment, StatusEvent, Transport, TransportError};
use log::{debug, info, warn};
use parking_lot::{Mutex, RwLock};
use tokio::sync::broadcast::{self, error::TryRecvError};
use uuid::Uuid;

use crate::{
    config::ClientConfig,
    error::SessionError,
    protocol::{EntityId, MessageRef},
    queue::{DeliveryQueue, RetryPolicy},
    state_machine::{SessionContext, SessionState, SessionStateMachine, Transition},
};

#[derive(Debug)]
struct Activity {
    active: bool,
    /// Timestamp of the last applied activity change.
    changed_at: u64,
    connection: ConnectionStatus,
    /// Timestamp of the last applied status event.
    status_at: u64,
}

pub struct Session {
    /// Distinguishes reconnects to the same station in logs.
    id: Uuid,
    station: EntityId,
    host: String,
    port: u16,
    remote: String,
    transport: Arc<dyn Transport>,
    queue: DeliveryQueue,
    identity: RwLock<Option<EntityId>>,
    key: RwLock<Option<String>>,
    machine: Mutex<SessionStateMachine>,
    activity: Mutex<Activity>,
    transport_failed: AtomicBool,
    inbound: Mutex<broadcast::Receiver<InboundPacket>>,
    status_events: Mutex<broadcast::Receiver<StatusEvent>>,
}

impl Session {
    pub fn new(
        station: EntityId,
        host: &str,
        port: u16,
        transport: Arc<dyn Transport>,
        config: &ClientConfig,
        now: u64,
    ) -> Self {
        let inbound = transport.subscribe();
        let status_events = transport.subscribe_status();
        Self {
            id: Uuid::new_v4(),
            station,
            host: host.to_string(),
            port,
            remote: format!("{host}:{port}"),
            transport,
            queue: DeliveryQueue::new(RetryPolicy::from(config)),
            identity: RwLock::new(None),
            key: RwLock::new(None),
            machine: Mutex::new(SessionStateMachine::new(now, config.handshake_timeout)),
            activity: Mutex::new(Activity {
                active: false,
                changed_at: 0,
                connection: ConnectionStatus::Idle,
                status_at: 0,
            }),
            transport_failed: AtomicBool::new(false),
            inbound: Mutex::new(inbound),
            status_events: Mutex::new(status_events),
        }
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn station(&self) -> &EntityId {
        &self.station
    }

    pub fn host(&self) -> &str {
        &self.host
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    /// `host:port` of the station.
    pub fn remote(&self) -> &str {
        &self.remote
    }

    pub fn transport(&self) -> &Arc<dyn Transport> {
        &self.transport
    }

    pub fn queue(&self) -> &DeliveryQueue {
        &self.queue
    }

    pub fn identity(&self) -> Option<EntityId> {
        self.identity.read().clone()
    }

    /// Bind (or unbind) the signed-in identity. Returns whether it changed.
    /// A new identity invalidates the session key.
    pub fn set_identity(&self, identity: Option<EntityId>) -> bool {
        let mut current = self.identity.write();
        if *current == identity {
            return false;
        }
        info!(
            "Session identity changed: {:?} -> {:?}",
            current.as_ref().map(|id| id.to_string()),
            identity.as_ref().map(|id| id.to_string())
        );
        *current = identity;
        *self.key.write() = None;
        true
    }

    pub fn session_key(&self) -> Option<String> {
        self.key.read().clone()
    }

    pub fn set_session_key(&self, key: Option<String>) -> bool {
        let mut current = self.key.write();
        if *current == key {
            return false;
        }
        *current = key;
        true
    }

    pub fn is_active(&self) -> bool {
        self.activity.lock().active
    }

    /// Apply an activity change only if the flag differs and `when` is strictly
    /// newer than the last applied change.
    pub fn set_active(&self, flag: bool, when: u64) -> bool {
        let mut activity = self.activity.lock();
        if activity.active == flag || when <= activity.changed_at {
            return false;
        }
        activity.active = flag;
        activity.changed_at = when;
        true
    }

    pub fn connection(&self) -> ConnectionStatus {
        self.activity.lock().connection
    }

    /// Fold one connectivity event into the session, ignoring out-of-order ones.
    pub(crate) fn apply_status(&self, event: &StatusEvent) -> bool {
        {
            let mut activity = self.activity.lock();
            if event.timestamp <= activity.status_at {
                debug!(
                    "Ignoring stale status {} at {} (last {})",
                    event.status, event.timestamp, activity.status_at
                );
                return false;
            }
            activity.status_at = event.timestamp;
            activity.connection = event.status;
        }
        if event.status == ConnectionStatus::Error {
            self.transport_failed.store(true, Ordering::SeqCst);
        }
        self.set_active(event.status == ConnectionStatus::Ready, event.timestamp);
        true
    }

    /// Flag the transport as failed. Returns false if it already was.
    pub fn mark_transport_failed(&self, error: &TransportError) -> bool {
        if self.transport_failed.swap(true, Ordering::SeqCst) {
            debug!("Transport on {} still failing: {error}", self.remote);
            return false;
        }
        warn!("Transport failure on {}: {error}", self.remote);
        true
    }

    /// Ask the transport to connect to the station.
    pub fn connect(&self) -> Result<(), TransportError> {
        self.transport.connect(&self.remote).map_err(|e| {
            self.mark_transport_failed(&e);
            e
        })
    }

    pub fn close(&self) {
        self.transport.close();
    }

    pub fn state(&self) -> SessionState {
        self.machine.lock().current_state()
    }

    pub fn is_paused(&self) -> bool {
        self.machine.lock().is_paused()
    }

    pub fn pause(&self) {
        self.machine.lock().pause();
    }

    pub fn resume(&self) {
        self.machine.lock().resume();
    }

    /// Leave Error and start over from Default with a clean transport flag.
    pub fn reset(&self, now: u64) -> Result<Transition, SessionError> {
        let transition = self.machine.lock().reset(now)?;
        self.transport_failed.store(false, Ordering::SeqCst);
        {
            let mut activity = self.activity.lock();
            activity.connection = ConnectionStatus::Idle;
            activity.active = false;
        }
        *self.key.write() = None;
        Ok(transition)
    }

    pub(crate) fn context(&self) -> SessionContext {
        SessionContext {
            has_identity: self.identity.read().is_some(),
            has_key: self.key.read().is_some(),
            connection: self.connection(),
            transport_failed: self.transport_failed.load(Ordering::SeqCst),
        }
    }

    pub(crate) fn evaluate(&self, now: u64) -> Option<Transition> {
        let ctx = self.context();
        self.machine.lock().evaluate(&ctx, now)
    }

    pub(crate) fn commit(&self, transition: &Transition) -> Result<(), SessionError> {
        self.machine.lock().commit(transition)
    }

    /// Queue a packed message. False if the same message is already queued.
    pub fn queue_shipment(&self, message: MessageRef, shipment: Shipment, now: u64) -> bool {
        self.queue.append(message, shipment, now)
    }

    pub(crate) fn drain_inbound(&self) -> Vec<InboundPacket> {
        drain(&mut *self.inbound.lock())
    }

    pub(crate) fn drain_status_events(&self) -> Vec<StatusEvent> {
        drain(&mut *self.status_events.lock())
    }
}

fn drain<T: Clone>(rx: &mut broadcast::Receiver<T>) -> Vec<T> {
    let mut items = Vec::new();
    loop {
        match rx.try_recv() {
            Ok(item) => items.push(item),
            Err(TryRecvError::Lagged(skipped)) => {
                warn!("Session lagged behind transport, skipped {skipped} events");
            }
            Err(TryRecvError::Empty) | Err(TryRecvError::Closed) => break,
        }
    }
    items
}

#[cfg(test)]
mod tests {
    use ds::MemoryTransport;

    use super::*;
    use crate::state_machine::SessionStateKind;

    fn session(transport: Arc<MemoryTransport>) -> Session {
        Session::new(
            EntityId::any_station(),
            "127.0.0.1",
            9394,
            transport,
            &ClientConfig::default(),
            0,
        )
    }

    #[test]
    fn test_set_identity_reports_change_and_drops_key() {
        let session = session(Arc::new(MemoryTransport::new()));
        let alice = EntityId::user("alice", "moky");

        assert!(session.set_identity(Some(alice.clone())));
        assert!(!session.set_identity(Some(alice)));
        session.set_session_key(Some("key".to_string()));

        assert!(session.set_identity(Some(EntityId::user("bob", "moky"))));
        assert_eq!(session.session_key(), None);
    }

    #[test]
    fn test_set_active_debounce() {
        let session = session(Arc::new(MemoryTransport::new()));
        assert!(session.set_active(true, 10));
        // Same flag
        assert!(!session.set_active(true, 20));
        // Older than the last applied change
        assert!(!session.set_active(false, 5));
        assert!(!session.set_active(false, 10));
        assert!(session.is_active());
        assert!(session.set_active(false, 11));
        assert!(!session.is_active());
    }

    #[test]
    fn test_out_of_order_status_ignored() {
        let transport = Arc::new(MemoryTransport::manual());
        let session = session(transport.clone());

        transport.set_status(ConnectionStatus::Ready, 5);
        transport.set_status(ConnectionStatus::Idle, 3);
        for event in session.drain_status_events() {
            session.apply_status(&event);
        }
        assert_eq!(session.connection(), ConnectionStatus::Ready);
        assert!(session.is_active());
    }

    #[test]
    fn test_reset_clears_transport_failure() {
        let transport = Arc::new(MemoryTransport::new());
        let session = session(transport);
        session.mark_transport_failed(&TransportError::ConnectionLost);

        let transition = session.evaluate(1).expect("should fall into Error");
        session.commit(&transition).expect("Failed to commit");
        assert_eq!(session.state().kind, SessionStateKind::Error);

        session.reset(2).expect("Failed to reset");
        assert_eq!(session.state().kind, SessionStateKind::Default);
        assert!(!session.context().transport_failed);
    }

    #[test]
    fn test_transport_failure_reported_once() {
        let session = session(Arc::new(MemoryTransport::new()));
        assert!(session.mark_transport_failed(&TransportError::ConnectionLost));
        assert!(!session.mark_transport_failed(&TransportError::ConnectionLost));

        let transition = session.evaluate(1).expect("should fall into Error");
        session.commit(&transition).expect("Failed to commit");
        session.reset(2).expect("Failed to reset");
        assert!(session.mark_transport_failed(&TransportError::Closed));
    }
}
