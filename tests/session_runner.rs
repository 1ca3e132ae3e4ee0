//! Integration tests for the session runner: lifecycle transitions, activity
//! debounce, delivery retry/purge and shutdown.

use std::{
    sync::{Arc, Mutex},
    time::Duration,
};

use ds::{ConnectionStatus, InboundPacket, MemoryTransport, Priority, Shipment};
use station_client::{
    state_machine::{Effect, Transition},
    ClientConfig, Clock, EntityId, ManualClock, MessageRef, Session, SessionDelegate, SessionRunner,
    SessionStateKind,
};

// ─────────────────────────── Mock Delegate ───────────────────────────

#[derive(Debug, Clone, PartialEq)]
enum Event {
    Transition {
        from: SessionStateKind,
        to: SessionStateKind,
        effect: Effect,
    },
    Received(Vec<u8>),
    Sent(String),
    Failed { id: String, reason: String },
}

#[derive(Clone, Default)]
struct MockDelegate {
    events: Arc<Mutex<Vec<Event>>>,
}

impl MockDelegate {
    fn events(&self) -> Vec<Event> {
        self.events.lock().unwrap().clone()
    }

    fn push(&self, event: Event) {
        self.events.lock().unwrap().push(event);
    }

    fn transitions(&self) -> Vec<(SessionStateKind, SessionStateKind)> {
        self.events()
            .into_iter()
            .filter_map(|e| match e {
                Event::Transition { from, to, .. } => Some((from, to)),
                _ => None,
            })
            .collect()
    }

    fn failures(&self) -> Vec<(String, String)> {
        self.events()
            .into_iter()
            .filter_map(|e| match e {
                Event::Failed { id, reason } => Some((id, reason)),
                _ => None,
            })
            .collect()
    }
}

impl SessionDelegate for MockDelegate {
    fn after_transition(&self, session: &Session, transition: &Transition) {
        self.push(Event::Transition {
            from: transition.from.kind,
            to: transition.to.kind,
            effect: transition.effect,
        });
        if transition.effect == Effect::Connect {
            let _ = session.connect();
        }
    }

    fn on_received(&self, _session: &Session, packet: InboundPacket) {
        self.push(Event::Received(packet.payload));
    }

    fn on_sent(&self, message: &MessageRef) {
        self.push(Event::Sent(message.id.clone()));
    }

    fn on_failed(&self, message: &MessageRef, reason: &str) {
        self.push(Event::Failed {
            id: message.id.clone(),
            reason: reason.to_string(),
        });
    }
}

// ─────────────────────────── Helpers ───────────────────────────

struct Harness {
    transport: Arc<MemoryTransport>,
    session: Arc<Session>,
    clock: Arc<ManualClock>,
    delegate: MockDelegate,
    runner: SessionRunner,
}

fn harness(transport: MemoryTransport) -> Harness {
    let config = ClientConfig::default();
    let transport = Arc::new(transport);
    let clock = Arc::new(ManualClock::new(1_000));
    let session = Arc::new(Session::new(
        EntityId::any_station(),
        "127.0.0.1",
        9394,
        transport.clone(),
        &config,
        1_000,
    ));
    let delegate = MockDelegate::default();
    let runner = SessionRunner::new(
        session.clone(),
        Arc::new(delegate.clone()),
        clock.clone(),
        &config,
    );
    Harness {
        transport,
        session,
        clock,
        delegate,
        runner,
    }
}

fn message(sn: u64) -> MessageRef {
    MessageRef::new(
        &EntityId::user("alice", "moky"),
        &EntityId::user("bob", "moky"),
        sn,
    )
}

fn queue(h: &Harness, sn: u64, priority: Priority) -> MessageRef {
    let msg = message(sn);
    let shipment = Shipment::new(format!("payload-{sn}").into_bytes(), priority, Some(&msg.id));
    assert!(h
        .session
        .queue_shipment(msg.clone(), shipment, h.clock.now_millis()));
    msg
}

fn drive(h: &Harness, iterations: usize) {
    for _ in 0..iterations {
        h.runner.process();
    }
}

// ─────────────────────────── Lifecycle ───────────────────────────

#[test]
fn test_login_reaches_handshaking() {
    let h = harness(MemoryTransport::new());
    h.session.set_identity(Some(EntityId::user("alice", "moky")));

    drive(&h, 3);

    assert_eq!(
        h.delegate.transitions(),
        vec![
            (SessionStateKind::Default, SessionStateKind::Connecting),
            (SessionStateKind::Connecting, SessionStateKind::Connected),
            (SessionStateKind::Connected, SessionStateKind::Handshaking),
        ]
    );
    assert!(h.delegate.events().contains(&Event::Transition {
        from: SessionStateKind::Connected,
        to: SessionStateKind::Handshaking,
        effect: Effect::SendHandshake,
    }));
    assert!(h.session.is_active());
}

#[test]
fn test_handshake_expires_after_timeout() {
    let h = harness(MemoryTransport::new());
    h.session.set_identity(Some(EntityId::user("alice", "moky")));
    drive(&h, 3);
    assert_eq!(h.session.state().kind, SessionStateKind::Handshaking);

    // Exactly at the timeout nothing happens
    h.clock.advance(Duration::from_millis(30_000));
    drive(&h, 1);
    assert_eq!(h.session.state().kind, SessionStateKind::Handshaking);

    h.clock.advance(Duration::from_millis(1));
    drive(&h, 1);
    assert_eq!(h.session.state().kind, SessionStateKind::Connected);

    // And the handshake is retried
    drive(&h, 1);
    assert_eq!(h.session.state().kind, SessionStateKind::Handshaking);
}

#[test]
fn test_session_key_moves_to_running() {
    let h = harness(MemoryTransport::new());
    h.session.set_identity(Some(EntityId::user("alice", "moky")));
    drive(&h, 3);

    h.session.set_session_key(Some("key".to_string()));
    drive(&h, 1);

    assert_eq!(h.session.state().kind, SessionStateKind::Running);
    assert!(h.delegate.events().contains(&Event::Transition {
        from: SessionStateKind::Handshaking,
        to: SessionStateKind::Running,
        effect: Effect::BroadcastDocuments,
    }));

    // Signing out drops back to Default
    h.session.set_identity(None);
    drive(&h, 1);
    assert_eq!(h.session.state().kind, SessionStateKind::Default);
}

#[test]
fn test_transport_error_forces_error_until_reset() {
    let h = harness(MemoryTransport::new());
    h.session.set_identity(Some(EntityId::user("alice", "moky")));
    drive(&h, 3);

    h.transport.change_status(ConnectionStatus::Error);
    drive(&h, 3);
    assert_eq!(h.session.state().kind, SessionStateKind::Error);
    assert!(h.delegate.events().contains(&Event::Transition {
        from: SessionStateKind::Handshaking,
        to: SessionStateKind::Error,
        effect: Effect::ResetFreshness,
    }));

    // No automatic recovery
    h.transport.change_status(ConnectionStatus::Ready);
    drive(&h, 3);
    assert_eq!(h.session.state().kind, SessionStateKind::Error);

    h.session
        .reset(h.clock.now_millis())
        .expect("Failed to reset session");
    assert_eq!(h.session.state().kind, SessionStateKind::Default);
    // Identity is still bound, so the session reconnects
    drive(&h, 2);
    assert_eq!(h.session.state().kind, SessionStateKind::Connected);
}

#[test]
fn test_failed_transport_is_not_polled() {
    let h = harness(MemoryTransport::new());
    h.session.set_identity(Some(EntityId::user("alice", "moky")));
    drive(&h, 3);
    h.transport.change_status(ConnectionStatus::Error);
    drive(&h, 1);
    assert_eq!(h.session.state().kind, SessionStateKind::Error);

    h.transport.deliver(b"late".to_vec());
    for _ in 0..5 {
        assert!(!h.runner.process());
    }
    assert!(!h
        .delegate
        .events()
        .contains(&Event::Received(b"late".to_vec())));
    assert_eq!(h.session.state().kind, SessionStateKind::Error);
}

#[test]
fn test_paused_session_does_not_move() {
    let h = harness(MemoryTransport::new());
    h.session.pause();
    h.session.set_identity(Some(EntityId::user("alice", "moky")));

    drive(&h, 3);
    assert_eq!(h.session.state().kind, SessionStateKind::Default);
    assert!(h.delegate.events().is_empty());

    h.session.resume();
    drive(&h, 1);
    assert_eq!(h.session.state().kind, SessionStateKind::Connecting);
}

// ─────────────────────────── Activity ───────────────────────────

#[test]
fn test_stale_status_events_are_ignored() {
    let h = harness(MemoryTransport::manual());
    h.transport.set_status(ConnectionStatus::Ready, 5);
    h.transport.set_status(ConnectionStatus::Idle, 3);
    h.transport.set_status(ConnectionStatus::Idle, 5);

    drive(&h, 1);
    assert!(h.session.is_active());
    assert_eq!(h.session.connection(), ConnectionStatus::Ready);

    h.transport.set_status(ConnectionStatus::Idle, 6);
    drive(&h, 1);
    assert!(!h.session.is_active());
}

// ─────────────────────────── Delivery ───────────────────────────

#[test]
fn test_sends_in_priority_order() {
    let h = harness(MemoryTransport::manual());
    h.transport.set_status(ConnectionStatus::Ready, 1);

    let low = queue(&h, 1, Priority::HANDSHAKE);
    let mid = queue(&h, 2, Priority::DEFAULT);
    let high = queue(&h, 3, Priority::BROADCAST);
    // Iterations that only drain transport I/O send nothing
    drive(&h, 6);

    let sent: Vec<Event> = h
        .delegate
        .events()
        .into_iter()
        .filter(|e| matches!(e, Event::Sent(_)))
        .collect();
    assert_eq!(
        sent,
        vec![
            Event::Sent(high.id),
            Event::Sent(mid.id),
            Event::Sent(low.id)
        ]
    );
    assert_eq!(h.transport.pushed().len(), 3);
    assert!(h.session.queue().is_empty());
}

#[test]
fn test_refused_push_retries_then_fails() {
    let h = harness(MemoryTransport::manual());
    h.transport.set_status(ConnectionStatus::Ready, 1);
    h.transport.refuse_next_pushes(10);
    let msg = queue(&h, 1, Priority::DEFAULT);

    for _ in 0..3 {
        drive(&h, 1);
        assert!(h.delegate.failures().is_empty());
        assert!(h.session.queue().contains(&msg.id));
        // Not due again before the retry delay
        drive(&h, 1);
        h.clock.advance(Duration::from_secs(2));
    }
    drive(&h, 1);

    assert_eq!(
        h.delegate.failures(),
        vec![(msg.id.clone(), "transport refused shipment".to_string())]
    );
    assert!(!h.session.queue().contains(&msg.id));
    assert!(h.transport.pushed().is_empty());
}

#[test]
fn test_inactive_session_purges_expired_shipments() {
    let h = harness(MemoryTransport::manual());
    let old = queue(&h, 1, Priority::DEFAULT);
    h.clock.advance(Duration::from_secs(300));
    let fresh = queue(&h, 2, Priority::DEFAULT);

    h.clock.advance(Duration::from_secs(301));
    drive(&h, 1);

    assert_eq!(
        h.delegate.failures(),
        vec![(old.id.clone(), "expired".to_string())]
    );
    assert!(h.session.queue().contains(&fresh.id));
    assert_eq!(h.session.queue().len(), 1);
}

#[test]
fn test_inbound_packets_reach_delegate() {
    let h = harness(MemoryTransport::manual());
    h.transport.set_status(ConnectionStatus::Ready, 1);
    h.transport.deliver(b"hello".to_vec());

    assert!(h.runner.process());
    assert!(h
        .delegate
        .events()
        .contains(&Event::Received(b"hello".to_vec())));
}

#[tokio::test]
async fn test_stop_drops_queue_silently() {
    let h = harness(MemoryTransport::manual());
    queue(&h, 1, Priority::DEFAULT);
    queue(&h, 2, Priority::DEFAULT);
    let Harness {
        session,
        delegate,
        runner,
        ..
    } = h;

    let handle = runner.spawn();
    tokio::time::sleep(Duration::from_millis(50)).await;
    handle.stop().await;

    assert!(session.queue().is_empty());
    assert!(delegate.failures().is_empty());
}
