//! Per-session dispatch loop.
//!
//! Each iteration of [`SessionRunner::process`]:
//!
//! 1. folds pending connectivity events into the session (monotonic debounce),
//! 2. evaluates the state machine and runs the resulting effect,
//! 3. pumps transport I/O and hands inbound packets to the delegate (skipped
//!    while the session sits in Error),
//! 4. purges the queue if the session is inactive, otherwise sends one entry.
//!
//! [`SessionRunner::run`] repeats that with a short sleep after busy
//! iterations and a longer one after idle ones.

use std::{sync::Arc, time::Duration};

use ds::InboundPacket;
use log::{debug, error, info, warn};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::{
    clock::Clock,
    config::ClientConfig,
    protocol::MessageRef,
    queue::{QueueEntry, RetryOutcome},
    session::Session,
    state_machine::{SessionStateKind, Transition},
};

/// Observer the runner reports to. Registered once per runner; the runner
/// never hands out references to itself.
pub trait SessionDelegate: Send + Sync + 'static {
    /// Called before a transition is committed.
    fn before_transition(&self, _session: &Session, _transition: &Transition) {}

    /// Called after a transition is committed; runs its effect.
    fn after_transition(&self, session: &Session, transition: &Transition);

    fn on_received(&self, session: &Session, packet: InboundPacket);

    fn on_sent(&self, _message: &MessageRef) {}

    fn on_failed(&self, _message: &MessageRef, _reason: &str) {}
}

pub struct SessionRunner {
    session: Arc<Session>,
    delegate: Arc<dyn SessionDelegate>,
    clock: Arc<dyn Clock>,
    busy_interval: Duration,
    idle_interval: Duration,
}

/// Handle to a spawned runner task.
pub struct RunnerHandle {
    pub cancel: CancellationToken,
    pub task: JoinHandle<()>,
}

impl RunnerHandle {
    /// Stop the loop and wait for it to drop its queue.
    pub async fn stop(self) {
        self.cancel.cancel();
        if let Err(e) = self.task.await {
            error!("Session runner ended abnormally: {e}");
        }
    }
}

impl SessionRunner {
    pub fn new(
        session: Arc<Session>,
        delegate: Arc<dyn SessionDelegate>,
        clock: Arc<dyn Clock>,
        config: &ClientConfig,
    ) -> Self {
        Self {
            session,
            delegate,
            clock,
            busy_interval: config.busy_interval,
            idle_interval: config.idle_interval,
        }
    }

    pub fn session(&self) -> &Arc<Session> {
        &self.session
    }

    pub fn spawn(self) -> RunnerHandle {
        let cancel = CancellationToken::new();
        let task = tokio::spawn(self.run(cancel.clone()));
        RunnerHandle { cancel, task }
    }

    /// Loop until cancelled, then drop undelivered shipments without reporting them.
    pub async fn run(self, cancel: CancellationToken) {
        info!(
            "Session runner started for {} ({})",
            self.session.remote(),
            self.session.id()
        );
        loop {
            let pause = if self.process() {
                self.busy_interval
            } else {
                self.idle_interval
            };
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = tokio::time::sleep(pause) => {}
            }
        }
        let dropped = self.session.queue().clear();
        info!(
            "Session runner stopped for {} ({}), dropped {dropped} shipments",
            self.session.remote(),
            self.session.id()
        );
    }

    /// One iteration. Returns true if anything was moved.
    pub fn process(&self) -> bool {
        for event in self.session.drain_status_events() {
            self.session.apply_status(&event);
        }
        if self.session.is_paused() {
            return false;
        }
        let now = self.clock.now_millis();
        self.drive_state(now);

        // A failed transport is left alone until the session is reset.
        if self.session.state().kind != SessionStateKind::Error && self.pump_io() {
            return true;
        }
        if !self.session.is_active() {
            self.purge(now);
            return false;
        }
        match self.session.queue().next(now) {
            Some(entry) => {
                self.dispatch(entry, now);
                true
            }
            None => {
                self.purge(now);
                false
            }
        }
    }

    fn drive_state(&self, now: u64) {
        let Some(transition) = self.session.evaluate(now) else {
            return;
        };
        self.delegate.before_transition(&self.session, &transition);
        match self.session.commit(&transition) {
            Ok(()) => self.delegate.after_transition(&self.session, &transition),
            Err(e) => error!("Error committing session transition: {e}"),
        }
    }

    fn pump_io(&self) -> bool {
        let busy = match self.session.transport().poll() {
            Ok(outcome) => outcome.is_busy(),
            Err(e) => {
                self.session.mark_transport_failed(&e);
                false
            }
        };
        let packets = self.session.drain_inbound();
        let received = !packets.is_empty();
        for packet in packets {
            self.delegate.on_received(&self.session, packet);
        }
        busy || received
    }

    fn dispatch(&self, entry: QueueEntry, now: u64) {
        let result = self
            .session
            .transport()
            .push(entry.shipment(), self.session.remote());
        match result {
            Ok(true) => {
                self.session.queue().complete(&entry);
                self.delegate.on_sent(entry.message());
            }
            Ok(false) => self.retry(entry, now, "transport refused shipment"),
            Err(e) => {
                self.session.mark_transport_failed(&e);
                self.retry(entry, now, &e.to_string());
            }
        }
    }

    fn retry(&self, entry: QueueEntry, now: u64, reason: &str) {
        debug!("Push of {} failed: {reason}", entry.message().id);
        match self.session.queue().retry(entry, now) {
            RetryOutcome::Requeued => {}
            RetryOutcome::Exhausted(entry) => self.delegate.on_failed(entry.message(), reason),
        }
    }

    fn purge(&self, now: u64) {
        for entry in self.session.queue().purge(now) {
            warn!("Shipment {} expired before delivery", entry.message().id);
            self.delegate.on_failed(entry.message(), "expired");
        }
    }
}
