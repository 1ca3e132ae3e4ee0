//! Session lifecycle state machine.
//!
//! A session moves through six states while it connects to a station, proves
//! its identity and serves traffic. The machine itself is pure: [`detect`]
//! turns a snapshot of the session into an event, [`lookup`] maps
//! `(state, event)` to the next state plus an [`Effect`] token, and the caller
//! executes the effect between the before/after hooks of the commit.
//!
//! # States
//!
//! - **Default**: no identity bound to the session yet
//! - **Connecting**: identity set, waiting for the transport
//! - **Connected**: transport ready, no handshake in flight
//! - **Handshaking**: handshake sent, waiting for the session key
//! - **Running**: session key accepted, normal traffic
//! - **Error**: transport failure; left only by an explicit reset
//!
//! # State Transitions
//!
//! ```text
//! Default     -- identity assigned ------> Connecting   (effect: Connect)
//! Connecting  -- connection established -> Connected
//! Connecting  -- connect failed ---------> Error        (effect: ResetFreshness)
//! Connected   -- no error ---------------> Handshaking  (effect: SendHandshake)
//! Handshaking -- reply stale (> 30s) ----> Connected
//! Handshaking -- session key accepted ---> Running      (effect: BroadcastDocuments)
//! Running     -- identity/key cleared ---> Default
//! any         -- connection lost --------> Error        (effect: ResetFreshness)
//! Error       -- reset() ----------------> Default
//! ```

use std::{fmt::Display, time::Duration};

use ds::ConnectionStatus;
use log::info;

use crate::error::SessionError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SessionStateKind {
    Default,
    Connecting,
    Connected,
    Handshaking,
    Running,
    Error,
}

impl Display for SessionStateKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = match self {
            SessionStateKind::Default => "Default",
            SessionStateKind::Connecting => "Connecting",
            SessionStateKind::Connected => "Connected",
            SessionStateKind::Handshaking => "Handshaking",
            SessionStateKind::Running => "Running",
            SessionStateKind::Error => "Error",
        };
        write!(f, "{state}")
    }
}

/// Current state plus the time (ms) it was entered.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SessionState {
    pub kind: SessionStateKind,
    pub entered_at: u64,
}

impl SessionState {
    pub fn new(kind: SessionStateKind, entered_at: u64) -> Self {
        Self { kind, entered_at }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SessionEvent {
    IdentityAssigned,
    ConnectionEstablished,
    ConnectFailed,
    NoError,
    ConnectionLost,
    HandshakeExpired,
    KeyAccepted,
    SessionCleared,
    Reset,
}

/// Side effect the caller runs once a transition is committed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Effect {
    None,
    /// Ask the transport to (re)connect.
    Connect,
    /// Queue the first handshake request.
    SendHandshake,
    /// Publish the signed-in identity's documents.
    BroadcastDocuments,
    /// Drop query cooldowns armed during the failed session.
    ResetFreshness,
}

/// The transition table.
pub fn lookup(from: SessionStateKind, event: SessionEvent) -> Option<(SessionStateKind, Effect)> {
    use SessionEvent as E;
    use SessionStateKind as S;

    match (from, event) {
        (S::Default, E::IdentityAssigned) => Some((S::Connecting, Effect::Connect)),
        (S::Connecting, E::ConnectionEstablished) => Some((S::Connected, Effect::None)),
        (S::Connecting, E::ConnectFailed) => Some((S::Error, Effect::ResetFreshness)),
        (S::Connected, E::NoError) => Some((S::Handshaking, Effect::SendHandshake)),
        (S::Handshaking, E::HandshakeExpired) => Some((S::Connected, Effect::None)),
        (S::Handshaking, E::KeyAccepted) => Some((S::Running, Effect::BroadcastDocuments)),
        (S::Running, E::SessionCleared) => Some((S::Default, Effect::None)),
        (S::Error, E::Reset) => Some((S::Default, Effect::None)),
        (S::Error, _) => None,
        (_, E::ConnectionLost) => Some((S::Error, Effect::ResetFreshness)),
        _ => None,
    }
}

/// Snapshot of everything the machine looks at.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SessionContext {
    pub has_identity: bool,
    pub has_key: bool,
    pub connection: ConnectionStatus,
    /// A transport error was observed since the last reset.
    pub transport_failed: bool,
}

/// Derive the event the current snapshot implies, if any.
pub fn detect(
    state: &SessionState,
    ctx: &SessionContext,
    now: u64,
    handshake_timeout: u64,
) -> Option<SessionEvent> {
    use SessionStateKind as S;

    if state.kind == S::Error {
        return None;
    }
    let broken = ctx.transport_failed || ctx.connection == ConnectionStatus::Error;
    if broken {
        return Some(if state.kind == S::Connecting {
            SessionEvent::ConnectFailed
        } else {
            SessionEvent::ConnectionLost
        });
    }
    let ready = ctx.connection == ConnectionStatus::Ready;
    match state.kind {
        S::Default => ctx.has_identity.then_some(SessionEvent::IdentityAssigned),
        S::Connecting => ready.then_some(SessionEvent::ConnectionEstablished),
        S::Connected if !ready => Some(SessionEvent::ConnectionLost),
        S::Connected => Some(SessionEvent::NoError),
        S::Handshaking if !ready => Some(SessionEvent::ConnectionLost),
        S::Handshaking if ctx.has_key => Some(SessionEvent::KeyAccepted),
        S::Handshaking => (now.saturating_sub(state.entered_at) > handshake_timeout)
            .then_some(SessionEvent::HandshakeExpired),
        S::Running if !ready => Some(SessionEvent::ConnectionLost),
        S::Running => (!ctx.has_identity || !ctx.has_key).then_some(SessionEvent::SessionCleared),
        S::Error => None,
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Transition {
    pub from: SessionState,
    pub to: SessionState,
    pub event: SessionEvent,
    pub effect: Effect,
}

#[derive(Debug, Clone)]
pub struct SessionStateMachine {
    state: SessionState,
    paused: bool,
    handshake_timeout: u64,
}

impl SessionStateMachine {
    pub fn new(now: u64, handshake_timeout: Duration) -> Self {
        Self {
            state: SessionState::new(SessionStateKind::Default, now),
            paused: false,
            handshake_timeout: handshake_timeout.as_millis() as u64,
        }
    }

    pub fn current_state(&self) -> SessionState {
        self.state
    }

    pub fn is_paused(&self) -> bool {
        self.paused
    }

    pub fn pause(&mut self) {
        info!("[pause] Suspending session state evaluation");
        self.paused = true;
    }

    pub fn resume(&mut self) {
        info!("[resume] Resuming session state evaluation");
        self.paused = false;
    }

    /// Work out the next transition without applying it. Paused machines never move.
    pub fn evaluate(&self, ctx: &SessionContext, now: u64) -> Option<Transition> {
        if self.paused {
            return None;
        }
        let event = detect(&self.state, ctx, now, self.handshake_timeout)?;
        let (next, effect) = lookup(self.state.kind, event)?;
        Some(Transition {
            from: self.state,
            to: SessionState::new(next, now),
            event,
            effect,
        })
    }

    /// Apply a transition produced by [`evaluate`](Self::evaluate).
    /// Fails if the machine moved in the meantime.
    pub fn commit(&mut self, transition: &Transition) -> Result<(), SessionError> {
        if self.state != transition.from {
            return Err(SessionError::InvalidStateTransition {
                from: self.state.kind.to_string(),
                to: transition.to.kind.to_string(),
            });
        }
        info!(
            "[commit] Transitioning from {} to {} ({:?})",
            transition.from.kind, transition.to.kind, transition.event
        );
        self.state = transition.to;
        Ok(())
    }

    /// Leave Error for Default. The only way out of Error.
    pub fn reset(&mut self, now: u64) -> Result<Transition, SessionError> {
        let Some((next, effect)) = lookup(self.state.kind, SessionEvent::Reset) else {
            return Err(SessionError::InvalidStateTransition {
                from: self.state.kind.to_string(),
                to: SessionStateKind::Default.to_string(),
            });
        };
        let transition = Transition {
            from: self.state,
            to: SessionState::new(next, now),
            event: SessionEvent::Reset,
            effect,
        };
        self.commit(&transition)?;
        Ok(transition)
    }
}
