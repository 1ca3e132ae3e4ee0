//! Client entry point.
//!
//! A [`Terminal`] owns at most one station connection at a time: its session,
//! the messenger acting as the session delegate, the runner task and the
//! keep-online task. Reconnecting to another station tears the old ones down.

use std::{sync::Arc, time::Duration};

use ds::{Priority, TransportFactory};
use kameo::Actor;
use log::{debug, info, warn};
use tokio_util::sync::CancellationToken;

use crate::{
    context::ClientContext,
    error::TerminalError,
    group::GroupManager,
    messenger::ClientMessenger,
    protocol::{Content, EntityId, MessageRef},
    queue::DeliveryStatus,
    runner::{RunnerHandle, SessionDelegate, SessionRunner},
    session::Session,
    state_machine::{SessionState, SessionStateKind},
};

struct Connection {
    session: Arc<Session>,
    messenger: Arc<ClientMessenger>,
    runner: RunnerHandle,
    keep_online: RunnerHandle,
}

impl Connection {
    async fn shutdown(self) {
        info!("Closing session {} to {}", self.session.id(), self.session.remote());
        self.keep_online.stop().await;
        self.runner.stop().await;
        self.session.close();
    }
}

#[derive(Actor)]
pub struct Terminal {
    ctx: ClientContext,
    factory: Arc<dyn TransportFactory>,
    connection: Option<Connection>,
}

impl Terminal {
    pub fn new(ctx: ClientContext, factory: Arc<dyn TransportFactory>) -> Self {
        Self {
            ctx,
            factory,
            connection: None,
        }
    }

    pub fn context(&self) -> &ClientContext {
        &self.ctx
    }

    fn connection(&self) -> Result<&Connection, TerminalError> {
        self.connection.as_ref().ok_or(TerminalError::NotConnected)
    }

    pub fn session(&self) -> Option<Arc<Session>> {
        self.connection.as_ref().map(|c| c.session.clone())
    }

    pub fn messenger(&self) -> Option<Arc<ClientMessenger>> {
        self.connection.as_ref().map(|c| c.messenger.clone())
    }

    pub fn state(&self) -> Option<SessionState> {
        self.connection.as_ref().map(|c| c.session.state())
    }

    /// Connect to a station, reusing the current session when it already
    /// targets the same endpoint and is active.
    pub async fn connect(&mut self, host: &str, port: u16) -> Result<Arc<Session>, TerminalError> {
        if let Some(current) = &self.connection {
            let session = &current.session;
            if session.host() == host && session.port() == port && session.is_active() {
                debug!("Reusing active session to {host}:{port}");
                return Ok(session.clone());
            }
        }
        let identity = match self.connection.take() {
            Some(old) => {
                let identity = old.session.identity();
                old.shutdown().await;
                identity
            }
            None => None,
        };

        let transport = self.factory.create(host, port)?;
        let session = Arc::new(Session::new(
            EntityId::any_station(),
            host,
            port,
            transport,
            &self.ctx.config,
            self.ctx.now(),
        ));
        // Carry the signed-in identity over to the new station.
        session.set_identity(identity);

        let messenger = Arc::new(ClientMessenger::new(self.ctx.clone(), session.clone()));
        let delegate: Arc<dyn SessionDelegate> = messenger.clone();
        let runner = SessionRunner::new(
            session.clone(),
            delegate,
            self.ctx.clock.clone(),
            &self.ctx.config,
        )
        .spawn();
        let keep_online = spawn_keep_online(messenger.clone(), self.ctx.config.keep_online_interval);

        info!("Session {} created for {host}:{port}", session.id());
        self.connection = Some(Connection {
            session: session.clone(),
            messenger,
            runner,
            keep_online,
        });
        Ok(session)
    }

    /// Bind an identity to the session, the signed-in user when `None`.
    /// Returns whether the session identity changed.
    pub fn login(&self, identity: Option<EntityId>) -> Result<bool, TerminalError> {
        let connection = self.connection()?;
        let identity = match identity {
            Some(identity) => identity,
            None => connection.messenger.current_user()?.id,
        };
        info!("Logging in as {identity}");
        Ok(connection.session.set_identity(Some(identity)))
    }

    /// Tell the station we go offline, give the report a moment to leave,
    /// then pause the session.
    pub async fn enter_background(&self) -> Result<(), TerminalError> {
        let connection = self.connection()?;
        if connection.session.state().kind == SessionStateKind::Running {
            connection.messenger.report_offline()?;
            tokio::time::sleep(self.ctx.config.background_report_delay).await;
        }
        connection.session.pause();
        Ok(())
    }

    /// Resume the session and report online once it has had a moment to settle.
    pub async fn enter_foreground(&self) -> Result<(), TerminalError> {
        let connection = self.connection()?;
        connection.session.resume();
        tokio::time::sleep(self.ctx.config.background_report_delay).await;
        if connection.session.state().kind == SessionStateKind::Running {
            connection.messenger.report_online()?;
        }
        Ok(())
    }

    pub fn send(
        &self,
        content: Content,
        sender: Option<&EntityId>,
        receiver: &EntityId,
        priority: Priority,
    ) -> Result<Option<MessageRef>, TerminalError> {
        let connection = self.connection()?;
        Ok(connection
            .messenger
            .send_content(sender, receiver, content, priority)?)
    }

    fn groups(&self) -> Result<GroupManager, TerminalError> {
        Ok(GroupManager::new(self.connection()?.messenger.clone()))
    }

    pub fn group_invite(&self, group: &EntityId, members: &[EntityId]) -> Result<bool, TerminalError> {
        Ok(self.groups()?.invite(group, members)?)
    }

    pub fn group_expel(&self, group: &EntityId, members: &[EntityId]) -> Result<bool, TerminalError> {
        Ok(self.groups()?.expel(group, members)?)
    }

    pub fn group_quit(&self, group: &EntityId) -> Result<bool, TerminalError> {
        Ok(self.groups()?.quit(group)?)
    }

    pub fn group_query(&self, group: &EntityId) -> Result<bool, TerminalError> {
        Ok(self.groups()?.query(group)?)
    }

    pub fn group_send(&self, group: &EntityId, content: Content) -> Result<bool, TerminalError> {
        Ok(self.groups()?.send_content(group, content)?)
    }

    pub fn delivery_status(&self, message: &MessageRef) -> Option<DeliveryStatus> {
        self.connection
            .as_ref()
            .and_then(|c| c.messenger.delivery_status(message))
    }

    /// Leave Error so the session starts over from Default.
    pub fn reset_session(&self) -> Result<(), TerminalError> {
        let connection = self.connection()?;
        connection.session.reset(self.ctx.now())?;
        Ok(())
    }

    /// Evict half of the cached delivery statuses.
    pub fn reduce_memory(&self) -> usize {
        self.connection
            .as_ref()
            .map_or(0, |c| c.messenger.reduce_memory())
    }

    /// Stop the runner and drop the connection. Undelivered shipments are discarded.
    pub async fn stop(&mut self) {
        if let Some(connection) = self.connection.take() {
            connection.shutdown().await;
        }
    }
}

/// Refresh presence every `interval` while the session is running.
fn spawn_keep_online(messenger: Arc<ClientMessenger>, interval: Duration) -> RunnerHandle {
    let cancel = CancellationToken::new();
    let token = cancel.clone();
    let task = tokio::spawn(async move {
        loop {
            tokio::select! {
                _ = token.cancelled() => break,
                _ = tokio::time::sleep(interval) => {}
            }
            let session = messenger.session();
            if session.is_paused() || session.state().kind != SessionStateKind::Running {
                continue;
            }
            if let Err(e) = messenger.keep_online() {
                warn!("Keep-online failed: {e}");
            }
        }
    });
    RunnerHandle { cancel, task }
}
