//! Client messenger: packs content for the session queue, speaks the
//! handshake/login/report protocol, throttles metadata queries and routes
//! inbound commands through the command registry.

use std::sync::Arc;

use ds::{InboundPacket, Priority, Shipment};
use log::{debug, error, info, warn};
use parking_lot::{Mutex, RwLock};

use crate::{
    context::ClientContext,
    directory::LocalUser,
    error::{MessengerError, SessionError},
    freshness::FreshnessKey,
    processor::{CommandHandler, CommandRegistry},
    protocol::{
        Command, Content, ContentBody, EntityId, EntityKind, GroupCommand, HandshakeTitle,
        InstantMessage, MessageRef, ReportTitle, StationInfo,
    },
    queue::{DeliveryStatus, DeliveryTracker},
    runner::SessionDelegate,
    session::Session,
    state_machine::{Effect, Transition},
};

pub struct ClientMessenger {
    ctx: ClientContext,
    session: Arc<Session>,
    tracker: DeliveryTracker,
    registry: RwLock<CommandRegistry>,
    last_online: Mutex<Option<u64>>,
}

impl ClientMessenger {
    pub fn new(ctx: ClientContext, session: Arc<Session>) -> Self {
        let tracker = DeliveryTracker::new(ctx.config.delivery_cache_capacity);
        Self {
            ctx,
            session,
            tracker,
            registry: RwLock::new(CommandRegistry::with_defaults()),
            last_online: Mutex::new(None),
        }
    }

    pub fn context(&self) -> &ClientContext {
        &self.ctx
    }

    pub fn session(&self) -> &Arc<Session> {
        &self.session
    }

    pub fn current_user(&self) -> Result<LocalUser, MessengerError> {
        self.ctx
            .identity
            .current_user()
            .ok_or(MessengerError::MissingIdentity)
    }

    /// Install or replace the handler for a command tag.
    pub fn register_handler(&self, tag: &'static str, handler: CommandHandler) {
        if self.registry.write().register(tag, handler).is_some() {
            debug!("Replaced handler for '{tag}'");
        }
    }

    pub fn delivery_status(&self, message: &MessageRef) -> Option<DeliveryStatus> {
        self.tracker.status(message)
    }

    /// Time of the last successful handshake or keep-online report.
    pub fn last_online(&self) -> Option<u64> {
        *self.last_online.lock()
    }

    pub fn reduce_memory(&self) -> usize {
        self.tracker.reduce_memory()
    }

    /// Pack `content` and queue it for the station.
    ///
    /// # Arguments
    /// * `sender` - Sending identity, the signed-in user when `None`
    /// * `receiver` - User, bot, station or group id
    /// * `content` - What to send
    /// * `priority` - Queue priority
    ///
    /// # Returns
    /// The handle of the queued message, or `None` if it was deferred (group
    /// directory not ready) or is already queued.
    pub fn send_content(
        &self,
        sender: Option<&EntityId>,
        receiver: &EntityId,
        content: Content,
        priority: Priority,
    ) -> Result<Option<MessageRef>, MessengerError> {
        let sender = match sender {
            Some(sender) => sender.clone(),
            None => self.current_user()?.id,
        };
        if receiver.is_group() && !receiver.is_broadcast() && !self.check_group_receiver(receiver)? {
            return Ok(None);
        }
        self.send_instant(InstantMessage::new(sender, receiver.clone(), content), priority)
    }

    pub fn send_instant(
        &self,
        msg: InstantMessage,
        priority: Priority,
    ) -> Result<Option<MessageRef>, MessengerError> {
        let payload = self.ctx.codec.encode(&msg)?;
        let message = msg.message_ref();
        let shipment = Shipment::new(payload, priority, Some(&message.id));
        if !self
            .session
            .queue_shipment(message.clone(), shipment, self.ctx.now())
        {
            debug!("Message {} is already queued", message.id);
            return Ok(None);
        }
        self.tracker.mark(&message, DeliveryStatus::Queued);
        Ok(Some(message))
    }

    fn send_command(
        &self,
        receiver: &EntityId,
        command: Command,
        priority: Priority,
    ) -> Result<Option<MessageRef>, MessengerError> {
        let content = Content::command(command, self.ctx.now());
        self.send_content(None, receiver, content, priority)
    }

    /// Group messages need the group meta, its roster and every member's
    /// encryption key. Whatever is missing gets queried and the send is deferred.
    fn check_group_receiver(&self, group: &EntityId) -> Result<bool, MessengerError> {
        let directory = &self.ctx.directory;
        let freshness = &self.ctx.freshness;
        if freshness.needs_query_meta(group, directory.meta(group).as_ref()) {
            warn!("Group meta not found: {group}");
            self.query_meta(group)?;
            return Ok(false);
        }
        let members = directory.members(group).unwrap_or_default();
        if freshness.needs_query_members(group, Some(&members), None) {
            warn!("Group members not found: {group}");
            self.query_members(group)?;
            return Ok(false);
        }
        let waiting: Vec<&EntityId> = members
            .iter()
            .filter(|member| !directory.has_encryption_key(member))
            .collect();
        if waiting.is_empty() {
            return Ok(true);
        }
        info!(
            "Waiting for {} member keys of {group} before sending",
            waiting.len()
        );
        for member in waiting {
            self.query_document(member)?;
        }
        Ok(false)
    }

    /// Send a handshake request to the station.
    ///
    /// Without a session key this is the first hello, which carries the user's
    /// meta and visa so the station can verify it. With a key it is the retry
    /// the station asked for.
    pub fn handshake(&self, session_key: Option<String>) -> Result<(), MessengerError> {
        let user = self.current_user()?;
        let station = self.session.station().clone();
        let now = self.ctx.now();
        let msg = match session_key {
            None => {
                let command = Command::Handshake {
                    title: HandshakeTitle::Start,
                    session: None,
                };
                let content =
                    Content::command(command, now).with_group(&EntityId::every_station());
                let mut msg = InstantMessage::new(user.id, station, content);
                msg.meta = Some(user.meta);
                msg.visa = Some(user.visa);
                msg
            }
            Some(key) => {
                let command = Command::Handshake {
                    title: HandshakeTitle::Restart,
                    session: Some(key),
                };
                InstantMessage::new(user.id, station, Content::command(command, now))
            }
        };
        info!("[handshake] Sending handshake to {}", self.session.remote());
        self.send_instant(msg, Priority::HANDSHAKE)?;
        Ok(())
    }

    /// The station accepted the session: publish our documents.
    pub fn handshake_success(&self) -> Result<(), MessengerError> {
        info!("[handshake_success] Session running on {}", self.session.remote());
        self.broadcast_document()?;
        *self.last_online.lock() = Some(self.ctx.now());
        Ok(())
    }

    pub fn broadcast_document(&self) -> Result<(), MessengerError> {
        let user = self.current_user()?;
        let command = Command::Document {
            did: user.id.clone(),
            meta: Some(user.meta),
            documents: vec![user.visa],
            last_time: None,
        };
        self.send_command(&EntityId::everyone(), command, Priority::BROADCAST)?;
        Ok(())
    }

    pub fn broadcast_login(&self, agent: &str) -> Result<(), MessengerError> {
        let user = self.current_user()?;
        let command = Command::Login {
            did: user.id,
            agent: Some(agent.to_string()),
            station: Some(StationInfo {
                did: self.session.station().clone(),
                host: self.session.host().to_string(),
                port: self.session.port(),
            }),
        };
        self.send_command(&EntityId::everyone(), command, Priority::BROADCAST)?;
        Ok(())
    }

    pub fn report_online(&self) -> Result<(), MessengerError> {
        self.report(ReportTitle::Online)
    }

    pub fn report_offline(&self) -> Result<(), MessengerError> {
        self.report(ReportTitle::Offline)
    }

    fn report(&self, title: ReportTitle) -> Result<(), MessengerError> {
        self.send_command(
            &EntityId::any_station(),
            Command::Report { title },
            Priority::BROADCAST,
        )?;
        Ok(())
    }

    /// Periodic presence refresh: stations report online, users re-broadcast login.
    pub fn keep_online(&self) -> Result<(), MessengerError> {
        let user = self.current_user()?;
        if user.id.kind == EntityKind::Station {
            self.report_online()?;
        } else {
            self.broadcast_login(&self.ctx.config.user_agent)?;
        }
        *self.last_online.lock() = Some(self.ctx.now());
        Ok(())
    }

    /// Ask the station for `id`'s meta unless an identical query is cooling down.
    pub fn query_meta(&self, id: &EntityId) -> Result<bool, MessengerError> {
        if !self
            .ctx
            .freshness
            .should_query(&FreshnessKey::meta(id), self.ctx.now(), false)
        {
            debug!("Meta query for {id} is cooling down");
            return Ok(false);
        }
        let command = Command::Meta {
            did: id.clone(),
            meta: None,
        };
        self.send_command(&EntityId::any_station(), command, Priority::DEFAULT)?;
        Ok(true)
    }

    pub fn query_document(&self, id: &EntityId) -> Result<bool, MessengerError> {
        if !self
            .ctx
            .freshness
            .should_query(&FreshnessKey::document(id), self.ctx.now(), false)
        {
            debug!("Document query for {id} is cooling down");
            return Ok(false);
        }
        let last_time = self
            .ctx
            .directory
            .documents(id)
            .iter()
            .map(|doc| doc.time)
            .max();
        let command = Command::Document {
            did: id.clone(),
            meta: None,
            documents: Vec::new(),
            last_time,
        };
        self.send_command(&EntityId::any_station(), command, Priority::DEFAULT)?;
        Ok(true)
    }

    /// Ask every assistant of `group` for the roster.
    pub fn query_members(&self, group: &EntityId) -> Result<bool, MessengerError> {
        if !self
            .ctx
            .freshness
            .should_query(&FreshnessKey::members(group), self.ctx.now(), false)
        {
            debug!("Member query for {group} is cooling down");
            return Ok(false);
        }
        let bots = self.ctx.directory.assistants(group).unwrap_or_default();
        if bots.is_empty() {
            warn!("Group assistants not found: {group}");
            return Ok(false);
        }
        let command = Command::Group(GroupCommand::Query {
            group: group.clone(),
            last_time: self
                .ctx
                .freshness
                .latest_seen(&FreshnessKey::history(group)),
        });
        for bot in &bots {
            let content = Content::command(command.clone(), self.ctx.now()).with_group(group);
            self.send_content(None, bot, content, Priority::DEFAULT)?;
        }
        Ok(true)
    }

    /// Decode one inbound packet, run its command handler and send back any
    /// responses. Returns how many responses were queued.
    pub fn process_package(&self, packet: &InboundPacket) -> Result<usize, MessengerError> {
        let msg = self.ctx.codec.decode(&packet.payload)?;
        let command = match &msg.content.body {
            ContentBody::Command(command) => command,
            ContentBody::Text { text } => {
                info!("Message from {}: {} chars", msg.sender, text.len());
                return Ok(0);
            }
        };
        let responses = self.registry.read().dispatch(self, &msg, command)?;
        let mut sent = 0;
        for content in responses {
            if self
                .send_content(None, &msg.sender, content, Priority::DEFAULT)?
                .is_some()
            {
                sent += 1;
            }
        }
        Ok(sent)
    }
}

impl SessionDelegate for ClientMessenger {
    fn after_transition(&self, session: &Session, transition: &Transition) {
        let result = match transition.effect {
            Effect::None => Ok(()),
            Effect::Connect => session
                .connect()
                .map_err(|e| MessengerError::SessionError(SessionError::TransportError(e))),
            Effect::SendHandshake => self.handshake(None),
            Effect::BroadcastDocuments => self.handshake_success(),
            Effect::ResetFreshness => {
                self.ctx.freshness.reset_cooldowns();
                Ok(())
            }
        };
        if let Err(e) = result {
            error!("Error running {:?} effect: {e}", transition.effect);
        }
    }

    fn on_received(&self, _session: &Session, packet: InboundPacket) {
        if let Err(e) = self.process_package(&packet) {
            error!("Error processing packet from {}: {e}", packet.remote);
        }
    }

    fn on_sent(&self, message: &MessageRef) {
        self.tracker.mark(message, DeliveryStatus::Sent);
    }

    fn on_failed(&self, message: &MessageRef, reason: &str) {
        warn!("Delivery of {} failed: {reason}", message.id);
        self.tracker
            .mark(message, DeliveryStatus::Failed(reason.to_string()));
    }
}
