//! Inbound command dispatch.
//!
//! Handlers are closures keyed by [`Command::tag`]. Each returns the contents
//! to send back to the command's sender (usually none).

use std::collections::HashMap;

use log::{debug, info, warn};

use crate::{
    error::MessengerError,
    freshness::FreshnessKey,
    messenger::ClientMessenger,
    protocol::{Command, Content, EntityId, GroupCommand, HandshakeTitle, InstantMessage},
};

pub type CommandHandler = Box<
    dyn Fn(&ClientMessenger, &InstantMessage, &Command) -> Result<Vec<Content>, MessengerError>
        + Send
        + Sync,
>;

#[derive(Default)]
pub struct CommandRegistry {
    handlers: HashMap<&'static str, CommandHandler>,
}

impl CommandRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry with the handlers every client needs.
    pub fn with_defaults() -> Self {
        let mut registry = Self::new();
        registry.register("handshake", Box::new(handle_handshake));
        registry.register("login", Box::new(handle_login));
        registry.register("report", Box::new(handle_report));
        registry.register("receipt", Box::new(handle_receipt));
        registry.register("meta", Box::new(handle_meta));
        registry.register("document", Box::new(handle_document));
        registry.register("group.invite", Box::new(handle_group_invite));
        registry.register("group.expel", Box::new(handle_group_expel));
        registry.register("group.quit", Box::new(handle_group_quit));
        registry.register("group.query", Box::new(handle_group_query));
        registry
    }

    /// Returns the handler previously registered for `tag`, if any.
    pub fn register(&mut self, tag: &'static str, handler: CommandHandler) -> Option<CommandHandler> {
        self.handlers.insert(tag, handler)
    }

    pub fn contains(&self, tag: &str) -> bool {
        self.handlers.contains_key(tag)
    }

    pub fn dispatch(
        &self,
        messenger: &ClientMessenger,
        msg: &InstantMessage,
        command: &Command,
    ) -> Result<Vec<Content>, MessengerError> {
        match self.handlers.get(command.tag()) {
            Some(handler) => handler(messenger, msg, command),
            None => {
                debug!("No handler for '{}' from {}", command.tag(), msg.sender);
                Ok(Vec::new())
            }
        }
    }
}

fn handle_handshake(
    messenger: &ClientMessenger,
    msg: &InstantMessage,
    command: &Command,
) -> Result<Vec<Content>, MessengerError> {
    let Command::Handshake { title, session } = command else {
        return Ok(Vec::new());
    };
    match (title, session) {
        (HandshakeTitle::Again, Some(key)) => {
            info!("Station asked to handshake again");
            messenger.handshake(Some(key.clone()))?;
        }
        (HandshakeTitle::Success, Some(key)) => {
            info!("Handshake accepted by {}", msg.sender);
            messenger.session().set_session_key(Some(key.clone()));
        }
        (title, _) => warn!("Unexpected handshake {title:?} from {}", msg.sender),
    }
    Ok(Vec::new())
}

/// A login means the user may carry newer documents than we hold.
fn handle_login(
    messenger: &ClientMessenger,
    msg: &InstantMessage,
    command: &Command,
) -> Result<Vec<Content>, MessengerError> {
    if let Command::Login { did, .. } = command {
        let freshness = &messenger.context().freshness;
        if freshness.record_seen(&FreshnessKey::document(did), msg.content.time) {
            debug!("{did} logged in at {}", msg.content.time);
        }
    }
    Ok(Vec::new())
}

fn handle_report(
    _messenger: &ClientMessenger,
    msg: &InstantMessage,
    command: &Command,
) -> Result<Vec<Content>, MessengerError> {
    if let Command::Report { title } = command {
        debug!("{} reported {title:?}", msg.sender);
    }
    Ok(Vec::new())
}

fn handle_receipt(
    _messenger: &ClientMessenger,
    msg: &InstantMessage,
    command: &Command,
) -> Result<Vec<Content>, MessengerError> {
    if let Command::Receipt { text, origin_sn } = command {
        info!("Receipt from {} for {origin_sn:?}: {text}", msg.sender);
    }
    Ok(Vec::new())
}

fn handle_meta(
    messenger: &ClientMessenger,
    _msg: &InstantMessage,
    command: &Command,
) -> Result<Vec<Content>, MessengerError> {
    if let Command::Meta {
        did,
        meta: Some(meta),
    } = command
    {
        messenger.context().directory.save_meta(did, meta.clone());
    }
    Ok(Vec::new())
}

fn handle_document(
    messenger: &ClientMessenger,
    _msg: &InstantMessage,
    command: &Command,
) -> Result<Vec<Content>, MessengerError> {
    let Command::Document {
        did,
        meta,
        documents,
        ..
    } = command
    else {
        return Ok(Vec::new());
    };
    let ctx = messenger.context();
    if let Some(meta) = meta {
        ctx.directory.save_meta(did, meta.clone());
    }
    for doc in documents {
        if &doc.did != did {
            warn!("Document for {} delivered under {did}", doc.did);
            continue;
        }
        ctx.freshness
            .record_seen(&FreshnessKey::document(did), doc.time);
        ctx.directory.save_document(doc.clone());
    }
    Ok(Vec::new())
}

/// Membership commands only apply if they are newer than the last one seen
/// for the group; late arrivals are dropped.
fn accept_history(messenger: &ClientMessenger, group: &EntityId, msg: &InstantMessage) -> bool {
    let accepted = messenger
        .context()
        .freshness
        .record_seen(&FreshnessKey::history(group), msg.content.time);
    if !accepted {
        debug!("Dropping stale membership command for {group} from {}", msg.sender);
    }
    accepted
}

fn is_admin(messenger: &ClientMessenger, group: &EntityId, who: &EntityId) -> bool {
    let directory = &messenger.context().directory;
    directory.owner(group).as_ref() == Some(who)
        || directory
            .assistants(group)
            .is_some_and(|bots| bots.contains(who))
}

fn handle_group_invite(
    messenger: &ClientMessenger,
    msg: &InstantMessage,
    command: &Command,
) -> Result<Vec<Content>, MessengerError> {
    let Command::Group(GroupCommand::Invite { group, members }) = command else {
        return Ok(Vec::new());
    };
    let directory = &messenger.context().directory;
    let current = directory.members(group).unwrap_or_default();
    if !current.is_empty() && !current.contains(&msg.sender) && !is_admin(messenger, group, &msg.sender)
    {
        warn!("Ignoring invite to {group} from non-member {}", msg.sender);
        return Ok(Vec::new());
    }
    if !accept_history(messenger, group, msg) {
        return Ok(Vec::new());
    }
    let mut roster = current.clone();
    for member in members {
        if !roster.contains(member) {
            roster.push(member.clone());
        }
    }
    if roster.len() > current.len() {
        directory.save_members(group, &roster);
    }
    Ok(Vec::new())
}

fn handle_group_expel(
    messenger: &ClientMessenger,
    msg: &InstantMessage,
    command: &Command,
) -> Result<Vec<Content>, MessengerError> {
    let Command::Group(GroupCommand::Expel { group, members }) = command else {
        return Ok(Vec::new());
    };
    if !is_admin(messenger, group, &msg.sender) {
        warn!("Ignoring expel from {group} by {}", msg.sender);
        return Ok(Vec::new());
    }
    if !accept_history(messenger, group, msg) {
        return Ok(Vec::new());
    }
    let directory = &messenger.context().directory;
    if let Some(current) = directory.members(group) {
        let roster: Vec<EntityId> = current
            .iter()
            .filter(|m| !members.contains(m))
            .cloned()
            .collect();
        if roster.len() < current.len() {
            directory.save_members(group, &roster);
        }
    }
    Ok(Vec::new())
}

fn handle_group_quit(
    messenger: &ClientMessenger,
    msg: &InstantMessage,
    command: &Command,
) -> Result<Vec<Content>, MessengerError> {
    let Command::Group(GroupCommand::Quit { group }) = command else {
        return Ok(Vec::new());
    };
    if is_admin(messenger, group, &msg.sender) {
        warn!("Ignoring quit from {group} by admin {}", msg.sender);
        return Ok(Vec::new());
    }
    let directory = &messenger.context().directory;
    let Some(mut current) = directory.members(group) else {
        return Ok(Vec::new());
    };
    if !current.contains(&msg.sender) {
        debug!("Ignoring quit from {group} by non-member {}", msg.sender);
        return Ok(Vec::new());
    }
    if !accept_history(messenger, group, msg) {
        return Ok(Vec::new());
    }
    current.retain(|m| m != &msg.sender);
    directory.save_members(group, &current);
    Ok(Vec::new())
}

/// Answers with the full roster. Only members and assistants may ask; the
/// requester's `last_time` is not consulted.
fn handle_group_query(
    messenger: &ClientMessenger,
    msg: &InstantMessage,
    command: &Command,
) -> Result<Vec<Content>, MessengerError> {
    let Command::Group(GroupCommand::Query { group, .. }) = command else {
        return Ok(Vec::new());
    };
    let ctx = messenger.context();
    let members = ctx.directory.members(group).unwrap_or_default();
    if members.is_empty() {
        messenger.query_members(group)?;
        return Ok(Vec::new());
    }
    let bots = ctx.directory.assistants(group).unwrap_or_default();
    let now = ctx.now();
    if !members.contains(&msg.sender) && !bots.contains(&msg.sender) {
        warn!("{} may not query {group}", msg.sender);
        let receipt = Command::Receipt {
            text: "Permission denied".to_string(),
            origin_sn: Some(msg.content.sn),
        };
        return Ok(vec![Content::command(receipt, now)]);
    }
    let invite = Command::Group(GroupCommand::Invite {
        group: group.clone(),
        members,
    });
    Ok(vec![Content::command(invite, now).with_group(group)])
}
