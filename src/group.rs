//! Group membership protocol.
//!
//! Every mutating operation computes the new roster first, then fans the
//! command out to the assistants and affected members, and persists the roster
//! last. A failure before persistence leaves peers notified of a change they
//! can safely receive again.
//!
//! # Invite fan-out
//!
//! ```text
//! new group (<= 2 members before the invite):
//!     bundle          -> assistants
//!     invite(all)     -> assistants + all members
//! established group:
//!     bundle          -> new members
//!     invite(new)     -> assistants + old members
//!     invite(all)     -> new members
//! ```

use std::sync::Arc;

use ds::Priority;
use log::{info, warn};

use crate::{
    directory::Directory,
    error::GroupError,
    messenger::ClientMessenger,
    protocol::{Command, Content, EntityId, GroupCommand, Meta},
};

pub struct GroupManager {
    messenger: Arc<ClientMessenger>,
}

impl GroupManager {
    pub fn new(messenger: Arc<ClientMessenger>) -> Self {
        Self { messenger }
    }

    fn directory(&self) -> &Arc<dyn Directory> {
        &self.messenger.context().directory
    }

    fn ensure_group(group: &EntityId) -> Result<(), GroupError> {
        if group.is_group() && !group.is_broadcast() {
            Ok(())
        } else {
            Err(GroupError::NotAGroup(group.clone()))
        }
    }

    fn send_to_all(
        &self,
        group: &EntityId,
        command: &Command,
        receivers: &[EntityId],
    ) -> Result<(), GroupError> {
        for receiver in receivers {
            let content =
                Content::command(command.clone(), self.messenger.context().now()).with_group(group);
            self.messenger
                .send_content(None, receiver, content, Priority::DEFAULT)?;
        }
        Ok(())
    }

    /// Meta/document bundle new members need to verify the group.
    fn bundle(&self, group: &EntityId, meta: Meta) -> Command {
        let documents = self.directory().documents(group);
        if documents.is_empty() {
            Command::Meta {
                did: group.clone(),
                meta: Some(meta),
            }
        } else {
            Command::Document {
                did: group.clone(),
                meta: Some(meta),
                documents,
                last_time: None,
            }
        }
    }

    /// Send a group message through the first assistant that takes it.
    pub fn send_content(&self, group: &EntityId, content: Content) -> Result<bool, GroupError> {
        Self::ensure_group(group)?;
        let bots = self.directory().assistants(group).unwrap_or_default();
        if bots.is_empty() {
            warn!("Group assistants not found: {group}");
            self.messenger.query_members(group)?;
            return Ok(false);
        }
        let content = content.with_group(group);
        for bot in &bots {
            if self
                .messenger
                .send_content(None, bot, content.clone(), Priority::DEFAULT)?
                .is_some()
            {
                return Ok(true);
            }
        }
        Ok(false)
    }

    /// Add `new_members` to `group`. Members already in the roster are skipped.
    pub fn invite(&self, group: &EntityId, new_members: &[EntityId]) -> Result<bool, GroupError> {
        Self::ensure_group(group)?;
        let directory = self.directory();
        let Some(meta) = directory.meta(group) else {
            warn!("Group meta not found: {group}");
            self.messenger.query_meta(group)?;
            return Ok(false);
        };
        let Some(members) = directory.members(group) else {
            warn!("Group members not ready: {group}");
            self.messenger.query_members(group)?;
            return Ok(false);
        };
        let bots = directory.assistants(group).unwrap_or_default();

        let mut added: Vec<EntityId> = Vec::new();
        for member in new_members {
            if !members.contains(member) && !added.contains(member) {
                added.push(member.clone());
            }
        }
        if added.is_empty() {
            info!("Nothing to invite into {group}");
            return Ok(false);
        }
        let mut roster = members.clone();
        roster.extend(added.iter().cloned());

        let bundle = self.bundle(group, meta);
        let invite_all = Command::Group(GroupCommand::Invite {
            group: group.clone(),
            members: roster.clone(),
        });
        if members.len() <= 2 {
            self.send_to_all(group, &bundle, &bots)?;
            self.send_to_all(group, &invite_all, &bots)?;
            self.send_to_all(group, &invite_all, &roster)?;
        } else {
            let invite_new = Command::Group(GroupCommand::Invite {
                group: group.clone(),
                members: added.clone(),
            });
            self.send_to_all(group, &bundle, &added)?;
            self.send_to_all(group, &invite_new, &bots)?;
            self.send_to_all(group, &invite_new, &members)?;
            self.send_to_all(group, &invite_all, &added)?;
        }
        info!("Invited {} members into {group}", added.len());
        Ok(directory.save_members(group, &roster))
    }

    /// Remove `out_members` from `group`. Assistants and the owner cannot be expelled.
    pub fn expel(&self, group: &EntityId, out_members: &[EntityId]) -> Result<bool, GroupError> {
        Self::ensure_group(group)?;
        let directory = self.directory();
        let bots = directory.assistants(group).unwrap_or_default();
        if let Some(bot) = out_members.iter().find(|m| bots.contains(m)) {
            return Err(GroupError::CannotExpelAssistant(bot.clone()));
        }
        let owner = directory.owner(group);
        if let Some(owner) = owner.as_ref().filter(|o| out_members.contains(o)) {
            return Err(GroupError::CannotExpelOwner(owner.clone()));
        }
        let (Some(owner), Some(members)) = (owner, directory.members(group)) else {
            warn!("Group owner/members not ready: {group}");
            self.messenger.query_members(group)?;
            return Ok(false);
        };

        let roster: Vec<EntityId> = members
            .iter()
            .filter(|m| !out_members.contains(m))
            .cloned()
            .collect();
        if roster.len() == members.len() {
            info!("None of the expelled are members of {group}");
            return Ok(false);
        }

        let expel = Command::Group(GroupCommand::Expel {
            group: group.clone(),
            members: out_members.to_vec(),
        });
        self.send_to_all(group, &expel, &bots)?;
        self.send_to_all(group, &expel, &members)?;
        if !members.contains(&owner) {
            self.send_to_all(group, &expel, std::slice::from_ref(&owner))?;
        }
        Ok(directory.save_members(group, &roster))
    }

    /// Leave `group`. Assistants and the owner cannot quit.
    pub fn quit(&self, group: &EntityId) -> Result<bool, GroupError> {
        Self::ensure_group(group)?;
        let user = self.messenger.current_user()?;
        let directory = self.directory();
        let bots = directory.assistants(group).unwrap_or_default();
        if bots.contains(&user.id) {
            return Err(GroupError::AssistantCannotQuit(user.id));
        }
        let owner = directory.owner(group);
        if owner.as_ref() == Some(&user.id) {
            return Err(GroupError::OwnerCannotQuit(user.id));
        }
        let (Some(owner), Some(members)) = (owner, directory.members(group)) else {
            warn!("Group owner/members not ready: {group}");
            self.messenger.query_members(group)?;
            return Ok(false);
        };

        let quit = Command::Group(GroupCommand::Quit {
            group: group.clone(),
        });
        self.send_to_all(group, &quit, &bots)?;
        let roster: Vec<EntityId> = members.into_iter().filter(|m| m != &user.id).collect();
        self.send_to_all(group, &quit, &roster)?;
        if !roster.contains(&owner) {
            self.send_to_all(group, &quit, std::slice::from_ref(&owner))?;
        }
        Ok(directory.save_members(group, &roster))
    }

    /// Ask the assistants for the roster; false while an identical query cools down.
    pub fn query(&self, group: &EntityId) -> Result<bool, GroupError> {
        Self::ensure_group(group)?;
        Ok(self.messenger.query_members(group)?)
    }
}
