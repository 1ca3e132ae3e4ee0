//! Semantic message model exchanged with the station.
//!
//! These types are what the client core reasons about. Turning them into
//! bytes is the job of an [`EnvelopeCodec`](crate::codec::EnvelopeCodec).

use std::fmt::Display;

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EntityKind {
    User,
    Group,
    Station,
    Bot,
}

/// Entity identifier, written `name@address`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct EntityId {
    pub name: String,
    pub address: String,
    pub kind: EntityKind,
}

const ANYWHERE: &str = "anywhere";
const EVERYWHERE: &str = "everywhere";

impl EntityId {
    pub fn new(name: &str, address: &str, kind: EntityKind) -> Self {
        Self {
            name: name.to_string(),
            address: address.to_string(),
            kind,
        }
    }

    pub fn user(name: &str, address: &str) -> Self {
        Self::new(name, address, EntityKind::User)
    }

    pub fn group(name: &str, address: &str) -> Self {
        Self::new(name, address, EntityKind::Group)
    }

    pub fn station(name: &str, address: &str) -> Self {
        Self::new(name, address, EntityKind::Station)
    }

    pub fn bot(name: &str, address: &str) -> Self {
        Self::new(name, address, EntityKind::Bot)
    }

    /// `everyone@everywhere`
    pub fn everyone() -> Self {
        Self::group("everyone", EVERYWHERE)
    }

    /// `station@anywhere`: whichever station is on the other end.
    pub fn any_station() -> Self {
        Self::station("station", ANYWHERE)
    }

    /// `stations@everywhere`
    pub fn every_station() -> Self {
        Self::group("stations", EVERYWHERE)
    }

    pub fn is_broadcast(&self) -> bool {
        self.address == ANYWHERE || self.address == EVERYWHERE
    }

    pub fn is_group(&self) -> bool {
        self.kind == EntityKind::Group
    }
}

impl Display for EntityId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}@{}", self.name, self.address)
    }
}

/// Immutable public description of an entity.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Meta {
    pub public_key: String,
    pub seed: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DocumentType {
    Visa,
    Bulletin,
    Profile,
}

/// Signed, versioned record attached to an entity (visa for users, bulletin for groups).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Document {
    pub did: EntityId,
    pub doc_type: DocumentType,
    /// Signing time in milliseconds.
    pub time: u64,
    #[serde(default)]
    pub properties: serde_json::Map<String, serde_json::Value>,
}

impl Document {
    pub fn new(did: EntityId, doc_type: DocumentType, time: u64) -> Self {
        Self {
            did,
            doc_type,
            time,
            properties: serde_json::Map::new(),
        }
    }

    pub fn with_property(mut self, key: &str, value: serde_json::Value) -> Self {
        self.properties.insert(key.to_string(), value);
        self
    }

    /// Visa carrying a dedicated encryption key.
    pub fn has_encryption_key(&self) -> bool {
        self.doc_type == DocumentType::Visa && self.properties.contains_key("key")
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HandshakeTitle {
    /// Client hello.
    Start,
    /// Station asks the client to retry with the given session key.
    Again,
    /// Client retry carrying the session key.
    Restart,
    /// Station accepted the session key.
    Success,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReportTitle {
    Online,
    Offline,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StationInfo {
    pub did: EntityId,
    pub host: String,
    pub port: u16,
}

/// Membership operation, always distributed through the group's assistants.
/// The acting entity is the sender of the carrying message.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum GroupCommand {
    Invite {
        group: EntityId,
        members: Vec<EntityId>,
    },
    Expel {
        group: EntityId,
        members: Vec<EntityId>,
    },
    Quit {
        group: EntityId,
    },
    Query {
        group: EntityId,
        last_time: Option<u64>,
    },
}

impl GroupCommand {
    pub fn group(&self) -> &EntityId {
        match self {
            GroupCommand::Invite { group, .. }
            | GroupCommand::Expel { group, .. }
            | GroupCommand::Quit { group }
            | GroupCommand::Query { group, .. } => group,
        }
    }

    pub fn members(&self) -> &[EntityId] {
        match self {
            GroupCommand::Invite { members, .. } | GroupCommand::Expel { members, .. } => members,
            GroupCommand::Quit { .. } | GroupCommand::Query { .. } => &[],
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Command {
    Handshake {
        title: HandshakeTitle,
        session: Option<String>,
    },
    Login {
        did: EntityId,
        agent: Option<String>,
        station: Option<StationInfo>,
    },
    Report {
        title: ReportTitle,
    },
    /// Query when `meta` is `None`, response otherwise.
    Meta {
        did: EntityId,
        meta: Option<Meta>,
    },
    /// Query when `documents` is empty, response otherwise.
    Document {
        did: EntityId,
        meta: Option<Meta>,
        documents: Vec<Document>,
        last_time: Option<u64>,
    },
    Receipt {
        text: String,
        origin_sn: Option<u64>,
    },
    Group(GroupCommand),
}

impl Command {
    /// Dispatch tag used by the command registry.
    pub fn tag(&self) -> &'static str {
        match self {
            Command::Handshake { .. } => "handshake",
            Command::Login { .. } => "login",
            Command::Report { .. } => "report",
            Command::Meta { .. } => "meta",
            Command::Document { .. } => "document",
            Command::Receipt { .. } => "receipt",
            Command::Group(GroupCommand::Invite { .. }) => "group.invite",
            Command::Group(GroupCommand::Expel { .. }) => "group.expel",
            Command::Group(GroupCommand::Quit { .. }) => "group.quit",
            Command::Group(GroupCommand::Query { .. }) => "group.query",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ContentBody {
    Text { text: String },
    Command(Command),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Content {
    /// Serial number, unique per sender.
    pub sn: u64,
    pub time: u64,
    pub group: Option<EntityId>,
    pub body: ContentBody,
}

impl Content {
    pub fn new(body: ContentBody, time: u64) -> Self {
        Self {
            sn: u64::from(rand::random::<u32>()),
            time,
            group: None,
            body,
        }
    }

    pub fn text(text: &str, time: u64) -> Self {
        Self::new(
            ContentBody::Text {
                text: text.to_string(),
            },
            time,
        )
    }

    pub fn command(command: Command, time: u64) -> Self {
        Self::new(ContentBody::Command(command), time)
    }

    pub fn with_group(mut self, group: &EntityId) -> Self {
        self.group = Some(group.clone());
        self
    }

    pub fn as_command(&self) -> Option<&Command> {
        match &self.body {
            ContentBody::Command(command) => Some(command),
            ContentBody::Text { .. } => None,
        }
    }
}

/// Plain message before the codec signs/encrypts it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InstantMessage {
    pub sender: EntityId,
    pub receiver: EntityId,
    pub time: u64,
    pub content: Content,
    /// Sender meta, attached to the first handshake.
    pub meta: Option<Meta>,
    /// Sender visa, attached to the first handshake.
    pub visa: Option<Document>,
}

impl InstantMessage {
    pub fn new(sender: EntityId, receiver: EntityId, content: Content) -> Self {
        Self {
            time: content.time,
            sender,
            receiver,
            content,
            meta: None,
            visa: None,
        }
    }

    pub fn message_ref(&self) -> MessageRef {
        MessageRef::new(&self.sender, &self.receiver, self.content.sn)
    }
}

/// Identifies an outgoing message; doubles as the delivery handle returned to callers.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct MessageRef {
    pub id: String,
    pub sender: EntityId,
    pub receiver: EntityId,
    pub sn: u64,
}

impl MessageRef {
    pub fn new(sender: &EntityId, receiver: &EntityId, sn: u64) -> Self {
        Self {
            id: format!("{sender}>{receiver}#{sn}"),
            sender: sender.clone(),
            receiver: receiver.clone(),
            sn,
        }
    }
}
