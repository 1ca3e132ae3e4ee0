//! Client runtime for a station-relayed secure messenger: session lifecycle,
//! reliable outbound delivery, query throttling and the group membership
//! protocol.

pub mod cache;
pub mod clock;
pub mod codec;
pub mod config;
pub mod context;
pub mod directory;
pub mod error;
pub mod freshness;
pub mod group;
pub mod messenger;
pub mod processor;
pub mod protocol;
pub mod queue;
pub mod runner;
pub mod session;
pub mod state_machine;
pub mod terminal;
pub mod terminal_actor;

pub use clock::{Clock, ManualClock, SystemClock};
pub use codec::{EnvelopeCodec, JsonCodec};
pub use config::{ClientConfig, StationConfig};
pub use context::ClientContext;
pub use directory::{Directory, IdentityProvider, LocalUser, MemoryDirectory, StaticIdentity};
pub use error::{CodecError, GroupError, MessengerError, SessionError, TerminalError};
pub use freshness::{FreshnessKey, FreshnessRegistry, QueryKind};
pub use group::GroupManager;
pub use messenger::ClientMessenger;
pub use protocol::{
    Command, Content, ContentBody, Document, DocumentType, EntityId, EntityKind, GroupCommand,
    InstantMessage, MessageRef, Meta,
};
pub use queue::{DeliveryQueue, DeliveryStatus, RetryPolicy};
pub use runner::{RunnerHandle, SessionDelegate, SessionRunner};
pub use session::Session;
pub use state_machine::{SessionState, SessionStateKind, SessionStateMachine};
pub use terminal::Terminal;
