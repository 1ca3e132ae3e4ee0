use ds::TransportError;

use crate::protocol::EntityId;

#[derive(Debug, thiserror::Error)]
pub enum CodecError {
    #[error("JSON processing error: {0}")]
    InvalidJson(#[from] serde_json::Error),
    #[error("Malformed envelope: {0}")]
    MalformedEnvelope(String),
}

#[derive(Debug, thiserror::Error)]
pub enum SessionError {
    #[error("Invalid state transition from {from} to {to}")]
    InvalidStateTransition { from: String, to: String },

    #[error(transparent)]
    TransportError(#[from] TransportError),
}

#[derive(Debug, thiserror::Error)]
pub enum MessengerError {
    #[error("No user signed in")]
    MissingIdentity,

    #[error(transparent)]
    CodecError(#[from] CodecError),
    #[error(transparent)]
    SessionError(#[from] SessionError),
}

#[derive(Debug, thiserror::Error)]
pub enum GroupError {
    #[error("{0} is not a group")]
    NotAGroup(EntityId),
    #[error("Cannot expel group assistant: {0}")]
    CannotExpelAssistant(EntityId),
    #[error("Cannot expel group owner: {0}")]
    CannotExpelOwner(EntityId),
    #[error("Group assistant cannot quit: {0}")]
    AssistantCannotQuit(EntityId),
    #[error("Group owner cannot quit: {0}")]
    OwnerCannotQuit(EntityId),

    #[error(transparent)]
    MessengerError(#[from] MessengerError),
}

impl GroupError {
    /// True for requests the group protocol forbids outright.
    pub fn is_protocol_violation(&self) -> bool {
        !matches!(self, GroupError::MessengerError(_))
    }
}

#[derive(Debug, thiserror::Error)]
pub enum TerminalError {
    #[error("Not connected to a station")]
    NotConnected,

    #[error(transparent)]
    TransportError(#[from] TransportError),
    #[error(transparent)]
    SessionError(#[from] SessionError),
    #[error(transparent)]
    MessengerError(#[from] MessengerError),
    #[error(transparent)]
    GroupError(#[from] GroupError),

    #[error("An unknown error occurred: {0}")]
    Other(anyhow::Error),
}
