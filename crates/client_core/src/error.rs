use shared::{domain::DeviceId, error::CodecError};
use thiserror::Error;

/// Synchronous rejections surfaced to whoever drives the session.
#[derive(Debug, Error)]
pub enum SessionError {
    #[error("public channel is not connected")]
    BroadcastNotConnected,
    #[error("private chat with {0} is already open")]
    ConversationAlreadyOpen(DeviceId),
    #[error("no private chat open with {0}")]
    NoConversation(DeviceId),
    #[error("private chat with {0} is not connected")]
    ConversationNotConnected(DeviceId),
    #[error("that's you: cannot open a private chat with your own device")]
    SelfConversation,
    #[error("message text must not be empty")]
    EmptyMessage,
    #[error("invalid endpoint: {0}")]
    Endpoint(String),
    #[error(transparent)]
    Codec(#[from] CodecError),
}
