use thiserror::Error;

/// Why an inbound frame could not be turned into a [`crate::protocol::ChannelMessage`].
#[derive(Debug, Error)]
pub enum DecodeError {
    #[error("frame is not valid json: {0}")]
    Malformed(#[source] serde_json::Error),
    #[error("frame has no `type` field")]
    MissingType,
    #[error("frame `type` field is not text")]
    NonTextType,
    #[error("unrecognized frame type `{0}`")]
    UnknownType(String),
    #[error("invalid `{kind}` frame: {source}")]
    InvalidShape {
        kind: String,
        #[source]
        source: serde_json::Error,
    },
}

impl DecodeError {
    /// Unknown frame types are expected noise from newer servers, not corruption.
    pub fn is_unrecognized(&self) -> bool {
        matches!(self, Self::UnknownType(_))
    }
}

#[derive(Debug, Error)]
#[error("failed to encode frame: {0}")]
pub struct CodecError(#[from] pub serde_json::Error);
