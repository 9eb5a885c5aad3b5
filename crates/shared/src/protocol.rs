use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::{
    domain::DeviceId,
    error::{CodecError, DecodeError},
};

/// Envelope shared by the broadcast and private channels, discriminated by `type`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ChannelMessage {
    Ping,
    Pong {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        ts: Option<f64>,
    },
    Message {
        text: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        to: Option<DeviceId>,
    },
    PublicMessage {
        text: String,
        from: DeviceId,
    },
    PrivateMessage {
        text: String,
        from: DeviceId,
    },
    PrivateRequest {
        from: DeviceId,
    },
    Join {
        device_id: DeviceId,
    },
    Leave {
        device_id: DeviceId,
    },
    Info {
        message: String,
    },
    Error {
        message: String,
    },
}

impl ChannelMessage {
    pub const KNOWN_TYPES: [&'static str; 10] = [
        "ping",
        "pong",
        "message",
        "public_message",
        "private_message",
        "private_request",
        "join",
        "leave",
        "info",
        "error",
    ];

    pub fn kind(&self) -> &'static str {
        match self {
            Self::Ping => "ping",
            Self::Pong { .. } => "pong",
            Self::Message { .. } => "message",
            Self::PublicMessage { .. } => "public_message",
            Self::PrivateMessage { .. } => "private_message",
            Self::PrivateRequest { .. } => "private_request",
            Self::Join { .. } => "join",
            Self::Leave { .. } => "leave",
            Self::Info { .. } => "info",
            Self::Error { .. } => "error",
        }
    }

    pub fn text(text: impl Into<String>) -> Self {
        Self::Message {
            text: text.into(),
            to: None,
        }
    }

    pub fn private_text(text: impl Into<String>, to: DeviceId) -> Self {
        Self::Message {
            text: text.into(),
            to: Some(to),
        }
    }
}

pub fn encode(message: &ChannelMessage) -> Result<String, CodecError> {
    Ok(serde_json::to_string(message)?)
}

/// Parses one inbound text frame. Never panics; every failure is a [`DecodeError`].
pub fn decode(raw: &str) -> Result<ChannelMessage, DecodeError> {
    let value: Value = serde_json::from_str(raw).map_err(DecodeError::Malformed)?;
    let kind = match value.get("type") {
        None => return Err(DecodeError::MissingType),
        Some(Value::String(kind)) => kind.clone(),
        Some(_) => return Err(DecodeError::NonTextType),
    };
    if !ChannelMessage::KNOWN_TYPES.contains(&kind.as_str()) {
        return Err(DecodeError::UnknownType(kind));
    }
    serde_json::from_value(value).map_err(|source| DecodeError::InvalidShape { kind, source })
}
