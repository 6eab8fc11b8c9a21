//! Wire envelopes exchanged with clients.
//!
//! Every frame in either direction is a JSON object `{ "type": ..., "payload": ... }`.
//! Inbound frames are decoded in two steps: the envelope first, then the payload
//! for the `type` we recognise, so an unknown `type` is not a decode failure.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

/// Identity a client presents when joining a room.
///
/// All fields are client supplied and stored verbatim.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UserInfo {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub nick_name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub avatar_url: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user_id: Option<String>,
}

impl UserInfo {
    /// Placeholder sender for a connection without a session.
    pub fn unknown() -> Self {
        Self {
            nick_name: Some("Unknown".to_owned()),
            avatar_url: None,
            user_id: Some("unknown".to_owned()),
        }
    }

    pub fn display_name(&self) -> &str {
        self.nick_name.as_deref().unwrap_or("Unknown")
    }
}

/// A chat message as stored in history and broadcast to members.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Message {
    pub text: String,
    pub sender: UserInfo,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct JoinPayload {
    #[serde(default)]
    pub room_id: Option<String>,
    #[serde(default)]
    pub password: Option<String>,
    #[serde(default)]
    pub create: bool,
    #[serde(default)]
    pub user_info: UserInfo,
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct MessagePayload {
    pub text: String,
}

#[derive(Debug, Error)]
pub enum DecodeError {
    #[error("malformed envelope: {0}")]
    Envelope(#[source] serde_json::Error),
    #[error("malformed {kind} payload: {source}")]
    Payload {
        kind: &'static str,
        #[source]
        source: serde_json::Error,
    },
}

#[derive(Deserialize)]
struct RawEnvelope {
    #[serde(rename = "type")]
    kind: String,
    #[serde(default)]
    payload: Value,
}

/// A decoded client request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Inbound {
    Join(JoinPayload),
    Message(MessagePayload),
    Unknown(String),
}

impl Inbound {
    pub fn decode(data: &[u8]) -> Result<Self, DecodeError> {
        let RawEnvelope { kind, payload } =
            serde_json::from_slice(data).map_err(DecodeError::Envelope)?;

        match kind.as_str() {
            "join" => serde_json::from_value(payload)
                .map(Inbound::Join)
                .map_err(|source| DecodeError::Payload { kind: "join", source }),
            "message" => serde_json::from_value(payload)
                .map(Inbound::Message)
                .map_err(|source| DecodeError::Payload { kind: "message", source }),
            _ => Ok(Inbound::Unknown(kind)),
        }
    }
}

/// A frame sent to clients.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "type", content = "payload", rename_all = "lowercase")]
pub enum Outbound {
    History(Vec<Message>),
    System { text: String },
    Error { text: String },
    Message(Message),
}

impl Outbound {
    pub fn system(text: impl Into<String>) -> Self {
        Outbound::System { text: text.into() }
    }

    pub fn error(text: impl Into<String>) -> Self {
        Outbound::Error { text: text.into() }
    }
}
