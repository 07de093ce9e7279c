//! Socket wire protocol
//!
//! Inbound text frames are decoded once at the boundary into a closed action
//! type, then matched exhaustively; outbound events serialize into the tagged
//! `{"type": ...}` shape shared by status, message, and error frames.

use crate::db::MessagePayload;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use uuid::Uuid;

/// Client frame as it appears on the wire
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct RawClientFrame {
    action: String,
    chat_id: Option<String>,
    recipient_id: Option<String>,
    content: Option<String>,
}

/// A decoded client action
///
/// Unknown tags are preserved so the error frame can name them. Malformed ids
/// decode to `None`; resolution failures are the state machine's concern, not
/// the decoder's.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ClientAction {
    SendMessage {
        chat_id: Option<Uuid>,
        recipient_id: Option<Uuid>,
        content: String,
    },
    Unknown {
        name: String,
    },
}

impl ClientAction {
    /// Decode a text frame. `Err` means the payload is not a client frame at
    /// all; the action tag is matched case-insensitively.
    pub fn decode(raw: &str) -> Result<Self, serde_json::Error> {
        let frame: RawClientFrame = serde_json::from_str(raw)?;
        Ok(match frame.action.to_lowercase().as_str() {
            "send_message" => Self::SendMessage {
                chat_id: frame.chat_id.as_deref().and_then(parse_id),
                recipient_id: frame.recipient_id.as_deref().and_then(parse_id),
                content: frame.content.unwrap_or_default(),
            },
            _ => Self::Unknown { name: frame.action },
        })
    }
}

fn parse_id(value: &str) -> Option<Uuid> {
    Uuid::parse_str(value).ok()
}

/// Server frame sent to one or more connections
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum ServerEvent {
    Status { message: String },
    Message { payload: MessagePayload },
    Error { message: String },
}

impl ServerEvent {
    pub fn status(message: impl Into<String>) -> Self {
        Self::Status {
            message: message.into(),
        }
    }

    pub fn error(message: impl Into<String>) -> Self {
        Self::Error {
            message: message.into(),
        }
    }

    pub fn message(payload: MessagePayload) -> Self {
        Self::Message { payload }
    }

    /// Serialize once into the shared representation the registry fans out
    pub fn to_frame(&self) -> Arc<str> {
        Arc::from(serde_json::to_string(self).unwrap_or_default())
    }
}
