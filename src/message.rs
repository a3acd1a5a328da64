//! Message protocol definitions
//!
//! JSON-based protocol using Serde's internally tagged enum, discriminated
//! by the `action` field. Responses are a separate untagged record keyed by
//! a numeric `response` status.

use serde::{Deserialize, Serialize};

use crate::error::ConnError;
use crate::schema::SchemaKind;
use crate::types::unix_now;

/// Alert carried by the handshake acknowledgement
pub const WELCOME: &str = "Welcome";

/// Error text for any undecodable or invalid payload
pub const INCORRECT_JSON: &str = "incorrect JSON object";

/// Error text for a connection that sent no presence in time
pub const PRESENCE_TIMEOUT: &str = "presence timeout";

/// Client → Server (and relayed Server → Client) message
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "action", rename_all = "snake_case")]
pub enum Message {
    /// Handshake / status announcement
    Presence(Presence),
    /// Chat message, relayed to every registered connection
    #[serde(rename = "msg")]
    Chat(ChatMessage),
    /// Status check, answered with the sender's own presence
    Probe {
        #[serde(skip_serializing_if = "Option::is_none")]
        time: Option<f64>,
    },
    /// Client-initiated graceful close
    Quit {
        #[serde(skip_serializing_if = "Option::is_none")]
        time: Option<f64>,
    },
}

/// Presence payload
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Presence {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub time: Option<f64>,
    /// Presence type, `"status"` in practice
    #[serde(rename = "type", skip_serializing_if = "Option::is_none")]
    pub presence_type: Option<String>,
    pub user: User,
}

/// The account announced by a presence message
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct User {
    pub account_name: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub status: Option<String>,
}

/// Chat message payload
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChatMessage {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub time: Option<f64>,
    /// Declared recipient; not used for routing
    pub to: String,
    pub from: String,
    /// Text encoding the sender declared
    #[serde(skip_serializing_if = "Option::is_none")]
    pub encoding: Option<String>,
    pub message: String,
}

impl Presence {
    /// Build a timestamped status presence for `user`
    pub fn status(user: User) -> Self {
        Self {
            time: Some(unix_now()),
            presence_type: Some("status".to_string()),
            user,
        }
    }
}

/// Message discriminator
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MessageKind {
    Presence,
    Chat,
    Probe,
    Quit,
}

impl MessageKind {
    /// Parse the wire `action` value
    pub fn from_action(action: &str) -> Option<Self> {
        match action {
            "presence" => Some(Self::Presence),
            "msg" => Some(Self::Chat),
            "probe" => Some(Self::Probe),
            "quit" => Some(Self::Quit),
            _ => None,
        }
    }

    /// The wire `action` value
    pub fn action(self) -> &'static str {
        match self {
            Self::Presence => "presence",
            Self::Chat => "msg",
            Self::Probe => "probe",
            Self::Quit => "quit",
        }
    }

    /// The schema a message of this kind must satisfy, if any
    pub fn schema_kind(self) -> Option<SchemaKind> {
        match self {
            Self::Presence => Some(SchemaKind::Presence),
            Self::Chat => Some(SchemaKind::Chat),
            Self::Probe | Self::Quit => None,
        }
    }
}

impl Message {
    pub fn kind(&self) -> MessageKind {
        match self {
            Message::Presence(_) => MessageKind::Presence,
            Message::Chat(_) => MessageKind::Chat,
            Message::Probe { .. } => MessageKind::Probe,
            Message::Quit { .. } => MessageKind::Quit,
        }
    }
}

/// Server → Client response
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Response {
    /// Numeric status: 200, 400 or 500
    pub response: u16,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub time: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub alert: Option<String>,
}

impl Response {
    pub const OK: u16 = 200;
    pub const BAD_REQUEST: u16 = 400;
    pub const SERVER_ERROR: u16 = 500;

    /// 200 with an optional alert; carries no timestamp
    pub fn ok(alert: Option<&str>) -> Self {
        Self {
            response: Self::OK,
            time: None,
            error: None,
            alert: alert.map(str::to_string),
        }
    }

    /// 400 with a timestamp
    pub fn bad_request(error: impl Into<String>) -> Self {
        Self::error(Self::BAD_REQUEST, error.into())
    }

    /// 500 with a timestamp
    pub fn server_error(error: impl Into<String>) -> Self {
        Self::error(Self::SERVER_ERROR, error.into())
    }

    fn error(status: u16, error: String) -> Self {
        Self {
            response: status,
            time: Some(unix_now()),
            error: Some(error),
            alert: None,
        }
    }
}

impl ConnError {
    /// The response owed to the peer before closing
    ///
    /// `None` when the transport is gone or its framing can no longer be trusted.
    pub fn response(&self) -> Option<Response> {
        match self {
            ConnError::Decode(_) => Some(Response::bad_request(INCORRECT_JSON)),
            ConnError::Validation(e) => {
                Some(Response::bad_request(format!("{}: {}", INCORRECT_JSON, e)))
            }
            ConnError::HandshakeTimeout => Some(Response::bad_request(PRESENCE_TIMEOUT)),
            ConnError::Io(_) => Some(Response::server_error("internal server error")),
            ConnError::Disconnected | ConnError::ShortWrite { .. } => None,
        }
    }
}
