//! Protocol message types for relay communication.

use serde::{Deserialize, Serialize};
use sigrelay_core::ChannelCode;

/// Wire names of the recognised commands.
pub const CMD_REQUEST_CHANNEL_ID: &str = "requestChannelId";
pub const CMD_CONNECT_CHANNEL: &str = "connectChannel";
pub const CMD_SEND: &str = "send";

/// Machine-readable codes carried by `ServerMessage::Error`.
pub mod error_code {
    pub const ID_SPACE_EXHAUSTED: &str = "id_space_exhausted";
    pub const REGISTRY_FULL: &str = "registry_full";
    pub const UNAVAILABLE: &str = "unavailable";
}

/// A request sent by a client.
///
/// Every field is optional on the wire; missing fields decode as empty
/// strings. `send` requests are forwarded to other channel members as-is.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct Request {
    /// Command name (see `Command`)
    #[serde(default)]
    pub cmd: String,

    /// Target channel code
    #[serde(default)]
    pub channel: ChannelCode,

    /// Opaque signaling payload, never interpreted by the relay
    #[serde(default)]
    pub data: String,
}

impl Request {
    /// Creates a channel id request.
    pub fn request_channel_id() -> Self {
        Self {
            cmd: CMD_REQUEST_CHANNEL_ID.to_string(),
            ..Self::default()
        }
    }

    /// Creates a join request for `channel`.
    pub fn connect_channel(channel: impl Into<ChannelCode>) -> Self {
        Self {
            cmd: CMD_CONNECT_CHANNEL.to_string(),
            channel: channel.into(),
            ..Self::default()
        }
    }

    /// Creates a message to relay to the other members of `channel`.
    pub fn send(channel: impl Into<ChannelCode>, data: impl Into<String>) -> Self {
        Self {
            cmd: CMD_SEND.to_string(),
            channel: channel.into(),
            data: data.into(),
        }
    }

    /// Decodes the command name.
    pub fn command(&self) -> Command {
        Command::parse(&self.cmd)
    }
}

/// The fixed set of commands a client may send.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    /// Empty `cmd`, accepted and ignored
    Empty,
    RequestChannelId,
    ConnectChannel,
    Send,
    /// Anything else; a protocol violation
    Unknown(String),
}

impl Command {
    pub fn parse(cmd: &str) -> Self {
        match cmd {
            "" => Self::Empty,
            CMD_REQUEST_CHANNEL_ID => Self::RequestChannelId,
            CMD_CONNECT_CHANNEL => Self::ConnectChannel,
            CMD_SEND => Self::Send,
            other => Self::Unknown(other.to_string()),
        }
    }

    /// Wire name of the command.
    pub fn as_str(&self) -> &str {
        match self {
            Self::Empty => "",
            Self::RequestChannelId => CMD_REQUEST_CHANNEL_ID,
            Self::ConnectChannel => CMD_CONNECT_CHANNEL,
            Self::Send => CMD_SEND,
            Self::Unknown(other) => other,
        }
    }
}

/// Messages sent from the relay to a client.
///
/// Untagged: each variant is recognised by its field names. `Relay` must
/// stay last because every `Request` field is optional.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ServerMessage {
    /// Reply to `requestChannelId`
    ChannelId {
        /// The newly created channel code
        cid: ChannelCode,
    },

    /// Failure reply to `requestChannelId`
    Error {
        /// Human-readable reason
        error: String,
        /// Error code (optional)
        #[serde(default, skip_serializing_if = "Option::is_none")]
        code: Option<String>,
    },

    /// A `send` request forwarded from another channel member
    Relay(Request),
}

impl ServerMessage {
    /// Creates a channel id response.
    pub fn channel_id(cid: ChannelCode) -> Self {
        Self::ChannelId { cid }
    }

    /// Creates an error response.
    pub fn error(message: &str) -> Self {
        Self::Error {
            error: message.to_string(),
            code: None,
        }
    }

    /// Creates an error response with code.
    pub fn error_with_code(message: &str, code: &str) -> Self {
        Self::Error {
            error: message.to_string(),
            code: Some(code.to_string()),
        }
    }

    /// Wraps a request for forwarding.
    pub fn relay(request: Request) -> Self {
        Self::Relay(request)
    }
}
