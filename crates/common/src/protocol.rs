//! Wire protocol messages for client-server communication

use serde::{Deserialize, Serialize};
use thiserror::Error;
use crate::models::*;

pub const PROTOCOL_VERSION: u8 = 1;

pub const MAX_MESSAGE_SIZE: usize = 16 * 1024 * 1024;

pub const STATUS_OK: u16 = 200;
pub const STATUS_BAD_REQUEST: u16 = 400;
pub const STATUS_UNAUTHORIZED: u16 = 401;

/// Application event names carried over the transport.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EventKind {
    Connection,
    GetProject,
    CheckVersion,
    Heartbeat,
    Disconnect,
}

impl EventKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            EventKind::Connection => "connection",
            EventKind::GetProject => "getProject",
            EventKind::CheckVersion => "checkVersion",
            EventKind::Heartbeat => "heartbeat",
            EventKind::Disconnect => "disconnect",
        }
    }
}

impl std::fmt::Display for EventKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum ClientMessage {
    /// First frame on every connection; `key` is the optional shared secret.
    Handshake {
        version: u8,
        client_id: String,
        key: Option<String>,
    },

    /// Tree request. `status` is the client's `ProjectStatus` as an integer.
    GetProject {
        status: u8,
    },

    CheckVersion,

    Heartbeat {
        state: u64,
    },

    Disconnect {
        reason: String,
    },
}

impl ClientMessage {
    pub fn event(&self) -> EventKind {
        match self {
            ClientMessage::Handshake { .. } => EventKind::Connection,
            ClientMessage::GetProject { .. } => EventKind::GetProject,
            ClientMessage::CheckVersion => EventKind::CheckVersion,
            ClientMessage::Heartbeat { .. } => EventKind::Heartbeat,
            ClientMessage::Disconnect { .. } => EventKind::Disconnect,
        }
    }
}

/// Authentication acknowledgement sent in reply to a handshake.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConnectionAck {
    pub status: u16,
    pub message: Option<String>,
    /// Heartbeat send interval in milliseconds.
    pub heartbeat_interval: u64,
    pub session_id: Option<String>,
    pub project: Option<ProjectInfo>,
}

impl ConnectionAck {
    pub fn rejected(status: u16, message: &str) -> Self {
        Self {
            status,
            message: Some(message.to_string()),
            heartbeat_interval: 0,
            session_id: None,
            project: None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum ServerMessage {
    Connection(ConnectionAck),

    Project {
        status: u16,
        project: Option<ProjectPayload>,
    },

    /// `message` carries the server project version on success.
    Version {
        status: u16,
        message: Option<String>,
    },

    Heartbeat {
        state: u64,
    },
}

impl ServerMessage {
    pub fn event(&self) -> EventKind {
        match self {
            ServerMessage::Connection(_) => EventKind::Connection,
            ServerMessage::Project { .. } => EventKind::GetProject,
            ServerMessage::Version { .. } => EventKind::CheckVersion,
            ServerMessage::Heartbeat { .. } => EventKind::Heartbeat,
        }
    }

    /// The reply sent on `event` when the peer is not authorized to use it.
    pub fn unauthorized(event: EventKind) -> Self {
        match event {
            EventKind::GetProject => ServerMessage::Project {
                status: STATUS_UNAUTHORIZED,
                project: None,
            },
            EventKind::CheckVersion => ServerMessage::Version {
                status: STATUS_UNAUTHORIZED,
                message: Some("Unauthorized".to_string()),
            },
            _ => ServerMessage::Connection(ConnectionAck::rejected(STATUS_UNAUTHORIZED, "Unauthorized")),
        }
    }
}

pub fn encode_message<T: Serialize>(msg: &T) -> Result<Vec<u8>, rmp_serde::encode::Error> {
    rmp_serde::to_vec(msg)
}

pub fn decode_message<'a, T: Deserialize<'a>>(data: &'a [u8]) -> Result<T, rmp_serde::decode::Error> {
    rmp_serde::from_slice(data)
}

#[derive(Debug, Error)]
pub enum FrameError {
    #[error("Message too large: {0} bytes (max: {max})", max = MAX_MESSAGE_SIZE)]
    TooLarge(usize),
    #[error("Encoding error: {0}")]
    Encoding(#[from] rmp_serde::encode::Error),
}

/// Encodes `msg` behind a 4-byte big-endian length prefix.
pub fn frame_message<T: Serialize>(msg: &T) -> Result<Vec<u8>, FrameError> {
    let data = encode_message(msg)?;
    if data.len() > MAX_MESSAGE_SIZE {
        return Err(FrameError::TooLarge(data.len()));
    }

    let mut framed = Vec::with_capacity(4 + data.len());
    framed.extend_from_slice(&(data.len() as u32).to_be_bytes());
    framed.extend_from_slice(&data);
    Ok(framed)
}

/// Body length announced by a frame header.
pub fn frame_len(header: [u8; 4]) -> Result<usize, FrameError> {
    let len = u32::from_be_bytes(header) as usize;
    if len > MAX_MESSAGE_SIZE {
        return Err(FrameError::TooLarge(len));
    }
    Ok(len)
}
