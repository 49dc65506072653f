//! Wire format shared by client and server.
//!
//! Every exchange starts with a fixed 16 byte header (big-endian):
//!
//! ```text
//! +-----------+-----------+------------------+
//! | version   | type      | payload_size     |
//! | 4 bytes   | 4 bytes   | 8 bytes          |
//! +-----------+-----------+------------------+
//! ```
//!
//! The header does not delimit everything that follows it. The type decides
//! which extra frames come next:
//!
//! - `FILE_CREATED` / `FILE_MODIFIED`: path payload, 8 byte file size, file bytes
//! - `FILE_RENAMED`: old path payload, 8 byte new path length, new path bytes
//! - `FILE_DELETED`: path payload
//! - `SEND_SNAPSHOT`: archive bytes as the payload
//! - `SESSION`: 8 byte big-endian id of a control session as the payload
//! - `GET_SNAPSHOT`, `DISCONNECT`, `VALID_RESPONSE`, `ERROR_RESPONSE`: nothing
//!
//! Each frame is obfuscated on its own, starting at offset zero.
//!
//! The `FILE_*` layouts are used in both directions: clients submit changes
//! on the change port, and the server passes applied changes on to the other
//! clients over their control connections.

use std::fmt;

use crate::error::{Result, SyncError};

pub const PROTOCOL_VERSION: u32 = 1;
pub const HEADER_LEN: usize = 16;
/// Upper bound for path payloads; anything larger is treated as a protocol violation.
pub const MAX_PATH_LEN: u64 = 4096;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MessageType {
    FileCreated,
    FileModified,
    FileDeleted,
    FileRenamed,
    GetSnapshot,
    SendSnapshot,
    Session,
    Disconnect,
    ValidResponse,
    ErrorResponse,
}

impl MessageType {
    pub fn code(self) -> u32 {
        match self {
            MessageType::FileCreated => 10,
            MessageType::FileModified => 11,
            MessageType::FileDeleted => 12,
            MessageType::FileRenamed => 13,
            MessageType::GetSnapshot => 20,
            MessageType::SendSnapshot => 21,
            MessageType::Session => 22,
            MessageType::Disconnect => 100,
            MessageType::ValidResponse => 0xEEEE,
            MessageType::ErrorResponse => 0xEEEF,
        }
    }

    pub fn from_code(code: u32) -> Result<Self> {
        Ok(match code {
            10 => MessageType::FileCreated,
            11 => MessageType::FileModified,
            12 => MessageType::FileDeleted,
            13 => MessageType::FileRenamed,
            20 => MessageType::GetSnapshot,
            21 => MessageType::SendSnapshot,
            22 => MessageType::Session,
            100 => MessageType::Disconnect,
            0xEEEE => MessageType::ValidResponse,
            0xEEEF => MessageType::ErrorResponse,
            other => {
                return Err(SyncError::Protocol(format!(
                    "unknown message type {other}"
                )))
            }
        })
    }
}

impl fmt::Display for MessageType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            MessageType::FileCreated => "FILE_CREATED",
            MessageType::FileModified => "FILE_MODIFIED",
            MessageType::FileDeleted => "FILE_DELETED",
            MessageType::FileRenamed => "FILE_RENAMED",
            MessageType::GetSnapshot => "GET_SNAPSHOT",
            MessageType::SendSnapshot => "SEND_SNAPSHOT",
            MessageType::Session => "SESSION",
            MessageType::Disconnect => "DISCONNECT",
            MessageType::ValidResponse => "VALID_RESPONSE",
            MessageType::ErrorResponse => "ERROR_RESPONSE",
        };
        f.write_str(name)
    }
}

/// Fixed-size frame that opens every exchange.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Header {
    pub kind: MessageType,
    pub payload_size: u64,
}

impl Header {
    pub fn new(kind: MessageType, payload_size: u64) -> Self {
        Self { kind, payload_size }
    }

    pub fn encode(&self) -> [u8; HEADER_LEN] {
        let mut buf = [0u8; HEADER_LEN];
        buf[0..4].copy_from_slice(&PROTOCOL_VERSION.to_be_bytes());
        buf[4..8].copy_from_slice(&self.kind.code().to_be_bytes());
        buf[8..16].copy_from_slice(&self.payload_size.to_be_bytes());
        buf
    }

    pub fn decode(buf: &[u8; HEADER_LEN]) -> Result<Self> {
        let mut word = [0u8; 4];
        word.copy_from_slice(&buf[0..4]);
        let version = u32::from_be_bytes(word);
        if version != PROTOCOL_VERSION {
            return Err(SyncError::Protocol(format!(
                "unsupported protocol version {version}, expected {PROTOCOL_VERSION}"
            )));
        }

        word.copy_from_slice(&buf[4..8]);
        let kind = MessageType::from_code(u32::from_be_bytes(word))?;

        let mut size = [0u8; 8];
        size.copy_from_slice(&buf[8..16]);
        Ok(Self {
            kind,
            payload_size: u64::from_be_bytes(size),
        })
    }
}

/// A message whose payload travels inline right after its header.
///
/// The payload is absent exactly when its size is zero.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Message {
    pub kind: MessageType,
    pub payload: Option<Vec<u8>>,
}

impl Message {
    pub fn new(kind: MessageType) -> Self {
        Self {
            kind,
            payload: None,
        }
    }

    pub fn with_payload(kind: MessageType, payload: impl Into<Vec<u8>>) -> Self {
        let payload = payload.into();
        Self {
            kind,
            payload: if payload.is_empty() {
                None
            } else {
                Some(payload)
            },
        }
    }

    pub fn payload_size(&self) -> u64 {
        self.payload.as_ref().map_or(0, |p| p.len() as u64)
    }

    pub fn header(&self) -> Header {
        Header::new(self.kind, self.payload_size())
    }
}
