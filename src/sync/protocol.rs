//! Binary WebSocket protocol for document synchronization.
//!
//! Every frame is `[version][type][u24 payload length][bincode payload]`.
//! CRDT payloads (`SyncStep2`, `Update`) and awareness blobs travel as opaque
//! bytes; the server never re-encodes a client update before forwarding it.
//! Text frames carry the same messages as JSON.

use bytes::{Buf, BufMut, Bytes, BytesMut};
use serde::{Deserialize, Serialize};
use std::io::Cursor;

use super::ConnectionId;

/// Protocol version for compatibility checking
pub const PROTOCOL_VERSION: u8 = 1;

/// Maximum message size (16MB)
pub const MAX_MESSAGE_SIZE: usize = 16 * 1024 * 1024;

const HEADER_LEN: usize = 5;

/// Message type identifiers for efficient binary encoding
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MessageType {
    // Connection
    Welcome = 0x02,
    Goodbye = 0x03,
    Error = 0x04,

    // Document sync
    SyncStep1 = 0x10,
    SyncStep2 = 0x11,
    Update = 0x12,

    // Awareness (ephemeral)
    Awareness = 0x40,
    AwarenessRemoved = 0x41,

    // Keepalive
    Ping = 0xF0,
    Pong = 0xF1,
}

impl TryFrom<u8> for MessageType {
    type Error = ProtocolError;

    fn try_from(value: u8) -> Result<Self, <Self as TryFrom<u8>>::Error> {
        match value {
            0x02 => Ok(MessageType::Welcome),
            0x03 => Ok(MessageType::Goodbye),
            0x04 => Ok(MessageType::Error),
            0x10 => Ok(MessageType::SyncStep1),
            0x11 => Ok(MessageType::SyncStep2),
            0x12 => Ok(MessageType::Update),
            0x40 => Ok(MessageType::Awareness),
            0x41 => Ok(MessageType::AwarenessRemoved),
            0xF0 => Ok(MessageType::Ping),
            0xF1 => Ok(MessageType::Pong),
            _ => Err(ProtocolError::UnknownMessageType(value)),
        }
    }
}

/// Protocol errors
#[derive(Debug, Clone, thiserror::Error)]
pub enum ProtocolError {
    #[error("Unknown message type: 0x{0:02X}")]
    UnknownMessageType(u8),

    #[error("Invalid message format: {0}")]
    InvalidFormat(String),

    #[error("Message too large: {0} bytes (max: {1})")]
    MessageTooLarge(usize, usize),

    #[error("Version mismatch: expected {0}, got {1}")]
    VersionMismatch(u8, u8),

    #[error("Serialization error: {0}")]
    Serialization(String),
}

impl From<bincode::Error> for ProtocolError {
    fn from(err: bincode::Error) -> Self {
        ProtocolError::Serialization(err.to_string())
    }
}

impl From<serde_json::Error> for ProtocolError {
    fn from(err: serde_json::Error) -> Self {
        ProtocolError::Serialization(err.to_string())
    }
}

/// Messages sent from client to server
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum ClientMessage {
    /// Client's heads; the server answers with what the client is missing
    SyncStep1 { heads: Vec<[u8; 32]> },

    /// Changes the server is missing, merged like an update
    SyncStep2 { data: Vec<u8> },

    /// One incremental change
    Update { data: Vec<u8> },

    /// Ephemeral per-connection state (cursor, name, color)
    Awareness { data: Vec<u8> },

    /// Ping for keepalive
    Ping { timestamp: u64 },

    /// Graceful disconnect
    Goodbye { reason: Option<String> },
}

impl ClientMessage {
    pub fn message_type(&self) -> MessageType {
        match self {
            ClientMessage::SyncStep1 { .. } => MessageType::SyncStep1,
            ClientMessage::SyncStep2 { .. } => MessageType::SyncStep2,
            ClientMessage::Update { .. } => MessageType::Update,
            ClientMessage::Awareness { .. } => MessageType::Awareness,
            ClientMessage::Ping { .. } => MessageType::Ping,
            ClientMessage::Goodbye { .. } => MessageType::Goodbye,
        }
    }
}

/// Messages sent from server to client
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum ServerMessage {
    /// First frame on every attached connection
    Welcome {
        protocol_version: u8,
        connection_id: ConnectionId,
        document_key: String,
        server_time: i64,
    },

    /// Server heads, so the client can send what the server lacks
    SyncStep1 { heads: Vec<[u8; 32]> },

    /// Baseline or catch-up state
    SyncStep2 { data: Vec<u8> },

    /// Update relayed verbatim from another connection
    Update { data: Vec<u8>, from: ConnectionId },

    /// Awareness relayed from another connection
    Awareness {
        connection_id: ConnectionId,
        data: Vec<u8>,
    },

    /// A connection left; drop its awareness state
    AwarenessRemoved { connection_id: ConnectionId },

    /// Error response
    Error { code: ErrorCode, message: String },

    /// Pong response
    Pong { timestamp: u64, server_time: i64 },

    /// Server is closing this connection
    Goodbye { reason: Option<String> },
}

impl ServerMessage {
    pub fn message_type(&self) -> MessageType {
        match self {
            ServerMessage::Welcome { .. } => MessageType::Welcome,
            ServerMessage::SyncStep1 { .. } => MessageType::SyncStep1,
            ServerMessage::SyncStep2 { .. } => MessageType::SyncStep2,
            ServerMessage::Update { .. } => MessageType::Update,
            ServerMessage::Awareness { .. } => MessageType::Awareness,
            ServerMessage::AwarenessRemoved { .. } => MessageType::AwarenessRemoved,
            ServerMessage::Error { .. } => MessageType::Error,
            ServerMessage::Pong { .. } => MessageType::Pong,
            ServerMessage::Goodbye { .. } => MessageType::Goodbye,
        }
    }
}

/// Error codes for server responses
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[repr(u16)]
pub enum ErrorCode {
    InvalidMessage = 1,
    InvalidUpdate = 2,
    RateLimited = 5,
    ServerError = 6,
    VersionMismatch = 7,
    DocumentFull = 8,
    InvalidKey = 9,
    ShuttingDown = 10,
}

/// Protocol codec for encoding/decoding messages
pub struct SyncProtocol;

impl SyncProtocol {
    /// Encode a client message to bytes
    #[cfg(test)]
    pub fn encode_client(msg: &ClientMessage) -> Result<Bytes, ProtocolError> {
        Self::frame(msg.message_type(), &bincode::serialize(msg)?)
    }

    /// Encode a server message to bytes
    pub fn encode_server(msg: &ServerMessage) -> Result<Bytes, ProtocolError> {
        Self::frame(msg.message_type(), &bincode::serialize(msg)?)
    }

    /// Decode a client message from bytes
    pub fn decode_client(data: &[u8]) -> Result<ClientMessage, ProtocolError> {
        let (msg_type, payload) = Self::unframe(data)?;
        let msg: ClientMessage = bincode::deserialize(payload)?;
        Self::check_type(msg_type, msg.message_type())?;
        Ok(msg)
    }

    /// Decode a server message from bytes
    #[cfg(test)]
    pub fn decode_server(data: &[u8]) -> Result<ServerMessage, ProtocolError> {
        let (msg_type, payload) = Self::unframe(data)?;
        let msg: ServerMessage = bincode::deserialize(payload)?;
        Self::check_type(msg_type, msg.message_type())?;
        Ok(msg)
    }

    /// Decode a client message sent as a JSON text frame
    pub fn decode_client_json(text: &str) -> Result<ClientMessage, ProtocolError> {
        if text.len() > MAX_MESSAGE_SIZE {
            return Err(ProtocolError::MessageTooLarge(text.len(), MAX_MESSAGE_SIZE));
        }
        Ok(serde_json::from_str(text)?)
    }

    /// Create an error response message
    pub fn error_response(code: ErrorCode, message: impl Into<String>) -> ServerMessage {
        ServerMessage::Error {
            code,
            message: message.into(),
        }
    }

    fn frame(msg_type: MessageType, payload: &[u8]) -> Result<Bytes, ProtocolError> {
        if payload.len() + HEADER_LEN > MAX_MESSAGE_SIZE {
            return Err(ProtocolError::MessageTooLarge(
                payload.len() + HEADER_LEN,
                MAX_MESSAGE_SIZE,
            ));
        }

        let mut buf = BytesMut::with_capacity(HEADER_LEN + payload.len());
        buf.put_u8(PROTOCOL_VERSION);
        buf.put_u8(msg_type as u8);
        buf.put_u24(payload.len() as u32);
        buf.put_slice(payload);

        Ok(buf.freeze())
    }

    fn unframe(data: &[u8]) -> Result<(MessageType, &[u8]), ProtocolError> {
        if data.len() < HEADER_LEN {
            return Err(ProtocolError::InvalidFormat(
                "Message too short".to_string(),
            ));
        }
        if data.len() > MAX_MESSAGE_SIZE {
            return Err(ProtocolError::MessageTooLarge(data.len(), MAX_MESSAGE_SIZE));
        }

        let mut cursor = Cursor::new(data);

        let version = cursor.get_u8();
        if version != PROTOCOL_VERSION {
            return Err(ProtocolError::VersionMismatch(PROTOCOL_VERSION, version));
        }

        let msg_type = MessageType::try_from(cursor.get_u8())?;
        let payload_len = cursor.get_uint(3) as usize;

        if data.len() != HEADER_LEN + payload_len {
            return Err(ProtocolError::InvalidFormat(format!(
                "Expected {} bytes, got {}",
                HEADER_LEN + payload_len,
                data.len()
            )));
        }

        Ok((msg_type, &data[HEADER_LEN..]))
    }

    fn check_type(header: MessageType, payload: MessageType) -> Result<(), ProtocolError> {
        if header != payload {
            return Err(ProtocolError::InvalidFormat(format!(
                "Header type {:?} does not match payload {:?}",
                header, payload
            )));
        }
        Ok(())
    }
}

/// Extension trait for writing u24 values
trait BufMutExt {
    fn put_u24(&mut self, n: u32);
}

impl BufMutExt for BytesMut {
    fn put_u24(&mut self, n: u32) {
        self.put_u8((n >> 16) as u8);
        self.put_u8((n >> 8) as u8);
        self.put_u8(n as u8);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_encode_decode_client_update() {
        let msg = ClientMessage::Update {
            data: vec![0x85, 0x6f, 0x4a, 0x83, 1, 2, 3],
        };

        let encoded = SyncProtocol::encode_client(&msg).unwrap();
        assert_eq!(encoded[0], PROTOCOL_VERSION);
        assert_eq!(encoded[1], MessageType::Update as u8);

        let decoded = SyncProtocol::decode_client(&encoded).unwrap();
        assert_eq!(decoded, msg);
    }

    #[test]
    fn test_encode_decode_server_welcome() {
        let msg = ServerMessage::Welcome {
            protocol_version: PROTOCOL_VERSION,
            connection_id: "conn-456".to_string(),
            document_key: "s1:main.js".to_string(),
            server_time: 1234567890,
        };

        let encoded = SyncProtocol::encode_server(&msg).unwrap();
        let decoded = SyncProtocol::decode_server(&encoded).unwrap();

        match decoded {
            ServerMessage::Welcome {
                connection_id,
                document_key,
                ..
            } => {
                assert_eq!(connection_id, "conn-456");
                assert_eq!(document_key, "s1:main.js");
            }
            _ => panic!("Wrong message type"),
        }
    }

    #[test]
    fn test_sync_step1_heads() {
        let msg = ClientMessage::SyncStep1 {
            heads: vec![[1u8; 32], [2u8; 32]],
        };

        let encoded = SyncProtocol::encode_client(&msg).unwrap();
        match SyncProtocol::decode_client(&encoded).unwrap() {
            ClientMessage::SyncStep1 { heads } => {
                assert_eq!(heads.len(), 2);
                assert_eq!(heads[1], [2u8; 32]);
            }
            _ => panic!("Wrong message type"),
        }
    }

    #[test]
    fn test_version_mismatch() {
        let data = SyncProtocol::encode_client(&ClientMessage::Ping { timestamp: 0 }).unwrap();
        let mut bytes = data.to_vec();
        bytes[0] = 0xFF;

        let result = SyncProtocol::decode_client(&bytes);
        assert!(matches!(result, Err(ProtocolError::VersionMismatch(_, _))));
    }

    #[test]
    fn test_truncated_and_garbage_frames() {
        assert!(matches!(
            SyncProtocol::decode_client(&[PROTOCOL_VERSION, 0x12]),
            Err(ProtocolError::InvalidFormat(_))
        ));

        let data = SyncProtocol::encode_client(&ClientMessage::Update { data: vec![9; 16] }).unwrap();
        let truncated = &data[..data.len() - 1];
        assert!(matches!(
            SyncProtocol::decode_client(truncated),
            Err(ProtocolError::InvalidFormat(_))
        ));

        assert!(matches!(
            SyncProtocol::decode_client(&[PROTOCOL_VERSION, 0x77, 0, 0, 0]),
            Err(ProtocolError::UnknownMessageType(0x77))
        ));
    }

    #[test]
    fn test_header_type_must_match_payload() {
        let data = SyncProtocol::encode_client(&ClientMessage::Ping { timestamp: 5 }).unwrap();
        let mut bytes = data.to_vec();
        bytes[1] = MessageType::Update as u8;

        assert!(matches!(
            SyncProtocol::decode_client(&bytes),
            Err(ProtocolError::InvalidFormat(_))
        ));
    }

    #[test]
    fn test_json_text_frames() {
        let msg = SyncProtocol::decode_client_json(r#"{"Ping":{"timestamp":42}}"#).unwrap();
        assert_eq!(msg, ClientMessage::Ping { timestamp: 42 });

        assert!(SyncProtocol::decode_client_json("not json").is_err());
    }

    #[test]
    fn test_message_type_conversion() {
        assert_eq!(MessageType::try_from(0x02).unwrap(), MessageType::Welcome);
        assert_eq!(MessageType::try_from(0x12).unwrap(), MessageType::Update);
        assert!(MessageType::try_from(0xFF).is_err());
    }
}
