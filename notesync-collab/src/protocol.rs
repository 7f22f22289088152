//! Binary room protocol.
//!
//! Wire format (bincode-encoded, one message per binary WebSocket frame):
//! ```text
//! ┌──────────┬───────────┬──────────┬──────────┬──────────┐
//! │ msg_type │ peer_id   │ room     │ clock    │ payload  │
//! │ 1 byte   │ 16 bytes  │ varint+N │ varint   │ varint+N │
//! └──────────┴───────────┴──────────┴──────────┴──────────┘
//! ```
//!
//! Payloads are opaque CRDT bytes (state vectors and deltas), a bincode
//! [`PeerInfo`] for `Join`, or a bincode [`AwarenessState`] for `Awareness`.
//! Rooms are named `note-<note id>` so every replica of a note rendezvous on
//! the same room regardless of who opened it first.

use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

use crate::awareness::{AwarenessState, CursorColor};

const ROOM_PREFIX: &str = "note-";

/// Room name for a note.
pub fn room_name(note_id: &str) -> String {
    format!("{ROOM_PREFIX}{note_id}")
}

/// Inverse of [`room_name`].
pub fn note_id_from_room(room: &str) -> Option<&str> {
    room.strip_prefix(ROOM_PREFIX).filter(|id| !id.is_empty())
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[repr(u8)]
pub enum MessageType {
    /// Peer enters a room; payload is its [`PeerInfo`].
    Join = 1,
    /// State vector; the receiver answers with `SyncStep2`.
    SyncStep1 = 2,
    /// Diff against a received state vector.
    SyncStep2 = 3,
    /// Incremental delta.
    Update = 4,
    Awareness = 5,
    Leave = 6,
    Ping = 7,
    Pong = 8,
    /// Join refused; payload is a UTF-8 reason.
    Refused = 9,
}

/// Identity a peer announces when joining a room.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct PeerInfo {
    pub peer_id: Uuid,
    pub name: String,
    /// `#rrggbb`
    pub color: String,
}

impl PeerInfo {
    pub fn new(name: impl Into<String>) -> Self {
        Self::with_id(Uuid::new_v4(), name)
    }

    pub fn with_id(peer_id: Uuid, name: impl Into<String>) -> Self {
        Self {
            peer_id,
            name: name.into(),
            color: CursorColor::from_uuid(peer_id).to_hex(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SyncMessage {
    pub msg_type: MessageType,
    pub peer_id: Uuid,
    pub room: String,
    /// Per-sender sequence number, informational only.
    pub clock: u64,
    pub payload: Vec<u8>,
}

impl SyncMessage {
    fn new(msg_type: MessageType, peer_id: Uuid, room: &str, payload: Vec<u8>) -> Self {
        Self {
            msg_type,
            peer_id,
            room: room.to_string(),
            clock: 0,
            payload,
        }
    }

    pub fn join(room: &str, info: &PeerInfo) -> Result<Self, ProtocolError> {
        Ok(Self::new(MessageType::Join, info.peer_id, room, encode_payload(info)?))
    }

    pub fn sync_step1(peer_id: Uuid, room: &str, state_vector: Vec<u8>) -> Self {
        Self::new(MessageType::SyncStep1, peer_id, room, state_vector)
    }

    pub fn sync_step2(peer_id: Uuid, room: &str, diff: Vec<u8>) -> Self {
        Self::new(MessageType::SyncStep2, peer_id, room, diff)
    }

    pub fn update(peer_id: Uuid, room: &str, clock: u64, delta: Vec<u8>) -> Self {
        Self {
            clock,
            ..Self::new(MessageType::Update, peer_id, room, delta)
        }
    }

    pub fn awareness(
        peer_id: Uuid,
        room: &str,
        clock: u64,
        state: &AwarenessState,
    ) -> Result<Self, ProtocolError> {
        Ok(Self {
            clock,
            ..Self::new(MessageType::Awareness, peer_id, room, encode_payload(state)?)
        })
    }

    pub fn leave(peer_id: Uuid, room: &str) -> Self {
        Self::new(MessageType::Leave, peer_id, room, Vec::new())
    }

    pub fn ping(peer_id: Uuid) -> Self {
        Self::new(MessageType::Ping, peer_id, "", Vec::new())
    }

    pub fn pong(peer_id: Uuid) -> Self {
        Self::new(MessageType::Pong, peer_id, "", Vec::new())
    }

    pub fn refused(peer_id: Uuid, room: &str, reason: &str) -> Self {
        Self::new(MessageType::Refused, peer_id, room, reason.as_bytes().to_vec())
    }

    pub fn encode(&self) -> Result<Vec<u8>, ProtocolError> {
        bincode::serde::encode_to_vec(self, bincode::config::standard())
            .map_err(|e| ProtocolError::Serialization(e.to_string()))
    }

    pub fn decode(bytes: &[u8]) -> Result<Self, ProtocolError> {
        let (msg, _) = bincode::serde::decode_from_slice(bytes, bincode::config::standard())
            .map_err(|e| ProtocolError::Deserialization(e.to_string()))?;
        Ok(msg)
    }

    pub fn peer_info(&self) -> Result<PeerInfo, ProtocolError> {
        self.expect_type(MessageType::Join)?;
        decode_payload(&self.payload)
    }

    pub fn awareness_state(&self) -> Result<AwarenessState, ProtocolError> {
        self.expect_type(MessageType::Awareness)?;
        decode_payload(&self.payload)
    }

    pub fn refusal_reason(&self) -> Result<String, ProtocolError> {
        self.expect_type(MessageType::Refused)?;
        Ok(String::from_utf8_lossy(&self.payload).into_owned())
    }

    fn expect_type(&self, expected: MessageType) -> Result<(), ProtocolError> {
        if self.msg_type != expected {
            return Err(ProtocolError::InvalidMessageType {
                expected,
                actual: self.msg_type,
            });
        }
        Ok(())
    }
}

fn encode_payload<T: Serialize>(value: &T) -> Result<Vec<u8>, ProtocolError> {
    bincode::serde::encode_to_vec(value, bincode::config::standard())
        .map_err(|e| ProtocolError::Serialization(e.to_string()))
}

fn decode_payload<T: serde::de::DeserializeOwned>(bytes: &[u8]) -> Result<T, ProtocolError> {
    let (value, _) = bincode::serde::decode_from_slice(bytes, bincode::config::standard())
        .map_err(|e| ProtocolError::Deserialization(e.to_string()))?;
    Ok(value)
}

#[derive(Error, Debug, Clone, PartialEq)]
pub enum ProtocolError {
    #[error("serialization error: {0}")]
    Serialization(String),

    #[error("deserialization error: {0}")]
    Deserialization(String),

    #[error("expected {expected:?} message, got {actual:?}")]
    InvalidMessageType {
        expected: MessageType,
        actual: MessageType,
    },

    #[error("connection closed")]
    ConnectionClosed,
}

#[cfg(test)]
mod tests {
    use super::*;
    use notesync_core::EditingMode;

    #[test]
    fn test_room_naming() {
        assert_eq!(room_name("abc-123"), "note-abc-123");
        assert_eq!(note_id_from_room("note-abc-123"), Some("abc-123"));
        assert_eq!(note_id_from_room("note-"), None);
        assert_eq!(note_id_from_room("other"), None);
    }

    #[test]
    fn test_update_roundtrip() {
        let peer = Uuid::new_v4();
        let msg = SyncMessage::update(peer, "note-1", 42, vec![1, 2, 3, 4, 5]);
        let decoded = SyncMessage::decode(&msg.encode().unwrap()).unwrap();

        assert_eq!(decoded.msg_type, MessageType::Update);
        assert_eq!(decoded.peer_id, peer);
        assert_eq!(decoded.room, "note-1");
        assert_eq!(decoded.clock, 42);
        assert_eq!(decoded.payload, vec![1, 2, 3, 4, 5]);
    }

    #[test]
    fn test_join_carries_peer_info() {
        let info = PeerInfo::new("Alice");
        let msg = SyncMessage::join("note-1", &info).unwrap();
        let decoded = SyncMessage::decode(&msg.encode().unwrap()).unwrap();

        assert_eq!(decoded.peer_id, info.peer_id);
        assert_eq!(decoded.peer_info().unwrap(), info);
    }

    #[test]
    fn test_awareness_payload() {
        let peer = Uuid::new_v4();
        let mut state = AwarenessState::new(peer, "Bob");
        state.selected_frame_id = Some("f1".into());
        state.mode = Some(EditingMode::Ppt);

        let msg = SyncMessage::awareness(peer, "note-1", 3, &state).unwrap();
        let decoded = SyncMessage::decode(&msg.encode().unwrap()).unwrap();
        assert_eq!(decoded.awareness_state().unwrap(), state);
    }

    #[test]
    fn test_refusal_reason() {
        let msg = SyncMessage::refused(Uuid::nil(), "note-1", "room full");
        assert_eq!(msg.refusal_reason().unwrap(), "room full");
    }

    #[test]
    fn test_payload_accessors_check_type() {
        let msg = SyncMessage::ping(Uuid::new_v4());
        assert!(matches!(
            msg.awareness_state(),
            Err(ProtocolError::InvalidMessageType { expected: MessageType::Awareness, .. })
        ));
        assert!(msg.peer_info().is_err());
        assert!(msg.refusal_reason().is_err());
    }

    #[test]
    fn test_decode_invalid_bytes() {
        assert!(SyncMessage::decode(&[0xFF, 0xFE, 0xFD]).is_err());
    }

    #[test]
    fn test_peer_color_is_stable() {
        let id = Uuid::parse_str("550e8400-e29b-41d4-a716-446655440000").unwrap();
        assert_eq!(PeerInfo::with_id(id, "a").color, PeerInfo::with_id(id, "b").color);
        assert!(PeerInfo::with_id(id, "a").color.starts_with('#'));
    }

    #[test]
    fn test_update_overhead_is_small() {
        let msg = SyncMessage::update(Uuid::new_v4(), "note-0123456789", 1, vec![0u8; 50]);
        let encoded = msg.encode().unwrap();
        assert!(encoded.len() < 120, "encoded size {}", encoded.len());
    }

    #[test]
    fn test_message_type_values() {
        assert_eq!(MessageType::Join as u8, 1);
        assert_eq!(MessageType::Update as u8, 4);
        assert_eq!(MessageType::Refused as u8, 9);
    }
}
