//! Binary wire protocol between board clients and the room server.
//!
//! Every WebSocket binary message carries exactly one bincode-encoded frame:
//!
//! ```text
//! client ── ClientFrame ──► server        hello, join/leave, intents, ping
//! client ◄── ServerFrame ── server        welcome, event{seq}, resync, pong
//! ```
//!
//! `ServerFrame::Event` wraps one entry of the event catalog
//! ([`ServerEvent`]) together with the per-room sequence number it was
//! published under.

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::model::{
    ClientOpId, ContainerRef, ItemRecord, Placement, RoomId, SessionId, UserId,
};

/// Display metadata shown next to a participant.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DisplayInfo {
    pub name: String,
    /// RGBA color for avatars and drag indicators
    pub color: [f32; 4],
}

impl DisplayInfo {
    /// Display info with a color derived from the user id (stable per user).
    pub fn for_user(user_id: UserId, name: impl Into<String>) -> Self {
        let hash = user_id.as_u128();
        let r = (hash & 0xFF) as f32 / 255.0;
        let g = ((hash >> 8) & 0xFF) as f32 / 255.0;
        let b = ((hash >> 16) & 0xFF) as f32 / 255.0;
        Self {
            name: name.into(),
            color: [r, g, b, 1.0],
        }
    }
}

/// One participant currently subscribed to a room.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PresenceEntry {
    pub session_id: SessionId,
    pub user_id: UserId,
    pub display: DisplayInfo,
    /// Milliseconds since the Unix epoch
    pub joined_at_ms: u64,
}

/// What a participant is doing, for live indicators.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Activity {
    Typing,
    Moving,
}

/// Who receives an event published into a room.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Audience {
    /// Every subscriber except the originating session.
    Others,
    /// Every subscriber, the origin included.
    All,
    /// Only the originating session.
    Origin,
}

/// The server → client event catalog.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum ServerEvent {
    /// `room:joined`: greeting for the joining session.
    RoomJoined {
        room_id: RoomId,
        presence: Vec<PresenceEntry>,
    },
    /// `presence:joined`
    PresenceJoined { room_id: RoomId, entry: PresenceEntry },
    /// `presence:left`
    PresenceLeft {
        room_id: RoomId,
        session_id: SessionId,
        user_id: UserId,
    },
    /// `item:created`
    ItemCreated { item: ItemRecord },
    /// `item:updated`
    ItemUpdated { item: ItemRecord },
    /// `item:deleted`
    ItemDeleted { item_id: Uuid, container: ContainerRef },
    /// `item:moved`
    ItemMoved {
        item_id: Uuid,
        from: ContainerRef,
        to: ContainerRef,
        new_position: f64,
    },
    /// `collection:rebalanced`
    CollectionRebalanced {
        container: ContainerRef,
        items: Vec<Placement>,
    },
    /// `presence:typing`: ephemeral, never persisted.
    PresenceTyping {
        session_id: SessionId,
        user_id: UserId,
        item_id: Option<Uuid>,
        activity: Activity,
        active: bool,
    },
}

impl ServerEvent {
    /// Stable catalog name of this event.
    pub fn name(&self) -> &'static str {
        match self {
            ServerEvent::RoomJoined { .. } => "room:joined",
            ServerEvent::PresenceJoined { .. } => "presence:joined",
            ServerEvent::PresenceLeft { .. } => "presence:left",
            ServerEvent::ItemCreated { .. } => "item:created",
            ServerEvent::ItemUpdated { .. } => "item:updated",
            ServerEvent::ItemDeleted { .. } => "item:deleted",
            ServerEvent::ItemMoved { .. } => "item:moved",
            ServerEvent::CollectionRebalanced { .. } => "collection:rebalanced",
            ServerEvent::PresenceTyping { .. } => "presence:typing",
        }
    }

    /// Audience this event is published to.
    ///
    /// State changes the origin already applied go to `Others`; rebalances
    /// must be applied identically everywhere and go to `All`.
    pub fn audience(&self) -> Audience {
        match self {
            ServerEvent::RoomJoined { .. } => Audience::Origin,
            ServerEvent::CollectionRebalanced { .. } => Audience::All,
            ServerEvent::PresenceJoined { .. }
            | ServerEvent::PresenceLeft { .. }
            | ServerEvent::ItemCreated { .. }
            | ServerEvent::ItemUpdated { .. }
            | ServerEvent::ItemDeleted { .. }
            | ServerEvent::ItemMoved { .. }
            | ServerEvent::PresenceTyping { .. } => Audience::Others,
        }
    }

    /// Whether this event carries presence rather than board state.
    pub fn is_presence(&self) -> bool {
        matches!(
            self,
            ServerEvent::RoomJoined { .. }
                | ServerEvent::PresenceJoined { .. }
                | ServerEvent::PresenceLeft { .. }
                | ServerEvent::PresenceTyping { .. }
        )
    }
}

/// Client → server frames.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum ClientFrame {
    /// First frame of every connection.
    Hello {
        credential: String,
        display_name: String,
    },
    JoinRoom { room_id: RoomId },
    LeaveRoom { room_id: RoomId },
    MoveItem {
        client_op_id: ClientOpId,
        item_id: Uuid,
        from: ContainerRef,
        to: ContainerRef,
        target_index: u32,
        position: f64,
    },
    CreateItem {
        client_op_id: ClientOpId,
        item: ItemRecord,
    },
    UpdateItem {
        client_op_id: ClientOpId,
        item: ItemRecord,
    },
    DeleteItem {
        client_op_id: ClientOpId,
        item_id: Uuid,
        container: ContainerRef,
    },
    RebalanceCollection {
        client_op_id: ClientOpId,
        container: ContainerRef,
        items: Vec<Placement>,
    },
    Typing {
        item_id: Option<Uuid>,
        activity: Activity,
        active: bool,
    },
    Ping,
}

impl ClientFrame {
    /// Idempotency key of a mutation intent.
    pub fn client_op_id(&self) -> Option<ClientOpId> {
        match self {
            ClientFrame::MoveItem { client_op_id, .. }
            | ClientFrame::CreateItem { client_op_id, .. }
            | ClientFrame::UpdateItem { client_op_id, .. }
            | ClientFrame::DeleteItem { client_op_id, .. }
            | ClientFrame::RebalanceCollection { client_op_id, .. } => Some(*client_op_id),
            _ => None,
        }
    }

    /// Room event relayed for this intent, stamped with the sender's identity.
    ///
    /// Returns `Ok(None)` for frames that are not relayed, and an error for
    /// intents whose payload would corrupt peers' ordering.
    pub fn into_event(
        self,
        session_id: SessionId,
        user_id: UserId,
    ) -> Result<Option<ServerEvent>, ProtocolError> {
        let event = match self {
            ClientFrame::MoveItem {
                item_id,
                from,
                to,
                position,
                ..
            } => {
                if !position.is_finite() {
                    return Err(ProtocolError::InvalidPayload(format!(
                        "non-finite position for item {item_id}"
                    )));
                }
                ServerEvent::ItemMoved {
                    item_id,
                    from,
                    to,
                    new_position: position,
                }
            }
            ClientFrame::CreateItem { item, .. } => {
                check_record(&item)?;
                ServerEvent::ItemCreated { item }
            }
            ClientFrame::UpdateItem { item, .. } => {
                check_record(&item)?;
                ServerEvent::ItemUpdated { item }
            }
            ClientFrame::DeleteItem {
                item_id, container, ..
            } => ServerEvent::ItemDeleted { item_id, container },
            ClientFrame::RebalanceCollection {
                container, items, ..
            } => {
                if items.iter().any(|p| !p.position.is_finite()) {
                    return Err(ProtocolError::InvalidPayload(
                        "non-finite position in rebalance".into(),
                    ));
                }
                ServerEvent::CollectionRebalanced { container, items }
            }
            ClientFrame::Typing {
                item_id,
                activity,
                active,
            } => ServerEvent::PresenceTyping {
                session_id,
                user_id,
                item_id,
                activity,
                active,
            },
            ClientFrame::Hello { .. }
            | ClientFrame::JoinRoom { .. }
            | ClientFrame::LeaveRoom { .. }
            | ClientFrame::Ping => return Ok(None),
        };
        Ok(Some(event))
    }

    pub fn encode(&self) -> Result<Vec<u8>, ProtocolError> {
        encode(self)
    }

    pub fn decode(bytes: &[u8]) -> Result<Self, ProtocolError> {
        decode(bytes)
    }
}

fn check_record(item: &ItemRecord) -> Result<(), ProtocolError> {
    if !item.position.is_finite() {
        return Err(ProtocolError::InvalidPayload(format!(
            "non-finite position for item {}",
            item.id
        )));
    }
    if !item.kind.fits(&item.container) {
        return Err(ProtocolError::InvalidPayload(format!(
            "{:?} {} cannot live in {:?}",
            item.kind, item.id, item.container
        )));
    }
    Ok(())
}

/// Server → client frames.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum ServerFrame {
    /// Handshake accepted.
    Welcome {
        session_id: SessionId,
        user_id: UserId,
    },
    /// Handshake refused; the server closes the socket right after.
    AuthRejected { reason: String },
    /// One room event with its per-room sequence number.
    Event {
        room_id: RoomId,
        seq: u64,
        origin: Option<SessionId>,
        event: ServerEvent,
    },
    /// The session missed events and must refetch the board.
    ResyncRequired { room_id: RoomId },
    /// Command could not be processed; the connection stays open.
    Error { message: String },
    Pong,
}

impl ServerFrame {
    pub fn encode(&self) -> Result<Vec<u8>, ProtocolError> {
        encode(self)
    }

    pub fn decode(bytes: &[u8]) -> Result<Self, ProtocolError> {
        decode(bytes)
    }
}

fn encode<T: Serialize>(value: &T) -> Result<Vec<u8>, ProtocolError> {
    bincode::serde::encode_to_vec(value, bincode::config::standard())
        .map_err(|e| ProtocolError::SerializationError(e.to_string()))
}

fn decode<T: serde::de::DeserializeOwned>(bytes: &[u8]) -> Result<T, ProtocolError> {
    let (value, _) = bincode::serde::decode_from_slice(bytes, bincode::config::standard())
        .map_err(|e| ProtocolError::DeserializationError(e.to_string()))?;
    Ok(value)
}

/// Protocol errors.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum ProtocolError {
    #[error("Serialization error: {0}")]
    SerializationError(String),
    #[error("Deserialization error: {0}")]
    DeserializationError(String),
    #[error("Invalid payload: {0}")]
    InvalidPayload(String),
}
