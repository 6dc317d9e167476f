// banter-protocol: Hub wire types and identifiers.
//
// Inbound client frames and outbound broadcast frames share a flat
// `{event, room, data}` shape; the `event` string discriminates handling.
// Room names are `<kind>:<snowflake>` where kind is "server" or "direct".

use serde::{Deserialize, Serialize};
use serde_json::value::RawValue;

pub mod snowflake;

pub use snowflake::{SnowflakeGenerator, SnowflakeId};

// ---------------------------------------------------------------------------
// Event taxonomy
// ---------------------------------------------------------------------------

/// All event kinds carried in the `event` field of a frame.
///
/// The last dot-segment is the action. `room.leave` and the `*.update` /
/// `*.delete` kinds are enumerated for wire compatibility but are reserved:
/// the router does not dispatch them. Unrecognized strings deserialize to
/// [`EventType::Unknown`] so a frame with a novel event is still well-formed
/// and can be logged rather than rejected as malformed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub enum EventType {
    // Subscribe events
    RoomJoin,
    RoomJoined,
    RoomLeave,
    RoomTyping,
    // Channel events
    ChannelMessageAdd,
    ChannelMessageUpdate,
    ChannelMessageDelete,
    /// Durable-log-only fan-out stream for channel messages.
    BroadcastChannelMessageAdd,
    // Direct-message events
    DirectMessageAdd,
    DirectMessageUpdate,
    DirectMessageDelete,
    /// Any event string this build does not recognize.
    Unknown,
}

impl EventType {
    /// Wire string for this event. Also the durable-log topic name for the
    /// events that cross the log.
    pub fn as_str(self) -> &'static str {
        match self {
            EventType::RoomJoin => "room.join",
            EventType::RoomJoined => "room.joined",
            EventType::RoomLeave => "room.leave",
            EventType::RoomTyping => "room.typing",
            EventType::ChannelMessageAdd => "channel-message.add",
            EventType::ChannelMessageUpdate => "channel-message.update",
            EventType::ChannelMessageDelete => "channel-message.delete",
            EventType::BroadcastChannelMessageAdd => "broadcast.channel-message.add",
            EventType::DirectMessageAdd => "direct-message.add",
            EventType::DirectMessageUpdate => "direct-message.update",
            EventType::DirectMessageDelete => "direct-message.delete",
            EventType::Unknown => "unknown",
        }
    }
}

impl std::fmt::Display for EventType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl From<String> for EventType {
    fn from(s: String) -> Self {
        match s.as_str() {
            "room.join" => EventType::RoomJoin,
            "room.joined" => EventType::RoomJoined,
            "room.leave" => EventType::RoomLeave,
            "room.typing" => EventType::RoomTyping,
            "channel-message.add" => EventType::ChannelMessageAdd,
            "channel-message.update" => EventType::ChannelMessageUpdate,
            "channel-message.delete" => EventType::ChannelMessageDelete,
            "broadcast.channel-message.add" => EventType::BroadcastChannelMessageAdd,
            "direct-message.add" => EventType::DirectMessageAdd,
            "direct-message.update" => EventType::DirectMessageUpdate,
            "direct-message.delete" => EventType::DirectMessageDelete,
            _ => EventType::Unknown,
        }
    }
}

impl From<EventType> for String {
    fn from(e: EventType) -> Self {
        e.as_str().to_owned()
    }
}

// ---------------------------------------------------------------------------
// Room names
// ---------------------------------------------------------------------------

/// The two room kinds a client may subscribe to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RoomKind {
    /// A server channel audience.
    Server,
    /// A two-party DM conversation.
    Direct,
}

impl RoomKind {
    pub fn as_str(self) -> &'static str {
        match self {
            RoomKind::Server => "server",
            RoomKind::Direct => "direct",
        }
    }
}

impl std::fmt::Display for RoomKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Error returned when a room name fails validation.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum RoomNameError {
    #[error("room name must be `<kind>:<id>`")]
    MissingSeparator,
    #[error("room kind `{0}` is not allowed")]
    KindNotAllowed(String),
    #[error("room id is not a valid snowflake")]
    InvalidId,
}

/// A validated room name: `<kind>:<snowflake>`.
///
/// The raw string form remains the hub's room-table key; `RoomName` exists
/// so subscribe validation and membership dispatch parse it exactly once.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct RoomName {
    pub kind: RoomKind,
    pub id: SnowflakeId,
}

impl std::str::FromStr for RoomName {
    type Err = RoomNameError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (kind, id) = s.split_once(':').ok_or(RoomNameError::MissingSeparator)?;
        let kind = match kind {
            "server" => RoomKind::Server,
            "direct" => RoomKind::Direct,
            other => return Err(RoomNameError::KindNotAllowed(other.to_owned())),
        };
        let id = id.parse::<SnowflakeId>().map_err(|_| RoomNameError::InvalidId)?;
        Ok(RoomName { kind, id })
    }
}

impl std::fmt::Display for RoomName {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}:{}", self.kind, self.id)
    }
}

// ---------------------------------------------------------------------------
// Frames
// ---------------------------------------------------------------------------

/// An inbound client frame.
///
/// `data` stays opaque (`RawValue`) end-to-end: the hub never re-serializes
/// a payload it merely forwards.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SocketFrame {
    pub event: EventType,
    #[serde(default)]
    pub room: String,
    #[serde(default)]
    pub data: Option<Box<RawValue>>,
}

/// An outbound frame, either delivered alone or as an element of a batch
/// array. `action` is reserved; it serializes as `null` when unset.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BroadcastFrame {
    pub event: EventType,
    pub room: String,
    pub data: Option<Box<RawValue>>,
    pub action: Option<String>,
}

/// Structured reply pushed to a client whose frame was rate-limited.
///
/// `retry_after` and `reset` are whole seconds.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RateLimitNotice {
    pub event: String,
    pub error: String,
    pub retry_after: u64,
    pub reset: u64,
    pub limit: u32,
}

impl RateLimitNotice {
    pub fn new(retry_after: u64, reset: u64, limit: u32) -> Self {
        RateLimitNotice {
            event: "rate_limit".to_owned(),
            error: "Too many messages. Slow down.".to_owned(),
            retry_after,
            reset,
            limit,
        }
    }
}

// ---------------------------------------------------------------------------
// Typing
// ---------------------------------------------------------------------------

/// One typer entry in a coalesced typing broadcast.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Typer {
    pub id: SnowflakeId,
    pub name: String,
}

/// Payload of a coalesced `room.typing` broadcast.
///
/// `users` is truncated to the tracked-typer cap; `total` counts every
/// distinct typing event coalesced into this flush.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TypingPayload {
    pub users: Vec<Typer>,
    pub total: u64,
}

// ---------------------------------------------------------------------------
// Direct messages
// ---------------------------------------------------------------------------

/// A message in a DM conversation, as carried on the wire.
///
/// The client sends `content`/`fileUrl`/`conversationID`; the hub stamps
/// `id` and `userID` before persisting and broadcasting. Timestamps are
/// owned by the persistence collaborator.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DirectMessage {
    #[serde(default)]
    pub id: SnowflakeId,
    pub content: String,
    #[serde(default, rename = "fileUrl", skip_serializing_if = "Option::is_none")]
    pub file_url: Option<String>,
    #[serde(default, rename = "userID")]
    pub user_id: SnowflakeId,
    #[serde(rename = "conversationID")]
    pub conversation_id: SnowflakeId,
}

/// A user profile as resolved by the user directory, for typing broadcasts.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UserProfile {
    pub id: SnowflakeId,
    pub name: String,
}
