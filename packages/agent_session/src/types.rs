//! Wire and domain types shared by every session component.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::warn;

/// Identifier of a channel. Each channel is bound to one remote agent/workflow,
/// and the id doubles as the address used for outbound sends.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ChannelId(String);

impl ChannelId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for ChannelId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for ChannelId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

impl From<String> for ChannelId {
    fn from(s: String) -> Self {
        Self(s)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChannelStatus {
    Connecting,
    Connected,
    Disconnected,
    Error,
}

/// Snapshot of one channel's connection state.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChannelConnectionState {
    pub channel: ChannelId,
    pub status: ChannelStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_error: Option<String>,
    pub last_activity: DateTime<Utc>,
}

/// Emitted on every channel status transition.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConnectionEvent {
    pub channel: ChannelId,
    pub status: ChannelStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    pub at: DateTime<Utc>,
}

/// Direction as it appears on the wire: legacy numeric codes or string labels.
///
/// `Other` absorbs anything else so that decoding a chat frame never fails
/// because of its direction field.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum DirectionWire {
    Code(i64),
    /// Some producers serialize the code as a JSON float, e.g. `1.0`.
    Float(f64),
    Label(String),
    Other(Value),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Direction {
    Incoming,
    Outgoing,
    Handover,
}

impl Direction {
    /// Total conversion from the wire encoding. Unrecognized values log a
    /// warning and map to `Outgoing`.
    pub fn from_wire(wire: Option<&DirectionWire>) -> Self {
        let mapped = match wire {
            Some(DirectionWire::Code(0)) => Some(Direction::Incoming),
            Some(DirectionWire::Code(1)) => Some(Direction::Outgoing),
            Some(DirectionWire::Code(2)) => Some(Direction::Handover),
            Some(DirectionWire::Float(code)) if code.fract() == 0.0 => match *code as i64 {
                0 => Some(Direction::Incoming),
                1 => Some(Direction::Outgoing),
                2 => Some(Direction::Handover),
                _ => None,
            },
            Some(DirectionWire::Label(label)) => match label.to_ascii_lowercase().as_str() {
                "incoming" => Some(Direction::Incoming),
                "outgoing" => Some(Direction::Outgoing),
                "handover" => Some(Direction::Handover),
                _ => None,
            },
            _ => None,
        };

        mapped.unwrap_or_else(|| {
            warn!(direction = ?wire, "unrecognized message direction, defaulting to outgoing");
            Direction::Outgoing
        })
    }
}

/// `createdAt` as sent by producers: RFC 3339 text or epoch milliseconds.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum WireTimestamp {
    Millis(i64),
    Text(String),
    Other(Value),
}

impl WireTimestamp {
    pub fn to_datetime(&self) -> Option<DateTime<Utc>> {
        match self {
            WireTimestamp::Millis(ms) => DateTime::from_timestamp_millis(*ms),
            WireTimestamp::Text(text) => DateTime::parse_from_rfc3339(text)
                .ok()
                .map(|dt| dt.with_timezone(&Utc)),
            WireTimestamp::Other(_) => None,
        }
    }
}

/// A chat message exactly as the transport delivered it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RawMessage {
    #[serde(default)]
    pub content: String,
    #[serde(default)]
    pub direction: Option<DirectionWire>,
    #[serde(default)]
    pub created_at: Option<WireTimestamp>,
    #[serde(default)]
    pub workflow_id: Option<String>,
    #[serde(default)]
    pub thread_id: Option<String>,
    #[serde(default)]
    pub participant_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub metadata: Option<Value>,
}

impl RawMessage {
    pub fn created_at(&self) -> Option<DateTime<Utc>> {
        self.created_at.as_ref().and_then(WireTimestamp::to_datetime)
    }
}

/// A chat message after direction canonicalization, stored in channel history.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProcessedChatMessage {
    pub id: String,
    pub content: String,
    pub direction: Direction,
    pub channel: ChannelId,
    pub timestamp: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub workflow_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub thread_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub participant_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub metadata: Option<Value>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum SystemMessageKind {
    UiUpdate,
    StateChange,
    Data,
    Error,
    Info,
    Metadata,
    EntityUpdate,
}

/// Untyped system event for blanket observers of the event stream.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SystemMessage {
    #[serde(rename = "type")]
    pub kind: SystemMessageKind,
    pub channel: ChannelId,
    pub payload: Value,
    pub timestamp: DateTime<Utc>,
}

/// Typed application event routed by `MetadataRouter`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MetadataMessage {
    pub message_type: String,
    pub channel: ChannelId,
    pub data: Value,
    pub timestamp: DateTime<Utc>,
}

/// Everything a session publishes on its event stream.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum SessionEvent {
    Chat(ProcessedChatMessage),
    System(SystemMessage),
    ThreadUpdated { channel: ChannelId, thread_id: String },
    HistoryRebuilt { channel: ChannelId, count: usize },
    Connection(ConnectionEvent),
}
