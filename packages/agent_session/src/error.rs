//! Error types and stable error codes for session operations.

use std::time::Duration;

use crate::types::ChannelId;

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum SessionError {
    /// A send was attempted on a channel whose status is not `Connected`.
    #[error("channel {channel} is not connected")]
    ConnectionUnavailable { channel: ChannelId },

    /// No correlated response arrived before the deadline.
    #[error("request {request_id} timed out after {}ms", .after.as_millis())]
    RequestTimeout { request_id: String, after: Duration },

    #[error("malformed message: {0}")]
    MalformedMessage(String),

    #[error("unknown message type: {0}")]
    UnknownMessageType(String),

    /// The channel did not become ready within the readiness window.
    #[error("channel {channel} not ready after {}ms", .waited.as_millis())]
    ConnectionFailed { channel: ChannelId, waited: Duration },

    #[error("transport error: {0}")]
    Transport(String),

    /// The remote side answered a correlated request with an error payload.
    #[error("remote error: {0}")]
    Remote(String),

    #[error("unknown channel: {0}")]
    UnknownChannel(ChannelId),

    #[error("session closed")]
    SessionClosed,
}

impl SessionError {
    pub fn error_code(&self) -> &str {
        match self {
            Self::ConnectionUnavailable { .. } => "connection_unavailable",
            Self::RequestTimeout { .. } => "request_timeout",
            Self::MalformedMessage(_) => "malformed_message",
            Self::UnknownMessageType(_) => "unknown_message_type",
            Self::ConnectionFailed { .. } => "connection_failed",
            Self::Transport(_) => "transport",
            Self::Remote(_) => "remote",
            Self::UnknownChannel(_) => "unknown_channel",
            Self::SessionClosed => "session_closed",
        }
    }

    /// Whether a bounded retry of the send step may succeed.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            Self::ConnectionUnavailable { .. } | Self::Transport(_)
        )
    }
}
