//! Envelope types shared by server and client.
//!
//! Every envelope carries the session id of the connection it traveled on.
//! Consumers must not trust an envelope whose session id disagrees with the
//! channel it arrived on. Envelopes are immutable values.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

/// Error raised by envelope encoding and decoding.
///
/// A `Malformed` error is recoverable: the receiving end answers with a
/// `channel_error` envelope and keeps the connection open.
#[derive(Debug, Error)]
pub enum ProtocolError {
    #[error("failed to encode envelope: {0}")]
    Encode(#[source] serde_json::Error),

    #[error("malformed frame: {0}")]
    Malformed(#[source] serde_json::Error),
}

/// A single typed unit of communication over the channel.
///
/// Timestamps (`at`) travel as ISO-8601 strings, durations as integer
/// milliseconds. Token counts are omitted from the wire when absent.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Envelope {
    // ========== Client -> Server ==========
    /// A user's chat message.
    UserMessage { session_id: String, content: String },

    // ========== Server -> Client ==========
    /// The assistant's reply to a user message.
    AssistantReply {
        session_id: String,
        content: String,
        #[serde(default)]
        is_partial: bool,
    },

    /// A tool invocation started inside the agent.
    ToolInvoked {
        session_id: String,
        call_id: String,
        tool_name: String,
        arguments: Value,
        at: DateTime<Utc>,
    },

    /// A tool invocation finished.
    ToolCompleted {
        session_id: String,
        call_id: String,
        tool_name: String,
        result: String,
        duration_ms: u64,
        at: DateTime<Utc>,
    },

    /// A model call was dispatched.
    ModelCallStarted {
        session_id: String,
        model: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        prompt_tokens: Option<u64>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        completion_tokens: Option<u64>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        total_tokens: Option<u64>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        duration_ms: Option<u64>,
        at: DateTime<Utc>,
    },

    /// A model call returned.
    ModelCallFinished {
        session_id: String,
        model: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        prompt_tokens: Option<u64>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        completion_tokens: Option<u64>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        total_tokens: Option<u64>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        duration_ms: Option<u64>,
        at: DateTime<Utc>,
    },

    /// A recoverable error on the channel (bad frame, agent failure).
    ChannelError { session_id: String, message: String },

    /// Informational connection-state notice. Clients derive their own
    /// state locally; this never drives client transitions.
    ChannelStatus {
        session_id: String,
        state: ChannelState,
    },
}

impl Envelope {
    /// Encode as a single JSON frame.
    pub fn encode(&self) -> Result<String, ProtocolError> {
        serde_json::to_string(self).map_err(ProtocolError::Encode)
    }

    /// Decode a single JSON frame.
    ///
    /// Unknown `kind` values and missing required fields are rejected with
    /// `ProtocolError::Malformed`; unknown top-level fields are ignored.
    pub fn decode(frame: &str) -> Result<Self, ProtocolError> {
        serde_json::from_str(frame).map_err(ProtocolError::Malformed)
    }

    /// The session id this envelope is bound to.
    pub fn session_id(&self) -> &str {
        match self {
            Self::UserMessage { session_id, .. }
            | Self::AssistantReply { session_id, .. }
            | Self::ToolInvoked { session_id, .. }
            | Self::ToolCompleted { session_id, .. }
            | Self::ModelCallStarted { session_id, .. }
            | Self::ModelCallFinished { session_id, .. }
            | Self::ChannelError { session_id, .. }
            | Self::ChannelStatus { session_id, .. } => session_id,
        }
    }

    /// Wire name of the discriminant, for logging.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::UserMessage { .. } => "user_message",
            Self::AssistantReply { .. } => "assistant_reply",
            Self::ToolInvoked { .. } => "tool_invoked",
            Self::ToolCompleted { .. } => "tool_completed",
            Self::ModelCallStarted { .. } => "model_call_started",
            Self::ModelCallFinished { .. } => "model_call_finished",
            Self::ChannelError { .. } => "channel_error",
            Self::ChannelStatus { .. } => "channel_status",
        }
    }

    /// Whether this envelope is an operational telemetry event.
    pub fn is_telemetry(&self) -> bool {
        matches!(
            self,
            Self::ToolInvoked { .. }
                | Self::ToolCompleted { .. }
                | Self::ModelCallStarted { .. }
                | Self::ModelCallFinished { .. }
        )
    }
}

/// Connection state as reported in `channel_status` envelopes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChannelState {
    Connected,
    Disconnected,
    Reconnecting,
}

impl std::fmt::Display for ChannelState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ChannelState::Connected => write!(f, "connected"),
            ChannelState::Disconnected => write!(f, "disconnected"),
            ChannelState::Reconnecting => write!(f, "reconnecting"),
        }
    }
}
