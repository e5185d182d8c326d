//! Client side of the Pulse channel.
//!
//! [`ChannelManager::connect`] opens a per-session WebSocket and keeps it
//! alive across transport failures with bounded exponential backoff. Inbound
//! envelopes are demultiplexed into typed streams (replies, telemetry,
//! errors); the connection lifecycle is observable through a watch channel.

mod manager;
mod state;

pub use manager::{ChannelFault, ChannelHandle, ChannelManager, ChannelStreams, Reply};
pub use state::{
    Action, ChannelEvent, ClientState, INITIAL_BACKOFF, MAX_BACKOFF, MAX_RECONNECT_ATTEMPTS,
    Reconnector,
};
