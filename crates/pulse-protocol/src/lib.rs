//! Wire protocol for the Pulse real-time chat channel.
//!
//! Both ends of the channel speak the same closed set of envelope shapes,
//! one JSON object per transport frame, discriminated by a `kind` field.
//! The server pushes assistant replies and operational telemetry; the client
//! sends user messages. Decoders ignore unknown top-level fields but reject
//! unknown kinds.

mod envelope;

pub use envelope::{ChannelState, Envelope, ProtocolError};
