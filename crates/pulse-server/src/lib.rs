//! Pulse server: per-session WebSocket channels for chat replies and
//! operational telemetry.
//!
//! The only shared mutable state in the core is the [`ConnectionRegistry`];
//! every component reaches a session's channel through it. The
//! [`TelemetryEmitter`] pushes tool/model events through the registry without
//! ever blocking or failing the agent path that produced them.

pub mod agent;
pub mod app;
pub mod config;
pub mod error;
pub mod handler;
pub mod registry;
pub mod telemetry;

pub use agent::{ChatAgent, ChatService, EchoAgent};
pub use app::{AppState, create_router};
pub use registry::{ConnectionRegistry, SendError};
pub use telemetry::TelemetryEmitter;
