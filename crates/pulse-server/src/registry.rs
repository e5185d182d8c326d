//! Connection registry: session id -> live channel.
//!
//! Holds at most one live channel per session id. A new registration for an
//! already-registered session atomically replaces the old entry; the
//! displaced channel is abandoned, not closed, and its own I/O errors surface
//! independently. The registry is constructed once at process start and
//! passed by reference to everything that needs it; no other component may
//! hold a direct reference to another session's channel.

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use log::{debug, info};
use std::sync::atomic::{AtomicU64, Ordering};
use thiserror::Error;
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;

use pulse_protocol::{Envelope, ProtocolError};

/// Size of the per-connection outbound frame buffer.
pub const CONNECTION_BUFFER_SIZE: usize = 64;

/// Delivery failure. Expected and non-fatal for callers: there is no retry
/// and no buffering of undelivered frames.
#[derive(Debug, Error)]
pub enum SendError {
    #[error("no connection registered for session")]
    NotConnected,

    #[error("connection writer has shut down")]
    ChannelClosed,

    #[error("connection outbound queue is full")]
    Backpressure,

    #[error(transparent)]
    Protocol(#[from] ProtocolError),
}

struct Connection {
    tx: mpsc::Sender<String>,
    serial: u64,
    established_at: DateTime<Utc>,
}

/// Concurrency-safe map of live connections, keyed by session id.
///
/// Lookups clone the outbound sender out of the map before writing, so the
/// map shard lock is never held across I/O and one slow consumer cannot
/// stall registration or sends for other sessions.
pub struct ConnectionRegistry {
    connections: DashMap<String, Connection>,
    next_serial: AtomicU64,
}

impl ConnectionRegistry {
    pub fn new() -> Self {
        Self {
            connections: DashMap::new(),
            next_serial: AtomicU64::new(0),
        }
    }

    /// Register a channel for a session, replacing any existing entry
    /// (last writer wins).
    ///
    /// Returns a serial the caller must keep and pass back to
    /// [`unregister`](Self::unregister); it is what protects a newer
    /// connection from being torn down by a stale one.
    pub fn register(&self, session_id: &str, tx: mpsc::Sender<String>) -> u64 {
        let serial = self.next_serial.fetch_add(1, Ordering::Relaxed) + 1;
        let replaced = self
            .connections
            .insert(
                session_id.to_string(),
                Connection {
                    tx,
                    serial,
                    established_at: Utc::now(),
                },
            )
            .is_some();
        if replaced {
            info!("session {session_id}: connection replaced (serial {serial})");
        } else {
            info!("session {session_id}: connection registered (serial {serial})");
        }
        serial
    }

    /// Remove the entry for a session, but only if it still belongs to the
    /// caller's connection. A no-op when the session is gone or has already
    /// been replaced by a newer connection; never an error.
    pub fn unregister(&self, session_id: &str, serial: u64) {
        let removed = self
            .connections
            .remove_if(session_id, |_, conn| conn.serial == serial)
            .is_some();
        if removed {
            info!("session {session_id}: connection unregistered (serial {serial})");
        } else {
            debug!("session {session_id}: stale unregister ignored (serial {serial})");
        }
    }

    /// Encode an envelope and hand it to the session's writer.
    ///
    /// Non-blocking: the frame is queued on the connection's bounded buffer
    /// with `try_send`. A missing session, a departed writer, or a full
    /// queue all come back as a [`SendError`] the caller is expected to
    /// treat as routine.
    pub fn send(&self, session_id: &str, envelope: &Envelope) -> Result<(), SendError> {
        let frame = envelope.encode()?;
        let tx = match self.connections.get(session_id) {
            Some(conn) => conn.tx.clone(),
            None => return Err(SendError::NotConnected),
        };
        match tx.try_send(frame) {
            Ok(()) => Ok(()),
            Err(TrySendError::Closed(_)) => Err(SendError::ChannelClosed),
            Err(TrySendError::Full(_)) => Err(SendError::Backpressure),
        }
    }

    /// Send one envelope to every live connection, built per session so the
    /// session-id invariant holds. Per-connection failures are skipped, not
    /// propagated; returns the number of connections reached.
    pub fn broadcast<F>(&self, make: F) -> usize
    where
        F: Fn(&str) -> Envelope,
    {
        let targets: Vec<(String, mpsc::Sender<String>)> = self
            .connections
            .iter()
            .map(|entry| (entry.key().clone(), entry.value().tx.clone()))
            .collect();

        let mut reached = 0;
        for (session_id, tx) in targets {
            let envelope = make(&session_id);
            match envelope.encode() {
                Ok(frame) => {
                    if tx.try_send(frame).is_ok() {
                        reached += 1;
                    } else {
                        debug!("session {session_id}: broadcast frame dropped");
                    }
                }
                Err(e) => debug!("session {session_id}: broadcast encode failed: {e}"),
            }
        }
        reached
    }

    /// Whether a session currently has a live channel.
    pub fn is_connected(&self, session_id: &str) -> bool {
        self.connections.contains_key(session_id)
    }

    /// Number of live connections.
    pub fn len(&self) -> usize {
        self.connections.len()
    }

    pub fn is_empty(&self) -> bool {
        self.connections.is_empty()
    }

    /// When the session's current connection was established.
    pub fn established_at(&self, session_id: &str) -> Option<DateTime<Utc>> {
        self.connections
            .get(session_id)
            .map(|conn| conn.established_at)
    }
}

impl Default for ConnectionRegistry {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    fn user_message(session_id: &str) -> Envelope {
        Envelope::UserMessage {
            session_id: session_id.into(),
            content: "hi".into(),
        }
    }

    #[tokio::test]
    async fn send_without_registration_is_not_connected() {
        let registry = ConnectionRegistry::new();
        let err = registry.send("s1", &user_message("s1")).unwrap_err();
        assert!(matches!(err, SendError::NotConnected));
    }

    #[tokio::test]
    async fn send_delivers_encoded_frame() {
        let registry = ConnectionRegistry::new();
        let (tx, mut rx) = mpsc::channel(CONNECTION_BUFFER_SIZE);
        registry.register("s1", tx);

        registry.send("s1", &user_message("s1")).unwrap();
        let frame = rx.recv().await.unwrap();
        assert_eq!(Envelope::decode(&frame).unwrap(), user_message("s1"));
    }

    #[tokio::test]
    async fn established_at_tracks_the_live_connection() {
        let registry = ConnectionRegistry::new();
        assert!(registry.established_at("s1").is_none());

        let (old_tx, _old_rx) = mpsc::channel(CONNECTION_BUFFER_SIZE);
        registry.register("s1", old_tx);
        let first = registry.established_at("s1").unwrap();

        let (new_tx, _new_rx) = mpsc::channel(CONNECTION_BUFFER_SIZE);
        let serial = registry.register("s1", new_tx);
        assert!(registry.established_at("s1").unwrap() >= first);

        registry.unregister("s1", serial);
        assert!(registry.established_at("s1").is_none());
    }

    #[tokio::test]
    async fn last_concurrent_register_wins() {
        let registry = Arc::new(ConnectionRegistry::new());

        let mut handles = Vec::new();
        for _ in 0..16 {
            let registry = registry.clone();
            handles.push(tokio::spawn(async move {
                let (tx, rx) = mpsc::channel(CONNECTION_BUFFER_SIZE);
                registry.register("s1", tx);
                rx
            }));
        }
        let mut receivers = Vec::new();
        for handle in handles {
            receivers.push(handle.await.unwrap());
        }

        // Exactly one entry survives, and it is one of the registered
        // channels: the frame lands on exactly one receiver.
        assert_eq!(registry.len(), 1);
        registry.send("s1", &user_message("s1")).unwrap();
        let delivered = receivers
            .iter_mut()
            .filter_map(|rx| rx.try_recv().ok())
            .count();
        assert_eq!(delivered, 1);
    }

    #[tokio::test]
    async fn stale_unregister_never_deletes_newer_entry() {
        let registry = ConnectionRegistry::new();
        let (old_tx, _old_rx) = mpsc::channel(CONNECTION_BUFFER_SIZE);
        let old_serial = registry.register("s1", old_tx);

        let (new_tx, mut new_rx) = mpsc::channel(CONNECTION_BUFFER_SIZE);
        let new_serial = registry.register("s1", new_tx);

        // The old connection unregisters late; the newer entry must survive.
        registry.unregister("s1", old_serial);
        assert!(registry.is_connected("s1"));

        registry.send("s1", &user_message("s1")).unwrap();
        assert!(new_rx.try_recv().is_ok());

        // Unregister is idempotent.
        registry.unregister("s1", new_serial);
        registry.unregister("s1", new_serial);
        assert!(!registry.is_connected("s1"));
    }

    #[tokio::test]
    async fn broadcast_reaches_every_session_with_its_own_id() {
        let registry = ConnectionRegistry::new();
        let (tx1, mut rx1) = mpsc::channel(CONNECTION_BUFFER_SIZE);
        let (tx2, mut rx2) = mpsc::channel(CONNECTION_BUFFER_SIZE);
        registry.register("s1", tx1);
        registry.register("s2", tx2);

        let reached = registry.broadcast(|session_id| Envelope::ChannelStatus {
            session_id: session_id.to_string(),
            state: pulse_protocol::ChannelState::Disconnected,
        });
        assert_eq!(reached, 2);

        let frame = Envelope::decode(&rx1.recv().await.unwrap()).unwrap();
        assert_eq!(frame.session_id(), "s1");
        let frame = Envelope::decode(&rx2.recv().await.unwrap()).unwrap();
        assert_eq!(frame.session_id(), "s2");
    }

    #[tokio::test]
    async fn send_to_departed_writer_reports_closed() {
        let registry = ConnectionRegistry::new();
        let (tx, rx) = mpsc::channel(CONNECTION_BUFFER_SIZE);
        registry.register("s1", tx);
        drop(rx);

        let err = registry.send("s1", &user_message("s1")).unwrap_err();
        assert!(matches!(err, SendError::ChannelClosed));
    }

    #[tokio::test]
    async fn full_queue_reports_backpressure_without_blocking() {
        let registry = ConnectionRegistry::new();
        let (tx, _rx) = mpsc::channel(1);
        registry.register("s1", tx);

        registry.send("s1", &user_message("s1")).unwrap();
        let err = registry.send("s1", &user_message("s1")).unwrap_err();
        assert!(matches!(err, SendError::Backpressure));
    }
}
