//! Fire-and-forget telemetry emission.
//!
//! The emitter mirrors agent activity (tool calls, model calls) onto the
//! session's channel in real time. It exists alongside the batch trace
//! export pipeline and does not replace it; the two report the same logical
//! events on different timescales, correlated by session id.

use chrono::Utc;
use log::warn;
use serde_json::Value;
use std::sync::Arc;

use pulse_protocol::Envelope;

use crate::registry::ConnectionRegistry;

/// Pushes operational events onto a session's channel.
///
/// Every emit method is fire-and-forget: delivery failures are logged and
/// swallowed, and the underlying registry send is non-blocking, so the agent
/// path being reported on is never delayed or failed by a slow or absent
/// consumer.
pub struct TelemetryEmitter {
    registry: Arc<ConnectionRegistry>,
}

impl TelemetryEmitter {
    pub fn new(registry: Arc<ConnectionRegistry>) -> Self {
        Self { registry }
    }

    pub fn emit_tool_invoked(
        &self,
        session_id: &str,
        call_id: &str,
        tool_name: &str,
        arguments: Value,
    ) {
        self.emit(Envelope::ToolInvoked {
            session_id: session_id.to_string(),
            call_id: call_id.to_string(),
            tool_name: tool_name.to_string(),
            arguments,
            at: Utc::now(),
        });
    }

    pub fn emit_tool_completed(
        &self,
        session_id: &str,
        call_id: &str,
        tool_name: &str,
        result: &str,
        duration_ms: u64,
    ) {
        self.emit(Envelope::ToolCompleted {
            session_id: session_id.to_string(),
            call_id: call_id.to_string(),
            tool_name: tool_name.to_string(),
            result: result.to_string(),
            duration_ms,
            at: Utc::now(),
        });
    }

    pub fn emit_model_call_started(&self, session_id: &str, model: &str) {
        self.emit(Envelope::ModelCallStarted {
            session_id: session_id.to_string(),
            model: model.to_string(),
            prompt_tokens: None,
            completion_tokens: None,
            total_tokens: None,
            duration_ms: None,
            at: Utc::now(),
        });
    }

    pub fn emit_model_call_finished(
        &self,
        session_id: &str,
        model: &str,
        prompt_tokens: Option<u64>,
        completion_tokens: Option<u64>,
        total_tokens: Option<u64>,
        duration_ms: Option<u64>,
    ) {
        self.emit(Envelope::ModelCallFinished {
            session_id: session_id.to_string(),
            model: model.to_string(),
            prompt_tokens,
            completion_tokens,
            total_tokens,
            duration_ms,
            at: Utc::now(),
        });
    }

    fn emit(&self, envelope: Envelope) {
        if let Err(e) = self.registry.send(envelope.session_id(), &envelope) {
            warn!(
                "telemetry emit dropped: kind={} session={}: {e}",
                envelope.kind(),
                envelope.session_id()
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registry::CONNECTION_BUFFER_SIZE;
    use std::time::Instant;
    use tokio::sync::mpsc;

    #[tokio::test]
    async fn emit_without_connection_returns_quickly_and_never_raises() {
        let emitter = TelemetryEmitter::new(Arc::new(ConnectionRegistry::new()));

        let started = Instant::now();
        emitter.emit_tool_invoked("ghost", "c1", "fhir_search", serde_json::json!({}));
        emitter.emit_tool_completed("ghost", "c1", "fhir_search", "ok", 5);
        emitter.emit_model_call_started("ghost", "gpt-4o");
        emitter.emit_model_call_finished("ghost", "gpt-4o", Some(1), Some(2), Some(3), Some(4));
        assert!(started.elapsed().as_millis() < 50);
    }

    #[tokio::test]
    async fn emitted_events_arrive_on_the_session_channel() {
        let registry = Arc::new(ConnectionRegistry::new());
        let (tx, mut rx) = mpsc::channel(CONNECTION_BUFFER_SIZE);
        registry.register("s1", tx);

        let emitter = TelemetryEmitter::new(registry);
        emitter.emit_tool_invoked("s1", "c1", "fhir_search", serde_json::json!({"q": 1}));
        emitter.emit_tool_completed("s1", "c1", "fhir_search", "done", 12);

        let first = Envelope::decode(&rx.recv().await.unwrap()).unwrap();
        let second = Envelope::decode(&rx.recv().await.unwrap()).unwrap();
        assert_eq!(first.kind(), "tool_invoked");
        assert_eq!(second.kind(), "tool_completed");
        assert_eq!(first.session_id(), "s1");
    }
}
