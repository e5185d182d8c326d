//! Seam to the reply-generation path.
//!
//! The real agent (LLM + FHIR orchestration) lives outside this crate; the
//! endpoint handler only needs `(session_id, content) -> content` and expects
//! the implementation to drive the [`TelemetryEmitter`] during its own
//! execution.

use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::Mutex;

use crate::telemetry::TelemetryEmitter;

/// Produces the assistant reply for a user message.
#[async_trait]
pub trait ChatAgent: Send + Sync {
    async fn respond(&self, session_id: &str, content: &str) -> anyhow::Result<String>;
}

/// Keeps per-session conversation history and delegates to an inner agent.
///
/// History is prompt construction, not channel state: it lives here, next to
/// the seam, and never touches the registry.
pub struct ChatService {
    inner: Arc<dyn ChatAgent>,
    sessions: Mutex<HashMap<String, Vec<String>>>,
}

impl ChatService {
    pub fn new(inner: Arc<dyn ChatAgent>) -> Self {
        Self {
            inner,
            sessions: Mutex::new(HashMap::new()),
        }
    }
}

#[async_trait]
impl ChatAgent for ChatService {
    async fn respond(&self, session_id: &str, content: &str) -> anyhow::Result<String> {
        let prompt = {
            let mut sessions = self.sessions.lock().await;
            let history = sessions.entry(session_id.to_string()).or_default();
            history.push(format!("User: {content}"));
            let mut prompt = history.join("\n");
            prompt.push_str("\nAssistant:");
            prompt
        };

        let output = self.inner.respond(session_id, &prompt).await?;

        let mut sessions = self.sessions.lock().await;
        if let Some(history) = sessions.get_mut(session_id) {
            history.push(format!("Assistant: {output}"));
        }
        Ok(output)
    }
}

/// Stand-in agent used by the binary and tests: echoes the last user line
/// and reports a scripted tool/model trace through the emitter, the way the
/// real agent path does.
pub struct EchoAgent {
    emitter: Arc<TelemetryEmitter>,
}

impl EchoAgent {
    pub fn new(emitter: Arc<TelemetryEmitter>) -> Self {
        Self { emitter }
    }
}

#[async_trait]
impl ChatAgent for EchoAgent {
    async fn respond(&self, session_id: &str, content: &str) -> anyhow::Result<String> {
        let call_id = uuid::Uuid::new_v4().to_string();
        let started = Instant::now();

        self.emitter.emit_model_call_started(session_id, "echo-1");
        self.emitter.emit_tool_invoked(
            session_id,
            &call_id,
            "echo",
            serde_json::json!({ "length": content.len() }),
        );

        let last_line = content
            .lines()
            .rev()
            .find_map(|line| line.strip_prefix("User: "))
            .unwrap_or(content);
        let output = format!("You said: {last_line}");

        let elapsed_ms = started.elapsed().as_millis() as u64;
        self.emitter
            .emit_tool_completed(session_id, &call_id, "echo", &output, elapsed_ms);
        self.emitter.emit_model_call_finished(
            session_id,
            "echo-1",
            Some(content.len() as u64),
            Some(output.len() as u64),
            Some((content.len() + output.len()) as u64),
            Some(elapsed_ms),
        );

        Ok(output)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registry::ConnectionRegistry;

    struct FixedAgent;

    #[async_trait]
    impl ChatAgent for FixedAgent {
        async fn respond(&self, _session_id: &str, _content: &str) -> anyhow::Result<String> {
            Ok("fine".into())
        }
    }

    #[tokio::test]
    async fn chat_service_accumulates_history_per_session() {
        struct PromptCapture(Mutex<Vec<String>>);

        #[async_trait]
        impl ChatAgent for PromptCapture {
            async fn respond(&self, _session_id: &str, content: &str) -> anyhow::Result<String> {
                self.0.lock().await.push(content.to_string());
                Ok("ack".into())
            }
        }

        let capture = Arc::new(PromptCapture(Mutex::new(Vec::new())));
        let service = ChatService::new(capture.clone());

        service.respond("s1", "first").await.unwrap();
        service.respond("s1", "second").await.unwrap();
        service.respond("s2", "other").await.unwrap();

        let prompts = capture.0.lock().await;
        assert_eq!(prompts[0], "User: first\nAssistant:");
        assert_eq!(
            prompts[1],
            "User: first\nAssistant: ack\nUser: second\nAssistant:"
        );
        // A different session starts a fresh history.
        assert_eq!(prompts[2], "User: other\nAssistant:");
    }

    #[tokio::test]
    async fn chat_service_delegates_reply() {
        let service = ChatService::new(Arc::new(FixedAgent));
        assert_eq!(service.respond("s1", "hi").await.unwrap(), "fine");
    }

    #[tokio::test]
    async fn echo_agent_replies_from_last_user_line() {
        let registry = Arc::new(ConnectionRegistry::new());
        let agent = EchoAgent::new(Arc::new(TelemetryEmitter::new(registry)));

        let output = agent
            .respond("s1", "User: one\nAssistant: You said: one\nUser: two\nAssistant:")
            .await
            .unwrap();
        assert_eq!(output, "You said: two");
    }
}
