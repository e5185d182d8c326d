//! Client lifecycle tests against real listeners.

use futures::SinkExt;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tokio::time::timeout;
use tokio_tungstenite::accept_async;
use tokio_tungstenite::tungstenite::Message;

use pulse_client::{ChannelManager, ClientState};
use pulse_protocol::Envelope;
use pulse_server::agent::{ChatAgent, ChatService, EchoAgent};
use pulse_server::app::{AppState, create_router};

const TIMEOUT: Duration = Duration::from_secs(5);

async fn start_pulse_server() -> String {
    let state = AppState::new(|emitter| {
        Arc::new(ChatService::new(Arc::new(EchoAgent::new(emitter)))) as Arc<dyn ChatAgent>
    });
    let router = create_router(state);
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, router).await.unwrap();
    });
    format!("ws://{addr}/ws")
}

async fn wait_for_state(
    rx: &mut tokio::sync::watch::Receiver<ClientState>,
    wanted: ClientState,
) {
    timeout(TIMEOUT, rx.wait_for(|state| *state == wanted))
        .await
        .unwrap_or_else(|_| panic!("never reached state {wanted}"))
        .unwrap();
}

#[tokio::test]
async fn delivers_replies_and_telemetry_in_order() {
    let url = start_pulse_server().await;
    let (handle, mut streams) = ChannelManager::connect(&url, "s1");

    let mut states = handle.state_changes();
    wait_for_state(&mut states, ClientState::Open).await;

    handle.send_message("hi");

    let mut kinds = Vec::new();
    for _ in 0..4 {
        let event = timeout(TIMEOUT, streams.telemetry.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(event.session_id(), "s1");
        kinds.push(event.kind());
    }
    assert_eq!(
        kinds,
        [
            "model_call_started",
            "tool_invoked",
            "tool_completed",
            "model_call_finished",
        ]
    );

    let reply = timeout(TIMEOUT, streams.replies.recv())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(reply.content, "You said: hi");
    assert!(!reply.is_partial);

    handle.close().await;
    wait_for_state(&mut states, ClientState::Closed).await;
}

#[tokio::test]
async fn reconnects_after_abrupt_server_close_and_resumes() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();

    // First accept is dropped on the floor; the second stays up and pushes
    // one telemetry frame for the session.
    tokio::spawn(async move {
        let (stream, _) = listener.accept().await.unwrap();
        let ws = accept_async(stream).await.unwrap();
        drop(ws);

        let (stream, _) = listener.accept().await.unwrap();
        let mut ws = accept_async(stream).await.unwrap();
        let frame = Envelope::ToolInvoked {
            session_id: "s1".into(),
            call_id: "c1".into(),
            tool_name: "fhir_search".into(),
            arguments: serde_json::json!({}),
            at: chrono::Utc::now(),
        }
        .encode()
        .unwrap();
        ws.send(Message::Text(frame.into())).await.unwrap();
        // Hold the connection open until the test finishes.
        futures::future::pending::<()>().await;
    });

    let (handle, mut streams) = ChannelManager::connect(&format!("ws://{addr}/ws"), "s1");
    let mut states = handle.state_changes();

    // The dropped first connection sends us into backoff; the Reconnecting
    // state holds for the full 1s delay, so it cannot be missed.
    wait_for_state(&mut states, ClientState::Reconnecting).await;
    wait_for_state(&mut states, ClientState::Open).await;

    let event = timeout(TIMEOUT, streams.telemetry.recv())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(event.kind(), "tool_invoked");
    assert_eq!(event.session_id(), "s1");
}

#[tokio::test]
async fn send_is_a_noop_while_not_open() {
    // Bind then drop to get a port nothing is listening on.
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    drop(listener);

    let (handle, mut streams) = ChannelManager::connect(&format!("ws://{addr}/ws"), "s1");
    let mut states = handle.state_changes();
    wait_for_state(&mut states, ClientState::Reconnecting).await;

    // Dropped, not delivered, not a panic.
    handle.send_message("hello?");
    assert!(
        timeout(Duration::from_millis(200), streams.replies.recv())
            .await
            .is_err()
    );

    // Explicit close during backoff cancels the pending retry.
    handle.close().await;
    wait_for_state(&mut states, ClientState::Closed).await;
}

#[tokio::test]
async fn frames_for_other_sessions_are_dropped() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();

    tokio::spawn(async move {
        let (stream, _) = listener.accept().await.unwrap();
        let mut ws = accept_async(stream).await.unwrap();
        let stray = Envelope::AssistantReply {
            session_id: "someone-else".into(),
            content: "not yours".into(),
            is_partial: false,
        }
        .encode()
        .unwrap();
        ws.send(Message::Text(stray.into())).await.unwrap();

        let mine = Envelope::AssistantReply {
            session_id: "s1".into(),
            content: "yours".into(),
            is_partial: false,
        }
        .encode()
        .unwrap();
        ws.send(Message::Text(mine.into())).await.unwrap();
        futures::future::pending::<()>().await;
    });

    let (handle, mut streams) = ChannelManager::connect(&format!("ws://{addr}/ws"), "s1");
    let mut states = handle.state_changes();
    wait_for_state(&mut states, ClientState::Open).await;

    let reply = timeout(TIMEOUT, streams.replies.recv())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(reply.content, "yours");
}
